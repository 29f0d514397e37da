//! Server configuration: key=value lines, `#` comments.
//!
//! Unknown keys are logged and ignored so a newer config file still loads on
//! an older server; malformed lines are skipped the same way.

use log::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub server_name: String,
    pub max_players: usize,
    pub join_code: String,
    pub code_only: bool,
    pub age_restricted: bool,
    pub spawn_fish: bool,
    pub spawn_metal: bool,
    pub spawn_rain: bool,
    pub spawn_portals: bool,
    pub rain_spawn_multiplier: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "driftline server".to_string(),
            max_players: 12,
            join_code: String::new(),
            code_only: false,
            age_restricted: false,
            spawn_fish: true,
            spawn_metal: true,
            spawn_rain: true,
            spawn_portals: true,
            rain_spawn_multiplier: 1.0,
        }
    }
}

impl ServerConfig {
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("config line {} is not key=value, skipping", line_no + 1);
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "server_name" => config.server_name = value.to_string(),
                "max_players" => match value.parse() {
                    Ok(n) => config.max_players = n,
                    Err(_) => warn!("config line {}: bad max_players '{}'", line_no + 1, value),
                },
                "join_code" => config.join_code = value.to_string(),
                "code_only" => config.code_only = parse_bool(value, key, line_no),
                "age_restricted" => config.age_restricted = parse_bool(value, key, line_no),
                "spawn_fish" => config.spawn_fish = parse_bool(value, key, line_no),
                "spawn_metal" => config.spawn_metal = parse_bool(value, key, line_no),
                "spawn_rain" => config.spawn_rain = parse_bool(value, key, line_no),
                "spawn_portals" => config.spawn_portals = parse_bool(value, key, line_no),
                "rain_spawn_multiplier" => match value.parse() {
                    Ok(m) => config.rain_spawn_multiplier = m,
                    Err(_) => warn!(
                        "config line {}: bad rain_spawn_multiplier '{}'",
                        line_no + 1,
                        value
                    ),
                },
                other => warn!("config line {}: unknown key '{}'", line_no + 1, other),
            }
        }
        config
    }
}

fn parse_bool(value: &str, key: &str, line_no: usize) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => true,
        "false" | "no" | "0" | "off" => false,
        other => {
            warn!(
                "config line {}: '{}' is not a boolean for {}, using false",
                line_no + 1,
                other,
                key
            );
            false
        }
    }
}
