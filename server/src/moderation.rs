//! Ban and admin rosters.
//!
//! Both are flat newline-separated peer-identifier files. The ban file is
//! append-only: banning a peer at runtime writes it straight through so the
//! ban survives a restart.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{info, warn};

use shared::PeerId;

pub struct Moderation {
    bans: HashSet<String>,
    admins: HashSet<String>,
    ban_path: Option<PathBuf>,
}

impl Moderation {
    /// Empty rosters with no backing file; bans made here stay in memory.
    pub fn in_memory() -> Self {
        Self {
            bans: HashSet::new(),
            admins: HashSet::new(),
            ban_path: None,
        }
    }

    /// Loads both rosters. A missing file is an empty roster, not an error.
    pub fn load(ban_path: &Path, admin_path: &Path) -> Self {
        let bans = read_roster(ban_path);
        let admins = read_roster(admin_path);
        info!(
            "moderation loaded: {} banned, {} admin",
            bans.len(),
            admins.len()
        );
        Self {
            bans,
            admins,
            ban_path: Some(ban_path.to_path_buf()),
        }
    }

    pub fn is_banned(&self, peer: PeerId) -> bool {
        self.bans.contains(&peer.to_string())
    }

    pub fn is_admin(&self, peer: PeerId) -> bool {
        self.admins.contains(&peer.to_string())
    }

    /// Grants admin for this process lifetime; the admin file is the
    /// durable roster.
    pub fn add_admin(&mut self, peer: PeerId) {
        self.admins.insert(peer.to_string());
    }

    /// Adds a peer to the ban set and appends it to the ban file.
    pub fn ban(&mut self, peer: PeerId) {
        let entry = peer.to_string();
        if !self.bans.insert(entry.clone()) {
            return;
        }
        info!("banned peer {}", peer);
        if let Some(path) = &self.ban_path {
            let result = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| writeln!(file, "{}", entry));
            if let Err(e) = result {
                warn!("could not persist ban for {}: {}", peer, e);
            }
        }
    }

    pub fn ban_count(&self) -> usize {
        self.bans.len()
    }
}

fn read_roster(path: &Path) -> HashSet<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect(),
        Err(e) => {
            warn!("roster {} not readable ({}), starting empty", path.display(), e);
            HashSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("driftline-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_in_memory_ban() {
        let mut moderation = Moderation::in_memory();
        let peer = PeerId(404);
        assert!(!moderation.is_banned(peer));
        moderation.ban(peer);
        assert!(moderation.is_banned(peer));
        // second ban is a no-op
        moderation.ban(peer);
        assert_eq!(moderation.ban_count(), 1);
    }

    #[test]
    fn test_ban_appends_and_reloads() {
        let ban_path = temp_path("bans.txt");
        let admin_path = temp_path("admins.txt");
        let _ = std::fs::remove_file(&ban_path);
        std::fs::write(&admin_path, "7\n").unwrap();

        let mut moderation = Moderation::load(&ban_path, &admin_path);
        assert!(moderation.is_admin(PeerId(7)));
        moderation.ban(PeerId(13));
        moderation.ban(PeerId(14));

        let reloaded = Moderation::load(&ban_path, &admin_path);
        assert!(reloaded.is_banned(PeerId(13)));
        assert!(reloaded.is_banned(PeerId(14)));
        assert!(!reloaded.is_banned(PeerId(15)));

        let _ = std::fs::remove_file(&ban_path);
        let _ = std::fs::remove_file(&admin_path);
    }

    #[test]
    fn test_missing_roster_is_empty() {
        let moderation = Moderation::load(
            Path::new("/definitely/not/here/bans.txt"),
            Path::new("/definitely/not/here/admins.txt"),
        );
        assert_eq!(moderation.ban_count(), 0);
        assert!(!moderation.is_admin(PeerId(1)));
    }
}
