//! World entity model: actor kinds, despawn policy and per-kind motion.
//!
//! Kind-specific behavior lives in a lookup table of update functions
//! instead of a type hierarchy; the registry applies the table every
//! synchronization tick.

use std::time::{Duration, Instant};

use shared::math::Vector3;
use shared::PeerId;

/// Discriminated actor kind. Server-spawned world kinds carry their own
/// despawn policy; anything a peer instances that we don't model is kept
/// under `Generic` with its original wire name so resyncs stay faithful.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActorKind {
    Player,
    Fish,
    MeteorFish,
    Raincloud,
    VoidPortal,
    Metal,
    Generic(String),
}

impl ActorKind {
    pub fn from_wire(name: &str) -> ActorKind {
        match name {
            "player" => ActorKind::Player,
            "fish_spawn" => ActorKind::Fish,
            "fish_spawn_alien" => ActorKind::MeteorFish,
            "raincloud" => ActorKind::Raincloud,
            "void_portal" => ActorKind::VoidPortal,
            "metal_spawn" => ActorKind::Metal,
            other => ActorKind::Generic(other.to_string()),
        }
    }

    pub fn wire_name(&self) -> &str {
        match self {
            ActorKind::Player => "player",
            ActorKind::Fish => "fish_spawn",
            ActorKind::MeteorFish => "fish_spawn_alien",
            ActorKind::Raincloud => "raincloud",
            ActorKind::VoidPortal => "void_portal",
            ActorKind::Metal => "metal_spawn",
            ActorKind::Generic(name) => name,
        }
    }

    /// Kinds only the server may instance. A peer announcing one of these
    /// is a policy violation and gets kicked.
    pub fn is_server_spawned(&self) -> bool {
        matches!(
            self,
            ActorKind::Fish
                | ActorKind::MeteorFish
                | ActorKind::Raincloud
                | ActorKind::VoidPortal
                | ActorKind::Metal
        )
    }

    pub fn despawn_policy(&self) -> DespawnPolicy {
        match self {
            ActorKind::Fish => DespawnPolicy::after_secs(80),
            ActorKind::MeteorFish => DespawnPolicy::after_secs(120),
            ActorKind::Raincloud => DespawnPolicy::after_secs(550),
            ActorKind::VoidPortal => DespawnPolicy::after_secs(600),
            // metal and everything else lives until removed explicitly
            _ => DespawnPolicy::disabled(),
        }
    }
}

impl std::fmt::Display for ActorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DespawnPolicy {
    pub enabled: bool,
    pub after: Duration,
}

impl DespawnPolicy {
    pub fn after_secs(secs: u64) -> Self {
        Self {
            enabled: true,
            after: Duration::from_secs(secs),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            after: Duration::ZERO,
        }
    }

    pub fn expired(&self, age: Duration) -> bool {
        self.enabled && age > self.after
    }
}

/// One world entity. Players are actors too; their `owner` is the peer that
/// announced them. `owner == None` marks a server-owned actor.
#[derive(Debug, Clone)]
pub struct Actor {
    pub instance_id: i64,
    pub kind: ActorKind,
    pub position: Vector3,
    pub rotation: Vector3,
    pub zone: String,
    pub zone_owner: i64,
    pub spawn_time: Instant,
    pub despawn: DespawnPolicy,
    pub owner: Option<PeerId>,
    /// Wander direction in radians, used by the kind update table.
    pub heading: f32,
}

impl Actor {
    pub fn new(instance_id: i64, kind: ActorKind, position: Vector3) -> Self {
        let despawn = kind.despawn_policy();
        Self {
            instance_id,
            kind,
            position,
            rotation: Vector3::zero(),
            zone: DEFAULT_ZONE.to_string(),
            zone_owner: -1,
            spawn_time: Instant::now(),
            despawn,
            owner: None,
            heading: 0.0,
        }
    }

    pub fn is_server_owned(&self) -> bool {
        self.owner.is_none()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.spawn_time)
    }

    pub fn should_despawn(&self, now: Instant) -> bool {
        self.despawn.expired(self.age(now))
    }
}

/// Zone every actor starts in until a peer or extension reassigns it.
pub const DEFAULT_ZONE: &str = "main_zone";

/// Per-kind motion update applied each synchronization tick.
pub type KindTick = fn(&mut Actor, f32);

pub fn kind_tick(kind: &ActorKind) -> Option<KindTick> {
    match kind {
        ActorKind::Raincloud => Some(raincloud_drift),
        _ => None,
    }
}

const RAINCLOUD_SPEED: f32 = 0.17;

fn raincloud_drift(actor: &mut Actor, dt: f32) {
    let dir = Vector3::new(actor.heading.cos(), 0.0, actor.heading.sin());
    actor.position = actor.position + dir * (RAINCLOUD_SPEED * dt);
}
