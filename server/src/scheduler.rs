//! Periodic synchronization and world population.
//!
//! Both tasks are written as plain state machines over registry snapshots so
//! the server loop (and the tests) can drive them tick by tick; the loop
//! owns the actual timers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;
use rand::Rng;

use shared::math::Vector3;

use crate::actors::{Actor, ActorKind};
use crate::config::ServerConfig;
use crate::registry::ActorRegistry;
use crate::world_points::WorldPoints;

/// Transform broadcast cadence: 12 updates per second.
pub const SYNC_PERIOD: Duration = Duration::from_millis(83);
/// World population cadence.
pub const POPULATION_PERIOD: Duration = Duration::from_secs(10);
/// Every 30th sync tick rebroadcasts all transforms even without movement,
/// bounding how far a peer that missed updates can drift.
pub const HEARTBEAT_TICKS: u32 = 30;
/// Most transient world actors allowed at once.
pub const TRANSIENT_CAP: usize = 15;
/// Most metal spawns allowed at once.
pub const METAL_CAP: usize = 7;

const METEOR_CHANCE: f64 = 0.04;
const PORTAL_CHANCE: f64 = 0.08;
const FISH_CHANCE: f64 = 0.75;
const METAL_CHANCE: f64 = 0.35;
/// Rain chance gained per population tick while no rain spawns.
const RAIN_CHANCE_STEP: f64 = 0.002;
/// Height above the picked ground point where rainclouds materialize.
const RAINCLOUD_ALTITUDE: f32 = 42.0;

/// One transform the sync task decided to rebroadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformUpdate {
    pub instance_id: i64,
    pub position: Vector3,
    pub rotation: Vector3,
}

/// Transform delta tracking with the global idle heartbeat.
pub struct SyncState {
    last_broadcast: HashMap<i64, (Vector3, Vector3)>,
    idle_ticks: u32,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            last_broadcast: HashMap::new(),
            idle_ticks: 0,
        }
    }

    /// Decides which actors need an `actor_update` this tick: everything
    /// whose transform changed since its last broadcast, or everything at
    /// once when the idle counter hits the heartbeat threshold.
    pub fn collect_updates(&mut self, actors: &[Actor]) -> Vec<TransformUpdate> {
        self.idle_ticks += 1;
        let heartbeat = self.idle_ticks >= HEARTBEAT_TICKS;
        if heartbeat {
            self.idle_ticks = 0;
        }

        let mut updates = Vec::new();
        for actor in actors {
            let transform = (actor.position, actor.rotation);
            let changed = self.last_broadcast.get(&actor.instance_id) != Some(&transform);
            if changed || heartbeat {
                self.last_broadcast.insert(actor.instance_id, transform);
                updates.push(TransformUpdate {
                    instance_id: actor.instance_id,
                    position: actor.position,
                    rotation: actor.rotation,
                });
            }
        }

        // forget transforms of actors that no longer exist
        if self.last_broadcast.len() > actors.len() {
            let live: std::collections::HashSet<i64> =
                actors.iter().map(|a| a.instance_id).collect();
            self.last_broadcast.retain(|id, _| live.contains(id));
        }

        updates
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// State change produced by one population tick, for the caller to announce.
#[derive(Debug, Clone)]
pub enum WorldChange {
    Spawned(Actor),
    Removed { instance_id: i64, kind: ActorKind },
}

/// Despawn sweep plus probabilistic spawning, capped per kind family.
pub struct PopulationState {
    rain_chance: f64,
}

impl PopulationState {
    pub fn new() -> Self {
        Self { rain_chance: 0.0 }
    }

    /// Runs one population cycle: sweep expired actors, then at most one
    /// transient spawn and at most one metal spawn.
    pub fn tick(
        &mut self,
        registry: &mut ActorRegistry,
        points: &WorldPoints,
        config: &ServerConfig,
        now: Instant,
        rng: &mut impl Rng,
    ) -> Vec<WorldChange> {
        let mut changes = self.sweep(registry, now);

        if let Some(change) = self.spawn_transient(registry, points, config, rng) {
            changes.push(change);
        }
        if let Some(change) = spawn_metal(registry, points, config, rng) {
            changes.push(change);
        }

        changes
    }

    /// Removes every server-owned actor whose despawn policy has expired.
    pub fn sweep(&mut self, registry: &mut ActorRegistry, now: Instant) -> Vec<WorldChange> {
        let expired: Vec<(i64, ActorKind)> = registry
            .snapshot()
            .into_iter()
            .filter(|actor| actor.is_server_owned() && actor.should_despawn(now))
            .map(|actor| (actor.instance_id, actor.kind))
            .collect();

        let mut changes = Vec::with_capacity(expired.len());
        for (instance_id, kind) in expired {
            registry.remove(instance_id);
            debug!("despawned {} instance {}", kind, instance_id);
            changes.push(WorldChange::Removed { instance_id, kind });
        }
        changes
    }

    fn spawn_transient(
        &mut self,
        registry: &mut ActorRegistry,
        points: &WorldPoints,
        config: &ServerConfig,
        rng: &mut impl Rng,
    ) -> Option<WorldChange> {
        if registry.transient_count() >= TRANSIENT_CAP {
            return None;
        }

        // independent weighted coins, rarest first; one winner per tick
        let spawn = if config.spawn_fish && rng.gen::<f64>() < METEOR_CHANCE {
            points
                .fish_point(rng)
                .map(|at| (ActorKind::MeteorFish, at))
        } else if config.spawn_rain && rng.gen::<f64>() < self.rain_chance {
            self.rain_chance = 0.0;
            points
                .fish_point(rng)
                .map(|at| (ActorKind::Raincloud, at + Vector3::new(0.0, RAINCLOUD_ALTITUDE, 0.0)))
        } else if config.spawn_portals && rng.gen::<f64>() < PORTAL_CHANCE {
            points.hidden_point(rng).map(|at| (ActorKind::VoidPortal, at))
        } else if config.spawn_fish && rng.gen::<f64>() < FISH_CHANCE {
            points.fish_point(rng).map(|at| (ActorKind::Fish, at))
        } else {
            None
        };

        // the rain coin charges up while rain keeps not happening
        if config.spawn_rain && !matches!(spawn, Some((ActorKind::Raincloud, _))) {
            self.rain_chance += RAIN_CHANCE_STEP * config.rain_spawn_multiplier;
        }

        let (kind, at) = spawn?;
        let id = registry.create(kind, at, rng);
        registry.find(id).cloned().map(WorldChange::Spawned)
    }
}

impl Default for PopulationState {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_metal(
    registry: &mut ActorRegistry,
    points: &WorldPoints,
    config: &ServerConfig,
    rng: &mut impl Rng,
) -> Option<WorldChange> {
    if !config.spawn_metal || registry.metal_count() >= METAL_CAP {
        return None;
    }
    if rng.gen::<f64>() >= METAL_CHANCE {
        return None;
    }
    let at = points.metal_point(rng)?;
    let id = registry.create(ActorKind::Metal, at, rng);
    registry.find(id).cloned().map(WorldChange::Spawned)
}
