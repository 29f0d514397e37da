//! Authoritative actor and player bookkeeping
//!
//! The registry owns every world entity the server knows about, players
//! included. All mutation funnels through the single server loop, so the
//! registry itself carries no locking; callers that need to iterate while
//! the world may change take a snapshot first.

use std::collections::HashMap;
use std::time::Instant;

use log::{debug, info};
use rand::Rng;

use shared::math::Vector3;
use shared::PeerId;

use crate::actors::{kind_tick, Actor, ActorKind};

/// Alphabet for fisher codes; ambiguous glyphs (I, O, 0, 1) are left out so
/// the codes survive being read aloud.
const FISHER_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const FISHER_CODE_LEN: usize = 3;

/// A connected participant.
///
/// The actor id is bound lazily: a player exists from the moment the join
/// announcement arrives, but only gets an `instance_id` once the peer
/// announces its own player actor.
#[derive(Debug, Clone)]
pub struct Player {
    pub peer: PeerId,
    pub name: String,
    /// Short human-readable code shown to other players. Random with no
    /// collision check; duplicates across live players are accepted.
    pub fisher_code: String,
    pub instance_id: Option<i64>,
    pub joined_at: Instant,
}

/// Authoritative collection of world entities keyed by instance id.
pub struct ActorRegistry {
    actors: HashMap<i64, Actor>,
    players: HashMap<PeerId, Player>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self {
            actors: HashMap::new(),
            players: HashMap::new(),
        }
    }

    /// Creates a server-owned actor with a process-unique random instance
    /// id, retrying on collision. Returns the assigned id.
    pub fn create(&mut self, kind: ActorKind, position: Vector3, rng: &mut impl Rng) -> i64 {
        let instance_id = self.new_instance_id(rng);
        let mut actor = Actor::new(instance_id, kind, position);
        actor.heading = rng.gen_range(0.0..std::f32::consts::TAU);
        debug!("spawned {} as instance {}", actor.kind, instance_id);
        self.actors.insert(instance_id, actor);
        instance_id
    }

    /// Tracks an actor announced by a peer under the id the peer chose.
    /// Returns false (and keeps the existing actor) on an id collision.
    pub fn insert_remote(&mut self, actor: Actor) -> bool {
        if self.actors.contains_key(&actor.instance_id) {
            debug!(
                "rejecting remote actor {}: instance id already live",
                actor.instance_id
            );
            return false;
        }
        self.actors.insert(actor.instance_id, actor);
        true
    }

    fn new_instance_id(&self, rng: &mut impl Rng) -> i64 {
        loop {
            let candidate = rng.gen_range(100_000_000i64..1_000_000_000i64);
            if !self.actors.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn find(&self, instance_id: i64) -> Option<&Actor> {
        self.actors.get(&instance_id)
    }

    pub fn find_mut(&mut self, instance_id: i64) -> Option<&mut Actor> {
        self.actors.get_mut(&instance_id)
    }

    pub fn remove(&mut self, instance_id: i64) -> Option<Actor> {
        let removed = self.actors.remove(&instance_id);
        if let Some(actor) = &removed {
            debug!("removed {} instance {}", actor.kind, instance_id);
        }
        removed
    }

    /// Owned copy of every actor, safe to iterate while the registry is
    /// mutated afterwards.
    pub fn snapshot(&self) -> Vec<Actor> {
        self.actors.values().cloned().collect()
    }

    pub fn server_owned_snapshot(&self) -> Vec<Actor> {
        self.actors
            .values()
            .filter(|a| a.is_server_owned())
            .cloned()
            .collect()
    }

    /// Count of server-owned transient world actors (everything the
    /// population task spawns except the capped metal kind).
    pub fn transient_count(&self) -> usize {
        self.actors
            .values()
            .filter(|a| a.is_server_owned() && a.kind != ActorKind::Metal)
            .count()
    }

    pub fn metal_count(&self) -> usize {
        self.actors
            .values()
            .filter(|a| a.is_server_owned() && a.kind == ActorKind::Metal)
            .count()
    }

    /// Applies the per-kind motion table to every live actor.
    pub fn advance_motion(&mut self, dt: f32) {
        for actor in self.actors.values_mut() {
            if let Some(tick) = kind_tick(&actor.kind) {
                tick(actor, dt);
            }
        }
    }

    /// Registers a new player. Returns None if the peer already has one;
    /// at most one player may exist per peer identifier.
    pub fn add_player(&mut self, peer: PeerId, name: &str, rng: &mut impl Rng) -> Option<&Player> {
        if self.players.contains_key(&peer) {
            return None;
        }
        let player = Player {
            peer,
            name: name.to_string(),
            fisher_code: fisher_code(rng),
            instance_id: None,
            joined_at: Instant::now(),
        };
        info!(
            "player '{}' joined from peer {} (code {})",
            player.name, peer, player.fisher_code
        );
        self.players.insert(peer, player);
        self.players.get(&peer)
    }

    pub fn remove_player(&mut self, peer: PeerId) -> Option<Player> {
        let removed = self.players.remove(&peer);
        if let Some(player) = &removed {
            info!("player '{}' (peer {}) left", player.name, peer);
        }
        removed
    }

    /// Binds the player's actor id on receipt of the peer's own actor
    /// announcement and starts tracking the player actor itself.
    pub fn bind_player_actor(&mut self, peer: PeerId, instance_id: i64, position: Vector3) -> bool {
        let Some(player) = self.players.get_mut(&peer) else {
            return false;
        };
        if player.instance_id.is_some() {
            debug!("peer {} re-announced its player actor, ignoring", peer);
            return false;
        }
        player.instance_id = Some(instance_id);

        let mut actor = Actor::new(instance_id, ActorKind::Player, position);
        actor.owner = Some(peer);
        self.actors.insert(instance_id, actor);
        debug!("bound peer {} to player instance {}", peer, instance_id);
        true
    }

    pub fn player(&self, peer: PeerId) -> Option<&Player> {
        self.players.get(&peer)
    }

    pub fn find_player_by_instance(&self, instance_id: i64) -> Option<&Player> {
        self.players
            .values()
            .find(|p| p.instance_id == Some(instance_id))
    }

    pub fn players_snapshot(&self) -> Vec<Player> {
        self.players.values().cloned().collect()
    }

    /// Peers currently in the session, the broadcast target set.
    pub fn peers(&self) -> Vec<PeerId> {
        self.players.keys().copied().collect()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Drops every actor a peer owns (its player actor included) and
    /// returns the removed instance ids so the caller can announce them.
    pub fn remove_actors_owned_by(&mut self, peer: PeerId) -> Vec<i64> {
        let ids: Vec<i64> = self
            .actors
            .values()
            .filter(|a| a.owner == Some(peer))
            .map(|a| a.instance_id)
            .collect();
        for id in &ids {
            self.actors.remove(id);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

impl Default for ActorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn fisher_code(rng: &mut impl Rng) -> String {
    (0..FISHER_CODE_LEN)
        .map(|_| FISHER_CODE_ALPHABET[rng.gen_range(0..FISHER_CODE_ALPHABET.len())] as char)
        .collect()
}
