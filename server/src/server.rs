//! The server loop.
//!
//! One task owns all mutable world state and everything else talks to it
//! through channels: transport tasks push [`ServerEvent`]s in, the sender
//! task drains the [`Outbox`], and both periodic schedules live on this
//! loop's own timers. That single-writer discipline is what makes the
//! registry safe without locks.

use std::collections::HashSet;
use std::future::Future;
use std::time::Instant;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use shared::PeerId;

use crate::actors::{Actor, ActorKind};
use crate::config::ServerConfig;
use crate::extensions::{Extension, ExtensionAction, ExtensionHost, ExtensionInfo, WorldView};
use crate::moderation::Moderation;
use crate::network::{Outbox, ServerEvent};
use crate::packets;
use crate::registry::ActorRegistry;
use crate::scheduler::{
    PopulationState, SyncState, WorldChange, POPULATION_PERIOD, SYNC_PERIOD,
};
use crate::world_points::WorldPoints;

pub struct Server {
    pub(crate) config: ServerConfig,
    pub(crate) registry: ActorRegistry,
    pub(crate) moderation: Moderation,
    pub(crate) points: WorldPoints,
    pub(crate) extensions: ExtensionHost,
    pub(crate) sync: SyncState,
    pub(crate) population: PopulationState,
    pub(crate) outbox: Outbox,
    pub(crate) rng: StdRng,
    /// Unknown packet types we have already complained about.
    pub(crate) unknown_types: HashSet<String>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        moderation: Moderation,
        points: WorldPoints,
        outbox: Outbox,
    ) -> Self {
        Self {
            config,
            registry: ActorRegistry::new(),
            moderation,
            points,
            extensions: ExtensionHost::new(),
            sync: SyncState::new(),
            population: PopulationState::new(),
            outbox,
            rng: StdRng::from_entropy(),
            unknown_types: HashSet::new(),
        }
    }

    pub fn register_extension(&mut self, info: ExtensionInfo, handler: Box<dyn Extension>) {
        self.extensions.register(info, handler);
    }

    /// Runs until the event channel closes or `shutdown` resolves, then
    /// broadcasts the closing notice and releases the sender task.
    pub async fn run(
        &mut self,
        mut events: mpsc::UnboundedReceiver<ServerEvent>,
        shutdown: impl Future<Output = ()>,
    ) {
        let mut sync_timer = interval(SYNC_PERIOD);
        sync_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut population_timer = interval(POPULATION_PERIOD);
        population_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // both intervals fire immediately on the first tick
        sync_timer.tick().await;
        population_timer.tick().await;

        self.start_extensions();
        info!(
            "server '{}' running ({} max players, {} extensions)",
            self.config.server_name,
            self.config.max_players,
            self.extensions.len()
        );
        if self.config.code_only {
            info!("lobby is join-code only");
        }
        if !self.config.join_code.is_empty() {
            info!("join code is set; lobby advertises it to the session browser");
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            info!("transport closed its event channel");
                            break;
                        }
                    }
                }
                _ = sync_timer.tick() => self.sync_tick(),
                _ = population_timer.tick() => self.population_tick_at(Instant::now()),
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.broadcast(&packets::server_close());
        self.outbox.shutdown();
    }

    /// Fires `on_init` for every registered extension.
    pub fn start_extensions(&mut self) {
        let view = WorldView::capture(&self.registry);
        let actions = self.extensions.dispatch_init(&view);
        self.apply_actions(actions);
    }

    /// One transform-broadcast cycle: kind motion, extension tick, then the
    /// delta/heartbeat decision.
    pub fn sync_tick(&mut self) {
        self.registry.advance_motion(SYNC_PERIOD.as_secs_f32());

        let view = WorldView::capture(&self.registry);
        let actions = self.extensions.dispatch_tick(&view);
        self.apply_actions(actions);

        let snapshot = self.registry.snapshot();
        let updates = self.sync.collect_updates(&snapshot);
        if updates.is_empty() {
            return;
        }
        let peers = self.registry.peers();
        for update in updates {
            self.outbox.fanout(
                peers.clone(),
                &packets::actor_update(update.instance_id, update.position, update.rotation),
            );
        }
    }

    /// One world-population cycle at the given clock reading. Split out
    /// from the timer so simulated time can drive it.
    pub fn population_tick_at(&mut self, now: Instant) {
        let changes = self.population.tick(
            &mut self.registry,
            &self.points,
            &self.config,
            now,
            &mut self.rng,
        );
        self.announce_changes(changes);
    }

    pub(crate) fn announce_changes(&mut self, changes: Vec<WorldChange>) {
        for change in changes {
            match change {
                WorldChange::Spawned(actor) => {
                    self.broadcast(&packets::instance_actor(&actor));
                }
                WorldChange::Removed { instance_id, .. } => {
                    self.broadcast(&packets::wipe_actor(instance_id));
                }
            }
        }
    }

    pub(crate) fn broadcast(&self, packet: &shared::WireValue) {
        self.outbox.fanout(self.registry.peers(), packet);
    }

    pub(crate) fn apply_actions(&mut self, actions: Vec<ExtensionAction>) {
        for action in actions {
            match action {
                ExtensionAction::Chat { to, text, color } => {
                    let packet = packets::message(&text, &color, false);
                    match to {
                        Some(peer) => self.outbox.send_to(peer, &packet),
                        None => self.broadcast(&packet),
                    }
                }
                ExtensionAction::SpawnActor { kind, position } => {
                    let id = self.registry.create(kind, position, &mut self.rng);
                    if let Some(actor) = self.registry.find(id).cloned() {
                        self.broadcast(&packets::instance_actor(&actor));
                    }
                }
                ExtensionAction::RemoveActor(instance_id) => {
                    match self.registry.find(instance_id).map(Actor::is_server_owned) {
                        Some(true) => {
                            self.registry.remove(instance_id);
                            self.broadcast(&packets::wipe_actor(instance_id));
                        }
                        Some(false) => {
                            debug!("extension tried to remove peer-owned actor {}", instance_id)
                        }
                        None => {}
                    }
                }
                ExtensionAction::SetZone {
                    instance_id,
                    zone,
                    zone_owner,
                } => {
                    if let Some(actor) = self.registry.find_mut(instance_id) {
                        actor.zone = zone.clone();
                        actor.zone_owner = zone_owner;
                        self.broadcast(&packets::set_zone(instance_id, &zone, zone_owner));
                    }
                }
                ExtensionAction::Kick(peer) => self.kick_peer(peer, "kicked by extension"),
                ExtensionAction::Ban(peer) => self.ban_peer(peer),
            }
        }
    }

    pub(crate) fn kick_peer(&mut self, peer: PeerId, reason: &str) {
        info!("kicking peer {}: {}", peer, reason);
        self.outbox.send_to(peer, &packets::kick());
        self.drop_player(peer, true);
    }

    pub(crate) fn ban_peer(&mut self, peer: PeerId) {
        self.moderation.ban(peer);
        self.outbox.send_to(peer, &packets::ban());
        self.drop_player(peer, true);
    }

    /// Removes a peer's player and every actor it owns, announces the
    /// removals and fires the leave callbacks.
    pub(crate) fn drop_player(&mut self, peer: PeerId, announce: bool) {
        let Some(player) = self.registry.remove_player(peer) else {
            return;
        };
        let removed = self.registry.remove_actors_owned_by(peer);
        for instance_id in removed {
            self.broadcast(&packets::wipe_actor(instance_id));
        }
        if announce {
            self.broadcast(&packets::message(
                &format!("{} left the session.", player.name),
                packets::COLOR_NOTICE,
                false,
            ));
        }
        let view = WorldView::capture(&self.registry);
        let actions = self.extensions.dispatch_player_leave(&view, peer);
        self.apply_actions(actions);
    }

    /// True when the peer may instance kinds reserved for the server.
    pub(crate) fn peer_is_admin(&self, peer: PeerId) -> bool {
        self.moderation.is_admin(peer)
    }

    /// Spawns one server-owned actor on behalf of internal callers and
    /// announces it. Returns the new instance id.
    pub fn spawn_world_actor(&mut self, kind: ActorKind, position: shared::math::Vector3) -> i64 {
        let id = self.registry.create(kind, position, &mut self.rng);
        if let Some(actor) = self.registry.find(id).cloned() {
            self.broadcast(&packets::instance_actor(&actor));
        }
        id
    }

    /// Read access for the admin console and tests.
    pub fn registry(&self) -> &ActorRegistry {
        &self.registry
    }
}
