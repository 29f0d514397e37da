//! Inbound packet dispatch.
//!
//! Frames arrive as opaque gzip bytes, get decoded through the shared codec
//! and are routed on their string `type` discriminator. Nothing a peer
//! sends may take the server down: malformed frames are logged and dropped,
//! policy violations cost the sender its seat, and unknown packet types are
//! complained about exactly once each.

use log::{debug, info, warn};

use shared::framing;
use shared::math::Vector3;
use shared::{PeerId, WireValue};

use crate::actors::{Actor, ActorKind};
use crate::extensions::WorldView;
use crate::network::{InboundFrame, ServerEvent};
use crate::packets;
use crate::server::Server;
use crate::utils::timestamp_millis;

impl Server {
    pub fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Frame(frame) => self.handle_frame(frame),
            ServerEvent::PeerDisconnected(peer) => self.handle_peer_left(peer),
        }
    }

    /// Transport-level departure: the peer is gone whether or not it said
    /// goodbye.
    pub fn handle_peer_left(&mut self, peer: PeerId) {
        self.drop_player(peer, true);
    }

    pub fn handle_frame(&mut self, frame: InboundFrame) {
        let banned = self.moderation.is_banned(frame.peer);
        if banned {
            // remind the peer it is not welcome, but still parse the frame
            // below so the attempt lands in the log
            self.outbox.send_to(frame.peer, &packets::kick());
        }

        let packet = match framing::unpack(&frame.bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("dropping malformed frame from {}: {}", frame.peer, e);
                return;
            }
        };
        if packet.contains_unsupported() {
            // a value we couldn't fully decode may have desynced everything
            // after it; the whole packet is untrustworthy
            warn!(
                "dropping frame from {} with unsupported value tags",
                frame.peer
            );
            return;
        }
        let Some(packet_type) = packet.get("type").and_then(WireValue::as_str) else {
            warn!("dropping frame from {} without a type", frame.peer);
            return;
        };

        if banned {
            info!(
                "banned peer {} sent '{}', not acting on it",
                frame.peer, packet_type
            );
            return;
        }

        match packet_type {
            "handshake_request" => self.handle_handshake(frame.peer),
            "new_player_join" => self.handle_join(frame.peer, &packet),
            "instance_actor" => self.handle_instance_actor(frame.peer, &packet),
            "actor_update" => self.handle_actor_update(frame.peer, &packet),
            "request_ping" => self.handle_ping_request(frame.peer, frame.channel),
            "send_ping" => debug!("ping reply from {}", frame.peer),
            "actor_action" => self.handle_actor_action(frame.peer, &packet),
            "request_actors" => self.handle_request_actors(frame.peer),
            "letter_received" => self.handle_letter(frame.peer, &packet),
            "message" => {
                let text = packet
                    .get("message")
                    .and_then(WireValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.handle_chat(frame.peer, &text);
            }
            other => {
                // complain once per unknown type, then stay quiet: a single
                // malformed client must not be able to flood the log
                if self.unknown_types.insert(other.to_string()) {
                    warn!("unknown packet type '{}' from {}", other, frame.peer);
                }
            }
        }
    }

    fn handle_handshake(&mut self, peer: PeerId) {
        debug!("handshake from {}", peer);
        self.outbox.send_to(peer, &packets::handshake(peer));
    }

    fn handle_join(&mut self, peer: PeerId, packet: &WireValue) {
        if self.registry.player(peer).is_some() {
            debug!("peer {} sent a duplicate join", peer);
            return;
        }
        if self.registry.player_count() >= self.config.max_players {
            info!("refusing {}: server is full", peer);
            self.outbox.send_to(peer, &packets::force_disconnect(peer));
            return;
        }

        let name = packet
            .get("name")
            .and_then(WireValue::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or("angler")
            .to_string();
        let _ = self.registry.add_player(peer, &name, &mut self.rng);

        self.outbox.send_to(
            peer,
            &packets::receive_host(PeerId::SERVER, &self.config.server_name),
        );
        self.broadcast(&packets::message(
            &format!("{} joined the session.", name),
            packets::COLOR_NOTICE,
            false,
        ));

        let view = WorldView::capture(&self.registry);
        let actions = self.extensions.dispatch_player_join(&view, peer);
        self.apply_actions(actions);
    }

    fn handle_instance_actor(&mut self, peer: PeerId, packet: &WireValue) {
        let Some(params) = packet.get("params") else {
            warn!("instance_actor from {} without params", peer);
            return;
        };
        let Some(actor_type) = params.get("actor_type").and_then(WireValue::as_str) else {
            warn!("instance_actor from {} without actor_type", peer);
            return;
        };
        let kind = ActorKind::from_wire(actor_type);

        if kind.is_server_spawned() && !self.peer_is_admin(peer) {
            let name = self
                .registry
                .player(peer)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| format!("peer {}", peer));
            warn!("{} tried to spawn reserved kind {}", peer, kind);
            self.broadcast(&packets::message(
                &format!("{} tried to spawn a {} and was removed.", name, actor_type),
                packets::COLOR_NOTICE,
                false,
            ));
            self.kick_peer(peer, "spawned a reserved actor kind");
            return;
        }

        let Some(instance_id) = params.get("actor_id").and_then(WireValue::as_i64) else {
            warn!("instance_actor from {} without actor_id", peer);
            return;
        };
        let position = params
            .get("at")
            .and_then(WireValue::as_vector3)
            .unwrap_or_else(Vector3::zero);

        if kind == ActorKind::Player {
            self.registry.bind_player_actor(peer, instance_id, position);
            return;
        }

        let mut actor = Actor::new(instance_id, kind, position);
        actor.owner = Some(peer);
        if let Some(rotation) = params.get("rot").and_then(WireValue::as_vector3) {
            actor.rotation = rotation;
        }
        if let Some(zone) = params.get("zone").and_then(WireValue::as_str) {
            actor.zone = zone.to_string();
        }
        if let Some(zone_owner) = params.get("zone_owner").and_then(WireValue::as_i64) {
            actor.zone_owner = zone_owner;
        }
        self.registry.insert_remote(actor);
    }

    fn handle_actor_update(&mut self, peer: PeerId, packet: &WireValue) {
        let Some(instance_id) = packet.get("actor_id").and_then(WireValue::as_i64) else {
            return;
        };
        let Some(actor) = self.registry.find_mut(instance_id) else {
            debug!("transform for unknown actor {} from {}", instance_id, peer);
            return;
        };
        if actor.owner != Some(peer) {
            debug!(
                "peer {} tried to move actor {} it does not own",
                peer, instance_id
            );
            return;
        }
        if let Some(position) = packet.get("pos").and_then(WireValue::as_vector3) {
            actor.position = position;
        }
        if let Some(rotation) = packet.get("rot").and_then(WireValue::as_vector3) {
            actor.rotation = rotation;
        }
    }

    fn handle_ping_request(&mut self, peer: PeerId, channel: u8) {
        let reply = packets::send_ping(PeerId::SERVER, timestamp_millis() as i64);
        self.outbox.send_on(peer, channel, &reply);
    }

    fn handle_actor_action(&mut self, peer: PeerId, packet: &WireValue) {
        let Some(action) = packet.get("action").and_then(WireValue::as_str) else {
            return;
        };
        let params = packet.get("params").and_then(WireValue::as_list);

        match action {
            "_sync_create_bubble" => {
                let text = params
                    .and_then(|p| p.first())
                    .and_then(WireValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.handle_chat(peer, &text);
            }
            "_wipe_actor" | "queue_free" => {
                let Some(instance_id) = packet.get("actor_id").and_then(WireValue::as_i64) else {
                    return;
                };
                self.handle_remove_request(peer, instance_id);
            }
            "_set_zone" => {
                let Some(instance_id) = packet.get("actor_id").and_then(WireValue::as_i64) else {
                    return;
                };
                let zone = params
                    .and_then(|p| p.first())
                    .and_then(WireValue::as_str)
                    .unwrap_or(crate::actors::DEFAULT_ZONE)
                    .to_string();
                let zone_owner = params
                    .and_then(|p| p.get(1))
                    .and_then(WireValue::as_i64)
                    .unwrap_or(-1);
                let Some(actor) = self.registry.find_mut(instance_id) else {
                    return;
                };
                if actor.owner == Some(peer) {
                    actor.zone = zone;
                    actor.zone_owner = zone_owner;
                }
            }
            "_ready" => debug!("peer {} reports ready", peer),
            other => debug!("unhandled actor action '{}' from {}", other, peer),
        }
    }

    fn handle_remove_request(&mut self, peer: PeerId, instance_id: i64) {
        let owned = matches!(
            self.registry.find(instance_id),
            Some(actor) if actor.owner == Some(peer)
        );
        if !owned && !self.peer_is_admin(peer) {
            debug!(
                "peer {} tried to wipe actor {} it does not own",
                peer, instance_id
            );
            return;
        }
        if self.registry.remove(instance_id).is_some() {
            self.broadcast(&packets::wipe_actor(instance_id));
        }
    }

    fn handle_request_actors(&mut self, peer: PeerId) {
        let actors = self.registry.server_owned_snapshot();
        debug!("resyncing {} actors to {}", actors.len(), peer);
        self.outbox
            .send_to(peer, &packets::actor_request_send(&actors));
    }

    /// Relays an in-game letter to the addressed peer, if they are here.
    fn handle_letter(&mut self, peer: PeerId, packet: &WireValue) {
        let recipient = packet
            .get("to")
            .and_then(WireValue::as_str)
            .and_then(|s| s.parse::<u64>().ok())
            .map(PeerId);
        match recipient {
            Some(to) if self.registry.player(to).is_some() => {
                debug!("relaying letter from {} to {}", peer, to);
                self.outbox.send_to(to, packet);
            }
            _ => debug!("letter from {} had no reachable recipient", peer),
        }
    }

    /// Chat entry point shared by bubbles and plain messages. Lines
    /// starting with `!` are server commands; everything else goes to the
    /// extensions.
    pub(crate) fn handle_chat(&mut self, peer: PeerId, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let speaker = self
            .registry
            .player(peer)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| format!("peer {}", peer));
        info!("[chat] {}: {}", speaker, text);

        if let Some(command) = text.strip_prefix('!') {
            self.handle_chat_command(peer, command);
            return;
        }

        let view = WorldView::capture(&self.registry);
        let actions = self.extensions.dispatch_chat(&view, peer, text);
        self.apply_actions(actions);
    }

    fn handle_chat_command(&mut self, peer: PeerId, command: &str) {
        let command = command.trim();

        // admin-only: kick by name or fisher code
        if let Some(target) = command.strip_prefix("kick ") {
            if !self.peer_is_admin(peer) {
                self.outbox.send_to(
                    peer,
                    &packets::message("!kick is admin-only.", packets::COLOR_DEFAULT, false),
                );
                return;
            }
            let target = target.trim();
            let found = self
                .registry
                .players_snapshot()
                .into_iter()
                .find(|p| p.name == target || p.fisher_code == target);
            match found {
                Some(player) => self.kick_peer(player.peer, "kicked by admin"),
                None => self.outbox.send_to(
                    peer,
                    &packets::message(
                        &format!("No player '{}' found.", target),
                        packets::COLOR_DEFAULT,
                        false,
                    ),
                ),
            }
            return;
        }

        match command {
            "help" => {
                let commands = if self.peer_is_admin(peer) {
                    "Commands: !help, !players, !kick <name>"
                } else {
                    "Commands: !help, !players"
                };
                self.outbox
                    .send_to(peer, &packets::message(commands, packets::COLOR_DEFAULT, false));
            }
            "players" => {
                let mut names: Vec<String> = self
                    .registry
                    .players_snapshot()
                    .iter()
                    .map(|p| format!("{} [{}]", p.name, p.fisher_code))
                    .collect();
                names.sort();
                let listing = format!("{} aboard: {}", names.len(), names.join(", "));
                self.outbox
                    .send_to(peer, &packets::message(&listing, packets::COLOR_DEFAULT, false));
            }
            other => {
                self.outbox.send_to(
                    peer,
                    &packets::message(
                        &format!("Unknown command '!{}'. Try !help.", other),
                        packets::COLOR_DEFAULT,
                        false,
                    ),
                );
            }
        }
    }
}
