//! Integration tests for the driftline server
//!
//! These drive the dispatcher and schedulers end to end: frames go in as
//! the gzip bytes a peer would send, and assertions read the packets the
//! server queued for its sender task.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use server::actors::ActorKind;
use server::config::ServerConfig;
use server::extensions::{ExtensionInfo, WelcomeExtension};
use server::moderation::Moderation;
use server::network::{InboundFrame, Outbound, Outbox};
use server::world_points::WorldPoints;
use server::Server;
use shared::framing::{self, CHANNEL_GAME, CHANNEL_PING};
use shared::math::Vector3;
use shared::{PeerId, WireValue};

/// A sent packet as observed on the outbound queue.
#[derive(Debug)]
enum Sent {
    To(PeerId, u8, WireValue),
    Broadcast(Vec<PeerId>, WireValue),
}

impl Sent {
    fn packet(&self) -> &WireValue {
        match self {
            Sent::To(_, _, packet) => packet,
            Sent::Broadcast(_, packet) => packet,
        }
    }

    fn packet_type(&self) -> &str {
        self.packet()
            .get("type")
            .and_then(WireValue::as_str)
            .unwrap_or("")
    }
}

fn make_server(config: ServerConfig) -> (Server, mpsc::UnboundedReceiver<Outbound>) {
    let (outbox, rx) = Outbox::new();
    let server = Server::new(config, Moderation::in_memory(), WorldPoints::default(), outbox);
    (server, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Sent> {
    let mut sent = Vec::new();
    while let Ok(message) = rx.try_recv() {
        match message {
            Outbound::Send {
                peer,
                channel,
                frame,
            } => sent.push(Sent::To(
                peer,
                channel,
                framing::unpack(&frame).expect("outbound frame must decode"),
            )),
            Outbound::Fanout { peers, frame, .. } => sent.push(Sent::Broadcast(
                peers,
                framing::unpack(&frame).expect("outbound frame must decode"),
            )),
            Outbound::Shutdown => {}
        }
    }
    sent
}

fn packet(entries: Vec<(&str, WireValue)>) -> WireValue {
    WireValue::Mapping(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

fn frame(peer: PeerId, value: &WireValue) -> InboundFrame {
    InboundFrame {
        peer,
        channel: CHANNEL_GAME,
        bytes: framing::pack(value).expect("pack failed"),
    }
}

fn join(server: &mut Server, peer: PeerId, name: &str) {
    server.handle_frame(frame(
        peer,
        &packet(vec![
            ("type", WireValue::from("new_player_join")),
            ("name", WireValue::from(name)),
        ]),
    ));
}

/// WIRE PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// A frame survives the full pack/unpack path bit for bit.
    #[test]
    fn frame_roundtrip() {
        let value = packet(vec![
            ("type", WireValue::from("actor_update")),
            ("actor_id", WireValue::Int64(123456789)),
            ("pos", WireValue::from(Vector3::new(1.0, 2.0, 3.0))),
        ]);
        let bytes = framing::pack(&value).expect("pack failed");
        assert_eq!(framing::unpack(&bytes).expect("unpack failed"), value);
    }

    /// Garbage frames are rejected by the framing layer, not the server.
    #[test]
    fn garbage_frame_is_dropped_quietly() {
        let (mut server, mut rx) = make_server(ServerConfig::default());
        server.handle_frame(InboundFrame {
            peer: PeerId(1),
            channel: CHANNEL_GAME,
            bytes: vec![0xde, 0xad, 0xbe, 0xef],
        });
        assert!(drain(&mut rx).is_empty());
    }

    /// A well-formed frame without a string `type` is dropped the same way.
    #[test]
    fn untyped_frame_is_dropped_quietly() {
        let (mut server, mut rx) = make_server(ServerConfig::default());
        server.handle_frame(frame(
            PeerId(1),
            &packet(vec![("weight", WireValue::Float(3.5))]),
        ));
        assert!(drain(&mut rx).is_empty());
    }
}

/// DISPATCHER TESTS
mod dispatcher_tests {
    use super::*;

    /// Scenario: a handshake request earns a handshake reply carrying the
    /// requester's own identifier.
    #[test]
    fn handshake_reply_names_the_recipient() {
        let (mut server, mut rx) = make_server(ServerConfig::default());
        let peer = PeerId(42);
        server.handle_frame(frame(
            peer,
            &packet(vec![("type", WireValue::from("handshake_request"))]),
        ));

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Sent::To(to, _, reply) => {
                assert_eq!(*to, peer);
                assert_eq!(reply.get("type").and_then(WireValue::as_str), Some("handshake"));
                assert_eq!(reply.get("user_id").and_then(WireValue::as_str), Some("42"));
            }
            other => panic!("expected a direct reply, got {other:?}"),
        }
    }

    /// Scenario: a non-admin peer announcing a reserved actor kind is
    /// kicked, and everyone is told who tried it.
    #[test]
    fn reserved_spawn_kicks_and_names_the_peer() {
        let (mut server, mut rx) = make_server(ServerConfig::default());
        let peer = PeerId(7);
        join(&mut server, peer, "sneaky");
        drain(&mut rx);

        server.handle_frame(frame(
            peer,
            &packet(vec![
                ("type", WireValue::from("instance_actor")),
                (
                    "params",
                    packet(vec![
                        ("actor_type", WireValue::from("raincloud")),
                        ("actor_id", WireValue::Int64(555)),
                        ("at", WireValue::from(Vector3::zero())),
                    ]),
                ),
            ]),
        ));

        let sent = drain(&mut rx);
        let notice = sent
            .iter()
            .find(|s| s.packet_type() == "message")
            .expect("global notice expected");
        let text = notice
            .packet()
            .get("message")
            .and_then(WireValue::as_str)
            .unwrap();
        assert!(text.contains("sneaky"), "notice must name the peer: {text}");
        assert!(text.contains("raincloud"));

        assert!(
            sent.iter()
                .any(|s| matches!(s, Sent::To(to, _, _) if *to == peer) && s.packet_type() == "kick"),
            "peer must receive a kick"
        );
        assert!(server.registry().player(peer).is_none());
    }

    /// Ping replies go back on the channel the request came in on.
    #[test]
    fn ping_reply_stays_on_the_ping_channel() {
        let (mut server, mut rx) = make_server(ServerConfig::default());
        let peer = PeerId(9);
        server.handle_frame(InboundFrame {
            peer,
            channel: CHANNEL_PING,
            bytes: framing::pack(&packet(vec![("type", WireValue::from("request_ping"))]))
                .expect("pack failed"),
        });

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Sent::To(to, channel, reply) => {
                assert_eq!(*to, peer);
                assert_eq!(*channel, CHANNEL_PING);
                assert_eq!(
                    reply.get("type").and_then(WireValue::as_str),
                    Some("send_ping")
                );
                assert!(reply.get("time").and_then(WireValue::as_i64).is_some());
            }
            other => panic!("expected a direct ping reply, got {other:?}"),
        }
    }

    /// Join beyond the configured capacity is refused.
    #[test]
    fn join_past_capacity_is_refused() {
        let mut config = ServerConfig::default();
        config.max_players = 1;
        let (mut server, mut rx) = make_server(config);

        join(&mut server, PeerId(1), "first");
        drain(&mut rx);
        join(&mut server, PeerId(2), "second");

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Sent::To(to, _, reply) => {
                assert_eq!(*to, PeerId(2));
                assert_eq!(
                    reply.get("type").and_then(WireValue::as_str),
                    Some("force_disconnect_player")
                );
                assert_eq!(reply.get("user_id").and_then(WireValue::as_str), Some("2"));
            }
            other => panic!("expected a direct refusal, got {other:?}"),
        }
        assert_eq!(server.registry().player_count(), 1);
    }

    /// Banned peers get a kick reply and their packets do not act.
    #[test]
    fn banned_peer_cannot_act() {
        let peer = PeerId(66);
        let (outbox, mut rx) = Outbox::new();
        let mut moderation = Moderation::in_memory();
        moderation.ban(peer);
        let mut server = Server::new(
            ServerConfig::default(),
            moderation,
            WorldPoints::default(),
            outbox,
        );

        join(&mut server, peer, "persona non grata");

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_type(), "kick");
        assert_eq!(server.registry().player_count(), 0);
    }

    /// Transform updates only apply to actors the sender owns.
    #[test]
    fn transform_update_requires_ownership() {
        let (mut server, mut rx) = make_server(ServerConfig::default());
        let owner = PeerId(1);
        let intruder = PeerId(2);
        join(&mut server, owner, "owner");
        join(&mut server, intruder, "intruder");
        server.handle_frame(frame(
            owner,
            &packet(vec![
                ("type", WireValue::from("instance_actor")),
                (
                    "params",
                    packet(vec![
                        ("actor_type", WireValue::from("player")),
                        ("actor_id", WireValue::Int64(900)),
                        ("at", WireValue::from(Vector3::zero())),
                    ]),
                ),
            ]),
        ));
        drain(&mut rx);

        let moved = Vector3::new(5.0, 0.0, 5.0);
        let update = |id: i64| {
            packet(vec![
                ("type", WireValue::from("actor_update")),
                ("actor_id", WireValue::Int64(id)),
                ("pos", WireValue::from(moved)),
            ])
        };

        server.handle_frame(frame(intruder, &update(900)));
        assert_eq!(
            server.registry().find(900).unwrap().position,
            Vector3::zero(),
            "foreign transform must be ignored"
        );

        server.handle_frame(frame(owner, &update(900)));
        assert_eq!(server.registry().find(900).unwrap().position, moved);
    }

    /// A late joiner asking for the actor list gets every server-owned
    /// actor back.
    #[test]
    fn actor_resync_lists_server_actors() {
        let (mut server, mut rx) = make_server(ServerConfig::default());
        let peer = PeerId(3);
        join(&mut server, peer, "late");
        let fish = server.spawn_world_actor(ActorKind::Fish, Vector3::new(1.0, 0.0, 1.0));
        let metal = server.spawn_world_actor(ActorKind::Metal, Vector3::new(2.0, 0.0, 2.0));
        drain(&mut rx);

        server.handle_frame(frame(
            peer,
            &packet(vec![("type", WireValue::from("request_actors"))]),
        ));

        let sent = drain(&mut rx);
        let reply = sent
            .iter()
            .find(|s| s.packet_type() == "actor_request_send")
            .expect("resync reply expected");
        let list = reply
            .packet()
            .get("list")
            .and_then(WireValue::as_list)
            .expect("list present");
        let ids: Vec<i64> = list
            .iter()
            .filter_map(|entry| entry.get("actor_id").and_then(WireValue::as_i64))
            .collect();
        assert!(ids.contains(&fish));
        assert!(ids.contains(&metal));
    }

    /// Letters are relayed to the addressed peer only.
    #[test]
    fn letters_relay_to_their_recipient() {
        let (mut server, mut rx) = make_server(ServerConfig::default());
        let writer = PeerId(1);
        let reader = PeerId(2);
        join(&mut server, writer, "writer");
        join(&mut server, reader, "reader");
        drain(&mut rx);

        let letter = packet(vec![
            ("type", WireValue::from("letter_received")),
            ("to", WireValue::from("2")),
            ("body", WireValue::from("meet me at the dock")),
        ]);
        server.handle_frame(frame(writer, &letter));

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Sent::To(to, _, relayed) => {
                assert_eq!(*to, reader);
                assert_eq!(relayed, &letter);
            }
            other => panic!("expected a relay, got {other:?}"),
        }

        // a letter to nobody goes nowhere
        let dead_letter = packet(vec![
            ("type", WireValue::from("letter_received")),
            ("to", WireValue::from("99")),
        ]);
        server.handle_frame(frame(writer, &dead_letter));
        assert!(drain(&mut rx).is_empty());
    }

    /// The !kick command works for admins and is refused for everyone else.
    #[test]
    fn kick_command_is_admin_only() {
        let admin = PeerId(1);
        let target = PeerId(2);
        let (outbox, mut rx) = Outbox::new();
        let mut moderation = Moderation::in_memory();
        moderation.add_admin(admin);
        let mut server = Server::new(
            ServerConfig::default(),
            moderation,
            WorldPoints::default(),
            outbox,
        );
        join(&mut server, admin, "harbormaster");
        join(&mut server, target, "troublemaker");
        drain(&mut rx);

        let kick_cmd = packet(vec![
            ("type", WireValue::from("message")),
            ("message", WireValue::from("!kick troublemaker")),
        ]);

        // non-admin is refused
        server.handle_frame(frame(target, &kick_cmd));
        let refused = drain(&mut rx);
        assert_eq!(refused.len(), 1);
        assert!(server.registry().player(target).is_some());

        // admin kick lands
        server.handle_frame(frame(admin, &kick_cmd));
        let sent = drain(&mut rx);
        assert!(
            sent.iter()
                .any(|s| matches!(s, Sent::To(to, _, _) if *to == target)
                    && s.packet_type() == "kick"),
            "target must receive a kick"
        );
        assert!(server.registry().player(target).is_none());
    }

    /// Chat commands are answered by the server and kept away from
    /// extensions; the reply lists every player with their fisher code.
    #[test]
    fn players_command_lists_the_roster() {
        let (mut server, mut rx) = make_server(ServerConfig::default());
        let peer = PeerId(5);
        join(&mut server, peer, "cmdr");
        drain(&mut rx);

        server.handle_frame(frame(
            peer,
            &packet(vec![
                ("type", WireValue::from("message")),
                ("message", WireValue::from("!players")),
            ]),
        ));

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        let text = sent[0]
            .packet()
            .get("message")
            .and_then(WireValue::as_str)
            .unwrap();
        assert!(text.contains("cmdr ["), "roster must carry fisher codes: {text}");
    }
}

/// SCHEDULER TESTS
mod scheduler_tests {
    use super::*;

    /// Scenario: a fish past its despawn threshold disappears on the next
    /// population sweep and peers are told to drop it.
    #[test]
    fn expired_fish_is_swept_and_announced() {
        let (mut server, mut rx) = make_server(ServerConfig::default());
        join(&mut server, PeerId(1), "witness");
        let fish = server.spawn_world_actor(ActorKind::Fish, Vector3::new(4.0, 0.0, 4.0));
        drain(&mut rx);

        server.population_tick_at(Instant::now() + Duration::from_secs(81));

        assert!(server.registry().find(fish).is_none(), "fish must be gone");
        let sent = drain(&mut rx);
        let wipe = sent
            .iter()
            .find(|s| {
                s.packet().get("action").and_then(WireValue::as_str) == Some("_wipe_actor")
            })
            .expect("removal broadcast expected");
        assert_eq!(
            wipe.packet().get("actor_id").and_then(WireValue::as_i64),
            Some(fish)
        );
    }

    /// With no movement at all, the idle heartbeat rebroadcasts each actor
    /// exactly once on the 30th tick.
    #[test]
    fn idle_heartbeat_fires_on_tick_thirty() {
        let (mut server, mut rx) = make_server(ServerConfig::default());
        join(&mut server, PeerId(1), "witness");
        server.spawn_world_actor(ActorKind::Fish, Vector3::new(4.0, 0.0, 4.0));
        drain(&mut rx);

        // tick 1 broadcasts the brand-new actor once, to every peer
        server.sync_tick();
        let first: Vec<Sent> = drain(&mut rx);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].packet_type(), "actor_update");
        match &first[0] {
            Sent::Broadcast(peers, _) => assert_eq!(peers, &vec![PeerId(1)]),
            other => panic!("expected a broadcast, got {other:?}"),
        }

        // ticks 2..=29 stay silent
        for tick in 2..30 {
            server.sync_tick();
            assert!(
                drain(&mut rx).is_empty(),
                "unexpected broadcast at tick {tick}"
            );
        }

        // tick 30: heartbeat
        server.sync_tick();
        let heartbeat = drain(&mut rx);
        assert_eq!(heartbeat.len(), 1);
        assert_eq!(heartbeat[0].packet_type(), "actor_update");

        // counter reset: tick 31 silent again
        server.sync_tick();
        assert!(drain(&mut rx).is_empty());
    }

    /// Rainclouds wander on their own, so their transforms keep
    /// broadcasting without any peer input.
    #[test]
    fn raincloud_motion_keeps_broadcasting() {
        let (mut server, mut rx) = make_server(ServerConfig::default());
        join(&mut server, PeerId(1), "witness");
        server.spawn_world_actor(ActorKind::Raincloud, Vector3::new(0.0, 42.0, 0.0));
        drain(&mut rx);

        for _ in 0..3 {
            server.sync_tick();
            let sent = drain(&mut rx);
            assert_eq!(sent.len(), 1, "drifting cloud must rebroadcast every tick");
        }
    }
}

/// EXTENSION TESTS
mod extension_tests {
    use super::*;

    /// The built-in welcome extension whispers to joiners through the full
    /// dispatch path.
    #[test]
    fn welcome_extension_greets_joiners() {
        let (mut server, mut rx) = make_server(ServerConfig::default());
        server.register_extension(
            ExtensionInfo::new("welcome", "core.welcome", "driftline"),
            Box::new(WelcomeExtension::new("Reels ready.")),
        );
        server.start_extensions();

        let peer = PeerId(12);
        join(&mut server, peer, "Marlin");

        let sent = drain(&mut rx);
        let greeting = sent
            .iter()
            .find(|s| matches!(s, Sent::To(to, _, _) if *to == peer) && s.packet_type() == "message")
            .expect("private greeting expected");
        let text = greeting
            .packet()
            .get("message")
            .and_then(WireValue::as_str)
            .unwrap();
        assert!(text.contains("Marlin"));
        assert!(text.contains("Reels ready."));
    }
}
