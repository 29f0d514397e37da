//! Outbound packet builders.
//!
//! Every packet the server originates is assembled here so the wire
//! vocabulary stays in one place. All builders return the root mapping the
//! framing layer expects.

use std::collections::HashMap;

use shared::math::Vector3;
use shared::{PeerId, WireValue};

use crate::actors::Actor;

/// Default chat color for plain server lines.
pub const COLOR_DEFAULT: &str = "ffffff";
/// Color used for join/leave and policy notices.
pub const COLOR_NOTICE: &str = "ff6161";

fn base(packet_type: &str) -> HashMap<String, WireValue> {
    let mut map = HashMap::new();
    map.insert("type".to_string(), WireValue::from(packet_type));
    map
}

fn finish(map: HashMap<String, WireValue>) -> WireValue {
    WireValue::Mapping(map)
}

/// Reply to a handshake request, telling the peer who it is to us.
pub fn handshake(recipient: PeerId) -> WireValue {
    let mut map = base("handshake");
    map.insert("user_id".to_string(), WireValue::from(recipient.to_string()));
    finish(map)
}

/// Host announcement sent to joining peers.
pub fn receive_host(host: PeerId, server_name: &str) -> WireValue {
    let mut map = base("receive_host");
    map.insert("host_id".to_string(), WireValue::from(host.to_string()));
    map.insert("server_name".to_string(), WireValue::from(server_name));
    finish(map)
}

/// Chat line. `local` marks bubble-only messages that should not hit the
/// main chat log on the client.
pub fn message(text: &str, color: &str, local: bool) -> WireValue {
    let mut map = base("message");
    map.insert("message".to_string(), WireValue::from(text));
    map.insert("color".to_string(), WireValue::from(color));
    map.insert("local".to_string(), WireValue::from(local));
    finish(map)
}

pub fn send_ping(from: PeerId, time_ms: i64) -> WireValue {
    let mut map = base("send_ping");
    map.insert("from".to_string(), WireValue::from(from.to_string()));
    map.insert("time".to_string(), WireValue::from(time_ms));
    finish(map)
}

pub fn actor_update(instance_id: i64, position: Vector3, rotation: Vector3) -> WireValue {
    let mut map = base("actor_update");
    map.insert("actor_id".to_string(), WireValue::from(instance_id));
    map.insert("pos".to_string(), WireValue::from(position));
    map.insert("rot".to_string(), WireValue::from(rotation));
    finish(map)
}

fn instance_params(actor: &Actor) -> WireValue {
    let mut params = HashMap::new();
    params.insert(
        "actor_type".to_string(),
        WireValue::from(actor.kind.wire_name()),
    );
    params.insert("at".to_string(), WireValue::from(actor.position));
    params.insert("rot".to_string(), WireValue::from(actor.rotation));
    params.insert("zone".to_string(), WireValue::from(actor.zone.as_str()));
    params.insert("zone_owner".to_string(), WireValue::from(actor.zone_owner));
    params.insert("actor_id".to_string(), WireValue::from(actor.instance_id));
    params.insert(
        "creator_id".to_string(),
        WireValue::from(actor.owner.unwrap_or(PeerId::SERVER).to_string()),
    );
    WireValue::Mapping(params)
}

/// Announcement of a newly spawned server-owned actor.
pub fn instance_actor(actor: &Actor) -> WireValue {
    let mut map = base("instance_actor");
    map.insert("params".to_string(), instance_params(actor));
    finish(map)
}

/// Full resync of server-owned actors for a late joiner.
pub fn actor_request_send(actors: &[Actor]) -> WireValue {
    let mut map = base("actor_request_send");
    map.insert(
        "list".to_string(),
        WireValue::List(actors.iter().map(instance_params).collect()),
    );
    finish(map)
}

fn actor_action(action: &str, instance_id: i64, params: Vec<WireValue>) -> WireValue {
    let mut map = base("actor_action");
    map.insert("action".to_string(), WireValue::from(action));
    map.insert("actor_id".to_string(), WireValue::from(instance_id));
    map.insert("params".to_string(), WireValue::List(params));
    finish(map)
}

/// Orders peers to drop an actor entirely.
pub fn wipe_actor(instance_id: i64) -> WireValue {
    actor_action("_wipe_actor", instance_id, Vec::new())
}

pub fn set_zone(instance_id: i64, zone: &str, zone_owner: i64) -> WireValue {
    actor_action(
        "_set_zone",
        instance_id,
        vec![WireValue::from(zone), WireValue::from(zone_owner)],
    )
}

pub fn kick() -> WireValue {
    finish(base("kick"))
}

pub fn ban() -> WireValue {
    finish(base("ban"))
}

pub fn server_close() -> WireValue {
    finish(base("server_close"))
}

/// Tells a peer (and everyone else) that a join was refused.
pub fn force_disconnect(peer: PeerId) -> WireValue {
    let mut map = base("force_disconnect_player");
    map.insert("user_id".to_string(), WireValue::from(peer.to_string()));
    finish(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::ActorKind;

    #[test]
    fn test_handshake_carries_recipient() {
        let packet = handshake(PeerId(77));
        assert_eq!(
            packet.get("type").and_then(WireValue::as_str),
            Some("handshake")
        );
        assert_eq!(
            packet.get("user_id").and_then(WireValue::as_str),
            Some("77")
        );
    }

    #[test]
    fn test_instance_actor_params() {
        let actor = Actor::new(900, ActorKind::Fish, Vector3::new(4.0, 0.0, -2.0));
        let packet = instance_actor(&actor);
        let params = packet.get("params").expect("params present");
        assert_eq!(
            params.get("actor_type").and_then(WireValue::as_str),
            Some("fish_spawn")
        );
        assert_eq!(
            params.get("actor_id").and_then(WireValue::as_i64),
            Some(900)
        );
        assert_eq!(
            params.get("zone_owner").and_then(WireValue::as_i64),
            Some(-1)
        );
    }

    #[test]
    fn test_wipe_actor_shape() {
        let packet = wipe_actor(31);
        assert_eq!(
            packet.get("type").and_then(WireValue::as_str),
            Some("actor_action")
        );
        assert_eq!(
            packet.get("action").and_then(WireValue::as_str),
            Some("_wipe_actor")
        );
        assert_eq!(packet.get("actor_id").and_then(WireValue::as_i64), Some(31));
    }

    #[test]
    fn test_packets_survive_framing() {
        let packet = message("tight lines!", COLOR_DEFAULT, false);
        let frame = shared::framing::pack(&packet).expect("pack failed");
        let unpacked = shared::framing::unpack(&frame).expect("unpack failed");
        assert_eq!(unpacked, packet);
    }
}
