//! Extension host: third-party behavior behind a fixed event/action contract.
//!
//! Extensions are compiled against the [`Extension`] trait and registered as
//! boxed handlers before the server starts; the host never sees a concrete
//! type. Callbacks run synchronously on the server loop and must not block.
//! Anything an extension wants to change goes through [`ExtensionApi`],
//! which queues [`ExtensionAction`]s; the loop drains the queue after each
//! fan-out so extensions never mutate world state re-entrantly.

use log::info;

use shared::math::Vector3;
use shared::PeerId;

use crate::actors::{Actor, ActorKind};
use crate::registry::{ActorRegistry, Player};

/// Registration metadata, in the order extensions were added.
#[derive(Debug, Clone)]
pub struct ExtensionInfo {
    pub name: String,
    pub id: String,
    pub author: String,
}

impl ExtensionInfo {
    pub fn new(name: &str, id: &str, author: &str) -> Self {
        Self {
            name: name.to_string(),
            id: id.to_string(),
            author: author.to_string(),
        }
    }
}

/// Lifecycle callbacks. Default bodies are no-ops so an extension only
/// implements what it cares about.
pub trait Extension: Send {
    fn on_init(&mut self, _api: &mut ExtensionApi) {}
    fn on_tick(&mut self, _api: &mut ExtensionApi) {}
    fn on_chat_message(&mut self, _api: &mut ExtensionApi, _sender: PeerId, _text: &str) {}
    fn on_player_join(&mut self, _api: &mut ExtensionApi, _peer: PeerId) {}
    fn on_player_leave(&mut self, _api: &mut ExtensionApi, _peer: PeerId) {}
}

/// Read-only world snapshot handed to callbacks.
pub struct WorldView {
    pub players: Vec<Player>,
    pub actors: Vec<Actor>,
}

impl WorldView {
    pub fn capture(registry: &ActorRegistry) -> Self {
        Self {
            players: registry.players_snapshot(),
            actors: registry.server_owned_snapshot(),
        }
    }
}

/// Actions an extension may request; drained by the server loop.
#[derive(Debug, Clone)]
pub enum ExtensionAction {
    Chat {
        to: Option<PeerId>,
        text: String,
        color: String,
    },
    SpawnActor {
        kind: ActorKind,
        position: Vector3,
    },
    RemoveActor(i64),
    SetZone {
        instance_id: i64,
        zone: String,
        zone_owner: i64,
    },
    Kick(PeerId),
    Ban(PeerId),
}

/// The capability surface one extension sees during one callback.
pub struct ExtensionApi<'a> {
    view: &'a WorldView,
    actions: &'a mut Vec<ExtensionAction>,
    extension_name: &'a str,
}

impl<'a> ExtensionApi<'a> {
    pub fn players(&self) -> &[Player] {
        &self.view.players
    }

    /// Server-owned world actors; peer-announced props are not exposed.
    pub fn actors(&self) -> &[Actor] {
        &self.view.actors
    }

    pub fn player(&self, peer: PeerId) -> Option<&Player> {
        self.view.players.iter().find(|p| p.peer == peer)
    }

    /// Queues a chat line for one peer, or for everyone when `to` is None.
    pub fn send_chat(&mut self, to: Option<PeerId>, text: &str, color: &str) {
        self.actions.push(ExtensionAction::Chat {
            to,
            text: text.to_string(),
            color: color.to_string(),
        });
    }

    pub fn spawn_actor(&mut self, kind: ActorKind, position: Vector3) {
        self.actions.push(ExtensionAction::SpawnActor { kind, position });
    }

    pub fn remove_actor(&mut self, instance_id: i64) {
        self.actions.push(ExtensionAction::RemoveActor(instance_id));
    }

    pub fn set_zone(&mut self, instance_id: i64, zone: &str, zone_owner: i64) {
        self.actions.push(ExtensionAction::SetZone {
            instance_id,
            zone: zone.to_string(),
            zone_owner,
        });
    }

    pub fn kick(&mut self, peer: PeerId) {
        self.actions.push(ExtensionAction::Kick(peer));
    }

    pub fn ban(&mut self, peer: PeerId) {
        self.actions.push(ExtensionAction::Ban(peer));
    }

    /// Log line attributed to the extension.
    pub fn log(&self, message: &str) {
        info!("[{}] {}", self.extension_name, message);
    }
}

struct Registration {
    info: ExtensionInfo,
    handler: Box<dyn Extension>,
}

/// Owns every registered extension and fans events out in registration
/// order.
#[derive(Default)]
pub struct ExtensionHost {
    registrations: Vec<Registration>,
}

impl ExtensionHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, info: ExtensionInfo, handler: Box<dyn Extension>) {
        info!(
            "registered extension '{}' ({}) by {}",
            info.name, info.id, info.author
        );
        self.registrations.push(Registration { info, handler });
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn fan_out(&mut self, view: &WorldView, callback: Callback<'_>) -> Vec<ExtensionAction> {
        let mut actions = Vec::new();
        for registration in &mut self.registrations {
            let mut api = ExtensionApi {
                view,
                actions: &mut actions,
                extension_name: &registration.info.name,
            };
            match callback {
                Callback::Init => registration.handler.on_init(&mut api),
                Callback::Tick => registration.handler.on_tick(&mut api),
                Callback::Chat { sender, text } => {
                    registration.handler.on_chat_message(&mut api, sender, text)
                }
                Callback::PlayerJoin(peer) => registration.handler.on_player_join(&mut api, peer),
                Callback::PlayerLeave(peer) => registration.handler.on_player_leave(&mut api, peer),
            }
        }
        actions
    }

    pub fn dispatch_init(&mut self, view: &WorldView) -> Vec<ExtensionAction> {
        self.fan_out(view, Callback::Init)
    }

    pub fn dispatch_tick(&mut self, view: &WorldView) -> Vec<ExtensionAction> {
        self.fan_out(view, Callback::Tick)
    }

    pub fn dispatch_chat(
        &mut self,
        view: &WorldView,
        sender: PeerId,
        text: &str,
    ) -> Vec<ExtensionAction> {
        self.fan_out(view, Callback::Chat { sender, text })
    }

    pub fn dispatch_player_join(&mut self, view: &WorldView, peer: PeerId) -> Vec<ExtensionAction> {
        self.fan_out(view, Callback::PlayerJoin(peer))
    }

    pub fn dispatch_player_leave(
        &mut self,
        view: &WorldView,
        peer: PeerId,
    ) -> Vec<ExtensionAction> {
        self.fan_out(view, Callback::PlayerLeave(peer))
    }
}

#[derive(Clone, Copy)]
enum Callback<'a> {
    Init,
    Tick,
    Chat { sender: PeerId, text: &'a str },
    PlayerJoin(PeerId),
    PlayerLeave(PeerId),
}

/// Built-in greeter: whispers a welcome line to every joiner.
pub struct WelcomeExtension {
    motd: String,
}

impl WelcomeExtension {
    pub fn new(motd: &str) -> Self {
        Self {
            motd: motd.to_string(),
        }
    }
}

impl Extension for WelcomeExtension {
    fn on_init(&mut self, api: &mut ExtensionApi) {
        api.log("welcome extension ready");
    }

    fn on_player_join(&mut self, api: &mut ExtensionApi, peer: PeerId) {
        let greeting = match api.player(peer) {
            Some(player) => format!("Welcome, {}! {}", player.name, self.motd),
            None => format!("Welcome! {}", self.motd),
        };
        api.send_chat(Some(peer), &greeting, crate::packets::COLOR_DEFAULT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Recorder {
        inits: u32,
        chats: Vec<(PeerId, String)>,
    }

    impl Extension for Recorder {
        fn on_init(&mut self, api: &mut ExtensionApi) {
            self.inits += 1;
            api.log("recorder up");
        }

        fn on_chat_message(&mut self, api: &mut ExtensionApi, sender: PeerId, text: &str) {
            self.chats.push((sender, text.to_string()));
            if text == "spawn one" {
                api.spawn_actor(ActorKind::Fish, Vector3::zero());
            }
        }

        fn on_player_join(&mut self, api: &mut ExtensionApi, peer: PeerId) {
            api.send_chat(Some(peer), "hello", "ffffff");
        }
    }

    fn empty_view() -> WorldView {
        WorldView {
            players: Vec::new(),
            actors: Vec::new(),
        }
    }

    #[test]
    fn test_init_fires_once_per_extension() {
        let mut host = ExtensionHost::new();
        host.register(
            ExtensionInfo::new("rec", "test.rec", "tests"),
            Box::new(Recorder {
                inits: 0,
                chats: Vec::new(),
            }),
        );
        let actions = host.dispatch_init(&empty_view());
        assert!(actions.is_empty());
        assert_eq!(host.len(), 1);
    }

    #[test]
    fn test_chat_fan_out_collects_actions() {
        let mut host = ExtensionHost::new();
        host.register(
            ExtensionInfo::new("rec", "test.rec", "tests"),
            Box::new(Recorder {
                inits: 0,
                chats: Vec::new(),
            }),
        );
        let actions = host.dispatch_chat(&empty_view(), PeerId(4), "spawn one");
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            ExtensionAction::SpawnActor { kind: ActorKind::Fish, .. }
        ));
    }

    #[test]
    fn test_actions_accumulate_across_extensions_in_order() {
        let mut host = ExtensionHost::new();
        for name in ["first", "second"] {
            host.register(
                ExtensionInfo::new(name, name, "tests"),
                Box::new(Recorder {
                    inits: 0,
                    chats: Vec::new(),
                }),
            );
        }
        let actions = host.dispatch_player_join(&empty_view(), PeerId(8));
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn test_welcome_extension_greets_by_name() {
        let mut registry = ActorRegistry::new();
        let mut rng = StdRng::seed_from_u64(1);
        let peer = PeerId(21);
        registry.add_player(peer, "Pesca", &mut rng);

        let mut host = ExtensionHost::new();
        host.register(
            ExtensionInfo::new("welcome", "core.welcome", "driftline"),
            Box::new(WelcomeExtension::new("Tight lines.")),
        );
        let view = WorldView::capture(&registry);
        let actions = host.dispatch_player_join(&view, peer);

        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ExtensionAction::Chat { to, text, .. } => {
                assert_eq!(*to, Some(peer));
                assert!(text.contains("Pesca"));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }
}
