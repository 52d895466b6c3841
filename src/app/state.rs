//! Application state shared across routes

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::game::snapshot::{default_map, load_map, MapError, MapSnapshot};
use crate::game::{GameMatch, MatchHandle, MatchRegistry, SlotReservation};
use crate::ws::protocol::MapMsg;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub match_registry: Arc<MatchRegistry>,
    /// Map every match is played on
    pub map: Arc<MapMsg>,
    /// `map` serialized once for all connections
    pub map_snapshot: MapSnapshot,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, MapError> {
        let map = match &config.map_file {
            Some(path) => load_map(path)?,
            None => default_map(config.map_width, config.map_height, rand::random()),
        };
        let map_snapshot = MapSnapshot::render(&map)?;

        Ok(Self {
            config: Arc::new(config),
            match_registry: Arc::new(MatchRegistry::new()),
            map: Arc::new(map),
            map_snapshot,
        })
    }

    /// Reserve a slot in a match that still accepts players, spawning a new
    /// one if none does. The slot is given back when the reservation drops.
    pub fn assign_match(&self) -> (MatchHandle, SlotReservation) {
        loop {
            if let Some(assigned) = self.match_registry.reserve_slot() {
                return assigned;
            }
            // Another connection may fill the fresh match first; look again
            let handle = self.spawn_match();
            if let Some(slot) = handle.try_reserve() {
                return (handle, slot);
            }
        }
    }

    /// Start a match task; it unregisters itself when it ends
    fn spawn_match(&self) -> MatchHandle {
        let id = Uuid::new_v4();
        let seed: u64 = rand::random();
        let (game_match, handle) = GameMatch::new(
            id,
            seed,
            self.config.game.clone(),
            &self.map,
            self.map_snapshot.clone(),
        );
        self.match_registry.insert(handle.clone());

        let registry = self.match_registry.clone();
        tokio::spawn(async move {
            game_match.run().await;
            registry.remove(&id);
            info!(match_id = %id, "Match unregistered");
        });

        info!(match_id = %id, seed, active_matches = self.match_registry.active_matches(), "Spawned match");
        handle
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::game::{InboundMsg, PlayerInput};
    use crate::ws::protocol::MsgType;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    pub(crate) fn test_config() -> Config {
        Config {
            server_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "info".into(),
            log_json: false,
            map_width: 256,
            map_height: 256,
            map_file: None,
            input_rate_limit: 60,
            client_origins: Vec::new(),
            game: GameConfig::default(),
        }
    }

    #[tokio::test]
    async fn matches_are_reused_while_joinable() {
        let state = assert_ok!(AppState::new(test_config()));
        let (first, _a) = state.assign_match();
        let (second, _b) = state.assign_match();
        assert_eq!(first.id, second.id);
        assert_eq!(first.player_count(), 2);
        assert_eq!(state.match_registry.active_matches(), 1);
    }

    #[tokio::test]
    async fn full_match_spawns_another() {
        let state = assert_ok!(AppState::new(test_config()));
        let max = state.config.game.max_players;
        let held: Vec<_> = (0..max).map(|_| state.assign_match()).collect();
        assert!(held.iter().all(|(h, _)| h.id == held[0].0.id));

        let (second, _slot) = state.assign_match();
        assert_ne!(held[0].0.id, second.id);
        assert_eq!(state.match_registry.active_matches(), 2);
    }

    #[tokio::test]
    async fn joins_queued_within_one_tick_all_find_a_match() {
        let config = Config {
            game: GameConfig {
                min_players: 2,
                max_players: 2,
                ..GameConfig::default()
            },
            ..test_config()
        };
        let state = assert_ok!(AppState::new(config));

        // Every join is queued before any match task gets to run
        let mut receivers = Vec::new();
        let mut match_ids = Vec::new();
        for _ in 0..3 {
            let (handle, slot) = state.assign_match();
            let (tx, rx) = mpsc::channel(8);
            let msg = InboundMsg::Join {
                name: "p".into(),
                outbound: tx,
                slot,
            };
            assert_ok!(handle.input_tx.try_send(PlayerInput {
                conn_id: Uuid::new_v4(),
                msg,
            }));
            match_ids.push(handle.id);
            receivers.push(rx);
        }
        assert_eq!(match_ids[0], match_ids[1]);
        assert_ne!(match_ids[1], match_ids[2]);

        for rx in &mut receivers {
            let first = timeout(Duration::from_secs(2), rx.recv()).await;
            let first = assert_ok!(first).expect("match sent a buffer");
            assert_eq!(first[0], MsgType::Joined as u8);
        }
    }

    #[test]
    fn oversized_map_fails_startup() {
        let config = Config {
            map_width: 2048,
            map_height: 2048,
            ..test_config()
        };
        assert!(matches!(AppState::new(config), Err(MapError::TooLarge { .. })));
    }

    #[test]
    fn missing_map_file_fails_startup() {
        let config = Config {
            map_file: Some("/nonexistent/arena.json".into()),
            ..test_config()
        };
        assert!(matches!(AppState::new(config), Err(MapError::Io(_))));
    }
}
