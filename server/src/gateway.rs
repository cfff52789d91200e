//! Session gateway: the single entry point for everything that mutates the
//! session.
//!
//! Client commands, sequencer deadlines and the regeneration sweep all pass
//! through [`Gateway`], which owns the session, the sequencer and the
//! subscriber list. Any accepted mutation ends with the full snapshot being
//! published to every connection; rejected commands publish nothing.

use crate::client_manager::{ClientManager, Outbound};
use crate::error::CommandError;
use crate::sequencer::Sequencer;
use crate::session::{Session, SessionLimits};
use log::{debug, info, warn};
use shared::{ClientEvent, ConnectionId, Pattern, ServerEvent};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_clients: usize,
    /// Largest accepted image payload, in bytes of its encoded form.
    pub max_image_bytes: usize,
    /// Answer rejected commands with `commandRejected` to the sender.
    pub acknowledge_rejections: bool,
    pub limits: SessionLimits,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_clients: 64,
            max_image_bytes: 5 * 1024 * 1024,
            acknowledge_rejections: false,
            limits: SessionLimits::default(),
        }
    }
}

/// What an accepted command did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    /// Session changed; publish now.
    Changed,
    /// Work handed to the sequencer; it publishes per transition.
    Scheduled,
}

pub struct Gateway {
    session: Session,
    sequencer: Sequencer,
    clients: ClientManager,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            session: Session::new(config.limits),
            sequencer: Sequencer::new(),
            clients: ClientManager::new(config.max_clients),
            config,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    /// Registers a connection and sends it the current state. Returns `None`
    /// when the connection cap is reached.
    pub fn connect(&mut self, sender: Outbound) -> Option<ConnectionId> {
        let id = self.clients.add_client(sender)?;
        self.clients.send_to(&id, &self.state_event());
        Some(id)
    }

    /// Forgets a connection; its player leaves and a held DM slot is freed.
    pub fn disconnect(&mut self, id: &ConnectionId) {
        if !self.clients.remove_client(id) {
            return;
        }
        if self.session.remove_connection(id) {
            self.publish_state();
        }
    }

    /// Validates and applies one client command.
    pub fn handle(
        &mut self,
        id: &ConnectionId,
        event: ClientEvent,
        now: Instant,
    ) -> Result<(), CommandError> {
        if !self.clients.contains(id) {
            return Err(CommandError::invalid_state(format!(
                "{} is not connected",
                id
            )));
        }

        let command = event.name();
        match self.apply(id, event, now) {
            Ok(Effect::Changed) => {
                self.publish_state();
                Ok(())
            }
            Ok(Effect::Scheduled) => {
                self.fire_due(now);
                Ok(())
            }
            Err(e) => {
                self.reject(id, command, &e);
                Err(e)
            }
        }
    }

    /// Reports a frame that could not be parsed into a command.
    pub fn handle_malformed(&mut self, id: &ConnectionId, reason: &str) {
        let error = CommandError::malformed(reason);
        self.reject(id, "unknown", &error);
    }

    /// Refills every player's movement budget and publishes, whether or not
    /// anything changed.
    pub fn regenerate(&mut self) {
        let refilled = self.session.regenerate_speed();
        debug!("Regenerated movement for {} players", refilled);
        self.publish_state();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.sequencer.next_deadline()
    }

    /// Runs every sequencer step due by `now`, publishing after each one.
    /// Returns the number of steps taken.
    pub fn fire_due(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(event) = self.sequencer.fire_next(now, &mut self.session) {
            if !event.hits.is_empty() {
                info!(
                    "Square ({}, {}) hit {} player(s)",
                    event.row,
                    event.col,
                    event.hits.len()
                );
            }
            self.publish_state();
            fired += 1;
        }
        fired
    }

    fn apply(
        &mut self,
        id: &ConnectionId,
        event: ClientEvent,
        now: Instant,
    ) -> Result<Effect, CommandError> {
        match event {
            ClientEvent::CreateGame { rows, cols } => {
                let displaced = self.session.create_game(id, rows, cols)?;
                self.clients.send_to(id, &ServerEvent::DmStatus(true));
                if let Some(old) = displaced {
                    self.clients.send_to(&old, &ServerEvent::DmStatus(false));
                }
            }
            ClientEvent::JoinGame { name } => {
                self.session.add_player(id, &name)?;
                self.clients.send_to(id, &ServerEvent::PlayerId(id.clone()));
            }
            ClientEvent::MovePlayer { row, col } => {
                self.session.move_player(id, row, col)?;
            }
            ClientEvent::UpdateTokenImage { image_data } => {
                self.check_image(&image_data)?;
                self.session.set_token_image(id, image_data)?;
            }
            ClientEvent::UpdateSpeed { player_id, speed } => {
                self.session.set_speed(id, &player_id, speed)?;
            }
            ClientEvent::UpdateGridSize { rows, cols } => {
                self.session.resize_grid(id, rows, cols)?;
            }
            ClientEvent::UpdateBackground { image_data } => {
                self.session.require_dm(id, "updateBackground")?;
                self.check_image(&image_data)?;
                self.session.set_background(id, image_data)?;
            }
            ClientEvent::SavePattern(pattern) => {
                self.session.save_pattern(id, pattern)?;
            }
            ClientEvent::LaunchPattern(pattern) => {
                self.session.require_dm(id, "launchPattern")?;
                self.launch_pattern(pattern, now);
                return Ok(Effect::Scheduled);
            }
            ClientEvent::DeletePattern { index } => {
                self.session.delete_pattern(id, index)?;
            }
        }
        Ok(Effect::Changed)
    }

    /// Schedules the squares of `pattern` that fit the current grid.
    fn launch_pattern(&mut self, mut pattern: Pattern, now: Instant) {
        let total = pattern.squares.len();
        let session = &self.session;
        pattern
            .squares
            .retain(|square| session.contains_cell(square.row, square.col));

        let skipped = total - pattern.squares.len();
        if skipped > 0 {
            warn!(
                "Pattern {}: skipped {} square(s) outside the grid",
                pattern.name, skipped
            );
        }

        info!("Launching pattern: {}", pattern.name);
        self.sequencer.launch(&pattern, now);
    }

    fn check_image(&self, image: &str) -> Result<(), CommandError> {
        if image.len() > self.config.max_image_bytes {
            return Err(CommandError::malformed(format!(
                "image of {} bytes exceeds the {} byte limit",
                image.len(),
                self.config.max_image_bytes
            )));
        }
        Ok(())
    }

    fn reject(&self, id: &ConnectionId, command: &str, error: &CommandError) {
        match error {
            // Already logged by the authorization check.
            CommandError::Unauthorized { .. } => {}
            CommandError::InvalidState(_) => debug!("Ignored {} from {}: {}", command, id, error),
            CommandError::MalformedInput(_) => warn!("Rejected {} from {}: {}", command, id, error),
        }

        if self.config.acknowledge_rejections {
            self.clients.send_to(
                id,
                &ServerEvent::CommandRejected {
                    event: command.to_string(),
                    reason: error.to_string(),
                },
            );
        }
    }

    fn state_event(&self) -> ServerEvent {
        ServerEvent::GameState(Box::new(self.session.snapshot()))
    }

    fn publish_state(&self) {
        self.clients.publish(&self.state_event());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{GameSnapshot, PatternSquare, Phase};
    use std::sync::Arc;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tokio::time::Duration;

    struct TestClient {
        id: ConnectionId,
        rx: UnboundedReceiver<Arc<str>>,
    }

    impl TestClient {
        fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                events.push(serde_json::from_str(&frame).unwrap());
            }
            events
        }

        fn states(&mut self) -> Vec<GameSnapshot> {
            self.drain()
                .into_iter()
                .filter_map(|event| match event {
                    ServerEvent::GameState(state) => Some(*state),
                    _ => None,
                })
                .collect()
        }
    }

    fn connect(gateway: &mut Gateway) -> TestClient {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = gateway.connect(tx).unwrap();
        let mut client = TestClient { id, rx };
        client.drain();
        client
    }

    fn gateway_with_dm(config: GatewayConfig) -> (Gateway, TestClient) {
        let mut gateway = Gateway::new(config);
        let mut dm = connect(&mut gateway);
        gateway
            .handle(
                &dm.id,
                ClientEvent::CreateGame { rows: 10, cols: 10 },
                Instant::now(),
            )
            .unwrap();
        dm.drain();
        (gateway, dm)
    }

    fn join(gateway: &mut Gateway, name: &str) -> TestClient {
        let mut client = connect(gateway);
        gateway
            .handle(
                &client.id,
                ClientEvent::JoinGame {
                    name: name.to_string(),
                },
                Instant::now(),
            )
            .unwrap();
        client.drain();
        client
    }

    fn square(row: u32, col: u32, timing: f64, duration: f64) -> PatternSquare {
        PatternSquare::new(row, col, timing, duration)
    }

    #[test]
    fn test_connect_sends_current_state() {
        let mut gateway = Gateway::new(GatewayConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.connect(tx).unwrap();

        let frame = rx.try_recv().unwrap();
        let event: ServerEvent = serde_json::from_str(&frame).unwrap();
        assert!(matches!(event, ServerEvent::GameState(_)));
        assert_eq!(gateway.connection_count(), 1);
    }

    #[test]
    fn test_connection_cap() {
        let mut gateway = Gateway::new(GatewayConfig {
            max_clients: 1,
            ..GatewayConfig::default()
        });
        let _first = connect(&mut gateway);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(gateway.connect(tx).is_none());
    }

    #[test]
    fn test_create_game_notifies_dm_and_broadcasts() {
        let mut gateway = Gateway::new(GatewayConfig::default());
        let mut dm = connect(&mut gateway);
        let mut viewer = connect(&mut gateway);

        gateway
            .handle(
                &dm.id,
                ClientEvent::CreateGame { rows: 6, cols: 8 },
                Instant::now(),
            )
            .unwrap();

        let events = dm.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ServerEvent::DmStatus(true));
        match &events[1] {
            ServerEvent::GameState(state) => {
                assert_eq!((state.grid_rows, state.grid_cols), (6, 8));
                assert_eq!(state.dm.as_ref(), Some(&dm.id));
            }
            other => panic!("Unexpected event {:?}", other),
        }

        let states = viewer.states();
        assert_eq!(states.len(), 1);
    }

    #[test]
    fn test_displaced_dm_is_told() {
        let (mut gateway, mut dm) = gateway_with_dm(GatewayConfig::default());
        let mut usurper = connect(&mut gateway);

        gateway
            .handle(
                &usurper.id,
                ClientEvent::CreateGame { rows: 5, cols: 5 },
                Instant::now(),
            )
            .unwrap();

        assert_eq!(usurper.drain()[0], ServerEvent::DmStatus(true));
        assert_eq!(dm.drain()[0], ServerEvent::DmStatus(false));
        assert!(gateway.session().is_dm(&usurper.id));
    }

    #[test]
    fn test_join_sends_player_id() {
        let (mut gateway, mut dm) = gateway_with_dm(GatewayConfig::default());
        let mut player = connect(&mut gateway);

        gateway
            .handle(
                &player.id,
                ClientEvent::JoinGame {
                    name: "Aria".to_string(),
                },
                Instant::now(),
            )
            .unwrap();

        let events = player.drain();
        assert_eq!(events[0], ServerEvent::PlayerId(player.id.clone()));
        assert!(matches!(events[1], ServerEvent::GameState(_)));

        let states = dm.states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].players[0].name, "Aria");
        assert_eq!(states[0].players[0].position(), (5, 5));
    }

    #[test]
    fn test_every_accepted_command_broadcasts_once() {
        let (mut gateway, mut dm) = gateway_with_dm(GatewayConfig::default());
        let mut player = join(&mut gateway, "Aria");
        dm.drain();
        let now = Instant::now();

        let commands = vec![
            (player.id.clone(), ClientEvent::MovePlayer { row: 5, col: 6 }),
            (
                player.id.clone(),
                ClientEvent::UpdateTokenImage {
                    image_data: "data:image/png;base64,AA".to_string(),
                },
            ),
            (
                dm.id.clone(),
                ClientEvent::UpdateSpeed {
                    player_id: player.id.clone(),
                    speed: 5,
                },
            ),
            (dm.id.clone(), ClientEvent::UpdateGridSize { rows: 12, cols: 12 }),
            (
                dm.id.clone(),
                ClientEvent::UpdateBackground {
                    image_data: "data:image/png;base64,BB".to_string(),
                },
            ),
            (
                dm.id.clone(),
                ClientEvent::SavePattern(Pattern {
                    name: "line".to_string(),
                    squares: vec![square(0, 0, 0.0, 3.0)],
                }),
            ),
            (dm.id.clone(), ClientEvent::DeletePattern { index: 0 }),
        ];

        for (sender, command) in commands {
            gateway.handle(&sender, command, now).unwrap();
            assert_eq!(dm.states().len(), 1);
            assert_eq!(player.states().len(), 1);
        }

        let session = gateway.session();
        let aria = session.player(&player.id).unwrap();
        assert_eq!(aria.speed, 5);
        assert_eq!(aria.token_image.as_deref(), Some("data:image/png;base64,AA"));
        assert_eq!(session.grid_size(), (12, 12));
        assert!(session.saved_patterns().is_empty());
    }

    #[test]
    fn test_unauthorized_command_is_silent() {
        let (mut gateway, mut dm) = gateway_with_dm(GatewayConfig::default());
        let mut player = join(&mut gateway, "Aria");
        dm.drain();
        let before = gateway.session().snapshot();

        let result = gateway.handle(
            &player.id,
            ClientEvent::UpdateGridSize { rows: 3, cols: 3 },
            Instant::now(),
        );

        assert_eq!(
            result,
            Err(CommandError::Unauthorized {
                command: "updateGridSize"
            })
        );
        assert_eq!(gateway.session().snapshot(), before);
        assert!(player.drain().is_empty());
        assert!(dm.drain().is_empty());
    }

    #[test]
    fn test_rejections_acknowledged_when_enabled() {
        let (mut gateway, mut dm) = gateway_with_dm(GatewayConfig {
            acknowledge_rejections: true,
            ..GatewayConfig::default()
        });
        let mut player = join(&mut gateway, "Aria");
        dm.drain();

        let result = gateway.handle(
            &player.id,
            ClientEvent::MovePlayer { row: 0, col: 0 },
            Instant::now(),
        );
        assert!(matches!(result, Err(CommandError::InvalidState(_))));

        let events = player.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::CommandRejected { event, .. } => assert_eq!(event, "movePlayer"),
            other => panic!("Unexpected event {:?}", other),
        }
        assert!(dm.drain().is_empty());

        gateway.handle_malformed(&player.id, "expected value at line 1 column 1");
        match &player.drain()[0] {
            ServerEvent::CommandRejected { event, reason } => {
                assert_eq!(event, "unknown");
                assert!(reason.starts_with("malformed input"));
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_oversized_image_rejected() {
        let (mut gateway, mut dm) = gateway_with_dm(GatewayConfig {
            max_image_bytes: 8,
            ..GatewayConfig::default()
        });
        let mut player = join(&mut gateway, "Aria");
        dm.drain();

        let result = gateway.handle(
            &dm.id,
            ClientEvent::UpdateBackground {
                image_data: "0123456789".to_string(),
            },
            Instant::now(),
        );
        assert!(matches!(result, Err(CommandError::MalformedInput(_))));

        let result = gateway.handle(
            &player.id,
            ClientEvent::UpdateTokenImage {
                image_data: "0123456789".to_string(),
            },
            Instant::now(),
        );
        assert!(matches!(result, Err(CommandError::MalformedInput(_))));

        assert!(gateway.session().background_image().is_none());
        assert!(player.drain().is_empty());
    }

    #[test]
    fn test_launch_pattern_publishes_each_transition() {
        let (mut gateway, mut dm) = gateway_with_dm(GatewayConfig::default());
        let mut player = join(&mut gateway, "Aria");
        dm.drain();
        let start = Instant::now();

        gateway
            .handle(
                &dm.id,
                ClientEvent::LaunchPattern(Pattern {
                    name: "strike".to_string(),
                    squares: vec![square(5, 5, 0.0, 2.0), square(0, 0, 1.0, 1.0)],
                }),
                start,
            )
            .unwrap();

        // The timing 0 square warns right away.
        let states = player.states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].active_squares.len(), 1);
        assert_eq!(states[0].active_squares[0].phase, Phase::Warning);
        assert_eq!(gateway.next_deadline(), Some(start + Duration::from_secs(1)));

        // (5,5) enters damage and hits, (0,0) warns.
        assert_eq!(gateway.fire_due(start + Duration::from_secs(1)), 2);
        let states = player.states();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].players[0].hits, 1);
        assert_eq!(states[1].active_squares.len(), 2);

        gateway.fire_due(start + Duration::from_secs(10));
        assert!(gateway.session().active_squares().is_empty());
        assert_eq!(gateway.session().player(&player.id).unwrap().hits, 2);
        assert!(gateway.sequencer().is_idle());
    }

    #[test]
    fn test_launch_skips_squares_outside_grid() {
        let (mut gateway, _dm) = gateway_with_dm(GatewayConfig::default());
        let dm_id = gateway.session().dm().cloned().unwrap();

        gateway
            .handle(
                &dm_id,
                ClientEvent::LaunchPattern(Pattern {
                    name: "wide".to_string(),
                    squares: vec![square(0, 0, 5.0, 3.0), square(0, 40, 5.0, 3.0)],
                }),
                Instant::now(),
            )
            .unwrap();

        assert_eq!(gateway.sequencer().in_flight(), 1);
    }

    #[test]
    fn test_launch_requires_dm() {
        let (mut gateway, _dm) = gateway_with_dm(GatewayConfig::default());
        let player = join(&mut gateway, "Aria");

        let result = gateway.handle(
            &player.id,
            ClientEvent::LaunchPattern(Pattern {
                name: "sneaky".to_string(),
                squares: vec![square(0, 0, 0.0, 3.0)],
            }),
            Instant::now(),
        );
        assert!(matches!(result, Err(CommandError::Unauthorized { .. })));
        assert!(gateway.sequencer().is_idle());
    }

    #[test]
    fn test_regenerate_always_broadcasts() {
        let (mut gateway, mut dm) = gateway_with_dm(GatewayConfig::default());
        let mut player = join(&mut gateway, "Aria");
        gateway
            .handle(
                &player.id,
                ClientEvent::MovePlayer { row: 5, col: 7 },
                Instant::now(),
            )
            .unwrap();
        dm.drain();
        player.drain();

        gateway.regenerate();
        let states = player.states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].players[0].speed_remaining, 3);

        gateway.regenerate();
        assert_eq!(dm.states().len(), 2);
    }

    #[test]
    fn test_disconnects() {
        let (mut gateway, mut dm) = gateway_with_dm(GatewayConfig::default());
        let player = join(&mut gateway, "Aria");
        let mut viewer = connect(&mut gateway);
        dm.drain();

        gateway.disconnect(&player.id);
        let states = viewer.states();
        assert_eq!(states.len(), 1);
        assert!(states[0].players.is_empty());

        gateway.disconnect(&dm.id);
        let states = viewer.states();
        assert_eq!(states.len(), 1);
        assert!(states[0].dm.is_none());

        // Unknown or repeated disconnects are ignored.
        gateway.disconnect(&dm.id);
        assert!(viewer.drain().is_empty());
        assert_eq!(gateway.connection_count(), 1);

        // Commands from a closed connection are refused.
        let result = gateway.handle(
            &player.id,
            ClientEvent::JoinGame {
                name: "Ghost".to_string(),
            },
            Instant::now(),
        );
        assert!(matches!(result, Err(CommandError::InvalidState(_))));
    }
}
