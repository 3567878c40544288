//! Session-scoped owner of the sync components.
//!
//! ```text
//!                         ┌──────────────────────────┐
//!  next_event() ◄──────── │ ConnectionManager.recv() │ ◄── relay
//!       │                 └──────────────────────────┘
//!       ▼
//!  handle_server_event()
//!       ├── collaborator_joined / left ──► CollaboratorRegistry + MetricsAggregator
//!       ├── cursor_update / presence ────► CollaboratorRegistry (+ cursorUpdates)
//!       ├── state_sync ──────────────────► StateSynchronizer::apply_remote
//!       └── express_mode_update ─────────► MetricsAggregator::merge_express_mode
//!
//!  update_cursor_position() ──► PresenceBroadcaster ──┐
//!  sync_state() ──────────────► StateSynchronizer ────┼──► TransportHandle ──► relay
//!  toggle_video/mic, AI req ──────────────────────────┘
//! ```
//!
//! Everything lives in one [`CollabSession`]; there are no globals. Drops,
//! throttling and offline calls are reported through return values, never
//! as errors.

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::connection::{ConnectionManager, ConnectionState, LoopbackPeer, TransportEvent};
use crate::metrics::{DerivedScores, ExpressModeMetrics, Metrics, MetricsAggregator};
use crate::presence::{CursorOutcome, PresenceBroadcaster};
use crate::protocol::{
    ClientEvent, Collaborator, CollaboratorPatch, Position, ProtocolError, ServerEvent,
    StatePatch, SyncMode,
};
use crate::registry::{CollaboratorRegistry, JoinOutcome};
use crate::state_sync::{StateSnapshot, StateSynchronizer, SyncOutcome};

/// What an inbound event changed, as seen by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    /// The transport dropped; the roster has been cleared
    Disconnected,
    CollaboratorJoined(Collaborator),
    CollaboratorLeft(String),
    CursorMoved { user_id: String, position: Position },
    PresenceChanged(Collaborator),
    /// A peer's state diff, already folded into the snapshot
    RemoteState(StatePatch),
    ExpressModeUpdated(ExpressModeMetrics),
}

/// A live collaboration session for one local user.
pub struct CollabSession {
    config: SessionConfig,
    connection: ConnectionManager,
    registry: CollaboratorRegistry,
    presence: PresenceBroadcaster,
    state: StateSynchronizer,
    metrics: MetricsAggregator,
}

impl CollabSession {
    /// Session over WebSocket to `config.session_url()`.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        let connection = ConnectionManager::new(config.handshake(), config.session_url());
        Self::assemble(config, connection, clock)
    }

    /// Session over an in-memory transport.
    pub fn loopback(config: SessionConfig) -> (Self, LoopbackPeer) {
        Self::loopback_with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn loopback_with_clock(
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> (Self, LoopbackPeer) {
        let (connection, peer) = ConnectionManager::loopback(config.handshake());
        (Self::assemble(config, connection, clock), peer)
    }

    fn assemble(config: SessionConfig, connection: ConnectionManager, clock: Arc<dyn Clock>) -> Self {
        let transport = connection.handle();
        Self {
            registry: CollaboratorRegistry::new(config.local_collaborator()),
            presence: PresenceBroadcaster::new(
                transport.clone(),
                clock,
                config.mode,
                config.cursor_intervals(),
            ),
            state: StateSynchronizer::new(transport),
            metrics: MetricsAggregator::new(
                config.initial_metrics.clone(),
                config.participant_counting,
            ),
            connection,
            config,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Open the transport and send the handshake.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.connection.connect().await
    }

    /// Tear down the transport. Nothing is emitted afterwards.
    pub fn close(&mut self) {
        self.connection.close();
        self.teardown();
    }

    fn teardown(&mut self) {
        self.registry.clear();
        self.metrics.roster_changed(0);
        self.presence.reset();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Wait for the next inbound event and apply it.
    ///
    /// Events that change nothing (unknown ids, empty patches) are skipped.
    /// Returns `None` only if the transport can never produce another event.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            let event = self.connection.recv().await?;
            if let Some(changed) = self.handle_transport_event(event) {
                return Some(changed);
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) -> Option<SessionEvent> {
        match event {
            TransportEvent::Connected => Some(SessionEvent::Connected),
            TransportEvent::Disconnected => {
                self.teardown();
                Some(SessionEvent::Disconnected)
            }
            TransportEvent::Message(message) => self.handle_server_event(message),
        }
    }

    /// Apply one inbound event to the registry, synchronizer and metrics.
    pub fn handle_server_event(&mut self, event: ServerEvent) -> Option<SessionEvent> {
        match event {
            ServerEvent::CollaboratorJoined(collaborator) => {
                let outcome = self.registry.join(collaborator.clone());
                self.metrics.record_join(self.registry.len());
                match outcome {
                    JoinOutcome::Local => {
                        log::debug!("Join for local user {} refreshed local record", collaborator.id)
                    }
                    _ => log::info!("{} ({}) joined session", collaborator.name, collaborator.id),
                }
                Some(SessionEvent::CollaboratorJoined(collaborator))
            }

            ServerEvent::CollaboratorLeft(id) => {
                if self.registry.leave(&id).is_some() {
                    log::info!("{id} left session");
                } else {
                    log::debug!("Leave for unknown collaborator {id}");
                }
                self.metrics.record_leave(self.registry.len());
                Some(SessionEvent::CollaboratorLeft(id))
            }

            ServerEvent::CursorUpdate { user_id, position } => {
                if user_id == self.registry.local().id {
                    return None;
                }
                let patch = CollaboratorPatch::cursor(position);
                match self.registry.merge_update(&user_id, &patch) {
                    Some(_) => {
                        self.metrics.record_cursor_update();
                        log::trace!("{user_id} cursor at ({}, {})", position.x, position.y);
                        Some(SessionEvent::CursorMoved { user_id, position })
                    }
                    None => {
                        log::debug!("Cursor update for unknown collaborator {user_id}");
                        None
                    }
                }
            }

            ServerEvent::PresenceUpdate(update) => {
                if update.patch.is_empty() {
                    return None;
                }
                match self.registry.merge_update(&update.user_id, &update.patch) {
                    Some(record) => Some(SessionEvent::PresenceChanged(record)),
                    None => {
                        log::debug!("Presence update for unknown collaborator {}", update.user_id);
                        None
                    }
                }
            }

            ServerEvent::StateSync(patch) => {
                if patch.is_empty() {
                    return None;
                }
                self.state.apply_remote(&patch);
                Some(SessionEvent::RemoteState(patch))
            }

            ServerEvent::ExpressModeUpdate(update) => {
                let merged = self.metrics.merge_express_mode(&update);
                Some(SessionEvent::ExpressModeUpdated(merged))
            }
        }
    }

    // ── Outbound operations ──────────────────────────────────────

    /// Report a local cursor move; throttled per mode.
    pub fn update_cursor_position(&mut self, position: Position) -> CursorOutcome {
        self.presence.update_cursor(position)
    }

    /// Send the keys of `state` that changed since the last sync.
    pub fn sync_state(&mut self, state: &StateSnapshot) -> SyncOutcome {
        let outcome = self.state.sync(state);
        if outcome.is_emitted() {
            self.metrics.record_state_update();
        }
        outcome
    }

    /// Re-send the whole last-synchronized snapshot.
    pub fn resync_state(&mut self) -> SyncOutcome {
        let outcome = self.state.resync();
        if outcome.is_emitted() {
            self.metrics.record_state_update();
        }
        outcome
    }

    /// Toggle the local video flag. The local record updates even when offline;
    /// returns whether the toggle was sent.
    pub fn toggle_video(&mut self, enabled: bool) -> bool {
        self.registry.update_local(&CollaboratorPatch::video(enabled));
        self.connection.handle().emit(ClientEvent::ToggleVideo { enabled })
    }

    /// Toggle the local microphone flag. Same semantics as [`Self::toggle_video`].
    pub fn toggle_mic(&mut self, enabled: bool) -> bool {
        self.registry.update_local(&CollaboratorPatch::mic(enabled));
        self.connection.handle().emit(ClientEvent::ToggleMic { enabled })
    }

    /// Fire-and-forget AI assistance request. No response is defined.
    pub fn request_ai_assistance(&mut self, task: impl Into<String>) -> bool {
        let task = task.into();
        log::debug!("AI assistance requested: {task}");
        self.connection.handle().emit(ClientEvent::AiAssistanceRequest { task })
    }

    /// Switch sync mode. Changes the cursor window now and the handshake on
    /// the next `connect()`.
    pub fn set_mode(&mut self, mode: SyncMode) {
        self.config.mode = mode;
        self.presence.set_mode(mode);
        self.connection.set_handshake(self.config.handshake());
    }

    // ── Externally supplied counters ─────────────────────────────

    pub fn set_active_collaborations(&mut self, count: u32) {
        self.metrics.set_active_collaborations(count);
    }

    pub fn set_response_time_ms(&mut self, ms: u64) {
        self.metrics.set_response_time_ms(ms);
    }

    pub fn record_code_execution(&mut self) {
        self.metrics.record_code_execution();
    }

    // ── Read access ──────────────────────────────────────────────

    /// Remote collaborators, ordered by id.
    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.registry.collaborators()
    }

    pub fn registry(&self) -> &CollaboratorRegistry {
        &self.registry
    }

    pub fn local_collaborator(&self) -> &Collaborator {
        self.registry.local()
    }

    pub fn metrics(&self) -> &Metrics {
        self.metrics.metrics()
    }

    pub fn derived_scores(&self) -> DerivedScores {
        self.metrics.derived()
    }

    pub fn state_snapshot(&self) -> &StateSnapshot {
        self.state.snapshot()
    }

    pub fn presence(&self) -> &PresenceBroadcaster {
        &self.presence
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}
