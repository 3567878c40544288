//! # sanctuary-collab: Real-time collaboration sync for shared workspaces
//!
//! Keeps a local user's view of a shared workspace in sync with every other
//! participant over a single WebSocket connection: who is present, where their
//! cursors are, which media flags they have on, and which workspace state keys
//! changed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── CollabSession ────────────────────────┐
//! │                                                               │
//! │  PresenceBroadcaster ──┐          ┌── CollaboratorRegistry    │
//! │  (cursor throttle)     │          │   (roster + local echo)   │
//! │                        ▼          │                           │
//! │  StateSynchronizer ─► ConnectionManager ──► MetricsAggregator │
//! │  (minimal diff)        │  ▲                 (sync counters)   │
//! └────────────────────────┼──┼───────────────────────────────────┘
//!                          │  │  WebSocket, JSON frames
//!                          ▼  │
//!                    ┌─────────────┐
//!                    │ RelayServer │  fan-out per session, no authority
//!                    └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire events (`ClientEvent` out, `ServerEvent` in)
//! - [`connection`]: transport lifecycle, handshake, teardown silence
//! - [`registry`]: remote collaborator roster
//! - [`presence`]: throttled cursor broadcasting
//! - [`state_sync`]: minimal-diff state synchronization
//! - [`metrics`]: sync counters and derived dashboard scores
//! - [`session`]: the session-scoped owner wiring the above together
//! - [`config`]: session configuration
//! - [`clock`]: injectable time source
//! - [`broadcast`], [`relay`]: development relay server
//!
//! ## Delivery model
//!
//! Best-effort and at-most-once. Nothing is acknowledged, retried or queued
//! across disconnects; offline and throttled operations are dropped and
//! reported through return values.

pub mod protocol;
pub mod clock;
pub mod config;
pub mod connection;
pub mod registry;
pub mod presence;
pub mod state_sync;
pub mod metrics;
pub mod session;
pub mod broadcast;
pub mod relay;

// Re-exports for convenience
pub use protocol::{
    ClientEvent, Collaborator, CollaboratorPatch, ExpressModeUpdate, Handshake, Position,
    PresenceUpdate, ProtocolError, ServerEvent, StatePatch, SyncMode,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ParticipantCounting, SessionConfig};
pub use connection::{
    ConnectionManager, ConnectionState, LoopbackPeer, TransportEvent, TransportHandle,
};
pub use registry::{CollaboratorRegistry, JoinOutcome};
pub use presence::{CursorIntervals, CursorOutcome, PresenceBroadcaster};
pub use state_sync::{diff, StateSnapshot, StateSynchronizer, SyncOutcome};
pub use metrics::{
    DerivedScores, ExpressModeMetrics, Metrics, MetricsAggregator, RealTimeSync,
};
pub use session::{CollabSession, SessionEvent};
pub use broadcast::{BroadcastGroup, BroadcastStats, RelayFrame, RoomFull, RoomJoin, RoomManager};
pub use relay::{RelayConfig, RelayServer, RelayStats};
