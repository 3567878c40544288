//! Presence broadcasting for the local cursor.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceBroadcaster::update_cursor()
//!       │  (throttled: 16ms express / 32ms standard)
//!       ▼
//! ClientEvent::CursorUpdate { position }
//!       │
//!       ▼   (TransportHandle → writer task)
//! Relay fan-out to every other participant
//! ```
//!
//! The throttle window is strict: an update goes out only when *more* than
//! the interval has elapsed since the last emitted update. Throttled updates
//! are dropped, never queued, so a remote peer sees at most one cursor frame
//! per window and intermediate positions are lost.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::connection::TransportHandle;
use crate::protocol::{ClientEvent, Position, SyncMode};

// ───────────────────────────────────────────────────────────────────
// Throttle windows
// ───────────────────────────────────────────────────────────────────

/// Minimum spacing between emitted cursor updates, per mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorIntervals {
    pub express: Duration,
    pub standard: Duration,
}

impl CursorIntervals {
    pub fn for_mode(&self, mode: SyncMode) -> Duration {
        match mode {
            SyncMode::Express => self.express,
            SyncMode::Standard => self.standard,
        }
    }
}

impl Default for CursorIntervals {
    fn default() -> Self {
        Self {
            express: Duration::from_millis(16),
            standard: Duration::from_millis(32),
        }
    }
}

/// Result of a cursor update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOutcome {
    /// A `cursor_update` was handed to the transport
    Emitted,
    /// Inside the throttle window; dropped
    Throttled,
    /// Not connected; dropped
    Offline,
}

// ───────────────────────────────────────────────────────────────────
// Broadcaster
// ───────────────────────────────────────────────────────────────────

/// Rate-limits and emits local cursor updates.
pub struct PresenceBroadcaster {
    transport: TransportHandle,
    clock: Arc<dyn Clock>,
    mode: SyncMode,
    intervals: CursorIntervals,
    /// Clock reading of the last emitted update. `None` until the first emit.
    last_emitted: Option<Duration>,
    /// Latest requested position, emitted or not.
    local_cursor: Option<Position>,
    emitted: u64,
    dropped: u64,
}

impl PresenceBroadcaster {
    pub fn new(
        transport: TransportHandle,
        clock: Arc<dyn Clock>,
        mode: SyncMode,
        intervals: CursorIntervals,
    ) -> Self {
        Self {
            transport,
            clock,
            mode,
            intervals,
            last_emitted: None,
            local_cursor: None,
            emitted: 0,
            dropped: 0,
        }
    }

    /// Report a local cursor move.
    ///
    /// Emits a `cursor_update` if connected and outside the throttle window.
    /// The window only restarts when an update actually goes out.
    pub fn update_cursor(&mut self, position: Position) -> CursorOutcome {
        self.local_cursor = Some(position);

        if !self.transport.is_connected() {
            return CursorOutcome::Offline;
        }

        let now = self.clock.now();
        if !self.should_emit(now) {
            self.dropped += 1;
            return CursorOutcome::Throttled;
        }

        if !self.transport.emit(ClientEvent::CursorUpdate { position }) {
            return CursorOutcome::Offline;
        }
        self.last_emitted = Some(now);
        self.emitted += 1;
        CursorOutcome::Emitted
    }

    /// Whether an update at `now` would clear the throttle window.
    pub fn should_emit(&self, now: Duration) -> bool {
        match self.last_emitted {
            None => true,
            Some(last) => now.saturating_sub(last) > self.interval(),
        }
    }

    /// Switch mode. Takes effect on the next update; the last emit time is kept.
    pub fn set_mode(&mut self, mode: SyncMode) {
        if self.mode != mode {
            log::debug!("Cursor throttle now {:?} ({:?})", mode, self.intervals.for_mode(mode));
        }
        self.mode = mode;
    }

    /// Forget the last emit time, e.g. after the connection is torn down.
    pub fn reset(&mut self) {
        self.last_emitted = None;
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn interval(&self) -> Duration {
        self.intervals.for_mode(self.mode)
    }

    pub fn intervals(&self) -> CursorIntervals {
        self.intervals
    }

    pub fn local_cursor(&self) -> Option<Position> {
        self.local_cursor
    }

    pub fn last_emitted(&self) -> Option<Duration> {
        self.last_emitted
    }

    /// Number of updates handed to the transport.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Number of updates dropped by the throttle.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

// ===================================================================
// Tests
// ===================================================================
