//! Connection manager: one transport connection per (session, user).
//!
//! ```text
//!  components ──emit──► TransportHandle ──mpsc──► writer task ──► WebSocket
//!                                                                    │
//!  CollabSession ◄──recv()── mpsc ◄── reader task ◄──────────────────┘
//! ```
//!
//! Every connection attempt runs under a generation number. Teardown (explicit
//! `close()` or the socket ending) bumps the generation and drops the outgoing
//! sender; the writer re-checks the generation before each frame, so nothing
//! queued before teardown reaches the wire afterwards. There is no automatic
//! reconnect: a dropped connection stays `Disconnected` until `connect()` is
//! called again.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::protocol::{ClientEvent, Handshake, ProtocolError, ServerEvent};

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Lifecycle and message events surfaced by [`ConnectionManager::recv`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    /// The transport closed or failed. Not raised by an explicit `close()`.
    Disconnected,
    Message(ServerEvent),
}

type Outgoing = mpsc::UnboundedSender<ClientEvent>;
type Inbound = (u64, TransportEvent);

/// State shared between the manager, its tasks and every [`TransportHandle`].
#[derive(Debug)]
struct LinkShared {
    state: AtomicU8,
    generation: AtomicU64,
    outgoing: Mutex<Option<Outgoing>>,
}

impl LinkShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            generation: AtomicU64::new(0),
            outgoing: Mutex::new(None),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    fn lock_outgoing(&self) -> MutexGuard<'_, Option<Outgoing>> {
        self.outgoing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the sender and flip to `Connected`, unless `generation` already ended.
    fn activate(&self, generation: u64, tx: Outgoing) -> bool {
        let mut slot = self.lock_outgoing();
        if !self.is_current(generation) {
            return false;
        }
        *slot = Some(tx);
        self.set_state(ConnectionState::Connected);
        true
    }

    /// End `generation`. Returns `false` if it had already ended.
    fn end(&self, generation: u64) -> bool {
        let mut slot = self.lock_outgoing();
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        slot.take();
        self.set_state(ConnectionState::Disconnected);
        true
    }
}

/// Cloneable send-side handle shared by the outbound components.
///
/// Emission never blocks. It is refused (returns `false`) unless the
/// connection is `Connected`.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    shared: Arc<LinkShared>,
}

impl TransportHandle {
    /// A handle that is permanently disconnected.
    pub fn detached() -> Self {
        Self { shared: Arc::new(LinkShared::new()) }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queue an event for the writer. Returns whether it was accepted.
    pub fn emit(&self, event: ClientEvent) -> bool {
        let state = self.shared.state();
        if state != ConnectionState::Connected {
            log::debug!("Not emitting {} while {state:?}", event.name());
            return false;
        }
        match self.shared.lock_outgoing().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

enum LoopbackSignal {
    Event(ServerEvent),
    Drop,
}

type PeerReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<LoopbackSignal>>>;

enum Backend {
    WebSocket { url: String },
    Loopback { to_peer: Outgoing, from_peer: PeerReceiver },
}

/// The far side of an in-memory transport created by [`ConnectionManager::loopback`].
///
/// Sees every frame the writer would have put on the wire, and can inject
/// inbound events or simulate the connection dropping.
pub struct LoopbackPeer {
    outbound: mpsc::UnboundedReceiver<ClientEvent>,
    inbound: mpsc::UnboundedSender<LoopbackSignal>,
}

impl LoopbackPeer {
    /// Deliver an inbound event to the client.
    pub fn inject(&self, event: ServerEvent) -> bool {
        self.inbound.send(LoopbackSignal::Event(event)).is_ok()
    }

    /// Close the transport from the remote side.
    pub fn drop_connection(&self) -> bool {
        self.inbound.send(LoopbackSignal::Drop).is_ok()
    }

    /// Wait for the next outbound event.
    pub async fn next_outbound(&mut self) -> Option<ClientEvent> {
        self.outbound.recv().await
    }

    pub fn try_next_outbound(&mut self) -> Option<ClientEvent> {
        self.outbound.try_recv().ok()
    }

    /// Let the writer task run, then collect everything it forwarded.
    pub async fn drain_outbound(&mut self) -> Vec<ClientEvent> {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        let mut events = Vec::new();
        while let Ok(event) = self.outbound.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Owns the transport connection for one session.
pub struct ConnectionManager {
    handshake: Handshake,
    backend: Backend,
    shared: Arc<LinkShared>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    reader: Option<JoinHandle<()>>,
    connection_id: Option<Uuid>,
}

impl ConnectionManager {
    /// Create a manager that connects over WebSocket to `url`.
    pub fn new(handshake: Handshake, url: impl Into<String>) -> Self {
        Self::with_backend(handshake, Backend::WebSocket { url: url.into() })
    }

    /// Create a manager over in-memory channels.
    pub fn loopback(handshake: Handshake) -> (Self, LoopbackPeer) {
        let (to_peer, outbound) = mpsc::unbounded_channel();
        let (inbound, from_peer) = mpsc::unbounded_channel();
        let backend = Backend::Loopback {
            to_peer,
            from_peer: Arc::new(tokio::sync::Mutex::new(from_peer)),
        };
        (Self::with_backend(handshake, backend), LoopbackPeer { outbound, inbound })
    }

    fn with_backend(handshake: Handshake, backend: Backend) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            handshake,
            backend,
            shared: Arc::new(LinkShared::new()),
            inbound_tx,
            inbound_rx,
            reader: None,
            connection_id: None,
        }
    }

    /// Send-side handle for the outbound components.
    pub fn handle(&self) -> TransportHandle {
        TransportHandle { shared: self.shared.clone() }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Id of the most recent connection attempt, for log correlation.
    pub fn connection_id(&self) -> Option<Uuid> {
        self.connection_id
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Replace the handshake used by the next `connect()`.
    pub fn set_handshake(&mut self, handshake: Handshake) {
        self.handshake = handshake;
    }

    /// Open the transport and send the handshake.
    ///
    /// Spawns the reader and writer tasks. Fails with `AlreadyConnected` unless
    /// the manager is `Disconnected`.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.state() != ConnectionState::Disconnected {
            return Err(ProtocolError::AlreadyConnected);
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        self.shared.set_state(ConnectionState::Connecting);
        let generation = self.shared.generation();
        let connection_id = Uuid::new_v4();
        self.connection_id = Some(connection_id);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let _ = out_tx.send(ClientEvent::Handshake(self.handshake.clone()));

        let reader = match &self.backend {
            Backend::WebSocket { url } => {
                let (ws_stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
                    Ok(connected) => connected,
                    Err(e) => {
                        self.shared.set_state(ConnectionState::Disconnected);
                        log::error!("[{connection_id}] Failed to connect to {url}: {e}");
                        return Err(ProtocolError::ConnectionFailed(e.to_string()));
                    }
                };
                let (ws_writer, ws_reader) = ws_stream.split();
                tokio::spawn(write_frames(
                    ws_writer,
                    out_rx,
                    self.shared.clone(),
                    generation,
                    connection_id,
                ));
                tokio::spawn(read_frames(
                    ws_reader,
                    self.inbound_tx.clone(),
                    self.shared.clone(),
                    generation,
                    connection_id,
                ))
            }
            Backend::Loopback { to_peer, from_peer } => {
                tokio::spawn(write_loopback(
                    to_peer.clone(),
                    out_rx,
                    self.shared.clone(),
                    generation,
                ));
                tokio::spawn(read_loopback(
                    from_peer.clone(),
                    self.inbound_tx.clone(),
                    self.shared.clone(),
                    generation,
                    connection_id,
                ))
            }
        };
        self.reader = Some(reader);

        if !self.shared.activate(generation, out_tx) {
            log::warn!("[{connection_id}] Transport closed during handshake");
            return Err(ProtocolError::ConnectionClosed);
        }
        let _ = self.inbound_tx.send((generation, TransportEvent::Connected));
        log::info!(
            "[{connection_id}] Connected to session {} as {} ({:?} mode)",
            self.handshake.session_id,
            self.handshake.user_id,
            self.handshake.mode
        );
        Ok(())
    }

    /// Next lifecycle or message event.
    ///
    /// Events belonging to a connection that has since been torn down are
    /// discarded. Pends while nothing arrives.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        loop {
            let (generation, event) = self.inbound_rx.recv().await?;
            let stale = generation != self.shared.generation();
            match &event {
                TransportEvent::Message(message) if stale => {
                    log::debug!("Discarding {} from a closed connection", message.name());
                }
                TransportEvent::Connected if stale => {}
                _ => return Some(event),
            }
        }
    }

    /// Tear the connection down. Idempotent.
    ///
    /// After this returns no further outbound frame is written, including
    /// frames queued before the call.
    pub fn close(&mut self) {
        let was = self.state();
        self.shared.end(self.shared.generation());
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if was != ConnectionState::Disconnected {
            if let Some(id) = self.connection_id {
                log::info!("[{id}] Connection to session {} closed", self.handshake.session_id);
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_frames<S>(
    mut sink: S,
    mut outgoing: mpsc::UnboundedReceiver<ClientEvent>,
    shared: Arc<LinkShared>,
    generation: u64,
    connection_id: Uuid,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(event) = outgoing.recv().await {
        if !shared.is_current(generation) {
            log::debug!("[{connection_id}] Discarding {} queued before teardown", event.name());
            break;
        }
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("[{connection_id}] Skipping {}: {e}", event.name());
                continue;
            }
        };
        log::trace!("[{connection_id}] -> {}", event.name());
        if let Err(e) = sink.send(Message::Text(frame.into())).await {
            log::error!("[{connection_id}] Write failed: {e}");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_frames<S>(
    mut stream: S,
    inbound: mpsc::UnboundedSender<Inbound>,
    shared: Arc<LinkShared>,
    generation: u64,
    connection_id: Uuid,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                Ok(event) => {
                    log::trace!("[{connection_id}] <- {}", event.name());
                    if inbound.send((generation, TransportEvent::Message(event))).is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("[{connection_id}] Dropping undecodable frame: {e}"),
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                log::error!("[{connection_id}] Read failed: {e}");
                break;
            }
            _ => {}
        }
    }
    finish(&shared, &inbound, generation, connection_id);
}

async fn write_loopback(
    to_peer: Outgoing,
    mut outgoing: mpsc::UnboundedReceiver<ClientEvent>,
    shared: Arc<LinkShared>,
    generation: u64,
) {
    while let Some(event) = outgoing.recv().await {
        if !shared.is_current(generation) || to_peer.send(event).is_err() {
            break;
        }
    }
}

async fn read_loopback(
    from_peer: PeerReceiver,
    inbound: mpsc::UnboundedSender<Inbound>,
    shared: Arc<LinkShared>,
    generation: u64,
    connection_id: Uuid,
) {
    {
        let mut rx = from_peer.lock().await;
        while let Some(signal) = rx.recv().await {
            match signal {
                LoopbackSignal::Event(event) => {
                    if inbound.send((generation, TransportEvent::Message(event))).is_err() {
                        break;
                    }
                }
                LoopbackSignal::Drop => break,
            }
        }
    }
    finish(&shared, &inbound, generation, connection_id);
}

/// The transport ended on its own. Report it once.
fn finish(
    shared: &LinkShared,
    inbound: &mpsc::UnboundedSender<Inbound>,
    generation: u64,
    connection_id: Uuid,
) {
    if shared.end(generation) {
        log::info!("[{connection_id}] Transport closed by remote");
        let _ = inbound.send((generation, TransportEvent::Disconnected));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Position, SyncMode};
    use tokio::time::{timeout, Duration};

    fn handshake() -> Handshake {
        Handshake {
            session_id: "s-1".into(),
            user_id: "me".into(),
            user_name: "Me".into(),
            mode: SyncMode::Standard,
        }
    }

    fn cursor(x: f64) -> ClientEvent {
        ClientEvent::CursorUpdate { position: Position::new(x, 0.0) }
    }

    #[test]
    fn test_connection_state_encoding() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ] {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
        assert_eq!(ConnectionState::from_u8(200), ConnectionState::Disconnected);
    }

    #[test]
    fn test_detached_handle_refuses() {
        let handle = TransportHandle::detached();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(!handle.emit(cursor(1.0)));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (manager, _peer) = ConnectionManager::loopback(handshake());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());
        assert!(manager.connection_id().is_none());
        assert!(!manager.handle().emit(cursor(1.0)));
    }

    #[tokio::test]
    async fn test_connect_sends_handshake_first() {
        let (mut manager, mut peer) = ConnectionManager::loopback(handshake());
        manager.connect().await.unwrap();
        assert!(manager.is_connected());
        assert!(manager.connection_id().is_some());

        assert!(manager.handle().emit(cursor(1.0)));

        let first = peer.next_outbound().await.unwrap();
        assert_eq!(first, ClientEvent::Handshake(handshake()));
        assert_eq!(peer.next_outbound().await.unwrap(), cursor(1.0));

        assert_eq!(manager.recv().await, Some(TransportEvent::Connected));
    }

    #[tokio::test]
    async fn test_connect_twice_rejected() {
        let (mut manager, _peer) = ConnectionManager::loopback(handshake());
        manager.connect().await.unwrap();
        assert_eq!(manager.connect().await, Err(ProtocolError::AlreadyConnected));
    }

    #[tokio::test]
    async fn test_inbound_messages_delivered_in_order() {
        let (mut manager, peer) = ConnectionManager::loopback(handshake());
        manager.connect().await.unwrap();
        assert_eq!(manager.recv().await, Some(TransportEvent::Connected));

        peer.inject(ServerEvent::CollaboratorLeft("a".into()));
        peer.inject(ServerEvent::CollaboratorLeft("b".into()));

        assert_eq!(
            manager.recv().await,
            Some(TransportEvent::Message(ServerEvent::CollaboratorLeft("a".into())))
        );
        assert_eq!(
            manager.recv().await,
            Some(TransportEvent::Message(ServerEvent::CollaboratorLeft("b".into())))
        );
    }

    #[tokio::test]
    async fn test_close_silences_queued_events() {
        let (mut manager, mut peer) = ConnectionManager::loopback(handshake());
        manager.connect().await.unwrap();
        let handle = manager.handle();

        // queued, but the writer has not run yet
        assert!(handle.emit(cursor(1.0)));
        assert!(handle.emit(cursor(2.0)));
        manager.close();

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!handle.emit(cursor(3.0)));
        assert!(peer.drain_outbound().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut manager, _peer) = ConnectionManager::loopback(handshake());
        manager.close();
        manager.connect().await.unwrap();
        manager.close();
        manager.close();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_remote_drop_reports_disconnected() {
        let (mut manager, peer) = ConnectionManager::loopback(handshake());
        manager.connect().await.unwrap();
        let handle = manager.handle();
        assert_eq!(manager.recv().await, Some(TransportEvent::Connected));

        peer.drop_connection();
        assert_eq!(manager.recv().await, Some(TransportEvent::Disconnected));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!handle.emit(cursor(1.0)));
    }

    #[tokio::test]
    async fn test_no_automatic_reconnect() {
        let (mut manager, peer) = ConnectionManager::loopback(handshake());
        manager.connect().await.unwrap();
        let _ = manager.recv().await;
        peer.drop_connection();
        let _ = manager.recv().await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_after_close() {
        let (mut manager, mut peer) = ConnectionManager::loopback(handshake());
        manager.connect().await.unwrap();
        manager.close();
        let _ = peer.drain_outbound().await;

        manager.connect().await.unwrap();
        assert!(manager.is_connected());
        assert_eq!(manager.recv().await, Some(TransportEvent::Connected));
        assert_eq!(peer.next_outbound().await, Some(ClientEvent::Handshake(handshake())));
    }

    #[tokio::test]
    async fn test_stale_connected_event_discarded() {
        let (mut manager, peer) = ConnectionManager::loopback(handshake());
        manager.connect().await.unwrap();
        manager.close();

        // nothing from the closed connection is observable
        peer.inject(ServerEvent::CollaboratorLeft("x".into()));
        let next = timeout(Duration::from_millis(50), manager.recv()).await;
        assert!(next.is_err(), "Expected no events, got {next:?}");
    }

    #[tokio::test]
    async fn test_websocket_connect_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut manager = ConnectionManager::new(handshake(), format!("ws://127.0.0.1:{port}/s-1"));
        let result = manager.connect().await;
        assert!(matches!(result, Err(ProtocolError::ConnectionFailed(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
