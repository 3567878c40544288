//! Non-authoritative WebSocket relay.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                  ┌──► Client B
//!             ├── handshake ── BroadcastGroup ──┤
//! Client C ──┘   (sessionId)    (fan-out)       └──► Client D
//! ```
//!
//! The relay holds no workspace state and resolves no conflicts. It groups
//! connections by the session id in their handshake, replays the current
//! roster to newcomers, and translates each client event into the matching
//! server event for everyone else in the session:
//!
//! | client event            | fanned out as                         |
//! |-------------------------|---------------------------------------|
//! | `cursor_update`         | `cursor_update` with the sender's id  |
//! | `state_sync`            | `state_sync`, unchanged               |
//! | `toggle_video` / `mic`  | `presence_update`                     |
//! | `ai_assistance_request` | logged, not answered                  |

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RelayFrame, RoomJoin, RoomManager};
use crate::protocol::{
    ClientEvent, Collaborator, CollaboratorPatch, Handshake, PresenceUpdate, ServerEvent,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Connections beyond this per session are refused after the handshake
    pub max_peers_per_session: usize,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_session: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
}

/// A connection that completed its handshake.
struct Joined {
    group: Arc<BroadcastGroup>,
    session_id: String,
    user_id: String,
}

pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let connection_id = Uuid::new_v4();

        log::info!("[{connection_id}] WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut joined: Option<Joined> = None;
        let result = Self::pump(
            &mut ws_sender,
            &mut ws_receiver,
            connection_id,
            &mut joined,
            &rooms,
            &stats,
            &config,
        )
        .await;

        // Cleanup: leave the session and tell the others
        if let Some(j) = joined {
            j.group.remove_peer(&connection_id).await;
            let _ = j.group.broadcast(connection_id, &ServerEvent::CollaboratorLeft(j.user_id.clone()));
            log::info!("[{connection_id}] {} left session {}", j.user_id, j.session_id);
            if rooms.remove_if_empty(&j.session_id).await {
                log::info!("Session {} closed (empty)", j.session_id);
            }
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_sessions = rooms.room_count().await;
        }

        result
    }

    async fn pump<W, R>(
        ws_sender: &mut W,
        ws_receiver: &mut R,
        connection_id: Uuid,
        joined: &mut Option<Joined>,
        rooms: &RoomManager,
        stats: &RwLock<RelayStats>,
        config: &RelayConfig,
    ) -> Result<(), BoxError>
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<RelayFrame>>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            let event = match ClientEvent::decode(text.as_str()) {
                                Ok(event) => event,
                                Err(e) => {
                                    log::warn!("[{connection_id}] Dropping undecodable frame: {e}");
                                    continue;
                                }
                            };

                            let handshake = match event {
                                ClientEvent::Handshake(handshake) if joined.is_none() => handshake,
                                ClientEvent::Handshake(_) => {
                                    log::debug!("[{connection_id}] Ignoring repeated handshake");
                                    continue;
                                }
                                event => {
                                    match joined.as_ref() {
                                        Some(j) => Self::relay_event(event, connection_id, j).await?,
                                        None => log::debug!(
                                            "[{connection_id}] Ignoring {} before handshake",
                                            event.name()
                                        ),
                                    }
                                    continue;
                                }
                            };

                            let me = collaborator_for(&handshake);
                            let joined_room = match rooms
                                .join(
                                    &handshake.session_id,
                                    connection_id,
                                    me.clone(),
                                    config.max_peers_per_session,
                                )
                                .await
                            {
                                Ok(joined_room) => joined_room,
                                Err(full) => {
                                    log::warn!(
                                        "[{connection_id}] Session {} is full ({} peers); refusing {}",
                                        handshake.session_id,
                                        full.peers,
                                        handshake.user_id
                                    );
                                    stats.write().await.rejected_connections += 1;
                                    let _ = ws_sender.send(Message::Close(None)).await;
                                    return Ok(());
                                }
                            };
                            let RoomJoin { group, receiver, roster } = joined_room;
                            broadcast_rx = Some(receiver);
                            *joined = Some(Joined {
                                group: group.clone(),
                                session_id: handshake.session_id.clone(),
                                user_id: handshake.user_id.clone(),
                            });

                            // Replay the roster before announcing the newcomer
                            for peer in roster {
                                let frame = ServerEvent::CollaboratorJoined(peer).encode()?;
                                ws_sender.send(Message::Text(frame.into())).await?;
                            }
                            group.broadcast(connection_id, &ServerEvent::CollaboratorJoined(me))?;
                            stats.write().await.active_sessions = rooms.room_count().await;

                            log::info!(
                                "[{connection_id}] {} ({}) joined session {} in {:?} mode",
                                handshake.user_name,
                                handshake.user_id,
                                handshake.session_id,
                                handshake.mode
                            );
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("[{connection_id}] Connection closed");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("[{connection_id}] WebSocket error: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            // Don't echo back to sender
                            if frame.origin == connection_id {
                                continue;
                            }
                            ws_sender.send(Message::Text(frame.payload.clone().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("[{connection_id}] Lagged by {n} frames");
                            if let Some(j) = joined.as_ref() {
                                j.group.record_dropped(n);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Translate one post-handshake client event and fan it out.
    async fn relay_event(event: ClientEvent, connection_id: Uuid, joined: &Joined) -> Result<(), BoxError> {
        let outbound = match event {
            ClientEvent::CursorUpdate { position } => {
                log::trace!("[{connection_id}] cursor ({}, {})", position.x, position.y);
                ServerEvent::CursorUpdate { user_id: joined.user_id.clone(), position }
            }
            ClientEvent::StateSync(patch) => {
                log::debug!("[{connection_id}] state_sync of {} key(s)", patch.len());
                ServerEvent::StateSync(patch)
            }
            ClientEvent::ToggleVideo { enabled } => {
                Self::presence(joined, connection_id, CollaboratorPatch::video(enabled)).await
            }
            ClientEvent::ToggleMic { enabled } => {
                Self::presence(joined, connection_id, CollaboratorPatch::mic(enabled)).await
            }
            ClientEvent::AiAssistanceRequest { task } => {
                log::info!("[{connection_id}] AI assistance requested by {}: {task}", joined.user_id);
                return Ok(());
            }
            ClientEvent::Handshake(_) => return Ok(()),
        };
        joined.group.broadcast(connection_id, &outbound)?;
        Ok(())
    }

    async fn presence(joined: &Joined, connection_id: Uuid, patch: CollaboratorPatch) -> ServerEvent {
        joined.group.update_peer(&connection_id, &patch).await;
        ServerEvent::PresenceUpdate(PresenceUpdate { user_id: joined.user_id.clone(), patch })
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

fn collaborator_for(handshake: &Handshake) -> Collaborator {
    Collaborator::new(handshake.user_id.clone(), handshake.user_name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Position, SyncMode};
    use tokio::time::{timeout, Duration};

    fn handshake(user: &str) -> ClientEvent {
        ClientEvent::Handshake(Handshake {
            session_id: "room".into(),
            user_id: user.into(),
            user_name: user.to_uppercase(),
            mode: SyncMode::Express,
        })
    }

    async fn spawn_relay(config: RelayConfig) -> (Arc<RelayServer>, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = Arc::new(RelayServer::new(config));
        let serving = server.clone();
        tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });
        (server, port)
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_session, 100);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_relay_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.stats().await, RelayStats::default());
        assert_eq!(server.room_manager().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_relay_translates_cursor() {
        let (_server, port) = spawn_relay(RelayConfig::default()).await;
        let url = format!("ws://127.0.0.1:{port}/room");

        let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        a.send(Message::Text(handshake("a").encode().unwrap().into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (mut b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        b.send(Message::Text(handshake("b").encode().unwrap().into())).await.unwrap();

        // b first sees a in the roster replay
        let replay = timeout(Duration::from_secs(2), b.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(
            ServerEvent::decode(replay.to_text().unwrap()).unwrap(),
            ServerEvent::CollaboratorJoined(Collaborator::new("a", "A"))
        );

        // a hears about b
        let join = timeout(Duration::from_secs(2), a.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(
            ServerEvent::decode(join.to_text().unwrap()).unwrap(),
            ServerEvent::CollaboratorJoined(Collaborator::new("b", "B"))
        );

        let cursor = ClientEvent::CursorUpdate { position: Position::new(4.0, 2.0) };
        a.send(Message::Text(cursor.encode().unwrap().into())).await.unwrap();
        let got = timeout(Duration::from_secs(2), b.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(
            ServerEvent::decode(got.to_text().unwrap()).unwrap(),
            ServerEvent::CursorUpdate { user_id: "a".into(), position: Position::new(4.0, 2.0) }
        );
    }

    #[tokio::test]
    async fn test_relay_refuses_full_session() {
        let config = RelayConfig { max_peers_per_session: 1, ..RelayConfig::default() };
        let (server, port) = spawn_relay(config).await;
        let url = format!("ws://127.0.0.1:{port}/room");

        let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        a.send(Message::Text(handshake("a").encode().unwrap().into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (mut b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        b.send(Message::Text(handshake("b").encode().unwrap().into())).await.unwrap();

        let closed = timeout(Duration::from_secs(2), b.next()).await.unwrap();
        assert!(matches!(closed, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.stats().await.rejected_connections, 1);
    }

    #[tokio::test]
    async fn test_relay_refusal_leaves_no_room() {
        let config = RelayConfig { max_peers_per_session: 0, ..RelayConfig::default() };
        let (server, port) = spawn_relay(config).await;
        let url = format!("ws://127.0.0.1:{port}/room");

        let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        a.send(Message::Text(handshake("a").encode().unwrap().into())).await.unwrap();

        let closed = timeout(Duration::from_secs(2), a.next()).await.unwrap();
        assert!(matches!(closed, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.stats().await.rejected_connections, 1);
        assert_eq!(server.room_manager().room_count().await, 0);
    }
}
