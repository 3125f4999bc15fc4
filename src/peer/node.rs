//! # Peer Node - Connection Manager
//!
//! A [`PeerNode`] owns one identity and one listening socket, and keeps a
//! registry of every peer it has completed a handshake with.
//!
//! ## Handshake
//!
//! Both directions start with an `introduce` exchange before any other
//! traffic:
//!
//! ```text
//! Initiator                              Responder
//!    |  {"type":"introduce","username":"bob"}\n   |
//!    |------------------------------------------>|  admission check
//!    |  {"type":"introduce","username":"alice"}\n |  register "bob"
//!    |<------------------------------------------|
//!    register "alice"
//! ```
//!
//! ## Tasks
//!
//! - one acceptor task per node
//! - one reader task (session) per established connection, delivering
//!   inbound frames in order
//! - one writer task per established connection (see [`super::session`])
//!
//! Outbound operations run on the caller's task and only touch the registry
//! long enough to copy a handle out.
//!
//! ## Delivery
//!
//! Inbound events go to the channel returned by [`PeerNode::subscribe`].
//! Events from one connection arrive in the order they were sent; there is
//! no ordering across connections.

use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};

use crate::common::config::{IdentityConfig, NetworkConfig, NodeConfig};
use crate::common::connection::{encode_frame, fill, FrameBuffer, ReadStatus};
use crate::common::messages::{EncodeError, Message};

use super::error::NodeError;
use super::inbound::{process_inbound, Inbound};
use super::registry::{Direction, Insert, PeerHandle, PeerRegistry};
use super::session::{establish, read_introduction, Session};

/// Decides whether a peer that introduced itself may connect.
pub type AdmissionFn = Arc<dyn Fn(&str, SocketAddr) -> bool + Send + Sync>;

/// Pause after a failed `accept` so a persistent error can't spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Peer connection manager for one local identity.
///
/// All fields are shared handles, so spawned tasks work on a cheap clone
/// (see `clone_arc`).
#[derive(Clone)]
pub struct PeerNode {
    /// Our display name and bind address
    identity: IdentityConfig,

    /// Timeouts and limits
    network: NetworkConfig,

    /// Established peers: name -> connection handle
    registry: PeerRegistry,

    /// Source of node-local connection ids
    next_connection_id: Arc<AtomicU64>,

    /// Address the acceptor is bound to, once started
    listen_addr: Arc<Mutex<Option<SocketAddr>>>,

    /// `true` once shutdown has begun
    shutdown_tx: Arc<watch::Sender<bool>>,

    /// Where inbound events are delivered (None = log them)
    inbound: Arc<RwLock<Option<mpsc::UnboundedSender<Inbound>>>>,

    /// Connection admission policy (default: accept everyone)
    admission: Arc<RwLock<AdmissionFn>>,
}

impl PeerNode {
    /// Create a node. Nothing is bound until [`PeerNode::start_server`].
    ///
    /// # Example
    /// ```ignore
    /// let node = PeerNode::new(NodeConfig::new("alice", "127.0.0.1", 5001));
    /// let mut inbound = node.subscribe();
    /// node.start_server().await?;
    /// ```
    pub fn new(config: NodeConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let accept_all: AdmissionFn = Arc::new(|_: &str, _: SocketAddr| true);
        let registry = PeerRegistry::new(&config.identity.username);

        Self {
            identity: config.identity,
            network: config.network,
            registry,
            next_connection_id: Arc::new(AtomicU64::new(1)),
            listen_addr: Arc::new(Mutex::new(None)),
            shutdown_tx: Arc::new(shutdown_tx),
            inbound: Arc::new(RwLock::new(None)),
            admission: Arc::new(RwLock::new(accept_all)),
        }
    }

    pub fn identity(&self) -> &IdentityConfig {
        &self.identity
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn username(&self) -> &str {
        &self.identity.username
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    /// Address the listener is bound to, if `start_server` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .listen_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Route inbound events to a new channel and return its receiver.
    ///
    /// Replaces any previous subscriber. Without one, events are logged.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Inbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.write().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Install the admission policy consulted for every inbound introduction.
    ///
    /// The policy runs on the connection's task and must not block for long.
    pub fn set_admission<F>(&self, policy: F)
    where
        F: Fn(&str, SocketAddr) -> bool + Send + Sync + 'static,
    {
        let policy: AdmissionFn = Arc::new(policy);
        *self.admission.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    // ========================================================================
    // LISTENER
    // ========================================================================

    /// Bind the configured address and spawn the acceptor task.
    ///
    /// Returns the bound address (useful when the configured port is 0).
    pub async fn start_server(&self) -> Result<SocketAddr, NodeError> {
        if !self.is_running() {
            return Err(NodeError::ShuttingDown);
        }
        if let Some(addr) = self.local_addr() {
            return Err(NodeError::AlreadyListening(addr));
        }

        let address = self.identity.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| NodeError::Bind {
                address: address.clone(),
                source,
            })?;
        let local = listener.local_addr()?;

        *self
            .listen_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(local);

        info!("📡 {} listening on {}", self.identity.username, local);

        let node = self.clone_arc();
        tokio::spawn(async move {
            node.accept_loop(listener).await;
        });

        Ok(local)
    }

    /// Accept inbound sockets until shutdown, one session task per socket.
    async fn accept_loop(&self, listener: TcpListener) {
        let mut shutdown = self.shutdown_tx.subscribe();

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        debug!("🔗 Accepted connection from {}", addr);
                        let node = self.clone_arc();
                        tokio::spawn(async move {
                            node.handle_connection(socket, addr).await;
                        });
                    }
                    Err(e) => {
                        error!("❌ Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        info!("🛑 Listener for {} closed", self.identity.username);
    }

    /// Responder side of the handshake, then the read loop.
    async fn handle_connection(&self, mut socket: TcpStream, addr: SocketAddr) {
        let mut frames = FrameBuffer::new(self.network.max_frame_bytes);

        let peer_name = match tokio::time::timeout(
            self.network.handshake_timeout(),
            read_introduction(&mut socket, &mut frames),
        )
        .await
        {
            Ok(Ok(name)) => name,
            Ok(Err(reason)) => {
                warn!(
                    "⚠️  Did not receive valid introduction from {}: {}. Closing connection.",
                    addr, reason
                );
                return;
            }
            Err(_) => {
                warn!(
                    "⚠️  No introduction from {} within {:?}",
                    addr,
                    self.network.handshake_timeout()
                );
                return;
            }
        };

        info!("🤝 Connection request from {} at {}", peer_name, addr);

        let admission = self
            .admission
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if !admission(&peer_name, addr) {
            info!("🚫 Connection rejected from {} at {}", peer_name, addr);
            return;
        }

        let reply = match encode_frame(&Message::introduce(self.identity.username.clone())) {
            Ok(frame) => frame,
            Err(e) => {
                error!("❌ Could not encode introduction: {}", e);
                return;
            }
        };

        match self
            .register(peer_name.clone(), addr, Direction::Inbound, socket, frames, Some(reply))
            .await
        {
            Ok(()) => info!("✅ Connection accepted from {} at {}", peer_name, addr),
            Err(e) => warn!("⚠️  Could not register {}: {}", peer_name, e),
        }
    }

    // ========================================================================
    // OUTBOUND CONNECTIONS
    // ========================================================================

    /// Dial a peer and perform the initiator handshake.
    ///
    /// Returns the peer's display name. Failures are logged and leave no
    /// registry entry.
    pub async fn connect_to_peer(&self, host: &str, port: u16) -> Result<String, NodeError> {
        let address = format!("{}:{}", host, port);
        match self.dial(&address).await {
            Ok(name) => {
                info!("🤝 Connected to peer {} at {}", name, address);
                Ok(name)
            }
            Err(e) => {
                error!("❌ Connecting to peer {}: {}", address, e);
                Err(e)
            }
        }
    }

    async fn dial(&self, address: &str) -> Result<String, NodeError> {
        if !self.is_running() {
            return Err(NodeError::ShuttingDown);
        }

        let connect = TcpStream::connect(address);
        let mut stream = tokio::time::timeout(self.network.connect_timeout(), connect)
            .await
            .map_err(|_| NodeError::ConnectTimeout(address.to_string()))?
            .map_err(|source| NodeError::Connect {
                address: address.to_string(),
                source,
            })?;
        let addr = stream.peer_addr()?;

        let intro = encode_frame(&Message::introduce(self.identity.username.clone()))?;
        let mut frames = FrameBuffer::new(self.network.max_frame_bytes);

        let handshake = async {
            stream.write_all(&intro).await.map_err(|e| e.to_string())?;
            read_introduction(&mut stream, &mut frames).await
        };
        let peer_name = tokio::time::timeout(self.network.handshake_timeout(), handshake)
            .await
            .map_err(|_| NodeError::HandshakeTimeout(address.to_string()))?
            .map_err(|reason| NodeError::Handshake {
                address: address.to_string(),
                reason,
            })?;

        self.register(peer_name.clone(), addr, Direction::Outbound, stream, frames, None)
            .await?;
        Ok(peer_name)
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    /// Publish the peer in the registry, start the writer, spawn the reader.
    ///
    /// `first_frame` is queued ahead of anything else the node sends and is
    /// written even if the connection does not win the registry entry. A
    /// previous connection under the same name is closed if this one
    /// replaces it; see [`PeerRegistry::insert`] for which one survives.
    async fn register(
        &self,
        name: String,
        addr: SocketAddr,
        direction: Direction,
        stream: TcpStream,
        frames: FrameBuffer,
        first_frame: Option<Vec<u8>>,
    ) -> Result<(), NodeError> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let Session {
            handle,
            writer,
            reader,
            frames,
            close,
        } = establish(
            name.clone(),
            connection_id,
            addr,
            direction,
            stream,
            frames,
            &self.network,
        );

        if let Some(frame) = first_frame {
            handle.send_frame(frame, self.network.write_timeout()).await?;
        }

        // Registered before the writer starts, so the peer is listed by the
        // time our introduction reaches it.
        let outcome = self.registry.insert(handle).await;
        writer.spawn();

        match outcome {
            Insert::Added => {}
            Insert::Replaced(evicted) => {
                if evicted.direction() == direction {
                    warn!(
                        "⚠️  {} connected again from {}; closing previous connection from {}",
                        name,
                        addr,
                        evicted.addr()
                    );
                } else {
                    debug!(
                        "🔁 Crossed connections with {}; keeping the {:?} one",
                        name, direction
                    );
                }
                evicted.close();
            }
            Insert::Declined(handle) => {
                debug!(
                    "🔁 Already connected to {} in the other direction; dropping {:?} connection from {}",
                    name,
                    handle.direction(),
                    addr
                );
                // Dropping the last handle lets the writer flush and close.
                return Ok(());
            }
        }

        // Shutdown may have drained the registry while we were handshaking.
        if !self.is_running() {
            if let Some(handle) = self.registry.remove_if_current(&name, connection_id).await {
                handle.close();
            }
            return Err(NodeError::ShuttingDown);
        }

        let node = self.clone_arc();
        tokio::spawn(async move {
            node.run_session(name, connection_id, reader, frames, close)
                .await;
        });

        Ok(())
    }

    /// Read frames from an established connection until it closes.
    async fn run_session(
        &self,
        peer_name: String,
        connection_id: u64,
        mut reader: OwnedReadHalf,
        mut frames: FrameBuffer,
        close: Arc<Notify>,
    ) {
        // Shutdown reaches sessions through `close`, after the offline notice
        // has been queued.
        'session: loop {
            loop {
                match frames.next_frame() {
                    Ok(Some(frame)) => self.deliver(process_inbound(&frame, &peer_name)),
                    Ok(None) => break,
                    Err(e) => {
                        error!("❌ Dropping {}: {}", peer_name, e);
                        break 'session;
                    }
                }
            }

            tokio::select! {
                read = fill(&mut reader, &mut frames) => match read {
                    Ok(ReadStatus::Data(n)) => debug!("📥 {} bytes from {}", n, peer_name),
                    Ok(ReadStatus::Closed) => {
                        info!("🔌 Connection closed by {}", peer_name);
                        break;
                    }
                    Err(e) => {
                        error!("❌ Listening to peer {}: {}", peer_name, e);
                        break;
                    }
                },
                _ = close.notified() => {
                    debug!("🔌 Closing connection to {}", peer_name);
                    break;
                }
            }
        }

        if self
            .registry
            .remove_if_current(&peer_name, connection_id)
            .await
            .is_some()
        {
            info!("👋 {} disconnected", peer_name);
        }
    }

    /// Hand one inbound event to the subscriber, or log it.
    fn deliver(&self, event: Inbound) {
        let sink = self
            .inbound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let undelivered = match sink {
            Some(tx) => tx.send(event).err().map(|e| e.0),
            None => Some(event),
        };
        if let Some(event) = undelivered {
            info!("{}", event);
        }
    }

    // ========================================================================
    // SENDING
    // ========================================================================

    /// Send a `chat` message to `recipient`.
    pub async fn send_chat_message(&self, recipient: &str, content: &str) -> Result<(), NodeError> {
        self.send_with_kind(recipient, "chat", content, None).await
    }

    /// Send `{type: kind, sender, recipient, content}` merged with `extra_fields`.
    ///
    /// Extra fields override the generated ones. A known kind whose fields
    /// end up incomplete fails with [`NodeError::Encode`].
    pub async fn send_with_kind(
        &self,
        recipient: &str,
        kind: &str,
        content: &str,
        extra_fields: Option<Map<String, Value>>,
    ) -> Result<(), NodeError> {
        let mut fields = Map::new();
        fields.insert("type".into(), Value::from(kind));
        fields.insert("sender".into(), Value::from(self.identity.username.as_str()));
        fields.insert("recipient".into(), Value::from(recipient));
        fields.insert("content".into(), Value::from(content));
        if let Some(extra) = extra_fields {
            fields.extend(extra);
        }

        let result = match Message::from_fields(fields) {
            Ok(message) => self.send_to(recipient, &message).await,
            Err(source) => Err(EncodeError::Schema {
                kind: kind.to_string(),
                source,
            }
            .into()),
        };
        self.report_send(recipient, result)
    }

    /// Send an already-built message to `recipient` as is.
    pub async fn send_structured(&self, recipient: &str, message: &Message) -> Result<(), NodeError> {
        let result = self.send_to(recipient, message).await;
        self.report_send(recipient, result)
    }

    async fn send_to(&self, recipient: &str, message: &Message) -> Result<(), NodeError> {
        if !self.is_running() {
            return Err(NodeError::ShuttingDown);
        }
        let peer = self
            .registry
            .get(recipient)
            .await
            .ok_or_else(|| NodeError::PeerNotFound(recipient.to_string()))?;
        let frame = encode_frame(message)?;
        peer.send_frame(frame, self.network.write_timeout()).await?;
        debug!("📤 Sent {} to {}", message.kind(), recipient);
        Ok(())
    }

    fn report_send(&self, recipient: &str, result: Result<(), NodeError>) -> Result<(), NodeError> {
        if let Err(e) = &result {
            error!("❌ Sending message to {}: {}", recipient, e);
        }
        result
    }

    /// Tell every connected peer our new status. Returns how many were reached.
    pub async fn broadcast_presence(&self, status: &str) -> usize {
        let message = Message::presence(self.identity.username.clone(), status);
        self.broadcast(&message).await
    }

    /// Send one `group_chat` to every connected peer. Returns how many were reached.
    pub async fn broadcast_group_chat(&self, group: &str, content: &str) -> usize {
        let message = Message::group_chat(self.identity.username.clone(), group, content);
        self.broadcast(&message).await
    }

    /// Queue `message` on every registered connection.
    ///
    /// A failure for one peer is logged and does not stop the rest.
    async fn broadcast(&self, message: &Message) -> usize {
        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                error!("❌ Could not encode {}: {}", message.kind(), e);
                return 0;
            }
        };

        let mut reached = 0;
        for peer in self.registry.handles().await {
            match peer.send_frame(frame.clone(), self.network.write_timeout()).await {
                Ok(()) => reached += 1,
                Err(e) => error!("❌ Broadcasting to {}: {}", peer.name(), e),
            }
        }
        debug!("📤 Broadcast {} to {} peer(s)", message.kind(), reached);
        reached
    }

    // ========================================================================
    // REGISTRY QUERIES
    // ========================================================================

    /// Sorted snapshot of connected peer names.
    pub async fn list_peers(&self) -> Vec<String> {
        self.registry.names().await
    }

    /// Remote address of a connected peer.
    pub async fn peer_addr(&self, name: &str) -> Option<SocketAddr> {
        self.registry.get(name).await.map(|peer| peer.addr())
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    /// Announce `offline`, close every connection and stop the listener.
    ///
    /// Safe to call more than once. Returns without waiting for the reader,
    /// writer, and acceptor tasks; they observe the closed sockets and exit.
    pub async fn shutdown(&self) {
        let was_running = !self.shutdown_tx.send_replace(true);

        self.broadcast_presence("offline").await;

        let peers: Vec<PeerHandle> = self.registry.drain().await;
        for peer in &peers {
            debug!("🔌 Closing connection to {}", peer.name());
            peer.close();
        }

        if was_running {
            info!(
                "🛑 Network shutdown complete for {} ({} connection(s) closed)",
                self.identity.username,
                peers.len()
            );
        }
    }

    /// Create an Arc-wrapped clone of this node for spawned tasks.
    fn clone_arc(&self) -> Arc<Self> {
        Arc::new(self.clone())
    }
}
