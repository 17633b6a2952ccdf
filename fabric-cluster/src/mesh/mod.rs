//! Peer-to-peer reliable channels between controller nodes.
//!
//! The mesh carries Raft RPCs and the controller's own control messages
//! (apply-log-entry, join, remove). It owns one channel per remote address,
//! reconnecting when a channel has closed, and dispatches inbound requests to
//! the [`ReceiveHandler`] bound for their content type.
//!
//! A channel starts with a hello exchange: the dialer sends its server id
//! and advertised address as headers, and the listener answers with its
//! own. Inbound channels are registered under the remote's advertised
//! address so a later dial to that address reuses them.

mod channel;
pub mod message;

pub use channel::Channel;
pub use message::{content_type, header, interpret_reply, Message};

use crate::error::{ClusterError, ClusterResult};
use crate::trace::{ChannelPeekHandler, SourceMatcher, ToggleResult, TracePublisher};
use async_trait::async_trait;
use channel::FramedStream;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Deadline for the hello exchange on an accepted connection.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Handles requests of one content type.
#[async_trait]
pub trait ReceiveHandler: Send + Sync + 'static {
    /// Process `message`, replying on `channel` if the request expects it.
    async fn handle(&self, message: Message, channel: Channel);
}

/// Content type to handler table, fixed before the mesh starts listening.
#[derive(Default, Clone)]
pub struct Bindings {
    handlers: HashMap<i32, Arc<dyn ReceiveHandler>>,
}

impl Bindings {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `content_type`, replacing any earlier binding.
    pub fn bind(&mut self, content_type: i32, handler: impl ReceiveHandler) -> &mut Self {
        self.handlers.insert(content_type, Arc::new(handler));
        self
    }

    /// Bind a shared handler.
    pub fn bind_shared(&mut self, content_type: i32, handler: Arc<dyn ReceiveHandler>) -> &mut Self {
        self.handlers.insert(content_type, handler);
        self
    }

    fn get(&self, content_type: i32) -> Option<Arc<dyn ReceiveHandler>> {
        self.handlers.get(&content_type).cloned()
    }
}

/// A connected mesh peer.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Remote server id, learned from its hello.
    pub id: String,
    /// Address the peer is registered under.
    pub address: String,
    /// Channel to the peer.
    pub channel: Channel,
}

/// The mesh. Cheap to clone.
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

struct MeshInner {
    server_id: String,
    advertise_addr: String,
    bindings: Arc<Bindings>,
    peers: DashMap<String, Peer>,
    dialing: DashMap<String, Arc<Mutex<()>>>,
    tracer: Option<TracePublisher>,
    shutdown: watch::Sender<bool>,
}

impl Mesh {
    /// Create a mesh for `server_id`, reachable at `advertise_addr`.
    pub fn new(
        server_id: impl Into<String>,
        advertise_addr: impl Into<String>,
        bindings: Bindings,
        tracer: Option<TracePublisher>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(MeshInner {
                server_id: server_id.into(),
                advertise_addr: advertise_addr.into(),
                bindings: Arc::new(bindings),
                peers: DashMap::new(),
                dialing: DashMap::new(),
                tracer,
                shutdown,
            }),
        }
    }

    /// Local server id.
    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// Local advertised address.
    pub fn advertise_addr(&self) -> &str {
        &self.inner.advertise_addr
    }

    /// Start accepting peer connections on `bind_addr`.
    ///
    /// Returns the bound address (useful when binding port 0).
    pub async fn listen(&self, bind_addr: &str) -> ClusterResult<SocketAddr> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ClusterError::connection(bind_addr, e))?;
        let local = listener.local_addr()?;

        tracing::info!(server_id = %self.inner.server_id, addr = %local, "mesh listening");

        let mesh = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = shutdown.wait_for(|set| *set) => break,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        let mesh = mesh.clone();
                        tokio::spawn(async move {
                            if let Err(e) = mesh.accept_peer(stream).await {
                                tracing::warn!(%remote, error = %e, "mesh hello failed");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "mesh accept failed"),
                }
            }
            tracing::debug!(addr = %local, "mesh listener stopped");
        });

        Ok(local)
    }

    /// Return the live channel to `address`, dialing one if needed.
    pub async fn get_or_connect_peer(
        &self,
        address: &str,
        timeout: Duration,
    ) -> ClusterResult<Peer> {
        if let Some(peer) = self.get_peer(address) {
            return Ok(peer);
        }

        let lock = self
            .inner
            .dialing
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            // Another task may have connected while we waited.
            match self.get_peer(address) {
                Some(peer) => Ok(peer),
                None => self.connect(address, timeout).await,
            }
        };

        // Last one out drops the dial lock.
        drop(lock);
        self.inner
            .dialing
            .remove_if(address, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn connect(&self, address: &str, timeout: Duration) -> ClusterResult<Peer> {
        let peer = tokio::time::timeout(timeout, self.dial(address))
            .await
            .map_err(|_| ClusterError::Timeout {
                op: "mesh connect",
                timeout,
            })??;

        tracing::info!(peer_id = %peer.id, addr = %address, "mesh peer connected");
        self.inner.peers.insert(address.to_string(), peer.clone());
        Ok(peer)
    }

    /// The live peer registered under `address`.
    pub fn get_peer(&self, address: &str) -> Option<Peer> {
        let peer = self.inner.peers.get(address).map(|p| p.clone())?;
        if peer.channel.is_closed() {
            self.inner
                .peers
                .remove_if(address, |_, p| p.channel.is_closed());
            return None;
        }
        Some(peer)
    }

    /// All live peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.peers.retain(|_, p| !p.channel.is_closed());
        self.inner.peers.iter().map(|p| p.clone()).collect()
    }

    /// Enable or disable tracing on every channel whose name matches.
    pub fn toggle_tracing(&self, matcher: &SourceMatcher, enable: bool) -> Vec<ToggleResult> {
        self.peers()
            .iter()
            .filter_map(|p| p.channel.peek_handler().map(|h| h.toggle(matcher, enable)))
            .collect()
    }

    /// Stop listening and close every channel.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        for peer in self.inner.peers.iter() {
            peer.channel.close();
        }
        self.inner.peers.clear();
        tracing::debug!(server_id = %self.inner.server_id, "mesh shut down");
    }

    fn hello(&self) -> Message {
        Message::new(content_type::MESH_HELLO, Vec::new())
            .with_header(header::PEER_ID, self.inner.server_id.as_str())
            .with_header(header::PEER_ADDR, self.inner.advertise_addr.as_str())
    }

    fn framed(stream: TcpStream) -> FramedStream {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(message::MAX_FRAME_LENGTH)
            .new_codec();
        Framed::new(stream, codec)
    }

    fn open_channel(&self, framed: FramedStream, peer_id: &str, peer_addr: &str) -> Channel {
        let peek = self.inner.tracer.as_ref().map(|tracer| {
            Arc::new(ChannelPeekHandler::new(
                self.inner.server_id.clone(),
                peer_id.to_string(),
                tracer.clone(),
            ))
        });
        Channel::spawn(
            framed,
            peer_id.to_string(),
            peer_addr.to_string(),
            Arc::clone(&self.inner.bindings),
            peek,
            self.inner.shutdown.subscribe(),
        )
    }

    async fn dial(&self, address: &str) -> ClusterResult<Peer> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ClusterError::connection(address, e))?;
        stream.set_nodelay(true)?;
        let mut framed = Self::framed(stream);

        send_frame(&mut framed, &self.hello(), address).await?;
        let reply = read_frame(&mut framed, address).await?;
        let (peer_id, _) = parse_hello(&reply)?;

        let channel = self.open_channel(framed, &peer_id, address);
        Ok(Peer {
            id: peer_id,
            address: address.to_string(),
            channel,
        })
    }

    async fn accept_peer(&self, stream: TcpStream) -> ClusterResult<()> {
        let remote = stream.peer_addr()?.to_string();
        stream.set_nodelay(true)?;
        let mut framed = Self::framed(stream);

        let hello = tokio::time::timeout(HELLO_TIMEOUT, read_frame(&mut framed, &remote))
            .await
            .map_err(|_| ClusterError::Timeout {
                op: "mesh hello",
                timeout: HELLO_TIMEOUT,
            })??;
        let (peer_id, peer_addr) = parse_hello(&hello)?;

        let reply = Message {
            reply_for: Some(hello.sequence),
            ..self.hello()
        };
        send_frame(&mut framed, &reply, &remote).await?;

        let channel = self.open_channel(framed, &peer_id, &peer_addr);
        tracing::info!(%peer_id, %peer_addr, %remote, "mesh peer accepted");

        let peer = Peer {
            id: peer_id,
            address: peer_addr.clone(),
            channel,
        };
        let replace = self
            .inner
            .peers
            .get(&peer_addr)
            .map(|existing| existing.channel.is_closed())
            .unwrap_or(true);
        if replace {
            self.inner.peers.insert(peer_addr, peer);
        }
        Ok(())
    }
}

impl fmt::Debug for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mesh")
            .field("server_id", &self.inner.server_id)
            .field("advertise_addr", &self.inner.advertise_addr)
            .field("peers", &self.inner.peers.len())
            .finish()
    }
}

async fn send_frame(framed: &mut FramedStream, message: &Message, addr: &str) -> ClusterResult<()> {
    framed
        .send(message.encode()?)
        .await
        .map_err(|e| ClusterError::connection(addr, e))
}

async fn read_frame(framed: &mut FramedStream, addr: &str) -> ClusterResult<Message> {
    let frame = framed
        .next()
        .await
        .ok_or_else(|| ClusterError::connection(addr, "closed during hello"))?
        .map_err(|e| ClusterError::connection(addr, e))?;
    Message::decode(&frame)
}

fn parse_hello(message: &Message) -> ClusterResult<(String, String)> {
    if message.content_type != content_type::MESH_HELLO {
        return Err(ClusterError::Protocol(format!(
            "expected mesh hello, got content type {}",
            message.content_type
        )));
    }
    let id = message
        .string_header(header::PEER_ID)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ClusterError::Protocol("mesh hello missing peer id".to_string()))?;
    let addr = message
        .string_header(header::PEER_ADDR)
        .filter(|addr| !addr.is_empty())
        .ok_or_else(|| ClusterError::Protocol("mesh hello missing peer address".to_string()))?;
    Ok((id, addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{ChannelSink, ChannelTraceEvent};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct Echo;

    #[async_trait]
    impl ReceiveHandler for Echo {
        async fn handle(&self, message: Message, channel: Channel) {
            let reply = message.reply(content_type::SUCCESS_RESPONSE, message.body.clone());
            let _ = channel.send(reply).await;
        }
    }

    async fn free_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").to_string()
    }

    async fn start(id: &str, bindings: Bindings) -> (Mesh, String) {
        let addr = free_addr().await;
        let mesh = Mesh::new(id, addr.clone(), bindings, None);
        mesh.listen(&addr).await.expect("listen");
        (mesh, addr)
    }

    fn echo_bindings() -> Bindings {
        let mut bindings = Bindings::new();
        bindings.bind(content_type::NEW_LOG_ENTRY, Echo);
        bindings
    }

    #[tokio::test]
    async fn test_request_reply_over_mesh() {
        let (server, server_addr) = start("ctrl-b", echo_bindings()).await;
        let (client, _) = start("ctrl-a", Bindings::new()).await;

        let peer = client
            .get_or_connect_peer(&server_addr, Duration::from_secs(2))
            .await
            .expect("connect");
        assert_eq!(peer.id, "ctrl-b");

        let reply = peer
            .channel
            .send_for_reply(
                Message::new(content_type::NEW_LOG_ENTRY, b"ping".to_vec()),
                Duration::from_secs(2),
            )
            .await
            .expect("reply");
        assert_eq!(reply.content_type, content_type::SUCCESS_RESPONSE);
        assert_eq!(reply.body, b"ping");

        // Connecting again reuses the channel.
        let again = client
            .get_or_connect_peer(&server_addr, Duration::from_secs(2))
            .await
            .expect("reuse");
        assert_eq!(again.channel.peer_id(), "ctrl-b");
        assert_eq!(client.peers().len(), 1);
        assert!(client.inner.dialing.is_empty());

        server.shutdown();
        client.shutdown();
    }

    #[tokio::test]
    async fn test_inbound_channel_registered_under_advertised_address() {
        let (server, server_addr) = start("ctrl-b", Bindings::new()).await;
        let (client, client_addr) = start("ctrl-a", echo_bindings()).await;

        client
            .get_or_connect_peer(&server_addr, Duration::from_secs(2))
            .await
            .expect("connect");

        let mut found = None;
        for _ in 0..50 {
            found = server.get_peer(&client_addr);
            if found.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let peer = found.expect("inbound peer registered");
        assert_eq!(peer.id, "ctrl-a");

        // The server can issue requests back over the inbound channel.
        let reply = peer
            .channel
            .send_for_reply(
                Message::new(content_type::NEW_LOG_ENTRY, b"back".to_vec()),
                Duration::from_secs(2),
            )
            .await
            .expect("reply");
        assert_eq!(reply.body, b"back");

        server.shutdown();
        client.shutdown();
    }

    #[tokio::test]
    async fn test_unbound_content_type_gets_error_reply() {
        let (server, server_addr) = start("ctrl-b", Bindings::new()).await;
        let (client, _) = start("ctrl-a", Bindings::new()).await;

        let peer = client
            .get_or_connect_peer(&server_addr, Duration::from_secs(2))
            .await
            .expect("connect");
        let reply = peer
            .channel
            .send_for_reply(
                Message::new(content_type::JOIN_REQUEST, Vec::new()),
                Duration::from_secs(2),
            )
            .await
            .expect("reply");
        assert!(matches!(
            interpret_reply(&reply),
            Err(ClusterError::Remote(text)) if text.contains("no handler")
        ));

        server.shutdown();
        client.shutdown();
    }

    #[tokio::test]
    async fn test_closed_channel_is_replaced() {
        let (server, server_addr) = start("ctrl-b", echo_bindings()).await;
        let (client, _) = start("ctrl-a", Bindings::new()).await;

        let first = client
            .get_or_connect_peer(&server_addr, Duration::from_secs(2))
            .await
            .expect("connect");
        first.channel.close();
        assert!(client.get_peer(&server_addr).is_none());

        let second = client
            .get_or_connect_peer(&server_addr, Duration::from_secs(2))
            .await
            .expect("reconnect");
        assert!(!second.channel.is_closed());

        let err = first
            .channel
            .send(Message::new(content_type::NEW_LOG_ENTRY, Vec::new()))
            .await
            .expect_err("closed channel");
        assert!(matches!(err, ClusterError::Connection { .. }));

        server.shutdown();
        client.shutdown();
    }

    #[tokio::test]
    async fn test_connect_to_dead_address_fails() {
        let addr = free_addr().await;
        let mesh = Mesh::new("ctrl-a", "127.0.0.1:1", Bindings::new(), None);
        let err = mesh
            .get_or_connect_peer(&addr, Duration::from_secs(2))
            .await
            .expect_err("nothing listening");
        assert!(matches!(
            err,
            ClusterError::Connection { .. } | ClusterError::Timeout { .. }
        ));
        assert!(mesh.inner.dialing.is_empty());
    }

    struct Collect(mpsc::UnboundedSender<ChannelTraceEvent>);

    #[async_trait]
    impl ReceiveHandler for Collect {
        async fn handle(&self, message: Message, _channel: Channel) {
            if let Ok(event) = serde_json::from_slice::<ChannelTraceEvent>(&message.body) {
                let _ = self.0.send(event);
            }
        }
    }

    #[tokio::test]
    async fn test_traced_channel_ships_events_to_collector() {
        let (events, mut received) = mpsc::unbounded_channel();
        let mut collector_bindings = Bindings::new();
        collector_bindings.bind(content_type::TRACE_EVENT, Collect(events));
        let (collector, collector_addr) = start("collector", collector_bindings).await;

        let shipper = Mesh::new("ctrl-a", "127.0.0.1:1", Bindings::new(), None);
        let uplink = shipper
            .get_or_connect_peer(&collector_addr, Duration::from_secs(2))
            .await
            .expect("connect collector");
        let publisher = TracePublisher::spawn(ChannelSink::new(uplink.channel), 16);

        let (server, server_addr) = start("ctrl-b", echo_bindings()).await;
        let traced = Mesh::new("ctrl-a", "127.0.0.1:2", Bindings::new(), Some(publisher));
        let peer = traced
            .get_or_connect_peer(&server_addr, Duration::from_secs(2))
            .await
            .expect("connect");

        let toggled = traced.toggle_tracing(&SourceMatcher::Exact("ctrl-b".into()), true);
        assert_eq!(toggled.len(), 1);
        assert!(toggled[0].matched && toggled[0].new_state);

        peer.channel
            .send_for_reply(
                Message::new(content_type::NEW_LOG_ENTRY, b"ping".to_vec()),
                Duration::from_secs(2),
            )
            .await
            .expect("reply");

        let event = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert_eq!(event.identity, "ctrl-a");
        assert_eq!(event.channel, "ctrl-b");
        assert!(!event.is_rx);
        assert_eq!(event.content_type, content_type::NEW_LOG_ENTRY);
        assert_eq!(event.length, 4);

        traced.shutdown();
        server.shutdown();
        shipper.shutdown();
        collector.shutdown();
    }

    #[test]
    fn test_parse_hello_requires_headers() {
        let missing = Message::new(content_type::MESH_HELLO, Vec::new());
        assert!(parse_hello(&missing).is_err());

        let wrong = Message::new(content_type::VOTE, Vec::new());
        assert!(parse_hello(&wrong).is_err());

        let ok = Message::new(content_type::MESH_HELLO, Vec::new())
            .with_header(header::PEER_ID, "a")
            .with_header(header::PEER_ADDR, "h:1");
        assert_eq!(
            parse_hello(&ok).expect("hello"),
            ("a".to_string(), "h:1".to_string())
        );
    }
}
