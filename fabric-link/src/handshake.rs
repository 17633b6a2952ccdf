//! Hello/ping exchange used to discover and verify a remote router.
//!
//! The free functions are the individual protocol steps. Each send or receive
//! is bounded by [`IO_TIMEOUT`] and never retried; retry policy belongs to the
//! caller. [`HandshakeSession`] strings the steps together for one link
//! establishment attempt.
//!
//! A socket must have a single reader. Sends on a shared socket must be
//! serialized by the caller.

use crate::error::{LinkError, LinkResult};
use crate::message::{read_reply_for, Message, MessageType, HELLO_SEQUENCE, NO_REPLY_FOR};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Read and write deadline for a single datagram.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest datagram the transport can deliver.
pub const MAX_PACKET_SIZE: usize = 65507;

/// Identity token a router announces in its hello.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkId(String);

impl LinkId {
    /// Wrap an identity token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receives validated hello frames.
pub trait HelloHandler {
    /// Called with the identity a peer announced.
    fn handle_hello(&mut self, link_id: LinkId, peer: SocketAddr);
}

/// Receives validated ping frames.
pub trait MessageHandler {
    /// Called with the ping's sequence and the sequence it answers.
    fn handle_ping(&mut self, sequence: i32, reply_for: i32, peer: SocketAddr);
}

/// Send a hello announcing `local_id` to `peer`.
pub async fn send_hello(local_id: &LinkId, socket: &UdpSocket, peer: SocketAddr) -> LinkResult<()> {
    let data = Message::hello(local_id.token()).encode()?;
    write_datagram(socket, &data, peer, "write hello").await
}

/// Send a ping to `peer`. `reply_for` is [`NO_REPLY_FOR`] unless answering a
/// previous ping.
pub async fn send_ping(
    sequence: i32,
    socket: &UdpSocket,
    peer: SocketAddr,
    reply_for: i32,
) -> LinkResult<()> {
    let data = Message::ping(sequence, reply_for).encode()?;
    write_datagram(socket, &data, peer, "write ping").await
}

/// Read and decode a single datagram.
///
/// Decode failures carry the sender address. A bad datagram only fails this
/// call; the socket remains usable.
pub async fn receive(socket: &UdpSocket) -> LinkResult<(Message, SocketAddr)> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let (n, peer) = timeout(IO_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| LinkError::Timeout {
            op: "read",
            timeout: IO_TIMEOUT,
        })??;

    let message = Message::decode(&buf[..n]).map_err(|e| {
        tracing::warn!(%peer, error = %e, "error decoding link message");
        e.with_peer(peer)
    })?;

    tracing::trace!(
        %peer,
        sequence = message.sequence,
        message_type = ?message.message_type,
        "received link message"
    );
    Ok((message, peer))
}

/// Validate a hello and hand its identity to `handler`.
pub fn dispatch_hello(
    message: &Message,
    peer: SocketAddr,
    handler: &mut impl HelloHandler,
) -> LinkResult<()> {
    if message.message_type != MessageType::Hello {
        return Err(LinkError::PeerProtocol {
            peer,
            reason: format!("expected hello, not [{:?}]", message.message_type),
        });
    }
    if message.sequence != HELLO_SEQUENCE {
        return Err(LinkError::PeerProtocol {
            peer,
            reason: format!("hello expects sequence -1, got {}", message.sequence),
        });
    }
    if !message.is_single_fragment() {
        return Err(LinkError::PeerProtocol {
            peer,
            reason: "hello expects single fragment".to_string(),
        });
    }

    let token = String::from_utf8_lossy(&message.payload).into_owned();
    handler.handle_hello(LinkId::new(token), peer);
    Ok(())
}

/// Validate a ping and hand its sequence numbers to `handler`.
pub fn dispatch_ping(
    message: &Message,
    peer: SocketAddr,
    handler: &mut impl MessageHandler,
) -> LinkResult<()> {
    if message.message_type != MessageType::Ping {
        return Err(LinkError::PeerProtocol {
            peer,
            reason: format!("unexpected message type [{:?}]", message.message_type),
        });
    }
    if !message.is_single_fragment() {
        return Err(LinkError::PeerProtocol {
            peer,
            reason: "ping expects single fragment".to_string(),
        });
    }

    let reply_for = read_reply_for(&message.payload).map_err(|e| e.with_peer(peer))?;
    handler.handle_ping(message.sequence, reply_for, peer);
    Ok(())
}

async fn write_datagram(
    socket: &UdpSocket,
    data: &[u8],
    peer: SocketAddr,
    op: &'static str,
) -> LinkResult<()> {
    timeout(IO_TIMEOUT, socket.send_to(data, peer))
        .await
        .map_err(|_| LinkError::Timeout {
            op,
            timeout: IO_TIMEOUT,
        })??;
    Ok(())
}

/// Progress of a link establishment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Nothing sent yet.
    Idle,
    /// Local hello is on the wire.
    HelloSent,
    /// Identities exchanged, waiting for the ping round trip.
    AwaitingPingExchange,
    /// Link verified.
    Established,
    /// Timed out or protocol violation.
    Failed,
}

/// A verified link.
#[derive(Debug, Clone)]
pub struct EstablishedLink {
    /// Identity the peer announced.
    pub peer_id: LinkId,
    /// Where the peer answered from.
    pub peer_addr: SocketAddr,
    /// Time from first send to link verification.
    pub round_trip: Duration,
}

/// One attempt at establishing a link, either as the dialing or the
/// accepting side.
///
/// ```text
/// dialer                         listener
///   | -- hello(local) ---------->  |
///   | <--------- hello(remote) --  |
///   | -- ping(0, -1) ----------->  |
///   | <--------- ping(0, 0) -----  |
/// ```
#[derive(Debug)]
pub struct HandshakeSession {
    local_id: LinkId,
    state: LinkState,
    next_sequence: i32,
}

#[derive(Default)]
struct Exchange {
    peer_id: Option<LinkId>,
    ping: Option<(i32, i32)>,
}

impl HelloHandler for Exchange {
    fn handle_hello(&mut self, link_id: LinkId, _peer: SocketAddr) {
        self.peer_id = Some(link_id);
    }
}

impl MessageHandler for Exchange {
    fn handle_ping(&mut self, sequence: i32, reply_for: i32, _peer: SocketAddr) {
        self.ping = Some((sequence, reply_for));
    }
}

impl HandshakeSession {
    /// Create an idle session announcing `local_id`.
    pub fn new(local_id: LinkId) -> Self {
        Self {
            local_id,
            state: LinkState::Idle,
            next_sequence: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Dial `peer` and verify the link.
    pub async fn dial(&mut self, socket: &UdpSocket, peer: SocketAddr) -> LinkResult<EstablishedLink> {
        self.ensure_idle()?;
        let result = self.run_dial(socket, peer).await;
        self.finish(result, "dial")
    }

    /// Wait for a dialing peer and verify the link.
    pub async fn accept(&mut self, socket: &UdpSocket) -> LinkResult<EstablishedLink> {
        self.ensure_idle()?;
        let result = self.run_accept(socket).await;
        self.finish(result, "accept")
    }

    async fn run_dial(&mut self, socket: &UdpSocket, peer: SocketAddr) -> LinkResult<EstablishedLink> {
        let started = Instant::now();
        let mut exchange = Exchange::default();

        send_hello(&self.local_id, socket, peer).await?;
        self.state = LinkState::HelloSent;

        let (message, from) = receive(socket).await?;
        expect_sender(peer, from)?;
        dispatch_hello(&message, from, &mut exchange)?;
        let peer_id = exchange
            .peer_id
            .take()
            .ok_or_else(|| LinkError::protocol("hello carried no identity"))?;
        self.state = LinkState::AwaitingPingExchange;

        let sequence = self.take_sequence();
        send_ping(sequence, socket, peer, NO_REPLY_FOR).await?;

        let (message, from) = receive(socket).await?;
        expect_sender(peer, from)?;
        dispatch_ping(&message, from, &mut exchange)?;
        match exchange.ping {
            Some((_, reply_for)) if reply_for == sequence => {}
            Some((_, reply_for)) => {
                return Err(LinkError::PeerProtocol {
                    peer,
                    reason: format!("ping reply for {} does not match {}", reply_for, sequence),
                });
            }
            None => return Err(LinkError::protocol("ping not handled")),
        }

        self.state = LinkState::Established;
        Ok(EstablishedLink {
            peer_id,
            peer_addr: peer,
            round_trip: started.elapsed(),
        })
    }

    async fn run_accept(&mut self, socket: &UdpSocket) -> LinkResult<EstablishedLink> {
        let started = Instant::now();
        let mut exchange = Exchange::default();

        let (message, peer) = receive(socket).await?;
        dispatch_hello(&message, peer, &mut exchange)?;
        let peer_id = exchange
            .peer_id
            .take()
            .ok_or_else(|| LinkError::protocol("hello carried no identity"))?;

        send_hello(&self.local_id, socket, peer).await?;
        self.state = LinkState::AwaitingPingExchange;

        let (message, from) = receive(socket).await?;
        expect_sender(peer, from)?;
        dispatch_ping(&message, from, &mut exchange)?;
        let (their_sequence, _) = exchange
            .ping
            .ok_or_else(|| LinkError::protocol("ping not handled"))?;

        let sequence = self.take_sequence();
        send_ping(sequence, socket, peer, their_sequence).await?;

        self.state = LinkState::Established;
        Ok(EstablishedLink {
            peer_id,
            peer_addr: peer,
            round_trip: started.elapsed(),
        })
    }

    fn ensure_idle(&self) -> LinkResult<()> {
        if self.state != LinkState::Idle {
            return Err(LinkError::protocol(format!(
                "handshake session already used [{:?}]",
                self.state
            )));
        }
        Ok(())
    }

    fn take_sequence(&mut self) -> i32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        sequence
    }

    fn finish(
        &mut self,
        result: LinkResult<EstablishedLink>,
        op: &'static str,
    ) -> LinkResult<EstablishedLink> {
        match result {
            Ok(link) => {
                tracing::info!(
                    peer = %link.peer_addr,
                    peer_id = %link.peer_id,
                    rtt = ?link.round_trip,
                    "link established"
                );
                Ok(link)
            }
            Err(e) => {
                tracing::warn!(op, state = ?self.state, error = %e, "link handshake failed");
                self.state = LinkState::Failed;
                Err(e)
            }
        }
    }
}

fn expect_sender(expected: SocketAddr, actual: SocketAddr) -> LinkResult<()> {
    if expected != actual {
        return Err(LinkError::PeerProtocol {
            peer: actual,
            reason: format!("unexpected sender, waiting on {}", expected),
        });
    }
    Ok(())
}
