//! A reliable, ordered channel to one mesh peer.
//!
//! Each channel owns a reader task and a writer task over a framed TCP
//! stream. Replies are routed back to the request that is waiting for them;
//! everything else goes to the handler bound for its content type, on its
//! own task, so a slow handler never stalls the reader.

use super::message::Message;
use super::Bindings;
use crate::error::{ClusterError, ClusterResult};
use crate::trace::ChannelPeekHandler;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Outbound messages buffered per channel before senders wait.
const OUTBOUND_QUEUE: usize = 256;

pub(crate) type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Handle to a peer channel. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    peer_id: String,
    peer_addr: String,
    outbound: mpsc::Sender<Message>,
    pending: DashMap<u32, oneshot::Sender<Message>>,
    next_sequence: AtomicU32,
    closed: watch::Sender<bool>,
    peek: Option<Arc<ChannelPeekHandler>>,
}

impl Channel {
    /// Start the reader and writer tasks for an already greeted stream.
    pub(crate) fn spawn(
        framed: FramedStream,
        peer_id: String,
        peer_addr: String,
        bindings: Arc<Bindings>,
        peek: Option<Arc<ChannelPeekHandler>>,
        mesh_shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (sink, stream) = framed.split();
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (closed, _) = watch::channel(false);

        let channel = Self {
            inner: Arc::new(ChannelInner {
                peer_id,
                peer_addr,
                outbound,
                pending: DashMap::new(),
                next_sequence: AtomicU32::new(1),
                closed,
                peek,
            }),
        };

        tokio::spawn(write_loop(channel.clone(), rx, sink, mesh_shutdown.clone()));
        tokio::spawn(read_loop(channel.clone(), stream, bindings, mesh_shutdown));

        channel
    }

    /// Remote server id.
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Remote advertised address.
    pub fn peer_addr(&self) -> &str {
        &self.inner.peer_addr
    }

    /// Whether the channel has stopped.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Trace hook for this channel, if tracing is configured.
    pub fn peek_handler(&self) -> Option<&Arc<ChannelPeekHandler>> {
        self.inner.peek.as_ref()
    }

    /// Stop both tasks and fail every outstanding request.
    pub fn close(&self) {
        if !self.inner.closed.send_replace(true) {
            tracing::debug!(peer = %self.inner.peer_addr, "closing mesh channel");
        }
        self.inner.pending.clear();
    }

    /// Send a message without waiting for a reply. Returns its sequence.
    pub async fn send(&self, mut message: Message) -> ClusterResult<u32> {
        let sequence = self.next_sequence();
        message.sequence = sequence;
        self.enqueue(message).await?;
        Ok(sequence)
    }

    /// Send a request and wait up to `timeout` for its reply.
    pub async fn send_for_reply(
        &self,
        mut message: Message,
        timeout: Duration,
    ) -> ClusterResult<Message> {
        let sequence = self.next_sequence();
        message.sequence = sequence;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(sequence, tx);
        if self.is_closed() {
            self.inner.pending.remove(&sequence);
            return Err(self.closed_error());
        }

        if let Err(e) = self.enqueue(message).await {
            self.inner.pending.remove(&sequence);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.inner.pending.remove(&sequence);
                Err(ClusterError::Timeout {
                    op: "mesh request",
                    timeout,
                })
            }
        }
    }

    fn next_sequence(&self) -> u32 {
        self.inner.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    async fn enqueue(&self, message: Message) -> ClusterResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if let Some(peek) = &self.inner.peek {
            peek.tx(&message);
        }
        self.inner
            .outbound
            .send(message)
            .await
            .map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> ClusterError {
        ClusterError::connection(&self.inner.peer_addr, "channel closed")
    }

    fn deliver(&self, message: Message, bindings: &Bindings) {
        if let Some(peek) = &self.inner.peek {
            peek.rx(&message);
        }

        if let Some(reply_for) = message.reply_for {
            match self.inner.pending.remove(&reply_for) {
                Some((_, waiter)) => {
                    let _ = waiter.send(message);
                }
                None => tracing::debug!(
                    peer = %self.inner.peer_addr,
                    reply_for,
                    "dropping reply with no waiting request"
                ),
            }
            return;
        }

        let channel = self.clone();
        match bindings.get(message.content_type) {
            Some(handler) => {
                tokio::spawn(async move { handler.handle(message, channel).await });
            }
            None => {
                tracing::warn!(
                    peer = %self.inner.peer_addr,
                    content_type = message.content_type,
                    "no handler bound for content type"
                );
                let reply = message.error_reply(&ClusterError::Protocol(format!(
                    "no handler for content type {}",
                    message.content_type
                )));
                tokio::spawn(async move {
                    let _ = channel.send(reply).await;
                });
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer_id", &self.inner.peer_id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

async fn write_loop(
    channel: Channel,
    mut rx: mpsc::Receiver<Message>,
    mut sink: SplitSink<FramedStream, Bytes>,
    mut mesh_shutdown: watch::Receiver<bool>,
) {
    let mut closed = channel.inner.closed.subscribe();
    loop {
        let message = tokio::select! {
            message = rx.recv() => message,
            _ = signalled(&mut closed) => break,
            _ = signalled(&mut mesh_shutdown) => break,
        };
        let Some(message) = message else { break };

        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(peer = %channel.peer_addr(), error = %e, "failed to encode mesh message");
                continue;
            }
        };
        if let Err(e) = sink.send(frame).await {
            tracing::warn!(peer = %channel.peer_addr(), error = %e, "mesh write failed");
            break;
        }
    }

    let _ = sink.close().await;
    channel.close();
}

async fn read_loop(
    channel: Channel,
    mut stream: SplitStream<FramedStream>,
    bindings: Arc<Bindings>,
    mut mesh_shutdown: watch::Receiver<bool>,
) {
    let mut closed = channel.inner.closed.subscribe();
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = signalled(&mut closed) => break,
            _ = signalled(&mut mesh_shutdown) => break,
        };

        match frame {
            None => {
                tracing::debug!(peer = %channel.peer_addr(), "peer closed mesh channel");
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(peer = %channel.peer_addr(), error = %e, "mesh read failed");
                break;
            }
            Some(Ok(bytes)) => match Message::decode(&bytes) {
                Ok(message) => {
                    tracing::trace!(
                        peer = %channel.peer_addr(),
                        content_type = message.content_type,
                        sequence = message.sequence,
                        "mesh message received"
                    );
                    channel.deliver(message, &bindings);
                }
                Err(e) => {
                    tracing::warn!(peer = %channel.peer_addr(), error = %e, "dropping malformed mesh frame");
                }
            },
        }
    }

    channel.close();
}
