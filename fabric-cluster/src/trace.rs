//! Channel trace publication.
//!
//! Mesh channels report every message they send or receive to a
//! [`ChannelPeekHandler`]. When tracing is enabled for that channel the
//! handler hands a [`ChannelTraceEvent`] to the [`TracePublisher`], which
//! forwards it to an [`EventSink`] from its own task. The hand-off uses
//! `try_send`, so a slow sink drops events rather than stalling the channel
//! that produced them.

use crate::mesh::{content_type, Channel, Message};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// One traced mesh message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTraceEvent {
    /// Nanoseconds since the unix epoch.
    pub timestamp_ns: u128,
    /// Server id of the node that observed the message.
    pub identity: String,
    /// Name of the traced channel (the remote server id).
    pub channel: String,
    /// Received rather than sent.
    pub is_rx: bool,
    pub content_type: i32,
    pub sequence: u32,
    pub reply_for: Option<u32>,
    /// Body length in bytes.
    pub length: usize,
}

impl ChannelTraceEvent {
    fn observe(identity: &str, channel: &str, is_rx: bool, message: &Message) -> Self {
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self {
            timestamp_ns,
            identity: identity.to_string(),
            channel: channel.to_string(),
            is_rx,
            content_type: message.content_type,
            sequence: message.sequence,
            reply_for: message.reply_for,
            length: message.body.len(),
        }
    }
}

/// Destination for trace events.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn accept(&self, event: ChannelTraceEvent);
}

#[async_trait]
impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    async fn accept(&self, event: ChannelTraceEvent) {
        (**self).accept(event).await
    }
}

/// Writes trace events to the `tracing` log at `trace` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn accept(&self, event: ChannelTraceEvent) {
        tracing::trace!(
            identity = %event.identity,
            channel = %event.channel,
            rx = event.is_rx,
            content_type = event.content_type,
            sequence = event.sequence,
            reply_for = ?event.reply_for,
            length = event.length,
            "channel trace"
        );
    }
}

/// Ships trace events to a collector over a mesh channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    channel: Channel,
}

impl ChannelSink {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn accept(&self, event: ChannelTraceEvent) {
        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(error = %e, "failed to encode trace event");
                return;
            }
        };
        if let Err(e) = self
            .channel
            .send(Message::new(content_type::TRACE_EVENT, body))
            .await
        {
            tracing::debug!(error = %e, "failed to ship trace event");
        }
    }
}

/// Bounded, non-blocking hand-off to an [`EventSink`].
#[derive(Debug, Clone)]
pub struct TracePublisher {
    tx: mpsc::Sender<ChannelTraceEvent>,
}

impl TracePublisher {
    /// Spawn the forwarding task. Must be called inside a tokio runtime.
    pub fn spawn(sink: impl EventSink, queue_size: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<ChannelTraceEvent>(queue_size.max(1));
        let sink = Arc::new(sink);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.accept(event).await;
            }
        });
        Self { tx }
    }

    /// Queue `event`, dropping it if the queue is full.
    pub fn publish(&self, event: ChannelTraceEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!(error = %e, "trace event dropped");
        }
    }
}

/// Selects channels by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceMatcher {
    All,
    Exact(String),
    Prefix(String),
}

impl SourceMatcher {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            SourceMatcher::All => true,
            SourceMatcher::Exact(exact) => name == exact,
            SourceMatcher::Prefix(prefix) => name.starts_with(prefix.as_str()),
        }
    }
}

/// Outcome of toggling tracing on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleResult {
    pub channel: String,
    pub matched: bool,
    pub old_state: bool,
    pub new_state: bool,
}

/// Per-channel trace hook.
#[derive(Debug)]
pub struct ChannelPeekHandler {
    identity: String,
    channel: String,
    publisher: TracePublisher,
    enabled: AtomicBool,
}

impl ChannelPeekHandler {
    /// Create a hook for `channel`, disabled until toggled on.
    pub fn new(identity: String, channel: String, publisher: TracePublisher) -> Self {
        Self {
            identity,
            channel,
            publisher,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Record a received message.
    pub fn rx(&self, message: &Message) {
        self.trace(true, message);
    }

    /// Record a sent message.
    pub fn tx(&self, message: &Message) {
        self.trace(false, message);
    }

    /// Enable or disable tracing if `matcher` selects this channel.
    pub fn toggle(&self, matcher: &SourceMatcher, enable: bool) -> ToggleResult {
        let old_state = self.is_enabled();
        if !matcher.matches(&self.channel) {
            return ToggleResult {
                channel: self.channel.clone(),
                matched: false,
                old_state,
                new_state: old_state,
            };
        }
        let old_state = self.enabled.swap(enable, Ordering::AcqRel);
        ToggleResult {
            channel: self.channel.clone(),
            matched: true,
            old_state,
            new_state: enable,
        }
    }

    fn trace(&self, is_rx: bool, message: &Message) {
        if message.content_type == content_type::TRACE_EVENT || !self.is_enabled() {
            return;
        }
        self.publisher.publish(ChannelTraceEvent::observe(
            &self.identity,
            &self.channel,
            is_rx,
            message,
        ));
    }
}
