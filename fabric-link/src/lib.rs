//! Link bootstrap protocol for fabric routers.
//!
//! Routers establish raw data-plane links over UDP before any consensus or
//! payload traffic flows between them. This crate provides the two pieces
//! needed for that:
//!
//! - [`message`]: the fixed-layout binary frame (15-byte header plus payload)
//! - [`handshake`]: hello/ping exchange primitives and the per-attempt
//!   [`HandshakeSession`] state machine
//!
//! # Wire Format
//!
//! ```text
//! offset  size  field
//! 0       4     magic = 01 02 02 00
//! 4       4     sequence (i32 LE, -1 for hello)
//! 8       1     fragment index
//! 9       1     fragment count
//! 10      1     message type
//! 11      2     headers length (u16 LE, always 0)
//! 13      2     payload length (u16 LE)
//! 15      N     payload
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fabric_link::{HandshakeSession, LinkId};
//! use tokio::net::UdpSocket;
//!
//! let socket = UdpSocket::bind("0.0.0.0:0").await?;
//! let mut session = HandshakeSession::new(LinkId::new("router-a"));
//! let link = session.dial(&socket, "10.0.0.2:6000".parse()?).await?;
//! println!("linked to {} in {:?}", link.peer_id, link.round_trip);
//! ```

pub mod error;
pub mod handshake;
pub mod message;

pub use error::{LinkError, LinkResult};
pub use handshake::{
    EstablishedLink, HandshakeSession, HelloHandler, LinkId, LinkState, MessageHandler,
};
pub use message::{Message, MessageType};
