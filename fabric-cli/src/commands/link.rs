//! Link commands - exercise the router link handshake over UDP.

use anyhow::{Context, Result};
use fabric_link::{HandshakeSession, LinkId};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Accept handshakes on `bind` until interrupted.
pub async fn listen(bind: &str, identity: &str) -> Result<()> {
    let socket = UdpSocket::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    let local = socket.local_addr()?;
    println!("Accepting links on {} as {}", local, identity);

    loop {
        let mut session = HandshakeSession::new(LinkId::new(identity));
        tokio::select! {
            result = session.accept(&socket) => match result {
                Ok(link) => {
                    tracing::info!(peer = %link.peer_addr, peer_id = %link.peer_id, "link established");
                    println!("{} linked from {} in {:?}", link.peer_id, link.peer_addr, link.round_trip);
                }
                // Timeouts just mean nobody dialed; keep waiting.
                Err(e) if e.is_timeout() => {}
                Err(e) => tracing::warn!(error = %e, "link accept failed"),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

/// Dial `peer` from `bind` and report the verified link.
pub async fn probe(bind: &str, peer: &str, identity: &str) -> Result<()> {
    let peer: SocketAddr = peer
        .parse()
        .with_context(|| format!("Invalid peer address {}", peer))?;
    let socket = UdpSocket::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    let mut session = HandshakeSession::new(LinkId::new(identity));
    let link = session
        .dial(&socket, peer)
        .await
        .with_context(|| format!("Handshake with {} failed", peer))?;

    println!("linked to {} at {} in {:?}", link.peer_id, link.peer_addr, link.round_trip);
    Ok(())
}
