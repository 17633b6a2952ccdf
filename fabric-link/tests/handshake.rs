//! End-to-end link establishment over loopback UDP.

use fabric_link::handshake::{receive, send_hello, send_ping};
use fabric_link::message::NO_REPLY_FOR;
use fabric_link::{HandshakeSession, LinkId, LinkState};
use tokio::net::UdpSocket;

async fn bind() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.expect("bind")
}

#[tokio::test]
async fn test_dial_and_accept_establish_link() {
    let dialer_socket = bind().await;
    let listener_socket = bind().await;
    let listener_addr = listener_socket.local_addr().expect("addr");
    let dialer_addr = dialer_socket.local_addr().expect("addr");

    let accept = tokio::spawn(async move {
        let mut session = HandshakeSession::new(LinkId::new("router-b"));
        let link = session.accept(&listener_socket).await;
        (session.state(), link)
    });

    let mut session = HandshakeSession::new(LinkId::new("router-a"));
    let link = session
        .dial(&dialer_socket, listener_addr)
        .await
        .expect("dial should succeed");

    assert_eq!(session.state(), LinkState::Established);
    assert_eq!(link.peer_id, LinkId::new("router-b"));
    assert_eq!(link.peer_addr, listener_addr);

    let (state, accepted) = accept.await.expect("join");
    let accepted = accepted.expect("accept should succeed");
    assert_eq!(state, LinkState::Established);
    assert_eq!(accepted.peer_id, LinkId::new("router-a"));
    assert_eq!(accepted.peer_addr, dialer_addr);
}

#[tokio::test]
async fn test_dial_fails_on_mismatched_ping_reply() {
    let dialer_socket = bind().await;
    let fake_socket = bind().await;
    let fake_addr = fake_socket.local_addr().expect("addr");

    let fake = tokio::spawn(async move {
        let (_, dialer) = receive(&fake_socket).await.expect("hello");
        send_hello(&LinkId::new("impostor"), &fake_socket, dialer)
            .await
            .expect("hello");
        let (_, _) = receive(&fake_socket).await.expect("ping");
        send_ping(0, &fake_socket, dialer, 99).await.expect("ping");
    });

    let mut session = HandshakeSession::new(LinkId::new("router-a"));
    let err = session
        .dial(&dialer_socket, fake_addr)
        .await
        .expect_err("reply_for mismatch");

    assert!(err.is_protocol());
    assert_eq!(session.state(), LinkState::Failed);
    fake.await.expect("join");
}

#[tokio::test]
async fn test_accept_fails_when_first_frame_is_not_hello() {
    let listener_socket = bind().await;
    let sender = bind().await;
    let listener_addr = listener_socket.local_addr().expect("addr");

    send_ping(4, &sender, listener_addr, NO_REPLY_FOR)
        .await
        .expect("ping");

    let mut session = HandshakeSession::new(LinkId::new("router-b"));
    let err = session
        .accept(&listener_socket)
        .await
        .expect_err("not a hello");

    assert!(err.is_protocol());
    assert_eq!(session.state(), LinkState::Failed);
}
