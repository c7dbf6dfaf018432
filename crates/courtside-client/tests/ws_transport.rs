//! WebSocket transport against a loopback server.

use std::time::Duration;

use courtside_app::{Transport, TransportEvent};
use courtside_client::{TransportError, WsTransport};
use courtside_proto::{ClientFrame, ServerFrame, close_code};
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpListener, time::timeout};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

#[tokio::test]
async fn auth_exchange_then_server_close() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let Some(Ok(Message::Text(text))) = ws.next().await else { panic!("expected text frame") };
        let frame = ClientFrame::decode(text.as_str()).unwrap();
        assert_eq!(frame, ClientFrame::Auth { token: "secret".into() });

        let reply = ServerFrame::AuthSuccess.encode().unwrap();
        ws.send(Message::Text(reply.into())).await.unwrap();
        ws.close(Some(CloseFrame {
            code: CloseCode::from(close_code::AUTH_REJECTED),
            reason: "bye".into(),
        }))
        .await
        .unwrap();
    });

    let mut transport = WsTransport::new(url);
    transport.open().await.unwrap();
    assert!(transport.is_open());

    let auth = ClientFrame::Auth { token: "secret".into() }.encode().unwrap();
    transport.send_text(auth).await.unwrap();

    let TransportEvent::Text(text) = transport.recv().await else { panic!("expected text") };
    assert_eq!(ServerFrame::decode(&text).unwrap(), ServerFrame::AuthSuccess);

    let closed = transport.recv().await;
    assert_eq!(
        closed,
        TransportEvent::Closed { code: Some(close_code::AUTH_REJECTED), was_clean: true }
    );
    assert!(!transport.is_open());

    server.await.unwrap();
}

#[tokio::test]
async fn server_close_is_answered_before_the_socket_drops() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let frame = CloseFrame { code: CloseCode::Away, reason: "restart".into() };
        ws.send(Message::Close(Some(frame))).await.unwrap();
        ws.next().await
    });

    let mut transport = WsTransport::new(url);
    transport.open().await.unwrap();

    let closed = transport.recv().await;
    assert_eq!(
        closed,
        TransportEvent::Closed { code: Some(close_code::GOING_AWAY), was_clean: true }
    );
    assert!(!transport.is_open());

    // The peer sees our close reply, not a reset.
    let reply = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert!(matches!(reply, Some(Ok(Message::Close(_))) | None), "got {reply:?}");
}

#[tokio::test]
async fn client_close_reaches_server() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => {},
                _ => return None,
            }
        }
    });

    let mut transport = WsTransport::new(url);
    transport.open().await.unwrap();
    transport.close(close_code::NORMAL, "view closed".into()).await.unwrap();
    assert!(!transport.is_open());

    // Closing twice is a no-op.
    transport.close(close_code::NORMAL, String::new()).await.unwrap();

    assert_eq!(server.await.unwrap(), Some(close_code::NORMAL));
}

#[tokio::test]
async fn send_without_socket_fails() {
    let mut transport = WsTransport::new("ws://127.0.0.1:1");

    let err = transport.send_text("{}".into()).await.unwrap_err();
    assert!(matches!(err, TransportError::NotOpen));
}

#[tokio::test]
async fn open_to_unreachable_endpoint_fails() {
    let (listener, url) = listener().await;
    drop(listener);

    let mut transport = WsTransport::new(url);
    let err = transport.open().await.unwrap_err();
    assert!(matches!(err, TransportError::Connection(_)));
    assert!(!transport.is_open());
}
