//! Integration tests over real WebSocket connections.
//!
//! These tests start the axum server on a free port and connect real clients,
//! verifying the full pipeline from socket frames to converged replicas.

use collab_ot::server::{AppState, ServerConfig, create_router};
use collab_ot::sync::{ClientConfig, ClientHandle};
use collab_ot::{
    ClientEvent, ClientId, ConnectionState, DocumentId, Operation, ServerAuthority, ServerMessage,
    path,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_tungstenite::tungstenite::Message;

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Starts a server with one seeded document; returns its base URL.
async fn start_test_server(document: &str, value: Value) -> (String, Arc<ServerAuthority>) {
    start_server_with(ServerConfig::default(), document, value).await
}

async fn start_server_with(
    config: ServerConfig,
    document: &str,
    value: Value,
) -> (String, Arc<ServerAuthority>) {
    let state = AppState::new(config);
    state
        .authority
        .create_document(DocumentId::from(document), value)
        .unwrap();
    let authority = state.authority.clone();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });
    (url, authority)
}

async fn wait_for(client: &mut ClientHandle, done: impl Fn(&ClientEvent) -> bool) {
    timeout(Duration::from_secs(5), async {
        while let Some(event) = client.next_event().await {
            if done(&event) {
                return;
            }
        }
        panic!("client stopped");
    })
    .await
    .expect("timed out waiting for event");
}

fn is_live(event: &ClientEvent) -> bool {
    matches!(event, ClientEvent::StateChanged(ConnectionState::Live))
}

/// Next server message on a raw socket; `None` once the server hung up.
async fn next_message(socket: &mut RawSocket) -> Option<ServerMessage> {
    let frame = timeout(Duration::from_secs(3), socket.next())
        .await
        .expect("timed out waiting for a frame");
    match frame {
        Some(Ok(Message::Text(text))) => Some(ServerMessage::from_json(&text).unwrap()),
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => None,
        Some(Ok(other)) => panic!("unexpected frame {other:?}"),
    }
}

/// Opens a raw socket and joins as `client_id`, consuming the snapshot.
async fn raw_join(url: &str, document: &str, client_id: ClientId) -> RawSocket {
    let (mut socket, _) = connect_async(format!("{url}/ws/{document}")).await.unwrap();
    let join = json!({
        "type": "join",
        "document_id": document,
        "client_id": client_id,
        "display_label": "raw"
    });
    socket.send(Message::Text(join.to_string())).await.unwrap();
    match next_message(&mut socket).await {
        Some(ServerMessage::SyncComplete { .. }) => socket,
        other => panic!("expected sync_complete, got {other:?}"),
    }
}

#[tokio::test]
async fn test_two_clients_converge() {
    let (url, authority) = start_test_server("doc", json!({"t": "", "n": []})).await;
    let config = ClientConfig::new(url, "doc");
    let mut a = ClientHandle::spawn(config.clone().with_display_label("a"));
    let mut b = ClientHandle::spawn(config.with_display_label("b"));
    wait_for(&mut a, is_live).await;
    wait_for(&mut b, is_live).await;

    a.edit(Operation::insert_text(path!["t", 0], "X")).unwrap();
    b.edit(Operation::insert_text(path!["t", 0], "Y")).unwrap();
    b.edit(Operation::insert(path!["n", 0], json!(1))).unwrap();

    let done = |e: &ClientEvent| {
        matches!(
            e,
            ClientEvent::RemoteOperation { version: 3, .. } | ClientEvent::Acknowledged { version: 3, .. }
        )
    };
    wait_for(&mut a, done).await;
    wait_for(&mut b, done).await;

    let server = authority.snapshot(&DocumentId::from("doc")).unwrap();
    assert_eq!(a.snapshot().await.unwrap(), server);
    assert_eq!(b.snapshot().await.unwrap(), server);

    let expected = if a.client_id() < b.client_id() { "XY" } else { "YX" };
    assert_eq!(server.0["t"], json!(expected));
    assert_eq!(server.0["n"], json!([1]));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_raw_join_gets_snapshot() {
    let (url, _authority) = start_test_server("raw", json!({"k": "v"})).await;
    let (mut socket, _) = connect_async(format!("{url}/ws/raw")).await.unwrap();

    let join = json!({
        "type": "join",
        "document_id": "raw",
        "client_id": ClientId::new(),
        "display_label": "raw"
    });
    socket.send(Message::Text(join.to_string())).await.unwrap();

    let frame = timeout(Duration::from_secs(2), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = frame else {
        panic!("expected a text frame, got {frame:?}");
    };
    match ServerMessage::from_json(&text).unwrap() {
        ServerMessage::SyncComplete { value, version, clients, .. } => {
            assert_eq!(value, json!({"k": "v"}));
            assert_eq!(version, 0);
            assert_eq!(clients.len(), 1);
        }
        other => panic!("expected sync_complete, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frame_closes_connection() {
    let (url, _authority) = start_test_server("bad", json!({})).await;
    let (mut socket, _) = connect_async(format!("{url}/ws/bad")).await.unwrap();

    socket
        .send(Message::Text("{\"type\":\"nonsense\"}".to_string()))
        .await
        .unwrap();

    let mut saw_error = false;
    let mut closed = false;
    while let Ok(Some(frame)) = timeout(Duration::from_secs(2), socket.next()).await {
        match frame {
            Ok(Message::Text(text)) => {
                saw_error |= matches!(
                    ServerMessage::from_json(&text),
                    Ok(ServerMessage::Error { .. })
                );
            }
            Ok(Message::Close(_)) | Err(_) => {
                closed = true;
                break;
            }
            Ok(_) => {}
        }
    }
    assert!(saw_error);
    assert!(closed);
}

#[tokio::test]
async fn test_unknown_document_is_refused() {
    let (url, _authority) = start_test_server("known", json!({})).await;
    let (mut socket, _) = connect_async(format!("{url}/ws/missing")).await.unwrap();

    let join = json!({
        "type": "join",
        "document_id": "missing",
        "client_id": ClientId::new(),
        "display_label": "lost"
    });
    socket.send(Message::Text(join.to_string())).await.unwrap();

    let frame = timeout(Duration::from_secs(2), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = frame else {
        panic!("expected a text frame, got {frame:?}");
    };
    assert!(matches!(
        ServerMessage::from_json(&text).unwrap(),
        ServerMessage::Error { .. }
    ));
}

#[tokio::test]
async fn test_idle_socket_is_closed_but_pinging_client_stays() {
    let config = ServerConfig {
        idle_timeout: Duration::from_millis(300),
        ..ServerConfig::default()
    };
    let (url, authority) = start_server_with(config, "idle", json!({})).await;
    let mut listener = ClientHandle::spawn(
        ClientConfig::new(url.clone(), "idle").with_keepalive(Duration::from_millis(100)),
    );
    wait_for(&mut listener, is_live).await;

    // joins, then never sends another frame
    let silent = ClientId::new();
    let mut socket = raw_join(&url, "idle", silent).await;
    let hung_up = timeout(Duration::from_secs(3), async {
        while next_message(&mut socket).await.is_some() {}
    })
    .await;
    assert!(hung_up.is_ok(), "silent socket was left open");

    // the listener only talks through pings and must outlive several timeouts
    let mut saw_leave = false;
    let watched = timeout(Duration::from_millis(1200), async {
        while let Some(event) = listener.next_event().await {
            assert!(
                !matches!(event, ClientEvent::StateChanged(_)),
                "listener lost its connection: {event:?}"
            );
            saw_leave |= matches!(event, ClientEvent::ClientLeft(id) if id == silent);
        }
    })
    .await;
    assert!(watched.is_err(), "listener task stopped");
    assert!(saw_leave);
    assert_eq!(authority.stats().connected_clients, 1);

    listener.shutdown().await;
}

#[tokio::test]
async fn test_rejoin_elsewhere_releases_old_socket() {
    let (url, authority) = start_test_server("re", json!({"t": ""})).await;
    let document = DocumentId::from("re");
    let client_id = ClientId::new();
    let mut old = raw_join(&url, "re", client_id).await;
    let mut new = raw_join(&url, "re", client_id).await;

    assert!(matches!(
        next_message(&mut old).await,
        Some(ServerMessage::Error { .. })
    ));
    assert!(next_message(&mut old).await.is_none());
    drop(old);

    authority
        .submit(&document, ClientId::new(), Operation::insert_text(path!["t", 0], "x"), 0, 1)
        .unwrap();
    assert!(matches!(
        next_message(&mut new).await,
        Some(ServerMessage::Operation { new_version: 1, .. })
    ));
    assert_eq!(authority.stats().connected_clients, 1);
}
