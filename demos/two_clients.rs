//! Two clients editing one document through an in-process server.
//!
//! Run with: cargo run --example two_clients

use collab_ot::server::{AppState, ServerConfig, create_router};
use collab_ot::sync::{ClientConfig, ClientHandle};
use collab_ot::{ClientEvent, ConnectionState, DocumentId, Operation, Selection, path};
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

/// Waits until `client` reports an event matching `done`.
async fn wait_for(
    client: &mut ClientHandle,
    done: impl Fn(&ClientEvent) -> bool,
) -> Result<(), Box<dyn std::error::Error>> {
    timeout(Duration::from_secs(5), async {
        while let Some(event) = client.next_event().await {
            println!("  [{}] {:?}", client.client_id(), event);
            if done(&event) {
                return;
            }
        }
    })
    .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let state = AppState::new(ServerConfig::default());
    let document = DocumentId::from("notes");
    state.authority.create_document(
        document.clone(),
        json!({"title": "Shopping", "items": ["milk"]}),
    )?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);
    let authority = state.authority.clone();
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, create_router(state)).await {
            eprintln!("server stopped: {err}");
        }
    });

    let config = ClientConfig::new(url, document.clone());
    let mut alice = ClientHandle::spawn(config.clone().with_display_label("alice"));
    let mut bob = ClientHandle::spawn(config.with_display_label("bob"));
    let live = |e: &ClientEvent| matches!(e, ClientEvent::StateChanged(ConnectionState::Live));
    wait_for(&mut alice, live).await?;
    wait_for(&mut bob, live).await?;

    println!("both clients live, editing concurrently");
    alice.edit(Operation::insert(path!["items", 1], json!("eggs")))?;
    alice.edit(Operation::insert_text(path!["title", 8], " list"))?;
    bob.edit(Operation::insert(path!["items", 0], json!("bread")))?;
    bob.select(Some(Selection::caret(path!["title", 0])))?;

    // three edits in total, so both are done once they have seen version 3
    let caught_up = |e: &ClientEvent| {
        matches!(
            e,
            ClientEvent::RemoteOperation { version: 3, .. } | ClientEvent::Acknowledged { version: 3, .. }
        )
    };
    wait_for(&mut alice, caught_up).await?;
    wait_for(&mut bob, caught_up).await?;

    let (server_value, server_version) = authority.snapshot(&document)?;
    let (alice_value, _) = alice.snapshot().await?;
    let (bob_value, _) = bob.snapshot().await?;
    println!("server  v{server_version}: {server_value}");
    println!("alice: {alice_value}");
    println!("bob:   {bob_value}");
    assert_eq!(alice_value, server_value);
    assert_eq!(bob_value, server_value);

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}
