//! Tests for catch-up sync, stale clients and reconnect recovery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coedit_server::{EngineConfig, ServerState, server};
use common::*;
use tokio::time;

pub mod common;

/// Once the log has been pruned past a client's base version, the engine
/// answers `TooStale` and the client recovers through a snapshot sync.
#[tokio::test]
async fn test_too_stale_then_snapshot_sync() -> Result<()> {
    logging();
    let config = EngineConfig {
        log_limit: 4,
        ..Default::default()
    };
    let state = Arc::new(ServerState::temporary_with(config).await?);
    let client = TestClient::start(server(state)).await?;

    let (mut alice, _, _) = client.join("alice", "stale").await?;
    for i in 0..10u64 {
        let resp = alice
            .request(i + 1, "document.op", insert_op(0, "x", i))
            .await?;
        assert_eq!(resp["ok"], true);
    }

    let (mut bob, _, snapshot) = client.join("bob", "stale").await?;
    assert_eq!(snapshot["version"], 10);

    // Base version 3 predates the oldest retained log entry.
    let resp = bob.request(1, "document.op", insert_op(0, "y", 3)).await?;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "TooStale");

    // The documented recovery: sync, rebase onto the snapshot, resubmit.
    let resp = bob
        .request(2, "document.sync", serde_json::json!({ "haveVersion": 3 }))
        .await?;
    assert_eq!(resp["ok"], true);
    assert_eq!(resp["data"]["version"], 10);
    assert_eq!(resp["data"]["content"], "xxxxxxxxxx");

    let resp = bob
        .request(3, "document.op", insert_op(0, "y", 10))
        .await?;
    assert_eq!(resp["data"]["assignedVersion"], 11);
    client.expect_text("stale", "yxxxxxxxxxx").await;
    Ok(())
}

/// A client that is merely behind gets exactly the log suffix it is
/// missing.
#[tokio::test]
async fn test_sync_returns_log_suffix() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let (mut alice, _, _) = client.join("alice", "suffix").await?;
    for i in 0..5u64 {
        alice
            .request(i + 1, "document.op", insert_op(0, "x", i))
            .await?;
    }

    let resp = alice
        .request(9, "document.sync", serde_json::json!({ "haveVersion": 2 }))
        .await?;
    assert_eq!(resp["ok"], true);
    let operations = resp["data"]["operations"].as_array().unwrap();
    assert_eq!(
        operations
            .iter()
            .map(|entry| entry["version"].as_u64().unwrap())
            .collect::<Vec<_>>(),
        vec![3, 4, 5]
    );
    Ok(())
}

/// A reconnect inside the grace window presents its prior connection id,
/// keeps its membership and pulls the operations it missed.
#[tokio::test]
async fn test_reconnect_within_grace_resumes() -> Result<()> {
    logging();
    let state = Arc::new(ServerState::temporary().await?);
    let client = TestClient::start(server(state)).await?;

    let (mut alice, _, _) = client.join("alice", "resume").await?;
    let (bob, bob_conn, _) = client.join("bob", "resume").await?;

    let resp = alice
        .request(1, "document.op", insert_op(0, "one ", 0))
        .await?;
    assert_eq!(resp["data"]["assignedVersion"], 1);

    // Bob drops off the network.
    drop(bob);
    time::sleep(Duration::from_millis(100)).await;

    // Edits keep flowing while Bob is gone.
    alice
        .request(2, "document.op", insert_op(4, "two ", 1))
        .await?;
    alice
        .request(3, "document.op", insert_op(8, "three", 2))
        .await?;

    // Bob reconnects with his prior connection id and catches up from the
    // version he had applied.
    let mut bob = client
        .connect(&format!("token=bob&resume={bob_conn}"))
        .await?;
    let identity = bob.recv_type("session.identity").await?;
    assert_eq!(identity["payload"]["connectionId"], bob_conn);

    let resp = bob
        .request(1, "document.sync", serde_json::json!({ "haveVersion": 1 }))
        .await?;
    assert_eq!(resp["ok"], true);
    let operations = resp["data"]["operations"].as_array().unwrap();
    assert_eq!(
        operations
            .iter()
            .map(|entry| entry["version"].as_u64().unwrap())
            .collect::<Vec<_>>(),
        vec![2, 3]
    );

    // The resumed session is still attached: editing works immediately.
    let resp = bob
        .request(2, "document.op", insert_op(0, ">", 3))
        .await?;
    assert_eq!(resp["data"]["assignedVersion"], 4);
    client.expect_text("resume", ">one two three").await;
    Ok(())
}

/// After the grace window expires the membership is gone and a resume
/// falls back to a fresh session.
#[tokio::test]
async fn test_reconnect_after_grace_starts_fresh() -> Result<()> {
    logging();
    let config = EngineConfig {
        reconnect_grace: Duration::from_millis(100),
        ..Default::default()
    };
    let state = Arc::new(ServerState::temporary_with(config).await?);
    let client = TestClient::start(server(state)).await?;

    let (mut alice, _, _) = client.join("alice", "expired").await?;
    let (bob, bob_conn, _) = client.join("bob", "expired").await?;

    drop(bob);
    // Alice hears that Bob is gone once the grace window lapses.
    let left = alice.recv_type("user.left").await?;
    assert_eq!(left["payload"]["userId"], "bob");

    let mut bob = client
        .connect(&format!("token=bob&resume={bob_conn}&document=expired"))
        .await?;
    bob.recv_type("session.identity").await?;
    // No membership to resume; the handshake attach delivers a snapshot.
    let snapshot = bob.recv_type("document.snapshot").await?;
    assert_eq!(snapshot["payload"]["version"], 0);
    Ok(())
}
