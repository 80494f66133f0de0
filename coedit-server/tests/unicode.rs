//! Tests pinning operation positions to Unicode code points.

use std::sync::Arc;

use anyhow::Result;
use coedit_server::{ServerState, server};
use common::*;

pub mod common;

#[tokio::test]
async fn test_positions_count_code_points() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let (mut socket, _, _) = client.join("alice", "unicode").await?;

    // Two non-BMP code points; in UTF-16 units this would be length 4.
    let resp = socket
        .request(1, "document.op", insert_op(0, "🎉🎉", 0))
        .await?;
    assert_eq!(resp["data"]["assignedVersion"], 1);

    // Position 1 splits the pair only if indexing is per code point.
    let resp = socket
        .request(2, "document.op", insert_op(1, "x", 1))
        .await?;
    assert_eq!(resp["ok"], true);
    client.expect_text("unicode", "🎉x🎉").await;
    Ok(())
}

#[tokio::test]
async fn test_delete_spans_code_points() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let (mut socket, _, _) = client.join("alice", "unidelete").await?;
    socket
        .request(1, "document.op", insert_op(0, "a🎉b🎉c", 0))
        .await?;

    // Remove "🎉b🎉" — three code points starting at index 1.
    let resp = socket
        .request(2, "document.op", delete_op(1, 3, 1))
        .await?;
    assert_eq!(resp["ok"], true);
    client.expect_text("unidelete", "ac").await;
    Ok(())
}

#[tokio::test]
async fn test_out_of_range_counts_code_points_not_bytes() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let (mut socket, _, _) = client.join("alice", "unibounds").await?;
    socket
        .request(1, "document.op", insert_op(0, "🎉🎉", 0))
        .await?;

    // The document holds 2 code points (8 UTF-8 bytes); position 3 is out
    // of range even though byte index 3 exists.
    let resp = socket
        .request(2, "document.op", insert_op(3, "x", 1))
        .await?;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "OutOfRange");

    let resp = socket
        .request(3, "document.op", insert_op(2, "!", 1))
        .await?;
    assert_eq!(resp["ok"], true);
    client.expect_text("unibounds", "🎉🎉!").await;
    Ok(())
}
