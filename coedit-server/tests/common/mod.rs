use std::net::SocketAddr;

use anyhow::{Result, anyhow};
use axum::http::StatusCode;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A test WebSocket client that sends and receives JSON frames.
pub struct JsonSocket(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>);

impl JsonSocket {
    pub async fn send(&mut self, msg: &Value) {
        self.0.send(msg.to_string().into()).await.unwrap();
    }

    pub async fn recv(&mut self) -> Result<Value> {
        let msg = self
            .0
            .next()
            .await
            .ok_or_else(|| anyhow!("WebSocket closed"))??;
        let msg = msg.to_text().map_err(|_| anyhow!("non-string message"))?;
        Ok(serde_json::from_str(msg)?)
    }

    /// Receive frames until one of the given type arrives, discarding the
    /// rest. Keeps tests robust against interleaved presence traffic.
    pub async fn recv_type(&mut self, ty: &str) -> Result<Value> {
        for _ in 0..64 {
            let msg = self.recv().await?;
            if msg.get("type").and_then(Value::as_str) == Some(ty) {
                return Ok(msg);
            }
        }
        Err(anyhow!("no {ty} frame within 64 messages"))
    }

    /// Send a request frame and wait for its response, skipping events.
    pub async fn request(&mut self, request_id: u64, ty: &str, payload: Value) -> Result<Value> {
        let mut frame = json!({ "type": ty, "requestId": request_id });
        if !payload.is_null() {
            frame["payload"] = payload;
        }
        info!("sending request {frame}");
        self.send(&frame).await;
        for _ in 0..64 {
            let msg = self.recv().await?;
            if msg.get("requestId").and_then(Value::as_u64) == Some(request_id) {
                return Ok(msg);
            }
        }
        Err(anyhow!("no response for request {request_id}"))
    }

    pub async fn recv_closed(&mut self) -> Result<u16> {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Close(frame))) => {
                    return Ok(frame.map(|f| f.code.into()).unwrap_or(1000));
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Err(anyhow!("WebSocket ended without close frame")),
            }
        }
    }
}

/// An insert operation payload in wire shape.
pub fn insert_op(position: usize, text: &str, base_version: u64) -> Value {
    json!({
        "op": {
            "kind": "insert",
            "text": text,
            "position": position,
            "baseVersion": base_version,
            "clientId": "client-chosen-ignored",
        }
    })
}

/// A delete operation payload in wire shape.
pub fn delete_op(position: usize, length: usize, base_version: u64) -> Value {
    json!({
        "op": {
            "kind": "delete",
            "length": length,
            "position": position,
            "baseVersion": base_version,
            "clientId": "client-chosen-ignored",
        }
    })
}

pub struct TestClient {
    client: reqwest::Client,
    addr: SocketAddr,
}

impl TestClient {
    pub async fn start(router: axum::Router) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router.layer(TraceLayer::new_for_http())).into_future());
        let client = reqwest::Client::new();
        Ok(Self { client, addr })
    }

    pub async fn get(&self, path: &str) -> Result<String> {
        let url = format!("http://{}/{}", self.addr, path);
        info!("GET {}", url);
        let resp = self.client.get(&url).send().await?;
        assert_eq!(resp.status(), StatusCode::OK);
        Ok(resp.text().await?)
    }

    pub async fn expect_text(&self, id: &str, expected: &str) {
        let actual = self.get(&format!("api/text/{id}")).await.unwrap();
        assert_eq!(actual, expected);
    }

    /// Open a socket with the given query string, e.g.
    /// `"token=alice&document=foo"`.
    pub async fn connect(&self, query: &str) -> Result<JsonSocket> {
        let (socket, _response) =
            tokio_tungstenite::connect_async(format!("ws://{}/api/socket?{query}", self.addr))
                .await?;
        Ok(JsonSocket(socket))
    }

    /// Connect attached to `document`, consuming the identity and snapshot
    /// frames. Returns the socket, its connection id and the snapshot.
    pub async fn join(&self, token: &str, document: &str) -> Result<(JsonSocket, u64, Value)> {
        let mut socket = self
            .connect(&format!("token={token}&document={document}"))
            .await?;
        let identity = socket.recv_type("session.identity").await?;
        let conn = identity["payload"]["connectionId"].as_u64().unwrap();
        let snapshot = socket.recv_type("document.snapshot").await?;
        Ok((socket, conn, snapshot["payload"].clone()))
    }
}

pub fn logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coedit_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init()
        .ok();
}
