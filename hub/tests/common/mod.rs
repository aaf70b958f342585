#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use rover_hub::clock::Clock;
use rover_hub::config::SessionConfig;
use rover_hub::dispatcher::{self, HubState};
use rover_hub::registry::{RoverRegistry, SharedRegistry};
use rover_hub::store::MemoryRoverStore;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestHub {
    pub addr: SocketAddr,
    pub registry: SharedRegistry,
    pub shutdown: CancellationToken,
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn start_hub(clock: Arc<dyn Clock>, session: SessionConfig) -> TestHub {
    let registry = Arc::new(RoverRegistry::new(Arc::new(MemoryRoverStore::new()), clock));
    let shutdown = CancellationToken::new();
    let app = dispatcher::build_app(HubState::new(registry.clone(), session, shutdown.clone()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(dispatcher::serve(listener, app, shutdown.clone()));

    TestHub {
        addr,
        registry,
        shutdown,
    }
}

impl TestHub {
    pub async fn connect(&self, path: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{}{}", self.addr, path))
            .await
            .unwrap();
        ws
    }

    pub async fn rover(&self) -> Client {
        self.connect("/ws").await
    }
}

pub async fn send(client: &mut Client, frame: &str) {
    client.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames
pub async fn recv(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {:?}", other),
        }
    }
}

/// Sends CONNECT and returns the bound rover id
pub async fn connect_rover(client: &mut Client, identifier: &str) -> i64 {
    send(
        client,
        &format!(
            r#"{{"type":"CONNECT","payload":{{"type":"rover","identifier":"{}"}}}}"#,
            identifier
        ),
    )
    .await;
    let ack = recv(client).await;
    assert_eq!(ack["type"], "ACK", "CONNECT not acknowledged: {}", ack);
    ack["roverId"].as_i64().unwrap()
}

pub fn telemetry_frame(rover_id: i64, battery: f64) -> String {
    format!(
        r#"{{"type":"TELEMETRY","roverId":{},"payload":{{"sensorData":{{"temperature":22.5,"batteryLevel":{},"currentPosition":{{"x":1.0,"y":2.0,"z":0.0}}}}}}}}"#,
        rover_id, battery
    )
}
