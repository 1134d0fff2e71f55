#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use wirecall::{Endpoint, EndpointConfig, Session};

pub fn server_config() -> EndpointConfig {
    EndpointConfig {
        listen_address: "127.0.0.1:0".to_string(),
        shutdown_timeout_ms: 500,
        ..Default::default()
    }
}

pub fn client_config() -> EndpointConfig {
    EndpointConfig {
        dial_timeout_ms: 2000,
        shutdown_timeout_ms: 500,
        ..Default::default()
    }
}

/// Starts listening and returns the endpoint with its bound address.
pub async fn start_server(server: Endpoint) -> (Endpoint, String) {
    let addr = server.listen().await.expect("listen");
    (server, addr)
}

pub async fn dial(addr: &str) -> (Endpoint, Arc<Session>) {
    let client = Endpoint::new(client_config()).expect("client endpoint");
    let session = client.dial(addr).await.expect("dial");
    (client, session)
}

/// Polls `f` until it holds or a second passes.
pub async fn eventually<F: FnMut() -> bool>(mut f: F) -> bool {
    for _ in 0..100 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}
