//! An HTTP endpoint recording the JSON documents posted to it, standing in for
//! alert webhooks and callback sinks.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use serde_json::Value;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
pub struct Collector {
    received: Arc<Mutex<Vec<Value>>>,
}

impl Collector {
    /// Start collecting on `/hook`, returning the collector and its URL
    pub async fn spawn() -> (Self, String) {
        let collector = Collector::default();

        let app = Router::new()
            .route("/hook", post(receive))
            .with_state(collector.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address: SocketAddr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (collector, format!("http://{address}/hook"))
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until at least `count` documents arrived, or a second passed
    pub async fn wait_for(&self, count: usize) -> Vec<Value> {
        for _ in 0..50 {
            if self.received.lock().unwrap().len() >= count {
                break;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.received()
    }
}

async fn receive(State(collector): State<Collector>, Json(body): Json<Value>) -> StatusCode {
    collector.received.lock().unwrap().push(body);
    StatusCode::OK
}
