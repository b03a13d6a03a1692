pub mod collector;
pub mod guardrails;
pub mod llms;

use std::net::SocketAddr;
use std::time::Duration;

use config::Config;
use reqwest::Method;
use serde_json::Value;
use server::ServeConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::llms::TestLlmProvider;

/// Test client for making HTTP requests to the test server
#[derive(Clone)]
pub struct TestClient {
    base_url: String,
    client: reqwest::Client,
    api_key: Option<String>,
}

impl TestClient {
    /// Create a new test client for the given base URL
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
            api_key: None,
        }
    }

    /// A client sending `Authorization: Bearer <key>` with every request
    pub fn with_key(&self, key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            ..self.clone()
        }
    }

    /// A request builder with the client's credential attached
    pub fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.request(method, format!("{}{}", self.base_url, path));

        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Send a POST request to the given path with JSON body
    pub async fn post<T: serde::Serialize>(&self, path: &str, body: &T) -> reqwest::Response {
        self.request(Method::POST, path).json(body).send().await.unwrap()
    }

    /// Send a GET request to the given path
    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.request(Method::GET, path).send().await.unwrap()
    }

    /// Send a DELETE request to the given path
    pub async fn delete(&self, path: &str) -> reqwest::Response {
        self.request(Method::DELETE, path).send().await.unwrap()
    }

    /// POST a chat completion and return the status with the parsed body
    pub async fn completions(&self, body: &Value) -> (u16, Value) {
        let response = self.post("/v1/chat/completions", body).await;
        let status = response.status().as_u16();

        (status, response.json().await.unwrap())
    }
}

/// Collects mock upstreams whose configuration is prepended to the test configuration.
#[derive(Default)]
pub struct TestServerBuilder {
    providers: Vec<String>,
}

impl TestServerBuilder {
    /// Start a mock provider and register it in the configuration
    pub async fn spawn_llm(&mut self, provider: impl TestLlmProvider) -> SocketAddr {
        let config = Box::new(provider).spawn().await.unwrap();
        self.providers.push(config.generate_config());

        config.address
    }

    /// Start the server with the mocks plus the given TOML configuration
    pub async fn build(self, config_toml: &str) -> TestServer {
        let mut config_toml = config_toml.to_string();

        for provider in self.providers {
            config_toml.push_str(&provider);
        }

        TestServer::start(&config_toml).await
    }
}

/// Test server that manages the lifecycle of a server instance
pub struct TestServer {
    pub client: TestClient,
    pub address: SocketAddr,
    metrics_address: SocketAddr,
    shutdown: CancellationToken,
    handle: Option<tokio::task::JoinHandle<anyhow::Result<()>>>,
}

impl TestServer {
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder::default()
    }

    /// Start a new test server with the given TOML configuration
    pub async fn start(config_toml: &str) -> Self {
        let mut config: Config = toml::from_str(config_toml).unwrap();
        config.validate().unwrap();

        let address = free_address().await;
        let metrics_address = free_address().await;

        // tests run in parallel, so the default metrics port cannot be shared
        config.telemetry.metrics.listen = Some(metrics_address.to_string());

        let shutdown = CancellationToken::new();

        let serve_config = ServeConfig {
            listen_address: address,
            config,
            shutdown_signal: shutdown.clone(),
        };

        let handle = tokio::spawn(server::serve(serve_config));

        for _ in 0..50 {
            if TcpStream::connect(address).await.is_ok() {
                break;
            }

            if handle.is_finished() {
                let result = handle.await.unwrap();
                unreachable!("Server failed to start: {result:?}");
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        TestServer {
            client: TestClient::new(format!("http://{address}")),
            address,
            metrics_address,
            shutdown,
            handle: Some(handle),
        }
    }

    /// The Prometheus text served by the metrics listener
    pub async fn metrics(&self) -> String {
        let url = format!("http://{}/metrics", self.metrics_address);

        for _ in 0..50 {
            if let Ok(response) = reqwest::get(&url).await {
                return response.text().await.unwrap();
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        unreachable!("metrics endpoint at {url} never came up")
    }

    /// Cancel the server and wait until it has flushed its callbacks
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();

        if let Some(handle) = self.handle.take() {
            handle.await.unwrap().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn free_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// The first line of a Prometheus text exposition starting with `metric` and containing
/// every label in `labels`.
pub fn metric_line<'a>(text: &'a str, metric: &str, labels: &[&str]) -> Option<&'a str> {
    text.lines()
        .filter(|line| line.starts_with(metric))
        .find(|line| labels.iter().all(|label| line.contains(label)))
}

/// The sample value of a Prometheus text line.
pub fn metric_value(line: &str) -> f64 {
    line.rsplit(' ').next().unwrap().parse().unwrap()
}

/// The JSON payloads of a server-sent event body, without the `[DONE]` marker.
pub fn sse_payloads(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}
