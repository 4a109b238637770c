use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, warn};

use async_trait::async_trait;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::{process_payload, AdapterConfig, AuthHandler, DataPoint, SourceAdapter};
use crate::errors::{OracleError, OracleResult};
use crate::services::metrics_service::MetricsService;

/// Fixed backoff between reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Adapter for WebSocket data sources.
///
/// A background receiver parses each text frame, validates and normalizes
/// it, and stores the result as the latest value. `fetch` reads that cell;
/// the value survives reconnects.
pub struct WebSocketAdapter {
    config: AdapterConfig,
    auth: Option<Arc<AuthHandler>>,
    latest: Arc<Mutex<Option<DataPoint>>>,
    ready: Arc<Notify>,
    connected: Arc<RwLock<bool>>,
    running: Arc<RwLock<bool>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    metrics: Option<Arc<MetricsService>>,
}

impl WebSocketAdapter {
    pub fn new(config: AdapterConfig, metrics: Option<Arc<MetricsService>>) -> Self {
        let auth = config.auth.clone().map(|a| Arc::new(AuthHandler::new(a)));
        Self {
            config,
            auth,
            latest: Arc::new(Mutex::new(None)),
            ready: Arc::new(Notify::new()),
            connected: Arc::new(RwLock::new(false)),
            running: Arc::new(RwLock::new(false)),
            receiver: Mutex::new(None),
            metrics,
        }
    }

    async fn build_request(
        endpoint: &str,
        auth: &Option<Arc<AuthHandler>>,
    ) -> OracleResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| OracleError::Configuration(format!("Invalid WebSocket URL: {}", e)))?;

        if let Some(auth) = auth {
            for (name, value) in auth.auth_headers().await? {
                let header_name: tokio_tungstenite::tungstenite::http::HeaderName = name
                    .parse()
                    .map_err(|_| OracleError::Auth(format!("Invalid auth header name: {}", name)))?;
                let header_value = value
                    .parse()
                    .map_err(|_| OracleError::Auth("Invalid auth header value".to_string()))?;
                request.headers_mut().insert(header_name, header_value);
            }
        }

        Ok(request)
    }

    /// Long-lived receiver loop. Reconnects with a fixed delay on transport
    /// errors; the latest value is preserved across reconnects.
    async fn receive_loop(
        config: AdapterConfig,
        auth: Option<Arc<AuthHandler>>,
        latest: Arc<Mutex<Option<DataPoint>>>,
        ready: Arc<Notify>,
        connected: Arc<RwLock<bool>>,
        running: Arc<RwLock<bool>>,
        metrics: Option<Arc<MetricsService>>,
    ) {
        while *running.read().await {
            let request = match Self::build_request(&config.endpoint, &auth).await {
                Ok(req) => req,
                Err(e) => {
                    error!("Failed to build WebSocket request for {}: {}", config.source_id, e);
                    sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            let stream = match tokio_tungstenite::connect_async(request).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("WebSocket connect failed for {}: {}", config.source_id, e);
                    if let Some(metrics) = &metrics {
                        metrics.record_source_error(&config.source_id, "network");
                    }
                    sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            {
                let mut flag = connected.write().await;
                *flag = true;
            }
            ready.notify_waiters();
            debug!("WebSocket connected for {}", config.source_id);

            let (_, mut read) = stream.split();
            while *running.read().await {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(payload) => match process_payload(&config, payload) {
                                Ok(point) => {
                                    if let (Some(metrics), Some(v)) =
                                        (&metrics, point.value.as_f64())
                                    {
                                        metrics.record_source_value(
                                            &config.source_id,
                                            config.source_type.as_str(),
                                            v,
                                        );
                                    }
                                    let mut slot = latest.lock().await;
                                    *slot = Some(point);
                                }
                                Err(e) => {
                                    debug!(
                                        "Discarding invalid message from {}: {}",
                                        config.source_id, e
                                    );
                                }
                            },
                            Err(e) => {
                                error!(
                                    "Failed to parse WebSocket message from {}: {}",
                                    config.source_id, e
                                );
                                if let Some(metrics) = &metrics {
                                    metrics.record_source_error(&config.source_id, "data_source");
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("WebSocket closed for {}", config.source_id);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket transport error for {}: {}", config.source_id, e);
                        if let Some(metrics) = &metrics {
                            metrics.record_source_error(&config.source_id, "network");
                        }
                        break;
                    }
                }
            }

            {
                let mut flag = connected.write().await;
                *flag = false;
            }

            if *running.read().await {
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for WebSocketAdapter {
    async fn connect(&self) -> OracleResult<()> {
        let mut receiver = self.receiver.lock().await;
        if receiver.is_some() {
            return Ok(());
        }

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let handle = tokio::spawn(Self::receive_loop(
            self.config.clone(),
            self.auth.clone(),
            Arc::clone(&self.latest),
            Arc::clone(&self.ready),
            Arc::clone(&self.connected),
            Arc::clone(&self.running),
            self.metrics.clone(),
        ));
        *receiver = Some(handle);
        drop(receiver);

        // Wait for the first successful handshake within the source timeout.
        let deadline = Duration::from_secs(self.config.timeout);
        let connected = Arc::clone(&self.connected);
        let ready = Arc::clone(&self.ready);
        let wait = async move {
            loop {
                // Register for the wakeup before checking the flag so a
                // notification between the two cannot be lost.
                let notified = ready.notified();
                if *connected.read().await {
                    return;
                }
                notified.await;
            }
        };

        timeout(deadline, wait)
            .await
            .map_err(|_| OracleError::Network(format!(
                "WebSocket connection to {} timed out",
                self.config.endpoint
            )))
    }

    async fn disconnect(&self) -> OracleResult<()> {
        {
            let mut running = self.running.write().await;
            *running = false;
        }
        if let Some(handle) = self.receiver.lock().await.take() {
            handle.abort();
        }
        let mut connected = self.connected.write().await;
        *connected = false;
        Ok(())
    }

    async fn fetch(&self) -> OracleResult<DataPoint> {
        if self.receiver.lock().await.is_none() {
            self.connect().await?;
        }

        let start = Instant::now();
        let latest = self.latest.lock().await.clone();
        match latest {
            Some(point) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_source_latency(
                        &self.config.source_id,
                        "fetch",
                        self.config.source_type.as_str(),
                        start.elapsed().as_secs_f64(),
                    );
                }
                Ok(point)
            }
            None => Err(OracleError::DataSource(format!(
                "No data received yet from {}",
                self.config.source_id
            ))),
        }
    }

    fn config(&self) -> &AdapterConfig {
        &self.config
    }
}
