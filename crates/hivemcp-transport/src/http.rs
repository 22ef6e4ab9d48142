use crate::error::{TransportError, TransportResult};
use crate::frame::Frame;
use crate::retry::RetryPolicy;
use crate::{ConnState, Transport};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Configuration for a streamable-HTTP provider transport: one POST per
/// call, server-sent events for out-of-band notifications.
#[derive(Debug, Clone)]
pub struct StreamableHttpConfig {
    pub base_url: Url,
    pub events_path: String,
    pub connect_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub headers: Vec<(String, String)>,
}

impl StreamableHttpConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            events_path: "/events".to_string(),
            connect_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            headers: Vec::new(),
        }
    }
}

pub struct StreamableHttpTransport {
    config: StreamableHttpConfig,
    client: reqwest::Client,
    state: Arc<StdMutex<ConnState>>,
}

impl std::fmt::Debug for StreamableHttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpTransport")
            .field("base_url", &self.config.base_url)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl StreamableHttpTransport {
    pub fn new(config: StreamableHttpConfig) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.connect_timeout)
            .build()
            .map_err(TransportError::Http)?;
        Ok(Self {
            config,
            client,
            state: Arc::new(StdMutex::new(ConnState::NotStarted)),
        })
    }

    fn set_state(&self, s: ConnState) {
        *self.state.lock() = s;
    }

    async fn post_with_retry(&self, frame: &Frame, timeout: Duration) -> TransportResult<Frame> {
        let mut attempt = 0;
        loop {
            let mut req = self
                .client
                .post(self.config.base_url.clone())
                .timeout(timeout)
                .body(frame.as_bytes().to_vec());
            for (k, v) in &self.config.headers {
                req = req.header(k, v);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let bytes = resp.bytes().await.map_err(TransportError::Http)?;
                    return Ok(Frame::new(bytes));
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_server_error() {
                        return Err(TransportError::ProtocolMalformed(format!(
                            "provider returned {status}"
                        )));
                    }
                }
                Err(e) if e.is_timeout() => return Err(TransportError::Timeout(timeout)),
                Err(e) => {
                    if let Some(delay) = self.config.retry_policy.delay(attempt) {
                        tracing::debug!(attempt, ?delay, error = %e, "retrying provider call");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(TransportError::Http(e));
                }
            }

            match self.config.retry_policy.delay(attempt) {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(TransportError::StartupFailed("retries exhausted".into())),
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn start(&self) -> TransportResult<()> {
        let state = *self.state.lock();
        if state != ConnState::NotStarted {
            return Err(TransportError::StartupFailed("already started".into()));
        }
        self.set_state(ConnState::Open);
        Ok(())
    }

    async fn call(&self, frame: Frame, timeout: Duration) -> TransportResult<Frame> {
        if self.state() != ConnState::Open {
            return Err(TransportError::Closed);
        }
        self.post_with_retry(&frame, timeout).await
    }

    async fn notify(&self, frame: Frame) -> TransportResult<()> {
        if self.state() != ConnState::Open {
            return Err(TransportError::Closed);
        }
        self.post_with_retry(&frame, self.config.connect_timeout)
            .await
            .map(|_| ())
    }

    async fn notifications(&self) -> TransportResult<mpsc::Receiver<Frame>> {
        let (tx, rx) = mpsc::channel(64);
        let mut url = self.config.base_url.clone();
        url.set_path(&self.config.events_path);
        let client = self.client.clone();

        tokio::spawn(async move {
            let resp = match client.get(url).send().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open provider event stream");
                    return;
                }
            };
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if tx.send(Frame::new(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "provider event stream ended");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    fn state(&self) -> ConnState {
        *self.state.lock()
    }

    async fn close(&self) -> TransportResult<()> {
        self.set_state(ConnState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_events_path() {
        let cfg = StreamableHttpConfig::new(Url::parse("http://localhost:9000").unwrap());
        assert_eq!(cfg.events_path, "/events");
    }

    #[tokio::test]
    async fn starts_in_not_started_state() {
        let cfg = StreamableHttpConfig::new(Url::parse("http://localhost:9000").unwrap());
        let transport = StreamableHttpTransport::new(cfg).unwrap();
        assert_eq!(transport.state(), ConnState::NotStarted);
        transport.start().await.unwrap();
        assert_eq!(transport.state(), ConnState::Open);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let cfg = StreamableHttpConfig::new(Url::parse("http://localhost:9000").unwrap());
        let transport = StreamableHttpTransport::new(cfg).unwrap();
        transport.start().await.unwrap();
        assert!(transport.start().await.is_err());
    }
}
