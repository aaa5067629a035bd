//! Reachability of the backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl From<bool> for ConnectivityState {
    fn from(online: bool) -> Self {
        if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }
}

/// Answers "can the backend be reached right now?".
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Actively check reachability. Must return within a bounded time.
    async fn ping(&self) -> bool;

    /// Result of the last check, without touching the network.
    fn last_known(&self) -> bool;

    fn state(&self) -> ConnectivityState {
        self.last_known().into()
    }
}

/// Probe hitting `{api_url}/health` with a hard timeout.
#[derive(Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
    health_url: String,
    timeout: Duration,
    last_known: AtomicBool,
}

impl HttpProbe {
    pub fn new(api_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            health_url: format!("{}/health", api_url.trim_end_matches('/')),
            timeout,
            last_known: AtomicBool::new(false),
        }
    }

    fn record(&self, online: bool) {
        let previous = self.last_known.swap(online, Ordering::SeqCst);
        if previous != online {
            tracing::info!(online, "backend connectivity changed");
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn ping(&self) -> bool {
        let request = self.client.get(&self.health_url).send();
        let online = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(resp)) => resp.status().is_success(),
            Ok(Err(err)) => {
                tracing::debug!("health check failed: {err}");
                false
            }
            Err(_) => {
                tracing::debug!(timeout = ?self.timeout, "health check timed out");
                false
            }
        };
        self.record(online);
        online
    }

    fn last_known(&self) -> bool {
        self.last_known.load(Ordering::SeqCst)
    }
}

/// Probe driven by the host's own online/offline notifications.
#[derive(Debug, Default)]
pub struct ManualProbe {
    online: AtomicBool,
}

impl ManualProbe {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for ManualProbe {
    async fn ping(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn last_known(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
