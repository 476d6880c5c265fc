//! Package-registry mirror selection for `npx`-launched providers.
//!
//! All candidates are probed concurrently under one timeout; the fastest
//! successful probe wins and is cached for the configured validity window.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use switchyard_core::MirrorSettings;

/// One latency probe against a candidate registry.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, registry: &str) -> Result<(), String>;
}

/// Fetches `{registry}{probe_path}` and accepts any success status.
pub struct HttpProber {
    client: reqwest::Client,
    probe_path: String,
}

impl HttpProber {
    pub fn new(probe_path: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            probe_path: probe_path.into(),
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, registry: &str) -> Result<(), String> {
        let url = format!("{}{}", registry.trim_end_matches('/'), self.probe_path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status().as_u16()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub registry: String,
    pub latency_ms: Option<u128>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirrorChoice {
    pub registry: String,
    pub latency_ms: Option<u128>,
    /// Served from cache without probing
    pub cached: bool,
    /// Every probe failed; this is the configured fallback
    pub fallback: bool,
}

struct Cached {
    choice: MirrorChoice,
    chosen_at: Instant,
}

pub struct MirrorSelector {
    settings: MirrorSettings,
    prober: Arc<dyn Prober>,
    cache: Mutex<Option<Cached>>,
}

impl MirrorSelector {
    pub fn new(settings: MirrorSettings) -> Self {
        let prober = Arc::new(HttpProber::new(settings.probe_path.clone()));
        Self::with_prober(settings, prober)
    }

    pub fn with_prober(settings: MirrorSettings, prober: Arc<dyn Prober>) -> Self {
        Self {
            settings,
            prober,
            cache: Mutex::new(None),
        }
    }

    /// Probe every candidate concurrently. Each probe is dropped when the
    /// shared timeout elapses.
    pub async fn probe_all(&self) -> Vec<ProbeResult> {
        let timeout = self.settings.probe_timeout();
        let probes = self.settings.candidates.iter().map(|registry| async move {
            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, self.prober.probe(registry)).await;
            let (latency_ms, error) = match outcome {
                Ok(Ok(())) => (Some(started.elapsed().as_millis()), None),
                Ok(Err(e)) => (None, Some(e)),
                Err(_) => (None, Some(format!("timed out after {}ms", timeout.as_millis()))),
            };
            debug!(registry = %registry, ?latency_ms, ?error, "registry probed");
            ProbeResult {
                registry: registry.clone(),
                latency_ms,
                error,
            }
        });
        join_all(probes).await
    }

    /// The registry to use. Serves the cached winner while it is valid unless
    /// `refresh` is set.
    pub async fn select(&self, refresh: bool) -> MirrorChoice {
        if !refresh {
            if let Some(cached) = self.cached() {
                return cached;
            }
        }

        let results = self.probe_all().await;
        let best = results
            .iter()
            .filter_map(|r| r.latency_ms.map(|latency| (r, latency)))
            .min_by_key(|(_, latency)| *latency);

        match best {
            Some((result, latency)) => {
                let choice = MirrorChoice {
                    registry: result.registry.clone(),
                    latency_ms: Some(latency),
                    cached: false,
                    fallback: false,
                };
                info!(registry = %choice.registry, latency_ms = latency, "registry mirror selected");
                *self.cache.lock().unwrap() = Some(Cached {
                    choice: choice.clone(),
                    chosen_at: Instant::now(),
                });
                choice
            }
            None => {
                warn!(fallback = %self.settings.fallback, "all registry probes failed, using fallback");
                MirrorChoice {
                    registry: self.settings.fallback.clone(),
                    latency_ms: None,
                    cached: false,
                    fallback: true,
                }
            }
        }
    }

    fn cached(&self) -> Option<MirrorChoice> {
        let cache = self.cache.lock().unwrap();
        cache
            .as_ref()
            .filter(|c| c.chosen_at.elapsed() < self.settings.cache_ttl())
            .map(|c| MirrorChoice {
                cached: true,
                ..c.choice.clone()
            })
    }
}
