//! Per-provider request pacing.
//!
//! Each model provider gets a minimum interval of `1/qps` between granted
//! requests. Requests that arrive early wait in a FIFO queue that a single
//! drain task per provider works through.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use switchyard_core::RateLimitConfig;

/// Upper bound on the spacing between grants, matching the slowest accepted qps.
const MAX_INTERVAL: Duration = Duration::from_secs(86_400);

type Waiter = oneshot::Sender<Result<(), RateLimitError>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit queue rejected: provider '{0}' was removed")]
    ProviderRemoved(String),
    #[error("Rate limiter dropped the request")]
    Closed,
    #[error("Invalid rate limit: {0}")]
    InvalidConfig(String),
}

struct ProviderState {
    config: RateLimitConfig,
    last_grant: Option<Instant>,
    last_grant_at: Option<DateTime<Utc>>,
    queue: VecDeque<Waiter>,
    draining: bool,
    /// Bumped when the provider is removed so a stale drain task stops.
    epoch: u64,
}

impl ProviderState {
    fn new(config: RateLimitConfig, epoch: u64) -> Self {
        Self {
            config,
            last_grant: None,
            last_grant_at: None,
            queue: VecDeque::new(),
            draining: false,
            epoch,
        }
    }

    fn limited(&self) -> bool {
        self.config.enabled && self.config.qps.is_finite() && self.config.qps > 0.0
    }

    fn interval(&self) -> Duration {
        if !self.limited() {
            return Duration::ZERO;
        }
        self.config
            .interval()
            .map_or(MAX_INTERVAL, |interval| interval.min(MAX_INTERVAL))
    }

    /// Time left before the next grant is allowed.
    fn remaining(&self, now: Instant) -> Duration {
        match self.last_grant {
            Some(last) if self.limited() => self.interval().saturating_sub(now - last),
            _ => Duration::ZERO,
        }
    }

    fn record_grant(&mut self, now: Instant) {
        self.last_grant = Some(now);
        self.last_grant_at = Some(Utc::now());
    }
}

/// Result of asking for a grant without waiting.
pub enum Admission {
    Granted,
    Queued(QueuedPermit),
}

/// A place in a provider's wait queue.
pub struct QueuedPermit {
    /// Position in the queue when enqueued (1 = next in line)
    pub queue_length: usize,
    /// Lower bound on the wait, from the interval and queue position
    pub estimated_wait: Duration,
    rx: oneshot::Receiver<Result<(), RateLimitError>>,
}

impl QueuedPermit {
    pub async fn wait(self) -> Result<(), RateLimitError> {
        self.rx.await.map_err(|_| RateLimitError::Closed)?
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub provider: String,
    pub enabled: bool,
    pub qps: f64,
    /// 1.0 if a request was granted within the last second, else 0.0.
    /// Not a measured rate.
    pub current_qps: f64,
    pub queue_length: usize,
    pub last_request_at: Option<DateTime<Utc>>,
}

/// Minimum-interval gate shared by every turn that talks to a provider.
#[derive(Clone, Default)]
pub struct RateLimiter {
    state: Arc<Mutex<HashMap<String, ProviderState>>>,
    epochs: Arc<Mutex<u64>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config<'a>(
        limits: impl IntoIterator<Item = (&'a String, &'a RateLimitConfig)>,
    ) -> Self {
        let limiter = Self::new();
        for (provider, config) in limits {
            if let Err(e) = limiter.set_config(provider, *config) {
                warn!(provider = %provider, error = %e, "rate limit skipped");
            }
        }
        limiter
    }

    fn next_epoch(&self) -> u64 {
        let mut epoch = self.epochs.lock().unwrap();
        *epoch += 1;
        *epoch
    }

    /// Add or update a provider's limit. Queued waiters keep their places;
    /// disabling the limit releases them on the next drain step.
    pub fn set_config(&self, provider: &str, config: RateLimitConfig) -> Result<(), RateLimitError> {
        config
            .validate(provider)
            .map_err(|e| RateLimitError::InvalidConfig(e.to_string()))?;
        let epoch = self.next_epoch();
        let mut state = self.state.lock().unwrap();
        match state.get_mut(provider) {
            Some(existing) => existing.config = config,
            None => {
                state.insert(provider.to_string(), ProviderState::new(config, epoch));
            }
        }
        info!(provider, enabled = config.enabled, qps = config.qps, "rate limit configured");
        Ok(())
    }

    /// Drop a provider's limiter, rejecting everyone still waiting on it.
    pub fn remove_provider(&self, provider: &str) {
        let removed = self.state.lock().unwrap().remove(provider);
        if let Some(mut removed) = removed {
            let rejected = removed.queue.len();
            for waiter in removed.queue.drain(..) {
                let _ = waiter.send(Err(RateLimitError::ProviderRemoved(provider.to_string())));
            }
            info!(provider, rejected, "rate limit provider removed");
        }
    }

    /// True if a request could be granted right now.
    pub fn try_immediate(&self, provider: &str) -> bool {
        let state = self.state.lock().unwrap();
        match state.get(provider) {
            Some(s) => s.queue.is_empty() && s.remaining(Instant::now()).is_zero(),
            None => true,
        }
    }

    /// Grant immediately when possible, otherwise join the queue.
    pub fn admit(&self, provider: &str) -> Admission {
        let mut state = self.state.lock().unwrap();
        let Some(s) = state.get_mut(provider) else {
            return Admission::Granted;
        };

        let now = Instant::now();
        if s.queue.is_empty() && s.remaining(now).is_zero() {
            s.record_grant(now);
            return Admission::Granted;
        }

        let (tx, rx) = oneshot::channel();
        s.queue.push_back(tx);
        let queue_length = s.queue.len();
        let ahead = u32::try_from(queue_length.saturating_sub(1)).unwrap_or(u32::MAX);
        let estimated_wait = s
            .remaining(now)
            .saturating_add(s.interval().saturating_mul(ahead));
        debug!(provider, queue_length, ?estimated_wait, "request queued by rate limit");

        if !s.draining {
            s.draining = true;
            let epoch = s.epoch;
            tokio::spawn(drain(self.state.clone(), provider.to_string(), epoch));
        }

        Admission::Queued(QueuedPermit {
            queue_length,
            estimated_wait,
            rx,
        })
    }

    /// Wait for a grant.
    pub async fn acquire(&self, provider: &str) -> Result<(), RateLimitError> {
        match self.admit(provider) {
            Admission::Granted => Ok(()),
            Admission::Queued(permit) => permit.wait().await,
        }
    }

    pub fn status(&self, provider: &str) -> Option<RateLimitStatus> {
        let state = self.state.lock().unwrap();
        state.get(provider).map(|s| status_of(provider, s))
    }

    pub fn status_all(&self) -> Vec<RateLimitStatus> {
        let state = self.state.lock().unwrap();
        let mut all: Vec<_> = state.iter().map(|(name, s)| status_of(name, s)).collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }
}

fn status_of(provider: &str, s: &ProviderState) -> RateLimitStatus {
    let recent = s
        .last_grant
        .is_some_and(|last| Instant::now() - last < Duration::from_secs(1));
    RateLimitStatus {
        provider: provider.to_string(),
        enabled: s.config.enabled,
        qps: s.config.qps,
        current_qps: if recent { 1.0 } else { 0.0 },
        queue_length: s.queue.len(),
        last_request_at: s.last_grant_at,
    }
}

/// Grants the head of a provider's queue once per interval until it is empty.
async fn drain(state: Arc<Mutex<HashMap<String, ProviderState>>>, provider: String, epoch: u64) {
    loop {
        let wait = {
            let mut guard = state.lock().unwrap();
            let Some(s) = guard.get_mut(&provider) else {
                return;
            };
            if s.epoch != epoch {
                return;
            }

            // Waiters that gave up don't consume a slot.
            while s.queue.front().is_some_and(|w| w.is_closed()) {
                s.queue.pop_front();
            }
            if s.queue.is_empty() {
                s.draining = false;
                return;
            }

            let now = Instant::now();
            let remaining = s.remaining(now);
            if remaining.is_zero() {
                if let Some(waiter) = s.queue.pop_front() {
                    s.record_grant(now);
                    let _ = waiter.send(Ok(()));
                    debug!(provider = %provider, queue_length = s.queue.len(), "queued request granted");
                }
                continue;
            }
            remaining
        };
        tokio::time::sleep(wait).await;
    }
}
