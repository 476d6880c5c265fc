//! Permission gate for tool invocations.
//!
//! Tools are classified as read or write from the verb in their name and
//! checked against the owning provider's auto-approve policy. Anything the
//! policy does not cover becomes a pending [`PermissionRequest`] rather than
//! an execution.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info};

pub use switchyard_core::{AutoApprovePolicy, PermissionType};

const READ_VERBS: &[&str] = &[
    "read", "list", "get", "show", "view", "fetch", "search", "find", "query", "tree",
];

const WRITE_VERBS: &[&str] = &[
    "write", "create", "update", "delete", "modify", "edit", "remove", "add", "insert", "save",
    "execute", "run", "call", "move", "copy", "mkdir", "rmdir",
];

/// Classify a tool by the verb embedded in its original name.
///
/// Read verbs are checked first, so `get_address` is a read even though it
/// contains "add". Unrecognized names are treated as writes.
pub fn classify(original_name: &str) -> PermissionType {
    let lower = original_name.to_lowercase();
    if READ_VERBS.iter().any(|verb| lower.contains(verb)) {
        return PermissionType::Read;
    }
    if WRITE_VERBS.iter().any(|verb| lower.contains(verb)) {
        return PermissionType::Write;
    }
    PermissionType::Write
}

/// True when `policy` pre-authorizes the tool named `original_name`.
pub fn check(original_name: &str, policy: &AutoApprovePolicy) -> bool {
    policy.allows(classify(original_name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionResolution {
    Pending,
    Approved,
    Denied,
}

/// A tool invocation held back until the user decides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    /// Canonical name the model used
    pub tool_name: String,
    /// Name the provider knows the tool by
    pub original_name: String,
    pub provider: String,
    pub permission_type: PermissionType,
    pub resolution: PermissionResolution,
    /// Whether an approval may be persisted into the provider's policy
    pub rememberable: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum PermissionDecision {
    Approved(PermissionType),
    NeedsApproval(PendingApproval),
}

/// A held call's handle on the decision for its request.
#[derive(Debug)]
pub struct PendingApproval {
    pub request: PermissionRequest,
    decision: oneshot::Receiver<PermissionResolution>,
}

impl PendingApproval {
    /// Wait until the request is resolved. A request withdrawn without a
    /// decision reads as denied.
    pub async fn decision(&mut self) -> PermissionResolution {
        (&mut self.decision)
            .await
            .unwrap_or(PermissionResolution::Denied)
    }
}

/// A pending request and the channel its decision is delivered on.
struct Held {
    request: PermissionRequest,
    decision: oneshot::Sender<PermissionResolution>,
}

#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("Unknown permission request: {0}")]
    UnknownRequest(String),
    #[error("Policy store error: {0}")]
    Store(String),
}

/// Where auto-approve policies live. The runtime reads and updates them but
/// does not own their persistence.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn policy(&self, provider: &str) -> AutoApprovePolicy;

    /// Persist a remembered grant.
    async fn grant(&self, provider: &str, permission: PermissionType)
        -> Result<(), PermissionError>;
}

/// Policy store backed by a map, seeded from configuration.
#[derive(Default)]
pub struct InMemoryPolicyStore {
    policies: Mutex<HashMap<String, AutoApprovePolicy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_policies(policies: impl IntoIterator<Item = (String, AutoApprovePolicy)>) -> Self {
        Self {
            policies: Mutex::new(policies.into_iter().collect()),
        }
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn policy(&self, provider: &str) -> AutoApprovePolicy {
        self.policies
            .lock()
            .unwrap()
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    async fn grant(
        &self,
        provider: &str,
        permission: PermissionType,
    ) -> Result<(), PermissionError> {
        self.policies
            .lock()
            .unwrap()
            .entry(provider.to_string())
            .or_default()
            .grant(permission);
        Ok(())
    }
}

/// Decides whether a tool call may run, and tracks the requests it raised.
///
/// A denial only blocks the call that raised it; the next identical call is
/// evaluated afresh.
pub struct PermissionGate {
    store: Arc<dyn PolicyStore>,
    session_grants: Mutex<HashMap<String, AutoApprovePolicy>>,
    pending: Mutex<HashMap<String, Held>>,
}

impl PermissionGate {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            store,
            session_grants: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn evaluate(
        &self,
        provider: &str,
        original_name: &str,
        canonical_name: &str,
    ) -> PermissionDecision {
        let permission_type = classify(original_name);
        let policy = self.store.policy(provider).await;
        let session_allows = self
            .session_grants
            .lock()
            .unwrap()
            .get(provider)
            .is_some_and(|grants| grants.allows(permission_type));

        if policy.allows(permission_type) || session_allows {
            debug!(provider, tool = original_name, %permission_type, "tool call approved");
            return PermissionDecision::Approved(permission_type);
        }

        let request = PermissionRequest {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: canonical_name.to_string(),
            original_name: original_name.to_string(),
            provider: provider.to_string(),
            permission_type,
            resolution: PermissionResolution::Pending,
            rememberable: true,
            created_at: Utc::now(),
        };
        info!(
            provider,
            tool = original_name,
            %permission_type,
            request_id = %request.id,
            "tool call needs permission"
        );
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            request.id.clone(),
            Held {
                request: request.clone(),
                decision: tx,
            },
        );
        PermissionDecision::NeedsApproval(PendingApproval {
            request,
            decision: rx,
        })
    }

    /// Resolve a pending request and wake the call holding it. With
    /// `remember`, an approval is written to the policy store; otherwise it
    /// lasts for this gate's session only.
    pub async fn resolve(
        &self,
        request_id: &str,
        granted: bool,
        remember: bool,
    ) -> Result<PermissionRequest, PermissionError> {
        let Held {
            mut request,
            decision,
        } = self
            .pending
            .lock()
            .unwrap()
            .remove(request_id)
            .ok_or_else(|| PermissionError::UnknownRequest(request_id.to_string()))?;

        if !granted {
            request.resolution = PermissionResolution::Denied;
            info!(request_id, provider = %request.provider, "permission denied");
            let _ = decision.send(PermissionResolution::Denied);
            return Ok(request);
        }

        request.resolution = PermissionResolution::Approved;
        if remember && request.rememberable {
            self.store
                .grant(&request.provider, request.permission_type)
                .await?;
            info!(
                request_id,
                provider = %request.provider,
                permission = %request.permission_type,
                "permission granted and remembered"
            );
        } else {
            self.session_grants
                .lock()
                .unwrap()
                .entry(request.provider.clone())
                .or_default()
                .grant(request.permission_type);
            info!(
                request_id,
                provider = %request.provider,
                permission = %request.permission_type,
                "permission granted for this session"
            );
        }
        let _ = decision.send(PermissionResolution::Approved);
        Ok(request)
    }

    /// Drop a pending request without a decision, e.g. when its turn was
    /// cancelled while waiting.
    pub fn withdraw(&self, request_id: &str) -> Option<PermissionRequest> {
        let held = self.pending.lock().unwrap().remove(request_id)?;
        debug!(request_id, provider = %held.request.provider, "permission request withdrawn");
        Some(held.request)
    }

    pub fn pending(&self) -> Vec<PermissionRequest> {
        let mut requests: Vec<_> = self
            .pending
            .lock()
            .unwrap()
            .values()
            .map(|held| held.request.clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    pub fn clear_session_grants(&self) {
        self.session_grants.lock().unwrap().clear();
    }
}
