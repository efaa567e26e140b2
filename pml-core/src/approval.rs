//! Pending-approval store: the human-in-the-loop gate between the
//! capability loader and anything that requires explicit user sign-off
//! (new dependency, new backend integrity hash, new API key, ask-mode
//! tool call).

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::model::PendingApproval;

/// How long a pending approval stays resolvable after it's created. Past
/// this, the entry is treated as gone: a later `continue_invocation` on
/// the same workflow id must fail rather than silently resuming a request
/// the caller may no longer even remember issuing.
pub const APPROVAL_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("workflow `{0}` is unknown or has expired")]
    UnknownWorkflow(String),
    #[error("approval for workflow `{0}` timed out waiting for a user decision")]
    TimedOut(String),
}

struct Waiter {
    approval: PendingApproval,
    sender: tokio::sync::oneshot::Sender<ApprovalOutcome>,
}

/// In-memory table of approvals awaiting a user decision, keyed by a
/// freshly-minted workflow id. Each entry holds the one-shot channel its
/// issuing call is blocked on.
#[derive(Default)]
pub struct ApprovalStore {
    pending: DashMap<String, Waiter>,
}

impl ApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending approval and return its workflow id together
    /// with a receiver the caller awaits for the user's decision.
    pub fn create(
        &self,
        approval: PendingApproval,
    ) -> (String, tokio::sync::oneshot::Receiver<ApprovalOutcome>) {
        let workflow_id = approval.workflow_id.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending.insert(workflow_id.clone(), Waiter { approval, sender: tx });
        (workflow_id, rx)
    }

    pub fn next_workflow_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Drop `workflow_id` if its TTL has elapsed, treating it as if it had
    /// already been resolved. Called before every lookup so an expired
    /// entry never satisfies a later `get`/`resolve`/`take`.
    fn evict_if_expired(&self, workflow_id: &str) {
        let expired = self
            .pending
            .get(workflow_id)
            .map(|w| Utc::now() - w.approval.created_at > chrono::Duration::from_std(APPROVAL_TTL).unwrap())
            .unwrap_or(false);
        if expired {
            if let Some((_, waiter)) = self.pending.remove(workflow_id) {
                let _ = waiter.sender.send(ApprovalOutcome::Rejected);
            }
        }
    }

    pub fn get(&self, workflow_id: &str) -> Option<PendingApproval> {
        self.evict_if_expired(workflow_id);
        self.pending.get(workflow_id).map(|w| w.approval.clone())
    }

    /// Resolve a pending approval with the user's decision. Returns an
    /// error if the workflow id is unknown (already resolved, expired, or
    /// never existed).
    pub fn resolve(&self, workflow_id: &str, outcome: ApprovalOutcome) -> Result<(), ApprovalError> {
        self.evict_if_expired(workflow_id);
        let (_, waiter) = self
            .pending
            .remove(workflow_id)
            .ok_or_else(|| ApprovalError::UnknownWorkflow(workflow_id.to_string()))?;
        let _ = waiter.sender.send(outcome);
        Ok(())
    }

    /// Remove and return the pending approval's record without touching
    /// its one-shot channel, for callers that resume the gated action
    /// themselves (the loader's `continue_invocation`) rather than
    /// waiting on `await_decision`.
    pub fn take(&self, workflow_id: &str) -> Result<PendingApproval, ApprovalError> {
        self.evict_if_expired(workflow_id);
        self.pending
            .remove(workflow_id)
            .map(|(_, waiter)| waiter.approval)
            .ok_or_else(|| ApprovalError::UnknownWorkflow(workflow_id.to_string()))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn list_pending(&self) -> Vec<PendingApproval> {
        self.pending.iter().map(|entry| entry.approval.clone()).collect()
    }

    /// Reject every outstanding approval, e.g. when shutting down the
    /// gateway with workflows still in flight.
    pub fn reject_all(&self) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, waiter)) = self.pending.remove(&key) {
                let _ = waiter.sender.send(ApprovalOutcome::Rejected);
            }
        }
    }
}

/// Await a pending approval's resolution with a hard timeout, converting
/// a channel closure (issuer gone) into a rejection rather than a hang.
pub async fn await_decision(
    rx: tokio::sync::oneshot::Receiver<ApprovalOutcome>,
    workflow_id: &str,
    timeout: Duration,
) -> Result<ApprovalOutcome, ApprovalError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(_)) => Ok(ApprovalOutcome::Rejected),
        Err(_) => Err(ApprovalError::TimedOut(workflow_id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ApprovalKind;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn sample_approval(workflow_id: String) -> PendingApproval {
        sample_approval_created_at(workflow_id, Utc::now())
    }

    fn sample_approval_created_at(workflow_id: String, created_at: chrono::DateTime<Utc>) -> PendingApproval {
        PendingApproval {
            workflow_id,
            capability_id: None,
            user_id: None,
            code: None,
            tool_id: None,
            args: None,
            backend_fqdn: None,
            approval_kind: ApprovalKind::ToolPermission,
            created_at,
        }
    }

    #[tokio::test]
    async fn approve_resolves_the_waiting_receiver() {
        let store = ApprovalStore::new();
        let id = ApprovalStore::next_workflow_id();
        let (workflow_id, rx) = store.create(sample_approval(id));

        store.resolve(&workflow_id, ApprovalOutcome::Approved).unwrap();
        let outcome = await_decision(rx, &workflow_id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, ApprovalOutcome::Approved);
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn resolving_unknown_workflow_errors() {
        let store = ApprovalStore::new();
        let result = store.resolve("does-not-exist", ApprovalOutcome::Approved);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn timeout_surfaces_as_timed_out_error() {
        let store = ApprovalStore::new();
        let id = ApprovalStore::next_workflow_id();
        let (workflow_id, rx) = store.create(sample_approval(id));

        let result = await_decision(rx, &workflow_id, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ApprovalError::TimedOut(_))));
        // The waiter itself is untouched by the timeout: `await_decision`
        // only stopped listening, it didn't evict the entry.
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn expired_entry_is_evicted_on_lookup_and_reads_as_unknown() {
        let store = ApprovalStore::new();
        let id = ApprovalStore::next_workflow_id();
        let stale_created_at = Utc::now() - chrono::Duration::from_std(APPROVAL_TTL).unwrap() - chrono::Duration::seconds(1);
        let (workflow_id, _rx) = store.create(sample_approval_created_at(id, stale_created_at));

        assert!(store.get(&workflow_id).is_none());
        assert_eq!(store.pending_count(), 0);

        let result = store.resolve(&workflow_id, ApprovalOutcome::Approved);
        assert!(matches!(result, Err(ApprovalError::UnknownWorkflow(_))));
    }

    #[test]
    fn take_removes_a_fresh_entry_without_touching_its_channel() {
        let store = ApprovalStore::new();
        let id = ApprovalStore::next_workflow_id();
        let (workflow_id, rx) = store.create(sample_approval(id));

        let taken = store.take(&workflow_id).unwrap();
        assert_eq!(taken.workflow_id, workflow_id);
        assert_eq!(store.pending_count(), 0);
        assert!(store.take(&workflow_id).is_err());
        drop(rx);
    }

    #[tokio::test]
    async fn reject_all_resolves_every_pending_waiter() {
        let store = ApprovalStore::new();
        let id1 = ApprovalStore::next_workflow_id();
        let id2 = ApprovalStore::next_workflow_id();
        let (_, rx1) = store.create(sample_approval(id1));
        let (_, rx2) = store.create(sample_approval(id2));

        store.reject_all();
        assert_eq!(rx1.await.unwrap(), ApprovalOutcome::Rejected);
        assert_eq!(rx2.await.unwrap(), ApprovalOutcome::Rejected);
    }
}
