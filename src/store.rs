use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::audit;
use crate::model::{AuditEntry, AuditResult, PendingRequest, ScopePolicy};
use crate::secrets::SecretStore;
use crate::sync::ConfigSync;

// In-memory audit retention; the JSONL file keeps the full history.
const RECENT_AUDIT_CAP: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreData {
    version: u32,
    #[serde(default)]
    policies: Vec<ScopePolicy>,
    #[serde(default)]
    pending: Vec<PendingRequest>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            version: 1,
            policies: Vec::new(),
            pending: Vec::new(),
        }
    }
}

struct StoreState {
    policies: Vec<ScopePolicy>,
    pending: Vec<PendingRequest>,
    recent_audit: Vec<AuditEntry>,
}

enum SyncKind {
    Full,
    Lightweight,
    None,
}

/// Sole owner of the three entity collections (policies, audit entries,
/// pending requests). Every read and mutation goes through one mutex, so
/// concurrent callers never observe a partially renumbered priority list or
/// a half-inserted audit entry.
pub struct PolicyStore {
    path: PathBuf,
    audit_path: PathBuf,
    secrets: Arc<dyn SecretStore>,
    sync: Box<dyn ConfigSync>,
    state: Mutex<StoreState>,
}

impl PolicyStore {
    pub fn open_under(
        root: &Path,
        secrets: Arc<dyn SecretStore>,
        sync: Box<dyn ConfigSync>,
    ) -> Result<Self, String> {
        let path = root.join("policies.json");
        let audit_path = root.join("audit.jsonl");

        let mut data = StoreData::default();
        if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
            data = serde_json::from_str(&raw).map_err(|e| e.to_string())?;
        }
        renormalize(&mut data.policies);

        let recent_audit = audit::read_recent(&audit_path, RECENT_AUDIT_CAP)?;

        Ok(Self {
            path,
            audit_path,
            secrets,
            sync,
            state: Mutex::new(StoreState {
                policies: data.policies,
                pending: data.pending,
                recent_audit,
            }),
        })
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }

    // ── Policies ────────────────────────────────────────────────────────

    pub fn add_policy(&self, policy: ScopePolicy) -> Result<(), String> {
        validate_policy(&policy)?;
        let mut state = self.lock();
        if state.policies.iter().any(|p| p.scope == policy.scope) {
            return Err(format!("scope '{}' is already configured", policy.scope));
        }
        state.policies.push(policy);
        renormalize(&mut state.policies);
        self.persist_and_sync(&state, SyncKind::Full);
        Ok(())
    }

    pub fn remove_policy(&self, id: &str) -> bool {
        let mut state = self.lock();
        let Some(idx) = state.policies.iter().position(|p| p.id == id) else {
            return false;
        };
        let removed = state.policies.remove(idx);
        renormalize(&mut state.policies);

        // Cascade: the scope's credentials go with the policy.
        if let Err(err) = self.secrets.delete(&removed.scope) {
            eprintln!("keygate: failed deleting secret for '{}': {}", removed.scope, err);
        }
        if let Err(err) = self.secrets.delete_admin(&removed.scope) {
            eprintln!(
                "keygate: failed deleting admin key for '{}': {}",
                removed.scope, err
            );
        }

        self.persist_and_sync(&state, SyncKind::Full);
        true
    }

    pub fn update_policy(&self, policy: ScopePolicy) -> Result<(), String> {
        validate_policy(&policy)?;
        let mut state = self.lock();
        let Some(idx) = state.policies.iter().position(|p| p.id == policy.id) else {
            return Err(format!("no policy with id '{}'", policy.id));
        };
        state.policies[idx] = policy;
        renormalize(&mut state.policies);
        self.persist_and_sync(&state, SyncKind::Full);
        Ok(())
    }

    /// Move a policy to priority 1. Ordering-only change, so the external
    /// sync is the lightweight flavor (no secret access).
    pub fn promote_policy(&self, id: &str) -> bool {
        let mut state = self.lock();
        let Some(idx) = state.policies.iter().position(|p| p.id == id) else {
            return false;
        };
        let policy = state.policies.remove(idx);
        state.policies.insert(0, policy);
        renormalize(&mut state.policies);
        self.persist_and_sync(&state, SyncKind::Lightweight);
        true
    }

    /// Drag-reorder semantics: remove the moved subset preserving relative
    /// order, then reinsert at the destination index reduced by the number
    /// of moved items that originally sat before it.
    pub fn move_policies(&self, from: &[usize], to: usize) {
        let mut state = self.lock();

        let selected: HashSet<usize> = from
            .iter()
            .copied()
            .filter(|&i| i < state.policies.len())
            .collect();
        if selected.is_empty() {
            return;
        }

        let mut kept = Vec::new();
        let mut moved = Vec::new();
        for (i, policy) in state.policies.drain(..).enumerate() {
            if selected.contains(&i) {
                moved.push(policy);
            } else {
                kept.push(policy);
            }
        }

        let offset = selected.iter().filter(|&&i| i < to).count();
        let dest = to.saturating_sub(offset).min(kept.len());
        for (k, policy) in moved.into_iter().enumerate() {
            kept.insert(dest + k, policy);
        }

        state.policies = kept;
        renormalize(&mut state.policies);
        self.persist_and_sync(&state, SyncKind::Lightweight);
    }

    pub fn policy_for_scope(&self, scope: &str) -> Option<ScopePolicy> {
        self.lock().policies.iter().find(|p| p.scope == scope).cloned()
    }

    /// All policies in priority order (array order == priority order).
    pub fn policies(&self) -> Vec<ScopePolicy> {
        self.lock().policies.clone()
    }

    pub fn mark_used(&self, scope: &str) {
        let mut state = self.lock();
        let Some(policy) = state.policies.iter_mut().find(|p| p.scope == scope) else {
            return;
        };
        policy.last_used_at = Some(Utc::now().timestamp_millis());
        self.persist_and_sync(&state, SyncKind::None);
    }

    // ── Audit ───────────────────────────────────────────────────────────

    /// Insert at the head of the in-memory list (most recent first) and
    /// append one line to the durable log. A failed append is logged and
    /// never rolls back the in-memory entry.
    pub fn add_audit_entry(&self, entry: AuditEntry) {
        let mut state = self.lock();
        self.record_audit(&mut state, entry);
    }

    pub fn recent_audit(&self, limit: usize) -> Vec<AuditEntry> {
        let state = self.lock();
        state.recent_audit.iter().take(limit).cloned().collect()
    }

    fn record_audit(&self, state: &mut MutexGuard<'_, StoreState>, entry: AuditEntry) {
        if let Err(err) = audit::append_entry(&self.audit_path, &entry) {
            eprintln!("keygate: audit append failed: {}", err);
        }
        state.recent_audit.insert(0, entry);
        state.recent_audit.truncate(RECENT_AUDIT_CAP);
    }

    // ── Pending requests ────────────────────────────────────────────────

    pub fn add_pending_request(
        &self,
        scope: &str,
        requesting_host: &str,
        reason: &str,
    ) -> PendingRequest {
        let request = PendingRequest::new(scope, requesting_host, reason);
        let mut state = self.lock();
        state.pending.push(request.clone());
        self.persist_and_sync(&state, SyncKind::None);
        request
    }

    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.lock().pending.clone()
    }

    /// Remove the pending entry and synthesize exactly one approved
    /// AuditEntry. Returns the entry, or None when the id is unknown.
    pub fn approve_pending_request(&self, id: &str) -> Option<AuditEntry> {
        self.settle_pending(id, AuditResult::Approved, "approved by operator")
    }

    pub fn deny_pending_request(&self, id: &str) -> Option<AuditEntry> {
        self.settle_pending(id, AuditResult::Denied, "denied by operator")
    }

    fn settle_pending(&self, id: &str, result: AuditResult, detail: &str) -> Option<AuditEntry> {
        let mut state = self.lock();
        let idx = state.pending.iter().position(|p| p.id == id)?;
        let pending = state.pending.remove(idx);

        let entry = AuditEntry::new(
            pending.scope,
            pending.requesting_host,
            pending.reason,
            result,
            Some(detail.to_string()),
        );
        self.record_audit(&mut state, entry.clone());
        self.persist_and_sync(&state, SyncKind::None);
        Some(entry)
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // A panic while holding the lock is a bug; the store has no
        // meaningful recovery from a poisoned state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persist the snapshot and trigger the external sync. Failures on
    /// either side are logged and do not roll back the in-memory state; the
    /// next successful save reconciles.
    fn persist_and_sync(&self, state: &MutexGuard<'_, StoreState>, kind: SyncKind) {
        let data = StoreData {
            version: 1,
            policies: state.policies.clone(),
            pending: state.pending.clone(),
        };
        if let Err(err) = write_snapshot(&self.path, &data) {
            eprintln!("keygate: failed persisting policy store: {}", err);
        }

        let result = match kind {
            SyncKind::Full => self.sync.full_sync(&state.policies, &*self.secrets),
            SyncKind::Lightweight => self.sync.lightweight_sync(&state.policies),
            SyncKind::None => Ok(()),
        };
        if let Err(err) = result {
            eprintln!("keygate: config sync failed: {}", err);
        }
    }
}

fn write_snapshot(path: &Path, data: &StoreData) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let raw = serde_json::to_string_pretty(data).map_err(|e| e.to_string())?;
    std::fs::write(path, raw).map_err(|e| e.to_string())
}

fn renormalize(policies: &mut [ScopePolicy]) {
    for (i, policy) in policies.iter_mut().enumerate() {
        policy.priority = i as u32 + 1;
    }
}

fn validate_policy(policy: &ScopePolicy) -> Result<(), String> {
    if policy.scope.trim().is_empty() {
        return Err("policy scope is required".to_string());
    }
    let is_custom = matches!(
        policy.credential_type,
        crate::model::CredentialType::CustomHeader
    );
    if policy.custom_header_name.is_some() && !is_custom {
        return Err("customHeaderName is only valid for custom_header credentials".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApprovalMode, CredentialType};
    use crate::secrets::MemorySecretStore;
    use crate::sync::NullConfigSync;

    fn open_store(root: &Path) -> (PolicyStore, Arc<MemorySecretStore>) {
        let secrets = Arc::new(MemorySecretStore::new());
        let store = PolicyStore::open_under(root, secrets.clone(), Box::new(NullConfigSync))
            .unwrap();
        (store, secrets)
    }

    fn policy(scope: &str) -> ScopePolicy {
        ScopePolicy::new(scope.to_uppercase(), scope, CredentialType::BearerToken)
    }

    fn priorities(store: &PolicyStore) -> Vec<(String, u32)> {
        store
            .policies()
            .into_iter()
            .map(|p| (p.scope, p.priority))
            .collect()
    }

    #[test]
    fn priorities_stay_dense_across_add_remove_promote() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());

        let a = policy("a");
        let b = policy("b");
        let c = policy("c");
        let b_id = b.id.clone();
        let c_id = c.id.clone();
        store.add_policy(a).unwrap();
        store.add_policy(b).unwrap();
        store.add_policy(c).unwrap();
        assert_eq!(
            priorities(&store),
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), 2),
                ("c".to_string(), 3)
            ]
        );

        assert!(store.remove_policy(&b_id));
        assert_eq!(
            priorities(&store),
            vec![("a".to_string(), 1), ("c".to_string(), 2)]
        );

        assert!(store.promote_policy(&c_id));
        assert_eq!(
            priorities(&store),
            vec![("c".to_string(), 1), ("a".to_string(), 2)]
        );
    }

    #[test]
    fn move_policies_adjusts_destination_for_moved_items_before_it() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());
        for scope in ["a", "b", "c", "d", "e"] {
            store.add_policy(policy(scope)).unwrap();
        }

        // Move a (0) and c (2) to index 4: two moved items sat before the
        // destination, so they land after d.
        store.move_policies(&[0, 2], 4);
        let order: Vec<String> = store.policies().into_iter().map(|p| p.scope).collect();
        assert_eq!(order, vec!["b", "d", "a", "c", "e"]);
        let prios: Vec<u32> = store.policies().into_iter().map(|p| p.priority).collect();
        assert_eq!(prios, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn move_policies_ignores_out_of_range_indices() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());
        for scope in ["a", "b"] {
            store.add_policy(policy(scope)).unwrap();
        }
        store.move_policies(&[7], 0);
        let order: Vec<String> = store.policies().into_iter().map(|p| p.scope).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn duplicate_scope_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());
        store.add_policy(policy("openai")).unwrap();
        assert!(store.add_policy(policy("openai")).is_err());
        assert_eq!(store.policies().len(), 1);
    }

    #[test]
    fn custom_header_name_requires_custom_header_type() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());
        let mut bad = policy("openai");
        bad.custom_header_name = Some("x-api-key".to_string());
        assert!(store.add_policy(bad).is_err());

        let mut good = ScopePolicy::new("OpenAI", "openai", CredentialType::CustomHeader);
        good.custom_header_name = Some("x-api-key".to_string());
        store.add_policy(good).unwrap();
    }

    #[test]
    fn add_then_remove_leaves_audit_and_pending_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());

        let p = policy("openai");
        let id = p.id.clone();
        store.add_policy(p).unwrap();
        assert!(store.remove_policy(&id));

        assert!(store.policies().is_empty());
        assert!(store.pending_requests().is_empty());
        assert!(store.recent_audit(10).is_empty());
        assert!(crate::audit::read_recent(store.audit_path(), 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn remove_policy_cascades_secret_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let (store, secrets) = open_store(dir.path());

        let p = policy("openai");
        let id = p.id.clone();
        store.add_policy(p).unwrap();
        secrets.save("openai", "sk-test").unwrap();
        secrets.save_admin("openai", "sk-admin").unwrap();

        assert!(store.remove_policy(&id));
        assert!(!secrets.exists("openai"));
        assert!(!secrets.exists_admin("openai"));
    }

    #[test]
    fn approve_and_deny_settle_pending_into_exactly_one_audit_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());

        let approved = store.add_pending_request("openai", "localhost", "list models");
        let denied = store.add_pending_request("anthropic", "localhost", "chat");
        assert_eq!(store.pending_requests().len(), 2);

        let entry = store.approve_pending_request(&approved.id).unwrap();
        assert_eq!(entry.result, AuditResult::Approved);
        assert_eq!(entry.scope, "openai");

        let entry = store.deny_pending_request(&denied.id).unwrap();
        assert_eq!(entry.result, AuditResult::Denied);

        assert!(store.pending_requests().is_empty());
        assert_eq!(store.recent_audit(10).len(), 2);
        assert!(store.approve_pending_request("unknown-id").is_none());
    }

    #[test]
    fn store_persists_and_reloads_with_dense_priorities() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, _) = open_store(dir.path());
            let mut manual = policy("anthropic");
            manual.approval_mode = ApprovalMode::Manual;
            store.add_policy(policy("openai")).unwrap();
            store.add_policy(manual).unwrap();
            store.add_pending_request("anthropic", "localhost", "chat");
            store.add_audit_entry(AuditEntry::new(
                "openai",
                "localhost",
                "probe",
                AuditResult::Approved,
                None,
            ));
        }

        let (reopened, _) = open_store(dir.path());
        assert_eq!(
            priorities(&reopened),
            vec![("openai".to_string(), 1), ("anthropic".to_string(), 2)]
        );
        assert_eq!(reopened.pending_requests().len(), 1);
        // Recent audit is rehydrated from the durable log.
        assert_eq!(reopened.recent_audit(10).len(), 1);
        assert_eq!(reopened.recent_audit(10)[0].scope, "openai");
    }

    #[test]
    fn mark_used_sets_last_used_at() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());
        store.add_policy(policy("openai")).unwrap();

        store.mark_used("openai");
        let p = store.policy_for_scope("openai").unwrap();
        assert!(p.last_used_at.is_some());
    }
}
