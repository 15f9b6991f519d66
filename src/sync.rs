use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::model::{ApprovalMode, ScopePolicy};
use crate::secrets::SecretStore;

/// External configuration-sync collaborator.
///
/// The store invokes `full_sync` after mutations that may have changed which
/// credentials are exposed (add/remove/update) and `lightweight_sync` after
/// ordering-only changes. Implementations may target the local filesystem or
/// any other transport; the core is indifferent.
pub trait ConfigSync: Send + Sync {
    fn full_sync(&self, policies: &[ScopePolicy], secrets: &dyn SecretStore)
        -> Result<(), String>;
    fn lightweight_sync(&self, policies: &[ScopePolicy]) -> Result<(), String>;
}

/// No-op sync for tests and for running the broker without external configs.
pub struct NullConfigSync;

impl ConfigSync for NullConfigSync {
    fn full_sync(&self, _: &[ScopePolicy], _: &dyn SecretStore) -> Result<(), String> {
        Ok(())
    }

    fn lightweight_sync(&self, _: &[ScopePolicy]) -> Result<(), String> {
        Ok(())
    }
}

/// Filesystem sync against two JSON documents:
///
/// - `profiles.json` — one credential profile per enabled, auto-approved
///   scope, keyed `"<scope>:default"`. Full sync owns every `:default` key;
///   anything else in the document is left alone.
/// - `models.json` — `primary` is the priority-1 enabled scope, `fallbacks`
///   the rest in priority order. Written by both sync flavors.
pub struct FileConfigSync {
    profiles_path: PathBuf,
    models_path: PathBuf,
}

impl FileConfigSync {
    pub fn under(root: &Path) -> Self {
        Self {
            profiles_path: root.join("profiles.json"),
            models_path: root.join("models.json"),
        }
    }

    pub fn with_paths(profiles_path: PathBuf, models_path: PathBuf) -> Self {
        Self {
            profiles_path,
            models_path,
        }
    }

    fn write_models(&self, policies: &[ScopePolicy]) -> Result<(), String> {
        let enabled: Vec<&ScopePolicy> = policies.iter().filter(|p| p.is_enabled).collect();
        let primary = enabled.first().map(|p| p.scope.clone());
        let fallbacks: Vec<String> = enabled.iter().skip(1).map(|p| p.scope.clone()).collect();

        let doc = serde_json::json!({
            "primary": primary,
            "fallbacks": fallbacks,
        });
        write_json_doc(&self.models_path, &doc)
    }
}

impl ConfigSync for FileConfigSync {
    fn full_sync(
        &self,
        policies: &[ScopePolicy],
        secrets: &dyn SecretStore,
    ) -> Result<(), String> {
        let mut doc = load_json_object(&self.profiles_path)?;

        // Managed keys are rebuilt from scratch each sync so profiles for
        // scopes no longer enabled disappear.
        doc.retain(|key, _| !key.ends_with(":default"));

        for policy in policies
            .iter()
            .filter(|p| p.is_enabled && p.approval_mode == ApprovalMode::Auto)
        {
            let mut profile = Map::new();
            profile.insert(
                "serviceName".to_string(),
                Value::String(policy.service_name.clone()),
            );
            profile.insert(
                "credentialType".to_string(),
                Value::String(policy.credential_type.label().to_string()),
            );
            if let Some(name) = &policy.custom_header_name {
                profile.insert("headerName".to_string(), Value::String(name.clone()));
            }
            if policy.has_secret {
                match secrets.retrieve(&policy.scope) {
                    Ok(Some(secret)) => {
                        profile.insert("apiKey".to_string(), Value::String(secret));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        return Err(format!(
                            "failed reading secret for scope '{}': {}",
                            policy.scope, err
                        ));
                    }
                }
            }
            doc.insert(format!("{}:default", policy.scope), Value::Object(profile));
        }

        write_json_doc(&self.profiles_path, &Value::Object(doc))?;
        self.write_models(policies)
    }

    fn lightweight_sync(&self, policies: &[ScopePolicy]) -> Result<(), String> {
        self.write_models(policies)
    }
}

fn load_json_object(path: &Path) -> Result<Map<String, Value>, String> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let value: Value = serde_json::from_str(&raw).map_err(|e| e.to_string())?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(format!("{} is not a JSON object", path.display())),
    }
}

fn write_json_doc(path: &Path, doc: &Value) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let raw = serde_json::to_string_pretty(doc).map_err(|e| e.to_string())?;
    std::fs::write(path, raw).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CredentialType;
    use crate::secrets::MemorySecretStore;

    fn policy(scope: &str, enabled: bool, mode: ApprovalMode) -> ScopePolicy {
        let mut p = ScopePolicy::new(scope.to_uppercase(), scope, CredentialType::BearerToken);
        p.is_enabled = enabled;
        p.approval_mode = mode;
        p
    }

    #[test]
    fn full_sync_writes_profiles_for_enabled_auto_scopes_only() {
        let dir = tempfile::tempdir().unwrap();
        let sync = FileConfigSync::under(dir.path());
        let secrets = MemorySecretStore::new();
        secrets.save("openai", "sk-test").unwrap();

        let mut with_secret = policy("openai", true, ApprovalMode::Auto);
        with_secret.has_secret = true;
        let policies = vec![
            with_secret,
            policy("anthropic", false, ApprovalMode::Auto),
            policy("github", true, ApprovalMode::Manual),
        ];

        sync.full_sync(&policies, &secrets).unwrap();

        let doc = load_json_object(&dir.path().join("profiles.json")).unwrap();
        assert!(doc.contains_key("openai:default"));
        assert!(!doc.contains_key("anthropic:default"));
        assert!(!doc.contains_key("github:default"));
        assert_eq!(
            doc["openai:default"]["apiKey"],
            Value::String("sk-test".to_string())
        );
    }

    #[test]
    fn full_sync_removes_stale_profiles_but_keeps_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = dir.path().join("profiles.json");
        std::fs::write(
            &profiles,
            r#"{"old:default":{"apiKey":"x"},"unrelated":{"keep":true}}"#,
        )
        .unwrap();

        let sync = FileConfigSync::under(dir.path());
        sync.full_sync(
            &[policy("openai", true, ApprovalMode::Auto)],
            &MemorySecretStore::new(),
        )
        .unwrap();

        let doc = load_json_object(&profiles).unwrap();
        assert!(!doc.contains_key("old:default"));
        assert!(doc.contains_key("unrelated"));
        assert!(doc.contains_key("openai:default"));
    }

    #[test]
    fn lightweight_sync_writes_primary_and_fallbacks_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let sync = FileConfigSync::under(dir.path());

        let policies = vec![
            policy("openai", true, ApprovalMode::Auto),
            policy("disabled", false, ApprovalMode::Auto),
            policy("anthropic", true, ApprovalMode::Manual),
        ];
        sync.lightweight_sync(&policies).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("models.json")).unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["primary"], Value::String("openai".to_string()));
        assert_eq!(
            doc["fallbacks"],
            serde_json::json!(["anthropic"])
        );
        assert!(!dir.path().join("profiles.json").exists());
    }
}
