//! Policy file hot reload.

use std::{path::Path, sync::Arc};

use anyhow::Context;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use remote_exec_executor::{PolicyConfig, PolicyStore};

/// Read the policy section of the configuration file at `path`.
pub fn load_policy(path: &Path) -> anyhow::Result<PolicyConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    PolicyConfig::from_document(&text).with_context(|| format!("invalid policy in {}", path.display()))
}

/// Re-reads the policy file on change and swaps it into a [`PolicyStore`].
///
/// A file that fails to load leaves the previous policy in place. The watch
/// stops when this value is dropped.
pub struct PolicyWatcher {
    _watcher: RecommendedWatcher,
}

impl PolicyWatcher {
    pub fn new(path: &Path, store: Arc<PolicyStore>) -> anyhow::Result<Self> {
        let path = path.to_path_buf();
        let callback_path = path.clone();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
            Ok(event) if touches(&event, &callback_path) => reload(&callback_path, &store),
            Ok(_) => {}
            Err(e) => tracing::warn!("Policy watcher error: {e}"),
        })
        .context("failed to create policy watcher")?;

        // Watch the directory so replace-by-rename writes are seen.
        let target = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(&path);
        watcher
            .watch(target, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", target.display()))?;

        tracing::info!(path = %path.display(), "Watching policy file");
        Ok(Self { _watcher: watcher })
    }
}

fn touches(event: &Event, path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| p.file_name() == path.file_name())
}

fn reload(path: &Path, store: &PolicyStore) {
    match load_policy(path) {
        Ok(config) => {
            let previous = store.replace(config);
            let current = store.snapshot();
            if *previous != *current {
                tracing::info!(
                    enabled = current.enabled,
                    allowlist = current.allowlist.len(),
                    denylist = current.denylist.len(),
                    "Reloaded command policy"
                );
            }
        }
        Err(e) => tracing::warn!("Keeping previous command policy: {e:#}"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_load_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");

        std::fs::write(&path, r#"{"commandPolicy": {"enabled": true, "denylist": ["rm"]}}"#).unwrap();
        let config = load_policy(&path).unwrap();
        assert!(config.enabled);
        assert_eq!(config.denylist, vec!["rm"]);

        std::fs::write(&path, "{}").unwrap();
        assert_eq!(load_policy(&path).unwrap(), PolicyConfig::default());

        assert!(load_policy(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_bad_reload_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let store = PolicyStore::new(PolicyConfig {
            enabled: true,
            ..PolicyConfig::default()
        });

        std::fs::write(&path, "{ not json").unwrap();
        reload(&path, &store);
        assert!(store.snapshot().enabled);

        std::fs::write(&path, r#"{"commandPolicy": {"enabled": false}}"#).unwrap();
        reload(&path, &store);
        assert!(!store.snapshot().enabled);
    }

    #[tokio::test]
    async fn test_watcher_swaps_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, r#"{"commandPolicy": {"enabled": false}}"#).unwrap();

        let store = Arc::new(PolicyStore::new(load_policy(&path).unwrap()));
        let _watcher = PolicyWatcher::new(&path, Arc::clone(&store)).unwrap();

        std::fs::write(&path, r#"{"commandPolicy": {"enabled": true, "allowlist": ["ls"]}}"#).unwrap();

        let mut reloaded = false;
        for _ in 0..50 {
            if store.snapshot().enabled {
                reloaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(reloaded, "policy was not reloaded");
        assert_eq!(store.snapshot().allowlist, vec!["ls"]);
    }
}
