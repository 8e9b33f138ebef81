// Declarative bootstrap: seed the desired set from a file at startup.

use std::path::Path;

use serde::Deserialize;

use super::DesiredStore;
use crate::spec::Spec;

/// One entry of the desired-state file. `tenant` defaults to the job id;
/// empty image paths are filled from the configured defaults.
#[derive(Debug, Deserialize)]
struct DesiredEntry {
    job_id: String,
    #[serde(default)]
    tenant: Option<String>,
    spec: Spec,
}

/// Read the desired-state file and UPSERT every entry.
///
/// A missing file starts the store empty; an unparseable file logs an
/// error and leaves the store untouched. Individual invalid entries are
/// skipped so one typo cannot block the rest of the fleet.
pub async fn bootstrap_from_file(
    store: &DesiredStore,
    path: &Path,
    default_kernel: &str,
    default_rootfs: &str,
) {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "No desired-state file, starting empty");
            return;
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to read desired-state file");
            return;
        }
    };

    let entries: Vec<DesiredEntry> = match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to parse desired-state file");
            return;
        }
    };

    let mut loaded = 0usize;
    for entry in entries {
        let mut spec = entry.spec;
        if spec.kernel_path.is_empty() {
            spec.kernel_path = default_kernel.to_string();
        }
        if spec.rootfs_path.is_empty() {
            spec.rootfs_path = default_rootfs.to_string();
        }
        if let Err(reason) = spec.validate() {
            tracing::error!(job_id = %entry.job_id, reason = %reason, "Skipping invalid desired entry");
            continue;
        }

        let tenant = entry.tenant.unwrap_or_else(|| entry.job_id.clone());
        match store.put(&entry.job_id, &tenant, &spec).await {
            Ok(()) => loaded += 1,
            Err(e) => {
                tracing::error!(job_id = %entry.job_id, error = %e, "Failed to persist desired entry");
            }
        }
    }

    tracing::info!(path = %path.display(), loaded, "Desired-state bootstrap complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store(dir: &tempfile::TempDir) -> DesiredStore {
        DesiredStore::open(&dir.path().join("desired.db")).unwrap()
    }

    #[tokio::test]
    async fn loads_entries_and_defaults_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let path = dir.path().join("desired.json");
        std::fs::write(
            &path,
            r#"[
                {"job_id": "web-1", "tenant": "acme",
                 "spec": {"kernel": "/k", "rootfs": "/r",
                          "resources": {"vcpu": 1, "mem_mb": 128},
                          "lifecycle": "service", "warm_pool": {"min": 1}}},
                {"job_id": "worker-1",
                 "spec": {"kernel": "/k", "rootfs": "/r",
                          "resources": {"vcpu": 1, "mem_mb": 64},
                          "lifecycle": "job"}}
            ]"#,
        )
        .unwrap();

        bootstrap_from_file(&store, &path, "/default-k", "/default-r").await;

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["web-1"].tenant, "acme");
        assert_eq!(all["worker-1"].tenant, "worker-1");
    }

    #[tokio::test]
    async fn fills_missing_images_from_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let path = dir.path().join("desired.json");
        std::fs::write(
            &path,
            r#"[{"job_id": "web-1",
                 "spec": {"resources": {"vcpu": 1, "mem_mb": 128}, "lifecycle": "daemon"}}]"#,
        )
        .unwrap();

        bootstrap_from_file(&store, &path, "/default-k", "/default-r").await;

        let job = store.get("web-1").await.unwrap().unwrap();
        assert_eq!(job.spec.kernel_path, "/default-k");
        assert_eq!(job.spec.rootfs_path, "/default-r");
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        bootstrap_from_file(&store, &dir.path().join("nope.json"), "/k", "/r").await;
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let path = dir.path().join("desired.json");
        std::fs::write(&path, "not json at all {").unwrap();

        bootstrap_from_file(&store, &path, "/k", "/r").await;
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let path = dir.path().join("desired.json");
        std::fs::write(
            &path,
            r#"[
                {"job_id": "bad", "spec": {"kernel": "/k", "rootfs": "/r",
                    "resources": {"vcpu": 0, "mem_mb": 128}, "lifecycle": "job"}},
                {"job_id": "good", "spec": {"kernel": "/k", "rootfs": "/r",
                    "resources": {"vcpu": 1, "mem_mb": 128}, "lifecycle": "job"}}
            ]"#,
        )
        .unwrap();

        bootstrap_from_file(&store, &path, "/k", "/r").await;

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("good"));
    }
}
