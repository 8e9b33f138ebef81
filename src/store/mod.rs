// Desired-state store: the durable map job_id -> (tenant, spec).
//
// One task owns the SQLite connection; everything else holds a cloneable
// handle and talks to it over a command channel, which keeps the
// single-writer property explicit.

mod bootstrap;

pub use bootstrap::bootstrap_from_file;

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::PoolError;
use crate::spec::{JobId, Spec, Tenant};

const COMMAND_BUFFER_SIZE: usize = 64;

/// One desired entry: the tenant owning the job plus its launch spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredJob {
    pub tenant: Tenant,
    pub spec: Spec,
}

#[derive(Debug)]
enum StoreCommand {
    Put {
        job_id: JobId,
        tenant: Tenant,
        spec: Spec,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    Delete {
        job_id: JobId,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    Get {
        job_id: JobId,
        reply: oneshot::Sender<Result<Option<DesiredJob>, PoolError>>,
    },
    List {
        reply: oneshot::Sender<Result<BTreeMap<JobId, DesiredJob>, PoolError>>,
    },
    DeleteAll {
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
}

/// Handle to the desired-state store.
#[derive(Debug, Clone)]
pub struct DesiredStore {
    tx: mpsc::Sender<StoreCommand>,
}

impl DesiredStore {
    /// Open (or create) the database and spawn the writer task.
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS desired_jobs (
                job_id      TEXT PRIMARY KEY,
                tenant      TEXT NOT NULL,
                spec_json   TEXT NOT NULL,
                inserted_at INTEGER NOT NULL
            )",
            [],
        )?;

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        tokio::spawn(writer_task(conn, rx));
        tracing::info!(db_path = %db_path.display(), "Desired-state store open");
        Ok(Self { tx })
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, PoolError>>) -> StoreCommand,
    ) -> Result<T, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| PoolError::StoreUnavailable("store task exited".into()))?;
        rx.await
            .map_err(|_| PoolError::StoreUnavailable("store task dropped reply".into()))?
    }

    /// UPSERT the desired entry; returns once the write is durable.
    pub async fn put(&self, job_id: &str, tenant: &str, spec: &Spec) -> Result<(), PoolError> {
        self.send(|reply| StoreCommand::Put {
            job_id: job_id.to_string(),
            tenant: tenant.to_string(),
            spec: spec.clone(),
            reply,
        })
        .await
    }

    /// Remove the desired entry; idempotent.
    pub async fn delete(&self, job_id: &str) -> Result<(), PoolError> {
        self.send(|reply| StoreCommand::Delete {
            job_id: job_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<DesiredJob>, PoolError> {
        self.send(|reply| StoreCommand::Get {
            job_id: job_id.to_string(),
            reply,
        })
        .await
    }

    /// Snapshot of the full desired set.
    pub async fn list(&self) -> Result<BTreeMap<JobId, DesiredJob>, PoolError> {
        self.send(|reply| StoreCommand::List { reply }).await
    }

    /// Test support; not reachable from the API surface.
    pub async fn delete_all(&self) -> Result<(), PoolError> {
        self.send(|reply| StoreCommand::DeleteAll { reply }).await
    }
}

async fn writer_task(conn: Connection, mut rx: mpsc::Receiver<StoreCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::Put {
                job_id,
                tenant,
                spec,
                reply,
            } => {
                let _ = reply.send(put_row(&conn, &job_id, &tenant, &spec));
            }
            StoreCommand::Delete { job_id, reply } => {
                let result = conn
                    .execute("DELETE FROM desired_jobs WHERE job_id = ?1", params![job_id])
                    .map(|_| ())
                    .map_err(store_err);
                let _ = reply.send(result);
            }
            StoreCommand::Get { job_id, reply } => {
                let _ = reply.send(get_row(&conn, &job_id));
            }
            StoreCommand::List { reply } => {
                let _ = reply.send(list_rows(&conn));
            }
            StoreCommand::DeleteAll { reply } => {
                let result = conn
                    .execute("DELETE FROM desired_jobs", [])
                    .map(|_| ())
                    .map_err(store_err);
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!("Desired-state store writer exiting");
}

fn store_err(e: rusqlite::Error) -> PoolError {
    PoolError::StoreUnavailable(e.to_string())
}

fn put_row(conn: &Connection, job_id: &str, tenant: &str, spec: &Spec) -> Result<(), PoolError> {
    let spec_json =
        serde_json::to_string(spec).map_err(|e| PoolError::StoreUnavailable(e.to_string()))?;
    conn.execute(
        "INSERT OR REPLACE INTO desired_jobs (job_id, tenant, spec_json, inserted_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![job_id, tenant, spec_json, chrono::Utc::now().timestamp()],
    )
    .map(|_| ())
    .map_err(store_err)
}

fn get_row(conn: &Connection, job_id: &str) -> Result<Option<DesiredJob>, PoolError> {
    let mut stmt = conn
        .prepare("SELECT tenant, spec_json FROM desired_jobs WHERE job_id = ?1")
        .map_err(store_err)?;
    let mut rows = stmt.query(params![job_id]).map_err(store_err)?;
    match rows.next().map_err(store_err)? {
        Some(row) => {
            let tenant: String = row.get(0).map_err(store_err)?;
            let spec_json: String = row.get(1).map_err(store_err)?;
            let spec = serde_json::from_str(&spec_json)
                .map_err(|e| PoolError::StoreUnavailable(format!("corrupt spec row: {}", e)))?;
            Ok(Some(DesiredJob { tenant, spec }))
        }
        None => Ok(None),
    }
}

fn list_rows(conn: &Connection) -> Result<BTreeMap<JobId, DesiredJob>, PoolError> {
    let mut stmt = conn
        .prepare("SELECT job_id, tenant, spec_json FROM desired_jobs")
        .map_err(store_err)?;
    let iter = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(store_err)?;

    let mut out = BTreeMap::new();
    for entry in iter {
        let (job_id, tenant, spec_json) = entry.map_err(store_err)?;
        match serde_json::from_str(&spec_json) {
            Ok(spec) => {
                out.insert(job_id, DesiredJob { tenant, spec });
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Skipping corrupt desired row");
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{Lifecycle, Resources, WarmPool};
    use std::collections::BTreeMap as Map;

    fn spec(mem_mb: u32) -> Spec {
        Spec {
            kernel_path: "/k".into(),
            rootfs_path: "/r".into(),
            cmd: vec!["/bin/app".into()],
            env: Map::new(),
            resources: Resources { vcpu: 1, mem_mb },
            lifecycle: Lifecycle::Service,
            warm_pool: Some(WarmPool { min: 1, max: Some(2) }),
            extra: Map::new(),
        }
    }

    async fn open_store(dir: &tempfile::TempDir) -> DesiredStore {
        DesiredStore::open(&dir.path().join("desired.db")).unwrap()
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store.put("web-1", "acme", &spec(256)).await.unwrap();
        let job = store.get("web-1").await.unwrap().unwrap();
        assert_eq!(job.tenant, "acme");
        assert_eq!(job.spec, spec(256));

        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_is_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store.put("web-1", "acme", &spec(256)).await.unwrap();
        store.put("web-1", "globex", &spec(512)).await.unwrap();

        let job = store.get("web-1").await.unwrap().unwrap();
        assert_eq!(job.tenant, "globex");
        assert_eq!(job.spec.resources.mem_mb, 512);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store.put("web-1", "acme", &spec(256)).await.unwrap();
        store.delete("web-1").await.unwrap();
        store.delete("web-1").await.unwrap();
        assert!(store.get("web-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_snapshots_all_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store.put("a", "a", &spec(128)).await.unwrap();
        store.put("b", "tenant-b", &spec(256)).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["b"].tenant, "tenant-b");

        store.delete_all().await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("desired.db");
        {
            let store = DesiredStore::open(&db_path).unwrap();
            store.put("web-1", "acme", &spec(256)).await.unwrap();
        }
        let store = DesiredStore::open(&db_path).unwrap();
        assert!(store.get("web-1").await.unwrap().is_some());
    }
}
