pub mod admission;
pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod hygiene;
pub mod lease;
#[cfg(test)]
mod lib_tests;
pub mod storage;
pub mod sync_bridge;
pub mod txlock;

use crate::admission::{AdmissionControl, AdmissionPermit};
use crate::engine::boot::{boot_hook, boot_queries};
use crate::gate::{AccessGate, Opener};
use crate::lease::{run_scoped, scoped_lease};
use crate::txlock::{TransactionLock, TxGuard};
use std::fs;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

pub use crate::config::OlapConfig;
pub use crate::engine::{Connection, Engine, Handle, Rows, Value};
pub use crate::error::{EngineError, OlapError, OlapErrorCode};
pub use crate::lease::Lease;
pub use crate::storage::{RecoveryReport, StagedVersion, TableStorage, TableVersion};
pub use crate::txlock::Consistency;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Creates a directory tree, new directories readable by the owner only.
/// Existing directories keep their permissions.
fn create_private_dir_all(path: &Path) -> Result<(), OlapError> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().recursive(true).mode(0o700).create(path)?;
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)?;
    }
    if !fs::metadata(path)?.is_dir() {
        return Err(OlapError::InvalidConfig {
            message: format!("path is not a directory: {}", path.display()),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OlapStats {
    pub connections_in_use: usize,
    pub reopen_pending: bool,
    pub reopens: u64,
    pub failed: bool,
    pub olap_capacity: usize,
    pub olap_available: usize,
    pub meta_available: usize,
    pub long_running_available: usize,
    pub exclusive_held: bool,
}

/// Shares one engine handle between many concurrent callers.
///
/// Every acquisition passes, in order, the transaction lock, the admission
/// pools and the access gate; the returned [`Lease`] releases them in reverse.
/// Fatal engine errors reported through a lease (or [`OlapManager::check_err`])
/// make the manager drain all leases and reopen the handle.
pub struct OlapManager {
    id: u64,
    config: OlapConfig,
    gate: Arc<AccessGate>,
    admission: AdmissionControl,
    txlock: TransactionLock,
    storage: Option<TableStorage>,
    closed: AtomicBool,
}

impl std::fmt::Debug for OlapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlapManager")
            .field("id", &self.id)
            .field("dsn", &self.config.dsn)
            .field("stats", &self.stats())
            .finish()
    }
}

impl OlapManager {
    pub fn open(engine: Arc<dyn Engine>, config: OlapConfig) -> Result<Self, OlapError> {
        config.validate()?;
        info!(
            dsn = %config.dsn,
            pool_size = config.pool_size,
            olap_capacity = config.olap_capacity(),
            allow_host_access = config.allow_host_access,
            external_table_storage = config.external_table_storage,
            storage_root = ?config.storage_root(),
            error_on_incompatible_version = config.error_on_incompatible_version,
            wal_size_threshold_bytes = config.wal_size_threshold_bytes,
            acquire_timeout_ms = ?config.acquire_timeout_ms,
            "olap manager config"
        );

        if let Some(db) = config.db_file_path() {
            if let Some(parent) = db.parent().filter(|p| !p.as_os_str().is_empty()) {
                create_private_dir_all(parent)?;
            }
            let report = hygiene::prepare_db_files(&config)?;
            if report != Default::default() {
                info!(
                    removed_tmp_dir = report.removed_tmp_dir,
                    removed_wal_bytes = ?report.removed_wal_bytes,
                    "cleaned up database files before open"
                );
            }
        }

        let storage = match config.storage_root() {
            Some(root) if config.external_table_storage => {
                create_private_dir_all(&root)?;
                Some(TableStorage::new(root))
            }
            _ => None,
        };

        let opener = build_opener(engine, &config, storage.clone());
        let handle = match opener() {
            Ok(handle) => handle,
            Err(OlapError::IncompatibleFormat { path }) if !config.error_on_incompatible_version => {
                warn!(
                    path = %path,
                    "database file was created with an incompatible version, recreating it"
                );
                hygiene::reset_db_files(&config)?;
                opener()?
            }
            Err(err) => return Err(err),
        };

        let manager = Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            admission: AdmissionControl::new(config.olap_capacity()),
            gate: AccessGate::new(handle, opener),
            txlock: TransactionLock::new(),
            storage,
            config,
            closed: AtomicBool::new(false),
        };
        info!(manager_id = manager.id, "olap manager opened");
        Ok(manager)
    }

    pub fn config(&self) -> &OlapConfig {
        &self.config
    }

    /// `None` unless external table storage is enabled.
    pub fn table_storage(&self) -> Option<&TableStorage> {
        self.storage.as_ref()
    }

    /// Acquires a connection for a fast catalog query. Meta queries have a
    /// dedicated slot and do not compete with OLAP queries.
    pub async fn acquire_meta(&self) -> Result<Lease, OlapError> {
        if let Some(lease) = scoped_lease(self.id) {
            return Ok(lease);
        }
        self.ensure_open()?;
        self.with_timeout(async {
            let tx = self.txlock.acquire(Consistency::Shared).await;
            let permit = self.admission.acquire_meta().await?;
            self.connect(permit, tx).await
        })
        .await
    }

    /// Acquires a connection for an analytical query.
    ///
    /// Higher `priority` is admitted first. At most one `long_running` query
    /// holds a slot at a time. `transactional` excludes every other lease for
    /// the lifetime of this one and, for file-backed databases, starts it on
    /// a freshly reopened handle; see [`Consistency::Exclusive`].
    pub async fn acquire_olap(
        &self,
        priority: i32,
        long_running: bool,
        transactional: bool,
    ) -> Result<Lease, OlapError> {
        if let Some(lease) = scoped_lease(self.id) {
            return Ok(lease);
        }
        self.ensure_open()?;
        let consistency = if transactional {
            Consistency::Exclusive
        } else {
            Consistency::Shared
        };
        self.with_timeout(async {
            let tx = self.txlock.acquire(consistency).await;
            let permit = self.admission.acquire_olap(priority, long_running).await?;
            self.connect(permit, tx).await
        })
        .await
    }

    /// Runs `f` with one OLAP connection. Acquisitions made by the same task
    /// while `f` runs return that connection instead of taking new slots, so
    /// nested calls cannot deadlock against the pools or the transaction lock.
    pub async fn with_connection<F, Fut, T>(
        &self,
        priority: i32,
        long_running: bool,
        transactional: bool,
        f: F,
    ) -> Result<T, OlapError>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = Result<T, OlapError>>,
    {
        if let Some(lease) = scoped_lease(self.id) {
            return f(lease).await;
        }
        let lease = self
            .acquire_olap(priority, long_running, transactional)
            .await?;
        let scoped = lease.scope(self.id).ok_or(OlapError::Closed)?;
        let result = run_scoped(scoped.clone(), f(scoped.lease())).await;
        let released = lease.release();
        let value = result?;
        released?;
        Ok(value)
    }

    /// Schedules a reopen when `err` is a fatal engine error and returns it
    /// unchanged. For errors obtained from a [`Lease`] this already happened.
    pub fn check_err(&self, err: EngineError) -> EngineError {
        self.gate.check_err(err)
    }

    pub fn stats(&self) -> OlapStats {
        let gate = self.gate.stats();
        OlapStats {
            connections_in_use: gate.connections_in_use,
            reopen_pending: gate.reopen_pending,
            reopens: gate.reopens,
            failed: gate.failed,
            olap_capacity: self.admission.olap_capacity(),
            olap_available: self.admission.olap_available(),
            meta_available: self.admission.meta_available(),
            long_running_available: self.admission.long_running_available(),
            exclusive_held: self.txlock.is_exclusive_held(),
        }
    }

    /// Closes the handle. Outstanding leases keep their connection until
    /// dropped; new and queued acquisitions fail with [`OlapError::Closed`].
    pub fn close(&self) -> Result<(), OlapError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.admission.close();
        self.gate.close()?;
        info!(manager_id = self.id, "olap manager closed");
        Ok(())
    }

    /// Deletes everything a manager with `config` stores on disk. The manager
    /// must not be open.
    pub fn drop_storage(config: &OlapConfig) -> Result<(), OlapError> {
        hygiene::drop_files(config)
    }

    fn ensure_open(&self) -> Result<(), OlapError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OlapError::Closed);
        }
        Ok(())
    }

    async fn connect(&self, admission: AdmissionPermit, tx: TxGuard) -> Result<Lease, OlapError> {
        let guard = self.gate.enter().await?;
        if tx.consistency() == Consistency::Exclusive && self.config.is_file_backed() {
            self.gate.reopen_exclusive()?;
        }
        let conn = self.gate.connect()?;
        Ok(Lease::new(conn, guard, admission, tx))
    }

    async fn with_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, OlapError>>,
    ) -> Result<T, OlapError> {
        match self.config.acquire_timeout() {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| OlapError::Timeout)?,
            None => fut.await,
        }
    }
}

impl Drop for OlapManager {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "closing olap manager on drop failed");
        }
    }
}

/// Opens a handle with the boot sequence installed and, when table storage is
/// enabled, re-attaches every table before the handle is handed out. The first
/// handle that comes up also prunes unreferenced table versions; later ones
/// only re-attach, since a replacement may be staged but not yet published.
fn build_opener(engine: Arc<dyn Engine>, config: &OlapConfig, storage: Option<TableStorage>) -> Opener {
    let dsn = config.dsn.clone();
    let max_connections = config.pool_size;
    let boot = boot_hook(boot_queries(config.allow_host_access));
    let initial = AtomicBool::new(true);
    Box::new(move || {
        let handle = engine
            .open(&dsn, max_connections, Arc::clone(&boot))
            .map_err(|e| classify::open_error(&dsn, e))?;
        if let Some(storage) = &storage {
            let recovered = handle.connect().map_err(OlapError::from).and_then(|mut conn| {
                if initial.swap(false, Ordering::AcqRel) {
                    storage.recover(conn.as_mut())
                } else {
                    storage.reattach(conn.as_mut())
                }
            });
            if let Err(err) = recovered {
                let _ = handle.close();
                return Err(err);
            }
        }
        Ok(handle)
    })
}
