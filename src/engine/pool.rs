//! Model Pool Manager
//!
//! Loads models on first use, shares one handle between all concurrent
//! holders and keeps a reference count per model. Models stay resident
//! after the last holder releases them; they are only freed by an explicit
//! `unload` (or the optional idle sweep), so back-to-back batches do not
//! pay the load cost again.
//!
//! Locking:
//! - one async mutex per registered model name serialises load, reload and
//!   unload of that model only; different models never wait on each other
//! - a short synchronous lock over the entry map guards reference counts
//!   and is never held across an await point

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Deref;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::model::{InferenceModel, ModelHandle};
use super::registry::{ModelCategory, ModelDescriptor, ModelRegistry};
use crate::config::InferenceConfig;
use crate::error::PoolError;
use crate::storage::{record_or_warn, AuditEvent, AuditSink};

/// Why a model is being force-reloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadReason {
    Manual,
    Oom,
    Crash,
    Timeout,
    System,
}

impl ReloadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadReason::Manual => "manual",
            ReloadReason::Oom => "oom",
            ReloadReason::Crash => "crash",
            ReloadReason::Timeout => "timeout",
            ReloadReason::System => "system",
        }
    }
}

impl FromStr for ReloadReason {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ReloadReason::Manual),
            "oom" => Ok(ReloadReason::Oom),
            "crash" => Ok(ReloadReason::Crash),
            "timeout" => Ok(ReloadReason::Timeout),
            "system" => Ok(ReloadReason::System),
            other => Err(PoolError::InvalidReloadReason {
                reason: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ReloadReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resident model with its holders count
struct LoadedModel {
    handle: ModelHandle,
    ref_count: u32,
    loaded_at: DateTime<Utc>,
    last_access: tokio::time::Instant,
}

/// Point-in-time view of one registered model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub category: ModelCategory,
    pub memory_cost: u64,
    pub enabled: bool,
    pub loaded: bool,
    pub ref_count: u32,
    pub loaded_at: Option<DateTime<Utc>>,
    /// Loaded successfully at least once since startup.
    pub available: bool,
    pub last_load_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartCount {
    pub model: String,
    pub reason: ReloadReason,
    pub count: u64,
}

/// Snapshot returned by [`ModelPool::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub loaded_names: Vec<String>,
    pub ref_counts: BTreeMap<String, u32>,
    pub total_loaded_cost: u64,
    pub memory_budget: u64,
    pub over_budget: bool,
    /// Handles handed out; failed acquires are not counted
    pub total_acquires: u64,
    pub models: Vec<ModelStatus>,
    pub restarts: Vec<RestartCount>,
}

/// Result of [`ModelPool::unload_all`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnloadReport {
    pub unloaded: Vec<String>,
    /// Models left resident because they still have holders
    pub in_use: Vec<String>,
}

/// Model Pool Manager with shared, reference-counted handles
pub struct ModelPool {
    registry: Arc<ModelRegistry>,
    sink: Arc<dyn AuditSink>,
    memory_budget: u64,
    idle_timeout: Option<Duration>,

    entries: RwLock<HashMap<String, LoadedModel>>,
    // One per registered name, created up front since the registry is static
    load_locks: HashMap<String, tokio::sync::Mutex<()>>,

    available: RwLock<HashSet<String>>,
    load_times: Mutex<HashMap<String, Duration>>,
    restarts: Mutex<HashMap<(String, ReloadReason), u64>>,
    acquires: AtomicU64,

    // Shutdown signal
    shutdown: Notify,
}

impl ModelPool {
    /// Create a new model pool
    pub fn new(
        registry: Arc<ModelRegistry>,
        config: &InferenceConfig,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        let load_locks = registry
            .iter()
            .map(|d| (d.name.clone(), tokio::sync::Mutex::new(())))
            .collect();

        Self {
            registry,
            sink,
            memory_budget: config.memory_budget,
            idle_timeout: config.model_idle_timeout.map(Duration::from_secs),
            entries: RwLock::new(HashMap::new()),
            load_locks,
            available: RwLock::new(HashSet::new()),
            load_times: Mutex::new(HashMap::new()),
            restarts: Mutex::new(HashMap::new()),
            acquires: AtomicU64::new(0),
            shutdown: Notify::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Acquire a shared handle, loading the model if it is not resident.
    ///
    /// Concurrent acquirers of the same unloaded model wait for a single
    /// load and all receive the same handle. A failed load leaves no entry
    /// behind and nothing to release.
    pub async fn acquire(self: &Arc<Self>, name: &str) -> Result<ScopedHandle, PoolError> {
        let descriptor = self.enabled_descriptor(name)?;

        if let Some(handle) = self.try_share(name) {
            return Ok(ScopedHandle::new(self.clone(), name, handle));
        }

        let _guard = self.load_lock(name)?.lock().await;

        // Double-check after waiting on the load lock
        if let Some(handle) = self.try_share(name) {
            return Ok(ScopedHandle::new(self.clone(), name, handle));
        }

        let (handle, elapsed) = self.load_model(descriptor).await?;
        {
            let mut entries = self.entries.write();
            entries.insert(
                name.to_string(),
                LoadedModel {
                    handle: handle.clone(),
                    ref_count: 1,
                    loaded_at: Utc::now(),
                    last_access: tokio::time::Instant::now(),
                },
            );
        }
        self.available.write().insert(name.to_string());
        self.acquires.fetch_add(1, Ordering::Relaxed);
        drop(_guard);

        // Counted from here on, even if this future is cancelled below
        let scoped = ScopedHandle::new(self.clone(), name, handle);

        self.warn_if_over_budget();
        record_or_warn(
            self.sink.as_ref(),
            AuditEvent::ModelLoaded {
                model: name.to_string(),
                duration_ms: elapsed.as_millis() as u64,
            },
        )
        .await;

        Ok(scoped)
    }

    /// Give back one reference. Returns the remaining count.
    ///
    /// Only needed directly for handles taken out of scope with
    /// [`ScopedHandle::detach`]; scoped handles call this on drop.
    pub fn release(&self, name: &str) -> Result<u32, PoolError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(name).ok_or_else(|| PoolError::NotLoaded {
            name: name.to_string(),
        })?;

        if entry.ref_count == 0 {
            return Err(PoolError::DoubleRelease {
                name: name.to_string(),
            });
        }

        entry.ref_count -= 1;
        entry.last_access = tokio::time::Instant::now();
        debug!("Released model {} (refs: {})", name, entry.ref_count);
        Ok(entry.ref_count)
    }

    /// Free a resident model that nobody holds.
    ///
    /// Returns `true` if the model was freed. Models still in use, and
    /// unknown or never-loaded models, are left alone.
    pub async fn unload(&self, name: &str) -> bool {
        let Some(lock) = self.load_locks.get(name) else {
            return false;
        };
        let _guard = lock.lock().await;

        let removed = {
            let mut entries = self.entries.write();
            match entries.get(name).map(|e| e.ref_count) {
                Some(refs) if refs > 0 => {
                    debug!("Model {} still has {} holders, not unloading", name, refs);
                    None
                }
                Some(_) => entries.remove(name),
                None => None,
            }
        };
        drop(_guard);

        let Some(removed) = removed else {
            return false;
        };
        // The pool's reference goes away here
        drop(removed);

        let memory_cost = self.registry.get(name).map(|d| d.memory_cost).unwrap_or(0);
        info!("Unloaded model {} ({} memory units freed)", name, memory_cost);
        record_or_warn(
            self.sink.as_ref(),
            AuditEvent::ModelFreed {
                model: name.to_string(),
                memory_cost,
            },
        )
        .await;
        true
    }

    /// Unload every resident model that has no holders.
    pub async fn unload_all(&self) -> UnloadReport {
        let resident: Vec<String> = self.entries.read().keys().cloned().collect();

        let mut report = UnloadReport::default();
        for name in resident {
            if self.unload(&name).await {
                report.unloaded.push(name);
            } else if self.is_loaded(&name) {
                report.in_use.push(name);
            }
        }
        report.unloaded.sort();
        report.in_use.sort();
        report
    }

    /// Force a fresh load, replacing the resident handle if there is one.
    ///
    /// Existing holders keep the handle they already have; new acquirers
    /// get the reloaded one. The reference count is carried over. If the
    /// load fails the previous entry is kept.
    ///
    /// Cost is reported per name, so while old holders are still around
    /// the superseded copy stays resident without showing up in
    /// [`PoolStatus::total_loaded_cost`].
    pub async fn reload(&self, name: &str, reason: &str) -> Result<(), PoolError> {
        let reason: ReloadReason = reason.parse()?;
        let descriptor = self.enabled_descriptor(name)?;

        let _guard = self.load_lock(name)?.lock().await;
        info!("Reloading model {} (reason: {})", name, reason);

        let (handle, elapsed) = self.load_model(descriptor).await?;
        let previous = {
            let mut entries = self.entries.write();
            match entries.get_mut(name) {
                Some(entry) => {
                    if entry.ref_count > 0 {
                        warn!(
                            "Model {} reloaded with {} holders, previous copy stays resident until released",
                            name, entry.ref_count
                        );
                    }
                    entry.loaded_at = Utc::now();
                    entry.last_access = tokio::time::Instant::now();
                    Some(std::mem::replace(&mut entry.handle, handle))
                }
                None => {
                    entries.insert(
                        name.to_string(),
                        LoadedModel {
                            handle,
                            ref_count: 0,
                            loaded_at: Utc::now(),
                            last_access: tokio::time::Instant::now(),
                        },
                    );
                    None
                }
            }
        };
        self.available.write().insert(name.to_string());
        *self
            .restarts
            .lock()
            .entry((name.to_string(), reason))
            .or_insert(0) += 1;
        drop(_guard);
        drop(previous);

        self.warn_if_over_budget();
        record_or_warn(
            self.sink.as_ref(),
            AuditEvent::ModelLoaded {
                model: name.to_string(),
                duration_ms: elapsed.as_millis() as u64,
            },
        )
        .await;
        record_or_warn(
            self.sink.as_ref(),
            AuditEvent::ModelRestarted {
                model: name.to_string(),
                reason,
            },
        )
        .await;
        Ok(())
    }

    /// Check if a model is loaded
    pub fn is_loaded(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Current holders count, `None` when not resident
    pub fn ref_count(&self, name: &str) -> Option<u32> {
        self.entries.read().get(name).map(|e| e.ref_count)
    }

    /// Restart counter for one `(name, reason)` label pair
    pub fn restart_count(&self, name: &str, reason: ReloadReason) -> u64 {
        self.restarts
            .lock()
            .get(&(name.to_string(), reason))
            .copied()
            .unwrap_or(0)
    }

    /// Get status of all models
    ///
    /// Reads current state only; never waits for an in-flight load.
    pub fn get_status(&self) -> PoolStatus {
        let entries = self.entries.read();
        let available = self.available.read();
        let load_times = self.load_times.lock();

        let models: Vec<ModelStatus> = self
            .registry
            .iter()
            .map(|d| {
                let entry = entries.get(&d.name);
                ModelStatus {
                    name: d.name.clone(),
                    category: d.category,
                    memory_cost: d.memory_cost,
                    enabled: d.enabled,
                    loaded: entry.is_some(),
                    ref_count: entry.map(|e| e.ref_count).unwrap_or(0),
                    loaded_at: entry.map(|e| e.loaded_at),
                    available: available.contains(&d.name),
                    last_load_ms: load_times.get(&d.name).map(|t| t.as_millis() as u64),
                }
            })
            .collect();

        let loaded_names: Vec<String> = models
            .iter()
            .filter(|m| m.loaded)
            .map(|m| m.name.clone())
            .collect();
        let ref_counts = models
            .iter()
            .filter(|m| m.loaded)
            .map(|m| (m.name.clone(), m.ref_count))
            .collect();
        let total_loaded_cost = self.registry.total_cost(&loaded_names);

        let mut restarts: Vec<RestartCount> = self
            .restarts
            .lock()
            .iter()
            .map(|((model, reason), count)| RestartCount {
                model: model.clone(),
                reason: *reason,
                count: *count,
            })
            .collect();
        restarts.sort_by(|a, b| a.model.cmp(&b.model).then(a.reason.cmp(&b.reason)));

        PoolStatus {
            loaded_names,
            ref_counts,
            total_loaded_cost,
            memory_budget: self.memory_budget,
            over_budget: total_loaded_cost > self.memory_budget,
            total_acquires: self.acquires.load(Ordering::Relaxed),
            models,
            restarts,
        }
    }

    fn enabled_descriptor(&self, name: &str) -> Result<&ModelDescriptor, PoolError> {
        let descriptor = self.registry.get(name).ok_or_else(|| PoolError::UnknownModel {
            name: name.to_string(),
        })?;
        if !descriptor.enabled {
            return Err(PoolError::ModelDisabled {
                name: name.to_string(),
            });
        }
        Ok(descriptor)
    }

    fn load_lock(&self, name: &str) -> Result<&tokio::sync::Mutex<()>, PoolError> {
        self.load_locks.get(name).ok_or_else(|| PoolError::UnknownModel {
            name: name.to_string(),
        })
    }

    /// Take another reference on a resident model
    fn try_share(&self, name: &str) -> Option<ModelHandle> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(name)?;
        entry.ref_count += 1;
        entry.last_access = tokio::time::Instant::now();
        self.acquires.fetch_add(1, Ordering::Relaxed);
        debug!("Acquired model {} (refs: {})", name, entry.ref_count);
        Some(entry.handle.clone())
    }

    async fn load_model(
        &self,
        descriptor: &ModelDescriptor,
    ) -> Result<(ModelHandle, Duration), PoolError> {
        info!("Loading model: {} from {}", descriptor.name, descriptor.path.display());
        let start = Instant::now();

        let handle = descriptor
            .loader
            .load(descriptor)
            .await
            .map_err(|e| PoolError::LoadFailure {
                name: descriptor.name.clone(),
                source: e.into(),
            })?;

        let elapsed = start.elapsed();
        info!("Model {} loaded in {:?}", descriptor.name, elapsed);
        self.load_times.lock().insert(descriptor.name.clone(), elapsed);

        Ok((handle, elapsed))
    }

    fn warn_if_over_budget(&self) {
        let loaded: Vec<String> = self.entries.read().keys().cloned().collect();
        let total = self.registry.total_cost(&loaded);
        if total > self.memory_budget {
            warn!(
                "Resident models use {} memory units, over the budget of {}",
                total, self.memory_budget
            );
        }
    }

    /// Unload models nobody has touched for longer than the idle timeout
    async fn cleanup_idle_models(&self, idle_timeout: Duration) {
        let now = tokio::time::Instant::now();
        let idle: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.ref_count == 0 && now.duration_since(e.last_access) > idle_timeout)
            .map(|(name, _)| name.clone())
            .collect();

        for name in idle {
            info!("Unloading idle model: {}", name);
            self.unload(&name).await;
        }
    }

    /// Start the background idle sweep. Returns immediately when no idle
    /// timeout is configured.
    pub async fn start_cleanup_task(self: Arc<Self>) {
        let Some(idle_timeout) = self.idle_timeout else {
            debug!("No model idle timeout configured, idle sweep disabled");
            return;
        };
        let check_interval = idle_timeout.min(Duration::from_secs(60));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(check_interval) => {
                    debug!("Running model cleanup check");
                    self.cleanup_idle_models(idle_timeout).await;
                }
                _ = self.shutdown.notified() => {
                    info!("Model pool cleanup task shutting down");
                    break;
                }
            }
        }
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// A counted reference to a loaded model.
///
/// Dropping the handle releases the reference, so every exit path
/// (early return, error, timeout, panic) gives it back.
pub struct ScopedHandle {
    pool: Arc<ModelPool>,
    name: String,
    model: ModelHandle,
    released: bool,
}

impl ScopedHandle {
    fn new(pool: Arc<ModelPool>, name: &str, model: ModelHandle) -> Self {
        Self {
            pool,
            name: name.to_string(),
            model,
            released: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared model, e.g. to move a clone into a spawned task.
    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    /// Release now and surface any lifecycle error instead of logging it.
    pub fn release(mut self) -> Result<u32, PoolError> {
        self.released = true;
        self.pool.release(&self.name)
    }

    /// Keep the reference past this scope. The caller becomes responsible
    /// for a matching [`ModelPool::release`].
    pub fn detach(mut self) -> ModelHandle {
        self.released = true;
        self.model.clone()
    }
}

impl Deref for ScopedHandle {
    type Target = dyn InferenceModel;

    fn deref(&self) -> &Self::Target {
        self.model.as_ref()
    }
}

impl std::fmt::Debug for ScopedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedHandle")
            .field("name", &self.name)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for ScopedHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.pool.release(&self.name) {
            error!("Lifecycle bug while dropping handle for {}: {}", self.name, e);
        }
    }
}
