use crate::loader::{ModelHandle, SlotLoader};
use anyhow::{Result, anyhow};
use fastsearch_core::{EvictionPolicy, FastSearchConfig, KeepLoaded, ModelConfig, unix_time_f64};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Static per-slot memory estimate in MB, used for eviction planning only.
pub fn estimate_model_memory(slot: &str) -> f64 {
    match slot {
        "embedder" => 450.0,   // bge-base-en-v1.5
        "reranker" => 90.0,    // ms-marco-MiniLM-L-6-v2
        "summarizer" => 4000.0, // 7B class, reserved
        _ => 500.0,
    }
}

/// Source of the measured resident-set size of this process.
pub trait MemoryProbe: Send + Sync {
    fn resident_mb(&self) -> f64;
}

/// Reads the process RSS via sysinfo, refreshing only our own PID.
pub struct ProcessMemoryProbe {
    system: Mutex<sysinfo::System>,
    pid: sysinfo::Pid,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
            pid: sysinfo::Pid::from_u32(std::process::id()),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_mb(&self) -> f64 {
        let mut system = self.system.lock().expect("memory probe lock");
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[self.pid]), true);
        system
            .process(self.pid)
            .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0)
    }
}

/// A successful `load_model` result: the live handle plus bookkeeping the
/// caller reports back over RPC.
#[derive(Debug)]
pub struct ModelLease {
    pub slot: String,
    pub handle: ModelHandle,
    pub memory_mb: f64,
}

struct LoadedModel {
    handle: ModelHandle,
    loaded_at: f64,
    last_used: f64,
    memory_mb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub loaded_at: f64,
    pub last_used: f64,
    pub memory_mb: f64,
    pub idle_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub loaded_models: BTreeMap<String, SlotStatus>,
    pub total_memory_mb: f64,
    pub max_memory_mb: u64,
}

#[derive(Default)]
struct State {
    /// Slot registry in touch order: front = least recently used.
    models: IndexMap<String, LoadedModel>,
    /// Pending delayed idle-unload task per slot, replaced on every touch.
    unload_tasks: HashMap<String, JoinHandle<()>>,
}

struct Inner {
    config: RwLock<FastSearchConfig>,
    loader: Box<dyn SlotLoader>,
    probe: Box<dyn MemoryProbe>,
    /// Serializes loads globally so only one model's peak allocation is in
    /// flight at a time.
    load_lock: tokio::sync::Mutex<()>,
    state: Mutex<State>,
}

/// Slot registry with a memory budget.
///
/// Loads are serialized; each hit promotes the slot to the MRU end of the
/// registry (under LRU policy) and re-arms its idle-unload task. When the
/// measured RSS plus the incoming slot's estimate exceeds `max_ram_mb`,
/// least-recently-used non-pinned slots are evicted first. The budget is
/// advisory: if nothing is evictable the load proceeds with a warning.
#[derive(Clone)]
pub struct ModelManager {
    inner: Arc<Inner>,
}

impl ModelManager {
    pub fn new(config: FastSearchConfig, loader: Box<dyn SlotLoader>) -> Self {
        Self::with_probe(config, loader, Box::new(ProcessMemoryProbe::new()))
    }

    pub fn with_probe(
        config: FastSearchConfig,
        loader: Box<dyn SlotLoader>,
        probe: Box<dyn MemoryProbe>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                loader,
                probe,
                load_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Replace the configuration (`reload_config`).
    pub fn set_config(&self, config: FastSearchConfig) {
        *self.inner.config.write().expect("config lock") = config;
    }

    fn slot_config(&self, slot: &str) -> Option<ModelConfig> {
        self.inner
            .config
            .read()
            .expect("config lock")
            .models
            .get(slot)
            .cloned()
    }

    fn is_pinned(&self, slot: &str) -> bool {
        matches!(
            self.slot_config(slot),
            Some(cfg) if cfg.keep_loaded == KeepLoaded::Always
        )
    }

    pub fn is_loaded(&self, slot: &str) -> bool {
        self.inner
            .state
            .lock()
            .expect("state lock")
            .models
            .contains_key(slot)
    }

    /// Loaded slot names in touch order, least recently used first.
    pub fn loaded_slots(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .expect("state lock")
            .models
            .keys()
            .cloned()
            .collect()
    }

    /// Resolve a slot, loading the model if absent.
    ///
    /// A hit touches `last_used`, promotes the slot to the MRU end, and
    /// re-arms the idle-unload task. A miss evicts as needed to fit the
    /// budget, loads on the blocking pool, and registers the slot.
    pub async fn load_model(&self, slot: &str) -> Result<ModelLease> {
        let _guard = self.inner.load_lock.lock().await;

        if let Some(lease) = self.touch_existing(slot) {
            self.arm_idle_unload(slot);
            return Ok(lease);
        }

        // A pending unload must not fire between here and registration.
        {
            let mut state = self.inner.state.lock().expect("state lock");
            if let Some(task) = state.unload_tasks.remove(slot) {
                task.abort();
            }
        }

        let model_config = self
            .slot_config(slot)
            .ok_or_else(|| anyhow!("unknown model slot: {slot}"))?;

        self.ensure_memory_budget(slot);

        info!(slot, model = %model_config.name, "loading model");
        let started = std::time::Instant::now();
        let loader_inner = self.inner.clone();
        let slot_owned = slot.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            loader_inner.loader.load(&slot_owned, &model_config)
        })
        .await
        .map_err(|e| anyhow!("model load task failed: {e}"))??;
        info!(
            slot,
            elapsed_ms = started.elapsed().as_millis() as u64,
            resident_mb = self.inner.probe.resident_mb() as u64,
            "model loaded"
        );

        let now = unix_time_f64();
        let memory_mb = estimate_model_memory(slot);
        {
            let mut state = self.inner.state.lock().expect("state lock");
            state.models.insert(
                slot.to_string(),
                LoadedModel {
                    handle: handle.clone(),
                    loaded_at: now,
                    last_used: now,
                    memory_mb,
                },
            );
        }
        self.arm_idle_unload(slot);

        Ok(ModelLease {
            slot: slot.to_string(),
            handle,
            memory_mb,
        })
    }

    /// Unload a slot. Pinned slots refuse (logged, not an error); unknown
    /// or already-absent slots are a no-op.
    pub async fn unload_model(&self, slot: &str) -> Result<()> {
        let _guard = self.inner.load_lock.lock().await;
        if !self.is_loaded(slot) {
            return Ok(());
        }
        if self.is_pinned(slot) {
            warn!(slot, "refusing to unload pinned model slot");
            return Ok(());
        }
        self.remove_slot(slot);
        Ok(())
    }

    /// Snapshot of loaded slots plus measured process memory.
    pub fn get_status(&self) -> ManagerStatus {
        let max_memory_mb = self
            .inner
            .config
            .read()
            .expect("config lock")
            .memory
            .max_ram_mb;
        let total_memory_mb = self.inner.probe.resident_mb();
        let now = unix_time_f64();
        let state = self.inner.state.lock().expect("state lock");
        let loaded_models = state
            .models
            .iter()
            .map(|(slot, model)| {
                (
                    slot.clone(),
                    SlotStatus {
                        loaded_at: model.loaded_at,
                        last_used: model.last_used,
                        memory_mb: model.memory_mb,
                        idle_seconds: (now - model.last_used).max(0.0),
                    },
                )
            })
            .collect();
        ManagerStatus {
            loaded_models,
            total_memory_mb,
            max_memory_mb,
        }
    }

    /// Cancel every pending idle-unload task and drop every slot, pinned
    /// ones included.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock().expect("state lock");
        for (_, task) in state.unload_tasks.drain() {
            task.abort();
        }
        let count = state.models.len();
        state.models.clear();
        if count > 0 {
            info!(count, "unloaded all models");
        }
    }

    /// Touch an already-loaded slot: bump `last_used` and (under LRU)
    /// promote it to the MRU end of the registry.
    fn touch_existing(&self, slot: &str) -> Option<ModelLease> {
        let promote = self
            .inner
            .config
            .read()
            .expect("config lock")
            .memory
            .eviction_policy
            == EvictionPolicy::Lru;
        let mut state = self.inner.state.lock().expect("state lock");
        let index = state.models.get_index_of(slot)?;
        if promote {
            let last = state.models.len() - 1;
            state.models.move_index(index, last);
        }
        let model = state.models.get_mut(slot)?;
        model.last_used = unix_time_f64();
        Some(ModelLease {
            slot: slot.to_string(),
            handle: model.handle.clone(),
            memory_mb: model.memory_mb,
        })
    }

    /// Evict least-recently-used non-pinned slots until the incoming load
    /// fits, or nothing evictable remains.
    fn ensure_memory_budget(&self, slot: &str) {
        let max_ram_mb = self
            .inner
            .config
            .read()
            .expect("config lock")
            .memory
            .max_ram_mb as f64;
        let needed_mb = estimate_model_memory(slot);

        loop {
            let current_mb = self.inner.probe.resident_mb();
            if current_mb + needed_mb <= max_ram_mb {
                return;
            }
            let victim = self.eviction_candidate();
            match victim {
                Some(victim) => {
                    info!(
                        slot = %victim,
                        current_mb = current_mb as u64,
                        needed_mb = needed_mb as u64,
                        max_ram_mb = max_ram_mb as u64,
                        "evicting model to fit memory budget"
                    );
                    self.remove_slot(&victim);
                }
                None => {
                    warn!(
                        current_mb = current_mb as u64,
                        needed_mb = needed_mb as u64,
                        max_ram_mb = max_ram_mb as u64,
                        "memory budget exceeded but no evictable slot remains"
                    );
                    return;
                }
            }
        }
    }

    /// First non-pinned slot scanning from the LRU end.
    fn eviction_candidate(&self) -> Option<String> {
        let config = self.inner.config.read().expect("config lock");
        let state = self.inner.state.lock().expect("state lock");
        state
            .models
            .keys()
            .find(|slot| {
                config
                    .models
                    .get(*slot)
                    .is_none_or(|cfg| cfg.keep_loaded != KeepLoaded::Always)
            })
            .cloned()
    }

    fn remove_slot(&self, slot: &str) {
        let mut state = self.inner.state.lock().expect("state lock");
        if let Some(task) = state.unload_tasks.remove(slot) {
            task.abort();
        }
        if state.models.shift_remove(slot).is_some() {
            info!(slot, "model unloaded");
        }
    }

    /// Arm (or replace) the delayed unload for an on-demand slot.
    fn arm_idle_unload(&self, slot: &str) {
        let Some(cfg) = self.slot_config(slot) else {
            return;
        };
        if cfg.keep_loaded != KeepLoaded::OnDemand || cfg.idle_timeout_seconds == 0 {
            return;
        }
        let timeout = cfg.idle_timeout_seconds;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let slot_owned = slot.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout)).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = ModelManager { inner };
            manager.maybe_idle_unload(&slot_owned, timeout).await;
        });
        let mut state = self.inner.state.lock().expect("state lock");
        if let Some(old) = state.unload_tasks.insert(slot.to_string(), task) {
            old.abort();
        }
    }

    /// Post-sleep check: only unload if the slot really sat idle for the
    /// whole timeout. A touch during the sleep re-armed a fresh task, so
    /// this one must stand down.
    async fn maybe_idle_unload(&self, slot: &str, timeout: u64) {
        let _guard = self.inner.load_lock.lock().await;
        let now = unix_time_f64();
        {
            let state = self.inner.state.lock().expect("state lock");
            let Some(model) = state.models.get(slot) else {
                return;
            };
            if now - model.last_used < timeout as f64 {
                debug!(slot, "idle unload skipped, slot used during sleep");
                return;
            }
        }
        if self.is_pinned(slot) {
            return;
        }
        debug!(slot, timeout, "idle timeout expired");
        self.remove_slot(slot);
    }
}
