//! Per-namespace truncation state.
//!
//! Each namespace holds a namespace-wide threshold, per-set thresholds and
//! a reaping pass state machine:
//!
//! ```text
//! Idle -> Running -> (Restart -> Running)* -> Idle
//! ```
//!
//! A command arriving while a pass runs moves it to `Restart`; the last
//! worker of the interrupted pass starts the next one. Until
//! [`TruncationRegistry::done_startup`] runs, thresholds replayed from the
//! log live in a provisional startup table instead.

use super::log::{TruncateHval, TruncateLog, TruncateLogEntry};
use super::reaper::{self, PermitPool};
use super::{MAX_SET_NAME_LEN, MAX_TRUNCATE_THREADS};
use crate::cluster::{RecordStore, SindexObserver};
use crate::core::config::Config;
use crate::core::error::{KeystoneError, KeystoneResult};
use crate::core::time::{lut_from_unix_ns, Clock};
use crate::ops::observability::KeystoneMetrics;
use crate::record::Record;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Reaping pass state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncatePhase {
    #[default]
    Idle,
    Running,
    /// Thresholds changed under a running pass; rescan when it ends.
    Restart,
}

/// An undone threshold, kept so the undo survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cenotaph {
    pub set: Option<String>,
    pub last_update_time: u64,
}

/// Snapshot of one namespace's truncation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TruncateStats {
    pub namespace: String,
    pub phase: TruncatePhase,
    pub lut: u64,
    pub set_luts: BTreeMap<String, u64>,
    pub n_threads_running: u32,
    pub n_records: u64,
    pub n_records_this_run: u64,
}

#[derive(Debug, Default)]
pub(super) struct NamespaceTruncation {
    lut: u64,
    set_luts: HashMap<String, u64>,
    cenotaphs: BTreeMap<Option<String>, u64>,
    pub(super) phase: TruncatePhase,
    pub(super) abort: bool,
    pub(super) n_threads_running: u32,
    n_records: u64,
    n_records_this_run: u64,
}

impl NamespaceTruncation {
    fn threshold(&self, set: Option<&str>) -> u64 {
        match set {
            None => self.lut,
            Some(set) => self.set_luts.get(set).copied().unwrap_or(0),
        }
    }

    fn set_threshold(&mut self, set: Option<&str>, lut: u64) {
        match set {
            None => self.lut = lut,
            Some(set) => {
                self.set_luts.insert(set.to_string(), lut);
            }
        }
    }

    fn clear_threshold(&mut self, set: Option<&str>) {
        match set {
            None => self.lut = 0,
            Some(set) => {
                self.set_luts.remove(set);
            }
        }
    }

    /// Put back a threshold read before a failed update. Zero means unset.
    fn restore_threshold(&mut self, set: Option<&str>, lut: u64) {
        if lut == 0 {
            self.clear_threshold(set);
        } else {
            self.set_threshold(set, lut);
        }
    }

    fn has_thresholds(&self) -> bool {
        self.lut != 0 || !self.set_luts.is_empty()
    }

    pub(super) fn reset_run(&mut self) {
        self.n_records_this_run = 0;
    }
}

/// Replayed entry awaiting `done_startup`.
#[derive(Debug, Clone, Copy)]
struct StartupEntry {
    min_lut: u64,
    max_lut: u64,
    cenotaph: bool,
}

#[derive(Debug)]
pub(super) struct Table {
    pub(super) namespaces: Vec<NamespaceTruncation>,
    startup: Option<HashMap<(u32, Option<String>), StartupEntry>>,
}

/// Truncation thresholds, reaping passes and the persisted log.
pub struct TruncationRegistry {
    names: Vec<String>,
    pub(super) table: Mutex<Table>,
    pub(super) idle: Condvar,
    pub(super) store: Arc<dyn RecordStore>,
    pub(super) sindex: Arc<dyn SindexObserver>,
    pub(super) metrics: Arc<KeystoneMetrics>,
    pub(super) threads_per_pass: u32,
    /// Bounds reaper threads across every namespace of this node.
    pub(super) permits: PermitPool,
    pub(super) handles: Mutex<Vec<JoinHandle<()>>>,
    pub(super) shutdown: AtomicBool,
    clock: Arc<dyn Clock>,
    log: Option<TruncateLog>,
}

impl std::fmt::Debug for TruncationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TruncationRegistry")
            .field("namespaces", &self.names)
            .field("log", &self.log)
            .finish()
    }
}

impl TruncationRegistry {
    /// Registry with no persisted log. Starts in the startup state.
    pub fn new(
        config: &Config,
        store: Arc<dyn RecordStore>,
        sindex: Arc<dyn SindexObserver>,
        clock: Arc<dyn Clock>,
        metrics: Arc<KeystoneMetrics>,
    ) -> Self {
        let names: Vec<String> = config.namespaces.iter().map(|ns| ns.name.clone()).collect();
        let namespaces = names.iter().map(|_| NamespaceTruncation::default()).collect();
        Self {
            names,
            table: Mutex::new(Table {
                namespaces,
                startup: Some(HashMap::new()),
            }),
            idle: Condvar::new(),
            store,
            sindex,
            metrics,
            threads_per_pass: config.truncate.threads,
            permits: PermitPool::new(config.truncate.max_threads.clamp(1, MAX_TRUNCATE_THREADS)),
            handles: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            clock,
            log: None,
        }
    }

    /// Registry persisting to the log in `config.node.storage_dir`. Logged
    /// entries are replayed into the startup table.
    pub fn open(
        config: &Config,
        store: Arc<dyn RecordStore>,
        sindex: Arc<dyn SindexObserver>,
        clock: Arc<dyn Clock>,
        metrics: Arc<KeystoneMetrics>,
    ) -> KeystoneResult<Self> {
        let mut registry = Self::new(config, store, sindex, clock, metrics);
        let log = TruncateLog::in_dir(std::path::Path::new(&config.node.storage_dir));
        let entries = log.load()?;
        tracing::info!(
            path = %log.path().display(),
            entries = entries.len(),
            "replaying truncate log"
        );
        for entry in entries {
            let Some(ns_index) = registry.ns_index(&entry.namespace) else {
                tracing::warn!(namespace = %entry.namespace, "truncate log names unknown namespace");
                continue;
            };
            registry.action_startup(
                ns_index,
                entry.set.as_deref(),
                entry.hval.lut(),
                entry.hval.is_cenotaph(),
            );
        }
        registry.log = Some(log);
        Ok(registry)
    }

    fn ns_index(&self, namespace: &str) -> Option<u32> {
        self.names
            .iter()
            .position(|n| n == namespace)
            .map(|ix| ix as u32)
    }

    fn require_ns(&self, namespace: &str) -> KeystoneResult<u32> {
        self.ns_index(namespace).ok_or_else(|| {
            KeystoneError::truncate_rejected(format!("unknown namespace {}", namespace))
        })
    }

    fn check_set(set: Option<&str>) -> KeystoneResult<()> {
        match set {
            Some(set) if set.is_empty() || set.len() > MAX_SET_NAME_LEN => Err(
                KeystoneError::truncate_rejected(format!("invalid set name {:?}", set)),
            ),
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Record a threshold found at startup. Lookups before `done_startup`
    /// use the smallest value seen for the namespace or set.
    pub fn action_startup(&self, ns_index: u32, set: Option<&str>, lut: u64, cenotaph: bool) {
        let mut table = self.table.lock();
        let Some(startup) = table.startup.as_mut() else {
            tracing::warn!(ns_index, "startup truncate entry after startup finished");
            return;
        };
        startup
            .entry((ns_index, set.map(str::to_string)))
            .and_modify(|e| {
                e.min_lut = e.min_lut.min(lut);
                e.max_lut = e.max_lut.max(lut);
                e.cenotaph &= cenotaph;
            })
            .or_insert(StartupEntry {
                min_lut: lut,
                max_lut: lut,
                cenotaph,
            });
    }

    /// Fold the startup table into the live thresholds, discard it and
    /// start a reaping pass for every namespace that has thresholds.
    pub fn done_startup(self: &Arc<Self>) {
        let mut table = self.table.lock();
        let Some(startup) = table.startup.take() else {
            return;
        };
        for ((ns_index, set), entry) in startup {
            let Some(ns) = table.namespaces.get_mut(ns_index as usize) else {
                continue;
            };
            if entry.cenotaph {
                ns.cenotaphs.insert(set, entry.max_lut);
            } else if entry.max_lut > ns.threshold(set.as_deref()) {
                ns.set_threshold(set.as_deref(), entry.max_lut);
            }
        }
        for ns_index in 0..table.namespaces.len() {
            if table.namespaces[ns_index].has_thresholds() {
                reaper::start_pass(self, ns_index as u32, &mut table.namespaces[ns_index]);
            }
        }
        tracing::info!("truncate startup complete");
    }

    pub fn in_startup(&self) -> bool {
        self.table.lock().startup.is_some()
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Admin truncate. `lut_arg` is unix-epoch nanoseconds or `"now"`;
    /// `None` means now. Returns the threshold in effect afterwards.
    pub fn truncate(
        self: &Arc<Self>,
        namespace: &str,
        set: Option<&str>,
        lut_arg: Option<&str>,
    ) -> KeystoneResult<u64> {
        let now = self.clock.now_ms();
        let lut = match lut_arg {
            None | Some("now") => now,
            Some(raw) => {
                let unix_ns: u64 = raw.parse().map_err(|_| {
                    KeystoneError::truncate_rejected(format!("bad lut {:?}", raw))
                })?;
                let lut = lut_from_unix_ns(unix_ns).ok_or_else(|| {
                    KeystoneError::truncate_rejected(format!("lut {} precedes epoch", raw))
                })?;
                if lut > now {
                    return Err(KeystoneError::truncate_rejected(format!(
                        "lut {} is in the future",
                        raw
                    )));
                }
                lut
            }
        };
        self.apply_command(namespace, set, lut)
    }

    /// Raise a threshold that was validated by the issuing node. Thresholds
    /// never move down; a lower value leaves the current one in place.
    pub fn apply_command(
        self: &Arc<Self>,
        namespace: &str,
        set: Option<&str>,
        lut: u64,
    ) -> KeystoneResult<u64> {
        let ns_index = self.require_ns(namespace)?;
        Self::check_set(set)?;

        let mut table = self.table.lock();
        let in_startup = table.startup.is_some();
        let ns = &mut table.namespaces[ns_index as usize];
        let current = ns.threshold(set);
        if lut <= current {
            tracing::info!(
                namespace,
                set = set.unwrap_or(""),
                lut,
                current,
                "truncate threshold unchanged"
            );
            return Ok(current);
        }

        // Roll back if the log write fails.
        ns.set_threshold(set, lut);
        let cenotaph = ns.cenotaphs.remove(&set.map(str::to_string));
        if let Err(e) = self.persist(&table) {
            let ns = &mut table.namespaces[ns_index as usize];
            ns.restore_threshold(set, current);
            if let Some(cenotaph) = cenotaph {
                ns.cenotaphs.insert(set.map(str::to_string), cenotaph);
            }
            return Err(e);
        }

        let ns = &mut table.namespaces[ns_index as usize];
        ns.abort = false;
        tracing::info!(namespace, set = set.unwrap_or(""), lut, "truncate threshold raised");
        if !in_startup {
            match ns.phase {
                TruncatePhase::Idle => reaper::start_pass(self, ns_index, ns),
                TruncatePhase::Running => ns.phase = TruncatePhase::Restart,
                TruncatePhase::Restart => {}
            }
        }
        Ok(lut)
    }

    /// Admin truncate-undo. Clears the threshold and stops the pass it
    /// started; records already reaped stay gone.
    pub fn truncate_undo(self: &Arc<Self>, namespace: &str, set: Option<&str>) -> KeystoneResult<()> {
        let ns_index = self.require_ns(namespace)?;
        Self::check_set(set)?;

        let mut table = self.table.lock();
        let ns = &mut table.namespaces[ns_index as usize];
        let lut = ns.threshold(set);
        if lut == 0 {
            return Err(KeystoneError::truncate_rejected(format!(
                "no truncation for {}{}",
                namespace,
                set.map(|s| format!(".{}", s)).unwrap_or_default()
            )));
        }
        let set_key = set.map(str::to_string);
        ns.clear_threshold(set);
        let cenotaph = ns.cenotaphs.insert(set_key.clone(), lut);
        if let Err(e) = self.persist(&table) {
            let ns = &mut table.namespaces[ns_index as usize];
            ns.restore_threshold(set, lut);
            match cenotaph {
                Some(previous) => ns.cenotaphs.insert(set_key, previous),
                None => ns.cenotaphs.remove(&set_key),
            };
            return Err(e);
        }

        let ns = &mut table.namespaces[ns_index as usize];
        if ns.phase != TruncatePhase::Idle {
            if ns.has_thresholds() {
                ns.phase = TruncatePhase::Restart;
            } else {
                ns.abort = true;
            }
        }
        tracing::info!(namespace, set = set.unwrap_or(""), lut, "truncate undone");
        Ok(())
    }

    fn persist(&self, table: &Table) -> KeystoneResult<()> {
        let Some(ref log) = self.log else {
            return Ok(());
        };
        let mut entries = Vec::new();
        for (ix, ns) in table.namespaces.iter().enumerate() {
            let namespace = &self.names[ix];
            if ns.lut != 0 {
                entries.push(TruncateLogEntry {
                    namespace: namespace.clone(),
                    set: None,
                    hval: TruncateHval::new(ns.lut, false)?,
                });
            }
            let mut sets: Vec<_> = ns.set_luts.iter().collect();
            sets.sort();
            for (set, lut) in sets {
                entries.push(TruncateLogEntry {
                    namespace: namespace.clone(),
                    set: Some(set.clone()),
                    hval: TruncateHval::new(*lut, false)?,
                });
            }
            for (set, lut) in &ns.cenotaphs {
                entries.push(TruncateLogEntry {
                    namespace: namespace.clone(),
                    set: set.clone(),
                    hval: TruncateHval::new(*lut, true)?,
                });
            }
        }
        if let Some(ref startup) = table.startup {
            for ((ns_index, set), entry) in startup {
                entries.push(TruncateLogEntry {
                    namespace: self.names[*ns_index as usize].clone(),
                    set: set.clone(),
                    hval: TruncateHval::new(entry.max_lut, entry.cenotaph)?,
                });
            }
        }
        log.store(&entries)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Threshold covering records of `set` in the namespace: the larger of
    /// the namespace and set thresholds. Zero means nothing is truncated.
    pub fn effective_lut(&self, ns_index: u32, set: Option<&str>) -> u64 {
        let table = self.table.lock();
        let Some(ns) = table.namespaces.get(ns_index as usize) else {
            return 0;
        };
        let mut lut = ns.lut;
        if let Some(set) = set {
            lut = lut.max(ns.threshold(Some(set)));
        }
        if let Some(ref startup) = table.startup {
            let provisional = |key: Option<&str>| {
                startup
                    .get(&(ns_index, key.map(str::to_string)))
                    .filter(|e| !e.cenotaph)
                    .map_or(0, |e| e.min_lut)
            };
            lut = lut.max(provisional(None));
            if set.is_some() {
                lut = lut.max(provisional(set));
            }
        }
        lut
    }

    /// Whether a record stamped `lut` is truncated. The threshold itself is
    /// truncated.
    pub fn lut_is_truncated(&self, lut: u64, ns_index: u32, set: Option<&str>) -> bool {
        let threshold = self.effective_lut(ns_index, set);
        threshold != 0 && lut <= threshold
    }

    pub fn record_is_truncated(&self, record: &Record) -> bool {
        self.lut_is_truncated(
            record.meta.last_update_time,
            record.key.ns_index,
            record.set_name.as_deref(),
        )
    }

    /// The threshold is at or ahead of `now_ms`: a write stamped now would
    /// be truncated on arrival.
    pub fn now_is_truncated(&self, ns_index: u32, set: Option<&str>, now_ms: u64) -> bool {
        let threshold = self.effective_lut(ns_index, set);
        threshold != 0 && threshold >= now_ms
    }

    pub fn list_cenotaphs(&self, namespace: &str) -> KeystoneResult<Vec<Cenotaph>> {
        let ns_index = self.require_ns(namespace)?;
        let table = self.table.lock();
        Ok(table.namespaces[ns_index as usize]
            .cenotaphs
            .iter()
            .map(|(set, lut)| Cenotaph {
                set: set.clone(),
                last_update_time: *lut,
            })
            .collect())
    }

    pub fn stats(&self, namespace: &str) -> KeystoneResult<TruncateStats> {
        let ns_index = self.require_ns(namespace)?;
        let table = self.table.lock();
        let ns = &table.namespaces[ns_index as usize];
        Ok(TruncateStats {
            namespace: namespace.to_string(),
            phase: ns.phase,
            lut: ns.lut,
            set_luts: ns.set_luts.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            n_threads_running: ns.n_threads_running,
            n_records: ns.n_records,
            n_records_this_run: ns.n_records_this_run,
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Block until the namespace's pass is idle. Returns false on timeout.
    pub fn wait_idle(&self, namespace: &str, timeout: Duration) -> KeystoneResult<bool> {
        let ns_index = self.require_ns(namespace)? as usize;
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock();
        while table.namespaces[ns_index].phase != TruncatePhase::Idle {
            if self.idle.wait_until(&mut table, deadline).timed_out() {
                return Ok(table.namespaces[ns_index].phase == TruncatePhase::Idle);
            }
        }
        Ok(true)
    }

    /// Stop every pass at its next partition boundary.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Join every reaper thread. Call after [`Self::shutdown`].
    pub fn drain(&self) {
        loop {
            let handles = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!("truncate reaper panicked");
                }
            }
        }
    }

    /// Worker bookkeeping at the end of its share of a pass.
    pub(super) fn worker_finished(self: &Arc<Self>, ns_index: u32, reaped: u64) {
        self.metrics.record_reaped(reaped);
        let mut table = self.table.lock();
        let ns = &mut table.namespaces[ns_index as usize];
        ns.n_records += reaped;
        ns.n_records_this_run += reaped;
        ns.n_threads_running = ns.n_threads_running.saturating_sub(1);
        if ns.n_threads_running == 0 {
            let restart = ns.phase == TruncatePhase::Restart && !ns.abort && !self.is_shutdown();
            if restart {
                tracing::info!(
                    namespace = %self.names[ns_index as usize],
                    reaped = ns.n_records_this_run,
                    "truncate pass restarting"
                );
                reaper::start_pass(self, ns_index, ns);
            } else {
                tracing::info!(
                    namespace = %self.names[ns_index as usize],
                    reaped = ns.n_records_this_run,
                    aborted = ns.abort,
                    "truncate pass finished"
                );
                ns.phase = TruncatePhase::Idle;
                ns.abort = false;
                self.idle.notify_all();
            }
        }
        let running = table.namespaces.iter().map(|ns| ns.n_threads_running).sum();
        self.metrics.set_reapers_running(running);
    }

    /// Whether workers of `ns_index` should stop.
    pub(super) fn pass_interrupted(&self, ns_index: u32) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let table = self.table.lock();
        let ns = &table.namespaces[ns_index as usize];
        ns.abort || ns.phase == TruncatePhase::Restart
    }

    pub(super) fn namespace_name(&self, ns_index: u32) -> &str {
        &self.names[ns_index as usize]
    }
}
