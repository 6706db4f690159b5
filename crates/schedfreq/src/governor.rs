//! Governor front object: domain lifecycle, hook registration and the
//! utilization entry points.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use error_stack::Result;
use serde::{Deserialize, Serialize};

use crate::capacity::CapacityModel;
use crate::domain::{CommitPhase, DomainState, UpdateHook, UtilClass};
use crate::hook::HookRegistry;
use crate::policy::{DomainConfig, FastSwitch, FreqActuator, Limits};
use crate::tunables::{TunableScope, TunableSet};
use crate::worker;
use crate::GovernorError;

/// Governor-wide construction options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorOptions {
    /// Number of CPUs the governor can ever see; sizes the hook table.
    pub nr_cpus: usize,
    #[serde(default)]
    pub tunable_scope: TunableScope,
}

/// Point-in-time view of one domain, for the administrative side and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainStatus {
    pub current_khz: u32,
    pub requested_khz: u32,
    pub limits: Limits,
    /// Outcome of the most recent commit attempt (see [`CommitPhase`]);
    /// `Throttled` is reported until a later decision replaces it.
    pub phase: CommitPhase,
    /// Timestamp of the last frequency evaluation that ran to completion.
    pub last_eval_ns: u64,
}

struct DomainHandle {
    state: Arc<DomainState>,
    worker: Option<JoinHandle<()>>,
}

/// The governor: owns the per-CPU hook table, all active domains and the
/// capacity model. All methods take `&self`; internal state is explicit and
/// lock-protected rather than living in module globals.
pub struct Governor {
    registry: HookRegistry<UpdateHook>,
    domains: Mutex<HashMap<u32, DomainHandle>>,
    /// Lazily created by the first domain start in `Global` scope.
    global_tunables: Mutex<Option<Arc<TunableSet>>>,
    scope: TunableScope,
    capacity: CapacityModel,
}

fn lock_map<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Governor {
    pub fn new(opts: GovernorOptions) -> Result<Self, GovernorError> {
        let nr_cpus = opts.nr_cpus;
        Self::with_capacity_model(opts, CapacityModel::uniform(nr_cpus))
    }

    /// Build with a heterogeneous capacity model; the model's per-CPU scale
    /// is the default capacity ceiling for [`Governor::tick`] samples.
    pub fn with_capacity_model(
        opts: GovernorOptions,
        capacity: CapacityModel,
    ) -> Result<Self, GovernorError> {
        if opts.nr_cpus == 0 {
            return Err(error_stack::report!(GovernorError::invalid_config(
                "nr_cpus must be non-zero"
            )));
        }
        if capacity.nr_cpus() != opts.nr_cpus {
            return Err(error_stack::report!(GovernorError::invalid_config(
                format!(
                    "capacity model covers {} CPUs, governor has {}",
                    capacity.nr_cpus(),
                    opts.nr_cpus
                )
            )));
        }
        Ok(Self {
            registry: HookRegistry::new(opts.nr_cpus),
            domains: Mutex::new(HashMap::new()),
            global_tunables: Mutex::new(None),
            scope: opts.tunable_scope,
            capacity,
        })
    }

    pub fn capacity_model(&self) -> &CapacityModel {
        &self.capacity
    }

    /// Activate a frequency domain. All-or-nothing: on any failure every
    /// hook installed so far is rolled back and the worker (if spawned) is
    /// joined, leaving no partial domain state behind.
    pub fn start(
        &self,
        cfg: DomainConfig,
        actuator: Arc<dyn FreqActuator>,
    ) -> Result<(), GovernorError> {
        cfg.validate()?;
        for &cpu in &cfg.cpus {
            if cpu >= self.registry.nr_cpus() {
                return Err(error_stack::report!(GovernorError::CpuOutOfRange { cpu }));
            }
        }

        let mut domains = lock_map(&self.domains);
        if domains.contains_key(&cfg.id) {
            return Err(error_stack::report!(GovernorError::DomainActive {
                id: cfg.id
            }));
        }

        let tunables = match self.scope {
            TunableScope::PerDomain => Arc::new(TunableSet::for_latency(cfg.transition_latency_ns)),
            TunableScope::Global => {
                let mut global = lock_map(&self.global_tunables);
                Arc::clone(global.get_or_insert_with(|| {
                    Arc::new(TunableSet::for_latency(cfg.transition_latency_ns))
                }))
            }
        };

        let id = cfg.id;
        let fast_switch = cfg.fast_switch;
        let cpus = cfg.cpus.clone();
        let state = Arc::new(DomainState::new(cfg, tunables, actuator));

        let worker = if fast_switch {
            None
        } else {
            let d = Arc::clone(&state);
            let handle = thread::Builder::new()
                .name(format!("schedfreq-d{id}"))
                .spawn(move || worker::run(d))
                .map_err(|e| {
                    error_stack::report!(GovernorError::WorkerSpawn {
                        reason: e.to_string()
                    })
                })?;
            Some(handle)
        };

        state.enabled.store(true, Ordering::Release);

        let mut installed = Vec::with_capacity(cpus.len());
        for (idx, &cpu) in cpus.iter().enumerate() {
            let hook = Box::new(UpdateHook {
                domain: Arc::clone(&state),
                idx,
            });
            if self.registry.register(cpu, hook).is_err() {
                for &done in &installed {
                    drop(self.registry.clear(done));
                }
                state.enabled.store(false, Ordering::Release);
                if let Some(sp) = &state.slow {
                    sp.shutdown();
                }
                if let Some(w) = worker {
                    drop(w.join());
                }
                return Err(error_stack::report!(GovernorError::CpuClaimed { cpu }));
            }
            installed.push(cpu);
        }

        tracing::info!(domain = id, cpus = ?cpus, fast_switch, "domain governor started");
        domains.insert(id, DomainHandle { state, worker });
        Ok(())
    }

    /// Deactivate a domain: unpublish all its hooks (with quiescence waits),
    /// then stop and join the worker so no wakeup can outlive teardown.
    pub fn stop(&self, id: u32) -> Result<(), GovernorError> {
        let handle = lock_map(&self.domains)
            .remove(&id)
            .ok_or_else(|| error_stack::report!(GovernorError::UnknownDomain { id }))?;

        handle.state.enabled.store(false, Ordering::Release);
        for &cpu in &handle.state.cfg.cpus {
            drop(self.registry.clear(cpu));
        }
        if let Some(sp) = &handle.state.slow {
            sp.shutdown();
        }
        if let Some(w) = handle.worker {
            if w.join().is_err() {
                tracing::warn!(domain = id, "slow-path worker panicked before join");
            }
        }
        tracing::info!(domain = id, "domain governor stopped");
        Ok(())
    }

    /// Externally triggered bounds change. The current frequency is clamped
    /// into the new bounds immediately (bypassing the throttle out-of-band
    /// if it now lies outside), and the next evaluation runs unthrottled.
    pub fn limits_changed(
        &self,
        id: u32,
        min_khz: u32,
        max_khz: u32,
        now_ns: u64,
    ) -> Result<(), GovernorError> {
        if min_khz == 0 || max_khz == 0 || min_khz > max_khz {
            return Err(error_stack::report!(GovernorError::invalid_config(
                format!("invalid limits [{min_khz}, {max_khz}] kHz")
            )));
        }
        let state = self.domain_state(id)?;

        {
            let mut ds = state.lock_decision();
            ds.limits = Limits { min_khz, max_khz };
            if ds.current_khz != 0 && !ds.limits.contains(ds.current_khz) {
                let clamped = ds.limits.clamp(ds.current_khz);
                if state.cfg.fast_switch {
                    match state.actuator.fast_switch(id, clamped) {
                        FastSwitch::Applied(applied) => {
                            ds.current_khz = applied;
                            ds.requested_khz = applied;
                            ds.gate
                                .mark_committed(now_ns, state.tunables.rate_limit_ns());
                            ds.phase = CommitPhase::Throttled;
                        }
                        FastSwitch::Rejected => {
                            tracing::debug!(
                                domain = id,
                                freq_khz = clamped,
                                "clamp to new limits rejected by actuator"
                            );
                        }
                    }
                } else {
                    ds.requested_khz = clamped;
                    ds.phase = CommitPhase::Pending;
                    if let Some(slow) = &state.slow {
                        slow.submit(crate::worker::SlowRequest {
                            target_khz: clamped,
                            time_ns: now_ns,
                        });
                    }
                }
            }
        }

        state.force_update.store(true, Ordering::Release);
        tracing::info!(domain = id, min_khz, max_khz, "domain limits changed");
        Ok(())
    }

    /// Scheduler-facing utilization report with an explicit capacity
    /// ceiling. Non-blocking; a CPU with no registered hook is a no-op.
    pub fn update_util(&self, cpu: usize, class: UtilClass, now_ns: u64, util: u64, max: u64) {
        self.registry
            .dispatch(cpu, |h| h.update(class, now_ns, util, max));
    }

    /// Utilization report using the capacity model's per-CPU scale as the
    /// ceiling.
    pub fn tick(&self, cpu: usize, class: UtilClass, now_ns: u64, util: u64) {
        let max = self.capacity.scale_of(cpu);
        self.registry
            .dispatch(cpu, |h| h.update(class, now_ns, util, max));
    }

    /// Force a performance-state evaluation with no utilization data,
    /// treated as a saturated report (used by classes that don't produce
    /// load-tracking samples).
    pub fn trigger_update(&self, cpu: usize, now_ns: u64) {
        self.registry.dispatch(cpu, |h| h.trigger(now_ns));
    }

    /// Write a tunable through the administrative boundary. With global
    /// tunable scope every domain observes the change.
    pub fn store_tunable(&self, id: u32, name: &str, value: &str) -> Result<(), GovernorError> {
        self.domain_state(id)?.tunables.store(name, value)
    }

    pub fn show_tunable(&self, id: u32, name: &str) -> Result<String, GovernorError> {
        self.domain_state(id)?.tunables.show(name)
    }

    pub fn status(&self, id: u32) -> Result<DomainStatus, GovernorError> {
        let state = self.domain_state(id)?;
        let ds = state.lock_decision();
        Ok(DomainStatus {
            current_khz: ds.current_khz,
            requested_khz: ds.requested_khz,
            limits: ds.limits,
            phase: ds.phase,
            last_eval_ns: ds.last_eval_ns,
        })
    }

    fn domain_state(&self, id: u32) -> Result<Arc<DomainState>, GovernorError> {
        lock_map(&self.domains)
            .get(&id)
            .map(|h| Arc::clone(&h.state))
            .ok_or_else(|| error_stack::report!(GovernorError::UnknownDomain { id }))
    }
}

impl Drop for Governor {
    fn drop(&mut self) {
        let ids: Vec<u32> = lock_map(&self.domains).keys().copied().collect();
        for id in ids {
            drop(self.stop(id));
        }
    }
}
