//! Heterogeneous-core capacity scaling.
//!
//! On asymmetric systems the cores of a domain do not deliver the same
//! compute capacity per unit of utilization. This module turns a static
//! table of relative core efficiencies plus each CPU's nominal clock rate
//! into a per-CPU capacity factor on [`CAPACITY_SCALE`], which the
//! utilization entry points use as the default capacity ceiling.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::policy::CAPACITY_SCALE;

/// Relative efficiency of one core model. The final per-CPU factor is the
/// product of efficiency and nominal clock, normalized to the fastest CPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EfficiencyClass {
    /// Core model identifier matched against [`CpuDesc::compatible`].
    pub compatible: String,
    pub efficiency: u64,
}

/// Per-CPU hardware description supplied by the platform layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuDesc {
    pub compatible: String,
    /// Nominal clock rate in Hz.
    pub clock_hz: u64,
}

/// Per-CPU capacity factors, single-writer updatable at runtime.
#[derive(Debug)]
pub struct CapacityModel {
    scale: Vec<AtomicU64>,
}

impl CapacityModel {
    /// All CPUs at full scale; the model for homogeneous systems.
    pub fn uniform(nr_cpus: usize) -> Self {
        Self {
            scale: (0..nr_cpus).map(|_| AtomicU64::new(CAPACITY_SCALE)).collect(),
        }
    }

    /// Derive per-CPU factors from the efficiency table.
    ///
    /// Each CPU's raw performance is `(clock_hz >> 20) * efficiency`,
    /// normalized so the fastest CPU lands exactly on [`CAPACITY_SCALE`].
    /// If any CPU lacks a matching efficiency class the data set is
    /// incomplete and scaling is disabled: every CPU reports full scale.
    pub fn from_efficiency_table(classes: &[EfficiencyClass], cpus: &[CpuDesc]) -> Self {
        let mut perf = Vec::with_capacity(cpus.len());
        let mut max_perf = 0u64;
        let mut complete = true;

        for (cpu, desc) in cpus.iter().enumerate() {
            let eff = classes
                .iter()
                .find(|c| c.compatible == desc.compatible)
                .map(|c| c.efficiency);
            match eff {
                Some(e) if desc.clock_hz >> 20 != 0 => {
                    let p = (desc.clock_hz >> 20) * e;
                    max_perf = max_perf.max(p);
                    perf.push(p);
                }
                _ => {
                    tracing::warn!(
                        cpu,
                        compatible = %desc.compatible,
                        "missing efficiency or clock data, disabling capacity scaling"
                    );
                    complete = false;
                    perf.push(0);
                }
            }
        }

        if !complete || max_perf == 0 {
            return Self::uniform(cpus.len());
        }

        let model = Self {
            scale: perf
                .iter()
                .map(|p| AtomicU64::new((p * CAPACITY_SCALE / max_perf).max(1)))
                .collect(),
        };
        for (cpu, slot) in model.scale.iter().enumerate() {
            tracing::info!(cpu, capacity = slot.load(Ordering::Relaxed), "cpu capacity set");
        }
        model
    }

    pub fn nr_cpus(&self) -> usize {
        self.scale.len()
    }

    /// Capacity factor of `cpu`; out-of-range CPUs report full scale.
    pub fn scale_of(&self, cpu: usize) -> u64 {
        self.scale
            .get(cpu)
            .map(|s| s.load(Ordering::Relaxed))
            .unwrap_or(CAPACITY_SCALE)
    }

    /// Runtime update of one CPU's factor, clamped to `1..=CAPACITY_SCALE`.
    /// Out-of-range CPUs are ignored.
    pub fn set_scale(&self, cpu: usize, capacity: u64) {
        if let Some(slot) = self.scale.get(cpu) {
            let capped = capacity.clamp(1, CAPACITY_SCALE);
            slot.store(capped, Ordering::Relaxed);
            tracing::info!(cpu, capacity = capped, "cpu capacity updated");
        }
    }
}
