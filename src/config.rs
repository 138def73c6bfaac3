//! Runtime-configurable tuning parameters for fusor.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `FUSOR_`) or by constructing a custom `FusorConfig`.

use std::time::Duration;

/// Tuning parameters read by the negotiation engine and execution layer.
///
/// The core only reads these; ownership of the knobs (CLI parsing,
/// autotuning) lives outside the crate.
#[derive(Debug, Clone)]
pub struct FusorConfig {
    /// Upper bound in bytes for one fused group of tensors. Ready tensors
    /// are batched into a single collective call up to this size.
    pub fusion_threshold_bytes: usize,

    /// Minimum duration of one background negotiation/execution cycle.
    /// Bounds negotiation overhead under low load.
    pub cycle_time: Duration,

    /// Capacity of the response cache, in cached response lists.
    /// Zero disables the cache.
    pub cache_capacity: usize,

    /// Use the hierarchical (intra-node then cross-node) allreduce path for
    /// accelerator tensors. Ignored on single-node clusters.
    pub hierarchical_allreduce: bool,

    /// Use the hierarchical allgather path. Ignored on single-node clusters.
    pub hierarchical_allgather: bool,

    /// Report per-cycle tensor names and byte volume to the tuning sink.
    pub autotune: bool,

    /// How long a tensor may sit partially-requested before the coordinator
    /// reports it through the stall warning.
    pub stall_warning: Duration,

    /// Emit cycle-start markers to the timeline sink.
    pub mark_cycles_in_timeline: bool,
}

impl Default for FusorConfig {
    fn default() -> Self {
        Self {
            fusion_threshold_bytes: 64 * 1024 * 1024, // 64 MiB
            cycle_time: Duration::from_millis(5),
            cache_capacity: 1024,
            hierarchical_allreduce: false,
            hierarchical_allgather: false,
            autotune: false,
            stall_warning: Duration::from_secs(60),
            mark_cycles_in_timeline: false,
        }
    }
}

impl FusorConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `FUSOR_FUSION_THRESHOLD`
    /// - `FUSOR_CYCLE_TIME_MS`
    /// - `FUSOR_CACHE_CAPACITY`
    /// - `FUSOR_HIERARCHICAL_ALLREDUCE`
    /// - `FUSOR_HIERARCHICAL_ALLGATHER`
    /// - `FUSOR_AUTOTUNE`
    /// - `FUSOR_STALL_WARNING_SECS`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("FUSOR_FUSION_THRESHOLD") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.fusion_threshold_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("FUSOR_CYCLE_TIME_MS") {
            if let Ok(ms) = v.parse::<f64>() {
                cfg.cycle_time = Duration::from_secs_f64(ms / 1000.0);
            }
        }
        if let Ok(v) = std::env::var("FUSOR_CACHE_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.cache_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("FUSOR_HIERARCHICAL_ALLREDUCE") {
            cfg.hierarchical_allreduce = v != "0";
        }
        if let Ok(v) = std::env::var("FUSOR_HIERARCHICAL_ALLGATHER") {
            cfg.hierarchical_allgather = v != "0";
        }
        if let Ok(v) = std::env::var("FUSOR_AUTOTUNE") {
            cfg.autotune = v != "0";
        }
        if let Ok(v) = std::env::var("FUSOR_STALL_WARNING_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.stall_warning = Duration::from_secs(s);
            }
        }

        cfg
    }
}
