use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Horizon-scheduler tuning. All durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How far ahead of the wall clock runs are materialized.
    #[serde(default = "d_lookahead")]
    pub lookahead_sec: u64,
    /// Pause between scheduling passes.
    #[serde(default = "d_tick")]
    pub tick_sec: u64,
    /// Upper bound on how far the horizon may advance in one pass.
    /// Caps catch-up work after a long downtime.
    #[serde(default = "d_max_step")]
    pub max_step_sec: u64,
    /// Runs scheduled further than this past `now` are materialized as
    /// expected (speculative, not persisted, regenerated on restart).
    #[serde(default = "d_expected_cutoff")]
    pub expected_cutoff_sec: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookahead_sec: d_lookahead(),
            tick_sec: d_tick(),
            max_step_sec: d_max_step(),
            expected_cutoff_sec: d_expected_cutoff(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_lookahead() -> u64 {
    86_400 // 24 h
}
fn d_tick() -> u64 {
    60
}
fn d_max_step() -> u64 {
    86_400
}
fn d_expected_cutoff() -> u64 {
    300
}
