//! Per-stage latency accounting.
//!
//! Advisory only: nothing in the decode path reads these numbers back. Each
//! orchestrator owns its own [`Instrumentation`], so repeated or concurrent
//! runs never mix measurements.

use std::sync::OnceLock;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, trace};

use crate::accelerator::ModelKind;

static LOG_PREDICT_TIME: OnceLock<bool> = OnceLock::new();

/// `MURMUR_LOG_PREDICT_TIME=1` promotes per-call latencies from `trace` to `info`.
pub fn log_predict_time() -> bool {
    *LOG_PREDICT_TIME.get_or_init(|| {
        std::env::var("MURMUR_LOG_PREDICT_TIME")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTimings {
    pub loads: u32,
    pub load_time: Duration,
    pub predicts: u64,
    pub predict_time: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct Instrumentation {
    stages: [StageTimings; 4],
    rearranges: u64,
    rearrange_time: Duration,
}

impl Instrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_load(&mut self, kind: ModelKind, elapsed: Duration) {
        let stage = &mut self.stages[kind.index()];
        stage.loads += 1;
        stage.load_time += elapsed;
    }

    pub fn record_predict(&mut self, kind: ModelKind, elapsed: Duration) {
        let stage = &mut self.stages[kind.index()];
        stage.predicts += 1;
        stage.predict_time += elapsed;
        let ms = elapsed.as_secs_f64() * 1_000.0;
        if log_predict_time() {
            info!(model = %kind, call = stage.predicts, ms, "predict");
        } else {
            trace!(model = %kind, call = stage.predicts, ms, "predict");
        }
    }

    pub fn record_rearrange(&mut self, elapsed: Duration) {
        self.rearranges += 1;
        self.rearrange_time += elapsed;
    }

    pub fn stage(&self, kind: ModelKind) -> StageTimings {
        self.stages[kind.index()]
    }

    pub fn total_load_time(&self) -> Duration {
        self.stages.iter().map(|s| s.load_time).sum()
    }

    pub fn total_predict_time(&self) -> Duration {
        self.stages.iter().map(|s| s.predict_time).sum()
    }

    pub fn rearranges(&self) -> u64 {
        self.rearranges
    }

    pub fn report(&self) -> TimingReport {
        TimingReport {
            stages: ModelKind::ALL
                .iter()
                .map(|&kind| {
                    let s = self.stage(kind);
                    StageReport {
                        model: kind,
                        loads: s.loads,
                        load_ms: ms(s.load_time),
                        predicts: s.predicts,
                        predict_ms: ms(s.predict_time),
                        mean_predict_ms: if s.predicts == 0 {
                            0.0
                        } else {
                            ms(s.predict_time) / s.predicts as f64
                        },
                    }
                })
                .collect(),
            total_load_ms: ms(self.total_load_time()),
            total_predict_ms: ms(self.total_predict_time()),
            rearranges: self.rearranges,
            rearrange_ms: ms(self.rearrange_time),
        }
    }

    pub fn log_summary(&self) {
        info!("=== Decode Timing ===");
        for stage in self.report().stages {
            info!(
                "  {:<16} load {:>8.2} ms ({} loads)  predict {:>9.2} ms ({} calls, {:.3} ms avg)",
                stage.model.to_string(),
                stage.load_ms,
                stage.loads,
                stage.predict_ms,
                stage.predicts,
                stage.mean_predict_ms,
            );
        }
        info!(
            "  rearrange        {:>8.2} ms ({} calls)",
            ms(self.rearrange_time),
            self.rearranges
        );
        info!(
            "  total            load {:.2} ms  predict {:.2} ms",
            ms(self.total_load_time()),
            ms(self.total_predict_time())
        );
    }

    /// Return the accumulated timings and start over from zero.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub model: ModelKind,
    pub loads: u32,
    pub load_ms: f64,
    pub predicts: u64,
    pub predict_ms: f64,
    pub mean_predict_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingReport {
    pub stages: Vec<StageReport>,
    pub total_load_ms: f64,
    pub total_predict_ms: f64,
    pub rearranges: u64,
    pub rearrange_ms: f64,
}
