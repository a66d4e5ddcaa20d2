use crate::config::AlertsConfig;
use crate::snapshot::MetricsSnapshot;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricClass {
    Cpu,
    Ram,
    GpuMemory,
    Disk,
}

impl MetricClass {
    /// Evaluation order; also the order events appear in an alert message.
    pub const ALL: [MetricClass; 4] = [Self::Cpu, Self::Ram, Self::Disk, Self::GpuMemory];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Ram => "ram",
            Self::GpuMemory => "gpu",
            Self::Disk => "disk",
        }
    }

    fn slot(self) -> usize {
        match self {
            Self::Cpu => 0,
            Self::Ram => 1,
            Self::GpuMemory => 2,
            Self::Disk => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertThresholds {
    pub cpu: f64,
    pub ram: f64,
    pub gpu_memory: f64,
    pub disk: f64,
    pub cooldown: Duration,
    pub check_interval: Duration,
}

impl AlertThresholds {
    pub fn for_class(&self, class: MetricClass) -> f64 {
        match class {
            MetricClass::Cpu => self.cpu,
            MetricClass::Ram => self.ram,
            MetricClass::GpuMemory => self.gpu_memory,
            MetricClass::Disk => self.disk,
        }
    }
}

impl From<&AlertsConfig> for AlertThresholds {
    fn from(cfg: &AlertsConfig) -> Self {
        Self {
            cpu: cfg.cpu_threshold_percent,
            ram: cfg.ram_threshold_percent,
            gpu_memory: cfg.gpu_threshold_percent,
            disk: cfg.disk_threshold_percent,
            cooldown: Duration::from_secs(cfg.cooldown_secs),
            check_interval: Duration::from_secs(cfg.check_interval_secs),
        }
    }
}

/// Last emission instant per metric class. Lives as long as the evaluator
/// that owns it; there is no reset other than dropping it.
#[derive(Debug, Clone, Default)]
pub struct AlertState {
    last_fired_at: [Option<Instant>; 4],
}

impl AlertState {
    pub fn last_fired_at(&self, class: MetricClass) -> Option<Instant> {
        self.last_fired_at[class.slot()]
    }

    fn mark_fired(&mut self, class: MetricClass, now: Instant) {
        self.last_fired_at[class.slot()] = Some(now);
    }

    fn cooled_down(&self, class: MetricClass, now: Instant, cooldown: Duration) -> bool {
        match self.last_fired_at(class) {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= cooldown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertContext {
    pub used_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub gpu_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    pub class: MetricClass,
    pub observed: f64,
    pub threshold: f64,
    pub context: AlertContext,
}

/// Owns the cooldown state for one monitored host.
#[derive(Debug, Default)]
pub struct AlertEvaluator {
    state: AlertState,
}

impl AlertEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &AlertState {
        &self.state
    }

    pub fn evaluate(
        &mut self,
        snapshot: &MetricsSnapshot,
        thresholds: &AlertThresholds,
        now: Instant,
    ) -> Vec<AlertEvent> {
        evaluate(snapshot, thresholds, &mut self.state, now)
    }
}

/// Level-triggered check with a per-class cooldown. A class fires when its
/// observed value is at or above the threshold and the class has not fired
/// within `cooldown`. Dropping below the threshold does not clear the timer.
pub fn evaluate(
    snapshot: &MetricsSnapshot,
    thresholds: &AlertThresholds,
    state: &mut AlertState,
    now: Instant,
) -> Vec<AlertEvent> {
    let mut events = Vec::new();

    for class in MetricClass::ALL {
        let Some((observed, context)) = observe(snapshot, class) else {
            continue;
        };
        let threshold = thresholds.for_class(class);
        if observed.is_nan() || observed < threshold {
            continue;
        }
        if !state.cooled_down(class, now, thresholds.cooldown) {
            tracing::debug!(class = class.as_str(), observed, "alert suppressed by cooldown");
            continue;
        }
        state.mark_fired(class, now);
        events.push(AlertEvent {
            class,
            observed,
            threshold,
            context,
        });
    }

    events
}

fn observe(snapshot: &MetricsSnapshot, class: MetricClass) -> Option<(f64, AlertContext)> {
    match class {
        MetricClass::Cpu => Some((snapshot.cpu.usage_percent, AlertContext::default())),
        MetricClass::Ram => {
            let mem = &snapshot.memory;
            mem.usage_percent.map(|pct| {
                (
                    pct,
                    AlertContext {
                        used_bytes: Some(mem.used_bytes),
                        total_bytes: Some(mem.total_bytes),
                        gpu_name: None,
                    },
                )
            })
        }
        MetricClass::Disk => {
            let disk = &snapshot.disk;
            disk.usage_percent.map(|pct| {
                (
                    pct,
                    AlertContext {
                        used_bytes: Some(disk.used_bytes),
                        total_bytes: Some(disk.total_bytes),
                        gpu_name: None,
                    },
                )
            })
        }
        MetricClass::GpuMemory => {
            let gpu = snapshot.gpu.as_ref()?;
            gpu.memory.usage_percent.map(|pct| {
                (
                    pct,
                    AlertContext {
                        used_bytes: Some(gpu.memory.used_bytes),
                        total_bytes: Some(gpu.memory.total_bytes),
                        gpu_name: Some(gpu.name.clone()),
                    },
                )
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::fixtures::snapshot;

    fn thresholds() -> AlertThresholds {
        AlertThresholds {
            cpu: 80.0,
            ram: 85.0,
            gpu_memory: 90.0,
            disk: 90.0,
            cooldown: Duration::from_secs(300),
            check_interval: Duration::from_secs(60),
        }
    }

    fn classes(events: &[AlertEvent]) -> Vec<MetricClass> {
        events.iter().map(|e| e.class).collect()
    }

    #[test]
    fn cpu_breach_respects_cooldown_window() {
        let mut evaluator = AlertEvaluator::new();
        let t0 = Instant::now();
        let snap = snapshot(81.0, 10.0, 10.0, None);
        let th = thresholds();

        let first = evaluator.evaluate(&snap, &th, t0);
        assert_eq!(classes(&first), vec![MetricClass::Cpu]);
        assert_eq!(first[0].observed, 81.0);
        assert_eq!(first[0].threshold, 80.0);

        let during = evaluator.evaluate(&snap, &th, t0 + Duration::from_secs(100));
        assert!(during.is_empty());
        assert_eq!(evaluator.state().last_fired_at(MetricClass::Cpu), Some(t0));

        let after = evaluator.evaluate(&snap, &th, t0 + Duration::from_secs(301));
        assert_eq!(classes(&after), vec![MetricClass::Cpu]);
    }

    #[test]
    fn sustained_breach_fires_once_per_cooldown() {
        let mut evaluator = AlertEvaluator::new();
        let t0 = Instant::now();
        let th = thresholds();
        let snap = snapshot(95.0, 10.0, 10.0, None);

        let fired: usize = (0..=1200_u64)
            .step_by(60)
            .map(|s| evaluator.evaluate(&snap, &th, t0 + Duration::from_secs(s)).len())
            .sum();
        // fires at 0, 300, 600, 900, 1200
        assert_eq!(fired, 5);
    }

    #[test]
    fn exact_threshold_counts_as_breach() {
        let mut evaluator = AlertEvaluator::new();
        let events = evaluator.evaluate(
            &snapshot(10.0, 85.0, 10.0, None),
            &thresholds(),
            Instant::now(),
        );
        assert_eq!(classes(&events), vec![MetricClass::Ram]);
        assert_eq!(events[0].context.total_bytes, Some(16 * 1024 * 1024 * 1024));
    }

    #[test]
    fn dropping_below_threshold_does_not_reset_cooldown() {
        let mut evaluator = AlertEvaluator::new();
        let t0 = Instant::now();
        let th = thresholds();

        assert_eq!(evaluator.evaluate(&snapshot(90.0, 0.0, 0.0, None), &th, t0).len(), 1);
        assert!(evaluator
            .evaluate(&snapshot(20.0, 0.0, 0.0, None), &th, t0 + Duration::from_secs(60))
            .is_empty());
        assert!(evaluator
            .evaluate(&snapshot(90.0, 0.0, 0.0, None), &th, t0 + Duration::from_secs(120))
            .is_empty());
        assert_eq!(
            evaluator
                .evaluate(&snapshot(90.0, 0.0, 0.0, None), &th, t0 + Duration::from_secs(300))
                .len(),
            1
        );
    }

    #[test]
    fn missing_gpu_skips_the_class() {
        let mut evaluator = AlertEvaluator::new();
        let events = evaluator.evaluate(
            &snapshot(99.0, 99.0, 99.0, None),
            &thresholds(),
            Instant::now(),
        );
        assert_eq!(
            classes(&events),
            vec![MetricClass::Cpu, MetricClass::Ram, MetricClass::Disk]
        );
        assert!(evaluator.state().last_fired_at(MetricClass::GpuMemory).is_none());
    }

    #[test]
    fn gpu_event_carries_device_name() {
        let mut evaluator = AlertEvaluator::new();
        let events = evaluator.evaluate(
            &snapshot(0.0, 0.0, 0.0, Some(95.0)),
            &thresholds(),
            Instant::now(),
        );
        assert_eq!(classes(&events), vec![MetricClass::GpuMemory]);
        assert_eq!(events[0].context.gpu_name.as_deref(), Some("Test GPU"));
    }

    #[test]
    fn classes_cool_down_independently() {
        let mut evaluator = AlertEvaluator::new();
        let t0 = Instant::now();
        let th = thresholds();

        evaluator.evaluate(&snapshot(90.0, 0.0, 0.0, None), &th, t0);
        let later = evaluator.evaluate(
            &snapshot(90.0, 90.0, 0.0, None),
            &th,
            t0 + Duration::from_secs(10),
        );
        assert_eq!(classes(&later), vec![MetricClass::Ram]);
    }

    #[test]
    fn unmeasurable_values_are_skipped() {
        let mut snap = snapshot(0.0, 0.0, 0.0, None);
        snap.memory.usage_percent = None;
        snap.disk.usage_percent = None;
        let mut state = AlertState::default();
        let th = AlertThresholds {
            ram: 0.0,
            disk: 0.0,
            ..thresholds()
        };
        assert!(evaluate(&snap, &th, &mut state, Instant::now()).is_empty());
    }

    #[test]
    fn separate_evaluators_do_not_share_state() {
        let mut a = AlertEvaluator::new();
        let mut b = AlertEvaluator::new();
        let now = Instant::now();
        let snap = snapshot(90.0, 0.0, 0.0, None);
        assert_eq!(a.evaluate(&snap, &thresholds(), now).len(), 1);
        assert_eq!(b.evaluate(&snap, &thresholds(), now).len(), 1);
    }
}
