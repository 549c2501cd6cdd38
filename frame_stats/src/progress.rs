// THEORY:
// Progress is reported through a `ProgressSink` owned by the aggregation task
// for the length of a run. The task emits exactly one `ProgressEvent` per
// finished unit, whatever the outcome, so a sink always reaches `total`.
// `BarProgress` drives an indicatif bar for the CLI; `NullProgress` is for
// library callers that do not want output.

use indicatif::{ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str = "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} units {msg}";

/// How a unit finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Completed,
    Failed,
    Cancelled,
}

/// One unit finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub unit: String,
    pub status: UnitStatus,
    /// Units finished so far, including this one.
    pub finished: usize,
    pub total: usize,
}

/// Receives progress from the aggregation task.
pub trait ProgressSink: Send {
    /// Called once before any unit finishes, with the number of dispatched units.
    fn on_start(&mut self, _total: usize) {}

    fn on_unit(&mut self, event: &ProgressEvent);

    fn on_finish(&mut self) {}
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_unit(&mut self, _event: &ProgressEvent) {}
}

/// Terminal progress bar.
#[derive(Default)]
pub struct BarProgress {
    bar: Option<ProgressBar>,
    failed: usize,
}

impl BarProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for BarProgress {
    fn on_start(&mut self, total: usize) {
        let bar = ProgressBar::new(total as u64);
        match ProgressStyle::default_bar().template(BAR_TEMPLATE) {
            Ok(style) => bar.set_style(style.progress_chars("=>-")),
            Err(e) => tracing::debug!("Falling back to default progress style: {}", e),
        }
        self.bar = Some(bar);
    }

    fn on_unit(&mut self, event: &ProgressEvent) {
        if event.status == UnitStatus::Failed {
            self.failed += 1;
        }
        if let Some(bar) = &self.bar {
            if self.failed > 0 {
                bar.set_message(format!("({} failed)", self.failed));
            }
            bar.inc(1);
        }
    }

    fn on_finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_counts_failures() {
        let mut progress = BarProgress::new();
        progress.on_start(2);
        for (unit, status) in [("1", UnitStatus::Failed), ("2", UnitStatus::Completed)] {
            progress.on_unit(&ProgressEvent {
                unit: unit.to_string(),
                status,
                finished: 1,
                total: 2,
            });
        }
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.bar.as_ref().map(|b| b.position()), Some(2));
        progress.on_finish();
        assert!(progress.bar.is_none());
    }
}
