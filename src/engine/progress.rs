// src/engine/progress.rs

//! Pure run bookkeeping.
//!
//! [`RunProgress`] decides which step the coordinator launches next and
//! [`conclude`] turns the final tallies into a run status. Neither touches
//! Tokio, the store, or processes, so both are unit tested directly.

use crate::types::{RunStatus, StepStatus};

/// What the coordinator should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Launch the step at this index of the ordered step list.
    Launch(usize),
    /// A stop was observed; launch nothing further.
    Abort,
    /// Every step has been attempted.
    Done,
}

#[derive(Debug, Clone)]
pub struct RunProgress {
    total: usize,
    next_index: usize,
    aborted: bool,
    outcomes: Vec<(u32, StepStatus)>,
}

impl RunProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            next_index: 0,
            aborted: false,
            outcomes: Vec::with_capacity(total),
        }
    }

    /// Advance, given whether a stop has been requested for the run.
    ///
    /// Once aborted or done, every later call returns the same answer.
    pub fn next(&mut self, stop_requested: bool) -> NextStep {
        if self.aborted {
            return NextStep::Abort;
        }
        if self.next_index >= self.total {
            return NextStep::Done;
        }
        if stop_requested {
            self.aborted = true;
            return NextStep::Abort;
        }
        let index = self.next_index;
        self.next_index += 1;
        NextStep::Launch(index)
    }

    pub fn record(&mut self, order: u32, status: StepStatus) {
        self.outcomes.push((order, status));
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Steps launched so far.
    pub fn attempted(&self) -> usize {
        self.next_index
    }

    /// Failing outcomes recorded in memory.
    pub fn failing(&self) -> usize {
        self.outcomes.iter().filter(|(_, s)| s.is_failure()).count()
    }
}

/// Final decision for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: RunStatus,
    pub error_msg: Option<String>,
    /// Whether non-terminal step records should be closed as stopped.
    pub close_leftovers: bool,
}

pub fn part_failed_message(failing: usize) -> String {
    format!("{failing} 步骤执行异常（超时/失败/错误）")
}

/// Turn the run's tallies into its terminal status.
///
/// A bookkeeping error wins over everything except an earlier stop, which
/// is already persisted and cannot be overwritten.
pub fn conclude(stopped: bool, failing: usize, bookkeeping_error: Option<&str>) -> Verdict {
    if stopped {
        return Verdict {
            status: RunStatus::Stopped,
            error_msg: None,
            close_leftovers: true,
        };
    }
    if let Some(err) = bookkeeping_error {
        return Verdict {
            status: RunStatus::Failed,
            error_msg: Some(err.to_string()),
            close_leftovers: false,
        };
    }
    if failing == 0 {
        Verdict {
            status: RunStatus::Completed,
            error_msg: None,
            close_leftovers: false,
        }
    } else {
        Verdict {
            status: RunStatus::PartFailed,
            error_msg: Some(part_failed_message(failing)),
            close_leftovers: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn launches_in_order_then_done() {
        let mut p = RunProgress::new(3);
        assert_eq!(p.next(false), NextStep::Launch(0));
        assert_eq!(p.next(false), NextStep::Launch(1));
        assert_eq!(p.next(false), NextStep::Launch(2));
        assert_eq!(p.next(false), NextStep::Done);
        assert_eq!(p.next(true), NextStep::Done);
    }

    #[test]
    fn abort_is_sticky() {
        let mut p = RunProgress::new(3);
        assert_eq!(p.next(false), NextStep::Launch(0));
        assert_eq!(p.next(true), NextStep::Abort);
        assert_eq!(p.next(false), NextStep::Abort);
        assert!(p.aborted());
        assert_eq!(p.attempted(), 1);
    }

    #[test]
    fn part_failed_cites_count() {
        let v = conclude(false, 1, None);
        assert_eq!(v.status, RunStatus::PartFailed);
        assert!(v.error_msg.unwrap().contains("1 步骤"));
    }

    #[test]
    fn stop_beats_failures_and_errors() {
        let v = conclude(true, 2, Some("disk full"));
        assert_eq!(v.status, RunStatus::Stopped);
        assert!(v.close_leftovers);
    }

    #[test]
    fn bookkeeping_error_fails_run() {
        let v = conclude(false, 0, Some("disk full"));
        assert_eq!(v.status, RunStatus::Failed);
        assert_eq!(v.error_msg.as_deref(), Some("disk full"));
    }

    fn any_step_status() -> impl Strategy<Value = StepStatus> {
        prop_oneof![
            Just(StepStatus::Completed),
            Just(StepStatus::Failed),
            Just(StepStatus::Timeout),
            Just(StepStatus::Error),
            Just(StepStatus::Stopped),
        ]
    }

    proptest! {
        #[test]
        fn never_launches_more_than_total(total in 0usize..20, stop_at in proptest::option::of(0usize..25)) {
            let mut p = RunProgress::new(total);
            let mut launched = Vec::new();
            for call in 0..30 {
                match p.next(stop_at == Some(call)) {
                    NextStep::Launch(i) => launched.push(i),
                    NextStep::Abort | NextStep::Done => {}
                }
            }
            prop_assert!(launched.len() <= total);
            // Launched indices are exactly 0..n in order.
            prop_assert_eq!(launched.clone(), (0..launched.len()).collect::<Vec<_>>());
            prop_assert_eq!(p.attempted(), launched.len());
        }

        #[test]
        fn completed_iff_no_failing_step(statuses in proptest::collection::vec(any_step_status(), 0..10)) {
            let mut p = RunProgress::new(statuses.len());
            for (i, status) in statuses.iter().enumerate() {
                prop_assert_eq!(p.next(false), NextStep::Launch(i));
                p.record(i as u32 + 1, *status);
            }
            let verdict = conclude(false, p.failing(), None);
            let any_failure = statuses.iter().any(|s| s.is_failure());
            prop_assert_eq!(verdict.status == RunStatus::Completed, !any_failure);
            if any_failure {
                let msg = verdict.error_msg.unwrap();
                let expected = format!("{} 步骤", p.failing());
                prop_assert!(msg.starts_with(&expected));
            }
        }
    }
}
