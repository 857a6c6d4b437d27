//! Stop-condition and final-result rules for a review cycle.

use serde::Serialize;

use crate::core::decision::FixSummary;
use crate::core::types::CycleStatus;

/// Whether the fixer's summary ends the cycle.
///
/// An explicit `stop_iteration` always wins. Otherwise the cycle stops only
/// when the fixer neither applied anything nor asked for more information.
pub fn should_stop(fix: &FixSummary) -> bool {
    if let Some(stop) = fix.stop_iteration {
        return stop;
    }
    fix.fixes.is_empty() && fix.need_info().next().is_none()
}

/// Final verdict for a finished cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleVerdict {
    pub success: bool,
    pub status: CycleStatus,
    pub reason: String,
}

/// Map the cycle's end state to its reported result.
///
/// Interruption wins over everything. Running out of iterations with issues
/// still open is a completed but unsuccessful run.
pub fn determine_cycle_result(
    has_issues: bool,
    iteration: u32,
    max_iterations: u32,
    interrupted: bool,
) -> CycleVerdict {
    if interrupted {
        return CycleVerdict {
            success: false,
            status: CycleStatus::Interrupted,
            reason: "interrupted".to_string(),
        };
    }
    if !has_issues {
        return CycleVerdict {
            success: true,
            status: CycleStatus::Completed,
            reason: "no actionable issues remain".to_string(),
        };
    }
    if iteration >= max_iterations {
        return CycleVerdict {
            success: false,
            status: CycleStatus::Completed,
            reason: format!("max iterations ({max_iterations}) reached with issues remaining"),
        };
    }
    CycleVerdict {
        success: false,
        status: CycleStatus::Failed,
        reason: format!("stopped at iteration {iteration} with issues remaining"),
    }
}

/// Verdict when the fixer ends the cycle. Always `Completed`; unsuccessful
/// while findings still wait on more information.
pub fn fixer_stop_result(need_info: usize, iteration: u32) -> CycleVerdict {
    if need_info == 0 {
        return CycleVerdict {
            success: true,
            status: CycleStatus::Completed,
            reason: format!("fixer stopped at iteration {iteration} with nothing left to apply"),
        };
    }
    CycleVerdict {
        success: false,
        status: CycleStatus::Completed,
        reason: format!(
            "fixer stopped at iteration {iteration}; {need_info} finding(s) need more information"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decision::{FixDecision, FixEntry, Priority, SkipVerdict, SkippedEntry};

    fn summary(decision: FixDecision, fixes: usize, need_info: bool) -> FixSummary {
        FixSummary {
            decision,
            stop_iteration: None,
            fixes: (0..fixes)
                .map(|i| FixEntry {
                    id: i as u32 + 1,
                    title: format!("fix {i}"),
                    priority: Priority::P1,
                    evidence: "patched".to_string(),
                    file: None,
                })
                .collect(),
            skipped: if need_info {
                vec![SkippedEntry {
                    id: 9,
                    title: "unclear".to_string(),
                    priority: Priority::P2,
                    reason: "needs product input".to_string(),
                    verdict: SkipVerdict::NeedInfo,
                }]
            } else {
                Vec::new()
            },
        }
    }

    #[test]
    fn explicit_stop_iteration_wins() {
        let mut fix = summary(FixDecision::ApplyMost, 2, false);
        fix.stop_iteration = Some(true);
        assert!(should_stop(&fix));

        let mut fix = summary(FixDecision::NoChangesNeeded, 0, false);
        fix.stop_iteration = Some(false);
        assert!(!should_stop(&fix));
    }

    #[test]
    fn derived_stop_condition() {
        assert!(!should_stop(&summary(FixDecision::NoChangesNeeded, 3, true)));
        assert!(!should_stop(&summary(FixDecision::NoChangesNeeded, 0, true)));
        assert!(should_stop(&summary(FixDecision::NoChangesNeeded, 0, false)));
        assert!(should_stop(&summary(FixDecision::ApplySelectively, 0, false)));
        assert!(!should_stop(&summary(FixDecision::ApplySelectively, 0, true)));
        assert!(!should_stop(&summary(FixDecision::ApplyMost, 1, false)));
    }

    #[test]
    fn cycle_result_table() {
        let interrupted = determine_cycle_result(false, 1, 5, true);
        assert!(!interrupted.success);
        assert_eq!(interrupted.status, CycleStatus::Interrupted);

        let clean = determine_cycle_result(false, 2, 5, false);
        assert!(clean.success);
        assert_eq!(clean.status, CycleStatus::Completed);

        let exhausted = determine_cycle_result(true, 5, 5, false);
        assert!(!exhausted.success);
        assert_eq!(exhausted.status, CycleStatus::Completed);
        assert!(exhausted.reason.contains("max iterations"));

        let failed = determine_cycle_result(true, 2, 5, false);
        assert!(!failed.success);
        assert_eq!(failed.status, CycleStatus::Failed);
    }

    #[test]
    fn fixer_stop_is_always_completed() {
        let clean = fixer_stop_result(0, 1);
        assert!(clean.success);
        assert_eq!(clean.status, CycleStatus::Completed);

        let open = fixer_stop_result(2, 3);
        assert!(!open.success);
        assert_eq!(open.status, CycleStatus::Completed);
        assert!(open.reason.contains("2 finding(s) need more information"));
    }
}
