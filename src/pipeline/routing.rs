use super::error::RunErrorKind;
use super::run::{RunStatus, StageName};
use super::stages::{StagePayload, StageResult};

/// Where a run goes after a stage, decided purely from the stage result and
/// the retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub next: StageName,
    pub status: RunStatus,
    /// Set only on the Diagnose -> Validate edge.
    pub increment_retry: bool,
    /// Terminal error to record, if the route ends the run with one.
    pub terminal_error: Option<(RunErrorKind, String)>,
}

impl Route {
    fn to(next: StageName, status: RunStatus) -> Self {
        Self {
            next,
            status,
            increment_retry: false,
            terminal_error: None,
        }
    }

    fn end(status: RunStatus) -> Self {
        Self::to(StageName::End, status)
    }

    fn end_with(status: RunStatus, kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            terminal_error: Some((kind, message.into())),
            ..Self::end(status)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next == StageName::End
    }
}

fn failure_end(result: &StageResult, default_kind: RunErrorKind) -> Route {
    let kind = result.error_kind.unwrap_or(default_kind);
    let message = result
        .errors
        .first()
        .cloned()
        .unwrap_or_else(|| format!("{} stage failed", result.stage));
    Route::end_with(RunStatus::Error, kind, message)
}

pub fn route(result: &StageResult, retry_count: u32, max_retries: u32) -> Route {
    match result.stage {
        StageName::Plan => match &result.payload {
            StagePayload::Plan(change_set) if result.is_success() && !change_set.is_empty() => {
                Route::to(StageName::Validate, RunStatus::Running)
            }
            _ => failure_end(result, RunErrorKind::PlanningFailure),
        },
        StageName::Validate => {
            if result.is_success() {
                return Route::to(StageName::StageChange, RunStatus::Validated);
            }
            if !matches!(result.payload, StagePayload::Verdict(_)) {
                return failure_end(result, RunErrorKind::UnexpectedFault);
            }
            if retry_count < max_retries {
                Route::to(StageName::Diagnose, RunStatus::ValidationFailed)
            } else {
                Route::end_with(
                    RunStatus::ValidationFailed,
                    RunErrorKind::DiagnosisExhausted,
                    format!("validation still failing after {retry_count} of {max_retries} retries"),
                )
            }
        }
        StageName::Diagnose => {
            let StagePayload::Diagnosis(diagnosis) = &result.payload else {
                return failure_end(result, RunErrorKind::UnexpectedFault);
            };
            if !result.is_success() {
                return failure_end(result, RunErrorKind::UnexpectedFault);
            }
            if !diagnosis.has_usable_fix() {
                return Route::end_with(
                    RunStatus::Analyzed,
                    RunErrorKind::DiagnosisExhausted,
                    "diagnosis produced no usable fix suggestion",
                );
            }
            if retry_count >= max_retries {
                return Route::end_with(
                    RunStatus::ValidationFailed,
                    RunErrorKind::DiagnosisExhausted,
                    format!("retry budget of {max_retries} exhausted"),
                );
            }
            Route {
                increment_retry: true,
                ..Route::to(StageName::Validate, RunStatus::Analyzed)
            }
        }
        StageName::StageChange => {
            if result.is_success() {
                Route::end(RunStatus::Deployed)
            } else {
                failure_end(result, RunErrorKind::StagingFailure)
            }
        }
        StageName::End => Route::end(RunStatus::Error),
    }
}
