//! Chain runner: drives one stage's snapshot of interceptors in order,
//! enforcing per-interceptor timeout and `continueOnError` (spec.md
//! §4.C). Grounded in the teacher's `circuit_breaker.rs` state-walk style
//! (a small state machine advanced one step per call) rather than its
//! Bevy system scheduling.

use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use super::handler::Action;
use super::{Handler, InterceptorRegistry, Stage};
use crate::error::{ClassifyInput, ExceptionClassifier, UnifiedException};
use crate::transport::{RawResponse, ResolvedRequest};

/// Where a stage run ended up.
pub enum StageOutcome<V> {
    /// Every interceptor called `next`; `V` is the (possibly mutated)
    /// final value.
    Continue(V),
    /// An interceptor called `resolve`; the chain is short-circuited with
    /// a synthetic success.
    Resolved(RawResponse),
    /// An interceptor called `reject`, timed out without
    /// `continueOnError`, or misused the handler.
    Rejected(UnifiedException),
}

pub struct InterceptorChain {
    registry: Arc<InterceptorRegistry>,
}

impl InterceptorChain {
    pub fn new(registry: Arc<InterceptorRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<InterceptorRegistry> {
        &self.registry
    }

    pub async fn run_request_stage(
        &self,
        mut value: ResolvedRequest,
        classifier: &ExceptionClassifier,
    ) -> StageOutcome<ResolvedRequest> {
        let slots = self.registry.snapshot_for_stage(Stage::Request);
        for slot in slots {
            let mut handler = Handler::new();
            let started = Instant::now();
            let invocation = slot.interceptor.on_request(value.clone(), &mut handler);
            let timed_out = tokio::time::timeout(slot.timeout, invocation).await.is_err();
            let duration = started.elapsed();

            if timed_out {
                self.registry.record_invocation(&slot.name, duration, true, false);
                if slot.continue_on_error {
                    warn!(interceptor = %slot.name, "request interceptor timed out, continuing");
                    continue;
                }
                let exception = classifier.classify(ClassifyInput::GenericTimeout(format!(
                    "interceptor '{}' timed out at request stage",
                    slot.name
                )));
                return StageOutcome::Rejected(exception);
            }

            match resolve_action(&slot.name, handler, classifier) {
                Ok(Action::NextRequest(next)) => {
                    self.registry.record_invocation(&slot.name, duration, false, false);
                    value = next;
                }
                Ok(Action::Resolve(response)) => {
                    self.registry.record_invocation(&slot.name, duration, false, false);
                    return StageOutcome::Resolved(response);
                }
                Ok(Action::Reject(exception)) => {
                    self.registry.record_invocation(&slot.name, duration, false, false);
                    return StageOutcome::Rejected(exception);
                }
                Ok(_) => {
                    let exception = wrong_stage_call(&slot.name, "request", classifier);
                    self.registry.record_invocation(&slot.name, duration, false, true);
                    if slot.continue_on_error {
                        warn!(interceptor = %slot.name, "request interceptor called wrong-stage continuation, continuing");
                        continue;
                    }
                    return StageOutcome::Rejected(exception);
                }
                Err(exception) => {
                    self.registry.record_invocation(&slot.name, duration, false, true);
                    if slot.continue_on_error {
                        warn!(interceptor = %slot.name, "request interceptor misused handler, continuing");
                        continue;
                    }
                    return StageOutcome::Rejected(exception);
                }
            }
        }
        StageOutcome::Continue(value)
    }

    pub async fn run_response_stage(
        &self,
        mut value: RawResponse,
        classifier: &ExceptionClassifier,
    ) -> StageOutcome<RawResponse> {
        let slots = self.registry.snapshot_for_stage(Stage::Response);
        for slot in slots {
            let mut handler = Handler::new();
            let started = Instant::now();
            let invocation = slot.interceptor.on_response(value.clone(), &mut handler);
            let timed_out = tokio::time::timeout(slot.timeout, invocation).await.is_err();
            let duration = started.elapsed();

            if timed_out {
                self.registry.record_invocation(&slot.name, duration, true, false);
                if slot.continue_on_error {
                    warn!(interceptor = %slot.name, "response interceptor timed out, continuing");
                    continue;
                }
                let exception = classifier.classify(ClassifyInput::GenericTimeout(format!(
                    "interceptor '{}' timed out at response stage",
                    slot.name
                )));
                return StageOutcome::Rejected(exception);
            }

            match resolve_action(&slot.name, handler, classifier) {
                Ok(Action::NextResponse(next)) => {
                    self.registry.record_invocation(&slot.name, duration, false, false);
                    value = next;
                }
                Ok(Action::Resolve(response)) => {
                    self.registry.record_invocation(&slot.name, duration, false, false);
                    return StageOutcome::Resolved(response);
                }
                Ok(Action::Reject(exception)) => {
                    self.registry.record_invocation(&slot.name, duration, false, false);
                    return StageOutcome::Rejected(exception);
                }
                Ok(_) => {
                    let exception = wrong_stage_call(&slot.name, "response", classifier);
                    self.registry.record_invocation(&slot.name, duration, false, true);
                    if slot.continue_on_error {
                        warn!(interceptor = %slot.name, "response interceptor called wrong-stage continuation, continuing");
                        continue;
                    }
                    return StageOutcome::Rejected(exception);
                }
                Err(exception) => {
                    self.registry.record_invocation(&slot.name, duration, false, true);
                    if slot.continue_on_error {
                        warn!(interceptor = %slot.name, "response interceptor misused handler, continuing");
                        continue;
                    }
                    return StageOutcome::Rejected(exception);
                }
            }
        }
        StageOutcome::Continue(value)
    }

    /// Runs the error stage. Unlike the other two, a `Continue` result
    /// still means failure (spec.md §4.F step 9: the original exception,
    /// possibly enriched, propagates to the caller) — only `Resolved`
    /// recovers into a success.
    pub async fn run_error_stage(
        &self,
        mut value: UnifiedException,
        classifier: &ExceptionClassifier,
    ) -> StageOutcome<UnifiedException> {
        let slots = self.registry.snapshot_for_stage(Stage::Error);
        for slot in slots {
            let mut handler = Handler::new();
            let started = Instant::now();
            let invocation = slot.interceptor.on_error(value.clone(), &mut handler);
            let timed_out = tokio::time::timeout(slot.timeout, invocation).await.is_err();
            let duration = started.elapsed();

            if timed_out {
                self.registry.record_invocation(&slot.name, duration, true, false);
                if slot.continue_on_error {
                    warn!(interceptor = %slot.name, "error interceptor timed out, continuing");
                    continue;
                }
                return StageOutcome::Rejected(classifier.classify(ClassifyInput::GenericTimeout(
                    format!("interceptor '{}' timed out at error stage", slot.name),
                )));
            }

            match resolve_action(&slot.name, handler, classifier) {
                Ok(Action::NextError(next)) => {
                    self.registry.record_invocation(&slot.name, duration, false, false);
                    value = next;
                }
                Ok(Action::Resolve(response)) => {
                    self.registry.record_invocation(&slot.name, duration, false, false);
                    return StageOutcome::Resolved(response);
                }
                Ok(Action::Reject(exception)) => {
                    self.registry.record_invocation(&slot.name, duration, false, false);
                    return StageOutcome::Rejected(exception);
                }
                Ok(_) => {
                    let exception = wrong_stage_call(&slot.name, "error", classifier);
                    self.registry.record_invocation(&slot.name, duration, false, true);
                    if slot.continue_on_error {
                        warn!(interceptor = %slot.name, "error interceptor called wrong-stage continuation, continuing");
                        continue;
                    }
                    return StageOutcome::Rejected(exception);
                }
                Err(exception) => {
                    self.registry.record_invocation(&slot.name, duration, false, true);
                    if slot.continue_on_error {
                        warn!(interceptor = %slot.name, "error interceptor misused handler, continuing");
                        continue;
                    }
                    return StageOutcome::Rejected(exception);
                }
            }
        }
        StageOutcome::Continue(value)
    }
}

/// Pulls the decision out of a finished `Handler`, classifying a
/// double-call or no-call as `OPERATION_FAILED` (spec.md §4.B+).
fn resolve_action(
    name: &str,
    handler: Handler,
    classifier: &ExceptionClassifier,
) -> Result<Action, UnifiedException> {
    if handler.called_twice() {
        return Err(classifier.classify(ClassifyInput::OperationFailed(format!(
            "interceptor '{name}' called more than one continuation method"
        ))));
    }
    handler.into_action().ok_or_else(|| {
        classifier.classify(ClassifyInput::OperationFailed(format!(
            "interceptor '{name}' did not call next, resolve, or reject"
        )))
    })
}

fn wrong_stage_call(name: &str, stage: &str, classifier: &ExceptionClassifier) -> UnifiedException {
    classifier.classify(ClassifyInput::OperationFailed(format!(
        "interceptor '{name}' called a continuation method that does not belong to the {stage} stage"
    )))
}
