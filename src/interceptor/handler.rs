//! The continuation object passed to each interceptor invocation
//! (spec.md §4.B+): `next`, `reject`, and `resolve`. Calling more than one
//! of these methods during a single invocation is a programming error in
//! the interceptor and is classified as `OPERATION_FAILED` by the chain
//! (spec.md §4.B+, §4.C).

use crate::error::UnifiedException;
use crate::transport::{RawResponse, ResolvedRequest};

/// What an interceptor decided to do with its invocation.
pub enum Action {
    NextRequest(ResolvedRequest),
    NextResponse(RawResponse),
    NextError(UnifiedException),
    /// Short-circuits the remaining chain with a synthetic success
    /// (spec.md §4.B+; available at all three stages, see DESIGN.md).
    Resolve(RawResponse),
    /// Short-circuits the remaining chain with a classified failure.
    Reject(UnifiedException),
}

/// Per-invocation continuation handle. One `Handler` is created fresh for
/// every interceptor call and inspected once the call returns.
#[derive(Default)]
pub struct Handler {
    action: Option<Action>,
    called_twice: bool,
}

impl Handler {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, action: Action) {
        if self.action.is_some() {
            self.called_twice = true;
        }
        self.action = Some(action);
    }

    pub fn next_request(&mut self, request: ResolvedRequest) {
        self.record(Action::NextRequest(request));
    }

    pub fn next_response(&mut self, response: RawResponse) {
        self.record(Action::NextResponse(response));
    }

    pub fn next_error(&mut self, error: UnifiedException) {
        self.record(Action::NextError(error));
    }

    pub fn resolve(&mut self, response: RawResponse) {
        self.record(Action::Resolve(response));
    }

    pub fn reject(&mut self, error: UnifiedException) {
        self.record(Action::Reject(error));
    }

    pub fn called_twice(&self) -> bool {
        self.called_twice
    }

    /// Consumes the handler. Returns `None` if the interceptor never
    /// called any continuation method (treated the same as double-call:
    /// the chain cannot proceed without a decision).
    pub fn into_action(self) -> Option<Action> {
        self.action
    }
}
