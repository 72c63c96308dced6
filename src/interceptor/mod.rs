//! Interceptor chain (spec.md §4.C): an ordered, mutable pipeline that
//! every request passes through at three points — before transport
//! (`request` stage), after a successful transport call (`response`
//! stage), and on a classified failure (`error` stage).
//!
//! The registry mirrors the teacher's resource-registration style
//! (`resources.rs`'s pooled, lock-guarded collections) but drops Bevy's
//! `Resource` derive in favor of a plain `parking_lot::RwLock<Vec<..>>`
//! snapshot that the chain clones once per run (spec.md §4.C "Concurrency
//! model": in-flight runs see a consistent snapshot even if the registry
//! mutates mid-flight).

mod chain;
mod handler;

pub use chain::{InterceptorChain, StageOutcome};
pub use handler::{Action, Handler};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::UnifiedException;
use crate::transport::{RawResponse, ResolvedRequest};

/// What an interceptor does at each of the three chain stages (spec.md
/// §4.C). All three are optional; a slot with none enabled is inert.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn on_request(&self, _request: ResolvedRequest, handler: &mut Handler) {
        handler.next_request(_request);
    }

    async fn on_response(&self, _response: RawResponse, handler: &mut Handler) {
        handler.next_response(_response);
    }

    async fn on_error(&self, _error: UnifiedException, handler: &mut Handler) {
        handler.next_error(_error);
    }
}

/// Which stages a registered interceptor actually participates in; an
/// interceptor that only overrides `on_request` should not be scheduled
/// into the response/error stages (spec.md §4.C).
#[derive(Debug, Clone, Copy, Default)]
pub struct StageFlags {
    pub request: bool,
    pub response: bool,
    pub error: bool,
}

/// What happens when `register` is called with a name already present
/// (spec.md §4.C "Registration strategies").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterStrategy {
    /// Fail if the name already exists.
    Strict,
    /// Replace the existing slot unconditionally.
    Replace,
    /// Leave the existing slot in place, report a no-op.
    Skip,
    /// Replace only if the incoming `version` is strictly greater.
    VersionBased,
}

/// Per-stage statistics for one interceptor (spec.md §4.C "Observability").
#[derive(Debug, Clone, Default)]
pub struct InterceptorStats {
    pub invocations: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub total_duration: Duration,
}

/// One registered interceptor and its configuration (spec.md §4.C).
pub struct InterceptorSlot {
    pub name: String,
    pub version: u32,
    pub priority: i32,
    pub enabled: bool,
    pub timeout: Duration,
    pub continue_on_error: bool,
    pub stages: StageFlags,
    pub interceptor: Arc<dyn Interceptor>,
    /// Tie-break when two slots share a priority: insertion sequence,
    /// overridable by `set_execution_order` (spec.md §4.C).
    pub sequence: u64,
}

impl std::fmt::Debug for InterceptorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorSlot")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("interceptor '{0}' already registered")]
    AlreadyRegistered(String),
    #[error("interceptor '{0}' not found")]
    NotFound(String),
    #[error("set_execution_order referenced unknown interceptor '{0}'")]
    UnknownInOrder(String),
}

/// Registration request (spec.md §4.C).
pub struct Registration {
    pub name: String,
    pub version: u32,
    pub priority: i32,
    pub timeout: Duration,
    pub continue_on_error: bool,
    pub stages: StageFlags,
    pub interceptor: Arc<dyn Interceptor>,
}

/// The mutable registry plus the chain runner (spec.md §4.C).
pub struct InterceptorRegistry {
    slots: RwLock<Vec<Arc<InterceptorSlot>>>,
    next_sequence: std::sync::atomic::AtomicU64,
    stats: parking_lot::Mutex<HashMap<String, InterceptorStats>>,
}

impl Default for InterceptorRegistry {
    fn default() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            next_sequence: std::sync::atomic::AtomicU64::new(0),
            stats: parking_lot::Mutex::new(HashMap::new()),
        }
    }
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_sequence(&self) -> u64 {
        self.next_sequence
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// `register(registration, strategy)` (spec.md §4.C).
    pub fn register(
        &self,
        registration: Registration,
        strategy: RegisterStrategy,
    ) -> Result<(), RegistryError> {
        let mut slots = self.slots.write();
        let existing = slots.iter().position(|s| s.name == registration.name);

        match (existing, strategy) {
            (Some(_), RegisterStrategy::Strict) => {
                return Err(RegistryError::AlreadyRegistered(registration.name));
            }
            (Some(_), RegisterStrategy::Skip) => return Ok(()),
            (Some(idx), RegisterStrategy::VersionBased) => {
                if registration.version <= slots[idx].version {
                    return Ok(());
                }
                let sequence = slots[idx].sequence;
                slots[idx] = Arc::new(build_slot(registration, sequence));
            }
            (Some(idx), RegisterStrategy::Replace) => {
                let sequence = slots[idx].sequence;
                slots[idx] = Arc::new(build_slot(registration, sequence));
            }
            (None, _) => {
                let sequence = self.alloc_sequence();
                slots.push(Arc::new(build_slot(registration, sequence)));
            }
        }
        Ok(())
    }

    /// Multi-registration (spec.md §4.C "registerBatch"). When
    /// `continue_on_error` is `false`, any `Strict` conflict rolls back the
    /// entire batch. When `true`, a `Strict` conflict is skipped and
    /// reported (the first error encountered) but every other registration
    /// in the batch is still applied.
    pub fn register_batch(
        &self,
        registrations: Vec<Registration>,
        strategy: RegisterStrategy,
        continue_on_error: bool,
    ) -> Result<(), RegistryError> {
        let mut slots = self.slots.write();
        let snapshot = slots.clone();
        let mut first_error: Option<RegistryError> = None;

        for registration in registrations {
            let existing = slots.iter().position(|s| s.name == registration.name);
            match (existing, strategy) {
                (Some(_), RegisterStrategy::Strict) => {
                    let err = RegistryError::AlreadyRegistered(registration.name.clone());
                    if !continue_on_error {
                        *slots = snapshot;
                        return Err(err);
                    }
                    first_error.get_or_insert(err);
                }
                (Some(_), RegisterStrategy::Skip) => continue,
                (Some(idx), RegisterStrategy::VersionBased) => {
                    if registration.version > slots[idx].version {
                        let sequence = slots[idx].sequence;
                        slots[idx] = Arc::new(build_slot(registration, sequence));
                    }
                }
                (Some(idx), RegisterStrategy::Replace) => {
                    let sequence = slots[idx].sequence;
                    slots[idx] = Arc::new(build_slot(registration, sequence));
                }
                (None, _) => {
                    let sequence = self.alloc_sequence();
                    slots.push(Arc::new(build_slot(registration, sequence)));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|s| s.name != name);
        if slots.len() == before {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        let mut slots = self.slots.write();
        let idx = slots
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let mut updated = (*slots[idx]).clone_with(|s| s.enabled = enabled);
        updated.sequence = slots[idx].sequence;
        slots[idx] = Arc::new(updated);
        Ok(())
    }

    pub fn update_config(
        &self,
        name: &str,
        timeout: Duration,
        continue_on_error: bool,
    ) -> Result<(), RegistryError> {
        let mut slots = self.slots.write();
        let idx = slots
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let mut updated = (*slots[idx]).clone_with(|s| {
            s.timeout = timeout;
            s.continue_on_error = continue_on_error;
        });
        updated.sequence = slots[idx].sequence;
        slots[idx] = Arc::new(updated);
        Ok(())
    }

    /// Replaces the insertion-order tie-break sequence for every listed
    /// name; fails atomically if any name is unknown (spec.md §4.C
    /// "setExecutionOrder").
    pub fn set_execution_order(&self, names: &[String]) -> Result<(), RegistryError> {
        let mut slots = self.slots.write();
        for name in names {
            if !slots.iter().any(|s| &s.name == name) {
                return Err(RegistryError::UnknownInOrder(name.clone()));
            }
        }
        for (sequence, name) in names.iter().enumerate() {
            if let Some(idx) = slots.iter().position(|s| &s.name == name) {
                let mut updated = (*slots[idx]).clone_with(|_| {});
                updated.sequence = sequence as u64;
                slots[idx] = Arc::new(updated);
            }
        }
        Ok(())
    }

    /// Installs `registration` for the duration of `scope`, then restores
    /// whatever was there before — the previous slot if one existed, or
    /// absence if one didn't (spec.md §4.C "withTemporary"). Installing
    /// uses `Replace`, not `Strict`, since overriding an already-registered
    /// interceptor is exactly the scenario this method exists for.
    pub async fn with_temporary<F, Fut, R>(
        &self,
        registration: Registration,
        scope: F,
    ) -> Result<R, RegistryError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        let name = registration.name.clone();
        let previous = self
            .slots
            .read()
            .iter()
            .find(|s| s.name == name)
            .cloned();

        self.register(registration, RegisterStrategy::Replace)?;
        let result = scope().await;

        match previous {
            Some(slot) => {
                let mut slots = self.slots.write();
                if let Some(idx) = slots.iter().position(|s| s.name == name) {
                    slots[idx] = slot;
                }
            }
            None => {
                let _ = self.unregister(&name);
            }
        }
        Ok(result)
    }

    /// Snapshot of currently-enabled slots for one stage, sorted per
    /// spec.md §4.C's ordering rule: request-stage ascending priority,
    /// response-stage descending, error-stage ascending; ties broken by
    /// `sequence`.
    pub fn snapshot_for_stage(&self, stage: Stage) -> Vec<Arc<InterceptorSlot>> {
        let slots = self.slots.read();
        let mut selected: Vec<Arc<InterceptorSlot>> = slots
            .iter()
            .filter(|s| s.enabled && stage.selects(&s.stages))
            .cloned()
            .collect();
        match stage {
            Stage::Request | Stage::Error => {
                selected.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.sequence.cmp(&b.sequence)));
            }
            Stage::Response => {
                selected.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)));
            }
        }
        selected
    }

    pub fn record_invocation(&self, name: &str, duration: Duration, timed_out: bool, errored: bool) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(name.to_string()).or_default();
        entry.invocations += 1;
        entry.total_duration += duration;
        if timed_out {
            entry.timeouts += 1;
        }
        if errored {
            entry.errors += 1;
        }
    }

    pub fn stats(&self) -> HashMap<String, InterceptorStats> {
        self.stats.lock().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.read().iter().map(|s| s.name.clone()).collect()
    }
}

impl InterceptorSlot {
    fn clone_with(&self, mutate: impl FnOnce(&mut InterceptorSlot)) -> InterceptorSlot {
        let mut copy = InterceptorSlot {
            name: self.name.clone(),
            version: self.version,
            priority: self.priority,
            enabled: self.enabled,
            timeout: self.timeout,
            continue_on_error: self.continue_on_error,
            stages: self.stages,
            interceptor: self.interceptor.clone(),
            sequence: self.sequence,
        };
        mutate(&mut copy);
        copy
    }
}

fn build_slot(registration: Registration, sequence: u64) -> InterceptorSlot {
    InterceptorSlot {
        name: registration.name,
        version: registration.version,
        priority: registration.priority,
        enabled: true,
        timeout: registration.timeout,
        continue_on_error: registration.continue_on_error,
        stages: registration.stages,
        interceptor: registration.interceptor,
        sequence,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Request,
    Response,
    Error,
}

impl Stage {
    fn selects(self, flags: &StageFlags) -> bool {
        match self {
            Stage::Request => flags.request,
            Stage::Response => flags.response,
            Stage::Error => flags.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoOp;

    #[async_trait]
    impl Interceptor for NoOp {
        fn name(&self) -> &str {
            "noop"
        }
    }

    fn registration(name: &str, priority: i32) -> Registration {
        Registration {
            name: name.to_string(),
            version: 1,
            priority,
            timeout: Duration::from_secs(1),
            continue_on_error: false,
            stages: StageFlags {
                request: true,
                response: true,
                error: true,
            },
            interceptor: Arc::new(NoOp),
        }
    }

    #[test]
    fn strict_registration_rejects_duplicate_names() {
        let registry = InterceptorRegistry::new();
        registry
            .register(registration("a", 0), RegisterStrategy::Strict)
            .unwrap();
        let err = registry
            .register(registration("a", 0), RegisterStrategy::Strict)
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
    }

    #[test]
    fn request_stage_orders_ascending_by_priority() {
        let registry = InterceptorRegistry::new();
        registry
            .register(registration("b", 5), RegisterStrategy::Strict)
            .unwrap();
        registry
            .register(registration("a", 1), RegisterStrategy::Strict)
            .unwrap();
        let snapshot = registry.snapshot_for_stage(Stage::Request);
        assert_eq!(snapshot[0].name, "a");
        assert_eq!(snapshot[1].name, "b");
    }

    #[test]
    fn response_stage_orders_descending_by_priority() {
        let registry = InterceptorRegistry::new();
        registry
            .register(registration("b", 5), RegisterStrategy::Strict)
            .unwrap();
        registry
            .register(registration("a", 1), RegisterStrategy::Strict)
            .unwrap();
        let snapshot = registry.snapshot_for_stage(Stage::Response);
        assert_eq!(snapshot[0].name, "b");
        assert_eq!(snapshot[1].name, "a");
    }

    #[test]
    fn set_execution_order_rejects_unknown_name() {
        let registry = InterceptorRegistry::new();
        registry
            .register(registration("a", 0), RegisterStrategy::Strict)
            .unwrap();
        let err = registry
            .set_execution_order(&["a".to_string(), "ghost".to_string()])
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownInOrder(_)));
    }

    #[test]
    fn version_based_registration_ignores_lower_version() {
        let registry = InterceptorRegistry::new();
        registry
            .register(registration("a", 0), RegisterStrategy::Strict)
            .unwrap();
        let mut lower = registration("a", 9);
        lower.version = 0;
        registry
            .register(lower, RegisterStrategy::VersionBased)
            .unwrap();
        let snapshot = registry.snapshot_for_stage(Stage::Request);
        assert_eq!(snapshot[0].priority, 0);
    }

    #[test]
    fn register_batch_without_continue_on_error_rolls_back_entirely() {
        let registry = InterceptorRegistry::new();
        registry
            .register(registration("a", 0), RegisterStrategy::Strict)
            .unwrap();
        let err = registry
            .register_batch(
                vec![registration("b", 1), registration("a", 2)],
                RegisterStrategy::Strict,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
        assert_eq!(registry.names(), vec!["a".to_string()]);
    }

    #[test]
    fn register_batch_with_continue_on_error_applies_the_rest() {
        let registry = InterceptorRegistry::new();
        registry
            .register(registration("a", 0), RegisterStrategy::Strict)
            .unwrap();
        let err = registry
            .register_batch(
                vec![registration("b", 1), registration("a", 2)],
                RegisterStrategy::Strict,
                true,
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn with_temporary_restores_the_previous_registration() {
        let registry = InterceptorRegistry::new();
        registry
            .register(registration("a", 1), RegisterStrategy::Strict)
            .unwrap();

        registry
            .with_temporary(registration("a", 99), || async {
                let snapshot = registry.snapshot_for_stage(Stage::Request);
                assert_eq!(snapshot[0].priority, 99);
            })
            .await
            .unwrap();

        let snapshot = registry.snapshot_for_stage(Stage::Request);
        assert_eq!(snapshot[0].priority, 1);
    }

    #[tokio::test]
    async fn with_temporary_removes_the_slot_if_nothing_existed_before() {
        let registry = InterceptorRegistry::new();
        registry
            .with_temporary(registration("temp", 0), || async {})
            .await
            .unwrap();
        assert!(registry.names().is_empty());
    }
}
