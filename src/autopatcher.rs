//! # Auto patcher
//!
//! Applies every registered unit once, in dependency order.
//!
//! For each unit:
//! - a disabled unit is never patched and finishes inactive
//! - an enabled unit is patched; on failure the error is logged, the user is shown the unit's
//!   failure message and, if the unit asks for it, whatever the attempt applied is reverted
//! - completion listeners fire exactly once, after any rollback, with whether the unit is active
//!
//! Failures are contained to the unit, including panics in a unit's patch logic. The run as a whole fails if any unit failed. Units that
//! depend on a failed unit are still attempted.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::engine::PatchEngine;
use crate::order::{resolve_order, OrderError};
use crate::registry::{PatchRegistry, UnitSlot};
use crate::unit::{InstancePatcher, PatchError, UnitId};

/// Outcome of one unit's attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoPatchResult {
    /// Not decided yet. Never the outcome of a finished attempt.
    None,
    /// Patching failed
    Error,
    /// The unit is disabled and was skipped
    Disabled,
    /// The unit was patched
    Success,
}
impl AutoPatchResult {
    /// Whether a unit with this outcome is active
    pub fn is_patch_active(self) -> Result<bool, AutoPatchError> {
        match self {
            Self::Success => Ok(true),
            Self::Disabled | Self::Error => Ok(false),
            Self::None => Err(AutoPatchError::InvariantViolation(
                "an attempt finished without a result".to_string(),
            )),
        }
    }
}

/// Errors that abort an auto patch run
#[derive(Debug, Error)]
pub enum AutoPatchError {
    /// The declared order can't be satisfied
    #[error(transparent)]
    Order(#[from] OrderError),
    /// The auto patcher's own bookkeeping is broken
    #[error("Auto patcher invariant violated: {0}")]
    InvariantViolation(String),
}

/// Shows unit failures to the end user
pub trait UserNotifier {
    /// Called once per failed unit with the unit's failure message
    fn notify_failure(&self, unit: UnitId, message: &str);
}

/// Notifier that logs the message at error level under the unit category
#[derive(Default, Clone, Copy, Debug)]
pub struct LogNotifier;
impl UserNotifier for LogNotifier {
    fn notify_failure(&self, unit: UnitId, message: &str) {
        error!(target: "autopatch::unit", "{unit}: {message}");
    }
}

/// Settings for an [`AutoPatcher`]
#[derive(Clone, Debug)]
pub struct AutoPatcherConfig {
    /// Log target for run level messages
    pub loading_target: &'static str,
    /// Log target for unit level messages
    pub unit_target: &'static str,
    /// Log each disabled unit at info level instead of debug
    pub log_disabled: bool,
}
impl Default for AutoPatcherConfig {
    fn default() -> Self {
        Self {
            loading_target: "autopatch::loading",
            unit_target: "autopatch::unit",
            log_disabled: false,
        }
    }
}
impl AutoPatcherConfig {
    /// Sets the log target for run level messages
    pub fn loading_target(mut self, target: &'static str) -> Self {
        self.loading_target = target;
        self
    }

    /// Sets the log target for unit level messages
    pub fn unit_target(mut self, target: &'static str) -> Self {
        self.unit_target = target;
        self
    }

    /// Sets whether disabled units are logged at info level
    pub fn log_disabled(mut self, log_disabled: bool) -> Self {
        self.log_disabled = log_disabled;
        self
    }
}

/// What happened to one unit during a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitOutcome {
    /// The unit
    pub unit: UnitId,
    /// Result of the attempt
    pub result: AutoPatchResult,
    /// Error message when the attempt failed
    pub error: Option<String>,
}

/// Summary of a run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AutoPatchReport {
    /// Outcomes in attempt order
    outcomes: Vec<UnitOutcome>,
}
impl AutoPatchReport {
    /// True when no unit failed
    pub fn succeeded(&self) -> bool {
        self.error_count() == 0
    }

    /// Outcomes in attempt order
    pub fn outcomes(&self) -> &[UnitOutcome] {
        &self.outcomes
    }

    /// Outcome of one unit
    pub fn outcome(&self, unit: UnitId) -> Option<&UnitOutcome> {
        self.outcomes.iter().find(|o| o.unit == unit)
    }

    /// Number of units with the given result
    fn count(&self, result: AutoPatchResult) -> usize {
        self.outcomes.iter().filter(|o| o.result == result).count()
    }

    /// Number of failed units
    pub fn error_count(&self) -> usize {
        self.count(AutoPatchResult::Error)
    }

    /// Number of disabled units
    pub fn disabled_count(&self) -> usize {
        self.count(AutoPatchResult::Disabled)
    }

    /// Number of patched units
    pub fn success_count(&self) -> usize {
        self.count(AutoPatchResult::Success)
    }
}

/// Drives the patch attempt of every registered unit
pub struct AutoPatcher {
    /// Settings
    config: AutoPatcherConfig,
    /// Where failure messages go
    notifier: Box<dyn UserNotifier>,
}
impl Default for AutoPatcher {
    fn default() -> Self {
        Self::new()
    }
}
impl AutoPatcher {
    /// Auto patcher with default settings, logging failures through [`LogNotifier`]
    pub fn new() -> Self {
        Self {
            config: AutoPatcherConfig::default(),
            notifier: Box::new(LogNotifier),
        }
    }

    /// Replaces the settings
    pub fn with_config(mut self, config: AutoPatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the notifier
    pub fn with_notifier(mut self, notifier: impl UserNotifier + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    /// Settings in use
    pub fn config(&self) -> &AutoPatcherConfig {
        &self.config
    }

    /// Attempts every registered unit once, in dependency order.
    ///
    /// Unit failures are recorded in the report; only an unsatisfiable order or broken
    /// bookkeeping aborts the run.
    pub fn start_auto_patcher(
        &self,
        registry: &mut PatchRegistry,
        engine: &mut dyn PatchEngine,
    ) -> Result<AutoPatchReport, AutoPatchError> {
        let loading = self.config.loading_target;
        if registry.is_empty() {
            info!(target: loading, "No auto patches registered, nothing to apply.");
            return Ok(AutoPatchReport::default());
        }

        let order = resolve_order(registry)?;
        debug!(target: loading, "Auto patch order: {order:?}");

        let mut report = AutoPatchReport::default();
        for id in order {
            let outcome = self.patch(id, registry.slot_mut(id), engine)?;
            report.outcomes.push(outcome);
        }

        if report.succeeded() {
            info!(target: loading, "All auto patches applied successfully.");
        } else {
            let attempted = report.outcomes.len() - report.disabled_count();
            error!(
                target: loading,
                "FATAL: {} out of {attempted} auto patches failed. Check above for errors.",
                report.error_count()
            );
        }
        Ok(report)
    }

    /// Runs one unit's attempt to completion
    fn patch(
        &self,
        id: UnitId,
        slot: Option<&mut UnitSlot>,
        engine: &mut dyn PatchEngine,
    ) -> Result<UnitOutcome, AutoPatchError> {
        let unit_target = self.config.unit_target;
        let Some(slot) = slot else {
            error!(
                target: unit_target,
                "Error auto patching {id}: the registry holds no instance for it."
            );
            return Ok(UnitOutcome {
                unit: id,
                result: AutoPatchResult::Error,
                error: Some("missing instance".to_string()),
            });
        };

        let mut attempt = Attempt::new(id);
        if !slot.unit.is_auto_patch_enabled() {
            if self.config.log_disabled {
                info!(target: unit_target, "Auto patch {id} is disabled, skipping.");
            } else {
                debug!(target: unit_target, "Auto patch {id} is disabled, skipping.");
            }
            attempt.result = AutoPatchResult::Disabled;
            return attempt.finish(slot);
        }

        let mut patcher = InstancePatcher::new(id, engine);
        let patched = panic::catch_unwind(AssertUnwindSafe(|| {
            slot.unit.patch_instance(&mut patcher)
        }))
        .unwrap_or_else(|payload| Err(PatchError::Panicked(panic_message(payload.as_ref()))));

        match patched {
            Ok(handles) => {
                debug!(target: unit_target, "Auto patched {id} ({} sites).", handles.len());
                attempt.result = AutoPatchResult::Success;
            }
            Err(e) => {
                error!(target: unit_target, "Error auto patching {id}: {e}");
                self.notifier.notify_failure(id, slot.unit.failure_message());

                if slot.unit.is_rollback_on_auto_patch_fail() {
                    let rollback = panic::catch_unwind(AssertUnwindSafe(|| {
                        slot.unit.unpatch_instance(&mut patcher)
                    }))
                    .unwrap_or_else(|payload| {
                        Err(PatchError::Panicked(panic_message(payload.as_ref())))
                    });
                    if let Err(rollback) = rollback {
                        warn!(
                            target: unit_target,
                            "Rolling back {id} failed, some of its patches may remain: {rollback}"
                        );
                    }
                }
                attempt.result = AutoPatchResult::Error;
                attempt.error = Some(e.to_string());
            }
        }
        attempt.finish(slot)
    }
}

/// Text of a caught panic payload
fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// One unit's attempt. Consumed when it finishes, so listeners can only be notified once.
struct Attempt {
    /// Unit being attempted
    unit: UnitId,
    /// Result so far
    result: AutoPatchResult,
    /// Failure description
    error: Option<String>,
}
impl Attempt {
    /// Starts an undecided attempt
    fn new(unit: UnitId) -> Self {
        Self {
            unit,
            result: AutoPatchResult::None,
            error: None,
        }
    }

    /// Records the result on the slot and fires its listeners
    fn finish(self, slot: &mut UnitSlot) -> Result<UnitOutcome, AutoPatchError> {
        let active = self.result.is_patch_active()?;
        slot.finish(active);
        Ok(UnitOutcome {
            unit: self.unit,
            result: self.result,
            error: self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::engine::mock::{Event, EventLog, RecordingEngine};
    use crate::registry::fixtures::{factory, TestUnit};
    use crate::registry::PatchRegistry;
    use crate::settings::SettingsPanel;
    use crate::engine::PatchHandle;
    use crate::unit::{
        InstancePatcher, PatchError, PatchOrder, PatchScope, PatchUnit, UnitDescriptor,
        UnitFactory, UnitId,
    };

    use super::{AutoPatchError, AutoPatchResult, AutoPatcher, UserNotifier};

    const A: UnitId = UnitId::new("A");
    const B: UnitId = UnitId::new("B");
    const C: UnitId = UnitId::new("C");
    const X: UnitId = UnitId::new("X");
    const EXPLODING: UnitId = UnitId::new("Exploding");

    /// Unit whose patch logic panics after applying one site
    struct Exploding;
    impl PatchUnit for Exploding {
        fn id(&self) -> UnitId {
            EXPLODING
        }

        fn is_auto_patch_enabled(&self) -> bool {
            true
        }

        fn failure_message(&self) -> &str {
            "exploded"
        }

        fn scope(&self) -> PatchScope {
            PatchScope::new("Exploding")
        }

        fn patch_instance(
            &mut self,
            patcher: &mut InstancePatcher<'_>,
        ) -> Result<Vec<PatchHandle>, PatchError> {
            let mut handles = patcher.patch_scope(&TestUnit::new(EXPLODING).scope())?;
            let missing: Vec<PatchHandle> = Vec::new();
            handles.push(missing[3]);
            Ok(handles)
        }
    }

    /// Notifier that remembers what it was asked to show
    #[derive(Clone, Default)]
    struct RecordingNotifier(Arc<Mutex<Vec<(UnitId, String)>>>);
    impl UserNotifier for RecordingNotifier {
        fn notify_failure(&self, unit: UnitId, message: &str) {
            self.0.lock().unwrap().push((unit, message.to_string()));
        }
    }

    /// Registers the units and records their completions into `events`
    fn registry(factories: &[UnitFactory], events: &EventLog) -> PatchRegistry {
        let mut registry = PatchRegistry::new();
        for factory in factories {
            let id = factory().id();
            registry
                .register_patch_class(UnitDescriptor::from_factory(id, *factory))
                .unwrap();
            let events = events.clone();
            registry
                .on_patch_finished(id, move |active| {
                    events.lock().unwrap().push(Event::Finished(id, active))
                })
                .unwrap();
        }
        registry
    }

    fn finished(events: &[Event], unit: UnitId) -> Vec<bool> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Finished(u, active) if *u == unit => Some(*active),
                _ => None,
            })
            .collect()
    }

    #[test]
    /// Enabled/succeeding, disabled and failing-with-rollback units side by side
    fn test_mixed_run() {
        let mut engine = RecordingEngine::new().failing_on("c_second");
        let notifier = RecordingNotifier::default();
        let mut registry = registry(
            &[
                factory!(TestUnit::new(A)),
                factory!(TestUnit::new(B).disabled()),
                factory!(TestUnit::new(C).methods(&["c_first", "c_second"])),
            ],
            &engine.events,
        );

        let report = AutoPatcher::new()
            .with_notifier(notifier.clone())
            .start_auto_patcher(&mut registry, &mut engine)
            .unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.disabled_count(), 1);
        assert_eq!(report.success_count(), 1);
        assert_eq!(report.outcome(A).unwrap().result, AutoPatchResult::Success);
        assert_eq!(report.outcome(B).unwrap().result, AutoPatchResult::Disabled);
        assert_eq!(report.outcome(C).unwrap().result, AutoPatchResult::Error);
        assert!(report.outcome(C).unwrap().error.is_some());

        assert!(registry.is_patch_active(A).unwrap());
        assert!(!registry.is_patch_active(B).unwrap());
        assert!(!registry.is_patch_active(C).unwrap());

        let events = engine.events();
        assert_eq!(
            events,
            [
                Event::Apply(A, "A".to_string()),
                Event::Finished(A, true),
                Event::Finished(B, false),
                Event::Apply(C, "c_first".to_string()),
                Event::RevertAll(C),
                Event::Finished(C, false),
            ]
        );
        assert_eq!(
            *notifier.0.lock().unwrap(),
            [(C, "test unit failed".to_string())]
        );
    }

    #[test]
    /// A panicking unit fails like any other, is rolled back and doesn't stop the run
    fn test_panicking_unit_is_contained() {
        let mut engine = RecordingEngine::new();
        let mut registry = registry(
            &[factory!(Exploding), factory!(TestUnit::new(B))],
            &engine.events,
        );

        let report = AutoPatcher::new()
            .start_auto_patcher(&mut registry, &mut engine)
            .unwrap();

        let outcome = report.outcome(EXPLODING).unwrap();
        assert_eq!(outcome.result, AutoPatchResult::Error);
        assert!(outcome.error.as_deref().unwrap().contains("panicked"));
        assert_eq!(report.outcome(B).unwrap().result, AutoPatchResult::Success);
        assert!(!registry.is_patch_active(EXPLODING).unwrap());

        let events = engine.events();
        assert_eq!(
            events,
            [
                Event::Apply(EXPLODING, "Exploding".to_string()),
                Event::RevertAll(EXPLODING),
                Event::Finished(EXPLODING, false),
                Event::Apply(B, "B".to_string()),
                Event::Finished(B, true),
            ]
        );
    }

    #[test]
    /// A rollback that fails is only logged: the unit still finishes inactive, once
    fn test_rollback_failure_is_not_escalated() {
        let mut engine = RecordingEngine::new()
            .failing_on("c_second")
            .failing_revert_all();
        let mut registry = registry(
            &[
                factory!(TestUnit::new(C).methods(&["c_first", "c_second"])),
                factory!(TestUnit::new(A)),
            ],
            &engine.events,
        );

        let report = AutoPatcher::new()
            .start_auto_patcher(&mut registry, &mut engine)
            .unwrap();

        assert_eq!(report.outcome(C).unwrap().result, AutoPatchResult::Error);
        assert_eq!(report.outcome(A).unwrap().result, AutoPatchResult::Success);
        assert_eq!(report.error_count(), 1);
        assert!(!registry.is_patch_active(C).unwrap());

        let events = engine.events();
        assert_eq!(finished(&events, C), [false]);
        assert!(!events.contains(&Event::RevertAll(C)));
    }

    #[test]
    /// Disabled units are never patched but still finish, once, inactive
    fn test_disabled_unit() {
        let mut engine = RecordingEngine::new();
        let mut registry = registry(&[factory!(TestUnit::new(B).disabled())], &engine.events);

        let report = AutoPatcher::new()
            .start_auto_patcher(&mut registry, &mut engine)
            .unwrap();

        assert!(report.succeeded());
        assert!(engine.applied_by(B).is_empty());
        assert_eq!(finished(&engine.events(), B), [false]);
    }

    #[test]
    /// Successful units finish active, exactly once
    fn test_successful_unit() {
        let mut engine = RecordingEngine::new();
        let mut registry = registry(&[factory!(TestUnit::new(A))], &engine.events);

        let report = AutoPatcher::new()
            .start_auto_patcher(&mut registry, &mut engine)
            .unwrap();

        assert!(report.succeeded());
        assert!(registry.is_patch_active(A).unwrap());
        assert_eq!(finished(&engine.events(), A), [true]);
    }

    #[test]
    /// Without rollback a failed unit keeps its partial patches and is never unpatched
    fn test_failure_without_rollback() {
        let mut engine = RecordingEngine::new().failing_on("second");
        let mut registry = registry(
            &[factory!(TestUnit::new(C)
                .methods(&["first", "second"])
                .without_rollback())],
            &engine.events,
        );

        let report = AutoPatcher::new()
            .start_auto_patcher(&mut registry, &mut engine)
            .unwrap();

        assert!(!report.succeeded());
        assert!(!engine.events().contains(&Event::RevertAll(C)));
        assert_eq!(engine.applied_by(C), ["first"]);
        assert_eq!(finished(&engine.events(), C), [false]);
    }

    #[test]
    /// A unit that fails doesn't stop the units after it, including its dependents
    fn test_failure_does_not_skip_dependents() {
        let mut engine = RecordingEngine::new().failing_on("A");
        let mut registry = registry(
            &[
                factory!(TestUnit::new(B).order(PatchOrder::new().after(A))),
                factory!(TestUnit::new(A)),
            ],
            &engine.events,
        );

        let report = AutoPatcher::new()
            .start_auto_patcher(&mut registry, &mut engine)
            .unwrap();

        assert_eq!(report.outcome(A).unwrap().result, AutoPatchResult::Error);
        assert_eq!(report.outcome(B).unwrap().result, AutoPatchResult::Success);
        let attempted: Vec<_> = report.outcomes().iter().map(|o| o.unit).collect();
        assert_eq!(attempted, [A, B]);
    }

    #[test]
    /// An empty registry is a successful run with nothing attempted
    fn test_empty_registry() {
        let mut engine = RecordingEngine::new();
        let mut registry = PatchRegistry::new();

        let report = AutoPatcher::new()
            .start_auto_patcher(&mut registry, &mut engine)
            .unwrap();

        assert!(report.succeeded());
        assert!(report.outcomes().is_empty());
        assert!(engine.events().is_empty());
    }

    #[test]
    /// A unit declared before X reaches the engine ahead of X
    fn test_declared_order_reaches_engine() {
        let mut engine = RecordingEngine::new();
        let mut registry = registry(
            &[
                factory!(TestUnit::new(X)),
                factory!(TestUnit::new(A).order(PatchOrder::new().before(X))),
            ],
            &engine.events,
        );

        AutoPatcher::new()
            .start_auto_patcher(&mut registry, &mut engine)
            .unwrap();

        let applied: Vec<_> = engine
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Apply(..)))
            .collect();
        assert_eq!(
            applied,
            [Event::Apply(A, "A".to_string()), Event::Apply(X, "X".to_string())]
        );
    }

    #[test]
    /// A cycle aborts the run before any unit is touched
    fn test_cycle_aborts_run() {
        let mut engine = RecordingEngine::new();
        let mut registry = registry(
            &[
                factory!(TestUnit::new(A).order(PatchOrder::new().before(B))),
                factory!(TestUnit::new(B).order(PatchOrder::new().before(A))),
            ],
            &engine.events,
        );

        let err = AutoPatcher::new()
            .start_auto_patcher(&mut registry, &mut engine)
            .unwrap_err();

        assert!(matches!(err, AutoPatchError::Order(_)));
        assert!(engine.events().is_empty());
    }

    #[test]
    /// A dependent setting shows up only when its unit ends up active
    fn test_setting_follows_run() {
        let mut engine = RecordingEngine::new().failing_on("B");
        let panel = SettingsPanel::new();
        panel.add_setting("Cheats", "Speed", "Movement speed multiplier");
        panel.add_setting("Cheats", "Gravity", "Gravity multiplier");
        let mut registry = registry(
            &[factory!(TestUnit::new(A)), factory!(TestUnit::new(B))],
            &engine.events,
        );
        registry.set_setting_patch_dependence(A, &panel, "Speed").unwrap();
        registry.set_setting_patch_dependence(B, &panel, "Gravity").unwrap();
        assert!(panel.visible_settings().is_empty());

        AutoPatcher::new()
            .start_auto_patcher(&mut registry, &mut engine)
            .unwrap();

        assert_eq!(panel.visible_settings(), ["Speed"]);
    }

    #[test]
    /// The undecided result can't be turned into an active flag
    fn test_none_result_is_invariant_violation() {
        assert!(matches!(
            AutoPatchResult::None.is_patch_active(),
            Err(AutoPatchError::InvariantViolation(_))
        ));
        assert!(AutoPatchResult::Success.is_patch_active().unwrap());
        assert!(!AutoPatchResult::Error.is_patch_active().unwrap());
        assert!(!AutoPatchResult::Disabled.is_patch_active().unwrap());
    }

    #[test]
    /// Listeners stay subscribed across runs
    fn test_listeners_fire_per_run() {
        let mut engine = RecordingEngine::new();
        let mut registry = registry(&[factory!(TestUnit::new(A))], &engine.events);
        let patcher = AutoPatcher::new();

        patcher.start_auto_patcher(&mut registry, &mut engine).unwrap();
        registry.unpatch_unit(A, &mut engine).unwrap();
        patcher.start_auto_patcher(&mut registry, &mut engine).unwrap();

        assert_eq!(finished(&engine.events(), A), [true, true]);
    }
}
