//! Per-container operation lock.
//!
//! At most one lifecycle operation is live per container. An operation is
//! finished exactly once, either by its owner through [`Operation::done`] or
//! by its watchdog when nobody finishes it in time. Reusable operations can
//! be joined by a second caller, which pushes the watchdog deadline back.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use corral_common::error::{CorralError, Result};
use corral_common::types::OperationAction;

type OperationMap = HashMap<String, Arc<Operation>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Success,
    Failed(String),
    TimedOut,
}

#[derive(Debug)]
struct OperationState {
    deadline: Instant,
    outcome: Option<Outcome>,
}

/// A live lifecycle operation.
#[derive(Debug)]
pub struct Operation {
    container: String,
    action: OperationAction,
    reusable: bool,
    timeout: Duration,
    registry: Arc<Mutex<OperationMap>>,
    state: Mutex<OperationState>,
    finished: Condvar,
}

impl Operation {
    /// Action this operation performs.
    #[must_use]
    pub const fn action(&self) -> OperationAction {
        self.action
    }

    /// Whether another caller may join this operation.
    #[must_use]
    pub const fn reusable(&self) -> bool {
        self.reusable
    }

    /// Container the operation belongs to.
    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Whether the operation has been finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        lock(&self.state).outcome.is_some()
    }

    /// Pushes the watchdog deadline back by the full timeout.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        if state.outcome.is_none() {
            state.deadline = Instant::now() + self.timeout;
            self.finished.notify_all();
        }
    }

    /// Finishes the operation with `error` (`None` for success).
    ///
    /// Has no effect when the operation is no longer the live one for its
    /// container, so late finishers cannot complete a successor.
    pub fn done(self: &Arc<Self>, error: Option<&CorralError>) {
        let outcome = error.map_or(Outcome::Success, |e| Outcome::Failed(e.to_string()));
        let _ = self.finish(outcome);
    }

    fn finish(self: &Arc<Self>, outcome: Outcome) -> bool {
        let mut ops = lock(&self.registry);
        let current = ops
            .get(&self.container)
            .is_some_and(|live| Arc::ptr_eq(live, self));
        if !current {
            return false;
        }
        let mut state = lock(&self.state);
        if state.outcome.is_some() {
            return false;
        }
        tracing::debug!(
            container = %self.container,
            action = %self.action,
            outcome = ?outcome,
            "operation finished"
        );
        state.outcome = Some(outcome);
        let _ = ops.remove(&self.container);
        self.finished.notify_all();
        true
    }

    /// Blocks until the operation is finished and returns its result.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::OperationTimeout`] when the watchdog fired, or
    /// [`CorralError::OperationFailed`] carrying the finisher's error.
    pub fn wait(&self) -> Result<()> {
        let mut state = lock(&self.state);
        loop {
            if let Some(outcome) = state.outcome.clone() {
                return self.outcome_result(outcome);
            }
            state = self
                .finished
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn outcome_result(&self, outcome: Outcome) -> Result<()> {
        match outcome {
            Outcome::Success => Ok(()),
            Outcome::Failed(message) => Err(CorralError::OperationFailed {
                action: self.action.to_string(),
                message,
            }),
            Outcome::TimedOut => Err(CorralError::OperationTimeout {
                action: self.action.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    fn watchdog(self: Arc<Self>) {
        let mut state = lock(&self.state);
        loop {
            if state.outcome.is_some() {
                return;
            }
            let now = Instant::now();
            if now >= state.deadline {
                break;
            }
            let wait = state.deadline - now;
            state = self
                .finished
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(state);
        if self.finish(Outcome::TimedOut) {
            tracing::error!(
                container = %self.container,
                action = %self.action,
                timeout_secs = self.timeout.as_secs(),
                "operation timed out"
            );
        }
    }
}

/// Registry of live operations, one per container.
#[derive(Debug)]
pub struct OperationRegistry {
    ops: Arc<Mutex<OperationMap>>,
    timeout: Duration,
}

impl OperationRegistry {
    /// Creates a registry whose operations time out after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            ops: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Starts an operation on `container`.
    ///
    /// When an operation is already live and both `reuse` is requested and
    /// that operation is reusable, its watchdog is reset and it is returned.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Busy`] when another operation is live.
    pub fn create(
        &self,
        container: &str,
        action: OperationAction,
        reusable: bool,
        reuse: bool,
    ) -> Result<Arc<Operation>> {
        let mut ops = lock(&self.ops);
        if let Some(live) = ops.get(container) {
            if reuse && live.reusable {
                live.reset();
                tracing::debug!(container, action = %live.action, "operation reused");
                return Ok(Arc::clone(live));
            }
            return Err(CorralError::Busy {
                action: live.action.to_string(),
            });
        }

        let op = Arc::new(Operation {
            container: container.to_string(),
            action,
            reusable,
            timeout: self.timeout,
            registry: Arc::clone(&self.ops),
            state: Mutex::new(OperationState {
                deadline: Instant::now() + self.timeout,
                outcome: None,
            }),
            finished: Condvar::new(),
        });
        let _ = ops.insert(container.to_string(), Arc::clone(&op));
        drop(ops);

        let watched = Arc::clone(&op);
        let spawned = std::thread::Builder::new()
            .name(format!("op-{container}"))
            .spawn(move || watched.watchdog());
        if let Err(e) = spawned {
            op.done(None);
            return Err(CorralError::external("failed to start operation watchdog", e));
        }
        tracing::debug!(container, action = %action, reusable, "operation created");
        Ok(op)
    }

    /// Returns the live operation of `container`. `None` matches any action.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NoOperation`] when nothing is live and
    /// [`CorralError::OperationMismatch`] when another action is live.
    pub fn get(&self, container: &str, action: Option<OperationAction>) -> Result<Arc<Operation>> {
        let ops = lock(&self.ops);
        let live = ops.get(container).ok_or_else(|| CorralError::NoOperation {
            action: action.map_or_else(String::new, |a| a.to_string()),
        })?;
        if let Some(wanted) = action {
            if live.action != wanted {
                return Err(CorralError::OperationMismatch {
                    running: live.action.to_string(),
                    wanted: wanted.to_string(),
                });
            }
        }
        Ok(Arc::clone(live))
    }

    /// Waits for the live operation of `container`, if any.
    ///
    /// # Errors
    ///
    /// Returns the operation's terminal error.
    pub fn wait(&self, container: &str) -> Result<()> {
        let live = lock(&self.ops).get(container).cloned();
        live.map_or(Ok(()), |op| op.wait())
    }

    /// Whether `container` has a live operation.
    #[must_use]
    pub fn is_busy(&self, container: &str) -> bool {
        lock(&self.ops).contains_key(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(ms: u64) -> OperationRegistry {
        OperationRegistry::new(Duration::from_millis(ms))
    }

    #[test]
    fn second_create_is_busy() {
        let ops = registry(5_000);
        let op = ops.create("c1", OperationAction::Start, false, false).expect("first");
        let err = ops
            .create("c1", OperationAction::Start, false, false)
            .unwrap_err();
        assert_eq!(err.to_string(), "container is busy running a start operation");
        op.done(None);
        assert!(!ops.is_busy("c1"));
    }

    #[test]
    fn different_containers_do_not_conflict() {
        let ops = registry(5_000);
        let a = ops.create("a", OperationAction::Start, false, false).expect("a");
        let b = ops.create("b", OperationAction::Start, false, false).expect("b");
        a.done(None);
        b.done(None);
    }

    #[test]
    fn reusable_operations_are_joined() {
        let ops = registry(5_000);
        let first = ops.create("c1", OperationAction::Stop, true, true).expect("shutdown");
        let second = ops.create("c1", OperationAction::Stop, false, true).expect("stop");
        assert!(Arc::ptr_eq(&first, &second));

        // A non-reusable live operation cannot be joined.
        first.done(None);
        let start = ops.create("c1", OperationAction::Start, false, false).expect("start");
        assert!(ops.create("c1", OperationAction::Stop, false, true).is_err());
        start.done(None);
    }

    #[test]
    fn done_is_idempotent_and_ignores_stale_finishers() {
        let ops = registry(5_000);
        let first = ops.create("c1", OperationAction::Stop, false, false).expect("first");
        first.done(None);
        first.done(Some(&CorralError::validation("late")));
        assert!(first.wait().is_ok());

        let second = ops.create("c1", OperationAction::Stop, false, false).expect("second");
        first.done(Some(&CorralError::validation("stale")));
        assert!(ops.is_busy("c1"));
        second.done(None);
    }

    #[test]
    fn waiters_see_the_finishers_error() {
        let ops = registry(5_000);
        let op = ops.create("c1", OperationAction::Stop, false, true).expect("op");
        let waiter = {
            let op = Arc::clone(&op);
            std::thread::spawn(move || op.wait())
        };
        op.done(Some(&CorralError::validation("boom")));
        let err = waiter.join().expect("join").unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn watchdog_fails_and_removes_stuck_operations() {
        let ops = registry(100);
        let op = ops.create("c1", OperationAction::Start, false, false).expect("op");
        let err = op.wait().unwrap_err();
        assert!(matches!(err, CorralError::OperationTimeout { .. }));
        assert!(!ops.is_busy("c1"));
        let next = ops.create("c1", OperationAction::Start, false, false).expect("again");
        next.done(None);
    }

    #[test]
    fn reset_pushes_the_deadline_back() {
        let ops = registry(300);
        let op = ops.create("c1", OperationAction::Stop, true, true).expect("op");
        std::thread::sleep(Duration::from_millis(200));
        let joined = ops.create("c1", OperationAction::Stop, true, true).expect("join");
        std::thread::sleep(Duration::from_millis(200));
        assert!(!joined.is_finished());
        op.done(None);
        assert!(joined.wait().is_ok());
    }

    #[test]
    fn get_checks_the_action() {
        let ops = registry(5_000);
        assert!(matches!(
            ops.get("c1", None).unwrap_err(),
            CorralError::NoOperation { .. }
        ));
        let op = ops.create("c1", OperationAction::Start, false, false).expect("op");
        assert!(ops.get("c1", None).is_ok());
        let err = ops.get("c1", Some(OperationAction::Stop)).unwrap_err();
        assert!(matches!(err, CorralError::OperationMismatch { .. }));
        op.done(None);
        assert!(ops.wait("c1").is_ok());
    }
}
