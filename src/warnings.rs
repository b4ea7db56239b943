use crate::config;

pub(crate) enum RuntimeWarning<'a> {
    /// A handle of a non-blocking operation was dropped without wait or test
    DroppedHandle(&'a str),
    /// A collective call was made from inside a task body
    BlockingCall(&'a str),
    /// A blocking wait exceeded the deadlock timeout
    DeadlockTimeout(&'a str, f64),
}

impl<'a> RuntimeWarning<'a> {
    fn print_warning(&self) -> bool {
        if config().runtime_warnings.unwrap_or(true) {
            match self {
                RuntimeWarning::DroppedHandle(_) | RuntimeWarning::BlockingCall(_) => true,
                RuntimeWarning::DeadlockTimeout(_, elapsed) => {
                    config().deadlock_timeout > 0.0 && *elapsed > config().deadlock_timeout
                }
            }
        } else {
            false
        }
    }

    pub(crate) fn print(self) {
        if self.print_warning() {
            match self {
                RuntimeWarning::DroppedHandle(what) => {
                    tracing::warn!(
                        "[DART WARNING] dropping {what} that was never waited on or tested. \
                        The operation completes at drop; set DART_RUNTIME_WARNINGS=false to disable this warning."
                    )
                }
                RuntimeWarning::BlockingCall(func) => {
                    tracing::warn!(
                        "[DART WARNING] {func} is a collective operation and was called from inside a task, \
                        this deadlocks unless every unit calls it from a task in the same order."
                    )
                }
                RuntimeWarning::DeadlockTimeout(func, elapsed) => {
                    tracing::warn!(
                        "[DART WARNING][{:?}] {func} has been waiting for {elapsed:.1} seconds. Potential deadlock detected. \
                        Collective operations require every member of the team to enter them in the same order. \
                        The timeout can be set via DART_DEADLOCK_TIMEOUT, the current timeout is {} seconds.",
                        std::thread::current().id(),
                        config().deadlock_timeout
                    )
                }
            }
        }
    }
}

/// Tracks how long a blocking wait has been spinning and warns once per timeout period
pub(crate) struct DeadlockTimer {
    what: &'static str,
    start: std::time::Instant,
    last_warning: std::time::Instant,
}

impl DeadlockTimer {
    pub(crate) fn new(what: &'static str) -> DeadlockTimer {
        let now = std::time::Instant::now();
        DeadlockTimer {
            what,
            start: now,
            last_warning: now,
        }
    }

    pub(crate) fn check(&mut self) {
        if self.last_warning.elapsed().as_secs_f64() > config().deadlock_timeout {
            RuntimeWarning::DeadlockTimeout(self.what, self.start.elapsed().as_secs_f64()).print();
            self.last_warning = std::time::Instant::now();
        }
    }
}
