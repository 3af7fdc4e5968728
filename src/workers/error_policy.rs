use std::time::Duration;

use crate::error::HandlerError;

/// What to do with a handler failure in a given category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Run again right away until `max_attempts` is reached.
    Requeue { max_attempts: u32 },
    /// Give up immediately.
    MoveToErrors,
    /// Run again after `delay` until `max_attempts` is reached.
    RetryLater { delay: Duration, max_attempts: u32 },
}

/// Decision for one failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Requeue,
    MoveToErrors,
    RetryLater(Duration),
}

/// Per-handler table mapping error categories to an [`ErrorAction`].
///
/// Built when the handler is registered:
///
/// ```ignore
/// let policy = ErrorPolicy::new()
///     .requeue_on("deadlock", 10)
///     .retry_later_on("rate-limited", Duration::from_secs(30), 5)
///     .move_to_errors_on("validation");
/// ```
///
/// Categories without a rule fall back to requeueing until the bus-wide
/// attempt ceiling. Missing handlers and unreadable payloads go straight to
/// the error sink unless a rule says otherwise.
#[derive(Debug, Clone, Default)]
pub struct ErrorPolicy {
    rules: Vec<(String, ErrorAction)>,
}

impl ErrorPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requeue_on(mut self, category: impl Into<String>, max_attempts: u32) -> Self {
        self.rules
            .push((category.into(), ErrorAction::Requeue { max_attempts }));
        self
    }

    pub fn move_to_errors_on(mut self, category: impl Into<String>) -> Self {
        self.rules.push((category.into(), ErrorAction::MoveToErrors));
        self
    }

    pub fn retry_later_on(
        mut self,
        category: impl Into<String>,
        delay: Duration,
        max_attempts: u32,
    ) -> Self {
        self.rules.push((
            category.into(),
            ErrorAction::RetryLater {
                delay,
                max_attempts,
            },
        ));
        self
    }

    pub fn action_for(&self, category: &str) -> Option<ErrorAction> {
        self.rules
            .iter()
            .find(|(c, _)| c == category)
            .map(|(_, action)| *action)
    }

    /// Decide what happens after the `attempts`-th failed execution.
    pub fn decide(&self, error: &HandlerError, attempts: u32, default_max: u32) -> Continuation {
        let action = match self.action_for(error.category()) {
            Some(action) => action,
            None => match error {
                HandlerError::NoHandler(_) | HandlerError::Deserialization(_) => {
                    ErrorAction::MoveToErrors
                }
                HandlerError::Failed { .. } => ErrorAction::Requeue {
                    max_attempts: default_max,
                },
            },
        };

        match action {
            ErrorAction::Requeue { max_attempts } if attempts < max_attempts => {
                Continuation::Requeue
            }
            ErrorAction::RetryLater {
                delay,
                max_attempts,
            } if attempts < max_attempts => Continuation::RetryLater(delay),
            _ => Continuation::MoveToErrors,
        }
    }
}
