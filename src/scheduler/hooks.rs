//! Enqueue and perform hooks.
//!
//! Hooks are plain closures registered before the queue is built. The
//! `before_*` and `after_perform` hooks may veto; a veto is a normal outcome,
//! never an error.

use std::sync::Arc;

use serde_json::Value;

use super::job::Job;
use crate::error::JobError;

/// Answer of a hook that may veto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Proceed,
    Veto,
}

impl HookOutcome {
    pub fn is_veto(self) -> bool {
        self == HookOutcome::Veto
    }
}

/// What enqueue hooks see.
#[derive(Debug, Clone, Copy)]
pub struct EnqueueEvent<'a> {
    pub class: &'a str,
    pub args: &'a Value,
    pub queue: &'a str,
    pub id: &'a str,
}

type EnqueueGate = Arc<dyn Fn(&EnqueueEvent<'_>) -> HookOutcome + Send + Sync>;
type EnqueueObserver = Arc<dyn Fn(&EnqueueEvent<'_>) + Send + Sync>;
type PerformGate = Arc<dyn Fn(&Job) -> HookOutcome + Send + Sync>;
type FailureObserver = Arc<dyn Fn(&JobError, &Job) + Send + Sync>;

/// Registered hooks, run in registration order.
#[derive(Clone, Default)]
pub struct Hooks {
    before_enqueue: Vec<EnqueueGate>,
    after_enqueue: Vec<EnqueueObserver>,
    before_perform: Vec<PerformGate>,
    after_perform: Vec<PerformGate>,
    on_failure: Vec<FailureObserver>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_before_enqueue<F>(mut self, hook: F) -> Self
    where
        F: Fn(&EnqueueEvent<'_>) -> HookOutcome + Send + Sync + 'static,
    {
        self.before_enqueue.push(Arc::new(hook));
        self
    }

    pub fn with_after_enqueue<F>(mut self, hook: F) -> Self
    where
        F: Fn(&EnqueueEvent<'_>) + Send + Sync + 'static,
    {
        self.after_enqueue.push(Arc::new(hook));
        self
    }

    pub fn with_before_perform<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Job) -> HookOutcome + Send + Sync + 'static,
    {
        self.before_perform.push(Arc::new(hook));
        self
    }

    pub fn with_after_perform<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Job) -> HookOutcome + Send + Sync + 'static,
    {
        self.after_perform.push(Arc::new(hook));
        self
    }

    pub fn with_on_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&JobError, &Job) + Send + Sync + 'static,
    {
        self.on_failure.push(Arc::new(hook));
        self
    }

    /// Runs `before_enqueue` hooks, stopping at the first veto.
    pub fn before_enqueue(&self, event: &EnqueueEvent<'_>) -> HookOutcome {
        first_veto(self.before_enqueue.iter().map(|hook| hook(event)))
    }

    pub fn after_enqueue(&self, event: &EnqueueEvent<'_>) {
        for hook in &self.after_enqueue {
            hook(event);
        }
    }

    pub fn before_perform(&self, job: &Job) -> HookOutcome {
        first_veto(self.before_perform.iter().map(|hook| hook(job)))
    }

    pub fn after_perform(&self, job: &Job) -> HookOutcome {
        first_veto(self.after_perform.iter().map(|hook| hook(job)))
    }

    pub fn on_failure(&self, error: &JobError, job: &Job) {
        for hook in &self.on_failure {
            hook(error, job);
        }
    }
}

fn first_veto(mut outcomes: impl Iterator<Item = HookOutcome>) -> HookOutcome {
    if outcomes.any(HookOutcome::is_veto) {
        HookOutcome::Veto
    } else {
        HookOutcome::Proceed
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before_enqueue", &self.before_enqueue.len())
            .field("after_enqueue", &self.after_enqueue.len())
            .field("before_perform", &self.before_perform.len())
            .field("after_perform", &self.after_perform.len())
            .field("on_failure", &self.on_failure.len())
            .finish()
    }
}
