//! Job class registry.
//!
//! Maps the class identifier carried in a payload to a factory producing the
//! unit of work that runs it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::hooks::HookOutcome;
use super::job::Job;
use crate::error::JobError;

/// Executable side of a job class.
///
/// A fresh unit is created for every job run.
#[async_trait]
pub trait JobUnit: Send {
    /// Runs before `perform`. Returning `Veto` skips the job.
    async fn set_up(&mut self, _job: &Job) -> anyhow::Result<HookOutcome> {
        Ok(HookOutcome::Proceed)
    }

    async fn perform(&mut self, job: &Job) -> anyhow::Result<()>;

    async fn tear_down(&mut self, _job: &Job) -> anyhow::Result<()> {
        Ok(())
    }
}

type UnitFactory = Arc<dyn Fn() -> Box<dyn JobUnit> + Send + Sync>;

#[derive(Clone)]
enum Registration {
    Runnable(UnitFactory),
    /// Known identifier without an entry point.
    Declared,
}

/// Registry of job classes.
#[derive(Clone, Default)]
pub struct JobRegistry {
    classes: HashMap<String, Registration>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `class` with a factory for its unit.
    pub fn register<F, U>(&mut self, class: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> U + Send + Sync + 'static,
        U: JobUnit + 'static,
    {
        let factory: UnitFactory = Arc::new(move || Box::new(factory()) as Box<dyn JobUnit>);
        self.classes
            .insert(class.into(), Registration::Runnable(factory));
        self
    }

    /// Records `class` as known but not runnable. Jobs of that class fail
    /// with `JobError::MissingPerform`.
    pub fn declare(&mut self, class: impl Into<String>) -> &mut Self {
        self.classes.insert(class.into(), Registration::Declared);
        self
    }

    pub fn contains(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    /// Creates a unit for `class`.
    ///
    /// # Errors
    ///
    /// `JobError::ClassNotFound` for unknown classes and
    /// `JobError::MissingPerform` for declared ones.
    pub fn resolve(&self, class: &str) -> Result<Box<dyn JobUnit>, JobError> {
        match self.classes.get(class) {
            Some(Registration::Runnable(factory)) => Ok(factory()),
            Some(Registration::Declared) => Err(JobError::MissingPerform(class.to_string())),
            None => Err(JobError::ClassNotFound(class.to_string())),
        }
    }

    /// Registered class identifiers, sorted.
    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.classes.keys().cloned().collect();
        classes.sort();
        classes
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}
