//! Dependency-ordered execution of test units.
//!
//! Tests are registered with the names of the tests they depend on. A run is
//! a depth-first walk over the dependency graph with explicit temporary and
//! permanent marks:
//!
//! - every body runs at most once per [`Scheduler::run_all`],
//! - a test whose dependencies did not all pass gets a blocked outcome instead
//!   of running its body,
//! - reaching a test that is still on the walk stack aborts the run with
//!   [`SchedulerError::CyclicDependency`] before any test on the cycle runs.

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::outcome::{Message, Outcome, ScoreOptions};
use crate::error::SchedulerError;

/// Cap given to blocked outcomes, independent of the blocked test's own cap.
pub const BLOCKED_CAP: f64 = 10.0;

pub const BLOCKED_BRIEF: &str = "This test will only be run if all of the other tests it depends on \
                                 pass first. Fix those tests *before* worrying about this one.";

pub const BLOCKED_MESSAGE_KIND: &str = "interact/scheduler/blocked_by_dependency";

/// Handle to a registered test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestId(usize);

impl TestId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A test body. Errors are contained as a failing outcome for that test.
pub type TestBody<'a> = Box<dyn FnMut() -> Result<Outcome> + 'a>;

/// A registered test and its latest result.
pub struct TestUnit<'a> {
    name: String,
    dependencies: Vec<TestId>,
    body: TestBody<'a>,
    result: Option<Outcome>,
}

impl TestUnit<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[TestId] {
        &self.dependencies
    }

    pub fn result(&self) -> Option<&Outcome> {
        self.result.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Registry and executor of interdependent tests.
#[derive(Default)]
pub struct Scheduler<'a> {
    units: Vec<TestUnit<'a>>,
}

impl<'a> Scheduler<'a> {
    pub fn new() -> Self {
        Self { units: Vec::new() }
    }

    /// Register a test. The body is not executed here.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        dependencies: &[TestId],
        body: F,
    ) -> Result<TestId, SchedulerError>
    where
        F: FnMut() -> Result<Outcome> + 'a,
    {
        for dependency in dependencies {
            self.check_id(*dependency)?;
        }
        let id = TestId(self.units.len());
        self.units.push(TestUnit {
            name: name.into(),
            dependencies: dependencies.to_vec(),
            body: Box::new(body),
            result: None,
        });
        debug!(test = %self.units[id.0].name, id = id.0, "test registered");
        Ok(id)
    }

    /// Declare an additional dependency, e.g. on a test registered later.
    pub fn depend_on(&mut self, test: TestId, dependency: TestId) -> Result<(), SchedulerError> {
        self.check_id(test)?;
        self.check_id(dependency)?;
        let unit = &mut self.units[test.0];
        if !unit.dependencies.contains(&dependency) {
            unit.dependencies.push(dependency);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn name(&self, id: TestId) -> Option<&str> {
        self.units.get(id.0).map(TestUnit::name)
    }

    pub fn outcome(&self, id: TestId) -> Option<&Outcome> {
        self.units.get(id.0).and_then(TestUnit::result)
    }

    /// All tests in registration order.
    pub fn units(&self) -> impl Iterator<Item = (TestId, &TestUnit<'a>)> {
        self.units.iter().enumerate().map(|(index, unit)| (TestId(index), unit))
    }

    /// Run every registered test in dependency order.
    ///
    /// Results from a previous run are discarded first. On a cycle, tests that
    /// already finished keep their results and the rest stay unset.
    #[instrument(skip_all, fields(tests = self.units.len()))]
    pub fn run_all(&mut self) -> Result<(), SchedulerError> {
        for unit in &mut self.units {
            unit.result = None;
        }

        let mut marks = vec![Mark::Unvisited; self.units.len()];
        let mut stack = Vec::new();
        for index in 0..self.units.len() {
            self.visit(TestId(index), &mut marks, &mut stack)?;
        }

        let passed = self
            .units
            .iter()
            .filter(|unit| unit.result.as_ref().is_some_and(Outcome::is_passing))
            .count();
        info!(passed, total = self.units.len(), "tests finished");
        Ok(())
    }

    fn visit(
        &mut self,
        id: TestId,
        marks: &mut [Mark],
        stack: &mut Vec<TestId>,
    ) -> Result<(), SchedulerError> {
        match marks[id.0] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                let start = stack.iter().position(|entry| *entry == id).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..]
                    .iter()
                    .map(|entry| self.units[entry.0].name.clone())
                    .collect();
                cycle.push(self.units[id.0].name.clone());
                warn!(cycle = ?cycle, "cyclic dependency detected");
                return Err(SchedulerError::CyclicDependency { cycle });
            }
            Mark::Unvisited => {}
        }

        marks[id.0] = Mark::InProgress;
        stack.push(id);

        let dependencies = self.units[id.0].dependencies.clone();
        let mut failed = Vec::new();
        for dependency in dependencies {
            self.visit(dependency, marks, stack)?;
            let passing = self.units[dependency.0]
                .result
                .as_ref()
                .is_some_and(Outcome::is_passing);
            if !passing {
                failed.push(dependency);
            }
        }

        stack.pop();
        marks[id.0] = Mark::Done;

        let outcome = if failed.is_empty() {
            self.execute(id)
        } else {
            let names: Vec<&str> = failed
                .iter()
                .map(|dependency| self.units[dependency.0].name.as_str())
                .collect();
            info!(test = %self.units[id.0].name, blocked_by = ?names, "test blocked");
            blocked_outcome(&names)
        };
        self.units[id.0].result = Some(outcome);
        Ok(())
    }

    fn execute(&mut self, id: TestId) -> Outcome {
        let unit = &mut self.units[id.0];
        debug!(test = %unit.name, "running test");
        match (unit.body)() {
            Ok(outcome) => normalize(outcome),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(test = %unit.name, err = %message, "test body failed");
                errored_outcome(&message)
            }
        }
    }

    fn check_id(&self, id: TestId) -> Result<(), SchedulerError> {
        if id.0 < self.units.len() {
            Ok(())
        } else {
            Err(SchedulerError::UnknownTest(id.0))
        }
    }
}

/// Outcome recorded for a test whose dependencies did not pass.
pub fn blocked_outcome(failed_dependencies: &[&str]) -> Outcome {
    let mut outcome = Outcome::new(BLOCKED_BRIEF, Some(BLOCKED_CAP), "");
    for name in failed_dependencies {
        outcome.add_message(
            Message::new("Dependency *{{ dependency }}* failed.")
                .named("dependency", name)
                .kind(BLOCKED_MESSAGE_KIND),
        );
    }
    outcome.set_score(0.0);
    outcome
}

fn errored_outcome(error: &str) -> Outcome {
    let mut outcome = Outcome::new(
        "This test could not be completed because of an internal error.",
        None,
        "",
    );
    outcome.add_message(Message::new("{{ error }}").named("error", error));
    outcome.set_score(0.0);
    outcome
}

/// Score outcomes that carry messages but were never scored.
fn normalize(mut outcome: Outcome) -> Outcome {
    if outcome.score().is_none() && !outcome.messages().is_empty() {
        outcome.calculate_score(ScoreOptions::default());
    }
    outcome
}
