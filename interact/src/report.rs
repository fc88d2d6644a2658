//! Aggregate outcomes into the final report.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::outcome::Outcome;
use crate::core::scheduler::Scheduler;

const SEPARATOR: &str = "-------";

/// One test in the wire report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub name: String,
    pub score: f64,
    pub max_score: f64,
    /// Outcome text without the status line.
    pub message: String,
    /// Outcome text with the status line, for the human-readable report.
    #[serde(skip)]
    pub display: String,
}

/// Final report of a harness run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub score: f64,
    pub max_score: f64,
    pub tests: Vec<TestReport>,
}

impl Report {
    /// Build a report from named outcomes in order. Unevaluated outcomes are skipped.
    pub fn from_outcomes<'o, I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = (&'o str, Option<&'o Outcome>)>,
    {
        let mut tests = Vec::new();
        for (name, outcome) in outcomes {
            let Some(outcome) = outcome.filter(|outcome| outcome.is_evaluated()) else {
                warn!(test = name, "skipping unevaluated test in report");
                continue;
            };
            tests.push(TestReport {
                name: name.to_string(),
                score: outcome.score().unwrap_or(0.0),
                max_score: outcome.cap().unwrap_or(0.0),
                message: outcome.render(false),
                display: outcome.render(true),
            });
        }
        let score = tests.iter().map(|test| test.score).sum();
        let max_score = tests.iter().map(|test| test.max_score).sum();
        Self {
            score,
            max_score,
            tests,
        }
    }

    /// Every test of `scheduler` in registration order.
    pub fn from_scheduler(scheduler: &Scheduler<'_>) -> Self {
        Self::from_outcomes(
            scheduler
                .units()
                .map(|(_, unit)| (unit.name(), unit.result())),
        )
    }

    /// Replace the summed totals with explicit values where given.
    pub fn with_totals(mut self, score: Option<f64>, max_score: Option<f64>) -> Self {
        if let Some(score) = score {
            self.score = score;
        }
        if let Some(max_score) = max_score {
            self.max_score = max_score;
        }
        self
    }

    /// Each outcome with its status line, separated by `-------`, then the totals.
    pub fn render_human(&self) -> String {
        let mut text = String::new();
        for test in &self.tests {
            let _ = writeln!(text, "{}", test.display);
            let _ = writeln!(text, "{SEPARATOR}");
        }
        let _ = writeln!(text, "Final result: {} out of {}", self.score, self.max_score);
        text
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
