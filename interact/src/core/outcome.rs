//! Scored test outcomes and the messages that explain them.
//!
//! An [`Outcome`] is what every test body produces. Its score is either set
//! directly or derived from the score deltas carried by its [`Message`]s via
//! [`Outcome::calculate_score`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use minijinja::Environment;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

static TEMPLATES: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env
});

/// A single piece of feedback attached to an [`Outcome`].
///
/// Messages are immutable once built. The template is rendered lazily with
/// `minijinja`: named arguments are available as `{{ name }}`, positional
/// arguments as `{{ args[0] }}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    template: String,
    args: Vec<Value>,
    named: BTreeMap<String, Value>,
    score_delta: Option<f64>,
    kind: Option<String>,
}

impl Message {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            args: Vec::new(),
            named: BTreeMap::new(),
            score_delta: None,
            kind: None,
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Serialize) -> Self {
        self.args.push(to_value(value));
        self
    }

    /// Set a named argument.
    pub fn named(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        self.named.insert(name.into(), to_value(value));
        self
    }

    /// Score change applied by [`Outcome::calculate_score`].
    pub fn delta(mut self, score_delta: f64) -> Self {
        self.score_delta = Some(score_delta);
        self
    }

    /// Machine-readable message category (e.g. `interact/filesexist/basic_files_exist`).
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn named_arg(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    pub fn score_delta(&self) -> Option<f64> {
        self.score_delta
    }

    pub fn message_kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Substitute the arguments into the template.
    ///
    /// A template that fails to render is returned verbatim.
    pub fn render(&self) -> String {
        let mut ctx = serde_json::Map::new();
        for (name, value) in &self.named {
            ctx.insert(name.clone(), value.clone());
        }
        ctx.insert("args".to_string(), Value::Array(self.args.clone()));

        match TEMPLATES.render_str(&self.template, Value::Object(ctx)) {
            Ok(text) => text,
            Err(err) => {
                debug!(err = %err, template = %self.template, "message template failed to render");
                self.template.clone()
            }
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Optional parameters for [`Outcome::calculate_score`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreOptions {
    /// Score before deltas are applied. Defaults to the cap.
    pub starting_score: Option<f64>,
    /// Replaces the outcome's cap when given.
    pub cap: Option<f64>,
    /// Lower clamp for the final score.
    pub min_score: Option<f64>,
}

impl ScoreOptions {
    pub fn min_score(min_score: f64) -> Self {
        Self {
            min_score: Some(min_score),
            ..Self::default()
        }
    }
}

/// The scored result of one test.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    brief: String,
    score: Option<f64>,
    cap: Option<f64>,
    messages: Vec<Message>,
    default_text: String,
    bulleted: bool,
}

impl Outcome {
    /// Create an unevaluated outcome. The cap may be filled in later.
    pub fn new(brief: impl Into<String>, cap: Option<f64>, default_text: impl Into<String>) -> Self {
        Self {
            brief: brief.into(),
            score: None,
            cap,
            messages: Vec::new(),
            default_text: default_text.into(),
            bulleted: true,
        }
    }

    pub fn brief(&self) -> &str {
        &self.brief
    }

    pub fn score(&self) -> Option<f64> {
        self.score
    }

    pub fn cap(&self) -> Option<f64> {
        self.cap
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn default_text(&self) -> &str {
        &self.default_text
    }

    pub fn set_score(&mut self, score: f64) -> &mut Self {
        self.score = Some(score);
        self
    }

    pub fn set_cap(&mut self, cap: f64) -> &mut Self {
        self.cap = Some(cap);
        self
    }

    /// Render messages without the ` * ` bullet prefix.
    pub fn set_bulleted(&mut self, bulleted: bool) -> &mut Self {
        self.bulleted = bulleted;
        self
    }

    pub fn add_message(&mut self, message: Message) -> &mut Self {
        self.messages.push(message);
        self
    }

    /// Mark as fully passing (score = cap, or 1 without a cap) or failing (0).
    pub fn set_passing(&mut self, passing: bool) -> &mut Self {
        self.score = Some(if passing { self.cap.unwrap_or(1.0) } else { 0.0 });
        self
    }

    /// Derive the score from the message deltas.
    ///
    /// `score = starting_score + sum(deltas)`, where `starting_score` defaults
    /// to the cap, clamped from below by `min_score`. Calling this again with
    /// the same options and messages yields the same score.
    pub fn calculate_score(&mut self, options: ScoreOptions) -> &mut Self {
        if let Some(cap) = options.cap {
            self.cap = Some(cap);
        }
        let start = options.starting_score.or(self.cap).unwrap_or(0.0);
        let deltas: f64 = self.messages.iter().filter_map(Message::score_delta).sum();
        let mut score = start + deltas;
        if let Some(min_score) = options.min_score
            && score < min_score
        {
            score = min_score;
        }
        self.score = Some(score);
        self
    }

    /// Any non-zero score passes, negative scores included. Unscored outcomes fail.
    pub fn is_passing(&self) -> bool {
        self.score.is_some_and(|score| score != 0.0)
    }

    /// False for outcomes with neither a score nor messages.
    pub fn is_evaluated(&self) -> bool {
        self.score.is_some() || !self.messages.is_empty()
    }

    /// Render the outcome as text, optionally starting with the status line.
    pub fn render(&self, with_status: bool) -> String {
        let mut lines: Vec<String> = Vec::new();

        // Partial credit keeps its fraction ("2.5"); whole scores print without one.
        if with_status && let Some(score) = self.score {
            let mut status = format!("Score: {score}");
            if let Some(cap) = self.cap
                && cap != 0.0
            {
                status.push_str(&format!(" out of {cap}"));
            }
            lines.push(status);
            lines.push(String::new());
        }

        if !self.brief.is_empty() {
            lines.push(self.brief.clone());
            lines.push(String::new());
        }

        if !self.messages.is_empty() {
            let prefix = if self.bulleted { " * " } else { "" };
            for message in &self.messages {
                lines.push(format!("{prefix}{message}"));
            }
            lines.push(String::new());
        } else if !self.default_text.is_empty() {
            lines.push(self.default_text.clone());
            lines.push(String::new());
        }

        lines.pop();
        lines.join("\n")
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(true))
    }
}
