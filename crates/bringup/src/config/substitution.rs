//! `$(arg name)`, `$(env NAME [fallback])` and `$(timestamp [format])` expansion

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Matches `$(kind)` and `$(kind value...)`
static SUBSTITUTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\((\w+)(?:\s+([^)]*))?\)").expect("substitution pattern is valid")
});

/// Nested substitutions are expanded at most this many times
const MAX_PASSES: usize = 10;

/// Values available to launch-file strings.
///
/// Built once before the graph is constructed; every launch spec is resolved
/// against the same immutable context.
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    /// Launch arguments after CLI overrides
    pub args: HashMap<String, String>,
    /// Launch-file environment, consulted before the process environment
    pub env: HashMap<String, String>,
}

impl SubstitutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn with_args(mut self, args: HashMap<String, String>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_envs(mut self, envs: HashMap<String, String>) -> Self {
        self.env.extend(envs);
        self
    }

    /// Expand every pattern in `input`, following nested references
    pub fn substitute(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut current = input.to_string();
        for _ in 0..MAX_PASSES {
            if !SUBSTITUTION_PATTERN.is_match(&current) {
                return Ok(current);
            }
            current = self.substitute_once(&current)?;
        }

        if SUBSTITUTION_PATTERN.is_match(&current) {
            return Err(SubstitutionError::MaxIterationsExceeded(input.to_string()));
        }
        Ok(current)
    }

    /// Expand every string of a list
    pub fn substitute_all(&self, inputs: &[String]) -> Result<Vec<String>, SubstitutionError> {
        inputs.iter().map(|s| self.substitute(s)).collect()
    }

    fn substitute_once(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut error = None;
        let output = SUBSTITUTION_PATTERN.replace_all(input, |caps: &Captures| {
            if error.is_some() {
                return String::new();
            }
            let kind = &caps[1];
            let value = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            self.resolve(kind, value).unwrap_or_else(|e| {
                error = Some(e);
                String::new()
            })
        });

        match error {
            Some(e) => Err(e),
            None => Ok(output.into_owned()),
        }
    }

    fn resolve(&self, kind: &str, value: &str) -> Result<String, SubstitutionError> {
        match kind {
            "arg" => self
                .args
                .get(value)
                .cloned()
                .ok_or_else(|| SubstitutionError::UndefinedArg(value.to_string())),
            "env" => self.resolve_env(value),
            "timestamp" => {
                let format = if value.is_empty() { "%Y%m%d_%H%M%S" } else { value };
                Ok(chrono::Local::now().format(format).to_string())
            }
            _ => Err(SubstitutionError::UnknownType(kind.to_string())),
        }
    }

    /// `NAME` or `NAME fallback`; launch-file env wins over the process env
    fn resolve_env(&self, value: &str) -> Result<String, SubstitutionError> {
        let (name, fallback) = match value.split_once(char::is_whitespace) {
            Some((name, fallback)) => (name, Some(fallback.trim())),
            None => (value, None),
        };

        if let Some(v) = self.env.get(name) {
            return Ok(v.clone());
        }
        match (std::env::var(name), fallback) {
            (Ok(v), _) => Ok(v),
            (Err(_), Some(fallback)) => Ok(fallback.to_string()),
            (Err(_), None) => Err(SubstitutionError::UndefinedEnv(name.to_string())),
        }
    }
}

/// Errors that can occur during substitution
#[derive(Debug, thiserror::Error)]
pub enum SubstitutionError {
    #[error("Unknown substitution type: {0}")]
    UnknownType(String),

    #[error("Undefined argument: {0}")]
    UndefinedArg(String),

    #[error("Undefined environment variable: {0}")]
    UndefinedEnv(String),

    #[error("Maximum substitution iterations exceeded for: {0}")]
    MaxIterationsExceeded(String),
}
