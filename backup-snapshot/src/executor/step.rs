use std::ffi::OsString;
use std::time::Duration;

/// One delegated, independently failing backup action.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub program: OsString,
    pub args: Vec<OsString>,
    /// File inside the snapshot directory receiving the step's stdout.
    pub stdout_file: Option<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, program: impl Into<OsString>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            stdout_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdout_to(mut self, file: impl Into<String>) -> Self {
        self.stdout_file = Some(file.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub name: String,
    pub success: bool,
    pub elapsed: Duration,
}

pub fn all_succeeded(outcomes: &[StepOutcome]) -> bool {
    outcomes.iter().all(|o| o.success)
}

/// Names of failed steps in execution order.
pub fn failed_names(outcomes: &[StepOutcome]) -> Vec<&str> {
    outcomes
        .iter()
        .filter(|o| !o.success)
        .map(|o| o.name.as_str())
        .collect()
}
