//! Verdicts and the witness decision

use std::fmt;

use serde::Serialize;

use crate::property::PropertyKind;

/// What the backend concluded about the property
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum RunVerdict {
    /// Property violated; `property` is `None` when the backend cannot tell which one
    Violation {
        property: Option<PropertyKind>,
        diagnostic: Option<String>,
    },
    /// Property holds
    Correct,
    /// Backend gave up
    Unknown { reason: String },
    /// A phase failed
    Error { message: String },
}

impl RunVerdict {
    pub fn violation(property: PropertyKind) -> Self {
        RunVerdict::Violation {
            property: Some(property),
            diagnostic: None,
        }
    }

    pub fn unknown(reason: impl Into<String>) -> Self {
        RunVerdict::Unknown {
            reason: reason.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        RunVerdict::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RunVerdict::Error { .. })
    }

    /// Token printed after `RESULT: `
    pub fn result_token(&self) -> String {
        match self {
            RunVerdict::Violation {
                property: Some(property),
                ..
            } => format!("false({})", property.result_tag()),
            RunVerdict::Violation { property: None, .. } => "false".to_string(),
            RunVerdict::Correct => "true".to_string(),
            RunVerdict::Unknown { .. } => "unknown".to_string(),
            RunVerdict::Error { message } => format!("ERROR({message})"),
        }
    }
}

/// Final outcome of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Verdict(RunVerdict),
    Timeout,
}

impl RunOutcome {
    pub fn verdict(&self) -> Option<&RunVerdict> {
        match self {
            RunOutcome::Verdict(verdict) => Some(verdict),
            RunOutcome::Timeout => None,
        }
    }

    pub fn result_token(&self) -> String {
        match self {
            RunOutcome::Verdict(verdict) => verdict.result_token(),
            RunOutcome::Timeout => "timeout".to_string(),
        }
    }

    /// The single `RESULT:` line of a run
    pub fn result_line(&self) -> String {
        format!("RESULT: {}", self.result_token())
    }

    /// Exit code of a completed run: only `ERROR(...)` is a failure
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Verdict(verdict) if verdict.is_error() => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.result_token())
    }
}

/// Kind of witness to request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WitnessKind {
    Violation,
    Correctness,
}

impl WitnessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WitnessKind::Violation => "violation_witness",
            WitnessKind::Correctness => "correctness_witness",
        }
    }
}

/// Decide whether a verdict produces a witness, and which one
pub fn decide_witness(
    verdict: &RunVerdict,
    witnesses_enabled: bool,
    correctness_capable: bool,
) -> Option<WitnessKind> {
    if !witnesses_enabled {
        return None;
    }
    match verdict {
        RunVerdict::Violation { .. } => Some(WitnessKind::Violation),
        RunVerdict::Correct if correctness_capable => Some(WitnessKind::Correctness),
        RunVerdict::Correct | RunVerdict::Unknown { .. } | RunVerdict::Error { .. } => None,
    }
}
