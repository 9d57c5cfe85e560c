//! Crash classification seam.
//!
//! The importer asks a [`Classifier`] for a verdict whenever a crash database
//! row carries no crash type. Real triage logic lives outside this crate; the
//! built-in [`ExitStatusClassifier`] only looks at how the target exited.

use serde::{Deserialize, Serialize};

/// Raw outcome of running a target on one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashInput {
    /// Captured output of the target (usually stderr with a sanitizer report).
    pub output: String,
    /// Process exit code. Negative values are signal numbers.
    pub exit_code: i32,
    /// Epoch seconds when the input ran.
    pub timestamp: i64,
}

/// Classification of a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(rename = "type")]
    pub crash_type: String,
    pub is_crash: bool,
    pub is_security_issue: bool,
    pub should_ignore: bool,
    pub stacktrace: String,
}

/// Pluggable crash analyzer.
pub trait Classifier: Send + Sync {
    fn classify(&self, input: &CrashInput) -> Verdict;
}

/// Classifies by exit status alone.
///
/// Exit code 0 is ignored; a fatal signal (negative code, or a shell style
/// `128 + signal` code) is a crash named after the signal; anything else is
/// reported as a non-crash exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitStatusClassifier;

impl Classifier for ExitStatusClassifier {
    fn classify(&self, input: &CrashInput) -> Verdict {
        let stacktrace = input.output.trim_end().to_string();
        if input.exit_code == 0 {
            return Verdict {
                crash_type: "NONE".to_string(),
                is_crash: false,
                is_security_issue: false,
                should_ignore: true,
                stacktrace,
            };
        }
        match signal_number(input.exit_code) {
            Some(signal) => {
                let (name, is_crash) = describe_signal(signal);
                Verdict {
                    crash_type: name,
                    is_crash,
                    is_security_issue: false,
                    should_ignore: false,
                    stacktrace,
                }
            }
            None => Verdict {
                crash_type: format!("EXIT_{}", input.exit_code),
                is_crash: false,
                is_security_issue: false,
                should_ignore: false,
                stacktrace,
            },
        }
    }
}

fn signal_number(exit_code: i32) -> Option<i32> {
    match exit_code {
        code if code < 0 => code.checked_neg(),
        code if (129..=192).contains(&code) => Some(code - 128),
        _ => None,
    }
}

fn describe_signal(signal: i32) -> (String, bool) {
    let name = match signal {
        4 => "ILL",
        6 => "ABRT",
        7 => "BUS",
        8 => "FPE",
        9 => "KILL",
        11 => "SEGV",
        _ => return (format!("SIGNAL_{signal}"), false),
    };
    (name.to_string(), signal != 9)
}
