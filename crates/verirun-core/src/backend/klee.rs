//! KLEE backend
//!
//! KLEE explores the bitcode symbolically and writes one `test*.err` file
//! per error it hits into its output directory. The error files carry the
//! message, the location and the call stack, which is all we need for both
//! the verdict and the counterexample trace.
//!
//! See: <https://klee.github.io/>

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{BackendAdapter, BackendKind, VerifierInput, VerifyContext};
use crate::config::RunConfiguration;
use crate::error::PipelineError;
use crate::integrity::Fingerprint;
use crate::process::Phase;
use crate::property::{Property, PropertyKind};
use crate::toolchain::{EnvVar, PathOp, ResolvedEnvironment};
use crate::verdict::RunVerdict;
use crate::witness::{ExecutionTrace, TraceStep};

/// Directory KLEE writes its test cases to, relative to the working directory
pub const OUTPUT_DIR: &str = "klee-last";

/// Configuration for the KLEE backend
#[derive(Debug, Clone)]
pub struct KleeConfig {
    pub property: Property,
    /// Stop at the first error of a checked kind
    pub exit_on_error: bool,
    /// Extra options to pass through
    pub extra_options: Vec<String>,
}

impl Default for KleeConfig {
    fn default() -> Self {
        Self {
            property: Property::default(),
            exit_on_error: true,
            extra_options: Vec::new(),
        }
    }
}

/// KLEE backend
pub struct KleeBackend {
    config: KleeConfig,
}

impl Default for KleeBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// One parsed `test*.err` file
#[derive(Debug, Clone, PartialEq, Eq)]
struct KleeError {
    message: String,
    file: Option<String>,
    line: Option<u32>,
    /// Innermost frame first, as KLEE prints it
    stack: Vec<TraceStep>,
}

impl KleeBackend {
    pub fn new() -> Self {
        Self {
            config: KleeConfig::default(),
        }
    }

    pub fn with_config(config: KleeConfig) -> Self {
        Self { config }
    }

    pub fn from_run(run: &RunConfiguration) -> Self {
        Self::with_config(KleeConfig {
            property: run.property.clone(),
            exit_on_error: !run.dont_exit_on_error,
            extra_options: run.verifier_params.clone(),
        })
    }

    fn build_args(&self, bitcode: &Path) -> Vec<String> {
        let mut args = vec![
            format!("-output-dir={OUTPUT_DIR}"),
            format!("-entry-point={}", self.config.property.entry),
            "-max-memory=8000".to_string(),
        ];
        if self.config.exit_on_error {
            let mut types: Vec<&str> = Vec::new();
            for kind in &self.config.property.kinds {
                for error_type in error_types(kind) {
                    if !types.contains(error_type) {
                        types.push(error_type);
                    }
                }
            }
            for error_type in types {
                args.push(format!("-exit-on-error-type={error_type}"));
            }
        }
        if self.config.property.contains(&PropertyKind::ValidMemtrack)
            || self.config.property.contains(&PropertyKind::ValidMemcleanup)
        {
            args.push("-check-leaks".to_string());
        }
        args.extend(self.config.extra_options.iter().cloned());
        args.push(bitcode.display().to_string());
        args
    }

    fn parse_result(&self, output: &str, errors: &[KleeError]) -> Option<RunVerdict> {
        if let Some(error) = errors.first() {
            return Some(match classify(&error.message, &self.config.property) {
                Some(kind) => RunVerdict::Violation {
                    property: Some(kind),
                    diagnostic: Some(error.message.clone()),
                },
                None => RunVerdict::unknown(format!("unexpected error: {}", error.message)),
            });
        }

        if output.contains("KLEE: done: completed paths") {
            let partial = partial_paths_regex()
                .captures(output)
                .and_then(|caps| caps[1].parse::<u64>().ok())
                .unwrap_or(0);
            if partial > 0 || output.contains("HaltTimer invoked") {
                return Some(RunVerdict::unknown("exploration incomplete"));
            }
            return Some(RunVerdict::Correct);
        }

        None
    }
}

/// KLEE error types that correspond to a property
fn error_types(kind: &PropertyKind) -> &'static [&'static str] {
    match kind {
        PropertyKind::UnreachCall { .. } | PropertyKind::Ltl(_) => &["Assert", "Abort"],
        PropertyKind::ValidDeref => &["Ptr"],
        PropertyKind::ValidFree => &["Free"],
        PropertyKind::ValidMemtrack | PropertyKind::ValidMemcleanup => &["Leak"],
        PropertyKind::NoOverflow | PropertyKind::UndefinedBehavior => &["Overflow"],
        PropertyKind::Termination => &[],
    }
}

/// Map an error message to the checked property it violates
fn classify(message: &str, property: &Property) -> Option<PropertyKind> {
    let lower = message.to_ascii_lowercase();
    let candidates: Vec<PropertyKind> = if lower.contains("assertion fail")
        || lower.contains("reach_error")
        || lower.contains("abort")
    {
        property
            .kinds
            .iter()
            .filter(|k| matches!(k, PropertyKind::UnreachCall { .. } | PropertyKind::Ltl(_)))
            .cloned()
            .collect()
    } else if lower.contains("memory leak") || lower.contains("memleak") {
        vec![PropertyKind::ValidMemtrack, PropertyKind::ValidMemcleanup]
    } else if lower.contains("free") {
        vec![PropertyKind::ValidFree]
    } else if lower.contains("out of bound")
        || lower.contains("null")
        || lower.contains("invalid pointer")
        || lower.contains("memory error")
    {
        vec![PropertyKind::ValidDeref]
    } else if lower.contains("overflow") {
        vec![PropertyKind::NoOverflow, PropertyKind::UndefinedBehavior]
    } else {
        Vec::new()
    };

    candidates.into_iter().find(|kind| property.contains(kind))
}

fn stack_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*#\d+\s+in\s+([A-Za-z_][\w.$]*)\s*\(.*?\)(?:\s+at\s+(.+):(\d+))?\s*$")
            .expect("valid stack regex")
    })
}

fn partial_paths_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"partially completed paths = (\d+)").expect("valid partial paths regex")
    })
}

fn parse_err_file(text: &str) -> KleeError {
    let mut error = KleeError {
        message: String::new(),
        file: None,
        line: None,
        stack: Vec::new(),
    };
    let mut in_stack = false;
    for line in text.lines() {
        if in_stack {
            if let Some(caps) = stack_line_regex().captures(line) {
                error.stack.push(TraceStep {
                    function: caps[1].to_string(),
                    file: caps.get(2).map(|m| m.as_str().to_string()),
                    line: caps.get(3).and_then(|m| m.as_str().parse().ok()),
                    note: None,
                });
                continue;
            }
            if !line.starts_with(char::is_whitespace) {
                in_stack = false;
            }
        }
        if let Some(rest) = line.strip_prefix("Error:") {
            error.message = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("File:") {
            error.file = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Line:") {
            error.line = rest.trim().parse().ok();
        } else if line.starts_with("Stack:") {
            in_stack = true;
        }
    }
    error
}

/// Error files in `dir`, sorted by test number
fn read_errors(dir: &Path) -> Vec<KleeError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "err"))
        .collect();
    files.sort();

    files
        .iter()
        .filter_map(|path| match std::fs::read_to_string(path) {
            Ok(text) => Some(parse_err_file(&text)),
            Err(e) => {
                debug!("cannot read {}: {}", path.display(), e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl BackendAdapter for KleeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Klee
    }

    fn executable(&self) -> &'static str {
        "klee"
    }

    fn required_libraries(&self) -> Vec<&'static str> {
        vec!["libkleeRuntest.so"]
    }

    fn extend_environment(&self, env: &mut ResolvedEnvironment) {
        let runtime = env.install_root().join("lib").join("klee").join("runtime");
        env.push(PathOp::prepend(EnvVar::LdLibraryPath, vec![runtime]));
    }

    fn fingerprints(&self) -> Vec<Fingerprint> {
        vec![Fingerprint::llvm(self.executable(), self.toolchain_version())]
    }

    async fn verify(&self, ctx: &VerifyContext<'_>) -> Result<RunVerdict, PipelineError> {
        let bitcode = match ctx.input {
            VerifierInput::Bitcode(path) => path,
            VerifierInput::Sources(_) => {
                return Ok(RunVerdict::error("klee needs bitcode input"));
            }
        };

        let args = self.build_args(bitcode);
        let output = ctx.runner.run(self.executable(), &args).await?;
        let errors = read_errors(&ctx.workdir.join(OUTPUT_DIR));
        let combined = output.combined();
        debug!("KLEE output: {}", combined.trim());

        match self.parse_result(&combined, &errors) {
            Some(verdict) => Ok(verdict),
            None if !output.success() => Err(PipelineError::ToolFailed {
                phase: Phase::Verify,
                tool: self.executable().to_string(),
                status: output.status.to_string(),
                stderr: output.stderr,
            }),
            None => Ok(RunVerdict::unknown("klee gave no verdict")),
        }
    }

    fn describe_violation(&self, workdir: &Path) -> Option<String> {
        let error = read_errors(&workdir.join(OUTPUT_DIR)).into_iter().next()?;
        let mut text = format!("Error: {}", error.message);
        if let Some(file) = &error.file {
            text.push_str(&format!("\nFile: {file}"));
        }
        if let Some(line) = error.line {
            text.push_str(&format!("\nLine: {line}"));
        }
        Some(text)
    }

    fn execution_trace(&self, workdir: &Path) -> Option<ExecutionTrace> {
        let error = read_errors(&workdir.join(OUTPUT_DIR)).into_iter().next()?;
        let message = error.message;
        let mut steps = error.stack;
        if steps.is_empty() {
            return None;
        }
        steps.reverse();
        if let Some(last) = steps.last_mut() {
            last.note = Some(message);
        }
        Some(ExecutionTrace { steps })
    }
}
