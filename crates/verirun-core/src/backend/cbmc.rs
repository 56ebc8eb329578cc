//! CBMC backend
//!
//! CBMC reads C, so the final bitcode is turned back into C with `llvm2c`
//! first. Nondeterministic values must survive that round trip as
//! `__VERIFIER_nondet_*` calls, which is why the registry forces explicit
//! symbolic mode for this backend.
//!
//! See: <https://www.cprover.org/cbmc/>

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{BackendAdapter, BackendKind, VerifierInput, VerifyContext};
use crate::config::RunConfiguration;
use crate::error::PipelineError;
use crate::process::Phase;
use crate::property::{Property, PropertyKind};
use crate::verdict::RunVerdict;

/// Configuration for the CBMC backend
#[derive(Debug, Clone)]
pub struct CbmcConfig {
    pub property: Property,
    pub is_32bit: bool,
    pub stop_on_fail: bool,
    pub extra_options: Vec<String>,
}

impl Default for CbmcConfig {
    fn default() -> Self {
        Self {
            property: Property::default(),
            is_32bit: false,
            stop_on_fail: true,
            extra_options: Vec::new(),
        }
    }
}

/// CBMC backend
pub struct CbmcBackend {
    config: CbmcConfig,
}

impl Default for CbmcBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CbmcBackend {
    pub fn new() -> Self {
        Self {
            config: CbmcConfig::default(),
        }
    }

    pub fn with_config(config: CbmcConfig) -> Self {
        Self { config }
    }

    pub fn from_run(run: &RunConfiguration) -> Self {
        Self::with_config(CbmcConfig {
            property: run.property.clone(),
            is_32bit: run.is_32bit,
            stop_on_fail: !run.dont_exit_on_error,
            extra_options: run.verifier_params.clone(),
        })
    }

    /// Definitions turning calls of unreachable functions into failed assertions
    fn stubs(&self) -> Option<String> {
        let mut code = String::new();
        for kind in &self.config.property.kinds {
            if let PropertyKind::UnreachCall { function } = kind {
                code.push_str(&format!(
                    "void {function}(void) {{ __CPROVER_assert(0, \"{function} reachable\"); }}\n"
                ));
            }
        }
        (!code.is_empty()).then_some(code)
    }

    fn build_args(&self, files: &[PathBuf]) -> Vec<String> {
        let mut args: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
        args.push(if self.config.is_32bit { "--32" } else { "--64" }.to_string());
        args.push("--function".to_string());
        args.push(self.config.property.entry.clone());

        let property = &self.config.property;
        if property.is_memory_safety() {
            args.push("--pointer-check".to_string());
            args.push("--bounds-check".to_string());
        }
        if property.contains(&PropertyKind::ValidMemtrack)
            || property.contains(&PropertyKind::ValidMemcleanup)
        {
            args.push("--memory-leak-check".to_string());
        }
        if property.contains(&PropertyKind::NoOverflow)
            || property.contains(&PropertyKind::UndefinedBehavior)
        {
            args.push("--signed-overflow-check".to_string());
        }
        if self.config.stop_on_fail {
            args.push("--stop-on-fail".to_string());
        }
        args.extend(self.config.extra_options.iter().cloned());
        args
    }

    fn parse_output(&self, combined: &str) -> Option<RunVerdict> {
        debug!("CBMC output: {}", combined.trim());
        if combined.contains("VERIFICATION SUCCESSFUL") {
            return Some(RunVerdict::Correct);
        }
        if !combined.contains("VERIFICATION FAILED") {
            return None;
        }

        let failure = combined
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with('[') && line.ends_with("FAILURE"));
        let property = failure
            .and_then(|line| self.failed_property(line))
            .unwrap_or_else(|| self.config.property.primary().clone());
        Some(RunVerdict::Violation {
            property: Some(property),
            diagnostic: failure.map(str::to_string),
        })
    }

    fn failed_property(&self, line: &str) -> Option<PropertyKind> {
        let lower = line.to_ascii_lowercase();
        let candidates = if lower.contains("memory-leak") || lower.contains("memory leak") {
            vec![PropertyKind::ValidMemtrack, PropertyKind::ValidMemcleanup]
        } else if lower.contains("free") {
            vec![PropertyKind::ValidFree]
        } else if lower.contains("dereference") || lower.contains("pointer") || lower.contains("bound") {
            vec![PropertyKind::ValidDeref]
        } else if lower.contains("overflow") {
            vec![PropertyKind::NoOverflow, PropertyKind::UndefinedBehavior]
        } else {
            return self
                .config
                .property
                .kinds
                .iter()
                .find(|k| matches!(k, PropertyKind::UnreachCall { .. }))
                .cloned();
        };
        candidates
            .into_iter()
            .find(|kind| self.config.property.contains(kind))
    }
}

#[async_trait]
impl BackendAdapter for CbmcBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cbmc
    }

    fn executable(&self) -> &'static str {
        "cbmc"
    }

    fn required_tools(&self) -> Vec<&'static str> {
        vec!["llvm2c", self.executable()]
    }

    async fn verify(&self, ctx: &VerifyContext<'_>) -> Result<RunVerdict, PipelineError> {
        let bitcode = match ctx.input {
            VerifierInput::Bitcode(path) => path,
            VerifierInput::Sources(_) => {
                return Ok(RunVerdict::error("cbmc needs bitcode input"));
            }
        };

        let translated = ctx.workdir.join("code.c");
        let llvm2c_args = [
            bitcode.display().to_string(),
            "-o".to_string(),
            translated.display().to_string(),
        ];
        ctx.runner
            .run_checked(Phase::Verify, "llvm2c", &llvm2c_args)
            .await?;

        let mut files = vec![translated];
        if let Some(stubs) = self.stubs() {
            let path = ctx.workdir.join("verirun_stubs.c");
            std::fs::write(&path, stubs).map_err(|e| PipelineError::io(Phase::Verify, e))?;
            files.push(path);
        }

        let output = ctx
            .runner
            .run(self.executable(), &self.build_args(&files))
            .await?;

        match self.parse_output(&output.combined()) {
            Some(verdict) => Ok(verdict),
            None => Err(PipelineError::ToolFailed {
                phase: Phase::Verify,
                tool: self.executable().to_string(),
                status: output.status.to_string(),
                stderr: output.stderr,
            }),
        }
    }
}
