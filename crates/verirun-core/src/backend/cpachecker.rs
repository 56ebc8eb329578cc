//! CPAchecker backend
//!
//! CPAchecker is a configurable software verification framework for C programs.
//! It works on the original sources, so the registry turns the bitcode
//! phases off for it. The property is handed over as a `.prp` file.
//!
//! See: <https://cpachecker.sosy-lab.org/>

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{BackendAdapter, BackendKind, VerifierInput, VerifyContext};
use crate::config::RunConfiguration;
use crate::error::PipelineError;
use crate::process::Phase;
use crate::property::{Property, PropertyKind};
use crate::verdict::RunVerdict;

/// Configuration for CPAchecker backend
#[derive(Debug, Clone)]
pub struct CpacheckerConfig {
    pub property: Property,
    pub is_32bit: bool,
    /// Configuration preset passed as the first option
    pub preset: String,
    /// Extra options to pass through
    pub extra_options: Vec<String>,
}

impl Default for CpacheckerConfig {
    fn default() -> Self {
        Self {
            property: Property::default(),
            is_32bit: false,
            preset: "-svcomp23".to_string(),
            extra_options: Vec::new(),
        }
    }
}

/// CPAchecker backend
pub struct CpacheckerBackend {
    config: CpacheckerConfig,
}

impl Default for CpacheckerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpacheckerBackend {
    /// Create a backend with default configuration
    pub fn new() -> Self {
        Self {
            config: CpacheckerConfig::default(),
        }
    }

    /// Create a backend with custom configuration
    pub fn with_config(config: CpacheckerConfig) -> Self {
        Self { config }
    }

    pub fn from_run(run: &RunConfiguration) -> Self {
        Self::with_config(CpacheckerConfig {
            property: run.property.clone(),
            is_32bit: run.is_32bit,
            extra_options: run.verifier_params.clone(),
            ..Default::default()
        })
    }

    fn generate_property_file(&self, dir: &Path) -> Result<PathBuf, PipelineError> {
        let property_path = dir.join("property.prp");
        std::fs::write(&property_path, self.config.property.to_prp())
            .map_err(|e| PipelineError::io(Phase::Verify, e))?;
        Ok(property_path)
    }

    fn build_args(&self, property_file: &Path, sources: &[PathBuf]) -> Vec<String> {
        let mut args = vec![
            self.config.preset.clone(),
            "-spec".to_string(),
            property_file.display().to_string(),
            if self.config.is_32bit { "-32" } else { "-64" }.to_string(),
            "-setprop".to_string(),
            format!("analysis.entryFunction={}", self.config.property.entry),
        ];
        args.extend(self.config.extra_options.iter().cloned());
        args.extend(sources.iter().map(|s| s.display().to_string()));
        args
    }

    fn parse_output(&self, stdout: &str, stderr: &str) -> RunVerdict {
        let combined = format!("{}\n{}", stdout, stderr);
        debug!("CPAchecker output: {}", combined.trim());

        let result_line = combined
            .lines()
            .find(|line| line.contains("Verification result:"))
            .map(str::trim);

        match result_line {
            Some(line) if line.contains("FALSE") => RunVerdict::Violation {
                property: Some(self.violated_property(line)),
                diagnostic: Some(line.to_string()),
            },
            Some(line) if line.contains("TRUE") => RunVerdict::Correct,
            Some(line) => RunVerdict::unknown(line.to_string()),
            None => RunVerdict::unknown("CPAchecker returned inconclusive result"),
        }
    }

    /// Property named in `FALSE. Property violation (valid-free: ...)`
    fn violated_property(&self, line: &str) -> PropertyKind {
        self.config
            .property
            .kinds
            .iter()
            .find(|kind| line.contains(kind.result_tag()))
            .unwrap_or_else(|| self.config.property.primary())
            .clone()
    }
}

#[async_trait]
impl BackendAdapter for CpacheckerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpachecker
    }

    fn executable(&self) -> &'static str {
        "cpachecker"
    }

    fn consumes_bitcode(&self) -> bool {
        false
    }

    async fn verify(&self, ctx: &VerifyContext<'_>) -> Result<RunVerdict, PipelineError> {
        let sources = match ctx.input {
            VerifierInput::Sources(sources) => sources,
            VerifierInput::Bitcode(_) => {
                return Ok(RunVerdict::error("cpachecker needs C sources"));
            }
        };

        let property_file = self.generate_property_file(ctx.workdir)?;
        let args = self.build_args(&property_file, sources);
        let output = ctx.runner.run(self.executable(), &args).await?;
        let verdict = self.parse_output(&output.stdout, &output.stderr);

        if !output.success() && matches!(verdict, RunVerdict::Unknown { .. }) {
            return Err(PipelineError::ToolFailed {
                phase: Phase::Verify,
                tool: self.executable().to_string(),
                status: output.status.to_string(),
                stderr: output.stderr,
            });
        }
        Ok(verdict)
    }

    fn describe_violation(&self, workdir: &Path) -> Option<String> {
        let path = workdir.join("output").join("Counterexample.1.txt");
        let text = std::fs::read_to_string(path).ok()?;
        let lines: Vec<&str> = text.lines().take(20).collect();
        Some(lines.join("\n"))
    }
}
