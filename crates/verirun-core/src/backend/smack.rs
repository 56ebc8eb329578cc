//! SMACK backend
//!
//! SMACK translates the bitcode to Boogie and checks it with Corral. It is
//! built against an older LLVM than the rest of the toolchain and cannot
//! back up a `true` answer with a correctness witness.
//!
//! See: <https://smackers.github.io/>

use async_trait::async_trait;
use tracing::debug;

use super::{BackendAdapter, BackendKind, VerifierInput, VerifyContext};
use crate::config::RunConfiguration;
use crate::error::PipelineError;
use crate::integrity::Fingerprint;
use crate::process::Phase;
use crate::property::{Property, PropertyKind};
use crate::verdict::RunVerdict;

/// Configuration for the SMACK backend
#[derive(Debug, Clone)]
pub struct SmackConfig {
    pub property: Property,
    /// Loop unrolling bound
    pub unroll: u32,
    pub extra_options: Vec<String>,
}

impl Default for SmackConfig {
    fn default() -> Self {
        Self {
            property: Property::default(),
            unroll: 10,
            extra_options: Vec::new(),
        }
    }
}

/// SMACK backend
pub struct SmackBackend {
    config: SmackConfig,
}

impl Default for SmackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SmackBackend {
    pub fn new() -> Self {
        Self {
            config: SmackConfig::default(),
        }
    }

    pub fn with_config(config: SmackConfig) -> Self {
        Self { config }
    }

    pub fn from_run(run: &RunConfiguration) -> Self {
        Self::with_config(SmackConfig {
            property: run.property.clone(),
            extra_options: run.verifier_params.clone(),
            ..Default::default()
        })
    }

    fn build_args(&self, bitcode: &str) -> Vec<String> {
        let mut args = vec![
            bitcode.to_string(),
            "--entry-points".to_string(),
            self.config.property.entry.clone(),
            "--unroll".to_string(),
            self.config.unroll.to_string(),
        ];
        let property = &self.config.property;
        if property.is_memory_safety() {
            args.push("--check".to_string());
            args.push("memory-safety".to_string());
        }
        if property.contains(&PropertyKind::NoOverflow) {
            args.push("--check".to_string());
            args.push("integer-overflow".to_string());
        }
        args.extend(self.config.extra_options.iter().cloned());
        args
    }

    fn parse_output(&self, combined: &str) -> Option<RunVerdict> {
        debug!("SMACK output: {}", combined.trim());
        if combined.contains("SMACK found no errors") {
            return Some(RunVerdict::Correct);
        }
        if !combined.contains("SMACK found an error") {
            return None;
        }

        let lower = combined.to_ascii_lowercase();
        let candidates = if lower.contains("memory leak") {
            vec![PropertyKind::ValidMemtrack, PropertyKind::ValidMemcleanup]
        } else if lower.contains("invalid free") {
            vec![PropertyKind::ValidFree]
        } else if lower.contains("invalid memory access") || lower.contains("invalid dereference") {
            vec![PropertyKind::ValidDeref]
        } else if lower.contains("integer overflow") {
            vec![PropertyKind::NoOverflow]
        } else {
            Vec::new()
        };
        let property = candidates
            .into_iter()
            .find(|kind| self.config.property.contains(kind))
            .unwrap_or_else(|| self.config.property.primary().clone());

        Some(RunVerdict::Violation {
            property: Some(property),
            diagnostic: combined
                .lines()
                .find(|line| line.contains("SMACK found an error"))
                .map(|line| line.trim().to_string()),
        })
    }
}

#[async_trait]
impl BackendAdapter for SmackBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Smack
    }

    fn toolchain_version(&self) -> &'static str {
        "llvm-12"
    }

    fn executable(&self) -> &'static str {
        "smack"
    }

    fn produces_correctness_witness(&self) -> bool {
        false
    }

    fn fingerprints(&self) -> Vec<Fingerprint> {
        vec![Fingerprint::new(self.executable(), "SMACK version")]
    }

    async fn verify(&self, ctx: &VerifyContext<'_>) -> Result<RunVerdict, PipelineError> {
        let bitcode = match ctx.input {
            VerifierInput::Bitcode(path) => path.display().to_string(),
            VerifierInput::Sources(_) => {
                return Ok(RunVerdict::error("smack needs bitcode input"));
            }
        };

        let output = ctx
            .runner
            .run(self.executable(), &self.build_args(&bitcode))
            .await?;

        match self.parse_output(&output.combined()) {
            Some(verdict) => Ok(verdict),
            None if output.success() => Ok(RunVerdict::unknown("smack gave no verdict")),
            None => Err(PipelineError::ToolFailed {
                phase: Phase::Verify,
                tool: self.executable().to_string(),
                status: output.status.to_string(),
                stderr: output.stderr,
            }),
        }
    }
}
