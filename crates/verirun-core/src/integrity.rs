//! Toolchain integrity check
//!
//! Every tool that declares a fingerprint is asked for `--version`; the
//! output must contain the fingerprint. This catches a `PATH` that resolves
//! to a system LLVM of a different major version, which otherwise shows up
//! much later as an unreadable bitcode error.

use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::IntegrityError;
use crate::process::kill_group;
use crate::toolchain::ResolvedEnvironment;

/// Upper bound for one `--version` probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Expected substring of a tool's `--version` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub tool: String,
    pub expected: String,
}

impl Fingerprint {
    pub fn new(tool: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            expected: expected.into(),
        }
    }

    /// Fingerprint of an LLVM tool built for the toolchain tag `llvm-N`
    pub fn llvm(tool: impl Into<String>, toolchain_version: &str) -> Self {
        let major = toolchain_version
            .strip_prefix("llvm-")
            .unwrap_or(toolchain_version);
        Self::new(tool, format!("version {major}"))
    }
}

/// Probe every fingerprinted tool
pub async fn check(env: &ResolvedEnvironment, fingerprints: &[Fingerprint]) -> Result<(), IntegrityError> {
    for fingerprint in fingerprints {
        let found = probe_version(env, &fingerprint.tool).await?;
        if !found.contains(&fingerprint.expected) {
            return Err(IntegrityError::Mismatch {
                tool: fingerprint.tool.clone(),
                expected: fingerprint.expected.clone(),
                found: found.lines().next().unwrap_or_default().trim().to_string(),
            });
        }
        debug!("{} matches '{}'", fingerprint.tool, fingerprint.expected);
    }
    info!("integrity check passed for {} tools", fingerprints.len());
    Ok(())
}

/// Combined `--version` output of `tool`
pub async fn probe_version(env: &ResolvedEnvironment, tool: &str) -> Result<String, IntegrityError> {
    let executable = env
        .find_executable(tool)
        .ok_or_else(|| IntegrityError::Probe {
            tool: tool.to_string(),
            message: "not found on the resolved PATH".to_string(),
        })?;

    let mut command = std::process::Command::new(&executable);
    command
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    env.apply_to(&mut command);
    let mut command = tokio::process::Command::from(command);
    command.kill_on_drop(true);

    let child = command.spawn().map_err(|e| IntegrityError::Probe {
        tool: tool.to_string(),
        message: e.to_string(),
    })?;
    let group = child.id();

    let waited = timeout(PROBE_TIMEOUT, child.wait_with_output()).await;
    kill_group(group);
    let output = match waited {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(IntegrityError::Probe {
                tool: tool.to_string(),
                message: e.to_string(),
            })
        }
        Err(_) => {
            return Err(IntegrityError::ProbeTimeout {
                tool: tool.to_string(),
                timeout: PROBE_TIMEOUT,
            })
        }
    };

    // Some tools print their version to stderr
    Ok(format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    ))
}
