//! Run configuration
//!
//! Built once from the command line and never mutated afterwards, except
//! for the backend-declared overrides applied by the registry.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::error::ConfigError;
use crate::property::Property;

/// Library categories that can be linked for undefined functions
pub const LINK_CATEGORIES: &[&str] = &["libc", "posix", "svcomp", "kernel"];

/// Points-to analysis used by the slicer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PointsToMode {
    /// Flow-sensitive
    #[default]
    Fs,
    /// Flow-insensitive
    Fi,
    /// Legacy flow-insensitive implementation
    Old,
}

impl PointsToMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointsToMode::Fs => "fs",
            PointsToMode::Fi => "fi",
            PointsToMode::Old => "old",
        }
    }
}

impl fmt::Display for PointsToMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PointsToMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fs" => Ok(PointsToMode::Fs),
            "fi" => Ok(PointsToMode::Fi),
            "old" => Ok(PointsToMode::Old),
            _ => Err(ConfigError::invalid("--pta", s, "expected one of fs, fi, old")),
        }
    }
}

/// Optimization passes run before and after slicing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizePlan {
    pub before: Vec<String>,
    pub after: Vec<String>,
}

impl Default for OptimizePlan {
    fn default() -> Self {
        Self {
            before: vec!["-O1".to_string()],
            after: vec!["-O3".to_string()],
        }
    }
}

impl OptimizePlan {
    /// No optimization at all
    pub fn disabled() -> Self {
        Self {
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    /// Parse `before-O1,after-mem2reg,...`
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        let mut plan = Self::disabled();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(pass) = item.strip_prefix("before-") {
                plan.before.push(format!("-{pass}"));
            } else if let Some(pass) = item.strip_prefix("after-") {
                plan.after.push(format!("-{pass}"));
            } else {
                return Err(ConfigError::invalid(
                    "--optimize",
                    item,
                    "items must start with 'before-' or 'after-'",
                ));
            }
        }
        Ok(plan)
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}

/// Witness emission settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessConfig {
    pub enabled: bool,
    /// Destination; `<basename>.graphml` in the caller's directory when unset
    pub path: Option<PathBuf>,
}

impl Default for WitnessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

/// All options of one verification run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfiguration {
    /// Input files (C sources, or bitcode with `is_bitcode`)
    pub sources: Vec<PathBuf>,
    pub backend: BackendKind,
    pub property: Property,
    pub is_32bit: bool,
    pub is_bitcode: bool,
    /// Wall-clock limit in seconds (0 = unbounded)
    pub timeout_secs: u64,
    pub slice: bool,
    pub prepare: bool,
    pub verify: bool,
    pub optimize: OptimizePlan,
    pub points_to: PointsToMode,
    pub slicing_criterion: Option<String>,
    pub repeat_slicing: u32,
    pub cflags: Vec<String>,
    pub cppflags: Vec<String>,
    pub slicer_params: Vec<String>,
    pub verifier_params: Vec<String>,
    /// Categories of library code linked in for undefined functions
    pub link_undefined: Vec<String>,
    /// Make nondeterministic values explicit calls
    pub explicit_symbolic: bool,
    /// Keep going after the first property violation
    pub dont_exit_on_error: bool,
    pub witness: WitnessConfig,
    /// Copy of the final bitcode
    pub output: Option<PathBuf>,
    /// Keep the working directory after the run
    pub save_files: bool,
    pub working_dir_prefix: Option<PathBuf>,
    pub integrity_check: bool,
    /// Overrides the installation root derived from the executable location
    pub install_root: Option<PathBuf>,
}

impl RunConfiguration {
    /// Default configuration for the given inputs and backend
    pub fn new(sources: Vec<PathBuf>, backend: BackendKind) -> Self {
        Self {
            sources,
            backend,
            property: Property::default(),
            is_32bit: false,
            is_bitcode: false,
            timeout_secs: 0,
            slice: true,
            prepare: true,
            verify: true,
            optimize: OptimizePlan::default(),
            points_to: PointsToMode::default(),
            slicing_criterion: None,
            repeat_slicing: 1,
            cflags: Vec::new(),
            cppflags: Vec::new(),
            slicer_params: Vec::new(),
            verifier_params: Vec::new(),
            link_undefined: Vec::new(),
            explicit_symbolic: false,
            dont_exit_on_error: false,
            witness: WitnessConfig::default(),
            output: None,
            save_files: false,
            working_dir_prefix: None,
            integrity_check: true,
            install_root: None,
        }
    }

    pub fn with_property(mut self, property: Property) -> Self {
        self.property = property;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_install_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.install_root = Some(root.into());
        self
    }

    /// Check cross-field constraints that the option parser cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        for category in &self.link_undefined {
            if !LINK_CATEGORIES.contains(&category.as_str()) {
                return Err(ConfigError::invalid(
                    "--link-undefined",
                    category,
                    format!("expected one of {}", LINK_CATEGORIES.join(", ")),
                ));
            }
        }
        if self.property.kinds.is_empty() {
            return Err(ConfigError::property("", "no properties to check"));
        }
        Ok(())
    }

    /// Slicing passes to run (0 when slicing is disabled)
    pub fn slicing_passes(&self) -> u32 {
        if self.slice {
            self.repeat_slicing
        } else {
            0
        }
    }

    /// Criterion handed to the slicer
    pub fn effective_slicing_criterion(&self) -> String {
        self.slicing_criterion
            .clone()
            .unwrap_or_else(|| self.property.slicing_criterion())
    }
}

/// Split a flag string such as `--cflags="-O0 -DX=1"` into arguments
pub fn split_flags(flags: &str) -> Vec<String> {
    flags.split_whitespace().map(str::to_string).collect()
}
