//! Command line definition

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use verirun_core::config::split_flags;
use verirun_core::{
    BackendKind, ConfigError, OptimizePlan, PointsToMode, Property, RunConfiguration,
    WitnessConfig,
};

#[derive(Parser, Debug)]
#[command(name = "verirun")]
#[command(about = "Run a C program through slicing and a verifier backend")]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// C sources (or bitcode with --bc)
    pub files: Vec<PathBuf>,

    /// Verifier backend (klee, cpachecker, cbmc, smack)
    #[arg(long, value_name = "NAME", default_value = "klee")]
    pub verifier: String,

    /// Inputs are LLVM bitcode, skip compilation
    #[arg(long = "bc")]
    pub bitcode: bool,

    /// Use 32-bit environment
    #[arg(long = "32")]
    pub arch32: bool,

    /// Wall-clock limit for the whole run, 0 for none
    #[arg(long, value_name = "SECONDS", default_value_t = 0)]
    pub timeout: u64,

    /// Property file, shortcut, or CHECK line
    #[arg(long, value_name = "SPEC")]
    pub prp: Option<String>,

    #[arg(long)]
    pub no_slice: bool,

    #[arg(long)]
    pub no_prepare: bool,

    #[arg(long)]
    pub no_verification: bool,

    /// Optimization passes, e.g. before-O1,after-O3
    #[arg(long, value_name = "LIST", conflicts_with = "no_optimize")]
    pub optimize: Option<String>,

    #[arg(long)]
    pub no_optimize: bool,

    /// Points-to analysis used by the slicer
    #[arg(long, value_name = "MODE", default_value = "fs", value_parser = parse_pta)]
    pub pta: PointsToMode,

    #[arg(long, value_name = "SYM")]
    pub slicing_criterion: Option<String>,

    #[arg(long, value_name = "N", default_value_t = 1)]
    pub repeat_slicing: u32,

    #[arg(long, value_name = "STR", allow_hyphen_values = true)]
    pub cflags: Option<String>,

    #[arg(long, value_name = "STR", allow_hyphen_values = true)]
    pub cppflags: Option<String>,

    #[arg(long, value_name = "STR", allow_hyphen_values = true)]
    pub slicer_params: Option<String>,

    #[arg(long, value_name = "STR", allow_hyphen_values = true)]
    pub verifier_params: Option<String>,

    /// Link definitions of undefined functions (libc, posix, svcomp, kernel)
    #[arg(long, value_name = "LIST", value_delimiter = ',')]
    pub link_undefined: Vec<String>,

    /// Make nondeterministic values explicit calls
    #[arg(long)]
    pub explicit_symbolic: bool,

    /// Continue after the first found error
    #[arg(long)]
    pub dont_exit_on_error: bool,

    #[arg(long)]
    pub no_witness: bool,

    /// Witness destination (default: <first source>.graphml)
    #[arg(long, value_name = "PATH", conflicts_with = "no_witness")]
    pub witness: Option<PathBuf>,

    /// Copy the final bitcode to FILE
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Keep the working directory as <prefix>/verirun_files
    #[arg(long)]
    pub save_files: bool,

    #[arg(long, value_name = "DIR")]
    pub working_dir_prefix: Option<PathBuf>,

    #[arg(long)]
    pub no_integrity_check: bool,

    /// Installation root (default: parent of the executable's directory)
    #[arg(long, value_name = "DIR")]
    pub install_root: Option<PathBuf>,

    /// Print the environment the tools run with
    #[arg(long)]
    pub dump_env: bool,

    /// Print the environment as shell export commands
    #[arg(long)]
    pub dump_env_cmd: bool,

    /// Print the parsed configuration as JSON
    #[arg(long)]
    pub dump_config: bool,

    /// Print versions of verirun and the selected verifier
    #[arg(long)]
    pub version: bool,

    /// Print the verirun version only
    #[arg(long)]
    pub version_short: bool,

    /// More logging (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

fn parse_pta(value: &str) -> Result<PointsToMode, String> {
    value.parse().map_err(|e: ConfigError| e.to_string())
}

impl Cli {
    /// Whether the invocation only prints information
    pub fn is_info_command(&self) -> bool {
        self.version || self.version_short || self.dump_env || self.dump_env_cmd || self.dump_config
    }

    /// Default log filter for the verbosity flags
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }

    /// Build the run configuration for an already validated backend
    pub fn to_config(&self, backend: BackendKind) -> Result<RunConfiguration, ConfigError> {
        let property = match &self.prp {
            Some(spec) => Property::resolve(spec)?,
            None => Property::default(),
        };
        let optimize = if self.no_optimize {
            OptimizePlan::disabled()
        } else {
            match &self.optimize {
                Some(list) => OptimizePlan::parse(list)?,
                None => OptimizePlan::default(),
            }
        };
        let flags = |value: &Option<String>| value.as_deref().map(split_flags).unwrap_or_default();

        let mut config = RunConfiguration::new(self.files.clone(), backend).with_property(property);
        config.is_32bit = self.arch32;
        config.is_bitcode = self.bitcode;
        config.timeout_secs = self.timeout;
        config.slice = !self.no_slice;
        config.prepare = !self.no_prepare;
        config.verify = !self.no_verification;
        config.optimize = optimize;
        config.points_to = self.pta;
        config.slicing_criterion = self.slicing_criterion.clone();
        config.repeat_slicing = self.repeat_slicing;
        config.cflags = flags(&self.cflags);
        config.cppflags = flags(&self.cppflags);
        config.slicer_params = flags(&self.slicer_params);
        config.verifier_params = flags(&self.verifier_params);
        config.link_undefined = self.link_undefined.clone();
        config.explicit_symbolic = self.explicit_symbolic;
        config.dont_exit_on_error = self.dont_exit_on_error;
        config.witness = WitnessConfig {
            enabled: !self.no_witness,
            path: self.witness.clone(),
        };
        config.output = self.output.clone();
        config.save_files = self.save_files;
        config.working_dir_prefix = self.working_dir_prefix.clone();
        config.integrity_check = !self.no_integrity_check;
        config.install_root = self.install_root.clone();
        Ok(config)
    }
}
