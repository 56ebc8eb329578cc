//! verirun-core: run supervisor for external program-verification toolchains
//!
//! A run takes C sources (or bitcode) and a property, pushes them through a
//! chain of external tools (compiler, linker, slicer, instrumentation) and
//! hands the result to one verifier backend. This crate owns everything
//! around those tools:
//!
//! - [`config`] and [`property`]: the immutable run configuration
//! - [`toolchain`]: search paths for the installed tools, with fail-fast checks
//! - [`backend`]: the closed set of verifier backends behind one trait
//! - [`supervisor`]: working directory, timeout, pipeline and teardown
//! - [`verdict`] and [`witness`]: the `RESULT:` token and witness emission
//!
//! ```no_run
//! use verirun_core::{AmbientEnv, BackendKind, RunConfiguration, Supervisor};
//!
//! # async fn demo() -> Result<(), verirun_core::SupervisorError> {
//! let config = RunConfiguration::new(vec!["test.c".into()], BackendKind::Klee).with_timeout(60);
//! let report = Supervisor::prepare(config, AmbientEnv::capture())?.run().await?;
//! println!("{}", report.outcome.result_line());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod integrity;
pub mod pipeline;
pub mod process;
pub mod property;
pub mod supervisor;
pub mod toolchain;
pub mod verdict;
pub mod witness;
pub mod workdir;

pub use backend::{BackendAdapter, BackendKind, BackendRegistry};
pub use config::{OptimizePlan, PointsToMode, RunConfiguration, WitnessConfig};
pub use error::{
    ConfigError, DependencyError, IntegrityError, PipelineError, SupervisorError, SupervisorResult,
};
pub use property::{Property, PropertyKind};
pub use supervisor::{resolve_environment, RunReport, Supervisor};
pub use toolchain::{AmbientEnv, ResolvedEnvironment, ToolchainResolver};
pub use verdict::{decide_witness, RunOutcome, RunVerdict, WitnessKind};
pub use witness::{GraphmlWitnessWriter, WitnessRequest, WitnessWriter};
pub use workdir::{CleanupWarning, WorkingDirectory};
