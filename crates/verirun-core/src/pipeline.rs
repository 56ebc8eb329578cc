//! The verification pipeline
//!
//! compile -> link -> link undefined -> prepare/instrument -> optimize ->
//! slice -> optimize -> verify. Every phase is an external tool launched
//! through the [`ProcessRunner`]; this module only decides which tools run,
//! in which order, and on which files.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::backend::{BackendAdapter, VerifierInput, VerifyContext};
use crate::config::RunConfiguration;
use crate::error::PipelineError;
use crate::integrity::Fingerprint;
use crate::process::{Phase, ProcessRunner};
use crate::toolchain::EnvVar;
use crate::verdict::RunVerdict;

const LLVM_TOOLS: &[&str] = &["clang", "llvm-link", "opt"];

/// Executables the run needs, helper tools first
pub fn required_tools(config: &RunConfiguration, adapter: &dyn BackendAdapter) -> Vec<&'static str> {
    let mut tools = Vec::new();
    if adapter.consumes_bitcode() {
        if !config.is_bitcode {
            tools.push("clang");
        }
        tools.push("llvm-link");
        if config.prepare || !config.optimize.is_empty() {
            tools.push("opt");
        }
        if config.prepare && config.property.requires_instrumentation() {
            tools.push("sbt-instr");
        }
        if config.slicing_passes() > 0 {
            tools.push("sbt-slicer");
        }
    }
    for tool in adapter.required_tools() {
        if !tools.contains(&tool) {
            tools.push(tool);
        }
    }
    tools
}

/// Shared libraries the run needs
pub fn required_libraries(
    config: &RunConfiguration,
    adapter: &dyn BackendAdapter,
) -> Vec<&'static str> {
    let mut libraries = Vec::new();
    if adapter.consumes_bitcode() {
        if config.prepare {
            libraries.push("LLVMsbt.so");
        }
        if config.slicing_passes() > 0 {
            libraries.push("libLLVMdg.so");
        }
    }
    for library in adapter.required_libraries() {
        if !libraries.contains(&library) {
            libraries.push(library);
        }
    }
    libraries
}

/// Version fingerprints of every required tool that declares one
pub fn fingerprints(config: &RunConfiguration, adapter: &dyn BackendAdapter) -> Vec<Fingerprint> {
    let mut fingerprints: Vec<Fingerprint> = required_tools(config, adapter)
        .into_iter()
        .filter(|tool| LLVM_TOOLS.contains(tool))
        .map(|tool| Fingerprint::llvm(tool, adapter.toolchain_version()))
        .collect();
    fingerprints.extend(adapter.fingerprints());
    fingerprints
}

/// One pass through the pipeline inside a working directory
pub struct Pipeline<'a> {
    config: &'a RunConfiguration,
    adapter: &'a dyn BackendAdapter,
    runner: &'a ProcessRunner,
    workdir: &'a Path,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a RunConfiguration,
        adapter: &'a dyn BackendAdapter,
        runner: &'a ProcessRunner,
        workdir: &'a Path,
    ) -> Self {
        Self {
            config,
            adapter,
            runner,
            workdir,
        }
    }

    /// Run every enabled phase and return the backend's verdict
    pub async fn run(&self) -> Result<RunVerdict, PipelineError> {
        let input = if self.adapter.consumes_bitcode() {
            VerifierInput::Bitcode(self.build_bitcode().await?)
        } else {
            VerifierInput::Sources(self.config.sources.clone())
        };

        if !self.config.verify {
            info!("verification disabled");
            return Ok(RunVerdict::unknown("verification disabled"));
        }

        info!("verifying with {}", self.adapter.name());
        let ctx = VerifyContext {
            runner: self.runner,
            input: &input,
            workdir: self.workdir,
        };
        self.adapter.verify(&ctx).await
    }

    async fn build_bitcode(&self) -> Result<PathBuf, PipelineError> {
        let mut current = self.compile_and_link().await?;
        current = self.link_undefined(current).await?;

        if self.config.prepare {
            current = self.prepare(current).await?;
            if let Some(set) = self.config.property.instrumentation_set() {
                current = self.instrument(current, set).await?;
            }
        }

        current = self
            .optimize(current, &self.config.optimize.before, "code-opt-before.bc")
            .await?;

        for pass in 1..=self.config.slicing_passes() {
            current = self.slice(current, pass).await?;
        }

        current = self
            .optimize(current, &self.config.optimize.after, "code-opt-after.bc")
            .await?;

        if let Some(output) = &self.config.output {
            info!("copying final bitcode to {}", output.display());
            std::fs::copy(&current, output).map_err(|e| PipelineError::io(Phase::Output, e))?;
        }

        Ok(current)
    }

    fn file(&self, name: &str) -> PathBuf {
        self.workdir.join(name)
    }

    async fn compile_and_link(&self) -> Result<PathBuf, PipelineError> {
        let modules = if self.config.is_bitcode {
            self.config.sources.clone()
        } else {
            let mut modules = Vec::new();
            for source in &self.config.sources {
                let module = self.unique_module_name(source, &modules);
                self.compile(source, &module).await?;
                modules.push(module);
            }
            modules
        };

        let linked = self.file("code.bc");
        let mut args = vec!["-o".to_string(), linked.display().to_string()];
        args.extend(modules.iter().map(|m| m.display().to_string()));
        info!("linking {} module(s)", modules.len());
        self.runner
            .run_checked(Phase::Link, "llvm-link", &args)
            .await?;
        Ok(linked)
    }

    fn unique_module_name(&self, source: &Path, taken: &[PathBuf]) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string());
        let mut name = format!("{stem}.bc");
        let mut n = 1;
        // code.bc and code-*.bc belong to the later phases
        while name == "code.bc" || name.starts_with("code-") || taken.contains(&self.file(&name)) {
            name = format!("{stem}-{n}.bc");
            n += 1;
            if name.starts_with("code-") {
                name = format!("src-{name}");
            }
        }
        self.file(&name)
    }

    async fn compile(&self, source: &Path, module: &Path) -> Result<(), PipelineError> {
        let env = self.runner.env();
        let mut args: Vec<String> = vec![
            "-c".into(),
            "-emit-llvm".into(),
            "-g".into(),
            "-fgnu89-inline".into(),
            "-Wno-unused-parameter".into(),
        ];
        if self.config.is_32bit {
            args.push("-m32".into());
        }
        for dir in env.search_paths(EnvVar::CIncludeDir) {
            args.push(format!("-I{}", dir.display()));
        }
        args.extend(self.config.cppflags.iter().cloned());
        args.extend(env.ambient().cppflags());
        args.extend(self.config.cflags.iter().cloned());
        args.extend(env.ambient().cflags());
        args.push(source.display().to_string());
        args.push("-o".into());
        args.push(module.display().to_string());

        info!("compiling {}", source.display());
        self.runner
            .run_checked(Phase::Compile, "clang", &args)
            .await?;
        Ok(())
    }

    async fn link_undefined(&self, mut current: PathBuf) -> Result<PathBuf, PipelineError> {
        let lib_dir = self
            .runner
            .env()
            .install_root()
            .join("lib")
            .join("verirun");
        for category in &self.config.link_undefined {
            let library = lib_dir.join(format!("{category}.bc"));
            if !library.is_file() {
                warn!("no {} library at {}, skipping", category, library.display());
                continue;
            }
            let linked = self.file(&format!("code-{category}.bc"));
            let args = [
                "-o".to_string(),
                linked.display().to_string(),
                current.display().to_string(),
                library.display().to_string(),
            ];
            info!("linking {} definitions", category);
            self.runner
                .run_checked(Phase::Link, "llvm-link", &args)
                .await?;
            current = linked;
        }
        Ok(current)
    }

    async fn prepare(&self, current: PathBuf) -> Result<PathBuf, PipelineError> {
        let env = self.runner.env();
        let plugin = env
            .find_library("LLVMsbt.so")
            .unwrap_or_else(|| PathBuf::from("LLVMsbt.so"));
        let prepared = self.file("code-prepared.bc");
        let mut args = vec![
            "-load".to_string(),
            plugin.display().to_string(),
            "-prepare".to_string(),
        ];
        if self.config.explicit_symbolic {
            args.push("-explicit-symbolic".to_string());
        }
        args.push(current.display().to_string());
        args.push("-o".to_string());
        args.push(prepared.display().to_string());

        info!("preparing bitcode");
        self.runner
            .run_checked(Phase::Prepare, "opt", &args)
            .await?;
        Ok(prepared)
    }

    async fn instrument(&self, current: PathBuf, set: &str) -> Result<PathBuf, PipelineError> {
        let dir = self
            .runner
            .env()
            .install_root()
            .join("share")
            .join("verirun")
            .join("instrumentation")
            .join(set);
        let instrumented = self.file("code-inst.bc");
        let args = [
            dir.join("config.json").display().to_string(),
            dir.join(format!("{set}.bc")).display().to_string(),
            current.display().to_string(),
            instrumented.display().to_string(),
        ];

        info!("instrumenting with {}", set);
        self.runner
            .run_checked(Phase::Instrument, "sbt-instr", &args)
            .await?;
        Ok(instrumented)
    }

    async fn optimize(
        &self,
        current: PathBuf,
        passes: &[String],
        output: &str,
    ) -> Result<PathBuf, PipelineError> {
        if passes.is_empty() {
            return Ok(current);
        }
        let optimized = self.file(output);
        let mut args: Vec<String> = passes.to_vec();
        args.push(current.display().to_string());
        args.push("-o".to_string());
        args.push(optimized.display().to_string());

        info!("optimizing with {}", passes.join(" "));
        self.runner
            .run_checked(Phase::Optimize, "opt", &args)
            .await?;
        Ok(optimized)
    }

    async fn slice(&self, current: PathBuf, pass: u32) -> Result<PathBuf, PipelineError> {
        let sliced = if pass == 1 {
            self.file("code.sliced")
        } else {
            self.file(&format!("code.{pass}.sliced"))
        };
        let mut args = vec![
            "-c".to_string(),
            self.config.effective_slicing_criterion(),
            "-pta".to_string(),
            self.config.points_to.to_string(),
        ];
        args.extend(self.config.slicer_params.iter().cloned());
        args.push(current.display().to_string());
        args.push("-o".to_string());
        args.push(sliced.display().to_string());

        info!("slicing (pass {})", pass);
        self.runner
            .run_checked(Phase::Slice, "sbt-slicer", &args)
            .await?;
        Ok(sliced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendKind, BackendRegistry};
    use crate::property::Property;

    fn instantiate(config: RunConfiguration) -> (RunConfiguration, Box<dyn BackendAdapter>) {
        BackendRegistry::instantiate(config).unwrap()
    }

    fn klee_config() -> RunConfiguration {
        RunConfiguration::new(vec![PathBuf::from("test.c")], BackendKind::Klee)
    }

    #[test]
    fn default_klee_run_needs_full_toolchain() {
        let (config, adapter) = instantiate(klee_config());
        assert_eq!(
            required_tools(&config, adapter.as_ref()),
            vec!["clang", "llvm-link", "opt", "sbt-slicer", "klee"]
        );
        assert_eq!(
            required_libraries(&config, adapter.as_ref()),
            vec!["LLVMsbt.so", "libLLVMdg.so", "libkleeRuntest.so"]
        );
    }

    #[test]
    fn disabled_phases_drop_their_tools() {
        let mut config = klee_config();
        config.is_bitcode = true;
        config.slice = false;
        config.prepare = false;
        config.optimize = crate::config::OptimizePlan::disabled();
        let (config, adapter) = instantiate(config);
        assert_eq!(
            required_tools(&config, adapter.as_ref()),
            vec!["llvm-link", "klee"]
        );
        assert_eq!(
            required_libraries(&config, adapter.as_ref()),
            vec!["libkleeRuntest.so"]
        );
    }

    #[test]
    fn memsafety_needs_instrumentation() {
        let config = klee_config().with_property(Property::resolve("memsafety").unwrap());
        let (config, adapter) = instantiate(config);
        assert!(required_tools(&config, adapter.as_ref()).contains(&"sbt-instr"));
    }

    #[test]
    fn source_backends_need_only_their_executable() {
        let config = RunConfiguration::new(vec![PathBuf::from("a.c")], BackendKind::Cpachecker);
        let (config, adapter) = instantiate(config);
        assert_eq!(required_tools(&config, adapter.as_ref()), vec!["cpachecker"]);
        assert!(required_libraries(&config, adapter.as_ref()).is_empty());
        assert!(fingerprints(&config, adapter.as_ref()).is_empty());
    }

    #[test]
    fn fingerprints_cover_llvm_tools_and_backend() {
        let (config, adapter) = instantiate(klee_config());
        let tools: Vec<String> = fingerprints(&config, adapter.as_ref())
            .into_iter()
            .map(|fp| fp.tool)
            .collect();
        assert_eq!(tools, vec!["clang", "llvm-link", "opt", "klee"]);
    }
}
