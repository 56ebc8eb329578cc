//! Toolchain resolution
//!
//! Computes the search-path additions every pipeline phase needs and checks
//! that the required executables and libraries are really there. The result
//! is an immutable [`ResolvedEnvironment`] that is threaded into each
//! subordinate process launch; the supervisor's own environment is never
//! modified.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::DependencyError;

/// Marker file that selects the development layout
pub const DEV_LAYOUT_MARKER: &str = ".verirun-dev";

/// Component subtrees with their own build output in the development layout
pub const DEV_COMPONENTS: &[&str] = &[
    "dg",
    "sbt-slicer",
    "sbt-instrumentation",
    "klee",
    "transforms",
];

/// Variables captured from the ambient environment
const AMBIENT_VARS: &[&str] = &[
    "PATH",
    "LD_LIBRARY_PATH",
    "C_INCLUDE_DIR",
    "C_INCLUDE_PATH",
    "CPATH",
    "CFLAGS",
    "CPPFLAGS",
];

/// Path-like variable managed by the resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EnvVar {
    Path,
    LdLibraryPath,
    CIncludeDir,
}

impl EnvVar {
    pub const ALL: [EnvVar; 3] = [EnvVar::Path, EnvVar::LdLibraryPath, EnvVar::CIncludeDir];

    pub fn name(&self) -> &'static str {
        match self {
            EnvVar::Path => "PATH",
            EnvVar::LdLibraryPath => "LD_LIBRARY_PATH",
            EnvVar::CIncludeDir => "C_INCLUDE_DIR",
        }
    }
}

impl fmt::Display for EnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Position {
    Prepend,
    Append,
}

/// One mutation of a path-like variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathOp {
    pub var: EnvVar,
    pub position: Position,
    pub entries: Vec<PathBuf>,
}

impl PathOp {
    pub fn prepend(var: EnvVar, entries: Vec<PathBuf>) -> Self {
        Self {
            var,
            position: Position::Prepend,
            entries,
        }
    }

    pub fn append(var: EnvVar, entries: Vec<PathBuf>) -> Self {
        Self {
            var,
            position: Position::Append,
            entries,
        }
    }
}

/// Installation layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Layout {
    /// Source checkout with one build tree per component
    Development,
    /// Single flattened prefix
    Distribution,
}

/// Snapshot of the environment variables the resolver reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmbientEnv {
    vars: BTreeMap<String, String>,
}

impl AmbientEnv {
    /// Capture the current process environment
    pub fn capture() -> Self {
        Self::from_pairs(
            AMBIENT_VARS
                .iter()
                .filter_map(|name| std::env::var(name).ok().map(|value| (*name, value))),
        )
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Entries of a path-like variable, empty entries dropped
    pub fn paths(&self, name: &str) -> Vec<PathBuf> {
        self.get(name)
            .map(|value| {
                std::env::split_paths(value)
                    .filter(|p| !p.as_os_str().is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn cflags(&self) -> Vec<String> {
        crate::config::split_flags(self.get("CFLAGS").unwrap_or_default())
    }

    pub fn cppflags(&self) -> Vec<String> {
        crate::config::split_flags(self.get("CPPFLAGS").unwrap_or_default())
    }
}

/// Environment additions for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEnvironment {
    install_root: PathBuf,
    layout: Layout,
    toolchain_version: String,
    ops: Vec<PathOp>,
    ambient: AmbientEnv,
}

impl ResolvedEnvironment {
    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn toolchain_version(&self) -> &str {
        &self.toolchain_version
    }

    pub fn ops(&self) -> &[PathOp] {
        &self.ops
    }

    pub fn ambient(&self) -> &AmbientEnv {
        &self.ambient
    }

    /// Add a mutation; used by backend environment hooks
    pub fn push(&mut self, op: PathOp) {
        self.ops.push(op);
    }

    /// Final entries of `var`: prepends in order, ambient value, appends.
    /// Duplicates keep their first (highest-priority) position.
    pub fn search_paths(&self, var: EnvVar) -> Vec<PathBuf> {
        let prepends = self
            .ops
            .iter()
            .filter(|op| op.var == var && op.position == Position::Prepend)
            .flat_map(|op| op.entries.iter().cloned());
        let appends = self
            .ops
            .iter()
            .filter(|op| op.var == var && op.position == Position::Append)
            .flat_map(|op| op.entries.iter().cloned());

        let mut result: Vec<PathBuf> = Vec::new();
        for entry in prepends
            .chain(self.ambient.paths(var.name()))
            .chain(appends)
        {
            if !result.contains(&entry) {
                result.push(entry);
            }
        }
        result
    }

    /// Joined value of `var`, `None` when it would be empty
    pub fn value(&self, var: EnvVar) -> Option<OsString> {
        let paths = self.search_paths(var);
        if paths.is_empty() {
            return None;
        }
        std::env::join_paths(paths).ok()
    }

    /// All managed variables with their final values
    pub fn vars(&self) -> Vec<(&'static str, OsString)> {
        EnvVar::ALL
            .iter()
            .filter_map(|var| self.value(*var).map(|value| (var.name(), value)))
            .collect()
    }

    /// Thread the environment into a subordinate process launch
    pub fn apply_to(&self, cmd: &mut std::process::Command) {
        for (name, value) in self.vars() {
            cmd.env(name, value);
        }
    }

    /// Locate an executable on the resolved `PATH`
    pub fn find_executable(&self, name: &str) -> Option<PathBuf> {
        let path = self.value(EnvVar::Path)?;
        which::which_in(name, Some(path), &self.install_root).ok()
    }

    /// Locate a library file in the resolved `LD_LIBRARY_PATH`
    pub fn find_library(&self, name: &str) -> Option<PathBuf> {
        self.search_paths(EnvVar::LdLibraryPath)
            .into_iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    /// Render for `--dump-env` (`VAR=value`) or `--dump-env-cmd` (`export`)
    pub fn dump(&self, as_commands: bool) -> String {
        let mut out = String::new();
        for (name, value) in self.vars() {
            let value = value.to_string_lossy();
            if as_commands {
                out.push_str(&format!("export {name}='{}'\n", value.replace('\'', "'\\''")));
            } else {
                out.push_str(&format!("{name}={value}\n"));
            }
        }
        out
    }

    /// Check that every required executable and library is reachable
    pub fn verify(&self, tools: &[&str], libraries: &[&str]) -> Result<(), DependencyError> {
        for tool in tools {
            match self.find_executable(tool) {
                Some(path) => debug!("found {} at {}", tool, path.display()),
                None => return Err(DependencyError::MissingExecutable((*tool).to_string())),
            }
        }
        for library in libraries {
            match self.find_library(library) {
                Some(path) => debug!("found {} at {}", library, path.display()),
                None => return Err(DependencyError::MissingLibrary((*library).to_string())),
            }
        }
        Ok(())
    }
}

/// Builds [`ResolvedEnvironment`] values for an installation root
#[derive(Debug, Clone)]
pub struct ToolchainResolver {
    install_root: PathBuf,
    ambient: AmbientEnv,
}

impl ToolchainResolver {
    pub fn new(install_root: impl Into<PathBuf>, ambient: AmbientEnv) -> Self {
        Self {
            install_root: install_root.into(),
            ambient,
        }
    }

    /// Installation root: the override, or the parent of the executable's directory
    pub fn locate_install_root(explicit: Option<&Path>) -> Result<PathBuf, DependencyError> {
        let root = match explicit {
            Some(root) => root.to_path_buf(),
            None => {
                let exe = std::env::current_exe()
                    .map_err(|e| DependencyError::MissingInstallRoot(e.to_string()))?;
                exe.parent()
                    .and_then(Path::parent)
                    .map(Path::to_path_buf)
                    .ok_or_else(|| {
                        DependencyError::MissingInstallRoot(exe.display().to_string())
                    })?
            }
        };
        if !root.is_dir() {
            return Err(DependencyError::MissingInstallRoot(
                root.display().to_string(),
            ));
        }
        Ok(root)
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn detect_layout(&self) -> Layout {
        if self.install_root.join(DEV_LAYOUT_MARKER).exists() {
            Layout::Development
        } else {
            Layout::Distribution
        }
    }

    /// Compute the environment for a toolchain version without checking it
    pub fn environment(&self, toolchain_version: &str) -> ResolvedEnvironment {
        let root = &self.install_root;
        let layout = self.detect_layout();
        let toolchain = root.join(toolchain_version);

        let mut ops = vec![
            // Own directories first
            PathOp::prepend(EnvVar::Path, vec![root.join("bin")]),
            PathOp::prepend(EnvVar::LdLibraryPath, vec![root.join("lib")]),
            PathOp::prepend(EnvVar::CIncludeDir, vec![root.join("include")]),
            // Then the toolchain
            PathOp::prepend(EnvVar::Path, vec![toolchain.join("bin")]),
            PathOp::prepend(EnvVar::LdLibraryPath, vec![toolchain.join("lib")]),
            PathOp::prepend(EnvVar::CIncludeDir, vec![toolchain.join("include")]),
        ];

        if layout == Layout::Development {
            let build_dir = format!("build-{toolchain_version}");
            let builds: Vec<PathBuf> = DEV_COMPONENTS
                .iter()
                .map(|component| root.join(component).join(&build_dir))
                .collect();
            ops.push(PathOp::prepend(
                EnvVar::Path,
                builds.iter().map(|b| b.join("bin")).collect(),
            ));
            ops.push(PathOp::prepend(
                EnvVar::LdLibraryPath,
                builds.iter().map(|b| b.join("lib")).collect(),
            ));
        }

        // Keep include directories we do not know about visible
        let mut ambient_includes = self.ambient.paths("C_INCLUDE_PATH");
        ambient_includes.extend(self.ambient.paths("CPATH"));
        if !ambient_includes.is_empty() {
            ops.push(PathOp::append(EnvVar::CIncludeDir, ambient_includes));
        }

        debug!(
            "resolved {:?} layout at {} for {}",
            layout,
            root.display(),
            toolchain_version
        );

        ResolvedEnvironment {
            install_root: root.clone(),
            layout,
            toolchain_version: toolchain_version.to_string(),
            ops,
            ambient: self.ambient.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ambient() -> AmbientEnv {
        AmbientEnv::from_pairs([
            ("PATH", "/usr/bin:/bin"),
            ("LD_LIBRARY_PATH", "/usr/lib"),
            ("C_INCLUDE_PATH", "/opt/include"),
            ("CPATH", "/usr/include"),
        ])
    }

    #[test]
    fn distribution_layout_precedence() {
        let root = tempfile::tempdir().unwrap();
        let resolver = ToolchainResolver::new(root.path(), ambient());
        let env = resolver.environment("llvm-14");

        assert_eq!(env.layout(), Layout::Distribution);
        assert_eq!(
            env.search_paths(EnvVar::Path),
            vec![
                root.path().join("bin"),
                root.path().join("llvm-14/bin"),
                PathBuf::from("/usr/bin"),
                PathBuf::from("/bin"),
            ]
        );
        assert_eq!(
            env.search_paths(EnvVar::LdLibraryPath),
            vec![
                root.path().join("lib"),
                root.path().join("llvm-14/lib"),
                PathBuf::from("/usr/lib"),
            ]
        );
    }

    #[test]
    fn development_layout_adds_component_builds() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join(DEV_LAYOUT_MARKER), "").unwrap();
        let resolver = ToolchainResolver::new(root.path(), AmbientEnv::default());
        let env = resolver.environment("llvm-14");

        assert_eq!(env.layout(), Layout::Development);
        let path = env.search_paths(EnvVar::Path);
        assert_eq!(path[0], root.path().join("bin"));
        assert_eq!(path[1], root.path().join("llvm-14/bin"));
        assert!(path.contains(&root.path().join("dg/build-llvm-14/bin")));
        assert!(path.contains(&root.path().join("klee/build-llvm-14/bin")));
    }

    #[test]
    fn ambient_include_paths_are_appended_last() {
        let root = tempfile::tempdir().unwrap();
        let env = ToolchainResolver::new(root.path(), ambient()).environment("llvm-14");
        let includes = env.search_paths(EnvVar::CIncludeDir);
        assert_eq!(includes.first(), Some(&root.path().join("include")));
        assert_eq!(
            &includes[includes.len() - 2..],
            &[PathBuf::from("/opt/include"), PathBuf::from("/usr/include")]
        );
    }

    #[test]
    fn ambient_value_is_kept_not_replaced() {
        let root = tempfile::tempdir().unwrap();
        let env = ToolchainResolver::new(root.path(), ambient()).environment("llvm-14");
        let value = env.value(EnvVar::Path).unwrap();
        let value = value.to_string_lossy();
        assert!(value.ends_with(":/usr/bin:/bin"), "{value}");
    }

    #[test]
    fn duplicates_keep_highest_priority() {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bin");
        let ambient = AmbientEnv::from_pairs([("PATH", format!("{}:/bin", bin.display()))]);
        let env = ToolchainResolver::new(root.path(), ambient).environment("llvm-14");
        let path = env.search_paths(EnvVar::Path);
        assert_eq!(path.iter().filter(|p| **p == bin).count(), 1);
        assert_eq!(path[0], bin);
    }

    #[test]
    fn verify_reports_missing_library_by_name() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("lib")).unwrap();
        std::fs::write(root.path().join("lib/libLLVMdg.so"), "").unwrap();
        let env = ToolchainResolver::new(root.path(), AmbientEnv::default()).environment("llvm-14");

        assert!(env.verify(&[], &["libLLVMdg.so"]).is_ok());
        assert_eq!(
            env.verify(&[], &["LLVMsbt.so"]),
            Err(DependencyError::MissingLibrary("LLVMsbt.so".to_string()))
        );
    }

    #[test]
    fn verify_reports_missing_executable_by_name() {
        let root = tempfile::tempdir().unwrap();
        let env = ToolchainResolver::new(root.path(), AmbientEnv::default()).environment("llvm-14");
        assert_eq!(
            env.verify(&["sbt-slicer"], &[]),
            Err(DependencyError::MissingExecutable("sbt-slicer".to_string()))
        );
    }

    #[test]
    fn dump_formats() {
        let root = tempfile::tempdir().unwrap();
        let env = ToolchainResolver::new(root.path(), AmbientEnv::default()).environment("llvm-14");
        let plain = env.dump(false);
        let commands = env.dump(true);
        assert!(plain.lines().any(|l| l.starts_with("PATH=")));
        assert!(commands.lines().any(|l| l.starts_with("export LD_LIBRARY_PATH='")));
        assert_eq!(plain.lines().count(), 3);
    }

    #[test]
    fn locate_install_root_rejects_missing_dir() {
        let err = ToolchainResolver::locate_install_root(Some(Path::new("/no/such/root")));
        assert!(matches!(err, Err(DependencyError::MissingInstallRoot(_))));
    }

    proptest! {
        #[test]
        fn resolution_is_idempotent(
            version in "llvm-[0-9]{1,2}",
            path in proptest::collection::vec("/[a-z]{1,6}", 0..4),
            dev in any::<bool>(),
        ) {
            let root = tempfile::tempdir().unwrap();
            if dev {
                std::fs::write(root.path().join(DEV_LAYOUT_MARKER), "").unwrap();
            }
            let ambient = AmbientEnv::from_pairs([("PATH", path.join(":"))]);
            let resolver = ToolchainResolver::new(root.path(), ambient);
            prop_assert_eq!(resolver.environment(&version), resolver.environment(&version));
        }
    }
}
