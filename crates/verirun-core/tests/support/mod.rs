//! Fake installation trees for integration tests
//!
//! Every tool is a small shell script. The generic one writes a dummy file
//! to whatever follows `-o`, which is enough for the pipeline to move on.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

pub const GENERIC_TOOL: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
    echo "LLVM version 14.0.6"
    exit 0
fi
out=""
prev=""
for arg in "$@"; do
    if [ "$prev" = "-o" ]; then out="$arg"; fi
    prev="$arg"
done
if [ -n "$out" ]; then echo "fake bitcode" > "$out"; fi
exit 0
"#;

pub const SBT_INSTR: &str = r#"#!/bin/sh
echo "fake bitcode" > "$4"
"#;

pub const KLEE_VIOLATION: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
    echo "KLEE 2.3 (LLVM version 14.0.6)"
    exit 0
fi
mkdir -p klee-last
cat > klee-last/test000001.assert.err <<'EOF'
Error: ASSERTION FAIL: 0
File: test.c
Line: 3
assembly.ll line: 21
Stack:
    #000000021 in reach_error () at test.c:3
    #100000045 in main () at test.c:10
Info:
EOF
echo "KLEE: ERROR: test.c:3: ASSERTION FAIL: 0" >&2
echo "KLEE: done: completed paths = 1" >&2
"#;

pub const KLEE_CORRECT: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
    echo "KLEE 2.3 (LLVM version 14.0.6)"
    exit 0
fi
mkdir -p klee-last
echo "KLEE: done: total instructions = 42" >&2
echo "KLEE: done: completed paths = 3" >&2
echo "KLEE: done: partially completed paths = 0" >&2
"#;

pub const TEST_PROGRAM: &str = "extern void reach_error(void);\nint main(void) { reach_error(); return 0; }\n";

/// A complete distribution-layout installation made of fake tools
pub struct FakeInstall {
    root: TempDir,
}

impl FakeInstall {
    pub fn new() -> Self {
        let install = Self {
            root: tempfile::tempdir().unwrap(),
        };
        for tool in ["clang", "llvm-link", "opt", "sbt-slicer"] {
            install.tool(tool, GENERIC_TOOL);
        }
        install.tool("sbt-instr", SBT_INSTR);
        install.tool("klee", KLEE_CORRECT);
        install.library("lib", "LLVMsbt.so");
        install.library("lib", "libLLVMdg.so");
        install.library("lib/klee/runtime", "libkleeRuntest.so");
        install
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Install (or replace) `bin/<name>`
    pub fn tool(&self, name: &str, script: &str) {
        let bin = self.root.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    pub fn library(&self, dir: &str, name: &str) {
        let dir = self.root.path().join(dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), "").unwrap();
    }

    pub fn remove_library(&self, dir: &str, name: &str) {
        std::fs::remove_file(self.root.path().join(dir).join(name)).unwrap();
    }

    /// KLEE that records its pid and hangs
    pub fn sleeping_klee(&self, pidfile: &Path) {
        self.tool(
            "klee",
            &format!(
                "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo 'KLEE 2.3 (LLVM version 14.0.6)'; exit 0; fi\necho $$ > '{}'\nexec sleep 10\n",
                pidfile.display()
            ),
        );
    }

    /// KLEE that exits at once, leaving a sleeper that keeps its output open.
    /// With `escape` the sleeper moves to its own session first.
    pub fn backgrounding_klee(&self, pidfile: &Path, escape: bool) {
        let launcher = if escape { "setsid " } else { "" };
        self.tool(
            "klee",
            &format!(
                "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo 'KLEE 2.3 (LLVM version 14.0.6)'; exit 0; fi\n{launcher}sleep 10 &\necho $! > '{}'\nexit 0\n",
                pidfile.display()
            ),
        );
    }

    /// Tool that always fails
    pub fn failing_tool(&self, name: &str) {
        self.tool(name, "#!/bin/sh\necho 'fatal: broken input' >&2\nexit 1\n");
    }
}

/// A caller directory holding `test.c`
pub fn caller_dir() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("test.c");
    std::fs::write(&source, TEST_PROGRAM).unwrap();
    (dir, source)
}

/// Whether `pid` names a live (non-zombie) process
pub fn process_alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .map_or(false, |state| state != 'Z' && state != 'X'),
        Err(_) => false,
    }
}
