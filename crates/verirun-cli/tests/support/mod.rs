//! Helpers for driving the `verirun` binary against a scripted installation

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

/// Compiler-like tool: answers `--version`, otherwise fills the `-o` target
const PASS_THROUGH: &str = r#"#!/bin/sh
case "$1" in --version) echo "LLVM version 14.0.6"; exit 0;; esac
out=""; prev=""
for arg in "$@"; do [ "$prev" = "-o" ] && out="$arg"; prev="$arg"; done
[ -n "$out" ] && echo bitcode > "$out"
exit 0
"#;

const KLEE_FOUND_ERROR: &str = r#"#!/bin/sh
case "$1" in --version) echo "KLEE 2.3 (LLVM version 14.0.6)"; exit 0;; esac
mkdir -p klee-last
printf 'Error: ASSERTION FAIL: 0\nFile: test.c\nLine: 3\nStack:\n    #000000021 in reach_error () at test.c:3\n    #100000045 in main () at test.c:5\n' > klee-last/test000001.assert.err
echo "KLEE: done: completed paths = 1" >&2
"#;

const KLEE_NO_ERROR: &str = r#"#!/bin/sh
case "$1" in --version) echo "KLEE 2.3 (LLVM version 14.0.6)"; exit 0;; esac
mkdir -p klee-last
echo "KLEE: done: completed paths = 2" >&2
echo "KLEE: done: partially completed paths = 0" >&2
"#;

pub enum Klee {
    FindsError,
    FindsNothing,
    /// Writes its pid to the file and hangs
    Hangs(PathBuf),
}

/// Installation root with scripted tools under `bin/`
pub struct Install {
    root: TempDir,
}

impl Install {
    pub fn new(klee: Klee) -> Self {
        let install = Self {
            root: tempfile::tempdir().unwrap(),
        };
        for tool in ["clang", "llvm-link", "opt", "sbt-slicer"] {
            install.script(tool, PASS_THROUGH);
        }
        install.script("sbt-instr", "#!/bin/sh\necho bitcode > \"$4\"\n");
        let klee = match klee {
            Klee::FindsError => KLEE_FOUND_ERROR.to_string(),
            Klee::FindsNothing => KLEE_NO_ERROR.to_string(),
            Klee::Hangs(pidfile) => format!(
                "#!/bin/sh\ncase \"$1\" in --version) echo 'KLEE 2.3 (LLVM version 14.0.6)'; exit 0;; esac\necho $$ > '{}'\nexec sleep 10\n",
                pidfile.display()
            ),
        };
        install.script("klee", &klee);
        for (dir, lib) in [
            ("lib", "LLVMsbt.so"),
            ("lib", "libLLVMdg.so"),
            ("lib/klee/runtime", "libkleeRuntest.so"),
        ] {
            let dir = install.root.path().join(dir);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(lib), "").unwrap();
        }
        install
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn script(&self, name: &str, body: &str) {
        let bin = self.root.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    pub fn remove(&self, relative: &str) {
        std::fs::remove_file(self.root.path().join(relative)).unwrap();
    }
}

/// Caller directory holding `test.c`
pub fn workspace() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("test.c"),
        "extern void reach_error(void);\nint main(void) { reach_error(); return 0; }\n",
    )
    .unwrap();
    dir
}

/// Run `verirun` in `cwd` with `--install-root` pointing at `install`
pub fn verirun(install: &Install, cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_verirun"))
        .arg("--install-root")
        .arg(install.path())
        .args(args)
        .current_dir(cwd)
        .env("PATH", "/usr/bin:/bin")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run verirun")
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn result_lines(output: &Output) -> Vec<String> {
    stdout(output)
        .lines()
        .filter(|line| line.starts_with("RESULT:"))
        .map(str::to_string)
        .collect()
}

pub fn files_with_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|e| e == extension))
        .collect()
}

pub fn is_empty_dir(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

/// Whether `pid` names a live (non-zombie) process
pub fn process_alive(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .is_some_and(|state| state != 'Z' && state != 'X')
}
