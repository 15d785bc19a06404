//! Argument generators for JS shell reftest layouts.
//!
//! A generator synthesizes the interpreter argument string for one fuzz file
//! from the test case root directory and the fuzz file path. The registry is
//! closed: generators are looked up by name from the configuration.

use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};

use crate::{FuzzmillError, FuzzmillResult};

pub const FF_JSREFTEST: &str = "FfJsRefTest";
pub const FF_JSREFTEST_IONEAGER: &str = "FfJsRefTest_IonEager";
pub const D8_JSREFTEST: &str = "D8JsRefTest";

const SHELL_JS: &str = "shell.js";

/// A pure function from `(test_case_root_dir, fuzz_file_path)` to the
/// interpreter argument string.
pub type GenFn = fn(&Path, &Path) -> FuzzmillResult<String>;

/// Look up a registered generator by name.
pub fn generator(name: &str) -> FuzzmillResult<GenFn> {
    match name {
        FF_JSREFTEST => Ok(ff_jsreftest),
        FF_JSREFTEST_IONEAGER => Ok(ff_jsreftest_ion_eager),
        D8_JSREFTEST => Ok(d8_jsreftest),
        other => Err(FuzzmillError::ArgGen(format!("unknown generator: {other}"))),
    }
}

/// Arguments for Firefox jsreftests: `-f` each `shell.js` between the root
/// and the test, outermost first, then `-f` the test itself.
pub fn ff_jsreftest(test_base_dir: &Path, test_path: &Path) -> FuzzmillResult<String> {
    ff_args(test_base_dir, test_path, false)
}

/// As [`ff_jsreftest`], with `--ion-eager` prepended.
pub fn ff_jsreftest_ion_eager(test_base_dir: &Path, test_path: &Path) -> FuzzmillResult<String> {
    ff_args(test_base_dir, test_path, true)
}

fn ff_args(test_base_dir: &Path, test_path: &Path, ion_eager: bool) -> FuzzmillResult<String> {
    let test = normalize(test_path);
    let shells = shelljs_paths(test_base_dir, &test)?;

    let mut out = String::from("--fuzzing-safe ");
    if ion_eager {
        out.push_str("--ion-eager ");
    }
    for shell in shells.iter().rev() {
        let _ = write!(out, "-f {} ", shell.display());
    }
    let _ = write!(out, "-f {}", test.display());

    Ok(out)
}

/// Arguments to run a Firefox jsreftest under the d8 shell: the collected
/// `shell.js` files are passed as plain paths after `--expose_gc --harmony`
/// and the root `ffshellfuncs.js` shim.
pub fn d8_jsreftest(test_base_dir: &Path, test_path: &Path) -> FuzzmillResult<String> {
    let test = normalize(test_path);
    let shells = shelljs_paths(test_base_dir, &test)?;

    let mut out = String::from("--expose_gc --harmony ");
    let _ = write!(out, "{} ", test_base_dir.join("ffshellfuncs.js").display());
    for shell in shells.iter().rev() {
        let _ = write!(out, "{} ", shell.display());
    }
    let _ = write!(out, "{}", test.display());

    Ok(out)
}

/// Collect every `shell.js` in the directories between the test and the root
/// directory, innermost first and the root's last. The root `shell.js` must
/// exist; intermediate ones are optional.
fn shelljs_paths(test_base_dir: &Path, test_path: &Path) -> FuzzmillResult<Vec<PathBuf>> {
    let base = normalize(test_base_dir);
    let test = normalize(test_path);

    // Component-wise containment check, not a string prefix: /a/bc is not
    // inside /a/b.
    if !test.starts_with(&base) {
        return Err(FuzzmillError::ArgGen(format!(
            "the test at {} does not have the provided base directory {} as a prefix",
            test.display(),
            base.display()
        )));
    }

    let mut shells = Vec::new();
    let mut sub_dir = test.parent().map(Path::to_path_buf);
    while let Some(dir) = sub_dir {
        if dir == base || !dir.starts_with(&base) {
            break;
        }
        let shell = dir.join(SHELL_JS);
        if shell.is_file() {
            shells.push(shell);
        }
        sub_dir = dir.parent().map(Path::to_path_buf);
    }

    let root_shell = base.join(SHELL_JS);
    if root_shell.is_file() {
        shells.push(root_shell);
    } else {
        return Err(FuzzmillError::ArgGen(format!(
            "{} should exist, but doesn't",
            root_shell.display()
        )));
    }

    Ok(shells)
}

/// Lexical normalization: drop `.` components and resolve `..` against the
/// preceding component. Paths are not resolved against the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !path.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}
