//! Result processor stage: classifies executed cases by exit code and
//! preserves the artifacts of anything that looks like a bug.

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{FuzzmillError, FuzzmillResult, TestCase, ASAN_EXIT_CODE};

const SIGILL: i32 = 128 + 4;
const SIGABRT: i32 = 128 + 6;
const SIGFPE: i32 = 128 + 8;
const SIGKILL: i32 = 128 + 9;
const SIGSEGV: i32 = 128 + 11;
const SIGTERM: i32 = 128 + 15;

pub const BUG_DESC_NAME: &str = "bugdesc.json";
pub const STDOUT_NAME: &str = "stdout.data";
pub const STDERR_NAME: &str = "stderr.data";

/// Whether an interpreter exit code is classified as a potential bug:
/// `128 + signal` for the fatal signals of interest, or the ASAN sentinel.
pub fn is_bug_exit_code(exit_code: i32) -> bool {
    matches!(
        exit_code,
        SIGILL | SIGABRT | SIGFPE | SIGKILL | SIGSEGV | SIGTERM | ASAN_EXIT_CODE
    )
}

/// Record stored as `bugdesc.json` next to a preserved crash. All file names
/// are relative to the directory the descriptor is found in; paths are
/// absolute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BugDescriptor {
    /// Name of the file that triggers the bug.
    pub trigger_file_name: String,
    /// Names of the seed copies stored in the preservation directory,
    /// flattened from their original absolute paths.
    pub seed_file_names: Vec<String>,
    pub original_seed_paths: Vec<PathBuf>,
    pub application_path: PathBuf,
    pub application_env: Vec<String>,
    pub run_exit_code: i32,
    pub run_exe_seconds: u64,
    pub run_stdout_path: PathBuf,
    pub run_stderr_path: PathBuf,
    /// Total number of tests generated, including this one, at the time the
    /// bug was recorded.
    pub overall_test_case_count: u64,
    /// Per-seed generation counts, including this test, at the time the bug
    /// was recorded.
    pub seed_file_test_case_counts: BTreeMap<PathBuf, u64>,
}

impl BugDescriptor {
    pub fn from_test_case(tc: &TestCase) -> Self {
        Self {
            seed_file_test_case_counts: tc.seed_fuzz_counts.clone(),
            overall_test_case_count: tc.total_fuzz_count,
            run_exe_seconds: tc.exe_seconds,
            run_exit_code: tc.exit_code,
            application_env: tc.application_env.clone(),
            application_path: tc.application_path.clone(),
            original_seed_paths: tc.seed_file_paths.clone(),
            ..Default::default()
        }
    }
}

/// Worker loop: preserve bug cases under the preservation directory and
/// delete the mutants of everything else.
pub fn run_result_processor(
    preservation_dir: PathBuf,
    input: Receiver<TestCase>,
    out: Sender<TestCase>,
    errors: Sender<FuzzmillError>,
) {
    loop {
        let mut tc = match input.recv() {
            Ok(tc) => tc,
            Err(_) => return,
        };
        if tc.is_sentinel() {
            let _ = out.send(tc);
            return;
        }

        // A timed out case never gets this far with a bug code: its exit
        // code is still zero-initialized.
        if is_bug_exit_code(tc.exit_code) {
            match preserve_case(&preservation_dir, &tc) {
                Ok(crash_dir) => {
                    tc.bug_found = true;
                    tc.preservation_dir = crash_dir;
                }
                Err(err) => {
                    let _ = errors.send(err);
                    continue;
                }
            }
        } else {
            tc.bug_found = false;
            if let Err(err) = std::fs::remove_file(&tc.fuzz_file_path) {
                tracing::warn!(
                    "failed to remove {}: {err}; removed by the test?",
                    tc.fuzz_file_path.display()
                );
            }
        }

        if out.send(tc).is_err() {
            return;
        }
    }
}

/// Build the per-crash directory: seed copies under flattened names, the
/// trigger moved in under its basename, captured output, and the bug
/// descriptor. Returns the directory path.
fn preserve_case(preservation_dir: &Path, tc: &TestCase) -> FuzzmillResult<PathBuf> {
    let Some(fuzz_base) = tc
        .fuzz_file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
    else {
        return Err(FuzzmillError::ResultProc(format!(
            "crash file {} has no file name",
            tc.fuzz_file_path.display()
        )));
    };

    let crash_dir = preservation_dir.join(format!("{}_{fuzz_base}", unix_seconds()));
    std::fs::create_dir(&crash_dir).map_err(|err| {
        FuzzmillError::ResultProc(format!(
            "could not create output directory {} for the crash file {}: {err}",
            crash_dir.display(),
            tc.fuzz_file_path.display()
        ))
    })?;

    let mut desc = BugDescriptor::from_test_case(tc);

    for seed in &tc.seed_file_paths {
        let flattened = seed.to_string_lossy().replace('/', "_");
        let storage_path = crash_dir.join(&flattened);
        std::fs::copy(seed, &storage_path).map_err(|err| {
            FuzzmillError::ResultProc(format!(
                "could not copy the seed file {} to {}: {err}",
                seed.display(),
                storage_path.display()
            ))
        })?;
        desc.seed_file_names.push(flattened);
    }

    let trigger_path = crash_dir.join(&fuzz_base);
    std::fs::rename(&tc.fuzz_file_path, &trigger_path).map_err(|err| {
        FuzzmillError::ResultProc(format!(
            "could not move the fuzz file {} to {}: {err}",
            tc.fuzz_file_path.display(),
            trigger_path.display()
        ))
    })?;
    desc.trigger_file_name = fuzz_base;

    let stdout_path = crash_dir.join(STDOUT_NAME);
    write_lines(&stdout_path, &tc.run_stdout)?;
    desc.run_stdout_path = stdout_path;

    let stderr_path = crash_dir.join(STDERR_NAME);
    write_lines(&stderr_path, &tc.run_stderr)?;
    desc.run_stderr_path = stderr_path;

    let json = serde_json::to_vec(&desc)?;
    std::fs::write(crash_dir.join(BUG_DESC_NAME), json)?;

    Ok(crash_dir)
}

fn write_lines(path: &Path, lines: &[String]) -> FuzzmillResult<()> {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
