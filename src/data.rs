//! Messages that flow through the fuzzing pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// One generated test, passed along the pipeline from the mutator, through a
/// monitor, through the result processor, and finally out to the manager.
/// Each stage takes ownership from its input queue and fills in the fields it
/// is responsible for before sending the case downstream.
#[derive(Debug, Clone, Default)]
pub struct TestCase {
    /// Paths to the seed files this case was generated from. Filled in by
    /// the mutator. Empty for the end-of-stream sentinel.
    pub seed_file_paths: Vec<PathBuf>,
    /// Path to the fuzz file to execute. Filled in by the mutator.
    pub fuzz_file_path: PathBuf,
    /// Cumulative number of tests generated from each seed in
    /// `seed_file_paths`, including this one. Filled in by the mutator.
    pub seed_fuzz_counts: BTreeMap<PathBuf, u64>,
    /// Cumulative number of tests generated across all seeds, including this
    /// one. Filled in by the mutator.
    pub total_fuzz_count: u64,

    /// Path of the interpreter the case was executed with. Filled in by the
    /// monitor.
    pub application_path: PathBuf,
    /// Extra `KEY=VALUE` environment entries injected into the interpreter.
    /// Filled in by the monitor.
    pub application_env: Vec<String>,
    /// Whether the monitor killed the interpreter for exceeding its time
    /// budget.
    pub test_timed_out: bool,
    /// Whole seconds the execution took. Valid only when `test_timed_out` is
    /// false.
    pub exe_seconds: u64,
    /// Exit code of the interpreter. Valid only when `test_timed_out` is
    /// false; signal terminations are reported as `128 + signal`.
    pub exit_code: i32,
    /// First lines written to stdout, attached when the exit code is
    /// non-zero.
    pub run_stdout: Vec<String>,
    /// First lines written to stderr, attached when the exit code is
    /// non-zero.
    pub run_stderr: Vec<String>,

    /// Whether the result processor considered this case to trigger a bug.
    pub bug_found: bool,
    /// Directory the artifacts were preserved under. Set only when
    /// `bug_found` is true.
    pub preservation_dir: PathBuf,
}

impl TestCase {
    /// The end-of-stream marker. Every stage forwards it downstream and then
    /// exits.
    pub fn sentinel() -> Self {
        Self::default()
    }

    pub fn is_sentinel(&self) -> bool {
        self.seed_file_paths.is_empty()
    }
}

/// A request from the manager to the mutator for one batch of fuzz files.
#[derive(Debug, Clone, Default)]
pub struct MutateRequest {
    /// Seed files to mutate. Empty for the shutdown sentinel.
    pub source_files: Vec<PathBuf>,
    /// Number of fuzz files to generate.
    pub count: u64,
}

impl MutateRequest {
    pub fn new(source_files: Vec<PathBuf>, count: u64) -> Self {
        Self {
            source_files,
            count,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.source_files.is_empty()
    }
}
