//! Mutator stage: consumes mutate requests and produces fuzz files on disk,
//! emitting one test case per generated file.

use crossbeam_channel::{Receiver, Sender};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::{Config, FuzzmillError, MutateRequest, TestCase};

/// The external mutation tool, resolved through `PATH`.
pub const RADAMSA_BIN: &str = "radamsa";

/// Cumulative generation counters, kept by a mutator across requests. Every
/// emitted test case carries a snapshot of these, including itself.
#[derive(Debug, Default)]
struct FuzzCounters {
    total: u64,
    per_seed: BTreeMap<PathBuf, u64>,
}

/// Copies the single source file into the working directory unchanged. Used
/// to exercise the pipeline without perturbation.
pub struct Nop {
    pub working_dir: PathBuf,
}

impl Nop {
    pub fn run(
        self,
        requests: Receiver<MutateRequest>,
        out: Sender<TestCase>,
        errors: Sender<FuzzmillError>,
    ) {
        let mut counters = FuzzCounters::default();

        loop {
            let req = match requests.recv() {
                Ok(req) => req,
                Err(_) => break,
            };
            if req.is_sentinel() {
                break;
            }

            let source = req.source_files[0].clone();
            let Some(file_name) = source.file_name() else {
                let _ = errors.send(FuzzmillError::Mutator(format!(
                    "seed file {} has no file name",
                    source.display()
                )));
                continue;
            };
            let output_path = self.working_dir.join(file_name);
            if let Err(err) = std::fs::copy(&source, &output_path) {
                let _ = errors.send(err.into());
                continue;
            }

            counters.total += 1;
            let per_seed = counters.per_seed.entry(source.clone()).or_insert(0);
            *per_seed += 1;

            let mut tc = TestCase::default();
            tc.fuzz_file_path = output_path;
            tc.seed_fuzz_counts.insert(source.clone(), *per_seed);
            tc.seed_file_paths = vec![source];
            tc.total_fuzz_count = counters.total;

            if out.send(tc).is_err() {
                return;
            }
        }

        let _ = out.send(TestCase::sentinel());
    }
}

/// Mutator backed by the external radamsa fuzzer, for requests carrying a
/// single seed file.
pub struct Radamsa {
    pub config: Config,
    pub test_cases_dir: PathBuf,
}

impl Radamsa {
    pub fn run(
        self,
        requests: Receiver<MutateRequest>,
        out: Sender<TestCase>,
        errors: Sender<FuzzmillError>,
    ) {
        let mut counters = FuzzCounters::default();
        // Changes the radamsa seed on each invocation.
        let mut seed_inc: u64 = 0;

        loop {
            let req = match requests.recv() {
                Ok(req) => req,
                Err(_) => break,
            };
            if req.is_sentinel() {
                break;
            }
            if req.source_files.len() > 1 {
                let _ = errors.send(FuzzmillError::Mutator(
                    "for multiple source files use radamsa_multifile, not radamsa".to_string(),
                ));
                continue;
            }

            seed_inc += 1;
            if !mutate_batch(
                &self.config,
                &self.test_cases_dir,
                &req,
                seed_inc,
                &mut counters,
                &out,
                &errors,
            ) {
                return;
            }
        }

        let _ = out.send(TestCase::sentinel());
    }
}

/// Mutator backed by the external radamsa fuzzer, generating each fuzz file
/// from multiple seed files at once.
pub struct RadamsaMultiFile {
    pub config: Config,
    pub test_cases_dir: PathBuf,
}

impl RadamsaMultiFile {
    pub fn run(
        self,
        requests: Receiver<MutateRequest>,
        out: Sender<TestCase>,
        errors: Sender<FuzzmillError>,
    ) {
        let mut counters = FuzzCounters::default();
        let mut seed_inc: u64 = 0;

        loop {
            let req = match requests.recv() {
                Ok(req) => req,
                Err(_) => break,
            };
            if req.is_sentinel() {
                break;
            }

            seed_inc += 1;
            if !mutate_batch(
                &self.config,
                &self.test_cases_dir,
                &req,
                seed_inc,
                &mut counters,
                &out,
                &errors,
            ) {
                return;
            }
        }

        let _ = out.send(TestCase::sentinel());
    }
}

/// Invoke radamsa for one request and emit a test case for every output it
/// produced. Returns false when the output queue is gone and the stage
/// should stop.
fn mutate_batch(
    config: &Config,
    test_cases_dir: &Path,
    req: &MutateRequest,
    seed_inc: u64,
    counters: &mut FuzzCounters,
    out: &Sender<TestCase>,
    errors: &Sender<FuzzmillError>,
) -> bool {
    // The output basename derives from the first source file.
    let source = &req.source_files[0];
    let Some(file_name) = source.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        let _ = errors.send(FuzzmillError::Mutator(format!(
            "seed file {} has no file name",
            source.display()
        )));
        return true;
    };

    let working_dir = if config.test_processing.generate_tests_in_place {
        source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    } else {
        test_cases_dir.to_path_buf()
    };
    let output_pattern = working_dir.join(format!("%n_{file_name}"));

    let args = radamsa_args(
        config.radamsa.mutations.as_deref(),
        config.general.seed + seed_inc,
        req.count,
        &output_pattern,
        &req.source_files,
    );
    tracing::debug!("running radamsa with the following arguments: {args:?}");

    match Command::new(RADAMSA_BIN).args(&args).status() {
        Ok(status) if status.success() => {}
        Ok(status) => {
            let _ = errors.send(FuzzmillError::Mutator(format!(
                "radamsa exited with {status}"
            )));
            return true;
        }
        Err(err) => {
            let _ = errors.send(FuzzmillError::Mutator(format!(
                "error running radamsa: {err}"
            )));
            return true;
        }
    }

    collect_batch(
        &working_dir,
        &file_name,
        &req.source_files,
        req.count,
        counters,
        out,
        errors,
    )
}

fn radamsa_args(
    mutations: Option<&str>,
    seed: u64,
    count: u64,
    output_pattern: &Path,
    sources: &[PathBuf],
) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(mutations) = mutations {
        if !mutations.is_empty() {
            args.push("-m".to_string());
            args.push(mutations.to_string());
        }
    }
    args.push("--seed".to_string());
    args.push(seed.to_string());
    args.push("-n".to_string());
    args.push(count.to_string());
    args.push("-o".to_string());
    args.push(output_pattern.to_string_lossy().into_owned());
    for source in sources {
        args.push(source.to_string_lossy().into_owned());
    }
    args
}

/// Verify each expected output `<i>_<basename>` for i in 1..=count and emit
/// a test case for those that exist. A missing output is reported as a stage
/// error without aborting the batch. Returns false when the output queue is
/// gone.
fn collect_batch(
    working_dir: &Path,
    file_name: &str,
    sources: &[PathBuf],
    count: u64,
    counters: &mut FuzzCounters,
    out: &Sender<TestCase>,
    errors: &Sender<FuzzmillError>,
) -> bool {
    for i in 1..=count {
        let expected = working_dir.join(format!("{i}_{file_name}"));
        if !expected.is_file() {
            let _ = errors.send(FuzzmillError::Mutator(format!(
                "fuzz file {} was not generated",
                expected.display()
            )));
            continue;
        }

        counters.total += 1;
        let mut tc = TestCase::default();
        for source in sources {
            let per_seed = counters.per_seed.entry(source.clone()).or_insert(0);
            *per_seed += 1;
            tc.seed_fuzz_counts.insert(source.clone(), *per_seed);
        }
        tc.total_fuzz_count = counters.total;
        tc.fuzz_file_path = expected;
        tc.seed_file_paths = sources.to_vec();

        if out.send(tc).is_err() {
            return false;
        }
    }

    true
}
