//! Execution monitor stage: runs the interpreter on one fuzz file under a
//! wall-clock budget and records how it died.

use crossbeam_channel::{Receiver, Sender};
use wait_timeout::ChildExt;

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::arggen::GenFn;
use crate::{Config, FuzzmillError, FuzzmillResult, TestCase, FUZZ_FILE_DIR_MARKER, FUZZ_FILE_MARKER};

/// Exit code AddressSanitizer is configured to use on abort, so ASAN
/// failures can be told apart from regular signal deaths.
pub const ASAN_EXIT_CODE: i32 = 57;

/// At most this many lines are kept from each of the child's output
/// streams.
const MAX_CAPTURED_LINES: usize = 200;

/// Number of monitor workers sharing the stage's input queue.
pub fn monitor_worker_count() -> usize {
    2 * std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Everything a monitor worker needs from the configuration, resolved once
/// before the pool starts.
#[derive(Debug, Clone)]
pub struct MonitorContext {
    pub interpreter_path: PathBuf,
    /// Argument template with `XXX_FUZZFILE_XXX` markers. Exactly one of
    /// this and `arg_gen` is set.
    pub args_template: Option<String>,
    /// Registered argument generator.
    pub arg_gen: Option<GenFn>,
    /// Root directory passed to the argument generator.
    pub test_case_root_dir: PathBuf,
    pub timeout: Duration,
}

impl MonitorContext {
    pub fn from_config(cfg: &Config) -> FuzzmillResult<Self> {
        let args_template = cfg.interpreter.args.clone().filter(|s| !s.is_empty());
        let arg_gen = match &args_template {
            Some(_) => None,
            None => {
                let name = cfg.interpreter.arg_gen.as_deref().unwrap_or_default();
                Some(crate::arggen::generator(name)?)
            }
        };

        Ok(Self {
            interpreter_path: cfg.interpreter.path.clone(),
            args_template,
            arg_gen,
            test_case_root_dir: cfg
                .interpreter
                .test_case_root_dir
                .clone()
                .unwrap_or_default(),
            timeout: Duration::from_secs(cfg.interpreter.timeout),
        })
    }

    fn synthesize_args(&self, fuzz_file: &Path, fuzz_dir: &Path) -> FuzzmillResult<String> {
        if let Some(template) = &self.args_template {
            let args = template.replace(FUZZ_FILE_MARKER, &fuzz_file.to_string_lossy());
            Ok(args.replace(FUZZ_FILE_DIR_MARKER, &fuzz_dir.to_string_lossy()))
        } else if let Some(arg_gen) = self.arg_gen {
            arg_gen(&self.test_case_root_dir, fuzz_file)
        } else {
            Err(FuzzmillError::Monitor(
                "no interpreter arguments configured".to_string(),
            ))
        }
    }
}

/// Worker loop: pull one case at a time from the shared input queue, execute
/// it, and forward the annotated case. A failed case is reported on the
/// error channel and never kills the stage.
pub fn run_monitor(
    ctx: MonitorContext,
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

        match execute_case(&ctx, &mut tc) {
            Ok(()) => {
                if out.send(tc).is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = errors.send(err);
            }
        }
    }
}

fn env_mods() -> [(String, String); 2] {
    [
        (
            "ASAN_OPTIONS".to_string(),
            format!("exitcode={ASAN_EXIT_CODE}:allocator_may_return_null=1"),
        ),
        ("MALLOC_CHECK_".to_string(), "2".to_string()),
    ]
}

/// Run one case: snapshot the mutant, spawn the interpreter in the snapshot
/// directory, wait under the time budget, then restore the mutant and
/// record the outcome on the case. Emission-worthy outcomes (completion and
/// timeout) return `Ok`; per-case failures return `Err`.
fn execute_case(ctx: &MonitorContext, tc: &mut TestCase) -> FuzzmillResult<()> {
    tc.application_path = ctx.interpreter_path.clone();
    for (key, value) in env_mods() {
        tc.application_env.push(format!("{key}={value}"));
    }

    let fuzz_file = tc.fuzz_file_path.clone();
    let Some(base) = fuzz_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
    else {
        return Err(FuzzmillError::Monitor(format!(
            "fuzz file {} has no file name",
            fuzz_file.display()
        )));
    };
    let Some(dir) = fuzz_file.parent().map(Path::to_path_buf) else {
        return Err(FuzzmillError::Monitor(format!(
            "fuzz file {} has no parent directory",
            fuzz_file.display()
        )));
    };

    // The snapshot directory name embeds the mutant basename, which is
    // unique per mutator invocation, so concurrent workers never collide.
    let snapshot_dir = dir.join(format!("{}_{base}", unix_seconds()));
    std::fs::create_dir(&snapshot_dir).map_err(|err| {
        FuzzmillError::Monitor(format!(
            "could not create snapshot directory {}: {err}",
            snapshot_dir.display()
        ))
    })?;

    let file_data = std::fs::read(&fuzz_file).map_err(|err| {
        FuzzmillError::Monitor(format!(
            "could not read the fuzz file {}: {err}",
            fuzz_file.display()
        ))
    })?;

    // Back the mutant up in case the interpreter modifies it in place.
    let backup_path = snapshot_dir.join(&base);
    std::fs::write(&backup_path, &file_data).map_err(|err| {
        FuzzmillError::Monitor(format!(
            "could not write {} to {}: {err}",
            fuzz_file.display(),
            backup_path.display()
        ))
    })?;

    let args_str = ctx.synthesize_args(&fuzz_file, &dir)?;
    let Some(argv) = shlex::split(&args_str) else {
        return Err(FuzzmillError::Monitor(format!(
            "failed to parse target arguments: {args_str}"
        )));
    };

    let mut cmd = Command::new(&ctx.interpreter_path);
    cmd.args(&argv)
        .current_dir(&snapshot_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in env_mods() {
        cmd.env(key, value);
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|err| {
        FuzzmillError::Monitor(format!(
            "error {err} running {} on {}",
            ctx.interpreter_path.display(),
            fuzz_file.display()
        ))
    })?;

    let stdout_reader = child.stdout.take().map(capture_lines);
    let stderr_reader = child.stderr.take().map(capture_lines);

    let status = match child.wait_timeout(ctx.timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            // Over budget: kill it and report the case as timed out.
            if let Err(err) = child.kill() {
                tracing::warn!("could not kill test process: {err}");
            } else {
                tracing::info!("process took too long to finish and was killed");
            }
            let _ = child.wait();
            drain(stdout_reader);
            drain(stderr_reader);
            tc.test_timed_out = true;
            remove_snapshot(&snapshot_dir);
            return Ok(());
        }
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            drain(stdout_reader);
            drain(stderr_reader);
            return Err(FuzzmillError::Monitor(format!(
                "error waiting for {}: {err}",
                ctx.interpreter_path.display()
            )));
        }
    };

    tc.test_timed_out = false;
    tc.exe_seconds = start.elapsed().as_secs();

    let stdout_data = drain(stdout_reader);
    let stderr_data = drain(stderr_reader);

    // The interpreter may have rewritten the fuzz file during the run; put
    // the original bytes back. Should this fail, the backup still remains.
    std::fs::write(&fuzz_file, &file_data).map_err(|err| {
        FuzzmillError::Monitor(format!("could not write {}: {err}", fuzz_file.display()))
    })?;

    remove_snapshot(&snapshot_dir);

    tc.exit_code = os_exit_code(status);
    if tc.exit_code != 0 {
        tc.run_stdout = stdout_data;
        tc.run_stderr = stderr_data;
    }

    Ok(())
}

/// Read one output stream on its own thread, keeping the first lines but
/// draining to EOF so the child never blocks on a full pipe.
fn capture_lines<R: Read + Send + 'static>(stream: R) -> JoinHandle<Vec<String>> {
    std::thread::spawn(move || {
        let mut lines = Vec::new();
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            if lines.len() < MAX_CAPTURED_LINES {
                lines.push(line);
            }
        }
        lines
    })
}

fn drain(reader: Option<JoinHandle<Vec<String>>>) -> Vec<String> {
    reader.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn remove_snapshot(dir: &Path) {
    if let Err(err) = std::fs::remove_dir_all(dir) {
        tracing::warn!(
            "could not remove snapshot directory {}: {err}",
            dir.display()
        );
    }
}

/// OS-level exit status: the exit code, or `128 + signal` for a
/// signal-terminated child.
fn os_exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use uuid::Uuid;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fuzzmill-monitor-{name}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn sh_ctx(template: &str, timeout: u64) -> MonitorContext {
        MonitorContext {
            interpreter_path: PathBuf::from("/bin/sh"),
            args_template: Some(template.to_string()),
            arg_gen: None,
            test_case_root_dir: PathBuf::new(),
            timeout: Duration::from_secs(timeout),
        }
    }

    fn case_in(dir: &Path) -> TestCase {
        let fuzz = dir.join("1_case.js");
        std::fs::write(&fuzz, b"var x = 1;\n").expect("write fuzz");
        let mut tc = TestCase::default();
        tc.seed_file_paths = vec![PathBuf::from("/tmp/seed.js")];
        tc.fuzz_file_path = fuzz;
        tc
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn clean_exit_leaves_no_output_and_no_snapshot() {
        let dir = temp_dir("clean");
        let mut tc = case_in(&dir);

        execute_case(&sh_ctx("-c true", 5), &mut tc).expect("execute");

        assert!(!tc.test_timed_out);
        assert_eq!(tc.exit_code, 0);
        assert!(tc.run_stdout.is_empty());
        assert!(tc.run_stderr.is_empty());
        assert_eq!(tc.application_path, PathBuf::from("/bin/sh"));
        assert!(tc
            .application_env
            .iter()
            .any(|e| e == "ASAN_OPTIONS=exitcode=57:allocator_may_return_null=1"));
        assert!(tc.application_env.iter().any(|e| e == "MALLOC_CHECK_=2"));
        // Snapshot directory is gone; only the mutant remains.
        assert_eq!(files_in(&dir), vec!["1_case.js".to_string()]);
    }

    #[test]
    fn nonzero_exit_captures_output() {
        let dir = temp_dir("nonzero");
        let mut tc = case_in(&dir);

        execute_case(
            &sh_ctx(r#"-c "echo out; echo err 1>&2; exit 3""#, 5),
            &mut tc,
        )
        .expect("execute");

        assert_eq!(tc.exit_code, 3);
        assert_eq!(tc.run_stdout, vec!["out".to_string()]);
        assert_eq!(tc.run_stderr, vec!["err".to_string()]);
    }

    #[test]
    fn signal_death_maps_to_128_plus_signal() {
        let dir = temp_dir("signal");
        let mut tc = case_in(&dir);

        execute_case(&sh_ctx(r#"-c "kill -ABRT $$""#, 5), &mut tc).expect("execute");

        assert_eq!(tc.exit_code, 134);
    }

    #[test]
    fn overrun_is_killed_and_reported_as_timeout() {
        let dir = temp_dir("timeout");
        let mut tc = case_in(&dir);

        execute_case(&sh_ctx(r#"-c "exec sleep 30""#, 1), &mut tc).expect("execute");

        assert!(tc.test_timed_out);
        assert_eq!(tc.exit_code, 0);
        // The snapshot was cleaned up and the mutant is still in place for
        // the result processor to dispose of.
        assert_eq!(files_in(&dir), vec!["1_case.js".to_string()]);
    }

    #[test]
    fn fuzz_file_is_restored_after_the_run() {
        let dir = temp_dir("restore");
        let mut tc = case_in(&dir);

        execute_case(
            &sh_ctx(r#"-c "echo junk > XXX_FUZZFILE_XXX; exit 5""#, 5),
            &mut tc,
        )
        .expect("execute");

        assert_eq!(tc.exit_code, 5);
        let restored = std::fs::read(&tc.fuzz_file_path).expect("read back");
        assert_eq!(restored, b"var x = 1;\n");
    }

    #[test]
    fn unbalanced_quotes_fail_the_case() {
        let dir = temp_dir("quotes");
        let mut tc = case_in(&dir);

        let err = execute_case(&sh_ctx("-c 'oops", 5), &mut tc).expect_err("must fail");
        assert!(err.to_string().contains("parse target arguments"));
    }

    #[test]
    fn arg_gen_prefix_failure_is_a_stage_error() {
        let root = temp_dir("arggen-root");
        let ctx = MonitorContext {
            interpreter_path: PathBuf::from("/bin/sh"),
            args_template: None,
            arg_gen: Some(crate::arggen::ff_jsreftest),
            test_case_root_dir: root,
            timeout: Duration::from_secs(5),
        };

        let dir = temp_dir("arggen-case");
        let mut tc = case_in(&dir);
        let err = execute_case(&ctx, &mut tc).expect_err("must fail");
        assert!(err.to_string().contains("does not have"));
    }

    #[test]
    fn worker_forwards_cases_and_sentinel() {
        let dir = temp_dir("worker");
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let (err_tx, err_rx) = unbounded();

        let ctx = sh_ctx("-c true", 5);
        let handle = std::thread::spawn(move || run_monitor(ctx, in_rx, out_tx, err_tx));

        in_tx.send(case_in(&dir)).expect("send case");
        in_tx.send(TestCase::sentinel()).expect("send sentinel");
        handle.join().expect("join");

        let cases: Vec<TestCase> = out_rx.try_iter().collect();
        assert_eq!(cases.len(), 2);
        assert!(!cases[0].is_sentinel());
        assert_eq!(cases[0].exit_code, 0);
        assert!(cases[1].is_sentinel());
        assert!(err_rx.try_iter().next().is_none());
    }

    #[test]
    fn worker_reports_a_failed_case_and_continues() {
        let dir = temp_dir("worker-err");
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let (err_tx, err_rx) = unbounded();

        // Unparseable arguments fail every case, but the worker keeps
        // consuming input.
        let ctx = sh_ctx("-c 'oops", 5);
        let handle = std::thread::spawn(move || run_monitor(ctx, in_rx, out_tx, err_tx));

        in_tx.send(case_in(&dir)).expect("send case");
        in_tx.send(TestCase::sentinel()).expect("send sentinel");
        handle.join().expect("join");

        let cases: Vec<TestCase> = out_rx.try_iter().collect();
        assert_eq!(cases.len(), 1);
        assert!(cases[0].is_sentinel());
        assert_eq!(err_rx.try_iter().count(), 1);
    }
}
