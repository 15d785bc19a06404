//! Durable session state: configuration snapshot, cumulative stats, and the
//! on-disk directory layout.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::{Config, FuzzmillError, FuzzmillResult};

pub const SESSION_FILE: &str = "session.json";
pub const SESSION_FILE_BCK: &str = "session.json.bck";
pub const CONFIG_FILE: &str = "config.cfg";
pub const SUMMARY_FILE: &str = "summary.txt";
pub const DEBUG_LOG: &str = "debug.log";
pub const TEST_CASES_DIR: &str = "test_cases";
pub const PRESERVATION_DIR: &str = "crashes";

const DIR_PERMS: u32 = 0o755;

/// Cumulative counters for a run. Mutated only by the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub crash_count: u64,
    pub tests_processed: u64,
    pub timed_out_tests: u64,
    /// Histogram of interpreter exit codes, keyed by the decimal code.
    pub exit_code_counts: BTreeMap<String, u64>,
    pub tests_processed_per_seed: BTreeMap<PathBuf, u64>,
}

impl Stats {
    pub fn add_test_case_for_seed(&mut self, seed: &Path) {
        *self
            .tests_processed_per_seed
            .entry(seed.to_path_buf())
            .or_insert(0) += 1;
    }

    pub fn add_exit_code(&mut self, exit_code: i32) {
        *self
            .exit_code_counts
            .entry(exit_code.to_string())
            .or_insert(0) += 1;
    }
}

/// Enough information to restart a run without reprocessing already covered
/// seeds. Resuming only makes sense when the run mode covers each seed once;
/// any other mode should simply be restarted with a different seed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Directory this session was loaded from. Rebound on resume so the
    /// session directory can be relocated between runs.
    pub session_dir: PathBuf,
    pub test_cases_dir: PathBuf,
    pub preservation_dir: PathBuf,
    pub config: Config,
    pub stats: Stats,
}

impl Session {
    /// Create a fresh session: load and validate the configuration, build
    /// the directory skeleton, snapshot the config file, and persist empty
    /// stats. Fails if `session_dir` already exists.
    pub fn create(session_dir: &Path, config_path: &Path) -> FuzzmillResult<Self> {
        let config = Config::load(config_path)?;

        if session_dir.exists() {
            return Err(FuzzmillError::Session(format!(
                "session directory {} already exists",
                session_dir.display()
            )));
        }

        mkdir(session_dir)?;
        let test_cases_dir = session_dir.join(TEST_CASES_DIR);
        mkdir(&test_cases_dir)?;
        let preservation_dir = session_dir.join(PRESERVATION_DIR);
        mkdir(&preservation_dir)?;

        let session = Session {
            session_dir: session_dir.to_path_buf(),
            test_cases_dir,
            preservation_dir,
            config,
            stats: Stats::default(),
        };
        session.save()?;

        std::fs::copy(config_path, session_dir.join(CONFIG_FILE))?;

        Ok(session)
    }

    /// Load an existing session from `session_dir`. The persisted
    /// `session_dir` value is ignored so the directory can be moved.
    pub fn resume(session_dir: &Path) -> FuzzmillResult<Self> {
        let raw = std::fs::read_to_string(session_dir.join(SESSION_FILE))?;
        let mut session: Session = serde_json::from_str(&raw)?;
        session.session_dir = session_dir.to_path_buf();
        Ok(session)
    }

    /// Store the session back to the directory it was loaded from. An
    /// existing `session.json` is copied to `session.json.bck` first, so the
    /// last successful state survives a failed write.
    pub fn save(&self) -> FuzzmillResult<()> {
        let sess_path = self.session_dir.join(SESSION_FILE);

        if sess_path.exists() {
            std::fs::copy(&sess_path, self.session_dir.join(SESSION_FILE_BCK))?;
        }

        let json = serde_json::to_string(self)?;
        std::fs::write(&sess_path, json)?;
        Ok(())
    }

    /// Overwrite `summary.txt` with a human-readable digest of the stats.
    pub fn log_summary(&self) -> FuzzmillResult<()> {
        let mut out = String::new();
        let _ = writeln!(out, "Total tests run: {}", self.stats.tests_processed);
        let _ = writeln!(out, "Crashes detected: {}", self.stats.crash_count);
        let _ = writeln!(out, "Timed out tests: {}\n", self.stats.timed_out_tests);

        let _ = writeln!(out, "Exit code counts:");
        for (exit_code, count) in &self.stats.exit_code_counts {
            let _ = writeln!(out, "{exit_code} : {count}");
        }

        let _ = writeln!(out, "\nTests per seed:");
        for (seed, count) in &self.stats.tests_processed_per_seed {
            let _ = writeln!(out, "{} {count}", seed.display());
        }

        std::fs::write(self.session_dir.join(SUMMARY_FILE), out)?;
        Ok(())
    }
}

fn mkdir(path: &Path) -> FuzzmillResult<()> {
    use std::os::unix::fs::DirBuilderExt;

    let mut builder = std::fs::DirBuilder::new();
    builder.mode(DIR_PERMS);
    builder.create(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fuzzmill-session-{name}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn write_config(root: &Path) -> PathBuf {
        let seed = root.join("seed.js");
        std::fs::write(&seed, b"var x = 1;\n").expect("write seed");
        let list = root.join("seeds.txt");
        std::fs::write(&list, format!("{}\n", seed.display())).expect("write list");

        let path = root.join("fuzz.toml");
        let raw = format!(
            r#"
            [general]
            seed = 7

            [seed_tests]
            list_file = "{}"

            [test_processing]
            fuzzer = "nop"
            batch_size = 1
            mode = "cover_all_once"

            [interpreter]
            path = "/bin/true"
            args = "XXX_FUZZFILE_XXX"
            timeout = 5
            "#,
            list.display()
        );
        std::fs::write(&path, raw).expect("write config");
        path
    }

    #[test]
    fn create_builds_layout() {
        let root = temp_root("create");
        let config_path = write_config(&root);
        let dir = root.join("session");

        let session = Session::create(&dir, &config_path).expect("create");

        assert!(dir.join(SESSION_FILE).is_file());
        assert!(dir.join(CONFIG_FILE).is_file());
        assert!(session.test_cases_dir.is_dir());
        assert!(session.preservation_dir.is_dir());
        assert_eq!(session.stats, Stats::default());
    }

    #[test]
    fn create_fails_on_existing_dir() {
        let root = temp_root("exists");
        let config_path = write_config(&root);
        let dir = root.join("session");
        std::fs::create_dir_all(&dir).expect("mkdir");

        assert!(Session::create(&dir, &config_path).is_err());
    }

    #[test]
    fn save_then_resume_round_trips() {
        let root = temp_root("roundtrip");
        let config_path = write_config(&root);
        let dir = root.join("session");

        let mut session = Session::create(&dir, &config_path).expect("create");
        session.stats.tests_processed = 3;
        session.stats.crash_count = 1;
        session.stats.add_exit_code(139);
        session
            .stats
            .add_test_case_for_seed(Path::new("/tmp/a.js"));
        session.save().expect("save");

        // The first save wrote session.json; the second backs it up.
        assert!(dir.join(SESSION_FILE_BCK).is_file());

        let resumed = Session::resume(&dir).expect("resume");
        assert_eq!(resumed.stats, session.stats);
        assert_eq!(resumed.test_cases_dir, session.test_cases_dir);
        assert_eq!(resumed.preservation_dir, session.preservation_dir);
    }

    #[test]
    fn resume_rebinds_session_dir() {
        let root = temp_root("rebind");
        let config_path = write_config(&root);
        let dir = root.join("session");

        Session::create(&dir, &config_path).expect("create");

        let moved = root.join("relocated");
        std::fs::rename(&dir, &moved).expect("rename");

        let resumed = Session::resume(&moved).expect("resume");
        assert_eq!(resumed.session_dir, moved);
    }

    #[test]
    fn summary_reports_totals() {
        let root = temp_root("summary");
        let config_path = write_config(&root);
        let dir = root.join("session");

        let mut session = Session::create(&dir, &config_path).expect("create");
        session.stats.tests_processed = 5;
        session.stats.timed_out_tests = 1;
        session.stats.add_exit_code(0);
        session.stats.add_exit_code(0);
        session.stats.add_exit_code(139);
        session
            .stats
            .add_test_case_for_seed(Path::new("/tmp/a.js"));
        session.log_summary().expect("summary");

        let text = std::fs::read_to_string(dir.join(SUMMARY_FILE)).expect("read summary");
        assert!(text.contains("Total tests run: 5"));
        assert!(text.contains("Timed out tests: 1"));
        assert!(text.contains("0 : 2"));
        assert!(text.contains("139 : 1"));
        assert!(text.contains("/tmp/a.js 1"));
    }
}
