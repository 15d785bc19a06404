//! TOML configuration loading and validation.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

use crate::{FuzzmillError, FuzzmillResult};

pub const FUZZER_RADAMSA: &str = "radamsa";
pub const FUZZER_RADAMSA_MULTIFILE: &str = "radamsa_multifile";
pub const FUZZER_NOP: &str = "nop";

pub const MODE_COVER_ALL_ONCE: &str = "cover_all_once";
pub const MODE_INFINITE_RANDOM: &str = "infinite_random";

/// Marker in `interpreter.args` replaced with the fuzz file path on every
/// invocation.
pub const FUZZ_FILE_MARKER: &str = "XXX_FUZZFILE_XXX";
/// Marker in `interpreter.args` replaced with the directory containing the
/// fuzz file.
pub const FUZZ_FILE_DIR_MARKER: &str = "XXX_FUZZFILEDIR_XXX";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub seed_tests: SeedTestsConfig,
    pub test_processing: TestProcessingConfig,
    #[serde(default)]
    pub radamsa: RadamsaConfig,
    pub interpreter: InterpreterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Seed for internal random number generation and for external tools
    /// such as radamsa. Must be non-zero so we know it was set on purpose.
    pub seed: u64,
    /// Write a verbose `debug.log` inside the session directory.
    #[serde(default)]
    pub enable_debug_log: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedTestsConfig {
    /// Directory traversed recursively for files ending in one of
    /// `valid_exts`. Mutually exclusive with `list_file`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Extensions (including the leading dot) that identify seed tests under
    /// `dir`.
    #[serde(default)]
    pub valid_exts: Vec<String>,
    /// Newline-delimited file of absolute seed paths. Mutually exclusive
    /// with `dir`.
    #[serde(default)]
    pub list_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestProcessingConfig {
    /// Which mutator generates fuzz files from the seeds. One of `radamsa`,
    /// `radamsa_multifile` or `nop`, case-insensitive.
    pub fuzzer: String,
    /// Minimum number of seeds fed to a multi-file mutator per request.
    #[serde(default)]
    pub multi_file_fuzzer_seed_count_min: u64,
    /// Maximum number of seeds fed to a multi-file mutator per request.
    #[serde(default)]
    pub multi_file_fuzzer_seed_count_max: u64,
    /// Number of fuzz files generated per mutate request.
    pub batch_size: u64,
    /// Upper limit on the total number of test cases to process. Zero means
    /// unbounded.
    #[serde(default)]
    pub test_count: u64,
    /// Run mode: `cover_all_once` or `infinite_random`, case-insensitive.
    pub mode: String,
    /// Generate fuzz files next to their seeds instead of in the session's
    /// scratch directory.
    #[serde(default)]
    pub generate_tests_in_place: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RadamsaConfig {
    /// Mutation list passed through to radamsa as `-m`. See `radamsa -l`.
    #[serde(default)]
    pub mutations: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Interpreter executed on each fuzz file.
    pub path: PathBuf,
    /// Argument template. Must contain `XXX_FUZZFILE_XXX` at least once;
    /// `XXX_FUZZFILEDIR_XXX` may appear any number of times. Mutually
    /// exclusive with `arg_gen`.
    #[serde(default)]
    pub args: Option<String>,
    /// Name of a registered argument generator. Mutually exclusive with
    /// `args`.
    #[serde(default)]
    pub arg_gen: Option<String>,
    /// Root directory containing all test cases; required by argument
    /// generators.
    #[serde(default)]
    pub test_case_root_dir: Option<PathBuf>,
    /// Maximum run time of a single interpreter invocation, in whole
    /// seconds.
    pub timeout: u64,
}

/// Mutator variant selected by `test_processing.fuzzer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzerKind {
    Radamsa,
    RadamsaMultiFile,
    Nop,
}

impl std::str::FromStr for FuzzerKind {
    type Err = FuzzmillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            FUZZER_RADAMSA => Ok(Self::Radamsa),
            FUZZER_RADAMSA_MULTIFILE => Ok(Self::RadamsaMultiFile),
            FUZZER_NOP => Ok(Self::Nop),
            other => Err(FuzzmillError::Config(format!(
                "invalid fuzzer selector {other:?}"
            ))),
        }
    }
}

/// Seed scheduling mode selected by `test_processing.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    CoverAllOnce,
    InfiniteRandom,
}

impl std::str::FromStr for RunMode {
    type Err = FuzzmillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            MODE_COVER_ALL_ONCE => Ok(Self::CoverAllOnce),
            MODE_INFINITE_RANDOM => Ok(Self::InfiniteRandom),
            other => Err(FuzzmillError::Config(format!("invalid mode {other:?}"))),
        }
    }
}

impl Config {
    /// Load a configuration file and check it for semantic errors. Any
    /// problem here is fatal at startup.
    pub fn load(path: &Path) -> FuzzmillResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut cfg: Config = toml::from_str(&raw).map_err(|e| {
            FuzzmillError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn fuzzer_kind(&self) -> FuzzmillResult<FuzzerKind> {
        self.test_processing.fuzzer.parse()
    }

    pub fn run_mode(&self) -> FuzzmillResult<RunMode> {
        self.test_processing.mode.parse()
    }

    /// Check the configuration for invalid combinations of options. The
    /// `fuzzer` and `mode` selectors are lowercased in place so later
    /// comparisons are exact.
    pub fn validate(&mut self) -> FuzzmillResult<()> {
        if self.general.seed == 0 {
            return Err(FuzzmillError::Config(
                "use a seed other than 0, so we know it was set on purpose".to_string(),
            ));
        }

        let has_dir = self.seed_tests.dir.is_some();
        let has_list = self.seed_tests.list_file.is_some();
        if !has_dir && !has_list {
            return Err(FuzzmillError::Config(
                "seed tests must be specified via a directory or a list file".to_string(),
            ));
        }
        if has_dir && has_list {
            return Err(FuzzmillError::Config(
                "a seed test directory and a list file cannot both be set".to_string(),
            ));
        }
        if has_dir && self.seed_tests.valid_exts.is_empty() {
            return Err(FuzzmillError::Config(
                "one or more valid seed test extensions must be provided".to_string(),
            ));
        }
        if has_list && !self.seed_tests.valid_exts.is_empty() {
            return Err(FuzzmillError::Config(
                "valid extensions have no effect with a list file; every listed test is used"
                    .to_string(),
            ));
        }

        let tp = &mut self.test_processing;
        tp.fuzzer = tp.fuzzer.to_ascii_lowercase();
        tp.mode = tp.mode.to_ascii_lowercase();
        let fuzzer: FuzzerKind = tp.fuzzer.parse()?;
        let _: RunMode = tp.mode.parse()?;

        if fuzzer == FuzzerKind::RadamsaMultiFile {
            if tp.multi_file_fuzzer_seed_count_min == 0 || tp.multi_file_fuzzer_seed_count_max == 0
            {
                return Err(FuzzmillError::Config(
                    "the multi file fuzzer seed counts must be greater than 0".to_string(),
                ));
            }
            if tp.multi_file_fuzzer_seed_count_min > tp.multi_file_fuzzer_seed_count_max {
                return Err(FuzzmillError::Config(
                    "the multi file fuzzer seed count min exceeds the max".to_string(),
                ));
            }
        }

        if tp.batch_size == 0 {
            return Err(FuzzmillError::Config(
                "set the batch size to something greater than 0".to_string(),
            ));
        }

        let interp = &self.interpreter;
        if interp.path.as_os_str().is_empty() {
            return Err(FuzzmillError::Config(
                "an interpreter path must be set".to_string(),
            ));
        }

        let using_args = interp.args.as_deref().is_some_and(|s| !s.is_empty());
        let using_gen = interp.arg_gen.as_deref().is_some_and(|s| !s.is_empty());
        if using_args == using_gen {
            return Err(FuzzmillError::Config(
                "an interpreter arguments string XOR an argument generator must be provided"
                    .to_string(),
            ));
        }

        if using_args {
            let args = interp.args.as_deref().unwrap_or_default();
            if !args.contains(FUZZ_FILE_MARKER) {
                return Err(FuzzmillError::Config(format!(
                    "the interpreter arguments ({args}) do not contain the fuzz file marker \
                     {FUZZ_FILE_MARKER}"
                )));
            }
        }

        if using_gen {
            let name = interp.arg_gen.as_deref().unwrap_or_default();
            crate::arggen::generator(name)?;

            let Some(root) = interp.test_case_root_dir.as_deref() else {
                return Err(FuzzmillError::Config(
                    "the test case root directory must be set when using an argument generator"
                        .to_string(),
                ));
            };
            if !root.exists() {
                return Err(FuzzmillError::Config(format!(
                    "the test case root directory {} does not exist",
                    root.display()
                )));
            }
        }

        if interp.timeout == 0 {
            return Err(FuzzmillError::Config(
                "the interpreter timeout must be set".to_string(),
            ));
        }

        Ok(())
    }
}
