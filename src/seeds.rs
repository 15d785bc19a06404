//! Seed test discovery.

use walkdir::WalkDir;

use std::path::{Path, PathBuf};

use crate::{Config, FuzzmillError, FuzzmillResult};

/// Collect the seed tests named by the configuration, either by walking
/// `seed_tests.dir` or by reading `seed_tests.list_file`.
pub fn load_seeds(cfg: &Config) -> FuzzmillResult<Vec<PathBuf>> {
    if let Some(dir) = cfg.seed_tests.dir.as_deref() {
        tracing::info!("seed tests will be extracted from {}", dir.display());
        tracing::info!(
            "searching for tests with the following extensions: {:?}",
            cfg.seed_tests.valid_exts
        );
        find_seed_files(dir, &cfg.seed_tests.valid_exts)
    } else if let Some(file) = cfg.seed_tests.list_file.as_deref() {
        tracing::info!("seed tests will be extracted from {}", file.display());
        read_seed_list(file)
    } else {
        // validate() guarantees one of the two is set.
        Err(FuzzmillError::Config(
            "no seed test source configured".to_string(),
        ))
    }
}

/// Recursively walk `dir` collecting files whose extension (including the
/// leading dot) appears in `wanted_exts`.
pub fn find_seed_files(dir: &Path, wanted_exts: &[String]) -> FuzzmillResult<Vec<PathBuf>> {
    let mut out = Vec::new();

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| {
            let msg = e.to_string();
            FuzzmillError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other(msg)),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let ext = match path.extension() {
            Some(ext) => format!(".{}", ext.to_string_lossy()),
            None => continue,
        };
        if wanted_exts.iter().any(|w| *w == ext) {
            out.push(path.to_path_buf());
        }
    }

    Ok(out)
}

/// Read a newline-delimited list of seed paths. Every path must point to an
/// existing regular file.
pub fn read_seed_list(file: &Path) -> FuzzmillResult<Vec<PathBuf>> {
    let raw = std::fs::read_to_string(file)?;
    let mut out = Vec::new();

    for line in raw.lines() {
        if line.is_empty() {
            continue;
        }
        let path = PathBuf::from(line);
        let meta = std::fs::metadata(&path)
            .map_err(|_| FuzzmillError::Config(format!("{line} is not a regular file")))?;
        if !meta.is_file() {
            return Err(FuzzmillError::Config(format!(
                "{line} is not a regular file"
            )));
        }
        out.push(path);
    }

    Ok(out)
}
