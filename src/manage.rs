//! Pipeline assembly and the manager loop that drives it: seed selection,
//! batch requests, stats aggregation, and the termination decision.

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore as _, SeedableRng as _};

use std::path::PathBuf;
use std::time::Instant;

use crate::{
    monitor, mutate, resultproc, Config, FuzzerKind, FuzzmillError, FuzzmillResult, MonitorContext,
    MutateRequest, RunMode, Session, TestCase,
};

/// A new batch is requested once no more than `batch_size / REQ_THRESHOLD`
/// cases from the previous one are still in flight. One batch of slack hides
/// the mutator's latency.
const REQ_THRESHOLD: u64 = 2;

/// The running pipeline, seen from the manager: the request queue feeding
/// the mutator, the finalized cases coming back out, and the shared error
/// channel. Dropping `requests` starts the sentinel shutdown cascade.
struct Pipeline {
    requests: Sender<MutateRequest>,
    results: Receiver<TestCase>,
    errors: Receiver<FuzzmillError>,
}

/// Drive a full fuzzing run over the given seeds, in the mode the session's
/// configuration selects.
pub fn run(session: &mut Session, seed_files: Vec<PathBuf>) -> FuzzmillResult<()> {
    let mut rng = ChaCha20Rng::seed_from_u64(session.config.general.seed);

    match session.config.run_mode()? {
        RunMode::CoverAllOnce => cover_all_once(session, seed_files, &mut rng),
        RunMode::InfiniteRandom => infinite_random(session, seed_files, &mut rng),
    }
}

/// Drop seeds that already received a full batch in a previous session.
pub fn filter_covered_seeds(session: &Session, seeds: Vec<PathBuf>) -> Vec<PathBuf> {
    let batch_size = session.config.test_processing.batch_size;
    seeds
        .into_iter()
        .filter(|seed| {
            session
                .stats
                .tests_processed_per_seed
                .get(seed)
                .map_or(true, |&count| count < batch_size)
        })
        .collect()
}

/// Process every seed once: each is drawn uniformly without replacement and
/// receives one batch of mutants. Terminates when the seed list is exhausted
/// and the pipeline has drained.
fn cover_all_once(
    session: &mut Session,
    mut seeds: Vec<PathBuf>,
    rng: &mut ChaCha20Rng,
) -> FuzzmillResult<()> {
    let batch_size = session.config.test_processing.batch_size;
    let pipeline = start_pipeline(session, batch_size as usize)?;
    let mut outstanding: u64 = 0;

    match next_cover_request(&mut seeds, session, batch_size, rng) {
        Some(req) => {
            outstanding += req.count;
            if pipeline.requests.send(req).is_err() {
                return Err(FuzzmillError::Mutator(
                    "mutator queue closed before the run started".to_string(),
                ));
            }
        }
        None => {
            tracing::info!("every seed is already covered; nothing to do");
            return Ok(());
        }
    }

    let start_time = Instant::now();

    loop {
        select! {
            recv(pipeline.results) -> msg => {
                let Ok(tc) = msg else {
                    tracing::error!("result queue closed unexpectedly");
                    break;
                };
                absorb_case(session, &tc)?;
                outstanding -= 1;
            }
            recv(pipeline.errors) -> msg => {
                if let Ok(err) = msg {
                    tracing::error!("{err}");
                }
                break;
            }
        }

        log_progress(session, batch_size, start_time, Some(seeds.len()))?;

        if outstanding <= batch_size / REQ_THRESHOLD {
            match next_cover_request(&mut seeds, session, batch_size, rng) {
                Some(req) => {
                    outstanding += req.count;
                    if pipeline.requests.send(req).is_err() {
                        break;
                    }
                }
                None => {
                    if outstanding == 0 {
                        break;
                    }
                }
            }
        }
    }

    drop(pipeline.requests);
    tracing::info!(
        "{} fuzz files processed, exiting",
        session.stats.tests_processed
    );
    Ok(())
}

/// Select seeds uniformly with replacement until `test_count` cases have
/// been processed, or forever when `test_count` is zero.
fn infinite_random(
    session: &mut Session,
    seeds: Vec<PathBuf>,
    rng: &mut ChaCha20Rng,
) -> FuzzmillResult<()> {
    if seeds.is_empty() {
        return Err(FuzzmillError::Config("no seed tests found".to_string()));
    }

    let test_count = session.config.test_processing.test_count;
    if test_count != 0 && session.config.test_processing.batch_size > test_count {
        session.config.test_processing.batch_size = test_count;
    }
    let batch_size = session.config.test_processing.batch_size;

    let pipeline = start_pipeline(session, batch_size as usize)?;

    let first = random_request(&session.config, &seeds, batch_size, rng)?;
    if pipeline.requests.send(first).is_err() {
        return Err(FuzzmillError::Mutator(
            "mutator queue closed before the run started".to_string(),
        ));
    }
    let mut outstanding = batch_size;

    let start_time = Instant::now();

    loop {
        select! {
            recv(pipeline.results) -> msg => {
                let Ok(tc) = msg else {
                    tracing::error!("result queue closed unexpectedly");
                    break;
                };
                absorb_case(session, &tc)?;
                outstanding = outstanding.saturating_sub(1);
            }
            recv(pipeline.errors) -> msg => {
                if let Ok(err) = msg {
                    tracing::error!("{err}");
                }
                break;
            }
        }

        log_progress(session, batch_size, start_time, None)?;

        if test_count != 0 && session.stats.tests_processed >= test_count {
            break;
        }

        if outstanding <= batch_size / REQ_THRESHOLD {
            let req = random_request(&session.config, &seeds, batch_size, rng)?;
            if pipeline.requests.send(req).is_err() {
                break;
            }
            outstanding += batch_size;
        }
    }

    drop(pipeline.requests);
    tracing::info!(
        "{} fuzz files processed, exiting",
        session.stats.tests_processed
    );
    Ok(())
}

/// Spawn the mutator, the monitor pool, and the result processor, wired
/// together with bounded queues: capacity 1 for requests (a single
/// outstanding batch) and one batch for every other edge, so a slow monitor
/// stalls the mutator.
fn start_pipeline(session: &Session, batch_size: usize) -> FuzzmillResult<Pipeline> {
    let (err_tx, err_rx) = unbounded();
    let (req_tx, req_rx) = bounded::<MutateRequest>(1);
    let (mutant_tx, mutant_rx) = bounded::<TestCase>(batch_size);
    let (monitored_tx, monitored_rx) = bounded::<TestCase>(batch_size);
    let (processed_tx, processed_rx) = bounded::<TestCase>(batch_size);

    spawn_mutator(session, req_rx, mutant_tx, err_tx.clone())?;

    let ctx = MonitorContext::from_config(&session.config)?;
    let workers = monitor::monitor_worker_count();
    tracing::info!("starting {workers} monitors");
    for i in 0..workers {
        let ctx = ctx.clone();
        let input = mutant_rx.clone();
        let out = monitored_tx.clone();
        let errors = err_tx.clone();
        std::thread::Builder::new()
            .name(format!("monitor-{i}"))
            .spawn(move || monitor::run_monitor(ctx, input, out, errors))?;
    }
    drop(mutant_rx);
    drop(monitored_tx);

    let preservation_dir = session.preservation_dir.clone();
    std::thread::Builder::new()
        .name("resultproc".to_string())
        .spawn(move || {
            resultproc::run_result_processor(preservation_dir, monitored_rx, processed_tx, err_tx)
        })?;

    Ok(Pipeline {
        requests: req_tx,
        results: processed_rx,
        errors: err_rx,
    })
}

fn spawn_mutator(
    session: &Session,
    requests: Receiver<MutateRequest>,
    out: Sender<TestCase>,
    errors: Sender<FuzzmillError>,
) -> FuzzmillResult<()> {
    let builder = std::thread::Builder::new().name("mutator".to_string());

    match session.config.fuzzer_kind()? {
        FuzzerKind::Radamsa => {
            let stage = mutate::Radamsa {
                config: session.config.clone(),
                test_cases_dir: session.test_cases_dir.clone(),
            };
            builder.spawn(move || stage.run(requests, out, errors))?;
        }
        FuzzerKind::RadamsaMultiFile => {
            let stage = mutate::RadamsaMultiFile {
                config: session.config.clone(),
                test_cases_dir: session.test_cases_dir.clone(),
            };
            builder.spawn(move || stage.run(requests, out, errors))?;
        }
        FuzzerKind::Nop => {
            let stage = mutate::Nop {
                working_dir: session.test_cases_dir.clone(),
            };
            builder.spawn(move || stage.run(requests, out, errors))?;
        }
    }

    Ok(())
}

/// Pick the next uncovered seed uniformly without replacement and size its
/// batch to top the seed up to `batch_size` processed cases, so a seed left
/// partially covered by an interrupted session is never over-processed.
fn next_cover_request(
    seeds: &mut Vec<PathBuf>,
    session: &Session,
    batch_size: u64,
    rng: &mut ChaCha20Rng,
) -> Option<MutateRequest> {
    while !seeds.is_empty() {
        let idx = (rng.next_u64() % seeds.len() as u64) as usize;
        let seed = seeds.swap_remove(idx);
        let already = session
            .stats
            .tests_processed_per_seed
            .get(&seed)
            .copied()
            .unwrap_or(0);
        let remaining = batch_size.saturating_sub(already);
        if remaining == 0 {
            continue;
        }
        tracing::info!("selecting {} as the next seed file", seed.display());
        return Some(MutateRequest::new(vec![seed], remaining));
    }

    None
}

/// Build a request for the infinite-random mode: one uniformly chosen seed,
/// or for a multi-file mutator a uniform number of seeds in the configured
/// range, drawn with replacement.
fn random_request(
    config: &Config,
    seeds: &[PathBuf],
    batch_size: u64,
    rng: &mut ChaCha20Rng,
) -> FuzzmillResult<MutateRequest> {
    if config.fuzzer_kind()? != FuzzerKind::RadamsaMultiFile {
        let idx = (rng.next_u64() % seeds.len() as u64) as usize;
        let seed = seeds[idx].clone();
        tracing::info!("selecting {} as the next seed file", seed.display());
        return Ok(MutateRequest::new(vec![seed], batch_size));
    }

    let min = config.test_processing.multi_file_fuzzer_seed_count_min;
    let max = config.test_processing.multi_file_fuzzer_seed_count_max;
    let seeds_to_use = min + rng.next_u64() % (max - min + 1);

    let mut sources = Vec::with_capacity(seeds_to_use as usize);
    for _ in 0..seeds_to_use {
        let idx = (rng.next_u64() % seeds.len() as u64) as usize;
        sources.push(seeds[idx].clone());
    }
    tracing::info!("selecting {sources:?} as the next seed files");
    Ok(MutateRequest::new(sources, batch_size))
}

/// Fold one finalized case into the session stats and persist them. A save
/// failure is fatal to the run; the on-disk backup keeps the last successful
/// state recoverable.
fn absorb_case(session: &mut Session, tc: &TestCase) -> FuzzmillResult<()> {
    if tc.bug_found {
        tracing::info!("potential bug: details in {}", tc.preservation_dir.display());
        session.stats.crash_count += 1;
    }
    session.stats.tests_processed += 1;

    for seed in &tc.seed_file_paths {
        session.stats.add_test_case_for_seed(seed);
    }

    if tc.test_timed_out {
        session.stats.timed_out_tests += 1;
    } else {
        session.stats.add_exit_code(tc.exit_code);
    }

    session
        .save()
        .map_err(|err| FuzzmillError::Session(format!("failed to save session: {err}")))
}

fn log_progress(
    session: &Session,
    batch_size: u64,
    start_time: Instant,
    seeds_left: Option<usize>,
) -> FuzzmillResult<()> {
    let processed = session.stats.tests_processed;

    if processed % 100 == 0 {
        tracing::info!("{processed} fuzz files processed");
    }

    if processed % batch_size == 0 {
        session.log_summary().map_err(|err| {
            FuzzmillError::Session(format!("failed to log session summary: {err}"))
        })?;

        let elapsed = start_time.elapsed();
        tracing::info!("total time elapsed: {elapsed:?}");
        let batches = processed / batch_size;
        if batches > 0 {
            let batch_avg = elapsed.as_secs() / batches;
            tracing::info!("average time per batch of {batch_size}: {batch_avg} seconds");
            if let Some(left) = seeds_left {
                tracing::info!(
                    "predicted time until finished: {} seconds",
                    batch_avg * left as u64
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        GeneralConfig, InterpreterConfig, RadamsaConfig, SeedTestsConfig, Stats,
        TestProcessingConfig, FUZZ_FILE_MARKER,
    };

    fn test_config(fuzzer: &str, mode: &str, batch_size: u64) -> Config {
        Config {
            general: GeneralConfig {
                seed: 7,
                enable_debug_log: false,
            },
            seed_tests: SeedTestsConfig {
                dir: Some(PathBuf::from("/tmp/seeds")),
                valid_exts: vec![".js".to_string()],
                list_file: None,
            },
            test_processing: TestProcessingConfig {
                fuzzer: fuzzer.to_string(),
                multi_file_fuzzer_seed_count_min: 2,
                multi_file_fuzzer_seed_count_max: 4,
                batch_size,
                test_count: 0,
                mode: mode.to_string(),
                generate_tests_in_place: false,
            },
            radamsa: RadamsaConfig::default(),
            interpreter: InterpreterConfig {
                path: PathBuf::from("/bin/true"),
                args: Some(FUZZ_FILE_MARKER.to_string()),
                arg_gen: None,
                test_case_root_dir: None,
                timeout: 5,
            },
        }
    }

    fn test_session(config: Config) -> Session {
        Session {
            session_dir: PathBuf::from("/tmp/fuzzmill-test"),
            test_cases_dir: PathBuf::from("/tmp/fuzzmill-test/test_cases"),
            preservation_dir: PathBuf::from("/tmp/fuzzmill-test/crashes"),
            config,
            stats: Stats::default(),
        }
    }

    #[test]
    fn filter_drops_fully_covered_seeds() {
        let mut session = test_session(test_config("nop", "cover_all_once", 2));
        let a = PathBuf::from("/tmp/a.js");
        let b = PathBuf::from("/tmp/b.js");
        let c = PathBuf::from("/tmp/c.js");
        session.stats.tests_processed_per_seed.insert(a.clone(), 2);
        session.stats.tests_processed_per_seed.insert(b.clone(), 1);

        let filtered = filter_covered_seeds(&session, vec![a, b.clone(), c.clone()]);
        assert_eq!(filtered, vec![b, c]);
    }

    #[test]
    fn cover_request_tops_up_partially_covered_seeds() {
        let mut session = test_session(test_config("nop", "cover_all_once", 2));
        let b = PathBuf::from("/tmp/b.js");
        session.stats.tests_processed_per_seed.insert(b.clone(), 1);

        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let mut seeds = vec![b.clone()];
        let req = next_cover_request(&mut seeds, &session, 2, &mut rng).expect("request");
        assert_eq!(req.source_files, vec![b]);
        assert_eq!(req.count, 1, "only the missing case is requested");
        assert!(seeds.is_empty());
    }

    #[test]
    fn cover_request_skips_exhausted_seeds() {
        let mut session = test_session(test_config("nop", "cover_all_once", 2));
        let a = PathBuf::from("/tmp/a.js");
        session.stats.tests_processed_per_seed.insert(a.clone(), 2);

        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let mut seeds = vec![a];
        assert!(next_cover_request(&mut seeds, &session, 2, &mut rng).is_none());
    }

    #[test]
    fn random_request_uses_one_seed_for_single_file_mutators() {
        let config = test_config("radamsa", "infinite_random", 8);
        let seeds = vec![PathBuf::from("/tmp/a.js"), PathBuf::from("/tmp/b.js")];
        let mut rng = ChaCha20Rng::seed_from_u64(7);

        let req = random_request(&config, &seeds, 8, &mut rng).expect("request");
        assert_eq!(req.source_files.len(), 1);
        assert_eq!(req.count, 8);
        assert!(seeds.contains(&req.source_files[0]));
    }

    #[test]
    fn random_request_draws_multi_file_counts_in_range() {
        let config = test_config("radamsa_multifile", "infinite_random", 8);
        let seeds = vec![
            PathBuf::from("/tmp/a.js"),
            PathBuf::from("/tmp/b.js"),
            PathBuf::from("/tmp/c.js"),
        ];
        let mut rng = ChaCha20Rng::seed_from_u64(7);

        for _ in 0..32 {
            let req = random_request(&config, &seeds, 8, &mut rng).expect("request");
            assert!((2..=4).contains(&(req.source_files.len() as u64)));
            for source in &req.source_files {
                assert!(seeds.contains(source));
            }
        }
    }
}
