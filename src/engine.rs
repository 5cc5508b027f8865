//! Coordinator: owns the corpus and the worker pool and runs the batch
//! operations (fingerprinting, recognition, alignment) over files.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::align::{self, AlignOptions};
use crate::audio::{PcmSignal, file_name};
use crate::config::FingerprintConfig;
use crate::corpus::{Corpus, ScratchCorpus};
use crate::db;
use crate::error::{Error, Result};
use crate::hashing::FingerprintTable;
use crate::ranking::{rank_match_info, rank_recognition};
use crate::recognizer::{Recognizer, Role, fingerprint_signal, match_table};
use crate::results::{Alignment, FileMatch, MatchInfo, Rankings, Recognition, write_json};
use crate::worker::{CancelToken, WorkerPool};

/// Regular, non-hidden files in `dir`, sorted by path.
pub fn audio_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::NotFound(dir.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && !file_name(&path).starts_with('.') {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn against_paths(against: &Path) -> Result<Vec<PathBuf>> {
    if against.is_dir() {
        audio_files(against)
    } else if against.exists() {
        Ok(vec![against.to_path_buf()])
    } else {
        Err(Error::NotFound(against.to_path_buf()))
    }
}

/// Drops per-file failures with a warning; anything else aborts the batch.
fn keep_readable<T>(results: Vec<(PathBuf, Result<T>)>) -> Result<Vec<(PathBuf, T)>> {
    let mut kept = Vec::with_capacity(results.len());
    for (path, result) in results {
        match result {
            Ok(value) => kept.push((path, value)),
            Err(e) if e.is_per_file() => {
                warn!(path = %path.display(), error = %e, "Skipping file");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(kept)
}

/// A decoded file keyed by its name.
struct NamedSignal {
    name: String,
    path: PathBuf,
    signal: PcmSignal,
}

fn finish_recognition(
    match_info: BTreeMap<String, FileMatch>,
    match_time: Duration,
    recognizer: &Recognizer,
) -> Option<Recognition> {
    if match_info.is_empty() {
        return None;
    }
    let mut recognition = Recognition {
        match_time: match_time.as_secs_f64(),
        match_info,
        rankings: BTreeMap::new(),
    };
    recognition.rankings = rank_recognition(
        &recognition,
        recognizer.technique(),
        recognizer.uses_locality(),
    );
    Some(recognition)
}

fn write_destination(alignment: &Alignment, options: &AlignOptions) {
    let Some(destination) = &options.destination else {
        return;
    };
    match write_json(alignment, destination) {
        Ok(()) => info!(path = %destination.display(), "Wrote alignment"),
        Err(e) => warn!(path = %destination.display(), error = %e, "Failed to write alignment"),
    }
}

pub struct Engine {
    corpus: Corpus,
    pool: WorkerPool,
    cancel: CancelToken,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Engine {
    /// `workers` defaults to the number of available cores.
    pub fn new(workers: Option<usize>) -> Self {
        let cancel = CancelToken::new();
        Self {
            corpus: Corpus::new(),
            pool: WorkerPool::new(workers, cancel.clone()),
            cancel,
        }
    }

    /// Cancelling stops the running batch with [`Error::Cancelled`]. The
    /// token stays set until reset.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn clear_fingerprints(&mut self) {
        self.corpus.clear();
    }

    /// Returns `false` if a file with the same name is already fingerprinted.
    pub fn fingerprint_file(&mut self, path: &Path, config: &FingerprintConfig) -> Result<bool> {
        config.validate()?;
        let name = file_name(path);
        if self.corpus.contains(&name) {
            info!(file = %name, "Already fingerprinted");
            return Ok(false);
        }
        let signal = crate::audio::read(path, config.sample_rate, None)?;
        Ok(self.corpus.insert(name, fingerprint_signal(&signal, config)))
    }

    /// Fingerprints files in parallel. Unreadable files are logged and
    /// skipped. Returns how many files were added.
    pub fn fingerprint_files(
        &mut self,
        paths: &[PathBuf],
        config: &FingerprintConfig,
    ) -> Result<usize> {
        config.validate()?;
        let started = Instant::now();
        let pending: Vec<PathBuf> = paths
            .iter()
            .filter(|path| !self.corpus.contains(&file_name(path)))
            .cloned()
            .collect();
        debug!(
            pending = pending.len(),
            skipped = paths.len() - pending.len(),
            "Fingerprinting files"
        );

        let mut added = 0;
        for (name, table) in self.fingerprint_batch(&pending, config, started)? {
            if self.corpus.insert(name, table) {
                added += 1;
            }
        }
        info!(
            added,
            files = self.corpus.len(),
            fingerprints = self.corpus.total_fingerprints(),
            "Fingerprinting finished"
        );
        Ok(added)
    }

    pub fn fingerprint_directory(
        &mut self,
        dir: &Path,
        config: &FingerprintConfig,
    ) -> Result<usize> {
        let paths = audio_files(dir)?;
        self.fingerprint_files(&paths, config)
    }

    fn fingerprint_batch(
        &self,
        paths: &[PathBuf],
        config: &FingerprintConfig,
        started: Instant,
    ) -> Result<Vec<(String, FingerprintTable)>> {
        let results = self.pool.map(started, paths, |path| {
            let table = crate::audio::read(path, config.sample_rate, None)
                .map(|signal| fingerprint_signal(&signal, config));
            (path.clone(), table)
        })?;
        Ok(keep_readable(results)?
            .into_iter()
            .map(|(path, table)| (file_name(&path), table))
            .collect())
    }

    pub fn save_fingerprints(&self, path: &Path) -> Result<()> {
        db::save(&self.corpus, path)
    }

    /// Merges a saved corpus into this one. Returns how many files were new.
    pub fn load_fingerprints(&mut self, path: &Path) -> Result<usize> {
        let loaded = db::load(path)?;
        let added = self.corpus.merge(loaded);
        info!(added, files = self.corpus.len(), "Loaded fingerprints");
        Ok(added)
    }

    /// Recognizes `target` against a file or directory, or against the
    /// engine's corpus when `against` is `None` (fingerprints only).
    /// A file never matches itself by name.
    pub fn recognize(
        &mut self,
        target: &Path,
        against: Option<&Path>,
        recognizer: &Recognizer,
    ) -> Result<Option<Recognition>> {
        recognizer.validate()?;
        let started = Instant::now();
        let name = file_name(target);
        let signal = recognizer.read(target, Role::Target)?;

        let match_info = match (recognizer, against) {
            (Recognizer::Fingerprint(config), None) => {
                let table = fingerprint_signal(&signal, config);
                match_table(&name, &table, &self.corpus, config)
            }
            (Recognizer::Fingerprint(config), Some(against)) => {
                let table = fingerprint_signal(&signal, config);
                let tables = self.fingerprint_batch(&against_paths(against)?, config, started)?;
                let mut scratch = ScratchCorpus::new(&mut self.corpus);
                for (against_name, against_table) in tables {
                    scratch.insert(against_name, against_table);
                }
                match_table(&name, &table, &scratch, config)
            }
            (_, None) => {
                return Err(Error::Config(format!(
                    "{} recognition needs a file or directory to compare against",
                    recognizer.technique()
                )));
            }
            (_, Some(against)) => {
                let paths: Vec<PathBuf> = against_paths(against)?
                    .into_iter()
                    .filter(|path| file_name(path) != name)
                    .collect();
                let results = self.pool.map(started, &paths, |path| {
                    let file_match = recognizer
                        .read(path, Role::Against)
                        .and_then(|against| recognizer.compare(&signal, &against));
                    (path.clone(), file_match)
                })?;
                keep_readable(results)?
                    .into_iter()
                    .filter_map(|(path, fm)| fm.map(|fm| (file_name(&path), fm)))
                    .collect()
            }
        };

        let recognition = finish_recognition(match_info, started.elapsed(), recognizer);
        match &recognition {
            Some(r) => info!(
                target = %name,
                matches = r.match_info.len(),
                seconds = r.match_time,
                "Recognition finished"
            ),
            None => info!(target = %name, "No matches found"),
        }
        Ok(recognition)
    }

    fn read_signals(
        &self,
        paths: &[PathBuf],
        recognizer: &Recognizer,
        role: Role,
        started: Instant,
    ) -> Result<Vec<NamedSignal>> {
        let results = self
            .pool
            .map(started, paths, |path| (path.clone(), recognizer.read(path, role)))?;
        let mut seen = HashSet::new();
        let mut signals = Vec::new();
        for (path, signal) in keep_readable(results)? {
            let name = file_name(&path);
            if !seen.insert(name.clone()) {
                warn!(path = %path.display(), "Duplicate file name, skipping");
                continue;
            }
            signals.push(NamedSignal { name, path, signal });
        }
        Ok(signals)
    }

    /// Recognizes every signal against every other one. With `only`, just
    /// that signal is used as a target.
    fn pairwise(
        &mut self,
        signals: &[NamedSignal],
        recognizer: &Recognizer,
        only: Option<&str>,
        started: Instant,
    ) -> Result<MatchInfo> {
        let is_target = |name: &str| only.is_none_or(|only| only == name);
        let results: Vec<(String, BTreeMap<String, FileMatch>, Duration)> = match recognizer {
            Recognizer::Fingerprint(config) => {
                let tables = self.pool.map(started, signals, |s| {
                    (s.name.clone(), fingerprint_signal(&s.signal, config))
                })?;
                let pool = &self.pool;
                let mut scratch = ScratchCorpus::new(&mut self.corpus);
                for (name, table) in tables {
                    scratch.insert(name, table);
                }
                let corpus: &Corpus = &scratch;
                let targets: Vec<String> = corpus
                    .file_names()
                    .iter()
                    .filter(|name| is_target(name))
                    .cloned()
                    .collect();
                pool.map(started, &targets, |name| {
                    let matched_at = Instant::now();
                    let matches = corpus
                        .get(name)
                        .map(|table| match_table(name, table, corpus, config))
                        .unwrap_or_default();
                    (name.clone(), matches, matched_at.elapsed())
                })?
            }
            Recognizer::Correlation(_) | Recognizer::CorrelationSpectrogram(_) => {
                let pairs: Vec<(usize, usize)> = (0..signals.len())
                    .filter(|&i| is_target(&signals[i].name))
                    .flat_map(|i| {
                        (0..signals.len())
                            .filter(move |&j| j != i)
                            .map(move |j| (i, j))
                    })
                    .collect();
                let compared = self.pool.map(started, &pairs, |&(i, j)| {
                    let compared_at = Instant::now();
                    let fm = recognizer.compare(&signals[i].signal, &signals[j].signal);
                    (i, j, fm, compared_at.elapsed())
                })?;

                let mut per_target: BTreeMap<usize, (BTreeMap<String, FileMatch>, Duration)> =
                    BTreeMap::new();
                for (i, j, fm, elapsed) in compared {
                    let entry = per_target.entry(i).or_default();
                    entry.1 += elapsed;
                    if let Some(fm) = fm? {
                        entry.0.insert(signals[j].name.clone(), fm);
                    }
                }
                per_target
                    .into_iter()
                    .map(|(i, (matches, elapsed))| (signals[i].name.clone(), matches, elapsed))
                    .collect()
            }
        };

        Ok(results
            .into_iter()
            .filter(|(_, matches, _)| !matches.is_empty())
            .map(|(name, match_info, elapsed)| {
                let recognition = Recognition {
                    match_time: elapsed.as_secs_f64(),
                    match_info,
                    rankings: BTreeMap::new(),
                };
                (name, recognition)
            })
            .collect())
    }

    fn build_alignment(
        signals: &[NamedSignal],
        shifts: BTreeMap<String, f64>,
        match_info: MatchInfo,
        recognizer: &Recognizer,
    ) -> Alignment {
        let rankings = Rankings {
            match_info: rank_match_info(
                &match_info,
                recognizer.technique(),
                recognizer.uses_locality(),
            ),
            fine_match_info: None,
        };
        Alignment {
            shifts,
            match_info,
            fine_match_info: None,
            names_and_paths: signals
                .iter()
                .map(|s| (s.name.clone(), s.path.clone()))
                .collect(),
            rankings,
        }
    }

    /// Aligns every file in `dir`. `None` when no file matched another.
    pub fn align(
        &mut self,
        dir: &Path,
        recognizer: &Recognizer,
        options: &AlignOptions,
    ) -> Result<Option<Alignment>> {
        let started = Instant::now();
        let paths = audio_files(dir)?;
        self.align_paths(&paths, recognizer, options, started)
    }

    pub fn align_files(
        &mut self,
        paths: &[PathBuf],
        recognizer: &Recognizer,
        options: &AlignOptions,
    ) -> Result<Option<Alignment>> {
        self.align_paths(paths, recognizer, options, Instant::now())
    }

    fn align_paths(
        &mut self,
        paths: &[PathBuf],
        recognizer: &Recognizer,
        options: &AlignOptions,
        started: Instant,
    ) -> Result<Option<Alignment>> {
        recognizer.validate()?;
        let signals = self.read_signals(paths, recognizer, Role::Against, started)?;
        let match_info = self.pairwise(&signals, recognizer, None, started)?;

        let Some(shifts) = align::coarse_shifts(&match_info, options.propagation) else {
            return Ok(None);
        };
        let alignment = Self::build_alignment(&signals, shifts, match_info, recognizer);
        info!(
            files = alignment.shifts.len(),
            seconds = started.elapsed().as_secs_f64(),
            "Alignment finished"
        );
        write_destination(&alignment, options);
        Ok(Some(alignment))
    }

    /// Aligns the files in `dir` to `target`, which is always the reference.
    pub fn target_align(
        &mut self,
        target: &Path,
        dir: &Path,
        recognizer: &Recognizer,
        options: &AlignOptions,
    ) -> Result<Option<Alignment>> {
        recognizer.validate()?;
        let started = Instant::now();
        let target_name = file_name(target);
        let others: Vec<PathBuf> = audio_files(dir)?
            .into_iter()
            .filter(|path| file_name(path) != target_name)
            .collect();

        let mut signals = vec![NamedSignal {
            name: target_name.clone(),
            path: target.to_path_buf(),
            signal: recognizer.read(target, Role::Target)?,
        }];
        signals.extend(self.read_signals(&others, recognizer, Role::Against, started)?);
        let match_info = self.pairwise(&signals, recognizer, Some(&target_name), started)?;

        let Some(shifts) =
            align::shifts_from_reference(&match_info, &target_name, options.propagation)
        else {
            return Ok(None);
        };
        let alignment = Self::build_alignment(&signals, shifts, match_info, recognizer);
        write_destination(&alignment, options);
        Ok(Some(alignment))
    }

    /// Re-recognizes the files of a coarse alignment after padding each one
    /// with its coarse shift, and composes the residual shifts on top.
    /// Correlation searches are bounded to a few seconds unless `max_lags`
    /// is already set.
    pub fn fine_align(
        &mut self,
        coarse: &Alignment,
        recognizer: &Recognizer,
        options: &AlignOptions,
    ) -> Result<Alignment> {
        let recognizer = recognizer.for_fine_alignment();
        recognizer.validate()?;
        let started = Instant::now();

        let entries: Vec<(String, PathBuf, f64)> = coarse
            .shifts
            .iter()
            .filter_map(|(name, &shift)| match coarse.names_and_paths.get(name) {
                Some(path) => Some((name.clone(), path.clone(), shift)),
                None => {
                    warn!(file = %name, "No path recorded, leaving out of fine alignment");
                    None
                }
            })
            .collect();
        let results = self.pool.map(started, &entries, |(name, path, shift)| {
            let signal = recognizer
                .read(path, Role::Against)
                .map(|signal| NamedSignal {
                    name: name.clone(),
                    path: path.clone(),
                    signal: signal.delayed(*shift),
                });
            (path.clone(), signal)
        })?;
        let signals: Vec<NamedSignal> = keep_readable(results)?
            .into_iter()
            .map(|(_, signal)| signal)
            .collect();

        let fine_match_info = self.pairwise(&signals, &recognizer, None, started)?;
        let fine_shifts =
            align::coarse_shifts(&fine_match_info, options.propagation).unwrap_or_default();
        if fine_shifts.is_empty() {
            info!("Fine alignment found no matches, keeping coarse shifts");
        }

        let alignment = Alignment {
            shifts: align::compose_fine(&coarse.shifts, &fine_shifts),
            match_info: coarse.match_info.clone(),
            rankings: Rankings {
                match_info: coarse.rankings.match_info.clone(),
                fine_match_info: Some(rank_match_info(
                    &fine_match_info,
                    recognizer.technique(),
                    recognizer.uses_locality(),
                )),
            },
            fine_match_info: Some(fine_match_info),
            names_and_paths: coarse.names_and_paths.clone(),
        };
        write_destination(&alignment, options);
        Ok(alignment)
    }
}
