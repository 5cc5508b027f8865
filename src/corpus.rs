use std::mem;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::hashing::{FingerprintTable, fingerprint_count};

/// Fingerprinted files keyed by unique file name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Corpus {
    fingerprinted_files: Vec<(String, FingerprintTable)>,
    total_fingerprints: usize,
    file_names: Vec<String>,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(
        fingerprinted_files: Vec<(String, FingerprintTable)>,
        total_fingerprints: usize,
    ) -> Self {
        let mut corpus = Corpus::new();
        corpus.absorb(fingerprinted_files, total_fingerprints);
        corpus
    }

    /// Adds a table unless the name is already present. Returns whether it
    /// was added.
    pub fn insert(&mut self, name: impl Into<String>, table: FingerprintTable) -> bool {
        let name = name.into();
        if self.contains(&name) {
            debug!(file = %name, "Already fingerprinted, skipping");
            return false;
        }
        self.total_fingerprints += fingerprint_count(&table);
        self.file_names.push(name.clone());
        self.fingerprinted_files.push((name, table));
        true
    }

    /// Merges `other` into this corpus. The first occurrence of a name wins;
    /// later duplicates are dropped and their counts subtracted.
    pub fn merge(&mut self, other: Corpus) -> usize {
        self.absorb(other.fingerprinted_files, other.total_fingerprints)
    }

    fn absorb(&mut self, files: Vec<(String, FingerprintTable)>, total: usize) -> usize {
        let mut total = total;
        let mut added = 0;
        for (name, table) in files {
            if self.contains(&name) {
                warn!(file = %name, "Duplicate fingerprint entry dropped");
                total = total.saturating_sub(fingerprint_count(&table));
                continue;
            }
            self.file_names.push(name.clone());
            self.fingerprinted_files.push((name, table));
            added += 1;
        }
        self.total_fingerprints += total;
        added
    }

    pub fn contains(&self, name: &str) -> bool {
        self.file_names.iter().any(|n| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&FingerprintTable> {
        self.fingerprinted_files
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, table)| table)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FingerprintTable)> {
        self.fingerprinted_files
            .iter()
            .map(|(name, table)| (name.as_str(), table))
    }

    pub fn file_names(&self) -> &[String] {
        &self.file_names
    }

    pub fn total_fingerprints(&self) -> usize {
        self.total_fingerprints
    }

    pub fn len(&self) -> usize {
        self.fingerprinted_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprinted_files.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Corpus::new();
    }
}

/// Swaps an empty corpus into `slot` for the guard's lifetime and puts the
/// previous one back on drop, including on early return or panic.
pub struct ScratchCorpus<'a> {
    slot: &'a mut Corpus,
    saved: Option<Corpus>,
}

impl<'a> ScratchCorpus<'a> {
    pub fn new(slot: &'a mut Corpus) -> Self {
        let saved = mem::take(slot);
        debug!(saved_files = saved.len(), "Swapped in scratch corpus");
        Self {
            slot,
            saved: Some(saved),
        }
    }
}

impl Deref for ScratchCorpus<'_> {
    type Target = Corpus;

    fn deref(&self) -> &Corpus {
        self.slot
    }
}

impl DerefMut for ScratchCorpus<'_> {
    fn deref_mut(&mut self) -> &mut Corpus {
        self.slot
    }
}

impl Drop for ScratchCorpus<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            *self.slot = saved;
        }
    }
}
