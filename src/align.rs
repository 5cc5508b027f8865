//! Turns pairwise recognitions into one timeline.
//!
//! During resolution every file gets a *raw position*: how many seconds into
//! that file the reference file starts. Coarse shifts are `max - raw`, so the
//! file that starts earliest ends up with shift 0. Fine shifts are added on
//! top of the coarse ones and renormalized with `shift - min`.
//!
//! With [`Propagation::SingleHop`] a file that never matched the reference is
//! placed through at most one intermediate file. [`Propagation::Graph`]
//! repeats that step until nothing changes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use tracing::{debug, info};

use crate::results::{Alignment, MatchInfo};

pub type Shifts = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    #[default]
    SingleHop,
    Graph,
}

/// Which recognitions of an [`Alignment`] to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKey {
    /// Only `match_info`; unwinds a fine alignment to its coarse shifts.
    Coarse,
    /// `match_info` composed with `fine_match_info`.
    Fine,
}

#[derive(Debug, Clone, Default)]
pub struct AlignOptions {
    pub propagation: Propagation,
    /// Where to write the alignment as JSON. Write failures are logged and
    /// do not discard the result.
    pub destination: Option<PathBuf>,
}

/// The file with the most matched files; ties go to the larger sum of best
/// confidences, then to the first name.
pub fn select_reference(match_info: &MatchInfo) -> Option<&str> {
    let mut best: Option<(&str, usize, f64)> = None;
    for (name, recognition) in match_info {
        let count = recognition.match_info.len();
        let strength: f64 = recognition
            .match_info
            .values()
            .map(|fm| fm.best_confidence())
            .sum();
        let better = match best {
            None => true,
            Some((_, best_count, best_strength)) => {
                count > best_count || (count == best_count && strength > best_strength)
            }
        };
        if better {
            best = Some((name, count, strength));
        }
    }
    match best {
        Some((name, count, _)) if count > 0 => Some(name),
        _ => None,
    }
}

fn all_names(match_info: &MatchInfo) -> BTreeSet<&str> {
    let mut names = BTreeSet::new();
    for (name, recognition) in match_info {
        names.insert(name.as_str());
        names.extend(recognition.match_info.keys().map(String::as_str));
    }
    names
}

/// Best placement of `name` through any already placed file, in either
/// recognition direction.
fn place_through_members(match_info: &MatchInfo, placed: &Shifts, name: &str) -> Option<f64> {
    let mut best: Option<(f64, f64)> = None;
    for (member, &member_raw) in placed {
        // `member` recognized against `name`: member starts `off` into `name`.
        let forward = match_info
            .get(member)
            .and_then(|r| r.match_info.get(name))
            .and_then(|fm| Some((fm.best_offset_seconds()?, fm.best_confidence())))
            .map(|(off, conf)| (member_raw + off, conf));
        // `name` recognized against `member`: `name` starts `off` into `member`.
        let backward = match_info
            .get(name)
            .and_then(|r| r.match_info.get(member))
            .and_then(|fm| Some((fm.best_offset_seconds()?, fm.best_confidence())))
            .map(|(off, conf)| (member_raw - off, conf));

        for (raw, conf) in forward.into_iter().chain(backward) {
            if best.is_none_or(|(_, best_conf)| conf > best_conf) {
                best = Some((raw, conf));
            }
        }
    }
    best.map(|(raw, _)| raw)
}

/// Raw positions relative to `reference`. Files that cannot be placed are
/// left out.
pub fn reference_positions(
    match_info: &MatchInfo,
    reference: &str,
    propagation: Propagation,
) -> Shifts {
    let mut raw = Shifts::new();
    raw.insert(reference.to_string(), 0.0);
    if let Some(recognition) = match_info.get(reference) {
        for (name, fm) in &recognition.match_info {
            if let Some(offset) = fm.best_offset_seconds() {
                raw.insert(name.clone(), offset);
            }
        }
    }

    let names = all_names(match_info);
    loop {
        let additions: Vec<(String, f64)> = names
            .iter()
            .filter(|name| !raw.contains_key(**name))
            .filter_map(|name| {
                place_through_members(match_info, &raw, name).map(|r| (name.to_string(), r))
            })
            .collect();
        if additions.is_empty() {
            break;
        }
        debug!(added = additions.len(), "Placed files through intermediate matches");
        raw.extend(additions);
        if propagation == Propagation::SingleHop {
            break;
        }
    }

    for name in names.iter().filter(|name| !raw.contains_key(**name)) {
        info!(file = %name, "Could not place file on the timeline");
    }
    raw
}

/// Coarse normalization: `max - raw`.
pub fn normalize_coarse(raw: &Shifts) -> Shifts {
    let max = raw.values().copied().fold(f64::NEG_INFINITY, f64::max);
    raw.iter()
        .map(|(name, &value)| (name.clone(), max - value))
        .collect()
}

/// Fine normalization: `shift - min`.
pub fn normalize_fine(shifts: &Shifts) -> Shifts {
    let min = shifts.values().copied().fold(f64::INFINITY, f64::min);
    shifts
        .iter()
        .map(|(name, &value)| (name.clone(), value - min))
        .collect()
}

/// Shifts with a fixed reference, or `None` if nothing could be placed
/// next to it.
pub fn shifts_from_reference(
    match_info: &MatchInfo,
    reference: &str,
    propagation: Propagation,
) -> Option<Shifts> {
    let raw = reference_positions(match_info, reference, propagation);
    if raw.len() < 2 {
        info!(reference, "No matches detected");
        return None;
    }
    Some(normalize_coarse(&raw))
}

/// Picks the reference and resolves coarse shifts.
pub fn coarse_shifts(match_info: &MatchInfo, propagation: Propagation) -> Option<Shifts> {
    let Some(reference) = select_reference(match_info) else {
        info!("No matches detected");
        return None;
    };
    debug!(reference, "Selected reference file");
    shifts_from_reference(match_info, reference, propagation)
}

/// `coarse + fine`, renormalized so the minimum is 0. Files without a fine
/// shift keep their coarse one.
pub fn compose_fine(coarse: &Shifts, fine: &Shifts) -> Shifts {
    let combined: Shifts = coarse
        .iter()
        .map(|(name, &shift)| (name.clone(), shift + fine.get(name).copied().unwrap_or(0.0)))
        .collect();
    normalize_fine(&combined)
}

/// Recomputes the shifts stored in `alignment` from its recognitions.
pub fn recalc_shifts(
    alignment: &Alignment,
    key: MatchKey,
    propagation: Propagation,
) -> Option<Shifts> {
    let coarse = coarse_shifts(&alignment.match_info, propagation)?;
    match key {
        MatchKey::Coarse => Some(coarse),
        MatchKey::Fine => {
            let fine = alignment
                .fine_match_info
                .as_ref()
                .and_then(|fine| coarse_shifts(fine, propagation))
                .unwrap_or_default();
            Some(compose_fine(&coarse, &fine))
        }
    }
}
