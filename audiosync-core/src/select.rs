//! C5 — Delay Selector.
//!
//! Reduces a set of accepted [`ChunkResult`]s for one source into a single
//! representative delay, by one of several policies. Grounded on
//! wingedonezero's `analysis/delay_selection/{mod,first_stable}.rs`
//! (`DelaySelector` trait, `get_selector` factory).

use std::collections::HashMap;

use crate::config::DelaySelectionMode;
use crate::error::PipelineError;
use crate::models::{ChunkResult, DelayEntry};

pub trait DelaySelector {
    /// Selects a representative delay from the accepted chunks, or reports
    /// why none could be chosen.
    fn select(&self, chunks: &[ChunkResult], min_accepted_chunks: usize) -> Result<DelayEntry, PipelineError>;
}

pub fn get_selector(mode: DelaySelectionMode) -> Box<dyn DelaySelector> {
    match mode {
        DelaySelectionMode::MostCommon => Box::new(MostCommonSelector),
        DelaySelectionMode::Clustered => Box::new(ClusteredSelector),
        DelaySelectionMode::Average => Box::new(AverageSelector),
        DelaySelectionMode::FirstStable => Box::new(FirstStableSelector { min_run: 3, skip_unstable: false }),
    }
}

pub fn get_first_stable_selector(min_run: usize, skip_unstable: bool) -> Box<dyn DelaySelector> {
    Box::new(FirstStableSelector { min_run, skip_unstable })
}

fn accepted(chunks: &[ChunkResult]) -> Vec<&ChunkResult> {
    chunks.iter().filter(|c| c.accepted).collect()
}

fn check_min(accepted: &[&ChunkResult], min_accepted_chunks: usize) -> Result<(), PipelineError> {
    if accepted.len() < min_accepted_chunks {
        return Err(PipelineError::InsufficientData {
            reason: format!(
                "{} accepted chunks, need at least {min_accepted_chunks}",
                accepted.len()
            ),
        });
    }
    Ok(())
}

fn mean_confidence(members: &[&ChunkResult]) -> f64 {
    members.iter().map(|c| c.confidence).sum::<f64>() / members.len() as f64
}

/// Picks the rounded-delay value shared by the largest group of chunks,
/// breaking ties by highest mean confidence in bin (spec §4.5.1). The raw
/// delay is the mean of the raw delays within the winning group.
struct MostCommonSelector;
impl DelaySelector for MostCommonSelector {
    fn select(&self, chunks: &[ChunkResult], min_accepted_chunks: usize) -> Result<DelayEntry, PipelineError> {
        let accepted = accepted(chunks);
        check_min(&accepted, min_accepted_chunks)?;

        let mut groups: HashMap<i64, Vec<&ChunkResult>> = HashMap::new();
        for c in &accepted {
            groups.entry(c.rounded_delay_ms).or_default().push(c);
        }

        let (winner, members) = groups
            .into_iter()
            .max_by(|a, b| {
                a.1.len().cmp(&b.1.len()).then_with(|| mean_confidence(&a.1).partial_cmp(&mean_confidence(&b.1)).unwrap())
            })
            .expect("at least one accepted chunk");

        let raw = members.iter().map(|c| c.raw_delay_ms).sum::<f64>() / members.len() as f64;
        Ok(DelayEntry { rounded: winner, raw })
    }
}

/// Clusters accepted chunks by `±1 ms` on their rounded delay (spec §4.5.2),
/// picks the cluster with the most members, breaking ties by highest mean
/// confidence, and returns the mean of raw delays in the winning cluster,
/// rounded.
struct ClusteredSelector;
impl DelaySelector for ClusteredSelector {
    fn select(&self, chunks: &[ChunkResult], min_accepted_chunks: usize) -> Result<DelayEntry, PipelineError> {
        let accepted = accepted(chunks);
        check_min(&accepted, min_accepted_chunks)?;

        let mut sorted: Vec<&ChunkResult> = accepted.clone();
        sorted.sort_by(|a, b| a.rounded_delay_ms.cmp(&b.rounded_delay_ms));

        const EPSILON_MS: i64 = 1;
        let mut clusters: Vec<Vec<&ChunkResult>> = Vec::new();
        for c in sorted {
            match clusters.last_mut() {
                Some(last) if (c.rounded_delay_ms - last.last().unwrap().rounded_delay_ms).abs() <= EPSILON_MS => {
                    last.push(c);
                }
                _ => clusters.push(vec![c]),
            }
        }

        let best = clusters
            .into_iter()
            .max_by(|a, b| a.len().cmp(&b.len()).then_with(|| mean_confidence(a).partial_cmp(&mean_confidence(b)).unwrap()))
            .expect("at least one accepted chunk");

        let raw = best.iter().map(|c| c.raw_delay_ms).sum::<f64>() / best.len() as f64;
        Ok(DelayEntry { rounded: raw.round() as i64, raw })
    }
}

/// Plain arithmetic mean of every accepted chunk's raw delay.
struct AverageSelector;
impl DelaySelector for AverageSelector {
    fn select(&self, chunks: &[ChunkResult], min_accepted_chunks: usize) -> Result<DelayEntry, PipelineError> {
        let accepted = accepted(chunks);
        check_min(&accepted, min_accepted_chunks)?;

        let raw = accepted.iter().map(|c| c.raw_delay_ms).sum::<f64>() / accepted.len() as f64;
        Ok(DelayEntry { rounded: raw.round() as i64, raw })
    }
}

/// Scans chunks in `start_offset_s` order for the first run of `min_run`
/// consecutive accepted chunks whose rounded delay agrees within 1ms, and
/// reports that run's delay. If `skip_unstable` is false and no run is
/// found, falls back to [`MostCommonSelector`].
struct FirstStableSelector {
    min_run: usize,
    skip_unstable: bool,
}
impl DelaySelector for FirstStableSelector {
    fn select(&self, chunks: &[ChunkResult], min_accepted_chunks: usize) -> Result<DelayEntry, PipelineError> {
        let mut ordered: Vec<&ChunkResult> = chunks.iter().filter(|c| c.accepted).collect();
        check_min(&ordered, min_accepted_chunks)?;
        ordered.sort_by(|a, b| a.start_offset_s.partial_cmp(&b.start_offset_s).unwrap());

        let mut run: Vec<&ChunkResult> = Vec::new();
        for c in &ordered {
            match run.last() {
                Some(prev) if (c.rounded_delay_ms - prev.rounded_delay_ms).abs() <= 1 => run.push(c),
                _ => {
                    run.clear();
                    run.push(c);
                }
            }
            if run.len() >= self.min_run {
                let raw = run.iter().map(|c| c.raw_delay_ms).sum::<f64>() / run.len() as f64;
                return Ok(DelayEntry { rounded: run.last().unwrap().rounded_delay_ms, raw });
            }
        }

        if self.skip_unstable {
            return Err(PipelineError::InsufficientData {
                reason: format!("no stable run of {} consecutive chunks found", self.min_run),
            });
        }
        MostCommonSelector.select(chunks, min_accepted_chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(start_offset_s: f64, rounded: i64, raw: f64, accepted: bool) -> ChunkResult {
        ChunkResult {
            start_offset_s,
            raw_delay_ms: raw,
            rounded_delay_ms: rounded,
            confidence: if accepted { 50.0 } else { 0.0 },
            accepted,
        }
    }

    #[test]
    fn most_common_picks_majority_group() {
        let chunks = vec![
            chunk(0.0, 100, 100.1, true),
            chunk(1.0, 100, 99.9, true),
            chunk(2.0, 200, 200.0, true),
        ];
        let result = MostCommonSelector.select(&chunks, 1).unwrap();
        assert_eq!(result.rounded, 100);
    }

    #[test]
    fn insufficient_chunks_reports_insufficient_data() {
        let chunks = vec![chunk(0.0, 100, 100.0, true)];
        let result = MostCommonSelector.select(&chunks, 3);
        assert!(matches!(result, Err(PipelineError::InsufficientData { .. })));
    }

    #[test]
    fn first_stable_finds_consecutive_run() {
        let selector = get_first_stable_selector(2, true);
        let chunks = vec![
            chunk(0.0, 50, 50.0, true),
            chunk(1.0, 300, 300.0, true),
            chunk(2.0, 100, 100.2, true),
            chunk(3.0, 100, 99.8, true),
        ];
        let result = selector.select(&chunks, 2).unwrap();
        assert_eq!(result.rounded, 100);
    }

    #[test]
    fn average_selector_means_raw_delays() {
        let chunks = vec![chunk(0.0, 100, 100.0, true), chunk(1.0, 100, 102.0, true)];
        let result = AverageSelector.select(&chunks, 1).unwrap();
        assert_eq!(result.raw, 101.0);
    }

    #[test]
    fn ignores_rejected_chunks() {
        let chunks = vec![chunk(0.0, 999, 999.0, false), chunk(1.0, 100, 100.0, true)];
        let result = MostCommonSelector.select(&chunks, 1).unwrap();
        assert_eq!(result.rounded, 100);
    }
}
