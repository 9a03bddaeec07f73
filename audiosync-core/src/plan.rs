//! C10 — Delay Normalizer & Plan Builder.
//!
//! The single source of truth for every track's final multiplexer sync
//! value, and for assembling the ordered [`PlanItem`] list that C11 turns
//! into multiplexer options. Grounded almost directly on wingedonezero's
//! `mux/delay_calculator.rs` (`calculate_effective_delay`,
//! `calculate_global_shift`, `finalize_delays`) — the clearest one-to-one
//! grounding in the whole pack.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::PipelineError;
use crate::models::{
    round_half_to_even, CorrectOutput, DelayEntry, Delays, Diagnosis, ExtractOutput, JobSpec, MergePlan, PlanItem,
    Track, TrackType,
};

#[cfg(test)]
use crate::config::Settings;

/// Computes the exact (unrounded) shift that must be added to every raw
/// delay so that none of them are negative (some multiplexers reject
/// negative `--sync`). Spec §4.10: `max(0, -min(raw delays))`.
pub fn calculate_raw_global_shift(source_delays_raw: &BTreeMap<String, f64>) -> f64 {
    let min_delay = source_delays_raw.values().copied().fold(0.0f64, f64::min);
    (-min_delay).max(0.0)
}

/// Rounded form of [`calculate_raw_global_shift`], ties to even.
pub fn calculate_global_shift(source_delays_raw: &BTreeMap<String, f64>) -> i64 {
    round_half_to_even(calculate_raw_global_shift(source_delays_raw))
}

/// Builds the final [`Delays`] record: applies the global shift to every
/// raw per-source delay and ensures the reference source has an entry
/// (global shift only — its own delay is zero before shifting).
pub fn finalize_delays(source_delays_raw: BTreeMap<String, f64>, reference_key: &str) -> Delays {
    let raw_global_shift = calculate_raw_global_shift(&source_delays_raw);
    let global_shift = round_half_to_even(raw_global_shift);

    let mut delays = Delays::new();
    delays.global_shift_ms = global_shift;
    delays.raw_global_shift_ms = raw_global_shift;

    for (source_key, raw_delay) in source_delays_raw {
        let shifted_raw = raw_delay + raw_global_shift;
        delays.insert(source_key, DelayEntry { rounded: round_half_to_even(shifted_raw), raw: shifted_raw });
    }

    if delays.get(reference_key).is_none() {
        delays.insert(reference_key, DelayEntry { rounded: global_shift, raw: raw_global_shift });
    }
    delays
}

/// The per-track delay rule table (spec §4.10's five cases).
pub fn calculate_effective_delay(
    source_key: &str,
    reference_key: &str,
    track_type: TrackType,
    track_container_delay_ms: i64,
    stepping_adjusted: bool,
    frame_adjusted: bool,
    sync_to: Option<&str>,
    delays: &Delays,
) -> i64 {
    if stepping_adjusted || frame_adjusted {
        return 0;
    }
    if let Some(sync_to) = sync_to {
        return delays.get(sync_to).map(|e| e.rounded).unwrap_or(delays.global_shift_ms);
    }
    if source_key == reference_key {
        return match track_type {
            TrackType::Video => delays.global_shift_ms,
            TrackType::Subtitle => delays.global_shift_ms,
            TrackType::Audio => track_container_delay_ms + delays.global_shift_ms,
        };
    }
    delays.get(source_key).map(|e| e.rounded).unwrap_or(0)
}

/// Assembles the ordered plan items for every selected track across every
/// source, resolving each one's extracted (or corrected) file path and
/// final sync value.
pub fn build_plan_items(
    job: &JobSpec,
    tracks: &[Track],
    delays: &Delays,
    diagnoses: &BTreeMap<String, Diagnosis>,
    extract: &ExtractOutput,
    correct: &CorrectOutput,
) -> Result<Vec<PlanItem>, PipelineError> {
    let reference_key = job.reference_key();
    let frame_adjusted = !matches!(job.config.subtitle.adjust_mode, crate::config::SubtitleAdjustMode::TimeShift);

    let mut items = Vec::new();
    for source in &job.sources {
        let stepping_source = matches!(diagnoses.get(&source.source_key), Some(Diagnosis::Stepped { .. }));

        for ts in &source.tracks {
            let track = tracks
                .iter()
                .find(|t| t.source_key == source.source_key && t.track_id == ts.track_id)
                .ok_or_else(|| {
                    PipelineError::InvalidInput(format!(
                        "no probed track for {}:{}",
                        source.source_key, ts.track_id
                    ))
                })?;

            let stepping_adjusted = stepping_source && matches!(ts.track_type, TrackType::Subtitle);
            let track_frame_adjusted = frame_adjusted && matches!(ts.track_type, TrackType::Subtitle);

            let corrected_path = correct.corrected_files.get(&source.source_key).cloned();
            let is_corrected = corrected_path.is_some() && matches!(ts.track_type, TrackType::Audio);
            let file_path: PathBuf = if is_corrected {
                corrected_path.unwrap()
            } else {
                extract
                    .files
                    .get(&(source.source_key.clone(), ts.track_id))
                    .cloned()
                    .ok_or_else(|| {
                        PipelineError::InvalidInput(format!(
                            "no extracted file for {}:{}",
                            source.source_key, ts.track_id
                        ))
                    })?
            };

            let sync_ms = calculate_effective_delay(
                &source.source_key,
                reference_key,
                ts.track_type,
                track.container_delay_ms,
                stepping_adjusted,
                track_frame_adjusted,
                None,
                delays,
            );

            let language = ts.custom_lang.clone().unwrap_or_else(|| track.language.clone());

            items.push(PlanItem {
                source_key: source.source_key.clone(),
                track_id: ts.track_id,
                track_type: ts.track_type,
                codec_id: track.codec_id.clone(),
                file_path,
                container_delay_ms: track.container_delay_ms,
                is_preserved: !ts.convert,
                is_corrected,
                stepping_adjusted,
                frame_adjusted: track_frame_adjusted,
                is_generated: ts.generated,
                // Final default/forced flags are resolved by `apply_default_and_forced_flags`
                // once the track order below is known.
                is_default: false,
                is_forced_display: ts.forced_display,
                custom_name: ts.custom_name.clone(),
                custom_lang: ts.custom_lang.clone(),
                language,
                sync_ms,
            });
        }
    }
    Ok(items)
}

fn type_rank(t: TrackType) -> u8 {
    match t {
        TrackType::Video => 0,
        TrackType::Audio => 1,
        TrackType::Subtitle => 2,
    }
}

fn effective_name(item: &PlanItem, tracks: &[Track]) -> String {
    if let Some(name) = &item.custom_name {
        return name.clone();
    }
    tracks
        .iter()
        .find(|t| t.source_key == item.source_key && t.track_id == item.track_id)
        .and_then(|t| t.name.clone())
        .unwrap_or_default()
}

fn is_signs_songs_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    ["signs", "songs", "titles"].iter().any(|kw| lower.contains(kw))
}

/// Orders plan items per spec §4.10: grouped by type (video, audio,
/// subtitles); within each type, interleaved by source order
/// (reference, secondary, tertiary, …); within the audio group, English
/// tracks are preferred earliest when configured. A stable sort preserves
/// generated/filtered subtitle tracks immediately after their source track.
pub fn order_plan_items(mut items: Vec<PlanItem>, job: &JobSpec, _tracks: &[Track]) -> Vec<PlanItem> {
    let source_order: BTreeMap<&str, usize> =
        job.sources.iter().enumerate().map(|(i, s)| (s.source_key.as_str(), i)).collect();
    let prefer_english = job.config.mux.prefer_english_audio_first;

    items.sort_by(|a, b| {
        let rank = type_rank(a.track_type).cmp(&type_rank(b.track_type));
        if rank != std::cmp::Ordering::Equal {
            return rank;
        }
        if prefer_english && matches!(a.track_type, TrackType::Audio) {
            let a_en = a.language == "eng";
            let b_en = b.language == "eng";
            let en_rank = (!a_en).cmp(&!b_en);
            if en_rank != std::cmp::Ordering::Equal {
                return en_rank;
            }
        }
        let sa = source_order.get(a.source_key.as_str()).copied().unwrap_or(usize::MAX);
        let sb = source_order.get(b.source_key.as_str()).copied().unwrap_or(usize::MAX);
        sa.cmp(&sb).then(a.track_id.cmp(&b.track_id))
    });
    items
}

/// Applies the default/forced-track-flag policy of spec §4.10, over an
/// already-[`order_plan_items`]-ordered slice: exactly one default video,
/// one default audio; subtitle default by the Signs/Songs/Titles ->
/// no-English-audio -> configured-first-sub priority chain; at most one
/// forced-display subtitle, with a later `true` superseding an earlier one.
pub fn apply_default_and_forced_flags(items: &mut [PlanItem], tracks: &[Track], mux: &crate::config::MuxSettings) {
    for item in items.iter_mut() {
        item.is_default = false;
    }

    if let Some(idx) = items.iter().position(|i| matches!(i.track_type, TrackType::Video)) {
        items[idx].is_default = true;
    }
    if let Some(idx) = items.iter().position(|i| matches!(i.track_type, TrackType::Audio)) {
        items[idx].is_default = true;
    }

    let has_english_audio =
        items.iter().any(|i| matches!(i.track_type, TrackType::Audio) && i.language == "eng");

    let signs_idx = items
        .iter()
        .position(|i| matches!(i.track_type, TrackType::Subtitle) && is_signs_songs_name(&effective_name(i, tracks)));
    if let Some(idx) = signs_idx {
        items[idx].is_default = true;
    } else if !has_english_audio || mux.first_sub_default {
        if let Some(idx) = items.iter().position(|i| matches!(i.track_type, TrackType::Subtitle)) {
            items[idx].is_default = true;
        }
    }

    let last_forced = items.iter().enumerate().filter(|(_, i)| i.is_forced_display).map(|(idx, _)| idx).last();
    for (idx, item) in items.iter_mut().enumerate() {
        item.is_forced_display = Some(idx) == last_forced;
    }
}

pub fn build_merge_plan(
    job: &JobSpec,
    tracks: &[Track],
    delays: &Delays,
    diagnoses: &BTreeMap<String, Diagnosis>,
    extract: &ExtractOutput,
    correct: &CorrectOutput,
    chapters_path: Option<PathBuf>,
    attachments: Vec<PathBuf>,
) -> Result<MergePlan, PipelineError> {
    let items = build_plan_items(job, tracks, delays, diagnoses, extract, correct)?;
    let mut items = order_plan_items(items, job, tracks);
    apply_default_and_forced_flags(&mut items, tracks, &job.config.mux);
    Ok(MergePlan {
        items,
        chapters_path,
        attachments,
        global_shift_ms: delays.global_shift_ms,
        output_path: job.output_path.clone(),
    })
}
