//! C11 — Mux Option Builder.
//!
//! Turns an assembled [`MergePlan`] into the flat multiplexer command-token
//! array the spec contracts for (§4.11), and writes it as a single-line
//! UTF-8 JSON options file consumed via `@path`. Grounded on
//! wingedonezero's `mux/options_builder.rs` token-assembly order, but
//! unlike that builder this one always emits `--language`/`--sync`/
//! `--default-track-flag` per track (the spec requires every value present,
//! not only non-default ones) and signs `--sync` explicitly (`+N`/`-N`/`+0`).
//!
//! Does not execute the multiplexer itself — [`crate::command_runner`] is
//! the only component in this crate that spawns processes.

use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::error::PipelineError;
use crate::models::{MergePlan, PlanItem, TrackType};

/// Builds the full mkvmerge-style option token array for `plan`.
pub fn build_mux_tokens(plan: &MergePlan, settings: &Settings) -> Vec<String> {
    let mut tokens = Vec::new();

    tokens.push("--output".to_string());
    tokens.push(path_str(&plan.output_path));

    if settings.mux.disable_track_statistics {
        tokens.push("--disable-track-statistics-tags".to_string());
    }

    if let Some(chapters_path) = &plan.chapters_path {
        tokens.push("--chapters".to_string());
        tokens.push(path_str(chapters_path));
    }

    for item in &plan.items {
        add_track_tokens(&mut tokens, item, settings);
    }

    for attachment in &plan.attachments {
        tokens.push("--attach-file".to_string());
        tokens.push(path_str(attachment));
    }

    add_track_order(&mut tokens, plan);

    tokens
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn signed(value: i64) -> String {
    if value > 0 {
        format!("+{value}")
    } else if value < 0 {
        value.to_string()
    } else {
        "+0".to_string()
    }
}

fn add_track_tokens(tokens: &mut Vec<String>, item: &PlanItem, settings: &Settings) {
    const TID: &str = "0";

    tokens.push("--language".to_string());
    tokens.push(format!("{TID}:{}", item.language));

    if let Some(name) = &item.custom_name {
        tokens.push("--track-name".to_string());
        tokens.push(format!("{TID}:{name}"));
    }

    tokens.push("--sync".to_string());
    tokens.push(format!("{TID}:{}", signed(item.sync_ms)));

    tokens.push("--default-track-flag".to_string());
    tokens.push(format!("{TID}:{}", if item.is_default { "yes" } else { "no" }));

    if item.is_forced_display && matches!(item.track_type, TrackType::Subtitle) {
        tokens.push("--forced-display-flag".to_string());
        tokens.push(format!("{TID}:yes"));
    }

    tokens.push("--compression".to_string());
    tokens.push(format!("{TID}:none"));

    if settings.mux.remove_dialog_norm_gain && matches!(item.track_type, TrackType::Audio) && is_ac3_family(&item.codec_id) {
        tokens.push("--remove-dialog-normalization-gain".to_string());
        tokens.push(TID.to_string());
    }

    tokens.push("(".to_string());
    tokens.push(path_str(&item.file_path));
    tokens.push(")".to_string());
}

/// True for AC-3/E-AC-3 codec ids (`A_AC3`, `A_EAC3`, and ffprobe-style
/// `ac-3`/`eac-3` spellings), per the spec's dialog-norm-removal gate.
fn is_ac3_family(codec_id: &str) -> bool {
    let lower = codec_id.to_lowercase();
    lower.contains("ac3") || lower.contains("ac-3")
}

fn add_track_order(tokens: &mut Vec<String>, plan: &MergePlan) {
    if plan.items.is_empty() {
        return;
    }
    let order: Vec<String> = (0..plan.items.len()).map(|i| format!("{i}:0")).collect();
    tokens.push("--track-order".to_string());
    tokens.push(order.join(","));
}

/// Serializes `tokens` as a single-line UTF-8 JSON array and writes it to
/// `path` (the spec's `opts.json`), returning the path on success.
pub fn write_options_file(tokens: &[String], path: &Path) -> Result<PathBuf, PipelineError> {
    let json = serde_json::to_string(tokens)
        .map_err(|e| PipelineError::InvalidInput(format!("failed to serialize options: {e}")))?;
    std::fs::write(path, json)
        .map_err(|e| PipelineError::InvalidInput(format!("failed to write {}: {e}", path.display())))?;
    Ok(path.to_path_buf())
}
