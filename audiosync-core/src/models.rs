//! Core data model: the types every component reads or publishes.
//!
//! Entities are constructed once by the step that owns them and read-only
//! thereafter; nothing here is mutated after publication to [`JobState`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::PipelineError;
use crate::logging::JobLogger;

// ---------------------------------------------------------------------------
//  Cancellation & progress
// ---------------------------------------------------------------------------

pub type CancelToken = Arc<AtomicBool>;

pub fn new_cancel_token() -> CancelToken {
    Arc::new(AtomicBool::new(false))
}

pub fn check_cancelled(cancel: &CancelToken) -> Result<(), PipelineError> {
    if cancel.load(Ordering::Relaxed) {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}

/// `(percent 0..100, stage)`.
pub type ProgressCallback = Box<dyn Fn(u32, &str) + Send + Sync>;

/// Rounds a millisecond value to the nearest integer, ties to even. The one
/// rounding rule shared by the container-delay contract (§4.2) and the delay
/// normalizer (§4.10) — both need identical tie-breaking on negative inputs.
pub fn round_half_to_even(ms: f64) -> i64 {
    let floor = ms.floor();
    let diff = ms - floor;
    let rounded = if diff < 0.5 {
        floor
    } else if diff > 0.5 {
        floor + 1.0
    } else if (floor as i64) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    };
    rounded as i64
}

// ---------------------------------------------------------------------------
//  Track type & selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    Video,
    Audio,
    Subtitle,
}

/// A track as selected for inclusion in the output, before extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSelection {
    pub track_id: u64,
    pub track_type: TrackType,
    pub convert: bool,
    pub generated: bool,
    pub custom_name: Option<String>,
    pub custom_lang: Option<String>,
    pub forced_display: bool,
}

/// One input file contributing tracks to the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub source_key: String,
    pub path: PathBuf,
    pub tracks: Vec<TrackSelection>,
}

/// Attachment selection: which source's attachments (fonts etc.) to carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentSelection {
    pub source_key: String,
}

/// The immutable input contract for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_name: String,
    pub sources: Vec<SourceSpec>,
    pub attachments: Option<AttachmentSelection>,
    pub output_path: PathBuf,
    pub config: Settings,
}

impl JobSpec {
    /// The reference source is always the first entry.
    pub fn reference_key(&self) -> &str {
        &self.sources[0].source_key
    }

    pub fn source(&self, key: &str) -> Option<&SourceSpec> {
        self.sources.iter().find(|s| s.source_key == key)
    }
}

// ---------------------------------------------------------------------------
//  Track (post-probe)
// ---------------------------------------------------------------------------

/// A probed track, identified by `(source_key, track_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub source_key: String,
    pub track_id: u64,
    pub track_type: TrackType,
    pub codec_id: String,
    pub language: String,
    pub name: Option<String>,
    pub channels: Option<u32>,
    pub sample_rate: Option<u32>,
    /// Signed, ms. Banker's-rounded from the container's minimum_timestamp.
    /// Always 0 for subtitle tracks.
    pub container_delay_ms: i64,
    /// Video frame rate derived from the container's default frame duration.
    /// `None` for audio/subtitle tracks and for video tracks the probe
    /// couldn't derive a duration for.
    pub frame_rate_fps: Option<f64>,
}

// ---------------------------------------------------------------------------
//  Correlation chunk result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkResult {
    pub start_offset_s: f64,
    pub raw_delay_ms: f64,
    pub rounded_delay_ms: i64,
    pub confidence: f64,
    pub accepted: bool,
}

// ---------------------------------------------------------------------------
//  Delays (write-once per analyze step, key-parity structural by construction)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DelayEntry {
    pub rounded: i64,
    pub raw: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delays {
    entries: BTreeMap<String, DelayEntry>,
    pub global_shift_ms: i64,
    pub raw_global_shift_ms: f64,
}

impl Delays {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source_key: impl Into<String>, entry: DelayEntry) {
        self.entries.insert(source_key.into(), entry);
    }

    pub fn get(&self, source_key: &str) -> Option<DelayEntry> {
        self.entries.get(source_key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn source_delays_ms(&self) -> BTreeMap<String, i64> {
        self.entries.iter().map(|(k, v)| (k.clone(), v.rounded)).collect()
    }

    pub fn raw_source_delays_ms(&self) -> BTreeMap<String, f64> {
        self.entries.iter().map(|(k, v)| (k.clone(), v.raw)).collect()
    }
}

// ---------------------------------------------------------------------------
//  Drift diagnosis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSegment {
    pub start_s: f64,
    pub end_s: f64,
    pub delay_ms_rounded: i64,
    pub delay_raw: f64,
    pub drift_rate_ms_per_s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Diagnosis {
    Uniform,
    Stepped { segments: Vec<AudioSegment> },
    LinearDrift { slope_ms_per_s: f64, r_squared: f64 },
    PalDrift,
    InsufficientData { reason: String },
}

// ---------------------------------------------------------------------------
//  Plan item & merge plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    pub source_key: String,
    pub track_id: u64,
    pub track_type: TrackType,
    pub codec_id: String,
    pub file_path: PathBuf,
    pub container_delay_ms: i64,
    pub is_preserved: bool,
    pub is_corrected: bool,
    pub stepping_adjusted: bool,
    pub frame_adjusted: bool,
    pub is_generated: bool,
    pub is_default: bool,
    pub is_forced_display: bool,
    pub custom_name: Option<String>,
    pub custom_lang: Option<String>,
    /// Resolved language code emitted as `--language` (the user override
    /// else the probed track's language, never the raw override alone).
    pub language: String,
    /// Final multiplexer sync value, filled in by the plan builder (C10).
    pub sync_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePlan {
    pub items: Vec<PlanItem>,
    pub chapters_path: Option<PathBuf>,
    pub attachments: Vec<PathBuf>,
    pub global_shift_ms: i64,
    pub output_path: PathBuf,
}

// ---------------------------------------------------------------------------
//  Per-job write-once state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub delays: Delays,
    pub diagnoses: BTreeMap<String, Diagnosis>,
    pub chunk_results: BTreeMap<String, Vec<ChunkResult>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractOutput {
    /// (source_key, track_id) -> extracted file path.
    pub files: BTreeMap<(String, u64), PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectOutput {
    /// Sources that received a corrected audio file, and where it lives.
    pub corrected_files: BTreeMap<String, PathBuf>,
    pub ran: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaptersOutput {
    pub path: Option<PathBuf>,
    pub ran: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentsOutput {
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxOutput {
    pub options_path: PathBuf,
    pub exit_code: i32,
}

/// Write-once accumulator for a single job's published step outputs.
///
/// Each `publish_*` method may be called exactly once; a second call is a
/// [`PipelineError::FatalInvariant`], matching the spec's write-once-slot
/// invariant (the job aborts, no further slots are published).
#[derive(Debug, Default)]
pub struct JobState {
    pub analysis: Option<AnalysisOutput>,
    pub extract: Option<ExtractOutput>,
    pub correct: Option<CorrectOutput>,
    pub chapters: Option<ChaptersOutput>,
    pub attachments: Option<AttachmentsOutput>,
    pub merge_plan: Option<MergePlan>,
    pub mux: Option<MuxOutput>,
}

macro_rules! publish_slot {
    ($fn_name:ident, $field:ident, $ty:ty) => {
        pub fn $fn_name(&mut self, value: $ty) -> Result<(), PipelineError> {
            if self.$field.is_some() {
                return Err(PipelineError::FatalInvariant(format!(
                    "slot '{}' already published",
                    stringify!($field)
                )));
            }
            self.$field = Some(value);
            Ok(())
        }
    };
}

impl JobState {
    publish_slot!(publish_analysis, analysis, AnalysisOutput);
    publish_slot!(publish_extract, extract, ExtractOutput);
    publish_slot!(publish_correct, correct, CorrectOutput);
    publish_slot!(publish_chapters, chapters, ChaptersOutput);
    publish_slot!(publish_attachments, attachments, AttachmentsOutput);
    publish_slot!(publish_merge_plan, merge_plan, MergePlan);
    publish_slot!(publish_mux, mux, MuxOutput);
}

// ---------------------------------------------------------------------------
//  Context
// ---------------------------------------------------------------------------

/// Immutable, shared context threaded through every step of one job run.
pub struct Context {
    pub job: JobSpec,
    pub working_dir: PathBuf,
    pub output_dir: PathBuf,
    pub logger: JobLogger,
    pub cancel: CancelToken,
    pub progress: Option<ProgressCallback>,
}

impl Context {
    pub fn report_progress(&self, percent: u32, stage: &str) {
        self.logger.progress(percent);
        if let Some(cb) = &self.progress {
            cb(percent, stage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_key_parity_is_structural() {
        let mut d = Delays::new();
        d.insert("Source 2", DelayEntry { rounded: 400, raw: 400.2 });
        let rounded = d.source_delays_ms();
        let raw = d.raw_source_delays_ms();
        assert_eq!(rounded.keys().collect::<Vec<_>>(), raw.keys().collect::<Vec<_>>());
    }

    #[test]
    fn job_state_slot_publishes_once() {
        let mut state = JobState::default();
        let out = AnalysisOutput {
            delays: Delays::new(),
            diagnoses: BTreeMap::new(),
            chunk_results: BTreeMap::new(),
        };
        assert!(state.publish_analysis(out.clone()).is_ok());
        assert!(state.publish_analysis(out).is_err());
    }

    #[test]
    fn cancel_token_round_trip() {
        let token = new_cancel_token();
        assert!(check_cancelled(&token).is_ok());
        token.store(true, Ordering::Relaxed);
        assert!(matches!(check_cancelled(&token), Err(PipelineError::Cancelled)));
    }

    #[test]
    fn job_spec_reference_key_is_first_source() {
        let spec = JobSpec {
            job_name: "job".into(),
            sources: vec![
                SourceSpec { source_key: "Source 1".into(), path: "a.mkv".into(), tracks: vec![] },
                SourceSpec { source_key: "Source 2".into(), path: "b.mkv".into(), tracks: vec![] },
            ],
            attachments: None,
            output_path: "out.mkv".into(),
            config: Settings::default(),
        };
        assert_eq!(spec.reference_key(), "Source 1");
    }
}
