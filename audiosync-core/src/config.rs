//! Layered, validated configuration.
//!
//! Every string-switch option from the canonical configuration keys is an
//! explicit enum: unknown values fail `serde` deserialization rather than
//! silently falling back to a default, per the spec's own design note.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMethod {
    GccPhat,
    Scc,
    Scot,
    Whitened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelaySelectionMode {
    MostCommon,
    Clustered,
    Average,
    FirstStable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapMode {
    Off,
    Previous,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionEngine {
    Rubberband,
    Aresample,
    Atempo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SteppingFillPolicy {
    Silence,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryMode {
    Start,
    Majority,
    Midpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleAdjustMode {
    TimeShift,
    FrameFloor,
    FrameMiddle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub chunk_count: usize,
    pub chunk_duration_s: f64,
    pub scan_start_pct: f64,
    pub scan_end_pct: f64,
    pub stepping_scan_end_pct: f64,
    pub min_match_pct: f64,
    pub min_accepted_chunks: usize,
    pub correlation_method: CorrelationMethod,
    pub delay_selection_mode: DelaySelectionMode,
    pub first_stable_min_chunks: usize,
    pub first_stable_skip_unstable: bool,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            chunk_count: 10,
            chunk_duration_s: 15.0,
            scan_start_pct: 5.0,
            scan_end_pct: 95.0,
            stepping_scan_end_pct: 99.0,
            min_match_pct: 5.0,
            min_accepted_chunks: 3,
            correlation_method: CorrelationMethod::GccPhat,
            delay_selection_mode: DelaySelectionMode::MostCommon,
            first_stable_min_chunks: 3,
            first_stable_skip_unstable: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftSettings {
    pub cluster_epsilon_ms: f64,
    pub drift_r2_threshold: f64,
    pub slope_threshold_ms_per_s: f64,
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self {
            cluster_epsilon_ms: 20.0,
            drift_r2_threshold: 0.9,
            slope_threshold_ms_per_s: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionSettings {
    pub correction_enabled: bool,
    pub correction_engine: CorrectionEngine,
    pub silence_std_threshold: f64,
    pub silence_search_window_ms: f64,
    pub stepping_fill_policy: SteppingFillPolicy,
    pub boundary_mode: BoundaryMode,
}

impl Default for CorrectionSettings {
    fn default() -> Self {
        Self {
            correction_enabled: true,
            correction_engine: CorrectionEngine::Rubberband,
            silence_std_threshold: 100.0,
            silence_search_window_ms: 50.0,
            stepping_fill_policy: SteppingFillPolicy::Silence,
            boundary_mode: BoundaryMode::Majority,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaptersSettings {
    pub rename_sequential: bool,
    pub snap_mode: SnapMode,
    pub snap_threshold_ms: f64,
}

impl Default for ChaptersSettings {
    fn default() -> Self {
        Self {
            rename_sequential: false,
            snap_mode: SnapMode::Off,
            snap_threshold_ms: 250.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitleSettings {
    pub adjust_mode: SubtitleAdjustMode,
}

impl Default for SubtitleSettings {
    fn default() -> Self {
        Self { adjust_mode: SubtitleAdjustMode::TimeShift }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxSettings {
    pub remove_dialog_norm_gain: bool,
    pub disable_track_statistics: bool,
    pub first_sub_default: bool,
    pub prefer_english_audio_first: bool,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            remove_dialog_norm_gain: false,
            disable_track_statistics: false,
            first_sub_default: false,
            prefer_english_audio_first: true,
        }
    }
}

/// External tool binary names. Not part of the spec's canonical configuration
/// keys (those govern pipeline behavior, not host binary locations), but
/// every component that shells out (C1's callers) needs a name to invoke —
/// grounded on the teacher's own hardcoded `"ffmpeg"`, generalized into an
/// overridable settings block the way wingedonezero externalizes its tool
/// paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub mux_tool: String,
    pub extract_tool: String,
    pub probe_tool: String,
    pub correction_engine_tool: String,
    pub keyframe_probe_tool: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            mux_tool: "mkvmerge".to_string(),
            extract_tool: "mkvextract".to_string(),
            probe_tool: "mkvmerge".to_string(),
            correction_engine_tool: "ffmpeg".to_string(),
            keyframe_probe_tool: "ffprobe".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub analysis: AnalysisSettings,
    pub drift: DriftSettings,
    pub correction: CorrectionSettings,
    pub chapters: ChaptersSettings,
    pub subtitle: SubtitleSettings,
    pub mux: MuxSettings,
    pub tools: ToolSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_canonical_keys() {
        let s = Settings::default();
        assert_eq!(s.analysis.chunk_count, 10);
        assert_eq!(s.analysis.chunk_duration_s, 15.0);
        assert_eq!(s.analysis.scan_start_pct, 5.0);
        assert_eq!(s.analysis.scan_end_pct, 95.0);
        assert_eq!(s.analysis.stepping_scan_end_pct, 99.0);
        assert_eq!(s.analysis.min_match_pct, 5.0);
        assert_eq!(s.analysis.first_stable_min_chunks, 3);
        assert_eq!(s.drift.cluster_epsilon_ms, 20.0);
        assert_eq!(s.drift.drift_r2_threshold, 0.9);
        assert_eq!(s.correction.silence_std_threshold, 100.0);
        assert_eq!(s.correction.silence_search_window_ms, 50.0);
        assert_eq!(s.chapters.snap_threshold_ms, 250.0);
    }

    #[test]
    fn settings_round_trip_json() {
        let s = Settings::default();
        let json = serde_json::to_string(&s).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.analysis.chunk_count, s.analysis.chunk_count);
    }

    #[test]
    fn unknown_enum_value_rejected() {
        let json = r#"{"analysis":{"correlation_method":"not_a_method"}}"#;
        let result: Result<Settings, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn missing_fields_use_defaults() {
        let json = r#"{"analysis":{"chunk_count":20}}"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.analysis.chunk_count, 20);
        assert_eq!(s.analysis.chunk_duration_s, 15.0);
    }
}
