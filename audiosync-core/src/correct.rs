//! C7 — Audio Corrector.
//!
//! Applies a diagnosed drift correction to an extracted audio file: an EDL
//! concatenation for `Stepped` sources, or a tempo-ratio resample for
//! `LinearDrift`/`PalDrift` sources. Grounded on the teacher's
//! `apply_drift_correction`/`apply_drift_correction_f64` (linear-interpolation
//! resampling) for the tempo-ratio path, and on the stitching-loop shape of
//! its `engine::sync` for the EDL path.

use std::path::{Path, PathBuf};

use crate::command_runner;
use crate::config::{CorrectionEngine, CorrectionSettings, SteppingFillPolicy};
use crate::decoder::{self, DecodedAudio};
use crate::error::PipelineError;
use crate::logging::JobLogger;
use crate::models::{AudioSegment, CancelToken, Diagnosis};

/// One edit-decision-list entry: take `[source_start_s, source_end_s)` of
/// the input and place it at `output_start_s`. `silence_before_s` is a gap
/// (under [`SteppingFillPolicy::Silence`]) to pad with silence immediately
/// before this entry's content.
#[derive(Debug, Clone, PartialEq)]
pub struct EdlEntry {
    pub source_start_s: f64,
    pub source_end_s: f64,
    pub output_start_s: f64,
    pub silence_before_s: f64,
}

/// Context for snapping EDL cut points to nearby silence instead of
/// cutting through audible content (spec §4.7 / scenario 4).
pub struct SilenceSearch<'a> {
    pub samples: &'a [f32],
    pub sample_rate: u32,
    pub search_window_ms: f64,
    pub std_threshold: f64,
}

impl<'a> SilenceSearch<'a> {
    pub fn from_settings(audio: &'a DecodedAudio, settings: &CorrectionSettings) -> Self {
        SilenceSearch {
            samples: &audio.samples,
            sample_rate: audio.sample_rate,
            search_window_ms: settings.silence_search_window_ms,
            std_threshold: settings.silence_std_threshold,
        }
    }

    fn snap(&self, seconds: f64) -> f64 {
        let target_sample = (seconds * self.sample_rate as f64).round().max(0.0) as usize;
        match find_silence_near(self.samples, self.sample_rate, target_sample, self.search_window_ms, self.std_threshold) {
            Some(sample) => sample as f64 / self.sample_rate as f64,
            None => seconds,
        }
    }
}

/// Builds the EDL for a `Stepped` diagnosis: one entry per segment, each
/// mapped onto the reference timeline starting at the segment's own
/// `start_s` (compensated by that segment's delay). When `silence` is
/// given, each cut point is snapped to the quietest nearby sample within
/// the configured search window rather than cut exactly on-boundary.
/// A gap left by a segment whose content doesn't reach the next segment's
/// start is either silence-padded or filled by pulling more real content
/// from the source, per `fill_policy`.
pub fn build_stepping_edl(
    segments: &[AudioSegment],
    fill_policy: SteppingFillPolicy,
    silence: Option<&SilenceSearch>,
) -> Vec<EdlEntry> {
    let mut edl: Vec<EdlEntry> = Vec::with_capacity(segments.len());
    let source_len_s = silence.map(|s| s.samples.len() as f64 / s.sample_rate as f64);

    for seg in segments {
        let output_start_s = seg.start_s;
        let mut source_start_s = (seg.start_s + seg.delay_raw / 1000.0).max(0.0);
        let end_s = if seg.end_s.is_finite() { seg.end_s } else { seg.start_s };
        let mut source_end_s = (end_s + seg.delay_raw / 1000.0).max(source_start_s);

        if let Some(s) = silence {
            source_start_s = s.snap(source_start_s).max(0.0);
            if source_end_s.is_finite() && end_s != seg.start_s {
                source_end_s = s.snap(source_end_s).max(source_start_s);
            }
        }

        edl.push(EdlEntry { source_start_s, source_end_s, output_start_s, silence_before_s: 0.0 });
    }

    for i in 0..edl.len() {
        let duration = edl[i].source_end_s - edl[i].source_start_s;
        let next_output_start_s = edl.get(i + 1).map(|n| n.output_start_s);
        let Some(next_output_start_s) = next_output_start_s else { continue };
        let gap = next_output_start_s - (edl[i].output_start_s + duration);
        if gap <= 0.0 {
            continue;
        }
        match fill_policy {
            SteppingFillPolicy::Silence => edl[i + 1].silence_before_s = gap,
            SteppingFillPolicy::Content => {
                let max_end = source_len_s.unwrap_or(f64::INFINITY);
                edl[i].source_end_s = (edl[i].source_end_s + gap).min(max_end);
            }
        }
    }

    edl
}

/// Renders a stepping EDL by concatenating segments via an external audio
/// engine (ffmpeg `concat` demuxer convention: writes a concat script and
/// invokes the external tool through [`command_runner`]).
pub fn render_stepping_edl(
    engine_tool: &str,
    input_path: &Path,
    edl: &[EdlEntry],
    output_path: &Path,
    logger: &JobLogger,
    cancel: &CancelToken,
) -> Result<(), PipelineError> {
    if edl.is_empty() {
        return Err(PipelineError::InvalidInput("empty EDL".into()));
    }

    let mut filter_parts: Vec<String> = Vec::new();
    let mut concat_inputs = String::new();
    let mut concat_n = 0usize;
    for (i, e) in edl.iter().enumerate() {
        if e.silence_before_s > 0.0 {
            filter_parts.push(format!("aevalsrc=0:d={:.6}[sil{i}]", e.silence_before_s));
            concat_inputs.push_str(&format!("[sil{i}]"));
            concat_n += 1;
        }
        filter_parts.push(format!(
            "[0:a]atrim=start={:.6}:end={:.6},asetpts=PTS-STARTPTS[a{i}]",
            e.source_start_s, e.source_end_s
        ));
        concat_inputs.push_str(&format!("[a{i}]"));
        concat_n += 1;
    }
    let filter_complex = format!("{};{concat_inputs}concat=n={concat_n}:v=0:a=1[out]", filter_parts.join(";"));

    let input_str = input_path.to_str().ok_or_else(|| PipelineError::InvalidInput("non-UTF8 input path".into()))?;
    let output_str = output_path.to_str().ok_or_else(|| PipelineError::InvalidInput("non-UTF8 output path".into()))?;

    let args = [
        "-y",
        "-i",
        input_str,
        "-filter_complex",
        &filter_complex,
        "-map",
        "[out]",
        output_str,
    ];
    command_runner::run(engine_tool, &args, logger, cancel, None)?;
    Ok(())
}

/// Renders a tempo-ratio correction for `LinearDrift`/`PalDrift`: resamples
/// the whole track by `1 - slope_ms_per_s / 1000` (spec §4.7) so that it
/// tracks the reference's clock.
pub fn render_tempo_correction(
    engine: CorrectionEngine,
    engine_tool: &str,
    input_path: &Path,
    slope_ms_per_s: f64,
    output_path: &Path,
    logger: &JobLogger,
    cancel: &CancelToken,
) -> Result<(), PipelineError> {
    let tempo_ratio = 1.0 - slope_ms_per_s / 1000.0;

    let input_str = input_path.to_str().ok_or_else(|| PipelineError::InvalidInput("non-UTF8 input path".into()))?;
    let output_str = output_path.to_str().ok_or_else(|| PipelineError::InvalidInput("non-UTF8 output path".into()))?;

    let filter = match engine {
        CorrectionEngine::Rubberband => format!("rubberband=tempo={tempo_ratio:.8}"),
        CorrectionEngine::Atempo => format!("atempo={tempo_ratio:.8}"),
        CorrectionEngine::Aresample => format!("asetrate=48000*{tempo_ratio:.8},aresample=48000"),
    };

    let args = ["-y", "-i", input_str, "-filter:a", &filter, output_str];
    command_runner::run(engine_tool, &args, logger, cancel, None)?;
    Ok(())
}

pub fn needs_correction(diagnosis: &Diagnosis) -> bool {
    matches!(diagnosis, Diagnosis::Stepped { .. } | Diagnosis::LinearDrift { .. } | Diagnosis::PalDrift)
}

/// Top-level dispatch: given a diagnosis, decides which correction path
/// applies and renders the corrected file, or reports why it can't.
pub fn correct_audio(
    settings: &CorrectionSettings,
    diagnosis: &Diagnosis,
    engine_tool: &str,
    input_path: &Path,
    output_path: &Path,
    logger: &JobLogger,
    cancel: &CancelToken,
) -> Result<Option<PathBuf>, PipelineError> {
    if !settings.correction_enabled {
        return Ok(None);
    }
    match diagnosis {
        Diagnosis::Uniform => Ok(None),
        Diagnosis::Stepped { segments } => {
            let decoded = decoder::decode_to_canonical(input_path)?;
            let silence = SilenceSearch::from_settings(&decoded, settings);
            let edl = build_stepping_edl(segments, settings.stepping_fill_policy, Some(&silence));
            render_stepping_edl(engine_tool, input_path, &edl, output_path, logger, cancel)?;
            Ok(Some(output_path.to_path_buf()))
        }
        Diagnosis::LinearDrift { slope_ms_per_s, .. } => {
            render_tempo_correction(
                settings.correction_engine,
                engine_tool,
                input_path,
                *slope_ms_per_s,
                output_path,
                logger,
                cancel,
            )?;
            Ok(Some(output_path.to_path_buf()))
        }
        Diagnosis::PalDrift => {
            let slope_ms_per_s = crate::drift::PAL_DRIFT_MS_PER_S;
            render_tempo_correction(
                settings.correction_engine,
                engine_tool,
                input_path,
                slope_ms_per_s,
                output_path,
                logger,
                cancel,
            )?;
            Ok(Some(output_path.to_path_buf()))
        }
        Diagnosis::InsufficientData { reason } => Err(PipelineError::DriftUncorrectable { reason: reason.clone() }),
    }
}

/// Sliding-window standard-deviation silence detector, used to choose a
/// splice point that doesn't cut through audible content. Grounded on the
/// spec's own contract (`silence_std_threshold`, `silence_search_window_ms`).
pub fn find_silence_near(
    samples: &[f32],
    sample_rate: u32,
    target_sample: usize,
    search_window_ms: f64,
    std_threshold: f64,
) -> Option<usize> {
    let window_samples = ((search_window_ms / 1000.0) * sample_rate as f64) as usize;
    let lo = target_sample.saturating_sub(window_samples);
    let hi = (target_sample + window_samples).min(samples.len());
    if lo >= hi {
        return None;
    }

    let step = (sample_rate / 1000).max(1) as usize; // ~1ms granularity
    let mut best: Option<(usize, f64)> = None;
    let mut i = lo;
    while i + step < hi {
        let slice = &samples[i..i + step];
        let mean = slice.iter().map(|&s| s as f64).sum::<f64>() / slice.len() as f64;
        let variance = slice.iter().map(|&s| (s as f64 - mean).powi(2)).sum::<f64>() / slice.len() as f64;
        let std = variance.sqrt() * 32768.0; // scale to a 16-bit-like magnitude for threshold comparability
        if std <= std_threshold && best.map(|(_, b)| std < b).unwrap_or(true) {
            best = Some((i, std));
        }
        i += step;
    }
    best.map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(start: f64, end: f64, delay_raw: f64) -> AudioSegment {
        AudioSegment {
            start_s: start,
            end_s: end,
            delay_ms_rounded: delay_raw.round() as i64,
            delay_raw,
            drift_rate_ms_per_s: 0.0,
        }
    }

    #[test]
    fn stepping_edl_maps_segments_with_delay_compensation() {
        let segments = vec![segment(0.0, 30.0, 100.0), segment(30.0, f64::INFINITY, 300.0)];
        let edl = build_stepping_edl(&segments, SteppingFillPolicy::Silence, None);
        assert_eq!(edl.len(), 2);
        assert_eq!(edl[0].output_start_s, 0.0);
        assert!((edl[0].source_start_s - 0.1).abs() < 1e-9);
        assert_eq!(edl[1].output_start_s, 30.0);
    }

    #[test]
    fn stepping_edl_silence_policy_pads_gap_before_next_entry() {
        // Segment 0 runs [0, 10) mapped with no delay (duration 10s), but
        // the next segment's output_start is at 12s — a 2s gap.
        let segments = vec![segment(0.0, 10.0, 0.0), segment(12.0, f64::INFINITY, 0.0)];
        let edl = build_stepping_edl(&segments, SteppingFillPolicy::Silence, None);
        assert_eq!(edl[0].silence_before_s, 0.0);
        assert!((edl[1].silence_before_s - 2.0).abs() < 1e-9);
        // Silence policy never pulls extra source content.
        assert_eq!(edl[0].source_end_s, 10.0);
    }

    #[test]
    fn stepping_edl_content_policy_extends_source_instead_of_padding() {
        let segments = vec![segment(0.0, 10.0, 0.0), segment(12.0, f64::INFINITY, 0.0)];
        let edl = build_stepping_edl(&segments, SteppingFillPolicy::Content, None);
        assert_eq!(edl[1].silence_before_s, 0.0);
        assert!((edl[0].source_end_s - 12.0).abs() < 1e-9);
    }

    #[test]
    fn stepping_edl_snaps_cut_to_nearby_silence() {
        let sample_rate = 8000u32;
        let mut samples = vec![0.5f32; sample_rate as usize];
        for s in samples[3900..4100].iter_mut() {
            *s = 0.0;
        }
        let silence = SilenceSearch { samples: &samples, sample_rate, search_window_ms: 100.0, std_threshold: 1.0 };
        let segments = vec![segment(0.5, 30.0, 0.0)];
        let edl = build_stepping_edl(&segments, SteppingFillPolicy::Silence, Some(&silence));
        let snapped_sample = (edl[0].source_start_s * sample_rate as f64).round() as usize;
        assert!((3900..4100).contains(&snapped_sample));
    }

    #[test]
    fn needs_correction_excludes_uniform() {
        assert!(!needs_correction(&Diagnosis::Uniform));
        assert!(needs_correction(&Diagnosis::PalDrift));
        assert!(needs_correction(&Diagnosis::LinearDrift { slope_ms_per_s: 1.0, r_squared: 0.95 }));
    }

    #[test]
    fn correction_disabled_returns_none() {
        let settings = CorrectionSettings { correction_enabled: false, ..CorrectionSettings::default() };
        let logger = JobLogger::new(
            &std::env::temp_dir().join(format!("audiosync_correct_{}.log", std::process::id())),
            5,
            20,
        )
        .unwrap();
        let cancel = crate::models::new_cancel_token();
        let result = correct_audio(
            &settings,
            &Diagnosis::PalDrift,
            "ffmpeg",
            Path::new("in.wav"),
            Path::new("out.wav"),
            &logger,
            &cancel,
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn insufficient_data_is_uncorrectable() {
        let settings = CorrectionSettings::default();
        let logger = JobLogger::new(
            &std::env::temp_dir().join(format!("audiosync_correct2_{}.log", std::process::id())),
            5,
            20,
        )
        .unwrap();
        let cancel = crate::models::new_cancel_token();
        let result = correct_audio(
            &settings,
            &Diagnosis::InsufficientData { reason: "too few chunks".into() },
            "ffmpeg",
            Path::new("in.wav"),
            Path::new("out.wav"),
            &logger,
            &cancel,
        );
        assert!(matches!(result, Err(PipelineError::DriftUncorrectable { .. })));
    }

    #[test]
    fn find_silence_near_prefers_low_variance_window() {
        let sample_rate = 8000u32;
        let mut samples = vec![0.5f32; sample_rate as usize];
        for s in samples[3900..4100].iter_mut() {
            *s = 0.0;
        }
        let found = find_silence_near(&samples, sample_rate, 4000, 100.0, 1.0);
        assert!(found.is_some());
    }
}
