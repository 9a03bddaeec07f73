//! C2 — Container Probe.
//!
//! Parses the multiplexer's JSON probe output into typed [`Track`] records.
//! Grounded on wingedonezero's `extraction/probe.rs` `parse_track_info` for
//! the JSON shape, but deliberately does NOT reuse its `(ns/1e6).round()` —
//! this implementation rounds half-to-even as the spec requires, since
//! `minimum_timestamp` may be negative and plain rounding diverges on ties.
//!
//! Invokes the probe tool through [`crate::command_runner`] like every other
//! external tool in this crate — no component spawns processes on its own.

use serde::Deserialize;
use std::path::Path;

use crate::command_runner;
use crate::error::PipelineError;
use crate::logging::JobLogger;
use crate::models::{CancelToken, Track, TrackType};

#[derive(Debug, Deserialize)]
struct ProbeJson {
    tracks: Vec<ProbeTrack>,
    #[serde(default)]
    attachments: Vec<ProbeAttachment>,
    #[serde(default)]
    chapters: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ProbeTrack {
    id: u64,
    #[serde(rename = "type")]
    track_type: String,
    properties: ProbeTrackProperties,
}

#[derive(Debug, Deserialize, Default)]
struct ProbeTrackProperties {
    codec_id: Option<String>,
    language: Option<String>,
    track_name: Option<String>,
    audio_channels: Option<u32>,
    audio_sampling_frequency: Option<u32>,
    minimum_timestamp: Option<i64>,
    /// Nanoseconds per frame, as mkvmerge -J reports it for video tracks.
    #[serde(default)]
    default_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ProbeAttachment {
    file_name: String,
}

pub struct ProbeResult {
    pub tracks: Vec<Track>,
    pub has_chapters: bool,
    pub attachment_count: usize,
    pub attachment_names: Vec<String>,
}

/// Rounds `ns / 1_000_000` to the nearest integer, ties to even. Contractual
/// for `container_delay_ms` (spec §4.2, §8 boundary example: -500_000 ns → -1).
pub fn round_half_to_even_ms(ns: i64) -> i64 {
    crate::models::round_half_to_even(ns as f64 / 1_000_000.0)
}

/// Invokes `probe_tool -J path` (mkvmerge-style JSON probe) and parses the
/// result into typed tracks, applying the container-delay contract.
pub fn probe_file(
    probe_tool: &str,
    path: &Path,
    logger: &JobLogger,
    cancel: &CancelToken,
) -> Result<ProbeResult, PipelineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| PipelineError::InvalidInput(format!("non-UTF8 path: {}", path.display())))?;

    let (_, stdout) =
        command_runner::run_capturing_stdout(probe_tool, &["-J", path_str], logger, cancel, None)?;

    let parsed: ProbeJson = serde_json::from_str(&stdout)
        .map_err(|e| PipelineError::InvalidInput(format!("malformed probe JSON: {e}")))?;

    parse_probe_json(parsed, path)
}

fn parse_probe_json(parsed: ProbeJson, path: &Path) -> Result<ProbeResult, PipelineError> {
    let source_key = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("source")
        .to_string();

    let mut tracks = Vec::with_capacity(parsed.tracks.len());
    for t in parsed.tracks {
        let track_type = match t.track_type.as_str() {
            "video" => TrackType::Video,
            "audio" => TrackType::Audio,
            "subtitles" => TrackType::Subtitle,
            other => {
                return Err(PipelineError::InvalidInput(format!(
                    "unrecognized track type '{other}'"
                )))
            }
        };

        let container_delay_ms = match track_type {
            TrackType::Subtitle => 0,
            _ => t
                .properties
                .minimum_timestamp
                .map(round_half_to_even_ms)
                .unwrap_or(0),
        };

        let frame_rate_fps = match track_type {
            TrackType::Video => t.properties.default_duration.filter(|d| *d > 0).map(|d| 1_000_000_000.0 / d as f64),
            _ => None,
        };

        tracks.push(Track {
            source_key: source_key.clone(),
            track_id: t.id,
            track_type,
            codec_id: t.properties.codec_id.unwrap_or_default(),
            language: normalize_lang(t.properties.language.as_deref().unwrap_or("und")),
            name: t.properties.track_name,
            channels: t.properties.audio_channels,
            sample_rate: t.properties.audio_sampling_frequency,
            container_delay_ms,
            frame_rate_fps,
        });
    }

    Ok(ProbeResult {
        tracks,
        has_chapters: !parsed.chapters.is_empty(),
        attachment_count: parsed.attachments.len(),
        attachment_names: parsed.attachments.into_iter().map(|a| a.file_name).collect(),
    })
}

/// Maps a codec id to the file extension extracted files are named with
/// (spec §6: `<source>_track_<stem>_<id>.<ext>`). Unknown codecs fall back
/// to a neutral container extension rather than failing extraction.
pub fn codec_extension(codec_id: &str) -> &'static str {
    let lower = codec_id.to_lowercase();
    if lower.contains("v_mpeg4") || lower.contains("avc") || lower.contains("h264") {
        "h264"
    } else if lower.contains("hevc") || lower.contains("h265") {
        "h265"
    } else if lower.contains("vp9") {
        "vp9"
    } else if lower.contains("av1") {
        "av1"
    } else if lower.contains("ac3") || lower.contains("ac-3") {
        "ac3"
    } else if lower.contains("dts") {
        "dts"
    } else if lower.contains("aac") {
        "aac"
    } else if lower.contains("flac") {
        "flac"
    } else if lower.contains("opus") {
        "opus"
    } else if lower.contains("pcm") {
        "wav"
    } else if lower.contains("ass") || lower.contains("ssa") {
        "ass"
    } else if lower.contains("utf8") || lower.contains("subrip") {
        "srt"
    } else if lower.contains("vobsub") {
        "sub"
    } else if lower.contains("pgs") {
        "sup"
    } else {
        "bin"
    }
}

/// Normalizes a 2-letter ISO code to 3-letter where a well-known mapping
/// exists; otherwise passes 3-letter codes through lowercased.
pub fn normalize_lang(code: &str) -> String {
    let lower = code.to_lowercase();
    match lower.as_str() {
        "en" => "eng".to_string(),
        "ja" => "jpn".to_string(),
        "fr" => "fre".to_string(),
        "de" => "ger".to_string(),
        "es" => "spa".to_string(),
        "it" => "ita".to_string(),
        "ko" => "kor".to_string(),
        "zh" => "chi".to_string(),
        _ => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banker_rounding_half_cases() {
        assert_eq!(round_half_to_even_ms(-500_000), 0);
        assert_eq!(round_half_to_even_ms(-1_500_000), -2);
        assert_eq!(round_half_to_even_ms(500_000), 0);
        assert_eq!(round_half_to_even_ms(1_500_000), 2);
        assert_eq!(round_half_to_even_ms(2_500_000), 2);
    }

    #[test]
    fn banker_rounding_non_half_cases() {
        assert_eq!(round_half_to_even_ms(1_200_000), 1);
        assert_eq!(round_half_to_even_ms(-1_200_000), -1);
        assert_eq!(round_half_to_even_ms(0), 0);
    }

    #[test]
    fn subtitle_tracks_always_zero_delay() {
        let json = ProbeJson {
            tracks: vec![ProbeTrack {
                id: 2,
                track_type: "subtitles".into(),
                properties: ProbeTrackProperties {
                    minimum_timestamp: Some(5_000_000),
                    ..Default::default()
                },
            }],
            attachments: vec![],
            chapters: vec![],
        };
        let result = parse_probe_json(json, Path::new("movie.mkv")).unwrap();
        assert_eq!(result.tracks[0].container_delay_ms, 0);
    }

    #[test]
    fn video_frame_rate_derived_from_default_duration() {
        let json = ProbeJson {
            tracks: vec![ProbeTrack {
                id: 0,
                track_type: "video".into(),
                properties: ProbeTrackProperties { default_duration: Some(41_708_333), ..Default::default() },
            }],
            attachments: vec![],
            chapters: vec![],
        };
        let result = parse_probe_json(json, Path::new("movie.mkv")).unwrap();
        let fps = result.tracks[0].frame_rate_fps.unwrap();
        assert!((fps - 23.976).abs() < 0.01);
    }

    #[test]
    fn audio_tracks_have_no_frame_rate() {
        let json = ProbeJson {
            tracks: vec![ProbeTrack {
                id: 1,
                track_type: "audio".into(),
                properties: ProbeTrackProperties::default(),
            }],
            attachments: vec![],
            chapters: vec![],
        };
        let result = parse_probe_json(json, Path::new("movie.mkv")).unwrap();
        assert_eq!(result.tracks[0].frame_rate_fps, None);
    }

    #[test]
    fn unrecognized_track_type_is_invalid_input() {
        let json = ProbeJson {
            tracks: vec![ProbeTrack {
                id: 0,
                track_type: "buttons".into(),
                properties: ProbeTrackProperties::default(),
            }],
            attachments: vec![],
            chapters: vec![],
        };
        let result = parse_probe_json(json, Path::new("movie.mkv"));
        assert!(matches!(result, Err(PipelineError::InvalidInput(_))));
    }

    #[test]
    fn normalize_lang_maps_common_codes() {
        assert_eq!(normalize_lang("en"), "eng");
        assert_eq!(normalize_lang("EN"), "eng");
        assert_eq!(normalize_lang("jpn"), "jpn");
    }

    #[test]
    fn codec_extension_maps_known_codecs() {
        assert_eq!(codec_extension("A_AC3"), "ac3");
        assert_eq!(codec_extension("A_AAC"), "aac");
        assert_eq!(codec_extension("S_TEXT/UTF8"), "srt");
        assert_eq!(codec_extension("S_HDMV/PGS"), "sup");
    }

    #[test]
    fn codec_extension_falls_back_to_neutral_for_unknown_codec() {
        assert_eq!(codec_extension("X_MADE_UP"), "bin");
    }
}
