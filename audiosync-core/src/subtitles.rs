//! C9 — Subtitle Adjuster.
//!
//! Shifts subtitle event timestamps by a source's resolved delay and,
//! optionally, snaps them onto frame boundaries. No rich subtitle format is
//! parsed here — callers hand in plain millisecond timestamps extracted
//! upstream; this module only implements the spec's own frame-floor/
//! frame-middle arithmetic, since no pack example covers subtitle timing.

use crate::config::SubtitleAdjustMode;

const EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubtitleEvent {
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Floors `time_ms` to the start of its containing frame at `fps`.
fn frame_floor_ms(time_ms: i64, fps: f64) -> i64 {
    let frame_index = (time_ms as f64 / 1000.0 * fps + EPSILON).floor();
    (frame_index / fps * 1000.0).round() as i64
}

/// Snaps `time_ms` to the midpoint of its containing frame at `fps`.
fn frame_middle_ms(time_ms: i64, fps: f64) -> i64 {
    let frame_index = (time_ms as f64 / 1000.0 * fps + EPSILON).floor();
    ((frame_index + 0.5) / fps * 1000.0).round() as i64
}

/// Parses an SRT timestamp (`HH:MM:SS,mmm`) to whole milliseconds.
fn parse_srt_time(text: &str) -> Option<i64> {
    let (hms, ms) = text.trim().split_once(',')?;
    let mut parts = hms.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: i64 = parts.next()?.parse().ok()?;
    let millis: i64 = ms.parse().ok()?;
    Some(((hours * 60 + minutes) * 60 + seconds) * 1000 + millis)
}

fn format_srt_time(ms: i64) -> String {
    let ms = ms.max(0);
    let millis = ms % 1000;
    let total_s = ms / 1000;
    let seconds = total_s % 60;
    let minutes = (total_s / 60) % 60;
    let hours = total_s / 3600;
    format!("{hours:02}:{minutes:02}:{seconds:02},{millis:03}")
}

/// Rewrites every `HH:MM:SS,mmm --> HH:MM:SS,mmm` cue line in an SRT file's
/// text, applying [`adjust_subtitles`]'s delay/snap arithmetic to both
/// endpoints. Lines that aren't cue timings (indices, subtitle text, blank
/// separators) pass through unchanged.
pub fn rewrite_srt_timestamps(text: &str, mode: SubtitleAdjustMode, delay_ms: i64, fps: f64) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if let Some((start_str, end_str)) = line.split_once(" --> ") {
            if let (Some(start_ms), Some(end_str_trimmed)) = (parse_srt_time(start_str), Some(end_str)) {
                let end_core = end_str_trimmed.split_whitespace().next().unwrap_or(end_str_trimmed);
                if let Some(end_ms) = parse_srt_time(end_core) {
                    let mut events = [SubtitleEvent { start_ms, end_ms }];
                    adjust_subtitles(&mut events, mode, delay_ms, fps);
                    out.push_str(&format!(
                        "{} --> {}\n",
                        format_srt_time(events[0].start_ms),
                        format_srt_time(events[0].end_ms)
                    ));
                    continue;
                }
            }
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Applies `delay_ms` then, per `mode`, an optional frame-boundary snap to
/// both the start and end of every event. `fps` is required (and ignored)
/// for `TimeShift`.
pub fn adjust_subtitles(events: &mut [SubtitleEvent], mode: SubtitleAdjustMode, delay_ms: i64, fps: f64) {
    for event in events.iter_mut() {
        let shifted_start = event.start_ms + delay_ms;
        let shifted_end = event.end_ms + delay_ms;
        match mode {
            SubtitleAdjustMode::TimeShift => {
                event.start_ms = shifted_start;
                event.end_ms = shifted_end;
            }
            SubtitleAdjustMode::FrameFloor => {
                event.start_ms = frame_floor_ms(shifted_start, fps);
                event.end_ms = frame_floor_ms(shifted_end, fps);
            }
            SubtitleAdjustMode::FrameMiddle => {
                event.start_ms = frame_middle_ms(shifted_start, fps);
                event.end_ms = frame_middle_ms(shifted_end, fps);
            }
        }
    }
}
