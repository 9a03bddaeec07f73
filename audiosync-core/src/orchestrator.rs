//! C12 — Pipeline Orchestrator.
//!
//! Sequences the fixed step order (Analyze → Extract → Correct → Subtitles →
//! Chapters → Attachments → BuildPlan → Mux) over one job's [`Context`],
//! enforcing the write-once [`JobState`] discipline every step already
//! respects via `publish_*`. Grounded on wingedonezero's
//! `orchestrator/{step.rs,pipeline.rs}` — the `PipelineStep` trait shape and
//! the validate_input/execute/validate_output runner loop are a direct port;
//! this crate's steps differ by working against concrete in-process
//! functions (C1-C11) instead of embedded Python.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{DelaySelectionMode, SnapMode};
use crate::error::{PipelineError, StepError};
use crate::models::{
    AnalysisOutput, AttachmentsOutput, ChaptersOutput, CorrectOutput, Context, ExtractOutput, JobState, MuxOutput,
    Track, TrackType,
};
use crate::{chapters, command_runner, correct, correlate, decoder, drift, mux, plan, probe, select, subtitles};

/// A single stage of the pipeline. The orchestrator calls these methods in
/// order for every step; a step reads only `ctx` and the slots already
/// published in `state` by earlier steps.
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this step may be skipped entirely when its preconditions
    /// aren't met (e.g. Chapters/Attachments with nothing to do). Skipping
    /// still requires the step to publish its empty-result record itself;
    /// this only affects whether validate_input failing is fatal.
    fn is_optional(&self) -> bool {
        false
    }

    fn validate_input(&self, ctx: &Context, state: &JobState) -> Result<(), PipelineError>;
    fn execute(&self, ctx: &Context, state: &mut JobState) -> Result<(), PipelineError>;
    fn validate_output(&self, ctx: &Context, state: &JobState) -> Result<(), PipelineError>;
}

fn require_slot<T>(slot: &Option<T>, name: &str) -> Result<(), PipelineError> {
    if slot.is_none() {
        return Err(PipelineError::InvalidInput(format!("required slot '{name}' not yet published")));
    }
    Ok(())
}

/// Probes every job source, re-derived fresh by whichever step needs it —
/// `Track` data isn't a [`JobState`] slot, since it's a pure function of
/// `ctx.job.sources` rather than pipeline-produced state.
fn probe_all_sources(ctx: &Context) -> Result<Vec<Track>, PipelineError> {
    let mut tracks = Vec::new();
    for source in &ctx.job.sources {
        let result = probe::probe_file(&ctx.job.config.tools.probe_tool, &source.path, &ctx.logger, &ctx.cancel)?;
        tracks.extend(result.tracks);
    }
    Ok(tracks)
}

fn find_track<'a>(tracks: &'a [Track], source_key: &str, track_id: u64) -> Option<&'a Track> {
    tracks.iter().find(|t| t.source_key == source_key && t.track_id == track_id)
}

fn source_path<'a>(ctx: &'a Context, source_key: &str) -> Option<&'a Path> {
    ctx.job.source(source_key).map(|s| s.path.as_path())
}

// ---------------------------------------------------------------------------
//  Analyze
// ---------------------------------------------------------------------------

pub struct AnalyzeStep;

impl PipelineStep for AnalyzeStep {
    fn name(&self) -> &str {
        "Analyze"
    }

    fn validate_input(&self, ctx: &Context, _state: &JobState) -> Result<(), PipelineError> {
        if ctx.job.sources.is_empty() {
            return Err(PipelineError::InvalidInput("job has no sources".into()));
        }
        if ctx.job.sources.len() == 1 {
            return Ok(());
        }
        Ok(())
    }

    fn execute(&self, ctx: &Context, state: &mut JobState) -> Result<(), PipelineError> {
        let reference_key = ctx.job.reference_key().to_string();
        let reference_path = source_path(ctx, &reference_key)
            .ok_or_else(|| PipelineError::InvalidInput(format!("missing reference source '{reference_key}'")))?;
        let reference_audio = decoder::decode_to_canonical(reference_path)?;
        let reference_fps = probe::probe_file(&ctx.job.config.tools.probe_tool, reference_path, &ctx.logger, &ctx.cancel)?
            .tracks
            .iter()
            .find(|t| matches!(t.track_type, TrackType::Video))
            .and_then(|t| t.frame_rate_fps);

        let analysis_settings = &ctx.job.config.analysis;
        let drift_settings = &ctx.job.config.drift;

        let mut source_delays_raw: BTreeMap<String, f64> = BTreeMap::new();
        let mut diagnoses: BTreeMap<String, crate::models::Diagnosis> = BTreeMap::new();
        let mut chunk_results: BTreeMap<String, Vec<crate::models::ChunkResult>> = BTreeMap::new();

        for source in &ctx.job.sources {
            if source.source_key == reference_key {
                continue;
            }
            crate::models::check_cancelled(&ctx.cancel)?;

            let target_audio = decoder::decode_to_canonical(&source.path)?;

            let main_chunks = correlate::correlate_tracks(
                &reference_audio.samples,
                &target_audio.samples,
                reference_audio.sample_rate,
                analysis_settings,
                false,
                &ctx.logger,
                &ctx.cancel,
            )?;
            let stepping_chunks = correlate::correlate_tracks(
                &reference_audio.samples,
                &target_audio.samples,
                reference_audio.sample_rate,
                analysis_settings,
                true,
                &ctx.logger,
                &ctx.cancel,
            )?;

            let selector = match analysis_settings.delay_selection_mode {
                DelaySelectionMode::FirstStable => select::get_first_stable_selector(
                    analysis_settings.first_stable_min_chunks,
                    analysis_settings.first_stable_skip_unstable,
                ),
                mode => select::get_selector(mode),
            };
            let delay_entry = selector.select(&main_chunks, analysis_settings.min_accepted_chunks)?;
            let diagnosis =
                drift::diagnose(&stepping_chunks, drift_settings, analysis_settings.min_accepted_chunks, reference_fps);

            ctx.logger.info(&format!(
                "{}: delay {:.2}ms (rounded {}), diagnosis {:?}",
                source.source_key, delay_entry.raw, delay_entry.rounded, diagnosis
            ));

            source_delays_raw.insert(source.source_key.clone(), delay_entry.raw);
            diagnoses.insert(source.source_key.clone(), diagnosis);
            chunk_results.insert(source.source_key.clone(), main_chunks);
        }

        let delays = plan::finalize_delays(source_delays_raw, &reference_key);
        state.publish_analysis(AnalysisOutput { delays, diagnoses, chunk_results })
    }

    fn validate_output(&self, _ctx: &Context, state: &JobState) -> Result<(), PipelineError> {
        require_slot(&state.analysis, "analysis")
    }
}

// ---------------------------------------------------------------------------
//  Extract
// ---------------------------------------------------------------------------

pub struct ExtractStep;

impl PipelineStep for ExtractStep {
    fn name(&self) -> &str {
        "Extract"
    }

    fn validate_input(&self, _ctx: &Context, state: &JobState) -> Result<(), PipelineError> {
        require_slot(&state.analysis, "analysis")
    }

    fn execute(&self, ctx: &Context, state: &mut JobState) -> Result<(), PipelineError> {
        let tracks = probe_all_sources(ctx)?;
        let mut files: BTreeMap<(String, u64), PathBuf> = BTreeMap::new();

        for source in &ctx.job.sources {
            crate::models::check_cancelled(&ctx.cancel)?;
            if source.tracks.is_empty() {
                continue;
            }
            let stem = source.path.file_stem().and_then(|s| s.to_str()).unwrap_or("source");
            let source_path_str = source
                .path
                .to_str()
                .ok_or_else(|| PipelineError::InvalidInput(format!("non-UTF8 path: {}", source.path.display())))?;

            let mut args: Vec<String> = vec!["tracks".to_string(), source_path_str.to_string()];
            let mut planned: Vec<((String, u64), PathBuf)> = Vec::new();

            for ts in &source.tracks {
                let track = find_track(&tracks, &source.source_key, ts.track_id).ok_or_else(|| {
                    PipelineError::InvalidInput(format!("no probed track for {}:{}", source.source_key, ts.track_id))
                })?;
                let ext = probe::codec_extension(&track.codec_id);
                let file_name = format!("{}_track_{}_{}.{}", source.source_key, stem, ts.track_id, ext);
                let out_path = ctx.working_dir.join(file_name);
                args.push(format!("{}:{}", ts.track_id, out_path.display()));
                planned.push(((source.source_key.clone(), ts.track_id), out_path));
            }

            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            command_runner::run(&ctx.job.config.tools.extract_tool, &arg_refs, &ctx.logger, &ctx.cancel, None)?;

            files.extend(planned);
        }

        state.publish_extract(ExtractOutput { files })
    }

    fn validate_output(&self, _ctx: &Context, state: &JobState) -> Result<(), PipelineError> {
        require_slot(&state.extract, "extract")
    }
}

// ---------------------------------------------------------------------------
//  Correct
// ---------------------------------------------------------------------------

pub struct CorrectStep;

impl PipelineStep for CorrectStep {
    fn name(&self) -> &str {
        "Correct"
    }

    fn validate_input(&self, _ctx: &Context, state: &JobState) -> Result<(), PipelineError> {
        require_slot(&state.analysis, "analysis")?;
        require_slot(&state.extract, "extract")
    }

    fn execute(&self, ctx: &Context, state: &mut JobState) -> Result<(), PipelineError> {
        let analysis = state.analysis.as_ref().expect("validated by validate_input");
        let extract = state.extract.as_ref().expect("validated by validate_input");
        let reference_key = ctx.job.reference_key();

        let mut corrected_files: BTreeMap<String, PathBuf> = BTreeMap::new();

        for source in &ctx.job.sources {
            if source.source_key == reference_key {
                continue;
            }
            let Some(diagnosis) = analysis.diagnoses.get(&source.source_key) else { continue };
            if !correct::needs_correction(diagnosis) {
                continue;
            }
            let Some(audio_ts) = source.tracks.iter().find(|t| matches!(t.track_type, TrackType::Audio)) else {
                continue;
            };
            let Some(input_path) = extract.files.get(&(source.source_key.clone(), audio_ts.track_id)) else {
                continue;
            };

            let output_path = ctx.working_dir.join(format!("{}_corrected.wav", source.source_key));
            let result = correct::correct_audio(
                &ctx.job.config.correction,
                diagnosis,
                &ctx.job.config.tools.correction_engine_tool,
                input_path,
                &output_path,
                &ctx.logger,
                &ctx.cancel,
            );

            match result {
                Ok(Some(path)) => {
                    corrected_files.insert(source.source_key.clone(), path);
                }
                Ok(None) => {}
                Err(e) if e.is_recoverable_warning() => {
                    ctx.logger.warn(&format!("{}: drift correction skipped — {e}", source.source_key));
                }
                Err(e) => return Err(e),
            }
        }

        let ran = !corrected_files.is_empty();
        state.publish_correct(CorrectOutput { corrected_files, ran })
    }

    fn validate_output(&self, _ctx: &Context, state: &JobState) -> Result<(), PipelineError> {
        require_slot(&state.correct, "correct")
    }
}

// ---------------------------------------------------------------------------
//  Subtitles (no JobState slot — rewrites frame-adjusted files in place)
// ---------------------------------------------------------------------------

pub struct SubtitlesStep;

impl PipelineStep for SubtitlesStep {
    fn name(&self) -> &str {
        "Subtitles"
    }

    fn validate_input(&self, _ctx: &Context, state: &JobState) -> Result<(), PipelineError> {
        require_slot(&state.analysis, "analysis")?;
        require_slot(&state.extract, "extract")
    }

    fn execute(&self, ctx: &Context, state: &mut JobState) -> Result<(), PipelineError> {
        let adjust_mode = ctx.job.config.subtitle.adjust_mode;
        if matches!(adjust_mode, crate::config::SubtitleAdjustMode::TimeShift) {
            // Time-shifted subtitles carry their delay via the plan's `--sync`
            // value; no physical rewrite is needed.
            return Ok(());
        }
        let analysis = state.analysis.as_ref().expect("validated by validate_input");
        let extract = state.extract.as_ref().expect("validated by validate_input");
        let reference_key = ctx.job.reference_key();
        let tracks = probe_all_sources(ctx)?;

        for source in &ctx.job.sources {
            let source_fps = tracks
                .iter()
                .find(|t| t.source_key == source.source_key && matches!(t.track_type, TrackType::Video))
                .and_then(|t| t.frame_rate_fps);

            for ts in &source.tracks {
                if !matches!(ts.track_type, TrackType::Subtitle) {
                    continue;
                }
                let Some(file_path) = extract.files.get(&(source.source_key.clone(), ts.track_id)) else { continue };
                if file_path.extension().and_then(|e| e.to_str()) != Some("srt") {
                    ctx.logger.warn(&format!(
                        "{}: frame-adjust mode requested but {} is not SRT, skipping physical rewrite",
                        source.source_key,
                        file_path.display()
                    ));
                    continue;
                }

                let delay_ms = if source.source_key == reference_key {
                    analysis.delays.global_shift_ms
                } else {
                    analysis.delays.get(&source.source_key).map(|e| e.rounded).unwrap_or(0)
                };
                let fps = source_fps.unwrap_or_else(|| {
                    ctx.logger.warn(&format!(
                        "{}: no probed video frame rate, assuming 24.0 fps for frame-snap math",
                        source.source_key
                    ));
                    24.0
                });

                let text = std::fs::read_to_string(file_path)
                    .map_err(|e| PipelineError::InvalidInput(format!("cannot read {}: {e}", file_path.display())))?;
                let rewritten = subtitles::rewrite_srt_timestamps(&text, adjust_mode, delay_ms, fps);
                std::fs::write(file_path, rewritten)
                    .map_err(|e| PipelineError::InvalidInput(format!("cannot write {}: {e}", file_path.display())))?;
            }
        }
        Ok(())
    }

    fn validate_output(&self, _ctx: &Context, _state: &JobState) -> Result<(), PipelineError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
//  Chapters
// ---------------------------------------------------------------------------

const CHAPTER_DEDUP_THRESHOLD_MS: i64 = 100;

pub struct ChaptersStep;

impl PipelineStep for ChaptersStep {
    fn name(&self) -> &str {
        "Chapters"
    }

    fn is_optional(&self) -> bool {
        true
    }

    fn validate_input(&self, _ctx: &Context, state: &JobState) -> Result<(), PipelineError> {
        require_slot(&state.analysis, "analysis")
    }

    fn execute(&self, ctx: &Context, state: &mut JobState) -> Result<(), PipelineError> {
        let analysis = state.analysis.as_ref().expect("validated by validate_input");
        let reference_key = ctx.job.reference_key();
        let reference_path = source_path(ctx, reference_key)
            .ok_or_else(|| PipelineError::InvalidInput(format!("missing reference source '{reference_key}'")))?;

        let probed = probe::probe_file(&ctx.job.config.tools.probe_tool, reference_path, &ctx.logger, &ctx.cancel)?;
        if !probed.has_chapters {
            return state.publish_chapters(ChaptersOutput { path: None, ran: false });
        }

        let ref_path_str = reference_path
            .to_str()
            .ok_or_else(|| PipelineError::InvalidInput(format!("non-UTF8 path: {}", reference_path.display())))?;
        let (_, xml) = command_runner::run_capturing_stdout(
            &ctx.job.config.tools.extract_tool,
            &["chapters", ref_path_str],
            &ctx.logger,
            &ctx.cancel,
            None,
        )?;

        let mut data = chapters::parse_chapters_xml(&xml)?;
        chapters::shift_chapters(&mut data, analysis.delays.global_shift_ms);
        chapters::normalize_chapters(&mut data, CHAPTER_DEDUP_THRESHOLD_MS);

        let settings = &ctx.job.config.chapters;
        if settings.rename_sequential {
            chapters::rename_sequential(&mut data);
        }
        if !matches!(settings.snap_mode, SnapMode::Off) {
            let keyframes = chapters::probe_keyframes_ns(
                &ctx.job.config.tools.keyframe_probe_tool,
                reference_path,
                &ctx.logger,
                &ctx.cancel,
            )?;
            chapters::snap_chapters(&mut data, &keyframes, settings.snap_mode, settings.snap_threshold_ms);
        }

        let out_xml = chapters::write_chapters_xml(&data)?;
        let out_path = ctx.working_dir.join("chapters_mod.xml");
        std::fs::write(&out_path, out_xml)
            .map_err(|e| PipelineError::InvalidInput(format!("cannot write {}: {e}", out_path.display())))?;

        state.publish_chapters(ChaptersOutput { path: Some(out_path), ran: true })
    }

    fn validate_output(&self, _ctx: &Context, state: &JobState) -> Result<(), PipelineError> {
        require_slot(&state.chapters, "chapters")
    }
}

// ---------------------------------------------------------------------------
//  Attachments
// ---------------------------------------------------------------------------

pub struct AttachmentsStep;

impl PipelineStep for AttachmentsStep {
    fn name(&self) -> &str {
        "Attachments"
    }

    fn is_optional(&self) -> bool {
        true
    }

    fn validate_input(&self, _ctx: &Context, _state: &JobState) -> Result<(), PipelineError> {
        Ok(())
    }

    fn execute(&self, ctx: &Context, state: &mut JobState) -> Result<(), PipelineError> {
        let Some(selection) = &ctx.job.attachments else {
            return state.publish_attachments(AttachmentsOutput { files: vec![] });
        };
        let Some(source) = ctx.job.source(&selection.source_key) else {
            return Err(PipelineError::InvalidInput(format!(
                "attachment source '{}' not found",
                selection.source_key
            )));
        };

        let probed = probe::probe_file(&ctx.job.config.tools.probe_tool, &source.path, &ctx.logger, &ctx.cancel)?;
        if probed.attachment_names.is_empty() {
            return state.publish_attachments(AttachmentsOutput { files: vec![] });
        }

        let source_path_str = source
            .path
            .to_str()
            .ok_or_else(|| PipelineError::InvalidInput(format!("non-UTF8 path: {}", source.path.display())))?;
        let attachments_dir = ctx.working_dir.join("attachments");
        std::fs::create_dir_all(&attachments_dir)
            .map_err(|e| PipelineError::InvalidInput(format!("cannot create {}: {e}", attachments_dir.display())))?;

        let mut args: Vec<String> = vec!["attachments".to_string(), source_path_str.to_string()];
        let mut files = Vec::with_capacity(probed.attachment_names.len());
        for (i, name) in probed.attachment_names.iter().enumerate() {
            let out_path = attachments_dir.join(name);
            args.push(format!("{}:{}", i + 1, out_path.display()));
            files.push(out_path);
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        command_runner::run(&ctx.job.config.tools.extract_tool, &arg_refs, &ctx.logger, &ctx.cancel, None)?;

        state.publish_attachments(AttachmentsOutput { files })
    }

    fn validate_output(&self, _ctx: &Context, state: &JobState) -> Result<(), PipelineError> {
        require_slot(&state.attachments, "attachments")
    }
}

// ---------------------------------------------------------------------------
//  BuildPlan
// ---------------------------------------------------------------------------

pub struct BuildPlanStep;

impl PipelineStep for BuildPlanStep {
    fn name(&self) -> &str {
        "BuildPlan"
    }

    fn validate_input(&self, _ctx: &Context, state: &JobState) -> Result<(), PipelineError> {
        require_slot(&state.analysis, "analysis")?;
        require_slot(&state.extract, "extract")?;
        require_slot(&state.correct, "correct")?;
        require_slot(&state.chapters, "chapters")?;
        require_slot(&state.attachments, "attachments")
    }

    fn execute(&self, ctx: &Context, state: &mut JobState) -> Result<(), PipelineError> {
        let tracks = probe_all_sources(ctx)?;
        let analysis = state.analysis.as_ref().expect("validated by validate_input").clone();
        let extract = state.extract.as_ref().expect("validated by validate_input").clone();
        let correct = state.correct.as_ref().expect("validated by validate_input").clone();
        let chapters_path = state.chapters.as_ref().expect("validated by validate_input").path.clone();
        let attachments = state.attachments.as_ref().expect("validated by validate_input").files.clone();

        let merge_plan = plan::build_merge_plan(
            &ctx.job,
            &tracks,
            &analysis.delays,
            &analysis.diagnoses,
            &extract,
            &correct,
            chapters_path,
            attachments,
        )?;
        if merge_plan.items.is_empty() {
            return Err(PipelineError::InvalidInput("merge plan has no items".into()));
        }
        state.publish_merge_plan(merge_plan)
    }

    fn validate_output(&self, _ctx: &Context, state: &JobState) -> Result<(), PipelineError> {
        require_slot(&state.merge_plan, "merge_plan")
    }
}

// ---------------------------------------------------------------------------
//  Mux
// ---------------------------------------------------------------------------

pub struct MuxStep;

impl PipelineStep for MuxStep {
    fn name(&self) -> &str {
        "Mux"
    }

    fn validate_input(&self, _ctx: &Context, state: &JobState) -> Result<(), PipelineError> {
        require_slot(&state.merge_plan, "merge_plan")
    }

    fn execute(&self, ctx: &Context, state: &mut JobState) -> Result<(), PipelineError> {
        let merge_plan = state.merge_plan.as_ref().expect("validated by validate_input");
        let tokens = mux::build_mux_tokens(merge_plan, &ctx.job.config);

        let opts_path = ctx.working_dir.join("opts.json");
        mux::write_options_file(&tokens, &opts_path)?;

        let opts_arg = format!("@{}", opts_path.display());
        let outcome =
            command_runner::run(&ctx.job.config.tools.mux_tool, &[opts_arg.as_str()], &ctx.logger, &ctx.cancel, None)?;

        state.publish_mux(MuxOutput { options_path: opts_path, exit_code: outcome.exit_code })
    }

    fn validate_output(&self, _ctx: &Context, state: &JobState) -> Result<(), PipelineError> {
        require_slot(&state.mux, "mux")
    }
}

// ---------------------------------------------------------------------------
//  Orchestrator
// ---------------------------------------------------------------------------

/// Runs the fixed step sequence over one job, enforcing the
/// validate_input/execute/validate_output contract and write-once
/// [`JobState`] publication for every step.
pub struct Orchestrator {
    steps: Vec<Box<dyn PipelineStep>>,
}

impl Orchestrator {
    /// The spec's fixed step order: Analyze → Extract → Correct → Subtitles
    /// → Chapters → Attachments → BuildPlan → Mux.
    pub fn new() -> Self {
        Self {
            steps: vec![
                Box::new(AnalyzeStep),
                Box::new(ExtractStep),
                Box::new(CorrectStep),
                Box::new(SubtitlesStep),
                Box::new(ChaptersStep),
                Box::new(AttachmentsStep),
                Box::new(BuildPlanStep),
                Box::new(MuxStep),
            ],
        }
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// The ordered step list, for callers that need to drive a partial run
    /// (e.g. the CLI's `analyze`/`plan` subcommands, which stop early).
    pub fn steps(&self) -> &[Box<dyn PipelineStep>] {
        &self.steps
    }

    /// Runs every step in order against a fresh [`JobState`], returning the
    /// fully-populated state on success or the first fatal [`StepError`].
    pub fn run(&self, ctx: &Context) -> Result<JobState, StepError> {
        let mut state = JobState::default();

        for (i, step) in self.steps.iter().enumerate() {
            if let Err(e) = crate::models::check_cancelled(&ctx.cancel) {
                return Err(StepError::new(step.name(), "cancellation", e));
            }

            ctx.logger.section(step.name());
            let percent = ((i as f64 / self.steps.len() as f64) * 100.0) as u32;
            ctx.report_progress(percent, step.name());

            if let Err(e) = step.validate_input(ctx, &state) {
                if step.is_optional() {
                    ctx.logger.info(&format!("{}: skipped ({e})", step.name()));
                    continue;
                }
                return Err(self.fail(ctx, step.name(), "validate_input", e));
            }

            match step.execute(ctx, &mut state) {
                Ok(()) => {}
                Err(e) if e.is_recoverable_warning() => {
                    ctx.logger.warn(&format!("{}: {e}", step.name()));
                }
                Err(e) => return Err(self.fail(ctx, step.name(), "execute", e)),
            }

            if let Err(e) = step.validate_output(ctx, &state) {
                return Err(self.fail(ctx, step.name(), "validate_output", e));
            }
        }

        ctx.report_progress(100, "Complete");
        ctx.logger.info("pipeline completed successfully");
        Ok(state)
    }

    fn fail(&self, ctx: &Context, step: &str, operation: &str, source: PipelineError) -> StepError {
        ctx.logger.fatal(&format!("Job '{}' → {step} → {operation}: {source}", ctx.job.job_name));
        StepError::new(step, operation, source)
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::JobLogger;
    use crate::models::{new_cancel_token, JobSpec};
    use std::sync::atomic::Ordering;

    struct CountingStep {
        name: &'static str,
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl PipelineStep for CountingStep {
        fn name(&self) -> &str {
            self.name
        }
        fn validate_input(&self, _ctx: &Context, _state: &JobState) -> Result<(), PipelineError> {
            Ok(())
        }
        fn execute(&self, _ctx: &Context, _state: &mut JobState) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn validate_output(&self, _ctx: &Context, _state: &JobState) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    fn test_ctx() -> Context {
        let log_path = std::env::temp_dir().join(format!("audiosync_orch_{}.log", std::process::id()));
        Context {
            job: JobSpec {
                job_name: "job".into(),
                sources: vec![crate::models::SourceSpec {
                    source_key: "Source 1".into(),
                    path: "a.mkv".into(),
                    tracks: vec![],
                }],
                attachments: None,
                output_path: "out.mkv".into(),
                config: crate::config::Settings::default(),
            },
            working_dir: std::env::temp_dir(),
            output_dir: std::env::temp_dir(),
            logger: JobLogger::new(&log_path, 20, 20).unwrap(),
            cancel: new_cancel_token(),
            progress: None,
        }
    }

    #[test]
    fn default_step_order_matches_spec() {
        let orchestrator = Orchestrator::new();
        assert_eq!(
            orchestrator.step_names(),
            vec!["Analyze", "Extract", "Correct", "Subtitles", "Chapters", "Attachments", "BuildPlan", "Mux"]
        );
    }

    #[test]
    fn custom_step_list_runs_every_step_once() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let orchestrator = Orchestrator {
            steps: vec![
                Box::new(CountingStep { name: "A", calls: calls.clone() }),
                Box::new(CountingStep { name: "B", calls: calls.clone() }),
            ],
        };
        let ctx = test_ctx();
        let result = orchestrator.run(&ctx);
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancellation_short_circuits_before_first_step() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let orchestrator = Orchestrator {
            steps: vec![Box::new(CountingStep { name: "A", calls: calls.clone() })],
        };
        let ctx = test_ctx();
        ctx.cancel.store(true, Ordering::Relaxed);
        let result = orchestrator.run(&ctx);
        assert!(matches!(result, Err(e) if matches!(e.source, PipelineError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unmet_required_precondition_fails_fast() {
        let orchestrator = Orchestrator::new();
        let ctx = test_ctx();
        let mut state = JobState::default();
        let err = orchestrator.steps[1].validate_input(&ctx, &state).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        state.publish_analysis(AnalysisOutput {
            delays: crate::models::Delays::new(),
            diagnoses: BTreeMap::new(),
            chunk_results: BTreeMap::new(),
        })
        .unwrap();
        assert!(orchestrator.steps[1].validate_input(&ctx, &state).is_ok());
    }

    #[test]
    fn optional_step_is_skipped_not_failed_when_precondition_unmet() {
        let chapters_step = ChaptersStep;
        assert!(chapters_step.is_optional());
        let attachments_step = AttachmentsStep;
        assert!(attachments_step.is_optional());
    }
}
