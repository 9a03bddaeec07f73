//! AudioSync Core — multi-source audio/video synchronization and muxing engine.
//!
//! This crate provides:
//! - **models**: Core data model (`JobSpec`, `Track`, `Delays`, `JobState`, `Context`).
//! - **config**: Layered, validated `Settings`.
//! - **error**: `PipelineError`/`StepError` taxonomy.
//! - **logging**: Per-job `JobLogger`.
//! - **command_runner**: The crate's one external-process boundary.
//! - **probe**: Container probe JSON parsing.
//! - **decoder**: Audio decode-to-canonical-PCM.
//! - **correlate**: FFT cross-correlation delay detection.
//! - **select**: Per-source delay selection policies.
//! - **drift**: Drift diagnosis (uniform/stepped/linear/PAL).
//! - **correct**: Drift correction rendering.
//! - **chapters**: Chapter XML parse/shift/snap/write.
//! - **subtitles**: Subtitle timestamp adjustment.
//! - **plan**: Delay normalization and merge-plan assembly.
//! - **mux**: Multiplexer option-token building.
//! - **orchestrator**: Fixed-order pipeline step sequencing.

pub mod chapters;
pub mod command_runner;
pub mod config;
pub mod correct;
pub mod correlate;
pub mod decoder;
pub mod drift;
pub mod error;
pub mod logging;
pub mod models;
pub mod mux;
pub mod orchestrator;
pub mod plan;
pub mod probe;
pub mod select;
pub mod subtitles;

pub use config::Settings;
pub use error::{PipelineError, PipelineResult, StepError, StepResult};
pub use models::*;
pub use orchestrator::{Orchestrator, PipelineStep};
