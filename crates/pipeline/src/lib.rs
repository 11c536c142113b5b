//! av1-batch pipeline
//!
//! Orchestration substrate for batch video transcoding: discovery,
//! submit-on-demand scheduling with a dynamic worker cap, the per-job
//! decision/execution state machine, subprocess adapters, and the event bus
//! the dashboard and keyboard controller hang off.

pub mod bus;
pub mod cache;
pub mod colorfix;
pub mod decide;
pub mod demo;
pub mod domain;
pub mod error_mover;
pub mod events;
pub mod exif;
pub mod gate;
pub mod housekeeping;
pub mod job_runner;
pub mod orchestrator;
pub mod probe;
pub mod queue_sort;
pub mod scan;
pub mod transcode;

pub use bus::EventBus;
pub use cache::MetadataCache;
pub use colorfix::{apply_color_fix, needs_color_fix, TempFileGuard};
pub use decide::{decide_quality, decide_rotation, quality_display, DecideError};
pub use demo::DemoOrchestrator;
pub use domain::{
    error_marker_path, tmp_output_path, CompressionJob, JobStatus, QualityDecision, Rotation,
    VideoFile, VideoMetadata, COLOR_SPACE_RESERVED,
};
pub use error_mover::{move_failed_files, MoveOutcome, CONFIRMATION_THRESHOLD};
pub use events::{CompletionOutcome, DiscoveryStats, Event, EventKind, OverlayTab};
pub use exif::{EncodeTags, ExifInfo, MetadataAdapter, MetadataError};
pub use gate::{SlotGuard, ThreadAdjust, WorkerGate};
pub use housekeeping::{pre_run_sweep, SweepReport};
pub use job_runner::{JobReport, JobRunner, CORRUPTED_MESSAGE};
pub use orchestrator::{Orchestrator, RunSummary};
pub use probe::{ProbeAdapter, ProbeError, ENCODER_TAG_KEY};
pub use queue_sort::sort_files;
pub use scan::{ScanItem, Scanner};
pub use transcode::{
    select_audio_options, FfmpegProgressParser, ProgressParser, ProgressUpdate, TranscodeError,
    TranscodeResult, TranscoderAdapter, HW_CAP_MESSAGE,
};
