//! Per-job pipeline: marker check, probe, color fix, metadata, filters,
//! decisions, transcode with CPU fallback, metadata copy, minimum-ratio
//! check and verification.
//!
//! Each stage maps failures onto the job-state taxonomy; exactly one
//! terminal event is published per job.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use av1_batch_config::{
    build_job_config, infer_encoder_label, output_extension_for_args, select_encoder_args,
    AppConfig, CliOverrides, LocalConfigRegistry, RootPaths, VerifyFailAction,
};

use crate::bus::EventBus;
use crate::cache::MetadataCache;
use crate::colorfix::{apply_color_fix, needs_color_fix};
use crate::domain::{CompressionJob, JobStatus, VideoFile, VideoMetadata};
use crate::decide::{decide_quality, decide_rotation, quality_display};
use crate::events::{CompletionOutcome, Event};
use crate::exif::{EncodeTags, MetadataAdapter};
use crate::probe::ProbeAdapter;
use crate::transcode::{TranscodeResult, TranscoderAdapter, HW_CAP_MESSAGE};

/// Marker text for sources the probe cannot read.
pub const CORRUPTED_MESSAGE: &str = "File is corrupted (probe failed to read). Skipped.";

/// What one job run amounted to, as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobReport {
    pub status: JobStatus,
    /// Set when verification failed; the orchestrator applies the policy.
    pub verify_action: Option<VerifyFailAction>,
    /// The job never started: shutdown won the slot race.
    pub dropped: bool,
}

impl JobReport {
    fn terminal(status: JobStatus) -> Self {
        Self {
            status,
            verify_action: None,
            dropped: false,
        }
    }

    fn dropped() -> Self {
        Self {
            status: JobStatus::Pending,
            verify_action: None,
            dropped: true,
        }
    }
}

/// Executes one job through every pipeline stage.
pub struct JobRunner {
    pub config: Arc<AppConfig>,
    pub bus: Arc<EventBus>,
    pub probe: Arc<ProbeAdapter>,
    pub exif: Arc<MetadataAdapter>,
    pub transcoder: Arc<TranscoderAdapter>,
    pub cache: Arc<MetadataCache>,
    pub registry: Option<Arc<LocalConfigRegistry>>,
    pub cli_overrides: Option<Arc<CliOverrides>>,
    /// Fired by the immediate-interrupt path; consumed by the transcoder.
    pub cancellation: CancellationToken,
    pub ffmpeg_bin: PathBuf,
}

impl JobRunner {
    /// Run one job to a terminal state. The worker slot is assumed to be
    /// held by the caller.
    pub async fn run(&self, file: VideoFile, root: &RootPaths) -> JobReport {
        let filename = file.file_name();
        debug!("Processing {filename}");

        // Effective configuration for this file (CLI > per-root > global).
        let job_config = match build_job_config(
            &self.config,
            self.registry.as_deref(),
            &file.path,
            self.cli_overrides.as_deref(),
        ) {
            Ok((config, source)) => (Arc::new(config), source),
            Err(e) => {
                // A broken per-root document fails the job, not the run.
                let message = format!("Invalid per-root configuration: {e}");
                let job = self.make_job(&file, root, &self.config, self.config.general.gpu);
                return self.fail(job, message, true);
            }
        };
        let (job_config, config_source) = job_config;
        let mut use_gpu = job_config.general.gpu;

        let mut job = self.make_job(&file, root, &job_config, use_gpu);
        job.config_source = config_source;

        // Stale error marker: with clean-errors off the file is refused.
        if job.error_path.exists() {
            if job_config.general.clean_errors {
                let _ = std::fs::remove_file(&job.error_path);
            } else {
                job.status = JobStatus::Failed;
                job.error_message = Some("Existing error marker found".to_string());
                self.bus.publish(Event::JobFailed {
                    job: job.clone(),
                    message: "Existing error marker found".to_string(),
                });
                return JobReport::terminal(JobStatus::Failed);
            }
        }

        // Probe. Failure marks the source corrupted.
        let probed = match self.probe.stream_info(&file.path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                error!("Corrupted file detected (probe failed): {filename} - {e}");
                self.cache.record_failure(file.path.clone());
                return self.fail(job, CORRUPTED_MESSAGE.to_string(), true);
            }
        };

        // Color-space pre-step; the intermediate replaces the transcoder
        // input and is dropped on every exit path.
        let mut effective_input = file.path.clone();
        let mut _colorfix_guard = None;
        if needs_color_fix(&probed) {
            match apply_color_fix(&self.ffmpeg_bin, &file.path, &job.output_path, &probed).await {
                Ok(guard) => {
                    effective_input = guard.path().to_path_buf();
                    _colorfix_guard = Some(guard);
                }
                Err(message) => return self.fail(job, message, true),
            }
        }

        // Metadata through the cache (probe info enriched with camera
        // fields). Extraction problems degrade to probe-only metadata.
        let metadata = self.resolve_metadata(&file, probed, &job_config).await;
        job.source.metadata = Some(metadata.clone());

        // Previously encoded by this system: relocate, no transcode.
        if metadata.previously_encoded {
            return match self.move_already_encoded(&job.source, root) {
                Ok(final_path) => {
                    info!("Already encoded, moved to output: {filename}");
                    job.status = JobStatus::Completed;
                    job.output_path = final_path;
                    job.output_size_bytes = Some(job.source.size_bytes);
                    self.bus.publish(Event::JobCompleted {
                        job: job.clone(),
                        outcome: CompletionOutcome::AlreadyEncoded,
                    });
                    JobReport::terminal(JobStatus::Completed)
                }
                Err(message) => self.fail(job, message, true),
            };
        }

        // Filter: already in the target codec.
        if job_config.general.skip_av1 && metadata.codec.to_lowercase().contains("av1") {
            return self.skip(job, "Already encoded in AV1".to_string());
        }

        // Filter: camera include list.
        if !job_config.general.filter_cameras.is_empty() {
            let camera = metadata
                .camera_model
                .clone()
                .or_else(|| metadata.camera_raw.clone())
                .unwrap_or_default();
            let matched = job_config
                .general
                .filter_cameras
                .iter()
                .any(|pattern| camera.to_lowercase().contains(&pattern.to_lowercase()));
            if !matched {
                return self.skip(job, format!("Camera \"{camera}\" not in filter"));
            }
        }

        // Decisions.
        job.rotation = decide_rotation(&job.source, &job_config);
        let mut quality = match decide_quality(&job.source, &job_config, use_gpu) {
            Ok(quality) => quality,
            Err(e) => return self.fail(job, e.to_string(), true),
        };
        job.quality_display = quality_display(&quality, &job_config, use_gpu);
        job.quality = Some(quality.clone());

        // Transcode.
        job.status = JobStatus::Processing;
        self.bus.publish(Event::JobStarted { job: job.clone() });

        let started = Instant::now();
        let mut result = match self
            .transcoder
            .transcode(
                &job,
                &job_config,
                use_gpu,
                &quality,
                job.rotation,
                &effective_input,
                &self.cancellation,
            )
            .await
        {
            Ok(result) => result,
            Err(e) => TranscodeResult::Failed(e.to_string()),
        };

        // Hardware capability failure retries once on the CPU encoder.
        if result == TranscodeResult::HwCapExceeded && job_config.general.cpu_fallback && use_gpu {
            info!("Hardware capability exceeded for {filename}; retrying on CPU");
            let _ = std::fs::remove_file(&job.error_path);
            use_gpu = false;

            // The CPU argument list may select another container.
            let cpu_output = self.output_path_for(&file, root, &job_config, use_gpu);
            if cpu_output != job.output_path {
                job.output_path = cpu_output.clone();
                job.error_path = crate::domain::error_marker_path(&cpu_output);
                if let Some(parent) = cpu_output.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }
            quality = match decide_quality(&job.source, &job_config, use_gpu) {
                Ok(quality) => quality,
                Err(e) => return self.fail(job, e.to_string(), true),
            };
            job.quality_display = quality_display(&quality, &job_config, use_gpu);
            job.quality = Some(quality.clone());
            job.status = JobStatus::Processing;
            job.error_message = None;

            result = match self
                .transcoder
                .transcode(
                    &job,
                    &job_config,
                    use_gpu,
                    &quality,
                    job.rotation,
                    &effective_input,
                    &self.cancellation,
                )
                .await
            {
                Ok(result) => result,
                Err(e) => TranscodeResult::Failed(e.to_string()),
            };
        }
        job.duration_seconds = Some(started.elapsed().as_secs_f64());

        match result {
            TranscodeResult::Completed => {
                self.finish_completed(job, &job_config, use_gpu).await
            }
            TranscodeResult::Interrupted => {
                job.status = JobStatus::Interrupted;
                job.error_message = Some("Interrupted by user".to_string());
                self.bus.publish(Event::JobFailed {
                    job: job.clone(),
                    message: "Interrupted by user".to_string(),
                });
                JobReport::terminal(JobStatus::Interrupted)
            }
            TranscodeResult::HwCapExceeded => {
                job.status = JobStatus::HwCapExceeded;
                job.error_message = Some(HW_CAP_MESSAGE.to_string());
                write_marker(&job.error_path, HW_CAP_MESSAGE);
                self.bus
                    .publish(Event::HardwareCapabilityExceeded { job: job.clone() });
                JobReport::terminal(JobStatus::HwCapExceeded)
            }
            TranscodeResult::Failed(message) => self.fail(job, message, true),
        }
    }

    /// Post-transcode steps for a successful encode: metadata copy,
    /// minimum-ratio check, verification.
    async fn finish_completed(
        &self,
        mut job: CompressionJob,
        job_config: &Arc<AppConfig>,
        use_gpu: bool,
    ) -> JobReport {
        let filename = job.file_name();
        let encoder_args = select_encoder_args(job_config, use_gpu);
        let tags = EncodeTags {
            original_name: filename.clone(),
            original_size: job.source.size_bytes,
            quality: job.quality_display.clone(),
            encoder: infer_encoder_label(encoder_args, use_gpu),
            finished_at: chrono::Local::now().to_rfc3339(),
        };

        // Preserved-metadata copy is best-effort: a failure is a warning,
        // never a failed job.
        let copy_result = if job_config.general.copy_metadata {
            self.exif
                .copy_preserved(&job.source.path, &job.output_path, &tags)
                .await
        } else {
            self.exif.write_tags(&job.output_path, &tags).await
        };
        if let Err(e) = copy_result {
            warn!("Metadata copy failed for {filename}: {e}");
            self.bus.publish(Event::JobWarning {
                path: job.source.path.clone(),
                message: format!("Metadata copy failed: {e}"),
            });
        }

        // Minimum-ratio check. Savings strictly below the threshold keep
        // the original; savings exactly at the threshold keep the
        // compressed output (hence the epsilon, so 0.1 of a 2000-byte file
        // does not misclassify on floating-point rounding).
        let output_size = std::fs::metadata(&job.output_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let ratio = output_size as f64 / job.source.size_bytes.max(1) as f64;
        let savings = 1.0 - ratio;
        let threshold = job_config.general.min_compression_ratio;
        let mut outcome = CompletionOutcome::Compressed;

        if savings + 1e-9 < threshold {
            info!(
                "Savings below threshold for {filename} (ratio {ratio:.2}, need {threshold:.2}); keeping original"
            );
            if let Err(e) = std::fs::remove_file(&job.output_path) {
                warn!("Failed to drop under-compressed output for {filename}: {e}");
            }
            if let Err(e) = std::fs::copy(&job.source.path, &job.output_path) {
                return self.fail(job, format!("Failed to copy original into place: {e}"), true);
            }
            job.output_size_bytes = Some(job.source.size_bytes);
            job.status = JobStatus::KeptOriginal;
            outcome = CompletionOutcome::KeptOriginal;
        } else {
            job.output_size_bytes = Some(output_size);
            job.status = JobStatus::Completed;
        }

        // Verification only applies to outputs this run actually encoded.
        if job_config.general.verify_fail_action != VerifyFailAction::Off
            && outcome == CompletionOutcome::Compressed
        {
            if let Err(reason) = self.verify_output(&job.output_path).await {
                let action = job_config.general.verify_fail_action;
                warn!("Verification failed for {filename}: {reason}");
                job.status = JobStatus::Failed;
                job.error_message = Some(reason.clone());
                write_marker(&job.error_path, &format!("Verification failed: {reason}"));
                self.bus.publish(Event::JobFailed {
                    job: job.clone(),
                    message: format!("Verification failed: {reason}"),
                });
                match action {
                    VerifyFailAction::Pause => self.bus.publish(Event::PauseRequested {
                        reason: format!("verification failed for {filename}"),
                    }),
                    VerifyFailAction::Exit => self.bus.publish(Event::FatalRequested {
                        reason: format!("verification failed for {filename}"),
                    }),
                    _ => {}
                }
                return JobReport {
                    status: JobStatus::Failed,
                    verify_action: Some(action),
                    dropped: false,
                };
            }
        }

        self.bus.publish(Event::JobCompleted {
            job: job.clone(),
            outcome,
        });
        JobReport::terminal(job.status)
    }

    /// Probe the output and require the custom tags to be present.
    async fn verify_output(&self, output_path: &Path) -> Result<(), String> {
        let metadata = self
            .probe
            .stream_info(output_path)
            .await
            .map_err(|e| format!("output probe failed: {e}"))?;
        if !metadata.previously_encoded {
            return Err("encode tags missing from output".to_string());
        }
        Ok(())
    }

    async fn resolve_metadata(
        &self,
        file: &VideoFile,
        probed: VideoMetadata,
        job_config: &Arc<AppConfig>,
    ) -> Arc<VideoMetadata> {
        if let Some(cached) = self.cache.get(&file.path) {
            return cached;
        }

        let mut metadata = probed;
        if job_config.general.use_exif {
            match self
                .exif
                .extract(&file.path, &job_config.general.dynamic_quality)
                .await
            {
                Ok(info) => {
                    metadata.camera_model = info.camera_model;
                    metadata.camera_raw = info.camera_raw;
                    metadata.quality_override = info.quality_override;
                    if let Some(bitrate) = info.bitrate_kbps {
                        metadata.bitrate_kbps = Some(bitrate);
                    }
                    if info.previously_encoded {
                        metadata.previously_encoded = true;
                    }
                }
                Err(e) => {
                    debug!("Metadata extraction failed for {}: {e}", file.file_name());
                }
            }
        }

        self.cache.insert(file.path.clone(), Arc::new(metadata))
    }

    /// Relocate a source that already carries this system's tag into the
    /// output tree. Existing different files at the destination divert the
    /// move to a `_dup`-suffixed name instead of overwriting.
    fn move_already_encoded(
        &self,
        source: &VideoFile,
        root: &RootPaths,
    ) -> Result<PathBuf, String> {
        let relative = source
            .path
            .strip_prefix(&root.input)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(source.file_name()));
        let mut destination = root.output.join(&relative);

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
        }

        if destination.exists() {
            let stem = destination
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("file")
                .to_string();
            let ext = destination
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(".{e}"))
                .unwrap_or_default();
            destination = destination.with_file_name(format!("{stem}_dup{ext}"));
            warn!(
                "Destination exists; diverting already-encoded move to {}",
                destination.display()
            );
        }

        move_file(&source.path, &destination)
            .map_err(|e| format!("failed to move already-encoded file: {e}"))?;

        let moved_size = std::fs::metadata(&destination)
            .map(|m| m.len())
            .map_err(|e| format!("move verification failed: {e}"))?;
        if moved_size != source.size_bytes {
            return Err(format!(
                "move verification failed: size mismatch (expected {}, found {moved_size})",
                source.size_bytes
            ));
        }
        Ok(destination)
    }

    fn make_job(
        &self,
        file: &VideoFile,
        root: &RootPaths,
        config: &AppConfig,
        use_gpu: bool,
    ) -> CompressionJob {
        let output_path = self.output_path_for(file, root, config, use_gpu);
        if let Some(parent) = output_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        CompressionJob::new(file.clone(), output_path)
    }

    /// Output path the discovery pass should expect for a file, using the
    /// global configuration (per-root overrides are resolved at run time).
    pub fn output_path_for_discovery(&self, file: &VideoFile, root: &RootPaths) -> PathBuf {
        self.output_path_for(file, root, &self.config, self.config.general.gpu)
    }

    fn output_path_for(
        &self,
        file: &VideoFile,
        root: &RootPaths,
        config: &AppConfig,
        use_gpu: bool,
    ) -> PathBuf {
        let suffix = output_extension_for_args(select_encoder_args(config, use_gpu));
        let relative = file
            .path
            .strip_prefix(&root.input)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(file.file_name()));
        let mut output = root.output.join(relative);
        output.set_extension(suffix.trim_start_matches('.'));
        output
    }

    fn fail(&self, mut job: CompressionJob, message: String, with_marker: bool) -> JobReport {
        if with_marker {
            write_marker(&job.error_path, &message);
        }
        job.status = JobStatus::Failed;
        job.error_message = Some(message.clone());
        self.bus.publish(Event::JobFailed {
            job,
            message,
        });
        JobReport::terminal(JobStatus::Failed)
    }

    fn skip(&self, mut job: CompressionJob, reason: String) -> JobReport {
        job.status = JobStatus::Skipped;
        job.error_message = Some(reason.clone());
        self.bus.publish(Event::JobSkipped { job, reason });
        JobReport::terminal(JobStatus::Skipped)
    }
}

/// Acquire-then-run wrapper used by the orchestrator: waits on the gate and
/// drops the job when shutdown wins.
pub async fn run_gated(
    runner: Arc<JobRunner>,
    gate: Arc<crate::gate::WorkerGate>,
    file: VideoFile,
    root: RootPaths,
) -> JobReport {
    let Some(_slot) = gate.acquire().await else {
        debug!("Dropping {} (shutdown)", file.file_name());
        return JobReport::dropped();
    };
    runner.run(file, &root).await
}

fn write_marker(error_path: &Path, message: &str) {
    if let Some(parent) = error_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(error_path, message) {
        warn!("Failed to write error marker {}: {e}", error_path.display());
    }
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_carry_terminal_state() {
        let report = JobReport::terminal(JobStatus::Completed);
        assert_eq!(report.status, JobStatus::Completed);
        assert!(!report.dropped);
        assert!(report.verify_action.is_none());

        let dropped = JobReport::dropped();
        assert!(dropped.dropped);
        assert_eq!(dropped.status, JobStatus::Pending);
    }

    #[test]
    fn marker_writes_create_parent_tree() {
        let tmp = tempfile::TempDir::new().unwrap();
        let marker = tmp.path().join("deep/nested/clip.err");
        write_marker(&marker, "corrupted");
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "corrupted");
    }
}
