//! Discovery driver and submit-on-demand scheduler.
//!
//! The orchestrator owns the pending deque, the in-flight task set and the
//! submitted-paths ledger. It replenishes the in-flight set up to
//! `prefetch_factor x max_threads` whenever capacity frees, waits at most
//! one second for completions so control flags are observed promptly, and
//! exits when both the deque and the in-flight set are empty (or a fatal
//! event arrives).

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use av1_batch_config::{AppConfig, LocalConfigRegistry, RootPaths};

use crate::bus::EventBus;
use crate::domain::{error_marker_path, VideoFile};
use crate::events::{DiscoveryStats, Event, EventKind};
use crate::gate::WorkerGate;
use crate::job_runner::{run_gated, JobReport, JobRunner};
use crate::queue_sort::sort_files;
use crate::scan::{ScanItem, Scanner};
use crate::transcode::HW_CAP_MESSAGE;

/// Bounded wait for completions, so shutdown/refresh flags are seen quickly.
const DRIVER_TICK: Duration = Duration::from_secs(1);

/// Idle wait while the queue is paused or empty but the run is not done.
const IDLE_TICK: Duration = Duration::from_millis(200);

/// How many pending entries ride along in a `QueueUpdated` preview.
const QUEUE_PREVIEW_LEN: usize = 50;

/// How the run ended; the binary maps this onto exit codes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub interrupted: bool,
    pub fatal: bool,
}

/// Control flags toggled by bus handlers and read by the driver loop.
#[derive(Debug, Default)]
struct ControlFlags {
    refresh: AtomicBool,
    paused: AtomicBool,
    fatal: AtomicBool,
    interrupted: AtomicBool,
}

/// Discovery, scheduling, and run lifecycle for one invocation.
pub struct Orchestrator {
    config: Arc<AppConfig>,
    bus: Arc<EventBus>,
    scanner: Scanner,
    runner: Arc<JobRunner>,
    gate: Arc<WorkerGate>,
    mapping: Vec<RootPaths>,
    registry: Option<Arc<LocalConfigRegistry>>,
    cancellation: CancellationToken,
    flags: Arc<ControlFlags>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        bus: Arc<EventBus>,
        runner: Arc<JobRunner>,
        gate: Arc<WorkerGate>,
        mapping: Vec<RootPaths>,
        registry: Option<Arc<LocalConfigRegistry>>,
        cancellation: CancellationToken,
    ) -> Self {
        let scanner = Scanner::new(
            &config.general.extensions,
            config.general.min_size_bytes,
        );
        let orchestrator = Self {
            config,
            bus,
            scanner,
            runner,
            gate,
            mapping,
            registry,
            cancellation,
            flags: Arc::new(ControlFlags::default()),
        };
        orchestrator.subscribe_controls();
        orchestrator
    }

    pub fn gate(&self) -> &Arc<WorkerGate> {
        &self.gate
    }

    /// Wire keyboard/control events to the gate and the driver flags.
    fn subscribe_controls(&self) {
        let gate = self.gate.clone();
        let bus = self.bus.clone();
        self.bus.subscribe(EventKind::ThreadControl, move |event| {
            let Event::ThreadControl { delta } = event else {
                return;
            };
            if gate.is_shutdown() {
                return;
            }
            let adjust = gate.adjust_max(*delta);
            let message = if adjust.new != adjust.old {
                format!("Threads: {} → {}", adjust.old, adjust.new)
            } else if *delta > 0 {
                format!("Threads: {} (max)", adjust.new)
            } else {
                format!("Threads: {} (min)", adjust.new)
            };
            bus.publish(Event::ActionMessage { message });
        });

        let gate = self.gate.clone();
        let bus = self.bus.clone();
        let flags = self.flags.clone();
        self.bus.subscribe(EventKind::RequestShutdown, move |_| {
            let shutting_down = gate.toggle_shutdown();
            if shutting_down {
                flags.paused.store(false, Ordering::Release);
            }
            let message = if shutting_down {
                "SHUTDOWN requested (press S to cancel)".to_string()
            } else {
                "SHUTDOWN cancelled".to_string()
            };
            bus.publish(Event::ActionMessage { message });
        });

        let gate = self.gate.clone();
        let bus = self.bus.clone();
        let flags = self.flags.clone();
        let cancellation = self.cancellation.clone();
        self.bus.subscribe(EventKind::InterruptRequested, move |_| {
            info!("Immediate interrupt requested");
            flags.interrupted.store(true, Ordering::Release);
            flags.paused.store(false, Ordering::Release);
            gate.force_shutdown();
            cancellation.cancel();
            bus.publish(Event::ActionMessage {
                message: "Interrupting active transcodes...".to_string(),
            });
        });

        let flags = self.flags.clone();
        self.bus.subscribe(EventKind::RefreshRequested, move |_| {
            flags.refresh.store(true, Ordering::Release);
            flags.paused.store(false, Ordering::Release);
        });

        let flags = self.flags.clone();
        self.bus.subscribe(EventKind::PauseRequested, move |_| {
            flags.paused.store(true, Ordering::Release);
        });

        let flags = self.flags.clone();
        let gate = self.gate.clone();
        let cancellation = self.cancellation.clone();
        self.bus.subscribe(EventKind::FatalRequested, move |event| {
            if let Event::FatalRequested { reason } = event {
                error!("Fatal requested: {reason}");
            }
            flags.fatal.store(true, Ordering::Release);
            gate.force_shutdown();
            cancellation.cancel();
        });
    }

    /// Run discovery and drive the queue to completion.
    pub async fn run(&self) -> RunSummary {
        loop {
            let (files, stats) = self.discover();
            self.bus.publish(Event::DiscoveryFinished(stats.clone()));

            if files.is_empty() {
                info!("No files to process");
            } else {
                self.process_queue(files).await;
            }

            let flags = &self.flags;
            let done = flags.fatal.load(Ordering::Acquire)
                || flags.interrupted.load(Ordering::Acquire)
                || self.gate.is_shutdown();

            if !done && self.config.general.wait_on_finish {
                self.bus.publish(Event::ProcessingFinished);
                self.bus.publish(Event::WaitingForInput);
                if self.wait_for_operator().await {
                    continue; // refresh requested: discover again
                }
                break;
            }

            if !self.gate.is_shutdown() && !flags.fatal.load(Ordering::Acquire) {
                self.bus.publish(Event::ProcessingFinished);
            }
            break;
        }

        RunSummary {
            interrupted: self.flags.interrupted.load(Ordering::Acquire),
            fatal: self.flags.fatal.load(Ordering::Acquire),
        }
    }

    /// Park after a finished run until the operator refreshes (true) or
    /// shuts down (false).
    async fn wait_for_operator(&self) -> bool {
        loop {
            if self.flags.refresh.swap(false, Ordering::AcqRel) {
                return true;
            }
            if self.gate.is_shutdown() || self.flags.fatal.load(Ordering::Acquire) {
                return false;
            }
            tokio::time::sleep(IDLE_TICK).await;
        }
    }

    /// Single-pass discovery over all roots.
    fn discover(&self) -> (Vec<VideoFile>, DiscoveryStats) {
        let mut stats = DiscoveryStats {
            source_folders: self.mapping.len(),
            ..Default::default()
        };
        let mut files = Vec::new();
        let general = &self.config.general;

        for root in &self.mapping {
            self.bus.publish(Event::DiscoveryStarted {
                directory: root.input.clone(),
            });

            let mut prune = Vec::new();
            if let Some(leaf) = root.output_leaf() {
                prune.push(leaf.to_string());
            }
            if let Some(leaf) = root.errors_leaf() {
                prune.push(leaf.to_string());
            }

            for item in self.scanner.scan(&root.input, &prune) {
                let candidate = match item {
                    ScanItem::IgnoredSmall(_) => {
                        stats.ignored_small += 1;
                        continue;
                    }
                    ScanItem::IgnoredWrongExt(_) => {
                        stats.ignored_wrong_ext += 1;
                        continue;
                    }
                    ScanItem::Accepted(file) => file,
                };
                stats.files_found += 1;

                let output_path = self.runner.output_path_for_discovery(&candidate, root);
                let err_path = error_marker_path(&output_path);

                // Markers first: a stale marker either blocks the file or,
                // for capability failures with CPU fallback on, is cleared
                // for a retry.
                if err_path.exists() {
                    if general.clean_errors {
                        let _ = std::fs::remove_file(&err_path);
                    } else {
                        let is_hw_cap = std::fs::read_to_string(&err_path)
                            .map(|content| content.contains(HW_CAP_MESSAGE))
                            .unwrap_or(false);
                        if is_hw_cap && general.cpu_fallback {
                            let _ = std::fs::remove_file(&err_path);
                        } else {
                            if !is_hw_cap {
                                stats.ignored_err += 1;
                            }
                            stats.files_found -= 1;
                            continue;
                        }
                    }
                }

                // Output newer than input means the work is already done.
                if let (Ok(out_meta), Ok(src_meta)) = (
                    std::fs::metadata(&output_path),
                    std::fs::metadata(&candidate.path),
                ) {
                    let newer = match (out_meta.modified(), src_meta.modified()) {
                        (Ok(out_time), Ok(src_time)) => out_time >= src_time,
                        _ => false,
                    };
                    if newer {
                        stats.already_compressed += 1;
                        continue;
                    }
                }

                files.push(candidate);
            }
        }

        if let Some(registry) = &self.registry {
            let roots: Vec<PathBuf> = self.mapping.iter().map(|r| r.input.clone()).collect();
            registry.build_from_discovery(&roots);
        }

        let files = sort_files(
            files,
            &self.mapping,
            general.queue_sort,
            general.queue_seed,
            &self.config.normalized_extensions(),
        );
        stats.files_to_process = files.len();

        info!(
            "Discovery finished: found={}, to_process={}, already_compressed={}, \
             ignored_small={}, ignored_ext={}, ignored_err={}",
            stats.files_found,
            stats.files_to_process,
            stats.already_compressed,
            stats.ignored_small,
            stats.ignored_wrong_ext,
            stats.ignored_err
        );
        (files, stats)
    }

    fn publish_queue(&self, pending: &VecDeque<VideoFile>) {
        let preview: Vec<VideoFile> = pending.iter().take(QUEUE_PREVIEW_LEN).cloned().collect();
        self.bus.publish(Event::QueueUpdated {
            pending: preview,
            total: pending.len(),
        });
    }

    /// Drive one batch of discovered files to completion.
    async fn process_queue(&self, files: Vec<VideoFile>) {
        let mut pending: VecDeque<VideoFile> = files.into();
        let mut submitted: HashSet<PathBuf> = HashSet::new();
        let mut in_flight: JoinSet<JobReport> = JoinSet::new();
        let mut by_task: HashMap<tokio::task::Id, VideoFile> = HashMap::new();

        self.publish_queue(&pending);

        loop {
            // Replenish up to the prefetch window.
            let window =
                (self.config.general.prefetch_factor as usize) * (self.gate.max_threads() as usize);
            let paused = self.flags.paused.load(Ordering::Acquire);
            let mut queue_changed = false;
            while !paused
                && !self.gate.is_shutdown()
                && in_flight.len() < window
                && !pending.is_empty()
            {
                let file = pending.pop_front().expect("pending checked non-empty");
                if self.runner.cache.has_failed(&file.path) {
                    queue_changed = true;
                    continue;
                }
                let Some(root) = av1_batch_config::find_root_for(&self.mapping, &file.path) else {
                    warn!("No input root for {}; dropping", file.path.display());
                    queue_changed = true;
                    continue;
                };
                submitted.insert(file.path.clone());
                let handle = in_flight.spawn(run_gated(
                    self.runner.clone(),
                    self.gate.clone(),
                    file.clone(),
                    root.clone(),
                ));
                by_task.insert(handle.id(), file);
                queue_changed = true;
            }
            if queue_changed {
                self.publish_queue(&pending);
            }

            // Wait for one completion (bounded) or idle briefly.
            if in_flight.is_empty() {
                if pending.is_empty()
                    || self.gate.is_shutdown()
                    || self.flags.fatal.load(Ordering::Acquire)
                {
                    break;
                }
                tokio::time::sleep(IDLE_TICK).await;
            } else {
                match tokio::time::timeout(DRIVER_TICK, in_flight.join_next_with_id()).await {
                    Ok(Some(Ok((id, _report)))) => {
                        by_task.remove(&id);
                    }
                    Ok(Some(Err(join_error))) => {
                        // A panicked job must not take the run down.
                        let file = by_task.remove(&join_error.id());
                        error!(
                            "Job task failed for {:?}: {join_error}",
                            file.map(|f| f.file_name())
                        );
                    }
                    Ok(None) | Err(_) => {}
                }
            }

            // Refresh request: re-discover, append what is new, drop what
            // vanished.
            if self.flags.refresh.swap(false, Ordering::AcqRel) {
                self.refresh_pending(&mut pending, &submitted);
            }

            if self.flags.fatal.load(Ordering::Acquire) && in_flight.is_empty() {
                break;
            }
            if self.gate.is_shutdown() && in_flight.is_empty() {
                info!("Shutdown requested, queue frozen with {} entries", pending.len());
                break;
            }
        }
    }

    fn refresh_pending(&self, pending: &mut VecDeque<VideoFile>, submitted: &HashSet<PathBuf>) {
        let (new_files, stats) = self.discover();
        let discovered: HashSet<PathBuf> = new_files.iter().map(|f| f.path.clone()).collect();
        let pending_paths: HashSet<PathBuf> = pending.iter().map(|f| f.path.clone()).collect();

        // Entries whose files vanished from disk are dropped.
        let before = pending.len();
        pending.retain(|file| discovered.contains(&file.path));
        let removed = before - pending.len();

        // Newly discovered files that were never submitted are appended.
        let mut added = 0;
        for file in new_files {
            if submitted.contains(&file.path) || pending_paths.contains(&file.path) {
                continue;
            }
            pending.push_back(file);
            added += 1;
        }

        self.bus.publish(Event::RefreshFinished { added, removed });
        self.bus.publish(Event::DiscoveryFinished(stats));
        let message = match (added, removed) {
            (0, 0) => "Refreshed: no changes".to_string(),
            (added, 0) => format!("Refreshed: +{added} new files"),
            (0, removed) => format!("Refreshed: -{removed} removed"),
            (added, removed) => format!("Refreshed: +{added} new, -{removed} removed"),
        };
        info!("{message}");
        self.bus.publish(Event::ActionMessage { message });
        self.publish_queue(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MetadataCache;
    use crate::exif::MetadataAdapter;
    use crate::probe::ProbeAdapter;
    use crate::transcode::TranscoderAdapter;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn write_file(path: &std::path::Path, len: usize) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![0u8; len]).unwrap();
    }

    struct Fixture {
        _tmp: TempDir,
        orchestrator: Orchestrator,
        root: RootPaths,
        bus: Arc<EventBus>,
    }

    struct Tools {
        ffprobe: PathBuf,
        ffmpeg: PathBuf,
        exiftool: PathBuf,
    }

    impl Default for Tools {
        fn default() -> Self {
            Self {
                ffprobe: PathBuf::from("ffprobe"),
                ffmpeg: PathBuf::from("ffmpeg"),
                exiftool: PathBuf::from("exiftool"),
            }
        }
    }

    fn fixture(config: AppConfig) -> Fixture {
        fixture_with_tools(config, Tools::default())
    }

    fn fixture_with_tools(mut config: AppConfig, tools: Tools) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in");
        std::fs::create_dir_all(&input).unwrap();
        let root = RootPaths {
            output: tmp.path().join("in_out"),
            errors: tmp.path().join("in_err"),
            input,
        };

        config.general.extensions = vec![".mp4".into()];
        config.general.min_size_bytes = 10;
        let config = Arc::new(config);
        let bus = Arc::new(EventBus::new());
        let cancellation = CancellationToken::new();
        let runner = Arc::new(JobRunner {
            config: config.clone(),
            bus: bus.clone(),
            probe: Arc::new(ProbeAdapter::new(tools.ffprobe)),
            exif: Arc::new(MetadataAdapter::new(tools.exiftool, None)),
            transcoder: Arc::new(TranscoderAdapter::new(tools.ffmpeg.clone(), bus.clone())),
            cache: Arc::new(MetadataCache::new()),
            registry: None,
            cli_overrides: None,
            cancellation: cancellation.clone(),
            ffmpeg_bin: tools.ffmpeg,
        });
        let gate = WorkerGate::new(config.general.threads, 8);
        let orchestrator = Orchestrator::new(
            config,
            bus.clone(),
            runner,
            gate,
            vec![root.clone()],
            None,
            cancellation,
        );
        Fixture {
            _tmp: tmp,
            orchestrator,
            root,
            bus,
        }
    }

    #[test]
    fn discovery_filters_and_counts() {
        let fx = fixture(AppConfig::default());
        write_file(&fx.root.input.join("a.mp4"), 100);
        write_file(&fx.root.input.join("tiny.mp4"), 3);
        write_file(&fx.root.input.join("note.txt"), 100);

        let (files, stats) = fx.orchestrator.discover();
        assert_eq!(files.len(), 1);
        assert_eq!(stats.files_found, 1);
        assert_eq!(stats.files_to_process, 1);
        assert_eq!(stats.ignored_small, 1);
        assert_eq!(stats.ignored_wrong_ext, 1);
    }

    #[test]
    fn discovery_skips_already_compressed_by_mtime() {
        let fx = fixture(AppConfig::default());
        let source = fx.root.input.join("done.mp4");
        write_file(&source, 100);
        // Output written after the source: counted as already compressed.
        write_file(&fx.root.output.join("done.mp4"), 50);

        let (files, stats) = fx.orchestrator.discover();
        assert!(files.is_empty());
        assert_eq!(stats.already_compressed, 1);
    }

    #[test]
    fn discovery_respects_error_markers() {
        let fx = fixture(AppConfig::default());
        write_file(&fx.root.input.join("bad.mp4"), 100);
        write_file(&fx.root.output.join("bad.err"), 9);

        let (files, stats) = fx.orchestrator.discover();
        assert!(files.is_empty());
        assert_eq!(stats.ignored_err, 1);
    }

    #[test]
    fn clean_errors_reclaims_marked_files() {
        let mut config = AppConfig::default();
        config.general.clean_errors = true;
        let fx = fixture(config);
        write_file(&fx.root.input.join("bad.mp4"), 100);
        write_file(&fx.root.output.join("bad.err"), 9);

        let (files, stats) = fx.orchestrator.discover();
        assert_eq!(files.len(), 1);
        assert_eq!(stats.ignored_err, 0);
        assert!(!fx.root.output.join("bad.err").exists());
    }

    #[test]
    fn hw_cap_marker_retried_with_cpu_fallback() {
        let mut config = AppConfig::default();
        config.general.cpu_fallback = true;
        let fx = fixture(config);
        write_file(&fx.root.input.join("cap.mp4"), 100);
        std::fs::create_dir_all(&fx.root.output).unwrap();
        std::fs::write(fx.root.output.join("cap.err"), HW_CAP_MESSAGE).unwrap();

        let (files, stats) = fx.orchestrator.discover();
        assert_eq!(files.len(), 1, "hw-cap marker cleared for retry");
        assert_eq!(stats.ignored_err, 0);
        assert!(!fx.root.output.join("cap.err").exists());
    }

    #[test]
    fn thread_control_events_adjust_gate_and_announce() {
        let fx = fixture(AppConfig::default());
        let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        fx.bus.subscribe(EventKind::ActionMessage, move |event| {
            if let Event::ActionMessage { message } = event {
                sink.lock().unwrap().push(message.clone());
            }
        });

        fx.bus.publish(Event::ThreadControl { delta: 1 });
        assert_eq!(fx.orchestrator.gate().max_threads(), 2);
        fx.bus.publish(Event::ThreadControl { delta: -1 });
        fx.bus.publish(Event::ThreadControl { delta: -1 });
        assert_eq!(fx.orchestrator.gate().max_threads(), 1);

        let seen = messages.lock().unwrap();
        assert!(seen.iter().any(|m| m.contains("Threads: 1 → 2")));
        assert!(seen.iter().any(|m| m.contains("(min)")));
    }

    #[test]
    fn shutdown_event_toggles() {
        let fx = fixture(AppConfig::default());
        fx.bus.publish(Event::RequestShutdown);
        assert!(fx.orchestrator.gate().is_shutdown());
        fx.bus.publish(Event::RequestShutdown);
        assert!(!fx.orchestrator.gate().is_shutdown());
    }

    #[test]
    fn interrupt_event_cancels_and_forces_shutdown() {
        let fx = fixture(AppConfig::default());
        fx.bus.publish(Event::InterruptRequested);
        assert!(fx.orchestrator.gate().is_shutdown());
        assert!(fx.orchestrator.cancellation.is_cancelled());
        assert!(fx.orchestrator.flags.interrupted.load(Ordering::Acquire));
        // Not toggleable: a later shutdown press flips the gate but the
        // interrupt flag stays.
        fx.bus.publish(Event::RequestShutdown);
        assert!(fx.orchestrator.flags.interrupted.load(Ordering::Acquire));
    }

    // End-to-end scenarios below run the real pipeline against stub tool
    // binaries (shell scripts), so no ffmpeg/ffprobe/exiftool install is
    // needed.
    #[cfg(unix)]
    mod scenarios {
        use super::*;
        use crate::domain::JobStatus;
        use crate::events::CompletionOutcome;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::atomic::AtomicUsize;

        fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        const PROBE_JSON: &str = r#"{"streams":[{"codec_type":"video","codec_name":"h264","width":640,"height":360,"avg_frame_rate":"25/1"}],"format":{"duration":"1.0","bit_rate":"1000000"}}"#;

        /// ffprobe stub: fails for paths containing "bad", otherwise prints
        /// a fixed stream description.
        fn stub_ffprobe(dir: &std::path::Path) -> PathBuf {
            write_script(
                dir,
                "ffprobe",
                &format!(
                    "case \"$@\" in\n  *bad*) echo 'moov atom not found' >&2; exit 1;;\nesac\necho '{PROBE_JSON}'"
                ),
            )
        }

        /// ffmpeg stub: writes a tiny output to its last argument.
        fn stub_ffmpeg(dir: &std::path::Path) -> PathBuf {
            write_script(
                dir,
                "ffmpeg",
                "for last; do :; done\nprintf 'encoded' > \"$last\"",
            )
        }

        /// ffmpeg stub that blocks until its stdin sees one byte (the
        /// cooperative quit), leaving a partial output behind.
        fn stub_blocking_ffmpeg(dir: &std::path::Path) -> PathBuf {
            write_script(
                dir,
                "ffmpeg",
                "for last; do :; done\nprintf 'partial' > \"$last\"\nhead -c 1 >/dev/null\nexit 255",
            )
        }

        /// exiftool stub speaking just enough of the stay-open protocol:
        /// every -execute answers with an empty tag set.
        fn stub_exiftool(dir: &std::path::Path) -> PathBuf {
            write_script(
                dir,
                "exiftool",
                "while read line; do\n  if [ \"$line\" = \"-execute\" ]; then\n    echo '[{}]'\n    echo '{ready}'\n  fi\ndone",
            )
        }

        fn tools(dir: &std::path::Path, blocking_ffmpeg: bool) -> Tools {
            Tools {
                ffprobe: stub_ffprobe(dir),
                ffmpeg: if blocking_ffmpeg {
                    stub_blocking_ffmpeg(dir)
                } else {
                    stub_ffmpeg(dir)
                },
                exiftool: stub_exiftool(dir),
            }
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn full_run_completes_good_files_and_marks_corrupted() {
            let bin = TempDir::new().unwrap();
            let mut config = AppConfig::default();
            config.general.threads = 2;
            config.general.use_exif = false;
            config.general.copy_metadata = false;
            let fx = fixture_with_tools(config, tools(bin.path(), false));

            for name in ["a.mp4", "b.mp4", "c.mp4"] {
                write_file(&fx.root.input.join(name), 2048);
            }
            write_file(&fx.root.input.join("bad.mp4"), 2048);

            let completed = Arc::new(AtomicUsize::new(0));
            let failed = Arc::new(AtomicUsize::new(0));
            let sink = completed.clone();
            fx.bus.subscribe(EventKind::JobCompleted, move |event| {
                if let Event::JobCompleted { outcome, .. } = event {
                    assert_eq!(*outcome, CompletionOutcome::Compressed);
                    sink.fetch_add(1, Ordering::SeqCst);
                }
            });
            let sink = failed.clone();
            fx.bus.subscribe(EventKind::JobFailed, move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            });

            let summary = tokio::time::timeout(Duration::from_secs(30), fx.orchestrator.run())
                .await
                .expect("run must drain");
            assert_eq!(summary, RunSummary::default());

            assert_eq!(completed.load(Ordering::SeqCst), 3);
            assert_eq!(failed.load(Ordering::SeqCst), 1);

            for name in ["a.mp4", "b.mp4", "c.mp4"] {
                let output = fx.root.output.join(name);
                assert!(output.exists(), "output missing for {name}");
                // Completion keeps the output newer than its source.
                let out_mtime = std::fs::metadata(&output).unwrap().modified().unwrap();
                let src_mtime = std::fs::metadata(fx.root.input.join(name))
                    .unwrap()
                    .modified()
                    .unwrap();
                assert!(out_mtime >= src_mtime);
                assert!(!fx.root.output.join(name.replace(".mp4", ".err")).exists());
            }
            let marker = fx.root.output.join("bad.err");
            assert!(marker.exists(), "corrupted source needs a marker");
            assert!(std::fs::read_to_string(marker)
                .unwrap()
                .contains("corrupted"));
        }

        /// ffmpeg stub producing an output of a fixed byte length.
        fn stub_sized_ffmpeg(dir: &std::path::Path, bytes: usize) -> PathBuf {
            write_script(
                dir,
                "ffmpeg",
                &format!("for last; do :; done\nhead -c {bytes} /dev/zero > \"$last\""),
            )
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn savings_below_threshold_keep_the_original() {
            let bin = TempDir::new().unwrap();
            let mut config = AppConfig::default();
            config.general.use_exif = false;
            config.general.copy_metadata = false;
            let mut tools = tools(bin.path(), false);
            // 2000 of 2048 bytes: ~2% savings against the 10% threshold.
            tools.ffmpeg = stub_sized_ffmpeg(bin.path(), 2000);
            let fx = fixture_with_tools(config, tools);

            let source = fx.root.input.join("barely.mp4");
            write_file(&source, 2048);

            let kept = Arc::new(AtomicUsize::new(0));
            let sink = kept.clone();
            fx.bus.subscribe(EventKind::JobCompleted, move |event| {
                if let Event::JobCompleted { outcome, .. } = event {
                    assert_eq!(*outcome, CompletionOutcome::KeptOriginal);
                    sink.fetch_add(1, Ordering::SeqCst);
                }
            });

            tokio::time::timeout(Duration::from_secs(30), fx.orchestrator.run())
                .await
                .expect("run must drain");

            assert_eq!(kept.load(Ordering::SeqCst), 1);
            let output = fx.root.output.join("barely.mp4");
            assert_eq!(
                std::fs::read(&output).unwrap(),
                std::fs::read(&source).unwrap(),
                "output must be a byte copy of the original"
            );
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn savings_exactly_at_threshold_keep_the_compressed_output() {
            let bin = TempDir::new().unwrap();
            let mut config = AppConfig::default();
            config.general.use_exif = false;
            config.general.copy_metadata = false;
            let mut tools = tools(bin.path(), false);
            // 1800 of 2000 bytes is exactly the 10% threshold: not below,
            // so the compressed output stays.
            tools.ffmpeg = stub_sized_ffmpeg(bin.path(), 1800);
            let fx = fixture_with_tools(config, tools);
            write_file(&fx.root.input.join("edge.mp4"), 2000);

            let compressed = Arc::new(AtomicUsize::new(0));
            let sink = compressed.clone();
            fx.bus.subscribe(EventKind::JobCompleted, move |event| {
                if let Event::JobCompleted { outcome, .. } = event {
                    assert_eq!(*outcome, CompletionOutcome::Compressed);
                    sink.fetch_add(1, Ordering::SeqCst);
                }
            });

            tokio::time::timeout(Duration::from_secs(30), fx.orchestrator.run())
                .await
                .expect("run must drain");

            assert_eq!(compressed.load(Ordering::SeqCst), 1);
            let output_len = std::fs::metadata(fx.root.output.join("edge.mp4"))
                .unwrap()
                .len();
            assert_eq!(output_len, 1800);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn rerun_on_unchanged_tree_transcodes_nothing() {
            let bin = TempDir::new().unwrap();
            let mut config = AppConfig::default();
            config.general.use_exif = false;
            config.general.copy_metadata = false;
            let fx = fixture_with_tools(config, tools(bin.path(), false));
            write_file(&fx.root.input.join("once.mp4"), 2048);

            tokio::time::timeout(Duration::from_secs(30), fx.orchestrator.run())
                .await
                .expect("first run drains");

            let (files, stats) = fx.orchestrator.discover();
            assert!(files.is_empty(), "second pass must find nothing to do");
            assert_eq!(stats.already_compressed, 1);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn immediate_interrupt_stops_jobs_and_cleans_partials() {
            let bin = TempDir::new().unwrap();
            let mut config = AppConfig::default();
            config.general.threads = 2;
            config.general.use_exif = false;
            config.general.copy_metadata = false;
            let fx = fixture_with_tools(config, tools(bin.path(), true));

            write_file(&fx.root.input.join("long1.mp4"), 2048);
            write_file(&fx.root.input.join("long2.mp4"), 2048);

            let interrupted = Arc::new(AtomicUsize::new(0));
            let sink = interrupted.clone();
            fx.bus.subscribe(EventKind::JobFailed, move |event| {
                if let Event::JobFailed { job, .. } = event {
                    if job.status == JobStatus::Interrupted {
                        sink.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });

            let orchestrator = Arc::new(fx.orchestrator);
            let driver = orchestrator.clone();
            let run = tokio::spawn(async move { driver.run().await });

            tokio::time::sleep(Duration::from_millis(500)).await;
            fx.bus.publish(Event::InterruptRequested);

            let summary = tokio::time::timeout(Duration::from_secs(15), run)
                .await
                .expect("interrupt must terminate the run")
                .unwrap();
            assert!(summary.interrupted);
            assert_eq!(interrupted.load(Ordering::SeqCst), 2);

            // No partial outputs survive, and no markers were written.
            for entry in std::fs::read_dir(&fx.root.output).into_iter().flatten() {
                let path = entry.unwrap().path();
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                assert!(ext != "tmp", "partial output left behind: {path:?}");
                assert!(ext != "err", "interrupt must not write markers: {path:?}");
            }
        }
    }
}
