//! Synthetic run for `--demo`: fabricates a seeded population of files and
//! drives the event bus exactly like a real run, with no file I/O.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use av1_batch_config::{ConfigSource, DemoConfig};

use crate::bus::EventBus;
use crate::domain::{CompressionJob, JobStatus, VideoFile, VideoMetadata};
use crate::events::{CompletionOutcome, DiscoveryStats, Event, EventKind};
use crate::gate::WorkerGate;
use crate::transcode::HW_CAP_MESSAGE;

const WORDS: &[&str] = &[
    "sunset", "harbor", "rehearsal", "interview", "drone", "timelapse", "backstage", "crowd",
    "skyline", "workshop", "parade", "studio", "rooftop", "market", "finale",
];

/// Outcome assigned to one synthetic job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemoOutcome {
    Complete,
    Failed,
    HwCap,
    KeptOriginal,
}

#[derive(Debug, Clone)]
struct DemoJob {
    file: VideoFile,
    outcome: DemoOutcome,
}

/// Event-compatible synthetic orchestrator.
pub struct DemoOrchestrator {
    demo: DemoConfig,
    bus: Arc<EventBus>,
    gate: Arc<WorkerGate>,
    cancellation: CancellationToken,
}

impl DemoOrchestrator {
    pub fn new(
        demo: DemoConfig,
        bus: Arc<EventBus>,
        gate: Arc<WorkerGate>,
        cancellation: CancellationToken,
    ) -> Self {
        let orchestrator = Self {
            demo,
            bus,
            gate,
            cancellation,
        };
        orchestrator.subscribe_controls();
        orchestrator
    }

    fn subscribe_controls(&self) {
        let gate = self.gate.clone();
        let bus = self.bus.clone();
        self.bus.subscribe(EventKind::ThreadControl, move |event| {
            let Event::ThreadControl { delta } = event else { return };
            if gate.is_shutdown() {
                return;
            }
            let adjust = gate.adjust_max(*delta);
            bus.publish(Event::ActionMessage {
                message: format!("Threads: {} → {}", adjust.old, adjust.new),
            });
        });

        let gate = self.gate.clone();
        self.bus
            .subscribe(EventKind::RequestShutdown, move |_| {
                gate.toggle_shutdown();
            });

        let gate = self.gate.clone();
        let cancellation = self.cancellation.clone();
        self.bus.subscribe(EventKind::InterruptRequested, move |_| {
            gate.force_shutdown();
            cancellation.cancel();
        });
    }

    fn build_population(&self, rng: &mut StdRng) -> Vec<DemoJob> {
        let folders: Vec<PathBuf> = if self.demo.input_folders.is_empty() {
            vec![PathBuf::from("DEMO")]
        } else {
            self.demo.input_folders.iter().map(PathBuf::from).collect()
        };

        let mut jobs = Vec::with_capacity(self.demo.file_count);
        for index in 0..self.demo.file_count {
            let words: Vec<&str> = (0..rng.gen_range(1..=3))
                .map(|_| *WORDS.choose(rng).expect("word list is non-empty"))
                .collect();
            let ext = self
                .demo
                .extensions
                .choose(rng)
                .cloned()
                .unwrap_or_else(|| ".mp4".to_string());
            let folder = folders.choose(rng).expect("folders non-empty");
            let name = format!("{}-{index:03}{ext}", words.join("-"));

            let size_mb = rng.gen_range(self.demo.min_mb..=self.demo.max_mb);
            let size_bytes = (size_mb * 1024.0 * 1024.0) as u64;
            let camera = self.demo.camera_models.choose(rng).cloned();

            let mut file = VideoFile::new(folder.join(name), size_bytes);
            file.metadata = Some(Arc::new(VideoMetadata {
                codec: "h264".into(),
                camera_model: camera.clone(),
                camera_raw: camera,
                duration_secs: size_mb / 8.0,
                fps: 29.97,
                ..Default::default()
            }));
            jobs.push(DemoJob {
                file,
                outcome: DemoOutcome::Complete,
            });
        }

        // Assign the configured failure mix to a shuffled prefix.
        let mut order: Vec<usize> = (0..jobs.len()).collect();
        order.shuffle(rng);
        let mut cursor = order.into_iter();
        for _ in 0..self.demo.errors.min(jobs.len()) {
            if let Some(i) = cursor.next() {
                jobs[i].outcome = DemoOutcome::Failed;
            }
        }
        for _ in 0..self.demo.hw_cap {
            if let Some(i) = cursor.next() {
                jobs[i].outcome = DemoOutcome::HwCap;
            }
        }
        for _ in 0..self.demo.kept_original {
            if let Some(i) = cursor.next() {
                jobs[i].outcome = DemoOutcome::KeptOriginal;
            }
        }
        jobs
    }

    /// Run the synthetic population to completion.
    pub async fn run(&self) {
        let seed = self.demo.seed.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });
        let mut rng = StdRng::seed_from_u64(seed);
        let jobs = self.build_population(&mut rng);

        for folder in &self.demo.input_folders {
            self.bus.publish(Event::DiscoveryStarted {
                directory: PathBuf::from(folder),
            });
        }
        self.bus.publish(Event::DiscoveryFinished(DiscoveryStats {
            files_found: jobs.len(),
            files_to_process: jobs.len(),
            source_folders: self.demo.input_folders.len().max(1),
            ..Default::default()
        }));
        self.bus.publish(Event::QueueUpdated {
            pending: jobs.iter().take(50).map(|j| j.file.clone()).collect(),
            total: jobs.len(),
        });

        info!("Demo run: {} synthetic files (seed {seed})", jobs.len());

        let mut pending: std::collections::VecDeque<(DemoJob, u64)> = jobs
            .into_iter()
            .map(|job| {
                let jitter: f64 = rng.gen_range(0.75..1.25);
                let duration_ms = (job.file.size_bytes as f64 / (1024.0 * 1024.0)
                    / self.demo.throughput_mb_s
                    * jitter
                    * 1000.0) as u64;
                (job, duration_ms.max(50))
            })
            .collect();
        let ratio_range = (self.demo.output_ratio_min, self.demo.output_ratio_max);

        let mut in_flight: JoinSet<()> = JoinSet::new();
        loop {
            while !self.gate.is_shutdown()
                && in_flight.len() < self.gate.max_threads() as usize
                && !pending.is_empty()
            {
                let (job, duration_ms) = pending.pop_front().expect("checked non-empty");
                let ratio = rng.gen_range(ratio_range.0..=ratio_range.1);
                in_flight.spawn(simulate_job(
                    job,
                    duration_ms,
                    ratio,
                    self.demo.progress_interval_s,
                    self.bus.clone(),
                    self.gate.clone(),
                    self.cancellation.clone(),
                ));
                self.bus.publish(Event::QueueUpdated {
                    pending: pending.iter().take(50).map(|(j, _)| j.file.clone()).collect(),
                    total: pending.len(),
                });
            }

            if in_flight.is_empty() {
                if pending.is_empty() || self.gate.is_shutdown() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            } else {
                let _ = tokio::time::timeout(Duration::from_secs(1), in_flight.join_next()).await;
            }
        }

        if !self.gate.is_shutdown() {
            self.bus.publish(Event::ProcessingFinished);
        }
    }
}

async fn simulate_job(
    job: DemoJob,
    duration_ms: u64,
    output_ratio: f64,
    progress_interval_s: f64,
    bus: Arc<EventBus>,
    gate: Arc<WorkerGate>,
    cancellation: CancellationToken,
) {
    let Some(_slot) = gate.acquire().await else {
        return;
    };

    let output_path = PathBuf::from("DEMO_out").join(job.file.file_name());
    let mut compression = CompressionJob::new(job.file.clone(), output_path);
    compression.quality_display = "CQ45".to_string();
    compression.config_source = ConfigSource::Global;
    compression.status = JobStatus::Processing;

    bus.publish(Event::JobStarted {
        job: compression.clone(),
    });

    let interval = Duration::from_secs_f64(progress_interval_s.max(0.05));
    let total = Duration::from_millis(duration_ms);
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        let step = interval.min(total - elapsed);
        tokio::select! {
            _ = tokio::time::sleep(step) => {}
            _ = cancellation.cancelled() => {
                compression.status = JobStatus::Interrupted;
                compression.error_message = Some("Interrupted by user".to_string());
                bus.publish(Event::JobFailed {
                    job: compression.clone(),
                    message: "Interrupted by user".to_string(),
                });
                return;
            }
        }
        elapsed += step;
        let percent = (elapsed.as_secs_f64() / total.as_secs_f64() * 100.0).min(100.0);
        bus.publish(Event::JobProgress {
            job: compression.clone(),
            percent,
        });
    }

    match job.outcome {
        DemoOutcome::Complete => {
            compression.status = JobStatus::Completed;
            compression.output_size_bytes =
                Some((job.file.size_bytes as f64 * output_ratio) as u64);
            bus.publish(Event::JobCompleted {
                job: compression,
                outcome: CompletionOutcome::Compressed,
            });
        }
        DemoOutcome::KeptOriginal => {
            compression.status = JobStatus::KeptOriginal;
            compression.output_size_bytes = Some(job.file.size_bytes);
            bus.publish(Event::JobCompleted {
                job: compression,
                outcome: CompletionOutcome::KeptOriginal,
            });
        }
        DemoOutcome::Failed => {
            compression.status = JobStatus::Failed;
            let message = "ffmpeg exited with code 1".to_string();
            compression.error_message = Some(message.clone());
            bus.publish(Event::JobFailed {
                job: compression,
                message,
            });
        }
        DemoOutcome::HwCap => {
            compression.status = JobStatus::HwCapExceeded;
            compression.error_message = Some(HW_CAP_MESSAGE.to_string());
            bus.publish(Event::HardwareCapabilityExceeded { job: compression });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn demo_config() -> DemoConfig {
        let mut demo = DemoConfig::default();
        demo.seed = Some(7);
        demo.file_count = 12;
        demo.errors = 2;
        demo.hw_cap = 1;
        demo.kept_original = 1;
        demo.min_mb = 1.0;
        demo.max_mb = 2.0;
        demo.throughput_mb_s = 2000.0; // near-instant jobs for tests
        demo.progress_interval_s = 0.05;
        demo
    }

    #[tokio::test]
    async fn demo_run_publishes_expected_outcome_mix() {
        let bus = Arc::new(EventBus::new());
        let completed = Arc::new(AtomicUsize::new(0));
        let kept = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let hw_cap = Arc::new(AtomicUsize::new(0));

        let sink = completed.clone();
        let kept_sink = kept.clone();
        bus.subscribe(EventKind::JobCompleted, move |event| {
            if let Event::JobCompleted { outcome, .. } = event {
                match outcome {
                    CompletionOutcome::KeptOriginal => {
                        kept_sink.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {
                        sink.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });
        let sink = failed.clone();
        bus.subscribe(EventKind::JobFailed, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        let sink = hw_cap.clone();
        bus.subscribe(EventKind::HardwareCapabilityExceeded, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        let gate = WorkerGate::new(4, 8);
        let demo = DemoOrchestrator::new(demo_config(), bus, gate, CancellationToken::new());
        demo.run().await;

        assert_eq!(completed.load(Ordering::SeqCst), 8);
        assert_eq!(kept.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 2);
        assert_eq!(hw_cap.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn demo_population_is_seed_stable() {
        let bus = Arc::new(EventBus::new());
        let names: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = names.clone();
        bus.subscribe(EventKind::QueueUpdated, move |event| {
            if let Event::QueueUpdated { pending, .. } = event {
                let mut guard = sink.lock().unwrap();
                if guard.is_empty() {
                    guard.extend(pending.iter().map(|f| f.file_name()));
                }
            }
        });

        let gate = WorkerGate::new(4, 8);
        let demo = DemoOrchestrator::new(
            demo_config(),
            bus.clone(),
            gate,
            CancellationToken::new(),
        );
        let mut rng = StdRng::seed_from_u64(7);
        let population_a = demo.build_population(&mut rng);
        let mut rng = StdRng::seed_from_u64(7);
        let population_b = demo.build_population(&mut rng);

        let names_a: Vec<String> = population_a.iter().map(|j| j.file.file_name()).collect();
        let names_b: Vec<String> = population_b.iter().map(|j| j.file.file_name()).collect();
        assert_eq!(names_a, names_b, "same seed yields the same population");
    }

    #[tokio::test]
    async fn interrupt_ends_demo_jobs_as_interrupted() {
        let bus = Arc::new(EventBus::new());
        let interrupted = Arc::new(AtomicUsize::new(0));
        let sink = interrupted.clone();
        bus.subscribe(EventKind::JobFailed, move |event| {
            if let Event::JobFailed { job, .. } = event {
                if job.status == JobStatus::Interrupted {
                    sink.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        let mut config = demo_config();
        config.file_count = 4;
        config.errors = 0;
        config.hw_cap = 0;
        config.kept_original = 0;
        config.throughput_mb_s = 0.05; // long jobs so the interrupt lands first

        let gate = WorkerGate::new(4, 8);
        let cancellation = CancellationToken::new();
        let demo = Arc::new(DemoOrchestrator::new(
            config,
            bus.clone(),
            gate,
            cancellation,
        ));

        let runner = demo.clone();
        let run = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        bus.publish(Event::InterruptRequested);
        tokio::time::timeout(Duration::from_secs(15), run)
            .await
            .expect("demo run must stop after interrupt")
            .unwrap();

        assert_eq!(interrupted.load(Ordering::SeqCst), 4);
    }
}
