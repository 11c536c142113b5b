//! CLI entry point: argument parsing, configuration assembly, component
//! wiring, and exit codes (0 success, 1 configuration or fatal error,
//! 130 interrupt).

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use av1_batch_config::{
    dedupe_preserve_order, load_config, load_demo_config, parse_cli_input_dirs,
    resolve_root_mapping, AppConfig, CliOverrides, LocalConfigRegistry, QualityMode, QueueSort,
    VerifyFailAction,
};
use av1_batch_pipeline::{
    move_failed_files, pre_run_sweep, DemoOrchestrator, EventBus, JobRunner, MetadataAdapter,
    MetadataCache, MoveOutcome, Orchestrator, ProbeAdapter, RunSummary, TranscoderAdapter,
    WorkerGate,
};
use av1_batch_tui::{run_dashboard, KeyboardController, UiManager, UiState};

/// Keyboard thread-control clamp; the worker pool itself is larger.
const RUNTIME_MAX_THREADS: u32 = 8;

/// Hard ceiling on pool size regardless of configuration.
const POOL_MAX_THREADS: u32 = 16;

const EXIT_INTERRUPT: u8 = 130;

/// Batch AV1 transcoding with submit-on-demand scheduling and a live
/// terminal dashboard.
#[derive(Parser, Debug)]
#[command(name = "av1-batch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Comma-separated input directories (overrides the config list).
    input_dirs: Option<String>,

    /// Path to the global YAML configuration.
    #[arg(short, long, default_value = "conf/av1batch.yaml")]
    config: PathBuf,

    /// Starting worker-thread cap.
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    threads: Option<u32>,

    /// Baseline quality index (cq mode only).
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=63))]
    quality: Option<u8>,

    /// Quality mode: cq or rate.
    #[arg(long)]
    quality_mode: Option<String>,

    /// Rate-mode target (absolute like 24M, or a source multiplier).
    #[arg(long)]
    bps: Option<String>,

    /// Rate-mode minimum (same class as --bps).
    #[arg(long)]
    minrate: Option<String>,

    /// Rate-mode maximum (same class as --bps).
    #[arg(long)]
    maxrate: Option<String>,

    /// Use the GPU encoder.
    #[arg(long, overrides_with = "cpu")]
    gpu: bool,

    /// Use the CPU encoder.
    #[arg(long)]
    cpu: bool,

    /// Queue ordering: name, rand, dir, size, size-asc, size-desc, ext.
    #[arg(long)]
    queue_sort: Option<String>,

    /// Seed for the rand queue ordering.
    #[arg(long)]
    queue_seed: Option<u64>,

    /// Skip files already encoded in the target codec.
    #[arg(long)]
    skip_av1: bool,

    /// Only process these camera patterns (comma-separated).
    #[arg(long)]
    camera: Option<String>,

    /// Minimum input size in bytes.
    #[arg(long)]
    min_size: Option<u64>,

    /// Minimum savings fraction in [0, 1].
    #[arg(long)]
    min_ratio: Option<f64>,

    /// Force 180-degree rotation for every file.
    #[arg(long)]
    rotate_180: bool,

    /// Remove stale error markers before the run and retry those files.
    #[arg(long)]
    clean_errors: bool,

    /// Log file destination.
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Verbose debug logging.
    #[arg(long, overrides_with = "no_debug")]
    debug: bool,

    #[arg(long)]
    no_debug: bool,

    /// Synthetic run without file I/O.
    #[arg(long)]
    demo: bool,

    /// Path to the demo YAML configuration.
    #[arg(long, default_value = "conf/demo.yaml")]
    demo_config: PathBuf,

    /// Action on failed output verification: false, log, pause, exit.
    #[arg(long)]
    verify_fail_action: Option<String>,

    /// Keep the dashboard open after processing finishes.
    #[arg(long, overrides_with = "no_wait")]
    wait: bool,

    #[arg(long)]
    no_wait: bool,

    /// Ring the terminal bell when the run completes.
    #[arg(long, overrides_with = "no_bell")]
    bell: bool,

    #[arg(long)]
    no_bell: bool,
}

impl Args {
    fn overrides(&self) -> Result<CliOverrides> {
        let quality_mode = self
            .quality_mode
            .as_deref()
            .map(|raw| raw.parse::<QualityMode>().map_err(|e| anyhow!(e)))
            .transpose()?;
        let queue_sort = self
            .queue_sort
            .as_deref()
            .map(|raw| raw.parse::<QueueSort>().map_err(|e| anyhow!(e)))
            .transpose()?;
        let verify_fail_action = self
            .verify_fail_action
            .as_deref()
            .map(|raw| raw.parse::<VerifyFailAction>().map_err(|e| anyhow!(e)))
            .transpose()?;

        if let Some(ratio) = self.min_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(anyhow!("--min-ratio must be within [0, 1] (got {ratio})"));
            }
        }

        let gpu = match (self.gpu, self.cpu) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        let debug = match (self.debug, self.no_debug) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        let wait_on_finish = match (self.wait, self.no_wait) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        let bell = match (self.bell, self.no_bell) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };

        Ok(CliOverrides {
            threads: self.threads,
            quality: self.quality,
            quality_mode,
            bps: self.bps.clone(),
            minrate: self.minrate.clone(),
            maxrate: self.maxrate.clone(),
            gpu,
            queue_sort,
            queue_seed: self.queue_seed,
            log_path: self.log_path.clone(),
            clean_errors: self.clean_errors,
            skip_av1: self.skip_av1,
            min_size: self.min_size,
            min_ratio: self.min_ratio,
            camera: self.camera.as_deref().map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
            rotate_180: self.rotate_180,
            verify_fail_action,
            wait_on_finish,
            bell,
            debug,
        })
    }
}

fn init_logging(config: &AppConfig) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(log_path) = &config.general.log_path else {
        return Ok(None);
    };
    let directory = log_path.parent().unwrap_or(std::path::Path::new("."));
    std::fs::create_dir_all(directory)
        .with_context(|| format!("cannot create log directory {}", directory.display()))?;
    let file_name = log_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "av1-batch.log".to_string());

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let level = if config.general.debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

fn config_summary_lines(config: &AppConfig, roots: &[String], demo: bool) -> Vec<String> {
    let general = &config.general;
    let encoder = if general.gpu {
        "NVENC AV1 (GPU)"
    } else {
        "SVT-AV1 (CPU)"
    };
    let camera_filter = if general.filter_cameras.is_empty() {
        "None".to_string()
    } else {
        general.filter_cameras.join(", ")
    };
    let overrides = if general.dynamic_quality.is_empty() {
        "None".to_string()
    } else {
        general
            .dynamic_quality
            .iter()
            .map(|(pattern, rule)| format!("{pattern}:{}", rule.cq))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let rotation = general
        .manual_rotation
        .map(|angle| format!("{angle}°"))
        .unwrap_or_else(|| "auto".to_string());

    let mut lines = vec![
        format!(
            "Batch transcoding - {encoder}{}",
            if demo { " - demo" } else { "" }
        ),
        format!("Input folders: {}", roots.len()),
    ];
    lines.extend(roots.iter().enumerate().map(|(i, r)| format!("  {}. {r}", i + 1)));
    lines.push(format!(
        "Threads: {} (prefetch {}x) | Queue: {}",
        general.threads,
        general.prefetch_factor,
        general.queue_sort.as_str()
    ));
    lines.push(format!("Camera overrides: {overrides}"));
    lines.push(format!("Camera filter: {camera_filter}"));
    lines.push(format!(
        "Rotation: {rotation} | Autorotate rules: {}",
        config.autorotate.patterns.len()
    ));
    lines.push(format!(
        "Min size: {} | Min ratio: {:.2} | Skip AV1: {}",
        general.min_size_bytes, general.min_compression_ratio, general.skip_av1
    ));
    lines.push(format!(
        "Clean errors: {} | CPU fallback: {} | Debug: {}",
        general.clean_errors, general.cpu_fallback, general.debug
    ));
    lines
}

async fn run(args: Args) -> Result<u8> {
    let mut config = load_config(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    let overrides = args.overrides()?;
    overrides.apply(&mut config);
    config.validate().map_err(|e| anyhow!(e))?;
    let config = Arc::new(config);

    let _log_guard = init_logging(&config)?;

    // Input roots: the CLI list replaces the config list wholesale.
    let cli_roots = parse_cli_input_dirs(args.input_dirs.as_deref());
    let root_entries = if cli_roots.is_empty() {
        config.input_dirs.clone()
    } else {
        dedupe_preserve_order(cli_roots)
    };

    let bus = Arc::new(EventBus::new());
    let ui_state = Arc::new(UiState::new(
        config.ui.activity_feed_max_items,
        config.general.threads.min(RUNTIME_MAX_THREADS),
        RUNTIME_MAX_THREADS,
    ));
    UiManager::attach(&bus, ui_state.clone());

    let pool_cap = POOL_MAX_THREADS.min((num_cpus::get() as u32).max(1));
    let gate = WorkerGate::new(config.general.threads.min(pool_cap), RUNTIME_MAX_THREADS);
    let cancellation = CancellationToken::new();

    // Keep the displayed thread count in step with keyboard adjustments.
    // Registered after the orchestrator wires its own handler, so the gate
    // has already been adjusted when this one reads it.
    let attach_thread_sync = {
        let ui_state = ui_state.clone();
        let gate = gate.clone();
        let bus = bus.clone();
        move || {
            bus.subscribe(av1_batch_pipeline::EventKind::ThreadControl, move |_| {
                ui_state.set_threads(gate.max_threads());
            });
        }
    };

    let summary = if args.demo {
        let demo_config = load_demo_config(&args.demo_config)?;
        ui_state.set_title("av1-batch - demo");
        ui_state.set_config_lines(config_summary_lines(
            &config,
            &demo_config.input_folders,
            true,
        ));

        let demo = DemoOrchestrator::new(demo_config, bus.clone(), gate.clone(), cancellation.clone());
        attach_thread_sync();
        let demo_cancel = cancellation.clone();
        run_with_ui(ui_state.clone(), bus.clone(), || async move {
            demo.run().await;
            RunSummary {
                interrupted: demo_cancel.is_cancelled(),
                fatal: false,
            }
        })
        .await?
    } else {
        let mapping = resolve_root_mapping(&root_entries, &config).map_err(|e| anyhow!(e))?;
        ui_state.set_config_lines(config_summary_lines(&config, &root_entries, false));

        info!(
            "Run started: {} roots, threads={}, gpu={}",
            mapping.len(),
            config.general.threads,
            config.general.gpu
        );

        // Pre-run housekeeping: stale partials under both trees, markers
        // under the output roots.
        for root in &mapping {
            av1_batch_pipeline::housekeeping::cleanup_tmp_files(&root.input);
            pre_run_sweep(&root.output, config.general.clean_errors);
        }

        let registry = Arc::new(LocalConfigRegistry::new());
        let cache = Arc::new(MetadataCache::new());
        let probe = Arc::new(ProbeAdapter::default());
        let exif = Arc::new(MetadataAdapter::new(PathBuf::from("exiftool"), None));
        let transcoder = Arc::new(TranscoderAdapter::new(PathBuf::from("ffmpeg"), bus.clone()));

        let runner = Arc::new(JobRunner {
            config: config.clone(),
            bus: bus.clone(),
            probe,
            exif: exif.clone(),
            transcoder,
            cache,
            registry: Some(registry.clone()),
            cli_overrides: Some(Arc::new(overrides)),
            cancellation: cancellation.clone(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
        });

        let orchestrator = Orchestrator::new(
            config.clone(),
            bus.clone(),
            runner,
            gate.clone(),
            mapping.clone(),
            Some(registry),
            cancellation.clone(),
        );
        attach_thread_sync();

        let summary = run_with_ui(ui_state.clone(), bus.clone(), || async move {
            orchestrator.run().await
        })
        .await?;

        exif.shutdown().await;

        // Post-run relocation of failures. Non-interactive policy for the
        // over-threshold case: warn and skip.
        match move_failed_files(&mapping, &config.normalized_extensions(), false, Some(&bus)) {
            MoveOutcome::Moved { markers, .. } if markers > 0 => {
                info!("Relocated {markers} failed files");
            }
            MoveOutcome::NeedsConfirmation { markers } => {
                info!("Left {markers} error markers in place (confirmation required)");
            }
            _ => {}
        }
        summary
    };

    bus.shutdown();
    if config.general.bell {
        print!("\x07");
    }

    if summary.interrupted {
        info!("Run interrupted by user");
        Ok(EXIT_INTERRUPT)
    } else if summary.fatal {
        Ok(1)
    } else {
        Ok(0)
    }
}

/// Run a pipeline future with the dashboard and keyboard attached.
async fn run_with_ui<F, Fut>(
    ui_state: Arc<UiState>,
    bus: Arc<EventBus>,
    pipeline: F,
) -> Result<RunSummary>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = RunSummary>,
{
    let stop = Arc::new(AtomicBool::new(false));
    let dashboard_stop = stop.clone();
    let dashboard_state = ui_state.clone();
    let dashboard = std::thread::Builder::new()
        .name("dashboard".to_string())
        .spawn(move || run_dashboard(dashboard_state, dashboard_stop))
        .context("spawn dashboard thread")?;

    let keyboard = KeyboardController::start(bus);

    let summary = pipeline().await;

    keyboard.stop();
    stop.store(true, Ordering::Release);
    match dashboard.join() {
        Ok(result) => result.context("dashboard rendering failed")?,
        Err(_) => return Err(anyhow!("dashboard thread panicked")),
    }

    Ok(summary)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Fatal error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_threads_is_rejected_at_parse() {
        let result = Args::try_parse_from(["av1-batch", "--threads", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn out_of_range_quality_rejected() {
        let result = Args::try_parse_from(["av1-batch", "--quality", "64"]);
        assert!(result.is_err());
        assert!(Args::try_parse_from(["av1-batch", "--quality", "63"]).is_ok());
    }

    #[test]
    fn gpu_cpu_flags_resolve_to_override() {
        let args = Args::try_parse_from(["av1-batch", "--cpu"]).unwrap();
        assert_eq!(args.overrides().unwrap().gpu, Some(false));

        let args = Args::try_parse_from(["av1-batch", "--gpu"]).unwrap();
        assert_eq!(args.overrides().unwrap().gpu, Some(true));

        let args = Args::try_parse_from(["av1-batch"]).unwrap();
        assert_eq!(args.overrides().unwrap().gpu, None);
    }

    #[test]
    fn camera_list_is_split_and_trimmed() {
        let args = Args::try_parse_from(["av1-batch", "--camera", "DJI, ILCE-7RM5 ,,"]).unwrap();
        let overrides = args.overrides().unwrap();
        assert_eq!(
            overrides.camera,
            Some(vec!["DJI".to_string(), "ILCE-7RM5".to_string()])
        );
    }

    #[test]
    fn bad_min_ratio_rejected() {
        let args = Args::try_parse_from(["av1-batch", "--min-ratio", "1.5"]).unwrap();
        assert!(args.overrides().is_err());
    }

    #[test]
    fn verify_fail_action_parses_known_values() {
        for (raw, expected) in [
            ("false", VerifyFailAction::Off),
            ("log", VerifyFailAction::Log),
            ("pause", VerifyFailAction::Pause),
            ("exit", VerifyFailAction::Exit),
        ] {
            let args =
                Args::try_parse_from(["av1-batch", "--verify-fail-action", raw]).unwrap();
            assert_eq!(args.overrides().unwrap().verify_fail_action, Some(expected));
        }
        let args = Args::try_parse_from(["av1-batch", "--verify-fail-action", "maybe"]).unwrap();
        assert!(args.overrides().is_err());
    }

    #[test]
    fn positional_roots_parse_as_comma_list() {
        let args = Args::try_parse_from(["av1-batch", "/a,/b"]).unwrap();
        assert_eq!(args.input_dirs.as_deref(), Some("/a,/b"));
    }
}
