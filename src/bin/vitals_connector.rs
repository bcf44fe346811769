//! vitals_connector - camera-to-dashboard vitals pipeline
//!
//! This binary:
//! 1. Loads and validates configuration (file, then environment overrides)
//! 2. Starts one sampling loop per enabled camera, each on its own thread
//! 3. Submits readings over HTTP or MQTT until Ctrl-C or the tick limit
//! 4. Exits non-zero if any loop stopped under the fail-fast policy

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use vitals_connector::{
    build_extractor, open_source, ConnectorConfig, HttpSubmitter, MqttPublisher, RunSummary,
    SamplingLoop, SinkKind, StopReason, TemporalSmoother, VitalsSimulator, VitalsSink,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Sample bedside monitor cameras and submit neonatal vitals"
)]
struct Args {
    /// Config file (.toml or .json).
    #[arg(long, env = "VITALS_CONFIG")]
    config: Option<PathBuf>,

    /// Stop each camera loop after this many ticks.
    #[arg(long)]
    ticks: Option<u64>,

    /// Validate configuration, print a summary and exit.
    #[arg(long)]
    check_config: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = ConnectorConfig::load_from(args.config.as_deref())?;
    if args.check_config {
        print_summary(&cfg);
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .expect("error setting Ctrl-C handler");
    }

    let publisher = match cfg.sink {
        SinkKind::Mqtt => Some(MqttPublisher::connect(&cfg.mqtt)?),
        SinkKind::Http => None,
    };

    let mut loops = Vec::new();
    for camera in cfg.enabled_cameras() {
        let source = open_source(&camera.url, &cfg.source)
            .with_context(|| format!("camera '{}'", camera.id))?;
        let extractor = build_extractor(&cfg.extractor, cfg.ranges)?;
        let simulator = VitalsSimulator::new(cfg.extractor.simulation.clone(), cfg.ranges);
        let smoother = TemporalSmoother::new(cfg.smoothing.window, cfg.smoothing.min_samples);
        let sink: Box<dyn VitalsSink> = match &publisher {
            Some(publisher) => Box::new(publisher.submitter()),
            None => Box::new(HttpSubmitter::new(&cfg.ingest_url, cfg.ingest_timeout)),
        };
        let mut settings = cfg.pipeline_settings(camera);
        settings.max_ticks = args.ticks;
        log::info!(
            "camera {} -> patient {} ({})",
            camera.id,
            camera.patient_id,
            camera.url
        );
        loops.push(SamplingLoop::new(
            settings, source, extractor, simulator, smoother, sink,
        ));
    }

    let mut handles: Vec<(String, JoinHandle<Result<RunSummary>>)> = Vec::new();
    for mut sampling in loops {
        let camera_id = sampling.settings().camera_id.clone();
        let shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name(format!("sampler-{}", camera_id))
            .spawn(move || sampling.run(&shutdown))
            .with_context(|| format!("spawn sampling thread for '{}'", camera_id))?;
        handles.push((camera_id, handle));
    }

    let mut failures = Vec::new();
    for (camera_id, handle) in handles {
        match handle.join() {
            Ok(Ok(summary)) if summary.stop == StopReason::SourceFailed => {
                failures.push(format!("{}: source failed", camera_id));
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                log::error!("[{}] {:#}", camera_id, e);
                failures.push(format!("{}: {:#}", camera_id, e));
            }
            Err(_) => failures.push(format!("{}: sampling thread panicked", camera_id)),
        }
    }

    if let Some(publisher) = publisher {
        if let Err(e) = publisher.disconnect() {
            log::warn!("MQTT disconnect failed: {}", e);
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("stopped with errors: {}", failures.join("; ")))
    }
}

fn print_summary(cfg: &ConnectorConfig) {
    println!("configuration OK");
    match cfg.sink {
        SinkKind::Http => println!("  sink:       http {}", cfg.ingest_url),
        SinkKind::Mqtt => println!(
            "  sink:       mqtt {} (prefix {})",
            cfg.mqtt.broker, cfg.mqtt.topic_prefix
        ),
    }
    println!("  extractor:  {}", cfg.extractor.kind);
    println!("  interval:   {}s", cfg.sampling.interval.as_secs());
    println!("  policy:     {}", cfg.sampling.failure_policy);
    println!(
        "  smoothing:  window {}, min samples {}",
        cfg.smoothing.window, cfg.smoothing.min_samples
    );
    for camera in &cfg.cameras {
        println!(
            "  camera {:<12} patient {:<4} {} {}",
            camera.id,
            camera.patient_id,
            camera.url,
            if camera.enabled { "" } else { "(disabled)" }
        );
    }
}
