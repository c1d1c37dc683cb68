//! detectord - multi-source object detection daemon
//!
//! This daemon:
//! 1. Loads layered configuration (config file, environment, CLI flags)
//! 2. Resolves the source list (CLI/env list, or the catalog's streams)
//! 3. Starts one detection task per source
//! 4. In production mode persists detection events and alerts subscribed
//!    observers; otherwise logs each frame's objects
//! 5. Drains every task on Ctrl-C before exiting

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use detection_agent::config::parse_sources;
use detection_agent::notify::{MqttConfig, SmtpConfig};
use detection_agent::orchestrator::{inspection_sinks, production_sinks};
use detection_agent::{
    AgentConfig, AlertDispatcher, BackendRegistry, Catalog, ClassLabels, DefaultSourceOpener,
    DetectorBackend, LogNotifier, MqttNotifier, Notifier, OperatingMode, Orchestrator,
    SmtpNotifier, SqliteCatalog, StubBackend,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Comma-separated sources (image, video, device index, rtsp url); `--` reads the catalog.
    #[arg(short = 'd', long = "devices", value_name = "LIST")]
    devices: Option<String>,

    /// Model artifact.
    #[arg(short = 'm', long = "model")]
    model: Option<PathBuf>,

    /// Class-name file, one name per line.
    #[arg(long)]
    labels: Option<PathBuf>,

    /// Confidence threshold as integer percent (0-100].
    #[arg(long)]
    confidence: Option<i64>,

    /// Detector backend name (see --list-backends).
    #[arg(long)]
    backend: Option<String>,

    /// Compute target (cpu/gpu).
    #[arg(long)]
    target: Option<String>,

    /// Catalog database path.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Print registered detector backends and exit.
    #[arg(long)]
    list_backends: bool,
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Ok(path) = std::env::var("LOG_FILE") {
        if !path.trim().is_empty() {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open log file {}", path))?;
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
    }
    builder.init();
    Ok(())
}

fn build_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    #[cfg(feature = "backend-tract")]
    registry.register("tract", detection_agent::detect::TractBackend::from_spec);
    registry.register("stub", |_spec| {
        Ok(Box::new(StubBackend::empty()) as Box<dyn DetectorBackend>)
    });
    registry
}

fn apply_args(cfg: &mut AgentConfig, args: &Args) -> Result<()> {
    if let Some(devices) = &args.devices {
        cfg.sources = parse_sources(devices);
    }
    if let Some(model) = &args.model {
        cfg.model.path = model.clone();
    }
    if let Some(labels) = &args.labels {
        cfg.model.labels_path = Some(labels.clone());
    }
    if let Some(confidence) = args.confidence {
        cfg.confidence_percent = confidence;
    }
    if let Some(backend) = &args.backend {
        cfg.model.backend = Some(backend.clone());
    }
    if let Some(target) = &args.target {
        cfg.model.target = target.parse()?;
    }
    if let Some(db) = &args.db {
        cfg.db_path = db.to_string_lossy().to_string();
    }
    cfg.validate()
}

fn main() -> Result<()> {
    init_logging()?;
    let args = Args::parse();

    let registry = build_registry();
    if args.list_backends {
        for name in registry.list() {
            let marker = if registry.default_name() == Some(name.as_str()) {
                " (default)"
            } else {
                ""
            };
            println!("{}{}", name, marker);
        }
        return Ok(());
    }

    let mut cfg = AgentConfig::load()?;
    apply_args(&mut cfg, &args)?;
    cfg.log_settings();

    if let Some(name) = &cfg.model.backend {
        if !registry.contains(name) {
            return Err(anyhow!(
                "backend '{}' not registered (available: {})",
                name,
                registry.list().join(", ")
            ));
        }
    } else if registry.default_name() == Some("stub") {
        log::warn!("no model backend compiled in; the stub backend detects nothing");
    }

    let labels = match &cfg.model.labels_path {
        Some(path) => ClassLabels::from_file(path)?,
        None => ClassLabels::default(),
    };
    log::info!("loaded {} class label(s)", labels.len());

    let needs_catalog =
        cfg.mode == OperatingMode::Production || cfg.reads_sources_from_catalog();
    let catalog: Option<Arc<SqliteCatalog>> = if needs_catalog {
        Some(Arc::new(SqliteCatalog::open(&cfg.db_path)?))
    } else {
        None
    };

    let sources = match (&catalog, cfg.reads_sources_from_catalog()) {
        (Some(catalog), true) => catalog.configured_stream_addresses()?,
        _ => cfg.sources.clone(),
    };
    log::info!("{} source(s): {}", sources.len(), sources.join(", "));

    let mut mqtt: Option<Arc<MqttNotifier>> = None;
    let sinks = match (cfg.mode, &catalog) {
        (OperatingMode::Production, Some(catalog)) => {
            let notifier: Arc<dyn Notifier> = if let Some(settings) = &cfg.mqtt {
                let notifier = Arc::new(MqttNotifier::connect(&MqttConfig {
                    broker: settings.broker.clone(),
                    topic_prefix: settings.topic_prefix.clone(),
                    ..MqttConfig::default()
                })?);
                mqtt = Some(notifier.clone());
                notifier
            } else if let Some(settings) = &cfg.smtp {
                Arc::new(SmtpNotifier::new(SmtpConfig {
                    host: settings.host.clone(),
                    port: settings.port,
                    from: settings.from.clone(),
                    ..SmtpConfig::default()
                })?)
            } else {
                log::warn!("no notifier configured, alerts are only logged");
                Arc::new(LogNotifier)
            };
            log::info!("alerts delivered via {}", notifier.name());

            let catalog: Arc<dyn Catalog> = catalog.clone();
            let dispatcher = Arc::new(AlertDispatcher::new(catalog.clone(), notifier));
            production_sinks(catalog, dispatcher, cfg.class_resolution)
        }
        _ => inspection_sinks(),
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");

    let orchestrator = Orchestrator::new(
        Arc::new(cfg.pipeline_config(labels)),
        Arc::new(DefaultSourceOpener::new(cfg.source_settings())),
        Arc::new(registry),
        cfg.model_spec(),
        sinks,
    )
    .with_backend(cfg.model.backend.clone())
    .with_shutdown(shutdown);

    let reports = orchestrator.run(&sources);
    let failed = reports.iter().filter(|r| r.exit.is_failure()).count();
    log::info!(
        "all tasks terminated ({} of {} ended with an error)",
        failed,
        reports.len()
    );

    if let Some(mqtt) = mqtt {
        mqtt.disconnect()?;
    }
    Ok(())
}
