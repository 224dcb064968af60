//! Kaleidoscope - soft-realtime lighting control plane
//!
//! Wires the pieces together: load configuration and fixtures, start the
//! tick scheduler on its own thread, then serve the control plane, the
//! metrics exporter and the actuator sink on the async runtime.

mod config;
mod logging_setup;

use std::ffi::OsStr;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use kaleidoscope_control::{metrics, run_sink, WebServer, WebServerConfig};
use kaleidoscope_host::{Engine, EngineSettings, FixtureConfig, Scheduler};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    logging_setup::init()?;

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::read_from_file(&config_path)
        .with_context(|| format!("unable to load configuration from {}", config_path))?;

    info!("setting up engine...");
    let mut engine = build_engine(&config)?;
    engine.finalize();

    let (command_tx, command_rx) = crossbeam_channel::unbounded();
    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(64);

    info!("starting tick loop at {} Hz", config.tick_rate_hz);
    let scheduler = Scheduler::new(engine, config.tick_rate_hz, command_rx, event_rx, frame_tx);
    std::thread::Builder::new()
        .name("tick-scheduler".to_string())
        .spawn(move || scheduler.run())
        .context("unable to spawn scheduler thread")?;

    let metrics_addr: SocketAddr = config
        .metrics_listen_address
        .parse()
        .context("invalid metrics listen address")?;

    let web = WebServer::new(
        WebServerConfig::new(config.http_listen_address.clone()),
        command_tx,
        event_tx,
    );

    let sink_task = tokio::spawn(run_sink(config.submarine_url.clone(), frame_rx));
    let metrics_task = tokio::spawn(metrics::serve(metrics_addr));
    let web_task = web.spawn();

    // All three run until process exit; if any of them dies, bail out so the
    // operator notices instead of running half-blind.
    tokio::select! {
        result = web_task => {
            error!("control plane exited: {:?}", result);
        }
        result = metrics_task => {
            error!("metrics exporter exited: {:?}", result);
        }
        result = sink_task => {
            error!("actuator sink exited: {:?}", result);
        }
    }

    anyhow::bail!("a control surface terminated unexpectedly")
}

fn build_engine(config: &Config) -> Result<Engine> {
    let settings = EngineSettings {
        max_consecutive_failures: config.max_consecutive_failures,
        ..EngineSettings::default()
    };
    let mut engine = Engine::new(&config.universe, settings)?;

    let fixtures_dir = Path::new(&config.fixtures_path);
    let mut fixture_count = 0;
    for entry in fs::read_dir(fixtures_dir)
        .with_context(|| format!("unable to list fixtures in {:?}", fixtures_dir))?
    {
        let path = entry.context("unable to enumerate fixture files")?.path();
        let is_yaml = matches!(
            path.extension().and_then(OsStr::to_str),
            Some("yaml") | Some("yml")
        );
        if !is_yaml {
            continue;
        }

        let fixture = FixtureConfig::from_file(&path)
            .with_context(|| format!("unable to load fixture at {:?}", path))?;
        let base_dir = path.parent().unwrap_or(fixtures_dir);
        engine
            .add_fixture(&fixture, base_dir)
            .with_context(|| format!("unable to set up fixture {}", fixture.name))?;
        fixture_count += 1;
    }
    if fixture_count == 0 {
        warn!("no fixtures found in {:?}", fixtures_dir);
    }

    if let Some(programs_path) = &config.programs_path {
        let programs_dir = Path::new(programs_path);
        for entry in fs::read_dir(programs_dir)
            .with_context(|| format!("unable to list programs in {:?}", programs_dir))?
        {
            let path = entry.context("unable to enumerate program files")?.path();
            if path.extension() != Some(OsStr::new("rhai")) {
                continue;
            }
            let name = path
                .file_stem()
                .and_then(OsStr::to_str)
                .context("invalid program file name")?
                .to_string();
            let source = fs::read_to_string(&path)
                .with_context(|| format!("unable to read program at {:?}", path))?;
            engine
                .add_script_program(&name, &source)
                .with_context(|| format!("unable to register program {}", name))?;
        }
    }

    Ok(engine)
}
