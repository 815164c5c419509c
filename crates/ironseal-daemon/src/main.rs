//! Runtime daemon: owns the unlock state machine and update manager, ticks
//! them on a fixed interval and serves the control socket.

use anyhow::{Context, Result};
use ironseal_core::{
    config::{RuntimeConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH},
    logging, DirectoryUpdateSource, Event, FileImageInstaller, IronsealService, RuntimeContext,
    TerminationControl, TerminationMode,
};
use ironseal_luks::{SystemDeviceBackend, SystemHost, SystemRunner};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio::{select, signal::ctrl_c};

mod control;

type Service = IronsealService<SystemDeviceBackend>;

const SOCKET_ENV: &str = "IRONSEAL_SOCKET";
const DEFAULT_SOCKET: &str = "/run/ironseal/control.sock";
const MIN_TICK_MS: u64 = 100;

/// Entry point for the Tokio runtime; logs failures before exit.
#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

/// Load configuration, start background tasks, and juggle shutdown signals.
async fn run() -> Result<()> {
    logging::init("info");
    let config_path = PathBuf::from(
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    let config = Arc::new(
        RuntimeConfig::load_or_bootstrap(&config_path)
            .with_context(|| format!("load config {}", config_path.display()))?,
    );
    if config.path != config_path {
        warn!(
            "configuration missing at {}; using bootstrap at {}",
            config_path.display(),
            config.path.display()
        );
    }
    for issue in config.validate() {
        warn!("config: {issue}");
    }
    info!("ironseal daemon booting (config: {})", config.path.display());

    let termination = TerminationControl::default();
    let (events_tx, events_rx) = mpsc::channel();
    let runner = SystemRunner::new(config.tool_timeout());
    let context = RuntimeContext {
        config: Arc::clone(&config),
        backend: Arc::new(SystemDeviceBackend::from_config(&config)),
        host: Arc::new(SystemHost::new(runner.clone())),
        update_source: Arc::new(DirectoryUpdateSource::new(
            config.updates.source_dir.clone(),
            config.updates.sync_command.clone(),
            runner,
        )),
        installer: Arc::new(FileImageInstaller::new(config.updates.install_path.clone())),
        termination: termination.clone(),
        events: events_tx,
    };
    let service = Arc::new(Mutex::new(
        IronsealService::new(context, std::time::Instant::now())
            .map_err(anyhow::Error::new)
            .context("initialise runtime")?,
    ));

    let (broadcast_tx, _) = broadcast::channel(64);
    let _bridge = tokio::task::spawn_blocking({
        let broadcast_tx = broadcast_tx.clone();
        move || forward_events(events_rx, broadcast_tx)
    });

    let socket_path =
        PathBuf::from(std::env::var(SOCKET_ENV).unwrap_or_else(|_| DEFAULT_SOCKET.to_string()));
    let listener = bind_control_socket(&socket_path)?;
    info!("control socket listening on {}", socket_path.display());

    let mut ticker = tokio::spawn(tick_loop(
        Arc::clone(&service),
        config.unlock_poll_interval(),
    ));
    let mut server = tokio::spawn(serve(listener, Arc::clone(&service), broadcast_tx));

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    loop {
        select! {
            res = &mut ticker => { res?; break; }
            res = &mut server => { res??; break; }
            _ = ctrl_c() => {
                if shutdown_allowed(&termination, "interrupt") { break; }
            }
            _ = sigterm.recv() => {
                if shutdown_allowed(&termination, "SIGTERM") { break; }
            }
        }
    }

    ticker.abort();
    server.abort();
    let _ = std::fs::remove_file(&socket_path);
    info!("ironseal daemon stopped");
    Ok(())
}

fn shutdown_allowed(termination: &TerminationControl, signal: &str) -> bool {
    match termination.mode() {
        TerminationMode::Handle => {
            info!("received {signal}; shutting down");
            true
        }
        TerminationMode::Ignore => {
            warn!("received {signal} while an update is being applied; ignoring");
            false
        }
    }
}

fn bind_control_socket(path: &PathBuf) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create socket directory {}", parent.display()))?;
    }
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("remove stale socket {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("bind {}", path.display()))
}

/// Relay events from the service's channel to every subscribed connection.
fn forward_events(events: mpsc::Receiver<Event>, broadcast_tx: broadcast::Sender<Event>) {
    while let Ok(event) = events.recv() {
        debug!("event: {event:?}");
        // No subscribers is fine.
        let _ = broadcast_tx.send(event);
    }
}

async fn tick_loop(service: Arc<Mutex<Service>>, period: std::time::Duration) {
    let mut ticker = interval(period.max(std::time::Duration::from_millis(MIN_TICK_MS)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let tick: Instant = ticker.tick().await;
        match service.lock() {
            Ok(mut service) => service.tick(tick.into_std()),
            Err(_) => {
                error!("service state poisoned; stopping control loop");
                return;
            }
        }
    }
}

async fn serve(
    listener: UnixListener,
    service: Arc<Mutex<Service>>,
    events: broadcast::Sender<Event>,
) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let service = Arc::clone(&service);
        let events = events.subscribe();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, service, events).await {
                warn!("control connection closed: {err}");
            }
        });
    }
}

async fn handle_connection(
    stream: UnixStream,
    service: Arc<Mutex<Service>>,
    mut events: broadcast::Receiver<Event>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request = match control::parse(&line) {
            Ok(request) => request,
            Err(response) => {
                writer.write_all(response.to_line().as_bytes()).await?;
                continue;
            }
        };
        if matches!(request, control::Request::Subscribe) {
            let ack = control::Response::ok(serde_json::json!({ "subscribed": true }));
            writer.write_all(ack.to_line().as_bytes()).await?;
            return stream_events(&mut writer, &mut events).await;
        }
        let response = control::dispatch(&service, request);
        writer.write_all(response.to_line().as_bytes()).await?;
    }
    Ok(())
}

async fn stream_events<W>(writer: &mut W, events: &mut broadcast::Receiver<Event>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match events.recv().await {
            Ok(event) => {
                let mut line = serde_json::to_string(&event)?;
                line.push('\n');
                writer.write_all(line.as_bytes()).await?;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("event subscriber lagged; {skipped} event(s) dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}
