mod artwork;
mod config;
mod errors;
mod protocol;
mod snapshot;
mod surface;
mod sync;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use log::{info, warn};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::{self, UnboundedSender};

use artwork::fetcher::UreqTransport;
use config::{default_config_path, load_or_create, Config, SurfaceBackend};
use errors::SyncError;
use snapshot::UpdateRequest;
use surface::media_controls::MediaControlsSurface;
use surface::memory::InMemorySurface;
use surface::NowPlayingSurface;
use sync::controller::{SyncController, SyncHandle};

#[derive(Debug, Default, PartialEq)]
struct CliOptions {
    config_path: Option<PathBuf>,
    verbose: bool,
}

impl CliOptions {
    fn parse<I>(args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut options = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let path = args
                        .next()
                        .ok_or_else(|| "--config requires a path".to_string())?;
                    options.config_path = Some(PathBuf::from(path));
                }
                "--verbose" | "-v" => options.verbose = true,
                other => return Err(format!("unknown argument: {other}")),
            }
        }
        Ok(options)
    }
}

/// One line of host input on stdin.
#[derive(Debug, PartialEq, serde::Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum HostCommand {
    Update(UpdateRequest),
    Refresh,
    Clear,
    Quit,
}

fn emit<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(err) => warn!("Host: failed to encode output line: {}", err),
    }
}

fn emit_reply<T: serde::Serialize>(command: &str, result: Result<T, SyncError>) {
    match result {
        Ok(ack) => emit(&json!({ "reply": command, "ack": ack })),
        Err(err) => emit(&json!({ "reply": command, "error": err.to_string() })),
    }
}

fn spawn_stdin_reader(commands: UnboundedSender<HostCommand>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!("Host: failed to read stdin: {}", err);
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<HostCommand>(line) {
                    Ok(command) => {
                        if commands.send(command).is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!("Host: ignoring malformed command: {}", err),
                }
            }
            let _ = commands.send(HostCommand::Quit);
        })?;
    Ok(())
}

/// Returns `false` once the host should stop.
async fn handle_command(handle: &SyncHandle, command: HostCommand) -> bool {
    match command {
        HostCommand::Update(request) => {
            emit_reply("update", handle.request_update(request).await);
        }
        HostCommand::Refresh => {
            emit_reply("refresh", handle.request_refresh().await);
        }
        HostCommand::Clear => {
            emit_reply("clear", handle.clear().await);
        }
        HostCommand::Quit => {
            if let Err(err) = handle.clear().await {
                warn!("Host: failed to clear surface on exit: {}", err);
            }
            return false;
        }
    }
    true
}

fn build_surface(
    config: &Config,
    transport_commands: UnboundedSender<protocol::TransportCommand>,
) -> Result<Arc<dyn NowPlayingSurface>, String> {
    match config.surface.backend {
        SurfaceBackend::MediaControls => Ok(Arc::new(MediaControlsSurface::start(
            &config.surface,
            &config.artwork,
            transport_commands,
        )?)),
        SurfaceBackend::Headless => {
            info!("Host: using headless surface");
            Ok(Arc::new(InMemorySurface::new()))
        }
    }
}

async fn run_host(config: Config) -> Result<(), String> {
    let (transport_sender, mut transport_commands) = mpsc::unbounded_channel();
    let surface = build_surface(&config, transport_sender)?;
    let transport = Arc::new(UreqTransport::new(
        &config.artwork,
        config.timing.fetch_timeout(),
    ));
    let (handle, controller) = SyncController::spawn(&config, surface, transport);
    let mut events = handle.subscribe();

    let (command_sender, mut commands) = mpsc::unbounded_channel();
    spawn_stdin_reader(command_sender)
        .map_err(|err| format!("failed to spawn stdin reader: {err}"))?;
    info!("Host: ready for commands on stdin");

    loop {
        tokio::select! {
            command = commands.recv() => {
                let command = command.unwrap_or(HostCommand::Quit);
                if !handle_command(&handle, command).await {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => emit(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Host: event stream lagged by {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            Some(command) = transport_commands.recv() => {
                emit(&json!({ "transport": command }));
            }
        }
    }

    handle.shutdown();
    drop(handle);
    if let Err(err) = controller.await {
        warn!("Host: controller task failed: {}", err);
    }
    info!("Host: stopped");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = CliOptions::parse(std::env::args().skip(1))?;

    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Trace);
    clog.init();
    log::set_max_level(if options.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config_path = match options.config_path {
        Some(path) => path,
        None => default_config_path().ok_or("no platform config directory available")?,
    };
    let config = load_or_create(&config_path)?;
    if !options.verbose {
        log::set_max_level(config.logging.level_filter());
    }
    info!(
        "Host: station '{}', config {}",
        config.station.name,
        config_path.display()
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    runtime.block_on(run_host(config))?;
    Ok(())
}
