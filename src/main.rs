//! Devtool Relay CLI - runs the relay or a headless front-end.
//!
//! This is the main binary entry point. See the `devtool_relay` library
//! for the core functionality.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devtool_relay::config::{validate_endpoint, validate_room, BridgeSettings};
use devtool_relay::frontend::{
    spawn_frontend, FrontendConfig, FrontendEvent, PromptChoice, Target, ViewUpdate,
};
use devtool_relay::protocol::ClientInfo;
use devtool_relay::registry::SelectionOptions;
use devtool_relay::{RelayConfig, RelayServer};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "devtool-relay")]
#[command(version)]
#[command(about = "Debug-session relay for DevTools front-ends")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Serve {
        /// WebSocket listen address
        #[arg(long)]
        ws_addr: Option<String>,
        /// USB (adb-forwarded TCP) listen address
        #[arg(long)]
        usb_addr: Option<String>,
        /// Disable the USB listener
        #[arg(long, conflicts_with = "usb_addr")]
        no_usb: bool,
        /// Room for USB-attached clients
        #[arg(long)]
        room: Option<String>,
        /// Directory searched for templates before downloading them
        #[arg(long)]
        template_dir: Option<std::path::PathBuf>,
        /// Payloads above this many bytes are fragmented
        #[arg(long)]
        fragment_threshold: Option<usize>,
        /// Mirror USB clients into a room on this remote relay
        #[arg(long, requires = "bridge_room")]
        bridge_endpoint: Option<String>,
        /// Room to join on the remote relay
        #[arg(long, requires = "bridge_endpoint")]
        bridge_room: Option<String>,
    },
    /// Connect to a relay room as a headless front-end and log activity
    Watch {
        /// Relay WebSocket endpoint
        #[arg(long, default_value = "ws://127.0.0.1:19783/ws")]
        endpoint: String,
        /// Room to join
        #[arg(long, default_value = "local")]
        room: String,
        /// Take control of the room once connected
        #[arg(long)]
        attach: bool,
        /// Follow the newest session automatically
        #[arg(long)]
        auto_focus: bool,
        /// Only select sessions whose URL contains this text
        #[arg(long)]
        filter: Option<String>,
    },
}

fn init_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();

    if let Ok(path) = std::env::var("DEVTOOL_RELAY_LOG_FILE") {
        match std::fs::File::create(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Could not open log file {path}: {e}; logging to stderr"),
        }
    }
    builder.init();
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            return;
        }
        log::info!("Interrupt received, shutting down");
        token.cancel();
    });
}

#[allow(clippy::too_many_arguments, reason = "mirrors the serve subcommand flags")]
async fn serve(
    ws_addr: Option<String>,
    usb_addr: Option<String>,
    no_usb: bool,
    room: Option<String>,
    template_dir: Option<std::path::PathBuf>,
    fragment_threshold: Option<usize>,
    bridge_endpoint: Option<String>,
    bridge_room: Option<String>,
) -> Result<()> {
    let mut config = RelayConfig::load()?;
    if let Some(addr) = ws_addr {
        config.ws_addr = addr;
    }
    if no_usb {
        config.usb_addr = None;
    } else if let Some(addr) = usb_addr {
        config.usb_addr = Some(addr);
    }
    if let Some(room) = room {
        config.room = room;
    }
    if template_dir.is_some() {
        config.template_dir = template_dir;
    }
    if let Some(threshold) = fragment_threshold {
        config.fragment_threshold = threshold;
    }
    if let (Some(endpoint), Some(room)) = (bridge_endpoint, bridge_room) {
        config.bridge = Some(BridgeSettings { endpoint, room });
    }

    let server = RelayServer::bind(config).await?;
    println!("Relay listening on ws://{}/ws", server.local_addr());
    if let Some(addr) = server.usb_addr() {
        println!("USB clients on {addr}");
    }

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    server.run(shutdown).await
}

async fn watch(
    endpoint: String,
    room: String,
    attach: bool,
    auto_focus: bool,
    filter: Option<String>,
) -> Result<()> {
    validate_endpoint(&endpoint).context("Invalid --endpoint")?;
    validate_room(&room).context("Invalid --room")?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let (handle, mut events, task) = spawn_frontend(
        FrontendConfig {
            target: Target::new(endpoint, room),
            options: SelectionOptions {
                auto_focus_latest: auto_focus,
                card_filter: filter,
            },
            info: ClientInfo::default(),
        },
        shutdown.clone(),
    );

    while let Some(event) = events.recv().await {
        match event {
            FrontendEvent::Connected(id) => {
                println!("Connected as client {id}");
                if attach {
                    handle.attach();
                }
            }
            FrontendEvent::Disconnected => println!("Disconnected; retrying"),
            FrontendEvent::View(ViewUpdate::Clients(diff)) => println!(
                "Clients: +{:?} ~{:?} -{:?}",
                diff.added, diff.updated, diff.removed
            ),
            FrontendEvent::View(ViewUpdate::Selection(change)) => println!("Selection: {change:?}"),
            FrontendEvent::View(ViewUpdate::Attachment(state)) => println!("Attachment: {state:?}"),
            FrontendEvent::Health(report) => {
                log::info!("Round trip {}ms", report.average_ms);
                if report.surge {
                    println!("Delay surge: {}ms", report.average_ms);
                }
            }
            FrontendEvent::RetryPrompt => {
                println!("Relay unreachable; still retrying");
                handle.resolve_prompt(PromptChoice::KeepRetrying);
            }
            FrontendEvent::RestartServerRequested => {}
        }
    }

    task.await.context("Front-end task failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            ws_addr,
            usb_addr,
            no_usb,
            room,
            template_dir,
            fragment_threshold,
            bridge_endpoint,
            bridge_room,
        } => {
            serve(
                ws_addr,
                usb_addr,
                no_usb,
                room,
                template_dir,
                fragment_threshold,
                bridge_endpoint,
                bridge_room,
            )
            .await
        }
        Commands::Watch {
            endpoint,
            room,
            attach,
            auto_focus,
            filter,
        } => watch(endpoint, room, attach, auto_focus, filter).await,
    }
}
