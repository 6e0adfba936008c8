//! Backtick++ CLI
//!
//! Command-line client for the Backtick++ helper.
//!
//! Each invocation opens one connection to the helper's Unix socket, sends
//! one request and prints the reply. An `ERROR:` reply exits non-zero.

use anyhow::{Context, Result};
use backtick_core_order::{ActivationMode, NewWindowPosition, WindowId};
use backtick_ipc::{
    ActivateWindowRequest, GetWindowsRequest, IpcCommand, Reply, StatusResponse, WindowInfo,
    MAX_IPC_MESSAGE_SIZE, SOCKET_PATH,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// How long to wait for the helper to connect, accept and reply.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "backtick-cli")]
#[command(author, version, about = "Talk to the Backtick++ helper")]
struct Cli {
    /// Helper socket path
    #[arg(short, long, default_value = SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show whether accessibility permission is granted
    Status,
    /// Ask the OS to prompt for accessibility permission
    RequestPermission,
    /// List windows in most-recently-used order
    Windows {
        /// Where newly seen windows go (top or bottom)
        #[arg(short, long, default_value = "top")]
        position: NewWindowPosition,
        /// Whether the focused window is promoted (automatic or manual)
        #[arg(short, long, default_value = "automatic")]
        mode: ActivationMode,
        /// Print the raw JSON payload
        #[arg(long)]
        json: bool,
    },
    /// Activate a window and move it to the front
    Activate {
        /// Window id as printed by `windows`
        id: WindowId,
    },
    /// Stop the helper
    Shutdown,
    /// Send a raw request line and print the raw reply
    Send {
        /// Request text, e.g. `getStatus`
        raw: String,
    },
}

impl Commands {
    /// Wire text of the request for this subcommand.
    fn request(&self) -> String {
        let cmd = match self {
            Commands::Send { raw } => return raw.clone(),
            Commands::Status => IpcCommand::GetStatus,
            Commands::RequestPermission => IpcCommand::RequestPermission,
            Commands::Windows { position, mode, .. } => IpcCommand::GetWindows(GetWindowsRequest {
                new_window_position: *position,
                activation_mode: *mode,
            }),
            Commands::Activate { id } => {
                IpcCommand::ActivateWindow(ActivateWindowRequest { id: *id })
            }
            Commands::Shutdown => IpcCommand::Shutdown,
        };
        cmd.encode()
    }
}

/// Send one request and read the reply until the helper closes the stream.
async fn send_request(socket: &Path, request: &str) -> Result<String> {
    let exchange = async {
        let mut stream = UnixStream::connect(socket).await.with_context(|| {
            format!(
                "Failed to connect to helper at {} (is backtick-helper running?)",
                socket.display()
            )
        })?;
        stream
            .write_all(request.as_bytes())
            .await
            .context("Failed to send request")?;

        let mut reply = Vec::new();
        (&mut stream)
            .take(MAX_IPC_MESSAGE_SIZE as u64 * 16)
            .read_to_end(&mut reply)
            .await
            .context("Failed to read reply")?;
        String::from_utf8(reply).context("Reply is not valid UTF-8")
    };

    tokio::time::timeout(REQUEST_TIMEOUT, exchange)
        .await
        .with_context(|| format!("Helper did not reply within {:?}", REQUEST_TIMEOUT))?
}

fn format_window(window: &WindowInfo) -> String {
    let marker = if window.is_currently_active { "*" } else { " " };
    format!("{} {:>8}  {}", marker, window.id, window.title)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let raw_reply = send_request(&cli.socket, &cli.command.request()).await?;

    if let Commands::Send { .. } = cli.command {
        println!("{}", raw_reply);
        return match Reply::parse(&raw_reply)? {
            Reply::Ok(_) => Ok(()),
            Reply::Error(message) => anyhow::bail!("Helper returned an error: {}", message),
        };
    }

    let reply = Reply::parse(&raw_reply)?;
    match cli.command {
        Commands::Status => {
            let status: StatusResponse = reply.decode()?;
            println!(
                "Accessibility permission: {}",
                if status.has_accessibility_permission {
                    "granted"
                } else {
                    "not granted"
                }
            );
        }
        Commands::Windows { json: true, .. } => {
            println!("{}", reply.into_payload()?);
        }
        Commands::Windows { .. } => {
            let windows: Vec<WindowInfo> = reply.decode()?;
            if windows.is_empty() {
                println!("No windows");
            }
            for window in &windows {
                println!("{}", format_window(window));
            }
        }
        Commands::RequestPermission => {
            reply.into_payload()?;
            println!("Permission prompt requested");
        }
        Commands::Activate { id } => {
            reply.into_payload()?;
            println!("Activated window {}", id);
        }
        Commands::Shutdown => {
            reply.into_payload()?;
            println!("Helper stopped");
        }
        Commands::Send { .. } => {}
    }

    Ok(())
}
