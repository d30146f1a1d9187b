use anytalk_client::{ClientConfig, ConnectionState, Destination, SessionController};

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Prints previews and committed text to the terminal.
struct StdoutDestination;

impl Destination for StdoutDestination {
    fn show_preview(&self, text: &str) {
        print!("\r\x1b[2K... {text}");
        use std::io::Write;
        let _ = std::io::stdout().flush();
    }

    fn clear_preview(&self) {
        print!("\r\x1b[2K");
        use std::io::Write;
        let _ = std::io::stdout().flush();
    }

    fn commit(&self, text: &str) {
        println!("\r\x1b[2K{text}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = ClientConfig::from_env();
    let handle = SessionController::spawn(config)?;

    let destination: Arc<dyn Destination> = Arc::new(StdoutDestination);
    handle.focus_changed(Some(destination.clone())).await?;

    tracing::info!("ready: press Enter to toggle recording, Ctrl+C to quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                if line?.is_none() {
                    break;
                }
                let state = handle.toggle_recording(destination.clone()).await?;
                match state {
                    ConnectionState::Recording | ConnectionState::Connecting => {
                        tracing::info!("recording")
                    }
                    ConnectionState::Connected => tracing::info!("starting"),
                    ConnectionState::Idle => tracing::info!("stopped"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}
