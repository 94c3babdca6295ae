use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use chambers_client_core::config::Config;
use chambers_client_core::media::SyntheticCapture;
use chambers_client_core::peer::ConnectionState;
use chambers_client_core::session::{SessionIdentity, SessionOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "chambers", about = "Join a booking's video session")]
struct Cli {
    /// Booking identifier of the session to join
    booking: String,

    /// Display name shown to the counterpart
    #[arg(long, short = 'n', default_value = "Participant")]
    name: String,

    /// Relay base URL (overrides CHAMBERS_RELAY_URL)
    #[arg(long)]
    relay: Option<String>,

    /// Start the call immediately instead of waiting for the counterpart
    #[arg(long)]
    call: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chambers=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(relay) = cli.relay {
        config.relay_url = relay;
    }

    let identity = SessionIdentity::new(cli.booking.clone(), cli.name.clone());
    // Hardware capture lives in the desktop shell; the CLI transmits the
    // synthetic pattern so a session can be exercised end to end.
    let session =
        SessionOrchestrator::start(&config, identity, Arc::new(SyntheticCapture::new())).await;
    eprintln!("joined booking {} as {}", cli.booking, cli.name);

    if cli.call {
        session.start_session().await?;
        session.set_audio_enabled(true).await;
        session.set_video_enabled(true).await;
    }

    let mut state = session.connection_state();
    let state_printer = tokio::spawn(async move {
        loop {
            let current = *state.borrow_and_update();
            if current != ConnectionState::Idle {
                eprintln!("connection: {current:?}");
            }
            if state.changed().await.is_err() {
                break;
            }
        }
    });

    let mut chat_seen = 0usize;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = stdin.next_line() => {
                match line? {
                    Some(text) if !text.trim().is_empty() => session.send_chat(text),
                    Some(_) => {}
                    None => break,
                }
            }
            _ = ticker.tick() => {
                let log = session.chat().snapshot();
                for message in &log[chat_seen..] {
                    println!("[{}] {}", message.sender_name, message.text);
                }
                chat_seen = log.len();
            }
        }
    }

    session.close().await;
    state_printer.abort();
    Ok(())
}
