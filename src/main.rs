#![deny(clippy::all)]

mod audio;
mod config;
mod session;

use anyhow::Context;
use session::{LiveSession, Speaker, TranscriptEvent};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing for structured logging
    tracing_subscriber::fmt::init();

    // Load .env (if present) before reading the credential
    let _ = dotenvy::dotenv();
    let session_config =
        config::SessionConfig::from_env().context("failed to parse embedded config.toml")?;

    let session = Arc::new(LiveSession::new(session_config));
    session.set_stop_callback(Box::new(|| {
        info!("Live capture session ended");
    }));

    // Print transcript lines as the channel finalizes them
    let mut event_rx = session.subscribe();
    let printer = tokio::spawn(async move {
        let mut pending = String::new();
        while let Ok(event) = event_rx.recv().await {
            match event {
                TranscriptEvent::PartialOutput(text) => pending.push_str(&text),
                TranscriptEvent::FinalInput(text) => println!("User: {}", text),
                TranscriptEvent::TurnComplete => {
                    if !pending.is_empty() {
                        println!("Model: {}", std::mem::take(&mut pending));
                    }
                }
                TranscriptEvent::ChannelError(reason) => {
                    error!("Channel error: {}", reason);
                }
                TranscriptEvent::ChannelClosed | TranscriptEvent::Unknown => {}
            }
        }
    });

    println!("Listening... press Ctrl-C to stop.");

    let runner = session.clone();
    tokio::select! {
        result = runner.start() => {
            if let Err(e) = result {
                error!("Session failed to start: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, stopping session");
            session.stop();
        }
    }

    printer.abort();

    let transcript = session.transcript();
    if !transcript.is_empty() {
        println!("\n--- Transcript ---");
        for line in transcript {
            let speaker = match line.speaker {
                Speaker::User => "User",
                Speaker::Model => "Model",
            };
            println!("{}: {}", speaker, line.text);
        }
    }
    if let Some(reason) = session.error_reason() {
        error!("Session ended with error: {}", reason);
    }

    Ok(())
}
