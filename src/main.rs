//! voxlive - real-time voice assistant for the terminal
//!
//! Captures the microphone (and optionally the screen), streams it to
//! Google's Gemini Live API, and plays the spoken replies while
//! printing the running transcript. Typed lines are sent as text turns;
//! `/vision on|off` toggles screen sharing and `/quit` ends the session.

#![forbid(unsafe_code)]

use std::io::BufRead;

use anyhow::Context;
use chrono::Duration;
use tokio::sync::mpsc;
use tracing::info;

use voxlive::runner;
use voxlive::store::InteractionStore;
use voxlive::{SessionCommand, SessionConfig, SessionUpdate};

const SYSTEM_INSTRUCTION: &str =
    "You are a helpful real-time voice assistant. Respond concisely and conversationally.";

/// Nudge the user at startup if the assistant has been idle this long.
const REENGAGE_AFTER_HOURS: i64 = 24;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut config = SessionConfig {
        api_key: String::new(),
        system_instruction: Some(SYSTEM_INSTRUCTION.to_string()),
        ..SessionConfig::default()
    };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--record" => config.record = true,
            "--vision" => config.vision = true,
            "--help" | "-h" => {
                println!("usage: voxlive [--record] [--vision]");
                return Ok(());
            }
            other => {
                eprintln!("unknown flag: {}", other);
                eprintln!("usage: voxlive [--record] [--vision]");
                std::process::exit(2);
            }
        }
    }
    config.api_key = std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY is not set")?;

    info!("starting voxlive");
    let store = InteractionStore::open_default();
    if store.needs_reengagement("assistant", Duration::hours(REENGAGE_AFTER_HOURS)) {
        println!("(it has been a while - say hello!)");
    }

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (update_tx, mut update_rx) = mpsc::unbounded_channel();

    let session = tokio::spawn(runner::run(config, command_rx, update_tx));
    spawn_stdin_bridge(command_tx.clone());

    let ctrlc_tx = command_tx;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping session");
            let _ = ctrlc_tx.send(SessionCommand::Stop);
        }
    });

    while let Some(update) = update_rx.recv().await {
        match update {
            SessionUpdate::State(state) => info!("session {}", state),
            SessionUpdate::Transcript { role, content } => {
                println!("[{}] {}", role.as_str(), content);
            }
            SessionUpdate::Notice(text) => println!("({})", text),
        }
    }

    session.await?;
    info!("voxlive stopped");
    Ok(())
}

/// Reads stdin on a plain thread so a pending read never holds up
/// shutdown; the thread dies with the process.
fn spawn_stdin_bridge(commands: mpsc::UnboundedSender<SessionCommand>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let command = parse_line(line);
            let stop = matches!(command, SessionCommand::Stop);
            if commands.send(command).is_err() || stop {
                break;
            }
        }
    });
}

fn parse_line(line: &str) -> SessionCommand {
    match line {
        "/quit" => SessionCommand::Stop,
        "/vision on" => SessionCommand::SetVision(true),
        "/vision off" => SessionCommand::SetVision(false),
        text => SessionCommand::SendText(text.to_string()),
    }
}
