mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use media::{CpalCapture, CpalRenderer};
use shared_proto::events::{ConnectionState, SessionEvent};
use tokio::sync::mpsc;

use voice_client::observability::init_tracing;
use voice_client::{SessionController, WebSocketConnector};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    init_tracing(args.log_level.as_deref());

    if args.list_devices {
        return list_devices();
    }

    let config = args.session_config();
    config.validate().context("invalid configuration")?;
    let params = args.connect_params();

    let controller = SessionController::new(
        config,
        Box::new(CpalCapture::new()),
        Box::new(CpalRenderer::new()),
        Arc::new(WebSocketConnector),
    );
    let (event_tx, mut events) = mpsc::unbounded_channel();
    controller.add_listener(Arc::new(event_tx));

    if let Err(e) = controller.connect(params).await {
        drain_events(&mut events, args.levels)?;
        return Err(e).context("could not start the voice line");
    }

    eprintln!("commands: m = toggle microphone, s = toggle speaker, q = hang up");

    let mut state = controller.watch_state();
    let mut lines = spawn_stdin_reader();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event, args.levels)?,
            line = lines.recv(), if stdin_open => {
                // Without stdin the call runs until ctrl-c or the agent hangs up
                let Some(line) = line else {
                    stdin_open = false;
                    continue;
                };
                let flags = controller.mute_flags();
                let result = match line.trim() {
                    "m" => controller.set_microphone_muted(!flags.microphone_muted),
                    "s" => controller.set_speaker_muted(!flags.speaker_muted),
                    "q" => break,
                    "" => Ok(()),
                    other => {
                        eprintln!("unknown command '{other}'");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    tracing::warn!(component = "cli", error = %e, "command rejected");
                }
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == ConnectionState::Idle {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.disconnect().await;
    drain_events(&mut events, args.levels)?;
    Ok(())
}

/// Stdin lines on a detached thread; a blocking read must not hold up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn print_event(event: &SessionEvent, levels: bool) -> anyhow::Result<()> {
    if matches!(event, SessionEvent::Level { .. }) && !levels {
        return Ok(());
    }
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

fn drain_events(events: &mut mpsc::UnboundedReceiver<SessionEvent>, levels: bool) -> anyhow::Result<()> {
    while let Ok(event) = events.try_recv() {
        print_event(&event, levels)?;
    }
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    let default_input = media::default_input_device_name().ok();
    let default_output = media::default_output_device_name().ok();

    println!("input devices:");
    for name in media::list_input_devices()? {
        let marker = if default_input.as_deref() == Some(name.as_str()) { "*" } else { " " };
        println!("  {marker} {name}");
    }

    println!("output devices:");
    for name in media::list_output_devices()? {
        let marker = if default_output.as_deref() == Some(name.as_str()) { "*" } else { " " };
        println!("  {marker} {name}");
    }
    Ok(())
}
