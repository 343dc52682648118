//! Watches a Powermax panel through a serial-to-TCP bridge.
//!
//! Usage: `cargo run --example powermax_panel -- <address> <port> [pin]`

use futures_util::StreamExt;
use linkwire::powermax::{SendType, arm, ArmMode};
use linkwire::{Manager, ProtocolKind, SessionBuilder, SessionEvent, StateUpdate};

#[tokio::main]
async fn main() -> linkwire::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    Manager::maximize_fd_limit()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        eprintln!("usage: powermax_panel <address> <port> [pin]");
        std::process::exit(2);
    }
    let port = args[1]
        .parse()
        .map_err(|_| linkwire::SessionError::Config(format!("bad port '{}'", args[1])))?;

    let config = SessionBuilder::new("panel", "")
        .protocol(ProtocolKind::Powermax)
        .address(&args[0])
        .port(port)
        .config()?;

    let manager = Manager::new();
    let stream = manager.stream();
    tokio::pin!(stream);
    let panel = manager.add(config).await?;

    if let Some(pin) = args.get(2) {
        panel.connect().await?;
        let (cmd, params) = SendType::EventLog.with_pin(pin)?;
        panel.send(cmd, params).await?;
        let (cmd, params) = arm(ArmMode::Disarm, pin)?;
        if let Err(e) = panel.send(cmd, params).await {
            println!("[ERROR] Disarm failed: {}", e);
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = stream.next() => match event {
                Some(ev) => match ev.event {
                    SessionEvent::State(StateUpdate::Event { kind, source, code }) => {
                        println!("[{}] {} zone={} event=0x{:02X}", ev.device_id, kind, source, code)
                    }
                    other => println!("[{}] {:?}", ev.device_id, other),
                },
                None => break,
            },
        }
    }

    manager.shutdown().await;
    Ok(())
}
