//! Connects to a Tuya device, toggles data point 1 and prints every update.
//!
//! Usage: `cargo run --example tuya_monitor -- <id> <address> <local_key> [version]`

use futures_util::StreamExt;
use linkwire::tuya::{self, CommandType};
use linkwire::{SessionBuilder, SessionEvent};
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> linkwire::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        eprintln!("usage: tuya_monitor <id> <address> <local_key> [version]");
        std::process::exit(2);
    }
    let version = args.get(3).map(String::as_str).unwrap_or("3.3");

    let session = SessionBuilder::new(&args[0], &args[2])
        .address(&args[1])
        .version(version)
        .poll_interval(Duration::from_secs(60))
        .build()?;

    println!("[INFO] Connecting to {} ...", session.device_id());
    session.connect().await?;

    println!("[INFO] Switching DP 1 on...");
    match session
        .send(CommandType::Control, tuya::set_dps(json!({"1": true})))
        .await
    {
        Ok(Some(reply)) => println!("[SUCCESS] Acknowledged with seqno {}", reply.seqno),
        Ok(None) => println!("[SUCCESS] Sent"),
        Err(e) => println!("[ERROR] Control failed: {}", e),
    }

    let events = session.events();
    tokio::pin!(events);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.next() => match event {
                Some(SessionEvent::State(update)) => println!("[UPDATE] {:?}", update),
                Some(SessionEvent::Connected) => println!("[INFO] Connected"),
                Some(SessionEvent::Disconnected { reason }) => {
                    println!("[WARN] Disconnected: {:?}", reason)
                }
                None => break,
            },
        }
    }

    session.dispose().await;
    Ok(())
}
