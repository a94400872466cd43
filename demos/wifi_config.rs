//! Wi-Fi configuration example
//!
//! Connects to a probe, powers it on, prints the network it publishes and
//! optionally asks it to join another one.
//!
//! Run with: cargo run --example wifi_config
//!
//! To pick a probe and request a network:
//!   cargo run --example wifi_config -- --probe P100 --request "SSID=Lab"

use std::time::Duration;
use ultrasound_probe_ble::{ConnectionState, DeviceManager, Error, ProbeEvent, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,ultrasound_probe_ble=debug")
        .init();

    println!("Probe Wi-Fi Configuration");
    println!("=========================\n");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let arg = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };
    let target = arg("--probe");
    let request = arg("--request");

    let manager = DeviceManager::new().await?;
    let mut events = manager.subscribe();

    manager.start_scan().await?;

    let session = async {
        while let Ok(event) = events.recv().await {
            match event {
                ProbeEvent::DevicesUpdated { names } => {
                    let name = match &target {
                        Some(t) => names.iter().find(|n| *n == t).cloned(),
                        None => names.first().cloned(),
                    };
                    let Some(name) = name else {
                        return Err(Error::NotFound {
                            name: target.clone().unwrap_or_default(),
                        });
                    };
                    println!("Connecting to {}...", name);
                    manager.connect(&name).await?;
                }
                ProbeEvent::ConnectionStatusChanged { state, reason } => {
                    println!("Connection: {}", state);
                    if state == ConnectionState::Failed {
                        if let Some(reason) = reason {
                            println!("  Reason: {}", reason);
                        }
                        return Ok(());
                    }
                }
                ProbeEvent::PowerReady { ready: true } => {
                    println!("Powering probe on");
                    manager.set_power(true).await?;
                }
                ProbeEvent::WifiReady { ready: true } => {
                    if let Some(info) = &request {
                        println!("Requesting network change: {}", info);
                        manager.request_wifi_change(info).await?;
                    }
                }
                ProbeEvent::WifiInfoChanged { info } => {
                    println!("Probe network: {}", info);
                }
                ProbeEvent::WriteCompleted { request: id, outcome } => {
                    match outcome.into_result() {
                        Ok(()) => println!("{}: written", id),
                        Err(e) => println!("{}: {}", id, e),
                    }
                }
                _ => {}
            }
        }
        Ok(())
    };

    tokio::select! {
        result = session => result?,
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    manager.shutdown().await?;
    println!("\nDone!");

    Ok(())
}
