//! Basic example: Discover all nearby ultrasound probes
//!
//! Run with: cargo run --example discover_probes

use std::time::Duration;
use ultrasound_probe_ble::{DeviceManager, ProbeConfig, ProbeEvent, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ultrasound_probe_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Starting ultrasound probe discovery...");
    println!("Make sure your probe is awake!\n");

    let config = ProbeConfig::default().with_scan_timeout(Duration::from_secs(5));
    let manager = DeviceManager::with_config(config).await?;

    // Register callback for scan results
    let _handle = manager.on_event(|event| {
        if let ProbeEvent::DevicesUpdated { names } = event {
            println!("\nScan finished, {} probe(s):", names.len());
            for name in names {
                println!("  {}", name);
            }
        }
    });

    manager.start_scan().await?;

    println!("Scanning...");
    println!("Press Ctrl+C to exit early.\n");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(7)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    let status = manager.status().await?;
    println!("\n--- Scan Complete ---");
    println!("Total probes found: {}", status.probe_names.len());

    manager.shutdown().await?;
    println!("\nDone!");

    Ok(())
}
