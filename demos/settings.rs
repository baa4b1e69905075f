//! Tag administration - discovery and settings commands.
//!
//! This demo:
//! - Recognises a tag from a discovery result
//! - Assigns it a new address
//! - Writes a settings blob and leaves settings mode
//!
//! ```text
//! cargo run --example settings
//! ```

use std::collections::HashMap;

use gicisky_writer::advertisement::{TagAdvertisement, MANUFACTURER_ID};
use gicisky_writer::simulator::SimulatedTag;
use gicisky_writer::transport::MemoryTransport;
use gicisky_writer::{DeviceAddress, ScreenWriter};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let seen: DeviceAddress = "FF:FF:92:1A:0B:3C".parse()?;
    let data = HashMap::from([(MANUFACTURER_ID, vec![0x01, 29, 0x00, 0x00])]);
    let Some(tag) = TagAdvertisement::parse(seen, &data) else {
        return Err("not a tag".into());
    };
    info!(address = %tag.address, volts = ?tag.battery_volts(), "Discovered");
    println!("{}", serde_json::to_string(&tag)?);

    let (transport, device) = MemoryTransport::pair(247);
    let simulated = tokio::spawn(SimulatedTag::new(244).run(device));

    let writer = ScreenWriter::new(transport);
    writer.set_address("FF:FF:00:00:00:2A".parse()?).await?;
    writer.write_settings(&[0x01, 0x00]).await?;
    writer.exit_settings().await?;

    // Tear down the link; the simulated tag reports the disconnect.
    drop(writer);
    if let Err(err) = simulated.await? {
        info!(error = %err, "Simulated tag stopped");
    }
    Ok(())
}
