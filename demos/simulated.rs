//! Simulated screen update - full transfer against an in-memory tag.
//!
//! This demo:
//! - Encodes a test pattern sized for the 2.13" panel
//! - Loads the writer configuration from JSON
//! - Streams the image to a simulated tag and prints the report
//!
//! ```text
//! RUST_LOG=debug cargo run --example simulated
//! ```

use gicisky_writer::encoder::{self, Pixel, TAG_HEIGHT, TAG_WIDTH};
use gicisky_writer::simulator::SimulatedTag;
use gicisky_writer::transport::MemoryTransport;
use gicisky_writer::{ScreenWriter, TransferConfig};
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"{
    "response_timeout_ms": 5000,
    "block_timeout_ms": 10000,
    "cancel_timeout_ms": 2000
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Stripes: white, black, red.
    let image = encoder::encode_image(TAG_WIDTH, TAG_HEIGHT, |x, _| match (x / 25) % 3 {
        0 => Pixel::White,
        1 => Pixel::Black,
        _ => Pixel::Red,
    })?;

    let (transport, device) = MemoryTransport::pair(247);
    let tag = tokio::spawn(SimulatedTag::new(244).run(device));

    let writer = ScreenWriter::builder(transport)
        .config(TransferConfig::from_json(CONFIG)?)
        .build();
    let report = writer.transfer_image(image.clone()).await?;

    let received = tag.await??;
    assert_eq!(received, image);

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
