//! # gicisky-writer
//!
//! Screen-update protocol engine for Gicisky e-paper tags.
//!
//! The tag exposes two GATT characteristics: a control characteristic for
//! commands and their confirmations, and a data characteristic for image
//! blocks. This crate negotiates the block size, announces the image size,
//! and then serves the tag's block requests until it reports completion.
//!
//! ## Architecture
//!
//! - **Frame codec** ([`protocol`]): command/notification frames, block layout
//! - **Correlator** ([`correlator`]): one outstanding command, notification dispatch
//! - **Flow controller** ([`flow`]): ordered block writes paced by the tag
//! - **Screen writer** ([`ScreenWriter`]): handshake, session lifecycle, cancel
//!
//! The link itself is abstracted by [`Transport`]; an in-memory
//! implementation and a simulated tag are included for tests and demos.
//!
//! ## Example
//!
//! ```
//! use gicisky_writer::{encoder, simulator::SimulatedTag, transport::MemoryTransport, ScreenWriter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let image = encoder::encode_image(16, 8, |x, _| {
//!     if x % 2 == 0 { encoder::Pixel::White } else { encoder::Pixel::Black }
//! })?;
//!
//! let (transport, device) = MemoryTransport::pair(247);
//! let tag = tokio::spawn(SimulatedTag::new(104).run(device));
//!
//! let report = ScreenWriter::new(transport).transfer_image(image.clone()).await?;
//! assert_eq!(report.image_len, image.len());
//! assert_eq!(tag.await??, image);
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod advertisement;
pub mod config;
pub mod correlator;
pub mod encoder;
pub mod error;
pub mod flow;
pub mod protocol;
pub mod session;
pub mod simulator;
pub mod transport;

mod writer;

pub use address::DeviceAddress;
pub use config::TransferConfig;
pub use error::{Result, TransferError};
pub use session::{Phase, Session, TransferReport};
pub use transport::Transport;
pub use writer::{transfer_image, ScreenWriter, ScreenWriterBuilder};
