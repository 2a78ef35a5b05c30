// ABOUTME: Client module for driving a codec service session
// ABOUTME: Exports the client handle, errors, keep-alive timing and launch helpers

//! Client side of the codec service protocol.
//!
//! A client connects to a service session by instance name and drives
//! it through a strictly sequential command exchange: open an encoder
//! or decoder, upload frames or packets, pull the produced output,
//! and stop the service when done.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use avpipe::client;
//! use avpipe::codec::InitInfo;
//!
//! # async fn example() -> Result<(), avpipe::client::ClientError> {
//! // Start a session on this runtime and connect to it.
//! let (mut client, service) = client::open_service("demo").await?;
//!
//! client.open_encoder(InitInfo {
//!     bps: 5_000_000,
//!     width: 1920,
//!     height: 1080,
//!     fps: 30,
//!     codec_name: "h264".into(),
//! }).await?;
//!
//! let frame = vec![0u8; 1920 * 1080 * 3 / 2];
//! client.encode(&frame).await?;
//!
//! let mut packet = Vec::new();
//! while client.get_packet(&mut packet).await? {
//!     // consume elementary-stream bytes
//! }
//!
//! client::close_service(&mut client, service).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The service ends a session after 10 seconds without commands; a
//! client idling between operations should drive [`KeepAliveManager`]
//! and send [`AvClient::keep_alive`] pings when due.

pub mod default;
pub mod error;
pub mod keepalive;
pub mod launcher;

pub use default::AvClient;
pub use error::{ClientError, ClientResult};
pub use keepalive::{KeepAliveConfig, KeepAliveManager};
pub use launcher::{
    close_service, open_service, spawn_service_process, start_service, ServiceHandle,
};
