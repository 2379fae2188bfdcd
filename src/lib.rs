//! # rtpmidi
//!
//! A pure Rust library for AppleMIDI / RTP-MIDI (RFC 6295) network MIDI
//! sessions over UDP.
//!
//! ## Features
//!
//! - Session invitation handshake, as Initiator or Listener (or both)
//! - Clock synchronization (CK exchange) and receiver feedback
//! - Bit-exact RTP-MIDI command lists: delta times, running status, SysEx
//!   segmentation across packets
//! - Optional RFC 6295 recovery journal (`journal` feature, on by default)
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rtpmidi::{ConnectionListener, RtpMidiSession};
//!
//! struct Log;
//!
//! impl ConnectionListener for Log {
//!     fn on_attached(&self, device_id: &str) {
//!         println!("attached: {device_id}");
//!     }
//!     fn on_detached(&self, device_id: &str) {
//!         println!("detached: {device_id}");
//!     }
//! }
//!
//! # async fn example() -> Result<(), rtpmidi::RtpMidiError> {
//! let session = RtpMidiSession::builder("studio", 5004)
//!     .connection_listener(Arc::new(Log))
//!     .start()
//!     .await?;
//!
//! session.connect_to_listener("192.168.1.20:5006".parse().unwrap()).await?;
//! // ... once attached:
//! // session.send_note_on(&device_id, 0, 60, 100).await?;
//! session.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Media clock
pub mod clock;
/// Error types
pub mod error;
/// Listener traits
pub mod event;
/// Wire formats
pub mod protocol;
/// Session engine and public API
pub mod session;

mod driver;
mod participant;

// Re-exports
pub use clock::MediaClock;
pub use error::{ErrorKind, Result, RtpMidiError};
pub use event::{ConnectionListener, ExceptionListener, MidiListener};
pub use participant::{InviteState, ParticipantKind, ParticipantStats};
pub use protocol::midi::MidiCommand;
pub use session::{DeviceInfo, RtpMidiSession, SessionBuilder, SessionConfig};
