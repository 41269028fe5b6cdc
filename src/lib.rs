//! # OxiTop OC110 Library
//!
//! This library talks to the OxiTop OC110 gas-pressure data logger over its
//! undocumented serial protocol, and can also pretend to be one.
//!
//! * [`ProtocolClient`] drives the logger: handshake, command exchange,
//!   checksum verification and retries.
//! * [`ProtocolServer`] emulates the logger on a background thread.
//! * [`null_modem`] joins the two in-process, with realistic timing, so
//!   neither needs hardware to be tested.
//! * [`codec`] reads and writes the logger's record format.

pub mod bottles;
pub mod client;
pub mod codec;
pub mod emulator;
pub mod error;
pub mod null_modem;
pub mod transport;

pub use bottles::{Bottle, BottleHead, BottleMode, BottleSerial};
pub use client::{ProtocolClient, SessionState, DEFAULT_RETRIES};
pub use emulator::{sample_bottles, ProtocolServer, ServerHandle};
pub use error::{Error, RecordError, Result};
pub use null_modem::{null_modem, NullModemPort};
pub use transport::{SerialSettings, SerialTransport, Transport};
