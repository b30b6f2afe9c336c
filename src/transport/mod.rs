//! Card transport: the boundary between the protocol driver and a reader.
//!
//! A transport only moves bytes.  It knows nothing about keys, blocks or
//! retries; [`crate::session::TagSession`] owns all of that.
//!
//! Implementations:
//! - [`SimulatedCard`]: in-memory MIFARE Classic 1K, always available.
//! - `PcscTransport`: first PC/SC reader on the system (feature `pcsc`).

mod sim;
#[cfg(feature = "pcsc")]
mod pcsc_reader;

pub use sim::{SimImage, SimStats, SimulatedCard};
#[cfg(feature = "pcsc")]
pub use pcsc_reader::PcscTransport;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No card reader found")]
    NoReaderFound,
    #[error("Could not connect to the card: {0}")]
    Connect(String),
    #[error("Transmit failed: {0}")]
    Transmit(String),
    #[error("Transport is not connected")]
    NotConnected,
}

pub trait CardTransport {
    /// Acquire the reader and establish a card connection.
    fn connect(&mut self) -> Result<(), TransportError>;
    /// Send one command and return the raw response including the status word.
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError>;
    /// Release the card and the reader context.  Must be safe to call twice.
    fn disconnect(&mut self);
}

impl<T: CardTransport + ?Sized> CardTransport for &mut T {
    fn connect(&mut self) -> Result<(), TransportError> { (**self).connect() }
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        (**self).transmit(command)
    }
    fn disconnect(&mut self) { (**self).disconnect() }
}

impl<T: CardTransport + ?Sized> CardTransport for Box<T> {
    fn connect(&mut self) -> Result<(), TransportError> { (**self).connect() }
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        (**self).transmit(command)
    }
    fn disconnect(&mut self) { (**self).disconnect() }
}
