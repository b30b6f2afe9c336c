use std::ffi::CString;

use pcsc::{Card, Context, Disposition, Protocols, Scope, ShareMode, MAX_BUFFER_SIZE};
use tracing::{debug, info, warn};

use super::{CardTransport, TransportError};

/// PC/SC reader transport (ACR122U and compatibles).
///
/// Connects to the configured reader, or to the first one listed.
pub struct PcscTransport {
    reader: Option<String>,
    ctx:    Option<Context>,
    card:   Option<Card>,
}

impl PcscTransport {
    pub fn new() -> Self {
        Self { reader: None, ctx: None, card: None }
    }

    pub fn with_reader(name: impl Into<String>) -> Self {
        Self { reader: Some(name.into()), ctx: None, card: None }
    }
}

impl Default for PcscTransport {
    fn default() -> Self { Self::new() }
}

impl CardTransport for PcscTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.disconnect();

        let ctx = Context::establish(Scope::User)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let readers = match ctx.list_readers_owned() {
            Ok(r) => r,
            Err(pcsc::Error::NoReadersAvailable) => return Err(TransportError::NoReaderFound),
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        };

        let reader = match &self.reader {
            Some(name) => {
                let wanted = CString::new(name.as_str())
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                readers.into_iter()
                    .find(|r| *r == wanted)
                    .ok_or(TransportError::NoReaderFound)?
            }
            None => readers.into_iter().next().ok_or(TransportError::NoReaderFound)?,
        };
        debug!(reader = %reader.to_string_lossy(), "connecting");

        let card = ctx.connect(&reader, ShareMode::Shared, Protocols::ANY)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(reader = %reader.to_string_lossy(), "card connected");

        self.ctx  = Some(ctx);
        self.card = Some(card);
        Ok(())
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        let card = self.card.as_ref().ok_or(TransportError::NotConnected)?;
        let mut buf = [0u8; MAX_BUFFER_SIZE];
        let resp = card.transmit(command, &mut buf)
            .map_err(|e| TransportError::Transmit(e.to_string()))?;
        Ok(resp.to_vec())
    }

    fn disconnect(&mut self) {
        if let Some(card) = self.card.take() {
            if let Err((_, e)) = card.disconnect(Disposition::LeaveCard) {
                warn!(error = %e, "card disconnect failed");
            }
        }
        if let Some(ctx) = self.ctx.take() {
            if let Err((_, e)) = ctx.release() {
                warn!(error = %e, "context release failed");
            }
        }
    }
}

impl Drop for PcscTransport {
    fn drop(&mut self) { self.disconnect(); }
}
