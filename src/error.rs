use thiserror::Error;

// Startup failures are fatal: the frontend renders the message and exits
// non-zero. Everything recoverable at run time goes through the log instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not read cartridge {path}: {reason}")]
    CartridgeRead { path: String, reason: String },

    #[error("unsupported cartridge type: 0x{0:02x}")]
    UnsupportedMbc(u8),

    #[error("host video init failed: {0}")]
    HostInit(String),
}
