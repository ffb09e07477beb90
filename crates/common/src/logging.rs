//! Logging setup and payload formatting

use std::fmt::Write;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Upper bound on the number of bytes rendered by [`format_bytes`]
pub const MAX_LOGGED_BYTES: usize = 256;

/// Setup tracing subscriber for the application
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))?;

    Ok(())
}

/// Render a payload as space separated hex for trace output
///
/// Long payloads are cut at [`MAX_LOGGED_BYTES`] and suffixed with the
/// number of omitted bytes.
pub fn format_bytes(data: &[u8]) -> String {
    let shown = &data[..data.len().min(MAX_LOGGED_BYTES)];
    let mut out = String::with_capacity(shown.len() * 3 + 16);

    for (i, byte) in shown.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", byte);
    }

    if data.len() > shown.len() {
        let _ = write!(out, " ... (+{} bytes)", data.len() - shown.len());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(&[]), "");
        assert_eq!(format_bytes(&[0x01, 0xab, 0xff]), "01 AB FF");
    }

    #[test]
    fn test_format_bytes_truncates() {
        let data = vec![0u8; MAX_LOGGED_BYTES + 4];
        let text = format_bytes(&data);
        assert!(text.ends_with("(+4 bytes)"));
    }
}
