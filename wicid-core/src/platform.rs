//! Seams to the hardware and network stack
//!
//! The firmware implements these with ESP-IDF services on the device and
//! with host equivalents elsewhere. Tests use in-memory fakes.

use anyhow::Result;
use std::fmt;

pub trait HttpClient {
    /// Issue a GET. Non-2xx statuses are returned, not turned into errors.
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<Box<dyn HttpResponse>>;
}

pub trait HttpResponse {
    fn status(&self) -> u16;

    fn content_length(&self) -> Option<u64>;

    /// Read up to `buf.len()` body bytes. Returns 0 at end of body.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Read a whole body, refusing anything larger than `limit` bytes
pub fn read_body(response: &mut dyn HttpResponse, limit: usize) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = response.read(&mut buf)?;
        if n == 0 {
            return Ok(body);
        }
        if body.len() + n > limit {
            anyhow::bail!("response body exceeds {} bytes", limit);
        }
        body.extend_from_slice(&buf[..n]);
    }
}

pub trait DeviceControl {
    /// Full hardware reset so the boot pipeline runs again. Does not return on the device.
    fn hard_reset(&self, reason: &str);

    /// Stop normal operation without rebooting, leaving the device reachable for manual repair
    fn enter_safe_mode(&self, reason: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Downloading,
    Verifying,
    Unpacking,
    Installing,
    Complete,
    Error,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdatePhase::Downloading => "downloading",
            UpdatePhase::Verifying => "verifying",
            UpdatePhase::Unpacking => "unpacking",
            UpdatePhase::Installing => "installing",
            UpdatePhase::Complete => "complete",
            UpdatePhase::Error => "error",
        };
        f.write_str(name)
    }
}

/// Receives progress during long update operations (LED animation, display)
pub trait StatusIndicator {
    fn progress(&self, phase: UpdatePhase, message: &str, percent: Option<f32>);
}

/// Indicator that only logs phase messages at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogIndicator;

impl StatusIndicator for LogIndicator {
    fn progress(&self, phase: UpdatePhase, message: &str, percent: Option<f32>) {
        match percent {
            Some(pct) => log::debug!("[{}] {} ({:.0}%)", phase, message, pct),
            None => log::debug!("[{}] {}", phase, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Chunked {
        chunks: Vec<Vec<u8>>,
    }

    impl HttpResponse for Chunked {
        fn status(&self) -> u16 {
            200
        }

        fn content_length(&self) -> Option<u64> {
            None
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if self.chunks.is_empty() {
                return Ok(0);
            }
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn test_read_body_collects_chunks() {
        let mut response = Chunked {
            chunks: vec![b"{\"a\":".to_vec(), b"1}".to_vec()],
        };
        assert_eq!(read_body(&mut response, 64).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn test_read_body_enforces_limit() {
        let mut response = Chunked {
            chunks: vec![vec![b'x'; 10], vec![b'x'; 10]],
        };
        assert!(read_body(&mut response, 15).is_err());
    }
}
