//! WHOIS wire client.
//!
//! One query is one TCP connection: send `<domain>\r\n`, read until the
//! server closes the connection or the response cap is reached. A single
//! deadline covers connect, write and all reads.

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{timeout_at, Instant},
};
use tracing::debug;

use crate::errors::MonitorError;

/// Responses are cut off at 100 KiB; registries that ramble past that point
/// have said everything the classifier needs.
const MAX_RESPONSE_SIZE: usize = 100 * 1024;

pub struct WhoisClient;

impl WhoisClient {
    pub fn new() -> Self {
        WhoisClient
    }

    /// Single WHOIS query, no retries and no referral chasing.
    pub async fn query(
        &self,
        domain: &str,
        host: &str,
        port: u16,
        query_timeout: Duration,
    ) -> Result<String, MonitorError> {
        let deadline = Instant::now() + query_timeout;

        let mut stream = timeout_at(deadline, TcpStream::connect((host, port))).await??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY on {host}: {e}");
        }

        let query_line = format!("{domain}\r\n");
        timeout_at(deadline, stream.write_all(query_line.as_bytes())).await??;

        let mut response = Vec::with_capacity(4096);
        let mut buffer = [0u8; 4096];

        loop {
            match timeout_at(deadline, stream.read(&mut buffer)).await? {
                Ok(0) => break,
                Ok(n) => {
                    response.extend_from_slice(&buffer[..n]);
                    if response.len() > MAX_RESPONSE_SIZE {
                        response.truncate(MAX_RESPONSE_SIZE);
                        break;
                    }
                }
                // A mid-stream error after partial data still yields the
                // partial body; with nothing read it is a transport failure.
                Err(e) if !response.is_empty() => {
                    debug!("read error from {host} after {} bytes: {e}", response.len());
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if response.is_empty() {
            return Err(MonitorError::EmptyResponse);
        }

        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}

impl Default for WhoisClient {
    fn default() -> Self {
        Self::new()
    }
}
