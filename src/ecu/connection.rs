use crate::prelude::*;
use crate::ecu::forwarder::Forward;

use {
    bytes::Bytes,
    std::io::ErrorKind,
    std::sync::{Arc, Mutex},
    std::time::Duration,
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio::net::TcpStream,
};

pub const READ_BUFFER_SIZE: usize = 1024;

/// Serves one accepted ECU socket: read a frame, relay it upstream, decode a
/// local copy, then hand the collector's answer back to the ECU.
///
/// Each cycle finishes before the next read, so an ECU is only ever served
/// at its own pace. Cloned once per connection; clones share the forwarder,
/// channels and stats.
#[derive(Clone)]
pub struct ConnectionHandler {
    decoder: MessageDecoder,
    forwarder: Option<Arc<dyn Forward>>,
    channels: Channels,
    stats: Arc<Mutex<ProxyStats>>,
    read_timeout: Option<Duration>,
}

impl ConnectionHandler {
    pub fn new(
        decoder: MessageDecoder,
        forwarder: Option<Arc<dyn Forward>>,
        channels: Channels,
        stats: Arc<Mutex<ProxyStats>>,
    ) -> Self {
        Self {
            decoder,
            forwarder,
            channels,
            stats,
            read_timeout: None,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn forwarding_enabled(&self) -> bool {
        self.forwarder.is_some()
    }

    pub async fn run(&self, mut stream: TcpStream, port: u16) -> Result<()> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            let len = match self.read(&mut stream, &mut buf).await {
                Ok(0) => {
                    debug!("ECU @ {} on port {} disconnected", peer, port);
                    break;
                }
                Ok(len) => len,
                Err(err) if is_reset(&err) => {
                    warn!("ECU @ {} on port {}: connection was reset", peer, port);
                    break;
                }
                Err(err) => bail!("read from ECU @ {} on port {} failed: {}", peer, port, err),
            };

            let frame = &buf[..len];
            debug!(
                "From ECU @ {} on port {} - {}",
                peer,
                port,
                String::from_utf8_lossy(frame)
            );
            self.count(|stats| stats.frames_received += 1);

            let response = self.forward(port, frame).await;

            // rejections only cost this frame, never the connection
            let _ = self.handle_frame(port, frame);

            if let Some(response) = response.filter(|r| !r.is_empty()) {
                match stream.write_all(&response).await {
                    Ok(()) => {}
                    Err(err) if is_reset(&err) => {
                        warn!("ECU @ {} on port {}: connection was reset", peer, port);
                        break;
                    }
                    Err(err) => bail!("write to ECU @ {} on port {} failed: {}", peer, port, err),
                }
            }
        }

        Ok(())
    }

    async fn read(&self, stream: &mut TcpStream, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, stream.read(buf))
                .await
                .map_err(|_| {
                    std::io::Error::new(
                        ErrorKind::TimedOut,
                        format!("no data received for {} seconds", limit.as_secs()),
                    )
                })?,
            None => stream.read(buf).await,
        }
    }

    async fn forward(&self, port: u16, frame: &[u8]) -> Option<Bytes> {
        let forwarder = self.forwarder.as_ref()?;

        match forwarder.forward(port, frame).await {
            Ok(response) => {
                self.count(|stats| stats.frames_forwarded += 1);
                Some(response)
            }
            Err(err) => {
                warn!("Forwarding to collector on port {} failed: {}", port, err);
                self.count(|stats| stats.forward_errors += 1);
                None
            }
        }
    }

    /// Decodes `frame` and publishes the reading on the ECU channel.
    pub fn handle_frame(&self, port: u16, frame: &[u8]) -> Result<(), RejectReason> {
        let now = chrono::Local::now().naive_local();

        let reading = match self.decoder.decode(frame, now) {
            Ok(reading) => reading,
            Err(reason) => {
                self.log_rejection(port, &reason);
                return Err(reason);
            }
        };

        info!(
            "ECU {} ({}) on port {}: {} W, {} inverters",
            reading.ecu_id,
            reading.ecu_model,
            port,
            reading.current_power,
            reading.inverters.len()
        );
        self.count(|stats| stats.readings_decoded += 1);

        if self
            .channels
            .from_ecu
            .send(ecu::ChannelData::Reading(Box::new(reading)))
            .is_err()
        {
            debug!("no receivers for ECU reading on port {}", port);
        }

        Ok(())
    }

    fn log_rejection(&self, port: u16, reason: &RejectReason) {
        match reason {
            RejectReason::NotRecognized => {
                debug!("Not interested in this message type for processing");
                self.count(|stats| stats.not_recognized += 1);
            }
            RejectReason::ChecksumMismatch { .. } => {
                warn!("Dropping frame on port {}: {}", port, reason);
                self.count(|stats| stats.checksum_errors += 1);
            }
            RejectReason::FieldParseError { .. } => {
                warn!("Dropping frame on port {}: {}", port, reason);
                self.count(|stats| stats.parse_errors += 1);
            }
            RejectReason::Stale { .. } => {
                info!("Ignoring frame on port {}: {}", port, reason);
                self.count(|stats| stats.stale_frames += 1);
            }
        }
    }

    fn count(&self, update: impl FnOnce(&mut ProxyStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }
}

fn is_reset(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}
