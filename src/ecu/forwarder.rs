use crate::prelude::*;
use crate::error::ForwardingError;

use {
    async_trait::async_trait,
    bytes::Bytes,
    std::time::Duration,
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio::net::TcpStream,
};

pub const RESPONSE_BUFFER_SIZE: usize = 1024;

/// Relays one raw frame to the upstream collector and hands back whatever it
/// answered.
#[async_trait]
pub trait Forward: Send + Sync {
    async fn forward(&self, port: u16, payload: &[u8]) -> Result<Bytes, ForwardingError>;
}

/// Opens a fresh connection to the collector for every message; connections
/// are never reused.
#[derive(Clone, Debug)]
pub struct UpstreamForwarder {
    host: String,
    timeout: Option<Duration>,
}

impl UpstreamForwarder {
    pub fn new(host: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }

    pub fn from_config(upstream: &config::Upstream) -> Self {
        Self::new(upstream.host(), upstream.timeout())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn exchange(&self, port: u16, payload: &[u8]) -> Result<Bytes, ForwardingError> {
        let mut stream = TcpStream::connect((self.host.as_str(), port))
            .await
            .map_err(|source| ForwardingError::Connect {
                host: self.host.clone(),
                port,
                source,
            })?;

        stream.write_all(payload).await.map_err(ForwardingError::Write)?;
        stream.flush().await.map_err(ForwardingError::Write)?;

        let mut buf = [0u8; RESPONSE_BUFFER_SIZE];
        let len = stream.read(&mut buf).await.map_err(ForwardingError::Read)?;

        // closing our side is best effort, the response is already in hand
        let _ = stream.shutdown().await;

        Ok(Bytes::copy_from_slice(&buf[..len]))
    }
}

#[async_trait]
impl Forward for UpstreamForwarder {
    async fn forward(&self, port: u16, payload: &[u8]) -> Result<Bytes, ForwardingError> {
        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange(port, payload))
                .await
                .map_err(|_| ForwardingError::Timeout(limit))?,
            None => self.exchange(port, payload).await,
        }?;

        debug!("From collector {}:{} - {:?}", self.host, port, response);

        Ok(response)
    }
}
