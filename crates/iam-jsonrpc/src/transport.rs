//! Length-delimited transport channel
//!
//! Each frame is a 4-byte big-endian length followed by that many payload
//! bytes. The channel never interprets payloads.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::process::Stdio;

use iam_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Default upper bound for a single frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

fn map_io(err: std::io::Error) -> Error {
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted => Error::ChannelClosed,
        _ => Error::Io(err),
    }
}

/// Reading half of a framed channel
pub struct FrameReader {
    inner: BoxedReader,
    max_frame_bytes: usize,
}

impl FrameReader {
    pub fn new<R>(reader: R, max_frame_bytes: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            inner: Box::new(reader),
            max_frame_bytes,
        }
    }

    /// Wait for one complete frame. Not cancel-safe: dropping the future
    /// mid-frame leaves the stream unaligned.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.inner.read_exact(&mut header).await.map_err(map_io)?;

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame_bytes {
            return Err(Error::protocol(
                "frame_length",
                format!("frame of {} bytes exceeds limit of {}", len, self.max_frame_bytes),
            ));
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await.map_err(map_io)?;
        Ok(payload)
    }
}

/// Writing half of a framed channel
pub struct FrameWriter {
    inner: BoxedWriter,
    max_frame_bytes: usize,
}

impl FrameWriter {
    pub fn new<W>(writer: W, max_frame_bytes: usize) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Box::new(writer),
            max_frame_bytes,
        }
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_frame_bytes || payload.len() > u32::MAX as usize {
            return Err(Error::protocol(
                "frame_length",
                format!(
                    "frame of {} bytes exceeds limit of {}",
                    payload.len(),
                    self.max_frame_bytes
                ),
            ));
        }

        let header = (payload.len() as u32).to_be_bytes();
        self.inner.write_all(&header).await.map_err(map_io)?;
        self.inner.write_all(payload).await.map_err(map_io)?;
        self.inner.flush().await.map_err(map_io)?;
        Ok(())
    }
}

/// Bidirectional framed channel to a provider
pub struct FramedChannel {
    reader: FrameReader,
    writer: FrameWriter,
    child: Option<Child>,
}

impl FramedChannel {
    pub fn new<R, W>(reader: R, writer: W, max_frame_bytes: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: FrameReader::new(reader, max_frame_bytes),
            writer: FrameWriter::new(writer, max_frame_bytes),
            child: None,
        }
    }

    /// Channel over the current process's stdin/stdout, used by provider binaries
    pub fn stdio(max_frame_bytes: usize) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), max_frame_bytes)
    }

    /// Pair of connected in-process channels: (engine side, provider side)
    pub fn duplex(max_frame_bytes: usize) -> (Self, Self) {
        let (engine, provider) = tokio::io::duplex(64 * 1024);
        let (engine_read, engine_write) = tokio::io::split(engine);
        let (provider_read, provider_write) = tokio::io::split(provider);
        (
            Self::new(engine_read, engine_write, max_frame_bytes),
            Self::new(provider_read, provider_write, max_frame_bytes),
        )
    }

    /// Spawn a provider subprocess and talk to it over its stdin/stdout
    pub fn spawn(command: &ProviderCommand, max_frame_bytes: usize) -> Result<Self> {
        info!("Starting provider: {}", command.name);

        let mut cmd = Command::new(&command.command);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::internal("Failed to open provider stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("Failed to open provider stdout"))?;

        debug!(provider = %command.name, pid = ?child.id(), "Provider process spawned");

        let mut channel = Self::new(stdout, stdin, max_frame_bytes);
        channel.child = Some(child);
        Ok(channel)
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.write_frame(payload).await
    }

    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        self.reader.read_frame().await
    }

    /// Split into halves; the child process (if any) must be kept alive by the caller
    pub fn into_parts(self) -> (FrameReader, FrameWriter, Option<Child>) {
        (self.reader, self.writer, self.child)
    }
}

/// How to launch a provider subprocess
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCommand {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables to pass to the provider
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ProviderCommand {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_the_duplex() {
        let (mut engine, mut provider) = FramedChannel::duplex(DEFAULT_MAX_FRAME_BYTES);
        engine.send(b"hello").await.unwrap();
        engine.send(b"").await.unwrap();
        assert_eq!(provider.receive().await.unwrap(), b"hello");
        assert_eq!(provider.receive().await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_closed_peer_reports_channel_closed() {
        let (engine, mut provider) = FramedChannel::duplex(DEFAULT_MAX_FRAME_BYTES);
        drop(engine);
        assert!(matches!(provider.receive().await, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut engine, _provider) = FramedChannel::duplex(8);
        match engine.send(&[0u8; 9]).await.unwrap_err() {
            Error::Protocol { field, .. } => assert_eq!(field, "frame_length"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_incoming_frame_is_rejected() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server, 4);
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        match reader.read_frame().await.unwrap_err() {
            Error::Protocol { field, .. } => assert_eq!(field, "frame_length"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_frame_reports_channel_closed() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_BYTES);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        assert!(matches!(reader.read_frame().await, Err(Error::ChannelClosed)));
    }
}
