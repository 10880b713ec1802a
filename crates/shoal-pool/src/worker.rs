//! Async TCP worker for one cluster node.
//!
//! Handles connecting, the `AUTH` handshake, and sending commands as RESP
//! arrays with buffered frame parsing of the replies.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use shoal_protocol::{parse_frame, write_command, Frame};

use crate::addr::NodeAddr;
use crate::error::WorkerError;

/// A single connection to a cluster node.
///
/// One command or one pipelined batch is in flight at a time; replies are
/// read in order. Any transport or protocol failure poisons the worker
/// ([`is_dead`] returns true) so the owning pool discards it instead of
/// returning it to the idle set.
///
/// [`is_dead`]: Worker::is_dead
#[derive(Debug)]
pub struct Worker {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    dead: bool,
}

impl Worker {
    /// Connects to a node and authenticates if a password is configured.
    ///
    /// `AUTH` is sent on its own round trip, never pipelined with
    /// application traffic.
    pub async fn connect(addr: &NodeAddr, password: Option<&str>) -> Result<Self, WorkerError> {
        let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
        let mut worker = Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            dead: false,
        };

        if let Some(password) = password {
            worker.authenticate(password).await?;
        }

        debug!(%addr, "worker connected");
        Ok(worker)
    }

    /// Returns true if this worker hit a transport failure and must not
    /// be reused.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Sends one command and reads one reply.
    pub async fn query(&mut self, cmd: &[Bytes]) -> Result<Frame, WorkerError> {
        let result = self.query_inner(cmd).await;
        if result.is_err() {
            self.dead = true;
        }
        result
    }

    /// Sends a batch of commands back to back and reads one reply per
    /// command, in order.
    pub async fn pipeline(&mut self, cmds: &[Vec<Bytes>]) -> Result<Vec<Frame>, WorkerError> {
        let result = self.pipeline_inner(cmds).await;
        if result.is_err() {
            self.dead = true;
        }
        result
    }

    async fn authenticate(&mut self, password: &str) -> Result<(), WorkerError> {
        let cmd = [
            Bytes::from_static(b"AUTH"),
            Bytes::copy_from_slice(password.as_bytes()),
        ];
        match self.query(&cmd).await? {
            frame if frame.is_ok() => Ok(()),
            Frame::Error(msg) => Err(WorkerError::Auth(msg)),
            other => Err(WorkerError::Auth(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn query_inner(&mut self, cmd: &[Bytes]) -> Result<Frame, WorkerError> {
        self.write_buf.clear();
        write_command(cmd, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.read_reply().await
    }

    async fn pipeline_inner(&mut self, cmds: &[Vec<Bytes>]) -> Result<Vec<Frame>, WorkerError> {
        self.write_buf.clear();
        for cmd in cmds {
            write_command(cmd, &mut self.write_buf);
        }
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        let mut replies = Vec::with_capacity(cmds.len());
        for _ in 0..cmds.len() {
            replies.push(self.read_reply().await?);
        }
        Ok(replies)
    }

    /// Reads one complete frame, pulling more data from the socket as
    /// needed.
    async fn read_reply(&mut self) -> Result<Frame, WorkerError> {
        loop {
            if !self.read_buf.is_empty() {
                if let Some((frame, consumed)) = parse_frame(&self.read_buf)? {
                    let _ = self.read_buf.split_to(consumed);
                    return Ok(frame);
                }
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(WorkerError::Closed);
            }
        }
    }
}
