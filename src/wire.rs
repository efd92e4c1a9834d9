//! Binary protocol spoken with the replicas of the replicated core.
//!
//! Every field is little-endian. A proposal is prefixed by an opcode byte, replies are not.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROPOSE: u8 = 0;

const OP_PUT: u8 = 1;
const OP_GET: u8 = 2;

const PROPOSE_LEN: usize = 4 + 1 + 8 + 8 + 8;
const REPLY_LEN: usize = 1 + 4 + 8 + 8;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection closed")]
    Closed,
    #[error("negative acknowledgment for command {0}")]
    NegativeAck(i32),
    #[error("unexpected opcode {0}")]
    UnknownOpcode(u8),
    #[error("unknown operation {0}")]
    UnknownOperation(u8),
    #[error("io: {0}")]
    Io(io::Error),
}

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            WireError::Closed
        } else {
            WireError::Io(err)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
}

impl OpKind {
    fn code(self) -> u8 {
        match self {
            OpKind::Write => OP_PUT,
            OpKind::Read => OP_GET,
        }
    }

    fn from_code(code: u8) -> Result<Self, WireError> {
        match code {
            OP_PUT => Ok(OpKind::Write),
            OP_GET => Ok(OpKind::Read),
            other => Err(WireError::UnknownOperation(other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Propose {
    pub command_id: i32,
    pub op: OpKind,
    pub key: i64,
    pub value: i64,
    pub timestamp: i64,
}

impl Propose {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(PROPOSE);
        buf.extend_from_slice(&self.command_id.to_le_bytes());
        buf.push(self.op.code());
        buf.extend_from_slice(&self.key.to_le_bytes());
        buf.extend_from_slice(&self.value.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
    }

    /// Writes the proposal and flushes the writer.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), WireError> {
        let mut buf = Vec::with_capacity(1 + PROPOSE_LEN);
        self.encode(&mut buf);
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }

    /// Reads a proposal including its opcode, as a replica would.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, WireError> {
        let opcode = r.read_u8().await?;
        if opcode != PROPOSE {
            return Err(WireError::UnknownOpcode(opcode));
        }
        Ok(Propose {
            command_id: r.read_i32_le().await?,
            op: OpKind::from_code(r.read_u8().await?)?,
            key: r.read_i64_le().await?,
            value: r.read_i64_le().await?,
            timestamp: r.read_i64_le().await?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposeReply {
    pub ok: bool,
    pub command_id: i32,
    pub value: i64,
    pub timestamp: i64,
}

impl ProposeReply {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.ok as u8);
        buf.extend_from_slice(&self.command_id.to_le_bytes());
        buf.extend_from_slice(&self.value.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), WireError> {
        let mut buf = Vec::with_capacity(REPLY_LEN);
        self.encode(&mut buf);
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }

    /// Reads one reply. A reply with the ok flag cleared is turned into
    /// [`WireError::NegativeAck`].
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, WireError> {
        let reply = ProposeReply {
            ok: r.read_u8().await? != 0,
            command_id: r.read_i32_le().await?,
            value: r.read_i64_le().await?,
            timestamp: r.read_i64_le().await?,
        };
        if !reply.ok {
            return Err(WireError::NegativeAck(reply.command_id));
        }
        Ok(reply)
    }
}
