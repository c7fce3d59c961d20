//! Wire protocol between the GUI client and the helper.
//!
//! A request is a one-byte [`Tag`] followed by zero or more fields. Each field
//! is an 8-byte little-endian length prefix and exactly that many raw bytes.
//! Every completed command is answered with a single signed [`Status`] byte.
//!
//! Declared lengths are checked against the configured maximum before any
//! buffer is allocated or any field byte is read.

use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix preceding every field.
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Error type for malformed or interrupted requests. Always fatal for the connection.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("unknown command tag {0}")]
    UnknownTag(u8),

    #[error("declared field length {declared} exceeds maximum {max}")]
    FieldTooLong { declared: u64, max: usize },

    #[error("timed out sending response")]
    SendTimeout,

    #[error("I/O error")]
    Io(#[from] io::Error),
}

/// Command tags understood by the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    InstallUpdate = 1,
    BlockQuic = 2,
    UnblockQuic = 3,
    StartDns = 4,
    StopDns = 5,
}

impl Tag {
    pub const fn name(self) -> &'static str {
        match self {
            Self::InstallUpdate => "install_update",
            Self::BlockQuic => "block_quic",
            Self::UnblockQuic => "unblock_quic",
            Self::StartDns => "start_dns",
            Self::StopDns => "stop_dns",
        }
    }
}

impl TryFrom<u8> for Tag {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::InstallUpdate),
            2 => Ok(Self::BlockQuic),
            3 => Ok(Self::UnblockQuic),
            4 => Ok(Self::StartDns),
            5 => Ok(Self::StopDns),
            other => Err(FramingError::UnknownTag(other)),
        }
    }
}

/// Response status codes. Negative values name a specific failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Status {
    Success = 1,
    Unset = 0,
    /// Generic failure; for InstallUpdate, removing the stale backup failed.
    Failed = -1,
    /// InstallUpdate could not move the current install aside.
    BackupFailed = -2,
    /// InstallUpdate could not move the staged install into place; the
    /// previous install was restored.
    InstallFailed = -3,
    /// As [`Status::InstallFailed`], but restoring the previous install failed too.
    RollbackFailed = -4,
}

impl Status {
    pub const fn as_byte(self) -> u8 {
        (self as i8).to_ne_bytes()[0]
    }

    pub const fn from_byte(byte: u8) -> Option<Self> {
        match i8::from_ne_bytes([byte]) {
            1 => Some(Self::Success),
            0 => Some(Self::Unset),
            -1 => Some(Self::Failed),
            -2 => Some(Self::BackupFailed),
            -3 => Some(Self::InstallFailed),
            -4 => Some(Self::RollbackFailed),
            _ => None,
        }
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Read the next command tag.
///
/// Returns `Ok(None)` when the client closed the connection cleanly.
pub async fn read_tag<R>(reader: &mut R) -> Result<Option<Tag>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let byte = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Tag::try_from(byte).map(Some)
}

/// Read one length-prefixed field of at most `max_len` bytes.
pub async fn read_field<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let declared = reader.read_u64_le().await?;
    let len = usize::try_from(declared)
        .ok()
        .filter(|len| *len <= max_len)
        .ok_or(FramingError::FieldTooLong {
            declared,
            max: max_len,
        })?;

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read one field and interpret it as a filesystem path.
pub async fn read_path<R>(reader: &mut R, max_len: usize) -> Result<PathBuf, FramingError>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_field(reader, max_len).await?;
    Ok(PathBuf::from(OsStr::from_bytes(&bytes)))
}

/// Send a status byte, giving up after `timeout`.
pub async fn write_status<W>(
    writer: &mut W,
    status: Status,
    timeout: Duration,
) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, async {
        writer.write_all(&[status.as_byte()]).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| FramingError::SendTimeout)??;
    Ok(())
}

/// A client request, encoded the way the GUI sends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Replace the installed bundle under `install_dir` with the one under `staged_dir`.
    InstallUpdate {
        staged_dir: PathBuf,
        install_dir: PathBuf,
    },
    BlockQuic,
    UnblockQuic,
    /// Start the DNS proxy shipped in `proxy_dir` and point DNS at it.
    StartDns { proxy_dir: PathBuf },
    StopDns,
}

impl Request {
    pub const fn tag(&self) -> Tag {
        match self {
            Self::InstallUpdate { .. } => Tag::InstallUpdate,
            Self::BlockQuic => Tag::BlockQuic,
            Self::UnblockQuic => Tag::UnblockQuic,
            Self::StartDns { .. } => Tag::StartDns,
            Self::StopDns => Tag::StopDns,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.tag() as u8];
        match self {
            Self::InstallUpdate {
                staged_dir,
                install_dir,
            } => {
                encode_path(&mut out, staged_dir);
                encode_path(&mut out, install_dir);
            }
            Self::StartDns { proxy_dir } => encode_path(&mut out, proxy_dir),
            Self::BlockQuic | Self::UnblockQuic | Self::StopDns => {}
        }
        out
    }
}

fn encode_path(out: &mut Vec<u8>, path: &Path) {
    encode_field(out, path.as_os_str().as_bytes());
}

/// Append a length-prefixed field to `out`.
pub fn encode_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}
