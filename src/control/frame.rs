//! Control frame codec.
//!
//! Frame format (8 bytes, big-endian):
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │ cmd (2B) │ arg1(2B) │ arg2(2B) │ arg3(2B) │
//! └──────────┴──────────┴──────────┴──────────┘
//! ```

use std::fmt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::types::{Error, Result};

/// Size of one frame on the wire.
pub const FRAME_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandCode {
    Ok = 0,
    Close = 1,
    ReloadCert = 2,
    MemUsage = 3,
    Shutdown = 4,
    Abort = 5,
    Fork = 6,
}

impl CommandCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            0 => CommandCode::Ok,
            1 => CommandCode::Close,
            2 => CommandCode::ReloadCert,
            3 => CommandCode::MemUsage,
            4 => CommandCode::Shutdown,
            5 => CommandCode::Abort,
            6 => CommandCode::Fork,
            _ => return None,
        })
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandCode::Ok => "OK",
            CommandCode::Close => "CLOSE",
            CommandCode::ReloadCert => "RELOAD_CERT",
            CommandCode::MemUsage => "MEM_USAGE",
            CommandCode::Shutdown => "SHUTDOWN",
            CommandCode::Abort => "ABORT",
            CommandCode::Fork => "FORK",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub cmd: CommandCode,
    pub args: [u16; 3],
}

impl CommandFrame {
    pub fn new(cmd: CommandCode) -> Self {
        Self { cmd, args: [0; 3] }
    }

    pub fn with_arg(cmd: CommandCode, arg1: u16) -> Self {
        Self {
            cmd,
            args: [arg1, 0, 0],
        }
    }

    pub fn arg1(&self) -> u16 {
        self.args[0]
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let value = (u64::from(self.cmd as u16) << 48)
            | (u64::from(self.args[0]) << 32)
            | (u64::from(self.args[1]) << 16)
            | u64::from(self.args[2]);
        value.to_be_bytes()
    }

    pub fn decode(bytes: [u8; FRAME_LEN]) -> Result<Self> {
        let value = u64::from_be_bytes(bytes);
        let code = (value >> 48) as u16;
        let cmd = CommandCode::from_u16(code)
            .ok_or_else(|| Error::control(format!("unknown command code {}", code)))?;
        Ok(Self {
            cmd,
            args: [(value >> 32) as u16, (value >> 16) as u16, value as u16],
        })
    }
}

impl fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}, {}, {})",
            self.cmd, self.args[0], self.args[1], self.args[2]
        )
    }
}

/// Read one frame. Returns `None` on clean EOF at a frame boundary; EOF
/// inside a frame is a control error.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<CommandFrame>> {
    let mut buf = [0u8; FRAME_LEN];
    let mut filled = 0;
    while filled < FRAME_LEN {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::control(format!(
                "control frame cut short after {} of {} bytes",
                filled, FRAME_LEN
            )));
        }
        filled += n;
    }
    CommandFrame::decode(buf).map(Some)
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: CommandFrame) -> Result<()> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
