//! Child-side endpoint of the control channel.

use std::net::Ipv4Addr;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::frame::{read_frame, write_frame, CommandCode, CommandFrame};
use crate::types::{AgentId, Error, Result};

/// What the agent should do for a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    ReloadCert,
    PrintUsage,
    Shutdown,
    Abort,
    Fork(AgentId),
    /// Frames the monitor should never send to an agent.
    Ignore,
}

impl Directive {
    pub fn from_frame(frame: &CommandFrame) -> Self {
        match frame.cmd {
            CommandCode::ReloadCert => Directive::ReloadCert,
            CommandCode::MemUsage => Directive::PrintUsage,
            CommandCode::Shutdown => Directive::Shutdown,
            CommandCode::Abort => Directive::Abort,
            CommandCode::Fork => Directive::Fork(AgentId::new(i32::from(frame.arg1()))),
            CommandCode::Ok | CommandCode::Close => Directive::Ignore,
        }
    }

    /// Directives after which the agent is gone and answers CLOSE instead
    /// of OK.
    pub fn tears_down(self) -> bool {
        matches!(self, Directive::Shutdown | Directive::Abort)
    }
}

/// Control channel as seen by one agent.
///
/// Frames are read by a background task so that waiting for the next
/// command can be cancelled without losing a partially read frame.
#[derive(Debug)]
pub struct CommandReceiver {
    agent_id: AgentId,
    frames: mpsc::UnboundedReceiver<Result<CommandFrame>>,
    writer: OwnedWriteHalf,
    reader: AbortHandle,
    closed: bool,
}

impl CommandReceiver {
    /// Connect to the monitor listening on the loopback `monitor_port`.
    pub async fn connect(agent_id: AgentId, monitor_port: u16) -> Result<Self> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, monitor_port))
            .await
            .map_err(|e| Error::control(format!("cannot reach monitor on port {}: {}", monitor_port, e)))?;
        Self::from_stream(agent_id, stream).await
    }

    /// Take over a connected stream and send the `OK(agent_id)` handshake.
    pub async fn from_stream(agent_id: AgentId, stream: TcpStream) -> Result<Self> {
        let wire_id = u16::try_from(agent_id.get())
            .map_err(|_| Error::control(format!("agent id {} does not fit a frame", agent_id)))?;
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        write_frame(&mut writer, CommandFrame::with_arg(CommandCode::Ok, wire_id)).await?;

        let (tx, frames) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if tx.send(Ok(frame)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        });
        tracing::debug!(agent = %agent_id, "control channel up");

        Ok(Self {
            agent_id,
            frames,
            writer,
            reader: task.abort_handle(),
            closed: false,
        })
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Next command. `Ok(None)` means the monitor closed the channel.
    pub async fn recv(&mut self) -> Result<Option<CommandFrame>> {
        match self.frames.recv().await {
            Some(frame) => frame.map(Some),
            None => Ok(None),
        }
    }

    pub async fn send_ok(&mut self) -> Result<()> {
        self.send(CommandFrame::new(CommandCode::Ok)).await
    }

    /// Tell the monitor this agent is going away. Sent at most once.
    pub async fn send_close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let wire_id = u16::try_from(self.agent_id.get()).unwrap_or(0);
        self.send(CommandFrame::with_arg(CommandCode::Close, wire_id))
            .await
    }

    async fn send(&mut self, frame: CommandFrame) -> Result<()> {
        tracing::trace!(agent = %self.agent_id, frame = %frame, "control frame out");
        write_frame(&mut self.writer, frame).await
    }

    /// Shut the write side down so the monitor sees EOF.
    pub async fn finish(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

impl Drop for CommandReceiver {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn directives_follow_command_codes() {
        let fork = CommandFrame::with_arg(CommandCode::Fork, 9);
        assert_eq!(Directive::from_frame(&fork), Directive::Fork(AgentId::new(9)));
        assert_eq!(
            Directive::from_frame(&CommandFrame::new(CommandCode::MemUsage)),
            Directive::PrintUsage
        );
        assert_eq!(
            Directive::from_frame(&CommandFrame::new(CommandCode::Ok)),
            Directive::Ignore
        );
        assert!(Directive::Shutdown.tears_down());
        assert!(!Directive::ReloadCert.tears_down());
    }

    #[tokio::test]
    async fn handshake_then_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let monitor = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let hello = read_frame(&mut stream).await.unwrap().unwrap();
            write_frame(&mut stream, CommandFrame::new(CommandCode::Shutdown))
                .await
                .unwrap();
            let close = read_frame(&mut stream).await.unwrap().unwrap();
            (hello, close)
        });

        let mut receiver = CommandReceiver::connect(AgentId::new(4), port).await.unwrap();
        let frame = receiver.recv().await.unwrap().unwrap();
        assert_eq!(frame.cmd, CommandCode::Shutdown);
        receiver.send_close().await.unwrap();
        receiver.send_close().await.unwrap();

        let (hello, close) = monitor.await.unwrap();
        assert_eq!(hello, CommandFrame::with_arg(CommandCode::Ok, 4));
        assert_eq!(close, CommandFrame::with_arg(CommandCode::Close, 4));
    }
}
