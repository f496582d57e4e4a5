//! Rudders: handles to low-level I/O endpoints.
//!
//! A rudder owns the sending side of small tokio driver tasks that perform
//! the actual socket/file operations. Requests (`req_read`, `req_write`,
//! `req_close`, `req_accept`) return immediately; results come back to the
//! agent as [`Letter`]s on its letter channel, in the order the driver
//! observed them.
//!
//! ```text
//!   Multiplexer ──req_*──▶ Rudder ──op──▶ driver task ──Letter──▶ agent loop
//! ```

mod driver;

use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::types::{Error, Result, RudderId};

/// Sender half of an agent's letter channel.
pub type LetterSender = mpsc::UnboundedSender<Letter>;

/// Event record posted by driver tasks to the agent.
pub enum Letter {
    /// A listening rudder accepted a connection.
    Accepted {
        rudder: RudderId,
        result: io::Result<(TcpStream, SocketAddr)>,
    },
    /// An outbound connect finished.
    Connected {
        rudder: RudderId,
        result: io::Result<TcpStream>,
    },
    /// A read finished. An empty buffer means end of stream.
    Read {
        rudder: RudderId,
        result: io::Result<Bytes>,
    },
    /// The in-flight write finished.
    Wrote {
        rudder: RudderId,
        result: io::Result<usize>,
    },
    /// The endpoint is closed; no further letters follow.
    Closed { rudder: RudderId },
    /// A content consumer released buffer credit; reading may resume.
    Resume { rudder: RudderId },
}

impl Letter {
    pub fn rudder(&self) -> RudderId {
        match self {
            Letter::Accepted { rudder, .. }
            | Letter::Connected { rudder, .. }
            | Letter::Read { rudder, .. }
            | Letter::Wrote { rudder, .. }
            | Letter::Closed { rudder }
            | Letter::Resume { rudder } => *rudder,
        }
    }
}

impl fmt::Debug for Letter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Letter::Accepted { rudder, result } => f
                .debug_struct("Accepted")
                .field("rudder", rudder)
                .field("peer", &result.as_ref().map(|(_, peer)| *peer))
                .finish(),
            Letter::Connected { rudder, result } => f
                .debug_struct("Connected")
                .field("rudder", rudder)
                .field("ok", &result.is_ok())
                .finish(),
            Letter::Read { rudder, result } => f
                .debug_struct("Read")
                .field("rudder", rudder)
                .field("len", &result.as_ref().map(Bytes::len))
                .finish(),
            Letter::Wrote { rudder, result } => f
                .debug_struct("Wrote")
                .field("rudder", rudder)
                .field("result", result)
                .finish(),
            Letter::Closed { rudder } => f.debug_struct("Closed").field("rudder", rudder).finish(),
            Letter::Resume { rudder } => f.debug_struct("Resume").field("rudder", rudder).finish(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum ReadOp {
    Read(usize),
    Accept,
}

#[derive(Debug)]
pub(crate) enum WriteOp {
    Write(Bytes),
    Close,
}

/// What kind of endpoint a rudder drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RudderKind {
    /// Bidirectional byte stream (accepted or connected socket, duplex pipe).
    Stream,
    /// Listening socket.
    Listener,
    /// Read-only byte source (file, generic reader).
    Source,
    /// Outbound connect in progress.
    Connecting,
}

/// Handle to one I/O endpoint.
#[derive(Debug)]
pub struct Rudder {
    id: RudderId,
    kind: RudderKind,
    peer: Option<SocketAddr>,
    letters: LetterSender,
    read_tx: Option<mpsc::UnboundedSender<ReadOp>>,
    write_tx: Option<mpsc::UnboundedSender<WriteOp>>,
    tasks: Vec<AbortHandle>,
    close_requested: bool,
}

impl Rudder {
    fn bare(id: RudderId, kind: RudderKind, peer: Option<SocketAddr>, letters: LetterSender) -> Self {
        Self {
            id,
            kind,
            peer,
            letters,
            read_tx: None,
            write_tx: None,
            tasks: Vec::new(),
            close_requested: false,
        }
    }

    /// Rudder over any bidirectional stream. Must be called inside a tokio runtime.
    pub fn stream<S>(id: RudderId, io: S, peer: Option<SocketAddr>, letters: LetterSender) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let mut rudder = Self::bare(id, RudderKind::Stream, peer, letters);
        rudder.spawn_stream(io);
        rudder
    }

    /// Rudder over a read-only byte source.
    pub fn source<R>(id: RudderId, reader: R, letters: LetterSender) -> Self
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
    {
        let mut rudder = Self::bare(id, RudderKind::Source, None, letters);
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(driver::read_loop(id, reader, read_rx, rudder.letters.clone()));
        rudder.read_tx = Some(read_tx);
        rudder.tasks.push(task.abort_handle());
        rudder
    }

    /// Rudder over a listening socket.
    pub fn listener(id: RudderId, listener: TcpListener, letters: LetterSender) -> Self {
        let peer = listener.local_addr().ok();
        let mut rudder = Self::bare(id, RudderKind::Listener, peer, letters);
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(driver::accept_loop(id, listener, read_rx, rudder.letters.clone()));
        rudder.read_tx = Some(read_tx);
        rudder.tasks.push(task.abort_handle());
        rudder
    }

    /// Rudder for an outbound connection; a `Connected` letter follows.
    pub fn connect(id: RudderId, addr: String, letters: LetterSender) -> Self {
        let mut rudder = Self::bare(id, RudderKind::Connecting, None, letters);
        let task = tokio::spawn(driver::connect(id, addr, rudder.letters.clone()));
        rudder.tasks.push(task.abort_handle());
        rudder
    }

    /// Bind a connected stream to a `Connecting` rudder.
    pub fn attach(&mut self, stream: TcpStream) -> Result<()> {
        if self.kind != RudderKind::Connecting {
            return Err(Error::sink(format!(
                "rudder {} attached while {:?}",
                self.id, self.kind
            )));
        }
        let _ = stream.set_nodelay(true);
        self.peer = stream.peer_addr().ok();
        self.kind = RudderKind::Stream;
        self.tasks.clear();
        self.spawn_stream(stream);
        Ok(())
    }

    fn spawn_stream<S>(&mut self, io: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let read_task = tokio::spawn(driver::read_loop(self.id, reader, read_rx, self.letters.clone()));
        let write_task =
            tokio::spawn(driver::write_loop(self.id, writer, write_rx, self.letters.clone()));
        self.read_tx = Some(read_tx);
        self.write_tx = Some(write_tx);
        self.tasks.push(read_task.abort_handle());
        self.tasks.push(write_task.abort_handle());
    }

    pub fn id(&self) -> RudderId {
        self.id
    }

    pub fn kind(&self) -> RudderKind {
        self.kind
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Request one read of up to `capacity` bytes.
    pub fn req_read(&self, capacity: usize) -> Result<()> {
        self.send_read(ReadOp::Read(capacity.max(1)))
    }

    /// Request one accept (listening rudders).
    pub fn req_accept(&self) -> Result<()> {
        if self.kind != RudderKind::Listener {
            return Err(Error::sink(format!("accept on non-listener rudder {}", self.id)));
        }
        self.send_read(ReadOp::Accept)
    }

    /// Request one write. The multiplexer keeps at most one in flight.
    pub fn req_write(&self, buf: Bytes) -> Result<()> {
        let tx = self
            .write_tx
            .as_ref()
            .ok_or_else(|| Error::not_connected(format!("rudder {} is not writable", self.id)))?;
        tx.send(WriteOp::Write(buf))
            .map_err(|_| Error::not_connected(format!("rudder {} writer is gone", self.id)))
    }

    /// Request close. An in-flight write is allowed to finish first; a
    /// `Closed` letter is always delivered exactly once.
    pub fn req_close(&mut self) {
        if self.close_requested {
            return;
        }
        self.close_requested = true;
        self.read_tx = None;

        let handed_to_writer = match self.write_tx.take() {
            Some(tx) => tx.send(WriteOp::Close).is_ok(),
            None => false,
        };
        if handed_to_writer {
            // writer task posts Closed after shutdown; stop the reader now
            if let Some(reader) = self.tasks.first() {
                reader.abort();
            }
        } else {
            for task in &self.tasks {
                task.abort();
            }
            let _ = self.letters.send(Letter::Closed { rudder: self.id });
        }
    }

    fn send_read(&self, op: ReadOp) -> Result<()> {
        let tx = self
            .read_tx
            .as_ref()
            .ok_or_else(|| Error::not_connected(format!("rudder {} is not readable", self.id)))?;
        tx.send(op)
            .map_err(|_| Error::not_connected(format!("rudder {} reader is gone", self.id)))
    }
}

impl Drop for Rudder {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
