//! Per-connection bookkeeping kept by a multiplexer.

use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use crate::agent::AgentStores;
use crate::rudder::Rudder;
use crate::transporter::Transporter;
use crate::types::Result;

/// Completion callback of a write unit. Invoked at most once with the
/// outcome of the physical write.
pub type WriteCallback = Box<dyn FnOnce(&io::Result<usize>)>;

/// One queued outbound write.
pub struct WriteUnit {
    pub buf: Bytes,
    pub address: Option<SocketAddr>,
    pub tag: u64,
    on_done: Option<WriteCallback>,
}

impl WriteUnit {
    pub fn new(buf: Bytes) -> Self {
        Self {
            buf,
            address: None,
            tag: 0,
            on_done: None,
        }
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    pub fn on_done(mut self, callback: WriteCallback) -> Self {
        self.on_done = Some(callback);
        self
    }

    pub(crate) fn complete(mut self, result: &io::Result<usize>) {
        if let Some(callback) = self.on_done.take() {
            callback(result);
        }
    }
}

impl fmt::Debug for WriteUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteUnit")
            .field("len", &self.buf.len())
            .field("address", &self.address)
            .field("tag", &self.tag)
            .field("on_done", &self.on_done.is_some())
            .finish()
    }
}

/// State of one live rudder inside a multiplexer.
#[derive(Debug)]
pub struct RudderState {
    pub(crate) rudder: Rudder,
    pub(crate) transporter: Option<Transporter>,
    pub(crate) last_access: Instant,
    pub(crate) write_queue: VecDeque<WriteUnit>,
    pub(crate) reading: bool,
    pub(crate) writing: bool,
    pub(crate) suspended: bool,
    pub(crate) read_cancelled: bool,
    pub(crate) end_after_writes: bool,
    pub(crate) closing: bool,
    pub(crate) closed: bool,
}

impl RudderState {
    pub fn new(rudder: Rudder, transporter: Option<Transporter>) -> Self {
        Self {
            rudder,
            transporter,
            last_access: Instant::now(),
            write_queue: VecDeque::new(),
            reading: false,
            writing: false,
            suspended: false,
            read_cancelled: false,
            end_after_writes: false,
            closing: false,
            closed: false,
        }
    }

    pub fn rudder(&self) -> &Rudder {
        &self.rudder
    }

    pub fn transporter(&self) -> Option<&Transporter> {
        self.transporter.as_ref()
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    pub fn is_reading(&self) -> bool {
        self.reading
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn queued_writes(&self) -> usize {
        self.write_queue.len()
    }

    /// Ask the owning ship whether `elapsed_sec` of idleness is too much.
    pub fn check_timeout(&self, elapsed_sec: i64, stores: &mut AgentStores) -> Result<bool> {
        match &self.transporter {
            Some(transporter) => transporter.check_timeout(elapsed_sec, stores),
            None => Ok(false),
        }
    }
}
