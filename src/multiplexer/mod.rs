//! Multiplexer: per-agent registry of live rudders.
//!
//! The multiplexer owns one [`RudderState`] per rudder, serializes writes
//! (at most one physical write in flight, FIFO completion), and turns the
//! letters posted by rudder driver tasks into transporter callbacks.
//!
//! Two read strategies are supported:
//!
//! - **Valve**: a transporter may answer `Suspend` to a read; the rudder
//!   stays quiet until `resume_read` (or a `Resume` letter) reopens it.
//! - **Pigeon**: reads are always re-armed; backpressure is left to the
//!   ship.

mod state;

pub use state::{RudderState, WriteCallback, WriteUnit};

use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};

use crate::agent::AgentStores;
use crate::rudder::{Letter, LetterSender, Rudder};
use crate::transporter::{NextAction, Transporter};
use crate::types::{AgentId, Error, MultiplexerKind, Result, RudderId};

#[derive(Debug)]
pub struct Multiplexer {
    agent_id: AgentId,
    kind: MultiplexerKind,
    states: HashMap<RudderId, RudderState>,
    letters: LetterSender,
    last_rudder_id: u64,
    read_buffer_size: usize,
}

impl Multiplexer {
    pub fn new(
        agent_id: AgentId,
        kind: MultiplexerKind,
        letters: LetterSender,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            agent_id,
            kind,
            states: HashMap::new(),
            letters,
            last_rudder_id: 0,
            read_buffer_size,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn kind(&self) -> MultiplexerKind {
        self.kind
    }

    /// Sender for letters addressed to this multiplexer's agent.
    pub fn letters(&self) -> LetterSender {
        self.letters.clone()
    }

    pub fn next_rudder_id(&mut self) -> RudderId {
        self.last_rudder_id += 1;
        RudderId::new(self.last_rudder_id)
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Register a rudder. Registering the same rudder twice is an invariant
    /// violation.
    pub fn add_rudder_state(&mut self, rudder: Rudder, transporter: Option<Transporter>) -> Result<()> {
        let id = rudder.id();
        if self.states.contains_key(&id) {
            return Err(Error::sink(format!("rudder {} registered twice", id)));
        }
        tracing::trace!(agent = %self.agent_id, rudder = %id, "rudder added");
        self.states.insert(id, RudderState::new(rudder, transporter));
        Ok(())
    }

    pub fn remove_rudder_state(&mut self, id: RudderId) -> Option<RudderState> {
        self.states.remove(&id)
    }

    pub fn get_rudder_state(&self, id: RudderId) -> Option<&RudderState> {
        self.states.get(&id)
    }

    pub fn rudder_count(&self) -> usize {
        self.states.len()
    }

    /// Register a listening socket and arm its first accept.
    pub fn add_listener(&mut self, listener: TcpListener) -> Result<RudderId> {
        let id = self.next_rudder_id();
        let rudder = Rudder::listener(id, listener, self.letters());
        self.add_rudder_state(rudder, None)?;
        self.req_accept(id)?;
        Ok(id)
    }

    // =========================================================================
    // Requests
    // =========================================================================

    pub fn req_accept(&mut self, id: RudderId) -> Result<()> {
        let state = self.state_mut(id)?;
        if state.closing {
            return Ok(());
        }
        state.rudder.req_accept()
    }

    /// Start an outbound connection on a rudder id taken from
    /// `next_rudder_id`. The transporter receives `on_connect` once the
    /// stream is up, then reads start automatically.
    pub fn req_connect(&mut self, id: RudderId, addr: String, transporter: Transporter) -> Result<()> {
        tracing::debug!(agent = %self.agent_id, rudder = %id, addr = %addr, "connecting");
        let rudder = Rudder::connect(id, addr, self.letters());
        self.add_rudder_state(rudder, Some(transporter))
    }

    /// Arm one read. Does nothing while a read is already outstanding.
    pub fn req_read(&mut self, id: RudderId) -> Result<()> {
        let size = self.read_buffer_size;
        let state = self.state_mut(id)?;
        if state.closing || state.reading {
            return Ok(());
        }
        state.suspended = false;
        state.read_cancelled = false;
        state.reading = true;
        if let Err(e) = state.rudder.req_read(size) {
            state.reading = false;
            return Err(e);
        }
        Ok(())
    }

    /// Queue a write. Units complete in submission order.
    ///
    /// Writes to a closing rudder are dropped silently; writes to an unknown
    /// rudder fail with `NotConnected`.
    pub fn req_write(&mut self, id: RudderId, unit: WriteUnit) -> Result<()> {
        let state = self.state_mut(id)?;
        if state.closing {
            tracing::debug!(rudder = %id, len = unit.buf.len(), "write to closing rudder dropped");
            return Ok(());
        }
        state.last_access = Instant::now();
        state.write_queue.push_back(unit);
        self.next_write(id)
    }

    /// Shorthand for a write without address, tag or callback.
    pub fn write(&mut self, id: RudderId, buf: Bytes) -> Result<()> {
        self.req_write(id, WriteUnit::new(buf))
    }

    /// Close once every queued write has been issued and completed.
    pub fn req_end(&mut self, id: RudderId) -> Result<()> {
        let state = self.state_mut(id)?;
        if state.closing {
            return Ok(());
        }
        if state.write_queue.is_empty() && !state.writing {
            self.req_close(id);
        } else {
            state.end_after_writes = true;
        }
        Ok(())
    }

    /// Close now. Units not yet handed to the driver are dropped without
    /// completion; the in-flight unit completes when the `Closed` letter
    /// arrives. Closing twice is a no-op.
    pub fn req_close(&mut self, id: RudderId) {
        let Some(state) = self.states.get_mut(&id) else {
            return;
        };
        if state.closing {
            return;
        }
        state.closing = true;
        let keep = usize::from(state.writing);
        let dropped = state.write_queue.len().saturating_sub(keep);
        state.write_queue.truncate(keep);
        if dropped > 0 {
            tracing::debug!(rudder = %id, dropped, "unissued writes dropped on close");
        }
        state.rudder.req_close();
    }

    /// Stop re-arming reads until `resume_read`.
    pub fn suspend_read(&mut self, id: RudderId) -> Result<()> {
        let state = self.state_mut(id)?;
        state.suspended = true;
        Ok(())
    }

    /// Re-arm reads on a suspended rudder. Does nothing otherwise.
    pub fn resume_read(&mut self, id: RudderId) -> Result<()> {
        let suspended = self
            .states
            .get(&id)
            .is_some_and(|state| state.suspended && !state.closing);
        if !suspended {
            return Ok(());
        }
        tracing::trace!(rudder = %id, "read resumed");
        self.req_read(id)
    }

    /// Discard the outstanding read's result and stop reading.
    pub fn cancel_read(&mut self, id: RudderId) -> Result<()> {
        let state = self.state_mut(id)?;
        state.read_cancelled = true;
        Ok(())
    }

    /// Drop queued writes that have not been handed to the driver yet.
    pub fn cancel_write(&mut self, id: RudderId) -> Result<()> {
        let state = self.state_mut(id)?;
        let keep = usize::from(state.writing);
        state.write_queue.truncate(keep);
        Ok(())
    }

    /// Close every rudder and forget them. Used when the agent stops.
    pub fn close_all(&mut self) {
        for (id, mut state) in self.states.drain() {
            tracing::trace!(rudder = %id, "closing on shutdown");
            state.rudder.req_close();
        }
    }

    // =========================================================================
    // Letters
    // =========================================================================

    /// Route one letter. `Accepted` letters belong to the agent and are
    /// ignored here.
    pub fn dispatch(&mut self, letter: Letter, stores: &mut AgentStores) -> Result<()> {
        match letter {
            Letter::Read { rudder, result } => self.on_read(rudder, result, stores),
            Letter::Wrote { rudder, result } => self.on_wrote(rudder, result, stores),
            Letter::Connected { rudder, result } => self.on_connected(rudder, result, stores),
            Letter::Closed { rudder } => self.on_closed(rudder, stores),
            Letter::Resume { rudder } => self.on_resume(rudder, stores),
            Letter::Accepted { rudder, .. } => {
                tracing::warn!(rudder = %rudder, "accept letter reached the multiplexer");
                Ok(())
            }
        }
    }

    fn on_read(
        &mut self,
        id: RudderId,
        result: io::Result<Bytes>,
        stores: &mut AgentStores,
    ) -> Result<()> {
        let Some(state) = self.states.get_mut(&id) else {
            return Ok(());
        };
        state.reading = false;
        if state.closing || state.read_cancelled {
            return Ok(());
        }
        state.last_access = Instant::now();
        let Some(mut transporter) = state.transporter.take() else {
            return Ok(());
        };

        let (outcome, eof) = match result {
            Ok(buf) => {
                let eof = buf.is_empty();
                (transporter.on_read(id, buf, self, stores), eof)
            }
            Err(e) => (
                transporter
                    .on_error(id, e, self, stores)
                    .map(|()| NextAction::Close),
                true,
            ),
        };
        self.restore_transporter(id, transporter);

        match outcome? {
            // queued responses still go out before the close
            NextAction::Close => self.req_end(id)?,
            _ if eof => {}
            NextAction::Suspend if self.kind == MultiplexerKind::Valve => {
                self.suspend_read(id)?;
            }
            NextAction::Continue | NextAction::Suspend => self.req_read(id)?,
        }
        Ok(())
    }

    /// Let the ship handle what it queued, then reopen a suspended read.
    fn on_resume(&mut self, id: RudderId, stores: &mut AgentStores) -> Result<()> {
        let Some(state) = self.states.get_mut(&id) else {
            return Ok(());
        };
        if state.closing {
            return Ok(());
        }
        let Some(mut transporter) = state.transporter.take() else {
            return self.resume_read(id);
        };
        let outcome = transporter.on_resume(id, self, stores);
        self.restore_transporter(id, transporter);

        match outcome? {
            NextAction::Close => self.req_end(id),
            NextAction::Suspend => Ok(()),
            NextAction::Continue => self.resume_read(id),
        }
    }

    fn on_wrote(
        &mut self,
        id: RudderId,
        result: io::Result<usize>,
        stores: &mut AgentStores,
    ) -> Result<()> {
        let Some(state) = self.states.get_mut(&id) else {
            return Ok(());
        };
        state.writing = false;
        state.last_access = Instant::now();
        if let Some(unit) = state.write_queue.pop_front() {
            unit.complete(&result);
        }

        match result {
            Ok(_) => self.next_write(id),
            Err(e) => {
                tracing::debug!(rudder = %id, "write failed: {}", e);
                let transporter = state.transporter.take();
                let outcome = match transporter {
                    Some(mut transporter) => {
                        let outcome = transporter.on_error(id, e, self, stores);
                        self.restore_transporter(id, transporter);
                        outcome
                    }
                    None => Ok(()),
                };
                self.req_close(id);
                outcome
            }
        }
    }

    fn on_connected(
        &mut self,
        id: RudderId,
        result: io::Result<TcpStream>,
        stores: &mut AgentStores,
    ) -> Result<()> {
        let Some(state) = self.states.get_mut(&id) else {
            return Ok(());
        };
        if state.closing {
            return Ok(());
        }
        let mut transporter = state.transporter.take();

        let outcome = match result {
            Ok(stream) => match state.rudder.attach(stream) {
                Ok(()) => {
                    state.last_access = Instant::now();
                    match transporter.as_mut() {
                        Some(t) => t.on_connect(id, self, stores),
                        None => Ok(NextAction::Continue),
                    }
                }
                Err(e) => Err(e),
            },
            Err(e) => {
                tracing::debug!(rudder = %id, "connect failed: {}", e);
                match transporter.as_mut() {
                    Some(t) => t.on_error(id, e, self, stores).map(|()| NextAction::Close),
                    None => Ok(NextAction::Close),
                }
            }
        };
        if let Some(transporter) = transporter {
            self.restore_transporter(id, transporter);
        }

        match outcome? {
            NextAction::Close => self.req_close(id),
            NextAction::Continue | NextAction::Suspend => {
                self.next_write(id)?;
                self.req_read(id)?;
            }
        }
        Ok(())
    }

    fn on_closed(&mut self, id: RudderId, stores: &mut AgentStores) -> Result<()> {
        let Some(mut state) = self.states.remove(&id) else {
            return Ok(());
        };
        state.closed = true;
        if state.writing {
            if let Some(unit) = state.write_queue.pop_front() {
                let aborted = io::Error::new(io::ErrorKind::ConnectionAborted, "rudder closed");
                unit.complete(&Err(aborted));
            }
        }
        state.write_queue.clear();
        tracing::trace!(agent = %self.agent_id, rudder = %id, "rudder closed");

        match state.transporter.take() {
            Some(mut transporter) => transporter.on_closed(id, self, stores),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Timeouts
    // =========================================================================

    /// Close every rudder whose ship reports a timeout. Returns the closed ids.
    pub fn check_timeouts(&mut self, now: Instant, stores: &mut AgentStores) -> Result<Vec<RudderId>> {
        let mut expired = Vec::new();
        for (id, state) in &self.states {
            if state.closing {
                continue;
            }
            let elapsed = now.saturating_duration_since(state.last_access).as_secs();
            let elapsed = i64::try_from(elapsed).unwrap_or(i64::MAX);
            if state.check_timeout(elapsed, stores)? {
                expired.push(*id);
            }
        }
        for id in &expired {
            tracing::debug!(agent = %self.agent_id, rudder = %id, "rudder timed out");
            self.req_close(*id);
        }
        Ok(expired)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn state_mut(&mut self, id: RudderId) -> Result<&mut RudderState> {
        self.states
            .get_mut(&id)
            .ok_or_else(|| Error::not_connected(format!("rudder {} is not registered", id)))
    }

    fn restore_transporter(&mut self, id: RudderId, transporter: Transporter) {
        if let Some(state) = self.states.get_mut(&id) {
            if state.transporter.is_none() {
                state.transporter = Some(transporter);
            }
        }
    }

    fn next_write(&mut self, id: RudderId) -> Result<()> {
        let close = {
            let state = self.state_mut(id)?;
            if state.writing || state.closing {
                return Ok(());
            }
            match state.write_queue.front() {
                Some(unit) => {
                    let buf = unit.buf.clone();
                    state.writing = true;
                    if let Err(e) = state.rudder.req_write(buf) {
                        state.writing = false;
                        return Err(e);
                    }
                    false
                }
                None => state.end_after_writes,
            }
        };
        if close {
            self.req_close(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{ConfiguredPort, Port, RouteCity};
    use crate::rudder::RudderKind;
    use crate::tour::IdCheck;
    use crate::types::{AgentConfig, ObjectId, PortConfig};
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    fn mux(letters: LetterSender) -> Multiplexer {
        Multiplexer::new(AgentId::new(1), MultiplexerKind::Valve, letters, 64)
    }

    fn stores() -> AgentStores {
        AgentStores::new(AgentId::new(1), &AgentConfig::default())
    }

    fn recorder(log: &Rc<RefCell<Vec<u64>>>, tag: u64) -> WriteCallback {
        let log = Rc::clone(log);
        Box::new(move |result: &io::Result<usize>| {
            if result.is_ok() {
                log.borrow_mut().push(tag);
            }
        })
    }

    async fn write_in_order(chunks: Vec<Vec<u8>>) -> (Vec<u64>, Vec<u8>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mux = mux(tx.clone());
        let mut stores = stores();
        let (ours, mut theirs) = tokio::io::duplex(1 << 16);
        let id = mux.next_rudder_id();
        mux.add_rudder_state(Rudder::stream(id, ours, None, tx.clone()), None)
            .unwrap();

        let completed = Rc::new(RefCell::new(Vec::new()));
        let mut expected_len = 0;
        for (tag, chunk) in chunks.into_iter().enumerate() {
            expected_len += chunk.len();
            let unit = WriteUnit::new(Bytes::from(chunk))
                .with_tag(tag as u64)
                .on_done(recorder(&completed, tag as u64));
            mux.req_write(id, unit).unwrap();
        }
        mux.req_end(id).unwrap();

        loop {
            let letter = rx.recv().await.unwrap();
            let closed = matches!(letter, Letter::Closed { .. });
            mux.dispatch(letter, &mut stores).unwrap();
            if closed {
                break;
            }
        }
        let mut received = Vec::new();
        theirs.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), expected_len);
        let order = completed.borrow().clone();
        (order, received)
    }

    #[tokio::test]
    async fn writes_complete_in_submission_order() {
        let chunks = vec![b"one ".to_vec(), b"two ".to_vec(), b"three".to_vec()];
        let (order, received) = write_in_order(chunks).await;
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(received, b"one two three");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn fifo_completion_for_any_chunking(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..12)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let expected: Vec<u8> = chunks.concat();
            let n = chunks.len() as u64;
            let (order, received) = rt.block_on(write_in_order(chunks));
            prop_assert_eq!(order, (0..n).collect::<Vec<_>>());
            prop_assert_eq!(received, expected);
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_fatal() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mux = mux(tx.clone());
        let (a, _a) = tokio::io::duplex(64);
        let (b, _b) = tokio::io::duplex(64);
        let id = mux.next_rudder_id();
        mux.add_rudder_state(Rudder::stream(id, a, None, tx.clone()), None)
            .unwrap();
        let err = mux
            .add_rudder_state(Rudder::stream(id, b, None, tx.clone()), None)
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(mux.rudder_count(), 1);
    }

    #[tokio::test]
    async fn write_to_unknown_rudder_is_not_connected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mux = mux(tx);
        let err = mux
            .write(RudderId::new(42), Bytes::from_static(b"x"))
            .unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::NotConnected));
    }

    #[tokio::test]
    async fn close_drops_unissued_writes_and_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mux = mux(tx.clone());
        let mut stores = stores();
        let (ours, _theirs) = tokio::io::duplex(1 << 10);
        let id = mux.next_rudder_id();
        mux.add_rudder_state(Rudder::stream(id, ours, None, tx.clone()), None)
            .unwrap();

        let completed = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..3 {
            let unit = WriteUnit::new(Bytes::from_static(b"data")).on_done(recorder(&completed, tag));
            mux.req_write(id, unit).unwrap();
        }
        assert_eq!(mux.get_rudder_state(id).unwrap().queued_writes(), 3);
        mux.req_close(id);
        mux.req_close(id);
        assert_eq!(mux.get_rudder_state(id).unwrap().queued_writes(), 1);
        // writes after close are dropped
        mux.write(id, Bytes::from_static(b"late")).unwrap();
        assert_eq!(mux.get_rudder_state(id).unwrap().queued_writes(), 1);

        let mut closed = 0;
        while let Some(letter) = rx.recv().await {
            let is_closed = matches!(letter, Letter::Closed { .. });
            mux.dispatch(letter, &mut stores).unwrap();
            if is_closed {
                closed += 1;
                break;
            }
        }
        assert_eq!(closed, 1);
        assert!(mux.get_rudder_state(id).is_none());
        assert!(completed.borrow().len() <= 1);
    }

    #[tokio::test]
    async fn resume_only_acts_on_suspended_rudders() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mux = mux(tx.clone());
        let (ours, _theirs) = tokio::io::duplex(64);
        let id = mux.next_rudder_id();
        mux.add_rudder_state(Rudder::stream(id, ours, None, tx.clone()), None)
            .unwrap();
        assert_eq!(mux.get_rudder_state(id).unwrap().rudder().kind(), RudderKind::Stream);

        mux.resume_read(id).unwrap();
        assert!(!mux.get_rudder_state(id).unwrap().is_reading());

        mux.suspend_read(id).unwrap();
        mux.resume_read(id).unwrap();
        let state = mux.get_rudder_state(id).unwrap();
        assert!(state.is_reading());
        assert!(!state.is_suspended());

        // a second arm while one is outstanding is a no-op
        mux.req_read(id).unwrap();
        assert!(mux.get_rudder_state(id).unwrap().is_reading());
    }

    fn test_port() -> Arc<dyn Port> {
        let config = PortConfig {
            addr: "127.0.0.1:0".into(),
            protocol: "h1".into(),
            secure: false,
            permit: Vec::new(),
            lenient: false,
        };
        Arc::new(ConfiguredPort::new(&config, Arc::new(RouteCity::from_config(None))).unwrap())
    }

    /// Feed a pipelined request through a byte source while the ship still
    /// has a warp tour in flight, so the ship asks to suspend.
    async fn read_behind_a_busy_tour(kind: MultiplexerKind) -> (Multiplexer, AgentStores, RudderId) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mux = Multiplexer::new(AgentId::new(1), kind, tx.clone(), 64);
        let mut stores = stores();
        let port = test_port();
        let id = mux.next_rudder_id();
        let ship = stores.open_inbound(id, &port, None).unwrap();
        stores
            .with_inbound(ship, |s, stores| {
                let key = s.get_tour(&mut stores.tours, 1, false, true)?.unwrap();
                let tour = stores.tours.get_mut(key).unwrap();
                tour.set_warp(ObjectId::new(0));
                tour.go(IdCheck::NoCheck)
            })
            .unwrap()
            .unwrap();

        let source = std::io::Cursor::new(b"GET /next HTTP/1.1\r\nHost: x\r\n\r\n".to_vec());
        mux.add_rudder_state(Rudder::source(id, source, tx.clone()), Some(port.create_transporter(ship)))
            .unwrap();
        assert_eq!(mux.get_rudder_state(id).unwrap().rudder().kind(), RudderKind::Source);
        mux.req_read(id).unwrap();

        let letter = rx.recv().await.unwrap();
        assert!(matches!(letter, Letter::Read { ref result, .. } if result.as_ref().is_ok_and(|b| !b.is_empty())));
        mux.dispatch(letter, &mut stores).unwrap();
        (mux, stores, id)
    }

    #[tokio::test]
    async fn valve_arms_no_read_while_suspended() {
        let (mut mux, mut stores, id) = read_behind_a_busy_tour(MultiplexerKind::Valve).await;
        let state = mux.get_rudder_state(id).unwrap();
        assert!(state.is_suspended());
        assert!(!state.is_reading());

        // the ship still has the earlier tour in flight, so nothing reopens
        mux.dispatch(Letter::Resume { rudder: id }, &mut stores).unwrap();
        let state = mux.get_rudder_state(id).unwrap();
        assert!(state.is_suspended());
        assert!(!state.is_reading());
    }

    #[tokio::test]
    async fn pigeon_rearms_reads_after_suspend() {
        let (mux, _stores, id) = read_behind_a_busy_tour(MultiplexerKind::Pigeon).await;
        let state = mux.get_rudder_state(id).unwrap();
        assert!(!state.is_suspended());
        assert!(state.is_reading());
    }
}
