//! Receiving half of a session.
//!
//! Envelopes are handed to [`InboundPipe::deliver`] by the dispatch worker in
//! counter order; a single consumer thread pulls the reassembled stream back
//! out through [`InboundPipe::read_event`] or the [`InboundStream`] adapter.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::envelope::Metadata;
use crate::error::ProtocolError;
use crate::payload::{self, Item};

/// Outcome of one read from an [`InboundPipe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEvent {
    /// This many bytes were copied into the caller's buffer.
    Data(usize),
    /// A keep-alive was consumed; nothing to do, read again.
    Noop,
    /// The producer flushed here; the consumer should flush its own sink.
    Flush,
    /// The stream is over. Every later read returns `Eof` as well.
    Eof,
}

pub struct InboundPipe {
    session_id: String,
    read_timeout: Option<Duration>,
    state: Mutex<InboundState>,
    ready: Condvar,
}

#[derive(Default)]
struct InboundState {
    queue: VecDeque<Item>,
    /// Chunk currently being handed out, and how much of it is consumed.
    partial: Vec<u8>,
    partial_pos: usize,
    next_counter: u64,
    metadata: Option<Metadata>,
    /// CLOSE has been enqueued by the peer.
    close_received: bool,
    /// CLOSE has been read by the consumer.
    eof: bool,
    /// The local consumer gave up.
    closed: bool,
    failure: Option<ProtocolError>,
}

impl InboundPipe {
    pub fn new(session_id: impl Into<String>, read_timeout: Option<Duration>) -> Self {
        Self {
            session_id: session_id.into(),
            read_timeout,
            state: Mutex::new(InboundState::default()),
            ready: Condvar::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn lock(&self) -> MutexGuard<'_, InboundState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, InboundState>,
        deadline: Option<Instant>,
    ) -> io::Result<MutexGuard<'a, InboundState>> {
        let Some(deadline) = deadline else {
            return Ok(self.ready.wait(guard).unwrap_or_else(PoisonError::into_inner));
        };
        let now = Instant::now();
        if now >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("session {}: read timed out", self.session_id),
            ));
        }
        let (guard, _) = self
            .ready
            .wait_timeout(guard, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
        Ok(guard)
    }

    fn deadline(&self) -> Option<Instant> {
        self.read_timeout.map(|t| Instant::now() + t)
    }

    /// Appends one envelope's payload. Never blocks on the consumer.
    ///
    /// A counter gap or a misplaced CLOSE fails the session: the error is
    /// returned here and handed to the consumer once the valid prefix is read.
    /// Deliveries after a local `close()` are dropped silently.
    pub fn deliver(
        &self,
        counter: u64,
        metadata: Option<Metadata>,
        payload: Vec<Item>,
    ) -> Result<(), ProtocolError> {
        let mut st = self.lock();
        if st.closed {
            crate::logging::debug(format!(
                "inbound drop after local close: session={} counter={counter}",
                self.session_id
            ));
            return Ok(());
        }
        if st.close_received {
            return Err(ProtocolError::DataAfterClose {
                session: self.session_id.clone(),
                counter,
            });
        }
        if let Some(err) = &st.failure {
            return Err(err.clone());
        }

        let violation = if counter != st.next_counter {
            Some(ProtocolError::CounterMismatch {
                session: self.session_id.clone(),
                expected: st.next_counter,
                got: counter,
            })
        } else {
            payload::misplaced_close(&payload).map(|index| ProtocolError::CloseNotLast {
                session: self.session_id.clone(),
                index,
            })
        };
        if let Some(err) = violation {
            st.failure = Some(err.clone());
            drop(st);
            self.ready.notify_all();
            return Err(err);
        }

        if counter == 0 {
            st.metadata = Some(metadata.unwrap_or_default());
        }
        st.next_counter += 1;
        st.close_received = payload::is_terminal(&payload);
        st.queue.extend(payload);
        drop(st);
        self.ready.notify_all();
        Ok(())
    }

    /// Blocks until bytes, a token or end-of-stream is available.
    pub fn read_event(&self, buf: &mut [u8]) -> io::Result<ReadEvent> {
        if buf.is_empty() {
            return Ok(ReadEvent::Data(0));
        }
        let deadline = self.deadline();
        let mut st = self.lock();
        loop {
            if st.closed || st.eof {
                return Ok(ReadEvent::Eof);
            }
            {
                let InboundState {
                    partial,
                    partial_pos,
                    ..
                } = &mut *st;
                if *partial_pos < partial.len() {
                    let n = buf.len().min(partial.len() - *partial_pos);
                    buf[..n].copy_from_slice(&partial[*partial_pos..*partial_pos + n]);
                    *partial_pos += n;
                    if *partial_pos == partial.len() {
                        partial.clear();
                        *partial_pos = 0;
                    }
                    return Ok(ReadEvent::Data(n));
                }
            }
            match st.queue.pop_front() {
                Some(Item::Chunk(bytes)) => {
                    st.partial = bytes;
                    st.partial_pos = 0;
                }
                Some(Item::Noop) => return Ok(ReadEvent::Noop),
                Some(Item::Flush) => return Ok(ReadEvent::Flush),
                Some(Item::Close) => {
                    st.eof = true;
                    return Ok(ReadEvent::Eof);
                }
                None => {
                    if let Some(err) = &st.failure {
                        return Err(err.clone().into());
                    }
                    st = self.wait(st, deadline)?;
                }
            }
        }
    }

    /// Reads a single byte, skipping tokens. `None` means end-of-stream.
    pub fn read_byte(&self) -> io::Result<Option<u8>> {
        let mut one = [0u8; 1];
        loop {
            match self.read_event(&mut one)? {
                ReadEvent::Data(_) => return Ok(Some(one[0])),
                ReadEvent::Eof => return Ok(None),
                ReadEvent::Noop | ReadEvent::Flush => {}
            }
        }
    }

    /// Blocks until the counter-0 metadata arrives.
    ///
    /// Returns `None` if the pipe closes first.
    pub fn metadata(&self) -> io::Result<Option<Metadata>> {
        let deadline = self.deadline();
        let mut st = self.lock();
        loop {
            if let Some(meta) = &st.metadata {
                return Ok(Some(meta.clone()));
            }
            if st.closed || st.eof || st.close_received {
                return Ok(None);
            }
            if let Some(err) = &st.failure {
                return Err(err.clone().into());
            }
            st = self.wait(st, deadline)?;
        }
    }

    /// Local consumer gives up: drops buffered data and wakes all waiters.
    pub fn close(&self) {
        let mut st = self.lock();
        st.closed = true;
        st.queue.clear();
        st.partial.clear();
        st.partial_pos = 0;
        drop(st);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn close_received(&self) -> bool {
        self.lock().close_received
    }

    /// Number of envelopes accepted so far.
    pub fn received(&self) -> u64 {
        self.lock().next_counter
    }

    pub fn failure(&self) -> Option<ProtocolError> {
        self.lock().failure.clone()
    }

    /// No further deliveries can change what the consumer will see.
    pub fn is_terminated(&self) -> bool {
        let st = self.lock();
        st.closed || st.close_received || st.failure.is_some()
    }

    /// Application bytes buffered and not yet read.
    pub fn available(&self) -> usize {
        let st = self.lock();
        st.partial.len() - st.partial_pos + st.queue.iter().map(Item::data_len).sum::<usize>()
    }
}

/// `io::Read` view of an inbound pipe. NOOP and FLUSH are skipped.
#[derive(Clone)]
pub struct InboundStream {
    pipe: Arc<InboundPipe>,
}

impl InboundStream {
    pub fn new(pipe: Arc<InboundPipe>) -> Self {
        Self { pipe }
    }

    pub fn pipe(&self) -> &Arc<InboundPipe> {
        &self.pipe
    }
}

impl io::Read for InboundStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.pipe.read_event(buf)? {
                ReadEvent::Data(n) => return Ok(n),
                ReadEvent::Eof => return Ok(0),
                ReadEvent::Noop | ReadEvent::Flush => {}
            }
        }
    }
}
