//! Sending half of a session.
//!
//! Producer writes are coalesced into a payload list and packaged into one
//! envelope per send. When a send happens is decided by [`Coalesce`].

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::envelope::Metadata;
use crate::error::ProtocolError;
use crate::payload::{self, Item};

/// When buffered output is packaged and handed to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalesce {
    /// A sender thread drains the queue as soon as anything is in it.
    Immediate,
    /// Nothing is sent until `close()`, which sends on the closing thread.
    OnClose,
    /// A sender thread waits this long after the first buffered element,
    /// or until `close()`, then sends everything at once.
    Window(Duration),
}

impl Coalesce {
    /// Negative: immediate. Zero: on close. Positive: batch window in ms.
    pub fn from_delay_ms(delay_ms: i64) -> Self {
        match delay_ms {
            d if d < 0 => Coalesce::Immediate,
            0 => Coalesce::OnClose,
            d => Coalesce::Window(Duration::from_millis(d as u64)),
        }
    }

    pub fn delay_ms(self) -> i64 {
        match self {
            Coalesce::Immediate => -1,
            Coalesce::OnClose => 0,
            Coalesce::Window(d) => d.as_millis() as i64,
        }
    }
}

/// Receives each packaged envelope. Fire-and-forget: no acknowledgement is
/// expected, and an error only reaches the thread that triggered the send.
pub trait EnvelopeSink: Send + Sync {
    fn send(
        &self,
        session_id: &str,
        counter: u64,
        metadata: Option<Metadata>,
        payload: Vec<Item>,
    ) -> Result<()>;
}

impl<F> EnvelopeSink for F
where
    F: Fn(&str, u64, Option<Metadata>, Vec<Item>) -> Result<()> + Send + Sync,
{
    fn send(
        &self,
        session_id: &str,
        counter: u64,
        metadata: Option<Metadata>,
        payload: Vec<Item>,
    ) -> Result<()> {
        self(session_id, counter, metadata, payload)
    }
}

pub struct OutboundPipe {
    shared: Arc<OutboundShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct OutboundShared {
    session_id: String,
    coalesce: Coalesce,
    sink: Arc<dyn EnvelopeSink>,
    state: Mutex<OutboundState>,
    wake: Condvar,
}

struct OutboundState {
    queue: Vec<Item>,
    /// The most recently enqueued element is a FLUSH.
    flush_pending: bool,
    counter: u64,
    metadata: Option<Metadata>,
    closed: bool,
    /// The closer has finished handing CLOSE to the sink.
    close_done: bool,
    send_error: Option<String>,
}

struct Batch {
    counter: u64,
    metadata: Option<Metadata>,
    payload: Vec<Item>,
}

impl OutboundPipe {
    pub fn new(
        session_id: impl Into<String>,
        metadata: Option<Metadata>,
        coalesce: Coalesce,
        sink: Arc<dyn EnvelopeSink>,
    ) -> Result<Self> {
        let shared = Arc::new(OutboundShared {
            session_id: session_id.into(),
            coalesce,
            sink,
            state: Mutex::new(OutboundState {
                queue: Vec::new(),
                flush_pending: false,
                counter: 0,
                metadata,
                closed: false,
                close_done: false,
                send_error: None,
            }),
            wake: Condvar::new(),
        });

        let worker = match coalesce {
            Coalesce::OnClose => None,
            Coalesce::Immediate | Coalesce::Window(_) => {
                let runner = shared.clone();
                let name = format!("outbound-{}", short_id(&shared.session_id));
                let handle = thread::Builder::new()
                    .name(name)
                    .spawn(move || runner.run())
                    .context("spawn outbound sender thread")?;
                Some(handle)
            }
        };

        Ok(Self {
            shared,
            worker: Mutex::new(worker),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn coalesce(&self) -> Coalesce {
        self.shared.coalesce
    }

    /// Buffers `bytes` for the next send. Never blocks on the sink.
    pub fn write(&self, bytes: &[u8]) -> io::Result<usize> {
        let mut st = self.shared.writable()?;
        if bytes.is_empty() {
            return Ok(0);
        }
        match st.queue.last_mut() {
            Some(Item::Chunk(buf)) => buf.extend_from_slice(bytes),
            _ => st.queue.push(Item::Chunk(bytes.to_vec())),
        }
        st.flush_pending = false;
        drop(st);
        self.shared.wake.notify_all();
        Ok(bytes.len())
    }

    /// Marks a flush boundary. Back-to-back flushes enqueue one token.
    pub fn flush(&self) -> io::Result<()> {
        let mut st = self.shared.writable()?;
        if st.flush_pending {
            return Ok(());
        }
        st.queue.push(Item::Flush);
        st.flush_pending = true;
        drop(st);
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Enqueues a keep-alive token.
    pub fn keep_alive(&self) -> io::Result<()> {
        let mut st = self.shared.writable()?;
        st.queue.push(Item::Noop);
        drop(st);
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Appends CLOSE and sends everything still buffered.
    ///
    /// Returns once CLOSE has been handed to the sink, also for a caller
    /// racing another closer. Closing again reports any earlier send failure.
    pub fn close(&self) -> io::Result<()> {
        {
            let mut st = self.shared.lock();
            if st.closed {
                while !st.close_done {
                    st = self.shared.wake.wait(st).unwrap_or_else(PoisonError::into_inner);
                }
                return self.shared.send_result(&st);
            }
            st.closed = true;
            st.queue.push(Item::Close);
        }

        match self.shared.coalesce {
            Coalesce::OnClose => {
                let batch = {
                    let mut st = self.shared.lock();
                    self.shared.take_batch(&mut st)
                };
                self.shared.send_batch(batch);
            }
            Coalesce::Immediate | Coalesce::Window(_) => {
                self.shared.wake.notify_all();
                let handle = self
                    .worker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(handle) = handle {
                    if handle.join().is_err() {
                        let mut st = self.shared.lock();
                        st.send_error
                            .get_or_insert_with(|| "outbound sender thread panicked".to_string());
                    }
                }
            }
        }

        let mut st = self.shared.lock();
        st.close_done = true;
        drop(st);
        self.shared.wake.notify_all();
        let st = self.shared.lock();
        self.shared.send_result(&st)
    }

    /// Alias of [`close`](Self::close) for producers that expect nothing back.
    pub fn done(&self) -> io::Result<()> {
        self.close()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of envelopes handed to the sink so far.
    pub fn sent(&self) -> u64 {
        self.shared.lock().counter
    }

    /// Elements buffered and not yet sent.
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }
}

impl OutboundShared {
    fn lock(&self) -> MutexGuard<'_, OutboundState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writable(&self) -> io::Result<MutexGuard<'_, OutboundState>> {
        let st = self.lock();
        if st.closed {
            return Err(ProtocolError::PipeClosed {
                session: self.session_id.clone(),
            }
            .into());
        }
        if let Some(err) = &st.send_error {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, err.clone()));
        }
        Ok(st)
    }

    fn send_result(&self, st: &OutboundState) -> io::Result<()> {
        match &st.send_error {
            Some(err) => Err(io::Error::new(io::ErrorKind::BrokenPipe, err.clone())),
            None => Ok(()),
        }
    }

    fn take_batch(&self, st: &mut OutboundState) -> Batch {
        let counter = st.counter;
        st.counter += 1;
        let metadata = if counter == 0 {
            Some(st.metadata.take().unwrap_or_default())
        } else {
            None
        };
        Batch {
            counter,
            metadata,
            payload: std::mem::take(&mut st.queue),
        }
    }

    /// Hands a batch to the sink. Returns false if the pipe can send no more.
    fn send_batch(&self, batch: Batch) -> bool {
        let terminal = payload::is_terminal(&batch.payload);
        crate::logging::debug(format!(
            "outbound send: session={} counter={} items={} bytes={} close={}",
            self.session_id,
            batch.counter,
            batch.payload.len(),
            payload::data_len(&batch.payload),
            terminal
        ));
        match self
            .sink
            .send(&self.session_id, batch.counter, batch.metadata, batch.payload)
        {
            Ok(()) => !terminal,
            Err(err) => {
                crate::logging::error(format!(
                    "outbound send failed: session={} counter={}: {err:#}",
                    self.session_id, batch.counter
                ));
                self.lock().send_error = Some(format!("{err:#}"));
                false
            }
        }
    }

    fn run(&self) {
        loop {
            let mut st = self.lock();
            while st.queue.is_empty() && !st.closed {
                st = self.wake.wait(st).unwrap_or_else(PoisonError::into_inner);
            }
            if let Coalesce::Window(delay) = self.coalesce {
                let deadline = Instant::now() + delay;
                while !st.closed {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    st = self
                        .wake
                        .wait_timeout(st, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
            if st.queue.is_empty() {
                // CLOSE already went out with an earlier batch.
                return;
            }
            let batch = self.take_batch(&mut st);
            drop(st);
            if !self.send_batch(batch) {
                return;
            }
        }
    }
}

impl Drop for OutboundPipe {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.close() {
            crate::logging::warn(format!(
                "outbound close on drop failed: session={}: {err}",
                self.shared.session_id
            ));
        }
    }
}

impl io::Write for OutboundPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        OutboundPipe::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        OutboundPipe::flush(self)
    }
}

impl io::Write for &OutboundPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        OutboundPipe::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        OutboundPipe::flush(self)
    }
}

pub(crate) fn short_id(session_id: &str) -> &str {
    session_id.get(..8).unwrap_or(session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Sent {
        counter: u64,
        metadata: Option<Metadata>,
        payload: Vec<Item>,
        at: Instant,
    }

    fn recording_sink() -> (Arc<dyn EnvelopeSink>, Arc<Mutex<Vec<Sent>>>) {
        let log = Arc::new(Mutex::new(Vec::<Sent>::new()));
        let sink_log = log.clone();
        let sink = move |_sid: &str,
                         counter: u64,
                         metadata: Option<Metadata>,
                         payload: Vec<Item>|
              -> Result<()> {
            sink_log.lock().unwrap().push(Sent {
                counter,
                metadata,
                payload,
                at: Instant::now(),
            });
            Ok(())
        };
        (Arc::new(sink), log)
    }

    fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut f: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn meta() -> Metadata {
        let mut m = Metadata::new();
        m.insert("path".into(), "/x".into());
        m
    }

    fn bytes_of(sent: &[Sent]) -> Vec<u8> {
        let mut out = Vec::new();
        for s in sent {
            for item in &s.payload {
                if let Item::Chunk(b) = item {
                    out.extend_from_slice(b);
                }
            }
        }
        out
    }

    #[test]
    fn delay_maps_to_policy() {
        assert_eq!(Coalesce::from_delay_ms(-1), Coalesce::Immediate);
        assert_eq!(Coalesce::from_delay_ms(-50), Coalesce::Immediate);
        assert_eq!(Coalesce::from_delay_ms(0), Coalesce::OnClose);
        assert_eq!(
            Coalesce::from_delay_ms(250),
            Coalesce::Window(Duration::from_millis(250))
        );
        assert_eq!(Coalesce::Window(Duration::from_millis(250)).delay_ms(), 250);
    }

    #[test]
    fn immediate_sends_every_write() {
        let (sink, log) = recording_sink();
        let pipe = OutboundPipe::new("session-a", Some(meta()), Coalesce::Immediate, sink).unwrap();

        pipe.write(b"first").unwrap();
        assert!(wait_for(Duration::from_secs(2), || log.lock().unwrap().len() == 1));
        pipe.write(b"second").unwrap();
        assert!(wait_for(Duration::from_secs(2), || log.lock().unwrap().len() == 2));
        pipe.close().unwrap();

        let sent = log.lock().unwrap().clone();
        assert_eq!(sent[0].counter, 0);
        assert_eq!(sent[0].metadata, Some(meta()));
        assert_eq!(sent[1].counter, 1);
        assert_eq!(sent[1].metadata, None);
        let last = sent.last().unwrap();
        assert_eq!(last.payload.last(), Some(&Item::Close));
        assert_eq!(bytes_of(&sent), b"firstsecond");
        for (i, s) in sent.iter().enumerate() {
            assert_eq!(s.counter, i as u64);
        }
    }

    #[test]
    fn on_close_bundles_everything_into_one_send() {
        let (sink, log) = recording_sink();
        let pipe = OutboundPipe::new("session-b", None, Coalesce::OnClose, sink).unwrap();

        pipe.write(b"GET /x").unwrap();
        pipe.flush().unwrap();
        pipe.write(b" body").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(pipe.pending(), 3);

        pipe.done().unwrap();
        let sent = log.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].counter, 0);
        assert_eq!(sent[0].metadata, Some(Metadata::new()));
        assert_eq!(
            sent[0].payload,
            vec![
                Item::Chunk(b"GET /x".to_vec()),
                Item::Flush,
                Item::Chunk(b" body".to_vec()),
                Item::Close
            ]
        );
        assert_eq!(pipe.sent(), 1);
    }

    #[test]
    fn window_batches_writes_until_delay_expires() {
        let (sink, log) = recording_sink();
        let delay = Duration::from_millis(100);
        let pipe = OutboundPipe::new("session-c", None, Coalesce::Window(delay), sink).unwrap();

        let start = Instant::now();
        pipe.write(b"a").unwrap();
        pipe.write(b"b").unwrap();
        pipe.flush().unwrap();
        assert!(wait_for(Duration::from_secs(3), || !log.lock().unwrap().is_empty()));

        let first = log.lock().unwrap()[0].clone();
        let waited = first.at.duration_since(start);
        assert!(waited >= delay);
        assert!(waited < delay + Duration::from_millis(400), "sent after {waited:?}");
        assert_eq!(first.payload, vec![Item::Chunk(b"ab".to_vec()), Item::Flush]);
        pipe.close().unwrap();
    }

    #[test]
    fn window_close_sends_without_waiting() {
        let (sink, log) = recording_sink();
        let pipe = OutboundPipe::new(
            "session-d",
            None,
            Coalesce::Window(Duration::from_secs(30)),
            sink,
        )
        .unwrap();

        let start = Instant::now();
        pipe.write(b"payload").unwrap();
        pipe.close().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));

        let sent = log.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].payload,
            vec![Item::Chunk(b"payload".to_vec()), Item::Close]
        );
    }

    #[test]
    fn consecutive_flushes_collapse() {
        let (sink, log) = recording_sink();
        let pipe = OutboundPipe::new("session-e", None, Coalesce::OnClose, sink).unwrap();
        pipe.flush().unwrap();
        pipe.flush().unwrap();
        pipe.write(b"x").unwrap();
        pipe.flush().unwrap();
        pipe.flush().unwrap();
        pipe.close().unwrap();

        let sent = log.lock().unwrap().clone();
        assert_eq!(
            sent[0].payload,
            vec![
                Item::Flush,
                Item::Chunk(b"x".to_vec()),
                Item::Flush,
                Item::Close
            ]
        );
    }

    #[test]
    fn flushes_collapse_across_sends() {
        let (sink, log) = recording_sink();
        let pipe = OutboundPipe::new("session-f", None, Coalesce::Immediate, sink).unwrap();
        pipe.flush().unwrap();
        assert!(wait_for(Duration::from_secs(2), || log.lock().unwrap().len() == 1));
        pipe.flush().unwrap();
        pipe.close().unwrap();

        let sent = log.lock().unwrap().clone();
        let flushes = sent
            .iter()
            .flat_map(|s| s.payload.iter())
            .filter(|item| **item == Item::Flush)
            .count();
        assert_eq!(flushes, 1);
    }

    #[test]
    fn writes_after_close_fail() {
        let (sink, _log) = recording_sink();
        let pipe = OutboundPipe::new("session-g", None, Coalesce::Immediate, sink).unwrap();
        pipe.close().unwrap();
        pipe.close().unwrap();
        let err = pipe.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(pipe.flush().is_err());
        assert!(pipe.keep_alive().is_err());
    }

    #[test]
    fn sink_failure_reaches_the_closer() {
        let sink = |_sid: &str,
                    _counter: u64,
                    _meta: Option<Metadata>,
                    _payload: Vec<Item>|
              -> Result<()> {
            anyhow::bail!("substrate unavailable")
        };
        let pipe = OutboundPipe::new("session-h", None, Coalesce::OnClose, Arc::new(sink)).unwrap();
        pipe.write(b"x").unwrap();
        let err = pipe.close().unwrap_err();
        assert!(err.to_string().contains("substrate unavailable"));
    }

    #[test]
    fn racing_closers_both_wait_for_close() {
        let log = Arc::new(Mutex::new(Vec::<Item>::new()));
        let sink_log = log.clone();
        let sink = move |_sid: &str,
                         _counter: u64,
                         _meta: Option<Metadata>,
                         payload: Vec<Item>|
              -> Result<()> {
            if payload::is_terminal(&payload) {
                thread::sleep(Duration::from_millis(100));
            }
            sink_log.lock().unwrap().extend(payload);
            Ok(())
        };
        for coalesce in [Coalesce::Immediate, Coalesce::Window(Duration::from_millis(20))] {
            log.lock().unwrap().clear();
            let pipe = Arc::new(
                OutboundPipe::new("session-race", None, coalesce, Arc::new(sink.clone())).unwrap(),
            );
            pipe.write(b"x").unwrap();

            let closers: Vec<_> = (0..2)
                .map(|_| {
                    let pipe = pipe.clone();
                    let log = log.clone();
                    thread::spawn(move || {
                        pipe.close().unwrap();
                        log.lock().unwrap().last() == Some(&Item::Close)
                    })
                })
                .collect();
            for closer in closers {
                assert!(closer.join().unwrap(), "close returned before CLOSE was sent");
            }
        }
    }

    #[test]
    fn drop_sends_close() {
        let (sink, log) = recording_sink();
        {
            let mut pipe = OutboundPipe::new("session-i", None, Coalesce::Immediate, sink).unwrap();
            io::Write::write_all(&mut pipe, b"bye").unwrap();
        }
        let sent = log.lock().unwrap().clone();
        assert_eq!(bytes_of(&sent), b"bye");
        assert_eq!(sent.last().unwrap().payload.last(), Some(&Item::Close));
    }
}
