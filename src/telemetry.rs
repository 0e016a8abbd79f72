use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct EndpointStats {
    envelopes_sent: AtomicU64,
    envelopes_recv: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_accepted: AtomicU64,
    dropped: AtomicU64,
    protocol_errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl EndpointStats {
    pub fn on_send(&self, bytes: usize) {
        self.envelopes_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn on_recv(&self, bytes: usize) {
        self.envelopes_recv.fetch_add(1, Ordering::Relaxed);
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn on_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_session_accepted(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_protocol_error(&self, err: impl ToString) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(err);
    }

    pub fn set_last_error(&self, err: impl ToString) {
        let mut g = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *g = Some(err.to_string());
    }

    pub fn snapshot(&self) -> EndpointStatsSnapshot {
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default();
        EndpointStatsSnapshot {
            envelopes_sent: self.envelopes_sent.load(Ordering::Relaxed),
            envelopes_recv: self.envelopes_recv.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            last_error,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointStatsSnapshot {
    pub envelopes_sent: u64,
    pub envelopes_recv: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub sessions_opened: u64,
    pub sessions_accepted: u64,
    pub dropped: u64,
    pub protocol_errors: u64,
    pub last_error: String,
}
