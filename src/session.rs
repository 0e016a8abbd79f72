use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::directory::SessionDirectory;
use crate::envelope::{Envelope, Metadata, Role};
use crate::inbound::{InboundPipe, InboundStream};
use crate::outbound::{EnvelopeSink, OutboundPipe};
use crate::substrate::Substrate;
use crate::telemetry::EndpointStats;

/// Lifecycle of one session as seen from one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing sent or received yet.
    Open,
    /// Counters are advancing in at least one direction.
    Active,
    /// One direction has carried CLOSE, the other has not.
    HalfClosed,
    /// Both directions are done, or the connection was closed locally.
    Closed,
}

/// A session's paired pipes, handed to whoever speaks the stream protocol.
pub struct Connection {
    session_id: String,
    peer: String,
    inbound: Arc<InboundPipe>,
    outbound: OutboundPipe,
    directory: Arc<SessionDirectory>,
}

impl Connection {
    pub(crate) fn new(
        peer: impl Into<String>,
        inbound: Arc<InboundPipe>,
        outbound: OutboundPipe,
        directory: Arc<SessionDirectory>,
    ) -> Self {
        Self {
            session_id: inbound.session_id().to_string(),
            peer: peer.into(),
            inbound,
            outbound,
            directory,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Substrate id of the other side.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Blocks until the peer's counter-0 metadata has arrived.
    pub fn metadata(&self) -> io::Result<Option<Metadata>> {
        self.inbound.metadata()
    }

    pub fn inbound(&self) -> InboundStream {
        InboundStream::new(self.inbound.clone())
    }

    pub fn inbound_pipe(&self) -> &Arc<InboundPipe> {
        &self.inbound
    }

    pub fn outbound(&self) -> &OutboundPipe {
        &self.outbound
    }

    pub fn state(&self) -> SessionState {
        let sent_close = self.outbound.is_closed();
        let got_close = self.inbound.close_received();
        if self.inbound.is_closed() || (sent_close && got_close) {
            SessionState::Closed
        } else if sent_close || got_close {
            SessionState::HalfClosed
        } else if self.outbound.sent() == 0 && self.inbound.received() == 0 {
            SessionState::Open
        } else {
            SessionState::Active
        }
    }

    /// Sends CLOSE if not yet sent, stops reading, and forgets the session.
    pub fn close(&self) -> io::Result<()> {
        let result = self.outbound.close();
        self.inbound.close();
        self.directory.remove(&self.session_id);
        result
    }

    /// Half-close: sends CLOSE but keeps reading the peer's stream.
    pub fn done(&self) -> io::Result<()> {
        self.outbound.done()
    }
}

// The outbound pipe sends CLOSE from its own drop.
impl Drop for Connection {
    fn drop(&mut self) {
        self.inbound.close();
        self.directory.remove(&self.session_id);
    }
}

/// Wraps a session's outgoing payloads into addressed envelopes.
pub(crate) struct EnvelopeSender {
    pub(crate) source: String,
    pub(crate) destination: String,
    pub(crate) role: Role,
    pub(crate) substrate: Arc<dyn Substrate>,
    pub(crate) stats: Arc<EndpointStats>,
}

impl EnvelopeSink for EnvelopeSender {
    fn send(
        &self,
        session_id: &str,
        counter: u64,
        metadata: Option<Metadata>,
        payload: Vec<crate::payload::Item>,
    ) -> Result<()> {
        let envelope = Envelope::new(
            self.source.as_str(),
            self.destination.as_str(),
            self.role,
            session_id,
            counter,
            metadata,
            payload,
        )?;
        let bytes = envelope.data_len();
        self.substrate.send(envelope).with_context(|| {
            format!(
                "send {} envelope session={session_id} counter={counter} to {}",
                self.role.as_str(),
                self.destination
            )
        })?;
        self.stats.on_send(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::Coalesce;
    use crate::payload::Item;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<Envelope>>);

    impl Substrate for Capture {
        fn send(&self, envelope: Envelope) -> Result<()> {
            self.0.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    fn connection(capture: Arc<Capture>) -> (Connection, Arc<SessionDirectory>) {
        let directory = Arc::new(SessionDirectory::new("initiated"));
        let inbound = Arc::new(InboundPipe::new("sess-1", None));
        directory.register(inbound.clone()).unwrap();
        let stats = Arc::new(EndpointStats::default());
        let sender = Arc::new(EnvelopeSender {
            source: "client".into(),
            destination: "server".into(),
            role: Role::Request,
            substrate: capture,
            stats,
        });
        let mut meta = Metadata::new();
        meta.insert("path".into(), "/x".into());
        let outbound = OutboundPipe::new("sess-1", Some(meta), Coalesce::OnClose, sender).unwrap();
        (
            Connection::new("server", inbound, outbound, directory.clone()),
            directory,
        )
    }

    #[test]
    fn state_walks_through_half_close_to_closed() {
        let capture = Arc::new(Capture::default());
        let (conn, directory) = connection(capture.clone());
        assert_eq!(conn.state(), SessionState::Open);
        assert_eq!(conn.peer(), "server");

        conn.inbound_pipe()
            .deliver(0, None, vec![Item::Chunk(b"hi".to_vec())])
            .unwrap();
        assert_eq!(conn.state(), SessionState::Active);

        conn.outbound().write(b"request").unwrap();
        conn.outbound().done().unwrap();
        assert_eq!(conn.state(), SessionState::HalfClosed);

        conn.inbound_pipe().deliver(1, None, vec![Item::Close]).unwrap();
        assert_eq!(conn.state(), SessionState::Closed);

        conn.close().unwrap();
        assert!(directory.is_empty());

        let sent = capture.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination(), "server");
        assert_eq!(sent[0].role(), Role::Request);
        assert_eq!(sent[0].metadata().unwrap().get("path").unwrap(), "/x");
        assert!(sent[0].is_terminal());
    }

    #[test]
    fn dropping_unclosed_connection_forgets_it() {
        let capture = Arc::new(Capture::default());
        let (conn, directory) = connection(capture.clone());
        let pipe = conn.inbound_pipe().clone();
        conn.outbound().write(b"never answered").unwrap();
        drop(conn);

        assert!(directory.is_empty());
        assert!(pipe.is_closed());
        let sent = capture.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_terminal());
    }

    #[test]
    fn local_close_unblocks_and_forgets() {
        let capture = Arc::new(Capture::default());
        let (conn, directory) = connection(capture);
        conn.close().unwrap();
        assert_eq!(conn.state(), SessionState::Closed);
        assert!(!directory.contains("sess-1"));
        assert_eq!(conn.metadata().unwrap(), None);
        assert!(conn.outbound().write(b"late").is_err());
    }
}
