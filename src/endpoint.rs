//! One addressable participant on a substrate.
//!
//! An endpoint plays both factory roles at once. As initiator it opens
//! sessions with [`Endpoint::connect`]; as acceptor it turns the first
//! request envelope of an unknown session into a [`Connection`] and hands it
//! to the registered [`AcceptHandler`] on its own thread.
//!
//! Incoming envelopes never touch a pipe on the substrate's thread: they are
//! queued on a [`DispatchQueue`] and routed by its worker.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::thread;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::config::PipeOptions;
use crate::directory::SessionDirectory;
use crate::dispatch::DispatchQueue;
use crate::envelope::{Envelope, Metadata, Role};
use crate::inbound::InboundPipe;
use crate::outbound::{short_id, OutboundPipe};
use crate::session::{Connection, EnvelopeSender};
use crate::substrate::{EnvelopeReceiver, Substrate};
use crate::telemetry::{EndpointStats, EndpointStatsSnapshot};

/// Called once per accepted session, on a dedicated thread.
pub trait AcceptHandler: Send + Sync {
    fn accept(&self, conn: Connection);
}

impl<F> AcceptHandler for F
where
    F: Fn(Connection) + Send + Sync,
{
    fn accept(&self, conn: Connection) {
        self(conn)
    }
}

#[derive(Clone)]
pub struct Endpoint {
    core: Arc<EndpointCore>,
    dispatch: Arc<DispatchQueue<Envelope>>,
}

struct EndpointCore {
    id: String,
    substrate: Arc<dyn Substrate>,
    options: PipeOptions,
    /// Sessions this endpoint opened; fed by response envelopes.
    initiated: Arc<SessionDirectory>,
    /// Sessions peers opened here; fed by request envelopes.
    accepted: Arc<SessionDirectory>,
    acceptor: RwLock<Option<Arc<dyn AcceptHandler>>>,
    stats: Arc<EndpointStats>,
}

impl Endpoint {
    pub fn new(
        id: impl Into<String>,
        substrate: Arc<dyn Substrate>,
        options: PipeOptions,
    ) -> Result<Self> {
        let id = id.into();
        let core = Arc::new(EndpointCore {
            id: id.clone(),
            substrate,
            options,
            initiated: Arc::new(SessionDirectory::new("initiated")),
            accepted: Arc::new(SessionDirectory::new("accepted")),
            acceptor: RwLock::new(None),
            stats: Arc::new(EndpointStats::default()),
        });
        let worker_core = core.clone();
        let dispatch = DispatchQueue::start(format!("endpoint-{id}"), move |env: Envelope| {
            worker_core.handle(env)
        })?;
        crate::logging::info(format!(
            "endpoint {id}: started coalesce_ms={} read_timeout={:?}",
            options.coalesce.delay_ms(),
            options.read_timeout
        ));
        Ok(Self {
            core,
            dispatch: Arc::new(dispatch),
        })
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn options(&self) -> PipeOptions {
        self.core.options
    }

    /// Installs the handler for sessions opened by peers. Without one,
    /// incoming sessions are dropped.
    pub fn set_acceptor(&self, handler: impl AcceptHandler + 'static) {
        let handler: Arc<dyn AcceptHandler> = Arc::new(handler);
        *self
            .core
            .acceptor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Opens a session to `target`. `metadata` travels on the first envelope.
    ///
    /// The inbound pipe is registered before anything is sent, so a fast
    /// response can never race the directory entry.
    pub fn connect(&self, target: &str, metadata: Metadata) -> Result<Connection> {
        let core = &self.core;
        let session_id = Uuid::new_v4().to_string();
        let inbound = Arc::new(InboundPipe::new(
            session_id.clone(),
            core.options.read_timeout,
        ));
        core.initiated.register(inbound.clone())?;

        let sender = Arc::new(EnvelopeSender {
            source: core.id.clone(),
            destination: target.to_string(),
            role: Role::Request,
            substrate: core.substrate.clone(),
            stats: core.stats.clone(),
        });
        let outbound =
            match OutboundPipe::new(session_id.clone(), Some(metadata), core.options.coalesce, sender) {
                Ok(pipe) => pipe,
                Err(err) => {
                    core.initiated.remove(&session_id);
                    return Err(err);
                }
            };

        core.stats.on_session_opened();
        crate::logging::info_kv(
            "endpoint: session opened",
            &[
                ("endpoint", core.id.as_str()),
                ("target", target),
                ("session", session_id.as_str()),
            ],
        );
        Ok(Connection::new(
            target,
            inbound,
            outbound,
            core.initiated.clone(),
        ))
    }

    /// Handle for a substrate to deliver into. Dies with the last endpoint
    /// clone.
    pub fn receiver(&self) -> Weak<dyn EnvelopeReceiver> {
        let receiver: Arc<dyn EnvelopeReceiver> = self.dispatch.clone();
        Arc::downgrade(&receiver)
    }

    /// Queues an envelope for routing. Never blocks.
    pub fn deliver(&self, envelope: Envelope) {
        self.dispatch.add(envelope);
    }

    pub fn initiated_sessions(&self) -> Vec<String> {
        self.core.initiated.session_ids()
    }

    pub fn accepted_sessions(&self) -> Vec<String> {
        self.core.accepted.session_ids()
    }

    pub fn stats(&self) -> EndpointStatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Stops routing and unblocks every local reader.
    pub fn shutdown(&self) {
        self.dispatch.shutdown();
        for directory in [&self.core.initiated, &self.core.accepted] {
            for id in directory.session_ids() {
                if let Some(pipe) = directory.remove(&id) {
                    pipe.close();
                }
            }
        }
        crate::logging::info(format!("endpoint {}: shut down", self.core.id));
    }
}

impl EnvelopeReceiver for DispatchQueue<Envelope> {
    fn receive(&self, envelope: Envelope) {
        self.add(envelope);
    }
}

impl EndpointCore {
    fn handle(&self, envelope: Envelope) -> Result<()> {
        self.stats.on_recv(envelope.data_len());
        match envelope.role() {
            Role::Response => match self.initiated.get(envelope.session_id()) {
                Some(pipe) => self.deliver_to(&self.initiated, &pipe, envelope),
                None => {
                    self.drop_envelope(&envelope, "unknown session");
                    Ok(())
                }
            },
            Role::Request => {
                if let Some(pipe) = self.accepted.get(envelope.session_id()) {
                    return self.deliver_to(&self.accepted, &pipe, envelope);
                }
                if envelope.counter() != 0 {
                    self.drop_envelope(&envelope, "unknown session");
                    return Ok(());
                }
                let acceptor = self
                    .acceptor
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match acceptor {
                    Some(handler) => self.accept(envelope, handler),
                    None => {
                        self.drop_envelope(&envelope, "no acceptor");
                        Ok(())
                    }
                }
            }
        }
    }

    fn deliver_to(
        &self,
        directory: &SessionDirectory,
        pipe: &InboundPipe,
        envelope: Envelope,
    ) -> Result<()> {
        let (counter, metadata, payload) = envelope.into_parts();
        let result = pipe.deliver(counter, metadata, payload);
        if pipe.is_terminated() {
            directory.remove(pipe.session_id());
        }
        if let Err(err) = result {
            self.stats.on_protocol_error(&err);
            return Err(anyhow::Error::new(err)
                .context(format!("endpoint {}: {} session failed", self.id, directory.name())));
        }
        Ok(())
    }

    fn accept(&self, envelope: Envelope, handler: Arc<dyn AcceptHandler>) -> Result<()> {
        let peer = envelope.source().to_string();
        let session_id = envelope.session_id().to_string();

        let inbound = Arc::new(InboundPipe::new(
            session_id.clone(),
            self.options.read_timeout,
        ));
        let (counter, metadata, payload) = envelope.into_parts();
        if let Err(err) = inbound.deliver(counter, metadata, payload) {
            self.stats.on_protocol_error(&err);
            return Err(err.into());
        }
        // A session whose first envelope already carries CLOSE gets no entry.
        if !inbound.is_terminated() {
            self.accepted.register(inbound.clone())?;
        }

        let sender = Arc::new(EnvelopeSender {
            source: self.id.clone(),
            destination: peer.clone(),
            role: Role::Response,
            substrate: self.substrate.clone(),
            stats: self.stats.clone(),
        });
        let outbound = match OutboundPipe::new(
            session_id.clone(),
            Some(Metadata::new()),
            self.options.coalesce,
            sender,
        ) {
            Ok(pipe) => pipe,
            Err(err) => {
                self.accepted.remove(&session_id);
                return Err(err);
            }
        };

        self.stats.on_session_accepted();
        crate::logging::info_kv(
            "endpoint: session accepted",
            &[
                ("endpoint", self.id.as_str()),
                ("peer", peer.as_str()),
                ("session", session_id.as_str()),
            ],
        );

        let conn = Connection::new(peer, inbound, outbound, self.accepted.clone());
        let thread_session = session_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("accept-{}", short_id(&session_id)))
            .spawn(move || {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler.accept(conn))) {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    crate::logging::error(format!(
                        "accept handler panicked: session={thread_session} err={msg}"
                    ));
                }
            });
        if let Err(err) = spawned {
            self.accepted.remove(&session_id);
            return Err(err).with_context(|| format!("spawn accept thread for {session_id}"));
        }
        Ok(())
    }

    fn drop_envelope(&self, envelope: &Envelope, reason: &str) {
        self.stats.on_dropped();
        let counter = envelope.counter().to_string();
        crate::logging::info_kv(
            "endpoint: dropping envelope",
            &[
                ("endpoint", self.id.as_str()),
                ("reason", reason),
                ("role", envelope.role().as_str()),
                ("session", envelope.session_id()),
                ("counter", counter.as_str()),
                ("src", envelope.source()),
            ],
        );
    }
}
