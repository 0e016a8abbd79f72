//! The messaging substrate seam, plus an in-process implementation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use anyhow::Result;

use crate::dispatch::DispatchQueue;
use crate::endpoint::Endpoint;
use crate::envelope::Envelope;
use crate::wire::{self, Encoding};

/// Carries envelopes between endpoints. Fire-and-forget; ordering and
/// exactly-once delivery are not promised.
pub trait Substrate: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<()>;
}

/// Entry point a substrate calls for each arriving envelope.
///
/// Runs on the substrate's delivery thread and must not block.
pub trait EnvelopeReceiver: Send + Sync {
    fn receive(&self, envelope: Envelope);
}

type Routes = Arc<RwLock<HashMap<String, Weak<dyn EnvelopeReceiver>>>>;

struct Frame {
    destination: String,
    bytes: Vec<u8>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame dst={} bytes={}", self.destination, self.bytes.len())
    }
}

/// In-process substrate. Every envelope is encoded to a frame, queued, and
/// decoded again on the bus's own delivery thread.
pub struct LoopbackBus {
    encoding: Encoding,
    routes: Routes,
    delivery: DispatchQueue<Frame>,
    delivered: Arc<AtomicU64>,
    undeliverable: Arc<AtomicU64>,
}

impl LoopbackBus {
    pub fn new(encoding: Encoding) -> Result<Arc<Self>> {
        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));
        let delivered = Arc::new(AtomicU64::new(0));
        let undeliverable = Arc::new(AtomicU64::new(0));

        let handler_routes = routes.clone();
        let handler_delivered = delivered.clone();
        let handler_undeliverable = undeliverable.clone();
        let delivery = DispatchQueue::start("loopback-bus", move |frame: Frame| {
            let envelope = wire::decode(&frame.bytes)?;
            let receiver = handler_routes
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&frame.destination)
                .and_then(|weak| weak.upgrade());
            match receiver {
                Some(receiver) => {
                    receiver.receive(envelope);
                    handler_delivered.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    handler_undeliverable.fetch_add(1, Ordering::Relaxed);
                    crate::logging::info_kv(
                        "loopback: no route",
                        &[
                            ("destination", frame.destination.as_str()),
                            ("session", envelope.session_id()),
                        ],
                    );
                }
            }
            Ok(())
        })?;

        Ok(Arc::new(Self {
            encoding,
            routes,
            delivery,
            delivered,
            undeliverable,
        }))
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn register(&self, id: impl Into<String>, receiver: Weak<dyn EnvelopeReceiver>) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), receiver);
    }

    pub fn unregister(&self, id: &str) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Creates an endpoint that sends through this bus and is reachable on it.
    pub fn endpoint(
        self: &Arc<Self>,
        id: impl Into<String>,
        options: crate::config::PipeOptions,
    ) -> Result<Endpoint> {
        let substrate: Arc<dyn Substrate> = self.clone();
        let endpoint = Endpoint::new(id, substrate, options)?;
        self.register(endpoint.id(), endpoint.receiver());
        Ok(endpoint)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn undeliverable(&self) -> u64 {
        self.undeliverable.load(Ordering::Relaxed)
    }
}

impl Substrate for LoopbackBus {
    fn send(&self, envelope: Envelope) -> Result<()> {
        let bytes = wire::encode(&envelope, self.encoding)?;
        self.delivery.add(Frame {
            destination: envelope.destination().to_string(),
            bytes,
        });
        Ok(())
    }
}
