pub mod config;
pub mod demo;
pub mod directory;
pub mod dispatch;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod inbound;
pub mod logging;
pub mod outbound;
pub mod payload;
pub mod session;
pub mod substrate;
pub mod telemetry;
pub mod wire;

pub use config::{Config, PipeOptions};
pub use endpoint::{AcceptHandler, Endpoint};
pub use envelope::{Envelope, Metadata, Role};
pub use error::ProtocolError;
pub use inbound::{InboundPipe, InboundStream, ReadEvent};
pub use outbound::{Coalesce, EnvelopeSink, OutboundPipe};
pub use payload::Item;
pub use session::{Connection, SessionState};
pub use substrate::{EnvelopeReceiver, LoopbackBus, Substrate};
