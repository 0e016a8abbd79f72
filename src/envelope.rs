use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::payload::{self, Item};

/// Session metadata carried by the first envelope of each direction.
pub type Metadata = BTreeMap<String, String>;

/// Which logical direction an envelope belongs to.
///
/// Both directions share one substrate address, so the tag decides whether
/// the receiving endpoint routes it to the sessions it accepted or to the
/// sessions it initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Initiator to acceptor.
    Request,
    /// Acceptor back to initiator.
    Response,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Request => "request",
            Role::Response => "response",
        }
    }

    pub fn reply(self) -> Role {
        match self {
            Role::Request => Role::Response,
            Role::Response => Role::Request,
        }
    }
}

/// One addressed unit of transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    source: String,
    destination: String,
    role: Role,
    session_id: String,
    counter: u64,
    metadata: Option<Metadata>,
    payload: Vec<Item>,
}

impl Envelope {
    /// Builds an envelope, rejecting payloads where CLOSE is not last.
    ///
    /// Metadata is only kept on counter 0.
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        role: Role,
        session_id: impl Into<String>,
        counter: u64,
        metadata: Option<Metadata>,
        payload: Vec<Item>,
    ) -> Result<Self, ProtocolError> {
        let session_id = session_id.into();
        if let Some(index) = payload::misplaced_close(&payload) {
            return Err(ProtocolError::CloseNotLast {
                session: session_id,
                index,
            });
        }
        Ok(Self {
            source: source.into(),
            destination: destination.into(),
            role,
            session_id,
            counter,
            metadata: if counter == 0 { metadata } else { None },
            payload,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn payload(&self) -> &[Item] {
        &self.payload
    }

    pub fn is_terminal(&self) -> bool {
        payload::is_terminal(&self.payload)
    }

    pub fn data_len(&self) -> usize {
        payload::data_len(&self.payload)
    }

    pub fn into_parts(self) -> (u64, Option<Metadata>, Vec<Item>) {
        (self.counter, self.metadata, self.payload)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session={} counter={} role={} src={} dst={} items={} bytes={}",
            self.session_id,
            self.counter,
            self.role.as_str(),
            self.source,
            self.destination,
            self.payload.len(),
            self.data_len()
        )
    }
}
