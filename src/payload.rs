use serde::{Deserialize, Serialize};

/// One element of an envelope payload: raw bytes or a control token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Item {
    Chunk(Vec<u8>),
    /// Keep-alive; carries no data and never ends the stream.
    Noop,
    /// The producer asked for its downstream sink to be flushed here.
    Flush,
    /// End of stream. Always the last element of the last envelope.
    Close,
}

impl Item {
    pub fn is_close(&self) -> bool {
        matches!(self, Item::Close)
    }

    pub fn data_len(&self) -> usize {
        match self {
            Item::Chunk(bytes) => bytes.len(),
            _ => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Item::Chunk(_) => "chunk",
            Item::Noop => "noop",
            Item::Flush => "flush",
            Item::Close => "close",
        }
    }
}

/// Returns the index of a CLOSE token that is not the final element, if any.
pub fn misplaced_close(payload: &[Item]) -> Option<usize> {
    let last = payload.len().checked_sub(1)?;
    payload
        .iter()
        .position(Item::is_close)
        .filter(|idx| *idx != last)
}

pub fn is_terminal(payload: &[Item]) -> bool {
    payload.last().map(Item::is_close).unwrap_or(false)
}

pub fn data_len(payload: &[Item]) -> usize {
    payload.iter().map(Item::data_len).sum()
}
