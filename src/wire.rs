use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, Metadata, Role};
use crate::payload::Item;

pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

const MAGIC0: u8 = b'M';
const MAGIC1: u8 = b'S';
const VERSION: u8 = 1;

const KIND_CHUNK: u8 = 0;
const KIND_NOOP: u8 = 1;
const KIND_FLUSH: u8 = 2;
const KIND_CLOSE: u8 = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Encoding {
    Json,
    MsgPack,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::MsgPack => "msgpack",
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Encoding::Json => 0,
            Encoding::MsgPack => 1,
        }
    }
}

pub fn preferred_encoding(name: &str) -> Encoding {
    match name.trim().to_lowercase().as_str() {
        "msgpack" => Encoding::MsgPack,
        "json" => Encoding::Json,
        _ => Encoding::Json,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope<I> {
    #[serde(rename = "src")]
    source: String,
    #[serde(rename = "dst")]
    destination: String,
    #[serde(rename = "rol")]
    role: Role,
    #[serde(rename = "sid")]
    session_id: String,
    #[serde(rename = "ctr")]
    counter: u64,
    #[serde(rename = "met", default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
    #[serde(rename = "pay", default)]
    payload: Vec<I>,
}

// JSON carries chunk bytes as base64 text.
#[derive(Debug, Default, Serialize, Deserialize)]
struct JsonItem {
    #[serde(rename = "k")]
    kind: u8,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MsgpackItem {
    #[serde(rename = "k")]
    kind: u8,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    data: Option<Vec<u8>>,
}

fn item_kind(item: &Item) -> u8 {
    match item {
        Item::Chunk(_) => KIND_CHUNK,
        Item::Noop => KIND_NOOP,
        Item::Flush => KIND_FLUSH,
        Item::Close => KIND_CLOSE,
    }
}

fn item_from_kind(kind: u8, data: Option<Vec<u8>>) -> Result<Item> {
    match kind {
        KIND_CHUNK => Ok(Item::Chunk(data.unwrap_or_default())),
        KIND_NOOP => Ok(Item::Noop),
        KIND_FLUSH => Ok(Item::Flush),
        KIND_CLOSE => Ok(Item::Close),
        _ => anyhow::bail!("unknown payload item kind: {kind}"),
    }
}

fn to_wire<I>(env: &Envelope, items: Vec<I>) -> WireEnvelope<I> {
    WireEnvelope {
        source: env.source().to_string(),
        destination: env.destination().to_string(),
        role: env.role(),
        session_id: env.session_id().to_string(),
        counter: env.counter(),
        metadata: env.metadata().cloned(),
        payload: items,
    }
}

fn from_wire(wire: WireEnvelope<Item>) -> Result<Envelope> {
    let env = Envelope::new(
        wire.source,
        wire.destination,
        wire.role,
        wire.session_id,
        wire.counter,
        wire.metadata,
        wire.payload,
    )?;
    Ok(env)
}

pub fn encode(env: &Envelope, encoding: Encoding) -> Result<Vec<u8>> {
    let body = match encoding {
        Encoding::Json => {
            let items = env
                .payload()
                .iter()
                .map(|item| JsonItem {
                    kind: item_kind(item),
                    data: match item {
                        Item::Chunk(bytes) => {
                            Some(base64::engine::general_purpose::STANDARD.encode(bytes))
                        }
                        _ => None,
                    },
                })
                .collect();
            serde_json::to_vec(&to_wire(env, items))?
        }
        Encoding::MsgPack => {
            let items = env
                .payload()
                .iter()
                .map(|item| MsgpackItem {
                    kind: item_kind(item),
                    data: match item {
                        Item::Chunk(bytes) => Some(bytes.clone()),
                        _ => None,
                    },
                })
                .collect();
            rmp_serde::to_vec_named(&to_wire(env, items))?
        }
    };

    let mut out = Vec::with_capacity(4 + body.len());
    out.push(MAGIC0);
    out.push(MAGIC1);
    out.push(VERSION);
    out.push(encoding.as_byte());
    out.extend_from_slice(&body);
    if out.len() > MAX_FRAME_BYTES {
        anyhow::bail!(
            "encoded envelope too large: {} bytes (max {MAX_FRAME_BYTES})",
            out.len()
        );
    }
    Ok(out)
}

pub fn decode(raw: &[u8]) -> Result<Envelope> {
    if raw.len() > MAX_FRAME_BYTES {
        anyhow::bail!("frame too large: {} bytes", raw.len());
    }
    if raw.len() < 4 || raw[0] != MAGIC0 || raw[1] != MAGIC1 {
        anyhow::bail!("not an envelope frame");
    }
    if raw[2] != VERSION {
        anyhow::bail!("unsupported envelope version: {}", raw[2]);
    }
    let body = &raw[4..];
    match raw[3] {
        0 => decode_json(body),
        1 => decode_msgpack(body),
        enc => anyhow::bail!("unknown envelope encoding: {enc}"),
    }
}

fn decode_json(body: &[u8]) -> Result<Envelope> {
    let wire: WireEnvelope<JsonItem> =
        serde_json::from_slice(body).context("decode json envelope")?;
    let payload = wire
        .payload
        .into_iter()
        .map(|item| {
            let data = item
                .data
                .map(|s| base64::engine::general_purpose::STANDARD.decode(s.as_bytes()))
                .transpose()
                .context("decode chunk base64")?;
            item_from_kind(item.kind, data)
        })
        .collect::<Result<Vec<_>>>()?;
    from_wire(WireEnvelope {
        source: wire.source,
        destination: wire.destination,
        role: wire.role,
        session_id: wire.session_id,
        counter: wire.counter,
        metadata: wire.metadata,
        payload,
    })
}

fn decode_msgpack(body: &[u8]) -> Result<Envelope> {
    let wire: WireEnvelope<MsgpackItem> =
        rmp_serde::from_slice(body).context("decode msgpack envelope")?;
    let payload = wire
        .payload
        .into_iter()
        .map(|item| item_from_kind(item.kind, item.data))
        .collect::<Result<Vec<_>>>()?;
    from_wire(WireEnvelope {
        source: wire.source,
        destination: wire.destination,
        role: wire.role,
        session_id: wire.session_id,
        counter: wire.counter,
        metadata: wire.metadata,
        payload,
    })
}
