//! OSC event source.
//!
//! Listens for OSC 1.0 packets on UDP. A message addressed to
//! `<address_prefix><name>` whose first argument is numeric becomes the event
//! `(name, value)`. Bundles are unpacked recursively; anything else is ignored.

use anyhow::Context;
use async_trait::async_trait;
use linkme::distributed_slice;
use tokio::net::UdpSocket;
use tracing::debug;
use tracing::info;
use tracing::trace;

use super::EVENT_SOURCES;
use super::EventSender;
use super::EventSource;
use super::InboundEvent;
use super::SourceContext;
use super::SourceFactoryResult;
use crate::config::OscSourceConfig;

const BUNDLE_TAG: &[u8] = b"#bundle\0";

/// Largest datagram accepted
const MAX_PACKET_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Float(f32),
    Double(f64),
    Int(i32),
    Long(i64),
    Bool(bool),
    Str(String),
    Blob(Vec<u8>),
    Nil,
}

impl OscArg {
    fn as_f32(&self) -> Option<f32> {
        match self {
            OscArg::Float(v) => Some(*v),
            OscArg::Double(v) => Some(*v as f32),
            OscArg::Int(v) => Some(*v as f32),
            OscArg::Long(v) => Some(*v as f32),
            OscArg::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            OscArg::Str(_) | OscArg::Blob(_) | OscArg::Nil => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    /// Convert to an event if the address is under `prefix` and the first argument is
    /// numeric
    pub fn to_event(&self, prefix: &str) -> Option<InboundEvent> {
        let name = self.address.strip_prefix(prefix)?;
        let value = self.args.first()?.as_f32()?;
        (!name.is_empty() && value.is_finite()).then(|| InboundEvent::new(name, value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OscError {
    #[error("packet truncated")]
    Truncated,

    #[error("string is not NUL-terminated UTF-8")]
    InvalidString,

    #[error("missing type tag string")]
    MissingTypeTags,

    #[error("unsupported type tag '{0}'")]
    UnsupportedTag(char),

    #[error("packet is neither a message nor a bundle")]
    NotOsc,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], OscError> {
        let end = self.pos.checked_add(len).ok_or(OscError::Truncated)?;
        let bytes = self.buf.get(self.pos..end).ok_or(OscError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], OscError> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Skip padding up to the next multiple of four
    fn align(&mut self) -> Result<(), OscError> {
        let pad = (4 - self.pos % 4) % 4;
        self.take(pad).map(|_| ())
    }

    fn string(&mut self) -> Result<&'a str, OscError> {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(OscError::InvalidString)?;
        let s = std::str::from_utf8(&rest[..len]).map_err(|_| OscError::InvalidString)?;
        self.take(len + 1)?;
        self.align()?;
        Ok(s)
    }

    fn i32(&mut self) -> Result<i32, OscError> {
        self.take_array().map(i32::from_be_bytes)
    }

    fn blob(&mut self) -> Result<&'a [u8], OscError> {
        let len = usize::try_from(self.i32()?).map_err(|_| OscError::Truncated)?;
        let data = self.take(len)?;
        self.align()?;
        Ok(data)
    }
}

/// Decode one datagram into the messages it carries
pub fn decode_packet(buf: &[u8]) -> Result<Vec<OscMessage>, OscError> {
    let mut messages = Vec::new();
    decode_into(buf, &mut messages)?;
    Ok(messages)
}

fn decode_into(buf: &[u8], out: &mut Vec<OscMessage>) -> Result<(), OscError> {
    match buf.first() {
        Some(b'/') => {
            out.push(decode_message(buf)?);
            Ok(())
        }
        Some(b'#') if buf.starts_with(BUNDLE_TAG) => {
            let mut reader = Reader::new(buf);
            reader.take(BUNDLE_TAG.len())?;
            // Time tag; delivery is always immediate
            reader.take(8)?;
            while !reader.is_empty() {
                let element = reader.blob()?;
                decode_into(element, out)?;
            }
            Ok(())
        }
        _ => Err(OscError::NotOsc),
    }
}

fn decode_message(buf: &[u8]) -> Result<OscMessage, OscError> {
    let mut reader = Reader::new(buf);
    let address = reader.string()?.to_string();

    if reader.is_empty() {
        // Pre-1.0 senders may omit the type tags of an argument-less message
        return Ok(OscMessage {
            address,
            args: Vec::new(),
        });
    }

    let tags = reader.string()?;
    let tags = tags.strip_prefix(',').ok_or(OscError::MissingTypeTags)?;

    let mut args = Vec::with_capacity(tags.len());
    for tag in tags.chars() {
        let arg = match tag {
            'f' => OscArg::Float(f32::from_be_bytes(reader.take_array()?)),
            'd' => OscArg::Double(f64::from_be_bytes(reader.take_array()?)),
            'i' => OscArg::Int(reader.i32()?),
            'h' => OscArg::Long(i64::from_be_bytes(reader.take_array()?)),
            'T' => OscArg::Bool(true),
            'F' => OscArg::Bool(false),
            'N' | 'I' => OscArg::Nil,
            's' | 'S' => OscArg::Str(reader.string()?.to_string()),
            'b' => OscArg::Blob(reader.blob()?.to_vec()),
            other => return Err(OscError::UnsupportedTag(other)),
        };
        args.push(arg);
    }

    Ok(OscMessage { address, args })
}

pub struct OscEventSource {
    config: OscSourceConfig,
}

impl OscEventSource {
    pub fn new(config: OscSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EventSource for OscEventSource {
    fn name(&self) -> &str {
        "osc"
    }

    async fn run(self: Box<Self>, events: EventSender) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.listen, self.config.port);
        let socket = UdpSocket::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind OSC socket on {}", addr))?;
        info!("Listening for OSC on {}", addr);

        serve(socket, &self.config.address_prefix, events).await
    }
}

/// Receive datagrams on `socket` forever, forwarding matching messages as events
pub async fn serve(socket: UdpSocket, prefix: &str, events: EventSender) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let (len, peer) = socket
            .recv_from(&mut buf)
            .await
            .context("OSC socket receive failed")?;

        let messages = match decode_packet(&buf[..len]) {
            Ok(messages) => messages,
            Err(e) => {
                debug!("Dropping malformed OSC packet from {}: {}", peer, e);
                continue;
            }
        };

        for message in messages {
            trace!("OSC {} {:?}", message.address, message.args);
            if let Some(event) = message.to_event(prefix) {
                events.send(event);
            }
        }
    }
}

#[distributed_slice(EVENT_SOURCES)]
fn init_osc(ctx: &SourceContext) -> SourceFactoryResult {
    let Some(config) = &ctx.config.events.osc else {
        return Ok(None);
    };

    Ok(Some(Box::new(OscEventSource::new(config.clone()))))
}
