//! Bus address handling and the stream transport.
//!
//! Addresses follow the `unix:path=...` / `unix:abstract=...` grammar; the
//! user and system bus locations resolve from the conventional environment
//! variables with filesystem fallbacks. [`StreamTransport`] frames messages
//! with the crate's envelope over the connected socket and matches replies
//! by serial. Bridging to a bus daemon that speaks a different wire format
//! belongs in an external [`BusTransport`](crate::BusTransport)
//! implementation.

use std::env;
use std::fmt;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::message::{Message, MessageKind};
use crate::BusTransport;

pub(crate) const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

const ENVELOPE_MAGIC: [u8; 4] = *b"mbu1";
const MAX_ENVELOPE_LEN: usize = 1 << 27;

/// A parsed bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusAddress {
    /// `unix:path=...` — a filesystem socket.
    Path(String),
    /// `unix:abstract=...` — an abstract-namespace socket (Linux only).
    Abstract(String),
}

impl BusAddress {
    /// Parse an address string. Multiple `;`-separated entries are tried
    /// left to right and the first supported one wins; extra `,`-separated
    /// parameters (`guid=...`) are skipped.
    pub fn parse(address: &str) -> Result<BusAddress> {
        for entry in address.split(';') {
            if let Some(rest) = entry.strip_prefix("unix:") {
                for pair in rest.split(',') {
                    if let Some(path) = pair.strip_prefix("path=") {
                        return Ok(BusAddress::Path(path.into()));
                    }
                    if let Some(name) = pair.strip_prefix("abstract=") {
                        return Ok(BusAddress::Abstract(name.into()));
                    }
                }
            }
        }
        Err(Error::InvalidAddress(address.into()))
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BusAddress::Path(p) => write!(f, "unix:path={}", p),
            BusAddress::Abstract(n) => write!(f, "unix:abstract={}", n),
        }
    }
}

/// The user (session) bus address for this execution context:
/// `DBUS_SESSION_BUS_ADDRESS`, else `$XDG_RUNTIME_DIR/bus`, else
/// `/run/user/<uid>/bus`.
pub fn user_bus_address() -> Result<BusAddress> {
    if let Ok(addr) = env::var("DBUS_SESSION_BUS_ADDRESS") {
        return BusAddress::parse(&addr);
    }
    if let Ok(dir) = env::var("XDG_RUNTIME_DIR") {
        return Ok(BusAddress::Path(format!("{}/bus", dir)));
    }
    let uid = unsafe { libc::getuid() };
    Ok(BusAddress::Path(format!("/run/user/{}/bus", uid)))
}

/// The system bus address: `DBUS_SYSTEM_BUS_ADDRESS`, else
/// `/run/dbus/system_bus_socket`.
pub fn system_bus_address() -> Result<BusAddress> {
    if let Ok(addr) = env::var("DBUS_SYSTEM_BUS_ADDRESS") {
        return BusAddress::parse(&addr);
    }
    Ok(BusAddress::Path("/run/dbus/system_bus_socket".into()))
}

pub(crate) fn user_bus_resolvable() -> bool {
    env::var_os("DBUS_SESSION_BUS_ADDRESS").is_some()
        || env::var_os("XDG_RUNTIME_DIR").is_some()
}

/// A connected stream to a bus endpoint.
#[derive(Debug)]
pub struct BusStream {
    inner: UnixStream,
    address: String,
}

impl BusStream {
    pub fn connect(address: &BusAddress) -> Result<BusStream> {
        tracing::debug!(address = %address, "connecting to bus");
        match Self::connect_raw(address) {
            Ok(inner) => Ok(BusStream {
                inner,
                address: address.to_string(),
            }),
            Err(source) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                source,
            }),
        }
    }

    fn connect_raw(address: &BusAddress) -> std::io::Result<UnixStream> {
        match address {
            BusAddress::Path(path) => UnixStream::connect(path),
            #[cfg(target_os = "linux")]
            BusAddress::Abstract(name) => {
                use std::os::linux::net::SocketAddrExt;
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
                UnixStream::connect_addr(&addr)
            }
            #[cfg(not(target_os = "linux"))]
            BusAddress::Abstract(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "abstract sockets are linux-only",
            )),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown(Shutdown::Both)?;
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.inner.set_read_timeout(Some(timeout))?;
        Ok(())
    }
}

impl Read for BusStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for BusStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Blocking transport over a [`BusStream`], framing each message with the
/// crate's envelope and matching replies by serial.
#[derive(Debug)]
pub struct StreamTransport {
    stream: BusStream,
}

impl StreamTransport {
    pub fn new(stream: BusStream) -> StreamTransport {
        StreamTransport { stream }
    }

    pub fn connect(address: &BusAddress) -> Result<StreamTransport> {
        Ok(StreamTransport::new(BusStream::connect(address)?))
    }
}

impl BusTransport for StreamTransport {
    fn call(&mut self, call: Message, timeout: Option<Duration>) -> Result<Message> {
        let serial = call.serial();
        self.stream
            .set_read_timeout(timeout.unwrap_or(DEFAULT_CALL_TIMEOUT))?;
        write_envelope(&mut self.stream, &call)?;
        tracing::trace!(serial, "call sent, waiting for reply");
        loop {
            let reply = read_envelope(&mut self.stream)?;
            if reply.reply_serial != serial {
                tracing::debug!(serial = reply.serial(), "skipping unrelated message");
                continue;
            }
            match reply.kind() {
                MessageKind::MethodReturn | MessageKind::Error => return Ok(reply),
                MessageKind::MethodCall => {
                    return Err(Error::BadMessage("method call in reply position"))
                }
            }
        }
    }
}

fn kind_code(kind: MessageKind) -> u8 {
    match kind {
        MessageKind::MethodCall => 1,
        MessageKind::MethodReturn => 2,
        MessageKind::Error => 3,
    }
}

fn kind_from(code: u8) -> Result<MessageKind> {
    match code {
        1 => Ok(MessageKind::MethodCall),
        2 => Ok(MessageKind::MethodReturn),
        3 => Ok(MessageKind::Error),
        _ => Err(Error::BadMessage("unknown message kind")),
    }
}

pub(crate) fn write_envelope<W: Write>(w: &mut W, msg: &Message) -> Result<()> {
    let mut payload = BytesMut::new();
    payload.put_u8(kind_code(msg.kind()));
    payload.put_u32_le(msg.serial);
    payload.put_u32_le(msg.reply_serial);
    for field in [
        &msg.destination,
        &msg.path,
        &msg.interface,
        &msg.member,
        &msg.error_name,
    ] {
        put_opt_str(&mut payload, field.as_deref());
    }
    put_str(&mut payload, &msg.signature);
    payload.put_u32_le(msg.body.len() as u32);
    payload.put_slice(&msg.body);

    w.write_all(&ENVELOPE_MAGIC)?;
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

pub(crate) fn read_envelope<R: Read>(r: &mut R) -> Result<Message> {
    let mut head = [0u8; 8];
    r.read_exact(&mut head)?;
    if head[..4] != ENVELOPE_MAGIC {
        return Err(Error::BadMessage("bad envelope magic"));
    }
    let len = u32::from_le_bytes([head[4], head[5], head[6], head[7]]) as usize;
    if len > MAX_ENVELOPE_LEN {
        return Err(Error::BadMessage("oversized envelope"));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    parse_envelope(&payload)
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        None => buf.put_u8(0),
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
    }
}

struct EnvelopeCursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> EnvelopeCursor<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = match self.at.checked_add(n) {
            Some(end) if end <= self.buf.len() => end,
            _ => return Err(Error::BadMessage("truncated envelope")),
        };
        let out = &self.buf[self.at..end];
        self.at = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let b = self.bytes(len)?;
        match std::str::from_utf8(b) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => Err(Error::BadMessage("invalid UTF-8 in envelope")),
        }
    }

    fn opt_string(&mut self) -> Result<Option<String>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.string()?)),
            _ => Err(Error::BadMessage("bad field presence flag")),
        }
    }

    fn done(&self) -> bool {
        self.at == self.buf.len()
    }
}

fn parse_envelope(buf: &[u8]) -> Result<Message> {
    let mut c = EnvelopeCursor { buf, at: 0 };
    let kind = kind_from(c.u8()?)?;
    let serial = c.u32()?;
    let reply_serial = c.u32()?;
    let destination = c.opt_string()?;
    let path = c.opt_string()?;
    let interface = c.opt_string()?;
    let member = c.opt_string()?;
    let error_name = c.opt_string()?;
    let signature = c.string()?;
    let body_len = c.u32()? as usize;
    let body = BytesMut::from(c.bytes(body_len)?);
    if !c.done() {
        return Err(Error::BadMessage("trailing envelope bytes"));
    }
    Message::from_wire(
        kind,
        serial,
        reply_serial,
        destination,
        path,
        interface,
        member,
        error_name,
        signature,
        body,
    )
}
