//! Client support for typed method calls on a message bus.
//!
//! A [`Connection`] wraps one live bus session. It builds empty method-call
//! [`Message`]s addressed to a destination/path/interface/member 4-tuple,
//! sends them with a blocking [`call`](Connection::call), and hands back the
//! reply as a new `Message` positioned at the start of its body. Values are
//! described by compact type signatures (`"u"`, `"a(ssssssouso)"`,
//! `"a{sv}"`, ...) and marshaled through the signature codec in
//! [`minibus_parser`].
//!
//! The wire implementation is a black box behind the [`BusTransport`] trait.
//! [`StreamTransport`] speaks the crate's framed envelope over a unix
//! socket; [`LoopbackBus`] is an in-process endpoint that dispatches to
//! registered handlers, which is also what the test suite runs against.
//!
//! ```
//! use minibus::{Connection, LoopbackBus, Message, ReadResult, Value};
//!
//! let mut bus = LoopbackBus::new("org.example.Calc");
//! bus.register("org.example.Calc", "Add", |call| {
//!     let a = call.read_u32().unwrap().value().unwrap();
//!     let b = call.read_u32().unwrap().value().unwrap();
//!     let mut reply = Message::new_method_return(call).unwrap();
//!     reply.append("u", &[Value::Uint32(a + b)]).unwrap();
//!     Ok(reply)
//! });
//!
//! let conn = Connection::with_transport(Box::new(bus));
//! let mut conn = conn.write().unwrap();
//! let mut call = conn
//!     .new_method_call("org.example.Calc", "/org/example/Calc", "org.example.Calc", "Add")
//!     .unwrap();
//! call.append("uu", &[Value::Uint32(2), Value::Uint32(3)]).unwrap();
//! let mut reply = conn.call(call, None).unwrap();
//! assert_eq!(reply.read_u32().unwrap(), ReadResult::Value(5));
//! ```
//!
//! Reading a container runs until [`ReadResult::End`], the designed loop
//! terminator:
//!
//! ```no_run
//! # fn list_units() -> minibus::Result<()> {
//! use minibus::{Connection, ContainerKind, ReadResult};
//!
//! let conn = Connection::open()?;
//! let mut conn = conn.write().unwrap();
//! let call = conn.new_method_call(
//!     "org.freedesktop.systemd1",
//!     "/org/freedesktop/systemd1",
//!     "org.freedesktop.systemd1.Manager",
//!     "ListUnits",
//! )?;
//! let mut reply = conn.call(call, None)?;
//! reply.enter_container(ContainerKind::Array, "(ssssssouso)")?;
//! loop {
//!     match reply.read("(ssssssouso)")? {
//!         ReadResult::End => break,
//!         ReadResult::Value(_unit) => { /* one 10-field record */ }
//!     }
//! }
//! reply.exit_container()?;
//! # Ok(())
//! # }
//! ```
//!
//! A `Connection` is pinned to the thread that opened it: the handle type
//! is deliberately not `Send`, and repeated [`Connection::open`] calls on
//! one thread return new references to the same underlying session.

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

mod client;
mod error;
mod loopback;
mod message;
mod value;

#[cfg(test)]
mod test;

pub use crate::client::{
    system_bus_address, user_bus_address, BusAddress, BusStream, StreamTransport,
};
pub use crate::error::{Error, Result};
pub use crate::loopback::{
    LoopbackBus, ERROR_FAILED, ERROR_SERVICE_UNKNOWN, ERROR_UNKNOWN_METHOD,
};
pub use crate::message::{ContainerKind, Message, MessageKind, ReadResult};
pub use crate::value::{is_valid_object_path, Value};

/// The black-box seam to the bus wire implementation.
///
/// A transport owns whatever it needs to reach the peer and resolves one
/// blocking call into the matching reply message (which may be an error
/// reply), a timeout, or a transport failure.
pub trait BusTransport: Send {
    /// Send `call` and block until the matching reply arrives, the timeout
    /// elapses, or the transport fails. `None` defers to the transport's
    /// default timeout.
    fn call(&mut self, call: Message, timeout: Option<Duration>) -> Result<Message>;
}

/// A structured error returned by the remote side of a call, as an owned
/// copy with independent storage.
///
/// Copying a not-yet-set error yields the all-`None` default rather than a
/// fault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteError {
    name: Option<String>,
    message: Option<String>,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> RemoteError {
        RemoteError {
            name: Some(name.into()),
            message: Some(message.into()),
        }
    }

    /// The symbolic error name, e.g. `org.freedesktop.DBus.Error.Failed`.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The human-readable message.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_set(&self) -> bool {
        self.name.is_some() || self.message.is_some()
    }

    pub(crate) fn errno(&self) -> i32 {
        match self.name.as_deref() {
            Some("org.freedesktop.DBus.Error.ServiceUnknown")
            | Some("org.freedesktop.DBus.Error.UnknownMethod") => libc::ENXIO,
            Some("org.freedesktop.DBus.Error.AccessDenied") => libc::EACCES,
            Some("org.freedesktop.DBus.Error.NoReply") => libc::ETIMEDOUT,
            Some("org.freedesktop.DBus.Error.LimitsExceeded") => libc::ENOBUFS,
            _ => libc::EIO,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.name, &self.message) {
            (Some(n), Some(m)) => write!(f, "{}: {}", n, m),
            (Some(n), None) => f.write_str(n),
            (None, Some(m)) => f.write_str(m),
            (None, None) => f.write_str("unset remote error"),
        }
    }
}

/// A borrowed view of the remote error retained by a [`Connection`].
///
/// Valid until the connection issues its next call or is closed; the borrow
/// checker enforces exactly that. Use [`to_owned`](RemoteErrorRef::to_owned)
/// to extend the lifetime with an independent copy.
#[derive(Debug, Clone, Copy)]
pub struct RemoteErrorRef<'a> {
    name: Option<&'a str>,
    message: Option<&'a str>,
}

impl<'a> RemoteErrorRef<'a> {
    pub fn name(&self) -> Option<&'a str> {
        self.name
    }

    pub fn message(&self) -> Option<&'a str> {
        self.message
    }

    pub fn to_owned(&self) -> RemoteError {
        RemoteError {
            name: self.name.map(str::to_string),
            message: self.message.map(str::to_string),
        }
    }
}

thread_local! {
    static DEFAULT_BUS: RefCell<Weak<RwLock<Connection>>> = RefCell::new(Weak::new());
}

/// One live bus session.
///
/// Holds the transport handle, the serial counter, the numeric code of the
/// last failed operation and the remote error of the most recent failed
/// call. Obtained from [`open`](Connection::open) (default bus, cached
/// per thread), [`open_user`](Connection::open_user),
/// [`open_system`](Connection::open_system), or
/// [`with_transport`](Connection::with_transport).
pub struct Connection {
    transport: Option<Box<dyn BusTransport>>,
    address: Option<String>,
    remote_error: Option<RemoteError>,
    next_serial: u32,
    last_errno: i32,
}

impl Connection {
    /// Wrap an already-connected transport.
    pub fn with_transport(transport: Box<dyn BusTransport>) -> Arc<RwLock<Connection>> {
        Connection::from_parts(transport, None)
    }

    fn from_parts(
        transport: Box<dyn BusTransport>,
        address: Option<String>,
    ) -> Arc<RwLock<Connection>> {
        Arc::new(RwLock::new(Connection {
            transport: Some(transport),
            address,
            remote_error: None,
            next_serial: 1,
            last_errno: 0,
        }))
    }

    /// Open the default bus for this execution context: the user bus when a
    /// user-session address is resolvable, the system bus otherwise.
    ///
    /// Repeated calls from the same thread return a new reference to the
    /// same underlying connection as long as one is still alive.
    pub fn open() -> Result<Arc<RwLock<Connection>>> {
        default_bus_cached(Connection::open_default_fresh)
    }

    fn open_default_fresh() -> Result<Arc<RwLock<Connection>>> {
        if client::user_bus_resolvable() {
            Connection::open_user()
        } else {
            Connection::open_system()
        }
    }

    /// Open a fresh connection to the user (session) bus.
    pub fn open_user() -> Result<Arc<RwLock<Connection>>> {
        let address = client::user_bus_address()?;
        let transport = StreamTransport::connect(&address)?;
        Ok(Connection::from_parts(
            Box::new(transport),
            Some(address.to_string()),
        ))
    }

    /// Open a fresh connection to the system bus.
    pub fn open_system() -> Result<Arc<RwLock<Connection>>> {
        let address = client::system_bus_address()?;
        let transport = StreamTransport::connect(&address)?;
        Ok(Connection::from_parts(
            Box::new(transport),
            Some(address.to_string()),
        ))
    }

    /// The bus address this connection was opened against, if any.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Build an empty method call addressed to the 4-tuple. All four names
    /// must be non-empty and NUL-free, the path `/`-rooted.
    pub fn new_method_call(
        &mut self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<Message> {
        match Message::method_call(destination, path, interface, member) {
            Err(e) => {
                self.last_errno = e.errno();
                Err(e)
            }
            ok => ok,
        }
    }

    /// Send `message` and block until the matching reply, the timeout, or a
    /// failure. `None` defers to the transport's default timeout.
    ///
    /// The previously retained remote error is cleared first. An error
    /// reply from the remote side fails with [`Error::Remote`] and is
    /// retained for [`last_remote_error`](Connection::last_remote_error);
    /// transport-level failures retain nothing. The connection stays usable
    /// either way.
    pub fn call(&mut self, message: Message, timeout: Option<Duration>) -> Result<Message> {
        self.remote_error = None;
        match self.call_inner(message, timeout) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.last_errno = e.errno();
                if let Error::Remote(remote) = &e {
                    self.remote_error = Some(remote.clone());
                }
                tracing::debug!(errno = self.last_errno, error = %e, "method call failed");
                Err(e)
            }
        }
    }

    fn call_inner(&mut self, mut message: Message, timeout: Option<Duration>) -> Result<Message> {
        if message.kind() != MessageKind::MethodCall {
            return Err(Error::InvalidArgument(
                "only method calls can be sent".into(),
            ));
        }
        if message.has_open_containers() {
            return Err(Error::UnclosedContainer);
        }
        let transport = self.transport.as_mut().ok_or(Error::ConnectionClosed)?;
        message.serial = self.next_serial;
        self.next_serial = self.next_serial.checked_add(1).unwrap_or(1);
        tracing::debug!(
            serial = message.serial,
            destination = message.destination().unwrap_or(""),
            member = message.member().unwrap_or(""),
            "sending method call"
        );
        let mut reply = transport.call(message, timeout)?;
        reply.rewind();
        if reply.kind() == MessageKind::Error {
            let name = reply.error_name().map(str::to_string);
            let text = match reply.read_str() {
                Ok(ReadResult::Value(s)) => Some(s.to_string()),
                _ => None,
            };
            return Err(Error::Remote(RemoteError {
                name,
                message: text,
            }));
        }
        Ok(reply)
    }

    /// Borrowed view of the remote error retained by the most recent failed
    /// call, if any.
    pub fn last_remote_error(&self) -> Option<RemoteErrorRef<'_>> {
        self.remote_error.as_ref().map(|e| RemoteErrorRef {
            name: e.name(),
            message: e.message(),
        })
    }

    /// Independent copy of the retained remote error. All-`None` when no
    /// error is retained.
    pub fn copy_remote_error(&self) -> RemoteError {
        self.remote_error.clone().unwrap_or_default()
    }

    /// Numeric code of the most recent failed operation, 0 when none.
    pub fn last_errno(&self) -> i32 {
        self.last_errno
    }

    /// Release the session reference and any retained remote error.
    /// Idempotent; dropping the connection does the same.
    pub fn close(&mut self) {
        self.transport = None;
        self.remote_error = None;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn default_bus_cached<F>(open_fresh: F) -> Result<Arc<RwLock<Connection>>>
where
    F: FnOnce() -> Result<Arc<RwLock<Connection>>>,
{
    DEFAULT_BUS.with(|cell| {
        if let Some(conn) = cell.borrow().upgrade() {
            return Ok(conn);
        }
        let conn = open_fresh()?;
        *cell.borrow_mut() = Arc::downgrade(&conn);
        Ok(conn)
    })
}
