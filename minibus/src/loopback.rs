//! An in-process bus endpoint.
//!
//! Dispatches method calls to handlers registered per (interface, member)
//! and answers anything else with the standard error replies. Useful for
//! exercising the client surface without a reachable bus, which is also how
//! the test suite runs.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;
use crate::message::Message;
use crate::{BusTransport, RemoteError};

pub const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

type Handler = Box<dyn FnMut(&mut Message) -> std::result::Result<Message, RemoteError> + Send>;

/// A transport that dispatches calls in-process.
///
/// Handlers receive the call message rewound to the start of its body and
/// return either a reply built with [`Message::new_method_return`] or a
/// [`RemoteError`], which is turned into an error reply.
pub struct LoopbackBus {
    destination: String,
    handlers: HashMap<(String, String), Handler>,
}

impl LoopbackBus {
    /// An endpoint answering for the given destination name.
    pub fn new(destination: &str) -> LoopbackBus {
        LoopbackBus {
            destination: destination.into(),
            handlers: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, interface: &str, member: &str, handler: F)
    where
        F: FnMut(&mut Message) -> std::result::Result<Message, RemoteError> + Send + 'static,
    {
        self.handlers
            .insert((interface.into(), member.into()), Box::new(handler));
    }
}

impl BusTransport for LoopbackBus {
    fn call(&mut self, mut call: Message, _timeout: Option<Duration>) -> Result<Message> {
        call.rewind();
        if call.destination() != Some(self.destination.as_str()) {
            return Message::new_error(&call, ERROR_SERVICE_UNKNOWN, "no such service");
        }
        let key = (
            call.interface().unwrap_or("").to_string(),
            call.member().unwrap_or("").to_string(),
        );
        match self.handlers.get_mut(&key) {
            Some(handler) => match handler(&mut call) {
                Ok(reply) => Ok(reply),
                Err(e) => Message::new_error(
                    &call,
                    e.name().unwrap_or(ERROR_FAILED),
                    e.message().unwrap_or(""),
                ),
            },
            None => Message::new_error(&call, ERROR_UNKNOWN_METHOD, "unknown method"),
        }
    }
}
