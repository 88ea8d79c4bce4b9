//! Per-connection dispatch pipeline.
//!
//! Every received message runs through `validate`, then `accepts`, then
//! either the handler's `handle` or the built-in default handler. The loop
//! ends on a receive failure, a rejected message, or a handler asking to
//! close, after which the endpoint is closed.

use crate::protocol::Message;
use crate::runtime::connection::{Endpoint, Status};
use chrono::Local;
use tracing::{debug, trace};

/// Timestamp layout of the `Localtime` header in `INFO` replies.
const LOCALTIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// What the dispatch loop does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read the next message on the same connection.
    Continue,
    /// End the loop and close the connection.
    Close,
}

/// Reason a message failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalid(pub String);

impl Invalid {
    pub fn new(reason: impl Into<String>) -> Self {
        Invalid(reason.into())
    }
}

impl std::fmt::Display for Invalid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid message: {}", self.0)
    }
}

impl std::error::Error for Invalid {}

/// Operations a service plugs into the dispatch pipeline.
///
/// Every method has a default, so a service overrides only what it needs:
/// by default all messages are valid, none are accepted, and everything is
/// answered by [`default_handle`].
pub trait Handler: Send + Sync + 'static {
    /// Reject a message before routing. A rejection closes the connection.
    fn validate(&self, _endpoint: &Endpoint, _msg: &Message) -> Result<(), Invalid> {
        Ok(())
    }

    /// Whether `handle` takes this message; otherwise the default handler
    /// answers it.
    fn accepts(&self, _endpoint: &Endpoint, _msg: &Message) -> bool {
        false
    }

    /// Process an accepted message.
    fn handle(&self, endpoint: &mut Endpoint, msg: &Message) -> Flow {
        default_handle(endpoint, msg)
    }
}

/// Handler with every operation left at its default.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandler;

impl Handler for DefaultHandler {}

/// Built-in verbs:
/// - `PING` replies `PONG`
/// - `INFO` replies `INFO` with a `Localtime` header
/// - `BYE` closes without a reply
/// - a message without a verb gets `ERROR` and is closed
/// - anything else closes without a reply
pub fn default_handle(endpoint: &mut Endpoint, msg: &Message) -> Flow {
    let verb = match msg.verb() {
        Some(verb) => verb,
        None => {
            reply(endpoint, &Message::with_verb("ERROR"));
            return Flow::Close;
        }
    };

    if verb.eq_ignore_ascii_case("PING") {
        reply(endpoint, &Message::with_verb("PONG"))
    } else if verb.eq_ignore_ascii_case("INFO") {
        let mut info = Message::with_verb("INFO");
        info.add_named_header("Localtime", Local::now().format(LOCALTIME_FORMAT).to_string());
        reply(endpoint, &info)
    } else {
        trace!(verb, "Default handler closing connection");
        Flow::Close
    }
}

fn reply(endpoint: &mut Endpoint, msg: &Message) -> Flow {
    match endpoint.send(msg) {
        Ok(()) => Flow::Continue,
        Err(e) => {
            debug!(peer = ?endpoint.peer_addr(), error = %e, "Reply failed");
            Flow::Close
        }
    }
}

/// Drive one connection until it ends, then close it.
pub fn serve(mut endpoint: Endpoint) {
    let handler = endpoint.handler();
    endpoint.set_status(Status::Used);
    let mut served = 0u64;

    loop {
        let msg = match endpoint.recv() {
            Ok(msg) => msg,
            Err(e) => {
                debug!(peer = ?endpoint.peer_addr(), error = %e, "Receive ended");
                break;
            }
        };
        served += 1;

        if let Err(invalid) = handler.validate(&endpoint, &msg) {
            debug!(peer = ?endpoint.peer_addr(), verb = ?msg.verb(), %invalid, "Rejected message");
            break;
        }

        let flow = if handler.accepts(&endpoint, &msg) {
            handler.handle(&mut endpoint, &msg)
        } else {
            default_handle(&mut endpoint, &msg)
        };
        drop(msg);

        if flow == Flow::Close {
            break;
        }
    }

    debug!(peer = ?endpoint.peer_addr(), messages = served, "Dispatch loop finished");
    endpoint.close();
}
