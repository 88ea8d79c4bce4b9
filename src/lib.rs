//! hermes: a small text-framed request/response protocol over TCP.
//!
//! A message is a verb line, unnamed and `Key:Value` headers, a `.`
//! terminator line and an optional body sized by `Content-Length`.
//!
//! - `protocol`: message model and wire codec
//! - `runtime`: endpoints, connectors, the manager and its dispatch loop
//! - `services`: handlers built on the dispatch pipeline
//! - `config`: CLI and TOML configuration for the server binary

pub mod config;
pub mod protocol;
pub mod runtime;
pub mod services;

pub use protocol::{Codec, Integrity, Message, MessageError, ProtocolError};
pub use runtime::{
    Connector, DefaultHandler, Endpoint, Flow, Handler, Invalid, Manager, Settings, Status,
};
