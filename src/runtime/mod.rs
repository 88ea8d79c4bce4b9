//! Connection runtime.
//!
//! - `Manager`: owns the worker pool and runs the accept loop
//! - `Endpoint` / `Connector`: one connected socket each, server and client side
//! - `dispatch`: validate → accepts → handle loop for each endpoint
//! - `WorkerPool`: bounded set of persistent threads running listener and
//!   connection jobs
//!
//! Each accepted connection is served by one worker for its whole lifetime.
//! One more worker is occupied by the accept loop.

mod connection;
pub mod dispatch;
mod listener;
mod manager;
mod pool;

pub use connection::{Connector, Endpoint, Status};
pub use dispatch::{default_handle, serve, DefaultHandler, Flow, Handler, Invalid};
pub use listener::{bind_listener, listen_with_retry, Backoff};
pub use manager::{Manager, Settings};
pub use pool::{PoolError, Submitter, WorkerPool};
