#![forbid(unsafe_code)]
//! Request-processing core of an asynchronous 9P2000 / 9P2000.u file server.
//!
//! The crate sits between a transport that decodes 9P messages and a backend
//! that owns the file tree. For every message it enforces the protocol
//! invariants a backend should not have to care about:
//!
//! - the per-connection fid table, with reference counts deciding when the
//!   backend is told a fid is gone
//! - the table of outstanding requests keyed by tag
//! - `TFlush` of queued and running requests
//! - `TVersion` negotiation of message size and protocol variant
//! - the validation gate in front of each backend operation
//!
//! # Getting Started
//!
//! 1. Pick a type for your per-fid state (or `()`)
//! 2. Implement [`srv::Filesystem`], plus [`srv::AuthOps`] or
//!    [`srv::FlushOp`] if you support them
//! 3. Build a [`srv::Srv`] with a [`users::Users`] resolver and serve it
//!    with [`srv::srv_async`]
//!
//! ```no_run
//! use p9srv::{srv::{srv_async, Filesystem, Req, Srv, SrvConfig}, users::UserTable, FCall, Qid, QidType, Result};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct MyFs;
//!
//! #[async_trait]
//! impl Filesystem for MyFs {
//!     type FId = ();
//!
//!     async fn rattach(&self, _req: &Req<Self::FId>) -> Result<FCall> {
//!         Ok(FCall::RAttach {
//!             qid: Qid { typ: QidType::DIR, version: 0, path: 0 },
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let users = Arc::new(UserTable::new().with("glenda", 1000));
//!     let srv = Arc::new(Srv::new(MyFs, users, SrvConfig::default()));
//!     srv_async(srv, "tcp!127.0.0.1!564").await
//! }
//! ```
//!
//! # Errors
//!
//! Validation failures and backend errors are both [`Error`]s and reach the
//! client as `RError`, carrying the error's text and, on 9P2000.u
//! connections, its errno.
//!
//! # Transport
//!
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!0.0.0.0!564"`)
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/socket!0"`)
pub mod error;
pub mod fcall;
pub mod serialize;
pub mod srv;
pub mod users;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;

pub type Result<T> = ::std::result::Result<T, error::Error>;
