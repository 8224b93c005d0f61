// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![doc(test(attr(deny(dead_code))))]
#![doc(test(attr(deny(unused))))]

//! # MongoDB Session Pool
//!
//! This crate provides a bounded pool of pre-dialed database sessions for request-serving
//! processes.
//! It sits between the database driver and the code handling requests and takes care of
//!  * dialing a fixed number of sessions up front, spread over the routers of a sharded
//!    (routed) topology,
//!  * handing sessions out with a caller-controlled deadline or cancellation,
//!  * classifying the driver's (text only) errors into stable [`ErrorCode`]s, and
//!  * repairing broken sessions in the background.
//!
//! The pool does not speak any wire protocol itself.
//! The driver is plugged in through the [`backend::Dialer`] and [`backend::Connection`] traits.
//!
//! ## Basic Example
//! ```
//! use mgopool::backend::{BackendResult, Connection, DialRequest, Dialer};
//! use mgopool::config::DbInfo;
//! use mgopool::context::RequestContext;
//! use mgopool::{ErrorCode, Pool};
//!
//! #[derive(Debug)]
//! struct EchoDialer;
//!
//! struct EchoConnection;
//!
//! impl Connection for EchoConnection {
//!     fn ping(&mut self) -> BackendResult<()> {
//!         Ok(())
//!     }
//!
//!     fn live_servers(&mut self) -> BackendResult<Vec<String>> {
//!         Ok(vec![String::from("localhost:27017")])
//!     }
//!
//!     fn refresh(&mut self) {}
//!
//!     fn close(&mut self) {}
//! }
//!
//! impl Dialer for EchoDialer {
//!     type Connection = EchoConnection;
//!
//!     fn dial(&self, _request: &DialRequest<'_>) -> BackendResult<EchoConnection> {
//!         Ok(EchoConnection)
//!     }
//! }
//!
//! let info = DbInfo::new("orders", vec!["localhost".into()]).with_max_conn(2);
//! let pool = Pool::init(info, EchoDialer).unwrap();
//!
//! let mut ctx = RequestContext::background();
//! let err = pool
//!     .execute(&mut ctx, |_conn| Err::<(), _>("E11000 duplicate key error"))
//!     .unwrap_err();
//! assert_eq!(err.code(), ErrorCode::DocumentConflict);
//! assert_eq!(ctx.error_code(), Some(ErrorCode::DocumentConflict));
//! // the session went back to the pool
//! assert_eq!(pool.len(), 2);
//!
//! pool.close();
//! ```
//!
//! ## Logging
//! The crate logs through the [`log`](https://docs.rs/log) facade.
//! Every line is prefixed with the pool's name in brackets.
//!
//! **Important Notes on Usage:**
//!  * Log messages are *not* considered part of the crate's API.
//!    They may change at any time and don't follow semantic versioning.
//!  * Passwords are masked before the configuration is logged.
//!  * Background failures (reconnects) are reported via [`Pool::events()`] and logs only.
//!    Failures the caller needs to act on are reported via [`Result`]s.

mod address_;
pub mod backend;
pub mod classify;
pub mod config;
pub mod context;
mod error_;
mod pool;
pub mod retry;
mod sync;

pub use address_::Address;
pub use error_::{ErrorCode, PoolError, Result};
pub use pool::{Pool, PoolEvent, PoolMetrics, Session};

/// Addresses of database nodes.
pub mod address {
    pub use super::address_::*;
}
