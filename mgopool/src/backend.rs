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

//! The seam between the pool and the database driver.
//!
//! The pool neither speaks a wire protocol nor resolves topologies itself.
//! It only needs to open connections ([`Dialer`]) and to ask them for a few housekeeping
//! operations ([`Connection`]).
//! Everything else (queries, updates, ...) is done by the caller on the concrete
//! [`Dialer::Connection`] type it gets from a checked-out [`Session`](crate::pool::Session).

use std::error::Error as StdError;
use std::fmt::Debug;
use std::result::Result as StdResult;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

use crate::address_::Address;
use crate::config::{DbInfo, ReadMode};

pub type BoxError = Box<dyn StdError + Send + Sync>;
pub type BackendResult<T> = StdResult<T, BoxError>;

/// Everything a [`Dialer`] needs to know to open one connection.
#[derive(Debug, Clone, Copy)]
pub struct DialRequest<'a> {
    /// Addresses the connection may use.
    /// For a routed topology, this is a single router.
    pub addrs: &'a [Address],
    pub info: &'a DbInfo,
    pub read_mode: ReadMode,
    /// Talk to `addrs` only, without discovering further servers.
    pub direct: bool,
    pub timeout: Duration,
}

impl<'a> DialRequest<'a> {
    pub(crate) fn new(addrs: &'a [Address], info: &'a DbInfo) -> Self {
        Self {
            addrs,
            info,
            read_mode: info.read_mode(),
            direct: info.direct() || (info.routed_topology() && addrs.len() == 1),
            timeout: info.timeout(),
        }
    }
}

/// Opens connections to the backend.
pub trait Dialer: Debug + Send + Sync + 'static {
    type Connection: Connection;

    fn dial(&self, request: &DialRequest<'_>) -> BackendResult<Self::Connection>;
}

/// One live connection (the driver's session) to the backend.
#[cfg_attr(test, automock)]
pub trait Connection: Send + 'static {
    /// Round trip to the server.
    fn ping(&mut self) -> BackendResult<()>;

    /// `host:port` of every node of the topology this connection currently sees.
    ///
    /// For a routed topology these are the routers.
    fn live_servers(&mut self) -> BackendResult<Vec<String>>;

    /// Drop the current socket so that the next operation uses a fresh one.
    fn refresh(&mut self);

    /// Release all resources of this connection.
    fn close(&mut self);
}
