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

use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use itertools::Itertools;

use super::PoolShared;
use crate::address_::Address;
use crate::backend::{Connection, Dialer};

/// A pooled connection together with the addresses it was dialed against.
pub(crate) struct RawSession<C> {
    pub(crate) addrs: Vec<Address>,
    pub(crate) conn: C,
}

impl<C: Connection> RawSession<C> {
    pub(crate) fn close(mut self) {
        self.conn.close();
    }
}

impl<C> Debug for RawSession<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSession")
            .field("addrs", &self.addrs.iter().join(","))
            .finish_non_exhaustive()
    }
}

/// A session checked out of a [`Pool`](super::Pool).
///
/// Dereferences to the backend connection.
/// Dropping the session hands it back to the pool it came from, so does
/// [`Pool::put()`](super::Pool::put).
pub struct Session<D: Dialer> {
    raw: Option<RawSession<D::Connection>>,
    shared: Arc<PoolShared<D>>,
    generation: u64,
}

impl<D: Dialer> Session<D> {
    pub(super) fn new(
        raw: RawSession<D::Connection>,
        shared: Arc<PoolShared<D>>,
        generation: u64,
    ) -> Self {
        Self {
            raw: Some(raw),
            shared,
            generation,
        }
    }

    /// The addresses the session's connection was dialed against.
    pub fn addrs(&self) -> &[Address] {
        &self.raw().addrs
    }

    pub(super) fn generation(&self) -> u64 {
        self.generation
    }

    /// Take the connection out of the session without returning it to the pool.
    ///
    /// The caller becomes responsible for the in-flight accounting.
    pub(super) fn into_raw(mut self) -> RawSession<D::Connection> {
        self.raw
            .take()
            .expect("raw session should be Some from init to drop")
    }

    fn raw(&self) -> &RawSession<D::Connection> {
        self.raw
            .as_ref()
            .expect("raw session should be Some from init to drop")
    }
}

impl<D: Dialer> Drop for Session<D> {
    fn drop(&mut self) {
        let Some(raw) = self.raw.take() else {
            return;
        };
        self.shared.release(raw, self.generation);
        self.shared.in_flight.done();
    }
}

impl<D: Dialer> Deref for Session<D> {
    type Target = D::Connection;

    fn deref(&self) -> &Self::Target {
        &self.raw().conn
    }
}

impl<D: Dialer> DerefMut for Session<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .raw
            .as_mut()
            .expect("raw session should be Some from init to drop")
            .conn
    }
}

impl<D: Dialer> Debug for Session<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pool", &self.shared.config.name())
            .field("generation", &self.generation)
            .field("raw", &self.raw)
            .finish()
    }
}
