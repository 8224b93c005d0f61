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

use std::io;
use std::sync::Arc;
use std::thread;

use itertools::Itertools;
use log::{debug, info, warn};
use rand::rngs::StdRng;

use super::{PoolEvent, PoolShared};
use crate::address_::Address;
use crate::backend::{DialRequest, Dialer};

/// Redials a broken session in the background until it can be handed back to the pool.
///
/// The broken connection has already been closed by the caller.
/// Capacity accounting: the session counts as `reconnecting` until the worker either returns it
/// through [`PoolShared::release_reconnected()`] or gives up via
/// [`PoolShared::abandon_reconnect()`].
pub(super) struct ReconnectWorker<D: Dialer> {
    shared: Arc<PoolShared<D>>,
    addrs: Vec<Address>,
    generation: u64,
    rng: StdRng,
}

impl<D: Dialer> ReconnectWorker<D> {
    pub(super) fn new(
        shared: Arc<PoolShared<D>>,
        addrs: Vec<Address>,
        generation: u64,
        rng: StdRng,
    ) -> Self {
        Self {
            shared,
            addrs,
            generation,
            rng,
        }
    }

    pub(super) fn spawn(self) -> io::Result<()> {
        let name = format!("{}-reconnect", self.shared.config.name());
        thread::Builder::new().name(name).spawn(move || self.run())?;
        Ok(())
    }

    fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let policy = &shared.options.reconnect_backoff;
        let addrs = self.addrs.iter().join(",");
        let mut attempt = 0;
        loop {
            attempt += 1;
            if !shared.is_current(self.generation) {
                debug!(
                    "[{}] pool closed, stopping reconnect to {}",
                    shared.config.name(),
                    addrs
                );
                return;
            }
            let request = DialRequest::new(&self.addrs, &shared.config);
            let err = match shared.dialer.dial(&request) {
                Ok(conn) => {
                    if shared.release_reconnected(self.addrs.clone(), conn, self.generation) {
                        info!(
                            "[{}] reconnected session to {} after {} attempt(s)",
                            shared.config.name(),
                            addrs,
                            attempt
                        );
                        shared.send_event(PoolEvent::Reconnected {
                            addrs: self.addrs,
                            attempts: attempt,
                        });
                    }
                    return;
                }
                Err(err) => err,
            };
            warn!(
                "[{}] reconnect to {} failed (attempt {}): {}",
                shared.config.name(),
                addrs,
                attempt,
                err
            );
            shared.send_event(PoolEvent::ReconnectFailed {
                addrs: self.addrs.clone(),
                attempt,
                error: err.to_string(),
            });
            if !policy.allows_retry_after(attempt) {
                warn!(
                    "[{}] giving up reconnecting to {} after {} attempt(s)",
                    shared.config.name(),
                    addrs,
                    attempt
                );
                if shared.abandon_reconnect(self.generation) {
                    shared.send_event(PoolEvent::ReconnectAbandoned {
                        addrs: self.addrs,
                        attempts: attempt,
                    });
                }
                return;
            }
            shared
                .options
                .sleeper
                .sleep(policy.delay(attempt, &mut self.rng));
        }
    }
}
