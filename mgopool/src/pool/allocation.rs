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

use std::collections::BTreeMap;

use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::address_::Address;

/// Snapshot of the nodes discovered while initializing the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Topology {
    /// Deduplicated. Shuffled for routed topologies, sorted otherwise.
    pub(crate) live_servers: Vec<String>,
    pub(crate) routed: bool,
}

impl Topology {
    /// `discovered` may be unsorted, contain duplicates, or be empty.
    /// An empty discovery falls back to the configured addresses.
    pub(crate) fn new(
        discovered: Vec<String>,
        configured: &[Address],
        routed: bool,
        rng: &mut impl Rng,
    ) -> Self {
        let mut live_servers = discovered
            .into_iter()
            .map(|server| server.trim().to_string())
            .filter(|server| !server.is_empty())
            .sorted()
            .dedup()
            .collect::<Vec<_>>();
        if live_servers.is_empty() {
            live_servers = configured
                .iter()
                .map(Address::to_string)
                .sorted()
                .dedup()
                .collect();
        }
        if routed {
            live_servers.shuffle(rng);
        }
        Self {
            live_servers,
            routed,
        }
    }

    /// Decide which addresses each of the `sessions` sessions gets dialed against.
    ///
    /// Routed: one live server per session, round-robin over the lexicographically sorted
    /// live servers (independent of the shuffled reporting order).
    /// Otherwise: every session gets the full configured address set.
    pub(crate) fn allocate(&self, sessions: usize, configured: &[Address]) -> Allocation {
        let assignments = if self.routed && !self.live_servers.is_empty() {
            let sorted = self.live_servers.iter().sorted().collect::<Vec<_>>();
            (0..sessions)
                .map(|i| vec![Address::from(sorted[i % sorted.len()].as_str())])
                .collect()
        } else {
            (0..sessions).map(|_| configured.to_vec()).collect()
        };
        Allocation { assignments }
    }
}

/// Result of [`Topology::allocate()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Allocation {
    pub(crate) assignments: Vec<Vec<Address>>,
}

impl Allocation {
    /// Number of sessions bound to each address set.
    pub(crate) fn histogram(&self) -> BTreeMap<String, usize> {
        self.assignments
            .iter()
            .map(|addrs| addrs.iter().join(","))
            .counts()
            .into_iter()
            .collect()
    }
}
