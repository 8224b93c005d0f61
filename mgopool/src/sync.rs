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

use parking_lot::{Condvar, Mutex};

/// Counter of outstanding work that can be waited on until it drops to zero.
#[derive(Debug, Default)]
pub(crate) struct WaitGroup {
    count: Mutex<usize>,
    drained: Condvar,
}

impl WaitGroup {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    pub(crate) fn add(&self) {
        *self.count.lock() += 1;
    }

    pub(crate) fn done(&self) {
        let mut count = self.count.lock();
        assert!(*count > 0, "WaitGroup::done called more often than add");
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    pub(crate) fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block until the counter is zero.
    pub(crate) fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.drained.wait(&mut count);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use rstest::*;

    use super::*;

    #[rstest]
    fn test_wait_returns_immediately_when_empty() {
        let wg = WaitGroup::new();
        wg.wait();
        assert_eq!(wg.count(), 0);
    }

    #[rstest]
    fn test_wait_blocks_until_done() {
        let wg = Arc::new(WaitGroup::new());
        wg.add();
        wg.add();
        let handle = thread::spawn({
            let wg = Arc::clone(&wg);
            move || {
                thread::sleep(Duration::from_millis(20));
                wg.done();
                thread::sleep(Duration::from_millis(20));
                wg.done();
            }
        });
        wg.wait();
        assert_eq!(wg.count(), 0);
        handle.join().unwrap();
    }

    #[rstest]
    #[should_panic]
    fn test_done_without_add_panics() {
        WaitGroup::new().done();
    }
}
