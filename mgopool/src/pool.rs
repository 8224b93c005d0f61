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

mod allocation;
mod reconnect;
mod session;

use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use flume::{Receiver, RecvTimeoutError, Selector, Sender, TrySendError};
use itertools::Itertools;
use log::{debug, error, info, log_enabled, warn, Level};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::address_::Address;
use crate::backend::{Connection, DialRequest, Dialer};
use crate::classify::RecoveryAction;
use crate::config::{DbInfo, PoolOptions};
use crate::context::RequestContext;
use crate::error_::{PoolError, Result};
use crate::sync::WaitGroup;
use allocation::Topology;
use reconnect::ReconnectWorker;
use session::RawSession;
pub use session::Session;

/// Point-in-time view of the pool's accounting.
///
/// While the pool is available, `idle + in_use + reconnecting == capacity` holds whenever no
/// session is in the middle of a hand-off.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct PoolMetrics {
    /// Sessions that were dialed successfully and not retired since.
    pub capacity: usize,
    /// Sessions waiting in the pool.
    pub idle: usize,
    /// Sessions checked out by callers.
    pub in_use: usize,
    /// Sessions being redialed in the background.
    pub reconnecting: usize,
}

/// Notifications about the pool's background work.
///
/// See [`Pool::events()`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolEvent {
    /// A session could not be dialed during initialization and was left out of the pool.
    ///
    /// `attempts` is 0 if the dial thread panicked before reporting.
    DialAbandoned {
        addrs: Vec<Address>,
        attempts: usize,
        error: String,
    },
    /// One attempt to redial a broken session failed.
    ReconnectFailed {
        addrs: Vec<Address>,
        attempt: usize,
        error: String,
    },
    /// A broken session was redialed and is back in the pool.
    Reconnected {
        addrs: Vec<Address>,
        attempts: usize,
    },
    /// Redialing a broken session ran out of attempts; the pool's capacity shrank by one.
    ReconnectAbandoned {
        addrs: Vec<Address>,
        attempts: usize,
    },
}

/// Bounded pool of backend sessions.
///
/// The pool dials [`DbInfo::max_conn()`] sessions up front and hands them out with
/// [`Pool::get()`].
/// Broken sessions are redialed in the background (see [`Pool::handle_error()`]).
///
/// Cloning the pool is cheap; all clones share the same sessions.
pub struct Pool<D: Dialer> {
    shared: Arc<PoolShared<D>>,
}

pub(crate) struct PoolShared<D: Dialer> {
    config: Arc<DbInfo>,
    dialer: D,
    options: PoolOptions,
    state: RwLock<PoolState<D::Connection>>,
    in_flight: WaitGroup,
    rng: Mutex<StdRng>,
    events: (Sender<PoolEvent>, Receiver<PoolEvent>),
    // serializes close and recover
    admin: Mutex<()>,
}

struct PoolState<C> {
    available: bool,
    generation: u64,
    queue: Option<SessionQueue<C>>,
    capacity: usize,
    reconnecting: usize,
    live_servers: Vec<String>,
    allocation: BTreeMap<String, usize>,
}

struct SessionQueue<C> {
    generation: u64,
    tx: Sender<RawSession<C>>,
    rx: Receiver<RawSession<C>>,
}

impl<C> PoolState<C> {
    fn current_queue(&self, generation: u64) -> Option<&SessionQueue<C>> {
        self.queue
            .as_ref()
            .filter(|queue| queue.generation == generation)
    }
}

impl<D: Dialer> Pool<D> {
    /// Dial the pool with default [`PoolOptions`].
    ///
    /// See [`Pool::init_with_options()`].
    pub fn init(config: DbInfo, dialer: D) -> Result<Self> {
        Self::init_with_options(config, PoolOptions::default(), dialer)
    }

    /// Validate `config`, discover the topology, and dial all sessions.
    ///
    /// Sessions that cannot be dialed within the [`PoolOptions::with_dial_backoff()`] attempts
    /// are left out, so the pool may start with fewer than [`DbInfo::max_conn()`] sessions.
    ///
    /// # Errors
    ///  * [`PoolError::InvalidConfig`] if `config` is unusable.
    ///  * [`PoolError::Disconnect`] if the topology could not be discovered on any attempt.
    pub fn init_with_options(config: DbInfo, options: PoolOptions, dialer: D) -> Result<Self> {
        config.validate()?;
        info!(
            "[{}] initializing pool with {:?}",
            config.name(),
            config.masked()
        );
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let events = flume::bounded(options.event_capacity);
        let shared = Arc::new(PoolShared {
            config: Arc::new(config),
            dialer,
            options,
            state: RwLock::new(PoolState {
                available: false,
                generation: 0,
                queue: None,
                capacity: 0,
                reconnecting: 0,
                live_servers: Vec::new(),
                allocation: BTreeMap::new(),
            }),
            in_flight: WaitGroup::new(),
            rng: Mutex::new(rng),
            events,
            admin: Mutex::new(()),
        });
        shared.start_generation()?;
        Ok(Self { shared })
    }

    /// Check out a session.
    ///
    /// Blocks until a session is idle, the `ctx`'s deadline passes, or the `ctx` is cancelled.
    ///
    /// # Errors
    ///  * [`PoolError::PoolClosed`] if the pool is (or gets) closed.
    ///  * [`PoolError::Timeout`] if the deadline passed or the context was cancelled.
    pub fn get(&self, ctx: &RequestContext) -> Result<Session<D>> {
        let (rx, generation) = {
            let state = self.shared.state.read();
            match (&state.queue, state.available) {
                (Some(queue), true) => (queue.rx.clone(), queue.generation),
                _ => return Err(PoolError::PoolClosed),
            }
        };
        if ctx.is_cancelled() {
            return Err(PoolError::acquisition_cancelled());
        }
        let raw = Self::receive(&rx, ctx)?;
        self.shared.check_out(raw, generation)
    }

    fn receive(
        rx: &Receiver<RawSession<D::Connection>>,
        ctx: &RequestContext,
    ) -> Result<RawSession<D::Connection>> {
        const DURING: &str = "waiting for an idle session";
        match (ctx.cancellations(), ctx.deadline()) {
            ([], None) => rx.recv().map_err(|_| PoolError::PoolClosed),
            ([], Some(deadline)) => rx.recv_deadline(deadline).map_err(|err| match err {
                RecvTimeoutError::Timeout => PoolError::acquisition_timeout(DURING),
                RecvTimeoutError::Disconnected => PoolError::PoolClosed,
            }),
            (cancellations, deadline) => {
                let selector = cancellations.iter().fold(
                    Selector::new().recv(rx, |res| res.map_err(|_| PoolError::PoolClosed)),
                    |selector, cancel| {
                        selector.recv(cancel, |_| Err(PoolError::acquisition_cancelled()))
                    },
                );
                match deadline {
                    None => selector.wait(),
                    Some(deadline) => selector
                        .wait_deadline(deadline)
                        .unwrap_or_else(|_| Err(PoolError::acquisition_timeout(DURING))),
                }
            }
        }
    }

    /// Return a session to the pool.
    ///
    /// Same as dropping the session.
    #[inline]
    pub fn put(&self, session: Session<D>) {
        drop(session);
    }

    /// Hand a broken session to a background worker that redials it.
    ///
    /// Until the worker is done, the pool has one idle session less.
    pub fn reconnect(&self, session: Session<D>) {
        let generation = session.generation();
        let raw = session.into_raw();
        self.shared.start_reconnect(raw, generation);
        self.shared.in_flight.done();
    }

    /// Check out a session, run `op` on its connection, and return the session.
    ///
    /// Errors of `op` are handled by [`Pool::handle_error()`].
    pub fn execute<R, E, F>(&self, ctx: &mut RequestContext, op: F) -> Result<R>
    where
        E: Display,
        F: FnOnce(&mut D::Connection) -> std::result::Result<R, E>,
    {
        let mut session = self.get(ctx)?;
        match op(&mut *session) {
            Ok(res) => {
                self.put(session);
                Ok(res)
            }
            Err(err) => Err(self.handle_error(ctx, session, &err)),
        }
    }

    /// Classify a driver error, dispose of the session accordingly, and return the domain error.
    ///
    /// The resulting [`ErrorCode`](crate::ErrorCode) is also stamped onto `ctx`.
    pub fn handle_error<E: Display + ?Sized>(
        &self,
        ctx: &mut RequestContext,
        mut session: Session<D>,
        err: &E,
    ) -> PoolError {
        let message = err.to_string();
        let classification = self.shared.options.classifier.classify(&message);
        ctx.stamp_error_code(classification.code);
        debug!(
            "[{}] classified {:?} as {} ({:?})",
            self.name(),
            message,
            classification.code,
            classification.action
        );
        match classification.action {
            RecoveryAction::PutBack => self.put(session),
            RecoveryAction::Reconnect => self.reconnect(session),
            RecoveryAction::RefreshAndPutBack => {
                session.refresh();
                self.put(session);
            }
        }
        PoolError::classified(classification, message)
    }

    /// Round trip to the backend over one pooled session.
    pub fn ping(&self, ctx: &mut RequestContext) -> Result<()> {
        self.execute(ctx, |conn| conn.ping())
    }

    /// Stop handing out sessions and close all of them.
    ///
    /// Blocks until every checked-out session was returned.
    /// Sessions that are being redialed are not waited for; they are closed by their worker.
    /// Closing a closed pool does nothing.
    ///
    /// **Note:** calling this while holding a [`Session`] of this pool on the same thread
    /// never returns.
    pub fn close(&self) {
        let _admin = self.shared.admin.lock();
        self.shared.close_generation();
    }

    /// Close the pool and dial it again with the same configuration.
    ///
    /// Initialization is retried until it succeeds, pausing one
    /// [`LinearBackoff::step()`](crate::retry::LinearBackoff::step) between attempts.
    pub fn recover(&self) {
        let _admin = self.shared.admin.lock();
        self.shared.close_generation();
        let mut attempt = 1;
        while let Err(err) = self.shared.start_generation() {
            error!(
                "[{}] recovering pool failed (attempt {}): {}",
                self.name(),
                attempt,
                err
            );
            self.shared
                .options
                .sleeper
                .sleep(self.shared.options.dial_backoff.step());
            attempt += 1;
        }
    }

    /// [`Pool::recover()`] if fewer than `ceil(max_conn * min_fraction)` sessions are left.
    ///
    /// Returns whether the pool was recovered.
    ///
    /// # Errors
    /// [`PoolError::InvalidConfig`] if `min_fraction` is not within `0.0..=1.0`.
    pub fn recover_if_degraded(&self, min_fraction: f64) -> Result<bool> {
        if !(0.0..=1.0).contains(&min_fraction) {
            return Err(PoolError::invalid_config(format!(
                "min_fraction must be within 0.0..=1.0, got {min_fraction}"
            )));
        }
        let max_conn = self.shared.config.max_conn();
        let required = (max_conn as f64 * min_fraction).ceil() as usize;
        let capacity = self.cap();
        if capacity >= required {
            return Ok(false);
        }
        warn!(
            "[{}] pool degraded to {}/{} sessions (required {}), recovering",
            self.name(),
            capacity,
            max_conn,
            required
        );
        self.recover();
        Ok(true)
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.shared.config.name()
    }

    #[inline]
    pub fn config(&self) -> &DbInfo {
        &self.shared.config
    }

    pub fn is_available(&self) -> bool {
        self.shared.state.read().available
    }

    /// Number of idle sessions.
    pub fn len(&self) -> usize {
        self.shared
            .state
            .read()
            .queue
            .as_ref()
            .map(|queue| queue.rx.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sessions the pool manages (idle, checked out, or reconnecting).
    pub fn cap(&self) -> usize {
        self.shared.state.read().capacity
    }

    /// The topology nodes discovered at the last initialization.
    pub fn live_servers(&self) -> Vec<String> {
        self.shared.state.read().live_servers.clone()
    }

    /// The configuration with the password masked.
    pub fn show_config(&self) -> BTreeMap<String, String> {
        self.shared.config.show_config()
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.shared.state.read();
        PoolMetrics {
            capacity: state.capacity,
            idle: state.queue.as_ref().map(|q| q.rx.len()).unwrap_or_default(),
            in_use: self.shared.in_flight.count(),
            reconnecting: state.reconnecting,
        }
    }

    /// How many sessions were dialed against each address (set) at the last initialization.
    ///
    /// Keys are comma separated `host:port` lists.
    pub fn allocation(&self) -> BTreeMap<String, usize> {
        self.shared.state.read().allocation.clone()
    }

    /// Receiver of [`PoolEvent`]s.
    ///
    /// All receivers share one bounded buffer (see [`PoolOptions::with_event_capacity()`]):
    /// each event is delivered to one receiver only, and events are dropped while the buffer
    /// is full.
    pub fn events(&self) -> Receiver<PoolEvent> {
        self.shared.events.1.clone()
    }
}

impl<D: Dialer> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: Dialer> Debug for Pool<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name())
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl<D: Dialer> PoolShared<D> {
    fn start_generation(&self) -> Result<()> {
        let started = Instant::now();
        let discovered = self.discover()?;
        let topology = Topology::new(
            discovered,
            self.config.addrs(),
            self.config.routed_topology(),
            &mut *self.rng.lock(),
        );
        let allocation = topology.allocate(self.config.max_conn(), self.config.addrs());
        let histogram = allocation.histogram();

        let (tx, rx) = flume::bounded(self.config.max_conn());
        let mut capacity = 0;
        for raw in self.dial_all(allocation.assignments) {
            match tx.try_send(raw) {
                Ok(()) => capacity += 1,
                Err(err) => err.into_inner().close(),
            }
        }
        if capacity < self.config.max_conn() {
            warn!(
                "[{}] pool degraded: dialed {} of {} sessions",
                self.config.name(),
                capacity,
                self.config.max_conn()
            );
        }

        let mut state = self.state.write();
        let generation = state.generation + 1;
        state.generation = generation;
        state.queue = Some(SessionQueue { generation, tx, rx });
        state.capacity = capacity;
        state.reconnecting = 0;
        state.available = true;
        info!(
            "[{}] pool ready with {} session(s) in {:?}; live servers: {}",
            self.config.name(),
            capacity,
            started.elapsed(),
            topology.live_servers.iter().join(", ")
        );
        if log_enabled!(Level::Debug) {
            debug!("[{}] allocation: {:?}", self.config.name(), histogram);
        }
        state.live_servers = topology.live_servers;
        state.allocation = histogram;
        Ok(())
    }

    fn discover(&self) -> Result<Vec<String>> {
        let request = DialRequest::new(self.config.addrs(), &self.config);
        self.options
            .dial_backoff
            .run(
                &*self.options.sleeper,
                |_| {
                    let mut conn = self.dialer.dial(&request)?;
                    let servers = conn.live_servers();
                    conn.close();
                    servers
                },
                |attempt, err| {
                    warn!(
                        "[{}] discovering topology failed (attempt {}): {}",
                        self.config.name(),
                        attempt,
                        err
                    )
                },
            )
            .map_err(PoolError::discovery_error)
    }

    /// Dials every assignment on at most `max_concurrent_dials` named worker threads.
    ///
    /// Assignments a worker never reported back (it panicked) are abandoned like failed dials.
    fn dial_all(&self, assignments: Vec<Vec<Address>>) -> Vec<RawSession<D::Connection>> {
        let (work_tx, work_rx) = flume::unbounded();
        for job in assignments.iter().cloned().enumerate() {
            // can't fail, `work_rx` is alive
            let _ = work_tx.send(job);
        }
        drop(work_tx);
        let (done_tx, done_rx) = flume::unbounded();
        let dial_worker = |work_rx: Receiver<(usize, Vec<Address>)>,
                           done_tx: Sender<(usize, Option<RawSession<D::Connection>>)>| {
            for (index, addrs) in work_rx.iter() {
                let raw = self.dial_session(index, addrs);
                if let Err(err) = done_tx.send((index, raw)) {
                    if let (_, Some(raw)) = err.into_inner() {
                        raw.close();
                    }
                }
            }
        };

        let workers = self.options.max_concurrent_dials.min(assignments.len());
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for worker in 0..workers {
                let work_rx = work_rx.clone();
                let done_tx = done_tx.clone();
                match thread::Builder::new()
                    .name(format!("{}-dial-{}", self.config.name(), worker))
                    .spawn_scoped(scope, move || dial_worker(work_rx, done_tx))
                {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        warn!(
                            "[{}] could not spawn dial worker {}: {}",
                            self.config.name(),
                            worker,
                            err
                        );
                        break;
                    }
                }
            }
            if handles.is_empty() && workers > 0 {
                dial_worker(work_rx.clone(), done_tx.clone());
            }
            for handle in handles {
                if handle.join().is_err() {
                    error!("[{}] dial worker panicked", self.config.name());
                }
            }
        });
        drop(done_tx);

        let mut reported = vec![false; assignments.len()];
        let mut dialed = Vec::with_capacity(assignments.len());
        for (index, raw) in done_rx.try_iter() {
            reported[index] = true;
            dialed.extend(raw.map(|raw| (index, raw)));
        }
        for (addrs, _) in assignments
            .into_iter()
            .zip(reported)
            .filter(|(_, reported)| !reported)
        {
            warn!(
                "[{}] abandoning session against {}: dial worker panicked",
                self.config.name(),
                addrs.iter().join(","),
            );
            self.send_event(PoolEvent::DialAbandoned {
                addrs,
                attempts: 0,
                error: String::from("dial worker panicked"),
            });
        }
        dialed
            .into_iter()
            .sorted_by_key(|(index, _)| *index)
            .map(|(_, raw)| raw)
            .collect()
    }

    fn dial_session(
        &self,
        index: usize,
        addrs: Vec<Address>,
    ) -> Option<RawSession<D::Connection>> {
        let request = DialRequest::new(&addrs, &self.config);
        let mut attempts = 0;
        let res = self.options.dial_backoff.run(
            &*self.options.sleeper,
            |attempt| {
                attempts = attempt;
                self.dialer.dial(&request)
            },
            |attempt, err| {
                debug!(
                    "[{}] dialing session {} failed (attempt {}): {}",
                    self.config.name(),
                    index,
                    attempt,
                    err
                )
            },
        );
        match res {
            Ok(conn) => Some(RawSession { addrs, conn }),
            Err(err) => {
                warn!(
                    "[{}] abandoning session {} against {} after {} attempt(s): {}",
                    self.config.name(),
                    index,
                    addrs.iter().join(","),
                    attempts,
                    err
                );
                self.send_event(PoolEvent::DialAbandoned {
                    addrs,
                    attempts,
                    error: err.to_string(),
                });
                None
            }
        }
    }

    fn check_out(
        self: &Arc<Self>,
        raw: RawSession<D::Connection>,
        generation: u64,
    ) -> Result<Session<D>> {
        let state = self.state.read();
        if state.available && state.current_queue(generation).is_some() {
            self.in_flight.add();
            drop(state);
            return Ok(Session::new(raw, Arc::clone(self), generation));
        }
        drop(state);
        debug!(
            "[{}] received session while closing, retiring it",
            self.config.name()
        );
        raw.close();
        Err(PoolError::PoolClosed)
    }

    /// Single path back into the pool. Closes the session if its generation is gone.
    fn release(&self, raw: RawSession<D::Connection>, generation: u64) {
        let state = self.state.read();
        let Some(queue) = state.current_queue(generation) else {
            drop(state);
            raw.close();
            return;
        };
        if let Err(err) = queue.tx.try_send(raw) {
            drop(state);
            error!(
                "[{}] failed to return session to the pool, closing it",
                self.config.name()
            );
            match err {
                TrySendError::Full(raw) | TrySendError::Disconnected(raw) => raw.close(),
            }
        }
    }

    fn start_reconnect(self: &Arc<Self>, mut raw: RawSession<D::Connection>, generation: u64) {
        raw.conn.close();
        {
            let mut state = self.state.write();
            if state.current_queue(generation).is_none() || !state.available {
                return;
            }
            state.reconnecting += 1;
        }
        let rng = StdRng::seed_from_u64(self.rng.lock().random());
        let worker = ReconnectWorker::new(Arc::clone(self), raw.addrs, generation, rng);
        if let Err(err) = worker.spawn() {
            error!(
                "[{}] failed to spawn reconnect worker: {}",
                self.config.name(),
                err
            );
            self.abandon_reconnect(generation);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.read().current_queue(generation).is_some()
    }

    /// Returns whether the session made it back into the pool.
    fn release_reconnected(
        &self,
        addrs: Vec<Address>,
        conn: D::Connection,
        generation: u64,
    ) -> bool {
        let raw = RawSession { addrs, conn };
        let mut state = self.state.write();
        let Some(queue) = state.current_queue(generation) else {
            drop(state);
            raw.close();
            return false;
        };
        let res = queue.tx.try_send(raw);
        state.reconnecting -= 1;
        match res {
            Ok(()) => true,
            Err(err) => {
                state.capacity -= 1;
                drop(state);
                err.into_inner().close();
                false
            }
        }
    }

    /// Returns whether the session was still accounted for by the current generation.
    fn abandon_reconnect(&self, generation: u64) -> bool {
        let mut state = self.state.write();
        if state.current_queue(generation).is_none() {
            return false;
        }
        state.reconnecting -= 1;
        state.capacity -= 1;
        true
    }

    fn close_generation(&self) {
        {
            let mut state = self.state.write();
            if state.queue.is_none() {
                debug!("[{}] pool already closed", self.config.name());
                return;
            }
            state.available = false;
        }
        info!(
            "[{}] closing pool, waiting for {} session(s) in use",
            self.config.name(),
            self.in_flight.count()
        );
        self.in_flight.wait();
        let mut state = self.state.write();
        let mut closed = 0;
        if let Some(queue) = state.queue.take() {
            for raw in queue.rx.drain() {
                raw.close();
                closed += 1;
            }
        }
        state.capacity = 0;
        state.reconnecting = 0;
        state.live_servers.clear();
        state.allocation.clear();
        info!(
            "[{}] pool closed ({} session(s) closed)",
            self.config.name(),
            closed
        );
    }

    fn send_event(&self, event: PoolEvent) {
        if let Err(err) = self.events.0.try_send(event) {
            debug!(
                "[{}] dropping pool event {:?}",
                self.config.name(),
                err.into_inner()
            );
        }
    }
}
