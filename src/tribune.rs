// Tribune - Peer-to-peer asynchronous RPC runtime for contest management services
// Copyright (C) 2026  Tribune Developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::codec::{self, Request, Response};
use crate::directory::{Directory, ServiceCoord};
use crate::dispatch::{self, Handler, HandlerError, MethodFlags, MethodRegistry};
use crate::error::{TribuneError, TribuneResult};
use crate::pending::{PendingRequests, ReplyCallback};
use crate::remote::{self, PeerKey, RemoteService};

/// Upper bound on one scheduler sleep. Disconnected peers are re-dialed at
/// least this often.
const MAX_TICK: Duration = Duration::from_millis(500);

/// Periodic task body. Runs in its own spawned task per fire; resolving
/// true re-arms the timer for one period after the deadline it ran at.
pub type TimerFunc = Arc<dyn Fn(Tribune) -> BoxFuture<'static, bool> + Send + Sync>;

/// Invoked whenever the reconnect sweep brings the peer's connection up.
pub type ConnectCallback = Box<dyn FnMut(&Tribune, &ServiceCoord) + Send>;

/// A scheduled periodic call. Min-ordered by deadline, ties broken by
/// insertion sequence.
struct TimerEntry {
    deadline: Instant,
    period: Duration,
    seq: u64,
    func: TimerFunc,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline pops first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The service runtime: listener, peer set, correlation table, method
/// registry, and timers, all behind one cloneable handle driven by `up()`.
#[derive(Clone)]
pub struct Tribune {
    shared: Arc<Shared>,
}

/// State shared between the tick loop, connection tasks, timer tasks, and
/// handlers. Locks guard single operations and are never held across a
/// suspension point.
struct Shared {
    coord: ServiceCoord,

    directory: Directory,

    registry: Mutex<MethodRegistry>,

    peers: Mutex<HashMap<PeerKey, RemoteService>>,

    /// Callbacks fired by the reconnect sweep, keyed by peer coordinate.
    on_connect: Mutex<HashMap<ServiceCoord, ConnectCallback>>,

    pending: Mutex<PendingRequests>,

    timers: Mutex<BinaryHeap<TimerEntry>>,

    /// Insertion counter ordering timers with equal deadlines.
    timer_seq: AtomicU64,

    /// Pinged on every timer insertion so a sleeping tick loop recomputes
    /// its wakeup instead of oversleeping a fresh deadline.
    timer_added: Notify,

    exit: AtomicBool,

    /// Bound at construction, taken by `up()`.
    listener: Mutex<Option<TcpListener>>,
}

impl Tribune {
    /// Builds the runtime for `coord`. When the directory carries an
    /// address for the coordinate the listener is bound right away;
    /// otherwise the service runs dial-only.
    pub async fn new(coord: ServiceCoord, directory: Directory) -> TribuneResult<Self> {
        let listener = match directory.resolve(&coord) {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => {
                warn!("No address for {}, starting without a listener.", coord);
                None
            }
        };

        let tribune = Self {
            shared: Arc::new(Shared {
                coord,
                directory,
                registry: Mutex::new(MethodRegistry::new()),
                peers: Mutex::new(HashMap::new()),
                on_connect: Mutex::new(HashMap::new()),
                pending: Mutex::new(PendingRequests::new()),
                timers: Mutex::new(BinaryHeap::new()),
                timer_seq: AtomicU64::new(0),
                timer_added: Notify::new(),
                exit: AtomicBool::new(false),
                listener: Mutex::new(listener),
            }),
        };

        tribune.register_builtins();

        Ok(tribune)
    }

    pub fn coord(&self) -> &ServiceCoord {
        &self.shared.coord
    }

    /// Address of the bound listener, before `up()` takes it over.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .listener
            .lock()
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Registers a handler in the method table.
    pub fn register<F>(&self, name: &str, flags: MethodFlags, handler: F)
    where
        F: Fn(&Tribune, &Map<String, Value>) -> Result<Value, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.shared.registry.lock().register(name, flags, handler);
    }

    /// Handlers every service answers to.
    fn register_builtins(&self) {
        self.register("echo", MethodFlags::exposed(), |_, data| {
            data.get("string")
                .cloned()
                .ok_or_else(|| HandlerError::new("TypeError", "echo missing argument 'string'"))
        });

        self.register("quit", MethodFlags::exposed(), |tribune, data| {
            let reason = data.get("reason").and_then(Value::as_str).unwrap_or("");
            info!("Trying to exit as asked by another service ({}).", reason);
            tribune.exit();

            Ok(Value::Null)
        });
    }

    /// Registers `coord` as a dialed peer; the reconnect sweep keeps the
    /// connection up from now on. `on_connect` fires on every
    /// disconnect-to-connect transition the sweep observes.
    pub fn connect_to(
        &self,
        coord: ServiceCoord,
        on_connect: Option<ConnectCallback>,
    ) -> TribuneResult<()> {
        let addr = self
            .shared
            .directory
            .resolve(&coord)
            .ok_or_else(|| TribuneError::UnknownService(coord.clone()))?;

        if let Some(callback) = on_connect {
            self.shared.on_connect.lock().insert(coord.clone(), callback);
        }

        self.shared
            .peers
            .lock()
            .insert(PeerKey::Coord(coord.clone()), RemoteService::dialed(coord, addr));

        Ok(())
    }

    /// Schedules `func` to run every `period`, starting right away when
    /// `immediately` is set.
    pub fn add_timeout(&self, period: Duration, immediately: bool, func: TimerFunc) {
        let deadline = if immediately {
            Instant::now()
        } else {
            Instant::now() + period
        };

        self.push_timer(deadline, period, func);
    }

    fn push_timer(&self, deadline: Instant, period: Duration, func: TimerFunc) {
        let seq = self.shared.timer_seq.fetch_add(1, Ordering::Relaxed);

        self.shared.timers.lock().push(TimerEntry {
            deadline,
            period,
            seq,
            func,
        });

        self.shared.timer_added.notify_one();
    }

    /// Requests loop exit; the tick in progress completes first.
    pub fn exit(&self) {
        warn!("{} dying in 3, 2, 1...", self.shared.coord);
        self.shared.exit.store(true, Ordering::SeqCst);
    }

    pub fn exiting(&self) -> bool {
        self.shared.exit.load(Ordering::SeqCst)
    }

    /// Invokes `method` on the remote service, correlating the reply to
    /// `callback`. Dials inline when the peer is down and returns false if
    /// it stays unreachable. Once the request is registered the callback
    /// fires exactly once: on the matching response, or locally when
    /// encoding or the transport fails.
    pub async fn call<T: Serialize>(
        &self,
        coord: &ServiceCoord,
        method: &str,
        data: &T,
        callback: Option<ReplyCallback>,
    ) -> bool {
        let key = PeerKey::Coord(coord.clone());

        if !self.ensure_connected(&key).await {
            return false;
        }

        let id = self.shared.pending.lock().insert(key.clone(), callback);

        let payload = match encode_request(method, data, Some(&id)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot encode request of method {}: {}.", method, e);
                self.complete_pending(
                    &id,
                    None,
                    Some(format!(
                        "Cannot send request of method {} because of encoding error.",
                        method
                    )),
                );
                return true;
            }
        };

        if !self.push_to(&key, payload) {
            self.complete_pending(&id, None, Some("Transfer interrupted".to_string()));
        }

        true
    }

    /// Fire-and-forget variant of `call`: no id is assigned and no reply is
    /// expected; the remote's answer, if any, is dropped for lack of one.
    pub async fn notify<T: Serialize>(
        &self,
        coord: &ServiceCoord,
        method: &str,
        data: &T,
    ) -> bool {
        let key = PeerKey::Coord(coord.clone());

        if !self.ensure_connected(&key).await {
            return false;
        }

        let payload = match encode_request(method, data, None) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    "Cannot send request of method {} because of encoding error: {}.",
                    method, e
                );
                return false;
            }
        };

        self.push_to(&key, payload)
    }

    /// Runs the service until exit is requested. Each tick re-dials
    /// disconnected peers and fires due timers, then waits on the listener,
    /// SIGINT, a fresh timer, or the next deadline, whichever comes first.
    pub async fn up(&self) -> TribuneResult<()> {
        let listener = self.shared.listener.lock().take();

        match &listener {
            Some(listener) => info!("{} listening on {}.", self.shared.coord, listener.local_addr()?),
            None => info!("{} running without a listener.", self.shared.coord),
        }

        loop {
            if self.exiting() {
                break;
            }

            self.reconnect_sweep().await;
            self.fire_due_timers();

            select! {
                _ = tokio::signal::ctrl_c() => {
                    self.exit();
                }
                result = accept(&listener) => {
                    match result {
                        Ok((stream, addr)) => self.accept_peer(stream, addr),
                        Err(e) => warn!("Accept failed: {}.", e),
                    }
                }
                _ = self.shared.timer_added.notified() => {}
                _ = sleep(self.next_wakeup()) => {}
            }
        }

        // Closes the server socket.
        drop(listener);

        // In-flight requests are abandoned; their callbacks never fire.
        self.shared.pending.lock().clear();
        self.shutdown_peers();

        Ok(())
    }

    /// Once per tick: re-dial every registered peer whose channel is down,
    /// firing its on-connect callback when this sweep made the transition.
    async fn reconnect_sweep(&self) {
        let down: Vec<ServiceCoord> = {
            let peers = self.shared.peers.lock();
            peers
                .values()
                .filter(|peer| !peer.connected())
                .filter_map(|peer| peer.coord.clone())
                .collect()
        };

        for coord in down {
            let key = PeerKey::Coord(coord.clone());
            if !self.dial(&key).await {
                continue;
            }

            // Taken out of the map so the callback can touch the runtime.
            let callback = self.shared.on_connect.lock().remove(&coord);
            if let Some(mut callback) = callback {
                callback(self, &coord);
                self.shared.on_connect.lock().entry(coord).or_insert(callback);
            }
        }
    }

    /// Pops every timer whose deadline has passed and spawns its callback.
    /// Re-arming happens one period after the deadline just served, so
    /// periods do not drift with processing delays.
    fn fire_due_timers(&self) {
        let now = Instant::now();

        loop {
            let entry = {
                let mut timers = self.shared.timers.lock();
                let due = matches!(timers.peek(), Some(entry) if entry.deadline <= now);
                if !due {
                    break;
                }
                timers.pop()
            };

            let entry = match entry {
                Some(entry) => entry,
                None => break,
            };

            let tribune = self.clone();
            tokio::spawn(async move {
                let again = (entry.func)(tribune.clone()).await;
                if again {
                    tribune.push_timer(entry.deadline + entry.period, entry.period, entry.func);
                }
            });
        }
    }

    /// Interval to the next timer deadline, capped to the tick maximum.
    fn next_wakeup(&self) -> Duration {
        let now = Instant::now();
        let timers = self.shared.timers.lock();

        match timers.peek() {
            Some(entry) => entry.deadline.saturating_duration_since(now).min(MAX_TICK),
            None => MAX_TICK,
        }
    }

    /// Registers an inbound connection as a peer known only by address.
    fn accept_peer(&self, stream: TcpStream, addr: SocketAddr) {
        debug!("Peer has connected (addr = {}).", addr);

        let key = PeerKey::Addr(addr);
        let mut peers = self.shared.peers.lock();
        let peer = peers
            .entry(key.clone())
            .or_insert_with(|| RemoteService::accepted(addr));

        if !peer.connected() {
            let channel = remote::spawn_connection(self.clone(), key, stream);
            peer.install(channel);
        }
    }

    /// Dials `key` and wires the socket in. True only when this call made
    /// the peer connected; a failed dial or a lost race both report false.
    async fn dial(&self, key: &PeerKey) -> bool {
        let addr = {
            let peers = self.shared.peers.lock();
            match peers.get(key) {
                Some(peer) if peer.connected() => return false,
                Some(peer) => peer.addr,
                None => return false,
            }
        };

        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            // Stay silent; the sweep retries every tick.
            Err(_) => return false,
        };

        let mut peers = self.shared.peers.lock();
        let peer = match peers.get_mut(key) {
            Some(peer) => peer,
            None => return false,
        };

        if peer.connected() {
            return false;
        }

        let channel = remote::spawn_connection(self.clone(), key.clone(), stream);
        peer.install(channel);
        debug!("Connected to peer (key = {}).", key);

        true
    }

    fn peer_connected(&self, key: &PeerKey) -> bool {
        self.shared
            .peers
            .lock()
            .get(key)
            .map(|peer| peer.connected())
            .unwrap_or(false)
    }

    async fn ensure_connected(&self, key: &PeerKey) -> bool {
        if self.peer_connected(key) {
            return true;
        }

        self.dial(key).await || self.peer_connected(key)
    }

    fn push_to(&self, key: &PeerKey, payload: Bytes) -> bool {
        let peers = self.shared.peers.lock();
        match peers.get(key) {
            Some(peer) => peer.push(payload),
            None => false,
        }
    }

    pub(crate) fn method_entry(&self, name: &str) -> Option<(Handler, MethodFlags)> {
        self.shared.registry.lock().entry(name)
    }

    /// Handles one decoded line from `key`'s connection: an envelope with
    /// `__method` is dispatched locally, anything else is matched against
    /// the pending table.
    pub(crate) fn process_frame(&self, key: &PeerKey, line: &[u8]) {
        let value: Value = match serde_json::from_slice(line) {
            Ok(value) => value,
            Err(_) => {
                warn!("Cannot understand incoming message, discarding.");
                return;
            }
        };

        if codec::is_request(&value) {
            let request: Request = match serde_json::from_value(value) {
                Ok(request) => request,
                Err(_) => {
                    warn!("Cannot understand incoming message, discarding.");
                    return;
                }
            };

            let response = dispatch::dispatch(self, &request);
            self.send_reply(key, &response);
        } else {
            let response: Response = match serde_json::from_value(value) {
                Ok(response) => response,
                Err(_) => {
                    warn!("Cannot understand incoming message, discarding.");
                    return;
                }
            };

            let id = match response.id {
                Some(id) => id,
                None => {
                    warn!("Response without __id field, discarding.");
                    return;
                }
            };

            self.complete_pending(&id, Some(response.data), response.error);
        }
    }

    fn send_reply(&self, key: &PeerKey, response: &Response) {
        let payload = match serde_json::to_vec(response) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!("Cannot send response because of encoding error. {}", e);
                return;
            }
        };

        if !self.push_to(key, payload) {
            warn!("Cannot send response: peer {} is gone.", key);
        }
    }

    /// Terminal path of a pending request; the callback runs outside the
    /// table lock and at most once, since removal is the completion point.
    fn complete_pending(&self, id: &str, data: Option<Value>, error: Option<String>) {
        let request = self.shared.pending.lock().remove(id);

        match request {
            Some(request) => {
                if let Some(callback) = request.callback {
                    callback(data, error);
                }
            }
            None => warn!("No pending request with id {} found.", id),
        }
    }

    /// Invoked by a connection task when its socket goes down. Dialed peers
    /// stay registered for the reconnect sweep; accepted peers are dropped.
    /// Requests still waiting on the peer are completed with an error.
    pub(crate) fn peer_disconnected(&self, key: &PeerKey) {
        {
            let mut peers = self.shared.peers.lock();
            match key {
                PeerKey::Coord(_) => {
                    if let Some(peer) = peers.get_mut(key) {
                        peer.clear();
                    }
                }
                PeerKey::Addr(_) => {
                    peers.remove(key);
                }
            }
        }

        debug!("Peer has disconnected (key = {}).", key);

        let callbacks = self.shared.pending.lock().take_peer(key);
        for callback in callbacks {
            callback(None, Some("Transfer interrupted".to_string()));
        }
    }

    fn shutdown_peers(&self) {
        let peers = self.shared.peers.lock();
        for peer in peers.values() {
            peer.shutdown();
        }
    }
}

fn encode_request<T: Serialize>(
    method: &str,
    data: &T,
    id: Option<&str>,
) -> Result<Bytes, serde_json::Error> {
    let request = Request {
        method: method.to_string(),
        data: Some(serde_json::to_value(data)?),
        id: id.map(|id| id.to_string()),
    };

    Ok(Bytes::from(serde_json::to_vec(&request)?))
}

async fn accept(listener: &Option<TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::FutureExt;
    use serde_json::json;

    async fn bare_service(name: &str) -> Tribune {
        Tribune::new(ServiceCoord::new(name, 0), Directory::new())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_fires_three_times_without_drift() {
        let service = bare_service("Timer").await;

        let fired: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let observed = fired.clone();

        service.add_timeout(
            Duration::from_millis(100),
            true,
            Arc::new(move |_| {
                let fired = observed.clone();
                async move {
                    let mut fired = fired.lock();
                    fired.push(Instant::now());
                    fired.len() < 3
                }
                .boxed()
            }),
        );

        let runner = service.clone();
        let loop_task = tokio::spawn(async move { runner.up().await });

        sleep(Duration::from_millis(400)).await;
        service.exit();
        loop_task.await.unwrap().unwrap();

        let fired = fired.lock();
        assert_eq!(fired.len(), 3);
        assert_eq!(fired[1] - fired[0], Duration::from_millis(100));
        assert_eq!(fired[2] - fired[1], Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_timer_waits_one_period() {
        let service = bare_service("Timer").await;

        let fired: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let observed = fired.clone();
        let start = Instant::now();

        service.add_timeout(
            Duration::from_millis(200),
            false,
            Arc::new(move |_| {
                let fired = observed.clone();
                async move {
                    fired.lock().push(Instant::now());
                    false
                }
                .boxed()
            }),
        );

        let runner = service.clone();
        let loop_task = tokio::spawn(async move { runner.up().await });

        sleep(Duration::from_millis(500)).await;
        service.exit();
        loop_task.await.unwrap().unwrap();

        let fired = fired.lock();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0] - start, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn equal_deadlines_fire_in_insertion_order() {
        let service = bare_service("Timer").await;

        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let deadline = Instant::now();

        for name in ["first", "second", "third"].iter().copied() {
            let order = order.clone();
            service.push_timer(
                deadline,
                Duration::from_secs(1),
                Arc::new(move |_| {
                    let order = order.clone();
                    async move {
                        order.lock().push(name);
                        false
                    }
                    .boxed()
                }),
            );
        }

        service.fire_due_timers();
        for _ in 0..10 {
            if order.lock().len() == 3 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn quit_handler_requests_exit() {
        let service = bare_service("Quitter").await;

        let request = Request {
            method: "quit".to_string(),
            data: Some(json!({ "reason": "maintenance" })),
            id: None,
        };

        let response = dispatch::dispatch(&service, &request);

        assert_eq!(response.error, None);
        assert!(service.exiting());
    }

    #[tokio::test]
    async fn connect_to_unknown_coordinate_fails() {
        let service = bare_service("Lonely").await;

        assert!(service
            .connect_to(ServiceCoord::new("Ghost", 7), None)
            .is_err());
    }

    #[tokio::test]
    async fn unknown_response_ids_are_dropped() {
        let service = bare_service("Correlator").await;

        // No pending entry exists, so this must only log.
        let frame = b"{\"__id\":\"ffffffffffffffff\",\"__data\":null,\"__error\":null}";
        let key = PeerKey::Coord(ServiceCoord::new("Ghost", 0));
        service.process_frame(&key, frame);

        assert!(service.shared.pending.lock().is_empty());
    }
}
