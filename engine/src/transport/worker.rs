//! Transport worker
//!
//! Owns exactly one connection and serialises all traffic through it on a
//! dedicated thread. Any number of caller threads may queue requests and
//! block on their own request id; none of them ever touches the socket.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::BufReader;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::framing;
use super::tls::{ConnectPhase, Connector, Stream};
use crate::config::TransportConfig;
use crate::constants::{operations, transport};
use crate::errors::TransportError;

pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Failed(TransportError),
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Progress(ConnectPhase),
    Connected,
    ConnectFailed(TransportError),
    /// Only emitted for requests queued with `notify = true`
    ResponseReady(RequestId),
    Stopped,
}

#[derive(Debug)]
struct TransportRequest {
    id: RequestId,
    payload: Vec<u8>,
    complete: bool,
    response: Option<Vec<u8>>,
    notify: bool,
    completed_at: Option<Instant>,
}

#[derive(Default)]
struct Queues {
    next_id: RequestId,
    pending: VecDeque<TransportRequest>,
    completed: HashMap<RequestId, TransportRequest>,
    // Waiters that gave up; their responses are dropped on arrival
    abandoned: HashSet<RequestId>,
}

struct Shared {
    queues: Mutex<Queues>,
    // Wakes the worker on new work and waiters on new responses
    signal: Condvar,
    state: Mutex<ConnectionState>,
    state_changed: Condvar,
    stop: AtomicBool,
    abort: Mutex<Option<TcpStream>>,
    events: broadcast::Sender<TransportEvent>,
    // How long an announced response may sit unclaimed before it is dropped
    unclaimed_timeout: Duration,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        self.state_changed.notify_all();
    }

    fn publish(&self, event: TransportEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Files a finished request and wakes every waiter
    fn complete(&self, mut request: TransportRequest, response: Vec<u8>) {
        let id = request.id;
        let notify = request.notify;
        request.complete = true;
        request.response = Some(response);
        request.completed_at = Some(Instant::now());

        {
            let mut queues = self.queues.lock();
            self.evict_unclaimed(&mut queues);
            if queues.abandoned.remove(&id) {
                debug!("Dropping response to abandoned request {}", id);
            } else {
                queues.completed.insert(id, request);
                // Announced while filed, so the response is there for whoever reacts
                if notify {
                    self.publish(TransportEvent::ResponseReady(id));
                }
            }
        }
        self.signal.notify_all();
    }

    /// Drops announced responses nobody took within `unclaimed_timeout`.
    /// Responses to `notify = false` requests are kept; their callers wait by id.
    fn evict_unclaimed(&self, queues: &mut Queues) {
        let timeout = self.unclaimed_timeout;
        queues.completed.retain(|id, request| {
            let stale = request.notify
                && request
                    .completed_at
                    .is_some_and(|at| at.elapsed() >= timeout);
            if stale {
                debug!("Dropping unclaimed response to request {}", id);
            }
            !stale
        });
    }
}

pub struct TransportWorker {
    host: String,
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TransportWorker {
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(operations::EVENT_CHANNEL_CAPACITY);
        Self {
            host: connector.host().to_string(),
            connector,
            config,
            shared: Arc::new(Shared {
                queues: Mutex::new(Queues::default()),
                signal: Condvar::new(),
                state: Mutex::new(ConnectionState::Idle),
                state_changed: Condvar::new(),
                stop: AtomicBool::new(false),
                abort: Mutex::new(None),
                events,
                unclaimed_timeout: config.unclaimed_timeout,
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().clone()
    }

    /// Spawns the worker thread, which connects and then serves the queue.
    /// Returns immediately; use [`wait_connected`](Self::wait_connected) or
    /// the event stream to learn the outcome.
    pub fn start(&self) -> Result<(), TransportError> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            warn!("Transport worker for {} already started", self.host);
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Connecting);

        let connector = self.connector.clone();
        let config = self.config;
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("transport-{}", self.host))
            .spawn(move || run(connector, config, shared))
            .map_err(|e| {
                let err = TransportError::Io {
                    reason: format!("failed to spawn worker thread: {}", e),
                };
                self.shared.set_state(ConnectionState::Failed(err.clone()));
                err
            })?;

        *slot = Some(handle);
        Ok(())
    }

    /// Blocks until the connection is up, has failed, or the timeout passes
    pub fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed(e) => return Err(e.clone()),
                ConnectionState::Stopped => return Err(TransportError::Stopped),
                ConnectionState::Idle | ConnectionState::Connecting => {}
            }
            if self
                .shared
                .state_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match &*state {
                    ConnectionState::Connected => Ok(()),
                    _ => Err(TransportError::NotConnected),
                };
            }
        }
    }

    /// Enqueues a payload and returns its id without waiting.
    ///
    /// With `notify = false` no `ResponseReady` event is broadcast; the
    /// caller is expected to collect the response by id. With `notify = true`
    /// the listener must collect it with [`take_response`](Self::take_response)
    /// within the configured unclaimed timeout, after which it is dropped.
    pub fn queue_request(&self, payload: Vec<u8>, notify: bool) -> RequestId {
        let (id, rejected) = {
            let mut queues = self.shared.queues.lock();
            // Checked under the queue lock; the worker drains under it when it dies
            let dead = matches!(
                *self.shared.state.lock(),
                ConnectionState::Failed(_) | ConnectionState::Stopped
            );
            queues.next_id += 1;
            let request = TransportRequest {
                id: queues.next_id,
                payload,
                complete: false,
                response: None,
                notify,
                completed_at: None,
            };
            let id = request.id;
            if dead {
                (id, Some(request))
            } else {
                queues.pending.push_back(request);
                (id, None)
            }
        };

        match rejected {
            // Nobody will serve it; fail the request straight away
            Some(request) => {
                debug!("Request {} queued on a dead connection to {}", id, self.host);
                self.shared.complete(request, Vec::new());
            }
            None => {
                self.shared.signal.notify_all();
            }
        }
        id
    }

    /// Blocks until the response for `id` arrives, then consumes it.
    ///
    /// `None` means the timeout passed first. An empty body means the
    /// request itself failed on the wire.
    pub fn wait_for_response(&self, id: RequestId, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut queues = self.shared.queues.lock();
        loop {
            if let Some(request) = queues.completed.remove(&id) {
                debug_assert!(request.complete);
                return request.response;
            }
            if self
                .shared
                .signal
                .wait_until(&mut queues, deadline)
                .timed_out()
            {
                if let Some(request) = queues.completed.remove(&id) {
                    return request.response;
                }
                queues.abandoned.insert(id);
                debug!("Gave up waiting for request {} on {}", id, self.host);
                return None;
            }
        }
    }

    /// Non-blocking retrieval for callers that reacted to a `ResponseReady` event
    pub fn take_response(&self, id: RequestId) -> Option<Vec<u8>> {
        let mut queues = self.shared.queues.lock();
        queues.completed.remove(&id).and_then(|request| request.response)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.queues.lock().pending.len()
    }

    /// Asks the loop to exit at its next opportunity. An in-flight socket
    /// call is not interrupted.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.signal.notify_all();
    }

    /// Stops the worker and waits a bounded time for its thread. If it is
    /// stuck in a socket call the socket is shut down under it; if even that
    /// does not help the thread is detached.
    pub fn shutdown(&self) {
        self.request_stop();

        let Some(handle) = self.thread.lock().take() else {
            return;
        };

        if wait_finished(&handle, self.config.stop_timeout) {
            let _ = handle.join();
            return;
        }

        warn!(
            "Transport worker for {} did not stop within {:?}, aborting its socket",
            self.host, self.config.stop_timeout
        );
        if let Some(sock) = self.shared.abort.lock().take() {
            let _ = sock.shutdown(Shutdown::Both);
        }

        if wait_finished(&handle, self.config.stop_timeout) {
            let _ = handle.join();
        } else {
            error!("Transport worker for {} is stuck; detaching thread", self.host);
        }
    }
}

impl Drop for TransportWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wait_finished(handle: &JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

fn run(connector: Arc<dyn Connector>, config: TransportConfig, shared: Arc<Shared>) {
    let host = connector.host().to_string();
    info!("Connecting to {}", host);

    let mut connection = match open(connector.as_ref(), &config, &shared) {
        Ok(reader) => Some(reader),
        Err(e) => {
            error!("Failed to connect to {}: {}", host, e);
            // Publish first so anyone woken by the state change sees the event
            shared.publish(TransportEvent::ConnectFailed(e.clone()));
            fail_pending(&shared, ConnectionState::Failed(e));
            return;
        }
    };

    shared.publish(TransportEvent::Connected);
    shared.set_state(ConnectionState::Connected);
    info!("Connected to {}", host);

    let mut failure = None;

    'serve: while !shared.stop.load(Ordering::SeqCst) {
        let batch: Vec<TransportRequest> = {
            let mut queues = shared.queues.lock();
            if queues.pending.is_empty() {
                shared.signal.wait_for(&mut queues, transport::IDLE_WAIT);
            }
            queues.pending.drain(..).collect()
        };

        let mut batch = batch.into_iter();
        while let Some(request) = batch.next() {
            if shared.stop.load(Ordering::SeqCst) {
                shared.complete(request, Vec::new());
                continue;
            }

            // The previous exchange left the stream unusable; start over on a fresh one
            let mut reader = match connection.take() {
                Some(reader) => reader,
                None => match open(connector.as_ref(), &config, &shared) {
                    Ok(reader) => {
                        info!("Reconnected to {}", host);
                        reader
                    }
                    Err(e) => {
                        error!("Failed to reconnect to {}: {}", host, e);
                        shared.complete(request, Vec::new());
                        for request in batch.by_ref() {
                            shared.complete(request, Vec::new());
                        }
                        failure = Some(e);
                        break 'serve;
                    }
                },
            };

            let response = match exchange(&mut reader, &host, &request.payload) {
                Ok((body, reusable)) => {
                    if reusable {
                        connection = Some(reader);
                    } else {
                        debug!("{} closed the connection after request {}", host, request.id);
                        close(reader, &shared);
                    }
                    body
                }
                Err(e) => {
                    // Whatever is left of this response must never reach another request
                    warn!("Request {} to {} failed: {}", request.id, host, e);
                    close(reader, &shared);
                    Vec::new()
                }
            };
            shared.complete(request, response);
        }
    }

    if let Some(reader) = connection {
        close(reader, &shared);
    }

    match failure {
        Some(e) => {
            shared.publish(TransportEvent::ConnectFailed(e.clone()));
            fail_pending(&shared, ConnectionState::Failed(e));
        }
        None => {
            shared.publish(TransportEvent::Stopped);
            fail_pending(&shared, ConnectionState::Stopped);
        }
    }
    info!("Transport worker for {} stopped", host);
}

fn open(
    connector: &dyn Connector,
    config: &TransportConfig,
    shared: &Shared,
) -> Result<BufReader<Box<dyn Stream>>, TransportError> {
    let progress = |phase: ConnectPhase| shared.publish(TransportEvent::Progress(phase));
    let stream = connector.connect(config, &progress)?;
    *shared.abort.lock() = stream.abort_handle();
    Ok(BufReader::new(stream))
}

fn close(reader: BufReader<Box<dyn Stream>>, shared: &Shared) {
    shared.abort.lock().take();
    let mut stream = reader.into_inner();
    stream.close();
}

/// Sends one request and reads its response. Also reports whether the
/// stream can carry the next exchange.
fn exchange(
    reader: &mut BufReader<Box<dyn Stream>>,
    host: &str,
    payload: &[u8],
) -> Result<(Vec<u8>, bool), TransportError> {
    framing::write_request(reader.get_mut(), host, payload)?;
    let response = framing::read_response(reader)?;

    if let Some(status) = response.status() {
        if !(200..300).contains(&status) {
            warn!("{} answered HTTP {}", host, status);
        }
    }

    let reusable = response.keeps_connection();
    Ok((response.body, reusable))
}

/// Enters a final state and wakes everyone still waiting on requests that
/// will never be served
fn fail_pending(shared: &Shared, state: ConnectionState) {
    let leftovers: Vec<TransportRequest> = {
        let mut queues = shared.queues.lock();
        shared.set_state(state);
        queues.pending.drain(..).collect()
    };
    for request in leftovers {
        shared.complete(request, Vec::new());
    }
}
