//! Managed listeners: the live serving unit for one forwarding rule.
//!
//! A [`ManagedListener`] owns one bound listening socket, the set of
//! pipes it has spawned, a round-robin cursor over its resolved
//! endpoints, and an endpoint-refresh loop. While it is open, three
//! background tasks run on its behalf:
//!
//! - the accept loop (accept, pick a backend, dial, spawn a pipe)
//! - the registry task, the only actor allowed to mutate the pipe set
//! - the endpoint-refresh loop, polling the resolver on a fixed tick
//!
//! The accept loop terminates permanently on the first accept or dial
//! failure; the rule then serves nothing until a reconciliation pass
//! replaces it. That is the intended policy, not an oversight.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::discovery::Resolver;
use crate::pipe::{Pipe, PipeId};
use crate::rules::{Definition, EndpointSet};
use crate::telemetry::TelemetrySink;

/// Bind attempts before a rule is declared unbindable.
pub const BIND_RETRIES: u32 = 3;

/// Interval between endpoint-refresh polls.
pub const ENDPOINT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Bind a listening socket, retrying a fixed number of times with no
/// delay. `None` is a permanent failure for the rule: the caller keeps
/// the rule dead until a later reconciliation replaces it.
pub async fn bind_listener(address: &str) -> Option<TcpListener> {
    for attempt in 1..=BIND_RETRIES {
        match TcpListener::bind(address).await {
            Ok(listener) => return Some(listener),
            Err(error) => warn!(address, attempt, %error, "bind failed"),
        }
    }
    None
}

pub struct ManagedListener {
    definition: Definition,
    /// Bound socket, taken by `open`. `None` when the bind exhausted
    /// its retries — a checked state, not a silently absorbed no-op.
    socket: Mutex<Option<TcpListener>>,
    local_addr: Option<SocketAddr>,
    /// Live pipe set. Mutated only by the registry task while open;
    /// `close` drains it after that task has exited.
    pipes: Mutex<HashMap<PipeId, Arc<Pipe>>>,
    active: AtomicU64,
    rr_counter: AtomicU64,
    endpoints: ArcSwap<EndpointSet>,
    resolver: Arc<dyn Resolver>,
    telemetry: TelemetrySink,
    add_tx: mpsc::UnboundedSender<Arc<Pipe>>,
    add_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Pipe>>>>,
    remove_tx: mpsc::UnboundedSender<PipeId>,
    remove_rx: Mutex<Option<mpsc::UnboundedReceiver<PipeId>>>,
    shutdown: watch::Sender<bool>,
    stop_refresh: watch::Sender<bool>,
    registry_task: Mutex<Option<JoinHandle<()>>>,
    next_pipe_id: AtomicU64,
}

impl ManagedListener {
    /// Bind a listener for `definition`. The endpoint cache is seeded
    /// from the rule's static endpoint list.
    pub async fn bind(
        definition: Definition,
        resolver: Arc<dyn Resolver>,
        telemetry: TelemetrySink,
    ) -> Arc<Self> {
        let socket = bind_listener(&definition.source).await;
        if socket.is_none() {
            error!(
                rule = %definition.name,
                source = %definition.source,
                retries = BIND_RETRIES,
                "could not bind; rule has no working listener"
            );
        }
        let local_addr = socket.as_ref().and_then(|l| l.local_addr().ok());

        let (add_tx, add_rx) = mpsc::unbounded_channel();
        let (remove_tx, remove_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let (stop_refresh, _) = watch::channel(false);

        Arc::new(Self {
            endpoints: ArcSwap::from_pointee(definition.endpoints.clone()),
            definition,
            socket: Mutex::new(socket),
            local_addr,
            pipes: Mutex::new(HashMap::new()),
            active: AtomicU64::new(0),
            rr_counter: AtomicU64::new(0),
            resolver,
            telemetry,
            add_tx,
            add_rx: Mutex::new(Some(add_rx)),
            remove_tx,
            remove_rx: Mutex::new(Some(remove_rx)),
            shutdown,
            stop_refresh,
            registry_task: Mutex::new(None),
            next_pipe_id: AtomicU64::new(0),
        })
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    /// Address the socket actually bound to (ports may be ephemeral).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Open-pipe count.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Start the accept loop, the registry task, and the
    /// endpoint-refresh loop; returns immediately. Starts nothing when
    /// the bind failed.
    pub async fn open(self: Arc<Self>) {
        let Some(listener) = self.socket.lock().await.take() else {
            error!(
                rule = %self.definition.name,
                source = %self.definition.source,
                "open skipped: no bound socket"
            );
            return;
        };

        let add_rx = self.add_rx.lock().await.take();
        let remove_rx = self.remove_rx.lock().await.take();
        let (Some(add_rx), Some(remove_rx)) = (add_rx, remove_rx) else {
            debug!(rule = %self.definition.name, "open called twice; ignoring");
            return;
        };

        let registry = tokio::spawn(Arc::clone(&self).run_registry(
            add_rx,
            remove_rx,
            self.shutdown.subscribe(),
        ));
        *self.registry_task.lock().await = Some(registry);

        tokio::spawn(Arc::clone(&self).run_accept_loop(listener, self.shutdown.subscribe()));
        tokio::spawn(Arc::clone(&self).run_endpoint_refresh(self.stop_refresh.subscribe()));

        info!(
            rule = %self.definition.name,
            source = %self.definition.source,
            sink = %self.definition.sink,
            discovery = self.definition.enable_discovery,
            "listener open"
        );
    }

    /// Stop accepting, wait for the registry task to settle, then
    /// force-close every tracked pipe under the listener's own lock.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let _ = self.stop_refresh.send(true);

        let registry = self.registry_task.lock().await.take();
        if let Some(handle) = registry {
            let _ = handle.await;
        }

        {
            let mut pipes = self.pipes.lock().await;
            for (_, pipe) in pipes.drain() {
                pipe.close();
            }
        }
        self.active.store(0, Ordering::Relaxed);

        info!(rule = %self.definition.name, source = %self.definition.source, "listener closed");
    }

    /// Next backend address, round robin.
    ///
    /// With discovery off or nothing resolved this is the static sink.
    /// Otherwise: pre-increment round robin — add first, then mod — so
    /// the first selection over N endpoints is index `1 % N`. The set
    /// reference and its length come from one atomic load; replacement
    /// swaps the whole reference, never mutates in place.
    pub fn next_endpoint(&self) -> String {
        let endpoints = self.endpoints.load();
        if !self.definition.enable_discovery || endpoints.is_empty() {
            return self.definition.sink.clone();
        }

        let turn = self.rr_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let index = (turn % endpoints.len() as u64) as usize;
        match endpoints.get(index) {
            Some(endpoint) => endpoint.to_string(),
            None => self.definition.sink.clone(),
        }
    }

    /// Ask the resolver for the current endpoints and swap the cache if
    /// the set actually changed. Lookup failures keep the cached set.
    pub async fn load_endpoints(&self) {
        if !self.definition.enable_discovery || self.definition.service.is_empty() {
            return;
        }

        match self
            .resolver
            .endpoints(&self.definition.service, &self.definition.namespace)
            .await
        {
            Ok(resolved) => {
                let fresh = EndpointSet::from(resolved);
                if fresh != **self.endpoints.load() {
                    info!(
                        rule = %self.definition.name,
                        service = %self.definition.service,
                        namespace = %self.definition.namespace,
                        count = fresh.len(),
                        "endpoint set replaced"
                    );
                    self.endpoints.store(Arc::new(fresh));
                }
            }
            Err(error) => {
                warn!(
                    rule = %self.definition.name,
                    service = %self.definition.service,
                    namespace = %self.definition.namespace,
                    %error,
                    "endpoint lookup failed; keeping cached set"
                );
            }
        }
    }

    async fn run_accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                debug!(rule = %self.definition.name, "accept loop stopped by close");
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(rule = %self.definition.name, "accept loop stopped by close");
                    break;
                }
                accepted = listener.accept() => {
                    let (source, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(error) => {
                            error!(
                                rule = %self.definition.name,
                                source = %self.definition.source,
                                %error,
                                "accept failed; rule serves nothing until its definition changes"
                            );
                            break;
                        }
                    };

                    let sink_addr = self.next_endpoint();
                    let sink = match TcpStream::connect(&sink_addr).await {
                        Ok(stream) => stream,
                        Err(error) => {
                            error!(
                                rule = %self.definition.name,
                                peer = %peer_addr,
                                sink = %sink_addr,
                                %error,
                                "dial failed; rule serves nothing until its definition changes"
                            );
                            break;
                        }
                    };

                    if self.definition.debug {
                        debug!(
                            rule = %self.definition.name,
                            peer = %peer_addr,
                            sink = %sink_addr,
                            "connection accepted"
                        );
                    }

                    let id = self.next_pipe_id.fetch_add(1, Ordering::Relaxed);
                    let pipe = Pipe::open(
                        id,
                        self.definition.clone(),
                        peer_addr,
                        sink_addr,
                        &self.add_tx,
                        self.remove_tx.clone(),
                    );
                    pipe.connect(source, sink, self.telemetry.clone());
                }
            }
        }
        // Listener socket drops here. The refresh loop follows the
        // accept loop down even when close() was never the trigger.
        let _ = self.stop_refresh.send(true);
    }

    /// The single writer for the pipe set. Serializes add and remove
    /// requests from its two channels; on shutdown it drains whatever
    /// raced the signal so `close` sees a settled map.
    async fn run_registry(
        self: Arc<Self>,
        mut add_rx: mpsc::UnboundedReceiver<Arc<Pipe>>,
        mut remove_rx: mpsc::UnboundedReceiver<PipeId>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                added = add_rx.recv() => match added {
                    Some(pipe) => self.insert(pipe).await,
                    None => break,
                },
                removed = remove_rx.recv() => match removed {
                    Some(id) => self.remove(id).await,
                    None => break,
                },
            }
        }

        while let Ok(pipe) = add_rx.try_recv() {
            self.insert(pipe).await;
        }
        while let Ok(id) = remove_rx.try_recv() {
            self.remove(id).await;
        }
    }

    async fn insert(&self, pipe: Arc<Pipe>) {
        let mut pipes = self.pipes.lock().await;
        pipes.insert(pipe.id(), pipe);
        self.active.store(pipes.len() as u64, Ordering::Relaxed);
    }

    async fn remove(&self, id: PipeId) {
        let mut pipes = self.pipes.lock().await;
        pipes.remove(&id);
        self.active.store(pipes.len() as u64, Ordering::Relaxed);
    }

    async fn run_endpoint_refresh(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(ENDPOINT_REFRESH_INTERVAL);
        ticker.tick().await;

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    self.load_endpoints().await;
                    if self.definition.debug {
                        debug!(
                            rule = %self.definition.name,
                            source = %self.definition.source,
                            sink = %self.definition.sink,
                            service = %self.definition.service,
                            namespace = %self.definition.namespace,
                            endpoints = self.endpoints.load().len(),
                            active = self.active(),
                            "endpoint refresh"
                        );
                    }
                }
            }
        }
    }
}
