//! One active bidirectional relay.
//!
//! A pipe owns exactly two live connections: the accepted source side
//! and the dialed sink side. It belongs to exactly one listener's
//! registry at a time, and it never touches that registry directly —
//! membership changes travel over the listener's add/remove channels so
//! a single task performs every mutation.
//!
//! Closing is idempotent: both relay directions and a forced listener
//! shutdown may all call [`Pipe::close`], and only the first caller
//! observing the open state performs the transition.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::rules::Definition;
use crate::telemetry::{TelemetrySink, PUBLISH_INTERVAL};

/// Registry identity of a pipe within its listener.
pub type PipeId = u64;

/// Relay lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Open,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSED: u8 = 1;

pub struct Pipe {
    id: PipeId,
    definition: Definition,
    peer_addr: SocketAddr,
    sink_addr: String,
    state: AtomicU8,
    remove_tx: mpsc::UnboundedSender<PipeId>,
    shutdown: watch::Sender<bool>,
}

impl Pipe {
    /// Create a pipe and register it with its owning listener by
    /// sending its identity on the listener's add channel.
    ///
    /// If the registry side is already gone (listener tearing down),
    /// the pipe closes itself immediately and the caller's relay tasks
    /// will exit on their first shutdown check.
    pub fn open(
        id: PipeId,
        definition: Definition,
        peer_addr: SocketAddr,
        sink_addr: String,
        add_tx: &mpsc::UnboundedSender<Arc<Pipe>>,
        remove_tx: mpsc::UnboundedSender<PipeId>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let pipe = Arc::new(Self {
            id,
            definition,
            peer_addr,
            sink_addr,
            state: AtomicU8::new(STATE_OPEN),
            remove_tx,
            shutdown,
        });

        if add_tx.send(Arc::clone(&pipe)).is_err() {
            debug!(
                rule = %pipe.definition.name,
                peer = %pipe.peer_addr,
                "listener registry gone; closing pipe at creation"
            );
            pipe.close();
        }

        pipe
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn state(&self) -> PipeState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => PipeState::Open,
            _ => PipeState::Closed,
        }
    }

    fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Launch the relay: one task per direction plus a telemetry ticker
    /// that republishes this pipe's Definition while it stays open.
    pub fn connect(self: Arc<Self>, source: TcpStream, sink: TcpStream, telemetry: TelemetrySink) {
        let (source_read, source_write) = source.into_split();
        let (sink_read, sink_write) = sink.into_split();

        Arc::clone(&self).spawn_relay("source->sink", source_read, sink_write);
        Arc::clone(&self).spawn_relay("sink->source", sink_read, source_write);

        let mut shutdown = self.subscribe_shutdown();
        let pipe = self;
        tokio::spawn(async move {
            telemetry.publish(pipe.definition());
            let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);
            ticker.tick().await;
            while !*shutdown.borrow() {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => telemetry.publish(pipe.definition()),
                }
            }
        });
    }

    fn spawn_relay(
        self: Arc<Self>,
        direction: &'static str,
        mut read: OwnedReadHalf,
        mut write: OwnedWriteHalf,
    ) {
        let mut shutdown = self.subscribe_shutdown();
        let pipe = self;
        tokio::spawn(async move {
            if !*shutdown.borrow() {
                tokio::select! {
                    _ = shutdown.changed() => {
                        debug!(
                            rule = %pipe.definition.name,
                            peer = %pipe.peer_addr,
                            direction,
                            "relay stopped by close"
                        );
                    }
                    result = copy_stream(&mut read, &mut write) => match result {
                        Ok(bytes) => debug!(
                            rule = %pipe.definition.name,
                            peer = %pipe.peer_addr,
                            sink = %pipe.sink_addr,
                            direction,
                            bytes,
                            "relay finished"
                        ),
                        Err(error) => debug!(
                            rule = %pipe.definition.name,
                            peer = %pipe.peer_addr,
                            sink = %pipe.sink_addr,
                            direction,
                            %error,
                            "relay ended with error"
                        ),
                    },
                }
            }
            // Dropping the halves closes this pipe's share of the
            // sockets; close() wakes the opposite direction.
            pipe.close();
        });
    }

    /// Transition the pipe to Closed exactly once.
    ///
    /// The first caller sends the removal request to the listener's
    /// registry and wakes both relay tasks so the connections are
    /// dropped. Later callers are no-ops.
    pub fn close(&self) {
        match self.state.compare_exchange(
            STATE_OPEN,
            STATE_CLOSED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                if self.remove_tx.send(self.id).is_err() {
                    debug!(
                        rule = %self.definition.name,
                        peer = %self.peer_addr,
                        "listener registry gone; removal not delivered"
                    );
                }
                let _ = self.shutdown.send(true);
                debug!(
                    rule = %self.definition.name,
                    peer = %self.peer_addr,
                    sink = %self.sink_addr,
                    "pipe closed"
                );
            }
            Err(_) => {
                debug!(
                    rule = %self.definition.name,
                    peer = %self.peer_addr,
                    "pipe already closed"
                );
            }
        }
    }
}

/// Copy bytes one way until EOF or I/O error.
async fn copy_stream(read: &mut OwnedReadHalf, write: &mut OwnedWriteHalf) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut buf = vec![0u8; 8192];
    loop {
        match read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                write.write_all(&buf[..n]).await?;
                total += n as u64;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}
