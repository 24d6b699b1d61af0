//! Convergence of live listeners to the rules file.
//!
//! The reconciler owns the authoritative map of rule name to
//! [`ManagedListener`] plus the previously applied Definition map it
//! diffs against. A pass partitions the two snapshots into removed,
//! common, and added names and applies all three groups inside one
//! critical section, so a file-change trigger and the periodic fallback
//! can never interleave their mutations.
//!
//! A common rule whose Definition is value-equal to the previous one is
//! left completely alone: its listener keeps its socket, its pipes, and
//! its round-robin state. Anything unequal is a full replace.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use flowgate_diff::partition;

use crate::config;
use crate::discovery::Resolver;
use crate::error::RulesError;
use crate::listener::ManagedListener;
use crate::rules::Definition;
use crate::telemetry::TelemetrySink;

struct State {
    /// Live listeners by rule name.
    listeners: HashMap<String, Arc<ManagedListener>>,
    /// Diff baseline: the Definition map last applied.
    previous: BTreeMap<String, Definition>,
}

pub struct Reconciler {
    rules_path: PathBuf,
    resolver: Arc<dyn Resolver>,
    telemetry: TelemetrySink,
    reload_fallback: Duration,
    /// One serialized critical section per reconciliation pass.
    state: Mutex<State>,
}

impl Reconciler {
    pub fn new(
        rules_path: PathBuf,
        resolver: Arc<dyn Resolver>,
        telemetry: TelemetrySink,
        reload_fallback: Duration,
    ) -> Self {
        Self {
            rules_path,
            resolver,
            telemetry,
            reload_fallback,
            state: Mutex::new(State {
                listeners: HashMap::new(),
                previous: BTreeMap::new(),
            }),
        }
    }

    /// Load the rules file and converge the live listener set to it.
    ///
    /// An unreadable or unparsable rules file is an error the caller
    /// must treat as fatal to the process.
    pub async fn reconcile(&self) -> Result<(), RulesError> {
        let next = config::load_rules(&self.rules_path)?;
        self.apply(next).await;
        Ok(())
    }

    /// Converge the live listener set to an already-parsed snapshot.
    pub async fn apply(&self, next: BTreeMap<String, Definition>) {
        let mut state = self.state.lock().await;
        let split = partition(&state.previous, &next);

        for name in &split.removed {
            info!(rule = %name, "rule removed; closing listener");
            if let Some(listener) = state.listeners.remove(name) {
                listener.close().await;
            }
            state.previous.remove(name);
        }

        for name in &split.common {
            let fresh = &next[name];
            let unchanged = state
                .previous
                .get(name)
                .is_some_and(|applied| applied == fresh);
            if unchanged {
                debug!(rule = %name, "rule unchanged");
                continue;
            }

            info!(
                rule = %name,
                source = %fresh.source,
                sink = %fresh.sink,
                "rule changed; replacing listener"
            );
            if let Some(listener) = state.listeners.remove(name) {
                listener.close().await;
            }
            let listener = ManagedListener::bind(
                fresh.clone(),
                Arc::clone(&self.resolver),
                self.telemetry.clone(),
            )
            .await;
            Arc::clone(&listener).open().await;
            state.listeners.insert(name.clone(), listener);
            state.previous.insert(name.clone(), fresh.clone());
        }

        for name in &split.added {
            let fresh = &next[name];
            info!(
                rule = %name,
                source = %fresh.source,
                sink = %fresh.sink,
                "rule added; opening listener"
            );
            let listener = ManagedListener::bind(
                fresh.clone(),
                Arc::clone(&self.resolver),
                self.telemetry.clone(),
            )
            .await;
            Arc::clone(&listener).open().await;
            state.listeners.insert(name.clone(), listener);
            state.previous.insert(name.clone(), fresh.clone());
        }

        // Prime discovery-enabled rules rather than waiting a full
        // refresh tick.
        for listener in state.listeners.values() {
            listener.load_endpoints().await;
        }
    }

    /// Run the reconciliation loop: once immediately, then on every
    /// change notification, with a periodic fallback covering missed
    /// notifications. Returns only on a fatal rules error.
    pub async fn run(&self, mut reload_rx: mpsc::UnboundedReceiver<()>) -> Result<(), RulesError> {
        self.reconcile().await?;

        let mut notifier_open = true;
        loop {
            tokio::select! {
                signal = reload_rx.recv(), if notifier_open => match signal {
                    Some(()) => {
                        info!("rules change notification; reconciling");
                        self.reconcile().await?;
                    }
                    None => {
                        warn!("change notifier closed; relying on fallback timer");
                        notifier_open = false;
                    }
                },
                _ = tokio::time::sleep(self.reload_fallback) => {
                    debug!(
                        fallback_secs = self.reload_fallback.as_secs(),
                        "fallback timer; reconciling"
                    );
                    self.reconcile().await?;
                }
            }
        }
    }

    /// Close every live listener. Used on orderly shutdown.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for (name, listener) in state.listeners.drain() {
            debug!(rule = %name, "shutdown; closing listener");
            listener.close().await;
        }
        state.previous.clear();
    }

    /// The live listener for a rule, if one exists.
    pub async fn listener(&self, name: &str) -> Option<Arc<ManagedListener>> {
        self.state.lock().await.listeners.get(name).cloned()
    }

    /// Names of currently applied rules.
    pub async fn rule_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.previous.keys().cloned().collect();
        names.sort();
        names
    }
}
