//! Router task with a statum lifecycle
//!
//! # State Machine
//!
//! ```text
//! Configured ──► Active ──► Draining ──► Stopped
//!                  │            ▲
//!                  └────────────┘
//!            (shutdown or channel closed)
//! ```
//!
//! While draining, messages already queued on the inbound channel are still
//! routed so nothing accepted from the broker is silently lost on shutdown.

use super::message_manager::InboundMessage;
use super::router::MessageRouter;
use statum::{machine, state};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[state]
#[derive(Debug, Clone)]
pub enum RouterState {
    Configured,
    Active,
    Draining,
    Stopped,
}

#[machine]
pub struct RouterWorker<S: RouterState> {
    router: MessageRouter,
    inbound: mpsc::Receiver<InboundMessage>,
    routed: u64,
}

impl<S: RouterState> RouterWorker<S> {
    /// Messages routed so far
    pub fn routed(&self) -> u64 {
        self.routed
    }
}

impl RouterWorker<Configured> {
    pub fn create(router: MessageRouter, inbound: mpsc::Receiver<InboundMessage>) -> Self {
        Self::new(router, inbound, 0)
    }

    pub fn activate(self) -> RouterWorker<Active> {
        info!("Message router active");
        self.transition()
    }
}

impl RouterWorker<Active> {
    /// Routes messages until `shutdown` fires or every sender is gone
    pub async fn run_until_shutdown(mut self, shutdown: CancellationToken) -> RouterWorker<Draining> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Router shutdown requested");
                    break;
                }
                message = self.inbound.recv() => match message {
                    Some(message) => {
                        let outcome = self.router.route(&message);
                        debug!("Routed {}: {:?}", message.topic, outcome);
                        self.routed += 1;
                    }
                    None => {
                        debug!("Inbound channel closed");
                        break;
                    }
                },
            }
        }
        self.transition()
    }
}

impl RouterWorker<Draining> {
    pub fn drain(mut self) -> RouterWorker<Stopped> {
        self.inbound.close();
        let mut drained = 0u64;
        while let Ok(message) = self.inbound.try_recv() {
            self.router.route(&message);
            drained += 1;
        }
        if drained > 0 {
            info!("Routed {} queued messages while draining", drained);
        }
        self.routed += drained;
        self.transition()
    }
}

impl RouterWorker<Stopped> {}

/// Owns the spawned router task
#[derive(Debug)]
pub struct RouterHandle {
    task: Option<JoinHandle<u64>>,
    shutdown: CancellationToken,
}

impl RouterHandle {
    pub fn spawn(
        router: MessageRouter,
        inbound: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        let worker = RouterWorker::create(router, inbound).activate();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let stopped = worker.run_until_shutdown(token).await.drain();
            info!("Message router stopped after {} messages", stopped.routed());
            stopped.routed()
        });

        Self {
            task: Some(task),
            shutdown,
        }
    }

    /// Stops the router and waits for it to drain. Returns the number of
    /// messages routed, or `None` if it was already shut down.
    pub async fn shutdown(&mut self) -> Option<u64> {
        self.shutdown.cancel();
        let task = self.task.take()?;
        match task.await {
            Ok(routed) => Some(routed),
            Err(e) => {
                error!("Router task failed: {}", e);
                None
            }
        }
    }
}
