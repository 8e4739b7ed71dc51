//! Background worker: one long-running task sweeping the ticket registry
//! for server-side timeouts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::registry::TicketRegistry;
use crate::transport::TransportDriver;

pub struct BackgroundWorker {
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub fn spawn(
        registry: Arc<TicketRegistry>,
        transport: Arc<dyn TransportDriver>,
        sweep_interval: Duration,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let shutdown_for_task = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_for_task.notified() => {
                        debug!("background worker shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        transport.work_once().await;
                        let timed_out = registry.sweep_timeouts();
                        if !timed_out.is_empty() {
                            trace!(count = timed_out.len(), "swept timed-out requests");
                        }
                    }
                }
            }

            // Wake any waiter still blocked so it observes shutdown and
            // can drain.
            registry.notify_all();
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    pub async fn shutdown(&mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
