//! Background drivers for persistent agents (Monitor / Poll / Think).
//!
//! Each driver is one task on a ticker. It stops when the owning want
//! achieves or when stopped explicitly; Think agents get one final run on
//! the way out so staged conclusions are flushed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent::{Agent, AgentHost, AgentKind};

/// Grace period for a driver to wind down before its task is aborted.
const STOP_GRACE: Duration = Duration::from_secs(1);

pub fn default_interval(kind: AgentKind) -> Duration {
    match kind {
        AgentKind::Think => Duration::from_secs(2),
        AgentKind::Poll => Duration::from_secs(3),
        AgentKind::Monitor => Duration::from_secs(5),
        // Do agents never run in the background.
        AgentKind::Do => Duration::from_secs(2),
    }
}

/// Key under which a running background agent is registered on its want,
/// ensuring each (kind, agent, want) starts exactly once.
pub fn background_key(kind: AgentKind, agent_name: &str, want_id: uuid::Uuid) -> String {
    format!("{kind}-{agent_name}-{want_id}")
}

/// Handle to a running background agent.
pub struct BackgroundAgent {
    pub key: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundAgent {
    /// Signal the driver and wait up to the grace period, then abort.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if tokio::time::timeout(STOP_GRACE, &mut self.handle).await.is_err() {
            warn!(key = %self.key, "background agent did not stop in time, aborting");
            self.handle.abort();
        }
    }
}

/// Spawn the ticker task for a persistent agent.
pub fn spawn_background(
    agent: Arc<dyn Agent>,
    host: Arc<dyn AgentHost>,
    interval: Duration,
) -> BackgroundAgent {
    let key = background_key(agent.kind(), agent.name(), host.want_id());
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let task_key = key.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; skip it so the agent starts one
        // interval after the want enters reaching.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if agent.kind() == AgentKind::Think {
                        // Final flush before exit.
                        if let Err(err) = agent.run(host.clone()).await {
                            warn!(key = %task_key, error = %err, "final think run failed");
                        }
                    }
                    break;
                }
                _ = ticker.tick() => {
                    if host.is_achieved() {
                        debug!(key = %task_key, "want achieved, background agent exits");
                        break;
                    }
                    if let Err(err) = agent.run(host.clone()).await {
                        // Transient by contract: recorded, never fails the want.
                        warn!(key = %task_key, error = %err, "background agent run failed");
                    }
                }
            }
        }
        debug!(key = %task_key, "background agent stopped");
    });

    BackgroundAgent {
        key,
        stop_tx,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::MemoryHost;
    use crate::error::AgentError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TickCounter {
        kind: AgentKind,
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Agent for TickCounter {
        fn name(&self) -> &str {
            "ticker"
        }

        fn kind(&self) -> AgentKind {
            self.kind
        }

        fn capabilities(&self) -> Vec<String> {
            vec![]
        }

        async fn run(&self, host: Arc<dyn AgentHost>) -> Result<(), AgentError> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            host.store_state("ticks", json!(n));
            Ok(())
        }
    }

    #[tokio::test]
    async fn monitor_runs_periodically_until_stopped() {
        let host = Arc::new(MemoryHost::new());
        let ticks = Arc::new(AtomicUsize::new(0));
        let driver = spawn_background(
            Arc::new(TickCounter {
                kind: AgentKind::Monitor,
                ticks: ticks.clone(),
            }),
            host.clone(),
            Duration::from_millis(20),
        );

        tokio::time::sleep(Duration::from_millis(110)).await;
        driver.stop().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected >=3 ticks, got {seen}");
        assert_eq!(host.get_state("ticks"), Some(json!(seen)));
    }

    #[tokio::test]
    async fn think_agent_gets_final_flush_on_stop() {
        let host = Arc::new(MemoryHost::new());
        let ticks = Arc::new(AtomicUsize::new(0));
        let driver = spawn_background(
            Arc::new(TickCounter {
                kind: AgentKind::Think,
                ticks: ticks.clone(),
            }),
            host.clone(),
            // Interval far beyond the test duration: only the flush runs.
            Duration::from_secs(60),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        driver.stop().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn driver_exits_when_want_achieves() {
        let host = Arc::new(MemoryHost::new());
        host.achieved.store(true, Ordering::SeqCst);
        let ticks = Arc::new(AtomicUsize::new(0));
        let driver = spawn_background(
            Arc::new(TickCounter {
                kind: AgentKind::Poll,
                ticks: ticks.clone(),
            }),
            host.clone(),
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        // already exited on its own; stop() is a no-op join
        driver.stop().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn background_keys_are_unique_per_want() {
        let id_a = uuid::Uuid::new_v4();
        let id_b = uuid::Uuid::new_v4();
        assert_ne!(
            background_key(AgentKind::Think, "x", id_a),
            background_key(AgentKind::Think, "x", id_b)
        );
    }
}
