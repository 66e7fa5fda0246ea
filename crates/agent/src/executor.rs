//! Synchronous executor for Do agents.
//!
//! Each run records a `running` history entry, executes under a cancellable
//! future, and records the terminal entry with the same execution id.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::{AbortHandle, Abortable};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use wunsch_core::{AgentHistoryEntry, AgentRunStatus};

use crate::agent::{Agent, AgentHost};
use crate::error::AgentError;

/// Runs Do agents for one want and tracks their cancellation handles.
#[derive(Default)]
pub struct DoExecutor {
    aborts: Mutex<HashMap<Uuid, AbortHandle>>,
}

impl DoExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a Do agent to completion, recording the running/terminal history
    /// pair. Failures are transient by contract: the error is returned to
    /// the caller for logging but never fails the want.
    pub async fn run(
        &self,
        agent: &Arc<dyn Agent>,
        host: &Arc<dyn AgentHost>,
    ) -> Result<(), AgentError> {
        let execution_id = Uuid::new_v4();
        host.record_agent_run(AgentHistoryEntry {
            execution_id,
            agent_name: agent.name().to_string(),
            status: AgentRunStatus::Running,
            timestamp: Utc::now(),
        });
        host.store_state(
            wunsch_core::state::ACTION_BY_AGENT,
            serde_json::Value::String(agent.name().to_string()),
        );

        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        self.aborts.lock().insert(execution_id, abort_handle);

        debug!(agent = agent.name(), %execution_id, "do agent starting");
        let result = Abortable::new(agent.run(host.clone()), abort_registration).await;
        self.aborts.lock().remove(&execution_id);

        let (status, outcome) = match result {
            Ok(Ok(())) => (AgentRunStatus::Achieved, Ok(())),
            Ok(Err(err)) => {
                warn!(agent = agent.name(), %execution_id, error = %err, "do agent failed");
                (AgentRunStatus::Failed, Err(err))
            }
            Err(_aborted) => (AgentRunStatus::Terminated, Err(AgentError::Cancelled)),
        };

        host.record_agent_run(AgentHistoryEntry {
            execution_id,
            agent_name: agent.name().to_string(),
            status,
            timestamp: Utc::now(),
        });
        info!(agent = agent.name(), %execution_id, status = ?status, "do agent finished");
        outcome
    }

    /// Cancel every in-flight Do execution (want delete / shutdown).
    pub fn cancel_all(&self) {
        for (_, handle) in self.aborts.lock().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::MemoryHost;
    use crate::agent::AgentKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct OneShot {
        fail: bool,
    }

    #[async_trait]
    impl Agent for OneShot {
        fn name(&self) -> &str {
            "one-shot"
        }

        fn kind(&self) -> AgentKind {
            AgentKind::Do
        }

        fn capabilities(&self) -> Vec<String> {
            vec![]
        }

        async fn run(&self, host: Arc<dyn AgentHost>) -> Result<(), AgentError> {
            if self.fail {
                return Err(AgentError::Execution("boom".into()));
            }
            host.store_state("did_it", json!(true));
            Ok(())
        }
    }

    #[tokio::test]
    async fn successful_run_records_running_then_achieved() {
        let executor = DoExecutor::new();
        let host: Arc<MemoryHost> = Arc::new(MemoryHost::new());
        let agent: Arc<dyn Agent> = Arc::new(OneShot { fail: false });

        executor
            .run(&agent, &(host.clone() as Arc<dyn AgentHost>))
            .await
            .unwrap();

        let runs = host.runs.lock();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, AgentRunStatus::Running);
        assert_eq!(runs[1].status, AgentRunStatus::Achieved);
        // shared execution id across the pair
        assert_eq!(runs[0].execution_id, runs[1].execution_id);
        assert_eq!(host.get_state("did_it"), Some(json!(true)));
        assert_eq!(
            host.get_state(wunsch_core::state::ACTION_BY_AGENT),
            Some(json!("one-shot"))
        );
    }

    #[tokio::test]
    async fn failed_run_records_failed_and_does_not_panic() {
        let executor = DoExecutor::new();
        let host: Arc<MemoryHost> = Arc::new(MemoryHost::new());
        let agent: Arc<dyn Agent> = Arc::new(OneShot { fail: true });

        let err = executor
            .run(&agent, &(host.clone() as Arc<dyn AgentHost>))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Execution(_)));

        let runs = host.runs.lock();
        assert_eq!(runs[1].status, AgentRunStatus::Failed);
    }

    struct Sleeper;

    #[async_trait]
    impl Agent for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }

        fn kind(&self) -> AgentKind {
            AgentKind::Do
        }

        fn capabilities(&self) -> Vec<String> {
            vec![]
        }

        async fn run(&self, _host: Arc<dyn AgentHost>) -> Result<(), AgentError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancel_all_terminates_in_flight_runs() {
        let executor = Arc::new(DoExecutor::new());
        let host: Arc<MemoryHost> = Arc::new(MemoryHost::new());
        let agent: Arc<dyn Agent> = Arc::new(Sleeper);

        let run = {
            let executor = executor.clone();
            let host = host.clone() as Arc<dyn AgentHost>;
            tokio::spawn(async move { executor.run(&agent, &host).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        executor.cancel_all();

        let result = run.await.unwrap();
        assert!(matches!(result, Err(AgentError::Cancelled)));
        assert_eq!(
            host.runs.lock().last().unwrap().status,
            AgentRunStatus::Terminated
        );
    }
}
