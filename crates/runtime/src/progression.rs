//! The per-want execution driver.
//!
//! One task per want runs an ordered iteration: stop channel, control
//! signals, suspension, achievement, error states, connectivity
//! preconditions, agent reconciliation, then one staged progress cycle.

use std::sync::{Arc, Weak};

use futures::FutureExt;
use tracing::{debug, info, warn};

use wunsch_bus::{EventMeta, ExecutionControl, RuntimeEvent};
use wunsch_core::WantStatus;

use crate::builder::BuilderCore;
use crate::error::ProgressError;
use crate::want::{ControlCommand, Progressable, Want};

pub(crate) fn spawn_progression_loop(
    want: Arc<Want>,
    progressable: Arc<dyn Progressable>,
    core: Weak<BuilderCore>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run_loop(want.clone(), progressable, core).await;
        want.set_task_active(false);
        want.events()
            .emit(RuntimeEvent::ProcessEnd {
                meta: EventMeta::new(want.name().to_string(), String::new()),
            })
            .await;
        debug!(want = %want.name(), "progression loop exited");
    })
}

async fn run_loop(want: Arc<Want>, progressable: Arc<dyn Progressable>, core: Weak<BuilderCore>) {
    let interval = want.exec_interval();
    let mut stop_rx = want.stop_receiver();

    if let Err(err) = progressable.initialize(&want).await {
        apply_progress_error(&want, &err);
        if matches!(err, ProgressError::Module(_) | ProgressError::Failed(_)) {
            return;
        }
    }

    loop {
        // 1. stop channel
        if *stop_rx.borrow() {
            want.transition_status(WantStatus::Terminated).await;
            want.stop_background_agents().await;
            return;
        }

        // 2. control signals, drained non-blocking
        while let Some(cmd) = want.try_recv_control().await {
            match cmd {
                ControlCommand::Suspend => {
                    want.set_suspended(true);
                    want.transition_status(WantStatus::Suspended).await;
                }
                ControlCommand::Resume => {
                    want.set_suspended(false);
                    want.transition_status(WantStatus::Reaching).await;
                }
                ControlCommand::Stop => {
                    want.transition_status(WantStatus::Terminated).await;
                    want.stop_background_agents().await;
                    return;
                }
                ControlCommand::Restart => {
                    info!(want = %want.name(), "restart");
                    want.set_suspended(false);
                    want.stop_background_agents().await;
                    want.clear_config_error();
                    want.transition_status(WantStatus::Reaching).await;
                    if let Err(err) = progressable.initialize(&want).await {
                        apply_progress_error(&want, &err);
                    }
                }
            }
        }

        // 3. suspended by control
        if want.is_suspended() {
            tokio::time::sleep(interval).await;
            continue;
        }

        // 4. achievement check
        if progressable.is_achieved(&want) {
            finish_achieved(&want, &core).await;
            return;
        }

        // 5. error states
        match want.status() {
            WantStatus::Failed | WantStatus::Terminated | WantStatus::ModuleError => {
                want.stop_background_agents().await;
                return;
            }
            WantStatus::ConfigError => {
                // recoverable: wait for a config update or restart signal
                tokio::time::sleep(interval).await;
                continue;
            }
            _ => {}
        }

        // 6. connectivity preconditions against the currently-active paths
        let paths = want.paths();
        let connectivity = want.connectivity();
        let inputs = paths.in_paths.iter().filter(|p| p.active).count();
        let outputs = paths.out_paths.iter().filter(|p| p.active).count();
        if !connectivity.satisfied_by(inputs, outputs) {
            if want.status() != WantStatus::Suspended {
                debug!(
                    want = %want.name(),
                    inputs,
                    outputs,
                    "connectivity unsatisfied, suspending"
                );
                want.transition_status(WantStatus::Suspended).await;
            }
            tokio::time::sleep(interval).await;
            continue;
        }
        if want.status() == WantStatus::Suspended {
            // preconditions restored; control-suspension was handled above
            want.transition_status(WantStatus::Reaching).await;
        }

        // 7. pre-execution gate
        let responses = want
            .events()
            .emit(RuntimeEvent::PreExecution {
                meta: EventMeta::new(want.name().to_string(), String::new()),
            })
            .await;
        if responses
            .iter()
            .any(|r| r.control == ExecutionControl::Terminate)
        {
            want.transition_status(WantStatus::Terminated).await;
            want.stop_background_agents().await;
            return;
        }
        if responses.iter().any(|r| {
            matches!(r.control, ExecutionControl::Skip | ExecutionControl::Block)
        }) {
            tokio::time::sleep(interval).await;
            continue;
        }

        // 8. agent reconciliation
        want.execute_agents().await;

        // 9–11. one staged progress cycle
        want.begin_progress_cycle();
        let outcome = std::panic::AssertUnwindSafe(progressable.progress(&want))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                want.end_progress_cycle();
            }
            Ok(Err(err)) => {
                apply_progress_error(&want, &err);
                want.end_progress_cycle();
                match err {
                    ProgressError::Config(_) => {
                        // loops back through the recoverable-error wait
                    }
                    ProgressError::Module(_) | ProgressError::Failed(_) => {
                        want.stop_background_agents().await;
                        return;
                    }
                }
            }
            Err(panic) => {
                // a genuine bug in the want type: record it, clean up, then
                // let the panic surface
                want.set_module_error("panic in progress");
                want.end_progress_cycle();
                want.stop_background_agents().await;
                std::panic::resume_unwind(panic);
            }
        }

        // 12. post-execution achievement check
        if progressable.is_achieved(&want) {
            finish_achieved(&want, &core).await;
            return;
        }

        // 13. throttle
        tokio::time::sleep(interval).await;
    }
}

fn apply_progress_error(want: &Arc<Want>, err: &ProgressError) {
    match err {
        ProgressError::Config(msg) => want.set_config_error(msg),
        ProgressError::Module(msg) => want.set_module_error(msg),
        ProgressError::Failed(msg) => want.set_failed(msg),
    }
}

/// Entry into `achieved`: flush the final cycle, stop agents, notify the
/// builder's completion tracking, and deliver the completion to the
/// controller owner.
async fn finish_achieved(want: &Arc<Want>, core: &Weak<BuilderCore>) {
    want.transition_status(WantStatus::Achieved).await;

    // one final cycle so final_result and the completion invariants land
    want.begin_progress_cycle();
    want.end_progress_cycle();

    want.stop_background_agents().await;

    let core = core.upgrade();
    if let Some(core) = &core {
        core.mark_completed(want.id());
    }

    if let Some(owner) = want.metadata().controller_owner() {
        if let Some(parent) = core.as_ref().and_then(|c| c.want_by_id(owner.id)) {
            parent.record_child_completed(want.name());
        } else {
            warn!(want = %want.name(), owner = %owner.name, "controller owner not found");
        }
        want.events()
            .emit(RuntimeEvent::OwnerCompletion {
                meta: EventMeta::new(want.name().to_string(), owner.name.clone()),
                child_name: want.name().to_string(),
            })
            .await;
    }

    info!(want = %want.name(), "achieved");
}
