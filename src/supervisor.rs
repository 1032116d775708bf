//! The run supervisor: parallel per-module `run_loop` tasks, reconfigured on
//! membership change, governed by a [`RunningModuleExceptionPolicy`] (spec
//! §4.7, §8 S6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::error::{AgentError, Result};
use crate::ids::ModuleId;

const RERUN_BACKOFF: Duration = Duration::from_millis(10);

/// How the supervisor reacts when a module's `run_loop` returns an error
/// (spec §4.7). `Default` is `LogAndStopModule`, matching spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunningModuleExceptionPolicy {
    /// Remove the offending task from the active set; everything else
    /// continues.
    LogAndStopModule,
    /// Remove the module itself from the agent; everything else continues.
    LogAndRemoveModule,
    /// Restart the offending task after a 10ms backoff; everything else
    /// continues.
    LogAndRerunModule,
    /// Cancel every task, wait out a 10ms backoff, and restart the whole
    /// supervisor loop.
    LogAndRerunAll,
    /// Cancel every task and return `Ok(())`.
    LogAndStopAll,
    /// Cancel every task and propagate the error as `RunPolicyError`.
    RethrowAndStopAll,
}

impl Default for RunningModuleExceptionPolicy {
    fn default() -> Self {
        RunningModuleExceptionPolicy::LogAndStopModule
    }
}

/// Runs every module's `run_loop` concurrently until `cancel` fires, the
/// agent is torn down, or a policy-driven termination occurs (spec §4.7
/// steps 1-4). Only one `run` may be active on a given agent at a time.
pub(crate) async fn run(
    agent: Arc<Agent>,
    policy: RunningModuleExceptionPolicy,
    external_cancel: CancellationToken,
) -> Result<()> {
    let supervisor_token = agent.try_begin_run()?;
    let outcome = run_inner(&agent, policy, &supervisor_token, &external_cancel).await;
    agent.end_run();
    outcome
}

enum PolicyOutcome {
    Continue,
    RestartAll,
    StopAll,
    Propagate(String),
}

async fn run_inner(
    agent: &Arc<Agent>,
    policy: RunningModuleExceptionPolicy,
    supervisor_token: &CancellationToken,
    external_cancel: &CancellationToken,
) -> Result<()> {
    let mut set: JoinSet<(ModuleId, Result<()>)> = JoinSet::new();
    let mut abort_handles: HashMap<ModuleId, AbortHandle> = HashMap::new();
    let mut cancel_tokens: HashMap<ModuleId, CancellationToken> = HashMap::new();
    // Modules whose `run_loop` already returned `Ok(())` once. A module with
    // no background work (the default `run_loop` returns immediately) must
    // not be relaunched on every reconfiguration pass triggered by some
    // other module's membership change — only an actual re-add (a fresh
    // `ModuleId`) or an error-driven policy restarts it.
    let mut completed: std::collections::HashSet<ModuleId> = std::collections::HashSet::new();

    'reconfigure: loop {
        let current_modules = agent.modules_snapshot();
        let current_ids: std::collections::HashSet<ModuleId> =
            current_modules.iter().map(|m| m.handle().id()).collect();

        // (b) cancel tasks whose module is no longer a member
        let stale: Vec<ModuleId> = abort_handles
            .keys()
            .copied()
            .filter(|id| !current_ids.contains(id))
            .collect();
        for id in stale {
            if let Some(token) = cancel_tokens.remove(&id) {
                token.cancel();
            }
            abort_handles.remove(&id);
        }
        completed.retain(|id| current_ids.contains(id));

        // (a) start tasks for modules not already running and not already
        // completed normally
        for module in &current_modules {
            let id = module.handle().id();
            if abort_handles.contains_key(&id) || completed.contains(&id) {
                continue;
            }
            let child_token = supervisor_token.child_token();
            cancel_tokens.insert(id, child_token.clone());
            let module = module.clone();
            let handle = set.spawn(async move {
                let result = module.run_loop(child_token).await;
                (id, result)
            });
            abort_handles.insert(id, handle);
        }

        if set.is_empty() {
            tokio::select! {
                _ = supervisor_token.cancelled() => return Ok(()),
                _ = external_cancel.cancelled() => {
                    supervisor_token.cancel();
                    return Err(AgentError::Cancelled);
                }
                _ = agent.wait_membership_change() => continue 'reconfigure,
            }
        }

        loop {
            tokio::select! {
                _ = supervisor_token.cancelled() => {
                    set.shutdown().await;
                    return Ok(());
                }
                _ = external_cancel.cancelled() => {
                    supervisor_token.cancel();
                    set.shutdown().await;
                    return Err(AgentError::Cancelled);
                }
                _ = agent.wait_membership_change() => {
                    continue 'reconfigure;
                }
                joined = set.join_next() => {
                    match joined {
                        None => continue 'reconfigure,
                        Some(Ok((id, Ok(())))) => {
                            abort_handles.remove(&id);
                            cancel_tokens.remove(&id);
                            completed.insert(id);
                        }
                        Some(Ok((id, Err(error)))) => {
                            abort_handles.remove(&id);
                            cancel_tokens.remove(&id);
                            let type_name = current_modules
                                .iter()
                                .find(|m| m.handle().id() == id)
                                .map(|m| m.handle().type_name())
                                .unwrap_or("<removed>");
                            match apply_policy(agent, policy, id, type_name, error, &mut set, &mut abort_handles, &mut cancel_tokens, supervisor_token).await {
                                PolicyOutcome::Continue => {}
                                PolicyOutcome::RestartAll => {
                                    set.shutdown().await;
                                    abort_handles.clear();
                                    cancel_tokens.clear();
                                    completed.clear();
                                    continue 'reconfigure;
                                }
                                PolicyOutcome::StopAll => {
                                    set.shutdown().await;
                                    return Ok(());
                                }
                                PolicyOutcome::Propagate(message) => {
                                    set.shutdown().await;
                                    return Err(AgentError::RunPolicyError(message));
                                }
                            }
                        }
                        Some(Err(join_error)) => {
                            if join_error.is_panic() {
                                tracing::error!(error = %join_error, "module run_loop task panicked");
                            }
                        }
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn apply_policy(
    agent: &Arc<Agent>,
    policy: RunningModuleExceptionPolicy,
    id: ModuleId,
    type_name: &'static str,
    error: AgentError,
    set: &mut JoinSet<(ModuleId, Result<()>)>,
    abort_handles: &mut HashMap<ModuleId, AbortHandle>,
    cancel_tokens: &mut HashMap<ModuleId, CancellationToken>,
    supervisor_token: &CancellationToken,
) -> PolicyOutcome {
    match policy {
        RunningModuleExceptionPolicy::LogAndStopModule => {
            tracing::error!(module = type_name, error = %error, "module run loop failed; stopping that module");
            PolicyOutcome::Continue
        }
        RunningModuleExceptionPolicy::LogAndRemoveModule => {
            tracing::error!(module = type_name, error = %error, "module run loop failed; removing module");
            if let Some(module) = agent.modules_snapshot().into_iter().find(|m| m.handle().id() == id) {
                if let Err(remove_err) = agent.remove_modules(vec![module]) {
                    tracing::error!(module = type_name, error = %remove_err, "failed to remove module after run loop failure");
                }
            }
            PolicyOutcome::Continue
        }
        RunningModuleExceptionPolicy::LogAndRerunModule => {
            tracing::error!(module = type_name, error = %error, "module run loop failed; rerunning after backoff");
            tokio::time::sleep(RERUN_BACKOFF).await;
            if let Some(module) = agent.modules_snapshot().into_iter().find(|m| m.handle().id() == id) {
                let child_token = supervisor_token.child_token();
                cancel_tokens.insert(id, child_token.clone());
                let handle = set.spawn(async move {
                    let result = module.run_loop(child_token).await;
                    (id, result)
                });
                abort_handles.insert(id, handle);
            }
            PolicyOutcome::Continue
        }
        RunningModuleExceptionPolicy::LogAndRerunAll => {
            tracing::error!(module = type_name, error = %error, "module run loop failed; rerunning all modules after backoff");
            tokio::time::sleep(RERUN_BACKOFF).await;
            PolicyOutcome::RestartAll
        }
        RunningModuleExceptionPolicy::LogAndStopAll => {
            tracing::error!(module = type_name, error = %error, "module run loop failed; stopping supervisor");
            PolicyOutcome::StopAll
        }
        RunningModuleExceptionPolicy::RethrowAndStopAll => {
            tracing::error!(module = type_name, error = %error, "module run loop failed; propagating");
            PolicyOutcome::Propagate(error.to_string())
        }
    }
}
