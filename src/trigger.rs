//! Trigger-rule evaluation: pure readiness decisions over predecessor statuses

use crate::models::{TaskStatus, TriggerRule};
use serde::{Deserialize, Serialize};

/// Decision for a pending node given its predecessors' current statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Dispatch the node now
    Ready,
    /// Leave pending; re-evaluate when a predecessor changes status
    Wait,
    /// Mark skipped without executing
    Skip,
    /// Mark upstream-failed without executing
    UpstreamFail,
}

/// How `one_success` treats still-unresolved predecessors.
///
/// `Eager` unblocks a join the moment one qualifying predecessor succeeds.
/// `AllTerminal` defers every decision until each predecessor has reached a
/// terminal status, reproducing the stricter wall-clock ordering of engines
/// that only evaluate joins after all upstream slots settle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    #[default]
    Eager,
    AllTerminal,
}

/// Evaluate a node's trigger rule against its direct predecessors.
///
/// Roots (no predecessors) are always ready.
pub fn evaluate(rule: TriggerRule, mode: EvalMode, upstream: &[TaskStatus]) -> Readiness {
    if upstream.is_empty() {
        return Readiness::Ready;
    }

    match rule {
        TriggerRule::AllSuccess => evaluate_all_success(upstream),
        TriggerRule::OneSuccess => evaluate_one_success(mode, upstream),
    }
}

fn evaluate_all_success(upstream: &[TaskStatus]) -> Readiness {
    // Failure outranks skip: one bad predecessor poisons the node even
    // while siblings are still running.
    if upstream
        .iter()
        .any(|s| matches!(s, TaskStatus::Failed | TaskStatus::UpstreamFailed))
    {
        return Readiness::UpstreamFail;
    }
    if upstream.iter().any(|s| matches!(s, TaskStatus::Skipped)) {
        return Readiness::Skip;
    }
    if upstream.iter().all(|s| matches!(s, TaskStatus::Success)) {
        return Readiness::Ready;
    }
    Readiness::Wait
}

fn evaluate_one_success(mode: EvalMode, upstream: &[TaskStatus]) -> Readiness {
    let all_terminal = upstream.iter().all(TaskStatus::is_terminal);
    let any_success = upstream.iter().any(|s| matches!(s, TaskStatus::Success));

    if mode == EvalMode::AllTerminal && !all_terminal {
        return Readiness::Wait;
    }

    // One success unblocks the join immediately; sibling branches still
    // running (or already skipped) are irrelevant.
    if any_success {
        return Readiness::Ready;
    }
    if !all_terminal {
        return Readiness::Wait;
    }
    if upstream
        .iter()
        .any(|s| matches!(s, TaskStatus::Failed | TaskStatus::UpstreamFailed))
    {
        return Readiness::UpstreamFail;
    }
    // All predecessors skipped
    Readiness::Skip
}
