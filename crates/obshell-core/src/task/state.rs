// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DAG state machine.
//!
//! Pure functions over a [`DagSnapshot`]: [`advance`] moves a live DAG as far
//! as its sub-task states allow, [`apply_operator`] validates and applies a
//! user operator. Both return a [`Step`] listing the rows to write and the
//! sub-tasks to hand to the executor; nothing here touches a store.
//!
//! ```text
//!   forward:   node 1 ──► node 2 ──► ... ──► node N ──► SUCCEED
//!   rollback:  node k ──► node k-1 ──► ... ──► node 1 ──► SUCCEED (ROLLBACK)
//! ```

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::error::{Error, ErrorKind, Result};
use crate::persistence::{DagRecord, NodeRecord, SubTaskRecord};

use super::types::{GenericId, Operator, StoreScope, TaskState};

/// A DAG with all of its nodes and sub-tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct DagSnapshot {
    /// Store holding the DAG.
    pub scope: StoreScope,
    /// DAG row.
    pub dag: DagRecord,
    /// Nodes ordered by position.
    pub nodes: Vec<NodeRecord>,
    /// Sub-tasks ordered by node position then declared order.
    pub tasks: Vec<SubTaskRecord>,
}

impl DagSnapshot {
    /// Store-qualified DAG id.
    pub fn generic_id(&self) -> GenericId {
        GenericId {
            scope: self.scope,
            id: self.dag.id,
        }
    }
}

/// Rows changed by a transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Step {
    /// The DAG row, when changed.
    pub dag: Option<DagRecord>,
    /// Changed nodes.
    pub nodes: Vec<NodeRecord>,
    /// Changed sub-tasks.
    pub tasks: Vec<SubTaskRecord>,
    /// Sub-tasks to hand to the executor.
    pub enqueue: Vec<i64>,
    /// Running sub-tasks whose cancel signal must fire.
    pub cancel: Vec<i64>,
}

impl Step {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.dag.is_none()
            && self.nodes.is_empty()
            && self.tasks.is_empty()
            && self.enqueue.is_empty()
            && self.cancel.is_empty()
    }
}

/// Move a live DAG as far as its sub-task states allow.
pub fn advance(snapshot: &DagSnapshot, now: DateTime<Utc>) -> Result<Step> {
    let mut w = Working::new(snapshot);
    // Every node can start and finish at most once per call.
    for _ in 0..(2 * snapshot.nodes.len() + 2) {
        if !w.advance_once(now)? {
            break;
        }
    }
    Ok(w.into_step())
}

/// Validate and apply `op` to a DAG.
pub fn apply_operator(snapshot: &DagSnapshot, op: Operator, now: DateTime<Utc>) -> Result<Step> {
    let mut w = Working::new(snapshot);
    let state = w.dag.task_state()?;
    let current = w.dag.task_operator()?;
    let not_allowed = || {
        Error::with_args(
            ErrorKind::TaskOperatorNotAllowed,
            [op.to_string(), snapshot.generic_id().to_string(), state.to_string()],
        )
    };

    match op {
        Operator::Run => return Err(not_allowed()),
        Operator::Retry => {
            if state != TaskState::Failed || current == Operator::Rollback {
                return Err(not_allowed());
            }
            let idx = w
                .nodes
                .iter()
                .position(|n| n.state == TaskState::Failed.as_str())
                .unwrap_or(w.current_node_index()?);
            let failed: Vec<usize> = w
                .node_tasks(idx)
                .into_iter()
                .filter(|&t| w.tasks[t].state == TaskState::Failed.as_str())
                .collect();
            if failed.iter().any(|&t| !w.tasks[t].can_retry) {
                return Err(not_allowed());
            }
            for t in failed {
                let task = &mut w.tasks[t];
                task.state = TaskState::Ready.to_string();
                task.operator = Operator::Retry.to_string();
                task.execute_times += 1;
                task.started_at = None;
                task.end_at = None;
                let id = task.id;
                w.touch_task(t);
                w.enqueue.push(id);
            }
            w.nodes[idx].state = TaskState::Running.to_string();
            w.nodes[idx].end_at = None;
            w.touch_node(idx);
            w.dag.stage = idx as i32 + 1;
            w.reopen(Operator::Retry);
        }
        Operator::Rollback => {
            let rolled_back = state == TaskState::Succeed && current == Operator::Rollback;
            if !matches!(state, TaskState::Failed | TaskState::Succeed) || rolled_back {
                return Err(not_allowed());
            }
            let ran = |t: &SubTaskRecord| {
                t.state != TaskState::Pending.as_str() || t.operator == Operator::Rollback.as_str()
            };
            if w.tasks.iter().any(|t| ran(t) && !t.can_rollback) {
                return Err(not_allowed());
            }
            if current == Operator::Rollback {
                // Resume a failed rollback at the node where it stopped.
                let idx = w.current_node_index()?;
                for t in w.node_tasks(idx) {
                    let task = &mut w.tasks[t];
                    if task.operator == Operator::Rollback.as_str()
                        && task.state == TaskState::Failed.as_str()
                    {
                        task.state = TaskState::Pending.to_string();
                        task.execute_times += 1;
                        task.started_at = None;
                        task.end_at = None;
                        w.touch_task(t);
                    }
                }
                w.nodes[idx].state = TaskState::Running.to_string();
                w.nodes[idx].end_at = None;
                w.touch_node(idx);
            }
            w.reopen(Operator::Rollback);
        }
        Operator::Cancel => {
            if state.is_terminal() || current == Operator::Rollback {
                return Err(not_allowed());
            }
            let idx = w.current_node_index()?;
            for t in w.node_tasks(idx) {
                let task = &mut w.tasks[t];
                match TaskState::parse(&task.state)? {
                    TaskState::Ready => {
                        task.state = TaskState::Failed.to_string();
                        task.operator = Operator::Cancel.to_string();
                        task.end_at = Some(now);
                        let id = task.id;
                        w.touch_task(t);
                        w.cancel.push(id);
                    }
                    TaskState::Running if task.can_cancel => {
                        task.operator = Operator::Cancel.to_string();
                        let id = task.id;
                        w.touch_task(t);
                        w.cancel.push(id);
                    }
                    _ => {}
                }
            }
            w.dag.operator = Operator::Cancel.to_string();
            w.dag_changed = true;
        }
        Operator::Pass => {
            if current == Operator::Rollback {
                return Err(not_allowed());
            }
            let idx = w.current_node_index()?;
            let tasks = w.node_tasks(idx);
            match state {
                TaskState::Failed => {
                    let failed: Vec<usize> = tasks
                        .into_iter()
                        .filter(|&t| w.tasks[t].state == TaskState::Failed.as_str())
                        .collect();
                    if failed.is_empty() || failed.iter().any(|&t| !w.tasks[t].can_pass) {
                        return Err(not_allowed());
                    }
                    for t in failed {
                        let task = &mut w.tasks[t];
                        task.state = TaskState::Succeed.to_string();
                        task.operator = Operator::Pass.to_string();
                        task.end_at = Some(now);
                        w.touch_task(t);
                    }
                    w.nodes[idx].state = TaskState::Running.to_string();
                    w.nodes[idx].end_at = None;
                    w.touch_node(idx);
                    w.reopen(Operator::Pass);
                }
                TaskState::Running => {
                    let running: Vec<usize> = tasks
                        .into_iter()
                        .filter(|&t| w.tasks[t].state == TaskState::Running.as_str())
                        .collect();
                    if running.is_empty() || running.iter().any(|&t| !w.tasks[t].can_pass) {
                        return Err(not_allowed());
                    }
                    let ids: Vec<i64> = running.iter().map(|&t| w.tasks[t].id).collect();
                    w.dag.operator = Operator::Pass.to_string();
                    w.dag_changed = true;
                    w.enqueue.extend(ids);
                }
                _ => return Err(not_allowed()),
            }
        }
    }

    Ok(w.into_step())
}

struct Working {
    dag: DagRecord,
    nodes: Vec<NodeRecord>,
    tasks: Vec<SubTaskRecord>,
    dag_changed: bool,
    changed_nodes: HashSet<usize>,
    changed_tasks: HashSet<usize>,
    enqueue: Vec<i64>,
    cancel: Vec<i64>,
}

impl Working {
    fn new(snapshot: &DagSnapshot) -> Self {
        Self {
            dag: snapshot.dag.clone(),
            nodes: snapshot.nodes.clone(),
            tasks: snapshot.tasks.clone(),
            dag_changed: false,
            changed_nodes: HashSet::new(),
            changed_tasks: HashSet::new(),
            enqueue: Vec::new(),
            cancel: Vec::new(),
        }
    }

    fn into_step(self) -> Step {
        let mut nodes: Vec<_> = self.changed_nodes.into_iter().collect();
        nodes.sort_unstable();
        let mut tasks: Vec<_> = self.changed_tasks.into_iter().collect();
        tasks.sort_unstable();
        Step {
            dag: self.dag_changed.then_some(self.dag),
            nodes: nodes.into_iter().map(|i| self.nodes[i].clone()).collect(),
            tasks: tasks.into_iter().map(|i| self.tasks[i].clone()).collect(),
            enqueue: self.enqueue,
            cancel: self.cancel,
        }
    }

    fn touch_node(&mut self, idx: usize) {
        self.changed_nodes.insert(idx);
    }

    fn touch_task(&mut self, idx: usize) {
        self.changed_tasks.insert(idx);
    }

    fn current_node_index(&self) -> Result<usize> {
        let idx = self.dag.stage - 1;
        if idx < 0 || idx as usize >= self.nodes.len() {
            return Err(Error::unexpected(format!(
                "dag {} stage {} outside 1..={}",
                self.dag.id,
                self.dag.stage,
                self.nodes.len()
            )));
        }
        Ok(idx as usize)
    }

    /// Indices of the sub-tasks of node `idx` in declared order.
    fn node_tasks(&self, idx: usize) -> Vec<usize> {
        let node_id = self.nodes[idx].id;
        let mut out: Vec<usize> = (0..self.tasks.len())
            .filter(|&t| self.tasks[t].node_id == node_id)
            .collect();
        out.sort_by_key(|&t| self.tasks[t].seq);
        out
    }

    fn reopen(&mut self, op: Operator) {
        self.dag.state = TaskState::Running.to_string();
        self.dag.operator = op.to_string();
        self.dag.end_at = None;
        self.dag_changed = true;
    }

    fn finish_dag(&mut self, state: TaskState, now: DateTime<Utc>) {
        self.dag.state = state.to_string();
        self.dag.end_at = Some(now);
        self.dag_changed = true;
    }

    fn finish_node(&mut self, idx: usize, state: TaskState, now: DateTime<Utc>) {
        self.nodes[idx].state = state.to_string();
        self.nodes[idx].end_at = Some(now);
        self.touch_node(idx);
    }

    fn advance_once(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if self.dag.task_state()?.is_terminal() {
            return Ok(false);
        }
        let idx = self.current_node_index()?;
        match self.dag.task_operator()? {
            Operator::Rollback => self.rollback_once(idx, now),
            Operator::Cancel => self.cancel_once(idx, now),
            Operator::Run | Operator::Retry | Operator::Pass => self.forward_once(idx, now),
        }
    }

    fn forward_once(&mut self, idx: usize, now: DateTime<Utc>) -> Result<bool> {
        match self.nodes[idx].task_state()? {
            TaskState::Pending | TaskState::Ready => {
                self.nodes[idx].state = TaskState::Running.to_string();
                self.nodes[idx].started_at.get_or_insert(now);
                self.touch_node(idx);
                if self.dag.state != TaskState::Running.as_str() {
                    self.dag.state = TaskState::Running.to_string();
                    self.dag_changed = true;
                }
                if self.dag.started_at.is_none() {
                    self.dag.started_at = Some(now);
                    self.dag_changed = true;
                }
                self.release_forward(idx);
                Ok(true)
            }
            TaskState::Running => {
                let counts = self.count(idx, |_| true)?;
                if counts.succeed == counts.total {
                    self.finish_node(idx, TaskState::Succeed, now);
                    self.next_stage(now);
                    return Ok(true);
                }
                if counts.active == 0 && counts.failed > 0 {
                    self.finish_node(idx, TaskState::Failed, now);
                    self.finish_dag(TaskState::Failed, now);
                    return Ok(true);
                }
                if counts.active == 0 && counts.pending > 0 {
                    return Ok(self.release_forward(idx));
                }
                Ok(false)
            }
            TaskState::Succeed => {
                self.next_stage(now);
                Ok(true)
            }
            TaskState::Failed => {
                self.finish_dag(TaskState::Failed, now);
                Ok(true)
            }
        }
    }

    fn next_stage(&mut self, now: DateTime<Utc>) {
        if self.dag.operator == Operator::Pass.as_str() {
            self.dag.operator = Operator::Run.to_string();
        }
        if self.dag.stage >= self.dag.max_stage {
            self.finish_dag(TaskState::Succeed, now);
        } else {
            self.dag.stage += 1;
            self.dag_changed = true;
        }
    }

    /// Mark the next runnable forward sub-tasks of node `idx` READY.
    fn release_forward(&mut self, idx: usize) -> bool {
        let pending: Vec<usize> = self
            .node_tasks(idx)
            .into_iter()
            .filter(|&t| {
                self.tasks[t].state == TaskState::Pending.as_str()
                    && self.tasks[t].operator != Operator::Rollback.as_str()
            })
            .collect();
        let release = if self.nodes[idx].parallel {
            pending
        } else {
            pending.into_iter().take(1).collect()
        };
        self.mark_ready(release)
    }

    /// Mark the next sub-tasks awaiting rollback in node `idx` READY,
    /// last-declared first on sequential nodes.
    fn release_rollback(&mut self, idx: usize) -> bool {
        let pending: Vec<usize> = self
            .node_tasks(idx)
            .into_iter()
            .filter(|&t| {
                self.tasks[t].state == TaskState::Pending.as_str()
                    && self.tasks[t].operator == Operator::Rollback.as_str()
            })
            .collect();
        let release = if self.nodes[idx].parallel {
            pending
        } else {
            pending.into_iter().next_back().into_iter().collect()
        };
        self.mark_ready(release)
    }

    fn mark_ready(&mut self, tasks: Vec<usize>) -> bool {
        let released = !tasks.is_empty();
        for t in tasks {
            self.tasks[t].state = TaskState::Ready.to_string();
            let id = self.tasks[t].id;
            self.touch_task(t);
            self.enqueue.push(id);
        }
        released
    }

    fn rollback_once(&mut self, idx: usize, now: DateTime<Utc>) -> Result<bool> {
        if self.nodes[idx].operator != Operator::Rollback.as_str() {
            // Enter the node: everything that ran is queued for rollback.
            for t in self.node_tasks(idx) {
                let task = &mut self.tasks[t];
                if matches!(task.task_state()?, TaskState::Succeed | TaskState::Failed) {
                    task.state = TaskState::Pending.to_string();
                    task.operator = Operator::Rollback.to_string();
                    task.execute_times += 1;
                    task.started_at = None;
                    task.end_at = None;
                    self.touch_task(t);
                }
            }
            self.nodes[idx].operator = Operator::Rollback.to_string();
            self.nodes[idx].state = TaskState::Running.to_string();
            self.nodes[idx].end_at = None;
            self.touch_node(idx);
            self.release_rollback(idx);
            return Ok(true);
        }

        let counts = self.count(idx, |t| t.operator == Operator::Rollback.as_str())?;
        if counts.succeed == counts.total {
            self.finish_node(idx, TaskState::Succeed, now);
            if self.dag.stage <= 1 {
                self.finish_dag(TaskState::Succeed, now);
            } else {
                self.dag.stage -= 1;
                self.dag_changed = true;
            }
            return Ok(true);
        }
        if counts.active == 0 && counts.failed > 0 {
            self.finish_node(idx, TaskState::Failed, now);
            self.finish_dag(TaskState::Failed, now);
            return Ok(true);
        }
        if counts.active == 0 && counts.pending > 0 {
            return Ok(self.release_rollback(idx));
        }
        Ok(false)
    }

    fn cancel_once(&mut self, idx: usize, now: DateTime<Utc>) -> Result<bool> {
        let counts = self.count(idx, |_| true)?;
        if counts.active > 0 {
            return Ok(false);
        }
        let node_state = if counts.succeed == counts.total {
            TaskState::Succeed
        } else {
            TaskState::Failed
        };
        self.finish_node(idx, node_state, now);
        self.finish_dag(TaskState::Failed, now);
        Ok(true)
    }

    fn count(&self, idx: usize, filter: impl Fn(&SubTaskRecord) -> bool) -> Result<Counts> {
        let mut counts = Counts::default();
        for t in self.node_tasks(idx) {
            let task = &self.tasks[t];
            if !filter(task) {
                continue;
            }
            counts.total += 1;
            match task.task_state()? {
                TaskState::Pending => counts.pending += 1,
                TaskState::Ready | TaskState::Running => counts.active += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Succeed => counts.succeed += 1,
            }
        }
        Ok(counts)
    }
}

#[derive(Debug, Default)]
struct Counts {
    total: usize,
    pending: usize,
    active: usize,
    failed: usize,
    succeed: usize,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Snapshot with one node per entry: `(parallel, task count, can_*)`.
    pub(crate) fn snapshot(nodes: &[(bool, usize)]) -> DagSnapshot {
        let now = Utc::now();
        let mut node_rows = Vec::new();
        let mut task_rows = Vec::new();
        let mut task_id = 100;
        for (i, (parallel, count)) in nodes.iter().enumerate() {
            let node_id = i as i64 + 10;
            node_rows.push(NodeRecord {
                id: node_id,
                dag_id: 1,
                seq: i as i32 + 1,
                name: format!("node-{}", i + 1),
                parallel: *parallel,
                state: "PENDING".to_string(),
                operator: "RUN".to_string(),
                started_at: None,
                end_at: None,
            });
            for seq in 0..*count {
                task_id += 1;
                task_rows.push(SubTaskRecord {
                    id: task_id,
                    dag_id: 1,
                    node_id,
                    seq: seq as i32,
                    type_name: "T".to_string(),
                    name: format!("t{}", task_id),
                    state: "PENDING".to_string(),
                    operator: "RUN".to_string(),
                    can_cancel: true,
                    can_continue: false,
                    can_pass: true,
                    can_retry: true,
                    can_rollback: true,
                    execute_times: 1,
                    execute_agent: "127.0.0.1:2886".to_string(),
                    data: "{}".to_string(),
                    additional_data: "{}".to_string(),
                    created_at: now,
                    started_at: None,
                    end_at: None,
                });
            }
        }
        DagSnapshot {
            scope: StoreScope::Local,
            dag: DagRecord {
                id: 1,
                name: "dag".to_string(),
                stage: 1,
                max_stage: nodes.len() as i32,
                state: "READY".to_string(),
                operator: "RUN".to_string(),
                maintenance_type: "GLOBAL".to_string(),
                maintenance_key: String::new(),
                context: "{}".to_string(),
                trace_id: String::new(),
                created_at: now,
                started_at: None,
                end_at: None,
            },
            nodes: node_rows,
            tasks: task_rows,
        }
    }

    fn apply(snap: &mut DagSnapshot, step: Step) {
        if let Some(dag) = step.dag {
            snap.dag = dag;
        }
        for node in step.nodes {
            let slot = snap.nodes.iter_mut().find(|n| n.id == node.id).unwrap();
            *slot = node;
        }
        for task in step.tasks {
            let slot = snap.tasks.iter_mut().find(|t| t.id == task.id).unwrap();
            *slot = task;
        }
    }

    fn step(snap: &mut DagSnapshot) -> Vec<i64> {
        let s = advance(snap, Utc::now()).unwrap();
        let enqueued = s.enqueue.clone();
        apply(snap, s);
        enqueued
    }

    fn finish(snap: &mut DagSnapshot, id: i64, state: &str) {
        let task = snap.tasks.iter_mut().find(|t| t.id == id).unwrap();
        task.state = state.to_string();
    }

    fn operate(snap: &mut DagSnapshot, op: Operator) -> Result<Step> {
        let s = apply_operator(snap, op, Utc::now())?;
        apply(snap, s.clone());
        Ok(s)
    }

    #[test]
    fn test_parallel_then_sequential_to_success() {
        let mut snap = snapshot(&[(true, 2), (false, 2)]);

        assert_eq!(step(&mut snap), vec![101, 102]);
        assert_eq!(snap.dag.state, "RUNNING");
        assert_eq!(snap.nodes[0].state, "RUNNING");

        finish(&mut snap, 101, "SUCCEED");
        assert!(step(&mut snap).is_empty());
        finish(&mut snap, 102, "SUCCEED");

        // Node 1 completes and node 2 starts in the same pass.
        assert_eq!(step(&mut snap), vec![103]);
        assert_eq!(snap.dag.stage, 2);
        assert_eq!(snap.nodes[0].state, "SUCCEED");

        finish(&mut snap, 103, "SUCCEED");
        assert_eq!(step(&mut snap), vec![104]);
        finish(&mut snap, 104, "SUCCEED");
        step(&mut snap);

        assert_eq!(snap.dag.state, "SUCCEED");
        assert_eq!(snap.dag.stage, 2);
        assert!(snap.dag.end_at.is_some());
    }

    #[test]
    fn test_failure_halts_until_siblings_finish() {
        let mut snap = snapshot(&[(true, 2), (true, 1)]);
        step(&mut snap);

        finish(&mut snap, 101, "FAILED");
        step(&mut snap);
        assert_eq!(snap.dag.state, "RUNNING");

        finish(&mut snap, 102, "SUCCEED");
        step(&mut snap);
        assert_eq!(snap.dag.state, "FAILED");
        assert_eq!(snap.nodes[0].state, "FAILED");
        assert_eq!(snap.tasks[2].state, "PENDING");
    }

    #[test]
    fn test_retry_rewinds_failed_tasks() {
        let mut snap = snapshot(&[(true, 2), (true, 1)]);
        step(&mut snap);
        finish(&mut snap, 101, "FAILED");
        finish(&mut snap, 102, "SUCCEED");
        step(&mut snap);

        let s = operate(&mut snap, Operator::Retry).unwrap();
        assert_eq!(s.enqueue, vec![101]);
        assert_eq!(snap.tasks[0].state, "READY");
        assert_eq!(snap.tasks[0].execute_times, 2);
        assert_eq!(snap.tasks[1].execute_times, 1);
        assert_eq!(snap.dag.state, "RUNNING");
        assert_eq!(snap.dag.operator, "RETRY");

        finish(&mut snap, 101, "SUCCEED");
        assert_eq!(step(&mut snap), vec![103]);
        assert_eq!(snap.dag.stage, 2);
    }

    #[test]
    fn test_operator_legality() {
        let mut snap = snapshot(&[(true, 1)]);
        step(&mut snap);

        let err = apply_operator(&snap, Operator::Retry, Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskOperatorNotAllowed);
        assert!(apply_operator(&snap, Operator::Rollback, Utc::now()).is_err());
        assert!(apply_operator(&snap, Operator::Run, Utc::now()).is_err());

        finish(&mut snap, 101, "FAILED");
        step(&mut snap);
        assert!(apply_operator(&snap, Operator::Cancel, Utc::now()).is_err());

        snap.tasks[0].can_retry = false;
        assert!(apply_operator(&snap, Operator::Retry, Utc::now()).is_err());
        snap.tasks[0].can_pass = false;
        assert!(apply_operator(&snap, Operator::Pass, Utc::now()).is_err());
    }

    #[test]
    fn test_pass_from_failed_is_synthetic_success() {
        let mut snap = snapshot(&[(true, 1), (true, 1)]);
        step(&mut snap);
        finish(&mut snap, 101, "FAILED");
        step(&mut snap);

        operate(&mut snap, Operator::Pass).unwrap();
        assert_eq!(snap.tasks[0].state, "SUCCEED");
        assert_eq!(snap.tasks[0].operator, "PASS");

        assert_eq!(step(&mut snap), vec![102]);
        assert_eq!(snap.dag.operator, "RUN");
        assert_eq!(snap.dag.stage, 2);
    }

    #[test]
    fn test_pass_from_running_releases_waiting_tasks() {
        let mut snap = snapshot(&[(true, 1)]);
        step(&mut snap);
        finish(&mut snap, 101, "RUNNING");

        let s = operate(&mut snap, Operator::Pass).unwrap();
        assert_eq!(s.enqueue, vec![101]);
        assert_eq!(snap.dag.operator, "PASS");
        assert_eq!(snap.tasks[0].state, "RUNNING");
    }

    #[test]
    fn test_rollback_walks_back_one_stage_per_node() {
        let mut snap = snapshot(&[(true, 1), (false, 2)]);
        step(&mut snap);
        finish(&mut snap, 101, "SUCCEED");
        step(&mut snap);
        finish(&mut snap, 102, "SUCCEED");
        step(&mut snap);
        finish(&mut snap, 103, "FAILED");
        step(&mut snap);
        assert_eq!(snap.dag.state, "FAILED");
        assert_eq!(snap.dag.stage, 2);

        operate(&mut snap, Operator::Rollback).unwrap();
        // Sequential node: the last task that ran rolls back first.
        assert_eq!(step(&mut snap), vec![103]);
        assert_eq!(snap.tasks[2].operator, "ROLLBACK");
        assert_eq!(snap.tasks[2].execute_times, 2);
        assert_eq!(snap.tasks[1].state, "PENDING");

        finish(&mut snap, 103, "SUCCEED");
        assert_eq!(step(&mut snap), vec![102]);
        finish(&mut snap, 102, "SUCCEED");

        assert_eq!(step(&mut snap), vec![101]);
        assert_eq!(snap.dag.stage, 1);

        finish(&mut snap, 101, "SUCCEED");
        step(&mut snap);
        assert_eq!(snap.dag.state, "SUCCEED");
        assert_eq!(snap.dag.operator, "ROLLBACK");
        assert_eq!(snap.dag.stage, 1);

        assert!(apply_operator(&snap, Operator::Rollback, Utc::now()).is_err());
    }

    #[test]
    fn test_failed_rollback_requires_rollback_again() {
        let mut snap = snapshot(&[(true, 1)]);
        step(&mut snap);
        finish(&mut snap, 101, "FAILED");
        step(&mut snap);

        operate(&mut snap, Operator::Rollback).unwrap();
        step(&mut snap);
        finish(&mut snap, 101, "FAILED");
        step(&mut snap);
        assert_eq!(snap.dag.state, "FAILED");
        assert_eq!(snap.dag.operator, "ROLLBACK");

        assert!(apply_operator(&snap, Operator::Retry, Utc::now()).is_err());

        operate(&mut snap, Operator::Rollback).unwrap();
        assert_eq!(snap.tasks[0].execute_times, 3);
        assert_eq!(step(&mut snap), vec![101]);
    }

    #[test]
    fn test_rollback_requires_capability() {
        let mut snap = snapshot(&[(true, 1)]);
        snap.tasks[0].can_rollback = false;
        step(&mut snap);
        finish(&mut snap, 101, "SUCCEED");
        step(&mut snap);
        assert_eq!(snap.dag.state, "SUCCEED");
        assert!(apply_operator(&snap, Operator::Rollback, Utc::now()).is_err());
    }

    #[test]
    fn test_cancel_fails_ready_and_signals_running() {
        let mut snap = snapshot(&[(true, 3)]);
        step(&mut snap);
        finish(&mut snap, 101, "RUNNING");
        finish(&mut snap, 102, "RUNNING");
        snap.tasks[1].can_cancel = false;

        let s = operate(&mut snap, Operator::Cancel).unwrap();
        assert_eq!(s.cancel, vec![101, 103]);
        assert_eq!(snap.tasks[2].state, "FAILED");
        assert_eq!(snap.tasks[1].operator, "RUN");

        finish(&mut snap, 101, "FAILED");
        step(&mut snap);
        assert_eq!(snap.dag.state, "RUNNING");

        finish(&mut snap, 102, "SUCCEED");
        step(&mut snap);
        assert_eq!(snap.dag.state, "FAILED");
        assert_eq!(snap.dag.operator, "CANCEL");

        let s = operate(&mut snap, Operator::Retry).unwrap();
        assert_eq!(s.enqueue, vec![101, 103]);
    }
}
