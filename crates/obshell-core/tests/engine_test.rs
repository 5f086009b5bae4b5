// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DAG engine tests over an on-disk store: restarts, rollback and the
//! scheduler loop.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use obshell_core::persistence::TaskStore;
use obshell_core::task::{
    NodeTemplate, Operator, Scheduler, SchedulerConfig, StoreScope, TaskContext, TaskState, Template,
};

fn scheduler(service: &obshell_core::task::TaskService) -> Scheduler {
    Scheduler::new(
        service.clone(),
        SchedulerConfig {
            poll_interval: Duration::from_millis(20),
        },
    )
}

#[tokio::test]
async fn test_ready_dag_resumes_after_restart() {
    let home = tempfile::tempdir().unwrap();
    let counters = Arc::new(Counters::default());

    let id = {
        let service = open_service(home.path(), &counters).await;
        let template = Template::builder("two steps")
            .node(NodeTemplate::single("Step"))
            .node(NodeTemplate::single("Step"))
            .build()
            .unwrap();
        let dag = service
            .create_dag_by_template(&template, &TaskContext::new(), &[], "")
            .await
            .unwrap();
        // queued in memory only; the pool never starts before the "crash"
        service.advance_dag(dag.id).await.unwrap();
        dag.id
    };
    assert_eq!(counters.executed(), 0);

    let service = open_service(home.path(), &counters).await;
    let _workers = service.pool().start();
    assert_eq!(service.pool().rehydrate().await.unwrap(), 1);
    let scheduler = scheduler(&service);
    let shutdown = scheduler.shutdown_handle();
    let handle = tokio::spawn(scheduler.run());

    let detail = wait_finished(&service, id).await;
    assert_eq!(detail.state, TaskState::Succeed);
    assert_eq!(detail.stage, 2);
    assert_eq!(counters.executed(), 2);

    shutdown.notify_one();
    handle.await.unwrap();
    service.pool().shutdown();
}

#[tokio::test]
async fn test_interrupted_run_fails_then_rolls_back() {
    let home = tempfile::tempdir().unwrap();
    let counters = Arc::new(Counters::default());

    let id = {
        let service = open_service(home.path(), &counters).await;
        let template = Template::builder("interrupted")
            .node(NodeTemplate::single("Step"))
            .build()
            .unwrap();
        let dag = service
            .create_dag_by_template(&template, &TaskContext::new(), &[], "")
            .await
            .unwrap();
        service.advance_dag(dag.id).await.unwrap();

        // the agent dies while the sub-task is on a worker
        let store = service.deps().stores.tasks(StoreScope::Local);
        let mut task = store.list_sub_tasks(dag.id.id).await.unwrap().remove(0);
        task.state = TaskState::Running.to_string();
        task.started_at = Some(chrono::Utc::now());
        store.update_sub_task(&task, &[]).await.unwrap();
        dag.id
    };

    let service = open_service(home.path(), &counters).await;
    let _workers = service.pool().start();
    assert_eq!(service.pool().rehydrate().await.unwrap(), 0);
    service.advance_dag(id).await.unwrap();

    let failed = service.get_dag(id, true).await.unwrap();
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(
        failed.nodes[0].sub_tasks[0].logs,
        vec!["agent restarted while the task was running".to_string()]
    );
    assert_eq!(counters.executed(), 0);

    let scheduler = scheduler(&service);
    let shutdown = scheduler.shutdown_handle();
    tokio::spawn(scheduler.run());

    service.operate(id, Operator::Rollback).await.unwrap();
    let rolled_back = wait_finished(&service, id).await;
    assert_eq!(rolled_back.state, TaskState::Succeed);
    assert_eq!(rolled_back.operator, Operator::Rollback);
    assert_eq!(counters.rolled_back(), 1);

    shutdown.notify_one();
    service.pool().shutdown();
}

#[tokio::test]
async fn test_failed_node_rolls_back_every_stage() {
    let home = tempfile::tempdir().unwrap();
    let counters = Arc::new(Counters::default());
    let service = open_service(home.path(), &counters).await;
    let _workers = service.pool().start();
    let scheduler = scheduler(&service);
    let shutdown = scheduler.shutdown_handle();
    tokio::spawn(scheduler.run());

    let template = Template::builder("breaks at the end")
        .node(NodeTemplate::single("Step"))
        .node(NodeTemplate::single("Step"))
        .node(NodeTemplate::single("Broken"))
        .build()
        .unwrap();
    let dag = service
        .create_dag_by_template(&template, &TaskContext::new(), &[], "")
        .await
        .unwrap();

    let failed = wait_finished(&service, dag.id).await;
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.stage, 3);
    assert_eq!(counters.executed(), 2);

    let err = service.operate(dag.id, Operator::Pass).await.unwrap_err();
    assert_eq!(err.kind(), obshell_core::ErrorKind::TaskOperatorNotAllowed);

    service.operate(dag.id, Operator::Rollback).await.unwrap();
    let done = wait_finished(&service, dag.id).await;
    assert_eq!(done.state, TaskState::Succeed);
    assert_eq!(done.operator, Operator::Rollback);
    assert_eq!(done.stage, 1);
    assert_eq!(counters.rolled_back(), 2);
    assert_eq!(
        done.nodes[2].sub_tasks[0].logs.last().map(String::as_str),
        Some("nothing to undo")
    );

    shutdown.notify_one();
    service.pool().shutdown();
}
