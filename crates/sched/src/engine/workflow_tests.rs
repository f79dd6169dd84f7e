// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{channels, BroadcastMessage, MemoryBus};
use crate::proto::{EdgeAction, JobStatusData, RawEdgeFrame, StartWorkflowData, StatusKind};
use crate::queue::MemoryBroker;
use crate::sandbox::{ScriptOutcome, ScriptedSandbox};
use crate::session::EdgeWriter;
use crate::status::ActionKey;
use crate::store::{
    HandleTemplate, IoType, MemoryStore, NodeType, ReturnInfo, RunStatus, SchedStore, Workflow,
    WorkflowEdge, WorkflowNode,
};

use crate::engine::{EngineDeps, WorkflowEngine};

struct Harness {
    deps: EngineDeps,
    store: Arc<MemoryStore>,
    bus: MemoryBus,
    writer_rx: mpsc::Receiver<String>,
}

fn harness(sandbox: ScriptedSandbox) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let bus = MemoryBus::new();
    let broker = MemoryBroker::new();
    let (writer, writer_rx) = EdgeWriter::channel(64);
    let deps = EngineDeps {
        store: Arc::clone(&store) as _,
        kv: Arc::new(broker.clone()),
        bus: Arc::new(bus.clone()),
        sandbox: Arc::new(sandbox),
        writer,
        translate_node_param: true,
        node_pool_size: 5,
    };
    Harness { deps, store, bus, writer_rx }
}

fn passthrough_sandbox() -> ScriptedSandbox {
    ScriptedSandbox::new(|_, inputs| {
        Ok(ScriptOutcome { stdout: String::new(), error: String::new(), return_value: inputs.clone() })
    })
}

fn device_node(workflow_id: Uuid, name: &str) -> WorkflowNode {
    WorkflowNode {
        id: Uuid::new_v4(),
        workflow_id,
        name: name.to_owned(),
        node_type: NodeType::DeviceAction,
        device_name: Some("pump-1".to_owned()),
        action_name: "prepare".to_owned(),
        action_type: "sync".to_owned(),
        script: None,
        param: json!({}),
        disabled: false,
    }
}

fn script_node(workflow_id: Uuid, name: &str, script: &str) -> WorkflowNode {
    WorkflowNode {
        id: Uuid::new_v4(),
        workflow_id,
        name: name.to_owned(),
        node_type: NodeType::Script,
        device_name: None,
        action_name: String::new(),
        action_type: String::new(),
        script: Some(script.to_owned()),
        param: json!({}),
        disabled: false,
    }
}

fn seed_workflow(store: &MemoryStore) -> Uuid {
    let workflow_id = Uuid::new_v4();
    store.insert_workflow(Workflow {
        id: workflow_id,
        lab_id: Uuid::new_v4(),
        name: "wf".to_owned(),
    });
    workflow_id
}

fn engine_for(
    harness: &Harness,
    lab_id: Uuid,
    workflow_id: Uuid,
) -> (Arc<WorkflowEngine>, Uuid) {
    let task_id = Uuid::new_v4();
    let engine = WorkflowEngine::new(
        harness.deps.clone(),
        lab_id,
        StartWorkflowData { workflow_id, user_id: "user-1".to_owned(), task_id },
        &CancellationToken::new(),
    );
    (engine, task_id)
}

/// Answer queries with free and job_starts with a success report carrying
/// `return_value`; collects the actions seen.
fn spawn_edge(
    mut writer_rx: mpsc::Receiver<String>,
    engine: Arc<WorkflowEngine>,
    return_value: Value,
) -> tokio::task::JoinHandle<Vec<EdgeAction>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(payload) = writer_rx.recv().await {
            let frame: RawEdgeFrame = match serde_json::from_str(&payload) {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            seen.push(frame.action);
            match frame.action {
                EdgeAction::QueryActionState => {
                    let task_id = frame.data["task_id"].as_str().and_then(|s| s.parse().ok());
                    let job_id = frame.data["job_id"].as_str().and_then(|s| s.parse().ok());
                    let (Some(task_id), Some(job_id)) = (task_id, job_id) else { continue };
                    engine.set_action_status(
                        ActionKey {
                            kind: StatusKind::Query,
                            task_id,
                            job_id,
                            device_id: frame.data["device_id"].as_str().unwrap_or_default().to_owned(),
                            action_name: frame.data["action_name"]
                                .as_str()
                                .unwrap_or_default()
                                .to_owned(),
                        },
                        true,
                        Duration::ZERO,
                    );
                }
                EdgeAction::JobStart => {
                    let task_id = frame.data["task_id"].as_str().and_then(|s| s.parse().ok());
                    let job_id = frame.data["job_id"].as_str().and_then(|s| s.parse().ok());
                    let (Some(task_id), Some(job_id)) = (task_id, job_id) else { continue };
                    engine.on_job_update(&JobStatusData {
                        job_id,
                        task_id,
                        device_id: frame.data["device_id"].as_str().unwrap_or_default().to_owned(),
                        action_name: frame.data["action"].as_str().unwrap_or_default().to_owned(),
                        status: RunStatus::Success,
                        feedback_data: Value::Null,
                        return_info: ReturnInfo {
                            suc: true,
                            return_value: return_value.clone(),
                            ..ReturnInfo::default()
                        },
                    });
                }
                _ => {}
            }
        }
        seen
    })
}

#[tokio::test(start_paused = true)]
async fn device_then_script_rewrites_and_succeeds() -> anyhow::Result<()> {
    // The script adds one to its `x` input.
    let sandbox = ScriptedSandbox::new(|_, inputs| {
        let x = inputs.get("x").and_then(Value::as_i64).unwrap_or_default();
        Ok(ScriptOutcome {
            stdout: String::new(),
            error: String::new(),
            return_value: json!({"y": x + 1}),
        })
    });
    let mut h = harness(sandbox);
    let workflow_id = seed_workflow(&h.store);

    let a = device_node(workflow_id, "A");
    let b = script_node(workflow_id, "B", "return {'y': inputs['x'] + 1}");
    let source = HandleTemplate {
        id: Uuid::new_v4(),
        handle_key: "result.x".to_owned(),
        io_type: IoType::Source,
        data_source: "executor".to_owned(),
        data_key: "x".to_owned(),
    };
    let target = HandleTemplate {
        id: Uuid::new_v4(),
        handle_key: "x".to_owned(),
        io_type: IoType::Target,
        data_source: String::new(),
        data_key: "x".to_owned(),
    };
    h.store.insert_edge(WorkflowEdge {
        source_node: a.id,
        target_node: b.id,
        source_handle: source.id,
        target_handle: target.id,
    });
    h.store.insert_handle(source);
    h.store.insert_handle(target);
    let (a_id, b_id) = (a.id, b.id);
    h.store.insert_node(a);
    h.store.insert_node(b);

    let (engine, task_id) = engine_for(&h, Uuid::new_v4(), workflow_id);
    let mut status_rx = h.bus.subscribe_raw(&channels::job_status(task_id));

    let writer_rx = std::mem::replace(&mut h.writer_rx, mpsc::channel(1).1);
    let edge = spawn_edge(writer_rx, Arc::clone(&engine), json!({"x": 41}));

    engine.run().await?;

    assert_eq!(h.store.task(task_id)?.status, RunStatus::Success);

    let jobs = h.store.jobs_for_task(task_id);
    assert_eq!(jobs.len(), 2);
    let b_job = jobs
        .iter()
        .find(|j| j.node_id == b_id)
        .ok_or_else(|| anyhow::anyhow!("no job for script node"))?;
    assert_eq!(b_job.return_info.return_value, json!({"y": 42}));

    // Exactly two status events, upstream first.
    let first: BroadcastMessage = serde_json::from_str(&status_rx.recv().await?)?;
    let second: BroadcastMessage = serde_json::from_str(&status_rx.recv().await?)?;
    assert_eq!(first.data["node_id"], json!(a_id));
    assert_eq!(first.data["status"], json!("success"));
    assert_eq!(second.data["node_id"], json!(b_id));
    assert_eq!(second.data["status"], json!("success"));

    drop(engine);
    drop(h);
    let _ = edge.await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cycle_fails_before_any_dispatch() -> anyhow::Result<()> {
    let mut h = harness(passthrough_sandbox());
    let workflow_id = seed_workflow(&h.store);

    let a = device_node(workflow_id, "A");
    let b = device_node(workflow_id, "B");
    h.store.insert_edge(WorkflowEdge {
        source_node: a.id,
        target_node: b.id,
        source_handle: Uuid::new_v4(),
        target_handle: Uuid::new_v4(),
    });
    h.store.insert_edge(WorkflowEdge {
        source_node: b.id,
        target_node: a.id,
        source_handle: Uuid::new_v4(),
        target_handle: Uuid::new_v4(),
    });
    h.store.insert_node(a);
    h.store.insert_node(b);

    // Translation off so missing handle templates don't mask the cycle.
    h.deps.translate_node_param = false;
    let (engine, task_id) = engine_for(&h, Uuid::new_v4(), workflow_id);

    let result = engine.run().await;
    assert_eq!(result, Err(crate::error::SchedError::WorkflowHasCycle));
    assert_eq!(h.store.task(task_id)?.status, RunStatus::Failed);
    assert!(h.store.jobs_for_task(task_id).is_empty(), "no jobs for a rejected workflow");

    // Zero frames reached the edge.
    assert!(h.writer_rx.try_recv().is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn empty_workflow_succeeds_with_zero_jobs() -> anyhow::Result<()> {
    let h = harness(passthrough_sandbox());
    let workflow_id = seed_workflow(&h.store);

    let (engine, task_id) = engine_for(&h, Uuid::new_v4(), workflow_id);
    engine.run().await?;

    assert_eq!(h.store.task(task_id)?.status, RunStatus::Success);
    assert!(h.store.jobs_for_task(task_id).is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unanswered_query_times_out() -> anyhow::Result<()> {
    let h = harness(passthrough_sandbox());
    let workflow_id = seed_workflow(&h.store);
    h.store.insert_node(device_node(workflow_id, "A"));

    let (engine, task_id) = engine_for(&h, Uuid::new_v4(), workflow_id);
    let result = engine.run().await;

    assert_eq!(result, Err(crate::error::SchedError::Timeout));
    assert_eq!(h.store.task(task_id)?.status, RunStatus::Timeout);
    let jobs = h.store.jobs_for_task(task_id);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, RunStatus::Timeout);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_and_notifies_edge() -> anyhow::Result<()> {
    let mut h = harness(passthrough_sandbox());
    let workflow_id = seed_workflow(&h.store);
    h.store.insert_node(device_node(workflow_id, "A"));

    let (engine, task_id) = engine_for(&h, Uuid::new_v4(), workflow_id);

    let run = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    // Wait for the query to go out, then stop the task.
    let query = tokio::time::timeout(Duration::from_secs(30), h.writer_rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("writer closed"))?;
    let frame: RawEdgeFrame = serde_json::from_str(&query)?;
    assert_eq!(frame.action, EdgeAction::QueryActionState);

    engine.stop().await;

    let cancel = tokio::time::timeout(Duration::from_secs(30), h.writer_rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("writer closed"))?;
    let frame: RawEdgeFrame = serde_json::from_str(&cancel)?;
    assert_eq!(frame.action, EdgeAction::CancelTask);
    assert_eq!(frame.data["task_id"], json!(task_id));

    let result = run.await.map_err(|e| anyhow::anyhow!(e))?;
    assert_eq!(result, Err(crate::error::SchedError::Canceled));
    assert_eq!(h.store.task(task_id)?.status, RunStatus::Canceled);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn first_failure_cancels_siblings() -> anyhow::Result<()> {
    // The script node fails immediately; its device sibling never gets a
    // query answer and must surface canceled, not timeout.
    let sandbox = ScriptedSandbox::new(|_, _| {
        Ok(ScriptOutcome {
            stdout: String::new(),
            error: "boom".to_owned(),
            return_value: Value::Null,
        })
    });
    let h = harness(sandbox);
    let workflow_id = seed_workflow(&h.store);
    let script = script_node(workflow_id, "S", "raise");
    let device = device_node(workflow_id, "D");
    let (script_id, device_id) = (script.id, device.id);
    h.store.insert_node(script);
    h.store.insert_node(device);

    let (engine, task_id) = engine_for(&h, Uuid::new_v4(), workflow_id);
    let result = engine.run().await;

    assert!(matches!(
        result,
        Err(crate::error::SchedError::ScriptExecutionFailed(_))
    ));
    assert_eq!(h.store.task(task_id)?.status, RunStatus::Failed);

    let jobs: HashMap<Uuid, RunStatus> = h
        .store
        .jobs_for_task(task_id)
        .into_iter()
        .map(|j| (j.node_id, j.status))
        .collect();
    assert_eq!(jobs.get(&script_id), Some(&RunStatus::Failed));
    assert_eq!(jobs.get(&device_id), Some(&RunStatus::Canceled));
    Ok(())
}
