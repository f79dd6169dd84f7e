// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scheduling scenarios over the real WebSocket edge protocol.

use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use labsched::bus::channels;
use labsched::store::{
    HandleTemplate, IoType, MemoryStore, NodeType, Notebook, NotebookGroup, NotebookOverride,
    NotebookStatus, RunStatus, SchedStore, Workflow, WorkflowEdge, WorkflowNode,
};
use labsched_specs::{FakeEdge, SpecServer};

const TIMEOUT: Duration = Duration::from_secs(10);

fn device_node(workflow_id: Uuid, name: &str, device: &str) -> WorkflowNode {
    WorkflowNode {
        id: Uuid::new_v4(),
        workflow_id,
        name: name.to_owned(),
        node_type: NodeType::DeviceAction,
        device_name: Some(device.to_owned()),
        action_name: "prepare".to_owned(),
        action_type: "sync".to_owned(),
        script: None,
        param: json!({}),
        disabled: false,
    }
}

fn script_node(workflow_id: Uuid, name: &str) -> WorkflowNode {
    WorkflowNode {
        id: Uuid::new_v4(),
        workflow_id,
        name: name.to_owned(),
        node_type: NodeType::Script,
        device_name: None,
        action_name: String::new(),
        action_type: String::new(),
        script: Some("return inputs".to_owned()),
        param: json!({}),
        disabled: false,
    }
}

fn seed_workflow(store: &MemoryStore, lab_id: Uuid) -> Uuid {
    let workflow_id = Uuid::new_v4();
    store.insert_workflow(Workflow { id: workflow_id, lab_id, name: "spec".to_owned() });
    workflow_id
}

/// Poll `f` until it returns true or the timeout lapses.
async fn wait_until(what: &str, mut f: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if f() {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_online(server: &SpecServer, lab_id: Uuid) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if server.services.registry.is_online(lab_id).await? {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("lab never came online");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn health_reports_service() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let resp: Value =
        reqwest::get(format!("{}/api/health", server.base_url())).await?.json().await?;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["service"], "lab-sched-specs");
    Ok(())
}

#[tokio::test]
async fn ping_gets_a_stamped_pong() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    server.add_lab("ak", "sk");

    let mut edge = FakeEdge::connect(&server, "ak", "sk", "edge-1").await?;
    edge.send("ping", json!({"seq": 7})).await?;

    let pong = edge.recv(TIMEOUT).await?;
    assert_eq!(pong.action, "pong");
    assert_eq!(pong.data["seq"], 7);
    assert!(pong.data["server_timestamp"].as_f64().unwrap_or_default() > 0.0);
    Ok(())
}

#[tokio::test]
async fn happy_path_workflow_runs_device_then_script() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let lab_id = server.add_lab("ak", "sk");

    // A (device) feeds its return value's `x` into B (script)'s `x`.
    let workflow_id = seed_workflow(&server.store, lab_id);
    let a = device_node(workflow_id, "A", "device-1");
    let b = script_node(workflow_id, "B");
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
    server.store.insert_edge(WorkflowEdge {
        source_node: a.id,
        target_node: b.id,
        source_handle: source.id,
        target_handle: target.id,
    });
    server.store.insert_handle(source);
    server.store.insert_handle(target);
    let (a_id, b_id) = (a.id, b.id);
    server.store.insert_node(a);
    server.store.insert_node(b);

    let mut edge = FakeEdge::connect(&server, "ak", "sk", "edge-1").await?;
    edge.send_ready().await?;
    wait_online(&server, lab_id).await?;

    let task_id =
        server.services.dispatcher.start_workflow(lab_id, workflow_id, "alice").await?;
    let mut status_rx = server.bus.subscribe_raw(&channels::job_status(task_id));

    // Drive A through the device-action protocol.
    let query = edge.recv(TIMEOUT).await?;
    assert_eq!(query.action, "query_action_state");
    assert_eq!(query.data["device_id"], "device-1");
    edge.report_query_free(&query.data).await?;

    let start = edge.recv(TIMEOUT).await?;
    assert_eq!(start.action, "job_start");
    assert!(start.data["server_info"]["send_timestamp"].as_f64().unwrap_or_default() > 0.0);
    edge.report_job_done(&start.data, "success", json!({"x": 41})).await?;

    wait_until("terminal task", || {
        server
            .store
            .task(task_id)
            .map(|t| t.status == RunStatus::Success)
            .unwrap_or(false)
    })
    .await?;

    // The script saw the rewritten parameter.
    let jobs = server.store.jobs_for_task(task_id);
    let b_job = jobs
        .iter()
        .find(|j| j.node_id == b_id)
        .ok_or_else(|| anyhow::anyhow!("script job missing"))?;
    assert_eq!(b_job.return_info.return_value, json!({"x": 41}));

    // Exactly two status events, upstream first.
    let first: Value = serde_json::from_str(&status_rx.recv().await?)?;
    let second: Value = serde_json::from_str(&status_rx.recv().await?)?;
    assert_eq!(first["data"]["node_id"], json!(a_id));
    assert_eq!(first["data"]["status"], "success");
    assert_eq!(second["data"]["node_id"], json!(b_id));
    assert_eq!(second["data"]["status"], "success");
    assert!(status_rx.try_recv().is_err(), "no extra status events");
    Ok(())
}

#[tokio::test]
async fn cyclic_workflow_is_rejected_before_dispatch() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let lab_id = server.add_lab("ak", "sk");

    let workflow_id = seed_workflow(&server.store, lab_id);
    let a = device_node(workflow_id, "A", "device-1");
    let b = device_node(workflow_id, "B", "device-1");
    server.store.insert_edge(WorkflowEdge {
        source_node: a.id,
        target_node: b.id,
        source_handle: Uuid::new_v4(),
        target_handle: Uuid::new_v4(),
    });
    server.store.insert_edge(WorkflowEdge {
        source_node: b.id,
        target_node: a.id,
        source_handle: Uuid::new_v4(),
        target_handle: Uuid::new_v4(),
    });
    server.store.insert_node(a);
    server.store.insert_node(b);

    let mut edge = FakeEdge::connect(&server, "ak", "sk", "edge-1").await?;
    edge.send_ready().await?;
    wait_online(&server, lab_id).await?;

    let task_id =
        server.services.dispatcher.start_workflow(lab_id, workflow_id, "alice").await?;

    wait_until("rejected task", || {
        server
            .store
            .task(task_id)
            .map(|t| t.status == RunStatus::Failed)
            .unwrap_or(false)
    })
    .await?;
    assert!(server.store.jobs_for_task(task_id).is_empty());

    // Nothing was sent to the edge.
    assert!(edge.recv(Duration::from_millis(500)).await.is_err());
    Ok(())
}

#[tokio::test]
async fn stop_mid_wave_cancels_without_late_successes() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let lab_id = server.add_lab("ak", "sk");

    // Three independent device nodes in one wave.
    let workflow_id = seed_workflow(&server.store, lab_id);
    for name in ["A", "B", "C"] {
        server.store.insert_node(device_node(workflow_id, name, "device-1"));
    }

    let mut edge = FakeEdge::connect(&server, "ak", "sk", "edge-1").await?;
    edge.send_ready().await?;
    wait_online(&server, lab_id).await?;

    let task_id =
        server.services.dispatcher.start_workflow(lab_id, workflow_id, "alice").await?;
    let mut status_rx = server.bus.subscribe_raw(&channels::job_status(task_id));

    // Answer queries as they come; report success for the first dispatch
    // only, then stop the task once its success event is out.
    let mut cancel_frames = 0usize;
    let mut reported = false;
    let mut stopped = false;
    loop {
        let frame = match edge.recv(Duration::from_secs(3)).await {
            Ok(frame) => frame,
            Err(_) if stopped => break,
            Err(e) => return Err(e),
        };
        match frame.action.as_str() {
            "query_action_state" => edge.report_query_free(&frame.data).await?,
            "job_start" if !reported => {
                reported = true;
                edge.report_job_done(&frame.data, "success", json!({"ok": true})).await?;

                // First success observed by a subscriber, then stop.
                let event: Value = serde_json::from_str(&status_rx.recv().await?)?;
                assert_eq!(event["data"]["status"], "success");
                server.services.dispatcher.stop_job(task_id, "alice").await?;
                stopped = true;
            }
            "job_start" => {}
            "cancel_task" => {
                assert_eq!(frame.data["task_id"], json!(task_id));
                cancel_frames += 1;
            }
            other => anyhow::bail!("unexpected frame {other}"),
        }
    }
    assert_eq!(cancel_frames, 1, "exactly one cancel_task per stop");

    wait_until("canceled task", || {
        server
            .store
            .task(task_id)
            .map(|t| t.status == RunStatus::Canceled)
            .unwrap_or(false)
    })
    .await?;

    // No success events after the stop was observed.
    while let Ok(payload) = status_rx.try_recv() {
        let event: Value = serde_json::from_str(&payload)?;
        assert_ne!(event["data"]["status"], "success");
    }
    Ok(())
}

#[tokio::test]
async fn second_edge_for_the_same_lab_is_refused() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let lab_id = server.add_lab("ak", "sk");

    let mut first = FakeEdge::connect(&server, "ak", "sk", "edge-1").await?;
    first.send_ready().await?;
    wait_online(&server, lab_id).await?;

    let mut second = FakeEdge::connect(&server, "ak", "sk", "edge-2").await?;
    let refusal = second.recv(TIMEOUT).await?;
    assert_eq!(refusal.action, "close");
    assert_eq!(refusal.data, json!("lab-already-connected"));

    // The first edge keeps serving.
    first.send("ping", json!({"seq": 1})).await?;
    assert_eq!(first.recv(TIMEOUT).await?.action, "pong");
    Ok(())
}

#[tokio::test]
async fn notebook_runs_each_group_with_its_overrides() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let lab_id = server.add_lab("ak", "sk");

    let workflow_id = seed_workflow(&server.store, lab_id);
    let node = device_node(workflow_id, "dose", "pump-1");
    let node_id = node.id;
    server.store.insert_node(node);

    let notebook_id = Uuid::new_v4();
    server.store.insert_notebook(Notebook {
        id: notebook_id,
        workflow_id,
        lab_id,
        user_id: "alice".to_owned(),
        status: NotebookStatus::Init,
        started_at_ms: None,
        finished_at_ms: None,
    });
    let mut group_ids = Vec::new();
    for (seq, volume) in [10, 20].into_iter().enumerate() {
        let group_id = Uuid::new_v4();
        server.store.insert_group(NotebookGroup {
            id: group_id,
            notebook_id,
            seq: seq as u64,
            status: NotebookStatus::Init,
            sample_material: Default::default(),
            started_at_ms: None,
            finished_at_ms: None,
        });
        server.store.insert_override(NotebookOverride {
            group_id,
            node_id,
            param: json!({"volume": volume}),
        });
        group_ids.push(group_id);
    }

    let mut edge = FakeEdge::connect(&server, "ak", "sk", "edge-1").await?;
    edge.send_ready().await?;
    wait_online(&server, lab_id).await?;

    server.services.dispatcher.start_notebook(lab_id, notebook_id, "alice").await?;

    // Each group dispatches one device action with its own override.
    let mut volumes = Vec::new();
    while volumes.len() < 2 {
        let frame = edge.recv(TIMEOUT).await?;
        match frame.action.as_str() {
            "query_action_state" => edge.report_query_free(&frame.data).await?,
            "job_start" => {
                volumes.push(frame.data["action_args"]["volume"].clone());
                edge.report_job_done(&frame.data, "success", json!({"done": true})).await?;
            }
            other => anyhow::bail!("unexpected frame {other}"),
        }
    }
    assert_eq!(volumes, vec![json!(10), json!(20)]);

    wait_until("notebook success", || {
        server
            .store
            .notebook(notebook_id)
            .map(|n| n.status == NotebookStatus::Success)
            .unwrap_or(false)
    })
    .await?;

    let groups = server.store.notebook_groups(notebook_id)?;
    assert!(groups.iter().all(|g| g.status == NotebookStatus::Success));
    assert_eq!(server.store.tasks().len(), 2, "one task per group");
    Ok(())
}

#[tokio::test]
async fn one_shot_action_result_is_pollable() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let lab_id = server.add_lab("ak", "sk");

    let mut edge = FakeEdge::connect(&server, "ak", "sk", "edge-1").await?;
    edge.send_ready().await?;
    wait_online(&server, lab_id).await?;

    let task_id = server
        .services
        .dispatcher
        .start_action(lab_id, "sensor-1", "measure", "sync", json!({"cycles": 2}))
        .await?;

    let query = edge.recv(TIMEOUT).await?;
    assert_eq!(query.action, "query_action_state");
    edge.report_query_free(&query.data).await?;

    let start = edge.recv(TIMEOUT).await?;
    assert_eq!(start.action, "job_start");
    assert_eq!(start.data["device_id"], "sensor-1");
    assert_eq!(start.data["action_args"], json!({"cycles": 2}));
    edge.report_job_done(&start.data, "success", json!({"reading": 0.7})).await?;

    let result = server.services.dispatcher.poll_action_result(task_id).await?;
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.return_info.return_value, json!({"reading": 0.7}));
    Ok(())
}
