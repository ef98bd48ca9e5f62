/*
 * Copyright (C) 2024 The Edgetask Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use edgetask::edgetask::config::TaskManagerConfig;
use edgetask::edgetask::fsm::{Action, TaskState, EVENT_CHECK, EVENT_INIT};
use edgetask::edgetask::k8s::job::{JobStatus, CONFIG_UPDATE_JOBS, NODE_UPGRADE_JOBS};
use edgetask::edgetask::k8s::store::{InMemoryStore, ObjectStore};
use edgetask::edgetask::taskmanager::{RunningTaskManager, TaskManager};
use edgetask::edgetask::test_support::{
    config_update_job, edge_node, job_status, send_report, stage_event, succeed_every_stage,
    upgrade_job, wait_for, AgentCommand, AgentReply, FakeEdgeAgent,
};

const EDGE_KUBELET: &str = "v1.26.3-kubeedge-v1.17.0";

struct Cluster {
    store: Arc<InMemoryStore>,
    running: RunningTaskManager,
    shutdown: CancellationToken,
}

impl Cluster {
    fn with_nodes(names: &[&str]) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::default());
        for name in names {
            store.put_node(edge_node(name, EDGE_KUBELET));
        }
        store
    }

    async fn boot(store: Arc<InMemoryStore>) -> Self {
        let shutdown = CancellationToken::new();
        let manager = TaskManager::new(TaskManagerConfig::default(), store.clone(), store.clone());
        let running = manager
            .start(shutdown.clone())
            .await
            .expect("task manager starts");
        Self {
            store,
            running,
            shutdown,
        }
    }

    async fn status(&self, kind: &str, name: &str) -> Option<JobStatus> {
        job_status(self.store.as_ref(), kind, name).await
    }

    async fn wait_for_state(&self, kind: &str, name: &str, state: TaskState) -> bool {
        wait_for(Duration::from_secs(30), || async move {
            self.status(kind, name)
                .await
                .map(|status| status.state == Some(state))
                .unwrap_or(false)
        })
        .await
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.running.wait().await;
    }
}

fn states(commands: &[AgentCommand]) -> Vec<String> {
    commands.iter().map(|command| command.state.clone()).collect()
}

/// Records every object the store publishes for `kind`.
fn record_watch(store: &InMemoryStore, kind: &str) -> Arc<Mutex<Vec<Value>>> {
    let mut events = store.watch(kind).expect("watch");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    tokio::spawn(async move {
        while let Some(Ok(event)) = events.next().await {
            sink.lock().unwrap().push(event.object);
        }
    });
    seen
}

/// Counts job-level writes that land the job in `Failed`.
fn job_failures(objects: &[Value]) -> usize {
    let mut previous: Option<Value> = None;
    let mut count = 0;
    for object in objects {
        let status = &object["status"];
        let job_level = json!([
            status["state"],
            status["event"],
            status["action"],
            status["reason"],
            status["time"]
        ]);
        if status["state"] == "Failed" && previous.as_ref() != Some(&job_level) {
            count += 1;
        }
        previous = Some(job_level);
    }
    count
}

#[tokio::test]
async fn config_update_runs_every_stage_to_success() {
    let store = Cluster::with_nodes(&["edge-1", "edge-2"]);
    let mut job = config_update_job("cfg-happy", &["edge-1", "edge-2"], &[("maxPods", "150")]);
    job["spec"]["concurrency"] = json!(2);
    store.create(CONFIG_UPDATE_JOBS, job).expect("create job");

    let cluster = Cluster::boot(store).await;
    let agent = FakeEdgeAgent::spawn(
        cluster.running.bus.clone(),
        succeed_every_stage(),
        cluster.shutdown.clone(),
    );

    assert!(
        cluster
            .wait_for_state(CONFIG_UPDATE_JOBS, "cfg-happy", TaskState::Successful)
            .await,
        "job should succeed"
    );
    let status = cluster
        .status(CONFIG_UPDATE_JOBS, "cfg-happy")
        .await
        .expect("status");
    assert_eq!(status.node_status.len(), 2);
    assert!(status
        .node_status
        .iter()
        .all(|entry| entry.state == Some(TaskState::Successful)));
    for node in ["edge-1", "edge-2"] {
        assert_eq!(
            states(&agent.commands_for(node)),
            vec!["Init", "Checking", "BackingUp", "Updating"]
        );
    }
    let checking = agent
        .commands_for("edge-1")
        .into_iter()
        .find(|command| command.state == "Checking")
        .expect("checking command");
    assert_eq!(checking.body["Item"], json!({"CheckItem": []}));
    assert_eq!(checking.route.operation, "configupdate");

    let machine = &cluster.running.machine;
    assert!(
        wait_for(Duration::from_secs(5), || async move {
            !machine.is_running("configupdate", "cfg-happy")
        })
        .await
    );
    cluster.stop().await;
}

#[tokio::test]
async fn single_node_upgrade_succeeds() {
    let store = Cluster::with_nodes(&["edge-1"]);
    let mut job = upgrade_job("upg-happy", &["edge-1"], "v1.18.0");
    job["spec"]["timeoutSeconds"] = json!(60);
    job["spec"]["failureTolerate"] = json!("0");
    store.create(NODE_UPGRADE_JOBS, job).expect("create job");

    let cluster = Cluster::boot(store).await;
    let agent = FakeEdgeAgent::spawn(
        cluster.running.bus.clone(),
        succeed_every_stage(),
        cluster.shutdown.clone(),
    );

    assert!(
        cluster
            .wait_for_state(NODE_UPGRADE_JOBS, "upg-happy", TaskState::Successful)
            .await,
        "upgrade should succeed"
    );
    assert_eq!(
        states(&agent.commands_for("edge-1")),
        vec!["Init", "Checking", "BackingUp", "Upgrading"]
    );
    let status = cluster
        .status(NODE_UPGRADE_JOBS, "upg-happy")
        .await
        .expect("status");
    assert_eq!(status.node_status[0].state, Some(TaskState::Successful));
    assert_eq!(status.event, "Upgrade");
    cluster.stop().await;
}

#[tokio::test]
async fn concurrency_bounds_dispatched_nodes() {
    let nodes = ["edge-1", "edge-2", "edge-3", "edge-4"];
    let store = Cluster::with_nodes(&nodes);
    let mut job = upgrade_job("upg-bounded", &nodes, "v1.18.0");
    job["spec"]["concurrency"] = json!(2);
    store.create(NODE_UPGRADE_JOBS, job).expect("create job");

    let cluster = Cluster::boot(store).await;
    let agent = FakeEdgeAgent::spawn(
        cluster.running.bus.clone(),
        Arc::new(|_: &AgentCommand| AgentReply::Ignore),
        cluster.shutdown.clone(),
    );
    let agent_ref = &agent;

    assert!(
        wait_for(Duration::from_secs(5), || async move {
            agent_ref.commands().len() == 2
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    let first = agent.commands();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].node, "edge-1");
    assert_eq!(first[1].node, "edge-2");
    assert!(first.iter().all(|command| command.state == "Init"));
    assert!(first
        .iter()
        .all(|command| command.body["Item"]["Image"] == "kubeedge/installation-package:v1.18.0"));

    send_report(
        &cluster.running.bus,
        &first[0],
        &AgentReply::respond(EVENT_INIT, Action::Success),
    )
    .await;

    assert!(
        wait_for(Duration::from_secs(5), || async move {
            agent_ref.commands().len() == 3
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    let commands = agent.commands();
    assert_eq!(commands.len(), 3);
    assert_eq!(commands[2].node, "edge-3");
    assert!(agent.commands_for("edge-4").is_empty());

    let status = cluster
        .status(NODE_UPGRADE_JOBS, "upg-bounded")
        .await
        .expect("status");
    assert_eq!(status.node_status[0].state, Some(TaskState::Checking));
    assert_eq!(status.state, None);
    cluster.stop().await;
}

#[tokio::test]
async fn exceeding_failure_tolerance_fails_the_job() {
    let nodes = ["edge-1", "edge-2", "edge-3", "edge-4"];
    let store = Cluster::with_nodes(&nodes);
    let mut job = config_update_job("cfg-tolerance", &nodes, &[("maxPods", "150")]);
    job["spec"]["failureTolerate"] = json!("0.5");
    store.create(CONFIG_UPDATE_JOBS, job).expect("create job");

    let cluster = Cluster::boot(store).await;
    let agent = FakeEdgeAgent::spawn(
        cluster.running.bus.clone(),
        Arc::new(|command: &AgentCommand| match stage_event(&command.state) {
            Some(event) => AgentReply::respond(event, Action::Failure),
            None => AgentReply::Ignore,
        }),
        cluster.shutdown.clone(),
    );

    assert!(
        cluster
            .wait_for_state(CONFIG_UPDATE_JOBS, "cfg-tolerance", TaskState::Failed)
            .await,
        "job should fail"
    );
    let status = cluster
        .status(CONFIG_UPDATE_JOBS, "cfg-tolerance")
        .await
        .expect("status");
    assert_eq!(status.event, EVENT_INIT);
    assert_eq!(status.action, Some(Action::Failure));
    assert!(status.reason.contains("2/4"), "reason was {}", status.reason);
    assert_eq!(status.node_status[0].state, Some(TaskState::Failed));
    assert_eq!(status.node_status[1].state, Some(TaskState::Failed));
    assert_eq!(status.node_status[2].state, None);
    assert!(agent.commands_for("edge-3").is_empty());
    assert!(agent.commands_for("edge-4").is_empty());
    cluster.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stage_timeout_rolls_the_node_back() {
    let store = Cluster::with_nodes(&["edge-1"]);
    let mut job = config_update_job("cfg-timeout", &["edge-1"], &[("maxPods", "150")]);
    job["spec"]["timeoutSeconds"] = json!(5);
    store.create(CONFIG_UPDATE_JOBS, job).expect("create job");

    let cluster = Cluster::boot(store).await;
    let agent = FakeEdgeAgent::spawn(
        cluster.running.bus.clone(),
        Arc::new(|command: &AgentCommand| match command.state.as_str() {
            "Updating" => AgentReply::Ignore,
            state => match stage_event(state) {
                Some(event) => AgentReply::respond(event, Action::Success),
                None => AgentReply::Ignore,
            },
        }),
        cluster.shutdown.clone(),
    );

    assert!(
        cluster
            .wait_for_state(CONFIG_UPDATE_JOBS, "cfg-timeout", TaskState::Failed)
            .await,
        "job should fail after rollback"
    );
    assert_eq!(
        states(&agent.commands_for("edge-1")),
        vec!["Init", "Checking", "BackingUp", "Updating", "RollingBack"]
    );
    let status = cluster
        .status(CONFIG_UPDATE_JOBS, "cfg-timeout")
        .await
        .expect("status");
    let node = &status.node_status[0];
    assert_eq!(node.state, Some(TaskState::Failed));
    assert_eq!(node.event, "Rollback");
    cluster.stop().await;
}

#[tokio::test]
async fn reports_for_unknown_nodes_leave_the_job_untouched() {
    let store = Cluster::with_nodes(&["edge-1"]);
    store
        .create(
            CONFIG_UPDATE_JOBS,
            config_update_job("cfg-stray", &["edge-1"], &[("maxPods", "150")]),
        )
        .expect("create job");

    let cluster = Cluster::boot(store).await;
    let agent = FakeEdgeAgent::spawn(
        cluster.running.bus.clone(),
        Arc::new(|_: &AgentCommand| AgentReply::Ignore),
        cluster.shutdown.clone(),
    );
    let agent_ref = &agent;
    assert!(
        wait_for(Duration::from_secs(5), || async move {
            agent_ref.commands().len() == 1
        })
        .await
    );

    let mut stray = agent.commands()[0].clone();
    stray.node = "edge-9".to_string();
    stray.route.resource = "configupdate/cfg-stray/node/edge-9".to_string();
    send_report(
        &cluster.running.bus,
        &stray,
        &AgentReply::respond(EVENT_CHECK, Action::Success),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = cluster
        .status(CONFIG_UPDATE_JOBS, "cfg-stray")
        .await
        .expect("status");
    assert_eq!(status.node_status.len(), 1);
    assert_eq!(status.node_status[0].node_name, "edge-1");
    assert_eq!(status.node_status[0].state, None);
    assert!(cluster.running.machine.is_running("configupdate", "cfg-stray"));
    cluster.stop().await;
}

#[tokio::test]
async fn out_of_range_tolerance_still_fails_the_job() {
    let store = Cluster::with_nodes(&["edge-1"]);
    let mut job = config_update_job("cfg-loose", &["edge-1"], &[("maxPods", "150")]);
    job["spec"]["failureTolerate"] = json!("5");
    store.create(CONFIG_UPDATE_JOBS, job).expect("create job");

    let cluster = Cluster::boot(store).await;
    let agent = FakeEdgeAgent::spawn(
        cluster.running.bus.clone(),
        Arc::new(|command: &AgentCommand| match stage_event(&command.state) {
            Some(event) => AgentReply::respond(event, Action::Failure),
            None => AgentReply::Ignore,
        }),
        cluster.shutdown.clone(),
    );

    assert!(
        cluster
            .wait_for_state(CONFIG_UPDATE_JOBS, "cfg-loose", TaskState::Failed)
            .await,
        "job should fail"
    );
    let status = cluster
        .status(CONFIG_UPDATE_JOBS, "cfg-loose")
        .await
        .expect("status");
    assert_eq!(status.node_status[0].state, Some(TaskState::Failed));
    assert_eq!(states(&agent.commands_for("edge-1")), vec!["Init"]);

    let machine = &cluster.running.machine;
    assert!(
        wait_for(Duration::from_secs(5), || async move {
            !machine.is_running("configupdate", "cfg-loose")
        })
        .await
    );
    cluster.stop().await;
}

#[tokio::test]
async fn reports_after_tolerance_is_crossed_do_not_refail_the_job() {
    let nodes = ["edge-1", "edge-2", "edge-3", "edge-4"];
    let store = Cluster::with_nodes(&nodes);
    let mut job = config_update_job("cfg-drain", &nodes, &[("maxPods", "150")]);
    job["spec"]["concurrency"] = json!(2);
    job["spec"]["failureTolerate"] = json!("0.5");
    store.create(CONFIG_UPDATE_JOBS, job).expect("create job");
    let seen = record_watch(&store, CONFIG_UPDATE_JOBS);

    let cluster = Cluster::boot(store).await;
    let agent = FakeEdgeAgent::spawn(
        cluster.running.bus.clone(),
        Arc::new(|command: &AgentCommand| {
            if command.node == "edge-1" {
                AgentReply::respond(EVENT_INIT, Action::Failure)
            } else {
                AgentReply::Ignore
            }
        }),
        cluster.shutdown.clone(),
    );
    let agent_ref = &agent;

    // edge-1 fails at once, which frees a slot for edge-3.
    assert!(
        wait_for(Duration::from_secs(5), || async move {
            agent_ref.commands().len() == 3
        })
        .await
    );
    let edge_2 = agent.commands_for("edge-2")[0].clone();
    let edge_3 = agent.commands_for("edge-3")[0].clone();

    send_report(
        &cluster.running.bus,
        &edge_2,
        &AgentReply::respond(EVENT_INIT, Action::Failure),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Threshold crossed while edge-3 is still running: nothing new starts
    // and the job waits for edge-3.
    let status = cluster
        .status(CONFIG_UPDATE_JOBS, "cfg-drain")
        .await
        .expect("status");
    assert_eq!(status.node_status[1].state, Some(TaskState::Failed));
    assert_eq!(status.state, None);
    assert!(agent.commands_for("edge-4").is_empty());
    assert!(cluster.running.machine.is_running("configupdate", "cfg-drain"));

    send_report(
        &cluster.running.bus,
        &edge_3,
        &AgentReply::respond(EVENT_INIT, Action::Success),
    )
    .await;
    assert!(
        cluster
            .wait_for_state(CONFIG_UPDATE_JOBS, "cfg-drain", TaskState::Failed)
            .await,
        "job should fail once edge-3 drains"
    );
    let failed = cluster
        .status(CONFIG_UPDATE_JOBS, "cfg-drain")
        .await
        .expect("status");
    assert!(failed.reason.contains("2/4"), "reason was {}", failed.reason);
    assert_eq!(failed.event, EVENT_INIT);
    assert_eq!(failed.action, Some(Action::Failure));

    // A straggler report for edge-3 lands after the job has failed.
    send_report(
        &cluster.running.bus,
        &edge_3,
        &AgentReply::respond(EVENT_CHECK, Action::Success),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let after = cluster
        .status(CONFIG_UPDATE_JOBS, "cfg-drain")
        .await
        .expect("status");
    assert_eq!(after.state, failed.state);
    assert_eq!(after.event, failed.event);
    assert_eq!(after.reason, failed.reason);
    assert_eq!(after.time, failed.time);
    assert_eq!(after.node_status[3].state, None);
    assert!(agent.commands_for("edge-4").is_empty());
    assert_eq!(agent.commands().len(), 3);
    assert!(!cluster.running.machine.is_running("configupdate", "cfg-drain"));
    assert_eq!(job_failures(&seen.lock().unwrap()), 1);
    cluster.stop().await;
}

#[tokio::test(start_paused = true)]
async fn upgrade_timeout_rolls_back_and_fails_the_job() {
    let store = Cluster::with_nodes(&["edge-1"]);
    let mut job = upgrade_job("upg-timeout", &["edge-1"], "v1.18.0");
    job["spec"]["timeoutSeconds"] = json!(5);
    store.create(NODE_UPGRADE_JOBS, job).expect("create job");

    let cluster = Cluster::boot(store).await;
    let agent = FakeEdgeAgent::spawn(
        cluster.running.bus.clone(),
        Arc::new(|command: &AgentCommand| match command.state.as_str() {
            "Upgrading" => AgentReply::Ignore,
            state => match stage_event(state) {
                Some(event) => AgentReply::respond(event, Action::Success),
                None => AgentReply::Ignore,
            },
        }),
        cluster.shutdown.clone(),
    );

    assert!(
        cluster
            .wait_for_state(NODE_UPGRADE_JOBS, "upg-timeout", TaskState::Failed)
            .await,
        "upgrade should fail after rollback"
    );
    assert_eq!(
        states(&agent.commands_for("edge-1")),
        vec!["Init", "Checking", "BackingUp", "Upgrading", "RollingBack"]
    );
    let status = cluster
        .status(NODE_UPGRADE_JOBS, "upg-timeout")
        .await
        .expect("status");
    let node = &status.node_status[0];
    assert_eq!(node.state, Some(TaskState::Failed));
    assert_eq!(node.event, "Rollback");
    assert_eq!(node.action, Some(Action::Success));
    assert_eq!(status.event, "Rollback");
    assert_eq!(status.action, Some(Action::Failure));

    let machine = &cluster.running.machine;
    assert!(
        wait_for(Duration::from_secs(5), || async move {
            !machine.is_running("upgrade", "upg-timeout")
        })
        .await
    );
    cluster.stop().await;
}
