//! Instance lifecycle through the agent: start, crash, stop, update,
//! evacuation and shutdown.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{start_request, test_config, wait_for, Harness, HOST};
use dea_agent::launcher::{ExitWatch, Launcher, MockLauncher};
use dea_agent::probe::RetryPolicy;
use dea_agent::staging::{MockStager, StageRequest, Stager, StagingError};
use dea_agent::InstanceRecord;
use dea_messages::{
    subjects, DropletExited, ExitReason, Heartbeat, InstanceState, RouterRegistration,
};
use serde_json::json;
use tokio::sync::Notify;

#[tokio::test]
async fn test_start_reaches_running() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());

    let instance = h.start_running(7, 0).await;
    assert!(wait_for(|| h.publisher.count(subjects::ROUTER_REGISTER) == 1).await);

    let record = instance.snapshot();
    assert_ne!(record.port, 0);
    assert_eq!(record.dir, h.agent.config().apps_dir().join(&record.staged));

    let heartbeats: Vec<Heartbeat> = h.publisher.decoded(subjects::DEA_HEARTBEAT).unwrap();
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].droplets.len(), 1);
    assert_eq!(heartbeats[0].droplets[0].instance, instance.id());
    assert_eq!(heartbeats[0].droplets[0].state, InstanceState::Running);

    let registrations: Vec<RouterRegistration> =
        h.publisher.decoded(subjects::ROUTER_REGISTER).unwrap();
    assert_eq!(registrations[0].uris, vec!["app7.example.com".to_string()]);
    assert_eq!(registrations[0].host, HOST);
    assert_eq!(registrations[0].port, record.port);
    assert_eq!(registrations[0].dea, h.agent.uuid());
    assert_eq!(registrations[0].tags.framework, "sinatra");

    let counters = h.agent.ledger().counters();
    assert_eq!(counters.reserved_mem, 64);
    assert_eq!(counters.num_clients, 1);

    let env = h.launcher.environment(&instance.id()).unwrap();
    let value = |key: &str| env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
    assert_eq!(value("VCAP_APP_PORT"), Some(format!("'{}'", record.port)));
    assert_eq!(value("RACK_ENV").as_deref(), Some("\"production\""));
    assert_eq!(value("RUBYOPT").as_deref(), Some("-rubygems"));
    assert!(value("VCAP_DEBUG_PORT").is_none());
}

#[tokio::test]
async fn test_stage_request_carries_bits_source() {
    let dir = tempfile::tempdir().unwrap();
    let stager = Arc::new(MockStager::new());
    let h = Harness::with(test_config(dir.path()), stager.clone(), MockLauncher::listening());

    let instance = h.start_running(7, 0).await;

    let requests = stager.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].sha1, "9f2a4b1c");
    assert_eq!(requests[0].bits_uri, "http://cc.example.com/staged_droplets/7");
    assert_eq!(requests[0].bits_file, "/shared/droplets/7.tgz");
    assert_eq!(requests[0].target_dir, instance.snapshot().dir);
    assert_eq!(requests[0].runtime_executable.as_deref(), Some("/usr/bin/ruby"));
}

#[tokio::test]
async fn test_debug_mode_gets_debug_port() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());

    let mut payload = common::start_payload(3, 0, 64);
    payload["debug"] = json!("run");
    let instance = h
        .agent
        .on_start(&serde_json::to_vec(&payload).unwrap())
        .unwrap();
    assert!(wait_for(|| instance.state() == InstanceState::Running).await);

    let record = instance.snapshot();
    assert_eq!(record.debug_ip.as_deref(), Some(HOST));
    let debug_port = record.debug_port.unwrap();
    assert_ne!(debug_port, record.port);

    let env = h.launcher.environment(&instance.id()).unwrap();
    assert!(env.contains(&("VCAP_DEBUG_PORT".to_string(), format!("'{debug_port}'"))));
    assert!(env.contains(&("RUBY_DEBUG".to_string(), "1".to_string())));
}

#[tokio::test]
async fn test_rejected_start_requests_get_no_instance() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());

    let mut unsupported = common::start_payload(1, 0, 64);
    unsupported["runtime"] = json!("cobol");
    assert!(h.agent.on_start(&serde_json::to_vec(&unsupported).unwrap()).is_none());

    let mut no_bits = common::start_payload(1, 0, 64);
    no_bits["sha1"] = json!("");
    assert!(h.agent.on_start(&serde_json::to_vec(&no_bits).unwrap()).is_none());

    assert!(h.agent.on_start(&start_request(1, 0, 1024)).is_none());
    assert!(h.agent.on_start(b"not json").is_none());

    assert!(h.agent.droplets().is_empty());
    assert_eq!(h.agent.ledger().counters().reserved_mem, 0);
    assert!(h.publisher.messages().is_empty());
}

#[tokio::test]
async fn test_staging_failure_crashes_and_releases() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::with(
        test_config(dir.path()),
        Arc::new(MockStager::failing()),
        MockLauncher::listening(),
    );

    let instance = h.start(7, 0, 64);
    assert!(wait_for(|| instance.stop_processed()).await);

    assert_eq!(instance.state(), InstanceState::Crashed);
    assert!(h.launcher.launches().is_empty());
    assert_eq!(h.agent.ledger().counters().reserved_mem, 0);
    assert_eq!(h.agent.ledger().counters().num_clients, 0);

    // Crashed instances stay around for inspection and the reaper.
    assert_eq!(h.agent.droplets().instance_count(7), 1);

    let exited: Vec<DropletExited> = h.publisher.decoded(subjects::DROPLET_EXITED).unwrap();
    assert_eq!(exited.len(), 1);
    assert_eq!(exited[0].reason, Some(ExitReason::Crashed));
    assert!(exited[0].crash_timestamp.is_some());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let instance = h.start_running(7, 0).await;
    let instance_dir = instance.snapshot().dir;
    assert!(instance_dir.exists());

    let stop = serde_json::to_vec(&json!({ "droplet": 7 })).unwrap();
    tokio::join!(
        h.agent.handle_stop(&stop),
        h.agent.handle_stop(&stop),
        h.agent.stop_droplet(&instance),
    );
    h.agent.handle_stop(&stop).await;
    h.agent.stop_droplet(&instance).await;

    let exited: Vec<DropletExited> = h.publisher.decoded(subjects::DROPLET_EXITED).unwrap();
    assert_eq!(exited.len(), 1);
    assert_eq!(exited[0].reason, Some(ExitReason::Stopped));
    assert_eq!(exited[0].crash_timestamp, None);
    assert_eq!(h.publisher.count(subjects::ROUTER_UNREGISTER), 1);
    assert_eq!(h.launcher.stops(), vec![instance.id()]);

    assert_eq!(instance.state(), InstanceState::Stopped);
    assert_eq!(h.agent.ledger().counters().reserved_mem, 0);
    assert!(h.agent.droplets().is_empty());
    assert!(!instance_dir.exists());
}

#[tokio::test]
async fn test_stop_filter_selects_instances() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let first = h.start_running(7, 0).await;
    let second = h.start_running(7, 1).await;

    let stop = serde_json::to_vec(&json!({ "droplet": 7, "indices": [1] })).unwrap();
    h.agent.handle_stop(&stop).await;

    assert_eq!(first.state(), InstanceState::Running);
    assert_eq!(second.state(), InstanceState::Stopped);
    assert_eq!(h.agent.droplets().instance_count(7), 1);
    assert_eq!(h.agent.ledger().counters().reserved_mem, 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admission_respects_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    // Instances never come up and are never given up on during the test.
    config.probes.port = RetryPolicy::new(60_000, 10);
    let h = Harness::with(config, Arc::new(MockStager::new()), MockLauncher::new());

    let handles: Vec<_> = (0..20)
        .map(|index| {
            let agent = Arc::clone(&h.agent);
            tokio::spawn(async move { agent.on_start(&start_request(9, index, 64)).is_some() })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 8);
    let counters = h.agent.ledger().counters();
    assert_eq!(counters.reserved_mem, 512);
    assert_eq!(counters.num_clients, 8);
    assert_eq!(h.agent.droplets().instance_count(9), 8);
}

#[tokio::test]
async fn test_single_tenant_admits_one_client() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.multi_tenant = false;
    let h = Harness::with(config, Arc::new(MockStager::new()), MockLauncher::listening());

    h.start(1, 0, 64);
    assert!(h.agent.on_start(&start_request(2, 0, 64)).is_none());
}

#[tokio::test]
async fn test_unexpected_exit_crashes_instance() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let instance = h.start_running(7, 0).await;

    assert!(h.launcher.exit(&instance.id(), Some(1)));
    assert!(wait_for(|| instance.stop_processed()).await);

    assert_eq!(instance.state(), InstanceState::Crashed);
    let exited: Vec<DropletExited> = h.publisher.decoded(subjects::DROPLET_EXITED).unwrap();
    assert_eq!(exited.len(), 1);
    assert_eq!(exited[0].reason, Some(ExitReason::Crashed));
    assert_eq!(h.publisher.count(subjects::ROUTER_UNREGISTER), 1);
    assert_eq!(h.agent.ledger().counters().reserved_mem, 0);
    assert!(instance.snapshot().dir.exists());

    // Stopping a crashed instance deletes it.
    let stop = serde_json::to_vec(&json!({ "droplet": 7, "states": ["CRASHED"] })).unwrap();
    h.agent.handle_stop(&stop).await;

    assert_eq!(instance.state(), InstanceState::Deleted);
    assert!(h.agent.droplets().is_empty());
    assert!(!instance.snapshot().dir.exists());
    assert_eq!(h.publisher.count(subjects::DROPLET_EXITED), 1);
    assert_eq!(h.publisher.count(subjects::ROUTER_UNREGISTER), 1);
}

#[tokio::test]
async fn test_gives_up_when_port_never_opens() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.probes.port = RetryPolicy::new(5, 3);
    let h = Harness::with(config, Arc::new(MockStager::new()), MockLauncher::new());

    let instance = h.start(7, 0, 64);
    assert!(wait_for(|| instance.stop_processed()).await);

    assert_eq!(instance.state(), InstanceState::Crashed);
    assert_eq!(h.launcher.stops(), vec![instance.id()]);
    assert_eq!(h.publisher.count(subjects::ROUTER_REGISTER), 0);
    assert_eq!(h.agent.ledger().counters().reserved_mem, 0);
}

/// Stages an app that reports readiness through a state file.
struct StateFileStager;

#[async_trait]
impl Stager for StateFileStager {
    async fn stage_app_bits(&self, request: &StageRequest) -> Result<(), StagingError> {
        let dir = &request.target_dir;
        tokio::fs::create_dir_all(dir.join("tmp")).await?;
        tokio::fs::write(dir.join("droplet.json"), r#"{"state_file": "tmp/state.json"}"#).await?;
        tokio::fs::write(dir.join("tmp/state.json"), r#"{"state": "RUNNING"}"#).await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_state_file_signals_readiness() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::with(test_config(dir.path()), Arc::new(StateFileStager), MockLauncher::new());

    let instance = h.start(7, 0, 64);
    assert!(wait_for(|| instance.state() == InstanceState::Running).await);
    assert_eq!(instance.snapshot().state_file.as_deref(), Some("tmp/state.json"));
}

#[tokio::test]
async fn test_pid_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::with(
        test_config(dir.path()),
        Arc::new(MockStager::new()),
        MockLauncher::listening().with_pid(4242),
    );

    let instance = h.start_running(7, 0).await;
    assert!(wait_for(|| instance.snapshot().pid == 4242).await);
}

#[tokio::test]
async fn test_update_publishes_route_deltas() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let instance = h.start_running(7, 0).await;
    assert!(wait_for(|| h.publisher.count(subjects::ROUTER_REGISTER) == 1).await);
    h.publisher.clear();

    let update = json!({ "droplet": 7, "uris": ["app7.example.com", "www.example.com"] });
    h.agent.handle_update(&serde_json::to_vec(&update).unwrap());
    let registered: Vec<RouterRegistration> =
        h.publisher.decoded(subjects::ROUTER_REGISTER).unwrap();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].uris, vec!["www.example.com".to_string()]);
    assert_eq!(h.publisher.count(subjects::ROUTER_UNREGISTER), 0);

    let update = json!({ "droplet": 7, "uris": ["www.example.com"] });
    h.agent.handle_update(&serde_json::to_vec(&update).unwrap());
    let unregistered: Vec<RouterRegistration> =
        h.publisher.decoded(subjects::ROUTER_UNREGISTER).unwrap();
    assert_eq!(unregistered.len(), 1);
    assert_eq!(unregistered[0].uris, vec!["app7.example.com".to_string()]);

    assert_eq!(instance.snapshot().uris, vec!["www.example.com".to_string()]);
}

#[tokio::test]
async fn test_evacuation_then_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let running = h.start_running(7, 0).await;
    let crashed = h.start_running(8, 0).await;
    h.launcher.exit(&crashed.id(), None);
    assert!(wait_for(|| crashed.stop_processed()).await);
    h.publisher.clear();

    assert_eq!(h.agent.evacuate(), 1);
    assert!(h.agent.is_shutting_down());
    let exited: Vec<DropletExited> = h.publisher.decoded(subjects::DROPLET_EXITED).unwrap();
    assert_eq!(exited.len(), 1);
    assert_eq!(exited[0].instance, running.id());
    assert_eq!(exited[0].reason, Some(ExitReason::DeaEvacuation));
    assert_eq!(h.publisher.count(subjects::ROUTER_UNREGISTER), 0);

    assert!(h.agent.on_start(&start_request(9, 0, 64)).is_none());

    h.agent.shutdown().await;
    assert_eq!(h.publisher.count(subjects::DROPLET_EXITED), 1);
    assert_eq!(h.publisher.count(subjects::ROUTER_UNREGISTER), 1);
    assert_eq!(running.state(), InstanceState::Stopped);
    assert_eq!(running.snapshot().exit_reason, Some(ExitReason::DeaEvacuation));
    assert!(h.agent.snapshots().path().exists());
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let first = h.start_running(7, 0).await;
    let second = h.start_running(8, 0).await;

    h.agent.shutdown().await;

    let exited: Vec<DropletExited> = h.publisher.decoded(subjects::DROPLET_EXITED).unwrap();
    assert_eq!(exited.len(), 2);
    assert!(exited.iter().all(|e| e.reason == Some(ExitReason::DeaShutdown)));
    assert_eq!(first.state(), InstanceState::Stopped);
    assert_eq!(second.state(), InstanceState::Stopped);
    assert!(h.agent.droplets().is_empty());
    assert_eq!(h.agent.ledger().counters().num_clients, 0);
}

/// Holds a stage until released, writing files before and after the wait.
#[derive(Default)]
struct GatedStager {
    gate: Notify,
    entered: AtomicBool,
    finished: AtomicBool,
}

#[async_trait]
impl Stager for GatedStager {
    async fn stage_app_bits(&self, request: &StageRequest) -> Result<(), StagingError> {
        let dir = &request.target_dir;
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join("startup"), "#!/bin/sh\n").await?;
        self.entered.store(true, Ordering::SeqCst);

        self.gate.notified().await;
        tokio::fs::create_dir_all(dir.join("app")).await?;
        tokio::fs::write(dir.join("app/app.rb"), "puts 'hello'\n").await?;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_stop_while_staging_removes_dir() {
    let dir = tempfile::tempdir().unwrap();
    let stager = Arc::new(GatedStager::default());
    let h = Harness::with(test_config(dir.path()), stager.clone(), MockLauncher::listening());

    let instance = h.start(5, 0, 64);
    assert!(wait_for(|| stager.entered.load(Ordering::SeqCst)).await);
    let instance_dir = instance.snapshot().dir;

    h.agent.handle_stop(&serde_json::to_vec(&json!({ "droplet": 5 })).unwrap()).await;
    assert_eq!(instance.state(), InstanceState::Stopped);
    assert!(h.agent.droplets().is_empty());

    stager.gate.notify_one();
    assert!(wait_for(|| stager.finished.load(Ordering::SeqCst) && !instance_dir.exists()).await);

    assert!(h.launcher.launches().is_empty());
    assert_eq!(h.launcher.stops(), vec![instance.id()]);
    assert_eq!(h.agent.ledger().counters().reserved_mem, 0);
    assert_eq!(h.publisher.count(subjects::DROPLET_EXITED), 1);
}

#[tokio::test]
async fn test_stop_while_staging_keeps_dir_when_cleanup_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.disable_dir_cleanup = true;
    let stager = Arc::new(GatedStager::default());
    let h = Harness::with(config, stager.clone(), MockLauncher::listening());

    let instance = h.start(5, 0, 64);
    assert!(wait_for(|| stager.entered.load(Ordering::SeqCst)).await);
    h.agent.handle_stop(&serde_json::to_vec(&json!({ "droplet": 5 })).unwrap()).await;
    assert_eq!(instance.state(), InstanceState::Stopped);

    stager.gate.notify_one();
    assert!(wait_for(|| stager.finished.load(Ordering::SeqCst)).await);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(instance.snapshot().dir.join("app/app.rb").is_file());
    assert!(h.launcher.launches().is_empty());
}

/// Holds every launch until released, then delegates.
struct GatedLauncher {
    inner: Arc<MockLauncher>,
    gate: Arc<Notify>,
    entered: Arc<AtomicBool>,
}

#[async_trait]
impl Launcher for GatedLauncher {
    async fn launch(&self, instance: &InstanceRecord, env: &[(String, String)]) -> anyhow::Result<ExitWatch> {
        self.entered.store(true, Ordering::SeqCst);
        self.gate.notified().await;
        self.inner.launch(instance, env).await
    }

    async fn stop(&self, instance: &InstanceRecord) -> anyhow::Result<()> {
        self.inner.stop(instance).await
    }
}

#[tokio::test]
async fn test_stop_while_launching_kills_process() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Notify::new());
    let entered = Arc::new(AtomicBool::new(false));
    let h = Harness::wrapped(
        test_config(dir.path()),
        Arc::new(MockStager::new()),
        MockLauncher::listening().with_pid(4242),
        |inner| {
            Arc::new(GatedLauncher {
                inner,
                gate: gate.clone(),
                entered: entered.clone(),
            }) as Arc<dyn Launcher>
        },
        |processes| processes as Arc<dyn dea_agent::monitor::ProcessMonitor>,
    );
    h.agent.recover().unwrap();

    let instance = h.start(5, 0, 64);
    assert!(wait_for(|| entered.load(Ordering::SeqCst)).await);
    let instance_dir = instance.snapshot().dir;

    h.agent.handle_stop(&serde_json::to_vec(&json!({ "droplet": 5 })).unwrap()).await;
    assert_eq!(h.launcher.stops(), vec![instance.id()]);

    // The launch completes after the stop; its process is killed.
    gate.notify_one();
    assert!(wait_for(|| h.launcher.stops().len() == 2 && !instance_dir.exists()).await);
    assert_eq!(h.launcher.launches(), vec![instance.id()]);
    assert_eq!(instance.state(), InstanceState::Stopped);
    assert_eq!(h.publisher.count(subjects::ROUTER_REGISTER), 0);
    assert_eq!(h.agent.ledger().counters().reserved_mem, 0);
}
