//! Query and notification handlers.

mod common;

use std::time::Duration;

use common::{wait_for, Harness, FILE_PORT, HOST};
use dea_messages::{
    subjects, DropletStatus, FindDropletReply, Heartbeat, HelloMessage, InstanceState, RouterRegistration,
    StatusReply,
};
use rstest::rstest;
use serde_json::json;

const REPLY: &str = "_INBOX.test";

fn payload(value: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&value).unwrap()
}

#[tokio::test]
async fn test_find_droplet_replies_per_matching_instance() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let first = h.start_running(9, 0).await;
    let second = h.start_running(9, 1).await;
    h.start_running(10, 0).await;

    h.agent.handle_find_droplet(REPLY, &payload(json!({ "droplet": 9 })));
    let replies: Vec<FindDropletReply> = h.publisher.decoded(REPLY).unwrap();
    assert_eq!(replies.len(), 2);
    for reply in &replies {
        assert_eq!(reply.dea, h.agent.uuid());
        assert_eq!(reply.droplet, 9);
        assert_eq!(reply.state, InstanceState::Running);
        assert_eq!(reply.file_uri, format!("http://{HOST}:{FILE_PORT}/droplets/"));
        assert_eq!(reply.credentials.len(), 2);
        assert!(reply.stats.is_none());
    }
    let mut ids: Vec<_> = replies.iter().map(|r| r.instance).collect();
    ids.sort();
    let mut expected = vec![first.id(), second.id()];
    expected.sort();
    assert_eq!(ids, expected);
}

#[rstest]
#[case::by_index(json!({ "droplet": 9, "indices": [1] }), 1)]
#[case::by_state(json!({ "droplet": 9, "states": ["RUNNING"] }), 2)]
#[case::no_state_match(json!({ "droplet": 9, "states": ["CRASHED"] }), 0)]
#[case::by_version(json!({ "droplet": 9, "version": "v1" }), 2)]
#[case::other_version(json!({ "droplet": 9, "version": "v2" }), 0)]
#[case::unknown_droplet(json!({ "droplet": 77 }), 0)]
#[tokio::test]
async fn test_find_droplet_filters(#[case] request: serde_json::Value, #[case] expected: usize) {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    h.start_running(9, 0).await;
    h.start_running(9, 1).await;

    h.agent.handle_find_droplet(REPLY, &payload(request));
    assert_eq!(h.publisher.count(REPLY), expected);
}

#[tokio::test]
async fn test_find_droplet_by_instance_id_with_stats() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    h.start_running(9, 0).await;
    let target = h.start_running(9, 1).await;

    h.agent.handle_find_droplet(
        REPLY,
        &payload(json!({
            "droplet": 9,
            "instances": [target.id().to_string()],
            "include_stats": true,
        })),
    );

    let replies: Vec<FindDropletReply> = h.publisher.decoded(REPLY).unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].instance, target.id());
    assert_eq!(replies[0].index, 1);
    assert_eq!(replies[0].staged, target.snapshot().staged);

    let stats = replies[0].stats.as_ref().unwrap();
    assert_eq!(stats.name, "app9");
    assert_eq!(stats.host, HOST);
    assert_eq!(stats.port, target.snapshot().port);
    assert_eq!(stats.mem_quota, 64 * 1024 * 1024);
    assert!(stats.cores.is_some_and(|cores| cores >= 1));
}

#[tokio::test]
async fn test_malformed_request_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    h.start_running(9, 0).await;

    h.agent.handle_find_droplet(REPLY, b"not json");
    h.agent.handle_discover(REPLY, b"{\"runtime\": 5}");
    h.agent.handle_update(b"[]");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.publisher.count(REPLY), 0);
}

#[tokio::test]
async fn test_status_reports_counters() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    h.start_running(9, 0).await;

    h.agent.handle_status(REPLY);
    let replies: Vec<StatusReply> = h.publisher.decoded(REPLY).unwrap();
    assert_eq!(replies.len(), 1);
    let status = &replies[0];
    assert_eq!(status.id, h.agent.uuid());
    assert_eq!(status.ip, HOST);
    assert_eq!(status.port, FILE_PORT);
    assert_eq!(status.max_memory, 512);
    assert_eq!(status.reserved_memory, 64);
    assert_eq!(status.num_clients, 1);
    assert!(status.state.is_none());

    h.agent.evacuate();
    assert_eq!(h.agent.status().state.as_deref(), Some("SHUTTING_DOWN"));
}

#[tokio::test]
async fn test_droplet_status_only_reports_running() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    h.start_running(9, 0).await;
    let crashed = h.start_running(10, 0).await;
    assert!(h.launcher.exit(&crashed.id(), Some(1)));
    assert!(wait_for(|| crashed.state() == InstanceState::Crashed).await);

    h.agent.handle_droplet_status(REPLY);
    let replies: Vec<DropletStatus> = h.publisher.decoded(REPLY).unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].name, "app9");
    assert_eq!(replies[0].uris, vec!["app9.example.com".to_string()]);
    assert!(replies[0].cores.is_none());
}

#[tokio::test]
async fn test_discover_answers_with_hello() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());

    h.agent.handle_discover(
        REPLY,
        &payload(json!({ "droplet": 9, "runtime": "ruby18", "limits": { "mem": 64 } })),
    );
    assert!(wait_for(|| h.publisher.count(REPLY) == 1).await);

    let hello: Vec<HelloMessage> = h.publisher.decoded(REPLY).unwrap();
    assert_eq!(hello[0], h.agent.hello());
    assert_eq!(hello[0].ip, HOST);
    assert_eq!(hello[0].port, FILE_PORT);
}

#[rstest]
#[case::unsupported_runtime(json!({ "droplet": 9, "runtime": "cobol", "limits": { "mem": 64 } }))]
#[case::too_much_memory(json!({ "droplet": 9, "runtime": "ruby18", "limits": { "mem": 1024 } }))]
#[tokio::test]
async fn test_discover_stays_silent(#[case] request: serde_json::Value) {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());

    h.agent.handle_discover(REPLY, &payload(request));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.publisher.count(REPLY), 0);
}

#[tokio::test]
async fn test_discover_silent_while_shutting_down() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    h.agent.evacuate();

    h.agent.handle_discover(
        REPLY,
        &payload(json!({ "droplet": 9, "runtime": "ruby18", "limits": { "mem": 64 } })),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.publisher.count(REPLY), 0);
}

#[tokio::test]
async fn test_taint_delay_grows_with_load() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    assert_eq!(h.agent.taint_delay(9), Duration::from_millis(1));

    h.start_running(9, 0).await;
    h.start_running(9, 1).await;

    // Two instances, 128 of 512 MB reserved.
    assert_eq!(h.agent.taint_delay(9), Duration::from_millis(45));
    assert_eq!(h.agent.taint_delay(10), Duration::from_millis(25));
}

#[tokio::test]
async fn test_heartbeat_lists_every_instance() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    h.agent.send_heartbeat();
    assert_eq!(h.publisher.count(subjects::DEA_HEARTBEAT), 0);

    let first = h.start_running(9, 0).await;
    h.start_running(9, 1).await;
    h.publisher.clear();

    h.agent.send_heartbeat();
    let heartbeats: Vec<Heartbeat> = h.publisher.decoded(subjects::DEA_HEARTBEAT).unwrap();
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].droplets.len(), 2);
    let beat = heartbeats[0]
        .droplets
        .iter()
        .find(|beat| beat.instance == first.id())
        .unwrap();
    assert_eq!(beat.droplet, 9);
    assert_eq!(beat.version, "v1");
    assert_eq!(beat.state, InstanceState::Running);
    assert_eq!(beat.state_timestamp, first.snapshot().state_timestamp);
}

#[tokio::test]
async fn test_router_start_reregisters_running_instances() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let running = h.start_running(9, 0).await;
    h.publisher.clear();

    h.agent.handle_router_start();

    let registrations: Vec<RouterRegistration> = h.publisher.decoded(subjects::ROUTER_REGISTER).unwrap();
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].dea, h.agent.uuid());
    assert_eq!(registrations[0].host, HOST);
    assert_eq!(registrations[0].port, running.snapshot().port);
    assert_eq!(registrations[0].uris, vec!["app9.example.com".to_string()]);
    assert_eq!(registrations[0].tags.framework, "sinatra");
    assert_eq!(registrations[0].tags.runtime, "ruby18");
}
