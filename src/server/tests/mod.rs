//! End-to-end tests: real nodes on real sockets, driven over HTTP.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use serial_test::serial;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use timesync::unix_now;

use crate::client::FailoverClient;
use crate::cluster;
use crate::node::{Node, NodeConfig, ReplicationMode};
use crate::server;

struct TestNode {
    node: Arc<Node>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    server: JoinHandle<std::io::Result<()>>,
}

impl TestNode {
    async fn start(
        port: u16,
        peers: Vec<String>,
        mode: ReplicationMode,
        quorum: usize,
    ) -> TestNode {
        let mut config = NodeConfig::new("127.0.0.1", port, format!("node-{}", port), peers);
        config.replication_mode = mode;
        config.replication_quorum = quorum;
        config.db_path = std::env::temp_dir().join(format!(
            "courier-e2e-{}-{}.db",
            port,
            std::process::id()
        ));
        config.catchup_interval = Duration::from_secs(1);
        let _ = std::fs::remove_file(&config.db_path);

        let node = Node::new(config).unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = cluster::spawn_background(node.clone(), shutdown_rx.clone());
        let server = tokio::spawn(server::serve(node.clone(), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        TestNode {
            node,
            shutdown,
            tasks,
            server,
        }
    }

    fn url(&self) -> String {
        self.node.base_url.clone()
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        let _ = self.server.await;
        let _ = std::fs::remove_file(&self.node.config.db_path);
    }
}

fn http() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

async fn get_json(client: &reqwest::Client, url: &str) -> Value {
    client
        .get(url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn wait_for_leader(
    client: &reqwest::Client,
    urls: &[String],
    patience: Duration,
) -> Option<String> {
    let deadline = tokio::time::Instant::now() + patience;
    while tokio::time::Instant::now() < deadline {
        for url in urls {
            if let Ok(response) = client.get(format!("{}/status", url)).send().await {
                if let Ok(value) = response.json::<Value>().await {
                    if value["consensus"]["role"] == "Leader" {
                        return Some(url.clone());
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    None
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn single_node_elects_itself_and_serves_messages() {
    let test = TestNode::start(7301, vec![], ReplicationMode::Async, 1).await;
    let client = http();

    let leader = wait_for_leader(&client, &[test.url()], Duration::from_secs(3)).await;
    assert_eq!(leader, Some(test.url()));

    let status = get_json(&client, &format!("{}/status", test.url())).await;
    assert!(status["consensus"]["current_term"].as_u64().unwrap() >= 1);

    let ts = unix_now();
    let response = client
        .post(format!("{}/send", test.url()))
        .json(&json!({ "msg_id": "m1", "payload": "x", "ts": ts }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["seq"], 1);
    assert_eq!(body["msg_id"], "m1");
    let corrected = body["corrected_ts"].as_f64().unwrap();
    assert!((corrected - ts).abs() <= 1.0);

    let listing = get_json(&client, &format!("{}/messages?limit=10", test.url())).await;
    let messages = listing["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["seq"], 1);
    assert_eq!(messages[0]["payload"], "x");
    assert_eq!(listing["next_after"], 1);

    test.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn duplicate_send_returns_the_same_seq() {
    let test = TestNode::start(7302, vec![], ReplicationMode::Async, 1).await;
    let client = http();
    wait_for_leader(&client, &[test.url()], Duration::from_secs(3)).await;

    let payload = json!({ "msg_id": "dup", "payload": "x", "ts": unix_now() });
    let first: Value = client
        .post(format!("{}/send", test.url()))
        .json(&payload)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let second: Value = client
        .post(format!("{}/send", test.url()))
        .json(&payload)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["seq"], second["seq"]);

    let listing = get_json(&client, &format!("{}/messages?limit=10", test.url())).await;
    let matching: Vec<_> = listing["messages"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["msg_id"] == "dup")
        .collect();
    assert_eq!(matching.len(), 1);

    test.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn follower_redirects_and_the_client_follows() {
    let url_a = "http://127.0.0.1:7311".to_owned();
    let url_b = "http://127.0.0.1:7312".to_owned();
    let a = TestNode::start(7311, vec![url_b.clone()], ReplicationMode::Async, 1).await;
    let b = TestNode::start(7312, vec![url_a.clone()], ReplicationMode::Async, 1).await;
    let client = http();

    let urls = vec![url_a.clone(), url_b.clone()];
    let leader = wait_for_leader(&client, &urls, Duration::from_secs(5))
        .await
        .expect("a leader should emerge");
    let follower = if leader == url_a { &url_b } else { &url_a };

    // the follower learns the leader from heartbeats, so poll briefly
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut redirect = None;
    while tokio::time::Instant::now() < deadline {
        let response = client
            .post(format!("{}/send", follower))
            .json(&json!({ "payload": "via-follower", "ts": unix_now() }))
            .send()
            .await
            .unwrap();
        if response.status() == 307 {
            redirect = Some(response.json::<Value>().await.unwrap());
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let redirect = redirect.expect("follower should redirect");
    assert_eq!(redirect["status"], "redirect");
    assert_eq!(redirect["reason"], "node_is_not_leader");
    assert_eq!(redirect["leader_url"].as_str().unwrap(), leader);

    // the failover client resolves the redirect transparently
    let mut failover = FailoverClient::new([follower.clone()]).unwrap();
    let sent = failover
        .send(&storage::IncomingMessage {
            msg_id: Some("via-client".to_owned()),
            payload: Some("hello".to_owned()),
            ts: Some(unix_now()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(sent["status"], "ok");
    assert_eq!(failover.leader(), Some(leader.as_str()));

    // a manual sync round against the live peer succeeds
    let sync: Value = client
        .post(format!("{}/time/sync", leader))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sync["status"], "ok");
    assert!(sync["sync_status"]["successful_syncs"].as_u64().unwrap() >= 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn unmet_quorum_rejects_the_write_without_commit() {
    // the peer is never started
    let dead_peer = "http://127.0.0.1:7322".to_owned();
    let test = TestNode::start(7321, vec![dead_peer], ReplicationMode::SyncQuorum, 2).await;
    let client = http();

    let response = client
        .post(format!("{}/send", test.url()))
        .json(&json!({ "msg_id": "q1", "payload": "x", "ts": unix_now() }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["reason"], "replication quorum not achieved");

    let listing = get_json(&client, &format!("{}/messages?limit=10", test.url())).await;
    assert!(listing["messages"].as_array().unwrap().is_empty());

    test.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn restarted_node_catches_up_from_its_peer() {
    let url_a = "http://127.0.0.1:7331".to_owned();
    let url_b = "http://127.0.0.1:7332".to_owned();
    let a = TestNode::start(7331, vec![url_b.clone()], ReplicationMode::Async, 1).await;
    let client = http();

    for n in 0..10 {
        let response = client
            .post(format!("{}/send", url_a))
            .json(&json!({ "msg_id": format!("m{}", n), "payload": "x", "ts": unix_now() }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    // b starts empty and pulls everything through catch-up sync
    let b = TestNode::start(7332, vec![url_a.clone()], ReplicationMode::Async, 1).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
    let mut recovered = Vec::new();
    while tokio::time::Instant::now() < deadline {
        let listing = get_json(&client, &format!("{}/messages?limit=100", url_b)).await;
        recovered = listing["messages"].as_array().unwrap().clone();
        if recovered.len() == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    assert_eq!(recovered.len(), 10);
    let seqs: Vec<u64> = recovered
        .iter()
        .map(|m| m["seq"].as_u64().unwrap())
        .collect();
    assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn replicate_endpoint_is_idempotent_and_commits() {
    let test = TestNode::start(7341, vec![], ReplicationMode::Async, 1).await;
    let client = http();

    let msg = json!({
        "msg": {
            "msg_id": "r1",
            "sender": "peer",
            "recipient": "all",
            "payload": "replicated",
            "ts": 1_700_000_000.5,
            "original_ts": 1_700_000_000.0,
            "corrected_ts": 1_700_000_000.5,
            "receive_ts": 1_700_000_000.1,
        }
    });
    let response = client
        .post(format!("{}/replicate", test.url()))
        .json(&msg)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["seq"], 1);
    assert_eq!(body["msg_id"], "r1");

    // followers commit immediately: the message is readable at once
    let listing = get_json(&client, &format!("{}/messages", test.url())).await;
    let messages = listing["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    // the corrected timestamp from the first ingest is preserved
    assert_eq!(messages[0]["corrected_ts"].as_f64().unwrap(), 1_700_000_000.5);

    // replaying the same message does not grow the log
    let replay: Value = client
        .post(format!("{}/replicate", test.url()))
        .json(&msg)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(replay["seq"], 1);

    // a missing msg body is a bad request
    let response = client
        .post(format!("{}/replicate", test.url()))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    test.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn invalid_consumer_queries_are_rejected() {
    let test = TestNode::start(7342, vec![], ReplicationMode::Async, 1).await;
    let client = http();

    let response = client
        .get(format!("{}/messages?limit=0", test.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .get(format!("{}/messages?limit=abc", test.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .get(format!("{}/messages?after=xyz", test.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    test.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn time_endpoints_expose_the_pipeline() {
    let test = TestNode::start(7351, vec![], ReplicationMode::Async, 1).await;
    let client = http();

    let probe = get_json(&client, &format!("{}/time", test.url())).await;
    assert!(probe["server_receive_time"].as_f64().is_some());
    assert!(probe["server_send_time"].as_f64().is_some());
    assert_eq!(probe["node_id"], "node-7351");

    // correction of a sane timestamp succeeds
    let corrected: Value = client
        .post(format!("{}/time/correct", test.url()))
        .json(&json!({ "timestamp": unix_now() }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(corrected["status"], "ok");
    assert!(corrected["corrected_timestamp"].as_f64().is_some());
    assert!(corrected["estimated_accuracy"]["uncertainty"].as_f64().unwrap() > 0.0);

    // a far-future timestamp is rejected at validation
    let response = client
        .post(format!("{}/time/correct", test.url()))
        .json(&json!({ "timestamp": unix_now() + 100.0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let clock = get_json(&client, &format!("{}/clock", test.url())).await;
    assert!(clock["time_synchronization"]["clock_offset"].as_f64().is_some());

    let stats = get_json(&client, &format!("{}/time/stats", test.url())).await;
    assert_eq!(stats["status"], "ok");
    assert!(stats["statistics"]["timestamp_correction"]["corrections_applied"]
        .as_u64()
        .is_some());

    let ordering = get_json(&client, &format!("{}/ordering/status", test.url())).await;
    assert_eq!(ordering["status"], "ok");

    let forced: Value = client
        .post(format!("{}/ordering/force_delivery", test.url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(forced["status"], "ok");

    let reset: Value = client
        .post(format!("{}/time/reset", test.url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reset["status"], "ok");

    // with no peers alive a manual sync reports partial success
    let response = client
        .post(format!("{}/time/sync", test.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 206);

    test.stop().await;
}
