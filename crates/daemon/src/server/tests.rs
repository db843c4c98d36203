use super::*;
use crate::encode::EncodeExit;
use crate::hook::HookResult;
use crate::job::{AddMode, JobState};
use crate::profile::Profile;
use crate::rpc::{
    AddQueueRequest, AddTarget, ChangeItemData, ChangeKind, OutputInfo, ServerConnection,
    ServerMessage,
};
use crate::store::save_json;
use crate::testing::{FakeEncoder, FakeHook, FakeProber};
use std::path::Path;
use tempfile::TempDir;
use tokio::task::JoinHandle;

fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.server.data_dir = root.join("data");
    config.server.status_bind = String::new();
    config.encoder.work_dir = root.join("work");
    config.scheduler.parallelism = 1;
    config
}

fn seed_profile(config: &Config) {
    let mut profile = Profile::new("default");
    profile.disable_chapter = true;
    profile.no_delogo = true;
    let dir = config.server.data_dir.join("profile");
    save_json(&dir.join("default.json"), &profile).unwrap();
}

struct Running {
    addr: String,
    handle: JoinHandle<Result<(), ServerError>>,
    status: SharedStatus,
}

async fn start(config: Config, encoder: FakeEncoder) -> Running {
    let collaborators = Collaborators {
        prober: Arc::new(FakeProber::default()),
        encoder: Arc::new(encoder),
        hook: Arc::new(FakeHook::new(|_, _| HookResult::default())),
    };
    let server = EncodeServer::new(config, collaborators);
    let status = server.status();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(server.run(listener));
    Running {
        addr,
        handle,
        status,
    }
}

/// Next event matching `pred`, failing the test after a few seconds.
async fn wait_for<F>(events: &mut mpsc::Receiver<ServerMessage>, mut pred: F) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let msg = events.recv().await.expect("connection closed");
            if pred(&msg) {
                return msg;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn add_request(src: &Path, dst: &Path) -> AddQueueRequest {
    AddQueueRequest {
        request_id: Some("add-1".into()),
        targets: vec![AddTarget {
            path: src.to_path_buf(),
            hash: None,
        }],
        outputs: vec![OutputInfo {
            dst_dir: dst.to_path_buf(),
            profile: "default".into(),
            priority: 3,
        }],
        mode: AddMode::Single,
        ..AddQueueRequest::default()
    }
}

#[tokio::test]
async fn test_added_job_runs_to_completion() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    seed_profile(&config);
    let src = dir.path().join("rec.ts");
    std::fs::write(&src, b"ts").unwrap();
    let data_dir = config.server.data_dir.clone();

    let server = start(config, FakeEncoder::exiting(EncodeExit::Code(0))).await;
    let (events_tx, mut events) = mpsc::channel(256);
    let conn = ServerConnection::connect(server.addr.clone(), events_tx);

    // Full resync on connect.
    wait_for(&mut events, |m| {
        matches!(m, ServerMessage::OnUiData(ui) if ui.queue.is_some())
    })
    .await;

    conn.send(ClientMessage::AddQueue(add_request(&src, &dir.path().join("out"))))
        .await
        .unwrap();
    // The add is answered before admission runs.
    wait_for(&mut events, |m| {
        matches!(m, ServerMessage::OnAddResult(r) if r.request_id.as_deref() == Some("add-1"))
    })
    .await;
    let done = wait_for(&mut events, |m| {
        m.queue_state().map_or(false, |(_, s)| s == JobState::Complete)
    })
    .await;
    let (job_id, _) = done.queue_state().unwrap();

    conn.send(ClientMessage::EndServer).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    conn.close();

    let saved = crate::store::QueueSnapshot::load(&data_dir.join("queue.json"));
    assert_eq!(saved.jobs.len(), 1);
    assert_eq!(saved.jobs[0].id, job_id);
    assert_eq!(saved.jobs[0].state, JobState::Complete);
    let log = std::fs::read_to_string(data_dir.join("encode_log.jsonl")).unwrap();
    assert_eq!(log.lines().count(), 1);

    let status = server.status.read().await;
    assert_eq!(status.counts.get("complete"), Some(&1));
}

#[tokio::test]
async fn test_cancel_reaches_running_worker() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    seed_profile(&config);
    let src = dir.path().join("rec.ts");
    std::fs::write(&src, b"ts").unwrap();

    let server = start(config, FakeEncoder::blocking()).await;
    let (events_tx, mut events) = mpsc::channel(256);
    let conn = ServerConnection::connect(server.addr.clone(), events_tx);

    conn.send(ClientMessage::AddQueue(add_request(&src, &dir.path().join("out"))))
        .await
        .unwrap();
    let running = wait_for(&mut events, |m| {
        m.queue_state().map_or(false, |(_, s)| s == JobState::Running)
    })
    .await;
    let (job_id, _) = running.queue_state().unwrap();

    conn.send(ClientMessage::ChangeItem(ChangeItemData {
        request_id: None,
        item_id: job_id,
        change: ChangeKind::Cancel,
    }))
    .await
    .unwrap();
    wait_for(&mut events, |m| {
        m.queue_state() == Some((job_id, JobState::Canceled))
    })
    .await;
    // The worker's own completion follows and is logged.
    wait_for(&mut events, |m| {
        matches!(m, ServerMessage::OnUiData(ui) if ui.log_item.is_some())
    })
    .await;

    conn.send(ClientMessage::EndServer).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    conn.close();
}

#[tokio::test]
async fn test_rejected_profile_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    seed_profile(&config);

    let server = start(config, FakeEncoder::exiting(EncodeExit::Code(0))).await;
    let (events_tx, mut events) = mpsc::channel(256);
    let conn = ServerConnection::connect(server.addr.clone(), events_tx);

    conn.send(ClientMessage::SetProfile(crate::rpc::ProfileUpdate {
        kind: crate::rpc::UpdateKind::Add,
        profile: Profile::new("default"),
    }))
    .await
    .unwrap();
    let result = wait_for(&mut events, |m| {
        matches!(m, ServerMessage::OnOperationResult(_))
    })
    .await;
    match result {
        ServerMessage::OnOperationResult(r) => {
            assert!(r.is_failed);
            assert_eq!(r.message, "profile default already exists");
        }
        other => panic!("unexpected {:?}", other),
    }

    conn.send(ClientMessage::EndServer).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    conn.close();
}
