// Copyright 2026 Wheelwright Maintainers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end tests for the master's task fabric: real sockets, real
//! temporary output trees, and a scripted database stub standing in for
//! the worker pool behind the gateway.

use std::collections::BTreeSet;
use std::time::Duration;

use sha2::{Digest, Sha256};
use test_r::test;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;

use wheelwright_common::model::FileRecord;
use wheelwright_common::protocol::{
    AdminError, AdminReply, AdminRequest, TransferDown, TransferUp, WebRequest, WorkerReply,
    WorkerRequest,
};
use wheelwright_common::transport::{BinaryStream, MessageStream};

use wheelwright_master::coalescer::WebCoalescer;
use wheelwright_master::config::TransferConfig;
use wheelwright_master::db::client::DbClient;
use wheelwright_master::db::{DbError, DbFront, DbOp, DbRequest, DbValue, ProjectFileRow};
use wheelwright_master::files::{FileServer, FsRequest};
use wheelwright_master::tasks::{control_channel, spawn, Control, PauseMode};
use wheelwright_master::web::PageWriter;
use wheelwright_master::workers::WorkerRouter;

test_r::enable!();

/// Serves the database front channel with a scripted responder, in place
/// of the gateway and its worker pool.
fn stub_db<F>(mut respond: F) -> DbFront
where
    F: FnMut(&DbOp) -> Result<DbValue, DbError> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<DbRequest>(100);
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let _ = request.reply.send(respond(&request.op));
        }
    });
    tx
}

/// Reasonable defaults for operations a test does not care about.
fn default_db(op: &DbOp) -> Result<DbValue, DbError> {
    Ok(match op {
        DbOp::AllPkgs | DbOp::GetAliases { .. } | DbOp::GetAbis | DbOp::VerFiles { .. } => {
            DbValue::TextSet(BTreeSet::new())
        }
        DbOp::LoadRewrites => DbValue::Rewrites(Vec::new()),
        DbOp::LogBuild(_) => DbValue::Integer(1),
        DbOp::NewPkg { .. } | DbOp::NewVer { .. } => DbValue::Bool(true),
        DbOp::PkgExists { .. } | DbOp::VerExists { .. } => DbValue::Bool(false),
        DbOp::GetSkip { .. } | DbOp::PkgSkip { .. } => DbValue::Text(String::new()),
        DbOp::VerYanked { .. } => DbValue::Bool(false),
        DbOp::GetSerial => DbValue::Integer(0),
        DbOp::ProjFiles { .. } => DbValue::ProjectFiles(Vec::new()),
        DbOp::ProjVers { .. } => DbValue::ProjectVersions(Vec::new()),
        DbOp::ProjDownloads { .. } => DbValue::Downloads(Default::default()),
        DbOp::FileDeps { .. } => DbValue::PairSet(BTreeSet::new()),
        _ => DbValue::Unit,
    })
}

/// Serves the file-server request channel with unconditional success.
fn stub_fs() -> mpsc::Sender<FsRequest> {
    let (tx, mut rx) = mpsc::channel::<FsRequest>(10);
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            match request {
                FsRequest::Expect { reply, .. } => {
                    let _ = reply.send(Ok(()));
                }
                FsRequest::Verify { reply, .. } => {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    });
    tx
}

fn wheel_record(content: &[u8]) -> FileRecord {
    FileRecord {
        filename: "foo-0.1-cp34-cp34m-linux_armv7l.whl".to_string(),
        filesize: content.len() as u64,
        filehash: hex::encode(Sha256::digest(content)),
        package_tag: "foo".to_string(),
        package_version_tag: "0.1".to_string(),
        py_version_tag: "cp34".to_string(),
        abi_tag: "cp34m".to_string(),
        platform_tag: "linux_armv7l".to_string(),
        dependencies: BTreeSet::new(),
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[test]
async fn db_gateway_matches_requests_to_ready_workers_in_turn() {
    use wheelwright_master::db::gateway::DbGateway;

    let (sup_tx, _sup_rx) = mpsc::channel(1);
    let (ctrl_tx, ctrl) = control_channel("db-gateway", PauseMode::NonStop);
    let (front_tx, front_rx) = mpsc::channel(100);
    let (ready_tx, ready_rx) = mpsc::channel(10);
    let handle = spawn(
        "db-gateway",
        ctrl_tx,
        sup_tx,
        DbGateway::new(ctrl, front_rx, ready_rx).run(),
    );

    // Two workers announce readiness, in order.
    let (worker_a_tx, mut worker_a_rx) = mpsc::channel::<DbRequest>(1);
    let (worker_b_tx, mut worker_b_rx) = mpsc::channel::<DbRequest>(1);
    ready_tx.send(worker_a_tx.clone()).await.unwrap();
    ready_tx.send(worker_b_tx).await.unwrap();

    let client = DbClient::new(front_tx);
    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.get_index_serial().await })
    };
    let request = timeout(Duration::from_secs(5), worker_a_rx.recv())
        .await
        .unwrap()
        .expect("the first request goes to the first ready worker");
    assert!(matches!(request.op, DbOp::GetSerial));
    request.reply.send(Ok(DbValue::Integer(7))).unwrap();
    assert_eq!(first.await.unwrap().unwrap(), 7);

    // The second request must go to the other worker; the first has not
    // re-registered yet.
    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.get_index_serial().await })
    };
    let request = timeout(Duration::from_secs(5), worker_b_rx.recv())
        .await
        .unwrap()
        .unwrap();
    request.reply.send(Ok(DbValue::Integer(8))).unwrap();
    assert_eq!(second.await.unwrap().unwrap(), 8);

    // Once the first worker re-registers it is next in line again.
    ready_tx.send(worker_a_tx).await.unwrap();
    let third = tokio::spawn(async move { client.get_index_serial().await });
    let request = timeout(Duration::from_secs(5), worker_a_rx.recv())
        .await
        .unwrap()
        .unwrap();
    request.reply.send(Ok(DbValue::Integer(9))).unwrap();
    assert_eq!(third.await.unwrap().unwrap(), 9);

    handle.quit().await;
    handle.join(Duration::from_secs(5)).await;
}

#[test]
async fn index_poller_mirrors_settled_events_into_the_catalog() {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use wheelwright_master::config::IndexConfig;
    use wheelwright_master::index::events::{EventSource, RawEvent, SourceError};
    use wheelwright_master::index::IndexPoller;

    struct ScriptedSource {
        batches: Mutex<VecDeque<Vec<RawEvent>>>,
    }

    #[async_trait::async_trait]
    impl EventSource for ScriptedSource {
        async fn changes_since(&self, _serial: i64) -> Result<Vec<RawEvent>, SourceError> {
            Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    let base = 1_600_000_000i64;
    let source = ScriptedSource {
        batches: Mutex::new(VecDeque::from(vec![
            // Within the settling window: nothing may reach the catalog.
            vec![RawEvent(
                "foo".to_string(),
                Some("0.1".to_string()),
                base,
                "add source file foo-0.1.tar.gz".to_string(),
                150,
            )],
            // A much newer event pushes the first one out of the window.
            vec![RawEvent(
                "bar".to_string(),
                Some("0.2".to_string()),
                base + 600,
                "add cp34 file bar-0.2-cp34-cp34m-linux_armv7l.whl".to_string(),
                160,
            )],
        ])),
    };

    let seen: Arc<Mutex<Vec<DbOp>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let seen = seen.clone();
        stub_db(move |op| {
            seen.lock().unwrap().push(op.clone());
            default_db(op)
        })
    };

    let config = IndexConfig {
        root_url: url::Url::parse("https://pypi.org/").unwrap(),
        events_url: url::Url::parse("http://127.0.0.1:9/").unwrap(),
        // Unroutable: description lookups fail fast and harmlessly.
        json_url: url::Url::parse("http://127.0.0.1:9/").unwrap(),
        poll_interval: Duration::from_millis(50),
        epoch_serial: 100,
        serial_margin: 10,
    };
    let (sup_tx, _sup_rx) = mpsc::channel(1);
    let (ctrl_tx, ctrl) = control_channel("index-poller", PauseMode::Pauseable);
    let (web_tx, mut web_rx) = mpsc::channel(100);
    let (kick_tx, mut kick_rx) = mpsc::channel(1);
    let poller = IndexPoller::new(
        ctrl,
        &config,
        DbClient::new(recorder),
        Box::new(source),
        web_tx,
        kick_tx,
    );
    let handle = spawn("index-poller", ctrl_tx, sup_tx, poller.run());

    // The settled "foo" source event lands as a package and a buildable
    // version, and the serial advances past the released event only.
    wait_for("the catalog writes", || {
        let seen = seen.lock().unwrap();
        seen.iter().any(|op| {
            matches!(op, DbOp::NewVer { package, version, skip, .. }
                if package == "foo" && version == "0.1" && skip.is_empty())
        }) && seen
            .iter()
            .any(|op| matches!(op, DbOp::SetSerial(160)))
    })
    .await;
    {
        let seen = seen.lock().unwrap();
        assert!(seen
            .iter()
            .any(|op| matches!(op, DbOp::NewPkg { package, .. } if package == "foo")));
        assert!(
            !seen
                .iter()
                .any(|op| matches!(op, DbOp::NewVer { package, .. } if package == "bar")),
            "the unsettled event must still be buffered"
        );
    }
    // Catalog changes nudge the queue builder and the web output.
    assert!(kick_rx.try_recv().is_ok());
    let rewrite = timeout(Duration::from_secs(5), web_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        rewrite,
        WebRequest::PkgBoth(_) | WebRequest::PkgProj(_)
    ));

    handle.quit().await;
    handle.join(Duration::from_secs(5)).await;
}

#[test]
async fn coalescer_collapses_duplicate_rewrites() {
    let (sup_tx, _sup_rx) = mpsc::channel(1);
    let (ctrl_tx, ctrl) = control_channel("web-coalescer", PauseMode::Pausing);
    let db = DbClient::new(stub_db(default_db));
    let (input_tx, input_rx) = mpsc::channel(100);
    let (output_tx, mut output_rx) = mpsc::channel(100);
    let handle = spawn(
        "web-coalescer",
        ctrl_tx,
        sup_tx,
        WebCoalescer::new(ctrl, db, input_rx, output_tx, Duration::from_millis(200)).run(),
    );

    input_tx
        .send(WebRequest::PkgProj("foo".to_string()))
        .await
        .unwrap();
    input_tx
        .send(WebRequest::PkgProj("foo".to_string()))
        .await
        .unwrap();
    input_tx
        .send(WebRequest::PkgBoth("foo".to_string()))
        .await
        .unwrap();

    // After the hold expires, exactly one PKGBOTH emerges.
    let first = timeout(Duration::from_secs(5), output_rx.recv())
        .await
        .expect("a rewrite should be forwarded")
        .unwrap();
    assert_eq!(first, WebRequest::PkgBoth("foo".to_string()));
    assert!(
        timeout(Duration::from_millis(500), output_rx.recv())
            .await
            .is_err(),
        "duplicates must be collapsed"
    );

    handle.quit().await;
    handle.join(Duration::from_secs(5)).await;
}

#[test]
async fn file_server_transfers_verifies_and_publishes() {
    let output = tempfile::tempdir().unwrap();
    std::fs::create_dir(output.path().join("simple")).unwrap();
    let content: Vec<u8> = (0..3000u32).map(|i| (i % 199) as u8).collect();
    let record = wheel_record(&content);

    let (sup_tx, _sup_rx) = mpsc::channel(1);
    let (ctrl_tx, ctrl) = control_channel("file-server", PauseMode::NonStop);
    let (fs_tx, fs_rx) = mpsc::channel(10);
    let config = TransferConfig {
        chunk_size: 1024,
        credit: 4,
        chunk_timeout: Duration::from_secs(5),
        deadline: Duration::from_secs(60),
    };
    let server = FileServer::bind(
        ctrl,
        config,
        output.path().to_path_buf(),
        "127.0.0.1:0",
        fs_rx,
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = spawn("file-server", ctrl_tx, sup_tx, server.run());

    // The router announces the expected file.
    let (expect_tx, expect_rx) = oneshot::channel();
    fs_tx
        .send(FsRequest::Expect {
            worker_id: 5,
            file: record.clone(),
            reply: expect_tx,
        })
        .await
        .unwrap();
    expect_rx.await.unwrap().unwrap();

    // The worker connects and answers every FETCH.
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut stream: BinaryStream<TransferDown, TransferUp, _> = BinaryStream::new(socket);
    stream.send(&TransferUp::Hello { worker_id: 5 }).await.unwrap();
    let mut served = 0usize;
    while served < content.len() {
        match timeout(Duration::from_secs(5), stream.recv()).await.unwrap() {
            Ok(TransferDown::Fetch { offset, length }) => {
                let start = offset as usize;
                let end = (start + length as usize).min(content.len());
                stream
                    .send(&TransferUp::Chunk {
                        offset,
                        data: content[start..end].to_vec(),
                    })
                    .await
                    .unwrap();
                served = served.max(end);
            }
            Ok(TransferDown::Done) => break,
            Err(err) => panic!("transfer stream failed: {err}"),
        }
    }
    // Give the server a moment to spool the tail chunks.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (verify_tx, verify_rx) = oneshot::channel();
    fs_tx
        .send(FsRequest::Verify {
            worker_id: 5,
            package: "foo".to_string(),
            reply: verify_tx,
        })
        .await
        .unwrap();
    verify_rx.await.unwrap().expect("verification should pass");

    let published = output
        .path()
        .join("simple/foo")
        .join(&record.filename);
    assert_eq!(std::fs::read(&published).unwrap(), content);
    let armv6 = output
        .path()
        .join("simple/foo/foo-0.1-cp34-cp34m-linux_armv6l.whl");
    assert!(armv6.symlink_metadata().unwrap().is_symlink());

    handle.quit().await;
    handle.join(Duration::from_secs(5)).await;
}

#[test]
async fn file_server_discards_a_transfer_with_a_bad_hash() {
    let output = tempfile::tempdir().unwrap();
    std::fs::create_dir(output.path().join("simple")).unwrap();
    let content: Vec<u8> = vec![0x11; 2000];
    let mut record = wheel_record(&content);
    record.filehash = "0".repeat(64);

    let (sup_tx, _sup_rx) = mpsc::channel(1);
    let (ctrl_tx, ctrl) = control_channel("file-server", PauseMode::NonStop);
    let (fs_tx, fs_rx) = mpsc::channel(10);
    let config = TransferConfig {
        chunk_size: 1024,
        credit: 2,
        chunk_timeout: Duration::from_secs(5),
        deadline: Duration::from_secs(60),
    };
    let server = FileServer::bind(
        ctrl,
        config,
        output.path().to_path_buf(),
        "127.0.0.1:0",
        fs_rx,
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = spawn("file-server", ctrl_tx, sup_tx, server.run());

    let (expect_tx, expect_rx) = oneshot::channel();
    fs_tx
        .send(FsRequest::Expect {
            worker_id: 9,
            file: record.clone(),
            reply: expect_tx,
        })
        .await
        .unwrap();
    expect_rx.await.unwrap().unwrap();

    let socket = TcpStream::connect(addr).await.unwrap();
    let mut stream: BinaryStream<TransferDown, TransferUp, _> = BinaryStream::new(socket);
    stream.send(&TransferUp::Hello { worker_id: 9 }).await.unwrap();
    let mut served = 0usize;
    while served < content.len() {
        match timeout(Duration::from_secs(5), stream.recv()).await.unwrap() {
            Ok(TransferDown::Fetch { offset, length }) => {
                let start = offset as usize;
                let end = (start + length as usize).min(content.len());
                stream
                    .send(&TransferUp::Chunk {
                        offset,
                        data: content[start..end].to_vec(),
                    })
                    .await
                    .unwrap();
                served = served.max(end);
            }
            Ok(TransferDown::Done) => panic!("a bad hash must not be acknowledged"),
            Err(err) => panic!("transfer stream failed: {err}"),
        }
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (verify_tx, verify_rx) = oneshot::channel();
    fs_tx
        .send(FsRequest::Verify {
            worker_id: 9,
            package: "foo".to_string(),
            reply: verify_tx,
        })
        .await
        .unwrap();
    let result = verify_rx.await.unwrap();
    assert!(result.is_err(), "verification must fail");
    assert!(
        !output
            .path()
            .join("simple/foo")
            .join(&record.filename)
            .exists(),
        "nothing may be published"
    );

    handle.quit().await;
    handle.join(Duration::from_secs(5)).await;
}

#[test]
async fn worker_dialog_runs_the_full_state_machine() {
    let (sup_tx, _sup_rx) = mpsc::channel(1);
    let (ctrl_tx, ctrl) = control_channel("worker-router", PauseMode::Pausing);
    let router_control = ctrl_tx.clone();
    let db = DbClient::new(stub_db(|op| match op {
        DbOp::LogBuild(build) => {
            assert!(build.status);
            assert_eq!(build.package, "foo");
            Ok(DbValue::Integer(42))
        }
        other => default_db(other),
    }));
    let fs = stub_fs();
    let (web_tx, mut web_rx) = mpsc::channel(100);
    let (status_tx, _status_keep) = broadcast::channel(100);
    let (queue_tx, queue_rx) = watch::channel(Default::default());
    let router = WorkerRouter::bind(
        ctrl,
        "127.0.0.1:0",
        "https://pypi.org/".to_string(),
        db,
        fs,
        web_tx,
        status_tx,
        queue_rx,
    )
    .await
    .unwrap();
    let addr = router.local_addr().unwrap();
    let handle = spawn("worker-router", ctrl_tx, sup_tx, router.run());

    queue_tx
        .send(
            [(
                "cp34m".to_string(),
                vec![("foo".to_string(), "0.1".to_string())],
            )]
            .into_iter()
            .collect(),
        )
        .unwrap();

    let socket = TcpStream::connect(addr).await.unwrap();
    let mut stream: MessageStream<WorkerReply, WorkerRequest, _> = MessageStream::new(socket);
    stream
        .send(&WorkerRequest::Hello {
            timeout: Duration::from_secs(3 * 60 * 60),
            py_version_tag: "cp34".to_string(),
            abi_tag: "cp34m".to_string(),
            platform_tag: "linux_armv7l".to_string(),
            label: "builder2".to_string(),
        })
        .await
        .unwrap();
    let hello = timeout(Duration::from_secs(5), stream.recv()).await.unwrap().unwrap();
    let worker_id = match hello {
        WorkerReply::Hello { worker_id, index_url } => {
            assert_eq!(index_url, "https://pypi.org/");
            worker_id
        }
        other => panic!("expected HELLO, got {other:?}"),
    };
    assert!(worker_id > 0);

    stream.send(&WorkerRequest::Idle).await.unwrap();
    let build = timeout(Duration::from_secs(5), stream.recv()).await.unwrap().unwrap();
    assert_eq!(
        build,
        WorkerReply::Build {
            package: "foo".to_string(),
            version: "0.1".to_string(),
        }
    );

    let record = wheel_record(b"does not matter here");
    stream
        .send(&WorkerRequest::Built {
            success: true,
            duration: Duration::from_secs(300),
            output: "ok".to_string(),
            files: vec![record.clone()],
        })
        .await
        .unwrap();
    let send = timeout(Duration::from_secs(5), stream.recv()).await.unwrap().unwrap();
    assert_eq!(
        send,
        WorkerReply::Send {
            filename: record.filename.clone(),
        }
    );

    stream.send(&WorkerRequest::Sent).await.unwrap();
    let done = timeout(Duration::from_secs(5), stream.recv()).await.unwrap().unwrap();
    assert_eq!(done, WorkerReply::Done);

    // The successful build produced a log write and a page rewrite.
    let log = timeout(Duration::from_secs(5), web_rx.recv()).await.unwrap().unwrap();
    assert!(matches!(log, WebRequest::BuildLog { build_id: 42, .. }));
    let rewrite = timeout(Duration::from_secs(5), web_rx.recv()).await.unwrap().unwrap();
    assert_eq!(rewrite, WebRequest::PkgBoth("foo".to_string()));

    // The just-built version is not handed out again from the same
    // snapshot.
    stream.send(&WorkerRequest::Idle).await.unwrap();
    let sleep = timeout(Duration::from_secs(5), stream.recv()).await.unwrap().unwrap();
    assert_eq!(sleep, WorkerReply::Sleep);

    // The operator kills the worker; the next reply is DIE.
    router_control.send(Control::Kill(worker_id)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    stream.send(&WorkerRequest::Idle).await.unwrap();
    let die = timeout(Duration::from_secs(5), stream.recv()).await.unwrap().unwrap();
    assert_eq!(die, WorkerReply::Die);

    handle.quit().await;
    handle.join(Duration::from_secs(5)).await;
}

#[test]
async fn admin_endpoint_creates_packages_and_rejects_unknown_versions() {
    use wheelwright_master::admin::AdminEndpoint;

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("admin.sock");
    let (sup_tx, _sup_rx) = mpsc::channel(1);
    let (ctrl_tx, ctrl) = control_channel("admin", PauseMode::NonStop);
    let db = DbClient::new(stub_db(|op| match op {
        DbOp::NewPkg { package, .. } => {
            assert_eq!(package, "foo");
            Ok(DbValue::Bool(true))
        }
        DbOp::PkgExists { .. } => Ok(DbValue::Bool(false)),
        other => default_db(other),
    }));
    let (web_tx, mut web_rx) = mpsc::channel(100);
    let (fs_tx, _fs_rx) = mpsc::channel(10);
    let (stats_tx, _stats_rx) = mpsc::channel(10);
    let admin = AdminEndpoint::bind(ctrl, &socket_path, db, web_tx, fs_tx, stats_tx).unwrap();
    let handle = spawn("admin", ctrl_tx, sup_tx, admin.run());

    let socket = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
    let mut stream: MessageStream<AdminReply, AdminRequest, _> = MessageStream::new(socket);

    stream
        .send(&AdminRequest::AddPkg {
            package: "foo".to_string(),
            description: "desc".to_string(),
            skip: String::new(),
            unskip: false,
            aliases: Vec::new(),
        })
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(5), stream.recv()).await.unwrap().unwrap();
    assert_eq!(
        reply,
        AdminReply::Done {
            kind: "NEWPKG".to_string(),
        }
    );
    assert_eq!(
        timeout(Duration::from_secs(5), web_rx.recv()).await.unwrap().unwrap(),
        WebRequest::PkgBoth("foo".to_string())
    );

    stream
        .send(&AdminRequest::AddVer {
            package: "nope".to_string(),
            version: "0.1".to_string(),
            skip: String::new(),
            unskip: false,
            released: chrono::Utc::now(),
            yank: false,
            unyank: false,
        })
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(5), stream.recv()).await.unwrap().unwrap();
    assert_eq!(reply, AdminReply::Error(AdminError::NoPkg));

    handle.quit().await;
    handle.join(Duration::from_secs(5)).await;
}

#[test]
async fn page_writer_renders_indexes_and_respects_alias_collisions() {
    let output = tempfile::tempdir().unwrap();
    // A real package already owns the directory the alias would use.
    std::fs::create_dir_all(output.path().join("simple/foo-bar")).unwrap();
    std::fs::write(output.path().join("simple/foo-bar/sentinel"), b"real").unwrap();

    let (sup_tx, _sup_rx) = mpsc::channel(1);
    let (ctrl_tx, ctrl) = control_channel("page-writer", PauseMode::Pauseable);
    let db = DbClient::new(stub_db(|op| match op {
        DbOp::AllPkgs => Ok(DbValue::TextSet(
            ["FooBar".to_string()].into_iter().collect(),
        )),
        DbOp::GetAliases { .. } => Ok(DbValue::TextSet(
            ["foo-bar".to_string()].into_iter().collect(),
        )),
        DbOp::ProjFiles { .. } => Ok(DbValue::ProjectFiles(vec![ProjectFileRow {
            version: "0.1".to_string(),
            filename: "FooBar-0.1-cp34-cp34m-linux_armv7l.whl".to_string(),
            filesize: 123456,
            filehash: "c3be25a".to_string(),
            yanked: false,
        }])),
        other => default_db(other),
    }));
    let (input_tx, input_rx) = mpsc::channel(100);
    let writer = PageWriter::new(
        ctrl,
        db,
        input_rx,
        output.path().to_path_buf(),
        url::Url::parse("https://wheels.example.org/").unwrap(),
    )
    .unwrap();
    let handle = spawn("page-writer", ctrl_tx, sup_tx, writer.run());

    input_tx
        .send(WebRequest::PkgBoth("FooBar".to_string()))
        .await
        .unwrap();

    let index = output.path().join("simple/FooBar/index.html");
    wait_for("the package index", || index.exists()).await;
    let html = std::fs::read_to_string(&index).unwrap();
    assert!(html.contains("#sha256=c3be25a"));
    assert!(html.contains("FooBar-0.1-cp34-cp34m-linux_armv7l.whl"));

    // The canonicalized name links to the real directory.
    let canonical = output.path().join("simple/foobar");
    wait_for("the canonical symlink", || {
        canonical.symlink_metadata().is_ok()
    })
    .await;
    assert!(canonical.symlink_metadata().unwrap().is_symlink());

    // The colliding alias is left alone.
    let alias = output.path().join("simple/foo-bar");
    assert!(!alias.symlink_metadata().unwrap().is_symlink());
    assert!(alias.join("sentinel").exists());

    // The output tree skeleton and startup pages exist.
    for page in ["index.html", "faq.html", "packages.html", "stats.html", "json.html"] {
        assert!(output.path().join(page).exists(), "{page} missing");
    }
    assert!(output.path().join("project/FooBar/index.html").exists());
    assert!(output.path().join("project/FooBar/json/index.json").exists());

    handle.quit().await;
    handle.join(Duration::from_secs(5)).await;
}
