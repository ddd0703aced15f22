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

//! The worker-facing router: accepts an unbounded pool of build workers,
//! tracks each through its state machine (registration, assignment, file
//! transfer, verification, acknowledgement), and mirrors every transition
//! to the status feed. Messages from one worker arrive in order through its
//! connection task and are processed strictly in that order.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use wheelwright_common::model::BuildRecord;
use wheelwright_common::protocol::{StatusMessage, WebRequest, WorkerReply, WorkerRequest};
use wheelwright_common::transport::MessageStream;

use crate::db::client::DbClient;
use crate::files::FsRequest;
use crate::metrics::BUILDS_LOGGED;
use crate::queue::BuildQueue;
use crate::state::{WorkerPhase, WorkerState};
use crate::tasks::{Control, ControlChannel, Periodic};

/// How often silent workers are checked for expiry.
const EXPIRY_SWEEP: Duration = Duration::from_secs(30);

enum ConnEvent {
    Open {
        conn_id: u64,
        replies: mpsc::Sender<WorkerReply>,
    },
    Msg {
        conn_id: u64,
        request: WorkerRequest,
    },
    Closed {
        conn_id: u64,
    },
}

/// The router task. Pausing: worker messages keep draining while paused,
/// but idle workers are put to sleep instead of being assigned builds.
pub struct WorkerRouter {
    ctrl: ControlChannel,
    listener: TcpListener,
    index_url: String,
    db: DbClient,
    fs: mpsc::Sender<FsRequest>,
    web: mpsc::Sender<WebRequest>,
    status: broadcast::Sender<StatusMessage>,
    queue_rx: watch::Receiver<BuildQueue>,
    events_tx: mpsc::Sender<ConnEvent>,
    events: mpsc::Receiver<ConnEvent>,
    next_conn_id: u64,
    next_worker_id: u64,
    replies: HashMap<u64, mpsc::Sender<WorkerReply>>,
    conn_workers: HashMap<u64, u64>,
    workers: HashMap<u64, WorkerState>,
    /// (package, version, abi) currently assigned, at most one worker each.
    active: HashSet<(String, String, String)>,
    /// (package, version, abi) blocked after a failed build; cleared when
    /// the next queue snapshot arrives (the catalog has moved on by then).
    blocked: HashSet<(String, String, String)>,
    sweep: Periodic,
}

impl WorkerRouter {
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        ctrl: ControlChannel,
        addr: &str,
        index_url: String,
        db: DbClient,
        fs: mpsc::Sender<FsRequest>,
        web: mpsc::Sender<WebRequest>,
        status: broadcast::Sender<StatusMessage>,
        queue_rx: watch::Receiver<BuildQueue>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr, "worker endpoint listening");
        let (events_tx, events) = mpsc::channel(100);
        Ok(Self {
            ctrl,
            listener,
            index_url,
            db,
            fs,
            web,
            status,
            queue_rx,
            events_tx,
            events,
            next_conn_id: 0,
            // Worker id 0 is reserved for the admin import dialog.
            next_worker_id: 1,
            replies: HashMap::new(),
            conn_workers: HashMap::new(),
            workers: HashMap::new(),
            active: HashSet::new(),
            blocked: HashSet::new(),
            sweep: Periodic::starting_later(EXPIRY_SWEEP),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                ctrl = self.ctrl.next() => match ctrl {
                    Control::Quit => break,
                    Control::Kill(worker_id) => {
                        if let Some(worker) = self.workers.get_mut(&worker_id) {
                            info!(worker_id, "worker marked for termination");
                            worker.kill();
                        } else {
                            warn!(worker_id, "kill for unknown worker");
                        }
                    }
                    Control::Hello => self.replay_state(),
                    _ => {}
                },
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            let conn_id = self.next_conn_id;
                            self.next_conn_id += 1;
                            debug!(%addr, conn_id, "worker connection accepted");
                            tokio::spawn(connection(conn_id, socket, self.events_tx.clone()));
                        }
                        Err(err) => warn!(error = %err, "worker accept failed"),
                    }
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                }
                Ok(()) = self.queue_rx.changed() => {
                    // A fresh snapshot reflects all logged failures; lift the
                    // in-memory cool-down.
                    self.blocked.clear();
                }
                _ = self.sweep.tick() => {
                    self.expire_workers();
                    self.sweep.done();
                }
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Open { conn_id, replies } => {
                self.replies.insert(conn_id, replies);
            }
            ConnEvent::Msg { conn_id, request } => {
                if let Some(reply) = self.handle_request(conn_id, request).await {
                    let closed = match self.replies.get(&conn_id) {
                        Some(sender) => sender.send(reply).await.is_err(),
                        None => true,
                    };
                    if closed {
                        debug!(conn_id, "reply to a closed worker connection dropped");
                    }
                }
            }
            ConnEvent::Closed { conn_id } => {
                self.replies.remove(&conn_id);
                self.conn_workers.remove(&conn_id);
                // The worker state survives a dropped connection; expiry
                // reaps it if the worker never returns.
            }
        }
    }

    async fn handle_request(
        &mut self,
        conn_id: u64,
        request: WorkerRequest,
    ) -> Option<WorkerReply> {
        let now = Utc::now();
        if let Some(worker_id) = self.conn_workers.get(&conn_id).copied() {
            if let Some(worker) = self.workers.get_mut(&worker_id) {
                worker.seen(now);
            }
        }
        match request {
            WorkerRequest::Hello {
                timeout,
                py_version_tag,
                abi_tag,
                platform_tag,
                label,
            } => {
                let worker_id = self.next_worker_id;
                self.next_worker_id += 1;
                let worker = WorkerState::new(
                    worker_id,
                    timeout,
                    py_version_tag,
                    abi_tag,
                    platform_tag,
                    label,
                    now,
                );
                info!(
                    worker_id,
                    abi = %worker.abi_tag,
                    platform = %worker.platform_tag,
                    label = %worker.label,
                    "worker registered"
                );
                self.send_status(&worker, "HELLO");
                self.workers.insert(worker_id, worker);
                self.conn_workers.insert(conn_id, worker_id);
                Some(WorkerReply::Hello {
                    worker_id,
                    index_url: self.index_url.clone(),
                })
            }
            WorkerRequest::Idle => {
                let worker_id = self.conn_workers.get(&conn_id).copied()?;
                if self.reap_if_terminated(worker_id) {
                    return Some(WorkerReply::Die);
                }
                if self.ctrl.paused() {
                    return Some(WorkerReply::Sleep);
                }
                match self.assign(worker_id) {
                    Some((package, version)) => {
                        let worker = self.workers.get_mut(&worker_id)?;
                        worker.phase = WorkerPhase::Active;
                        worker.assignment = Some((package.clone(), version.clone()));
                        info!(worker_id, package = %package, version = %version, "build assigned");
                        self.send_status(self.workers.get(&worker_id)?, "BUILD");
                        Some(WorkerReply::Build { package, version })
                    }
                    None => Some(WorkerReply::Sleep),
                }
            }
            WorkerRequest::Built {
                success,
                duration,
                output,
                files,
            } => {
                let worker_id = self.conn_workers.get(&conn_id).copied()?;
                self.handle_built(worker_id, success, duration, output, files)
                    .await
            }
            WorkerRequest::Sent => {
                let worker_id = self.conn_workers.get(&conn_id).copied()?;
                self.handle_sent(worker_id).await
            }
            WorkerRequest::Bye => {
                let worker_id = self.conn_workers.get(&conn_id).copied()?;
                info!(worker_id, "worker said goodbye");
                self.remove_worker(worker_id);
                None
            }
        }
    }

    async fn handle_built(
        &mut self,
        worker_id: u64,
        success: bool,
        duration: Duration,
        output: String,
        files: Vec<wheelwright_common::model::FileRecord>,
    ) -> Option<WorkerReply> {
        let worker = self.workers.get_mut(&worker_id)?;
        if worker.phase != WorkerPhase::Active {
            warn!(worker_id, phase = ?worker.phase, "BUILT in unexpected phase");
            return Some(WorkerReply::Sleep);
        }
        let (package, version) = worker.assignment.clone()?;
        let build = BuildRecord {
            worker_id,
            package: package.clone(),
            version: version.clone(),
            abi_tag: worker.abi_tag.clone(),
            status: success,
            duration,
            output,
            files: files.clone(),
            build_id: None,
        };
        worker.build = Some(build);
        if success && !files.is_empty() {
            worker.phase = WorkerPhase::Transfer;
            worker.pending_files = files;
            let filename = worker.next_file()?.filename.clone();
            self.send_status(self.workers.get(&worker_id)?, "BUILT");
            if !self.expect_file(worker_id).await {
                return self.fail_current_build(worker_id, "file endpoint unavailable").await;
            }
            Some(WorkerReply::Send { filename })
        } else {
            // A failed build (or a successful one with nothing to publish)
            // goes straight to logging.
            worker.phase = WorkerPhase::Logging;
            self.send_status(self.workers.get(&worker_id)?, "BUILT");
            self.finish_build(worker_id).await
        }
    }

    async fn handle_sent(&mut self, worker_id: u64) -> Option<WorkerReply> {
        let worker = self.workers.get(&worker_id)?;
        if worker.phase != WorkerPhase::Transfer {
            warn!(worker_id, phase = ?worker.phase, "SENT in unexpected phase");
            return Some(WorkerReply::Sleep);
        }
        let package = worker.build.as_ref()?.package.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .fs
            .send(FsRequest::Verify {
                worker_id,
                package,
                reply: reply_tx,
            })
            .await
            .is_ok();
        let verified = if sent {
            reply_rx.await.unwrap_or_else(|_| Err("file server gone".to_string()))
        } else {
            Err("file endpoint unavailable".to_string())
        };
        match verified {
            Ok(()) => {
                let worker = self.workers.get_mut(&worker_id)?;
                worker.file_done();
                if worker.transfers_done() {
                    worker.phase = WorkerPhase::Logging;
                    self.finish_build(worker_id).await
                } else {
                    let filename = worker.next_file()?.filename.clone();
                    if !self.expect_file(worker_id).await {
                        return self
                            .fail_current_build(worker_id, "file endpoint unavailable")
                            .await;
                    }
                    Some(WorkerReply::Send { filename })
                }
            }
            Err(reason) => self.fail_current_build(worker_id, &reason).await,
        }
    }

    /// Registers the worker's next pending file with the file server.
    async fn expect_file(&mut self, worker_id: u64) -> bool {
        let Some(file) = self
            .workers
            .get(&worker_id)
            .and_then(|worker| worker.next_file().cloned())
        else {
            return false;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .fs
            .send(FsRequest::Expect {
                worker_id,
                file,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        matches!(reply_rx.await, Ok(Ok(())))
    }

    /// Logs the build held by the worker and returns it to IDLE. Successful
    /// builds also trigger the page rewrite and the gzipped build log.
    async fn finish_build(&mut self, worker_id: u64) -> Option<WorkerReply> {
        let worker = self.workers.get_mut(&worker_id)?;
        let build = worker.build.take()?;
        let key = (
            build.package.clone(),
            build.version.clone(),
            build.abi_tag.clone(),
        );
        let success = build.status;
        let package = build.package.clone();
        let output = build.output.clone();
        BUILDS_LOGGED
            .with_label_values(&[if success { "success" } else { "failure" }])
            .inc();
        let reply = match self.db.log_build(build).await {
            Ok(build_id) => {
                let _ = self
                    .web
                    .send(WebRequest::BuildLog { build_id, output })
                    .await;
                if success {
                    let _ = self.web.send(WebRequest::PkgBoth(package)).await;
                }
                Some(WorkerReply::Done)
            }
            Err(err) => {
                warn!(worker_id, error = %err, "failed to log build");
                Some(WorkerReply::Done)
            }
        };
        // Logged success or failure alike, this (package, version, abi)
        // stays off the menu until the next queue snapshot reflects it.
        self.blocked.insert(key.clone());
        self.active.remove(&key);
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.assignment = None;
            worker.pending_files.clear();
            worker.phase = WorkerPhase::Idle;
        }
        if let Some(worker) = self.workers.get(&worker_id) {
            self.send_status(worker, "DONE");
        }
        reply
    }

    /// Records the current build as failed (verification or transfer
    /// trouble) and returns the worker to IDLE.
    async fn fail_current_build(
        &mut self,
        worker_id: u64,
        reason: &str,
    ) -> Option<WorkerReply> {
        warn!(worker_id, reason, "build failed during transfer");
        let worker = self.workers.get_mut(&worker_id)?;
        if let Some(build) = worker.build.as_mut() {
            build.status = false;
            build.files.clear();
            build.output.push_str("\n\nmaster: ");
            build.output.push_str(reason);
        }
        worker.pending_files.clear();
        worker.phase = WorkerPhase::Logging;
        self.finish_build(worker_id).await
    }

    /// Picks the oldest unassigned, unblocked (package, version) for the
    /// worker's native ABI.
    fn assign(&mut self, worker_id: u64) -> Option<(String, String)> {
        let abi = self.workers.get(&worker_id)?.abi_tag.clone();
        let candidates: Vec<(String, String)> = self
            .queue_rx
            .borrow()
            .get(&abi)
            .cloned()
            .unwrap_or_default();
        for (package, version) in candidates {
            let key = (package.clone(), version.clone(), abi.clone());
            if self.active.contains(&key) || self.blocked.contains(&key) {
                continue;
            }
            self.active.insert(key);
            return Some((package, version));
        }
        None
    }

    /// Sends DIE to a worker the operator killed, and forgets it.
    fn reap_if_terminated(&mut self, worker_id: u64) -> bool {
        let terminated = self
            .workers
            .get(&worker_id)
            .map(|worker| worker.terminated)
            .unwrap_or(false);
        if terminated {
            self.remove_worker(worker_id);
        }
        terminated
    }

    fn expire_workers(&mut self) {
        let now = Utc::now();
        let expired: Vec<u64> = self
            .workers
            .values()
            .filter(|worker| worker.expired(now))
            .map(|worker| worker.worker_id)
            .collect();
        for worker_id in expired {
            warn!(worker_id, "worker expired");
            if let Some(worker) = self.workers.get(&worker_id) {
                self.send_status(worker, "EXPIRED");
            }
            self.remove_worker(worker_id);
        }
    }

    /// Releases any in-flight assignment back into the queue and drops the
    /// worker's state.
    fn remove_worker(&mut self, worker_id: u64) {
        if let Some(worker) = self.workers.remove(&worker_id) {
            if let Some((ref package, ref version)) = worker.assignment {
                self.active.remove(&(package.clone(), version.clone(), worker.abi_tag.clone()));
            }
            self.send_status(&worker, "DEAD");
        }
        self.conn_workers.retain(|_, mapped| *mapped != worker_id);
    }

    /// Replays the state of every live worker to a freshly connected
    /// monitor.
    fn replay_state(&self) {
        for worker in self.workers.values() {
            self.send_status(worker, "HELLO");
        }
    }

    fn send_status(&self, worker: &WorkerState, message: &str) {
        // Laggy subscribers miss messages; that is the fan-out contract.
        let _ = self.status.send(StatusMessage::Worker {
            worker_id: worker.worker_id,
            timestamp: Utc::now(),
            message: message.to_string(),
            data: json!({
                "abi_tag": worker.abi_tag,
                "platform_tag": worker.platform_tag,
                "label": worker.label,
                "phase": format!("{:?}", worker.phase),
                "assignment": worker.assignment,
            }),
        });
    }
}

/// Per-connection pump: strict request/reply with the worker on the other
/// end. Requests are forwarded to the router in arrival order; the reply is
/// written back on the same connection.
async fn connection(conn_id: u64, socket: TcpStream, events: mpsc::Sender<ConnEvent>) {
    let mut stream: MessageStream<WorkerRequest, WorkerReply, _> = MessageStream::new(socket);
    let (replies_tx, mut replies) = mpsc::channel::<WorkerReply>(10);
    if events
        .send(ConnEvent::Open {
            conn_id,
            replies: replies_tx,
        })
        .await
        .is_err()
    {
        return;
    }
    loop {
        tokio::select! {
            Some(reply) = replies.recv() => {
                if stream.send(&reply).await.is_err() {
                    break;
                }
            }
            request = stream.recv() => {
                match request {
                    Ok(request) => {
                        if events
                            .send(ConnEvent::Msg { conn_id, request })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) if err.is_recoverable() => {
                        // Schema or codec trouble never kills the endpoint.
                        warn!(conn_id, error = %err, "bad message from worker");
                    }
                    Err(_) => break,
                }
            }
        }
    }
    let _ = events.send(ConnEvent::Closed { conn_id }).await;
}
