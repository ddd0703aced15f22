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

//! The supervisor: builds the channel fabric, starts every task leaves
//! first, serves the external control endpoint and the status fan-out, and
//! tears everything down in reverse order on QUIT or a fatal task error.

use std::time::Duration;

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use wheelwright_common::protocol::{MasterControl, StatusMessage};
use wheelwright_common::transport::MessageStream;

use crate::accesslog::LogIngest;
use crate::admin::AdminEndpoint;
use crate::coalescer::WebCoalescer;
use crate::config::MasterConfig;
use crate::db::client::DbClient;
use crate::db::gateway::DbGateway;
use crate::db::ops::{check_schema_version, create_postgres_pool, migrate, DbOperations};
use crate::db::worker::DbWorker;
use crate::db::DB_HWM;
use crate::files::FileServer;
use crate::index::{HttpEventSource, IndexPoller};
use crate::queue::{BuildQueue, QueueBuilder};
use crate::stats::StatsAggregator;
use crate::tasks::{control_channel, spawn, Control, PauseMode, TaskHandle};
use crate::web::PageWriter;
use crate::workers::WorkerRouter;

/// How long each task gets to stop before it is aborted.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Hold interval used when `dev_mode` is on.
const DEV_HOLD: Duration = Duration::from_secs(3);

pub async fn run(config: MasterConfig) -> anyhow::Result<()> {
    info!(version = crate::VERSION, "master starting");

    let pool = create_postgres_pool(&config.db).await?;
    migrate(&pool).await?;
    check_schema_version(&pool, crate::VERSION).await?;

    // The channel fabric. Small high-water marks everywhere: senders feel
    // backpressure instead of the master ballooning.
    let (db_front_tx, db_front_rx) = mpsc::channel(DB_HWM);
    let (db_ready_tx, db_ready_rx) = mpsc::channel(config.db_workers.max(1) + 1);
    let (web_tx, web_rx) = mpsc::channel(100);
    let (writer_queue_tx, writer_queue_rx) = mpsc::channel(100);
    let (queue_tx, queue_rx) = watch::channel(BuildQueue::new());
    let (kick_tx, kick_rx) = mpsc::channel(1);
    let (stats_tx, stats_rx) = mpsc::channel(100);
    let (fs_tx, fs_rx) = mpsc::channel(10);
    let (status_tx, _) = broadcast::channel(100);
    let (failures_tx, mut failures_rx) = mpsc::channel(10);
    let (external_tx, mut external_rx) = mpsc::channel(10);

    let db_client = DbClient::new(db_front_tx.clone());
    let mut handles: Vec<TaskHandle> = Vec::new();
    let ops = DbOperations::new(pool.clone());

    // Database layer first; everything else talks through it.
    let (gateway_tx, gateway_ctrl) = control_channel("db-gateway", PauseMode::NonStop);
    handles.push(spawn(
        "db-gateway",
        gateway_tx,
        failures_tx.clone(),
        DbGateway::new(gateway_ctrl, db_front_rx, db_ready_rx).run(),
    ));
    for index in 0..config.db_workers.max(1) {
        let name: &'static str = Box::leak(format!("db-worker-{index}").into_boxed_str());
        let (worker_tx, worker_ctrl) = control_channel(name, PauseMode::NonStop);
        handles.push(spawn(
            name,
            worker_tx,
            failures_tx.clone(),
            DbWorker::new(worker_ctrl, ops.clone(), db_ready_tx.clone()).run(),
        ));
    }

    // The file server must exist before any worker can transfer.
    let (fileserver_tx, fileserver_ctrl) = control_channel("file-server", PauseMode::NonStop);
    let file_server = FileServer::bind(
        fileserver_ctrl,
        config.transfers.clone(),
        config.output_path.clone(),
        &config.endpoints.file_addr,
        fs_rx,
    )
    .await?;
    handles.push(spawn(
        "file-server",
        fileserver_tx,
        failures_tx.clone(),
        file_server.run(),
    ));

    let (writer_tx, writer_ctrl) = control_channel("page-writer", PauseMode::Pauseable);
    let page_writer = PageWriter::new(
        writer_ctrl,
        db_client.clone(),
        writer_queue_rx,
        config.output_path.clone(),
        config.web.site_url.clone(),
    )?;
    handles.push(spawn(
        "page-writer",
        writer_tx,
        failures_tx.clone(),
        page_writer.run(),
    ));

    let hold = if config.dev_mode {
        DEV_HOLD
    } else {
        config.web.hold
    };
    let (coalescer_tx, coalescer_ctrl) = control_channel("web-coalescer", PauseMode::Pausing);
    handles.push(spawn(
        "web-coalescer",
        coalescer_tx,
        failures_tx.clone(),
        WebCoalescer::new(coalescer_ctrl, db_client.clone(), web_rx, writer_queue_tx, hold).run(),
    ));

    let (stats_ctrl_tx, stats_ctrl) = control_channel("stats", PauseMode::Pauseable);
    handles.push(spawn(
        "stats",
        stats_ctrl_tx,
        failures_tx.clone(),
        StatsAggregator::new(
            stats_ctrl,
            &config.stats,
            db_client.clone(),
            stats_rx,
            web_tx.clone(),
            status_tx.clone(),
            config.output_path.clone(),
        )
        .run(),
    ));

    let (router_tx, router_ctrl) = control_channel("worker-router", PauseMode::Pausing);
    let router_control = router_tx.clone();
    let worker_router = WorkerRouter::bind(
        router_ctrl,
        &config.endpoints.worker_addr,
        config.index.root_url.to_string(),
        db_client.clone(),
        fs_tx.clone(),
        web_tx.clone(),
        status_tx.clone(),
        queue_rx,
    )
    .await?;
    handles.push(spawn(
        "worker-router",
        router_tx,
        failures_tx.clone(),
        worker_router.run(),
    ));

    let (queue_ctrl_tx, queue_ctrl) = control_channel("queue-builder", PauseMode::NonStop);
    handles.push(spawn(
        "queue-builder",
        queue_ctrl_tx,
        failures_tx.clone(),
        QueueBuilder::new(
            queue_ctrl,
            &config.queue,
            pool.clone(),
            queue_tx,
            kick_rx,
            stats_tx.clone(),
        )
        .run(),
    ));

    let (poller_tx, poller_ctrl) = control_channel("index-poller", PauseMode::Pauseable);
    handles.push(spawn(
        "index-poller",
        poller_tx,
        failures_tx.clone(),
        IndexPoller::new(
            poller_ctrl,
            &config.index,
            db_client.clone(),
            Box::new(HttpEventSource::new(config.index.events_url.clone())),
            web_tx.clone(),
            kick_tx,
        )
        .run(),
    ));

    let (log_tx, log_ctrl) = control_channel("log-ingest", PauseMode::Pauseable);
    let log_ingest = LogIngest::bind(log_ctrl, &config.endpoints.log_path, db_client.clone())?;
    handles.push(spawn(
        "log-ingest",
        log_tx,
        failures_tx.clone(),
        log_ingest.run(),
    ));

    let (admin_tx, admin_ctrl) = control_channel("admin", PauseMode::NonStop);
    let admin = AdminEndpoint::bind(
        admin_ctrl,
        &config.endpoints.admin_path,
        db_client.clone(),
        web_tx.clone(),
        fs_tx.clone(),
        stats_tx.clone(),
    )?;
    handles.push(spawn("admin", admin_tx, failures_tx.clone(), admin.run()));

    let (status_srv_tx, status_srv_ctrl) = control_channel("status-endpoint", PauseMode::NonStop);
    let status_listener = TcpListener::bind(&config.endpoints.status_addr).await?;
    info!(addr = %config.endpoints.status_addr, "status endpoint listening");
    handles.push(spawn(
        "status-endpoint",
        status_srv_tx,
        failures_tx.clone(),
        status_endpoint(status_srv_ctrl, status_listener, status_tx.clone()),
    ));

    let (control_srv_tx, control_srv_ctrl) = control_channel("control-endpoint", PauseMode::NonStop);
    let control_listener = {
        let _ = std::fs::remove_file(&config.endpoints.control_path);
        UnixListener::bind(&config.endpoints.control_path)?
    };
    info!(path = %config.endpoints.control_path.display(), "control endpoint listening");
    handles.push(spawn(
        "control-endpoint",
        control_srv_tx,
        failures_tx.clone(),
        control_endpoint(control_srv_ctrl, control_listener, external_tx.clone()),
    ));

    info!("all tasks started");

    // Wait for a reason to stop: an operator QUIT, a signal, or a fatal
    // task error.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    loop {
        tokio::select! {
            Some(ctrl) = failures_rx.recv() => {
                if ctrl == Control::Quit {
                    warn!("fatal task error, shutting down");
                    break;
                }
            }
            Some(msg) = external_rx.recv() => {
                match msg {
                    MasterControl::Hello => {
                        let _ = router_control.send(Control::Hello).await;
                    }
                    MasterControl::Pause => {
                        info!("pausing all tasks");
                        for handle in &handles {
                            handle.pause().await;
                        }
                    }
                    MasterControl::Resume => {
                        info!("resuming all tasks");
                        for handle in &handles {
                            handle.resume().await;
                        }
                    }
                    MasterControl::Kill(worker_id) => {
                        let _ = router_control.send(Control::Kill(worker_id)).await;
                    }
                    MasterControl::Quit => {
                        info!("operator requested shutdown");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("termination signal received, shutting down");
                break;
            }
        }
    }

    // Stop in reverse start order so consumers outlive their producers and
    // the database outlives everyone.
    for handle in handles.into_iter().rev() {
        handle.quit().await;
        handle.join(JOIN_TIMEOUT).await;
    }
    info!("master stopped");
    Ok(())
}

/// Fans the status feed out to TCP subscribers. Slow subscribers skip
/// messages rather than slowing the master down.
async fn status_endpoint(
    mut ctrl: crate::tasks::ControlChannel,
    listener: TcpListener,
    status: broadcast::Sender<StatusMessage>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            c = ctrl.next() => {
                if c == Control::Quit {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        debug!(%addr, "status subscriber connected");
                        let rx = status.subscribe();
                        tokio::spawn(status_subscriber(socket, rx));
                    }
                    Err(err) => warn!(error = %err, "status accept failed"),
                }
            }
        }
    }
    Ok(())
}

async fn status_subscriber(
    socket: tokio::net::TcpStream,
    mut rx: broadcast::Receiver<StatusMessage>,
) {
    // The unused inbound direction; subscribers only listen.
    let mut stream: MessageStream<(), StatusMessage, _> = MessageStream::new(socket);
    loop {
        match rx.recv().await {
            Ok(message) => {
                if stream.send(&message).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "status subscriber lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Accepts operator control messages and hands them to the supervisor
/// loop. The endpoint is one-way; there are no replies.
async fn control_endpoint(
    mut ctrl: crate::tasks::ControlChannel,
    listener: UnixListener,
    external: mpsc::Sender<MasterControl>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            c = ctrl.next() => {
                if c == Control::Quit {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, _)) => {
                        tokio::spawn(control_connection(socket, external.clone()));
                    }
                    Err(err) => warn!(error = %err, "control accept failed"),
                }
            }
        }
    }
    Ok(())
}

async fn control_connection(
    socket: tokio::net::UnixStream,
    external: mpsc::Sender<MasterControl>,
) {
    let mut stream: MessageStream<MasterControl, (), _> = MessageStream::new(socket);
    loop {
        match stream.recv().await {
            Ok(message) => {
                if external.send(message).await.is_err() {
                    break;
                }
            }
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, "bad control message");
            }
            Err(_) => break,
        }
    }
}
