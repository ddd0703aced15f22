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

//! Ingest of access-log records from the HTTP front-end's logger process.
//! The parsing of raw web-server logs happens out there; this task just
//! persists the typed records and keeps an eye on the ingest rate.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wheelwright_common::protocol::AccessRecord;
use wheelwright_common::transport::MessageStream;

use crate::db::client::DbClient;
use crate::metrics::ACCESS_RECORDS;
use crate::tasks::{Control, ControlChannel, Periodic};

/// Replies are never sent on the log endpoint; this stands in for the
/// message type of the unused direction.
type NoReply = ();

/// The log-ingest task. Pauseable: while paused, records back up in the
/// bounded channel and the loggers block, which is the intended
/// backpressure.
pub struct LogIngest {
    ctrl: ControlChannel,
    listener: UnixListener,
    db: DbClient,
    records_tx: mpsc::Sender<AccessRecord>,
    records: mpsc::Receiver<AccessRecord>,
    counters: BTreeMap<&'static str, u64>,
    report: Periodic,
}

impl LogIngest {
    pub fn bind(ctrl: ControlChannel, path: &PathBuf, db: DbClient) -> anyhow::Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "log endpoint listening");
        let (records_tx, records) = mpsc::channel(100);
        Ok(Self {
            ctrl,
            listener,
            db,
            records_tx,
            records,
            counters: BTreeMap::new(),
            report: Periodic::starting_later(Duration::from_secs(60)),
        })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                ctrl = self.ctrl.next() => match ctrl {
                    Control::Quit => break,
                    Control::Pause => {
                        if self.ctrl.wait_resume().await == Control::Quit {
                            break;
                        }
                    }
                    _ => {}
                },
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, _)) => {
                            tokio::spawn(connection(socket, self.records_tx.clone()));
                        }
                        Err(err) => warn!(error = %err, "log accept failed"),
                    }
                }
                Some(record) = self.records.recv() => {
                    self.store(record).await;
                }
                _ = self.report.tick() => {
                    self.report_counters();
                    self.report.done();
                }
            }
        }
        Ok(())
    }

    async fn store(&mut self, record: AccessRecord) {
        let (kind, result) = match record {
            AccessRecord::Download(record) => ("downloads", self.db.log_download(record).await),
            AccessRecord::Search(record) => ("searches", self.db.log_search(record).await),
            AccessRecord::Project(record) => {
                ("project hits", self.db.log_project_hit(record).await)
            }
            AccessRecord::Json(record) => ("JSON hits", self.db.log_json_hit(record).await),
            AccessRecord::Page(record) => ("page hits", self.db.log_page_hit(record).await),
        };
        match result {
            Ok(()) => {
                ACCESS_RECORDS.with_label_values(&[kind]).inc();
                *self.counters.entry(kind).or_insert(0) += 1;
            }
            Err(err) => warn!(kind, error = %err, "failed to store access record"),
        }
    }

    /// Logs and resets the per-minute ingest counters.
    fn report_counters(&mut self) {
        for (kind, count) in &self.counters {
            if *count > 0 {
                info!(kind, count, "records logged in the last minute");
            }
        }
        self.counters.clear();
    }
}

/// Per-connection pump; the endpoint is strictly one-way.
async fn connection(socket: UnixStream, records: mpsc::Sender<AccessRecord>) {
    let mut stream: MessageStream<AccessRecord, NoReply, _> = MessageStream::new(socket);
    loop {
        match stream.recv().await {
            Ok(record) => {
                if records.send(record).await.is_err() {
                    break;
                }
            }
            Err(err) if err.is_recoverable() => {
                debug!(error = %err, "bad access record");
            }
            Err(_) => break,
        }
    }
}
