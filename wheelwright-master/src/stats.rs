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

//! The statistics aggregator: once a minute it combines catalog counters
//! from the database with process and filesystem measurements, publishes
//! the result to the page writer and the external status feed, and feeds
//! the search index. External agents may contribute filesystem and queue
//! measurements out of band, which beats measuring remote mounts locally.

use std::collections::BTreeMap;
use std::path::PathBuf;

use sysinfo::{Disks, System};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use wheelwright_common::protocol::{StatsRequest, StatusMessage, WebRequest};

use crate::config::StatsConfig;
use crate::db::client::DbClient;
use crate::tasks::{Control, ControlChannel, Periodic};

/// The aggregator task. Pauseable: a paused master simply stops publishing
/// fresh statistics.
pub struct StatsAggregator {
    ctrl: ControlChannel,
    db: DbClient,
    input: mpsc::Receiver<StatsRequest>,
    web: mpsc::Sender<WebRequest>,
    status: broadcast::Sender<StatusMessage>,
    output_path: PathBuf,
    tick: Periodic,
    system: System,
    /// Latest out-of-band filesystem measurement, if any.
    statfs: Option<(u64, u64)>,
    /// Latest per-ABI queue sizes from the queue generator.
    statbq: BTreeMap<String, i64>,
}

impl StatsAggregator {
    pub fn new(
        ctrl: ControlChannel,
        config: &StatsConfig,
        db: DbClient,
        input: mpsc::Receiver<StatsRequest>,
        web: mpsc::Sender<WebRequest>,
        status: broadcast::Sender<StatusMessage>,
        output_path: PathBuf,
    ) -> Self {
        Self {
            ctrl,
            db,
            input,
            web,
            status,
            output_path,
            tick: Periodic::starting_later(config.interval),
            system: System::new(),
            statfs: None,
            statbq: BTreeMap::new(),
        }
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
                Some(request) = self.input.recv() => {
                    match request {
                        StatsRequest::StatFs { disk_size, disk_free } => {
                            self.statfs = Some((disk_size, disk_free));
                        }
                        StatsRequest::StatBq(sizes) => {
                            self.statbq = sizes;
                        }
                        StatsRequest::Home => {
                            self.tick.force();
                        }
                    }
                }
                _ = self.tick.tick() => {
                    if let Err(err) = self.publish().await {
                        warn!(error = %format!("{err:#}"), "statistics cycle failed");
                    }
                    self.tick.done();
                }
            }
        }
        Ok(())
    }

    async fn publish(&mut self) -> anyhow::Result<()> {
        let mut statistics = self.db.get_statistics().await?;
        statistics.builds_pending = self.statbq.clone();
        let (disk_size, disk_free) = self.disk_stats();
        statistics.disk_size = disk_size;
        statistics.disk_free = disk_free;
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();
        statistics.mem_size = self.system.total_memory();
        statistics.mem_free = self.system.available_memory();
        statistics.cpu_load = System::load_average().one as f32;
        let _ = self
            .status
            .send(StatusMessage::Stats(statistics.clone()));
        if self.web.send(WebRequest::Home(statistics)).await.is_err() {
            warn!("web queue closed");
        }
        let index = self.db.get_search_index().await?;
        if self.web.send(WebRequest::Search(index)).await.is_err() {
            warn!("web queue closed");
        }
        Ok(())
    }

    /// Size and free space of the filesystem holding the output tree. An
    /// out-of-band STATFS report wins over the local measurement.
    fn disk_stats(&self) -> (u64, u64) {
        if let Some(reported) = self.statfs {
            return reported;
        }
        let disks = Disks::new_with_refreshed_list();
        let mut best: Option<(usize, u64, u64)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if self.output_path.starts_with(mount) {
                let depth = mount.components().count();
                if best.map(|(d, _, _)| depth > d).unwrap_or(true) {
                    best = Some((depth, disk.total_space(), disk.available_space()));
                }
            }
        }
        best.map(|(_, size, free)| (size, free)).unwrap_or((0, 0))
    }
}
