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

//! The build-queue generator: periodically derives the per-ABI pending
//! queue from the catalog and publishes the newest snapshot to the worker
//! router. The underlying query is long on a large catalog, so QUIT races
//! the in-flight statement and wins.

use std::collections::BTreeMap;

use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use wheelwright_common::protocol::StatsRequest;

use crate::config::QueueConfig;
use crate::tasks::{Control, ControlChannel, Periodic};

/// `{abi: [(package, version), …]}`, oldest release first.
pub type BuildQueue = BTreeMap<String, Vec<(String, String)>>;

pub struct QueueBuilder {
    ctrl: ControlChannel,
    pool: PgPool,
    queue_tx: watch::Sender<BuildQueue>,
    kick: mpsc::Receiver<()>,
    stats: mpsc::Sender<StatsRequest>,
    refresh: Periodic,
}

impl QueueBuilder {
    pub fn new(
        ctrl: ControlChannel,
        config: &QueueConfig,
        pool: PgPool,
        queue_tx: watch::Sender<BuildQueue>,
        kick: mpsc::Receiver<()>,
        stats: mpsc::Sender<StatsRequest>,
    ) -> Self {
        Self {
            ctrl,
            pool,
            queue_tx,
            kick,
            stats,
            refresh: Periodic::new(config.refresh_interval),
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                ctrl = self.ctrl.next() => {
                    if ctrl == Control::Quit {
                        break;
                    }
                }
                Some(()) = self.kick.recv() => {
                    // A catalog-changing event; refresh at the next poll.
                    self.refresh.force();
                }
                _ = self.refresh.tick() => {
                    if self.rebuild().await {
                        break;
                    }
                    self.refresh.done();
                }
            }
        }
        Ok(())
    }

    /// Runs the pending-builds query, racing it against QUIT; returns true
    /// when the task should exit. Dropping the query future aborts the
    /// statement, so shutdown is never blocked on a long scan.
    async fn rebuild(&mut self) -> bool {
        let query = fetch_queue(&self.pool);
        tokio::pin!(query);
        loop {
            tokio::select! {
                ctrl = self.ctrl.next() => {
                    if ctrl == Control::Quit {
                        return true;
                    }
                }
                result = &mut query => {
                    match result {
                        Ok(queue) => {
                            let sizes: BTreeMap<String, i64> = queue
                                .iter()
                                .map(|(abi, entries)| (abi.clone(), entries.len() as i64))
                                .collect();
                            debug!(pending = sizes.values().sum::<i64>(), "queue refreshed");
                            let _ = self.stats.try_send(StatsRequest::StatBq(sizes));
                            self.queue_tx.send_replace(queue);
                        }
                        Err(err) => {
                            warn!(error = %err, "pending-builds query failed");
                        }
                    }
                    return false;
                }
            }
        }
    }
}

async fn fetch_queue(pool: &PgPool) -> Result<BuildQueue, sqlx::Error> {
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        r#"
        SELECT abi_tag, package, version
        FROM builds_pending
        ORDER BY abi_tag, released, package, version
        "#,
    )
    .fetch_all(pool)
    .await?;
    let mut queue = BuildQueue::new();
    for (abi, package, version) in rows {
        queue.entry(abi).or_default().push((package, version));
    }
    Ok(queue)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
    use test_r::test;
    use tokio::time::Instant;

    use super::*;
    use crate::config::QueueConfig;
    use crate::tasks::{control_channel, spawn, PauseMode};

    /// A pool whose connections never come up: the target address is a
    /// blackhole, so acquiring a connection (and with it the pending-builds
    /// query) stays in flight until the acquire timeout, far longer than
    /// any test below runs.
    fn unreachable_pool() -> PgPool {
        PgPoolOptions::new()
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy_with(
                PgConnectOptions::new()
                    .host("10.255.255.1")
                    .port(5432)
                    .database("unreachable")
                    .username("nobody"),
            )
    }

    fn builder(ctrl: ControlChannel) -> (QueueBuilder, mpsc::Sender<()>, mpsc::Receiver<StatsRequest>) {
        let (queue_tx, _queue_rx) = watch::channel(BuildQueue::new());
        let (kick_tx, kick_rx) = mpsc::channel(1);
        let (stats_tx, stats_rx) = mpsc::channel(10);
        let config = QueueConfig {
            refresh_interval: Duration::from_secs(300),
        };
        (
            QueueBuilder::new(ctrl, &config, unreachable_pool(), queue_tx, kick_rx, stats_tx),
            kick_tx,
            stats_rx,
        )
    }

    #[test]
    async fn quit_wins_the_race_against_an_in_flight_query() {
        let (ctrl_tx, ctrl) = control_channel("queue-builder", PauseMode::NonStop);
        let (mut task, _kick_tx, _stats_rx) = builder(ctrl);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ctrl_tx.send(Control::Quit).await.unwrap();
        });
        let started = Instant::now();
        assert!(task.rebuild().await, "QUIT must abort the query");
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "the in-flight query held up shutdown"
        );
    }

    #[test]
    async fn shutdown_during_a_long_query_is_prompt() {
        let (sup_tx, _sup_rx) = mpsc::channel(1);
        let (ctrl_tx, ctrl) = control_channel("queue-builder", PauseMode::NonStop);
        let (task, _kick_tx, _stats_rx) = builder(ctrl);
        let handle = spawn("queue-builder", ctrl_tx, sup_tx, task.run());
        // The first refresh is due immediately; give the query a moment to
        // get in flight before pulling the plug.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        handle.quit().await;
        handle.join(Duration::from_secs(10)).await;
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "the task did not stop within the poll interval"
        );
    }
}
