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

//! A database worker: announces readiness to the gateway, executes one
//! request at a time, replies directly to the originating client, and
//! re-registers. Workers are NonStop tasks; the database must keep serving
//! while the rest of the master is paused.

use tokio::sync::mpsc;
use tracing::error;

use crate::tasks::{Control, ControlChannel};

use super::ops::DbOperations;
use super::DbRequest;

pub struct DbWorker {
    ctrl: ControlChannel,
    ops: DbOperations,
    requests_tx: mpsc::Sender<DbRequest>,
    requests: mpsc::Receiver<DbRequest>,
    ready: mpsc::Sender<mpsc::Sender<DbRequest>>,
}

impl DbWorker {
    pub fn new(
        ctrl: ControlChannel,
        ops: DbOperations,
        ready: mpsc::Sender<mpsc::Sender<DbRequest>>,
    ) -> Self {
        // Capacity 1: a worker holds at most the single request the gateway
        // matched to it.
        let (requests_tx, requests) = mpsc::channel(1);
        Self {
            ctrl,
            ops,
            requests_tx,
            requests,
            ready,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        if self.ready.send(self.requests_tx.clone()).await.is_err() {
            return Ok(());
        }
        loop {
            tokio::select! {
                ctrl = self.ctrl.next() => {
                    if ctrl == Control::Quit {
                        break;
                    }
                }
                Some(request) = self.requests.recv() => {
                    let result = self.ops.execute(request.op).await;
                    if let Err(err) = &result {
                        error!(error = %err, "database operation failed");
                    }
                    let _ = request.reply.send(result);
                    if self.ready.send(self.requests_tx.clone()).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
