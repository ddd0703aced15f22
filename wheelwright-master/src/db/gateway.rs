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

//! The database gateway: a strict least-recently-used balancer matching
//! client requests to ready workers. When no worker is ready, requests wait
//! in the bounded front channel, which is the backpressure senders feel.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::debug;

use crate::metrics::DB_REQUESTS;
use crate::tasks::{Control, ControlChannel};

use super::DbRequest;

pub struct DbGateway {
    ctrl: ControlChannel,
    front: mpsc::Receiver<DbRequest>,
    ready: mpsc::Receiver<mpsc::Sender<DbRequest>>,
    idle: VecDeque<mpsc::Sender<DbRequest>>,
}

impl DbGateway {
    pub fn new(
        ctrl: ControlChannel,
        front: mpsc::Receiver<DbRequest>,
        ready: mpsc::Receiver<mpsc::Sender<DbRequest>>,
    ) -> Self {
        Self {
            ctrl,
            front,
            ready,
            idle: VecDeque::new(),
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
                Some(worker) = self.ready.recv() => {
                    self.idle.push_back(worker);
                }
                request = self.front.recv(), if !self.idle.is_empty() => {
                    let Some(request) = request else { break };
                    DB_REQUESTS.inc();
                    self.dispatch(request).await;
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, request: DbRequest) {
        // The front arm is only enabled when a worker is idle, but a worker
        // may have gone away since it registered; skip dead senders.
        let mut request = request;
        while let Some(worker) = self.idle.pop_front() {
            match worker.send(request).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    debug!("dropping a dead database worker");
                    request = returned;
                }
            }
        }
        // No live worker accepted it; the caller sees a closed reply channel.
    }
}
