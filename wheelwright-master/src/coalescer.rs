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

//! Buffers page-rewrite requests so bursts of duplicate work collapse into
//! one rewrite. Requests to rewrite a package's pages can come thick and
//! fast while a new version registers file after file; there is no point
//! writing the same project page five times in as many seconds.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};
use wheelwright_common::model::{RewriteCommand, RewritePending};
use wheelwright_common::protocol::WebRequest;

use crate::db::client::DbClient;
use crate::tasks::{Control, ControlChannel, Periodic};

/// The coalescer task. Pausing: input keeps draining into the buffer while
/// paused, but nothing is forwarded downstream.
pub struct WebCoalescer {
    ctrl: ControlChannel,
    db: DbClient,
    input: mpsc::Receiver<WebRequest>,
    output: mpsc::Sender<WebRequest>,
    hold: Duration,
    buffer: VecDeque<(String, DateTime<Utc>)>,
    commands: HashMap<String, RewriteCommand>,
    flush: Periodic,
}

impl WebCoalescer {
    pub fn new(
        ctrl: ControlChannel,
        db: DbClient,
        input: mpsc::Receiver<WebRequest>,
        output: mpsc::Sender<WebRequest>,
        hold: Duration,
    ) -> Self {
        Self {
            ctrl,
            db,
            input,
            output,
            hold,
            buffer: VecDeque::new(),
            commands: HashMap::new(),
            flush: Periodic::new(Duration::from_secs(1)),
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.restore().await;
        loop {
            tokio::select! {
                ctrl = self.ctrl.next() => {
                    if ctrl == Control::Quit {
                        break;
                    }
                }
                Some(request) = self.input.recv() => {
                    self.handle_input(request).await;
                }
                _ = self.flush.tick() => {
                    self.flush_due(Utc::now());
                    self.flush.done();
                }
            }
        }
        self.persist().await;
        Ok(())
    }

    /// Reloads the buffer persisted by the previous run.
    async fn restore(&mut self) {
        match self.db.load_rewrites_pending().await {
            Ok(rewrites) => {
                info!(count = rewrites.len(), "restored buffered rewrites");
                for rewrite in rewrites {
                    self.buffer
                        .push_back((rewrite.package.clone(), rewrite.added_at));
                    self.commands.insert(rewrite.package, rewrite.command);
                }
            }
            Err(err) => warn!(error = %err, "failed to restore buffered rewrites"),
        }
    }

    /// Stores the buffer so pending rewrites survive the restart.
    async fn persist(&mut self) {
        let rewrites: Vec<RewritePending> = self
            .buffer
            .iter()
            .filter_map(|(package, added_at)| {
                self.commands.get(package).map(|command| RewritePending {
                    package: package.clone(),
                    added_at: *added_at,
                    command: *command,
                })
            })
            .collect();
        info!(count = rewrites.len(), "storing buffered rewrites");
        if let Err(err) = self.db.save_rewrites_pending(rewrites).await {
            warn!(error = %err, "failed to store buffered rewrites");
        }
    }

    async fn handle_input(&mut self, request: WebRequest) {
        match request {
            WebRequest::PkgProj(package) => self.buffer_request(package, RewriteCommand::Project),
            WebRequest::PkgBoth(package) => self.buffer_request(package, RewriteCommand::Both),
            // Everything else is rare enough that buffering buys nothing.
            other => {
                if self.output.send(other).await.is_err() {
                    warn!("page writer queue closed");
                }
            }
        }
    }

    fn buffer_request(&mut self, package: String, command: RewriteCommand) {
        match self.commands.get_mut(&package) {
            Some(existing) => {
                // Upgrade a pending PROJECT to BOTH but keep the original
                // timestamp; duplicates collapse entirely.
                if command == RewriteCommand::Both {
                    *existing = RewriteCommand::Both;
                }
            }
            None => {
                self.buffer.push_back((package.clone(), Utc::now()));
                self.commands.insert(package, command);
            }
        }
    }

    /// Forwards entries older than the hold interval, as long as the
    /// downstream queue accepts them without blocking.
    fn flush_due(&mut self, now: DateTime<Utc>) {
        if self.ctrl.paused() {
            return;
        }
        let hold = TimeDelta::from_std(self.hold).unwrap_or_else(|_| TimeDelta::seconds(60));
        while let Some((package, added_at)) = self.buffer.front().cloned() {
            if now - added_at <= hold {
                break;
            }
            let Some(command) = self.commands.get(&package).copied() else {
                self.buffer.pop_front();
                continue;
            };
            let request = match command {
                RewriteCommand::Project => WebRequest::PkgProj(package.clone()),
                RewriteCommand::Both => WebRequest::PkgBoth(package.clone()),
            };
            match self.output.try_send(request) {
                Ok(()) => {
                    self.buffer.pop_front();
                    self.commands.remove(&package);
                }
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Closed(_)) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use test_r::test;

    use super::*;
    use crate::tasks::{control_channel, PauseMode};

    fn coalescer(
        hold: Duration,
    ) -> (
        WebCoalescer,
        mpsc::Sender<WebRequest>,
        mpsc::Receiver<WebRequest>,
        mpsc::Sender<Control>,
    ) {
        let (ctrl_tx, ctrl) = control_channel("coalescer", PauseMode::Pausing);
        let (db_tx, _db_rx) = mpsc::channel(1);
        let db = DbClient::new(db_tx);
        let (input_tx, input) = mpsc::channel(100);
        let (output_tx, output_rx) = mpsc::channel(100);
        (
            WebCoalescer::new(ctrl, db, input, output_tx, hold),
            input_tx,
            output_rx,
            ctrl_tx,
        )
    }

    #[test]
    async fn duplicates_collapse_and_both_supersedes_project() {
        let (mut task, _input, mut output, _ctrl) = coalescer(Duration::from_secs(10));
        task.handle_input(WebRequest::PkgProj("foo".to_string())).await;
        let first_added = task.buffer[0].1;
        task.handle_input(WebRequest::PkgProj("foo".to_string())).await;
        task.handle_input(WebRequest::PkgBoth("foo".to_string())).await;
        assert_eq!(task.buffer.len(), 1);
        assert_eq!(task.buffer[0].1, first_added, "timestamp survives the upgrade");
        // Nothing leaves before the hold expires.
        task.flush_due(first_added + TimeDelta::seconds(5));
        assert!(output.try_recv().is_err());
        // After the hold, exactly one PKGBOTH emerges.
        task.flush_due(first_added + TimeDelta::seconds(11));
        assert_eq!(
            output.try_recv().unwrap(),
            WebRequest::PkgBoth("foo".to_string())
        );
        assert!(output.try_recv().is_err());
        assert!(task.buffer.is_empty());
    }

    #[test]
    async fn home_and_search_pass_through_immediately() {
        let (mut task, _input, mut output, _ctrl) = coalescer(Duration::from_secs(60));
        task.handle_input(WebRequest::Home(Default::default())).await;
        task.handle_input(WebRequest::Search(Default::default())).await;
        assert!(matches!(output.try_recv().unwrap(), WebRequest::Home(_)));
        assert!(matches!(output.try_recv().unwrap(), WebRequest::Search(_)));
        assert!(task.buffer.is_empty());
    }

    #[test]
    async fn entries_flush_in_submission_order() {
        let (mut task, _input, mut output, _ctrl) = coalescer(Duration::from_secs(1));
        task.handle_input(WebRequest::PkgProj("alpha".to_string())).await;
        task.handle_input(WebRequest::PkgBoth("beta".to_string())).await;
        let added = task.buffer[0].1;
        task.flush_due(added + TimeDelta::seconds(5));
        assert_eq!(
            output.try_recv().unwrap(),
            WebRequest::PkgProj("alpha".to_string())
        );
        assert_eq!(
            output.try_recv().unwrap(),
            WebRequest::PkgBoth("beta".to_string())
        );
    }

    #[test]
    async fn paused_coalescer_accepts_but_sends_nothing() {
        let (mut task, _input, mut output, ctrl_tx) = coalescer(Duration::from_secs(1));
        ctrl_tx.send(Control::Pause).await.unwrap();
        ctrl_tx.send(Control::Quit).await.unwrap();
        // Drain the control channel so the Pausing flag is set.
        assert_eq!(task.ctrl.next().await, Control::Quit);
        task.handle_input(WebRequest::PkgProj("foo".to_string())).await;
        let added = task.buffer[0].1;
        task.flush_due(added + TimeDelta::seconds(60));
        assert!(output.try_recv().is_err());
        assert_eq!(task.buffer.len(), 1);
    }

    #[test]
    async fn full_downstream_defers_the_flush() {
        let (ctrl_tx, ctrl) = control_channel("coalescer", PauseMode::Pausing);
        let _ctrl_tx = ctrl_tx;
        let (db_tx, _db_rx) = mpsc::channel(1);
        let (_input_tx, input) = mpsc::channel(100);
        // Downstream capacity of one: the second flush attempt must park.
        let (output_tx, mut output_rx) = mpsc::channel(1);
        let mut task = WebCoalescer::new(
            ctrl,
            DbClient::new(db_tx),
            input,
            output_tx,
            Duration::from_secs(1),
        );
        task.handle_input(WebRequest::PkgProj("alpha".to_string())).await;
        task.handle_input(WebRequest::PkgProj("beta".to_string())).await;
        let added = task.buffer[0].1;
        task.flush_due(added + TimeDelta::seconds(5));
        assert_eq!(task.buffer.len(), 1, "beta stays buffered");
        assert_eq!(
            output_rx.try_recv().unwrap(),
            WebRequest::PkgProj("alpha".to_string())
        );
        // Next flush delivers the remainder.
        task.flush_due(added + TimeDelta::seconds(6));
        assert_eq!(
            output_rx.try_recv().unwrap(),
            WebRequest::PkgProj("beta".to_string())
        );
    }
}
