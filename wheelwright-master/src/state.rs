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

//! Per-worker bookkeeping for the worker router: identity, liveness, the
//! current assignment, and the file list still to be transferred for the
//! build in progress.

use std::time::Duration;

use chrono::{DateTime, Utc};
use wheelwright_common::model::{BuildRecord, FileRecord};

/// Lifecycle of one remote worker as seen by the router.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Registered and waiting for an assignment.
    Idle,
    /// A build has been assigned and is running remotely.
    Active,
    /// A successful build is transferring its files.
    Transfer,
    /// All files verified; the build is being logged.
    Logging,
    /// No message within twice the worker's timeout.
    Expired,
    Dead,
}

#[derive(Debug)]
pub struct WorkerState {
    pub worker_id: u64,
    /// The worker's own build timeout; expiry is twice this.
    pub timeout: Duration,
    pub py_version_tag: String,
    pub abi_tag: String,
    pub platform_tag: String,
    pub label: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub phase: WorkerPhase,
    /// (package, version) currently assigned, if any.
    pub assignment: Option<(String, String)>,
    /// The build reported by the worker, while transferring and logging.
    pub build: Option<BuildRecord>,
    /// Files of the current build still awaiting transfer.
    pub pending_files: Vec<FileRecord>,
    /// The operator asked for this worker to die at the next opportunity.
    pub terminated: bool,
}

impl WorkerState {
    pub fn new(
        worker_id: u64,
        timeout: Duration,
        py_version_tag: String,
        abi_tag: String,
        platform_tag: String,
        label: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            worker_id,
            timeout,
            py_version_tag,
            abi_tag,
            platform_tag,
            label,
            first_seen: now,
            last_seen: now,
            phase: WorkerPhase::Idle,
            assignment: None,
            build: None,
            pending_files: Vec::new(),
            terminated: false,
        }
    }

    pub fn seen(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
    }

    /// A worker silent for twice its own timeout is gone.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        let silence = (now - self.last_seen).to_std().unwrap_or_default();
        self.phase != WorkerPhase::Dead && silence > self.timeout * 2
    }

    pub fn kill(&mut self) {
        self.terminated = true;
    }

    /// The next file of the current build awaiting transfer.
    pub fn next_file(&self) -> Option<&FileRecord> {
        self.pending_files.first()
    }

    /// Marks the head file as transferred and verified.
    pub fn file_done(&mut self) -> Option<FileRecord> {
        if self.pending_files.is_empty() {
            None
        } else {
            Some(self.pending_files.remove(0))
        }
    }

    pub fn transfers_done(&self) -> bool {
        self.pending_files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::TimeDelta;
    use test_r::test;

    use super::*;

    fn worker(now: DateTime<Utc>) -> WorkerState {
        WorkerState::new(
            1,
            Duration::from_secs(3 * 60 * 60),
            "cp34".to_string(),
            "cp34m".to_string(),
            "linux_armv7l".to_string(),
            "builder2".to_string(),
            now,
        )
    }

    fn file(name: &str) -> FileRecord {
        FileRecord {
            filename: name.to_string(),
            filesize: 123456,
            filehash: "c3be".to_string(),
            package_tag: "foo".to_string(),
            package_version_tag: "0.1".to_string(),
            py_version_tag: "cp34".to_string(),
            abi_tag: "cp34m".to_string(),
            platform_tag: "linux_armv7l".to_string(),
            dependencies: BTreeSet::new(),
        }
    }

    #[test]
    fn expiry_is_twice_the_worker_timeout() {
        let now = Utc::now();
        let mut state = worker(now);
        state.seen(now - TimeDelta::hours(5));
        assert!(!state.expired(now));
        state.seen(now - TimeDelta::hours(7));
        assert!(state.expired(now));
    }

    #[test]
    fn files_transfer_in_declaration_order() {
        let now = Utc::now();
        let mut state = worker(now);
        state.pending_files = vec![file("a.whl"), file("b.whl")];
        assert!(!state.transfers_done());
        assert_eq!(state.next_file().unwrap().filename, "a.whl");
        assert_eq!(state.file_done().unwrap().filename, "a.whl");
        assert_eq!(state.next_file().unwrap().filename, "b.whl");
        assert_eq!(state.file_done().unwrap().filename, "b.whl");
        assert!(state.transfers_done());
        assert_eq!(state.file_done(), None);
    }

    #[test]
    fn kill_is_sticky() {
        let mut state = worker(Utc::now());
        assert!(!state.terminated);
        state.kill();
        assert!(state.terminated);
    }
}
