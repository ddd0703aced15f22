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

//! Message types for every endpoint of the master, network-facing and
//! in-process alike. Each endpoint direction is one enum; schema validation
//! is deserialization, so an unknown message name or a mismatched payload
//! surfaces as a recoverable decode error at the transport layer.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    BuildRecord, DownloadRecord, FileRecord, HitRecord, SearchIndex, SearchRecord, Statistics,
};

/// External control of the whole master (operator tooling and monitors).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "data")]
pub enum MasterControl {
    /// A new monitor announcing itself; the master replays worker state.
    Hello,
    /// Pause all pauseable operations.
    Pause,
    /// Resume after a pause.
    Resume,
    /// Terminate the identified worker at its next reply opportunity.
    Kill(u64),
    /// Terminate the master.
    Quit,
}

/// Messages a build worker sends to the master.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "data")]
pub enum WorkerRequest {
    Hello {
        /// The worker's own build timeout; the master expires the worker
        /// after twice this long without a message.
        #[serde(with = "humantime_serde")]
        timeout: Duration,
        py_version_tag: String,
        abi_tag: String,
        platform_tag: String,
        label: String,
    },
    /// Keepalive; also signals readiness for an assignment.
    Idle,
    Built {
        success: bool,
        #[serde(with = "humantime_serde")]
        duration: Duration,
        output: String,
        files: Vec<FileRecord>,
    },
    /// The worker finished pushing the previously requested file.
    Sent,
    /// The worker is shutting down on its own initiative.
    Bye,
}

/// Replies the master sends to a build worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "data")]
pub enum WorkerReply {
    Hello {
        worker_id: u64,
        index_url: String,
    },
    Build {
        package: String,
        version: String,
    },
    /// Nothing to build; ask again later.
    Sleep,
    /// Transfer the named file over the file endpoint.
    Send {
        filename: String,
    },
    /// All files verified; the build is fully registered.
    Done,
    Die,
}

/// Upward frames on the file-transfer endpoint (worker to master). Encoded
/// with bincode as chunk payloads are raw bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferUp {
    /// First frame after connecting: which worker this channel belongs to.
    Hello { worker_id: u64 },
    Chunk { offset: u64, data: Vec<u8> },
}

/// Downward frames on the file-transfer endpoint (master to worker).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDown {
    Fetch { offset: u64, length: u32 },
    /// The transfer is complete and verified.
    Done,
}

/// Page-rewrite requests flowing into the web coalescer and on to the page
/// writer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "data")]
pub enum WebRequest {
    /// Rewrite the statistics outputs and sitemaps.
    Home(Statistics),
    /// Rewrite the search index from per-package download counts.
    Search(SearchIndex),
    /// Rewrite both the package index and the project page.
    PkgBoth(String),
    /// Rewrite only the project page.
    PkgProj(String),
    /// Remove all published output for a deleted package.
    DelPkg(String),
    /// Remove the published files of one deleted version.
    DelVer(String, String),
    /// Store the gzipped log for a completed build.
    BuildLog { build_id: i64, output: String },
}

/// Out-of-band measurements contributed to the statistics aggregator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "data")]
pub enum StatsRequest {
    /// Filesystem size/free of the output mount, in bytes.
    StatFs { disk_size: u64, disk_free: u64 },
    /// Pending-queue sizes per ABI, from the queue generator.
    StatBq(BTreeMap<String, i64>),
    /// Force a statistics publish on the next cycle.
    Home,
}

/// Access-log records from the HTTP front-end's logger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "data")]
pub enum AccessRecord {
    Download(DownloadRecord),
    Search(SearchRecord),
    Project(HitRecord),
    Json(HitRecord),
    Page(HitRecord),
}

/// Which part of the web output an admin REBUILD regenerates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "part", content = "package")]
pub enum RebuildPart {
    Home,
    Search,
    /// Project pages; all packages when `None`.
    Project(Option<String>),
    /// Index and project pages; all packages when `None`.
    Both(Option<String>),
}

/// Administrator commands over the admin IPC endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "data")]
pub enum AdminRequest {
    AddPkg {
        package: String,
        description: String,
        skip: String,
        unskip: bool,
        aliases: Vec<String>,
    },
    AddVer {
        package: String,
        version: String,
        skip: String,
        unskip: bool,
        released: DateTime<Utc>,
        yank: bool,
        unyank: bool,
    },
    RemPkg {
        package: String,
        builds_too: bool,
        skip: String,
    },
    RemVer {
        package: String,
        version: String,
        builds_too: bool,
        skip: String,
        yank: bool,
    },
    Rebuild(RebuildPart),
    /// Register a build made outside the farm; the master will request its
    /// files one by one with `AdminReply::Send`.
    Import(BuildRecord),
    /// The previously requested import file has been pushed.
    Sent,
}

/// Enumerated admin error codes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminError {
    NoPkg,
    NoVer,
    SkipPkg,
    SkipVer,
    YankVer,
    /// The request was structurally valid but could not be applied.
    Failed(String),
}

/// Responses on the admin IPC endpoint; exactly one per request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "data")]
pub enum AdminReply {
    /// The command succeeded; `kind` names the operation performed
    /// (e.g. `NEWPKG` vs `UPDPKG` for an ADDPKG request).
    Done { kind: String },
    Error(AdminError),
    /// Import dialog: push the named file over the file endpoint.
    Send { filename: String },
}

/// Fan-out messages on the external status endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "data")]
pub enum StatusMessage {
    Stats(Statistics),
    Worker {
        worker_id: u64,
        timestamp: DateTime<Utc>,
        message: String,
        data: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn roundtrip<T>(value: &T) -> T
    where
        T: Serialize + for<'de> Deserialize<'de>,
    {
        let encoded = serde_json::to_vec(value).unwrap();
        serde_json::from_slice(&encoded).unwrap()
    }

    #[test]
    fn worker_messages_roundtrip() {
        let hello = WorkerRequest::Hello {
            timeout: Duration::from_secs(3 * 60 * 60),
            py_version_tag: "cp34".to_string(),
            abi_tag: "cp34m".to_string(),
            platform_tag: "linux_armv7l".to_string(),
            label: "builder2".to_string(),
        };
        assert_eq!(roundtrip(&hello), hello);
        assert_eq!(roundtrip(&WorkerRequest::Idle), WorkerRequest::Idle);
        let reply = WorkerReply::Build {
            package: "foo".to_string(),
            version: "0.1".to_string(),
        };
        assert_eq!(roundtrip(&reply), reply);
    }

    #[test]
    fn unknown_message_name_is_rejected() {
        let err = serde_json::from_str::<WorkerRequest>(r#"{"msg":"NOPE"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let err = serde_json::from_str::<WorkerReply>(r#"{"msg":"Build","data":{"package":1}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn transfer_frames_roundtrip_via_bincode() {
        let chunk = TransferUp::Chunk {
            offset: 65536,
            data: vec![0xAA; 128],
        };
        let encoded = bincode::serialize(&chunk).unwrap();
        let decoded: TransferUp = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn admin_rebuild_variants_roundtrip() {
        for part in [
            RebuildPart::Home,
            RebuildPart::Search,
            RebuildPart::Project(None),
            RebuildPart::Both(Some("foo".to_string())),
        ] {
            let request = AdminRequest::Rebuild(part.clone());
            assert_eq!(roundtrip(&request), request);
        }
    }
}
