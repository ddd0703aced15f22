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

//! Database access for the master. All SQL runs inside a small pool of
//! worker tasks behind a fair gateway; every other task talks to the
//! database through a [`client::DbClient`], which serializes that caller's
//! requests (it blocks on each reply).

pub mod client;
pub mod gateway;
pub mod ops;
pub mod worker;

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{mpsc, oneshot};
use wheelwright_common::model::{
    BuildRecord, DownloadRecord, HitRecord, RewritePending, SearchIndex, SearchRecord, Statistics,
};

/// High-water mark of the gateway's front channel.
pub const DB_HWM: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database gateway closed")]
    Closed,
    #[error("database error: {0}")]
    Internal(String),
    #[error("unexpected reply shape")]
    Unexpected,
}

impl From<sqlx::Error> for DbError {
    fn from(value: sqlx::Error) -> Self {
        DbError::Internal(value.to_string())
    }
}

/// The request menu of the database workers.
#[derive(Clone, Debug, PartialEq)]
pub enum DbOp {
    AllPkgs,
    AllVers,
    NewPkg {
        package: String,
        description: String,
        skip: String,
    },
    NewVer {
        package: String,
        version: String,
        released: DateTime<Utc>,
        skip: String,
    },
    UpdPkg {
        package: String,
        description: String,
    },
    SkipPkg {
        package: String,
        reason: String,
    },
    SkipVer {
        package: String,
        version: String,
        reason: String,
    },
    GetSkip {
        package: String,
        version: String,
    },
    PkgSkip {
        package: String,
    },
    VerYanked {
        package: String,
        version: String,
    },
    DelPkg {
        package: String,
    },
    DelVer {
        package: String,
        version: String,
    },
    YankVer {
        package: String,
        version: String,
        yanked: bool,
    },
    PkgExists {
        package: String,
    },
    VerExists {
        package: String,
        version: String,
    },
    AddAlias {
        package: String,
        alias: String,
    },
    GetAliases {
        package: String,
    },
    GetAbis,
    LogBuild(BuildRecord),
    DelBuild {
        package: String,
        version: String,
    },
    ProjFiles {
        package: String,
    },
    ProjVers {
        package: String,
    },
    VerFiles {
        package: String,
        version: String,
    },
    FileDeps {
        filename: String,
    },
    ProjDownloads {
        package: String,
    },
    GetStats,
    GetSearch,
    GetSerial,
    SetSerial(i64),
    SaveRewrites(Vec<RewritePending>),
    LoadRewrites,
    LogDownload(DownloadRecord),
    LogSearch(SearchRecord),
    LogProject(HitRecord),
    LogJson(HitRecord),
    LogPage(HitRecord),
}

/// One row of a package's published-file listing (the simple index).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectFileRow {
    pub version: String,
    pub filename: String,
    pub filesize: i64,
    pub filehash: String,
    pub yanked: bool,
}

/// One row of the version/build/file join behind the project page and
/// project JSON; file columns are null for versions without builds and for
/// failed builds.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectVersionRow {
    pub version: String,
    pub released: DateTime<Utc>,
    pub skip: String,
    pub yanked: bool,
    pub build_id: Option<i64>,
    pub status: Option<bool>,
    pub duration: Option<f64>,
    pub builder_abi: Option<String>,
    pub filename: Option<String>,
    pub filesize: Option<i64>,
    pub filehash: Option<String>,
    pub file_abi_tag: Option<String>,
    pub platform_tag: Option<String>,
    pub dependencies: Vec<String>,
}

/// Download counters for one package.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DownloadsSummary {
    pub all: i64,
    pub last_30_days: i64,
    pub by_day: Vec<(NaiveDate, i64)>,
}

/// The result payload of a database operation; the typed client downcasts
/// to the shape its operation expects.
#[derive(Clone, Debug, PartialEq)]
pub enum DbValue {
    Unit,
    Bool(bool),
    Integer(i64),
    Text(String),
    TextSet(BTreeSet<String>),
    PairSet(BTreeSet<(String, String)>),
    ProjectFiles(Vec<ProjectFileRow>),
    ProjectVersions(Vec<ProjectVersionRow>),
    Stats(Statistics),
    Search(SearchIndex),
    Rewrites(Vec<RewritePending>),
    Downloads(DownloadsSummary),
}

/// A request in flight through the gateway.
#[derive(Debug)]
pub struct DbRequest {
    pub op: DbOp,
    pub reply: oneshot::Sender<Result<DbValue, DbError>>,
}

/// The sending side of the gateway's front channel; every task needing the
/// database holds a clone wrapped in a [`client::DbClient`].
pub type DbFront = mpsc::Sender<DbRequest>;
