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

//! The typed request/response helper every task uses for database access.
//! Each call blocks on its reply, so one client's operations are causally
//! serialized through the gateway.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use wheelwright_common::model::{
    BuildRecord, DownloadRecord, HitRecord, RewritePending, SearchIndex, SearchRecord, Statistics,
};

use super::{
    DbError, DbFront, DbOp, DbRequest, DbValue, DownloadsSummary, ProjectFileRow,
    ProjectVersionRow,
};

#[derive(Clone)]
pub struct DbClient {
    front: DbFront,
}

impl DbClient {
    pub fn new(front: DbFront) -> Self {
        Self { front }
    }

    async fn call(&self, op: DbOp) -> Result<DbValue, DbError> {
        let (reply, rx) = oneshot::channel();
        self.front
            .send(DbRequest { op, reply })
            .await
            .map_err(|_| DbError::Closed)?;
        rx.await.map_err(|_| DbError::Closed)?
    }

    async fn call_unit(&self, op: DbOp) -> Result<(), DbError> {
        match self.call(op).await? {
            DbValue::Unit => Ok(()),
            _ => Err(DbError::Unexpected),
        }
    }

    async fn call_bool(&self, op: DbOp) -> Result<bool, DbError> {
        match self.call(op).await? {
            DbValue::Bool(value) => Ok(value),
            _ => Err(DbError::Unexpected),
        }
    }

    async fn call_text_set(&self, op: DbOp) -> Result<BTreeSet<String>, DbError> {
        match self.call(op).await? {
            DbValue::TextSet(value) => Ok(value),
            _ => Err(DbError::Unexpected),
        }
    }

    pub async fn get_all_packages(&self) -> Result<BTreeSet<String>, DbError> {
        self.call_text_set(DbOp::AllPkgs).await
    }

    pub async fn get_all_versions(&self) -> Result<BTreeSet<(String, String)>, DbError> {
        match self.call(DbOp::AllVers).await? {
            DbValue::PairSet(value) => Ok(value),
            _ => Err(DbError::Unexpected),
        }
    }

    /// Returns `true` when the package was created, `false` when it already
    /// existed.
    pub async fn add_new_package(
        &self,
        package: &str,
        description: &str,
        skip: &str,
    ) -> Result<bool, DbError> {
        self.call_bool(DbOp::NewPkg {
            package: package.to_string(),
            description: description.to_string(),
            skip: skip.to_string(),
        })
        .await
    }

    pub async fn add_new_package_version(
        &self,
        package: &str,
        version: &str,
        released: DateTime<Utc>,
        skip: &str,
    ) -> Result<bool, DbError> {
        self.call_bool(DbOp::NewVer {
            package: package.to_string(),
            version: version.to_string(),
            released,
            skip: skip.to_string(),
        })
        .await
    }

    pub async fn update_package_description(
        &self,
        package: &str,
        description: &str,
    ) -> Result<(), DbError> {
        self.call_unit(DbOp::UpdPkg {
            package: package.to_string(),
            description: description.to_string(),
        })
        .await
    }

    pub async fn skip_package(&self, package: &str, reason: &str) -> Result<(), DbError> {
        self.call_unit(DbOp::SkipPkg {
            package: package.to_string(),
            reason: reason.to_string(),
        })
        .await
    }

    pub async fn skip_package_version(
        &self,
        package: &str,
        version: &str,
        reason: &str,
    ) -> Result<(), DbError> {
        self.call_unit(DbOp::SkipVer {
            package: package.to_string(),
            version: version.to_string(),
            reason: reason.to_string(),
        })
        .await
    }

    pub async fn get_version_skip(&self, package: &str, version: &str) -> Result<String, DbError> {
        match self
            .call(DbOp::GetSkip {
                package: package.to_string(),
                version: version.to_string(),
            })
            .await?
        {
            DbValue::Text(value) => Ok(value),
            _ => Err(DbError::Unexpected),
        }
    }

    pub async fn get_package_skip(&self, package: &str) -> Result<String, DbError> {
        match self
            .call(DbOp::PkgSkip {
                package: package.to_string(),
            })
            .await?
        {
            DbValue::Text(value) => Ok(value),
            _ => Err(DbError::Unexpected),
        }
    }

    pub async fn get_version_yanked(&self, package: &str, version: &str) -> Result<bool, DbError> {
        self.call_bool(DbOp::VerYanked {
            package: package.to_string(),
            version: version.to_string(),
        })
        .await
    }

    pub async fn delete_package(&self, package: &str) -> Result<(), DbError> {
        self.call_unit(DbOp::DelPkg {
            package: package.to_string(),
        })
        .await
    }

    pub async fn delete_version(&self, package: &str, version: &str) -> Result<(), DbError> {
        self.call_unit(DbOp::DelVer {
            package: package.to_string(),
            version: version.to_string(),
        })
        .await
    }

    pub async fn yank_version(&self, package: &str, version: &str) -> Result<(), DbError> {
        self.call_unit(DbOp::YankVer {
            package: package.to_string(),
            version: version.to_string(),
            yanked: true,
        })
        .await
    }

    pub async fn unyank_version(&self, package: &str, version: &str) -> Result<(), DbError> {
        self.call_unit(DbOp::YankVer {
            package: package.to_string(),
            version: version.to_string(),
            yanked: false,
        })
        .await
    }

    pub async fn package_exists(&self, package: &str) -> Result<bool, DbError> {
        self.call_bool(DbOp::PkgExists {
            package: package.to_string(),
        })
        .await
    }

    pub async fn version_exists(&self, package: &str, version: &str) -> Result<bool, DbError> {
        self.call_bool(DbOp::VerExists {
            package: package.to_string(),
            version: version.to_string(),
        })
        .await
    }

    pub async fn add_package_alias(&self, package: &str, alias: &str) -> Result<(), DbError> {
        self.call_unit(DbOp::AddAlias {
            package: package.to_string(),
            alias: alias.to_string(),
        })
        .await
    }

    pub async fn get_package_aliases(&self, package: &str) -> Result<BTreeSet<String>, DbError> {
        self.call_text_set(DbOp::GetAliases {
            package: package.to_string(),
        })
        .await
    }

    pub async fn get_build_abis(&self) -> Result<BTreeSet<String>, DbError> {
        self.call_text_set(DbOp::GetAbis).await
    }

    /// Logs a build attempt and returns the assigned build id.
    pub async fn log_build(&self, build: BuildRecord) -> Result<i64, DbError> {
        match self.call(DbOp::LogBuild(build)).await? {
            DbValue::Integer(build_id) => Ok(build_id),
            _ => Err(DbError::Unexpected),
        }
    }

    pub async fn delete_builds(&self, package: &str, version: &str) -> Result<(), DbError> {
        self.call_unit(DbOp::DelBuild {
            package: package.to_string(),
            version: version.to_string(),
        })
        .await
    }

    pub async fn get_project_files(&self, package: &str) -> Result<Vec<ProjectFileRow>, DbError> {
        match self
            .call(DbOp::ProjFiles {
                package: package.to_string(),
            })
            .await?
        {
            DbValue::ProjectFiles(rows) => Ok(rows),
            _ => Err(DbError::Unexpected),
        }
    }

    pub async fn get_project_versions(
        &self,
        package: &str,
    ) -> Result<Vec<ProjectVersionRow>, DbError> {
        match self
            .call(DbOp::ProjVers {
                package: package.to_string(),
            })
            .await?
        {
            DbValue::ProjectVersions(rows) => Ok(rows),
            _ => Err(DbError::Unexpected),
        }
    }

    pub async fn get_version_files(
        &self,
        package: &str,
        version: &str,
    ) -> Result<BTreeSet<String>, DbError> {
        self.call_text_set(DbOp::VerFiles {
            package: package.to_string(),
            version: version.to_string(),
        })
        .await
    }

    pub async fn get_file_dependencies(
        &self,
        filename: &str,
    ) -> Result<BTreeSet<(String, String)>, DbError> {
        match self
            .call(DbOp::FileDeps {
                filename: filename.to_string(),
            })
            .await?
        {
            DbValue::PairSet(value) => Ok(value),
            _ => Err(DbError::Unexpected),
        }
    }

    pub async fn get_project_downloads(&self, package: &str) -> Result<DownloadsSummary, DbError> {
        match self
            .call(DbOp::ProjDownloads {
                package: package.to_string(),
            })
            .await?
        {
            DbValue::Downloads(value) => Ok(value),
            _ => Err(DbError::Unexpected),
        }
    }

    pub async fn get_statistics(&self) -> Result<Statistics, DbError> {
        match self.call(DbOp::GetStats).await? {
            DbValue::Stats(value) => Ok(value),
            _ => Err(DbError::Unexpected),
        }
    }

    pub async fn get_search_index(&self) -> Result<SearchIndex, DbError> {
        match self.call(DbOp::GetSearch).await? {
            DbValue::Search(value) => Ok(value),
            _ => Err(DbError::Unexpected),
        }
    }

    pub async fn get_index_serial(&self) -> Result<i64, DbError> {
        match self.call(DbOp::GetSerial).await? {
            DbValue::Integer(value) => Ok(value),
            _ => Err(DbError::Unexpected),
        }
    }

    pub async fn set_index_serial(&self, serial: i64) -> Result<(), DbError> {
        self.call_unit(DbOp::SetSerial(serial)).await
    }

    pub async fn save_rewrites_pending(
        &self,
        rewrites: Vec<RewritePending>,
    ) -> Result<(), DbError> {
        self.call_unit(DbOp::SaveRewrites(rewrites)).await
    }

    pub async fn load_rewrites_pending(&self) -> Result<Vec<RewritePending>, DbError> {
        match self.call(DbOp::LoadRewrites).await? {
            DbValue::Rewrites(value) => Ok(value),
            _ => Err(DbError::Unexpected),
        }
    }

    pub async fn log_download(&self, record: DownloadRecord) -> Result<(), DbError> {
        self.call_unit(DbOp::LogDownload(record)).await
    }

    pub async fn log_search(&self, record: SearchRecord) -> Result<(), DbError> {
        self.call_unit(DbOp::LogSearch(record)).await
    }

    pub async fn log_project_hit(&self, record: HitRecord) -> Result<(), DbError> {
        self.call_unit(DbOp::LogProject(record)).await
    }

    pub async fn log_json_hit(&self, record: HitRecord) -> Result<(), DbError> {
        self.call_unit(DbOp::LogJson(record)).await
    }

    pub async fn log_page_hit(&self, record: HitRecord) -> Result<(), DbError> {
        self.call_unit(DbOp::LogPage(record)).await
    }
}
