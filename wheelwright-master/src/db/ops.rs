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

//! The SQL behind the database menu. One [`DbOperations`] value is shared
//! by all database workers; each operation is atomic at the transaction
//! level and unique violations on insert are idempotent no-ops.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use tracing::info;
use wheelwright_common::config::DbPostgresConfig;
use wheelwright_common::model::{
    BuildRecord, DownloadRecord, HitRecord, RewriteCommand, RewritePending, SearchIndex,
    SearchRecord, Statistics,
};

use super::{DbError, DbOp, DbValue, DownloadsSummary, ProjectFileRow, ProjectVersionRow};

fn connect_options(config: &DbPostgresConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(config.host.as_str())
        .port(config.port)
        .database(config.database.as_str())
        .username(config.username.as_str())
        .password(config.password.as_str())
}

pub async fn create_postgres_pool(config: &DbPostgresConfig) -> Result<PgPool, DbError> {
    info!(
        "DB pool: postgresql://{}:{}/{}",
        config.host, config.port, config.database
    );
    Ok(PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(connect_options(config))
        .await?)
}

pub async fn migrate(pool: &PgPool) -> Result<(), DbError> {
    sqlx::migrate!("db/migration/postgres")
        .run(pool)
        .await
        .map_err(|e| DbError::Internal(e.to_string()))
}

/// Verifies that the schema version recorded in the configuration row
/// matches the running software. A mismatch is startup-fatal.
pub async fn check_schema_version(pool: &PgPool, software: &str) -> Result<(), DbError> {
    let db_version: String =
        sqlx::query_scalar("SELECT version FROM configuration WHERE id = 1")
            .fetch_one(pool)
            .await?;
    if db_version != software {
        return Err(DbError::Internal(format!(
            "database version ({db_version}) does not match software version ({software})"
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct DbOperations {
    pool: PgPool,
}

impl DbOperations {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn execute(&self, op: DbOp) -> Result<DbValue, DbError> {
        match op {
            DbOp::AllPkgs => self.all_packages().await,
            DbOp::AllVers => self.all_versions().await,
            DbOp::NewPkg {
                package,
                description,
                skip,
            } => self.new_package(&package, &description, &skip).await,
            DbOp::NewVer {
                package,
                version,
                released,
                skip,
            } => self.new_version(&package, &version, released, &skip).await,
            DbOp::UpdPkg {
                package,
                description,
            } => self.update_package(&package, &description).await,
            DbOp::SkipPkg { package, reason } => self.skip_package(&package, &reason).await,
            DbOp::SkipVer {
                package,
                version,
                reason,
            } => self.skip_version(&package, &version, &reason).await,
            DbOp::GetSkip { package, version } => self.get_skip(&package, &version).await,
            DbOp::PkgSkip { package } => self.get_package_skip(&package).await,
            DbOp::VerYanked { package, version } => {
                self.get_version_yanked(&package, &version).await
            }
            DbOp::DelPkg { package } => self.delete_package(&package).await,
            DbOp::DelVer { package, version } => self.delete_version(&package, &version).await,
            DbOp::YankVer {
                package,
                version,
                yanked,
            } => self.yank_version(&package, &version, yanked).await,
            DbOp::PkgExists { package } => self.package_exists(&package).await,
            DbOp::VerExists { package, version } => self.version_exists(&package, &version).await,
            DbOp::AddAlias { package, alias } => self.add_alias(&package, &alias).await,
            DbOp::GetAliases { package } => self.get_aliases(&package).await,
            DbOp::GetAbis => self.get_build_abis().await,
            DbOp::LogBuild(build) => self.log_build(build).await,
            DbOp::DelBuild { package, version } => self.delete_builds(&package, &version).await,
            DbOp::ProjFiles { package } => self.project_files(&package).await,
            DbOp::ProjVers { package } => self.project_versions(&package).await,
            DbOp::VerFiles { package, version } => self.version_files(&package, &version).await,
            DbOp::FileDeps { filename } => self.file_dependencies(&filename).await,
            DbOp::ProjDownloads { package } => self.project_downloads(&package).await,
            DbOp::GetStats => self.get_statistics().await,
            DbOp::GetSearch => self.get_search_index().await,
            DbOp::GetSerial => self.get_serial().await,
            DbOp::SetSerial(serial) => self.set_serial(serial).await,
            DbOp::SaveRewrites(rewrites) => self.save_rewrites(rewrites).await,
            DbOp::LoadRewrites => self.load_rewrites().await,
            DbOp::LogDownload(record) => self.log_download(record).await,
            DbOp::LogSearch(record) => self.log_search(record).await,
            DbOp::LogProject(record) => self.log_hit("project_hits", record).await,
            DbOp::LogJson(record) => self.log_hit("json_hits", record).await,
            DbOp::LogPage(record) => self.log_hit("page_hits", record).await,
        }
    }

    async fn all_packages(&self) -> Result<DbValue, DbError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT package FROM packages")
            .fetch_all(&self.pool)
            .await?;
        Ok(DbValue::TextSet(
            rows.into_iter().map(|(package,)| package).collect(),
        ))
    }

    async fn all_versions(&self) -> Result<DbValue, DbError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT package, version FROM versions")
                .fetch_all(&self.pool)
                .await?;
        Ok(DbValue::PairSet(rows.into_iter().collect()))
    }

    async fn new_package(
        &self,
        package: &str,
        description: &str,
        skip: &str,
    ) -> Result<DbValue, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO packages (package, description, skip)
            VALUES ($1, $2, $3)
            ON CONFLICT (package) DO NOTHING
            "#,
        )
        .bind(package)
        .bind(description)
        .bind(skip)
        .execute(&self.pool)
        .await?;
        Ok(DbValue::Bool(result.rows_affected() == 1))
    }

    async fn new_version(
        &self,
        package: &str,
        version: &str,
        released: chrono::DateTime<Utc>,
        skip: &str,
    ) -> Result<DbValue, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO versions (package, version, released, skip)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (package, version) DO NOTHING
            "#,
        )
        .bind(package)
        .bind(version)
        .bind(released)
        .bind(skip)
        .execute(&self.pool)
        .await?;
        Ok(DbValue::Bool(result.rows_affected() == 1))
    }

    async fn update_package(&self, package: &str, description: &str) -> Result<DbValue, DbError> {
        sqlx::query("UPDATE packages SET description = $2 WHERE package = $1")
            .bind(package)
            .bind(description)
            .execute(&self.pool)
            .await?;
        Ok(DbValue::Unit)
    }

    async fn skip_package(&self, package: &str, reason: &str) -> Result<DbValue, DbError> {
        sqlx::query("UPDATE packages SET skip = $2 WHERE package = $1")
            .bind(package)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(DbValue::Unit)
    }

    async fn skip_version(
        &self,
        package: &str,
        version: &str,
        reason: &str,
    ) -> Result<DbValue, DbError> {
        sqlx::query("UPDATE versions SET skip = $3 WHERE package = $1 AND version = $2")
            .bind(package)
            .bind(version)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(DbValue::Unit)
    }

    async fn get_skip(&self, package: &str, version: &str) -> Result<DbValue, DbError> {
        let skip: Option<String> =
            sqlx::query_scalar("SELECT skip FROM versions WHERE package = $1 AND version = $2")
                .bind(package)
                .bind(version)
                .fetch_optional(&self.pool)
                .await?;
        match skip {
            Some(skip) => Ok(DbValue::Text(skip)),
            None => Err(DbError::Internal(format!(
                "unknown version {package} {version}"
            ))),
        }
    }

    async fn get_package_skip(&self, package: &str) -> Result<DbValue, DbError> {
        let skip: Option<String> =
            sqlx::query_scalar("SELECT skip FROM packages WHERE package = $1")
                .bind(package)
                .fetch_optional(&self.pool)
                .await?;
        match skip {
            Some(skip) => Ok(DbValue::Text(skip)),
            None => Err(DbError::Internal(format!("unknown package {package}"))),
        }
    }

    async fn get_version_yanked(&self, package: &str, version: &str) -> Result<DbValue, DbError> {
        let yanked: Option<bool> =
            sqlx::query_scalar("SELECT yanked FROM versions WHERE package = $1 AND version = $2")
                .bind(package)
                .bind(version)
                .fetch_optional(&self.pool)
                .await?;
        match yanked {
            Some(yanked) => Ok(DbValue::Bool(yanked)),
            None => Err(DbError::Internal(format!(
                "unknown version {package} {version}"
            ))),
        }
    }

    async fn delete_package(&self, package: &str) -> Result<DbValue, DbError> {
        sqlx::query("DELETE FROM packages WHERE package = $1")
            .bind(package)
            .execute(&self.pool)
            .await?;
        Ok(DbValue::Unit)
    }

    async fn delete_version(&self, package: &str, version: &str) -> Result<DbValue, DbError> {
        sqlx::query("DELETE FROM versions WHERE package = $1 AND version = $2")
            .bind(package)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(DbValue::Unit)
    }

    async fn yank_version(
        &self,
        package: &str,
        version: &str,
        yanked: bool,
    ) -> Result<DbValue, DbError> {
        sqlx::query("UPDATE versions SET yanked = $3 WHERE package = $1 AND version = $2")
            .bind(package)
            .bind(version)
            .bind(yanked)
            .execute(&self.pool)
            .await?;
        Ok(DbValue::Unit)
    }

    async fn package_exists(&self, package: &str) -> Result<DbValue, DbError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM packages WHERE package = $1)")
                .bind(package)
                .fetch_one(&self.pool)
                .await?;
        Ok(DbValue::Bool(exists))
    }

    async fn version_exists(&self, package: &str, version: &str) -> Result<DbValue, DbError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM versions WHERE package = $1 AND version = $2)",
        )
        .bind(package)
        .bind(version)
        .fetch_one(&self.pool)
        .await?;
        Ok(DbValue::Bool(exists))
    }

    async fn add_alias(&self, package: &str, alias: &str) -> Result<DbValue, DbError> {
        sqlx::query(
            r#"
            INSERT INTO package_aliases (alias, package)
            VALUES ($1, $2)
            ON CONFLICT (alias) DO NOTHING
            "#,
        )
        .bind(alias)
        .bind(package)
        .execute(&self.pool)
        .await?;
        Ok(DbValue::Unit)
    }

    async fn get_aliases(&self, package: &str) -> Result<DbValue, DbError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT alias FROM package_aliases WHERE package = $1")
                .bind(package)
                .fetch_all(&self.pool)
                .await?;
        Ok(DbValue::TextSet(
            rows.into_iter().map(|(alias,)| alias).collect(),
        ))
    }

    async fn get_build_abis(&self) -> Result<DbValue, DbError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT abi_tag FROM build_abis")
            .fetch_all(&self.pool)
            .await?;
        Ok(DbValue::TextSet(
            rows.into_iter().map(|(abi,)| abi).collect(),
        ))
    }

    async fn log_build(&self, build: BuildRecord) -> Result<DbValue, DbError> {
        let mut tx = self.pool.begin().await?;
        let build_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO builds (package, version, built_by, duration, output, status, abi_tag)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING build_id
            "#,
        )
        .bind(&build.package)
        .bind(&build.version)
        .bind(build.worker_id as i64)
        .bind(build.duration.as_secs_f64())
        .bind(&build.output)
        .bind(build.status)
        .bind(&build.abi_tag)
        .fetch_one(&mut *tx)
        .await?;
        if build.status {
            for file in &build.files {
                sqlx::query(
                    r#"
                    INSERT INTO files
                      (filename, build_id, filesize, filehash, package_tag,
                       package_version_tag, py_version_tag, abi_tag, platform_tag)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (filename) DO UPDATE
                    SET build_id = $2,
                        filesize = $3,
                        filehash = $4,
                        package_tag = $5,
                        package_version_tag = $6,
                        py_version_tag = $7,
                        abi_tag = $8,
                        platform_tag = $9
                    "#,
                )
                .bind(&file.filename)
                .bind(build_id)
                .bind(file.filesize as i64)
                .bind(&file.filehash)
                .bind(&file.package_tag)
                .bind(&file.package_version_tag)
                .bind(&file.py_version_tag)
                .bind(&file.abi_tag)
                .bind(&file.platform_tag)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM dependencies WHERE filename = $1")
                    .bind(&file.filename)
                    .execute(&mut *tx)
                    .await?;
                for (tool, dependency) in &file.dependencies {
                    sqlx::query(
                        r#"
                        INSERT INTO dependencies (filename, tool, dependency)
                        VALUES ($1, $2, $3)
                        ON CONFLICT DO NOTHING
                        "#,
                    )
                    .bind(&file.filename)
                    .bind(tool)
                    .bind(dependency)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(DbValue::Integer(build_id))
    }

    async fn delete_builds(&self, package: &str, version: &str) -> Result<DbValue, DbError> {
        sqlx::query("DELETE FROM builds WHERE package = $1 AND version = $2")
            .bind(package)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(DbValue::Unit)
    }

    async fn project_files(&self, package: &str) -> Result<DbValue, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT v.version, f.filename, f.filesize, f.filehash, v.yanked
            FROM builds b
            JOIN files f USING (build_id)
            JOIN versions v ON v.package = b.package AND v.version = b.version
            WHERE b.status AND b.package = $1
            ORDER BY v.released DESC, f.filename
            "#,
        )
        .bind(package)
        .fetch_all(&self.pool)
        .await?;
        Ok(DbValue::ProjectFiles(
            rows.into_iter()
                .map(|row| ProjectFileRow {
                    version: row.get("version"),
                    filename: row.get("filename"),
                    filesize: row.get("filesize"),
                    filehash: row.get("filehash"),
                    yanked: row.get("yanked"),
                })
                .collect(),
        ))
    }

    async fn project_versions(&self, package: &str) -> Result<DbValue, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT v.version, v.released, v.skip, v.yanked,
                   b.build_id, b.status, b.duration, b.abi_tag AS builder_abi,
                   f.filename, f.filesize, f.filehash,
                   f.abi_tag AS file_abi_tag, f.platform_tag,
                   COALESCE(
                     (SELECT array_agg(d.dependency)
                      FROM dependencies d
                      WHERE d.filename = f.filename AND d.tool = 'apt'),
                     '{}'::varchar[]
                   ) AS dependencies
            FROM versions v
            LEFT JOIN builds b ON b.package = v.package AND b.version = v.version
            LEFT JOIN files f ON f.build_id = b.build_id
            WHERE v.package = $1
            ORDER BY v.released, v.version, b.build_id
            "#,
        )
        .bind(package)
        .fetch_all(&self.pool)
        .await?;
        Ok(DbValue::ProjectVersions(
            rows.into_iter()
                .map(|row| ProjectVersionRow {
                    version: row.get("version"),
                    released: row.get("released"),
                    skip: row.get("skip"),
                    yanked: row.get("yanked"),
                    build_id: row.get("build_id"),
                    status: row.get("status"),
                    duration: row.get("duration"),
                    builder_abi: row.get("builder_abi"),
                    filename: row.get("filename"),
                    filesize: row.get("filesize"),
                    filehash: row.get("filehash"),
                    file_abi_tag: row.get("file_abi_tag"),
                    platform_tag: row.get("platform_tag"),
                    dependencies: row.get("dependencies"),
                })
                .collect(),
        ))
    }

    async fn version_files(&self, package: &str, version: &str) -> Result<DbValue, DbError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT f.filename
            FROM builds b
            JOIN files f USING (build_id)
            WHERE b.status AND b.package = $1 AND b.version = $2
            "#,
        )
        .bind(package)
        .bind(version)
        .fetch_all(&self.pool)
        .await?;
        Ok(DbValue::TextSet(
            rows.into_iter().map(|(filename,)| filename).collect(),
        ))
    }

    async fn file_dependencies(&self, filename: &str) -> Result<DbValue, DbError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT tool, dependency FROM dependencies WHERE filename = $1")
                .bind(filename)
                .fetch_all(&self.pool)
                .await?;
        Ok(DbValue::PairSet(rows.into_iter().collect()))
    }

    async fn project_downloads(&self, package: &str) -> Result<DbValue, DbError> {
        let (all, last_30_days): (i64, i64) = sqlx::query_as(
            r#"
            SELECT count(*),
                   count(*) FILTER (WHERE d.timestamp > now() - interval '30 days')
            FROM downloads d
            JOIN files f ON f.filename = d.filename
            JOIN builds b ON b.build_id = f.build_id
            WHERE b.package = $1
            "#,
        )
        .bind(package)
        .fetch_one(&self.pool)
        .await?;
        let by_day: Vec<(NaiveDate, i64)> = sqlx::query_as(
            r#"
            SELECT d.timestamp::date AS day, count(*)
            FROM downloads d
            JOIN files f ON f.filename = d.filename
            JOIN builds b ON b.build_id = f.build_id
            WHERE b.package = $1 AND d.timestamp > now() - interval '1 year'
            GROUP BY day
            ORDER BY day
            "#,
        )
        .bind(package)
        .fetch_all(&self.pool)
        .await?;
        Ok(DbValue::Downloads(DownloadsSummary {
            all,
            last_30_days,
            by_day,
        }))
    }

    async fn get_statistics(&self) -> Result<DbValue, DbError> {
        let (packages_built, builds_count, builds_time, files_count, builds_size): (
            i64,
            i64,
            f64,
            i64,
            i64,
        ) = sqlx::query_as(
            r#"
            SELECT
              (SELECT count(DISTINCT package) FROM builds WHERE status),
              (SELECT count(*) FROM builds),
              (SELECT COALESCE(sum(duration), 0)::double precision FROM builds),
              (SELECT count(*) FROM files),
              (SELECT COALESCE(sum(filesize), 0)::bigint FROM files)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let last_hour: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT abi_tag, count(*)
            FROM builds
            WHERE built_at > now() - interval '1 hour'
            GROUP BY abi_tag
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let (downloads_last_hour, downloads_last_month, downloads_all): (i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                  count(*) FILTER (WHERE timestamp > now() - interval '1 hour'),
                  count(*) FILTER (WHERE timestamp > now() - interval '30 days'),
                  count(*)
                FROM downloads
                "#,
            )
            .fetch_one(&self.pool)
            .await?;
        Ok(DbValue::Stats(Statistics {
            packages_built,
            builds_count,
            builds_last_hour: last_hour.into_iter().collect(),
            builds_time: Duration::from_secs_f64(builds_time.max(0.0)),
            builds_size,
            builds_pending: BTreeMap::new(),
            files_count,
            disk_size: 0,
            disk_free: 0,
            mem_size: 0,
            mem_free: 0,
            cpu_load: 0.0,
            downloads_last_hour,
            downloads_last_month,
            downloads_all,
        }))
    }

    async fn get_search_index(&self) -> Result<DbValue, DbError> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT b.package,
                   count(*) FILTER (WHERE d.timestamp > now() - interval '30 days'),
                   count(*)
            FROM downloads d
            JOIN files f ON f.filename = d.filename
            JOIN builds b ON b.build_id = f.build_id
            GROUP BY b.package
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let index: SearchIndex = rows
            .into_iter()
            .map(|(package, recent, all)| (package, (recent, all)))
            .collect();
        Ok(DbValue::Search(index))
    }

    async fn get_serial(&self) -> Result<DbValue, DbError> {
        let serial: i64 =
            sqlx::query_scalar("SELECT index_serial FROM configuration WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(DbValue::Integer(serial))
    }

    async fn set_serial(&self, serial: i64) -> Result<DbValue, DbError> {
        // greatest() keeps the persisted serial monotonic even if callers
        // race.
        sqlx::query(
            "UPDATE configuration SET index_serial = greatest(index_serial, $1) WHERE id = 1",
        )
        .bind(serial)
        .execute(&self.pool)
        .await?;
        Ok(DbValue::Unit)
    }

    async fn save_rewrites(&self, rewrites: Vec<RewritePending>) -> Result<DbValue, DbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM rewrites_pending")
            .execute(&mut *tx)
            .await?;
        for rewrite in rewrites {
            sqlx::query(
                r#"
                INSERT INTO rewrites_pending (package, added_at, command)
                VALUES ($1, $2, $3)
                ON CONFLICT (package) DO UPDATE SET added_at = $2, command = $3
                "#,
            )
            .bind(&rewrite.package)
            .bind(rewrite.added_at)
            .bind(match rewrite.command {
                RewriteCommand::Project => "PROJECT",
                RewriteCommand::Both => "BOTH",
            })
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(DbValue::Unit)
    }

    async fn load_rewrites(&self) -> Result<DbValue, DbError> {
        let rows = sqlx::query(
            "SELECT package, added_at, command FROM rewrites_pending ORDER BY added_at",
        )
        .fetch_all(&self.pool)
        .await?;
        let rewrites = rows
            .into_iter()
            .map(|row| {
                let command: String = row.get("command");
                RewritePending {
                    package: row.get("package"),
                    added_at: row.get("added_at"),
                    command: if command == "BOTH" {
                        RewriteCommand::Both
                    } else {
                        RewriteCommand::Project
                    },
                }
            })
            .collect();
        Ok(DbValue::Rewrites(rewrites))
    }

    async fn log_download(&self, record: DownloadRecord) -> Result<DbValue, DbError> {
        sqlx::query(
            r#"
            INSERT INTO downloads
              (filename, host, timestamp, arch, distro_name, distro_version,
               os_name, os_version, py_name, py_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&record.filename)
        .bind(&record.host)
        .bind(record.timestamp)
        .bind(&record.arch)
        .bind(&record.distro_name)
        .bind(&record.distro_version)
        .bind(&record.os_name)
        .bind(&record.os_version)
        .bind(&record.py_name)
        .bind(&record.py_version)
        .execute(&self.pool)
        .await?;
        Ok(DbValue::Unit)
    }

    async fn log_search(&self, record: SearchRecord) -> Result<DbValue, DbError> {
        sqlx::query("INSERT INTO searches (package, host, timestamp) VALUES ($1, $2, $3)")
            .bind(&record.package)
            .bind(&record.host)
            .bind(record.timestamp)
            .execute(&self.pool)
            .await?;
        Ok(DbValue::Unit)
    }

    async fn log_hit(&self, table: &str, record: HitRecord) -> Result<DbValue, DbError> {
        // `table` is one of three compile-time constants, never user input.
        let sql = format!("INSERT INTO {table} (page, host, timestamp) VALUES ($1, $2, $3)");
        sqlx::query(&sql)
            .bind(&record.page)
            .bind(&record.host)
            .bind(record.timestamp)
            .execute(&self.pool)
            .await?;
        Ok(DbValue::Unit)
    }
}
