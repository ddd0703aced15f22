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

//! The admin endpoint: a Unix-socket REQ/REP service for operator tooling.
//! Every request gets exactly one response. Connections are served one at
//! a time, so admin commands are strictly serialized.

use std::path::PathBuf;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use wheelwright_common::model::BuildRecord;
use wheelwright_common::protocol::{
    AdminError, AdminReply, AdminRequest, RebuildPart, StatsRequest, WebRequest,
};
use wheelwright_common::transport::MessageStream;

use crate::db::client::DbClient;
use crate::db::DbError;
use crate::files::FsRequest;
use crate::tasks::{Control, ControlChannel};

/// Worker id under which import clients connect to the file endpoint.
pub const IMPORT_WORKER_ID: u64 = 0;

/// An IMPORT in progress on the current admin connection.
struct ImportSession {
    build: BuildRecord,
    next_file: usize,
}

/// The admin task. NonStop: operators must be able to reach a paused
/// master.
pub struct AdminEndpoint {
    ctrl: ControlChannel,
    listener: UnixListener,
    db: DbClient,
    web: mpsc::Sender<WebRequest>,
    fs: mpsc::Sender<FsRequest>,
    stats: mpsc::Sender<StatsRequest>,
}

impl AdminEndpoint {
    pub fn bind(
        ctrl: ControlChannel,
        path: &PathBuf,
        db: DbClient,
        web: mpsc::Sender<WebRequest>,
        fs: mpsc::Sender<FsRequest>,
        stats: mpsc::Sender<StatsRequest>,
    ) -> anyhow::Result<Self> {
        // A stale socket from an unclean shutdown blocks the bind.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "admin endpoint listening");
        Ok(Self {
            ctrl,
            listener,
            db,
            web,
            fs,
            stats,
        })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                ctrl = self.ctrl.next() => {
                    if ctrl == Control::Quit {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, _)) => {
                            if self.serve(socket).await {
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "admin accept failed"),
                    }
                }
            }
        }
        Ok(())
    }

    /// Serves one connection to completion; returns true if QUIT arrived
    /// while serving.
    async fn serve(&mut self, socket: UnixStream) -> bool {
        let mut stream: MessageStream<AdminRequest, AdminReply, _> = MessageStream::new(socket);
        let mut import: Option<ImportSession> = None;
        loop {
            tokio::select! {
                ctrl = self.ctrl.next() => {
                    if ctrl == Control::Quit {
                        return true;
                    }
                }
                request = stream.recv() => {
                    let request = match request {
                        Ok(request) => request,
                        Err(err) if err.is_recoverable() => {
                            warn!(error = %err, "bad admin request");
                            let reply = AdminReply::Error(AdminError::Failed(err.to_string()));
                            if stream.send(&reply).await.is_err() {
                                return false;
                            }
                            continue;
                        }
                        Err(_) => return false,
                    };
                    let reply = self.handle(request, &mut import).await;
                    if stream.send(&reply).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn handle(
        &mut self,
        request: AdminRequest,
        import: &mut Option<ImportSession>,
    ) -> AdminReply {
        match self.dispatch(request, import).await {
            Ok(reply) => reply,
            Err(HandlerError::Admin(code)) => AdminReply::Error(code),
            Err(HandlerError::Db(err)) => {
                warn!(error = %err, "admin command failed");
                AdminReply::Error(AdminError::Failed(err.to_string()))
            }
        }
    }

    async fn dispatch(
        &mut self,
        request: AdminRequest,
        import: &mut Option<ImportSession>,
    ) -> Result<AdminReply, HandlerError> {
        match request {
            AdminRequest::AddPkg {
                package,
                description,
                skip,
                unskip,
                aliases,
            } => {
                let created = self
                    .db
                    .add_new_package(&package, &description, &skip)
                    .await?;
                let kind = if created {
                    "NEWPKG"
                } else {
                    if !description.is_empty() {
                        self.db
                            .update_package_description(&package, &description)
                            .await?;
                    }
                    if unskip {
                        self.db.skip_package(&package, "").await?;
                    } else if !skip.is_empty() {
                        self.db.skip_package(&package, &skip).await?;
                    }
                    "UPDPKG"
                };
                for alias in &aliases {
                    self.db.add_package_alias(&package, alias).await?;
                }
                let _ = self.web.send(WebRequest::PkgBoth(package)).await;
                Ok(AdminReply::Done {
                    kind: kind.to_string(),
                })
            }
            AdminRequest::AddVer {
                package,
                version,
                skip,
                unskip,
                released,
                yank,
                unyank,
            } => {
                if !self.db.package_exists(&package).await? {
                    return Err(AdminError::NoPkg.into());
                }
                if !self.db.get_package_skip(&package).await?.is_empty() && !unskip {
                    return Err(AdminError::SkipPkg.into());
                }
                let created = self
                    .db
                    .add_new_package_version(&package, &version, released, &skip)
                    .await?;
                let kind = if created { "NEWVER" } else { "UPDVER" };
                if !created {
                    if unskip {
                        self.db.skip_package_version(&package, &version, "").await?;
                    } else if !skip.is_empty() {
                        self.db
                            .skip_package_version(&package, &version, &skip)
                            .await?;
                    }
                }
                if yank {
                    self.db.yank_version(&package, &version).await?;
                } else if unyank {
                    self.db.unyank_version(&package, &version).await?;
                }
                let _ = self.web.send(WebRequest::PkgProj(package)).await;
                Ok(AdminReply::Done {
                    kind: kind.to_string(),
                })
            }
            AdminRequest::RemPkg {
                package,
                builds_too,
                skip,
            } => {
                if !self.db.package_exists(&package).await? {
                    return Err(AdminError::NoPkg.into());
                }
                if skip.is_empty() {
                    self.db.delete_package(&package).await?;
                    let _ = self.web.send(WebRequest::DelPkg(package)).await;
                    Ok(AdminReply::Done {
                        kind: "DELPKG".to_string(),
                    })
                } else {
                    self.db.skip_package(&package, &skip).await?;
                    if builds_too {
                        for row in self.db.get_project_versions(&package).await? {
                            self.db.delete_builds(&package, &row.version).await?;
                        }
                        let _ = self.web.send(WebRequest::PkgBoth(package)).await;
                    }
                    Ok(AdminReply::Done {
                        kind: "SKIPPKG".to_string(),
                    })
                }
            }
            AdminRequest::RemVer {
                package,
                version,
                builds_too,
                skip,
                yank,
            } => {
                if !self.db.package_exists(&package).await? {
                    return Err(AdminError::NoPkg.into());
                }
                if !self.db.version_exists(&package, &version).await? {
                    return Err(AdminError::NoVer.into());
                }
                if yank {
                    if self.db.get_version_yanked(&package, &version).await? {
                        return Err(AdminError::YankVer.into());
                    }
                    self.db.yank_version(&package, &version).await?;
                    let _ = self.web.send(WebRequest::PkgBoth(package)).await;
                    return Ok(AdminReply::Done {
                        kind: "YANKVER".to_string(),
                    });
                }
                if skip.is_empty() {
                    self.db.delete_version(&package, &version).await?;
                    let _ = self
                        .web
                        .send(WebRequest::DelVer(package, version))
                        .await;
                    Ok(AdminReply::Done {
                        kind: "DELVER".to_string(),
                    })
                } else {
                    self.db
                        .skip_package_version(&package, &version, &skip)
                        .await?;
                    if builds_too {
                        self.db.delete_builds(&package, &version).await?;
                        let _ = self
                            .web
                            .send(WebRequest::DelVer(package, version))
                            .await;
                    } else {
                        let _ = self.web.send(WebRequest::PkgProj(package)).await;
                    }
                    Ok(AdminReply::Done {
                        kind: "SKIPVER".to_string(),
                    })
                }
            }
            AdminRequest::Rebuild(part) => {
                match part {
                    RebuildPart::Home | RebuildPart::Search => {
                        let _ = self.stats.send(StatsRequest::Home).await;
                    }
                    RebuildPart::Project(Some(package)) => {
                        let _ = self.web.send(WebRequest::PkgProj(package)).await;
                    }
                    RebuildPart::Both(Some(package)) => {
                        let _ = self.web.send(WebRequest::PkgBoth(package)).await;
                    }
                    RebuildPart::Project(None) => {
                        for package in self.db.get_all_packages().await? {
                            let _ = self.web.send(WebRequest::PkgProj(package)).await;
                        }
                    }
                    RebuildPart::Both(None) => {
                        for package in self.db.get_all_packages().await? {
                            let _ = self.web.send(WebRequest::PkgBoth(package)).await;
                        }
                    }
                }
                Ok(AdminReply::Done {
                    kind: "REBUILD".to_string(),
                })
            }
            AdminRequest::Import(build) => self.start_import(build, import).await,
            AdminRequest::Sent => self.continue_import(import).await,
        }
    }

    /// Registers a build made outside the farm and opens the file dialog:
    /// the client pushes each file over the file endpoint under the
    /// reserved import worker id.
    async fn start_import(
        &mut self,
        mut build: BuildRecord,
        import: &mut Option<ImportSession>,
    ) -> Result<AdminReply, HandlerError> {
        if !build.status {
            return Err(AdminError::Failed("only successful builds can be imported".into()).into());
        }
        if build.files.is_empty() {
            return Err(AdminError::Failed("an import needs at least one file".into()).into());
        }
        let abis = self.db.get_build_abis().await?;
        if !abis.contains(&build.abi_tag) {
            return Err(AdminError::Failed(format!("unknown ABI {}", build.abi_tag)).into());
        }
        build.worker_id = IMPORT_WORKER_ID;
        // Make sure the package and version exist; imports may precede the
        // poller noticing the release.
        self.db.add_new_package(&build.package, "", "").await?;
        let created = self
            .db
            .add_new_package_version(&build.package, &build.version, chrono::Utc::now(), "")
            .await?;
        if !created {
            if !self
                .db
                .get_version_skip(&build.package, &build.version)
                .await?
                .is_empty()
            {
                return Err(AdminError::SkipVer.into());
            }
            if self
                .db
                .get_version_yanked(&build.package, &build.version)
                .await?
            {
                return Err(AdminError::YankVer.into());
            }
        }
        let build_id = self.db.log_build(build.clone()).await?;
        build.build_id = Some(build_id);
        info!(
            package = %build.package,
            version = %build.version,
            build_id,
            "import registered"
        );
        let filename = build.files[0].filename.clone();
        self.expect(&build, 0).await?;
        *import = Some(ImportSession {
            build,
            next_file: 0,
        });
        Ok(AdminReply::Send { filename })
    }

    async fn continue_import(
        &mut self,
        import: &mut Option<ImportSession>,
    ) -> Result<AdminReply, HandlerError> {
        let Some(session) = import.as_mut() else {
            return Err(AdminError::Failed("no import in progress".into()).into());
        };
        let package = session.build.package.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.fs
            .send(FsRequest::Verify {
                worker_id: IMPORT_WORKER_ID,
                package: package.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| AdminError::Failed("file endpoint unavailable".into()))?;
        match reply_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                *import = None;
                return Err(AdminError::Failed(reason).into());
            }
            Err(_) => {
                *import = None;
                return Err(AdminError::Failed("file server gone".into()).into());
            }
        }
        session.next_file += 1;
        if session.next_file < session.build.files.len() {
            let filename = session.build.files[session.next_file].filename.clone();
            let build = session.build.clone();
            let next = session.next_file;
            self.expect(&build, next).await?;
            Ok(AdminReply::Send { filename })
        } else {
            let output = session.build.output.clone();
            let build_id = session.build.build_id.unwrap_or_default();
            *import = None;
            let _ = self
                .web
                .send(WebRequest::BuildLog { build_id, output })
                .await;
            let _ = self.web.send(WebRequest::PkgBoth(package)).await;
            Ok(AdminReply::Done {
                kind: "IMPORT".to_string(),
            })
        }
    }

    async fn expect(&mut self, build: &BuildRecord, index: usize) -> Result<(), HandlerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.fs
            .send(FsRequest::Expect {
                worker_id: IMPORT_WORKER_ID,
                file: build.files[index].clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| AdminError::Failed("file endpoint unavailable".into()))?;
        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(AdminError::Failed(reason).into()),
            Err(_) => Err(AdminError::Failed("file server gone".into()).into()),
        }
    }
}

enum HandlerError {
    Admin(AdminError),
    Db(DbError),
}

impl From<AdminError> for HandlerError {
    fn from(value: AdminError) -> Self {
        HandlerError::Admin(value)
    }
}

impl From<DbError> for HandlerError {
    fn from(value: DbError) -> Self {
        HandlerError::Db(value)
    }
}
