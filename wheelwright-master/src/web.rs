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

//! The page writer: sole owner of the published output tree apart from the
//! file server. Renders the simple index, per-package indexes, project
//! pages and JSON, search/statistics outputs, sitemaps and gzipped build
//! logs. Every write is an atomic replace; readers never see partial
//! content. File hashes are always taken from the database, never
//! recomputed from disk.

use std::collections::BTreeSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use include_dir::{include_dir, Dir};
use minijinja::{context, Environment};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use url::Url;
use wheelwright_common::model::{
    build_log_path, canonicalize_name, format_size, SearchIndex, Statistics,
};
use wheelwright_common::protocol::WebRequest;

use crate::db::client::DbClient;
use crate::db::ProjectVersionRow;
use crate::files::{atomic_write, mkdir_override_symlink};
use crate::metrics::PAGES_WRITTEN;
use crate::tasks::{Control, ControlChannel};

static TEMPLATES: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/templates");
static STATIC_FILES: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/static");

/// Google's limit on links per sitemap file.
const LINKS_PER_SITEMAP: usize = 50_000;

/// Pages rendered once at startup.
const STARTUP_PAGES: [&str; 5] = ["index", "faq", "packages", "stats", "json"];

#[derive(Serialize)]
struct FileEntry {
    filename: String,
    filehash: String,
    yanked: bool,
}

/// The page writer task. Pauseable: rewrites simply wait while paused.
pub struct PageWriter {
    ctrl: ControlChannel,
    db: DbClient,
    input: mpsc::Receiver<WebRequest>,
    output_path: PathBuf,
    site_url: Url,
    env: Environment<'static>,
    package_cache: BTreeSet<String>,
}

impl PageWriter {
    pub fn new(
        ctrl: ControlChannel,
        db: DbClient,
        input: mpsc::Receiver<WebRequest>,
        output_path: PathBuf,
        site_url: Url,
    ) -> anyhow::Result<Self> {
        let mut env = Environment::new();
        for file in TEMPLATES.files() {
            let name = file
                .path()
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("template name is not UTF-8"))?;
            let source = file
                .contents_utf8()
                .ok_or_else(|| anyhow::anyhow!("template {name} is not UTF-8"))?;
            env.add_template(name, source)?;
        }
        Ok(Self {
            ctrl,
            db,
            input,
            output_path,
            site_url,
            env,
            package_cache: BTreeSet::new(),
        })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.setup_output_path()?;
        info!("building package cache");
        self.package_cache = self.db.get_all_packages().await?;
        if !self.output_path.join("simple").join("index.html").exists() {
            self.write_simple_index()?;
        }
        loop {
            tokio::select! {
                ctrl = self.ctrl.next() => match ctrl {
                    Control::Quit => break,
                    Control::Pause => {
                        if self.ctrl.wait_resume().await == Control::Quit {
                            break;
                        }
                    }
                    _ => {}
                },
                Some(request) = self.input.recv() => {
                    if let Err(err) = self.handle_request(request).await {
                        // A failed write keeps the old content in place; the
                        // next rewrite request tries again.
                        error!(error = %format!("{err:#}"), "page write failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Creates the output tree skeleton, copies static resources and
    /// renders the persistent pages.
    fn setup_output_path(&self) -> anyhow::Result<()> {
        info!(path = %self.output_path.display(), "setting up output path");
        for dir in ["simple", "project", "logs"] {
            std::fs::create_dir_all(self.output_path.join(dir))?;
        }
        for file in STATIC_FILES.files() {
            let name = file
                .path()
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow::anyhow!("static resource without a name"))?;
            atomic_write(&self.output_path.join(name), file.contents())?;
        }
        for page in STARTUP_PAGES {
            let rendered = self
                .env
                .get_template(&format!("{page}.html"))?
                .render(context! { page => page })?;
            atomic_write(
                &self.output_path.join(format!("{page}.html")),
                rendered.as_bytes(),
            )?;
        }
        Ok(())
    }

    async fn handle_request(&mut self, request: WebRequest) -> anyhow::Result<()> {
        match request {
            WebRequest::PkgBoth(package) => {
                if !self.package_cache.contains(&package) {
                    self.package_cache.insert(package.clone());
                    self.write_simple_index()?;
                }
                self.write_package_index(&package).await?;
                self.write_project_page(&package).await?;
                self.write_project_json(&package).await?;
                self.link_aliases(&package).await?;
                PAGES_WRITTEN.with_label_values(&["both"]).inc();
            }
            WebRequest::PkgProj(package) => {
                self.write_project_page(&package).await?;
                self.write_project_json(&package).await?;
                PAGES_WRITTEN.with_label_values(&["project"]).inc();
            }
            WebRequest::Home(statistics) => {
                self.write_statistics_json(&statistics)?;
                self.write_sitemaps()?;
                PAGES_WRITTEN.with_label_values(&["home"]).inc();
            }
            WebRequest::Search(index) => {
                self.write_search_index(&index)?;
                PAGES_WRITTEN.with_label_values(&["search"]).inc();
            }
            WebRequest::DelPkg(package) => {
                self.delete_package(&package)?;
                PAGES_WRITTEN.with_label_values(&["delete"]).inc();
            }
            WebRequest::DelVer(package, version) => {
                self.delete_version(&package, &version).await?;
                PAGES_WRITTEN.with_label_values(&["delete"]).inc();
            }
            WebRequest::BuildLog { build_id, output } => {
                self.write_build_log(build_id, &output)?;
                PAGES_WRITTEN.with_label_values(&["log"]).inc();
            }
        }
        Ok(())
    }

    fn render_to(
        &self,
        path: &Path,
        template: &str,
        ctx: minijinja::value::Value,
    ) -> anyhow::Result<()> {
        let rendered = self.env.get_template(template)?.render(ctx)?;
        atomic_write(path, rendered.as_bytes())?;
        Ok(())
    }

    /// (Re)writes the index of all known packages.
    fn write_simple_index(&self) -> anyhow::Result<()> {
        info!("writing package index");
        self.render_to(
            &self.output_path.join("simple").join("index.html"),
            "simple_index.html",
            context! { packages => self.package_cache },
        )
    }

    /// (Re)writes one package's file index under `simple/`.
    async fn write_package_index(&self, package: &str) -> anyhow::Result<()> {
        info!(package, "writing package file index");
        let files: Vec<FileEntry> = self
            .db
            .get_project_files(package)
            .await?
            .into_iter()
            .map(|row| FileEntry {
                filename: row.filename,
                filehash: row.filehash,
                yanked: row.yanked,
            })
            .collect();
        let pkg_dir = self.output_path.join("simple").join(package);
        mkdir_override_symlink(&pkg_dir)?;
        self.render_to(
            &pkg_dir.join("index.html"),
            "simple_package.html",
            context! { package => package, files => files },
        )?;
        self.link_canonical(&pkg_dir)?;
        Ok(())
    }

    async fn write_project_page(&self, package: &str) -> anyhow::Result<()> {
        info!(package, "writing project page");
        let versions = self.db.get_project_versions(package).await?;
        let summary = project_summary(package, &versions);
        let pkg_dir = self.output_path.join("project").join(package);
        mkdir_override_symlink(&pkg_dir)?;
        self.render_to(
            &pkg_dir.join("index.html"),
            "project.html",
            context! { page => "project", package => package, project => summary },
        )?;
        self.link_canonical(&pkg_dir)?;
        Ok(())
    }

    async fn write_project_json(&self, package: &str) -> anyhow::Result<()> {
        info!(package, "writing project json");
        let versions = self.db.get_project_versions(package).await?;
        let downloads = self.db.get_project_downloads(package).await?;
        let summary = project_summary(package, &versions);
        let document = serde_json::json!({
            "package": package,
            "num_versions": summary.versions.iter().filter(|v| v.num_files > 0).count(),
            "num_files": summary.versions.iter().map(|v| v.num_files).sum::<usize>(),
            "versions": summary.versions,
            "num_downloads": downloads.all,
            "num_downloads_30_days": downloads.last_30_days,
            "downloads": downloads
                .by_day
                .iter()
                .map(|(day, count)| (day.to_string(), *count))
                .collect::<Vec<_>>(),
            "project_url": self.site_url.join(&format!("project/{package}/"))?.to_string(),
            "simple_url": self.site_url.join(&format!("simple/{package}/"))?.to_string(),
            "updated": Utc::now().format("%Y-%m-%d %H:%M").to_string(),
        });
        let json_dir = self.output_path.join("project").join(package).join("json");
        mkdir_override_symlink(&json_dir)?;
        atomic_write(
            &json_dir.join("index.json"),
            serde_json::to_vec(&document)?.as_slice(),
        )?;
        Ok(())
    }

    fn write_statistics_json(&self, statistics: &Statistics) -> anyhow::Result<()> {
        info!("writing statistics json");
        let document = serde_json::json!({
            "num_packages": statistics.packages_built,
            "num_wheels": statistics.files_count,
            "builds_count": statistics.builds_count,
            "builds_last_hour": statistics.builds_last_hour,
            "builds_time_seconds": statistics.builds_time.as_secs(),
            "builds_size": statistics.builds_size,
            "builds_pending": statistics.builds_pending,
            "downloads_last_hour": statistics.downloads_last_hour,
            "downloads_month": statistics.downloads_last_month,
            "downloads_all": statistics.downloads_all,
            "disk_size": statistics.disk_size,
            "disk_free": statistics.disk_free,
            "updated": Utc::now().format("%Y-%m-%d %H:%M").to_string(),
        });
        atomic_write(
            &self.output_path.join("statistics.json"),
            serde_json::to_vec(&document)?.as_slice(),
        )?;
        Ok(())
    }

    fn write_search_index(&self, index: &SearchIndex) -> anyhow::Result<()> {
        info!("writing search index");
        let entries: Vec<(&String, i64, i64)> = index
            .iter()
            .map(|(package, (recent, all))| (package, *recent, *all))
            .collect();
        atomic_write(
            &self.output_path.join("packages.json"),
            serde_json::to_vec(&entries)?.as_slice(),
        )?;
        Ok(())
    }

    fn write_sitemaps(&self) -> anyhow::Result<()> {
        info!("writing sitemaps");
        let static_pages: Vec<String> = STARTUP_PAGES
            .iter()
            .map(|page| format!("{page}.html"))
            .collect();
        self.render_to(
            &self.output_path.join("sitemap0.xml"),
            "sitemap_static.xml",
            context! { site => self.site_url.to_string(), pages => static_pages },
        )?;
        let packages: Vec<&String> = self.package_cache.iter().collect();
        let mut shards = 0;
        for (index, chunk) in packages.chunks(LINKS_PER_SITEMAP).enumerate() {
            shards = index + 1;
            self.render_to(
                &self.output_path.join(format!("sitemap{shards}.xml")),
                "sitemap_page.xml",
                context! { site => self.site_url.to_string(), packages => chunk },
            )?;
        }
        self.render_to(
            &self.output_path.join("sitemap.xml"),
            "sitemap_index.xml",
            context! {
                site => self.site_url.to_string(),
                shards => (0..=shards).collect::<Vec<_>>(),
                timestamp => Utc::now().format("%Y-%m-%d").to_string(),
            },
        )?;
        Ok(())
    }

    fn write_build_log(&self, build_id: i64, output: &str) -> anyhow::Result<()> {
        let path = build_log_path(build_id, &self.output_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(output.as_bytes())?;
        atomic_write(&path, &encoder.finish()?)?;
        Ok(())
    }

    fn delete_package(&mut self, package: &str) -> anyhow::Result<()> {
        info!(package, "removing published package");
        for tree in ["simple", "project"] {
            let dir = self.output_path.join(tree).join(package);
            if dir.symlink_metadata().is_ok() {
                if dir.symlink_metadata()?.is_symlink() {
                    std::fs::remove_file(&dir)?;
                } else {
                    std::fs::remove_dir_all(&dir)?;
                }
            }
            remove_alias_links(&self.output_path.join(tree), package)?;
        }
        if self.package_cache.remove(package) {
            self.write_simple_index()?;
        }
        Ok(())
    }

    async fn delete_version(&mut self, package: &str, version: &str) -> anyhow::Result<()> {
        info!(package, version, "removing published version");
        // The catalog rows are gone by the time this request arrives, so
        // the version's wheels are identified from their filenames: the
        // second dash-separated segment of a wheel name is its version.
        let pkg_dir = self.output_path.join("simple").join(package);
        if pkg_dir.is_dir() {
            for entry in std::fs::read_dir(&pkg_dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.ends_with(".whl") && name.split('-').nth(1) == Some(version) {
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
        self.write_package_index(package).await?;
        if self.db.get_project_versions(package).await?.is_empty() {
            // That was the last version; the project pages have nothing
            // left to say.
            let project_dir = self.output_path.join("project").join(package);
            if project_dir.is_dir() {
                std::fs::remove_dir_all(&project_dir)?;
            }
        } else {
            self.write_project_page(package).await?;
            self.write_project_json(package).await?;
        }
        Ok(())
    }

    /// Symlinks the canonicalized name at the real directory, never
    /// clobbering an existing entry.
    fn link_canonical(&self, pkg_dir: &Path) -> anyhow::Result<()> {
        let Some(name) = pkg_dir.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };
        let canonical = canonicalize_name(name);
        if canonical != name {
            link_alias(pkg_dir, &canonical)?;
        }
        Ok(())
    }

    /// Creates alias symlinks registered for the package, in both trees.
    async fn link_aliases(&self, package: &str) -> anyhow::Result<()> {
        let aliases = self.db.get_package_aliases(package).await?;
        for alias in aliases {
            for tree in ["simple", "project"] {
                let pkg_dir = self.output_path.join(tree).join(package);
                if pkg_dir.is_dir() {
                    link_alias(&pkg_dir, &alias)?;
                }
            }
        }
        Ok(())
    }
}

/// Creates `parent/<alias>` pointing at the directory's name. An existing
/// entry, real directory or symlink alike, is left untouched.
fn link_alias(pkg_dir: &Path, alias: &str) -> anyhow::Result<()> {
    let link = pkg_dir.with_file_name(alias);
    if link.symlink_metadata().is_ok() {
        if !link.symlink_metadata()?.is_symlink() {
            warn!(
                alias,
                target = %pkg_dir.display(),
                "alias collides with a real directory, not created"
            );
        }
        return Ok(());
    }
    let Some(target) = pkg_dir.file_name() else {
        return Ok(());
    };
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, &link)?;
    Ok(())
}

/// Removes alias symlinks under `parent` whose target is `package`.
fn remove_alias_links(parent: &Path, package: &str) -> anyhow::Result<()> {
    if !parent.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(parent)? {
        let entry = entry?;
        let path = entry.path();
        let is_symlink = path
            .symlink_metadata()
            .map(|m| m.is_symlink())
            .unwrap_or(false);
        if is_symlink {
            if let Ok(target) = std::fs::read_link(&path) {
                if target == Path::new(package) {
                    std::fs::remove_file(&path)?;
                }
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct ProjectSummary {
    package: String,
    versions: Vec<VersionSummary>,
}

#[derive(Serialize)]
struct VersionSummary {
    version: String,
    released: String,
    skip: String,
    yanked: bool,
    num_files: usize,
    builds: Vec<BuildSummary>,
}

#[derive(Serialize)]
struct BuildSummary {
    build_id: i64,
    success: bool,
    abi_tag: String,
    platform_tag: String,
    filename: String,
    filesize: i64,
    filesize_human: String,
    filehash: String,
    duration_seconds: f64,
    apt_dependencies: Vec<String>,
}

/// Folds the flat version/build/file rows into the per-version summary the
/// project page and JSON document share.
fn project_summary(package: &str, rows: &[ProjectVersionRow]) -> ProjectSummary {
    let mut versions: Vec<VersionSummary> = Vec::new();
    for row in rows {
        if versions.last().map(|v| v.version.as_str()) != Some(row.version.as_str()) {
            versions.push(VersionSummary {
                version: row.version.clone(),
                released: row.released.format("%Y-%m-%d %H:%M").to_string(),
                skip: row.skip.clone(),
                yanked: row.yanked,
                num_files: 0,
                builds: Vec::new(),
            });
        }
        let current = versions.last_mut().expect("version pushed above");
        let (Some(build_id), Some(status)) = (row.build_id, row.status) else {
            continue;
        };
        match (&row.filename, status) {
            (Some(filename), true) => {
                current.num_files += 1;
                current.builds.push(BuildSummary {
                    build_id,
                    success: true,
                    abi_tag: row.file_abi_tag.clone().unwrap_or_default(),
                    platform_tag: row.platform_tag.clone().unwrap_or_default(),
                    filename: filename.clone(),
                    filesize: row.filesize.unwrap_or_default(),
                    filesize_human: format_size(row.filesize.unwrap_or_default().max(0) as u64),
                    filehash: row.filehash.clone().unwrap_or_default(),
                    duration_seconds: row.duration.unwrap_or_default(),
                    apt_dependencies: row.dependencies.clone(),
                });
            }
            (_, false) => {
                current.builds.push(BuildSummary {
                    build_id,
                    success: false,
                    abi_tag: row.builder_abi.clone().unwrap_or_default(),
                    platform_tag: String::new(),
                    filename: String::new(),
                    filesize: 0,
                    filesize_human: String::new(),
                    filehash: String::new(),
                    duration_seconds: row.duration.unwrap_or_default(),
                    apt_dependencies: Vec::new(),
                });
            }
            (None, true) => {}
        }
    }
    ProjectSummary {
        package: package.to_string(),
        versions,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use test_r::test;

    use super::*;

    fn row(version: &str, file: Option<(&str, bool)>) -> ProjectVersionRow {
        let (filename, success) = match file {
            Some((name, success)) => (Some(name.to_string()), Some(success)),
            None => (None, None),
        };
        ProjectVersionRow {
            version: version.to_string(),
            released: Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            skip: String::new(),
            yanked: false,
            build_id: success.map(|_| 7),
            status: success,
            duration: success.map(|_| 300.0),
            builder_abi: success.map(|_| "cp34m".to_string()),
            filename: if success == Some(true) { filename } else { None },
            filesize: success.map(|_| 123456),
            filehash: success.map(|_| "c3be".to_string()),
            file_abi_tag: success.map(|_| "cp34m".to_string()),
            platform_tag: success.map(|_| "linux_armv7l".to_string()),
            dependencies: vec![],
        }
    }

    #[test]
    fn summary_groups_rows_by_version() {
        let rows = vec![
            row("0.1", Some(("foo-0.1.whl", true))),
            row("0.1", Some(("foo-0.1-other.whl", true))),
            row("0.2", None),
        ];
        let summary = project_summary("foo", &rows);
        assert_eq!(summary.versions.len(), 2);
        assert_eq!(summary.versions[0].num_files, 2);
        assert_eq!(summary.versions[1].num_files, 0);
        assert!(summary.versions[1].builds.is_empty());
    }

    #[test]
    fn failed_builds_carry_no_file_details() {
        let rows = vec![row("0.1", Some(("unused", false)))];
        let summary = project_summary("foo", &rows);
        let build = &summary.versions[0].builds[0];
        assert!(!build.success);
        assert!(build.filename.is_empty());
        assert_eq!(summary.versions[0].num_files, 0);
    }
}
