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

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonicalizes a package name: any run of `-`, `_` or `.` collapses to a
/// single `-` and the result is lowercased.
pub fn canonicalize_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    let mut in_run = false;
    for ch in name.chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !in_run {
                result.push('-');
                in_run = true;
            }
        } else {
            result.extend(ch.to_lowercase());
            in_run = false;
        }
    }
    result
}

/// Renders a byte count with a binary-prefix suffix, e.g. `42 MB`.
pub fn format_size(size: u64) -> String {
    const SUFFIXES: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    if size == 0 {
        return "0 B".to_string();
    }
    let index = ((63 - size.leading_zeros() as u64) / 10).min(SUFFIXES.len() as u64 - 1);
    let scaled = size as f64 / (1u64 << (index * 10)) as f64;
    format!("{:.0} {}", scaled, SUFFIXES[index as usize])
}

/// The relative path of the gzipped log for *build_id*: the id is split
/// base-10 into three 4-digit levels by repeated divmod 10000, reversed.
pub fn build_log_path(build_id: i64, output_path: &Path) -> PathBuf {
    let mut levels = [0i64; 3];
    let mut n = build_id;
    for level in &mut levels {
        *level = n % 10000;
        n /= 10000;
    }
    output_path
        .join("logs")
        .join(format!("{:04}", levels[2]))
        .join(format!("{:04}", levels[1]))
        .join(format!("{:04}.txt.gz", levels[0]))
}

/// Marker skip-reason for packages and versions removed from the upstream
/// index; a tombstone rather than a plain skip.
pub const DELETED: &str = "deleted";

/// Skip-reason applied automatically to versions for which the upstream
/// only ever published binary artifacts.
pub const BINARY_ONLY: &str = "binary only";

/// A single artifact produced by a build, as declared by the worker before
/// transfer and as persisted after verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub filesize: u64,
    /// SHA-256 of the file content, lowercase hex.
    pub filehash: String,
    pub package_tag: String,
    pub package_version_tag: String,
    pub py_version_tag: String,
    pub abi_tag: String,
    pub platform_tag: String,
    /// (tool, package) pairs, e.g. ("apt", "libfoo1").
    pub dependencies: BTreeSet<(String, String)>,
}

impl FileRecord {
    /// The name the `linux_armv6l` compatibility symlink would carry, if
    /// this file is a `linux_armv7l` build.
    pub fn armv6_alias(&self) -> Option<String> {
        if self.platform_tag == "linux_armv7l" {
            Some(self.filename.replace("linux_armv7l", "linux_armv6l"))
        } else {
            None
        }
    }
}

/// One build attempt reported by a worker. `build_id` is assigned by the
/// database on insert and is `None` until the build has been logged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub worker_id: u64,
    pub package: String,
    pub version: String,
    pub abi_tag: String,
    pub status: bool,
    pub duration: Duration,
    pub output: String,
    pub files: Vec<FileRecord>,
    pub build_id: Option<i64>,
}

/// An access-log entry for one wheel download.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub filename: String,
    pub host: String,
    pub timestamp: DateTime<Utc>,
    pub arch: String,
    pub distro_name: String,
    pub distro_version: String,
    pub os_name: String,
    pub os_version: String,
    pub py_name: String,
    pub py_version: String,
}

/// An access-log entry for one search query against the package index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRecord {
    pub package: String,
    pub host: String,
    pub timestamp: DateTime<Utc>,
}

/// An access-log entry for a hit on a rendered page: a project page, a
/// project JSON document, or one of the top-level site pages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitRecord {
    pub page: String,
    pub host: String,
    pub timestamp: DateTime<Utc>,
}

/// Which pages a buffered rewrite request regenerates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewriteCommand {
    /// Only the project page.
    Project,
    /// Both the simple index and the project page.
    Both,
}

/// A rewrite request parked in the web coalescer; persisted across master
/// restarts so buffered work is never lost.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewritePending {
    pub package: String,
    pub added_at: DateTime<Utc>,
    pub command: RewriteCommand,
}

/// System-wide statistics snapshot, assembled periodically and published to
/// the page writer and the external status feed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub packages_built: i64,
    pub builds_count: i64,
    pub builds_last_hour: BTreeMap<String, i64>,
    pub builds_time: Duration,
    pub builds_size: i64,
    pub builds_pending: BTreeMap<String, i64>,
    pub files_count: i64,
    pub disk_size: u64,
    pub disk_free: u64,
    pub mem_size: u64,
    pub mem_free: u64,
    pub cpu_load: f32,
    pub downloads_last_hour: i64,
    pub downloads_last_month: i64,
    pub downloads_all: i64,
}

impl Statistics {
    pub fn builds_pending_total(&self) -> i64 {
        self.builds_pending.values().sum()
    }
}

/// Per-package search counts: (last 30 days, all time).
pub type SearchIndex = BTreeMap<String, (i64, i64)>;

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn canonical_names_collapse_separator_runs() {
        assert_eq!(canonicalize_name("Foo"), "foo");
        assert_eq!(canonicalize_name("foo-bar"), "foo-bar");
        assert_eq!(canonicalize_name("Foo__Bar"), "foo-bar");
        assert_eq!(canonicalize_name("foo._-bar"), "foo-bar");
        assert_eq!(canonicalize_name("RPi.GPIO"), "rpi-gpio");
    }

    #[test]
    fn sizes_format_with_binary_prefixes() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2 KB");
        assert_eq!(format_size(123456789), "118 MB");
    }

    #[test]
    fn log_paths_bucket_by_divmod_10000() {
        let root = Path::new("/var/www");
        assert_eq!(
            build_log_path(1, root),
            PathBuf::from("/var/www/logs/0000/0000/0001.txt.gz")
        );
        assert_eq!(
            build_log_path(123456789, root),
            PathBuf::from("/var/www/logs/0001/2345/6789.txt.gz")
        );
        assert_eq!(
            build_log_path(9999, root),
            PathBuf::from("/var/www/logs/0000/0000/9999.txt.gz")
        );
    }

    #[test]
    fn armv7_files_have_an_armv6_alias() {
        let record = FileRecord {
            filename: "foo-0.1-cp34-cp34m-linux_armv7l.whl".to_string(),
            filesize: 123456,
            filehash: "c3be".to_string(),
            package_tag: "foo".to_string(),
            package_version_tag: "0.1".to_string(),
            py_version_tag: "cp34".to_string(),
            abi_tag: "cp34m".to_string(),
            platform_tag: "linux_armv7l".to_string(),
            dependencies: BTreeSet::new(),
        };
        assert_eq!(
            record.armv6_alias().as_deref(),
            Some("foo-0.1-cp34-cp34m-linux_armv6l.whl")
        );
        let other = FileRecord {
            platform_tag: "linux_armv6l".to_string(),
            ..record
        };
        assert_eq!(other.armv6_alias(), None);
    }
}
