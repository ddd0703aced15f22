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

use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;
use wheelwright_common::config::{ConfigLoader, DbPostgresConfig, TracingConfig};
use wheelwright_common::SafeDisplay;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterConfig {
    pub tracing: TracingConfig,
    pub db: DbPostgresConfig,
    /// Number of database worker tasks behind the gateway.
    pub db_workers: usize,
    pub index: IndexConfig,
    pub endpoints: EndpointsConfig,
    /// Root of the published output tree.
    pub output_path: PathBuf,
    pub queue: QueueConfig,
    pub web: WebConfig,
    pub stats: StatsConfig,
    pub transfers: TransferConfig,
    /// Shortens the coalescer hold to 3 seconds and loosens log filters.
    pub dev_mode: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("wheelwright-master"),
            db: DbPostgresConfig::default(),
            db_workers: 3,
            index: IndexConfig::default(),
            endpoints: EndpointsConfig::default(),
            output_path: PathBuf::from("/var/www"),
            queue: QueueConfig::default(),
            web: WebConfig::default(),
            stats: StatsConfig::default(),
            transfers: TransferConfig::default(),
            dev_mode: false,
        }
    }
}

impl SafeDisplay for MasterConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "DB workers: {}", self.db_workers);
        let _ = writeln!(&mut result, "index:");
        let _ = writeln!(&mut result, "{}", self.index.to_safe_string_indented());
        let _ = writeln!(&mut result, "endpoints:");
        let _ = writeln!(&mut result, "{}", self.endpoints.to_safe_string_indented());
        let _ = writeln!(&mut result, "output path: {}", self.output_path.display());
        let _ = writeln!(&mut result, "dev mode: {}", self.dev_mode);
        result
    }
}

/// Where the upstream package index lives and how often we poll it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Root URL of the upstream index, advertised to workers.
    pub root_url: Url,
    /// Event-log endpoint polled for changes.
    pub events_url: Url,
    /// JSON endpoint for package description lookups.
    pub json_url: Url,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Serial before which upstream event timestamps are unreliable.
    pub epoch_serial: i64,
    /// How many serials before the requested start to re-read, to absorb
    /// out-of-order arrivals around the resume point.
    pub serial_margin: i64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            root_url: Url::parse("https://pypi.org/").unwrap(),
            events_url: Url::parse("https://pypi.org/pypi/").unwrap(),
            json_url: Url::parse("https://pypi.org/pypi/").unwrap(),
            poll_interval: Duration::from_secs(10),
            epoch_serial: 628_000,
            serial_margin: 2_000,
        }
    }
}

impl SafeDisplay for IndexConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "root: {}", self.root_url);
        let _ = writeln!(&mut result, "events: {}", self.events_url);
        let _ = writeln!(&mut result, "json: {}", self.json_url);
        let _ = writeln!(&mut result, "poll interval: {:?}", self.poll_interval);
        let _ = writeln!(&mut result, "epoch serial: {}", self.epoch_serial);
        result
    }
}

/// Network and IPC addresses of all externally visible endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// TCP address workers dial for the build dialog.
    pub worker_addr: String,
    /// TCP address workers dial for file transfers.
    pub file_addr: String,
    /// TCP address of the status fan-out feed.
    pub status_addr: String,
    /// Unix socket for operator control (pause/resume/kill/quit).
    pub control_path: PathBuf,
    /// Unix socket for the admin command endpoint.
    pub admin_path: PathBuf,
    /// Unix socket receiving access-log records.
    pub log_path: PathBuf,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            worker_addr: "0.0.0.0:5555".to_string(),
            file_addr: "0.0.0.0:5556".to_string(),
            status_addr: "127.0.0.1:5557".to_string(),
            control_path: PathBuf::from("/tmp/wheelwright-control"),
            admin_path: PathBuf::from("/tmp/wheelwright-admin"),
            log_path: PathBuf::from("/tmp/wheelwright-log"),
        }
    }
}

impl SafeDisplay for EndpointsConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "workers: {}", self.worker_addr);
        let _ = writeln!(&mut result, "files: {}", self.file_addr);
        let _ = writeln!(&mut result, "status: {}", self.status_addr);
        let _ = writeln!(&mut result, "control: {}", self.control_path.display());
        let _ = writeln!(&mut result, "admin: {}", self.admin_path.display());
        let _ = writeln!(&mut result, "log: {}", self.log_path.display());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Cadence of unforced build-queue refreshes.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebConfig {
    /// How long package rewrite requests are buffered before being passed
    /// to the page writer; `dev_mode` overrides this to 3 seconds.
    #[serde(with = "humantime_serde")]
    pub hold: Duration,
    /// Public URL of the served output tree, used in sitemaps and project
    /// JSON documents.
    pub site_url: Url,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            hold: Duration::from_secs(60),
            site_url: Url::parse("https://wheels.example.org/").unwrap(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    pub chunk_size: u32,
    /// Concurrent outstanding chunk requests per transfer.
    pub credit: u32,
    /// A chunk not received within this long is re-requested.
    #[serde(with = "humantime_serde")]
    pub chunk_timeout: Duration,
    /// Overall deadline for a single file transfer.
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            credit: 8,
            chunk_timeout: Duration::from_secs(30),
            deadline: Duration::from_secs(600),
        }
    }
}

pub fn make_config_loader() -> ConfigLoader<MasterConfig> {
    ConfigLoader::new(&PathBuf::from("config/wheelwright-master.toml"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn default_config_is_loadable() {
        let loader = make_config_loader();
        let config = loader.load().expect("defaults should load");
        assert_eq!(config.db_workers, 3);
        assert_eq!(config.transfers.chunk_size, 64 * 1024);
        assert!(!config.dev_mode);
    }
}
