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
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::SafeDisplay;

/// Layered configuration loading: compiled-in defaults, then a TOML file,
/// then `WHEELWRIGHT__*` environment variables (`__` separates levels).
pub struct ConfigLoader<T> {
    pub config_file: PathBuf,
    _config: PhantomData<T>,
}

impl<T: Default + Serialize + DeserializeOwned> ConfigLoader<T> {
    pub fn new(config_file: &Path) -> Self {
        Self {
            config_file: config_file.to_path_buf(),
            _config: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file))
            .merge(Env::prefixed("WHEELWRIGHT__").split("__"))
    }

    pub fn load(&self) -> Result<T, figment::Error> {
        self.figment().extract()
    }

    /// Loads the configuration, or dumps the default configuration as TOML
    /// and returns `None` when invoked with `--dump-config-default`. Load
    /// failures are printed and also yield `None` so the caller can exit.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config-default") {
            match toml::to_string_pretty(&T::default()) {
                Ok(dump) => println!("{dump}"),
                Err(err) => eprintln!("failed to render default config: {err}"),
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(err) => {
                    eprintln!("failed to load config: {err}");
                    None
                }
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbPostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
}

impl Default for DbPostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "wheelwright".to_string(),
            username: "wheelwright".to_string(),
            password: "".to_string(),
            max_connections: 8,
        }
    }
}

impl SafeDisplay for DbPostgresConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "host: {}", self.host);
        let _ = writeln!(&mut result, "port: {}", self.port);
        let _ = writeln!(&mut result, "database: {}", self.database);
        let _ = writeln!(&mut result, "username: {}", self.username);
        let _ = writeln!(&mut result, "password: ****");
        let _ = writeln!(&mut result, "max connections: {}", self.max_connections);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Filter applied when `RUST_LOG` is not set.
    pub default_directive: String,
    /// Emit JSON log lines instead of the human-readable format.
    pub json: bool,
    pub ansi: bool,
}

impl TracingConfig {
    pub fn local_dev(service: &str) -> Self {
        Self {
            default_directive: format!("info,{}=debug", service.replace('-', "_")),
            json: false,
            ansi: true,
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            json: false,
            ansi: true,
        }
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "default directive: {}", self.default_directive);
        let _ = writeln!(&mut result, "json: {}", self.json);
        let _ = writeln!(&mut result, "ansi: {}", self.ansi);
        result
    }
}
