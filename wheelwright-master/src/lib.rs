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

pub mod accesslog;
pub mod admin;
pub mod coalescer;
pub mod config;
pub mod db;
pub mod files;
pub mod index;
pub mod metrics;
pub mod queue;
pub mod state;
pub mod stats;
pub mod supervisor;
pub mod tasks;
pub mod web;
pub mod workers;

#[cfg(test)]
test_r::enable!();

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
