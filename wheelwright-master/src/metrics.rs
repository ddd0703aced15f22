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

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    pub static ref EVENTS_INGESTED: IntCounterVec = register_int_counter_vec!(
        "wheelwright_index_events_total",
        "Number of upstream index events processed, by action",
        &["action"]
    )
    .unwrap();
    pub static ref DB_REQUESTS: IntCounter = register_int_counter!(
        "wheelwright_db_requests_total",
        "Number of requests routed through the database gateway"
    )
    .unwrap();
    pub static ref BUILDS_LOGGED: IntCounterVec = register_int_counter_vec!(
        "wheelwright_builds_total",
        "Number of build attempts logged, by outcome",
        &["status"]
    )
    .unwrap();
    pub static ref TRANSFERS_VERIFIED: IntCounter = register_int_counter!(
        "wheelwright_transfers_verified_total",
        "Number of file transfers verified and published"
    )
    .unwrap();
    pub static ref TRANSFERS_FAILED: IntCounter = register_int_counter!(
        "wheelwright_transfers_failed_total",
        "Number of file transfers aborted before publication"
    )
    .unwrap();
    pub static ref PAGES_WRITTEN: IntCounterVec = register_int_counter_vec!(
        "wheelwright_pages_written_total",
        "Number of web outputs rewritten, by kind",
        &["kind"]
    )
    .unwrap();
    pub static ref ACCESS_RECORDS: IntCounterVec = register_int_counter_vec!(
        "wheelwright_access_records_total",
        "Number of access-log records ingested, by kind",
        &["kind"]
    )
    .unwrap();
}

pub fn register_all() -> prometheus::Registry {
    // Touching each metric forces registration with the default registry
    // before the first real use.
    EVENTS_INGESTED.reset();
    DB_REQUESTS.reset();
    BUILDS_LOGGED.reset();
    TRANSFERS_VERIFIED.reset();
    TRANSFERS_FAILED.reset();
    PAGES_WRITTEN.reset();
    ACCESS_RECORDS.reset();
    prometheus::default_registry().clone()
}
