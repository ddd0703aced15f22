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

//! The low-level interface to the upstream index's event log: an ordering
//! buffer that repairs timestamp skew, and the classifier that turns raw
//! action strings into catalog events with duplicate suppression.
//!
//! Upstream timestamps are not monotonic in serial. Before the epoch serial
//! they are unreliable altogether; after it they can still jump backwards
//! by a few minutes. The buffer therefore sorts everything it has seen by
//! (timestamp, serial) and only releases events older than the newest
//! buffered timestamp minus a five-minute settling window.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use lru::LruCache;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

/// Settling window: an event is only released once the buffer has seen a
/// timestamp this much newer.
pub const SETTLE_WINDOW_SECS: i64 = 5 * 60;

/// A raw event row from the upstream log:
/// (package, version, unix timestamp, action, serial).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RawEvent(pub String, pub Option<String>, pub i64, pub String, pub i64);

impl RawEvent {
    pub fn package(&self) -> &str {
        &self.0
    }

    pub fn version(&self) -> Option<&str> {
        self.1.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.2, 0).single().unwrap_or_default()
    }

    pub fn action(&self) -> &str {
        &self.3
    }

    pub fn serial(&self) -> i64 {
        self.4
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Server-side or network trouble; back off and retry later.
    #[error("transient upstream error: {0}")]
    Transient(String),
    /// The reply could not be understood.
    #[error("invalid upstream reply: {0}")]
    Invalid(String),
}

/// The event-log contract of the upstream index.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetches a batch of events with serials greater than `serial`, sorted
    /// by serial. An empty batch means the end of the log was reached.
    async fn changes_since(&self, serial: i64) -> Result<Vec<RawEvent>, SourceError>;
}

/// Ordering repair over an [`EventSource`].
pub struct EventBuffer {
    epoch: i64,
    margin: i64,
    serial: i64,
    next_serial: i64,
    serial_timestamp: Option<i64>,
    buffer: Vec<RawEvent>,
}

impl EventBuffer {
    pub fn new(epoch: i64, margin: i64) -> Self {
        let mut buffer = Self {
            epoch,
            margin,
            serial: 0,
            next_serial: 0,
            serial_timestamp: None,
            buffer: Vec::new(),
        };
        buffer.set_serial(0);
        buffer
    }

    /// The next smallest serial to yield. The actual read position starts a
    /// safety margin earlier; before the epoch it starts from zero.
    pub fn serial(&self) -> i64 {
        self.serial
    }

    pub fn set_serial(&mut self, serial: i64) {
        self.serial = serial;
        self.buffer.clear();
        let base = if serial < self.epoch { 0 } else { serial };
        self.next_serial = (base - self.margin).max(0);
        self.serial_timestamp = None;
    }

    /// Where the next upstream read should start.
    pub fn next_read_serial(&self) -> i64 {
        self.next_serial
    }

    /// Absorbs one serial-sorted batch and returns the events that are now
    /// safe to release, in (timestamp, serial) order.
    pub fn push_batch(&mut self, events: Vec<RawEvent>) -> Vec<RawEvent> {
        if events.is_empty() {
            return Vec::new();
        }
        self.next_serial = events.last().map(RawEvent::serial).unwrap_or(self.next_serial);
        if self.serial_timestamp.is_none() && self.serial <= self.next_serial {
            // Locate the timestamp of the serial we are seeking within the
            // serial-sorted batch, so we can find it again once the buffer
            // is timestamp-sorted.
            let index = events.partition_point(|event| event.serial() < self.serial);
            if index < events.len() {
                self.serial_timestamp = Some(events[index].2);
            }
        }
        self.buffer.extend(events);
        if self.next_serial <= self.epoch {
            // Nothing is trustworthy until the epoch has been crossed.
            return Vec::new();
        }
        let Some(serial_timestamp) = self.serial_timestamp else {
            return Vec::new();
        };
        self.buffer
            .sort_by(|a, b| (a.2, a.serial()).cmp(&(b.2, b.serial())));
        let max_timestamp = self.buffer.last().map(|event| event.2).unwrap_or_default();
        let finish_timestamp = max_timestamp - SETTLE_WINDOW_SECS;
        if serial_timestamp >= finish_timestamp {
            // The resume point is within the settling window of the newest
            // event; wait for more.
            return Vec::new();
        }
        let mut start = self
            .buffer
            .partition_point(|event| event.2 < serial_timestamp);
        let finish = self
            .buffer
            .partition_point(|event| event.2 < finish_timestamp);
        // Timestamps have per-second resolution, so several serials share
        // the resume timestamp; wind forward to the serial we are seeking
        // (which itself is not guaranteed to exist).
        while start < finish
            && self.buffer[start].2 == serial_timestamp
            && self.buffer[start].serial() < self.serial
        {
            start += 1;
        }
        if start >= finish {
            return Vec::new();
        }
        self.serial_timestamp = Some(self.buffer[finish].2);
        self.serial = self.buffer[finish].serial();
        let mut released: Vec<RawEvent> = self.buffer.drain(..finish).collect();
        released.drain(..start);
        released
    }
}

/// What an upstream action means for the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// A package or version appeared (binary artifacts only so far).
    Create,
    /// A source artifact appeared for the version.
    Source,
    Remove,
    Yank,
    Unyank,
}

/// A classified, de-duplicated catalog event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEvent {
    pub package: String,
    pub version: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

/// Classifies raw actions and suppresses duplicate create/source pairs with
/// a small LRU of recently seen (package, version) tuples. The one upgrade
/// rule: a `create` followed by a `source` for the same version is emitted
/// again as `source` (with the original timestamp) so the version loses its
/// automatic "binary only" skip.
pub struct EventClassifier {
    add_file: Regex,
    create: Regex,
    remove: Regex,
    yank: Regex,
    unyank: Regex,
    versions: LruCache<(String, String), (DateTime<Utc>, EventKind)>,
}

impl EventClassifier {
    pub fn new(cache_size: usize) -> Self {
        Self {
            add_file: Regex::new(r"^add ([^ ]+) file").unwrap(),
            create: Regex::new(r"^create$").unwrap(),
            remove: Regex::new(r"^remove(?: (?:project|release))?$").unwrap(),
            yank: Regex::new(r"^yank release$").unwrap(),
            unyank: Regex::new(r"^unyank release$").unwrap(),
            versions: LruCache::new(
                NonZeroUsize::new(cache_size.max(1)).expect("cache size is at least one"),
            ),
        }
    }

    pub fn classify(&mut self, raw: &RawEvent) -> Option<IndexEvent> {
        let timestamp = raw.timestamp();
        if let Some(captures) = self.add_file.captures(raw.action()) {
            let kind = if &captures[1] == "source" {
                EventKind::Source
            } else {
                EventKind::Create
            };
            let Some(version) = raw.version() else {
                warn!(package = raw.package(), "file event without a version");
                return None;
            };
            return self.check_new_version(raw.package(), version, timestamp, kind);
        }
        if self.create.is_match(raw.action()) {
            return Some(IndexEvent {
                package: raw.package().to_string(),
                version: None,
                timestamp,
                kind: EventKind::Create,
            });
        }
        if self.remove.is_match(raw.action()) {
            if let Some(version) = raw.version() {
                self.versions
                    .pop(&(raw.package().to_string(), version.to_string()));
            }
            return Some(IndexEvent {
                package: raw.package().to_string(),
                version: raw.version().map(str::to_string),
                timestamp,
                kind: EventKind::Remove,
            });
        }
        if self.yank.is_match(raw.action()) {
            return Some(IndexEvent {
                package: raw.package().to_string(),
                version: raw.version().map(str::to_string),
                timestamp,
                kind: EventKind::Yank,
            });
        }
        if self.unyank.is_match(raw.action()) {
            return Some(IndexEvent {
                package: raw.package().to_string(),
                version: raw.version().map(str::to_string),
                timestamp,
                kind: EventKind::Unyank,
            });
        }
        None
    }

    fn check_new_version(
        &mut self,
        package: &str,
        version: &str,
        timestamp: DateTime<Utc>,
        kind: EventKind,
    ) -> Option<IndexEvent> {
        let key = (package.to_string(), version.to_string());
        match self.versions.get(&key).copied() {
            None => {
                self.versions.put(key, (timestamp, kind));
                Some(IndexEvent {
                    package: package.to_string(),
                    version: Some(version.to_string()),
                    timestamp,
                    kind,
                })
            }
            Some((first_timestamp, EventKind::Create)) if kind == EventKind::Source => {
                self.versions.put(key, (first_timestamp, kind));
                Some(IndexEvent {
                    package: package.to_string(),
                    version: Some(version.to_string()),
                    timestamp: first_timestamp,
                    kind,
                })
            }
            Some(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn raw(package: &str, version: &str, ts: i64, action: &str, serial: i64) -> RawEvent {
        RawEvent(
            package.to_string(),
            Some(version.to_string()),
            ts,
            action.to_string(),
            serial,
        )
    }

    #[test]
    fn nothing_is_released_before_the_epoch() {
        let mut buffer = EventBuffer::new(1000, 100);
        buffer.set_serial(0);
        assert_eq!(buffer.next_read_serial(), 0);
        let released = buffer.push_batch(vec![
            raw("foo", "0.1", 500_000, "add source file", 500),
            raw("bar", "0.1", 500_100, "add source file", 900),
        ]);
        assert!(released.is_empty());
    }

    #[test]
    fn events_settle_for_five_minutes_after_the_epoch() {
        let mut buffer = EventBuffer::new(100, 10);
        buffer.set_serial(0);
        let base = 1_600_000_000;
        // Crosses the epoch, but everything is within the settling window.
        let released = buffer.push_batch(vec![
            raw("foo", "0.1", base, "add source file", 150),
            raw("bar", "0.1", base + 60, "add source file", 151),
        ]);
        assert!(released.is_empty());
        // A much newer event pushes the earlier ones out of the window; they
        // emerge in (timestamp, serial) order.
        let released = buffer.push_batch(vec![raw(
            "baz",
            "0.1",
            base + SETTLE_WINDOW_SECS + 120,
            "add source file",
            160,
        )]);
        let serials: Vec<i64> = released.iter().map(RawEvent::serial).collect();
        assert_eq!(serials, vec![150, 151]);
    }

    #[test]
    fn out_of_order_timestamps_are_repaired() {
        let mut buffer = EventBuffer::new(100, 10);
        buffer.set_serial(0);
        let base = 1_600_000_000;
        let released = buffer.push_batch(vec![
            raw("a", "1", base + 30, "add source file", 200),
            raw("c", "1", base + 90, "add source file", 201),
            raw("b", "1", base + 60, "add source file", 202),
            raw("z", "1", base + 1000, "add source file", 203),
        ]);
        let order: Vec<(&str, i64)> = released
            .iter()
            .map(|event| (event.package(), event.serial()))
            .collect();
        assert_eq!(order, vec![("a", 200), ("b", 202), ("c", 201)]);
    }

    #[test]
    fn resume_serial_starts_a_margin_earlier() {
        let mut buffer = EventBuffer::new(100, 50);
        buffer.set_serial(1000);
        assert_eq!(buffer.next_read_serial(), 950);
        // A pre-epoch resume point reads from the very start.
        buffer.set_serial(40);
        assert_eq!(buffer.next_read_serial(), 0);
    }

    #[test]
    fn classifier_recognises_each_action() {
        let mut classifier = EventClassifier::new(10);
        let cases = [
            ("add source file foo-0.1.tar.gz", Some(EventKind::Source)),
            ("add cp34 file foo-0.1-cp34-cp34m-linux_armv7l.whl", Some(EventKind::Create)),
            ("yank release", Some(EventKind::Yank)),
            ("unyank release", Some(EventKind::Unyank)),
            ("remove release", Some(EventKind::Remove)),
            ("docs update", None),
        ];
        for (index, (action, expected)) in cases.into_iter().enumerate() {
            let event = classifier.classify(&raw("foo", &format!("0.{index}"), 100, action, 1));
            assert_eq!(event.map(|e| e.kind), expected, "action: {action}");
        }
    }

    #[test]
    fn project_creation_has_no_version() {
        let mut classifier = EventClassifier::new(10);
        let event = classifier
            .classify(&RawEvent("foo".to_string(), None, 100, "create".to_string(), 1))
            .unwrap();
        assert_eq!(event.kind, EventKind::Create);
        assert_eq!(event.version, None);
    }

    #[test]
    fn duplicate_creates_are_suppressed_and_source_upgrades() {
        let mut classifier = EventClassifier::new(10);
        let create = raw("foo", "0.1", 100, "add cp34 file foo.whl", 1);
        assert!(classifier.classify(&create).is_some());
        // A second binary add for the same version says nothing new.
        assert!(classifier.classify(&create).is_none());
        // A source add upgrades the version, keeping the first timestamp.
        let source = raw("foo", "0.1", 250, "add source file foo.tar.gz", 2);
        let upgraded = classifier.classify(&source).unwrap();
        assert_eq!(upgraded.kind, EventKind::Source);
        assert_eq!(upgraded.timestamp, Utc.timestamp_opt(100, 0).unwrap());
        // And only once.
        assert!(classifier.classify(&source).is_none());
    }
}
