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

//! The upstream-index poller: ingests the event log with ordering repair,
//! mirrors packages and versions into the catalog, and nudges the web
//! output and the queue generator when the catalog changes.

pub mod events;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;
use wheelwright_common::model::{BINARY_ONLY, DELETED};
use wheelwright_common::protocol::WebRequest;

use crate::config::IndexConfig;
use crate::db::client::DbClient;
use crate::metrics::EVENTS_INGESTED;
use crate::tasks::{Control, ControlChannel, Periodic};

use events::{
    EventBuffer, EventClassifier, EventKind, EventSource, IndexEvent, RawEvent, SourceError,
};

/// Maximum length of a stored package description.
const DESCRIPTION_LIMIT: usize = 200;

/// Entries in the duplicate-suppression cache.
const DEDUP_CACHE_SIZE: usize = 1000;

/// Retries for the non-critical description lookup.
const DESCRIPTION_RETRIES: u32 = 3;

/// HTTP implementation of the upstream event-log contract: a JSON array of
/// `(package, version, timestamp, action, serial)` rows.
pub struct HttpEventSource {
    client: reqwest::Client,
    events_url: Url,
}

impl HttpEventSource {
    pub fn new(events_url: Url) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(format!("wheelwright/{}", crate::VERSION))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("client construction cannot fail with these options");
        Self { client, events_url }
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn changes_since(&self, serial: i64) -> Result<Vec<RawEvent>, SourceError> {
        let url = self
            .events_url
            .join(&format!("changelog/{serial}"))
            .map_err(|e| SourceError::Invalid(e.to_string()))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?;
        if response.status().is_server_error()
            || response.status() == StatusCode::TOO_MANY_REQUESTS
        {
            return Err(SourceError::Transient(response.status().to_string()));
        }
        let response = response
            .error_for_status()
            .map_err(|e| SourceError::Invalid(e.to_string()))?;
        response
            .json::<Vec<RawEvent>>()
            .await
            .map_err(|e| SourceError::Invalid(e.to_string()))
    }
}

/// Side channel that fetches a short human description for a package from
/// the upstream JSON endpoint. Failures are non-fatal; callers get `None`
/// and carry on.
pub struct DescriptionClient {
    client: reqwest::Client,
    json_url: Url,
}

impl DescriptionClient {
    pub fn new(json_url: Url) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(format!("wheelwright/{}", crate::VERSION))
            .timeout(Duration::from_secs(10))
            .build()
            .expect("client construction cannot fail with these options");
        Self { client, json_url }
    }

    pub async fn get(&self, package: &str) -> Option<String> {
        for attempt in 0..DESCRIPTION_RETRIES {
            match self.fetch(package).await {
                Ok(description) => return description,
                Err(err) => {
                    debug!(package, attempt, error = %err, "description lookup failed");
                    tokio::time::sleep(Duration::from_millis(250 * (attempt as u64 + 1))).await;
                }
            }
        }
        None
    }

    async fn fetch(&self, package: &str) -> Result<Option<String>, reqwest::Error> {
        let url = match self.json_url.join(&format!("{package}/json")) {
            Ok(url) => url,
            Err(_) => return Ok(None),
        };
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            // Deleted packages and server-side trouble both read as "no
            // description for now".
            return Ok(None);
        }
        let body: serde_json::Value = response.json().await?;
        let summary = body
            .pointer("/info/summary")
            .and_then(|value| value.as_str())
            .unwrap_or("");
        if summary.chars().count() > DESCRIPTION_LIMIT {
            let truncated: String = summary.chars().take(DESCRIPTION_LIMIT - 1).collect();
            Ok(Some(format!("{truncated}…")))
        } else {
            Ok(Some(summary.to_string()))
        }
    }
}

/// The poller task. Pauseable: while paused the event log simply is not
/// read, and the upstream cursor stays where it was.
pub struct IndexPoller {
    ctrl: ControlChannel,
    db: DbClient,
    source: Box<dyn EventSource>,
    descriptions: DescriptionClient,
    buffer: EventBuffer,
    classifier: EventClassifier,
    web: mpsc::Sender<WebRequest>,
    queue_kick: mpsc::Sender<()>,
    poll: Periodic,
    backoff_until: Option<tokio::time::Instant>,
}

impl IndexPoller {
    pub fn new(
        ctrl: ControlChannel,
        config: &IndexConfig,
        db: DbClient,
        source: Box<dyn EventSource>,
        web: mpsc::Sender<WebRequest>,
        queue_kick: mpsc::Sender<()>,
    ) -> Self {
        Self {
            ctrl,
            db,
            source,
            descriptions: DescriptionClient::new(config.json_url.clone()),
            buffer: EventBuffer::new(config.epoch_serial, config.serial_margin),
            classifier: EventClassifier::new(DEDUP_CACHE_SIZE),
            web,
            queue_kick,
            poll: Periodic::new(config.poll_interval),
            backoff_until: None,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let serial = self.db.get_index_serial().await?;
        self.buffer.set_serial(serial);
        info!(serial, "resuming from persisted serial");
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
                _ = self.poll.tick() => {
                    self.read_events().await?;
                    self.poll.done();
                }
            }
        }
        Ok(())
    }

    async fn read_events(&mut self) -> anyhow::Result<()> {
        if let Some(until) = self.backoff_until {
            if tokio::time::Instant::now() < until {
                return Ok(());
            }
            self.backoff_until = None;
        }
        let batch = match self.source.changes_since(self.buffer.next_read_serial()).await {
            Ok(batch) => batch,
            Err(err) => {
                // Transient upstream trouble is routine; invalid replies are
                // worth a louder note. Neither kills the task.
                match err {
                    SourceError::Transient(_) => debug!(error = %err, "upstream read failed"),
                    SourceError::Invalid(_) => warn!(error = %err, "upstream read failed"),
                }
                self.backoff_until =
                    Some(tokio::time::Instant::now() + Duration::from_secs(10));
                return Ok(());
            }
        };
        if batch.is_empty() {
            // End of the event log; don't bother upstream again for a bit.
            self.backoff_until = Some(tokio::time::Instant::now() + Duration::from_secs(10));
            return Ok(());
        }
        let released = self.buffer.push_batch(batch);
        if released.is_empty() {
            return Ok(());
        }
        let mut changed = false;
        for raw in &released {
            if let Some(event) = self.classifier.classify(raw) {
                changed = true;
                self.handle_event(event).await?;
            }
        }
        self.db.set_index_serial(self.buffer.serial()).await?;
        if changed {
            let _ = self.queue_kick.try_send(());
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: IndexEvent) -> anyhow::Result<()> {
        EVENTS_INGESTED
            .with_label_values(&[match event.kind {
                EventKind::Create => "create",
                EventKind::Source => "source",
                EventKind::Remove => "remove",
                EventKind::Yank => "yank",
                EventKind::Unyank => "unyank",
            }])
            .inc();
        match (event.kind, event.version.clone()) {
            (EventKind::Create, None) => {
                self.ensure_package(&event.package).await?;
            }
            (EventKind::Create, Some(version)) => {
                self.ensure_package(&event.package).await?;
                self.db
                    .add_new_package_version(
                        &event.package,
                        &version,
                        event.timestamp,
                        BINARY_ONLY,
                    )
                    .await?;
                self.send_web(WebRequest::PkgProj(event.package.clone())).await;
            }
            (EventKind::Source, Some(version)) => {
                self.ensure_package(&event.package).await?;
                let created = self
                    .db
                    .add_new_package_version(&event.package, &version, event.timestamp, "")
                    .await?;
                if !created {
                    // The version predates the source artifact; drop its
                    // automatic "binary only" skip so it becomes buildable.
                    let skip = self.db.get_version_skip(&event.package, &version).await?;
                    if skip == BINARY_ONLY {
                        self.db
                            .skip_package_version(&event.package, &version, "")
                            .await?;
                    }
                }
                self.send_web(WebRequest::PkgProj(event.package.clone())).await;
            }
            (EventKind::Remove, Some(version)) => {
                info!(package = %event.package, version = %version, "version removed upstream");
                self.db
                    .skip_package_version(&event.package, &version, DELETED)
                    .await?;
                // The tombstoned version must not keep file rows around, or
                // the rewritten index would list wheels that are gone.
                self.db.delete_builds(&event.package, &version).await?;
                self.send_web(WebRequest::DelVer(event.package.clone(), version))
                    .await;
            }
            (EventKind::Remove, None) => {
                info!(package = %event.package, "package removed upstream");
                self.db.skip_package(&event.package, DELETED).await?;
                self.send_web(WebRequest::DelPkg(event.package.clone())).await;
            }
            (EventKind::Yank, Some(version)) => {
                self.db.yank_version(&event.package, &version).await?;
                self.send_web(WebRequest::PkgBoth(event.package.clone())).await;
            }
            (EventKind::Unyank, Some(version)) => {
                self.db.unyank_version(&event.package, &version).await?;
                self.send_web(WebRequest::PkgBoth(event.package.clone())).await;
            }
            (EventKind::Source | EventKind::Yank | EventKind::Unyank, None) => {
                warn!(package = %event.package, kind = ?event.kind, "event without a version");
            }
        }
        Ok(())
    }

    async fn ensure_package(&mut self, package: &str) -> anyhow::Result<()> {
        let description = self.descriptions.get(package).await.unwrap_or_default();
        let created = self
            .db
            .add_new_package(package, &description, "")
            .await?;
        if created {
            info!(package, "new package");
            self.send_web(WebRequest::PkgBoth(package.to_string())).await;
        } else if !description.is_empty() {
            self.db
                .update_package_description(package, &description)
                .await?;
        }
        Ok(())
    }

    async fn send_web(&self, request: WebRequest) {
        if self.web.send(request).await.is_err() {
            warn!("web queue closed");
        }
    }
}
