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

//! The file server: credit-based chunked pull of build artifacts from
//! workers, integrity verification, and atomic publication into the output
//! tree. One transfer per (worker, file); the worker router drives the
//! dialog and asks for verification once the worker reports SENT.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use wheelwright_common::model::FileRecord;
use wheelwright_common::protocol::{TransferDown, TransferUp};
use wheelwright_common::transport::BinaryStream;

use crate::config::TransferConfig;
use crate::metrics::{TRANSFERS_FAILED, TRANSFERS_VERIFIED};
use crate::tasks::{Control, ControlChannel, Periodic};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer incomplete")]
    Incomplete,
    #[error("size mismatch: declared {declared}, received {received}")]
    SizeMismatch { declared: u64, received: u64 },
    #[error("hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: String, computed: String },
    #[error("no transfer in progress for this worker")]
    NoTransfer,
    #[error("transfer deadline exceeded")]
    DeadlineExceeded,
}

/// Requests from the worker router (and the admin import dialog).
#[derive(Debug)]
pub enum FsRequest {
    /// Reserve a transfer slot: the identified worker is about to push this
    /// file.
    Expect {
        worker_id: u64,
        file: FileRecord,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// The worker claims the file is fully sent; verify and publish it.
    Verify {
        worker_id: u64,
        package: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

/// State of one in-flight transfer: the spooled temporary file, the rotating
/// queue of un-received ranges, the request credit, and the running hash
/// over the contiguous prefix.
pub struct TransferState {
    file: FileRecord,
    temp: NamedTempFile,
    initial_credit: u32,
    credit: u32,
    ranges: VecDeque<(u64, u32)>,
    hasher: Sha256,
    hashed: u64,
    /// Ranges written to disk but beyond the contiguous hashed prefix.
    unhashed: BTreeMap<u64, u32>,
    started: Instant,
    last_chunk: Instant,
}

impl TransferState {
    /// Reserves a temporary file in the root of the output tree (the same
    /// filesystem as the final target, so the final rename is atomic) and
    /// computes the chunk ranges to request.
    pub fn new(file: FileRecord, config: &TransferConfig, output_path: &Path) -> std::io::Result<Self> {
        let temp = NamedTempFile::new_in(output_path)?;
        let mut ranges = VecDeque::new();
        let mut offset = 0u64;
        while offset < file.filesize {
            let length = (file.filesize - offset).min(config.chunk_size as u64) as u32;
            ranges.push_back((offset, length));
            offset += length as u64;
        }
        let now = Instant::now();
        Ok(Self {
            file,
            temp,
            initial_credit: config.credit.max(1),
            credit: config.credit.max(1),
            ranges,
            hasher: Sha256::new(),
            hashed: 0,
            unhashed: BTreeMap::new(),
            started: now,
            last_chunk: now,
        })
    }

    pub fn file(&self) -> &FileRecord {
        &self.file
    }

    pub fn done(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The next range to request, if credit remains. Un-received ranges
    /// rotate, so stragglers are re-requested; the same (offset, length) is
    /// idempotent on the worker side.
    pub fn fetch(&mut self) -> Option<(u64, u32)> {
        if self.credit == 0 || self.ranges.is_empty() {
            return None;
        }
        self.credit -= 1;
        let range = self.ranges.pop_front()?;
        self.ranges.push_back(range);
        Some(range)
    }

    /// Restores full credit after a silence, so the next poll re-requests
    /// outstanding ranges.
    pub fn reset_credit(&mut self) {
        self.credit = self.initial_credit;
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_chunk)
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.started)
    }

    /// Accepts one chunk: writes it at its offset and extends the running
    /// hash over the contiguous prefix. Duplicate or unexpected chunks are
    /// ignored.
    pub fn chunk(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        self.last_chunk = Instant::now();
        let position = self
            .ranges
            .iter()
            .position(|(start, length)| *start == offset && *length as usize == data.len());
        let Some(position) = position else {
            debug!(offset, "duplicate or unexpected chunk");
            return Ok(());
        };
        self.ranges.remove(position);
        self.credit = (self.credit + 1).min(self.initial_credit);
        let handle = self.temp.as_file_mut();
        handle.seek(SeekFrom::Start(offset))?;
        handle.write_all(data)?;
        if offset == self.hashed {
            self.hasher.update(data);
            self.hashed += data.len() as u64;
            self.drain_unhashed()?;
        } else {
            self.unhashed.insert(offset, data.len() as u32);
        }
        Ok(())
    }

    /// Feeds any now-contiguous spooled ranges into the hasher by reading
    /// them back from disk.
    fn drain_unhashed(&mut self) -> std::io::Result<()> {
        use std::io::Read;
        while let Some(length) = self.unhashed.remove(&self.hashed) {
            let handle = self.temp.as_file_mut();
            handle.seek(SeekFrom::Start(self.hashed))?;
            let mut buffer = vec![0u8; length as usize];
            handle.read_exact(&mut buffer)?;
            self.hasher.update(&buffer);
            self.hashed += length as u64;
        }
        Ok(())
    }

    /// Confirms the received byte count and content hash match the worker's
    /// declaration.
    pub fn verify(&mut self) -> Result<(), TransferError> {
        if !self.done() {
            return Err(TransferError::Incomplete);
        }
        self.temp.as_file_mut().flush()?;
        let received = self.temp.as_file().metadata()?.len();
        if received != self.file.filesize {
            return Err(TransferError::SizeMismatch {
                declared: self.file.filesize,
                received,
            });
        }
        if self.hashed != self.file.filesize {
            return Err(TransferError::Incomplete);
        }
        let computed = hex::encode(self.hasher.clone().finalize());
        if !computed.eq_ignore_ascii_case(&self.file.filehash) {
            return Err(TransferError::HashMismatch {
                declared: self.file.filehash.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// Atomically publishes the verified file as
    /// `simple/<package>/<filename>` with mode 0644, plus the armv6l
    /// compatibility symlink where applicable.
    pub fn commit(self, package: &str, output_path: &Path) -> Result<PathBuf, TransferError> {
        let pkg_dir = output_path.join("simple").join(package);
        mkdir_override_symlink(&pkg_dir)?;
        let final_path = pkg_dir.join(&self.file.filename);
        self.temp.as_file().sync_all()?;
        set_mode_0644(self.temp.as_file())?;
        self.temp
            .persist(&final_path)
            .map_err(|e| TransferError::Io(e.error))?;
        if let Some(alias) = self.file.armv6_alias() {
            let link = pkg_dir.join(&alias);
            if !link.exists() {
                symlink_file(&self.file.filename, &link)?;
            }
        }
        Ok(final_path)
    }

    /// Discards the temporary file; the final target is untouched.
    pub fn rollback(self) {
        // NamedTempFile removes the spooled file on drop.
    }
}

#[cfg(unix)]
fn set_mode_0644(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_mode_0644(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn symlink_file(target: &str, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink_file(_target: &str, _link: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Ensures `path` is a real directory. An alias symlink in the way is
/// replaced by a real directory; its content lives on in the canonical
/// target the symlink pointed at.
pub fn mkdir_override_symlink(path: &Path) -> std::io::Result<()> {
    if path.symlink_metadata().map(|m| m.is_symlink()).unwrap_or(false) {
        std::fs::remove_file(path)?;
    }
    match std::fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

/// Atomically replaces `path` with `content`: a same-directory temporary is
/// written, synced, set to mode 0644 and renamed over the target. Readers
/// see the old content or the new, never a partial write.
pub fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent directory"))?;
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    set_mode_0644(temp.as_file())?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

enum ConnEvent {
    Register {
        worker_id: u64,
        commands: mpsc::Sender<TransferDown>,
    },
    Chunk {
        worker_id: u64,
        offset: u64,
        data: Vec<u8>,
    },
    Closed {
        worker_id: u64,
    },
}

/// The file server task. NonStop: an in-flight transfer must be allowed to
/// finish even while the master is paused.
pub struct FileServer {
    ctrl: ControlChannel,
    config: TransferConfig,
    output_path: PathBuf,
    listener: TcpListener,
    requests: mpsc::Receiver<FsRequest>,
    events_tx: mpsc::Sender<ConnEvent>,
    events: mpsc::Receiver<ConnEvent>,
    connections: HashMap<u64, mpsc::Sender<TransferDown>>,
    transfers: HashMap<u64, TransferState>,
    sweep: Periodic,
}

impl FileServer {
    pub async fn bind(
        ctrl: ControlChannel,
        config: TransferConfig,
        output_path: PathBuf,
        addr: &str,
        requests: mpsc::Receiver<FsRequest>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr, "file endpoint listening");
        let (events_tx, events) = mpsc::channel(100);
        let sweep = Periodic::starting_later(config.chunk_timeout.min(Duration::from_secs(5)));
        Ok(Self {
            ctrl,
            config,
            output_path,
            listener,
            requests,
            events_tx,
            events,
            connections: HashMap::new(),
            transfers: HashMap::new(),
            sweep,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
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
                        Ok((socket, addr)) => {
                            debug!(%addr, "file connection accepted");
                            tokio::spawn(connection(socket, self.events_tx.clone()));
                        }
                        Err(err) => warn!(error = %err, "file accept failed"),
                    }
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                }
                Some(request) = self.requests.recv() => {
                    self.handle_request(request).await;
                }
                _ = self.sweep.tick() => {
                    self.sweep_timeouts().await;
                    self.sweep.done();
                }
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Register {
                worker_id,
                commands,
            } => {
                self.connections.insert(worker_id, commands);
                // A transfer may already be waiting for this channel.
                self.pump(worker_id).await;
            }
            ConnEvent::Chunk {
                worker_id,
                offset,
                data,
            } => {
                let Some(transfer) = self.transfers.get_mut(&worker_id) else {
                    debug!(worker_id, "chunk without a transfer");
                    return;
                };
                if let Err(err) = transfer.chunk(offset, &data) {
                    warn!(worker_id, error = %err, "failed to spool chunk");
                    self.abort(worker_id);
                    return;
                }
                self.pump(worker_id).await;
            }
            ConnEvent::Closed { worker_id } => {
                self.connections.remove(&worker_id);
            }
        }
    }

    async fn handle_request(&mut self, request: FsRequest) {
        match request {
            FsRequest::Expect {
                worker_id,
                file,
                reply,
            } => {
                let result = TransferState::new(file, &self.config, &self.output_path);
                let result = match result {
                    Ok(transfer) => {
                        info!(worker_id, filename = %transfer.file().filename, "expecting file");
                        self.transfers.insert(worker_id, transfer);
                        self.pump(worker_id).await;
                        Ok(())
                    }
                    Err(err) => Err(err.to_string()),
                };
                let _ = reply.send(result);
            }
            FsRequest::Verify {
                worker_id,
                package,
                reply,
            } => {
                let result = self.verify(worker_id, &package).await;
                if result.is_ok() {
                    TRANSFERS_VERIFIED.inc();
                    if let Some(commands) = self.connections.get(&worker_id) {
                        let _ = commands.send(TransferDown::Done).await;
                    }
                } else {
                    TRANSFERS_FAILED.inc();
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn verify(&mut self, worker_id: u64, package: &str) -> Result<(), String> {
        let Some(mut transfer) = self.transfers.remove(&worker_id) else {
            return Err(TransferError::NoTransfer.to_string());
        };
        match transfer.verify() {
            Ok(()) => match transfer.commit(package, &self.output_path) {
                Ok(path) => {
                    info!(worker_id, path = %path.display(), "file published");
                    Ok(())
                }
                Err(err) => {
                    warn!(worker_id, error = %err, "publish failed");
                    Err(err.to_string())
                }
            },
            Err(err) => {
                warn!(worker_id, error = %err, "verification failed");
                transfer.rollback();
                Err(err.to_string())
            }
        }
    }

    /// Issues as many FETCH requests as the transfer's credit allows.
    async fn pump(&mut self, worker_id: u64) {
        let Some(transfer) = self.transfers.get_mut(&worker_id) else {
            return;
        };
        let Some(commands) = self.connections.get(&worker_id) else {
            return;
        };
        while let Some((offset, length)) = transfer.fetch() {
            if commands
                .send(TransferDown::Fetch { offset, length })
                .await
                .is_err()
            {
                self.connections.remove(&worker_id);
                break;
            }
        }
    }

    async fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut stalled = Vec::new();
        for (worker_id, transfer) in &self.transfers {
            if transfer.age(now) > self.config.deadline {
                expired.push(*worker_id);
            } else if !transfer.done() && transfer.silent_for(now) > self.config.chunk_timeout {
                stalled.push(*worker_id);
            }
        }
        for worker_id in expired {
            warn!(worker_id, "transfer deadline exceeded");
            self.abort(worker_id);
        }
        for worker_id in stalled {
            debug!(worker_id, "transfer stalled, re-requesting");
            if let Some(transfer) = self.transfers.get_mut(&worker_id) {
                transfer.reset_credit();
            }
            self.pump(worker_id).await;
        }
    }

    fn abort(&mut self, worker_id: u64) {
        if let Some(transfer) = self.transfers.remove(&worker_id) {
            TRANSFERS_FAILED.inc();
            transfer.rollback();
        }
    }
}

/// Per-connection pump: the first frame names the worker, then chunks flow
/// up while FETCH/DONE commands flow down.
async fn connection(socket: TcpStream, events: mpsc::Sender<ConnEvent>) {
    let mut stream: BinaryStream<TransferUp, TransferDown, _> = BinaryStream::new(socket);
    let worker_id = match stream.recv().await {
        Ok(TransferUp::Hello { worker_id }) => worker_id,
        Ok(_) => {
            warn!("file connection did not introduce itself");
            return;
        }
        Err(err) => {
            debug!(error = %err, "file connection lost before hello");
            return;
        }
    };
    let (commands_tx, mut commands) = mpsc::channel::<TransferDown>(100);
    if events
        .send(ConnEvent::Register {
            worker_id,
            commands: commands_tx,
        })
        .await
        .is_err()
    {
        return;
    }
    loop {
        tokio::select! {
            Some(command) = commands.recv() => {
                if stream.send(&command).await.is_err() {
                    break;
                }
            }
            frame = stream.recv() => {
                match frame {
                    Ok(TransferUp::Chunk { offset, data }) => {
                        if events
                            .send(ConnEvent::Chunk { worker_id, offset, data })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(TransferUp::Hello { .. }) => {
                        debug!(worker_id, "unexpected hello mid-stream");
                    }
                    Err(err) if err.is_recoverable() => {
                        warn!(worker_id, error = %err, "bad frame on file connection");
                    }
                    Err(_) => break,
                }
            }
        }
    }
    let _ = events.send(ConnEvent::Closed { worker_id }).await;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use test_r::test;

    use super::*;

    fn file_record(content: &[u8]) -> FileRecord {
        FileRecord {
            filename: "foo-0.1-cp34-cp34m-linux_armv7l.whl".to_string(),
            filesize: content.len() as u64,
            filehash: hex::encode(Sha256::digest(content)),
            package_tag: "foo".to_string(),
            package_version_tag: "0.1".to_string(),
            py_version_tag: "cp34".to_string(),
            abi_tag: "cp34m".to_string(),
            platform_tag: "linux_armv7l".to_string(),
            dependencies: BTreeSet::new(),
        }
    }

    fn config() -> TransferConfig {
        TransferConfig {
            chunk_size: 64 * 1024,
            credit: 1,
            chunk_timeout: Duration::from_secs(30),
            deadline: Duration::from_secs(600),
        }
    }

    fn content() -> Vec<u8> {
        (0..123456u32).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn fetch_walks_the_file_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let content = content();
        let mut transfer =
            TransferState::new(file_record(&content), &config(), dir.path()).unwrap();
        let first = transfer.fetch().unwrap();
        assert_eq!(first, (0, 65536));
        transfer.chunk(0, &content[..65536]).unwrap();
        let second = transfer.fetch().unwrap();
        assert_eq!(second, (65536, 123456 - 65536));
        transfer.chunk(65536, &content[65536..]).unwrap();
        assert!(transfer.done());
        assert_eq!(transfer.fetch(), None);
    }

    #[test]
    fn outstanding_ranges_rotate_under_extra_credit() {
        let dir = tempfile::tempdir().unwrap();
        let content = content();
        let mut transfer =
            TransferState::new(file_record(&content), &config(), dir.path()).unwrap();
        transfer.credit = 10;
        transfer.initial_credit = 10;
        assert_eq!(transfer.fetch().unwrap(), (0, 65536));
        assert_eq!(transfer.fetch().unwrap(), (65536, 123456 - 65536));
        // With nothing received yet the queue wraps around and the first
        // range is requested again; the repeat is idempotent.
        assert_eq!(transfer.fetch().unwrap(), (0, 65536));
        transfer.chunk(0, &content[..65536]).unwrap();
        assert_eq!(transfer.fetch().unwrap(), (65536, 123456 - 65536));
        transfer.chunk(65536, &content[65536..]).unwrap();
        assert!(transfer.done());
    }

    #[test]
    fn out_of_order_chunks_still_hash_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let content = content();
        let mut transfer =
            TransferState::new(file_record(&content), &config(), dir.path()).unwrap();
        transfer.chunk(65536, &content[65536..]).unwrap();
        transfer.chunk(0, &content[..65536]).unwrap();
        assert!(transfer.done());
        transfer.verify().expect("hash should match");
    }

    #[test]
    fn verification_rejects_a_wrong_hash() {
        let dir = tempfile::tempdir().unwrap();
        let content = content();
        let mut record = file_record(&content);
        record.filehash = "0".repeat(64);
        let mut transfer = TransferState::new(record, &config(), dir.path()).unwrap();
        transfer.chunk(0, &content[..65536]).unwrap();
        transfer.chunk(65536, &content[65536..]).unwrap();
        assert!(matches!(
            transfer.verify(),
            Err(TransferError::HashMismatch { .. })
        ));
    }

    #[test]
    fn verification_rejects_an_incomplete_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let content = content();
        let mut transfer =
            TransferState::new(file_record(&content), &config(), dir.path()).unwrap();
        transfer.chunk(0, &content[..65536]).unwrap();
        assert!(matches!(
            transfer.verify(),
            Err(TransferError::Incomplete)
        ));
    }

    #[test]
    fn commit_publishes_with_an_armv6_symlink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("simple")).unwrap();
        let content = content();
        let mut transfer =
            TransferState::new(file_record(&content), &config(), dir.path()).unwrap();
        transfer.chunk(0, &content[..65536]).unwrap();
        transfer.chunk(65536, &content[65536..]).unwrap();
        transfer.verify().unwrap();
        let path = transfer.commit("foo", dir.path()).unwrap();
        assert_eq!(
            path,
            dir.path()
                .join("simple/foo/foo-0.1-cp34-cp34m-linux_armv7l.whl")
        );
        assert_eq!(std::fs::read(&path).unwrap(), content);
        let link = dir
            .path()
            .join("simple/foo/foo-0.1-cp34-cp34m-linux_armv6l.whl");
        assert!(link.symlink_metadata().unwrap().is_symlink());
        assert_eq!(std::fs::canonicalize(&link).unwrap(), path.canonicalize().unwrap());
    }

    #[test]
    fn commit_does_not_clobber_an_existing_armv6_file() {
        let dir = tempfile::tempdir().unwrap();
        let pkg_dir = dir.path().join("simple/foo");
        std::fs::create_dir_all(&pkg_dir).unwrap();
        let existing = pkg_dir.join("foo-0.1-cp34-cp34m-linux_armv6l.whl");
        std::fs::write(&existing, b"native armv6 build").unwrap();
        let content = content();
        let mut transfer =
            TransferState::new(file_record(&content), &config(), dir.path()).unwrap();
        transfer.chunk(0, &content[..65536]).unwrap();
        transfer.chunk(65536, &content[65536..]).unwrap();
        transfer.verify().unwrap();
        transfer.commit("foo", dir.path()).unwrap();
        assert!(!existing.symlink_metadata().unwrap().is_symlink());
        assert_eq!(std::fs::read(&existing).unwrap(), b"native armv6 build");
    }

    #[test]
    fn commit_replaces_an_alias_symlink_with_a_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("simple/bar")).unwrap();
        symlink_file("bar", &dir.path().join("simple/foo")).unwrap();
        let content = content();
        let mut transfer =
            TransferState::new(file_record(&content), &config(), dir.path()).unwrap();
        transfer.chunk(0, &content[..65536]).unwrap();
        transfer.chunk(65536, &content[65536..]).unwrap();
        transfer.verify().unwrap();
        let path = transfer.commit("foo", dir.path()).unwrap();
        let pkg_dir = dir.path().join("simple/foo");
        assert!(!pkg_dir.symlink_metadata().unwrap().is_symlink());
        assert!(pkg_dir.is_dir());
        assert!(path.exists());
    }

    #[test]
    fn rollback_leaves_no_temporary_behind() {
        let dir = tempfile::tempdir().unwrap();
        let content = content();
        let mut transfer =
            TransferState::new(file_record(&content), &config(), dir.path()).unwrap();
        transfer.chunk(0, &content[..65536]).unwrap();
        transfer.rollback();
        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .collect();
        assert!(remaining.is_empty(), "temporary should be deleted");
    }

    #[test]
    fn atomic_write_replaces_content_whole() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("index.html");
        atomic_write(&target, b"first").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"first");
        atomic_write(&target, b"second").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"second");
        // No stray temporaries left next to the target.
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
