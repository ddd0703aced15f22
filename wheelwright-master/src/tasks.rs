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

//! The task runtime: every long-lived component of the master is a tokio
//! task owning its state, fed by bounded channels, with a private control
//! channel for QUIT/PAUSE/RESUME and periodic hooks that absorb overruns.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

/// High-water mark of every control channel.
pub const CONTROL_HWM: usize = 10;

/// Messages accepted on a task's control channel. `Hello` and `Kill` are
/// extensions only the worker router acts on; other tasks ignore them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Control {
    Quit,
    Pause,
    Resume,
    /// A monitor connected; replay current worker state to the status feed.
    Hello,
    /// Terminate the identified worker at its next reply opportunity.
    Kill(u64),
}

/// How a task responds to PAUSE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PauseMode {
    /// The main loop halts until RESUME or QUIT.
    Pauseable,
    /// Inputs keep draining; handlers honour the `paused` flag.
    Pausing,
    /// PAUSE and RESUME are no-ops; the task must keep running.
    NonStop,
}

/// The receiving end of a task's control channel, with the pause-mode
/// bookkeeping applied in one place.
pub struct ControlChannel {
    name: &'static str,
    rx: mpsc::Receiver<Control>,
    mode: PauseMode,
    paused: bool,
}

pub fn control_channel(
    name: &'static str,
    mode: PauseMode,
) -> (mpsc::Sender<Control>, ControlChannel) {
    let (tx, rx) = mpsc::channel(CONTROL_HWM);
    (
        tx,
        ControlChannel {
            name,
            rx,
            mode,
            paused: false,
        },
    )
}

impl ControlChannel {
    pub fn paused(&self) -> bool {
        self.paused
    }

    /// Receives the next control message the task must act on.
    ///
    /// Pause bookkeeping happens here: a `Pausing` task has its flag
    /// maintained and never sees PAUSE/RESUME; a `NonStop` task has them
    /// logged and swallowed; a `Pauseable` task receives `Control::Pause`
    /// and is expected to call [`ControlChannel::wait_resume`] from its
    /// select-arm body so the whole main loop blocks.
    ///
    /// A closed channel is treated as QUIT.
    pub async fn next(&mut self) -> Control {
        loop {
            let Some(msg) = self.rx.recv().await else {
                return Control::Quit;
            };
            match msg {
                Control::Quit => return Control::Quit,
                Control::Pause => match self.mode {
                    PauseMode::NonStop => info!(task = self.name, "pause ignored"),
                    PauseMode::Pausing => {
                        self.paused = true;
                        info!(task = self.name, "paused");
                    }
                    PauseMode::Pauseable => return Control::Pause,
                },
                Control::Resume => match self.mode {
                    PauseMode::NonStop => info!(task = self.name, "resume ignored"),
                    PauseMode::Pausing => {
                        if self.paused {
                            self.paused = false;
                            info!(task = self.name, "resumed");
                        } else {
                            warn!(task = self.name, "resumed while not paused");
                        }
                    }
                    PauseMode::Pauseable => {
                        warn!(task = self.name, "resumed while not paused");
                    }
                },
                other => return other,
            }
        }
    }

    /// Blocks until RESUME or QUIT; called by Pauseable tasks after they
    /// receive `Control::Pause`, outside the select loop, so nothing else
    /// is processed while paused.
    pub async fn wait_resume(&mut self) -> Control {
        info!(task = self.name, "paused");
        loop {
            match self.rx.recv().await {
                None | Some(Control::Quit) => return Control::Quit,
                Some(Control::Resume) => {
                    info!(task = self.name, "resumed");
                    return Control::Resume;
                }
                Some(other) => {
                    warn!(task = self.name, message = ?other, "ignored while paused");
                }
            }
        }
    }
}

/// A periodic hook: due immediately on creation, then once per interval.
/// The clock is re-queried when [`Periodic::done`] is called, so a handler
/// overrunning its interval delays the next run rather than queueing
/// missed ones.
pub struct Periodic {
    interval: Duration,
    due: Instant,
}

impl Periodic {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            due: Instant::now(),
        }
    }

    /// Like [`Periodic::new`] but the first run waits a full interval.
    pub fn starting_later(interval: Duration) -> Self {
        Self {
            interval,
            due: Instant::now() + interval,
        }
    }

    /// Resolves when the hook is due. Call [`Periodic::done`] after running
    /// the handler or this fires again immediately.
    pub async fn tick(&mut self) {
        sleep_until(self.due).await;
    }

    pub fn done(&mut self) {
        self.due = Instant::now() + self.interval;
    }

    /// Makes the hook due at the next poll.
    pub fn force(&mut self) {
        self.due = Instant::now();
    }
}

/// A running task: its name, the sending side of its control channel, and
/// the join handle the supervisor waits on.
pub struct TaskHandle {
    pub name: &'static str,
    control: mpsc::Sender<Control>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub async fn control(&self, msg: Control) {
        if self.control.send(msg).await.is_err() {
            warn!(task = self.name, "control channel closed");
        }
    }

    pub async fn pause(&self) {
        self.control(Control::Pause).await;
    }

    pub async fn resume(&self) {
        self.control(Control::Resume).await;
    }

    pub async fn quit(&self) {
        self.control(Control::Quit).await;
    }

    /// Waits for the task to finish, up to `timeout`; a task that does not
    /// stop in time is aborted.
    pub async fn join(self, timeout: Duration) {
        match tokio::time::timeout(timeout, self.join).await {
            Ok(_) => {}
            Err(_) => {
                warn!(task = self.name, "did not stop in time, aborting");
            }
        }
    }
}

/// Spawns a task future under the runtime's lifecycle logging. A task that
/// returns an error is fatal: the supervisor is told to QUIT and the whole
/// master shuts down in an orderly fashion.
pub fn spawn<F>(
    name: &'static str,
    control: mpsc::Sender<Control>,
    supervisor: mpsc::Sender<Control>,
    task: F,
) -> TaskHandle
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let join = tokio::spawn(async move {
        info!(task = name, "started");
        match task.await {
            Ok(()) => info!(task = name, "stopped"),
            Err(err) => {
                error!(task = name, error = %format!("{err:#}"), "task failed");
                let _ = supervisor.send(Control::Quit).await;
            }
        }
    });
    TaskHandle {
        name,
        control,
        join,
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    async fn pausing_mode_maintains_the_flag() {
        let (tx, mut ctrl) = control_channel("test", PauseMode::Pausing);
        tx.send(Control::Pause).await.unwrap();
        tx.send(Control::Quit).await.unwrap();
        // PAUSE is swallowed; the next visible message is QUIT, with the
        // paused flag set in between.
        assert_eq!(ctrl.next().await, Control::Quit);
        assert!(ctrl.paused());
    }

    #[test]
    async fn nonstop_mode_ignores_pause_and_resume() {
        let (tx, mut ctrl) = control_channel("test", PauseMode::NonStop);
        tx.send(Control::Pause).await.unwrap();
        tx.send(Control::Resume).await.unwrap();
        tx.send(Control::Kill(7)).await.unwrap();
        assert_eq!(ctrl.next().await, Control::Kill(7));
        assert!(!ctrl.paused());
    }

    #[test]
    async fn pauseable_mode_surfaces_pause_and_blocks_until_resume() {
        let (tx, mut ctrl) = control_channel("test", PauseMode::Pauseable);
        tx.send(Control::Pause).await.unwrap();
        assert_eq!(ctrl.next().await, Control::Pause);
        tx.send(Control::Hello).await.unwrap();
        tx.send(Control::Resume).await.unwrap();
        // Hello arriving while paused is dropped; wait_resume only returns
        // on RESUME or QUIT.
        assert_eq!(ctrl.wait_resume().await, Control::Resume);
    }

    #[test]
    async fn closed_control_channel_reads_as_quit() {
        let (tx, mut ctrl) = control_channel("test", PauseMode::Pauseable);
        drop(tx);
        assert_eq!(ctrl.next().await, Control::Quit);
    }

    #[test]
    async fn periodic_fires_immediately_then_waits() {
        tokio::time::pause();
        let mut periodic = Periodic::new(Duration::from_secs(60));
        // Due immediately on creation.
        periodic.tick().await;
        periodic.done();
        // Not due again until the interval has elapsed.
        tokio::time::timeout(Duration::from_secs(59), periodic.tick())
            .await
            .expect_err("should not be due yet");
        periodic.force();
        tokio::time::timeout(Duration::from_secs(1), periodic.tick())
            .await
            .expect("forced hook should be due");
    }
}
