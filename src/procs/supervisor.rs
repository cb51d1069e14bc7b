// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::{mpsc, oneshot};
use futures::future::FutureExt;
use futures::stream::StreamExt;
use futures::{pin_mut, select};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::process::Child;
use tokio::runtime::Handle;
use tokio::time;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::command::{CommandTemplate, Sink};
use crate::error::ErrorKind;
use crate::procs::backoff::{Attempts, Backoff};
use crate::procs::launcher::{self, StdIoConf};
use crate::Error;

/// Time given to the daemon to exit after being interrupted, before it is killed
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a [`Supervisor`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Created, `start` has not been called
    Idle,
    /// The supervision loop has been spawned
    Running,
    /// Terminal, the daemon will never be started again
    Stopped,
}

/// Secret handed to the daemon through its environment, never printed
#[derive(Clone, PartialEq, Eq)]
struct Token(String);

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

/// A signal for the supervision loop to deliver to the running daemon, with the result of `kill`
type SignalRequest = (Signal, oneshot::Sender<nix::Result<()>>);

/// Mutable state, only ever touched under the lock
struct Inner {
    state: State,
    pid: Option<Pid>,
    stop: Option<oneshot::Sender<()>>,
    signals: Option<mpsc::UnboundedSender<SignalRequest>>,
    exited: Option<oneshot::Receiver<()>>,
}

struct Shared {
    command: CommandTemplate,
    token: Token,
    graceful_timeout: Duration,
    backoff: Backoff,
    stdio: StdIoConf,
    span: Span,
    inner: Mutex<Inner>,
}

/// Keeps a single daemon process running.
///
/// Rules:
///   - at most one child process is alive at a time
///   - a crashed child is restarted, backing off exponentially while it keeps crashing
///   - stopping interrupts the child, and kills it if it does not exit in time
///   - once stopped, a supervisor can never be started again
///
/// Dropping a running supervisor does not stop the daemon, `stop` must be called for that.
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    /// Supervisor with the default graceful timeout, backoff and inherited output
    pub fn new(command: CommandTemplate, token: impl Into<String>) -> Self {
        Self::builder(command, token).build()
    }

    /// Builder for a supervisor that needs more than the defaults
    pub fn builder(command: CommandTemplate, token: impl Into<String>) -> Builder {
        Builder {
            command,
            token: Token(token.into()),
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
            backoff: Backoff::default(),
            stdio: StdIoConf::default(),
            span: None,
        }
    }

    /// Start the daemon and keep it running.
    ///
    /// This returns as soon as the supervision loop is scheduled, the daemon itself is launched in
    /// the background. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), Error> {
        let mut inner = self.shared.inner.lock();

        match inner.state {
            State::Stopped => return Err(ErrorKind::AlreadyStopped.into()),
            State::Running => return Ok(()),
            State::Idle => (),
        }

        let runtime = Handle::try_current()?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (signals_tx, signals_rx) = mpsc::unbounded();
        let (exited_tx, exited_rx) = oneshot::channel();
        inner.stop = Some(stop_tx);
        inner.signals = Some(signals_tx);
        inner.exited = Some(exited_rx);
        inner.state = State::Running;

        let shared = Arc::clone(&self.shared);
        let span = self.shared.span.clone();
        runtime.spawn(keep_alive(shared, stop_rx, signals_rx, exited_tx).instrument(span));

        Ok(())
    }

    /// Stop the daemon.
    ///
    /// The daemon is interrupted (SIGINT) and given the graceful timeout to exit before it is
    /// killed (SIGKILL). Either way it will not be restarted, and the supervisor cannot be started
    /// again.
    ///
    /// This is safe to call multiple times, stopping an already stopped, or never started,
    /// supervisor is not an error.
    pub async fn stop(&self) -> Result<(), Error> {
        let (signals, exited) = {
            let mut inner = self.shared.inner.lock();

            if inner.state == State::Stopped {
                return Ok(());
            }

            inner.state = State::Stopped;
            if let Some(stop) = inner.stop.take() {
                // the loop may already be gone
                let _ = stop.send(());
            }

            let signals = inner.signals.take();
            let exited = inner.exited.take();
            match (inner.pid, signals, exited) {
                (Some(_), Some(signals), Some(exited)) => (signals, exited),
                _ => return Ok(()),
            }
        };

        let span = self.shared.span.clone();
        shutdown(signals, exited, self.shared.graceful_timeout)
            .instrument(span)
            .await
    }

    /// Current lifecycle state
    pub fn state(&self) -> State {
        self.shared.inner.lock().state
    }

    /// Process id of the running daemon, if one is currently alive
    pub fn pid(&self) -> Option<u32> {
        self.shared
            .inner
            .lock()
            .pid
            .map(|pid| pid.as_raw() as u32)
    }

    /// The command launched for the daemon
    pub fn command(&self) -> &CommandTemplate {
        &self.shared.command
    }
}

/// Supervisors are equal when they would launch the same daemon with the same token.
///
/// Output sinks, timeouts and the current state are not compared.
impl PartialEq for Supervisor {
    fn eq(&self, other: &Self) -> bool {
        self.shared.token == other.shared.token && self.shared.command == other.shared.command
    }
}

impl Eq for Supervisor {}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("command", &self.shared.command)
            .field("token", &self.shared.token)
            .field("graceful_timeout", &self.shared.graceful_timeout)
            .field("backoff", &self.shared.backoff)
            .field("state", &self.state())
            .finish()
    }
}

/// Configures a [`Supervisor`] before it is created
#[derive(Debug)]
pub struct Builder {
    command: CommandTemplate,
    token: Token,
    graceful_timeout: Duration,
    backoff: Backoff,
    stdio: StdIoConf,
    span: Option<Span>,
}

impl Builder {
    pub fn graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = timeout;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn stdout(mut self, sink: Sink) -> Self {
        self.stdio.stdout = sink;
        self
    }

    pub fn stderr(mut self, sink: Sink) -> Self {
        self.stdio.stderr = sink;
        self
    }

    /// Span that all logging about this daemon is recorded in
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> Supervisor {
        let span = match self.span {
            Some(span) => span,
            None => info_span!("daemon", path = %self.command.path().display()),
        };

        Supervisor {
            shared: Arc::new(Shared {
                command: self.command,
                token: self.token,
                graceful_timeout: self.graceful_timeout,
                backoff: self.backoff,
                stdio: self.stdio,
                span,
                inner: Mutex::new(Inner {
                    state: State::Idle,
                    pid: None,
                    stop: None,
                    signals: None,
                    exited: None,
                }),
            }),
        }
    }
}

/// Launches the daemon and relaunches it every time it exits, until stopped.
///
/// The only ways out are being stopped during a backoff wait, or finding the state stopped right
/// before a launch. `exited` is dropped on return, which is what `stop` waits on.
///
/// Signals for the daemon are delivered from here, through the `Child` this loop owns, so a daemon
/// that has already been reaped is never signalled by pid.
async fn keep_alive(
    shared: Arc<Shared>,
    mut stop: oneshot::Receiver<()>,
    mut signals: mpsc::UnboundedReceiver<SignalRequest>,
    exited: oneshot::Sender<()>,
) {
    let _exited = exited;
    let mut attempts = Attempts::new(shared.backoff);

    loop {
        let wait = attempts.next(Instant::now());
        if wait > Duration::ZERO {
            warn!(?wait, attempts = attempts.count(), "waiting before restarting daemon");

            // a sent or a dropped stop both end the wait
            if time::timeout(wait, &mut stop).await.is_ok() {
                return;
            }
        }

        let mut child = {
            let mut inner = shared.inner.lock();

            if inner.state == State::Stopped {
                return;
            }

            match launcher::launch(&shared.command, &shared.token.0, &shared.stdio) {
                Ok(child) => {
                    inner.pid = child.id().map(|id| Pid::from_raw(id as i32));
                    child
                }
                Err(err) => {
                    drop(inner);

                    let err = Error::from_kind(ErrorKind::Launch(err));
                    error!(error = %err, "error restarting daemon");
                    continue;
                }
            }
        };

        let status = loop {
            let event = {
                let exit = child.wait().fuse();
                pin_mut!(exit);

                select! {
                    status = exit => Event::Exited(status),
                    request = signals.next() => Event::Signal(request),
                }
            };

            match event {
                Event::Exited(status) => break status,
                Event::Signal(Some((sig, reply))) => {
                    // stop may have given up waiting on the reply
                    let _ = reply.send(signal_child(&child, sig));
                }
                Event::Signal(None) => (),
            }
        };
        shared.inner.lock().pid = None;

        match status {
            Err(err) => info!(error = %err, "daemon exited with error"),
            Ok(status) => match (status.code(), status.signal()) {
                (Some(code), _) => info!(code, "daemon exited with exit code"),
                (None, Some(signal)) => info!(signal, "daemon exited from signal"),
                (None, None) => info!("daemon exited"),
            },
        }
    }
}

enum Event {
    Exited(io::Result<ExitStatus>),
    Signal(Option<SignalRequest>),
}

/// Signal the daemon, a no-op once it has been reaped
fn signal_child(child: &Child, sig: Signal) -> nix::Result<()> {
    match child.id() {
        Some(id) => signal::kill(Pid::from_raw(id as i32), sig),
        None => Ok(()),
    }
}

/// Have the supervision loop signal the daemon, `None` if the loop has already finished
async fn request_signal(
    signals: &mpsc::UnboundedSender<SignalRequest>,
    sig: Signal,
) -> Option<nix::Result<()>> {
    let (reply, result) = oneshot::channel();
    signals.unbounded_send((sig, reply)).ok()?;

    result.await.ok()
}

/// Interrupt the daemon, killing it if it has not exited within `graceful_timeout`
async fn shutdown(
    signals: mpsc::UnboundedSender<SignalRequest>,
    exited: oneshot::Receiver<()>,
    graceful_timeout: Duration,
) -> Result<(), Error> {
    match request_signal(&signals, Signal::SIGINT).await {
        None => return Ok(()),
        Some(Ok(())) => {
            // the loop drops its sender when it returns
            if time::timeout(graceful_timeout, exited).await.is_ok() {
                return Ok(());
            }

            warn!("daemon did not exit after interrupt, killing");
        }
        Some(Err(err)) => warn!(error = %err, "error interrupting daemon, killing"),
    }

    match request_signal(&signals, Signal::SIGKILL).await {
        None => Ok(()),
        Some(result) => result.map_err(|err| ErrorKind::Kill(err).into()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        wait_within(Duration::from_secs(5), cond).await
    }

    async fn wait_within<F: Fn() -> bool>(limit: Duration, cond: F) {
        let deadline = Instant::now() + limit;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// The supervision loop holds the only other reference to the shared state
    fn loop_finished(supervisor: &Supervisor) -> bool {
        Arc::strong_count(&supervisor.shared) == 1
    }

    fn lines(path: &Path) -> usize {
        fs::read_to_string(path)
            .map(|out| out.lines().count())
            .unwrap_or(0)
    }

    fn sh(script: &str) -> CommandTemplate {
        CommandTemplate::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .inherit_env()
    }

    fn supervised(script: &str) -> (tempfile::NamedTempFile, Builder) {
        let out = tempfile::NamedTempFile::new().expect("failed to create temp file");
        let sink = Sink::file(out.reopen().expect("failed to reopen temp file"));
        let builder = Supervisor::builder(sh(script), "token").stdout(sink);

        (out, builder)
    }

    #[test]
    fn test_start_needs_runtime() {
        let supervisor = Supervisor::new(sh("exit 0"), "token");

        let err = supervisor.start().expect_err("start should fail");
        assert!(matches!(err.kind(), ErrorKind::NoRuntime(_)));
        assert_eq!(supervisor.state(), State::Idle);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let supervisor = Supervisor::new(sh("exit 0"), "token");

        supervisor.stop().await.expect("stop failed");
        assert_eq!(supervisor.state(), State::Stopped);

        let err = supervisor.start().expect_err("start after stop");
        assert!(err.is_stopped());
    }

    #[tokio::test]
    async fn test_start_twice_runs_one_loop() {
        let (out, builder) = supervised("echo launched; exec sleep 30");
        let supervisor = builder.build();

        supervisor.start().expect("start failed");
        supervisor.start().expect("second start failed");
        assert_eq!(supervisor.state(), State::Running);

        wait_for(|| lines(out.path()) >= 1).await;
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(lines(out.path()), 1);

        supervisor.stop().await.expect("stop failed");
    }

    #[tokio::test]
    async fn test_restarts_after_exit() {
        let (out, builder) = supervised("echo launched; exit 1");
        let supervisor = builder
            .backoff(Backoff {
                min_attempts: 1_000,
                ..Backoff::default()
            })
            .build();

        supervisor.start().expect("start failed");
        wait_for(|| lines(out.path()) >= 10).await;

        supervisor.stop().await.expect("stop failed");

        // nothing is launched once stop has returned
        time::sleep(Duration::from_millis(50)).await;
        let launched = lines(out.path());
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(lines(out.path()), launched);
    }

    #[tokio::test]
    async fn test_backoff_after_three_crashes() {
        let (out, builder) = supervised("echo launched; exit 1");
        let supervisor = builder.build();

        supervisor.start().expect("start failed");
        wait_for(|| lines(out.path()) >= 3).await;

        // the fourth launch waits two seconds
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(lines(out.path()), 3);

        let started = Instant::now();
        supervisor.stop().await.expect("stop failed");
        assert!(started.elapsed() < Duration::from_secs(1));

        // the wait is cut short, not slept out
        wait_within(Duration::from_millis(500), || loop_finished(&supervisor)).await;
        assert_eq!(lines(out.path()), 3);
    }

    #[tokio::test]
    async fn test_stop_during_long_backoff() {
        let (out, builder) = supervised("echo launched; exit 1");
        let supervisor = builder
            .backoff(Backoff {
                min_attempts: 1,
                max_wait: Duration::from_secs(30),
                ..Backoff::default()
            })
            .build();

        supervisor.start().expect("start failed");
        wait_for(|| lines(out.path()) >= 1 && supervisor.pid().is_none()).await;
        time::sleep(Duration::from_millis(100)).await;

        supervisor.stop().await.expect("stop failed");
        wait_within(Duration::from_millis(500), || loop_finished(&supervisor)).await;
        assert_eq!(lines(out.path()), 1);
    }

    #[tokio::test]
    async fn test_graceful_stop() {
        let (out, builder) = supervised("echo ready; exec sleep 30");
        let supervisor = builder.graceful_timeout(Duration::from_secs(10)).build();

        supervisor.start().expect("start failed");
        wait_for(|| lines(out.path()) >= 1 && supervisor.pid().is_some()).await;

        let started = Instant::now();
        supervisor.stop().await.expect("stop failed");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(supervisor.state(), State::Stopped);
        wait_within(Duration::from_millis(500), || loop_finished(&supervisor)).await;
        assert_eq!(supervisor.pid(), None);

        // stopping again is a no-op
        supervisor.stop().await.expect("second stop failed");
    }

    #[tokio::test]
    async fn test_forced_stop() {
        let (out, builder) = supervised("trap '' INT; echo ready; exec sleep 30");
        let timeout = Duration::from_millis(300);
        let supervisor = builder.graceful_timeout(timeout).build();

        supervisor.start().expect("start failed");
        wait_for(|| lines(out.path()) >= 1 && supervisor.pid().is_some()).await;

        let started = Instant::now();
        supervisor.stop().await.expect("stop failed");
        assert!(started.elapsed() >= timeout);

        // the killed daemon is reaped and not replaced
        wait_for(|| loop_finished(&supervisor)).await;
        assert_eq!(supervisor.pid(), None);
        assert_eq!(lines(out.path()), 1);

        // the kill is only ever sent once
        let started = Instant::now();
        supervisor.stop().await.expect("second stop failed");
        assert!(started.elapsed() < timeout);

        let err = supervisor.start().expect_err("start after stop");
        assert!(err.is_stopped());
    }

    #[tokio::test]
    async fn test_reaped_daemon_is_not_signalled() {
        let mut child = launcher::launch(&sh("exit 0"), "token", &StdIoConf::default())
            .expect("launch failed");
        assert!(child.id().is_some());

        child.wait().await.expect("wait failed");
        assert_eq!(child.id(), None);

        signal_child(&child, Signal::SIGKILL).expect("signalled a reaped daemon");
    }

    #[test]
    fn test_equality() {
        let base = || CommandTemplate::new("/bin/daemon").arg("-v").env("A", "1");

        let a = Supervisor::new(base(), "token");
        let b = Supervisor::builder(base(), "token")
            .graceful_timeout(Duration::from_secs(1))
            .stdout(Sink::Null)
            .build();
        assert_eq!(a, b);

        assert_ne!(a, Supervisor::new(base().arg("-x"), "token"));
        assert_ne!(a, Supervisor::new(base().env("B", "2"), "token"));
        assert_ne!(a, Supervisor::new(base().current_dir("/tmp"), "token"));
        assert_ne!(a, Supervisor::new(base(), "other"));
        assert_ne!(
            a,
            Supervisor::new(
                CommandTemplate::new("/bin/other").arg("-v").env("A", "1"),
                "token"
            )
        );
    }

    #[test]
    fn test_debug_hides_token() {
        let supervisor = Supervisor::new(sh("exit 0"), "hunter2");

        let debug = format!("{:?}", supervisor);
        assert!(!debug.contains("hunter2"));
    }
}
