use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use portable_pty::Child;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::errors::ExecError;
use super::request::ExecutionRequest;

const READ_BUFFER_BYTES: usize = 8192;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const REAP_POLL: Duration = Duration::from_millis(20);
const REAP_ATTEMPTS: usize = 100;
const TERM: &str = "xterm";

/// What the PTY reader thread observed.
#[derive(Debug)]
pub(crate) enum ReaderEvent {
    Data(Vec<u8>),
    Eof,
    Error(std::io::Error),
}

/// A live process attached to the slave side of a pseudo-terminal.
pub(crate) struct ProcessHandle {
    program: String,
    pid: Option<u32>,
    child: Option<Box<dyn Child + Send + Sync>>,
    writer: Arc<StdMutex<Box<dyn Write + Send>>>,
    output_rx: mpsc::Receiver<ReaderEvent>,
    // Holding the master keeps the terminal open for the child.
    _master: Box<dyn MasterPty + Send>,
    exit_code: Option<i32>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

/// Resolves the program, opens a PTY and starts the process on it.
///
/// An unresolvable program is reported before any terminal is allocated.
pub(crate) fn spawn_process(request: &ExecutionRequest) -> Result<ProcessHandle, ExecError> {
    let argv = request.argv()?;
    let program = argv[0].clone();
    let resolved: PathBuf =
        which::which(&program).map_err(|err| ExecError::spawn(program.clone(), err))?;

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(ExecError::channel)?;

    let reader = pair.master.try_clone_reader().map_err(ExecError::channel)?;
    let writer = pair.master.take_writer().map_err(ExecError::channel)?;

    let mut command_builder = CommandBuilder::new(resolved.as_os_str());
    for arg in &argv[1..] {
        command_builder.arg(arg);
    }
    command_builder.env("TERM", TERM);
    let cwd = match &request.cwd {
        Some(cwd) => Some(cwd.clone()),
        None => std::env::current_dir().ok(),
    };
    if let Some(cwd) = cwd {
        command_builder.cwd(cwd);
    }

    let child = pair
        .slave
        .spawn_command(command_builder)
        .map_err(|err| ExecError::spawn(program.clone(), err))?;
    // The master only sees EOF once every slave handle is closed.
    drop(pair.slave);
    let pid = child.process_id();
    let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

    let mut handle = ProcessHandle {
        program,
        pid,
        child: Some(child),
        writer: Arc::new(StdMutex::new(writer)),
        output_rx,
        _master: pair.master,
        exit_code: None,
    };

    // Detached thread: a read that never returns must not block runtime shutdown.
    if let Err(err) = std::thread::Builder::new()
        .name(format!("pty-reader-{}", pid.unwrap_or_default()))
        .spawn(move || read_loop(reader, output_tx))
    {
        handle.kill_and_detach();
        return Err(ExecError::channel(err));
    }

    debug!(program = %handle.program, pid = ?pid, "spawned process on pty");
    Ok(handle)
}

fn read_loop(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<ReaderEvent>) {
    let mut buf = [0u8; READ_BUFFER_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                let _ = output_tx.blocking_send(ReaderEvent::Eof);
                break;
            }
            Ok(n) => {
                if output_tx
                    .blocking_send(ReaderEvent::Data(buf[..n].to_vec()))
                    .is_err()
                {
                    break;
                }
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(err) if is_hangup(&err) => {
                trace!("pty reader saw hangup");
                let _ = output_tx.blocking_send(ReaderEvent::Eof);
                break;
            }
            Err(err) => {
                debug!(error = %err, "pty reader failed");
                let _ = output_tx.blocking_send(ReaderEvent::Error(err));
                break;
            }
        }
    }
}

/// Linux reports a closed slave side as EIO rather than a zero-length read.
#[cfg(unix)]
fn is_hangup(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::EIO as i32)
}

#[cfg(not(unix))]
fn is_hangup(_err: &std::io::Error) -> bool {
    false
}

impl ProcessHandle {
    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub(crate) fn output_rx(&mut self) -> &mut mpsc::Receiver<ReaderEvent> {
        &mut self.output_rx
    }

    /// Writes `bytes` to the terminal on the blocking pool.
    pub(crate) fn write(
        &self,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<(), ExecError>> + Send + 'static {
        let writer = Arc::clone(&self.writer);
        async move {
            tokio::task::spawn_blocking(move || {
                let mut guard = writer
                    .lock()
                    .map_err(|_| std::io::Error::other("pty writer poisoned"))?;
                guard.write_all(&bytes)?;
                guard.flush()
            })
            .await
            .map_err(|err| ExecError::channel_closed(std::io::Error::other(err)))?
            .map_err(ExecError::channel_closed)
        }
    }

    /// Non-blocking reap. Returns the exit code once the process has exited.
    pub(crate) fn try_wait(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = i32::try_from(status.exit_code()).unwrap_or(i32::MAX);
                debug!(program = %self.program, pid = ?self.pid, code, "process exited");
                self.exit_code = Some(code);
                self.exit_code
            }
            Ok(None) => None,
            Err(err) => {
                warn!(program = %self.program, error = %err, "failed to poll process status");
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&mut self) -> bool {
        self.child.is_some() && self.try_wait().is_none()
    }

    /// SIGTERM, then SIGKILL once `grace` has passed without the process
    /// exiting. Returns the exit code if the process was reaped.
    pub(crate) async fn terminate(&mut self, grace: Duration) -> Option<i32> {
        if let Some(code) = self.try_wait() {
            return Some(code);
        }
        self.send_terminate();
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(code) = self.try_wait() {
                return Some(code);
            }
            tokio::time::sleep(REAP_POLL).await;
        }
        debug!(program = %self.program, pid = ?self.pid, "grace period expired");
        self.force_kill().await
    }

    /// SIGKILL and reap.
    pub(crate) async fn force_kill(&mut self) -> Option<i32> {
        if let Some(code) = self.try_wait() {
            return Some(code);
        }
        self.send_kill();
        for _ in 0..REAP_ATTEMPTS {
            if let Some(code) = self.try_wait() {
                return Some(code);
            }
            tokio::time::sleep(REAP_POLL).await;
        }
        warn!(program = %self.program, pid = ?self.pid, "process did not exit after SIGKILL");
        None
    }

    /// Kills without waiting and leaves reaping to a detached thread.
    pub(crate) fn kill_and_detach(&mut self) {
        if self.try_wait().is_some() {
            return;
        }
        self.send_kill();
        if let Some(mut child) = self.child.take() {
            let spawned = std::thread::Builder::new()
                .name("pty-reaper".to_string())
                .spawn(move || {
                    let _ = child.wait();
                });
            if let Err(err) = spawned {
                warn!(error = %err, "failed to start reaper thread");
            }
        }
    }

    /// Signals whatever is left in the process group after the leader was
    /// reaped: SIGTERM, then SIGKILL if members remain once `grace` passes.
    #[cfg(unix)]
    pub(crate) async fn clear_group(&mut self, grace: Duration) {
        use nix::sys::signal::Signal;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(raw) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        let group = Pid::from_raw(raw);
        // ESRCH here means the group is already empty.
        if killpg(group, Signal::SIGTERM).is_err() {
            return;
        }
        debug!(pgid = raw, "terminating processes left behind in the group");
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if killpg(group, None).is_err() {
                return;
            }
            tokio::time::sleep(REAP_POLL).await;
        }
        warn!(pgid = raw, "process group outlived SIGTERM");
        if let Err(err) = killpg(group, Signal::SIGKILL) {
            trace!(pgid = raw, error = %err, "group kill not delivered");
        }
    }

    #[cfg(not(unix))]
    pub(crate) async fn clear_group(&mut self, _grace: Duration) {}

    #[cfg(test)]
    pub(crate) fn replace_output_rx(
        &mut self,
        rx: mpsc::Receiver<ReaderEvent>,
    ) -> mpsc::Receiver<ReaderEvent> {
        std::mem::replace(&mut self.output_rx, rx)
    }

    #[cfg(unix)]
    fn send_terminate(&mut self) {
        self.signal(nix::sys::signal::Signal::SIGTERM);
    }

    #[cfg(unix)]
    fn send_kill(&mut self) {
        self.signal(nix::sys::signal::Signal::SIGKILL);
    }

    /// The child leads its own session, so signalling the group reaches
    /// anything it forked as well.
    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal) {
        use nix::sys::signal::kill;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(raw) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        let pid = Pid::from_raw(raw);
        debug!(pid = raw, ?signal, "signalling process group");
        if killpg(pid, signal).is_err()
            && let Err(err) = kill(pid, signal)
        {
            trace!(pid = raw, error = %err, "signal not delivered");
        }
    }

    #[cfg(not(unix))]
    fn send_terminate(&mut self) {
        self.send_kill();
    }

    #[cfg(not(unix))]
    fn send_kill(&mut self) {
        if let Some(child) = self.child.as_mut()
            && let Err(err) = child.kill()
        {
            trace!(error = %err, "kill not delivered");
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.child.is_some() && self.exit_code.is_none() {
            self.kill_and_detach();
        }
    }
}
