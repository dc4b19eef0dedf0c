use std::time::Duration;

use intrusion_ansi_escape::StreamSanitizer;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::errors::ExecError;
use super::patterns::PatternMatch;
use super::patterns::PatternSet;
use super::request::ExecutionRequest;
use super::result::Completion;
use super::result::ExecutionResult;
use super::runner::ProcessHandle;
use super::runner::ReaderEvent;
use super::runner::spawn_process;

/// How long to keep draining output after the child has been seen to exit.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);
/// How long to wait for the exit status after the terminal reports EOF.
const EOF_REAP_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    AwaitingInput,
    Completed,
    TimedOut,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Failed)
    }
}

/// What a poll cycle decided.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Finished,
    Prompt(PatternMatch),
    Idle,
    Continue,
}

/// End of stream beats a prompt seen in the same cycle; a prompt beats the
/// idle timer.
fn next_step(eof: bool, pending: &str, patterns: &PatternSet, idle_expired: bool) -> Step {
    if eof {
        return Step::Finished;
    }
    if let Some(found) = patterns.find(pending) {
        return Step::Prompt(found);
    }
    if idle_expired {
        return Step::Idle;
    }
    Step::Continue
}

#[derive(Default)]
struct Batch {
    events: Vec<ReaderEvent>,
    closed: bool,
}

/// One command running on a pseudo-terminal, driven turn by turn.
///
/// Each call to [`CommandSession::wait`] reads until end of output, a
/// recognized prompt, or the idle timeout. After a prompt the process stays
/// alive until the caller answers with [`CommandSession::send_line`], resumes,
/// or closes the session.
pub struct CommandSession {
    request: ExecutionRequest,
    patterns: PatternSet,
    handle: Option<ProcessHandle>,
    sanitizer: StreamSanitizer,
    pending: String,
    transcript: String,
    state: SessionState,
    last_activity: Instant,
    last_result: Option<ExecutionResult>,
    exit_code: Option<i32>,
}

impl std::fmt::Debug for CommandSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSession")
            .field("command", &self.request.preview())
            .field("state", &self.state)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl CommandSession {
    pub async fn start(request: ExecutionRequest, patterns: PatternSet) -> Result<Self, ExecError> {
        request.validate()?;
        let mut handle = spawn_process(&request)?;
        if let Some(input) = &request.initial_input {
            let mut line = input.clone();
            if !line.ends_with('\n') {
                line.push('\n');
            }
            if let Err(err) = handle.write(line.into_bytes()).await {
                handle.force_kill().await;
                return Err(err);
            }
        }
        info!(command = %request.preview(), pid = ?handle.pid(), "command started");
        Ok(Self {
            request,
            patterns,
            handle: Some(handle),
            sanitizer: StreamSanitizer::new(),
            pending: String::new(),
            transcript: String::new(),
            state: SessionState::Running,
            last_activity: Instant::now(),
            last_result: None,
            exit_code: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// OS process id while the process is alive.
    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(ProcessHandle::pid)
    }

    /// All sanitized output seen so far, across turns.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn request(&self) -> &ExecutionRequest {
        &self.request
    }

    /// Runs the current turn to its result. Outside `Running` this returns
    /// the previous result again.
    pub async fn wait(&mut self) -> ExecutionResult {
        if self.state != SessionState::Running {
            if let Some(result) = &self.last_result {
                return result.clone();
            }
        }
        let result = self.run_turn().await;
        self.last_result = Some(result.clone());
        result
    }

    /// Writes `text` and a newline to the terminal, then runs the next turn.
    pub async fn send_line(&mut self, text: &str) -> ExecutionResult {
        if self.state != SessionState::AwaitingInput {
            let err = ExecError::invalid_request(format!(
                "cannot send input while session is {:?}",
                self.state
            ));
            return ExecutionResult::failed(String::new(), &err);
        }
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(b'\n');
        let write = self.handle.as_ref().map(|handle| handle.write(bytes));
        let written = match write {
            Some(write) => write.await,
            None => Err(ExecError::channel_closed(std::io::Error::other(
                "process handle already released",
            ))),
        };
        if let Err(err) = written {
            let result = self.fail_closed(err).await;
            self.last_result = Some(result.clone());
            return result;
        }
        debug!(bytes = text.len() + 1, "sent input line");
        self.resume().await
    }

    /// Continues after a prompt without writing anything.
    pub async fn resume(&mut self) -> ExecutionResult {
        if self.state == SessionState::AwaitingInput {
            self.state = SessionState::Running;
            self.last_activity = Instant::now();
        }
        self.wait().await
    }

    /// Terminates and reaps the process if it is still alive.
    pub async fn close(&mut self) -> Option<i32> {
        if let Some(mut handle) = self.handle.take() {
            let code = handle.terminate(self.request.kill_grace).await;
            self.exit_code = self.exit_code.or(code);
            debug!(code = ?self.exit_code, "session closed");
        }
        if !self.state.is_terminal() {
            self.state = SessionState::Completed;
        }
        self.exit_code
    }

    async fn run_turn(&mut self) -> ExecutionResult {
        let idle_timeout = self.request.idle_timeout;
        loop {
            let idle_left = idle_timeout.saturating_sub(self.last_activity.elapsed());
            let wait_for = self.request.poll_interval.min(idle_left);
            let batch = self.poll(wait_for).await;

            let mut eof = batch.closed;
            for event in batch.events {
                match event {
                    ReaderEvent::Data(bytes) => self.absorb(&bytes),
                    ReaderEvent::Eof => eof = true,
                    ReaderEvent::Error(err) => {
                        return self.fail_closed(ExecError::channel_closed(err)).await;
                    }
                }
            }

            let mut group_lingers = false;
            if !eof && self.child_exited() {
                match self.drain_after_exit().await {
                    Ok(saw_eof) => {
                        eof = true;
                        group_lingers = !saw_eof;
                    }
                    Err(err) => return self.fail_closed(err).await,
                }
            }

            let idle_expired = self.last_activity.elapsed() >= idle_timeout;
            match next_step(eof, &self.pending, &self.patterns, idle_expired) {
                Step::Finished => return self.finish_completed(group_lingers).await,
                Step::Prompt(found) => return self.finish_prompt(found),
                Step::Idle => return self.finish_timed_out().await,
                Step::Continue => {}
            }
        }
    }

    /// Waits up to `wait_for` for one event, then takes whatever else is queued.
    async fn poll(&mut self, wait_for: Duration) -> Batch {
        let mut batch = Batch::default();
        let Some(handle) = self.handle.as_mut() else {
            batch.closed = true;
            return batch;
        };
        let rx = handle.output_rx();
        match tokio::time::timeout(wait_for, rx.recv()).await {
            Ok(Some(event)) => batch.events.push(event),
            Ok(None) => {
                batch.closed = true;
                return batch;
            }
            Err(_) => return batch,
        }
        loop {
            match rx.try_recv() {
                Ok(event) => batch.events.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    batch.closed = true;
                    break;
                }
            }
        }
        batch
    }

    fn absorb(&mut self, bytes: &[u8]) {
        self.last_activity = Instant::now();
        let text = self.sanitizer.push(bytes);
        if !text.is_empty() {
            self.pending.push_str(&text);
            self.transcript.push_str(&text);
        }
    }

    fn child_exited(&mut self) -> bool {
        self.handle
            .as_mut()
            .is_some_and(|handle| handle.try_wait().is_some())
    }

    /// Collects output still in flight after the child exited, until EOF or
    /// a short grace period passes. Returns whether EOF was reached; if not,
    /// something the child left behind still holds the terminal.
    async fn drain_after_exit(&mut self) -> Result<bool, ExecError> {
        let deadline = Instant::now() + EXIT_DRAIN_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let batch = self.poll(remaining).await;
            let idle = batch.events.is_empty();
            for event in batch.events {
                match event {
                    ReaderEvent::Data(bytes) => self.absorb(&bytes),
                    ReaderEvent::Eof => return Ok(true),
                    ReaderEvent::Error(err) => return Err(ExecError::channel_closed(err)),
                }
            }
            if batch.closed {
                return Ok(true);
            }
            if idle {
                return Ok(false);
            }
        }
    }

    async fn finish_completed(&mut self, group_lingers: bool) -> ExecutionResult {
        let wait = EOF_REAP_WAIT;
        let grace = self.request.kill_grace;
        let code = match self.handle.take() {
            Some(mut handle) => {
                let code = reap_after_eof(&mut handle, wait, grace).await;
                if group_lingers {
                    handle.clear_group(grace).await;
                }
                code
            }
            None => None,
        };
        self.exit_code = self.exit_code.or(code);
        self.state = SessionState::Completed;
        info!(command = %self.request.preview(), code = ?self.exit_code, "command completed");
        ExecutionResult::completed(std::mem::take(&mut self.pending), self.exit_code)
    }

    fn finish_prompt(&mut self, found: PatternMatch) -> ExecutionResult {
        let residue = self.pending.split_off(found.end);
        let output = std::mem::replace(&mut self.pending, residue);
        self.state = SessionState::AwaitingInput;
        debug!(pattern = %found.pattern_id, "prompt recognized");
        ExecutionResult::awaiting_input(output, found)
    }

    async fn finish_timed_out(&mut self) -> ExecutionResult {
        let err = ExecError::Timeout {
            idle_timeout: self.request.idle_timeout,
        };
        warn!(command = %self.request.preview(), "{err}");
        if let Some(mut handle) = self.handle.take() {
            let code = handle.terminate(self.request.kill_grace).await;
            self.exit_code = self.exit_code.or(code);
        }
        self.state = SessionState::TimedOut;
        ExecutionResult::timed_out(std::mem::take(&mut self.pending), &err, self.exit_code)
    }

    async fn fail_closed(&mut self, err: ExecError) -> ExecutionResult {
        warn!(command = %self.request.preview(), error = %err, "terminal channel failed");
        if let Some(mut handle) = self.handle.take() {
            let code = handle.force_kill().await;
            self.exit_code = self.exit_code.or(code);
        }
        self.state = SessionState::Failed;
        ExecutionResult::failed(std::mem::take(&mut self.pending), &err)
    }
}

async fn reap_after_eof(handle: &mut ProcessHandle, wait: Duration, grace: Duration) -> Option<i32> {
    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        if let Some(code) = handle.try_wait() {
            return Some(code);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    debug!("process still alive after end of output");
    handle.terminate(grace).await.or(handle.exit_code())
}

/// Runs `request` to its first result and releases the process.
///
/// A prompt that is left unanswered still yields an `awaiting-input` result,
/// but the process is closed before returning. Failures to start are folded
/// into a `failed` result.
pub async fn run_command(request: ExecutionRequest, patterns: &PatternSet) -> ExecutionResult {
    let mut session = match CommandSession::start(request, patterns.clone()).await {
        Ok(session) => session,
        Err(err) => {
            debug!(error = %err, "command did not start");
            return ExecutionResult::from_error(&err);
        }
    };
    let result = session.wait().await;
    if result.completion == Completion::AwaitingInput {
        session.close().await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_command::errors::ExecErrorKind;
    use crate::exec_command::patterns::Pattern;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn end_of_stream_wins_over_prompt_in_same_cycle() -> Result<(), ExecError> {
        let patterns = PatternSet::new(vec![Pattern::literal("ready", "READY> ")?])?;
        assert_eq!(next_step(true, "READY> ", &patterns, true), Step::Finished);
        assert_matches!(
            next_step(false, "READY> ", &patterns, true),
            Step::Prompt(found) if found.pattern_id == "ready"
        );
        assert_eq!(next_step(false, "loading", &patterns, true), Step::Idle);
        assert_eq!(next_step(false, "loading", &patterns, false), Step::Continue);
        Ok(())
    }

    #[tokio::test]
    async fn empty_command_is_rejected_before_spawn() {
        let result = run_command(
            ExecutionRequest::new("   ", Duration::from_secs(1)),
            &PatternSet::empty(),
        )
        .await;
        assert_eq!(result.completion, Completion::Failed);
        assert_eq!(result.error_kind(), Some(ExecErrorKind::InvalidRequest));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        assert_matches!(
            CommandSession::start(
                ExecutionRequest::new("this-cmd-does-not-exist", Duration::from_secs(1)),
                PatternSet::empty(),
            )
            .await,
            Err(ExecError::Spawn { .. })
        );
        let result = run_command(
            ExecutionRequest::new("this-cmd-does-not-exist", Duration::from_secs(1)),
            &PatternSet::empty(),
        )
        .await;
        assert_eq!(result.completion, Completion::Failed);
        assert_eq!(result.error_kind(), Some(ExecErrorKind::Spawn));
        assert_eq!(result.output, "");
    }

    #[cfg(unix)]
    mod pty {
        use super::*;
        use core_test_support::skip_if_no_pty;
        use pretty_assertions::assert_eq;

        #[cfg(not(target_os = "linux"))]
        async fn assert_process_gone(_pid: u32) {}

        /// A zombie counts as gone: orphans may wait on a reaper we do not own.
        #[cfg(target_os = "linux")]
        async fn assert_process_gone(pid: u32) {
            for _ in 0..100 {
                let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
                    return;
                };
                let state = stat
                    .rsplit_once(')')
                    .and_then(|(_, rest)| rest.trim_start().chars().next());
                if state == Some('Z') {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("process {pid} is still alive");
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn printf_completes_with_its_output() {
            skip_if_no_pty!();
            let result = run_command(
                ExecutionRequest::new("printf done", Duration::from_secs(5)),
                &PatternSet::empty(),
            )
            .await;
            assert_eq!(result.completion, Completion::Completed);
            assert_eq!(result.output, "done");
            assert_eq!(result.exit_code, Some(0));
            assert_eq!(result.error, None);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn silent_command_completes_with_empty_output() {
            skip_if_no_pty!();
            let result = run_command(
                ExecutionRequest::new("true", Duration::from_secs(5)),
                &PatternSet::defaults(),
            )
            .await;
            assert_eq!(result.completion, Completion::Completed);
            assert_eq!(result.output, "");
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn prompt_keeps_process_alive_until_answered() -> Result<(), ExecError> {
            skip_if_no_pty!(Ok(()));
            let patterns = PatternSet::new(vec![Pattern::literal("ready", "READY> ")?])?;
            let request = ExecutionRequest::new(
                r#"sh -c 'printf "READY> "; read reply; echo "got:$reply"'"#,
                Duration::from_secs(5),
            );
            let mut session = CommandSession::start(request, patterns).await?;

            let first = session.wait().await;
            assert_eq!(first.completion, Completion::AwaitingInput);
            assert!(first.output.ends_with("READY> "), "{:?}", first.output);
            assert_eq!(
                first.matched.as_ref().map(|m| m.text.as_str()),
                Some("READY> ")
            );
            assert_eq!(session.state(), SessionState::AwaitingInput);
            assert!(session.pid().is_some());

            let second = session.send_line("hello").await;
            assert_eq!(second.completion, Completion::Completed);
            assert!(second.output.contains("got:hello"), "{:?}", second.output);
            assert_eq!(second.exit_code, Some(0));
            assert_eq!(session.state(), SessionState::Completed);
            assert!(session.transcript().starts_with("READY> "));
            assert!(session.transcript().contains("got:hello"));
            Ok(())
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn text_after_a_match_carries_into_next_turn() -> Result<(), ExecError> {
            skip_if_no_pty!(Ok(()));
            let patterns = PatternSet::new(vec![Pattern::literal("prompt", "> ")?])?;
            let request = ExecutionRequest::new(
                r#"sh -c 'printf "A> B> "; read reply'"#,
                Duration::from_secs(5),
            );
            let mut session = CommandSession::start(request, patterns).await?;
            assert_eq!(session.wait().await.output, "A> ");
            let second = session.resume().await;
            assert_eq!(second.completion, Completion::AwaitingInput);
            assert_eq!(second.output, "B> ");
            session.close().await;
            assert_eq!(session.pid(), None);
            Ok(())
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn send_line_outside_prompt_is_rejected() -> Result<(), ExecError> {
            skip_if_no_pty!(Ok(()));
            let mut session = CommandSession::start(
                ExecutionRequest::new("printf done", Duration::from_secs(5)),
                PatternSet::empty(),
            )
            .await?;
            let result = session.wait().await;
            assert_eq!(result.completion, Completion::Completed);
            let rejected = session.send_line("anything").await;
            assert_eq!(rejected.completion, Completion::Failed);
            assert_eq!(rejected.error_kind(), Some(ExecErrorKind::InvalidRequest));
            assert_eq!(session.wait().await, result);
            Ok(())
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn idle_timeout_terminates_the_process() -> Result<(), ExecError> {
            skip_if_no_pty!(Ok(()));
            let started = std::time::Instant::now();
            let mut session = CommandSession::start(
                ExecutionRequest::new("sleep 10", Duration::from_secs(2)),
                PatternSet::empty(),
            )
            .await?;
            let pid = session.pid();
            let result = session.wait().await;

            assert_eq!(result.completion, Completion::TimedOut);
            assert_eq!(result.error_kind(), Some(ExecErrorKind::Timeout));
            assert!(started.elapsed() < Duration::from_secs(8));
            assert_eq!(session.state(), SessionState::TimedOut);
            assert_eq!(session.pid(), None);
            if let Some(pid) = pid {
                assert_process_gone(pid).await;
            }
            Ok(())
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn idle_timer_restarts_on_each_byte() {
            skip_if_no_pty!();
            let result = run_command(
                ExecutionRequest::new(
                    "sh -c 'for i in 1 2 3 4; do echo tick; sleep 0.5; done'",
                    Duration::from_millis(1500),
                ),
                &PatternSet::empty(),
            )
            .await;
            assert_eq!(result.completion, Completion::Completed);
            assert_eq!(result.output.matches("tick").count(), 4);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn initial_input_is_written_as_a_line() {
            skip_if_no_pty!();
            let result = run_command(
                ExecutionRequest::new(
                    r#"sh -c 'read line; echo "got:$line"'"#,
                    Duration::from_secs(5),
                )
                .with_initial_input("ping"),
                &PatternSet::empty(),
            )
            .await;
            assert_eq!(result.completion, Completion::Completed);
            assert!(result.output.contains("got:ping"), "{:?}", result.output);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn shell_launch_supports_pipes() {
            skip_if_no_pty!();
            let result = run_command(
                ExecutionRequest::new("echo one two | tr ' ' '-'", Duration::from_secs(5))
                    .with_launch(crate::exec_command::LaunchMode::shell("/bin/sh")),
                &PatternSet::empty(),
            )
            .await;
            assert_eq!(result.completion, Completion::Completed);
            assert_eq!(result.output, "one-two\n");
        }

        #[cfg(target_os = "linux")]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn dropping_a_session_kills_the_process() -> Result<(), ExecError> {
            skip_if_no_pty!(Ok(()));
            let session = CommandSession::start(
                ExecutionRequest::new("sleep 30", Duration::from_secs(60)),
                PatternSet::empty(),
            )
            .await?;
            let pid = session.pid();
            drop(session);
            if let Some(pid) = pid {
                assert_process_gone(pid).await;
            }
            Ok(())
        }
    

        #[cfg(target_os = "linux")]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn background_children_are_stopped_when_the_command_exits() {
            skip_if_no_pty!();
            let result = run_command(
                ExecutionRequest::new(
                    "sh -c 'trap \"\" HUP; sleep 31 & echo $!'",
                    Duration::from_secs(5),
                ),
                &PatternSet::empty(),
            )
            .await;
            assert_eq!(result.completion, Completion::Completed);
            assert_eq!(result.exit_code, Some(0));
            let background: u32 = result
                .output
                .trim()
                .parse()
                .expect("background pid in output");
            assert_process_gone(background).await;
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn channel_error_keeps_partial_output_and_kills_the_process() -> Result<(), ExecError>
        {
            skip_if_no_pty!(Ok(()));
            let mut session = CommandSession::start(
                ExecutionRequest::new("sleep 30", Duration::from_secs(10)),
                PatternSet::empty(),
            )
            .await?;
            let pid = session.pid();
            let (tx, rx) = tokio::sync::mpsc::channel(4);
            if let Some(handle) = session.handle.as_mut() {
                drop(handle.replace_output_rx(rx));
            }
            tx.send(ReaderEvent::Data(b"partial scan".to_vec()))
                .await
                .expect("queue data");
            tx.send(ReaderEvent::Error(std::io::Error::other("read failed")))
                .await
                .expect("queue error");

            let result = session.wait().await;
            assert_eq!(result.completion, Completion::Failed);
            assert_eq!(result.error_kind(), Some(ExecErrorKind::ChannelClosed));
            assert_eq!(result.output, "partial scan");
            assert_eq!(session.state(), SessionState::Failed);
            assert_eq!(session.pid(), None);
            if let Some(pid) = pid {
                assert_process_gone(pid).await;
            }
            Ok(())
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn working_directory_is_applied() -> std::io::Result<()> {
            skip_if_no_pty!(Ok(()));
            let dir = tempfile::tempdir()?;
            let result = run_command(
                ExecutionRequest::new("pwd", Duration::from_secs(5)).with_cwd(dir.path()),
                &PatternSet::empty(),
            )
            .await;
            assert_eq!(result.completion, Completion::Completed);
            assert_eq!(
                result.output.trim_end(),
                dir.path().canonicalize()?.display().to_string()
            );
            Ok(())
        }
    }
}
