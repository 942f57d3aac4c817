//! Process supervisor.
//!
//! A [`Process`] goes `Unstarted → Running → Exited`, once. Starting it spawns
//! the child with its standard descriptors bound to [`Stream`]s, then a monitor
//! task waits for the child, records the exit status and dispatches the exit
//! listeners on the process execution context.
//!
//! With channels enabled the child's stdin is a unix socket instead of a pipe,
//! and [`Process::create_channel`] sends it one half of a fresh socket pair,
//! tagged with the channel name.
//!
//! The child's stdin stream is canceled when the child exits; input still
//! queued at that point is discarded.
//!
//! Ordering: the exit event and end of stream on stdout are independent. A
//! listener may observe the exit before the last stdout bytes have been
//! delivered; wait for the zero-length callback when the full output matters.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::sync::watch;

use crate::channel::{Channel, ChannelRegistry};
use crate::context::ExecutionContext;
use crate::error::{ContractViolation, ProcessError, StreamError};
use crate::stream::{DataCallback, Stream};
use crate::{lock, spawn};

/// Exit listener. Runs on the process execution context.
pub type ExitCallback = Arc<dyn Fn(&Process) + Send + Sync + 'static>;

/// How to launch a process.
#[derive(Clone)]
pub struct ProcessConfig {
    pub program: String,
    pub arguments: Vec<String>,
    /// Defaults to ours.
    pub working_directory: Option<PathBuf>,
    /// Replaces our environment entirely when set.
    pub environment: Option<HashMap<String, String>>,
    pub channels: bool,
    /// Shared by the standard streams and the exit monitor when set; otherwise
    /// each gets its own.
    pub context: Option<ExecutionContext>,
    pub on_stdout: Option<DataCallback>,
    pub on_stderr: Option<DataCallback>,
}

impl ProcessConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            arguments: Vec::new(),
            working_directory: None,
            environment: None,
            channels: false,
            context: None,
            on_stdout: None,
            on_stderr: None,
        }
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_channels(mut self, enabled: bool) -> Self {
        self.channels = enabled;
        self
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Attach a stdout callback; stdout is resumed at start.
    pub fn on_stdout(mut self, callback: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.on_stdout = Some(Arc::new(callback));
        self
    }

    /// Attach a stderr callback; stderr is resumed at start.
    pub fn on_stderr(mut self, callback: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.on_stderr = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unstarted,
    Running {
        pid: u32,
    },
    /// `status` is `None` if waiting on the child failed.
    Exited {
        pid: u32,
        status: Option<ExitStatus>,
    },
}

/// Handle to a supervised child process. Clones share the same process.
#[derive(Clone)]
pub struct Process {
    inner: Arc<ProcessInner>,
}

struct ProcessInner {
    config: Mutex<ProcessConfig>,
    /// Serializes `start`.
    start_gate: Mutex<()>,
    state: watch::Sender<ProcessState>,
    attached: OnceLock<Attached>,
    /// stdin bytes written before start.
    pending_input: Mutex<Vec<Bytes>>,
    exit_listeners: Mutex<Vec<ExitCallback>>,
    channels: ChannelRegistry,
}

/// Everything that exists once the child is spawned.
struct Attached {
    stdin: Stream,
    stdout: Stream,
    stderr: Stream,
    context: ExecutionContext,
}

impl Process {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            inner: Arc::new(ProcessInner {
                config: Mutex::new(config),
                start_gate: Mutex::new(()),
                state: watch::Sender::new(ProcessState::Unstarted),
                attached: OnceLock::new(),
                pending_input: Mutex::new(Vec::new()),
                exit_listeners: Mutex::new(Vec::new()),
                channels: ChannelRegistry::default(),
            }),
        }
    }

    /// Create and start in one step.
    pub fn spawn(config: ProcessConfig) -> Result<Self, ProcessError> {
        let process = Self::new(config);
        process.start()?;
        Ok(process)
    }

    /// Spawn the child.
    ///
    /// Must be called from within a Tokio runtime. Fails with
    /// [`ContractViolation::AlreadyStarted`] once the child has been spawned; a
    /// start that failed to spawn may be retried.
    pub fn start(&self) -> Result<(), ProcessError> {
        self.start_inner(None)
    }

    /// Like [`Process::start`], replacing the configured arguments.
    pub fn start_with_arguments<I, S>(&self, arguments: I) -> Result<(), ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.start_inner(Some(arguments.into_iter().map(Into::into).collect()))
    }

    /// Allow or forbid channel creation. Only legal before start.
    pub fn set_channels_enabled(&self, enabled: bool) -> Result<(), ProcessError> {
        let _gate = lock(&self.inner.start_gate);
        if !matches!(self.state(), ProcessState::Unstarted) {
            return Err(self.contract(ContractViolation::AlreadyStarted));
        }
        lock(&self.inner.config).channels = enabled;
        Ok(())
    }

    fn start_inner(&self, arguments: Option<Vec<String>>) -> Result<(), ProcessError> {
        let inner = &self.inner;
        let _gate = lock(&inner.start_gate);

        if !matches!(self.state(), ProcessState::Unstarted) {
            return Err(self.contract(ContractViolation::AlreadyStarted));
        }

        let config = {
            let mut config = lock(&inner.config);
            if let Some(arguments) = arguments {
                config.arguments = arguments;
            }
            config.clone()
        };

        let launch = spawn::resolve(&config.program, config.environment.as_ref())?;
        let mut cmd = spawn::build_command(
            &launch,
            &config.arguments,
            config.working_directory.as_deref(),
            config.environment.as_ref(),
        );

        let local_stdin = if config.channels {
            let (ours, theirs) = UnixStream::pair().map_err(ProcessError::Spawn)?;
            cmd.stdin(Stdio::from(OwnedFd::from(theirs)));
            Some(OwnedFd::from(ours))
        } else {
            cmd.stdin(Stdio::piped());
            None
        };
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            tracing::warn!(program = %config.program, error = %e, "Spawn failed");
            ProcessError::Spawn(e)
        })?;
        // Closes our copy of the child's stdin socket.
        drop(cmd);

        let Some(pid) = child.id() else {
            return Err(ProcessError::Spawn(io::Error::other(
                "child exited before its pid was read",
            )));
        };

        let attached = match attach_streams(&mut child, local_stdin, &config, pid) {
            Ok(attached) => attached,
            Err(e) => {
                tracing::error!(pid, error = %e, "Failed to attach standard streams, killing child");
                let _ = child.start_kill();
                return Err(e.into());
            }
        };

        // Held from publishing the streams until queued input is drained, so a
        // concurrent `write_input` lands behind it.
        let mut pending = lock(&inner.pending_input);
        let attached = inner.attached.get_or_init(|| attached);
        inner.state.send_replace(ProcessState::Running { pid });
        tracing::info!(pid, program = %config.program, "Process started");

        attached.stdin.resume();
        for chunk in pending.drain(..) {
            if let Err(e) = attached.stdin.write_owned(chunk) {
                tracing::warn!(pid, error = %e, "Dropping queued input");
            }
        }
        drop(pending);
        if let Some(callback) = config.on_stdout {
            attached.stdout.set_data_callback(callback);
            attached.stdout.resume();
        }
        if let Some(callback) = config.on_stderr {
            attached.stderr.set_data_callback(callback);
            attached.stderr.resume();
        }

        let process = self.clone();
        let context = attached.context.clone();
        attached.context.handle().spawn(async move {
            let status = match child.wait().await {
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "Failed to wait for child");
                    None
                }
            };
            process.exited(pid, status, &context);
        });

        Ok(())
    }

    fn exited(&self, pid: u32, status: Option<ExitStatus>, context: &ExecutionContext) {
        // Nobody is left to read stdin; release the descriptor and the writer
        // task before the exit becomes observable.
        if let Some(attached) = self.inner.attached.get() {
            attached.stdin.cancel();
        }

        let listeners = {
            let listeners = lock(&self.inner.exit_listeners);
            self.inner
                .state
                .send_replace(ProcessState::Exited { pid, status });
            listeners.clone()
        };
        tracing::info!(pid, ?status, "Process exited");

        let process = self.clone();
        context.dispatch(move || {
            for listener in &listeners {
                listener(&process);
            }
        });
    }

    fn contract(&self, violation: ContractViolation) -> ProcessError {
        tracing::error!(
            program = %lock(&self.inner.config).program,
            %violation,
            "Bug: process used in the wrong lifecycle state"
        );
        violation.into()
    }

    pub fn state(&self) -> ProcessState {
        *self.inner.state.borrow()
    }

    pub fn program(&self) -> String {
        lock(&self.inner.config).program.clone()
    }

    /// Child pid while running.
    pub fn pid(&self) -> Option<u32> {
        match self.state() {
            ProcessState::Running { pid } => Some(pid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ProcessState::Running { .. })
    }

    /// Exit status, once the child has exited and been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self.state() {
            ProcessState::Exited { status, .. } => status,
            _ => None,
        }
    }

    /// Exit code, or `None` if the child was killed by a signal or hasn't exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status().and_then(|status| status.code())
    }

    pub fn stdin(&self) -> Option<Stream> {
        self.inner.attached.get().map(|a| a.stdin.clone())
    }

    pub fn stdout(&self) -> Option<Stream> {
        self.inner.attached.get().map(|a| a.stdout.clone())
    }

    pub fn stderr(&self) -> Option<Stream> {
        self.inner.attached.get().map(|a| a.stderr.clone())
    }

    /// Queue bytes for the child's stdin. Bytes written before start are held
    /// and sent, in order, once the child is running.
    pub fn write_input(&self, bytes: impl Into<Bytes>) -> Result<(), ProcessError> {
        let bytes = bytes.into();
        let mut pending = lock(&self.inner.pending_input);
        match self.inner.attached.get() {
            Some(attached) => attached.stdin.write_owned(bytes)?,
            None => pending.push(bytes),
        }
        Ok(())
    }

    /// Register an exit listener. Registered after the exit, it is dispatched
    /// right away.
    pub fn on_exit(&self, callback: impl Fn(&Process) + Send + Sync + 'static) {
        let callback: ExitCallback = Arc::new(callback);
        let mut listeners = lock(&self.inner.exit_listeners);
        if matches!(self.state(), ProcessState::Exited { .. })
            && let Some(attached) = self.inner.attached.get()
        {
            drop(listeners);
            let process = self.clone();
            attached.context.dispatch(move || callback(&process));
            return;
        }
        listeners.push(callback);
    }

    pub fn clear_exit_listeners(&self) {
        lock(&self.inner.exit_listeners).clear();
    }

    /// Wait for the child to exit.
    pub async fn wait(&self) -> Result<Option<ExitStatus>, ProcessError> {
        if matches!(self.state(), ProcessState::Unstarted) {
            return Err(self.contract(ContractViolation::NotStarted));
        }
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|state| matches!(state, ProcessState::Exited { .. }))
            .await
            .map_err(|_| ProcessError::NotRunning)?;
        match *state {
            ProcessState::Exited { status, .. } => Ok(status),
            _ => Err(ProcessError::NotRunning),
        }
    }

    /// Send `SIGINT`.
    pub fn terminate(&self) -> Result<(), ProcessError> {
        self.send_signal(Signal::SIGINT)
    }

    /// Deliver `signal` to the running child. Fails with
    /// [`ProcessError::NotRunning`] before start and after exit.
    pub fn send_signal(&self, signal: Signal) -> Result<(), ProcessError> {
        // Holding the state keeps the monitor from publishing the exit mid-send.
        let state = self.inner.state.borrow();
        let ProcessState::Running { pid } = *state else {
            return Err(ProcessError::NotRunning);
        };
        let target = i32::try_from(pid).map_err(|_| ProcessError::NotRunning)?;
        signal::kill(Pid::from_raw(target), signal)
            .map_err(|source| ProcessError::Signal { signal, source })?;
        tracing::debug!(pid, %signal, "Signal sent");
        Ok(())
    }

    /// Open a named channel to the running child.
    ///
    /// Our end is returned suspended; the other end is sent over stdin. The
    /// descriptor bypasses the stdin write queue, so it may overtake input
    /// bytes that are still queued.
    ///
    /// Sending the descriptor blocks the calling thread in `poll(2)` while the
    /// stdin socket's send buffer is full. Call it from a blocking context
    /// when the child may stop reading its stdin.
    pub fn create_channel(&self, name: &str) -> Result<Channel, ProcessError> {
        if !lock(&self.inner.config).channels {
            return Err(self.contract(ContractViolation::ChannelsDisabled));
        }
        let pid = match self.state() {
            ProcessState::Running { pid } => pid,
            ProcessState::Unstarted => return Err(self.contract(ContractViolation::NotStarted)),
            ProcessState::Exited { .. } => return Err(self.contract(ContractViolation::Exited)),
        };
        let Some(attached) = self.inner.attached.get() else {
            return Err(self.contract(ContractViolation::NotStarted));
        };

        let (ours, theirs) = UnixStream::pair()?;
        let context = lock(&self.inner.config)
            .context
            .clone()
            .unwrap_or_else(|| ExecutionContext::new(format!("channel:{name}:{pid}")));
        let stream = Stream::new(ours, true, true, context)?;
        let channel = self.inner.channels.register(name, stream)?;

        if let Err(e) = attached.stdin.write_descriptor(theirs.as_fd(), name) {
            tracing::warn!(pid, channel = name, error = %e, "Failed to send channel descriptor");
            self.inner.channels.unregister(&channel);
            channel.cancel();
            return Err(e.into());
        }

        tracing::info!(pid, channel = name, "Channel created");
        Ok(channel)
    }

    /// [`Process::create_channel`], then attach `on_data` and resume.
    pub fn open_channel(
        &self,
        name: &str,
        on_data: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Result<Channel, ProcessError> {
        let channel = self.create_channel(name)?;
        channel.on_data(on_data);
        channel.resume();
        Ok(channel)
    }

    pub fn channel(&self, name: &str) -> Option<Channel> {
        self.inner.channels.get(name)
    }

    /// Open channels in creation order.
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.channels.snapshot()
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("program", &self.program())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn attach_streams(
    child: &mut tokio::process::Child,
    local_stdin: Option<OwnedFd>,
    config: &ProcessConfig,
    pid: u32,
) -> Result<Attached, StreamError> {
    let missing = |what: &str| {
        StreamError::InvalidDescriptor(io::Error::other(format!("child {what} was not captured")))
    };
    let context_for = |label: &str| {
        config
            .context
            .clone()
            .unwrap_or_else(|| ExecutionContext::new(format!("{label}:{pid}")))
    };

    let stdin_fd = match local_stdin {
        Some(fd) => fd,
        None => child.stdin.take().ok_or_else(|| missing("stdin"))?.into_owned_fd()?,
    };
    let stdout_fd = child.stdout.take().ok_or_else(|| missing("stdout"))?.into_owned_fd()?;
    let stderr_fd = child.stderr.take().ok_or_else(|| missing("stderr"))?.into_owned_fd()?;

    Ok(Attached {
        stdin: Stream::new(stdin_fd, false, true, context_for("stdin"))?,
        stdout: Stream::new(stdout_fd, true, false, context_for("stdout"))?,
        stderr: Stream::new(stderr_fd, true, false, context_for("stderr"))?,
        context: context_for("process"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn sender() -> (
        impl Fn(&[u8]) + Send + Sync + 'static,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |bytes: &[u8]| {
                let _ = tx.send(bytes.to_vec());
            },
            rx,
        )
    }

    async fn until_eos(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> String {
        let mut out = Vec::new();
        loop {
            let chunk = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for output")
                .expect("callback dropped");
            if chunk.is_empty() {
                return String::from_utf8(out).unwrap();
            }
            out.extend_from_slice(&chunk);
        }
    }

    async fn wait(process: &Process) -> Option<ExitStatus> {
        timeout(Duration::from_secs(10), process.wait())
            .await
            .expect("timed out waiting for exit")
            .unwrap()
    }

    #[tokio::test]
    async fn echo_hello_then_end_of_stream_then_exit() {
        let (on_stdout, mut stdout) = sender();
        let (exit_tx, mut exits) = mpsc::unbounded_channel();

        let process = Process::new(
            ProcessConfig::new("echo")
                .with_arguments(["hello"])
                .on_stdout(on_stdout),
        );
        process.on_exit(move |p| {
            let _ = exit_tx.send(p.exit_code());
        });
        process.start().unwrap();
        assert!(process.pid().is_some());

        assert_eq!(until_eos(&mut stdout).await, "hello\n");
        let code = timeout(Duration::from_secs(10), exits.recv()).await.unwrap();
        assert_eq!(code, Some(Some(0)));
        assert!(!process.is_running());
        assert!(process.pid().is_none());
    }

    #[tokio::test]
    async fn invalid_program_leaves_no_streams() {
        let process = Process::new(ProcessConfig::new("/nonexistent/program"));

        let err = process.start().unwrap_err();
        assert!(matches!(
            err,
            ProcessError::ProgramNotFound(_) | ProcessError::Spawn(_)
        ));
        assert_eq!(process.state(), ProcessState::Unstarted);
        assert!(process.stdin().is_none());
        assert!(process.stdout().is_none());
        assert!(process.stderr().is_none());
    }

    #[tokio::test]
    async fn second_start_is_a_contract_violation() {
        let process = Process::spawn(ProcessConfig::new("true")).unwrap();

        let err = process.start().unwrap_err();
        assert!(err.is_contract_violation());
        assert!(matches!(
            err,
            ProcessError::Contract(ContractViolation::AlreadyStarted)
        ));

        wait(&process).await;
        assert!(process.start_with_arguments(["again"]).is_err());
        assert!(process.set_channels_enabled(true).is_err());
    }

    #[tokio::test]
    async fn channel_before_start_is_a_contract_violation() {
        let process = Process::new(ProcessConfig::new("cat").with_channels(true));

        let err = process.create_channel("parent").unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Contract(ContractViolation::NotStarted)
        ));
        assert!(process.channels().is_empty());
        assert!(process.wait().await.unwrap_err().is_contract_violation());
    }

    #[tokio::test]
    async fn channel_without_enabling_is_a_contract_violation() {
        let process = Process::spawn(ProcessConfig::new("sleep").with_arguments(["30"])).unwrap();

        let err = process.create_channel("parent").unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Contract(ContractViolation::ChannelsDisabled)
        ));

        process.terminate().unwrap();
        wait(&process).await;
    }

    #[tokio::test]
    async fn channel_after_exit_reports_the_exit() {
        let process = Process::spawn(ProcessConfig::new("true").with_channels(true)).unwrap();
        wait(&process).await;

        let err = process.create_channel("parent").unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Contract(ContractViolation::Exited)
        ));
        assert!(process.channels().is_empty());
    }

    #[tokio::test]
    async fn stdin_is_canceled_when_the_child_exits() {
        let process = Process::spawn(ProcessConfig::new("true")).unwrap();
        let stdin = process.stdin().unwrap();
        wait(&process).await;

        assert!(!stdin.is_valid());
        assert!(stdin.raw_fd().is_none());
        assert!(process.write_input(&b"late"[..]).is_err());
    }

    #[tokio::test]
    async fn channels_are_registered_by_name() {
        let process = Process::spawn(
            ProcessConfig::new("sleep")
                .with_arguments(["30"])
                .with_channels(true),
        )
        .unwrap();

        let first = process.create_channel("parent").unwrap();
        assert_eq!(first.name(), "parent");
        assert!(first.is_suspended());
        process.create_channel("logs").unwrap();

        let err = process.create_channel("parent").unwrap_err();
        assert!(matches!(err, ProcessError::ChannelExists(_)));

        let names: Vec<_> = process
            .channels()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, ["parent", "logs"]);

        first.cancel();
        assert!(process.channel("parent").is_none());

        process.terminate().unwrap();
        wait(&process).await;
    }

    #[tokio::test]
    async fn exit_fires_once_and_signals_after_exit_fail() {
        let process = Process::new(ProcessConfig::new("true"));
        let exits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&exits);
        process.on_exit(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(process.terminate(), Err(ProcessError::NotRunning)));
        process.start().unwrap();
        let status = wait(&process).await.unwrap();
        assert!(status.success());

        assert!(matches!(process.terminate(), Err(ProcessError::NotRunning)));
        assert!(matches!(process.terminate(), Err(ProcessError::NotRunning)));
        assert!(matches!(
            process.send_signal(Signal::SIGKILL),
            Err(ProcessError::NotRunning)
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminate_interrupts_a_running_child() {
        let process = Process::spawn(ProcessConfig::new("sleep").with_arguments(["30"])).unwrap();
        assert!(process.is_running());

        process.terminate().unwrap();
        let status = wait(&process).await.unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGINT as i32));
        assert_eq!(process.exit_code(), None);
    }

    #[tokio::test]
    async fn late_exit_listener_is_still_called() {
        let process = Process::spawn(ProcessConfig::new("true")).unwrap();
        wait(&process).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        process.on_exit(move |p| {
            let _ = tx.send(p.exit_code());
        });
        let code = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(code, Some(Some(0)));
    }

    #[tokio::test]
    async fn environment_and_working_directory_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let (on_stdout, mut stdout) = sender();

        let env = HashMap::from([
            ("GREETING".to_string(), "hi".to_string()),
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
        ]);
        let process = Process::spawn(
            ProcessConfig::new("sh")
                .with_arguments(["-c", "echo \"$GREETING\"; echo \"${HOME:-unset}\"; pwd -P"])
                .with_environment(env)
                .with_working_directory(dir.path())
                .on_stdout(on_stdout),
        )
        .unwrap();

        let expected = format!("hi\nunset\n{}\n", dir.path().canonicalize().unwrap().display());
        assert_eq!(until_eos(&mut stdout).await, expected);
        assert_eq!(wait(&process).await.and_then(|s| s.code()), Some(0));
    }

    #[tokio::test]
    async fn input_written_before_start_is_delivered_first() {
        let (on_stdout, mut stdout) = sender();
        let process = Process::new(ProcessConfig::new("cat").on_stdout(on_stdout));

        process.write_input(&b"before "[..]).unwrap();
        process.start().unwrap();
        process.write_input(&b"after"[..]).unwrap();

        let stdin = process.stdin().unwrap();
        timeout(Duration::from_secs(5), stdin.flush()).await.unwrap();
        stdin.cancel();

        assert_eq!(until_eos(&mut stdout).await, "before after");
        wait(&process).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn input_racing_start_keeps_its_order() {
        let (on_stdout, mut stdout) = sender();
        let process = Process::new(ProcessConfig::new("cat").on_stdout(on_stdout));

        let writer = {
            let process = process.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    process.write_input(format!("{i}\n").into_bytes()).unwrap();
                }
            })
        };
        process.start().unwrap();
        writer.join().unwrap();

        let stdin = process.stdin().unwrap();
        timeout(Duration::from_secs(5), stdin.flush()).await.unwrap();
        stdin.cancel();

        let expected: String = (0..200).map(|i| format!("{i}\n")).collect();
        assert_eq!(until_eos(&mut stdout).await, expected);
        wait(&process).await;
    }

    #[tokio::test]
    async fn stderr_has_its_own_stream() {
        let (on_stdout, mut stdout) = sender();
        let (on_stderr, mut stderr) = sender();
        let process = Process::spawn(
            ProcessConfig::new("sh")
                .with_arguments(["-c", "echo out; echo err >&2; exit 3"])
                .on_stdout(on_stdout)
                .on_stderr(on_stderr),
        )
        .unwrap();

        assert_eq!(until_eos(&mut stdout).await, "out\n");
        assert_eq!(until_eos(&mut stderr).await, "err\n");
        assert_eq!(wait(&process).await.and_then(|s| s.code()), Some(3));
        assert_eq!(process.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn headerless_script_runs_through_the_shell() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain-script");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"echo from-script \"$1\"\n")
            .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (on_stdout, mut stdout) = sender();
        let process = Process::new(
            ProcessConfig::new(path.to_str().unwrap()).on_stdout(on_stdout),
        );
        process.start_with_arguments(["arg"]).unwrap();

        assert_eq!(until_eos(&mut stdout).await, "from-script arg\n");
        wait(&process).await;
    }

    #[tokio::test]
    async fn standard_streams_wait_for_a_consumer() {
        let process = Process::spawn(ProcessConfig::new("echo").with_arguments(["late"])).unwrap();

        let stdout = process.stdout().unwrap();
        assert!(stdout.is_suspended());
        wait(&process).await;

        let (on_data, mut rx) = sender();
        stdout.on_data(on_data);
        stdout.resume();
        assert_eq!(until_eos(&mut rx).await, "late\n");
    }

    #[tokio::test]
    async fn shared_context_is_used_everywhere() {
        let context = ExecutionContext::new("shared");
        let process = Process::spawn(
            ProcessConfig::new("true").with_context(context.clone()),
        )
        .unwrap();

        for stream in [process.stdin(), process.stdout(), process.stderr()] {
            assert_eq!(stream.unwrap().context().label(), "shared");
        }
        wait(&process).await;
    }
}
