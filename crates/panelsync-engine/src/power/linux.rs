/*!
 * Linux power monitor.
 *
 * Runs on a dedicated OS thread because it spends its life blocked on a
 * subprocess pipe. The primary strategy follows the login manager's
 * `PrepareForSleep` signal through `dbus-monitor`; if that cannot run, or
 * its stream ends while the monitor is still wanted, the thread falls back
 * to following the systemd sleep units in the journal.
 */
use std::fmt;
use std::io::{self, BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error, info, trace, warn};

use panelsync_core::config::PowerConfig;
use panelsync_core::logging::component_span;

use super::parser::{JournalLineParser, LineParser, SleepSignalParser};
use super::{PowerEventSink, PowerEventSource};
use crate::error::{Error, Result};

/// A program and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
}

impl CommandSpec {
    /// Split an argv list into program and arguments
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    fn spawn(&self) -> io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)
    }
}

/// How one strategy's stream came to an end
#[derive(Debug)]
enum StreamEnd {
    /// Shutdown was requested
    Stopped,
    /// The subprocess closed its output
    Ended,
    /// The subprocess could not be started
    SpawnFailed(Error),
    /// Reading its output failed
    ReadFailed(io::Error),
}

#[derive(Debug, Default)]
struct MonitorState {
    running: AtomicBool,
    child: Mutex<Option<Child>>,
}

impl MonitorState {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Park the live child where shutdown can reach it
    fn adopt(&self, child: Child) {
        match self.child.lock() {
            Ok(mut slot) => *slot = Some(child),
            Err(_) => {
                error!("Power monitor child slot poisoned, stopping subprocess");
                reap(child);
            }
        }
    }

    fn release(&self) {
        let child = self.child.lock().ok().and_then(|mut slot| slot.take());
        if let Some(child) = child {
            reap(child);
        }
    }
}

fn reap(mut child: Child) {
    if let Err(e) = child.kill() {
        trace!("Subprocess already gone: {}", e);
    }
    if let Err(e) = child.wait() {
        debug!("Failed to wait for subprocess: {}", e);
    }
}

/// Power event source backed by `dbus-monitor` and `journalctl`
pub struct LinuxPowerMonitor {
    primary: Option<CommandSpec>,
    fallback: Option<CommandSpec>,
    state: Arc<MonitorState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LinuxPowerMonitor {
    /// Monitor using the commands from the `[power]` section
    pub fn new(config: &PowerConfig) -> Self {
        Self::with_commands(
            CommandSpec::from_argv(&config.primary_command),
            CommandSpec::from_argv(&config.fallback_command),
        )
    }

    /// Monitor with explicit commands
    pub fn with_commands(primary: Option<CommandSpec>, fallback: Option<CommandSpec>) -> Self {
        Self {
            primary,
            fallback,
            state: Arc::new(MonitorState::default()),
            thread: Mutex::new(None),
        }
    }

    /// Whether the monitor thread is still following a stream
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

impl fmt::Debug for LinuxPowerMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinuxPowerMonitor")
            .field("primary", &self.primary)
            .field("fallback", &self.fallback)
            .field("running", &self.state.is_running())
            .finish()
    }
}

impl PowerEventSource for LinuxPowerMonitor {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn start(&self, sink: PowerEventSink) -> Result<()> {
        let mut thread = self
            .thread
            .lock()
            .map_err(|_| Error::other("Failed to lock power monitor thread"))?;
        if thread.is_some() {
            warn!("Power monitor already started");
            return Ok(());
        }

        self.state.running.store(true, Ordering::SeqCst);
        let state = self.state.clone();
        let primary = self.primary.clone();
        let fallback = self.fallback.clone();

        let handle = std::thread::Builder::new()
            .name("power-monitor".to_string())
            .spawn(move || monitor(state, primary, fallback, sink))
            .map_err(|e| {
                self.state.running.store(false, Ordering::SeqCst);
                Error::subprocess(format!("Failed to spawn power monitor thread: {}", e))
            })?;

        *thread = Some(handle);
        info!("Power monitor started");
        Ok(())
    }

    fn shutdown(&self) {
        let was_running = self.state.running.swap(false, Ordering::SeqCst);
        self.state.release();

        let thread = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("Power monitor thread panicked");
            }
        }

        if was_running {
            info!("Power monitor stopped");
        }
    }
}

impl Drop for LinuxPowerMonitor {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
        self.state.release();
    }
}

fn monitor(
    state: Arc<MonitorState>,
    primary: Option<CommandSpec>,
    fallback: Option<CommandSpec>,
    sink: PowerEventSink,
) {
    let _span = component_span("power-monitor", None).entered();

    let primary_end = follow(&state, primary.as_ref(), &mut SleepSignalParser::new(), &sink);
    let primary_name = describe(primary.as_ref());
    match primary_end {
        StreamEnd::Stopped => return,
        StreamEnd::Ended => warn!("{} exited, falling back to the journal", primary_name),
        StreamEnd::SpawnFailed(e) => {
            warn!("Could not start {}: {}, falling back to the journal", primary_name, e)
        }
        StreamEnd::ReadFailed(e) => {
            warn!("Reading {} failed: {}, falling back to the journal", primary_name, e)
        }
    }

    let fallback_end = follow(&state, fallback.as_ref(), &mut JournalLineParser::new(), &sink);
    let fallback_name = describe(fallback.as_ref());
    match fallback_end {
        StreamEnd::Stopped => return,
        StreamEnd::Ended => warn!(
            "{} exited, suspend and resume events will not be detected",
            fallback_name
        ),
        StreamEnd::SpawnFailed(e) => error!(
            "Could not start {}: {}, suspend and resume events will not be detected",
            fallback_name, e
        ),
        StreamEnd::ReadFailed(e) => error!(
            "Reading {} failed: {}, suspend and resume events will not be detected",
            fallback_name, e
        ),
    }

    state.running.store(false, Ordering::SeqCst);
}

fn describe(spec: Option<&CommandSpec>) -> String {
    spec.map(ToString::to_string)
        .unwrap_or_else(|| "<unconfigured>".to_string())
}

/// Run one strategy until its stream ends or shutdown is requested
fn follow(
    state: &MonitorState,
    spec: Option<&CommandSpec>,
    parser: &mut dyn LineParser,
    sink: &PowerEventSink,
) -> StreamEnd {
    if !state.is_running() {
        return StreamEnd::Stopped;
    }
    let Some(spec) = spec else {
        return StreamEnd::SpawnFailed(Error::subprocess("no command configured"));
    };

    let mut child = match spec.spawn() {
        Ok(child) => child,
        Err(e) => return StreamEnd::SpawnFailed(Error::Io(e)),
    };
    let Some(stdout) = child.stdout.take() else {
        reap(child);
        return StreamEnd::SpawnFailed(Error::subprocess("subprocess has no stdout"));
    };
    state.adopt(child);
    debug!("Following {}", spec);

    // shutdown may have run between spawn and adopt
    if !state.is_running() {
        state.release();
        return StreamEnd::Stopped;
    }

    let mut end = StreamEnd::Ended;
    for line in BufReader::new(stdout).lines() {
        if !state.is_running() {
            end = StreamEnd::Stopped;
            break;
        }
        match line {
            Ok(line) => {
                trace!("{}: {}", spec, line);
                if let Some(event) = parser.feed(&line) {
                    if state.is_running() {
                        sink.emit(event);
                    }
                }
            }
            Err(e) => {
                end = StreamEnd::ReadFailed(e);
                break;
            }
        }
    }

    state.release();
    if !state.is_running() {
        return StreamEnd::Stopped;
    }
    end
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::power::PowerEvent;
    use panelsync_core::event::{EventReceiver, SharedEventBus};
    use std::time::{Duration, Instant};

    const HEADER: &str = "signal time=1.5 sender=:1.3 -> destination=(null destination) serial=9 path=/org/freedesktop/login1; interface=org.freedesktop.login1.Manager; member=PrepareForSleep";

    fn shell(script: &str) -> Option<CommandSpec> {
        CommandSpec::from_argv(&["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    fn missing() -> Option<CommandSpec> {
        CommandSpec::from_argv(&["/nonexistent/panelsync-no-such-binary".to_string()])
    }

    async fn collect(rx: &mut EventReceiver<PowerEvent>, count: usize) -> Vec<PowerEvent> {
        let mut events = Vec::new();
        while events.len() < count {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(event)) => events.push(event),
                _ => break,
            }
        }
        events
    }

    async fn wait_stopped(monitor: &LinuxPowerMonitor) -> bool {
        panelsync_core::utils::poll_until(Duration::from_millis(10), 500, || {
            !monitor.is_running()
        })
        .await
    }

    #[tokio::test]
    async fn test_primary_then_fallback() -> Result<()> {
        let bus = SharedEventBus::new();
        let mut rx = bus.subscribe::<PowerEvent>()?;
        let script = format!(
            "printf '%s\\n' '{h}' '   boolean true' 'noise' '{h}' '   boolean false'",
            h = HEADER
        );
        let monitor = LinuxPowerMonitor::with_commands(
            shell(&script),
            shell("printf 'systemd[1]: Starting Suspend...\\n'"),
        );

        monitor.start(PowerEventSink::new(bus))?;
        let events = collect(&mut rx, 3).await;

        assert_eq!(
            events,
            vec![
                PowerEvent::GoingToSuspend,
                PowerEvent::ResumedFromSuspend,
                PowerEvent::GoingToSuspend,
            ]
        );
        assert!(wait_stopped(&monitor).await);
        monitor.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_primary_uses_fallback() -> Result<()> {
        let bus = SharedEventBus::new();
        let mut rx = bus.subscribe::<PowerEvent>()?;
        let monitor = LinuxPowerMonitor::with_commands(
            missing(),
            shell("printf 'Starting Hibernate...\\nFinished Hibernate.\\n'"),
        );

        monitor.start(PowerEventSink::new(bus))?;
        let events = collect(&mut rx, 2).await;

        assert_eq!(
            events,
            vec![PowerEvent::GoingToSuspend, PowerEvent::ResumedFromSuspend]
        );
        monitor.shutdown();
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_both_strategies_fail() -> Result<()> {
        let bus = SharedEventBus::new();
        let mut rx = bus.subscribe::<PowerEvent>()?;
        let monitor = LinuxPowerMonitor::with_commands(missing(), None);

        monitor.start(PowerEventSink::new(bus))?;
        assert!(wait_stopped(&monitor).await);
        assert!(rx.try_recv().is_err());
        monitor.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_kills_subprocess() -> Result<()> {
        let bus = SharedEventBus::new();
        let mut rx = bus.subscribe::<PowerEvent>()?;
        let monitor = LinuxPowerMonitor::with_commands(
            shell("exec sleep 30"),
            shell("printf 'Starting Suspend...\\n'"),
        );

        monitor.start(PowerEventSink::new(bus))?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(monitor.is_running());

        let started = Instant::now();
        monitor.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!monitor.is_running());

        // the fallback must not run after a requested stop
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        monitor.shutdown();
        Ok(())
    }

    #[test]
    fn test_command_spec() {
        assert_eq!(CommandSpec::from_argv(&[]), None);
        assert_eq!(CommandSpec::from_argv(&[" ".to_string()]), None);
        let spec = CommandSpec::from_argv(&["journalctl".to_string(), "-f".to_string()]);
        assert_eq!(spec.map(|s| s.to_string()), Some("journalctl".to_string()));
    }
}
