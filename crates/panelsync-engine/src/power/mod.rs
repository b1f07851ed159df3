/*!
 * Power event detection.
 *
 * A [`PowerEventSource`] watches the operating system for suspend, resume,
 * lock and unlock and reports each transition once, in order, through a
 * [`PowerEventSink`]. Which source runs is decided once, from configuration,
 * by [`select_source`].
 */
use std::fmt;

use tracing::{debug, error, info};

use panelsync_core::config::{PowerConfig, PowerSourceKind};
use panelsync_core::event::SharedEventBus;

use crate::error::Result;

pub mod linux;
pub mod parser;

pub use linux::LinuxPowerMonitor;
pub use parser::{JournalLineParser, LineParser, SignalState, SleepSignalParser};

/// An operating-system power transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerEvent {
    /// The system is about to suspend
    GoingToSuspend,
    /// The system came back from suspend
    ResumedFromSuspend,
    /// The session was locked
    Locked,
    /// The session was unlocked
    Unlocked,
}

impl fmt::Display for PowerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerEvent::GoingToSuspend => "going to suspend",
            PowerEvent::ResumedFromSuspend => "resumed from suspend",
            PowerEvent::Locked => "locked",
            PowerEvent::Unlocked => "unlocked",
        };
        f.write_str(name)
    }
}

/// Where power sources report transitions
#[derive(Debug, Clone)]
pub struct PowerEventSink {
    bus: SharedEventBus,
}

impl PowerEventSink {
    /// Report onto an event bus
    pub fn new(bus: SharedEventBus) -> Self {
        Self { bus }
    }

    /// Report one transition
    pub fn emit(&self, event: PowerEvent) {
        info!("Power event: {}", event);
        self.bus.emit(event);
    }
}

/// A power event detector
pub trait PowerEventSource: Send + Sync + fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Begin detecting; events go to `sink` until [`shutdown`](Self::shutdown)
    fn start(&self, sink: PowerEventSink) -> Result<()>;

    /// Stop detecting and release every resource; safe to call repeatedly
    fn shutdown(&self);
}

/// A source that never reports anything
#[derive(Debug, Default)]
pub struct DisabledPowerSource;

impl PowerEventSource for DisabledPowerSource {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn start(&self, _sink: PowerEventSink) -> Result<()> {
        info!("Power event detection disabled");
        Ok(())
    }

    fn shutdown(&self) {
        debug!("Disabled power source shut down");
    }
}

/// Shut a source down off the async worker threads
///
/// [`PowerEventSource::shutdown`] may join a monitor thread, so it runs on
/// the blocking pool.
pub async fn shutdown_source(source: Box<dyn PowerEventSource>) {
    let name = source.name();
    if let Err(e) = tokio::task::spawn_blocking(move || source.shutdown()).await {
        error!("Failed to shut down {} power source: {}", name, e);
    }
}

/// Build the power source the configuration asks for
pub fn select_source(config: &PowerConfig) -> Box<dyn PowerEventSource> {
    let kind = match config.source {
        PowerSourceKind::Auto if cfg!(target_os = "linux") => PowerSourceKind::Linux,
        PowerSourceKind::Auto => PowerSourceKind::Disabled,
        kind => kind,
    };

    match kind {
        PowerSourceKind::Linux => Box::new(LinuxPowerMonitor::new(config)),
        _ => Box::new(DisabledPowerSource),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_source() {
        let mut config = PowerConfig::default();

        config.source = PowerSourceKind::Disabled;
        assert_eq!(select_source(&config).name(), "disabled");

        config.source = PowerSourceKind::Linux;
        assert_eq!(select_source(&config).name(), "linux");

        config.source = PowerSourceKind::Auto;
        let expected = if cfg!(target_os = "linux") { "linux" } else { "disabled" };
        assert_eq!(select_source(&config).name(), expected);
    }

    #[tokio::test]
    async fn test_sink_publishes_on_bus() -> panelsync_core::error::Result<()> {
        let bus = SharedEventBus::new();
        let mut rx = bus.subscribe::<PowerEvent>()?;
        let sink = PowerEventSink::new(bus);

        sink.emit(PowerEvent::Locked);
        sink.emit(PowerEvent::Unlocked);

        assert_eq!(rx.try_recv().ok(), Some(PowerEvent::Locked));
        assert_eq!(rx.try_recv().ok(), Some(PowerEvent::Unlocked));
        Ok(())
    }

    #[derive(Debug, Default)]
    struct SlowSource {
        shutdowns: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl PowerEventSource for SlowSource {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn start(&self, _sink: PowerEventSink) -> Result<()> {
            Ok(())
        }

        fn shutdown(&self) {
            std::thread::sleep(std::time::Duration::from_millis(200));
            self.shutdowns
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_shutdown_source_does_not_block_runtime() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use std::time::Duration;

        let source = SlowSource::default();
        let shutdowns = source.shutdowns.clone();
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        shutdown_source(Box::new(source)).await;
        ticker.abort();

        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        // the single-threaded runtime kept running other tasks meanwhile
        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }

    #[test]
    fn test_disabled_source() {
        let source = DisabledPowerSource;
        assert!(source.start(PowerEventSink::new(SharedEventBus::new())).is_ok());
        source.shutdown();
        source.shutdown();
    }
}
