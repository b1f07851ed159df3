/*!
 * Suspend and resume coordination.
 *
 * Before the system sleeps every device is switched dark; on the way back
 * the hardware gets time to re-enumerate, the registry rescans, and each
 * device's stored lighting is sent again. Reactions run one at a time on a
 * single task, in the order the events arrived. Shutdown is the exception:
 * [`PowerEventCoordinator::on_shutdown`] runs inline so the process can
 * wait for it.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use panelsync_core::config::PowerConfig;
use panelsync_core::event::SharedEventBus;
use panelsync_core::logging::component_span;
use panelsync_core::types::LightingConfig;
use panelsync_core::utils::poll_until;
use panelsync_devices::DeviceRegistry;

use crate::error::Result;
use crate::power::PowerEvent;

/// Delays used by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorTimings {
    /// Wait after resume before rescanning
    pub resume_settle: Duration,
    /// Wait after rescanning before restoring lighting
    pub reconnect_settle: Duration,
    /// Interval between drain checks on shutdown
    pub drain_poll_interval: Duration,
    /// Drain checks before giving up on a device
    pub drain_poll_attempts: u32,
}

impl Default for CoordinatorTimings {
    fn default() -> Self {
        Self::from(&PowerConfig::default())
    }
}

impl From<&PowerConfig> for CoordinatorTimings {
    fn from(config: &PowerConfig) -> Self {
        Self {
            resume_settle: config.resume_settle(),
            reconnect_settle: config.reconnect_settle(),
            drain_poll_interval: config.drain_poll_interval(),
            drain_poll_attempts: config.drain_poll_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reaction {
    Suspend,
    Resume,
}

impl From<PowerEvent> for Reaction {
    fn from(event: PowerEvent) -> Self {
        match event {
            PowerEvent::GoingToSuspend | PowerEvent::Locked => Reaction::Suspend,
            PowerEvent::ResumedFromSuspend | PowerEvent::Unlocked => Reaction::Resume,
        }
    }
}

#[derive(Debug, Clone)]
struct Reactor {
    registry: Arc<DeviceRegistry>,
    timings: CoordinatorTimings,
}

impl Reactor {
    async fn react(&self, reaction: Reaction) {
        match reaction {
            Reaction::Suspend => self.suspend(false).await,
            Reaction::Resume => self.resume().await,
        }
    }

    async fn suspend(&self, shutdown: bool) {
        let connections = self.registry.connections();
        info!(
            "Switching off {} devices{}",
            connections.len(),
            if shutdown { " for shutdown" } else { "" }
        );

        for connection in connections {
            let serial = connection.serial().to_string();
            if let Err(e) = self.registry.send_lighting_config(
                &serial,
                connection.device_type(),
                LightingConfig::all_off(),
                true,
            ) {
                warn!("Failed to switch off {}: {}", serial, e);
                continue;
            }

            if shutdown {
                let drained = poll_until(
                    self.timings.drain_poll_interval,
                    self.timings.drain_poll_attempts,
                    || connection.queue_is_empty(),
                )
                .await;
                if !drained {
                    warn!("Gave up waiting for {} to finish sending", serial);
                }
            }
        }

        if shutdown {
            self.registry.close();
        }
    }

    async fn resume(&self) {
        debug!("Waiting {:?} for devices to settle", self.timings.resume_settle);
        tokio::time::sleep(self.timings.resume_settle).await;

        let added = self.registry.rescan();
        debug!("Rescan after resume added {} devices", added);

        tokio::time::sleep(self.timings.reconnect_settle).await;

        let mut restored = 0;
        for connection in self.registry.connections() {
            let Some(lighting) = connection.lighting_config() else {
                debug!("No stored lighting to restore on {}", connection.serial());
                continue;
            };
            match self.registry.send_lighting_config(
                connection.serial(),
                connection.device_type(),
                lighting,
                true,
            ) {
                Ok(()) => restored += 1,
                Err(e) => warn!("Failed to restore lighting on {}: {}", connection.serial(), e),
            }
        }
        info!("Restored lighting on {} devices", restored);
    }
}

/// Reacts to power events on behalf of every registered device
#[derive(Debug)]
pub struct PowerEventCoordinator {
    reactor: Reactor,
    reactions: mpsc::UnboundedSender<Reaction>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl PowerEventCoordinator {
    /// Start reacting to [`PowerEvent`]s published on `bus`
    pub fn start(
        registry: Arc<DeviceRegistry>,
        bus: &SharedEventBus,
        timings: CoordinatorTimings,
    ) -> Result<Self> {
        let mut events = bus.subscribe::<PowerEvent>()?;
        let (reactions, mut queue) = mpsc::unbounded_channel::<Reaction>();
        let reactor = Reactor { registry, timings };

        let worker = {
            let reactor = reactor.clone();
            tokio::spawn(
                async move {
                    while let Some(reaction) = queue.recv().await {
                        debug!("Handling {:?}", reaction);
                        reactor.react(reaction).await;
                    }
                }
                .instrument(component_span("power-coordinator", None)),
            )
        };

        let forwarder = {
            let reactions = reactions.clone();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            if reactions.send(Reaction::from(event)).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Missed {} power events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        Ok(Self {
            reactor,
            reactions,
            tasks: Mutex::new(vec![worker, forwarder]),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Queue a reaction to `event` behind any reaction still running
    pub fn post(&self, event: PowerEvent) {
        if self.reactions.send(Reaction::from(event)).is_err() {
            debug!("Coordinator stopped, ignoring {}", event);
        }
    }

    /// Switch devices off, wait for their queues to drain, and close the
    /// registry
    ///
    /// Pending reactions are abandoned. Only the first call does anything.
    pub async fn on_shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        self.reactor.suspend(true).await;
        info!("Power coordinator shut down");
    }
}

impl Drop for PowerEventCoordinator {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}
