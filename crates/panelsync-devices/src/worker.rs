/*!
 * Per-device command queue and worker.
 *
 * Every connection owns one bounded [`CommandQueue`] and one tokio task that
 * drains it in order, handing each command to the device handle on the
 * blocking pool. Immediate commands always leave the queue before normal
 * ones. Normal lighting updates batch: a newer one replaces any older one
 * that has not been sent yet.
 */
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn, Instrument};

use panelsync_core::logging::component_span;

use crate::device::{CommandPriority, DeviceCommand, DeviceError, DeviceHandle, Result};

#[derive(Debug, Default)]
struct QueueState {
    immediate: VecDeque<DeviceCommand>,
    normal: VecDeque<DeviceCommand>,
    in_flight: bool,
    closed: bool,
}

impl QueueState {
    fn len(&self) -> usize {
        self.immediate.len() + self.normal.len()
    }
}

/// Bounded two-level priority queue
#[derive(Debug)]
pub struct CommandQueue {
    serial: String,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl CommandQueue {
    /// Create a queue holding at most `capacity` commands
    pub fn new(serial: impl Into<String>, capacity: usize) -> Self {
        Self {
            serial: serial.into(),
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>> {
        self.state.lock().map_err(|_| {
            DeviceError::Other(format!("Failed to lock command queue for {}", self.serial))
        })
    }

    /// Enqueue a command
    ///
    /// A full queue makes room for an immediate command by dropping the
    /// oldest normal one; a normal command is rejected instead.
    pub fn push(&self, command: DeviceCommand, priority: CommandPriority) -> Result<()> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(DeviceError::NotConnected(self.serial.clone()));
        }

        if command.is_lighting() {
            let before = state.normal.len();
            state.normal.retain(|queued| !queued.is_lighting());
            if state.normal.len() != before {
                trace!("Dropped stale lighting update for {}", self.serial);
            }
        }

        if state.len() >= self.capacity {
            if priority == CommandPriority::Immediate && state.normal.pop_front().is_some() {
                warn!("Command queue for {} full, dropped oldest normal command", self.serial);
            } else {
                return Err(DeviceError::QueueFull(self.serial.clone()));
            }
        }

        match priority {
            CommandPriority::Immediate => state.immediate.push_back(command),
            CommandPriority::Normal => state.normal.push_back(command),
        }
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next command, or `None` once the queue is closed
    pub async fn next(&self) -> Option<DeviceCommand> {
        loop {
            {
                let mut state = self.lock().ok()?;
                if state.closed {
                    return None;
                }
                let next = state
                    .immediate
                    .pop_front()
                    .or_else(|| state.normal.pop_front());
                if let Some(command) = next {
                    state.in_flight = true;
                    return Some(command);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark the command returned by [`next`](CommandQueue::next) as finished
    pub fn complete(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.in_flight = false;
        }
    }

    /// Nothing queued and nothing being sent
    pub fn is_empty(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.len() == 0 && !s.in_flight)
            .unwrap_or(true)
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Stop accepting commands and discard what is queued
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.immediate.clear();
            state.normal.clear();
        }
        self.notify.notify_one();
    }

    /// Whether [`close`](CommandQueue::close) was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }
}

/// Spawn the task that drains `queue` into `handle`
pub fn spawn_worker(queue: Arc<CommandQueue>, handle: Arc<dyn DeviceHandle>) -> JoinHandle<()> {
    let span = component_span("device-worker", Some(&queue.serial));
    tokio::spawn(
        async move {
            debug!("Command worker started");
            while let Some(command) = queue.next().await {
                let target = handle.clone();
                let result = tokio::task::spawn_blocking(move || target.send(&command)).await;
                match result {
                    Ok(Ok(())) => trace!("Command sent"),
                    Ok(Err(e)) => warn!("Failed to send command to {}: {}", queue.serial, e),
                    Err(e) => error!("Command send task for {} failed: {}", queue.serial, e),
                }
                queue.complete();
            }
            debug!("Command worker stopped");
        }
        .instrument(span),
    )
}
