//! Scheduler Service
//!
//! Runs the scheduling loop of a started device on a dedicated thread.
//! The device moves onto the thread; link changes and statistics queries
//! reach it over a command channel and are applied between passes.

use crossbeam::channel::{bounded, Receiver, Sender};
use evdev_common::{EventDevError, EventDevResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::device::EventDev;
use crate::stats::StatsSnapshot;

/// Scheduler service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Pending commands before callers block
    pub command_capacity: usize,
    /// Consecutive idle passes before the thread yields its core
    pub idle_spins: u32,
    /// Push statistics to the `metrics` recorder at this interval
    pub metrics_interval: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            command_capacity: 64,
            idle_spins: 1024,
            metrics_interval: None,
        }
    }
}

enum Command {
    Link {
        port: u8,
        queues: Vec<u8>,
        priorities: Vec<u8>,
        reply: Sender<EventDevResult<usize>>,
    },
    Unlink {
        port: u8,
        queues: Vec<u8>,
        reply: Sender<EventDevResult<usize>>,
    },
    Stats {
        reply: Sender<StatsSnapshot>,
    },
}

/// Handle to a scheduler thread owning an [`EventDev`]
pub struct SchedulerService {
    name: String,
    running: Arc<AtomicBool>,
    commands: Sender<Command>,
    thread: Option<thread::JoinHandle<EventDev>>,
}

impl SchedulerService {
    /// Move a started device onto a new scheduler thread
    pub fn spawn(dev: EventDev) -> EventDevResult<Self> {
        Self::spawn_with(dev, ServiceConfig::default())
    }

    /// Move a started device onto a new scheduler thread with `config`
    pub fn spawn_with(dev: EventDev, config: ServiceConfig) -> EventDevResult<Self> {
        if !dev.is_running() {
            return Err(EventDevError::InvalidState(
                "scheduler service requires a started device".into(),
            ));
        }
        if let Some(reason) = dev.fault() {
            return Err(EventDevError::Faulted(reason.to_string()));
        }

        let name = dev.name().to_string();
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = bounded(config.command_capacity.max(1));

        let worker = Worker {
            dev,
            config,
            running: running.clone(),
            commands: rx,
        };
        let thread = thread::Builder::new()
            .name(format!("evdev-sched-{name}"))
            .spawn(move || worker.run())
            .map_err(|e| EventDevError::SpawnFailed(e.to_string()))?;

        tracing::info!(dev = %name, "scheduler service started");
        Ok(Self {
            name,
            running,
            commands: tx,
            thread: Some(thread),
        })
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once stopped or halted by a fault
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Link a port to queues on the running device
    pub fn port_link(&self, port: u8, queues: &[u8], priorities: &[u8]) -> EventDevResult<usize> {
        let (reply, rx) = bounded(1);
        self.send(Command::Link {
            port,
            queues: queues.to_vec(),
            priorities: priorities.to_vec(),
            reply,
        })?;
        rx.recv().map_err(|_| EventDevError::ServiceStopped)?
    }

    /// Unlink a port from queues on the running device
    pub fn port_unlink(&self, port: u8, queues: &[u8]) -> EventDevResult<usize> {
        let (reply, rx) = bounded(1);
        self.send(Command::Unlink {
            port,
            queues: queues.to_vec(),
            reply,
        })?;
        rx.recv().map_err(|_| EventDevError::ServiceStopped)?
    }

    /// Statistics snapshot taken between passes
    pub fn stats(&self) -> EventDevResult<StatsSnapshot> {
        let (reply, rx) = bounded(1);
        self.send(Command::Stats { reply })?;
        rx.recv().map_err(|_| EventDevError::ServiceStopped)
    }

    /// Stop the thread and take the device back. It is returned still started.
    pub fn stop(mut self) -> EventDevResult<EventDev> {
        self.running.store(false, Ordering::Release);
        let handle = self.thread.take().ok_or(EventDevError::ServiceStopped)?;
        let dev = handle.join().map_err(|_| EventDevError::ServiceStopped)?;
        tracing::info!(dev = %self.name, "scheduler service stopped");
        Ok(dev)
    }

    fn send(&self, cmd: Command) -> EventDevResult<()> {
        if !self.is_running() {
            return Err(EventDevError::ServiceStopped);
        }
        self.commands.send(cmd).map_err(|_| EventDevError::ServiceStopped)
    }
}

impl Drop for SchedulerService {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for SchedulerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerService")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

/// State owned by the scheduler thread
struct Worker {
    dev: EventDev,
    config: ServiceConfig,
    running: Arc<AtomicBool>,
    commands: Receiver<Command>,
}

impl Worker {
    fn run(mut self) -> EventDev {
        tracing::debug!(dev = %self.dev.name(), "scheduler thread starting");
        let mut idle = 0u32;
        let mut last_publish = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            while let Ok(cmd) = self.commands.try_recv() {
                self.apply(cmd);
            }

            match self.dev.schedule() {
                Ok(0) => {
                    idle += 1;
                    if idle >= self.config.idle_spins {
                        idle = 0;
                        thread::yield_now();
                    } else {
                        std::hint::spin_loop();
                    }
                }
                Ok(_) => idle = 0,
                Err(e) => {
                    tracing::error!(dev = %self.dev.name(), error = %e, "scheduler thread halted");
                    break;
                }
            }

            if let Some(interval) = self.config.metrics_interval {
                if last_publish.elapsed() >= interval {
                    self.dev.publish_metrics();
                    last_publish = Instant::now();
                }
            }
        }

        self.running.store(false, Ordering::Release);
        // Answer anything still queued so no caller waits forever
        while let Ok(cmd) = self.commands.try_recv() {
            self.apply(cmd);
        }
        tracing::debug!(dev = %self.dev.name(), "scheduler thread stopped");
        self.dev
    }

    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::Link {
                port,
                queues,
                priorities,
                reply,
            } => {
                let _ = reply.send(self.dev.port_link(port, &queues, &priorities));
            }
            Command::Unlink {
                port,
                queues,
                reply,
            } => {
                let _ = reply.send(self.dev.port_unlink(port, &queues));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.dev.stats());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DevConfig, PortConf, QueueConf, RuntimeParams};

    fn started_dev() -> EventDev {
        let mut dev = EventDev::new("svc", RuntimeParams::default()).unwrap();
        dev.configure(DevConfig {
            nb_event_queues: 1,
            nb_event_ports: 1,
            ..Default::default()
        })
        .unwrap();
        dev.queue_setup(0, QueueConf::atomic()).unwrap();
        dev.port_setup(0, PortConf::default()).unwrap();
        dev.port_link(0, &[0], &[]).unwrap();
        dev.start().unwrap();
        dev
    }

    #[test]
    fn test_service_lifecycle() {
        let svc = SchedulerService::spawn(started_dev()).unwrap();
        assert!(svc.is_running());
        assert_eq!(svc.name(), "svc");

        let stats = svc.stats().unwrap();
        assert_eq!(stats.ports.len(), 1);

        let dev = svc.stop().unwrap();
        assert!(dev.is_running());
        assert!(dev.stats().dev.counters.sched_calls > 0);
    }

    #[test]
    fn test_spawn_requires_started_device() {
        let mut dev = started_dev();
        dev.stop();
        assert!(matches!(
            SchedulerService::spawn(dev),
            Err(EventDevError::InvalidState(_))
        ));
    }

    #[test]
    fn test_link_commands() {
        let svc = SchedulerService::spawn(started_dev()).unwrap();
        assert_eq!(svc.port_unlink(0, &[0]).unwrap(), 1);
        assert_eq!(svc.port_link(0, &[0], &[]).unwrap(), 1);
        assert!(matches!(
            svc.port_link(0, &[7], &[]),
            Err(EventDevError::QueueOutOfRange(7))
        ));

        let dev = svc.stop().unwrap();
        assert_eq!(dev.port_links(0).unwrap().len(), 1);
    }
}
