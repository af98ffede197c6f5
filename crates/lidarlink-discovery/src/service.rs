//! Connection service: owns the reactor, discovery and the command channel,
//! and drives all three from one task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use lidarlink_core::{DeviceEvent, SequenceGenerator};
use lidarlink_transport::{IoEvent, IoLoop, TransportConfig, find_local_ip};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{ChannelConfig, ChannelEvent, CommandChannel, CommandHandle};
use crate::discovery::{DeviceDiscovery, DiscoveryConfig, FoundDevice, LocalIpResolver};
use crate::error::ServiceError;
use crate::manager::DeviceManager;

/// Configuration for every layer the service owns
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Reactor settings
    pub transport: TransportConfig,
    /// Discovery settings
    pub discovery: DiscoveryConfig,
    /// Command channel settings
    pub channel: ChannelConfig,
}

/// Running connection layer.
///
/// Dropping the service signals the event loop to stop without waiting for
/// it; [`shutdown`](Self::shutdown) also waits for every socket to be
/// closed and the manager to be reset.
#[derive(Debug)]
pub struct ConnectionService {
    manager: Arc<DeviceManager>,
    local_addr: Option<SocketAddr>,
    command_handle: CommandHandle,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionService {
    /// Start discovery and the event loop with a fresh manager
    pub async fn start(config: ServiceConfig) -> Result<Self, ServiceError> {
        Self::start_with(config, Arc::new(DeviceManager::new()), Box::new(find_local_ip)).await
    }

    /// Start with a caller-provided manager and local IP resolver.
    ///
    /// Fails only if the discovery listener cannot be bound.
    pub async fn start_with(
        config: ServiceConfig,
        manager: Arc<DeviceManager>,
        resolver: LocalIpResolver,
    ) -> Result<Self, ServiceError> {
        let sequence = Arc::new(SequenceGenerator::new());
        let mut io = IoLoop::new(&config.transport);

        let mut discovery =
            DeviceDiscovery::new(config.discovery, Arc::clone(&manager), Arc::clone(&sequence))
                .with_local_ip_resolver(resolver);
        discovery.start(&mut io)?;
        let local_addr = discovery.local_addr(&io);

        let channel = CommandChannel::new(config.channel, sequence);
        let command_handle = channel.handle();
        manager.set_command_dispatcher(Arc::new(command_handle.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let event_loop = EventLoop {
            io,
            discovery,
            channel,
            manager: Arc::clone(&manager),
        };
        let task = tokio::spawn(event_loop.run(shutdown_rx));

        info!(addr = ?local_addr, "connection service started");
        Ok(Self {
            manager,
            local_addr,
            command_handle,
            shutdown_tx,
            task: Some(task),
        })
    }

    /// The device manager
    pub fn manager(&self) -> &Arc<DeviceManager> {
        &self.manager
    }

    /// Bound address of the discovery listener
    pub fn local_discovery_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Dispatcher for sending commands to connected devices
    pub fn command_handle(&self) -> CommandHandle {
        self.command_handle.clone()
    }

    /// Stop the event loop and release every socket
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "event loop task failed");
            }
        }
    }
}

impl Drop for ConnectionService {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct EventLoop {
    io: IoLoop,
    discovery: DeviceDiscovery,
    channel: CommandChannel,
    manager: Arc<DeviceManager>,
}

impl EventLoop {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                Some(request) = self.channel.next_request() => {
                    self.channel.process_request(request, &mut self.io, Instant::now());
                }

                event = self.io.next_event() => self.on_event(event),
            }
        }
        self.teardown();
    }

    fn on_event(&mut self, event: IoEvent) {
        match event {
            IoEvent::Datagram { token, from, data } => {
                let now = Instant::now();
                if self.discovery.owns(token) {
                    if let Some(found) =
                        self.discovery
                            .on_data(token, from, &data, &mut self.io, now)
                    {
                        self.admit(found, now);
                    }
                } else if self.channel.owns(token) {
                    let events = self.channel.on_data(token, &data, now);
                    self.apply(events);
                } else {
                    trace!(%token, peer = %from, "datagram on retired socket");
                }
            }
            IoEvent::Timer(now) => {
                self.discovery.on_timer(now, &mut self.io);
                let events = self.channel.on_timer(now, &mut self.io);
                self.apply(events);
            }
        }
    }

    fn admit(&mut self, found: FoundDevice, now: Instant) {
        let FoundDevice { info, remote } = found;
        if let Err(e) = self
            .channel
            .add_device(&info, remote, &mut self.io, now)
        {
            error!(handle = info.handle, error = %e, "failed to open command channel");
            return;
        }
        self.manager.device_found(info);
    }

    fn apply(&mut self, events: Vec<ChannelEvent>) {
        for event in events {
            match event {
                ChannelEvent::Heartbeat { handle, response } => {
                    self.manager.update_device_state(handle, &response);
                }
                ChannelEvent::Lost(handle) => {
                    self.manager.device_remove(handle, DeviceEvent::Disconnect);
                }
            }
        }
    }

    fn teardown(mut self) {
        debug!("connection service stopping");
        self.discovery.uninit(&mut self.io);
        self.channel.close(&mut self.io);
        self.io.close_all();
        self.manager.reset();
        info!("connection service stopped");
    }
}
