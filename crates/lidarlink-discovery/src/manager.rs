//! Device Manager
//!
//! Owns the device table and the topology mode, assigns handles, applies
//! heartbeat state and fans out device notifications.
//!
//! Every operation takes the manager mutex for its whole duration. Callbacks
//! registered with [`DeviceManager::set_device_connected_callback`] and
//! [`DeviceManager::set_device_broadcast_callback`] run synchronously while
//! that mutex is held: they must return promptly and must not call back into
//! the manager. Applications that prefer a queue can use
//! [`DeviceManager::event_channel`] instead.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lidarlink_core::{
    BroadcastCode, BroadcastInfo, CommandSet, DeviceEvent, DeviceInfo, DeviceType, HUB_HANDLE,
    HeartbeatResponse, HubCommand, HubQueryLidarInformationResponse, MAX_DEVICES, TopologyMode,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dispatch::{CommandCallback, CommandDispatcher, CommandStatus};
use crate::error::ManagerError;
use crate::table::DeviceTable;

/// Receives device lifecycle notifications
pub type ConnectedCallback = Box<dyn Fn(&DeviceInfo, DeviceEvent) + Send>;

/// Receives every observed broadcast, whitelisted or not
pub type BroadcastCallback = Box<dyn Fn(&BroadcastInfo) + Send>;

/// Notification delivered through [`DeviceManager::event_channel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// Device lifecycle change
    Device {
        /// Device record at the time of the event
        info: DeviceInfo,
        /// What happened
        event: DeviceEvent,
    },
    /// A broadcast was observed
    Broadcast(BroadcastInfo),
}

#[derive(Default)]
struct ManagerState {
    table: DeviceTable,
    mode: TopologyMode,
    connected_cb: Option<ConnectedCallback>,
    broadcast_cb: Option<BroadcastCallback>,
    dispatcher: Option<Arc<dyn CommandDispatcher>>,
}

impl ManagerState {
    fn notify(&self, info: &DeviceInfo, event: DeviceEvent) {
        if let Some(cb) = &self.connected_cb {
            cb(info, event);
        }
    }

    fn admit(&mut self, info: DeviceInfo) {
        let handle = info.handle;
        let Some(slot) = self.table.get_mut(handle) else {
            debug!(handle, "ignoring device with out-of-range handle");
            return;
        };
        slot.code = Some(info.broadcast_code);
        slot.connected = true;
        slot.info = Some(info.clone());

        if self.mode == TopologyMode::None {
            self.mode = if info.device_type.is_hub() {
                TopologyMode::Hub
            } else {
                TopologyMode::Lidar
            };
            info!(mode = ?self.mode, "topology mode latched");
        }
    }
}

/// Canonical device table shared by discovery, the command path and callers
#[derive(Default)]
pub struct DeviceManager {
    state: Mutex<ManagerState>,
}

impl fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("DeviceManager")
            .field("mode", &state.mode)
            .field("occupied", &state.table.occupied())
            .finish_non_exhaustive()
    }
}

impl DeviceManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach the dispatcher used for hub member queries
    pub fn set_command_dispatcher(&self, dispatcher: Arc<dyn CommandDispatcher>) {
        self.lock().dispatcher = Some(dispatcher);
    }

    /// Register the device notification callback, replacing any previous one
    pub fn set_device_connected_callback<F>(&self, callback: F)
    where
        F: Fn(&DeviceInfo, DeviceEvent) + Send + 'static,
    {
        self.lock().connected_cb = Some(Box::new(callback));
    }

    /// Register the broadcast callback, replacing any previous one
    pub fn set_device_broadcast_callback<F>(&self, callback: F)
    where
        F: Fn(&BroadcastInfo) + Send + 'static,
    {
        self.lock().broadcast_cb = Some(Box::new(callback));
    }

    /// Route both callbacks into a queue.
    ///
    /// Replaces any registered callbacks.
    pub fn event_channel(&self) -> mpsc::UnboundedReceiver<ManagerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let broadcast_tx = tx.clone();
        self.set_device_connected_callback(move |info, event| {
            let _ = tx.send(ManagerEvent::Device {
                info: info.clone(),
                event,
            });
        });
        self.set_device_broadcast_callback(move |info| {
            let _ = broadcast_tx.send(ManagerEvent::Broadcast(info.clone()));
        });
        rx
    }

    /// Whitelist a broadcast code and return its handle.
    ///
    /// In hub mode the hub always takes [`HUB_HANDLE`]. Otherwise a code
    /// already in the table keeps its handle and a new code takes the first
    /// free slot.
    pub fn add_listening_device(
        &self,
        code: BroadcastCode,
        mode: TopologyMode,
    ) -> Result<u8, ManagerError> {
        if code.is_empty() {
            return Err(ManagerError::InvalidBroadcastCode);
        }

        let mut state = self.lock();
        if mode == TopologyMode::Hub {
            state.table.assign(HUB_HANDLE, code);
            return Ok(HUB_HANDLE);
        }

        if let Some(handle) = state.table.find_by_code(&code) {
            return Ok(handle);
        }

        let handle = state
            .table
            .first_free()
            .ok_or(ManagerError::TableFull(MAX_DEVICES))?;
        state.table.assign(handle, code);
        debug!(handle, broadcast_code = %code, "listening for device");
        Ok(handle)
    }

    /// Write `info` into its slot and mark it connected.
    ///
    /// Latches the topology mode on the first admission. Out-of-range
    /// handles are ignored.
    pub fn add_device(&self, info: DeviceInfo) {
        self.lock().admit(info);
    }

    /// Mark a device disconnected.
    ///
    /// In hub mode losing any device means losing the hub, so every slot is
    /// disconnected.
    pub fn remove_device(&self, handle: u8) {
        let mut state = self.lock();
        match state.mode {
            TopologyMode::Hub => state.table.disconnect_where(|_| true),
            TopologyMode::Lidar => {
                if let Some(slot) = state.table.get_mut(handle) {
                    slot.connected = false;
                }
            }
            TopologyMode::None => {}
        }
    }

    /// Deliver a device notification.
    ///
    /// In hub mode a [`DeviceEvent::HubConnectionChange`] first queries the
    /// hub for its sensors; subscribers are notified once the answer is in.
    pub fn update_devices(self: &Arc<Self>, info: &DeviceInfo, event: DeviceEvent) {
        let dispatcher = {
            let state = self.lock();
            match state.mode {
                TopologyMode::None => return,
                TopologyMode::Hub if event == DeviceEvent::HubConnectionChange => {
                    state.dispatcher.clone()
                }
                _ => {
                    state.notify(info, event);
                    return;
                }
            }
        };

        match dispatcher {
            Some(dispatcher) => self.query_hub_lidars(dispatcher.as_ref(), info.handle),
            None => warn!("hub connection changed but no command dispatcher is attached"),
        }
    }

    fn query_hub_lidars(self: &Arc<Self>, dispatcher: &dyn CommandDispatcher, handle: u8) {
        let manager = Arc::downgrade(self);
        let callback: CommandCallback = Box::new(move |status, body| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let response = if status.is_success() {
                HubQueryLidarInformationResponse::decode(body)
                    .map_err(|e| warn!(error = %e, "malformed hub lidar information"))
                    .ok()
            } else {
                None
            };
            manager.on_hub_lidar_information(status, response.as_ref());
        });

        if let Err(e) = dispatcher.send_command(
            handle,
            CommandSet::Hub,
            HubCommand::QueryLidarInformation as u8,
            Vec::new(),
            callback,
        ) {
            error!(handle, error = %e, "failed to query lidars connected to hub");
        }
    }

    /// Apply the hub's answer to a member query.
    ///
    /// On success every non-hub slot is disconnected, each reported sensor
    /// is written to handle `(slot - 1) * 3 + (id - 1)` and marked
    /// connected, and subscribers receive the hub record tagged
    /// [`DeviceEvent::HubConnectionChange`]. On failure the table keeps its
    /// last known membership.
    pub fn on_hub_lidar_information(
        &self,
        status: CommandStatus,
        response: Option<&HubQueryLidarInformationResponse>,
    ) {
        let response = match response {
            Some(response) if status.is_success() && response.is_success() => response,
            _ => {
                error!(%status, "failed to query lidars connected to hub");
                return;
            }
        };

        let mut state = self.lock();
        let hub = state.table.get(HUB_HANDLE).and_then(|slot| slot.info.clone());

        state.table.disconnect_where(|handle| handle != HUB_HANDLE);

        for lidar in &response.lidars {
            let Some(handle) = lidar
                .handle()
                .filter(|&h| usize::from(h) < MAX_DEVICES && h != HUB_HANDLE)
            else {
                warn!(slot = lidar.slot, id = lidar.id, "hub reported sensor outside handle range");
                continue;
            };
            let Some(slot) = state.table.get_mut(handle) else {
                continue;
            };

            let mut record = match slot.info.take() {
                Some(existing) if existing.broadcast_code == lidar.broadcast_code => existing,
                _ => DeviceInfo::new(lidar.broadcast_code, handle, lidar.device_type),
            };
            record.slot = lidar.slot;
            record.id = lidar.id;
            record.device_type = lidar.device_type;
            if let Some(hub) = &hub {
                record.ip = hub.ip;
                record.cmd_port = hub.cmd_port;
                record.data_port = hub.data_port;
                record.sensor_port = hub.sensor_port;
            }

            slot.code = Some(lidar.broadcast_code);
            slot.connected = true;
            slot.info = Some(record);
        }

        debug!(count = response.lidars.len(), "hub membership updated");
        if let Some(hub) = hub {
            state.notify(&hub, DeviceEvent::HubConnectionChange);
        }
    }

    /// Apply one heartbeat to `handle`.
    ///
    /// Subscribers get [`DeviceEvent::StateChange`] only if the device is
    /// connected and state, feature or status actually changed.
    pub fn update_device_state(&self, handle: u8, heartbeat: &HeartbeatResponse) {
        let mut state = self.lock();
        let Some(slot) = state.table.get_mut(handle) else {
            return;
        };
        let connected = slot.connected;
        let Some(info) = slot.info.as_mut() else {
            return;
        };

        let mut changed = false;
        if info.state != heartbeat.state {
            info.state = heartbeat.state;
            changed = true;
        }
        if info.feature != heartbeat.feature {
            info.feature = heartbeat.feature;
            changed = true;
        }
        if info.status != heartbeat.status {
            info.status = heartbeat.status;
            changed = true;
        }

        if changed && connected {
            let snapshot = info.clone();
            debug!(handle, state = ?snapshot.state, "device state changed");
            state.notify(&snapshot, DeviceEvent::StateChange);
        }
    }

    /// Forward a broadcast to the broadcast callback
    pub fn broadcast_observed(&self, info: &BroadcastInfo) {
        let state = self.lock();
        if let Some(cb) = &state.broadcast_cb {
            cb(info);
        }
    }

    /// Admit a device that completed its handshake and notify subscribers
    pub fn device_found(self: &Arc<Self>, info: DeviceInfo) {
        let event = {
            let mut state = self.lock();
            state.admit(info.clone());
            match state.mode {
                TopologyMode::Hub => DeviceEvent::HubConnectionChange,
                _ => DeviceEvent::Connect,
            }
        };
        info!(
            handle = info.handle,
            broadcast_code = %info.broadcast_code,
            ip = %info.ip,
            "device connected"
        );
        self.update_devices(&info, event);
    }

    /// Disconnect a device and notify subscribers with `event`
    pub fn device_remove(self: &Arc<Self>, handle: u8, event: DeviceEvent) {
        let info = self.find_device(handle);
        self.remove_device(handle);
        if let Some(info) = info {
            info!(handle, broadcast_code = %info.broadcast_code, "device disconnected");
            self.update_devices(&info, event);
        }
    }

    /// Record for `handle`, if the device has been admitted
    pub fn find_device(&self, handle: u8) -> Option<DeviceInfo> {
        self.lock().table.get(handle).and_then(|slot| slot.info.clone())
    }

    /// Record for `code`, if the device has been admitted
    pub fn find_device_by_code(&self, code: &BroadcastCode) -> Option<DeviceInfo> {
        let state = self.lock();
        let handle = state.table.find_by_code(code)?;
        state.table.get(handle).and_then(|slot| slot.info.clone())
    }

    /// Handle owned by `code`, if it has been whitelisted
    pub fn find_handle(&self, code: &BroadcastCode) -> Option<u8> {
        self.lock().table.find_by_code(code)
    }

    /// True if `handle` is currently connected
    pub fn is_device_connected(&self, handle: u8) -> bool {
        self.lock()
            .table
            .get(handle)
            .is_some_and(|slot| slot.connected)
    }

    /// Records of every connected device
    pub fn connected_devices(&self) -> Vec<DeviceInfo> {
        self.lock().table.connected().cloned().collect()
    }

    /// Current topology mode
    pub fn device_mode(&self) -> TopologyMode {
        self.lock().mode
    }

    /// True if `handle` is a Mid-40
    pub fn is_mid40(&self, handle: u8) -> bool {
        self.lock()
            .table
            .get(handle)
            .and_then(|slot| slot.info.as_ref())
            .is_some_and(|info| info.device_type == DeviceType::Mid40)
    }

    /// Drop every device, the topology mode, callbacks and the dispatcher
    pub fn reset(&self) {
        *self.lock() = ManagerState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::recording::RecordingDispatcher;
    use lidarlink_core::{
        ConnectedLidarInfo, DeviceStatus, ErrorCode, LidarFeature, LidarState,
    };
    use std::net::Ipv4Addr;

    type Events = Arc<Mutex<Vec<(DeviceInfo, DeviceEvent)>>>;

    fn code(s: &str) -> BroadcastCode {
        BroadcastCode::parse(s).unwrap()
    }

    fn recorder(manager: &DeviceManager) -> Events {
        let events: Events = Arc::default();
        let sink = Arc::clone(&events);
        manager.set_device_connected_callback(move |info, event| {
            sink.lock().unwrap().push((info.clone(), event));
        });
        events
    }

    fn lidar(name: &str, handle: u8) -> DeviceInfo {
        let mut info = DeviceInfo::new(code(name), handle, DeviceType::Mid40);
        info.ip = Ipv4Addr::new(192, 168, 1, 10 + handle);
        info
    }

    fn hub(name: &str) -> DeviceInfo {
        let mut info = DeviceInfo::new(code(name), HUB_HANDLE, DeviceType::Hub);
        info.ip = Ipv4Addr::new(192, 168, 1, 2);
        info.cmd_port = 55501;
        info
    }

    fn heartbeat(state: LidarState, raw: u32) -> HeartbeatResponse {
        HeartbeatResponse {
            ret_code: 0,
            state,
            feature: LidarFeature::None,
            status: DeviceStatus::from_raw(state, raw),
        }
    }

    fn member(name: &str, slot: u8, id: u8) -> ConnectedLidarInfo {
        ConnectedLidarInfo {
            broadcast_code: code(name),
            device_type: DeviceType::Horizon,
            version: [1, 0, 0, 0],
            slot,
            id,
        }
    }

    #[test]
    fn test_add_listening_device_is_idempotent() {
        let manager = DeviceManager::new();
        let first = manager
            .add_listening_device(code("X"), TopologyMode::Lidar)
            .unwrap();
        let second = manager
            .add_listening_device(code("X"), TopologyMode::Lidar)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first, 0);
    }

    #[test]
    fn test_add_listening_device_sequential_handles() {
        let manager = DeviceManager::new();
        assert_eq!(manager.add_listening_device(code("a"), TopologyMode::Lidar), Ok(0));
        assert_eq!(manager.add_listening_device(code("b"), TopologyMode::Lidar), Ok(1));
        assert_eq!(manager.add_listening_device(code("a"), TopologyMode::Lidar), Ok(0));
        assert_eq!(manager.add_listening_device(code("c"), TopologyMode::Lidar), Ok(2));
    }

    #[test]
    fn test_table_full() {
        let manager = DeviceManager::new();
        for i in 0..MAX_DEVICES {
            let handle = manager
                .add_listening_device(code(&format!("sensor{i}")), TopologyMode::Lidar)
                .unwrap();
            assert_eq!(usize::from(handle), i);
        }
        assert_eq!(
            manager.add_listening_device(code("one-too-many"), TopologyMode::Lidar),
            Err(ManagerError::TableFull(MAX_DEVICES))
        );
        // Known codes still resolve
        assert_eq!(
            manager.add_listening_device(code("sensor5"), TopologyMode::Lidar),
            Ok(5)
        );
    }

    #[test]
    fn test_empty_code_rejected() {
        let manager = DeviceManager::new();
        assert_eq!(
            manager.add_listening_device(BroadcastCode::default(), TopologyMode::Lidar),
            Err(ManagerError::InvalidBroadcastCode)
        );
    }

    #[test]
    fn test_hub_always_gets_reserved_handle() {
        let manager = DeviceManager::new();
        manager
            .add_listening_device(code("a"), TopologyMode::Lidar)
            .unwrap();
        manager
            .add_listening_device(code("b"), TopologyMode::Lidar)
            .unwrap();
        assert_eq!(
            manager.add_listening_device(code("hub"), TopologyMode::Hub),
            Ok(HUB_HANDLE)
        );
        assert_eq!(
            manager.add_listening_device(code("hub"), TopologyMode::Hub),
            Ok(HUB_HANDLE)
        );
        assert_eq!(manager.find_handle(&code("hub")), Some(HUB_HANDLE));
    }

    #[test]
    fn test_add_device_latches_mode() {
        let manager = DeviceManager::new();
        assert_eq!(manager.device_mode(), TopologyMode::None);

        manager.add_device(hub("hub"));
        assert_eq!(manager.device_mode(), TopologyMode::Hub);

        manager.add_device(lidar("a", 0));
        assert_eq!(manager.device_mode(), TopologyMode::Hub);
        assert!(manager.is_device_connected(0));
        assert!(manager.is_device_connected(HUB_HANDLE));
    }

    #[test]
    fn test_add_device_lidar_mode() {
        let manager = DeviceManager::new();
        manager.add_device(lidar("a", 3));
        assert_eq!(manager.device_mode(), TopologyMode::Lidar);
        assert_eq!(manager.find_device(3).unwrap().broadcast_code, code("a"));
        assert_eq!(manager.find_handle(&code("a")), Some(3));
        assert!(manager.is_mid40(3));
        assert!(!manager.is_mid40(4));
    }

    #[test]
    fn test_add_device_out_of_range_ignored() {
        let manager = DeviceManager::new();
        manager.add_device(lidar("a", 40));
        assert_eq!(manager.device_mode(), TopologyMode::None);
        assert!(manager.connected_devices().is_empty());

        // A rejected hub leaves the mode free for the next valid device
        let mut stray_hub = hub("hub");
        stray_hub.handle = 200;
        manager.add_device(stray_hub);
        assert_eq!(manager.device_mode(), TopologyMode::None);

        manager.add_device(lidar("b", 1));
        assert_eq!(manager.device_mode(), TopologyMode::Lidar);
        assert_eq!(manager.connected_devices().len(), 1);
    }

    #[test]
    fn test_remove_device_lidar_mode() {
        let manager = DeviceManager::new();
        manager.add_device(lidar("a", 0));
        manager.add_device(lidar("b", 1));

        manager.remove_device(0);
        assert!(!manager.is_device_connected(0));
        assert!(manager.is_device_connected(1));

        // Broadcast code survives disconnection
        assert_eq!(manager.find_handle(&code("a")), Some(0));
        assert_eq!(
            manager.add_listening_device(code("a"), TopologyMode::Lidar),
            Ok(0)
        );
    }

    #[test]
    fn test_remove_device_hub_cascade() {
        let manager = DeviceManager::new();
        manager.add_device(hub("hub"));
        manager.add_device(lidar("a", 0));
        manager.add_device(lidar("b", 4));

        manager.remove_device(HUB_HANDLE);
        assert!(!manager.is_device_connected(HUB_HANDLE));
        assert!(!manager.is_device_connected(0));
        assert!(!manager.is_device_connected(4));
        assert!(manager.connected_devices().is_empty());
    }

    #[test]
    fn test_update_devices_lidar_mode_notifies() {
        let manager = Arc::new(DeviceManager::new());
        let events = recorder(&manager);
        let info = lidar("a", 0);
        manager.add_device(info.clone());

        manager.update_devices(&info, DeviceEvent::Connect);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, DeviceEvent::Connect);
    }

    #[test]
    fn test_update_devices_none_mode_silent() {
        let manager = Arc::new(DeviceManager::new());
        let events = recorder(&manager);
        manager.update_devices(&lidar("a", 0), DeviceEvent::Connect);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_device_found_connect_carries_listening_handle() {
        let manager = Arc::new(DeviceManager::new());
        let events = recorder(&manager);
        manager
            .add_listening_device(code("other"), TopologyMode::Lidar)
            .unwrap();
        let handle = manager
            .add_listening_device(code("X"), TopologyMode::Lidar)
            .unwrap();

        manager.device_found(lidar("X", handle));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0.handle, handle);
        assert_eq!(events[0].1, DeviceEvent::Connect);
        assert!(manager.is_device_connected(handle));
    }

    #[test]
    fn test_device_remove_notifies_disconnect() {
        let manager = Arc::new(DeviceManager::new());
        let events = recorder(&manager);
        manager.device_found(lidar("a", 0));
        manager.device_remove(0, DeviceEvent::Disconnect);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].1, DeviceEvent::Disconnect);
        assert!(!manager.is_device_connected(0));
    }

    #[test]
    fn test_device_remove_unknown_handle_is_silent() {
        let manager = Arc::new(DeviceManager::new());
        let events = recorder(&manager);
        manager.device_found(lidar("a", 0));
        manager.device_remove(9, DeviceEvent::Disconnect);
        assert_eq!(events.lock().unwrap().len(), 1);
        assert!(manager.is_device_connected(0));
    }

    #[test]
    fn test_hub_found_queries_members() {
        let manager = Arc::new(DeviceManager::new());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        manager.set_command_dispatcher(dispatcher.clone());
        let events = recorder(&manager);

        manager
            .add_listening_device(code("hub"), TopologyMode::Hub)
            .unwrap();
        manager.device_found(hub("hub"));

        // No notification until the hub answers
        assert!(events.lock().unwrap().is_empty());

        let mut sent = dispatcher.take();
        assert_eq!(sent.len(), 1);
        let query = sent.remove(0);
        assert_eq!(query.handle, HUB_HANDLE);
        assert_eq!(query.command_set, CommandSet::Hub);
        assert_eq!(query.command_id, HubCommand::QueryLidarInformation as u8);

        let response = HubQueryLidarInformationResponse {
            ret_code: 0,
            lidars: vec![member("m11", 1, 1), member("m13", 1, 3), member("m21", 2, 1)],
        };
        (query.callback)(CommandStatus::Success, &response.encode());

        for (handle, name) in [(0u8, "m11"), (2, "m13"), (3, "m21")] {
            assert!(manager.is_device_connected(handle));
            let info = manager.find_device(handle).unwrap();
            assert_eq!(info.broadcast_code, code(name));
            assert_eq!(info.handle, handle);
            assert_eq!(info.ip, Ipv4Addr::new(192, 168, 1, 2));
        }
        assert!(!manager.is_device_connected(1));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0.handle, HUB_HANDLE);
        assert_eq!(events[0].1, DeviceEvent::HubConnectionChange);
    }

    #[test]
    fn test_hub_membership_replaced() {
        let manager = Arc::new(DeviceManager::new());
        manager.add_device(hub("hub"));

        let first = HubQueryLidarInformationResponse {
            ret_code: 0,
            lidars: vec![member("m11", 1, 1), member("m12", 1, 2)],
        };
        manager.on_hub_lidar_information(CommandStatus::Success, Some(&first));
        assert!(manager.is_device_connected(0));
        assert!(manager.is_device_connected(1));

        let second = HubQueryLidarInformationResponse {
            ret_code: 0,
            lidars: vec![member("m12", 1, 2)],
        };
        manager.on_hub_lidar_information(CommandStatus::Success, Some(&second));
        assert!(!manager.is_device_connected(0));
        assert!(manager.is_device_connected(1));
        assert!(manager.is_device_connected(HUB_HANDLE));
    }

    #[test]
    fn test_hub_query_failure_keeps_table() {
        let manager = Arc::new(DeviceManager::new());
        let events = recorder(&manager);
        manager.add_device(hub("hub"));
        manager.add_device(lidar("m11", 0));

        manager.on_hub_lidar_information(CommandStatus::Timeout, None);
        let rejected = HubQueryLidarInformationResponse {
            ret_code: 1,
            lidars: Vec::new(),
        };
        manager.on_hub_lidar_information(CommandStatus::Success, Some(&rejected));

        assert!(manager.is_device_connected(0));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_hub_member_outside_range_skipped() {
        let manager = Arc::new(DeviceManager::new());
        manager.add_device(hub("hub"));
        let response = HubQueryLidarInformationResponse {
            ret_code: 0,
            lidars: vec![member("zero", 0, 1), member("far", 11, 2), member("ok", 3, 3)],
        };
        manager.on_hub_lidar_information(CommandStatus::Success, Some(&response));

        // (11 - 1) * 3 + 1 = 31 is the hub's own handle
        assert_eq!(manager.find_device(HUB_HANDLE).unwrap().broadcast_code, code("hub"));
        assert!(manager.is_device_connected(8));
        assert_eq!(manager.connected_devices().len(), 2);
    }

    #[test]
    fn test_heartbeat_dedup() {
        let manager = Arc::new(DeviceManager::new());
        let events = recorder(&manager);
        manager.add_device(lidar("a", 0));

        let beat = heartbeat(LidarState::Normal, 0);
        manager.update_device_state(0, &beat);
        manager.update_device_state(0, &beat);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, DeviceEvent::StateChange);
        assert_eq!(events[0].0.state, LidarState::Normal);
    }

    #[test]
    fn test_heartbeat_progress_and_code() {
        let manager = Arc::new(DeviceManager::new());
        let events = recorder(&manager);
        manager.add_device(lidar("a", 0));

        manager.update_device_state(0, &heartbeat(LidarState::Init, 10));
        manager.update_device_state(0, &heartbeat(LidarState::Init, 10));
        manager.update_device_state(0, &heartbeat(LidarState::Init, 55));
        manager.update_device_state(0, &heartbeat(LidarState::Normal, 55));
        manager.update_device_state(0, &heartbeat(LidarState::Normal, 1 << 30));

        assert_eq!(events.lock().unwrap().len(), 4);
        let info = manager.find_device(0).unwrap();
        assert_eq!(info.status, DeviceStatus::Code(ErrorCode(1 << 30)));
    }

    #[test]
    fn test_heartbeat_feature_change() {
        let manager = Arc::new(DeviceManager::new());
        let events = recorder(&manager);
        manager.add_device(lidar("a", 0));

        let mut beat = heartbeat(LidarState::Normal, 0);
        manager.update_device_state(0, &beat);
        beat.feature = LidarFeature::RainFog;
        manager.update_device_state(0, &beat);

        assert_eq!(events.lock().unwrap().len(), 2);
        assert_eq!(manager.find_device(0).unwrap().feature, LidarFeature::RainFog);
    }

    #[test]
    fn test_heartbeat_disconnected_updates_silently() {
        let manager = Arc::new(DeviceManager::new());
        let events = recorder(&manager);
        manager.add_device(lidar("a", 0));
        manager.remove_device(0);

        manager.update_device_state(0, &heartbeat(LidarState::Standby, 0));
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(manager.find_device(0).unwrap().state, LidarState::Standby);
    }

    #[test]
    fn test_heartbeat_out_of_range() {
        let manager = DeviceManager::new();
        manager.update_device_state(200, &heartbeat(LidarState::Normal, 0));
        manager.update_device_state(5, &heartbeat(LidarState::Normal, 0));
        assert!(manager.find_device(5).is_none());
    }

    #[test]
    fn test_find_device_by_code() {
        let manager = DeviceManager::new();
        manager
            .add_listening_device(code("listening"), TopologyMode::Lidar)
            .unwrap();
        manager.add_device(lidar("a", 1));

        assert!(manager.find_device_by_code(&code("listening")).is_none());
        assert_eq!(manager.find_device_by_code(&code("a")).unwrap().handle, 1);
        assert!(manager.find_device(0).is_none());
    }

    #[test]
    fn test_broadcast_callback() {
        let manager = DeviceManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.set_device_broadcast_callback(move |info| {
            sink.lock().unwrap().push(info.broadcast_code);
        });

        manager.broadcast_observed(&BroadcastInfo {
            broadcast_code: code("anyone"),
            device_type: DeviceType::Tele,
            ip: Ipv4Addr::new(10, 0, 0, 9),
        });
        assert_eq!(*seen.lock().unwrap(), vec![code("anyone")]);
    }

    #[tokio::test]
    async fn test_event_channel() {
        let manager = Arc::new(DeviceManager::new());
        let mut events = manager.event_channel();

        manager.broadcast_observed(&BroadcastInfo {
            broadcast_code: code("a"),
            device_type: DeviceType::Mid40,
            ip: Ipv4Addr::LOCALHOST,
        });
        manager.device_found(lidar("a", 0));

        assert!(matches!(events.recv().await, Some(ManagerEvent::Broadcast(_))));
        match events.recv().await {
            Some(ManagerEvent::Device { info, event }) => {
                assert_eq!(info.handle, 0);
                assert_eq!(event, DeviceEvent::Connect);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_reset() {
        let manager = Arc::new(DeviceManager::new());
        let events = recorder(&manager);
        manager.add_device(hub("hub"));
        manager.reset();

        assert_eq!(manager.device_mode(), TopologyMode::None);
        assert!(manager.find_device(HUB_HANDLE).is_none());

        manager.add_device(lidar("a", 0));
        manager.update_device_state(0, &heartbeat(LidarState::Normal, 0));
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(manager.device_mode(), TopologyMode::Lidar);
    }

    proptest::proptest! {
        #[test]
        fn prop_handles_unique_and_stable(count in 1usize..=MAX_DEVICES) {
            let manager = DeviceManager::new();
            let codes: Vec<_> = (0..count).map(|i| code(&format!("dev{i}"))).collect();
            let handles: Vec<u8> = codes
                .iter()
                .map(|c| manager.add_listening_device(*c, TopologyMode::Lidar).unwrap())
                .collect();

            let mut sorted = handles.clone();
            sorted.sort_unstable();
            sorted.dedup();
            proptest::prop_assert_eq!(sorted.len(), count);

            for (c, h) in codes.iter().zip(&handles) {
                proptest::prop_assert_eq!(
                    manager.add_listening_device(*c, TopologyMode::Lidar).unwrap(),
                    *h
                );
            }
        }
    }
}
