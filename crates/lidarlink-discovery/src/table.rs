//! Fixed-capacity device table keyed by handle.
//!
//! A slot is occupied once a broadcast code has been assigned to it and
//! stays occupied for the life of the table; disconnecting only clears the
//! connected flag. The full [`DeviceInfo`] record appears once the device
//! has actually been admitted.

use lidarlink_core::{BroadcastCode, DeviceInfo, MAX_DEVICES};

/// One handle's worth of state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSlot {
    /// Broadcast code owning this handle; `None` for a free slot
    pub code: Option<BroadcastCode>,
    /// Whether the device is currently connected
    pub connected: bool,
    /// Full record, present once the device has been admitted
    pub info: Option<DeviceInfo>,
}

impl DeviceSlot {
    /// True once a broadcast code owns the slot
    pub fn is_occupied(&self) -> bool {
        self.code.is_some()
    }
}

/// Device table indexed by handle (`0..MAX_DEVICES`)
#[derive(Debug, Clone)]
pub struct DeviceTable {
    slots: [DeviceSlot; MAX_DEVICES],
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| DeviceSlot::default()),
        }
    }

    /// Number of handles
    pub const fn capacity(&self) -> usize {
        MAX_DEVICES
    }

    /// Slot for `handle`, if in range
    pub fn get(&self, handle: u8) -> Option<&DeviceSlot> {
        self.slots.get(usize::from(handle))
    }

    /// Mutable slot for `handle`, if in range
    pub fn get_mut(&mut self, handle: u8) -> Option<&mut DeviceSlot> {
        self.slots.get_mut(usize::from(handle))
    }

    /// Handle owned by `code`, if any
    pub fn find_by_code(&self, code: &BroadcastCode) -> Option<u8> {
        self.slots
            .iter()
            .position(|slot| slot.code.as_ref() == Some(code))
            .map(|index| index as u8)
    }

    /// First unoccupied handle
    pub fn first_free(&self) -> Option<u8> {
        self.slots
            .iter()
            .position(|slot| !slot.is_occupied())
            .map(|index| index as u8)
    }

    /// Give `handle` to `code`. Out-of-range handles are ignored.
    ///
    /// Reassigning a slot to a different code drops the previous owner's
    /// record and connected flag.
    pub fn assign(&mut self, handle: u8, code: BroadcastCode) {
        if let Some(slot) = self.get_mut(handle) {
            if slot.code != Some(code) {
                *slot = DeviceSlot {
                    code: Some(code),
                    ..DeviceSlot::default()
                };
            }
        }
    }

    /// Number of occupied slots
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_occupied()).count()
    }

    /// Records of every connected, admitted device in handle order
    pub fn connected(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.slots
            .iter()
            .filter(|slot| slot.connected)
            .filter_map(|slot| slot.info.as_ref())
    }

    /// Clear the connected flag of every handle selected by `disconnect`
    pub fn disconnect_where(&mut self, mut disconnect: impl FnMut(u8) -> bool) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if disconnect(index as u8) {
                slot.connected = false;
            }
        }
    }

    /// Iterate `(handle, slot)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (u8, &DeviceSlot)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (index as u8, slot))
    }

    /// Drop every slot
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = DeviceSlot::default();
        }
    }
}
