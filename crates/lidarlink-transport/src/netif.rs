//! Local interface lookup.
//!
//! Devices are told which host address to send to during the handshake, so
//! the host must pick the local IPv4 address that shares a subnet with the
//! device. Hosts with several interfaces routinely have no match for a given
//! device; that is an expected outcome, reported as `None`.

use std::net::Ipv4Addr;

/// One IPv4 address assigned to a local interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    /// Interface name
    pub name: String,
    /// Assigned address
    pub addr: Ipv4Addr,
    /// Subnet mask
    pub netmask: Ipv4Addr,
}

impl InterfaceAddr {
    /// True if `peer` is inside this interface's subnet
    pub fn contains(&self, peer: Ipv4Addr) -> bool {
        same_subnet(self.addr, peer, self.netmask)
    }
}

/// True if `a` and `b` fall in the same subnet under `netmask`
pub fn same_subnet(a: Ipv4Addr, b: Ipv4Addr, netmask: Ipv4Addr) -> bool {
    let mask = u32::from(netmask);
    u32::from(a) & mask == u32::from(b) & mask
}

/// Pick the first address in `interfaces` whose subnet contains `peer`
pub fn select_local_ip(interfaces: &[InterfaceAddr], peer: Ipv4Addr) -> Option<Ipv4Addr> {
    interfaces
        .iter()
        .find(|iface| iface.contains(peer))
        .map(|iface| iface.addr)
}

/// Local IPv4 address on the same subnet as `peer`, if any
pub fn find_local_ip(peer: Ipv4Addr) -> Option<Ipv4Addr> {
    select_local_ip(&ipv4_interfaces(), peer)
}

/// Every IPv4 address assigned to a local interface
#[cfg(unix)]
pub fn ipv4_interfaces() -> Vec<InterfaceAddr> {
    use std::ffi::CStr;

    let mut interfaces = Vec::new();

    // SAFETY: getifaddrs hands back a linked list we only read and then free
    // with freeifaddrs; every pointer is null-checked before dereferencing.
    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(std::ptr::addr_of_mut!(ifaddrs)) != 0 {
            tracing::warn!(error = %std::io::Error::last_os_error(), "getifaddrs failed");
            return interfaces;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            current = ifa.ifa_next;

            if ifa.ifa_name.is_null() || ifa.ifa_addr.is_null() || ifa.ifa_netmask.is_null() {
                continue;
            }
            if i32::from((*ifa.ifa_addr).sa_family) != libc::AF_INET {
                continue;
            }

            #[allow(clippy::cast_ptr_alignment)]
            let addr = ifa.ifa_addr.cast::<libc::sockaddr_in>();
            #[allow(clippy::cast_ptr_alignment)]
            let mask = ifa.ifa_netmask.cast::<libc::sockaddr_in>();

            interfaces.push(InterfaceAddr {
                name: CStr::from_ptr(ifa.ifa_name).to_string_lossy().into_owned(),
                addr: Ipv4Addr::from(u32::from_be((*addr).sin_addr.s_addr)),
                netmask: Ipv4Addr::from(u32::from_be((*mask).sin_addr.s_addr)),
            });
        }

        libc::freeifaddrs(ifaddrs);
    }

    interfaces
}

/// Every IPv4 address assigned to a local interface
#[cfg(not(unix))]
pub fn ipv4_interfaces() -> Vec<InterfaceAddr> {
    Vec::new()
}
