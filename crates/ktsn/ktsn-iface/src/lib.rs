//! IPv4 interface discovery and MAC resolution.
//!
//! Grounded on `libktsn.c`'s `query_interfaces`/`query_and_add_mac_address`:
//! walk `getifaddrs()` for `AF_INET` entries, dedup by interface index, then
//! `ioctl(SIOCGIFHWADDR)` each one for its hardware address. The shim needs
//! this to resolve a destination address to an outgoing interface and its
//! MAC — it is not part of the deadline-scheduling core and carries no
//! invariants of its own (§1).

use std::ffi::CString;
use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
pub enum IfaceError {
    #[error("getifaddrs failed: {0}")]
    GetIfAddrs(std::io::Error),

    #[error("if_nametoindex({0}) failed")]
    NameToIndex(String),

    #[error("opening a control socket failed: {0}")]
    ControlSocket(std::io::Error),

    #[error("ioctl(SIOCGIFHWADDR) on {0} failed: {1}")]
    HwAddr(String, std::io::Error),
}

/// A discovered IPv4 interface (`kt_interface` in the source).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interface {
    pub ifindex: u32,
    pub name: String,
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mac: [u8; 6],
}

/// Two addresses are on the same interface's subnet when masking both with
/// that interface's netmask yields the same network address
/// (`is_same_subnetwork` in the source).
pub fn is_same_subnet(a: Ipv4Addr, b: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let mask = u32::from(mask);
    u32::from(a) & mask == u32::from(b) & mask
}

/// Finds the interface whose subnet contains `addr`
/// (`kt_interface_get_by_net` in the source).
pub fn find_by_net(interfaces: &[Interface], addr: Ipv4Addr) -> Option<&Interface> {
    interfaces.iter().find(|iface| is_same_subnet(iface.addr, addr, iface.netmask))
}

/// Enumerates the IPv4 interfaces available to resolve a destination
/// address and its egress MAC.
pub trait InterfaceSource {
    fn discover(&self) -> Result<Vec<Interface>, IfaceError>;
}

/// `getifaddrs` + `ioctl(SIOCGIFHWADDR)`-based discovery, Linux only.
pub struct LinuxInterfaceSource;

impl InterfaceSource for LinuxInterfaceSource {
    fn discover(&self) -> Result<Vec<Interface>, IfaceError> {
        let mut interfaces = enumerate_ipv4_interfaces()?;
        for iface in &mut interfaces {
            iface.mac = query_hwaddr(&iface.name)?;
        }
        Ok(interfaces)
    }
}

fn enumerate_ipv4_interfaces() -> Result<Vec<Interface>, IfaceError> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(IfaceError::GetIfAddrs(std::io::Error::last_os_error()));
    }

    let mut interfaces: Vec<Interface> = Vec::new();
    let mut current = head;
    while !current.is_null() {
        let ifa = unsafe { &*current };
        current = ifa.ifa_next;

        if ifa.ifa_addr.is_null() || ifa.ifa_netmask.is_null() || ifa.ifa_name.is_null() {
            continue;
        }
        let family = unsafe { (*ifa.ifa_addr).sa_family } as i32;
        if family != libc::AF_INET {
            continue;
        }

        let name = unsafe { std::ffi::CStr::from_ptr(ifa.ifa_name) }.to_string_lossy().into_owned();
        let cname = match CString::new(name.as_str()) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let ifindex = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if ifindex == 0 {
            unsafe { libc::freeifaddrs(head) };
            return Err(IfaceError::NameToIndex(name));
        }
        if interfaces.iter().any(|i: &Interface| i.ifindex == ifindex) {
            continue;
        }

        let addr = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
        let netmask = unsafe { &*(ifa.ifa_netmask as *const libc::sockaddr_in) };

        interfaces.push(Interface {
            ifindex,
            name,
            addr: Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
            netmask: Ipv4Addr::from(u32::from_be(netmask.sin_addr.s_addr)),
            mac: [0; 6],
        });
    }

    unsafe { libc::freeifaddrs(head) };
    Ok(interfaces)
}

/// Mirrors the Linux `struct ifreq` fields `SIOCGIFHWADDR` needs: an
/// interface name and the `sockaddr` the kernel fills with the hardware
/// address. The real struct is a larger union; this prefix is all the
/// ioctl touches.
#[repr(C)]
struct IfReqHwAddr {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_hwaddr: libc::sockaddr,
}

fn query_hwaddr(name: &str) -> Result<[u8; 6], IfaceError> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(IfaceError::ControlSocket(std::io::Error::last_os_error()));
    }

    let mut ifr = IfReqHwAddr {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_hwaddr: unsafe { std::mem::zeroed() },
    };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }

    let rc = unsafe { libc::ioctl(sock, libc::SIOCGIFHWADDR, &mut ifr as *mut IfReqHwAddr) };
    let result = if rc < 0 {
        Err(IfaceError::HwAddr(name.to_string(), std::io::Error::last_os_error()))
    } else {
        let data = ifr.ifr_hwaddr.sa_data;
        Ok([
            data[0] as u8,
            data[1] as u8,
            data[2] as u8,
            data[3] as u8,
            data[4] as u8,
            data[5] as u8,
        ])
    };
    unsafe { libc::close(sock) };
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(addr: [u8; 4], mask: [u8; 4]) -> Interface {
        Interface {
            ifindex: 1,
            name: "eth0".to_string(),
            addr: Ipv4Addr::from(addr),
            netmask: Ipv4Addr::from(mask),
            mac: [0; 6],
        }
    }

    #[test]
    fn same_subnet_matches_under_the_mask() {
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        assert!(is_same_subnet(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 200), mask));
        assert!(!is_same_subnet(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 1, 200), mask));
    }

    #[test]
    fn find_by_net_picks_the_matching_interface() {
        let interfaces = vec![
            iface([10, 0, 0, 1], [255, 255, 255, 0]),
            iface([192, 168, 1, 1], [255, 255, 255, 0]),
        ];
        let found = find_by_net(&interfaces, Ipv4Addr::new(192, 168, 1, 50)).unwrap();
        assert_eq!(found.addr, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn find_by_net_returns_none_when_nothing_matches() {
        let interfaces = vec![iface([10, 0, 0, 1], [255, 255, 255, 0])];
        assert!(find_by_net(&interfaces, Ipv4Addr::new(172, 16, 0, 1)).is_none());
    }
}
