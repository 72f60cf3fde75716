//! Host network facts: IPv4 subnets, local interfaces, ARP and reverse DNS.

use std::{
    collections::HashMap,
    ffi::CStr,
    fmt, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
};

use tracing::{debug, warn};

use super::DiscoveryError;

const ARP_TABLE: &str = "/proc/net/arp";
const INCOMPLETE_MAC: &str = "00:00:00:00:00:00";
/// NI_MAXHOST
const HOST_BUF_LEN: usize = 1025;

/// IPv4 network in CIDR form. The address is always the network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Net {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, DiscoveryError> {
        if prefix > 32 {
            return Err(DiscoveryError::InvalidCidr(format!("{addr}/{prefix}")));
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask(prefix));
        Ok(Self { network, prefix })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Usable host count: network and broadcast are excluded below /31.
    pub fn host_count(&self) -> u64 {
        match self.prefix {
            32 => 1,
            31 => 2,
            p => (1u64 << (32 - p)) - 2,
        }
    }

    /// Usable host addresses in ascending order.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u32::from(self.network) as u64;
        let (first, count) = match self.prefix {
            32 | 31 => (base, self.host_count()),
            _ => (base + 1, self.host_count()),
        };
        (first..first + count).map(|raw| Ipv4Addr::from(raw as u32))
    }

    /// At most `cap` hosts, warning when the subnet holds more.
    pub fn capped_hosts(&self, cap: usize) -> Vec<Ipv4Addr> {
        let total = self.host_count();
        if total > cap as u64 {
            warn!(
                subnet = %self,
                total,
                cap,
                "Subnet has {total} hosts, probing only the first {cap}"
            );
        }
        self.hosts().take(cap).collect()
    }
}

fn mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - p),
    }
}

impl FromStr for Ipv4Net {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DiscoveryError::InvalidCidr(s.to_string());
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix).map_err(|_| invalid())
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// IPv4 networks of the host's up, non-loopback interfaces.
///
/// Link-local (169.254/16) addresses are skipped.
pub fn interface_networks() -> io::Result<Vec<Ipv4Net>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs initialises `head` on success; it is released below.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut networks = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: `cursor` walks the list returned by getifaddrs.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_netmask.is_null() {
            continue;
        }
        let flags = entry.ifa_flags;
        if flags & libc::IFF_UP as u32 == 0 || flags & libc::IFF_LOOPBACK as u32 != 0 {
            continue;
        }
        // SAFETY: both pointers are non-null and sa_family says AF_INET.
        let (addr, netmask) = unsafe {
            if (*entry.ifa_addr).sa_family as i32 != libc::AF_INET {
                continue;
            }
            (
                ipv4_of(entry.ifa_addr as *const libc::sockaddr_in),
                ipv4_of(entry.ifa_netmask as *const libc::sockaddr_in),
            )
        };
        if addr.is_loopback() || addr.is_link_local() {
            continue;
        }

        let prefix = u32::from(netmask).count_ones() as u8;
        // SAFETY: getifaddrs fills `ifa_name` with a NUL-terminated string
        // that lives until freeifaddrs.
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }.to_string_lossy();
        match Ipv4Net::new(addr, prefix) {
            Ok(net) => {
                debug!(interface = %name, subnet = %net, "Found interface subnet");
                if !networks.contains(&net) {
                    networks.push(net);
                }
            }
            Err(e) => debug!(interface = %name, "Skipping interface: {e}"),
        }
    }

    // SAFETY: `head` came from getifaddrs and is freed exactly once.
    unsafe { libc::freeifaddrs(head) };
    Ok(networks)
}

/// # Safety
/// `sin` must point to a valid `sockaddr_in`.
unsafe fn ipv4_of(sin: *const libc::sockaddr_in) -> Ipv4Addr {
    Ipv4Addr::from(u32::from_be((*sin).sin_addr.s_addr))
}

/// Interface subnets no broader than `/min_prefix`.
pub fn auto_subnets(min_prefix: u8) -> io::Result<Vec<Ipv4Net>> {
    let mut subnets = interface_networks()?;
    subnets.retain(|net| {
        let keep = net.prefix() >= min_prefix;
        if !keep {
            debug!(subnet = %net, min_prefix, "Skipping subnet broader than minimum prefix");
        }
        keep
    });
    Ok(subnets)
}

/// Parses `/proc/net/arp` content into IP → lower-case MAC.
///
/// Incomplete entries (all-zero MAC) are left out.
pub fn parse_arp_table(content: &str) -> HashMap<IpAddr, String> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 || parts[3] == INCOMPLETE_MAC {
                return None;
            }
            let ip = parts[0].parse().ok()?;
            Some((ip, parts[3].to_ascii_lowercase()))
        })
        .collect()
}

/// MAC of `ip` from the kernel ARP cache, if known.
pub async fn lookup_mac(ip: IpAddr) -> Option<String> {
    match tokio::fs::read_to_string(ARP_TABLE).await {
        Ok(content) => parse_arp_table(&content).remove(&ip),
        Err(e) => {
            debug!("Cannot read {ARP_TABLE}: {e}");
            None
        }
    }
}

/// Reverse DNS name of `ip`. Numeric fallbacks are not accepted.
pub async fn reverse_dns(ip: IpAddr) -> Option<String> {
    match tokio::task::spawn_blocking(move || name_info(ip)).await {
        Ok(name) => name,
        Err(e) => {
            debug!(%ip, "Reverse lookup task failed: {e}");
            None
        }
    }
}

fn name_info(ip: IpAddr) -> Option<String> {
    let socket: sockaddr::SockAddr = SocketAddr::new(ip, 0).into();
    let mut host = [0 as libc::c_char; HOST_BUF_LEN];

    // SAFETY: `socket` holds a valid sockaddr of the stated length and `host`
    // is a writable buffer of the stated size.
    let rc = unsafe {
        libc::getnameinfo(
            socket.as_ptr(),
            socket.len(),
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if rc != 0 {
        return None;
    }

    // SAFETY: getnameinfo NUL-terminates `host` on success.
    let name = unsafe { CStr::from_ptr(host.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    (!name.is_empty()).then_some(name)
}

/// Owned `sockaddr_storage` built from a std address.
mod sockaddr {
    use std::{mem, net::SocketAddr};

    pub struct SockAddr {
        storage: libc::sockaddr_storage,
        len: libc::socklen_t,
    }

    impl SockAddr {
        pub fn as_ptr(&self) -> *const libc::sockaddr {
            &self.storage as *const _ as *const libc::sockaddr
        }

        pub fn len(&self) -> libc::socklen_t {
            self.len
        }
    }

    impl From<SocketAddr> for SockAddr {
        fn from(addr: SocketAddr) -> Self {
            // SAFETY: an all-zero sockaddr_storage is a valid value.
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let len = match addr {
                SocketAddr::V4(v4) => {
                    // SAFETY: sockaddr_in is plain old data; all-zero is valid.
                    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
                    sin.sin_family = libc::AF_INET as libc::sa_family_t;
                    sin.sin_port = v4.port().to_be();
                    sin.sin_addr = libc::in_addr {
                        s_addr: u32::from(*v4.ip()).to_be(),
                    };
                    // SAFETY: sockaddr_storage is large enough for sockaddr_in.
                    unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
                    mem::size_of::<libc::sockaddr_in>()
                }
                SocketAddr::V6(v6) => {
                    // SAFETY: sockaddr_in6 is plain old data; all-zero is valid.
                    let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                    sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    sin6.sin6_port = v6.port().to_be();
                    sin6.sin6_addr = libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    };
                    sin6.sin6_scope_id = v6.scope_id();
                    // SAFETY: sockaddr_storage is large enough for sockaddr_in6.
                    unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
                    mem::size_of::<libc::sockaddr_in6>()
                }
            };
            Self {
                storage,
                len: len as libc::socklen_t,
            }
        }
    }
}
