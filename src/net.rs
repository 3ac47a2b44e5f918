//! Local network discovery.
//!
//! - `UdpLocalAddress`: finds the first non-loopback IPv4 of this host by
//!   asking the routing table which source address reaches a public address.
//!   No packet is sent.
//! - `ArpScanner`: probes every address of the local /24 so the kernel
//!   resolves their link-layer addresses, then lists neighbours from the
//!   kernel ARP table. Hostnames come from the hosts file; the scanning host
//!   itself is always part of the result.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::log::Logger;
use crate::presence::{LocalAddress, MacAddress, NetworkScanner, ScanResult};

const ARP_TABLE_PATH: &str = "/proc/net/arp";
const HOSTS_PATH: &str = "/etc/hosts";
const SYSFS_NET_PATH: &str = "/sys/class/net";
const ROUTE_PROBE_ADDR: &str = "192.0.2.1:9";
const ATF_COMPLETE: u32 = 0x2;
/// UDP discard port; only the neighbour resolution triggered by the send matters.
const PROBE_PORT: u16 = 9;
const DEFAULT_SETTLE: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, Default)]
pub struct UdpLocalAddress;

impl UdpLocalAddress {
    fn probe() -> Result<Ipv4Addr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(ROUTE_PROBE_ADDR)?;
        match socket.local_addr()?.ip() {
            std::net::IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Ok(ip),
            other => Err(anyhow!("no routable IPv4 address (got {})", other)),
        }
    }
}

impl LocalAddress for UdpLocalAddress {
    /// Falls back to 127.0.0.1 when the host has no routable address.
    fn find_local_ipv4(&self) -> Ipv4Addr {
        Self::probe().unwrap_or(Ipv4Addr::LOCALHOST)
    }
}

/// Convenience wrapper around [`UdpLocalAddress`].
pub fn find_local_ipv4() -> Ipv4Addr {
    UdpLocalAddress.find_local_ipv4()
}

/// Wakes hosts so the kernel learns their MAC addresses.
pub trait NeighbourProbe: Send + Sync {
    /// Returns how many hosts were probed successfully.
    fn probe(&self, hosts: &[Ipv4Addr]) -> Result<usize>;
}

/// Sends one empty datagram to the discard port of each host.
#[derive(Clone, Debug, Default)]
pub struct UdpProbe;

impl NeighbourProbe for UdpProbe {
    fn probe(&self, hosts: &[Ipv4Addr]) -> Result<usize> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_nonblocking(true)?;
        Ok(hosts
            .iter()
            .filter(|host| socket.send_to(&[], (**host, PROBE_PORT)).is_ok())
            .count())
    }
}

/// Every host address of the /24 containing `ip` (.1 through .254).
pub fn subnet_hosts(ip: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = ip.octets();
    (1..=254).map(|d| Ipv4Addr::new(a, b, c, d)).collect()
}

/// Neighbour scanner backed by the kernel ARP table.
pub struct ArpScanner {
    table_path: PathBuf,
    hosts_path: PathBuf,
    sysfs_net: PathBuf,
    probe: Box<dyn NeighbourProbe>,
    settle: Duration,
    log: Logger,
}

impl ArpScanner {
    pub fn new(log: Logger) -> Self {
        Self {
            table_path: PathBuf::from(ARP_TABLE_PATH),
            hosts_path: PathBuf::from(HOSTS_PATH),
            sysfs_net: PathBuf::from(SYSFS_NET_PATH),
            probe: Box::new(UdpProbe),
            settle: DEFAULT_SETTLE,
            log,
        }
    }

    pub fn with_table_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.table_path = path.into();
        self
    }

    pub fn with_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.hosts_path = path.into();
        self
    }

    /// Directory holding one `<interface>/address` file per interface.
    pub fn with_sysfs_net(mut self, path: impl Into<PathBuf>) -> Self {
        self.sysfs_net = path.into();
        self
    }

    pub fn with_probe(mut self, probe: impl NeighbourProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Time given to neighbour resolution between probing and reading the table.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn local_host(&self, raw: &str, local: Ipv4Addr, names: &BTreeMap<Ipv4Addr, String>) -> ScanResult {
        let mac = subnet_device(raw, local)
            .and_then(|device| interface_mac(&self.sysfs_net, &device));
        let hostname = hostname::get()
            .ok()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .or_else(|| names.get(&local).cloned());
        ScanResult {
            ipv4: local,
            mac,
            hostname,
        }
    }
}

impl NetworkScanner for ArpScanner {
    fn scan(&self, local: Ipv4Addr) -> Result<Vec<ScanResult>> {
        let targets = subnet_hosts(local);
        match self.probe.probe(&targets) {
            Ok(sent) => log::debug!(
                target: self.log.target(),
                "probed {} of {} address(es) on {}/24",
                sent,
                targets.len(),
                subnet_prefix(local)
            ),
            Err(e) => log::warn!(
                target: self.log.target(),
                "neighbour probe failed, using cached table: {:#}",
                e
            ),
        }
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }

        let raw = std::fs::read_to_string(&self.table_path).map_err(|e| {
            anyhow!(
                "failed to read neighbour table {}: {}",
                self.table_path.display(),
                e
            )
        })?;
        let names = read_hosts_file(&self.hosts_path);

        let mut results = parse_arp_table(&raw, local);
        results.retain(|host| host.ipv4 != local);
        for host in &mut results {
            host.hostname = names.get(&host.ipv4).cloned();
        }
        results.push(self.local_host(&raw, local, &names));
        results.sort_by_key(|host| host.ipv4);

        log::debug!(
            target: self.log.target(),
            "neighbour table lists {} host(s) on {}/24",
            results.len(),
            subnet_prefix(local)
        );
        Ok(results)
    }
}

fn subnet_prefix(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 0)
}

/// Complete ARP entries on the /24 of `local`: (ipv4, mac, device).
fn arp_entries<'a>(
    raw: &'a str,
    local: Ipv4Addr,
) -> impl Iterator<Item = (Ipv4Addr, MacAddress, Option<&'a str>)> + 'a {
    let prefix = subnet_prefix(local);
    raw.lines().skip(1).filter_map(move |line| {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 4 {
            return None;
        }
        let ipv4: Ipv4Addr = columns[0].parse().ok()?;
        if subnet_prefix(ipv4) != prefix {
            return None;
        }
        let flags = u32::from_str_radix(columns[2].trim_start_matches("0x"), 16).ok()?;
        if flags & ATF_COMPLETE == 0 {
            return None;
        }
        let mac = MacAddress::parse(columns[3]).ok()?;
        Some((ipv4, mac, columns.get(5).copied()))
    })
}

/// Parse `/proc/net/arp` content, keeping complete entries in the /24 of
/// `local`, sorted by address.
pub fn parse_arp_table(raw: &str, local: Ipv4Addr) -> Vec<ScanResult> {
    let mut results: Vec<ScanResult> = arp_entries(raw, local)
        .map(|(ipv4, mac, _)| ScanResult {
            ipv4,
            mac: Some(mac),
            hostname: None,
        })
        .collect();
    results.sort_by_key(|host| host.ipv4);
    results.dedup_by_key(|host| host.ipv4);
    results
}

/// Interface the local /24 is reached through, as named by the ARP table.
fn subnet_device(raw: &str, local: Ipv4Addr) -> Option<String> {
    arp_entries(raw, local).find_map(|(_, _, device)| device.map(str::to_string))
}

fn interface_mac(sysfs_net: &Path, device: &str) -> Option<MacAddress> {
    let raw = std::fs::read_to_string(sysfs_net.join(device).join("address")).ok()?;
    MacAddress::parse(raw.trim())
        .ok()
        .filter(|mac| mac.as_str() != "00:00:00:00:00:00")
}

/// IPv4 to first listed name. A missing or unreadable file yields no names.
pub fn read_hosts_file(path: &Path) -> BTreeMap<Ipv4Addr, String> {
    std::fs::read_to_string(path)
        .map(|raw| parse_hosts(&raw))
        .unwrap_or_default()
}

fn parse_hosts(raw: &str) -> BTreeMap<Ipv4Addr, String> {
    let mut names = BTreeMap::new();
    for line in raw.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        let (Some(ip), Some(name)) = (fields.next(), fields.next()) else {
            continue;
        };
        if let Ok(ip) = ip.parse::<Ipv4Addr>() {
            names.entry(ip).or_insert_with(|| name.to_string());
        }
    }
    names
}
