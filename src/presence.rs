//! Presence-based suspension.
//!
//! Capture is suspended while any trusted device (by MAC address) shows up in
//! a scan of the local network. The last scan result is cached for read-only
//! consumers; it plays no part in the gating decision beyond this evaluation.

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{OnceLock, RwLock};

use crate::log::Logger;

fn mac_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("MAC pattern is valid")
    })
}

/// MAC address in canonical upper-case `XX:XX:XX:XX:XX:XX` form.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if !mac_pattern().is_match(trimmed) {
            return Err(anyhow!("invalid MAC address '{}'", value));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MacAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MacAddress {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<MacAddress> for String {
    fn from(value: MacAddress) -> Self {
        value.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trusted devices, each with an optional human label.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedDeviceSet {
    devices: BTreeMap<MacAddress, Option<String>>,
}

impl TrustedDeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{ "AA:BB:CC:DD:EE:FF": "label" }` style pairs.
    pub fn from_labels<I, K, V>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut set = Self::new();
        for (mac, label) in entries {
            let label: String = label.into();
            set.insert(
                MacAddress::parse(mac.as_ref())?,
                (!label.trim().is_empty()).then_some(label),
            );
        }
        Ok(set)
    }

    pub fn insert(&mut self, mac: MacAddress, label: Option<String>) {
        self.devices.insert(mac, label);
    }

    pub fn remove(&mut self, mac: &MacAddress) -> bool {
        self.devices.remove(mac).is_some()
    }

    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.devices.contains_key(mac)
    }

    pub fn label(&self, mac: &MacAddress) -> Option<&str> {
        self.devices.get(mac).and_then(|label| label.as_deref())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MacAddress, Option<&str>)> {
        self.devices
            .iter()
            .map(|(mac, label)| (mac, label.as_deref()))
    }
}

/// One host discovered by a network scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub ipv4: Ipv4Addr,
    pub mac: Option<MacAddress>,
    pub hostname: Option<String>,
}

/// Local subnet scan capability.
pub trait NetworkScanner: Send + Sync {
    fn scan(&self, local: Ipv4Addr) -> Result<Vec<ScanResult>>;
}

/// Local IPv4 discovery capability.
pub trait LocalAddress: Send + Sync {
    fn find_local_ipv4(&self) -> Ipv4Addr;
}

/// True iff the trusted set is non-empty and any scanned MAC belongs to it.
pub fn is_suspended(trusted: &TrustedDeviceSet, scan: &[ScanResult]) -> bool {
    if trusted.is_empty() {
        return false;
    }
    scan.iter()
        .filter_map(|host| host.mac.as_ref())
        .any(|mac| trusted.contains(mac))
}

/// Runs scans and keeps the last successful result for read-only consumers.
pub struct PresenceEvaluator {
    scanner: Box<dyn NetworkScanner>,
    locator: Box<dyn LocalAddress>,
    last_scan: RwLock<Option<Vec<ScanResult>>>,
    log: Logger,
}

impl PresenceEvaluator {
    pub fn new(
        scanner: Box<dyn NetworkScanner>,
        locator: Box<dyn LocalAddress>,
        log: Logger,
    ) -> Self {
        Self {
            scanner,
            locator,
            last_scan: RwLock::new(None),
            log,
        }
    }

    /// Scan and decide. A failed scan yields an error and leaves the cached
    /// result untouched; the caller keeps its previous suspension state.
    /// With no trusted devices a failed scan is simply "not suspended".
    pub fn evaluate(&self, trusted: &TrustedDeviceSet) -> Result<bool> {
        let local = self.locator.find_local_ipv4();
        log::debug!(
            target: self.log.target(),
            "scanning network of {} for {} trusted device(s)",
            local,
            trusted.len()
        );
        let results = match self.scanner.scan(local) {
            Ok(results) => results,
            Err(e) if trusted.is_empty() => {
                log::debug!(target: self.log.target(), "scan failed, no trusted devices: {:#}", e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let suspended = is_suspended(trusted, &results);
        if suspended {
            for host in &results {
                if let Some(mac) = host.mac.as_ref().filter(|mac| trusted.contains(mac)) {
                    log::debug!(
                        target: self.log.target(),
                        "trusted device {} ({}) present at {}",
                        mac,
                        trusted.label(mac).unwrap_or("unlabelled"),
                        host.ipv4
                    );
                }
            }
        }
        match self.last_scan.write() {
            Ok(mut guard) => *guard = Some(results),
            Err(poisoned) => *poisoned.into_inner() = Some(results),
        }
        Ok(suspended)
    }

    /// Last successful scan, if any.
    pub fn scan_results(&self) -> Option<Vec<ScanResult>> {
        match self.last_scan.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
