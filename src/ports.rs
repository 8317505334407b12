//! Host port allocation for sandbox services.
//!
//! Each sandbox publishes four services on the host, one port per service,
//! drawn from a fixed range. A port is eligible when it is not bound by any
//! host socket, not published by any engine container, and not already in
//! the ledger of ports this process has handed out.
//!
//! The occupied-port snapshot is gathered before the ledger lock is taken;
//! the lock covers only the linear scan and the ledger insertions, so two
//! concurrent reservations can never receive the same port.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{FleetError, Result};

/// Logical service exposed by a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortService {
    /// VNC / remote display.
    Display,
    /// Control API inside the VM.
    Control,
    /// Browser remote-debugging endpoint.
    BrowserDebug,
    /// Media streaming.
    Media,
}

impl PortService {
    pub const ALL: [PortService; 4] = [
        PortService::Display,
        PortService::Control,
        PortService::BrowserDebug,
        PortService::Media,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Display => "display",
            Self::Control => "control",
            Self::BrowserDebug => "browser_debug",
            Self::Media => "media",
        }
    }

    /// Port the service listens on inside the container.
    pub fn container_port(&self) -> u16 {
        match self {
            Self::Display => 8006,
            Self::Control => 5000,
            Self::BrowserDebug => 9222,
            Self::Media => 8080,
        }
    }
}

impl std::fmt::Display for PortService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open range of host ports, `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end
    }

    /// Parse `"start-end"`.
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("expected 'start-end', got '{}'", s))?;
        let start = start
            .trim()
            .parse::<u16>()
            .map_err(|e| format!("invalid range start '{}': {}", start, e))?;
        let end = end
            .trim()
            .parse::<u16>()
            .map_err(|e| format!("invalid range end '{}': {}", end, e))?;
        let range = Self::new(start, end);
        if range.is_empty() {
            return Err(format!("range {}..{} is empty", start, end));
        }
        Ok(range)
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Configured range for every service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePortRanges {
    pub display: PortRange,
    pub control: PortRange,
    pub browser_debug: PortRange,
    pub media: PortRange,
}

impl ServicePortRanges {
    pub fn get(&self, service: PortService) -> PortRange {
        match service {
            PortService::Display => self.display,
            PortService::Control => self.control,
            PortService::BrowserDebug => self.browser_debug,
            PortService::Media => self.media,
        }
    }

    pub fn set(&mut self, service: PortService, range: PortRange) {
        match service {
            PortService::Display => self.display = range,
            PortService::Control => self.control = range,
            PortService::BrowserDebug => self.browser_debug = range,
            PortService::Media => self.media = range,
        }
    }
}

impl Default for ServicePortRanges {
    fn default() -> Self {
        Self {
            display: PortRange::new(8006, 9006),
            control: PortRange::new(5000, 6000),
            browser_debug: PortRange::new(9222, 10222),
            media: PortRange::new(11000, 12000),
        }
    }
}

/// The four host ports assigned to one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSet {
    pub display: u16,
    pub control: u16,
    pub browser_debug: u16,
    pub media: u16,
}

impl PortSet {
    pub fn get(&self, service: PortService) -> u16 {
        match service {
            PortService::Display => self.display,
            PortService::Control => self.control,
            PortService::BrowserDebug => self.browser_debug,
            PortService::Media => self.media,
        }
    }

    pub fn ports(&self) -> [u16; 4] {
        [self.display, self.control, self.browser_debug, self.media]
    }

    /// `(service, host port)` pairs in service order.
    pub fn iter(&self) -> impl Iterator<Item = (PortService, u16)> + '_ {
        PortService::ALL.into_iter().map(|s| (s, self.get(s)))
    }
}

/// A view of ports that are in use outside the ledger.
#[async_trait]
pub trait PortSource: Send + Sync {
    fn name(&self) -> &str;

    async fn occupied(&self) -> Result<HashSet<u16>>;
}

/// Ports bound by host sockets, read from `/proc/net`.
///
/// On platforms without procfs the scan yields nothing and only the engine
/// and the ledger are consulted.
#[derive(Debug, Default, Clone)]
pub struct HostSocketScan;

const PROC_NET_FILES: [&str; 4] = [
    "/proc/net/tcp",
    "/proc/net/tcp6",
    "/proc/net/udp",
    "/proc/net/udp6",
];

#[async_trait]
impl PortSource for HostSocketScan {
    fn name(&self) -> &str {
        "host_sockets"
    }

    async fn occupied(&self) -> Result<HashSet<u16>> {
        let mut ports = HashSet::new();
        for path in PROC_NET_FILES {
            match tokio::fs::read_to_string(path).await {
                Ok(contents) => ports.extend(parse_proc_net(&contents)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::trace!(path, "Socket table not present");
                }
                Err(e) => {
                    return Err(FleetError::PortScan {
                        reason: format!("failed to read {}: {}", path, e),
                    });
                }
            }
        }
        Ok(ports)
    }
}

/// Extract local ports from a `/proc/net/{tcp,udp}[6]` table.
///
/// Rows look like `0: 0100007F:1F90 00000000:0000 0A ...`; the local port is
/// the hex field after the colon of the second column.
pub fn parse_proc_net(contents: &str) -> HashSet<u16> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|local| local.rsplit_once(':'))
        .filter_map(|(_, port)| u16::from_str_radix(port, 16).ok())
        .filter(|port| *port != 0)
        .collect()
}

/// Process-wide ledger of reserved host ports.
pub struct PortAllocator {
    ledger: Mutex<BTreeSet<u16>>,
    sources: Vec<Arc<dyn PortSource>>,
}

impl PortAllocator {
    pub fn new(sources: Vec<Arc<dyn PortSource>>) -> Self {
        Self {
            ledger: Mutex::new(BTreeSet::new()),
            sources,
        }
    }

    /// Snapshot of ports in use outside the ledger. Runs without the lock.
    async fn occupied(&self) -> Result<HashSet<u16>> {
        let scans =
            futures::future::join_all(self.sources.iter().map(|source| source.occupied())).await;

        let mut occupied = HashSet::new();
        for (source, scan) in self.sources.iter().zip(scans) {
            let ports = scan?;
            tracing::trace!(source = source.name(), count = ports.len(), "Port scan");
            occupied.extend(ports);
        }
        Ok(occupied)
    }

    /// Reserve the lowest eligible port in `range`.
    pub async fn reserve(&self, service: PortService, range: PortRange) -> Result<u16> {
        let occupied = self.occupied().await?;
        let mut ledger = self.ledger.lock().await;
        let port = lowest_free(range, &occupied, &ledger).ok_or(FleetError::PortExhaustion {
            service,
            start: range.start,
            end: range.end,
        })?;
        ledger.insert(port);
        Ok(port)
    }

    /// Reserve one port per service as a single unit.
    ///
    /// If any range is exhausted, ports already taken by this call are
    /// returned to the ledger before the error is reported.
    pub async fn reserve_set(&self, ranges: &ServicePortRanges) -> Result<PortSet> {
        let occupied = self.occupied().await?;
        let mut ledger = self.ledger.lock().await;

        let mut taken: Vec<u16> = Vec::with_capacity(PortService::ALL.len());
        for service in PortService::ALL {
            let range = ranges.get(service);
            match lowest_free(range, &occupied, &ledger) {
                Some(port) => {
                    ledger.insert(port);
                    taken.push(port);
                }
                None => {
                    for port in &taken {
                        ledger.remove(port);
                    }
                    return Err(FleetError::PortExhaustion {
                        service,
                        start: range.start,
                        end: range.end,
                    });
                }
            }
        }

        Ok(PortSet {
            display: taken[0],
            control: taken[1],
            browser_debug: taken[2],
            media: taken[3],
        })
    }

    /// Return a port to the pool. Unknown ports are ignored.
    pub async fn release(&self, port: u16) {
        self.ledger.lock().await.remove(&port);
    }

    pub async fn release_set(&self, ports: &PortSet) {
        let mut ledger = self.ledger.lock().await;
        for port in ports.ports() {
            ledger.remove(&port);
        }
    }

    /// Currently reserved ports, ascending.
    pub async fn reserved(&self) -> Vec<u16> {
        self.ledger.lock().await.iter().copied().collect()
    }

    /// Drop every reservation.
    pub async fn clear(&self) -> usize {
        let mut ledger = self.ledger.lock().await;
        let count = ledger.len();
        ledger.clear();
        count
    }
}

fn lowest_free(range: PortRange, occupied: &HashSet<u16>, ledger: &BTreeSet<u16>) -> Option<u16> {
    (range.start..range.end).find(|port| !occupied.contains(port) && !ledger.contains(port))
}
