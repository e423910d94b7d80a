//! one configured controller: its address, its scan lists keyed by period, its connection (when
//! up), and the diagnostic counters the worker maintains (spec.md §3).

use std::collections::BTreeMap;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::{unpack_u16, unpack_u32};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::tag::ScanList;

/// the controller's self-reported Identity object (class 0x01, instance 1), probed once after
/// `RegisterSession` (spec.md §4.5 step 4) via five `Get_Attribute_Single` requests — the exact
/// attribute set `ether_ip.c`'s `EIP_check_interface` queries (ether_ip.c:1850-1877): vendor(1),
/// device_type(2), revision(4), serial_number(6), product_name(7). `product_code`(3) and
/// `status`(5) are not part of that attribute list and are deliberately not fetched or stored.
#[derive(Debug, Clone)]
pub struct Identity {
    pub vendor: u16,
    pub device_type: u16,
    pub revision_major: u8,
    pub revision_minor: u8,
    pub serial: u32,
    pub product_name: String,
}

impl Identity {
    /// assemble an `Identity` from the five raw `Get_Attribute_Single` response bodies, in the
    /// order `Connection::probe_identity` fetches them
    pub fn from_attributes(
        vendor: &[u8],
        device_type: &[u8],
        revision: &[u8],
        serial: &[u8],
        product_name: &[u8],
    ) -> Result<Self> {
        let vendor = unpack_u16(vendor, 0)?;
        let device_type = unpack_u16(device_type, 0)?;
        let revision_major = *revision
            .first()
            .ok_or_else(|| Error::Protocol("revision attribute truncated".into()))?;
        let revision_minor = *revision
            .get(1)
            .ok_or_else(|| Error::Protocol("revision attribute truncated".into()))?;
        let serial = unpack_u32(serial, 0)?;
        let name_len = *product_name
            .first()
            .ok_or_else(|| Error::Protocol("product name attribute truncated".into()))?
            as usize;
        let name_bytes = product_name
            .get(1..1 + name_len)
            .ok_or_else(|| Error::Protocol("product name attribute truncated".into()))?;
        let product_name = String::from_utf8_lossy(name_bytes).into_owned();
        Ok(Identity {
            vendor,
            device_type,
            revision_major,
            revision_minor,
            serial,
            product_name,
        })
    }
}

/// mutable state the scan worker owns for the duration of one pass; this is the "PLC lock" of
/// spec.md §5, guarding the scan-list set, tag set (reachable through it), and the connection.
pub struct PlcState {
    pub scan_lists: BTreeMap<Duration, ScanList>,
    pub connection: Option<Connection>,
    pub identity: Option<Identity>,
    pub error_count: u64,
    pub slow_scan_count: u64,
}

impl PlcState {
    fn new() -> Self {
        Self {
            scan_lists: BTreeMap::new(),
            connection: None,
            identity: None,
            error_count: 0,
            slow_scan_count: 0,
        }
    }

    /// locate the scan list at exactly `period`, creating it if absent (spec.md §4.6)
    pub fn scan_list_mut(&mut self, period: Duration) -> &mut ScanList {
        self.scan_lists
            .entry(period)
            .or_insert_with(|| ScanList::new(period))
    }

    /// find which scan list (if any) currently owns a tag with this symbolic name
    pub fn find_tag_list(&self, symbolic: &str) -> Option<Duration> {
        self.scan_lists
            .iter()
            .find(|(_, list)| list.find_tag(symbolic).is_some())
            .map(|(key, _)| *key)
    }
}

/// one configured controller (spec.md §3); owned by the registry, never destroyed once created
pub struct Plc {
    pub name: String,
    pub address: Mutex<String>,
    pub slot: Mutex<u8>,
    pub state: Mutex<PlcState>,
    pub(crate) worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Plc {
    pub fn new(name: String, address: String, slot: u8) -> Self {
        Self {
            name,
            address: Mutex::new(address),
            slot: Mutex::new(slot),
            state: Mutex::new(PlcState::new()),
            worker_handle: Mutex::new(None),
        }
    }

    /// overwrite address/slot on a repeat `define_plc` (spec.md §4.6)
    pub fn redefine(&self, address: String, slot: u8) {
        *self.address.lock() = address;
        *self.slot.lock() = slot;
    }

    pub fn address(&self) -> String {
        self.address.lock().clone()
    }

    pub fn slot(&self) -> u8 {
        *self.slot.lock()
    }

    /// drop the connection, forcing the worker to reconnect on its next iteration, and
    /// invalidate every tag so consumers see staleness in the meantime (P6)
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connection = None;
        for list in state.scan_lists.values() {
            for tag in &list.tags {
                tag.invalidate();
            }
        }
    }
}
