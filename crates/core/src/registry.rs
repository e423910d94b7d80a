//! the process-wide directory of PLCs and the public tag API (spec.md §4.6, §9 "Global driver
//! state → process-wide singleton with explicit init").

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::Result;
use crate::plc::Plc;
use crate::tag::{Callback, TagHandle, TagInfo};
use crate::tag_path::ParsedTag;
use crate::worker;

/// a stable reference to a defined PLC
pub type PlcHandle = Arc<Plc>;

/// the process-wide registry: guards the PLC set (the "registry lock" of spec.md §5).
/// Held only during `find_plc`/`define_plc`/`restart`/`dump`/`report`.
pub struct Registry {
    config: Config,
    plcs: Mutex<HashMap<String, PlcHandle>>,
    initialized: AtomicBool,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

impl Registry {
    /// initialize the process-wide registry. A second call is a no-op (logs a warning) and
    /// returns the existing instance — spec.md §9's (uninitialized) → (initialized) lifecycle.
    pub fn init(config: Config) -> &'static Registry {
        if let Some(existing) = REGISTRY.get() {
            log::warn!("registry already initialized; ignoring repeat init()");
            return existing;
        }
        REGISTRY.get_or_init(|| Registry {
            config,
            plcs: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(true),
        })
    }

    /// the lazily-initialized process-wide instance, using default [`Config`] if never
    /// explicitly [`Registry::init`]ialized.
    pub fn global() -> &'static Registry {
        REGISTRY.get_or_init(|| Registry {
            config: Config::default(),
            plcs: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// idempotently insert a PLC; overwrites address/slot on repeat (P7, spec.md §4.6)
    pub fn define_plc(&self, name: &str, address: &str, slot: u8) -> PlcHandle {
        let mut plcs = self.plcs.lock();
        if let Some(existing) = plcs.get(name) {
            existing.redefine(address.to_string(), slot);
            log::info!("redefined PLC '{name}' at {address}:{slot}");
            return existing.clone();
        }
        let plc = Arc::new(Plc::new(name.to_string(), address.to_string(), slot));
        plcs.insert(name.to_string(), plc.clone());
        log::info!("defined PLC '{name}' at {address}:{slot}");
        plc
    }

    pub fn find_plc(&self, name: &str) -> Option<PlcHandle> {
        self.plcs.lock().get(name).cloned()
    }

    /// locate-or-create a ScanList at exactly `period`; move the tag if it already exists on a
    /// slower list, or maximize `elements` if it's already on an equal-or-faster one
    /// (spec.md §4.6, P7).
    pub fn add_tag(
        &self,
        plc: &PlcHandle,
        period: Duration,
        symbolic: &str,
        elements: u32,
    ) -> Result<TagHandle> {
        let parsed = ParsedTag::parse(symbolic)?;
        let mut state = plc.state.lock();

        if let Some(current_period) = state.find_tag_list(symbolic) {
            if current_period <= period {
                let tag = state
                    .scan_list_mut(current_period)
                    .find_tag(symbolic)
                    .cloned()
                    .expect("just located this tag");
                tag.maximize_elements(elements);
                return Ok(tag);
            }
            // moving to a faster period: remove from the old list, insert into the new one
            let old_list = state.scan_list_mut(current_period);
            let idx = old_list
                .tags
                .iter()
                .position(|t| t.symbolic == symbolic)
                .expect("just located this tag");
            let tag = old_list.tags.remove(idx);
            tag.maximize_elements(elements);
            state.scan_list_mut(period).tags.push(tag.clone());
            log::debug!("moved tag '{symbolic}' to a {:?} period", period);
            return Ok(tag);
        }

        let tag: TagHandle = Arc::new(TagInfo::new(symbolic.to_string(), parsed, elements));
        state.scan_list_mut(period).tags.push(tag.clone());
        Ok(tag)
    }

    pub fn register_callback(&self, tag: &TagHandle, func: fn(&TagInfo, crate::tag::CallbackEvent, usize), arg: usize) {
        tag.register_callback(Callback::new(func, arg));
    }

    pub fn unregister_callback(&self, tag: &TagHandle, func: fn(&TagInfo, crate::tag::CallbackEvent, usize), arg: usize) {
        tag.unregister_callback(Callback::new(func, arg));
    }

    /// disconnect every PLC and ensure each has a running worker; returns the count of workers
    /// newly spawned (spec.md §4.6).
    pub fn restart(&self) -> u32 {
        let plcs: Vec<PlcHandle> = self.plcs.lock().values().cloned().collect();
        let mut spawned = 0u32;
        for plc in plcs {
            plc.disconnect();
            if worker::spawn_if_absent(&plc, self.config.clone()) {
                spawned += 1;
            }
        }
        spawned
    }

    pub fn reset_statistics(&self) {
        let plcs = self.plcs.lock();
        for plc in plcs.values() {
            let mut state = plc.state.lock();
            state.error_count = 0;
            state.slow_scan_count = 0;
            for list in state.scan_lists.values_mut() {
                list.error_count = 0;
            }
        }
    }

    /// multi-level textual dump, `level` 0 (PLC names and connection state) through 10 (every
    /// tag's cached wire sizes and last-transfer statistics), per the `[ADD]` supplement in
    /// SPEC_FULL.md grounded on the original `drvEtherIP_Report`/`dump_PLCs`.
    pub fn report(&self, level: u8) -> String {
        let mut out = String::new();
        let plcs = self.plcs.lock();
        for (name, plc) in plcs.iter() {
            let state = plc.state.lock();
            let connected = state.connection.is_some();
            let _ = writeln!(
                out,
                "PLC '{name}' @ {}:{} connected={connected} errors={}",
                plc.address(),
                plc.slot(),
                state.error_count
            );
            if level == 0 {
                continue;
            }
            for (period, list) in state.scan_lists.iter() {
                let _ = writeln!(
                    out,
                    "  scan list period={period:?} enabled={} tags={} errors={}",
                    list.enabled,
                    list.tags.len(),
                    list.error_count
                );
                if level < 5 {
                    continue;
                }
                for tag in &list.tags {
                    let data = match tag.data() {
                        Ok(d) => d,
                        Err(e) => {
                            log::warn!("report: {e}");
                            continue;
                        }
                    };
                    if level < 10 {
                        let _ = writeln!(out, "    '{}' valid_size={}", tag.symbolic, data.valid_size);
                    } else {
                        let wire = tag.wire_sizes();
                        let _ = writeln!(
                            out,
                            "    '{}' valid_size={} read_req={} read_resp={} write_req={} write_resp={} last_ticks={}",
                            tag.symbolic,
                            data.valid_size,
                            wire.read_req_size,
                            wire.read_resp_size,
                            wire.write_req_size,
                            wire.write_resp_size,
                            tag.last_transfer_ticks()
                        );
                    }
                }
            }
        }
        out
    }

    /// equivalent to `report(10)`, kept as a distinct entry point per spec.md §4.6/§6
    pub fn dump(&self) -> String {
        self.report(10)
    }
}

/// read a tag's latest value under the tag data lock (spec.md §6 `read_value`). A lock timeout
/// (spec.md §7) is treated the same as "not yet probed": the caller sees `None` this call.
pub fn read_value(tag: &TagHandle) -> Option<(crate::cip::TypeCode, usize, Vec<u8>)> {
    let data = tag.data().ok()?;
    if data.valid_size < 2 {
        return None;
    }
    let type_code = u16::from_le_bytes([data.buffer[0], data.buffer[1]]);
    let ty = crate::cip::TypeCode::from_code(type_code).ok()?;
    let raw = data.buffer[2..data.valid_size].to_vec();
    let count = raw.len() / ty.byte_width();
    Some((ty, count, raw))
}

/// sets `do_write=1` under the tag lock (spec.md §6 `schedule_write`; the (0,0)→(1,0) transition
/// of the four-state protocol, §5)
pub fn schedule_write(tag: &TagHandle, bytes: &[u8]) {
    match tag.data() {
        Ok(mut data) => {
            data.write_data = bytes.to_vec();
            data.do_write = true;
        }
        Err(e) => log::warn!("schedule_write on '{}' dropped: {e}", tag.symbolic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_registry() -> Registry {
        Registry {
            config: Config::default(),
            plcs: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(true),
        }
    }

    #[test]
    fn p7_define_plc_idempotent() {
        let reg = fresh_registry();
        let a = reg.define_plc("p1", "10.0.0.1", 0);
        let b = reg.define_plc("p1", "10.0.0.2", 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.plcs.lock().len(), 1);
        assert_eq!(b.address(), "10.0.0.2");
    }

    #[test]
    fn p7_add_tag_idempotent_same_period() {
        let reg = fresh_registry();
        let plc = reg.define_plc("p1", "10.0.0.1", 0);
        let a = reg.add_tag(&plc, Duration::from_secs(1), "Tag1", 2).unwrap();
        let b = reg.add_tag(&plc, Duration::from_secs(1), "Tag1", 5).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.elements(), 5);
        let state = plc.state.lock();
        assert_eq!(state.scan_lists.len(), 1);
        assert_eq!(state.scan_lists.values().next().unwrap().tags.len(), 1);
    }

    #[test]
    fn add_tag_moves_to_faster_period() {
        let reg = fresh_registry();
        let plc = reg.define_plc("p1", "10.0.0.1", 0);
        reg.add_tag(&plc, Duration::from_secs(2), "Tag1", 1).unwrap();
        reg.add_tag(&plc, Duration::from_millis(500), "Tag1", 1).unwrap();
        let state = plc.state.lock();
        assert_eq!(state.scan_lists.len(), 2);
        assert!(state.scan_lists[&Duration::from_secs(2)].tags.is_empty());
        assert_eq!(state.scan_lists[&Duration::from_millis(500)].tags.len(), 1);
    }

    #[test]
    fn read_value_none_until_probed() {
        let reg = fresh_registry();
        let plc = reg.define_plc("p1", "10.0.0.1", 0);
        let tag = reg.add_tag(&plc, Duration::from_secs(1), "Tag1", 1).unwrap();
        assert!(read_value(&tag).is_none());
    }

    #[test]
    fn report_level_zero_omits_tags() {
        let reg = fresh_registry();
        let plc = reg.define_plc("p1", "10.0.0.1", 0);
        reg.add_tag(&plc, Duration::from_secs(1), "Tag1", 1).unwrap();
        let text = reg.report(0);
        assert!(text.contains("PLC 'p1'"));
        assert!(!text.contains("Tag1"));
        let full = reg.report(10);
        assert!(full.contains("Tag1"));
    }
}
