//! `TagInfo` and `ScanList`: the per-tag data the scan worker reads/writes, and the buckets that
//! group tags by a common scan period (spec.md §3).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::tag_path::ParsedTag;

/// how long a tag data lock acquisition waits before giving up (spec.md §7: "a short timeout").
/// Chosen short enough that one stuck tag can't stall a scan pass for longer than a handful of
/// other tags' own transfer times would.
const TAG_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

/// fired once a response for this tag has been deposited (read) or confirmed (write)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackEvent {
    Read,
    Write,
    /// the worker disconnected; `valid_size` was just zeroed
    Invalidated,
}

/// a registered (function pointer, opaque argument) pair, mirroring the source driver's
/// `fn(tag, arg)` callback convention. equality is by identity of both fields so
/// `register_callback`/`unregister_callback` can implement set semantics (spec.md §4.6).
#[derive(Clone, Copy)]
pub struct Callback {
    func: fn(&TagInfo, CallbackEvent, usize),
    arg: usize,
}

impl Callback {
    pub fn new(func: fn(&TagInfo, CallbackEvent, usize), arg: usize) -> Self {
        Self { func, arg }
    }

    fn invoke(&self, tag: &TagInfo, event: CallbackEvent) {
        (self.func)(tag, event, self.arg);
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        self.func as usize == other.func as usize && self.arg == other.arg
    }
}

/// wire sizes learned from the first successful probe of a tag; all zero until then (I5)
#[derive(Debug, Default, Clone, Copy)]
pub struct WireSizes {
    pub read_req_size: usize,
    pub read_resp_size: usize,
    pub write_req_size: usize,
    pub write_resp_size: usize,
}

impl WireSizes {
    /// derive write sizes from a read probe, per spec.md §4.7 step 2
    pub fn derive_write_sizes(&mut self) {
        if self.read_resp_size > 4 {
            self.write_req_size = self.read_req_size + (self.read_resp_size - 4);
            self.write_resp_size = 4;
        } else {
            self.write_req_size = 0;
            self.write_resp_size = 0;
        }
    }

    pub fn is_probed(&self) -> bool {
        self.read_req_size != 0
    }
}

/// buffer, validity, and the do_write/is_writing protocol — guarded together by one fine-grained
/// lock taken for at most one classification, deposit, or callback fan-out (spec.md §5)
#[derive(Debug, Default)]
pub struct TagData {
    pub buffer: Vec<u8>,
    pub buffer_capacity: usize,
    pub valid_size: usize,
    pub do_write: bool,
    pub is_writing: bool,
    pub write_data: Vec<u8>,
}

impl TagData {
    /// grow `buffer` to at least `needed` bytes, never shrinking (spec.md §4.5)
    fn ensure_capacity(&mut self, needed: usize) {
        if needed > self.buffer_capacity {
            self.buffer.resize(needed, 0);
            self.buffer_capacity = needed;
        }
    }

    /// deposit a read response: copy `data` in, set `valid_size` (worker, §4.7.c)
    pub fn deposit_read(&mut self, data: &[u8]) {
        self.ensure_capacity(data.len());
        self.buffer[..data.len()].copy_from_slice(data);
        self.valid_size = data.len();
    }

    /// snapshot (do_write, is_writing) state, without mutating it
    pub fn state(&self) -> (bool, bool) {
        (self.do_write, self.is_writing)
    }
}

/// one distinct symbolic tag on one PLC (spec.md §3)
pub struct TagInfo {
    pub symbolic: String,
    pub parsed: ParsedTag,
    elements: AtomicU32,
    wire: Mutex<WireSizes>,
    callbacks: Mutex<Vec<Callback>>,
    data: Mutex<TagData>,
    last_transfer_ticks: AtomicU64,
}

impl TagInfo {
    pub fn new(symbolic: String, parsed: ParsedTag, elements: u32) -> Self {
        Self {
            symbolic,
            parsed,
            elements: AtomicU32::new(elements.max(1)),
            wire: Mutex::new(WireSizes::default()),
            callbacks: Mutex::new(Vec::new()),
            data: Mutex::new(TagData::default()),
            last_transfer_ticks: AtomicU64::new(0),
        }
    }

    pub fn elements(&self) -> u32 {
        self.elements.load(Ordering::Relaxed)
    }

    /// accept a re-request for this tag at a possibly larger element count (spec.md §4.6)
    pub fn maximize_elements(&self, requested: u32) {
        self.elements.fetch_max(requested.max(1), Ordering::Relaxed);
    }

    pub fn wire_sizes(&self) -> WireSizes {
        *self.wire.lock()
    }

    pub fn set_wire_sizes(&self, sizes: WireSizes) {
        *self.wire.lock() = sizes;
    }

    pub fn last_transfer_ticks(&self) -> u64 {
        self.last_transfer_ticks.load(Ordering::Relaxed)
    }

    pub fn set_last_transfer_ticks(&self, ticks: u64) {
        self.last_transfer_ticks.store(ticks, Ordering::Relaxed);
    }

    /// lock the tag's data: buffer, valid_size, do_write, is_writing (§5 "tag data lock").
    /// Acquired with a short timeout (spec.md §7): a miss returns `Error::WouldStall` rather than
    /// blocking the scan worker indefinitely on a tag some other thread is holding onto.
    pub fn data(&self) -> Result<parking_lot::MutexGuard<'_, TagData>> {
        self.data
            .try_lock_for(TAG_LOCK_TIMEOUT)
            .ok_or_else(|| Error::WouldStall {
                tag: self.symbolic.clone(),
            })
    }

    pub fn register_callback(&self, cb: Callback) {
        let mut cbs = self.callbacks.lock();
        if !cbs.iter().any(|existing| *existing == cb) {
            cbs.push(cb);
        }
    }

    pub fn unregister_callback(&self, cb: Callback) {
        self.callbacks.lock().retain(|existing| *existing != cb);
    }

    /// invoke every registered callback, in registration order, while holding the tag data lock
    /// (spec.md §4.7.d) — caller must already hold `guard` to guarantee that.
    pub fn dispatch_callbacks(&self, _guard: &TagData, event: CallbackEvent) {
        for cb in self.callbacks.lock().iter() {
            cb.invoke(self, event);
        }
    }

    /// zero `valid_size` on disconnect so consumers can detect staleness (P6). A lock miss is
    /// logged and treated as transient (spec.md §7): the tag simply keeps its last value until
    /// the next disconnect or successful read.
    pub fn invalidate(&self) {
        match self.data.try_lock_for(TAG_LOCK_TIMEOUT) {
            Some(mut data) => {
                data.valid_size = 0;
                self.dispatch_callbacks(&data, CallbackEvent::Invalidated);
            }
            None => log::warn!("tag '{}' invalidate skipped: lock busy", self.symbolic),
        }
    }
}

/// handle type callers and the worker hold onto; cheap to clone, stable for the tag's lifetime
pub type TagHandle = Arc<TagInfo>;

/// a bucket of tags polled at a common period (spec.md §3)
pub struct ScanList {
    pub period: Duration,
    pub enabled: bool,
    pub next_deadline: Instant,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub last_duration: Option<Duration>,
    pub error_count: u64,
    pub tags: Vec<TagHandle>,
}

impl ScanList {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            enabled: true,
            next_deadline: Instant::now(),
            min_duration: None,
            max_duration: None,
            last_duration: None,
            error_count: 0,
            tags: Vec::new(),
        }
    }

    /// record one pass's duration, updating min/max/last (diagnostic)
    pub fn record_duration(&mut self, duration: Duration) {
        self.last_duration = Some(duration);
        self.min_duration = Some(self.min_duration.map_or(duration, |m| m.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |m| m.max(duration)));
    }

    pub fn find_tag(&self, symbolic: &str) -> Option<&TagHandle> {
        self.tags.iter().find(|t| t.symbolic == symbolic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_sizes_derive_writable() {
        let mut sizes = WireSizes {
            read_req_size: 10,
            read_resp_size: 8,
            ..Default::default()
        };
        sizes.derive_write_sizes();
        assert_eq!(sizes.write_req_size, 10 + (8 - 4));
        assert_eq!(sizes.write_resp_size, 4);
    }

    #[test]
    fn write_sizes_not_writable_when_resp_too_small() {
        let mut sizes = WireSizes {
            read_req_size: 10,
            read_resp_size: 4,
            ..Default::default()
        };
        sizes.derive_write_sizes();
        assert_eq!(sizes.write_req_size, 0);
        assert_eq!(sizes.write_resp_size, 0);
    }

    #[test]
    fn elements_maximize_never_shrinks() {
        let tag = TagInfo::new("T".into(), ParsedTag::parse("T").unwrap(), 5);
        tag.maximize_elements(2);
        assert_eq!(tag.elements(), 5);
        tag.maximize_elements(9);
        assert_eq!(tag.elements(), 9);
    }

    #[test]
    fn callback_registration_is_a_set() {
        fn cb(_tag: &TagInfo, _event: CallbackEvent, _arg: usize) {}
        let tag = TagInfo::new("T".into(), ParsedTag::parse("T").unwrap(), 1);
        let callback = Callback::new(cb, 42);
        tag.register_callback(callback);
        tag.register_callback(callback);
        assert_eq!(tag.callbacks.lock().len(), 1);
        tag.unregister_callback(callback);
        assert_eq!(tag.callbacks.lock().len(), 0);
    }

    #[test]
    fn invalidate_zeroes_valid_size() {
        let tag = TagInfo::new("T".into(), ParsedTag::parse("T").unwrap(), 1);
        tag.data().unwrap().deposit_read(&[1, 2, 3, 4]);
        assert_eq!(tag.data().unwrap().valid_size, 4);
        tag.invalidate();
        assert_eq!(tag.data().unwrap().valid_size, 0);
    }

    #[test]
    fn data_lock_held_elsewhere_times_out_as_would_stall() {
        let tag = TagInfo::new("T".into(), ParsedTag::parse("T").unwrap(), 1);
        let held = tag.data.lock();
        let err = tag.data().unwrap_err();
        assert!(matches!(err, Error::WouldStall { .. }));
        drop(held);
        assert!(tag.data().is_ok());
    }
}
