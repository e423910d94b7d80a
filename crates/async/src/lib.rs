//! tokio-based async facade over the synchronous [`ab_eip_core::Registry`].
//!
//! The registry's scan worker and tag API are synchronous by design (spec.md §5 — one OS thread
//! per PLC, callers block briefly on the tag lock). This crate doesn't replace that; it's sugar
//! for callers who'd rather `.await` a value than register a callback, built the way the
//! teacher's async facade wraps its synchronous FFI handle: a blocking call is pushed onto
//! `spawn_blocking`, and the result crosses back over a oneshot channel.

use std::time::Duration;

use ab_eip_core::{Config, PlcHandle, Registry, TagHandle};
use tokio::sync::oneshot;

/// async handle over the process-wide [`Registry`]
#[derive(Clone, Copy)]
pub struct AsyncRegistry;

impl AsyncRegistry {
    pub fn new() -> Self {
        AsyncRegistry
    }

    /// initialize the process-wide registry, or attach to one already initialized
    pub fn init(config: Config) -> Self {
        Registry::init(config);
        AsyncRegistry
    }

    pub async fn define_plc(&self, name: String, address: String, slot: u8) -> PlcHandle {
        run_blocking(move || Registry::global().define_plc(&name, &address, slot)).await
    }

    pub async fn find_plc(&self, name: String) -> Option<PlcHandle> {
        run_blocking(move || Registry::global().find_plc(&name)).await
    }

    pub async fn add_tag(
        &self,
        plc: PlcHandle,
        period: Duration,
        symbolic: String,
        elements: u32,
    ) -> ab_eip_core::Result<TagHandle> {
        run_blocking(move || Registry::global().add_tag(&plc, period, &symbolic, elements)).await
    }

    /// read a tag's latest value; resolves immediately with whatever is cached (no network
    /// round-trip happens here — the scan worker keeps the cache current in the background)
    pub async fn read_value(&self, tag: TagHandle) -> Option<(ab_eip_core::cip::TypeCode, usize, Vec<u8>)> {
        run_blocking(move || ab_eip_core::read_value(&tag)).await
    }

    pub async fn schedule_write(&self, tag: TagHandle, bytes: Vec<u8>) {
        run_blocking(move || ab_eip_core::schedule_write(&tag, &bytes)).await
    }

    pub async fn restart(&self) -> u32 {
        run_blocking(|| Registry::global().restart()).await
    }
}

impl Default for AsyncRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// run a blocking registry call on tokio's blocking pool and bring the result back through a
/// oneshot channel, mirroring the teacher's `mailbox`/`entry` request-response pattern.
async fn run_blocking<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let _ = tx.send(f());
    });
    rx.await.expect("blocking registry task panicked before replying")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn define_and_find_plc_roundtrip() {
        let registry = AsyncRegistry::new();
        let defined = registry
            .define_plc("p1".into(), "10.0.0.1".into(), 0)
            .await;
        let found = registry.find_plc("p1".into()).await;
        assert!(found.is_some());
        assert_eq!(defined.name, found.unwrap().name);
    }

    #[tokio::test]
    async fn add_tag_and_read_value_uncached() {
        let registry = AsyncRegistry::new();
        let plc = registry
            .define_plc("p2".into(), "10.0.0.1".into(), 0)
            .await;
        let tag = registry
            .add_tag(plc, Duration::from_secs(1), "Tag1".into(), 1)
            .await
            .unwrap();
        let value = registry.read_value(tag).await;
        assert!(value.is_none());
    }
}
