//! the scan-loop scheduler: one worker thread per PLC, driving connect/reconnect, deadline-based
//! scan lists, MultiRequest batching, and callback dispatch (spec.md §4.7 — "the heart").

use std::thread;
use std::time::{Duration, Instant};

use crate::cip::{self, TypeCode};
use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::registry::PlcHandle;
use crate::tag::{CallbackEvent, TagHandle, WireSizes};

/// spawn a worker thread for `plc` unless one is already running; returns whether a new worker
/// was spawned (spec.md §4.6 `restart`).
pub fn spawn_if_absent(plc: &PlcHandle, config: Config) -> bool {
    let mut slot = plc.worker_handle.lock();
    if slot.is_some() {
        return false;
    }
    let plc_handle = plc.clone();
    let handle = thread::Builder::new()
        .name(format!("ab-eip-worker-{}", plc.name))
        .spawn(move || run(plc_handle, config))
        .expect("failed to spawn scan worker thread");
    *slot = Some(handle);
    true
}

fn run(plc: PlcHandle, config: Config) {
    log::info!("scan worker for PLC '{}' started", plc.name);
    loop {
        if !ensure_connected(&plc, &config) {
            thread::sleep(config.scan_timeout);
            continue;
        }

        let next_wake = run_scan_lists(&plc, &config);
        let sleep_for = next_wake
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or_else(|| Duration::from_millis(100));

        if sleep_for.is_zero() {
            let mut state = plc.state.lock();
            state.slow_scan_count += 1;
        } else {
            thread::sleep(sleep_for);
        }
    }
}

/// connect if not already connected, then probe any un-probed tags (spec.md §4.7 step 1-2).
/// returns false if the connect attempt failed this iteration.
fn ensure_connected(plc: &PlcHandle, config: &Config) -> bool {
    {
        let mut state = plc.state.lock();
        if state.connection.is_some() {
            return true;
        }
        let address = plc.address();
        match Connection::open(&address, crate::encap::PORT, config.connect_timeout, config.scan_timeout) {
            Ok(mut conn) => {
                match conn.probe_identity() {
                    Ok(identity) => {
                        log::info!(
                            "PLC '{}' identity: vendor={} product='{}' serial=0x{:08X}",
                            plc.name, identity.vendor, identity.product_name, identity.serial
                        );
                        state.identity = Some(identity);
                    }
                    Err(e) => log::warn!("PLC '{}' identity probe failed (non-fatal): {e}", plc.name),
                }
                state.connection = Some(conn);
                log::info!("PLC '{}' connected", plc.name);
            }
            Err(e) => {
                log::error!("PLC '{}' connect failed: {e}", plc.name);
                return false;
            }
        }
    }
    probe_unprobed_tags(plc);
    true
}

/// issue a single CIP_ReadData for every tag whose `read_req_size == 0`, populating cached wire
/// sizes and deriving write sizes (spec.md §4.7 step 2)
fn probe_unprobed_tags(plc: &PlcHandle) {
    let tags: Vec<TagHandle> = {
        let state = plc.state.lock();
        state
            .scan_lists
            .values()
            .flat_map(|list| list.tags.iter().cloned())
            .filter(|tag| !tag.wire_sizes().is_probed())
            .collect()
    };

    for tag in tags {
        let path = tag.parsed.to_path_bytes();
        let request = cip::make_cip_read_data(&path, tag.elements() as u16);
        let mut state = plc.state.lock();
        let Some(conn) = state.connection.as_mut() else {
            return;
        };
        match conn.send_cip(&request, cip::DEFAULT_CM_TIMEOUT_MS) {
            Ok(response) => {
                let mut sizes = WireSizes {
                    read_req_size: request.len(),
                    read_resp_size: response.len() + 4,
                    ..Default::default()
                };
                sizes.derive_write_sizes();
                tag.set_wire_sizes(sizes);
                match tag.data() {
                    Ok(mut data) => data.deposit_read(&response),
                    Err(e) => log::warn!("probe deposit for '{}' dropped: {e}", tag.symbolic),
                }
                log::debug!("probed tag '{}': {:?}", tag.symbolic, sizes);
            }
            Err(e) => {
                log::warn!("probe of tag '{}' failed: {e}", tag.symbolic);
                drop(state);
                plc.disconnect();
                return;
            }
        }
    }
}

/// run every scan list whose deadline has passed; returns the earliest next deadline across all
/// enabled lists (spec.md §4.7 step 3-4)
fn run_scan_lists(plc: &PlcHandle, config: &Config) -> Option<Instant> {
    let now = Instant::now();
    let periods: Vec<Duration> = {
        let state = plc.state.lock();
        state.scan_lists.keys().copied().collect()
    };

    for period in periods {
        let due = {
            let state = plc.state.lock();
            state
                .scan_lists
                .get(&period)
                .map(|l| l.enabled && l.next_deadline <= now)
                .unwrap_or(false)
        };
        if !due {
            continue;
        }
        if let Err(e) = run_one_scan_list(plc, period, config) {
            log::error!("PLC '{}' scan list {:?} failed: {e}", plc.name, period);
            let mut state = plc.state.lock();
            state.error_count += 1;
            if let Some(list) = state.scan_lists.get_mut(&period) {
                list.error_count += 1;
                list.next_deadline = now + config.scan_timeout;
            }
            drop(state);
            plc.disconnect();
            return Some(Instant::now());
        }
    }

    let state = plc.state.lock();
    state
        .scan_lists
        .values()
        .filter(|l| l.enabled)
        .map(|l| l.next_deadline)
        .min()
}

/// classify tags, pack into transfers, send/receive, and dispatch callbacks, for one scan list
/// (spec.md §4.7 step 3)
fn run_one_scan_list(plc: &PlcHandle, period: Duration, config: &Config) -> Result<()> {
    let pass_start = Instant::now();

    // tags with read_req_size == 0 are skipped outright; their existence/type is still unknown
    // to the controller (I5) and they never occupy a batch slot.
    let tags: Vec<TagHandle> = {
        let state = plc.state.lock();
        state
            .scan_lists
            .get(&period)
            .map(|l| {
                l.tags
                    .iter()
                    .filter(|t| t.wire_sizes().is_probed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut cursor = 0usize;
    while cursor < tags.len() {
        let batch = select_batch(&tags[cursor..], config.transfer_buffer_limit);
        if batch.is_empty() {
            // not even the next single tag fits; give up on the remainder this round
            break;
        }
        dispatch_batch(plc, &batch)?;
        cursor += batch.len();
    }

    let mut state = plc.state.lock();
    if let Some(list) = state.scan_lists.get_mut(&period) {
        list.record_duration(pass_start.elapsed());
        list.next_deadline = pass_start + period;
    }
    Ok(())
}

/// a tag plus the snapshot of whether it will write this pass (do_write at classification time)
struct Classified {
    tag: TagHandle,
    writing: bool,
}

/// pack the largest prefix of `tags` whose combined request+response size stays within `limit`.
/// `tags` must already be filtered to probed tags (spec.md §4.7.b, "Batching guarantees" / P4).
fn select_batch(tags: &[TagHandle], limit: usize) -> Vec<TagHandle> {
    let mut count = 0usize;
    let mut req_total = 0usize;
    let mut resp_total = 0usize;
    for tag in tags {
        let sizes = tag.wire_sizes();
        let (do_write, _) = match tag.data() {
            Ok(data) => data.state(),
            Err(e) => {
                // a stuck tag is treated as idle for this batching pass rather than blocking
                // every other tag behind it (spec.md §7); it falls into the next batch instead.
                log::warn!("select_batch: {e}");
                (false, false)
            }
        };
        let (req_size, resp_size) = if do_write {
            (sizes.write_req_size, sizes.write_resp_size)
        } else {
            (sizes.read_req_size, sizes.read_resp_size)
        };
        let next_count = count + 1;
        let next_req = cip::multi_request_size(next_count, req_total + req_size);
        let next_resp = cip::multi_request_size(next_count, resp_total + resp_size);
        if next_req > limit || next_resp > limit {
            break;
        }
        req_total += req_size;
        resp_total += resp_size;
        count = next_count;
    }
    tags[..count].to_vec()
}

fn dispatch_batch(plc: &PlcHandle, batch: &[TagHandle]) -> Result<()> {
    let classified: Vec<Classified> = batch
        .iter()
        .map(|tag| {
            let writing = match tag.data() {
                Ok(mut data) => {
                    let writing = data.do_write;
                    if writing {
                        data.is_writing = true;
                    }
                    writing
                }
                Err(e) => {
                    // can't observe do_write this pass; fall back to a read so the tag still
                    // occupies its batch slot instead of stalling the whole batch (spec.md §7).
                    log::warn!("classify of '{}' dropped: {e}", tag.symbolic);
                    false
                }
            };
            Classified {
                tag: tag.clone(),
                writing,
            }
        })
        .collect();

    let mut builder = cip::MultiRequestBuilder::new(classified.len());
    let mut item_bytes: Vec<Vec<u8>> = Vec::with_capacity(classified.len());
    for c in &classified {
        let path = c.tag.parsed.to_path_bytes();
        let bytes = if c.writing {
            let ty = current_type_code(&c.tag)?;
            let write_data = c.tag.data()?.write_data.clone();
            cip::make_cip_write_data(&path, ty, c.tag.elements() as u16, &write_data)
        } else {
            cip::make_cip_read_data(&path, c.tag.elements() as u16)
        };
        item_bytes.push(bytes);
    }
    for (i, bytes) in item_bytes.iter().enumerate() {
        builder.item(i, bytes);
    }
    let multi_request = builder.finish();
    let inner = cip::build_mr_request(cip::service::CIP_MULTI_REQUEST, &[0x20, 0x02, 0x24, 0x01], &multi_request);

    let response = {
        let mut state = plc.state.lock();
        let conn = state
            .connection
            .as_mut()
            .ok_or_else(|| Error::Protocol("no active connection".into()))?;
        conn.send_cip(&inner, cip::DEFAULT_CM_TIMEOUT_MS)?
    };

    // the (1,1) -> (0,1) transition happens unconditionally once the request bytes have gone
    // out, before any individual item's status is known — a failed write must not leave a tag
    // stuck outside the (0,0)->(1,0)->(1,1)->(0,1)->(0,0) cycle (spec.md §5, P5).
    for c in &classified {
        if c.writing {
            match c.tag.data() {
                Ok(mut data) => data.do_write = false,
                Err(e) => log::warn!("do_write clear on '{}' dropped: {e}", c.tag.symbolic),
            }
        }
    }

    let items = cip::parse_multi_response(&response)?;
    if items.len() != classified.len() {
        return Err(Error::Protocol(format!(
            "MultiRequest response item count {} != request count {}",
            items.len(),
            classified.len()
        )));
    }

    for (c, item) in classified.iter().zip(items.iter()) {
        let resp = cip::parse_mr_response(item);
        let mut data = match c.tag.data() {
            Ok(data) => data,
            Err(e) => {
                log::warn!("result for '{}' dropped: {e}", c.tag.symbolic);
                continue;
            }
        };
        match resp.and_then(|r| r.into_result()) {
            Ok(r) => {
                if c.writing {
                    data.is_writing = false;
                    c.tag.dispatch_callbacks(&data, CallbackEvent::Write);
                } else if data.do_write {
                    // a write was scheduled mid-cycle while this tag was being read as a read
                    // (spec.md §4.7.c, S5): the pass still completes, but the read payload is
                    // discarded rather than overwriting what the pending write is about to send;
                    // the write itself goes out on the next pass.
                    log::debug!(
                        "tag '{}' read payload discarded: write scheduled mid-cycle",
                        c.tag.symbolic
                    );
                } else {
                    data.deposit_read(r.data);
                    c.tag.dispatch_callbacks(&data, CallbackEvent::Read);
                }
            }
            Err(e) => {
                log::warn!("tag '{}' transfer failed: {e}", c.tag.symbolic);
                data.valid_size = 0;
                if c.writing {
                    data.is_writing = false;
                }
            }
        }
    }
    Ok(())
}

/// the type code to write with: taken from the tag's most recent read (leading 2 bytes of its
/// buffer), since a write cannot be composed without knowing the controller's declared type
fn current_type_code(tag: &TagHandle) -> Result<TypeCode> {
    let data = tag.data()?;
    if data.valid_size < 2 {
        return Err(Error::Protocol(format!(
            "tag '{}' has no known type yet; cannot write",
            tag.symbolic
        )));
    }
    let code = u16::from_le_bytes([data.buffer[0], data.buffer[1]]);
    TypeCode::from_code(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagInfo;
    use crate::tag_path::ParsedTag;

    fn probed_tag(symbolic: &str, read_req: usize, read_resp: usize) -> TagHandle {
        let tag = std::sync::Arc::new(TagInfo::new(
            symbolic.to_string(),
            ParsedTag::parse(symbolic).unwrap(),
            1,
        ));
        tag.set_wire_sizes(WireSizes {
            read_req_size: read_req,
            read_resp_size: read_resp,
            ..Default::default()
        });
        tag
    }

    #[test]
    fn s4_batches_two_then_one_under_limit_80() {
        let tags = vec![
            probed_tag("T1", 30, 30),
            probed_tag("T2", 30, 30),
            probed_tag("T3", 30, 30),
        ];
        let first = select_batch(&tags, 80);
        assert_eq!(first.len(), 2);
        let second = select_batch(&tags[2..], 80);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn oversized_single_tag_yields_empty_batch() {
        let tag = probed_tag("T1", 1000, 1000);
        let batch = select_batch(&[tag], 80);
        assert!(batch.is_empty());
    }

    /// end-to-end P5/S5 coverage: drives `dispatch_batch` against a loopback `Connection` rather
    /// than flipping `TagData` fields by hand, so it actually exercises the do_write clear and the
    /// mid-cycle-write discard rather than assuming them. A second thread schedules a write for
    /// the tag right after the server observes the request bytes (and before it answers), so the
    /// read response that eventually arrives must find `do_write` already set again.
    #[test]
    fn s5_read_payload_discarded_when_write_scheduled_mid_cycle() {
        use std::io::{Read as _, Write as _};
        use std::net::TcpListener;
        use std::sync::mpsc;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (request_seen_tx, request_seen_rx) = mpsc::channel::<()>();
        let (proceed_tx, proceed_rx) = mpsc::channel::<()>();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();

            let mut header_buf = [0u8; crate::encap::HEADER_LEN];
            stream.read_exact(&mut header_buf).unwrap();
            let header = crate::encap::EncapHeader::decode(&header_buf).unwrap();
            assert_eq!(header.command, crate::encap::command::LIST_SERVICES);
            let mut payload = Vec::new();
            crate::codec::pack_u16(&mut payload, 1);
            crate::codec::pack_u16(&mut payload, 0x0100);
            crate::codec::pack_u16(&mut payload, 20);
            crate::codec::pack_u16(&mut payload, 1);
            crate::codec::pack_u16(&mut payload, 1 << 5);
            payload.extend_from_slice(&[0u8; 16]);
            let reply = crate::encap::build_frame(crate::encap::command::LIST_SERVICES, 0, &payload);
            stream.write_all(&reply).unwrap();

            let mut header_buf = [0u8; crate::encap::HEADER_LEN];
            stream.read_exact(&mut header_buf).unwrap();
            let header = crate::encap::EncapHeader::decode(&header_buf).unwrap();
            assert_eq!(header.command, crate::encap::command::REGISTER_SESSION);
            let mut body = vec![0u8; header.length as usize];
            stream.read_exact(&mut body).unwrap();
            let reply =
                crate::encap::build_frame(crate::encap::command::REGISTER_SESSION, 0x7777, &[1, 0, 0, 0]);
            stream.write_all(&reply).unwrap();

            // the scan pass's batched MultiRequest
            let mut header_buf = [0u8; crate::encap::HEADER_LEN];
            stream.read_exact(&mut header_buf).unwrap();
            let header = crate::encap::EncapHeader::decode(&header_buf).unwrap();
            let mut body = vec![0u8; header.length as usize];
            stream.read_exact(&mut body).unwrap();

            request_seen_tx.send(()).unwrap();
            proceed_rx.recv().unwrap();

            let mut item = vec![cip::service::CIP_READ_DATA | cip::service::RESPONSE_BIT, 0, 0, 0];
            crate::codec::pack_u16(&mut item, 0x00C4);
            crate::codec::pack_u32(&mut item, 0xDEAD_BEEF);
            let mut builder = cip::MultiRequestBuilder::new(1);
            builder.item(0, &item);
            let multi_resp = builder.finish();
            let mut mr_reply = vec![cip::service::CIP_MULTI_REQUEST | cip::service::RESPONSE_BIT, 0, 0, 0];
            mr_reply.extend_from_slice(&multi_resp);
            let reply = crate::encap::build_send_rr_data(0x7777, &mr_reply, 5);
            stream.write_all(&reply).unwrap();
        });

        let conn = Connection::open(
            &addr.ip().to_string(),
            addr.port(),
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .unwrap();

        let plc = std::sync::Arc::new(crate::plc::Plc::new("s5-plc".into(), addr.ip().to_string(), 0));
        plc.state.lock().connection = Some(conn);

        let tag = probed_tag("S5Tag", 12, 10);
        {
            let mut data = tag.data().unwrap();
            data.buffer = vec![0xC4, 0x00, 0, 0, 0, 0];
            data.buffer_capacity = 6;
            data.valid_size = 6;
        }

        let mutator = {
            let tag = tag.clone();
            thread::spawn(move || {
                request_seen_rx.recv().unwrap();
                crate::registry::schedule_write(&tag, &[9, 9, 9, 9]);
                proceed_tx.send(()).unwrap();
            })
        };

        dispatch_batch(&plc, &[tag.clone()]).unwrap();
        mutator.join().unwrap();
        server.join().unwrap();

        // the read reply must not have overwritten the stale buffer...
        assert_eq!(tag.data().unwrap().valid_size, 6);
        // ...and the mid-cycle write must still be pending for the next pass.
        assert!(tag.data().unwrap().do_write);
    }
}
