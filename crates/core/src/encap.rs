//! EtherNet/IP encapsulation: the 24-byte header every frame carries, and the small set of
//! encapsulation commands this driver speaks (ListServices, RegisterSession, UnRegisterSession,
//! SendRRData, SendUnitData).

use crate::codec::{pack_u16, pack_u32, unpack_u16, unpack_u32};
use crate::error::{Error, Result};

/// the well-known EtherNet/IP TCP port
pub const PORT: u16 = 0xAF12;

/// encapsulation header size in bytes
pub const HEADER_LEN: usize = 24;

pub mod command {
    pub const NOP: u16 = 0x0000;
    pub const LIST_SERVICES: u16 = 0x0004;
    pub const LIST_IDENTITY: u16 = 0x0063;
    pub const REGISTER_SESSION: u16 = 0x0065;
    pub const UNREGISTER_SESSION: u16 = 0x0066;
    pub const SEND_RR_DATA: u16 = 0x006F;
    pub const SEND_UNIT_DATA: u16 = 0x0070;
}

/// the 24-byte encapsulation header (spec.md §4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapHeader {
    pub command: u16,
    pub length: u16,
    pub session: u32,
    pub status: u32,
    pub sender_context: [u8; 8],
    pub options: u32,
}

impl EncapHeader {
    pub fn new(command: u16, length: u16, session: u32) -> Self {
        Self {
            command,
            length,
            session,
            status: 0,
            sender_context: [0; 8],
            options: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        pack_u16(&mut buf, self.command);
        pack_u16(&mut buf, self.length);
        pack_u32(&mut buf, self.session);
        pack_u32(&mut buf, self.status);
        buf.extend_from_slice(&self.sender_context);
        pack_u32(&mut buf, self.options);
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Protocol("encapsulation header truncated".into()));
        }
        let mut sender_context = [0u8; 8];
        sender_context.copy_from_slice(&buf[8..16]);
        Ok(Self {
            command: unpack_u16(buf, 0)?,
            length: unpack_u16(buf, 2)?,
            session: unpack_u32(buf, 4)?,
            status: unpack_u32(buf, 8)?,
            sender_context,
            options: unpack_u32(buf, 20)?,
        })
    }
}

/// build a complete encapsulated frame: header followed by `payload`
pub fn build_frame(command: u16, session: u32, payload: &[u8]) -> Vec<u8> {
    let header = EncapHeader::new(command, payload.len() as u16, session);
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    out
}

/// `ListServices`/`ListIdentity` request: empty payload, session 0
pub fn build_list_services() -> Vec<u8> {
    build_frame(command::LIST_SERVICES, 0, &[])
}

pub fn build_list_identity() -> Vec<u8> {
    build_frame(command::LIST_IDENTITY, 0, &[])
}

/// `RegisterSession` request payload: protocol version (1) + options flags (0)
pub fn build_register_session() -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    pack_u16(&mut payload, 1);
    pack_u16(&mut payload, 0);
    build_frame(command::REGISTER_SESSION, 0, &payload)
}

/// parse a `RegisterSession` reply, returning the session handle the controller assigned
pub fn parse_register_session_reply(buf: &[u8]) -> Result<u32> {
    let header = EncapHeader::decode(buf)?;
    if header.command != command::REGISTER_SESSION {
        return Err(Error::Handshake(format!(
            "unexpected reply command 0x{:04X} to RegisterSession",
            header.command
        )));
    }
    if header.status != 0 {
        return Err(Error::Handshake(format!(
            "RegisterSession rejected, status 0x{:08X}",
            header.status
        )));
    }
    Ok(header.session)
}

pub fn build_unregister_session(session: u32) -> Vec<u8> {
    build_frame(command::UNREGISTER_SESSION, session, &[])
}

/// the CPF (Common Packet Format) item types this driver emits/consumes
mod item_type {
    pub const NULL_ADDRESS: u16 = 0x0000;
    pub const UNCONNECTED_DATA: u16 = 0x00B2;
    pub const CONNECTED_ADDRESS: u16 = 0x00A1;
    pub const CONNECTED_DATA: u16 = 0x00B1;
}

/// wrap a CIP message in a `SendRRData` request (unconnected messaging): interface handle (4,
/// always 0) + timeout (2) + CPF item count (2) + null address item + unconnected-data item
/// carrying `cip_message`.
pub fn build_send_rr_data(session: u32, cip_message: &[u8], timeout_secs: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(10 + 4 + 4 + cip_message.len());
    pack_u32(&mut payload, 0); // interface handle
    pack_u16(&mut payload, timeout_secs);
    pack_u16(&mut payload, 2); // item count
    pack_u16(&mut payload, item_type::NULL_ADDRESS);
    pack_u16(&mut payload, 0); // null address item length
    pack_u16(&mut payload, item_type::UNCONNECTED_DATA);
    pack_u16(&mut payload, cip_message.len() as u16);
    payload.extend_from_slice(cip_message);
    build_frame(command::SEND_RR_DATA, session, &payload)
}

/// wrap a CIP message in a `SendUnitData` request (connected messaging, not used by the scan
/// worker today but kept for forward-compat with a future connected-messaging mode).
pub fn build_send_unit_data(session: u32, connection_id: u32, sequence: u16, cip_message: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(10 + 4 + 6 + 2 + cip_message.len());
    pack_u32(&mut payload, 0); // interface handle
    pack_u16(&mut payload, 0); // timeout, unused for connected messages
    pack_u16(&mut payload, 2);
    pack_u16(&mut payload, item_type::CONNECTED_ADDRESS);
    pack_u16(&mut payload, 4);
    pack_u32(&mut payload, connection_id);
    pack_u16(&mut payload, item_type::CONNECTED_DATA);
    pack_u16(&mut payload, 2 + cip_message.len() as u16);
    pack_u16(&mut payload, sequence);
    payload.extend_from_slice(cip_message);
    build_frame(command::SEND_UNIT_DATA, session, &payload)
}

/// extract the CIP message body carried inside a `SendRRData`/`SendUnitData` reply's CPF data
/// item, skipping past the header and address item
pub fn parse_rr_data_reply(buf: &[u8]) -> Result<&[u8]> {
    let header = EncapHeader::decode(buf)?;
    if header.status != 0 {
        return Err(Error::Protocol(format!(
            "encapsulation status 0x{:08X} on command 0x{:04X}",
            header.status, header.command
        )));
    }
    let body = &buf[HEADER_LEN..];
    if body.len() < 10 {
        return Err(Error::Protocol("SendRRData reply too short".into()));
    }
    // interface handle(4) + timeout(2) + item count(2)
    let item_count = unpack_u16(body, 6)? as usize;
    let mut pos = 8;
    let mut data_item: Option<&[u8]> = None;
    for _ in 0..item_count {
        let item_type = unpack_u16(body, pos)?;
        let item_len = unpack_u16(body, pos + 2)? as usize;
        let item_start = pos + 4;
        let item_end = item_start + item_len;
        let item = body
            .get(item_start..item_end)
            .ok_or_else(|| Error::Protocol("CPF item truncated".into()))?;
        if item_type == item_type::UNCONNECTED_DATA || item_type == item_type::CONNECTED_DATA {
            data_item = Some(item);
        }
        pos = item_end;
    }
    let data = data_item.ok_or_else(|| Error::Protocol("no data item in CPF reply".into()))?;
    // a connected-data item is prefixed with a 2-byte sequence number we don't need here
    if data.len() >= 2 && header.command == command::SEND_UNIT_DATA {
        Ok(&data[2..])
    } else {
        Ok(data)
    }
}

/// `ListServices` reply: true iff any advertised service supports CIP encapsulation
/// (capability flag bit 5, per the original source's `CIP_COMM_IMPLIED` check). Each service
/// entry is `type(2) | length(2) | version(2) | flags(2) | name[16]` (`ether_ip.c`'s
/// `EIP_list_services`, ether_ip.c:1639-1649); `flags` sits 6 bytes past the entry start, after
/// the `version` field, not 4.
pub fn list_services_supports_cip(buf: &[u8]) -> Result<bool> {
    let header = EncapHeader::decode(buf)?;
    if header.command != command::LIST_SERVICES {
        return Err(Error::Handshake(format!(
            "unexpected reply command 0x{:04X} to ListServices",
            header.command
        )));
    }
    let body = &buf[HEADER_LEN..];
    if body.len() < 2 {
        return Err(Error::Handshake("ListServices reply empty".into()));
    }
    let count = unpack_u16(body, 0)? as usize;
    let mut pos = 2;
    for _ in 0..count {
        if body.len() < pos + 8 {
            return Err(Error::Handshake("ListServices item truncated".into()));
        }
        let item_len = unpack_u16(body, pos + 2)? as usize;
        // pos+4 is `version`, skipped; `flags` is the field that carries the capability bits.
        let flags = unpack_u16(body, pos + 6)?;
        const CIP_COMM: u16 = 1 << 5;
        if flags & CIP_COMM != 0 {
            return Ok(true);
        }
        pos += 4 + item_len;
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = EncapHeader {
            command: command::SEND_RR_DATA,
            length: 7,
            session: 0xDEADBEEF,
            status: 0,
            sender_context: [1, 2, 3, 4, 5, 6, 7, 8],
            options: 0,
        };
        let encoded = h.encode();
        let decoded = EncapHeader::decode(&encoded).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn register_session_reply_extracts_session() {
        let mut buf = Vec::new();
        let header = EncapHeader::new(command::REGISTER_SESSION, 4, 0x1234_5678);
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&[1, 0, 0, 0]);
        let session = parse_register_session_reply(&buf).unwrap();
        assert_eq!(session, 0x1234_5678);
    }

    #[test]
    fn register_session_reply_rejects_nonzero_status() {
        let mut header = EncapHeader::new(command::REGISTER_SESSION, 0, 0);
        header.status = 1;
        let buf = header.encode().to_vec();
        assert!(parse_register_session_reply(&buf).is_err());
    }

    #[test]
    fn send_rr_data_roundtrip_extracts_cip_message() {
        let cip = vec![0xAA, 0xBB, 0xCC];
        let request = build_send_rr_data(0x11, &cip, 5);
        assert!(request.len() > HEADER_LEN);

        // build a synthetic reply with the same CPF framing
        let mut reply_payload = Vec::new();
        pack_u32(&mut reply_payload, 0);
        pack_u16(&mut reply_payload, 0);
        pack_u16(&mut reply_payload, 2);
        pack_u16(&mut reply_payload, item_type::NULL_ADDRESS);
        pack_u16(&mut reply_payload, 0);
        pack_u16(&mut reply_payload, item_type::UNCONNECTED_DATA);
        pack_u16(&mut reply_payload, cip.len() as u16);
        reply_payload.extend_from_slice(&cip);
        let reply = build_frame(command::SEND_RR_DATA, 0x11, &reply_payload);

        let extracted = parse_rr_data_reply(&reply).unwrap();
        assert_eq!(extracted, &cip[..]);
    }

    #[test]
    fn list_services_detects_cip_capability() {
        let mut payload = Vec::new();
        pack_u16(&mut payload, 1); // one service item
        pack_u16(&mut payload, 0x0100); // type code (unused here)
        pack_u16(&mut payload, 20); // item length: version(2) + flags(2) + name[16]
        pack_u16(&mut payload, 1); // version
        pack_u16(&mut payload, 1 << 5); // flags: CIP comm supported
        payload.extend_from_slice(&[0u8; 16]); // name, padded
        let frame = build_frame(command::LIST_SERVICES, 0, &payload);
        assert!(list_services_supports_cip(&frame).unwrap());
    }

    #[test]
    fn list_services_rejects_missing_capability() {
        let mut payload = Vec::new();
        pack_u16(&mut payload, 1);
        pack_u16(&mut payload, 0x0100);
        pack_u16(&mut payload, 20);
        pack_u16(&mut payload, 1); // version
        pack_u16(&mut payload, 0); // flags: no CIP comm bit
        payload.extend_from_slice(&[0u8; 16]);
        let frame = build_frame(command::LIST_SERVICES, 0, &payload);
        assert!(!list_services_supports_cip(&frame).unwrap());
    }
}
