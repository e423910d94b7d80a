//! CIP message builder/parser: Message Router requests/responses, MultiRequest packing and
//! offset tables, CM_Unconnected_Send wrapping, and the scalar type codes used on the wire.

use crate::codec::{pack_u16, pack_u32, pack_u8, unpack_u16, unpack_u32, unpack_u8};
use crate::error::{Error, Result};

/// numeric CIP service codes, required for wire compatibility (spec.md §4.3)
pub mod service {
    pub const GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
    pub const GET_ATTRIBUTE_ALL: u8 = 0x01;
    pub const CIP_READ_DATA: u8 = 0x4C;
    pub const CIP_WRITE_DATA: u8 = 0x4D;
    pub const CIP_MULTI_REQUEST: u8 = 0x0A;
    pub const CM_UNCONNECTED_SEND: u8 = 0x52;
    pub const CM_FORWARD_OPEN: u8 = 0x54;
    /// bit set on a response's service byte (`service | 0x80`)
    pub const RESPONSE_BIT: u8 = 0x80;
}

/// CIP object classes this driver's requests address
mod class {
    pub const MESSAGE_ROUTER: u8 = 0x02;
    pub const CONNECTION_MANAGER: u8 = 0x06;
    pub const IDENTITY: u8 = 0x01;
}

/// a scalar CIP data type, bit-exact on the wire (spec.md §4.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCode {
    Bool,
    Sint,
    Int,
    Dint,
    Real,
    Bits,
}

impl TypeCode {
    /// the wire code for this type, e.g. `0x00C4` for DINT
    pub fn code(self) -> u16 {
        match self {
            TypeCode::Bool => 0x00C1,
            TypeCode::Sint => 0x00C2,
            TypeCode::Int => 0x00C3,
            TypeCode::Dint => 0x00C4,
            TypeCode::Real => 0x00CA,
            TypeCode::Bits => 0x00D3,
        }
    }

    /// byte width of one element
    pub fn byte_width(self) -> usize {
        match self {
            TypeCode::Bool | TypeCode::Sint => 1,
            TypeCode::Int => 2,
            TypeCode::Dint | TypeCode::Real | TypeCode::Bits => 4,
        }
    }

    pub fn from_code(code: u16) -> Result<Self> {
        Ok(match code {
            0x00C1 => TypeCode::Bool,
            0x00C2 => TypeCode::Sint,
            0x00C3 => TypeCode::Int,
            0x00C4 => TypeCode::Dint,
            0x00CA => TypeCode::Real,
            0x00D3 => TypeCode::Bits,
            other => return Err(Error::Protocol(format!("unsupported CIP type code 0x{other:04X}"))),
        })
    }
}

/// read the element at `index` as a double, per its type's natural numeric interpretation
pub fn to_double(ty: TypeCode, raw: &[u8], index: usize) -> Result<f64> {
    let offset = index * ty.byte_width();
    Ok(match ty {
        TypeCode::Bool => (unpack_u8(raw, offset)? != 0) as u8 as f64,
        TypeCode::Sint => unpack_u8(raw, offset)? as i8 as f64,
        TypeCode::Int => unpack_u16(raw, offset)? as i16 as f64,
        TypeCode::Dint => unpack_u32(raw, offset)? as i32 as f64,
        TypeCode::Real => crate::codec::unpack_f32(raw, offset)? as f64,
        TypeCode::Bits => unpack_u32(raw, offset)? as f64,
    })
}

/// read the element at `index`, preserving its raw bit pattern widened into a `u32`
pub fn to_u32(ty: TypeCode, raw: &[u8], index: usize) -> Result<u32> {
    let offset = index * ty.byte_width();
    Ok(match ty {
        TypeCode::Bool | TypeCode::Sint => unpack_u8(raw, offset)? as u32,
        TypeCode::Int => unpack_u16(raw, offset)? as u32,
        TypeCode::Dint | TypeCode::Real | TypeCode::Bits => unpack_u32(raw, offset)?,
    })
}

/// write `value` into the element at `index`, per its type's natural numeric interpretation.
/// `raw` must already be sized to hold `(index + 1) * byte_width()` bytes.
pub fn from_double(ty: TypeCode, value: f64, raw: &mut [u8], index: usize) -> Result<()> {
    let offset = index * ty.byte_width();
    let width = ty.byte_width();
    let slot = raw
        .get_mut(offset..offset + width)
        .ok_or_else(|| Error::Protocol("element index out of bounds".into()))?;
    match ty {
        TypeCode::Bool => slot[0] = if value != 0.0 { 0xFF } else { 0x00 },
        TypeCode::Sint => slot[0] = (value as i64 as i8) as u8,
        TypeCode::Int => slot.copy_from_slice(&((value as i64 as i16) as u16).to_le_bytes()),
        TypeCode::Dint => slot.copy_from_slice(&((value as i64 as i32) as u32).to_le_bytes()),
        TypeCode::Real => slot.copy_from_slice(&(value as f32).to_le_bytes()),
        TypeCode::Bits => slot.copy_from_slice(&(value as i64 as u32).to_le_bytes()),
    }
    Ok(())
}

/// write the raw bit pattern `value` into the element at `index`, preserving bits for BITS/REAL
pub fn from_u32(ty: TypeCode, value: u32, raw: &mut [u8], index: usize) -> Result<()> {
    let offset = index * ty.byte_width();
    let width = ty.byte_width();
    let slot = raw
        .get_mut(offset..offset + width)
        .ok_or_else(|| Error::Protocol("element index out of bounds".into()))?;
    match ty {
        TypeCode::Bool | TypeCode::Sint => slot[0] = value as u8,
        TypeCode::Int => slot.copy_from_slice(&(value as u16).to_le_bytes()),
        TypeCode::Dint | TypeCode::Real | TypeCode::Bits => {
            slot.copy_from_slice(&value.to_le_bytes())
        }
    }
    Ok(())
}

/// build a Message Router request: `service(1) | path_size_words(1) | path | data`
pub fn build_mr_request(service: u8, path: &[u8], data: &[u8]) -> Vec<u8> {
    debug_assert_eq!(path.len() % 2, 0, "CIP paths are always an even number of bytes");
    let mut out = Vec::with_capacity(2 + path.len() + data.len());
    pack_u8(&mut out, service);
    pack_u8(&mut out, (path.len() / 2) as u8);
    out.extend_from_slice(path);
    out.extend_from_slice(data);
    out
}

/// a parsed Message Router response
#[derive(Debug, Clone)]
pub struct MrResponse<'a> {
    pub service: u8,
    pub general_status: u8,
    pub ext_status: &'a [u8],
    pub data: &'a [u8],
}

impl<'a> MrResponse<'a> {
    /// a response is ok iff `general_status == 0` (spec.md §4.3)
    pub fn is_ok(&self) -> bool {
        self.general_status == 0
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            let ext = if self.ext_status.len() >= 2 {
                Some(u16::from_le_bytes([self.ext_status[0], self.ext_status[1]]))
            } else {
                None
            };
            Err(Error::CipStatus {
                status: self.general_status,
                ext_status: ext,
            })
        }
    }
}

/// parse a Message Router response: `service|0x80 (1) | reserved (1) | general_status (1) |
/// ext_status_size_words (1) | ext_status[...] | data[...]`
pub fn parse_mr_response(bytes: &[u8]) -> Result<MrResponse<'_>> {
    if bytes.len() < 4 {
        return Err(Error::Protocol("MR response shorter than header".into()));
    }
    let service = bytes[0] & !service::RESPONSE_BIT;
    let general_status = bytes[2];
    let ext_words = bytes[3] as usize;
    let ext_start = 4;
    let ext_end = ext_start + ext_words * 2;
    let ext_status = bytes
        .get(ext_start..ext_end)
        .ok_or_else(|| Error::Protocol("MR response extended status truncated".into()))?;
    let data = &bytes[ext_end..];
    Ok(MrResponse {
        service,
        general_status,
        ext_status,
        data,
    })
}

/// `CIP_ReadData` request body: `u16 elements`
pub fn make_cip_read_data(path: &[u8], elements: u16) -> Vec<u8> {
    let mut data = Vec::new();
    pack_u16(&mut data, elements);
    build_mr_request(service::CIP_READ_DATA, path, &data)
}

/// `CIP_ReadData` response body: `u16 type_code | raw element bytes`
pub fn parse_cip_read_data(data: &[u8]) -> Result<(TypeCode, &[u8])> {
    let code = unpack_u16(data, 0)?;
    let ty = TypeCode::from_code(code)?;
    Ok((ty, &data[2..]))
}

/// `CIP_WriteData` request body: `u16 type_code | u16 elements | raw bytes`
pub fn make_cip_write_data(path: &[u8], ty: TypeCode, elements: u16, raw: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + raw.len());
    pack_u16(&mut data, ty.code());
    pack_u16(&mut data, elements);
    data.extend_from_slice(raw);
    build_mr_request(service::CIP_WRITE_DATA, path, &data)
}

/// total byte size of a `CIP_MultiRequest` packing `n` items whose combined byte size is
/// `total_item_bytes` (spec.md §4.3, P3)
pub fn multi_request_size(n: usize, total_item_bytes: usize) -> usize {
    2 * (n + 1) + total_item_bytes
}

/// incrementally packs a `CIP_MultiRequest`: `count | offset[0..N-1] | request bytes`.
/// items must be deposited in ascending index order via [`MultiRequestBuilder::item`].
pub struct MultiRequestBuilder {
    n: usize,
    offsets: Vec<u16>,
    data: Vec<u8>,
    next_offset: u16,
    next_index: usize,
}

impl MultiRequestBuilder {
    /// `prepare_multirequest(n)`
    pub fn new(n: usize) -> Self {
        let header_size = 2 * (n as u32 + 1);
        Self {
            n,
            offsets: vec![0; n],
            data: Vec::new(),
            next_offset: header_size as u16,
            next_index: 0,
        }
    }

    /// deposit the next item's bytes; items must be supplied in ascending index order
    pub fn item(&mut self, index: usize, bytes: &[u8]) {
        assert_eq!(
            index, self.next_index,
            "CIP_MultiRequest items must be deposited in ascending index order"
        );
        self.offsets[index] = self.next_offset;
        self.data.extend_from_slice(bytes);
        self.next_offset += bytes.len() as u16;
        self.next_index += 1;
    }

    /// offsets deposited so far, for testing/inspection
    pub fn offsets(&self) -> &[u16] {
        &self.offsets
    }

    /// finish packing; panics if fewer than `n` items were deposited
    pub fn finish(self) -> Vec<u8> {
        assert_eq!(self.next_index, self.n, "not all multi-request items were deposited");
        let mut out = Vec::with_capacity(self.next_offset as usize);
        pack_u16(&mut out, self.n as u16);
        for off in &self.offsets {
            pack_u16(&mut out, *off);
        }
        out.extend_from_slice(&self.data);
        out
    }
}

/// split a `CIP_MultiRequest` response body into its per-item slices, using the offset table the
/// same way the builder produced it (last item extends to the end of the data area)
pub fn parse_multi_response(data: &[u8]) -> Result<Vec<&[u8]>> {
    let count = unpack_u16(data, 0)? as usize;
    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        offsets.push(unpack_u16(data, 2 + 2 * i)? as usize);
    }
    let mut items = Vec::with_capacity(count);
    for i in 0..count {
        let start = offsets[i];
        let end = if i + 1 < count { offsets[i + 1] } else { data.len() };
        let slice = data
            .get(start..end)
            .ok_or_else(|| Error::Protocol("inconsistent MultiRequest offsets".into()))?;
        items.push(slice);
    }
    Ok(items)
}

/// CIP tick time: `tick_ms = 1 << tick_power`, `ticks = millis >> tick_power`, `ticks <= 255`
fn calc_tick_time(millis: u32) -> (u8, u8) {
    let mut tick_power = 0u8;
    let mut remaining = millis;
    while remaining > 0xFF {
        remaining >>= 1;
        tick_power += 1;
    }
    (tick_power, remaining as u8)
}

/// default connection timeout budget used to derive the CM_Unconnected_Send tick/ticks pair
pub const DEFAULT_CM_TIMEOUT_MS: u32 = 245_760;

/// wrap `inner` (a complete MR request) in a `CM_Unconnected_Send`, addressing the
/// ConnectionManager and routing to the message router over backplane port 1, link 0
pub fn make_cm_unconnected_send(inner: &[u8], timeout_ms: u32) -> Vec<u8> {
    let (tick_power, ticks) = calc_tick_time(timeout_ms);

    let cm_path = [0x20, class::CONNECTION_MANAGER, 0x24, 0x01];

    let mut data = Vec::new();
    pack_u8(&mut data, tick_power);
    pack_u8(&mut data, ticks);
    pack_u16(&mut data, inner.len() as u16);
    data.extend_from_slice(inner);
    if inner.len() % 2 != 0 {
        pack_u8(&mut data, 0x00);
    }

    // route path: port 1, link 0, then CIA path to the message router (class 0x02, instance 1)
    let route_path_size_words = 1 /* port/link */ + 2 /* CIA path words */;
    pack_u8(&mut data, route_path_size_words);
    pack_u8(&mut data, 0x00); // reserved
    pack_u8(&mut data, 0x01); // port 1 (backplane)
    pack_u8(&mut data, 0x00); // link 0
    data.push(0x20);
    data.push(class::MESSAGE_ROUTER);
    data.push(0x24);
    data.push(0x01);

    build_mr_request(service::CM_UNCONNECTED_SEND, &cm_path, &data)
}

/// build a `Get_Attribute_Single`/`Get_Attribute_All` request addressing `class`/`instance` and,
/// if non-zero, `attribute`
pub fn make_get_attribute(service: u8, cls: u8, instance: u8, attribute: u8) -> Vec<u8> {
    let mut path = vec![0x20, cls, 0x24, instance];
    if attribute != 0 {
        path.push(0x30);
        path.push(attribute);
    }
    build_mr_request(service, &path, &[])
}

/// class/instance used by the controller identity probe (spec.md §4.5 step 4)
pub const IDENTITY_CLASS: u8 = class::IDENTITY;
pub const IDENTITY_INSTANCE: u8 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s2_make_cip_read_and_parse_response() {
        let path = crate::tag_path::ParsedTag::parse("Tag1").unwrap().to_path_bytes();
        let req = make_cip_read_data(&path, 2);
        assert_eq!(req[0], service::CIP_READ_DATA);
        assert_eq!(&req[req.len() - 2..], &[0x02, 0x00]);

        let mut body = vec![0xC4, 0x00];
        pack_u32(&mut body, 1);
        pack_u32(&mut body, 2);
        let (ty, raw) = parse_cip_read_data(&body).unwrap();
        assert_eq!(ty, TypeCode::Dint);
        assert_eq!(to_double(ty, raw, 0).unwrap(), 1.0);
        assert_eq!(to_double(ty, raw, 1).unwrap(), 2.0);
    }

    #[test]
    fn s3_cm_unconnected_send_tick_and_route() {
        let inner = vec![0u8; 12];
        let req = make_cm_unconnected_send(&inner, DEFAULT_CM_TIMEOUT_MS);
        // route path is the last 6 bytes
        let route = &req[req.len() - 6..];
        assert_eq!(route, &[0x01, 0x00, 0x20, 0x02, 0x24, 0x01]);

        let (tick_power, ticks) = calc_tick_time(DEFAULT_CM_TIMEOUT_MS);
        let tick_ms = 1u32 << tick_power;
        assert!(tick_ms as u64 * ticks as u64 <= DEFAULT_CM_TIMEOUT_MS as u64);
        assert!(ticks <= 255);
    }

    #[test]
    fn p3_multi_request_layout() {
        let sizes = [10usize, 20, 7];
        let n = sizes.len();
        let mut builder = MultiRequestBuilder::new(n);
        for (i, &s) in sizes.iter().enumerate() {
            builder.item(i, &vec![0xAB; s]);
        }
        let offsets = builder.offsets().to_vec();
        let mut expected = 2 * (n + 1);
        for (i, off) in offsets.iter().enumerate() {
            assert_eq!(*off as usize, expected, "offset[{i}] mismatch");
            expected += sizes[i];
        }
        let total: usize = sizes.iter().sum();
        let bytes = builder.finish();
        assert_eq!(bytes.len(), multi_request_size(n, total));
    }

    #[test]
    fn multi_response_roundtrip() {
        let sizes = [4usize, 6, 2];
        let mut builder = MultiRequestBuilder::new(sizes.len());
        for (i, &s) in sizes.iter().enumerate() {
            builder.item(i, &vec![i as u8; s]);
        }
        let bytes = builder.finish();
        let items = parse_multi_response(&bytes).unwrap();
        assert_eq!(items.len(), sizes.len());
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.len(), sizes[i]);
            assert!(item.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn mr_response_ok_and_err() {
        let bytes = [0x8E, 0x00, 0x00, 0x00, 0xAA];
        let resp = parse_mr_response(&bytes).unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.data, &[0xAA]);

        let bytes = [0x8E, 0x00, 0x04, 0x01, 0x02, 0x00];
        let resp = parse_mr_response(&bytes).unwrap();
        assert!(!resp.is_ok());
        let err = resp.into_result().unwrap_err();
        match err {
            Error::CipStatus { status, ext_status } => {
                assert_eq!(status, 0x04);
                assert_eq!(ext_status, Some(0x0002));
            }
            _ => panic!("expected CipStatus"),
        }
    }

    #[test]
    fn type_code_widths() {
        assert_eq!(TypeCode::Bool.byte_width(), 1);
        assert_eq!(TypeCode::Sint.byte_width(), 1);
        assert_eq!(TypeCode::Int.byte_width(), 2);
        assert_eq!(TypeCode::Dint.byte_width(), 4);
        assert_eq!(TypeCode::Real.byte_width(), 4);
        assert_eq!(TypeCode::Bits.byte_width(), 4);
    }

    #[test]
    fn bits_preserves_bit_pattern() {
        let mut raw = vec![0u8; 4];
        from_u32(TypeCode::Bits, 0xFFFF_FFFF, &mut raw, 0).unwrap();
        assert_eq!(to_u32(TypeCode::Bits, &raw, 0).unwrap(), 0xFFFF_FFFF);
    }
}
