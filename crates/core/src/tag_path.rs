//! parse dotted/indexed symbolic tags and emit the byte-level CIP routing path
//!
//! grammar: `name ( '.' name | '[' uint32 ']' )*` — a tag always starts with a name segment and
//! is never empty. this is deliberately narrower than the ANSI-segment grammar a full CIP client
//! supports (no bit access, no multi-dimensional `[i,j,k]`, no `Program:` scoping, no string
//! `.LEN`/`.DATA[n]`) — those are exactly the things `spec.md` doesn't ask this driver to speak.

use crate::error::{Error, Result};
use std::fmt;

/// one element of a [`ParsedTag`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// a symbolic name, 1..=255 ASCII bytes
    Name(String),
    /// an array index, 0..=u32::MAX
    Index(u32),
}

/// an ordered, immutable sequence of path segments. always starts with a [`Segment::Name`] and
/// is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTag {
    segments: Vec<Segment>,
}

impl ParsedTag {
    /// parse `symbolic` per the grammar above
    pub fn parse(symbolic: &str) -> Result<Self> {
        let bytes = symbolic.as_bytes();
        if !symbolic.is_ascii() {
            return Err(Error::Parse(format!("tag is not ASCII: {symbolic}")));
        }

        let mut segments = Vec::new();
        let mut pos = 0usize;

        let (name, next) = parse_name(bytes, pos)?;
        segments.push(Segment::Name(name));
        pos = next;

        while pos < bytes.len() {
            match bytes[pos] {
                b'.' => {
                    let (name, next) = parse_name(bytes, pos + 1)?;
                    segments.push(Segment::Name(name));
                    pos = next;
                }
                b'[' => {
                    let (index, next) = parse_index(bytes, pos + 1)?;
                    segments.push(Segment::Index(index));
                    pos = next;
                }
                other => {
                    return Err(Error::Parse(format!(
                        "unexpected character '{}' at byte {pos}",
                        other as char
                    )))
                }
            }
        }

        Ok(Self { segments })
    }

    /// the parsed segments, in order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// emit the wire path bytes described in spec.md §4.2
    pub fn to_path_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for seg in &self.segments {
            match seg {
                Segment::Name(name) => {
                    out.push(0x91);
                    out.push(name.len() as u8);
                    out.extend_from_slice(name.as_bytes());
                    if name.len() % 2 != 0 {
                        out.push(0x00);
                    }
                }
                Segment::Index(index) => encode_index(*index, &mut out),
            }
        }
        out
    }

    /// path length in 16-bit words, as carried in the CIP message's `path_size_words` field
    pub fn path_size_words(&self) -> u8 {
        (self.to_path_bytes().len() / 2) as u8
    }

    /// re-parse a wire path back into a [`ParsedTag`] (used by [`ParsedTag::parse`]'s round-trip
    /// property test; the worker never needs to decode a path it didn't just build)
    pub fn from_path_bytes(path: &[u8]) -> Result<Self> {
        let mut segments = Vec::new();
        let mut pos = 0usize;
        while pos < path.len() {
            match path[pos] {
                0x91 => {
                    let len = *path
                        .get(pos + 1)
                        .ok_or_else(|| Error::Protocol("truncated name segment".into()))?
                        as usize;
                    let start = pos + 2;
                    let end = start + len;
                    let name_bytes = path
                        .get(start..end)
                        .ok_or_else(|| Error::Protocol("truncated name segment".into()))?;
                    let name = std::str::from_utf8(name_bytes)
                        .map_err(|_| Error::Protocol("non-UTF8 name segment".into()))?
                        .to_owned();
                    segments.push(Segment::Name(name));
                    pos = end + (len % 2);
                }
                0x28 => {
                    let v = *path
                        .get(pos + 1)
                        .ok_or_else(|| Error::Protocol("truncated index segment".into()))?;
                    segments.push(Segment::Index(v as u32));
                    pos += 2;
                }
                0x29 => {
                    let s = path
                        .get(pos + 2..pos + 4)
                        .ok_or_else(|| Error::Protocol("truncated index segment".into()))?;
                    let v = u16::from_le_bytes([s[0], s[1]]);
                    segments.push(Segment::Index(v as u32));
                    pos += 4;
                }
                0x2A => {
                    let s = path
                        .get(pos + 2..pos + 6)
                        .ok_or_else(|| Error::Protocol("truncated index segment".into()))?;
                    let v = u32::from_le_bytes([s[0], s[1], s[2], s[3]]);
                    segments.push(Segment::Index(v));
                    pos += 6;
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unrecognized path segment type 0x{other:02X}"
                    )))
                }
            }
        }
        if segments.is_empty() || !matches!(segments[0], Segment::Name(_)) {
            return Err(Error::Protocol("path does not start with a name segment".into()));
        }
        Ok(Self { segments })
    }
}

impl fmt::Display for ParsedTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                Segment::Name(name) => {
                    if i == 0 {
                        write!(f, "{name}")?;
                    } else {
                        write!(f, ".{name}")?;
                    }
                }
                Segment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

fn encode_index(index: u32, out: &mut Vec<u8>) {
    if index <= 0xFF {
        out.push(0x28);
        out.push(index as u8);
    } else if index <= 0xFFFF {
        out.push(0x29);
        out.push(0x00);
        out.push((index & 0xFF) as u8);
        out.push((index >> 8) as u8);
    } else {
        out.push(0x2A);
        out.push(0x00);
        out.push((index & 0xFF) as u8);
        out.push(((index >> 8) & 0xFF) as u8);
        out.push(((index >> 16) & 0xFF) as u8);
        out.push(((index >> 24) & 0xFF) as u8);
    }
}

fn parse_name(bytes: &[u8], start: usize) -> Result<(String, usize)> {
    let mut end = start;
    while end < bytes.len() && is_name_byte(bytes[end]) {
        end += 1;
    }
    if end == start {
        return Err(Error::Parse(format!("expected a name at byte {start}")));
    }
    if end - start > 255 {
        return Err(Error::Parse("name segment longer than 255 bytes".into()));
    }
    let name = std::str::from_utf8(&bytes[start..end])
        .expect("already validated ASCII")
        .to_owned();
    Ok((name, end))
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b':'
}

fn parse_index(bytes: &[u8], start: usize) -> Result<(u32, usize)> {
    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == start {
        return Err(Error::Parse(format!("expected a digit at byte {start}")));
    }
    if bytes.get(end) != Some(&b']') {
        return Err(Error::Parse("unterminated '['".into()));
    }
    let digits = std::str::from_utf8(&bytes[start..end]).expect("already validated ASCII");
    let value: u32 = digits
        .parse()
        .map_err(|_| Error::Parse(format!("index out of range: {digits}")))?;
    Ok((value, end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_parse_and_encode() {
        let tag = ParsedTag::parse("Fred.Barney[5].Wilma").unwrap();
        assert_eq!(
            tag.segments(),
            &[
                Segment::Name("Fred".into()),
                Segment::Name("Barney".into()),
                Segment::Index(5),
                Segment::Name("Wilma".into()),
            ]
        );
        let path = tag.to_path_bytes();
        let expected: Vec<u8> = vec![
            0x91, 0x04, b'F', b'r', b'e', b'd', 0x91, 0x06, b'B', b'a', b'r', b'n', b'e', b'y',
            0x28, 0x05, 0x91, 0x05, b'W', b'i', b'l', b'm', b'a', 0x00,
        ];
        assert_eq!(path, expected);
    }

    #[test]
    fn rejects_empty_tag() {
        assert!(ParsedTag::parse("").is_err());
    }

    #[test]
    fn rejects_unterminated_index() {
        assert!(ParsedTag::parse("MyArray[5").is_err());
    }

    #[test]
    fn rejects_trailing_dot() {
        assert!(ParsedTag::parse("MyTag.").is_err());
    }

    #[test]
    fn rejects_leading_index() {
        assert!(ParsedTag::parse("[5]").is_err());
    }

    #[test]
    fn p1_path_round_trip() {
        for idx in [0u32, 255, 256, 65535, 65536, u32::MAX] {
            let text = format!("Tag1[{idx}]");
            let tag = ParsedTag::parse(&text).unwrap();
            let bytes = tag.to_path_bytes();
            let back = ParsedTag::from_path_bytes(&bytes).unwrap();
            assert_eq!(tag, back);
        }
    }

    #[test]
    fn index_width_thresholds() {
        assert_eq!(ParsedTag::parse("T[255]").unwrap().to_path_bytes()[2..], [0x28, 0xFF]);
        let p = ParsedTag::parse("T[256]").unwrap().to_path_bytes();
        assert_eq!(&p[2..], &[0x29, 0x00, 0x00, 0x01]);
        let p = ParsedTag::parse("T[65536]").unwrap().to_path_bytes();
        assert_eq!(&p[2..], &[0x2A, 0x00, 0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn display_matches_input_shape() {
        let tag = ParsedTag::parse("Fred.Barney[5].Wilma").unwrap();
        assert_eq!(tag.to_string(), "Fred.Barney[5].Wilma");
    }
}
