// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! BER subset codec for SNMP.
//!
//! Encodes and decodes exactly the types SNMP messages use: INTEGER,
//! OCTET STRING, NULL, OBJECT IDENTIFIER, SEQUENCE, the SNMP application
//! types (IpAddress, Counter32, Gauge32, TimeTicks, Opaque, Counter64),
//! the v2c exception markers, and the PDU tags. Definite-length forms
//! only, as SNMP requires.

use std::fmt;

/// PDU tag: GetRequest
pub const PDU_GET: u8 = 0xA0;
/// PDU tag: GetNextRequest
pub const PDU_GET_NEXT: u8 = 0xA1;
/// PDU tag: Response
pub const PDU_RESPONSE: u8 = 0xA2;
/// PDU tag: GetBulkRequest (v2c/v3)
pub const PDU_GET_BULK: u8 = 0xA5;
/// PDU tag: Report (v3)
pub const PDU_REPORT: u8 = 0xA8;

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_IP_ADDRESS: u8 = 0x40;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIME_TICKS: u8 = 0x43;
const TAG_OPAQUE: u8 = 0x44;
const TAG_COUNTER64: u8 = 0x46;
const TAG_NO_SUCH_OBJECT: u8 = 0x80;
const TAG_NO_SUCH_INSTANCE: u8 = 0x81;
const TAG_END_OF_MIB_VIEW: u8 = 0x82;

/// BER decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BerError {
    Truncated,
    UnexpectedTag { expected: u8, found: u8 },
    UnsupportedTag(u8),
    InvalidLength,
    InvalidOid,
}

impl fmt::Display for BerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated message"),
            Self::UnexpectedTag { expected, found } => {
                write!(f, "expected tag {expected:#04x}, found {found:#04x}")
            }
            Self::UnsupportedTag(tag) => write!(f, "unsupported tag {tag:#04x}"),
            Self::InvalidLength => write!(f, "invalid length"),
            Self::InvalidOid => write!(f, "invalid object identifier"),
        }
    }
}

impl std::error::Error for BerError {}

/// Object identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(pub Vec<u32>);

impl Oid {
    /// Parse a dotted string, e.g. `"1.3.6.1.2.1.1.1.0"`.
    pub fn parse(text: &str) -> Result<Self, BerError> {
        let arcs: Result<Vec<u32>, _> = text.split('.').map(str::parse).collect();
        match arcs {
            Ok(arcs) if arcs.len() >= 2 => Ok(Self(arcs)),
            _ => Err(BerError::InvalidOid),
        }
    }

    /// Is `self` inside the subtree rooted at `base`?
    pub fn starts_with(&self, base: &Oid) -> bool {
        self.0.len() >= base.0.len() && self.0[..base.0.len()] == base.0[..]
    }

    /// Final arc, commonly the table row index.
    pub fn last_arc(&self) -> Option<u32> {
        self.0.last().copied()
    }

    /// Child OID with one more arc.
    pub fn child(&self, arc: u32) -> Self {
        let mut arcs = self.0.clone();
        arcs.push(arc);
        Self(arcs)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arc in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{arc}")?;
            first = false;
        }
        Ok(())
    }
}

/// SNMP value
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Integer(i64),
    OctetString(Vec<u8>),
    Null,
    Oid(Oid),
    IpAddress([u8; 4]),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Opaque(Vec<u8>),
    Counter64(u64),
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
}

impl SnmpValue {
    /// Unsigned numeric view of counter-ish values.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Integer(v) if *v >= 0 => Some(*v as u64),
            Self::Counter32(v) | Self::Gauge32(v) | Self::TimeTicks(v) => Some(u64::from(*v)),
            Self::Counter64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::Counter32(v) | Self::Gauge32(v) | Self::TimeTicks(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Lossy text view of octet strings.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::OctetString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    pub fn is_exception(&self) -> bool {
        matches!(
            self,
            Self::NoSuchObject | Self::NoSuchInstance | Self::EndOfMibView
        )
    }
}

/// One PDU (request or response)
#[derive(Debug, Clone)]
pub struct Pdu {
    pub pdu_type: u8,
    pub request_id: i32,
    /// For GetBulk requests this field carries non-repeaters.
    pub error_status: i32,
    /// For GetBulk requests this field carries max-repetitions.
    pub error_index: i32,
    pub varbinds: Vec<(Oid, SnmpValue)>,
}

impl Pdu {
    pub fn get(request_id: i32, oids: &[Oid]) -> Self {
        Self {
            pdu_type: PDU_GET,
            request_id,
            error_status: 0,
            error_index: 0,
            varbinds: oids.iter().map(|oid| (oid.clone(), SnmpValue::Null)).collect(),
        }
    }

    pub fn get_next(request_id: i32, oid: &Oid) -> Self {
        Self {
            pdu_type: PDU_GET_NEXT,
            request_id,
            error_status: 0,
            error_index: 0,
            varbinds: vec![(oid.clone(), SnmpValue::Null)],
        }
    }
}

// --- encoding ---

/// TLV with the given tag.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(tag);
    encode_length(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

/// Encoded INTEGER (minimal two's complement).
pub fn encode_integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let cur = bytes[start];
        let next = bytes[start + 1];
        // Drop redundant sign bytes.
        if (cur == 0x00 && next & 0x80 == 0) || (cur == 0xFF && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    tlv(TAG_INTEGER, &bytes[start..])
}

/// Encoded unsigned value under an application tag (Counter64 and friends).
fn encode_unsigned(tag: u8, value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes
        .iter()
        .take_while(|&&b| b == 0)
        .count()
        .min(bytes.len() - 1);
    let mut content = Vec::new();
    // A leading 1-bit needs a zero pad to stay non-negative.
    if bytes[skip] & 0x80 != 0 {
        content.push(0);
    }
    content.extend_from_slice(&bytes[skip..]);
    tlv(tag, &content)
}

pub fn encode_octet_string(bytes: &[u8]) -> Vec<u8> {
    tlv(TAG_OCTET_STRING, bytes)
}

pub fn encode_null() -> Vec<u8> {
    tlv(TAG_NULL, &[])
}

pub fn encode_sequence(content: &[u8]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, content)
}

pub fn encode_oid(oid: &Oid) -> Result<Vec<u8>, BerError> {
    let arcs = &oid.0;
    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] > 39) {
        return Err(BerError::InvalidOid);
    }
    let mut content = Vec::new();
    encode_base128(arcs[0] * 40 + arcs[1], &mut content);
    for &arc in &arcs[2..] {
        encode_base128(arc, &mut content);
    }
    Ok(tlv(TAG_OID, &content))
}

fn encode_base128(mut value: u32, out: &mut Vec<u8>) {
    let mut stack = [0u8; 5];
    let mut n = 0;
    loop {
        stack[n] = (value & 0x7F) as u8;
        value >>= 7;
        n += 1;
        if value == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let mut byte = stack[i];
        if i != 0 {
            byte |= 0x80;
        }
        out.push(byte);
    }
}

pub fn encode_value(value: &SnmpValue) -> Result<Vec<u8>, BerError> {
    Ok(match value {
        SnmpValue::Integer(v) => encode_integer(*v),
        SnmpValue::OctetString(bytes) => encode_octet_string(bytes),
        SnmpValue::Null => encode_null(),
        SnmpValue::Oid(oid) => encode_oid(oid)?,
        SnmpValue::IpAddress(octets) => tlv(TAG_IP_ADDRESS, octets),
        SnmpValue::Counter32(v) => encode_unsigned(TAG_COUNTER32, u64::from(*v)),
        SnmpValue::Gauge32(v) => encode_unsigned(TAG_GAUGE32, u64::from(*v)),
        SnmpValue::TimeTicks(v) => encode_unsigned(TAG_TIME_TICKS, u64::from(*v)),
        SnmpValue::Opaque(bytes) => tlv(TAG_OPAQUE, bytes),
        SnmpValue::Counter64(v) => encode_unsigned(TAG_COUNTER64, *v),
        SnmpValue::NoSuchObject => tlv(TAG_NO_SUCH_OBJECT, &[]),
        SnmpValue::NoSuchInstance => tlv(TAG_NO_SUCH_INSTANCE, &[]),
        SnmpValue::EndOfMibView => tlv(TAG_END_OF_MIB_VIEW, &[]),
    })
}

/// Encoded PDU TLV.
pub fn encode_pdu(pdu: &Pdu) -> Result<Vec<u8>, BerError> {
    let mut varbinds = Vec::new();
    for (oid, value) in &pdu.varbinds {
        let mut bind = encode_oid(oid)?;
        bind.extend_from_slice(&encode_value(value)?);
        varbinds.extend_from_slice(&encode_sequence(&bind));
    }

    let mut content = encode_integer(i64::from(pdu.request_id));
    content.extend_from_slice(&encode_integer(i64::from(pdu.error_status)));
    content.extend_from_slice(&encode_integer(i64::from(pdu.error_index)));
    content.extend_from_slice(&encode_sequence(&varbinds));
    Ok(tlv(pdu.pdu_type, &content))
}

/// Whole v1/v2c message.
pub fn encode_community_message(
    version: i64,
    community: &str,
    pdu: &Pdu,
) -> Result<Vec<u8>, BerError> {
    let mut content = encode_integer(version);
    content.extend_from_slice(&encode_octet_string(community.as_bytes()));
    content.extend_from_slice(&encode_pdu(pdu)?);
    Ok(encode_sequence(&content))
}

// --- decoding ---

/// Cursor over BER bytes.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BerError> {
        if self.pos + n > self.data.len() {
            return Err(BerError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Tag of the next TLV without consuming it.
    pub fn peek_tag(&self) -> Result<u8, BerError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BerError::Truncated)
    }

    /// Read one TLV, returning its tag and content.
    pub fn read_tlv(&mut self) -> Result<(u8, &'a [u8]), BerError> {
        let tag = self.take(1)?[0];
        let first = self.take(1)?[0];
        let len = if first & 0x80 == 0 {
            usize::from(first)
        } else {
            let n = usize::from(first & 0x7F);
            if n == 0 || n > 8 {
                return Err(BerError::InvalidLength);
            }
            let mut value: usize = 0;
            for &b in self.take(n)? {
                value = value
                    .checked_mul(256)
                    .ok_or(BerError::InvalidLength)?
                    + usize::from(b);
            }
            value
        };
        Ok((tag, self.take(len)?))
    }

    pub fn expect(&mut self, expected: u8) -> Result<&'a [u8], BerError> {
        let (tag, content) = self.read_tlv()?;
        if tag != expected {
            return Err(BerError::UnexpectedTag {
                expected,
                found: tag,
            });
        }
        Ok(content)
    }

    pub fn read_integer(&mut self) -> Result<i64, BerError> {
        let content = self.expect(TAG_INTEGER)?;
        decode_integer_content(content)
    }

    pub fn read_octet_string(&mut self) -> Result<&'a [u8], BerError> {
        self.expect(TAG_OCTET_STRING)
    }

    pub fn read_sequence(&mut self) -> Result<Reader<'a>, BerError> {
        Ok(Reader::new(self.expect(TAG_SEQUENCE)?))
    }
}

fn decode_integer_content(content: &[u8]) -> Result<i64, BerError> {
    if content.is_empty() || content.len() > 8 {
        return Err(BerError::InvalidLength);
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in content {
        value = (value << 8) | i64::from(b);
    }
    Ok(value)
}

fn decode_unsigned_content(content: &[u8]) -> Result<u64, BerError> {
    let content = if content.first() == Some(&0) && content.len() > 1 {
        &content[1..]
    } else {
        content
    };
    if content.len() > 8 {
        return Err(BerError::InvalidLength);
    }
    let mut value: u64 = 0;
    for &b in content {
        value = (value << 8) | u64::from(b);
    }
    Ok(value)
}

fn decode_oid_content(content: &[u8]) -> Result<Oid, BerError> {
    if content.is_empty() {
        return Err(BerError::InvalidOid);
    }
    let mut arcs = Vec::new();
    let mut value: u32 = 0;
    let mut first_arc = true;
    for &b in content {
        value = value.checked_mul(128).ok_or(BerError::InvalidOid)? + u32::from(b & 0x7F);
        if b & 0x80 == 0 {
            if first_arc {
                arcs.push((value / 40).min(2));
                arcs.push(value - arcs[0] * 40);
                first_arc = false;
            } else {
                arcs.push(value);
            }
            value = 0;
        }
    }
    if first_arc {
        return Err(BerError::InvalidOid);
    }
    Ok(Oid(arcs))
}

/// Decode one value TLV.
pub fn decode_value(tag: u8, content: &[u8]) -> Result<SnmpValue, BerError> {
    Ok(match tag {
        TAG_INTEGER => SnmpValue::Integer(decode_integer_content(content)?),
        TAG_OCTET_STRING => SnmpValue::OctetString(content.to_vec()),
        TAG_NULL => SnmpValue::Null,
        TAG_OID => SnmpValue::Oid(decode_oid_content(content)?),
        TAG_IP_ADDRESS => {
            if content.len() != 4 {
                return Err(BerError::InvalidLength);
            }
            SnmpValue::IpAddress([content[0], content[1], content[2], content[3]])
        }
        TAG_COUNTER32 => SnmpValue::Counter32(decode_unsigned_content(content)? as u32),
        TAG_GAUGE32 => SnmpValue::Gauge32(decode_unsigned_content(content)? as u32),
        TAG_TIME_TICKS => SnmpValue::TimeTicks(decode_unsigned_content(content)? as u32),
        TAG_OPAQUE => SnmpValue::Opaque(content.to_vec()),
        TAG_COUNTER64 => SnmpValue::Counter64(decode_unsigned_content(content)?),
        TAG_NO_SUCH_OBJECT => SnmpValue::NoSuchObject,
        TAG_NO_SUCH_INSTANCE => SnmpValue::NoSuchInstance,
        TAG_END_OF_MIB_VIEW => SnmpValue::EndOfMibView,
        other => return Err(BerError::UnsupportedTag(other)),
    })
}

/// Decode a PDU TLV (any request/response/report tag).
pub fn decode_pdu(reader: &mut Reader<'_>) -> Result<Pdu, BerError> {
    let (tag, content) = reader.read_tlv()?;
    if tag & 0xE0 != 0xA0 {
        return Err(BerError::UnsupportedTag(tag));
    }
    let mut inner = Reader::new(content);
    let request_id = inner.read_integer()? as i32;
    let error_status = inner.read_integer()? as i32;
    let error_index = inner.read_integer()? as i32;

    let mut varbinds = Vec::new();
    let mut binds = inner.read_sequence()?;
    while !binds.is_empty() {
        let mut bind = binds.read_sequence()?;
        let oid_content = bind.expect(TAG_OID)?;
        let oid = decode_oid_content(oid_content)?;
        let (value_tag, value_content) = bind.read_tlv()?;
        varbinds.push((oid, decode_value(value_tag, value_content)?));
    }

    Ok(Pdu {
        pdu_type: tag,
        request_id,
        error_status,
        error_index,
        varbinds,
    })
}

/// Decode a whole v1/v2c message into (version, community, PDU).
pub fn decode_community_message(data: &[u8]) -> Result<(i64, String, Pdu), BerError> {
    let mut reader = Reader::new(data);
    let mut message = reader.read_sequence()?;
    let version = message.read_integer()?;
    let community = String::from_utf8_lossy(message.read_octet_string()?).into_owned();
    let pdu = decode_pdu(&mut message)?;
    Ok((version, community, pdu))
}
