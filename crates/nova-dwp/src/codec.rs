use crate::error::{DwpError, Result};
use crate::types::{tag, FixedArray, ObjectTag, Value, ValueTypeValue};

pub const HANDSHAKE: &[u8] = b"DWP-Handshake";
pub const HEADER_LEN: usize = 11;
pub const FLAG_REPLY: u8 = 0x80;

/// Default upper bound for an inbound packet (header included).
pub const MAX_PACKET_BYTES: usize = 64 * 1024 * 1024;

/// Valuetypes nested deeper than this are treated as a corrupt stream.
pub const MAX_VALUE_DEPTH: usize = 64;

/// The fixed 11-byte packet header.
///
/// For replies the last two bytes carry the status code instead of the
/// command-set/command pair; see [`PacketHeader::error_code`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: u32,
    pub id: u32,
    pub flags: u8,
    pub command_set: u8,
    pub command: u8,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.length.to_be_bytes());
        out[4..8].copy_from_slice(&self.id.to_be_bytes());
        out[8] = self.flags;
        out[9] = self.command_set;
        out[10] = self.command;
        out
    }

    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        Self {
            length: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            id: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            flags: bytes[8],
            command_set: bytes[9],
            command: bytes[10],
        }
    }

    pub fn is_reply(&self) -> bool {
        self.flags & FLAG_REPLY != 0
    }

    pub fn error_code(&self) -> u16 {
        u16::from_be_bytes([self.command_set, self.command])
    }

    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_LEN)
    }
}

/// Reject length prefixes that cannot describe a valid packet before any
/// payload buffer is allocated.
pub fn validate_packet_length(length: usize, max: usize) -> Result<()> {
    if length < HEADER_LEN {
        return Err(DwpError::Protocol(format!("invalid packet length {length}")));
    }
    if length > max {
        return Err(DwpError::Protocol(format!(
            "packet length {length} exceeds maximum allowed ({max} bytes); refusing to allocate"
        )));
    }
    Ok(())
}

/// A fully framed inbound packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Reply {
        id: u32,
        error_code: u16,
        payload: Vec<u8>,
    },
    Command {
        id: u32,
        command_set: u8,
        command: u8,
        payload: Vec<u8>,
    },
}

impl Packet {
    pub fn from_parts(header: PacketHeader, payload: Vec<u8>) -> Self {
        if header.is_reply() {
            Packet::Reply {
                id: header.id,
                error_code: header.error_code(),
                payload,
            }
        } else {
            Packet::Command {
                id: header.id,
                command_set: header.command_set,
                command: header.command,
                payload,
            }
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Packet::Reply { id, .. } | Packet::Command { id, .. } => *id,
        }
    }
}

/// Decode exactly one packet from `bytes`.
///
/// Trailing bytes after the packet are an error. Used by the fuzz targets;
/// never panics on arbitrary input.
pub fn decode_packet_bytes(bytes: &[u8]) -> Result<Packet> {
    let header: &[u8; HEADER_LEN] = bytes
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| DwpError::Protocol("truncated packet header".to_string()))?;
    let header = PacketHeader::decode(header);
    validate_packet_length(header.length as usize, MAX_PACKET_BYTES)?;
    if header.length as usize != bytes.len() {
        return Err(DwpError::Protocol(format!(
            "packet length {} does not match buffer length {}",
            header.length,
            bytes.len()
        )));
    }
    Ok(Packet::from_parts(header, bytes[HEADER_LEN..].to_vec()))
}

/// Decode a single tagged value spanning all of `bytes`.
pub fn decode_value_bytes(bytes: &[u8]) -> Result<Value> {
    let mut r = DwpReader::new(bytes);
    let value = r.read_value()?;
    r.finish()?;
    Ok(value)
}

pub fn encode_command(id: u32, command_set: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(
        &PacketHeader {
            length,
            id,
            flags: 0,
            command_set,
            command,
        }
        .encode(),
    );
    out.extend_from_slice(payload);
    out
}

pub fn encode_reply(id: u32, error_code: u16, payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_LEN + payload.len()) as u32;
    let [hi, lo] = error_code.to_be_bytes();
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(
        &PacketHeader {
            length,
            id,
            flags: FLAG_REPLY,
            command_set: hi,
            command: lo,
        }
        .encode(),
    );
    out.extend_from_slice(payload);
    out
}

/// Big-endian payload builder.
///
/// Length and count prefixes are cast without checks. `Connection` refuses
/// payloads larger than its packet limit, which is capped below `i32::MAX`,
/// so a prefix that would overflow never reaches the wire.
#[derive(Default)]
pub struct DwpWriter {
    buf: Vec<u8>,
}

impl DwpWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_id(&mut self, id: u32) {
        self.write_u32(id);
    }

    pub fn write_ids(&mut self, ids: &[u32]) {
        self.write_i32(ids.len() as i32);
        for id in ids {
            self.write_id(*id);
        }
    }

    /// UTF-8 string with a `u32` byte-length prefix.
    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// UTF-16 string with a `u32` code-unit-count prefix.
    pub fn write_utf16_string(&mut self, s: &str) {
        let units: Vec<u16> = s.encode_utf16().collect();
        self.write_u32(units.len() as u32);
        for unit in units {
            self.write_u16(unit);
        }
    }

    /// Byte blob with a `u32` length prefix.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a tagged value.
    pub fn write_value(&mut self, v: &Value) {
        self.write_u8(v.element_tag());
        match v {
            Value::Void | Value::Null => {}
            Value::Boolean(v) => self.write_i32(i32::from(*v)),
            Value::Char(v) => self.write_i32(i32::from(*v)),
            Value::I1(v) => self.write_i32(i32::from(*v)),
            Value::U1(v) => self.write_i32(i32::from(*v)),
            Value::I2(v) => self.write_i32(i32::from(*v)),
            Value::U2(v) => self.write_i32(i32::from(*v)),
            Value::I4(v) => self.write_i32(*v),
            Value::U4(v) => self.write_u32(*v),
            Value::I8(v) | Value::IntPtr(v) => self.write_i64(*v),
            Value::U8(v) | Value::UIntPtr(v) | Value::Pointer(v) => self.write_u64(*v),
            Value::R4(v) => self.write_f32(*v),
            Value::R8(v) => self.write_f64(*v),
            Value::Object { id, .. } => self.write_id(*id),
            Value::ValueType(vt) => {
                self.write_bool(vt.is_enum);
                self.write_id(vt.type_id);
                self.write_i32(vt.fields.len() as i32);
                for field in &vt.fields {
                    self.write_value(field);
                }
            }
            Value::Type(id) => self.write_id(*id),
            Value::ParentValueType { index } => self.write_i32(*index),
            Value::FixedArray(array) => self.write_fixed_array(array),
        }
    }

    pub fn write_values(&mut self, values: &[Value]) {
        self.write_i32(values.len() as i32);
        for v in values {
            self.write_value(v);
        }
    }

    fn write_fixed_array(&mut self, array: &FixedArray) {
        self.write_u8(array.element_tag());
        self.write_i32(array.len() as i32);
        match array {
            FixedArray::Boolean(v) => v.iter().for_each(|x| self.write_i32(i32::from(*x))),
            FixedArray::Char(v) => v.iter().for_each(|x| self.write_i32(i32::from(*x))),
            FixedArray::I1(v) => v.iter().for_each(|x| self.write_i32(i32::from(*x))),
            FixedArray::U1(v) => v.iter().for_each(|x| self.write_i32(i32::from(*x))),
            FixedArray::I2(v) => v.iter().for_each(|x| self.write_i32(i32::from(*x))),
            FixedArray::U2(v) => v.iter().for_each(|x| self.write_i32(i32::from(*x))),
            FixedArray::I4(v) => v.iter().for_each(|x| self.write_i32(*x)),
            FixedArray::U4(v) => v.iter().for_each(|x| self.write_u32(*x)),
            FixedArray::I8(v) => v.iter().for_each(|x| self.write_i64(*x)),
            FixedArray::U8(v) => v.iter().for_each(|x| self.write_u64(*x)),
            FixedArray::R4(v) => v.iter().for_each(|x| self.write_f32(*x)),
            FixedArray::R8(v) => v.iter().for_each(|x| self.write_f64(*x)),
        }
    }
}

pub struct DwpReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DwpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn require(&self, n: usize) -> Result<()> {
        match self.pos.checked_add(n) {
            Some(end) if end <= self.buf.len() => Ok(()),
            _ => Err(DwpError::Protocol(format!(
                "buffer underflow: need {n} bytes at {}, have {}",
                self.pos,
                self.buf.len()
            ))),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.require(n)?;
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Fail if unread bytes remain.
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(DwpError::Protocol(format!(
                "{} trailing bytes after decode",
                self.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_be_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.take_array()?))
    }

    pub fn read_id(&mut self) -> Result<u32> {
        self.read_u32()
    }

    /// Read an `i32` element count, rejecting negative counts.
    pub fn read_count(&mut self) -> Result<usize> {
        let n = self.read_i32()?;
        usize::try_from(n).map_err(|_| DwpError::Protocol(format!("negative count {n}")))
    }

    pub fn read_ids(&mut self) -> Result<Vec<u32>> {
        let count = self.read_count()?;
        self.require(count.saturating_mul(4))?;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.read_id()?);
        }
        Ok(ids)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        let mut out = Vec::new();
        out.try_reserve_exact(len).map_err(|_| {
            DwpError::Protocol(format!("unable to allocate string buffer ({len} bytes)"))
        })?;
        out.extend_from_slice(bytes);
        String::from_utf8(out).map_err(|e| DwpError::Protocol(format!("invalid utf-8 string: {e}")))
    }

    pub fn read_strings(&mut self) -> Result<Vec<String>> {
        let count = self.read_count()?;
        let mut out = Vec::with_capacity(count.min(self.remaining() / 4));
        for _ in 0..count {
            out.push(self.read_string()?);
        }
        Ok(out)
    }

    pub fn read_utf16_string(&mut self) -> Result<String> {
        let units = self.read_u32()? as usize;
        let bytes = self.take(units.saturating_mul(2))?;
        let code_units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&code_units)
            .map_err(|e| DwpError::Protocol(format!("invalid utf-16 string: {e}")))
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Read a tagged value.
    pub fn read_value(&mut self) -> Result<Value> {
        self.read_value_at_depth(0)
    }

    pub fn read_values(&mut self) -> Result<Vec<Value>> {
        let count = self.read_count()?;
        self.read_n_values(count)
    }

    pub fn read_n_values(&mut self, count: usize) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            values.push(self.read_value()?);
        }
        Ok(values)
    }

    fn read_value_at_depth(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_VALUE_DEPTH {
            return Err(DwpError::Protocol(format!(
                "valuetype nesting exceeds {MAX_VALUE_DEPTH} levels"
            )));
        }

        let tag = self.read_u8()?;
        let v = match tag {
            tag::VOID => Value::Void,
            tag::BOOLEAN => Value::Boolean(self.read_i32()? != 0),
            tag::CHAR => Value::Char(self.read_i32()? as u16),
            tag::I1 => Value::I1(self.read_i32()? as i8),
            tag::U1 => Value::U1(self.read_i32()? as u8),
            tag::I2 => Value::I2(self.read_i32()? as i16),
            tag::U2 => Value::U2(self.read_i32()? as u16),
            tag::I4 => Value::I4(self.read_i32()?),
            tag::U4 => Value::U4(self.read_u32()?),
            tag::I8 => Value::I8(self.read_i64()?),
            tag::U8 => Value::U8(self.read_u64()?),
            tag::R4 => Value::R4(self.read_f32()?),
            tag::R8 => Value::R8(self.read_f64()?),
            tag::I => Value::IntPtr(self.read_i64()?),
            tag::U => Value::UIntPtr(self.read_u64()?),
            tag::PTR => Value::Pointer(self.read_u64()?),
            tag::VALUETYPE => {
                let is_enum = self.read_bool()?;
                let type_id = self.read_id()?;
                let count = self.read_count()?;
                let mut fields = Vec::with_capacity(count.min(self.remaining()));
                for _ in 0..count {
                    fields.push(self.read_value_at_depth(depth + 1)?);
                }
                Value::ValueType(ValueTypeValue {
                    is_enum,
                    type_id,
                    fields,
                })
            }
            tag::TYPE => Value::Type(self.read_id()?),
            tag::PARENT_VTYPE => Value::ParentValueType {
                index: self.read_i32()?,
            },
            tag::NULL => Value::Null,
            tag::FIXED_ARRAY => Value::FixedArray(self.read_fixed_array()?),
            other => match ObjectTag::from_u8(other) {
                Some(tag) => Value::Object {
                    tag,
                    id: self.read_id()?,
                },
                None => {
                    return Err(DwpError::Protocol(format!(
                        "unknown value tag {other:#04x}"
                    )))
                }
            },
        };
        Ok(v)
    }

    fn read_fixed_array(&mut self) -> Result<FixedArray> {
        let element = self.read_u8()?;
        let len = self.read_count()?;
        let width = match element {
            tag::I8 | tag::U8 | tag::R8 => 8,
            _ => 4,
        };
        self.require(len.saturating_mul(width))?;

        fn collect<T>(len: usize, mut f: impl FnMut() -> Result<T>) -> Result<Vec<T>> {
            (0..len).map(|_| f()).collect()
        }

        let array = match element {
            tag::BOOLEAN => FixedArray::Boolean(collect(len, || Ok(self.read_i32()? != 0))?),
            tag::CHAR => FixedArray::Char(collect(len, || Ok(self.read_i32()? as u16))?),
            tag::I1 => FixedArray::I1(collect(len, || Ok(self.read_i32()? as i8))?),
            tag::U1 => FixedArray::U1(collect(len, || Ok(self.read_i32()? as u8))?),
            tag::I2 => FixedArray::I2(collect(len, || Ok(self.read_i32()? as i16))?),
            tag::U2 => FixedArray::U2(collect(len, || Ok(self.read_i32()? as u16))?),
            tag::I4 => FixedArray::I4(collect(len, || self.read_i32())?),
            tag::U4 => FixedArray::U4(collect(len, || self.read_u32())?),
            tag::I8 => FixedArray::I8(collect(len, || self.read_i64())?),
            tag::U8 => FixedArray::U8(collect(len, || self.read_u64())?),
            tag::R4 => FixedArray::R4(collect(len, || self.read_f32())?),
            tag::R8 => FixedArray::R8(collect(len, || self.read_f64())?),
            other => {
                return Err(DwpError::Protocol(format!(
                    "fixed array of non-scalar element tag {other:#04x}"
                )))
            }
        };
        Ok(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: Value) {
        let mut w = DwpWriter::new();
        w.write_value(&v);
        let bytes = w.into_vec();
        assert_eq!(decode_value_bytes(&bytes).unwrap(), v, "bytes: {bytes:02x?}");
    }

    #[test]
    fn scalar_values_round_trip() {
        for v in [
            Value::Void,
            Value::Null,
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Char(0x263a),
            Value::I1(-5),
            Value::U1(250),
            Value::I2(-30_000),
            Value::U2(65_000),
            Value::I4(i32::MIN),
            Value::U4(u32::MAX),
            Value::I8(-1),
            Value::U8(u64::MAX),
            Value::R4(1.5),
            Value::R4(f32::NAN),
            Value::R4(-0.0),
            Value::R8(-0.25),
            Value::R8(f64::NAN),
            Value::R8(-0.0),
            Value::R8(f64::INFINITY),
            Value::IntPtr(0x7fff_0000),
            Value::UIntPtr(42),
            Value::Pointer(0xdead_beef),
            Value::Type(77),
            Value::ParentValueType { index: 2 },
        ] {
            round_trip(v);
        }
    }

    #[test]
    fn object_references_keep_their_tag() {
        for tag in ObjectTag::ALL {
            let v = Value::Object { tag, id: 0x1234 };
            let mut w = DwpWriter::new();
            w.write_value(&v);
            let bytes = w.into_vec();
            assert_eq!(bytes[0], tag.as_u8());
            assert_eq!(ObjectTag::from_u8(bytes[0]), Some(tag));
            assert_eq!(decode_value_bytes(&bytes).unwrap(), v);
        }
    }

    #[test]
    fn nested_valuetypes_round_trip() {
        let inner = Value::ValueType(ValueTypeValue {
            is_enum: true,
            type_id: 9,
            fields: vec![Value::I4(3)],
        });
        round_trip(Value::ValueType(ValueTypeValue {
            is_enum: false,
            type_id: 8,
            fields: vec![
                Value::R8(2.0),
                inner,
                Value::string(5),
                Value::ParentValueType { index: 0 },
            ],
        }));
    }

    #[test]
    fn fixed_arrays_round_trip() {
        round_trip(Value::FixedArray(FixedArray::I1(vec![-1, 0, 1])));
        round_trip(Value::FixedArray(FixedArray::Char(vec![b'a' as u16, 0xffff])));
        round_trip(Value::FixedArray(FixedArray::R8(vec![1.0, 2.5])));
        round_trip(Value::FixedArray(FixedArray::U8(Vec::new())));
        round_trip(Value::FixedArray(FixedArray::Boolean(vec![true, false])));
        round_trip(Value::FixedArray(FixedArray::R4(vec![f32::NAN, -0.0, 1.0])));
        round_trip(Value::FixedArray(FixedArray::R8(vec![-0.0, f64::NAN])));
    }

    #[test]
    fn float_equality_is_bitwise() {
        assert_eq!(Value::R8(f64::NAN), Value::R8(f64::NAN));
        assert_ne!(Value::R8(0.0), Value::R8(-0.0));
        assert_ne!(Value::R4(0.0), Value::R4(-0.0));
        assert_ne!(FixedArray::R4(vec![0.0]), FixedArray::R4(vec![-0.0]));
        assert_eq!(FixedArray::R8(vec![f64::NAN]), FixedArray::R8(vec![f64::NAN]));
        assert_ne!(FixedArray::R8(vec![1.0]), FixedArray::R8(vec![1.0, 2.0]));
        assert_ne!(Value::I4(1), Value::U4(1));
    }

    #[test]
    fn tags_between_object_tags_are_rejected() {
        for t in [0x10u8, 0x13, 0x15, 0x1e] {
            assert_eq!(ObjectTag::from_u8(t), None);
            let err = decode_value_bytes(&[t, 0, 0, 0, 1]).unwrap_err();
            assert!(matches!(err, DwpError::Protocol(_)), "{err:?}");
        }
    }

    #[test]
    fn sub_word_integers_travel_as_four_bytes() {
        let mut w = DwpWriter::new();
        w.write_value(&Value::I1(-1));
        assert_eq!(w.into_vec(), vec![tag::I1, 0xff, 0xff, 0xff, 0xff]);

        let mut w = DwpWriter::new();
        w.write_value(&Value::U1(0xff));
        assert_eq!(w.into_vec(), vec![tag::U1, 0x00, 0x00, 0x00, 0xff]);
    }

    #[test]
    fn header_round_trips_and_reply_flag_uses_top_bit() {
        let header = PacketHeader {
            length: 37,
            id: 9,
            flags: 0,
            command_set: 1,
            command: 2,
        };
        let decoded = PacketHeader::decode(&header.encode());
        assert_eq!(decoded, header);
        assert!(!decoded.is_reply());

        for flags in [0x80u8, 0x81, 0xff] {
            assert!(PacketHeader { flags, ..header }.is_reply());
        }
        for flags in [0x00u8, 0x01, 0x7f] {
            assert!(!PacketHeader { flags, ..header }.is_reply());
        }
    }

    #[test]
    fn reply_error_code_occupies_trailing_header_bytes() {
        let packet = encode_reply(42, 0x0102, b"ok");
        match decode_packet_bytes(&packet).unwrap() {
            Packet::Reply {
                id,
                error_code,
                payload,
            } => {
                assert_eq!(id, 42);
                assert_eq!(error_code, 0x0102);
                assert_eq!(payload, b"ok");
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn decode_packet_rejects_bad_lengths() {
        let mut packet = encode_command(1, 1, 1, &[]);
        packet[0..4].copy_from_slice(&5u32.to_be_bytes());
        assert!(matches!(
            decode_packet_bytes(&packet),
            Err(DwpError::Protocol(msg)) if msg == "invalid packet length 5"
        ));

        let err = validate_packet_length(MAX_PACKET_BYTES + 1, MAX_PACKET_BYTES).unwrap_err();
        assert!(err.to_string().contains("refusing to allocate"));
    }

    #[test]
    fn unknown_tags_and_deep_nesting_are_protocol_errors() {
        assert!(matches!(
            decode_value_bytes(&[0x42]),
            Err(DwpError::Protocol(_))
        ));

        let mut bytes = Vec::new();
        for _ in 0..=MAX_VALUE_DEPTH + 1 {
            bytes.push(tag::VALUETYPE);
            bytes.push(0);
            bytes.extend_from_slice(&1u32.to_be_bytes());
            bytes.extend_from_slice(&1i32.to_be_bytes());
        }
        bytes.push(tag::NULL);
        assert!(matches!(
            decode_value_bytes(&bytes),
            Err(DwpError::Protocol(msg)) if msg.contains("nesting")
        ));
    }

    #[test]
    fn fixed_array_length_is_checked_before_allocating() {
        let mut bytes = vec![tag::FIXED_ARRAY, tag::I8];
        bytes.extend_from_slice(&i32::MAX.to_be_bytes());
        assert!(matches!(
            decode_value_bytes(&bytes),
            Err(DwpError::Protocol(msg)) if msg.contains("underflow")
        ));
    }

    #[test]
    fn strings_support_utf8_and_utf16() {
        let mut w = DwpWriter::new();
        w.write_string("héllo");
        w.write_utf16_string("wörld");
        let bytes = w.into_vec();
        let mut r = DwpReader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "héllo");
        assert_eq!(r.read_utf16_string().unwrap(), "wörld");
        r.finish().unwrap();
    }
}
