//! CBOR wire codec. Every message is described by a static [`Schema`] (an ordered list of field
//! names and kinds) and one generic routine encodes and decodes all of them on top of `ciborium`.
//!
//! Map records write their fields in schema order with text keys; tuple records write a bare array.
//! Decoding tolerates unknown map keys (content links inside them are traced), caps the field
//! count, and reports [`DecodeError::NeedMore`] when the buffer ends early so stream readers can
//! wait for more bytes.

use std::io;

use ciborium::value::{Integer, Value as Cbor};
use ciborium_ll::{Decoder, Header};
use cid::Cid;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

/// Maximum entries in a map and maximum text length.
pub const MAX_FIELDS: usize = 8192;
pub const MAX_TEXT_LEN: usize = 8192;
/// Maximum byte string length.
pub const MAX_BYTES_LEN: usize = 2 << 20;
/// Upper bound for one encoded message read off a stream.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024; // 16 MiB

const MAX_NESTING: usize = 32;
const CID_TAG: u64 = 42;

/// Container used for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repr {
    /// Map of text field names to values.
    Map,
    /// Positional array, no names on the wire.
    Tuple,
}

#[derive(Debug, Clone, Copy)]
pub enum Kind {
    Text,
    Bytes,
    /// Byte string of exactly this length.
    FixedBytes(usize),
    /// Either a text or a byte string (deal labels).
    TextOrBytes,
    Uint,
    /// Signed integer (major type 0 or 1).
    Int,
    Bool,
    /// Content identifier, tag 42 over a byte string with a leading zero byte.
    Cid,
    Record(&'static Schema),
    /// The inner kind, or null.
    Nullable(&'static Kind),
}

impl Kind {
    /// Value assumed for a map field absent from the input. Links and sub-records have none.
    fn zero(self) -> Option<Value> {
        match self {
            Kind::Text | Kind::TextOrBytes => Some(Value::Text(String::new())),
            Kind::Bytes => Some(Value::Bytes(Vec::new())),
            Kind::FixedBytes(n) => Some(Value::Bytes(vec![0; n])),
            Kind::Uint => Some(Value::Uint(0)),
            Kind::Int => Some(Value::Int(0)),
            Kind::Bool => Some(Value::Bool(false)),
            Kind::Nullable(_) => Some(Value::Null),
            Kind::Cid | Kind::Record(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct Field {
    pub name: &'static str,
    pub kind: Kind,
}

#[derive(Debug)]
pub struct Schema {
    pub name: &'static str,
    pub repr: Repr,
    pub fields: &'static [Field],
}

impl Schema {
    fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// A field value in schema terms.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Bytes(Vec<u8>),
    Uint(u64),
    Int(i64),
    Bool(bool),
    Cid(Cid),
    Record(Vec<Value>),
    Null,
}

impl Value {
    /// Byte-string value of a type whose serde form is a CBOR byte string: token amounts and
    /// signatures.
    pub fn encoded<T: Serialize>(value: &T) -> Result<Value, EncodeError> {
        match Cbor::serialized(value) {
            Ok(Cbor::Bytes(b)) => Ok(Value::Bytes(b)),
            Ok(_) => Err(EncodeError::Cbor("value does not encode as a byte string".to_string())),
            Err(e) => Err(EncodeError::Cbor(e.to_string())),
        }
    }
}

/// A message type with a static schema. `to_values` yields one value per schema field, in order.
pub trait Record: Sized {
    const SCHEMA: &'static Schema;

    fn to_values(&self) -> Result<Vec<Value>, EncodeError>;

    fn from_fields(fields: Fields) -> Result<Self, DecodeError>;
}

/// Decoded field values of one record, taken by name.
#[derive(Debug)]
pub struct Fields {
    schema: &'static Schema,
    values: Vec<Option<Value>>,
}

impl Fields {
    fn new(schema: &'static Schema, values: Vec<Value>) -> Self {
        Fields {
            schema,
            values: values.into_iter().map(Some).collect(),
        }
    }

    /// The raw value of a field.
    pub fn value(&mut self, name: &'static str) -> Result<Value, DecodeError> {
        let record = self.schema.name;
        self.schema
            .position(name)
            .and_then(|i| self.values.get_mut(i))
            .and_then(Option::take)
            .ok_or(DecodeError::MissingField {
                record,
                field: name,
            })
    }

    fn shape(&self, name: &'static str) -> DecodeError {
        DecodeError::Shape {
            record: self.schema.name,
            field: name,
        }
    }

    pub fn text(&mut self, name: &'static str) -> Result<String, DecodeError> {
        match self.value(name)? {
            Value::Text(s) => Ok(s),
            _ => Err(self.shape(name)),
        }
    }

    pub fn bytes(&mut self, name: &'static str) -> Result<Vec<u8>, DecodeError> {
        match self.value(name)? {
            Value::Bytes(b) => Ok(b),
            _ => Err(self.shape(name)),
        }
    }

    pub fn fixed<const N: usize>(&mut self, name: &'static str) -> Result<[u8; N], DecodeError> {
        let bytes = self.bytes(name)?;
        let actual = bytes.len();
        bytes.try_into().map_err(|_| DecodeError::FixedLength {
            field: name,
            expected: N,
            actual,
        })
    }

    pub fn uint(&mut self, name: &'static str) -> Result<u64, DecodeError> {
        match self.value(name)? {
            Value::Uint(v) => Ok(v),
            _ => Err(self.shape(name)),
        }
    }

    pub fn int(&mut self, name: &'static str) -> Result<i64, DecodeError> {
        match self.value(name)? {
            Value::Int(v) => Ok(v),
            _ => Err(self.shape(name)),
        }
    }

    pub fn bool(&mut self, name: &'static str) -> Result<bool, DecodeError> {
        match self.value(name)? {
            Value::Bool(v) => Ok(v),
            _ => Err(self.shape(name)),
        }
    }

    pub fn cid(&mut self, name: &'static str) -> Result<Cid, DecodeError> {
        match self.value(name)? {
            Value::Cid(c) => Ok(c),
            _ => Err(self.shape(name)),
        }
    }

    pub fn record<R: Record>(&mut self, name: &'static str) -> Result<R, DecodeError> {
        match self.value(name)? {
            Value::Record(values) => R::from_fields(Fields::new(R::SCHEMA, values)),
            _ => Err(self.shape(name)),
        }
    }

    pub fn record_opt<R: Record>(&mut self, name: &'static str) -> Result<Option<R>, DecodeError> {
        match self.value(name)? {
            Value::Null => Ok(None),
            Value::Record(values) => R::from_fields(Fields::new(R::SCHEMA, values)).map(Some),
            _ => Err(self.shape(name)),
        }
    }

    /// A byte-string field decoded through the type's serde form.
    pub fn decoded<T: DeserializeOwned>(&mut self, name: &'static str) -> Result<T, DecodeError> {
        let bytes = self.bytes(name)?;
        from_byte_string(name, bytes)
    }

    /// Like [`Fields::decoded`] for a nullable field.
    pub fn decoded_opt<T: DeserializeOwned>(
        &mut self,
        name: &'static str,
    ) -> Result<Option<T>, DecodeError> {
        match self.value(name)? {
            Value::Null => Ok(None),
            Value::Bytes(b) => from_byte_string(name, b).map(Some),
            _ => Err(self.shape(name)),
        }
    }
}

fn from_byte_string<T: DeserializeOwned>(
    field: &'static str,
    bytes: Vec<u8>,
) -> Result<T, DecodeError> {
    Cbor::Bytes(bytes)
        .deserialized()
        .map_err(|e| DecodeError::Invalid {
            field,
            reason: e.to_string(),
        })
}

/// Encode a record into its canonical bytes.
pub fn encode<R: Record>(record: &R) -> Result<Vec<u8>, EncodeError> {
    let item = record_item(R::SCHEMA, &record.to_values()?)?;
    let mut out = Vec::new();
    ciborium::ser::into_writer(&item, &mut out).map_err(|e| EncodeError::Cbor(e.to_string()))?;
    Ok(out)
}

/// Decode one record from the front of `bytes`. Returns the record and the number of bytes consumed.
/// Returns [`DecodeError::NeedMore`] if `bytes` holds only a prefix of a record.
pub fn decode<R: Record>(bytes: &[u8]) -> Result<(R, usize), DecodeError> {
    let mut rest = bytes;
    let item: Cbor = ciborium::de::from_reader_with_recursion_limit(&mut rest, MAX_NESTING)
        .map_err(read_error)?;
    let consumed = bytes.len() - rest.len();
    let values = read_record(item, R::SCHEMA)?;
    let record = R::from_fields(Fields::new(R::SCHEMA, values))?;
    Ok((record, consumed))
}

/// Decode a record that must span all of `bytes`.
pub fn decode_exact<R: Record>(bytes: &[u8]) -> Result<R, DecodeError> {
    let (record, consumed) = decode(bytes)?;
    if consumed != bytes.len() {
        return Err(DecodeError::TrailingBytes(bytes.len() - consumed));
    }
    Ok(record)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("{record}.{field} does not match its schema")]
    Shape {
        record: &'static str,
        field: &'static str,
    },
    #[error("value in field {field} was too long ({len})")]
    TooLong { field: &'static str, len: usize },
    #[error("{field}: expected byte array of length {expected}, got {actual}")]
    FixedLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("cbor: {0}")]
    Cbor(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("{record}: cbor input should be of type map")]
    NotMap { record: &'static str },
    #[error("{record}: cbor input should be of type array")]
    NotArray { record: &'static str },
    #[error("{record}: map struct too large ({count})")]
    TooManyFields { record: &'static str, count: usize },
    #[error("{record}: expected {expected} tuple fields, got {actual}")]
    WrongArity {
        record: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{field}: unexpected cbor {found}")]
    WrongType {
        field: &'static str,
        found: &'static str,
    },
    #[error("{field}: expected byte array of length {expected}, got {actual}")]
    FixedLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{field}: value too large ({len})")]
    TooLong { field: &'static str, len: usize },
    #[error("{field}: integer out of range")]
    IntOverflow { field: &'static str },
    #[error("{field}: expected tag 42, got {tag}")]
    WrongTag { field: &'static str, tag: u64 },
    #[error("{field}: invalid cid: {reason}")]
    InvalidCid { field: &'static str, reason: String },
    #[error("invalid cbor at offset {0}")]
    Syntax(usize),
    #[error("malformed cbor: {0}")]
    Malformed(String),
    #[error("nesting too deep")]
    TooDeep,
    #[error("missing field {field} in {record}")]
    MissingField {
        record: &'static str,
        field: &'static str,
    },
    #[error("{record}.{field} does not match its schema")]
    Shape {
        record: &'static str,
        field: &'static str,
    },
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

fn read_error(err: ciborium::de::Error<io::Error>) -> DecodeError {
    use ciborium::de::Error;
    match err {
        Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => DecodeError::NeedMore,
        Error::Io(e) => DecodeError::Malformed(e.to_string()),
        Error::Syntax(offset) => DecodeError::Syntax(offset),
        Error::Semantic(_, msg) => DecodeError::Malformed(msg),
        Error::RecursionLimitExceeded => DecodeError::TooDeep,
    }
}

/// Finds where the first CBOR item of a growing buffer ends. Each call resumes where the previous
/// one stopped, so a stream reader scans every byte once however the bytes are chunked.
#[derive(Debug, Default)]
pub struct ItemScanner {
    pos: usize,
    started: bool,
    open: Vec<Open>,
}

/// Containers entered but not yet closed.
#[derive(Debug)]
enum Open {
    Items(usize),
    UntilBreak,
}

impl ItemScanner {
    /// Length of the first complete item in `buf`, or `None` while it is still partial. `buf` must
    /// only grow between calls.
    pub fn complete_len(&mut self, buf: &[u8]) -> Result<Option<usize>, DecodeError> {
        while !(self.started && self.open.is_empty()) {
            let mut decoder = Decoder::from(&buf[self.pos..]);
            let header = match decoder.pull() {
                Ok(header) => header,
                Err(ciborium_ll::Error::Io(_)) => return Ok(None),
                Err(ciborium_ll::Error::Syntax(at)) => {
                    return Err(DecodeError::Syntax(self.pos + at))
                }
            };
            let mut len = decoder.offset();
            let opened = match header {
                Header::Bytes(Some(n)) | Header::Text(Some(n)) => {
                    if n > MAX_BYTES_LEN {
                        return Err(DecodeError::TooLong { field: "item", len: n });
                    }
                    if buf.len() - self.pos < len + n {
                        return Ok(None);
                    }
                    len += n;
                    None
                }
                Header::Array(Some(n)) => Some(Open::Items(n)),
                Header::Map(Some(n)) => {
                    if n > MAX_FIELDS {
                        return Err(DecodeError::TooLong { field: "item", len: n });
                    }
                    Some(Open::Items(n * 2))
                }
                Header::Bytes(None) | Header::Text(None) | Header::Array(None) | Header::Map(None) => {
                    Some(Open::UntilBreak)
                }
                Header::Tag(_) => Some(Open::Items(1)),
                Header::Break => match self.open.pop() {
                    Some(Open::UntilBreak) => None,
                    _ => return Err(DecodeError::Syntax(self.pos)),
                },
                _ => None,
            };
            self.pos += len;
            self.started = true;
            match opened {
                Some(Open::Items(0)) | None => self.close_item(),
                Some(open) => {
                    if self.open.len() >= MAX_NESTING {
                        return Err(DecodeError::TooDeep);
                    }
                    self.open.push(open);
                }
            }
        }
        Ok(Some(self.pos))
    }

    fn close_item(&mut self) {
        while let Some(Open::Items(left)) = self.open.last_mut() {
            *left -= 1;
            if *left > 0 {
                return;
            }
            self.open.pop();
        }
    }
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), EncodeError> {
    if len > max {
        return Err(EncodeError::TooLong { field, len });
    }
    Ok(())
}

fn link_item(cid: &Cid) -> Cbor {
    let mut payload = vec![0x00];
    payload.extend_from_slice(&cid.to_bytes());
    Cbor::Tag(CID_TAG, Box::new(Cbor::Bytes(payload)))
}

fn record_item(schema: &Schema, values: &[Value]) -> Result<Cbor, EncodeError> {
    if values.len() != schema.fields.len() {
        return Err(EncodeError::Shape {
            record: schema.name,
            field: "*",
        });
    }
    let items = schema
        .fields
        .iter()
        .zip(values)
        .map(|(field, value)| value_item(schema, field.name, field.kind, value))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(match schema.repr {
        Repr::Map => Cbor::Map(
            schema
                .fields
                .iter()
                .map(|f| Cbor::Text(f.name.to_string()))
                .zip(items)
                .collect(),
        ),
        Repr::Tuple => Cbor::Array(items),
    })
}

fn value_item(
    schema: &Schema,
    name: &'static str,
    kind: Kind,
    value: &Value,
) -> Result<Cbor, EncodeError> {
    match (kind, value) {
        (Kind::Nullable(_), Value::Null) => Ok(Cbor::Null),
        (Kind::Nullable(inner), v) => value_item(schema, name, *inner, v),
        (Kind::Text | Kind::TextOrBytes, Value::Text(s)) => {
            check_len(name, s.len(), MAX_TEXT_LEN)?;
            Ok(Cbor::Text(s.clone()))
        }
        (Kind::Bytes | Kind::TextOrBytes, Value::Bytes(b)) => {
            check_len(name, b.len(), MAX_BYTES_LEN)?;
            Ok(Cbor::Bytes(b.clone()))
        }
        (Kind::FixedBytes(n), Value::Bytes(b)) => {
            if b.len() != n {
                return Err(EncodeError::FixedLength {
                    field: name,
                    expected: n,
                    actual: b.len(),
                });
            }
            Ok(Cbor::Bytes(b.clone()))
        }
        (Kind::Uint, Value::Uint(v)) => Ok(Cbor::Integer(Integer::from(*v))),
        (Kind::Int, Value::Int(v)) => Ok(Cbor::Integer(Integer::from(*v))),
        (Kind::Bool, Value::Bool(v)) => Ok(Cbor::Bool(*v)),
        (Kind::Cid, Value::Cid(c)) => Ok(link_item(c)),
        (Kind::Record(sub), Value::Record(values)) => record_item(sub, values),
        _ => Err(EncodeError::Shape {
            record: schema.name,
            field: name,
        }),
    }
}

fn parse_link(payload: &[u8]) -> Result<Cid, String> {
    match payload.split_first() {
        Some((0x00, rest)) => Cid::try_from(rest).map_err(|e| e.to_string()),
        _ => Err("missing identity multibase prefix".to_string()),
    }
}

fn describe(item: &Cbor) -> &'static str {
    match item {
        Cbor::Integer(_) => "integer",
        Cbor::Bytes(_) => "byte string",
        Cbor::Float(_) => "float",
        Cbor::Text(_) => "text",
        Cbor::Bool(_) => "bool",
        Cbor::Null => "null",
        Cbor::Tag(..) => "tag",
        Cbor::Array(_) => "array",
        Cbor::Map(_) => "map",
        _ => "simple value",
    }
}

fn read_record(item: Cbor, schema: &'static Schema) -> Result<Vec<Value>, DecodeError> {
    match schema.repr {
        Repr::Tuple => {
            let Cbor::Array(items) = item else {
                return Err(DecodeError::NotArray {
                    record: schema.name,
                });
            };
            if items.len() != schema.fields.len() {
                return Err(DecodeError::WrongArity {
                    record: schema.name,
                    expected: schema.fields.len(),
                    actual: items.len(),
                });
            }
            schema
                .fields
                .iter()
                .zip(items)
                .map(|(field, item)| read_value(field.name, field.kind, item))
                .collect()
        }
        Repr::Map => {
            let Cbor::Map(entries) = item else {
                return Err(DecodeError::NotMap {
                    record: schema.name,
                });
            };
            if entries.len() > MAX_FIELDS {
                return Err(DecodeError::TooManyFields {
                    record: schema.name,
                    count: entries.len(),
                });
            }
            let mut slots: Vec<Option<Value>> = vec![None; schema.fields.len()];
            for (key, item) in entries {
                let name = match key {
                    Cbor::Text(name) => name,
                    other => {
                        return Err(DecodeError::WrongType {
                            field: "map key",
                            found: describe(&other),
                        })
                    }
                };
                match schema.position(&name) {
                    Some(i) => {
                        let field = &schema.fields[i];
                        slots[i] = Some(read_value(field.name, field.kind, item)?);
                    }
                    None => {
                        trace!(record = schema.name, field = %name, "skipping unknown field");
                        scan_links(&item);
                    }
                }
            }
            schema
                .fields
                .iter()
                .zip(slots)
                .map(|(field, slot)| {
                    slot.or_else(|| field.kind.zero())
                        .ok_or(DecodeError::MissingField {
                            record: schema.name,
                            field: field.name,
                        })
                })
                .collect()
        }
    }
}

fn read_value(name: &'static str, kind: Kind, item: Cbor) -> Result<Value, DecodeError> {
    match (kind, item) {
        (Kind::Nullable(_), Cbor::Null) => Ok(Value::Null),
        (Kind::Nullable(inner), item) => read_value(name, *inner, item),
        (Kind::Text | Kind::TextOrBytes, Cbor::Text(s)) => {
            if s.len() > MAX_TEXT_LEN {
                return Err(DecodeError::TooLong {
                    field: name,
                    len: s.len(),
                });
            }
            Ok(Value::Text(s))
        }
        (Kind::Bytes | Kind::TextOrBytes, Cbor::Bytes(b)) => {
            if b.len() > MAX_BYTES_LEN {
                return Err(DecodeError::TooLong {
                    field: name,
                    len: b.len(),
                });
            }
            Ok(Value::Bytes(b))
        }
        (Kind::FixedBytes(n), Cbor::Bytes(b)) => {
            if b.len() != n {
                return Err(DecodeError::FixedLength {
                    field: name,
                    expected: n,
                    actual: b.len(),
                });
            }
            Ok(Value::Bytes(b))
        }
        (Kind::Uint, Cbor::Integer(i)) => u64::try_from(i)
            .map(Value::Uint)
            .map_err(|_| DecodeError::IntOverflow { field: name }),
        (Kind::Int, Cbor::Integer(i)) => i64::try_from(i)
            .map(Value::Int)
            .map_err(|_| DecodeError::IntOverflow { field: name }),
        (Kind::Bool, Cbor::Bool(b)) => Ok(Value::Bool(b)),
        (Kind::Cid, Cbor::Tag(CID_TAG, inner)) => match *inner {
            Cbor::Bytes(payload) => parse_link(&payload)
                .map(Value::Cid)
                .map_err(|reason| DecodeError::InvalidCid {
                    field: name,
                    reason,
                }),
            other => Err(DecodeError::WrongType {
                field: name,
                found: describe(&other),
            }),
        },
        (Kind::Cid, Cbor::Tag(tag, _)) => Err(DecodeError::WrongTag { field: name, tag }),
        (Kind::Record(schema), item) => read_record(item, schema).map(Value::Record),
        (_, other) => Err(DecodeError::WrongType {
            field: name,
            found: describe(&other),
        }),
    }
}

/// Trace the content links inside a skipped value. Unparsable links are not an error.
fn scan_links(item: &Cbor) {
    match item {
        Cbor::Tag(CID_TAG, inner) => match inner.as_ref() {
            Cbor::Bytes(payload) => match parse_link(payload) {
                Ok(link) => trace!(%link, "scanned link in unknown field"),
                Err(reason) => trace!(%reason, "unparsable link in unknown field"),
            },
            other => scan_links(other),
        },
        Cbor::Tag(_, inner) => scan_links(inner),
        Cbor::Array(items) => items.iter().for_each(scan_links),
        Cbor::Map(entries) => entries.iter().for_each(|(k, v)| {
            scan_links(k);
            scan_links(v);
        }),
        _ => {}
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const PAIR: Schema = Schema {
        name: "Pair",
        repr: Repr::Map,
        fields: &[
            Field {
                name: "Id",
                kind: Kind::FixedBytes(4),
            },
            Field {
                name: "Offset",
                kind: Kind::Int,
            },
        ],
    };

    #[derive(Debug, PartialEq)]
    struct Pair {
        id: [u8; 4],
        offset: i64,
    }

    impl Record for Pair {
        const SCHEMA: &'static Schema = &PAIR;

        fn to_values(&self) -> Result<Vec<Value>, EncodeError> {
            Ok(vec![Value::Bytes(self.id.to_vec()), Value::Int(self.offset)])
        }

        fn from_fields(mut fields: Fields) -> Result<Self, DecodeError> {
            Ok(Pair {
                id: fields.fixed("Id")?,
                offset: fields.int("Offset")?,
            })
        }
    }

    /// Bytes of a hand-built CBOR item.
    pub(crate) fn cbor(item: &Cbor) -> Vec<u8> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(item, &mut out).unwrap();
        out
    }

    /// Map item with text keys, in the order given.
    pub(crate) fn map(entries: Vec<(&str, Cbor)>) -> Cbor {
        Cbor::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Cbor::Text(k.to_string()), v))
                .collect(),
        )
    }

    pub(crate) fn int(v: i64) -> Cbor {
        Cbor::Integer(Integer::from(v))
    }

    #[test]
    fn negative_ints_use_major_one() {
        let pair = Pair {
            id: [1, 2, 3, 4],
            offset: -500,
        };
        let bytes = encode(&pair).unwrap();
        // a2 62 "Id" 44 01020304 66 "Offset" 39 01f3
        assert_eq!(&bytes[bytes.len() - 3..], &[0x39, 0x01, 0xf3]);
        assert_eq!(decode_exact::<Pair>(&bytes).unwrap(), pair);
    }

    #[test]
    fn every_prefix_needs_more() {
        let bytes = encode(&Pair {
            id: [9; 4],
            offset: 77,
        })
        .unwrap();
        for cut in 0..bytes.len() {
            assert_eq!(
                decode::<Pair>(&bytes[..cut]).unwrap_err(),
                DecodeError::NeedMore,
                "prefix of {} bytes",
                cut
            );
        }
    }

    #[test]
    fn missing_scalar_field_takes_zero_value() {
        let bytes = cbor(&map(vec![("Offset", int(5))]));
        let pair = decode_exact::<Pair>(&bytes).unwrap();
        assert_eq!(pair, Pair { id: [0; 4], offset: 5 });
    }

    #[test]
    fn skips_nested_unknown_values_with_links() {
        let link: Cid = "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n".parse().unwrap();
        let extra = map(vec![
            (
                "a",
                Cbor::Array(vec![int(1), Cbor::Bytes(vec![0]), link_item(&link)]),
            ),
            ("b", Cbor::Text("x".to_string())),
        ]);
        let bytes = cbor(&map(vec![
            ("Extra", extra),
            ("Id", Cbor::Bytes(vec![1; 4])),
            ("Offset", int(-1)),
        ]));

        let pair = decode_exact::<Pair>(&bytes).unwrap();
        assert_eq!(pair, Pair { id: [1; 4], offset: -1 });
    }

    #[test]
    fn garbage_link_in_unknown_field_is_not_fatal() {
        let junk = Cbor::Tag(CID_TAG, Box::new(Cbor::Bytes(vec![0x00, 0xff, 0xff])));
        let bytes = cbor(&map(vec![("Junk", junk), ("Offset", int(1))]));
        assert_eq!(decode_exact::<Pair>(&bytes).unwrap().offset, 1);
    }

    #[test]
    fn rejects_non_map_and_oversized_maps() {
        assert_eq!(
            decode::<Pair>(&[0x82, 0x01, 0x02]).unwrap_err(),
            DecodeError::NotMap { record: "Pair" }
        );
        let keys: Vec<String> = (0..=MAX_FIELDS).map(|i| format!("k{i}")).collect();
        let big = map(keys.iter().map(|k| (k.as_str(), int(0))).collect());
        assert_eq!(
            decode::<Pair>(&cbor(&big)).unwrap_err(),
            DecodeError::TooManyFields {
                record: "Pair",
                count: MAX_FIELDS + 1
            }
        );
    }

    #[test]
    fn wrong_item_type_is_named() {
        let bytes = cbor(&map(vec![("Offset", Cbor::Null)]));
        assert_eq!(
            decode::<Pair>(&bytes).unwrap_err(),
            DecodeError::WrongType {
                field: "Offset",
                found: "null"
            }
        );
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = encode(&Pair { id: [0; 4], offset: 0 }).unwrap();
        bytes.push(0x00);
        assert_eq!(
            decode_exact::<Pair>(&bytes).unwrap_err(),
            DecodeError::TrailingBytes(1)
        );
    }

    #[test]
    fn encode_checks_fixed_length() {
        struct Short;
        impl Record for Short {
            const SCHEMA: &'static Schema = &PAIR;
            fn to_values(&self) -> Result<Vec<Value>, EncodeError> {
                Ok(vec![Value::Bytes(vec![1, 2]), Value::Int(0)])
            }
            fn from_fields(_: Fields) -> Result<Self, DecodeError> {
                Ok(Short)
            }
        }
        assert_eq!(
            encode(&Short).unwrap_err(),
            EncodeError::FixedLength {
                field: "Id",
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn scanner_finds_the_end_one_byte_at_a_time() {
        let item = encode(&Pair {
            id: [3; 4],
            offset: 1 << 40,
        })
        .unwrap();
        let mut stream = item.clone();
        stream.extend_from_slice(&[0xa0, 0xa0]);

        let mut scanner = ItemScanner::default();
        let mut buf = Vec::new();
        let mut found = None;
        for &b in &stream {
            buf.push(b);
            if let Some(len) = scanner.complete_len(&buf).unwrap() {
                found = Some((len, buf.len()));
                break;
            }
        }
        assert_eq!(found, Some((item.len(), item.len())));
        assert_eq!(scanner.complete_len(&stream).unwrap(), Some(item.len()));
    }

    #[test]
    fn scanner_follows_tags_and_indefinite_items() {
        let link: Cid = "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n".parse().unwrap();
        let tagged = cbor(&Cbor::Array(vec![link_item(&link), Cbor::Array(vec![])]));
        assert_eq!(
            ItemScanner::default().complete_len(&tagged).unwrap(),
            Some(tagged.len())
        );

        // [_ 1, [_ ], "a"] with indefinite outer and inner arrays
        let indefinite = [0x9f, 0x01, 0x9f, 0xff, 0x61, b'a', 0xff];
        let mut scanner = ItemScanner::default();
        assert_eq!(scanner.complete_len(&indefinite[..6]).unwrap(), None);
        assert_eq!(scanner.complete_len(&indefinite).unwrap(), Some(7));

        assert_eq!(
            ItemScanner::default().complete_len(&[0xff]).unwrap_err(),
            DecodeError::Syntax(0)
        );
    }
}
