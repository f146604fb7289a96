use std::{collections::BTreeMap, fmt};

use crate::error::Error;

const LIST_INDICATOR: u8 = b'l';
const INT_INDICATOR: u8 = b'i';
const DICT_INDICATOR: u8 = b'd';
const END_INDICATOR: u8 = b'e';
const BYTES_INDICATOR: std::ops::RangeInclusive<u8> = b'0'..=b'9';

// nesting deeper than this is rejected instead of recursing further
const MAX_DEPTH: usize = 64;

/// A decoded bencode value.
///
/// Dictionaries are kept in a `BTreeMap`, so iteration (and therefore
/// encoding) is always in ascending key order no matter how the map was
/// built or in which order the keys were parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Int(i64),
    List(Vec<Bencode>),
    Bytes(Vec<u8>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

/// Why a byte sequence could not be decoded. Every variant carries the
/// offset into the input at which decoding stopped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("unexpected byte {found:#04x} at offset {offset}")]
    UnexpectedChar { offset: usize, found: u8 },

    #[error("invalid string length prefix at offset {offset}")]
    InvalidLength { offset: usize },

    #[error("invalid integer at offset {offset}: {reason}")]
    InvalidInteger { offset: usize, reason: &'static str },

    #[error("string at offset {offset} declares {declared} bytes but only {available} remain")]
    StringOverrun {
        offset: usize,
        declared: usize,
        available: usize,
    },

    #[error("dictionary key at offset {offset} is not a byte string")]
    NonStringKey { offset: usize },

    #[error("duplicate dictionary key at offset {offset}")]
    DuplicateKey { offset: usize },

    #[error("nesting deeper than 64 levels at offset {offset}")]
    NestingTooDeep { offset: usize },

    #[error("{remaining} bytes left unconsumed after offset {offset}")]
    TrailingBytes { offset: usize, remaining: usize },
}

impl Bencode {
    /// Builds a dictionary from `(key, value)` pairs. Later duplicates win.
    pub fn dict<K, I>(entries: I) -> Bencode
    where
        K: Into<Vec<u8>>,
        I: IntoIterator<Item = (K, Bencode)>,
    {
        Bencode::Dict(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Bencode::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bencode::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The byte string as UTF-8, if it is a byte string and valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Bencode]> {
        match self {
            Bencode::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Bencode>> {
        match self {
            Bencode::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up `key` when `self` is a dictionary.
    pub fn get(&self, key: &str) -> Option<&Bencode> {
        self.as_dict().and_then(|map| map.get(key.as_bytes()))
    }

    pub fn require(&self, key: &str) -> Result<&Bencode, Error> {
        self.get(key).ok_or_else(|| Error::MissingKey(key.to_string()))
    }

    pub fn require_int(&self, key: &str) -> Result<i64, Error> {
        self.require(key)?.as_int().ok_or_else(|| Error::WrongType {
            key: key.to_string(),
            expected: "integer",
        })
    }

    pub fn require_bytes(&self, key: &str) -> Result<&[u8], Error> {
        self.require(key)?.as_bytes().ok_or_else(|| Error::WrongType {
            key: key.to_string(),
            expected: "byte string",
        })
    }

    pub fn require_str(&self, key: &str) -> Result<&str, Error> {
        self.require(key)?.as_str().ok_or_else(|| Error::WrongType {
            key: key.to_string(),
            expected: "utf-8 string",
        })
    }

    pub fn require_dict(&self, key: &str) -> Result<&Bencode, Error> {
        let value = self.require(key)?;
        match value {
            Bencode::Dict(_) => Ok(value),
            _ => Err(Error::WrongType {
                key: key.to_string(),
                expected: "dictionary",
            }),
        }
    }
}

impl From<i64> for Bencode {
    fn from(i: i64) -> Self {
        Bencode::Int(i)
    }
}

impl From<&str> for Bencode {
    fn from(s: &str) -> Self {
        Bencode::Bytes(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Bencode {
    fn from(b: Vec<u8>) -> Self {
        Bencode::Bytes(b)
    }
}

// json-like rendering, used by the `decode` command
impl fmt::Display for Bencode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bencode::Int(i) => write!(f, "{i}"),
            Bencode::Bytes(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            Bencode::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Bencode::Dict(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{:?}:{value}", String::from_utf8_lossy(key))?;
                }
                write!(f, "}}")
            }
        }
    }
}

pub mod encoder {
    use super::{Bencode, DICT_INDICATOR, END_INDICATOR, INT_INDICATOR, LIST_INDICATOR};

    /// Canonical encoding of `data`. Dictionary keys come out sorted.
    pub fn encode(data: &Bencode) -> Vec<u8> {
        let mut out = Vec::new();
        encode_into(data, &mut out);
        out
    }

    fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(bytes.len().to_string().as_bytes());
        out.push(b':');
        out.extend_from_slice(bytes);
    }

    pub fn encode_into(data: &Bencode, out: &mut Vec<u8>) {
        match data {
            Bencode::Int(i) => {
                out.push(INT_INDICATOR);
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(END_INDICATOR);
            }
            Bencode::Bytes(b) => encode_bytes(b, out),
            Bencode::List(items) => {
                out.push(LIST_INDICATOR);
                for item in items {
                    encode_into(item, out);
                }
                out.push(END_INDICATOR);
            }
            Bencode::Dict(map) => {
                out.push(DICT_INDICATOR);
                for (key, value) in map {
                    encode_bytes(key, out);
                    encode_into(value, out);
                }
                out.push(END_INDICATOR);
            }
        }
    }
}

pub mod decoder {
    use super::{
        Bencode, ParseError, BYTES_INDICATOR, DICT_INDICATOR, END_INDICATOR, INT_INDICATOR,
        LIST_INDICATOR, MAX_DEPTH,
    };
    use std::collections::{btree_map::Entry, BTreeMap};

    struct Cursor<'a> {
        input: &'a [u8],
        pos: usize,
    }

    impl<'a> Cursor<'a> {
        fn peek(&self) -> Option<u8> {
            self.input.get(self.pos).copied()
        }

        fn eof(&self) -> ParseError {
            ParseError::UnexpectedEof { offset: self.pos }
        }

        fn value(&mut self, depth: usize) -> Result<Bencode, ParseError> {
            if depth > MAX_DEPTH {
                return Err(ParseError::NestingTooDeep { offset: self.pos });
            }

            match self.peek() {
                Some(INT_INDICATOR) => self.int(),
                Some(LIST_INDICATOR) => self.list(depth),
                Some(DICT_INDICATOR) => self.dict(depth),
                Some(b) if BYTES_INDICATOR.contains(&b) => self.bytes().map(Bencode::Bytes),
                Some(found) => Err(ParseError::UnexpectedChar {
                    offset: self.pos,
                    found,
                }),
                None => Err(self.eof()),
            }
        }

        // i<digits>e, optional leading '-', no leading zeros, no "-0"
        fn int(&mut self) -> Result<Bencode, ParseError> {
            let start = self.pos;
            self.pos += 1;

            let digits_start = self.pos;
            let end = self.input[digits_start..]
                .iter()
                .position(|&b| b == END_INDICATOR)
                .map(|i| digits_start + i)
                .ok_or(ParseError::UnexpectedEof {
                    offset: self.input.len(),
                })?;

            let raw = &self.input[digits_start..end];
            let invalid = |reason| ParseError::InvalidInteger {
                offset: start,
                reason,
            };

            let digits = raw.strip_prefix(b"-").unwrap_or(raw);
            if digits.is_empty() {
                return Err(invalid("no digits"));
            }
            if !digits.iter().all(u8::is_ascii_digit) {
                return Err(invalid("non-digit character"));
            }
            if digits[0] == b'0' && digits.len() > 1 {
                return Err(invalid("leading zero"));
            }
            if raw == b"-0" {
                return Err(invalid("negative zero"));
            }

            // every byte is ascii at this point
            let number = std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(invalid("out of range"))?;

            self.pos = end + 1;
            Ok(Bencode::Int(number))
        }

        // <len>:<bytes>
        fn bytes(&mut self) -> Result<Vec<u8>, ParseError> {
            let start = self.pos;
            let mut length: usize = 0;

            loop {
                match self.peek() {
                    Some(b':') => break,
                    Some(b) if b.is_ascii_digit() => {
                        length = length
                            .checked_mul(10)
                            .and_then(|l| l.checked_add((b - b'0') as usize))
                            .ok_or(ParseError::InvalidLength { offset: start })?;
                        self.pos += 1;
                    }
                    Some(_) => return Err(ParseError::InvalidLength { offset: start }),
                    None => return Err(self.eof()),
                }
            }

            // skip the colon
            self.pos += 1;

            let available = self.input.len() - self.pos;
            if length > available {
                return Err(ParseError::StringOverrun {
                    offset: start,
                    declared: length,
                    available,
                });
            }

            let bytes = self.input[self.pos..self.pos + length].to_vec();
            self.pos += length;
            Ok(bytes)
        }

        fn list(&mut self, depth: usize) -> Result<Bencode, ParseError> {
            self.pos += 1;
            let mut items = Vec::new();

            loop {
                match self.peek() {
                    Some(END_INDICATOR) => {
                        self.pos += 1;
                        return Ok(Bencode::List(items));
                    }
                    Some(_) => items.push(self.value(depth + 1)?),
                    None => return Err(self.eof()),
                }
            }
        }

        fn dict(&mut self, depth: usize) -> Result<Bencode, ParseError> {
            self.pos += 1;
            let mut map = BTreeMap::new();

            loop {
                let key_offset = self.pos;
                match self.peek() {
                    Some(END_INDICATOR) => {
                        self.pos += 1;
                        return Ok(Bencode::Dict(map));
                    }
                    Some(b) if BYTES_INDICATOR.contains(&b) => {}
                    Some(_) => return Err(ParseError::NonStringKey { offset: key_offset }),
                    None => return Err(self.eof()),
                }

                let key = self.bytes()?;
                let value = self.value(depth + 1)?;

                match map.entry(key) {
                    Entry::Vacant(slot) => {
                        slot.insert(value);
                    }
                    Entry::Occupied(_) => {
                        return Err(ParseError::DuplicateKey { offset: key_offset })
                    }
                }
            }
        }
    }

    /// Decodes exactly one value spanning the whole of `input`.
    pub fn decode(input: &[u8]) -> Result<Bencode, ParseError> {
        let (value, rest) = decode_partial(input)?;
        if !rest.is_empty() {
            return Err(ParseError::TrailingBytes {
                offset: input.len() - rest.len(),
                remaining: rest.len(),
            });
        }
        Ok(value)
    }

    /// Decodes one value from the front of `input` and hands back whatever
    /// follows it.
    pub fn decode_partial(input: &[u8]) -> Result<(Bencode, &[u8]), ParseError> {
        let mut cursor = Cursor { input, pos: 0 };
        let value = cursor.value(0)?;
        Ok((value, &input[cursor.pos..]))
    }
}
