//! Everything that travels over a peer connection: the fixed 68-byte
//! handshake, the length-prefixed frames that follow it, the typed messages
//! carried in those frames, and the bencoded payloads of the extension
//! protocol.

use std::collections::BTreeMap;

use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    bencoding::{decoder, encoder, Bencode},
    error::{Error, Result},
};

pub const PSTR: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

// extension protocol support lives in bit 4 of reserved byte 5 (byte 25 overall)
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// Frames above this size are treated as a broken stream.
pub const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

/// Sub-type of the extended message that carries the extension handshake.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;
pub const METADATA_EXTENSION: &str = "ut_metadata";
/// The id we ask peers to use when they send us metadata messages.
pub const LOCAL_METADATA_ID: u8 = 16;
pub const METADATA_PIECE_LEN: usize = 1 << 14;

// **** FRAMING **** //

/// Writes `payload` behind its 4-byte big-endian length.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::protocol(format!("frame of {} bytes is too large", payload.len())))?;

    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next non-empty frame. Keep-alives (zero length) are swallowed
/// here and never reach the caller. A stream that ends part way through a
/// frame is a transport error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    loop {
        let len = reader.read_u32().await?;
        if len == 0 {
            trace!("< keep-alive");
            continue;
        }
        if len > MAX_FRAME_LEN {
            return Err(Error::protocol(format!(
                "frame length {len} exceeds {MAX_FRAME_LEN}"
            )));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;
        return Ok(payload);
    }
}

// **** MESSAGES **** //

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        use MessageId::*;
        Ok(match id {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            20 => Extended,
            other => return Err(Error::protocol(format!("unknown message id {other}"))),
        })
    }
}

/// A message exchanged after the handshake. Keep-alives never show up here
/// since [`read_frame`] consumes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// `id` is the extended sub-type: 0 for the extension handshake,
    /// otherwise an id negotiated in that handshake.
    Extended { id: u8, payload: Vec<u8> },
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have(_) => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
            Message::Extended { .. } => MessageId::Extended,
        }
    }

    /// Frame payload for this message: the type byte followed by the body.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.id() as u8];
        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have(index) => buf.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield(bits) => buf.extend_from_slice(bits),
            // <id=6><index><begin><length>
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
            }
            Message::Extended { id, payload } => {
                buf.push(*id);
                buf.extend_from_slice(payload);
            }
        }
        buf
    }

    /// Parses a frame payload, checking that the body fits its type.
    pub fn decode(frame: &[u8]) -> Result<Message> {
        let (&type_byte, body) = frame
            .split_first()
            .ok_or_else(|| Error::protocol("empty frame"))?;
        let id = MessageId::try_from(type_byte)?;

        let expect_len = |len: usize| {
            if body.len() == len {
                Ok(())
            } else {
                Err(Error::protocol(format!(
                    "{id:?} body is {} bytes, expected {len}",
                    body.len()
                )))
            }
        };

        Ok(match id {
            MessageId::Choke => expect_len(0).map(|_| Message::Choke)?,
            MessageId::Unchoke => expect_len(0).map(|_| Message::Unchoke)?,
            MessageId::Interested => expect_len(0).map(|_| Message::Interested)?,
            MessageId::NotInterested => expect_len(0).map(|_| Message::NotInterested)?,
            MessageId::Have => {
                expect_len(4)?;
                Message::Have(be_u32(body))
            }
            MessageId::Bitfield => Message::Bitfield(body.to_vec()),
            MessageId::Request | MessageId::Cancel => {
                expect_len(12)?;
                let (index, begin, length) =
                    (be_u32(body), be_u32(&body[4..]), be_u32(&body[8..]));
                if id == MessageId::Request {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            MessageId::Piece => {
                if body.len() < 8 {
                    return Err(Error::protocol(format!(
                        "piece body is {} bytes, shorter than its 8-byte header",
                        body.len()
                    )));
                }
                Message::Piece {
                    index: be_u32(body),
                    begin: be_u32(&body[4..]),
                    block: body[8..].to_vec(),
                }
            }
            MessageId::Extended => {
                let (&ext_id, payload) = body
                    .split_first()
                    .ok_or_else(|| Error::protocol("extended message without a sub-type"))?;
                Message::Extended {
                    id: ext_id,
                    payload: payload.to_vec(),
                }
            }
        })
    }
}

// **** HANDSHAKE **** //

/// The first 68 bytes on every connection, in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], extensions: bool) -> Self {
        let mut reserved = [0u8; 8];
        if extensions {
            reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        }
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PSTR.len() as u8;
        buf[1..20].copy_from_slice(PSTR);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn decode(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self> {
        if buf[0] as usize != PSTR.len() || &buf[1..20] != PSTR {
            return Err(Error::protocol(
                "handshake does not carry the \"BitTorrent protocol\" string",
            ));
        }

        let mut handshake = Handshake {
            reserved: [0; 8],
            info_hash: [0; 20],
            peer_id: [0; 20],
        };
        handshake.reserved.copy_from_slice(&buf[20..28]);
        handshake.info_hash.copy_from_slice(&buf[28..48]);
        handshake.peer_id.copy_from_slice(&buf[48..68]);
        Ok(handshake)
    }
}

// **** EXTENSION PROTOCOL **** //

/// Payload of the extension handshake: extension names mapped to the ids
/// the sender wants to receive them under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    pub extensions: BTreeMap<String, u8>,
    pub metadata_size: Option<usize>,
}

impl ExtensionHandshake {
    /// What we advertise: only the metadata extension.
    pub fn local() -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert(METADATA_EXTENSION.to_string(), LOCAL_METADATA_ID);
        Self {
            extensions,
            metadata_size: None,
        }
    }

    pub fn metadata_id(&self) -> Option<u8> {
        self.extensions.get(METADATA_EXTENSION).copied()
    }

    pub fn to_message(&self) -> Message {
        let m = Bencode::dict(
            self.extensions
                .iter()
                .map(|(name, id)| (name.as_str(), Bencode::Int(*id as i64))),
        );

        let mut dict = BTreeMap::new();
        dict.insert(b"m".to_vec(), m);
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), Bencode::Int(size as i64));
        }

        Message::Extended {
            id: EXTENSION_HANDSHAKE_ID,
            payload: encoder::encode(&Bencode::Dict(dict)),
        }
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let value = decoder::decode(payload)?;
        let m = value
            .require_dict("m")?
            .as_dict()
            .ok_or_else(|| Error::protocol("extension handshake without an `m` dictionary"))?;

        // an id of 0 means the extension is disabled
        let extensions = m
            .iter()
            .filter_map(|(name, id)| {
                let name = std::str::from_utf8(name).ok()?;
                let id = u8::try_from(id.as_int()?).ok().filter(|id| *id > 0)?;
                Some((name.to_string(), id))
            })
            .collect();

        let metadata_size = value
            .get("metadata_size")
            .and_then(Bencode::as_int)
            .and_then(|size| usize::try_from(size).ok());

        Ok(Self {
            extensions,
            metadata_size,
        })
    }
}

/// Messages of the metadata extension, used to fetch the info dictionary
/// from a peer when all we have is its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request {
        piece: u32,
    },
    Data {
        piece: u32,
        total_size: usize,
        data: Vec<u8>,
    },
    Reject {
        piece: u32,
    },
}

impl MetadataMessage {
    pub fn encode(&self) -> Vec<u8> {
        let (msg_type, piece) = match self {
            MetadataMessage::Request { piece } => (0, piece),
            MetadataMessage::Data { piece, .. } => (1, piece),
            MetadataMessage::Reject { piece } => (2, piece),
        };

        let mut dict = vec![
            ("msg_type", Bencode::Int(msg_type)),
            ("piece", Bencode::Int(*piece as i64)),
        ];
        if let MetadataMessage::Data { total_size, .. } = self {
            dict.push(("total_size", Bencode::Int(*total_size as i64)));
        }

        let mut buf = encoder::encode(&Bencode::dict(dict));
        // the raw metadata trails the dictionary
        if let MetadataMessage::Data { data, .. } = self {
            buf.extend_from_slice(data);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (header, rest) = decoder::decode_partial(payload)?;

        let piece = u32::try_from(header.require_int("piece")?)
            .map_err(|_| Error::protocol("metadata piece index out of range"))?;

        match header.require_int("msg_type")? {
            0 => Ok(MetadataMessage::Request { piece }),
            1 => {
                let total_size = usize::try_from(header.require_int("total_size")?)
                    .map_err(|_| Error::protocol("negative metadata total_size"))?;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data: rest.to_vec(),
                })
            }
            2 => Ok(MetadataMessage::Reject { piece }),
            other => Err(Error::protocol(format!("unknown metadata msg_type {other}"))),
        }
    }
}
