//! A scripted seeder for integration tests.
//!
//! [`Seeder::spawn`] plays the remote side of a connection over an in-memory
//! duplex stream: handshake, bitfield, extension handshake, metadata and
//! piece requests. [`Faults`] makes it misbehave in specific ways.
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use rust_torrent::{
    bencoding::{encoder, Bencode},
    error::Result,
    peer::PeerConnection,
    protocol::{
        read_frame, write_frame, ExtensionHandshake, Handshake, Message, MetadataMessage,
        HANDSHAKE_LEN, LOCAL_METADATA_ID, METADATA_PIECE_LEN,
    },
    ClientConfig, RetryPolicy, Torrent,
};
use sha1::{Digest, Sha1};
use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
    spawn,
};

pub const SEEDER_ID: [u8; 20] = *b"-FS0001-000000000001";
pub const SEEDER_METADATA_ID: u8 = 3;
pub const ANNOUNCE: &str = "http://tracker.test/announce";

/// Content shared by every seeder of a test.
#[derive(Debug)]
pub struct Fixture {
    pub data: Vec<u8>,
    pub info: Vec<u8>,
    pub torrent: Torrent,
}

impl Fixture {
    pub fn new(len: usize, piece_length: u32) -> Arc<Fixture> {
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();

        let mut pieces = Vec::new();
        for chunk in data.chunks(piece_length as usize) {
            pieces.extend_from_slice(&Sha1::digest(chunk));
        }

        let info = encoder::encode(&Bencode::dict(vec![
            ("length", Bencode::Int(len as i64)),
            ("name", Bencode::from("fixture.bin")),
            ("piece length", Bencode::Int(piece_length as i64)),
            ("pieces", Bencode::Bytes(pieces)),
        ]));
        let torrent = Torrent::from_info(&info, ANNOUNCE).expect("fixture info is valid");

        Arc::new(Fixture {
            data,
            info,
            torrent,
        })
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.torrent.info_hash
    }

    pub fn piece(&self, index: u32) -> &[u8] {
        let start = index as usize * self.torrent.piece_length as usize;
        let end = (start + self.torrent.piece_length as usize).min(self.data.len());
        &self.data[start..end]
    }
}

#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Set the extension bit and answer the extension handshake.
    pub extensions: bool,
    /// Send the extension handshake before the bitfield.
    pub extensions_first: bool,
    /// Flip a bit in the first block of this piece, the first time only.
    pub corrupt_once: Option<u32>,
    /// Flip a bit in the first block of this piece, every time.
    pub corrupt_always: Option<u32>,
    /// Close the connection instead of sending block number N (0-based).
    pub hang_up_after_blocks: Option<usize>,
    /// Send a `have` right before the first block of the first piece served.
    pub interject_have: bool,
    /// Answer the handshake for a different torrent.
    pub wrong_info_hash: bool,
    /// Reject every metadata request.
    pub reject_metadata: bool,
    /// Keep quiet after the handshake.
    pub silent: bool,
    /// Send a `have` frame with a truncated body before the bitfield.
    pub short_have_first: bool,
    /// Send an undecodable extension handshake before the bitfield, even
    /// when extensions were not negotiated.
    pub garbled_extensions_first: bool,
    /// Answer with an unrelated extended message instead of the extension
    /// handshake.
    pub wrong_extension_reply: bool,
}

pub struct Seeder;

impl Seeder {
    /// Starts a seeder task and returns the client end of the stream.
    pub fn spawn(fixture: Arc<Fixture>, faults: Faults) -> DuplexStream {
        let (client, server) = duplex(256 * 1024);
        spawn(async move {
            // the client hanging up ends the session, nothing to report
            let _ = serve(server, fixture, faults).await;
        });
        client
    }
}

async fn serve(mut stream: DuplexStream, fixture: Arc<Fixture>, faults: Faults) -> Result<()> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    let theirs = Handshake::decode(&buf)?;

    let info_hash = if faults.wrong_info_hash {
        [0xee; 20]
    } else {
        fixture.info_hash()
    };
    let ours = Handshake::new(info_hash, SEEDER_ID, faults.extensions);
    stream.write_all(&ours.encode()).await?;

    if faults.silent {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        return Ok(());
    }

    let extended = faults.extensions && theirs.supports_extensions();
    let ext_handshake = ExtensionHandshake {
        extensions: [("ut_metadata".to_string(), SEEDER_METADATA_ID)].into(),
        metadata_size: Some(fixture.info.len()),
    };
    let bitfield = Message::Bitfield(vec![0xff; fixture.torrent.num_pieces().div_ceil(8)]);

    if extended && faults.extensions_first {
        send(&mut stream, &ext_handshake.to_message()).await?;
    }
    if faults.short_have_first {
        write_frame(&mut stream, &[4, 0, 0]).await?;
    }
    if faults.garbled_extensions_first {
        write_frame(&mut stream, &[20, 0, b'x']).await?;
    }
    send(&mut stream, &Message::Have(0)).await?;
    send(&mut stream, &bitfield).await?;
    if extended && faults.wrong_extension_reply {
        let reply = Message::Extended {
            id: 5,
            payload: b"de".to_vec(),
        };
        send(&mut stream, &reply).await?;
    } else if extended && !faults.extensions_first {
        send(&mut stream, &ext_handshake.to_message()).await?;
    }

    let mut blocks_sent = 0;
    let mut corrupted = false;
    let mut interjected = false;

    loop {
        let frame = read_frame(&mut stream).await?;
        match Message::decode(&frame)? {
            Message::Interested => {
                send(&mut stream, &Message::NotInterested).await?;
                send(&mut stream, &Message::Unchoke).await?;
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                if faults.hang_up_after_blocks == Some(blocks_sent) {
                    return Ok(());
                }

                let piece = fixture.piece(index);
                let mut block = piece[begin as usize..(begin + length) as usize].to_vec();

                if begin == 0 {
                    if faults.corrupt_always == Some(index)
                        || (faults.corrupt_once == Some(index) && !corrupted)
                    {
                        block[0] ^= 0x01;
                        corrupted = true;
                    }
                    if faults.interject_have && !interjected {
                        send(&mut stream, &Message::Have(index)).await?;
                        interjected = true;
                    }
                }

                send(
                    &mut stream,
                    &Message::Piece {
                        index,
                        begin,
                        block,
                    },
                )
                .await?;
                blocks_sent += 1;
            }
            Message::Extended { id, payload } if id == SEEDER_METADATA_ID => {
                let MetadataMessage::Request { piece } = MetadataMessage::decode(&payload)? else {
                    continue;
                };
                let reply = if faults.reject_metadata {
                    MetadataMessage::Reject { piece }
                } else {
                    let start = piece as usize * METADATA_PIECE_LEN;
                    let end = (start + METADATA_PIECE_LEN).min(fixture.info.len());
                    MetadataMessage::Data {
                        piece,
                        total_size: fixture.info.len(),
                        data: fixture.info[start..end].to_vec(),
                    }
                };
                send(
                    &mut stream,
                    &Message::Extended {
                        id: LOCAL_METADATA_ID,
                        payload: reply.encode(),
                    },
                )
                .await?;
            }
            _ => {}
        }
    }
}

async fn send(stream: &mut DuplexStream, message: &Message) -> Result<()> {
    write_frame(stream, &message.encode()).await
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        block_size: 1024,
        retry: RetryPolicy {
            delay: Duration::from_millis(10),
            ..RetryPolicy::default()
        },
        io_timeout: Some(Duration::from_secs(5)),
        ..ClientConfig::default()
    }
}

pub fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 6881))
}

/// A connection to a fresh seeder, not set up yet.
pub fn connection(
    fixture: &Arc<Fixture>,
    faults: Faults,
    n: u8,
    config: &ClientConfig,
) -> PeerConnection<DuplexStream> {
    let stream = Seeder::spawn(fixture.clone(), faults);
    PeerConnection::new(stream, addr(n), format!("peer#{n}"), config)
}

/// A connection to a fresh seeder, already unchoked.
pub async fn ready_connection(
    fixture: &Arc<Fixture>,
    faults: Faults,
    n: u8,
    config: &ClientConfig,
) -> Result<PeerConnection<DuplexStream>> {
    let mut conn = connection(fixture, faults, n, config);
    conn.setup(fixture.info_hash(), config).await?;
    Ok(conn)
}
