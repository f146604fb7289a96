use sha1::{Digest, Sha1};

use crate::{
    bencoding::{decoder, encoder, Bencode},
    client::PieceWork,
    error::{Error, Result},
};

// single file torrents only, which is all the download path handles

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Torrent {
    pub announce: String,
    pub info_hash: [u8; 20],
    pub name: String,
    pub length: u64,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
}

// sha1 of the canonical encoding of the info dict.
// this is the content identifier sent to trackers and peers
pub fn info_hash(info: &Bencode) -> [u8; 20] {
    Sha1::digest(encoder::encode(info)).into()
}

impl Torrent {
    /// Parses the contents of a `.torrent` file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Torrent> {
        let root = decoder::decode(bytes)?;
        let announce = root.require_str("announce")?.to_string();
        let info = root.require_dict("info")?;
        Torrent::build(announce, info)
    }

    /// Builds a torrent from a raw info dictionary, as fetched over the
    /// metadata extension for a magnet link.
    pub fn from_info(info_bytes: &[u8], announce: impl Into<String>) -> Result<Torrent> {
        let info = decoder::decode(info_bytes)?;
        if info.as_dict().is_none() {
            return Err(Error::Metainfo("info is not a dictionary".into()));
        }
        Torrent::build(announce.into(), &info)
    }

    fn build(announce: String, info: &Bencode) -> Result<Torrent> {
        let name = info.require_str("name")?.to_string();

        let length = u64::try_from(info.require_int("length")?)
            .map_err(|_| Error::Metainfo("negative length".into()))?;

        let piece_length = u32::try_from(info.require_int("piece length")?)
            .ok()
            .filter(|len| *len > 0)
            .ok_or_else(|| Error::Metainfo("piece length must be a positive 32-bit value".into()))?;

        let pieces = info.require_bytes("pieces")?;
        if pieces.len() % 20 != 0 {
            return Err(Error::Metainfo(format!(
                "pieces is {} bytes, not a multiple of 20",
                pieces.len()
            )));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let expected = length.div_ceil(piece_length as u64);
        if piece_hashes.len() as u64 != expected {
            return Err(Error::Metainfo(format!(
                "{} piece hashes for a length needing {expected}",
                piece_hashes.len()
            )));
        }

        Ok(Torrent {
            announce,
            info_hash: info_hash(info),
            name,
            length,
            piece_length,
            piece_hashes,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`; only the last piece can be shorter than
    /// `piece_length`. `None` when out of range.
    pub fn piece_len(&self, index: u32) -> Option<u32> {
        if index as usize >= self.piece_hashes.len() {
            return None;
        }
        let start = index as u64 * self.piece_length as u64;
        Some((self.length - start).min(self.piece_length as u64) as u32)
    }

    pub fn piece_work(&self, index: u32) -> Option<PieceWork> {
        Some(PieceWork {
            index,
            length: self.piece_len(index)?,
            hash: self.piece_hashes[index as usize],
        })
    }

    // every piece, in index order
    pub fn pieces(&self) -> Vec<PieceWork> {
        (0..self.piece_hashes.len() as u32)
            .filter_map(|index| self.piece_work(index))
            .collect()
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}
