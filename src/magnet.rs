use percent_encoding::percent_decode_str;

use crate::error::{Error, Result};

const SCHEME: &str = "magnet:?";
const BTIH_PREFIX: &str = "urn:btih:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: [u8; 20],
    pub display_name: Option<String>,
    pub tracker: Option<String>,
}

impl MagnetLink {
    /// Parses a `magnet:?xt=urn:btih:<hex>&dn=..&tr=..` link. Only the
    /// first `tr` is kept and keys we do not know are skipped.
    pub fn parse(link: &str) -> Result<MagnetLink> {
        let query = link
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::Magnet(format!("link must start with `{SCHEME}`")))?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut tracker = None;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Magnet(format!("parameter `{pair}` has no value")))?;
            let value = percent_decode_str(value)
                .decode_utf8()
                .map_err(|e| Error::Magnet(format!("`{key}` is not valid utf-8: {e}")))?;

            match key {
                "xt" => info_hash = Some(parse_btih(&value)?),
                "dn" => display_name = Some(value.into_owned()),
                "tr" if tracker.is_none() => tracker = Some(value.into_owned()),
                _ => {}
            }
        }

        Ok(MagnetLink {
            info_hash: info_hash.ok_or_else(|| Error::Magnet("missing `xt` parameter".into()))?,
            display_name,
            tracker,
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn require_tracker(&self) -> Result<&str> {
        self.tracker
            .as_deref()
            .ok_or_else(|| Error::Magnet("link has no tracker".into()))
    }
}

fn parse_btih(xt: &str) -> Result<[u8; 20]> {
    let hash = xt
        .strip_prefix(BTIH_PREFIX)
        .ok_or_else(|| Error::Magnet(format!("`xt` must start with `{BTIH_PREFIX}`")))?;
    if hash.len() != 40 {
        return Err(Error::Magnet(format!(
            "info hash must be 40 hex characters, got {}",
            hash.len()
        )));
    }

    let mut info_hash = [0u8; 20];
    hex::decode_to_slice(hash, &mut info_hash)
        .map_err(|e| Error::Magnet(format!("info hash is not hex: {e}")))?;
    Ok(info_hash)
}
