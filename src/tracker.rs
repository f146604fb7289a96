use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use log::{debug, info};
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use reqwest::Client;

use crate::{
    bencoding::decoder,
    error::{Error, Result},
};

const TRACKER_TIMEOUT: Duration = Duration::from_secs(10);

/// What we tell the tracker about ourselves on announce.
#[derive(Debug, Clone)]
pub struct Announce {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

pub struct Tracker {
    url: String,
    http_client: Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    pub interval: u32,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub peers: Vec<SocketAddr>,
}

impl TrackerResponse {
    // compact format: 4 bytes of ipv4 followed by a big endian port
    fn parse_peers(data: &[u8]) -> Result<Vec<SocketAddr>> {
        if data.len() % 6 != 0 {
            return Err(Error::Tracker(format!(
                "peers field is {} bytes, not a multiple of 6",
                data.len()
            )));
        }

        Ok(data
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::V4(SocketAddrV4::new(ip, port))
            })
            .collect())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<TrackerResponse> {
        let bencode = decoder::decode(bytes)?;
        if bencode.as_dict().is_none() {
            return Err(Error::Tracker("response is not a dictionary".into()));
        }

        if let Some(reason) = bencode.get("failure reason") {
            let reason = reason.as_str().unwrap_or("<binary failure reason>");
            return Err(Error::Tracker(reason.to_string()));
        }

        let interval = u32::try_from(bencode.require_int("interval")?)
            .map_err(|_| Error::Tracker("interval out of range".into()))?;

        // seeders and leechers, not every tracker sends them
        let count = |key: &str| {
            bencode
                .get(key)
                .and_then(|v| v.as_int())
                .and_then(|n| u64::try_from(n).ok())
        };

        let peers = Self::parse_peers(bencode.require_bytes("peers")?)?;

        Ok(TrackerResponse {
            interval,
            complete: count("complete"),
            incomplete: count("incomplete"),
            peers,
        })
    }
}

impl Tracker {
    pub fn new(url: impl Into<String>) -> Result<Tracker> {
        let http_client = Client::builder().timeout(TRACKER_TIMEOUT).build()?;
        Ok(Tracker {
            url: url.into(),
            http_client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    // builds query in the bittorrent specific format, binary values are
    // percent encoded byte by byte
    fn announce_url(&self, announce: &Announce) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{separator}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url,
            percent_encode(&announce.info_hash, NON_ALPHANUMERIC),
            percent_encode(&announce.peer_id, NON_ALPHANUMERIC),
            announce.port,
            announce.uploaded,
            announce.downloaded,
            announce.left,
        )
    }

    /// Asks the tracker for peers.
    pub async fn announce(&self, announce: &Announce) -> Result<TrackerResponse> {
        let url = self.announce_url(announce);
        debug!("announcing to {url}");

        let res = self.http_client.get(&url).send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(Error::Tracker(format!("tracker answered {status}: {body}")));
        }

        let bytes = res.bytes().await?;
        let response = TrackerResponse::from_bytes(&bytes)?;
        info!(
            "tracker returned {} peers, next announce in {}s",
            response.peers.len(),
            response.interval
        );
        Ok(response)
    }
}
