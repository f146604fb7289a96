use std::{collections::HashMap, fmt, future::Future, net::SocketAddr, time::Duration};

use log::{debug, info, warn};
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    task::JoinSet,
    time,
};

use crate::{
    client::{Piece, PieceWork},
    config::ClientConfig,
    error::{Error, Result},
    protocol::{
        read_frame, write_frame, ExtensionHandshake, Handshake, Message, MessageId, MetadataMessage,
        EXTENSION_HANDSHAKE_ID, HANDSHAKE_LEN, LOCAL_METADATA_ID, METADATA_PIECE_LEN,
    },
};

// refuse to buffer metadata larger than this
const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Handshaking,
    AwaitingBitfield,
    Extending,
    Interested,
    Unchoked,
    Failed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Hands out short `peer#N` labels for log lines. Labels are stable per
/// address for the lifetime of the map.
#[derive(Debug, Default)]
pub struct PeerLabels {
    ids: HashMap<SocketAddr, usize>,
}

impl PeerLabels {
    pub fn label(&mut self, addr: SocketAddr) -> String {
        let next = self.ids.len() + 1;
        let id = *self.ids.entry(addr).or_insert(next);
        format!("peer#{id} {addr}")
    }
}

/// One connection to a remote peer.
///
/// The connection walks through the session setup one step at a time (see
/// [`PeerState`]) and, once unchoked, downloads one piece at a time. Any
/// failure during setup leaves it in [`PeerState::Failed`].
pub struct PeerConnection<S = TcpStream> {
    stream: S,
    addr: SocketAddr,
    label: String,
    state: PeerState,
    block_size: u32,
    io_timeout: Option<Duration>,
    remote: Option<Handshake>,
    bitfield: Option<Vec<u8>>,
    extensions_enabled: bool,
    remote_extensions: Option<ExtensionHandshake>,
    // block requests sent but not answered yet
    unanswered: usize,
}

impl PeerConnection<TcpStream> {
    pub async fn connect(addr: SocketAddr, label: String, config: &ClientConfig) -> Result<Self> {
        debug!("[{label}] connecting");
        let stream = with_timeout(config.io_timeout, async {
            Ok::<_, Error>(TcpStream::connect(addr).await?)
        })
        .await?;
        Ok(PeerConnection::new(stream, addr, label, config))
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, addr: SocketAddr, label: String, config: &ClientConfig) -> Self {
        PeerConnection {
            stream,
            addr,
            label,
            state: PeerState::Idle,
            block_size: config.clamped_block_size(),
            io_timeout: config.io_timeout,
            remote: None,
            bitfield: None,
            extensions_enabled: false,
            remote_extensions: None,
            unanswered: 0,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn remote_peer_id(&self) -> Option<[u8; 20]> {
        self.remote.as_ref().map(|h| h.peer_id)
    }

    // kept for inspection only, every peer is assumed to have every piece
    pub fn bitfield(&self) -> Option<&[u8]> {
        self.bitfield.as_deref()
    }

    /// Both sides set the extension bit in their handshakes.
    pub fn extensions_enabled(&self) -> bool {
        self.extensions_enabled
    }

    /// The id the peer wants metadata messages sent under.
    pub fn metadata_id(&self) -> Option<u8> {
        self.remote_extensions
            .as_ref()
            .and_then(ExtensionHandshake::metadata_id)
    }

    pub fn metadata_size(&self) -> Option<usize> {
        self.remote_extensions.as_ref().and_then(|e| e.metadata_size)
    }

    /// Runs the whole session setup: handshake, bitfield, extension
    /// handshake when both sides support it, then interested until unchoked.
    pub async fn setup(&mut self, info_hash: [u8; 20], config: &ClientConfig) -> Result<()> {
        self.handshake(info_hash, config).await?;
        self.await_bitfield().await?;
        if self.extensions_enabled {
            self.negotiate_extensions().await?;
        }
        self.express_interest().await
    }

    pub async fn handshake(
        &mut self,
        info_hash: [u8; 20],
        config: &ClientConfig,
    ) -> Result<Handshake> {
        self.expect_state(PeerState::Idle)?;
        self.state = PeerState::Handshaking;
        let result = self.exchange_handshakes(info_hash, config).await;
        self.track(result)
    }

    async fn exchange_handshakes(
        &mut self,
        info_hash: [u8; 20],
        config: &ClientConfig,
    ) -> Result<Handshake> {
        let ours = Handshake::new(info_hash, config.peer_id, config.extensions);
        self.stream.write_all(&ours.encode()).await?;
        self.stream.flush().await?;

        let mut buf = [0u8; HANDSHAKE_LEN];
        let stream = &mut self.stream;
        with_timeout(self.io_timeout, async {
            stream.read_exact(&mut buf).await?;
            Ok::<_, Error>(())
        })
        .await?;

        let theirs = Handshake::decode(&buf)?;
        if theirs.info_hash != info_hash {
            return Err(Error::protocol(format!(
                "peer answered for info hash {}",
                hex::encode(theirs.info_hash)
            )));
        }

        self.extensions_enabled = config.extensions && theirs.supports_extensions();
        info!(
            "[{}] handshake done, peer id {}",
            self.label,
            hex::encode(theirs.peer_id)
        );
        self.remote = Some(theirs.clone());
        self.state = PeerState::AwaitingBitfield;
        Ok(theirs)
    }

    pub async fn await_bitfield(&mut self) -> Result<()> {
        self.expect_state(PeerState::AwaitingBitfield)?;
        let result = self.read_until_bitfield().await;
        self.track(result)
    }

    async fn read_until_bitfield(&mut self) -> Result<()> {
        let wanted: &[MessageId] = if self.extensions_enabled {
            &[MessageId::Bitfield, MessageId::Extended]
        } else {
            &[MessageId::Bitfield]
        };

        loop {
            match self.recv_wanted(wanted).await? {
                Message::Bitfield(bits) => {
                    debug!("[{}] bitfield of {} bytes", self.label, bits.len());
                    self.bitfield = Some(bits);
                    break;
                }
                // some peers send their extension handshake before the bitfield
                Message::Extended { id, payload } if id == EXTENSION_HANDSHAKE_ID => {
                    self.remote_extensions = Some(ExtensionHandshake::from_payload(&payload)?);
                }
                other => debug!("[{}] ignoring {:?} before bitfield", self.label, other.id()),
            }
        }

        self.state = if self.extensions_enabled {
            PeerState::Extending
        } else {
            PeerState::Interested
        };
        Ok(())
    }

    pub async fn negotiate_extensions(&mut self) -> Result<()> {
        self.expect_state(PeerState::Extending)?;
        let result = self.exchange_extension_handshakes().await;
        self.track(result)
    }

    async fn exchange_extension_handshakes(&mut self) -> Result<()> {
        self.send(&ExtensionHandshake::local().to_message()).await?;

        if self.remote_extensions.is_none() {
            let theirs = match self.recv().await? {
                Message::Extended { id, payload } if id == EXTENSION_HANDSHAKE_ID => {
                    ExtensionHandshake::from_payload(&payload)?
                }
                other => {
                    return Err(Error::protocol(format!(
                        "expected extension handshake, got {:?}",
                        other.id()
                    )))
                }
            };
            self.remote_extensions = Some(theirs);
        }

        debug!(
            "[{}] peer extensions {:?}",
            self.label,
            self.remote_extensions.as_ref().map(|e| &e.extensions)
        );
        self.state = PeerState::Interested;
        Ok(())
    }

    pub async fn express_interest(&mut self) -> Result<()> {
        if self.state == PeerState::Extending {
            // extension handshake skipped by the caller
            self.state = PeerState::Interested;
        }
        self.expect_state(PeerState::Interested)?;
        let result = self.wait_for_unchoke().await;
        self.track(result)
    }

    async fn wait_for_unchoke(&mut self) -> Result<()> {
        self.send(&Message::Interested).await?;
        self.recv_wanted(&[MessageId::Unchoke]).await?;
        info!("[{}] unchoked", self.label);
        self.state = PeerState::Unchoked;
        Ok(())
    }

    /// Downloads and verifies a single piece. Every block request goes out
    /// before the first response is read. Anything other than a piece
    /// message in the meantime is a protocol violation.
    pub async fn download_piece(&mut self, work: &PieceWork) -> Result<Vec<u8>> {
        self.expect_state(PeerState::Unchoked)?;

        self.drain_unanswered().await?;

        let mut piece = Piece::from_work(work, self.block_size);
        debug!(
            "[{}] downloading piece {} in {} blocks",
            self.label,
            work.index,
            piece.blocks().len()
        );

        let requests: Vec<Message> = piece.requests().collect();
        for request in &requests {
            self.send(request).await?;
            self.unanswered += 1;
        }

        while !piece.is_complete() {
            match self.recv().await? {
                Message::Piece {
                    index,
                    begin,
                    block,
                } => {
                    self.unanswered = self.unanswered.saturating_sub(1);
                    piece.store_block(index, begin, block)?;
                }
                other => {
                    return Err(Error::protocol(format!(
                        "expected a piece message, got {:?}",
                        other.id()
                    )))
                }
            }
        }

        piece.verify()
    }

    /// Fetches the info dictionary over the metadata extension and checks
    /// it against `info_hash`.
    pub async fn fetch_metadata(&mut self, info_hash: &[u8; 20]) -> Result<Vec<u8>> {
        let peer_id = self
            .metadata_id()
            .ok_or_else(|| Error::Metadata("peer does not support the metadata extension".into()))?;

        let mut metadata = Vec::new();
        let mut total_size = None;
        let mut piece = 0;

        loop {
            let request = MetadataMessage::Request { piece };
            self.send(&Message::Extended {
                id: peer_id,
                payload: request.encode(),
            })
            .await?;

            let (data, size) = self.recv_metadata_piece(piece).await?;
            let total = *total_size.get_or_insert(size);
            if size != total {
                return Err(Error::Metadata(format!(
                    "total_size changed from {total} to {size}"
                )));
            }
            if total > MAX_METADATA_SIZE {
                return Err(Error::Metadata(format!("metadata of {total} bytes is too large")));
            }
            if data.len() > METADATA_PIECE_LEN || metadata.len() + data.len() > total {
                return Err(Error::Metadata(format!(
                    "metadata piece {piece} has {} bytes, more than announced",
                    data.len()
                )));
            }
            if data.is_empty() && metadata.len() < total {
                return Err(Error::Metadata(format!("metadata piece {piece} is empty")));
            }

            metadata.extend_from_slice(&data);
            if metadata.len() == total {
                break;
            }
            piece += 1;
        }

        let actual: [u8; 20] = Sha1::digest(&metadata).into();
        if &actual != info_hash {
            return Err(Error::Metadata(format!(
                "metadata hashes to {}, expected {}",
                hex::encode(actual),
                hex::encode(info_hash)
            )));
        }

        info!("[{}] fetched {} bytes of metadata", self.label, metadata.len());
        Ok(metadata)
    }

    async fn recv_metadata_piece(&mut self, expected: u32) -> Result<(Vec<u8>, usize)> {
        loop {
            let payload = match self.recv_wanted(&[MessageId::Extended]).await? {
                Message::Extended { id, payload } if id == LOCAL_METADATA_ID => payload,
                other => {
                    debug!("[{}] ignoring {:?} during metadata fetch", self.label, other.id());
                    continue;
                }
            };

            return match MetadataMessage::decode(&payload)? {
                MetadataMessage::Data {
                    piece,
                    total_size,
                    data,
                } if piece == expected => Ok((data, total_size)),
                MetadataMessage::Reject { piece } => Err(Error::Metadata(format!(
                    "peer rejected metadata piece {piece}"
                ))),
                other => Err(Error::Metadata(format!(
                    "unexpected metadata message {other:?} while waiting for piece {expected}"
                ))),
            };
        }
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        write_frame(&mut self.stream, &message.encode()).await
    }

    pub async fn recv(&mut self) -> Result<Message> {
        let frame = self.recv_frame().await?;
        Message::decode(&frame)
    }

    // waits for one of `wanted`, dropping anything else by its type byte
    // alone so a malformed message we do not care about cannot fail us
    async fn recv_wanted(&mut self, wanted: &[MessageId]) -> Result<Message> {
        loop {
            let frame = self.recv_frame().await?;
            match frame.first().map(|&id| MessageId::try_from(id)) {
                Some(Ok(id)) if wanted.contains(&id) => return Message::decode(&frame),
                _ => debug!("[{}] ignoring message type {:?}", self.label, frame.first()),
            }
        }
    }

    // a piece that failed part way leaves replies in flight, they have to
    // be read off before the next piece can start
    async fn drain_unanswered(&mut self) -> Result<()> {
        if self.unanswered > 0 {
            debug!(
                "[{}] dropping {} stale block replies",
                self.label, self.unanswered
            );
        }
        while self.unanswered > 0 {
            let frame = self.recv_frame().await?;
            if frame.first() == Some(&(MessageId::Piece as u8)) {
                self.unanswered -= 1;
            }
        }
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        let stream = &mut self.stream;
        with_timeout(self.io_timeout, read_frame(stream)).await
    }

    fn expect_state(&self, expected: PeerState) -> Result<()> {
        if self.state != expected {
            return Err(Error::protocol(format!(
                "connection is {}, expected {expected}",
                self.state
            )));
        }
        Ok(())
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!("[{}] setup failed: {e}", self.label);
            self.state = PeerState::Failed;
        }
        result
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => time::timeout(limit, fut).await.map_err(|_| Error::Timeout)?,
        None => fut.await,
    }
}

/// Connects to every address at once and sets each connection up. Peers
/// that fail are logged and dropped.
pub async fn connect_all(
    addrs: &[SocketAddr],
    info_hash: [u8; 20],
    config: &ClientConfig,
) -> Result<Vec<PeerConnection>> {
    let mut labels = PeerLabels::default();
    let mut tasks = JoinSet::new();

    for &addr in addrs {
        let label = labels.label(addr);
        let config = config.clone();
        tasks.spawn(async move {
            let result = async {
                let mut peer = PeerConnection::connect(addr, label.clone(), &config).await?;
                peer.setup(info_hash, &config).await?;
                Ok::<_, Error>(peer)
            }
            .await;
            (label, result)
        });
    }

    let mut peers = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(peer))) => peers.push(peer),
            Ok((label, Err(e))) => warn!("[{label}] dropped: {e}"),
            Err(e) => warn!("peer task failed: {e}"),
        }
    }

    if peers.is_empty() {
        return Err(Error::NoPeers);
    }
    info!("{} of {} peers ready", peers.len(), addrs.len());
    Ok(peers)
}
