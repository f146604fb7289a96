use std::{error, io::Write, net::SocketAddr, path::Path, time::Duration};

use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use rust_torrent::{
    bencoding::decoder,
    config::{ClientConfig, RetryPolicy, DEFAULT_BLOCK_SIZE, DEFAULT_PORT, MAX_BLOCK_SIZE},
    connect_all,
    error::Error,
    magnet::MagnetLink,
    peer::{PeerConnection, PeerLabels},
    torrent::Torrent,
    tracker::{Announce, Tracker},
    PieceManager, PieceWork,
};

// trackers want a non-zero `left` even when the size is not known yet
const UNKNOWN_LEFT: u64 = 999;

#[derive(Parser, Debug)]
#[command(name = "rust-torrent", author, version, about = "A small BitTorrent download client")]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// Block size used for piece requests, in bytes.
    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_BLOCK_SIZE,
        value_parser = clap::value_parser!(u32).range(1..=MAX_BLOCK_SIZE as i64)
    )]
    block_size: u32,

    /// Delay before a failed piece is retried.
    #[arg(long, global = true, default_value_t = 500)]
    retry_delay_ms: u64,

    /// Multiply the retry delay by this after each failed attempt.
    #[arg(long, global = true, default_value_t = 1)]
    backoff_factor: u32,

    /// Give up on the download once a piece failed this many times.
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Drop a connection after this many failed pieces in a row.
    #[arg(long, global = true)]
    evict_after: Option<u32>,

    /// Fail a read that takes longer than this many seconds.
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Port announced to the tracker.
    #[arg(long, global = true, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Do not advertise extension protocol support.
    #[arg(long, global = true)]
    no_extensions: bool,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a bencoded value and print it.
    Decode { value: String },
    /// Print the contents of a torrent file.
    Info { torrent: String },
    /// List the peers the tracker knows for a torrent.
    Peers { torrent: String },
    /// Handshake with a single peer and print its id.
    Handshake { torrent: String, peer: SocketAddr },
    /// Download and verify one piece.
    DownloadPiece {
        #[arg(short, long)]
        output: String,
        torrent: String,
        index: u32,
    },
    /// Download the whole file.
    Download {
        #[arg(short, long)]
        output: String,
        torrent: String,
    },
    /// Print the tracker and info hash of a magnet link.
    MagnetParse { link: String },
    /// Handshake with the first peer of a magnet link, extensions included.
    MagnetHandshake { link: String },
    /// Fetch the metadata of a magnet link and print it.
    MagnetInfo { link: String },
    /// Download and verify one piece of a magnet link.
    MagnetDownloadPiece {
        #[arg(short, long)]
        output: String,
        link: String,
        index: u32,
    },
    /// Download the whole file of a magnet link.
    MagnetDownload {
        #[arg(short, long)]
        output: String,
        link: String,
    },
}

impl GlobalOpts {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            port: self.port,
            block_size: self.block_size.clamp(1, MAX_BLOCK_SIZE),
            extensions: !self.no_extensions,
            retry: RetryPolicy {
                delay: Duration::from_millis(self.retry_delay_ms),
                backoff_factor: self.backoff_factor,
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
            evict_after: self.evict_after,
            io_timeout: self.timeout_secs.map(Duration::from_secs),
            ..ClientConfig::default()
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.opts.verbose);
    let config = cli.opts.client_config();

    match cli.command {
        Command::Decode { value } => {
            let bencode = decoder::decode(value.as_bytes())?;
            println!("{bencode}");
        }
        Command::Info { torrent } => {
            let torrent = read_torrent(&torrent).await?;
            print_info(&torrent);
        }
        Command::Peers { torrent } => {
            let torrent = read_torrent(&torrent).await?;
            let peers =
                find_peers(&torrent.announce, torrent.info_hash, torrent.length, &config).await?;
            for peer in peers {
                println!("{peer}");
            }
        }
        Command::Handshake { torrent, peer } => {
            let torrent = read_torrent(&torrent).await?;
            let label = PeerLabels::default().label(peer);
            let mut conn = PeerConnection::connect(peer, label, &config).await?;
            let handshake = conn.handshake(torrent.info_hash, &config).await?;
            println!("Peer ID: {}", hex::encode(handshake.peer_id));
        }
        Command::DownloadPiece {
            output,
            torrent,
            index,
        } => {
            let torrent = read_torrent(&torrent).await?;
            let work = piece_work(&torrent, index)?;
            let data = download(&torrent, vec![work], &config).await?;
            write_output(&output, &data).await?;
            println!("Piece {index} downloaded to {output}.");
        }
        Command::Download { output, torrent } => {
            let torrent = read_torrent(&torrent).await?;
            let data = download(&torrent, torrent.pieces(), &config).await?;
            write_output(&output, &data).await?;
            println!("Downloaded {} to {output}.", torrent.name);
        }
        Command::MagnetParse { link } => {
            let magnet = MagnetLink::parse(&link)?;
            println!("Tracker URL: {}", magnet.tracker.as_deref().unwrap_or("-"));
            println!("Info Hash: {}", magnet.info_hash_hex());
        }
        Command::MagnetHandshake { link } => {
            let magnet = MagnetLink::parse(&link)?;
            let tracker = magnet.require_tracker()?;
            let peers = find_peers(tracker, magnet.info_hash, UNKNOWN_LEFT, &config).await?;
            let addr = *peers.first().ok_or(Error::NoPeers)?;

            let label = PeerLabels::default().label(addr);
            let mut conn = PeerConnection::connect(addr, label, &config).await?;
            let handshake = conn.handshake(magnet.info_hash, &config).await?;
            println!("Peer ID: {}", hex::encode(handshake.peer_id));

            conn.await_bitfield().await?;
            if conn.extensions_enabled() {
                conn.negotiate_extensions().await?;
                if let Some(id) = conn.metadata_id() {
                    println!("Peer Metadata Extension ID: {id}");
                }
            }
        }
        Command::MagnetInfo { link } => {
            let magnet = MagnetLink::parse(&link)?;
            let (torrent, _) = resolve_magnet(&magnet, &config).await?;
            print_info(&torrent);
        }
        Command::MagnetDownloadPiece {
            output,
            link,
            index,
        } => {
            let magnet = MagnetLink::parse(&link)?;
            let (torrent, peers) = resolve_magnet(&magnet, &config).await?;
            let work = piece_work(&torrent, index)?;
            let data = download_from(&peers, &torrent, vec![work], &config).await?;
            write_output(&output, &data).await?;
            println!("Piece {index} downloaded to {output}.");
        }
        Command::MagnetDownload { output, link } => {
            let magnet = MagnetLink::parse(&link)?;
            let (torrent, peers) = resolve_magnet(&magnet, &config).await?;
            let data = download_from(&peers, &torrent, torrent.pieces(), &config).await?;
            write_output(&output, &data).await?;
            println!("Downloaded {} to {output}.", torrent.name);
        }
    }

    Ok(())
}

async fn read_torrent(path: &str) -> Result<Torrent, Error> {
    let bytes = tokio::fs::read(path).await?;
    Torrent::from_bytes(&bytes)
}

fn print_info(torrent: &Torrent) {
    println!("Tracker URL: {}", torrent.announce);
    println!("Length: {}", torrent.length);
    println!("Info Hash: {}", torrent.info_hash_hex());
    println!("Piece Length: {}", torrent.piece_length);
    println!("Piece Hashes:");
    for hash in &torrent.piece_hashes {
        println!("{}", hex::encode(hash));
    }
}

fn piece_work(torrent: &Torrent, index: u32) -> Result<PieceWork, Error> {
    torrent.piece_work(index).ok_or_else(|| {
        Error::Metainfo(format!(
            "piece {index} out of range, the torrent has {} pieces",
            torrent.num_pieces()
        ))
    })
}

async fn find_peers(
    url: &str,
    info_hash: [u8; 20],
    left: u64,
    config: &ClientConfig,
) -> Result<Vec<SocketAddr>, Error> {
    let tracker = Tracker::new(url)?;
    let response = tracker
        .announce(&Announce {
            info_hash,
            peer_id: config.peer_id,
            port: config.port,
            uploaded: 0,
            downloaded: 0,
            left,
        })
        .await?;
    Ok(response.peers)
}

async fn download(
    torrent: &Torrent,
    work: Vec<PieceWork>,
    config: &ClientConfig,
) -> Result<Vec<u8>, Error> {
    let peers = find_peers(&torrent.announce, torrent.info_hash, torrent.length, config).await?;
    download_from(&peers, torrent, work, config).await
}

async fn download_from(
    addrs: &[SocketAddr],
    torrent: &Torrent,
    work: Vec<PieceWork>,
    config: &ClientConfig,
) -> Result<Vec<u8>, Error> {
    let peers = connect_all(addrs, torrent.info_hash, config).await?;
    PieceManager::new(work, config).download(peers).await
}

// fetches the info dict from the first peer willing to share it
async fn resolve_magnet(
    magnet: &MagnetLink,
    config: &ClientConfig,
) -> Result<(Torrent, Vec<SocketAddr>), Error> {
    let tracker = magnet.require_tracker()?;
    let peers = find_peers(tracker, magnet.info_hash, UNKNOWN_LEFT, config).await?;
    let mut labels = PeerLabels::default();

    for &addr in &peers {
        let label = labels.label(addr);
        match fetch_info(addr, label.clone(), magnet.info_hash, config).await {
            Ok(info) => {
                let torrent = Torrent::from_info(&info, tracker)?;
                info!("[{label}] resolved magnet link to {}", torrent.name);
                return Ok((torrent, peers));
            }
            Err(e) => warn!("[{label}] could not fetch metadata: {e}"),
        }
    }

    Err(Error::NoPeers)
}

async fn fetch_info(
    addr: SocketAddr,
    label: String,
    info_hash: [u8; 20],
    config: &ClientConfig,
) -> Result<Vec<u8>, Error> {
    let mut conn = PeerConnection::connect(addr, label, config).await?;
    conn.handshake(info_hash, config).await?;
    conn.await_bitfield().await?;
    if !conn.extensions_enabled() {
        return Err(Error::Metadata("peer does not support extensions".into()));
    }
    conn.negotiate_extensions().await?;
    conn.fetch_metadata(&info_hash).await
}

// creates missing parent directories first
async fn write_output(path: &str, data: &[u8]) -> Result<(), Error> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await?;
    info!("wrote {} bytes to {path}", data.len());
    Ok(())
}
