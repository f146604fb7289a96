use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use log::{debug, info, warn};
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, Mutex},
    task::JoinSet,
    time,
};

use crate::{
    config::{ClientConfig, RetryPolicy},
    error::{Error, Result},
    peer::PeerConnection,
    protocol::Message,
};

// **** STRUCTS **** //

// a block is the smallest unit requested from a peer.
// its offset and length locate it inside the owning piece.
#[derive(Debug, Clone)]
pub struct Block {
    offset: u32,
    length: u32,
    data: Vec<u8>,
    received: bool,
}

// a piece is split into blocks of at most `block_size` bytes, only the
// last one may be shorter. the piece is complete once every block arrived.
#[derive(Debug)]
pub struct Piece {
    index: u32,
    length: u32,
    hash: [u8; 20],
    block_size: u32,
    blocks: Vec<Block>,
    received_blocks: AtomicU32,
}

/// One unit of scheduler work: which piece, how long it is and what it must
/// hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    pub index: u32,
    pub length: u32,
    pub hash: [u8; 20],
}

// **** IMPLEMENTATIONS **** //

impl Block {
    fn new(offset: u32, length: u32) -> Block {
        Block {
            offset,
            length,
            data: Vec::new(),
            received: false,
        }
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn is_received(&self) -> bool {
        self.received
    }
}

impl Piece {
    pub fn new(index: u32, length: u32, hash: [u8; 20], block_size: u32) -> Piece {
        let block_size = block_size.max(1);

        let mut blocks = Vec::with_capacity(length.div_ceil(block_size) as usize);
        let mut offset = 0;
        while offset < length {
            let block_len = block_size.min(length - offset);
            blocks.push(Block::new(offset, block_len));
            offset += block_len;
        }

        Piece {
            index,
            length,
            hash,
            block_size,
            blocks,
            received_blocks: AtomicU32::new(0),
        }
    }

    pub fn from_work(work: &PieceWork, block_size: u32) -> Piece {
        Piece::new(work.index, work.length, work.hash, block_size)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn received_blocks(&self) -> u32 {
        self.received_blocks.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.received_blocks() as usize == self.blocks.len()
    }

    // one request per block, in offset order
    pub fn requests(&self) -> impl Iterator<Item = Message> + '_ {
        self.blocks.iter().map(move |block| Message::Request {
            index: self.index,
            begin: block.offset,
            length: block.length,
        })
    }

    /// Stores the payload of a piece message. Anything that does not fit
    /// exactly one still-missing block is a protocol violation and leaves
    /// the piece untouched.
    pub fn store_block(&mut self, index: u32, begin: u32, data: Vec<u8>) -> Result<()> {
        if index != self.index {
            return Err(Error::protocol(format!(
                "received block for piece {index} while downloading piece {}",
                self.index
            )));
        }

        let block_idx = (begin / self.block_size) as usize;
        let block = self
            .blocks
            .get_mut(block_idx)
            .filter(|block| block.offset == begin)
            .ok_or_else(|| {
                Error::protocol(format!(
                    "offset {begin} does not start a block of piece {index}"
                ))
            })?;

        if block.received {
            return Err(Error::protocol(format!(
                "block at offset {begin} of piece {index} delivered twice"
            )));
        }

        if block.length as usize != data.len() {
            return Err(Error::protocol(format!(
                "block at offset {begin} of piece {index} should be {} bytes, got {}",
                block.length,
                data.len()
            )));
        }

        block.data = data;
        block.received = true;
        self.received_blocks.fetch_add(1, Ordering::AcqRel);

        Ok(())
    }

    // concatenation of every block in offset order
    pub fn data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.length as usize);
        for block in &self.blocks {
            data.extend_from_slice(&block.data);
        }
        data
    }

    /// Assembles the piece and checks it against its expected hash.
    pub fn verify(&self) -> Result<Vec<u8>> {
        if !self.is_complete() {
            return Err(Error::protocol(format!(
                "piece {} verified with {}/{} blocks",
                self.index,
                self.received_blocks(),
                self.blocks.len()
            )));
        }

        let data = self.data();
        let actual: [u8; 20] = Sha1::digest(&data).into();
        if actual != self.hash {
            return Err(Error::Verification {
                index: self.index,
                expected: hex::encode(self.hash),
                actual: hex::encode(actual),
            });
        }

        Ok(data)
    }
}

// **** SCHEDULER **** //

#[derive(Debug)]
struct Job {
    work: PieceWork,
    attempts: u32,
}

#[derive(Debug)]
enum Outcome {
    Done { index: u32, data: Vec<u8> },
    GaveUp { index: u32, attempts: u32 },
}

/// Spreads pieces over peer connections and stitches the results back
/// together.
///
/// Every connection gets its own worker pulling from one shared queue, so
/// which peer serves which piece is not deterministic. The bitfield of a
/// peer is not consulted: every peer is assumed to hold every piece. A
/// failed piece, whatever the reason (broken connection, protocol violation
/// or a hash mismatch), goes back on the queue after the delay given by the
/// retry policy.
pub struct PieceManager {
    work: Vec<PieceWork>,
    retry: RetryPolicy,
    evict_after: Option<u32>,
}

impl PieceManager {
    pub fn new(mut work: Vec<PieceWork>, config: &ClientConfig) -> PieceManager {
        work.sort_by_key(|w| w.index);
        let requested = work.len();
        work.dedup_by_key(|w| w.index);
        if work.len() < requested {
            warn!(
                "dropped {} duplicate piece indices from the work list",
                requested - work.len()
            );
        }
        PieceManager {
            work,
            retry: config.retry.clone(),
            evict_after: config.evict_after,
        }
    }

    pub fn total_len(&self) -> u64 {
        self.work.iter().map(|w| w.length as u64).sum()
    }

    /// Downloads every piece and returns them concatenated in index order.
    /// `peers` must already be unchoked.
    pub async fn download<S>(self, peers: Vec<PeerConnection<S>>) -> Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let total = self.work.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        if peers.is_empty() {
            return Err(Error::NoPeers);
        }

        let total_len = self.total_len();
        let slot_of: HashMap<u32, usize> = self
            .work
            .iter()
            .enumerate()
            .map(|(slot, w)| (w.index, slot))
            .collect();

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        for work in self.work {
            // the receiver is alive until the workers are spawned
            let _ = work_tx.send(Job { work, attempts: 0 });
        }
        let queue = Arc::new(Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();

        info!(
            "downloading {total} pieces ({total_len} bytes) from {} peers",
            peers.len()
        );

        let mut workers = JoinSet::new();
        for peer in peers {
            workers.spawn(worker(
                peer,
                queue.clone(),
                work_tx.clone(),
                result_tx.clone(),
                self.retry.clone(),
                self.evict_after,
            ));
        }
        drop(work_tx);
        drop(result_tx);

        let mut slots: Vec<Option<Vec<u8>>> = vec![None; total];
        let mut completed = 0;

        while completed < total {
            match result_rx.recv().await {
                Some(Outcome::Done { index, data }) => {
                    let Some(slot) = slot_of.get(&index).map(|&s| &mut slots[s]) else {
                        warn!("dropping result for unknown piece {index}");
                        continue;
                    };
                    if slot.is_some() {
                        warn!("piece {index} completed twice, keeping the first copy");
                        continue;
                    }
                    *slot = Some(data);
                    completed += 1;
                    info!("piece {index} done ({completed}/{total})");
                }
                Some(Outcome::GaveUp { index, attempts }) => {
                    workers.abort_all();
                    return Err(Error::RetriesExhausted { index, attempts });
                }
                None => {
                    return Err(Error::WorkersExhausted {
                        remaining: total - completed,
                    });
                }
            }
        }

        workers.abort_all();

        let mut output = Vec::with_capacity(total_len as usize);
        for data in slots.into_iter().flatten() {
            output.extend_from_slice(&data);
        }
        Ok(output)
    }
}

async fn worker<S>(
    mut peer: PeerConnection<S>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    requeue: mpsc::UnboundedSender<Job>,
    results: mpsc::UnboundedSender<Outcome>,
    retry: RetryPolicy,
    evict_after: Option<u32>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut failures_in_row = 0;

    loop {
        let next = queue.lock().await.recv().await;
        let Some(mut job) = next else {
            break;
        };

        match peer.download_piece(&job.work).await {
            Ok(data) => {
                failures_in_row = 0;
                let done = Outcome::Done {
                    index: job.work.index,
                    data,
                };
                if results.send(done).is_err() {
                    break;
                }
            }
            Err(e) => {
                job.attempts += 1;
                failures_in_row += 1;
                warn!(
                    "[{}] piece {} failed on attempt {}: {e}",
                    peer.label(),
                    job.work.index,
                    job.attempts
                );

                if !retry.allows(job.attempts) {
                    let _ = results.send(Outcome::GaveUp {
                        index: job.work.index,
                        attempts: job.attempts,
                    });
                    break;
                }

                let delay = retry.delay_for(job.attempts);
                let requeue = requeue.clone();
                tokio::spawn(async move {
                    time::sleep(delay).await;
                    debug!("requeueing piece {}", job.work.index);
                    let _ = requeue.send(job);
                });

                if evict_after.is_some_and(|limit| failures_in_row >= limit) {
                    warn!(
                        "[{}] {failures_in_row} failures in a row, dropping connection",
                        peer.label()
                    );
                    break;
                }
            }
        }
    }
}
