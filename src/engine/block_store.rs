// Per-block status tracking and the map of downloaded-but-undelivered blocks.

use std::collections::BTreeMap;
use std::path::PathBuf;

use bytes::Bytes;

use crate::config::FIRST_IMAGE_BLOCK;
use crate::source::messages::ImageMetadata;

pub type BlockNumber = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    ReadyToDownload,
    Downloading,
    /// Payload is stored locally; waiting for the rest of its file.
    WaitingForMoreParts,
    /// Delivered to the consumer and removed from the store.
    Completed,
}

/// A block whose payload has been persisted to scratch storage.
#[derive(Debug, Clone)]
pub struct DownloadedBlock {
    pub block: BlockNumber,
    /// The JSON metadata part exactly as received.
    pub metadata_raw: Bytes,
    pub metadata: ImageMetadata,
    pub path: PathBuf,
    pub size: u64,
}

impl DownloadedBlock {
    pub fn ends_file(&self) -> bool {
        self.metadata.address.more_parts.ends_file()
    }
}

/// Consecutive downloaded blocks that make up one image file, in block order.
#[derive(Debug)]
pub struct AssemblyRun {
    pub parts: Vec<DownloadedBlock>,
}

impl AssemblyRun {
    pub fn first(&self) -> &DownloadedBlock {
        &self.parts[0]
    }

    pub fn first_block(&self) -> BlockNumber {
        self.parts[0].block
    }

    pub fn last_block(&self) -> BlockNumber {
        self.parts[self.parts.len() - 1].block
    }
}

pub struct BlockStore {
    status: BTreeMap<BlockNumber, BlockStatus>,
    downloaded: BTreeMap<BlockNumber, DownloadedBlock>,
    in_flight: usize,
    /// First block number not yet delivered; everything below it is gone from the store.
    next_to_deliver: BlockNumber,
}

impl BlockStore {
    pub fn new() -> Self {
        Self {
            status: BTreeMap::new(),
            downloaded: BTreeMap::new(),
            in_flight: 0,
            next_to_deliver: FIRST_IMAGE_BLOCK,
        }
    }

    /// Track newly announced blocks. Already tracked or delivered blocks are ignored.
    /// Returns the block numbers that were actually added.
    pub fn enqueue(&mut self, blocks: &[BlockNumber]) -> Vec<BlockNumber> {
        let mut added = Vec::new();
        for &block in blocks {
            if block < self.next_to_deliver || self.status.contains_key(&block) {
                continue;
            }
            self.status.insert(block, BlockStatus::ReadyToDownload);
            added.push(block);
        }
        added
    }

    /// Lowest-numbered block waiting to be downloaded.
    pub fn next_ready(&self) -> Option<BlockNumber> {
        self.status
            .iter()
            .find(|(_, status)| **status == BlockStatus::ReadyToDownload)
            .map(|(block, _)| *block)
    }

    /// Claim the next ready block if fewer than `window` downloads are in flight.
    pub fn begin_download(&mut self, window: usize) -> Option<BlockNumber> {
        if self.in_flight >= window {
            return None;
        }
        let block = self.next_ready()?;
        self.status.insert(block, BlockStatus::Downloading);
        self.in_flight += 1;
        Some(block)
    }

    /// Record a persisted payload. Returns false if the block was not downloading.
    pub fn complete_download(&mut self, downloaded: DownloadedBlock) -> bool {
        let block = downloaded.block;
        if self.status.get(&block) != Some(&BlockStatus::Downloading) {
            return false;
        }
        self.status.insert(block, BlockStatus::WaitingForMoreParts);
        self.downloaded.insert(block, downloaded);
        self.in_flight = self.in_flight.saturating_sub(1);
        true
    }

    /// Put a failed download back into the ready pool.
    pub fn fail_download(&mut self, block: BlockNumber) -> bool {
        if self.status.get(&block) != Some(&BlockStatus::Downloading) {
            return false;
        }
        self.status.insert(block, BlockStatus::ReadyToDownload);
        self.in_flight = self.in_flight.saturating_sub(1);
        true
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn status(&self, block: BlockNumber) -> Option<BlockStatus> {
        if block < self.next_to_deliver {
            return Some(BlockStatus::Completed);
        }
        self.status.get(&block).copied()
    }

    pub fn downloaded(&self, block: BlockNumber) -> Option<&DownloadedBlock> {
        self.downloaded.get(&block)
    }

    pub fn delivered_watermark(&self) -> BlockNumber {
        self.next_to_deliver
    }

    /// Number of blocks still tracked (not yet delivered).
    pub fn tracked(&self) -> usize {
        self.status.len()
    }

    /// Detach the run of blocks forming the next complete file, if all its parts are here.
    ///
    /// Starting at the watermark, blocks must be present without gaps until one
    /// closes its file. The run is removed from the store and the watermark moves
    /// past it, so a second call without new downloads returns `None`.
    pub fn take_completed_run(&mut self) -> Option<AssemblyRun> {
        let mut end = self.next_to_deliver;
        loop {
            let part = self.downloaded.get(&end)?;
            if part.ends_file() {
                break;
            }
            end += 1;
        }

        let mut parts = Vec::with_capacity((end - self.next_to_deliver + 1) as usize);
        for block in self.next_to_deliver..=end {
            self.status.remove(&block);
            if let Some(part) = self.downloaded.remove(&block) {
                parts.push(part);
            }
        }
        self.next_to_deliver = end + 1;
        Some(AssemblyRun { parts })
    }

    /// Remove every stored payload record, e.g. on teardown.
    pub fn drain_downloaded(&mut self) -> Vec<DownloadedBlock> {
        let drained: Vec<_> = std::mem::take(&mut self.downloaded).into_values().collect();
        for part in &drained {
            self.status.remove(&part.block);
        }
        drained
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}
