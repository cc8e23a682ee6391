//! Session notifications fanned out to subscribers.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;

use super::block_store::BlockNumber;
use crate::error::ScanError;
use crate::source::messages::{SessionState, StatusDetected};

/// Everything a consumer can observe about a running session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
    },
    StatusChanged {
        detected: Option<StatusDetected>,
        success: bool,
    },
    /// A complete image file was assembled and moved to the delivery directory.
    ImageReceived {
        path: PathBuf,
        /// Raw JSON metadata of the file's first block.
        metadata: Bytes,
        first_block: BlockNumber,
        last_block: BlockNumber,
    },
    CaptureFinished,
    Error(Arc<ScanError>),
}

/// A file handed to the consumer, kept on the session in delivery order.
#[derive(Debug, Clone)]
pub struct DeliveredImage {
    pub path: PathBuf,
    /// Raw JSON metadata of the file's first block.
    pub metadata: Bytes,
    pub first_block: BlockNumber,
    pub last_block: BlockNumber,
}

impl DeliveredImage {
    pub(crate) fn event(&self) -> SessionEvent {
        SessionEvent::ImageReceived {
            path: self.path.clone(),
            metadata: self.metadata.clone(),
            first_block: self.first_block,
            last_block: self.last_block,
        }
    }
}

pub type EventSender = broadcast::Sender<SessionEvent>;
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}
