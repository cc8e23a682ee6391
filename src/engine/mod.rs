// Engine: block tracking, downloads, reassembly and the session state machine.

pub mod block_store;
pub mod downloader;
pub mod events;
pub mod reassembler;
pub mod session;
pub mod stats;
