// Windowed image block downloader: fetches readImageBlock responses in parallel
// and hands completed files to the reassembler in block order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::block_store::{BlockNumber, DownloadedBlock};
use super::events::DeliveredImage;
use super::reassembler::Reassembler;
use super::session::SessionCore;
use crate::config::{ClientConfig, MAX_METADATA_BYTES};
use crate::detect::multipart::{self, MultipartEvent, MultipartParser, PartKind};
use crate::error::{Result, ScanError};
use crate::source::messages::{CommandRequest, ReadImageBlockResponse};
use crate::source::traits::MultipartResponse;

pub struct BlockDownloader {
    window_size: usize,
    retry_delay: Duration,
    scratch: Mutex<Option<TempDir>>,
    scratch_path: PathBuf,
    reassembler: Reassembler,
    /// Held while runs are assembled so files reach the consumer strictly in block order.
    delivery_lane: tokio::sync::Mutex<()>,
}

impl BlockDownloader {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let root = config.scratch_root();
        std::fs::create_dir_all(&root)?;
        let scratch = tempfile::Builder::new()
            .prefix("twain-blocks-")
            .tempdir_in(&root)?;
        let scratch_path = scratch.path().to_path_buf();
        debug!("scratch directory {}", scratch_path.display());

        Ok(Self {
            window_size: config.window_size.max(1),
            retry_delay: config.download_retry_delay(),
            scratch: Mutex::new(Some(scratch)),
            scratch_path,
            reassembler: Reassembler::new(config.delivery_dir.clone()),
            delivery_lane: tokio::sync::Mutex::new(()),
        })
    }

    fn scratch_file(&self) -> PathBuf {
        self.scratch_path.join(format!("{}.pdf", Uuid::new_v4()))
    }

    /// Delete the scratch directory and everything still in it.
    pub fn remove_scratch(&self) {
        if let Some(dir) = self.scratch.lock().take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("removing scratch directory {} failed: {}", path.display(), e);
            }
        }
    }
}

/// Start downloads until the window is full or no block is ready.
pub(crate) fn fill_window(core: &Arc<SessionCore>) {
    loop {
        if !core.is_alive() {
            return;
        }
        let next = {
            let mut st = core.state.lock();
            let Some(session_id) = st.session_id().map(str::to_owned) else {
                return;
            };
            st.blocks
                .begin_download(core.downloader.window_size)
                .map(|block| (block, session_id))
        };
        let Some((block, session_id)) = next else {
            return;
        };

        debug!("starting download of block {}", block);
        core.stats.increment_downloads();
        let task_core = Arc::clone(core);
        tokio::spawn(async move {
            download_block(task_core, session_id, block).await;
        });
    }
}

async fn download_block(core: Arc<SessionCore>, session_id: String, block: BlockNumber) {
    let result = tokio::select! {
        r = fetch_block(&core, &session_id, block) => r,
        _ = core.shutdown_token().cancelled() => {
            core.stats.decrement_downloads();
            debug!("block {} download cancelled", block);
            return;
        }
    };
    core.stats.decrement_downloads();

    if !core.is_alive() {
        if let Ok(downloaded) = &result {
            let _ = fs::remove_file(&downloaded.path).await;
        }
        debug!("block {} finished after teardown, discarded", block);
        return;
    }

    match result {
        Ok(downloaded) => {
            let size = downloaded.size;
            let path = downloaded.path.clone();
            let stored = core.state.lock().blocks.complete_download(downloaded);
            if !stored {
                warn!("block {} was not downloading, dropping payload", block);
                let _ = fs::remove_file(&path).await;
                return;
            }
            core.stats.record_block(size);
            info!("block {} stored ({} bytes)", block, size);

            let release_core = Arc::clone(&core);
            tokio::spawn(async move {
                match release_core.release_image_blocks(block, block).await {
                    Ok(()) => debug!("released block {}", block),
                    Err(e) => {
                        warn!("releasing block {} failed: {}", block, e);
                        if release_core.is_alive() {
                            release_core.emit_error(e);
                        }
                    }
                }
            });

            deliver_completed(&core).await;
            fill_window(&core);
        }
        Err(e) => {
            warn!("block {} download failed: {}", block, e);
            core.state.lock().blocks.fail_download(block);
            core.stats.record_failure();
            core.emit_error(e);

            let retry_core = Arc::clone(&core);
            let delay = core.downloader.retry_delay;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => fill_window(&retry_core),
                    _ = retry_core.shutdown_token().cancelled() => {}
                }
            });
        }
    }
}

/// Download one block into a scratch file. The file is removed on any failure.
async fn fetch_block(
    core: &Arc<SessionCore>,
    session_id: &str,
    block: BlockNumber,
) -> Result<DownloadedBlock> {
    let request = CommandRequest::read_image_block(session_id, block);
    let response = core.transport.read_image_block(&request).await?;
    let path = core.downloader.scratch_file();

    let (metadata_raw, size) = match receive_parts(response, &path, block).await {
        Ok(parts) => parts,
        Err(e) => {
            discard(&path).await;
            return Err(e);
        }
    };

    match decode_metadata(core, block, metadata_raw, path.clone(), size) {
        Ok(downloaded) => Ok(downloaded),
        Err(e) => {
            discard(&path).await;
            Err(e)
        }
    }
}

fn decode_metadata(
    core: &Arc<SessionCore>,
    block: BlockNumber,
    metadata_raw: Bytes,
    path: PathBuf,
    size: u64,
) -> Result<DownloadedBlock> {
    let decoded: ReadImageBlockResponse = serde_json::from_slice(&metadata_raw)?;
    if let Some(session) = &decoded.results.session {
        core.update_session(session);
    }
    if !decoded.results.success {
        return Err(ScanError::DownloadFailed {
            block,
            code: decoded.results.code,
        });
    }
    let metadata = decoded
        .results
        .metadata
        .ok_or(ScanError::MissingMetadata { block })?;

    Ok(DownloadedBlock {
        block,
        metadata_raw,
        metadata,
        path,
        size,
    })
}

/// Stream the multipart body: the JSON part is buffered, the PDF part goes straight to `path`.
async fn receive_parts(
    response: MultipartResponse,
    path: &Path,
    block: BlockNumber,
) -> Result<(Bytes, u64)> {
    let boundary = multipart::boundary_from_content_type(response.content_type.as_deref())?;
    let mut body = response.body;
    let mut parser = MultipartParser::new(&boundary);

    let mut received = 0usize;
    let mut current = None;
    let mut metadata: Option<BytesMut> = None;
    let mut payload: Option<File> = None;
    let mut size = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        received += chunk.len();
        for event in parser.feed(&chunk)? {
            match event {
                MultipartEvent::PartBegin(headers) => {
                    let kind = PartKind::of(&headers);
                    match kind {
                        PartKind::Json => {
                            metadata.get_or_insert_with(BytesMut::new);
                        }
                        PartKind::Pdf => {
                            if payload.is_none() {
                                payload = Some(File::create(path).await?);
                            }
                        }
                        PartKind::Other => debug!("block {}: skipping unknown part", block),
                    }
                    current = Some(kind);
                }
                MultipartEvent::Data(data) => match (current, &mut metadata, &mut payload) {
                    (Some(PartKind::Json), Some(buf), _) => {
                        if buf.len() + data.len() > MAX_METADATA_BYTES {
                            return Err(ScanError::MalformedMultipart(format!(
                                "metadata part exceeds {} bytes",
                                MAX_METADATA_BYTES
                            )));
                        }
                        buf.extend_from_slice(&data);
                    }
                    (Some(PartKind::Pdf), _, Some(file)) => {
                        file.write_all(&data).await?;
                        size += data.len() as u64;
                    }
                    _ => {}
                },
                MultipartEvent::PartEnd => current = None,
            }
        }
    }

    if received == 0 {
        return Err(ScanError::NoResponseBody);
    }
    parser.finish()?;

    let metadata = metadata.ok_or(ScanError::MissingMetadata { block })?;
    let mut file = payload.ok_or(ScanError::MissingPayload { block })?;
    file.flush().await?;
    Ok((metadata.freeze(), size))
}

async fn discard(path: &Path) {
    if fs::try_exists(path).await.unwrap_or(false) {
        if let Err(e) = fs::remove_file(path).await {
            warn!("removing scratch file {} failed: {}", path.display(), e);
        }
    }
}

/// Assemble and deliver every complete run that starts at the delivery watermark.
///
/// Runs are claimed under the session lock, so a failed assembly is reported
/// and skipped rather than retried.
pub(crate) async fn deliver_completed(core: &Arc<SessionCore>) {
    let _lane = core.downloader.delivery_lane.lock().await;
    loop {
        if !core.is_alive() {
            return;
        }
        let Some(run) = core.state.lock().blocks.take_completed_run() else {
            return;
        };
        let (first_block, last_block) = (run.first_block(), run.last_block());

        match core.downloader.reassembler.assemble(&run).await {
            Ok(path) => {
                info!(
                    "image ready blocks {}..={} at {}",
                    first_block,
                    last_block,
                    path.display()
                );
                core.stats.record_delivered();
                let image = DeliveredImage {
                    path,
                    metadata: run.first().metadata_raw.clone(),
                    first_block,
                    last_block,
                };
                let event = image.event();
                core.state.lock().delivered.push(image);
                core.emit(event);
            }
            Err(e) => {
                error!(
                    "assembling blocks {}..={} failed: {}",
                    first_block, last_block, e
                );
                if core.is_alive() {
                    core.emit_error(e);
                }
            }
        }
    }
}
