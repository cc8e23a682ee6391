// Scripted in-memory scanner used by the session tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;

use twain_direct_engine::engine::events::{EventReceiver, SessionEvent};
use twain_direct_engine::error::{Result, ScanError};
use twain_direct_engine::source::messages::{CommandRequest, CommandResponse, InfoExResponse};
use twain_direct_engine::source::traits::{MultipartResponse, ScannerTransport};
use twain_direct_engine::ClientConfig;

pub const SESSION_ID: &str = "fake-session";
pub const BOUNDARY: &str = "fake-boundary-42";

pub enum PollReply {
    Events(Vec<Value>),
    /// Hold the answer until all given blocks have been released.
    EventsAfterRelease(Vec<u64>, Vec<Value>),
    Failed(Option<String>),
    Error,
}

pub enum BlockReply {
    Parts {
        metadata: Option<Value>,
        payload: Option<Bytes>,
        delay: Duration,
    },
    Error,
}

#[derive(Default)]
pub struct FakeScanner {
    polls: Mutex<VecDeque<PollReply>>,
    commands: Mutex<HashMap<String, VecDeque<Value>>>,
    blocks: Mutex<HashMap<u64, VecDeque<BlockReply>>>,
    released: Mutex<HashSet<u64>>,
    requests: Mutex<Vec<(String, Value)>>,
    reads_in_flight: AtomicUsize,
    max_reads_in_flight: AtomicUsize,
}

impl FakeScanner {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.reply(
            "createSession",
            json!({ "results": { "success": true, "session": session(1, "ready") } }),
        );
        fake
    }

    pub fn poll(&self, reply: PollReply) {
        self.polls.lock().push_back(reply);
    }

    /// Queue one answer for `method`. Unscripted commands succeed without session data.
    pub fn reply(&self, method: &str, body: Value) {
        self.commands
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(body);
    }

    pub fn block(&self, block: u64, reply: BlockReply) {
        self.blocks.lock().entry(block).or_default().push_back(reply);
    }

    /// Queue a well-formed block.
    pub fn image_block(&self, block: u64, more_parts: &str, image: u32, payload: &'static [u8]) {
        self.delayed_image_block(block, more_parts, image, payload, Duration::ZERO);
    }

    pub fn delayed_image_block(
        &self,
        block: u64,
        more_parts: &str,
        image: u32,
        payload: &'static [u8],
        delay: Duration,
    ) {
        self.block(
            block,
            BlockReply::Parts {
                metadata: Some(block_metadata(more_parts, image)),
                payload: Some(Bytes::from_static(payload)),
                delay,
            },
        );
    }

    pub fn count(&self, method: &str) -> usize {
        self.requests.lock().iter().filter(|(m, _)| m == method).count()
    }

    pub fn requests(&self, method: &str) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn max_reads_in_flight(&self) -> usize {
        self.max_reads_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, request: &CommandRequest) {
        self.requests
            .lock()
            .push((request.method.to_string(), request.params.clone()));
    }

    fn is_released(&self, block: u64) -> bool {
        self.released.lock().contains(&block)
    }
}

#[async_trait]
impl ScannerTransport for FakeScanner {
    async fn resolve_token(&self) -> Result<InfoExResponse> {
        Ok(serde_json::from_value(json!({
            "type": "twaindirect",
            "api": ["/privet/twaindirect/session"],
            "x-privet-token": "token-1",
        }))?)
    }

    async fn command(&self, request: &CommandRequest) -> Result<CommandResponse> {
        self.record(request);

        if request.method == "waitForEvents" {
            let next = self.polls.lock().pop_front();
            let events = match next {
                None => return std::future::pending().await,
                Some(PollReply::Error) => return Err(ScanError::NoResponseBody),
                Some(PollReply::Failed(code)) => {
                    return Ok(serde_json::from_value(
                        json!({ "results": { "success": false, "code": code } }),
                    )?)
                }
                Some(PollReply::Events(events)) => events,
                Some(PollReply::EventsAfterRelease(blocks, events)) => {
                    while !blocks.iter().all(|b| self.is_released(*b)) {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    events
                }
            };
            let events: Vec<Value> = events
                .into_iter()
                .map(|s| json!({ "event": "imageBlocks", "session": s }))
                .collect();
            return Ok(serde_json::from_value(
                json!({ "results": { "success": true, "events": events } }),
            )?);
        }

        if request.method == "releaseImageBlocks" {
            let from = request.params["imageBlockNum"].as_u64().unwrap_or(0);
            let to = request.params["lastImageBlockNum"].as_u64().unwrap_or(0);
            if to - from < 1024 {
                self.released.lock().extend(from..=to);
            }
        }

        let scripted = self
            .commands
            .lock()
            .get_mut(request.method)
            .and_then(|q| q.pop_front());
        let body = scripted.unwrap_or_else(|| json!({ "results": { "success": true } }));
        Ok(serde_json::from_value(body)?)
    }

    async fn read_image_block(&self, request: &CommandRequest) -> Result<MultipartResponse> {
        self.record(request);
        let block = request.params["imageBlockNum"].as_u64().unwrap_or(0);
        let reply = self
            .blocks
            .lock()
            .get_mut(&block)
            .and_then(|q| q.pop_front());

        let now = self.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_reads_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = match reply {
            None | Some(BlockReply::Error) => Err(ScanError::HttpStatus(500)),
            Some(BlockReply::Parts {
                metadata,
                payload,
                delay,
            }) => {
                tokio::time::sleep(delay).await;
                Ok(multipart_response(metadata, payload))
            }
        };
        self.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Session data as the scanner reports it.
pub fn session(revision: u64, state: &str) -> Value {
    json!({
        "sessionId": SESSION_ID,
        "revision": revision,
        "state": state,
        "status": { "success": true, "detected": "nominal" },
    })
}

pub fn session_with_blocks(revision: u64, blocks: &[u64]) -> Value {
    let mut s = session(revision, "capturing");
    s["imageBlocks"] = json!(blocks);
    s
}

/// Capture is over and every block has been released.
pub fn session_drained(revision: u64) -> Value {
    let mut s = session(revision, "draining");
    s["doneCapturing"] = json!(true);
    s["imageBlocksDrained"] = json!(true);
    s["imageBlocks"] = json!([]);
    s
}

pub fn block_metadata(more_parts: &str, image: u32) -> Value {
    json!({
        "results": {
            "success": true,
            "metadata": {
                "address": {
                    "moreParts": more_parts,
                    "sheetNumber": 1,
                    "imageNumber": image,
                    "imagePart": 1,
                },
            },
        },
    })
}

/// Build a multipart/mixed body and hand it out in small slices.
pub fn multipart_response(metadata: Option<Value>, payload: Option<Bytes>) -> MultipartResponse {
    let mut body = Vec::new();
    if let Some(metadata) = metadata {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Type: application/json; charset=utf-8\r\n\r\n{}\r\n",
                BOUNDARY, metadata
            )
            .as_bytes(),
        );
    }
    if let Some(payload) = payload {
        body.extend_from_slice(
            format!("--{}\r\nContent-Type: application/pdf\r\n\r\n", BOUNDARY).as_bytes(),
        );
        body.extend_from_slice(&payload);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

    let chunks: Vec<Result<Bytes>> = body
        .chunks(7)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    MultipartResponse {
        content_type: Some(format!("multipart/mixed; boundary={}", BOUNDARY)),
        body: futures::stream::iter(chunks).boxed(),
    }
}

/// Config with short delays and scratch/delivery directories under `dir`.
pub fn test_config(dir: &TempDir) -> ClientConfig {
    ClientConfig {
        poll_retry_delay_ms: 10,
        download_retry_delay_ms: 10,
        scratch_root: Some(dir.path().join("scratch")),
        delivery_dir: dir.path().join("delivered"),
        ..ClientConfig::default()
    }
}

pub async fn next_event(events: &mut EventReceiver) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event channel closed")
}

/// Collect events up to and including `CaptureFinished`.
pub async fn until_finished(events: &mut EventReceiver) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = matches!(event, SessionEvent::CaptureFinished);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
