// Wire types for the TWAIN Local scanner command protocol.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::PROTOCOL_KIND;

/// Command envelope POSTed to the scanner's api endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub kind: &'static str,
    pub command_id: String,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl CommandRequest {
    pub fn new(method: &'static str, params: Value) -> Self {
        Self {
            kind: PROTOCOL_KIND,
            command_id: Uuid::new_v4().to_string(),
            method,
            params,
        }
    }

    pub fn create_session() -> Self {
        Self::new("createSession", Value::Null)
    }

    pub fn close_session(session_id: &str) -> Self {
        Self::new("closeSession", json!({ "sessionId": session_id }))
    }

    pub fn send_task(session_id: &str, task: Value) -> Self {
        Self::new("sendTask", json!({ "sessionId": session_id, "task": task }))
    }

    pub fn start_capturing(session_id: &str) -> Self {
        Self::new("startCapturing", json!({ "sessionId": session_id }))
    }

    pub fn stop_capturing(session_id: &str) -> Self {
        Self::new("stopCapturing", json!({ "sessionId": session_id }))
    }

    pub fn wait_for_events(session_id: &str, session_revision: u64) -> Self {
        Self::new(
            "waitForEvents",
            json!({ "sessionId": session_id, "sessionRevision": session_revision }),
        )
    }

    /// Release an inclusive range of image blocks.
    pub fn release_image_blocks(session_id: &str, from: u64, to: u64) -> Self {
        Self::new(
            "releaseImageBlocks",
            json!({
                "sessionId": session_id,
                "imageBlockNum": from,
                "lastImageBlockNum": to,
            }),
        )
    }

    pub fn read_image_block(session_id: &str, image_block_num: u64) -> Self {
        Self::new(
            "readImageBlock",
            json!({
                "sessionId": session_id,
                "imageBlockNum": image_block_num,
                "withMetadata": true,
            }),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    #[serde(default)]
    pub command_id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub method: String,
    pub results: CommandResults,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandResults {
    pub success: bool,
    #[serde(default)]
    pub session: Option<SessionResponse>,
    #[serde(default)]
    pub code: Option<String>,
    /// Only present on `waitForEvents` responses.
    #[serde(default)]
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventRecord {
    pub event: String,
    pub session: SessionResponse,
}

/// Session data embedded in command responses and events.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session_id: String,
    pub revision: u64,
    #[serde(default)]
    pub done_capturing: Option<bool>,
    #[serde(default)]
    pub image_blocks: Option<Vec<u64>>,
    #[serde(default)]
    pub image_blocks_drained: Option<bool>,
    pub state: SessionState,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    NoSession,
    Ready,
    Capturing,
    Closed,
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SessionStatus {
    pub success: bool,
    #[serde(default)]
    pub detected: Option<StatusDetected>,
}

/// Device condition reported alongside the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusDetected {
    Nominal,
    CoverOpen,
    FoldedCorner,
    ImageError,
    Misfeed,
    Multifed,
    PaperJam,
    NoMedia,
    Staple,
    #[serde(other)]
    Other,
}

/// Decoded JSON part of a `readImageBlock` multipart response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadImageBlockResponse {
    #[serde(default)]
    pub command_id: String,
    #[serde(default)]
    pub method: String,
    pub results: ReadImageBlockResults,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadImageBlockResults {
    pub success: bool,
    #[serde(default)]
    pub session: Option<SessionResponse>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub metadata: Option<ImageMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageMetadata {
    #[serde(default)]
    pub image: Option<ImageInfo>,
    pub address: ImageAddress,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub pixel_offset_x: i64,
    pub pixel_offset_y: i64,
    pub pixel_format: String,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub compression: String,
    pub resolution: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAddress {
    pub more_parts: MoreParts,
    pub sheet_number: u32,
    pub image_number: u32,
    pub image_part: u32,
    #[serde(default)]
    pub pixel_format_name: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub stream_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MoreParts {
    LastPartInFile,
    LastPartInFileMorePartsPending,
    MorePartsPending,
    #[serde(other)]
    Unknown,
}

impl MoreParts {
    /// Anything but `morePartsPending` closes the current file.
    pub fn ends_file(self) -> bool {
        self != MoreParts::MorePartsPending
    }
}

/// Answer of `GET /privet/infoex`.
#[derive(Debug, Clone, Deserialize)]
pub struct InfoExResponse {
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub api: Option<Vec<String>>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(rename = "x-privet-token")]
    pub privet_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope() {
        let req = CommandRequest::read_image_block("abc", 4);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["kind"], "twainlocalscanner");
        assert_eq!(v["method"], "readImageBlock");
        assert_eq!(v["params"]["imageBlockNum"], 4);
        assert_eq!(v["params"]["withMetadata"], true);
        assert!(!v["commandId"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_create_session_has_no_params() {
        let v = serde_json::to_value(CommandRequest::create_session()).unwrap();
        assert!(v.get("params").is_none());
    }

    #[test]
    fn test_wait_for_events_response() {
        let raw = br#"{
            "commandId": "1", "kind": "twainlocalscanner", "method": "waitForEvents",
            "results": { "success": true, "events": [
                { "event": "imageBlocks", "session": {
                    "sessionId": "s", "revision": 3, "imageBlocks": [1, 2],
                    "state": "capturing", "status": { "success": true, "detected": "paperJam" }
                } }
            ] }
        }"#;
        let resp: CommandResponse = serde_json::from_slice(raw).unwrap();
        let event = &resp.results.events[0];
        assert_eq!(event.session.revision, 3);
        assert_eq!(event.session.image_blocks.as_deref(), Some(&[1, 2][..]));
        assert_eq!(event.session.state, SessionState::Capturing);
        assert_eq!(event.session.status.detected, Some(StatusDetected::PaperJam));
    }

    #[test]
    fn test_unknown_detected_status_is_preserved_as_other() {
        let status: SessionStatus =
            serde_json::from_str(r#"{"success": false, "detected": "doubleFeedSensor"}"#).unwrap();
        assert_eq!(status.detected, Some(StatusDetected::Other));
    }

    #[test]
    fn test_more_parts_ends_file() {
        assert!(MoreParts::LastPartInFile.ends_file());
        assert!(MoreParts::LastPartInFileMorePartsPending.ends_file());
        assert!(!MoreParts::MorePartsPending.ends_file());
        let unknown: MoreParts = serde_json::from_str(r#""somethingNew""#).unwrap();
        assert!(unknown.ends_file());
    }

    #[test]
    fn test_info_ex() {
        let info: InfoExResponse = serde_json::from_str(
            r#"{"type": "twaindirect", "api": ["/privet/twaindirect/session"], "x-privet-token": "tok"}"#,
        )
        .unwrap();
        assert_eq!(info.privet_token, "tok");
        assert_eq!(info.api.unwrap()[0], "/privet/twaindirect/session");
    }
}
