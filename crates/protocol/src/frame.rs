//! Frame envelope: content types and typed headers.

use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Closed set of frame content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ContentType {
    Hello = 1,
    Route = 2,
    RouteResult = 3,
    Unroute = 4,
    Fault = 5,
    LinkConnected = 6,
    RouterPresence = 7,
    SettingUpdate = 8,
    DataStateChangeSet = 9,
    InspectRequest = 10,
    InspectResponse = 11,
    ValidateTerminators = 12,
    ValidateTerminatorsResult = 13,
    ValidateRouterLinks = 14,
    ValidateRouterLinksResult = 15,
    ValidateRouterSdkTerminators = 16,
    ValidateRouterSdkTerminatorsResult = 17,
    ValidateRouterDataModel = 18,
    ValidateRouterDataModelResult = 19,
    Heartbeat = 20,
    HeartbeatResponse = 21,
}

impl ContentType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Hello,
            2 => Self::Route,
            3 => Self::RouteResult,
            4 => Self::Unroute,
            5 => Self::Fault,
            6 => Self::LinkConnected,
            7 => Self::RouterPresence,
            8 => Self::SettingUpdate,
            9 => Self::DataStateChangeSet,
            10 => Self::InspectRequest,
            11 => Self::InspectResponse,
            12 => Self::ValidateTerminators,
            13 => Self::ValidateTerminatorsResult,
            14 => Self::ValidateRouterLinks,
            15 => Self::ValidateRouterLinksResult,
            16 => Self::ValidateRouterSdkTerminators,
            17 => Self::ValidateRouterSdkTerminatorsResult,
            18 => Self::ValidateRouterDataModel,
            19 => Self::ValidateRouterDataModelResult,
            20 => Self::Heartbeat,
            21 => Self::HeartbeatResponse,
            _ => return None,
        })
    }
}

/// Reserved header keys. Positive keys are peer-data passthrough owned by
/// the endpoints (initiator/terminator address metadata and strategy data).
pub mod header {
    /// Correlation id of a request expecting a reply.
    pub const CORRELATION_ID: i32 = -1;
    /// Correlation id of the request this frame replies to.
    pub const REPLY_FOR: i32 = -2;
    /// Present (value `[1]`) on successful typed results.
    pub const RESULT_SUCCESS: i32 = -3;
    /// Error message on failed typed results.
    pub const RESULT_ERROR: i32 = -4;
    /// Present on failed results whose error is not worth retrying
    /// (e.g. a misconfigured terminator binding).
    pub const RESULT_FATAL: i32 = -5;

    // Peer-data keys carried on route results and dial requests. The
    // address keys are stripped into the circuit's path record and never
    // forwarded to the peer.
    pub const INITIATOR_LOCAL_ADDR: i32 = 1001;
    pub const INITIATOR_REMOTE_ADDR: i32 = 1002;
    pub const TERMINATOR_LOCAL_ADDR: i32 = 1003;
    pub const TERMINATOR_REMOTE_ADDR: i32 = 1004;
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub content_type: ContentType,
    pub headers: HashMap<i32, Vec<u8>>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(content_type: ContentType, body: impl Into<Bytes>) -> Self {
        Self {
            content_type,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Encode a typed message as the frame body.
    pub fn typed<T: Serialize>(content_type: ContentType, msg: &T) -> serde_json::Result<Self> {
        Ok(Self::new(content_type, serde_json::to_vec(msg)?))
    }

    pub fn decode_body<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn with_header(mut self, key: i32, value: Vec<u8>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn with_correlation_id(self, id: u64) -> Self {
        self.with_header(header::CORRELATION_ID, id.to_be_bytes().to_vec())
    }

    pub fn with_reply_for(self, id: u64) -> Self {
        self.with_header(header::REPLY_FOR, id.to_be_bytes().to_vec())
    }

    pub fn with_success(self) -> Self {
        self.with_header(header::RESULT_SUCCESS, vec![1])
    }

    pub fn with_error(self, msg: &str) -> Self {
        self.with_header(header::RESULT_ERROR, msg.as_bytes().to_vec())
    }

    fn u64_header(&self, key: i32) -> Option<u64> {
        let raw = self.headers.get(&key)?;
        let bytes: [u8; 8] = raw.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    pub fn correlation_id(&self) -> Option<u64> {
        self.u64_header(header::CORRELATION_ID)
    }

    pub fn reply_for(&self) -> Option<u64> {
        self.u64_header(header::REPLY_FOR)
    }

    pub fn is_success(&self) -> bool {
        self.headers.contains_key(&header::RESULT_SUCCESS)
    }

    pub fn error_message(&self) -> Option<String> {
        self.headers
            .get(&header::RESULT_ERROR)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
    }

    pub fn with_fatal(self) -> Self {
        self.with_header(header::RESULT_FATAL, vec![1])
    }

    pub fn is_fatal(&self) -> bool {
        self.headers.contains_key(&header::RESULT_FATAL)
    }

    /// Positive headers: opaque peer data owned by the endpoints.
    pub fn peer_data(&self) -> HashMap<i32, Vec<u8>> {
        self.headers
            .iter()
            .filter(|(k, _)| **k > 0)
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_round_trip() {
        for raw in 1..=21u32 {
            let ct = ContentType::from_u32(raw).unwrap();
            assert_eq!(ct as u32, raw);
        }
        assert!(ContentType::from_u32(0).is_none());
        assert!(ContentType::from_u32(99).is_none());
    }

    #[test]
    fn correlation_headers() {
        let frame = Frame::new(ContentType::Heartbeat, Vec::new()).with_correlation_id(42);
        assert_eq!(frame.correlation_id(), Some(42));
        assert_eq!(frame.reply_for(), None);

        let reply = Frame::new(ContentType::HeartbeatResponse, Vec::new()).with_reply_for(42);
        assert_eq!(reply.reply_for(), Some(42));
    }

    #[test]
    fn peer_data_excludes_reserved_keys() {
        let frame = Frame::new(ContentType::RouteResult, Vec::new())
            .with_success()
            .with_header(7, b"host".to_vec())
            .with_header(header::TERMINATOR_LOCAL_ADDR, b"tcp:1.2.3.4:9".to_vec());
        let peer = frame.peer_data();
        assert_eq!(peer.len(), 2);
        assert!(peer.contains_key(&7));
        assert!(!peer.contains_key(&header::RESULT_SUCCESS));
    }
}
