use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Protocol versions the server understands, in decreasing preference.
pub const PROTOCOL_VERSIONS: &[&str] = &["2", "1"];

/// Signaling messages between client and server.
///
/// The set of types is closed; both sides speak the same grammar. Replies
/// that represent a failure reuse the reply's `type` with `kind: "fail"`
/// and a stable machine-readable `error` code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Version negotiation. The client sends its versions in decreasing
    /// preference and the id it wishes to be known under; the server
    /// replies with the single version it picked.
    #[serde(rename = "handshake")]
    Handshake {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        version: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Liveness probe; the peer must answer with `pong` within 30 s.
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    /// Enter or leave a group.
    #[serde(rename = "join")]
    Join {
        kind: JoinKind,
        group: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Result of a join, or a later change of the client's standing.
    #[serde(rename = "joined")]
    Joined {
        kind: JoinedKind,
        group: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        permissions: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<crate::group::GroupStatus>,
        #[serde(
            rename = "rtcConfiguration",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        rtc_configuration: Option<RtcConfiguration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    /// Another participant joined, changed, or left.
    #[serde(rename = "user")]
    User {
        kind: UserKind,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        permissions: Vec<String>,
        /// Client metadata set via `useraction setdata`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    /// Declare which stream labels the client wants to receive.
    #[serde(rename = "request")]
    Request { request: RequestValue },
    /// Create or renegotiate a stream.
    #[serde(rename = "offer")]
    Offer {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        /// Id of a stream this one replaces.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replace: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        /// Maps each media-section id to a track label.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        labels: Option<HashMap<String, String>>,
        sdp: String,
    },
    #[serde(rename = "answer")]
    Answer { id: String, sdp: String },
    /// Trickle ICE candidate.
    #[serde(rename = "ice")]
    Ice { id: String, candidate: IceCandidate },
    /// Ask the offerer for a new offer with an ICE restart.
    #[serde(rename = "renegotiate")]
    Renegotiate { id: String },
    /// Change the track selection of a single stream.
    #[serde(rename = "requestStream")]
    RequestStream {
        id: String,
        request: Vec<TrackRequest>,
    },
    /// The offerer closes a stream.
    #[serde(rename = "close")]
    Close { id: String },
    /// The answerer asks the offerer to close a stream.
    #[serde(rename = "abort")]
    Abort { id: String },
    #[serde(rename = "chat")]
    Chat {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        kind: String,
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        privileged: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        noecho: bool,
        value: String,
    },
    /// Replay of archived chat, sent after a successful join.
    #[serde(rename = "chathistory")]
    ChatHistory {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        kind: String,
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<DateTime<Utc>>,
        value: String,
    },
    /// Out-of-band message, never archived.
    #[serde(rename = "usermessage")]
    UserMessage {
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        privileged: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
    },
    /// Op-only server-mediated action on another user.
    #[serde(rename = "useraction")]
    UserAction {
        kind: UserActionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        dest: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
    },
    /// Op-only group-wide action.
    #[serde(rename = "groupaction")]
    GroupAction {
        kind: GroupActionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
    },
}

impl ClientMessage {
    /// Stable error code of this message, when it represents a failure.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            ClientMessage::Joined { error, .. } => error.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Join,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinedKind {
    Join,
    Fail,
    Change,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserKind {
    Add,
    Change,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserActionKind {
    Op,
    Unop,
    Present,
    Unpresent,
    Kick,
    Setdata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupActionKind {
    Clearchat,
    Lock,
    Unlock,
    Record,
    Unrecord,
    Subgroups,
    Setdata,
}

/// A track kind a subscriber may request for a stream label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackRequest {
    #[serde(rename = "audio")]
    Audio,
    #[serde(rename = "video")]
    Video,
    #[serde(rename = "video-low")]
    VideoLow,
}

/// Trickle ICE candidate in the browser's JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// ICE server configuration suggested to clients in `joined`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcConfiguration {
    #[serde(rename = "iceServers", default, skip_serializing_if = "Vec::is_empty")]
    pub ice_servers: Vec<IceServerInfo>,
}

/// A bitrate cap with three-state wire semantics: `false` means muted,
/// `true` means unlimited, a number is the cap in bits per second.
///
/// Internally `0` is muted and `u32::MAX` is unlimited, and those two
/// values round-trip as booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate(pub u32);

impl Rate {
    pub const MUTED: Rate = Rate(0);
    pub const UNLIMITED: Rate = Rate(u32::MAX);

    pub fn is_muted(self) -> bool {
        self.0 == 0
    }
}

impl Serialize for Rate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            0 => serializer.serialize_bool(false),
            u32::MAX => serializer.serialize_bool(true),
            n => serializer.serialize_u32(n),
        }
    }
}

impl<'de> Deserialize<'de> for Rate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bool(bool),
            Num(u64),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Bool(false) => Rate::MUTED,
            Repr::Bool(true) => Rate::UNLIMITED,
            Repr::Num(n) => Rate(n.min(u32::MAX as u64) as u32),
        })
    }
}

/// Protocol-v1 request form: a flat map from track kind to rate.
pub type RateMap = HashMap<String, Rate>;

/// The value of a `request` message. Protocol v2 maps stream labels
/// (`""` = default) to arrays of track kinds; v1 sent a flat rate map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestValue {
    Labels(HashMap<String, Vec<TrackRequest>>),
    Rates(RateMap),
}

impl RequestValue {
    /// Normalize to the v2 shape. A v1 rate map becomes the default
    /// label; `false`/`0` disables the kind, anything else enables it.
    pub fn normalize(&self) -> HashMap<String, Vec<TrackRequest>> {
        match self {
            RequestValue::Labels(m) => m.clone(),
            RequestValue::Rates(m) => {
                let mut kinds = Vec::new();
                for (k, rate) in m {
                    if rate.is_muted() {
                        continue;
                    }
                    match k.as_str() {
                        "audio" => kinds.push(TrackRequest::Audio),
                        "video" => kinds.push(TrackRequest::Video),
                        "video-low" => kinds.push(TrackRequest::VideoLow),
                        _ => {}
                    }
                }
                kinds.sort_by_key(|k| *k as u8);
                HashMap::from([(String::new(), kinds)])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_roundtrip() {
        let msg = ClientMessage::Handshake {
            version: vec!["2".to_owned(), "1".to_owned()],
            id: Some("client-7".to_owned()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"handshake""#));
        assert!(json.contains(r#""version":["2","1"]"#));
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::Handshake { version, id } => {
                assert_eq!(version, ["2", "1"]);
                assert_eq!(id.as_deref(), Some("client-7"));
            }
            _ => panic!("Expected Handshake"),
        }
    }

    #[test]
    fn ping_is_bare() {
        let json = serde_json::to_string(&ClientMessage::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::Pong));
    }

    #[test]
    fn join_from_browser_format() {
        let browser_json = r#"{
            "type": "join",
            "kind": "join",
            "group": "public/lobby",
            "username": "alice",
            "password": "secret"
        }"#;
        let msg: ClientMessage = serde_json::from_str(browser_json).unwrap();
        match msg {
            ClientMessage::Join {
                kind,
                group,
                username,
                token,
                ..
            } => {
                assert_eq!(kind, JoinKind::Join);
                assert_eq!(group, "public/lobby");
                assert_eq!(username.as_deref(), Some("alice"));
                assert!(token.is_none());
            }
            _ => panic!("Expected Join"),
        }
    }

    #[test]
    fn joined_fail_carries_error_code() {
        let msg = ClientMessage::Joined {
            kind: JoinedKind::Fail,
            group: "private".to_owned(),
            username: None,
            permissions: Vec::new(),
            status: None,
            rtc_configuration: None,
            error: Some("group-locked".to_owned()),
            value: Some("this group is locked".to_owned()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""kind":"fail""#));
        assert!(json.contains(r#""error":"group-locked""#));
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.error_code(), Some("group-locked"));
    }

    #[test]
    fn request_stream_wire_name_is_camel_case() {
        let msg = ClientMessage::RequestStream {
            id: "s1".to_owned(),
            request: vec![TrackRequest::Audio, TrackRequest::VideoLow],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"requestStream""#));
        assert!(json.contains(r#""video-low""#));
    }

    #[test]
    fn ice_candidate_browser_field_names() {
        let msg = ClientMessage::Ice {
            id: "c1".to_owned(),
            candidate: IceCandidate {
                candidate: "candidate:1 1 UDP 2130706431 192.0.2.1 50000 typ host".to_owned(),
                sdp_mid: Some("0".to_owned()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""sdpMid":"0""#));
        assert!(json.contains(r#""sdpMLineIndex":0"#));
        assert!(!json.contains("sdp_mid"));
    }

    #[test]
    fn request_v2_labels() {
        let json = r#"{"type":"request","request":{"":["audio","video"],"screenshare":["video"]}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        let ClientMessage::Request { request } = msg else {
            panic!("Expected Request");
        };
        let normalized = request.normalize();
        assert_eq!(
            normalized[""],
            vec![TrackRequest::Audio, TrackRequest::Video]
        );
        assert_eq!(normalized["screenshare"], vec![TrackRequest::Video]);
    }

    #[test]
    fn request_v1_rate_map() {
        let json = r#"{"type":"request","request":{"audio":true,"video":512000}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        let ClientMessage::Request { request } = msg else {
            panic!("Expected Request");
        };
        let normalized = request.normalize();
        assert_eq!(
            normalized[""],
            vec![TrackRequest::Audio, TrackRequest::Video]
        );
    }

    #[test]
    fn rate_three_state_wire_semantics() {
        assert_eq!(serde_json::to_string(&Rate::MUTED).unwrap(), "false");
        assert_eq!(serde_json::to_string(&Rate::UNLIMITED).unwrap(), "true");
        assert_eq!(serde_json::to_string(&Rate(512000)).unwrap(), "512000");

        let muted: Rate = serde_json::from_str("false").unwrap();
        assert_eq!(muted, Rate::MUTED);
        let unlimited: Rate = serde_json::from_str("true").unwrap();
        assert_eq!(unlimited, Rate::UNLIMITED);
        let capped: Rate = serde_json::from_str("512000").unwrap();
        assert_eq!(capped, Rate(512000));
        // 2^32 - 1 on the wire is the boolean "true" state
        let max: Rate = serde_json::from_str("4294967295").unwrap();
        assert_eq!(serde_json::to_string(&max).unwrap(), "true");
    }

    #[test]
    fn rate_v1_mute_disables_kind() {
        let json = r#"{"type":"request","request":{"audio":false,"video":0}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        let ClientMessage::Request { request } = msg else {
            panic!("Expected Request");
        };
        assert!(request.normalize()[""].is_empty());
    }

    #[test]
    fn chat_time_is_rfc3339() {
        let time = chrono::DateTime::parse_from_rfc3339("2024-05-01T12:30:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let msg = ClientMessage::Chat {
            kind: String::new(),
            source: "id-1".to_owned(),
            username: Some("alice".to_owned()),
            dest: None,
            privileged: false,
            time: Some(time),
            noecho: false,
            value: "hello".to_owned(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("2024-05-01T12:30:00Z"));
        // empty kind and false flags are omitted from the wire
        assert!(!json.contains(r#""kind""#));
        assert!(!json.contains("noecho"));
    }

    #[test]
    fn useraction_kick() {
        let json = r#"{"type":"useraction","kind":"kick","dest":"bob-id","value":"be nice"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::UserAction { kind, dest, .. } => {
                assert_eq!(kind, UserActionKind::Kick);
                assert_eq!(dest, "bob-id");
            }
            _ => panic!("Expected UserAction"),
        }
    }

    #[test]
    fn groupaction_kinds() {
        for kind in ["clearchat", "lock", "unlock", "record", "unrecord", "subgroups"] {
            let json = format!(r#"{{"type":"groupaction","kind":"{kind}"}}"#);
            let msg: ClientMessage = serde_json::from_str(&json).unwrap();
            assert!(matches!(msg, ClientMessage::GroupAction { .. }), "{kind}");
        }
    }

    #[test]
    fn offer_labels_map() {
        let json = r#"{
            "type": "offer",
            "id": "s1",
            "label": "camera",
            "labels": {"0": "audio", "1": "video"},
            "sdp": "v=0\r\n"
        }"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Offer { label, labels, .. } => {
                assert_eq!(label.as_deref(), Some("camera"));
                assert_eq!(labels.unwrap()["1"], "video");
            }
            _ => panic!("Expected Offer"),
        }
    }
}
