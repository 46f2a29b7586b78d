use anyhow::Result;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::interceptor::registry::Registry;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::sdp::extmap::{SDES_MID_URI, SDES_RTP_STREAM_ID_URI};

/// RTCP feedback the SFU is prepared to consume and act on for video.
/// Matches what the forwarding pipeline implements: NACK retransmission
/// from the packet cache, PLI/FIR keyframe relays, and REMB caps.
fn video_feedback() -> Vec<RTCPFeedback> {
    vec![
        RTCPFeedback {
            typ: "goog-remb".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "ccm".into(),
            parameter: "fir".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "pli".into(),
        },
    ]
}

/// Build the shared WebRTC API factory. Called once at startup; every
/// peer connection in every group comes from this object.
///
/// The interceptor registry is left empty: receiver reports, NACK
/// responses and keyframe requests are produced by the forwarding
/// pipeline itself, and the default interceptor chain would duplicate
/// (and race) that RTCP traffic.
pub fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: video_feedback(),
            },
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_string(),
                rtcp_feedback: video_feedback(),
            },
            payload_type: 102,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    // mid and rid extensions so simulcast layers can be told apart
    for uri in [SDES_MID_URI, SDES_RTP_STREAM_ID_URI] {
        media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: uri.to_owned(),
            },
            RTPCodecType::Video,
            None,
        )?;
    }
    media_engine.register_header_extension(
        RTCRtpHeaderExtensionCapability {
            uri: SDES_MID_URI.to_owned(),
        },
        RTPCodecType::Audio,
        None,
    )?;

    let registry = Registry::new();

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Whether a codec negotiated the given RTCP feedback type.
pub fn supports_feedback(params: &RTCRtpCodecParameters, typ: &str, parameter: &str) -> bool {
    params
        .capability
        .rtcp_feedback
        .iter()
        .any(|fb| fb.typ == typ && fb.parameter == parameter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_builds_with_codecs() {
        build_api().unwrap();
    }

    #[test]
    fn feedback_probe() {
        let params = RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                rtcp_feedback: video_feedback(),
                ..Default::default()
            },
            payload_type: 96,
            ..Default::default()
        };
        assert!(supports_feedback(&params, "goog-remb", ""));
        assert!(supports_feedback(&params, "ccm", "fir"));
        assert!(supports_feedback(&params, "nack", "pli"));
        assert!(!supports_feedback(&params, "transport-cc", ""));
    }
}
