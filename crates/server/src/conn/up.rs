//! The publisher side: one peer connection per published stream, one
//! `UpTrack` per received RTP stream, and the reader/writer pair that
//! fans packets out to subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use palaver_media::{JitterEstimator, PacketCache, RateEstimator, cache, rtptime};
use rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::{MarshalSize, Unmarshal};

use crate::client::Action;
use crate::conn::{DownTrack, KEYFRAME_INTERVAL};
use crate::engine::supports_feedback;

use palaver_protocol::{IceCandidate, IceConfig};

/// Capacity of the per-track `(seqno, slot)` channel between reader
/// and writer.
const PACKET_CHANNEL_CAPACITY: usize = 32;

/// Sequence distance the reader lets packets stay in flight before it
/// harvests a NACK for the stragglers behind them.
const NACK_HORIZON: u16 = 24;

/// Subscriber-set change delivered to the writer so the hot path
/// never takes the subscriber-list lock.
pub(crate) enum SubscriberChange {
    Add(Arc<DownTrack>),
    Remove(Arc<DownTrack>),
}

/// Latch that discards the rest of a video frame once the writer
/// channel overflows, resuming after the next marker bit. Forwarding a
/// frame's tail without its head would only corrupt the decoder.
#[derive(Default)]
struct FrameDropGate {
    dropping: bool,
}

impl FrameDropGate {
    /// Whether this packet must be skipped; consumes the marker that
    /// re-arms forwarding.
    fn skip(&mut self, marker: bool) -> bool {
        if !self.dropping {
            return false;
        }
        if marker {
            self.dropping = false;
        }
        true
    }

    fn trip(&mut self) {
        self.dropping = true;
    }
}

/// One RTP stream received from a publisher.
pub struct UpTrack {
    pub remote: Arc<TrackRemote>,
    pc: Weak<RTCPeerConnection>,
    /// Effective track label: `audio`, `video`, or `video-low`.
    pub label: String,
    pub rid: String,
    pub ssrc: u32,
    pub kind: RTPCodecType,
    pub codec: RTCRtpCodecParameters,
    pub clock_rate: u32,
    pub fir_supported: bool,
    pub remb_supported: bool,
    pub nack_supported: bool,

    pub cache: PacketCache,
    pub jitter: JitterEstimator,
    pub rate: RateEstimator,

    /// Bitrate cap (bits/s) the allocator asks the publisher to
    /// respect; `u64::MAX` means unlimited.
    pub max_bitrate: AtomicU64,

    last_pli: AtomicU64,
    last_fir: AtomicU64,
    fir_seqno: AtomicU32,

    /// Last sender report from the publisher: arrival in jiffies, NTP
    /// and RTP timestamps. Zero NTP means none seen yet.
    pub sr_time: AtomicU64,
    pub sr_ntp: AtomicU64,
    pub sr_rtp: AtomicU32,

    local: parking_lot::Mutex<Vec<Arc<DownTrack>>>,
    changes: mpsc::Sender<SubscriberChange>,
    pub writer_done: CancellationToken,
}

impl UpTrack {
    fn new(
        pc: &Arc<RTCPeerConnection>,
        remote: Arc<TrackRemote>,
        changes: mpsc::Sender<SubscriberChange>,
    ) -> Arc<UpTrack> {
        let codec = remote.codec();
        let kind = remote.kind();
        let rid = remote.rid().to_owned();
        let label = match kind {
            RTPCodecType::Audio => "audio".to_owned(),
            _ if rid == "l" => "video-low".to_owned(),
            _ => "video".to_owned(),
        };
        let cache_size = if kind == RTPCodecType::Video { 128 } else { 32 };
        let clock_rate = codec.capability.clock_rate;
        Arc::new(UpTrack {
            ssrc: remote.ssrc(),
            rid,
            label,
            kind,
            clock_rate,
            fir_supported: supports_feedback(&codec, "ccm", "fir"),
            remb_supported: supports_feedback(&codec, "goog-remb", ""),
            nack_supported: supports_feedback(&codec, "nack", ""),
            codec,
            remote,
            pc: Arc::downgrade(pc),
            cache: PacketCache::new(cache_size),
            jitter: JitterEstimator::new(clock_rate),
            rate: RateEstimator::new(),
            max_bitrate: AtomicU64::new(u64::MAX),
            last_pli: AtomicU64::new(0),
            last_fir: AtomicU64::new(0),
            fir_seqno: AtomicU32::new(0),
            sr_time: AtomicU64::new(0),
            sr_ntp: AtomicU64::new(0),
            sr_rtp: AtomicU32::new(0),
            local: parking_lot::Mutex::new(Vec::new()),
            changes,
            writer_done: CancellationToken::new(),
        })
    }

    pub fn subscribers(&self) -> Vec<Arc<DownTrack>> {
        self.local.lock().clone()
    }

    /// Attach a subscriber: the list is updated under its lock, and the
    /// writer learns about it through the change channel so the packet
    /// path stays lock-free.
    pub async fn attach(&self, down: Arc<DownTrack>) {
        {
            let mut local = self.local.lock();
            if local.iter().any(|d| Arc::ptr_eq(d, &down)) {
                return;
            }
            local.push(down.clone());
        }
        tokio::select! {
            _ = self.writer_done.cancelled() => {}
            _ = self.changes.send(SubscriberChange::Add(down)) => {}
        }
    }

    pub async fn detach(&self, down: &Arc<DownTrack>) {
        self.local.lock().retain(|d| !Arc::ptr_eq(d, down));
        tokio::select! {
            _ = self.writer_done.cancelled() => {}
            _ = self.changes.send(SubscriberChange::Remove(down.clone())) => {}
        }
    }

    /// Ask the publisher for a keyframe, preferring FIR when the codec
    /// negotiated it. Rate-limited to one per 200 ms; the FIR sequence
    /// number stays monotonic across rate-limited drops.
    pub async fn request_keyframe(&self) {
        if self.kind != RTPCodecType::Video {
            return;
        }
        if !self.fir_supported {
            self.send_pli().await;
            return;
        }
        let seqno = (self.fir_seqno.fetch_add(1, Ordering::Relaxed) & 0xff) as u8;
        let now = rtptime::jiffies();
        let last = self.last_fir.load(Ordering::Relaxed);
        if now.saturating_sub(last) < KEYFRAME_INTERVAL {
            return;
        }
        self.last_fir.store(now, Ordering::Relaxed);
        let Some(pc) = self.pc.upgrade() else { return };
        let fir = FullIntraRequest {
            sender_ssrc: 0,
            media_ssrc: self.ssrc,
            fir: vec![FirEntry {
                ssrc: self.ssrc,
                sequence_number: seqno,
            }],
        };
        if let Err(e) = pc.write_rtcp(&[Box::new(fir)]).await {
            tracing::debug!(ssrc = self.ssrc, "FIR send failed: {e}");
        }
    }

    pub async fn send_pli(&self) {
        let now = rtptime::jiffies();
        let last = self.last_pli.load(Ordering::Relaxed);
        if now.saturating_sub(last) < KEYFRAME_INTERVAL {
            return;
        }
        self.last_pli.store(now, Ordering::Relaxed);
        let Some(pc) = self.pc.upgrade() else { return };
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: self.ssrc,
        };
        if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
            tracing::debug!(ssrc = self.ssrc, "PLI send failed: {e}");
        }
    }

    /// Advise the publisher of its current cap via REMB.
    pub async fn send_remb(&self, bitrate: u64) {
        let Some(pc) = self.pc.upgrade() else { return };
        let remb = ReceiverEstimatedMaximumBitrate {
            sender_ssrc: 0,
            bitrate: bitrate as f32,
            ssrcs: vec![self.ssrc],
        };
        if let Err(e) = pc.write_rtcp(&[Box::new(remb)]).await {
            tracing::debug!(ssrc = self.ssrc, "REMB send failed: {e}");
        }
    }

    async fn send_nack(&self, first: u16, bitmap: u16) {
        let Some(pc) = self.pc.upgrade() else { return };
        let nack = TransportLayerNack {
            sender_ssrc: 0,
            media_ssrc: self.ssrc,
            nacks: vec![NackPair {
                packet_id: first,
                lost_packets: bitmap,
            }],
        };
        if let Err(e) = pc.write_rtcp(&[Box::new(nack)]).await {
            tracing::debug!(ssrc = self.ssrc, "NACK send failed: {e}");
        }
    }

    /// Reception statistics for the next receiver report, resetting
    /// the interval counters.
    fn reception_report(&self) -> ReceptionReport {
        let stats = self.cache.get_stats(true);
        let fraction_lost = if stats.expected > 0 {
            ((u64::from(stats.lost) * 256 / u64::from(stats.expected)).min(255)) as u8
        } else {
            0
        };
        let sr_ntp = self.sr_ntp.load(Ordering::Relaxed);
        let (last_sender_report, delay) = if sr_ntp != 0 {
            let dlsr = rtptime::jiffies().saturating_sub(self.sr_time.load(Ordering::Relaxed));
            ((sr_ntp >> 16) as u32, dlsr as u32)
        } else {
            (0, 0)
        };
        ReceptionReport {
            ssrc: self.ssrc,
            fraction_lost,
            total_lost: stats.total_lost & 0x00ff_ffff,
            last_sequence_number: stats.extended_seqno,
            jitter: self.jitter.jitter(),
            last_sender_report,
            delay,
        }
    }
}

struct UpState {
    labels: HashMap<String, String>,
    tracks: Vec<Arc<UpTrack>>,
    pending_candidates: Vec<RTCIceCandidateInit>,
    remote_set: bool,
    completed: bool,
    closed: bool,
}

/// One peer connection in the publisher → SFU direction.
pub struct UpConnection {
    pub id: String,
    pub label: Option<String>,
    /// Stream id this one replaces, honored once negotiation completes.
    pub replace: Option<String>,
    pub client_id: String,
    pub pc: Arc<RTCPeerConnection>,
    pub done: CancellationToken,
    /// Whether this connection has been counted into its group's
    /// video-publisher total.
    pub video_counted: std::sync::atomic::AtomicBool,
    state: parking_lot::Mutex<UpState>,
}

impl UpConnection {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        api: &API,
        ice: &IceConfig,
        id: String,
        label: Option<String>,
        replace: Option<String>,
        labels: HashMap<String, String>,
        client_id: String,
        actions: mpsc::Sender<Action>,
    ) -> Result<Arc<UpConnection>> {
        let pc = Arc::new(
            api.new_peer_connection(crate::conn::rtc_configuration(ice))
                .await
                .context("Failed to create publisher peer connection")?,
        );

        let conn = Arc::new(UpConnection {
            id,
            label,
            replace,
            client_id,
            pc: pc.clone(),
            done: CancellationToken::new(),
            video_counted: std::sync::atomic::AtomicBool::new(false),
            state: parking_lot::Mutex::new(UpState {
                labels,
                tracks: Vec::new(),
                pending_candidates: Vec::new(),
                remote_set: false,
                completed: false,
                closed: false,
            }),
        });

        let weak = Arc::downgrade(&conn);
        let ice_actions = actions.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let weak = weak.clone();
            let actions = ice_actions.clone();
            Box::pin(async move {
                let (Some(conn), Some(c)) = (weak.upgrade(), candidate) else {
                    return;
                };
                match c.to_json() {
                    Ok(json) => {
                        let msg = palaver_protocol::ClientMessage::Ice {
                            id: conn.id.clone(),
                            candidate: IceCandidate {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                                username_fragment: json.username_fragment,
                            },
                        };
                        let _ = actions.send(Action::Deliver(Box::new(msg))).await;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to serialize ICE candidate: {e}");
                    }
                }
            })
        }));

        let weak = Arc::downgrade(&conn);
        let state_actions = actions.clone();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let weak = weak.clone();
            let actions = state_actions.clone();
            Box::pin(async move {
                let Some(conn) = weak.upgrade() else { return };
                tracing::debug!(conn = %conn.id, ?state, "Up ICE state");
                if state == RTCIceConnectionState::Failed {
                    let _ = actions.send(Action::UpIceFailed { id: conn.id.clone() }).await;
                }
            })
        }));

        let weak = Arc::downgrade(&conn);
        pc.on_track(Box::new(move |track, receiver, _transceiver| {
            let weak = weak.clone();
            let actions = actions.clone();
            Box::pin(async move {
                let Some(conn) = weak.upgrade() else { return };
                let completed = conn.accept_track(track, receiver);
                if completed {
                    let _ = actions
                        .send(Action::UpComplete { id: conn.id.clone() })
                        .await;
                }
            })
        }));

        tokio::spawn(rr_sender_loop(conn.clone()));

        Ok(conn)
    }

    /// Register a surfaced track, spawn its pipeline, and report
    /// whether the connection just became complete (every declared
    /// media section has produced a track).
    fn accept_track(
        self: &Arc<Self>,
        track: Arc<TrackRemote>,
        receiver: Arc<RTCRtpReceiver>,
    ) -> bool {
        let (changes_tx, changes_rx) = mpsc::channel(16);
        let (index_tx, index_rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let up = UpTrack::new(&self.pc, track, changes_tx);

        tracing::info!(
            conn = %self.id,
            ssrc = up.ssrc,
            label = %up.label,
            rid = %up.rid,
            codec = %up.codec.capability.mime_type,
            "Up-track started"
        );

        tokio::spawn(reader_loop(up.clone(), index_tx, self.done.clone()));
        tokio::spawn(writer_loop(up.clone(), index_rx, changes_rx));
        tokio::spawn(rtcp_listener(up.clone(), receiver));

        let mut state = self.state.lock();
        state.tracks.push(up);
        let declared = state.labels.len().max(1);
        if state.tracks.len() >= declared {
            // re-announced on every further track so renegotiated
            // streams get pushed to subscribers again
            state.completed = true;
            return true;
        }
        false
    }

    pub fn tracks(&self) -> Vec<Arc<UpTrack>> {
        self.state.lock().tracks.clone()
    }

    pub fn complete(&self) -> bool {
        self.state.lock().completed
    }

    pub fn has_video(&self) -> bool {
        self.state
            .lock()
            .tracks
            .iter()
            .any(|t| t.kind == RTPCodecType::Video)
    }

    /// Apply a remote offer and produce the local answer. Candidates
    /// that trickled in early are flushed afterwards.
    pub async fn answer_offer(&self, sdp: &str) -> Result<String> {
        let offer =
            RTCSessionDescription::offer(sdp.to_owned()).context("Failed to parse SDP offer")?;
        self.pc
            .set_remote_description(offer)
            .await
            .context("Failed to set remote description")?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .context("Failed to set local description")?;

        let pending = {
            let mut state = self.state.lock();
            state.remote_set = true;
            std::mem::take(&mut state.pending_candidates)
        };
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!(conn = %self.id, "Buffered ICE candidate rejected: {e}");
            }
        }
        Ok(answer.sdp)
    }

    /// Add a trickled candidate, buffering it while no remote
    /// description has been applied yet.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        {
            let mut state = self.state.lock();
            if !state.remote_set {
                state.pending_candidates.push(init);
                return Ok(());
            }
        }
        self.pc
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")
    }

    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.done.cancel();
        if let Err(e) = self.pc.close().await {
            tracing::debug!(conn = %self.id, "Up connection close: {e}");
        }
        tracing::info!(conn = %self.id, "Up connection closed");
    }
}

/// Reader: one per up-track. Accounts the packet, feeds the jitter
/// estimator, caches the payload, NACKs stragglers, and hands the
/// cache slot to the writer. When the writer falls behind on a video
/// track, whole frames are dropped up to the next marker bit so
/// subscribers never see a partial frame.
async fn reader_loop(
    track: Arc<UpTrack>,
    index_tx: mpsc::Sender<(u16, u16)>,
    done: CancellationToken,
) {
    let mut buf = vec![0u8; cache::BUF_SIZE];
    let mut gate = FrameDropGate::default();

    loop {
        let (packet, _) = tokio::select! {
            _ = done.cancelled() => break,
            r = track.remote.read(&mut buf) => match r {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(ssrc = track.ssrc, "RTP read ended: {e}");
                    break;
                }
            },
        };

        let size = (packet.header.marshal_size() + packet.payload.len()).min(buf.len());
        track.rate.accumulate(size as u32);
        track.jitter.accumulate(packet.header.timestamp);

        let seqno = packet.header.sequence_number;
        let (first, index) = track.cache.store(seqno, &buf[..size]);

        // NACK the publisher for anything older than the reorder horizon
        let in_flight = seqno.wrapping_sub(first);
        if track.nack_supported && in_flight & 0x8000 == 0 && in_flight > NACK_HORIZON {
            if let Some((missing, bitmap)) =
                track.cache.bitmap_get(seqno.wrapping_sub(NACK_HORIZON))
            {
                track.cache.expect(1 + bitmap.count_ones());
                track.send_nack(missing, bitmap).await;
            }
        }

        if gate.skip(packet.header.marker) {
            continue;
        }

        if track.kind == RTPCodecType::Video {
            match index_tx.try_send((seqno, index)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // drop the rest of this frame rather than forward a
                    // partial one
                    gate.trip();
                }
                Err(TrySendError::Closed(_)) => break,
            }
        } else {
            tokio::select! {
                _ = track.writer_done.cancelled() => break,
                r = index_tx.send((seqno, index)) => {
                    if r.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Writer: fans each cached packet out to the local subscriber list.
/// The list is owned by this task; attach/detach arrive as events so
/// the per-packet path takes no locks.
async fn writer_loop(
    track: Arc<UpTrack>,
    mut index_rx: mpsc::Receiver<(u16, u16)>,
    mut changes_rx: mpsc::Receiver<SubscriberChange>,
) {
    let mut local: Vec<Arc<DownTrack>> = Vec::new();
    let mut fir_sent = true;
    let mut buf = vec![0u8; cache::BUF_SIZE];

    loop {
        tokio::select! {
            change = changes_rx.recv() => {
                match change {
                    Some(SubscriberChange::Add(down)) => {
                        if !local.iter().any(|d| Arc::ptr_eq(d, &down)) {
                            local.push(down);
                        }
                        // the new subscriber needs a keyframe to start decoding
                        fir_sent = false;
                    }
                    Some(SubscriberChange::Remove(down)) => {
                        local.retain(|d| !Arc::ptr_eq(d, &down));
                    }
                    None => break,
                }
            }
            item = index_rx.recv() => {
                let Some((seqno, index)) = item else { break };
                let len = track.cache.get_at(seqno, index, &mut buf);
                if len == 0 || local.is_empty() {
                    continue;
                }
                let mut raw = &buf[..len];
                let Ok(packet) = rtp::packet::Packet::unmarshal(&mut raw) else {
                    continue;
                };

                if !fir_sent && track.kind == RTPCodecType::Video {
                    track.request_keyframe().await;
                    fir_sent = true;
                }

                for down in &local {
                    if let Err(e) = down.write_rtp(&packet).await {
                        if e != webrtc::Error::ErrClosedPipe {
                            tracing::debug!(ssrc = track.ssrc, "Down-track write: {e}");
                        }
                    }
                }
            }
        }
    }

    track.writer_done.cancel();
}

/// Per-track listener for RTCP arriving from the publisher. Sender
/// reports are captured for downstream NTP/RTP offset propagation;
/// the first one kicks an immediate SR toward every subscriber.
async fn rtcp_listener(track: Arc<UpTrack>, receiver: Arc<RTCRtpReceiver>) {
    loop {
        let packets = match receiver.read_rtcp().await {
            Ok((packets, _)) => packets,
            Err(e) => {
                tracing::debug!(ssrc = track.ssrc, "Up RTCP read ended: {e}");
                break;
            }
        };
        for packet in packets {
            let Some(sr) = packet.as_any().downcast_ref::<SenderReport>() else {
                continue;
            };
            if sr.ssrc != track.ssrc {
                continue;
            }
            let previous = track.sr_ntp.swap(sr.ntp_time, Ordering::Relaxed);
            track.sr_rtp.store(sr.rtp_time, Ordering::Relaxed);
            track.sr_time.store(rtptime::jiffies(), Ordering::Relaxed);
            if previous == 0 {
                // propagate the time offset downstream right away
                for down in track.subscribers() {
                    down.kick_sr();
                }
            }
        }
    }
}

/// 1 Hz receiver-report sender, one per up-connection. Aggregates the
/// reception statistics of every up-track into a single RR.
pub(crate) async fn rr_sender_loop(conn: Arc<UpConnection>) {
    let mut tick = interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = conn.done.cancelled() => break,
            _ = tick.tick() => {}
        }
        let reports: Vec<ReceptionReport> = conn
            .tracks()
            .iter()
            .map(|t| t.reception_report())
            .collect();
        if reports.is_empty() {
            continue;
        }
        let rr = ReceiverReport {
            ssrc: 1,
            reports,
            ..Default::default()
        };
        if let Err(e) = conn.pc.write_rtcp(&[Box::new(rr)]).await {
            tracing::debug!(conn = %conn.id, "RR send failed: {e}");
            break;
        }
    }
}
