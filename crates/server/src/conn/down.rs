//! The subscriber side: one peer connection per forwarded stream, one
//! `DownTrack` per forwarded RTP stream, plus the RTCP feedback loops
//! that turn subscriber reports into bitrate and RTT estimates.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use anyhow::{Context, Result};
use palaver_media::{RateEstimator, cache, rtptime};
use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::util::Unmarshal;

use crate::client::Action;
use crate::conn::{BitrateSlot, UpTrack};
use palaver_protocol::{IceCandidate, IceConfig};

/// Smallest cap the loss-driven estimator will settle on: 9.6 kbit/s.
const MIN_LOSS_RATE: u64 = 9_600;

/// Largest cap the loss-driven estimator will grow to: 2^30 bit/s.
const MAX_LOSS_RATE: u64 = 1 << 30;

/// One RTP stream forwarded to a subscriber.
pub struct DownTrack {
    pub local: Arc<TrackLocalStaticRTP>,
    pub sender: Arc<RTCRtpSender>,
    pub kind: RTPCodecType,
    pub clock_rate: u32,

    /// Non-owning back-reference to the source; cleared on
    /// unsubscribe so teardown is bilateral.
    source: parking_lot::Mutex<Weak<UpTrack>>,

    pub rate: RateEstimator,
    /// Loss-driven and REMB-driven bitrate readings, each timestamped
    /// so stale feedback is ignored by the allocator.
    pub loss_bitrate: BitrateSlot,
    pub remb_bitrate: BitrateSlot,

    /// Receiver statistics from the last RR.
    loss: AtomicU32,
    jitter: AtomicU32,

    /// When and with which NTP timestamp we last sent an SR, for RTT
    /// computation from echoed LSR/DLSR.
    sr_time: AtomicU64,
    sr_ntp: AtomicU64,
    /// Smoothed round-trip estimate in jiffies.
    rtt: AtomicU64,

    /// SSRC the negotiated sender transmits under; learned lazily.
    ssrc: AtomicU32,
    /// Last FIR sequence number seen from this subscriber; -1 = none.
    fir_seqno: AtomicI32,

    sr_kick: Arc<Notify>,
}

impl DownTrack {
    fn new(
        local: Arc<TrackLocalStaticRTP>,
        sender: Arc<RTCRtpSender>,
        source: &Arc<UpTrack>,
        sr_kick: Arc<Notify>,
    ) -> Arc<DownTrack> {
        Arc::new(DownTrack {
            local,
            sender,
            kind: source.kind,
            clock_rate: source.clock_rate,
            source: parking_lot::Mutex::new(Arc::downgrade(source)),
            rate: RateEstimator::new(),
            loss_bitrate: BitrateSlot::new(),
            remb_bitrate: BitrateSlot::new(),
            loss: AtomicU32::new(0),
            jitter: AtomicU32::new(0),
            sr_time: AtomicU64::new(0),
            sr_ntp: AtomicU64::new(0),
            rtt: AtomicU64::new(0),
            ssrc: AtomicU32::new(0),
            fir_seqno: AtomicI32::new(-1),
            sr_kick,
        })
    }

    pub fn source(&self) -> Option<Arc<UpTrack>> {
        self.source.lock().upgrade()
    }

    pub fn set_source(&self, up: &Arc<UpTrack>) {
        *self.source.lock() = Arc::downgrade(up);
    }

    pub fn clear_source(&self) {
        *self.source.lock() = Weak::new();
    }

    pub fn kick_sr(&self) {
        self.sr_kick.notify_one();
    }

    pub async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<(), webrtc::Error> {
        let n = self.local.write_rtp(packet).await?;
        self.rate.accumulate(n as u32);
        Ok(())
    }

    /// The effective cap this subscriber imposes: the minimum of the
    /// fresh loss- and REMB-derived readings, `u64::MAX` when neither
    /// is fresh.
    pub fn max_bitrate(&self, now: u64) -> u64 {
        let loss = self.loss_bitrate.get(now).unwrap_or(u64::MAX);
        let remb = self.remb_bitrate.get(now).unwrap_or(u64::MAX);
        loss.min(remb)
    }

    /// Smoothed RTT in jiffies (0 until an RR echoed one of our SRs).
    pub fn rtt(&self) -> u64 {
        self.rtt.load(Ordering::Relaxed)
    }

    /// Last reported interarrival jitter, converted to jiffies.
    pub fn jitter_jiffies(&self) -> u64 {
        let j = u64::from(self.jitter.load(Ordering::Relaxed));
        if self.clock_rate == 0 {
            return 0;
        }
        j * rtptime::JIFFIES_PER_SEC / u64::from(self.clock_rate)
    }

    pub fn loss_fraction(&self) -> u8 {
        self.loss.load(Ordering::Relaxed) as u8
    }

    async fn ssrc_lazy(&self) -> Option<u32> {
        let known = self.ssrc.load(Ordering::Relaxed);
        if known != 0 {
            return Some(known);
        }
        let params = self.sender.get_parameters().await;
        let ssrc = params.encodings.first().map(|e| e.ssrc)?;
        if ssrc != 0 {
            self.ssrc.store(ssrc, Ordering::Relaxed);
            Some(ssrc)
        } else {
            None
        }
    }

    /// True when this FIR sequence number is new, i.e. an actual
    /// request rather than a retransmission of the previous one.
    fn fir_seqno_changed(&self, seqno: u8) -> bool {
        let previous = self.fir_seqno.swap(i32::from(seqno), Ordering::Relaxed);
        previous != i32::from(seqno)
    }

    /// Evolve the loss-driven bitrate from a fresh loss fraction.
    fn update_rate(&self, loss: u8, now: u64) {
        let current = self
            .loss_bitrate
            .get_raw()
            .unwrap_or(MAX_LOSS_RATE)
            .clamp(MIN_LOSS_RATE, MAX_LOSS_RATE);
        let (byte_rate, _) = self.rate.estimate();
        let rate = evolve_loss_rate(current, loss, u64::from(byte_rate) * 8);
        // always restamp so staleness-based invalidation works
        self.loss_bitrate.set(rate, now);
    }

    fn handle_rr(&self, report: &ReceptionReport, now: u64) {
        self.loss.store(u32::from(report.fraction_lost), Ordering::Relaxed);
        self.jitter.store(report.jitter, Ordering::Relaxed);
        self.update_rate(self.loss.load(Ordering::Relaxed) as u8, now);

        // RTT from the echoed LSR/DLSR, when it matches our last SR
        let our_ntp = self.sr_ntp.load(Ordering::Relaxed);
        if report.last_sender_report == 0 || self.sr_time.load(Ordering::Relaxed) == 0 {
            return;
        }
        if report.last_sender_report != (our_ntp >> 16) as u32 {
            return;
        }
        let now_mid = (rtptime::ntp_time(SystemTime::now()) >> 16) as u32;
        let rtt = now_mid
            .wrapping_sub(report.last_sender_report)
            .wrapping_sub(report.delay);
        // LSR/DLSR are 16.16 seconds, which is exactly jiffies
        let rtt = u64::from(rtt);
        if rtt > 8 * rtptime::JIFFIES_PER_SEC {
            // nonsensical echo, ignore
            return;
        }
        let old = self.rtt.load(Ordering::Relaxed);
        self.rtt.store(smooth_rtt(old, rtt), Ordering::Relaxed);
    }

    /// Sender report anchored to the publisher's last SR: our NTP time
    /// now, and the RTP timestamp the publisher's clock would carry at
    /// this instant.
    async fn build_sr(&self) -> Option<SenderReport> {
        let up = self.source()?;
        let sr_ntp = up.sr_ntp.load(Ordering::Relaxed);
        if sr_ntp == 0 {
            return None;
        }
        let sr_rtp = up.sr_rtp.load(Ordering::Relaxed);
        let ssrc = self.ssrc_lazy().await?;

        let now_sys = SystemTime::now();
        let rtp_time = anchored_rtp_time(sr_rtp, sr_ntp, now_sys, self.clock_rate);

        let (packet_count, octet_count) = self.rate.totals();
        let ntp_time = rtptime::ntp_time(now_sys);
        self.sr_time.store(rtptime::jiffies(), Ordering::Relaxed);
        self.sr_ntp.store(ntp_time, Ordering::Relaxed);

        Some(SenderReport {
            ssrc,
            ntp_time,
            rtp_time,
            packet_count,
            octet_count,
            ..Default::default()
        })
    }
}

struct DownState {
    tracks: Vec<Arc<DownTrack>>,
    pending_candidates: Vec<RTCIceCandidateInit>,
    remote_set: bool,
    closed: bool,
    ice_state: RTCIceConnectionState,
}

/// One peer connection in the SFU → subscriber direction, forwarding
/// one published stream.
pub struct DownConnection {
    /// Stream id; shared with the source up-connection so `close` and
    /// `abort` refer to the same object on both sides.
    pub id: String,
    pub source_client: String,
    pub client_id: String,
    pub label: Option<String>,
    pub pc: Arc<RTCPeerConnection>,
    pub done: CancellationToken,
    sr_kick: Arc<Notify>,
    state: parking_lot::Mutex<DownState>,
}

impl DownConnection {
    pub async fn new(
        api: &API,
        ice: &IceConfig,
        id: String,
        label: Option<String>,
        source_client: String,
        client_id: String,
        actions: mpsc::Sender<Action>,
    ) -> Result<Arc<DownConnection>> {
        let pc = Arc::new(
            api.new_peer_connection(crate::conn::rtc_configuration(ice))
                .await
                .context("Failed to create subscriber peer connection")?,
        );

        let conn = Arc::new(DownConnection {
            id,
            source_client,
            client_id,
            label,
            pc: pc.clone(),
            done: CancellationToken::new(),
            sr_kick: Arc::new(Notify::new()),
            state: parking_lot::Mutex::new(DownState {
                tracks: Vec::new(),
                pending_candidates: Vec::new(),
                remote_set: false,
                closed: false,
                ice_state: RTCIceConnectionState::New,
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
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let weak = weak.clone();
            let actions = actions.clone();
            Box::pin(async move {
                let Some(conn) = weak.upgrade() else { return };
                tracing::debug!(conn = %conn.id, ?state, "Down ICE state");
                conn.state.lock().ice_state = state;
                if state == RTCIceConnectionState::Failed {
                    let _ = actions
                        .send(Action::DownIceFailed { id: conn.id.clone() })
                        .await;
                }
            })
        }));

        Ok(conn)
    }

    /// Add a forwarding pipe from `up`, spawn its RTCP listener, and
    /// attach it to the source's subscriber list.
    pub async fn add_track(self: &Arc<Self>, up: &Arc<UpTrack>) -> Result<Arc<DownTrack>> {
        let local = Arc::new(TrackLocalStaticRTP::new(
            up.codec.capability.clone(),
            up.label.clone(),
            self.id.clone(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add down-track")?;

        let down = DownTrack::new(local, sender, up, self.sr_kick.clone());
        self.state.lock().tracks.push(down.clone());
        up.attach(down.clone()).await;
        tokio::spawn(rtcp_listener(self.clone(), down.clone()));
        Ok(down)
    }

    pub fn tracks(&self) -> Vec<Arc<DownTrack>> {
        self.state.lock().tracks.clone()
    }

    pub fn ice_state(&self) -> RTCIceConnectionState {
        self.state.lock().ice_state
    }

    /// Create the local offer for this connection. With `ice_restart`,
    /// new credentials are generated (used after an ICE failure).
    pub async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        let options = ice_restart.then_some(RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .context("Failed to create offer")?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .context("Failed to set local description")?;
        Ok(offer.sdp)
    }

    /// Apply the subscriber's answer and flush buffered candidates.
    pub async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let answer =
            RTCSessionDescription::answer(sdp.to_owned()).context("Failed to parse SDP answer")?;
        self.pc
            .set_remote_description(answer)
            .await
            .context("Failed to set remote description")?;
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
        Ok(())
    }

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

    /// Bilateral teardown: every track is removed from its source's
    /// subscriber list before the transport closes, so no writer ends
    /// up writing into a dead peer.
    pub async fn close(&self) {
        let tracks = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.tracks)
        };
        self.done.cancel();
        for track in &tracks {
            if let Some(up) = track.source() {
                up.detach(track).await;
            }
            track.clear_source();
        }
        if let Err(e) = self.pc.close().await {
            tracing::debug!(conn = %self.id, "Down connection close: {e}");
        }
        tracing::info!(conn = %self.id, subscriber = %self.client_id, "Down connection closed");
    }
}

/// Per-down-track listener for the subscriber's RTCP: keyframe
/// requests are relayed upstream, REMB and receiver reports feed the
/// bitrate slots, NACKs are answered from the source's packet cache.
async fn rtcp_listener(conn: Arc<DownConnection>, track: Arc<DownTrack>) {
    loop {
        let packets = match track.sender.read_rtcp().await {
            Ok((packets, _)) => packets,
            Err(e) => {
                tracing::debug!(conn = %conn.id, "Down RTCP read ended: {e}");
                break;
            }
        };
        let now = rtptime::jiffies();

        for packet in packets {
            let any = packet.as_any();
            if any.downcast_ref::<PictureLossIndication>().is_some() {
                if let Some(up) = track.source() {
                    up.send_pli().await;
                }
            } else if let Some(fir) = any.downcast_ref::<FullIntraRequest>() {
                for entry in &fir.fir {
                    if track.fir_seqno_changed(entry.sequence_number) {
                        if let Some(up) = track.source() {
                            up.request_keyframe().await;
                        }
                    }
                }
            } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
                track.remb_bitrate.set(remb.bitrate as u64, now);
            } else if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
                let ssrc = track.ssrc.load(Ordering::Relaxed);
                for report in &rr.reports {
                    if ssrc != 0 && report.ssrc != ssrc {
                        continue;
                    }
                    track.handle_rr(report, now);
                }
            } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
                handle_nack(&track, nack).await;
            }
        }
    }
}

/// Retransmit NACKed packets from the source's cache, but only while
/// the current send rate leaves headroom under the effective cap.
async fn handle_nack(track: &Arc<DownTrack>, nack: &TransportLayerNack) {
    let Some(up) = track.source() else { return };
    let now = rtptime::jiffies();

    let cap = track.max_bitrate(now);
    if cap != u64::MAX {
        let (byte_rate, _) = track.rate.estimate();
        if u64::from(byte_rate) * 8 > cap / 8 * 7 {
            return;
        }
    }

    let mut buf = vec![0u8; cache::BUF_SIZE];
    let mut resent: u32 = 0;
    for pair in &nack.nacks {
        let mut seqnos = vec![pair.packet_id];
        for i in 0..16u16 {
            if pair.lost_packets & (1 << i) != 0 {
                seqnos.push(pair.packet_id.wrapping_add(i + 1));
            }
        }
        for seqno in seqnos {
            let len = up.cache.get(seqno, &mut buf);
            if len == 0 {
                continue;
            }
            let mut raw = &buf[..len];
            let Ok(packet) = rtp::packet::Packet::unmarshal(&mut raw) else {
                continue;
            };
            if track.write_rtp(&packet).await.is_ok() {
                resent += 1;
            }
        }
    }
    up.cache.expect(resent);
}

/// One step of the loss-driven bitrate evolution, applied on every
/// receiver report. Low loss grows the cap by 5% but only when the
/// track actually uses at least 7/8 of it; loss above 25/256 shrinks
/// it by `1 - loss/512`.
fn evolve_loss_rate(current: u64, loss: u8, actual_bits: u64) -> u64 {
    if loss < 5 {
        if actual_bits >= current / 8 * 7 {
            (current + current / 20).min(MAX_LOSS_RATE)
        } else {
            current
        }
    } else if loss > 25 {
        (current * (512 - u64::from(loss)) / 512).max(MIN_LOSS_RATE)
    } else {
        current
    }
}

/// `(3·old + new) / 4` smoothing; the first sample is taken as-is.
fn smooth_rtt(old: u64, sample: u64) -> u64 {
    if old == 0 { sample } else { (3 * old + sample) / 4 }
}

/// The RTP timestamp the publisher's clock would carry at `now`, given
/// its last SR's NTP/RTP pair.
fn anchored_rtp_time(sr_rtp: u32, sr_ntp: u64, now: SystemTime, clock_rate: u32) -> u32 {
    let remote = rtptime::ntp_to_time(sr_ntp);
    let delta = now.duration_since(remote).unwrap_or_default();
    sr_rtp.wrapping_add(rtptime::from_duration(delta, u64::from(clock_rate)) as u32)
}

/// 1 Hz sender-report loop per down-connection, kicked early when a
/// publisher's first SR arrives so NTP/RTP offsets propagate quickly.
pub(crate) async fn sr_sender_loop(conn: Arc<DownConnection>) {
    let mut tick = interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = conn.done.cancelled() => break,
            _ = tick.tick() => {}
            _ = conn.sr_kick.notified() => {}
        }
        for track in conn.tracks() {
            let Some(sr) = track.build_sr().await else {
                continue;
            };
            if let Err(e) = conn.pc.write_rtcp(&[Box::new(sr)]).await {
                tracing::debug!(conn = %conn.id, "SR send failed: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn loss_rate_grows_only_under_load() {
        // clean reports but idle track: cap stays put
        assert_eq!(evolve_loss_rate(1_000_000, 0, 100_000), 1_000_000);
        // clean reports at 7/8 utilization: 5% growth
        assert_eq!(evolve_loss_rate(1_000_000, 0, 900_000), 1_050_000);
        // growth saturates at 2^30
        assert_eq!(evolve_loss_rate(MAX_LOSS_RATE, 0, MAX_LOSS_RATE), MAX_LOSS_RATE);
    }

    #[test]
    fn loss_rate_shrinks_proportionally() {
        // loss = 64/256 (25%): multiply by (512-64)/512 = 7/8
        assert_eq!(evolve_loss_rate(1_024_000, 64, 1_024_000), 896_000);
        // moderate loss leaves the cap alone
        assert_eq!(evolve_loss_rate(1_000_000, 10, 1_000_000), 1_000_000);
        // the floor holds
        assert_eq!(evolve_loss_rate(MIN_LOSS_RATE, 255, MIN_LOSS_RATE), MIN_LOSS_RATE);
    }

    #[test]
    fn rtt_smoothing_follows_three_quarters_rule() {
        assert_eq!(smooth_rtt(0, 1000), 1000);
        assert_eq!(smooth_rtt(1000, 2000), (3 * 1000 + 2000) / 4);
        assert_eq!(smooth_rtt(1000, 1000), 1000);
    }

    #[test]
    fn anchored_rtp_time_advances_with_wall_clock() {
        let t0 = std::time::UNIX_EPOCH + StdDuration::from_secs(1_700_000_000);
        let sr_ntp = rtptime::ntp_time(t0);
        // two seconds later on a 90 kHz clock
        let now = t0 + StdDuration::from_secs(2);
        let rtp = anchored_rtp_time(50_000, sr_ntp, now, 90_000);
        assert_eq!(rtp, 50_000 + 2 * 90_000);
        // sub-millisecond precision: 20 ms => 1800 ticks
        let now = t0 + StdDuration::from_millis(20);
        let rtp = anchored_rtp_time(0, sr_ntp, now, 90_000);
        assert!((1799..=1800).contains(&rtp));
    }

    #[test]
    fn anchored_rtp_time_wraps() {
        let t0 = std::time::UNIX_EPOCH + StdDuration::from_secs(1_700_000_000);
        let sr_ntp = rtptime::ntp_time(t0);
        let now = t0 + StdDuration::from_secs(1);
        let rtp = anchored_rtp_time(u32::MAX - 45_000 + 1, sr_ntp, now, 90_000);
        assert_eq!(rtp, 45_000);
    }

    #[test]
    fn bitrate_slot_min_is_effective_cap() {
        let slot_loss = BitrateSlot::new();
        let slot_remb = BitrateSlot::new();
        slot_loss.set(600_000, 1000);
        slot_remb.set(800_000, 1000);
        let loss = slot_loss.get(1000).unwrap_or(u64::MAX);
        let remb = slot_remb.get(1000).unwrap_or(u64::MAX);
        assert_eq!(loss.min(remb), 600_000);
    }
}
