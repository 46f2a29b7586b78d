//! The 1 Hz bitrate allocator: computes the cap each publisher must
//! respect from the worst fresh feedback among its subscribers, sizes
//! the packet caches from the observed round-trip times, and advises
//! publishers via REMB.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use palaver_media::rtptime::{self, JIFFIES_PER_SEC};
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::client::Client;
use crate::group::Group;

/// Smallest cap ever requested from an audio publisher: 9.6 kbit/s.
const AUDIO_MIN_RATE: u64 = 9_600;
/// Smallest cap ever requested from a video publisher: 200 kbit/s.
const VIDEO_MIN_RATE: u64 = 200_000;

/// Start the allocator for one client; the returned token stops it
/// (it is also a child of the client's `done`).
pub fn spawn(client: Arc<Client>, group: Arc<Group>) -> CancellationToken {
    let token = client.done.child_token();
    let task_token = token.clone();
    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = task_token.cancelled() => break,
                _ = tick.tick() => {}
            }
            allocate(&client, &group).await;
        }
    });
    token
}

async fn allocate(client: &Arc<Client>, group: &Arc<Group>) {
    let now = rtptime::jiffies();
    for conn in client.up_connections() {
        for track in conn.tracks() {
            let is_video = track.kind == RTPCodecType::Video;
            let min_rate = if is_video {
                VIDEO_MIN_RATE
            } else {
                AUDIO_MIN_RATE
            };
            let base = if is_video {
                busy_room_cap(group.video_publisher_count())
            } else {
                u64::MAX
            };

            let subscribers = track.subscribers();
            let max_rto = subscribers
                .iter()
                .map(|down| down.rtt() + 4 * down.jitter_jiffies())
                .max()
                .unwrap_or(0);
            let cap = min_over_feedback(
                base,
                subscribers.iter().map(|down| down.max_bitrate(now)),
                min_rate,
            );

            // retransmission serves audio and video alike, so every
            // cache is sized from the worst observed RTO
            if max_rto > 0 {
                let (_, packet_rate) = track.rate.estimate();
                track.cache.resize_cond(cache_packets(packet_rate, max_rto));
            }

            let previous = track.max_bitrate.swap(cap, Ordering::Relaxed);
            if previous != cap {
                let worst_loss = subscribers
                    .iter()
                    .map(|down| down.loss_fraction())
                    .max()
                    .unwrap_or(0);
                tracing::debug!(
                    ssrc = track.ssrc,
                    cap,
                    worst_loss,
                    max_rto,
                    "Publisher cap changed"
                );
            }
            if is_video && track.remb_supported && cap != u64::MAX {
                track.send_remb(cap).await;
            }
        }
    }
}

/// Once a room has three or more video publishers, each one is capped
/// at `2_000_000 / sqrt(n)` so the room's aggregate stays bounded.
fn busy_room_cap(video_publishers: u32) -> u64 {
    if video_publishers < 3 {
        return u64::MAX;
    }
    let cap = (2_000_000f64 / f64::from(video_publishers).sqrt()) as u64;
    cap.max(VIDEO_MIN_RATE)
}

/// Minimum over the fresh subscriber feedback. `u64::MAX` entries mean
/// "no information" and are ignored; any subscriber at or below the
/// floor pins the cap to the floor.
fn min_over_feedback(
    base: u64,
    feedbacks: impl Iterator<Item = u64>,
    min_rate: u64,
) -> u64 {
    let mut cap = base;
    for feedback in feedbacks {
        if feedback == u64::MAX {
            continue;
        }
        if feedback <= min_rate {
            return min_rate;
        }
        cap = cap.min(feedback);
    }
    cap.max(min_rate)
}

/// Packet-cache size from the bandwidth-delay product: enough slots to
/// cover four worst-case RTOs at the current packet rate. The cache
/// itself clamps to its 32..=256 bounds.
fn cache_packets(packet_rate: u32, max_rto: u64) -> usize {
    (u64::from(packet_rate) * max_rto * 4 / JIFFIES_PER_SEC) as usize
}
