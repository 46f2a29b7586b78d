pub mod down;
pub mod up;

use std::sync::atomic::{AtomicU64, Ordering};

use palaver_media::rtptime::JIFFIES_PER_SEC;
use palaver_protocol::{IceConfig, IceServerInfo, RtcConfiguration};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub use down::{DownConnection, DownTrack};
pub use up::{UpConnection, UpTrack};

/// Minimum interval between keyframe requests (PLI or FIR) toward a
/// publisher: 200 ms, in jiffies.
pub const KEYFRAME_INTERVAL: u64 = JIFFIES_PER_SEC / 5;

/// Subscriber feedback older than this is treated as "no information".
pub const BITRATE_TTL: u64 = 8 * JIFFIES_PER_SEC;

/// A bitrate reading with a timestamp, so stale values can be ignored.
/// Written by the RTCP listeners, read by the allocator.
pub struct BitrateSlot {
    bitrate: AtomicU64,
    time: AtomicU64,
}

impl BitrateSlot {
    pub fn new() -> Self {
        BitrateSlot {
            bitrate: AtomicU64::new(0),
            time: AtomicU64::new(0),
        }
    }

    pub fn set(&self, bitrate: u64, now: u64) {
        self.bitrate.store(bitrate, Ordering::Relaxed);
        self.time.store(now, Ordering::Release);
    }

    /// The stored bitrate, unless it has gone stale.
    pub fn get(&self, now: u64) -> Option<u64> {
        let time = self.time.load(Ordering::Acquire);
        if time == 0 || now.saturating_sub(time) > BITRATE_TTL {
            return None;
        }
        Some(self.bitrate.load(Ordering::Relaxed))
    }

    /// The stored value regardless of age (for the multiplicative
    /// loss-driven update, which always evolves from the last value).
    pub fn get_raw(&self) -> Option<u64> {
        if self.time.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(self.bitrate.load(Ordering::Relaxed))
    }
}

impl Default for BitrateSlot {
    fn default() -> Self {
        Self::new()
    }
}

fn ice_servers(ice: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !ice.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.stun_urls.clone(),
            ..Default::default()
        });
    }
    if !ice.turn_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone().unwrap_or_default(),
            credential: ice.turn_credential.clone().unwrap_or_default(),
        });
    }
    servers
}

/// The ICE configuration used for the server's own peer connections.
pub fn rtc_configuration(ice: &IceConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(ice),
        ..Default::default()
    }
}

/// The ICE configuration suggested to clients in `joined`.
pub fn client_rtc_configuration(ice: &IceConfig) -> RtcConfiguration {
    let mut servers = Vec::new();
    if !ice.stun_urls.is_empty() {
        servers.push(IceServerInfo {
            urls: ice.stun_urls.clone(),
            username: None,
            credential: None,
        });
    }
    if !ice.turn_urls.is_empty() {
        servers.push(IceServerInfo {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone(),
            credential: ice.turn_credential.clone(),
        });
    }
    RtcConfiguration {
        ice_servers: servers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_slot_staleness() {
        let slot = BitrateSlot::new();
        assert_eq!(slot.get(1000), None);
        slot.set(800_000, 1000);
        assert_eq!(slot.get(1000), Some(800_000));
        assert_eq!(slot.get(1000 + BITRATE_TTL), Some(800_000));
        assert_eq!(slot.get(1001 + BITRATE_TTL), None);
        assert_eq!(slot.get_raw(), Some(800_000));
    }

    #[test]
    fn client_ice_servers_carry_turn_credentials() {
        let ice = IceConfig {
            stun_urls: vec!["stun:stun.example.org".into()],
            turn_urls: vec!["turn:turn.example.org".into()],
            turn_username: Some("user".into()),
            turn_credential: Some("pass".into()),
        };
        let config = client_rtc_configuration(&ice);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].username.as_deref(), Some("user"));
    }
}
