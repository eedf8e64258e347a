#![forbid(unsafe_code)]

// Adaptive bitrate control from sampled transport stats

use crate::config::BitratePolicy;
use crate::error::CoreError;
use crate::media::TransportStats;
use crate::metrics::ServerMetrics;
use crate::peer::{ConnectionStatus, PeerManager};
use crate::room::RoomRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Packet loss above this fraction degrades quality.
const LOSS_DEGRADE: f64 = 0.05;
/// Round-trip time above this degrades quality, seconds.
const RTT_DEGRADE: f64 = 0.3;
/// Loss below this fraction allows recovery when latency agrees.
const LOSS_RECOVER: f64 = 0.01;
/// Round-trip time below this allows recovery, seconds.
const RTT_RECOVER: f64 = 0.1;
/// Multiplier for one degrade step.
const DEGRADE_FACTOR: f64 = 0.8;
/// Multiplier for one recovery step.
const RECOVER_FACTOR: f64 = 1.1;
/// Relative change below this is not worth renegotiating.
const MIN_CHANGE_RATIO: f64 = 0.10;

/// What one stats sample says a connection's bitrate should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitrateStep {
    Hold,
    Degrade,
    Recover,
}

fn loss_rate(stats: &TransportStats) -> f64 {
    stats.packets_lost as f64 / stats.packets_sent.max(1) as f64
}

/// Classifies one sample. Degrade wins over recover when both thresholds
/// somehow trip at once.
pub fn classify(stats: &TransportStats) -> BitrateStep {
    let loss = loss_rate(stats);
    let rtt = stats.round_trip_time_seconds;
    if loss > LOSS_DEGRADE || rtt > RTT_DEGRADE {
        BitrateStep::Degrade
    } else if loss < LOSS_RECOVER && rtt < RTT_RECOVER {
        BitrateStep::Recover
    } else {
        BitrateStep::Hold
    }
}

/// The next target for a connection currently at `current_bps`, or `None`
/// when the sample does not justify a commit. The result is clamped to the
/// policy envelope; a change smaller than a tenth of the current target is
/// suppressed so the encoder is not churned for noise.
pub fn evaluate(
    current_bps: u64,
    stats: &TransportStats,
    policy: &BitratePolicy,
) -> Option<u64> {
    let factor = match classify(stats) {
        BitrateStep::Hold => return None,
        BitrateStep::Degrade => DEGRADE_FACTOR,
        BitrateStep::Recover => RECOVER_FACTOR,
    };
    let proposed = (current_bps as f64 * factor).round() as u64;
    let clamped = proposed.clamp(policy.min_bitrate, policy.max_bitrate);
    let ratio = clamped.abs_diff(current_bps) as f64 / current_bps.max(1) as f64;
    if ratio >= MIN_CHANGE_RATIO {
        Some(clamped)
    } else {
        None
    }
}

struct LinkState {
    target: u64,
    /// The room profile bitrate this link adapted from. A profile switch
    /// resets the link to the new baseline.
    seeded_from: u64,
    last_adjustment: Option<Instant>,
}

impl LinkState {
    fn seeded(bitrate_bps: u64) -> Self {
        Self {
            target: bitrate_bps,
            seeded_from: bitrate_bps,
            last_adjustment: None,
        }
    }
}

/// Periodically samples every connected transport and nudges its target
/// bitrate inside the policy envelope. One controller covers all rooms.
pub struct BitrateController {
    peers: Arc<PeerManager>,
    rooms: Arc<RoomRegistry>,
    policy: BitratePolicy,
    metrics: ServerMetrics,
    links: HashMap<String, LinkState>,
}

impl BitrateController {
    pub fn new(
        peers: Arc<PeerManager>,
        rooms: Arc<RoomRegistry>,
        policy: BitratePolicy,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            peers,
            rooms,
            policy,
            metrics,
            links: HashMap::new(),
        }
    }

    /// Sampling loop. Runs until the task is dropped.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.policy.sample_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One sampling pass over every tracked connection.
    pub async fn tick(&mut self) {
        let epoch = self.peers.epoch();
        let snapshots = self.peers.snapshots().await;

        self.links.retain(|id, _| snapshots.iter().any(|c| &c.id == id));

        for conn in snapshots {
            if conn.status != ConnectionStatus::Connected {
                continue;
            }
            let Some(room) = self.rooms.lookup(&conn.room_code) else {
                continue;
            };
            let seed = room
                .quality_profile
                .bitrate_bps
                .clamp(self.policy.min_bitrate, self.policy.max_bitrate);

            let stats = match self.peers.transport_stats(&conn.id).await {
                Ok(stats) => stats,
                // The connection raced away between snapshot and sample
                Err(_) => continue,
            };

            let (current, ready) = {
                let link = self
                    .links
                    .entry(conn.id.clone())
                    .or_insert_with(|| LinkState::seeded(seed));
                if link.seeded_from != seed {
                    debug!("Re-seeding bitrate for {} at {} bps", conn.id, seed);
                    *link = LinkState::seeded(seed);
                }
                let ready = match link.last_adjustment {
                    Some(at) => at.elapsed() >= self.policy.cooldown,
                    None => true,
                };
                (link.target, ready)
            };
            if !ready {
                continue;
            }

            let Some(next) = evaluate(current, &stats, &self.policy) else {
                continue;
            };
            if self.peers.epoch() != epoch {
                // Room torn down mid-pass; nothing left worth touching
                return;
            }

            match self.peers.set_target_bitrate(&conn.id, next).await {
                Ok(()) => {
                    if let Some(link) = self.links.get_mut(&conn.id) {
                        link.target = next;
                        link.last_adjustment = Some(Instant::now());
                    }
                    self.metrics.inc_bitrate_adjustments();
                    info!(
                        "Adjusted bitrate for {}: {} -> {} bps (loss {:.3}, rtt {:.0} ms)",
                        conn.id,
                        current,
                        next,
                        loss_rate(&stats),
                        stats.round_trip_time_seconds * 1000.0
                    );

                    let latency_ms = (stats.round_trip_time_seconds * 1000.0).round() as u64;
                    if let Err(e) = self
                        .peers
                        .note_link_quality(&conn.id, Some(latency_ms), Some(next))
                        .await
                    {
                        debug!("Could not record link quality for {}: {}", conn.id, e);
                    }
                }
                Err(CoreError::ConnectionNotFound(_)) => {
                    self.links.remove(&conn.id);
                }
                Err(e) => warn!("Bitrate adjustment for {} failed: {}", conn.id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IceConfig, ReconnectPolicy};
    use crate::media::loopback::LoopbackPeer;
    use crate::media::{LoopbackEngine, MediaEngine, TransportState};
    use crate::peer::PeerNotice;
    use crate::room::{QualityProfile, QualityTier};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn stats(packets_sent: u64, packets_lost: u64, rtt: f64) -> TransportStats {
        TransportStats {
            bytes_sent: 0,
            packets_sent,
            packets_lost,
            round_trip_time_seconds: rtt,
            fps: 30.0,
        }
    }

    #[test]
    fn classification_follows_loss_and_rtt() {
        assert_eq!(classify(&stats(1000, 60, 0.05)), BitrateStep::Degrade);
        assert_eq!(classify(&stats(1000, 0, 0.4)), BitrateStep::Degrade);
        assert_eq!(classify(&stats(1000, 5, 0.05)), BitrateStep::Recover);
        // Mid-band on either axis holds
        assert_eq!(classify(&stats(1000, 20, 0.05)), BitrateStep::Hold);
        assert_eq!(classify(&stats(1000, 5, 0.15)), BitrateStep::Hold);
        // Nothing sent yet counts as lossless
        assert_eq!(classify(&stats(0, 0, 0.01)), BitrateStep::Recover);
    }

    #[test]
    fn evaluation_scales_and_clamps() {
        let policy = BitratePolicy::default();
        assert_eq!(
            evaluate(2_000_000, &stats(1000, 60, 0.05), &policy),
            Some(1_600_000)
        );
        assert_eq!(
            evaluate(2_000_000, &stats(1000, 0, 0.01), &policy),
            Some(2_200_000)
        );
        assert_eq!(evaluate(2_000_000, &stats(1000, 20, 0.05), &policy), None);
        // Floor and ceiling hold once reached
        assert_eq!(evaluate(250_000, &stats(1000, 200, 0.5), &policy), None);
        assert_eq!(evaluate(8_000_000, &stats(1000, 0, 0.01), &policy), None);
        // Clamping can shrink a step below the commit threshold
        assert_eq!(evaluate(7_900_000, &stats(1000, 0, 0.01), &policy), None);
    }

    struct Rig {
        engine: Arc<LoopbackEngine>,
        peers: Arc<PeerManager>,
        rooms: Arc<RoomRegistry>,
        code: String,
        _notices: mpsc::UnboundedReceiver<PeerNotice>,
    }

    async fn rig(policy: BitratePolicy) -> (Rig, BitrateController) {
        let engine = Arc::new(LoopbackEngine::new());
        let (tx, notices) = mpsc::unbounded_channel();
        let peers = Arc::new(PeerManager::new(
            engine.clone() as Arc<dyn MediaEngine>,
            IceConfig::default(),
            ReconnectPolicy {
                max_attempts: 2,
                backoff: Duration::from_secs(5),
            },
            None,
            tx,
            ServerMetrics::new(),
        ));
        let rooms = Arc::new(RoomRegistry::new());
        let room = rooms
            .create_room(
                "host",
                QualityProfile::preset(QualityTier::Medium),
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                8420,
            )
            .unwrap();
        let controller = BitrateController::new(
            peers.clone(),
            rooms.clone(),
            policy,
            ServerMetrics::new(),
        );
        let rig = Rig {
            engine,
            peers,
            rooms,
            code: room.code,
            _notices: notices,
        };
        (rig, controller)
    }

    async fn connected_peer(rig: &Rig, viewer: &str) -> (String, Arc<LoopbackPeer>) {
        let conn = rig
            .peers
            .create_connection(viewer, &rig.code, None, None)
            .await
            .unwrap();
        let peer = rig.engine.last_peer().unwrap();
        peer.emit_state(TransportState::Connected);
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let snap = rig.peers.snapshot(&conn.id).await.unwrap();
                if snap.status == ConnectionStatus::Connected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("transport never reached connected");
        (conn.id, peer)
    }

    #[tokio::test]
    async fn congestion_lowers_the_target() {
        let (rig, mut controller) = rig(BitratePolicy::default()).await;
        let (id, peer) = connected_peer(&rig, "alpha").await;

        peer.set_stats(stats(1000, 100, 0.05));
        controller.tick().await;

        assert_eq!(peer.target_bitrate(), 1_600_000);
        let snap = rig.peers.snapshot(&id).await.unwrap();
        assert_eq!(snap.bandwidth_bps, Some(1_600_000));
        assert_eq!(snap.latency_ms, Some(50));
    }

    #[tokio::test]
    async fn cooldown_spaces_adjustments() {
        let (rig, mut controller) = rig(BitratePolicy::default()).await;
        let (_id, peer) = connected_peer(&rig, "alpha").await;

        peer.set_stats(stats(1000, 100, 0.05));
        controller.tick().await;
        assert_eq!(peer.target_bitrate(), 1_600_000);

        // Still congested, but inside the cooldown window
        controller.tick().await;
        assert_eq!(peer.target_bitrate(), 1_600_000);
    }

    #[tokio::test]
    async fn repeated_congestion_settles_above_the_floor() {
        let policy = BitratePolicy {
            cooldown: Duration::ZERO,
            ..BitratePolicy::default()
        };
        let min = policy.min_bitrate;
        let (rig, mut controller) = rig(policy).await;
        let (_id, peer) = connected_peer(&rig, "alpha").await;

        peer.set_stats(stats(1000, 100, 0.05));
        for _ in 0..20 {
            controller.tick().await;
        }

        let settled = peer.target_bitrate();
        assert!(settled >= min);
        assert!(settled < 300_000, "settled at {settled}");
        controller.tick().await;
        assert_eq!(peer.target_bitrate(), settled);
    }

    #[tokio::test]
    async fn profile_change_reseeds_the_baseline() {
        let policy = BitratePolicy {
            cooldown: Duration::ZERO,
            ..BitratePolicy::default()
        };
        let (rig, mut controller) = rig(policy).await;
        let (_id, peer) = connected_peer(&rig, "alpha").await;

        peer.set_stats(stats(1000, 100, 0.05));
        controller.tick().await;
        assert_eq!(peer.target_bitrate(), 1_600_000);

        rig.rooms
            .update_profile(&rig.code, QualityProfile::preset(QualityTier::High))
            .unwrap();
        peer.set_stats(stats(1000, 0, 0.01));
        controller.tick().await;

        // Adapted from the fresh 4 Mbps baseline, not the degraded target
        assert_eq!(peer.target_bitrate(), 4_400_000);
    }

    #[tokio::test]
    async fn only_live_transports_are_sampled() {
        let (rig, mut controller) = rig(BitratePolicy::default()).await;
        rig.peers
            .create_connection("alpha", &rig.code, None, None)
            .await
            .unwrap();
        let peer = rig.engine.last_peer().unwrap();

        peer.set_stats(stats(1000, 100, 0.05));
        controller.tick().await; // still connecting

        assert_eq!(peer.target_bitrate(), 0);
    }

    #[tokio::test]
    async fn vanished_connections_are_forgotten() {
        let (rig, mut controller) = rig(BitratePolicy::default()).await;
        let (id, peer) = connected_peer(&rig, "alpha").await;

        peer.set_stats(stats(1000, 100, 0.05));
        controller.tick().await;
        assert_eq!(controller.links.len(), 1);

        rig.peers.remove_connection(&id).await.unwrap();
        controller.tick().await;
        assert!(controller.links.is_empty());
    }
}
