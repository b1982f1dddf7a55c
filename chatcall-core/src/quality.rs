//! Call quality monitoring
//!
//! Samples inbound RTP counters on a fixed period and classifies packet
//! loss. The classification is advisory and never ends a call.

use crate::media::TrackKind;
use crate::peer::{PeerError, PeerSession};
use crate::types::QualityClass;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Loss ratio above which quality is poor
pub const POOR_LOSS_RATIO: f64 = 0.10;

/// Loss ratio above which quality is fair
pub const FAIR_LOSS_RATIO: f64 = 0.05;

/// Counters for one inbound media stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRtpSample {
    /// Audio or video
    pub kind: Option<TrackKind>,
    /// Packets received so far
    pub packets_received: u64,
    /// Packets lost so far
    pub packets_lost: u64,
}

/// Inbound counters for a whole connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// One entry per inbound stream
    pub inbound: Vec<InboundRtpSample>,
}

impl TransportStats {
    /// Sum of received packets across inbound streams
    pub fn packets_received(&self) -> u64 {
        self.inbound.iter().map(|s| s.packets_received).sum()
    }

    /// Sum of lost packets across inbound streams
    pub fn packets_lost(&self) -> u64 {
        self.inbound.iter().map(|s| s.packets_lost).sum()
    }

    /// lost / (lost + received), zero when nothing has arrived
    pub fn loss_ratio(&self) -> f64 {
        let lost = self.packets_lost();
        let total = lost + self.packets_received();
        if total == 0 {
            0.0
        } else {
            lost as f64 / total as f64
        }
    }
}

/// Classify a loss ratio
pub fn classify(loss_ratio: f64) -> QualityClass {
    if loss_ratio > POOR_LOSS_RATIO {
        QualityClass::Poor
    } else if loss_ratio > FAIR_LOSS_RATIO {
        QualityClass::Fair
    } else {
        QualityClass::Good
    }
}

/// Anything that can report inbound transport counters
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Current counters
    async fn transport_stats(&self) -> Result<TransportStats, PeerError>;
}

#[async_trait]
impl StatsSource for PeerSession {
    async fn transport_stats(&self) -> Result<TransportStats, PeerError> {
        self.stats().await
    }
}

/// One classified sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySample {
    /// Class derived from the ratio
    pub class: QualityClass,
    /// Inbound loss ratio
    pub loss_ratio: f64,
}

/// Background sampler, stopped when dropped
#[derive(Debug)]
pub struct QualityMonitor {
    handle: JoinHandle<()>,
}

impl QualityMonitor {
    /// Start sampling `source` every `period`.
    ///
    /// The first sample is taken one period after start. A failed sample is
    /// skipped; missed ticks are not replayed.
    pub fn spawn<F>(source: Arc<dyn StatsSource>, period: Duration, on_sample: F) -> Self
    where
        F: Fn(QualitySample) + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match source.transport_stats().await {
                    Ok(stats) => {
                        let loss_ratio = stats.loss_ratio();
                        on_sample(QualitySample {
                            class: classify(loss_ratio),
                            loss_ratio,
                        });
                    }
                    Err(e) => tracing::debug!(error = %e, "quality sample skipped"),
                }
            }
        });
        Self { handle }
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
