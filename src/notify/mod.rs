//! Lifecycle event boundary. The core emits exactly one event per
//! terminal outcome; how (or whether) events are rendered and delivered
//! is the messaging layer's business.

use async_trait::async_trait;

use crate::models::{ExitReason, OutcomeSide, TradeOutcome};

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    EntryFilled {
        preset_slug: String,
        market_slug: String,
        side: OutcomeSide,
        price: f64,
        size: f64,
    },
    EntryFailed {
        preset_slug: String,
        market_slug: String,
        reason: String,
    },
    EntrySkipped {
        preset_slug: String,
        reason: String,
    },
    ExitFilled {
        preset_slug: String,
        market_slug: String,
        price: f64,
        size: f64,
        reason: ExitReason,
        outcome: TradeOutcome,
        pnl: f64,
    },
    ExitFailed {
        preset_slug: String,
        market_slug: String,
        reason: String,
    },
    IntegrityIssue {
        preset_slug: String,
        detail: String,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: LifecycleEvent);
}

/// Default delivery: structured logs
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::EntryFilled {
                preset_slug,
                market_slug,
                side,
                price,
                size,
            } => tracing::info!(
                preset = %preset_slug,
                market = %market_slug,
                "📈 entered {:?} {:.4} @ {:.3}",
                side,
                size,
                price
            ),
            LifecycleEvent::EntryFailed {
                preset_slug,
                market_slug,
                reason,
            } => tracing::error!(
                preset = %preset_slug,
                market = %market_slug,
                "✗ entry failed: {}",
                reason
            ),
            LifecycleEvent::EntrySkipped {
                preset_slug,
                reason,
            } => tracing::info!(preset = %preset_slug, "entry skipped: {}", reason),
            LifecycleEvent::ExitFilled {
                preset_slug,
                market_slug,
                price,
                size,
                reason,
                outcome,
                pnl,
            } => tracing::info!(
                preset = %preset_slug,
                market = %market_slug,
                "📉 exited {:.4} @ {:.3} ({:?}, {:?}, P&L ${:.2})",
                size,
                price,
                reason,
                outcome,
                pnl
            ),
            LifecycleEvent::ExitFailed {
                preset_slug,
                market_slug,
                reason,
            } => tracing::error!(
                preset = %preset_slug,
                market = %market_slug,
                "✗ exit failed: {}",
                reason
            ),
            LifecycleEvent::IntegrityIssue {
                preset_slug,
                detail,
            } => tracing::warn!(preset = %preset_slug, "history integrity: {}", detail),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Captures events for assertions
    pub struct RecordingNotifier {
        pub events: Mutex<Vec<LifecycleEvent>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        pub fn events(&self) -> Vec<LifecycleEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: LifecycleEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
