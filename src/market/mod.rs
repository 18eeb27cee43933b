//! Market Resolver: maps (preset, window, side) to the tradable outcome
//! token for that window, tolerating markets that list late.

use std::time::Duration;

use crate::api::gamma::MarketFeed;
use crate::models::OutcomeSide;
use crate::presets::{MonitorPreset, Window};

/// Outcome of a resolution attempt. `Unresolved` is not an error: callers
/// defer entry and try again on a later tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved {
        token_id: String,
        price: Option<f64>,
        slug: String,
    },
    Unresolved,
}

/// Candidate market slugs for a window. Hourly series occasionally list
/// under a quarter-hour-shifted epoch, so those offsets are probed too.
pub fn slug_candidates(preset: &MonitorPreset, window: &Window) -> Vec<String> {
    let base_epoch = window.start.timestamp();
    let offsets: &[i64] = if preset.timeframe_label == "1h" {
        &[0, -900, 900, -1800, 1800, -2700, 2700]
    } else {
        &[0]
    };

    let mut candidates = Vec::new();
    for offset in offsets {
        let slug = format!("{}-{}", preset.market_slug_prefix, base_epoch + offset);
        if !candidates.contains(&slug) {
            candidates.push(slug);
        }
    }
    candidates
}

/// Poll the feed for the window's market until it lists or the wait
/// budget runs out.
pub async fn resolve_entry_token(
    feed: &dyn MarketFeed,
    preset: &MonitorPreset,
    window: &Window,
    side: OutcomeSide,
    wait: Duration,
    poll: Duration,
) -> Resolution {
    let candidates = slug_candidates(preset, window);
    let deadline = tokio::time::Instant::now() + wait;

    loop {
        for slug in &candidates {
            let snapshot = match feed.market_snapshot(slug).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!("snapshot fetch failed for {}: {}", slug, e);
                    continue;
                }
            };

            let (token_id, price) = match side {
                OutcomeSide::Up => (snapshot.up_token_id, snapshot.up_price),
                OutcomeSide::Down => (snapshot.down_token_id, snapshot.down_price),
            };
            if let Some(token_id) = token_id.filter(|t| !t.is_empty()) {
                return Resolution::Resolved {
                    token_id,
                    price,
                    slug: slug.clone(),
                };
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Resolution::Unresolved;
        }
        tokio::time::sleep(poll).await;
    }
}
