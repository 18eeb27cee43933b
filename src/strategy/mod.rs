//! Entry signal: a run of consecutive same-direction windows.
//!
//! The streak is computed only from contiguous, officially-priced closed
//! windows immediately preceding the current one. A missing or estimated
//! window breaks the run rather than guessing across it.

use serde::{Deserialize, Serialize};

use crate::models::{Direction, OutcomeSide, WindowCandle};
use crate::presets::Window;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Streak {
    pub direction: Direction,
    pub length: u32,
}

/// Walk closed candles backwards from the current window. `candles` must
/// be ordered most-recent-first, as the store returns them.
pub fn current_streak(
    candles: &[WindowCandle],
    current_window: &Window,
    window_seconds: i64,
) -> Option<Streak> {
    let mut expected_epoch = current_window.start.timestamp() - window_seconds;
    let mut streak: Option<Streak> = None;

    for candle in candles {
        if candle.window_start.timestamp() != expected_epoch {
            break;
        }
        if !candle.is_official() {
            break;
        }
        let direction = match candle.direction.or_else(|| {
            Direction::from_values(candle.open, candle.close, candle.delta)
        }) {
            Some(direction) => direction,
            None => break,
        };

        match streak {
            None => {
                streak = Some(Streak {
                    direction,
                    length: 1,
                })
            }
            Some(ref mut s) if s.direction == direction => s.length += 1,
            Some(_) => break,
        }
        expected_epoch -= window_seconds;
    }

    streak
}

/// A streak of `trigger` or more windows fires an entry on the opposite
/// side; runs past `max` are left alone.
pub fn entry_signal(streak: Option<Streak>, trigger: u32, max: u32) -> Option<OutcomeSide> {
    let streak = streak?;
    if streak.length < trigger || streak.length > max {
        return None;
    }
    Some(match streak.direction {
        Direction::Up => OutcomeSide::Down,
        Direction::Down => OutcomeSide::Up,
    })
}
