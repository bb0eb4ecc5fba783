use rust_decimal::Decimal;

use crate::models::{CloseReason, Side};

/// Outcome of comparing one price against a position's hidden levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachResult {
    None,
    Stop { level: Decimal },
    Target { level: Decimal },
}

impl BreachResult {
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            BreachResult::None => None,
            BreachResult::Stop { .. } => Some(CloseReason::StopLoss),
            BreachResult::Target { .. } => Some(CloseReason::TakeProfit),
        }
    }

    pub fn is_breach(&self) -> bool {
        !matches!(self, BreachResult::None)
    }
}

/// Side-aware breach check. `tolerance` widens both levels toward the current
/// price; when stop and target both fire, stop wins.
///
/// `entry` does not affect the result; it is accepted so call sites read the
/// same as the position they come from.
pub fn detect(
    side: Side,
    _entry: Decimal,
    stop: Decimal,
    target: Decimal,
    current_price: Decimal,
    tolerance: Decimal,
) -> BreachResult {
    let (stop_hit, target_hit) = match side {
        Side::Long => (
            current_price <= stop + tolerance,
            current_price >= target - tolerance,
        ),
        Side::Short => (
            current_price >= stop - tolerance,
            current_price <= target + tolerance,
        ),
    };

    if stop_hit {
        BreachResult::Stop { level: stop }
    } else if target_hit {
        BreachResult::Target { level: target }
    } else {
        BreachResult::None
    }
}
