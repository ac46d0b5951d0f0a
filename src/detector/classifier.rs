use crate::error::{AppError, Result};
use crate::types::{MonitorFlag, OddsSnapshot, Side};

/// Reject odds that cannot be decimal prices: non-finite or not above 1.0.
pub fn validate_odds(odds: &OddsSnapshot) -> Result<()> {
    let mut prices = vec![("home", odds.home), ("away", odds.away)];
    if let Some(draw) = odds.draw {
        prices.push(("draw", draw));
    }
    for (label, price) in prices {
        if !price.is_finite() || price <= 1.0 {
            return Err(AppError::Data(format!(
                "match {}: {label} odds {price} is not a valid decimal price",
                odds.match_id
            )));
        }
    }
    Ok(())
}

/// Derive the monitor flag for a match from its first odds snapshot.
/// The favorite is the side with strictly lower odds; equal odds produce no favorite.
/// Pure: the same snapshot always yields the same flag.
pub fn classify(odds: &OddsSnapshot, threshold: f64) -> Result<MonitorFlag> {
    validate_odds(odds)?;

    let favorite = if odds.home < odds.away {
        Some((Side::Home, odds.home))
    } else if odds.away < odds.home {
        Some((Side::Away, odds.away))
    } else {
        None
    };

    Ok(match favorite {
        Some((side, price)) => MonitorFlag {
            match_id: odds.match_id,
            favorite: Some(side),
            favorite_odds: Some(price),
            should_monitor: price < threshold,
        },
        None => MonitorFlag {
            match_id: odds.match_id,
            favorite: None,
            favorite_odds: None,
            should_monitor: false,
        },
    })
}
