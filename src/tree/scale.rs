use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::error::Unavailable;

pub const MIN_TICKS: i64 = 4;
pub const MAX_TICKS: i64 = 12;

/// Ruler spacing in genetic-distance units and its on-screen length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickScale {
    pub unit: Decimal,
    /// CSS pixels covered by one unit at the current zoom level.
    pub pixels_per_unit: f32,
}

impl TickScale {
    /// Distance label for the `k`-th tick from the root.
    pub fn label(&self, k: i64) -> String {
        self.unit
            .checked_mul(Decimal::from(k))
            .map(|value| value.normalize().to_string())
            .unwrap_or_default()
    }
}

/// Pick the largest 1/2/5 × 10^k unit that still shows at least [`MIN_TICKS`]
/// ticks over the visible distance range, floored by `min_scale_unit`.
pub fn compute_tick_scale(
    tree_width_px: f32,
    max_distance: Decimal,
    min_scale_unit: Decimal,
    zoom_level: f32,
) -> Result<TickScale, Unavailable> {
    if max_distance <= Decimal::ZERO {
        return Err(Unavailable::ZeroDistanceRange);
    }
    if !(tree_width_px > 0.0) {
        return Err(Unavailable::ZeroWidthViewport);
    }
    let zoom = if zoom_level.is_finite() && zoom_level > 0.0 {
        zoom_level
    } else {
        1.0
    };
    let zoom_dec = Decimal::from_f32(zoom).unwrap_or(Decimal::ONE);
    let max_f64 = max_distance.to_f64().ok_or(Unavailable::ZeroDistanceRange)?;
    let visible = max_f64 / zoom as f64;
    let top_exponent = visible.log10().floor() as i32;

    let min_ticks = Decimal::from(MIN_TICKS);
    let mut chosen = None;
    'search: for exponent in (top_exponent - 3..=top_exponent).rev() {
        for mantissa in [5, 2, 1] {
            let Some(unit) = nice_unit(mantissa, exponent) else {
                continue;
            };
            let needed = unit
                .checked_mul(zoom_dec)
                .and_then(|value| value.checked_mul(min_ticks));
            if matches!(needed, Some(needed) if max_distance >= needed) {
                chosen = Some(unit);
                break 'search;
            }
        }
    }

    let mut unit = chosen.unwrap_or(max_distance);
    if unit < min_scale_unit {
        unit = min_scale_unit;
    }

    let pixels_per_unit = unit.to_f32().unwrap_or(0.0) * tree_width_px * zoom
        / max_distance.to_f32().unwrap_or(1.0);
    Ok(TickScale {
        unit,
        pixels_per_unit,
    })
}

fn nice_unit(mantissa: i64, exponent: i32) -> Option<Decimal> {
    if exponent >= 0 {
        let factor = 10i64.checked_pow(exponent as u32)?;
        Decimal::from(mantissa).checked_mul(Decimal::from(factor))
    } else {
        Decimal::try_new(mantissa, exponent.unsigned_abs()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn picks_largest_unit_with_enough_ticks() {
        let scale = compute_tick_scale(360.0, dec("3"), Decimal::ZERO, 1.0).unwrap();
        assert_eq!(scale.unit, dec("0.5"));
        assert!((scale.pixels_per_unit - 60.0).abs() < 1e-3);
        assert_eq!(scale.label(3), "1.5");
    }

    #[test]
    fn zooming_in_shrinks_the_unit() {
        let wide = compute_tick_scale(360.0, dec("0.03"), Decimal::ZERO, 1.0).unwrap();
        let zoomed = compute_tick_scale(360.0, dec("0.03"), Decimal::ZERO, 10.0).unwrap();
        assert_eq!(wide.unit, dec("0.005"));
        assert_eq!(zoomed.unit, dec("0.0005"));
        assert!((zoomed.pixels_per_unit - wide.pixels_per_unit).abs() < 1.0);
    }

    #[test]
    fn tick_count_stays_in_range() {
        for distance in ["0.0007", "0.013", "1", "7.5", "42", "999"] {
            for zoom in [0.5_f32, 1.0, 3.0, 17.0] {
                let max = dec(distance);
                let scale = compute_tick_scale(500.0, max, Decimal::ZERO, zoom).unwrap();
                let visible = max.to_f64().unwrap() / zoom as f64;
                let ticks = visible / scale.unit.to_f64().unwrap();
                assert!(
                    ticks >= MIN_TICKS as f64 - 1e-9 && ticks <= MAX_TICKS as f64,
                    "{distance} @ {zoom}: {ticks} ticks of {}",
                    scale.unit
                );
            }
        }
    }

    #[test]
    fn min_scale_unit_floors_the_unit() {
        let scale = compute_tick_scale(360.0, dec("0.001"), dec("0.001"), 8.0).unwrap();
        assert_eq!(scale.unit, dec("0.001"));
    }

    #[test]
    fn degenerate_ranges_are_unavailable() {
        assert_eq!(
            compute_tick_scale(360.0, Decimal::ZERO, Decimal::ZERO, 1.0),
            Err(Unavailable::ZeroDistanceRange)
        );
        assert_eq!(
            compute_tick_scale(0.0, Decimal::ONE, Decimal::ZERO, 1.0),
            Err(Unavailable::ZeroWidthViewport)
        );
    }
}
