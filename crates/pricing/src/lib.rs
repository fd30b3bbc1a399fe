//! Pricing engine for porter service bookings.
//!
//! Pure and deterministic: price is a function of weight, bag count and
//! the trolley flag, floored at the minimum fare. All amounts are integer
//! currency units so there is no floating-point drift anywhere in the
//! money path.

/// Charge per kilogram of luggage.
pub const RATE_PER_KG: i64 = 5;
/// Charge per bag.
pub const RATE_PER_BAG: i64 = 10;
/// Flat fee when a trolley is requested.
pub const TROLLEY_FLAT_FEE: i64 = 200;
/// No booking is ever cheaper than this.
pub const MINIMUM_FARE: i64 = 100;

/// Computes the booking price.
///
/// Input bounds (1..=100 kg, 1..=10 bags) are enforced by the caller's
/// validation; the engine itself only clamps the floor.
pub fn price(weight_kg: i64, bag_count: i64, trolley_required: bool) -> i64 {
    let trolley_charge = if trolley_required { TROLLEY_FLAT_FEE } else { 0 };
    let total = weight_kg * RATE_PER_KG + bag_count * RATE_PER_BAG + trolley_charge;
    total.max(MINIMUM_FARE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_fare_floor_applies() {
        // 10 kg * 5 + 2 bags * 10 = 70, floored to 100.
        assert_eq!(price(10, 2, false), 100);
    }

    #[test]
    fn test_trolley_fee_added() {
        // 30 * 5 + 5 * 10 + 200 = 400.
        assert_eq!(price(30, 5, true), 400);
    }

    #[test]
    fn test_floor_not_binding_above_minimum() {
        // 20 * 5 + 2 * 10 + 200 = 320.
        assert_eq!(price(20, 2, true), 320);
    }

    #[test]
    fn test_never_below_minimum_fare_within_bounds() {
        for weight in 1..=100 {
            for bags in 1..=10 {
                for trolley in [false, true] {
                    assert!(price(weight, bags, trolley) >= MINIMUM_FARE);
                }
            }
        }
    }

    #[test]
    fn test_price_is_deterministic() {
        assert_eq!(price(55, 7, true), price(55, 7, true));
    }
}
