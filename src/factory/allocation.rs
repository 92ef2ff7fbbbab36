// =============================================================================
// Share allocation algorithms used when an Instance Factory materializes a
// stock's initial holder ledger across the traders created alongside it.
// =============================================================================

use std::collections::HashMap;

use rand::Rng;

use crate::ids::ObjectId;
use crate::types::RiskProfile;

/// Split `total_shares` evenly across `trader_ids`. The remainder (when
/// `total_shares` does not divide evenly) goes to the first traders in
/// order, one extra share each, so the sum always equals `total_shares`
/// exactly.
pub fn equal_distribution(total_shares: u64, trader_ids: &[ObjectId]) -> HashMap<ObjectId, u64> {
    let mut result = HashMap::new();
    if trader_ids.is_empty() {
        return result;
    }
    let base = total_shares / trader_ids.len() as u64;
    let remainder = total_shares % trader_ids.len() as u64;
    for (i, id) in trader_ids.iter().enumerate() {
        let share = base + if (i as u64) < remainder { 1 } else { 0 };
        result.insert(*id, share);
    }
    result
}

/// Randomly weight allocation toward higher-risk traders: each trader draws
/// `uniform(0,1)^(1/w)` where `w` is their risk profile's allocation weight,
/// then shares are handed out proportionally to those draws. Aggressive
/// traders (`w=3`) skew toward larger draws than conservative ones (`w=1`).
pub fn weighted_random(
    total_shares: u64,
    traders: &[(ObjectId, RiskProfile)],
    rng: &mut impl Rng,
) -> HashMap<ObjectId, u64> {
    let mut result = HashMap::new();
    if traders.is_empty() {
        return result;
    }

    let draws: Vec<(ObjectId, f64)> = traders
        .iter()
        .map(|(id, profile)| {
            let u: f64 = rng.random_range(0.0..1.0_f64).max(f64::EPSILON);
            let draw = u.powf(1.0 / profile.allocation_weight());
            (*id, draw)
        })
        .collect();

    let total_weight: f64 = draws.iter().map(|(_, w)| w).sum();
    distribute_proportionally(total_shares, &draws, total_weight, &mut result);
    result
}

/// Deterministic bipartite-greedy allocation: traders are sorted by risk
/// weight descending, and shares are assigned proportionally to weight, with
/// any rounding remainder going to the highest-weight traders first so the
/// sum always equals `total_shares` exactly.
pub fn risk_based(total_shares: u64, traders: &[(ObjectId, RiskProfile)]) -> HashMap<ObjectId, u64> {
    let mut result = HashMap::new();
    if traders.is_empty() {
        return result;
    }

    let mut sorted = traders.to_vec();
    sorted.sort_by(|a, b| b.1.allocation_weight().partial_cmp(&a.1.allocation_weight()).unwrap());

    let weights: Vec<(ObjectId, f64)> = sorted.iter().map(|(id, p)| (*id, p.allocation_weight())).collect();
    let total_weight: f64 = weights.iter().map(|(_, w)| w).sum();
    distribute_proportionally(total_shares, &weights, total_weight, &mut result);
    result
}

/// Shared rounding logic: allocate `floor(total_shares * weight / total_weight)`
/// to each entry in order, then hand out the leftover shares one at a time,
/// in the given order, until the full `total_shares` is accounted for.
fn distribute_proportionally(
    total_shares: u64,
    weighted: &[(ObjectId, f64)],
    total_weight: f64,
    out: &mut HashMap<ObjectId, u64>,
) {
    if total_weight <= 0.0 {
        return;
    }
    let mut allocated = 0u64;
    for (id, w) in weighted {
        let share = ((total_shares as f64) * w / total_weight).floor() as u64;
        out.insert(*id, share);
        allocated += share;
    }
    let mut remainder = total_shares.saturating_sub(allocated);
    let mut i = 0;
    while remainder > 0 && !weighted.is_empty() {
        let id = weighted[i % weighted.len()].0;
        *out.get_mut(&id).unwrap() += 1;
        remainder -= 1;
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn equal_distribution_sums_to_total() {
        let ids = vec![ObjectId(1), ObjectId(2), ObjectId(3)];
        let alloc = equal_distribution(100, &ids);
        assert_eq!(alloc.values().sum::<u64>(), 100);
    }

    #[test]
    fn equal_distribution_handles_remainder() {
        let ids = vec![ObjectId(1), ObjectId(2), ObjectId(3)];
        let alloc = equal_distribution(10, &ids);
        assert_eq!(alloc.values().sum::<u64>(), 10);
        let mut values: Vec<u64> = alloc.values().copied().collect();
        values.sort_unstable();
        assert_eq!(values, vec![3, 3, 4]);
    }

    #[test]
    fn equal_distribution_empty_traders_is_empty() {
        let alloc = equal_distribution(100, &[]);
        assert!(alloc.is_empty());
    }

    #[test]
    fn weighted_random_sums_to_total_regardless_of_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        let traders = vec![
            (ObjectId(1), RiskProfile::Conservative),
            (ObjectId(2), RiskProfile::Moderate),
            (ObjectId(3), RiskProfile::Aggressive),
        ];
        let alloc = weighted_random(1000, &traders, &mut rng);
        assert_eq!(alloc.values().sum::<u64>(), 1000);
    }

    #[test]
    fn risk_based_sums_to_total() {
        let traders = vec![
            (ObjectId(1), RiskProfile::Conservative),
            (ObjectId(2), RiskProfile::Moderate),
            (ObjectId(3), RiskProfile::Aggressive),
        ];
        let alloc = risk_based(999, &traders);
        assert_eq!(alloc.values().sum::<u64>(), 999);
    }

    #[test]
    fn risk_based_favors_higher_risk_profiles() {
        let traders = vec![(ObjectId(1), RiskProfile::Conservative), (ObjectId(2), RiskProfile::Aggressive)];
        let alloc = risk_based(1000, &traders);
        assert!(alloc[&ObjectId(2)] > alloc[&ObjectId(1)]);
    }
}
