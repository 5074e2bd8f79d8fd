//! Committee formation for one enrollment window.

use std::collections::BTreeMap;

use crate::amount::Amount;
use crate::config::MAX_DELEGATE_THRESH;
use crate::destination::Destination;
use crate::store::EnrollPos;

/// The committee enrolled for one window. Ballot weight is uniform; the
/// bonded amounts are kept so the round agreement can weigh its
/// participants, and the committed cert payloads back share verification.
#[derive(Clone, Debug, Default)]
pub struct DelegateEnrolled {
    pub weights: BTreeMap<Destination, u64>,
    pub amounts: BTreeMap<Destination, Amount>,
    pub enroll_data: BTreeMap<Destination, Vec<u8>>,
}

impl DelegateEnrolled {
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Rank the eligible delegates by bonded amount, chain position breaking
/// ties, and keep the top `MAX_DELEGATE_THRESH`.
pub fn select_enrolled(
    mut avail: Vec<(Destination, Amount, EnrollPos, Vec<u8>)>,
) -> DelegateEnrolled {
    avail.sort_by(|a, b| (b.1, b.2).cmp(&(a.1, a.2)));
    avail.truncate(MAX_DELEGATE_THRESH);

    let mut enrolled = DelegateEnrolled::default();
    for (dest, amount, _, data) in avail {
        enrolled.weights.insert(dest, 1);
        enrolled.amounts.insert(dest, amount);
        enrolled.enroll_data.insert(dest, data);
    }
    enrolled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ENROLL_MAXIMUM, ENROLL_MINIMUM};

    fn dest(tag: u8) -> Destination {
        Destination::from_bytes([tag; 32])
    }

    fn pos(height: u32, seq: u32) -> EnrollPos {
        EnrollPos { height, seq }
    }

    #[test]
    fn larger_bond_ranks_first() {
        let enrolled = select_enrolled(vec![
            (dest(1), 2 * ENROLL_MINIMUM, pos(5, 1), vec![1]),
            (dest(2), 3 * ENROLL_MINIMUM, pos(6, 1), vec![2]),
        ]);
        assert_eq!(enrolled.weights.len(), 2);
        assert_eq!(enrolled.amounts[&dest(2)], 3 * ENROLL_MINIMUM);
        assert_eq!(enrolled.weights[&dest(1)], 1);
    }

    #[test]
    fn committee_is_capped() {
        let mut avail = Vec::new();
        for i in 0..40u8 {
            avail.push((
                dest(i + 1),
                ENROLL_MINIMUM + i as Amount,
                pos(1, i as u32),
                vec![],
            ));
        }
        let enrolled = select_enrolled(avail);
        assert_eq!(enrolled.weights.len(), MAX_DELEGATE_THRESH);
        // the lowest-bonded candidates were dropped
        assert!(!enrolled.weights.contains_key(&dest(1)));
        assert!(enrolled.weights.contains_key(&dest(40)));
    }

    #[test]
    fn oversized_bond_is_kept_uncapped() {
        let enrolled = select_enrolled(vec![(
            dest(1),
            100 * ENROLL_MAXIMUM,
            pos(1, 1),
            vec![],
        )]);
        // capping happens where the amount is consumed, not here
        assert_eq!(enrolled.amounts[&dest(1)], 100 * ENROLL_MAXIMUM);
        assert_eq!(enrolled.weights[&dest(1)], 1);
    }
}
