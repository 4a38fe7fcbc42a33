//! Primary partition determination
//!
//! Applied every time a group loses members. The surviving side of a split
//! keeps primary status if it holds the majority of the original members; on
//! a tie the side whose first member appears earlier in the original member
//! order wins. Primary status is never regained once lost.

use std::collections::BTreeSet;

use crate::node::{Node, NodeId};

/// Decide whether a group remains in the primary partition.
///
/// `members` is the original ordered member list, `failed` and `left` the
/// members now failed or gracefully departed.
pub fn is_primary_partition(
    was_primary: bool,
    members: &[Node],
    failed: &BTreeSet<NodeId>,
    left: &BTreeSet<NodeId>,
) -> bool {
    if !was_primary {
        return false;
    }

    let healthy: Vec<usize> = members
        .iter()
        .enumerate()
        .filter(|(_, m)| !failed.contains(&m.id()) && !left.contains(&m.id()))
        .map(|(index, _)| index)
        .collect();
    let partitioned: Vec<usize> = members
        .iter()
        .enumerate()
        .filter(|(_, m)| failed.contains(&m.id()) && !left.contains(&m.id()))
        .map(|(index, _)| index)
        .collect();

    match healthy.len().cmp(&partitioned.len()) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => match (healthy.first(), partitioned.first()) {
            (Some(healthy_first), Some(partitioned_first)) => healthy_first < partitioned_first,
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CORE_DOMAIN;
    use proptest::prelude::*;

    fn nodes(count: u128) -> Vec<Node> {
        (1..=count)
            .map(|id| Node::new(NodeId::from_u128(id), format!("n{id}"), format!("n{id}:1"), CORE_DOMAIN))
            .collect()
    }

    fn ids(values: &[u128]) -> BTreeSet<NodeId> {
        values.iter().copied().map(NodeId::from_u128).collect()
    }

    #[test]
    fn test_majority_stays_primary() {
        let members = nodes(3);
        assert!(is_primary_partition(true, &members, &ids(&[3]), &ids(&[])));
    }

    #[test]
    fn test_minority_loses_primary() {
        let members = nodes(3);
        assert!(!is_primary_partition(true, &members, &ids(&[2, 3]), &ids(&[])));
    }

    #[test]
    fn test_tie_broken_by_original_order() {
        let members = nodes(4);

        // {A,B} sees {C,D} failed
        assert!(is_primary_partition(true, &members, &ids(&[3, 4]), &ids(&[])));
        // {C,D} sees {A,B} failed
        assert!(!is_primary_partition(true, &members, &ids(&[1, 2]), &ids(&[])));
    }

    #[test]
    fn test_left_members_do_not_count_as_partitioned() {
        let members = nodes(4);

        // two left gracefully, one failed: healthy {A} vs partitioned {D}
        assert!(is_primary_partition(true, &members, &ids(&[4]), &ids(&[2, 3])));
        // failed and left at once counts as left
        assert!(is_primary_partition(true, &members, &ids(&[2, 3]), &ids(&[2, 3])));
    }

    #[test]
    fn test_empty_sides_are_not_primary() {
        let members = nodes(2);
        assert!(!is_primary_partition(true, &members, &ids(&[]), &ids(&[1, 2])));
        assert!(!is_primary_partition(true, &[], &ids(&[]), &ids(&[])));
    }

    #[test]
    fn test_never_regains_primary() {
        let members = nodes(5);
        assert!(!is_primary_partition(false, &members, &ids(&[]), &ids(&[])));
        assert!(!is_primary_partition(false, &members, &ids(&[5]), &ids(&[])));
    }

    proptest! {
        #[test]
        fn prop_complementary_partitions_have_exactly_one_primary(
            count in 1u128..12,
            mask in any::<u16>(),
        ) {
            let members = nodes(count);
            let side_a: Vec<&Node> = members
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1u16 << i) != 0)
                .map(|(_, n)| n)
                .collect();
            let side_b: Vec<&Node> = members
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1u16 << i) == 0)
                .map(|(_, n)| n)
                .collect();

            prop_assume!(!side_a.is_empty() && !side_b.is_empty());

            let failed_for_a: BTreeSet<NodeId> = side_b.iter().map(|n| n.id()).collect();
            let failed_for_b: BTreeSet<NodeId> = side_a.iter().map(|n| n.id()).collect();

            let a = is_primary_partition(true, &members, &failed_for_a, &BTreeSet::new());
            let b = is_primary_partition(true, &members, &failed_for_b, &BTreeSet::new());

            prop_assert!(a ^ b);
        }
    }
}
