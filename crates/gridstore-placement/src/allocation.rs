//! Fair allocation of snapshot stores to members
//!
//! When a snapshot is archived or recovered each store must be handled by
//! exactly one member that can see it, and the work should be spread as
//! evenly as the visibility allows.

use gridstore_common::{MemberId, PersistenceError, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Assign every visible store to exactly one member that can see it.
///
/// `visible` maps each member to the store ids in its storage. If all members
/// see the same stores, the sorted ids are cut into contiguous shares with
/// the last member taking the remainder. Otherwise every member starts out
/// holding all it can see; members with identical visibility form a class,
/// classes are processed smallest visibility first, and each store still
/// held by several members is repeatedly taken away from the holder with
/// the most stores until one holder is left. Ties go against the larger
/// member id.
pub fn assign_stores(
    visible: &BTreeMap<MemberId, Vec<String>>,
) -> Result<BTreeMap<MemberId, Vec<String>>> {
    let sets: BTreeMap<MemberId, BTreeSet<&str>> = visible
        .iter()
        .map(|(member, stores)| (*member, stores.iter().map(String::as_str).collect()))
        .collect();
    let all: BTreeSet<&str> = sets.values().flatten().copied().collect();

    let assigned = if sets.values().all(|set| *set == all) {
        assign_shared(&sets, &all)
    } else {
        assign_overlapping(&sets)
    };

    verify(&sets, &all, &assigned)?;

    Ok(assigned
        .into_iter()
        .map(|(member, stores)| (member, stores.into_iter().map(str::to_string).collect()))
        .collect())
}

/// [`assign_stores`] for the stores of a named snapshot, with logging
pub fn allocate_snapshot_partitions(
    snapshot: &str,
    visible: &BTreeMap<MemberId, Vec<String>>,
) -> Result<BTreeMap<MemberId, Vec<String>>> {
    let assignment = assign_stores(visible)?;
    for (member, stores) in &assignment {
        debug!(
            "Snapshot {}: member {} assigned {} stores",
            snapshot,
            member,
            stores.len()
        );
    }
    info!(
        "Allocated stores of snapshot {} across {} members",
        snapshot,
        assignment.len()
    );
    Ok(assignment)
}

fn assign_shared<'a>(
    sets: &BTreeMap<MemberId, BTreeSet<&'a str>>,
    all: &BTreeSet<&'a str>,
) -> BTreeMap<MemberId, BTreeSet<&'a str>> {
    let stores: Vec<&str> = all.iter().copied().collect();
    let members: Vec<MemberId> = sets.keys().copied().collect();
    let share = stores.len() / members.len().max(1);

    members
        .iter()
        .enumerate()
        .map(|(i, member)| {
            let start = i * share;
            let end = if i + 1 == members.len() {
                stores.len()
            } else {
                start + share
            };
            (*member, stores[start..end].iter().copied().collect())
        })
        .collect()
}

fn assign_overlapping<'a>(
    sets: &BTreeMap<MemberId, BTreeSet<&'a str>>,
) -> BTreeMap<MemberId, BTreeSet<&'a str>> {
    // members with identical visibility, keyed by the visible set
    let mut classes: BTreeMap<&BTreeSet<&str>, Vec<MemberId>> = BTreeMap::new();
    for (member, set) in sets {
        classes.entry(set).or_default().push(*member);
    }
    let mut ordered: Vec<(&BTreeSet<&str>, MemberId)> = classes
        .into_iter()
        .filter_map(|(set, members)| members.iter().min().map(|m| (set, *m)))
        .collect();
    ordered.sort_by_key(|(set, min_member)| (set.len(), *min_member));

    let mut assigned = sets.clone();
    for (set, _) in ordered {
        for store in set {
            loop {
                let holders: Vec<MemberId> = assigned
                    .iter()
                    .filter(|(_, held)| held.contains(store))
                    .map(|(member, _)| *member)
                    .collect();
                if holders.len() <= 1 {
                    break;
                }
                let busiest = holders
                    .iter()
                    .copied()
                    .max_by_key(|member| (assigned[member].len(), *member));
                if let Some(busiest) = busiest
                    && let Some(held) = assigned.get_mut(&busiest)
                {
                    held.remove(store);
                }
            }
        }
    }
    assigned
}

fn verify(
    sets: &BTreeMap<MemberId, BTreeSet<&str>>,
    all: &BTreeSet<&str>,
    assigned: &BTreeMap<MemberId, BTreeSet<&str>>,
) -> Result<()> {
    let mut owner: BTreeMap<&str, MemberId> = BTreeMap::new();
    for (member, stores) in assigned {
        for store in stores {
            if !sets.get(member).is_some_and(|set| set.contains(store)) {
                return Err(PersistenceError::Allocation(format!(
                    "store {store} assigned to member {member} which cannot see it"
                )));
            }
            if let Some(previous) = owner.insert(*store, *member) {
                return Err(PersistenceError::Allocation(format!(
                    "store {store} assigned to both member {previous} and member {member}"
                )));
            }
        }
    }
    if let Some(missing) = all.iter().find(|store| !owner.contains_key(*store)) {
        return Err(PersistenceError::Allocation(format!(
            "store {missing} was not assigned to any member"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand::seq::SliceRandom;

    fn visible(entries: &[(MemberId, &[&str])]) -> BTreeMap<MemberId, Vec<String>> {
        entries
            .iter()
            .map(|(member, stores)| (*member, stores.iter().map(|s| (*s).to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_shared_stores_are_sliced() {
        let input = visible(&[(1, &["a", "b", "c", "d"]), (2, &["d", "c", "b", "a"])]);
        let assignment = assign_stores(&input).unwrap();
        assert_eq!(assignment[&1], vec!["a", "b"]);
        assert_eq!(assignment[&2], vec!["c", "d"]);
    }

    #[test]
    fn test_shared_remainder_goes_to_last_member() {
        let input = visible(&[(1, &["a", "b", "c"]), (2, &["a", "b", "c"])]);
        let assignment = assign_stores(&input).unwrap();
        assert_eq!(assignment[&1], vec!["a"]);
        assert_eq!(assignment[&2], vec!["b", "c"]);
    }

    #[test]
    fn test_overlapping_store_goes_to_one_member() {
        let input = visible(&[(1, &["1", "2", "3"]), (2, &["3", "4", "5"])]);
        let assignment = assign_stores(&input).unwrap();
        // equal load, so the larger member id gives up the shared store
        assert_eq!(assignment[&1], vec!["1", "2", "3"]);
        assert_eq!(assignment[&2], vec!["4", "5"]);
    }

    #[test]
    fn test_busiest_member_gives_up_shared_stores() {
        let input = visible(&[(1, &["a", "b"]), (2, &["a", "b", "c", "d", "e", "f"])]);
        let assignment = assign_stores(&input).unwrap();
        assert_eq!(assignment[&1], vec!["a", "b"]);
        assert_eq!(assignment[&2], vec!["c", "d", "e", "f"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(assign_stores(&BTreeMap::new()).unwrap().is_empty());
        let input = visible(&[(1, &[]), (2, &[])]);
        let assignment = assign_stores(&input).unwrap();
        assert!(assignment.values().all(Vec::is_empty));
    }

    #[test]
    fn test_random_visibility_assigns_each_store_once() {
        let mut rng = rand::thread_rng();
        let pool: Vec<String> = (0..24).map(|i| format!("{i}-1-a-1")).collect();

        for _ in 0..50 {
            let members = rng.gen_range(1..=6);
            let mut input = BTreeMap::new();
            for member in 0..members {
                let mut stores = pool.clone();
                stores.shuffle(&mut rng);
                stores.truncate(rng.gen_range(0..=pool.len()));
                input.insert(member, stores);
            }

            let assignment = allocate_snapshot_partitions("random", &input).unwrap();
            let mut seen = BTreeSet::new();
            for (member, stores) in &assignment {
                for store in stores {
                    assert!(input[member].contains(store));
                    assert!(seen.insert(store.clone()), "{store} assigned twice");
                }
            }
            let expected: BTreeSet<String> = input.values().flatten().cloned().collect();
            assert_eq!(seen, expected);
        }
    }
}
