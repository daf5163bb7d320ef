//! Pure computation of the optimal contiguous meeting block(s) from per-user availability.
//!
//! Ported from the block-growth/intersection approach in the Python `AvailabilityProcessor`
//! (`_find_contiguous_blocks`/`_score_block`), generalized to return every block tied for the
//! highest score rather than a single winner, and to take pluggable filter predicates instead of
//! a hardcoded sleep-hours check.

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, BTreeSet};

pub const SLOT: chrono::Duration = chrono::Duration::minutes(30);

pub type UserId = uuid::Uuid;

/// Constraints under which a block is considered valid, taken from the owning Event.
#[derive(Debug, Clone, Copy)]
pub struct BlockConstraints {
    pub min_participants: usize,
    pub min_block_slots: u32,
    pub max_block_slots: u32,
}

/// A single user's availability for one slot.
#[derive(Debug, Clone, Copy)]
pub struct AvailabilityEntry {
    pub user_id: UserId,
    pub start: DateTime<Utc>,
}

/// A block candidate that met both the quorum and minimum-length requirements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCandidate {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub participants: BTreeSet<UserId>,
    /// Total participant headcount (not just the running intersection) seen at each slot the
    /// block spans, in order. Feeds `stability_filter`.
    pub per_slot_counts: Vec<usize>,
}

impl BlockCandidate {
    pub fn duration_slots(&self) -> u32 {
        ((self.end - self.start).num_minutes() / SLOT.num_minutes()) as u32
    }

    /// `participant_count * duration_slots`, the tie-break score from the Python scorer
    /// simplified to integer terms (no sleep-time penalty applied here; see `sleep_filter`).
    pub fn score(&self) -> u64 {
        self.participants.len() as u64 * self.duration_slots() as u64
    }
}

/// A predicate that can reject an otherwise-qualifying block. Both `sleep_filter` and
/// `stability_filter` below are expressed this way so the search itself stays predicate-agnostic.
pub type BlockFilter<'a> = Box<dyn Fn(&BlockCandidate) -> bool + 'a>;

/// Rejects a block if any participant has declared sleep hours (`sleep_start`..`sleep_end`, in
/// `tz`) overlapping any slot the block spans. Sleep windows that cross midnight (e.g. 23:00 to
/// 07:00) are handled the way `_is_sleep_time` handles them in the Python scorer. Off by
/// default: callers only construct this when at least one participant has sleep hours set.
pub fn sleep_filter(tz: Tz, sleepers: Vec<(UserId, NaiveTime, NaiveTime)>) -> BlockFilter<'static> {
    Box::new(move |candidate: &BlockCandidate| {
        !candidate.participants.iter().any(|uid| {
            sleepers.iter().any(|(id, sleep_start, sleep_end)| {
                id == uid && overlaps_sleep_window(candidate.start, candidate.end, tz, *sleep_start, *sleep_end)
            })
        })
    })
}

fn overlaps_sleep_window(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tz: Tz,
    sleep_start: NaiveTime,
    sleep_end: NaiveTime,
) -> bool {
    let mut t = start;
    while t < end {
        let local = t.with_timezone(&tz).time();
        let in_window = if sleep_start <= sleep_end {
            local >= sleep_start && local < sleep_end
        } else {
            local >= sleep_start || local < sleep_end
        };
        if in_window {
            return true;
        }
        t = t + SLOT;
    }
    false
}

/// Rejects a block whose per-slot headcount ever drops by more than `max_drop_ratio` from the
/// block's peak headcount - a proxy for "participants are leaving mid-block." Off by default:
/// callers opt in by constructing this filter with a threshold.
pub fn stability_filter(max_drop_ratio: f64) -> BlockFilter<'static> {
    Box::new(move |candidate: &BlockCandidate| {
        let peak = candidate.per_slot_counts.iter().copied().max().unwrap_or(0);
        if peak == 0 {
            return true;
        }
        candidate
            .per_slot_counts
            .iter()
            .all(|&count| (peak - count) as f64 / peak as f64 <= max_drop_ratio)
    })
}

/// Groups entries by their slot start, producing the "slot map" the search walks.
fn slot_map(entries: &[AvailabilityEntry]) -> BTreeMap<DateTime<Utc>, BTreeSet<UserId>> {
    let mut map: BTreeMap<DateTime<Utc>, BTreeSet<UserId>> = BTreeMap::new();
    for entry in entries {
        map.entry(entry.start).or_default().insert(entry.user_id);
    }
    map
}

/// Computes every block tied for the maximum score, given the constraints and any filters.
/// Returns an empty vec if no block qualifies. Pure: no I/O, no clock.
pub fn find_best_blocks(
    entries: &[AvailabilityEntry],
    constraints: BlockConstraints,
    filters: &[BlockFilter],
) -> Vec<BlockCandidate> {
    let slots = slot_map(entries);
    let mut qualifying = Vec::new();

    for &start in slots.keys() {
        if let Some(candidate) = grow_from(&slots, start, constraints) {
            if filters.iter().all(|f| f(&candidate)) {
                qualifying.push(candidate);
            }
        }
    }

    let best_score = qualifying.iter().map(BlockCandidate::score).max();
    match best_score {
        Some(best) => qualifying.into_iter().filter(|b| b.score() == best).collect(),
        None => Vec::new(),
    }
}

/// Greedily grows the block rooted at `start`, stopping as soon as the intersection would drop
/// below quorum or the next slot is missing/discontiguous. Intersection size is monotone
/// non-increasing in the block length, so the first failure to meet quorum is final.
fn grow_from(
    slots: &BTreeMap<DateTime<Utc>, BTreeSet<UserId>>,
    start: DateTime<Utc>,
    constraints: BlockConstraints,
) -> Option<BlockCandidate> {
    let mut intersection = slots.get(&start)?.clone();
    let mut per_slot_counts = vec![intersection.len()];
    let mut length: u32 = 1;

    if intersection.len() >= constraints.min_participants {
        while length < constraints.max_block_slots {
            let next_start = start + SLOT * length as i32;
            let next = match slots.get(&next_start) {
                Some(set) => set,
                None => break,
            };
            let next_intersection: BTreeSet<UserId> =
                intersection.intersection(next).copied().collect();
            if next_intersection.len() < constraints.min_participants {
                break;
            }
            intersection = next_intersection;
            per_slot_counts.push(next.len());
            length += 1;
        }
    } else {
        return None;
    }

    if length < constraints.min_block_slots {
        return None;
    }

    Some(BlockCandidate {
        start,
        end: start + SLOT * length as i32,
        participants: intersection,
        per_slot_counts,
    })
}

/// Tie-break order applied by callers that must pick exactly one block from a tied set: earliest
/// start, then longest duration, then deterministic participant ordering.
pub fn tie_break(blocks: &[BlockCandidate]) -> Option<&BlockCandidate> {
    blocks.iter().min_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then_with(|| b.duration_slots().cmp(&a.duration_slots()))
            .then_with(|| a.participants.cmp(&b.participants))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, hour, min, 0).unwrap()
    }

    fn user(n: u8) -> UserId {
        uuid::Uuid::from_u128(n as u128)
    }

    fn default_constraints() -> BlockConstraints {
        BlockConstraints {
            min_participants: 2,
            min_block_slots: 2,
            max_block_slots: 4,
        }
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let blocks = find_best_blocks(&[], default_constraints(), &[]);
        assert!(blocks.is_empty());
    }

    #[test]
    fn single_sixty_minute_overlap() {
        let entries = vec![
            AvailabilityEntry { user_id: user(1), start: t(10, 0) },
            AvailabilityEntry { user_id: user(1), start: t(10, 30) },
            AvailabilityEntry { user_id: user(2), start: t(10, 0) },
            AvailabilityEntry { user_id: user(2), start: t(10, 30) },
        ];
        let blocks = find_best_blocks(&entries, default_constraints(), &[]);
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.start, t(10, 0));
        assert_eq!(block.end, t(11, 0));
        assert_eq!(block.participants.len(), 2);
    }

    #[test]
    fn no_quorum_yields_empty() {
        let entries = vec![
            AvailabilityEntry { user_id: user(1), start: t(10, 0) },
            AvailabilityEntry { user_id: user(1), start: t(10, 30) },
        ];
        let blocks = find_best_blocks(&entries, default_constraints(), &[]);
        assert!(blocks.is_empty());
    }

    #[test]
    fn length_caps_at_max_and_ties_are_all_returned() {
        let mut entries = Vec::new();
        for slot in 0..8 {
            let start = t(9, 0) + SLOT * slot;
            for u in 1..=4u8 {
                entries.push(AvailabilityEntry { user_id: user(u), start });
            }
        }
        let blocks = find_best_blocks(&entries, default_constraints(), &[]);
        // Every starting slot that can still fit 4 qualifying slots within the window ties at
        // score 4 participants * 4 slots = 16.
        assert!(blocks.iter().all(|b| b.duration_slots() == 4));
        assert!(blocks.iter().all(|b| b.participants.len() == 4));
        assert_eq!(blocks.len(), 5);
        let chosen = tie_break(&blocks).unwrap();
        assert_eq!(chosen.start, t(9, 0));
    }

    #[test]
    fn intersection_shrinks_but_still_qualifies() {
        let entries = vec![
            AvailabilityEntry { user_id: user(1), start: t(10, 0) },
            AvailabilityEntry { user_id: user(2), start: t(10, 0) },
            AvailabilityEntry { user_id: user(3), start: t(10, 0) },
            AvailabilityEntry { user_id: user(1), start: t(10, 30) },
            AvailabilityEntry { user_id: user(2), start: t(10, 30) },
            AvailabilityEntry { user_id: user(3), start: t(10, 30) },
            AvailabilityEntry { user_id: user(2), start: t(11, 0) },
            AvailabilityEntry { user_id: user(3), start: t(11, 0) },
        ];
        let blocks = find_best_blocks(&entries, default_constraints(), &[]);
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.start, t(10, 0));
        assert_eq!(block.end, t(11, 30));
        assert_eq!(block.duration_slots(), 3);
        assert_eq!(block.participants.len(), 2);
    }

    #[test]
    fn qualification_closure_shorter_subblock_also_qualifies() {
        let constraints = BlockConstraints {
            min_participants: 2,
            min_block_slots: 1,
            max_block_slots: 4,
        };
        let entries = vec![
            AvailabilityEntry { user_id: user(1), start: t(10, 0) },
            AvailabilityEntry { user_id: user(2), start: t(10, 0) },
        ];
        let blocks = find_best_blocks(&entries, constraints, &[]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].duration_slots(), 1);
    }

    #[test]
    fn sleep_filter_rejects_a_block_overlapping_declared_sleep_hours() {
        let entries = vec![
            AvailabilityEntry { user_id: user(1), start: t(23, 0) },
            AvailabilityEntry { user_id: user(1), start: t(23, 30) },
            AvailabilityEntry { user_id: user(2), start: t(23, 0) },
            AvailabilityEntry { user_id: user(2), start: t(23, 30) },
        ];
        // user(1) sleeps 23:00-07:00 (crosses midnight); the only candidate block overlaps it.
        let sleepers = vec![(
            user(1),
            chrono::NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
            chrono::NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        )];
        let filters = [sleep_filter(chrono_tz::UTC, sleepers)];
        let blocks = find_best_blocks(&entries, default_constraints(), &filters);
        assert!(blocks.is_empty());
    }

    #[test]
    fn sleep_filter_is_a_no_op_for_participants_without_sleep_hours() {
        let entries = vec![
            AvailabilityEntry { user_id: user(1), start: t(10, 0) },
            AvailabilityEntry { user_id: user(1), start: t(10, 30) },
            AvailabilityEntry { user_id: user(2), start: t(10, 0) },
            AvailabilityEntry { user_id: user(2), start: t(10, 30) },
        ];
        let sleepers = vec![(
            user(99),
            chrono::NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
            chrono::NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        )];
        let filters = [sleep_filter(chrono_tz::UTC, sleepers)];
        let blocks = find_best_blocks(&entries, default_constraints(), &filters);
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn stability_filter_rejects_a_block_whose_headcount_collapses() {
        let entries = vec![
            AvailabilityEntry { user_id: user(1), start: t(10, 0) },
            AvailabilityEntry { user_id: user(2), start: t(10, 0) },
            AvailabilityEntry { user_id: user(3), start: t(10, 0) },
            AvailabilityEntry { user_id: user(4), start: t(10, 0) },
            AvailabilityEntry { user_id: user(1), start: t(10, 30) },
            AvailabilityEntry { user_id: user(2), start: t(10, 30) },
        ];
        let constraints = BlockConstraints {
            min_participants: 2,
            min_block_slots: 2,
            max_block_slots: 4,
        };
        let filters = [stability_filter(0.3)];
        let blocks = find_best_blocks(&entries, constraints, &filters);
        assert!(blocks.is_empty());
    }

    #[test]
    fn running_twice_is_deterministic() {
        let entries = vec![
            AvailabilityEntry { user_id: user(1), start: t(10, 0) },
            AvailabilityEntry { user_id: user(1), start: t(10, 30) },
            AvailabilityEntry { user_id: user(2), start: t(10, 0) },
            AvailabilityEntry { user_id: user(2), start: t(10, 30) },
        ];
        let first = find_best_blocks(&entries, default_constraints(), &[]);
        let second = find_best_blocks(&entries, default_constraints(), &[]);
        assert_eq!(first, second);
    }
}
