use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

/// Shared map of item ownership plus the set of items physically in a
/// driver's hands. A single mutex guards both so claim, lock, release and
/// transfer are atomic with respect to each other.
///
/// Invariants: an item has at most one owner; the lock set is a subset of
/// the ownership map; a locked item changes owner only through transfer.
pub struct ItemAssignmentLedger {
    inner: Mutex<LedgerInner>,
}

#[derive(Default)]
struct LedgerInner {
    owners: HashMap<Uuid, Uuid>,
    locked: HashSet<Uuid>,
}

impl ItemAssignmentLedger {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    fn guard(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bulk-assigns items to a driver, overwriting prior non-locked
    /// ownership. Items locked by another driver are skipped; physical
    /// custody only moves through [`Self::transfer_ownership`]. Returns the
    /// ids actually claimed.
    pub fn claim(&self, item_ids: &[Uuid], driver_id: Uuid) -> Vec<Uuid> {
        let mut inner = self.guard();
        let mut claimed = Vec::with_capacity(item_ids.len());

        for &item_id in item_ids {
            let locked_by_other = inner.locked.contains(&item_id)
                && inner.owners.get(&item_id) != Some(&driver_id);
            if locked_by_other {
                continue;
            }
            inner.owners.insert(item_id, driver_id);
            claimed.push(item_id);
        }

        claimed
    }

    /// Marks items as physically held. Only items the driver owns are
    /// locked; the rest are ignored.
    pub fn lock(&self, item_ids: &[Uuid], driver_id: Uuid) {
        let mut inner = self.guard();
        for &item_id in item_ids {
            if inner.owners.get(&item_id) == Some(&driver_id) {
                inner.locked.insert(item_id);
            }
        }
    }

    /// Removes ownership for items that are not locked. Locked items are
    /// left untouched so custody is never silently lost.
    pub fn release(&self, item_ids: &[Uuid]) {
        let mut inner = self.guard();
        for item_id in item_ids {
            if !inner.locked.contains(item_id) {
                inner.owners.remove(item_id);
            }
        }
    }

    /// Unconditionally removes an item from the ledger, lock included.
    /// Used when custody ends, i.e. the item was handed to its recipient.
    pub fn discharge(&self, item_ids: &[Uuid]) {
        let mut inner = self.guard();
        for item_id in item_ids {
            inner.locked.remove(item_id);
            inner.owners.remove(item_id);
        }
    }

    /// Releases every non-locked item owned by the driver, returning the
    /// released ids. Called on logout and on route end.
    pub fn release_unlocked_for(&self, driver_id: Uuid) -> Vec<Uuid> {
        let mut inner = self.guard();
        let released: Vec<Uuid> = inner
            .owners
            .iter()
            .filter(|(item_id, owner)| **owner == driver_id && !inner.locked.contains(item_id))
            .map(|(item_id, _)| *item_id)
            .collect();

        for item_id in &released {
            inner.owners.remove(item_id);
        }
        released
    }

    /// Reassigns ownership regardless of locks. This is the one sanctioned
    /// way a locked item changes hands.
    pub fn transfer_ownership(&self, item_ids: &[Uuid], to_driver_id: Uuid) {
        let mut inner = self.guard();
        for &item_id in item_ids {
            inner.owners.insert(item_id, to_driver_id);
        }
    }

    pub fn owner_of(&self, item_id: Uuid) -> Option<Uuid> {
        self.guard().owners.get(&item_id).copied()
    }

    pub fn is_owned_by_other(&self, item_id: Uuid, requesting_driver_id: Uuid) -> bool {
        matches!(self.guard().owners.get(&item_id), Some(owner) if *owner != requesting_driver_id)
    }

    pub fn is_locked(&self, item_id: Uuid) -> bool {
        self.guard().locked.contains(&item_id)
    }

    pub fn locked_count(&self) -> usize {
        self.guard().locked.len()
    }
}

impl Default for ItemAssignmentLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::ItemAssignmentLedger;

    fn ids(n: u128) -> Vec<Uuid> {
        (1..=n).map(Uuid::from_u128).collect()
    }

    #[test]
    fn item_has_at_most_one_owner() {
        let ledger = ItemAssignmentLedger::new();
        let items = ids(1);
        let alice = Uuid::from_u128(100);
        let bob = Uuid::from_u128(200);

        ledger.claim(&items, alice);
        ledger.claim(&items, bob);

        assert_eq!(ledger.owner_of(items[0]), Some(bob));
    }

    #[test]
    fn locked_item_rejects_claim_by_other_driver() {
        let ledger = ItemAssignmentLedger::new();
        let items = ids(1);
        let alice = Uuid::from_u128(100);
        let bob = Uuid::from_u128(200);

        ledger.claim(&items, alice);
        ledger.lock(&items, alice);

        let claimed = ledger.claim(&items, bob);
        assert!(claimed.is_empty());
        assert_eq!(ledger.owner_of(items[0]), Some(alice));
    }

    #[test]
    fn owner_can_reclaim_own_locked_item() {
        let ledger = ItemAssignmentLedger::new();
        let items = ids(1);
        let alice = Uuid::from_u128(100);

        ledger.claim(&items, alice);
        ledger.lock(&items, alice);

        let claimed = ledger.claim(&items, alice);
        assert_eq!(claimed, items);
    }

    #[test]
    fn release_skips_locked_items() {
        let ledger = ItemAssignmentLedger::new();
        let items = ids(2);
        let alice = Uuid::from_u128(100);

        ledger.claim(&items, alice);
        ledger.lock(&items[..1], alice);
        ledger.release(&items);

        assert_eq!(ledger.owner_of(items[0]), Some(alice));
        assert_eq!(ledger.owner_of(items[1]), None);
    }

    #[test]
    fn release_unlocked_for_keeps_locked_custody() {
        let ledger = ItemAssignmentLedger::new();
        let items = ids(3);
        let alice = Uuid::from_u128(100);

        ledger.claim(&items, alice);
        ledger.lock(&items[..1], alice);

        let released = ledger.release_unlocked_for(alice);
        assert_eq!(released.len(), 2);
        assert_eq!(ledger.owner_of(items[0]), Some(alice));
        assert!(ledger.is_locked(items[0]));
    }

    #[test]
    fn transfer_moves_locked_items() {
        let ledger = ItemAssignmentLedger::new();
        let items = ids(1);
        let alice = Uuid::from_u128(100);
        let bob = Uuid::from_u128(200);

        ledger.claim(&items, alice);
        ledger.lock(&items, alice);
        ledger.transfer_ownership(&items, bob);

        assert_eq!(ledger.owner_of(items[0]), Some(bob));
        assert!(ledger.is_locked(items[0]));
    }

    #[test]
    fn discharge_clears_ownership_and_lock() {
        let ledger = ItemAssignmentLedger::new();
        let items = ids(1);
        let alice = Uuid::from_u128(100);

        ledger.claim(&items, alice);
        ledger.lock(&items, alice);
        ledger.discharge(&items);

        assert_eq!(ledger.owner_of(items[0]), None);
        assert!(!ledger.is_locked(items[0]));
        assert_eq!(ledger.locked_count(), 0);
    }
}
