use crate::inventory::ComputeUnit;
use crate::mapping::IdTarget;
use crate::{CaravanError, Result};
use std::collections::BTreeSet;

/// Decides destination identifiers for a batch of migrating units.
///
/// Built from a fresh target inventory snapshot at validation time.
/// Allocations are tracked in `claimed` so two units of one batch can
/// never receive the same id, even though neither is registered on the
/// target yet.
#[derive(Debug)]
pub struct IdArbiter {
    occupied: BTreeSet<u32>,
    claimed: BTreeSet<u32>,
    floor: u32,
}

impl IdArbiter {
    pub fn new(target_inventory: &[ComputeUnit], floor: u32) -> Self {
        Self {
            occupied: target_inventory.iter().map(|u| u.id).collect(),
            claimed: BTreeSet::new(),
            floor,
        }
    }

    /// Resolve one unit's destination id.
    ///
    /// Explicit mode checks the requested id against the target inventory
    /// and earlier allocations of this batch; a clash surfaces
    /// `IdentifierConflict`, which the caller may override via
    /// [`IdArbiter::acknowledge`] (the import step still rejects if the id
    /// is truly occupied at that point). Auto mode hands out the lowest
    /// unused id at or above the floor.
    pub fn resolve(&mut self, target: &IdTarget) -> Result<u32> {
        match target {
            IdTarget::Explicit(id) => {
                if self.occupied.contains(id) || self.claimed.contains(id) {
                    return Err(CaravanError::IdentifierConflict(*id));
                }
                self.claimed.insert(*id);
                Ok(*id)
            }
            IdTarget::Auto => {
                let mut candidate = self.floor;
                while self.occupied.contains(&candidate) || self.claimed.contains(&candidate) {
                    candidate += 1;
                }
                self.claimed.insert(candidate);
                Ok(candidate)
            }
        }
    }

    /// Claim an id the caller insists on despite a surfaced conflict.
    pub fn acknowledge(&mut self, id: u32) -> u32 {
        self.claimed.insert(id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{RunState, UnitKind};

    fn unit(id: u32) -> ComputeUnit {
        ComputeUnit {
            id,
            kind: UnitKind::Vm,
            name: format!("vm{}", id),
            state: RunState::Stopped,
            nics: Vec::new(),
            storages: Vec::new(),
        }
    }

    #[test]
    fn auto_skips_occupied_and_batch_claims() {
        // Target already has 101; migrating two units that both want auto
        // ids must yield distinct free ids.
        let inventory = vec![unit(101)];
        let mut arbiter = IdArbiter::new(&inventory, 100);
        let first = arbiter.resolve(&IdTarget::Auto).unwrap();
        let second = arbiter.resolve(&IdTarget::Auto).unwrap();
        assert_eq!(first, 100);
        assert_eq!(second, 102);
    }

    #[test]
    fn auto_never_returns_an_id_below_the_floor() {
        let mut arbiter = IdArbiter::new(&[], 100);
        assert_eq!(arbiter.resolve(&IdTarget::Auto).unwrap(), 100);
    }

    #[test]
    fn explicit_conflict_is_surfaced_not_swallowed() {
        let inventory = vec![unit(105)];
        let mut arbiter = IdArbiter::new(&inventory, 100);
        let err = arbiter.resolve(&IdTarget::Explicit(105)).unwrap_err();
        assert!(matches!(err, CaravanError::IdentifierConflict(105)));
        // The caller acknowledged; the id is claimed for the batch.
        assert_eq!(arbiter.acknowledge(105), 105);
    }

    #[test]
    fn explicit_conflicts_with_earlier_batch_claims() {
        let mut arbiter = IdArbiter::new(&[], 100);
        assert_eq!(arbiter.resolve(&IdTarget::Explicit(110)).unwrap(), 110);
        let err = arbiter.resolve(&IdTarget::Explicit(110)).unwrap_err();
        assert!(matches!(err, CaravanError::IdentifierConflict(110)));
    }

    #[test]
    fn explicit_free_id_is_granted() {
        let inventory = vec![unit(100)];
        let mut arbiter = IdArbiter::new(&inventory, 100);
        assert_eq!(arbiter.resolve(&IdTarget::Explicit(200)).unwrap(), 200);
    }
}
