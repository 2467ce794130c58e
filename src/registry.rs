use crate::status::BaySnapshot;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Process-wide view of every bay's current status. Each slot is written
/// exclusively by its owning monitor and replaced as a whole value, so
/// readers never observe a half-updated snapshot; reads clone and never
/// block writers of other slots.
pub struct StatusRegistry {
    slots: BTreeMap<u32, RwLock<BaySnapshot>>,
}

impl StatusRegistry {
    /// Creates one slot per configured bay, initially in ConnectionError
    /// until the bay's monitor publishes a real reading.
    pub fn new(bay_ids: impl IntoIterator<Item = u32>) -> Self {
        let slots = bay_ids
            .into_iter()
            .map(|id| (id, RwLock::new(BaySnapshot::initial(id))))
            .collect();
        Self { slots }
    }

    /// Whole-value replacement of one bay's snapshot. Only the bay's own
    /// monitor calls this.
    pub fn publish(&self, snapshot: BaySnapshot) {
        if let Some(slot) = self.slots.get(&snapshot.bay_id) {
            *slot.write() = snapshot;
        } else {
            tracing::error!(bay_id = snapshot.bay_id, "Publish for unknown bay dropped");
        }
    }

    pub fn get(&self, bay_id: u32) -> Option<BaySnapshot> {
        self.slots.get(&bay_id).map(|slot| slot.read().clone())
    }

    /// Point-in-time snapshots of every bay, ordered by bay id. No
    /// transaction spans bays; each entry is individually consistent.
    pub fn get_all(&self) -> Vec<BaySnapshot> {
        self.slots.values().map(|slot| slot.read().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
