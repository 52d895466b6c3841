//! Object register - identifier lifecycle and dirty-state bookkeeping
//!
//! Identifiers are recycled smallest-first. A destroyed object's identifier
//! stays reserved until no viewer holds it in its visible set and at least
//! one tick has passed since destruction.

use std::collections::BTreeSet;

use tracing::{debug, error};

use super::objects::{GameObject, ObjectId, ObjectKind};

const PART_DIRTY: u8 = 0b01;
const FULL_DIRTY: u8 = 0b10;

/// How much of an object must be resent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyLevel {
    Part,
    Full,
}

/// Register errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("object identifier space exhausted while spawning {kind:?} ({live} live)")]
    Exhausted { kind: ObjectKind, live: usize },

    #[error("unknown object id {0}")]
    UnknownObject(ObjectId),
}

#[derive(Debug, Default)]
struct Slot {
    object: Option<GameObject>,
    dirty: u8,
    view_refs: u32,
    destroyed_tick: Option<u64>,
}

/// Owns every live object, indexed by identifier
pub struct ObjectRegister {
    slots: Vec<Slot>,
    free_ids: BTreeSet<ObjectId>,
    max_id: ObjectId,
    dirty_ids: Vec<ObjectId>,
    pending_release: Vec<ObjectId>,
    live: usize,
}

impl ObjectRegister {
    pub fn new() -> Self {
        Self::with_max_id(ObjectId::MAX)
    }

    /// Register with a reduced identifier space
    pub fn with_max_id(max_id: ObjectId) -> Self {
        let mut slots = Vec::with_capacity(1024);
        // id 0 is reserved as "no object"
        slots.push(Slot::default());
        Self {
            slots,
            free_ids: BTreeSet::new(),
            max_id,
            dirty_ids: Vec::new(),
            pending_release: Vec::new(),
            live: 0,
        }
    }

    /// Reserve the smallest identifier not in use
    pub fn allocate(&mut self, kind: ObjectKind) -> Result<ObjectId, RegisterError> {
        if let Some(id) = self.free_ids.pop_first() {
            return Ok(id);
        }
        let next = self.slots.len();
        if next > self.max_id as usize {
            error!(
                kind = ?kind,
                live = self.live,
                pending_release = self.pending_release.len(),
                "Object identifier space exhausted"
            );
            return Err(RegisterError::Exhausted {
                kind,
                live: self.live,
            });
        }
        self.slots.push(Slot::default());
        Ok(next as ObjectId)
    }

    /// Register a new object, marking it full-dirty
    pub fn insert(&mut self, mut object: GameObject) -> Result<ObjectId, RegisterError> {
        let id = self.allocate(object.kind())?;
        object.id = id;
        let slot = &mut self.slots[id as usize];
        slot.object = Some(object);
        slot.destroyed_tick = None;
        self.live += 1;
        self.mark_full_dirty(id);
        Ok(id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&GameObject> {
        self.slots.get(id as usize).and_then(|s| s.object.as_ref())
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut GameObject> {
        self.slots.get_mut(id as usize).and_then(|s| s.object.as_mut())
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    pub fn kind_of(&self, id: ObjectId) -> Option<ObjectKind> {
        self.get(id).map(GameObject::kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GameObject> {
        self.slots.iter().filter_map(|s| s.object.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut GameObject> {
        self.slots.iter_mut().filter_map(|s| s.object.as_mut())
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn mark_dirty(&mut self, id: ObjectId, level: DirtyLevel) {
        match level {
            DirtyLevel::Part => self.mark_part_dirty(id),
            DirtyLevel::Full => self.mark_full_dirty(id),
        }
    }

    pub fn mark_part_dirty(&mut self, id: ObjectId) {
        self.set_dirty(id, PART_DIRTY);
    }

    /// Full resend subsumes a patch, so both flags are set
    pub fn mark_full_dirty(&mut self, id: ObjectId) {
        self.set_dirty(id, FULL_DIRTY | PART_DIRTY);
    }

    fn set_dirty(&mut self, id: ObjectId, flags: u8) {
        let Some(slot) = self.slots.get_mut(id as usize) else {
            return;
        };
        if slot.object.is_none() {
            return;
        }
        if slot.dirty == 0 {
            self.dirty_ids.push(id);
        }
        slot.dirty |= flags;
    }

    pub fn is_full_dirty(&self, id: ObjectId) -> bool {
        self.dirty_flags(id) & FULL_DIRTY != 0
    }

    pub fn is_part_dirty(&self, id: ObjectId) -> bool {
        self.dirty_flags(id) & PART_DIRTY != 0
    }

    fn dirty_flags(&self, id: ObjectId) -> u8 {
        self.slots.get(id as usize).map(|s| s.dirty).unwrap_or(0)
    }

    pub fn dirty_ids(&self) -> &[ObjectId] {
        &self.dirty_ids
    }

    /// Reset both dirty flags on every object; run after all viewers serialized
    pub fn clear_all_dirty(&mut self) {
        for id in self.dirty_ids.drain(..) {
            if let Some(slot) = self.slots.get_mut(id as usize) {
                slot.dirty = 0;
            }
        }
    }

    /// Remove an object; its identifier stays reserved until released
    pub fn destroy(&mut self, id: ObjectId, tick: u64) -> Result<GameObject, RegisterError> {
        let slot = self
            .slots
            .get_mut(id as usize)
            .ok_or(RegisterError::UnknownObject(id))?;
        let object = slot.object.take().ok_or(RegisterError::UnknownObject(id))?;
        slot.destroyed_tick = Some(tick);
        self.live -= 1;
        self.pending_release.push(id);
        Ok(object)
    }

    pub fn add_view_ref(&mut self, id: ObjectId) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            slot.view_refs += 1;
        }
    }

    pub fn drop_view_ref(&mut self, id: ObjectId) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            if slot.view_refs == 0 {
                error!(id, "View reference count underflow");
                debug_assert!(false, "view reference count underflow for id {id}");
                return;
            }
            slot.view_refs -= 1;
        }
    }

    pub fn view_refs(&self, id: ObjectId) -> u32 {
        self.slots.get(id as usize).map(|s| s.view_refs).unwrap_or(0)
    }

    /// Return a destroyed object's identifier to the free pool.
    ///
    /// Refused while any viewer still holds the identifier.
    pub fn release(&mut self, id: ObjectId) -> bool {
        let Some(slot) = self.slots.get_mut(id as usize) else {
            return false;
        };
        if slot.object.is_some() || slot.destroyed_tick.is_none() || slot.view_refs > 0 {
            return false;
        }
        slot.destroyed_tick = None;
        slot.dirty = 0;
        self.pending_release.retain(|&pending| pending != id);
        self.free_ids.insert(id);
        true
    }

    /// Release every identifier destroyed before `current_tick` that no viewer holds
    pub fn release_pending(&mut self, current_tick: u64) -> Vec<ObjectId> {
        let mut released = Vec::new();
        let slots = &mut self.slots;
        self.pending_release.retain(|&id| {
            let slot = &mut slots[id as usize];
            let ready = slot.view_refs == 0
                && slot.destroyed_tick.is_some_and(|t| t < current_tick);
            if ready {
                slot.destroyed_tick = None;
                slot.dirty = 0;
                released.push(id);
            }
            !ready
        });
        self.free_ids.extend(released.iter().copied());
        if !released.is_empty() {
            debug!(count = released.len(), "Released object identifiers");
        }
        released
    }

    pub fn pending_release(&self) -> &[ObjectId] {
        &self.pending_release
    }
}

impl Default for ObjectRegister {
    fn default() -> Self {
        Self::new()
    }
}
