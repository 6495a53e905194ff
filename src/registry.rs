//! Opaque identifiers for native GATT objects.
//!
//! A native stack hands out attribute objects the caller cannot hold on to.
//! The registry mints a plain integer for each one and resolves it back later.
//! Identifiers come from a single monotonic allocator, so an identifier that
//! was invalidated can never alias a live object.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use thiserror::Error;

/// Opaque identifier of a discovered service, characteristic or descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttrId(u64);

impl AttrId {
    pub const fn from_raw(raw: u64) -> Self {
        AttrId(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AttrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identifier is unknown or was invalidated by a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no live attribute with id {0}")]
pub struct NotFound(pub AttrId);

/// Process-wide source of attribute identifiers. Never reuses a value.
#[derive(Debug)]
pub struct IdAllocator {
    next: u64,
}

impl Default for IdAllocator {
    fn default() -> Self {
        IdAllocator::new()
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> AttrId {
        let id = AttrId(self.next);
        self.next += 1;
        id
    }
}

#[derive(Debug, Clone)]
pub struct Slot<H, T> {
    pub handle: H,
    pub value: T,
}

/// One tier of live attributes: identifier to native handle plus payload.
///
/// Minting is idempotent per native handle while the handle is registered, so
/// the same native object reported twice keeps its identifier. Once a handle is
/// invalidated, minting it again yields a fresh identifier.
#[derive(Debug)]
pub struct Registry<H, T = ()> {
    slots: HashMap<AttrId, Slot<H, T>>,
    ids: BTreeMap<H, AttrId>,
}

impl<H, T> Default for Registry<H, T> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            ids: BTreeMap::new(),
        }
    }
}

impl<H, T> Registry<H, T>
where
    H: Clone + Ord,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the identifier of `handle`, minting one if the handle is not
    /// registered. An already registered handle has its payload replaced.
    pub fn mint(&mut self, ids: &mut IdAllocator, handle: H, value: T) -> AttrId {
        if let Some(&id) = self.ids.get(&handle) {
            if let Some(slot) = self.slots.get_mut(&id) {
                slot.value = value;
            }
            return id;
        }

        let id = ids.next_id();
        self.ids.insert(handle.clone(), id);
        self.slots.insert(id, Slot { handle, value });
        id
    }

    pub fn resolve(&self, id: AttrId) -> Result<&H, NotFound> {
        self.get(id).map(|slot| &slot.handle)
    }

    pub fn get(&self, id: AttrId) -> Result<&Slot<H, T>, NotFound> {
        self.slots.get(&id).ok_or(NotFound(id))
    }

    pub fn get_mut(&mut self, id: AttrId) -> Result<&mut Slot<H, T>, NotFound> {
        self.slots.get_mut(&id).ok_or(NotFound(id))
    }

    pub fn id_of(&self, handle: &H) -> Option<AttrId> {
        self.ids.get(handle).copied()
    }

    pub fn contains(&self, id: AttrId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Removes `id`; later resolution fails with [`NotFound`].
    pub fn invalidate(&mut self, id: AttrId) -> Option<Slot<H, T>> {
        let slot = self.slots.remove(&id)?;
        if self.ids.get(&slot.handle) == Some(&id) {
            self.ids.remove(&slot.handle);
        }
        Some(slot)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
