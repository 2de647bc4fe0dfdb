//! Address-handle cache.
//!
//! The map lock is only held to look up or claim a slot. The hardware create
//! call runs outside it, and concurrent requests for the same attributes
//! block on the claimed slot until the creator publishes a result. Each key
//! therefore sees at most one successful creation between cleanups. A
//! creation that finishes after its slot was cleaned up is returned to the
//! caller and released by the next cleanup.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{IbError, Result};
use crate::gid::Gid;

/// Global routing header fields of an address handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GlobalRoute {
    pub dgid: Gid,
    pub flow_label: u32,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

/// Address-handle attributes. Equality covers every field, including the
/// routing header when `is_global` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AhAttr {
    pub grh: GlobalRoute,
    pub dlid: u16,
    pub sl: u8,
    pub src_path_bits: u8,
    pub static_rate: u8,
    pub is_global: bool,
    pub port_num: u8,
}

impl fmt::Display for AhAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dlid={} sl={} port={} src_path_bits={}",
            self.dlid, self.sl, self.port_num, self.src_path_bits
        )?;
        if self.is_global {
            write!(
                f,
                " dgid={} sgid_index={} traffic_class={}",
                self.grh.dgid, self.grh.sgid_index, self.grh.traffic_class
            )?;
        }
        Ok(())
    }
}

enum SlotState<H> {
    Pending,
    Ready(H),
    Failed,
}

struct Slot<H> {
    state: Mutex<SlotState<H>>,
    done: Condvar,
}

impl<H: Clone> Slot<H> {
    fn pending() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Pending),
            done: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<H>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: SlotState<H>) {
        *self.lock() = state;
        self.done.notify_all();
    }

    /// Block until the creator finishes. `None` means it failed.
    fn wait(&self) -> Option<H> {
        let mut state = self.lock();
        loop {
            match &*state {
                SlotState::Pending => {
                    state = self
                        .done
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                SlotState::Ready(h) => return Some(h.clone()),
                SlotState::Failed => return None,
            }
        }
    }
}

/// Marks a claimed slot failed and unlinks it unless disarmed, so waiters are
/// released even if the create call unwinds.
struct ClaimGuard<'a, H: Clone> {
    cache: &'a AhCache<H>,
    attr: AhAttr,
    slot: Arc<Slot<H>>,
    armed: bool,
}

impl<H: Clone> Drop for ClaimGuard<'_, H> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut slots = self.cache.slots();
            if slots
                .get(&self.attr)
                .is_some_and(|s| Arc::ptr_eq(s, &self.slot))
            {
                slots.remove(&self.attr);
            }
        }
        self.slot.publish(SlotState::Failed);
    }
}

/// Per-device dedup cache of created address handles.
pub struct AhCache<H> {
    slots: Mutex<HashMap<AhAttr, Arc<Slot<H>>>>,
    /// Handles whose creation finished after their slot was cleaned up.
    /// Released by the next [`AhCache::cleanup_all`].
    orphans: Mutex<Vec<H>>,
}

impl<H> Default for AhCache<H> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            orphans: Mutex::new(Vec::new()),
        }
    }
}

impl<H: Clone> AhCache<H> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<AhAttr, Arc<Slot<H>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached handle for `attr`, creating it with `create` on a
    /// miss. Failed creations are not cached.
    pub fn get_or_create<F>(&self, attr: &AhAttr, mut create: F) -> Result<H>
    where
        F: FnMut(&AhAttr) -> io::Result<H>,
    {
        loop {
            let (slot, owner) = {
                let mut slots = self.slots();
                match slots.get(attr) {
                    Some(slot) => (Arc::clone(slot), false),
                    None => {
                        slots
                            .try_reserve(1)
                            .map_err(|_| IbError::NoMemory("address handle cache"))?;
                        let slot = Slot::pending();
                        slots.insert(*attr, Arc::clone(&slot));
                        (slot, true)
                    }
                }
            };

            if !owner {
                match slot.wait() {
                    Some(handle) => return Ok(handle),
                    // The creator failed and unlinked the slot; try again.
                    None => continue,
                }
            }

            let mut guard = ClaimGuard {
                cache: self,
                attr: *attr,
                slot,
                armed: true,
            };
            return match create(attr) {
                Ok(handle) => {
                    guard.armed = false;
                    // Decided under the map lock: a linked slot is released
                    // by cleanup, an unlinked one only through the orphans.
                    let slots = self.slots();
                    if slots
                        .get(attr)
                        .is_some_and(|s| Arc::ptr_eq(s, &guard.slot))
                    {
                        guard.slot.publish(SlotState::Ready(handle.clone()));
                        tracing::trace!(ah_attr = %attr, "created address handle");
                    } else {
                        guard.slot.publish(SlotState::Failed);
                        self.orphans
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(handle.clone());
                        tracing::debug!(ah_attr = %attr, "address handle created after cleanup");
                    }
                    Ok(handle)
                }
                Err(e) => {
                    let err = IbError::from_ah_create(format!("create_ah({attr})"), &e);
                    tracing::debug!(ah_attr = %attr, error = %e, "address handle creation failed");
                    drop(guard);
                    Err(err)
                }
            };
        }
    }

    /// Cached handle for `attr`, if creation has completed.
    pub fn get(&self, attr: &AhAttr) -> Option<H> {
        let slot = Arc::clone(self.slots().get(attr)?);
        let state = slot.lock();
        match &*state {
            SlotState::Ready(h) => Some(h.clone()),
            _ => None,
        }
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.slots()
            .values()
            .filter(|s| matches!(*s.lock(), SlotState::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry and pass each created handle to `destroy`.
    /// No handle may be in use when this is called.
    pub fn cleanup_all<D>(&self, mut destroy: D) -> usize
    where
        D: FnMut(H),
    {
        let drained: Vec<_> = self.slots().drain().map(|(_, slot)| slot).collect();
        let orphans = std::mem::take(
            &mut *self.orphans.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut count = 0;
        for slot in drained {
            let state = std::mem::replace(&mut *slot.lock(), SlotState::Failed);
            slot.done.notify_all();
            if let SlotState::Ready(handle) = state {
                destroy(handle);
                count += 1;
            }
        }
        for handle in orphans {
            destroy(handle);
            count += 1;
        }
        count
    }
}

impl<H> fmt::Debug for AhCache<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("AhCache").field("entries", &entries).finish()
    }
}
