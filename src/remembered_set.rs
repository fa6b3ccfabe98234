use std::collections::HashMap;

use crate::{
    heap::Alloc,
    object::{ObjectHeader, RegionMd},
    shared,
};

/// The region's inventory of shared objects (immutables and cowns) it keeps
/// alive. One reference count is held per entry. The value is the
/// per-collection mark: marking flips it to true, sweeping drops every entry
/// still false and clears the survivors back.
pub struct RememberedSet {
    set: HashMap<*mut ObjectHeader, bool>,
}

impl RememberedSet {
    pub fn new() -> Self {
        Self {
            set: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn contains(&self, o: *mut ObjectHeader) -> bool {
        self.set.contains_key(&o)
    }

    /// Records `o`, acquiring a reference unless `TRANSFER` says the caller
    /// donates one it already holds. A donated duplicate is released on the
    /// spot.
    pub(crate) unsafe fn insert<const TRANSFER: bool>(
        &mut self,
        alloc: &mut Alloc,
        o: *mut ObjectHeader,
    ) {
        debug_assert!(matches!((*o).class(), RegionMd::Rc | RegionMd::Cown));
        if self.set.contains_key(&o) {
            if TRANSFER {
                shared::release(alloc, o);
            }
        } else {
            if !TRANSFER {
                shared::acquire(o);
            }
            self.set.insert(o, false);
        }
    }

    /// Marks `o` as reached during the current collection. An object that
    /// was never inserted is adopted here, with a fresh reference, so that
    /// the sweep accounts for everything marking saw.
    pub(crate) unsafe fn mark(&mut self, o: *mut ObjectHeader, marked: &mut usize) {
        match self.set.get_mut(&o) {
            Some(m) => {
                if !*m {
                    *m = true;
                    *marked += 1;
                }
            }
            None => {
                shared::acquire(o);
                self.set.insert(o, true);
                *marked += 1;
            }
        }
    }

    /// Drops the reference of every entry the last mark pass did not touch.
    /// `marked == 0` is the teardown case: everything goes.
    pub(crate) unsafe fn sweep_set(&mut self, alloc: &mut Alloc, marked: usize) {
        if marked == 0 {
            for (o, _) in self.set.drain() {
                shared::release(alloc, o);
            }
            return;
        }
        self.set.retain(|&o, m| {
            if *m {
                *m = false;
                true
            } else {
                unsafe { shared::release(alloc, o) };
                false
            }
        });
    }

    /// Takes every entry of `other`, releasing counts duplicated between the
    /// two sets.
    pub(crate) unsafe fn merge(&mut self, alloc: &mut Alloc, other: &mut RememberedSet) {
        for (o, _) in other.set.drain() {
            if self.set.contains_key(&o) {
                shared::release(alloc, o);
            } else {
                self.set.insert(o, false);
            }
        }
    }
}

impl Default for RememberedSet {
    fn default() -> Self {
        Self::new()
    }
}
