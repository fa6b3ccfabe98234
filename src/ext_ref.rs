use std::{collections::HashMap, ptr::NonNull, sync::Arc};

use parking_lot::Mutex;

use crate::object::ObjectHeader;

/// A stable handle to an object inside a region, usable from outside it.
///
/// The handle does not keep its target alive; it is revoked when the target
/// is collected or its region is torn down. Reading the pointer is safe from
/// any thread, but dereferencing it is only valid on the scheduler thread
/// that currently owns the target's region.
pub struct ExternalRef {
    target: Mutex<Option<NonNull<ObjectHeader>>>,
}

// The pointer inside is only a name until the holder is scheduled onto the
// owning region's thread.
unsafe impl Send for ExternalRef {}
unsafe impl Sync for ExternalRef {}

impl ExternalRef {
    pub fn get(&self) -> Option<NonNull<ObjectHeader>> {
        *self.target.lock()
    }

    pub fn is_live(&self) -> bool {
        self.target.lock().is_some()
    }

    fn revoke(&self) {
        *self.target.lock() = None;
    }
}

/// Map from interior objects to the handles held on them outside the
/// region, maintained so that collecting an object revokes its handle.
pub struct ExternalReferenceTable {
    map: HashMap<*mut ObjectHeader, Arc<ExternalRef>>,
}

impl ExternalReferenceTable {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Hands out the handle for `o`, creating it on first request and
    /// flagging the object so the sweep knows to come back here.
    pub(crate) unsafe fn create(&mut self, o: *mut ObjectHeader) -> Arc<ExternalRef> {
        if let Some(r) = self.map.get(&o) {
            return r.clone();
        }
        (*o).set_has_ext_ref();
        let r = Arc::new(ExternalRef {
            target: Mutex::new(Some(NonNull::new_unchecked(o))),
        });
        self.map.insert(o, r.clone());
        r
    }

    /// Revokes and forgets the handle for `o`. Called right before `o` is
    /// reclaimed.
    pub(crate) fn erase(&mut self, o: *mut ObjectHeader) {
        if let Some(r) = self.map.remove(&o) {
            r.revoke();
        }
    }

    pub(crate) fn merge(&mut self, other: &mut ExternalReferenceTable) {
        self.map.extend(other.map.drain());
    }
}

impl Default for ExternalReferenceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExternalReferenceTable {
    fn drop(&mut self) {
        for r in self.map.values() {
            r.revoke();
        }
    }
}
