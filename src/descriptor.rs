use std::mem::{needs_drop, size_of};

use crate::{
    api::{Collectable, ObjectStack},
    heap::MIN_ALLOCATION,
    object::ObjectHeader,
    util::align_usize,
};

pub type TraceCallback = unsafe fn(*const u8, &mut ObjectStack);
pub type FinalizeCallback = unsafe fn(*mut u8);

/// Per-type function table consulted by the collector. One of these exists
/// per [`Collectable`] type; objects point at it from their header, so the
/// collector never needs a vtable.
///
/// `finalise` runs while the object (and its dying siblings) are intact;
/// `destruct` is the drop glue, run just before the memory is reclaimed.
pub struct Descriptor {
    /// Allocation size, header included, in bytes.
    pub size: usize,
    pub trace: TraceCallback,
    pub finalise: Option<FinalizeCallback>,
    pub destruct: Option<FinalizeCallback>,
    pub possibly_iso_fields: bool,
}

unsafe fn trace_callback<T: Collectable>(payload: *const u8, stack: &mut ObjectStack) {
    (*payload.cast::<T>()).trace(stack)
}

unsafe fn finalize_callback<T: Collectable>(payload: *mut u8) {
    (*payload.cast::<T>()).finalize()
}

unsafe fn destruct_callback<T: Collectable>(payload: *mut u8) {
    core::ptr::drop_in_place(payload.cast::<T>())
}

pub(crate) unsafe fn trace_nothing(_payload: *const u8, _stack: &mut ObjectStack) {}

/// Builds the [`Descriptor`] for a type. Implemented for every
/// [`Collectable`] automatically.
pub trait DescriptorTrait<T: Collectable> {
    const DESCRIPTOR: Descriptor;
    fn descriptor() -> &'static Descriptor;
}

impl<T: Collectable> DescriptorTrait<T> for T {
    const DESCRIPTOR: Descriptor = Descriptor {
        size: align_usize(size_of::<ObjectHeader>() + size_of::<T>(), MIN_ALLOCATION),
        trace: trace_callback::<T>,
        finalise: if T::NEEDS_FINALISE {
            Some(finalize_callback::<T>)
        } else {
            None
        },
        destruct: if needs_drop::<T>() {
            Some(destruct_callback::<T>)
        } else {
            None
        },
        possibly_iso_fields: T::POSSIBLY_ISO_FIELDS,
    };

    fn descriptor() -> &'static Descriptor {
        &Self::DESCRIPTOR
    }
}
