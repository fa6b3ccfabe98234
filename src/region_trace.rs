use std::{mem::size_of, ptr::null_mut};

use crate::{
    api::{Collectable, Gc, ObjectStack},
    descriptor::{trace_nothing, Descriptor, DescriptorTrait},
    ext_ref::ExternalRef,
    heap::{oom_abort, size_to_sizeclass, sizeclass_to_size, Alloc, SizeClass, MIN_ALLOCATION},
    object::{ObjectHeader, RegionMd},
    region::{release_region, RegionBase, RegionRelease},
    util::{is_aligned, HumanBytes},
};

use std::sync::Arc;

pub const VERBOSE: bool = cfg!(feature = "trace-verbose");

/// A region collected by tracing. All objects owned by the region sit on one
/// of two circular intrusive lists threaded through their headers, both
/// using the region metadata object as their sentinel:
///
/// ```text
///                 +--> RegionTrace <---------------+
///                 |         |                      |
///             iso o         v                  last_not_root
///                 ^     object_1                   |
///                 |         |                 (secondary ring:
///                 +-- ... <-+                  finaliser class
///                (primary ring)                opposite the iso)
/// ```
///
/// The iso is always the last node of the primary ring; its region pointer
/// doubles as the ring terminator. Objects whose finaliser class matches the
/// iso's share its ring, everything else goes on the secondary ring, whose
/// tail is tracked so two rings can be concatenated in constant time.
#[repr(C)]
pub struct RegionTrace {
    pub(crate) base: RegionBase,
    pub(crate) next_not_root: *mut ObjectHeader,
    pub(crate) last_not_root: *mut ObjectHeader,
    pub(crate) current_memory_used: usize,
    pub(crate) previous_memory_used: SizeClass,
}

/// Which ring(s) a [`RegionTrace::iter`] traversal covers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IterKind {
    NoFinaliser,
    NeedsFinaliser,
    Both,
}

/// A collection is worth running once the region has grown past this factor
/// of the live bytes observed by the previous sweep.
const GC_GROWTH_FACTOR: usize = 2;

impl RegionTrace {
    fn desc() -> &'static Descriptor {
        static DESC: Descriptor = Descriptor {
            size: size_of::<RegionTrace>(),
            trace: trace_nothing,
            finalise: None,
            destruct: None,
            possibly_iso_fields: false,
        };
        &DESC
    }

    pub(crate) fn is_trace_region(r: *mut RegionBase) -> bool {
        unsafe { (*r).header.descriptor() as *const Descriptor == Self::desc() as *const Descriptor }
    }

    /// The region of the iso object `o`.
    pub fn get<T: Collectable>(o: Gc<T>) -> *mut RegionTrace {
        unsafe { Self::get_raw(o.header().as_ptr()) }
    }

    pub(crate) unsafe fn get_raw(o: *mut ObjectHeader) -> *mut RegionTrace {
        debug_assert_eq!((*o).class(), RegionMd::Iso);
        let r = (*o).get_region();
        debug_assert!(Self::is_trace_region(r));
        r.cast()
    }

    #[inline(always)]
    pub(crate) fn as_object(&self) -> *mut ObjectHeader {
        &self.base.header as *const ObjectHeader as *mut ObjectHeader
    }

    /// Creates a new region whose iso object holds `value`. Aborts on OOM;
    /// use [`RegionTrace::try_create`] to recover instead.
    pub fn create<T: Collectable>(alloc: &mut Alloc, value: T) -> Gc<T> {
        match Self::try_create(alloc, value) {
            Ok(o) => o,
            Err(_) => oom_abort(),
        }
    }

    pub fn try_create<T: Collectable>(alloc: &mut Alloc, value: T) -> Result<Gc<T>, T> {
        let desc = T::descriptor();
        let o = alloc.alloc(desc.size) as *mut ObjectHeader;
        if o.is_null() {
            return Err(value);
        }
        debug_assert!(is_aligned(o as usize, MIN_ALLOCATION));

        let p = alloc.alloc(size_of::<RegionTrace>());
        if p.is_null() {
            alloc.dealloc(o as *mut u8, desc.size);
            return Err(value);
        }

        unsafe {
            let reg = p as *mut RegionTrace;
            reg.write(RegionTrace {
                base: RegionBase::new(Self::desc()),
                next_not_root: null_mut(),
                last_not_root: null_mut(),
                current_memory_used: 0,
                previous_memory_used: 0,
            });
            (*reg).next_not_root = (*reg).as_object();
            (*reg).last_not_root = (*reg).as_object();
            // Primary ring is just the iso; the iso's region pointer closes
            // the circle.
            (*reg).base.header.init_next(o);
            (*reg).use_memory(desc.size);

            (*o).set_descriptor(desc);
            (*o).payload().cast::<T>().write(value);
            (*o).init_iso();
            (*o).set_region(reg.cast());

            Ok(Gc::from_header(o))
        }
    }

    /// Allocates `value` into the region of the iso `in_`, adding it to the
    /// matching ring. Aborts on OOM; use [`RegionTrace::try_alloc`] to
    /// recover instead.
    pub fn alloc<T: Collectable, U: Collectable>(alloc: &mut Alloc, in_: Gc<U>, value: T) -> Gc<T> {
        match Self::try_alloc(alloc, in_, value) {
            Ok(o) => o,
            Err(_) => oom_abort(),
        }
    }

    pub fn try_alloc<T: Collectable, U: Collectable>(
        alloc: &mut Alloc,
        in_: Gc<U>,
        value: T,
    ) -> Result<Gc<T>, T> {
        let reg = Self::get(in_);
        let desc = T::descriptor();
        let o = alloc.alloc(desc.size) as *mut ObjectHeader;
        if o.is_null() {
            return Err(value);
        }
        debug_assert!(is_aligned(o as usize, MIN_ALLOCATION));

        unsafe {
            (*o).set_descriptor(desc);
            (*o).payload().cast::<T>().write(value);

            (*reg).append(o);
            (*reg).use_memory(desc.size);

            Ok(Gc::from_header(o))
        }
    }

    /// Records the shared object `o` (an immutable or a cown) in the
    /// remembered set of `into`'s region. `TRANSFER` donates a reference
    /// count the caller already holds; otherwise a fresh one is acquired.
    /// Pointers into the interior of a frozen SCC are normalised to their
    /// representative first.
    pub fn insert<const TRANSFER: bool, T: Collectable, U: Collectable>(
        alloc: &mut Alloc,
        into: Gc<U>,
        o: Gc<T>,
    ) {
        let reg = Self::get(into);
        unsafe {
            let mut o = o.header().as_ptr();
            debug_assert!(matches!(
                (*o).class(),
                RegionMd::Rc | RegionMd::Cown | RegionMd::SccPtr
            ));
            if (*o).class() == RegionMd::SccPtr {
                o = (*o).immutable();
            }
            (*reg).base.rset.insert::<TRANSFER>(alloc, o);
        }
    }

    /// Hands out a stable external handle for `o`, an object inside the
    /// region of the iso `in_`. The handle is revoked when `o` is collected
    /// or the region is released.
    pub fn external_ref<T: Collectable, U: Collectable>(in_: Gc<U>, o: Gc<T>) -> Arc<ExternalRef> {
        let reg = Self::get(in_);
        unsafe { (*reg).base.ext_refs.create(o.header().as_ptr()) }
    }

    /// Merges `o`'s region into `into`'s region. The two regions must be
    /// distinct and both be trace regions; `o` stops being an iso and
    /// becomes an ordinary interior object of the combined region.
    pub fn merge<T: Collectable, U: Collectable>(alloc: &mut Alloc, into: Gc<U>, o: Gc<T>) {
        let o = o.header().as_ptr();
        unsafe {
            debug_assert_eq!((*o).class(), RegionMd::Iso);
            let reg = Self::get(into);
            let other = (*o).get_region();
            assert!(reg as *mut RegionBase != other);

            if Self::is_trace_region(other) {
                (*reg).merge_internal(o, other.cast());
            } else {
                eprintln!("FATAL: merge of mismatched region kinds");
                std::process::abort();
            }

            let other = other.cast::<RegionTrace>();
            (*reg).base.ext_refs.merge(&mut (*other).base.ext_refs);
            (*reg).base.rset.merge(alloc, &mut (*other).base.rset);

            // The donated region's metadata object is no longer reachable
            // from anything.
            core::ptr::drop_in_place(other);
            alloc.dealloc(other as *mut u8, size_of::<RegionTrace>());
        }
    }

    /// Makes `next` the iso of the region currently rooted at `prev`,
    /// demoting `prev` to an ordinary interior object. `next` must already
    /// be owned by the same region.
    pub fn swap_root<T: Collectable, U: Collectable>(prev: Gc<T>, next: Gc<U>) {
        let prev = prev.header().as_ptr();
        let next = next.header().as_ptr();
        assert!(prev != next);
        unsafe {
            debug_assert_eq!((*prev).class(), RegionMd::Iso);
            debug_assert!(matches!((*next).class(), RegionMd::Unmarked));
            let reg = Self::get_raw(prev);
            debug_assert!((*prev).get_region() != next as *mut RegionBase);
            (*reg).swap_root_internal(prev, next);
        }
    }

    /// Collects the region rooted at the iso `o`: everything unreachable
    /// from `o` is finalised and reclaimed, and any subregion found hanging
    /// off a dead object is released along with its own subregions, to a
    /// fixpoint.
    pub fn gc<T: Collectable>(alloc: &mut Alloc, o: Gc<T>) {
        let o = o.header().as_ptr();
        unsafe {
            if VERBOSE {
                eprintln!("region gc: start, iso {:p}", o);
            }
            let reg = Self::get_raw(o);

            let mut f = ObjectStack::with_capacity(128);
            let mut collect = ObjectStack::new();
            let mut marked = 0;

            (*reg).mark(o, &mut f, &mut marked);
            (*reg).sweep(alloc, o, &mut f, &mut collect, marked);

            // Unreachable subregions surfaced by the sweep. Each release may
            // surface more of them.
            while let Some(sub) = collect.pop() {
                let sub = sub.as_ptr();
                debug_assert_eq!((*sub).class(), RegionMd::Iso);
                debug_assert!((*sub).get_region() != reg as *mut RegionBase);
                if VERBOSE {
                    eprintln!("region gc: releasing unreachable subregion {:p}", sub);
                }
                release_region(alloc, sub, &mut f, &mut collect);
            }

            if VERBOSE {
                eprintln!(
                    "region gc: done, live {}",
                    HumanBytes((*reg).current_memory_used)
                );
            }
        }
    }

    /// Releases the whole region rooted at the iso `o`, then every subregion
    /// reachable from it, without tracing anything first.
    pub fn release<T: Collectable>(alloc: &mut Alloc, o: Gc<T>) {
        let o = o.header().as_ptr();
        unsafe {
            let mut f = ObjectStack::with_capacity(128);
            let mut collect = ObjectStack::new();
            release_region(alloc, o, &mut f, &mut collect);
            while let Some(sub) = collect.pop() {
                release_region(alloc, sub.as_ptr(), &mut f, &mut collect);
            }
        }
    }

    /// Whether the region has grown enough since its last collection for
    /// another one to be worthwhile.
    pub fn needs_gc<T: Collectable>(o: Gc<T>) -> bool {
        let reg = Self::get(o);
        unsafe {
            (*reg).current_memory_used
                > GC_GROWTH_FACTOR * sizeclass_to_size((*reg).previous_memory_used)
        }
    }

    /// Live bytes allocated into the region since its last sweep.
    pub fn memory_used(&self) -> usize {
        self.current_memory_used
    }

    #[inline(always)]
    fn use_memory(&mut self, size: usize) {
        self.current_memory_used += size;
    }

    unsafe fn append(&mut self, o: *mut ObjectHeader) {
        self.append_chain(o, o);
    }

    /// Splices the chain `hd..=tl` into the ring matching `hd`'s finaliser
    /// class, right after the sentinel. A single object is a chain of one.
    unsafe fn append_chain(&mut self, hd: *mut ObjectHeader, tl: *mut ObjectHeader) {
        let hdr = self.as_object();
        let p = (*hdr).get_next();

        if (*hd).needs_finaliser_ring() == (*p).needs_finaliser_ring() {
            (*tl).init_next(p);
            (*hdr).set_next(hd);
        } else {
            (*tl).init_next(self.next_not_root);
            self.next_not_root = hd;

            if self.last_not_root == hdr {
                self.last_not_root = tl;
            }
        }
    }

    unsafe fn merge_internal(&mut self, o: *mut ObjectHeader, other: *mut RegionTrace) {
        debug_assert!((*o).get_region() == other as *mut RegionBase);
        let other_hdr = (*other).as_object();

        // Primary ring: the donated iso is its last node, so it is the tail
        // of the chain and its re-link demotes it to an interior object.
        let head = (*other_hdr).get_next();
        if head != other_hdr {
            self.append_chain(head, o);
        }

        let head = (*other).next_not_root;
        if head != other_hdr {
            self.append_chain(head, (*other).last_not_root);
        }

        self.current_memory_used += (*other).current_memory_used;
        self.previous_memory_used = size_to_sizeclass(
            sizeclass_to_size(self.previous_memory_used)
                + sizeclass_to_size((*other).previous_memory_used),
        );
    }

    unsafe fn swap_root_internal(&mut self, oroot: *mut ObjectHeader, nroot: *mut ObjectHeader) {
        debug_assert!(self.debug_is_in_region(nroot));
        let hdr = self.as_object();
        let mut oroot = oroot;

        // If the new root needs the other ring, the rings trade places, so
        // that the ring holding the iso is again the primary one.
        if (*oroot).needs_finaliser_ring() != (*nroot).needs_finaliser_ring() {
            debug_assert!((*self.last_not_root).get_next_any_mark() == hdr);

            let t = (*hdr).get_next();
            (*hdr).set_next(self.next_not_root);
            self.next_not_root = t;

            let t = self.last_not_root;
            self.last_not_root = oroot;
            (*oroot).init_next(hdr);
            oroot = t;
        }

        // The rings may already have left nroot in the iso position.
        if oroot != nroot {
            debug_assert!(oroot != hdr);
            debug_assert!((*oroot).get_next_any_mark() == hdr);
            debug_assert!((*nroot).get_next() != hdr);

            let x = (*hdr).get_next();
            let y = (*nroot).get_next();

            (*oroot).init_next(x);
            (*hdr).set_next(y);
        }

        (*nroot).init_iso();
        (*nroot).set_region(self as *mut RegionTrace as *mut RegionBase);
    }

    /// Marks everything reachable from the iso `o` without leaving the
    /// region: iso fields are subregion roots and stay untouched, shared
    /// objects are recorded in the remembered set's mark state instead.
    unsafe fn mark(
        &mut self,
        o: *mut ObjectHeader,
        dfs: &mut ObjectStack,
        marked: &mut usize,
    ) {
        (*o).trace(dfs);
        while let Some(p) = dfs.pop() {
            let p = p.as_ptr();
            match (*p).class() {
                RegionMd::Iso | RegionMd::Marked => {}
                RegionMd::Unmarked => {
                    (*p).mark();
                    (*p).trace(dfs);
                }
                RegionMd::SccPtr => {
                    let root = (*p).immutable();
                    self.base.rset.mark(root, marked);
                }
                RegionMd::Rc | RegionMd::Cown => {
                    self.base.rset.mark(p, marked);
                }
            }
        }
    }

    /// Reclaims every unmarked object on both rings, then lets the
    /// remembered set drop whatever marking never reached. Re-derives
    /// `current_memory_used` from the survivors along the way.
    unsafe fn sweep(
        &mut self,
        alloc: &mut Alloc,
        o: *mut ObjectHeader,
        f: &mut ObjectStack,
        collect: &mut ObjectStack,
        marked: usize,
    ) {
        self.current_memory_used = 0;
        self.sweep_ring::<true>(alloc, o, f, collect);
        self.sweep_ring::<false>(alloc, o, f, collect);
        self.base.rset.sweep_set(alloc, marked);
        self.previous_memory_used = size_to_sizeclass(self.current_memory_used);
    }

    /// Sweeps one ring. `FINALISER` selects the ring holding objects that
    /// need sweep-time attention; those are finalised first and freed only
    /// after the whole ring has been walked, so a finaliser still sees every
    /// dying sibling intact. The other ring frees immediately.
    unsafe fn sweep_ring<const FINALISER: bool>(
        &mut self,
        alloc: &mut Alloc,
        o: *mut ObjectHeader,
        f: &mut ObjectStack,
        collect: &mut ObjectStack,
    ) {
        let hdr = self.as_object();
        let in_secondary = if FINALISER {
            !(*o).needs_finaliser_ring()
        } else {
            (*o).needs_finaliser_ring()
        };

        let mut prev = hdr;
        let mut p = if in_secondary {
            self.next_not_root
        } else {
            (*hdr).get_next()
        };
        let mut gc: *mut ObjectHeader = null_mut();

        while p != hdr {
            match (*p).class() {
                RegionMd::Iso => {
                    // The iso is the last node of its ring and outlives the
                    // sweep; it is never finalised here.
                    debug_assert!(p == o);
                    debug_assert!((*p).get_next_any_mark() == hdr);
                    debug_assert!((*p).get_region() == hdr as *mut RegionBase);
                    self.use_memory((*p).size());
                    p = hdr;
                }
                RegionMd::Marked => {
                    self.use_memory((*p).size());
                    (*p).unmark();
                    prev = p;
                    p = (*p).get_next();
                }
                RegionMd::Unmarked => {
                    let q = (*p).get_next();

                    if FINALISER {
                        (*p).find_iso_fields(o, f, collect);
                        if (*p).has_finaliser() {
                            (*p).finalise();
                        }
                        // Defer the free until the ring walk is over.
                        (*p).set_next(gc);
                        gc = p;
                    } else {
                        debug_assert!(!(*p).has_possibly_iso_fields());
                        if (*p).has_ext_ref() {
                            self.base.ext_refs.erase(p);
                        }
                        (*p).dealloc(alloc);
                    }

                    if prev == hdr && in_secondary {
                        self.next_not_root = q;
                    } else {
                        (*prev).set_next(q);
                    }
                    if in_secondary && self.last_not_root == p {
                        self.last_not_root = prev;
                    }
                    p = q;
                }
                _ => {
                    eprintln!("FATAL: unexpected object state in sweep");
                    std::process::abort();
                }
            }
        }

        if FINALISER {
            let mut p = gc;
            while !p.is_null() {
                let q = (*p).get_next();
                if VERBOSE {
                    eprintln!("region sweep: free {:p} ({})", p, HumanBytes((*p).size()));
                }
                (*p).dealloc(alloc);
                p = q;
            }
        }
    }

    /// Iterates the region's objects. Read-only; must not be used while a
    /// collection is sweeping the rings.
    pub fn iter(&self, kind: IterKind) -> RegionIter<'_> {
        let hdr = self.as_object();
        let q = unsafe { (*hdr).get_next() };
        let ptr = match kind {
            IterKind::NoFinaliser => {
                if !unsafe { (*q).needs_finaliser_ring() } {
                    q
                } else {
                    self.next_not_root
                }
            }
            IterKind::NeedsFinaliser => {
                if unsafe { (*q).needs_finaliser_ring() } {
                    q
                } else {
                    self.next_not_root
                }
            }
            IterKind::Both => q,
        };
        RegionIter {
            reg: self,
            ptr: if ptr == hdr { null_mut() } else { ptr },
            kind,
        }
    }

    pub(crate) unsafe fn debug_is_in_region(&self, o: *mut ObjectHeader) -> bool {
        self.iter(IterKind::Both).any(|p| p.as_ptr() == o)
    }
}

impl RegionRelease for RegionTrace {
    /// Tears down the region as if nothing in it were reachable: the iso's
    /// subregion children go to `collect`, the iso is finalised, a sweep
    /// with nothing marked reclaims everything else, and finally the
    /// metadata object and the iso itself are freed, in that order.
    unsafe fn release_internal(
        this: *mut Self,
        alloc: &mut Alloc,
        o: *mut ObjectHeader,
        f: &mut ObjectStack,
        collect: &mut ObjectStack,
    ) {
        debug_assert_eq!((*o).class(), RegionMd::Iso);
        if VERBOSE {
            eprintln!("region release: iso {:p}", o);
        }

        (*o).find_iso_fields(o, f, collect);
        (*o).finalise();

        (*this).sweep(alloc, o, f, collect, 0);

        core::ptr::drop_in_place(this);
        alloc.dealloc(this as *mut u8, size_of::<RegionTrace>());

        // The sweep never touches the iso; it goes last.
        (*o).dealloc(alloc);
    }
}

pub struct RegionIter<'a> {
    reg: &'a RegionTrace,
    ptr: *mut ObjectHeader,
    kind: IterKind,
}

impl<'a> Iterator for RegionIter<'a> {
    type Item = std::ptr::NonNull<ObjectHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = std::ptr::NonNull::new(self.ptr)?;
        let hdr = self.reg.as_object();
        let q = unsafe { (*self.ptr).get_next_any_mark() };
        if q != hdr {
            self.ptr = q;
        } else if self.kind == IterKind::Both
            && self.ptr != self.reg.last_not_root
            && self.reg.next_not_root != hdr
        {
            // Finished the primary ring with a secondary ring to visit.
            self.ptr = self.reg.next_not_root;
        } else {
            self.ptr = null_mut();
        }
        Some(cur)
    }
}
