use std::{
    any::TypeId,
    cell::UnsafeCell,
    fmt,
    mem::ManuallyDrop,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU16, AtomicUsize, Ordering},
};

use bitflags::bitflags;
use log::trace;

use crate::{LabelPtr, Object, collector, shared::CloneScope};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct HeaderFlags: u16 {
        const FROZEN = 1 << 0;
        // frozen while exactly one shared pointer existed
        const FROZEN_UNIQUE = 1 << 1;
        // sitting in the collector's candidate buffer
        const BUFFERED = 1 << 2;
        const GRAY = 1 << 3;
        const WHITE = 1 << 4;
        const PURPLE = 1 << 5;
        // claimed by a collection round, edges into it are not counted down
        const COLLECTED = 1 << 6;
        const DESTROYED = 1 << 7;
    }
}

impl HeaderFlags {
    const COLORS: HeaderFlags = HeaderFlags::GRAY
        .union(HeaderFlags::WHITE)
        .union(HeaderFlags::PURPLE);
}

/// Trial-deletion colour of an object, see [`crate::collector`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Color {
    /// Live, or not yet visited.
    Black,
    /// Visited by the mark phase.
    Gray,
    /// Garbage candidate.
    White,
    /// Possible cycle root.
    Purple,
}

impl Color {
    fn bits(self) -> HeaderFlags {
        match self {
            Color::Black => HeaderFlags::empty(),
            Color::Gray => HeaderFlags::GRAY,
            Color::White => HeaderFlags::WHITE,
            Color::Purple => HeaderFlags::PURPLE,
        }
    }
}

// ── Type-erased operations ────────────────────────────────────────────

/// Per-type operations, instantiated once per [`Object`] type.
pub(crate) struct VTable {
    type_id: fn() -> TypeId,
    type_name: fn() -> &'static str,
    object: unsafe fn(NonNull<Header>) -> NonNull<dyn Object>,
    copy: unsafe fn(NonNull<Header>, &LabelPtr) -> NonNull<Header>,
    drop_value: unsafe fn(NonNull<Header>),
    dealloc: unsafe fn(NonNull<Header>),
}

// ── Header ────────────────────────────────────────────────────────────

/// Bookkeeping shared by every graph node.
///
/// `weak` carries one implicit count for as long as the value has not been
/// destroyed, so the allocation outlives the value until the last weak
/// reference (weak pointer, memo key or collector candidate) is gone.
#[repr(C)]
pub struct Header {
    shared: AtomicUsize,
    weak: AtomicUsize,
    reachable: AtomicUsize,
    flags: AtomicU16,
    // weak back-edge to the label that created the object, null for root
    label: AtomicPtr<Header>,
    vtable: &'static VTable,
}

#[repr(C)]
pub(crate) struct ObjectBox<T> {
    header: Header,
    value: UnsafeCell<ManuallyDrop<T>>,
}

impl<T: Object> ObjectBox<T> {
    const VTABLE: VTable = VTable {
        type_id: TypeId::of::<T>,
        type_name: std::any::type_name::<T>,
        object: Self::object,
        copy: Self::copy,
        drop_value: Self::drop_value,
        dealloc: Self::dealloc,
    };

    /// Allocate `value` with a shared count of zero, owned by `label`.
    pub(crate) fn allocate(value: T, label: &LabelPtr) -> NonNull<Header> {
        let boxed = Box::new(ObjectBox {
            header: Header::new(&Self::VTABLE, label),
            value: UnsafeCell::new(ManuallyDrop::new(value)),
        });
        NonNull::from(Box::leak(boxed)).cast()
    }

    /// # Safety
    /// `header` must head a live allocation.
    pub(crate) unsafe fn project(header: NonNull<Header>) -> Option<NonNull<T>> {
        // SAFETY: caller guarantees the header is readable
        let vtable = unsafe { header.as_ref() }.vtable;
        if (vtable.type_id)() != TypeId::of::<T>() {
            return None;
        }
        // SAFETY: type checked above
        Some(unsafe { Self::value_ptr(header) })
    }

    unsafe fn value_ptr(header: NonNull<Header>) -> NonNull<T> {
        let boxed = header.cast::<ObjectBox<T>>();
        // SAFETY: the header is the first field of a repr(C) ObjectBox<T>
        let value = unsafe { (*boxed.as_ptr()).value.get() };
        // SAFETY: UnsafeCell never hands out null, ManuallyDrop is transparent
        unsafe { NonNull::new_unchecked(value.cast::<T>()) }
    }

    unsafe fn object(header: NonNull<Header>) -> NonNull<dyn Object> {
        // SAFETY: forwarded from the vtable caller
        let value: NonNull<dyn Object> = unsafe { Self::value_ptr(header) };
        value
    }

    unsafe fn copy(header: NonNull<Header>, label: &LabelPtr) -> NonNull<Header> {
        // SAFETY: the source is alive while a pointer resolves through it
        let value = unsafe { Self::value_ptr(header).as_ref() };
        let copied = {
            let _scope = CloneScope::enter(label);
            value.copy_object()
        };
        Self::allocate(copied, label)
    }

    unsafe fn drop_value(header: NonNull<Header>) {
        // SAFETY: called exactly once, guarded by the DESTROYED flag
        unsafe { ManuallyDrop::drop(&mut *Self::value_ptr(header).cast::<ManuallyDrop<T>>().as_ptr()) }
    }

    unsafe fn dealloc(header: NonNull<Header>) {
        // SAFETY: the last weak reference is gone, value already dropped
        drop(unsafe { Box::from_raw(header.cast::<ObjectBox<T>>().as_ptr()) });
    }
}

impl Header {
    fn new(vtable: &'static VTable, label: &LabelPtr) -> Self {
        let back = label.weak_target();
        if let Some(back) = NonNull::new(back) {
            // SAFETY: the label is held by the caller
            unsafe { back.as_ref() }.inc_weak();
        }
        Self {
            shared: AtomicUsize::new(0),
            weak: AtomicUsize::new(1),
            reachable: AtomicUsize::new(0),
            flags: AtomicU16::new(0),
            label: AtomicPtr::new(back),
            vtable,
        }
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        (self.vtable.type_name)()
    }

    #[inline]
    pub fn shared_count(&self) -> usize {
        self.shared.load(Ordering::Acquire)
    }

    /// Weak count, including the implicit count held while alive.
    #[inline]
    pub fn weak_count(&self) -> usize {
        self.weak.load(Ordering::Acquire)
    }

    #[inline]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn insert_flags(&self, flags: HeaderFlags) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    #[inline]
    pub(crate) fn remove_flags(&self, flags: HeaderFlags) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.flags().contains(HeaderFlags::FROZEN)
    }

    #[inline]
    pub fn is_frozen_unique(&self) -> bool {
        self.flags()
            .contains(HeaderFlags::FROZEN | HeaderFlags::FROZEN_UNIQUE)
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.flags().contains(HeaderFlags::DESTROYED)
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.shared_count() > 0 && !self.is_destroyed()
    }

    /// Exactly one shared owner and no weak observers.
    ///
    /// The collector's candidate pin is not an observer. The flag is read
    /// before the count so a racing buffer insert can only make this false.
    pub fn is_unique(&self) -> bool {
        let pinned = self.flags().contains(HeaderFlags::BUFFERED) as usize;
        self.shared_count() == 1 && self.weak_count() == 1 + pinned
    }

    /// Freeze the object, returns false if it already was.
    pub fn freeze(&self) -> bool {
        let unique = self.shared_count() == 1;
        let result = self.flags.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            let flags = HeaderFlags::from_bits_truncate(bits);
            if flags.contains(HeaderFlags::FROZEN) {
                return None;
            }
            let mut next = flags | HeaderFlags::FROZEN;
            if unique {
                next |= HeaderFlags::FROZEN_UNIQUE;
            }
            Some(next.bits())
        });
        result.is_ok()
    }

    pub fn thaw(&self) {
        self.remove_flags(HeaderFlags::FROZEN | HeaderFlags::FROZEN_UNIQUE);
    }

    pub fn color(&self) -> Color {
        let flags = self.flags();
        if flags.contains(HeaderFlags::GRAY) {
            Color::Gray
        } else if flags.contains(HeaderFlags::WHITE) {
            Color::White
        } else if flags.contains(HeaderFlags::PURPLE) {
            Color::Purple
        } else {
            Color::Black
        }
    }

    pub(crate) fn set_color(&self, color: Color) {
        let _ = self.flags.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            let flags = HeaderFlags::from_bits_truncate(bits);
            Some(((flags - HeaderFlags::COLORS) | color.bits()).bits())
        });
    }

    // ── counts ────────────────────────────────────────────────────────

    #[inline]
    pub fn inc_shared(&self) {
        self.shared.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a shared reference only if the object is still alive.
    pub(crate) fn try_inc_shared(&self) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.shared
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then_some(count + 1)
            })
            .is_ok()
    }

    /// Drop a shared reference that is known not to be the last one.
    pub(crate) fn dec_shared_retained(&self) {
        let old = self.shared.fetch_sub(1, Ordering::Release);
        if old <= 1 {
            fatal!("retained decrement released the last reference to {}", self.type_name());
        }
    }

    /// Drop a shared reference, destroying the value on the last one.
    ///
    /// A decrement that leaves the count above zero may have cut the last
    /// external edge into a cycle, so the object becomes a collector
    /// candidate.
    ///
    /// # Safety
    /// `ptr` must head a live allocation and the caller must own one shared
    /// reference to it.
    pub unsafe fn dec_shared(ptr: NonNull<Header>) {
        // SAFETY: caller owns a reference
        let header = unsafe { ptr.as_ref() };
        if header.flags().contains(HeaderFlags::COLLECTED) {
            return;
        }
        // pin the allocation until this call is done with it
        header.inc_weak();
        match header.shared.fetch_sub(1, Ordering::AcqRel) {
            0 => fatal!("shared count underflow on {}", header.type_name()),
            // SAFETY: we released the last shared reference
            1 => unsafe { Header::destroy(ptr) },
            _ => {
                if collector::possible_root(ptr) {
                    // the candidate buffer took over the pin
                    return;
                }
            }
        }
        // SAFETY: releases the pin taken above
        unsafe { Header::dec_weak(ptr) }
    }

    #[inline]
    pub fn inc_weak(&self) {
        self.weak.fetch_add(1, Ordering::Relaxed);
    }

    /// # Safety
    /// `ptr` must head an allocation the caller holds a weak reference to.
    pub unsafe fn dec_weak(ptr: NonNull<Header>) {
        // SAFETY: caller holds a weak reference
        let header = unsafe { ptr.as_ref() };
        match header.weak.fetch_sub(1, Ordering::AcqRel) {
            0 => fatal!("weak count underflow on {}", header.type_name()),
            1 => {
                let dealloc = header.vtable.dealloc;
                // SAFETY: nothing refers to the allocation any more
                unsafe { dealloc(ptr) }
            }
            _ => (),
        }
    }

    #[inline]
    pub fn shared_reachable_count(&self) -> usize {
        self.reachable.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_shared_reachable(&self) {
        self.reachable
            .store(self.shared_count(), Ordering::Relaxed);
    }

    pub(crate) fn inc_shared_reachable(&self) {
        self.reachable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_shared_reachable(&self) {
        let old = self.reachable.fetch_sub(1, Ordering::Relaxed);
        if old == 0 {
            fatal!("reachable count underflow on {}", self.type_name());
        }
    }

    // ── lifecycle ─────────────────────────────────────────────────────

    /// # Safety
    /// Must be called once, when the last shared reference is gone.
    pub(crate) unsafe fn destroy(ptr: NonNull<Header>) {
        // SAFETY: the implicit weak count keeps the allocation alive
        let header = unsafe { ptr.as_ref() };
        if header
            .insert_flags(HeaderFlags::DESTROYED)
            .contains(HeaderFlags::DESTROYED)
        {
            fatal!("{} destroyed twice", header.type_name());
        }
        trace!("destroying {} at {:p}", header.type_name(), ptr);
        let drop_value = header.vtable.drop_value;
        // SAFETY: guarded by the DESTROYED flag
        unsafe { drop_value(ptr) };
        header.release_label();
        // SAFETY: releases the implicit weak count
        unsafe { Header::dec_weak(ptr) }
    }

    /// Destroy an object claimed by a collection round.
    ///
    /// # Safety
    /// `ptr` must be flagged COLLECTED and not yet destroyed.
    pub(crate) unsafe fn destroy_collected(ptr: NonNull<Header>) {
        // SAFETY: the round pins every collected allocation
        unsafe { ptr.as_ref() }.shared.store(0, Ordering::Release);
        // SAFETY: forwarded
        unsafe { Header::destroy(ptr) }
    }

    /// Destroy a freshly allocated object that was never handed out.
    ///
    /// # Safety
    /// `ptr` must have a shared count of zero and no other holders.
    pub(crate) unsafe fn discard(ptr: NonNull<Header>) {
        // SAFETY: forwarded
        let header = unsafe { ptr.as_ref() };
        header.inc_shared();
        // SAFETY: we own the only reference
        unsafe { Header::dec_shared(ptr) }
    }

    /// # Safety
    /// `ptr` must head a live, not destroyed allocation.
    pub(crate) unsafe fn object<'a>(ptr: NonNull<Header>) -> &'a dyn Object {
        // SAFETY: forwarded
        unsafe { Self::object_ptr(ptr).as_ref() }
    }

    /// # Safety
    /// `ptr` must head a live allocation.
    pub(crate) unsafe fn object_ptr(ptr: NonNull<Header>) -> NonNull<dyn Object> {
        // SAFETY: forwarded
        let object = unsafe { ptr.as_ref() }.vtable.object;
        // SAFETY: forwarded
        unsafe { object(ptr) }
    }

    /// Copy the object for `label`, the result has a shared count of zero.
    ///
    /// # Safety
    /// `ptr` must head a live allocation.
    pub(crate) unsafe fn copy(ptr: NonNull<Header>, label: &LabelPtr) -> NonNull<Header> {
        // SAFETY: forwarded
        let header = unsafe { ptr.as_ref() };
        trace!("copying {} at {:p}", header.type_name(), ptr);
        let copy = header.vtable.copy;
        // SAFETY: forwarded
        unsafe { copy(ptr, label) }
    }

    /// Reuse a uniquely owned frozen object as `label`'s own copy.
    ///
    /// # Safety
    /// `ptr` must be live and `is_unique()` must hold while the caller holds
    /// `label`'s memo write lock, so no reader can take a reference meanwhile.
    pub(crate) unsafe fn recycle(ptr: NonNull<Header>, label: &LabelPtr) {
        // SAFETY: forwarded
        let header = unsafe { ptr.as_ref() };
        trace!("recycling {} at {:p}", header.type_name(), ptr);
        header.thaw();
        header.set_label(label);
        // SAFETY: the caller is the only owner, so no other reference exists
        unsafe { (*Self::object_ptr(ptr).as_ptr()).recycle(label) }
    }

    /// The label that created the object, if both are still alive.
    pub fn label(&self) -> Option<LabelPtr> {
        if self.is_destroyed() {
            return None;
        }
        let ptr = NonNull::new(self.label.load(Ordering::Acquire));
        match ptr {
            None => Some(LabelPtr::root()),
            Some(label) => {
                // SAFETY: our weak count keeps the allocation readable
                if unsafe { label.as_ref() }.try_inc_shared() {
                    // SAFETY: we just took the reference
                    Some(unsafe { LabelPtr::adopt(label) })
                } else {
                    None
                }
            }
        }
    }

    fn set_label(&self, label: &LabelPtr) {
        let next = label.weak_target();
        if let Some(next) = NonNull::new(next) {
            // SAFETY: held by the caller
            unsafe { next.as_ref() }.inc_weak();
        }
        let old = self.label.swap(next, Ordering::AcqRel);
        if let Some(old) = NonNull::new(old) {
            // SAFETY: releases the weak count we held
            unsafe { Header::dec_weak(old) }
        }
    }

    fn release_label(&self) {
        let old = self.label.swap(ptr::null_mut(), Ordering::AcqRel);
        if let Some(old) = NonNull::new(old) {
            // SAFETY: releases the weak count we held
            unsafe { Header::dec_weak(old) }
        }
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("type", &self.type_name())
            .field("shared", &self.shared_count())
            .field("weak", &self.weak_count())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Counters, Node, serial};
    use crate::{Shared, Weak};

    #[test]
    fn destroyed_exactly_once_when_count_reaches_zero() {
        let _guard = serial();
        let counters = Counters::new();
        let ptr = ObjectBox::allocate(Node::new(1, &counters), &LabelPtr::root());
        // SAFETY: test owns the allocation
        let header = unsafe { ptr.as_ref() };

        header.inc_shared();
        header.inc_shared();
        header.inc_shared();
        // SAFETY: we own three references
        unsafe { Header::dec_shared(ptr) };
        unsafe { Header::dec_shared(ptr) };
        assert_eq!(counters.drops(), 0, "object must survive while owned");
        assert_eq!(header.shared_count(), 1);

        // keep the allocation readable past destruction
        header.inc_weak();
        unsafe { Header::dec_shared(ptr) };
        assert_eq!(counters.drops(), 1, "last decrement destroys the value");
        assert!(header.is_destroyed());
        assert!(!header.is_alive());
        unsafe { Header::dec_weak(ptr) };
        assert_eq!(counters.drops(), 1);
    }

    #[test]
    fn unique_means_one_owner_and_no_observers() {
        let _guard = serial();
        let counters = Counters::new();
        let a = Shared::new(Node::new(1, &counters));
        assert!(a.header().unwrap().is_unique());

        let b = a.clone();
        assert!(!a.header().unwrap().is_unique());
        drop(b);
        // the decrement buffered the object, the candidate pin is ignored
        assert!(a.header().unwrap().flags().contains(HeaderFlags::BUFFERED));
        assert!(a.header().unwrap().is_unique());

        let w = Weak::new(&a);
        assert!(!a.header().unwrap().is_unique());
        drop(w);
        assert!(a.header().unwrap().is_unique());
    }

    #[test]
    fn freeze_records_single_owner_only_on_first_freeze() {
        let _guard = serial();
        let counters = Counters::new();
        let a = Shared::new(Node::new(1, &counters));
        let header = a.header().unwrap();

        assert!(header.freeze());
        assert!(header.is_frozen());
        assert!(header.is_frozen_unique());

        let b = a.clone();
        assert!(!header.freeze(), "second freeze is a no-op");
        assert!(header.is_frozen_unique());

        header.thaw();
        assert!(!header.is_frozen());
        assert!(!header.is_frozen_unique());
        assert!(header.freeze());
        assert!(!header.is_frozen_unique(), "two owners at freeze time");
        drop(b);
    }

    #[test]
    fn colors_replace_each_other() {
        let _guard = serial();
        let counters = Counters::new();
        let a = Shared::new(Node::new(1, &counters));
        let header = a.header().unwrap();
        header.freeze();

        assert_eq!(header.color(), Color::Black);
        header.set_color(Color::Gray);
        assert_eq!(header.color(), Color::Gray);
        header.set_color(Color::White);
        assert_eq!(header.color(), Color::White);
        header.set_color(Color::Black);
        assert_eq!(header.color(), Color::Black);
        assert!(header.is_frozen(), "colour changes keep other flags");
    }

    #[test]
    fn objects_remember_their_label() {
        let _guard = serial();
        let counters = Counters::new();
        let label = LabelPtr::spawn();
        let a = Shared::new_in(Node::new(1, &counters), &label);
        let owner = a.header().unwrap().label().unwrap();
        assert!(owner.ptr_eq(&label));

        let b = Shared::new(Node::new(2, &counters));
        assert!(b.header().unwrap().label().unwrap().is_root());
    }

    #[test]
    fn destroyed_objects_have_no_label() {
        let _guard = serial();
        let counters = Counters::new();
        let label = LabelPtr::spawn();
        let a = Shared::new_in(Node::new(1, &counters), &label);
        let w = Weak::new(&a);
        drop(a);
        // SAFETY: the weak pointer keeps the header readable
        let header = unsafe { NonNull::new(w.raw().target()).unwrap().as_ref() };
        assert!(header.is_destroyed());
        assert!(header.label().is_none(), "not the root");
        assert!(label.query());
    }
}
