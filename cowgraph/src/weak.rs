use std::{
    cell::Cell,
    fmt,
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::{Header, LabelPtr, Pointee, RawShared, Shared, shared::CloneScope};

/// Untyped weak pointer. The target's allocation stays readable while this
/// exists, its value does not.
pub struct RawWeak {
    object: AtomicPtr<Header>,
    label: LabelPtr,
    _unsync: PhantomData<Cell<()>>,
}

impl RawWeak {
    fn new(object: *mut Header, label: &LabelPtr) -> Self {
        if let Some(object) = NonNull::new(object) {
            // SAFETY: the caller holds the allocation
            unsafe { object.as_ref() }.inc_weak();
        }
        Self {
            object: AtomicPtr::new(object),
            label: label.clone(),
            _unsync: PhantomData,
        }
    }

    #[inline]
    pub fn target(&self) -> *mut Header {
        self.object.load(Ordering::Acquire)
    }

    #[inline]
    pub fn label(&self) -> &LabelPtr {
        &self.label
    }

    /// Whether the target still has shared owners.
    pub fn alive(&self) -> bool {
        // SAFETY: our weak count keeps the header readable
        NonNull::new(self.target()).is_some_and(|ptr| unsafe { ptr.as_ref() }.is_alive())
    }

    fn replace_target(&self, next: *mut Header) {
        if let Some(next) = NonNull::new(next) {
            // SAFETY: the caller holds the allocation
            unsafe { next.as_ref() }.inc_weak();
        }
        let old = self.object.swap(next, Ordering::AcqRel);
        if let Some(old) = NonNull::new(old) {
            // SAFETY: we owned this weak count
            unsafe { Header::dec_weak(old) };
        }
    }

    pub(crate) fn release(&self) {
        self.replace_target(ptr::null_mut());
    }
}

impl Clone for RawWeak {
    fn clone(&self) -> Self {
        if !self.target().is_null()
            && let Some(label) = CloneScope::label()
        {
            return Self::new(self.target(), &label);
        }
        Self::new(self.target(), &self.label)
    }
}

impl Drop for RawWeak {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for RawWeak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawWeak")
            .field("object", &self.target())
            .field("label", &self.label)
            .finish()
    }
}

/// Weak copy-on-write pointer.
///
/// Never keeps its target alive. [`Weak::pull`] resolves the target for this
/// pointer's label without copying and hands out a temporary owner.
pub struct Weak<T: ?Sized + Pointee> {
    raw: RawWeak,
    _marker: PhantomData<fn() -> *const T>,
}

impl<T: ?Sized + Pointee> Weak<T> {
    pub fn nil() -> Self {
        Self::from_raw(RawWeak::new(ptr::null_mut(), &LabelPtr::root()))
    }

    pub fn new(shared: &Shared<T>) -> Self {
        Self::from_raw(RawWeak::new(shared.raw().target(), shared.label()))
    }

    fn from_raw(raw: RawWeak) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn raw(&self) -> &RawWeak {
        &self.raw
    }

    #[inline]
    pub fn label(&self) -> &LabelPtr {
        self.raw.label()
    }

    /// Whether the target is still alive.
    #[inline]
    pub fn query(&self) -> bool {
        self.raw.alive()
    }

    /// Upgrade to an owning pointer to the object this label currently
    /// sees, or `None` once the target is gone.
    pub fn pull(&self) -> Option<Shared<T>> {
        let object = NonNull::new(self.raw.target())?;
        if !self.raw.alive() {
            return None;
        }
        let label = self.raw.label.pull_forward();
        if !label.ptr_eq(&self.raw.label) {
            self.raw.label.repoint(&label);
        }
        // only taken if the resolved object is still alive
        let resolved = label.map_pull(object)?;
        if resolved != object {
            self.raw.replace_target(resolved.as_ptr());
        }
        // SAFETY: map_pull handed us a count
        let raw = unsafe { RawShared::adopt(resolved, label) };
        Some(Shared::from_raw(raw))
    }

    pub fn assign(&mut self, other: &Weak<T>) {
        self.raw.label.replace(&other.raw.label);
        self.raw.replace_target(other.raw.target());
    }

    pub fn assign_shared(&mut self, other: &Shared<T>) {
        self.raw.label.replace(other.label());
        self.raw.replace_target(other.raw().target());
    }

    pub fn take(&mut self) -> Weak<T> {
        mem::replace(self, Weak::nil())
    }
}

impl<T: ?Sized + Pointee> Clone for Weak<T> {
    fn clone(&self) -> Self {
        Self::from_raw(self.raw.clone())
    }
}

impl<T: ?Sized + Pointee> Default for Weak<T> {
    fn default() -> Self {
        Self::nil()
    }
}

impl<T: ?Sized + Pointee> From<&Shared<T>> for Weak<T> {
    fn from(shared: &Shared<T>) -> Self {
        Self::new(shared)
    }
}

impl<T: ?Sized + Pointee> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Weak")
            .field("object", &self.raw.target())
            .field("alive", &self.query())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Counters, Node, serial};

    #[test]
    fn weak_does_not_keep_the_target_alive() {
        let _guard = serial();
        let counters = Counters::new();
        let b = Shared::new(Node::new(1, &counters));
        let w = Weak::new(&b);
        assert!(w.query());
        assert_eq!(b.shared_count(), 1);

        drop(b);
        assert_eq!(counters.drops(), 1);
        assert!(!w.query());
        assert!(w.pull().is_none());
        assert!(w.pull().is_none(), "repeated pulls stay absent");
    }

    #[test]
    fn pull_hands_out_a_temporary_owner() {
        let _guard = serial();
        let counters = Counters::new();
        let b = Shared::new(Node::new(5, &counters));
        let w = b.downgrade();
        {
            let owner = w.pull().expect("target is alive");
            assert!(owner.ptr_eq(&b));
            assert_eq!(b.shared_count(), 2);
            assert_eq!(*owner.read().unwrap().value.lock(), 5);
        }
        assert_eq!(b.shared_count(), 1);
    }

    #[test]
    fn pull_sees_the_labels_copy_without_copying() {
        let _guard = serial();
        let counters = Counters::new();
        let b = Shared::new(Node::new(1, &counters));
        let keep = b.clone();
        b.freeze();

        let label = LabelPtr::spawn();
        let mine: Shared<Node> = Shared::from_raw(RawShared::new(b.header_ptr().unwrap(), &label));
        let w = mine.downgrade();
        assert!(w.pull().unwrap().ptr_eq(&b), "nothing memoized yet");
        assert_eq!(counters.copies(), 0);

        *mine.pull().unwrap().value.lock() = 2;
        assert_eq!(counters.copies(), 1);
        let seen = w.pull().unwrap();
        assert!(seen.ptr_eq(&mine));
        assert_eq!(*seen.read().unwrap().value.lock(), 2);
        assert_eq!(counters.copies(), 1);
        drop(keep);
    }

    #[test]
    fn assignment_and_nil() {
        let _guard = serial();
        let counters = Counters::new();
        let a = Shared::new(Node::new(1, &counters));
        let b = Shared::new(Node::new(2, &counters));
        let mut w = Weak::<Node>::nil();
        assert!(!w.query());
        assert!(w.pull().is_none());

        w.assign_shared(&a);
        assert!(w.pull().unwrap().ptr_eq(&a));
        let other = Weak::from(&b);
        w.assign(&other);
        assert!(w.pull().unwrap().ptr_eq(&b));

        let taken = w.take();
        assert!(!w.query());
        assert!(taken.query());
        let copy = taken.clone();
        drop(b);
        assert!(!copy.query());
        assert!(!other.query());
    }
}
