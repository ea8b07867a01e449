use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
    fmt,
    marker::PhantomData,
    mem,
    ops::Deref,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use log::trace;

use crate::{
    Edge, Header, LabelPtr, Object, Pointee, Visitor, Weak,
    header::ObjectBox,
};

// ── clone scope ───────────────────────────────────────────────────────

thread_local! {
    static CLONE_SCOPE: RefCell<Vec<LabelPtr>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as copying objects for a label. Pointers cloned
/// while a scope is active are rebound to that label.
pub(crate) struct CloneScope {
    _marker: PhantomData<*const ()>,
}

impl CloneScope {
    pub(crate) fn enter(label: &LabelPtr) -> Self {
        CLONE_SCOPE.with_borrow_mut(|scope| scope.push(label.clone()));
        Self {
            _marker: PhantomData,
        }
    }

    pub(crate) fn label() -> Option<LabelPtr> {
        CLONE_SCOPE.with_borrow(|scope| scope.last().cloned())
    }
}

impl Drop for CloneScope {
    fn drop(&mut self) {
        // dropping the label can run destructors, keep it out of the borrow
        let label = CLONE_SCOPE.with_borrow_mut(|scope| scope.pop());
        drop(label);
    }
}

// ── RawShared ─────────────────────────────────────────────────────────

/// Untyped owning pointer: a counted target plus the label resolving it.
///
/// Resolution repoints the pointer through `&self`, so it is `Send` but not
/// `Sync`. Objects keep pointer fields behind a lock.
pub struct RawShared {
    object: AtomicPtr<Header>,
    label: LabelPtr,
    _unsync: PhantomData<Cell<()>>,
}

impl RawShared {
    pub(crate) fn new(object: NonNull<Header>, label: &LabelPtr) -> Self {
        // SAFETY: the caller holds the object alive
        unsafe { object.as_ref() }.inc_shared();
        Self {
            object: AtomicPtr::new(object.as_ptr()),
            label: label.clone(),
            _unsync: PhantomData,
        }
    }

    /// # Safety
    /// The caller transfers one shared count on `object`.
    pub(crate) unsafe fn adopt(object: NonNull<Header>, label: LabelPtr) -> Self {
        Self {
            object: AtomicPtr::new(object.as_ptr()),
            label,
            _unsync: PhantomData,
        }
    }

    pub fn nil() -> Self {
        Self {
            object: AtomicPtr::new(ptr::null_mut()),
            label: LabelPtr::root(),
            _unsync: PhantomData,
        }
    }

    /// The stored target, without any resolution.
    #[inline]
    pub fn target(&self) -> *mut Header {
        self.object.load(Ordering::Acquire)
    }

    /// Only for transient use, resolving the pointer may free the target.
    #[inline]
    pub(crate) fn target_header(&self) -> Option<&Header> {
        // SAFETY: our count keeps the target alive until the next repoint
        NonNull::new(self.target()).map(|ptr| unsafe { ptr.as_ref() })
    }

    #[inline]
    pub fn label(&self) -> &LabelPtr {
        &self.label
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        self.target().is_null()
    }

    /// Point at `next`, dropping the previous target.
    pub(crate) fn replace_object(&self, next: *mut Header) {
        match NonNull::new(next) {
            Some(next) => {
                // SAFETY: the caller holds `next` alive
                unsafe { next.as_ref() }.inc_shared();
                self.adopt_object(next);
            }
            None => self.release(),
        }
    }

    /// Point at `next`, taking over a shared count the caller owns.
    fn adopt_object(&self, next: NonNull<Header>) {
        let old = self.object.swap(next.as_ptr(), Ordering::AcqRel);
        match NonNull::new(old) {
            // SAFETY: the handed over count is still held
            Some(old) if old == next => unsafe { old.as_ref() }.dec_shared_retained(),
            // SAFETY: we owned this count
            Some(old) => unsafe { Header::dec_shared(old) },
            None => (),
        }
    }

    pub(crate) fn release(&self) {
        let old = self.object.swap(ptr::null_mut(), Ordering::AcqRel);
        if let Some(old) = NonNull::new(old) {
            // SAFETY: we owned this count
            unsafe { Header::dec_shared(old) };
        }
    }

    /// Resolve for mutation, copying the target for this pointer's label
    /// if it is frozen.
    pub fn pull(&self) -> Option<NonNull<Header>> {
        let object = NonNull::new(self.target())?;
        // SAFETY: our count keeps it alive
        if !unsafe { object.as_ref() }.is_frozen() {
            return Some(object);
        }
        let label = self.label.get_forward();
        if !label.ptr_eq(&self.label) {
            self.label.repoint(&label);
        }
        let resolved = label.map_get(object);
        self.adopt_object(resolved);
        Some(resolved)
    }

    /// Bring the pointer up to date without copying anything.
    pub fn resolve(&self) -> Option<NonNull<Header>> {
        let object = NonNull::new(self.target())?;
        let label = self.label.pull_forward();
        if !label.ptr_eq(&self.label) {
            self.label.repoint(&label);
        }
        let Some(resolved) = label.map_pull(object) else {
            fatal!("resolved {:p} after its last owner was gone", object);
        };
        self.adopt_object(resolved);
        Some(resolved)
    }

    /// Clone keeping this pointer's label, regardless of any clone scope.
    fn clone_in_place(&self) -> Self {
        match NonNull::new(self.target()) {
            Some(object) => Self::new(object, &self.label),
            None => Self {
                object: AtomicPtr::new(ptr::null_mut()),
                label: self.label.clone(),
                _unsync: PhantomData,
            },
        }
    }
}

impl Clone for RawShared {
    fn clone(&self) -> Self {
        if let Some(object) = NonNull::new(self.target())
            && let Some(label) = CloneScope::label()
        {
            return Self::new(object, &label);
        }
        self.clone_in_place()
    }
}

impl Drop for RawShared {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for RawShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawShared")
            .field("object", &self.target())
            .field("label", &self.label)
            .finish()
    }
}

// ── freezing and finishing ────────────────────────────────────────────

struct Freezer<'a> {
    stack: &'a mut Vec<NonNull<Header>>,
}

impl Visitor for Freezer<'_> {
    fn visit(&mut self, edge: Edge<'_>) {
        match edge {
            Edge::Shared(raw) => self.stack.extend(raw.resolve()),
            Edge::Raw(ptr) => self.stack.push(ptr),
            Edge::Weak(_) | Edge::Label(_) => (),
        }
    }
}

/// Freeze everything reachable from `root` through owning edges, bringing
/// each edge up to date first so the frozen graph is the one its labels see.
pub(crate) fn freeze_graph(root: NonNull<Header>) {
    let mut stack = vec![root];
    let mut frozen = 0usize;
    while let Some(ptr) = stack.pop() {
        // SAFETY: held by the caller or by an edge of a frozen object
        let header = unsafe { ptr.as_ref() };
        if header.is_destroyed() || !header.freeze() {
            continue;
        }
        frozen += 1;
        // SAFETY: alive, checked above
        let object = unsafe { Header::object(ptr) };
        object.trace(&mut Freezer { stack: &mut stack });
    }
    trace!("froze {frozen} objects from {:p}", root);
}

struct Finisher<'a> {
    stack: &'a mut Vec<NonNull<Header>>,
}

impl Visitor for Finisher<'_> {
    fn visit(&mut self, edge: Edge<'_>) {
        if let Edge::Shared(raw) = edge {
            self.stack.extend(raw.pull());
        }
    }
}

// ── Ref ───────────────────────────────────────────────────────────────

/// Counted borrow of a resolved object.
///
/// The guard owns a shared reference of its own, so the object stays alive
/// however the pointer it came from is repointed afterwards.
pub struct Ref<T: ?Sized + Pointee> {
    header: NonNull<Header>,
    target: NonNull<T>,
}

// SAFETY: the guard only hands out shared borrows of a counted object
unsafe impl<T: ?Sized + Pointee + Sync> Send for Ref<T> {}
unsafe impl<T: ?Sized + Pointee + Sync> Sync for Ref<T> {}

impl<T: ?Sized + Pointee> Ref<T> {
    fn new(header: NonNull<Header>) -> Option<Self> {
        // SAFETY: the caller holds a count on `header`
        let target = unsafe { T::project(header) }?;
        // SAFETY: as above
        unsafe { header.as_ref() }.inc_shared();
        Some(Self { header, target })
    }

    pub fn header(this: &Self) -> &Header {
        // SAFETY: our count keeps the allocation alive
        unsafe { this.header.as_ref() }
    }
}

impl<T: ?Sized + Pointee> Deref for Ref<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: our count keeps the value alive
        unsafe { self.target.as_ref() }
    }
}

impl<T: ?Sized + Pointee> Drop for Ref<T> {
    fn drop(&mut self) {
        // SAFETY: releases the count taken in `new`
        unsafe { Header::dec_shared(self.header) }
    }
}

impl<T: ?Sized + Pointee> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&self.header).finish()
    }
}

// ── Shared ────────────────────────────────────────────────────────────

/// Owning copy-on-write pointer.
///
/// [`Shared::pull`] resolves the target for this pointer's label, copying it
/// first if it is frozen and shared with another label. [`Shared::read`]
/// resolves without copying. Both hand out a counted [`Ref`].
pub struct Shared<T: ?Sized + Pointee> {
    raw: RawShared,
    _marker: PhantomData<fn() -> *const T>,
}

impl<T: Object> Shared<T> {
    /// Allocate `value` under the root label.
    pub fn new(value: T) -> Self {
        Self::new_in(value, &LabelPtr::root())
    }

    /// Allocate `value` owned by `label`.
    pub fn new_in(value: T, label: &LabelPtr) -> Self {
        let object = ObjectBox::allocate(value, label);
        Self::from_raw(RawShared::new(object, label))
    }

    pub fn erase(&self) -> Shared<dyn Object> {
        Shared::from_raw(self.raw.clone_in_place())
    }
}

impl<T: ?Sized + Pointee> Shared<T> {
    pub fn nil() -> Self {
        Self::from_raw(RawShared::nil())
    }

    #[inline]
    pub(crate) fn from_raw(raw: RawShared) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn raw(&self) -> &RawShared {
        &self.raw
    }

    #[inline]
    pub fn query(&self) -> bool {
        !self.raw.is_nil()
    }

    /// Resolve for mutation.
    pub fn pull(&self) -> Option<Ref<T>> {
        self.raw.pull().and_then(Ref::new)
    }

    /// Resolve for reading, never copying.
    pub fn read(&self) -> Option<Ref<T>> {
        self.raw.resolve().and_then(Ref::new)
    }

    /// The stored target without any resolution.
    pub fn get(&self) -> Option<Ref<T>> {
        NonNull::new(self.raw.target()).and_then(Ref::new)
    }

    #[inline]
    pub fn label(&self) -> &LabelPtr {
        self.raw.label()
    }

    #[inline]
    pub(crate) fn header(&self) -> Option<&Header> {
        self.raw.target_header()
    }

    #[inline]
    pub fn header_ptr(&self) -> Option<NonNull<Header>> {
        NonNull::new(self.raw.target())
    }

    #[inline]
    pub fn ptr_eq<U: ?Sized + Pointee>(&self, other: &Shared<U>) -> bool {
        ptr::eq(self.raw.target(), other.raw.target())
    }

    pub fn is_frozen(&self) -> bool {
        self.header().is_some_and(Header::is_frozen)
    }

    pub fn shared_count(&self) -> usize {
        self.header().map_or(0, Header::shared_count)
    }

    /// Freeze the reachable graph in place.
    pub fn freeze(&self) {
        if let Some(object) = self.raw.resolve() {
            freeze_graph(object);
        }
    }

    /// Lazily deep-clone the reachable graph.
    ///
    /// The graph is frozen and shared, the returned pointer resolves it
    /// through a fork of this pointer's label. Objects are copied only when
    /// either side pulls them.
    pub fn deep_clone(&self) -> Shared<T> {
        let Some(object) = self.raw.resolve() else {
            return Shared::nil();
        };
        freeze_graph(object);
        let label = if self.raw.label.is_root() || !self.raw.label.query() {
            // the root never freezes, move this side onto its own label
            self.raw.label.repoint(&LabelPtr::spawn());
            LabelPtr::spawn()
        } else {
            let label = self.raw.label.label();
            label.freeze();
            label.fork()
        };
        trace!("deep clone of {:p} under {:?}", object, label);
        Shared::from_raw(RawShared::new(object, &label))
    }

    /// Resolve every edge of the reachable graph for mutation, completing
    /// outstanding lazy copies.
    pub fn finish(&self) {
        let Some(root) = self.raw.pull() else {
            return;
        };
        let mut seen: HashSet<NonNull<Header>, ahash::RandomState> =
            HashSet::with_hasher(ahash::RandomState::new());
        let mut stack = vec![root];
        while let Some(ptr) = stack.pop() {
            if !seen.insert(ptr) {
                continue;
            }
            // SAFETY: held by the edge it was pulled through
            let object = unsafe { Header::object(ptr) };
            object.finish(&mut Finisher { stack: &mut stack });
        }
    }

    /// Point at `other`'s target under `other`'s label.
    pub fn assign(&mut self, other: &Shared<T>) {
        self.raw.label.replace(&other.raw.label);
        self.raw.replace_object(other.raw.target());
    }

    /// Assign from a pointer of another type, failing if its target is not
    /// a `T`.
    pub fn assign_from<U: ?Sized + Pointee>(&mut self, other: &Shared<U>) -> bool {
        match other.cast::<T>() {
            Some(cast) => {
                self.assign(&cast);
                true
            }
            None if other.raw.is_nil() => {
                self.raw.release();
                self.raw.label.replace(&other.raw.label);
                true
            }
            None => false,
        }
    }

    /// Move the pointer out, leaving nil behind.
    pub fn take(&mut self) -> Shared<T> {
        mem::replace(self, Shared::nil())
    }

    pub fn replace(&mut self, other: Shared<T>) -> Shared<T> {
        mem::replace(self, other)
    }

    pub fn downgrade(&self) -> Weak<T> {
        Weak::new(self)
    }

    /// Identity or dynamic downcast, keeping the label.
    pub fn cast<U: ?Sized + Pointee>(&self) -> Option<Shared<U>> {
        let object = NonNull::new(self.raw.target())?;
        // SAFETY: our count keeps the target alive
        unsafe { U::project(object) }?;
        Some(Shared::from_raw(self.raw.clone_in_place()))
    }
}

impl<T: ?Sized + Pointee> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self::from_raw(self.raw.clone())
    }
}

impl<T: ?Sized + Pointee> Default for Shared<T> {
    fn default() -> Self {
        Self::nil()
    }
}

impl<T: ?Sized + Pointee> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("object", &self.raw.target())
            .field("label", self.label())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Chain, Counters, Node, serial};
    use crate::Trace;
    use parking_lot::Mutex;
    use std::thread;

    fn value(node: &Shared<Node>) -> i64 {
        *node.read().unwrap().value.lock()
    }

    #[test]
    fn deep_clone_isolates_both_sides() {
        let _guard = serial();
        let counters = Counters::new();
        let head = Shared::new(Node::new(1, &counters));
        head.set_next(Shared::new(Node::new(2, &counters)));

        let clone = head.deep_clone();
        assert!(head.is_frozen());
        assert_eq!(counters.copies(), 0, "nothing copied until pulled");

        *clone.pull().unwrap().value.lock() = 10;
        *clone.next().pull().unwrap().value.lock() = 20;

        assert_eq!(value(&head), 1);
        assert_eq!(value(&head.next()), 2);
        assert_eq!(value(&clone), 10);
        assert_eq!(value(&clone.next()), 20);

        *head.pull().unwrap().value.lock() = 5;
        assert_eq!(value(&head), 5);
        assert_eq!(value(&clone), 10);
    }

    #[test]
    fn deep_clone_of_a_clone_chains_labels() {
        let _guard = serial();
        let counters = Counters::new();
        let a = Shared::new(Node::new(1, &counters));
        let b = a.deep_clone();
        *b.pull().unwrap().value.lock() = 2;

        let c = b.deep_clone();
        assert!(b.label().label().is_frozen());
        *c.pull().unwrap().value.lock() = 3;
        *b.pull().unwrap().value.lock() = 4;

        assert_eq!(value(&a), 1);
        assert_eq!(value(&b), 4);
        assert_eq!(value(&c), 3);
        assert!(!b.label().label().is_frozen(), "b moved to the forward label");
    }

    struct Fork {
        left: Mutex<Shared<Node>>,
        right: Mutex<Shared<Node>>,
    }

    impl Object for Fork {
        fn copy_object(&self) -> Self {
            Fork {
                left: Mutex::new(self.left.lock().clone()),
                right: Mutex::new(self.right.lock().clone()),
            }
        }

        fn trace(&self, visitor: &mut dyn Visitor) {
            self.left.trace(visitor);
            self.right.trace(visitor);
        }
    }

    fn branch(field: &Mutex<Shared<Node>>) -> Shared<Node> {
        let field = field.lock();
        field.pull();
        field.clone()
    }

    #[test]
    fn sharing_is_preserved_in_the_clone() {
        let _guard = serial();
        let counters = Counters::new();
        let tail = Shared::new(Node::new(0, &counters));
        let fork = Shared::new(Fork {
            left: Mutex::new(tail.clone()),
            right: Mutex::new(tail.clone()),
        });
        drop(tail);

        let clone = fork.deep_clone();
        let left = branch(&clone.pull().unwrap().left);
        *left.pull().unwrap().value.lock() = 42;
        let right = branch(&clone.pull().unwrap().right);
        assert!(left.ptr_eq(&right), "both edges resolve to one copy");
        assert_eq!(value(&right), 42);

        let original = branch(&fork.pull().unwrap().left);
        assert_eq!(value(&original), 0);
        assert!(!original.ptr_eq(&left));
    }

    #[test]
    fn assignment_moves_counts() {
        let _guard = serial();
        let counters = Counters::new();
        let a = Shared::new(Node::new(1, &counters));
        let b = Shared::new(Node::new(2, &counters));
        let mut slot = a.clone();
        assert_eq!(a.shared_count(), 2);

        slot.assign(&b);
        assert_eq!(a.shared_count(), 1);
        assert_eq!(b.shared_count(), 2);
        slot.assign(&b);
        assert_eq!(b.shared_count(), 2);

        let taken = slot.take();
        assert!(!slot.query());
        assert_eq!(b.shared_count(), 2);
        drop(taken);
        assert_eq!(b.shared_count(), 1);

        let erased = a.erase();
        assert!(slot.assign_from(&erased));
        assert!(slot.ptr_eq(&a));
        assert!(slot.assign_from(&Shared::<dyn Object>::nil()));
        assert!(!slot.query());

        drop(slot);
        drop(erased);
        drop(a);
        assert_eq!(counters.drops(), 1);
    }

    #[test]
    fn finish_resolves_every_edge() {
        let _guard = serial();
        let counters = Counters::new();
        let head = Shared::new(Node::new(1, &counters));
        head.set_next(Shared::new(Node::new(2, &counters)));
        head.next().set_next(Shared::new(Node::new(3, &counters)));
        let keep = head.clone();

        let clone = head.deep_clone();
        clone.finish();
        assert_eq!(counters.copies(), 3);
        assert!(!clone.is_frozen());
        assert!(!clone.next().is_frozen());
        assert!(!clone.next().next().is_frozen());
        drop(keep);
    }

    #[test]
    fn nil_pointers() {
        let _guard = serial();
        let nil = Shared::<Node>::nil();
        assert!(!nil.query());
        assert!(nil.pull().is_none());
        assert!(nil.read().is_none());
        assert!(!nil.deep_clone().query());
        assert_eq!(nil.shared_count(), 0);
        assert!(nil.label().is_root());
    }

    #[test]
    fn clones_pull_concurrently() {
        let _guard = serial();
        let counters = Counters::new();
        let origin = Shared::new(Node::new(0, &counters));
        origin.set_next(Shared::new(Node::new(100, &counters)));

        let handles: Vec<_> = (0..8)
            .map(|_| origin.deep_clone())
            .map(|mine| {
                thread::spawn(move || {
                    for _ in 0..100 {
                        *mine.pull().unwrap().value.lock() += 1;
                        *mine.next().pull().unwrap().value.lock() += 1;
                    }
                    mine
                })
            })
            .collect();
        let clones: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        for clone in &clones {
            assert_eq!(value(clone), 100);
            assert_eq!(value(&clone.next()), 200);
        }
        assert_eq!(value(&origin), 0);
        assert_eq!(value(&origin.next()), 100);
    }

    #[test]
    fn borrow_outlives_resolution_of_its_pointer() {
        let _guard = serial();
        let counters = Counters::new();
        let a = Shared::new(Node::new(1, &counters));
        let b = a.deep_clone();
        let seen = b.read().unwrap();
        b.pull();
        assert!(!b.ptr_eq(&a), "b moved to its own copy");
        drop(a);
        assert_eq!(counters.drops(), 0, "the borrow still owns the original");
        assert_eq!(*seen.value.lock(), 1);
        assert_eq!(Ref::header(&seen).shared_count(), 1);

        drop(seen);
        assert_eq!(counters.drops(), 1);
        assert_eq!(value(&b), 1);
    }
}
