use std::{
    collections::HashMap,
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use log::trace;
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::{Edge, Header, LabelPtr, Object, Visitor, settings, shared::freeze_graph};

// ── Memo ──────────────────────────────────────────────────────────────

/// One memoized copy. The key is held weakly so its address cannot be
/// reused while the entry exists, the value is owned.
pub(crate) struct MemoEntry {
    key: NonNull<Header>,
    value: NonNull<Header>,
}

impl MemoEntry {
    fn new(key: NonNull<Header>, value: NonNull<Header>) -> Self {
        // SAFETY: both are held alive by the caller
        unsafe {
            key.as_ref().inc_weak();
            value.as_ref().inc_shared();
        }
        Self { key, value }
    }

    /// Drop both references. Never call with a memo lock held, the value
    /// may be destroyed.
    fn release(self) {
        // SAFETY: the entry owns one weak and one shared count
        unsafe {
            Header::dec_shared(self.value);
            Header::dec_weak(self.key);
        }
    }
}

pub(crate) struct Memo {
    entries: HashMap<usize, MemoEntry, ahash::RandomState>,
}

// SAFETY: entries only hold counted references, updated atomically
unsafe impl Send for Memo {}
unsafe impl Sync for Memo {}

impl Memo {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity_and_hasher(capacity, ahash::RandomState::new()),
        }
    }

    #[inline]
    fn get(&self, key: NonNull<Header>) -> Option<NonNull<Header>> {
        self.entries
            .get(&(key.as_ptr() as usize))
            .map(|entry| entry.value)
    }

    /// Insert a mapping, returning the entry it displaced.
    fn put(&mut self, key: NonNull<Header>, value: NonNull<Header>) -> Option<MemoEntry> {
        self.entries
            .insert(key.as_ptr() as usize, MemoEntry::new(key, value))
    }

    /// Drop entries whose original has no owners left, nothing can look
    /// them up any more.
    fn rehash(&mut self) -> Vec<MemoEntry> {
        let dead: Vec<usize> = self
            .entries
            .iter()
            // SAFETY: the entry's weak count keeps the key readable
            .filter(|(_, entry)| !unsafe { entry.key.as_ref() }.is_alive())
            .map(|(&key, _)| key)
            .collect();
        let removed: Vec<MemoEntry> = dead
            .into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect();
        if !removed.is_empty() {
            self.entries.shrink_to_fit();
        }
        removed
    }

    fn copy(&self) -> Memo {
        let mut memo = Memo::with_capacity(self.entries.len());
        for (&key, entry) in &self.entries {
            memo.entries
                .insert(key, MemoEntry::new(entry.key, entry.value));
        }
        memo
    }

    fn values(&self) -> impl Iterator<Item = NonNull<Header>> + '_ {
        self.entries.values().map(|entry| entry.value)
    }

    #[inline]
    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Follow memo entries from `o` while the candidate is frozen.
    fn walk(&self, o: NonNull<Header>) -> NonNull<Header> {
        let mut current = o;
        let mut steps = 0;
        // SAFETY: keys and values are held by this memo or the caller
        while unsafe { current.as_ref() }.is_frozen() {
            let Some(next) = self.get(current) else {
                break;
            };
            current = next;
            steps += 1;
            if steps > self.len() {
                fatal!("memo chain from {:p} does not terminate", o);
            }
        }
        current
    }

    fn drain(&mut self) -> Vec<MemoEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

impl Drop for Memo {
    fn drop(&mut self) {
        for entry in self.drain() {
            entry.release();
        }
    }
}

// ── Label ─────────────────────────────────────────────────────────────

/// A clone generation: maps frozen originals to this generation's private
/// copies.
pub struct Label {
    memo: RwLock<Memo>,
    frozen: AtomicBool,
    // the memo gained entries since the label was created
    written: AtomicBool,
    // successor that takes over mutation once this label is frozen
    forward: LabelPtr,
}

impl Label {
    pub(crate) fn new(capacity: usize) -> Self {
        Self::with_memo(Memo::with_capacity(capacity))
    }

    fn with_memo(memo: Memo) -> Self {
        let written = memo.len() > 0;
        Self {
            memo: RwLock::new(memo),
            frozen: AtomicBool::new(false),
            written: AtomicBool::new(written),
            forward: LabelPtr::none(),
        }
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn memo_len(&self) -> usize {
        self.memo.read().len()
    }

    /// Mark the memo as written.
    pub(crate) fn thaw(&self) {
        self.written.store(true, Ordering::Release);
    }

    /// Freeze the label and every copy it memoized.
    pub fn freeze(&self) {
        if self.frozen.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.written.load(Ordering::Acquire) {
            return;
        }
        let values: Vec<NonNull<Header>> = {
            let memo = self.memo.read();
            memo.values()
                // SAFETY: the memo owns each value
                .inspect(|value| unsafe { value.as_ref() }.inc_shared())
                .collect()
        };
        for value in values {
            freeze_graph(value);
            // SAFETY: releases the count taken above
            unsafe { Header::dec_shared(value) };
        }
    }

    /// A new label whose memo starts as a copy of this one.
    pub fn fork(&self) -> LabelPtr {
        let mut guard = self.memo.write();
        let removed = guard.rehash();
        let guard = RwLockWriteGuard::downgrade(guard);
        let memo = guard.copy();
        drop(guard);
        for entry in removed {
            entry.release();
        }
        trace!("forked label with {} memo entries", memo.len());
        LabelPtr::allocate(Label::with_memo(memo))
    }
}

impl Object for Label {
    fn copy_object(&self) -> Self {
        let memo = self.memo.read().copy();
        Label::with_memo(memo)
    }

    fn trace(&self, visitor: &mut dyn Visitor) {
        let memo = if visitor.try_locks() {
            match self.memo.try_read() {
                Some(memo) => memo,
                None => return visitor.contended(),
            }
        } else {
            self.memo.read()
        };
        for value in memo.values() {
            visitor.visit(Edge::Raw(value));
        }
        drop(memo);
        visitor.visit(Edge::Label(&self.forward));
    }

    fn recycle(&mut self, _: &LabelPtr) {}
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Label")
            .field("frozen", &self.is_frozen())
            .field("memo", &self.memo_len())
            .field("forward", &self.forward)
            .finish()
    }
}

// ── resolution ────────────────────────────────────────────────────────

impl LabelPtr {
    /// A fresh, empty label.
    pub fn spawn() -> LabelPtr {
        LabelPtr::allocate(Label::new(settings().memo_capacity))
    }

    /// The label mutation should go through, creating forwards as needed.
    pub fn get_forward(&self) -> LabelPtr {
        let mut current = self.clone();
        loop {
            if current.is_root() {
                return current;
            }
            let Some(label) = current.get() else {
                return current;
            };
            if !label.is_frozen() {
                return current;
            }
            if !label.forward.query()
                && let Err(lost) = label.forward.init(label.fork())
            {
                // another thread installed its fork first
                drop(lost);
            }
            let next = label.forward.clone();
            if next.query() {
                trace!("label {:?} forwards to {:?}", current, next);
            }
            current = next;
        }
    }

    /// Follow forwards that already exist, never creating one.
    pub fn pull_forward(&self) -> LabelPtr {
        let mut current = self.clone();
        loop {
            let next = match current.get() {
                Some(label) if label.is_frozen() && label.forward.query() => label.forward.clone(),
                _ => return current,
            };
            current = next;
        }
    }

    /// Resolve `o` for mutation under this label. The result is never frozen
    /// unless the label is the root.
    ///
    /// The caller owns `o` and receives one shared count on the result.
    pub(crate) fn map_get(&self, o: NonNull<Header>) -> NonNull<Header> {
        // SAFETY: the caller owns `o`
        let header = unsafe { o.as_ref() };
        let label = match self.get() {
            Some(label) if !self.is_root() && header.is_frozen() => label,
            _ => {
                header.inc_shared();
                return o;
            }
        };
        {
            let memo = label.memo.read();
            let found = memo.walk(o);
            // SAFETY: held by the memo or the caller
            let header = unsafe { found.as_ref() };
            if !header.is_frozen() {
                header.inc_shared();
                return found;
            }
        }

        // readers take their count under the read lock, so uniqueness checked
        // under the write lock holds until the object is recycled
        let memo = label.memo.write();
        let found = memo.walk(o);
        // SAFETY: held by the memo or the caller
        let header = unsafe { found.as_ref() };
        if header.is_frozen() && header.is_unique() {
            // SAFETY: unique under the write lock
            unsafe { Header::recycle(found, self) };
        }
        header.inc_shared();
        drop(memo);
        if !header.is_frozen() {
            return found;
        }
        let copy = self.copy_into_memo(&label, found);
        // SAFETY: releases the count taken above, the memo or caller holds another
        unsafe { Header::dec_shared(found) };
        copy
    }

    /// Resolve `o` for reading, never copying.
    ///
    /// Hands the caller one shared count on the result, or `None` if the
    /// object it resolves to is no longer alive. Owners of `o` always get a
    /// result.
    pub(crate) fn map_pull(&self, o: NonNull<Header>) -> Option<NonNull<Header>> {
        let found = match self.get() {
            Some(label) if !self.is_root() => {
                let memo = label.memo.read();
                let found = memo.walk(o);
                // SAFETY: held by the memo or the caller
                return unsafe { found.as_ref() }.try_inc_shared().then_some(found);
            }
            _ => o,
        };
        // SAFETY: the caller holds `o` at least weakly
        unsafe { found.as_ref() }.try_inc_shared().then_some(found)
    }

    /// Copy `o` for this label without walking the memo first. The caller
    /// owns `o` and receives one shared count on the result.
    pub(crate) fn map_copy(&self, o: NonNull<Header>) -> NonNull<Header> {
        match self.get() {
            Some(label) if !self.is_root() => self.copy_into_memo(&label, o),
            _ => {
                // SAFETY: the caller owns `o`
                unsafe { o.as_ref() }.inc_shared();
                o
            }
        }
    }

    fn copy_into_memo(&self, label: &Label, o: NonNull<Header>) -> NonNull<Header> {
        // copy outside the lock, copy constructors may resolve other pointers
        // SAFETY: the caller owns `o`
        let copy = unsafe { Header::copy(o, self) };
        // SAFETY: a fresh allocation
        let copy_header = unsafe { copy.as_ref() };
        // SAFETY: as above
        if unsafe { o.as_ref() }.is_frozen_unique() {
            copy_header.inc_shared();
            return copy;
        }
        label.thaw();
        let mut memo = label.memo.write();
        if let Some(existing) = memo.get(o) {
            // SAFETY: the memo owns the existing copy
            unsafe { existing.as_ref() }.inc_shared();
            drop(memo);
            trace!("lost copy race for {:p}", o);
            // SAFETY: the copy was never handed out
            unsafe { Header::discard(copy) };
            return existing;
        }
        let displaced = memo.put(o, copy);
        copy_header.inc_shared();
        drop(memo);
        if let Some(entry) = displaced {
            entry.release();
        }
        copy
    }
}
