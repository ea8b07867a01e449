use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::{Mutex, MutexGuard, const_mutex};

use crate::{Object, Shared, Trace, Visitor};

static SERIAL: Mutex<()> = const_mutex(());

/// Tests touching objects share the collector buffer, run them one at a time.
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    SERIAL.lock()
}

#[derive(Default)]
struct Tally {
    drops: AtomicUsize,
    copies: AtomicUsize,
}

#[derive(Clone, Default)]
pub(crate) struct Counters(Arc<Tally>);

impl Counters {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn drops(&self) -> usize {
        self.0.drops.load(Ordering::SeqCst)
    }

    pub(crate) fn copies(&self) -> usize {
        self.0.copies.load(Ordering::SeqCst)
    }
}

/// Linked node that reports its copies and drops.
pub(crate) struct Node {
    pub(crate) value: Mutex<i64>,
    pub(crate) next: Mutex<Shared<Node>>,
    counters: Counters,
}

impl Node {
    pub(crate) fn new(value: i64, counters: &Counters) -> Self {
        Self {
            value: Mutex::new(value),
            next: Mutex::new(Shared::nil()),
            counters: counters.clone(),
        }
    }

    pub(crate) fn set_next(&self, next: Shared<Node>) {
        *self.next.lock() = next;
    }

    /// The successor, resolved in place for mutation.
    pub(crate) fn next(&self) -> Shared<Node> {
        let next = self.next.lock();
        next.pull();
        next.clone()
    }
}

impl Object for Node {
    fn copy_object(&self) -> Self {
        self.counters.0.copies.fetch_add(1, Ordering::SeqCst);
        Self {
            value: Mutex::new(*self.value.lock()),
            next: Mutex::new(self.next.lock().clone()),
            counters: self.counters.clone(),
        }
    }

    fn trace(&self, visitor: &mut dyn Visitor) {
        self.next.trace(visitor);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.counters.0.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Drive a [`Node`] through its pointer.
pub(crate) trait Chain {
    fn set_next(&self, next: Shared<Node>);
    fn next(&self) -> Shared<Node>;
    fn value(&self) -> i64;
}

impl Chain for Shared<Node> {
    fn set_next(&self, next: Shared<Node>) {
        self.pull().expect("nil node").set_next(next);
    }

    fn next(&self) -> Shared<Node> {
        self.pull().expect("nil node").next()
    }

    fn value(&self) -> i64 {
        *self.read().expect("nil node").value.lock()
    }
}
