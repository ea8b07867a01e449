use std::ptr::NonNull;

use parking_lot::{Mutex, RwLock};

use crate::{Header, LabelPtr, Pointee, RawShared, RawWeak, Shared, Weak};

/// One outgoing edge of a graph node.
pub enum Edge<'a> {
    /// Owning pointer, counts toward the target's shared count.
    Shared(&'a RawShared),
    /// Non-owning pointer, only its label is owned.
    Weak(&'a RawWeak),
    Label(&'a LabelPtr),
    /// Owning reference held outside a pointer, e.g. a memo value.
    Raw(NonNull<Header>),
}

pub trait Visitor {
    fn visit(&mut self, edge: Edge<'_>);

    /// Whether locks must not block. A visitor that can run under a lock the
    /// current thread already holds says so here.
    #[inline]
    fn try_locks(&self) -> bool {
        false
    }

    /// A lock could not be taken without blocking, the edges reported so
    /// far are incomplete.
    #[inline]
    fn contended(&mut self) {}
}

/// Enumerate the owned edges of a value.
///
/// Objects implement [`crate::Object::trace`] by tracing their fields.
pub trait Trace {
    fn trace(&self, visitor: &mut dyn Visitor);
}

impl<T: ?Sized + Pointee> Trace for Shared<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        visitor.visit(Edge::Shared(self.raw()));
    }
}

impl<T: ?Sized + Pointee> Trace for Weak<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        visitor.visit(Edge::Weak(self.raw()));
    }
}

impl Trace for RawShared {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        visitor.visit(Edge::Shared(self));
    }
}

impl Trace for LabelPtr {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        visitor.visit(Edge::Label(self));
    }
}

impl<T: Trace> Trace for Option<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        if let Some(value) = self {
            value.trace(visitor);
        }
    }
}

impl<T: Trace> Trace for [T] {
    fn trace(&self, visitor: &mut dyn Visitor) {
        for value in self {
            value.trace(visitor);
        }
    }
}

impl<T: Trace> Trace for Vec<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.as_slice().trace(visitor);
    }
}

impl<T: Trace + ?Sized> Trace for Box<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        (**self).trace(visitor);
    }
}

// interior-mutable fields lock for the duration of the trace
impl<T: Trace> Trace for Mutex<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        if !visitor.try_locks() {
            return self.lock().trace(visitor);
        }
        match self.try_lock() {
            Some(guard) => guard.trace(visitor),
            None => visitor.contended(),
        }
    }
}

impl<T: Trace> Trace for RwLock<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        if !visitor.try_locks() {
            return self.read().trace(visitor);
        }
        match self.try_read() {
            Some(guard) => guard.trace(visitor),
            None => visitor.contended(),
        }
    }
}
