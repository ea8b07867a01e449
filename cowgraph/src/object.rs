use std::{any::Any, ptr::NonNull};

use crate::{
    Edge, Header, LabelPtr, Shared, Visitor,
    header::ObjectBox,
};

/// A node of the object graph.
///
/// Mutable state lives behind interior mutability (`parking_lot::Mutex`,
/// atomics) since a pulled object is reached through `&self`. Fields that
/// point to other nodes are [`Shared`] or [`crate::Weak`] pointers and must be
/// reported by [`Object::trace`].
pub trait Object: Send + Sync + 'static {
    /// Produce the private copy a label materializes for this object.
    ///
    /// Runs inside a clone scope, so cloning pointer fields rebinds them to
    /// the copying label. A derived `Clone` is usually all that is needed.
    fn copy_object(&self) -> Self
    where
        Self: Sized;

    /// Report every owned edge to `visitor`.
    fn trace(&self, visitor: &mut dyn Visitor);

    /// Prepare a frozen object for reuse by `label` without copying.
    ///
    /// The default rebinds every pointer field to `label`.
    fn recycle(&mut self, label: &LabelPtr) {
        self.trace(&mut Relabel { label });
    }

    /// Visit the edges that [`Shared::finish`] should resolve eagerly.
    fn finish(&self, visitor: &mut dyn Visitor) {
        self.trace(visitor)
    }
}

struct Relabel<'a> {
    label: &'a LabelPtr,
}

impl Visitor for Relabel<'_> {
    fn visit(&mut self, edge: Edge<'_>) {
        match edge {
            Edge::Shared(raw) => {
                if !raw.target().is_null() {
                    raw.label().repoint(self.label);
                }
            }
            Edge::Weak(raw) => {
                if !raw.target().is_null() {
                    raw.label().repoint(self.label);
                }
            }
            Edge::Label(_) | Edge::Raw(_) => (),
        }
    }
}

/// Types a [`Shared`] pointer can point to: a concrete [`Object`] or
/// `dyn Object`.
///
/// # Safety
/// `project` must only return a pointer into the allocation headed by
/// `header`, valid for as long as the allocation's value is.
pub unsafe trait Pointee: 'static {
    /// # Safety
    /// `header` must head a live allocation.
    unsafe fn project(header: NonNull<Header>) -> Option<NonNull<Self>>;
}

// SAFETY: projection checks the concrete type
unsafe impl<T: Object> Pointee for T {
    #[inline]
    unsafe fn project(header: NonNull<Header>) -> Option<NonNull<Self>> {
        // SAFETY: forwarded
        unsafe { ObjectBox::<T>::project(header) }
    }
}

// SAFETY: every allocation holds some Object
unsafe impl Pointee for dyn Object {
    #[inline]
    unsafe fn project(header: NonNull<Header>) -> Option<NonNull<Self>> {
        // SAFETY: forwarded
        Some(unsafe { Header::object_ptr(header) })
    }
}

/// Objects that [`make`] can build without arguments.
///
/// The default declines, which is what types without a sensible default
/// state keep.
pub trait Construct: Object + Sized {
    fn construct() -> Option<Self> {
        None
    }
}

/// Allocate a default-constructed `T` under the root label.
pub fn make<T: Construct>() -> Option<Shared<T>> {
    T::construct().map(Shared::new)
}

/// [`Shared::cast`] lifted over an optional pointer.
pub fn cast_optional<U, T>(from: Option<&Shared<T>>) -> Option<Shared<U>>
where
    U: ?Sized + Pointee,
    T: ?Sized + Pointee,
{
    from.and_then(Shared::cast::<U>)
}

/// Cast between non-pointer values, only the identity cast succeeds.
pub fn cast_value<To, From>(from: &From) -> Option<To>
where
    To: Any + Clone,
    From: Any,
{
    (from as &dyn Any).downcast_ref::<To>().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Chain, Counters, Node, serial};
    use parking_lot::Mutex;

    struct Blank;

    impl Object for Blank {
        fn copy_object(&self) -> Self {
            Blank
        }

        fn trace(&self, _: &mut dyn Visitor) {}
    }

    impl Construct for Blank {
        fn construct() -> Option<Self> {
            Some(Blank)
        }
    }

    // needs a counters handle, so it cannot be built from nothing
    impl Construct for Node {}

    #[test]
    fn make_builds_only_constructible_types() {
        let _guard = serial();
        let blank = make::<Blank>().expect("Blank has a default state");
        assert!(blank.query());
        assert!(blank.label().is_root());
        assert!(make::<Node>().is_none());
    }

    #[test]
    fn downcast_keeps_the_label() {
        let _guard = serial();
        let counters = Counters::new();
        let label = LabelPtr::spawn();
        let node = Shared::new_in(Node::new(7, &counters), &label);
        let erased = node.erase();

        let back = erased.cast::<Node>().expect("dynamic type matches");
        assert!(back.ptr_eq(&node));
        assert!(back.label().ptr_eq(&label));
        assert_eq!(back.value(), 7);

        assert!(erased.cast::<Blank>().is_none());
        assert!(node.cast::<Node>().is_some(), "identity cast");
        assert!(Shared::<Node>::nil().cast::<Node>().is_none());
    }

    #[test]
    fn optional_and_value_casts() {
        let _guard = serial();
        let counters = Counters::new();
        let node = Shared::new(Node::new(1, &counters));
        assert!(cast_optional::<dyn Object, _>(Some(&node)).is_some());
        assert!(cast_optional::<Blank, Node>(None).is_none());

        assert_eq!(cast_value::<i64, i64>(&3), Some(3));
        assert_eq!(cast_value::<i32, i64>(&3), None);
        assert_eq!(
            cast_value::<String, String>(&"x".to_owned()).as_deref(),
            Some("x")
        );
    }

    struct Pair {
        left: Mutex<Shared<Node>>,
        right: Mutex<Shared<Node>>,
    }

    impl Object for Pair {
        fn copy_object(&self) -> Self {
            Pair {
                left: Mutex::new(self.left.lock().clone()),
                right: Mutex::new(self.right.lock().clone()),
            }
        }

        fn trace(&self, visitor: &mut dyn Visitor) {
            crate::Trace::trace(&self.left, visitor);
            crate::Trace::trace(&self.right, visitor);
        }
    }

    #[test]
    fn default_recycle_rebinds_pointer_fields() {
        let _guard = serial();
        let counters = Counters::new();
        let mut pair = Pair {
            left: Mutex::new(Shared::new(Node::new(1, &counters))),
            right: Mutex::new(Shared::nil()),
        };
        let label = LabelPtr::spawn();
        pair.recycle(&label);
        assert!(pair.left.lock().label().ptr_eq(&label));
        assert!(pair.right.lock().label().is_root(), "nil pointers keep their label");
    }
}
