use std::{
    fmt,
    mem,
    ops::Deref,
    ptr::{self, NonNull},
    sync::{
        OnceLock,
        atomic::{AtomicPtr, Ordering},
    },
};

use crate::{Header, Label, header::ObjectBox, settings};

/// Reference-counted handle to a [`Label`].
///
/// The process-wide root label is immortal, handles to it never touch its
/// count. A handle may also be empty, which resolves like the root.
pub struct LabelPtr {
    ptr: AtomicPtr<Header>,
}

// SAFETY: the pointer slot is atomic and counts are atomic
unsafe impl Send for LabelPtr {}
unsafe impl Sync for LabelPtr {}

struct RootLabel(NonNull<Header>);

// SAFETY: the root label lives for the whole process
unsafe impl Send for RootLabel {}
unsafe impl Sync for RootLabel {}

static ROOT: OnceLock<RootLabel> = OnceLock::new();

#[inline]
fn root_header() -> NonNull<Header> {
    ROOT.get_or_init(|| {
        let label = Label::new(settings().memo_capacity);
        let header = ObjectBox::allocate(label, &LabelPtr::none());
        // SAFETY: just allocated, the extra count is never released
        unsafe { header.as_ref() }.inc_shared();
        RootLabel(header)
    })
    .0
}

#[inline]
fn is_root_ptr(ptr: *mut Header) -> bool {
    ptr::eq(ptr, root_header().as_ptr())
}

impl LabelPtr {
    #[inline]
    pub const fn none() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub fn root() -> Self {
        Self {
            ptr: AtomicPtr::new(root_header().as_ptr()),
        }
    }

    /// Take a new reference to the label headed by `header`.
    pub(crate) fn from_header(header: NonNull<Header>) -> Self {
        if !is_root_ptr(header.as_ptr()) {
            // SAFETY: caller holds the label alive
            unsafe { header.as_ref() }.inc_shared();
        }
        Self {
            ptr: AtomicPtr::new(header.as_ptr()),
        }
    }

    /// # Safety
    /// The caller transfers one shared count on `header`.
    pub(crate) unsafe fn adopt(header: NonNull<Header>) -> Self {
        Self {
            ptr: AtomicPtr::new(header.as_ptr()),
        }
    }

    /// Allocate a new label and return the only handle to it.
    pub(crate) fn allocate(label: Label) -> Self {
        let header = ObjectBox::allocate(label, &LabelPtr::root());
        Self::from_header(header)
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        is_root_ptr(self.ptr.load(Ordering::Acquire))
    }

    /// Whether the handle refers to a label at all.
    #[inline]
    pub fn query(&self) -> bool {
        !self.ptr.load(Ordering::Acquire).is_null()
    }

    #[inline]
    pub fn header(&self) -> Option<NonNull<Header>> {
        NonNull::new(self.ptr.load(Ordering::Acquire))
    }

    /// Borrow the label. The guard holds its own count, so the label stays
    /// alive even if this handle is repointed meanwhile.
    pub fn get(&self) -> Option<LabelRef> {
        let handle = self.clone();
        let header = handle.header()?;
        // SAFETY: `handle` keeps the label alive
        let label = unsafe { ObjectBox::<Label>::project(header) }?;
        Some(LabelRef { handle, label })
    }

    /// The label, aborting on an empty handle.
    pub fn label(&self) -> LabelRef {
        match self.get() {
            Some(label) => label,
            None => fatal!("dereferenced an empty label handle"),
        }
    }

    /// Point at `other`'s label, dropping the previous target.
    pub fn replace(&mut self, other: &LabelPtr) {
        self.repoint(other);
    }

    /// Drop the target, leaving the handle empty.
    pub fn release(&mut self) {
        let old = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        Self::dec(old);
    }

    pub fn take(&mut self) -> LabelPtr {
        mem::take(self)
    }

    /// [`LabelPtr::replace`] through a shared reference.
    ///
    /// Only for handles no other thread can reach, i.e. the label of a
    /// pointer. Borrows of the old label are [`LabelRef`]s and stay valid.
    pub(crate) fn repoint(&self, other: &LabelPtr) {
        let next = other.ptr.load(Ordering::Acquire);
        if let Some(next) = NonNull::new(next)
            && !is_root_ptr(next.as_ptr())
        {
            // SAFETY: `other` keeps the label alive
            unsafe { next.as_ref() }.inc_shared();
        }
        let old = self.ptr.swap(next, Ordering::AcqRel);
        if ptr::eq(old, next) {
            if let Some(old) = NonNull::new(old)
                && !is_root_ptr(old.as_ptr())
            {
                // SAFETY: `other` still holds a count
                unsafe { old.as_ref() }.dec_shared_retained();
            }
            return;
        }
        Self::dec(old);
    }

    /// Install `label` if the handle is empty, otherwise hand it back.
    pub(crate) fn init(&self, label: LabelPtr) -> Result<(), LabelPtr> {
        let next = label.ptr.load(Ordering::Acquire);
        match self
            .ptr
            .compare_exchange(ptr::null_mut(), next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // the count moved into `self`
                mem::forget(label);
                Ok(())
            }
            Err(_) => Err(label),
        }
    }

    /// Target for an object's weak back-edge, null for the root.
    pub(crate) fn weak_target(&self) -> *mut Header {
        let ptr = self.ptr.load(Ordering::Acquire);
        // checked first, the root itself is allocated through an empty handle
        if ptr.is_null() || is_root_ptr(ptr) {
            return ptr::null_mut();
        }
        ptr
    }

    #[inline]
    pub fn ptr_eq(&self, other: &LabelPtr) -> bool {
        ptr::eq(
            self.ptr.load(Ordering::Acquire),
            other.ptr.load(Ordering::Acquire),
        )
    }

    /// The target, unless it is the root or empty.
    #[inline]
    pub(crate) fn collectable(&self) -> Option<NonNull<Header>> {
        let ptr = self.ptr.load(Ordering::Acquire);
        if is_root_ptr(ptr) {
            return None;
        }
        NonNull::new(ptr)
    }

    fn dec(ptr: *mut Header) {
        if let Some(ptr) = NonNull::new(ptr)
            && !is_root_ptr(ptr.as_ptr())
        {
            // SAFETY: the handle owned this count
            unsafe { Header::dec_shared(ptr) }
        }
    }
}

impl Clone for LabelPtr {
    fn clone(&self) -> Self {
        match self.header() {
            Some(header) => Self::from_header(header),
            None => Self::none(),
        }
    }
}

impl Drop for LabelPtr {
    fn drop(&mut self) {
        self.release();
    }
}

impl Default for LabelPtr {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for LabelPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("LabelPtr(root)");
        }
        match self.header() {
            Some(header) => write!(f, "LabelPtr({:p})", header),
            None => f.write_str("LabelPtr(none)"),
        }
    }
}

/// Counted borrow of a [`Label`], see [`LabelPtr::get`].
pub struct LabelRef {
    handle: LabelPtr,
    label: NonNull<Label>,
}

// SAFETY: the handle keeps the label alive and labels are Sync
unsafe impl Send for LabelRef {}
unsafe impl Sync for LabelRef {}

impl Deref for LabelRef {
    type Target = Label;

    #[inline]
    fn deref(&self) -> &Label {
        // SAFETY: `handle` holds a count for as long as the guard exists
        unsafe { self.label.as_ref() }
    }
}

impl fmt::Debug for LabelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
