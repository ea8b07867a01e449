//! Synchronous cycle collection by trial deletion.
//!
//! A decrement that leaves an object's shared count above zero may have cut
//! the last external edge into a cycle, so the object is buffered as a
//! possible root. A round then works on a separate reachable count:
//!
//! * mark: from every purple candidate, grey the reachable subgraph and
//!   subtract each internal edge from its target's reachable count;
//! * scan: a grey node left with external references is live, restore counts
//!   along everything reachable from it and colour it black, everything
//!   else becomes white;
//! * collect: destroy the white nodes, they are only referenced from inside
//!   unreachable cycles.
//!
//! Rounds are serialized by a global lock and assume the candidate subgraph
//! is not mutated concurrently. A round may start while the current thread
//! holds a node's lock, e.g. when assigning a field drops the last outside
//! reference. Mark only try-locks, a node it cannot lock is opaque: its
//! edges stay uncounted and it is treated as live for the whole round.

use std::{
    collections::HashSet,
    mem,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{debug, trace};
use parking_lot::{Mutex, const_mutex};

use crate::{Color, CollectorSettings, Edge, Header, HeaderFlags, Visitor, settings};

/// A buffered possible root, owning one weak count on its allocation.
struct Candidate(NonNull<Header>);

// SAFETY: only touched under the buffer lock or by the round that took it
unsafe impl Send for Candidate {}

static BUFFER: Mutex<Vec<Candidate>> = const_mutex(Vec::new());
static ROUND: Mutex<()> = const_mutex(());

static ROUNDS: AtomicUsize = AtomicUsize::new(0);
static CANDIDATES: AtomicUsize = AtomicUsize::new(0);
static COLLECTED: AtomicUsize = AtomicUsize::new(0);

/// Outcome of one collection round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectionStats {
    pub candidates: usize,
    // candidates still purple and alive when the round started
    pub roots: usize,
    pub collected: usize,
}

/// Totals since process start.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectorStats {
    pub rounds: usize,
    pub candidates: usize,
    pub collected: usize,
}

pub fn stats() -> CollectorStats {
    CollectorStats {
        rounds: ROUNDS.load(Ordering::Relaxed),
        candidates: CANDIDATES.load(Ordering::Relaxed),
        collected: COLLECTED.load(Ordering::Relaxed),
    }
}

pub fn candidate_count() -> usize {
    BUFFER.lock().len()
}

#[inline]
pub fn collection_due(candidates: usize, settings: &CollectorSettings) -> bool {
    candidates >= settings.threshold
}

/// Buffer `ptr` after a decrement that left it alive. Returns true if the
/// buffer took over the caller's weak pin.
pub(crate) fn possible_root(ptr: NonNull<Header>) -> bool {
    // SAFETY: the caller pinned the allocation
    let header = unsafe { ptr.as_ref() };
    if header
        .flags()
        .intersects(HeaderFlags::COLLECTED | HeaderFlags::DESTROYED)
    {
        return false;
    }
    header.set_color(Color::Purple);
    if header
        .insert_flags(HeaderFlags::BUFFERED)
        .contains(HeaderFlags::BUFFERED)
    {
        return false;
    }
    let len = {
        let mut buffer = BUFFER.lock();
        buffer.push(Candidate(ptr));
        buffer.len()
    };
    let settings = settings();
    if settings.auto_collect && collection_due(len, settings) {
        maybe_collect();
    }
    true
}

/// Run a full round, waiting for any round in progress.
pub fn collect_cycles() -> CollectionStats {
    let _round = ROUND.lock();
    run_round()
}

/// Run a round if enough candidates are buffered and no round is underway.
pub fn maybe_collect() -> Option<CollectionStats> {
    if !collection_due(candidate_count(), settings()) {
        return None;
    }
    let _round = ROUND.try_lock()?;
    Some(run_round())
}

fn run_round() -> CollectionStats {
    let candidates = mem::take(&mut *BUFFER.lock());
    let mut collection = Collection::new();
    let mut roots = Vec::with_capacity(candidates.len());

    for candidate in &candidates {
        // SAFETY: pinned by the candidate
        let header = unsafe { candidate.0.as_ref() };
        if header.color() == Color::Purple && header.is_alive() {
            collection.mark_root(candidate.0);
            roots.push(candidate.0);
        }
    }

    if !collection.opaque.is_empty() {
        debug!("{} nodes locked during mark, kept live", collection.opaque.len());
    }
    collection.phase = Phase::Scan;
    for &root in &roots {
        collection.scan(root);
        collection.drain();
    }

    for candidate in &candidates {
        // SAFETY: pinned by the candidate
        let header = unsafe { candidate.0.as_ref() };
        header.remove_flags(HeaderFlags::BUFFERED);
        if header.color() == Color::Purple {
            header.set_color(Color::Black);
        }
    }

    collection.phase = Phase::Collect;
    for &root in &roots {
        collection.collect(root);
        collection.drain();
    }

    let whites = mem::take(&mut collection.whites);
    for &white in &whites {
        // SAFETY: still allocated, edges from other whites are not released
        unsafe { white.as_ref() }.inc_weak();
    }
    for &white in &whites {
        // SAFETY: flagged COLLECTED by this round and pinned above
        unsafe { Header::destroy_collected(white) };
    }
    for &white in &whites {
        // SAFETY: releases the pin taken above
        unsafe { Header::dec_weak(white) };
    }
    for candidate in candidates.iter() {
        // SAFETY: releases the candidate's pin
        unsafe { Header::dec_weak(candidate.0) };
    }

    let stats = CollectionStats {
        candidates: candidates.len(),
        roots: roots.len(),
        collected: whites.len(),
    };
    ROUNDS.fetch_add(1, Ordering::Relaxed);
    CANDIDATES.fetch_add(stats.candidates, Ordering::Relaxed);
    COLLECTED.fetch_add(stats.collected, Ordering::Relaxed);
    debug!(
        "collection round: {} candidates, {} roots, {} collected",
        stats.candidates, stats.roots, stats.collected
    );
    stats
}

// ── traversal ─────────────────────────────────────────────────────────

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    Mark,
    Scan,
    Reach,
    Collect,
}

/// State of one round's traversal, also the visitor objects report their
/// edges to.
pub(crate) struct Collection {
    phase: Phase,
    stack: Vec<NonNull<Header>>,
    // separate so a nested reach can run inside a scan
    reach_stack: Vec<NonNull<Header>>,
    whites: Vec<NonNull<Header>>,
    // edges reported by the node being traced
    edges: Vec<NonNull<Header>>,
    contended: bool,
    opaque: HashSet<NonNull<Header>, ahash::RandomState>,
}

impl Collection {
    fn new() -> Self {
        Self {
            phase: Phase::Mark,
            stack: Vec::new(),
            reach_stack: Vec::new(),
            whites: Vec::new(),
            edges: Vec::new(),
            contended: false,
            opaque: HashSet::with_hasher(ahash::RandomState::new()),
        }
    }

    fn mark_root(&mut self, ptr: NonNull<Header>) {
        // SAFETY: pinned by the candidate
        let header = unsafe { ptr.as_ref() };
        if header.color() != Color::Gray {
            header.set_color(Color::Gray);
            header.reset_shared_reachable();
            self.stack.push(ptr);
        }
        self.drain();
    }

    /// Grey `ptr` and count one internal edge into it.
    pub(crate) fn mark(&mut self, ptr: NonNull<Header>) {
        // SAFETY: reached through an owning edge
        let header = unsafe { ptr.as_ref() };
        if header.color() != Color::Gray {
            header.set_color(Color::Gray);
            header.reset_shared_reachable();
            self.stack.push(ptr);
        }
        header.dec_shared_reachable();
    }

    pub(crate) fn scan(&mut self, ptr: NonNull<Header>) {
        // SAFETY: reached through an owning edge
        let header = unsafe { ptr.as_ref() };
        if header.color() != Color::Gray {
            return;
        }
        if header.shared_reachable_count() > 0 || self.opaque.contains(&ptr) {
            self.scan_black(ptr);
        } else {
            header.set_color(Color::White);
            self.stack.push(ptr);
        }
    }

    fn scan_black(&mut self, ptr: NonNull<Header>) {
        // SAFETY: reached through an owning edge
        unsafe { ptr.as_ref() }.set_color(Color::Black);
        let phase = mem::replace(&mut self.phase, Phase::Reach);
        self.reach_stack.push(ptr);
        while let Some(next) = self.reach_stack.pop() {
            self.trace_children(next);
        }
        self.phase = phase;
    }

    /// Restore one internal edge into a node reachable from outside.
    pub(crate) fn reach(&mut self, ptr: NonNull<Header>) {
        // SAFETY: reached through an owning edge
        let header = unsafe { ptr.as_ref() };
        header.inc_shared_reachable();
        if header.color() != Color::Black {
            header.set_color(Color::Black);
            self.reach_stack.push(ptr);
        }
    }

    pub(crate) fn collect(&mut self, ptr: NonNull<Header>) {
        // SAFETY: reached through an owning edge
        let header = unsafe { ptr.as_ref() };
        if header.color() != Color::White
            || header.flags().contains(HeaderFlags::COLLECTED)
        {
            return;
        }
        header.set_color(Color::Black);
        header.insert_flags(HeaderFlags::COLLECTED);
        trace!("collecting {} at {:p}", header.type_name(), ptr);
        self.whites.push(ptr);
        self.stack.push(ptr);
    }

    fn drain(&mut self) {
        while let Some(next) = self.stack.pop() {
            self.trace_children(next);
        }
    }

    fn trace_children(&mut self, ptr: NonNull<Header>) {
        // SAFETY: reached through an owning edge
        if unsafe { ptr.as_ref() }.is_destroyed() || self.opaque.contains(&ptr) {
            return;
        }
        // SAFETY: alive, checked above
        let object = unsafe { Header::object(ptr) };
        object.trace(self);
        let mut edges = mem::take(&mut self.edges);
        if mem::take(&mut self.contended) {
            trace!("{:p} is locked, keeping it live", ptr);
            self.opaque.insert(ptr);
        } else {
            for &edge in &edges {
                self.step(edge);
            }
        }
        edges.clear();
        self.edges = edges;
    }

    fn step(&mut self, ptr: NonNull<Header>) {
        match self.phase {
            Phase::Mark => self.mark(ptr),
            Phase::Scan => self.scan(ptr),
            Phase::Reach => self.reach(ptr),
            Phase::Collect => self.collect(ptr),
        }
    }
}

impl Visitor for Collection {
    fn visit(&mut self, edge: Edge<'_>) {
        let (target, label) = match edge {
            Edge::Shared(raw) => (NonNull::new(raw.target()), raw.label().collectable()),
            // the target is not owned, the label is
            Edge::Weak(raw) => (None, raw.label().collectable()),
            // the root label is immortal and never part of a cycle
            Edge::Label(label) => (None, label.collectable()),
            Edge::Raw(ptr) => (Some(ptr), None),
        };
        self.edges.extend(target.into_iter().chain(label));
    }

    fn try_locks(&self) -> bool {
        self.phase == Phase::Mark
    }

    fn contended(&mut self) {
        self.contended = true;
    }
}
