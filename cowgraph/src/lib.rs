//! Reference-counted, cycle-collected object graphs with lazy deep
//! copy-on-write cloning across labels.
//!
//! Every heap node is an [`Object`] stored behind a [`Header`] that carries
//! its shared/weak counts and state flags. Application code holds nodes
//! through [`Shared`] and [`Weak`] pointers; each pointer also carries a
//! [`LabelPtr`] naming the label (clone generation) that resolves it. A
//! [`Shared::deep_clone`] freezes the reachable graph and hands out a pointer
//! under a fresh label; copies are only made when a label pulls a frozen
//! node for mutation. The [`collector`] reclaims cycles that plain reference
//! counting cannot free.

/// Log an internal invariant violation and abort the process.
///
/// Memory-model corruption is never surfaced as a recoverable error.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        eprintln!("cowgraph: fatal: {}", format_args!($($arg)*));
        std::process::abort()
    }};
}

pub mod collector;
mod header;
mod label;
mod label_ptr;
mod object;
mod settings;
mod shared;
mod visitor;
mod weak;

#[cfg(test)]
mod testing;

pub use collector::{CollectionStats, CollectorStats, collect_cycles, maybe_collect};
pub use header::{Color, Header, HeaderFlags};
pub use label::Label;
pub use label_ptr::{LabelPtr, LabelRef};
pub use object::{Construct, Object, Pointee, cast_optional, cast_value, make};
pub use settings::{CollectorCreateInfo, CollectorSettings, configure, settings};
pub use shared::{RawShared, Ref, Shared};
pub use visitor::{Edge, Trace, Visitor};
pub use weak::{RawWeak, Weak};
