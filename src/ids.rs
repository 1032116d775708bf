//! Process-wide identity types shared by the signaling core and the module
//! graph. Kept separate from both so that `signal` (which needs `ModuleId`
//! for processor ownership) does not have to depend on `module` (which
//! depends on `signal` for its façade) — see spec §2's leaves-first
//! dependency order.

use std::sync::atomic::{AtomicU64, Ordering};

/// A module's identity within whatever agent currently owns it. Distinct
/// from the module's `TypeId`: two non-singleton instances of the same
/// concrete type get distinct `ModuleId`s, so processor ownership and
/// preferred-order matching operate on the instance, not the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(u64);

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(0);

impl ModuleId {
    pub(crate) fn next() -> Self {
        ModuleId(NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed))
    }
}
