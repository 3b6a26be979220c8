//! Process-wide monotone id allocation
//!
//! DAP hands out several flavors of integer handles. They are allocated
//! here, inside one explicit context passed down to the components that
//! need them, never from free-floating globals.

use std::sync::atomic::{AtomicI64, Ordering};

pub struct AdapterContext {
    next_source_reference: AtomicI64,
    next_breakpoint_id: AtomicI64,
    next_frame_id: AtomicI64,
    next_variables_reference: AtomicI64,
    next_thread_id: AtomicI64,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            next_source_reference: AtomicI64::new(1),
            next_breakpoint_id: AtomicI64::new(1),
            next_frame_id: AtomicI64::new(1),
            next_variables_reference: AtomicI64::new(1),
            next_thread_id: AtomicI64::new(1),
        }
    }

    pub fn next_source_reference(&self) -> i64 {
        self.next_source_reference.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_breakpoint_id(&self) -> i64 {
        self.next_breakpoint_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_frame_id(&self) -> i64 {
        self.next_frame_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_variables_reference(&self) -> i64 {
        self.next_variables_reference.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_thread_id(&self) -> i64 {
        self.next_thread_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}
