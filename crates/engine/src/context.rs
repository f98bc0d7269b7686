//! Per-execution state threaded through the write path.
//!
//! A rebalance rewrites positions in the group it is repairing. Those writes
//! pass through the same post-commit hook as user edits, and must not schedule
//! another rebalance of the same group. The rebalancer marks its own
//! [`ExecutionContext`] with a [`RecursionGuard`]; the trigger checks the
//! context it was handed and nothing else.
//!
//! The flag lives in a `Cell`, so a context is `!Sync` and cannot be observed
//! from another thread. Each request and each job run builds its own.

use std::cell::Cell;

#[derive(Debug, Default)]
pub struct ExecutionContext {
    rebalancing: Cell<bool>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_rebalancing(&self) -> bool {
        self.rebalancing.get()
    }

    /// Mark this context as running a rebalance until the guard drops.
    pub fn enter_rebalance(&self) -> RecursionGuard<'_> {
        let previous = self.rebalancing.replace(true);
        RecursionGuard {
            ctx: self,
            previous,
        }
    }
}

/// Restores the context flag on drop, including while unwinding.
#[must_use = "the guard is released as soon as it is dropped"]
#[derive(Debug)]
pub struct RecursionGuard<'a> {
    ctx: &'a ExecutionContext,
    previous: bool,
}

impl Drop for RecursionGuard<'_> {
    fn drop(&mut self) {
        self.ctx.rebalancing.set(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn guard_resets_on_drop() {
        let ctx = ExecutionContext::new();
        {
            let _guard = ctx.enter_rebalance();
            assert!(ctx.is_rebalancing());
        }
        assert!(!ctx.is_rebalancing());
    }

    #[test]
    fn nested_guards_restore_outer_state() {
        let ctx = ExecutionContext::new();
        let outer = ctx.enter_rebalance();
        {
            let _inner = ctx.enter_rebalance();
        }
        assert!(ctx.is_rebalancing());
        drop(outer);
        assert!(!ctx.is_rebalancing());
    }

    #[test]
    fn guard_resets_when_job_panics() {
        let ctx = ExecutionContext::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = ctx.enter_rebalance();
            panic!("storage exploded mid-rebalance");
        }));
        assert!(result.is_err());
        assert!(!ctx.is_rebalancing());
    }

    #[test]
    fn contexts_are_independent() {
        let job = ExecutionContext::new();
        let request = ExecutionContext::new();
        let _guard = job.enter_rebalance();
        assert!(job.is_rebalancing());
        assert!(!request.is_rebalancing());
    }
}
