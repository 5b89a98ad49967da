//! Static reference cells.
//!
//! A [`StaticRef`] is a stable storage location for one `Value`: static
//! fields, type tokens and the interned command-line arguments all live in
//! these cells. The GC treats every cell as a root and never moves the
//! cell itself, so its address may be handed out freely (this is what a
//! `STATIC_REFERENCE` value points at).
//!
//! Cells are allocated out of fixed-size [`StaticRefBlock`]s chained into
//! a list owned by the GC.

use crate::sync::SpinLock;
use crate::value::{Value, NULL_VALUE};

/// A lock-protected cell holding one `Value`.
pub struct StaticRef {
    access: SpinLock,
    value: Value,
}

impl StaticRef {
    pub fn new() -> Self {
        Self {
            access: SpinLock::new(),
            value: NULL_VALUE,
        }
    }

    /// Initialises the cell. Call once, before the cell is shared.
    pub fn init(&mut self, value: Value) {
        self.value = value;
    }

    /// Atomically reads the cell.
    #[inline]
    pub fn read(&self) -> Value {
        self.access.enter();
        let result = self.value;
        self.access.leave();
        result
    }

    /// Atomically updates the cell.
    #[inline]
    pub fn write(&mut self, value: Value) {
        self.access.enter();
        self.value = value;
        self.access.leave();
    }

    /// Direct pointer to the stored value. The GC uses this to examine and
    /// update the cell during a cycle, when no managed code runs.
    #[inline]
    pub fn value_ptr(&mut self) -> *mut Value {
        &mut self.value as *mut Value
    }
}

impl Default for StaticRef {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed-size block of static reference cells.
pub struct StaticRefBlock {
    pub next: *mut StaticRefBlock,
    pub count: usize,
    /// Set during a cycle if any cell in the block references a gen0
    /// object; lets the fix-up phase skip clean blocks.
    pub has_gen0_refs: bool,
    pub values: [StaticRef; StaticRefBlock::BLOCK_SIZE],
}

impl StaticRefBlock {
    pub const BLOCK_SIZE: usize = 128;

    pub fn new(next: *mut StaticRefBlock) -> Box<StaticRefBlock> {
        Box::new(StaticRefBlock {
            next,
            count: 0,
            has_gen0_refs: false,
            values: std::array::from_fn(|_| StaticRef::new()),
        })
    }

    pub fn is_full(&self) -> bool {
        self.count == Self::BLOCK_SIZE
    }

    /// Claims the next free cell, initialised to `value`.
    pub fn add(&mut self, value: Value) -> *mut StaticRef {
        debug_assert!(!self.is_full());
        let cell = &mut self.values[self.count];
        self.count += 1;
        cell.init(value);
        cell as *mut StaticRef
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let mut cell = StaticRef::new();
        assert!(cell.read().is_null());

        let v = Value::of_uint(std::ptr::null_mut(), 42);
        cell.write(v);
        assert_eq!(cell.read().as_uint(), 42);
    }

    #[test]
    fn test_block_fills_up() {
        let mut block = StaticRefBlock::new(std::ptr::null_mut());
        for _ in 0..StaticRefBlock::BLOCK_SIZE {
            assert!(!block.is_full());
            block.add(NULL_VALUE);
        }
        assert!(block.is_full());
    }
}
