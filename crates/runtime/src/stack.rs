//! The interpreter's value stack.
//!
//! A preallocated vector of variants with explicit push/pop discipline. The
//! interpreter addresses locals at non-negative offsets from a frame base
//! pointer and arguments at negative offsets; both resolve through
//! `at`/`at_mut` here.

use crate::error::{RuntimeError, RuntimeResult};
use crate::variant::Variant;

pub struct RtStack {
    items: Vec<Variant>,
}

impl RtStack {
    /// Preallocate for the given depth (a closed code segment's recorded
    /// peak plus call headroom).
    pub fn new(capacity: usize) -> Self {
        RtStack { items: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, v: Variant) {
        self.items.push(v);
    }

    pub fn pop(&mut self) -> RuntimeResult<Variant> {
        self.items
            .pop()
            .ok_or_else(|| RuntimeError::Other("Stack underflow".into()))
    }

    pub fn top(&self) -> RuntimeResult<&Variant> {
        self.items
            .last()
            .ok_or_else(|| RuntimeError::Other("Stack underflow".into()))
    }

    pub fn top_mut(&mut self) -> RuntimeResult<&mut Variant> {
        self.items
            .last_mut()
            .ok_or_else(|| RuntimeError::Other("Stack underflow".into()))
    }

    /// Second-from-top, for binary ops that fold into their left operand.
    pub fn under_top_mut(&mut self) -> RuntimeResult<&mut Variant> {
        let len = self.items.len();
        if len < 2 {
            return Err(RuntimeError::Other("Stack underflow".into()));
        }
        Ok(&mut self.items[len - 2])
    }

    /// Absolute index from a base pointer and a signed offset.
    pub fn index(bp: usize, offs: i64) -> usize {
        (bp as i64 + offs) as usize
    }

    pub fn at(&self, i: usize) -> RuntimeResult<&Variant> {
        self.items
            .get(i)
            .ok_or_else(|| RuntimeError::Other(format!("Bad stack slot: {}", i)))
    }

    pub fn at_mut(&mut self, i: usize) -> RuntimeResult<&mut Variant> {
        self.items
            .get_mut(i)
            .ok_or_else(|| RuntimeError::Other(format!("Bad stack slot: {}", i)))
    }

    /// Drop everything above `len`; the interpreter's unwinder uses this to
    /// restore the caller's frame on error.
    pub fn truncate(&mut self, len: usize) {
        self.items.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let mut s = RtStack::new(8);
        s.push(Variant::Ord(1));
        s.push(Variant::Ord(2));
        assert_eq!(s.pop().unwrap(), Variant::Ord(2));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_underflow_is_error() {
        let mut s = RtStack::new(4);
        assert!(s.pop().is_err());
        assert!(s.top().is_err());
    }

    #[test]
    fn test_negative_frame_offsets() {
        let mut s = RtStack::new(8);
        s.push(Variant::Ord(10)); // arg at bp-1
        let bp = s.len();
        s.push(Variant::Ord(20)); // local at bp+0
        assert_eq!(*s.at(RtStack::index(bp, -1)).unwrap(), Variant::Ord(10));
        assert_eq!(*s.at(RtStack::index(bp, 0)).unwrap(), Variant::Ord(20));
    }

    #[test]
    fn test_truncate_unwind() {
        let mut s = RtStack::new(8);
        s.push(Variant::Ord(1));
        let base = s.len();
        s.push(Variant::Ord(2));
        s.push(Variant::Ord(3));
        s.truncate(base);
        assert_eq!(s.len(), 1);
    }
}
