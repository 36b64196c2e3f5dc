//! Copy-on-write container payloads.
//!
//! One discipline backs every container kind: the payload lives behind an
//! `Rc`, cloning a handle is a refcount increment, and every mutating
//! operation goes through `make_mut`, which clones the payload first when it
//! is shared. A `None` payload is the null container and compares equal to
//! an empty one.
//!
//! Growth above a small threshold preallocates 1.5x; below it, sizing is
//! exact (see `reserve_growing`).

use crate::error::{RuntimeError, RuntimeResult};
use crate::variant::Variant;
use std::cmp::Ordering;
use std::rc::Rc;

/// Buffers at or below this many elements are sized exactly on growth.
const PREALLOC_THRESHOLD: usize = 32;

fn prealloc(newsize: usize) -> usize {
    if newsize <= PREALLOC_THRESHOLD {
        PREALLOC_THRESHOLD * 2
    } else {
        newsize + newsize / 2
    }
}

/// Reserve capacity for `newsize` elements using the growth schedule:
/// half again over the requested size above the threshold, a fixed
/// doubling below it.
pub(crate) fn reserve_growing<T>(buf: &mut Vec<T>, newsize: usize) {
    if newsize > buf.capacity() {
        let cap = prealloc(newsize);
        buf.reserve_exact(cap - buf.len());
    }
}

fn index_check(i: i64, len: usize) -> RuntimeResult<usize> {
    if i < 0 || i as usize >= len {
        return Err(RuntimeError::Index(i));
    }
    Ok(i as usize)
}

// --- Byte strings --------------------------------------------------------

/// Reference-counted CoW byte string.
#[derive(Clone, Default)]
pub struct Str {
    obj: Option<Rc<Vec<u8>>>,
}

impl Str {
    pub fn new() -> Self {
        Str { obj: None }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            Str { obj: None }
        } else {
            Str { obj: Some(Rc::new(bytes.to_vec())) }
        }
    }

    pub fn from_char(b: u8) -> Self {
        Str { obj: Some(Rc::new(vec![b])) }
    }

    pub fn len(&self) -> usize {
        self.obj.as_ref().map_or(0, |o| o.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.obj.as_ref().map_or(&[], |o| o.as_slice())
    }

    /// Uniquify the payload: allocate when null, clone when shared.
    fn make_mut(&mut self) -> &mut Vec<u8> {
        Rc::make_mut(self.obj.get_or_insert_with(|| Rc::new(Vec::new())))
    }

    pub fn push(&mut self, b: u8) {
        let len = self.len();
        let buf = self.make_mut();
        reserve_growing(buf, len + 1);
        buf.push(b);
    }

    pub fn append(&mut self, other: &Str) {
        if other.is_empty() {
            return;
        }
        // Hold the source payload alive; self-append must read the
        // pre-mutation bytes
        let src = other.obj.clone();
        let src = src.as_ref().map_or(&[][..], |o| o.as_slice());
        let len = self.len();
        let buf = self.make_mut();
        reserve_growing(buf, len + src.len());
        buf.extend_from_slice(src);
    }

    pub fn at(&self, i: i64) -> RuntimeResult<u8> {
        let i = index_check(i, self.len())?;
        Ok(self.as_bytes()[i])
    }

    pub fn put(&mut self, i: i64, b: u8) -> RuntimeResult<()> {
        let i = index_check(i, self.len())?;
        self.make_mut()[i] = b;
        Ok(())
    }

    pub fn insert(&mut self, i: i64, b: u8) -> RuntimeResult<()> {
        let len = self.len();
        if i < 0 || i as usize > len {
            return Err(RuntimeError::Index(i));
        }
        let buf = self.make_mut();
        reserve_growing(buf, len + 1);
        buf.insert(i as usize, b);
        Ok(())
    }

    pub fn erase(&mut self, i: i64) -> RuntimeResult<()> {
        let i = index_check(i, self.len())?;
        if self.len() == 1 {
            self.obj = None;
        } else {
            self.make_mut().remove(i);
        }
        Ok(())
    }

    /// Slice from `pos`; a `None` right bound means "to the end".
    pub fn substr(&self, pos: i64, count: Option<i64>) -> RuntimeResult<Str> {
        let len = self.len();
        if pos < 0 || pos as usize > len {
            return Err(RuntimeError::Index(pos));
        }
        let pos = pos as usize;
        let end = match count {
            None => len,
            Some(n) if n < 0 => return Err(RuntimeError::Index(n)),
            Some(n) => {
                let end = pos + n as usize;
                if end > len {
                    return Err(RuntimeError::Index(n));
                }
                end
            }
        };
        Ok(Str::from_bytes(&self.as_bytes()[pos..end]))
    }

    pub fn clear(&mut self) {
        self.obj = None;
    }
}

impl PartialEq for Str {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Str {}

impl PartialOrd for Str {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Str {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl std::fmt::Display for Str {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl std::fmt::Debug for Str {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

impl From<&str> for Str {
    fn from(s: &str) -> Self {
        Str::from_bytes(s.as_bytes())
    }
}

// --- Variant vectors -----------------------------------------------------

/// Reference-counted CoW vector of variants. Also backs the sparse
/// ordinal-indexed dictionary, where `Void` slots are missing entries.
#[derive(Clone, Default)]
pub struct VarVec {
    obj: Option<Rc<Vec<Variant>>>,
}

impl PartialEq for VarVec {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for VarVec {}

impl VarVec {
    pub fn new() -> Self {
        VarVec { obj: None }
    }

    pub fn from_elem(v: Variant) -> Self {
        VarVec { obj: Some(Rc::new(vec![v])) }
    }

    pub fn len(&self) -> usize {
        self.obj.as_ref().map_or(0, |o| o.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[Variant] {
        self.obj.as_ref().map_or(&[], |o| o.as_slice())
    }

    fn make_mut(&mut self) -> &mut Vec<Variant> {
        Rc::make_mut(self.obj.get_or_insert_with(|| Rc::new(Vec::new())))
    }

    pub fn push(&mut self, v: Variant) {
        let len = self.len();
        let buf = self.make_mut();
        reserve_growing(buf, len + 1);
        buf.push(v);
    }

    pub fn append(&mut self, other: &VarVec) {
        if other.is_empty() {
            return;
        }
        let src = other.obj.clone();
        let src = src.as_ref().map_or(&[][..], |o| o.as_slice());
        let len = self.len();
        let buf = self.make_mut();
        reserve_growing(buf, len + src.len());
        buf.extend_from_slice(src);
    }

    pub fn at(&self, i: i64) -> RuntimeResult<Variant> {
        let i = index_check(i, self.len())?;
        Ok(self.as_slice()[i].clone())
    }

    pub fn put(&mut self, i: i64, v: Variant) -> RuntimeResult<()> {
        let i = index_check(i, self.len())?;
        self.make_mut()[i] = v;
        Ok(())
    }

    pub fn with_elem_mut<R>(
        &mut self,
        i: i64,
        f: impl FnOnce(&mut Variant) -> R,
    ) -> RuntimeResult<R> {
        let i = index_check(i, self.len())?;
        Ok(f(&mut self.make_mut()[i]))
    }

    pub fn insert(&mut self, i: i64, v: Variant) -> RuntimeResult<()> {
        let len = self.len();
        if i < 0 || i as usize > len {
            return Err(RuntimeError::Index(i));
        }
        let buf = self.make_mut();
        reserve_growing(buf, len + 1);
        buf.insert(i as usize, v);
        Ok(())
    }

    pub fn erase(&mut self, i: i64) -> RuntimeResult<()> {
        let i = index_check(i, self.len())?;
        if self.len() == 1 {
            self.obj = None;
        } else {
            self.make_mut().remove(i);
        }
        Ok(())
    }

    pub fn subvec(&self, pos: i64, count: Option<i64>) -> RuntimeResult<VarVec> {
        let len = self.len();
        if pos < 0 || pos as usize > len {
            return Err(RuntimeError::Index(pos));
        }
        let pos = pos as usize;
        let end = match count {
            None => len,
            Some(n) if n < 0 => return Err(RuntimeError::Index(n)),
            Some(n) => {
                let end = pos + n as usize;
                if end > len {
                    return Err(RuntimeError::Index(n));
                }
                end
            }
        };
        let slice = &self.as_slice()[pos..end];
        if slice.is_empty() {
            Ok(VarVec::new())
        } else {
            Ok(VarVec { obj: Some(Rc::new(slice.to_vec())) })
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variant> {
        self.as_slice().iter()
    }

    // Sparse (ordinal-keyed) access: a Void slot is a missing entry,
    // keys are limited to 0..=255

    pub fn sparse_get(&self, key: i64) -> RuntimeResult<Variant> {
        if key < 0 || key as usize >= self.len() {
            return Err(RuntimeError::Key(key.to_string()));
        }
        let v = &self.as_slice()[key as usize];
        if matches!(v, Variant::Void) {
            return Err(RuntimeError::Key(key.to_string()));
        }
        Ok(v.clone())
    }

    pub fn sparse_put(&mut self, key: i64, v: Variant) -> RuntimeResult<()> {
        if !(0..=255).contains(&key) {
            return Err(RuntimeError::Key(key.to_string()));
        }
        let key = key as usize;
        let len = self.len();
        let buf = self.make_mut();
        if key >= len {
            reserve_growing(buf, key + 1);
            buf.resize(key + 1, Variant::Void);
        }
        buf[key] = v;
        Ok(())
    }

    pub fn sparse_remove(&mut self, key: i64) -> RuntimeResult<()> {
        if key < 0 || key as usize >= self.len() {
            return Err(RuntimeError::Key(key.to_string()));
        }
        self.make_mut()[key as usize] = Variant::Void;
        Ok(())
    }

    pub fn sparse_has(&self, key: i64) -> bool {
        key >= 0
            && (key as usize) < self.len()
            && !matches!(self.as_slice()[key as usize], Variant::Void)
    }
}

impl std::fmt::Debug for VarVec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

// --- Variant sets --------------------------------------------------------

/// Ordered set of variants: a sorted vector under the kind-aware comparator.
#[derive(Clone, Default)]
pub struct VarSet {
    obj: Option<Rc<Vec<Variant>>>,
}

impl PartialEq for VarSet {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for VarSet {}

impl VarSet {
    pub fn new() -> Self {
        VarSet { obj: None }
    }

    pub fn from_elem(v: Variant) -> Self {
        VarSet { obj: Some(Rc::new(vec![v])) }
    }

    pub fn len(&self) -> usize {
        self.obj.as_ref().map_or(0, |o| o.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[Variant] {
        self.obj.as_ref().map_or(&[], |o| o.as_slice())
    }

    fn make_mut(&mut self) -> &mut Vec<Variant> {
        Rc::make_mut(self.obj.get_or_insert_with(|| Rc::new(Vec::new())))
    }

    pub fn find_insert(&mut self, v: Variant) {
        match self.as_slice().binary_search(&v) {
            Ok(_) => {}
            Err(pos) => {
                let len = self.len();
                let buf = self.make_mut();
                reserve_growing(buf, len + 1);
                buf.insert(pos, v);
            }
        }
    }

    pub fn contains(&self, v: &Variant) -> bool {
        self.as_slice().binary_search(v).is_ok()
    }

    pub fn remove(&mut self, v: &Variant) -> bool {
        match self.as_slice().binary_search(v) {
            Ok(pos) => {
                if self.len() == 1 {
                    self.obj = None;
                } else {
                    self.make_mut().remove(pos);
                }
                true
            }
            Err(_) => false,
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variant> {
        self.as_slice().iter()
    }
}

impl std::fmt::Debug for VarSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// --- Dictionaries --------------------------------------------------------

/// Two parallel vectors, keys kept strictly ascending.
#[derive(Clone, Default, PartialEq, Debug)]
pub struct DictImpl {
    pub keys: Vec<Variant>,
    pub vals: Vec<Variant>,
}

/// Ordered variant-to-variant mapping.
#[derive(Clone, Default)]
pub struct VarDict {
    obj: Option<Rc<DictImpl>>,
}

impl PartialEq for VarDict {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl Eq for VarDict {}

impl VarDict {
    pub fn new() -> Self {
        VarDict { obj: None }
    }

    pub fn from_pair(key: Variant, val: Variant) -> Self {
        VarDict {
            obj: Some(Rc::new(DictImpl { keys: vec![key], vals: vec![val] })),
        }
    }

    pub fn len(&self) -> usize {
        self.obj.as_ref().map_or(0, |o| o.keys.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn impl_ref(&self) -> Option<&DictImpl> {
        self.obj.as_deref()
    }

    fn make_mut(&mut self) -> &mut DictImpl {
        Rc::make_mut(self.obj.get_or_insert_with(|| Rc::new(DictImpl::default())))
    }

    pub fn find(&self, key: &Variant) -> Option<Variant> {
        let d = self.impl_ref()?;
        let pos = d.keys.binary_search(key).ok()?;
        Some(d.vals[pos].clone())
    }

    pub fn has(&self, key: &Variant) -> bool {
        self.impl_ref()
            .is_some_and(|d| d.keys.binary_search(key).is_ok())
    }

    pub fn find_replace(&mut self, key: Variant, val: Variant) {
        let pos = match self.impl_ref() {
            Some(d) => d.keys.binary_search(&key),
            None => Err(0),
        };
        let d = self.make_mut();
        match pos {
            Ok(pos) => d.vals[pos] = val,
            Err(pos) => {
                let len = d.keys.len();
                reserve_growing(&mut d.keys, len + 1);
                reserve_growing(&mut d.vals, len + 1);
                d.keys.insert(pos, key);
                d.vals.insert(pos, val);
            }
        }
    }

    pub fn with_val_mut<R>(
        &mut self,
        key: &Variant,
        f: impl FnOnce(&mut Variant) -> R,
    ) -> RuntimeResult<R> {
        let pos = self
            .impl_ref()
            .and_then(|d| d.keys.binary_search(key).ok())
            .ok_or_else(|| RuntimeError::Key(key.to_string()))?;
        Ok(f(&mut self.make_mut().vals[pos]))
    }

    pub fn remove(&mut self, key: &Variant) -> bool {
        let pos = match self.impl_ref().and_then(|d| d.keys.binary_search(key).ok()) {
            Some(pos) => pos,
            None => return false,
        };
        if self.len() == 1 {
            self.obj = None;
        } else {
            let d = self.make_mut();
            d.keys.remove(pos);
            d.vals.remove(pos);
        }
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Variant, &Variant)> {
        let (keys, vals) = match self.impl_ref() {
            Some(d) => (d.keys.as_slice(), d.vals.as_slice()),
            None => (&[][..], &[][..]),
        };
        keys.iter().zip(vals.iter())
    }

    pub fn key_at(&self, i: usize) -> Option<&Variant> {
        self.impl_ref().and_then(|d| d.keys.get(i))
    }

    pub fn val_at(&self, i: usize) -> Option<&Variant> {
        self.impl_ref().and_then(|d| d.vals.get(i))
    }
}

impl std::fmt::Debug for VarDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

// --- Ranges --------------------------------------------------------------

/// Inclusive ordinal interval.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RangeObj {
    pub left: i64,
    pub right: i64,
}

/// Range value; `left > right` is the canonical empty range and is stored
/// as a null payload.
#[derive(Clone, Default)]
pub struct VarRange {
    obj: Option<Rc<RangeObj>>,
}

impl VarRange {
    pub fn new(left: i64, right: i64) -> Self {
        if left > right {
            VarRange { obj: None }
        } else {
            VarRange { obj: Some(Rc::new(RangeObj { left, right })) }
        }
    }

    pub fn empty() -> Self {
        VarRange { obj: None }
    }

    pub fn is_empty(&self) -> bool {
        self.obj.is_none()
    }

    pub fn bounds(&self) -> Option<(i64, i64)> {
        self.obj.as_ref().map(|r| (r.left, r.right))
    }

    pub fn has(&self, v: i64) -> bool {
        self.bounds().is_some_and(|(l, r)| l <= v && v <= r)
    }
}

impl PartialEq for VarRange {
    fn eq(&self, other: &Self) -> bool {
        match (self.bounds(), other.bounds()) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for VarRange {}

impl PartialOrd for VarRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VarRange {
    fn cmp(&self, other: &Self) -> Ordering {
        // empty ranges order first
        match (self.bounds(), other.bounds()) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(&b),
        }
    }
}

impl std::fmt::Debug for VarRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.bounds() {
            Some((l, r)) => write!(f, "{}..{}", l, r),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str_cow() {
        let mut a = Str::from("hello");
        let b = a.clone();
        a.push(b'!');
        assert_eq!(a.as_bytes(), b"hello!");
        assert_eq!(b.as_bytes(), b"hello");
    }

    #[test]
    fn test_str_null_equals_empty() {
        let null = Str::new();
        let mut empty = Str::from("x");
        empty.erase(0).unwrap();
        assert_eq!(null, empty);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_str_self_append() {
        let mut s = Str::from("ab");
        let alias = s.clone();
        s.append(&alias);
        assert_eq!(s.as_bytes(), b"abab");
    }

    #[test]
    fn test_str_substr_open_end() {
        let s = Str::from("abcdef");
        assert_eq!(s.substr(2, None).unwrap().as_bytes(), b"cdef");
        assert_eq!(s.substr(1, Some(2)).unwrap().as_bytes(), b"bc");
        assert!(s.substr(7, None).is_err());
    }

    #[test]
    fn test_vec_cow_on_put() {
        let mut a = VarVec::new();
        a.push(Variant::Ord(1));
        a.push(Variant::Ord(2));
        let b = a.clone();
        a.put(0, Variant::Ord(9)).unwrap();
        assert_eq!(a.at(0).unwrap(), Variant::Ord(9));
        assert_eq!(b.at(0).unwrap(), Variant::Ord(1));
    }

    #[test]
    fn test_set_sorted_insert() {
        let mut s = VarSet::new();
        for v in [3, 1, 2, 1] {
            s.find_insert(Variant::Ord(v));
        }
        let items: Vec<_> = s.iter().cloned().collect();
        assert_eq!(items, vec![Variant::Ord(1), Variant::Ord(2), Variant::Ord(3)]);
        assert!(s.contains(&Variant::Ord(2)));
        assert!(!s.contains(&Variant::Ord(4)));
    }

    #[test]
    fn test_dict_replace_and_remove() {
        let mut d = VarDict::new();
        d.find_replace(Variant::Ord(2), Variant::from("two"));
        d.find_replace(Variant::Ord(1), Variant::from("one"));
        d.find_replace(Variant::Ord(2), Variant::from("TWO"));
        assert_eq!(d.len(), 2);
        assert_eq!(d.find(&Variant::Ord(2)), Some(Variant::from("TWO")));
        assert!(d.remove(&Variant::Ord(1)));
        assert!(!d.remove(&Variant::Ord(1)));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_sparse_dict_holes() {
        let mut v = VarVec::new();
        v.sparse_put(3, Variant::Ord(30)).unwrap();
        assert_eq!(v.len(), 4);
        assert!(v.sparse_get(0).is_err());
        assert_eq!(v.sparse_get(3).unwrap(), Variant::Ord(30));
        assert!(v.sparse_put(256, Variant::Void).is_err());
        v.sparse_remove(3).unwrap();
        assert!(!v.sparse_has(3));
    }

    #[test]
    fn test_range_empty_and_membership() {
        let r = VarRange::new(10, 20);
        assert!(r.has(10) && r.has(20) && !r.has(21));
        let e = VarRange::new(5, 4);
        assert!(e.is_empty());
        assert_eq!(e, VarRange::empty());
        assert_ne!(r, e);
    }
}
