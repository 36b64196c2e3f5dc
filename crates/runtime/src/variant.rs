//! The tagged runtime value.
//!
//! Every value the VM manipulates is a `Variant`. Copying shares the
//! underlying container object (refcount increment); mutation goes through
//! the container's CoW discipline. Accessors are kind-checked and fail with
//! `RuntimeError::KindMismatch` rather than panicking.

use crate::container::{Str, VarDict, VarRange, VarSet, VarVec};
use crate::error::{RuntimeError, RuntimeResult};
use crate::ordset::OrdSet;
use crate::rtobj::RtObj;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

/// A mutable reference to a variant cell owned elsewhere.
///
/// Referents are promoted to heap cells when the reference is made, so a
/// reference can never dangle into popped stack space.
#[derive(Clone, Debug)]
pub struct VarRef(pub Rc<RefCell<Variant>>);

impl VarRef {
    pub fn new(v: Variant) -> Self {
        VarRef(Rc::new(RefCell::new(v)))
    }

    pub fn get(&self) -> Variant {
        self.0.borrow().clone()
    }

    pub fn set(&self, v: Variant) {
        *self.0.borrow_mut() = v;
    }
}

impl PartialEq for VarRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Kind tags, also used as the `LoadEmptyVar` immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum VariantKind {
    Void = 0,
    Ord,
    Real,
    Str,
    Vec,
    Set,
    OrdSet,
    Dict,
    Range,
    Ref,
    RtObj,
}

impl VariantKind {
    pub fn from_u8(b: u8) -> RuntimeResult<VariantKind> {
        use VariantKind::*;
        Ok(match b {
            0 => Void,
            1 => Ord,
            2 => Real,
            3 => Str,
            4 => Vec,
            5 => Set,
            6 => OrdSet,
            7 => Dict,
            8 => Range,
            9 => Ref,
            10 => RtObj,
            _ => return Err(RuntimeError::Other(format!("Bad variant kind tag: {}", b))),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            VariantKind::Void => "void",
            VariantKind::Ord => "ordinal",
            VariantKind::Real => "real",
            VariantKind::Str => "string",
            VariantKind::Vec => "vector",
            VariantKind::Set => "set",
            VariantKind::OrdSet => "ordinal set",
            VariantKind::Dict => "dictionary",
            VariantKind::Range => "range",
            VariantKind::Ref => "reference",
            VariantKind::RtObj => "object",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub enum Variant {
    #[default]
    Void,
    /// Signed integer; also carries bool, char and enum values
    Ord(i64),
    /// Reserved, no arithmetic is defined over it
    Real(f64),
    Str(Str),
    Vec(VarVec),
    Set(VarSet),
    OrdSet(OrdSet),
    Dict(VarDict),
    Range(VarRange),
    Ref(VarRef),
    /// Opaque runtime object: type descriptors and state instances
    RtObj(RtObj),
}

fn mismatch<T>(expected: &'static str, found: VariantKind) -> RuntimeResult<T> {
    Err(RuntimeError::KindMismatch { expected, found: found.name() })
}

impl Variant {
    /// Construct the canonical empty value of a kind.
    pub fn empty_of(kind: VariantKind) -> Variant {
        match kind {
            VariantKind::Void => Variant::Void,
            VariantKind::Ord => Variant::Ord(0),
            VariantKind::Real => Variant::Real(0.0),
            VariantKind::Str => Variant::Str(Str::new()),
            VariantKind::Vec => Variant::Vec(VarVec::new()),
            VariantKind::Set => Variant::Set(VarSet::new()),
            VariantKind::OrdSet => Variant::OrdSet(OrdSet::new()),
            VariantKind::Dict => Variant::Dict(VarDict::new()),
            VariantKind::Range => Variant::Range(VarRange::empty()),
            VariantKind::Ref => Variant::Void,
            VariantKind::RtObj => Variant::Void,
        }
    }

    pub fn kind(&self) -> VariantKind {
        match self {
            Variant::Void => VariantKind::Void,
            Variant::Ord(_) => VariantKind::Ord,
            Variant::Real(_) => VariantKind::Real,
            Variant::Str(_) => VariantKind::Str,
            Variant::Vec(_) => VariantKind::Vec,
            Variant::Set(_) => VariantKind::Set,
            Variant::OrdSet(_) => VariantKind::OrdSet,
            Variant::Dict(_) => VariantKind::Dict,
            Variant::Range(_) => VariantKind::Range,
            Variant::Ref(_) => VariantKind::Ref,
            Variant::RtObj(_) => VariantKind::RtObj,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Variant::Void)
    }

    // --- kind-checked accessors

    pub fn as_ord(&self) -> RuntimeResult<i64> {
        match self {
            Variant::Ord(v) => Ok(*v),
            other => mismatch("ordinal", other.kind()),
        }
    }

    pub fn as_ord_mut(&mut self) -> RuntimeResult<&mut i64> {
        match self {
            Variant::Ord(v) => Ok(v),
            other => mismatch("ordinal", other.kind()),
        }
    }

    /// Ordinal narrowed to a byte, range-checked.
    pub fn as_byte(&self) -> RuntimeResult<u8> {
        let v = self.as_ord()?;
        u8::try_from(v).map_err(|_| RuntimeError::Range(v))
    }

    pub fn as_str(&self) -> RuntimeResult<&Str> {
        match self {
            Variant::Str(s) => Ok(s),
            other => mismatch("string", other.kind()),
        }
    }

    pub fn as_str_mut(&mut self) -> RuntimeResult<&mut Str> {
        match self {
            Variant::Str(s) => Ok(s),
            other => mismatch("string", other.kind()),
        }
    }

    pub fn as_vec(&self) -> RuntimeResult<&VarVec> {
        match self {
            Variant::Vec(v) => Ok(v),
            other => mismatch("vector", other.kind()),
        }
    }

    pub fn as_vec_mut(&mut self) -> RuntimeResult<&mut VarVec> {
        match self {
            Variant::Vec(v) => Ok(v),
            other => mismatch("vector", other.kind()),
        }
    }

    pub fn as_set(&self) -> RuntimeResult<&VarSet> {
        match self {
            Variant::Set(s) => Ok(s),
            other => mismatch("set", other.kind()),
        }
    }

    pub fn as_set_mut(&mut self) -> RuntimeResult<&mut VarSet> {
        match self {
            Variant::Set(s) => Ok(s),
            other => mismatch("set", other.kind()),
        }
    }

    pub fn as_ordset(&self) -> RuntimeResult<&OrdSet> {
        match self {
            Variant::OrdSet(s) => Ok(s),
            other => mismatch("ordinal set", other.kind()),
        }
    }

    pub fn as_ordset_mut(&mut self) -> RuntimeResult<&mut OrdSet> {
        match self {
            Variant::OrdSet(s) => Ok(s),
            other => mismatch("ordinal set", other.kind()),
        }
    }

    pub fn as_dict(&self) -> RuntimeResult<&VarDict> {
        match self {
            Variant::Dict(d) => Ok(d),
            other => mismatch("dictionary", other.kind()),
        }
    }

    pub fn as_dict_mut(&mut self) -> RuntimeResult<&mut VarDict> {
        match self {
            Variant::Dict(d) => Ok(d),
            other => mismatch("dictionary", other.kind()),
        }
    }

    pub fn as_range(&self) -> RuntimeResult<&VarRange> {
        match self {
            Variant::Range(r) => Ok(r),
            other => mismatch("range", other.kind()),
        }
    }

    pub fn as_ref_cell(&self) -> RuntimeResult<&VarRef> {
        match self {
            Variant::Ref(r) => Ok(r),
            other => mismatch("reference", other.kind()),
        }
    }

    pub fn as_rtobj(&self) -> RuntimeResult<&RtObj> {
        match self {
            Variant::RtObj(o) => Ok(o),
            other => mismatch("object", other.kind()),
        }
    }

    /// True for void values and empty containers.
    pub fn is_empty(&self) -> bool {
        match self {
            Variant::Void => true,
            Variant::Ord(v) => *v == 0,
            Variant::Real(v) => *v == 0.0,
            Variant::Str(s) => s.is_empty(),
            Variant::Vec(v) => v.is_empty(),
            Variant::Set(s) => s.is_empty(),
            Variant::OrdSet(s) => s.is_empty(),
            Variant::Dict(d) => d.is_empty(),
            Variant::Range(r) => r.is_empty(),
            Variant::Ref(_) | Variant::RtObj(_) => false,
        }
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Variant::Void, Variant::Void) => true,
            (Variant::Ord(a), Variant::Ord(b)) => a == b,
            (Variant::Real(a), Variant::Real(b)) => a.to_bits() == b.to_bits(),
            (Variant::Str(a), Variant::Str(b)) => a == b,
            (Variant::Vec(a), Variant::Vec(b)) => a == b,
            (Variant::Set(a), Variant::Set(b)) => a == b,
            (Variant::OrdSet(a), Variant::OrdSet(b)) => a == b,
            (Variant::Dict(a), Variant::Dict(b)) => a == b,
            (Variant::Range(a), Variant::Range(b)) => a == b,
            (Variant::Ref(a), Variant::Ref(b)) => a == b,
            (Variant::RtObj(a), Variant::RtObj(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Variant {}

impl PartialOrd for Variant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Variant {
    /// Structural ordering within a kind; dissimilar kinds fall back to
    /// kind-tag ordering.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Variant::Void, Variant::Void) => Ordering::Equal,
            (Variant::Ord(a), Variant::Ord(b)) => a.cmp(b),
            (Variant::Real(a), Variant::Real(b)) => a.total_cmp(b),
            (Variant::Str(a), Variant::Str(b)) => a.cmp(b),
            (Variant::Vec(a), Variant::Vec(b)) => a.as_slice().cmp(b.as_slice()),
            (Variant::Set(a), Variant::Set(b)) => a.as_slice().cmp(b.as_slice()),
            (Variant::OrdSet(a), Variant::OrdSet(b)) => a.cmp(b),
            (Variant::Dict(a), Variant::Dict(b)) => {
                let keys = a.iter().map(|p| p.0).cmp(b.iter().map(|p| p.0));
                keys.then_with(|| a.iter().map(|p| p.1).cmp(b.iter().map(|p| p.1)))
            }
            (Variant::Range(a), Variant::Range(b)) => a.cmp(b),
            (Variant::Ref(a), Variant::Ref(b)) => {
                (Rc::as_ptr(&a.0) as usize).cmp(&(Rc::as_ptr(&b.0) as usize))
            }
            (Variant::RtObj(a), Variant::RtObj(b)) => {
                (Rc::as_ptr(a).cast::<u8>() as usize).cmp(&(Rc::as_ptr(b).cast::<u8>() as usize))
            }
            (a, b) => a.kind().cmp(&b.kind()),
        }
    }
}

impl std::fmt::Display for Variant {
    /// Untyped rendering, used by `dump` and nested container output.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Variant::Void => write!(f, "null"),
            Variant::Ord(v) => write!(f, "{}", v),
            Variant::Real(v) => write!(f, "{}", v),
            Variant::Str(s) => write!(f, "'{}'", s),
            Variant::Vec(v) => {
                write!(f, "[")?;
                for (i, item) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Variant::Set(s) => {
                write!(f, "[")?;
                for (i, item) in s.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Variant::OrdSet(s) => {
                write!(f, "[")?;
                for (i, item) in s.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Variant::Dict(d) => {
                write!(f, "[")?;
                for (i, (k, v)) in d.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "]")
            }
            Variant::Range(r) => match r.bounds() {
                Some((l, rr)) => write!(f, "{}..{}", l, rr),
                None => write!(f, ".."),
            },
            Variant::Ref(r) => write!(f, "@{}", &*r.0.borrow()),
            Variant::RtObj(o) => write!(f, "[{}]", o.obj_name()),
        }
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Ord(v)
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Variant::Ord(v as i64)
    }
}

impl From<&str> for Variant {
    fn from(s: &str) -> Self {
        Variant::Str(Str::from(s))
    }
}

impl From<Str> for Variant {
    fn from(s: Str) -> Self {
        Variant::Str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_checked_accessors() {
        let v = Variant::Ord(5);
        assert_eq!(v.as_ord().unwrap(), 5);
        let err = v.as_str().unwrap_err();
        assert!(matches!(err, RuntimeError::KindMismatch { .. }));
    }

    #[test]
    fn test_cross_kind_ordering_by_tag() {
        let ord = Variant::Ord(1_000_000);
        let s = Variant::from("a");
        assert!(ord < s);
        assert_ne!(ord, s);
    }

    #[test]
    fn test_container_structural_equality() {
        let mut a = VarVec::new();
        a.push(Variant::Ord(1));
        let mut b = VarVec::new();
        b.push(Variant::Ord(1));
        assert_eq!(Variant::Vec(a), Variant::Vec(b));
    }

    #[test]
    fn test_null_container_equals_empty() {
        let null = Variant::Vec(VarVec::new());
        let mut emptied = VarVec::new();
        emptied.push(Variant::Ord(1));
        emptied.erase(0).unwrap();
        assert_eq!(null, Variant::Vec(emptied));
    }

    #[test]
    fn test_empty_predicate_matches_size() {
        for v in [
            Variant::Str(Str::new()),
            Variant::Vec(VarVec::new()),
            Variant::Set(VarSet::new()),
            Variant::OrdSet(OrdSet::new()),
            Variant::Dict(VarDict::new()),
        ] {
            assert!(v.is_empty());
        }
        assert!(!Variant::from("x").is_empty());
    }

    #[test]
    fn test_reference_cell() {
        let r = VarRef::new(Variant::Ord(1));
        let alias = r.clone();
        alias.set(Variant::Ord(2));
        assert_eq!(r.get(), Variant::Ord(2));
        assert_eq!(Variant::Ref(r), Variant::Ref(alias));
    }

    #[test]
    fn test_kind_tag_roundtrip() {
        for b in 0..=10u8 {
            let kind = VariantKind::from_u8(b).unwrap();
            assert_eq!(kind as u8, b);
        }
        assert!(VariantKind::from_u8(11).is_err());
    }

    #[test]
    fn test_render_vec() {
        let mut v = VarVec::new();
        v.push(Variant::Ord(1));
        v.push(Variant::Ord(20));
        assert_eq!(Variant::Vec(v).to_string(), "[1, 20]");
    }
}
