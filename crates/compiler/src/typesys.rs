//! The reified type system.
//!
//! Every type descriptor is itself a runtime object (its own type being the
//! singleton `typeref`), so types can travel as constants and be inspected
//! by the VM for casts and `is` tests. Descriptors are immutable once
//! created; derived types are uniqued through a per-descriptor cache and
//! owned by the state they were registered on.
//!
//! All descriptors live behind `Rc` and identity is address identity; the
//! operations that must produce or capture an owning handle (derivation,
//! symbol registration) live on the [`TypeRefExt`] and [`StateExt`]
//! extension traits.

use crate::codeseg::CodeSeg;
use crate::error::{CompileError, CompileResult};
use crate::symbols::{Definition, Symbol, SymTable, VarKind, Variable};
use shannon_runtime::{RtObject, StateObj, Variant, VariantKind};
use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

pub type TypeRef = Rc<Type>;

/// Shared value-name list of an enumeration. Subranges of an enum share the
/// same list; assignability between enum types is list identity.
pub type EnumValues = Rc<Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeId {
    TypeRef,
    Void,
    Variant,
    Ref,
    Bool,
    Char,
    Int,
    Enum,
    NullCont,
    Str,
    Vec,
    Set,
    OrdSet,
    Dict,
    ByteDict,
    Range,
    Fifo,
    State,
    Module,
}

#[derive(Debug)]
pub enum TypeKind {
    /// typeref, void, variant, nullcont
    Simple,
    /// bool, char, int, enum; inclusive bounds, plus the shared value-name
    /// list for enumerations
    Ord {
        left: i64,
        right: i64,
        values: Option<EnumValues>,
    },
    Ref { to: TypeRef },
    Cont { index: TypeRef, elem: TypeRef },
    Range { base: TypeRef },
    Fifo { elem: TypeRef },
    State(Rc<State>),
}

/// Uniquing cache for single-slot derivations.
#[derive(Debug, Default)]
struct Derived {
    vec: Option<TypeRef>,
    set: Option<TypeRef>,
    fifo: Option<TypeRef>,
    range: Option<TypeRef>,
}

#[derive(Debug)]
pub struct Type {
    pub type_id: TypeId,
    pub kind: TypeKind,
    alias: RefCell<String>,
    derived: RefCell<Derived>,
}

impl RtObject for Type {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }

    fn obj_name(&self) -> &str {
        "type"
    }
}

/// Container kind from its dimensions; either may be `void` meaning
/// "unused dimension".
fn cont_type_id(index: &TypeRef, elem: &TypeRef) -> TypeId {
    if index.is_void() && elem.is_void() {
        TypeId::NullCont
    } else if index.is_void() {
        if elem.is_char() { TypeId::Str } else { TypeId::Vec }
    } else if elem.is_void() {
        if index.is_small_ord() { TypeId::OrdSet } else { TypeId::Set }
    } else if index.is_small_ord() {
        TypeId::ByteDict
    } else {
        TypeId::Dict
    }
}

impl Type {
    fn new(type_id: TypeId, kind: TypeKind) -> Type {
        Type {
            type_id,
            kind,
            alias: RefCell::new(String::new()),
            derived: RefCell::new(Derived::default()),
        }
    }

    pub fn new_cont(index: TypeRef, elem: TypeRef) -> Type {
        let id = cont_type_id(&index, &elem);
        Type::new(id, TypeKind::Cont { index, elem })
    }

    pub fn new_ord(type_id: TypeId, left: i64, right: i64, values: Option<EnumValues>) -> Type {
        Type::new(type_id, TypeKind::Ord { left, right, values })
    }

    pub fn new_ref(to: TypeRef) -> Type {
        Type::new(TypeId::Ref, TypeKind::Ref { to })
    }

    pub fn new_state(state: Rc<State>) -> Type {
        let id = if state.is_module { TypeId::Module } else { TypeId::State };
        Type::new(id, TypeKind::State(state))
    }

    pub fn set_alias(&self, name: &str) {
        let mut alias = self.alias.borrow_mut();
        if alias.is_empty() {
            *alias = name.to_string();
        }
    }

    // --- predicates

    pub fn is_type_ref(&self) -> bool {
        self.type_id == TypeId::TypeRef
    }

    pub fn is_void(&self) -> bool {
        self.type_id == TypeId::Void
    }

    pub fn is_variant(&self) -> bool {
        self.type_id == TypeId::Variant
    }

    pub fn is_reference(&self) -> bool {
        self.type_id == TypeId::Ref
    }

    pub fn is_bool(&self) -> bool {
        self.type_id == TypeId::Bool
    }

    pub fn is_char(&self) -> bool {
        self.type_id == TypeId::Char
    }

    pub fn is_int(&self) -> bool {
        self.type_id == TypeId::Int
    }

    pub fn is_enum(&self) -> bool {
        self.type_id == TypeId::Enum || self.is_bool()
    }

    pub fn is_any_ord(&self) -> bool {
        (TypeId::Bool..=TypeId::Enum).contains(&self.type_id)
    }

    pub fn is_small_ord(&self) -> bool {
        matches!(self.kind, TypeKind::Ord { left, right, .. } if left >= 0 && right <= 255)
    }

    pub fn is_bit_ord(&self) -> bool {
        matches!(self.kind, TypeKind::Ord { left, right, .. } if left == 0 && right == 1)
    }

    pub fn is_null_cont(&self) -> bool {
        self.type_id == TypeId::NullCont
    }

    pub fn is_byte_vec(&self) -> bool {
        self.type_id == TypeId::Str
    }

    pub fn is_any_vec(&self) -> bool {
        self.type_id == TypeId::Str || self.type_id == TypeId::Vec
    }

    pub fn is_byte_set(&self) -> bool {
        self.type_id == TypeId::OrdSet
    }

    pub fn is_any_set(&self) -> bool {
        self.type_id == TypeId::Set || self.type_id == TypeId::OrdSet
    }

    pub fn is_byte_dict(&self) -> bool {
        self.type_id == TypeId::ByteDict
    }

    pub fn is_any_dict(&self) -> bool {
        self.type_id == TypeId::Dict || self.type_id == TypeId::ByteDict
    }

    pub fn is_any_cont(&self) -> bool {
        (TypeId::NullCont..=TypeId::ByteDict).contains(&self.type_id)
    }

    pub fn is_range(&self) -> bool {
        self.type_id == TypeId::Range
    }

    pub fn is_fifo(&self) -> bool {
        self.type_id == TypeId::Fifo
    }

    pub fn is_any_state(&self) -> bool {
        self.type_id == TypeId::State || self.type_id == TypeId::Module
    }

    pub fn is_module(&self) -> bool {
        self.type_id == TypeId::Module
    }

    /// All values except void and references can be dereferenced into.
    pub fn is_derefable(&self) -> bool {
        !self.is_void() && !self.is_reference()
    }

    /// Plain-old-data kinds: no heap payload to finalize.
    pub fn is_pod(&self) -> bool {
        self.is_any_ord() || self.is_byte_vec() || self.is_type_ref()
    }

    pub fn ord_bounds(&self) -> Option<(i64, i64)> {
        match self.kind {
            TypeKind::Ord { left, right, .. } => Some((left, right)),
            _ => None,
        }
    }

    pub fn enum_values(&self) -> Option<&EnumValues> {
        match &self.kind {
            TypeKind::Ord { values, .. } => values.as_ref(),
            _ => None,
        }
    }

    pub fn cont_index(&self) -> Option<&TypeRef> {
        match &self.kind {
            TypeKind::Cont { index, .. } => Some(index),
            _ => None,
        }
    }

    pub fn cont_elem(&self) -> Option<&TypeRef> {
        match &self.kind {
            TypeKind::Cont { elem, .. } => Some(elem),
            _ => None,
        }
    }

    pub fn ref_target(&self) -> Option<&TypeRef> {
        match &self.kind {
            TypeKind::Ref { to } => Some(to),
            _ => None,
        }
    }

    pub fn range_base(&self) -> Option<&TypeRef> {
        match &self.kind {
            TypeKind::Range { base } => Some(base),
            _ => None,
        }
    }

    pub fn as_state(&self) -> Option<&Rc<State>> {
        match &self.kind {
            TypeKind::State(s) => Some(s),
            _ => None,
        }
    }

    /// The variant kind this type's values have at runtime.
    pub fn runtime_kind(&self) -> VariantKind {
        match self.type_id {
            TypeId::TypeRef | TypeId::Fifo | TypeId::State | TypeId::Module => VariantKind::RtObj,
            TypeId::Void | TypeId::NullCont | TypeId::Variant => VariantKind::Void,
            TypeId::Ref => VariantKind::Ref,
            TypeId::Bool | TypeId::Char | TypeId::Int | TypeId::Enum => VariantKind::Ord,
            TypeId::Str => VariantKind::Str,
            TypeId::Vec | TypeId::ByteDict => VariantKind::Vec,
            TypeId::Set => VariantKind::Set,
            TypeId::OrdSet => VariantKind::OrdSet,
            TypeId::Dict => VariantKind::Dict,
            TypeId::Range => VariantKind::Range,
        }
    }

    fn same_descriptor(&self, t: &TypeRef) -> bool {
        std::ptr::eq(self, Rc::as_ptr(t))
    }

    // --- identity and assignability

    /// Structural equality of descriptors. Enumerations and states are
    /// nominal: identical only to themselves (enum subranges compare the
    /// shared value list plus bounds).
    pub fn identical_to(&self, t: &TypeRef) -> bool {
        if self.same_descriptor(t) {
            return true;
        }
        if self.type_id != t.type_id {
            return false;
        }
        match (&self.kind, &t.kind) {
            (TypeKind::Simple, TypeKind::Simple) => true,
            (
                TypeKind::Ord { left: l1, right: r1, values: v1 },
                TypeKind::Ord { left: l2, right: r2, values: v2 },
            ) => {
                if self.type_id == TypeId::Enum {
                    match (v1, v2) {
                        (Some(a), Some(b)) => Rc::ptr_eq(a, b) && l1 == l2 && r1 == r2,
                        _ => false,
                    }
                } else {
                    l1 == l2 && r1 == r2
                }
            }
            (TypeKind::Ref { to: a }, TypeKind::Ref { to: b }) => a.identical_to(b),
            (TypeKind::Cont { index: i1, elem: e1 }, TypeKind::Cont { index: i2, elem: e2 }) => {
                i1.identical_to(i2) && e1.identical_to(e2)
            }
            (TypeKind::Range { base: a }, TypeKind::Range { base: b }) => a.identical_to(b),
            (TypeKind::Fifo { elem: a }, TypeKind::Fifo { elem: b }) => a.identical_to(b),
            // states compare by pointer, handled above
            _ => false,
        }
    }

    /// Assignment compatibility: reflexive, widens ordinal subranges of the
    /// same kind, relates enum values through the shared value list, and is
    /// covariant in reference targets.
    pub fn can_assign_to(&self, t: &TypeRef) -> bool {
        if self.same_descriptor(t) {
            return true;
        }
        match (&self.kind, &t.kind) {
            (TypeKind::Ord { values: v1, .. }, TypeKind::Ord { values: v2, .. }) => {
                if self.is_enum() || t.is_enum() {
                    match (v1, v2) {
                        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                        _ => false,
                    }
                } else {
                    self.type_id == t.type_id
                }
            }
            (TypeKind::Ref { to: a }, TypeKind::Ref { to: b }) => a.can_assign_to(b),
            (TypeKind::Range { base: a }, TypeKind::Range { base: b }) => a.can_assign_to(b),
            _ => self.identical_to(t),
        }
    }

    // --- runtime support

    /// Runtime type test used by `is` and explicit casts.
    pub fn is_my_type(&self, v: &Variant) -> bool {
        match self.type_id {
            TypeId::Variant => true,
            TypeId::Void | TypeId::NullCont => v.is_void() || v.is_empty(),
            TypeId::TypeRef => matches!(v, Variant::RtObj(o) if o.as_any().is::<Type>()),
            TypeId::Bool => matches!(v, Variant::Ord(_)),
            TypeId::Char | TypeId::Int | TypeId::Enum => match (v, self.ord_bounds()) {
                (Variant::Ord(x), Some((l, r))) => *x >= l && *x <= r,
                _ => false,
            },
            TypeId::Str => matches!(v, Variant::Str(_)),
            TypeId::Vec | TypeId::ByteDict => matches!(v, Variant::Vec(_)),
            TypeId::Set => matches!(v, Variant::Set(_)),
            TypeId::OrdSet => matches!(v, Variant::OrdSet(_)),
            TypeId::Dict => matches!(v, Variant::Dict(_)),
            TypeId::Range => matches!(v, Variant::Range(_)),
            TypeId::Ref => matches!(v, Variant::Ref(_)),
            TypeId::Fifo => false,
            TypeId::State | TypeId::Module => match (v, self.as_state()) {
                (Variant::RtObj(o), Some(s)) => o
                    .as_any()
                    .downcast_ref::<StateObj>()
                    .is_some_and(|obj| obj.tag() == Rc::as_ptr(s) as usize),
                _ => false,
            },
        }
    }

    /// Explicit runtime cast: ordinals are retagged with a range check,
    /// everything else must already be of this type.
    pub fn runtime_cast(&self, v: Variant) -> Result<Variant, shannon_runtime::RuntimeError> {
        use shannon_runtime::RuntimeError;
        if self.is_variant() {
            return Ok(v);
        }
        if self.is_bool() {
            return Ok(Variant::Ord((!v.is_empty()) as i64));
        }
        if self.is_any_ord() {
            let x = v.as_ord()?;
            let (l, r) = self.ord_bounds().unwrap_or((i64::MIN, i64::MAX));
            if x < l || x > r {
                return Err(RuntimeError::Range(x));
            }
            return Ok(Variant::Ord(x));
        }
        if self.is_my_type(&v) {
            Ok(v)
        } else {
            Err(RuntimeError::KindMismatch {
                expected: "value of cast target type",
                found: v.kind().name(),
            })
        }
    }

    /// Render a value through the eyes of this type: enum values by name,
    /// booleans as words, strings raw, containers bracketed with typed
    /// elements.
    pub fn render_value(&self, v: &Variant) -> String {
        match (&self.type_id, v) {
            (TypeId::Bool, Variant::Ord(x)) => {
                if *x == 0 { "false".into() } else { "true".into() }
            }
            (TypeId::Enum, Variant::Ord(x)) => self
                .enum_values()
                .and_then(|vals| vals.get(*x as usize).cloned())
                .unwrap_or_else(|| x.to_string()),
            (TypeId::Char, Variant::Ord(x)) => (*x as u8 as char).to_string(),
            (TypeId::Str, Variant::Str(s)) => s.to_string(),
            (TypeId::Vec, Variant::Vec(items)) => {
                let elem = self.cont_elem();
                let parts: Vec<String> = items
                    .iter()
                    .map(|item| match elem {
                        Some(e) if !e.is_variant() => e.render_value(item),
                        _ => item.to_string(),
                    })
                    .collect();
                format!("[{}]", parts.join(", "))
            }
            (TypeId::Set, Variant::Set(items)) => {
                let index = self.cont_index();
                let parts: Vec<String> = items
                    .iter()
                    .map(|item| match index {
                        Some(i) if !i.is_variant() => i.render_value(item),
                        _ => item.to_string(),
                    })
                    .collect();
                format!("[{}]", parts.join(", "))
            }
            (TypeId::OrdSet, Variant::OrdSet(items)) => {
                let index = self.cont_index();
                let parts: Vec<String> = items
                    .iter()
                    .map(|k| match index {
                        Some(i) if !i.is_variant() => i.render_value(&Variant::Ord(k)),
                        _ => k.to_string(),
                    })
                    .collect();
                format!("[{}]", parts.join(", "))
            }
            (TypeId::Dict, Variant::Dict(d)) => {
                let parts: Vec<String> = d
                    .iter()
                    .map(|(k, val)| {
                        format!(
                            "{}: {}",
                            self.cont_index().map_or_else(|| k.to_string(), |t| t.render_value(k)),
                            self.cont_elem().map_or_else(|| val.to_string(), |t| t.render_value(val)),
                        )
                    })
                    .collect();
                format!("[{}]", parts.join(", "))
            }
            (TypeId::ByteDict, Variant::Vec(items)) => {
                let parts: Vec<String> = items
                    .iter()
                    .enumerate()
                    .filter(|(_, val)| !val.is_void())
                    .map(|(k, val)| {
                        format!(
                            "{}: {}",
                            k,
                            self.cont_elem().map_or_else(|| val.to_string(), |t| t.render_value(val)),
                        )
                    })
                    .collect();
                format!("[{}]", parts.join(", "))
            }
            _ => v.to_string(),
        }
    }

    /// Readable name for diagnostics: the alias when one was declared,
    /// otherwise a structural description.
    pub fn describe(&self) -> String {
        let alias = self.alias.borrow();
        if !alias.is_empty() {
            return alias.clone();
        }
        match &self.kind {
            TypeKind::Simple => format!("{:?}", self.type_id).to_lowercase(),
            TypeKind::Ord { left, right, .. } => match self.type_id {
                TypeId::Int => "int".into(),
                TypeId::Bool => "bool".into(),
                TypeId::Char => "char".into(),
                _ => format!("enum({}..{})", left, right),
            },
            TypeKind::Ref { to } => format!("ref {}", to.describe()),
            TypeKind::Cont { index, elem } => match self.type_id {
                TypeId::Str => "str".into(),
                TypeId::Vec => format!("{}[]", elem.describe()),
                TypeId::Set | TypeId::OrdSet => format!("set of {}", index.describe()),
                TypeId::NullCont => "null container".into(),
                _ => format!("{}[{}]", elem.describe(), index.describe()),
            },
            TypeKind::Range { base } => format!("range of {}", base.describe()),
            TypeKind::Fifo { elem } => format!("fifo of {}", elem.describe()),
            TypeKind::State(s) => s.name(),
        }
    }
}

/// Derivation operators; they capture the receiver's owning handle into
/// the derived descriptor, so they live on the `Rc` handle itself.
pub trait TypeRefExt {
    fn derive_vec(&self, qb: &QueenBee, owner: &Rc<State>) -> TypeRef;
    fn derive_set(&self, qb: &QueenBee, owner: &Rc<State>) -> TypeRef;
    fn derive_container(&self, index: &TypeRef, owner: &Rc<State>) -> TypeRef;
    fn derive_fifo(&self, owner: &Rc<State>) -> TypeRef;
    fn derive_range(&self, owner: &Rc<State>) -> CompileResult<TypeRef>;
    fn create_subrange(&self, left: i64, right: i64, owner: &Rc<State>)
        -> CompileResult<TypeRef>;
}

impl TypeRefExt for TypeRef {
    /// Vector of `self`; cached and registered on `owner`.
    fn derive_vec(&self, qb: &QueenBee, owner: &Rc<State>) -> TypeRef {
        if let Some(t) = self.derived.borrow().vec.clone() {
            return t;
        }
        let t = owner.register_type(Type::new_cont(qb.void(), self.clone()));
        self.derived.borrow_mut().vec = Some(t.clone());
        t
    }

    /// Set keyed by `self`.
    fn derive_set(&self, qb: &QueenBee, owner: &Rc<State>) -> TypeRef {
        if let Some(t) = self.derived.borrow().set.clone() {
            return t;
        }
        let t = owner.register_type(Type::new_cont(self.clone(), qb.void()));
        self.derived.borrow_mut().set = Some(t.clone());
        t
    }

    /// Container with `self` as the element and an explicit index type.
    fn derive_container(&self, index: &TypeRef, owner: &Rc<State>) -> TypeRef {
        owner.register_unique(Type::new_cont(index.clone(), self.clone()))
    }

    fn derive_fifo(&self, owner: &Rc<State>) -> TypeRef {
        if let Some(t) = self.derived.borrow().fifo.clone() {
            return t;
        }
        let t = owner.register_type(Type::new(TypeId::Fifo, TypeKind::Fifo { elem: self.clone() }));
        self.derived.borrow_mut().fifo = Some(t.clone());
        t
    }

    /// Range over an ordinal base type.
    fn derive_range(&self, owner: &Rc<State>) -> CompileResult<TypeRef> {
        if !self.is_any_ord() {
            return Err(CompileError::Type("Non-ordinal range base".into()));
        }
        if let Some(t) = self.derived.borrow().range.clone() {
            return Ok(t);
        }
        let t =
            owner.register_type(Type::new(TypeId::Range, TypeKind::Range { base: self.clone() }));
        self.derived.borrow_mut().range = Some(t.clone());
        Ok(t)
    }

    /// Subrange of an ordinal type; shares the value list for enums.
    fn create_subrange(
        &self,
        left: i64,
        right: i64,
        owner: &Rc<State>,
    ) -> CompileResult<TypeRef> {
        let (l0, r0) = self
            .ord_bounds()
            .ok_or_else(|| CompileError::Subrange("Subrange of a non-ordinal type".into()))?;
        if left == l0 && right == r0 {
            return Ok(self.clone());
        }
        if left > right {
            return Err(CompileError::Subrange("Invalid subrange bounds".into()));
        }
        if self.type_id == TypeId::Enum && (left < l0 || right > r0) {
            return Err(CompileError::Subrange("Subrange error".into()));
        }
        let values = self.enum_values().cloned();
        Ok(owner.register_type(Type::new_ord(self.type_id, left, right, values)))
    }
}

// --- States ---------------------------------------------------------------

/// A state: the unit of code and storage. Functions, constructors and
/// modules are all states; a state owns its registered types, definitions,
/// self-variables and (once compiled) its code segment.
#[derive(Debug)]
pub struct State {
    name: RefCell<String>,
    pub parent: Option<Weak<State>>,
    pub is_module: bool,
    pub is_ctor: bool,
    symbols: RefCell<SymTable>,
    types: RefCell<Vec<TypeRef>>,
    defs: RefCell<Vec<Rc<Definition>>>,
    self_vars: RefCell<Vec<Rc<Variable>>>,
    args: RefCell<Vec<Rc<Variable>>>,
    result_type: RefCell<Option<TypeRef>>,
    code: RefCell<Option<Rc<CodeSeg>>>,
    /// Module import slots, a subset of `self_vars`
    uses: RefCell<Vec<Rc<Variable>>>,
    wrapper: RefCell<Weak<Type>>,
}

pub const MAX_SELF_VARS: usize = 255;

impl State {
    pub fn new(
        name: &str,
        parent: Option<&Rc<State>>,
        is_module: bool,
        is_ctor: bool,
    ) -> Rc<State> {
        Rc::new(State {
            name: RefCell::new(name.to_string()),
            parent: parent.map(Rc::downgrade),
            is_module,
            is_ctor,
            symbols: RefCell::new(SymTable::default()),
            types: RefCell::new(Vec::new()),
            defs: RefCell::new(Vec::new()),
            self_vars: RefCell::new(Vec::new()),
            args: RefCell::new(Vec::new()),
            result_type: RefCell::new(None),
            code: RefCell::new(None),
            uses: RefCell::new(Vec::new()),
            wrapper: RefCell::new(Weak::new()),
        })
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn parent_state(&self) -> Option<Rc<State>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn register_type(&self, t: Type) -> TypeRef {
        let t = Rc::new(t);
        self.types.borrow_mut().push(t.clone());
        t
    }

    /// Register, reusing an existing structurally identical descriptor.
    pub fn register_unique(&self, t: Type) -> TypeRef {
        let t = Rc::new(t);
        for known in self.types.borrow().iter() {
            if known.identical_to(&t) {
                return known.clone();
            }
        }
        self.types.borrow_mut().push(t.clone());
        t
    }

    pub fn find_shallow(&self, name: &str) -> Option<Symbol> {
        self.symbols.borrow().find(name)
    }

    /// Walk outward along the lexical chain; a module additionally consults
    /// its imported modules, most recent import first.
    pub fn deep_find(&self, name: &str) -> Option<Symbol> {
        if let Some(s) = self.find_shallow(name) {
            return Some(s);
        }
        if let Some(p) = self.parent_state() {
            return p.deep_find(name);
        }
        if self.is_module {
            for slot in self.uses.borrow().iter().rev() {
                if let Some(imported) = slot.ty.as_state() {
                    if let Some(s) = imported.find_shallow(name) {
                        return Some(s);
                    }
                }
            }
        }
        None
    }

    pub fn result_type(&self) -> Option<TypeRef> {
        self.result_type.borrow().clone()
    }

    /// Definitions owned by this scope, in declaration order.
    pub fn defs(&self) -> Vec<Rc<Definition>> {
        self.defs.borrow().clone()
    }

    pub fn self_var_count(&self) -> usize {
        self.self_vars.borrow().len()
    }

    pub fn arg_count(&self) -> usize {
        self.args.borrow().len()
    }

    pub fn args(&self) -> Vec<Rc<Variable>> {
        self.args.borrow().clone()
    }

    /// Frame offset of the return slot.
    pub fn ret_offs(&self) -> i64 {
        -(self.arg_count() as i64) - 1
    }

    pub fn set_code(&self, seg: Rc<CodeSeg>) {
        *self.code.borrow_mut() = Some(seg);
    }

    pub fn code(&self) -> Option<Rc<CodeSeg>> {
        self.code.borrow().clone()
    }

    pub fn uses(&self) -> Vec<Rc<Variable>> {
        self.uses.borrow().clone()
    }

    /// Find this module's import slot for the given host module.
    pub fn uses_slot_for(&self, host: &Rc<State>) -> Option<Rc<Variable>> {
        self.uses
            .borrow()
            .iter()
            .find(|slot| slot.ty.as_state().is_some_and(|s| Rc::ptr_eq(s, host)))
            .cloned()
    }

    /// Allocate an instance, tagged with this descriptor's identity.
    pub fn new_instance(&self) -> Rc<StateObj> {
        StateObj::tagged(self.self_var_count(), self as *const State as usize)
    }
}

/// State operations that register symbols or wrap the state in a type
/// descriptor; they need the owning `Rc` handle.
pub trait StateExt {
    fn type_of(&self) -> TypeRef;
    fn module(&self) -> Rc<State>;
    fn add_definition(&self, name: &str, ty: TypeRef, value: Variant)
        -> CompileResult<Rc<Definition>>;
    fn add_type_alias(&self, name: &str, typeref: TypeRef, aliased: TypeRef)
        -> CompileResult<Rc<Definition>>;
    fn add_self_var(&self, name: &str, ty: TypeRef) -> CompileResult<Rc<Variable>>;
    fn add_arg(&self, name: &str, ty: TypeRef) -> CompileResult<Rc<Variable>>;
    fn set_result_type(&self, ty: TypeRef) -> CompileResult<()>;
    fn add_uses(&self, imported: &Rc<State>) -> CompileResult<Rc<Variable>>;
}

impl StateExt for Rc<State> {
    /// The wrapper `Type` for this state, created on first request and
    /// registered on the state itself.
    fn type_of(&self) -> TypeRef {
        if let Some(t) = self.wrapper.borrow().upgrade() {
            return t;
        }
        let t = Rc::new(Type::new_state(self.clone()));
        t.set_alias(&self.name());
        *self.wrapper.borrow_mut() = Rc::downgrade(&t);
        self.types.borrow_mut().push(t.clone());
        t
    }

    /// The enclosing module (self for modules).
    fn module(&self) -> Rc<State> {
        let mut cur = self.clone();
        while let Some(p) = cur.parent_state() {
            cur = p;
        }
        cur
    }

    fn add_definition(
        &self,
        name: &str,
        ty: TypeRef,
        value: Variant,
    ) -> CompileResult<Rc<Definition>> {
        let def = Definition::constant(name, ty, value);
        self.symbols.borrow_mut().add_unique(Symbol::Def(def.clone()))?;
        self.defs.borrow_mut().push(def.clone());
        Ok(def)
    }

    fn add_type_alias(
        &self,
        name: &str,
        typeref: TypeRef,
        aliased: TypeRef,
    ) -> CompileResult<Rc<Definition>> {
        let def = Definition::type_alias(name, typeref, aliased.clone());
        self.symbols.borrow_mut().add_unique(Symbol::Def(def.clone()))?;
        self.defs.borrow_mut().push(def.clone());
        aliased.set_alias(name);
        Ok(def)
    }

    fn add_self_var(&self, name: &str, ty: TypeRef) -> CompileResult<Rc<Variable>> {
        let id = self.self_vars.borrow().len();
        if id >= MAX_SELF_VARS {
            return Err(CompileError::Type("Too many variables in this state".into()));
        }
        let var = Rc::new(Variable {
            name: name.to_string(),
            kind: VarKind::SelfVar,
            ty,
            id,
            host: Rc::downgrade(self),
        });
        self.symbols.borrow_mut().add_unique(Symbol::Var(var.clone()))?;
        self.self_vars.borrow_mut().push(var.clone());
        Ok(var)
    }

    fn add_arg(&self, name: &str, ty: TypeRef) -> CompileResult<Rc<Variable>> {
        let id = self.args.borrow().len();
        let var = Rc::new(Variable {
            name: name.to_string(),
            kind: VarKind::Arg,
            ty,
            id,
            host: Rc::downgrade(self),
        });
        self.symbols.borrow_mut().add_unique(Symbol::Var(var.clone()))?;
        self.args.borrow_mut().push(var.clone());
        Ok(var)
    }

    /// Declare the return type; also introduces the `result` variable.
    fn set_result_type(&self, ty: TypeRef) -> CompileResult<()> {
        let var = Rc::new(Variable {
            name: "result".to_string(),
            kind: VarKind::Result,
            ty: ty.clone(),
            id: 0,
            host: Rc::downgrade(self),
        });
        self.symbols.borrow_mut().add_unique(Symbol::Var(var))?;
        *self.result_type.borrow_mut() = Some(ty);
        Ok(())
    }

    /// Import a module: allocate a self-var slot holding the imported
    /// instance, named after the module.
    fn add_uses(&self, imported: &Rc<State>) -> CompileResult<Rc<Variable>> {
        debug_assert!(self.is_module);
        let slot = self.add_self_var(&imported.name(), imported.type_of())?;
        self.uses.borrow_mut().push(slot.clone());
        Ok(slot)
    }
}

// --- The built-in module --------------------------------------------------

/// The `system` module: singleton descriptors for the built-in types, the
/// standard aliases and constants, and the conventional `result` variable
/// the driver reads the program result from.
#[derive(Debug)]
struct QbData {
    type_ref: TypeRef,
    void: TypeRef,
    variant: TypeRef,
    null_cont: TypeRef,
    int: TypeRef,
    char_: TypeRef,
    bool_: TypeRef,
    str_: TypeRef,
    char_fifo: TypeRef,
    module: Rc<State>,
    result_var: Rc<Variable>,
}

#[derive(Debug, Clone)]
pub struct QueenBee(Rc<QbData>);

impl QueenBee {
    pub fn new() -> QueenBee {
        let module = State::new("system", None, true, false);

        let type_ref = module.register_type(Type::new(TypeId::TypeRef, TypeKind::Simple));
        let void = module.register_type(Type::new(TypeId::Void, TypeKind::Simple));
        let variant = module.register_type(Type::new(TypeId::Variant, TypeKind::Simple));
        let int = module.register_type(Type::new_ord(TypeId::Int, i64::MIN, i64::MAX, None));
        let bool_values: EnumValues = Rc::new(vec!["false".to_string(), "true".to_string()]);
        let bool_ = module.register_type(Type::new_ord(TypeId::Bool, 0, 1, Some(bool_values)));
        let char_ = module.register_type(Type::new_ord(TypeId::Char, 0, 255, None));
        let null_cont = module.register_type(Type::new_cont(void.clone(), void.clone()));

        // str and the char fifo derive from char once void exists
        let qb_for_derive = QueenBee(Rc::new(QbData {
            type_ref: type_ref.clone(),
            void: void.clone(),
            variant: variant.clone(),
            null_cont: null_cont.clone(),
            int: int.clone(),
            char_: char_.clone(),
            bool_: bool_.clone(),
            str_: void.clone(),
            char_fifo: void.clone(),
            module: module.clone(),
            result_var: Rc::new(Variable {
                name: String::new(),
                kind: VarKind::SelfVar,
                ty: void.clone(),
                id: 0,
                host: Rc::downgrade(&module),
            }),
        }));
        let str_ = char_.derive_vec(&qb_for_derive, &module);
        let char_fifo = char_.derive_fifo(&module);

        let result_var = {
            let setup = || -> CompileResult<Rc<Variable>> {
                module.add_type_alias("typeref", type_ref.clone(), type_ref.clone())?;
                module.add_type_alias("void", type_ref.clone(), void.clone())?;
                module.add_type_alias("any", type_ref.clone(), variant.clone())?;
                module.add_type_alias("int", type_ref.clone(), int.clone())?;
                module.add_type_alias("bool", type_ref.clone(), bool_.clone())?;
                module.add_type_alias("char", type_ref.clone(), char_.clone())?;
                module.add_type_alias("str", type_ref.clone(), str_.clone())?;
                module.add_definition("null", void.clone(), Variant::Void)?;
                module.add_definition("false", bool_.clone(), Variant::Ord(0))?;
                module.add_definition("true", bool_.clone(), Variant::Ord(1))?;
                module.add_self_var("result", variant.clone())
            };
            setup().expect("system module setup")
        };

        QueenBee(Rc::new(QbData {
            type_ref,
            void,
            variant,
            null_cont,
            int,
            char_,
            bool_,
            str_,
            char_fifo,
            module,
            result_var,
        }))
    }

    pub fn type_ref(&self) -> TypeRef {
        self.0.type_ref.clone()
    }

    pub fn void(&self) -> TypeRef {
        self.0.void.clone()
    }

    pub fn variant(&self) -> TypeRef {
        self.0.variant.clone()
    }

    pub fn null_cont(&self) -> TypeRef {
        self.0.null_cont.clone()
    }

    pub fn int(&self) -> TypeRef {
        self.0.int.clone()
    }

    pub fn char_(&self) -> TypeRef {
        self.0.char_.clone()
    }

    pub fn bool_(&self) -> TypeRef {
        self.0.bool_.clone()
    }

    pub fn str_(&self) -> TypeRef {
        self.0.str_.clone()
    }

    pub fn char_fifo(&self) -> TypeRef {
        self.0.char_fifo.clone()
    }

    pub fn module(&self) -> Rc<State> {
        self.0.module.clone()
    }

    pub fn result_var(&self) -> Rc<Variable> {
        self.0.result_var.clone()
    }
}

impl Default for QueenBee {
    fn default() -> Self {
        QueenBee::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_construction_rules() {
        let qb = QueenBee::new();
        assert_eq!(Type::new_cont(qb.void(), qb.void()).type_id, TypeId::NullCont);
        assert_eq!(Type::new_cont(qb.void(), qb.char_()).type_id, TypeId::Str);
        assert_eq!(Type::new_cont(qb.void(), qb.int()).type_id, TypeId::Vec);
        assert_eq!(Type::new_cont(qb.char_(), qb.void()).type_id, TypeId::OrdSet);
        assert_eq!(Type::new_cont(qb.int(), qb.void()).type_id, TypeId::Set);
        assert_eq!(Type::new_cont(qb.char_(), qb.int()).type_id, TypeId::ByteDict);
        assert_eq!(Type::new_cont(qb.int(), qb.int()).type_id, TypeId::Dict);
    }

    #[test]
    fn test_derive_vec_elem_roundtrip() {
        let qb = QueenBee::new();
        let m = qb.module();
        let v = qb.int().derive_vec(&qb, &m);
        assert!(v.cont_elem().unwrap().identical_to(&qb.int()));
        // cached: second derivation is the same descriptor
        assert!(Rc::ptr_eq(&v, &qb.int().derive_vec(&qb, &m)));
    }

    #[test]
    fn test_derive_container_unique() {
        let qb = QueenBee::new();
        let m = qb.module();
        let d1 = qb.str_().derive_container(&qb.int(), &m);
        let d2 = qb.str_().derive_container(&qb.int(), &m);
        assert!(Rc::ptr_eq(&d1, &d2));
        assert_eq!(d1.type_id, TypeId::Dict);
    }

    #[test]
    fn test_subrange_widening() {
        let qb = QueenBee::new();
        let m = qb.module();
        let small = qb.int().create_subrange(0, 10, &m).unwrap();
        assert!(!small.identical_to(&qb.int()));
        assert!(small.can_assign_to(&qb.int()));
        assert!(qb.int().can_assign_to(&small));
        assert!(small.is_small_ord());
        assert!(qb.int().create_subrange(5, 1, &m).is_err());
    }

    #[test]
    fn test_enum_nominal_identity() {
        let qb = QueenBee::new();
        let m = qb.module();
        let values: EnumValues = Rc::new(vec!["red".into(), "green".into(), "blue".into()]);
        let color = m.register_type(Type::new_ord(TypeId::Enum, 0, 2, Some(values.clone())));
        let other = m.register_type(Type::new_ord(
            TypeId::Enum,
            0,
            2,
            Some(Rc::new(vec!["red".into(), "green".into(), "blue".into()])),
        ));
        assert!(!color.identical_to(&other));
        assert!(!color.can_assign_to(&other));
        let sub = color.create_subrange(0, 1, &m).unwrap();
        assert!(sub.can_assign_to(&color));
        assert_eq!(color.render_value(&Variant::Ord(1)), "green");
    }

    #[test]
    fn test_reference_covariance() {
        let qb = QueenBee::new();
        let m = qb.module();
        let small = qb.int().create_subrange(0, 10, &m).unwrap();
        let ref_small = m.register_type(Type::new_ref(small));
        let ref_int = m.register_type(Type::new_ref(qb.int()));
        assert!(ref_small.can_assign_to(&ref_int));
        assert!(!ref_small.identical_to(&ref_int));
    }

    #[test]
    fn test_is_my_type_bounds() {
        let qb = QueenBee::new();
        let m = qb.module();
        let sub = qb.int().create_subrange(1, 5, &m).unwrap();
        assert!(sub.is_my_type(&Variant::Ord(3)));
        assert!(!sub.is_my_type(&Variant::Ord(6)));
        assert!(!sub.is_my_type(&Variant::from("x")));
    }

    #[test]
    fn test_runtime_cast_retags_ordinals() {
        let qb = QueenBee::new();
        let m = qb.module();
        let sub = qb.int().create_subrange(1, 5, &m).unwrap();
        assert_eq!(sub.runtime_cast(Variant::Ord(3)).unwrap(), Variant::Ord(3));
        assert!(sub.runtime_cast(Variant::Ord(9)).is_err());
        assert_eq!(
            qb.bool_().runtime_cast(Variant::from("x")).unwrap(),
            Variant::Ord(1)
        );
    }

    #[test]
    fn test_state_instance_tagging() {
        let qb = QueenBee::new();
        let st = State::new("thing", Some(&qb.module()), false, false);
        let ty = st.type_of();
        let inst = st.new_instance();
        assert!(ty.is_my_type(&Variant::RtObj(inst)));
        let other = State::new("other", Some(&qb.module()), false, false);
        let other_inst = other.new_instance();
        assert!(!ty.is_my_type(&Variant::RtObj(other_inst)));
    }

    #[test]
    fn test_system_module_symbols() {
        let qb = QueenBee::new();
        let m = qb.module();
        assert!(m.find_shallow("int").is_some());
        assert!(m.find_shallow("true").is_some());
        assert!(m.find_shallow("result").is_some());
        assert_eq!(qb.result_var().name, "result");
        assert!(qb.str_().is_byte_vec());
        assert!(qb.char_fifo().is_fifo());
    }

    #[test]
    fn test_deep_find_through_imports() {
        let qb = QueenBee::new();
        let user = State::new("main", None, true, false);
        user.add_uses(&qb.module()).unwrap();
        let found = user.deep_find("result");
        assert!(matches!(found, Some(Symbol::Var(v)) if v.name == "result"));
        assert!(user.find_shallow("system").is_some());
        assert!(user.uses_slot_for(&qb.module()).is_some());
    }
}
