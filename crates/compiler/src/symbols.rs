//! Symbols, symbol tables and scopes.
//!
//! Definitions are compile-time constants (including type and state
//! aliases); variables are storage slots classified by where they live.
//! Symbol tables are sorted maps; lookup walks block scopes innermost-first,
//! then the lexical state chain, with module imports consulted last.

use crate::error::{CompileError, CompileResult};
use crate::typesys::{State, TypeRef};
use shannon_runtime::Variant;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

/// Where a variable's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// One cell in the owning state's instance
    SelfVar,
    /// Call-frame slot at a non-negative offset from the base pointer
    Local,
    /// Call-frame slot at a negative offset from the base pointer
    Arg,
    /// The pre-allocated return slot below the arguments
    Result,
}

#[derive(Debug)]
pub struct Variable {
    pub name: String,
    pub kind: VarKind,
    pub ty: TypeRef,
    /// Zero-based within its kind: cell index for self-vars, frame index
    /// for locals, position for args
    pub id: usize,
    pub host: Weak<State>,
}

impl Variable {
    /// Signed frame offset for stack-resident variables. `argc` is the arg
    /// count of the host state.
    pub fn stk_offs(&self, argc: usize) -> i64 {
        match self.kind {
            VarKind::Local => self.id as i64,
            VarKind::Arg => self.id as i64 - argc as i64,
            VarKind::Result => -(argc as i64) - 1,
            VarKind::SelfVar => unreachable!("self-vars are not frame-relative"),
        }
    }

    pub fn is_self_var(&self) -> bool {
        self.kind == VarKind::SelfVar
    }
}

/// A named compile-time value. Type aliases and state (function, module)
/// aliases carry the aliased descriptor in `alias`.
#[derive(Debug)]
pub struct Definition {
    pub name: String,
    pub ty: TypeRef,
    pub value: Variant,
    pub alias: Option<TypeRef>,
}

impl Definition {
    pub fn constant(name: impl Into<String>, ty: TypeRef, value: Variant) -> Rc<Definition> {
        Rc::new(Definition { name: name.into(), ty, value, alias: None })
    }

    pub fn type_alias(name: impl Into<String>, typeref: TypeRef, aliased: TypeRef) -> Rc<Definition> {
        Rc::new(Definition {
            name: name.into(),
            ty: typeref,
            value: Variant::RtObj(aliased.clone()),
            alias: Some(aliased),
        })
    }

    pub fn aliased_type(&self) -> Option<&TypeRef> {
        self.alias.as_ref()
    }
}

#[derive(Debug, Clone)]
pub enum Symbol {
    Def(Rc<Definition>),
    Var(Rc<Variable>),
}

impl Symbol {
    pub fn name(&self) -> &str {
        match self {
            Symbol::Def(d) => &d.name,
            Symbol::Var(v) => &v.name,
        }
    }

    pub fn ty(&self) -> &TypeRef {
        match self {
            Symbol::Def(d) => &d.ty,
            Symbol::Var(v) => &v.ty,
        }
    }
}

/// Sorted name-to-symbol map.
#[derive(Debug, Default)]
pub struct SymTable {
    map: BTreeMap<String, Symbol>,
}

impl SymTable {
    pub fn add_unique(&mut self, sym: Symbol) -> CompileResult<()> {
        let name = sym.name().to_string();
        if self.map.contains_key(&name) {
            return Err(CompileError::Duplicate(name));
        }
        self.map.insert(name, sym);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<Symbol> {
        self.map.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Maximum frame index for locals; `LoadStkVar` carries a signed byte.
pub const MAX_LOCALS: usize = 127;

/// A lexical block inside a function or module body. Locals declared here
/// receive consecutive frame ids starting at `start_id` and are popped when
/// the block closes.
#[derive(Debug, Default)]
pub struct BlockScope {
    table: SymTable,
    locals: Vec<Rc<Variable>>,
    start_id: usize,
}

impl BlockScope {
    pub fn new(start_id: usize) -> Self {
        BlockScope { table: SymTable::default(), locals: Vec::new(), start_id }
    }

    pub fn add_local(
        &mut self,
        name: &str,
        ty: TypeRef,
        host: &Rc<State>,
    ) -> CompileResult<Rc<Variable>> {
        let id = self.start_id + self.locals.len();
        if id > MAX_LOCALS {
            return Err(CompileError::Type("Too many local variables".into()));
        }
        let var = Rc::new(Variable {
            name: name.to_string(),
            kind: VarKind::Local,
            ty,
            id,
            host: Rc::downgrade(host),
        });
        self.table.add_unique(Symbol::Var(var.clone()))?;
        self.locals.push(var.clone());
        Ok(var)
    }

    pub fn find(&self, name: &str) -> Option<Symbol> {
        self.table.find(name)
    }

    pub fn locals(&self) -> &[Rc<Variable>] {
        &self.locals
    }

    pub fn next_id(&self) -> usize {
        self.start_id + self.locals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typesys::QueenBee;

    #[test]
    fn test_duplicate_detection() {
        let qb = QueenBee::new();
        let mut table = SymTable::default();
        table
            .add_unique(Symbol::Def(Definition::constant("x", qb.int(), Variant::Ord(1))))
            .unwrap();
        let err = table
            .add_unique(Symbol::Def(Definition::constant("x", qb.int(), Variant::Ord(2))))
            .unwrap_err();
        assert_eq!(err, CompileError::Duplicate("x".into()));
    }

    #[test]
    fn test_block_scope_ids() {
        let qb = QueenBee::new();
        let host = qb.module();
        let mut outer = BlockScope::new(0);
        let a = outer.add_local("a", qb.int(), &host).unwrap();
        let mut inner = BlockScope::new(outer.next_id());
        let b = inner.add_local("b", qb.int(), &host).unwrap();
        assert_eq!(a.id, 0);
        assert_eq!(b.id, 1);
        assert_eq!(a.stk_offs(0), 0);
    }

    #[test]
    fn test_arg_offsets() {
        let qb = QueenBee::new();
        let host = qb.module();
        let arg0 = Variable {
            name: "a".into(),
            kind: VarKind::Arg,
            ty: qb.int(),
            id: 0,
            host: Rc::downgrade(&host),
        };
        let ret = Variable {
            name: "result".into(),
            kind: VarKind::Result,
            ty: qb.int(),
            id: 0,
            host: Rc::downgrade(&host),
        };
        assert_eq!(arg0.stk_offs(2), -2);
        assert_eq!(ret.stk_offs(2), -3);
    }
}
