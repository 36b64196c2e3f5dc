//! Assignments: designator rewriting.
//!
//! A designator compiles as a loader chain. At assignment time the final
//! loader is rewritten into its storer; when the final op addresses a
//! container element, the loader *before* it becomes a LEA (object +
//! location) and the final op becomes a compound storer. The storer's
//! bytes are cut out of the stream and re-appended after the right-hand
//! side, making assignment lexically right-to-left at run time.

use super::CodeGen;
use crate::codeseg::{is_grounded_loader, Op};
use crate::error::{CompileError, CompileResult};
use crate::symbols::{VarKind, Variable};
use std::rc::Rc;

fn loader_to_storer(op: Op) -> CompileResult<Op> {
    Ok(match op {
        Op::LoadSelfVar => Op::StoreSelfVar,
        Op::LoadOuterVar => Op::StoreOuterVar,
        Op::LoadStkVar => Op::StoreStkVar,
        Op::LoadMember => Op::StoreMember,
        Op::Deref => Op::StoreRef,
        // end grounded loaders
        Op::StrElem => Op::StoreStrElem,
        Op::VecElem => Op::StoreVecElem,
        Op::DictElem => Op::StoreDictElem,
        Op::ByteDictElem => Op::StoreByteDictElem,
        _ => return Err(CompileError::NotLValue("Not an l-value".into())),
    })
}

fn loader_to_lea(op: Op) -> CompileResult<Op> {
    Ok(match op {
        Op::LoadSelfVar => Op::LeaSelfVar,
        Op::LoadOuterVar => Op::LeaOuterVar,
        Op::LoadStkVar => Op::LeaStkVar,
        Op::LoadMember => Op::LeaMember,
        Op::Deref => Op::LeaRef,
        _ => return Err(CompileError::NotLValue("Not an l-value".into())),
    })
}

fn loader_to_deleter(op: Op) -> CompileResult<Op> {
    Ok(match op {
        Op::StrElem => Op::DelStrElem,
        Op::VecElem => Op::DelVecElem,
        Op::DictElem => Op::DelDictElem,
        Op::ByteDictElem => Op::DelByteDictElem,
        _ => return Err(CompileError::NotLValue("Not an addressable container element".into())),
    })
}

impl CodeGen {
    fn prev_loader(&self) -> CompileResult<usize> {
        self.prev_loader_offs
            .ok_or_else(|| CompileError::NotLValue("Not an l-value".into()))
    }

    /// Rewrite the designator on top of the stack for plain assignment and
    /// return the storer bytes, to be re-appended once the right-hand side
    /// has been compiled.
    pub fn lvalue(&mut self) -> CompileResult<Vec<u8>> {
        let offs = self.stk_top_item()?.offs;
        let loader = self.codeseg.op_at(offs);
        if !is_grounded_loader(loader) {
            // Compound case: the previous loader supplied the container;
            // turn it into its LEA form first
            let prev = self.prev_loader()?;
            let lea = loader_to_lea(self.codeseg.op_at(prev))?;
            self.codeseg.replace_op(prev, lea);
        }
        let storer = loader_to_storer(loader)?;
        self.codeseg.replace_op(offs, storer);
        self.prev_loader_offs = None;
        Ok(self.codeseg.cut_op(offs))
    }

    /// Rewrite for `+=`-family assignment: the designator becomes a LEA
    /// and the in-place op is returned for re-emission after the RHS.
    pub fn arithm_lvalue(&mut self, op: Op) -> CompileResult<Vec<u8>> {
        debug_assert!((Op::AddAssign..=Op::ModAssign).contains(&op));
        let ty = self.stk_top()?.clone();
        if !ty.is_int() {
            return Err(CompileError::Type(
                "In-place arithmetic expects an integer destination".into(),
            ));
        }
        let offs = self.stk_top_item()?.offs;
        let lea = loader_to_lea(self.codeseg.op_at(offs))?;
        self.codeseg.replace_op(offs, lea);
        let cut_at = self.current_offs();
        self.codeseg.append_op(op);
        Ok(self.codeseg.cut_op(cut_at))
    }

    /// Rewrite for `|=`: the designator becomes a LEA in place; the
    /// concatenation op is chosen later by `cat_assign`.
    pub fn cat_lvalue(&mut self) -> CompileResult<()> {
        let ty = self.stk_top()?.clone();
        if !ty.is_any_vec() {
            return Err(CompileError::Type("'|=' expects a vector or string".into()));
        }
        let offs = self.stk_top_item()?.offs;
        let lea = loader_to_lea(self.codeseg.op_at(offs))?;
        self.codeseg.replace_op(offs, lea);
        Ok(())
    }

    /// In-place concatenation through the LEA prepared by `cat_lvalue`.
    pub fn cat_assign(&mut self) -> CompileResult<()> {
        let left = self.stk_top_at(2)?.clone();
        if !left.is_any_vec() {
            return Err(CompileError::Type("'|=' expects a vector or string".into()));
        }
        let elem = left
            .cont_elem()
            .cloned()
            .ok_or_else(|| CompileError::internal(0x6007, "vector without element type"))?;
        let right = self.stk_top()?.clone();
        let op = if right.can_assign_to(&elem) {
            if left.is_byte_vec() { Op::ChrCatAssign } else { Op::VarCatAssign }
        } else {
            self.implicit_cast(&left, "Type mismatch in in-place concatenation")?;
            if left.is_byte_vec() { Op::StrCatAssign } else { Op::VecCatAssign }
        };
        self.emit(op);
        self.stk_pop()?;
        self.stk_pop()?;
        Ok(())
    }

    /// Complete an assignment: cast the RHS to the destination type and
    /// append the storer bytes cut earlier.
    pub fn assignment(&mut self, storer_code: &[u8]) -> CompileResult<()> {
        debug_assert!(!storer_code.is_empty());
        let dest = self.stk_top_at(2)?.clone();
        if dest.is_void() {
            return Err(CompileError::Type("Destination is void type".into()));
        }
        self.implicit_cast(&dest, "Type mismatch in assignment")?;
        self.codeseg.append_raw(storer_code);
        self.stk_pop()?;
        self.stk_pop()?;
        Ok(())
    }

    /// `del` of a container element: LEA + deleter rewrite.
    pub fn del_container_elem(&mut self) -> CompileResult<()> {
        let offs = self.stk_top_item()?.offs;
        let deleter = loader_to_deleter(self.codeseg.op_at(offs))?;
        let prev = self.prev_loader()?;
        let lea = loader_to_lea(self.codeseg.op_at(prev))?;
        self.codeseg.replace_op(prev, lea);
        self.codeseg.replace_op(offs, deleter);
        self.sim_stack
            .pop()
            .ok_or_else(|| CompileError::internal(0x6001, "simulation stack underflow"))?;
        self.prev_loader_offs = None;
        Ok(())
    }

    // --- variable initialization

    /// A local variable's initializer simply stays on the stack; verify
    /// the frame layout and adopt the slot.
    pub fn init_local_var(&mut self, var: &Rc<Variable>) -> CompileResult<()> {
        debug_assert_eq!(var.kind, VarKind::Local);
        if self.sim_stack.len() != self.locals + 1 || var.id != self.locals {
            return Err(CompileError::internal(0x6008, "invalid local var id"));
        }
        self.locals += 1;
        self.implicit_cast(&var.ty.clone(), "Variable type mismatch")
    }

    /// Close out a local at block end; emits the pop that frees its slot.
    pub fn deinit_local_var(&mut self, var: &Rc<Variable>) -> CompileResult<()> {
        debug_assert_eq!(var.kind, VarKind::Local);
        if self.locals != self.sim_stack.len() || var.id != self.locals - 1 {
            return Err(CompileError::internal(0x6009, "invalid local var id"));
        }
        self.locals -= 1;
        self.pop_value()
    }

    /// Initialize a self-variable from the value on top of the stack.
    pub fn init_self_var(&mut self, var: &Rc<Variable>) -> CompileResult<()> {
        debug_assert_eq!(var.kind, VarKind::SelfVar);
        let hosted_here = match (&self.code_owner, var.host.upgrade()) {
            (Some(owner), Some(host)) => Rc::ptr_eq(owner, &host),
            _ => false,
        };
        if !hosted_here {
            return Err(CompileError::internal(0x600b, "init of a foreign self-var"));
        }
        self.implicit_cast(&var.ty.clone(), "Variable type mismatch")?;
        self.stk_pop()?;
        self.emit(Op::InitSelfVar);
        self.codeseg.append_u8(var.id as u8);
        Ok(())
    }

    /// Store the top value into the return slot; compile-time segments
    /// use this to surface the constant result.
    pub fn store_ret(&mut self, ty: &crate::typesys::TypeRef) -> CompileResult<()> {
        self.implicit_cast(ty, "Type mismatch")?;
        self.stk_pop()?;
        self.emit(Op::InitStkVar);
        self.codeseg.append_i8(-1);
        Ok(())
    }

    /// `return expr` inside a function: store into the result slot.
    pub fn store_result(&mut self, var: &Rc<Variable>, argc: usize) -> CompileResult<()> {
        debug_assert_eq!(var.kind, VarKind::Result);
        self.implicit_cast(&var.ty.clone(), "Return type mismatch")?;
        self.stk_pop()?;
        self.emit(Op::StoreStkVar);
        self.codeseg.append_i8(var.stk_offs(argc) as i8);
        Ok(())
    }
}
