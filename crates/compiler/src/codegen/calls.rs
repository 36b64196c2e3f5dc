//! Direct calls.
//!
//! The convention: the caller pushes the result slot (a null, or a fresh
//! instance for constructor calls), then the arguments left to right, then
//! the call opcode. The callee's base pointer lands on the first local;
//! arguments sit at negative offsets and the result slot below them. On
//! return the interpreter pops the arguments, leaving the result.

use super::CodeGen;
use crate::codeseg::Op;
use crate::error::{CompileError, CompileResult};
use crate::typesys::{State, StateExt};
use std::rc::Rc;

/// Where the callee's enclosing `self` comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Callee is a direct child of the current state
    Child,
    /// Callee shares the current state's parent
    Sibling,
    /// Callee is reached through an object on the stack
    Method,
}

impl CodeGen {
    /// Push the result slot before the arguments: a null for functions, a
    /// fresh tagged instance for constructors.
    pub fn load_call_result_slot(&mut self, callee: &Rc<State>) -> CompileResult<()> {
        if callee.is_ctor {
            let ty = callee.type_of();
            let idx = self.codeseg.add_state(callee);
            self.emit_push(ty, Op::NewInstance);
            self.codeseg.append_u16(idx);
        } else {
            let ret = callee.result_type().unwrap_or_else(|| self.qb.void());
            self.emit_push(ret, Op::LoadNull);
        }
        Ok(())
    }

    /// Decide the call form from the lexical relation between caller and
    /// callee.
    pub fn call_kind_for(&self, callee: &Rc<State>) -> CompileResult<CallKind> {
        let owner = self
            .code_owner
            .as_ref()
            .ok_or_else(|| CompileError::Type("Can't call functions in constant expressions".into()))?;
        let callee_parent = callee.parent_state();
        if callee_parent.as_ref().is_some_and(|p| Rc::ptr_eq(p, owner)) {
            return Ok(CallKind::Child);
        }
        let owner_parent = owner.parent_state();
        match (callee_parent, owner_parent) {
            (Some(a), Some(b)) if Rc::ptr_eq(&a, &b) => Ok(CallKind::Sibling),
            _ => Err(CompileError::Type(format!(
                "'{}' can not be called from this context",
                callee.name()
            ))),
        }
    }

    /// Emit a direct call. The simulation stack holds the result slot, the
    /// arguments, and for method calls the receiving object beneath them
    /// all; everything is replaced by the result.
    pub fn call(&mut self, callee: &Rc<State>, kind: CallKind) -> CompileResult<()> {
        let args = callee.args();
        for arg in args.iter().rev() {
            let top = self.stk_top()?.clone();
            if !top.can_assign_to(&arg.ty) {
                return Err(CompileError::Type(format!(
                    "Argument type mismatch for '{}'",
                    arg.name
                )));
            }
            self.stk_pop()?;
        }
        self.stk_pop()?; // result slot
        if kind == CallKind::Method {
            let obj = self.stk_pop()?.ty;
            if !obj.is_any_state() {
                return Err(CompileError::internal(0x600c, "method call without receiver"));
            }
        }
        let op = match kind {
            CallKind::Child => Op::ChildCall,
            CallKind::Sibling => Op::SiblingCall,
            CallKind::Method => Op::MethodCall,
        };
        let ret = if callee.is_ctor {
            callee.type_of()
        } else {
            callee.result_type().unwrap_or_else(|| self.qb.void())
        };
        let idx = self.codeseg.add_state(callee);
        self.emit_push(ret, op);
        self.codeseg.append_u16(idx);
        Ok(())
    }

    /// First opcode of a constructor body: adopt the instance provided in
    /// the result slot as the frame's self context.
    pub fn enter_ctor(&mut self) -> CompileResult<()> {
        let owner = self
            .code_owner
            .clone()
            .ok_or_else(|| CompileError::internal(0x600d, "ctor prolog without owner"))?;
        if !owner.is_ctor {
            return Err(CompileError::internal(0x600d, "ctor prolog in a non-ctor"));
        }
        let idx = self.codeseg.add_state(&owner);
        self.emit(Op::EnterCtor);
        self.codeseg.append_u16(idx);
        Ok(())
    }
}
