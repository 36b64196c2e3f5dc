//! Loaders: constants, symbols, variables and member selection.

use super::CodeGen;
use crate::codeseg::Op;
use crate::error::{CompileError, CompileResult};
use crate::symbols::{Definition, Symbol, Variable};
use crate::typesys::{StateExt, TypeRef};
use shannon_runtime::Variant;
use std::rc::Rc;

impl CodeGen {
    pub fn load_type_ref(&mut self, ty: &TypeRef) -> CompileResult<()> {
        let idx = self.codeseg.add_type(ty);
        self.emit_push(self.qb.type_ref(), Op::LoadTypeRef);
        self.codeseg.append_u16(idx);
        Ok(())
    }

    /// Load a scalar constant. Compound constants travel through
    /// definitions (`load_definition`), which keep their payload alive.
    pub fn load_const(&mut self, ty: &TypeRef, value: &Variant) -> CompileResult<()> {
        match value {
            Variant::Void => {
                self.emit_push(ty.clone(), Op::LoadNull);
                Ok(())
            }
            Variant::Ord(i) => {
                if !ty.is_any_ord() {
                    return Err(CompileError::internal(0x6004, "ordinal constant of non-ordinal type"));
                }
                match *i {
                    0 => self.emit_push(ty.clone(), Op::Load0),
                    1 => self.emit_push(ty.clone(), Op::Load1),
                    2..=255 => {
                        self.emit_push(ty.clone(), Op::LoadByte);
                        self.codeseg.append_u8(*i as u8);
                    }
                    _ => {
                        self.emit_push(ty.clone(), Op::LoadOrd);
                        self.codeseg.append_i64(*i);
                    }
                }
                Ok(())
            }
            Variant::Str(s) => {
                let idx = self.codeseg.add_string(s.clone());
                self.emit_push(ty.clone(), Op::LoadStr);
                self.codeseg.append_u16(idx);
                Ok(())
            }
            // compound and object constants only travel through definitions
            _ => Err(CompileError::internal(0x6005, "unknown constant literal")),
        }
    }

    /// Load the canonical empty value of a container type.
    pub fn load_empty_const(&mut self, ty: &TypeRef) -> CompileResult<()> {
        let kind = ty.runtime_kind();
        self.emit_push(ty.clone(), Op::LoadEmptyVar);
        self.codeseg.append_u8(kind as u8);
        Ok(())
    }

    pub fn load_definition(&mut self, def: &Rc<Definition>) -> CompileResult<()> {
        if let Some(aliased) = def.aliased_type() {
            if aliased.is_any_state() {
                return Err(CompileError::Type(format!(
                    "'{}' is a function and requires an argument list",
                    def.name
                )));
            }
            let aliased = aliased.clone();
            return self.load_type_ref(&aliased);
        }
        if def.ty.is_void() || def.ty.is_any_ord() || def.ty.is_byte_vec() {
            let ty = def.ty.clone();
            let value = def.value.clone();
            self.load_const(&ty, &value)
        } else {
            let idx = self.codeseg.add_def(def);
            self.emit_push(def.ty.clone(), Op::LoadConst);
            self.codeseg.append_u16(idx);
            Ok(())
        }
    }

    pub fn load_symbol(&mut self, sym: &Symbol) -> CompileResult<()> {
        match sym {
            Symbol::Def(d) => self.load_definition(d),
            Symbol::Var(v) => self.load_variable(v),
        }
    }

    /// Load a variable through whatever route its host demands: frame
    /// slot, own self-var, enclosing state's self-var, or a member of a
    /// module instance reached through the data segment.
    pub fn load_variable(&mut self, var: &Rc<Variable>) -> CompileResult<()> {
        if self.is_compile_time() {
            // Placeholder that raises if the constant expression actually
            // needs the value
            self.emit_push(var.ty.clone(), Op::ConstExprErr);
            return Ok(());
        }
        let owner = self
            .code_owner
            .clone()
            .ok_or_else(|| CompileError::internal(0x6006, "no code owner"))?;
        let host = var
            .host
            .upgrade()
            .ok_or_else(|| CompileError::internal(0x6006, "variable host gone"))?;

        if !var.is_self_var() {
            if !Rc::ptr_eq(&host, &owner) {
                return Err(CompileError::Type(format!(
                    "'{}' is not accessible within this context",
                    var.name
                )));
            }
            let offs = var.stk_offs(owner.arg_count());
            self.emit_push(var.ty.clone(), Op::LoadStkVar);
            self.codeseg.append_i8(offs as i8);
            return Ok(());
        }

        if Rc::ptr_eq(&host, &owner) {
            self.emit_push(var.ty.clone(), Op::LoadSelfVar);
            self.codeseg.append_u8(var.id as u8);
        } else if owner.parent_state().is_some_and(|p| Rc::ptr_eq(&host, &p)) {
            self.emit_push(var.ty.clone(), Op::LoadOuterVar);
            self.codeseg.append_u8(var.id as u8);
        } else if Rc::ptr_eq(&host, &self.module) {
            self.load_data_seg()?;
            self.load_member_var(var)?;
        } else if host.is_module {
            // A variable of an imported module: route through this
            // module's import slot
            let slot = self.module.uses_slot_for(&host).ok_or_else(|| {
                CompileError::Type(format!("Module '{}' is not imported", host.name()))
            })?;
            self.load_variable(&slot)?;
            self.load_member_var(var)?;
        } else {
            return Err(CompileError::Type(format!(
                "'{}' is not accessible within this context",
                var.name
            )));
        }
        Ok(())
    }

    /// Push the module's own instance.
    pub fn load_data_seg(&mut self) -> CompileResult<()> {
        if self.is_compile_time() {
            return Err(CompileError::Type(
                "Static data can not be accessed in constant expressions".into(),
            ));
        }
        let ty = self.module.type_of();
        self.emit_push(ty, Op::LoadDataSeg);
        Ok(())
    }

    /// Member selection by name on the state object on top of the stack.
    pub fn load_member(&mut self, ident: &str) -> CompileResult<()> {
        let state_type = self.stk_top()?.clone();
        let state = state_type
            .as_state()
            .ok_or_else(|| CompileError::Type("Invalid member selection".into()))?
            .clone();
        match state.find_shallow(ident) {
            Some(Symbol::Var(v)) => self.load_member_var(&v),
            Some(Symbol::Def(d)) => {
                // A constant member: the object was loaded for nothing.
                // Undo its loader when it was a single primary; otherwise
                // discard the value at run time.
                let offs = self.stk_top_item()?.offs;
                if crate::codeseg::is_undoable_loader(self.codeseg.op_at(offs)) {
                    self.undo_subexpr(offs)?;
                } else {
                    self.pop_value()?;
                }
                self.load_definition(&d)
            }
            None => Err(CompileError::UnknownIdent(ident.to_string())),
        }
    }

    /// Member selection when the variable is already resolved; consumes
    /// the state object on the stack.
    pub fn load_member_var(&mut self, var: &Rc<Variable>) -> CompileResult<()> {
        let state_type = self.stk_pop()?.ty;
        if self.is_compile_time() {
            self.emit_push(var.ty.clone(), Op::ConstExprErr);
            return Ok(());
        }
        let host = var.host.upgrade();
        let hosted_here = match (state_type.as_state(), &host) {
            (Some(s), Some(h)) => Rc::ptr_eq(s, h),
            _ => false,
        };
        if !state_type.is_any_state() || !hosted_here || !var.is_self_var() {
            return Err(CompileError::Type("Invalid member selection".into()));
        }
        self.emit_push(var.ty.clone(), Op::LoadMember);
        self.codeseg.append_u8(var.id as u8);
        Ok(())
    }

    /// `this` in a constructor body: the instance under construction.
    pub fn load_this(&mut self) -> CompileResult<()> {
        if self.is_compile_time() {
            return Err(CompileError::Type(
                "'this' is not available in constant expressions".into(),
            ));
        }
        let owner = self
            .code_owner
            .clone()
            .ok_or_else(|| CompileError::internal(0x6006, "no code owner"))?;
        if !owner.is_ctor {
            return Err(CompileError::Type(
                "'this' is not available within this context".into(),
            ));
        }
        let ty = owner.type_of();
        self.emit_push(ty, Op::LoadSelfObj);
        Ok(())
    }
}
