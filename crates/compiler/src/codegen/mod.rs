//! The code generator.
//!
//! Single-pass and parser-driven: the front end calls one generator
//! operation per syntactic construct and the generator emits opcodes while
//! maintaining a **simulation stack** mirroring what the interpreter's
//! value stack will contain at the current emission point. Each simulation
//! item remembers the offset of the instruction that pushed it, which is
//! what makes subexpression undo and l-value rewriting possible: no opcode
//! pushes more than one value, so truncating the segment at a recorded
//! offset exactly unwinds the value it produced.
//!
//! # Module structure
//!
//! - `mod.rs`: generator state, simulation stack, undo, casts
//! - `loaders.rs`: constants, symbols, variables, members
//! - `exprs.rs`: containers, arithmetic, comparisons, diagnostics
//! - `assign.rs`: designator rewriting (storers, LEA, deleters)
//! - `jumps.rs`: forward/backward jumps and short-circuit forms
//! - `calls.rs`: the three direct-call forms and constructor calls

mod assign;
mod calls;
mod exprs;
mod jumps;
mod loaders;

pub use calls::CallKind;

use crate::codeseg::{self, CodeSeg, Op};
use crate::error::{CompileError, CompileResult};
use crate::typesys::{QueenBee, State, StateExt, TypeRef};
use crate::vm;
use shannon_runtime::{RtStack, Variant};
use std::rc::Rc;

/// One simulated value: its static type and the emit offset of the
/// instruction that pushes it.
#[derive(Debug, Clone)]
pub(super) struct SimStackItem {
    pub ty: TypeRef,
    pub offs: usize,
}

pub struct CodeGen {
    pub(super) codeseg: CodeSeg,
    /// The state being compiled; `None` marks a compile-time (constant
    /// expression) generator
    pub(super) code_owner: Option<Rc<State>>,
    /// Where derived types get registered
    pub(super) type_reg: Rc<State>,
    /// The module enclosing the compilation, for self-var routing
    pub(super) module: Rc<State>,
    pub(super) qb: QueenBee,
    pub(super) sim_stack: Vec<SimStackItem>,
    pub(super) peak: usize,
    pub(super) locals: usize,
    /// Emit offset of the most recently popped loader; designator
    /// rewriting targets it
    pub(super) prev_loader_offs: Option<usize>,
}

/// Headroom over the simulated peak for the LEA object slot.
const STACK_MARGIN: usize = 2;

impl CodeGen {
    pub fn new(
        code_owner: Option<Rc<State>>,
        type_reg: Rc<State>,
        module: Rc<State>,
        qb: QueenBee,
    ) -> CodeGen {
        CodeGen {
            codeseg: CodeSeg::new(),
            code_owner,
            type_reg,
            module,
            qb,
            sim_stack: Vec::new(),
            peak: 0,
            locals: 0,
            prev_loader_offs: None,
        }
    }

    /// Generator for a state's body.
    pub fn for_state(state: &Rc<State>, qb: QueenBee) -> CodeGen {
        let module = state.module();
        CodeGen::new(Some(state.clone()), state.clone(), module, qb)
    }

    /// Compile-time generator for constant expressions.
    pub fn const_expr(type_reg: &Rc<State>, module: &Rc<State>, qb: QueenBee) -> CodeGen {
        CodeGen::new(None, type_reg.clone(), module.clone(), qb)
    }

    pub fn is_compile_time(&self) -> bool {
        self.code_owner.is_none()
    }

    pub fn current_offs(&self) -> usize {
        self.codeseg.size()
    }

    pub fn stack_level(&self) -> usize {
        self.sim_stack.len()
    }

    pub fn locals(&self) -> usize {
        self.locals
    }

    pub fn qb(&self) -> &QueenBee {
        &self.qb
    }

    // --- simulation stack

    pub(super) fn emit(&mut self, op: Op) {
        self.codeseg.append_op(op);
    }

    /// Emit an opcode that pushes exactly one value.
    pub(super) fn emit_push(&mut self, ty: TypeRef, op: Op) {
        self.sim_stack.push(SimStackItem { ty, offs: self.codeseg.size() });
        if self.sim_stack.len() > self.peak {
            self.peak = self.sim_stack.len();
        }
        self.codeseg.append_op(op);
    }

    pub(super) fn stk_pop(&mut self) -> CompileResult<SimStackItem> {
        let item = self
            .sim_stack
            .pop()
            .ok_or_else(|| CompileError::internal(0x6001, "simulation stack underflow"))?;
        self.prev_loader_offs = Some(item.offs);
        Ok(item)
    }

    pub fn stk_top(&self) -> CompileResult<&TypeRef> {
        self.stk_top_item().map(|item| &item.ty)
    }

    pub(super) fn stk_top_item(&self) -> CompileResult<&SimStackItem> {
        self.sim_stack
            .last()
            .ok_or_else(|| CompileError::internal(0x6001, "simulation stack underflow"))
    }

    /// 1-based depth from the top: `stk_top_at(1)` is the top.
    pub(super) fn stk_top_at(&self, i: usize) -> CompileResult<&TypeRef> {
        let len = self.sim_stack.len();
        if i == 0 || i > len {
            return Err(CompileError::internal(0x6001, "simulation stack underflow"));
        }
        Ok(&self.sim_stack[len - i].ty)
    }

    /// Retype the top item without touching the emitted code.
    pub(super) fn stk_replace_top(&mut self, ty: TypeRef) -> CompileResult<()> {
        let item = self
            .sim_stack
            .last_mut()
            .ok_or_else(|| CompileError::internal(0x6001, "simulation stack underflow"))?;
        item.ty = ty;
        Ok(())
    }

    // --- undo

    /// Truncate the segment at `from` and drop the one value it produced.
    pub fn undo_subexpr(&mut self, from: usize) -> CompileResult<()> {
        self.codeseg.erase_from(from);
        self.sim_stack
            .pop()
            .ok_or_else(|| CompileError::internal(0x6001, "simulation stack underflow"))?;
        self.prev_loader_offs = None;
        Ok(())
    }

    /// Undo the top value; valid only when it came from a primary loader.
    pub fn undo_last_load(&mut self) -> CompileResult<()> {
        let offs = self.stk_top_item()?.offs;
        if !codeseg::is_undoable_loader(self.codeseg.op_at(offs)) {
            return Err(CompileError::Type("Invalid type cast".into()));
        }
        self.undo_subexpr(offs)
    }

    /// If the top value is a bare type reference, remove it and return the
    /// type it referenced.
    pub fn try_undo_type_ref(&mut self) -> CompileResult<Option<TypeRef>> {
        let offs = self.stk_top_item()?.offs;
        if self.codeseg.op_at(offs) != Op::LoadTypeRef {
            return Ok(None);
        }
        let ty = self.codeseg.type_at(self.codeseg.u16_at(offs + 1)).clone();
        self.undo_subexpr(offs)?;
        Ok(Some(ty))
    }

    /// Offset marking the start of a discardable subexpression.
    pub fn begin_discardable(&self) -> usize {
        self.current_offs()
    }

    // --- values

    /// Pop and discard the top value.
    pub fn pop_value(&mut self) -> CompileResult<()> {
        self.stk_pop()?;
        self.emit(Op::Pop);
        Ok(())
    }

    /// Emit pops down to `base_level` without adjusting the simulation
    /// stack; used before break/continue, where control leaves the block
    /// but compilation continues inside it.
    pub fn deinit_frame(&mut self, base_level: usize) -> CompileResult<()> {
        if base_level > self.sim_stack.len() {
            return Err(CompileError::internal(0x6002, "bad frame level"));
        }
        for _ in base_level..self.sim_stack.len() {
            self.emit(Op::Pop);
        }
        Ok(())
    }

    // --- casts

    /// Attempt the implicit conversions; true when the top value now has
    /// type `to`.
    pub fn try_implicit_cast(&mut self, to: &TypeRef) -> CompileResult<bool> {
        let from = self.stk_top()?.clone();

        if Rc::ptr_eq(&from, to) {
            return Ok(true);
        }

        if to.is_variant() || from.can_assign_to(to) {
            self.stk_replace_top(to.clone())?;
            return Ok(true);
        }

        // Vector elements convert to one-element vectors when the context
        // asks for it, e.g. char -> str
        if to.is_any_vec()
            && to.cont_elem().is_some_and(|elem| from.identical_to(elem))
        {
            self.elem_to_vec(Some(to.clone()))?;
            return Ok(true);
        }

        if from.is_null_cont() && to.is_any_cont() {
            self.undo_last_load()?;
            self.load_empty_const(to)?;
            return Ok(true);
        }

        Ok(false)
    }

    pub fn implicit_cast(&mut self, to: &TypeRef, errmsg: &str) -> CompileResult<()> {
        if self.try_implicit_cast(to)? {
            Ok(())
        } else {
            Err(CompileError::Type(errmsg.to_string()))
        }
    }

    /// Explicit cast: additionally retags between ordinal kinds and defers
    /// variant narrowing to the runtime.
    pub fn explicit_cast(&mut self, to: &TypeRef) -> CompileResult<()> {
        if self.try_implicit_cast(to)? {
            return Ok(());
        }
        let from = self.stk_top()?.clone();
        if from.is_any_ord() && to.is_any_ord() {
            self.stk_replace_top(to.clone())
        } else if from.is_variant() {
            self.stk_pop()?;
            let idx = self.codeseg.add_type(to);
            self.emit_push(to.clone(), Op::Cast);
            self.codeseg.append_u16(idx);
            Ok(())
        } else {
            Err(CompileError::Type("Invalid typecast".into()))
        }
    }

    /// `is` test. Statically decidable cases fold to a constant and discard
    /// the operand expression starting at `undo_offs`.
    pub fn is_type(&mut self, to: &TypeRef, undo_offs: usize) -> CompileResult<()> {
        let from = self.stk_top()?.clone();
        if from.can_assign_to(to) {
            self.undo_subexpr(undo_offs)?;
            self.load_const(&self.qb.bool_(), &Variant::Ord(1))
        } else if from.is_any_state() || from.is_variant() {
            self.stk_pop()?;
            let idx = self.codeseg.add_type(to);
            self.emit_push(self.qb.bool_(), Op::IsType);
            self.codeseg.append_u16(idx);
            Ok(())
        } else {
            self.undo_subexpr(undo_offs)?;
            self.load_const(&self.qb.bool_(), &Variant::Ord(0))
        }
    }

    // --- completion

    /// Seal the segment. After every statement the simulation stack holds
    /// exactly the declared locals; at close time all blocks are gone.
    pub fn end(mut self) -> CompileResult<CodeSeg> {
        if self.sim_stack.len() != self.locals {
            return Err(CompileError::internal(0x6003, "unbalanced simulation stack"));
        }
        self.codeseg.close(self.peak + STACK_MARGIN);
        Ok(self.codeseg)
    }

    /// Close a compile-time segment and run it through the interpreter,
    /// yielding the constant's type and value.
    pub fn finish_const_expr(
        mut self,
        expect: Option<&TypeRef>,
    ) -> CompileResult<(TypeRef, Variant)> {
        if !self.is_compile_time() {
            return Err(CompileError::internal(0x600a, "const run of a runtime generator"));
        }
        let result_type = match expect {
            Some(t) => {
                self.implicit_cast(t, "Type mismatch in constant expression")?;
                t.clone()
            }
            None => self.stk_top()?.clone(),
        };
        self.store_ret(&result_type)?;
        let seg = self.end()?;

        let mut stack = RtStack::new(seg.stack_size() + 1);
        stack.push(Variant::Void); // storage for the result
        let mut sink = std::io::sink();
        vm::run(&mut sink, None, &mut stack, &seg)
            .map_err(|e| CompileError::ConstExpr(e.to_string()))?;
        let result = stack.pop().map_err(|e| CompileError::ConstExpr(e.to_string()))?;
        Ok((result_type, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typesys::StateExt;
    use shannon_runtime::StateObj;

    fn const_gen(qb: &QueenBee) -> CodeGen {
        CodeGen::const_expr(&qb.module(), &qb.module(), qb.clone())
    }

    fn run_module_code(seg: CodeSeg, obj: &std::rc::Rc<StateObj>) {
        let mut stack = RtStack::new(seg.stack_size());
        let mut sink = std::io::sink();
        vm::run(&mut sink, Some(obj), &mut stack, &seg).unwrap();
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn test_const_fold_arithmetic() {
        let qb = QueenBee::new();
        let mut gen_ = const_gen(&qb);
        gen_.load_const(&qb.int(), &Variant::Ord(2)).unwrap();
        gen_.load_const(&qb.int(), &Variant::Ord(3)).unwrap();
        gen_.arithm_binary(Op::Add).unwrap();
        let (ty, value) = gen_.finish_const_expr(None).unwrap();
        assert!(ty.is_int());
        assert_eq!(value, Variant::Ord(5));
    }

    #[test]
    fn test_const_fold_string_concat() {
        let qb = QueenBee::new();
        let mut gen_ = const_gen(&qb);
        gen_.load_const(&qb.str_(), &Variant::from("ab")).unwrap();
        gen_.load_const(&qb.str_(), &Variant::from("cd")).unwrap();
        gen_.cat().unwrap();
        let (_, value) = gen_.finish_const_expr(None).unwrap();
        assert_eq!(value, Variant::from("abcd"));
    }

    #[test]
    fn test_const_fold_runtime_error_surfaces() {
        let qb = QueenBee::new();
        let mut gen_ = const_gen(&qb);
        gen_.load_const(&qb.int(), &Variant::Ord(1)).unwrap();
        gen_.load_const(&qb.int(), &Variant::Ord(0)).unwrap();
        gen_.arithm_binary(Op::Div).unwrap();
        let err = gen_.finish_const_expr(None).unwrap_err();
        assert!(matches!(err, CompileError::ConstExpr(_)));
    }

    #[test]
    fn test_const_expr_rejects_runtime_vars() {
        let qb = QueenBee::new();
        let module = State::new("m", None, true, false);
        let var = module.add_self_var("x", qb.int()).unwrap();
        let mut gen_ = CodeGen::const_expr(&module, &module, qb.clone());
        gen_.load_variable(&var).unwrap(); // placeholder, fails when run
        let err = gen_.finish_const_expr(None).unwrap_err();
        assert!(matches!(err, CompileError::ConstExpr(_)));
    }

    #[test]
    fn test_undo_last_load_restores_state() {
        let qb = QueenBee::new();
        let mut gen_ = const_gen(&qb);
        gen_.load_const(&qb.int(), &Variant::Ord(7)).unwrap();
        let size = gen_.current_offs();
        let level = gen_.stack_level();
        gen_.load_const(&qb.str_(), &Variant::from("gone")).unwrap();
        gen_.undo_last_load().unwrap();
        assert_eq!(gen_.current_offs(), size);
        assert_eq!(gen_.stack_level(), level);
    }

    #[test]
    fn test_try_undo_type_ref() {
        let qb = QueenBee::new();
        let mut gen_ = const_gen(&qb);
        gen_.load_type_ref(&qb.int()).unwrap();
        let t = gen_.try_undo_type_ref().unwrap().expect("type ref");
        assert!(t.is_int());
        assert_eq!(gen_.current_offs(), 0);
        assert_eq!(gen_.stack_level(), 0);
    }

    #[test]
    fn test_implicit_cast_null_container() {
        let qb = QueenBee::new();
        let mut gen_ = const_gen(&qb);
        gen_.load_const(&qb.null_cont(), &Variant::Void).unwrap();
        assert!(gen_.try_implicit_cast(&qb.str_()).unwrap());
        let (ty, value) = gen_.finish_const_expr(None).unwrap();
        assert!(ty.is_byte_vec());
        assert_eq!(value, Variant::Str(shannon_runtime::Str::new()));
    }

    #[test]
    fn test_implicit_cast_elem_to_vec() {
        let qb = QueenBee::new();
        let mut gen_ = const_gen(&qb);
        // char widens to str when the context asks for a string
        gen_.load_const(&qb.char_(), &Variant::Ord(b'x' as i64)).unwrap();
        assert!(gen_.try_implicit_cast(&qb.str_()).unwrap());
        let (_, value) = gen_.finish_const_expr(None).unwrap();
        assert_eq!(value, Variant::from("x"));
    }

    #[test]
    fn test_grounded_lvalue_rewrite() {
        let qb = QueenBee::new();
        let module = State::new("m", None, true, false);
        let var = module.add_self_var("x", qb.int()).unwrap();
        let mut gen_ = CodeGen::for_state(&module, qb.clone());
        gen_.load_variable(&var).unwrap();
        let storer = gen_.lvalue().unwrap();
        assert_eq!(storer[0], Op::StoreSelfVar as u8);
        gen_.load_const(&qb.int(), &Variant::Ord(42)).unwrap();
        gen_.assignment(&storer).unwrap();
        let seg = gen_.end().unwrap();

        let obj = module.new_instance();
        run_module_code(seg, &obj);
        assert_eq!(obj.var(var.id).unwrap(), Variant::Ord(42));
    }

    #[test]
    fn test_compound_lvalue_rewrite_through_lea() {
        let qb = QueenBee::new();
        let module = State::new("m", None, true, false);
        let vec_type = {
            use crate::typesys::TypeRefExt;
            qb.int().derive_vec(&qb, &module)
        };
        let var = module.add_self_var("v", vec_type).unwrap();
        let mut gen_ = CodeGen::for_state(&module, qb.clone());

        // v = [5]
        gen_.load_const(&qb.int(), &Variant::Ord(5)).unwrap();
        gen_.elem_to_vec(None).unwrap();
        gen_.init_self_var(&var).unwrap();

        // v[0] = 9: loader chain rewritten into LEA + compound storer
        gen_.load_variable(&var).unwrap();
        gen_.load_const(&qb.int(), &Variant::Ord(0)).unwrap();
        gen_.load_container_elem().unwrap();
        let storer = gen_.lvalue().unwrap();
        assert_eq!(storer[0], Op::StoreVecElem as u8);
        gen_.load_const(&qb.int(), &Variant::Ord(9)).unwrap();
        gen_.assignment(&storer).unwrap();
        let seg = gen_.end().unwrap();

        let obj = module.new_instance();
        run_module_code(seg, &obj);
        let v = obj.var(var.id).unwrap();
        assert_eq!(v.as_vec().unwrap().at(0).unwrap(), Variant::Ord(9));
    }

    #[test]
    fn test_statement_leaves_sim_stack_balanced() {
        let qb = QueenBee::new();
        let module = State::new("m", None, true, false);
        let var = module.add_self_var("x", qb.int()).unwrap();
        let mut gen_ = CodeGen::for_state(&module, qb.clone());
        gen_.load_const(&qb.int(), &Variant::Ord(1)).unwrap();
        gen_.init_self_var(&var).unwrap();
        assert_eq!(gen_.stack_level(), gen_.locals());
    }

    #[test]
    fn test_jump_too_far_is_compile_error() {
        let qb = QueenBee::new();
        let module = State::new("m", None, true, false);
        let mut gen_ = CodeGen::for_state(&module, qb.clone());
        let jump = gen_.jump_forward(Op::Jump).unwrap();
        for _ in 0..40_000 {
            gen_.emit(Op::Nop);
        }
        assert_eq!(gen_.resolve_jump(jump).unwrap_err(), CompileError::JumpTooFar);
    }

    #[test]
    fn test_direct_call_convention() {
        let qb = QueenBee::new();
        let module = State::new("m", None, true, false);
        let result = module.add_self_var("out", qb.int()).unwrap();

        // def double(int a): int { return a + a }
        let callee = State::new("double", Some(&module), false, false);
        let arg = callee.add_arg("a", qb.int()).unwrap();
        callee.set_result_type(qb.int()).unwrap();
        let mut fgen = CodeGen::for_state(&callee, qb.clone());
        fgen.load_variable(&arg).unwrap();
        fgen.load_variable(&arg).unwrap();
        fgen.arithm_binary(Op::Add).unwrap();
        let Some(crate::symbols::Symbol::Var(ret)) = callee.find_shallow("result") else {
            panic!("missing result var");
        };
        fgen.store_result(&ret, callee.arg_count()).unwrap();
        callee.set_code(std::rc::Rc::new(fgen.end().unwrap()));

        // out = double(21)
        let mut gen_ = CodeGen::for_state(&module, qb.clone());
        gen_.load_call_result_slot(&callee).unwrap();
        gen_.load_const(&qb.int(), &Variant::Ord(21)).unwrap();
        let kind = gen_.call_kind_for(&callee).unwrap();
        assert_eq!(kind, CallKind::Child);
        gen_.call(&callee, kind).unwrap();
        gen_.init_self_var(&result).unwrap();
        let seg = gen_.end().unwrap();

        let obj = module.new_instance();
        run_module_code(seg, &obj);
        assert_eq!(obj.var(result.id).unwrap(), Variant::Ord(42));
    }

    #[test]
    fn test_reference_roundtrip() {
        let qb = QueenBee::new();
        let module = State::new("m", None, true, false);
        let out_var = module.add_self_var("out", qb.int()).unwrap();
        let mut gen_ = CodeGen::for_state(&module, qb.clone());
        gen_.load_const(&qb.int(), &Variant::Ord(5)).unwrap();
        gen_.mk_ref().unwrap();
        assert!(gen_.stk_top().unwrap().is_reference());
        assert!(gen_.deref().unwrap());
        assert!(gen_.stk_top().unwrap().is_int());
        gen_.init_self_var(&out_var).unwrap();
        let seg = gen_.end().unwrap();
        let obj = module.new_instance();
        run_module_code(seg, &obj);
        assert_eq!(obj.var(out_var.id).unwrap(), Variant::Ord(5));
    }

    #[test]
    fn test_store_through_reference() {
        let qb = QueenBee::new();
        let module = State::new("m", None, true, false);
        let ref_int = module.register_unique(crate::typesys::Type::new_ref(qb.int()));
        let r = module.add_self_var("r", ref_int).unwrap();
        let out = module.add_self_var("out", qb.int()).unwrap();
        let mut gen_ = CodeGen::for_state(&module, qb.clone());

        // r = ref of 1
        gen_.load_const(&qb.int(), &Variant::Ord(1)).unwrap();
        gen_.mk_ref().unwrap();
        gen_.init_self_var(&r).unwrap();

        // r^ = 9, via the deref-to-StoreRef rewrite
        gen_.load_variable(&r).unwrap();
        gen_.deref().unwrap();
        let storer = gen_.lvalue().unwrap();
        assert_eq!(storer[0], Op::StoreRef as u8);
        gen_.load_const(&qb.int(), &Variant::Ord(9)).unwrap();
        gen_.assignment(&storer).unwrap();

        // out = r^
        gen_.load_variable(&r).unwrap();
        gen_.deref().unwrap();
        gen_.init_self_var(&out).unwrap();

        let seg = gen_.end().unwrap();
        let obj = module.new_instance();
        run_module_code(seg, &obj);
        assert_eq!(obj.var(out.id).unwrap(), Variant::Ord(9));
    }

    #[test]
    fn test_load_this_requires_ctor() {
        let qb = QueenBee::new();
        let module = State::new("m", None, true, false);
        let mut gen_ = CodeGen::for_state(&module, qb.clone());
        assert!(gen_.load_this().is_err());

        let ctor = State::new("thing", Some(&module), false, true);
        let mut cgen = CodeGen::for_state(&ctor, qb.clone());
        cgen.load_this().unwrap();
        assert!(cgen.stk_top().unwrap().is_any_state());
    }

    #[test]
    fn test_stack_bound_covers_peak() {
        let qb = QueenBee::new();
        let mut gen_ = const_gen(&qb);
        for i in 0..5 {
            gen_.load_const(&qb.int(), &Variant::Ord(i)).unwrap();
        }
        for _ in 0..4 {
            gen_.arithm_binary(Op::Add).unwrap();
        }
        let peak = gen_.peak;
        let (_, value) = gen_.finish_const_expr(None).unwrap();
        assert_eq!(value, Variant::Ord(10));
        assert!(peak >= 5);
    }
}
