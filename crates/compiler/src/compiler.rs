//! The recursive-descent compiler: statements.
//!
//! Drives the code generator one operation per construct; expressions live
//! in `compexpr.rs`. Each statement leaves the simulation stack holding
//! exactly the declared locals.

use crate::codegen::CodeGen;
use crate::codeseg::Op;
use crate::context::Context;
use crate::error::{CompileError, CompileResult, ShannonError};
use crate::lexer::{Lexer, Tok};
use crate::symbols::{BlockScope, Symbol};
use crate::typesys::{QueenBee, State, StateExt, Type, TypeId, TypeRef};
use shannon_runtime::Variant;
use std::rc::Rc;

pub(crate) struct LoopInfo {
    pub continue_target: usize,
    pub break_jumps: Vec<usize>,
    pub stack_level: usize,
}

/// Per-state compilation context: the code owner, its open block scopes,
/// enclosing loops and pending `return` jumps.
pub(crate) struct FnCtx {
    pub state: Rc<State>,
    pub blocks: Vec<BlockScope>,
    pub loops: Vec<LoopInfo>,
    pub ret_jumps: Vec<usize>,
}

impl FnCtx {
    fn new(state: Rc<State>) -> FnCtx {
        FnCtx { state, blocks: Vec::new(), loops: Vec::new(), ret_jumps: Vec::new() }
    }
}

pub struct Compiler<'a> {
    pub(crate) ctx: &'a mut Context,
    pub(crate) lex: Lexer,
    pub(crate) tok: Tok,
    pub(crate) tok_start: usize,
    pub(crate) module: Rc<State>,
    pub(crate) qb: QueenBee,
}

impl<'a> Compiler<'a> {
    pub fn new(ctx: &'a mut Context, module: Rc<State>, source: &str, file: &str) -> Compiler<'a> {
        let qb = ctx.qb().clone();
        Compiler {
            ctx,
            lex: Lexer::new(source, file),
            tok: Tok::Eof,
            tok_start: 0,
            module,
            qb,
        }
    }

    /// Compile the whole module body into its code segment.
    pub fn compile_module(mut self) -> Result<(), ShannonError> {
        let mut gen_ = CodeGen::for_state(&self.module.clone(), self.qb.clone());
        let mut fctx = FnCtx::new(self.module.clone());
        self.next()?;
        self.skip_seps()?;
        while self.tok != Tok::Eof {
            self.statement(&mut gen_, &mut fctx)?;
            self.skip_seps()?;
        }
        let seg = gen_.end().map_err(|e| e.at(self.lex.loc()))?;
        self.module.set_code(Rc::new(seg));
        Ok(())
    }

    // --- token plumbing

    pub(crate) fn next(&mut self) -> CompileResult<()> {
        let (tok, start) = self.lex.next_token()?;
        self.tok = tok;
        self.tok_start = start;
        Ok(())
    }

    pub(crate) fn accept(&mut self, tok: Tok) -> CompileResult<bool> {
        if self.tok == tok {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(crate) fn expect(&mut self, tok: Tok, what: &str) -> CompileResult<()> {
        if self.tok == tok {
            self.next()
        } else {
            self.parse_error(format!("{} expected", what))
        }
    }

    pub(crate) fn ident(&mut self) -> CompileResult<String> {
        match self.tok.clone() {
            Tok::Ident(name) => {
                self.next()?;
                Ok(name)
            }
            _ => self.parse_error("Identifier expected"),
        }
    }

    pub(crate) fn skip_seps(&mut self) -> CompileResult<()> {
        while self.tok == Tok::Sep {
            self.next()?;
        }
        Ok(())
    }

    pub(crate) fn parse_error<T>(&self, msg: impl Into<String>) -> CompileResult<T> {
        Err(CompileError::Parse { loc: self.lex.loc(), msg: msg.into() })
    }

    /// Name lookup: innermost block scopes first, then the lexical state
    /// chain (which ends at the module and its imports).
    pub(crate) fn resolve(&self, fctx: &FnCtx, name: &str) -> CompileResult<Symbol> {
        for block in fctx.blocks.iter().rev() {
            if let Some(sym) = block.find(name) {
                return Ok(sym);
            }
        }
        fctx.state
            .deep_find(name)
            .ok_or_else(|| CompileError::UnknownIdent(name.to_string()))
    }

    fn resolve_quiet(&self, fctx: &FnCtx, name: &str) -> Option<Symbol> {
        self.resolve(fctx, name).ok()
    }

    /// True when the current token opens a type expression (an identifier
    /// aliasing a type descriptor).
    pub(crate) fn at_type_ident(&self, fctx: &FnCtx) -> bool {
        match &self.tok {
            Tok::Ident(name) => matches!(
                self.resolve_quiet(fctx, name),
                Some(Symbol::Def(d)) if d.alias.is_some()
            ),
            _ => false,
        }
    }

    // --- statements

    fn statement(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> Result<(), ShannonError> {
        let loc = self.lex.loc();
        if self.ctx.options.line_info && !gen_.is_compile_time() {
            gen_.line_num(self.lex.line());
        }
        self.statement_inner(gen_, fctx).map_err(|e| match e {
            ShannonError::Compile(ce) => ShannonError::Compile(ce.at(loc)),
            other => other,
        })
    }

    fn statement_inner(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> Result<(), ShannonError> {
        match self.tok.clone() {
            Tok::Const => self.const_def(gen_, fctx).map_err(ShannonError::from),
            Tok::Var => self.var_def(gen_, fctx).map_err(ShannonError::from),
            Tok::Enum => self.enum_def(fctx).map_err(ShannonError::from),
            Tok::Def => self.func_def(fctx),
            Tok::Uses => self.uses_stmt(fctx),
            Tok::Echo => self.echo_stmt(gen_, fctx).map_err(ShannonError::from),
            Tok::Assert => self.assert_stmt(gen_, fctx).map_err(ShannonError::from),
            Tok::Dump => self.dump_stmt(gen_, fctx).map_err(ShannonError::from),
            Tok::Exit => self.exit_stmt(gen_, fctx).map_err(ShannonError::from),
            Tok::Return => self.return_stmt(gen_, fctx).map_err(ShannonError::from),
            Tok::Del => self.del_stmt(gen_, fctx).map_err(ShannonError::from),
            Tok::If => self.if_stmt(gen_, fctx),
            Tok::While => self.while_stmt(gen_, fctx),
            Tok::Break => self.break_stmt(gen_, fctx).map_err(ShannonError::from),
            Tok::Continue => self.continue_stmt(gen_, fctx).map_err(ShannonError::from),
            Tok::Case => self.case_stmt(gen_, fctx),
            Tok::LBrace => self.block(gen_, fctx),
            _ => self.designator_stmt(gen_, fctx).map_err(ShannonError::from),
        }
    }

    /// `{ statements }` with its own local scope.
    fn block(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> Result<(), ShannonError> {
        self.expect(Tok::LBrace, "'{'")?;
        let start_id = fctx.blocks.last().map_or(0, BlockScope::next_id);
        fctx.blocks.push(BlockScope::new(start_id));
        loop {
            self.skip_seps()?;
            if self.tok == Tok::RBrace {
                break;
            }
            if self.tok == Tok::Eof {
                self.parse_error::<()>("'}' expected")?;
            }
            self.statement(gen_, fctx)?;
        }
        self.next()?; // consume '}'
        let block = fctx.blocks.pop().expect("block scope balance");
        for var in block.locals().iter().rev() {
            gen_.deinit_local_var(var)?;
        }
        Ok(())
    }

    /// `const [type] name = expr`: folded at compile time; a typeref
    /// result declares a type alias.
    fn const_def(&mut self, _gen: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.next()?;
        // `const int x = ...` declares a type; `const x = ...` infers it.
        // A fresh name never resolves to a type alias, so the lookahead is
        // unambiguous.
        let expect = if self.at_type_ident(fctx) {
            Some(self.parse_type_expr(fctx)?)
        } else {
            None
        };
        let name = self.ident()?;
        self.expect(Tok::Assign, "'='")?;
        let mut cgen = CodeGen::const_expr(&fctx.state, &self.module, self.qb.clone());
        self.expression(&mut cgen, fctx, None)?;
        let (ty, value) = cgen.finish_const_expr(expect.as_ref())?;
        if ty.is_type_ref() {
            let aliased = type_from_value(&value)?;
            fctx.state.add_type_alias(&name, self.qb.type_ref(), aliased)?;
        } else {
            fctx.state.add_definition(&name, ty, value)?;
        }
        Ok(())
    }

    /// `var [type] name = expr`: a self-variable at module top level, a
    /// stack local inside functions and blocks.
    fn var_def(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.next()?;
        let declared = if self.at_type_ident(fctx) {
            Some(self.parse_type_expr(fctx)?)
        } else {
            None
        };
        let name = self.ident()?;
        self.expect(Tok::Assign, "'='")?;
        self.expression(gen_, fctx, declared.as_ref())?;
        let ty = match declared {
            Some(t) => t,
            None => gen_.stk_top()?.clone(),
        };
        if fctx.state.is_module && fctx.blocks.is_empty() {
            let var = fctx.state.add_self_var(&name, ty)?;
            gen_.init_self_var(&var)?;
        } else {
            let block = fctx
                .blocks
                .last_mut()
                .ok_or_else(|| CompileError::Type("Local variable outside a block".into()))?;
            let var = block.add_local(&name, ty, &fctx.state)?;
            gen_.init_local_var(&var)?;
        }
        Ok(())
    }

    /// `enum Name = (a, b, c)`
    fn enum_def(&mut self, fctx: &mut FnCtx) -> CompileResult<()> {
        self.next()?;
        let name = self.ident()?;
        self.expect(Tok::Assign, "'='")?;
        self.expect(Tok::LParen, "'('")?;
        let mut names = Vec::new();
        loop {
            names.push(self.ident()?);
            if !self.accept(Tok::Comma)? {
                break;
            }
        }
        self.expect(Tok::RParen, "')'")?;
        if names.is_empty() {
            return Err(CompileError::Type("Empty enumeration".into()));
        }
        let values: crate::typesys::EnumValues = Rc::new(names.clone());
        let ty = fctx.state.register_type(Type::new_ord(
            TypeId::Enum,
            0,
            names.len() as i64 - 1,
            Some(values),
        ));
        fctx.state.add_type_alias(&name, self.qb.type_ref(), ty.clone())?;
        for (i, value_name) in names.iter().enumerate() {
            fctx.state.add_definition(value_name, ty.clone(), Variant::Ord(i as i64))?;
        }
        Ok(())
    }

    /// `def name(type a, type b) [: type] { body }`: a nested state with
    /// its own code segment.
    fn func_def(&mut self, fctx: &mut FnCtx) -> Result<(), ShannonError> {
        self.next()?;
        let name = self.ident()?;
        let state = State::new(&name, Some(&fctx.state), false, false);
        self.expect(Tok::LParen, "'('")?;
        if self.tok != Tok::RParen {
            loop {
                let ty = self.parse_type_expr(fctx)?;
                let arg_name = self.ident()?;
                state.add_arg(&arg_name, ty)?;
                if !self.accept(Tok::Comma)? {
                    break;
                }
            }
        }
        self.expect(Tok::RParen, "')'")?;
        if self.accept(Tok::Colon)? {
            let ret = self.parse_type_expr(fctx)?;
            state.set_result_type(ret)?;
        }
        fctx.state
            .add_type_alias(&name, self.qb.type_ref(), state.type_of())?;

        let mut gen_ = CodeGen::for_state(&state, self.qb.clone());
        let mut inner = FnCtx::new(state.clone());
        self.skip_seps()?;
        self.block(&mut gen_, &mut inner)?;
        for jump in inner.ret_jumps {
            gen_.resolve_jump(jump)?;
        }
        let seg = gen_.end().map_err(|e| e.at(self.lex.loc()))?;
        state.set_code(Rc::new(seg));
        Ok(())
    }

    /// `uses name[, name]`: import modules, compiling them on demand.
    fn uses_stmt(&mut self, fctx: &mut FnCtx) -> Result<(), ShannonError> {
        if !fctx.state.is_module || !fctx.blocks.is_empty() {
            return Err(CompileError::Type("'uses' is only allowed at module level".into()).into());
        }
        self.next()?;
        loop {
            let name = self.ident()?;
            let imported = self.ctx.get_module(&name)?;
            self.module.add_uses(&imported)?;
            if !self.accept(Tok::Comma)? {
                break;
            }
        }
        Ok(())
    }

    /// `echo expr[, expr]`: typed output plus a newline.
    fn echo_stmt(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.next()?;
        if !matches!(self.tok, Tok::Sep | Tok::Eof | Tok::RBrace) {
            loop {
                self.expression(gen_, fctx, None)?;
                gen_.echo()?;
                if self.accept(Tok::Comma)? {
                    gen_.echo_sep();
                } else {
                    break;
                }
            }
        }
        gen_.echo_ln();
        Ok(())
    }

    /// `assert expr`; compiled out when assertions are disabled.
    fn assert_stmt(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.next()?;
        let text_start = self.tok_start;
        let code_start = gen_.begin_discardable();
        let line = self.lex.line();
        self.expression(gen_, fctx, None)?;
        if self.ctx.options.enable_assert {
            let cond = self.lex.text_between(text_start, self.tok_start);
            let file = self.lex.file().to_string();
            gen_.assertion(&cond, &file, line)?;
        } else {
            gen_.undo_subexpr(code_start)?;
        }
        Ok(())
    }

    /// `dump expr`: diagnostic print of the expression text and value.
    fn dump_stmt(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.next()?;
        let text_start = self.tok_start;
        let code_start = gen_.begin_discardable();
        self.expression(gen_, fctx, None)?;
        if self.ctx.options.enable_dump {
            let expr = self.lex.text_between(text_start, self.tok_start);
            gen_.dump_var(&expr)?;
        } else {
            gen_.undo_subexpr(code_start)?;
        }
        Ok(())
    }

    /// `exit [expr]`: store the program result, then terminate cleanly.
    fn exit_stmt(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.next()?;
        if !matches!(self.tok, Tok::Sep | Tok::Eof | Tok::RBrace) {
            let sym = self.resolve(fctx, "result")?;
            let Symbol::Var(result_var) = sym else {
                return Err(CompileError::internal(0x600e, "missing result variable"));
            };
            gen_.load_variable(&result_var)?;
            let storer = gen_.lvalue()?;
            self.expression(gen_, fctx, None)?;
            gen_.assignment(&storer)?;
        }
        gen_.program_exit();
        Ok(())
    }

    /// `return [expr]` inside a function body.
    fn return_stmt(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        if fctx.state.parent.is_none() {
            return Err(CompileError::Type("'return' outside a function".into()));
        }
        self.next()?;
        if !matches!(self.tok, Tok::Sep | Tok::Eof | Tok::RBrace) {
            let Some(Symbol::Var(result_var)) = fctx.state.find_shallow("result") else {
                return Err(CompileError::Type("Function has no return value".into()));
            };
            self.expression(gen_, fctx, None)?;
            gen_.store_result(&result_var, fctx.state.arg_count())?;
        }
        gen_.deinit_frame(0)?;
        let jump = gen_.jump_forward(Op::Jump)?;
        fctx.ret_jumps.push(jump);
        Ok(())
    }

    /// `del designator[...]`: remove a container element in place.
    fn del_stmt(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.next()?;
        self.designator(gen_, fctx)?;
        gen_.del_container_elem()
    }

    fn if_stmt(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> Result<(), ShannonError> {
        self.next()?;
        self.expression(gen_, fctx, None)?;
        let skip = gen_.bool_jump_forward(Op::JumpFalse)?;
        self.skip_seps()?;
        self.block(gen_, fctx)?;
        self.skip_seps()?;
        if self.tok == Tok::Elif || self.tok == Tok::Else {
            let out = gen_.jump_forward(Op::Jump)?;
            gen_.resolve_jump(skip)?;
            if self.tok == Tok::Elif {
                self.if_stmt(gen_, fctx)?;
            } else {
                self.next()?;
                self.skip_seps()?;
                self.block(gen_, fctx)?;
            }
            gen_.resolve_jump(out)?;
        } else {
            gen_.resolve_jump(skip)?;
        }
        Ok(())
    }

    fn while_stmt(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> Result<(), ShannonError> {
        self.next()?;
        let target = gen_.current_offs();
        self.expression(gen_, fctx, None)?;
        let out = gen_.bool_jump_forward(Op::JumpFalse)?;
        fctx.loops.push(LoopInfo {
            continue_target: target,
            break_jumps: Vec::new(),
            stack_level: gen_.stack_level(),
        });
        self.skip_seps()?;
        self.block(gen_, fctx)?;
        gen_.jump_to(target)?;
        let info = fctx.loops.pop().expect("loop balance");
        gen_.resolve_jump(out)?;
        for jump in info.break_jumps {
            gen_.resolve_jump(jump)?;
        }
        Ok(())
    }

    fn break_stmt(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.next()?;
        let level = match fctx.loops.last() {
            Some(info) => info.stack_level,
            None => return Err(CompileError::Type("'break' outside a loop".into())),
        };
        gen_.deinit_frame(level)?;
        let jump = gen_.jump_forward(Op::Jump)?;
        fctx.loops.last_mut().expect("loop balance").break_jumps.push(jump);
        Ok(())
    }

    fn continue_stmt(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.next()?;
        let (target, level) = match fctx.loops.last() {
            Some(info) => (info.continue_target, info.stack_level),
            None => return Err(CompileError::Type("'continue' outside a loop".into())),
        };
        gen_.deinit_frame(level)?;
        gen_.jump_to(target)
    }

    /// `case expr { label[, label]: stmt ... else: stmt }`
    fn case_stmt(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> Result<(), ShannonError> {
        self.next()?;
        self.expression(gen_, fctx, None)?;
        self.skip_seps()?;
        self.expect(Tok::LBrace, "'{'")?;
        let mut end_jumps = Vec::new();
        loop {
            self.skip_seps()?;
            if self.tok == Tok::RBrace {
                break;
            }
            if self.accept(Tok::Else)? {
                self.expect(Tok::Colon, "':'")?;
                self.statement(gen_, fctx)?;
                self.skip_seps()?;
                continue;
            }
            let mut body_jumps = Vec::new();
            let next_arm;
            loop {
                self.case_label(gen_, fctx)?;
                if self.accept(Tok::Comma)? {
                    body_jumps.push(gen_.bool_jump_forward(Op::JumpTrue)?);
                } else {
                    next_arm = gen_.bool_jump_forward(Op::JumpFalse)?;
                    break;
                }
            }
            for jump in body_jumps {
                gen_.resolve_jump(jump)?;
            }
            self.expect(Tok::Colon, "':'")?;
            self.statement(gen_, fctx)?;
            end_jumps.push(gen_.jump_forward(Op::Jump)?);
            gen_.resolve_jump(next_arm)?;
        }
        self.next()?; // consume '}'
        for jump in end_jumps {
            gen_.resolve_jump(jump)?;
        }
        gen_.pop_value()?; // the case value
        Ok(())
    }

    fn case_label(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.arithm_expr(gen_, fctx)?;
        if self.accept(Tok::DotDot)? {
            self.arithm_expr(gen_, fctx)?;
            gen_.case_range()
        } else {
            gen_.case_cmp()
        }
    }

    /// Designator-led statement: assignment, in-place update, or an
    /// expression evaluated for its effects.
    fn designator_stmt(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.designator(gen_, fctx)?;
        match self.tok.clone() {
            Tok::Assign => {
                self.next()?;
                let storer = gen_.lvalue()?;
                self.expression(gen_, fctx, None)?;
                gen_.assignment(&storer)
            }
            Tok::AddAssign | Tok::SubAssign | Tok::MulAssign | Tok::DivAssign => {
                let op = match self.tok {
                    Tok::AddAssign => Op::AddAssign,
                    Tok::SubAssign => Op::SubAssign,
                    Tok::MulAssign => Op::MulAssign,
                    _ => Op::DivAssign,
                };
                self.next()?;
                let code = gen_.arithm_lvalue(op)?;
                self.expression(gen_, fctx, None)?;
                gen_.assignment(&code)
            }
            Tok::CatAssign => {
                self.next()?;
                gen_.cat_lvalue()?;
                self.expression(gen_, fctx, None)?;
                gen_.cat_assign()
            }
            _ => {
                // expression statement: evaluate and discard
                gen_.pop_value()
            }
        }
    }
}

/// Extract the type descriptor from a typeref constant value.
pub(crate) fn type_from_value(value: &Variant) -> CompileResult<TypeRef> {
    let obj = value
        .as_rtobj()
        .map_err(|_| CompileError::Type("Type expected".into()))?
        .clone();
    obj.into_any()
        .downcast::<Type>()
        .map_err(|_| CompileError::Type("Type expected".into()))
}
