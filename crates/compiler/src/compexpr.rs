//! The recursive-descent compiler: expressions.
//!
//! Precedence, loosest to tightest: range (`..`), `or`/`xor`, `and`,
//! `not`, relational (`== != < <= > >= in is as`), additive (`+ - |`),
//! multiplicative (`* / mod shl shr`), unary (`-`, `#`), postfix
//! designators, atoms. Short-circuit `and`/`or` apply when the left
//! operand is boolean; integer operands take the bitwise meaning.

use crate::codegen::{CallKind, CodeGen};
use crate::codeseg::Op;
use crate::compiler::{type_from_value, Compiler, FnCtx};
use crate::error::{CompileError, CompileResult};
use crate::lexer::Tok;
use crate::symbols::Symbol;
use crate::typesys::{TypeRef, TypeRefExt};
use shannon_runtime::Variant;
use std::rc::Rc;

impl<'a> Compiler<'a> {
    /// Full expression; `expect` casts the result when given.
    pub(crate) fn expression(
        &mut self,
        gen_: &mut CodeGen,
        fctx: &mut FnCtx,
        expect: Option<&TypeRef>,
    ) -> CompileResult<()> {
        self.or_level(gen_, fctx)?;
        if self.accept(Tok::DotDot)? {
            self.or_level(gen_, fctx)?;
            // a range is a subrange type at compile time and a range value
            // at run time
            if gen_.is_compile_time() {
                gen_.create_subrange_type()?;
            } else {
                gen_.mk_range()?;
            }
        }
        if let Some(ty) = expect {
            gen_.implicit_cast(ty, "Type mismatch")?;
        }
        Ok(())
    }

    pub(crate) fn or_level(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.and_level(gen_, fctx)?;
        loop {
            if self.tok == Tok::Or {
                self.next()?;
                let left = gen_.stk_top()?.clone();
                if left.is_bool() {
                    let jump = gen_.bool_jump_forward(Op::JumpOr)?;
                    self.and_level(gen_, fctx)?;
                    gen_.implicit_cast(&gen_.qb().bool_(), "Boolean operand expected")?;
                    gen_.resolve_jump(jump)?;
                } else {
                    self.and_level(gen_, fctx)?;
                    gen_.arithm_binary(Op::BitOr)?;
                }
            } else if self.tok == Tok::Xor {
                self.next()?;
                self.and_level(gen_, fctx)?;
                gen_.bool_xor()?;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn and_level(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.not_level(gen_, fctx)?;
        while self.tok == Tok::And {
            self.next()?;
            let left = gen_.stk_top()?.clone();
            if left.is_bool() {
                let jump = gen_.bool_jump_forward(Op::JumpAnd)?;
                self.not_level(gen_, fctx)?;
                gen_.implicit_cast(&gen_.qb().bool_(), "Boolean operand expected")?;
                gen_.resolve_jump(jump)?;
            } else {
                self.not_level(gen_, fctx)?;
                gen_.arithm_binary(Op::BitAnd)?;
            }
        }
        Ok(())
    }

    fn not_level(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        if self.accept(Tok::Not)? {
            self.not_level(gen_, fctx)?;
            gen_.not()
        } else {
            self.relation(gen_, fctx)
        }
    }

    fn relation(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        let undo_offs = gen_.begin_discardable();
        self.arithm_expr(gen_, fctx)?;
        match self.tok.clone() {
            Tok::Eq | Tok::Ne | Tok::Lt | Tok::Le | Tok::Gt | Tok::Ge => {
                let op = match self.tok {
                    Tok::Eq => Op::Equal,
                    Tok::Ne => Op::NotEq,
                    Tok::Lt => Op::LessThan,
                    Tok::Le => Op::LessEq,
                    Tok::Gt => Op::GreaterThan,
                    _ => Op::GreaterEq,
                };
                self.next()?;
                self.arithm_expr(gen_, fctx)?;
                gen_.cmp(op)?;
            }
            Tok::In => {
                self.next()?;
                self.arithm_expr(gen_, fctx)?;
                if self.accept(Tok::DotDot)? {
                    self.arithm_expr(gen_, fctx)?;
                    gen_.in_range()?;
                } else if let Some(bounds) = gen_.try_undo_type_ref()? {
                    gen_.in_bounds(&bounds)?;
                } else {
                    gen_.in_cont()?;
                }
            }
            Tok::Is => {
                self.next()?;
                self.designator(gen_, fctx)?;
                let ty = gen_
                    .try_undo_type_ref()?
                    .ok_or_else(|| CompileError::Type("Type reference expected after 'is'".into()))?;
                gen_.is_type(&ty, undo_offs)?;
            }
            Tok::As => {
                self.next()?;
                self.designator(gen_, fctx)?;
                let ty = gen_
                    .try_undo_type_ref()?
                    .ok_or_else(|| CompileError::Type("Type reference expected after 'as'".into()))?;
                gen_.explicit_cast(&ty)?;
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn arithm_expr(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.term(gen_, fctx)?;
        loop {
            match self.tok {
                Tok::Plus => {
                    self.next()?;
                    self.term(gen_, fctx)?;
                    gen_.arithm_binary(Op::Add)?;
                }
                Tok::Minus => {
                    self.next()?;
                    self.term(gen_, fctx)?;
                    gen_.arithm_binary(Op::Sub)?;
                }
                Tok::Pipe => {
                    self.next()?;
                    // concatenation: promote a bare element to a vector
                    // first, then append elements or whole vectors
                    let left = gen_.stk_top()?.clone();
                    let left = if left.is_any_vec() {
                        left
                    } else {
                        gen_.elem_to_vec(None)?
                    };
                    self.term(gen_, fctx)?;
                    let elem = left
                        .cont_elem()
                        .cloned()
                        .ok_or_else(|| CompileError::Type("Vector type expected".into()))?;
                    let right = gen_.stk_top()?.clone();
                    if right.can_assign_to(&elem) {
                        gen_.elem_cat()?;
                    } else {
                        gen_.cat()?;
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn term(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.factor(gen_, fctx)?;
        loop {
            let op = match self.tok {
                Tok::Star => Op::Mul,
                Tok::Slash => Op::Div,
                Tok::Mod => Op::Mod,
                Tok::Shl => Op::BitShl,
                Tok::Shr => Op::BitShr,
                _ => break,
            };
            self.next()?;
            self.factor(gen_, fctx)?;
            gen_.arithm_binary(op)?;
        }
        Ok(())
    }

    fn factor(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        match self.tok {
            Tok::Minus => {
                self.next()?;
                self.factor(gen_, fctx)?;
                gen_.arithm_unary(Op::Neg)
            }
            Tok::Hash => {
                self.next()?;
                self.factor(gen_, fctx)?;
                gen_.length()
            }
            _ => self.designator(gen_, fctx),
        }
    }

    /// An atom followed by member selection, indexing, slicing, and the
    /// type derivators when the atom is a type reference.
    pub(crate) fn designator(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.atom(gen_, fctx)?;
        loop {
            match self.tok {
                Tok::Period => {
                    self.next()?;
                    let name = self.ident()?;
                    self.member_select(gen_, fctx, &name)?;
                }
                Tok::LBracket => {
                    self.next()?;
                    let top_is_type = gen_.stk_top()?.is_type_ref();
                    if top_is_type {
                        self.type_derivator(gen_, fctx)?;
                    } else {
                        self.index_or_slice(gen_, fctx)?;
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// `.name` on the value on top of the stack. A member aliasing a
    /// nested state is a method call; everything else is a member load.
    fn member_select(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx, name: &str) -> CompileResult<()> {
        let top = gen_.stk_top()?.clone();
        let Some(state) = top.as_state().cloned() else {
            return Err(CompileError::Type("Invalid member selection".into()));
        };
        match state.find_shallow(name) {
            Some(Symbol::Def(d)) if d.aliased_type().is_some_and(|t| t.is_any_state()) => {
                let callee = d
                    .aliased_type()
                    .and_then(|t| t.as_state().cloned())
                    .ok_or_else(|| CompileError::internal(0x600f, "state alias without state"))?;
                self.call_args(gen_, fctx, &callee, CallKind::Method)
            }
            Some(_) => gen_.load_member(name),
            None => Err(CompileError::UnknownIdent(name.to_string())),
        }
    }

    /// `[...]` after a type reference: `T[]` derives a vector, `T[I]` a
    /// keyed container.
    fn type_derivator(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        let base = gen_
            .try_undo_type_ref()?
            .ok_or_else(|| CompileError::Type("Type reference expected".into()))?;
        if self.accept(Tok::RBracket)? {
            let derived = base.derive_vec(gen_.qb(), &fctx.state);
            return gen_.load_type_ref(&derived);
        }
        let index = self.parse_type_expr(fctx)?;
        self.expect(Tok::RBracket, "']'")?;
        let derived = base.derive_container(&index, &fctx.state);
        gen_.load_type_ref(&derived)
    }

    /// `[i]` or `[a..b]` on a container value.
    fn index_or_slice(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        self.or_level(gen_, fctx)?;
        if self.accept(Tok::DotDot)? {
            if self.tok == Tok::RBracket {
                // open right bound: slice to the end
                gen_.load_const(&gen_.qb().void(), &Variant::Void)?;
            } else {
                self.or_level(gen_, fctx)?;
            }
            self.expect(Tok::RBracket, "']'")?;
            gen_.load_subvec()
        } else {
            self.expect(Tok::RBracket, "']'")?;
            gen_.load_container_elem()
        }
    }

    fn atom(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        match self.tok.clone() {
            Tok::Int(v) => {
                self.next()?;
                gen_.load_const(&gen_.qb().int(), &Variant::Ord(v))
            }
            Tok::Str(s) => {
                self.next()?;
                // one-character literals are chars, longer ones strings
                if s.len() == 1 {
                    gen_.load_const(&gen_.qb().char_(), &Variant::Ord(s.as_bytes()[0] as i64))
                } else {
                    gen_.load_const(&gen_.qb().str_(), &Variant::from(s.as_str()))
                }
            }
            Tok::Ident(name) => {
                self.next()?;
                self.named_atom(gen_, fctx, &name)
            }
            Tok::LParen => {
                self.next()?;
                self.expression(gen_, fctx, None)?;
                self.expect(Tok::RParen, "')'")
            }
            Tok::LBracket => {
                self.next()?;
                self.bracket_ctor(gen_, fctx)
            }
            Tok::LBrace => {
                self.next()?;
                self.set_ctor(gen_, fctx)
            }
            _ => self.parse_error("Expression expected"),
        }
    }

    /// Identifier atom: definitions load as constants or type references;
    /// state aliases must be called (or, for modules, member-selected);
    /// variables load through their storage route.
    fn named_atom(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx, name: &str) -> CompileResult<()> {
        let sym = self.resolve(fctx, name)?;
        match sym {
            Symbol::Def(d) => {
                if let Some(aliased) = d.aliased_type() {
                    if aliased.is_module() {
                        // module alias: usable only for member selection,
                        // which resolves through the import slot variable
                        let module = aliased
                            .as_state()
                            .cloned()
                            .ok_or_else(|| CompileError::internal(0x600f, "module alias"))?;
                        self.expect(Tok::Period, "'.'")?;
                        let member = self.ident()?;
                        return self.module_member(gen_, fctx, &module, &member);
                    }
                    if aliased.is_any_state() {
                        let callee = aliased
                            .as_state()
                            .cloned()
                            .ok_or_else(|| CompileError::internal(0x600f, "state alias"))?;
                        let kind = gen_.call_kind_for(&callee)?;
                        return self.call_args(gen_, fctx, &callee, kind);
                    }
                }
                gen_.load_symbol(&Symbol::Def(d))
            }
            // variables (including module import slots) load through their
            // storage route; member selection continues in the designator
            // loop
            sym => gen_.load_symbol(&sym),
        }
    }

    /// `module.member` via the importing module's slot.
    fn module_member(
        &mut self,
        gen_: &mut CodeGen,
        _fctx: &mut FnCtx,
        module: &Rc<crate::typesys::State>,
        member: &str,
    ) -> CompileResult<()> {
        match module.find_shallow(member) {
            Some(Symbol::Var(v)) => gen_.load_variable(&v),
            Some(Symbol::Def(d)) => gen_.load_definition(&d),
            None => Err(CompileError::UnknownIdent(member.to_string())),
        }
    }

    /// Parse `(args)` and emit the call.
    fn call_args(
        &mut self,
        gen_: &mut CodeGen,
        fctx: &mut FnCtx,
        callee: &Rc<crate::typesys::State>,
        kind: CallKind,
    ) -> CompileResult<()> {
        gen_.load_call_result_slot(callee)?;
        self.expect(Tok::LParen, "'('")?;
        let args = callee.args();
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                self.expect(Tok::Comma, "','")?;
            }
            self.expression(gen_, fctx, Some(&arg.ty))?;
        }
        self.expect(Tok::RParen, "')'")?;
        gen_.call(callee, kind)
    }

    /// `[...]`: the empty (null) container, a dictionary when the first
    /// element is `key: value`, a byte set when it is a range, otherwise
    /// a vector.
    fn bracket_ctor(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        if self.accept(Tok::RBracket)? {
            return gen_.load_const(&gen_.qb().null_cont(), &Variant::Void);
        }
        self.or_level(gen_, fctx)?;
        if self.accept(Tok::Colon)? {
            // dictionary constructor
            self.or_level(gen_, fctx)?;
            gen_.pair_to_dict()?;
            while self.accept(Tok::Comma)? {
                self.or_level(gen_, fctx)?;
                gen_.check_dict_key()?;
                self.expect(Tok::Colon, "':'")?;
                self.or_level(gen_, fctx)?;
                gen_.dict_add_pair()?;
            }
        } else if self.accept(Tok::DotDot)? {
            // byte set constructor
            self.or_level(gen_, fctx)?;
            gen_.range_to_set()?;
            self.set_ctor_tail(gen_, fctx)?;
        } else {
            // vector constructor
            gen_.elem_to_vec(None)?;
            while self.accept(Tok::Comma)? {
                self.or_level(gen_, fctx)?;
                gen_.elem_cat()?;
            }
        }
        self.expect(Tok::RBracket, "']'")
    }

    /// `{...}` set constructor.
    fn set_ctor(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        if self.accept(Tok::RBrace)? {
            return gen_.load_const(&gen_.qb().null_cont(), &Variant::Void);
        }
        self.or_level(gen_, fctx)?;
        if self.accept(Tok::DotDot)? {
            self.or_level(gen_, fctx)?;
            gen_.range_to_set()?;
        } else {
            gen_.elem_to_set()?;
        }
        self.set_ctor_tail(gen_, fctx)?;
        self.expect(Tok::RBrace, "'}'")
    }

    fn set_ctor_tail(&mut self, gen_: &mut CodeGen, fctx: &mut FnCtx) -> CompileResult<()> {
        while self.accept(Tok::Comma)? {
            self.or_level(gen_, fctx)?;
            if self.tok == Tok::DotDot {
                gen_.check_range_left()?;
                self.next()?;
                self.or_level(gen_, fctx)?;
                gen_.set_add_range()?;
            } else {
                gen_.set_add_elem()?;
            }
        }
        Ok(())
    }

    /// A type expression, evaluated with a compile-time generator:
    /// `int`, `str[]`, `int[char]`, `0..10`, `red..blue`.
    pub(crate) fn parse_type_expr(&mut self, fctx: &mut FnCtx) -> CompileResult<TypeRef> {
        let mut cgen = CodeGen::const_expr(&fctx.state, &self.module, self.qb.clone());
        self.or_level(&mut cgen, fctx)?;
        if self.accept(Tok::DotDot)? {
            self.or_level(&mut cgen, fctx)?;
            cgen.create_subrange_type()?;
        }
        if let Some(ty) = cgen.try_undo_type_ref()? {
            return Ok(ty);
        }
        if cgen.stk_top()?.is_type_ref() {
            let (_, value) = cgen.finish_const_expr(None)?;
            return type_from_value(&value);
        }
        Err(CompileError::Type("Type expected".into()))
    }
}
