//! Expression operations: containers, membership, arithmetic, comparison,
//! and the diagnostics/output statements.

use super::CodeGen;
use crate::codeseg::{is_cmp_op, Op};
use crate::error::{CompileError, CompileResult};
use crate::typesys::{TypeRef, TypeRefExt};
use shannon_runtime::Str;

impl CodeGen {
    // --- references

    /// Dereference if the top value is a reference; true when one was.
    pub fn deref(&mut self) -> CompileResult<bool> {
        let ty = self.stk_top()?.clone();
        if let Some(target) = ty.ref_target() {
            if !target.is_derefable() {
                return Err(CompileError::Type("Can't dereference this type".into()));
            }
            let target = target.clone();
            self.stk_pop()?;
            self.emit_push(target, Op::Deref);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn mk_ref(&mut self) -> CompileResult<()> {
        let ty = self.stk_top()?.clone();
        if ty.is_reference() {
            return Ok(());
        }
        let offs = self.stk_top_item()?.offs;
        if self.codeseg.op_at(offs) == Op::Deref {
            return Err(CompileError::Type("Superfluous automatic dereference".into()));
        }
        if !ty.is_derefable() {
            return Err(CompileError::Type("Can't convert to reference".into()));
        }
        self.stk_pop()?;
        let ref_type = self.type_reg.register_unique(crate::typesys::Type::new_ref(ty));
        self.emit_push(ref_type, Op::MkRef);
        Ok(())
    }

    /// Coerce the top value to bool by emptiness when it isn't one.
    pub fn non_empty(&mut self) -> CompileResult<()> {
        let ty = self.stk_top()?.clone();
        if !ty.is_bool() {
            self.stk_pop()?;
            self.emit_push(self.qb.bool_(), Op::NonEmpty);
        }
        Ok(())
    }

    // --- vectors and strings

    /// Wrap the top element into a one-element vector; the target vector
    /// type is derived from the element when not dictated by context.
    pub fn elem_to_vec(&mut self, vec_type: Option<TypeRef>) -> CompileResult<TypeRef> {
        let elem_type = self.stk_top()?.clone();
        let vec_type = match vec_type {
            Some(v) => {
                if !v.is_any_vec() {
                    return Err(CompileError::Type("Vector type expected".into()));
                }
                let elem = v
                    .cont_elem()
                    .cloned()
                    .ok_or_else(|| CompileError::internal(0x6007, "vector without element type"))?;
                self.implicit_cast(&elem, "Vector/string element type mismatch")?;
                v
            }
            None => elem_type.derive_vec(&self.qb, &self.type_reg),
        };
        self.stk_pop()?;
        let op = if vec_type.is_byte_vec() { Op::ChrToStr } else { Op::VarToVec };
        self.emit_push(vec_type.clone(), op);
        Ok(vec_type)
    }

    /// Append an element to the vector beneath it.
    pub fn elem_cat(&mut self) -> CompileResult<()> {
        let vec_type = self.stk_top_at(2)?.clone();
        if !vec_type.is_any_vec() {
            return Err(CompileError::Type("Vector/string type expected".into()));
        }
        let elem = vec_type
            .cont_elem()
            .cloned()
            .ok_or_else(|| CompileError::internal(0x6007, "vector without element type"))?;
        self.implicit_cast(&elem, "Vector/string element type mismatch")?;
        self.stk_pop()?;
        self.emit(if vec_type.is_byte_vec() { Op::ChrCat } else { Op::VarCat });
        Ok(())
    }

    /// Concatenate two vectors of the same type.
    pub fn cat(&mut self) -> CompileResult<()> {
        let vec_type = self.stk_top_at(2)?.clone();
        if !vec_type.is_any_vec() {
            return Err(CompileError::Type("Left operand is not a vector".into()));
        }
        self.implicit_cast(&vec_type, "Vector/string types do not match")?;
        self.stk_pop()?;
        self.emit(if vec_type.is_byte_vec() { Op::StrCat } else { Op::VecCat });
        Ok(())
    }

    /// `[]` selection on vectors and dictionaries.
    pub fn load_container_elem(&mut self) -> CompileResult<()> {
        let cont_type = self.stk_top_at(2)?.clone();
        let op = if cont_type.is_any_vec() {
            self.implicit_cast(&self.qb.int(), "Vector index must be integer")?;
            if cont_type.is_byte_vec() { Op::StrElem } else { Op::VecElem }
        } else if cont_type.is_any_dict() {
            let index = cont_type
                .cont_index()
                .cloned()
                .ok_or_else(|| CompileError::internal(0x6007, "dict without index type"))?;
            self.implicit_cast(&index, "Dictionary key type mismatch")?;
            if cont_type.is_byte_dict() { Op::ByteDictElem } else { Op::DictElem }
        } else {
            return Err(CompileError::Type("Vector or dictionary expected".into()));
        };
        let elem = if cont_type.is_byte_vec() {
            self.qb.char_()
        } else {
            cont_type
                .cont_elem()
                .cloned()
                .ok_or_else(|| CompileError::internal(0x6007, "container without element type"))?
        };
        self.stk_pop()?;
        self.stk_pop()?;
        self.emit_push(elem, op);
        Ok(())
    }

    /// `[l..r]` slicing; a void right bound means "to the end".
    pub fn load_subvec(&mut self) -> CompileResult<()> {
        let cont_type = self.stk_top_at(3)?.clone();
        let left = self.stk_top_at(2)?.clone();
        let right = self.stk_top()?.clone();
        if !right.is_void() {
            self.implicit_cast(&left, "Incompatible slice bounds")?;
        }
        if !cont_type.is_any_vec() {
            return Err(CompileError::Type("Vector/string type expected".into()));
        }
        if !left.is_any_ord() {
            return Err(CompileError::Type("Non-ordinal slice bounds".into()));
        }
        self.stk_pop()?;
        self.stk_pop()?;
        self.stk_pop()?;
        let op = if cont_type.is_byte_vec() { Op::Substr } else { Op::Subvec };
        self.emit_push(cont_type, op);
        Ok(())
    }

    /// `#` length. Folds to a constant for null containers and byte sets.
    pub fn length(&mut self) -> CompileResult<()> {
        let ty = self.stk_top()?.clone();
        if ty.is_null_cont() {
            self.undo_last_load()?;
            return self.load_const(&self.qb.int(), &shannon_runtime::Variant::Ord(0));
        }
        if ty.is_byte_set() {
            // the key universe is fixed, so the loop bound is static
            let (l, r) = ty
                .cont_index()
                .and_then(|i| i.ord_bounds())
                .ok_or_else(|| CompileError::internal(0x6007, "byte set without index bounds"))?;
            self.undo_last_load()?;
            return self.load_const(&self.qb.int(), &shannon_runtime::Variant::Ord(r - l + 1));
        }
        let op = if ty.is_any_set() {
            Op::SetLen
        } else if ty.is_byte_vec() {
            Op::StrLen
        } else if ty.is_any_vec() || ty.is_byte_dict() {
            Op::VecLen
        } else if ty.is_any_dict() {
            Op::DictLen
        } else {
            return Err(CompileError::Type("'#' expects a container".into()));
        };
        self.stk_pop()?;
        self.emit_push(self.qb.int(), op);
        Ok(())
    }

    // --- sets

    pub fn elem_to_set(&mut self) -> CompileResult<TypeRef> {
        let elem_type = self.stk_top()?.clone();
        let set_type = elem_type.derive_set(&self.qb, &self.type_reg);
        self.stk_pop()?;
        let op = if set_type.is_byte_set() { Op::ElemToByteSet } else { Op::ElemToSet };
        self.emit_push(set_type.clone(), op);
        Ok(set_type)
    }

    /// `[a..b]` in a set constructor; only byte sets can hold ranges.
    pub fn range_to_set(&mut self) -> CompileResult<TypeRef> {
        let left = self.stk_top_at(2)?.clone();
        if !left.is_any_ord() {
            return Err(CompileError::Type("Non-ordinal range bounds".into()));
        }
        let right = self.stk_top()?.clone();
        if !left.can_assign_to(&right) {
            return Err(CompileError::Type("Incompatible range bounds".into()));
        }
        let set_type = left.derive_set(&self.qb, &self.type_reg);
        if !set_type.is_byte_set() {
            return Err(CompileError::Type("Invalid element type for ordinal set".into()));
        }
        self.stk_pop()?;
        self.stk_pop()?;
        self.emit_push(set_type.clone(), Op::RngToByteSet);
        Ok(set_type)
    }

    pub fn set_add_elem(&mut self) -> CompileResult<()> {
        let set_type = self.stk_top_at(2)?.clone();
        if !set_type.is_any_set() {
            return Err(CompileError::Type("Set type expected".into()));
        }
        let index = set_type
            .cont_index()
            .cloned()
            .ok_or_else(|| CompileError::internal(0x6007, "set without index type"))?;
        self.implicit_cast(&index, "Set element type mismatch")?;
        self.stk_pop()?;
        self.emit(if set_type.is_byte_set() { Op::ByteSetAddElem } else { Op::SetAddElem });
        Ok(())
    }

    /// Called with the left bound of a range element on the stack.
    pub fn check_range_left(&mut self) -> CompileResult<()> {
        let set_type = self.stk_top_at(2)?.clone();
        if !set_type.is_byte_set() {
            return Err(CompileError::Type("Byte set type expected".into()));
        }
        let index = set_type
            .cont_index()
            .cloned()
            .ok_or_else(|| CompileError::internal(0x6007, "set without index type"))?;
        self.implicit_cast(&index, "Set element type mismatch")
    }

    pub fn set_add_range(&mut self) -> CompileResult<()> {
        let set_type = self.stk_top_at(3)?.clone();
        if !set_type.is_byte_set() {
            return Err(CompileError::Type("Byte set type expected".into()));
        }
        let index = set_type
            .cont_index()
            .cloned()
            .ok_or_else(|| CompileError::internal(0x6007, "set without index type"))?;
        self.implicit_cast(&index, "Set element type mismatch")?;
        self.stk_pop()?;
        self.stk_pop()?;
        self.emit(Op::ByteSetAddRng);
        Ok(())
    }

    // --- dictionaries

    /// First `key: value` pair of a dictionary constructor; derives the
    /// dictionary type from the pair.
    pub fn pair_to_dict(&mut self) -> CompileResult<TypeRef> {
        let val = self.stk_top()?.clone();
        let key = self.stk_top_at(2)?.clone();
        let dict_type = val.derive_container(&key, &self.type_reg);
        self.stk_pop()?;
        self.stk_pop()?;
        let op = if dict_type.is_byte_dict() { Op::PairToByteDict } else { Op::PairToDict };
        self.emit_push(dict_type.clone(), op);
        Ok(dict_type)
    }

    pub fn check_dict_key(&mut self) -> CompileResult<()> {
        let dict_type = self.stk_top_at(2)?.clone();
        if !dict_type.is_any_dict() {
            return Err(CompileError::Type("Dictionary type expected".into()));
        }
        let index = dict_type
            .cont_index()
            .cloned()
            .ok_or_else(|| CompileError::internal(0x6007, "dict without index type"))?;
        self.implicit_cast(&index, "Dictionary key type mismatch")
    }

    pub fn dict_add_pair(&mut self) -> CompileResult<()> {
        let dict_type = self.stk_top_at(3)?.clone();
        if !dict_type.is_any_dict() {
            return Err(CompileError::Type("Dictionary type expected".into()));
        }
        let elem = dict_type
            .cont_elem()
            .cloned()
            .ok_or_else(|| CompileError::internal(0x6007, "dict without element type"))?;
        self.implicit_cast(&elem, "Dictionary element type mismatch")?;
        self.stk_pop()?;
        self.stk_pop()?;
        self.emit(if dict_type.is_byte_dict() { Op::ByteDictAddPair } else { Op::DictAddPair });
        Ok(())
    }

    // --- membership

    /// `in` with a set, dictionary or range value on the right.
    pub fn in_cont(&mut self) -> CompileResult<()> {
        let cont_type = self.stk_pop()?.ty;
        let elem_type = self.stk_pop()?.ty;
        let (op, key_type) = if cont_type.is_any_set() {
            let op = if cont_type.is_byte_set() { Op::InByteSet } else { Op::InSet };
            (op, cont_type.cont_index().cloned())
        } else if cont_type.is_any_dict() {
            let op = if cont_type.is_byte_dict() { Op::InByteDict } else { Op::InDict };
            (op, cont_type.cont_index().cloned())
        } else if cont_type.is_range() {
            (Op::RangeHas, cont_type.range_base().cloned())
        } else {
            return Err(CompileError::Type("Set, dictionary or range expected".into()));
        };
        if let Some(key_type) = key_type {
            if !elem_type.can_assign_to(&key_type) {
                return Err(CompileError::Type("Key type mismatch".into()));
            }
        }
        self.emit_push(self.qb.bool_(), op);
        Ok(())
    }

    /// `x in T` where T is an ordinal type reference: a bounds test.
    pub fn in_bounds(&mut self, bounds_type: &TypeRef) -> CompileResult<()> {
        if !bounds_type.is_any_ord() {
            return Err(CompileError::Type("Ordinal type reference expected".into()));
        }
        let elem_type = self.stk_pop()?.ty;
        if !elem_type.is_any_ord() {
            return Err(CompileError::Type("Ordinal type expected".into()));
        }
        let idx = self.codeseg.add_type(bounds_type);
        self.emit_push(self.qb.bool_(), Op::InBounds);
        self.codeseg.append_u16(idx);
        Ok(())
    }

    /// `x in a..b` with the bounds inline on the stack.
    pub fn in_range(&mut self) -> CompileResult<()> {
        let right = self.stk_pop()?.ty;
        let left = self.stk_pop()?.ty;
        let elem = self.stk_pop()?.ty;
        if !left.can_assign_to(&right) {
            return Err(CompileError::Type("Incompatible range bounds".into()));
        }
        if !elem.can_assign_to(&left) {
            return Err(CompileError::Type("Element type mismatch".into()));
        }
        if !elem.is_any_ord() || !left.is_any_ord() || !right.is_any_ord() {
            return Err(CompileError::Type("Ordinal type expected".into()));
        }
        self.emit_push(self.qb.bool_(), Op::InRange);
        Ok(())
    }

    /// Case label `a..b`: like `in_range` but keeps the case value.
    pub fn case_range(&mut self) -> CompileResult<()> {
        let right = self.stk_pop()?.ty;
        let left = self.stk_pop()?.ty;
        let elem = self.stk_top()?.clone();
        if !elem.is_any_ord() || !left.is_any_ord() || !right.is_any_ord() {
            return Err(CompileError::Type("Ordinal type expected".into()));
        }
        self.emit_push(self.qb.bool_(), Op::CaseRange);
        Ok(())
    }

    // --- ranges and subranges

    /// `l..r` as a runtime range value.
    pub fn mk_range(&mut self) -> CompileResult<()> {
        let right = self.stk_top()?.clone();
        let left = self.stk_top_at(2)?.clone();
        if !left.is_any_ord() || !right.is_any_ord() {
            return Err(CompileError::Type("Non-ordinal range bounds".into()));
        }
        if !left.can_assign_to(&right) {
            return Err(CompileError::Type("Incompatible range bounds".into()));
        }
        let range_type = left.derive_range(&self.type_reg)?;
        self.stk_pop()?;
        self.stk_pop()?;
        self.emit_push(range_type, Op::MkRange);
        Ok(())
    }

    /// `l..r` as a subrange type; compile-time only, the mini-run of the
    /// VM produces the derived type descriptor.
    pub fn create_subrange_type(&mut self) -> CompileResult<()> {
        if !self.is_compile_time() {
            return Err(CompileError::Type(
                "Deriving a subrange type is not allowed at run time".into(),
            ));
        }
        let left = self.stk_top_at(2)?.clone();
        if !left.is_any_ord() {
            return Err(CompileError::Type("Non-ordinal range bounds".into()));
        }
        self.implicit_cast(&left, "Incompatible subrange bounds")?;
        self.stk_pop()?;
        self.stk_pop()?;
        let type_idx = self.codeseg.add_type(&left);
        let state_idx = self.codeseg.add_state(&self.type_reg.clone());
        self.emit_push(self.qb.type_ref(), Op::MkSubrange);
        self.codeseg.append_u16(type_idx);
        self.codeseg.append_u16(state_idx);
        Ok(())
    }

    // --- arithmetic

    /// Binary integer arithmetic. The result keeps the operand type when
    /// both sides agree, otherwise falls back to the default int.
    pub fn arithm_binary(&mut self, op: Op) -> CompileResult<()> {
        debug_assert!((Op::Add..=Op::BitShr).contains(&op));
        let right = self.stk_pop()?.ty;
        let left = self.stk_pop()?.ty;
        if !right.is_int() || !left.is_int() {
            return Err(CompileError::Type(
                "Operand types do not match binary operator".into(),
            ));
        }
        let result = if left.identical_to(&right) { left } else { self.qb.int() };
        self.emit_push(result, op);
        Ok(())
    }

    pub fn arithm_unary(&mut self, op: Op) -> CompileResult<()> {
        debug_assert!(matches!(op, Op::Neg | Op::BitNot));
        let ty = self.stk_top()?.clone();
        if !ty.is_int() {
            return Err(CompileError::Type(
                "Operand type doesn't match unary operator".into(),
            ));
        }
        self.emit(op);
        Ok(())
    }

    /// `not`: bitwise on integers, logical otherwise.
    pub fn not(&mut self) -> CompileResult<()> {
        let ty = self.stk_top()?.clone();
        if ty.is_int() {
            self.emit(Op::BitNot);
        } else {
            self.implicit_cast(&self.qb.bool_(), "Boolean or integer operand expected")?;
            self.emit(Op::Not);
        }
        Ok(())
    }

    /// `xor`: boolean on booleans, bitwise on integers.
    pub fn bool_xor(&mut self) -> CompileResult<()> {
        let right = self.stk_pop()?.ty;
        let left = self.stk_pop()?.ty;
        if left.is_bool() && right.is_bool() {
            self.emit_push(self.qb.bool_(), Op::BitXor);
        } else if left.is_int() && right.is_int() {
            self.emit_push(self.qb.int(), Op::BitXor);
        } else {
            return Err(CompileError::Type("Operand types do not match 'xor'".into()));
        }
        Ok(())
    }

    // --- comparison

    /// Comparison: emit the kind-specific compare, then the token-aligned
    /// relational op over its `{-1,0,1}` result.
    pub fn cmp(&mut self, op: Op) -> CompileResult<()> {
        debug_assert!(is_cmp_op(op));
        let left = self.stk_top_at(2)?.clone();
        self.implicit_cast(&left, "Type mismatch in comparison")?;
        let right = self.stk_top()?.clone();
        if left.is_any_ord() && right.is_any_ord() {
            self.emit(Op::CmpOrd);
        } else if left.is_byte_vec() && right.is_byte_vec() {
            self.emit(Op::CmpStr);
        } else {
            if op != Op::Equal && op != Op::NotEq {
                return Err(CompileError::Type(
                    "Only equality can be tested for this type".into(),
                ));
            }
            self.emit(Op::CmpVar);
        }
        self.stk_pop()?;
        self.stk_pop()?;
        self.emit_push(self.qb.bool_(), op);
        Ok(())
    }

    /// Case label comparison; keeps the case value beneath the result.
    pub fn case_cmp(&mut self) -> CompileResult<()> {
        let left = self.stk_top_at(2)?.clone();
        self.implicit_cast(&left, "Type mismatch in comparison")?;
        let right = self.stk_pop()?.ty;
        let op = if left.is_any_ord() && right.is_any_ord() {
            Op::CaseOrd
        } else if left.is_byte_vec() && right.is_byte_vec() {
            Op::CaseStr
        } else {
            Op::CaseVar
        };
        self.emit_push(self.qb.bool_(), op);
        Ok(())
    }

    // --- statements

    /// `echo` one value, typed so enums print their names and strings
    /// print raw.
    pub fn echo(&mut self) -> CompileResult<()> {
        let ty = self.stk_pop()?.ty;
        let idx = self.codeseg.add_type(&ty);
        self.emit(Op::Echo);
        self.codeseg.append_u16(idx);
        Ok(())
    }

    pub fn echo_sep(&mut self) {
        self.emit(Op::EchoSep);
    }

    pub fn echo_ln(&mut self) {
        self.emit(Op::EchoLn);
    }

    pub fn assertion(&mut self, cond: &str, file: &str, line: u32) -> CompileResult<()> {
        self.implicit_cast(&self.qb.bool_(), "Boolean expression expected for 'assert'")?;
        self.stk_pop()?;
        let cond_idx = self.codeseg.add_string(Str::from(cond));
        let file_idx = self.codeseg.add_string(Str::from(file));
        self.emit(Op::Assert);
        self.codeseg.append_u16(cond_idx);
        self.codeseg.append_u16(file_idx);
        self.codeseg.append_u32(line);
        Ok(())
    }

    pub fn dump_var(&mut self, expr: &str) -> CompileResult<()> {
        let ty = self.stk_pop()?.ty;
        let expr_idx = self.codeseg.add_string(Str::from(expr));
        let type_idx = self.codeseg.add_type(&ty);
        self.emit(Op::Dump);
        self.codeseg.append_u16(expr_idx);
        self.codeseg.append_u16(type_idx);
        Ok(())
    }

    pub fn line_num(&mut self, line: u32) {
        self.emit(Op::LineNum);
        self.codeseg.append_u32(line);
    }

    /// `exit`: the program result was already stored; raise the clean
    /// termination signal.
    pub fn program_exit(&mut self) {
        self.emit(Op::Exit);
    }
}
