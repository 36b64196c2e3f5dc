//! The bytecode interpreter.
//!
//! One reentrant procedure over a closed code segment: a dense match on the
//! opcode byte, inline fixed-size immediate reads, and a value stack with a
//! frame base pointer. Locals live at non-negative offsets from `bp`,
//! arguments at negative offsets, the result slot below the arguments.
//!
//! The interpreter holds no global state: the code generator runs it on
//! scratch segments for constant folding (with no self context at all),
//! and the execution context runs module init code on shared instances.
//! On any error the frame's portion of the stack is unwound before the
//! error propagates, leaving the caller's top at `bp - 1`.

use crate::codeseg::{CodeSeg, Op};
use crate::typesys::{State, StateExt, TypeRefExt};
use shannon_runtime::{
    OrdSet, RtStack, RuntimeError, RuntimeResult, StateObj, Str, VarDict, VarRange, VarRef,
    VarSet, VarVec, Variant, VariantKind,
};
use std::io::Write;
use std::rc::Rc;

/// Run a code segment. `selfvars` doubles as the data segment: module init
/// code and constant folding both enter here.
pub fn run(
    out: &mut dyn Write,
    selfvars: Option<&Rc<StateObj>>,
    stack: &mut RtStack,
    seg: &CodeSeg,
) -> RuntimeResult<()> {
    exec(out, selfvars.cloned(), None, selfvars.cloned(), stack, seg)
}

fn exec(
    out: &mut dyn Write,
    selfvars: Option<Rc<StateObj>>,
    outer: Option<Rc<StateObj>>,
    dataseg: Option<Rc<StateObj>>,
    stack: &mut RtStack,
    seg: &CodeSeg,
) -> RuntimeResult<()> {
    let bp = stack.len();
    let mut frame = Frame { selfvars, outer, dataseg };
    match run_loop(out, &mut frame, stack, seg, bp) {
        Ok(()) => Ok(()),
        Err(e) => {
            stack.truncate(bp);
            Err(e)
        }
    }
}

struct Frame {
    selfvars: Option<Rc<StateObj>>,
    outer: Option<Rc<StateObj>>,
    dataseg: Option<Rc<StateObj>>,
}

fn no_context() -> RuntimeError {
    RuntimeError::Other("No self context in this frame".into())
}

fn as_state_obj(v: &Variant) -> RuntimeResult<Rc<StateObj>> {
    let obj = v.as_rtobj()?.clone();
    obj.into_any()
        .downcast::<StateObj>()
        .map_err(|_| RuntimeError::KindMismatch { expected: "state object", found: "object" })
}

/// Write through the (object, location) pair pushed by a LEA op. The pair
/// sits beneath whatever the caller already popped.
fn lea_store(
    stack: &mut RtStack,
    f: impl FnOnce(&mut Variant) -> RuntimeResult<()>,
) -> RuntimeResult<()> {
    let slot = stack.pop()?;
    let obj = stack.pop()?;
    match obj {
        Variant::RtObj(o) => {
            let state = o
                .into_any()
                .downcast::<StateObj>()
                .map_err(|_| RuntimeError::KindMismatch { expected: "state object", found: "object" })?;
            state.with_var_mut(slot.as_ord()? as usize, f)?
        }
        Variant::Ref(r) => f(&mut r.0.borrow_mut()),
        // a stack slot: the location is an absolute index
        Variant::Void => f(stack.at_mut(slot.as_ord()? as usize)?),
        other => Err(RuntimeError::KindMismatch {
            expected: "storage object",
            found: other.kind().name(),
        }),
    }
}

fn binary_ord(stack: &mut RtStack, f: impl FnOnce(i64, i64) -> RuntimeResult<i64>) -> RuntimeResult<()> {
    let b = stack.pop()?.as_ord()?;
    let a = stack.top_mut()?.as_ord_mut()?;
    *a = f(*a, b)?;
    Ok(())
}

fn arith(op: Op, a: i64, b: i64) -> RuntimeResult<i64> {
    Ok(match op {
        Op::Add | Op::AddAssign => a.wrapping_add(b),
        Op::Sub | Op::SubAssign => a.wrapping_sub(b),
        Op::Mul | Op::MulAssign => a.wrapping_mul(b),
        Op::Div | Op::DivAssign => {
            if b == 0 {
                return Err(RuntimeError::DivByZero);
            }
            a.wrapping_div(b)
        }
        Op::Mod | Op::ModAssign => {
            if b == 0 {
                return Err(RuntimeError::DivByZero);
            }
            a.wrapping_rem(b)
        }
        Op::BitAnd => a & b,
        Op::BitOr => a | b,
        Op::BitXor => a ^ b,
        Op::BitShl => {
            if (0..64).contains(&b) { a.wrapping_shl(b as u32) } else { 0 }
        }
        Op::BitShr => {
            if (0..64).contains(&b) { a.wrapping_shr(b as u32) } else { a >> 63 }
        }
        _ => unreachable!("not an arithmetic opcode"),
    })
}

/// Exclusive-right slice bound; a void right means "to the end".
fn slice_count(left: i64, right: &Variant) -> RuntimeResult<Option<i64>> {
    match right {
        Variant::Void => Ok(None),
        other => Ok(Some((other.as_ord()? - left).max(0))),
    }
}

fn run_loop(
    out: &mut dyn Write,
    frame: &mut Frame,
    stack: &mut RtStack,
    seg: &CodeSeg,
    bp: usize,
) -> RuntimeResult<()> {
    let mut ip = 0usize;

    loop {
        let op = Op::from_u8(seg.u8_at(ip)).ok_or(RuntimeError::InvalidOpcode(seg.u8_at(ip)))?;
        ip += 1;
        match op {
            // --- 1. misc control
            Op::End => return Ok(()),
            Op::Nop => {}
            Op::Exit => return Err(RuntimeError::Exit),

            // --- 2. const loaders
            Op::LoadTypeRef => {
                let t = seg.type_at(seg.u16_at(ip)).clone();
                ip += 2;
                stack.push(Variant::RtObj(t));
            }
            Op::LoadNull => stack.push(Variant::Void),
            Op::Load0 => stack.push(Variant::Ord(0)),
            Op::Load1 => stack.push(Variant::Ord(1)),
            Op::LoadByte => {
                let b = seg.u8_at(ip);
                ip += 1;
                stack.push(Variant::Ord(b as i64));
            }
            Op::LoadOrd => {
                let v = seg.i64_at(ip);
                ip += 8;
                stack.push(Variant::Ord(v));
            }
            Op::LoadStr => {
                let s = seg.string_at(seg.u16_at(ip)).clone();
                ip += 2;
                stack.push(Variant::Str(s));
            }
            Op::LoadEmptyVar => {
                let kind = VariantKind::from_u8(seg.u8_at(ip))?;
                ip += 1;
                stack.push(Variant::empty_of(kind));
            }
            Op::LoadConst => {
                let def = seg.def_at(seg.u16_at(ip)).clone();
                ip += 2;
                stack.push(def.value.clone());
            }
            Op::ConstExprErr => return Err(RuntimeError::ConstExprVar),

            // --- 3. designator loaders
            Op::LoadSelfVar => {
                let id = seg.u8_at(ip) as usize;
                ip += 1;
                let obj = frame.selfvars.as_ref().ok_or_else(no_context)?;
                stack.push(obj.var(id)?);
            }
            Op::LoadOuterVar => {
                let id = seg.u8_at(ip) as usize;
                ip += 1;
                let obj = frame.outer.as_ref().ok_or_else(no_context)?;
                stack.push(obj.var(id)?);
            }
            Op::LoadStkVar => {
                let offs = seg.i8_at(ip) as i64;
                ip += 1;
                let v = stack.at(RtStack::index(bp, offs))?.clone();
                stack.push(v);
            }
            Op::LoadDataSeg => {
                let obj = frame.dataseg.clone().ok_or_else(no_context)?;
                stack.push(Variant::RtObj(obj));
            }
            Op::LoadSelfObj => {
                let obj = frame.selfvars.clone().ok_or_else(no_context)?;
                stack.push(Variant::RtObj(obj));
            }
            Op::LoadMember => {
                let id = seg.u8_at(ip) as usize;
                ip += 1;
                let top = stack.top_mut()?;
                let obj = as_state_obj(top)?;
                *top = obj.var(id)?;
            }
            Op::Deref => {
                let top = stack.top_mut()?;
                let v = top.as_ref_cell()?.get();
                *top = v;
            }
            Op::StrElem => {
                let i = stack.pop()?.as_ord()?;
                let top = stack.top_mut()?;
                let b = top.as_str()?.at(i)?;
                *top = Variant::Ord(b as i64);
            }
            Op::VecElem => {
                let i = stack.pop()?.as_ord()?;
                let top = stack.top_mut()?;
                let v = top.as_vec()?.at(i)?;
                *top = v;
            }
            Op::DictElem => {
                let key = stack.pop()?;
                let top = stack.top_mut()?;
                let v = top
                    .as_dict()?
                    .find(&key)
                    .ok_or_else(|| RuntimeError::Key(key.to_string()))?;
                *top = v;
            }
            Op::ByteDictElem => {
                let key = stack.pop()?.as_ord()?;
                let top = stack.top_mut()?;
                let v = top.as_vec()?.sparse_get(key)?;
                *top = v;
            }

            // --- 4. storers
            Op::InitSelfVar | Op::StoreSelfVar => {
                let id = seg.u8_at(ip) as usize;
                ip += 1;
                let v = stack.pop()?;
                frame.selfvars.as_ref().ok_or_else(no_context)?.set_var(id, v)?;
            }
            Op::StoreOuterVar => {
                let id = seg.u8_at(ip) as usize;
                ip += 1;
                let v = stack.pop()?;
                frame.outer.as_ref().ok_or_else(no_context)?.set_var(id, v)?;
            }
            Op::InitStkVar | Op::StoreStkVar => {
                let offs = seg.i8_at(ip) as i64;
                ip += 1;
                let v = stack.pop()?;
                *stack.at_mut(RtStack::index(bp, offs))? = v;
            }
            Op::StoreMember => {
                let id = seg.u8_at(ip) as usize;
                ip += 1;
                let v = stack.pop()?;
                let obj = as_state_obj(&stack.pop()?)?;
                obj.set_var(id, v)?;
            }
            Op::StoreRef => {
                let v = stack.pop()?;
                let r = stack.pop()?;
                r.as_ref_cell()?.set(v);
            }
            Op::StoreStrElem => {
                let v = stack.pop()?.as_byte()?;
                let i = stack.pop()?.as_ord()?;
                lea_store(stack, |cell| cell.as_str_mut()?.put(i, v))?;
            }
            Op::StoreVecElem => {
                let v = stack.pop()?;
                let i = stack.pop()?.as_ord()?;
                lea_store(stack, |cell| cell.as_vec_mut()?.put(i, v))?;
            }
            Op::StoreDictElem => {
                let v = stack.pop()?;
                let key = stack.pop()?;
                lea_store(stack, |cell| {
                    cell.as_dict_mut()?.find_replace(key, v);
                    Ok(())
                })?;
            }
            Op::StoreByteDictElem => {
                let v = stack.pop()?;
                let key = stack.pop()?.as_ord()?;
                lea_store(stack, |cell| cell.as_vec_mut()?.sparse_put(key, v))?;
            }

            // --- 5. LEA variants
            Op::LeaSelfVar => {
                let id = seg.u8_at(ip) as i64;
                ip += 1;
                let obj = frame.selfvars.clone().ok_or_else(no_context)?;
                stack.push(Variant::RtObj(obj));
                stack.push(Variant::Ord(id));
            }
            Op::LeaOuterVar => {
                let id = seg.u8_at(ip) as i64;
                ip += 1;
                let obj = frame.outer.clone().ok_or_else(no_context)?;
                stack.push(Variant::RtObj(obj));
                stack.push(Variant::Ord(id));
            }
            Op::LeaStkVar => {
                let offs = seg.i8_at(ip) as i64;
                ip += 1;
                stack.push(Variant::Void);
                stack.push(Variant::Ord(RtStack::index(bp, offs) as i64));
            }
            Op::LeaMember => {
                let id = seg.u8_at(ip) as i64;
                ip += 1;
                // the state object stays as the LEA object
                stack.push(Variant::Ord(id));
            }
            Op::LeaRef => {
                // the reference itself is the LEA object
                stack.push(Variant::Ord(0));
            }

            // --- 6. designator misc
            Op::MkSubrange => {
                let base = seg.type_at(seg.u16_at(ip)).clone();
                let owner = seg.state_at(seg.u16_at(ip + 2)).clone();
                ip += 4;
                let right = stack.pop()?.as_ord()?;
                let left = stack.pop()?.as_ord()?;
                let t = base
                    .create_subrange(left, right, &owner)
                    .map_err(|e| RuntimeError::Other(e.to_string()))?;
                stack.push(Variant::RtObj(t));
            }
            Op::MkRange => {
                let right = stack.pop()?.as_ord()?;
                let left = stack.pop()?.as_ord()?;
                stack.push(Variant::Range(VarRange::new(left, right)));
            }
            Op::MkRef => {
                let v = stack.pop()?;
                stack.push(Variant::Ref(VarRef::new(v)));
            }
            Op::NonEmpty => {
                let top = stack.top_mut()?;
                *top = Variant::Ord((!top.is_empty()) as i64);
            }
            Op::Pop => {
                stack.pop()?;
            }
            Op::Cast => {
                let t = seg.type_at(seg.u16_at(ip)).clone();
                ip += 2;
                let v = stack.pop()?;
                stack.push(t.runtime_cast(v)?);
            }
            Op::IsType => {
                let t = seg.type_at(seg.u16_at(ip)).clone();
                ip += 2;
                let v = stack.pop()?;
                stack.push(Variant::Ord(t.is_my_type(&v) as i64));
            }

            // --- 7. strings, vectors
            Op::ChrToStr => {
                let top = stack.top_mut()?;
                let b = top.as_byte()?;
                *top = Variant::Str(Str::from_char(b));
            }
            Op::ChrCat => {
                let b = stack.pop()?.as_byte()?;
                stack.top_mut()?.as_str_mut()?.push(b);
            }
            Op::StrCat => {
                let s = stack.pop()?;
                stack.top_mut()?.as_str_mut()?.append(s.as_str()?);
            }
            Op::VarToVec => {
                let top = stack.top_mut()?;
                let v = std::mem::take(top);
                *top = Variant::Vec(VarVec::from_elem(v));
            }
            Op::VarCat => {
                let v = stack.pop()?;
                stack.top_mut()?.as_vec_mut()?.push(v);
            }
            Op::VecCat => {
                let v = stack.pop()?;
                stack.top_mut()?.as_vec_mut()?.append(v.as_vec()?);
            }
            Op::StrLen => {
                let top = stack.top_mut()?;
                *top = Variant::Ord(top.as_str()?.len() as i64);
            }
            Op::VecLen => {
                let top = stack.top_mut()?;
                *top = Variant::Ord(top.as_vec()?.len() as i64);
            }
            Op::SetLen => {
                let top = stack.top_mut()?;
                *top = Variant::Ord(top.as_set()?.len() as i64);
            }
            Op::DictLen => {
                let top = stack.top_mut()?;
                *top = Variant::Ord(top.as_dict()?.len() as i64);
            }
            Op::Substr => {
                let right = stack.pop()?;
                let left = stack.pop()?.as_ord()?;
                let count = slice_count(left, &right)?;
                let top = stack.top_mut()?;
                let s = top.as_str()?.substr(left, count)?;
                *top = Variant::Str(s);
            }
            Op::Subvec => {
                let right = stack.pop()?;
                let left = stack.pop()?.as_ord()?;
                let count = slice_count(left, &right)?;
                let top = stack.top_mut()?;
                let v = top.as_vec()?.subvec(left, count)?;
                *top = Variant::Vec(v);
            }
            Op::DelStrElem => {
                let i = stack.pop()?.as_ord()?;
                lea_store(stack, |cell| cell.as_str_mut()?.erase(i))?;
            }
            Op::DelVecElem => {
                let i = stack.pop()?.as_ord()?;
                lea_store(stack, |cell| cell.as_vec_mut()?.erase(i))?;
            }
            Op::ChrCatAssign => {
                let b = stack.pop()?.as_byte()?;
                lea_store(stack, |cell| {
                    cell.as_str_mut()?.push(b);
                    Ok(())
                })?;
            }
            Op::StrCatAssign => {
                let s = stack.pop()?;
                lea_store(stack, |cell| {
                    cell.as_str_mut()?.append(s.as_str()?);
                    Ok(())
                })?;
            }
            Op::VarCatAssign => {
                let v = stack.pop()?;
                lea_store(stack, |cell| {
                    cell.as_vec_mut()?.push(v);
                    Ok(())
                })?;
            }
            Op::VecCatAssign => {
                let v = stack.pop()?;
                lea_store(stack, |cell| {
                    cell.as_vec_mut()?.append(v.as_vec()?);
                    Ok(())
                })?;
            }

            // --- 8. sets
            Op::ElemToSet => {
                let top = stack.top_mut()?;
                let v = std::mem::take(top);
                *top = Variant::Set(VarSet::from_elem(v));
            }
            Op::SetAddElem => {
                let v = stack.pop()?;
                stack.top_mut()?.as_set_mut()?.find_insert(v);
            }
            Op::ElemToByteSet => {
                let top = stack.top_mut()?;
                let k = top.as_ord()?;
                *top = Variant::OrdSet(OrdSet::from_elem(k)?);
            }
            Op::RngToByteSet => {
                let right = stack.pop()?.as_ord()?;
                let top = stack.top_mut()?;
                let left = top.as_ord()?;
                *top = Variant::OrdSet(OrdSet::from_range(left, right)?);
            }
            Op::ByteSetAddElem => {
                let k = stack.pop()?.as_ord()?;
                stack.top_mut()?.as_ordset_mut()?.insert(k)?;
            }
            Op::ByteSetAddRng => {
                let right = stack.pop()?.as_ord()?;
                let left = stack.pop()?.as_ord()?;
                stack.top_mut()?.as_ordset_mut()?.insert_range(left, right)?;
            }
            Op::InSet => {
                let cont = stack.pop()?;
                let elem = stack.pop()?;
                stack.push(Variant::Ord(cont.as_set()?.contains(&elem) as i64));
            }
            Op::InByteSet => {
                let cont = stack.pop()?;
                let elem = stack.pop()?.as_ord()?;
                stack.push(Variant::Ord(cont.as_ordset()?.has(elem) as i64));
            }

            // --- 9. dictionaries
            Op::PairToDict => {
                let v = stack.pop()?;
                let top = stack.top_mut()?;
                let key = std::mem::take(top);
                *top = Variant::Dict(VarDict::from_pair(key, v));
            }
            Op::DictAddPair => {
                let v = stack.pop()?;
                let key = stack.pop()?;
                stack.top_mut()?.as_dict_mut()?.find_replace(key, v);
            }
            Op::PairToByteDict => {
                let v = stack.pop()?;
                let top = stack.top_mut()?;
                let key = top.as_ord()?;
                let mut vec = VarVec::new();
                vec.sparse_put(key, v)?;
                *top = Variant::Vec(vec);
            }
            Op::ByteDictAddPair => {
                let v = stack.pop()?;
                let key = stack.pop()?.as_ord()?;
                stack.top_mut()?.as_vec_mut()?.sparse_put(key, v)?;
            }
            Op::InDict => {
                let cont = stack.pop()?;
                let elem = stack.pop()?;
                stack.push(Variant::Ord(cont.as_dict()?.has(&elem) as i64));
            }
            Op::InByteDict => {
                let cont = stack.pop()?;
                let elem = stack.pop()?.as_ord()?;
                stack.push(Variant::Ord(cont.as_vec()?.sparse_has(elem) as i64));
            }
            Op::DelDictElem => {
                let key = stack.pop()?;
                lea_store(stack, |cell| {
                    cell.as_dict_mut()?.remove(&key);
                    Ok(())
                })?;
            }
            Op::DelByteDictElem => {
                let key = stack.pop()?.as_ord()?;
                lea_store(stack, |cell| cell.as_vec_mut()?.sparse_remove(key))?;
            }

            // --- membership, bounds
            Op::InRange => {
                let right = stack.pop()?.as_ord()?;
                let left = stack.pop()?.as_ord()?;
                let elem = stack.pop()?.as_ord()?;
                stack.push(Variant::Ord((left <= elem && elem <= right) as i64));
            }
            Op::CaseRange => {
                let right = stack.pop()?.as_ord()?;
                let left = stack.pop()?.as_ord()?;
                let elem = stack.top()?.as_ord()?;
                stack.push(Variant::Ord((left <= elem && elem <= right) as i64));
            }
            Op::InBounds => {
                let t = seg.type_at(seg.u16_at(ip)).clone();
                ip += 2;
                let v = stack.pop()?.as_ord()?;
                let inside = t.ord_bounds().is_some_and(|(l, r)| l <= v && v <= r);
                stack.push(Variant::Ord(inside as i64));
            }
            Op::RangeHas => {
                let cont = stack.pop()?;
                let elem = stack.pop()?.as_ord()?;
                stack.push(Variant::Ord(cont.as_range()?.has(elem) as i64));
            }

            // --- 10. arithmetic
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::BitAnd
            | Op::BitOr
            | Op::BitXor
            | Op::BitShl
            | Op::BitShr => binary_ord(stack, |a, b| arith(op, a, b))?,
            Op::AddAssign | Op::SubAssign | Op::MulAssign | Op::DivAssign | Op::ModAssign => {
                let b = stack.pop()?.as_ord()?;
                lea_store(stack, |cell| {
                    let a = cell.as_ord_mut()?;
                    *a = arith(op, *a, b)?;
                    Ok(())
                })?;
            }
            Op::Neg => {
                let a = stack.top_mut()?.as_ord_mut()?;
                *a = a.wrapping_neg();
            }
            Op::BitNot => {
                let a = stack.top_mut()?.as_ord_mut()?;
                *a = !*a;
            }
            Op::Not => {
                let a = stack.top_mut()?.as_ord_mut()?;
                *a = (*a == 0) as i64;
            }

            // --- 11. comparison
            Op::CmpOrd => binary_ord(stack, |a, b| Ok(a.cmp(&b) as i64))?,
            Op::CmpStr => {
                let b = stack.pop()?;
                let top = stack.top_mut()?;
                let rel = top.as_str()?.cmp(b.as_str()?) as i64;
                *top = Variant::Ord(rel);
            }
            Op::CmpVar => {
                let b = stack.pop()?;
                let top = stack.top_mut()?;
                let rel = if *top == b { 0 } else { -1 };
                *top = Variant::Ord(rel);
            }
            Op::CaseOrd => {
                let label = stack.pop()?.as_ord()?;
                let v = stack.top()?.as_ord()?;
                stack.push(Variant::Ord((v == label) as i64));
            }
            Op::CaseStr => {
                let label = stack.pop()?;
                let eq = stack.top()?.as_str()? == label.as_str()?;
                stack.push(Variant::Ord(eq as i64));
            }
            Op::CaseVar => {
                let label = stack.pop()?;
                let eq = *stack.top()? == label;
                stack.push(Variant::Ord(eq as i64));
            }
            Op::Equal => {
                let a = stack.top_mut()?.as_ord_mut()?;
                *a = (*a == 0) as i64;
            }
            Op::NotEq => {
                let a = stack.top_mut()?.as_ord_mut()?;
                *a = (*a != 0) as i64;
            }
            Op::LessThan => {
                let a = stack.top_mut()?.as_ord_mut()?;
                *a = (*a < 0) as i64;
            }
            Op::LessEq => {
                let a = stack.top_mut()?.as_ord_mut()?;
                *a = (*a <= 0) as i64;
            }
            Op::GreaterThan => {
                let a = stack.top_mut()?.as_ord_mut()?;
                *a = (*a > 0) as i64;
            }
            Op::GreaterEq => {
                let a = stack.top_mut()?.as_ord_mut()?;
                *a = (*a >= 0) as i64;
            }

            // --- 12. jumps
            Op::Jump => {
                let rel = seg.i16_at(ip) as i64;
                ip = (ip as i64 + 2 + rel) as usize;
            }
            Op::JumpFalse => {
                let rel = seg.i16_at(ip) as i64;
                ip += 2;
                if stack.pop()?.as_ord()? == 0 {
                    ip = (ip as i64 + rel) as usize;
                }
            }
            Op::JumpTrue => {
                let rel = seg.i16_at(ip) as i64;
                ip += 2;
                if stack.pop()?.as_ord()? != 0 {
                    ip = (ip as i64 + rel) as usize;
                }
            }
            Op::JumpAnd => {
                // short-circuit: jump keeps the false value, falling
                // through consumes it
                let rel = seg.i16_at(ip) as i64;
                ip += 2;
                if stack.top()?.as_ord()? == 0 {
                    ip = (ip as i64 + rel) as usize;
                } else {
                    stack.pop()?;
                }
            }
            Op::JumpOr => {
                let rel = seg.i16_at(ip) as i64;
                ip += 2;
                if stack.top()?.as_ord()? != 0 {
                    ip = (ip as i64 + rel) as usize;
                } else {
                    stack.pop()?;
                }
            }

            // --- 13. calls
            Op::ChildCall | Op::SiblingCall | Op::MethodCall => {
                let callee = seg.state_at(seg.u16_at(ip)).clone();
                ip += 2;
                let code = callee
                    .code()
                    .ok_or_else(|| RuntimeError::Other(format!("'{}' has no code", callee.name())))?;
                let argc = callee.arg_count();
                let mut dataseg = frame.dataseg.clone();
                let outer = match op {
                    Op::ChildCall => frame.selfvars.clone(),
                    Op::SiblingCall => frame.outer.clone(),
                    _ => {
                        // receiver sits beneath the result slot and args
                        let at = stack
                            .len()
                            .checked_sub(argc + 2)
                            .ok_or_else(|| RuntimeError::Other("Malformed call frame".into()))?;
                        let receiver = as_state_obj(stack.at(at)?)?;
                        // calling into another module: its instance is the
                        // callee's data segment
                        let callee_module = callee.module();
                        if receiver.tag() == Rc::as_ptr(&callee_module) as usize {
                            dataseg = Some(receiver.clone());
                        }
                        Some(receiver)
                    }
                };
                exec(out, None, outer, dataseg, stack, &code)?;
                for _ in 0..argc {
                    stack.pop()?;
                }
                if op == Op::MethodCall {
                    let result = stack.pop()?;
                    stack.pop()?; // the receiver
                    stack.push(result);
                }
            }
            Op::EnterCtor => {
                let callee = seg.state_at(seg.u16_at(ip)).clone();
                ip += 2;
                let slot = RtStack::index(bp, callee.ret_offs());
                frame.selfvars = Some(as_state_obj(stack.at(slot)?)?);
            }
            Op::NewInstance => {
                let st = seg.state_at(seg.u16_at(ip)).clone();
                ip += 2;
                stack.push(Variant::RtObj(st.new_instance()));
            }

            // --- 14. output, diagnostics
            Op::Echo => {
                let t = seg.type_at(seg.u16_at(ip)).clone();
                ip += 2;
                let v = stack.pop()?;
                write!(out, "{}", t.render_value(&v))
                    .map_err(|e| RuntimeError::Other(e.to_string()))?;
            }
            Op::EchoSep => {
                write!(out, ", ").map_err(|e| RuntimeError::Other(e.to_string()))?;
            }
            Op::EchoLn => {
                writeln!(out).map_err(|e| RuntimeError::Other(e.to_string()))?;
            }
            Op::Assert => {
                let cond = seg.string_at(seg.u16_at(ip)).to_string();
                let file = seg.string_at(seg.u16_at(ip + 2)).to_string();
                let line = seg.u32_at(ip + 4);
                ip += 8;
                if stack.pop()?.as_ord()? == 0 {
                    return Err(RuntimeError::Assertion { cond, file, line });
                }
            }
            Op::Dump => {
                let expr = seg.string_at(seg.u16_at(ip)).clone();
                let t = seg.type_at(seg.u16_at(ip + 2)).clone();
                ip += 4;
                let v = stack.pop()?;
                writeln!(out, "# {}: {} = {}", expr, t.describe(), t.render_value(&v))
                    .map_err(|e| RuntimeError::Other(e.to_string()))?;
            }
            // line positions feed the listing; execution just skips them
            Op::LineNum => {
                ip += 4;
            }
        }
    }
}

/// Invoke a state's compiled body directly, following the call convention.
pub fn call_state(
    out: &mut dyn Write,
    callee: &Rc<State>,
    outer: Option<&Rc<StateObj>>,
    dataseg: Option<&Rc<StateObj>>,
    stack: &mut RtStack,
    args: Vec<Variant>,
) -> RuntimeResult<Variant> {
    let code = callee
        .code()
        .ok_or_else(|| RuntimeError::Other(format!("'{}' has no code", callee.name())))?;
    let argc = args.len();
    stack.push(Variant::Void); // result slot
    for a in args {
        stack.push(a);
    }
    exec(out, None, outer.cloned(), dataseg.cloned(), stack, &code)?;
    for _ in 0..argc {
        stack.pop()?;
    }
    stack.pop()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typesys::{QueenBee, StateExt};

    fn closed(build: impl FnOnce(&mut CodeSeg)) -> CodeSeg {
        let mut seg = CodeSeg::new();
        build(&mut seg);
        seg.close(16);
        seg
    }

    fn run_seg(seg: &CodeSeg, stack: &mut RtStack) -> RuntimeResult<()> {
        let mut sink = std::io::sink();
        run(&mut sink, None, stack, seg)
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        // 2 + 3 < 6  =>  true
        let seg = closed(|seg| {
            seg.append_op(Op::LoadByte);
            seg.append_u8(2);
            seg.append_op(Op::LoadByte);
            seg.append_u8(3);
            seg.append_op(Op::Add);
            seg.append_op(Op::LoadByte);
            seg.append_u8(6);
            seg.append_op(Op::CmpOrd);
            seg.append_op(Op::LessThan);
        });
        let mut stack = RtStack::new(8);
        run_seg(&seg, &mut stack).unwrap();
        assert_eq!(stack.pop().unwrap(), Variant::Ord(1));
    }

    #[test]
    fn test_div_by_zero_unwinds_to_bp() {
        let seg = closed(|seg| {
            seg.append_op(Op::Load1);
            seg.append_op(Op::Load1);
            seg.append_op(Op::Load0);
            seg.append_op(Op::Div);
        });
        let mut stack = RtStack::new(8);
        stack.push(Variant::Ord(99)); // caller's value, below bp
        let err = run_seg(&seg, &mut stack).unwrap_err();
        assert_eq!(err, RuntimeError::DivByZero);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.pop().unwrap(), Variant::Ord(99));
    }

    #[test]
    fn test_exit_raises_cleanly() {
        let seg = closed(|seg| {
            seg.append_op(Op::Exit);
        });
        let mut stack = RtStack::new(8);
        assert_eq!(run_seg(&seg, &mut stack).unwrap_err(), RuntimeError::Exit);
    }

    #[test]
    fn test_invalid_opcode() {
        let mut seg = CodeSeg::new();
        seg.append_u8(0xff);
        seg.close(4);
        let mut stack = RtStack::new(8);
        assert!(matches!(
            run_seg(&seg, &mut stack).unwrap_err(),
            RuntimeError::InvalidOpcode(0xff)
        ));
    }

    #[test]
    fn test_short_circuit_jumps() {
        // JumpAnd keeps a false value and skips the right operand
        let seg = closed(|seg| {
            seg.append_op(Op::Load0);
            seg.append_op(Op::JumpAnd);
            seg.append_i16(4); // over Load1 + Div
            seg.append_op(Op::Load1);
            seg.append_op(Op::Load0);
            seg.append_op(Op::Div); // must not execute
            seg.append_op(Op::Nop);
        });
        let mut stack = RtStack::new(8);
        run_seg(&seg, &mut stack).unwrap();
        assert_eq!(stack.pop().unwrap(), Variant::Ord(0));
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn test_string_and_vector_construction() {
        // chr('a') | 'b' => "ab"; then length
        let seg = closed(|seg| {
            seg.append_op(Op::LoadByte);
            seg.append_u8(b'a');
            seg.append_op(Op::ChrToStr);
            seg.append_op(Op::LoadByte);
            seg.append_u8(b'b');
            seg.append_op(Op::ChrCat);
            seg.append_op(Op::StrLen);
        });
        let mut stack = RtStack::new(8);
        run_seg(&seg, &mut stack).unwrap();
        assert_eq!(stack.pop().unwrap(), Variant::Ord(2));
    }

    #[test]
    fn test_mkref_and_store_through_ref() {
        let seg = closed(|seg| {
            seg.append_op(Op::LoadByte);
            seg.append_u8(5);
            seg.append_op(Op::MkRef);
            seg.append_op(Op::Deref);
        });
        let mut stack = RtStack::new(8);
        run_seg(&seg, &mut stack).unwrap();
        assert_eq!(stack.pop().unwrap(), Variant::Ord(5));
    }

    #[test]
    fn test_range_membership() {
        let seg = closed(|seg| {
            seg.append_op(Op::LoadByte);
            seg.append_u8(15);
            seg.append_op(Op::LoadByte);
            seg.append_u8(10);
            seg.append_op(Op::LoadByte);
            seg.append_u8(20);
            seg.append_op(Op::MkRange);
            seg.append_op(Op::RangeHas);
        });
        let mut stack = RtStack::new(8);
        run_seg(&seg, &mut stack).unwrap();
        assert_eq!(stack.pop().unwrap(), Variant::Ord(1));
    }

    #[test]
    fn test_byte_set_ops() {
        let seg = closed(|seg| {
            seg.append_op(Op::LoadByte);
            seg.append_u8(3); // elem to test
            seg.append_op(Op::LoadByte);
            seg.append_u8(1);
            seg.append_op(Op::LoadByte);
            seg.append_u8(5);
            seg.append_op(Op::RngToByteSet);
            seg.append_op(Op::InByteSet);
        });
        let mut stack = RtStack::new(8);
        run_seg(&seg, &mut stack).unwrap();
        assert_eq!(stack.pop().unwrap(), Variant::Ord(1));
    }

    #[test]
    fn test_echo_renders_through_type() {
        let qb = QueenBee::new();
        let mut seg = CodeSeg::new();
        let bool_idx = seg.add_type(&qb.bool_());
        seg.append_op(Op::Load1);
        seg.append_op(Op::Echo);
        seg.append_u16(bool_idx);
        seg.append_op(Op::EchoLn);
        seg.close(4);
        let mut out: Vec<u8> = Vec::new();
        let mut stack = RtStack::new(8);
        run(&mut out, None, &mut stack, &seg).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "true\n");
    }

    #[test]
    fn test_assert_failure() {
        let mut seg = CodeSeg::new();
        let cond = seg.add_string(Str::from("x > 0"));
        let file = seg.add_string(Str::from("t.shn"));
        seg.append_op(Op::Load0);
        seg.append_op(Op::Assert);
        seg.append_u16(cond);
        seg.append_u16(file);
        seg.append_u32(7);
        seg.close(4);
        let mut stack = RtStack::new(8);
        let err = run_seg(&seg, &mut stack).unwrap_err();
        assert!(matches!(err, RuntimeError::Assertion { line: 7, .. }));
    }

    #[test]
    fn test_call_state_convention() {
        let qb = QueenBee::new();
        let module = crate::typesys::State::new("m", None, true, false);
        let callee = crate::typesys::State::new("addone", Some(&module), false, false);
        callee.add_arg("a", qb.int()).unwrap();
        callee.set_result_type(qb.int()).unwrap();
        let seg = closed(|seg| {
            seg.append_op(Op::LoadStkVar);
            seg.append_i8(-1);
            seg.append_op(Op::Load1);
            seg.append_op(Op::Add);
            seg.append_op(Op::StoreStkVar);
            seg.append_i8(-2);
        });
        callee.set_code(Rc::new(seg));
        let mut stack = RtStack::new(16);
        let mut sink = std::io::sink();
        let result =
            call_state(&mut sink, &callee, None, None, &mut stack, vec![Variant::Ord(41)]).unwrap();
        assert_eq!(result, Variant::Ord(42));
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn test_self_var_load_store() {
        let obj = StateObj::new(1);
        let seg = closed(|seg| {
            seg.append_op(Op::LoadByte);
            seg.append_u8(77);
            seg.append_op(Op::StoreSelfVar);
            seg.append_u8(0);
            seg.append_op(Op::LoadSelfVar);
            seg.append_u8(0);
            seg.append_op(Op::Pop);
        });
        let mut stack = RtStack::new(8);
        let mut sink = std::io::sink();
        run(&mut sink, Some(&obj), &mut stack, &seg).unwrap();
        assert_eq!(obj.var(0).unwrap(), Variant::Ord(77));
    }
}
