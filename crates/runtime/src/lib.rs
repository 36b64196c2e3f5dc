//! Shannon runtime: the value model shared by the compiler and the VM
//!
//! Key design principles:
//! - `Variant`: the tagged value the language talks about (ordinals, strings,
//!   vectors, sets, dicts, ranges, references, runtime objects)
//! - Container payloads are reference-counted and copy-on-write: cloning a
//!   variant is O(1), mutation uniquifies the payload first
//! - `RtStack`: the preallocated value stack the interpreter runs against

pub mod container;
pub mod error;
pub mod ordset;
pub mod rtobj;
pub mod stack;
pub mod variant;

pub use container::{DictImpl, RangeObj, Str, VarDict, VarRange, VarSet, VarVec};
pub use error::{RuntimeError, RuntimeResult};
pub use ordset::OrdSet;
pub use rtobj::{RtObj, RtObject, StateObj};
pub use stack::RtStack;
pub use variant::{VarRef, Variant, VariantKind};
