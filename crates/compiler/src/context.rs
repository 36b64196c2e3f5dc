//! The execution context.
//!
//! Owns the ordered list of module instances, resolves `uses` imports
//! (loading and compiling source files on demand), instantiates module
//! data segments once everything is compiled, and runs the instances in
//! registration order. On any error every already-instantiated module is
//! finalized in reverse order before the error is rethrown; finalization
//! collapses each instance to break reference cycles.
//!
//! The `system` module is always present at index 0; the conventional
//! program result is read from its `result` variable.

use crate::compiler::Compiler;
use crate::error::{CompileError, ShannonError};
use crate::options::CompilerOptions;
use crate::typesys::{QueenBee, State, StateExt};
use crate::vm;
use shannon_runtime::{RtStack, RuntimeError, StateObj, Variant};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub const SOURCE_EXT: &str = ".shn";

pub struct ModuleInstance {
    pub module: Rc<State>,
    pub obj: Option<Rc<StateObj>>,
}

impl ModuleInstance {
    fn finalize(&mut self) {
        if let Some(obj) = self.obj.take() {
            // break possible circular references before the release
            obj.collapse();
        }
    }
}

pub struct Context {
    pub options: CompilerOptions,
    qb: QueenBee,
    instances: Vec<ModuleInstance>,
    by_name: BTreeMap<String, usize>,
    /// Guards against circular `uses` chains while compiling
    loading: HashSet<String>,
}

impl Context {
    pub fn new(options: CompilerOptions) -> Context {
        let qb = QueenBee::new();
        let mut ctx = Context {
            options,
            qb: qb.clone(),
            instances: Vec::new(),
            by_name: BTreeMap::new(),
            loading: HashSet::new(),
        };
        ctx.add_instance(qb.module()).expect("system module registration");
        ctx
    }

    pub fn qb(&self) -> &QueenBee {
        &self.qb
    }

    fn add_instance(&mut self, module: Rc<State>) -> Result<(), CompileError> {
        let name = module.name();
        if self.by_name.contains_key(&name) {
            return Err(CompileError::Duplicate(name));
        }
        self.by_name.insert(name, self.instances.len());
        self.instances.push(ModuleInstance { module, obj: None });
        Ok(())
    }

    /// A module by name: already loaded, or found on the module path and
    /// compiled now. Used by the compiler for `uses` clauses.
    pub fn get_module(&mut self, name: &str) -> Result<Rc<State>, ShannonError> {
        if let Some(&i) = self.by_name.get(name) {
            return Ok(self.instances[i].module.clone());
        }
        if self.loading.contains(name) {
            return Err(CompileError::Type(format!("Circular module dependency: {}", name)).into());
        }
        let path = self.lookup_source(name)?;
        self.load_module(&path)
    }

    fn lookup_source(&self, name: &str) -> Result<PathBuf, ShannonError> {
        for dir in &self.options.module_path {
            let candidate = Path::new(dir).join(format!("{}{}", name, SOURCE_EXT));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(ShannonError::Io(format!("Module not found: {}", name)))
    }

    /// Compile a single source file into a fresh module and register its
    /// instance. Imports resolved during compilation register first, so
    /// the instance list is in dependency order.
    pub fn load_module(&mut self, path: &Path) -> Result<Rc<State>, ShannonError> {
        let name = module_name_from_path(path);
        let source = std::fs::read_to_string(path)
            .map_err(|e| ShannonError::Io(format!("Failed to read '{}': {}", path.display(), e)))?;
        tracing::debug!(module = %name, path = %path.display(), "compiling module");

        let module = State::new(&name, None, true, false);
        module.add_uses(&self.qb.module())?;

        self.loading.insert(name.clone());
        let result = Compiler::new(self, module.clone(), &source, &path.display().to_string())
            .compile_module();
        self.loading.remove(&name);
        result?;

        self.add_instance(module.clone())?;
        tracing::debug!(module = %name, "module compiled");
        Ok(module)
    }

    fn module_obj(&self, module: &Rc<State>) -> Option<Rc<StateObj>> {
        let i = *self.by_name.get(&module.name())?;
        if !Rc::ptr_eq(&self.instances[i].module, module) {
            return None;
        }
        self.instances[i].obj.clone()
    }

    /// Allocate each module's data segment, in registration order.
    fn instantiate_modules(&mut self) {
        for inst in &mut self.instances {
            inst.obj = Some(inst.module.new_instance());
        }
    }

    fn clear(&mut self) {
        for inst in self.instances.iter_mut().rev() {
            inst.finalize();
        }
    }

    fn write_listing(&self, source_path: &Path) -> Result<(), ShannonError> {
        let lst_path = source_path.with_extension("lst");
        let mut text = String::new();
        for inst in &self.instances {
            if let Some(code) = inst.module.code() {
                text.push_str(&format!("; module {}\n", inst.module.name()));
                text.push_str(&code.listing());
                text.push('\n');
            }
        }
        std::fs::write(&lst_path, text)
            .map_err(|e| ShannonError::Io(format!("Failed to write listing: {}", e)))?;
        Ok(())
    }

    /// Run one registered instance: assign its import slots from the
    /// already-initialized modules, then interpret its init code.
    fn run_instance(&self, index: usize, out: &mut dyn Write, stack: &mut RtStack)
        -> Result<(), RuntimeError>
    {
        let inst = &self.instances[index];
        let obj = inst
            .obj
            .clone()
            .ok_or_else(|| RuntimeError::Other("Module not instantiated".into()))?;
        for slot in inst.module.uses() {
            let imported = slot
                .ty
                .as_state()
                .ok_or_else(|| RuntimeError::Other("Bad import slot".into()))?;
            let imported_obj = self
                .module_obj(imported)
                .ok_or_else(|| RuntimeError::Other("Imported module not instantiated".into()))?;
            obj.set_var(slot.id, Variant::RtObj(imported_obj))?;
        }
        if let Some(code) = inst.module.code() {
            vm::run(out, Some(&obj), stack, &code)?;
        }
        Ok(())
    }

    /// Load, compile and run the program at `path`; returns the value of
    /// `system.result`.
    pub fn execute(&mut self, path: &Path) -> Result<Variant, ShannonError> {
        let mut stdout = std::io::stdout();
        self.execute_with_output(path, &mut stdout)
    }

    pub fn execute_with_output(
        &mut self,
        path: &Path,
        out: &mut dyn Write,
    ) -> Result<Variant, ShannonError> {
        self.load_module(path)?;
        if self.options.listing {
            self.write_listing(path)?;
        }
        self.instantiate_modules();
        tracing::debug!(modules = self.instances.len(), "running program");

        let mut stack = RtStack::new(self.options.stack_size);
        for i in 0..self.instances.len() {
            match self.run_instance(i, out, &mut stack) {
                Ok(()) => {}
                Err(RuntimeError::Exit) => break,
                Err(e) => {
                    self.clear();
                    return Err(e.into());
                }
            }
        }

        let result = self.instances[0]
            .obj
            .as_ref()
            .and_then(|obj| obj.var(self.qb.result_var().id).ok())
            .unwrap_or(Variant::Void);
        self.clear();
        Ok(result)
    }
}

fn module_name_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "main".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_module_registered_first() {
        let ctx = Context::new(CompilerOptions::default());
        assert_eq!(ctx.instances.len(), 1);
        assert_eq!(ctx.instances[0].module.name(), "system");
    }

    #[test]
    fn test_get_module_hits_registry() {
        let mut ctx = Context::new(CompilerOptions::default());
        let m = ctx.get_module("system").unwrap();
        assert!(Rc::ptr_eq(&m, &ctx.qb().module()));
    }

    #[test]
    fn test_module_name_from_path() {
        assert_eq!(module_name_from_path(Path::new("/tmp/foo.shn")), "foo");
        assert_eq!(module_name_from_path(Path::new("bar.shn")), "bar");
    }
}
