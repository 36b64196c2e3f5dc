//! Compiler options, overridable from a TOML file and CLI flags.

use serde::Deserialize;
use std::path::Path;

use crate::codeseg::DEFAULT_STACK_SIZE;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerOptions {
    /// Compile `dump` statements
    pub enable_dump: bool,
    /// Compile `assert` statements
    pub enable_assert: bool,
    /// Emit line-number opcodes for diagnostics
    pub line_info: bool,
    /// Write a `.lst` bytecode listing next to the source
    pub listing: bool,
    /// Preallocated interpreter stack depth
    pub stack_size: usize,
    /// Directories searched for `uses` imports
    pub module_path: Vec<String>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            enable_dump: true,
            enable_assert: true,
            line_info: true,
            listing: false,
            stack_size: DEFAULT_STACK_SIZE,
            module_path: vec![".".to_string()],
        }
    }
}

impl CompilerOptions {
    /// Load options from a TOML file.
    pub fn from_path(path: &Path) -> Result<CompilerOptions, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read options file '{}': {}", path.display(), e))?;
        toml::from_str(&content)
            .map_err(|e| format!("Failed to parse options file '{}': {}", path.display(), e))
    }

    /// Toggle the debugging aids together.
    pub fn set_debug_opts(&mut self, flag: bool) {
        self.enable_dump = flag;
        self.enable_assert = flag;
        self.line_info = flag;
        self.listing = flag;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = CompilerOptions::default();
        assert!(opts.enable_assert);
        assert!(!opts.listing);
        assert_eq!(opts.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(opts.module_path, vec![".".to_string()]);
    }

    #[test]
    fn test_toml_overlay() {
        let opts: CompilerOptions =
            toml::from_str("enable_assert = false\nstack_size = 512\n").unwrap();
        assert!(!opts.enable_assert);
        assert!(opts.enable_dump);
        assert_eq!(opts.stack_size, 512);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let res: Result<CompilerOptions, _> = toml::from_str("no_such_option = 1\n");
        assert!(res.is_err());
    }

    #[test]
    fn test_set_debug_opts() {
        let mut opts = CompilerOptions::default();
        opts.set_debug_opts(false);
        assert!(!opts.enable_dump && !opts.enable_assert && !opts.line_info);
    }
}
