//! Interpreter construction options

use crate::libs::StdLib;

/// Options applied by [`crate::Lua::with_options`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LuaOptions {
    /// Standard libraries opened on the new interpreter
    pub libraries: StdLib,
    /// Install the global `typeof` function
    pub typeof_function: bool,
}

impl Default for LuaOptions {
    fn default() -> Self {
        Self {
            libraries: StdLib::ALL,
            typeof_function: true,
        }
    }
}

impl LuaOptions {
    /// Interpreter with no libraries and no helpers.
    pub fn bare() -> Self {
        Self {
            libraries: StdLib::empty(),
            typeof_function: false,
        }
    }

    /// Replace the library selection.
    pub fn libraries(mut self, libraries: StdLib) -> Self {
        self.libraries = libraries;
        self
    }

    /// Toggle the global `typeof` function.
    pub fn typeof_function(mut self, enabled: bool) -> Self {
        self.typeof_function = enabled;
        self
    }
}
