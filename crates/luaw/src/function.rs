//! Function handles

use std::fmt;
use std::os::raw::c_int;

use mlua_sys as ffi;

use crate::convert::{mismatch, FromLua, PushArgs, ToLua};
use crate::error::Result;
use crate::reference::{RefKey, Reference};
use crate::stack::StackGuard;
use crate::state::Lua;

/// Shared handle on an interpreter function (script or native).
#[derive(Clone, PartialEq)]
pub struct Function {
    reference: Reference,
}

impl Function {
    /// Registry key of the captured function.
    pub fn key(&self) -> RefKey {
        self.reference.key()
    }

    /// Calls the function in protected mode and reads its first result.
    ///
    /// Missing results read as nil.
    pub fn call<A: PushArgs, R: FromLua>(&self, args: A) -> Result<R> {
        let lua = self.reference.lua()?;
        let _guard = unsafe { StackGuard::new(lua.as_ptr()) };
        self.reference.push(&lua)?;
        let nargs = args.push_args(&lua)?;
        lua.protected_call(nargs, 1)?;
        lua.read(-1)
    }

    /// Calls the function in protected mode, discarding results.
    pub fn call_void<A: PushArgs>(&self, args: A) -> Result<()> {
        let lua = self.reference.lua()?;
        let _guard = unsafe { StackGuard::new(lua.as_ptr()) };
        self.reference.push(&lua)?;
        let nargs = args.push_args(&lua)?;
        lua.protected_call(nargs, 0)
    }
}

impl ToLua for Function {
    fn push(self, lua: &Lua) -> Result<()> {
        self.reference.push(lua)
    }
}

impl ToLua for &Function {
    fn push(self, lua: &Lua) -> Result<()> {
        self.reference.push(lua)
    }
}

impl FromLua for Function {
    const KIND: &'static str = "function";

    fn read(lua: &Lua, index: c_int) -> Result<Self> {
        if unsafe { ffi::lua_type(lua.as_ptr(), index) } != ffi::LUA_TFUNCTION {
            return Err(mismatch::<Self>(lua, index));
        }
        Ok(Function {
            reference: Reference::capture(lua, index)?,
        })
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({})", self.key())
    }
}
