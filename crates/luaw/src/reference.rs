//! Registry-backed handles
//!
//! Captured values live in a hidden table in the interpreter registry,
//! indexed by a monotonically increasing [`RefKey`]. A [`Reference`] is the
//! host-side owner of one slot; clones share the slot and the last one to go
//! clears it.

use std::fmt;
use std::os::raw::c_int;
use std::sync::Arc;

use mlua_sys as ffi;

use crate::error::{Error, Result};
use crate::state::{handles_key, Lua, Shared};

/// Identity of a captured value.
///
/// Keys are never reused while the interpreter lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefKey(pub(crate) i64);

impl RefKey {
    /// Numeric form of the key.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct RefInner {
    key: RefKey,
    shared: Arc<Shared>,
}

impl Drop for RefInner {
    fn drop(&mut self) {
        self.shared.release(self.key);
    }
}

/// Shared ownership of one captured interpreter value.
#[derive(Clone)]
pub struct Reference {
    inner: Arc<RefInner>,
}

impl Reference {
    /// Captures the value at `index` without consuming it.
    pub(crate) fn capture(lua: &Lua, index: c_int) -> Result<Self> {
        lua.ensure_stack(2)?;
        let key = lua.shared().next_key();
        unsafe {
            let state = lua.as_ptr();
            let index = ffi::lua_absindex(state, index);
            ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, handles_key());
            ffi::lua_pushvalue(state, index);
            ffi::lua_rawseti(state, -2, key.0);
            ffi::lua_pop(state, 1);
        }
        tracing::trace!(%key, "captured handle");
        Ok(Reference {
            inner: Arc::new(RefInner {
                key,
                shared: Arc::clone(lua.shared()),
            }),
        })
    }

    /// Pushes the captured value onto `lua`'s stack.
    pub(crate) fn push(&self, lua: &Lua) -> Result<()> {
        if !Arc::ptr_eq(&self.inner.shared, lua.shared()) {
            return Err(Error::ForeignHandle);
        }
        lua.ensure_stack(2)?;
        unsafe {
            let state = lua.as_ptr();
            ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, handles_key());
            ffi::lua_rawgeti(state, -1, self.inner.key.0);
            ffi::lua_remove(state, -2);
        }
        Ok(())
    }

    /// Main-thread view of the owning interpreter.
    pub(crate) fn lua(&self) -> Result<Lua> {
        self.inner.shared.view()
    }

    pub(crate) fn is_live(lua: &Lua, key: RefKey) -> bool {
        if lua.ensure_stack(2).is_err() {
            return false;
        }
        unsafe {
            let state = lua.as_ptr();
            ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, handles_key());
            let live = ffi::lua_rawgeti(state, -1, key.0) != ffi::LUA_TNIL;
            ffi::lua_pop(state, 2);
            live
        }
    }

    /// Registry key of the captured value.
    pub fn key(&self) -> RefKey {
        self.inner.key
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reference").field(&self.inner.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_and_release() {
        let lua = Lua::new();
        lua.exec("t = {}").unwrap();
        lua.push_global("t").unwrap();
        let reference = Reference::capture(&lua, -1).unwrap();
        lua.pop(1);

        let key = reference.key();
        assert!(lua.contains_reference(key));

        let clone = reference.clone();
        drop(reference);
        assert!(lua.contains_reference(key));

        drop(clone);
        assert!(!lua.contains_reference(key));
    }

    #[test]
    fn test_push_restores_value() {
        let lua = Lua::new();
        lua.push("captured").unwrap();
        let reference = Reference::capture(&lua, -1).unwrap();
        lua.pop(1);

        reference.push(&lua).unwrap();
        assert_eq!(lua.read::<String>(-1).unwrap(), "captured");
        lua.pop(1);
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn test_foreign_push_is_rejected() {
        let first = Lua::new();
        let second = Lua::new();
        first.push(1).unwrap();
        let reference = Reference::capture(&first, -1).unwrap();
        assert!(matches!(reference.push(&second), Err(Error::ForeignHandle)));
    }

    #[test]
    fn test_drop_after_close_is_noop() {
        let lua = Lua::new();
        lua.push(true).unwrap();
        let reference = Reference::capture(&lua, -1).unwrap();
        drop(lua);
        assert!(matches!(reference.lua(), Err(Error::StateClosed)));
        drop(reference);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(RefKey(7).to_string(), "#7");
        assert_eq!(RefKey(7).get(), 7);
    }
}
