//! Table handles

use std::fmt;
use std::marker::PhantomData;
use std::os::raw::c_int;

use mlua_sys as ffi;

use crate::convert::{mismatch, FromLua, ToLua};
use crate::error::{Error, Result};
use crate::reference::{RefKey, Reference};
use crate::stack::StackGuard;
use crate::state::Lua;

/// Shared handle on an interpreter table.
///
/// Clones alias the same table; the table stays reachable until the last
/// clone is dropped. Access is raw: metamethods are not consulted.
#[derive(Clone, PartialEq)]
pub struct Table {
    reference: Reference,
}

impl Table {
    /// Registry key of the captured table.
    pub fn key(&self) -> RefKey {
        self.reference.key()
    }

    /// Reads `table[key]`.
    pub fn get<K: ToLua, V: FromLua>(&self, key: K) -> Result<V> {
        let lua = self.reference.lua()?;
        let _guard = unsafe { StackGuard::new(lua.as_ptr()) };
        self.reference.push(&lua)?;
        key.push(&lua)?;
        unsafe { ffi::lua_rawget(lua.as_ptr(), -2) };
        lua.read(-1)
    }

    /// Writes `table[key] = value`. Nil and NaN keys are rejected.
    pub fn set<K: ToLua, V: ToLua>(&self, key: K, value: V) -> Result<()> {
        let lua = self.reference.lua()?;
        let _guard = unsafe { StackGuard::new(lua.as_ptr()) };
        self.reference.push(&lua)?;
        key.push(&lua)?;
        check_key(&lua)?;
        value.push(&lua)?;
        unsafe { ffi::lua_rawset(lua.as_ptr(), -3) };
        Ok(())
    }

    /// Whether `table[key]` is non-nil.
    pub fn contains_key<K: ToLua>(&self, key: K) -> Result<bool> {
        let lua = self.reference.lua()?;
        let _guard = unsafe { StackGuard::new(lua.as_ptr()) };
        self.reference.push(&lua)?;
        key.push(&lua)?;
        Ok(unsafe { ffi::lua_rawget(lua.as_ptr(), -2) } != ffi::LUA_TNIL)
    }

    /// Border of the sequence part (`#t` without `__len`).
    pub fn len(&self) -> Result<usize> {
        self.raw_len()
    }

    /// Raw length as reported by `rawlen`.
    pub fn raw_len(&self) -> Result<usize> {
        let lua = self.reference.lua()?;
        let _guard = unsafe { StackGuard::new(lua.as_ptr()) };
        self.reference.push(&lua)?;
        Ok(unsafe { ffi::lua_rawlen(lua.as_ptr(), -1) } as usize)
    }

    /// Whether the table has no entries at all.
    pub fn is_empty(&self) -> Result<bool> {
        match self.pairs::<crate::Value, crate::Value>().next() {
            None => Ok(true),
            Some(entry) => entry.map(|_| false),
        }
    }

    /// Iterates over every entry in traversal order.
    ///
    /// Entries that fail to read as `(K, V)` are yielded as errors and the
    /// traversal continues. Assigning to new keys while iterating ends the
    /// traversal with an error.
    pub fn pairs<K: FromLua, V: FromLua>(&self) -> TablePairs<K, V> {
        TablePairs {
            table: self.clone(),
            cursor: None,
            done: false,
            _marker: PhantomData,
        }
    }

    /// Collects the sequence `t[1..=len]`.
    pub fn sequence_values<V: FromLua>(&self) -> Result<Vec<V>> {
        let len = self.len()?;
        (1..=len as i64).map(|i| self.get(i)).collect()
    }
}

fn check_key(lua: &Lua) -> Result<()> {
    let state = lua.as_ptr();
    unsafe {
        match ffi::lua_type(state, -1) {
            ffi::LUA_TNIL => Err(Error::InvalidKey("nil".to_string())),
            ffi::LUA_TNUMBER
                if ffi::lua_isinteger(state, -1) == 0
                    && ffi::lua_tonumberx(state, -1, std::ptr::null_mut()).is_nan() =>
            {
                Err(Error::InvalidKey("NaN".to_string()))
            }
            _ => Ok(()),
        }
    }
}

impl ToLua for Table {
    fn push(self, lua: &Lua) -> Result<()> {
        self.reference.push(lua)
    }
}

impl ToLua for &Table {
    fn push(self, lua: &Lua) -> Result<()> {
        self.reference.push(lua)
    }
}

impl FromLua for Table {
    const KIND: &'static str = "table";

    fn read(lua: &Lua, index: c_int) -> Result<Self> {
        if unsafe { ffi::lua_type(lua.as_ptr(), index) } != ffi::LUA_TTABLE {
            return Err(mismatch::<Self>(lua, index));
        }
        Ok(Table {
            reference: Reference::capture(lua, index)?,
        })
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Table({})", self.key())
    }
}

// ============================================================================
// Iteration
// ============================================================================

/// Iterator returned by [`Table::pairs`].
pub struct TablePairs<K, V> {
    table: Table,
    /// Last visited key, captured so that its exact identity is preserved.
    cursor: Option<Reference>,
    done: bool,
    _marker: PhantomData<fn() -> (K, V)>,
}

/// Protected `next`: (table, key) -> (key, value) or nothing at the end.
unsafe extern "C-unwind" fn next_entry(state: *mut ffi::lua_State) -> c_int {
    ffi::lua_settop(state, 2);
    if ffi::lua_next(state, 1) != 0 {
        2
    } else {
        0
    }
}

impl<K: FromLua, V: FromLua> TablePairs<K, V> {
    fn step(&mut self, lua: &Lua) -> Result<Option<(K, V)>> {
        let state = lua.as_ptr();
        lua.ensure_stack(4)?;
        let base = lua.top();

        unsafe { ffi::lua_pushcfunction(state, next_entry) };
        self.table.reference.push(lua)?;
        match &self.cursor {
            Some(cursor) => cursor.push(lua)?,
            None => unsafe { ffi::lua_pushnil(state) },
        }
        if unsafe { ffi::lua_pcall(state, 2, ffi::LUA_MULTRET, 0) } != ffi::LUA_OK {
            let message = unsafe { crate::stack::pop_error_message(state) };
            return Err(Error::Runtime(message));
        }
        if lua.top() == base {
            return Ok(None);
        }

        self.cursor = Some(Reference::capture(lua, -2)?);
        let key = lua.read::<K>(-2)?;
        let value = lua.read::<V>(-1)?;
        Ok(Some((key, value)))
    }
}

impl<K: FromLua, V: FromLua> Iterator for TablePairs<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let lua = match self.table.reference.lua() {
            Ok(lua) => lua,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };
        let _guard = unsafe { StackGuard::new(lua.as_ptr()) };
        match self.step(&lua) {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                // A failed read leaves the cursor advanced; anything else is fatal.
                if !matches!(err, Error::TypeMismatch { .. }) {
                    self.done = true;
                }
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set() {
        let lua = Lua::new();
        let table = lua.create_table().unwrap();
        table.set("name", "luaw").unwrap();
        table.set(1, 10).unwrap();
        assert_eq!(table.get::<_, String>("name").unwrap(), "luaw");
        assert_eq!(table.get::<_, i32>(1).unwrap(), 10);
        assert!(table.contains_key("name").unwrap());
        assert!(!table.contains_key("other").unwrap());
    }

    #[test]
    fn test_invalid_keys() {
        let lua = Lua::new();
        let table = lua.create_table().unwrap();
        assert!(matches!(table.set(Option::<i32>::None, 1), Err(Error::InvalidKey(_))));
        assert!(matches!(table.set(f64::NAN, 1), Err(Error::InvalidKey(_))));
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn test_pairs_visits_every_entry() {
        let lua = Lua::new();
        lua.exec("t = { 10, 20, 30, x = 1.5 }").unwrap();
        let table: Table = lua.get_global("t").unwrap();
        let mut seen: Vec<(String, f64)> = table.pairs::<String, f64>().map(|e| e.unwrap()).collect();
        seen.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            seen,
            vec![
                ("1".to_string(), 10.0),
                ("2".to_string(), 20.0),
                ("3".to_string(), 30.0),
                ("x".to_string(), 1.5)
            ]
        );
    }

    #[test]
    fn test_pairs_with_float_keys() {
        let lua = Lua::new();
        lua.exec("t = { [0.5] = 'a', [1.5] = 'b' }").unwrap();
        let table: Table = lua.get_global("t").unwrap();
        assert_eq!(table.pairs::<f64, String>().count(), 2);
    }

    #[test]
    fn test_is_empty_and_sequence() {
        let lua = Lua::new();
        let table = lua.create_table().unwrap();
        assert!(table.is_empty().unwrap());
        table.set(1, "a").unwrap();
        table.set(2, "b").unwrap();
        assert!(!table.is_empty().unwrap());
        assert_eq!(table.raw_len().unwrap(), 2);
        assert_eq!(table.sequence_values::<String>().unwrap(), vec!["a", "b"]);
    }
}
