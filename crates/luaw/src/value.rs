//! Dynamically typed interpreter values

use std::ffi::c_void;
use std::os::raw::c_int;

use mlua_sys as ffi;

use crate::convert::{FromLua, ToLua};
use crate::error::Result;
use crate::function::Function;
use crate::reference::Reference;
use crate::stack;
use crate::state::Lua;
use crate::table::Table;

/// Any value a stack slot can hold.
///
/// Collectable values other than tables and functions (native objects,
/// foreign userdata, coroutines) are kept as opaque captured references.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    /// Text; invalid UTF-8 is replaced when read
    String(String),
    LightPointer(*mut c_void),
    Table(Table),
    Function(Function),
    UserData(Reference),
    Thread(Reference),
}

impl Value {
    /// Kind name of the value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::LightPointer(_) => "light userdata",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::UserData(_) => "userdata",
            Value::Thread(_) => "thread",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric value of either number representation.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }
}

impl ToLua for Value {
    fn push(self, lua: &Lua) -> Result<()> {
        lua.ensure_stack(1)?;
        let state = lua.as_ptr();
        match self {
            Value::Nil => unsafe { ffi::lua_pushnil(state) },
            Value::Boolean(b) => return b.push(lua),
            Value::Integer(i) => unsafe { ffi::lua_pushinteger(state, i) },
            Value::Number(n) => unsafe { ffi::lua_pushnumber(state, n) },
            Value::String(s) => return s.push(lua),
            Value::LightPointer(p) => return p.push(lua),
            Value::Table(t) => return t.push(lua),
            Value::Function(f) => return f.push(lua),
            Value::UserData(r) | Value::Thread(r) => return r.push(lua),
        }
        Ok(())
    }
}

impl FromLua for Value {
    const KIND: &'static str = "value";

    fn read(lua: &Lua, index: c_int) -> Result<Self> {
        let state = lua.as_ptr();
        let value = unsafe {
            match ffi::lua_type(state, index) {
                ffi::LUA_TNONE | ffi::LUA_TNIL => Value::Nil,
                ffi::LUA_TBOOLEAN => Value::Boolean(ffi::lua_toboolean(state, index) != 0),
                ffi::LUA_TNUMBER if ffi::lua_isinteger(state, index) != 0 => {
                    Value::Integer(ffi::lua_tointegerx(state, index, std::ptr::null_mut()))
                }
                ffi::LUA_TNUMBER => Value::Number(ffi::lua_tonumberx(state, index, std::ptr::null_mut())),
                ffi::LUA_TSTRING => {
                    Value::String(String::from_utf8_lossy(&stack::copy_bytes(state, index)).into_owned())
                }
                ffi::LUA_TLIGHTUSERDATA => Value::LightPointer(ffi::lua_touserdata(state, index)),
                ffi::LUA_TTABLE => Value::Table(Table::read(lua, index)?),
                ffi::LUA_TFUNCTION => Value::Function(Function::read(lua, index)?),
                ffi::LUA_TTHREAD => Value::Thread(Reference::capture(lua, index)?),
                _ => Value::UserData(Reference::capture(lua, index)?),
            }
        };
        Ok(value)
    }
}
