//! Conversion between host values and interpreter stack slots
//!
//! [`ToLua`] pushes exactly one value; [`FromLua`] reads one slot without
//! changing the stack. Every readable type names the kind it expects
//! through [`FromLua::KIND`], which is what mismatch errors report.
//!
//! Numbers: Rust integers up to 32 bits and floats travel as VM floats;
//! 64-bit integers travel as VM integers so they stay exact. Reads accept
//! either representation, and numeric strings, for every numeric type.
//! Integer reads truncate fractions and reject values that do not fit.

use std::ffi::c_void;
use std::os::raw::c_int;

use mlua_sys as ffi;

use crate::error::{Error, Result};
use crate::stack;
use crate::state::Lua;

// ============================================================================
// Traits
// ============================================================================

/// Host values that can be pushed onto the interpreter stack.
pub trait ToLua {
    /// Pushes `self` as exactly one stack value.
    fn push(self, lua: &Lua) -> Result<()>;
}

/// Host values that can be read from a stack slot.
pub trait FromLua: Sized {
    /// Kind name reported when a slot cannot be read as `Self`.
    const KIND: &'static str;

    /// Reads the slot at absolute `index`.
    fn read(lua: &Lua, index: c_int) -> Result<Self>;
}

/// Argument lists for calls into the interpreter.
pub trait PushArgs {
    /// Pushes every argument, returning how many were pushed.
    fn push_args(self, lua: &Lua) -> Result<c_int>;
}

pub(crate) fn mismatch<T: FromLua>(lua: &Lua, index: c_int) -> Error {
    Error::mismatch(T::KIND, lua.kind_at(index))
}

// ============================================================================
// Booleans
// ============================================================================

impl ToLua for bool {
    fn push(self, lua: &Lua) -> Result<()> {
        lua.ensure_stack(1)?;
        unsafe { ffi::lua_pushboolean(lua.as_ptr(), self as c_int) };
        Ok(())
    }
}

impl FromLua for bool {
    const KIND: &'static str = "boolean";

    fn read(lua: &Lua, index: c_int) -> Result<Self> {
        unsafe {
            if ffi::lua_type(lua.as_ptr(), index) != ffi::LUA_TBOOLEAN {
                return Err(mismatch::<Self>(lua, index));
            }
            Ok(ffi::lua_toboolean(lua.as_ptr(), index) != 0)
        }
    }
}

// ============================================================================
// Numbers
// ============================================================================

fn read_number(lua: &Lua, index: c_int) -> Option<f64> {
    let mut isnum = 0;
    let n = unsafe { ffi::lua_tonumberx(lua.as_ptr(), index, &mut isnum) };
    (isnum != 0).then_some(n)
}

fn read_integer(lua: &Lua, index: c_int) -> Option<i64> {
    let mut isnum = 0;
    let n = unsafe { ffi::lua_tointegerx(lua.as_ptr(), index, &mut isnum) };
    (isnum != 0).then_some(n)
}

macro_rules! float_number {
    ($($ty:ty),*) => {$(
        impl ToLua for $ty {
            fn push(self, lua: &Lua) -> Result<()> {
                lua.ensure_stack(1)?;
                unsafe { ffi::lua_pushnumber(lua.as_ptr(), self as ffi::lua_Number) };
                Ok(())
            }
        }

        impl FromLua for $ty {
            const KIND: &'static str = "number";

            fn read(lua: &Lua, index: c_int) -> Result<Self> {
                read_number(lua, index)
                    .map(|n| n as $ty)
                    .ok_or_else(|| mismatch::<Self>(lua, index))
            }
        }
    )*};
}

macro_rules! narrow_integer {
    ($($ty:ty),*) => {$(
        impl ToLua for $ty {
            fn push(self, lua: &Lua) -> Result<()> {
                lua.ensure_stack(1)?;
                unsafe { ffi::lua_pushnumber(lua.as_ptr(), self as ffi::lua_Number) };
                Ok(())
            }
        }
    )*};
}

macro_rules! wide_integer {
    ($($ty:ty),*) => {$(
        impl ToLua for $ty {
            fn push(self, lua: &Lua) -> Result<()> {
                lua.ensure_stack(1)?;
                unsafe {
                    match ffi::lua_Integer::try_from(self) {
                        Ok(n) => ffi::lua_pushinteger(lua.as_ptr(), n),
                        Err(_) => ffi::lua_pushnumber(lua.as_ptr(), self as ffi::lua_Number),
                    }
                }
                Ok(())
            }
        }
    )*};
}

/// Integer reads never wrap or saturate: values outside the target range,
/// NaN and infinities are mismatches. Fractions are truncated toward zero.
macro_rules! integer_from_lua {
    ($($ty:ty),*) => {$(
        impl FromLua for $ty {
            const KIND: &'static str = "number";

            fn read(lua: &Lua, index: c_int) -> Result<Self> {
                if let Some(n) = read_integer(lua, index) {
                    return <$ty>::try_from(n).map_err(|_| out_of_range(n, stringify!($ty)));
                }
                let n = read_number(lua, index).ok_or_else(|| mismatch::<Self>(lua, index))?;
                let whole = n.trunc();
                // MAX + 1 is a power of two, so the bound is exact as f64.
                if whole.is_finite() && whole >= <$ty>::MIN as f64 && whole < <$ty>::MAX as f64 + 1.0 {
                    Ok(whole as $ty)
                } else {
                    Err(out_of_range(n, stringify!($ty)))
                }
            }
        }
    )*};
}

fn out_of_range(n: impl std::fmt::Display, target: &str) -> Error {
    Error::mismatch("number", format!("{n} (out of {target} range)"))
}

float_number!(f32, f64);
narrow_integer!(i8, i16, i32, u8, u16, u32);
wide_integer!(i64, u64, isize, usize);
integer_from_lua!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

// ============================================================================
// Strings
// ============================================================================

impl ToLua for &str {
    fn push(self, lua: &Lua) -> Result<()> {
        lua.ensure_stack(1)?;
        unsafe { stack::push_str(lua.as_ptr(), self) };
        Ok(())
    }
}

impl ToLua for String {
    fn push(self, lua: &Lua) -> Result<()> {
        self.as_str().push(lua)
    }
}

impl ToLua for &String {
    fn push(self, lua: &Lua) -> Result<()> {
        self.as_str().push(lua)
    }
}

impl FromLua for String {
    const KIND: &'static str = "string";

    fn read(lua: &Lua, index: c_int) -> Result<Self> {
        let state = lua.as_ptr();
        let bytes = unsafe {
            match ffi::lua_type(state, index) {
                ffi::LUA_TSTRING => stack::copy_bytes(state, index),
                ffi::LUA_TNUMBER => {
                    // Convert a copy so the slot keeps its number type.
                    lua.ensure_stack(1)?;
                    ffi::lua_pushvalue(state, index);
                    let bytes = stack::copy_bytes(state, -1);
                    ffi::lua_pop(state, 1);
                    bytes
                }
                _ => return Err(mismatch::<Self>(lua, index)),
            }
        };
        String::from_utf8(bytes).map_err(|_| Error::mismatch(Self::KIND, "non-UTF-8 string"))
    }
}

// ============================================================================
// Raw pointers
// ============================================================================

impl<T> ToLua for *mut T {
    fn push(self, lua: &Lua) -> Result<()> {
        lua.ensure_stack(1)?;
        unsafe { ffi::lua_pushlightuserdata(lua.as_ptr(), self as *mut c_void) };
        Ok(())
    }
}

impl<T> ToLua for *const T {
    fn push(self, lua: &Lua) -> Result<()> {
        (self as *mut T).push(lua)
    }
}

impl<T> FromLua for *mut T {
    const KIND: &'static str = "light userdata";

    fn read(lua: &Lua, index: c_int) -> Result<Self> {
        unsafe {
            if ffi::lua_type(lua.as_ptr(), index) != ffi::LUA_TLIGHTUSERDATA {
                return Err(mismatch::<Self>(lua, index));
            }
            Ok(ffi::lua_touserdata(lua.as_ptr(), index) as *mut T)
        }
    }
}

impl<T> FromLua for *const T {
    const KIND: &'static str = "light userdata";

    fn read(lua: &Lua, index: c_int) -> Result<Self> {
        <*mut T as FromLua>::read(lua, index).map(|p| p as *const T)
    }
}

// ============================================================================
// Optional values
// ============================================================================

impl<T: ToLua> ToLua for Option<T> {
    fn push(self, lua: &Lua) -> Result<()> {
        match self {
            Some(value) => value.push(lua),
            None => {
                lua.ensure_stack(1)?;
                unsafe { ffi::lua_pushnil(lua.as_ptr()) };
                Ok(())
            }
        }
    }
}

impl<T: FromLua> FromLua for Option<T> {
    const KIND: &'static str = T::KIND;

    fn read(lua: &Lua, index: c_int) -> Result<Self> {
        match unsafe { ffi::lua_type(lua.as_ptr(), index) } {
            ffi::LUA_TNIL | ffi::LUA_TNONE => Ok(None),
            _ => T::read(lua, index).map(Some),
        }
    }
}

/// Reading `()` accepts any slot; used for calls whose result is ignored.
impl FromLua for () {
    const KIND: &'static str = "any value";

    fn read(_lua: &Lua, _index: c_int) -> Result<Self> {
        Ok(())
    }
}

// ============================================================================
// Argument lists
// ============================================================================

impl PushArgs for () {
    fn push_args(self, _lua: &Lua) -> Result<c_int> {
        Ok(0)
    }
}

impl<T: ToLua> PushArgs for T {
    fn push_args(self, lua: &Lua) -> Result<c_int> {
        self.push(lua)?;
        Ok(1)
    }
}

macro_rules! tuple_args {
    ($count:expr; $($name:ident),+) => {
        impl<$($name: ToLua),+> PushArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn push_args(self, lua: &Lua) -> Result<c_int> {
                let ($($name,)+) = self;
                $($name.push(lua)?;)+
                Ok($count)
            }
        }
    };
}

tuple_args!(1; A);
tuple_args!(2; A, B);
tuple_args!(3; A, B, C);
tuple_args!(4; A, B, C, D);
tuple_args!(5; A, B, C, D, E);
tuple_args!(6; A, B, C, D, E, F);
tuple_args!(7; A, B, C, D, E, F, G);
tuple_args!(8; A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_reads_accept_both_representations() {
        let lua = Lua::new();
        lua.exec("i, f, s = 42, 2.75, '17'").unwrap();
        assert_eq!(lua.get_global::<i32>("i").unwrap(), 42);
        assert_eq!(lua.get_global::<f64>("i").unwrap(), 42.0);
        assert_eq!(lua.get_global::<i32>("f").unwrap(), 2);
        assert_eq!(lua.get_global::<u8>("s").unwrap(), 17);
    }

    #[test]
    fn test_integer_reads_reject_out_of_range() {
        let lua = Lua::new();
        lua.exec("a, b, c, d, e = 300, -1, 2^40, 300.5, 255").unwrap();
        assert_eq!(
            lua.get_global::<u8>("a").unwrap_err().to_string(),
            "number expected, got 300 (out of u8 range)"
        );
        assert!(lua.get_global::<u32>("b").is_err());
        assert_eq!(lua.get_global::<i32>("b").unwrap(), -1);
        assert!(lua.get_global::<i32>("c").is_err());
        assert_eq!(lua.get_global::<i64>("c").unwrap(), 1 << 40);
        assert!(lua.get_global::<u8>("d").is_err());
        assert_eq!(lua.get_global::<u16>("d").unwrap(), 300);
        assert_eq!(lua.get_global::<u8>("e").unwrap(), 255);
    }

    #[test]
    fn test_integer_reads_reject_non_finite() {
        let lua = Lua::new();
        lua.exec("nan, inf, edge = 0/0, math.huge, 2^63").unwrap();
        assert!(lua.get_global::<i32>("nan").is_err());
        assert!(lua.get_global::<u64>("inf").is_err());
        assert!(lua.get_global::<i64>("edge").is_err());
        assert_eq!(lua.get_global::<u64>("edge").unwrap(), 1 << 63);
        assert_eq!(lua.get_global::<f64>("inf").unwrap(), f64::INFINITY);
    }

    #[test]
    fn test_wide_integers_stay_exact() {
        let lua = Lua::new();
        let big = (1i64 << 60) + 1;
        lua.set_global("big", big).unwrap();
        assert_eq!(lua.get_global::<i64>("big").unwrap(), big);
        assert!(lua.eval::<bool>("return math.type(big) == 'integer'").unwrap());
    }

    #[test]
    fn test_narrow_integers_travel_as_floats() {
        let lua = Lua::new();
        lua.set_global("n", 6).unwrap();
        assert_eq!(lua.eval::<String>("return 'Res = ' .. n").unwrap(), "Res = 6.0");
    }

    #[test]
    fn test_string_read_keeps_number_slot() {
        let lua = Lua::new();
        lua.push(12.5).unwrap();
        assert_eq!(lua.read::<String>(-1).unwrap(), "12.5");
        assert_eq!(unsafe { ffi::lua_type(lua.as_ptr(), -1) }, ffi::LUA_TNUMBER);
    }

    #[test]
    fn test_mismatch_reports_kinds() {
        let lua = Lua::new();
        lua.exec("t = {}").unwrap();
        let err = lua.get_global::<f64>("t").unwrap_err();
        assert_eq!(err.to_string(), "number expected, got table");

        let err = lua.get_global::<bool>("missing").unwrap_err();
        assert_eq!(err.expected_kind(), Some("boolean"));
    }

    #[test]
    fn test_option_reads_nil_as_none() {
        let lua = Lua::new();
        assert_eq!(lua.get_global::<Option<String>>("missing").unwrap(), None);
        lua.set_global("name", Some("lua")).unwrap();
        assert_eq!(lua.get_global::<Option<String>>("name").unwrap().as_deref(), Some("lua"));
    }

    #[test]
    fn test_light_pointer_round_trip() {
        let lua = Lua::new();
        let mut target = 5u32;
        let ptr: *mut u32 = &mut target;
        lua.set_global("p", ptr).unwrap();
        assert_eq!(lua.get_global::<*mut u32>("p").unwrap(), ptr);
        assert_eq!(lua.get_global::<*const u32>("p").unwrap(), ptr as *const u32);
        assert_eq!(
            lua.get_global::<*mut u32>("missing").unwrap_err().expected_kind(),
            Some("light userdata")
        );
    }

    #[test]
    fn test_invalid_utf8_is_a_mismatch() {
        let lua = Lua::new();
        lua.exec(r#"bad = "\xff\xfe""#).unwrap();
        assert!(lua.get_global::<String>("bad").is_err());
    }
}
