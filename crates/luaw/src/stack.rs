//! Stack bookkeeping shared by the codec and the handles

use std::os::raw::c_int;

use mlua_sys as ffi;

/// Restores the stack top when dropped.
///
/// Only used on host-side entry paths; never alive while the interpreter
/// may raise an error through a native frame.
pub(crate) struct StackGuard {
    state: *mut ffi::lua_State,
    top: c_int,
}

impl StackGuard {
    /// # Safety
    /// `state` must stay valid for the guard's lifetime.
    pub(crate) unsafe fn new(state: *mut ffi::lua_State) -> Self {
        Self {
            state,
            top: ffi::lua_gettop(state),
        }
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        unsafe {
            if ffi::lua_gettop(self.state) > self.top {
                ffi::lua_settop(self.state, self.top);
            }
        }
    }
}

/// Pushes a Rust string without requiring a NUL terminator.
///
/// # Safety
/// One free stack slot is required.
pub(crate) unsafe fn push_str(state: *mut ffi::lua_State, s: &str) {
    ffi::lua_pushlstring(state, s.as_ptr() as *const _, s.len());
}

/// Copies the string at `index` out of interpreter memory.
///
/// # Safety
/// The slot must hold a string (a number would be converted in place).
pub(crate) unsafe fn copy_bytes(state: *mut ffi::lua_State, index: c_int) -> Vec<u8> {
    let mut len = 0usize;
    let ptr = ffi::lua_tolstring(state, index, &mut len);
    if ptr.is_null() {
        return Vec::new();
    }
    std::slice::from_raw_parts(ptr as *const u8, len).to_vec()
}

/// Error object on top of the stack as text, popping it.
///
/// # Safety
/// The stack must not be empty.
pub(crate) unsafe fn pop_error_message(state: *mut ffi::lua_State) -> String {
    let message = match ffi::lua_type(state, -1) {
        ffi::LUA_TSTRING => String::from_utf8_lossy(&copy_bytes(state, -1)).into_owned(),
        ffi::LUA_TNUMBER => {
            ffi::lua_pushvalue(state, -1);
            let text = String::from_utf8_lossy(&copy_bytes(state, -1)).into_owned();
            ffi::lua_pop(state, 1);
            text
        }
        tp => {
            let name = std::ffi::CStr::from_ptr(ffi::lua_typename(state, tp));
            format!("(error object is a {} value)", name.to_string_lossy())
        }
    };
    ffi::lua_pop(state, 1);
    message
}
