//! Native call bridge
//!
//! Every host callable reaches the interpreter as a C closure over one
//! trampoline, [`call_callback`], whose single upvalue is a userdata owning
//! the boxed Rust closure. The trampoline rebuilds a [`Lua`] view, runs the
//! closure under `catch_unwind` and turns failures into interpreter errors.
//!
//! Raising an interpreter error unwinds with `longjmp`, so no value with a
//! destructor may be alive in the frame that raises. All Rust work happens
//! in [`invoke`]; the trampoline itself only holds plain integers.
//!
//! Argument errors go through `luaL_argerror`, which drops the receiver
//! from the count when the call site is `obj:method(...)`. Host-side
//! [`Error::BadArgument`] positions always count the receiver.

use std::any::Any;
use std::os::raw::c_int;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use mlua_sys as ffi;
use tracing::warn;

use crate::convert::{FromLua, ToLua};
use crate::error::{Error, Result};
use crate::stack;
use crate::state::{registry_key, Lua};
use crate::userdata::{NativePtr, UserType};

static CALLBACK_META_KEY: u8 = 0;

// ============================================================================
// Boxed callbacks
// ============================================================================

/// Type-erased host callable. Returns how many results it pushed.
pub(crate) struct Callback(Box<dyn Fn(&Lua) -> Result<c_int>>);

impl Callback {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: Fn(&Lua) -> Result<c_int> + 'static,
    {
        Callback(Box::new(f))
    }

    fn run(&self, lua: &Lua) -> Result<c_int> {
        catch_unwind(AssertUnwindSafe(|| (self.0)(lua))).unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            warn!(%message, "native function panicked");
            Err(Error::Panic(message))
        })
    }
}

impl ToLua for Callback {
    fn push(self, lua: &Lua) -> Result<()> {
        lua.ensure_stack(2)?;
        unsafe {
            let state = lua.as_ptr();
            let slot = ffi::lua_newuserdatauv(state, std::mem::size_of::<Option<Callback>>(), 0)
                as *mut Option<Callback>;
            ptr::write(slot, Some(self));
            ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, registry_key(&CALLBACK_META_KEY));
            ffi::lua_setmetatable(state, -2);
            ffi::lua_pushcclosure(state, call_callback, 1);
        }
        Ok(())
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Creates the metatable shared by every callback userdata.
///
/// # Safety
/// Two free stack slots are required.
pub(crate) unsafe fn install_metatable(state: *mut ffi::lua_State) {
    ffi::lua_createtable(state, 0, 2);
    stack::push_str(state, "__gc");
    ffi::lua_pushcfunction(state, drop_callback);
    ffi::lua_rawset(state, -3);
    stack::push_str(state, "__metatable");
    ffi::lua_pushboolean(state, 0);
    ffi::lua_rawset(state, -3);
    ffi::lua_rawsetp(state, ffi::LUA_REGISTRYINDEX, registry_key(&CALLBACK_META_KEY));
}

unsafe extern "C-unwind" fn drop_callback(state: *mut ffi::lua_State) -> c_int {
    let slot = ffi::lua_touserdata(state, 1) as *mut Option<Callback>;
    if let Some(callback) = slot.as_mut().and_then(Option::take) {
        if catch_unwind(AssertUnwindSafe(move || drop(callback))).is_err() {
            warn!("native function state panicked while dropping");
        }
    }
    0
}

// ============================================================================
// Trampoline
// ============================================================================

enum Raise {
    /// Message on top of the stack, raise as an argument error at this position
    Argument(c_int),
    /// Message on top of the stack, raise as is
    Error,
}

pub(crate) unsafe extern "C-unwind" fn call_callback(state: *mut ffi::lua_State) -> c_int {
    match invoke(state) {
        Ok(results) => results,
        Err(Raise::Argument(position)) => {
            ffi::luaL_argerror(state, position, ffi::lua_tostring(state, -1))
        }
        Err(Raise::Error) => ffi::lua_error(state),
    }
}

unsafe fn invoke(state: *mut ffi::lua_State) -> std::result::Result<c_int, Raise> {
    let result = match Lua::from_state(state) {
        Ok(lua) => {
            let slot = ffi::lua_touserdata(state, ffi::lua_upvalueindex(1)) as *const Option<Callback>;
            match slot.as_ref().and_then(Option::as_ref) {
                Some(callback) => callback.run(&lua),
                None => Err(Error::External("native function has been released".to_string())),
            }
        }
        Err(err) => Err(err),
    };
    result.map_err(|err| raise(state, err))
}

/// Leaves the error message on the stack and says how to raise it.
unsafe fn raise(state: *mut ffi::lua_State, err: Error) -> Raise {
    ffi::lua_checkstack(state, 3);
    match err {
        Error::BadArgument { position, cause } => {
            stack::push_str(state, &cause.to_string());
            Raise::Argument(position)
        }
        // Already carries the script position.
        Error::Runtime(message) => {
            stack::push_str(state, &message);
            Raise::Error
        }
        other => {
            ffi::luaL_where(state, 1);
            stack::push_str(state, &other.to_string());
            ffi::lua_concat(state, 2);
            Raise::Error
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Return values of host callables.
pub trait IntoReturn {
    /// Pushes the results, returning how many were pushed.
    fn push_return(self, lua: &Lua) -> Result<c_int>;
}

impl IntoReturn for () {
    fn push_return(self, _lua: &Lua) -> Result<c_int> {
        Ok(0)
    }
}

impl<T: ToLua> IntoReturn for T {
    fn push_return(self, lua: &Lua) -> Result<c_int> {
        self.push(lua)?;
        Ok(1)
    }
}

impl<R: IntoReturn> IntoReturn for Result<R> {
    fn push_return(self, lua: &Lua) -> Result<c_int> {
        self?.push_return(lua)
    }
}

// ============================================================================
// Host callables
// ============================================================================

/// Free functions and closures callable from scripts.
///
/// Implemented for `Fn(A1, .., An) -> R` with up to eight [`FromLua`]
/// arguments and an [`IntoReturn`] result.
pub trait HostFunction<Args>: 'static {
    /// Reads arguments starting at stack position `first` and runs.
    fn call(&self, lua: &Lua, first: c_int) -> Result<c_int>;
}

/// Constructors producing a `T` from script arguments.
pub trait HostConstructor<T, Args>: 'static {
    fn construct(&self, lua: &Lua, first: c_int) -> Result<T>;
}

/// Methods taking the receiver by shared reference.
pub trait HostMethod<T, Args>: 'static {
    fn call_method(&self, lua: &Lua, this: NativePtr<T>) -> Result<c_int>;
}

/// Methods taking the receiver by mutable reference.
pub trait HostMethodMut<T, Args>: 'static {
    fn call_method_mut(&self, lua: &Lua, this: NativePtr<T>) -> Result<c_int>;
}

macro_rules! host_callables {
    ($($arg:ident : $var:ident),*) => {
        impl<Func, Ret, $($arg,)*> HostFunction<($($arg,)*)> for Func
        where
            Func: Fn($($arg),*) -> Ret + 'static,
            Ret: IntoReturn,
            $($arg: FromLua,)*
        {
            #[allow(unused_variables, unused_mut, unused_assignments)]
            fn call(&self, lua: &Lua, first: c_int) -> Result<c_int> {
                let mut position = first;
                $(
                    let $var = lua.read_argument::<$arg>(position)?;
                    position += 1;
                )*
                (self)($($var),*).push_return(lua)
            }
        }

        impl<Func, T, $($arg,)*> HostConstructor<T, ($($arg,)*)> for Func
        where
            Func: Fn($($arg),*) -> T + 'static,
            $($arg: FromLua,)*
        {
            #[allow(unused_variables, unused_mut, unused_assignments)]
            fn construct(&self, lua: &Lua, first: c_int) -> Result<T> {
                let mut position = first;
                $(
                    let $var = lua.read_argument::<$arg>(position)?;
                    position += 1;
                )*
                Ok((self)($($var),*))
            }
        }

        impl<Func, Ret, T: UserType, $($arg,)*> HostMethod<T, ($($arg,)*)> for Func
        where
            Func: Fn(&T, $($arg),*) -> Ret + 'static,
            Ret: IntoReturn,
            $($arg: FromLua,)*
        {
            #[allow(unused_variables, unused_mut, unused_assignments)]
            fn call_method(&self, lua: &Lua, this: NativePtr<T>) -> Result<c_int> {
                let mut position = 2;
                $(
                    let $var = lua.read_argument::<$arg>(position)?;
                    position += 1;
                )*
                // Arguments are read before the receiver is borrowed.
                let _borrow = this.borrow()?;
                let this = unsafe { this.as_ref() };
                (self)(this, $($var),*).push_return(lua)
            }
        }

        impl<Func, Ret, T: UserType, $($arg,)*> HostMethodMut<T, ($($arg,)*)> for Func
        where
            Func: Fn(&mut T, $($arg),*) -> Ret + 'static,
            Ret: IntoReturn,
            $($arg: FromLua,)*
        {
            #[allow(unused_variables, unused_mut, unused_assignments)]
            fn call_method_mut(&self, lua: &Lua, this: NativePtr<T>) -> Result<c_int> {
                let mut position = 2;
                $(
                    let $var = lua.read_argument::<$arg>(position)?;
                    position += 1;
                )*
                let _borrow = this.borrow_mut()?;
                let this = unsafe { this.as_mut() };
                (self)(this, $($var),*).push_return(lua)
            }
        }
    };
}

host_callables!();
host_callables!(A: a);
host_callables!(A: a, B: b);
host_callables!(A: a, B: b, C: c);
host_callables!(A: a, B: b, C: c, D: d);
host_callables!(A: a, B: b, C: c, D: d, E: e);
host_callables!(A: a, B: b, C: c, D: d, E: e, F: f);
host_callables!(A: a, B: b, C: c, D: d, E: e, F: f, G: g);
host_callables!(A: a, B: b, C: c, D: d, E: e, F: f, G: g, H: h);

pub(crate) fn boxed_function<F, A>(function: F) -> Callback
where
    F: HostFunction<A>,
{
    Callback::new(move |lua| function.call(lua, 1))
}
