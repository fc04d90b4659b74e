//! luaw - typed bridge to an embedded Lua interpreter
//!
//! Exchanges values between Rust and Lua 5.4 scripts: scalars and strings by
//! value, tables and functions through shared handles, Rust closures as
//! script-callable functions, and registered Rust types as script objects
//! with constructors, methods, fields, operators and inheritance.
//!
//! # Example
//!
//! ```ignore
//! use luaw::{Lua, Table, UserType};
//!
//! #[derive(Clone, Default, UserType)]
//! struct Point {
//!     x: f64,
//!     y: f64,
//! }
//!
//! let lua = Lua::new();
//! lua.register_function("add2", |a: f64, b: f64| (a + b) * 2.0)?;
//! lua.register_type::<Point>()?
//!     .add_custom_and_default_constructors(|x: f64, y: f64| Point { x, y })
//!     .add_member("x", |p: &mut Point| &mut p.x)
//!     .add_method("len", |p: &Point| (p.x * p.x + p.y * p.y).sqrt())
//!     .finish()?;
//!
//! lua.exec("t = { add2(1, 2), Point.new(3, 4):len() }")?;
//! let t: Table = lua.get_global("t")?;
//! assert_eq!(t.get::<_, f64>(2)?, 5.0);
//! ```
//!
//! # Threads
//!
//! A [`Lua`] stays on the thread that created it. [`Table`] and
//! [`Function`] handles are `Send + Sync` so they can be stored anywhere,
//! but using one off that thread fails with [`Error::WrongThread`];
//! dropping one there is deferred until the interpreter is next entered.

// Lets `#[derive(UserType)]` name `::luaw` from inside this crate.
extern crate self as luaw;

mod callback;
mod class;
mod convert;
mod error;
mod function;
mod libs;
pub mod operators;
mod options;
mod reference;
mod stack;
mod state;
mod table;
mod userdata;
mod value;

pub use callback::{HostConstructor, HostFunction, HostMethod, HostMethodMut, IntoReturn};
pub use class::{ClassBuilder, MetaMethod};
pub use convert::{FromLua, PushArgs, ToLua};
pub use error::{Error, Result};
pub use function::Function;
pub use libs::{library_names, StdLib};
pub use operators::Operator;
pub use options::LuaOptions;
pub use reference::{RefKey, Reference};
pub use state::Lua;
pub use table::{Table, TablePairs};
pub use userdata::{Checked, Inherits, NativePtr, PointerSafety, Unchecked, UserType};
pub use value::Value;

pub use luaw_derive::UserType;

/// Raw interpreter C API, for interop through [`Lua::as_ptr`].
pub use mlua_sys as ffi;
