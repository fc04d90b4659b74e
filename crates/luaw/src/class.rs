//! Class binding for registered native types
//!
//! [`Lua::register_type`] creates the type's metatable and its methods
//! table (published as the global `NAME`) and returns a [`ClassBuilder`]
//! used to populate them.

use std::any::TypeId;
use std::ffi::{c_void, CString};
use std::marker::PhantomData;
use std::os::raw::c_int;
use std::sync::Arc;

use mlua_sys as ffi;
use tracing::{debug, error, warn};

use crate::callback::{self, Callback, HostConstructor, HostFunction, HostMethod, HostMethodMut};
use crate::convert::{FromLua, ToLua};
use crate::error::{Error, Result};
use crate::operators::Operator;
use crate::stack::{self, StackGuard};
use crate::state::Lua;
use crate::userdata::{self, Checked, Inherits, NativePtr, PointerSafety, TypeDesc, Upcast, UserType};

// ============================================================================
// Metamethods
// ============================================================================

/// Metamethods that can be bound on a native type.
///
/// `__index`, `__newindex` and `__gc` are managed by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaMethod {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    IDiv,
    BAnd,
    BOr,
    BXor,
    BNot,
    Shl,
    Shr,
    Concat,
    Len,
    Eq,
    Lt,
    Le,
    Call,
    ToString,
    Close,
}

impl MetaMethod {
    /// Metatable field name.
    pub const fn name(self) -> &'static str {
        match self {
            MetaMethod::Add => "__add",
            MetaMethod::Sub => "__sub",
            MetaMethod::Mul => "__mul",
            MetaMethod::Div => "__div",
            MetaMethod::Mod => "__mod",
            MetaMethod::Pow => "__pow",
            MetaMethod::Unm => "__unm",
            MetaMethod::IDiv => "__idiv",
            MetaMethod::BAnd => "__band",
            MetaMethod::BOr => "__bor",
            MetaMethod::BXor => "__bxor",
            MetaMethod::BNot => "__bnot",
            MetaMethod::Shl => "__shl",
            MetaMethod::Shr => "__shr",
            MetaMethod::Concat => "__concat",
            MetaMethod::Len => "__len",
            MetaMethod::Eq => "__eq",
            MetaMethod::Lt => "__lt",
            MetaMethod::Le => "__le",
            MetaMethod::Call => "__call",
            MetaMethod::ToString => "__tostring",
            MetaMethod::Close => "__close",
        }
    }
}

/// Metatable fields never copied from a parent type.
const PRIVATE_FIELDS: [&str; 4] = ["__index", "__name", "__gc", "__metatable"];

// ============================================================================
// Registration
// ============================================================================

impl Lua {
    /// Registers `T` with checked pointer reads.
    pub fn register_type<T: UserType>(&self) -> Result<ClassBuilder<'_, T>> {
        self.register_type_with::<T, Checked>()
    }

    /// Registers `T` with the pointer policy `P`.
    ///
    /// Registering the same type again returns a builder whose additions
    /// are ignored. Registering a different type under an existing name
    /// fails with [`Error::TypeConflict`].
    pub fn register_type_with<T: UserType, P: PointerSafety>(&self) -> Result<ClassBuilder<'_, T>> {
        let name = CString::new(T::NAME)
            .map_err(|_| Error::InvalidKey(format!("type name {:?} contains NUL", T::NAME)))?;
        let state = self.as_ptr();
        let _guard = unsafe { StackGuard::new(state) };
        self.ensure_stack(6)?;

        unsafe {
            stack::push_str(state, T::NAME);
            if ffi::lua_rawget(state, ffi::LUA_REGISTRYINDEX) != ffi::LUA_TNIL {
                let existing = userdata::descriptor_at_table(state, -1);
                return match existing.as_ref() {
                    Some(desc) if desc.type_id == TypeId::of::<T>() => {
                        debug!(name = T::NAME, "type already registered");
                        Ok(ClassBuilder::inert(self))
                    }
                    _ => Err(Error::TypeConflict { name: T::NAME }),
                };
            }
            ffi::lua_pop(state, 1);
        }

        let desc = Arc::new(TypeDesc::new::<T>(P::VERIFY));
        unsafe {
            ffi::luaL_newmetatable(state, name.as_ptr());
            ffi::lua_pushlightuserdata(state, Arc::as_ptr(&desc) as *mut c_void);
            ffi::lua_rawsetp(state, -2, userdata::type_key());
            if std::mem::needs_drop::<T>() {
                stack::push_str(state, "__gc");
                ffi::lua_pushcfunction(state, userdata::finalize::<T>);
                ffi::lua_rawset(state, -3);
            }

            // mt.__index = methods, and the global NAME = methods
            ffi::lua_createtable(state, 0, 0);
            stack::push_str(state, "__index");
            ffi::lua_pushvalue(state, -2);
            ffi::lua_rawset(state, -4);
            ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS);
            stack::push_str(state, T::NAME);
            ffi::lua_pushvalue(state, -3);
            ffi::lua_rawset(state, -3);
        }
        self.shared().insert_type(Arc::clone(&desc));

        debug!(name = T::NAME, verify = P::VERIFY, "registered native type");
        Ok(ClassBuilder {
            lua: self,
            desc: Some(desc),
            error: None,
            _marker: PhantomData,
        })
    }
}

// ============================================================================
// ClassBuilder
// ============================================================================

#[derive(Clone, Copy)]
enum Target {
    Methods,
    Metatable,
}

/// Populates the methods table and metatable of a registered type.
///
/// Additions are infallible in practice; the first failure, if any, is
/// kept and reported by [`ClassBuilder::finish`].
pub struct ClassBuilder<'lua, T: UserType> {
    lua: &'lua Lua,
    /// `None` when the type was already registered
    desc: Option<Arc<TypeDesc>>,
    error: Option<Error>,
    _marker: PhantomData<fn() -> T>,
}

impl<'lua, T: UserType> ClassBuilder<'lua, T> {
    fn inert(lua: &'lua Lua) -> Self {
        ClassBuilder {
            lua,
            desc: None,
            error: None,
            _marker: PhantomData,
        }
    }

    /// Whether this builder created the registration.
    pub fn is_new(&self) -> bool {
        self.desc.is_some()
    }

    fn install(&mut self, target: Target, name: &str, callback: Callback) {
        if self.desc.is_none() {
            warn!(type_name = T::NAME, name, "ignoring addition to existing registration");
            return;
        }
        if let Err(err) = self.try_install(target, name, callback) {
            error!(type_name = T::NAME, name, %err, "could not bind member");
            self.error.get_or_insert(err);
        }
    }

    fn try_install(&self, target: Target, name: &str, callback: Callback) -> Result<()> {
        let state = self.lua.as_ptr();
        let _guard = unsafe { StackGuard::new(state) };
        userdata::push_metatable::<T>(self.lua)?;
        self.lua.ensure_stack(3)?;
        unsafe {
            if let Target::Methods = target {
                stack::push_str(state, "__index");
                ffi::lua_rawget(state, -2);
            }
            stack::push_str(state, name);
        }
        callback.push(self.lua)?;
        unsafe { ffi::lua_rawset(state, -3) };
        Ok(())
    }

    /// Binds `NAME.new(...)`.
    pub fn add_constructor<F, A>(mut self, constructor: F) -> Self
    where
        F: HostConstructor<T, A>,
    {
        let callback = Callback::new(move |lua| {
            let value = constructor.construct(lua, 1)?;
            userdata::push_native(lua, value)?;
            Ok(1)
        });
        self.install(Target::Methods, "new", callback);
        self
    }

    /// Binds `NAME.new(...)`, falling back to `T::default()` when called
    /// without arguments.
    pub fn add_custom_and_default_constructors<F, A>(mut self, constructor: F) -> Self
    where
        F: HostConstructor<T, A>,
        T: Default,
    {
        let callback = Callback::new(move |lua| {
            let value = if lua.top() == 0 {
                T::default()
            } else {
                constructor.construct(lua, 1)?
            };
            userdata::push_native(lua, value)?;
            Ok(1)
        });
        self.install(Target::Methods, "new", callback);
        self
    }

    /// Binds `obj:name(...)` with a shared receiver.
    pub fn add_method<M, A>(mut self, name: &str, method: M) -> Self
    where
        M: HostMethod<T, A>,
    {
        self.install(Target::Methods, name, method_callback(method));
        self
    }

    /// Binds `obj:name(...)` with a mutable receiver.
    pub fn add_method_mut<M, A>(mut self, name: &str, method: M) -> Self
    where
        M: HostMethodMut<T, A>,
    {
        self.install(Target::Methods, name, method_mut_callback(method));
        self
    }

    /// Binds a metamethod; the receiver must be the first operand.
    pub fn add_metamethod<M, A>(mut self, event: MetaMethod, method: M) -> Self
    where
        M: HostMethod<T, A>,
    {
        self.install(Target::Metatable, event.name(), method_callback(method));
        self
    }

    /// Binds a metamethod with a mutable receiver.
    pub fn add_metamethod_mut<M, A>(mut self, event: MetaMethod, method: M) -> Self
    where
        M: HostMethodMut<T, A>,
    {
        self.install(Target::Metatable, event.name(), method_mut_callback(method));
        self
    }

    /// Binds a field accessor: `obj:name()` reads, `obj:name(v)` writes.
    pub fn add_member<V, P>(mut self, name: &str, project: P) -> Self
    where
        P: Fn(&mut T) -> &mut V + 'static,
        V: ToLua + FromLua + Clone + 'static,
    {
        let callback = Callback::new(move |lua| {
            let this = lua.read_argument::<NativePtr<T>>(1)?;
            if lua.top() >= 2 {
                let value = lua.read_argument::<V>(2)?;
                let _borrow = this.borrow_mut()?;
                *project(unsafe { this.as_mut() }) = value;
                Ok(0)
            } else {
                // The projection needs `&mut T`, so reads are exclusive too.
                let _borrow = this.borrow_mut()?;
                let value = project(unsafe { this.as_mut() }).clone();
                value.push(lua)?;
                Ok(1)
            }
        });
        self.install(Target::Methods, name, callback);
        self
    }

    /// Binds `NAME.name(...)`, callable without an instance.
    pub fn add_static_method<F, A>(mut self, name: &str, function: F) -> Self
    where
        F: HostFunction<A>,
    {
        self.install(Target::Methods, name, callback::boxed_function(function));
        self
    }

    /// Binds operators found by [`crate::detected_operators!`].
    pub fn add_detected_operators<I>(mut self, operators: I) -> Self
    where
        I: IntoIterator<Item = Operator<T>>,
    {
        for operator in operators {
            let (event, callback) = operator.into_parts();
            self.install(Target::Metatable, event.name(), callback);
        }
        self
    }

    /// Declares `P` as a parent type.
    ///
    /// Methods missing on `T` are looked up on `P` (and its parents) at call
    /// time. Metamethods of `P` that `T` lacks are copied now. Objects of
    /// type `T` are accepted wherever a `P` is read.
    pub fn add_parent_type<P: UserType>(self) -> Result<Self>
    where
        T: Inherits<P>,
    {
        let Some(desc) = self.desc.clone() else {
            return Ok(self);
        };
        let parent = self
            .lua
            .shared()
            .type_desc(TypeId::of::<P>())
            .ok_or(Error::UnregisteredType(P::NAME))?;
        if parent.reaches(desc.type_id) {
            return Err(Error::TypeConflict { name: P::NAME });
        }

        self.link_parent::<P>()?;
        desc.add_parent(Upcast::new::<T, P>(parent));
        debug!(type_name = T::NAME, parent = P::NAME, "added parent type");
        Ok(self)
    }

    fn link_parent<P: UserType>(&self) -> Result<()> {
        let lua = self.lua;
        let state = lua.as_ptr();
        let _guard = unsafe { StackGuard::new(state) };
        userdata::push_metatable::<T>(lua)?;
        userdata::push_metatable::<P>(lua)?;
        lua.ensure_stack(6)?;
        let (child_mt, parent_mt) = (lua.top() - 1, lua.top());

        unsafe {
            // methods lookup falls through to every parent's methods table
            stack::push_str(state, "__index");
            ffi::lua_rawget(state, child_mt);
            let methods = lua.top();
            if ffi::lua_getmetatable(state, methods) == 0 {
                ffi::lua_createtable(state, 1, 1);
                stack::push_str(state, "__index");
                ffi::lua_pushvalue(state, -2);
                ffi::lua_pushcclosure(state, index_parents, 1);
                ffi::lua_rawset(state, -3);
                ffi::lua_pushvalue(state, -1);
                ffi::lua_setmetatable(state, methods);
            }
            let parents = lua.top();
            stack::push_str(state, "__index");
            ffi::lua_rawget(state, parent_mt);
            let next = ffi::lua_rawlen(state, parents) as ffi::lua_Integer + 1;
            ffi::lua_rawseti(state, parents, next);

            ffi::lua_pushnil(state);
            while ffi::lua_next(state, parent_mt) != 0 {
                if copies_from_parent(state) {
                    ffi::lua_pushvalue(state, -2);
                    if ffi::lua_rawget(state, child_mt) == ffi::LUA_TNIL {
                        ffi::lua_pop(state, 1);
                        ffi::lua_pushvalue(state, -2);
                        ffi::lua_pushvalue(state, -2);
                        ffi::lua_rawset(state, child_mt);
                    } else {
                        ffi::lua_pop(state, 1);
                    }
                }
                ffi::lua_pop(state, 1);
            }
        }
        Ok(())
    }

    /// Reports the first binding failure, if any.
    pub fn finish(self) -> Result<()> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Whether the (key, value) pair on top of the stack is an inheritable
/// metamethod.
unsafe fn copies_from_parent(state: *mut ffi::lua_State) -> bool {
    if ffi::lua_type(state, -2) != ffi::LUA_TSTRING {
        return false;
    }
    let key = stack::copy_bytes(state, -2);
    key.starts_with(b"__") && !PRIVATE_FIELDS.iter().any(|field| field.as_bytes() == key.as_slice())
}

/// `__index` of a methods table with parents: (methods, key) -> value.
/// Upvalue 1 is the sequence of parent methods tables.
unsafe extern "C-unwind" fn index_parents(state: *mut ffi::lua_State) -> c_int {
    let count = ffi::lua_rawlen(state, ffi::lua_upvalueindex(1)) as ffi::lua_Integer;
    for i in 1..=count {
        ffi::lua_rawgeti(state, ffi::lua_upvalueindex(1), i);
        ffi::lua_pushvalue(state, 2);
        if ffi::lua_gettable(state, -2) != ffi::LUA_TNIL {
            return 1;
        }
        ffi::lua_pop(state, 2);
    }
    0
}

fn method_callback<T: UserType, A, M: HostMethod<T, A>>(method: M) -> Callback {
    Callback::new(move |lua| {
        let this = lua.read_argument::<NativePtr<T>>(1)?;
        method.call_method(lua, this)
    })
}

fn method_mut_callback<T: UserType, A, M: HostMethodMut<T, A>>(method: M) -> Callback {
    Callback::new(move |lua| {
        let this = lua.read_argument::<NativePtr<T>>(1)?;
        method.call_method_mut(lua, this)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Default, PartialEq, crate::UserType)]
    struct Point {
        x: f64,
        y: f64,
    }

    fn register_point(lua: &Lua) {
        lua.register_type::<Point>()
            .unwrap()
            .add_custom_and_default_constructors(|x: f64, y: f64| Point { x, y })
            .add_member("x", |p: &mut Point| &mut p.x)
            .add_member("y", |p: &mut Point| &mut p.y)
            .add_method("length", |p: &Point| (p.x * p.x + p.y * p.y).sqrt())
            .add_method_mut("scale", |p: &mut Point, k: f64| {
                p.x *= k;
                p.y *= k;
            })
            .add_static_method("origin", || Point::default())
            .add_metamethod(MetaMethod::ToString, |p: &Point| format!("({}, {})", p.x, p.y))
            .finish()
            .unwrap();
    }

    #[test]
    fn test_metamethod_names() {
        assert_eq!(MetaMethod::Add.name(), "__add");
        assert_eq!(MetaMethod::ToString.name(), "__tostring");
        assert_eq!(MetaMethod::IDiv.name(), "__idiv");
    }

    #[test]
    fn test_constructors() {
        let lua = Lua::new();
        register_point(&lua);
        lua.exec("a = Point.new(3, 4) b = Point.new()").unwrap();
        assert_eq!(lua.get_global::<Point>("a").unwrap(), Point { x: 3.0, y: 4.0 });
        assert_eq!(lua.get_global::<Point>("b").unwrap(), Point::default());
    }

    #[test]
    fn test_methods_and_members() {
        let lua = Lua::new();
        register_point(&lua);
        lua.exec("p = Point.new(3, 4) len = p:length() p:scale(2) p:x(1)").unwrap();
        assert_eq!(lua.get_global::<f64>("len").unwrap(), 5.0);
        assert_eq!(lua.get_global::<Point>("p").unwrap(), Point { x: 1.0, y: 8.0 });
        assert_eq!(lua.eval::<f64>("return p:y()").unwrap(), 8.0);
        assert_eq!(lua.eval::<String>("return tostring(p)").unwrap(), "(1, 8)");
        assert_eq!(lua.eval::<f64>("return Point.origin():x()").unwrap(), 0.0);
    }

    #[test]
    fn test_reregistration_is_inert() {
        let lua = Lua::new();
        register_point(&lua);
        let builder = lua.register_type::<Point>().unwrap();
        assert!(!builder.is_new());
        builder.add_method("length", |_: &Point| 0.0).finish().unwrap();
        assert_eq!(lua.eval::<f64>("return Point.new(3, 4):length()").unwrap(), 5.0);
    }

    #[test]
    fn test_name_conflict() {
        #[derive(crate::UserType)]
        #[luaw(name = "Point")]
        struct Impostor;

        let lua = Lua::new();
        register_point(&lua);
        assert!(matches!(
            lua.register_type::<Impostor>(),
            Err(Error::TypeConflict { name: "Point" })
        ));
    }
}
