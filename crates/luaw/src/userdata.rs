//! Native objects stored inside the interpreter
//!
//! A registered Rust type `T` travels by value: pushing a `T` moves it into a
//! fresh full userdata whose metatable identifies the type. Reading one back
//! either clones it (`T: Clone`) or yields a [`NativePtr<T>`] into the
//! interpreter-owned storage.
//!
//! Every metatable carries a pointer to the type's [`TypeDesc`], which is
//! what pointer reads check before handing out a typed pointer.
//!
//! Objects are stored behind a borrow flag. Bound methods, members and
//! operators take a shared or exclusive borrow of the receiver for the
//! duration of the call, so a script re-entering the same object while a
//! `&mut` is out fails with [`Error::AlreadyBorrowed`] instead of aliasing.

use std::any::TypeId;
use std::cell::Cell;
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::os::raw::{c_int, c_long};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use mlua_sys as ffi;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::convert::{FromLua, ToLua};
use crate::error::{Error, Result};
use crate::stack;
use crate::state::{registry_key, Lua};

static TYPE_KEY: u8 = 0;

// ============================================================================
// Traits
// ============================================================================

/// A Rust type that can be registered with an interpreter.
///
/// Usually derived with `#[derive(UserType)]`.
pub trait UserType: 'static {
    /// Registered name: the global namespace in scripts and the tag
    /// reported by `typeof` and in mismatch errors.
    const NAME: &'static str;
}

/// Declares `P` as a base of `Self` for method lookup and pointer reads.
pub trait Inherits<P: UserType>: UserType {
    fn parent(&self) -> &P;
    fn parent_mut(&mut self) -> &mut P;
}

/// How pointer reads of a registered type are validated.
pub trait PointerSafety: 'static {
    const VERIFY: bool;
}

/// Pointer reads check the object's type tag (the default).
#[derive(Debug)]
pub enum Checked {}

/// Pointer reads accept any full userdata as the requested type.
///
/// Objects of known derived types are still adjusted to the right base.
/// Anything else is reinterpreted as is, including finalized objects, so
/// only use this for types whose scripts are trusted.
#[derive(Debug)]
pub enum Unchecked {}

impl PointerSafety for Checked {
    const VERIFY: bool = true;
}

impl PointerSafety for Unchecked {
    const VERIFY: bool = false;
}

// ============================================================================
// Type descriptors
// ============================================================================

#[repr(C)]
#[allow(dead_code)]
union MaxAlign {
    number: f64,
    pointer: *const c_void,
    integer: i64,
    long: c_long,
}

/// Alignment the interpreter guarantees for userdata blocks.
pub(crate) const MAX_ALIGN: usize = std::mem::align_of::<MaxAlign>();

type UpcastFn = unsafe fn(*mut c_void) -> *mut c_void;

#[derive(Clone)]
pub(crate) struct Upcast {
    desc: Arc<TypeDesc>,
    cast: UpcastFn,
}

impl Upcast {
    pub(crate) fn new<T: Inherits<P>, P: UserType>(parent: Arc<TypeDesc>) -> Self {
        Upcast {
            desc: parent,
            cast: upcast_raw::<T, P>,
        }
    }
}

unsafe fn upcast_raw<T: Inherits<P>, P: UserType>(ptr: *mut c_void) -> *mut c_void {
    (*(ptr as *mut T)).parent_mut() as *mut P as *mut c_void
}

/// Per-type registration record, referenced from the type's metatable.
pub(crate) struct TypeDesc {
    pub(crate) name: &'static str,
    pub(crate) type_id: TypeId,
    pub(crate) verify: bool,
    /// Offset of the object inside its [`Slot`].
    value_offset: usize,
    parents: Mutex<Vec<Upcast>>,
}

impl TypeDesc {
    pub(crate) fn new<T: UserType>(verify: bool) -> Self {
        TypeDesc {
            name: T::NAME,
            type_id: TypeId::of::<T>(),
            verify,
            value_offset: std::mem::offset_of!(Slot<T>, value),
            parents: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_parent(&self, upcast: Upcast) {
        self.parents.lock().push(upcast);
    }

    /// Whether `target` is this type or one of its ancestors.
    pub(crate) fn reaches(&self, target: TypeId) -> bool {
        if self.type_id == target {
            return true;
        }
        let parents = self.parents.lock().clone();
        parents.iter().any(|parent| parent.desc.reaches(target))
    }

    /// Address of the `target` view of the object at `ptr`, if `target`
    /// is this type or an ancestor.
    ///
    /// # Safety
    /// `ptr` must point to a live object of this descriptor's type.
    pub(crate) unsafe fn upcast(&self, target: TypeId, ptr: *mut c_void) -> Option<*mut c_void> {
        if self.type_id == target {
            return Some(ptr);
        }
        let parents = self.parents.lock().clone();
        parents
            .iter()
            .find_map(|parent| parent.desc.upcast(target, (parent.cast)(ptr)))
    }
}

impl fmt::Debug for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDesc")
            .field("name", &self.name)
            .field("verify", &self.verify)
            .field("parents", &self.parents.lock().len())
            .finish()
    }
}

/// Key under which a metatable stores its descriptor pointer.
pub(crate) fn type_key() -> *const c_void {
    registry_key(&TYPE_KEY)
}

/// Descriptor of the value at `index`, or null when it carries none.
///
/// # Safety
/// Two free stack slots are required.
pub(crate) unsafe fn descriptor_at(state: *mut ffi::lua_State, index: c_int) -> *const TypeDesc {
    if ffi::lua_getmetatable(state, index) == 0 {
        return ptr::null();
    }
    let desc = descriptor_at_table(state, -1);
    ffi::lua_pop(state, 1);
    desc
}

/// Descriptor stored in the metatable at `index`, or null.
///
/// # Safety
/// One free stack slot is required.
pub(crate) unsafe fn descriptor_at_table(state: *mut ffi::lua_State, index: c_int) -> *const TypeDesc {
    if ffi::lua_type(state, index) != ffi::LUA_TTABLE {
        return ptr::null();
    }
    let desc = if ffi::lua_rawgetp(state, index, type_key()) == ffi::LUA_TLIGHTUSERDATA {
        ffi::lua_touserdata(state, -1) as *const TypeDesc
    } else {
        ptr::null()
    };
    ffi::lua_pop(state, 1);
    desc
}

/// Pushes the metatable registered for `T`.
pub(crate) fn push_metatable<T: UserType>(lua: &Lua) -> Result<()> {
    lua.ensure_stack(2)?;
    let state = lua.as_ptr();
    unsafe {
        stack::push_str(state, T::NAME);
        if ffi::lua_rawget(state, ffi::LUA_REGISTRYINDEX) != ffi::LUA_TTABLE {
            ffi::lua_pop(state, 1);
            return Err(Error::UnregisteredType(T::NAME));
        }
        let desc = descriptor_at_table(state, -1);
        if desc.as_ref().map_or(true, |desc| desc.type_id != TypeId::of::<T>()) {
            ffi::lua_pop(state, 1);
            return Err(Error::TypeConflict { name: T::NAME });
        }
    }
    Ok(())
}

// ============================================================================
// Storage
// ============================================================================

/// Userdata block layout: the borrow flag first, then the object.
///
/// The flag counts shared borrows; `-1` marks an exclusive one.
#[repr(C)]
pub(crate) struct Slot<T> {
    borrow: Cell<isize>,
    value: T,
}

/// Moves `value` into a new userdata with `T`'s metatable.
pub(crate) fn push_native<T: UserType>(lua: &Lua, value: T) -> Result<()> {
    const {
        assert!(
            std::mem::align_of::<Slot<T>>() <= MAX_ALIGN,
            "native type is over-aligned for interpreter storage"
        )
    };

    push_metatable::<T>(lua)?;
    lua.ensure_stack(1)?;
    let state = lua.as_ptr();
    unsafe {
        let slot = ffi::lua_newuserdatauv(state, std::mem::size_of::<Slot<T>>(), 0) as *mut Slot<T>;
        ptr::write(
            slot,
            Slot {
                borrow: Cell::new(0),
                value,
            },
        );
        ffi::lua_rotate(state, -2, 1);
        ffi::lua_setmetatable(state, -2);
    }
    Ok(())
}

/// `__gc` for types with a destructor. Runs the destructor once and
/// detaches the metatable so later accesses fail the type check.
pub(crate) unsafe extern "C-unwind" fn finalize<T: UserType>(state: *mut ffi::lua_State) -> c_int {
    if ffi::lua_type(state, 1) != ffi::LUA_TUSERDATA {
        return 0;
    }
    let desc = descriptor_at(state, 1);
    if desc.as_ref().map_or(true, |desc| desc.type_id != TypeId::of::<T>()) {
        return 0;
    }

    let object = ffi::lua_touserdata(state, 1) as *mut Slot<T>;
    ffi::lua_pushnil(state);
    ffi::lua_setmetatable(state, 1);
    if catch_unwind(AssertUnwindSafe(|| ptr::drop_in_place(object))).is_err() {
        warn!(type_name = T::NAME, "destructor panicked");
    }
    trace!(type_name = T::NAME, "finalized native object");
    0
}

/// Typed pointer to the object at `index`, honouring the type's policy.
pub(crate) fn resolve<T: UserType>(lua: &Lua, index: c_int) -> Result<NativePtr<T>> {
    let state = lua.as_ptr();
    unsafe {
        if ffi::lua_type(state, index) != ffi::LUA_TUSERDATA {
            return Err(Error::mismatch(T::NAME, lua.kind_at(index)));
        }
        lua.ensure_stack(2)?;
        let raw = ffi::lua_touserdata(state, index);
        let target = TypeId::of::<T>();

        // Blocks without a descriptor are foreign or finalized: no flag.
        let desc = descriptor_at(state, index).as_ref();
        let (value, flag) = match desc {
            Some(desc) => (
                raw.cast::<u8>().add(desc.value_offset).cast::<c_void>(),
                NonNull::new(raw as *mut Cell<isize>),
            ),
            None => (raw, None),
        };

        if let Some(found) = desc.and_then(|desc| desc.upcast(target, value)) {
            return Ok(NativePtr::new(NonNull::new_unchecked(found as *mut T), flag));
        }

        let verify = lua.shared().type_desc(target).map_or(true, |desc| desc.verify);
        match NonNull::new(value as *mut T) {
            Some(found) if !verify => {
                trace!(type_name = T::NAME, "unchecked pointer read");
                Ok(NativePtr::new(found, flag))
            }
            _ => Err(Error::mismatch(T::NAME, lua.kind_at(index))),
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

impl<T: UserType> ToLua for T {
    fn push(self, lua: &Lua) -> Result<()> {
        push_native(lua, self)
    }
}

impl<T: UserType + Clone> FromLua for T {
    const KIND: &'static str = T::NAME;

    fn read(lua: &Lua, index: c_int) -> Result<Self> {
        let ptr = resolve::<T>(lua, index)?;
        let _borrow = ptr.borrow()?;
        Ok(unsafe { ptr.as_ref().clone() })
    }
}

/// Pointer to a native object owned by the interpreter.
///
/// Valid while the object is reachable from the interpreter; the borrow
/// accessors are `unsafe` because that lifetime is not tracked.
pub struct NativePtr<T> {
    ptr: NonNull<T>,
    flag: Option<NonNull<Cell<isize>>>,
    _marker: PhantomData<*mut T>,
}

impl<T: UserType> NativePtr<T> {
    fn new(ptr: NonNull<T>, flag: Option<NonNull<Cell<isize>>>) -> Self {
        NativePtr {
            ptr,
            flag,
            _marker: PhantomData,
        }
    }

    /// Marks the object as shared-borrowed until the guard drops.
    pub(crate) fn borrow(self) -> Result<BorrowGuard> {
        self.acquire(false)
    }

    /// Marks the object as exclusively borrowed until the guard drops.
    pub(crate) fn borrow_mut(self) -> Result<BorrowGuard> {
        self.acquire(true)
    }

    fn acquire(self, exclusive: bool) -> Result<BorrowGuard> {
        if let Some(flag) = self.flag {
            let flag = unsafe { flag.as_ref() };
            match (flag.get(), exclusive) {
                (0, true) => flag.set(-1),
                (n, false) if n >= 0 => flag.set(n + 1),
                _ => return Err(Error::AlreadyBorrowed(T::NAME)),
            }
        }
        Ok(BorrowGuard { flag: self.flag })
    }
}

impl<T> NativePtr<T> {
    pub fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// # Safety
    /// The object must stay alive and unaliased by `&mut` for `'a`.
    pub unsafe fn as_ref<'a>(self) -> &'a T {
        &*self.ptr.as_ptr()
    }

    /// # Safety
    /// The object must stay alive and otherwise unborrowed for `'a`.
    pub unsafe fn as_mut<'a>(self) -> &'a mut T {
        &mut *self.ptr.as_ptr()
    }
}

impl<T> Clone for NativePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NativePtr<T> {}

/// Releases a borrow taken through [`NativePtr`].
///
/// The object must outlive the guard; callers hold one only while the
/// object sits on the stack of the running call.
pub(crate) struct BorrowGuard {
    flag: Option<NonNull<Cell<isize>>>,
}

impl Drop for BorrowGuard {
    fn drop(&mut self) {
        if let Some(flag) = self.flag {
            let flag = unsafe { flag.as_ref() };
            flag.set(if flag.get() < 0 { 0 } else { flag.get() - 1 });
        }
    }
}

impl<T> PartialEq for NativePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> fmt::Debug for NativePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativePtr({:p})", self.ptr)
    }
}

impl<T: UserType> FromLua for NativePtr<T> {
    const KIND: &'static str = T::NAME;

    fn read(lua: &Lua, index: c_int) -> Result<Self> {
        resolve::<T>(lua, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, crate::UserType)]
    struct Counter {
        hits: u32,
    }

    #[derive(Clone, crate::UserType)]
    #[luaw(name = "Label")]
    struct Label(String);

    #[test]
    fn test_unregistered_push_fails() {
        let lua = Lua::new();
        let err = lua.set_global("c", Counter { hits: 0 }).unwrap_err();
        assert!(matches!(err, Error::UnregisteredType("Counter")));
    }

    #[test]
    fn test_value_round_trip() {
        let lua = Lua::new();
        lua.register_type::<Counter>().unwrap();
        lua.set_global("c", Counter { hits: 3 }).unwrap();
        assert_eq!(lua.get_global::<Counter>("c").unwrap(), Counter { hits: 3 });
        assert_eq!(lua.eval::<String>("return typeof(c)").unwrap(), "Counter");
    }

    #[test]
    fn test_pointer_reads_shared_storage() {
        let lua = Lua::new();
        lua.register_type::<Counter>().unwrap();
        lua.set_global("c", Counter { hits: 1 }).unwrap();

        let ptr = lua.get_global::<NativePtr<Counter>>("c").unwrap();
        unsafe { ptr.as_mut().hits = 9 };
        assert_eq!(lua.get_global::<Counter>("c").unwrap().hits, 9);
    }

    #[test]
    fn test_borrow_flag_tracks_guards() {
        let lua = Lua::new();
        lua.register_type::<Counter>().unwrap();
        lua.set_global("c", Counter { hits: 0 }).unwrap();
        let ptr = lua.get_global::<NativePtr<Counter>>("c").unwrap();

        let first = ptr.borrow().unwrap();
        let second = ptr.borrow().unwrap();
        assert!(matches!(ptr.borrow_mut(), Err(Error::AlreadyBorrowed("Counter"))));
        drop(first);
        drop(second);

        let exclusive = ptr.borrow_mut().unwrap();
        assert!(ptr.borrow().is_err());
        assert!(lua.get_global::<Counter>("c").is_err());
        drop(exclusive);
        assert_eq!(lua.get_global::<Counter>("c").unwrap().hits, 0);
    }

    #[test]
    fn test_checked_read_rejects_other_types() {
        let lua = Lua::new();
        lua.register_type::<Counter>().unwrap();
        lua.register_type::<Label>().unwrap();
        lua.set_global("l", Label("x".into())).unwrap();

        let err = lua.get_global::<NativePtr<Counter>>("l").unwrap_err();
        assert_eq!(err.to_string(), "Counter expected, got Label");
    }

    #[test]
    fn test_unchecked_read_accepts_any_userdata() {
        #[derive(Clone, crate::UserType)]
        struct Raw(u64);

        let lua = Lua::new();
        lua.register_type_with::<Raw, Unchecked>().unwrap();
        lua.register_type::<Counter>().unwrap();
        lua.set_global("c", Counter { hits: 4 }).unwrap();

        assert!(lua.get_global::<NativePtr<Raw>>("c").is_ok());
        assert!(lua.get_global::<NativePtr<Raw>>("missing").is_err());
    }

    #[test]
    fn test_destructor_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        #[derive(crate::UserType)]
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let lua = Lua::new();
        lua.register_type::<Tracked>().unwrap();
        lua.set_global("t", Tracked).unwrap();
        lua.exec("t = nil collectgarbage() collectgarbage()").unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        drop(lua);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_max_align_covers_common_types() {
        assert!(std::mem::align_of::<f64>() <= MAX_ALIGN);
        assert!(std::mem::align_of::<u64>() <= MAX_ALIGN);
        assert!(std::mem::align_of::<String>() <= MAX_ALIGN);
    }
}
