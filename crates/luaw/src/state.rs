//! Interpreter ownership and host-side entry points
//!
//! A [`Lua`] either owns its interpreter (created by [`Lua::new`]) or is a
//! borrowed view over one that something else owns ([`Lua::init`], and the
//! views handed to native callbacks). Bridge state shared with handles lives
//! in [`Shared`], anchored inside the interpreter so that it lives exactly as
//! long as the interpreter does.

use std::any::TypeId;
use std::ffi::{c_void, CStr, CString};
use std::fmt;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use mlua_sys as ffi;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::callback::{self, HostFunction};
use crate::convert::{FromLua, PushArgs, ToLua};
use crate::error::{Error, Result};
use crate::function::Function;
use crate::libs::{self, StdLib};
use crate::options::LuaOptions;
use crate::reference::{RefKey, Reference};
use crate::stack::{self, StackGuard};
use crate::table::Table;
use crate::userdata::TypeDesc;

// ============================================================================
// Registry keys
// ============================================================================

static SHARED_KEY: u8 = 0;
static HANDLES_KEY: u8 = 0;
static AUX_KEY: u8 = 0;

/// Light-userdata registry key derived from a static's address.
pub(crate) fn registry_key(key: &'static u8) -> *const c_void {
    key as *const u8 as *const c_void
}

/// Key of the hidden table that holds every captured handle.
pub(crate) fn handles_key() -> *const c_void {
    registry_key(&HANDLES_KEY)
}

// ============================================================================
// Shared bridge state
// ============================================================================

/// Per-interpreter bridge state reachable from handles and callbacks.
pub(crate) struct Shared {
    main: *mut ffi::lua_State,
    /// Private thread used to clear handle slots without touching the
    /// stack of whatever thread is currently running.
    aux: *mut ffi::lua_State,
    owner: ThreadId,
    closed: AtomicBool,
    next_key: AtomicI64,
    pending: Mutex<Vec<RefKey>>,
    types: Mutex<FxHashMap<TypeId, Arc<TypeDesc>>>,
}

// SAFETY: `main` and `aux` are only dereferenced on the owner thread, which
// `view` and `release` check; the remaining fields are synchronised.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    pub(crate) fn next_key(&self) -> RefKey {
        RefKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Non-owning view on the main thread, for handle operations.
    pub(crate) fn view(self: &Arc<Self>) -> Result<Lua> {
        if self.is_closed() {
            return Err(Error::StateClosed);
        }
        if thread::current().id() != self.owner {
            return Err(Error::WrongThread);
        }
        self.drain_pending();
        Ok(Lua {
            raw: self.main,
            shared: Arc::clone(self),
            owned: false,
        })
    }

    /// Clears a handle slot now, or later if called off the owner thread.
    pub(crate) fn release(&self, key: RefKey) {
        if self.is_closed() {
            return;
        }
        if thread::current().id() == self.owner {
            unsafe { clear_slot(self.aux, key) };
        } else {
            self.pending.lock().push(key);
            trace!(%key, "deferred handle release");
        }
    }

    pub(crate) fn drain_pending(&self) {
        let keys = std::mem::take(&mut *self.pending.lock());
        if keys.is_empty() || self.is_closed() {
            return;
        }
        trace!(count = keys.len(), "releasing deferred handles");
        for key in keys {
            unsafe { clear_slot(self.aux, key) };
        }
    }

    pub(crate) fn type_desc(&self, id: TypeId) -> Option<Arc<TypeDesc>> {
        self.types.lock().get(&id).cloned()
    }

    pub(crate) fn insert_type(&self, desc: Arc<TypeDesc>) {
        self.types.lock().insert(desc.type_id, desc);
    }
}

unsafe fn clear_slot(aux: *mut ffi::lua_State, key: RefKey) {
    ffi::lua_rawgetp(aux, ffi::LUA_REGISTRYINDEX, handles_key());
    ffi::lua_pushnil(aux);
    ffi::lua_rawseti(aux, -2, key.0);
    ffi::lua_pop(aux, 1);
}

unsafe fn shared_of(state: *mut ffi::lua_State) -> Option<Arc<Shared>> {
    ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, registry_key(&SHARED_KEY));
    let slot = ffi::lua_touserdata(state, -1) as *const Option<Arc<Shared>>;
    let shared = slot.as_ref().and_then(Option::clone);
    ffi::lua_pop(state, 1);
    shared
}

/// `__gc` of the userdata anchoring [`Shared`]; runs when the interpreter closes.
unsafe extern "C-unwind" fn release_shared(state: *mut ffi::lua_State) -> c_int {
    let slot = ffi::lua_touserdata(state, 1) as *mut Option<Arc<Shared>>;
    if let Some(shared) = slot.as_mut().and_then(Option::take) {
        shared.closed.store(true, Ordering::Release);
    }
    0
}

// ============================================================================
// Lua
// ============================================================================

/// Handle on an interpreter with the bridge installed.
///
/// Not `Send`: an interpreter is driven from the thread that created it.
/// [`Table`] and [`Function`] handles may travel to other threads, but only
/// their release is honoured there.
pub struct Lua {
    raw: *mut ffi::lua_State,
    shared: Arc<Shared>,
    owned: bool,
}

impl Lua {
    /// Fresh interpreter with every library and the `typeof` helper.
    pub fn new() -> Self {
        Self::with_options(LuaOptions::default())
    }

    /// Fresh interpreter configured by `options`.
    pub fn with_options(options: LuaOptions) -> Self {
        let raw = unsafe { ffi::luaL_newstate() };
        if raw.is_null() {
            std::alloc::handle_alloc_error(std::alloc::Layout::new::<usize>());
        }

        let lua = unsafe { Self::attach(raw, true) };
        lua.open_libraries(options.libraries);
        if options.typeof_function {
            lua.install_typeof();
        }
        debug!(
            libraries = ?libs::library_names(options.libraries),
            typeof_function = options.typeof_function,
            "created interpreter"
        );
        lua
    }

    /// Installs the bridge on an interpreter owned elsewhere.
    ///
    /// Calling this again on the same interpreter reuses the existing bridge
    /// state. The returned view never closes the interpreter.
    ///
    /// # Safety
    /// `raw` must be a valid interpreter that outlives every use of the
    /// returned value, driven only from the current thread.
    pub unsafe fn init(raw: *mut ffi::lua_State) -> Self {
        Self::attach(raw, false)
    }

    unsafe fn attach(raw: *mut ffi::lua_State, owned: bool) -> Self {
        if let Some(shared) = shared_of(raw) {
            trace!("bridge already installed");
            return Lua { raw, shared, owned };
        }

        ffi::lua_checkstack(raw, 4);

        ffi::lua_rawgeti(raw, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_MAINTHREAD);
        let main = ffi::lua_tothread(raw, -1);
        ffi::lua_pop(raw, 1);

        ffi::lua_createtable(raw, 0, 0);
        ffi::lua_rawsetp(raw, ffi::LUA_REGISTRYINDEX, handles_key());

        let aux = ffi::lua_newthread(raw);
        ffi::lua_rawsetp(raw, ffi::LUA_REGISTRYINDEX, registry_key(&AUX_KEY));

        callback::install_metatable(raw);

        let shared = Arc::new(Shared {
            main,
            aux,
            owner: thread::current().id(),
            closed: AtomicBool::new(false),
            next_key: AtomicI64::new(1),
            pending: Mutex::new(Vec::new()),
            types: Mutex::new(FxHashMap::default()),
        });

        let slot = ffi::lua_newuserdatauv(raw, std::mem::size_of::<Option<Arc<Shared>>>(), 0)
            as *mut Option<Arc<Shared>>;
        ptr::write(slot, Some(Arc::clone(&shared)));
        ffi::lua_createtable(raw, 0, 1);
        stack::push_str(raw, "__gc");
        ffi::lua_pushcfunction(raw, release_shared);
        ffi::lua_rawset(raw, -3);
        ffi::lua_setmetatable(raw, -2);
        ffi::lua_rawsetp(raw, ffi::LUA_REGISTRYINDEX, registry_key(&SHARED_KEY));

        debug!(owned, "bridge installed");
        Lua { raw, shared, owned }
    }

    /// View over the thread a native callback was invoked on.
    pub(crate) unsafe fn from_state(state: *mut ffi::lua_State) -> Result<Self> {
        let shared = shared_of(state).ok_or(Error::NotInitialized)?;
        shared.drain_pending();
        Ok(Lua {
            raw: state,
            shared,
            owned: false,
        })
    }

    /// Raw interpreter pointer, for interop with other C API users.
    pub fn as_ptr(&self) -> *mut ffi::lua_State {
        self.raw
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Opens the selected standard libraries.
    pub fn open_libraries(&self, libraries: StdLib) {
        unsafe { libs::open(self.raw, libraries) };
    }

    pub(crate) fn ensure_stack(&self, extra: c_int) -> Result<()> {
        if unsafe { ffi::lua_checkstack(self.raw, extra) } == 0 {
            return Err(Error::StackOverflow(extra));
        }
        Ok(())
    }

    // ========================================================================
    // Stack access
    // ========================================================================

    /// Number of values on the stack.
    pub fn top(&self) -> c_int {
        unsafe { ffi::lua_gettop(self.raw) }
    }

    /// Pops up to `n` values.
    pub fn pop(&self, n: c_int) {
        let n = n.clamp(0, self.top());
        unsafe { ffi::lua_pop(self.raw, n) };
    }

    /// Removes the value at `index`, shifting the ones above it down.
    /// Out-of-range indices are ignored.
    pub fn remove(&self, index: c_int) {
        let top = self.top();
        let index = if index < 0 { top + index + 1 } else { index };
        if index >= 1 && index <= top {
            unsafe { ffi::lua_remove(self.raw, index) };
        }
    }

    /// Pushes a host value.
    pub fn push<T: ToLua>(&self, value: T) -> Result<()> {
        value.push(self)
    }

    /// Reads the value at `index` (negative indices count from the top).
    ///
    /// Index 0 and indices outside `1..=top` hold no value.
    pub fn read<T: FromLua>(&self, index: c_int) -> Result<T> {
        let top = self.top();
        let index = if index < 0 { top + index + 1 } else { index };
        if index < 1 || index > top {
            return Err(Error::mismatch(T::KIND, "no value"));
        }
        T::read(self, index)
    }

    pub(crate) fn read_argument<T: FromLua>(&self, position: c_int) -> Result<T> {
        T::read(self, position).map_err(|err| err.at_argument(position))
    }

    /// Kind name of the slot at `index`, as used in mismatch errors.
    pub(crate) fn kind_at(&self, index: c_int) -> String {
        unsafe {
            let tp = ffi::lua_type(self.raw, index);
            if tp == ffi::LUA_TNONE {
                return "no value".to_string();
            }
            if tp == ffi::LUA_TUSERDATA && ffi::lua_checkstack(self.raw, 2) != 0 {
                let index = ffi::lua_absindex(self.raw, index);
                if ffi::lua_getmetatable(self.raw, index) != 0 {
                    stack::push_str(self.raw, "__name");
                    ffi::lua_rawget(self.raw, -2);
                    let name = (ffi::lua_type(self.raw, -1) == ffi::LUA_TSTRING)
                        .then(|| String::from_utf8_lossy(&stack::copy_bytes(self.raw, -1)).into_owned());
                    ffi::lua_pop(self.raw, 2);
                    if let Some(name) = name {
                        return name;
                    }
                }
            }
            CStr::from_ptr(ffi::lua_typename(self.raw, tp))
                .to_string_lossy()
                .into_owned()
        }
    }

    // ========================================================================
    // Running code
    // ========================================================================

    /// Compiles and runs a chunk.
    pub fn exec(&self, source: &str) -> Result<()> {
        self.shared.drain_pending();
        let _guard = unsafe { StackGuard::new(self.raw) };
        self.load_chunk(source)?;
        self.protected_call(0, 0)
    }

    /// Compiles and runs a chunk, returning its first result.
    pub fn eval<R: FromLua>(&self, source: &str) -> Result<R> {
        self.shared.drain_pending();
        let _guard = unsafe { StackGuard::new(self.raw) };
        self.load_chunk(source)?;
        self.protected_call(0, 1)?;
        self.read(-1)
    }

    /// Compiles a chunk without running it.
    pub fn load(&self, source: &str) -> Result<Function> {
        self.shared.drain_pending();
        let _guard = unsafe { StackGuard::new(self.raw) };
        self.load_chunk(source)?;
        Function::read(self, self.top())
    }

    fn load_chunk(&self, source: &str) -> Result<()> {
        self.ensure_stack(2)?;
        let chunk_name = CString::new(source).unwrap_or_else(|_| CString::from(c"=(load)"));
        let status = unsafe {
            ffi::luaL_loadbufferx(
                self.raw,
                source.as_ptr() as *const c_char,
                source.len(),
                chunk_name.as_ptr(),
                ptr::null(),
            )
        };
        match status {
            ffi::LUA_OK => Ok(()),
            ffi::LUA_ERRSYNTAX => Err(Error::Syntax(unsafe { stack::pop_error_message(self.raw) })),
            _ => Err(Error::Runtime(unsafe { stack::pop_error_message(self.raw) })),
        }
    }

    /// Calls the function below `nargs` arguments in protected mode.
    pub(crate) fn protected_call(&self, nargs: c_int, nresults: c_int) -> Result<()> {
        let status = unsafe { ffi::lua_pcall(self.raw, nargs, nresults, 0) };
        if status == ffi::LUA_OK {
            return Ok(());
        }
        let message = unsafe { stack::pop_error_message(self.raw) };
        trace!(status, %message, "protected call failed");
        Err(Error::Runtime(message))
    }

    // ========================================================================
    // Globals
    // ========================================================================

    pub(crate) fn push_global(&self, name: &str) -> Result<()> {
        self.ensure_stack(3)?;
        unsafe {
            ffi::lua_rawgeti(self.raw, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS);
            stack::push_str(self.raw, name);
            ffi::lua_rawget(self.raw, -2);
            ffi::lua_remove(self.raw, -2);
        }
        Ok(())
    }

    /// Reads global `name`.
    pub fn get_global<T: FromLua>(&self, name: &str) -> Result<T> {
        self.shared.drain_pending();
        let _guard = unsafe { StackGuard::new(self.raw) };
        self.push_global(name)?;
        self.read(-1)
    }

    /// Assigns global `name`.
    pub fn set_global<T: ToLua>(&self, name: &str, value: T) -> Result<()> {
        self.shared.drain_pending();
        let _guard = unsafe { StackGuard::new(self.raw) };
        self.ensure_stack(2)?;
        unsafe {
            ffi::lua_rawgeti(self.raw, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS);
            stack::push_str(self.raw, name);
        }
        value.push(self)?;
        unsafe { ffi::lua_rawset(self.raw, -3) };
        Ok(())
    }

    /// Whether global `name` exists and reads as `T`.
    pub fn has_global<T: FromLua>(&self, name: &str) -> bool {
        self.get_global::<T>(name).is_ok()
    }

    // ========================================================================
    // Functions
    // ========================================================================

    /// Exposes a host function as global `name`.
    pub fn register_function<F, A>(&self, name: &str, function: F) -> Result<()>
    where
        F: HostFunction<A>,
    {
        self.set_global(name, callback::boxed_function(function))?;
        debug!(name, "registered native function");
        Ok(())
    }

    /// Wraps a host function in a callable handle without naming it.
    pub fn create_function<F, A>(&self, function: F) -> Result<Function>
    where
        F: HostFunction<A>,
    {
        let _guard = unsafe { StackGuard::new(self.raw) };
        callback::boxed_function(function).push(self)?;
        Function::read(self, self.top())
    }

    /// Calls global function `name` and reads its first result.
    pub fn call_function<A: PushArgs, R: FromLua>(&self, name: &str, args: A) -> Result<R> {
        self.shared.drain_pending();
        let _guard = unsafe { StackGuard::new(self.raw) };
        self.push_global(name)?;
        let nargs = args.push_args(self)?;
        self.protected_call(nargs, 1)?;
        self.read(-1)
    }

    /// Calls global function `name`, discarding results.
    pub fn call_function_void<A: PushArgs>(&self, name: &str, args: A) -> Result<()> {
        self.shared.drain_pending();
        let _guard = unsafe { StackGuard::new(self.raw) };
        self.push_global(name)?;
        let nargs = args.push_args(self)?;
        self.protected_call(nargs, 0)
    }

    // ========================================================================
    // Handles
    // ========================================================================

    /// New empty table.
    pub fn create_table(&self) -> Result<Table> {
        let _guard = unsafe { StackGuard::new(self.raw) };
        self.ensure_stack(1)?;
        unsafe { ffi::lua_createtable(self.raw, 0, 0) };
        Table::read(self, self.top())
    }

    /// Whether `key` still names a live captured handle.
    pub fn contains_reference(&self, key: RefKey) -> bool {
        self.shared.drain_pending();
        Reference::is_live(self, key)
    }

    /// Installs the global `typeof(v)` returning a value's kind name
    /// (the registered name for native objects).
    pub fn register_typeof(&self) -> Result<()> {
        self.set_global("typeof", callback::Callback::new(typeof_callback))
    }

    fn install_typeof(&self) {
        if let Err(err) = self.register_typeof() {
            tracing::warn!(%err, "could not install typeof");
        }
    }
}

fn typeof_callback(lua: &Lua) -> Result<c_int> {
    let name = lua.kind_at(1);
    name.push(lua)?;
    Ok(1)
}

impl Default for Lua {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lua {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lua")
            .field("state", &self.raw)
            .field("owned", &self.owned)
            .finish()
    }
}

impl Drop for Lua {
    fn drop(&mut self) {
        if self.owned {
            self.shared.closed.store(true, Ordering::Release);
            unsafe { ffi::lua_close(self.raw) };
            debug!("closed interpreter");
        }
    }
}
