//! Standard library selection

use std::ffi::CStr;

use mlua_sys as ffi;
use tracing::debug;

bitflags::bitflags! {
    /// Optional interpreter facilities, opened with [`crate::Lua::open_libraries`].
    ///
    /// Bit values are stable: `BASE = 1 << 1` through `UTF8 = 1 << 10`, and
    /// `ALL` sets every bit of the 16-bit mask.
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
    pub struct StdLib: u16 {
        const BASE = 1 << 1;
        const COROUTINE = 1 << 2;
        const DEBUG = 1 << 3;
        const IO = 1 << 4;
        const MATH = 1 << 5;
        const OS = 1 << 6;
        const PACKAGE = 1 << 7;
        const STRING = 1 << 8;
        const TABLE = 1 << 9;
        const UTF8 = 1 << 10;
        const ALL = u16::MAX;
    }
}

impl StdLib {
    /// Libraries without access to the host system (no `io`, `os`, `package`, `debug`).
    pub const SAFE: StdLib = StdLib::BASE
        .union(StdLib::COROUTINE)
        .union(StdLib::MATH)
        .union(StdLib::STRING)
        .union(StdLib::TABLE)
        .union(StdLib::UTF8);
}

impl Default for StdLib {
    fn default() -> Self {
        StdLib::ALL
    }
}

/// (flag, global name, opener) for every individually selectable library.
const OPENERS: [(StdLib, &CStr, ffi::lua_CFunction); 10] = [
    (StdLib::BASE, c"_G", ffi::luaopen_base),
    (StdLib::COROUTINE, c"coroutine", ffi::luaopen_coroutine),
    (StdLib::DEBUG, c"debug", ffi::luaopen_debug),
    (StdLib::IO, c"io", ffi::luaopen_io),
    (StdLib::MATH, c"math", ffi::luaopen_math),
    (StdLib::OS, c"os", ffi::luaopen_os),
    (StdLib::PACKAGE, c"package", ffi::luaopen_package),
    (StdLib::STRING, c"string", ffi::luaopen_string),
    (StdLib::TABLE, c"table", ffi::luaopen_table),
    (StdLib::UTF8, c"utf8", ffi::luaopen_utf8),
];

/// Opens the selected libraries on `state`.
///
/// # Safety
/// `state` must be a valid interpreter used from the current thread.
pub(crate) unsafe fn open(state: *mut ffi::lua_State, libs: StdLib) {
    if libs == StdLib::ALL {
        ffi::luaL_openlibs(state);
    } else {
        for (flag, name, opener) in OPENERS {
            if libs.contains(flag) {
                ffi::luaL_requiref(state, name.as_ptr(), opener, 1);
                ffi::lua_pop(state, 1);
            }
        }
    }
    debug!(libraries = ?library_names(libs), "opened standard libraries");
}

/// Names of the libraries in `libs`, in opening order.
pub fn library_names(libs: StdLib) -> Vec<&'static str> {
    OPENERS
        .iter()
        .filter(|(flag, _, _)| libs.contains(*flag))
        .filter_map(|(_, name, _)| name.to_str().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values() {
        assert_eq!(StdLib::BASE.bits(), 2);
        assert_eq!(StdLib::UTF8.bits(), 1024);
        assert_eq!(StdLib::ALL.bits(), 0xFFFF);
        assert!(StdLib::ALL.contains(StdLib::OS | StdLib::IO));
    }

    #[test]
    fn test_safe_excludes_host_access() {
        assert!(!StdLib::SAFE.contains(StdLib::IO));
        assert!(!StdLib::SAFE.contains(StdLib::OS));
        assert!(StdLib::SAFE.contains(StdLib::BASE | StdLib::STRING));
    }

    #[test]
    fn test_library_names() {
        assert_eq!(library_names(StdLib::BASE | StdLib::MATH), vec!["_G", "math"]);
        assert!(library_names(StdLib::empty()).is_empty());
        assert_eq!(library_names(StdLib::ALL).len(), 10);
    }
}
