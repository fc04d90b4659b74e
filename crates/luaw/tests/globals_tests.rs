//! Global Variable Tests
//!
//! Exercises reading and writing script globals from the host:
//! - numbers written by either side
//! - strings and booleans
//! - existence checks with a requested kind
//!
//! # Running Tests
//! ```bash
//! cargo test --test globals_tests
//! ```

use luaw::{Error, Lua, LuaOptions, StdLib, Table};

// ===== Numbers =====

#[test]
fn test_host_and_script_numbers() {
    let lua = Lua::new();
    lua.set_global("num", 22).unwrap();
    lua.exec("lua_num = 17").unwrap();

    assert_eq!(lua.get_global::<i32>("num").unwrap(), 22);
    assert_eq!(lua.get_global::<i32>("lua_num").unwrap(), 17);
    assert!(lua.eval::<bool>("return num == 22").unwrap());
}

#[test]
fn test_numbers_convert_between_widths() {
    let lua = Lua::new();
    lua.exec("half = 2.5 big = 9007199254740993").unwrap();

    assert_eq!(lua.get_global::<f32>("half").unwrap(), 2.5);
    assert_eq!(lua.get_global::<u16>("half").unwrap(), 2);
    assert_eq!(lua.get_global::<i64>("big").unwrap(), 9_007_199_254_740_993);
}

// ===== Strings and Booleans =====

#[test]
fn test_strings_and_booleans() {
    let lua = Lua::new();
    lua.set_global("greeting", "hello").unwrap();
    lua.set_global("flag", true).unwrap();
    lua.exec("shout = greeting:upper() .. '!' negated = not flag").unwrap();

    assert_eq!(lua.get_global::<String>("shout").unwrap(), "HELLO!");
    assert!(!lua.get_global::<bool>("negated").unwrap());
}

#[test]
fn test_number_reads_as_string() {
    let lua = Lua::new();
    lua.exec("n = 42").unwrap();
    assert_eq!(lua.get_global::<String>("n").unwrap(), "42");
    assert_eq!(lua.eval::<String>("return math.type(n)").unwrap(), "integer");
}

#[test]
fn test_strings_may_contain_nul() {
    let lua = Lua::new();
    lua.set_global("bytes", "a\0b").unwrap();
    assert_eq!(lua.eval::<i32>("return #bytes").unwrap(), 3);
    assert_eq!(lua.get_global::<String>("bytes").unwrap(), "a\0b");
}

// ===== Existence =====

#[test]
fn test_has_global_checks_kind() {
    let lua = Lua::new();
    lua.exec("count = 3 name = 'x'").unwrap();

    assert!(lua.has_global::<f64>("count"));
    assert!(lua.has_global::<String>("name"));
    assert!(!lua.has_global::<bool>("count"));
    assert!(!lua.has_global::<f64>("missing"));
    assert!(lua.has_global::<Table>("string"));
}

#[test]
fn test_missing_global_is_mismatch() {
    let lua = Lua::new();
    match lua.get_global::<f64>("missing") {
        Err(Error::TypeMismatch { expected, got }) => {
            assert_eq!(expected, "number");
            assert_eq!(got, "nil");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

// ===== Libraries =====

#[test]
fn test_library_selection() {
    let lua = Lua::with_options(LuaOptions::bare().libraries(StdLib::BASE | StdLib::MATH));
    assert!(lua.has_global::<Table>("math"));
    assert!(!lua.has_global::<Table>("io"));
    assert!(!lua.has_global::<Table>("os"));
    assert_eq!(lua.eval::<f64>("return math.abs(-2)").unwrap(), 2.0);
}
