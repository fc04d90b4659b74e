//! Error Reporting Tests
//!
//! Checks how failures surface on both sides of the boundary:
//! - argument errors raised into scripts with position and kinds
//! - host functions failing or panicking
//! - compile and runtime failures reported to the host
//! - kind mismatches and invalid keys on the host side
//!
//! # Running Tests
//! ```bash
//! cargo test --test errors_tests
//! ```

use luaw::{Error, Lua, UserType};

fn lua_with_c_func() -> Lua {
    let lua = Lua::new();
    lua.register_function("c_func", |a: f64, b: f64| (a + b) * 2.0).unwrap();
    lua
}

// ===== Argument Errors =====

#[test]
fn test_bad_argument_message() {
    let lua = lua_with_c_func();
    match lua.exec("c_func('String')") {
        Err(Error::Runtime(message)) => assert_eq!(
            message,
            "[string \"c_func('String')\"]:1: bad argument #1 to 'c_func' (number expected, got string)"
        ),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_missing_argument_message() {
    let lua = lua_with_c_func();
    let err = lua.exec("c_func(1)").unwrap_err();
    assert!(err
        .to_string()
        .contains("bad argument #2 to 'c_func' (number expected, got no value)"));
}

#[test]
fn test_argument_error_caught_by_script() {
    let lua = lua_with_c_func();
    lua.exec("ok, msg = pcall(c_func, 1, {})").unwrap();
    assert!(!lua.get_global::<bool>("ok").unwrap());
    let msg: String = lua.get_global("msg").unwrap();
    assert!(msg.contains("bad argument #2"));
    assert!(msg.contains("number expected, got table"));
}

#[derive(Debug, Clone, Default, UserType)]
struct Gauge {
    level: f64,
}

#[test]
fn test_method_on_wrong_receiver() {
    let lua = Lua::new();
    lua.register_type::<Gauge>()
        .unwrap()
        .add_custom_and_default_constructors(|level: f64| Gauge { level })
        .add_method("level", |g: &Gauge| g.level)
        .finish()
        .unwrap();

    assert_eq!(lua.eval::<f64>("return Gauge.new(0.5):level()").unwrap(), 0.5);
    let err = lua.exec("local read = Gauge.new().level read('full')").unwrap_err();
    assert!(err.to_string().contains("Gauge expected, got string"));
}

#[test]
fn test_method_argument_numbering_skips_receiver() {
    let lua = Lua::new();
    lua.register_type::<Gauge>()
        .unwrap()
        .add_custom_and_default_constructors(|level: f64| Gauge { level })
        .add_method_mut("set_level", |g: &mut Gauge, level: f64| g.level = level)
        .finish()
        .unwrap();

    // Method calls are renumbered by the interpreter: the first argument
    // after the receiver is #1. Called as a plain function it is #2.
    let err = lua.exec("Gauge.new():set_level('x')").unwrap_err();
    assert!(err
        .to_string()
        .contains("bad argument #1 to 'set_level' (number expected, got string)"));
    let err = lua.exec("local g = Gauge.new() g.set_level(g, 'x')").unwrap_err();
    assert!(err.to_string().contains("bad argument #2"), "{err}");
}

// ===== Host Failures =====

#[test]
fn test_host_error_gets_script_position() {
    let lua = Lua::new();
    lua.register_function("fail", || -> luaw::Result<()> { Err(Error::external("disk full")) })
        .unwrap();
    match lua.exec("fail()") {
        Err(Error::Runtime(message)) => assert_eq!(message, "[string \"fail()\"]:1: disk full"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_panic_becomes_error() {
    let lua = Lua::new();
    lua.register_function("explode", |n: i32| -> i32 {
        if n > 0 {
            panic!("exploded with {n}");
        }
        n
    })
    .unwrap();

    let err = lua.exec("explode(3)").unwrap_err();
    assert!(err.to_string().contains("native function panicked: exploded with 3"));

    // The interpreter stays usable afterwards.
    assert_eq!(lua.eval::<i32>("return explode(0)").unwrap(), 0);
    assert_eq!(lua.top(), 0);
}

#[test]
fn test_unregistered_return_type() {
    #[derive(UserType)]
    struct Hidden;

    let lua = Lua::new();
    lua.register_function("make_hidden", || Hidden).unwrap();
    let err = lua.exec("make_hidden()").unwrap_err();
    assert!(err.to_string().contains("type 'Hidden' is not registered"));
}

#[test]
fn test_nested_error_keeps_inner_message() {
    let lua = Lua::new();
    lua.exec("function inner() error('inner failure') end").unwrap();
    let inner: luaw::Function = lua.get_global("inner").unwrap();
    lua.register_function("outer", move || inner.call_void(())).unwrap();

    let err = lua.exec("outer()").unwrap_err();
    let message = err.to_string();
    // The chunk name repeats the source, so only the tail is checked.
    assert!(message.ends_with(": inner failure"), "{message}");
    assert!(!message.contains("outer()"), "{message}");
}

// ===== Script Failures =====

#[test]
fn test_syntax_and_runtime_errors() {
    let lua = Lua::new();
    assert!(matches!(lua.exec("local = 1"), Err(Error::Syntax(_))));
    assert!(matches!(lua.load("if then"), Err(Error::Syntax(_))));
    assert!(matches!(lua.exec("local t = nil; t.x = 1"), Err(Error::Runtime(_))));
    assert_eq!(lua.top(), 0);
}

#[test]
fn test_non_string_error_object() {
    let lua = Lua::new();
    match lua.exec("error({})") {
        Err(Error::Runtime(message)) => assert_eq!(message, "(error object is a table value)"),
        other => panic!("unexpected result: {other:?}"),
    }
    match lua.exec("error(42)") {
        Err(Error::Runtime(message)) => assert_eq!(message, "42"),
        other => panic!("unexpected result: {other:?}"),
    }
}

// ===== Host-Side Mismatches =====

#[test]
fn test_expected_kind_on_mismatch() {
    let lua = Lua::new();
    lua.exec("n = 5").unwrap();
    let err = lua.get_global::<bool>("n").unwrap_err();
    assert_eq!(err.expected_kind(), Some("boolean"));
    assert_eq!(err.position(), None);
    assert_eq!(err.to_string(), "boolean expected, got number");
}

#[test]
fn test_expected_kind_for_native_types() {
    let lua = Lua::new();
    lua.register_type::<Gauge>().unwrap();
    lua.exec("g = 'not a gauge'").unwrap();
    let err = lua.get_global::<Gauge>("g").unwrap_err();
    assert_eq!(err.expected_kind(), Some("Gauge"));
}

#[test]
fn test_invalid_table_keys() {
    let lua = Lua::new();
    let t = lua.create_table().unwrap();
    assert!(matches!(t.set(Option::<i32>::None, 1), Err(Error::InvalidKey(_))));
    assert!(matches!(t.set(f64::NAN, 1), Err(Error::InvalidKey(_))));
    assert!(matches!(
        lua.get_global::<i32>("bad\0name"),
        Err(Error::TypeMismatch { .. })
    ));
}
