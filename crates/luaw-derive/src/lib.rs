// luaw-derive: derive macros for luaw native types
//
// Provides:
// - #[derive(UserType)] - names a Rust type for registration with the VM
//
// Example:
// ```
// use luaw::UserType;
//
// #[derive(Clone, UserType)]
// #[luaw(name = "Vec2")]
// struct Vector { x: f64, y: f64 }
// ```

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod user_type;

/// Implements `luaw::UserType` for a struct or enum.
///
/// The registered name defaults to the Rust identifier and can be
/// overridden with `#[luaw(name = "...")]`. The name becomes the global
/// namespace of the type inside scripts and the tag checked on every
/// pointer read, so it must be unique per interpreter.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Default, UserType)]
/// struct Point {
///     x: f64,
///     y: f64,
/// }
///
/// lua.register_type::<Point>()?
///     .add_member("x", |p: &mut Point| &mut p.x)
///     .add_custom_and_default_constructors(|x: f64, y: f64| Point { x, y });
/// ```
#[proc_macro_derive(UserType, attributes(luaw))]
pub fn derive_user_type(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    user_type::expand_user_type(input)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}
