// #[derive(UserType)] implementation
//
// Generates the `luaw::UserType` impl carrying the registered type name.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{DeriveInput, LitStr, Result};

/// Expands `#[derive(UserType)]`.
///
/// Input:
/// ```ignore
/// #[derive(UserType)]
/// #[luaw(name = "Vec2")]
/// struct Vector { x: f64, y: f64 }
/// ```
///
/// Output:
/// ```ignore
/// impl ::luaw::UserType for Vector {
///     const NAME: &'static str = "Vec2";
/// }
/// ```
pub fn expand_user_type(input: DeriveInput) -> Result<TokenStream> {
    if let syn::Data::Union(data) = &input.data {
        return Err(syn::Error::new_spanned(
            data.union_token,
            "UserType cannot be derived for unions",
        ));
    }

    let ident = &input.ident;
    let name = registered_name(&input)?.unwrap_or_else(|| LitStr::new(&ident.to_string(), ident.span()));

    if name.value().is_empty() {
        return Err(syn::Error::new_spanned(&name, "registered name must not be empty"));
    }
    if name.value().contains('\0') {
        return Err(syn::Error::new_spanned(&name, "registered name must not contain NUL"));
    }

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::luaw::UserType for #ident #ty_generics #where_clause {
            const NAME: &'static str = #name;
        }
    })
}

/// Reads `#[luaw(name = "...")]` if present.
fn registered_name(input: &DeriveInput) -> Result<Option<LitStr>> {
    let mut name = None;

    for attr in &input.attrs {
        if !attr.path().is_ident("luaw") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                name = Some(meta.value()?.parse::<LitStr>()?);
                Ok(())
            } else {
                Err(meta.error("unsupported luaw attribute, expected `name = \"...\"`"))
            }
        })?;
    }

    Ok(name)
}
