use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemStruct, parse_macro_input};

extern crate proc_macro;

/// Turns a struct into an actor's per-phase configuration.
///
/// Fields are read from the phase's free-form keys using PascalCase names, so
/// `message: String` is populated from `Message = "..."`. Keys the struct does
/// not name are ignored, which lets actor-level parameters act as fallbacks.
#[proc_macro_attribute]
pub fn phase_config(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let expanded = quote! {
        #[derive(
            serde::Deserialize,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #[serde(rename_all = "PascalCase")]
        #ast
    };

    TokenStream::from(expanded)
}

#[proc_macro_attribute]
pub fn aggregate(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast
    };

    TokenStream::from(expanded)
}
