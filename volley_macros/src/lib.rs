use proc_macro::TokenStream;
use quote::quote;
use syn::{DeriveInput, parse_macro_input};

extern crate proc_macro;

/// Marks a plain data type that ends up in a report.
///
/// Adds the derive bundle every report value needs so sinks can log, diff and
/// serialize it: `Serialize`, `Deserialize`, `PartialEq`, `Debug` and `Clone`.
/// Works on structs and enums.
#[proc_macro_attribute]
pub fn report_data(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as DeriveInput);
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

/// Like [`report_data`] but also derives `Eq`, `Copy` and `Hash`, for small
/// tag-like enums such as status values.
#[proc_macro_attribute]
pub fn report_tag(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as DeriveInput);
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::cmp::Eq,
            std::hash::Hash,
            std::fmt::Debug,
            std::clone::Clone,
            std::marker::Copy
        )]
        #ast
    };

    TokenStream::from(expanded)
}
