//! Test attributes shared by the toolgate test suites.
//!
//! Both attributes route the test through `test-log`, so `tracing` output from
//! the cache layers shows up in failing test logs. Use `RUST_LOG` to raise the
//! level above the default `warn`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// Async test on a multi-threaded tokio runtime with log capture.
#[proc_macro_attribute]
pub fn tokio_test(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input_fn = parse_macro_input!(item as ItemFn);
    wrap(
        input_fn,
        quote! { #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))] },
    )
}

/// Plain test with log capture.
#[proc_macro_attribute]
pub fn test(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input_fn = parse_macro_input!(item as ItemFn);
    wrap(input_fn, quote! { #[test_log::test] })
}

fn wrap(input_fn: ItemFn, runner: TokenStream2) -> TokenStream {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input_fn;

    let expanded = quote! {
        #runner
        #[test_log(default_log_filter = "warn")]
        #(#attrs)*
        #vis #sig #block
    };

    TokenStream::from(expanded)
}
