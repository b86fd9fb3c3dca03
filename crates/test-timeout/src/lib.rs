//! Test attributes that fail a test once it runs past a wall-clock budget.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test and
//! `#[test_timeout::tokio_timeout_test]` wraps an async one in a fresh Tokio
//! runtime. Both accept either a bare number of seconds (`#[timeout(5)]`) or
//! named arguments (`#[tokio_timeout_test(secs = 5, flavor = "multi_thread")]`).
//! `TEST_TIMEOUT_SCALE` multiplies every budget, which helps on slow CI hosts.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, Block, ItemFn, LitInt, LitStr};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Copy, PartialEq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct TimeoutArgs {
    secs: u64,
    flavor: Flavor,
}

impl Default for TimeoutArgs {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
        }
    }
}

fn parse_args(attr: TokenStream) -> syn::Result<TimeoutArgs> {
    let mut args = TimeoutArgs::default();
    if attr.is_empty() {
        return Ok(args);
    }

    if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
        args.secs = lit.base10_parse()?;
    } else {
        let parser = syn::meta::parser(|meta| {
            if meta.path.is_ident("secs") {
                let lit: LitInt = meta.value()?.parse()?;
                args.secs = lit.base10_parse()?;
                Ok(())
            } else if meta.path.is_ident("flavor") {
                let lit: LitStr = meta.value()?.parse()?;
                args.flavor = match lit.value().as_str() {
                    "current_thread" => Flavor::CurrentThread,
                    "multi_thread" => Flavor::MultiThread,
                    _ => return Err(meta.error("flavor must be current_thread or multi_thread")),
                };
                Ok(())
            } else {
                Err(meta.error("expected `secs = N` or `flavor = \"...\"`"))
            }
        });
        syn::parse::Parser::parse(parser, attr)?;
    }

    if args.secs == 0 {
        return Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "timeout must be greater than zero",
        ));
    }
    Ok(args)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut function = parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    function
        .attrs
        .retain(|attr| !path_is(attr, &["tokio", "test"]));

    let block = &function.block;
    let builder = match args.flavor {
        Flavor::CurrentThread => quote!(tokio::runtime::Builder::new_current_thread()),
        Flavor::MultiThread => quote!(tokio::runtime::Builder::new_multi_thread()),
    };
    let body = quote! {
        let runtime = #builder
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async move {
            if tokio::time::timeout(__budget, async move #block).await.is_err() {
                panic!("test exceeded {:?}", __budget);
            }
        });
    };

    expand(function, args.secs, body).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut function = parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "timeout expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    function.attrs.retain(|attr| !path_is(attr, &["test"]));

    let block = &function.block;
    let body = quote! {
        let _ = __budget;
        (move || #block)();
    };

    expand(function, args.secs, body).into()
}

/// Emits a `#[test]` that runs `body` on a worker thread and panics if it has
/// not reported back within the (scaled) budget.
fn expand(function: ItemFn, secs: u64, body: TokenStream2) -> TokenStream2 {
    let ItemFn {
        attrs, vis, sig, ..
    } = function;
    let attrs: Vec<Attribute> = attrs;
    let thread_name = sig.ident.to_string();
    let wrapped: Block = syn::parse_quote!({ #body });

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let __scale: u64 = std::env::var("TEST_TIMEOUT_SCALE")
                .ok()
                .and_then(|value| value.parse().ok())
                .filter(|scale: &u64| *scale > 0)
                .unwrap_or(1);
            let __budget = std::time::Duration::from_secs(#secs * __scale);
            let (__tx, __rx) = std::sync::mpsc::channel();
            let __worker = std::thread::Builder::new()
                .name(String::from(#thread_name))
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                        move || #wrapped
                    ));
                    let _ = __tx.send(outcome);
                })
                .expect("failed to spawn test thread");
            match __rx.recv_timeout(__budget) {
                Ok(Ok(())) => {
                    let _ = __worker.join();
                }
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {:?}", __budget)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    }
}

fn path_is(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments.len() == expected.len() && segments.iter().zip(expected).all(|(a, b)| a == b)
}
