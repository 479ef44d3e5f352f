//! Test attributes that fail a test once it runs past a wall-clock budget.
//!
//! `#[tokio_timeout_test]` builds a dedicated runtime for an async test and
//! `#[timeout]` wraps a synchronous one. Both accept an optional budget in
//! seconds (default 30); the async form also takes `multi_thread` to run the
//! body on a multi-threaded runtime with two workers.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_BUDGET_SECS: u64 = 30;

struct Budget {
    secs: u64,
    multi_thread: bool,
}

impl Parse for Budget {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let mut budget = Budget {
            secs: DEFAULT_BUDGET_SECS,
            multi_thread: false,
        };
        while !input.is_empty() {
            if input.peek(LitInt) {
                let lit: LitInt = input.parse()?;
                budget.secs = lit.base10_parse()?;
                if budget.secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
            } else {
                let flag: Ident = input.parse()?;
                if flag != "multi_thread" {
                    return Err(syn::Error::new_spanned(flag, "expected `multi_thread`"));
                }
                budget.multi_thread = true;
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        Ok(budget)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let budget = parse_macro_input!(attr as Budget);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test expects an async fn")
            .to_compile_error()
            .into();
    }

    let secs = budget.secs;
    let runtime = if budget.multi_thread {
        quote! { tokio::runtime::Builder::new_multi_thread().worker_threads(2) }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread() }
    };
    let body = quote! {
        let runtime = #runtime
            .enable_all()
            .build()
            .expect("failed to build test runtime");
        runtime.block_on(async move {
            if tokio::time::timeout(::std::time::Duration::from_secs(#secs), async move #block)
                .await
                .is_err()
            {
                panic!("test exceeded {}s budget", #secs);
            }
        })
    };

    harness(strip(attrs, is_tokio_test), vis, sig, secs, body).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let budget = parse_macro_input!(attr as Budget);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(&sig.ident, "use tokio_timeout_test for async tests")
            .to_compile_error()
            .into();
    }

    let secs = budget.secs;
    harness(strip(attrs, is_plain_test), vis, sig, secs, quote! { #block }).into()
}

/// Runs `body` on its own thread and waits at most `secs` for it to report.
fn harness(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    secs: u64,
    body: TokenStream2,
) -> TokenStream2 {
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = ::std::time::Duration::from_secs(#secs);
            let (report, outcome) = ::std::sync::mpsc::channel();
            ::std::thread::Builder::new()
                .name(String::from(module_path!()))
                .spawn(move || {
                    let result = ::std::panic::catch_unwind(
                        ::std::panic::AssertUnwindSafe(move || { #body }),
                    );
                    let _ = report.send(result);
                })
                .expect("failed to spawn test thread");
            match outcome.recv_timeout(budget) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s budget", #secs)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    }
}

fn strip(attrs: Vec<Attribute>, drop: fn(&Attribute) -> bool) -> Vec<Attribute> {
    attrs.into_iter().filter(|attr| !drop(attr)).collect()
}

fn is_tokio_test(attr: &Attribute) -> bool {
    let path: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    path == ["tokio", "test"]
}

fn is_plain_test(attr: &Attribute) -> bool {
    attr.path().is_ident("test")
}
