//! Attribute macros that put a wall-clock deadline on tests.
//!
//! `#[test_deadline::timeout]` wraps a synchronous test body,
//! `#[test_deadline::tokio_timeout_test]` builds a current-thread Tokio
//! runtime around an async body. Both run the body on a helper thread and
//! panic with "test exceeded deadline" when it does not report back in time.
//! The deadline defaults to 60 seconds and can be overridden with an integer
//! argument: `#[test_deadline::timeout(5)]`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn, LitInt};

const DEFAULT_DEADLINE_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let deadline = parse_deadline(attr);
    let func = parse_macro_input!(item as ItemFn);
    if func.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &func.sig.ident,
            "timeout expects a synchronous test; use tokio_timeout_test for async tests",
        )
        .to_compile_error()
        .into();
    }
    let body = &func.block;
    expand(func.clone(), deadline, quote! { #body })
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let deadline = parse_deadline(attr);
    let mut func = parse_macro_input!(item as ItemFn);
    if func.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &func.sig.ident,
            "tokio_timeout_test expects an async test",
        )
        .to_compile_error()
        .into();
    }
    func.sig.asyncness = None;
    let body = &func.block;
    let driver = quote! {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("tokio runtime for test")
            .block_on(async #body)
    };
    expand(func, deadline, driver)
}

fn parse_deadline(attr: TokenStream) -> u64 {
    if attr.is_empty() {
        return DEFAULT_DEADLINE_SECS;
    }
    let lit: LitInt = syn::parse(attr).expect("deadline must be an integer literal");
    let secs: u64 = lit.base10_parse().expect("deadline must fit in u64");
    assert!(secs > 0, "deadline must be non-zero");
    secs
}

fn expand(func: ItemFn, deadline: u64, body: proc_macro2::TokenStream) -> TokenStream {
    let ItemFn {
        attrs, vis, sig, ..
    } = func;
    let kept: Vec<_> = attrs
        .into_iter()
        .filter(|a| {
            let path = a.path();
            !path.is_ident("test") && !(path.segments.len() == 2 && path.segments[0].ident == "tokio")
        })
        .collect();

    TokenStream::from(quote! {
        #[test]
        #(#kept)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#deadline);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(deadline) {
                Ok(Ok(_)) => {}
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(_) => panic!("test exceeded deadline of {}s", #deadline),
            }
        }
    })
}
