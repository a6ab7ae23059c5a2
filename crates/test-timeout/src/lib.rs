//! Test attributes that fail a test which runs past its deadline instead of
//! letting it hang the whole suite.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test, while
//! `#[test_timeout::tokio_timeout_test]` wraps an async one in a fresh Tokio
//! runtime. Both accept an optional deadline in seconds (default 60); the async
//! form also accepts `multi_thread` to run on a multi-threaded runtime.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Sync,
    CurrentThread,
    MultiThread,
}

struct Options {
    secs: u64,
    flavor: Flavor,
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr.into(), item.into(), false)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr.into(), item.into(), true)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(attr: TokenStream2, item: TokenStream2, is_async: bool) -> syn::Result<TokenStream2> {
    let options = parse_options(attr, is_async)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = syn::parse2::<ItemFn>(item)?;

    match (is_async, sig.asyncness.is_some()) {
        (true, false) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "tokio_timeout_test expects an async fn",
            ))
        }
        (false, true) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "timeout expects a synchronous fn; use tokio_timeout_test",
            ))
        }
        _ => {}
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();
    let secs = options.secs;
    let name = sig.ident.to_string();

    let body = match options.flavor {
        Flavor::Sync => quote! { #block },
        flavor => {
            let builder = if flavor == Flavor::MultiThread {
                quote! { tokio::runtime::Builder::new_multi_thread() }
            } else {
                quote! { tokio::runtime::Builder::new_current_thread() }
            };
            quote! {
                {
                    let runtime = #builder
                        .enable_all()
                        .build()
                        .expect("build tokio runtime for test");
                    runtime.block_on(async move {
                        if tokio::time::timeout(deadline, async move #block).await.is_err() {
                            panic!("test exceeded {}s deadline", #secs);
                        }
                    })
                }
            }
        }
    };

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(String::from(#name))
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || #body));
                    let _ = done_tx.send(outcome);
                })
                .expect("spawn test thread");
            match done_rx.recv_timeout(deadline) {
                Ok(Ok(_)) => {}
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s deadline", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

fn parse_options(attr: TokenStream2, is_async: bool) -> syn::Result<Options> {
    let mut options = Options {
        secs: DEFAULT_TIMEOUT_SECS,
        flavor: if is_async {
            Flavor::CurrentThread
        } else {
            Flavor::Sync
        },
    };
    if attr.is_empty() {
        return Ok(options);
    }

    let args = Punctuated::<Expr, Token![,]>::parse_terminated.parse2(attr)?;
    for arg in args {
        match &arg {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be at least 1s"));
                }
                options.secs = secs;
            }
            Expr::Path(path) if is_async && path.path.is_ident("multi_thread") => {
                options.flavor = Flavor::MultiThread;
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a timeout in seconds or `multi_thread`",
                ))
            }
        }
    }
    Ok(options)
}

/// `#[test]` and `#[tokio::test]` are replaced by the generated harness.
fn is_test_marker(attr: &Attribute) -> bool {
    let path = attr.path();
    if path.is_ident("test") {
        return true;
    }
    let segments: Vec<String> = path.segments.iter().map(|s| s.ident.to_string()).collect();
    segments == ["tokio", "test"]
}
