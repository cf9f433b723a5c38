use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn};

/// Test attribute that installs the crate's tracing subscriber before the body runs.
///
/// Async functions become `#[tokio::test]` (arguments such as `flavor = "multi_thread"`
/// are forwarded), sync functions become plain `#[test]`.
///
/// ```ignore
/// #[ostoredb::test(flavor = "multi_thread", worker_threads = 4)]
/// async fn pops_everything() { ... }
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let runtime_args = proc_macro2::TokenStream::from(attr);
    let input = parse_macro_input!(item as ItemFn);
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let body = &input.block;
    let name = &input.sig.ident;

    let runtime_args = if runtime_args.is_empty() {
        quote! {}
    } else {
        quote! { ( #runtime_args ) }
    };

    let expanded = if sig.asyncness.is_some() {
        quote! {
            #(#attrs)*
            #[tokio::test #runtime_args]
            #vis #sig {
                ostoredb::trace::with_test_tracing(stringify!(#name), || async move #body).await
            }
        }
    } else {
        quote! {
            #(#attrs)*
            #[test]
            #vis #sig {
                ostoredb::trace::with_test_tracing_sync(stringify!(#name), || #body)
            }
        }
    };
    expanded.into()
}
