//! Proc macros for the ingestion plugin SDK.
//!
//! `#[plugin_entry]` turns a plain Rust function into a guest export that
//! speaks the kernel's `(ptr, len) -> i64` calling convention.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{FnArg, Ident, ItemFn, PatType, parse_macro_input};

/// Entry points the kernel calls by exact name.
const ENTRY_POINTS: &[&str] = &[
    "setup_plugin",
    "teardown_plugin",
    "process_event",
    "on_event",
    "run_every_minute",
    "run_every_hour",
    "run_every_day",
];

/// Marks a function as a plugin entry point.
///
/// The export keeps the function's name, which must be one the kernel looks
/// for: `setup_plugin`, `teardown_plugin`, `process_event`, `on_event`,
/// `run_every_minute`, `run_every_hour`, `run_every_day` or `job_<name>`.
///
/// The function takes at most one argument, deserialized from the JSON
/// input, and returns anything implementing `EntryReply`: `()`, an event,
/// a JSON value, or an `Option`/`Result` of those. `None` is an empty reply
/// and `Err` becomes a raised error.
///
/// # Example
///
/// ```ignore
/// #[plugin_entry]
/// fn process_event(event: PluginEvent) -> Option<PluginEvent> {
///     Some(event)
/// }
/// ```
#[proc_macro_attribute]
pub fn plugin_entry(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(&function)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(function: &ItemFn) -> syn::Result<TokenStream2> {
    let name = &function.sig.ident;
    check_entry_name(name)?;

    let inner = format_ident!("__inner_{}", name);
    let vis = &function.vis;
    let inputs = &function.sig.inputs;
    let output = &function.sig.output;
    let body = &function.block;

    let call = match inputs.iter().collect::<Vec<_>>().as_slice() {
        [] => quote! {
            let _ = (ptr, len);
            let result = #inner();
        },
        [FnArg::Typed(PatType { ty, .. })] => quote! {
            // SAFETY: the kernel wrote `len` bytes at `ptr` via `alloc`.
            let bytes = unsafe { ingestion_sdk::guest::read_input(ptr, len) };
            let input: #ty = match ingestion_sdk::serde_json::from_slice(bytes) {
                Ok(input) => input,
                Err(e) => return ingestion_sdk::guest::input_error(&e),
            };
            let result = #inner(input);
        },
        [FnArg::Receiver(receiver), ..] => {
            return Err(syn::Error::new_spanned(
                receiver,
                "plugin_entry functions cannot take self",
            ));
        }
        _ => {
            return Err(syn::Error::new_spanned(
                inputs,
                "plugin_entry functions take at most one input",
            ));
        }
    };

    Ok(quote! {
        #[inline]
        fn #inner(#inputs) #output #body

        #[doc(hidden)]
        #[unsafe(no_mangle)]
        #vis extern "C" fn #name(ptr: i32, len: i32) -> i64 {
            #call
            ingestion_sdk::guest::write_reply(ingestion_sdk::guest::EntryReply::into_reply(result))
        }
    })
}

fn check_entry_name(name: &Ident) -> syn::Result<()> {
    let name_str = name.to_string();
    let is_job = name_str
        .strip_prefix("job_")
        .is_some_and(|job| !job.is_empty());

    if is_job || ENTRY_POINTS.contains(&name_str.as_str()) {
        Ok(())
    } else {
        Err(syn::Error::new_spanned(
            name,
            format!(
                "`{name_str}` is not a plugin entry point; expected one of {} or job_<name>",
                ENTRY_POINTS.join(", ")
            ),
        ))
    }
}
