use proc_macro::TokenStream;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token,
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Arguments accepted by `#[tokio_timeout_test(...)]`: an optional timeout in
/// seconds and an optional `paused` flag, in any order.
struct TimeoutArgs {
    timeout_secs: u64,
    paused: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        while !input.is_empty() {
            if input.peek(LitInt) {
                let lit: LitInt = input.parse()?;
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(
                        lit,
                        "timeout must be greater than zero",
                    ));
                }
                args.timeout_secs = secs;
            } else {
                let ident: Ident = input.parse()?;
                if ident != "paused" {
                    return Err(syn::Error::new_spanned(
                        ident,
                        "expected a timeout in seconds or `paused`",
                    ));
                }
                args.paused = true;
            }
            if input.is_empty() {
                break;
            }
            input.parse::<Token![,]>()?;
        }
        Ok(args)
    }
}

/// Runs an async test on a current-thread Tokio runtime in a dedicated thread,
/// failing it when it does not finish within the wall-clock timeout.
///
/// With `paused`, the runtime starts with Tokio's clock paused so interval and
/// sleep driven code advances instantly; only the wall-clock guard applies in
/// that mode because virtual time would trip an in-runtime timeout.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TimeoutArgs {
        timeout_secs,
        paused,
    } = parse_macro_input!(attr as TimeoutArgs);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let body = if paused {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async move #block);
        }
    } else {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(timeout_duration, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
