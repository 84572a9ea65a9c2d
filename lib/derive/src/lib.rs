/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    Contains derive procedural macros used by the emulator peripherals.

--*/
mod bus;
mod util;

#[cfg(not(test))]
use proc_macro::TokenStream;
#[cfg(test)]
use proc_macro2::TokenStream;

#[cfg(not(test))]
#[proc_macro_derive(
    Bus,
    attributes(
        peripheral,
        register,
        register_array,
        poll_fn,
        warm_reset_fn,
        update_reset_fn
    )
)]
pub fn derive_bus(input: TokenStream) -> TokenStream {
    crate::bus::derive_bus(input.into()).into()
}
