/*++

Licensed under the Apache-2.0 license.

File Name:

    literal.rs

Abstract:

    Helpers for parsing and emitting integer literal tokens.

--*/
use std::str::FromStr;

use proc_macro2::{Literal, TokenTree};

use crate::util::token_iter::describe_token;

fn hex_value(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x")?.replace('_', "");
    u64::from_str_radix(&digits, 16).ok()
}

/// Parse a decimal or `0x`-prefixed integer literal.
pub fn parse_usize(token: &TokenTree) -> usize {
    if let TokenTree::Literal(literal) = token {
        let s = literal.to_string();
        if let Some(val) = hex_value(&s) {
            return val as usize;
        }
        if let Ok(val) = usize::from_str(&s.replace('_', "")) {
            return val;
        }
    }
    panic!(
        "cannot parse {} as an integer",
        describe_token(&Some(token.clone()))
    );
}

/// Parse a `0x`-prefixed integer literal. Offsets and masks are required
/// to be written in hex.
pub fn parse_hex_u32(token: TokenTree) -> u32 {
    if let TokenTree::Literal(literal) = &token {
        if let Some(val) = hex_value(&literal.to_string()) {
            if let Ok(val) = u32::try_from(val) {
                return val;
            }
        }
    }
    panic!("cannot parse {} as hex", describe_token(&Some(token)));
}

/// Emit `val` as a `0xaaaa_bbbb` literal token.
pub fn hex_literal_u32(val: u32) -> TokenTree {
    let text = format!("0x{:04x}_{:04x}", val >> 16, val & 0xffff);
    match Literal::from_str(&text) {
        Ok(lit) => TokenTree::Literal(lit),
        Err(_) => unreachable!(),
    }
}
