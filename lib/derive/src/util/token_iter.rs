/*++

Licensed under the Apache-2.0 license.

File Name:

    token_iter.rs

Abstract:

    Helpers for walking the token stream handed to a derive macro.

--*/
use std::collections::HashMap;
use std::fmt::Display;

use proc_macro2::{Delimiter, Group, Ident, Spacing, TokenStream, TokenTree};

/// A parsed helper attribute: `#[name(key = value, ...)]`.
pub struct Attribute {
    #[allow(dead_code)]
    pub name: Ident,
    pub args: HashMap<String, TokenTree>,
}

/// A struct field together with the helper attributes that preceded it.
/// `field_name` is `None` for attributes that stand on their own (fieldless
/// register definitions).
pub struct AttributedField {
    pub attr_name: String,
    pub field_name: Option<Ident>,
    pub field_type: TokenStream,
    pub attributes: Vec<Attribute>,
}

struct Describe<'a>(&'a Option<TokenTree>);

impl<'a> Display for Describe<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(TokenTree::Ident(i)) => write!(f, "identifier {i}"),
            Some(TokenTree::Literal(l)) => write!(f, "literal {l}"),
            Some(TokenTree::Punct(p)) => write!(f, "punctuation '{p}'"),
            Some(TokenTree::Group(g)) => write!(f, "group {g}"),
            None => write!(f, "end of input"),
        }
    }
}

pub fn describe_token(token: &Option<TokenTree>) -> String {
    Describe(token).to_string()
}

pub fn expect_ident(iter: &mut impl Iterator<Item = TokenTree>) -> Ident {
    match iter.next() {
        Some(TokenTree::Ident(ident)) => ident,
        other => panic!("expected identifier, found {}", Describe(&other)),
    }
}

fn expect_punct_of(iter: &mut impl Iterator<Item = TokenTree>, expected: char) {
    match iter.next() {
        Some(TokenTree::Punct(ref p)) if p.as_char() == expected => {}
        other => panic!(
            "expected punctuation '{expected}', found {}",
            Describe(&other)
        ),
    }
}

fn expect_group(iter: &mut impl Iterator<Item = TokenTree>, delimiter: Delimiter) -> Group {
    match iter.next() {
        Some(TokenTree::Group(ref g)) if g.delimiter() == delimiter => g.clone(),
        other => panic!(
            "expected {delimiter:?}-delimited group, found {}",
            Describe(&other)
        ),
    }
}

/// Consume tokens up to and including the `struct` keyword, returning the
/// outer attribute groups seen on the way.
pub fn take_struct_attributes(iter: &mut impl Iterator<Item = TokenTree>) -> Vec<Group> {
    let mut after_hash = false;
    let mut attributes = Vec::new();
    loop {
        match iter.next() {
            Some(TokenTree::Ident(ident)) if ident == "struct" => return attributes,
            Some(TokenTree::Punct(punct)) if punct.as_char() == '#' => {
                after_hash = true;
                continue;
            }
            Some(TokenTree::Group(group))
                if after_hash && group.delimiter() == Delimiter::Bracket =>
            {
                attributes.push(group);
            }
            None => panic!("ran out of tokens looking for a struct definition"),
            _ => {}
        }
        after_hash = false;
    }
}

pub fn collect_while(
    iter: &mut impl Iterator<Item = TokenTree>,
    mut pred: impl FnMut(&TokenTree) -> bool,
) -> TokenStream {
    let mut result = TokenStream::new();
    for token in iter {
        if !pred(&token) {
            break;
        }
        result.extend(Some(token));
    }
    result
}

pub fn skip_to_group(iter: &mut impl Iterator<Item = TokenTree>, delimiter: Delimiter) -> Group {
    for token in iter {
        if let TokenTree::Group(group) = token {
            if group.delimiter() == delimiter {
                return group;
            }
        }
    }
    panic!("ran out of tokens looking for a {delimiter:?}-delimited group")
}

/// Advance to the next `#[...]` attribute or plain identifier, skipping
/// visibility modifiers and punctuation between fields.
fn next_attribute_or_ident(iter: &mut impl Iterator<Item = TokenTree>) -> Option<TokenTree> {
    loop {
        match iter.next() {
            Some(TokenTree::Punct(punct))
                if punct.as_char() == '#' && punct.spacing() == Spacing::Alone =>
            {
                if let Some(TokenTree::Group(group)) = iter.next() {
                    if group.delimiter() == Delimiter::Bracket {
                        return Some(TokenTree::Group(group));
                    }
                }
            }
            Some(TokenTree::Ident(ident)) if ident == "pub" => continue,
            Some(TokenTree::Ident(ident)) => return Some(TokenTree::Ident(ident)),
            None => return None,
            _ => {}
        }
    }
}

/// Parse the `key = value, ...` argument list of a helper attribute.
fn parse_attr_args(group: &Group) -> HashMap<String, TokenTree> {
    let mut iter = group.stream().into_iter();
    let mut args = HashMap::new();
    loop {
        let key = expect_ident(&mut iter);
        expect_punct_of(&mut iter, '=');
        let value = match iter.next() {
            Some(t @ TokenTree::Literal(_)) | Some(t @ TokenTree::Ident(_)) => t,
            other => panic!(
                "expected literal or identifier, found {}",
                Describe(&other)
            ),
        };
        args.insert(key.to_string(), value);
        match iter.next() {
            Some(TokenTree::Punct(ref p)) if p.as_char() == ',' => continue,
            None => break,
            other => panic!("unexpected token {}", Describe(&other)),
        }
    }
    args
}

/// Find the next field carrying an attribute accepted by
/// `attribute_name_pred`. When `fieldless_pred` says an attribute is
/// complete on its own, it is returned without waiting for a field.
pub fn next_attributed_field(
    iter: &mut impl Iterator<Item = TokenTree>,
    attribute_name_pred: impl Fn(&str) -> bool,
    fieldless_pred: impl Fn(&Attribute) -> bool,
) -> Option<AttributedField> {
    let mut attr_name = String::new();
    let mut attributes = Vec::new();
    loop {
        match next_attribute_or_ident(iter) {
            Some(TokenTree::Group(group)) => {
                let mut inner = group.stream().into_iter();
                let name = expect_ident(&mut inner);
                attr_name = name.to_string();
                if !attribute_name_pred(&attr_name) {
                    continue;
                }
                let params = expect_group(&mut inner, Delimiter::Parenthesis);
                let attribute = Attribute {
                    name,
                    args: parse_attr_args(&params),
                };
                let fieldless = fieldless_pred(&attribute);
                attributes.push(attribute);
                if fieldless {
                    return Some(AttributedField {
                        attr_name,
                        field_name: None,
                        field_type: TokenStream::new(),
                        attributes,
                    });
                }
            }
            Some(TokenTree::Ident(ident)) => {
                expect_punct_of(iter, ':');
                // The type runs to the next comma outside of any generic
                // argument list.
                let mut depth = 0;
                let field_type = collect_while(iter, |t| match t {
                    TokenTree::Punct(p) if p.as_char() == '<' => {
                        depth += 1;
                        true
                    }
                    TokenTree::Punct(p) if p.as_char() == '>' => {
                        depth -= 1;
                        true
                    }
                    TokenTree::Punct(p) => depth != 0 || p.as_char() != ',',
                    _ => true,
                });
                return Some(AttributedField {
                    attr_name,
                    field_name: Some(ident),
                    field_type,
                    attributes,
                });
            }
            None => return None,
            _ => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use proc_macro2::TokenStream;

    use super::*;

    fn tokens(s: &str) -> impl Iterator<Item = TokenTree> {
        TokenStream::from_str(s).unwrap().into_iter()
    }

    #[test]
    fn test_expect_ident() {
        assert_eq!("foo", expect_ident(&mut tokens("foo")).to_string());
    }

    #[test]
    #[should_panic(expected = "expected identifier, found literal 35")]
    fn test_expect_ident_rejects_literal() {
        expect_ident(&mut tokens("35"));
    }

    #[test]
    fn test_expect_punct_of() {
        expect_punct_of(&mut tokens(","), ',');
        expect_punct_of(&mut tokens("."), '.');
    }

    #[test]
    #[should_panic(expected = "expected punctuation '.', found punctuation ','")]
    fn test_expect_punct_of_mismatch() {
        expect_punct_of(&mut tokens(","), '.');
    }

    #[test]
    fn test_expect_group() {
        expect_group(&mut tokens("[35, 42]"), Delimiter::Bracket);
        expect_group(&mut tokens("(35, 42)"), Delimiter::Parenthesis);
        expect_group(&mut tokens("{}"), Delimiter::Brace);
    }

    #[test]
    #[should_panic(expected = "expected Bracket-delimited group, found group (35 , 42)")]
    fn test_expect_group_mismatch() {
        expect_group(&mut tokens("(35, 42)"), Delimiter::Bracket);
    }

    #[test]
    fn test_take_struct_attributes() {
        let iter = &mut tokens("struct { foo: u32 }");
        assert!(take_struct_attributes(iter).is_empty());
        assert_eq!("{ foo : u32 }", iter.next().unwrap().to_string());

        let iter = &mut tokens("pub(crate) struct { foo: u32 }");
        assert!(take_struct_attributes(iter).is_empty());
        assert_eq!("{ foo : u32 }", iter.next().unwrap().to_string());

        let iter = &mut tokens("#[foo(fn = blah)] #[bar] struct { foo: u32 }");
        let attrs = take_struct_attributes(iter);
        assert_eq!(attrs.len(), 2);
        assert_eq!("[foo (fn = blah)]", attrs[0].to_string());
        assert_eq!("[bar]", attrs[1].to_string());
        assert_eq!("{ foo : u32 }", iter.next().unwrap().to_string());
    }

    #[test]
    fn test_skip_to_group() {
        assert_eq!(
            "(35 , 42)",
            skip_to_group(&mut tokens("(35, 42)"), Delimiter::Parenthesis).to_string()
        );
        assert_eq!(
            "[foo , 32]",
            skip_to_group(&mut tokens("Hi [foo, 32] (35, 42)"), Delimiter::Bracket).to_string()
        );
    }

    #[test]
    #[should_panic(expected = "ran out of tokens")]
    fn test_skip_to_group_missing() {
        skip_to_group(&mut tokens("Hi [foo, 32] (35, 42)"), Delimiter::Brace);
    }

    #[test]
    fn test_next_attribute_or_ident() {
        assert_eq!(
            "[something (foo = 5)]",
            next_attribute_or_ident(&mut tokens(": , #[something(foo = 5)]"))
                .unwrap()
                .to_string()
        );
        assert_eq!(
            "foo",
            next_attribute_or_ident(&mut tokens(": , pub foo"))
                .unwrap()
                .to_string()
        );
        assert!(next_attribute_or_ident(&mut tokens(": , ")).is_none());
    }

    #[test]
    fn test_next_attributed_field() {
        let result = next_attributed_field(
            &mut tokens(
                "#[attr1(a = 35)] #[attr2(b = 42)] #[attr1(a = 65, baz=\"hi\")] pub foo: Foo,",
            ),
            |name| name == "attr1",
            |_| false,
        )
        .unwrap();
        assert_eq!("foo", result.field_name.unwrap().to_string());
        // attr2 is filtered out; both attr1 occurrences survive.
        assert_eq!(result.attributes.len(), 2);
        assert_eq!("35", result.attributes[0].args["a"].to_string());
        assert_eq!("65", result.attributes[1].args["a"].to_string());
        assert_eq!("\"hi\"", result.attributes[1].args["baz"].to_string());
    }

    #[test]
    fn test_next_attributed_field_generic_type() {
        let result = next_attributed_field(
            &mut tokens("#[attr1(a = 1)] foo: Wrapper<A, B>, bar: u32"),
            |name| name == "attr1",
            |_| false,
        )
        .unwrap();
        assert_eq!("foo", result.field_name.unwrap().to_string());
        assert_eq!("Wrapper < A , B >", result.field_type.to_string());
    }
}
