//! Tokenizes a raw MCCS capability string into `tag(value)` entries.
//!
//! The capability string is a single parenthesized group containing any
//! number of `tag(value)` pairs; `value` itself may contain nested
//! parenthesized groups (e.g. `vcp(02 04(01 02 03))`), so splitting on the
//! first matching close paren requires depth tracking rather than a plain
//! split.

use nom::{
    bytes::complete::take_while1,
    character::complete::char,
    error::{Error, ErrorKind},
    Err as NomErr, IResult,
};

use super::{OResultI, Value};

fn trim(i: &[u8]) -> &[u8] {
    let start = i.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(i.len());
    let end = i
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(start);
    &i[start..end]
}

fn strip_outer_parens(i: &[u8]) -> &[u8] {
    let trimmed = trim(i);
    if trimmed.first() == Some(&b'(') && trimmed.last() == Some(&b')') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    }
}

fn parse_tag(i: &[u8]) -> IResult<&[u8], &str> {
    nom::combinator::map_res(
        take_while1(|b: u8| b != b'(' && !b.is_ascii_whitespace()),
        std::str::from_utf8,
    )(i)
}

/// Finds the close paren matching the one already consumed, returns
/// `(inner, after_close)`.
fn split_balanced(i: &[u8]) -> Result<(&[u8], &[u8]), NomErr<Error<&[u8]>>> {
    let mut depth = 1i32;
    for (idx, b) in i.iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((&i[..idx], &i[idx + 1..]));
                }
            }
            _ => {}
        }
    }
    Err(NomErr::Error(Error::new(i, ErrorKind::Eof)))
}

fn parse_one(i: &[u8]) -> Result<(&[u8], Value), NomErr<Error<&[u8]>>> {
    let (i, tag_name) = parse_tag(i)?;
    let (i, _) = char('(')(i)?;
    let (inner, rest) = split_balanced(i)?;
    Ok((rest, Value::String { tag: tag_name, value: inner }))
}

/// Iterator over the top-level `tag(value)` entries of a capability string.
pub struct ValueParser<'i> {
    remaining: &'i [u8],
}

impl<'i> ValueParser<'i> {
    pub fn new(capability_string: &'i [u8]) -> Self {
        Self { remaining: strip_outer_parens(capability_string) }
    }

    pub fn nom_iter(self) -> impl Iterator<Item = OResultI<'i, Value<'i>>> {
        EntryIter { remaining: self.remaining }
    }
}

struct EntryIter<'i> {
    remaining: &'i [u8],
}

impl<'i> Iterator for EntryIter<'i> {
    type Item = OResultI<'i, Value<'i>>;

    fn next(&mut self) -> Option<Self::Item> {
        let i = trim(self.remaining);
        if i.is_empty() {
            return None;
        }
        match parse_one(i) {
            Ok((rest, value)) => {
                self.remaining = rest;
                Some(Ok(value))
            }
            Err(e) => {
                self.remaining = &[];
                Some(Err(e))
            }
        }
    }
}
