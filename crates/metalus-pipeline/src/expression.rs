//! Mapping expression language: parser for sigil expressions and
//! `${…}` templates.
//!
//! Grammar:
//! ```text
//! MappingExpr ::= Sigil Segment ( '.' Segment )*
//! Sigil       ::= '!' | '$' | '@' | '#' | '&'
//! Segment     ::= [A-Za-z0-9_-]+
//! Template    ::= ( Literal | '${' MappingExpr '}' )*
//! ```
//!
//! A string is a whole-value expression only when a sigil is its first
//! character and the entire string parses; otherwise it is rendered as a
//! template (embedded `${…}` occurrences) or passed through as a literal.

use winnow::combinator::{alt, preceded, repeat};
use winnow::token::take_while;
use winnow::{ModalResult, Parser};

/// The source a mapping expression reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sigil {
    /// `!` — context globals.
    Global,
    /// `$` — a whole step response.
    Response,
    /// `@` — a step response's primary return.
    Primary,
    /// `#` — a step response's named returns.
    Named,
    /// `&` — a managed pipeline.
    ManagedPipeline,
}

/// A parsed mapping expression: sigil plus dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingExpr {
    pub sigil: Sigil,
    pub segments: Vec<String>,
}

/// One piece of a rendered template string.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Literal(String),
    Expr(MappingExpr),
}

fn sigil(input: &mut &str) -> ModalResult<Sigil> {
    alt((
        '!'.value(Sigil::Global),
        '$'.value(Sigil::Response),
        '@'.value(Sigil::Primary),
        '#'.value(Sigil::Named),
        '&'.value(Sigil::ManagedPipeline),
    ))
    .parse_next(input)
}

/// One path segment: identifiers plus `-` (pipeline and step ids use it).
fn segment<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        .parse_next(input)
}

fn mapping(input: &mut &str) -> ModalResult<MappingExpr> {
    let sigil = sigil.parse_next(input)?;
    let first = segment.parse_next(input)?;
    let rest: Vec<&str> = repeat(0.., preceded('.', segment)).parse_next(input)?;

    let mut segments = Vec::with_capacity(rest.len() + 1);
    segments.push(first.to_string());
    segments.extend(rest.into_iter().map(String::from));
    Ok(MappingExpr { sigil, segments })
}

/// Parse a whole-value mapping expression. Returns `None` unless the first
/// character is a sigil and the full input is consumed.
pub fn parse_mapping(input: &str) -> Option<MappingExpr> {
    mapping.parse(input).ok()
}

/// Whether a string contains embedded `${…}` expressions.
pub fn contains_template(input: &str) -> bool {
    input.contains("${")
}

/// Split a string into literal runs and embedded `${expr}` expressions.
/// A `${…}` whose body does not parse as a mapping expression stays
/// literal text.
pub fn parse_template(input: &str) -> Vec<TemplatePart> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        let (before, after_open) = rest.split_at(open);
        literal.push_str(before);
        let body_and_rest = &after_open[2..];

        match body_and_rest.find('}') {
            Some(close) => {
                let body = &body_and_rest[..close];
                match parse_mapping(body) {
                    Some(expr) => {
                        if !literal.is_empty() {
                            parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                        }
                        parts.push(TemplatePart::Expr(expr));
                    }
                    None => {
                        // Not a valid expression; keep the raw text.
                        literal.push_str("${");
                        literal.push_str(body);
                        literal.push('}');
                    }
                }
                rest = &body_and_rest[close + 1..];
            }
            None => {
                // Unterminated `${` — literal to the end.
                literal.push_str("${");
                rest = body_and_rest;
                break;
            }
        }
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        parts.push(TemplatePart::Literal(literal));
    }
    parts
}

impl MappingExpr {
    /// Raw source form, used when a non-scalar embedding must be left as
    /// literal text.
    pub fn to_source(&self) -> String {
        let sigil = match self.sigil {
            Sigil::Global => '!',
            Sigil::Response => '$',
            Sigil::Primary => '@',
            Sigil::Named => '#',
            Sigil::ManagedPipeline => '&',
        };
        format!("{}{}", sigil, self.segments.join("."))
    }
}
