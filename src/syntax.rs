//! The parser that turns GBNF grammar text into rule definitions.
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1, take_while_m_n};
use nom::character::complete::{char, multispace1, none_of, not_line_ending};
use nom::combinator::{all_consuming, map, map_opt, map_res, not, opt, value};
use nom::error::{context, VerboseError};
use nom::multi::{fold_many0, many0, many0_count, many1, separated_list1};
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;

type Res<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

/// How often a node may repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Repetition {
    /// `*`
    ZeroOrMore,
    /// `+`
    OneOrMore,
    /// `?`
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Node {
    Literal(String),
    Class {
        negated: bool,
        ranges: Vec<(char, char)>,
    },
    Any,
    Reference(String),
    Group(Vec<Vec<Node>>),
    Repeat(Box<Node>, Repetition),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RuleDefinition {
    pub name: String,
    pub alternatives: Vec<Vec<Node>>,
}

fn comment(input: &str) -> Res<()> {
    value((), pair(char('#'), not_line_ending))(input)
}

fn ws(input: &str) -> Res<()> {
    value((), many0_count(alt((value((), multispace1), comment))))(input)
}

fn identifier(input: &str) -> Res<&str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_')(input)
}

fn code_point<'a>(digits: usize) -> impl FnMut(&'a str) -> Res<'a, char> {
    move |input: &'a str| {
        map_opt(
            map_res(
                take_while_m_n(digits, digits, |c: char| c.is_ascii_hexdigit()),
                |hex| u32::from_str_radix(hex, 16),
            ),
            char::from_u32,
        )(input)
    }
}

fn escape(input: &str) -> Res<char> {
    preceded(
        char('\\'),
        alt((
            value('\n', char('n')),
            value('\r', char('r')),
            value('\t', char('t')),
            preceded(char('x'), code_point(2)),
            preceded(char('u'), code_point(4)),
            preceded(char('U'), code_point(8)),
            none_of("nrtxuU"),
        )),
    )(input)
}

fn literal(input: &str) -> Res<String> {
    delimited(
        char('"'),
        fold_many0(
            alt((escape, none_of("\"\\"))),
            String::new,
            |mut s, c| {
                s.push(c);
                s
            },
        ),
        char('"'),
    )(input)
}

fn class_char(input: &str) -> Res<char> {
    alt((escape, none_of("]\\")))(input)
}

fn class(input: &str) -> Res<Node> {
    map(
        delimited(
            char('['),
            pair(
                opt(char('^')),
                many0(pair(class_char, opt(preceded(char('-'), class_char)))),
            ),
            char(']'),
        ),
        |(negated, items)| Node::Class {
            negated: negated.is_some(),
            ranges: items
                .into_iter()
                .map(|(start, end)| (start, end.unwrap_or(start)))
                .collect(),
        },
    )(input)
}

fn reference(input: &str) -> Res<Node> {
    map(
        terminated(identifier, not(pair(ws, tag("::=")))),
        |name: &str| Node::Reference(name.to_string()),
    )(input)
}

fn group(input: &str) -> Res<Node> {
    map(
        delimited(pair(char('('), ws), alternatives, pair(ws, char(')'))),
        Node::Group,
    )(input)
}

fn primary(input: &str) -> Res<Node> {
    alt((
        map(literal, Node::Literal),
        class,
        value(Node::Any, char('.')),
        group,
        reference,
    ))(input)
}

fn postfix(input: &str) -> Res<Node> {
    map(
        pair(
            primary,
            opt(alt((
                value(Repetition::ZeroOrMore, char('*')),
                value(Repetition::OneOrMore, char('+')),
                value(Repetition::Optional, char('?')),
            ))),
        ),
        |(node, repetition)| match repetition {
            Some(repetition) => Node::Repeat(Box::new(node), repetition),
            None => node,
        },
    )(input)
}

fn sequence(input: &str) -> Res<Vec<Node>> {
    many0(terminated(postfix, ws))(input)
}

fn alternatives(input: &str) -> Res<Vec<Vec<Node>>> {
    separated_list1(pair(char('|'), ws), sequence)(input)
}

fn rule_definition(input: &str) -> Res<RuleDefinition> {
    context(
        "rule",
        map(
            tuple((ws, identifier, ws, tag("::="), ws, alternatives)),
            |(_, name, _, _, _, alternatives)| RuleDefinition {
                name: name.to_string(),
                alternatives,
            },
        ),
    )(input)
}

/// Recognizes a whole grammar: one or more rule definitions, optionally surrounded by whitespace and comments.
pub(crate) fn parse_grammar(input: &str) -> Result<Vec<RuleDefinition>, nom::Err<VerboseError<&str>>> {
    let (_, rules) = all_consuming(terminated(many1(rule_definition), ws))(input)?;
    Ok(rules)
}

/// Checks whether the whole input is a valid rule name.
pub(crate) fn is_identifier(input: &str) -> bool {
    let result: Res<&str> = all_consuming(identifier)(input);
    result.is_ok()
}
