//! The grammar module that contains the grammar struct in arena form and its related functions and structs.
//!
//! A [`Grammar`] is a table from [`RuleID`] to a flat row of [`Element`]s.
//! Alternatives inside a row are separated by [`Element::Alt`] and the row is terminated by [`Element::End`].
//! Groups and repetitions in the grammar text are lowered into synthesized rules,
//! so the matcher only ever deals with characters and rule references.
use std::fmt::{self, Debug, Display};

use ahash::{AHashMap, AHashSet};
use jaggedarray::jagged_array::{JaggedArray, JaggedArrayViewTrait};
use nom::error::VerboseError;
use string_interner::symbol::SymbolU32;
use string_interner::{DefaultStringInterner, Symbol};

use crate::syntax::{self, Node, Repetition};
use crate::utils;

/// The name of the rule a grammar starts from unless configured otherwise.
pub const DEFAULT_ROOT: &str = "root";

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
/// The wrapper struct that represents the rule id in the grammar.
pub struct RuleID(pub u32);

impl RuleID {
    /// Get the display form of the rule id.
    pub fn to_display_form(&self, grammar: &Grammar) -> String {
        format!("{}[{}]", grammar.rule_name(*self).unwrap_or("?"), self.0)
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
/// The wrapper struct that represents the character class id in the grammar.
pub struct ClassID(pub u32);

/// An inclusive range of characters.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct CharRange {
    /// The first character of the range.
    pub start: char,
    /// The last character of the range.
    pub end: char,
}

impl CharRange {
    /// Checks whether the range contains the character.
    #[inline]
    pub fn contains(&self, c: char) -> bool {
        self.start <= c && c <= self.end
    }
}

/// The element of a rule row.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub enum Element {
    /// Terminates the row.
    End,
    /// Separates two alternatives.
    Alt,
    /// Expands another rule.
    RuleRef(RuleID),
    /// Matches exactly one character.
    Char(char),
    /// Matches a character in any of the class's ranges.
    Class(ClassID),
    /// Matches a character in none of the class's ranges.
    NegatedClass(ClassID),
    /// Matches any character.
    Any,
}

impl Element {
    /// Checks whether the element ends an alternative.
    #[inline]
    pub fn is_end_of_alternative(self) -> bool {
        matches!(self, Element::End | Element::Alt)
    }
}

/// The grammar struct that stores the rules in arena form.
#[derive(Clone)]
pub struct Grammar {
    root: RuleID,
    accepts_empty: bool,
    rules: JaggedArray<Element, Vec<usize>, 2>,
    alternative_starts: JaggedArray<u32, Vec<usize>, 2>,
    classes: JaggedArray<CharRange, Vec<usize>, 2>,
    names: DefaultStringInterner,
}

#[derive(Debug, thiserror::Error)]
/// The error type for errors in Grammar creation.
pub enum CreateGrammarError {
    #[error("GBNF parsing error: {0}")]
    /// Error due to parsing the grammar text.
    ParsingError(#[from] nom::Err<VerboseError<String>>), // The input is cloned so the error does not borrow the grammar text.
    #[error("The root rule `{0}` is not defined.")]
    /// The grammar does not define its root rule.
    MissingRoot(String),
    #[error("`{0}` is not a valid rule name.")]
    /// The requested root name cannot name any rule.
    InvalidRootName(String),
    #[error("Rule `{0}` is referenced but never defined.")]
    /// A rule reference has no definition.
    UndefinedRule(String),
    #[error("Rule `{0}` is left-recursive, which cannot be expanded by the stack-based matcher.")]
    /// A rule can reach itself without consuming a character.
    LeftRecursion(String),
    #[error("Rule `{rule}` contains the inverted character range {start:?}-{end:?}.")]
    /// A character range whose start is after its end.
    InvalidRange {
        /// The rule containing the range.
        rule: String,
        /// The start of the range.
        start: char,
        /// The end of the range.
        end: char,
    },
}

fn into_owned_error(e: nom::Err<VerboseError<&str>>) -> nom::Err<VerboseError<String>> {
    e.map(|e| VerboseError {
        errors: e
            .errors
            .into_iter()
            .map(|(input, kind)| (input.lines().next().unwrap_or_default().to_string(), kind))
            .collect(),
    })
}

/// Splits a rule row into its alternatives.
fn alternatives_of(row: &[Element]) -> impl Iterator<Item = &[Element]> {
    let body = match row.split_last() {
        Some((Element::End, body)) => body,
        _ => row,
    };
    body.split(|e| *e == Element::Alt)
}

struct GrammarBuilder {
    names: DefaultStringInterner,
    bodies: Vec<Option<Vec<Element>>>,
    classes: Vec<Vec<CharRange>>,
    /// Synthesized rule -> the written rule it was lowered from.
    lowered_from: AHashMap<usize, String>,
}

impl GrammarBuilder {
    fn new() -> Self {
        Self {
            names: DefaultStringInterner::new(),
            bodies: Vec::new(),
            classes: Vec::new(),
            lowered_from: AHashMap::default(),
        }
    }

    fn symbol(&mut self, name: &str) -> RuleID {
        let id = self.names.get_or_intern(name).to_usize();
        if self.bodies.len() <= id {
            self.bodies.resize(id + 1, None);
        }
        RuleID(id as u32)
    }

    fn fresh_symbol(&mut self, base: &str) -> RuleID {
        let mut n = self.names.len();
        loop {
            let name = format!("{}_{}", base, n);
            if self.names.get(&name).is_none() {
                let id = self.symbol(&name);
                self.lowered_from.insert(id.0 as usize, base.to_string());
                return id;
            }
            n += 1;
        }
    }

    fn name(&self, id: usize) -> String {
        SymbolU32::try_from_usize(id)
            .and_then(|s| self.names.resolve(s))
            .unwrap_or_default()
            .to_string()
    }

    /// The name of the written rule `id` comes from, which is `id` itself unless it was synthesized.
    fn written_name(&self, id: usize) -> String {
        match self.lowered_from.get(&id) {
            Some(base) => base.clone(),
            None => self.name(id),
        }
    }

    fn define(&mut self, id: RuleID, body: Vec<Element>) {
        let index = id.0 as usize;
        if self.bodies[index].is_some() {
            log::warn!(
                "Rule `{}` is defined more than once. The definitions are merged as alternatives.",
                self.name(index)
            );
        }
        match self.bodies[index].as_mut() {
            Some(existing) => {
                existing.pop();
                existing.push(Element::Alt);
                existing.extend(body);
            }
            None => self.bodies[index] = Some(body),
        }
    }

    fn lower_alternatives(
        &mut self,
        rule: &str,
        alternatives: &[Vec<Node>],
    ) -> Result<Vec<Element>, CreateGrammarError> {
        let mut row = Vec::new();
        for (i, sequence) in alternatives.iter().enumerate() {
            if i > 0 {
                row.push(Element::Alt);
            }
            for node in sequence {
                self.lower_node(rule, node, &mut row)?;
            }
        }
        row.push(Element::End);
        Ok(row)
    }

    fn lower_node(
        &mut self,
        rule: &str,
        node: &Node,
        out: &mut Vec<Element>,
    ) -> Result<(), CreateGrammarError> {
        match node {
            Node::Literal(text) => out.extend(text.chars().map(Element::Char)),
            Node::Class { negated, ranges } => {
                let mut class = Vec::with_capacity(ranges.len());
                for &(start, end) in ranges {
                    if start > end {
                        return Err(CreateGrammarError::InvalidRange {
                            rule: rule.to_string(),
                            start,
                            end,
                        });
                    }
                    class.push(CharRange { start, end });
                }
                let id = ClassID(self.classes.len() as u32);
                self.classes.push(class);
                out.push(if *negated {
                    Element::NegatedClass(id)
                } else {
                    Element::Class(id)
                });
            }
            Node::Any => out.push(Element::Any),
            Node::Reference(name) => out.push(Element::RuleRef(self.symbol(name))),
            Node::Group(alternatives) => {
                let id = self.fresh_symbol(rule);
                let row = self.lower_alternatives(rule, alternatives)?;
                self.define(id, row);
                out.push(Element::RuleRef(id));
            }
            Node::Repeat(inner, repetition) => {
                let id = self.fresh_symbol(rule);
                let mut item = Vec::new();
                self.lower_node(rule, inner, &mut item)?;
                // S* ::= S S* |
                // S+ ::= S S+ | S
                // S? ::= S |
                let mut row = item.clone();
                match repetition {
                    Repetition::ZeroOrMore => {
                        row.extend([Element::RuleRef(id), Element::Alt]);
                    }
                    Repetition::OneOrMore => {
                        row.extend([Element::RuleRef(id), Element::Alt]);
                        row.extend(item);
                    }
                    Repetition::Optional => row.push(Element::Alt),
                }
                row.push(Element::End);
                self.define(id, row);
                out.push(Element::RuleRef(id));
            }
        }
        Ok(())
    }

    fn finish(self, root: &str) -> Result<Grammar, CreateGrammarError> {
        let root_id = self
            .names
            .get(root)
            .map(|s| s.to_usize())
            .filter(|&id| self.bodies[id].is_some())
            .ok_or_else(|| CreateGrammarError::MissingRoot(root.to_string()))?;
        if let Some(id) = self.bodies.iter().position(Option::is_none) {
            return Err(CreateGrammarError::UndefinedRule(self.name(id)));
        }
        let bodies: Vec<Vec<Element>> = self.bodies.iter().flatten().cloned().collect();
        let nullable = nullable_rules(&bodies);
        if let Some(id) = find_left_recursion(&bodies, &nullable) {
            return Err(CreateGrammarError::LeftRecursion(self.written_name(id)));
        }
        let reachable = reachable_rules(&bodies, root_id);
        for (id, _) in reachable.iter().enumerate().filter(|(_, r)| !**r) {
            log::warn!(
                "Rule `{}` is not reachable from the root rule `{}` and will never be used.",
                self.name(id),
                root
            );
        }
        if nullable[root_id] {
            log::warn!(
                "The root rule `{}` accepts the empty string, so the end of sequence is allowed before any token.",
                root
            );
        }
        let mut rules = JaggedArray::<Element, Vec<usize>, 2>::new();
        let mut alternative_starts = JaggedArray::<u32, Vec<usize>, 2>::new();
        for row in bodies.iter() {
            rules.new_row::<0>();
            alternative_starts.new_row::<0>();
            alternative_starts.push_to_last_row(0);
            for (offset, &element) in row.iter().enumerate() {
                rules.push_to_last_row(element);
                if element == Element::Alt {
                    alternative_starts.push_to_last_row(offset as u32 + 1);
                }
            }
        }
        let mut classes = JaggedArray::<CharRange, Vec<usize>, 2>::new();
        for class in self.classes.iter() {
            classes.new_row::<0>();
            for &range in class {
                classes.push_to_last_row(range);
            }
        }
        Ok(Grammar {
            root: RuleID(root_id as u32),
            accepts_empty: nullable[root_id],
            rules,
            alternative_starts,
            classes,
            names: self.names,
        })
    }
}

/// Computes which rules can match the empty string.
fn nullable_rules(bodies: &[Vec<Element>]) -> Vec<bool> {
    let mut nullable = vec![false; bodies.len()];
    let mut changed = true;
    while changed {
        changed = false;
        for (id, row) in bodies.iter().enumerate() {
            if nullable[id] {
                continue;
            }
            let is_nullable = alternatives_of(row).any(|alternative| {
                alternative
                    .iter()
                    .all(|e| matches!(e, Element::RuleRef(r) if nullable[r.0 as usize]))
            });
            if is_nullable {
                nullable[id] = true;
                changed = true;
            }
        }
    }
    nullable
}

/// Finds a rule that can reach itself through leftmost, possibly nullable, references.
fn find_left_recursion(bodies: &[Vec<Element>], nullable: &[bool]) -> Option<usize> {
    let edges: Vec<Vec<usize>> = bodies
        .iter()
        .map(|row| {
            let mut edges = Vec::new();
            for alternative in alternatives_of(row) {
                for element in alternative {
                    match element {
                        Element::RuleRef(r) => {
                            edges.push(r.0 as usize);
                            if !nullable[r.0 as usize] {
                                break;
                            }
                        }
                        _ => break,
                    }
                }
            }
            edges
        })
        .collect();
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }
    fn visit(node: usize, edges: &[Vec<usize>], marks: &mut [Mark]) -> Option<usize> {
        marks[node] = Mark::InProgress;
        for &next in &edges[node] {
            match marks[next] {
                Mark::InProgress => return Some(next),
                Mark::Unvisited => {
                    if let Some(found) = visit(next, edges, marks) {
                        return Some(found);
                    }
                }
                Mark::Done => {}
            }
        }
        marks[node] = Mark::Done;
        None
    }
    let mut marks = vec![Mark::Unvisited; bodies.len()];
    (0..bodies.len()).find_map(|node| {
        if marks[node] == Mark::Unvisited {
            visit(node, &edges, &mut marks)
        } else {
            None
        }
    })
}

fn reachable_rules(bodies: &[Vec<Element>], root: usize) -> Vec<bool> {
    let mut reachable = vec![false; bodies.len()];
    let mut pending = vec![root];
    reachable[root] = true;
    while let Some(id) = pending.pop() {
        for element in bodies[id].iter() {
            if let Element::RuleRef(r) = element {
                let r = r.0 as usize;
                if !reachable[r] {
                    reachable[r] = true;
                    pending.push(r);
                }
            }
        }
    }
    reachable
}

impl Grammar {
    /// Create a new [`Grammar`] from GBNF grammar text, starting from the rule named [`DEFAULT_ROOT`].
    ///
    /// # Errors
    ///
    /// Returns a [`CreateGrammarError`] when the text does not parse, the root rule is missing,
    /// a referenced rule is undefined, a rule is left-recursive, or a character range is inverted.
    pub fn new(grammar_str: &str) -> Result<Self, CreateGrammarError> {
        Self::with_root(grammar_str, DEFAULT_ROOT)
    }

    /// Create a new [`Grammar`] from GBNF grammar text, starting from the rule named `root`.
    ///
    /// # Errors
    ///
    /// See [`Grammar::new`]. Additionally returns [`CreateGrammarError::InvalidRootName`] when `root` cannot name a rule.
    pub fn with_root(grammar_str: &str, root: &str) -> Result<Self, CreateGrammarError> {
        if !syntax::is_identifier(root) {
            return Err(CreateGrammarError::InvalidRootName(root.to_string()));
        }
        let definitions = syntax::parse_grammar(grammar_str).map_err(into_owned_error)?;
        let mut builder = GrammarBuilder::new();
        // Intern the defined names first so user rules get ids in definition order.
        for definition in definitions.iter() {
            builder.symbol(&definition.name);
        }
        for definition in definitions.iter() {
            let id = builder.symbol(&definition.name);
            let row = builder.lower_alternatives(&definition.name, &definition.alternatives)?;
            builder.define(id, row);
        }
        builder.finish(root)
    }

    #[inline]
    /// Get the root rule id.
    pub fn root(&self) -> RuleID {
        self.root
    }

    #[inline]
    /// Check whether the root rule matches the empty string.
    pub fn accepts_empty(&self) -> bool {
        self.accepts_empty
    }

    #[inline]
    /// Get the number of rules, including synthesized ones.
    pub fn rules_size(&self) -> usize {
        self.rules.len()
    }

    /// Get the name of a rule.
    pub fn rule_name(&self, rule_id: RuleID) -> Option<&str> {
        SymbolU32::try_from_usize(rule_id.0 as usize).and_then(|s| self.names.resolve(s))
    }

    /// Get the id of a rule by name.
    pub fn rule_id(&self, name: &str) -> Option<RuleID> {
        self.names
            .get(name)
            .map(|s| RuleID(s.to_usize() as u32))
            .filter(|id| (id.0 as usize) < self.rules.len())
    }

    #[inline]
    /// Get the element row of a rule.
    pub fn rule(&self, rule_id: RuleID) -> &[Element] {
        self.rules.view([rule_id.0 as usize]).as_slice()
    }

    #[inline]
    /// Get the offsets at which each alternative of a rule starts.
    pub fn alternative_starts(&self, rule_id: RuleID) -> &[u32] {
        self.alternative_starts
            .view([rule_id.0 as usize])
            .as_slice()
    }

    #[inline]
    /// Get the ranges of a character class.
    pub fn class(&self, class_id: ClassID) -> &[CharRange] {
        self.classes.view([class_id.0 as usize]).as_slice()
    }

    #[inline]
    /// Get the element at an offset of a rule.
    pub fn element(&self, rule_id: RuleID, offset: u32) -> Element {
        self.rule(rule_id)[offset as usize]
    }

    /// Check whether a character-matching element matches the character.
    /// Rule references and row markers never match.
    pub fn matches(&self, element: Element, c: char) -> bool {
        match element {
            Element::Char(x) => x == c,
            Element::Class(id) => self.class(id).iter().any(|r| r.contains(c)),
            Element::NegatedClass(id) => !self.class(id).iter().any(|r| r.contains(c)),
            Element::Any => true,
            Element::RuleRef(_) | Element::Alt | Element::End => false,
        }
    }

    /// Check whether a character-matching element matches some codepoint in the inclusive range `lo..=hi`.
    pub fn matches_any_in(&self, element: Element, lo: u32, hi: u32) -> bool {
        if lo > hi {
            return false;
        }
        match element {
            Element::Char(x) => (lo..=hi).contains(&(x as u32)),
            Element::Class(id) => self
                .class(id)
                .iter()
                .any(|r| r.start as u32 <= hi && r.end as u32 >= lo),
            Element::NegatedClass(id) => {
                let mut ranges: Vec<(u32, u32)> = self
                    .class(id)
                    .iter()
                    .map(|r| (r.start as u32, r.end as u32))
                    .collect();
                ranges.sort_unstable();
                // First codepoint in the range not yet known to be excluded.
                let mut next = lo;
                for (start, end) in ranges {
                    if end < next {
                        continue;
                    }
                    if start > next {
                        return true;
                    }
                    next = end + 1;
                    if next > hi {
                        return false;
                    }
                }
                true
            }
            Element::Any => true,
            Element::RuleRef(_) | Element::Alt | Element::End => false,
        }
    }

    fn write_alternative(&self, alternative: &[Element], out: &mut String) {
        if alternative.is_empty() {
            out.push_str("\"\"");
            return;
        }
        let mut literal: Option<String> = None;
        let mut parts: Vec<String> = Vec::new();
        for &element in alternative {
            if let Element::Char(c) = element {
                utils::escape_literal_char(c, literal.get_or_insert_with(String::new));
                continue;
            }
            if let Some(text) = literal.take() {
                parts.push(format!("\"{}\"", text));
            }
            parts.push(match element {
                Element::RuleRef(r) => self.rule_name(r).unwrap_or("?").to_string(),
                Element::Class(id) | Element::NegatedClass(id) => {
                    let mut class = String::from("[");
                    if matches!(element, Element::NegatedClass(_)) {
                        class.push('^');
                    }
                    for range in self.class(id) {
                        utils::escape_class_char(range.start, &mut class);
                        if range.end != range.start {
                            class.push('-');
                            utils::escape_class_char(range.end, &mut class);
                        }
                    }
                    class.push(']');
                    class
                }
                Element::Any => ".".to_string(),
                Element::Char(_) | Element::Alt | Element::End => continue,
            });
        }
        if let Some(text) = literal.take() {
            parts.push(format!("\"{}\"", text));
        }
        out.push_str(&parts.join(" "));
    }
}

impl Display for Grammar {
    /// Writes one `name ::= alternatives` line per rule, in rule id order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for id in 0..self.rules.len() {
            let rule_id = RuleID(id as u32);
            let mut line = format!("{} ::= ", self.rule_name(rule_id).unwrap_or("?"));
            for (i, alternative) in alternatives_of(self.rule(rule_id)).enumerate() {
                if i > 0 {
                    line.push_str(" | ");
                }
                self.write_alternative(alternative, &mut line);
            }
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

impl Debug for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grammar")
            .field("root", &self.root.to_display_form(self))
            .field("accepts_empty", &self.accepts_empty)
            .field("rules", &self.to_string())
            .finish()
    }
}
