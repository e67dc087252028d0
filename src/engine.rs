//! The main module that contains the [`GrammarEngine`] struct and its related types.
//!
//! The engine tracks every way the text consumed so far can be a prefix of a sentence of the grammar.
//! Each hypothesis is a stack of [`ElementRef`]s: the top points at the next element to match and
//! the frames below are the continuations of the callers. All hypotheses are advanced in parallel,
//! so no backtracking is needed.
use std::fmt::{self, Debug};
use std::sync::Arc;

use ahash::AHashSet;

use crate::engine_like::{sealed, AcceptTokenError, AcceptTokenResult, EngineLike};
use crate::grammar::{CreateGrammarError, Element, Grammar, RuleID};
use crate::utils;

/// A cursor into a rule row of a [`Grammar`].
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct ElementRef {
    /// The rule the cursor points into.
    pub rule: RuleID,
    /// The offset of the element inside the rule row.
    pub offset: u32,
}

impl ElementRef {
    /// Get the display form of the cursor.
    pub fn to_display_form(&self, grammar: &Grammar) -> String {
        format!("{}@{}", self.rule.to_display_form(grammar), self.offset)
    }
}

/// One hypothesis. The top of the stack is the last element and an empty stack is a complete parse.
pub type GrammarStack = Vec<ElementRef>;

/// Pushes `stack` to `out`, replacing a rule reference on top with the alternatives of the referenced rule
/// until every stack has a character-matching element on top or is empty.
fn advance_stack(
    grammar: &Grammar,
    mut stack: GrammarStack,
    out: &mut Vec<GrammarStack>,
    seen: &mut AHashSet<GrammarStack>,
) {
    let Some(&top) = stack.last() else {
        if seen.insert(Vec::new()) {
            out.push(Vec::new());
        }
        return;
    };
    match grammar.element(top.rule, top.offset) {
        Element::RuleRef(rule) => {
            stack.pop();
            let next = top.offset + 1;
            if !grammar.element(top.rule, next).is_end_of_alternative() {
                stack.push(ElementRef {
                    rule: top.rule,
                    offset: next,
                });
            }
            for &start in grammar.alternative_starts(rule) {
                let mut expanded = stack.clone();
                if !grammar.element(rule, start).is_end_of_alternative() {
                    expanded.push(ElementRef {
                        rule,
                        offset: start,
                    });
                }
                advance_stack(grammar, expanded, out, seen);
            }
        }
        Element::End | Element::Alt => {
            // Cursors never rest on a row marker, but popping keeps the walk total.
            stack.pop();
            advance_stack(grammar, stack, out, seen);
        }
        Element::Char(_) | Element::Class(_) | Element::NegatedClass(_) | Element::Any => {
            if !seen.contains(&stack) {
                seen.insert(stack.clone());
                out.push(stack);
            }
        }
    }
}

/// Advances every stack by one character. Stacks that cannot match the character are dropped.
fn accept_char(grammar: &Grammar, stacks: &[GrammarStack], c: char) -> Vec<GrammarStack> {
    let mut out = Vec::new();
    let mut seen = AHashSet::default();
    for stack in stacks {
        let Some(&top) = stack.last() else {
            continue;
        };
        if !grammar.matches(grammar.element(top.rule, top.offset), c) {
            continue;
        }
        let mut next_stack = stack[..stack.len() - 1].to_vec();
        let next = top.offset + 1;
        if !grammar.element(top.rule, next).is_end_of_alternative() {
            next_stack.push(ElementRef {
                rule: top.rule,
                offset: next,
            });
        }
        advance_stack(grammar, next_stack, &mut out, &mut seen);
    }
    out
}

/// Checks whether any stack can go on with a codepoint whose encoding starts with `prefix`.
fn accepts_prefix(grammar: &Grammar, stacks: &[GrammarStack], prefix: &[u8]) -> bool {
    let Some((lo, hi)) = utils::utf8_prefix_range(prefix) else {
        return false;
    };
    stacks.iter().any(|stack| {
        stack
            .last()
            .is_some_and(|top| grammar.matches_any_in(grammar.element(top.rule, top.offset), lo, hi))
    })
}

/// The grammar engine that accepts text continuations against a [`Grammar`].
///
/// Input arrives as bytes. A codepoint split across two inputs is held in a pending tail
/// and matched once its last byte arrives.
#[derive(Clone)]
pub struct GrammarEngine {
    grammar: Arc<Grammar>,
    stacks: Vec<GrammarStack>,
    initial_stacks: Vec<GrammarStack>,
    pending: Vec<u8>,
}

impl GrammarEngine {
    /// Create a new [`GrammarEngine`] positioned at the start of the grammar's root rule.
    pub fn new(grammar: Arc<Grammar>) -> Self {
        let root = grammar.root();
        let mut stacks = Vec::new();
        let mut seen = AHashSet::default();
        for &start in grammar.alternative_starts(root) {
            let stack = if grammar.element(root, start).is_end_of_alternative() {
                Vec::new()
            } else {
                vec![ElementRef {
                    rule: root,
                    offset: start,
                }]
            };
            advance_stack(&grammar, stack, &mut stacks, &mut seen);
        }
        Self {
            grammar,
            initial_stacks: stacks.clone(),
            stacks,
            pending: Vec::new(),
        }
    }

    /// Create a new [`GrammarEngine`] from GBNF grammar text.
    ///
    /// # Errors
    ///
    /// Returns a [`CreateGrammarError`] when the grammar cannot be loaded.
    pub fn from_grammar_str(grammar_str: &str) -> Result<Self, CreateGrammarError> {
        Ok(Self::new(Arc::new(Grammar::new(grammar_str)?)))
    }

    /// Get the grammar.
    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.grammar
    }

    /// Get the live stacks.
    pub fn stacks(&self) -> &[GrammarStack] {
        &self.stacks
    }

    /// Get the bytes of an incomplete codepoint waiting for the rest of its encoding.
    pub fn pending_bytes(&self) -> &[u8] {
        &self.pending
    }

    /// Computes the stacks and the pending tail after `bytes`. `None` when the bytes are rejected.
    fn advance_bytes(&self, bytes: &[u8]) -> Option<(Vec<GrammarStack>, Vec<u8>)> {
        let mut buffer = self.pending.clone();
        buffer.extend_from_slice(bytes);
        let (text, tail) = match std::str::from_utf8(&buffer) {
            Ok(text) => (text, &[][..]),
            Err(e) if e.error_len().is_none() => {
                let (valid, tail) = buffer.split_at(e.valid_up_to());
                (std::str::from_utf8(valid).ok()?, tail)
            }
            Err(_) => return None,
        };
        let mut stacks = self.stacks.clone();
        for c in text.chars() {
            stacks = accept_char(&self.grammar, &stacks, c);
            if stacks.is_empty() {
                return None;
            }
        }
        if !tail.is_empty() && !accepts_prefix(&self.grammar, &stacks, tail) {
            return None;
        }
        Some((stacks, tail.to_vec()))
    }

    fn finished_or_ongoing(&self) -> AcceptTokenResult {
        if self.is_finished() {
            AcceptTokenResult::Finished
        } else {
            AcceptTokenResult::Ongoing
        }
    }
}

impl sealed::Sealed for GrammarEngine {}

impl EngineLike for GrammarEngine {
    /// Empty input is a no-op and always succeeds.
    fn try_accept_new_bytes(
        &mut self,
        bytes: &[u8],
    ) -> Result<AcceptTokenResult, AcceptTokenError> {
        if bytes.is_empty() {
            return Ok(self.finished_or_ongoing());
        }
        if self.is_finished() {
            return Err(AcceptTokenError::Finished);
        }
        let (stacks, pending) = self.advance_bytes(bytes).ok_or(AcceptTokenError::Rejected)?;
        self.stacks = stacks;
        self.pending = pending;
        Ok(self.finished_or_ongoing())
    }

    fn accepts_bytes(&self, bytes: &[u8]) -> bool {
        bytes.is_empty() || (!self.is_finished() && self.advance_bytes(bytes).is_some())
    }

    fn can_finish(&self) -> bool {
        self.pending.is_empty() && self.stacks.iter().any(|s| s.is_empty())
    }

    fn is_finished(&self) -> bool {
        self.pending.is_empty() && self.stacks.iter().all(|s| s.is_empty())
    }

    fn reset(&mut self) {
        self.stacks.clone_from(&self.initial_stacks);
        self.pending.clear();
    }
}

impl Debug for GrammarEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stacks: Vec<Vec<String>> = self
            .stacks
            .iter()
            .map(|stack| {
                stack
                    .iter()
                    .map(|e| e.to_display_form(&self.grammar))
                    .collect()
            })
            .collect();
        f.debug_struct("GrammarEngine")
            .field("grammar", &self.grammar)
            .field("stacks", &stacks)
            .field("pending", &utils::get_display_form_from_bytes(&self.pending))
            .finish()
    }
}
