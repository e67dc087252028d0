//! This module contains the [`CandidateSet`] struct, the per-step view of a model's output distribution.
use std::cmp::Ordering;

use crate::model::Token;

/// A token together with its logit and derived probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// The token id.
    pub token: Token,
    /// The raw logit produced by the model.
    pub logit: f32,
    /// The probability derived by [`CandidateSet::softmax`]. It is `0.0` until computed.
    pub probability: f32,
}

/// One candidate per vocabulary entry for a single sampling step.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    candidates: Vec<Candidate>,
    sorted: bool,
}

#[inline]
fn sanitize(logit: f32) -> f32 {
    if logit.is_nan() {
        f32::NEG_INFINITY
    } else {
        logit
    }
}

impl CandidateSet {
    /// Creates a candidate set where the token id of each candidate is its index in `logits`.
    pub fn from_logits(logits: &[f32]) -> Self {
        let candidates = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| Candidate {
                token: Token(id as u32),
                logit,
                probability: 0.0,
            })
            .collect();
        Self {
            candidates,
            sorted: false,
        }
    }

    /// Gets the number of candidates.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Checks whether the set has no candidates.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Gets the candidates in their current order.
    pub fn as_slice(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Iterates over the candidates in their current order.
    pub fn iter(&self) -> std::slice::Iter<'_, Candidate> {
        self.candidates.iter()
    }

    /// Checks whether [`CandidateSet::sort_by_probability`] has been applied.
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Gets the candidate of a token.
    pub fn get(&self, token: Token) -> Option<&Candidate> {
        if self.sorted {
            self.candidates.iter().find(|c| c.token == token)
        } else {
            self.candidates
                .get(token.as_usize())
                .filter(|c| c.token == token)
        }
    }

    /// Computes `softmax(logit / temperature)` into each candidate's probability.
    ///
    /// NaN logits are treated as negative infinity. If every logit is negative infinity, all probabilities are zero.
    /// A non-positive temperature is treated as `1.0`.
    pub fn softmax(&mut self, temperature: f32) {
        let temperature = if temperature > 0.0 { temperature } else { 1.0 };
        let max = self
            .candidates
            .iter()
            .map(|c| sanitize(c.logit))
            .fold(f32::NEG_INFINITY, f32::max);
        if max == f32::NEG_INFINITY {
            self.candidates.iter_mut().for_each(|c| c.probability = 0.0);
            return;
        }
        let mut sum = 0.0f64;
        for candidate in self.candidates.iter_mut() {
            let p = ((sanitize(candidate.logit) - max) / temperature).exp();
            candidate.probability = p;
            sum += p as f64;
        }
        for candidate in self.candidates.iter_mut() {
            candidate.probability = (candidate.probability as f64 / sum) as f32;
        }
    }

    /// Gets the candidate with the highest logit. Ties go to the lowest token id and NaN logits never win.
    pub fn argmax(&self) -> Option<&Candidate> {
        self.candidates.iter().fold(None, |best: Option<&Candidate>, c| {
            let Some(b) = best else {
                return Some(c);
            };
            match sanitize(c.logit).total_cmp(&sanitize(b.logit)) {
                Ordering::Greater => Some(c),
                Ordering::Equal if c.token < b.token => Some(c),
                _ => Some(b),
            }
        })
    }

    /// Sorts the candidates by descending probability.
    /// Equal probabilities fall back to descending logit and then ascending token id,
    /// so the order is total and reproducible even when small probabilities underflow to zero.
    pub fn sort_by_probability(&mut self) {
        self.candidates.sort_by(|a, b| {
            b.probability
                .total_cmp(&a.probability)
                .then_with(|| sanitize(b.logit).total_cmp(&sanitize(a.logit)))
                .then_with(|| a.token.cmp(&b.token))
        });
        self.sorted = true;
    }
}

impl<'a> IntoIterator for &'a CandidateSet {
    type Item = &'a Candidate;
    type IntoIter = std::slice::Iter<'a, Candidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.iter()
    }
}
