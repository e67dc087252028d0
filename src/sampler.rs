//! This module contains the [`Sampler`], which turns a [`CandidateSet`] into the next token.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::candidates::CandidateSet;
use crate::config::Config;
use crate::engine_like::EngineLike;
use crate::model::Token;
use crate::utils;

/// How a [`Sampler`] picks a token from an unconstrained distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingMode {
    /// Always pick the highest logit.
    Greedy,
    /// Draw from `softmax(logits / temperature)`.
    Temperature(f32),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// The error type for sampling.
pub enum SampleError {
    #[error("The grammar rejected all {candidates} candidate tokens. No valid continuation exists.")]
    /// Every candidate was rejected by the grammar.
    NoValidToken {
        /// The number of candidates tried.
        candidates: usize,
    },
    #[error("The candidate set is empty.")]
    /// The model produced no logits.
    EmptyCandidates,
}

/// Picks tokens, optionally filtered by an [`EngineLike`].
#[derive(Debug, Clone)]
pub struct Sampler {
    mode: SamplingMode,
    /// Only temperature sampling draws; greedy samplers carry no generator.
    rng: Option<StdRng>,
}

impl Sampler {
    /// Creates a greedy sampler.
    pub fn greedy() -> Self {
        Self {
            mode: SamplingMode::Greedy,
            rng: None,
        }
    }

    /// Creates a sampler. A non-positive temperature selects greedy sampling.
    /// A `None` seed draws one from the operating system.
    pub fn new(temperature: f32, seed: Option<u64>) -> Self {
        if !(temperature > 0.0 && temperature.is_finite()) {
            return Self::greedy();
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            mode: SamplingMode::Temperature(temperature),
            rng: Some(rng),
        }
    }

    /// Creates a sampler from the temperature and seed of a [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.temperature, config.seed)
    }

    /// Gets the sampling mode.
    pub fn mode(&self) -> SamplingMode {
        self.mode
    }

    /// Picks the token with the highest logit. Ties go to the lowest token id.
    ///
    /// Returns `None` only when the set is empty.
    pub fn sample_greedy(&self, candidates: &CandidateSet) -> Option<Token> {
        candidates.argmax().map(|c| c.token)
    }

    /// Picks a token without any grammar.
    ///
    /// # Errors
    ///
    /// Returns [`SampleError::EmptyCandidates`] when the set is empty.
    pub fn sample(&mut self, candidates: &mut CandidateSet) -> Result<Token, SampleError> {
        let token = match self.mode {
            SamplingMode::Greedy => self.sample_greedy(candidates),
            SamplingMode::Temperature(temperature) => {
                candidates.softmax(temperature);
                self.draw(candidates)
                    .or_else(|| self.sample_greedy(candidates))
            }
        };
        token.ok_or(SampleError::EmptyCandidates)
    }

    /// Picks the first token whose bytes the engine accepts, and advances the engine over those bytes.
    ///
    /// Candidates are tried in descending probability, ties going to the higher logit and then the lower token id.
    /// Under temperature sampling a drawn token is tried first.
    /// The end-of-sequence token is acceptable iff the engine can finish; it does not advance the engine.
    /// A token with no bytes is never acceptable. A token ending inside a multi-byte character is
    /// acceptable when the grammar allows some character starting with those bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SampleError::NoValidToken`] when every candidate is rejected,
    /// and [`SampleError::EmptyCandidates`] when there is nothing to try.
    pub fn sample_grammar_constrained<E, F, P>(
        &mut self,
        candidates: &mut CandidateSet,
        engine: &mut E,
        mut piece_of: F,
        eos: Token,
    ) -> Result<Token, SampleError>
    where
        E: EngineLike + ?Sized,
        F: FnMut(Token) -> P,
        P: AsRef<[u8]>,
    {
        if candidates.is_empty() {
            return Err(SampleError::EmptyCandidates);
        }
        let proposal = match self.mode {
            SamplingMode::Greedy => {
                candidates.softmax(1.0);
                None
            }
            SamplingMode::Temperature(temperature) => {
                candidates.softmax(temperature);
                self.draw(candidates)
            }
        };
        if let Some(token) = proposal {
            if try_accept(engine, &mut piece_of, token, eos) {
                return Ok(token);
            }
        }
        candidates.sort_by_probability();
        for candidate in candidates.iter() {
            if Some(candidate.token) == proposal {
                continue;
            }
            if try_accept(engine, &mut piece_of, candidate.token, eos) {
                return Ok(candidate.token);
            }
        }
        Err(SampleError::NoValidToken {
            candidates: candidates.len(),
        })
    }

    /// Draws a token from the computed probabilities.
    /// `None` when no candidate has positive probability or the sampler is greedy.
    fn draw(&mut self, candidates: &CandidateSet) -> Option<Token> {
        let rng = self.rng.as_mut()?;
        let total: f64 = candidates.iter().map(|c| c.probability as f64).sum();
        if !(total > 0.0) {
            return None;
        }
        let mut target = rng.gen::<f64>() * total;
        let mut last = None;
        for candidate in candidates.iter().filter(|c| c.probability > 0.0) {
            last = Some(candidate.token);
            target -= candidate.probability as f64;
            if target < 0.0 {
                break;
            }
        }
        last
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::greedy()
    }
}

fn try_accept<E, F, P>(engine: &mut E, piece_of: &mut F, token: Token, eos: Token) -> bool
where
    E: EngineLike + ?Sized,
    F: FnMut(Token) -> P,
    P: AsRef<[u8]>,
{
    if token == eos {
        let accepted = engine.can_finish();
        if !accepted {
            log::trace!("Rejected the end of sequence: the grammar cannot finish here.");
        }
        return accepted;
    }
    let piece = piece_of(token);
    let piece = piece.as_ref();
    if piece.is_empty() {
        log::trace!("Rejected token {} with empty text.", token);
        return false;
    }
    match engine.try_accept_new_bytes(piece) {
        Ok(_) => true,
        Err(e) => {
            log::trace!(
                "Rejected token {} {}: {}.",
                token,
                utils::get_display_form_from_bytes(piece),
                e
            );
            false
        }
    }
}
