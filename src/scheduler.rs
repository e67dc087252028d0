//! This module contains the [`BatchScheduler`], which owns position bookkeeping and the context budget.
use displaydoc::Display;

use crate::batch::{Batch, BatchEntry, BatchError};
use crate::model::{Context, Token};

/// The number of positions a prompt must leave free when nothing else is configured.
/// One position is the minimum needed for a single generation step.
pub const DEFAULT_RESERVED_MARGIN: usize = 1;

/// The only sequence this scheduler decodes.
const SEQUENCE_ID: u32 = 0;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
/// Why a generation completed.
pub enum StopReason {
    /// The model produced its end-of-sequence token.
    EndOfSequence,
    /// The grammar cannot accept any further input.
    GrammarFinished,
    /// The context limit was reached.
    ContextExhausted,
    /// The configured number of generated tokens was reached.
    TokenLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The lifecycle of a [`DecodeState`].
pub enum Phase {
    /// The budget has been checked but nothing has been decoded.
    Init,
    /// The prompt batch has been decoded.
    PromptSubmitted,
    /// At least one single-token batch has been decoded.
    Decoding,
    /// The generation ended normally.
    Completed(StopReason),
    /// A decode failed. The context's cache must be considered corrupted.
    Failed,
}

impl Phase {
    /// Checks whether no further batches may be submitted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed(_) | Phase::Failed)
    }
}

/// The position bookkeeping of one generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeState {
    current_position: usize,
    context_limit: usize,
    prompt_length: usize,
    sequence_id: u32,
    last_token: Option<Token>,
    phase: Phase,
}

impl DecodeState {
    /// Gets the position the next token will occupy.
    pub fn current_position(&self) -> usize {
        self.current_position
    }

    /// Gets the context limit.
    pub fn context_limit(&self) -> usize {
        self.context_limit
    }

    /// Gets the number of prompt tokens.
    pub fn prompt_length(&self) -> usize {
        self.prompt_length
    }

    /// Gets the number of tokens decoded after the prompt.
    pub fn generated(&self) -> usize {
        self.current_position.saturating_sub(self.prompt_length)
    }

    /// Gets the sequence id, which is always `0`.
    pub fn sequence_id(&self) -> u32 {
        self.sequence_id
    }

    /// Gets the last token submitted to the context.
    pub fn last_token(&self) -> Option<Token> {
        self.last_token
    }

    /// Gets the current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Marks the generation as completed. A failed state stays failed.
    pub fn complete(&mut self, reason: StopReason) {
        if self.phase != Phase::Failed {
            self.phase = Phase::Completed(reason);
        }
    }

    /// Marks the generation as failed.
    pub fn fail(&mut self) {
        self.phase = Phase::Failed;
    }

    /// Checks whether the context limit has been reached.
    pub fn is_budget_exhausted(&self) -> bool {
        self.current_position >= self.context_limit
    }
}

#[derive(Debug, thiserror::Error)]
/// The error type for [`BatchScheduler`] operations.
pub enum SchedulerError {
    #[error(
        "The prompt has {tokens} tokens, while at most {} fit in a context of {context_limit} tokens with {reserved_margin} reserved.",
        context_limit.saturating_sub(*reserved_margin)
    )]
    /// The prompt leaves less than the reserved margin of the context free.
    PromptTooLong {
        /// The number of prompt tokens.
        tokens: usize,
        /// The context limit.
        context_limit: usize,
        /// The reserved margin.
        reserved_margin: usize,
    },
    #[error("The prompt is empty after tokenization.")]
    /// There is nothing to decode, hence no logits to sample from.
    EmptyPrompt,
    #[error("Decoding failed at position {position} with return code {code}.")]
    /// The context rejected a batch. This is terminal.
    DecodeFailure {
        /// The position of the last entry in the failed batch.
        position: usize,
        /// The return code reported by the context.
        code: i32,
    },
    #[error("The context limit {0} has been reached.")]
    /// A step was requested while no position is left.
    ContextFull(usize),
    #[error("{0}")]
    /// A batch could not be built.
    Batch(#[from] BatchError),
    #[error("Cannot {operation} while the generation is in phase {phase:?}.")]
    /// The operation is not allowed in the current phase.
    InvalidPhase {
        /// The attempted operation.
        operation: &'static str,
        /// The phase at the time of the attempt.
        phase: Phase,
    },
}

/// Builds decode batches and submits them to a [`Context`].
///
/// The scheduler borrows the context mutably for its whole lifetime,
/// so no other component can submit batches during an active generation.
#[derive(Debug)]
pub struct BatchScheduler<'a, C: Context> {
    context: &'a mut C,
    batch: Batch,
    batch_size: usize,
    reserved_margin: usize,
}

impl<'a, C: Context> BatchScheduler<'a, C> {
    /// Creates a scheduler. A zero `batch_size` is raised to one and a zero `reserved_margin` to [`DEFAULT_RESERVED_MARGIN`].
    pub fn new(context: &'a mut C, batch_size: usize, reserved_margin: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            context,
            batch: Batch::with_capacity(batch_size),
            batch_size,
            reserved_margin: reserved_margin.max(DEFAULT_RESERVED_MARGIN),
        }
    }

    /// Gets the reserved margin.
    pub fn reserved_margin(&self) -> usize {
        self.reserved_margin
    }

    /// Gets the context.
    pub fn context(&self) -> &C {
        &*self.context
    }

    /// Gets the last submitted batch.
    pub fn last_batch(&self) -> &Batch {
        &self.batch
    }

    /// Checks the prompt against the context budget and creates the state of a new generation.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::PromptTooLong`] iff `tokens.len() > context_limit - reserved_margin`,
    /// and [`SchedulerError::EmptyPrompt`] when there are no tokens.
    pub fn begin_generation(
        &self,
        tokens: &[Token],
        context_limit: usize,
    ) -> Result<DecodeState, SchedulerError> {
        if tokens.is_empty() {
            return Err(SchedulerError::EmptyPrompt);
        }
        if tokens.len() > context_limit.saturating_sub(self.reserved_margin) {
            return Err(SchedulerError::PromptTooLong {
                tokens: tokens.len(),
                context_limit,
                reserved_margin: self.reserved_margin,
            });
        }
        Ok(DecodeState {
            current_position: 0,
            context_limit,
            prompt_length: tokens.len(),
            sequence_id: SEQUENCE_ID,
            last_token: None,
            phase: Phase::Init,
        })
    }

    /// Submits the prompt in batches of at most `batch_size` entries.
    /// Positions run on across batches and only the final entry of the last batch requests logits.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::DecodeFailure`] when the context rejects a batch; the state becomes [`Phase::Failed`].
    pub fn submit_prompt(
        &mut self,
        state: &mut DecodeState,
        tokens: &[Token],
    ) -> Result<(), SchedulerError> {
        if state.phase != Phase::Init {
            return Err(SchedulerError::InvalidPhase {
                operation: "submit the prompt",
                phase: state.phase,
            });
        }
        let Some(&last_token) = tokens.last() else {
            return Err(SchedulerError::EmptyPrompt);
        };
        let last = tokens.len() - 1;
        let chunks = tokens.len().div_ceil(self.batch_size);
        for (chunk_index, chunk) in tokens.chunks(self.batch_size).enumerate() {
            let first = chunk_index * self.batch_size;
            self.batch.clear();
            for (offset, &token) in chunk.iter().enumerate() {
                let position = first + offset;
                self.batch.push(BatchEntry {
                    token,
                    position,
                    sequence_id: state.sequence_id,
                    wants_logits: position == last,
                })?;
            }
            self.submit(state, first + chunk.len() - 1)?;
            log::trace!(
                "Prompt batch {}/{} of {} tokens decoded.",
                chunk_index + 1,
                chunks,
                chunk.len()
            );
        }
        state.current_position = tokens.len();
        state.last_token = Some(last_token);
        state.phase = Phase::PromptSubmitted;
        log::debug!(
            "Prompt of {} tokens submitted in {} batches; {} positions left.",
            tokens.len(),
            chunks,
            state.context_limit.saturating_sub(state.current_position)
        );
        Ok(())
    }

    /// Submits a single-token batch at the current position and advances the position by one.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::DecodeFailure`] when the context rejects the batch; the state becomes [`Phase::Failed`].
    /// Returns [`SchedulerError::ContextFull`] when the budget is exhausted.
    pub fn step(&mut self, state: &mut DecodeState, token: Token) -> Result<(), SchedulerError> {
        if !matches!(state.phase, Phase::PromptSubmitted | Phase::Decoding) {
            return Err(SchedulerError::InvalidPhase {
                operation: "decode a token",
                phase: state.phase,
            });
        }
        if state.is_budget_exhausted() {
            return Err(SchedulerError::ContextFull(state.context_limit));
        }
        let position = state.current_position;
        self.batch.clear();
        self.batch.push(BatchEntry {
            token,
            position,
            sequence_id: state.sequence_id,
            wants_logits: true,
        })?;
        self.submit(state, position)?;
        state.current_position += 1;
        state.last_token = Some(token);
        state.phase = Phase::Decoding;
        log::trace!("Decoded token {} at position {}.", token, position);
        Ok(())
    }

    /// Checks whether the context limit has been reached.
    pub fn is_budget_exhausted(&self, state: &DecodeState) -> bool {
        state.is_budget_exhausted()
    }

    /// Gets the index, inside the last submitted batch, of the entry whose logits drive the next sampling step.
    pub fn logits_index(&self) -> Option<usize> {
        self.batch.last_logits_index()
    }

    /// Gets the logits for the next sampling step.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidPhase`] when nothing that produces logits has been decoded.
    pub fn logits(&self, state: &DecodeState) -> Result<&[f32], SchedulerError> {
        let index = match state.phase {
            Phase::PromptSubmitted | Phase::Decoding => self.logits_index(),
            _ => None,
        };
        let index = index.ok_or(SchedulerError::InvalidPhase {
            operation: "read logits",
            phase: state.phase,
        })?;
        let logits = self.context.logits_ith(index);
        Ok(&logits[..logits.len().min(self.context.n_vocab())])
    }

    fn submit(&mut self, state: &mut DecodeState, position: usize) -> Result<(), SchedulerError> {
        if let Err(e) = self.context.decode(&self.batch) {
            state.fail();
            log::error!("{} Generation is aborted at position {}.", e, position);
            return Err(SchedulerError::DecodeFailure {
                position,
                code: e.0,
            });
        }
        Ok(())
    }
}
