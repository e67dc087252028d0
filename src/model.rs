//! This module contains the collaborator traits through which the decoding loop drives a language model.
//!
//! The loop never sees weights, kernels or the key-value cache directly. A [`Backend`] loads a [`Model`],
//! a [`Model`] creates a [`Context`], and the [`Context`] is the only object that owns cache state.
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::batch::Batch;
use crate::config::{Config, NumaStrategy};

/// The wrapper struct that represents a token id in a language model's vocabulary.
///
/// The meaning of the id is defined by the model's vocabulary; equality and ordering are identity only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Token(pub u32);

impl Token {
    /// Get the token id as an index into a logits array.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
/// The error type for model and context creation.
pub enum ModelLoadError {
    #[error("Failed to load the model from {path:?}: {reason}")]
    /// The backend could not load the model weights.
    Model {
        /// The path the backend tried to load.
        path: std::path::PathBuf,
        /// The backend's description of the failure.
        reason: String,
    },
    #[error("Failed to create a context: {0}")]
    /// The model could not create a fresh context.
    Context(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("The context returned code {0} while decoding a batch.")]
/// A non-zero return code reported by [`Context::decode`].
pub struct DecodeError(pub i32);

/// The per-generation parameters a [`Model`] needs to create a [`Context`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextParams {
    /// The number of positions in the key-value cache.
    pub context_size: usize,
    /// The preferred maximum number of entries in one decode batch.
    pub batch_size: usize,
    /// The number of threads used by the backend. `None` lets the backend decide.
    pub threads: Option<usize>,
    /// The seed forwarded to the context. `None` means a random seed.
    pub seed: Option<u64>,
}

/// A backend that can load models.
pub trait Backend {
    /// The model type produced by the backend.
    type Model: Model;

    /// Initializes process-level backend state. The default implementation does nothing.
    fn init(&self, _numa: NumaStrategy) {}

    /// Loads the model stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`ModelLoadError`] when the weights cannot be loaded.
    fn load_model(&self, path: &Path, config: &Config) -> Result<Self::Model, ModelLoadError>;
}

/// A loaded model. A model is immutable; all mutable decode state lives in its contexts.
pub trait Model {
    /// The context type created by the model.
    type Context: Context;

    /// Creates a fresh context with an empty key-value cache.
    ///
    /// # Errors
    ///
    /// Returns a [`ModelLoadError`] when the context cannot be allocated.
    fn new_context(&self, params: &ContextParams) -> Result<Self::Context, ModelLoadError>;
}

/// A model context, which owns the key-value cache for one sequence.
///
/// The cache is mutated only through [`Context::decode`].
/// Callers must serialize access to one context; no internal locking is assumed.
pub trait Context {
    /// Evaluates a batch, appending its entries to the key-value cache.
    ///
    /// # Errors
    ///
    /// Returns the backend's non-zero return code. After a failure the cache state is unspecified.
    fn decode(&mut self, batch: &Batch) -> Result<(), DecodeError>;

    /// Gets the logits produced for the `index`-th entry of the last decoded batch.
    /// The entry must have requested logits.
    fn logits_ith(&self, index: usize) -> &[f32];

    /// Gets the size of the vocabulary.
    fn n_vocab(&self) -> usize;

    /// Converts text into tokens, optionally prefixed with the beginning-of-sequence token.
    fn tokenize(&self, text: &str, add_bos: bool) -> Vec<Token>;

    /// Converts a token into the bytes of its text fragment.
    ///
    /// A byte-fallback token may hold only part of a multi-byte UTF-8 sequence, so the result need not be valid UTF-8.
    fn token_to_piece(&self, token: Token) -> Vec<u8>;

    /// Gets the end-of-sequence token.
    fn eos_token(&self) -> Token;
}
