//! This module contains the [`EngineLike`] trait, which defines the behavior of an engine-like object.

use displaydoc::Display;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
/// Represents the error when an [`EngineLike`] tries to accept a text continuation.
pub enum AcceptTokenError {
    /// The text is rejected and the [`EngineLike`]'s internal states are not updated.
    Rejected,
    /// The [`EngineLike`] is finished, as defined by its grammar. No more text can be accepted.
    Finished,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
/// Represents the result after [`EngineLike`] successfully accepts a text continuation.
pub enum AcceptTokenResult {
    /// The text is accepted and the [`EngineLike`] can accept more text.
    Ongoing,
    /// The [`EngineLike`] is finished and no more text can be accepted.
    Finished,
}

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// A trait that defines the behavior of an [`EngineLike`] object.
pub trait EngineLike: sealed::Sealed {
    /// Tries to accept new bytes, one codepoint at a time.
    ///
    /// An incomplete UTF-8 sequence at the end of the bytes is held until later bytes complete it.
    /// It is accepted only if some codepoint starting with those bytes could be accepted.
    ///
    /// # Arguments
    ///
    /// * `bytes` - The bytes of a token.
    ///
    /// # Returns
    ///
    /// * [`AcceptTokenResult`] - The result of accepting the bytes.
    ///
    /// # Errors
    ///
    /// Returns an [`AcceptTokenError`] when the bytes are not accepted. Check the error type docs for more details.
    /// The [`EngineLike`] internal states are not updated in this case.
    fn try_accept_new_bytes(&mut self, bytes: &[u8]) -> Result<AcceptTokenResult, AcceptTokenError>;

    /// Checks whether the bytes would be accepted, without updating the internal states.
    fn accepts_bytes(&self, bytes: &[u8]) -> bool;

    /// Tries to accept a text continuation. See [`EngineLike::try_accept_new_bytes`].
    ///
    /// # Errors
    ///
    /// Returns an [`AcceptTokenError`] when the text is not accepted.
    fn try_accept_str(&mut self, text: &str) -> Result<AcceptTokenResult, AcceptTokenError> {
        self.try_accept_new_bytes(text.as_bytes())
    }

    /// Checks whether the text would be accepted, without updating the internal states.
    fn accepts(&self, text: &str) -> bool {
        self.accepts_bytes(text.as_bytes())
    }

    /// Checks whether the text consumed so far is a complete sentence of the grammar,
    /// that is, whether the end of sequence is allowed now. Never true while a codepoint is incomplete.
    fn can_finish(&self) -> bool;

    /// Checks if the engine is finished: no further text can be accepted.
    fn is_finished(&self) -> bool;

    /// Resets the engine to its initial state.
    fn reset(&mut self);
}
