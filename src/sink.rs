//! This module contains the [`StreamSink`] trait, which receives generated text as it is produced.
use std::sync::mpsc::Sender;

/// Receives the text of each accepted token.
///
/// [`emit`](StreamSink::emit) is called exactly once per accepted token, in generation order,
/// and the next decode step only starts after it returns.
/// A token that ends inside a multi-byte character emits the characters it completes, possibly none;
/// the rest of the character is emitted with the token that completes it.
pub trait StreamSink {
    /// Receives the text of one accepted token.
    fn emit(&mut self, text: &str);
}

impl<F> StreamSink for F
where
    F: FnMut(&str),
{
    fn emit(&mut self, text: &str) {
        self(text)
    }
}

impl StreamSink for Vec<String> {
    fn emit(&mut self, text: &str) {
        self.push(text.to_string());
    }
}

impl StreamSink for Sender<String> {
    /// A dropped receiver does not stop the generation; the text is discarded.
    fn emit(&mut self, text: &str) {
        if self.send(text.to_string()).is_err() {
            log::warn!("The receiver of the token stream has been dropped. The text is discarded.");
        }
    }
}

/// Turns token bytes into text, holding back an incomplete UTF-8 sequence until later bytes complete it.
#[derive(Debug, Default, Clone)]
pub(crate) struct PieceDecoder {
    pending: Vec<u8>,
}

impl PieceDecoder {
    /// Appends the bytes of a token and returns the text they complete.
    /// Bytes that can never be valid UTF-8 become U+FFFD.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(n) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[n..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        text
    }

    /// Gets the number of held bytes.
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
