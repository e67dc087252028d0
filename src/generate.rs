//! The entry points of the crate: [`load_model`] and [`generate`], and the crate-level error type.
use crate::candidates::CandidateSet;
use crate::config::{Config, ConfigParseError};
use crate::engine::GrammarEngine;
use crate::engine_like::EngineLike;
use crate::grammar::CreateGrammarError;
use crate::model::{Backend, Context, Model, ModelLoadError, Token};
use crate::sampler::{SampleError, Sampler};
use crate::scheduler::{BatchScheduler, DecodeState, SchedulerError, StopReason};
use crate::sink::{PieceDecoder, StreamSink};
use crate::utils;

/// The kind of a [`GenerateError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ErrorKind {
    /// The configuration string is malformed.
    ConfigParseError,
    /// The model or its context could not be created.
    ModelLoadError,
    /// The prompt does not fit in the context.
    PromptTooLong,
    /// The grammar text is malformed.
    GrammarLoadError,
    /// The model failed to decode a batch.
    DecodeFailure,
    /// The grammar rejected every candidate token.
    NoValidToken,
}

impl ErrorKind {
    /// Checks whether the error is caused by the caller's configuration rather than by the run itself.
    pub fn is_configuration_error(self) -> bool {
        matches!(
            self,
            ErrorKind::ConfigParseError | ErrorKind::ModelLoadError | ErrorKind::PromptTooLong
        )
    }

    /// Checks whether the error is caused by the grammar, either at load time or by a mismatch with the model.
    pub fn is_grammar_error(self) -> bool {
        matches!(self, ErrorKind::GrammarLoadError | ErrorKind::NoValidToken)
    }
}

#[derive(Debug, thiserror::Error)]
/// The error type of [`load_model`] and [`generate`]. Every variant is fatal and nothing is retried.
pub enum GenerateError {
    #[error("{0}")] // inherits the error message from the wrapped ConfigParseError
    /// A wrapper for the [`ConfigParseError`] error type.
    Config(#[from] ConfigParseError),
    #[error("{0}")]
    /// A wrapper for the [`ModelLoadError`] error type.
    ModelLoad(#[from] ModelLoadError),
    #[error("{0}")]
    /// A wrapper for the [`CreateGrammarError`] error type.
    Grammar(#[from] CreateGrammarError),
    #[error("{0}")]
    /// A wrapper for the [`SchedulerError`] error type.
    Scheduler(#[from] SchedulerError),
    #[error("{0}")]
    /// A wrapper for the [`SampleError`] error type.
    Sample(#[from] SampleError),
}

impl GenerateError {
    /// Gets the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerateError::Config(_) => ErrorKind::ConfigParseError,
            GenerateError::ModelLoad(_) => ErrorKind::ModelLoadError,
            GenerateError::Grammar(_) => ErrorKind::GrammarLoadError,
            GenerateError::Scheduler(
                SchedulerError::PromptTooLong { .. } | SchedulerError::EmptyPrompt,
            ) => ErrorKind::PromptTooLong,
            GenerateError::Scheduler(_) => ErrorKind::DecodeFailure,
            GenerateError::Sample(SampleError::NoValidToken { .. }) => ErrorKind::NoValidToken,
            GenerateError::Sample(SampleError::EmptyCandidates) => ErrorKind::DecodeFailure,
        }
    }
}

/// What a successful generation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenerationSummary {
    /// Why the generation stopped.
    pub stop_reason: StopReason,
    /// The number of prompt tokens.
    pub prompt_tokens: usize,
    /// The number of tokens decoded after the prompt. Each one was emitted to the sink.
    pub generated_tokens: usize,
    /// The position the next token would have occupied.
    pub final_position: usize,
}

/// Loads a model described by a configuration string.
///
/// The backend is initialized with the configured NUMA policy first.
///
/// # Errors
///
/// Returns [`ErrorKind::ConfigParseError`] when the string is malformed or names no model,
/// and [`ErrorKind::ModelLoadError`] when the backend fails.
pub fn load_model<B: Backend>(backend: &B, config_text: &str) -> Result<B::Model, GenerateError> {
    let config = Config::from_args(config_text)?;
    let path = config.model_path()?;
    backend.init(config.numa);
    log::info!("Loading the model from {:?}.", path);
    Ok(backend.load_model(path, &config)?)
}

/// Generates text after `prompt`, calling `sink` once per generated token.
///
/// When `grammar_text` is present and not blank, every emitted token is accepted by the grammar.
///
/// # Errors
///
/// Returns a [`GenerateError`]; see [`ErrorKind`] for the possible kinds.
/// Configuration and grammar errors are reported before the model is touched.
pub fn generate<M, S>(
    model: &M,
    prompt: &str,
    config_text: &str,
    grammar_text: Option<&str>,
    sink: &mut S,
) -> Result<GenerationSummary, GenerateError>
where
    M: Model,
    S: StreamSink + ?Sized,
{
    let config = Config::from_args(config_text)?;
    generate_with_config(model, prompt, &config, grammar_text, sink)
}

/// Same as [`generate`] with an already parsed [`Config`].
///
/// # Errors
///
/// See [`generate`].
pub fn generate_with_config<M, S>(
    model: &M,
    prompt: &str,
    config: &Config,
    grammar_text: Option<&str>,
    sink: &mut S,
) -> Result<GenerationSummary, GenerateError>
where
    M: Model,
    S: StreamSink + ?Sized,
{
    let mut engine = match grammar_text.filter(|text| !text.trim().is_empty()) {
        Some(text) => Some(GrammarEngine::from_grammar_str(text)?),
        None => None,
    };
    let mut context = model.new_context(&config.context_params())?;
    generate_in_context(&mut context, prompt, config, engine.as_mut(), sink)
}

/// Runs the decoding loop on an existing context, which must be fresh.
///
/// # Errors
///
/// See [`generate`]. After a decode failure the context must be discarded.
pub fn generate_in_context<C, S>(
    context: &mut C,
    prompt: &str,
    config: &Config,
    mut engine: Option<&mut GrammarEngine>,
    sink: &mut S,
) -> Result<GenerationSummary, GenerateError>
where
    C: Context,
    S: StreamSink + ?Sized,
{
    log::debug!("{:?}", config);
    let tokens = context.tokenize(prompt, config.add_bos);
    if log::log_enabled!(log::Level::Debug) {
        let pieces: Vec<String> = tokens
            .iter()
            .map(|&t| utils::get_display_form_from_bytes(&context.token_to_piece(t)))
            .collect();
        log::debug!("Prompt tokens: [{}]", pieces.join(", "));
    }
    let mut sampler = Sampler::from_config(config);
    let mut scheduler = BatchScheduler::new(context, config.batch_size, config.reserved_margin);
    let mut state = scheduler.begin_generation(&tokens, config.context_size)?;
    let mut decoder = PieceDecoder::default();
    log::info!(
        "Generating with a prompt of {} tokens in a context of {} tokens{}.",
        tokens.len(),
        config.context_size,
        if engine.is_some() { " under a grammar" } else { "" }
    );
    let result = decode_loop(
        &mut scheduler,
        &mut state,
        &tokens,
        config,
        &mut sampler,
        engine.as_deref_mut(),
        &mut decoder,
        sink,
    );
    if decoder.pending_len() > 0 {
        log::warn!(
            "Generation stopped inside a multi-byte character; {} trailing bytes were not emitted.",
            decoder.pending_len()
        );
    }
    match result {
        Ok(stop_reason) => {
            state.complete(stop_reason);
            log::info!(
                "Generation stopped ({}) after {} tokens at position {}.",
                stop_reason,
                state.generated(),
                state.current_position()
            );
            Ok(GenerationSummary {
                stop_reason,
                prompt_tokens: state.prompt_length(),
                generated_tokens: state.generated(),
                final_position: state.current_position(),
            })
        }
        Err(e) => {
            state.fail();
            log::info!(
                "Generation failed after {} tokens at position {}: {}",
                state.generated(),
                state.current_position(),
                e
            );
            Err(e)
        }
    }
}

fn decode_loop<C, S>(
    scheduler: &mut BatchScheduler<'_, C>,
    state: &mut DecodeState,
    tokens: &[Token],
    config: &Config,
    sampler: &mut Sampler,
    mut engine: Option<&mut GrammarEngine>,
    decoder: &mut PieceDecoder,
    sink: &mut S,
) -> Result<StopReason, GenerateError>
where
    C: Context,
    S: StreamSink + ?Sized,
{
    scheduler.submit_prompt(state, tokens)?;
    let eos = scheduler.context().eos_token();
    loop {
        if scheduler.is_budget_exhausted(state) {
            return Ok(StopReason::ContextExhausted);
        }
        if config.n_predict.is_some_and(|n| state.generated() >= n) {
            return Ok(StopReason::TokenLimit);
        }
        let mut candidates = CandidateSet::from_logits(scheduler.logits(state)?);
        let token = match engine.as_deref_mut() {
            Some(engine) => {
                let context = scheduler.context();
                sampler.sample_grammar_constrained(
                    &mut candidates,
                    engine,
                    |t| context.token_to_piece(t),
                    eos,
                )?
            }
            None => sampler.sample(&mut candidates)?,
        };
        if token == eos {
            return Ok(StopReason::EndOfSequence);
        }
        let piece = scheduler.context().token_to_piece(token);
        log::trace!(
            "Position {}: token {} {}",
            state.current_position(),
            token,
            utils::get_display_form_from_bytes(&piece)
        );
        sink.emit(&decoder.push(&piece));
        scheduler.step(state, token)?;
        if engine.as_deref().is_some_and(|e| e.is_finished()) {
            return Ok(StopReason::GrammarFinished);
        }
    }
}
