//! The configuration module of the decoding loop.
//!
//! A [`Config`] is built once per call from a whitespace-separated list of flag/value pairs,
//! for example `-m models/7B.gguf -c 2048 --seed 42 --numa distribute`.
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::batch::Batch;
use crate::model::ContextParams;
use crate::scheduler::DEFAULT_RESERVED_MARGIN;

/// The NUMA policy forwarded to [`Backend::init`](crate::model::Backend::init).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NumaStrategy {
    /// NUMA optimizations are disabled.
    #[default]
    Disabled,
    /// Spread execution evenly over all nodes.
    Distribute,
    /// Only spawn threads on CPUs on the node that execution started on.
    Isolate,
    /// Use the CPU map provided by numactl.
    Numactl,
    /// Mirror the model across nodes.
    Mirror,
}

/// The configuration of one model load or one generation call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// The path of the model weights. Required by [`load_model`](crate::generate::load_model).
    pub model_path: Option<PathBuf>,
    /// The random seed. `None` means a seed drawn from the operating system.
    pub seed: Option<u64>,
    /// The NUMA policy.
    pub numa: NumaStrategy,
    /// The number of threads. `None` lets the backend decide.
    pub threads: Option<usize>,
    /// The context limit, in tokens, including the prompt.
    /// The default is `512`.
    pub context_size: usize,
    /// The preferred capacity of a decode batch.
    /// The default is `512`.
    pub batch_size: usize,
    /// The maximum number of generated tokens. `None` means only the context limit applies.
    pub n_predict: Option<usize>,
    /// The sampling temperature. `0.0` selects greedy sampling, which is the default.
    pub temperature: f32,
    /// The number of context positions the prompt must leave free. At least `1`.
    pub reserved_margin: usize,
    /// Whether the prompt is prefixed with the beginning-of-sequence token.
    /// The default is `true`.
    pub add_bos: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: None,
            seed: None,
            numa: NumaStrategy::Disabled,
            threads: None,
            context_size: 512,
            batch_size: Batch::DEFAULT_CAPACITY,
            n_predict: None,
            temperature: 0.0,
            reserved_margin: DEFAULT_RESERVED_MARGIN,
            add_bos: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// The error type for [`Config`] parsing.
pub enum ConfigParseError {
    #[error("Unknown option `{0}`.")]
    /// The option is not recognized.
    UnknownOption(String),
    #[error("Option `{0}` requires a value.")]
    /// The option is the last token of the configuration string.
    MissingValue(String),
    #[error("Invalid value `{value}` for option `{option}`: {reason}")]
    /// The value of the option cannot be parsed or is out of range.
    InvalidValue {
        /// The option as written.
        option: String,
        /// The offending value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
    #[error("No model path is given. Pass it with `-m` or `--model`.")]
    /// A model load was requested without a model path.
    MissingModelPath,
}

fn invalid(option: &str, value: &str, reason: impl ToString) -> ConfigParseError {
    ConfigParseError::InvalidValue {
        option: option.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_value<T>(option: &str, value: &str) -> Result<T, ConfigParseError>
where
    T: FromStr,
    T::Err: ToString,
{
    value.parse::<T>().map_err(|e| invalid(option, value, e))
}

fn parse_positive(option: &str, value: &str) -> Result<usize, ConfigParseError> {
    match parse_value::<usize>(option, value)? {
        0 => Err(invalid(option, value, "the value must be positive")),
        x => Ok(x),
    }
}

/// Parses a signed value where any negative number means "unset".
fn parse_optional(option: &str, value: &str) -> Result<Option<u64>, ConfigParseError> {
    let x = parse_value::<i64>(option, value)?;
    Ok(u64::try_from(x).ok())
}

impl Config {
    /// Parses a configuration string.
    ///
    /// The string is split on whitespace and read as flag/value pairs. An empty string yields [`Config::default`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigParseError`] on unknown options, missing values or malformed values.
    pub fn from_args(args: &str) -> Result<Self, ConfigParseError> {
        let mut config = Config::default();
        let mut tokens = args.split_whitespace();
        while let Some(option) = tokens.next() {
            let mut value = || {
                tokens
                    .next()
                    .ok_or_else(|| ConfigParseError::MissingValue(option.to_string()))
            };
            match option {
                "-m" | "--model" => config.model_path = Some(PathBuf::from(value()?)),
                "-s" | "--seed" => config.seed = parse_optional(option, value()?)?,
                "--numa" => {
                    let v = value()?;
                    config.numa = NumaStrategy::from_str(v).map_err(|e| invalid(option, v, e))?;
                }
                "-t" | "--threads" => config.threads = Some(parse_positive(option, value()?)?),
                "-c" | "--ctx-size" => config.context_size = parse_positive(option, value()?)?,
                "-b" | "--batch-size" => config.batch_size = parse_positive(option, value()?)?,
                "-n" | "--n-predict" => {
                    config.n_predict = parse_optional(option, value()?)?.map(|x| x as usize)
                }
                "--temp" => {
                    let v = value()?;
                    let t = parse_value::<f32>(option, v)?;
                    if !t.is_finite() || t < 0.0 {
                        return Err(invalid(option, v, "the temperature must be finite and non-negative"));
                    }
                    config.temperature = t;
                }
                "--reserved-margin" => {
                    config.reserved_margin = parse_positive(option, value()?)?
                }
                "--add-bos" => config.add_bos = parse_value::<bool>(option, value()?)?,
                _ => return Err(ConfigParseError::UnknownOption(option.to_string())),
            }
        }
        Ok(config)
    }

    /// Gets the model path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigParseError::MissingModelPath`] when no path was configured.
    pub fn model_path(&self) -> Result<&Path, ConfigParseError> {
        self.model_path
            .as_deref()
            .ok_or(ConfigParseError::MissingModelPath)
    }

    /// Converts the configuration to the parameters of a new context.
    pub fn context_params(&self) -> ContextParams {
        ContextParams {
            context_size: self.context_size,
            batch_size: self.batch_size,
            threads: self.threads,
            seed: self.seed,
        }
    }
}

impl FromStr for Config {
    type Err = ConfigParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_args(s)
    }
}
