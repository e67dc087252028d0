/*!
# gbnf-decode

This crate provides a grammar-constrained autoregressive decoding loop
which ensures that a language model's output adheres strictly to the format defined by a GBNF grammar.
The language model itself is an external collaborator behind the [`Model`] and [`Context`] traits;
this crate owns the batch construction, the key-value cache position accounting,
the sampling policy and the grammar matcher.
Here is a quick example of how this crate works:

```rust
use gbnf_decode::{
    generate, Batch, Context, ContextParams, DecodeError, Model, ModelLoadError, StopReason, Token,
};

const VOCAB: [&str; 5] = ["<s>", "</s>", "yes", "no", "maybe"];

struct Uniform;
struct UniformContext {
    logits: Vec<f32>,
}

impl Model for Uniform {
    type Context = UniformContext;
    fn new_context(&self, _: &ContextParams) -> Result<UniformContext, ModelLoadError> {
        Ok(UniformContext { logits: vec![0.0; VOCAB.len()] })
    }
}

impl Context for UniformContext {
    fn decode(&mut self, _: &Batch) -> Result<(), DecodeError> {
        Ok(())
    }
    fn logits_ith(&self, _: usize) -> &[f32] {
        &self.logits // every token is equally likely
    }
    fn n_vocab(&self) -> usize {
        VOCAB.len()
    }
    fn tokenize(&self, text: &str, add_bos: bool) -> Vec<Token> {
        let mut tokens = if add_bos { vec![Token(0)] } else { vec![] };
        tokens.extend(
            text.split_whitespace()
                .filter_map(|w| VOCAB.iter().position(|v| *v == w))
                .map(|i| Token(i as u32)),
        );
        tokens
    }
    fn token_to_piece(&self, token: Token) -> Vec<u8> {
        VOCAB[token.as_usize()].as_bytes().to_vec()
    }
    fn eos_token(&self) -> Token {
        Token(1)
    }
}

let mut output: Vec<String> = Vec::new();
let summary = generate(
    &Uniform,
    "yes or no ?",
    "-c 16",
    Some(r#"root ::= "no" | "maybe""#),
    &mut output,
)
.unwrap();
// "<s>", "</s>" and "yes" are tried first and rejected by the grammar.
assert_eq!(output, ["no"]);
assert_eq!(summary.stop_reason, StopReason::GrammarFinished);
```

# Overview

The primary entry points are [`load_model`] and [`generate`]. Both take a configuration string
of whitespace-separated flag/value pairs, parsed into a [`Config`]:

| flag | meaning | default |
|---|---|---|
| `-m`, `--model` | path of the model weights | required by [`load_model`] |
| `-s`, `--seed` | random seed, `-1` for a random one | random |
| `--numa` | `disabled`, `distribute`, `isolate`, `numactl` or `mirror` | `disabled` |
| `-t`, `--threads` | number of backend threads | backend default |
| `-c`, `--ctx-size` | context limit in tokens, prompt included | `512` |
| `-b`, `--batch-size` | preferred decode batch capacity | `512` |
| `-n`, `--n-predict` | maximum generated tokens, `-1` for no limit | no limit |
| `--temp` | sampling temperature, `0` for greedy | `0` |
| `--reserved-margin` | positions the prompt must leave free | `1` |
| `--add-bos` | prefix the prompt with the beginning-of-sequence token | `true` |

The loop is built from smaller pieces that can be used on their own:

- [`BatchScheduler`]: builds decode batches and owns the position counter and the context budget.
- [`Sampler`]: picks the next token, greedily or by temperature, optionally filtered by a grammar.
- [`GrammarEngine`]: tracks the parallel partial matches of the generated text against a [`Grammar`].
- [`StreamSink`]: receives the text of each accepted token as soon as it is accepted.

Every failure is a [`GenerateError`] whose [`ErrorKind`] tells configuration mistakes apart from
runtime and grammar mistakes.

## Use the grammar engine directly

```rust
use gbnf_decode::{AcceptTokenResult, EngineLike, GrammarEngine};

let mut engine = GrammarEngine::from_grammar_str(r#"root ::= "[" [0-9]+ "]""#).unwrap();
assert!(!engine.accepts("x"));
assert_eq!(engine.try_accept_str("[4").unwrap(), AcceptTokenResult::Ongoing);
assert!(!engine.can_finish());
assert_eq!(engine.try_accept_str("2]").unwrap(), AcceptTokenResult::Finished);
engine.reset();
assert!(engine.accepts("[1"));
```

# GBNF Grammar

A grammar is a list of rules. The generation starts from the rule named `root`.

```text
root   ::= object
object ::= "{" ws ( pair ( "," ws pair )* )? "}"
pair   ::= key ":" ws value
key    ::= "\"" [a-z_]+ "\""
value  ::= [0-9]+ | "true" | "false"
ws     ::= [ \t\n]*   # comments run to the end of the line
```

- `"..."` matches a string. The escapes `\n`, `\r`, `\t`, `\xHH`, `\uHHHH` and `\UHHHHHHHH` are recognized;
  any other escaped character stands for itself.
- `[a-z_]` matches one character in the class; `[^"]` matches one character outside it.
- `.` matches any character.
- `name` expands another rule.
- `( ... )` groups, `|` separates alternatives, and the postfix operators `*`, `+` and `?` repeat.
- A rule defined more than once accepts the alternatives of all its definitions.

Left recursion such as `list ::= list "," item | item` cannot be expanded by a stack-based matcher
and is rejected when the grammar is loaded; write it as `list ::= item ("," item)*` instead.

# Performance

The matcher keeps one stack per live partial match. Ambiguous grammars, where many alternatives match
the same prefix, keep many stacks alive and make every candidate check slower.
Prefer grammars whose alternatives are told apart by their first characters.
*/
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod batch;
pub mod candidates;
pub mod config;
pub mod engine;
pub mod engine_like;
pub mod generate;
pub mod grammar;
pub mod model;
pub mod sampler;
pub mod scheduler;
pub mod sink;
mod syntax;
mod utils;
pub use batch::{Batch, BatchEntry};
pub use candidates::{Candidate, CandidateSet};
pub use config::{Config, NumaStrategy};
pub use engine::GrammarEngine;
pub use engine_like::{AcceptTokenError, AcceptTokenResult, EngineLike};
pub use generate::{
    generate, generate_in_context, generate_with_config, load_model, ErrorKind, GenerateError,
    GenerationSummary,
};
pub use grammar::Grammar;
#[cfg(feature = "mimalloc")]
use mimalloc::MiMalloc;
pub use model::{Backend, Context, ContextParams, DecodeError, Model, ModelLoadError, Token};
pub use sampler::Sampler;
pub use scheduler::{BatchScheduler, DecodeState, StopReason};
pub use sink::StreamSink;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
