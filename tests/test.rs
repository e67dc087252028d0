#[cfg(test)]

mod tests {
    use std::{
        cell::Cell,
        path::{Path, PathBuf},
        rc::Rc,
        sync::mpsc,
    };

    use gbnf_decode::{
        batch::BatchError,
        config::ConfigParseError,
        engine_like::{AcceptTokenError, AcceptTokenResult, EngineLike},
        grammar::CreateGrammarError,
        sampler::SampleError,
        scheduler::{Phase, SchedulerError},
        generate, generate_in_context, load_model, Backend, Batch, BatchEntry, BatchScheduler,
        CandidateSet, Config, Context, ContextParams, DecodeError, ErrorKind, Grammar,
        GrammarEngine, Model, ModelLoadError, NumaStrategy, Sampler, StopReason, StreamSink,
        Token,
    };
    use insta::assert_snapshot;

    type LogitsFn = Rc<dyn Fn(&[String], &[Token]) -> Vec<f32>>;

    /// A model over a fixed vocabulary. Token 0 is `<s>` and token 1 is `</s>`.
    /// A piece written `<0xHH>` is a byte-fallback token holding the single byte `HH`.
    struct MockModel {
        vocab: Rc<Vec<String>>,
        logits: LogitsFn,
        fail_at: Option<usize>,
        contexts: Cell<usize>,
    }

    impl std::fmt::Debug for MockModel {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockModel")
                .field("vocab", &self.vocab)
                .field("fail_at", &self.fail_at)
                .field("contexts", &self.contexts)
                .finish_non_exhaustive()
        }
    }

    struct MockContext {
        vocab: Rc<Vec<String>>,
        logits_fn: LogitsFn,
        fail_at: Option<usize>,
        history: Vec<Token>,
        logits: Vec<f32>,
        batches: Vec<Vec<BatchEntry>>,
        batch_capacity: usize,
    }

    impl MockModel {
        fn new(
            pieces: &[&str],
            logits: impl Fn(&[String], &[Token]) -> Vec<f32> + 'static,
        ) -> Self {
            let mut vocab = vec!["<s>".to_string(), "</s>".to_string()];
            vocab.extend(pieces.iter().map(|p| p.to_string()));
            Self {
                vocab: Rc::new(vocab),
                logits: Rc::new(logits),
                fail_at: None,
                contexts: Cell::new(0),
            }
        }

        fn failing_at(mut self, position: usize) -> Self {
            self.fail_at = Some(position);
            self
        }

        fn context(&self) -> MockContext {
            MockContext {
                vocab: self.vocab.clone(),
                logits_fn: self.logits.clone(),
                fail_at: self.fail_at,
                history: Vec::new(),
                logits: Vec::new(),
                batches: Vec::new(),
                batch_capacity: 512,
            }
        }

        fn id(&self, piece: &str) -> Token {
            Token(self.vocab.iter().position(|p| p == piece).unwrap() as u32)
        }
    }

    impl Model for MockModel {
        type Context = MockContext;

        fn new_context(&self, params: &ContextParams) -> Result<MockContext, ModelLoadError> {
            if params.context_size > 4096 {
                return Err(ModelLoadError::Context("out of memory".to_string()));
            }
            self.contexts.set(self.contexts.get() + 1);
            Ok(MockContext {
                batch_capacity: params.batch_size,
                ..self.context()
            })
        }
    }

    impl Context for MockContext {
        fn decode(&mut self, batch: &Batch) -> Result<(), DecodeError> {
            self.batches.push(batch.entries().to_vec());
            if batch.len() > self.batch_capacity {
                return Err(DecodeError(-2));
            }
            for entry in batch.entries() {
                if Some(entry.position) == self.fail_at {
                    return Err(DecodeError(1));
                }
                if entry.position != self.history.len() {
                    return Err(DecodeError(-1));
                }
                self.history.push(entry.token);
            }
            self.logits = (self.logits_fn)(self.vocab.as_slice(), &self.history);
            Ok(())
        }

        fn logits_ith(&self, _index: usize) -> &[f32] {
            &self.logits
        }

        fn n_vocab(&self) -> usize {
            self.vocab.len()
        }

        /// Greedy longest match. Characters not covered by the vocabulary are skipped.
        fn tokenize(&self, text: &str, add_bos: bool) -> Vec<Token> {
            let mut tokens = if add_bos { vec![Token(0)] } else { Vec::new() };
            let mut rest = text;
            while !rest.is_empty() {
                let best = self
                    .vocab
                    .iter()
                    .enumerate()
                    .skip(2)
                    .filter(|(_, p)| !p.is_empty() && rest.starts_with(p.as_str()))
                    .max_by_key(|(_, p)| p.len());
                match best {
                    Some((id, piece)) => {
                        tokens.push(Token(id as u32));
                        rest = &rest[piece.len()..];
                    }
                    None => {
                        let mut chars = rest.chars();
                        chars.next();
                        rest = chars.as_str();
                    }
                }
            }
            tokens
        }

        fn token_to_piece(&self, token: Token) -> Vec<u8> {
            let piece = &self.vocab[token.as_usize()];
            match piece
                .strip_prefix("<0x")
                .and_then(|p| p.strip_suffix('>'))
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                Some(byte) => vec![byte],
                None => piece.as_bytes().to_vec(),
            }
        }

        fn eos_token(&self) -> Token {
            Token(1)
        }
    }

    struct MockBackend {
        numa: Cell<Option<NumaStrategy>>,
    }

    impl Backend for MockBackend {
        type Model = MockModel;

        fn init(&self, numa: NumaStrategy) {
            self.numa.set(Some(numa));
        }

        fn load_model(&self, path: &Path, _config: &Config) -> Result<MockModel, ModelLoadError> {
            if path.ends_with("missing.gguf") {
                return Err(ModelLoadError::Model {
                    path: path.to_path_buf(),
                    reason: "no such file".to_string(),
                });
            }
            Ok(MockModel::new(&["a"], bias(&[("a", 1.0)])))
        }
    }

    /// Fixed logits: the listed pieces get their weight and everything else gets zero.
    fn bias(weights: &[(&str, f32)]) -> impl Fn(&[String], &[Token]) -> Vec<f32> {
        let weights: Vec<(String, f32)> = weights.iter().map(|(p, w)| (p.to_string(), *w)).collect();
        move |vocab: &[String], _: &[Token]| {
            vocab
                .iter()
                .map(|piece| {
                    weights
                        .iter()
                        .find(|(p, _)| p == piece)
                        .map_or(0.0, |(_, w)| *w)
                })
                .collect()
        }
    }

    /// Emits `pieces` in order after a prompt of `prompt_len` tokens, then the end of sequence.
    fn script(prompt_len: usize, pieces: &[&str]) -> impl Fn(&[String], &[Token]) -> Vec<f32> {
        let pieces: Vec<String> = pieces.iter().map(|p| p.to_string()).collect();
        move |vocab: &[String], history: &[Token]| {
            let next = pieces
                .get(history.len() - prompt_len)
                .map_or("</s>", |p| p.as_str());
            vocab
                .iter()
                .map(|piece| if piece == next { 10.0 } else { 0.0 })
                .collect()
        }
    }

    const FRANCE: [&str; 7] = ["The", " capital", " of", " France", " is", " Paris", "."];

    #[test]
    fn config_parsing() {
        let config = Config::from_args(
            "-m models/7B.gguf -s 42 --numa distribute -t 4 -c 2048 -b 256 -n 16 --temp 0.8",
        )
        .unwrap();
        assert_eq!(config.model_path, Some(PathBuf::from("models/7B.gguf")));
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.numa, NumaStrategy::Distribute);
        assert_eq!(config.threads, Some(4));
        assert_eq!(config.context_size, 2048);
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.n_predict, Some(16));
        assert_eq!(config.temperature, 0.8);
        assert_eq!(config.reserved_margin, 1);
        assert!(config.add_bos);

        let config: Config = "  --seed -1 --n-predict -1 --add-bos false ".parse().unwrap();
        assert_eq!(config.seed, None);
        assert_eq!(config.n_predict, None);
        assert!(!config.add_bos);
        assert_eq!(Config::from_args("").unwrap(), Config::default());
        assert_eq!(Config::default().context_size, 512);
        assert_eq!(Config::default().batch_size, 512);
    }

    #[test]
    fn config_errors() {
        assert_eq!(
            Config::from_args("--frobnicate 1"),
            Err(ConfigParseError::UnknownOption("--frobnicate".to_string()))
        );
        assert_eq!(
            Config::from_args("-m model.gguf -c"),
            Err(ConfigParseError::MissingValue("-c".to_string()))
        );
        for args in ["-c zero", "-c 0", "--numa fast", "--temp -1", "-t 1.5", "--add-bos yes"] {
            assert!(
                matches!(
                    Config::from_args(args),
                    Err(ConfigParseError::InvalidValue { .. })
                ),
                "{} should be rejected",
                args
            );
        }
        assert_eq!(
            Config::default().model_path(),
            Err(ConfigParseError::MissingModelPath)
        );
    }

    #[test]
    fn config_serde_round_trip() {
        let config = Config::from_args("-m a.gguf -s 7 --numa mirror -c 64 --temp 0.5").unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"numa\":\"mirror\""));
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn load_model_forwards_numa_and_reports_errors() {
        let backend = MockBackend {
            numa: Cell::new(None),
        };
        let model = load_model(&backend, "-m models/7B.gguf --numa isolate -t 2").unwrap();
        assert_eq!(backend.numa.get(), Some(NumaStrategy::Isolate));
        assert_eq!(model.vocab.len(), 3);

        let e = load_model(&backend, "-t 2").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ConfigParseError);
        assert!(e.kind().is_configuration_error());
        let e = load_model(&backend, "-m models/7B.gguf --frobnicate").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ConfigParseError);
        let e = load_model(&backend, "-m models/missing.gguf").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ModelLoadError);
        assert!(e.to_string().contains("no such file"));
    }

    #[test]
    fn prompt_too_long_boundary() {
        let model = MockModel::new(&["a"], bias(&[]));
        let mut context = model.context();
        let scheduler = BatchScheduler::new(&mut context, 512, 1);
        let tokens = vec![Token(2); 9];
        assert!(scheduler.begin_generation(&tokens, 10).is_ok());
        let tokens = vec![Token(2); 10];
        assert!(matches!(
            scheduler.begin_generation(&tokens, 10),
            Err(SchedulerError::PromptTooLong {
                tokens: 10,
                context_limit: 10,
                reserved_margin: 1
            })
        ));
        assert!(matches!(
            scheduler.begin_generation(&[], 10),
            Err(SchedulerError::EmptyPrompt)
        ));
        let scheduler = BatchScheduler::new(&mut context, 512, 3);
        assert!(scheduler.begin_generation(&vec![Token(2); 7], 10).is_ok());
        assert!(scheduler.begin_generation(&vec![Token(2); 8], 10).is_err());
    }

    #[test]
    fn prompt_too_long_is_reported_before_decoding() {
        let model = MockModel::new(&["a"], bias(&[("a", 1.0)]));
        let mut output: Vec<String> = Vec::new();
        // "<s>" followed by four "a".
        let e = generate(&model, "aaaa", "-c 5", None, &mut output).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::PromptTooLong);
        assert!(output.is_empty());
        let e = generate(&model, "aaaa", "-c 7 --reserved-margin 3", None, &mut output).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::PromptTooLong);
        let e = generate(&model, "", "--add-bos false", None, &mut output).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::PromptTooLong);

        let summary = generate(&model, "aaaa", "-c 6", None, &mut output).unwrap();
        assert_eq!(summary.prompt_tokens, 5);
        assert_eq!(summary.generated_tokens, 1);
        assert_eq!(summary.final_position, 6);
        assert_eq!(summary.stop_reason, StopReason::ContextExhausted);
        assert_eq!(output, ["a"]);
    }

    #[test]
    fn positions_advance_one_per_step() {
        let model = MockModel::new(&["a", "b"], bias(&[]));
        let mut context = model.context();
        let tokens = [Token(0), Token(2), Token(3)];
        {
            let mut scheduler = BatchScheduler::new(&mut context, 2, 1);
            let mut state = scheduler.begin_generation(&tokens, 8).unwrap();
            assert_eq!(state.phase(), Phase::Init);
            assert!(matches!(
                scheduler.step(&mut state, Token(2)),
                Err(SchedulerError::InvalidPhase { .. })
            ));
            scheduler.submit_prompt(&mut state, &tokens).unwrap();
            assert_eq!(state.phase(), Phase::PromptSubmitted);
            assert_eq!(state.current_position(), 3);
            assert_eq!(scheduler.last_batch().logits_count(), 1);
            assert_eq!(scheduler.last_batch().len(), 1);
            assert_eq!(scheduler.logits_index(), Some(0));
            assert_eq!(scheduler.logits(&state).unwrap().len(), 4);
            for n in 1..=5 {
                scheduler.step(&mut state, Token(3)).unwrap();
                assert_eq!(state.current_position(), 3 + n);
                assert_eq!(state.generated(), n);
                assert_eq!(scheduler.logits_index(), Some(0));
            }
            assert_eq!(state.phase(), Phase::Decoding);
            assert_eq!(state.last_token(), Some(Token(3)));
            assert!(scheduler.is_budget_exhausted(&state));
            assert!(matches!(
                scheduler.step(&mut state, Token(3)),
                Err(SchedulerError::ContextFull(8))
            ));
            state.complete(StopReason::ContextExhausted);
            assert!(state.phase().is_terminal());
        }
        // The prompt is longer than the batch size, so it is split into two batches.
        assert_eq!(context.batches.len(), 7);
        let prompt_batches: Vec<Vec<(usize, bool)>> = context.batches[..2]
            .iter()
            .map(|b| b.iter().map(|e| (e.position, e.wants_logits)).collect())
            .collect();
        assert_eq!(
            prompt_batches,
            [vec![(0, false), (1, false)], vec![(2, true)]]
        );
        for (i, batch) in context.batches[2..].iter().enumerate() {
            assert_eq!(
                batch.as_slice(),
                [BatchEntry {
                    token: Token(3),
                    position: 3 + i,
                    sequence_id: 0,
                    wants_logits: true,
                }]
            );
        }
        assert_eq!(context.history.len(), 8);
    }

    #[test]
    fn long_prompts_are_split_into_batches() {
        let model = MockModel::new(&["a"], bias(&[("a", 1.0)]));
        // "<s>" followed by nineteen "a".
        let prompt = "a".repeat(19);
        let mut context = MockContext {
            batch_capacity: 8,
            ..model.context()
        };
        let config = Config::from_args("-b 8 -c 64 -n 1").unwrap();
        let mut output: Vec<String> = Vec::new();
        let summary = generate_in_context(&mut context, &prompt, &config, None, &mut output).unwrap();
        assert_eq!(summary.prompt_tokens, 20);
        assert_eq!(summary.final_position, 21);
        let sizes: Vec<usize> = context.batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, [8, 8, 4, 1]);
        let positions: Vec<usize> = context.batches[..3]
            .iter()
            .flatten()
            .map(|e| e.position)
            .collect();
        assert_eq!(positions, (0..20).collect::<Vec<_>>());
        let wanting_logits: Vec<usize> = context.batches[..3]
            .iter()
            .flatten()
            .filter(|e| e.wants_logits)
            .map(|e| e.position)
            .collect();
        assert_eq!(wanting_logits, [19]);
        assert_eq!(context.history.len(), 21);

        // The context created by `generate` rejects batches larger than `-b`.
        let summary = generate(&model, &prompt, "-b 8 -c 64 -n 2", None, &mut output).unwrap();
        assert_eq!(summary.stop_reason, StopReason::TokenLimit);
        let summary = generate(&model, &prompt, "-b 1 -c 64 -n 2", None, &mut output).unwrap();
        assert_eq!(summary.final_position, 22);
    }

    #[test]
    fn decode_failure_is_terminal() {
        let model = MockModel::new(&["a"], bias(&[])).failing_at(3);
        let mut context = model.context();
        let tokens = [Token(0), Token(2), Token(2)];
        let mut scheduler = BatchScheduler::new(&mut context, 512, 1);
        let mut state = scheduler.begin_generation(&tokens, 16).unwrap();
        scheduler.submit_prompt(&mut state, &tokens).unwrap();
        assert!(matches!(
            scheduler.step(&mut state, Token(2)),
            Err(SchedulerError::DecodeFailure {
                position: 3,
                code: 1
            })
        ));
        assert_eq!(state.phase(), Phase::Failed);
        assert_eq!(state.current_position(), 3);
        assert!(matches!(
            scheduler.step(&mut state, Token(2)),
            Err(SchedulerError::InvalidPhase {
                phase: Phase::Failed,
                ..
            })
        ));
        state.complete(StopReason::EndOfSequence);
        assert_eq!(state.phase(), Phase::Failed);
    }

    #[test]
    fn decode_failure_stops_generation() {
        let model = MockModel::new(&["a"], bias(&[("a", 1.0)])).failing_at(0);
        let mut output: Vec<String> = Vec::new();
        let e = generate(&model, "a", "", None, &mut output).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::DecodeFailure);
        assert!(!e.kind().is_configuration_error());
        assert!(output.is_empty());

        let model = MockModel::new(&["a"], bias(&[("a", 1.0)])).failing_at(4);
        let e = generate(&model, "a", "", None, &mut output).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::DecodeFailure);
        // Each token is emitted before it is decoded.
        assert_eq!(output, ["a", "a", "a"]);
    }

    #[test]
    fn batch_capacity() {
        let mut batch = Batch::with_capacity(1);
        let entry = BatchEntry {
            token: Token(0),
            position: 0,
            sequence_id: 0,
            wants_logits: true,
        };
        batch.push(entry).unwrap();
        assert_eq!(batch.push(entry), Err(BatchError::BatchFull(1)));
        assert_eq!(batch.len(), 1);
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(Batch::default().capacity(), 512);
    }

    #[test]
    fn greedy_is_deterministic() {
        let sampler = Sampler::greedy();
        let candidates = CandidateSet::from_logits(&[1.0, 3.0, 3.0, -1.0]);
        for _ in 0..10 {
            assert_eq!(sampler.sample_greedy(&candidates), Some(Token(1)));
        }
        let candidates = CandidateSet::from_logits(&[f32::NAN, 0.5, f32::NEG_INFINITY]);
        assert_eq!(sampler.sample_greedy(&candidates), Some(Token(1)));
        assert_eq!(sampler.sample_greedy(&CandidateSet::default()), None);
        assert_eq!(
            Sampler::greedy().sample(&mut CandidateSet::default()),
            Err(SampleError::EmptyCandidates)
        );
        // Greedy samplers never draw, so they carry no random generator.
        assert!(format!("{:?}", Sampler::greedy()).contains("rng: None"));
        assert!(format!("{:?}", Sampler::new(0.0, Some(7))).contains("rng: None"));
        assert!(!format!("{:?}", Sampler::new(0.5, Some(7))).contains("rng: None"));
    }

    #[test]
    fn candidate_probabilities() {
        let mut candidates = CandidateSet::from_logits(&[0.0, 2.0, 2.0, 1.0, f32::NEG_INFINITY]);
        candidates.softmax(1.0);
        let sum: f32 = candidates.iter().map(|c| c.probability).sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert_eq!(candidates.get(Token(4)).unwrap().probability, 0.0);
        candidates.sort_by_probability();
        assert!(candidates.is_sorted());
        assert_eq!(
            candidates.iter().map(|c| c.token.0).collect::<Vec<_>>(),
            [1, 2, 3, 0, 4]
        );
        assert_eq!(candidates.get(Token(3)).unwrap().logit, 1.0);

        let mut silent = CandidateSet::from_logits(&[f32::NEG_INFINITY; 3]);
        silent.softmax(0.7);
        assert!(silent.iter().all(|c| c.probability == 0.0));
    }

    #[test]
    fn seeded_temperature_sampling_is_reproducible() {
        let logits: Vec<f32> = (0..16).map(|i| (i % 5) as f32 * 0.3).collect();
        let mut a = Sampler::new(0.8, Some(7));
        let mut b = Sampler::new(0.8, Some(7));
        for _ in 0..20 {
            let x = a.sample(&mut CandidateSet::from_logits(&logits)).unwrap();
            let y = b.sample(&mut CandidateSet::from_logits(&logits)).unwrap();
            assert_eq!(x, y);
            assert!(x.as_usize() < logits.len());
        }
        assert_eq!(
            Sampler::new(0.0, Some(7)).mode(),
            gbnf_decode::sampler::SamplingMode::Greedy
        );
    }

    #[test]
    fn capital_of_france_fills_the_context() {
        let model = MockModel::new(&FRANCE, bias(&[(" Paris", 5.0)]));
        let mut output: Vec<String> = Vec::new();
        let summary = generate(&model, "The capital of France is", "-c 32", None, &mut output)
            .unwrap();
        assert_eq!(summary.prompt_tokens, 6);
        assert_eq!(summary.stop_reason, StopReason::ContextExhausted);
        assert_eq!(summary.generated_tokens, 32 - 6);
        assert_eq!(summary.final_position, 32);
        assert_eq!(output.len(), 32 - 6);
        assert!(output.iter().all(|piece| piece == " Paris"));
        assert_eq!(model.contexts.get(), 1);
    }

    #[test]
    fn capital_of_france_stops_at_end_of_sequence() {
        let model = MockModel::new(&FRANCE, script(6, &[" Paris", "."]));
        let mut output: Vec<String> = Vec::new();
        let summary = generate(&model, "The capital of France is", "-c 32", None, &mut output)
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::EndOfSequence);
        assert_eq!(summary.generated_tokens, 2);
        assert_eq!(summary.final_position, 8);
        assert_eq!(output, [" Paris", "."]);
    }

    #[test]
    fn token_limit() {
        let model = MockModel::new(&["a"], bias(&[("a", 1.0)]));
        let mut output: Vec<String> = Vec::new();
        let summary = generate(&model, "", "-n 2 -c 64", None, &mut output).unwrap();
        assert_eq!(summary.stop_reason, StopReason::TokenLimit);
        assert_eq!(summary.final_position, 3);
        assert_eq!(output, ["a", "a"]);
    }

    #[test]
    fn grammar_overrides_model_bias() {
        let model = MockModel::new(
            &["yes", "no", "maybe", " Paris"],
            bias(&[("maybe", 10.0), (" Paris", 9.0), ("</s>", 8.0), ("no", 1.0)]),
        );
        let mut output: Vec<String> = Vec::new();
        let summary = generate(
            &model,
            "Answer:",
            "-c 16",
            Some(r#"root ::= "yes" | "no""#),
            &mut output,
        )
        .unwrap();
        assert_eq!(output, ["no"]);
        assert_eq!(summary.stop_reason, StopReason::GrammarFinished);
        assert_eq!(summary.generated_tokens, 1);
    }

    #[test]
    fn grammar_with_temperature_still_constrains() {
        let model = MockModel::new(
            &["yes", "no", "maybe", "y", "es"],
            bias(&[("maybe", 3.0), ("</s>", 2.0), ("y", 1.0)]),
        );
        let mut first: Option<String> = None;
        for _ in 0..2 {
            let mut output: Vec<String> = Vec::new();
            let summary = generate(
                &model,
                "",
                "--temp 1.5 -s 3",
                Some(r#"root ::= "yes" | "no""#),
                &mut output,
            )
            .unwrap();
            let text = output.concat();
            assert!(text == "yes" || text == "no", "unexpected output {}", text);
            assert_eq!(summary.stop_reason, StopReason::GrammarFinished);
            match &first {
                Some(first) => assert_eq!(first, &text),
                None => first = Some(text),
            }
        }
    }

    #[test]
    fn end_of_sequence_needs_a_complete_parse() {
        let model = MockModel::new(&["a", "b"], bias(&[("</s>", 10.0), ("b", 5.0), ("a", 1.0)]));
        let mut output: Vec<String> = Vec::new();
        let summary = generate(&model, "", "", Some(r#"root ::= "a"+"#), &mut output).unwrap();
        assert_eq!(output, ["a"]);
        assert_eq!(summary.stop_reason, StopReason::EndOfSequence);
    }

    #[test]
    fn no_valid_token() {
        let model = MockModel::new(&["a", "b"], bias(&[]));
        let mut output: Vec<String> = Vec::new();
        let e = generate(&model, "a", "", Some(r#"root ::= "z""#), &mut output).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NoValidToken);
        assert!(e.kind().is_grammar_error());
        assert!(matches!(
            e,
            gbnf_decode::GenerateError::Sample(SampleError::NoValidToken { candidates: 4 })
        ));
        assert!(output.is_empty());

        let e = generate(&model, "a", "", Some(r#"root ::= [] "a""#), &mut output).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NoValidToken);
        assert_eq!(e.kind().to_string(), "NoValidToken");
    }

    #[test]
    fn grammar_errors_are_reported_before_the_model_is_used() {
        let model = MockModel::new(&["a"], bias(&[]));
        let mut output: Vec<String> = Vec::new();
        let e = generate(&model, "a", "", Some("root ::= missing"), &mut output).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::GrammarLoadError);
        assert_eq!(model.contexts.get(), 0);
        let e = generate(&model, "a", "--bogus 1", Some("root ::= \"a\""), &mut output).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ConfigParseError);
        assert_eq!(model.contexts.get(), 0);
        let e = generate(&model, "a", "-c 8192", None, &mut output).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ModelLoadError);
        // A blank grammar means no grammar.
        let summary = generate(&model, "a", "-n 1", Some("  \n"), &mut output).unwrap();
        assert_eq!(summary.stop_reason, StopReason::TokenLimit);
    }

    #[test]
    fn grammar_load_errors() {
        assert!(matches!(
            Grammar::new(r#"start ::= "a""#),
            Err(CreateGrammarError::MissingRoot(name)) if name == "root"
        ));
        assert!(Grammar::with_root(r#"start ::= "a""#, "start").is_ok());
        assert!(matches!(
            Grammar::with_root(r#"start ::= "a""#, "no root"),
            Err(CreateGrammarError::InvalidRootName(_))
        ));
        assert!(matches!(
            Grammar::new("root ::= missing"),
            Err(CreateGrammarError::UndefinedRule(name)) if name == "missing"
        ));
        assert!(matches!(
            Grammar::new(r#"root ::= root "a" | "a""#),
            Err(CreateGrammarError::LeftRecursion(name)) if name == "root"
        ));
        assert!(matches!(
            Grammar::new("root ::= opt root \"x\" | \"y\"\nopt ::= \"o\"?"),
            Err(CreateGrammarError::LeftRecursion(name)) if name == "root"
        ));
        // Left recursion through synthesized rules is reported on the rule that was written.
        assert!(matches!(
            Grammar::new(r#"root ::= ("a"?)* "b""#),
            Err(CreateGrammarError::LeftRecursion(name)) if name == "root"
        ));
        assert!(matches!(
            Grammar::new("root ::= list\nlist ::= (\"x\"? list) \",\" | \"y\""),
            Err(CreateGrammarError::LeftRecursion(name)) if name == "list"
        ));
        assert!(matches!(
            Grammar::new(r#"root ::= "a"#),
            Err(CreateGrammarError::ParsingError(_))
        ));
        assert!(matches!(Grammar::new(""), Err(CreateGrammarError::ParsingError(_))));
        assert!(matches!(
            Grammar::new("root ::= [z-a]"),
            Err(CreateGrammarError::InvalidRange {
                start: 'z',
                end: 'a',
                ..
            })
        ));
    }

    #[test]
    fn grammar_display() {
        let grammar = Grammar::new("root ::= answer \".\"\nanswer ::= (\"yes\" | \"no\")+").unwrap();
        assert_snapshot!(grammar.to_string().trim_end(), @r###"
        root ::= answer "."
        answer ::= answer_2
        answer_2 ::= answer_3 answer_2 | answer_3
        answer_3 ::= "yes" | "no"
        "###);
        assert_eq!(grammar.rules_size(), 4);
        assert_eq!(grammar.rule_name(grammar.root()), Some("root"));
        assert_eq!(grammar.rule_id("answer_3").map(|id| id.0), Some(3));

        let grammar = Grammar::new(r#"root ::= [a-z_] [^"] . "\n" | """#).unwrap();
        assert_eq!(
            grammar.to_string(),
            "root ::= [a-z_] [^\"] . \"\\n\" | \"\"\n"
        );
        assert!(grammar.accepts_empty());
    }

    #[test]
    fn duplicate_definitions_merge() {
        let grammar = Grammar::new("root ::= \"a\"\nroot ::= \"b\"").unwrap();
        assert_eq!(grammar.to_string(), "root ::= \"a\" | \"b\"\n");
        let mut engine = GrammarEngine::new(std::sync::Arc::new(grammar));
        assert_eq!(engine.try_accept_str("b"), Ok(AcceptTokenResult::Finished));
    }

    #[test]
    fn escapes_classes_and_comments() {
        let grammar = r#"
# a comment before the first rule
root ::= "\x41" [^a-z] "\u00e9" tail # trailing comment
tail ::= .
       | "\"" # an alternative on its own line
"#;
        let mut engine = GrammarEngine::from_grammar_str(grammar).unwrap();
        assert!(!engine.accepts("Aa"));
        assert!(engine.accepts("A\""));
        assert_eq!(engine.try_accept_str("AZé"), Ok(AcceptTokenResult::Ongoing));
        assert!(!engine.can_finish());
        assert_eq!(engine.try_accept_str("!"), Ok(AcceptTokenResult::Finished));
        assert_eq!(engine.try_accept_str("!"), Err(AcceptTokenError::Finished));
    }

    const JSON_GRAMMAR: &str = r#"
root  ::= "{" ws pair ("," ws pair)* ws "}"
pair  ::= key ":" ws value
key   ::= "\"" [a-z_]+ "\""
value ::= [0-9]+ | "true" | "false"
ws    ::= [ \t\n]*
"#;

    #[test]
    fn incremental_acceptance_matches_whole_string() {
        let text = r#"{"a_b": 12, "c":true}"#;
        let mut whole = GrammarEngine::from_grammar_str(JSON_GRAMMAR).unwrap();
        assert_eq!(whole.try_accept_str(text), Ok(AcceptTokenResult::Finished));

        let mut incremental = GrammarEngine::from_grammar_str(JSON_GRAMMAR).unwrap();
        let mut consumed = 0;
        for chunk in text.as_bytes().chunks(3) {
            let chunk = std::str::from_utf8(chunk).unwrap();
            let result = incremental.try_accept_str(chunk).unwrap();
            consumed += chunk.len();
            let mut prefix = GrammarEngine::from_grammar_str(JSON_GRAMMAR).unwrap();
            prefix.try_accept_str(&text[..consumed]).unwrap();
            assert_eq!(incremental.stacks(), prefix.stacks());
            assert_eq!(
                result == AcceptTokenResult::Finished,
                consumed == text.len()
            );
        }
        let fresh = GrammarEngine::from_grammar_str(JSON_GRAMMAR).unwrap();
        for end in 0..=text.len() {
            assert!(fresh.accepts(&text[..end]), "prefix {:?}", &text[..end]);
        }
        assert!(!fresh.accepts(r#"{"A": 1}"#));
    }

    #[test]
    fn rejection_leaves_the_engine_untouched() {
        let mut engine = GrammarEngine::from_grammar_str(JSON_GRAMMAR).unwrap();
        engine.try_accept_str("{ ").unwrap();
        let before = engine.stacks().to_vec();
        assert_eq!(engine.try_accept_str("}"), Err(AcceptTokenError::Rejected));
        assert_eq!(engine.stacks(), before.as_slice());
        assert_eq!(engine.try_accept_str(""), Ok(AcceptTokenResult::Ongoing));
        engine.reset();
        assert!(engine.accepts("{"));
        assert!(!engine.accepts(" "));
    }

    #[test]
    fn multi_byte_characters_are_matched_by_codepoint() {
        let mut engine = GrammarEngine::from_grammar_str(r#"root ::= [à-ö]+ "!""#).unwrap();
        assert!(!engine.accepts("a"));
        assert_eq!(engine.try_accept_str("éè"), Ok(AcceptTokenResult::Ongoing));
        assert_eq!(engine.try_accept_str("ö!"), Ok(AcceptTokenResult::Finished));
    }

    #[test]
    fn characters_split_across_byte_tokens() {
        let mut engine = GrammarEngine::from_grammar_str(r#"root ::= "é""#).unwrap();
        assert!(engine.accepts_bytes(&[0xC3]));
        assert!(!engine.accepts_bytes(&[0xC4]));
        assert!(!engine.accepts_bytes(&[0xA9]));
        assert!(!engine.accepts_bytes(&[0xFF]));
        assert_eq!(
            engine.try_accept_new_bytes(&[0xC3]),
            Ok(AcceptTokenResult::Ongoing)
        );
        assert_eq!(engine.pending_bytes(), [0xC3]);
        assert!(!engine.can_finish());
        assert!(!engine.accepts_bytes(&[0xA8]));
        assert!(!engine.accepts("e"));
        let before = engine.stacks().to_vec();
        assert_eq!(
            engine.try_accept_new_bytes(b"e"),
            Err(AcceptTokenError::Rejected)
        );
        assert_eq!(engine.stacks(), before.as_slice());
        assert_eq!(engine.pending_bytes(), [0xC3]);
        assert_eq!(
            engine.try_accept_new_bytes(&[0xA9]),
            Ok(AcceptTokenResult::Finished)
        );
        assert!(engine.pending_bytes().is_empty());
        engine.reset();
        engine.try_accept_new_bytes(&[0xC3]).unwrap();
        engine.reset();
        assert!(engine.pending_bytes().is_empty());

        // Classes are checked against every character the held bytes could still become.
        let engine = GrammarEngine::from_grammar_str(r#"root ::= [^é] | [€-₿]"#).unwrap();
        assert!(engine.accepts_bytes(&[0xC3]));
        assert!(engine.accepts_bytes(&[0xE2, 0x82]));
        assert!(!engine.accepts_bytes("é".as_bytes()));
        let engine = GrammarEngine::from_grammar_str(r#"root ::= [€-₿]"#).unwrap();
        assert!(!engine.accepts_bytes(&[0xC3]));
        assert!(engine.accepts_bytes(&[0xE2]));
        assert!(!engine.accepts_bytes(&[0xE2, 0x81]));

        let pieces = ["<0xC3>", "<0xA9>", "e"];
        let model = MockModel::new(
            &pieces,
            bias(&[("e", 3.0), ("<0xA9>", 2.0), ("<0xC3>", 1.0)]),
        );
        let mut output: Vec<String> = Vec::new();
        let summary = generate(&model, "", "-c 16", Some(r#"root ::= "é""#), &mut output).unwrap();
        assert_eq!(summary.stop_reason, StopReason::GrammarFinished);
        assert_eq!(summary.generated_tokens, 2);
        // The first byte completes no character, so it emits empty text.
        assert_eq!(output, ["", "é"]);

        let model = MockModel::new(&pieces, script(1, &["<0xC3>", "<0xA9>", "e"]));
        let mut output: Vec<String> = Vec::new();
        let summary = generate(&model, "", "-c 16", None, &mut output).unwrap();
        assert_eq!(summary.stop_reason, StopReason::EndOfSequence);
        assert_eq!(output.concat(), "ée");
    }

    #[test]
    fn constrained_sampler_rejects_empty_pieces() {
        let mut engine = GrammarEngine::from_grammar_str(r#"root ::= "a"?"#).unwrap();
        let pieces = ["<s>", "</s>", "", "a"];
        let mut candidates = CandidateSet::from_logits(&[0.0, 1.0, 5.0, 2.0]);
        let token = Sampler::greedy()
            .sample_grammar_constrained(
                &mut candidates,
                &mut engine,
                |t| pieces[t.as_usize()].to_string(),
                Token(1),
            )
            .unwrap();
        assert_eq!(token, Token(3));
        assert!(engine.is_finished());
        // The grammar accepts the empty string, so the end of sequence is acceptable before any text.
        engine.reset();
        let mut candidates = CandidateSet::from_logits(&[0.0, 3.0, 5.0, 2.0]);
        let token = Sampler::greedy()
            .sample_grammar_constrained(
                &mut candidates,
                &mut engine,
                |t| pieces[t.as_usize()].to_string(),
                Token(1),
            )
            .unwrap();
        assert_eq!(token, Token(1));
        assert!(!engine.is_finished());
    }

    #[test]
    fn sinks_receive_pieces_in_order() {
        let model = MockModel::new(&FRANCE, script(1, &["The", " capital", " of", " France"]));

        let (sender, receiver) = mpsc::channel::<String>();
        let mut sender = sender;
        generate(&model, "", "", None, &mut sender).unwrap();
        drop(sender);
        assert_eq!(
            receiver.iter().collect::<Vec<_>>(),
            ["The", " capital", " of", " France"]
        );

        let mut text = String::new();
        let mut sink = |piece: &str| text.push_str(piece);
        generate(&model, "", "", None, &mut sink).unwrap();
        assert_eq!(text, "The capital of France");

        let mut collected: Vec<String> = Vec::new();
        let sink: &mut dyn StreamSink = &mut collected;
        generate(&model, "", "", None, sink).unwrap();
        assert_eq!(collected.len(), 4);

        let (sender, receiver) = mpsc::channel::<String>();
        drop(receiver);
        let mut sender = sender;
        let summary = generate(&model, "", "", None, &mut sender).unwrap();
        assert_eq!(summary.generated_tokens, 4);
    }

    #[test]
    fn generation_in_an_existing_context() {
        let model = MockModel::new(&["yes", "no"], bias(&[("yes", 2.0)]));
        let mut context = model.context();
        let mut engine = GrammarEngine::from_grammar_str(r#"root ::= "no""#).unwrap();
        let mut output: Vec<String> = Vec::new();
        let config = Config::from_args("-c 8").unwrap();
        let summary =
            generate_in_context(&mut context, "yes", &config, Some(&mut engine), &mut output)
                .unwrap();
        assert_eq!(output, ["no"]);
        assert_eq!(summary.stop_reason, StopReason::GrammarFinished);
        assert!(engine.is_finished());
        assert_eq!(context.history, [Token(0), model.id("yes"), model.id("no")]);
    }
}
