//! # Whisper Model Loading and Decoding
//!
//! The model is loaded once at startup and shared read-only by every
//! session. Each session decodes with its own copy of the network (see
//! [`WhisperModel::instance`]) because the decoder keeps a key/value cache
//! of the audio features it last saw.
//!
//! ## Loading Process:
//! 1. Use `models.model_dir` if set, otherwise fetch from the Hugging Face hub
//!    (cached locally, honours `HF_TOKEN`, `HF_HUB_CACHE` and `HF_HOME`)
//! 2. Read `config.json`, `tokenizer.json` and `model.safetensors`
//! 3. Resolve the special tokens from the tokenizer
//! 4. Build the mel filter bank for the checkpoint's mel bin count

use super::engine::WordResult;
use super::mel;
use crate::config::ModelsConfig;
use crate::error::ModelLoadError;
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Whisper checkpoint sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = ModelLoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(ModelLoadError::UnknownModel(s.to_string())),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// Token ids the decoder needs, looked up from the tokenizer.
#[derive(Debug, Clone)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    no_speech: u32,
    language: Option<u32>,
}

/// Text produced by one decoder pass over an utterance.
#[derive(Debug, Clone, Default)]
pub struct Decoded {
    pub text: String,
    pub words: Vec<WordResult>,
    pub no_speech_prob: f32,
}

pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    /// Added to the logits at every step; `-inf` on suppressed tokens.
    suppress_mask: Tensor,
    tokens: SpecialTokens,
    device: Device,
    size: ModelSize,
}

struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

impl WhisperModel {
    /// Load the configured checkpoint onto `device`.
    pub async fn load(settings: &ModelsConfig, device: Device) -> Result<Self, ModelLoadError> {
        let size: ModelSize = settings.whisper_model.parse()?;
        info!("Loading Whisper {} model...", size);
        let start_time = Instant::now();

        let files = match &settings.model_dir {
            Some(dir) => Self::local_files(Path::new(dir))?,
            None => Self::fetch_files(size).await?,
        };

        let config: Config = serde_json::from_reader(std::fs::File::open(&files.config)?)?;
        let tokenizer =
            Tokenizer::from_file(&files.tokenizer).map_err(|e| ModelLoadError::Tokenizer(e.to_string()))?;

        let language = match settings.language.as_deref() {
            Some(lang) => Some(token_id(&tokenizer, &format!("<|{}|>", lang))?),
            None => None,
        };
        let no_speech = m::NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| token_id(&tokenizer, token).ok())
            .ok_or_else(|| ModelLoadError::MissingToken("<|nospeech|>".to_string()))?;
        let tokens = SpecialTokens {
            sot: token_id(&tokenizer, m::SOT_TOKEN)?,
            eot: token_id(&tokenizer, m::EOT_TOKEN)?,
            transcribe: token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?,
            no_timestamps: token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
            no_speech,
            language,
        };

        let suppress: Vec<f32> = (0..config.vocab_size as u32)
            .map(|i| {
                if config.suppress_tokens.contains(&i) {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        let suppress_mask = Tensor::new(suppress.as_slice(), &device)?;

        let mel_filters = mel::filter_bank(m::SAMPLE_RATE as u32, m::N_FFT, config.num_mel_bins);

        // SAFETY: the weights file is not modified while the model is alive
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[files.weights], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        info!(
            "Whisper {} model loaded in {:.2}s",
            size,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            model,
            config,
            tokenizer,
            mel_filters,
            suppress_mask,
            tokens,
            device,
            size,
        })
    }

    fn local_files(dir: &Path) -> Result<ModelFiles, ModelLoadError> {
        let file = |name: &str| {
            let path = dir.join(name);
            if path.exists() {
                Ok(path)
            } else {
                Err(ModelLoadError::MissingFile(path.display().to_string()))
            }
        };
        Ok(ModelFiles {
            config: file("config.json")?,
            tokenizer: file("tokenizer.json")?,
            weights: file("model.safetensors")?,
        })
    }

    async fn fetch_files(size: ModelSize) -> Result<ModelFiles, ModelLoadError> {
        use hf_hub::api::tokio::ApiBuilder;

        let mut builder = ApiBuilder::new().with_progress(false);
        if let Ok(token) = std::env::var("HF_TOKEN") {
            builder = builder.with_token(Some(token));
        }
        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        } else if let Ok(hf_home) = std::env::var("HF_HOME") {
            builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
        }

        let repo_name = size.repo_name();
        let api = builder.build().map_err(|e| ModelLoadError::Download {
            repo: repo_name.to_string(),
            file: String::new(),
            message: e.to_string(),
        })?;
        let repo = api.model(repo_name.to_string());

        let mut paths = Vec::with_capacity(3);
        for file in ["config.json", "tokenizer.json", "model.safetensors"] {
            debug!("Fetching {} from {}", file, repo_name);
            let path = repo.get(file).await.map_err(|e| ModelLoadError::Download {
                repo: repo_name.to_string(),
                file: file.to_string(),
                message: e.to_string(),
            })?;
            paths.push(path);
        }

        let weights = paths.pop();
        let tokenizer = paths.pop();
        let config = paths.pop();
        match (config, tokenizer, weights) {
            (Some(config), Some(tokenizer), Some(weights)) => Ok(ModelFiles {
                config,
                tokenizer,
                weights,
            }),
            _ => Err(ModelLoadError::MissingFile(repo_name.to_string())),
        }
    }

    /// A private copy of the network for one session's decoder state.
    pub fn instance(&self) -> m::model::Whisper {
        self.model.clone()
    }

    pub fn size(&self) -> ModelSize {
        self.size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Transcribe one utterance of 16 kHz mono samples with greedy decoding.
    ///
    /// Returns empty text when the model judges the audio to be non-speech.
    pub fn transcribe(&self, network: &mut m::model::Whisper, samples: &[f32]) -> candle_core::Result<Decoded> {
        if samples.is_empty() {
            return Ok(Decoded::default());
        }

        let n_mels = self.config.num_mel_bins;
        let mel = m::audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let n_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, n_frames), &self.device)?;
        // The encoder sees at most one 30 second window
        let mel = mel.narrow(2, 0, n_frames.min(m::N_FRAMES))?;

        let audio_features = network.encoder.forward(&mel, true)?;

        let mut tokens = vec![self.tokens.sot];
        if let Some(language) = self.tokens.language {
            tokens.push(language);
        }
        tokens.push(self.tokens.transcribe);
        tokens.push(self.tokens.no_timestamps);
        let prompt_len = tokens.len();

        let mut probs = Vec::new();
        let mut no_speech_prob = 0f32;
        let sample_len = self.config.max_target_positions / 2;

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = network.decoder.forward(&tokens_t, &audio_features, i == 0)?;

            if i == 0 {
                let logits = network.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                no_speech_prob = softmax(&logits, 0)?
                    .i(self.tokens.no_speech as usize)?
                    .to_scalar::<f32>()?;
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = network
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .broadcast_add(&self.suppress_mask)?;
            let distribution: Vec<f32> = softmax(&logits, D::Minus1)?.to_vec1()?;

            let (next_token, prob) = distribution
                .iter()
                .copied()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.total_cmp(b))
                .map(|(id, p)| (id as u32, p))
                .ok_or_else(|| candle_core::Error::Msg("decoder produced no logits".to_string()))?;

            if next_token == self.tokens.eot
                || tokens.len() >= self.config.max_target_positions
                || is_repetitive(&tokens[prompt_len..], next_token)
            {
                break;
            }
            tokens.push(next_token);
            probs.push(prob);
        }

        let generated = &tokens[prompt_len..];
        let avg_logprob = if probs.is_empty() {
            0.0
        } else {
            probs.iter().map(|p| (p.max(f32::MIN_POSITIVE) as f64).ln()).sum::<f64>() / probs.len() as f64
        };

        if no_speech_prob as f64 > m::NO_SPEECH_THRESHOLD && avg_logprob < m::LOGPROB_THRESHOLD {
            debug!(no_speech_prob, avg_logprob, "Utterance judged to be non-speech");
            return Ok(Decoded {
                no_speech_prob,
                ..Decoded::default()
            });
        }

        let text = self.decode(generated)?;
        let words = self.words(generated, &probs)?;
        Ok(Decoded {
            text,
            words,
            no_speech_prob,
        })
    }

    fn decode(&self, tokens: &[u32]) -> candle_core::Result<String> {
        let text = self
            .tokenizer
            .decode(tokens, true)
            .map_err(|e| candle_core::Error::Msg(format!("tokenizer decode failed: {}", e)))?;
        Ok(text.trim().to_string())
    }

    /// Group tokens into words at leading spaces and score each word with
    /// the mean probability of its tokens.
    fn words(&self, tokens: &[u32], probs: &[f32]) -> candle_core::Result<Vec<WordResult>> {
        let mut groups: Vec<(Vec<u32>, Vec<f32>)> = Vec::new();
        for (&token, &prob) in tokens.iter().zip(probs) {
            if token >= self.tokens.eot {
                continue;
            }
            let piece = self
                .tokenizer
                .id_to_token(token)
                .unwrap_or_default();
            // Byte-level BPE marks a leading space with 'Ġ'
            let starts_word = piece.starts_with('Ġ') || piece.starts_with(' ');
            match groups.last_mut() {
                Some((ids, scores)) if !starts_word => {
                    ids.push(token);
                    scores.push(prob);
                }
                _ => groups.push((vec![token], vec![prob])),
            }
        }

        let mut words = Vec::with_capacity(groups.len());
        for (ids, scores) in groups {
            let text = self.decode(&ids)?;
            if text.is_empty() {
                continue;
            }
            let confidence = scores.iter().sum::<f32>() / scores.len() as f32;
            words.push(WordResult {
                text,
                confidence: Some(confidence),
            });
        }
        Ok(words)
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32, ModelLoadError> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| ModelLoadError::MissingToken(token.to_string()))
}

/// Greedy decoding can loop on a token or a short phrase; stop when the
/// newest token would repeat the same token three times or a three-token
/// pattern twice.
fn is_repetitive(tokens: &[u32], next: u32) -> bool {
    let n = tokens.len();
    if n >= 3 && tokens[n - 3..].iter().all(|&t| t == next) {
        return true;
    }
    if n >= 5 {
        let candidate = [tokens[n - 2], tokens[n - 1], next];
        if tokens[n - 5..n - 2] == candidate {
            return true;
        }
    }
    false
}
