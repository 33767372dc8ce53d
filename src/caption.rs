use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use anyhow::{anyhow, bail, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::{blip, blip_text};
use image::imageops::FilterType;
use parking_lot::Mutex;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::config::BlipConfig;

const IMAGE_SIZE: u32 = 384;
const DECODER_START_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;
const IMAGE_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const IMAGE_STD: [f32; 3] = [0.26862954, 0.261_302_6, 0.275_777_1];

/// Produces a literal description of an image on disk.
///
/// Implementations are shared across concurrent requests, so they must handle
/// their own synchronization.
pub trait Captioner: Send + Sync {
    fn generate_caption(&self, image_path: &Path) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlipVariant {
    Base,
    Large,
}

impl BlipVariant {
    pub fn checkpoint(self) -> &'static str {
        match self {
            BlipVariant::Base => "Salesforce/blip-image-captioning-base",
            BlipVariant::Large => "Salesforce/blip-image-captioning-large",
        }
    }

    pub fn checkpoint_dir(self) -> &'static str {
        match self {
            BlipVariant::Base => "blip-image-captioning-base",
            BlipVariant::Large => "blip-image-captioning-large",
        }
    }

    fn config(self) -> blip::Config {
        match self {
            BlipVariant::Base => blip_base_config(),
            BlipVariant::Large => blip::Config::image_captioning_large(),
        }
    }
}

impl fmt::Display for BlipVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlipVariant::Base => "base",
            BlipVariant::Large => "large",
        })
    }
}

impl FromStr for BlipVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base" => Ok(BlipVariant::Base),
            "large" => Ok(BlipVariant::Large),
            other => Err(format!("expected `base` or `large`, got `{other}`")),
        }
    }
}

fn blip_base_config() -> blip::Config {
    let text_config = blip_text::Config {
        vocab_size: 30524,
        hidden_size: 768,
        encoder_hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 768,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        max_position_embeddings: 512,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-12,
        is_decoder: true,
    };
    let vision_config = blip::VisionConfig {
        hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 512,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        image_size: IMAGE_SIZE as usize,
        patch_size: 16,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-5,
    };

    blip::Config {
        text_config,
        vision_config,
        projection_dim: 512,
        image_text_hidden_size: 256,
    }
}

struct BlipState {
    model: blip::BlipForConditionalGeneration,
    logits_processor: LogitsProcessor,
}

/// BLIP conditional-generation model loaded once at startup.
///
/// The text decoder keeps a KV cache that is mutated during generation, so
/// calls are serialized through a mutex.
pub struct BlipCaptioner {
    state: Mutex<BlipState>,
    tokenizer: Tokenizer,
    device: Device,
    max_tokens: usize,
}

impl BlipCaptioner {
    pub fn load(config: &BlipConfig) -> anyhow::Result<Self> {
        let start = Instant::now();
        info!(
            checkpoint = config.variant.checkpoint(),
            weights = %config.model_path.display(),
            "loading captioning model"
        );

        let tokenizer = Tokenizer::from_file(&config.tokenizer_path).map_err(|err| {
            anyhow!(
                "failed to load tokenizer from {}: {err}",
                config.tokenizer_path.display()
            )
        })?;

        let device = Device::Cpu;
        // Safety: the weights file is opened read-only and must not be modified while mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&config.model_path], DType::F32, &device)
        }
        .with_context(|| format!("failed to map weights {}", config.model_path.display()))?;
        let model = blip::BlipForConditionalGeneration::new(&config.variant.config(), vb)?;

        info!(elapsed = ?start.elapsed(), "captioning model ready");

        Ok(Self::from_parts(model, tokenizer, device, config.max_tokens))
    }

    pub(crate) fn from_parts(
        model: blip::BlipForConditionalGeneration,
        tokenizer: Tokenizer,
        device: Device,
        max_tokens: usize,
    ) -> Self {
        // No temperature means argmax sampling, so the seed is unused.
        let logits_processor = LogitsProcessor::new(0, None, None);

        Self {
            state: Mutex::new(BlipState {
                model,
                logits_processor,
            }),
            tokenizer,
            device,
            max_tokens,
        }
    }

    /// Greedy decoding from `[DEC]` until `[SEP]` or `max_tokens` new tokens.
    /// The returned ids start with the decoder start token.
    pub(crate) fn generate_tokens(&self, image: &Tensor) -> anyhow::Result<Vec<u32>> {
        let image = image.to_device(&self.device)?;

        let mut state = self.state.lock();
        let BlipState {
            model,
            logits_processor,
        } = &mut *state;

        let image_embeds = image.unsqueeze(0)?.apply(model.vision_model())?;
        model.text_decoder().reset_kv_cache();

        let mut token_ids = vec![DECODER_START_TOKEN_ID];
        for index in 0..self.max_tokens {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = model.text_decoder().forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }
        Ok(token_ids)
    }
}

impl Captioner for BlipCaptioner {
    fn generate_caption(&self, image_path: &Path) -> anyhow::Result<String> {
        let start = Instant::now();
        let image = load_image(image_path)?;
        let token_ids = self.generate_tokens(&image)?;

        let caption = self
            .tokenizer
            .decode(&token_ids, true)
            .map_err(|err| anyhow!("failed to decode caption tokens: {err}"))?
            .trim()
            .to_string();

        if caption.is_empty() {
            bail!(
                "captioning model produced an empty caption for {}",
                image_path.display()
            );
        }

        debug!(
            path = %image_path.display(),
            tokens = token_ids.len(),
            elapsed = ?start.elapsed(),
            "caption generated"
        );
        Ok(caption)
    }
}

/// Reads an image and turns it into a normalized `(3, 384, 384)` tensor.
pub fn load_image(path: &Path) -> anyhow::Result<Tensor> {
    let img = image::io::Reader::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?
        .with_guessed_format()?
        .decode()
        .with_context(|| format!("failed to decode image {}", path.display()))?
        .resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::CatmullRom)
        .to_rgb8();

    let size = IMAGE_SIZE as usize;
    let data = Tensor::from_vec(img.into_raw(), (size, size, 3), &Device::Cpu)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGE_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, &Device::Cpu)?.reshape((3, 1, 1))?;

    let normalized = (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?;
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;
    use image::{Rgb, RgbImage};

    #[test]
    fn variant_parsing() {
        assert_eq!("base".parse::<BlipVariant>().unwrap(), BlipVariant::Base);
        assert_eq!(" LARGE ".parse::<BlipVariant>().unwrap(), BlipVariant::Large);
        assert!("xl".parse::<BlipVariant>().is_err());
        assert_eq!(BlipVariant::Large.to_string(), "large");
        assert_eq!(
            BlipVariant::Base.checkpoint(),
            "Salesforce/blip-image-captioning-base"
        );
    }

    #[test]
    fn load_image_normalizes_to_model_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("white.png");
        RgbImage::from_pixel(64, 32, Rgb([255, 255, 255]))
            .save(&path)
            .unwrap();

        let tensor = load_image(&path).unwrap();
        assert_eq!(tensor.dims(), &[3, 384, 384]);
        assert_eq!(tensor.dtype(), DType::F32);

        // A white pixel maps to (1 - mean) / std on every channel.
        let pixel: Vec<f32> = tensor.i((.., 0, 0)).unwrap().to_vec1().unwrap();
        for channel in 0..3 {
            let expected = (1.0 - IMAGE_MEAN[channel]) / IMAGE_STD[channel];
            assert!((pixel[channel] - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn load_image_ignores_misleading_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.jpg");
        let png = dir.path().join("source.png");
        RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])).save(&png).unwrap();
        std::fs::copy(&png, &path).unwrap();

        assert!(load_image(&path).is_ok());
    }

    #[test]
    fn load_image_rejects_non_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.jpg");
        std::fs::write(&path, b"definitely not pixels").unwrap();

        assert!(load_image(&path).is_err());
        assert!(load_image(&dir.path().join("missing.jpg")).is_err());
    }

    fn tiny_config() -> blip::Config {
        let text_config = blip_text::Config {
            vocab_size: 30524,
            hidden_size: 8,
            encoder_hidden_size: 8,
            intermediate_size: 16,
            projection_dim: 8,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            max_position_embeddings: 64,
            hidden_act: candle_nn::Activation::Gelu,
            layer_norm_eps: 1e-12,
            is_decoder: true,
        };
        let vision_config = blip::VisionConfig {
            hidden_size: 8,
            intermediate_size: 16,
            projection_dim: 8,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            image_size: IMAGE_SIZE as usize,
            patch_size: 32,
            hidden_act: candle_nn::Activation::Gelu,
            layer_norm_eps: 1e-5,
        };
        blip::Config {
            text_config,
            vision_config,
            projection_dim: 8,
            image_text_hidden_size: 8,
        }
    }

    /// Word-level tokenizer covering every id as `w<id>`, with `[SEP]` and `[DEC]` special.
    fn word_tokenizer() -> Tokenizer {
        let mut vocab = serde_json::Map::new();
        for id in 0..30524u32 {
            let token = match id {
                SEP_TOKEN_ID => "[SEP]".to_string(),
                DECODER_START_TOKEN_ID => "[DEC]".to_string(),
                _ => format!("w{id}"),
            };
            vocab.insert(token, serde_json::json!(id));
        }
        let special = |id: u32, content: &str| {
            serde_json::json!({
                "id": id, "content": content, "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            })
        };
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [special(SEP_TOKEN_ID, "[SEP]"), special(DECODER_START_TOKEN_ID, "[DEC]")],
            "normalizer": null,
            "pre_tokenizer": null,
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "w0" }
        });
        json.to_string().parse().unwrap()
    }

    /// Randomly initialized BLIP small enough to run in a unit test.
    fn tiny_captioner(max_tokens: usize) -> BlipCaptioner {
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = blip::BlipForConditionalGeneration::new(&tiny_config(), vb).unwrap();
        BlipCaptioner::from_parts(model, word_tokenizer(), Device::Cpu, max_tokens)
    }

    fn gradient_png(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("gradient.png");
        RgbImage::from_fn(48, 48, |x, y| Rgb([(x * 5) as u8, (y * 5) as u8, 128]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn decoding_is_repeatable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = gradient_png(dir.path());
        let captioner = tiny_captioner(6);

        // The second call only matches if the decoder cache is cleared between requests.
        let first = captioner.generate_tokens(&load_image(&path).unwrap()).unwrap();
        let second = captioner.generate_tokens(&load_image(&path).unwrap()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0], DECODER_START_TOKEN_ID);
        assert!(!first[1..].contains(&SEP_TOKEN_ID));

        let caption = captioner.generate_caption(&path).unwrap();
        assert_eq!(caption, captioner.generate_caption(&path).unwrap());
        assert!(!caption.contains("[DEC]"));
    }

    #[test]
    fn decoding_stops_at_max_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = gradient_png(dir.path());
        let image = load_image(&path).unwrap();

        for max_tokens in [1, 4] {
            let tokens = tiny_captioner(max_tokens).generate_tokens(&image).unwrap();
            assert!(tokens.len() <= max_tokens + 1, "{tokens:?}");
        }
    }

    #[test]
    fn empty_caption_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = gradient_png(dir.path());

        let err = tiny_captioner(0).generate_caption(&path).unwrap_err();
        assert!(err.to_string().contains("empty caption"));
    }

    #[test]
    fn caption_fails_for_unreadable_image() {
        let dir = tempfile::tempdir().unwrap();
        assert!(tiny_captioner(2)
            .generate_caption(&dir.path().join("missing.png"))
            .is_err());
    }
}
