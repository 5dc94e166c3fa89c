//! Text-to-image workflow graph.
//!
//! Builds the API-format graph for the stock ComfyUI text-to-image pipeline:
//! checkpoint loader, positive/negative CLIP encodes, empty latent, KSampler,
//! VAE decode and SaveImage.

use rand::Rng;
use serde_json::{json, Value};

/// Checkpoint used when none is configured.
pub const DEFAULT_CHECKPOINT: &str = "sd_xl_base_1.0.safetensors";

/// Negative prompt used when none is configured.
pub const DEFAULT_NEGATIVE_PROMPT: &str = "text, watermark, low quality, blurry";

/// Parameters of a text-to-image workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct TextToImage {
    pub prompt: String,
    pub negative_prompt: String,
    pub checkpoint: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg: f32,
    pub sampler: String,
    pub scheduler: String,
    /// Fixed seed; a fresh random seed is drawn per build when `None`.
    pub seed: Option<u64>,
    pub filename_prefix: String,
}

impl TextToImage {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            checkpoint: DEFAULT_CHECKPOINT.to_string(),
            width: 1024,
            height: 1024,
            steps: 20,
            cfg: 8.0,
            sampler: "euler".to_string(),
            scheduler: "normal".to_string(),
            seed: None,
            filename_prefix: "ComfyUI".to_string(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = negative.into();
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: impl Into<String>) -> Self {
        self.checkpoint = checkpoint.into();
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Render the API-format workflow graph.
    pub fn build(&self) -> Value {
        let seed = self
            .seed
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..1_000_000_000));

        json!({
            "3": {
                "inputs": {
                    "seed": seed,
                    "steps": self.steps,
                    "cfg": self.cfg,
                    "sampler_name": self.sampler,
                    "scheduler": self.scheduler,
                    "denoise": 1,
                    "model": ["4", 0],
                    "positive": ["6", 0],
                    "negative": ["7", 0],
                    "latent_image": ["5", 0]
                },
                "class_type": "KSampler"
            },
            "4": {
                "inputs": { "ckpt_name": self.checkpoint },
                "class_type": "CheckpointLoaderSimple"
            },
            "5": {
                "inputs": {
                    "width": self.width,
                    "height": self.height,
                    "batch_size": 1
                },
                "class_type": "EmptyLatentImage"
            },
            "6": {
                "inputs": { "text": self.prompt, "clip": ["4", 1] },
                "class_type": "CLIPTextEncode"
            },
            "7": {
                "inputs": { "text": self.negative_prompt, "clip": ["4", 1] },
                "class_type": "CLIPTextEncode"
            },
            "8": {
                "inputs": { "samples": ["3", 0], "vae": ["4", 2] },
                "class_type": "VAEDecode"
            },
            "9": {
                "inputs": { "filename_prefix": self.filename_prefix, "images": ["8", 0] },
                "class_type": "SaveImage"
            }
        })
    }
}
