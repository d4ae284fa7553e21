use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::lr_scheduler::step::StepLrScheduler;
use clap::{Parser, ValueEnum};
use models::{BackboneArch, ResNetConfig, IMAGENET_CLASSES};
use score_dataset::{BatchConfig, TableColumns, TransformPipeline};
use serde::{Deserialize, Serialize};

use crate::schedule::step_lr_scheduler;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[value(name = "ndarray")]
    NdArray,
    Wgpu,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchKind {
    Resnet50,
    Resnet101,
    Resnet152,
}

impl From<ArchKind> for BackboneArch {
    fn from(kind: ArchKind) -> Self {
        match kind {
            ArchKind::Resnet50 => BackboneArch::Resnet50,
            ArchKind::Resnet101 => BackboneArch::Resnet101,
            ArchKind::Resnet152 => BackboneArch::Resnet152,
        }
    }
}

/// Fully resolved run configuration. Every field has a default so a TOML file may
/// set any subset of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Name of the saved model under `models_dir`.
    pub model_name: String,
    /// Start from ImageNet weights (`backbone_weights`) instead of random init.
    pub pretrained: bool,
    pub table_prefix: String,
    pub epochs: usize,
    pub batch_size: usize,
    pub arch: BackboneArch,
    /// Explicit layer layout; overrides `arch` when set.
    pub backbone: Option<ResNetConfig>,
    pub backbone_weights: Option<PathBuf>,
    pub data_root: PathBuf,
    /// Defaults to `<data_root>/images`.
    pub image_dir: Option<PathBuf>,
    pub columns: TableColumns,
    pub models_dir: PathBuf,
    pub dump_path: PathBuf,
    pub dump_limit: usize,
    pub workers: usize,
    pub seed: Option<u64>,
    pub lr: f64,
    pub lr_step: usize,
    pub lr_gamma: f64,
    pub pipeline: TransformPipeline,
    /// Run validation batches through the random augmentations too.
    pub augment_validation: bool,
    pub skip_unreadable: bool,
    pub backend: BackendKind,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model_name: "score_model".to_string(),
            pretrained: false,
            table_prefix: String::new(),
            epochs: 1,
            batch_size: 32,
            arch: BackboneArch::Resnet50,
            backbone: None,
            backbone_weights: None,
            data_root: PathBuf::from(".."),
            image_dir: None,
            columns: TableColumns::default(),
            models_dir: PathBuf::from("saved_models"),
            dump_path: PathBuf::from("df_output.txt"),
            dump_limit: 200,
            workers: 0,
            seed: None,
            lr: 0.01,
            lr_step: 10,
            lr_gamma: 0.3,
            pipeline: TransformPipeline::default(),
            augment_validation: false,
            skip_unreadable: false,
            backend: BackendKind::NdArray,
        }
    }
}

impl TrainConfig {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Defaults, then the optional `--config` file, then flags, then positionals.
    pub fn from_args(args: &TrainArgs) -> anyhow::Result<Self> {
        let mut cfg = match &args.config {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        args.apply(&mut cfg);
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        if self.table_prefix.is_empty() {
            anyhow::bail!("table_prefix must not be empty");
        }
        if self.model_name.is_empty() {
            anyhow::bail!("model_name must not be empty");
        }
        self.scheduler()?;
        Ok(())
    }

    pub fn image_dir(&self) -> PathBuf {
        self.image_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join("images"))
    }

    pub fn resnet(&self) -> ResNetConfig {
        self.backbone
            .clone()
            .unwrap_or_else(|| ResNetConfig::for_arch(self.arch, IMAGENET_CLASSES))
    }

    /// Fails when `lr_step` is 0.
    pub fn scheduler(&self) -> anyhow::Result<StepLrScheduler> {
        step_lr_scheduler(self.lr, self.lr_gamma, self.lr_step)
    }

    /// Weights to start from. `pretrained` without a weights path falls back to
    /// random init with a warning.
    pub fn pretrained_weights(&self) -> Option<&Path> {
        match (self.pretrained, self.backbone_weights.as_deref()) {
            (true, Some(path)) => Some(path),
            (true, None) => {
                log::warn!(
                    "pretrained requested but no --backbone-weights given; using random init"
                );
                None
            }
            (false, _) => None,
        }
    }

    pub fn train_batches(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            shuffle: true,
            seed: self.seed,
            num_workers: self.workers,
            skip_unreadable: self.skip_unreadable,
        }
    }

    /// Validation is shuffled like training; passes draw from their own seed space.
    pub fn val_batches(&self) -> BatchConfig {
        self.train_batches()
    }

    pub fn val_pipeline(&self) -> TransformPipeline {
        if self.augment_validation {
            self.pipeline.clone()
        } else {
            self.pipeline.deterministic()
        }
    }

    /// Final checkpoint path without the recorder's `.bin` extension.
    pub fn model_path(&self) -> PathBuf {
        self.models_dir.join(&self.model_name)
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Fine-tune a ResNet into an image-quality score regressor"
)]
pub struct TrainArgs {
    /// Name the trained model is saved under (in --models-dir).
    pub model_name: String,
    /// Start from pretrained backbone weights. Anything but false/0/no/off/none
    /// counts as true.
    pub pretrained: String,
    /// Table prefix: reads <prefix>_image_score_table_{train,val}.csv.
    pub table_prefix: String,
    /// Number of epochs.
    pub epochs: usize,
    /// Batch size.
    pub batch_size: usize,
    /// Optional TOML config; flags and positionals override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Directory holding the score tables.
    #[arg(long)]
    pub data_root: Option<PathBuf>,
    /// Directory holding the images (defaults to <data-root>/images).
    #[arg(long)]
    pub image_dir: Option<PathBuf>,
    /// Directory the final model is saved to.
    #[arg(long)]
    pub models_dir: Option<PathBuf>,
    /// Prediction dump file (appended to).
    #[arg(long)]
    pub dump_path: Option<PathBuf>,
    /// Maximum lines written to the dump file.
    #[arg(long)]
    pub dump_limit: Option<usize>,
    /// Loader threads (0 loads on the training thread).
    #[arg(long)]
    pub workers: Option<usize>,
    /// Seed for shuffling, augmentation and weight init.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Initial learning rate.
    #[arg(long)]
    pub lr: Option<f64>,
    /// Epochs between learning-rate decays.
    #[arg(long)]
    pub lr_step: Option<usize>,
    /// Learning-rate decay factor.
    #[arg(long)]
    pub lr_gamma: Option<f64>,
    /// Backbone depth.
    #[arg(long, value_enum)]
    pub arch: Option<ArchKind>,
    /// Burn record of the ImageNet classifier used when pretrained=true.
    #[arg(long)]
    pub backbone_weights: Option<PathBuf>,
    /// Apply random augmentations to validation images as well.
    #[arg(long)]
    pub augment_validation: bool,
    /// Skip unreadable images instead of aborting.
    #[arg(long)]
    pub skip_unreadable: bool,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
}

impl TrainArgs {
    fn apply(&self, cfg: &mut TrainConfig) {
        if let Some(v) = &self.data_root {
            cfg.data_root = v.clone();
        }
        if let Some(v) = &self.image_dir {
            cfg.image_dir = Some(v.clone());
        }
        if let Some(v) = &self.models_dir {
            cfg.models_dir = v.clone();
        }
        if let Some(v) = &self.dump_path {
            cfg.dump_path = v.clone();
        }
        if let Some(v) = self.dump_limit {
            cfg.dump_limit = v;
        }
        if let Some(v) = self.workers {
            cfg.workers = v;
        }
        if let Some(v) = self.seed {
            cfg.seed = Some(v);
        }
        if let Some(v) = self.lr {
            cfg.lr = v;
        }
        if let Some(v) = self.lr_step {
            cfg.lr_step = v;
        }
        if let Some(v) = self.lr_gamma {
            cfg.lr_gamma = v;
        }
        if let Some(v) = self.arch {
            cfg.arch = v.into();
            cfg.backbone = None;
        }
        if let Some(v) = &self.backbone_weights {
            cfg.backbone_weights = Some(v.clone());
        }
        if let Some(v) = self.backend {
            cfg.backend = v;
        }
        cfg.augment_validation |= self.augment_validation;
        cfg.skip_unreadable |= self.skip_unreadable;

        cfg.model_name = self.model_name.clone();
        cfg.pretrained = parse_flag(&self.pretrained);
        cfg.table_prefix = self.table_prefix.clone();
        cfg.epochs = self.epochs;
        cfg.batch_size = self.batch_size;
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Dump predictions of a saved score regressor on the validation split"
)]
pub struct EvalArgs {
    /// Saved model name (in --models-dir).
    pub model_name: String,
    /// Table prefix: reads <prefix>_image_score_table_val.csv.
    pub table_prefix: String,
    /// Optional TOML config shared with `train`.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub data_root: Option<PathBuf>,
    #[arg(long)]
    pub image_dir: Option<PathBuf>,
    #[arg(long)]
    pub models_dir: Option<PathBuf>,
    #[arg(long)]
    pub dump_path: Option<PathBuf>,
    #[arg(long)]
    pub dump_limit: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub workers: Option<usize>,
    #[arg(long, value_enum)]
    pub arch: Option<ArchKind>,
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
}

impl EvalArgs {
    pub fn to_config(&self) -> anyhow::Result<TrainConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::from_path(path)?,
            None => TrainConfig::default(),
        };
        if let Some(v) = &self.data_root {
            cfg.data_root = v.clone();
        }
        if let Some(v) = &self.image_dir {
            cfg.image_dir = Some(v.clone());
        }
        if let Some(v) = &self.models_dir {
            cfg.models_dir = v.clone();
        }
        if let Some(v) = &self.dump_path {
            cfg.dump_path = v.clone();
        }
        if let Some(v) = self.dump_limit {
            cfg.dump_limit = v;
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.workers {
            cfg.workers = v;
        }
        if let Some(v) = self.arch {
            cfg.arch = v.into();
            cfg.backbone = None;
        }
        if let Some(v) = self.backend {
            cfg.backend = v;
        }
        cfg.model_name = self.model_name.clone();
        cfg.table_prefix = self.table_prefix.clone();
        Ok(cfg)
    }
}

/// Lenient truthiness for the `pretrained` positional.
pub fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "" | "false" | "f" | "0" | "no" | "n" | "off" | "none"
    )
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!(
                "backend-wgpu feature not enabled; \
                 rebuild with --features backend-wgpu or choose ndarray backend"
            )
        }
        (BackendKind::NdArray, true) => {
            log::warn!(
                "built with backend-wgpu; \
                 training will still use the WGPU backend despite --backend ndarray"
            );
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positionals_parse_boolish_pretrained() {
        let args =
            TrainArgs::try_parse_from(["train", "koniq_model", "no", "koniq", "20", "16"]).unwrap();
        let cfg = TrainConfig::from_args(&args).unwrap();
        assert_eq!(cfg.model_name, "koniq_model");
        assert!(!cfg.pretrained);
        assert_eq!(cfg.table_prefix, "koniq");
        assert_eq!(cfg.epochs, 20);
        assert_eq!(cfg.batch_size, 16);
        assert_eq!(cfg.image_dir(), PathBuf::from("../images"));
        assert_eq!(cfg.dump_limit, 200);
        assert_eq!(cfg.model_path(), PathBuf::from("saved_models/koniq_model"));
        assert!(!cfg.val_pipeline().augment);
        assert!(cfg.pipeline.augment);

        for (raw, expected) in [
            ("true", true),
            ("1", true),
            ("IMAGENET1K_V2", true),
            ("False", false),
            ("0", false),
            ("none", false),
        ] {
            let args = TrainArgs::try_parse_from(["train", "m", raw, "koniq", "1", "1"]).unwrap();
            assert_eq!(TrainConfig::from_args(&args).unwrap().pretrained, expected, "{raw}");
        }
    }

    #[test]
    fn backend_flag_accepts_ndarray_and_wgpu() {
        let parse = |value: &str| {
            TrainArgs::try_parse_from(["train", "m", "0", "k", "1", "1", "--backend", value])
                .map(|args| args.backend)
        };
        assert_eq!(parse("ndarray").unwrap(), Some(BackendKind::NdArray));
        assert_eq!(parse("wgpu").unwrap(), Some(BackendKind::Wgpu));
        assert!(parse("nd-array").is_err());
        let from_toml: TrainConfig = toml::from_str("backend = \"ndarray\"").unwrap();
        assert_eq!(from_toml.backend, BackendKind::NdArray);
    }

    #[test]
    fn validation_batches_are_shuffled() {
        let cfg = TrainConfig::default();
        assert!(cfg.val_batches().shuffle);
        assert_eq!(cfg.val_batches().batch_size, cfg.batch_size);
    }

    #[test]
    fn toml_values_sit_between_defaults_and_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("train.toml");
        std::fs::write(
            &path,
            r#"
data_root = "/data/iqa"
lr = 0.001
workers = 4
epochs = 99

[pipeline]
resize = [64, 64]
crop = [32, 32]
augment = false
perspective_prob = 0.5
distortion_scale = 0.6
rotation_degrees = [0.0, 90.0]
blur_kernel = [3, 3]
blur_sigma = [0.1, 2.0]
"#,
        )
        .unwrap();
        let args = TrainArgs::try_parse_from([
            "train",
            "m",
            "0",
            "spaq",
            "3",
            "8",
            "--config",
            path.to_str().unwrap(),
            "--workers",
            "2",
        ])
        .unwrap();
        let cfg = TrainConfig::from_args(&args).unwrap();
        assert_eq!(cfg.data_root, PathBuf::from("/data/iqa"));
        assert_eq!(cfg.lr, 0.001);
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.epochs, 3);
        assert_eq!(cfg.pipeline.crop, (32, 32));
        assert_eq!(cfg.lr_gamma, 0.3);
    }

    #[test]
    fn rejects_zero_batch_and_zero_lr_step() {
        let mut cfg = TrainConfig {
            table_prefix: "t".into(),
            batch_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        cfg.batch_size = 2;
        assert!(cfg.validate().is_ok());
        cfg.lr_step = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pretrained_without_weights_falls_back_to_random_init() {
        let mut cfg = TrainConfig {
            table_prefix: "t".into(),
            pretrained: true,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
        assert!(cfg.pretrained_weights().is_none());
        cfg.backbone_weights = Some(PathBuf::from("resnet50.bin"));
        assert_eq!(cfg.pretrained_weights(), Some(Path::new("resnet50.bin")));
        cfg.pretrained = false;
        assert!(cfg.pretrained_weights().is_none());
    }

    #[test]
    fn wgpu_requires_feature() {
        if cfg!(feature = "backend-wgpu") {
            assert!(validate_backend_choice(BackendKind::Wgpu).is_ok());
        } else {
            assert!(validate_backend_choice(BackendKind::Wgpu).is_err());
        }
        assert!(validate_backend_choice(BackendKind::NdArray).is_ok());
    }
}
