//! Burn models for image-quality regression.
//!
//! - `ResNet`: bottleneck ResNet backbone (ResNet-50/101/152 layouts) with a linear head.
//! - `ScoreRegressor`: the narrow capability the trainer consumes (`predict`).
//!
//! The regression model is an ImageNet-shaped ResNet whose final linear layer is
//! swapped for a single-output layer, optionally after loading pretrained weights.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Number of ImageNet classes; pretrained records carry a head of this size.
pub const IMAGENET_CLASSES: usize = 1000;
const EXPANSION: usize = 4;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to load weights from {path}: {msg}")]
    Weights { path: String, msg: String },
    #[error("failed to save weights to {path}: {msg}")]
    Save { path: String, msg: String },
}

/// Anything that maps an image batch `[n, 3, H, W]` to scores `[n, 1]`.
pub trait ScoreRegressor<B: Backend> {
    fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneArch {
    Resnet50,
    Resnet101,
    Resnet152,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResNetConfig {
    /// Bottleneck blocks per stage.
    pub layers: [usize; 4],
    /// Channels of the stem and of the first stage's inner convolutions.
    pub base_width: usize,
    pub num_classes: usize,
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self::resnet50(IMAGENET_CLASSES)
    }
}

impl ResNetConfig {
    pub fn resnet50(num_classes: usize) -> Self {
        Self {
            layers: [3, 4, 6, 3],
            base_width: 64,
            num_classes,
        }
    }

    pub fn resnet101(num_classes: usize) -> Self {
        Self {
            layers: [3, 4, 23, 3],
            ..Self::resnet50(num_classes)
        }
    }

    pub fn resnet152(num_classes: usize) -> Self {
        Self {
            layers: [3, 8, 36, 3],
            ..Self::resnet50(num_classes)
        }
    }

    pub fn for_arch(arch: BackboneArch, num_classes: usize) -> Self {
        match arch {
            BackboneArch::Resnet50 => Self::resnet50(num_classes),
            BackboneArch::Resnet101 => Self::resnet101(num_classes),
            BackboneArch::Resnet152 => Self::resnet152(num_classes),
        }
    }

    /// Width of the pooled feature vector fed to the head.
    pub fn feature_dim(&self) -> usize {
        self.base_width * 8 * EXPANSION
    }
}

fn conv<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .init(device)
}

#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// 1x1 reduce, 3x3 (strided), 1x1 expand, plus identity or projected shortcut.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    fn new(in_channels: usize, width: usize, stride: usize, device: &B::Device) -> Self {
        let out_channels = width * EXPANSION;
        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: conv([in_channels, out_channels], 1, stride, 0, device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });
        Self {
            conv1: conv([in_channels, width], 1, 1, 0, device),
            bn1: BatchNormConfig::new(width).init(device),
            conv2: conv([width, width], 3, stride, 1, device),
            bn2: BatchNormConfig::new(width).init(device),
            conv3: conv([width, out_channels], 1, 1, 0, device),
            bn3: BatchNormConfig::new(out_channels).init(device),
            downsample,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(ds) => ds.forward(input.clone()),
            None => input.clone(),
        };
        let x = relu(self.bn1.forward(self.conv1.forward(input)));
        let x = relu(self.bn2.forward(self.conv2.forward(x)));
        let x = self.bn3.forward(self.conv3.forward(x));
        relu(x + identity)
    }
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    maxpool: MaxPool2d,
    layer1: Vec<Bottleneck<B>>,
    layer2: Vec<Bottleneck<B>>,
    layer3: Vec<Bottleneck<B>>,
    layer4: Vec<Bottleneck<B>>,
    avgpool: AdaptiveAvgPool2d,
    fc: Linear<B>,
    feature_dim: usize,
}

impl<B: Backend> ResNet<B> {
    pub fn new(cfg: &ResNetConfig, device: &B::Device) -> Self {
        let base = cfg.base_width.max(1);
        let mut in_channels = base;
        let mut stage = |blocks: usize, width: usize, stride: usize| {
            let mut out = Vec::with_capacity(blocks.max(1));
            for i in 0..blocks.max(1) {
                let s = if i == 0 { stride } else { 1 };
                out.push(Bottleneck::new(in_channels, width, s, device));
                in_channels = width * EXPANSION;
            }
            out
        };
        let layer1 = stage(cfg.layers[0], base, 1);
        let layer2 = stage(cfg.layers[1], base * 2, 2);
        let layer3 = stage(cfg.layers[2], base * 4, 2);
        let layer4 = stage(cfg.layers[3], base * 8, 2);
        let feature_dim = base * 8 * EXPANSION;

        Self {
            conv1: conv([3, base], 7, 2, 3, device),
            bn1: BatchNormConfig::new(base).init(device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1,
            layer2,
            layer3,
            layer4,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(feature_dim, cfg.num_classes.max(1)).init(device),
            feature_dim,
        }
    }

    /// Pooled backbone features, shape `[n, feature_dim]`.
    pub fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.bn1.forward(self.conv1.forward(images)));
        let mut x = self.maxpool.forward(x);
        for block in self
            .layer1
            .iter()
            .chain(&self.layer2)
            .chain(&self.layer3)
            .chain(&self.layer4)
        {
            x = block.forward(x);
        }
        self.avgpool.forward(x).flatten::<2>(1, 3)
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.fc.forward(self.features(images))
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// Replace the classification head with a freshly initialised head of `outputs` units.
    pub fn with_head(mut self, outputs: usize, device: &B::Device) -> Self {
        self.fc = LinearConfig::new(self.feature_dim, outputs.max(1)).init(device);
        self
    }

    /// Single scalar output head.
    pub fn with_regression_head(self, device: &B::Device) -> Self {
        self.with_head(1, device)
    }
}

impl<B: Backend> ScoreRegressor<B> for ResNet<B> {
    fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }
}

/// Build the score regressor: ImageNet-shaped backbone, optional pretrained weights
/// (a Burn binary record of the full classifier), then a single-output head.
pub fn build_regressor<B: Backend>(
    cfg: &ResNetConfig,
    pretrained: Option<&Path>,
    device: &B::Device,
) -> Result<ResNet<B>, ModelError> {
    let backbone = ResNet::<B>::new(cfg, device);
    let backbone = match pretrained {
        Some(path) => {
            let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
            let loaded = backbone
                .load_file(path, &recorder, device)
                .map_err(|e| ModelError::Weights {
                    path: path.display().to_string(),
                    msg: format!("{e:?}"),
                })?;
            log::info!("loaded pretrained backbone weights from {}", path.display());
            loaded
        }
        None => {
            log::info!("backbone initialised randomly (no pretrained weights)");
            backbone
        }
    };
    Ok(backbone.with_regression_head(device))
}

/// Load a saved regressor (single-output head) from a Burn binary record.
pub fn load_regressor<B: Backend>(
    cfg: &ResNetConfig,
    path: &Path,
    device: &B::Device,
) -> Result<ResNet<B>, ModelError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    ResNet::<B>::new(cfg, device)
        .with_regression_head(device)
        .load_file(path, &recorder, device)
        .map_err(|e| ModelError::Weights {
            path: path.display().to_string(),
            msg: format!("{e:?}"),
        })
}

/// Save any module as a Burn binary record (the recorder appends `.bin`).
pub fn save_module<B: Backend, M: Module<B>>(module: M, path: &Path) -> Result<(), ModelError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    module
        .save_file(path, &recorder)
        .map_err(|e| ModelError::Save {
            path: path.display().to_string(),
            msg: format!("{e:?}"),
        })
}

pub mod prelude {
    pub use super::{
        build_regressor, load_regressor, save_module, BackboneArch, ResNet, ResNetConfig,
        ScoreRegressor,
    };
}
