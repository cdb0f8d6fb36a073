use alloc::{format, string::String, vec};
use core::f64::consts::SQRT_2;

use burn::{
    config::Config,
    module::{Ignored, Module, Param, ParamId},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Initializer, PaddingConfig2d,
    },
    optim::GradientsParams,
    tensor::{
        activation::relu,
        backend::{AutodiffBackend, Backend},
        module::conv2d,
        ops::ConvOptions,
        Device, Tensor,
    },
};

use super::params::{ParamKind, ParamSpec};

/// Namespace of the per-channel additive parameters (batch norm folded into the conv).
pub const FUSED_BIAS_SCOPE: &str = "fuse_conv_bn/conv2d_eltwise_y_in";

#[derive(Config, Debug, PartialEq, Eq)]
pub enum Activation {
    Relu,
    /// ReLU capped at 6.
    Relu6,
}

impl Activation {
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Relu => relu(x),
            Activation::Relu6 => relu(x).clamp_max(6),
        }
    }
}

/// How the per-channel additive term is applied.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum ConvPath {
    /// Bias-free convolution followed by a broadcast add.
    Separate,
    /// Single convolution call carrying the additive term as its bias.
    Fused,
}

/// A Conv2d -> per-channel add -> activation unit.
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    conv: Conv2d<B>,
    bias: Param<Tensor<B, 1>>,
    activation: Ignored<Activation>,
    path: Ignored<ConvPath>,
    name: Ignored<String>,
    stride: usize,
    padding: usize,
    groups: usize,
    learning_rate: f64,
    weight_decay: f64,
    bias_decay: f64,
}

impl<B: Backend> ConvNorm<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match *self.path {
            ConvPath::Separate => {
                let x = self.conv.forward(x);
                let [channels] = self.bias.dims();
                x + self.bias.val().reshape([1, channels, 1, 1])
            }
            ConvPath::Fused => conv2d(
                x,
                self.conv.weight.val(),
                Some(self.bias.val()),
                ConvOptions::new(
                    [self.stride, self.stride],
                    [self.padding, self.padding],
                    [1, 1],
                    self.groups,
                ),
            ),
        };

        self.activation.forward(x)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &ConvPath {
        &self.path
    }

    pub fn out_channels(&self) -> usize {
        let [channels] = self.bias.dims();
        channels
    }

    /// Parameter names paired with their ids, weight first.
    pub fn param_ids(&self) -> [(String, ParamId); 2] {
        [
            (weight_name(&self.name), self.conv.weight.id),
            (bias_name(&self.name), self.bias.id),
        ]
    }

    /// L2 regularization term `decay / 2 * ||p||^2` of both parameters.
    pub fn l2_penalty(&self) -> Tensor<B, 1> {
        let weight = self
            .conv
            .weight
            .val()
            .powf_scalar(2.0)
            .sum()
            .mul_scalar(self.weight_decay / 2.0);
        let bias = self
            .bias
            .val()
            .powf_scalar(2.0)
            .sum()
            .mul_scalar(self.bias_decay / 2.0);

        weight + bias
    }
}

impl<B: AutodiffBackend> ConvNorm<B> {
    /// Apply the convolution learning rate multiplier to the weight gradient.
    pub fn scale_gradients(&self, grads: &mut GradientsParams) {
        if self.learning_rate == 1.0 {
            return;
        }

        let id = self.conv.weight.id;
        if let Some(grad) = grads.remove::<B::InnerBackend, 4>(id) {
            grads.register::<B::InnerBackend, 4>(id, grad.mul_scalar(self.learning_rate));
        }
    }
}

/// [Conv-norm unit](ConvNorm) configuration.
#[derive(Config, Debug)]
pub struct ConvNormConfig {
    pub name: String,
    pub in_channels: usize,
    pub out_channels: usize,

    #[config(default = "3")]
    pub kernel_size: usize,

    #[config(default = "1")]
    pub stride: usize,

    #[config(default = "1")]
    pub padding: usize,

    #[config(default = "1")]
    pub groups: usize,

    #[config(default = "Activation::Relu")]
    pub activation: Activation,

    #[config(default = "ConvPath::Separate")]
    pub path: ConvPath,

    /// Learning rate multiplier of the convolution weight.
    #[config(default = "1.0")]
    pub learning_rate: f64,

    #[config(default = "0.0")]
    pub weight_decay: f64,

    #[config(default = "0.0")]
    pub bias_decay: f64,
}

impl ConvNormConfig {
    /// Initialize a new [conv-norm unit](ConvNorm) module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> ConvNorm<B> {
        log::debug!(
            "{}: {}x{} conv {} -> {}, stride {}, groups {}, {:?}, {:?}",
            self.name,
            self.kernel_size,
            self.kernel_size,
            self.in_channels,
            self.out_channels,
            self.stride,
            self.groups,
            self.activation,
            self.path,
        );

        // MSRA initialization, uniform over fan-in
        let initializer = Initializer::KaimingUniform {
            gain: SQRT_2,
            fan_out_only: false,
        };
        let conv = Conv2dConfig::new(
            [self.in_channels, self.out_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([self.stride, self.stride])
        .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
        .with_groups(self.groups)
        .with_bias(false)
        .with_initializer(initializer)
        .init(device);

        let bias = Initializer::XavierUniform { gain: 1.0 }.init_with(
            [self.out_channels],
            Some(self.out_channels),
            Some(self.out_channels),
            device,
        );

        ConvNorm {
            conv,
            bias,
            activation: Ignored(self.activation.clone()),
            path: Ignored(self.path.clone()),
            name: Ignored(self.name.clone()),
            stride: self.stride,
            padding: self.padding,
            groups: self.groups,
            learning_rate: self.learning_rate,
            weight_decay: self.weight_decay,
            bias_decay: self.bias_decay,
        }
    }

    /// Parameters created by [init](ConvNormConfig::init), weight first.
    pub fn param_specs(&self) -> [ParamSpec; 2] {
        let weight = ParamSpec {
            name: weight_name(&self.name),
            shape: vec![
                self.out_channels,
                self.in_channels / self.groups,
                self.kernel_size,
                self.kernel_size,
            ],
            kind: ParamKind::ConvWeight,
            learning_rate: self.learning_rate,
            l2_decay: self.weight_decay,
        };
        let bias = ParamSpec {
            name: bias_name(&self.name),
            shape: vec![self.out_channels],
            kind: ParamKind::ChannelBias,
            learning_rate: 1.0,
            l2_decay: self.bias_decay,
        };

        [weight, bias]
    }
}

fn weight_name(name: &str) -> String {
    format!("{name}_weights")
}

fn bias_name(name: &str) -> String {
    format!("{FUSED_BIAS_SCOPE}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Distribution};

    type B = NdArray<f32>;

    #[test]
    fn output_shape_follows_stride() {
        let device = Default::default();
        let unit = ConvNormConfig::new("conv1".into(), 3, 8)
            .with_stride(2)
            .init::<B>(&device);

        let x = Tensor::<B, 4>::random([2, 3, 16, 16], Distribution::Default, &device);
        assert_eq!(unit.forward(x).dims(), [2, 8, 8, 8]);
    }

    #[test]
    fn relu6_caps_activations() {
        let device = Default::default();
        let unit = ConvNormConfig::new("capped".into(), 4, 4)
            .with_activation(Activation::Relu6)
            .init::<B>(&device);

        let x = Tensor::<B, 4>::random([1, 4, 8, 8], Distribution::Uniform(0.0, 1000.0), &device);
        let out = unit.forward(x);

        assert!(out.clone().max().into_scalar() <= 6.0);
        assert!(out.min().into_scalar() >= 0.0);
    }

    #[test]
    fn fused_path_matches_separate_path() {
        let device = Default::default();
        let separate = ConvNormConfig::new("dw".into(), 6, 6)
            .with_groups(6)
            .with_stride(2)
            .init::<B>(&device);
        let fused = ConvNorm {
            path: Ignored(ConvPath::Fused),
            ..separate.clone()
        };

        let x = Tensor::<B, 4>::random([2, 6, 9, 9], Distribution::Default, &device);
        let diff = (separate.forward(x.clone()) - fused.forward(x))
            .abs()
            .max()
            .into_scalar();

        assert!(diff < 1e-4, "paths diverge by {diff}");
    }

    #[test]
    fn param_specs_describe_grouped_weights() {
        let config = ConvNormConfig::new("conv2_1_dw".into(), 32, 32)
            .with_groups(32)
            .with_learning_rate(0.1)
            .with_weight_decay(4e-5);
        let [weight, bias] = config.param_specs();

        assert_eq!(weight.name, "conv2_1_dw_weights");
        assert_eq!(weight.shape, vec![32, 1, 3, 3]);
        assert_eq!(weight.learning_rate, 0.1);
        assert_eq!(weight.l2_decay, 4e-5);
        assert_eq!(bias.name, "fuse_conv_bn/conv2d_eltwise_y_in/conv2_1_dw");
        assert_eq!(bias.shape, vec![32]);
        assert_eq!(bias.kind, ParamKind::ChannelBias);
    }

    #[test]
    fn penalty_vanishes_without_decay() {
        let device = Default::default();
        let unit = ConvNormConfig::new("conv".into(), 2, 2).init::<B>(&device);

        assert_eq!(unit.l2_penalty().into_scalar(), 0.0);
    }
}
