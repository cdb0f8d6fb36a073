use alloc::{format, string::String};

use burn::{
    config::Config,
    module::Module,
    tensor::{backend::Backend, Device, Tensor},
};

use super::{
    conv_norm::{ConvNorm, ConvNormConfig, ConvPath},
    params::ParamSpec,
    utils::scale_channels,
};

/// A [depthwise separable convolution](https://paperswithcode.com/method/depthwise-separable-convolution) block.
#[derive(Module, Debug)]
pub struct DepthwiseSeparable<B: Backend> {
    depthwise: ConvNorm<B>,
    pointwise: ConvNorm<B>,
}

impl<B: Backend> DepthwiseSeparable<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.depthwise.forward(x);
        self.pointwise.forward(x)
    }

    pub fn out_channels(&self) -> usize {
        self.pointwise.out_channels()
    }

    pub fn units(&self) -> [&ConvNorm<B>; 2] {
        [&self.depthwise, &self.pointwise]
    }
}

/// [Depthwise separable block](DepthwiseSeparable) configuration.
///
/// Channel and group counts are given unscaled; `scale` is applied to all three.
#[derive(Config, Debug)]
pub struct DepthwiseSeparableConfig {
    pub name: String,
    pub num_filters1: usize,
    pub num_filters2: usize,
    pub num_groups: usize,
    pub stride: usize,

    #[config(default = "1.0")]
    pub scale: f64,

    /// Use the fused kernel for the depthwise convolution.
    #[config(default = false)]
    pub fused_depthwise: bool,

    #[config(default = "1.0")]
    pub learning_rate: f64,

    #[config(default = "0.0")]
    pub weight_decay: f64,

    #[config(default = "0.0")]
    pub bias_decay: f64,
}

impl DepthwiseSeparableConfig {
    pub fn in_channels(&self) -> usize {
        scale_channels(self.num_filters1, self.scale)
    }

    pub fn out_channels(&self) -> usize {
        scale_channels(self.num_filters2, self.scale)
    }

    /// Configurations of the depthwise and pointwise units, in order.
    pub fn units(&self) -> [ConvNormConfig; 2] {
        let channels = self.in_channels();
        let path = if self.fused_depthwise {
            ConvPath::Fused
        } else {
            ConvPath::Separate
        };

        let depthwise = ConvNormConfig::new(format!("{}_dw", self.name), channels, channels)
            .with_kernel_size(3)
            .with_stride(self.stride)
            .with_padding(1)
            .with_groups(scale_channels(self.num_groups, self.scale))
            .with_path(path);
        let pointwise =
            ConvNormConfig::new(format!("{}_sep", self.name), channels, self.out_channels())
                .with_kernel_size(1)
                .with_stride(1)
                .with_padding(0);

        [depthwise, pointwise].map(|unit| {
            unit.with_learning_rate(self.learning_rate)
                .with_weight_decay(self.weight_decay)
                .with_bias_decay(self.bias_decay)
        })
    }

    /// Initialize a new [depthwise separable block](DepthwiseSeparable) module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> DepthwiseSeparable<B> {
        let [depthwise, pointwise] = self.units();

        DepthwiseSeparable {
            depthwise: depthwise.init(device),
            pointwise: pointwise.init(device),
        }
    }

    pub fn param_specs(&self) -> impl Iterator<Item = ParamSpec> {
        self.units().into_iter().flat_map(|unit| unit.param_specs())
    }
}
