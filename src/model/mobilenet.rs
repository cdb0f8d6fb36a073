use alloc::{format, string::String, vec, vec::Vec};
use core::iter;

use burn::{
    config::Config,
    module::{Ignored, Module, ParamId},
    optim::GradientsParams,
    tensor::{
        backend::{AutodiffBackend, Backend},
        Device, Tensor,
    },
};
use itertools::izip;

use super::{
    conv_norm::{ConvNorm, ConvNormConfig},
    extra_block::{ExtraBlock, ExtraBlockConfig},
    params::ParamSpec,
    separable::{DepthwiseSeparable, DepthwiseSeparableConfig},
    utils::{is_truncated, scale_channels},
};
use crate::{
    error::MobileNetError,
    precision::mixed_precision_enabled,
};

const STEM_CHANNELS: usize = 32;
const EXTRA_BLOCKS: usize = 4;

// name, num_filters1, num_filters2, num_groups, stride
const STAGES: [(&str, usize, usize, usize, usize); 13] = [
    ("conv2_1", 32, 64, 32, 1),
    ("conv2_2", 64, 128, 64, 2),
    // 1/4
    ("conv3_1", 128, 128, 128, 1),
    ("conv3_2", 128, 256, 128, 2),
    // 1/8
    ("conv4_1", 256, 256, 256, 1),
    ("conv4_2", 256, 512, 256, 2),
    // 1/16
    ("conv5_1", 512, 512, 512, 1),
    ("conv5_2", 512, 512, 512, 1),
    ("conv5_3", 512, 512, 512, 1),
    ("conv5_4", 512, 512, 512, 1),
    ("conv5_5", 512, 512, 512, 1),
    ("conv5_6", 512, 1024, 512, 2),
    // 1/32
    ("conv6", 1024, 1024, 1024, 1),
];

/// Stages returned as features: 1/8, 1/16 and 1/32.
const FEATURE_STAGES: [&str; 3] = ["conv3_2", "conv4_2", "conv6"];
/// Stages returned ahead of the extra block features: 1/16 and 1/32.
const EXTRA_FEATURE_STAGES: [&str; 2] = ["conv5_5", "conv6"];

/// Normalization layer type. Both are folded into the per-channel additive term.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum NormType {
    Bn,
    SyncBn,
}

/// [MobileNet v1](https://arxiv.org/abs/1704.04861) detection backbone.
#[derive(Module, Debug)]
pub struct MobileNet<B: Backend> {
    conv1: ConvNorm<B>,
    stages: Vec<DepthwiseSeparable<B>>,
    extra_blocks: Vec<ExtraBlock<B>>,
    feature_stages: Ignored<Vec<usize>>,
}

impl<B: Backend> MobileNet<B> {
    /// Feature maps in increasing depth order.
    ///
    /// Without extra blocks these are the 1/8, 1/16 and 1/32 resolution stages. With extra
    /// blocks, the 1/16 and 1/32 stages followed by the four extra block outputs.
    pub fn forward(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut x = self.conv1.forward(x);
        let mut features = Vec::with_capacity(self.feature_stages.len() + self.extra_blocks.len());

        for (index, stage) in self.stages.iter().enumerate() {
            x = stage.forward(x);
            if self.feature_stages.contains(&index) {
                features.push(x.clone());
            }
        }

        for block in &self.extra_blocks {
            x = block.forward(x);
            features.push(x.clone());
        }

        features
    }

    /// MobileNet v1 backbone returning the 1/8, 1/16 and 1/32 feature maps.
    ///
    /// # Arguments
    ///
    /// * `scale` - Width multiplier applied to every depthwise separable stage.
    /// * `device` - Device to create the module on.
    pub fn mobilenet_v1(scale: f64, device: &Device<B>) -> Self {
        MobileNetConfig::new()
            .with_conv_group_scale(scale)
            .init(device)
    }

    /// MobileNet v1 backbone with the four SSD extra blocks and their default channels.
    ///
    /// # Arguments
    ///
    /// * `scale` - Width multiplier applied to every depthwise separable stage.
    /// * `device` - Device to create the module on.
    pub fn mobilenet_v1_ssd(scale: f64, device: &Device<B>) -> Self {
        MobileNetConfig::new()
            .with_conv_group_scale(scale)
            .with_extra_blocks(true)
            .init(device)
    }

    /// Channel depth of each feature map returned by [forward](MobileNet::forward).
    pub fn out_channels(&self) -> Vec<usize> {
        self.feature_stages
            .iter()
            .map(|&index| self.stages[index].out_channels())
            .chain(self.extra_blocks.iter().map(ExtraBlock::out_channels))
            .collect()
    }

    /// Every conv-norm unit in build order.
    pub fn units(&self) -> Vec<&ConvNorm<B>> {
        iter::once(&self.conv1)
            .chain(self.stages.iter().flat_map(DepthwiseSeparable::units))
            .chain(self.extra_blocks.iter().flat_map(ExtraBlock::units))
            .collect()
    }

    /// Parameter names and ids, in the order of [param_specs](MobileNetConfig::param_specs).
    pub fn param_ids(&self) -> Vec<(String, ParamId)> {
        self.units()
            .into_iter()
            .flat_map(ConvNorm::param_ids)
            .collect()
    }

    /// Sum of the L2 regularization terms of all parameters.
    pub fn l2_penalty(&self) -> Tensor<B, 1> {
        self.units()
            .into_iter()
            .skip(1)
            .fold(self.conv1.l2_penalty(), |penalty, unit| {
                penalty + unit.l2_penalty()
            })
    }
}

impl<B: AutodiffBackend> MobileNet<B> {
    /// Scale convolution weight gradients by the configured learning rate multiplier.
    pub fn scale_gradients(&self, mut grads: GradientsParams) -> GradientsParams {
        for unit in self.units() {
            unit.scale_gradients(&mut grads);
        }
        grads
    }
}

/// [MobileNet](MobileNet) configuration.
#[derive(Config, Debug)]
pub struct MobileNetConfig {
    #[config(default = "NormType::Bn")]
    pub norm_type: NormType,

    /// Weight decay of the normalization (per-channel additive) parameters.
    #[config(default = "0.0")]
    pub norm_decay: f64,

    /// Weight decay of the convolution weights.
    #[config(default = "0.0")]
    pub conv_decay: f64,

    /// Width multiplier of the depthwise separable stages.
    #[config(default = "1.0")]
    pub conv_group_scale: f64,

    #[config(default = "1.0")]
    pub conv_learning_rate: f64,

    /// Append the four extra downsampling blocks.
    #[config(default = false)]
    pub extra_blocks: bool,

    /// `[num_filters1, num_filters2]` of each extra block.
    #[config(default = "vec![[256, 512], [128, 256], [128, 256], [64, 128]]")]
    pub extra_block_filters: Vec<[usize; 2]>,

    /// Prefix of every generated parameter name.
    #[config(default = "String::new()")]
    pub weight_prefix_name: String,
}

impl MobileNetConfig {
    pub fn validate(&self) -> crate::Result<()> {
        let scale = self.conv_group_scale;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(MobileNetError::InvalidScale { scale });
        }

        // The stem has the fewest channels of all scaled layers
        if scale_channels(STEM_CHANNELS, scale) == 0 {
            return Err(MobileNetError::ZeroChannels {
                layer: self.prefixed("conv1"),
                scale,
            });
        }

        if self.extra_blocks {
            let count = self.extra_block_filters.len();
            if count != EXTRA_BLOCKS {
                return Err(MobileNetError::ExtraBlockFilters {
                    reason: format!("expected {EXTRA_BLOCKS} [in, out] pairs, got {count}"),
                });
            }

            if let Some(index) = self
                .extra_block_filters
                .iter()
                .position(|filters| filters.contains(&0))
            {
                return Err(MobileNetError::ExtraBlockFilters {
                    reason: format!("block {} has a zero channel count", index + 1),
                });
            }
        }

        Ok(())
    }

    /// Channel depth of each feature map the backbone returns.
    pub fn out_channels(&self) -> Vec<usize> {
        self.plan(false).out_channels()
    }

    /// Every learnable parameter in build order.
    pub fn param_specs(&self) -> Vec<ParamSpec> {
        let plan = self.plan(false);

        plan.conv1
            .param_specs()
            .into_iter()
            .chain(plan.stages.iter().flat_map(|stage| stage.param_specs()))
            .chain(plan.extra_blocks.iter().flat_map(|block| block.param_specs()))
            .collect()
    }

    /// Initialize a new [MobileNet](MobileNet) module, checking the configuration first.
    pub fn try_init<B: Backend>(&self, device: &Device<B>) -> crate::Result<MobileNet<B>> {
        self.validate()?;
        self.warn_truncated();

        let fused_depthwise = mixed_precision_enabled();
        log::debug!(
            "building MobileNet: scale {}, {:?}, extra blocks {}, fused depthwise {}",
            self.conv_group_scale,
            self.norm_type,
            self.extra_blocks,
            fused_depthwise,
        );

        Ok(self.plan(fused_depthwise).init(device))
    }

    /// Initialize a new [MobileNet](MobileNet) module.
    ///
    /// # Panics
    ///
    /// If the configuration does not [validate](MobileNetConfig::validate).
    pub fn init<B: Backend>(&self, device: &Device<B>) -> MobileNet<B> {
        match self.try_init(device) {
            Ok(model) => model,
            Err(err) => panic!("invalid MobileNet configuration: {err}"),
        }
    }

    fn prefixed(&self, name: &str) -> String {
        format!("{}{}", self.weight_prefix_name, name)
    }

    fn warn_truncated(&self) {
        let scale = self.conv_group_scale;
        let counts = iter::once((self.prefixed("conv1"), STEM_CHANNELS)).chain(
            STAGES
                .iter()
                .map(|&(name, _, num_filters2, _, _)| (self.prefixed(name), num_filters2)),
        );

        for (name, channels) in counts {
            if is_truncated(channels, scale) {
                log::warn!(
                    "{name}: {channels} channels scaled by {scale} truncated to {}",
                    scale_channels(channels, scale)
                );
            }
        }
    }

    fn plan(&self, fused_depthwise: bool) -> MobileNetPlan {
        let scale = self.conv_group_scale;

        let conv1 = ConvNormConfig::new(self.prefixed("conv1"), 3, scale_channels(STEM_CHANNELS, scale))
            .with_kernel_size(3)
            .with_stride(2)
            .with_padding(1)
            .with_learning_rate(self.conv_learning_rate)
            .with_weight_decay(self.conv_decay)
            .with_bias_decay(self.norm_decay);

        let stages: Vec<_> = STAGES
            .iter()
            .map(|&(name, num_filters1, num_filters2, num_groups, stride)| {
                DepthwiseSeparableConfig::new(
                    self.prefixed(name),
                    num_filters1,
                    num_filters2,
                    num_groups,
                    stride,
                )
                .with_scale(scale)
                .with_fused_depthwise(fused_depthwise)
                .with_learning_rate(self.conv_learning_rate)
                .with_weight_decay(self.conv_decay)
                .with_bias_decay(self.norm_decay)
            })
            .collect();

        let captured: &[&str] = if self.extra_blocks {
            &EXTRA_FEATURE_STAGES
        } else {
            &FEATURE_STAGES
        };
        let feature_stages = STAGES
            .iter()
            .enumerate()
            .filter(|(_, (name, ..))| captured.contains(name))
            .map(|(index, _)| index)
            .collect();

        let extra_blocks = if self.extra_blocks {
            let last_channels = scale_channels(STAGES[STAGES.len() - 1].2, scale);
            let in_channels = iter::once(last_channels).chain(
                self.extra_block_filters
                    .iter()
                    .map(|&[_, num_filters2]| num_filters2),
            );

            izip!(1usize.., in_channels, &self.extra_block_filters)
                .map(|(index, in_channels, &[num_filters1, num_filters2])| {
                    ExtraBlockConfig::new(
                        self.prefixed(&format!("conv7_{index}")),
                        in_channels,
                        num_filters1,
                        num_filters2,
                    )
                    .with_learning_rate(self.conv_learning_rate)
                    .with_weight_decay(self.conv_decay)
                    .with_bias_decay(self.norm_decay)
                })
                .collect()
        } else {
            Vec::new()
        };

        MobileNetPlan {
            conv1,
            stages,
            extra_blocks,
            feature_stages,
        }
    }
}

/// Layer table of a [MobileNet](MobileNet), resolved from its configuration.
struct MobileNetPlan {
    conv1: ConvNormConfig,
    stages: Vec<DepthwiseSeparableConfig>,
    extra_blocks: Vec<ExtraBlockConfig>,
    feature_stages: Vec<usize>,
}

impl MobileNetPlan {
    fn out_channels(&self) -> Vec<usize> {
        self.feature_stages
            .iter()
            .map(|&index| self.stages[index].out_channels())
            .chain(self.extra_blocks.iter().map(|block| block.num_filters2))
            .collect()
    }

    fn init<B: Backend>(self, device: &Device<B>) -> MobileNet<B> {
        MobileNet {
            conv1: self.conv1.init(device),
            stages: self.stages.iter().map(|stage| stage.init(device)).collect(),
            extra_blocks: self
                .extra_blocks
                .iter()
                .map(|block| block.init(device))
                .collect(),
            feature_stages: Ignored(self.feature_stages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::conv_norm::Activation;
    use alloc::string::ToString;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn out_channels_follow_scale() {
        let config = MobileNetConfig::new();
        assert_eq!(config.out_channels(), vec![256, 512, 1024]);

        let config = config.with_conv_group_scale(0.5);
        assert_eq!(config.out_channels(), vec![128, 256, 512]);

        let config = config.with_conv_group_scale(0.3);
        assert_eq!(config.out_channels(), vec![76, 153, 307]);
    }

    #[test]
    fn extra_blocks_keep_unscaled_filters() {
        let config = MobileNetConfig::new()
            .with_conv_group_scale(0.5)
            .with_extra_blocks(true);

        assert_eq!(config.out_channels(), vec![256, 512, 512, 256, 256, 128]);
    }

    #[test]
    fn extra_blocks_chain_input_channels() {
        let plan = MobileNetConfig::new()
            .with_extra_blocks(true)
            .with_weight_prefix_name("mobilenet_".into())
            .plan(false);
        let in_channels: Vec<_> = plan
            .extra_blocks
            .iter()
            .map(|block| block.in_channels)
            .collect();
        let names: Vec<_> = plan.extra_blocks.iter().map(|block| block.name.as_str()).collect();

        assert_eq!(in_channels, vec![1024, 512, 256, 256]);
        assert_eq!(
            names,
            vec![
                "mobilenet_conv7_1",
                "mobilenet_conv7_2",
                "mobilenet_conv7_3",
                "mobilenet_conv7_4"
            ]
        );
    }

    #[test]
    fn backbone_units_use_relu() {
        let plan = MobileNetConfig::new().with_extra_blocks(true).plan(false);

        assert_eq!(plan.conv1.activation, Activation::Relu);
        for unit in plan.stages.iter().flat_map(|stage| stage.units()) {
            assert_eq!(unit.activation, Activation::Relu, "{}", unit.name);
        }
        for unit in plan.extra_blocks.iter().flat_map(|block| block.units()) {
            assert_eq!(unit.activation, Activation::Relu6, "{}", unit.name);
        }
    }

    #[test]
    fn config_reloads_from_json() {
        let config = MobileNetConfig::new()
            .with_norm_type(NormType::SyncBn)
            .with_conv_group_scale(0.75)
            .with_extra_blocks(true)
            .with_weight_prefix_name("mbv1_".into());

        let reloaded = MobileNetConfig::load_binary(config.to_string().as_bytes()).unwrap();

        assert_eq!(reloaded.norm_type, NormType::SyncBn);
        assert_eq!(reloaded.extra_block_filters, config.extra_block_filters);
        assert_eq!(reloaded.param_specs(), config.param_specs());
    }

    #[test]
    fn captured_stages_depend_on_extra_blocks() {
        let plan = MobileNetConfig::new().plan(false);
        assert_eq!(plan.feature_stages, vec![3, 5, 12]);

        let plan = MobileNetConfig::new().with_extra_blocks(true).plan(false);
        assert_eq!(plan.feature_stages, vec![10, 12]);
    }

    #[test]
    fn rejects_invalid_scale() {
        for scale in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = MobileNetConfig::new()
                .with_conv_group_scale(scale)
                .validate()
                .unwrap_err();
            assert!(matches!(err, MobileNetError::InvalidScale { .. }));
        }

        let err = MobileNetConfig::new()
            .with_conv_group_scale(0.02)
            .validate()
            .unwrap_err();
        assert!(matches!(err, MobileNetError::ZeroChannels { .. }));
    }

    #[test]
    fn rejects_mismatched_extra_block_filters() {
        let config = MobileNetConfig::new()
            .with_extra_blocks(true)
            .with_extra_block_filters(vec![[256, 512], [128, 256]]);
        assert!(matches!(
            config.validate(),
            Err(MobileNetError::ExtraBlockFilters { .. })
        ));

        let config = config.with_extra_block_filters(vec![[256, 512], [128, 0], [128, 256], [64, 128]]);
        assert!(matches!(
            config.validate(),
            Err(MobileNetError::ExtraBlockFilters { .. })
        ));

        // Ignored without extra blocks
        assert!(config.with_extra_blocks(false).validate().is_ok());
    }

    #[test]
    #[should_panic(expected = "invalid MobileNet configuration")]
    fn init_panics_on_invalid_config() {
        let device = Default::default();
        let _ = MobileNetConfig::new()
            .with_conv_group_scale(0.0)
            .init::<B>(&device);
    }

    #[test]
    fn penalty_scales_with_decay() {
        let device = Default::default();
        let model = MobileNetConfig::new()
            .with_conv_group_scale(0.25)
            .with_conv_decay(1e-3)
            .init::<B>(&device);

        let expected: f32 = model
            .units()
            .into_iter()
            .map(|unit| unit.l2_penalty().into_scalar())
            .sum();
        let total = model.l2_penalty().into_scalar();

        assert!(total > 0.0);
        assert!((total - expected).abs() <= 1e-4 * expected);
    }
}
