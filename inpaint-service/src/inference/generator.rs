//! U-Net generator used for inpainting.
//!
//! Four encoder stages (double conv + 2x max-pool), a bottleneck at 16x the
//! base width, and four decoder stages (2x transposed conv, concat with the
//! matching encoder activation, double conv), followed by a 1x1 projection
//! and `tanh`. Parameter names follow the PyTorch module tree of the trained
//! checkpoint (`down1.net.0.weight`, `up4.bias`, `final.weight`, ...).

use candle_core::{bail, Device, Module, ModuleT, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d, conv_transpose2d, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig,
    ConvTranspose2d, ConvTranspose2dConfig, VarBuilder,
};

/// Number of 2x downsampling stages; inputs must be divisible by `2^DEPTH`.
pub const DEPTH: usize = 4;

/// Anything that maps a `[B, 4, H, W]` network input in `[-1, 1]` to a
/// `[B, 3, H, W]` prediction in `[-1, 1]`.
pub trait InpaintModel: Send + Sync {
    fn predict(&self, input: &Tensor) -> Result<Tensor>;

    /// Device that inputs must live on.
    fn device(&self) -> &Device;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Masked RGB plus the single-channel mask.
    pub in_channels: usize,
    pub out_channels: usize,
    pub base_channels: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            in_channels: 4,
            out_channels: 3,
            base_channels: 64,
        }
    }
}

/// (conv 3x3 -> batch norm -> relu) twice. Weights live under `net.{0,1,3,4}`.
#[derive(Debug, Clone)]
pub struct DoubleConv {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
}

impl DoubleConv {
    pub fn new(in_ch: usize, out_ch: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let vb = vb.pp("net");
        let conv1 = conv2d(in_ch, out_ch, 3, cfg, vb.pp("0"))?;
        let bn1 = batch_norm(out_ch, BatchNormConfig::default(), vb.pp("1"))?;
        let conv2 = conv2d(out_ch, out_ch, 3, cfg, vb.pp("3"))?;
        let bn2 = batch_norm(out_ch, BatchNormConfig::default(), vb.pp("4"))?;
        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
        })
    }

    /// Normalization always uses the stored running statistics.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv1.forward(x)?;
        let x = self.bn1.forward_t(&x, false)?.relu()?;
        let x = self.conv2.forward(&x)?;
        self.bn2.forward_t(&x, false)?.relu()
    }
}

/// Decoder stage: upsample, concatenate the encoder skip, double conv.
#[derive(Debug, Clone)]
struct UpStage {
    up: ConvTranspose2d,
    conv: DoubleConv,
}

impl UpStage {
    fn new(in_ch: usize, out_ch: usize, vb: &VarBuilder, index: usize) -> Result<Self> {
        let up = conv_transpose2d(
            in_ch,
            out_ch,
            2,
            ConvTranspose2dConfig {
                stride: 2,
                ..Default::default()
            },
            vb.pp(format!("up{index}")),
        )?;
        let conv = DoubleConv::new(out_ch * 2, out_ch, vb.pp(format!("conv{index}")))?;
        Ok(Self { up, conv })
    }

    fn forward(&self, x: &Tensor, skip: &Tensor) -> Result<Tensor> {
        let x = self.up.forward(x)?;
        let x = Tensor::cat(&[&x, skip], 1)?;
        self.conv.forward(&x)
    }
}

#[derive(Debug, Clone)]
pub struct Generator {
    config: GeneratorConfig,
    down: [DoubleConv; DEPTH],
    bottleneck: DoubleConv,
    /// Ordered deepest first: up4, up3, up2, up1.
    up: [UpStage; DEPTH],
    final_conv: Conv2d,
    device: Device,
}

impl Generator {
    pub fn new(config: GeneratorConfig, vb: VarBuilder) -> Result<Self> {
        let c1 = config.base_channels;
        let (c2, c3, c4, c5) = (c1 * 2, c1 * 4, c1 * 8, c1 * 16);

        let down = [
            DoubleConv::new(config.in_channels, c1, vb.pp("down1"))?,
            DoubleConv::new(c1, c2, vb.pp("down2"))?,
            DoubleConv::new(c2, c3, vb.pp("down3"))?,
            DoubleConv::new(c3, c4, vb.pp("down4"))?,
        ];
        let bottleneck = DoubleConv::new(c4, c5, vb.pp("bottleneck"))?;
        let up = [
            UpStage::new(c5, c4, &vb, 4)?,
            UpStage::new(c4, c3, &vb, 3)?,
            UpStage::new(c3, c2, &vb, 2)?,
            UpStage::new(c2, c1, &vb, 1)?,
        ];
        let final_conv = conv2d(
            c1,
            config.out_channels,
            1,
            Conv2dConfig::default(),
            vb.pp("final"),
        )?;

        Ok(Self {
            config,
            down,
            bottleneck,
            up,
            final_conv,
            device: vb.device().clone(),
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, channels, height, width) = x.dims4()?;
        if channels != self.config.in_channels {
            bail!(
                "generator expects {} input channels, got {}",
                self.config.in_channels,
                channels
            );
        }
        let stride = 1 << DEPTH;
        if height % stride != 0 || width % stride != 0 {
            bail!("generator input {height}x{width} is not divisible by {stride}");
        }

        let mut skips = Vec::with_capacity(DEPTH);
        let mut x = x.clone();
        for stage in &self.down {
            let activation = stage.forward(&x)?;
            x = activation.max_pool2d(2)?;
            skips.push(activation);
        }

        let mut x = self.bottleneck.forward(&x)?;
        for (stage, skip) in self.up.iter().zip(skips.iter().rev()) {
            x = stage.forward(&x, skip)?;
        }

        self.final_conv.forward(&x)?.tanh()
    }
}

impl InpaintModel for Generator {
    fn predict(&self, input: &Tensor) -> Result<Tensor> {
        self.forward(input)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn tiny(varmap: &VarMap) -> Generator {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let config = GeneratorConfig {
            base_channels: 2,
            ..Default::default()
        };
        Generator::new(config, vb).unwrap()
    }

    #[test]
    fn output_matches_input_resolution_with_three_channels() {
        let varmap = VarMap::new();
        let generator = tiny(&varmap);
        let input = Tensor::randn(0f32, 1f32, (2, 4, 32, 48), &Device::Cpu).unwrap();

        let output = generator.forward(&input).unwrap();

        assert_eq!(output.dims(), &[2, 3, 32, 48]);
    }

    #[test]
    fn output_is_bounded_by_tanh() {
        let varmap = VarMap::new();
        let generator = tiny(&varmap);
        let input = Tensor::randn(0f32, 10f32, (1, 4, 32, 32), &Device::Cpu).unwrap();

        let values = generator
            .forward(&input)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn forward_is_deterministic() {
        let varmap = VarMap::new();
        let generator = tiny(&varmap);
        let input = Tensor::randn(0f32, 1f32, (1, 4, 16, 16), &Device::Cpu).unwrap();

        let a = generator.forward(&input).unwrap().flatten_all().unwrap();
        let b = generator.forward(&input).unwrap().flatten_all().unwrap();

        assert_eq!(a.to_vec1::<f32>().unwrap(), b.to_vec1::<f32>().unwrap());
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let varmap = VarMap::new();
        let generator = tiny(&varmap);
        let input = Tensor::zeros((1, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();

        assert!(generator.forward(&input).is_err());
    }

    #[test]
    fn rejects_size_not_divisible_by_sixteen() {
        let varmap = VarMap::new();
        let generator = tiny(&varmap);
        let input = Tensor::zeros((1, 4, 40, 32), DType::F32, &Device::Cpu).unwrap();

        assert!(generator.forward(&input).is_err());
    }

    #[test]
    fn parameter_names_follow_checkpoint_layout() {
        let varmap = VarMap::new();
        let _generator = tiny(&varmap);
        let data = varmap.data().lock().unwrap();

        for name in [
            "down1.net.0.weight",
            "down1.net.1.running_mean",
            "down4.net.4.running_var",
            "bottleneck.net.3.bias",
            "up4.weight",
            "up1.bias",
            "conv4.net.0.weight",
            "conv1.net.4.weight",
            "final.weight",
            "final.bias",
        ] {
            assert!(data.contains_key(name), "missing parameter {name}");
        }

        // ConvTranspose2d stores (in, out, k, k): 16*2 -> 8*2.
        assert_eq!(data["up4.weight"].as_tensor().dims(), &[32, 16, 2, 2]);
        // Decoder conv sees upsampled + skip channels.
        assert_eq!(data["conv4.net.0.weight"].as_tensor().dims(), &[16, 32, 3, 3]);
    }
}
