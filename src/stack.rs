//! Encoder and decoder stacks joined by an explicit skip stack.

use candle_core::{bail, Result};
use candle_nn::VarBuilder;
use tracing::debug;

use crate::complex::{
    complex_conv2d, complex_conv_transpose2d, ComplexBatchNorm2d, ComplexConv2d,
    ComplexConvTranspose2d, ComplexTensor, ConvGeometry,
};
use crate::model::{debug_tensors_enabled, log_tensor_stats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Strided complex convolution.
    Down,
    /// Skip concatenation followed by a complex transposed convolution.
    Up,
}

/// Descriptor of one encoder or decoder stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub kind: StageKind,
    pub index: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub geometry: ConvGeometry,
    pub normalized: bool,
    pub activated: bool,
}

/// Last-in, first-out buffer of encoder outputs.
#[derive(Debug, Default)]
pub struct SkipStack {
    entries: Vec<ComplexTensor>,
}

impl SkipStack {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, x: ComplexTensor) {
        self.entries.push(x);
    }

    pub fn pop(&mut self) -> Option<ComplexTensor> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
struct EncoderStage {
    spec: StageSpec,
    conv: ComplexConv2d,
    norm: Option<ComplexBatchNorm2d>,
}

#[derive(Debug, Clone)]
pub struct Encoder {
    stages: Vec<EncoderStage>,
}

impl Encoder {
    /// Parameters live under `encoder_layers.{i}` and `encoder_bns.{i}`.
    pub fn new(specs: &[StageSpec], vb: VarBuilder) -> Result<Self> {
        let mut stages = Vec::with_capacity(specs.len());
        for spec in specs {
            if spec.kind != StageKind::Down {
                bail!("encoder stage {} is not a down stage", spec.index);
            }
            let conv = complex_conv2d(
                spec.in_channels,
                spec.out_channels,
                spec.geometry,
                vb.pp("encoder_layers").pp(spec.index),
            )?;
            let norm = if spec.normalized {
                Some(ComplexBatchNorm2d::new(
                    spec.out_channels,
                    vb.pp("encoder_bns").pp(spec.index),
                )?)
            } else {
                None
            };
            stages.push(EncoderStage {
                spec: *spec,
                conv,
                norm,
            });
        }
        Ok(Self { stages })
    }

    pub fn depth(&self) -> usize {
        self.stages.len()
    }

    /// Returns the deepest map and one skip entry per stage.
    pub fn forward(&self, x: &ComplexTensor) -> Result<(ComplexTensor, SkipStack)> {
        let mut skips = SkipStack::with_capacity(self.stages.len());
        let mut x = x.clone();
        for stage in &self.stages {
            x = stage.conv.forward(&x)?;
            if let Some(norm) = &stage.norm {
                x = norm.forward(&x)?;
            }
            if stage.spec.activated {
                x = x.elu(1.0)?;
            }
            debug!(stage = stage.spec.index, dims = ?x.dims(), "encoder stage");
            if debug_tensors_enabled() {
                log_tensor_stats(&format!("encoder.{}", stage.spec.index), x.re())?;
            }
            skips.push(x.clone());
        }
        Ok((x, skips))
    }
}

#[derive(Debug, Clone)]
struct DecoderStage {
    spec: StageSpec,
    conv: ComplexConvTranspose2d,
    norm: Option<ComplexBatchNorm2d>,
}

#[derive(Debug, Clone)]
pub struct Decoder {
    stages: Vec<DecoderStage>,
}

impl Decoder {
    /// Parameters live under `decoder_layers.{i}` and `decoder_bns.{i}`.
    pub fn new(specs: &[StageSpec], vb: VarBuilder) -> Result<Self> {
        let mut stages = Vec::with_capacity(specs.len());
        for spec in specs {
            if spec.kind != StageKind::Up {
                bail!("decoder stage {} is not an up stage", spec.index);
            }
            let conv = complex_conv_transpose2d(
                spec.in_channels,
                spec.out_channels,
                spec.geometry,
                vb.pp("decoder_layers").pp(spec.index),
            )?;
            let norm = if spec.normalized {
                Some(ComplexBatchNorm2d::new(
                    spec.out_channels,
                    vb.pp("decoder_bns").pp(spec.index),
                )?)
            } else {
                None
            };
            stages.push(DecoderStage {
                spec: *spec,
                conv,
                norm,
            });
        }
        Ok(Self { stages })
    }

    pub fn depth(&self) -> usize {
        self.stages.len()
    }

    /// Consumes exactly one skip entry per stage. The stack must be empty
    /// afterwards.
    pub fn forward(&self, x: ComplexTensor, skips: &mut SkipStack) -> Result<ComplexTensor> {
        let mut x = x;
        for stage in &self.stages {
            let skip = match skips.pop() {
                Some(skip) => skip,
                None => bail!("skip stack exhausted at decoder stage {}", stage.spec.index),
            };
            let (freq, time) = skip.spatial()?;
            if x.spatial()? != (freq, time) {
                x = x.resize_nearest(freq, time)?;
            }
            x = x.cat_channels(&skip)?;
            x = stage.conv.forward(&x)?;
            if let Some(norm) = &stage.norm {
                x = norm.forward(&x)?;
            }
            if stage.spec.activated {
                x = x.elu(1.0)?;
            }
            debug!(stage = stage.spec.index, dims = ?x.dims(), "decoder stage");
            if debug_tensors_enabled() {
                log_tensor_stats(&format!("decoder.{}", stage.spec.index), x.re())?;
            }
        }
        if !skips.is_empty() {
            bail!("{} skip entries left after decoding", skips.len());
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarMap;

    fn geometry(output_padding: (usize, usize)) -> ConvGeometry {
        ConvGeometry {
            kernel: (5, 2),
            stride: (2, 1),
            padding: (2, 0),
            output_padding,
        }
    }

    fn specs() -> (Vec<StageSpec>, Vec<StageSpec>) {
        let encoder = vec![
            StageSpec {
                kind: StageKind::Down,
                index: 0,
                in_channels: 1,
                out_channels: 4,
                geometry: geometry((0, 0)),
                normalized: true,
                activated: true,
            },
            StageSpec {
                kind: StageKind::Down,
                index: 1,
                in_channels: 4,
                out_channels: 8,
                geometry: geometry((0, 0)),
                normalized: true,
                activated: true,
            },
        ];
        let decoder = vec![
            StageSpec {
                kind: StageKind::Up,
                index: 0,
                in_channels: 16,
                out_channels: 4,
                geometry: geometry((1, 0)),
                normalized: true,
                activated: true,
            },
            StageSpec {
                kind: StageKind::Up,
                index: 1,
                in_channels: 8,
                out_channels: 1,
                geometry: geometry((1, 0)),
                normalized: false,
                activated: false,
            },
        ];
        (encoder, decoder)
    }

    fn input(freq: usize, time: usize) -> ComplexTensor {
        let re = Tensor::randn(0f32, 1., (1, 1, freq, time), &Device::Cpu).unwrap();
        let im = Tensor::randn(0f32, 1., (1, 1, freq, time), &Device::Cpu).unwrap();
        ComplexTensor::new(re, im).unwrap()
    }

    #[test]
    fn test_skip_stack_is_lifo() {
        let mut stack = SkipStack::default();
        stack.push(input(3, 2));
        stack.push(input(5, 2));
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop().unwrap().spatial().unwrap(), (5, 2));
        assert_eq!(stack.pop().unwrap().spatial().unwrap(), (3, 2));
        assert!(stack.pop().is_none());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_encoder_decoder_round_trip_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let (enc_specs, dec_specs) = specs();
        let encoder = Encoder::new(&enc_specs, vb.clone()).unwrap();
        let decoder = Decoder::new(&dec_specs, vb).unwrap();

        let (deepest, mut skips) = encoder.forward(&input(17, 6)).unwrap();
        assert_eq!(skips.len(), 2);
        assert_eq!(deepest.dims(), &[1, 8, 5, 4]);

        let out = decoder.forward(deepest, &mut skips).unwrap();
        assert!(skips.is_empty());
        // frequency 5 -> 10, resampled to the 9-bin skip, then 18; time 4 -> 5 -> 6
        assert_eq!(out.dims(), &[1, 1, 18, 6]);
    }

    #[test]
    fn test_decoder_resamples_to_skip_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let (enc_specs, dec_specs) = specs();
        let encoder = Encoder::new(&enc_specs, vb.clone()).unwrap();
        let decoder = Decoder::new(&dec_specs, vb).unwrap();

        let (deepest, mut skips) = encoder.forward(&input(17, 6)).unwrap();
        let shrunk = deepest.resize_nearest(2, 3).unwrap();
        let out = decoder.forward(shrunk, &mut skips).unwrap();
        assert_eq!(out.dims(), &[1, 1, 18, 6]);
    }

    #[test]
    fn test_decoder_rejects_unbalanced_skips() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let (enc_specs, dec_specs) = specs();
        let encoder = Encoder::new(&enc_specs, vb.clone()).unwrap();
        let decoder = Decoder::new(&dec_specs, vb).unwrap();

        let (deepest, mut skips) = encoder.forward(&input(17, 6)).unwrap();
        skips.pop();
        assert!(decoder.forward(deepest.clone(), &mut skips).is_err());

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let shallow = Decoder::new(&dec_specs[..1], vb).unwrap();
        let (deepest, mut skips) = encoder.forward(&input(17, 6)).unwrap();
        assert!(shallow.forward(deepest, &mut skips).is_err());
    }

    #[test]
    fn test_parameter_names_follow_module_tree() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let (enc_specs, dec_specs) = specs();
        Encoder::new(&enc_specs, vb.clone()).unwrap();
        Decoder::new(&dec_specs, vb).unwrap();
        let data = varmap.data().lock().unwrap();
        for name in [
            "encoder_layers.0.conv_real.weight",
            "encoder_layers.1.conv_imag.bias",
            "encoder_bns.1.bn_imag.running_var",
            "decoder_layers.1.conv_real.weight",
            "decoder_bns.0.bn_real.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert!(!data.contains_key("decoder_bns.1.bn_real.weight"));
        assert_eq!(data["decoder_layers.0.conv_real.weight"].dims(), &[16, 4, 5, 2]);
    }
}
