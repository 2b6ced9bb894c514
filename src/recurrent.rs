//! Recurrent bottleneck: PyTorch-compatible LSTM stacks and the complex LSTM.
//!
//! The bottleneck sees the deepest encoder map flattened to a
//! `[batch, time, channels * frequency]` sequence and hands back a feature map
//! broadcast across the deepest frequency size.

use candle_core::{bail, Device, Result, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::complex::{product_rule, ComplexTensor};

/// Hidden and cell state of one LSTM direction, each `[batch, hidden]`.
#[derive(Debug, Clone)]
pub struct LstmState {
    pub h: Tensor,
    pub c: Tensor,
}

impl LstmState {
    pub fn zeros(batch: usize, hidden: usize, device: &Device) -> Result<Self> {
        let h = Tensor::zeros((batch, hidden), candle_core::DType::F32, device)?;
        Ok(Self { c: h.clone(), h })
    }

    fn matches(&self, batch: usize, hidden: usize) -> bool {
        self.h.dims() == [batch, hidden] && self.c.dims() == [batch, hidden]
    }
}

/// One direction of one LSTM layer.
#[derive(Debug, Clone)]
pub struct LstmCell {
    weight_ih_t: Tensor,
    weight_hh_t: Tensor,
    bias: Tensor,
    hidden_size: usize,
}

impl LstmCell {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        layer: usize,
        reverse: bool,
        vb: &VarBuilder,
    ) -> Result<Self> {
        let suffix = if reverse { "_reverse" } else { "" };
        let bound = 1. / (hidden_size as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let gates = 4 * hidden_size;
        let weight_ih =
            vb.get_with_hints((gates, input_size), &format!("weight_ih_l{layer}{suffix}"), init)?;
        let weight_hh =
            vb.get_with_hints((gates, hidden_size), &format!("weight_hh_l{layer}{suffix}"), init)?;
        let bias_ih = vb.get_with_hints(gates, &format!("bias_ih_l{layer}{suffix}"), init)?;
        let bias_hh = vb.get_with_hints(gates, &format!("bias_hh_l{layer}{suffix}"), init)?;
        Ok(Self {
            weight_ih_t: weight_ih.t()?.contiguous()?,
            weight_hh_t: weight_hh.t()?.contiguous()?,
            bias: bias_ih.add(&bias_hh)?,
            hidden_size,
        })
    }

    /// Run over a `[batch, time, input]` sequence, walking time backwards when
    /// `reverse` is set. Outputs stay in input time order.
    fn run(&self, x: &Tensor, init: &LstmState, reverse: bool) -> Result<(Tensor, LstmState)> {
        let (_, steps, _) = x.dims3()?;
        if steps == 0 {
            bail!("LSTM input has no time steps");
        }
        let hs = self.hidden_size;
        let projected = x
            .broadcast_matmul(&self.weight_ih_t)?
            .broadcast_add(&self.bias)?;

        let order: Vec<usize> = if reverse {
            (0..steps).rev().collect()
        } else {
            (0..steps).collect()
        };
        let mut h = init.h.clone();
        let mut c = init.c.clone();
        let mut outputs = Vec::with_capacity(steps);
        for t in order {
            let gates = projected
                .narrow(1, t, 1)?
                .squeeze(1)?
                .add(&h.matmul(&self.weight_hh_t)?)?;
            let i = candle_nn::ops::sigmoid(&gates.narrow(1, 0, hs)?)?;
            let f = candle_nn::ops::sigmoid(&gates.narrow(1, hs, hs)?)?;
            let g = gates.narrow(1, 2 * hs, hs)?.tanh()?;
            let o = candle_nn::ops::sigmoid(&gates.narrow(1, 3 * hs, hs)?)?;
            c = f.mul(&c)?.add(&i.mul(&g)?)?;
            h = o.mul(&c.tanh()?)?;
            outputs.push(h.clone());
        }
        if reverse {
            outputs.reverse();
        }
        Ok((Tensor::stack(&outputs, 1)?, LstmState { h, c }))
    }
}

#[derive(Debug, Clone)]
struct LstmLayer {
    forward: LstmCell,
    backward: Option<LstmCell>,
}

/// States of a whole LSTM stack, layer-major with the forward direction first.
#[derive(Debug, Clone)]
pub struct LstmStackState {
    pub cells: Vec<LstmState>,
}

impl LstmStackState {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Final hidden states stacked as `[layers * directions, batch, hidden]`.
    pub fn h_n(&self) -> Result<Tensor> {
        let hs: Vec<&Tensor> = self.cells.iter().map(|s| &s.h).collect();
        Tensor::stack(&hs, 0)
    }
}

/// Multi-layer, optionally bidirectional LSTM with batch-first sequences.
#[derive(Debug, Clone)]
pub struct Lstm {
    layers: Vec<LstmLayer>,
    hidden_size: usize,
    bidirectional: bool,
}

impl Lstm {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        bidirectional: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let directions = if bidirectional { 2 } else { 1 };
        let mut layers = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            let layer_input = if layer == 0 {
                input_size
            } else {
                hidden_size * directions
            };
            let forward = LstmCell::new(layer_input, hidden_size, layer, false, &vb)?;
            let backward = if bidirectional {
                Some(LstmCell::new(layer_input, hidden_size, layer, true, &vb)?)
            } else {
                None
            };
            layers.push(LstmLayer { forward, backward });
        }
        Ok(Self {
            layers,
            hidden_size,
            bidirectional,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn num_directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Width of each output time step.
    pub fn output_size(&self) -> usize {
        self.hidden_size * self.num_directions()
    }

    pub fn zero_state(&self, batch: usize, device: &Device) -> Result<LstmStackState> {
        let cells = (0..self.num_layers() * self.num_directions())
            .map(|_| LstmState::zeros(batch, self.hidden_size, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(LstmStackState { cells })
    }

    /// True when `state` has one correctly shaped entry per layer and direction.
    pub fn accepts(&self, state: &LstmStackState, batch: usize) -> bool {
        state.len() == self.num_layers() * self.num_directions()
            && state
                .cells
                .iter()
                .all(|s| s.matches(batch, self.hidden_size))
    }

    /// `x` is `[batch, time, input]`; returns `[batch, time, output_size]`.
    #[tracing::instrument(name = "lstm_forward", skip_all)]
    pub fn forward(
        &self,
        x: &Tensor,
        state: Option<&LstmStackState>,
    ) -> Result<(Tensor, LstmStackState)> {
        let (batch, _, _) = x.dims3()?;
        let init = match state {
            Some(s) if self.accepts(s, batch) => s.clone(),
            Some(s) => bail!(
                "LSTM state has {} cells, expected {} for batch {}",
                s.len(),
                self.num_layers() * self.num_directions(),
                batch
            ),
            None => self.zero_state(batch, x.device())?,
        };

        let directions = self.num_directions();
        let mut cells = Vec::with_capacity(init.len());
        let mut input = x.clone();
        for (idx, layer) in self.layers.iter().enumerate() {
            let (fwd_out, fwd_state) = layer
                .forward
                .run(&input, &init.cells[idx * directions], false)?;
            cells.push(fwd_state);
            input = match &layer.backward {
                Some(backward) => {
                    let (bwd_out, bwd_state) =
                        backward.run(&input, &init.cells[idx * directions + 1], true)?;
                    cells.push(bwd_state);
                    Tensor::cat(&[&fwd_out, &bwd_out], 2)?
                }
                None => fwd_out,
            };
        }
        Ok((input, LstmStackState { cells }))
    }
}

/// Complex LSTM built from two real LSTM stacks, `lstm_real` (A) and
/// `lstm_imag` (B).
#[derive(Debug, Clone)]
pub struct ComplexLstm {
    cell_a: Lstm,
    cell_b: Lstm,
}

/// Stack states per cell and per input stream.
#[derive(Debug, Clone)]
pub struct ComplexLstmState {
    pub a_real: LstmStackState,
    pub a_imag: LstmStackState,
    pub b_real: LstmStackState,
    pub b_imag: LstmStackState,
}

impl ComplexLstm {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        bidirectional: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            cell_a: Lstm::new(
                input_size,
                hidden_size,
                num_layers,
                bidirectional,
                vb.pp("lstm_real"),
            )?,
            cell_b: Lstm::new(
                input_size,
                hidden_size,
                num_layers,
                bidirectional,
                vb.pp("lstm_imag"),
            )?,
        })
    }

    pub fn output_size(&self) -> usize {
        self.cell_a.output_size()
    }

    pub fn accepts(&self, state: &ComplexLstmState, batch: usize) -> bool {
        self.cell_a.accepts(&state.a_real, batch)
            && self.cell_a.accepts(&state.a_imag, batch)
            && self.cell_b.accepts(&state.b_real, batch)
            && self.cell_b.accepts(&state.b_imag, batch)
    }

    pub fn zero_state(&self, batch: usize, device: &Device) -> Result<ComplexLstmState> {
        Ok(ComplexLstmState {
            a_real: self.cell_a.zero_state(batch, device)?,
            a_imag: self.cell_a.zero_state(batch, device)?,
            b_real: self.cell_b.zero_state(batch, device)?,
            b_imag: self.cell_b.zero_state(batch, device)?,
        })
    }

    /// Both inputs are `[batch, time, input]`.
    #[tracing::instrument(name = "complex_lstm_forward", skip_all)]
    pub fn forward(
        &self,
        x: &ComplexTensor,
        state: Option<&ComplexLstmState>,
    ) -> Result<(ComplexTensor, ComplexLstmState)> {
        let (ar, a_real) = self.cell_a.forward(x.re(), state.map(|s| &s.a_real))?;
        let (ai, a_imag) = self.cell_a.forward(x.im(), state.map(|s| &s.a_imag))?;
        let (br, b_real) = self.cell_b.forward(x.re(), state.map(|s| &s.b_real))?;
        let (bi, b_imag) = self.cell_b.forward(x.im(), state.map(|s| &s.b_imag))?;
        let out = product_rule(&ar, &bi, &ai, &br)?;
        Ok((
            out,
            ComplexLstmState {
                a_real,
                a_imag,
                b_real,
                b_imag,
            },
        ))
    }
}

/// The two recurrent formulations, fixed at construction.
#[derive(Debug, Clone)]
pub enum Bottleneck {
    Complex(ComplexLstm),
    /// One LSTM over `[real; imag]`, output split in half afterwards.
    Real(Lstm),
}

/// Recurrent state passed into and returned from a forward pass.
#[derive(Debug, Clone)]
pub enum BottleneckState {
    Complex(ComplexLstmState),
    Real(LstmStackState),
}

impl Bottleneck {
    /// `input_size` is the width of the LSTM input: `channels * frequency` per
    /// stream for the complex variant, twice that for the real one.
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        complex: bool,
        bidirectional: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        if complex {
            Ok(Self::Complex(ComplexLstm::new(
                input_size,
                hidden_size,
                num_layers,
                bidirectional,
                vb,
            )?))
        } else {
            let lstm = Lstm::new(input_size, hidden_size, num_layers, bidirectional, vb)?;
            if lstm.output_size() % 2 != 0 {
                bail!(
                    "real recurrent output width {} cannot be split into two branches",
                    lstm.output_size()
                );
            }
            Ok(Self::Real(lstm))
        }
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, Self::Complex(_))
    }

    /// Width of the raw recurrent output per time step.
    pub fn output_width(&self) -> usize {
        match self {
            Self::Complex(lstm) => lstm.output_size(),
            Self::Real(lstm) => lstm.output_size(),
        }
    }

    /// Channel count of each stream handed to the channel projection.
    pub fn stream_width(&self) -> usize {
        match self {
            Self::Complex(lstm) => lstm.output_size(),
            Self::Real(lstm) => lstm.output_size() / 2,
        }
    }

    pub fn accepts(&self, state: &BottleneckState, batch: usize) -> bool {
        match (self, state) {
            (Self::Complex(lstm), BottleneckState::Complex(s)) => lstm.accepts(s, batch),
            (Self::Real(lstm), BottleneckState::Real(s)) => lstm.accepts(s, batch),
            _ => false,
        }
    }

    pub fn zero_state(&self, batch: usize, device: &Device) -> Result<BottleneckState> {
        Ok(match self {
            Self::Complex(lstm) => BottleneckState::Complex(lstm.zero_state(batch, device)?),
            Self::Real(lstm) => BottleneckState::Real(lstm.zero_state(batch, device)?),
        })
    }

    /// Flatten `[B, C, F, T]` to a sequence, run the recurrence, and broadcast
    /// the result back to `[B, stream_width, F, T]`.
    pub fn forward(
        &self,
        x: &ComplexTensor,
        state: Option<&BottleneckState>,
    ) -> Result<(ComplexTensor, BottleneckState)> {
        let (_, _, freq, _) = x.dims4()?;
        match self {
            Self::Complex(lstm) => {
                let state = match state {
                    Some(BottleneckState::Complex(s)) => Some(s),
                    Some(BottleneckState::Real(_)) => {
                        bail!("real recurrent state passed to the complex bottleneck")
                    }
                    None => None,
                };
                let seq = x.map(to_sequence)?;
                let (out, next) = lstm.forward(&seq, state)?;
                let out = out.map(|t| to_feature_map(t, freq))?;
                Ok((out, BottleneckState::Complex(next)))
            }
            Self::Real(lstm) => {
                let state = match state {
                    Some(BottleneckState::Real(s)) => Some(s),
                    Some(BottleneckState::Complex(_)) => {
                        bail!("complex recurrent state passed to the real bottleneck")
                    }
                    None => None,
                };
                let joined = Tensor::cat(&[x.re(), x.im()], 1)?;
                let (out, next) = lstm.forward(&to_sequence(&joined)?, state)?;
                let map = to_feature_map(&out, freq)?;
                let half = map.dim(1)? / 2;
                let out = ComplexTensor::new(map.narrow(1, 0, half)?, map.narrow(1, half, half)?)?;
                Ok((out, BottleneckState::Real(next)))
            }
        }
    }
}

/// `[B, C, F, T]` to `[B, T, C*F]`, channel as the outer index.
fn to_sequence(x: &Tensor) -> Result<Tensor> {
    let (b, c, f, t) = x.dims4()?;
    x.permute((0, 3, 1, 2))?.reshape((b, t, c * f))
}

/// `[B, T, H]` to `[B, H, F, T]`, repeating each time step over frequency.
fn to_feature_map(seq: &Tensor, freq: usize) -> Result<Tensor> {
    let (b, t, h) = seq.dims3()?;
    seq.transpose(1, 2)?
        .unsqueeze(2)?
        .broadcast_as((b, h, freq, t))?
        .contiguous()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        a.sub(b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_lstm_output_and_state_shapes() {
        let varmap = VarMap::new();
        let lstm = Lstm::new(6, 4, 2, true, vb(&varmap)).unwrap();
        let x = Tensor::randn(0f32, 1., (3, 7, 6), &Device::Cpu).unwrap();
        let (out, state) = lstm.forward(&x, None).unwrap();
        assert_eq!(out.dims(), &[3, 7, 8]);
        assert_eq!(state.len(), 4);
        assert_eq!(state.h_n().unwrap().dims(), &[4, 3, 4]);
    }

    #[test]
    fn test_lstm_parameter_names() {
        let varmap = VarMap::new();
        Lstm::new(6, 4, 2, true, vb(&varmap).pp("lstm")).unwrap();
        let data = varmap.data().lock().unwrap();
        for name in [
            "lstm.weight_ih_l0",
            "lstm.weight_hh_l0_reverse",
            "lstm.bias_ih_l1",
            "lstm.bias_hh_l1_reverse",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert_eq!(data["lstm.weight_ih_l1"].dims(), &[16, 8]);
    }

    #[test]
    fn test_lstm_zero_state_equals_no_state() {
        let varmap = VarMap::new();
        let lstm = Lstm::new(5, 3, 1, false, vb(&varmap)).unwrap();
        let x = Tensor::randn(0f32, 1., (2, 4, 5), &Device::Cpu).unwrap();
        let zero = lstm.zero_state(2, &Device::Cpu).unwrap();
        let (a, _) = lstm.forward(&x, None).unwrap();
        let (b, _) = lstm.forward(&x, Some(&zero)).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-7);
    }

    #[test]
    fn test_lstm_forward_direction_is_causal() {
        let varmap = VarMap::new();
        let lstm = Lstm::new(3, 4, 2, false, vb(&varmap)).unwrap();
        let x = Tensor::randn(0f32, 1., (1, 6, 3), &Device::Cpu).unwrap();
        let changed = Tensor::cat(
            &[
                x.narrow(1, 0, 4).unwrap(),
                Tensor::randn(0f32, 1., (1, 2, 3), &Device::Cpu).unwrap(),
            ],
            1,
        )
        .unwrap();
        let (a, _) = lstm.forward(&x, None).unwrap();
        let (b, _) = lstm.forward(&changed, None).unwrap();
        let prefix = |t: &Tensor| t.narrow(1, 0, 4).unwrap();
        assert!(max_abs_diff(&prefix(&a), &prefix(&b)) < 1e-7);
    }

    #[test]
    fn test_lstm_split_sequence_with_state_matches_full() {
        let varmap = VarMap::new();
        let lstm = Lstm::new(3, 4, 2, false, vb(&varmap)).unwrap();
        let x = Tensor::randn(0f32, 1., (2, 8, 3), &Device::Cpu).unwrap();
        let (full, _) = lstm.forward(&x, None).unwrap();
        let (head, state) = lstm.forward(&x.narrow(1, 0, 5).unwrap(), None).unwrap();
        let (tail, _) = lstm
            .forward(&x.narrow(1, 5, 3).unwrap(), Some(&state))
            .unwrap();
        let joined = Tensor::cat(&[head, tail], 1).unwrap();
        assert!(max_abs_diff(&full, &joined) < 1e-5);
    }

    #[test]
    fn test_lstm_rejects_wrong_state() {
        let varmap = VarMap::new();
        let lstm = Lstm::new(3, 4, 2, true, vb(&varmap)).unwrap();
        let x = Tensor::randn(0f32, 1., (1, 3, 3), &Device::Cpu).unwrap();
        let short = LstmStackState {
            cells: vec![LstmState::zeros(1, 4, &Device::Cpu).unwrap()],
        };
        assert!(lstm.forward(&x, Some(&short)).is_err());
    }

    #[test]
    fn test_complex_lstm_product_rule() {
        let varmap = VarMap::new();
        let root = vb(&varmap);
        let lstm = ComplexLstm::new(4, 3, 1, false, root.clone()).unwrap();
        let re = Tensor::randn(0f32, 1., (1, 5, 4), &Device::Cpu).unwrap();
        let im = Tensor::randn(0f32, 1., (1, 5, 4), &Device::Cpu).unwrap();
        let (out, _) = lstm
            .forward(&ComplexTensor::new(re.clone(), im.clone()).unwrap(), None)
            .unwrap();

        let a = Lstm::new(4, 3, 1, false, root.pp("lstm_real")).unwrap();
        let b = Lstm::new(4, 3, 1, false, root.pp("lstm_imag")).unwrap();
        let run = |l: &Lstm, t: &Tensor| l.forward(t, None).unwrap().0;
        let expected_re = run(&a, &re).sub(&run(&b, &im)).unwrap();
        let expected_im = run(&a, &im).add(&run(&b, &re)).unwrap();
        assert!(max_abs_diff(out.re(), &expected_re) < 1e-6);
        assert!(max_abs_diff(out.im(), &expected_im) < 1e-6);
    }

    #[test]
    fn test_bottleneck_widths() {
        let varmap = VarMap::new();
        let complex = Bottleneck::new(12, 8, 2, true, true, vb(&varmap).pp("a")).unwrap();
        assert_eq!(complex.output_width(), 16);
        assert_eq!(complex.stream_width(), 16);

        let real = Bottleneck::new(24, 8, 2, false, false, vb(&varmap).pp("b")).unwrap();
        assert_eq!(real.output_width(), 8);
        assert_eq!(real.stream_width(), 4);

        assert!(Bottleneck::new(24, 7, 1, false, false, vb(&varmap).pp("c")).is_err());
    }

    #[test]
    fn test_bottleneck_broadcasts_over_frequency() {
        let varmap = VarMap::new();
        let bottleneck = Bottleneck::new(2 * 3, 5, 1, true, false, vb(&varmap)).unwrap();
        let re = Tensor::randn(0f32, 1., (2, 2, 3, 4), &Device::Cpu).unwrap();
        let x = ComplexTensor::new(re.clone(), re).unwrap();
        let (out, state) = bottleneck.forward(&x, None).unwrap();
        assert_eq!(out.dims(), &[2, 5, 3, 4]);
        let first = out.re().narrow(2, 0, 1).unwrap();
        let last = out.re().narrow(2, 2, 1).unwrap();
        assert!(max_abs_diff(&first, &last) == 0.0);
        assert!(bottleneck.accepts(&state, 2));
        assert!(!bottleneck.accepts(&state, 3));
    }

    #[test]
    fn test_real_bottleneck_splits_channels() {
        let varmap = VarMap::new();
        let bottleneck = Bottleneck::new(2 * 2 * 3, 4, 1, false, true, vb(&varmap)).unwrap();
        let re = Tensor::randn(0f32, 1., (1, 2, 3, 6), &Device::Cpu).unwrap();
        let im = Tensor::randn(0f32, 1., (1, 2, 3, 6), &Device::Cpu).unwrap();
        let (out, state) = bottleneck
            .forward(&ComplexTensor::new(re, im).unwrap(), None)
            .unwrap();
        assert_eq!(out.dims(), &[1, 4, 3, 6]);
        assert!(matches!(state, BottleneckState::Real(_)));

        let varmap = VarMap::new();
        let complex = Bottleneck::new(6, 4, 1, true, true, vb(&varmap)).unwrap();
        assert!(!complex.accepts(&state, 1));
    }
}
