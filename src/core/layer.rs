use std::io::{Read, Write};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::activation::Activation;
use crate::config::{ExecutionTier, PlasticityConfig};
use crate::error::{NetError, Result};
use crate::prng::Prng;
use crate::storage;

/// Importance assumed for inputs that have no entry in a consolidation score vector.
pub const DEFAULT_IMPORTANCE: f64 = 0.5;

/// Gradients produced by [`SynapseLayer::backward`].
///
/// `weights` uses the layer's row-major layout: entry `(j, i)` lives at `j * input_width + i`.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub input: Vec<f64>,
    pub weights: Vec<f64>,
    pub biases: Vec<f64>,
}

impl Gradients {
    pub fn zeros(input_width: usize, output_width: usize) -> Self {
        Self {
            input: vec![0.0; input_width],
            weights: vec![0.0; input_width * output_width],
            biases: vec![0.0; output_width],
        }
    }

    pub fn for_layer(layer: &SynapseLayer) -> Self {
        Self::zeros(layer.input_width, layer.output_width)
    }

    pub fn clear(&mut self) {
        self.input.fill(0.0);
        self.weights.fill(0.0);
        self.biases.fill(0.0);
    }

    /// Scale the accumulated weight and bias gradients.
    pub fn scale(&mut self, factor: f64) {
        for g in self.weights.iter_mut().chain(self.biases.iter_mut()) {
            *g *= factor;
        }
    }
}

/// A fully-connected transformation from `input_width` values to `output_width` values,
/// together with all of its plastic state.
///
/// Per-connection arrays (`weights`, `eligibility_trace`, `plasticity_rate`,
/// `pruning_mask`) are flat and output-major: connection `(j, i)` from input `i` to
/// output neuron `j` lives at `j * input_width + i`.
///
/// A connection whose mask bit is cleared contributes nothing to forward sums or
/// gradients, is skipped by every update, and its weight stays exactly `0.0`.
#[derive(Debug, Clone)]
pub struct SynapseLayer {
    input_width: usize,
    output_width: usize,

    weights: Vec<f64>,
    biases: Vec<f64>,
    eligibility_trace: Vec<f64>,
    homeostatic_target: Vec<f64>,
    plasticity_rate: Vec<f64>,
    pruning_mask: Vec<bool>,

    // Overwritten by every forward(); read by the following backward().
    pre_activation: Vec<f64>,
    post_activation: Vec<f64>,

    plasticity: PlasticityConfig,
    tier: ExecutionTier,
}

impl SynapseLayer {
    /// Build a layer with default plasticity constants.
    pub fn new(input_width: usize, output_width: usize, seed: u64) -> Result<Self> {
        Self::with_config(input_width, output_width, seed, PlasticityConfig::default())
    }

    /// Build a layer with He-scaled Gaussian weights (`σ = sqrt(2 / input_width)`) and
    /// per-synapse plasticity rates drawn from the configured band.
    ///
    /// Weights are drawn first, then plasticity rates, both in row-major order, so a
    /// given seed always yields the same layer.
    pub fn with_config(
        input_width: usize,
        output_width: usize,
        seed: u64,
        plasticity: PlasticityConfig,
    ) -> Result<Self> {
        if input_width == 0 || output_width == 0 {
            return Err(NetError::InvalidTopology(format!(
                "layer widths must be positive (got {input_width} -> {output_width})"
            )));
        }
        plasticity.validate().map_err(NetError::InvalidConfig)?;
        let conns = input_width.checked_mul(output_width).ok_or_else(|| {
            NetError::InvalidTopology(format!(
                "layer {input_width} -> {output_width} has too many connections"
            ))
        })?;

        let mut rng = Prng::new(seed);
        let std_dev = (2.0 / input_width as f64).sqrt();
        let weights: Vec<f64> = (0..conns).map(|_| rng.next_gaussian(0.0, std_dev)).collect();
        let plasticity_rate: Vec<f64> = (0..conns)
            .map(|_| {
                rng.gen_range_f64(plasticity.plasticity_rate_min, plasticity.plasticity_rate_max)
            })
            .collect();

        Ok(Self {
            input_width,
            output_width,
            weights,
            biases: vec![0.0; output_width],
            eligibility_trace: vec![0.0; conns],
            homeostatic_target: vec![0.0; output_width],
            plasticity_rate,
            pruning_mask: vec![true; conns],
            pre_activation: vec![0.0; output_width],
            post_activation: vec![0.0; output_width],
            plasticity,
            tier: ExecutionTier::default(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn input_width(&self) -> usize {
        self.input_width
    }

    pub fn output_width(&self) -> usize {
        self.output_width
    }

    /// Flat index of connection `(output j, input i)`, or `None` when out of range.
    #[inline]
    pub fn index(&self, j: usize, i: usize) -> Option<usize> {
        (j < self.output_width && i < self.input_width).then(|| j * self.input_width + i)
    }

    pub fn weight(&self, j: usize, i: usize) -> Option<f64> {
        self.index(j, i).map(|idx| self.weights[idx])
    }

    /// `Some(false)` for a pruned connection.
    pub fn is_active(&self, j: usize, i: usize) -> Option<bool> {
        self.index(j, i).map(|idx| self.pruning_mask[idx])
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn biases(&self) -> &[f64] {
        &self.biases
    }

    pub fn eligibility_trace(&self) -> &[f64] {
        &self.eligibility_trace
    }

    pub fn homeostatic_targets(&self) -> &[f64] {
        &self.homeostatic_target
    }

    pub fn plasticity_rates(&self) -> &[f64] {
        &self.plasticity_rate
    }

    pub fn pruning_mask(&self) -> &[bool] {
        &self.pruning_mask
    }

    /// Pre-activations cached by the last `forward` call.
    pub fn pre_activations(&self) -> &[f64] {
        &self.pre_activation
    }

    /// Post-activations cached by the last `forward` call.
    pub fn post_activations(&self) -> &[f64] {
        &self.post_activation
    }

    pub fn active_connections(&self) -> usize {
        self.pruning_mask.iter().filter(|&&m| m).count()
    }

    pub fn plasticity(&self) -> &PlasticityConfig {
        &self.plasticity
    }

    pub fn execution_tier(&self) -> ExecutionTier {
        self.tier
    }

    pub fn set_execution_tier(&mut self, tier: ExecutionTier) {
        self.tier = tier;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Forward / backward
    // ─────────────────────────────────────────────────────────────────────────

    /// Evaluate the layer and cache pre/post activations for a following `backward`.
    pub fn forward(&mut self, input: &[f64], activation: Activation) -> Result<&[f64]> {
        self.check_len("layer input", self.input_width, input.len())?;
        forward_kernel(
            &self.weights,
            &self.pruning_mask,
            &self.biases,
            self.input_width,
            self.tier,
            input,
            activation,
            &mut self.pre_activation,
            &mut self.post_activation,
        );
        Ok(&self.post_activation)
    }

    /// Pure evaluation into caller-owned buffers; the caches are left untouched.
    pub fn evaluate(
        &self,
        input: &[f64],
        activation: Activation,
        pre_out: &mut [f64],
        post_out: &mut [f64],
    ) -> Result<()> {
        self.check_len("layer input", self.input_width, input.len())?;
        self.check_len("pre-activation buffer", self.output_width, pre_out.len())?;
        self.check_len("post-activation buffer", self.output_width, post_out.len())?;
        forward_kernel(
            &self.weights,
            &self.pruning_mask,
            &self.biases,
            self.input_width,
            self.tier,
            input,
            activation,
            pre_out,
            post_out,
        );
        Ok(())
    }

    /// Gradients for one sample, using the activations cached by the preceding `forward`
    /// on the same `input`.
    pub fn backward(
        &self,
        input: &[f64],
        output_gradient: &[f64],
        activation: Activation,
    ) -> Result<Gradients> {
        let mut grads = Gradients::for_layer(self);
        self.backward_accumulate(
            input,
            output_gradient,
            activation,
            &mut grads.input,
            &mut grads.weights,
            &mut grads.biases,
        )?;
        Ok(grads)
    }

    /// Like [`backward`](Self::backward), but writing into caller-owned buffers:
    /// `input_gradient` is overwritten while `weight_acc` / `bias_acc` are accumulated
    /// into, so a mini-batch can sum over samples without reallocating.
    pub fn backward_accumulate(
        &self,
        input: &[f64],
        output_gradient: &[f64],
        activation: Activation,
        input_gradient: &mut [f64],
        weight_acc: &mut [f64],
        bias_acc: &mut [f64],
    ) -> Result<()> {
        let n_in = self.input_width;
        let n_out = self.output_width;
        self.check_len("layer input", n_in, input.len())?;
        self.check_len("output gradient", n_out, output_gradient.len())?;
        self.check_len("input gradient buffer", n_in, input_gradient.len())?;
        self.check_len("weight gradient buffer", self.weights.len(), weight_acc.len())?;
        self.check_len("bias gradient buffer", n_out, bias_acc.len())?;

        let weights = &self.weights;
        let mask = &self.pruning_mask;
        let pre = &self.pre_activation;
        let post = &self.post_activation;

        // Stage 1: local error per neuron.
        let delta: Vec<f64> = (0..n_out)
            .map(|j| output_gradient[j] * activation.derivative(pre[j], post[j]))
            .collect();
        let delta = &delta;

        // Stage 2: bias and weight gradients, one row per neuron.
        let row_grad = |j: usize, row_g: &mut [f64], b: &mut f64| {
            let d = delta[j];
            *b += d;
            let row_mask = &mask[j * n_in..(j + 1) * n_in];
            for ((g, &m), &x) in row_g.iter_mut().zip(row_mask).zip(input) {
                if m {
                    *g += d * x;
                }
            }
        };

        // Stage 3: each input column sums over neurons in ascending order, so the
        // result does not depend on the tier.
        let col_grad = |i: usize| -> f64 {
            let mut s = 0.0;
            for j in 0..n_out {
                let idx = j * n_in + i;
                if mask[idx] {
                    s += weights[idx] * delta[j];
                }
            }
            s
        };

        match self.tier.effective() {
            #[cfg(feature = "parallel")]
            ExecutionTier::Parallel => {
                weight_acc
                    .par_chunks_mut(n_in)
                    .zip(bias_acc.par_iter_mut())
                    .enumerate()
                    .for_each(|(j, (row_g, b))| row_grad(j, row_g, b));
                input_gradient
                    .par_iter_mut()
                    .enumerate()
                    .for_each(|(i, g)| *g = col_grad(i));
            }
            _ => {
                for (j, (row_g, b)) in weight_acc
                    .chunks_mut(n_in)
                    .zip(bias_acc.iter_mut())
                    .enumerate()
                {
                    row_grad(j, row_g, b);
                }
                for (i, g) in input_gradient.iter_mut().enumerate() {
                    *g = col_grad(i);
                }
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Learning
    // ─────────────────────────────────────────────────────────────────────────

    /// Composite update. For every active connection `(j, i)`, in this order:
    ///
    /// 1. gradient step: `w -= lr * grad[j,i]`
    /// 2. Hebbian step: `w += hebbian_rate * input[i] * output[j] * plasticity_rate[j,i]`
    /// 3. trace: `trace = trace * decay_rate + input[i] * output[j]`
    /// 4. homeostasis: `w += homeostatic_strength * (target[j] - output[j])`
    ///
    /// Biases take a plain gradient step. `input` / `output` are the activity pair the
    /// Hebbian and homeostatic terms act on.
    pub fn apply_update(
        &mut self,
        weight_gradient: &[f64],
        bias_gradient: &[f64],
        learning_rate: f64,
        input: &[f64],
        output: &[f64],
    ) -> Result<()> {
        self.update(weight_gradient, bias_gradient, learning_rate, input, output, true)
    }

    /// Gradient step and bias update only; traces and the Hebbian and homeostatic terms
    /// are left out.
    pub fn apply_gradient_only(
        &mut self,
        weight_gradient: &[f64],
        bias_gradient: &[f64],
        learning_rate: f64,
        input: &[f64],
        output: &[f64],
    ) -> Result<()> {
        self.update(weight_gradient, bias_gradient, learning_rate, input, output, false)
    }

    fn update(
        &mut self,
        weight_gradient: &[f64],
        bias_gradient: &[f64],
        learning_rate: f64,
        input: &[f64],
        output: &[f64],
        plastic: bool,
    ) -> Result<()> {
        let n_in = self.input_width;
        self.check_len("weight gradient", self.weights.len(), weight_gradient.len())?;
        self.check_len("bias gradient", self.output_width, bias_gradient.len())?;
        self.check_len("hebbian input", n_in, input.len())?;
        self.check_len("hebbian output", self.output_width, output.len())?;

        let PlasticityConfig {
            hebbian_rate,
            homeostatic_strength,
            decay_rate,
            ..
        } = self.plasticity;
        let mask = &self.pruning_mask;
        let rates = &self.plasticity_rate;
        let targets = &self.homeostatic_target;

        let row_update = |j: usize, row_w: &mut [f64], row_t: &mut [f64]| {
            let y = output[j];
            let homeostatic = homeostatic_strength * (targets[j] - y);
            let base = j * n_in;
            for i in 0..n_in {
                let idx = base + i;
                if !mask[idx] {
                    continue;
                }
                let w = &mut row_w[i];
                *w -= learning_rate * weight_gradient[idx];
                if plastic {
                    let x = input[i];
                    *w += hebbian_rate * x * y * rates[idx];
                    let t = &mut row_t[i];
                    *t *= decay_rate;
                    *t += x * y;
                    *w += homeostatic;
                }
            }
        };

        match self.tier.effective() {
            #[cfg(feature = "parallel")]
            ExecutionTier::Parallel => {
                self.weights
                    .par_chunks_mut(n_in)
                    .zip(self.eligibility_trace.par_chunks_mut(n_in))
                    .enumerate()
                    .for_each(|(j, (row_w, row_t))| row_update(j, row_w, row_t));
            }
            _ => {
                for (j, (row_w, row_t)) in self
                    .weights
                    .chunks_mut(n_in)
                    .zip(self.eligibility_trace.chunks_mut(n_in))
                    .enumerate()
                {
                    row_update(j, row_w, row_t);
                }
            }
        }

        for (b, g) in self.biases.iter_mut().zip(bias_gradient) {
            *b -= learning_rate * g;
        }
        Ok(())
    }

    /// Importance-weighted consolidation.
    ///
    /// `importance_scores[i]` rates input `i`; missing entries count as
    /// [`DEFAULT_IMPORTANCE`]. Active connections from inputs above 0.7 are scaled by
    /// `1 + importance * 0.1`, those below 0.3 by `1 - (1 - importance) * 0.05`. Each
    /// neuron's homeostatic target becomes `0.5 + 0.3 * importance` of its last active
    /// input; a neuron with no active inputs keeps its target.
    pub fn consolidate(&mut self, importance_scores: &[f64]) {
        let n_in = self.input_width;
        for j in 0..self.output_width {
            for i in 0..n_in {
                let idx = j * n_in + i;
                if !self.pruning_mask[idx] {
                    continue;
                }
                let importance = importance_scores
                    .get(i)
                    .copied()
                    .unwrap_or(DEFAULT_IMPORTANCE);
                if importance > 0.7 {
                    self.weights[idx] *= 1.0 + importance * 0.1;
                } else if importance < 0.3 {
                    self.weights[idx] *= 1.0 - (1.0 - importance) * 0.05;
                }
                self.homeostatic_target[j] = 0.5 + 0.3 * importance;
            }
        }
    }

    /// Mask out every active connection with `|w| < pruning_threshold` and pin its weight
    /// to zero. Returns the number of connections pruned by this call.
    pub fn prune(&mut self) -> usize {
        let threshold = self.plasticity.pruning_threshold;
        let mut pruned = 0;
        for (w, m) in self.weights.iter_mut().zip(self.pruning_mask.iter_mut()) {
            if *m && w.abs() < threshold {
                *m = false;
                *w = 0.0;
                pruned += 1;
            }
        }
        pruned
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Serialization
    // ─────────────────────────────────────────────────────────────────────────

    /// Write the raw layer record:
    ///
    /// - `input_width`, `output_width`: u64 LE
    /// - `weights`, `biases`, `eligibility_trace`, `homeostatic_target`,
    ///   `plasticity_rate`: each `(u64 LE length, f64 LE values)`
    /// - `pruning_mask`: `(u64 LE length, one byte per flag)`
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        storage::write_u64_le(w, self.input_width as u64)?;
        storage::write_u64_le(w, self.output_width as u64)?;
        storage::write_f64_array(w, &self.weights)?;
        storage::write_f64_array(w, &self.biases)?;
        storage::write_f64_array(w, &self.eligibility_trace)?;
        storage::write_f64_array(w, &self.homeostatic_target)?;
        storage::write_f64_array(w, &self.plasticity_rate)?;
        storage::write_bool_array(w, &self.pruning_mask)?;
        Ok(())
    }

    /// Read a raw layer record into a fresh layer.
    ///
    /// Plasticity constants are not part of the record; the caller supplies them.
    pub fn read_from<R: Read>(r: &mut R, plasticity: PlasticityConfig) -> Result<Self> {
        Self::decode(r, plasticity, None)
    }

    /// Like [`read_from`](Self::read_from), but the record must describe an
    /// `input_width -> output_width` layer. The widths are checked before any array is
    /// read, so a corrupt record cannot size the decode.
    pub fn read_expecting<R: Read>(
        r: &mut R,
        plasticity: PlasticityConfig,
        input_width: usize,
        output_width: usize,
    ) -> Result<Self> {
        Self::decode(r, plasticity, Some((input_width, output_width)))
    }

    fn decode<R: Read>(
        r: &mut R,
        plasticity: PlasticityConfig,
        expected: Option<(usize, usize)>,
    ) -> Result<Self> {
        let input_width = read_width(r, "input_width")?;
        let output_width = read_width(r, "output_width")?;
        if let Some((want_in, want_out)) = expected {
            if input_width != want_in {
                return Err(NetError::mismatch(
                    "loaded layer input width",
                    want_in,
                    input_width,
                ));
            }
            if output_width != want_out {
                return Err(NetError::mismatch(
                    "loaded layer output width",
                    want_out,
                    output_width,
                ));
            }
        }
        let conns = input_width.checked_mul(output_width).ok_or_else(|| {
            NetError::InvalidData(format!(
                "layer {input_width} -> {output_width} has too many connections"
            ))
        })?;

        let weights = storage::read_f64_array(r, conns, "weights")?;
        let biases = storage::read_f64_array(r, output_width, "biases")?;
        let eligibility_trace = storage::read_f64_array(r, conns, "eligibility_trace")?;
        let homeostatic_target = storage::read_f64_array(r, output_width, "homeostatic_target")?;
        let plasticity_rate = storage::read_f64_array(r, conns, "plasticity_rate")?;
        let pruning_mask = storage::read_bool_array(r, conns, "pruning_mask")?;

        if weights
            .iter()
            .zip(&pruning_mask)
            .any(|(&w, &m)| !m && w != 0.0)
        {
            return Err(NetError::InvalidData(
                "pruned connection with non-zero weight".to_string(),
            ));
        }

        Ok(Self {
            input_width,
            output_width,
            weights,
            biases,
            eligibility_trace,
            homeostatic_target,
            plasticity_rate,
            pruning_mask,
            pre_activation: vec![0.0; output_width],
            post_activation: vec![0.0; output_width],
            plasticity,
            tier: ExecutionTier::default(),
        })
    }

    /// Size in bytes of this layer's raw record.
    pub fn record_len_bytes(&self) -> usize {
        let conns = self.weights.len();
        let out = self.output_width;
        16 + 6 * 8 + (3 * conns + 2 * out) * 8 + conns
    }

    #[inline]
    fn check_len(&self, context: &'static str, expected: usize, got: usize) -> Result<()> {
        if expected != got {
            return Err(NetError::mismatch(context, expected, got));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn weights_mut(&mut self) -> &mut [f64] {
        &mut self.weights
    }
}

fn read_width<R: Read>(r: &mut R, field: &str) -> Result<usize> {
    let raw = storage::read_u64_le(r)?;
    match usize::try_from(raw) {
        Ok(w) if w > 0 => Ok(w),
        _ => Err(NetError::InvalidData(format!("{field} must be positive, got {raw}"))),
    }
}

/// Masked dot product of one weight row with the input, seeded with the bias.
#[inline]
fn neuron_sum(row_w: &[f64], row_mask: &[bool], bias: f64, input: &[f64]) -> f64 {
    let mut sum = bias;
    for ((&w, &m), &x) in row_w.iter().zip(row_mask).zip(input) {
        if m {
            sum += w * x;
        }
    }
    sum
}

#[allow(clippy::too_many_arguments)]
fn forward_kernel(
    weights: &[f64],
    mask: &[bool],
    biases: &[f64],
    n_in: usize,
    tier: ExecutionTier,
    input: &[f64],
    activation: Activation,
    pre: &mut [f64],
    post: &mut [f64],
) {
    let neuron = |j: usize| -> f64 {
        let row = j * n_in..(j + 1) * n_in;
        neuron_sum(&weights[row.clone()], &mask[row], biases[j], input)
    };

    match tier.effective() {
        #[cfg(feature = "parallel")]
        ExecutionTier::Parallel => {
            pre.par_iter_mut()
                .zip(post.par_iter_mut())
                .enumerate()
                .for_each(|(j, (z, a))| {
                    *z = neuron(j);
                    *a = activation.apply(*z);
                });
        }
        _ => {
            for (j, (z, a)) in pre.iter_mut().zip(post.iter_mut()).enumerate() {
                *z = neuron(j);
                *a = activation.apply(*z);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    /// 2 -> 2 layer with hand-picked parameters.
    fn fixed_layer() -> SynapseLayer {
        let mut layer = SynapseLayer::new(2, 2, 1).unwrap();
        layer.weights = vec![0.5, -0.25, 1.0, 2.0];
        layer.biases = vec![0.1, -0.2];
        layer
    }

    #[test]
    fn construction_initializes_state() {
        let layer = SynapseLayer::new(10, 5, 42).unwrap();
        assert_eq!(layer.input_width(), 10);
        assert_eq!(layer.output_width(), 5);
        assert_eq!(layer.weights().len(), 50);
        assert_eq!(layer.weights().len(), layer.biases().len() * layer.input_width());
        assert!(layer.biases().iter().all(|&b| b == 0.0));
        assert!(layer.eligibility_trace().iter().all(|&t| t == 0.0));
        assert!(layer.homeostatic_targets().iter().all(|&t| t == 0.0));
        assert!(layer.pruning_mask().iter().all(|&m| m));
        assert_eq!(layer.plasticity_rates().len(), 50);
        assert!(layer
            .plasticity_rates()
            .iter()
            .all(|r| (0.001..0.02).contains(r)));
        assert_eq!(layer.pre_activations().len(), 5);
        assert_eq!(layer.post_activations().len(), 5);
    }

    #[test]
    fn zero_width_is_rejected() {
        assert!(matches!(
            SynapseLayer::new(0, 3, 1),
            Err(NetError::InvalidTopology(_))
        ));
        assert!(matches!(
            SynapseLayer::new(3, 0, 1),
            Err(NetError::InvalidTopology(_))
        ));
    }

    #[test]
    fn invalid_plasticity_is_rejected() {
        let cfg = PlasticityConfig::default().with_decay_rate(-0.5);
        assert!(matches!(
            SynapseLayer::with_config(2, 2, 1, cfg),
            Err(NetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn same_seed_same_layer() {
        let a = SynapseLayer::new(8, 4, 7).unwrap();
        let b = SynapseLayer::new(8, 4, 7).unwrap();
        let c = SynapseLayer::new(8, 4, 8).unwrap();
        assert_eq!(a.weights(), b.weights());
        assert_eq!(a.plasticity_rates(), b.plasticity_rates());
        assert_ne!(a.weights(), c.weights());
    }

    #[test]
    fn he_scaling_matches_fan_in() {
        let layer = SynapseLayer::new(200, 100, 3).unwrap();
        let n = layer.weights().len() as f64;
        let mean = layer.weights().iter().sum::<f64>() / n;
        let var = layer
            .weights()
            .iter()
            .map(|w| (w - mean) * (w - mean))
            .sum::<f64>()
            / n;
        let expected = (2.0f64 / 200.0).sqrt();
        assert!(mean.abs() < 0.01, "mean {mean}");
        assert!((var.sqrt() - expected).abs() < 0.01, "std {}", var.sqrt());
    }

    #[test]
    fn index_is_bounds_checked() {
        let layer = fixed_layer();
        assert_eq!(layer.index(1, 0), Some(2));
        assert_eq!(layer.weight(1, 1), Some(2.0));
        assert_eq!(layer.weight(2, 0), None);
        assert_eq!(layer.weight(0, 2), None);
        assert_eq!(layer.is_active(0, 0), Some(true));
    }

    #[test]
    fn forward_caches_pre_and_post() {
        let mut layer = fixed_layer();
        let out = layer.forward(&[1.0, 2.0], Activation::Relu).unwrap().to_vec();
        // z0 = 0.1 + 0.5 - 0.5 = 0.1 ; z1 = -0.2 + 1.0 + 4.0 = 4.8
        assert!(approx(layer.pre_activations()[0], 0.1));
        assert!(approx(layer.pre_activations()[1], 4.8));
        assert_eq!(out, layer.post_activations());

        let out = layer.forward(&[0.0, -1.0], Activation::Relu).unwrap().to_vec();
        // z0 = 0.1 + 0.25 = 0.35 ; z1 = -0.2 - 2.0 = -2.2 -> relu 0
        assert!(approx(out[0], 0.35));
        assert_eq!(out[1], 0.0);
        assert!(approx(layer.pre_activations()[1], -2.2));
    }

    #[test]
    fn forward_rejects_wrong_width_without_touching_caches() {
        let mut layer = fixed_layer();
        layer.forward(&[1.0, 1.0], Activation::Linear).unwrap();
        let before = layer.post_activations().to_vec();
        let err = layer.forward(&[1.0], Activation::Linear).unwrap_err();
        assert!(matches!(
            err,
            NetError::DimensionMismatch {
                expected: 2,
                got: 1,
                ..
            }
        ));
        assert_eq!(layer.post_activations(), &before[..]);
    }

    #[test]
    fn evaluate_matches_forward_and_leaves_caches() {
        let mut layer = fixed_layer();
        let mut pre = vec![0.0; 2];
        let mut post = vec![0.0; 2];
        layer
            .evaluate(&[0.3, -0.7], Activation::Tanh, &mut pre, &mut post)
            .unwrap();
        assert!(layer.pre_activations().iter().all(|&v| v == 0.0));
        let cached = layer.forward(&[0.3, -0.7], Activation::Tanh).unwrap();
        assert_eq!(cached, &post[..]);
    }

    #[test]
    fn masked_connection_is_excluded_from_forward() {
        let mut layer = fixed_layer();
        layer.pruning_mask[1] = false;
        layer.weights[1] = 0.0;
        let a = layer.forward(&[1.0, 2.0], Activation::Linear).unwrap().to_vec();
        // Perturbing a masked weight directly must not leak into the sum.
        layer.weights[1] = 123.0;
        let b = layer.forward(&[1.0, 2.0], Activation::Linear).unwrap().to_vec();
        assert_eq!(a, b);
        assert!(approx(a[0], 0.6));
    }

    #[test]
    fn backward_linear_by_hand() {
        let mut layer = fixed_layer();
        let input = [1.0, 2.0];
        layer.forward(&input, Activation::Linear).unwrap();
        let g = layer
            .backward(&input, &[1.0, -0.5], Activation::Linear)
            .unwrap();

        assert_eq!(g.biases, vec![1.0, -0.5]);
        assert_eq!(g.weights, vec![1.0, 2.0, -0.5, -1.0]);
        // dx0 = 0.5*1 + 1.0*(-0.5) = 0 ; dx1 = -0.25*1 + 2.0*(-0.5) = -1.25
        assert!(approx(g.input[0], 0.0));
        assert!(approx(g.input[1], -1.25));
    }

    #[test]
    fn backward_relu_blocks_inactive_neurons() {
        let mut layer = fixed_layer();
        let input = [0.0, -1.0];
        layer.forward(&input, Activation::Relu).unwrap();
        let g = layer.backward(&input, &[1.0, 1.0], Activation::Relu).unwrap();
        // Neuron 1 has z = -2.2, so nothing flows through it.
        assert_eq!(g.biases, vec![1.0, 0.0]);
        assert_eq!(&g.weights[2..], &[0.0, 0.0]);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut layer = SynapseLayer::new(3, 2, 17).unwrap();
        let input = [0.4, -0.9, 0.25];
        // Loss L = 0.5 * sum(y^2) so dL/dy = y.
        let loss = |l: &SynapseLayer| {
            let mut pre = vec![0.0; 2];
            let mut post = vec![0.0; 2];
            l.evaluate(&input, Activation::Tanh, &mut pre, &mut post)
                .unwrap();
            0.5 * post.iter().map(|y| y * y).sum::<f64>()
        };

        let y = layer.forward(&input, Activation::Tanh).unwrap().to_vec();
        let g = layer.backward(&input, &y, Activation::Tanh).unwrap();

        let eps = 1e-6;
        for idx in 0..layer.weights.len() {
            let orig = layer.weights[idx];
            layer.weights[idx] = orig + eps;
            let up = loss(&layer);
            layer.weights[idx] = orig - eps;
            let down = loss(&layer);
            layer.weights[idx] = orig;
            let numeric = (up - down) / (2.0 * eps);
            assert!(
                (numeric - g.weights[idx]).abs() < 1e-6,
                "weight {idx}: numeric {numeric} analytic {}",
                g.weights[idx]
            );
        }
    }

    #[test]
    fn masked_connection_has_no_gradient() {
        let mut layer = fixed_layer();
        layer.pruning_mask[2] = false;
        layer.weights[2] = 0.0;
        let input = [1.0, 2.0];
        layer.forward(&input, Activation::Linear).unwrap();
        let g = layer
            .backward(&input, &[1.0, 1.0], Activation::Linear)
            .unwrap();
        assert_eq!(g.weights[2], 0.0);
        // dx0 = 0.5*1 only; the masked (1,0) path is skipped.
        assert!(approx(g.input[0], 0.5));
    }

    #[test]
    fn backward_accumulate_sums_over_calls() {
        let mut layer = fixed_layer();
        let input = [1.0, 2.0];
        layer.forward(&input, Activation::Linear).unwrap();
        let mut acc = Gradients::for_layer(&layer);
        for _ in 0..3 {
            layer
                .backward_accumulate(
                    &input,
                    &[1.0, 0.0],
                    Activation::Linear,
                    &mut acc.input,
                    &mut acc.weights,
                    &mut acc.biases,
                )
                .unwrap();
        }
        assert_eq!(acc.biases, vec![3.0, 0.0]);
        assert_eq!(acc.weights, vec![3.0, 6.0, 0.0, 0.0]);
        // Input gradient is per call, not accumulated.
        assert!(approx(acc.input[0], 0.5));

        acc.scale(1.0 / 3.0);
        assert!(approx(acc.weights[1], 2.0));
    }

    #[test]
    fn backward_rejects_wrong_gradient_width() {
        let mut layer = fixed_layer();
        layer.forward(&[1.0, 2.0], Activation::Linear).unwrap();
        assert!(matches!(
            layer.backward(&[1.0, 2.0], &[1.0], Activation::Linear),
            Err(NetError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn apply_update_composite_rule_by_hand() {
        let mut layer = SynapseLayer::new(1, 1, 5).unwrap();
        layer.weights[0] = 0.5;
        layer.biases[0] = 0.1;
        layer.plasticity_rate[0] = 0.01;
        layer.eligibility_trace[0] = 0.2;

        layer
            .apply_update(&[0.2], &[0.3], 0.1, &[2.0], &[0.8])
            .unwrap();

        // 0.5 - 0.1*0.2 = 0.48 ; + 0.01*2*0.8*0.01 = 0.48016 ; + 0.001*(0-0.8) = 0.47936
        assert!(approx(layer.weights[0], 0.47936));
        // 0.2*0.95 + 1.6
        assert!(approx(layer.eligibility_trace[0], 1.79));
        assert!(approx(layer.biases[0], 0.07));
    }

    #[test]
    fn gradient_only_update_skips_plastic_terms() {
        let mut layer = SynapseLayer::new(1, 1, 5).unwrap();
        layer.weights[0] = 0.5;
        layer
            .apply_gradient_only(&[0.2], &[0.3], 0.1, &[2.0], &[0.8])
            .unwrap();
        assert!(approx(layer.weights[0], 0.48));
        assert_eq!(layer.eligibility_trace[0], 0.0);
        assert!(approx(layer.biases[0], -0.03));
    }

    #[test]
    fn apply_update_skips_masked_connections() {
        let mut layer = fixed_layer();
        layer.pruning_mask[3] = false;
        layer.weights[3] = 0.0;
        layer
            .apply_update(&[1.0; 4], &[0.0; 2], 0.5, &[1.0, 1.0], &[1.0, 1.0])
            .unwrap();
        assert_eq!(layer.weights[3], 0.0);
        assert_eq!(layer.eligibility_trace[3], 0.0);
        assert!(layer.eligibility_trace[2] > 0.0);
    }

    #[test]
    fn apply_update_rejects_mismatch_without_mutation() {
        let mut layer = fixed_layer();
        let before = layer.weights.clone();
        let err = layer
            .apply_update(&[0.1; 4], &[0.0; 2], 0.1, &[1.0], &[1.0, 1.0])
            .unwrap_err();
        assert!(matches!(err, NetError::DimensionMismatch { .. }));
        assert_eq!(layer.weights, before);
    }

    #[test]
    fn consolidate_strengthens_and_weakens() {
        let mut layer = SynapseLayer::new(3, 2, 9).unwrap();
        let before = layer.weights.clone();
        layer.consolidate(&[1.0, 0.0, 0.5]);

        for j in 0..2 {
            let hi = j * 3;
            let lo = j * 3 + 1;
            let mid = j * 3 + 2;
            assert!(layer.weights[hi].abs() > before[hi].abs());
            assert!(approx(layer.weights[hi], before[hi] * 1.1));
            assert!(layer.weights[lo].abs() < before[lo].abs());
            assert!(approx(layer.weights[lo], before[lo] * 0.95));
            assert_eq!(layer.weights[mid], before[mid]);
            // Last input (importance 0.5) sets the target.
            assert!(approx(layer.homeostatic_target[j], 0.65));
        }
    }

    #[test]
    fn consolidate_defaults_missing_scores() {
        let mut layer = SynapseLayer::new(3, 1, 9).unwrap();
        let before = layer.weights.clone();
        layer.consolidate(&[0.9]);
        assert!(approx(layer.weights[0], before[0] * 1.09));
        assert_eq!(&layer.weights[1..], &before[1..]);
        assert!(approx(layer.homeostatic_target[0], 0.65));
    }

    #[test]
    fn consolidate_leaves_pruned_connections_at_zero() {
        let mut layer = SynapseLayer::new(2, 1, 9).unwrap();
        layer.pruning_mask[1] = false;
        layer.weights[1] = 0.0;
        layer.consolidate(&[0.1, 1.0]);
        assert_eq!(layer.weights[1], 0.0);
        // Input 1 is pruned, so input 0 (importance 0.1) sets the target.
        assert!(approx(layer.homeostatic_target[0], 0.53));
    }

    #[test]
    fn prune_keeps_large_weights() {
        // 3 -> 2 layer, every weight far above the 1e-4 threshold.
        let mut layer = SynapseLayer::new(3, 2, 21).unwrap();
        for (k, w) in layer.weights.iter_mut().enumerate() {
            *w = if k % 2 == 0 { 0.5 } else { -0.5 };
        }
        assert_eq!(layer.prune(), 0);
        assert!(layer.pruning_mask().iter().all(|&m| m));
        assert_eq!(layer.active_connections(), 6);
    }

    #[test]
    fn prune_threshold_is_strict() {
        let mut layer = SynapseLayer::new(2, 2, 21).unwrap();
        layer.weights = vec![1e-4, -5e-5, 0.3, 9.9e-5];
        assert_eq!(layer.prune(), 2);
        assert_eq!(layer.pruning_mask(), &[true, false, true, false]);
        assert_eq!(layer.weights(), &[1e-4, 0.0, 0.3, 0.0]);
        // Already pruned connections are not counted again.
        assert_eq!(layer.prune(), 0);
    }

    #[test]
    fn pruned_connection_never_regrows() {
        let mut layer = SynapseLayer::new(2, 1, 21).unwrap();
        layer.weights = vec![1e-6, 0.8];
        layer.prune();
        for _ in 0..10 {
            layer
                .apply_update(&[-1.0, -1.0], &[0.0], 0.5, &[1.0, 1.0], &[2.0])
                .unwrap();
            layer.consolidate(&[1.0, 1.0]);
        }
        assert_eq!(layer.weights[0], 0.0);
        assert!(!layer.pruning_mask[0]);
    }

    #[test]
    fn record_round_trip_is_bit_exact() {
        let mut layer = SynapseLayer::new(3, 2, 33).unwrap();
        layer.weights[4] = 1e-7;
        layer.prune();
        let input = [0.2, -0.4, 0.9];
        layer.forward(&input, Activation::Sigmoid).unwrap();
        let g = layer.backward(&input, &[0.3, -0.1], Activation::Sigmoid).unwrap();
        let out = layer.post_activations().to_vec();
        layer
            .apply_update(&g.weights, &g.biases, 0.05, &input, &out)
            .unwrap();
        layer.consolidate(&[0.9, 0.1, 0.5]);

        let mut buf = Vec::new();
        layer.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), layer.record_len_bytes());
        assert_eq!(buf.len(), 246);

        let restored =
            SynapseLayer::read_from(&mut io::Cursor::new(&buf), PlasticityConfig::default())
                .unwrap();
        let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(restored.input_width(), 3);
        assert_eq!(restored.output_width(), 2);
        assert_eq!(bits(restored.weights()), bits(layer.weights()));
        assert_eq!(bits(restored.biases()), bits(layer.biases()));
        assert_eq!(
            bits(restored.eligibility_trace()),
            bits(layer.eligibility_trace())
        );
        assert_eq!(
            bits(restored.homeostatic_targets()),
            bits(layer.homeostatic_targets())
        );
        assert_eq!(
            bits(restored.plasticity_rates()),
            bits(layer.plasticity_rates())
        );
        assert_eq!(restored.pruning_mask(), layer.pruning_mask());
        assert_eq!(restored.pre_activations().len(), 2);
        assert_eq!(restored.post_activations().len(), 2);
    }

    #[test]
    fn truncated_record_is_reported() {
        let layer = SynapseLayer::new(3, 2, 33).unwrap();
        let mut buf = Vec::new();
        layer.write_to(&mut buf).unwrap();
        for cut in [0, 7, 16, 100, buf.len() - 1] {
            let res = SynapseLayer::read_from(
                &mut io::Cursor::new(&buf[..cut]),
                PlasticityConfig::default(),
            );
            assert!(
                matches!(res, Err(NetError::SerializationTruncated)),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn inconsistent_record_is_rejected() {
        let layer = SynapseLayer::new(2, 2, 33).unwrap();
        let mut buf = Vec::new();
        layer.write_to(&mut buf).unwrap();

        // Corrupt the weights length prefix (right after the two widths).
        let mut bad_len = buf.clone();
        bad_len[16..24].copy_from_slice(&5u64.to_le_bytes());
        assert!(matches!(
            SynapseLayer::read_from(&mut io::Cursor::new(&bad_len), PlasticityConfig::default()),
            Err(NetError::InvalidData(_))
        ));

        // Zero width.
        let mut zero = buf.clone();
        zero[0..8].copy_from_slice(&0u64.to_le_bytes());
        assert!(matches!(
            SynapseLayer::read_from(&mut io::Cursor::new(&zero), PlasticityConfig::default()),
            Err(NetError::InvalidData(_))
        ));

        // Clear the first mask byte while its weight stays non-zero.
        let mut bad_mask = buf;
        let first_flag = bad_mask.len() - 4;
        bad_mask[first_flag] = 0;
        assert!(matches!(
            SynapseLayer::read_from(&mut io::Cursor::new(&bad_mask), PlasticityConfig::default()),
            Err(NetError::InvalidData(_))
        ));
    }

    #[test]
    fn oversized_record_widths_fail_cleanly() {
        // 2^31 x 2^31 connections with a matching weights prefix and no body.
        let mut buf = Vec::new();
        storage::write_u64_le(&mut buf, 1 << 31).unwrap();
        storage::write_u64_le(&mut buf, 1 << 31).unwrap();
        storage::write_u64_le(&mut buf, 1 << 62).unwrap();

        let res = SynapseLayer::read_from(&mut io::Cursor::new(&buf), PlasticityConfig::default());
        assert!(matches!(res, Err(NetError::InvalidData(_))));

        let res = SynapseLayer::read_expecting(
            &mut io::Cursor::new(&buf),
            PlasticityConfig::default(),
            2,
            1,
        );
        assert!(matches!(
            res,
            Err(NetError::DimensionMismatch {
                expected: 2,
                got: 2147483648,
                ..
            })
        ));
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn parallel_tier_is_bit_identical() {
        let mut scalar = SynapseLayer::new(37, 29, 4).unwrap();
        scalar.weights[3] = 1e-9;
        scalar.prune();
        let mut parallel = scalar.clone();
        parallel.set_execution_tier(ExecutionTier::Parallel);

        let input: Vec<f64> = (0..37).map(|i| (i as f64 * 0.37).sin()).collect();
        let grad_out: Vec<f64> = (0..29).map(|j| (j as f64 * 0.11).cos()).collect();

        let a = scalar.forward(&input, Activation::Tanh).unwrap().to_vec();
        let b = parallel.forward(&input, Activation::Tanh).unwrap().to_vec();
        assert_eq!(a, b);

        let ga = scalar.backward(&input, &grad_out, Activation::Tanh).unwrap();
        let gb = parallel.backward(&input, &grad_out, Activation::Tanh).unwrap();
        assert_eq!(ga, gb);

        scalar
            .apply_update(&ga.weights, &ga.biases, 0.1, &input, &a)
            .unwrap();
        parallel
            .apply_update(&gb.weights, &gb.biases, 0.1, &input, &b)
            .unwrap();
        assert_eq!(scalar.weights(), parallel.weights());
        assert_eq!(scalar.eligibility_trace(), parallel.eligibility_trace());
    }
}
