use std::io::{self, Read, Write};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::activation::Activation;
use crate::config::{ExecutionTier, NetworkConfig, PlasticityConfig, TrainConfig};
use crate::error::{NetError, Result};
use crate::layer::{Gradients, SynapseLayer};
use crate::prng::Prng;
use crate::storage;

/// Per-epoch training summary.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrainReport {
    /// Mean squared error over all samples, one entry per epoch, measured on the
    /// forward pass that produced each sample's gradient.
    pub epoch_losses: Vec<f64>,
}

impl TrainReport {
    pub fn final_loss(&self) -> Option<f64> {
        self.epoch_losses.last().copied()
    }
}

/// An ordered stack of [`SynapseLayer`]s forming a feed-forward pipeline.
///
/// `layers[i].output_width() == layers[i + 1].input_width()` holds for every adjacent
/// pair. Hidden layers use `hidden_activation`; the last layer uses `output_activation`.
#[derive(Debug, Clone)]
pub struct PlasticNetwork {
    layers: Vec<SynapseLayer>,
    hidden_activation: Activation,
    output_activation: Activation,
    plasticity: PlasticityConfig,
    plasticity_enabled: bool,
    tier: ExecutionTier,

    // One buffer per layer boundary: the input, then every layer's output.
    forward_buffers: Vec<Vec<f64>>,
}

impl PlasticNetwork {
    /// Build a network from boundary widths (input width first, output width last).
    pub fn new(
        layer_widths: &[usize],
        hidden_activation: Activation,
        output_activation: Activation,
        seed: u64,
    ) -> Result<Self> {
        Self::from_config(
            NetworkConfig::with_widths(layer_widths)
                .with_activations(hidden_activation, output_activation)
                .with_seed(seed),
        )
    }

    pub fn from_config(cfg: NetworkConfig) -> Result<Self> {
        validate_topology(&cfg.layer_widths)?;
        cfg.plasticity.validate().map_err(NetError::InvalidConfig)?;

        debug!(
            widths = ?cfg.layer_widths,
            hidden = %cfg.hidden_activation,
            output = %cfg.output_activation,
            estimated_bytes = cfg.estimated_memory_bytes(),
            "building network"
        );

        // Each layer gets its own seed drawn from the network seed.
        let mut rng = Prng::new(cfg.seed);
        let mut layers = Vec::with_capacity(cfg.layer_widths.len() - 1);
        for pair in cfg.layer_widths.windows(2) {
            let mut layer =
                SynapseLayer::with_config(pair[0], pair[1], rng.next_u64(), cfg.plasticity)?;
            layer.set_execution_tier(cfg.tier);
            layers.push(layer);
        }

        let mut net = Self {
            forward_buffers: boundary_buffers(&cfg.layer_widths),
            layers,
            hidden_activation: cfg.hidden_activation,
            output_activation: cfg.output_activation,
            plasticity: cfg.plasticity,
            plasticity_enabled: true,
            tier: ExecutionTier::Scalar,
        };
        net.set_execution_tier(cfg.tier);
        Ok(net)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn input_width(&self) -> usize {
        self.layers.first().map_or(0, SynapseLayer::input_width)
    }

    pub fn output_width(&self) -> usize {
        self.layers.last().map_or(0, SynapseLayer::output_width)
    }

    /// Boundary widths, input first.
    pub fn layer_widths(&self) -> Vec<usize> {
        let mut widths = Vec::with_capacity(self.layers.len() + 1);
        widths.push(self.input_width());
        widths.extend(self.layers.iter().map(SynapseLayer::output_width));
        widths
    }

    pub fn layers(&self) -> &[SynapseLayer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&SynapseLayer> {
        self.layers.get(index)
    }

    pub fn hidden_activation(&self) -> Activation {
        self.hidden_activation
    }

    pub fn output_activation(&self) -> Activation {
        self.output_activation
    }

    pub fn plasticity(&self) -> &PlasticityConfig {
        &self.plasticity
    }

    /// When disabled, training applies only the gradient step; Hebbian, trace and
    /// homeostatic terms are skipped.
    pub fn set_plasticity(&mut self, enabled: bool) {
        self.plasticity_enabled = enabled;
    }

    pub fn plasticity_enabled(&self) -> bool {
        self.plasticity_enabled
    }

    pub fn set_execution_tier(&mut self, tier: ExecutionTier) {
        let effective = tier.effective();
        if effective != tier {
            warn!(
                "Requested execution tier {:?} but using {:?} (feature unavailable)",
                tier, effective
            );
        }
        self.tier = tier;
        for layer in &mut self.layers {
            layer.set_execution_tier(tier);
        }
    }

    pub fn execution_tier(&self) -> ExecutionTier {
        self.tier
    }

    /// The tier that will actually run, accounting for compile-time features.
    pub fn effective_execution_tier(&self) -> ExecutionTier {
        self.tier.effective()
    }

    #[inline]
    fn activation_for(&self, layer_index: usize) -> Activation {
        if layer_index + 1 == self.layers.len() {
            self.output_activation
        } else {
            self.hidden_activation
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inference
    // ─────────────────────────────────────────────────────────────────────────

    /// Feed `input` through every layer. Pure: layer caches are not touched.
    pub fn predict(&self, input: &[f64]) -> Result<Vec<f64>> {
        if input.len() != self.input_width() {
            return Err(NetError::mismatch(
                "predict input",
                self.input_width(),
                input.len(),
            ));
        }

        let mut current = input.to_vec();
        let mut pre = Vec::new();
        let mut next = Vec::new();
        for (idx, layer) in self.layers.iter().enumerate() {
            pre.resize(layer.output_width(), 0.0);
            next.resize(layer.output_width(), 0.0);
            layer.evaluate(&current, self.activation_for(idx), &mut pre, &mut next)?;
            core::mem::swap(&mut current, &mut next);
        }
        Ok(current)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Training
    // ─────────────────────────────────────────────────────────────────────────

    /// Supervised mini-batch training on mean squared error.
    ///
    /// See [`train_with`](Self::train_with).
    pub fn train<X, Y>(
        &mut self,
        inputs: &[X],
        targets: &[Y],
        epochs: usize,
        batch_size: usize,
        learning_rate: f64,
    ) -> Result<TrainReport>
    where
        X: AsRef<[f64]>,
        Y: AsRef<[f64]>,
    {
        self.train_with(
            inputs,
            targets,
            &TrainConfig::new(epochs, batch_size, learning_rate),
        )
    }

    /// Supervised mini-batch training on mean squared error.
    ///
    /// Every sample is validated before any parameter changes. For each mini-batch,
    /// gradients are summed over its samples and scaled by `1 / samples_in_batch`; each
    /// layer then takes one [`SynapseLayer::apply_update`] whose Hebbian and homeostatic
    /// terms see the activity of the *last* sample in the batch, not a batch average.
    pub fn train_with<X, Y>(
        &mut self,
        inputs: &[X],
        targets: &[Y],
        cfg: &TrainConfig,
    ) -> Result<TrainReport>
    where
        X: AsRef<[f64]>,
        Y: AsRef<[f64]>,
    {
        cfg.validate().map_err(NetError::InvalidConfig)?;
        if inputs.len() != targets.len() {
            return Err(NetError::mismatch(
                "training targets",
                inputs.len(),
                targets.len(),
            ));
        }
        for x in inputs {
            let got = x.as_ref().len();
            if got != self.input_width() {
                return Err(NetError::mismatch("training input", self.input_width(), got));
            }
        }
        for y in targets {
            let got = y.as_ref().len();
            if got != self.output_width() {
                return Err(NetError::mismatch(
                    "training target",
                    self.output_width(),
                    got,
                ));
            }
        }

        let mut report = TrainReport::default();
        let sample_count = inputs.len();
        if sample_count == 0 {
            return Ok(report);
        }

        let mut order: Vec<usize> = (0..sample_count).collect();
        let mut rng = Prng::new(cfg.seed);
        let mut grads: Vec<Gradients> = self.layers.iter().map(Gradients::for_layer).collect();
        let mut upstream = Vec::with_capacity(self.output_width());

        for epoch in 0..cfg.epochs {
            if cfg.shuffle {
                rng.shuffle(&mut order);
            }

            let mut loss_sum = 0.0;
            for batch in order.chunks(cfg.batch_size) {
                for g in &mut grads {
                    g.clear();
                }
                for &s in batch {
                    loss_sum += self.accumulate_sample(
                        inputs[s].as_ref(),
                        targets[s].as_ref(),
                        &mut grads,
                        &mut upstream,
                    )?;
                }

                let scale = 1.0 / batch.len() as f64;
                let plastic = self.plasticity_enabled;
                for (idx, (layer, g)) in self.layers.iter_mut().zip(&mut grads).enumerate() {
                    g.scale(scale);
                    let hebb_in = &self.forward_buffers[idx];
                    let hebb_out = &self.forward_buffers[idx + 1];
                    if plastic {
                        layer.apply_update(
                            &g.weights,
                            &g.biases,
                            cfg.learning_rate,
                            hebb_in,
                            hebb_out,
                        )?;
                    } else {
                        layer.apply_gradient_only(
                            &g.weights,
                            &g.biases,
                            cfg.learning_rate,
                            hebb_in,
                            hebb_out,
                        )?;
                    }
                }
            }

            let epoch_loss = loss_sum / sample_count as f64;
            debug!(epoch, loss = epoch_loss, "training epoch complete");
            report.epoch_losses.push(epoch_loss);
        }
        Ok(report)
    }

    /// Cached forward pass and backward pass for one sample. Weight/bias gradients are
    /// added into `grads`; returns the sample's mean squared error.
    fn accumulate_sample(
        &mut self,
        input: &[f64],
        target: &[f64],
        grads: &mut [Gradients],
        upstream: &mut Vec<f64>,
    ) -> Result<f64> {
        let layer_count = self.layers.len();

        self.forward_buffers[0].copy_from_slice(input);
        for idx in 0..layer_count {
            let act = self.activation_for(idx);
            let (done, rest) = self.forward_buffers.split_at_mut(idx + 1);
            let out = self.layers[idx].forward(&done[idx], act)?;
            rest[0].copy_from_slice(out);
        }

        // dL/dy for L = sum((y - t)^2) / 2.
        let prediction = &self.forward_buffers[layer_count];
        upstream.clear();
        upstream.extend(prediction.iter().zip(target).map(|(p, t)| p - t));
        let loss = upstream.iter().map(|e| e * e).sum::<f64>() / upstream.len() as f64;

        for idx in (0..layer_count).rev() {
            let act = self.activation_for(idx);
            let g = &mut grads[idx];
            self.layers[idx].backward_accumulate(
                &self.forward_buffers[idx],
                upstream.as_slice(),
                act,
                &mut g.input,
                &mut g.weights,
                &mut g.biases,
            )?;
            upstream.clear();
            upstream.extend_from_slice(&g.input);
        }
        Ok(loss)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Consolidation / pruning
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply [`SynapseLayer::consolidate`] to every layer with the same scores.
    pub fn consolidate(&mut self, importance_scores: &[f64]) {
        for layer in &mut self.layers {
            layer.consolidate(importance_scores);
        }
        debug!(
            scores = importance_scores.len(),
            layers = self.layers.len(),
            "consolidated"
        );
    }

    /// Prune every layer; returns the total number of connections masked out.
    pub fn prune(&mut self) -> usize {
        let pruned: usize = self.layers.iter_mut().map(SynapseLayer::prune).sum();
        let active: usize = self.layers.iter().map(SynapseLayer::active_connections).sum();
        info!(pruned, active, "pruned synapses");
        pruned
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Serialization: flat stream
    // ─────────────────────────────────────────────────────────────────────────

    /// Write every layer's raw record in order. No header: the reader must already
    /// hold a network of the same topology.
    pub fn save_to<W: Write>(&self, w: &mut W) -> Result<()> {
        for layer in &self.layers {
            layer.write_to(w)?;
        }
        Ok(())
    }

    /// Restore every layer from a stream written by [`save_to`](Self::save_to).
    ///
    /// Requires a network built with the same layer widths. Each record's widths are
    /// checked against this network's topology. Layers are decoded into scratch storage
    /// and swapped in only after the whole stream has been read, so a failed load
    /// leaves the network unchanged.
    pub fn load_from<R: Read>(&mut self, r: &mut R) -> Result<()> {
        let mut loaded = Vec::with_capacity(self.layers.len());
        for current in &self.layers {
            let mut layer = SynapseLayer::read_expecting(
                r,
                self.plasticity,
                current.input_width(),
                current.output_width(),
            )?;
            layer.set_execution_tier(self.tier);
            loaded.push(layer);
        }
        self.layers = loaded;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Serialization: versioned image
    // ─────────────────────────────────────────────────────────────────────────

    /// Serialize a versioned, chunked network image that carries its own topology.
    pub fn save_image_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(storage::MAGIC)?;
        storage::write_u32_le(w, storage::VERSION_CURRENT)?;

        let mut payload = Vec::new();
        self.write_topology_payload(&mut payload)?;
        storage::write_chunk_lz4(w, *b"TOPO", &payload)?;

        payload.clear();
        self.write_plasticity_payload(&mut payload)?;
        storage::write_chunk_lz4(w, *b"PLST", &payload)?;

        for layer in &self.layers {
            payload.clear();
            layer.write_to(&mut payload)?;
            storage::write_chunk_lz4(w, *b"LAYR", &payload)?;
        }
        Ok(())
    }

    /// Load a network image written by [`save_image_to`](Self::save_image_to).
    ///
    /// Unknown chunks are skipped for forward-compatibility.
    pub fn load_image_from<R: Read>(r: &mut R) -> Result<Self> {
        let magic = storage::read_exact::<8, _>(r)?;
        if &magic != storage::MAGIC {
            return Err(NetError::InvalidData("bad network image magic".to_string()));
        }
        let version = storage::read_u32_le(r)?;
        if version != storage::VERSION_CURRENT {
            return Err(NetError::InvalidData(format!(
                "unsupported network image version {version}"
            )));
        }

        let mut topology: Option<(Vec<usize>, Activation, Activation)> = None;
        let mut plasticity: Option<(PlasticityConfig, bool)> = None;
        let mut records: Vec<Vec<u8>> = Vec::new();

        loop {
            let (tag, len) = match storage::read_chunk_header(r) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let payload = storage::read_chunk_payload(r, len)?;
            let mut cursor = io::Cursor::new(payload);
            match &tag {
                b"TOPO" => topology = Some(Self::read_topology_payload(&mut cursor)?),
                b"PLST" => plasticity = Some(Self::read_plasticity_payload(&mut cursor)?),
                b"LAYR" => records.push(cursor.into_inner()),
                _ => {
                    // Unknown chunk: skipped.
                }
            }
        }

        let (widths, hidden_activation, output_activation) = topology
            .ok_or_else(|| NetError::InvalidData("missing TOPO chunk".to_string()))?;
        let (plasticity, plasticity_enabled) =
            plasticity.ok_or_else(|| NetError::InvalidData("missing PLST chunk".to_string()))?;
        validate_topology(&widths)?;
        plasticity.validate().map_err(NetError::InvalidConfig)?;

        let expected_layers = widths.len() - 1;
        if records.len() < expected_layers {
            return Err(NetError::SerializationTruncated);
        }
        if records.len() > expected_layers {
            return Err(NetError::InvalidData(format!(
                "image holds {} layers, topology expects {expected_layers}",
                records.len()
            )));
        }

        let mut layers = Vec::with_capacity(expected_layers);
        for (idx, record) in records.iter().enumerate() {
            let layer = SynapseLayer::read_expecting(
                &mut io::Cursor::new(record),
                plasticity,
                widths[idx],
                widths[idx + 1],
            )
            .map_err(|e| match e {
                NetError::DimensionMismatch {
                    context,
                    expected,
                    got,
                } => NetError::InvalidData(format!(
                    "layer {idx}: {context} is {got}, topology says {expected}"
                )),
                other => other,
            })?;
            layers.push(layer);
        }

        info!(
            layers = layers.len(),
            widths = ?widths,
            hidden = %hidden_activation,
            output = %output_activation,
            "network image loaded"
        );
        Ok(Self {
            forward_buffers: boundary_buffers(&widths),
            layers,
            hidden_activation,
            output_activation,
            plasticity,
            plasticity_enabled,
            tier: ExecutionTier::default(),
        })
    }

    /// Exact serialized size in bytes for the current network image.
    pub fn image_size_bytes(&self) -> Result<usize> {
        let mut cw = storage::CountingWriter::new();
        self.save_image_to(&mut cw)?;
        Ok(cw.written())
    }

    pub fn save_image_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.save_image_to(&mut buf)?;
        Ok(buf)
    }

    pub fn load_image_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = io::Cursor::new(bytes);
        Self::load_image_from(&mut cursor)
    }

    fn write_topology_payload<W: Write>(&self, w: &mut W) -> Result<()> {
        let widths = self.layer_widths();
        storage::write_u32_le(w, widths.len() as u32)?;
        for width in widths {
            storage::write_u64_le(w, width as u64)?;
        }
        storage::write_u8(w, self.hidden_activation.code())?;
        storage::write_u8(w, self.output_activation.code())?;
        Ok(())
    }

    fn read_topology_payload<R: Read>(r: &mut R) -> Result<(Vec<usize>, Activation, Activation)> {
        let count = storage::read_u32_le(r)? as usize;
        if count < 2 {
            return Err(NetError::InvalidTopology(format!(
                "image lists {count} widths, need at least 2"
            )));
        }
        let mut widths = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let raw = storage::read_u64_le(r)?;
            let width = usize::try_from(raw)
                .map_err(|_| NetError::InvalidData(format!("width {raw} does not fit")))?;
            widths.push(width);
        }
        let hidden = read_activation(r)?;
        let output = read_activation(r)?;
        Ok((widths, hidden, output))
    }

    fn write_plasticity_payload<W: Write>(&self, w: &mut W) -> Result<()> {
        let p = &self.plasticity;
        storage::write_f64_le(w, p.hebbian_rate)?;
        storage::write_f64_le(w, p.homeostatic_strength)?;
        storage::write_f64_le(w, p.decay_rate)?;
        storage::write_f64_le(w, p.pruning_threshold)?;
        storage::write_f64_le(w, p.plasticity_rate_min)?;
        storage::write_f64_le(w, p.plasticity_rate_max)?;
        storage::write_u8(w, u8::from(self.plasticity_enabled))?;
        Ok(())
    }

    fn read_plasticity_payload<R: Read>(r: &mut R) -> Result<(PlasticityConfig, bool)> {
        let cfg = PlasticityConfig {
            hebbian_rate: storage::read_f64_le(r)?,
            homeostatic_strength: storage::read_f64_le(r)?,
            decay_rate: storage::read_f64_le(r)?,
            pruning_threshold: storage::read_f64_le(r)?,
            plasticity_rate_min: storage::read_f64_le(r)?,
            plasticity_rate_max: storage::read_f64_le(r)?,
        };
        let enabled = storage::read_u8(r)? != 0;
        Ok((cfg, enabled))
    }

    #[cfg(test)]
    pub(crate) fn layer_mut(&mut self, index: usize) -> &mut SynapseLayer {
        &mut self.layers[index]
    }
}

fn validate_topology(widths: &[usize]) -> Result<()> {
    if widths.len() < 2 {
        return Err(NetError::InvalidTopology(format!(
            "need at least 2 layer widths, got {}",
            widths.len()
        )));
    }
    if let Some(pos) = widths.iter().position(|&w| w == 0) {
        return Err(NetError::InvalidTopology(format!(
            "layer width at position {pos} is zero"
        )));
    }
    Ok(())
}

fn boundary_buffers(widths: &[usize]) -> Vec<Vec<f64>> {
    widths.iter().map(|&w| vec![0.0; w]).collect()
}

fn read_activation<R: Read>(r: &mut R) -> Result<Activation> {
    let code = storage::read_u8(r)?;
    Activation::from_code(code)
        .ok_or_else(|| NetError::InvalidData(format!("unknown activation code {code}")))
}
