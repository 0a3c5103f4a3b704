use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::activation::Activation;

/// Execution tier for forward and backward passes.
///
/// - `Scalar`: single-threaded (default, works everywhere)
/// - `Parallel`: neuron-parallel via rayon (requires the `parallel` feature)
///
/// Both tiers produce bit-identical results: each neuron accumulates its own row in
/// input order and input gradients accumulate over neurons in ascending order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ExecutionTier {
    #[default]
    Scalar,
    Parallel,
}

impl ExecutionTier {
    /// The tier that will actually run, accounting for compile-time features.
    pub fn effective(self) -> ExecutionTier {
        match self {
            ExecutionTier::Scalar => ExecutionTier::Scalar,
            ExecutionTier::Parallel => {
                #[cfg(feature = "parallel")]
                {
                    ExecutionTier::Parallel
                }
                #[cfg(not(feature = "parallel"))]
                {
                    ExecutionTier::Scalar
                }
            }
        }
    }
}

impl FromStr for ExecutionTier {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scalar" => Ok(ExecutionTier::Scalar),
            "parallel" => Ok(ExecutionTier::Parallel),
            _ => Err("unknown execution tier (expected scalar|parallel)"),
        }
    }
}

/// Constants of the composite update rule, shared by every layer of a network.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PlasticityConfig {
    /// Scale of the Hebbian term `input * output * plasticity_rate`.
    pub hebbian_rate: f64,
    /// Scale of the pull toward each neuron's homeostatic target.
    pub homeostatic_strength: f64,
    /// Per-update multiplicative decay of eligibility traces.
    pub decay_rate: f64,
    /// Connections with `|w| < pruning_threshold` are masked out by `prune`.
    pub pruning_threshold: f64,

    // Per-synapse plasticity rates are drawn uniformly from [min, max).
    pub plasticity_rate_min: f64,
    pub plasticity_rate_max: f64,
}

impl Default for PlasticityConfig {
    fn default() -> Self {
        Self {
            hebbian_rate: 0.01,
            homeostatic_strength: 0.001,
            decay_rate: 0.95,
            pruning_threshold: 1e-4,
            plasticity_rate_min: 0.001,
            plasticity_rate_max: 0.02,
        }
    }
}

impl PlasticityConfig {
    /// Validate the configuration, returning an error message if invalid.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.hebbian_rate.is_finite() || self.hebbian_rate < 0.0 {
            return Err("hebbian_rate must be finite and >= 0");
        }
        if !self.homeostatic_strength.is_finite() || self.homeostatic_strength < 0.0 {
            return Err("homeostatic_strength must be finite and >= 0");
        }
        if !(self.decay_rate.is_finite() && (0.0..=1.0).contains(&self.decay_rate)) {
            return Err("decay_rate must be in [0, 1]");
        }
        if !self.pruning_threshold.is_finite() || self.pruning_threshold < 0.0 {
            return Err("pruning_threshold must be finite and >= 0");
        }
        if !(self.plasticity_rate_min.is_finite() && self.plasticity_rate_max.is_finite()) {
            return Err("plasticity rate band must be finite");
        }
        if self.plasticity_rate_min < 0.0 || self.plasticity_rate_max < self.plasticity_rate_min
        {
            return Err("plasticity rate band must satisfy 0 <= min <= max");
        }
        Ok(())
    }

    pub fn with_hebbian_rate(mut self, rate: f64) -> Self {
        self.hebbian_rate = rate;
        self
    }

    pub fn with_homeostatic_strength(mut self, strength: f64) -> Self {
        self.homeostatic_strength = strength;
        self
    }

    pub fn with_decay_rate(mut self, decay: f64) -> Self {
        self.decay_rate = decay;
        self
    }

    pub fn with_pruning_threshold(mut self, threshold: f64) -> Self {
        self.pruning_threshold = threshold;
        self
    }

    pub fn with_plasticity_rate_band(mut self, min: f64, max: f64) -> Self {
        self.plasticity_rate_min = min;
        self.plasticity_rate_max = max;
        self
    }
}

/// Supervised training parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,

    /// Reorder samples at the start of every epoch.
    pub shuffle: bool,
    /// Seed for the shuffle order.
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 1,
            learning_rate: 0.01,
            shuffle: false,
            seed: 1,
        }
    }
}

impl TrainConfig {
    pub fn new(epochs: usize, batch_size: usize, learning_rate: f64) -> Self {
        Self {
            epochs,
            batch_size,
            learning_rate,
            ..Default::default()
        }
    }

    /// Enable per-epoch shuffling with the given seed.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.batch_size == 0 {
            return Err("batch_size must be >= 1");
        }
        if !self.learning_rate.is_finite() {
            return Err("learning_rate must be finite");
        }
        Ok(())
    }
}

/// Everything needed to build a [`crate::network::PlasticNetwork`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetworkConfig {
    /// Boundary widths: input width first, output width last.
    pub layer_widths: Vec<usize>,
    pub hidden_activation: Activation,
    pub output_activation: Activation,
    pub seed: u64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub plasticity: PlasticityConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub tier: ExecutionTier,
}

impl NetworkConfig {
    /// Relu hidden layers, linear output, default plasticity.
    pub fn with_widths(layer_widths: &[usize]) -> Self {
        Self {
            layer_widths: layer_widths.to_vec(),
            hidden_activation: Activation::Relu,
            output_activation: Activation::Linear,
            seed: 1,
            plasticity: PlasticityConfig::default(),
            tier: ExecutionTier::default(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_activations(mut self, hidden: Activation, output: Activation) -> Self {
        self.hidden_activation = hidden;
        self.output_activation = output;
        self
    }

    pub fn with_plasticity(mut self, plasticity: PlasticityConfig) -> Self {
        self.plasticity = plasticity;
        self
    }

    pub fn with_tier(mut self, tier: ExecutionTier) -> Self {
        self.tier = tier;
        self
    }

    /// Estimated layer memory in bytes: weights, traces, rates and mask per connection,
    /// plus biases, homeostatic targets and the two activation caches per neuron.
    #[must_use]
    pub fn estimated_memory_bytes(&self) -> usize {
        const F64: usize = core::mem::size_of::<f64>();
        self.layer_widths
            .windows(2)
            .map(|w| {
                let conns = w[0].saturating_mul(w[1]);
                let per_conn = 3 * F64 + core::mem::size_of::<bool>();
                conns
                    .saturating_mul(per_conn)
                    .saturating_add(w[1].saturating_mul(4 * F64))
            })
            .fold(0usize, usize::saturating_add)
    }
}
