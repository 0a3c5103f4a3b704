use crate::activation::Activation;
use crate::layer::SynapseLayer;
use crate::network::PlasticNetwork;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Summary statistics for one layer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct LayerDiagnostics {
    pub input_width: usize,
    pub output_width: usize,
    pub active_connections: usize,
    pub pruned_connections: usize,

    // Means over active connections only; 0.0 when every connection is pruned.
    pub mean_abs_weight: f64,
    pub mean_eligibility: f64,

    pub mean_homeostatic_target: f64,
}

impl LayerDiagnostics {
    pub fn of(layer: &SynapseLayer) -> Self {
        let mut active = 0usize;
        let mut abs_weight = 0.0;
        let mut eligibility = 0.0;
        for ((&w, &t), &m) in layer
            .weights()
            .iter()
            .zip(layer.eligibility_trace())
            .zip(layer.pruning_mask())
        {
            if m {
                active += 1;
                abs_weight += w.abs();
                eligibility += t;
            }
        }
        let total = layer.pruning_mask().len();
        let targets = layer.homeostatic_targets();

        Self {
            input_width: layer.input_width(),
            output_width: layer.output_width(),
            active_connections: active,
            pruned_connections: total - active,
            mean_abs_weight: mean(abs_weight, active),
            mean_eligibility: mean(eligibility, active),
            mean_homeostatic_target: mean(targets.iter().sum(), targets.len()),
        }
    }
}

/// A read-only snapshot of a network's structure and plastic state.
///
/// Snapshots are taken on demand and allocate; training is never affected.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct NetworkSnapshot {
    pub layer_widths: Vec<usize>,
    pub hidden_activation: Activation,
    pub output_activation: Activation,
    pub plasticity_enabled: bool,
    pub total_connections: usize,
    pub active_connections: usize,
    pub layers: Vec<LayerDiagnostics>,
}

impl NetworkSnapshot {
    /// Fraction of connections that survive pruning.
    pub fn density(&self) -> f64 {
        if self.total_connections == 0 {
            return 0.0;
        }
        self.active_connections as f64 / self.total_connections as f64
    }

    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub struct NetworkAdapter<'a> {
    net: &'a PlasticNetwork,
}

impl<'a> NetworkAdapter<'a> {
    pub fn new(net: &'a PlasticNetwork) -> Self {
        Self { net }
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        let layers: Vec<LayerDiagnostics> =
            self.net.layers().iter().map(LayerDiagnostics::of).collect();
        let active_connections = layers.iter().map(|l| l.active_connections).sum();
        let total_connections = layers
            .iter()
            .map(|l| l.active_connections + l.pruned_connections)
            .sum();

        NetworkSnapshot {
            layer_widths: self.net.layer_widths(),
            hidden_activation: self.net.hidden_activation(),
            output_activation: self.net.output_activation(),
            plasticity_enabled: self.net.plasticity_enabled(),
            total_connections,
            active_connections,
            layers,
        }
    }
}

fn mean(sum: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
