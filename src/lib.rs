//! # plastinet
//!
//! Feed-forward neural networks whose synapses learn by more than backpropagation.
//!
//! Every connection carries its own plastic state. Each update combines a gradient step
//! with a Hebbian term, an eligibility trace and a homeostatic pull toward a per-neuron
//! target. Weak synapses can be pruned permanently, and importance scores can
//! consolidate the connections that matter.
//!
//! ## Quick Start
//!
//! ```
//! use plastinet::prelude::*;
//!
//! let mut net = PlasticNetwork::new(&[2, 8, 1], Activation::Relu, Activation::Linear, 42)?;
//!
//! let inputs = [[0.0, 1.0], [1.0, 0.0]];
//! let targets = [[1.0], [0.0]];
//! let report = net.train(&inputs, &targets, 100, 2, 0.05)?;
//! println!("final loss: {:?}", report.final_loss());
//!
//! net.consolidate(&[0.9, 0.1]);
//! let pruned = net.prune();
//!
//! let y = net.predict(&[0.0, 1.0])?;
//! assert_eq!(y.len(), 1);
//!
//! let mut buf = Vec::new();
//! net.save_to(&mut buf)?;
//! # let _ = pruned;
//! # Ok::<(), plastinet::error::NetError>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): serialize configs, training reports and snapshots
//! - `parallel`: neuron-parallel execution via rayon
//!
//! ## Modules
//!
//! - [`layer`]: a single plastic layer
//! - [`network`]: layer stack, training and persistence
//! - [`config`]: plasticity, training and network configuration
//! - [`activation`]: activation functions
//! - [`storage`]: binary encoding helpers
//! - [`observer`]: read-only diagnostics

#[path = "core/activation.rs"]
pub mod activation;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/layer.rs"]
pub mod layer;

#[path = "core/network.rs"]
pub mod network;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/storage.rs"]
pub mod storage;

pub mod observer;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::activation::Activation;
    pub use crate::config::{ExecutionTier, NetworkConfig, PlasticityConfig, TrainConfig};
    pub use crate::error::NetError;
    pub use crate::layer::{Gradients, SynapseLayer};
    pub use crate::network::{PlasticNetwork, TrainReport};
    pub use crate::observer::{LayerDiagnostics, NetworkAdapter, NetworkSnapshot};
}
