#![doc = include_str!("../README.md")]

pub use acheron_core as core;
pub use acheron_engine as engine;

pub use thiserror;

pub mod device;
pub mod error;
pub mod group;
pub mod metrics;
pub mod negotiator;
mod setfile;
pub mod shot;
pub mod tap;
pub mod tunables;

pub use error::ChainError;

pub mod prelude {
    pub use crate::device::{IspChain, IspChainBuilder, LifecycleState, SharedHardware};
    pub use crate::error::ChainError;
    pub use crate::group::{Group, GroupState};
    pub use crate::metrics::{PipelineMetrics, StageMetrics};
    pub use crate::negotiator::{Stage3Outcome, StageNegotiator};
    pub use crate::shot::SHOT_METADATA_BYTES;
    pub use crate::tap::{CaptureTap, TapState};
    pub use crate::tunables::{ChainTunables, chain_tunables, set_chain_tunables};
    pub use acheron_engine::prelude::*;
}
