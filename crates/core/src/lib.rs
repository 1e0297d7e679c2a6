#![doc = include_str!("../README.md")]

pub mod frame;
pub mod geometry;
pub mod ids;
pub mod metrics;
pub mod params;
pub mod queue;
pub mod region;

pub mod prelude {
    pub use crate::{
        frame::{Frame, FramePool, ShotMapState, TapBuffer, TapQueue, TapRequest},
        geometry::{
            ChainGeometry, ChainSegment, CropRect, Margins, PixelSize, RATIO_ONE, SCALE_DOWN_MAX,
            SCALE_UP_MAX, SensorGeometry, apply_ratio, clamp_scale, round_down_even,
        },
        ids::{ChainId, GroupSlot, InstanceId, SensorModuleId, TAP_COUNT, TapId},
        metrics::{ChainCounters, ChainCountersSnapshot},
        params::{
            ControlParam, DeltaMask, DmaOutputParam, EffectParam, OtfInputParam, OtfOutputParam,
            PARAM_BLOCK_SLOTS, PARAM_BLOCK_WORDS, PARAM_CMD_DISABLE, PARAM_CMD_ENABLE,
            ParamBlockId, SetfileWord,
        },
        queue::{CompletionQueue, CompletionStatus, PushOutcome, ShotCompletion},
        region::{NullSync, ParamTable, ParameterRegion, RegionSync},
    };
}
