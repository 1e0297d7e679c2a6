use std::fmt;

/// One of the four geometrically coupled pipeline segments.
///
/// # Example
/// ```rust
/// use acheron_core::prelude::ChainId;
///
/// assert_eq!(ChainId::Chain0.index(), 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ChainId {
    /// Bayer crop through demosaic input.
    Chain0,
    /// Color-correction scale output through distortion compensation.
    Chain1,
    /// Stabilization output through temporal noise reduction.
    Chain2,
    /// Final scale/crop through face detection.
    Chain3,
}

impl ChainId {
    pub const ALL: [ChainId; 4] = [
        ChainId::Chain0,
        ChainId::Chain1,
        ChainId::Chain2,
        ChainId::Chain3,
    ];

    /// Segment index in `0..4`.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The downstream segment, if any.
    pub const fn next(self) -> Option<ChainId> {
        match self {
            ChainId::Chain0 => Some(ChainId::Chain1),
            ChainId::Chain1 => Some(ChainId::Chain2),
            ChainId::Chain2 => Some(ChainId::Chain3),
            ChainId::Chain3 => None,
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain{}", self.index())
    }
}

/// Hardware group clusters addressed by engine commands.
///
/// A logical shot crosses the groups in `Bayer → Isp → Stabilizer` order;
/// the stabilizer group only participates when a stabilization tap was
/// requested for the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum GroupSlot {
    /// Bayer-domain 3A statistics and crop.
    Bayer,
    /// Demosaic and color correction.
    Isp,
    /// Stabilization, noise reduction, final scale.
    Stabilizer,
}

impl GroupSlot {
    pub const ALL: [GroupSlot; 3] = [GroupSlot::Bayer, GroupSlot::Isp, GroupSlot::Stabilizer];

    /// Stable index in `0..3`, also the bit used in per-frame group sets.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Bitmask bit for requested-group bookkeeping on a frame.
    pub const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// The next group in the completion chain.
    pub const fn next(self) -> Option<GroupSlot> {
        match self {
            GroupSlot::Bayer => Some(GroupSlot::Isp),
            GroupSlot::Isp => Some(GroupSlot::Stabilizer),
            GroupSlot::Stabilizer => None,
        }
    }
}

impl fmt::Display for GroupSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupSlot::Bayer => "3aa",
            GroupSlot::Isp => "isp",
            GroupSlot::Stabilizer => "dis",
        };
        f.write_str(name)
    }
}

/// Optional capture output taps along the pipeline.
///
/// Each tap can deliver a buffer to user space independent of the main
/// preview/capture path. The two bayer taps are companions: they share the
/// 3A stage's bounds-down-scale size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TapId {
    /// Raw bayer output after the 3A crop.
    BayerRaw,
    /// Processed bayer output after 3A.
    BayerProcessed,
    /// Output after color correction.
    ColorOut,
    /// Output after distortion correction.
    DistortionOut,
    /// Preview-sized output of the final scaler.
    ScalePreview,
    /// Capture-sized output of the final scaler.
    ScaleCapture,
}

/// Number of capture taps a frame carries bookkeeping for.
pub const TAP_COUNT: usize = 6;

impl TapId {
    pub const ALL: [TapId; TAP_COUNT] = [
        TapId::BayerRaw,
        TapId::BayerProcessed,
        TapId::ColorOut,
        TapId::DistortionOut,
        TapId::ScalePreview,
        TapId::ScaleCapture,
    ];

    /// Stable index in `0..TAP_COUNT`.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Bit in a frame's output-flag set.
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// The hardware group that owns this tap.
    ///
    /// The capture scaler completes with the ISP group; the distortion
    /// correction and preview scaler ride the stabilizer group.
    pub const fn group(self) -> GroupSlot {
        match self {
            TapId::BayerRaw | TapId::BayerProcessed => GroupSlot::Bayer,
            TapId::ColorOut | TapId::ScaleCapture => GroupSlot::Isp,
            TapId::DistortionOut | TapId::ScalePreview => GroupSlot::Stabilizer,
        }
    }

    /// Whether this tap shares the 3A bounds-down-scale size with a companion.
    pub const fn companion(self) -> Option<TapId> {
        match self {
            TapId::BayerRaw => Some(TapId::BayerProcessed),
            TapId::BayerProcessed => Some(TapId::BayerRaw),
            _ => None,
        }
    }
}

impl fmt::Display for TapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TapId::BayerRaw => "3ac",
            TapId::BayerProcessed => "3ap",
            TapId::ColorOut => "isp",
            TapId::DistortionOut => "odc",
            TapId::ScalePreview => "scp",
            TapId::ScaleCapture => "scc",
        };
        f.write_str(name)
    }
}

/// Identity of a bound sensor module, validated at `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorModuleId(pub u32);

/// Logical device instance sharing one physical power/firmware resource.
///
/// Instance 0 owns power-on and firmware load; later instances reuse them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstanceId(pub u32);

impl InstanceId {
    /// Whether this instance is responsible for shared bring-up.
    pub const fn owns_hardware(self) -> bool {
        self.0 == 0
    }
}
