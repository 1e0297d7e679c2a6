use std::sync::Arc;

use acheron::prelude::*;
use acheron_core::ids::ChainId;

fn main() -> Result<(), ChainError> {
    let completions = CompletionQueue::with_capacity(8);
    let engine = Arc::new(VirtualEngine::new(completions.clone()));

    let mut chain = IspChainBuilder::new(InstanceId(0), engine)
        .completions(completions)
        .open()?;
    chain.init(
        SensorModuleId(0x2177),
        SensorGeometry {
            output: PixelSize::new(4128, 3096),
            margins: Margins::new(16, 16, 12, 12),
            binning: RATIO_ONE,
            bns: PixelSize::default(),
            framerate: 30,
        },
    )?;

    let active = PixelSize::new(4096, 3072);
    let out = PixelSize::new(2560, 1920);
    chain.negotiate_stage0(CropRect::full(active), CropRect::centered(active, out))?;
    chain.negotiate_stage1(out)?;
    chain.negotiate_stage2(out)?;
    chain.negotiate_stage3(PixelSize::new(1280, 720))?;

    for ratio in [1000u32, 1500, 2000, 4000] {
        chain.set_zoom(ratio)?;
        let geometry = chain.chain_geometry();
        let crop = geometry.segment(ChainId::Chain0).crop;
        println!(
            "zoom {:.1}x -> chain0 crop {} -> chain1 output {}",
            ratio as f64 / 1000.0,
            crop,
            geometry.segment(ChainId::Chain1).output
        );
    }

    // Out-of-range chain3 requests clamp instead of failing.
    let outcome = chain.negotiate_stage3(PixelSize::new(64, 48))?;
    println!(
        "tiny request corrected to {} (clamped: {})",
        outcome.output, outcome.clamped
    );

    chain.close()
}
