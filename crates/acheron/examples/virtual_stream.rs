use std::sync::Arc;

use acheron::prelude::*;

fn main() -> Result<(), ChainError> {
    let completions = CompletionQueue::with_capacity(32);
    let engine = Arc::new(VirtualEngine::new(completions.clone()));

    let mut chain = IspChainBuilder::new(InstanceId(0), engine.clone())
        .completions(completions)
        .open()?;
    chain.init(SensorModuleId(0x2177), sensor())?;

    let active = PixelSize::new(4096, 3072);
    let preview = PixelSize::new(2560, 1920);
    chain.negotiate_stage0(CropRect::full(active), CropRect::centered(active, preview))?;
    chain.negotiate_stage1(preview)?;
    chain.negotiate_stage2(preview)?;
    let outcome = chain.negotiate_stage3(PixelSize::new(1280, 720))?;
    println!(
        "chain3 output {} (clamped: {})",
        outcome.output, outcome.clamped
    );

    chain.start_stream()?;

    // Queue destination buffers for the preview tap.
    for index in 0..8u32 {
        chain.tap_queue(TapId::ScalePreview).push(TapBuffer {
            index,
            address: 0x9000_0000 + index * 0x10_0000,
        });
    }

    let mut finished = 0;
    while finished < 8 {
        let count = chain.queue_frame(|frame| {
            frame.set_request(TapId::ScalePreview, PixelSize::new(1280, 720));
        })?;
        chain.shot_ready(GroupSlot::Bayer, count)?;

        // The virtual engine stands in for hardware interrupts here.
        while engine.complete_next() {
            chain.pump_completions()?;
        }
        finished += 1;
        println!("frame #{count} walked the full group chain");
    }

    let counters = chain.metrics().counters();
    println!(
        "shots={} skipped={} taps_dropped={} flushes={}",
        counters.shots_issued,
        counters.shots_skipped,
        counters.taps_dropped,
        counters.param_flushes
    );

    chain.close()
}

fn sensor() -> SensorGeometry {
    SensorGeometry {
        output: PixelSize::new(4128, 3096),
        margins: Margins::new(16, 16, 12, 12),
        binning: RATIO_ONE,
        bns: PixelSize::default(),
        framerate: 30,
    }
}
