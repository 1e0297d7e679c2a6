//! End-to-end chain tests driven by synthetic engine completions.

use std::sync::Arc;

use acheron::prelude::*;
use acheron_engine::virtual_engine::EngineCmd;

fn sensor() -> SensorGeometry {
    SensorGeometry {
        output: PixelSize::new(4128, 3096),
        margins: Margins::new(16, 16, 12, 12),
        binning: RATIO_ONE,
        bns: PixelSize::default(),
        framerate: 30,
    }
}

fn streaming_chain(reprocessing: bool) -> (IspChain, Arc<VirtualEngine>) {
    let completions = CompletionQueue::with_capacity(32);
    let engine = Arc::new(VirtualEngine::new(completions.clone()));
    let mut chain = IspChainBuilder::new(InstanceId(0), engine.clone())
        .completions(completions)
        .reprocessing(reprocessing)
        .open()
        .expect("open");
    chain
        .init(SensorModuleId(0x2177), sensor())
        .expect("init");

    let active = PixelSize::new(4096, 3072);
    let out = PixelSize::new(2560, 1920);
    chain
        .negotiate_stage0(CropRect::full(active), CropRect::centered(active, out))
        .expect("stage0");
    chain.negotiate_stage1(out).expect("stage1");
    chain.negotiate_stage2(out).expect("stage2");
    chain.negotiate_stage3(PixelSize::new(1280, 720)).expect("stage3");
    chain.start_stream().expect("stream on");
    (chain, engine)
}

fn shots(engine: &VirtualEngine) -> Vec<(GroupSlot, u64)> {
    engine
        .commands()
        .into_iter()
        .filter_map(|cmd| match cmd {
            EngineCmd::Shot { group, frame } => Some((group, frame)),
            _ => None,
        })
        .collect()
}

/// Drive every pending completion until the engine has none left.
fn drain(chain: &mut IspChain, engine: &VirtualEngine) {
    while engine.complete_next() {
        chain.pump_completions().expect("pump");
    }
}

#[test]
fn full_chain_runs_groups_in_order() {
    let (mut chain, engine) = streaming_chain(false);
    chain
        .tap_queue(TapId::ScalePreview)
        .push(TapBuffer {
            index: 0,
            address: 0x9000,
        });

    let count = chain
        .queue_frame(|frame| {
            frame.set_request(TapId::ScalePreview, PixelSize::new(1280, 720));
        })
        .expect("queue");
    chain.shot_ready(GroupSlot::Bayer, count).expect("bayer pass");
    drain(&mut chain, &engine);

    let shots = shots(&engine);
    assert_eq!(
        shots,
        vec![
            (GroupSlot::Bayer, count),
            (GroupSlot::Isp, count),
            (GroupSlot::Stabilizer, count),
        ]
    );
    // Frame returned to the free queue, tap buffer retired.
    assert_eq!(chain.group(GroupSlot::Bayer).pool().processing_len(), 0);
    assert_eq!(chain.tap_queue(TapId::ScalePreview).in_flight_len(), 0);
    assert_eq!(chain.metrics().counters().shots_issued, 3);
}

#[test]
fn chain_order_holds_under_concurrent_frames() {
    let (mut chain, engine) = streaming_chain(false);
    for index in 0..4 {
        chain.tap_queue(TapId::ScalePreview).push(TapBuffer {
            index,
            address: 0x9000 + index * 0x100,
        });
    }

    let first = chain
        .queue_frame(|frame| {
            frame.set_request(TapId::ScalePreview, PixelSize::new(1280, 720));
        })
        .expect("queue first");
    let second = chain
        .queue_frame(|frame| {
            frame.set_request(TapId::ScalePreview, PixelSize::new(1280, 720));
        })
        .expect("queue second");

    chain.shot_ready(GroupSlot::Bayer, first).expect("first bayer");
    // The bayer group frees up once the first completion lands.
    engine.complete_next();
    chain.pump_completions().expect("pump");
    chain.shot_ready(GroupSlot::Bayer, second).expect("second bayer");
    drain(&mut chain, &engine);

    for frame in [first, second] {
        let order: Vec<GroupSlot> = shots(&engine)
            .into_iter()
            .filter(|(_, count)| *count == frame)
            .map(|(group, _)| group)
            .collect();
        assert_eq!(
            order,
            vec![GroupSlot::Bayer, GroupSlot::Isp, GroupSlot::Stabilizer],
            "frame {frame} ran out of order"
        );
    }
}

#[test]
fn missing_buffer_drops_tap_but_not_frame() {
    let (mut chain, engine) = streaming_chain(false);
    // ColorOut requested with no destination buffer queued.
    let count = chain
        .queue_frame(|frame| {
            frame.set_request(TapId::ColorOut, PixelSize::new(2560, 1920));
        })
        .expect("queue");
    chain.shot_ready(GroupSlot::Bayer, count).expect("bayer pass");
    drain(&mut chain, &engine);

    // No stabilization tap was requested, so the frame finishes after ISP.
    let shots = shots(&engine);
    assert_eq!(shots, vec![(GroupSlot::Bayer, count), (GroupSlot::Isp, count)]);
    assert_eq!(chain.metrics().counters().taps_dropped, 1);
    assert_eq!(chain.group(GroupSlot::Bayer).pool().parked_len(), 0);
}

#[test]
fn transient_busy_is_retried() {
    let (mut chain, engine) = streaming_chain(false);
    engine.inject_busy(1);

    let count = chain.queue_frame(|_| {}).expect("queue");
    chain.shot_ready(GroupSlot::Bayer, count).expect("bayer pass");

    assert_eq!(chain.metrics().counters().shots_retried, 1);
    assert_eq!(chain.metrics().counters().shots_issued, 1);
}

#[test]
fn exhausted_busy_skips_frame_and_restores_delta() {
    let (mut chain, engine) = streaming_chain(false);
    // More busy responses than the default retry budget.
    engine.inject_busy(8);

    let pending_before = *chain.pending_delta();
    assert!(!pending_before.is_empty(), "negotiation left pending blocks");

    let count = chain.queue_frame(|_| {}).expect("queue");
    let err = chain.shot_ready(GroupSlot::Bayer, count).unwrap_err();
    assert_eq!(err.code(), "shot_dispatch");

    // The frame is parked, not lost; the delta is resendable.
    assert_eq!(chain.group(GroupSlot::Bayer).pool().parked_len(), 1);
    assert_eq!(chain.metrics().counters().shots_skipped, 1);
    assert_eq!(chain.pending_delta().lo, pending_before.lo);
    assert_eq!(chain.pending_delta().hi, pending_before.hi);
    assert_eq!(
        chain.group(GroupSlot::Bayer).pool().reclaim_parked(),
        Some(count)
    );
}

#[test]
fn reprocessing_chain_ends_after_isp() {
    let (mut chain, engine) = streaming_chain(true);
    let count = chain.queue_frame(|_| {}).expect("queue");
    chain.shot_ready(GroupSlot::Bayer, count).expect("bayer pass");
    drain(&mut chain, &engine);

    let shots = shots(&engine);
    assert_eq!(shots, vec![(GroupSlot::Bayer, count), (GroupSlot::Isp, count)]);
}

#[test]
fn frame_scoped_setfile_swap_runs_once() {
    let (mut chain, engine) = streaming_chain(false);
    let word = SetfileWord::pack(7, [2, 1, 1]);

    let count = chain
        .queue_frame(|frame| {
            frame.setfile = Some(word);
        })
        .expect("queue");
    chain.shot_ready(GroupSlot::Bayer, count).expect("bayer pass");
    drain(&mut chain, &engine);

    assert_eq!(chain.active_setfile(), word);
    assert_eq!(chain.metrics().counters().setfile_swaps, 1);
    let log = engine.commands();
    assert!(
        log.iter()
            .any(|cmd| matches!(cmd, EngineCmd::ApplyParam { .. }))
    );
}

#[test]
fn identity_mismatch_faults_the_group() {
    let (mut chain, _engine) = streaming_chain(false);
    let first = chain.queue_frame(|_| {}).expect("queue first");
    let _second = chain.queue_frame(|_| {}).expect("queue second");

    let err = chain.shot_ready(GroupSlot::Bayer, first + 1).unwrap_err();
    assert_eq!(err.code(), "frame_identity");
    assert!(err.fatal());
    assert_eq!(chain.group(GroupSlot::Bayer).state(), GroupState::Faulted);

    // The faulted group rejects further passes cleanly.
    let err = chain.shot_ready(GroupSlot::Bayer, first).unwrap_err();
    assert_eq!(err.code(), "not_ready");
}
