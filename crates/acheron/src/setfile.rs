//! Scene-preset (setfile) application.
//!
//! A setfile swap affects constants read at stage-activation time, so it
//! requires a full processing stop on the owning hardware group id before
//! the swap and a restart after. The color-range flags packed in the
//! setfile word dirty the isp-output and the two scale-stage effect
//! blocks exactly once per change.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use acheron_core::ids::GroupSlot;
use acheron_core::metrics::ChainCounters;
use acheron_core::params::{DeltaMask, EffectParam, ParamBlockId, SetfileWord};
use acheron_core::region::ParamTable;
use acheron_engine::EngineCommands;

use crate::error::ChainError;
use crate::tunables::chain_tunables;

/// Bounded poll for a group's processing to come to a stop.
///
/// Timeouts are reported, never panicked.
pub(crate) fn wait_process_stopped(
    engine: &dyn EngineCommands,
    group: GroupSlot,
) -> Result<(), ChainError> {
    let tunables = chain_tunables();
    for _ in 0..tunables.process_stop_retries {
        if engine.poll_process_stopped(group) {
            return Ok(());
        }
        if tunables.process_stop_wait_ms > 0 {
            thread::sleep(Duration::from_millis(tunables.process_stop_wait_ms));
        }
    }
    warn!(%group, "process stop wait exhausted");
    Err(ChainError::Timeout("process stop"))
}

/// Bounded poll for a group to report stream readiness.
pub(crate) fn wait_group_ready(
    engine: &dyn EngineCommands,
    group: GroupSlot,
) -> Result<(), ChainError> {
    let tunables = chain_tunables();
    for _ in 0..tunables.group_ready_retries {
        if engine.poll_group_ready(group) {
            return Ok(());
        }
        if tunables.group_ready_wait_ms > 0 {
            thread::sleep(Duration::from_millis(tunables.group_ready_wait_ms));
        }
    }
    warn!(%group, "stream readiness wait exhausted");
    Err(ChainError::Timeout("group ready"))
}

/// Write the color-range effect blocks selected by the setfile word.
fn write_color_ranges(params: &mut ParamTable, word: SetfileWord) -> DeltaMask {
    let mut delta = DeltaMask::default();
    let blocks = [
        ParamBlockId::IspColorRange,
        ParamBlockId::SccColorRange,
        ParamBlockId::ScpColorRange,
    ];
    for (index, id) in blocks.into_iter().enumerate() {
        params.write_effect(
            id,
            EffectParam {
                effect: 0,
                color_range: word.color_range(index),
            },
        );
        delta.set(id);
    }
    delta
}

/// Swap the active scene preset, scoped to the minimal affected group id.
///
/// Issues exactly one `process_off`/`process_on` pair around the
/// parameter apply. When the stream is not running (`primary` is `None`)
/// the color-range blocks are written without stopping anything.
pub(crate) fn swap_setfile(
    engine: &dyn EngineCommands,
    params: &mut ParamTable,
    primary: Option<GroupSlot>,
    word: SetfileWord,
    counters: &ChainCounters,
) -> Result<DeltaMask, ChainError> {
    let delta = match primary {
        Some(group) => {
            engine.process_off(group, false)?;
            wait_process_stopped(engine, group)?;
            let delta = write_color_ranges(params, word);
            // Announce and apply now; on failure the mask stays in the
            // table so a retry resends exactly the unflushed blocks.
            engine.set_param(group, delta.lo, delta.hi, delta.block_count())?;
            for id in delta.ids() {
                params.retire(id);
            }
            engine.apply_param(group, word)?;
            engine.process_on(group)?;
            delta
        }
        None => write_color_ranges(params, word),
    };
    counters.setfile_swap();
    debug!(%word, "setfile applied");
    Ok(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use acheron_core::queue::CompletionQueue;
    use acheron_engine::virtual_engine::{EngineCmd, VirtualEngine};

    #[test]
    fn swap_issues_one_off_on_pair() {
        let engine = VirtualEngine::new(CompletionQueue::with_capacity(1));
        let mut params = ParamTable::default();
        let counters = ChainCounters::default();
        let word = SetfileWord::pack(2, [1, 1, 0]);

        let delta = swap_setfile(
            &engine,
            &mut params,
            Some(GroupSlot::Bayer),
            word,
            &counters,
        )
        .unwrap();

        assert!(delta.contains(ParamBlockId::IspColorRange));
        assert!(delta.contains(ParamBlockId::SccColorRange));
        assert!(delta.contains(ParamBlockId::ScpColorRange));
        assert_eq!(delta.block_count(), 3);

        let log = engine.commands();
        let offs = log
            .iter()
            .filter(|cmd| matches!(cmd, EngineCmd::ProcessOff { .. }))
            .count();
        let ons = log
            .iter()
            .filter(|cmd| matches!(cmd, EngineCmd::ProcessOn { .. }))
            .count();
        assert_eq!(offs, 1);
        assert_eq!(ons, 1);
        assert!(
            log.iter()
                .any(|cmd| matches!(cmd, EngineCmd::SetParam { blocks: 3, .. }))
        );
        // The announced blocks were retired from the table.
        assert!(params.delta().is_empty());
        assert_eq!(counters.snapshot().setfile_swaps, 1);
    }

    #[test]
    fn stalled_stop_reports_timeout() {
        crate::tunables::set_chain_tunables(crate::tunables::ChainTunables {
            process_stop_retries: 2,
            process_stop_wait_ms: 0,
            ..Default::default()
        });
        let engine = VirtualEngine::new(CompletionQueue::with_capacity(1));
        engine.process_on(GroupSlot::Isp).unwrap();
        engine.stall_group(GroupSlot::Isp);
        let mut params = ParamTable::default();
        let counters = ChainCounters::default();

        let err = swap_setfile(
            &engine,
            &mut params,
            Some(GroupSlot::Isp),
            SetfileWord::pack(1, [0, 0, 0]),
            &counters,
        )
        .unwrap_err();
        assert_eq!(err.code(), "timeout");
        crate::tunables::set_chain_tunables(Default::default());
    }
}
