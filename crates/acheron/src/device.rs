//! The ISP chain device: lifecycle, geometry ownership, and the three
//! hardware groups.
//!
//! All lifecycle transitions and negotiator calls go through `&mut self`;
//! callers serialize through whatever exclusive guard owns the device
//! instance. Lifecycle operations abort on error without mutating state.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use acheron_core::frame::{Frame, TapQueue};
use acheron_core::geometry::{
    ChainGeometry, CropRect, Margins, PixelSize, RATIO_ONE, SensorGeometry, apply_ratio,
};
use acheron_core::ids::{GroupSlot, InstanceId, SensorModuleId, TapId};
use acheron_core::params::{DeltaMask, SetfileWord};
use acheron_core::queue::CompletionQueue;
use acheron_core::region::{NullSync, ParamTable, RegionSync};
use acheron_engine::{CompanionLoader, EngineCommands, GroupTopology, NoCompanion};

use crate::error::ChainError;
use crate::group::Group;
use crate::metrics::PipelineMetrics;
use crate::negotiator::{Stage3Outcome, StageNegotiator};
use crate::setfile;
use crate::tunables::chain_tunables;

/// Lifecycle bits of one device instance, monotonic within an open/close
/// cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleState {
    pub open: bool,
    pub firmware_loaded: bool,
    pub power_on: bool,
    pub sensor_bound: bool,
    pub stream_started: bool,
    pub reprocessing: bool,
}

/// Power/firmware resource shared by every logical instance of one
/// physical device.
///
/// Instance 0 powers on and loads firmware; later instances reuse both.
/// The last release powers the resource back off.
pub struct SharedHardware {
    state: Mutex<SharedState>,
}

#[derive(Default)]
struct SharedState {
    refs: u32,
    power_on: bool,
    firmware_loaded: bool,
}

impl Default for SharedHardware {
    fn default() -> Self {
        Self {
            state: Mutex::new(SharedState::default()),
        }
    }
}

impl SharedHardware {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn acquire(&self, owns_hardware: bool) -> (bool, bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.refs += 1;
        if owns_hardware && !state.power_on {
            state.power_on = true;
            state.firmware_loaded = true;
        }
        (state.power_on, state.firmware_loaded)
    }

    /// Returns true when this release dropped the last reference.
    fn release(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 {
            state.power_on = false;
            state.firmware_loaded = false;
            true
        } else {
            false
        }
    }

    pub fn is_powered(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.power_on)
            .unwrap_or(false)
    }
}

/// Builder wiring an [`IspChain`] to its collaborators.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use acheron::prelude::*;
///
/// let completions = CompletionQueue::with_capacity(32);
/// let engine = Arc::new(VirtualEngine::new(completions.clone()));
/// let chain = IspChainBuilder::new(InstanceId(0), engine)
///     .completions(completions)
///     .open()
///     .unwrap();
/// assert!(chain.state().open);
/// ```
pub struct IspChainBuilder {
    instance: InstanceId,
    engine: Arc<dyn EngineCommands>,
    completions: Option<CompletionQueue>,
    sync: Arc<dyn RegionSync>,
    topology: GroupTopology,
    companion: Arc<dyn CompanionLoader>,
    shared: Arc<SharedHardware>,
    rear_facing: bool,
    setfile_addr: u32,
    setfile_name: String,
}

impl IspChainBuilder {
    pub fn new(instance: InstanceId, engine: Arc<dyn EngineCommands>) -> Self {
        Self {
            instance,
            engine,
            completions: None,
            sync: Arc::new(NullSync),
            topology: GroupTopology::default(),
            companion: Arc::new(NoCompanion),
            shared: SharedHardware::new(),
            rear_facing: false,
            setfile_addr: 0x5000_0000,
            setfile_name: "setfile.bin".into(),
        }
    }

    /// Completion queue the engine delivers shot completions into.
    pub fn completions(mut self, queue: CompletionQueue) -> Self {
        self.completions = Some(queue);
        self
    }

    /// Cache maintenance hooks for the shared parameter region.
    pub fn region_sync(mut self, sync: Arc<dyn RegionSync>) -> Self {
        self.sync = sync;
        self
    }

    /// Group topology flags (OTF vs DMA-fed 3A input).
    pub fn topology(mut self, topology: GroupTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Mark this instance as an offline reprocessing device.
    pub fn reprocessing(mut self, reprocessing: bool) -> Self {
        self.topology.reprocessing = reprocessing;
        self
    }

    /// Companion-chip loader for rear-facing non-reprocessing instances.
    pub fn companion(mut self, loader: Arc<dyn CompanionLoader>) -> Self {
        self.companion = loader;
        self
    }

    /// Shared power/firmware resource when multiple logical instances
    /// drive one physical device.
    pub fn shared_hardware(mut self, shared: Arc<SharedHardware>) -> Self {
        self.shared = shared;
        self
    }

    pub fn rear_facing(mut self, rear: bool) -> Self {
        self.rear_facing = rear;
        self
    }

    /// Scene-preset bundle location handed to the engine at init.
    pub fn setfile_bundle(mut self, addr: u32, name: &str) -> Self {
        self.setfile_addr = addr;
        self.setfile_name = name.to_string();
        self
    }

    /// Open the device: allocate the shared region, reset geometry and
    /// taps, open the groups, and bring up shared hardware for the first
    /// instance.
    pub fn open(self) -> Result<IspChain, ChainError> {
        let tunables = chain_tunables();
        let completions = self
            .completions
            .unwrap_or_else(|| CompletionQueue::with_capacity(tunables.completion_depth));
        let reprocessing = self.topology.reprocessing;

        let (power_on, firmware_loaded) = self.shared.acquire(self.instance.owns_hardware());

        let mut groups = [
            Group::new(GroupSlot::Bayer, tunables.frame_capacity),
            Group::new(GroupSlot::Isp, 0),
            Group::new(GroupSlot::Stabilizer, 0),
        ];
        for group in &mut groups {
            // Reprocessing instances never open the stabilizer.
            if group.slot() == GroupSlot::Stabilizer && reprocessing {
                continue;
            }
            group.open();
        }

        let metrics = PipelineMetrics::default();
        info!(instance = self.instance.0, reprocessing, "isp chain open");

        Ok(IspChain {
            instance: self.instance,
            state: LifecycleState {
                open: true,
                firmware_loaded,
                power_on,
                sensor_bound: false,
                stream_started: false,
                reprocessing,
            },
            sensor: SensorGeometry::default(),
            chain: ChainGeometry::default(),
            params: ParamTable::new(self.sync.clone()),
            sync: self.sync,
            engine: self.engine,
            completions,
            groups,
            shared: self.shared,
            companion: self.companion,
            topology: self.topology,
            rear_facing: self.rear_facing,
            setfile_addr: self.setfile_addr,
            setfile_name: self.setfile_name,
            active_setfile: SetfileWord::default(),
            zoom: RATIO_ONE,
            metrics,
        })
    }
}

/// One ISP chain device instance.
pub struct IspChain {
    instance: InstanceId,
    pub(crate) state: LifecycleState,
    pub(crate) sensor: SensorGeometry,
    pub(crate) chain: ChainGeometry,
    pub(crate) params: ParamTable,
    pub(crate) sync: Arc<dyn RegionSync>,
    pub(crate) engine: Arc<dyn EngineCommands>,
    pub(crate) completions: CompletionQueue,
    pub(crate) groups: [Group; 3],
    shared: Arc<SharedHardware>,
    companion: Arc<dyn CompanionLoader>,
    topology: GroupTopology,
    rear_facing: bool,
    setfile_addr: u32,
    setfile_name: String,
    pub(crate) active_setfile: SetfileWord,
    zoom: u32,
    pub(crate) metrics: PipelineMetrics,
}

impl IspChain {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn sensor(&self) -> &SensorGeometry {
        &self.sensor
    }

    pub fn chain_geometry(&self) -> &ChainGeometry {
        &self.chain
    }

    pub fn group(&self, slot: GroupSlot) -> &Group {
        &self.groups[slot.index()]
    }

    pub(crate) fn group_mut(&mut self, slot: GroupSlot) -> &mut Group {
        &mut self.groups[slot.index()]
    }

    /// Destination buffer queue for a tap, for callers wiring user buffers.
    pub fn tap_queue(&self, tap: TapId) -> &TapQueue {
        self.group(tap.group())
            .tap(tap)
            .map(|t| t.queue())
            .expect("every tap exists on its owning group")
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics.clone()
    }

    /// Currently applied digital zoom ratio (x1000).
    pub fn zoom(&self) -> u32 {
        self.zoom
    }

    pub fn active_setfile(&self) -> SetfileWord {
        self.active_setfile
    }

    fn require_bound(&self) -> Result<(), ChainError> {
        if !self.state.open {
            return Err(ChainError::NotReady("device not open"));
        }
        if !self.state.sensor_bound {
            return Err(ChainError::NotReady("sensor not bound"));
        }
        Ok(())
    }

    /// The minimal physical group id covering the 3A+ISP pair.
    pub(crate) fn primary_group(&self) -> GroupSlot {
        if self.group(GroupSlot::Bayer).is_open() {
            GroupSlot::Bayer
        } else {
            GroupSlot::Isp
        }
    }

    fn negotiator(&mut self) -> StageNegotiator<'_> {
        StageNegotiator {
            sensor: &self.sensor,
            chain: &mut self.chain,
            params: &mut self.params,
            reprocessing: self.state.reprocessing,
        }
    }

    /// Bind a sensor, validate its module, load the scene-preset bundle,
    /// and issue the engine open, taking back the engine's margins.
    pub fn init(
        &mut self,
        module: SensorModuleId,
        sensor: SensorGeometry,
    ) -> Result<(), ChainError> {
        if !self.state.open {
            return Err(ChainError::NotReady("device not open"));
        }
        if self.state.sensor_bound {
            return Err(ChainError::AlreadyOpen);
        }
        sensor.validate().map_err(ChainError::InvalidGeometry)?;

        // Rear-facing, non-reprocessing instances drive the companion chip.
        if self.rear_facing && !self.state.reprocessing && self.companion.is_valid() {
            self.companion.load_firmware()?;
            self.companion.load_setfiles()?;
        }

        self.engine
            .apply_setfile(self.setfile_addr, &self.setfile_name)?;
        let margins = self.engine.open(module, self.topology)?;

        self.sensor = sensor;
        self.sensor.margins = Margins::new(margins.left, margins.right, margins.top, margins.bottom);
        self.state.sensor_bound = true;
        info!(instance = self.instance.0, module = module.0, "sensor bound");
        Ok(())
    }

    /// Negotiate the first segment's input/output crops.
    pub fn negotiate_stage0(
        &mut self,
        input_crop: CropRect,
        output_crop: CropRect,
    ) -> Result<DeltaMask, ChainError> {
        self.require_bound()?;
        self.negotiator().stage0(input_crop, output_crop)
    }

    /// Negotiate the color-correction scale output.
    pub fn negotiate_stage1(&mut self, size: PixelSize) -> Result<DeltaMask, ChainError> {
        self.require_bound()?;
        self.negotiator().stage1(size)
    }

    /// Negotiate the stabilization/noise-reduction chain.
    pub fn negotiate_stage2(&mut self, size: PixelSize) -> Result<DeltaMask, ChainError> {
        self.require_bound()?;
        self.negotiator().stage2(size)
    }

    /// Negotiate the final scale/crop stage, clamping against the scaler
    /// ratio limits.
    pub fn negotiate_stage3(&mut self, size: PixelSize) -> Result<Stage3Outcome, ChainError> {
        self.require_bound()?;
        self.negotiator().stage3(size)
    }

    /// Pending device-global delta not yet announced to the engine.
    pub fn pending_delta(&self) -> &DeltaMask {
        self.params.delta()
    }

    /// Announce the accumulated delta to the engine now (the no-frame
    /// flush path). The mask clears only on success; a failed announce
    /// leaves it intact so a retry resends exactly the unflushed blocks.
    pub fn flush_params(&mut self, group: GroupSlot) -> Result<(), ChainError> {
        let delta = self.params.take_delta();
        if delta.is_empty() {
            return Ok(());
        }
        self.params.flush_blocks(&delta);
        if let Err(err) = self
            .engine
            .set_param(group, delta.lo, delta.hi, delta.block_count())
        {
            self.params.restore(delta);
            return Err(err.into());
        }
        self.metrics.counters.param_flush();
        Ok(())
    }

    /// Apply a digital zoom ratio (x1000, 1000 = none) as a centered
    /// chain0 input crop, preserving the downstream output size.
    ///
    /// Mid-stream the update is wrapped in a processing stop/restart
    /// scoped to the primary group id.
    pub fn set_zoom(&mut self, ratio: u32) -> Result<(), ChainError> {
        self.require_bound()?;
        if ratio < RATIO_ONE {
            return Err(ChainError::InvalidGeometry(format!(
                "zoom ratio {ratio} below 1.0x"
            )));
        }

        let base = self.negotiator().base_input();
        let inner = PixelSize::new(
            apply_ratio(base.width, ratio),
            apply_ratio(base.height, ratio),
        );
        if inner.is_zero() {
            return Err(ChainError::InvalidGeometry(format!(
                "zoom ratio {ratio} leaves no usable area"
            )));
        }
        let crop = CropRect::centered(base, inner);
        let restore = self
            .chain
            .segment(acheron_core::ids::ChainId::Chain1)
            .output;

        let streaming = self.state.stream_started;
        let primary = self.primary_group();
        if streaming {
            self.engine.process_off(primary, false)?;
            setfile::wait_process_stopped(self.engine.as_ref(), primary)?;
        }

        let result = (|| -> Result<(), ChainError> {
            let mut negotiator = self.negotiator();
            negotiator.stage0(crop, CropRect::full(inner))?;
            if !restore.is_zero() {
                negotiator.stage1(restore)?;
            }
            Ok(())
        })();
        let result = match result {
            Ok(()) if streaming => self.flush_params(primary),
            other => other,
        };

        if streaming {
            // Restart even when negotiation failed; the previous geometry
            // is still consistent.
            if let Err(err) = self.engine.process_on(primary) {
                warn!(%err, "process restart after zoom failed");
            }
        }
        result?;

        self.zoom = ratio;
        debug!(ratio, %crop, "digital zoom applied");
        Ok(())
    }

    /// Swap the active scene preset.
    ///
    /// Mid-stream this issues exactly one `process_off`/`process_on` pair
    /// scoped to the primary group id and dirties the color-range blocks
    /// once.
    pub fn set_setfile(&mut self, word: SetfileWord) -> Result<(), ChainError> {
        self.require_bound()?;
        if word == self.active_setfile {
            return Ok(());
        }
        let primary = self.state.stream_started.then(|| self.primary_group());
        setfile::swap_setfile(
            self.engine.as_ref(),
            &mut self.params,
            primary,
            word,
            &self.metrics.counters,
        )?;
        self.active_setfile = word;
        Ok(())
    }

    /// Start streaming: bounded wait for 3A readiness, processing on for
    /// every open group, then the hardware stream-on.
    pub fn start_stream(&mut self) -> Result<(), ChainError> {
        self.require_bound()?;
        if self.state.stream_started {
            return Err(ChainError::NotReady("stream already started"));
        }
        if self
            .chain
            .segment(acheron_core::ids::ChainId::Chain0)
            .output
            .is_zero()
        {
            return Err(ChainError::NotReady("chain not negotiated"));
        }

        setfile::wait_group_ready(self.engine.as_ref(), GroupSlot::Bayer)?;

        let mut started: Vec<GroupSlot> = Vec::new();
        for slot in GroupSlot::ALL {
            if !self.group(slot).is_open() {
                continue;
            }
            if let Err(err) = self.engine.process_on(slot) {
                self.rollback_process(&started);
                return Err(err.into());
            }
            started.push(slot);
        }
        if let Err(err) = self.engine.stream_on() {
            self.rollback_process(&started);
            return Err(err.into());
        }

        self.state.stream_started = true;
        info!(instance = self.instance.0, "stream started");
        Ok(())
    }

    fn rollback_process(&self, started: &[GroupSlot]) {
        for slot in started {
            if let Err(err) = self.engine.process_off(*slot, true) {
                warn!(group = %slot, %err, "rollback process_off failed");
            }
        }
    }

    /// Stop streaming and turn group processing off.
    pub fn stop_stream(&mut self) -> Result<(), ChainError> {
        if !self.state.stream_started {
            return Err(ChainError::NotReady("stream not started"));
        }
        self.engine.stream_off()?;
        for slot in GroupSlot::ALL {
            if self.group(slot).is_open() {
                self.engine.process_off(slot, false)?;
            }
        }
        self.state.stream_started = false;
        info!(instance = self.instance.0, "stream stopped");
        Ok(())
    }

    /// Take a free frame, let the caller fill its tap requests, and queue
    /// it for the chain. Returns the stamped frame count.
    pub fn queue_frame(
        &mut self,
        setup: impl FnOnce(&mut Frame),
    ) -> Result<u64, ChainError> {
        self.require_bound()?;
        let pool = self.group(GroupSlot::Bayer).pool();
        let Some(mut frame) = pool.acquire() else {
            return Err(ChainError::NotReady("no free frame"));
        };
        setup(&mut frame);
        Ok(pool.submit(frame))
    }

    /// Close the device, stopping active processing and releasing the
    /// shared hardware when this was the last instance.
    pub fn close(&mut self) -> Result<(), ChainError> {
        if !self.state.open {
            return Err(ChainError::AlreadyClosed);
        }
        if self.state.stream_started {
            if let Err(err) = self.stop_stream() {
                warn!(%err, "stream stop during close failed");
            }
        }
        if let Err(err) = self.engine.process_off(GroupSlot::Isp, true) {
            warn!(%err, "forced process stop during close failed");
        }
        for group in &mut self.groups {
            group.close();
        }
        self.chain.reset();

        let last = self.shared.release();
        if last {
            self.engine.close()?;
        }
        self.state = LifecycleState {
            reprocessing: self.state.reprocessing,
            ..LifecycleState::default()
        };
        info!(instance = self.instance.0, last, "isp chain closed");
        Ok(())
    }
}

impl Drop for IspChain {
    fn drop(&mut self) {
        // Best-effort teardown when the caller forgot to close.
        if self.state.open {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acheron_core::queue::CompletionQueue;
    use acheron_engine::virtual_engine::{EngineCmd, VirtualEngine};

    fn sensor() -> SensorGeometry {
        SensorGeometry {
            output: PixelSize::new(4128, 3096),
            margins: Margins::new(16, 16, 12, 12),
            binning: RATIO_ONE,
            bns: PixelSize::default(),
            framerate: 30,
        }
    }

    fn open_chain(engine: Arc<VirtualEngine>) -> IspChain {
        IspChainBuilder::new(InstanceId(0), engine)
            .completions(CompletionQueue::with_capacity(8))
            .open()
            .unwrap()
    }

    fn bound_chain(engine: Arc<VirtualEngine>) -> IspChain {
        let mut chain = open_chain(engine);
        chain.init(SensorModuleId(0x2177), sensor()).unwrap();
        chain
    }

    fn negotiate_defaults(chain: &mut IspChain) {
        let active = PixelSize::new(4096, 3072);
        let out = PixelSize::new(2560, 1920);
        chain
            .negotiate_stage0(CropRect::full(active), CropRect::centered(active, out))
            .unwrap();
        chain.negotiate_stage1(out).unwrap();
        chain.negotiate_stage2(out).unwrap();
        chain.negotiate_stage3(PixelSize::new(1280, 720)).unwrap();
    }

    #[test]
    fn init_takes_margins_from_engine() {
        let engine = Arc::new(VirtualEngine::new(CompletionQueue::with_capacity(1)));
        let mut chain = open_chain(engine);
        chain
            .init(SensorModuleId(0x2177), sensor())
            .unwrap();
        assert!(chain.state().sensor_bound);
        assert_eq!(chain.sensor().margins, Margins::new(16, 16, 12, 12));
        assert_eq!(
            chain.init(SensorModuleId(0x2177), sensor()).unwrap_err().code(),
            "already_open"
        );
    }

    #[test]
    fn init_rejects_invalid_module_without_state_change() {
        let engine = Arc::new(VirtualEngine::new(CompletionQueue::with_capacity(1)));
        engine.reject_module(0xdead);
        let mut chain = open_chain(engine);
        let err = chain.init(SensorModuleId(0xdead), sensor()).unwrap_err();
        assert_eq!(err.code(), "invalid_module");
        assert!(!chain.state().sensor_bound);
    }

    #[test]
    fn lifecycle_preconditions_reject_without_mutation() {
        let engine = Arc::new(VirtualEngine::new(CompletionQueue::with_capacity(1)));
        let mut chain = open_chain(engine.clone());
        assert_eq!(
            chain.start_stream().unwrap_err().code(),
            "not_ready"
        );
        chain.close().unwrap();
        assert_eq!(chain.close().unwrap_err().code(), "already_closed");
    }

    #[test]
    fn stream_lifecycle_round_trip() {
        let engine = Arc::new(VirtualEngine::new(CompletionQueue::with_capacity(8)));
        let mut chain = bound_chain(engine.clone());
        negotiate_defaults(&mut chain);
        chain.start_stream().unwrap();
        assert!(chain.state().stream_started);
        chain.stop_stream().unwrap();
        assert!(!chain.state().stream_started);
        let log = engine.commands();
        assert!(log.iter().any(|cmd| matches!(cmd, EngineCmd::StreamOn)));
        assert!(log.iter().any(|cmd| matches!(cmd, EngineCmd::StreamOff)));
    }

    #[test]
    fn setfile_change_is_scoped_and_idempotent() {
        let engine = Arc::new(VirtualEngine::new(CompletionQueue::with_capacity(8)));
        let mut chain = bound_chain(engine.clone());
        negotiate_defaults(&mut chain);
        chain.start_stream().unwrap();

        let word = SetfileWord::pack(4, [1, 2, 0]);
        chain.set_setfile(word).unwrap();
        // Re-applying the same setfile is a no-op.
        chain.set_setfile(word).unwrap();

        let log = engine.commands();
        let offs = log
            .iter()
            .filter(|cmd| matches!(cmd, EngineCmd::ProcessOff { .. }))
            .count();
        assert_eq!(offs, 1);
        assert_eq!(chain.metrics().counters().setfile_swaps, 1);
    }

    #[test]
    fn zoom_preserves_downstream_output() {
        let engine = Arc::new(VirtualEngine::new(CompletionQueue::with_capacity(8)));
        let mut chain = bound_chain(engine);
        negotiate_defaults(&mut chain);

        chain.set_zoom(2000).unwrap();
        let geometry = chain.chain_geometry();
        let seg0 = geometry.segment(acheron_core::ids::ChainId::Chain0);
        assert_eq!(seg0.crop.size(), PixelSize::new(2048, 1536));
        assert_eq!(
            geometry.segment(acheron_core::ids::ChainId::Chain1).output,
            PixelSize::new(2560, 1920)
        );
        assert_eq!(chain.zoom(), 2000);
    }

    #[test]
    fn flush_params_is_idempotent() {
        let engine = Arc::new(VirtualEngine::new(CompletionQueue::with_capacity(1)));
        let mut chain = bound_chain(engine.clone());
        negotiate_defaults(&mut chain);

        let pending = *chain.pending_delta();
        assert!(!pending.is_empty());
        chain.flush_params(GroupSlot::Isp).unwrap();
        // Nothing changed since; the second flush announces nothing.
        chain.flush_params(GroupSlot::Isp).unwrap();

        let announced: Vec<(u32, u32, u32)> = engine
            .commands()
            .into_iter()
            .filter_map(|cmd| match cmd {
                EngineCmd::SetParam { lo, hi, blocks, .. } => Some((lo, hi, blocks)),
                _ => None,
            })
            .collect();
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0], (pending.lo, pending.hi, pending.block_count()));
        assert!(chain.pending_delta().is_empty());
    }

    #[test]
    fn flush_failure_leaves_delta_resendable() {
        let engine = Arc::new(VirtualEngine::new(CompletionQueue::with_capacity(1)));
        let mut chain = bound_chain(engine.clone());
        negotiate_defaults(&mut chain);
        let pending = *chain.pending_delta();

        engine.fail_next_set_param();
        let err = chain.flush_params(GroupSlot::Isp).unwrap_err();
        assert_eq!(err.code(), "command_failed");
        assert_eq!(chain.pending_delta().lo, pending.lo);
        assert_eq!(chain.pending_delta().hi, pending.hi);

        // The retry resends exactly the unflushed blocks.
        chain.flush_params(GroupSlot::Isp).unwrap();
        assert!(chain.pending_delta().is_empty());
    }

    #[test]
    fn reprocessing_instance_keeps_stabilizer_closed() {
        let engine = Arc::new(VirtualEngine::new(CompletionQueue::with_capacity(1)));
        let chain = IspChainBuilder::new(InstanceId(1), engine)
            .reprocessing(true)
            .open()
            .unwrap();
        assert!(!chain.group(GroupSlot::Stabilizer).is_open());
        assert!(chain.group(GroupSlot::Isp).is_open());
    }

    #[test]
    fn shared_hardware_is_refcounted() {
        let shared = SharedHardware::new();
        let engine = Arc::new(VirtualEngine::new(CompletionQueue::with_capacity(1)));
        let mut first = IspChainBuilder::new(InstanceId(0), engine.clone())
            .shared_hardware(shared.clone())
            .open()
            .unwrap();
        let mut second = IspChainBuilder::new(InstanceId(1), engine.clone())
            .shared_hardware(shared.clone())
            .open()
            .unwrap();
        assert!(first.state().power_on);
        assert!(shared.is_powered());
        first.close().unwrap();
        assert!(shared.is_powered());
        second.close().unwrap();
        assert!(!shared.is_powered());
        assert!(engine.commands().iter().any(|cmd| matches!(cmd, EngineCmd::Close)));
    }
}
