//! The SHM module worker and its engine-facing handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use syntond_clock::{monotonic_now, realtime_now, FrequencyStore};
use syntond_config::{ShmSourceType, StepPolicy};
use syntond_feed::{CycleEvent, CycleSink};
use syntond_runtime::{reply_slot, ReplySender, Worker, WorkerHandle};
use syntond_types::{AlarmSet, ControlFlags, InstanceStatus, MonoTime, Nanos, SyncState, WallTime};

use crate::instance::ShmInstance;
use crate::message::{
    EngineEvent, EngineSink, SyncMsg, TestModeId, TimeOfDaySource, TodStatus, SERVO_TYPE_SHM,
};
use crate::reporting;
use crate::SyncError;

/// Worker tick; event sources are polled at this cadence.
const MODULE_TICK: Duration = Duration::from_millis(100);

/// Housekeeping (time-of-day poll, convergence, change reporting) interval.
const HOUSEKEEPING_INTERVAL: Nanos = Nanos::from_secs(1);

/// Module-level time-of-day state for an external provider.
struct TodState {
    source: Box<dyn TimeOfDaySource>,
    last: Option<TodStatus>,
}

/// Construction parameters for the module worker.
pub struct ModuleParams {
    pub step_policy: StepPolicy,
    pub state_dir: PathBuf,
    pub stats_dir: PathBuf,
    pub engine: EngineSink,
}

/// The SHM sync-module worker: owns every configured instance and handles
/// the engine's message set.
pub struct ShmModule {
    instances: Vec<ShmInstance>,
    tod: Option<TodState>,
    engine: EngineSink,
    freq_store: FrequencyStore,
    state_dir: PathBuf,
    stats_dir: PathBuf,
    step_policy: StepPolicy,
    running: bool,
    next_housekeeping: MonoTime,
    reported: HashMap<String, (SyncState, AlarmSet, f64)>,
}

impl ShmModule {
    pub fn new(params: ModuleParams) -> Self {
        Self {
            instances: Vec::new(),
            tod: None,
            engine: params.engine,
            freq_store: FrequencyStore::new(&params.state_dir),
            state_dir: params.state_dir,
            stats_dir: params.stats_dir,
            step_policy: params.step_policy,
            running: false,
            next_housekeeping: MonoTime::new(0),
            reported: HashMap::new(),
        }
    }

    /// Attaches an external time-of-day provider (one living in another
    /// module). Providers inside this module are resolved internally.
    pub fn set_time_of_day(&mut self, source: Box<dyn TimeOfDaySource>) {
        self.tod = Some(TodState { source, last: None });
    }

    pub fn add_instance(&mut self, instance: ShmInstance) {
        tracing::info!(instance = %instance.name(), "instance registered with shm module");
        self.instances.push(instance);
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn find(&mut self, name: &str) -> Result<&mut ShmInstance, SyncError> {
        self.instances
            .iter_mut()
            .find(|i| i.name() == name)
            .ok_or_else(|| SyncError::UnknownInstance {
                instance: name.to_string(),
            })
    }

    // ------------------------------------------------------------------
    // Periodic processing
    // ------------------------------------------------------------------

    /// One module tick at `now`: event intake, timers and, once a second,
    /// housekeeping.
    pub fn poll(&mut self, now: MonoTime) {
        if !self.running {
            return;
        }

        // Event intake; collect step notifications for the ToD provider.
        let mut steps: Vec<(String, Option<String>, Nanos)> = Vec::new();
        for instance in &mut self.instances {
            let effects = instance.poll_events(now, self.step_policy);
            for effect in effects {
                if let Some(offset) = effect.stepped {
                    steps.push((
                        instance.name().to_string(),
                        instance.time_of_day_name().map(str::to_string),
                        offset,
                    ));
                }
                if let Some(rt) = effect.rt_stats {
                    self.engine.emit(EngineEvent::RtStats(rt));
                }
            }
            instance.check_timers(now);
        }
        for (stepper, tod_name, offset) in steps {
            self.notify_step(&stepper, tod_name.as_deref(), offset);
        }

        if now >= self.next_housekeeping {
            self.next_housekeeping = now + HOUSEKEEPING_INTERVAL;
            self.poll_time_of_day();
            for instance in &mut self.instances {
                instance.update_convergence(now);
            }
            self.report_changes();
        }
    }

    /// Propagates a clock step to the stepping instance's ToD provider.
    fn notify_step(&mut self, stepper: &str, tod_name: Option<&str>, offset: Nanos) {
        let Some(tod_name) = tod_name else { return };

        // Provider in this module: flush its history directly.
        if let Some(sibling) = self
            .instances
            .iter_mut()
            .find(|i| i.name() == tod_name && i.name() != stepper)
        {
            sibling.absorb_external_step();
            return;
        }
        if let Some(tod) = &mut self.tod {
            if tod.source.name() == tod_name {
                tod.source.notify_step(offset);
            }
        }
    }

    /// Fetches time-of-day status for every pulse-only instance, resolving
    /// sibling providers internally and the external provider at most once.
    fn poll_time_of_day(&mut self) {
        let sibling_status: HashMap<String, TodStatus> = self
            .instances
            .iter()
            .map(|i| (i.name().to_string(), i.tod_status()))
            .collect();

        // Refresh the external provider only if some instance needs it.
        let external_name = self.tod.as_ref().map(|t| t.source.name().to_string());
        let external_needed = self.instances.iter().any(|i| {
            i.config().shm_source_type == ShmSourceType::Pps
                && i.time_of_day_name() == external_name.as_deref()
                && i.time_of_day_name().is_some()
                && !sibling_status.contains_key(i.time_of_day_name().unwrap_or_default())
        });
        if external_needed {
            if let Some(tod) = &mut self.tod {
                tod.last = tod.source.status();
            }
        }
        let external_last = self.tod.as_ref().and_then(|t| t.last);

        for instance in &mut self.instances {
            if instance.config().shm_source_type != ShmSourceType::Pps {
                continue;
            }
            let Some(name) = instance.time_of_day_name() else {
                instance.apply_tod_status(None);
                continue;
            };
            let status = sibling_status.get(name).copied().or({
                if external_name.as_deref() == Some(name) {
                    external_last
                } else {
                    None
                }
            });
            instance.apply_tod_status(status);
        }
    }

    /// Sends a state-change notification for every instance whose state,
    /// alarms or clustering score moved since the last report.
    fn report_changes(&mut self) {
        for instance in &self.instances {
            let key = (
                instance.state(),
                instance.alarms(),
                instance.clustering_score(),
            );
            let changed = self.reported.get(instance.name()) != Some(&key);
            if changed {
                self.reported.insert(instance.name().to_string(), key);
                self.engine
                    .emit(EngineEvent::StateChanged(instance.status()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Message handlers
    // ------------------------------------------------------------------

    fn handle_run(&mut self, now: MonoTime) {
        if self.running {
            return;
        }
        self.running = true;
        self.next_housekeeping = now;
        for instance in &mut self.instances {
            instance.start(now);
        }
        // Give the engine a baseline record for every instance.
        self.report_changes();
        tracing::info!(instances = self.instances.len(), "shm module running");
    }

    fn handle_save_state(&mut self) {
        let now = realtime_now();
        for instance in &self.instances {
            let status = instance.status();
            let content = reporting::state_file_content(
                &status,
                instance.counters(),
                instance.freq_adjust_ppb(),
                instance.synchronized(),
                now,
            );
            reporting::write_state_file(&self.state_dir, instance.name(), &content);

            let clock_ctrl = instance
                .control_flags()
                .contains(syntond_types::ControlFlag::ClockCtrl);
            if instance.synchronized() && clock_ctrl {
                if let Err(error) = self
                    .freq_store
                    .save(instance.clock().id(), instance.freq_adjust_ppb())
                {
                    tracing::warn!(instance = %instance.name(), %error, "failed to save frequency correction");
                }
            }
        }
    }

    fn handle_log_stats(&self) {
        for instance in &self.instances {
            let record = instance.rt_stats();
            match serde_json::to_string(&record) {
                Ok(json) => tracing::info!(instance = %instance.name(), stats = %json, "rt stats"),
                Err(error) => tracing::warn!(instance = %instance.name(), %error, "rt stats serialization failed"),
            }
        }
    }

    fn handle_stats_end_period(&mut self, time: WallTime) {
        for instance in &mut self.instances {
            if let Some(stats) = instance.close_stats_period(time) {
                let line =
                    reporting::stats_line(instance.name(), time, &stats, instance.counters());
                reporting::append_stats_line(&self.stats_dir, instance.name(), &line);
            }
        }
    }

    fn handle_pid_adjust(
        &mut self,
        module_mask: u32,
        kp: Option<f64>,
        ki: Option<f64>,
        kd: Option<f64>,
        reset: bool,
    ) {
        if module_mask & SERVO_TYPE_SHM == 0 {
            return;
        }
        for instance in &mut self.instances {
            instance.retune_pid(kp, ki, kd, reset);
        }
    }
}

impl Worker for ShmModule {
    type Msg = SyncMsg;

    fn on_message(&mut self, msg: SyncMsg) {
        match msg {
            SyncMsg::Run => self.handle_run(monotonic_now()),
            SyncMsg::GetStatus { instance, reply } => {
                reply.send(self.find(&instance).map(|i| i.status()));
            }
            SyncMsg::Control {
                instance,
                mask,
                flags,
                reply,
            } => {
                reply.send(self.find(&instance).map(|i| i.apply_control(mask, flags)));
            }
            SyncMsg::StepClock {
                instance,
                offset,
                reply,
            } => {
                let result = self.find(&instance).map(|i| {
                    i.force_step(offset);
                    i.time_of_day_name().map(str::to_string)
                });
                match result {
                    Ok(tod_name) => {
                        self.notify_step(&instance, tod_name.as_deref(), offset);
                        reply.send(Ok(()));
                    }
                    Err(e) => reply.send(Err(e)),
                }
            }
            SyncMsg::LogStats => self.handle_log_stats(),
            SyncMsg::SaveState => self.handle_save_state(),
            SyncMsg::WriteTopology { instance, reply } => {
                reply.send(
                    self.find(&instance)
                        .map(|i| reporting::topology_fragment(&i.status(), i.config())),
                );
            }
            SyncMsg::StatsEndPeriod { time } => self.handle_stats_end_period(time),
            SyncMsg::TestMode { instance, mode } => {
                let now = monotonic_now();
                if let Ok(i) = self.find(&instance) {
                    match mode {
                        TestModeId::BogusEvents => i.toggle_bogus_events(now),
                    }
                }
            }
            SyncMsg::PidAdjust {
                module_mask,
                kp,
                ki,
                kd,
                reset,
            } => self.handle_pid_adjust(module_mask, kp, ki, kd, reset),
            SyncMsg::FeedCycle(_event) => {
                for instance in &mut self.instances {
                    instance.refresh_feed_offset();
                }
            }
            SyncMsg::StepNotice { instance, offset } => {
                let _ = offset;
                if let Ok(i) = self.find(&instance) {
                    i.absorb_external_step();
                }
            }
        }
    }

    fn on_tick(&mut self) {
        self.poll(monotonic_now());
    }

    fn tick_interval(&self) -> Duration {
        MODULE_TICK
    }
}

/// Engine-facing handle for a spawned SHM module.
#[derive(Clone)]
pub struct ShmHandle {
    name: String,
    worker: Arc<WorkerHandle<SyncMsg>>,
}

impl ShmHandle {
    /// Spawns the module worker under the given thread name.
    pub fn spawn(name: &str, module: ShmModule) -> Self {
        let worker = syntond_runtime::spawn(name, 64, module);
        Self {
            name: name.to_string(),
            worker: Arc::new(worker),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, msg: SyncMsg) -> Result<(), SyncError> {
        self.worker.send(msg).map_err(|_| SyncError::ModuleStopped)
    }

    fn request<T>(
        &self,
        build: impl FnOnce(ReplySender<Result<T, SyncError>>) -> SyncMsg,
    ) -> Result<T, SyncError> {
        let (tx, rx) = reply_slot();
        self.send(build(tx))?;
        rx.wait().map_err(|_| SyncError::ModuleStopped)?
    }

    /// Starts processing.
    pub fn run(&self) -> Result<(), SyncError> {
        self.send(SyncMsg::Run)
    }

    pub fn get_status(&self, instance: &str) -> Result<InstanceStatus, SyncError> {
        self.request(|reply| SyncMsg::GetStatus {
            instance: instance.to_string(),
            reply,
        })
    }

    pub fn control(
        &self,
        instance: &str,
        mask: ControlFlags,
        flags: ControlFlags,
    ) -> Result<(), SyncError> {
        self.request(|reply| SyncMsg::Control {
            instance: instance.to_string(),
            mask,
            flags,
            reply,
        })
    }

    pub fn step_clock(&self, instance: &str, offset: Nanos) -> Result<(), SyncError> {
        self.request(|reply| SyncMsg::StepClock {
            instance: instance.to_string(),
            offset,
            reply,
        })
    }

    pub fn log_stats(&self) -> Result<(), SyncError> {
        self.send(SyncMsg::LogStats)
    }

    pub fn save_state(&self) -> Result<(), SyncError> {
        self.send(SyncMsg::SaveState)
    }

    pub fn write_topology(&self, instance: &str) -> Result<String, SyncError> {
        self.request(|reply| SyncMsg::WriteTopology {
            instance: instance.to_string(),
            reply,
        })
    }

    pub fn stats_end_period(&self, time: WallTime) -> Result<(), SyncError> {
        self.send(SyncMsg::StatsEndPeriod { time })
    }

    pub fn test_mode(&self, instance: &str, mode: TestModeId) -> Result<(), SyncError> {
        self.send(SyncMsg::TestMode {
            instance: instance.to_string(),
            mode,
        })
    }

    pub fn pid_adjust(
        &self,
        module_mask: u32,
        kp: Option<f64>,
        ki: Option<f64>,
        kd: Option<f64>,
        reset: bool,
    ) -> Result<(), SyncError> {
        self.send(SyncMsg::PidAdjust {
            module_mask,
            kp,
            ki,
            kd,
            reset,
        })
    }

    /// A feed cycle sink delivering into this module's inbox.
    pub fn cycle_sink(&self) -> CycleSink {
        let handle = self.clone();
        CycleSink::new(self.name.clone(), move |event: CycleEvent| {
            handle
                .worker
                .send(SyncMsg::FeedCycle(event))
                .map_err(|msg| match msg {
                    SyncMsg::FeedCycle(ev) => ev,
                    _ => unreachable!("sink only sends feed cycles"),
                })
        })
    }

    /// A time-of-day source backed by `instance` inside this module.
    pub fn tod_source(&self, instance: &str) -> Box<dyn TimeOfDaySource> {
        Box::new(HandleTodSource {
            handle: self.clone(),
            instance: instance.to_string(),
        })
    }
}

/// Time-of-day provider resolved through a module handle: `status` is a
/// synchronous status round-trip, `notify_step` an asynchronous notice.
struct HandleTodSource {
    handle: ShmHandle,
    instance: String,
}

impl TimeOfDaySource for HandleTodSource {
    fn name(&self) -> &str {
        &self.instance
    }

    fn status(&mut self) -> Option<TodStatus> {
        let status = self.handle.get_status(&self.instance).ok()?;
        Some(TodStatus {
            state: status.state,
            offset_from_master_ns: if status.offset_valid {
                status.offset_from_master_ns
            } else {
                0.0
            },
        })
    }

    fn notify_step(&mut self, offset: Nanos) {
        let _ = self.handle.send(SyncMsg::StepNotice {
            instance: self.instance.clone(),
            offset,
        });
    }
}
