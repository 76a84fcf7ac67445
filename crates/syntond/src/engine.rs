//! Engine: builds and drives the daemon's workers.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use syntond_clock::{
    monotonic_now, ClockId, FrequencyStore, ReferenceClock, SoftwareClock, SystemClock,
};
use syntond_config::{ShmSourceType, SyntondConfig};
use syntond_feed::FeedHandle;
use syntond_runtime::Inbox;
use syntond_sync::{
    EngineEvent, EngineSink, InstanceParams, ModuleParams, PulseInjector, ShmHandle, ShmInstance,
    ShmModule, SyncError, TestModeId,
};
use syntond_types::{ControlFlags, InstanceStatus, Nanos, WallTime};

/// Capacity of the engine's notification inbox.
const EVENT_INBOX_CAPACITY: usize = 256;

/// The daemon engine.
///
/// Owns the feed service and the SHM module; dropping the engine shuts the
/// workers down cooperatively. Instances whose resources cannot be acquired
/// are skipped with an error log, and their siblings start normally.
pub struct Engine {
    feed: FeedHandle,
    shm: ShmHandle,
    events: Arc<Inbox<EngineEvent>>,
    instances: Vec<String>,
    /// Pulse injection points, one per started instance. In production
    /// deployments the kernel adjunct feeds these; simulations and tests
    /// drive them directly.
    injectors: HashMap<String, PulseInjector>,
}

impl Engine {
    /// Builds every configured instance and spawns the workers. Processing
    /// does not begin until [`Engine::run`].
    pub fn start(config: &SyntondConfig) -> anyhow::Result<Self> {
        config.validate().context("configuration rejected")?;

        let feed = FeedHandle::spawn(config.general.feed_poll_period_log2);
        let freq_store = FrequencyStore::new(&config.general.state_dir);

        let events: Arc<Inbox<EngineEvent>> = Arc::new(Inbox::new(EVENT_INBOX_CAPACITY));
        let sink_inbox = Arc::clone(&events);
        let mut module = ShmModule::new(ModuleParams {
            step_policy: config.general.clock_ctrl,
            state_dir: config.general.state_dir.clone(),
            stats_dir: config.general.stats_dir.clone(),
            engine: EngineSink::new(move |event| sink_inbox.send(event)),
        });

        let mut clocks: HashMap<String, Arc<dyn ReferenceClock>> = HashMap::new();
        let mut instances = Vec::new();
        let mut injectors = HashMap::new();

        for (name, inst_config) in &config.shm {
            let clock = Arc::clone(clocks.entry(inst_config.interface.clone()).or_insert_with(
                || {
                    // `system` binds the instance to the system realtime
                    // clock; anything else names a NIC hardware clock.
                    if inst_config.interface == "system" {
                        Arc::new(SystemClock::new()) as Arc<dyn ReferenceClock>
                    } else {
                        Arc::new(SoftwareClock::new(ClockId::phc(&inst_config.interface)))
                    }
                },
            ));

            match Self::build_instance(name, inst_config, clock, &feed, &freq_store) {
                Ok((instance, injector)) => {
                    module.add_instance(instance);
                    instances.push(name.clone());
                    injectors.insert(name.clone(), injector);
                }
                Err(error) => {
                    tracing::error!(instance = %name, %error, "instance failed to start; continuing without it");
                }
            }
        }

        let shm = ShmHandle::spawn("syntond-shm", module);
        feed.subscribe_events(shm.cycle_sink())
            .context("failed to register cycle-event sink")?;

        Ok(Self {
            feed,
            shm,
            events,
            instances,
            injectors,
        })
    }

    fn build_instance(
        name: &str,
        config: &syntond_config::ShmInstanceConfig,
        clock: Arc<dyn ReferenceClock>,
        feed: &FeedHandle,
        freq_store: &FrequencyStore,
    ) -> Result<(ShmInstance, PulseInjector), SyncError> {
        // Pulse-bearing sources own the clock's timed-event channel
        // exclusively; time-of-day-only instances leave it free.
        if config.shm_source_type != ShmSourceType::Tod {
            clock.set_timed_event_source(true)?;
        }

        // The system clock needs no feed registration: subscribing to it
        // yields the null subscription.
        if !clock.id().is_system() {
            match feed.add_clock(clock.clone(), syntond_feed::DEFAULT_POLL_PERIOD_LOG2) {
                Ok(()) | Err(syntond_feed::FeedError::AlreadyRegistered { .. }) => {}
                Err(error) => return Err(error.into()),
            }
        }
        let feed_sub = feed.subscribe(clock.id())?;

        let freq_adjust_base = freq_store.load(clock.id()).unwrap_or(0.0);
        let injector = PulseInjector::new();

        let instance = ShmInstance::new(
            InstanceParams {
                name: name.to_string(),
                config: config.clone(),
                clock,
                feed_sub,
                event_source: Box::new(injector.source()),
                freq_adjust_base,
            },
            monotonic_now(),
        );
        Ok((instance, injector))
    }

    /// Starts processing in every module.
    pub fn run(&self) -> Result<(), SyncError> {
        self.shm.run()
    }

    /// Names of the instances that started.
    pub fn instances(&self) -> &[String] {
        &self.instances
    }

    /// The pulse injection point for one instance.
    pub fn injector(&self, instance: &str) -> Option<&PulseInjector> {
        self.injectors.get(instance)
    }

    /// The feed service handle.
    pub fn feed(&self) -> &FeedHandle {
        &self.feed
    }

    pub fn get_status(&self, instance: &str) -> Result<InstanceStatus, SyncError> {
        self.shm.get_status(instance)
    }

    pub fn control(
        &self,
        instance: &str,
        mask: ControlFlags,
        flags: ControlFlags,
    ) -> Result<(), SyncError> {
        self.shm.control(instance, mask, flags)
    }

    pub fn step_clock(&self, instance: &str, offset: Nanos) -> Result<(), SyncError> {
        self.shm.step_clock(instance, offset)
    }

    pub fn save_state(&self) -> Result<(), SyncError> {
        self.shm.save_state()
    }

    pub fn log_stats(&self) -> Result<(), SyncError> {
        self.shm.log_stats()
    }

    pub fn stats_end_period(&self, time: WallTime) -> Result<(), SyncError> {
        self.shm.stats_end_period(time)
    }

    pub fn test_mode(&self, instance: &str, mode: TestModeId) -> Result<(), SyncError> {
        self.shm.test_mode(instance, mode)
    }

    pub fn pid_adjust(
        &self,
        module_mask: u32,
        kp: Option<f64>,
        ki: Option<f64>,
        kd: Option<f64>,
        reset: bool,
    ) -> Result<(), SyncError> {
        self.shm.pid_adjust(module_mask, kp, ki, kd, reset)
    }

    /// Assembles the full topology report from every instance's fragment.
    pub fn topology(&self) -> Result<String, SyncError> {
        let mut report = String::from("syntond topology\n");
        for name in &self.instances {
            report.push_str(&self.shm.write_topology(name)?);
        }
        Ok(report)
    }

    /// Drains pending module notifications, logging state changes.
    pub fn drain_events(&self) -> Vec<EngineEvent> {
        let mut drained = Vec::new();
        while let Some(event) = self.events.try_recv() {
            if let EngineEvent::StateChanged(status) = &event {
                tracing::info!(
                    instance = %status.name,
                    state = %status.state,
                    alarms = %status.alarms,
                    "instance status changed"
                );
            }
            drained.push(event);
        }
        drained
    }
}
