// Control loop and telemetry task
//
// The control loop owns the scheduler and the actuator and ticks at LOOP_HZ.
// The telemetry task owns the safety monitor and is the only writer of the
// stop flag; the control loop reaches it through an unbounded request
// channel, so a stop request is never dropped.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::calibration::{Calibration, JsonFileStore};
use crate::config::{
    MOTOR_ENABLED, MotionConfig, TELEMETRY_PERIOD, TOPIC_CMD_INTENT, TOPIC_CMD_LEGACY,
    TOPIC_RT_JOINTS, TOPIC_STATUS, TOPIC_TELEMETRY,
};
use crate::messages::{Intent, LegacyDecoder, MotionStatus, TelemetrySample};
use crate::motor::{Actuator, FeetechActuator, FeetechError, SimulatedActuator};
use crate::robot::JointCommands;
use crate::safety::{SafetyMonitor, SafetyRequest, SafetySnapshot, StopFlag};
use crate::scheduler::MotionScheduler;

pub struct RuntimeOptions {
    pub config: MotionConfig,
    pub calibration_path: PathBuf,
    pub port: String,
    pub simulate: bool,
}

pub struct Runtime {
    scheduler: MotionScheduler,
    actuator: Box<dyn Actuator>,
    decoder: LegacyDecoder,
    safety: mpsc::UnboundedSender<SafetyRequest>,
    budget: Duration,
}

impl Runtime {
    pub fn new(
        scheduler: MotionScheduler,
        actuator: Box<dyn Actuator>,
        safety: mpsc::UnboundedSender<SafetyRequest>,
        budget: Duration,
    ) -> Self {
        Self {
            scheduler,
            actuator,
            decoder: LegacyDecoder::new(),
            safety,
            budget,
        }
    }

    pub fn scheduler(&self) -> &MotionScheduler {
        &self.scheduler
    }

    /// Apply one decoded intent. Rejections are logged, never fatal.
    pub fn on_intent(&mut self, intent: Intent, now: Instant) {
        debug!("Received intent: {:?}", intent);
        let result = match intent {
            Intent::Move(movement) => self.scheduler.set_movement_intent(movement),
            Intent::Action { action } => self.scheduler.start_special_action(action, now),
            Intent::Calibrate {
                joint,
                center_offset,
            } => self.scheduler.save_calibration(joint, center_offset),
            Intent::SetGait { pattern } => self.scheduler.request_pattern(pattern),
            Intent::EmergencyStop => {
                self.forward(SafetyRequest::ForceStop);
                Ok(())
            }
            Intent::ClearStop => {
                self.forward(SafetyRequest::ClearStop);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("Rejected {:?}: {}", intent, e);
        }
    }

    /// Decode a legacy `var=..&val=..` command and apply it.
    pub fn on_legacy(&mut self, query: &str, now: Instant) {
        match self.decoder.decode(query) {
            Ok(intent) => self.on_intent(intent, now),
            Err(e) => warn!("Failed to decode legacy command '{}': {}", query, e),
        }
    }

    fn forward(&self, request: SafetyRequest) {
        // Only fails once the telemetry task is gone
        if let Err(e) = self.safety.send(request) {
            warn!("Could not forward {:?} to safety monitor: {}", request, e);
        }
    }

    /// Tick the scheduler and commit the result. `None` while stopped.
    /// The commit counts toward the tick budget.
    pub fn tick(&mut self, now: Instant) -> Option<JointCommands> {
        let started = Instant::now();
        let commands = self.scheduler.compute(now);
        if let Some(commands) = &commands {
            if let Err(e) = self.actuator.commit(commands) {
                warn!("Actuator commit failed: {}", e);
            }
        }
        self.scheduler.record_tick(started.elapsed(), self.budget);
        commands
    }

    pub fn status(&self, safety: &SafetySnapshot) -> MotionStatus {
        self.scheduler.status(safety)
    }
}

fn open_actuator(options: &RuntimeOptions) -> Result<Box<dyn Actuator>, FeetechError> {
    if options.simulate || !MOTOR_ENABLED {
        info!("Motors disabled, using simulated actuator");
        return Ok(Box::new(SimulatedActuator::new()));
    }
    let mut actuator = FeetechActuator::open(&options.port)?;
    actuator.initialize()?;
    Ok(Box::new(actuator))
}

pub async fn run(options: RuntimeOptions) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let sub_intent = session.declare_subscriber(TOPIC_CMD_INTENT).await?;
    let sub_legacy = session.declare_subscriber(TOPIC_CMD_LEGACY).await?;
    let sub_telemetry = session.declare_subscriber(TOPIC_TELEMETRY).await?;
    let pub_joints = session.declare_publisher(TOPIC_RT_JOINTS).await?;
    let pub_status = session.declare_publisher(TOPIC_STATUS).await?;

    let stop_flag = StopFlag::new();
    let calibration = Calibration::load(Box::new(JsonFileStore::new(&options.calibration_path)))?;
    let scheduler = MotionScheduler::new(&options.config, calibration, stop_flag.clone());
    let actuator = open_actuator(&options)?;

    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<SafetyRequest>();
    let (snapshot_tx, snapshot_rx) = watch::channel(SafetySnapshot::default());
    let mut monitor = SafetyMonitor::new(options.config.safety, stop_flag);

    // Telemetry task: sole writer of the stop flag
    tokio::spawn(async move {
        let mut tick = interval(TELEMETRY_PERIOD);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    while let Ok(Some(sample)) = sub_telemetry.try_recv() {
                        let payload = sample.payload().to_bytes();
                        match serde_json::from_slice::<TelemetrySample>(&payload) {
                            Ok(reading) => {
                                monitor.observe(reading, Instant::now());
                            }
                            Err(e) => warn!("Failed to parse telemetry: {}", e),
                        }
                    }
                }
                request = request_rx.recv() => match request {
                    Some(request) => monitor.handle(request),
                    None => break,
                },
            }
            snapshot_tx.send_replace(monitor.snapshot(Instant::now()));
        }
    });

    let budget = options.config.tick_period();
    let mut runtime = Runtime::new(scheduler, actuator, request_tx, budget);
    let mut tick = interval(budget);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        "Runtime started: {}ms tick, {} ticks per gait cycle",
        budget.as_millis(),
        options.config.ticks_per_cycle()
    );
    info!("Subscribed to: {}, {}, {}", TOPIC_CMD_INTENT, TOPIC_CMD_LEGACY, TOPIC_TELEMETRY);
    info!("Publishing to: {}, {}", TOPIC_RT_JOINTS, TOPIC_STATUS);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
        let now = Instant::now();

        // 1. Drain pending intents (non-blocking); last write wins
        while let Ok(Some(sample)) = sub_intent.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<Intent>(&payload) {
                Ok(intent) => runtime.on_intent(intent, now),
                Err(e) => warn!("Failed to parse intent: {}", e),
            }
        }
        while let Ok(Some(sample)) = sub_legacy.try_recv() {
            let payload = sample.payload().to_bytes();
            runtime.on_legacy(&String::from_utf8_lossy(&payload), now);
        }

        // 2. Tick and commit; nothing goes out while stopped
        if let Some(commands) = runtime.tick(now) {
            pub_joints.put(serde_json::to_string(&commands)?).await?;
        }

        // 3. Publish status
        let safety = *snapshot_rx.borrow();
        let status_json = serde_json::to_string(&runtime.status(&safety))?;
        pub_status.put(status_json).await?;
    }

    Ok(())
}
