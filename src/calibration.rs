// Per-joint calibration and the angle-to-actuator mapper.
//
// Every joint has a center offset (the raw servo position of its neutral
// pose) and a fixed direction sign reflecting how the servo is mounted. The
// offsets live in a `CalibrationStore` and are only changed through
// `Calibration::save`, which persists before it reports success.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::robot::{ActuatorCommand, JOINT_COUNT, JointId, LegJoint};

/// Servo position units per degree: 4096 steps per revolution (STS3215).
pub const UNITS_PER_DEGREE: f64 = 4096.0 / 360.0;

/// Factory center position of an STS servo.
pub const DEFAULT_CENTER_OFFSET: i32 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectionSign {
    Forward,
    Reversed,
}

impl DirectionSign {
    pub fn sign(self) -> i32 {
        match self {
            DirectionSign::Forward => 1,
            DirectionSign::Reversed => -1,
        }
    }
}

/// Mounting direction of each joint. The right side is a mirror image of
/// the left, so its wiggle and hip servos turn the other way.
pub fn mounting_direction(joint: JointId) -> DirectionSign {
    match joint.leg() {
        Some((role, LegJoint::Wiggle | LegJoint::Hip)) if !role.is_left() => DirectionSign::Reversed,
        Some((role, LegJoint::Thigh)) if role.is_left() => DirectionSign::Reversed,
        _ => DirectionSign::Forward,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationEntry {
    pub joint: JointId,
    pub center_offset: i32,
    pub direction: DirectionSign,
}

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("Failed to persist calibration for joint {joint}: {reason}")]
    PersistFailure { joint: JointId, reason: String },

    #[error("Failed to load calibration: {0}")]
    Load(String),
}

/// Non-volatile storage for center offsets.
pub trait CalibrationStore: Send {
    /// All stored offsets. Joints missing from the map use the default.
    fn load_all(&mut self) -> Result<HashMap<JointId, i32>, CalibrationError>;

    /// Store one offset durably. Must not return `Ok` before the value would
    /// survive a restart.
    fn persist(&mut self, joint: JointId, center_offset: i32) -> Result<(), CalibrationError>;
}

/// Exactly one entry per joint.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    entries: [CalibrationEntry; JOINT_COUNT],
}

impl Default for CalibrationTable {
    fn default() -> Self {
        let mut entries = [CalibrationEntry {
            joint: JointId::aux(0),
            center_offset: DEFAULT_CENTER_OFFSET,
            direction: DirectionSign::Forward,
        }; JOINT_COUNT];
        for joint in JointId::all() {
            entries[joint.index()] = CalibrationEntry {
                joint,
                center_offset: DEFAULT_CENTER_OFFSET,
                direction: mounting_direction(joint),
            };
        }
        Self { entries }
    }
}

impl CalibrationTable {
    pub fn from_offsets(offsets: &HashMap<JointId, i32>) -> Self {
        let mut table = Self::default();
        for (&joint, &offset) in offsets {
            table.entries[joint.index()].center_offset = offset;
        }
        table
    }

    pub fn entry(&self, joint: JointId) -> &CalibrationEntry {
        &self.entries[joint.index()]
    }

    pub fn entries(&self) -> &[CalibrationEntry] {
        &self.entries
    }

    fn set_offset(&mut self, joint: JointId, center_offset: i32) {
        self.entries[joint.index()].center_offset = center_offset;
    }
}

/// Map a joint angle to a raw servo position.
///
/// No clamping: an out-of-range result means the geometry is wrong and must
/// stay visible.
pub fn map_to_actuator(joint: JointId, angle_deg: f64, table: &CalibrationTable) -> ActuatorCommand {
    let entry = table.entry(joint);
    let span = (angle_deg * UNITS_PER_DEGREE).round() as i32;
    ActuatorCommand(span * entry.direction.sign() + entry.center_offset)
}

/// Inverse of [`map_to_actuator`], up to the rounding of one servo unit.
pub fn actuator_to_angle(joint: JointId, command: ActuatorCommand, table: &CalibrationTable) -> f64 {
    let entry = table.entry(joint);
    ((command.0 - entry.center_offset) * entry.direction.sign()) as f64 / UNITS_PER_DEGREE
}

/// The live calibration table together with its backing store.
pub struct Calibration {
    table: CalibrationTable,
    store: Box<dyn CalibrationStore>,
}

impl Calibration {
    /// Load all offsets from the store; joints it doesn't know keep the
    /// manufacturer default.
    pub fn load(mut store: Box<dyn CalibrationStore>) -> Result<Self, CalibrationError> {
        let offsets = store.load_all()?;
        info!(
            "Loaded calibration for {} of {} joints",
            offsets.len(),
            JOINT_COUNT
        );
        Ok(Self {
            table: CalibrationTable::from_offsets(&offsets),
            store,
        })
    }

    pub fn table(&self) -> &CalibrationTable {
        &self.table
    }

    /// Overwrite the center offset of one joint and persist it.
    ///
    /// On a store failure the in-memory value is restored to the last
    /// durable one.
    pub fn save(&mut self, joint: JointId, center_offset: i32) -> Result<(), CalibrationError> {
        let previous = self.table.entry(joint).center_offset;
        self.table.set_offset(joint, center_offset);

        match self.store.persist(joint, center_offset) {
            Ok(()) => {
                info!("Calibrated {}: center {} -> {}", joint, previous, center_offset);
                Ok(())
            }
            Err(e) => {
                warn!("Rolling back calibration of {}: {}", joint, e);
                self.table.set_offset(joint, previous);
                Err(e)
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct CalibrationFile {
    joints: Vec<StoredOffset>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredOffset {
    joint: JointId,
    center_offset: i32,
}

/// Calibration kept in a JSON file, rewritten atomically on every save.
pub struct JsonFileStore {
    path: PathBuf,
    offsets: HashMap<JointId, i32>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offsets: HashMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, offsets: &HashMap<JointId, i32>) -> std::io::Result<()> {
        let mut joints: Vec<StoredOffset> = offsets
            .iter()
            .map(|(&joint, &center_offset)| StoredOffset {
                joint,
                center_offset,
            })
            .collect();
        joints.sort_by_key(|s| s.joint);
        let json = serde_json::to_string_pretty(&CalibrationFile { joints })?;

        // Write next to the target, then rename over it
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        sync_parent_dir(&self.path)
    }
}

/// Flush the directory entry so a completed rename survives power loss.
fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::File::open(dir)?.sync_all()
}

impl CalibrationStore for JsonFileStore {
    fn load_all(&mut self) -> Result<HashMap<JointId, i32>, CalibrationError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No calibration file at {}, using defaults", self.path.display());
                self.offsets.clear();
                return Ok(HashMap::new());
            }
            Err(e) => return Err(CalibrationError::Load(e.to_string())),
        };
        let file: CalibrationFile = serde_json::from_str(&contents)
            .map_err(|e| CalibrationError::Load(format!("{}: {}", self.path.display(), e)))?;

        self.offsets = file
            .joints
            .into_iter()
            .map(|s| (s.joint, s.center_offset))
            .collect();
        Ok(self.offsets.clone())
    }

    fn persist(&mut self, joint: JointId, center_offset: i32) -> Result<(), CalibrationError> {
        let mut next = self.offsets.clone();
        next.insert(joint, center_offset);
        self.write_file(&next)
            .map_err(|e| CalibrationError::PersistFailure {
                joint,
                reason: e.to_string(),
            })?;
        self.offsets = next;
        Ok(())
    }
}

/// In-process store, used for simulation and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    offsets: HashMap<JointId, i32>,
    fail_persist: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offsets(offsets: HashMap<JointId, i32>) -> Self {
        Self {
            offsets,
            fail_persist: false,
        }
    }

    /// Make every subsequent persist fail.
    pub fn failing() -> Self {
        Self {
            offsets: HashMap::new(),
            fail_persist: true,
        }
    }
}

impl CalibrationStore for MemoryStore {
    fn load_all(&mut self) -> Result<HashMap<JointId, i32>, CalibrationError> {
        Ok(self.offsets.clone())
    }

    fn persist(&mut self, joint: JointId, center_offset: i32) -> Result<(), CalibrationError> {
        if self.fail_persist {
            return Err(CalibrationError::PersistFailure {
                joint,
                reason: "store unavailable".to_string(),
            });
        }
        self.offsets.insert(joint, center_offset);
        Ok(())
    }
}
