// End-to-end scenarios for the motion engine: scheduler driven the way the
// control loop drives it, with an in-memory or file-backed calibration.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use quadruped_motion_runtime::actions::SpecialAction;
use quadruped_motion_runtime::calibration::{
    Calibration, DEFAULT_CENTER_OFFSET, JsonFileStore, MemoryStore, actuator_to_angle,
    map_to_actuator,
};
use quadruped_motion_runtime::config::MotionConfig;
use quadruped_motion_runtime::gait::GaitPattern;
use quadruped_motion_runtime::kinematics::{forward_leg, solve_leg};
use quadruped_motion_runtime::messages::{Direction, MotionState, MovementIntent, TelemetrySample};
use quadruped_motion_runtime::robot::{
    FootTarget, JointCommands, JointId, LegAngles, LegJoint, LegRole,
};
use quadruped_motion_runtime::safety::{SafetyMonitor, SafetyRequest, StopFlag};
use quadruped_motion_runtime::scheduler::{MotionError, MotionScheduler};

const TICK: Duration = Duration::from_millis(20);
const BUDGET: Duration = Duration::from_secs(1);

fn engine(config: &MotionConfig) -> (MotionScheduler, SafetyMonitor) {
    let flag = StopFlag::new();
    let calibration = Calibration::load(Box::new(MemoryStore::new())).unwrap();
    let scheduler = MotionScheduler::new(config, calibration, flag.clone());
    (scheduler, SafetyMonitor::new(config.safety, flag))
}

fn walk(forward_back: Direction, left_right: Direction) -> MovementIntent {
    MovementIntent::new(forward_back, left_right)
}

fn leg_commands(commands: &JointCommands, role: LegRole) -> Vec<i32> {
    role.joints().iter().map(|&j| commands.get(j).0).collect()
}

#[test]
fn test_walking_cycle_returns_to_start() {
    let config = MotionConfig::default();
    let (mut scheduler, _) = engine(&config);
    scheduler
        .set_movement_intent(walk(Direction::Positive, Direction::Zero))
        .unwrap();

    let cycle = config.ticks_per_cycle() as usize;
    let first: Vec<_> = (0..cycle)
        .map(|_| scheduler.tick(Instant::now(), BUDGET).unwrap())
        .collect();
    let second: Vec<_> = (0..cycle)
        .map(|_| scheduler.tick(Instant::now(), BUDGET).unwrap())
        .collect();

    // Periodic: the second cycle repeats the first exactly
    assert_eq!(first, second);
    assert!(scheduler.last_solve_error().is_none());
    assert_eq!(scheduler.current_state(), MotionState::Walking);
}

#[test]
fn test_trot_diagonals_move_together() {
    let config = MotionConfig::default();
    let (mut scheduler, _) = engine(&config);
    scheduler
        .set_movement_intent(walk(Direction::Positive, Direction::Zero))
        .unwrap();

    for _ in 0..config.ticks_per_cycle() {
        scheduler.tick(Instant::now(), BUDGET);
        let fl = scheduler.leg_angles(LegRole::FrontLeft);
        let br = scheduler.leg_angles(LegRole::BackRight);
        assert!((fl.hip - br.hip).abs() < 1e-9);
        assert!((fl.thigh - br.thigh).abs() < 1e-9);
    }
}

#[test]
fn test_second_special_action_is_rejected() {
    let (mut scheduler, _) = engine(&MotionConfig::default());
    let t0 = Instant::now();
    scheduler.trigger_special_action("handshake", t0).unwrap();
    for k in 1..=5 {
        scheduler.tick(t0 + TICK * k, BUDGET);
    }
    let progress = scheduler.action_progress();
    assert_eq!(progress, Some(TICK * 5));

    let err = scheduler.trigger_special_action("jump", t0).unwrap_err();
    assert!(matches!(
        err,
        MotionError::ActionInProgress(SpecialAction::Handshake)
    ));
    assert_eq!(scheduler.action_progress(), progress);

    scheduler.tick(t0 + TICK * 6, BUDGET);
    assert_eq!(scheduler.action_progress(), Some(TICK * 6));
}

#[test]
fn test_unknown_action_is_rejected_synchronously() {
    let (mut scheduler, _) = engine(&MotionConfig::default());
    assert!(matches!(
        scheduler.trigger_special_action("backflip", Instant::now()),
        Err(MotionError::UnknownAction(_))
    ));
    assert_eq!(scheduler.current_state(), MotionState::Idle);
}

#[test]
fn test_action_times_out_on_stalled_clock() {
    let (mut scheduler, _) = engine(&MotionConfig::default());
    let t0 = Instant::now();
    scheduler
        .start_special_action(SpecialAction::Dance, t0)
        .unwrap();
    scheduler.tick(t0 + TICK, BUDGET);

    // A loop that stalled for a minute finds the action timed out
    scheduler.tick(t0 + Duration::from_secs(60), BUDGET);
    assert_eq!(scheduler.current_state(), MotionState::Idle);
}

#[test]
fn test_force_stop_freezes_until_cleared() {
    let (mut scheduler, mut monitor) = engine(&MotionConfig::default());
    scheduler
        .set_movement_intent(walk(Direction::Positive, Direction::Negative))
        .unwrap();
    for _ in 0..12 {
        scheduler.tick(Instant::now(), BUDGET);
    }
    let phase = scheduler.current_phase();
    let frozen = scheduler.commands();

    monitor.handle(SafetyRequest::ForceStop);
    for _ in 0..20 {
        assert_eq!(scheduler.tick(Instant::now(), BUDGET), None);
        assert!(matches!(
            scheduler.set_movement_intent(walk(Direction::Negative, Direction::Zero)),
            Err(MotionError::EmergencyStopActive)
        ));
    }
    assert_eq!(scheduler.current_state(), MotionState::EmergencyStop);
    assert_eq!(scheduler.current_phase(), phase);
    assert_eq!(scheduler.commands(), frozen);

    monitor.handle(SafetyRequest::ClearStop);
    let idle = scheduler.tick(Instant::now(), BUDGET).unwrap();
    assert_eq!(scheduler.current_state(), MotionState::Idle);
    // Back on the neutral stand, not the frozen walking pose
    assert!(idle.iter().all(|(_, c)| c.0 == DEFAULT_CENTER_OFFSET));
    // The stored intent was reset; it takes a fresh one to walk again
    scheduler.tick(Instant::now(), BUDGET);
    assert_eq!(scheduler.current_state(), MotionState::Idle);
}

#[test]
fn test_low_battery_stops_motion() {
    let (mut scheduler, mut monitor) = engine(&MotionConfig::default());
    scheduler
        .set_movement_intent(walk(Direction::Positive, Direction::Zero))
        .unwrap();
    scheduler.tick(Instant::now(), BUDGET);

    let sample = TelemetrySample {
        battery_voltage_v: 5.9,
        roll_deg: 0.0,
        pitch_deg: 0.0,
    };
    assert!(monitor.observe(sample, Instant::now()).is_some());
    assert_eq!(scheduler.tick(Instant::now(), BUDGET), None);
    assert_eq!(scheduler.current_state(), MotionState::EmergencyStop);
}

#[test]
fn test_calibration_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    let config = MotionConfig::default();
    let joint = JointId::of_leg(LegRole::BackLeft, LegJoint::Thigh);

    {
        let calibration = Calibration::load(Box::new(JsonFileStore::new(&path))).unwrap();
        let mut scheduler = MotionScheduler::new(&config, calibration, StopFlag::new());
        scheduler.save_calibration(joint, 1987).unwrap();
    }

    let calibration = Calibration::load(Box::new(JsonFileStore::new(&path))).unwrap();
    let mut scheduler = MotionScheduler::new(&config, calibration, StopFlag::new());
    assert_eq!(scheduler.calibration_table().entry(joint).center_offset, 1987);
    let commands = scheduler.tick(Instant::now(), BUDGET).unwrap();
    assert_eq!(commands.get(joint).0, 1987);
}

#[test]
fn test_unreachable_leg_holds_previous_angles() {
    // Long stride on tall legs: the left side's stride extremes leave the
    // workspace while the right side, stepping shorter, stays inside it
    let mut config = MotionConfig::default();
    config.gait.stand_height_mm = 140.0;
    config.gait.stride_mm = 120.0;
    config.validate().unwrap();

    let (mut scheduler, _) = engine(&config);
    scheduler
        .set_movement_intent(walk(Direction::Positive, Direction::Positive))
        .unwrap();

    let mut previous = scheduler.commands();
    let mut held = 0;
    for _ in 0..config.ticks_per_cycle() * 2 {
        let before = scheduler.last_solve_error();
        let commands = scheduler.tick(Instant::now(), BUDGET).unwrap();
        let after = scheduler.last_solve_error();

        if let Some(report) = after.filter(|r| Some(*r) != before) {
            assert!(report.leg.is_left());
            assert!(report.distance_mm > 150.0);
            assert_eq!(
                leg_commands(&commands, report.leg),
                leg_commands(&previous, report.leg)
            );
            held += 1;
        }
        // Right legs never fail and keep moving
        assert_ne!(
            leg_commands(&commands, LegRole::FrontRight),
            leg_commands(&previous, LegRole::FrontRight)
        );
        previous = commands;
    }
    assert!(held > 0);
    assert_eq!(scheduler.current_state(), MotionState::Walking);
}

#[test]
fn test_pattern_switch_lands_on_cycle_boundary() {
    let config = MotionConfig::default();
    let (mut scheduler, _) = engine(&config);
    scheduler
        .set_movement_intent(walk(Direction::Positive, Direction::Zero))
        .unwrap();
    for _ in 0..5 {
        scheduler.tick(Instant::now(), BUDGET);
    }
    scheduler.request_pattern(GaitPattern::Tripod).unwrap();
    while scheduler.current_phase() != 0.0 {
        assert_eq!(scheduler.pattern(), GaitPattern::Trot);
        scheduler.tick(Instant::now(), BUDGET);
    }
    assert_eq!(scheduler.pattern(), GaitPattern::Tripod);
}

#[test]
fn test_ik_mapper_fk_round_trip() {
    let mut offsets = HashMap::new();
    for joint in JointId::all() {
        offsets.insert(joint, 1900 + joint.index() as i32 * 13);
    }
    let calibration = Calibration::load(Box::new(MemoryStore::with_offsets(offsets))).unwrap();
    let table = calibration.table();
    let config = MotionConfig::default();

    // One servo unit is 360/4096 degrees; allow a few of them in position
    let tolerance_mm = 1.0;
    for role in LegRole::ALL {
        let geometry = config.leg_geometry(role);
        for target in [
            FootTarget::new(0.0, 110.0, 20.0),
            FootTarget::new(18.0, 100.0, 25.0),
            FootTarget::new(-20.0, 90.0, 12.0),
            FootTarget::new(10.0, 130.0, 30.0),
        ] {
            let angles = solve_leg(&target, &geometry).unwrap();
            let mut back = LegAngles::default();
            for joint in LegJoint::ALL {
                let id = JointId::of_leg(role, joint);
                let command = map_to_actuator(id, angles.get(joint), table);
                let angle = actuator_to_angle(id, command, table);
                match joint {
                    LegJoint::Wiggle => back.wiggle = angle,
                    LegJoint::Hip => back.hip = angle,
                    LegJoint::Thigh => back.thigh = angle,
                }
            }
            let reached = forward_leg(&back, &geometry);
            assert!(
                reached.distance_to(&target) < tolerance_mm,
                "{role}: {target} came back as {reached}"
            );
        }
    }
}
