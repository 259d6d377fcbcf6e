pub mod actions;
pub mod calibration;
pub mod config;
pub mod gait;
pub mod kinematics;
pub mod messages;
pub mod motor;
pub mod robot;
pub mod runtime;
pub mod safety;
pub mod scheduler;
