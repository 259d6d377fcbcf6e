// Keyboard teleop: WASD walk/turn, 1-9 special actions, G gait, Space stop,
// C clear stop, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use tracing::info;

use quadruped_motion_runtime::actions::SpecialAction;
use quadruped_motion_runtime::config::TOPIC_CMD_INTENT;
use quadruped_motion_runtime::gait::GaitPattern;
use quadruped_motion_runtime::messages::{Direction, Intent, MovementIntent};

const INPUT_TIMEOUT_MS: u64 = 150; // Stop walking after this much time with no input

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_INTENT).await?;

    info!("Controls: WASD=walk/turn, 1-9=actions, G=gait, Space=stop, C=clear, Q=quit");

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn send(
    publisher: &zenoh::pubsub::Publisher<'_>,
    intent: &Intent,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    publisher.put(serde_json::to_string(intent)?).await?;
    Ok(())
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut movement = MovementIntent::STOP;
    let mut published = MovementIntent::STOP;
    let mut pattern = GaitPattern::Trot;
    let mut last_movement_input = Instant::now();

    loop {
        // Poll for key with 20ms timeout (50Hz effective rate)
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;
                let mut one_shot = None;

                match code {
                    KeyCode::Char('w') if pressed => {
                        movement.forward_back = Direction::Positive;
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('s') if pressed => {
                        movement.forward_back = Direction::Negative;
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('a') if pressed => {
                        movement.left_right = Direction::Negative;
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('d') if pressed => {
                        movement.left_right = Direction::Positive;
                        last_movement_input = Instant::now();
                    }

                    KeyCode::Char(c @ '1'..='9') if kind == KeyEventKind::Press => {
                        let mode = c as u8 - b'0';
                        if let Some(action) = SpecialAction::from_func_mode(mode) {
                            info!("Action: {}", action);
                            one_shot = Some(Intent::Action { action });
                        }
                    }
                    KeyCode::Char('g') if kind == KeyEventKind::Press => {
                        pattern = match pattern {
                            GaitPattern::Trot => GaitPattern::Tripod,
                            GaitPattern::Tripod => GaitPattern::Trot,
                        };
                        info!("Gait: {:?}", pattern);
                        one_shot = Some(Intent::SetGait { pattern });
                    }
                    KeyCode::Char(' ') if kind == KeyEventKind::Press => {
                        info!("Emergency stop");
                        one_shot = Some(Intent::EmergencyStop);
                    }
                    KeyCode::Char('c') if kind == KeyEventKind::Press => {
                        info!("Clearing stop");
                        one_shot = Some(Intent::ClearStop);
                    }

                    // Quit
                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }

                if let Some(intent) = one_shot {
                    send(publisher, &intent).await?;
                }
            }
        }

        // Stop walking if no movement input for INPUT_TIMEOUT_MS
        if last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            movement = MovementIntent::STOP;
        }

        // Intents are latched by the runtime; only send changes
        if movement != published {
            send(publisher, &Intent::Move(movement)).await?;
            published = movement;
        }
    }

    send(publisher, &Intent::Move(MovementIntent::STOP)).await?;
    Ok(())
}
