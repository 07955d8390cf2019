use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use webrtc::data_channel::RTCDataChannel;

/// Axis magnitudes below this are treated as neutral.
pub const DEADZONE: f64 = 0.1;

const FULL_POWER: f64 = 100.0;
const ANALOG_SAMPLE_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl FromStr for Direction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            _ => Err(()),
        }
    }
}

/// The single shared source of truth for operator input: which directions are
/// held, plus the most recent analog axis sample.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct InputState {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub axis_x: f64,
    pub axis_y: f64,
}

impl InputState {
    fn slot(&mut self, direction: Direction) -> &mut bool {
        match direction {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
            Direction::Left => &mut self.left,
            Direction::Right => &mut self.right,
        }
    }

    /// Marks a direction held. Returns true only on the press edge, so key
    /// repeat never causes a retransmission.
    pub fn press(&mut self, direction: Direction) -> bool {
        let held = self.slot(direction);
        if *held {
            false
        } else {
            *held = true;
            true
        }
    }

    /// Marks a direction released. Returns true only on the release edge.
    pub fn release(&mut self, direction: Direction) -> bool {
        let held = self.slot(direction);
        if *held {
            *held = false;
            true
        } else {
            false
        }
    }
}

/// Differential drive power for the two wheel sides, each in [-100, 100].
///
/// Never stored: always recomputed from the current [`InputState`].
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveCommand {
    pub left: i32,
    pub right: i32,
}

#[derive(Serialize)]
struct ControlFrame {
    control: DriveCommand,
}

fn apply_deadzone(axis: f64) -> f64 {
    if axis.abs() < DEADZONE {
        0.0
    } else {
        axis
    }
}

impl DriveCommand {
    /// Differential steering mix.
    ///
    /// The analog axes provide a continuous bias and up/down add to both
    /// sides. A left/right turn is clamped toward zero on the inside wheel, so
    /// a turn can reduce that wheel to a stop but never reverse it against a
    /// concurrent forward/backward command.
    pub fn mix(state: &InputState) -> Self {
        let axis_x = apply_deadzone(state.axis_x);
        let axis_y = apply_deadzone(state.axis_y);

        let mut left = -axis_y + axis_x;
        let mut right = -axis_y - axis_x;

        if state.up {
            left += 1.0;
            right += 1.0;
        }
        if state.down {
            left -= 1.0;
            right -= 1.0;
        }
        if state.left {
            left = (left - 1.0).min(0.0);
            right = (right + 1.0).max(0.0);
        }
        if state.right {
            left = (left + 1.0).max(0.0);
            right = (right - 1.0).min(0.0);
        }

        DriveCommand {
            left: (left.clamp(-1.0, 1.0) * FULL_POWER).round() as i32,
            right: (right.clamp(-1.0, 1.0) * FULL_POWER).round() as i32,
        }
    }

    /// Encodes the data-channel frame: `{"control":{"left":L,"right":R}}`.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&ControlFrame { control: *self })
    }
}

/// Transmission sink for drive commands: the data channel the remote peer
/// opens during negotiation.
///
/// Sending before the channel exists, or while it is not yet ready, is not an
/// error; the frame is simply dropped.
#[derive(Clone)]
pub struct ControlSink {
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
}

impl ControlSink {
    pub fn new() -> Self {
        Self {
            channel: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn attach(&self, channel: Arc<RTCDataChannel>) {
        info!("Control sink attached to data channel: {}", channel.label());
        self.channel.lock().await.replace(channel);
    }

    pub async fn send(&self, command: &DriveCommand) {
        let channel = self.channel.lock().await.clone();
        let Some(channel) = channel else {
            debug!("No data channel yet, dropping control frame");
            return;
        };
        let frame = match command.to_wire() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode control frame: {e}");
                return;
            }
        };
        if let Err(e) = channel.send_text(frame).await {
            debug!("Control frame dropped: {e}");
        }
    }
}

impl Default for ControlSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the current gamepad axis pair, `(x, y)` each in [-1.0, 1.0].
pub type AxisReadFn = Box<dyn Fn() -> (f64, f64) + Send + Sync>;

/// Merges keyboard and gamepad input into drive commands and transmits one
/// whenever the merged state changes: on every press/release edge, on every
/// periodic analog sample while a gamepad is attached, and once more when the
/// gamepad detaches.
pub struct Controller {
    input: Arc<Mutex<InputState>>,
    sink: ControlSink,
    sampler: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Controller {
    pub fn new(sink: ControlSink) -> Self {
        Self {
            input: Arc::new(Mutex::new(InputState::default())),
            sink,
            sampler: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn key_down(&self, direction: Direction) {
        let command = {
            let mut input = self.input.lock().await;
            if !input.press(direction) {
                return;
            }
            DriveCommand::mix(&input)
        };
        self.sink.send(&command).await;
    }

    pub async fn key_up(&self, direction: Direction) {
        let command = {
            let mut input = self.input.lock().await;
            if !input.release(direction) {
                return;
            }
            DriveCommand::mix(&input)
        };
        self.sink.send(&command).await;
    }

    /// Stores an analog sample and transmits the resulting command.
    pub async fn set_axes(&self, x: f64, y: f64) {
        let command = {
            let mut input = self.input.lock().await;
            input.axis_x = x.clamp(-1.0, 1.0);
            input.axis_y = y.clamp(-1.0, 1.0);
            DriveCommand::mix(&input)
        };
        self.sink.send(&command).await;
    }

    /// The command the current input state would produce.
    pub async fn current_command(&self) -> DriveCommand {
        DriveCommand::mix(&*self.input.lock().await)
    }

    /// Starts the periodic analog sampler, replacing any previous one. The
    /// first sample is taken immediately, which covers the connect edge.
    pub async fn gamepad_connected(&self, read_axes: AxisReadFn) {
        info!("Gamepad connected, starting analog sampler");
        let input = Arc::clone(&self.input);
        let sink = self.sink.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ANALOG_SAMPLE_PERIOD);
            loop {
                interval.tick().await;
                let (x, y) = read_axes();
                let command = {
                    let mut input = input.lock().await;
                    input.axis_x = x.clamp(-1.0, 1.0);
                    input.axis_y = y.clamp(-1.0, 1.0);
                    DriveCommand::mix(&input)
                };
                sink.send(&command).await;
            }
        });
        if let Some(previous) = self.sampler.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Stops the sampler, zeroes the axes and transmits one final command.
    pub async fn gamepad_disconnected(&self) {
        if let Some(sampler) = self.sampler.lock().await.take() {
            info!("Gamepad disconnected, stopping analog sampler");
            sampler.abort();
        }
        let command = {
            let mut input = self.input.lock().await;
            input.axis_x = 0.0;
            input.axis_y = 0.0;
            DriveCommand::mix(&input)
        };
        self.sink.send(&command).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(directions: &[Direction]) -> InputState {
        let mut state = InputState::default();
        for direction in directions {
            state.press(*direction);
        }
        state
    }

    #[test]
    fn forward_only_is_full_power() {
        let command = DriveCommand::mix(&held(&[Direction::Up]));
        assert_eq!(command, DriveCommand { left: 100, right: 100 });
    }

    #[test]
    fn forward_left_stops_inside_wheel() {
        let command = DriveCommand::mix(&held(&[Direction::Up, Direction::Left]));
        assert_eq!(command, DriveCommand { left: 0, right: 100 });
    }

    #[test]
    fn reverse_only_is_full_reverse() {
        let command = DriveCommand::mix(&held(&[Direction::Down]));
        assert_eq!(command, DriveCommand { left: -100, right: -100 });
    }

    #[test]
    fn analog_turn_in_place() {
        let state = InputState {
            axis_x: 0.5,
            ..Default::default()
        };
        assert_eq!(DriveCommand::mix(&state), DriveCommand { left: 50, right: -50 });
    }

    #[test]
    fn sub_deadzone_axis_is_neutral() {
        let state = InputState {
            axis_x: 0.05,
            ..Default::default()
        };
        assert_eq!(DriveCommand::mix(&state), DriveCommand { left: 0, right: 0 });
    }

    fn all_direction_combos() -> Vec<InputState> {
        let mut combos = Vec::new();
        for bits in 0..16u8 {
            combos.push(InputState {
                up: bits & 1 != 0,
                down: bits & 2 != 0,
                left: bits & 4 != 0,
                right: bits & 8 != 0,
                ..Default::default()
            });
        }
        combos
    }

    #[test]
    fn output_always_within_bounds() {
        let axes = [-1.0, -0.5, -0.1, 0.0, 0.3, 1.0];
        for mut state in all_direction_combos() {
            for x in axes {
                for y in axes {
                    state.axis_x = x;
                    state.axis_y = y;
                    let command = DriveCommand::mix(&state);
                    assert!((-100..=100).contains(&command.left), "{state:?}");
                    assert!((-100..=100).contains(&command.right), "{state:?}");
                }
            }
        }
    }

    #[test]
    fn deadzone_contributes_exactly_zero() {
        for mut state in all_direction_combos() {
            for axis in [0.05, -0.09, 0.0999] {
                state.axis_x = axis;
                state.axis_y = -axis;
                let with_deadzone = DriveCommand::mix(&state);
                state.axis_x = 0.0;
                state.axis_y = 0.0;
                assert_eq!(with_deadzone, DriveCommand::mix(&state));
            }
        }
    }

    #[test]
    fn turn_never_reverses_inside_wheel() {
        let axes = [-1.0, -0.4, 0.0, 0.4, 1.0];
        for up in [false, true] {
            for down in [false, true] {
                for x in axes {
                    for y in axes {
                        let state = InputState {
                            up,
                            down,
                            left: true,
                            right: false,
                            axis_x: x,
                            axis_y: y,
                        };
                        let command = DriveCommand::mix(&state);
                        assert!(command.left <= 0, "{state:?} -> {command:?}");
                        assert!(command.right >= 0, "{state:?} -> {command:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn mix_is_deterministic() {
        let state = InputState {
            up: true,
            axis_x: 0.33,
            axis_y: -0.7,
            ..Default::default()
        };
        assert_eq!(DriveCommand::mix(&state), DriveCommand::mix(&state));
    }

    #[test]
    fn press_and_release_are_edge_triggered() {
        let mut state = InputState::default();
        assert!(state.press(Direction::Up));
        assert!(!state.press(Direction::Up));
        assert!(state.release(Direction::Up));
        assert!(!state.release(Direction::Up));
    }

    #[test]
    fn wire_frame_shape() {
        let frame = DriveCommand { left: 50, right: -50 }.to_wire().unwrap();
        assert_eq!(frame, r#"{"control":{"left":50,"right":-50}}"#);
    }

    #[tokio::test]
    async fn sampler_tracks_axes_and_stops_on_disconnect() {
        let controller = Controller::new(ControlSink::new());
        controller
            .gamepad_connected(Box::new(|| (0.5, 0.0)))
            .await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            controller.current_command().await,
            DriveCommand { left: 50, right: -50 }
        );

        controller.gamepad_disconnected().await;
        assert_eq!(
            controller.current_command().await,
            DriveCommand { left: 0, right: 0 }
        );
    }

    #[tokio::test]
    async fn key_edges_update_state() {
        let controller = Controller::new(ControlSink::new());
        controller.key_down(Direction::Up).await;
        controller.key_down(Direction::Up).await;
        assert_eq!(
            controller.current_command().await,
            DriveCommand { left: 100, right: 100 }
        );
        controller.key_up(Direction::Up).await;
        assert_eq!(
            controller.current_command().await,
            DriveCommand { left: 0, right: 0 }
        );
    }
}
