//! Operator console for a telebot: answers the robot's WebRTC offer over a
//! WebSocket signaling channel, receives its video stream, and streams merged
//! keyboard/gamepad input back as differential-drive commands.

pub mod commands;
pub mod control;
pub mod signal_message;
pub mod telebot_link;
