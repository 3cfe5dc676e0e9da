use crate::EngineError;
use pmon_core::InstanceState;
use std::fmt;

pub const ERRORS_RUNNING_MESSAGE: &str = "One or more tasks failed but execution continues.";
pub const EXECUTION_HALTED_MESSAGE: &str = "One or more tasks failed, execution halted.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LampColor {
    Gray,
    Green,
    Amber,
    Red,
}

impl LampColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            LampColor::Gray => "GRAY",
            LampColor::Green => "GREEN",
            LampColor::Amber => "AMBER",
            LampColor::Red => "RED",
        }
    }
}

impl fmt::Display for LampColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lamp {
    pub color: LampColor,
    pub message: Option<&'static str>,
    /// The caller should send one "check for queued work" request.
    pub request_queued_work_check: bool,
}

impl Lamp {
    fn new(color: LampColor) -> Self {
        Self {
            color,
            message: None,
            request_queued_work_check: false,
        }
    }

    fn with_message(color: LampColor, message: &'static str) -> Self {
        Self {
            color,
            message: Some(message),
            request_queued_work_check: false,
        }
    }
}

/// What the indicator remembers between updates.
///
/// `non_terminal_seen` is set by an INITIALIZED/PROCESSING instance, or by a
/// queued-work reply saying work is waiting, and reset when a queued-work
/// check goes out. `check_sent` allows one check per completed streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreakState {
    pub non_terminal_seen: bool,
    pub check_sent: bool,
}

/// Maps the newest instance's state to a lamp.
///
/// The first COMPLETED of a streak asks the service whether more work is
/// queued and resets the streak, so the lamp goes GRAY until either an
/// active instance shows up or the reply reports queued work.
pub fn indicator_for(
    latest: &InstanceState,
    streak: StreakState,
) -> Result<(Lamp, StreakState), EngineError> {
    match latest {
        InstanceState::Initialized | InstanceState::Processing => Ok((
            Lamp::new(LampColor::Green),
            StreakState {
                non_terminal_seen: true,
                check_sent: false,
            },
        )),
        InstanceState::Completed => {
            let mut next = streak;
            let request_check = !streak.check_sent;
            if request_check {
                next = StreakState {
                    non_terminal_seen: false,
                    check_sent: true,
                };
            }
            let color = if next.non_terminal_seen {
                LampColor::Green
            } else {
                LampColor::Gray
            };
            let lamp = Lamp {
                request_queued_work_check: request_check,
                ..Lamp::new(color)
            };
            Ok((lamp, next))
        }
        InstanceState::ErrorsRunning => Ok((
            Lamp::with_message(LampColor::Amber, ERRORS_RUNNING_MESSAGE),
            streak,
        )),
        InstanceState::ErrorsStalled | InstanceState::Stopped => Ok((
            Lamp::with_message(LampColor::Red, EXECUTION_HALTED_MESSAGE),
            streak,
        )),
        InstanceState::Unrecognized(raw) => Err(EngineError::UnsupportedInstanceState(raw.clone())),
    }
}

/// Owns the streak so separate indicators do not share it.
#[derive(Debug, Default)]
pub struct StatusIndicator {
    streak: StreakState,
}

impl StatusIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, latest: &InstanceState) -> Result<Lamp, EngineError> {
        let (lamp, streak) = indicator_for(latest, self.streak)?;
        self.streak = streak;
        Ok(lamp)
    }

    /// Reply to a queued-work check.
    pub fn note_queued_work(&mut self, queued: bool) {
        self.streak.non_terminal_seen = queued;
    }

    pub fn streak(&self) -> StreakState {
        self.streak
    }
}
