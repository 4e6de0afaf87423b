use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThresholdConfig {
    pub t_min: f64,
    pub t_max: f64,
}

impl ThresholdConfig {
    pub fn new(t_min: f64, t_max: f64) -> Self {
        Self { t_min, t_max }
    }

    /// True when the bounds overlap. `decide` still works, the cooling branch wins.
    pub fn is_inverted(&self) -> bool {
        self.t_max <= self.t_min
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    TurnOnAc,
    TurnOnHeater,
    NoAction,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::TurnOnAc => "TurnOnAc",
            Action::TurnOnHeater => "TurnOnHeater",
            Action::NoAction => "NoAction",
        }
    }

    pub fn requires_actuation(&self) -> bool {
        !matches!(self, Action::NoAction)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("temperature is not a number")]
    NotANumber,
}

pub fn decide(temperature: f64, config: &ThresholdConfig) -> Result<Action, PolicyError> {
    if temperature.is_nan() {
        return Err(PolicyError::NotANumber);
    }
    // Order matters: with inverted bounds the cooling branch must win.
    if temperature >= config.t_max {
        return Ok(Action::TurnOnAc);
    }
    if temperature <= config.t_min {
        return Ok(Action::TurnOnHeater);
    }
    Ok(Action::NoAction)
}
