//! Output types.
//!
//! An output type describes what a reading of a given kind means:
//! its unit and, for numeric readings, a display precision. Devices
//! name their output type in configuration; the scheduler stamps the
//! unit onto readings whose handler didn't set one and rounds
//! floating point values to the declared precision.
//!
//! A standard set of outputs ships built in; plugins add their own
//! through the type configuration files or by registering them in
//! code. Referring to an output type that isn't registered is a
//! startup error.

use crate::config::OutputTypeConfig;
use manifold_api::types::{value::Value, Unit};

#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub name: String,
    pub unit: Option<Unit>,

    /// Decimal places for float readings. `None` leaves values
    /// untouched.
    pub precision: Option<i32>,
}

impl Output {
    pub fn new(name: &str) -> Output {
        Output {
            name: name.into(),
            unit: None,
            precision: None,
        }
    }

    pub fn with_unit(mut self, name: &str, symbol: &str) -> Output {
        self.unit = Some(Unit::new(name, symbol));
        self
    }

    pub fn with_precision(mut self, precision: i32) -> Output {
        self.precision = Some(precision);
        self
    }

    /// Rounds a float value to the output's precision. Other value
    /// kinds pass through untouched.
    pub fn apply_precision(&self, value: Value) -> Value {
        match (self.precision, value) {
            (Some(p), Value::Float64(v)) => {
                let factor = 10f64.powi(p);

                Value::Float64((v * factor).round() / factor)
            }
            (Some(p), Value::Float32(v)) => {
                let factor = 10f32.powi(p);

                Value::Float32((v * factor).round() / factor)
            }
            (_, value) => value,
        }
    }
}

impl From<&OutputTypeConfig> for Output {
    fn from(cfg: &OutputTypeConfig) -> Output {
        Output {
            name: cfg.name.clone(),
            unit: cfg
                .unit
                .as_ref()
                .map(|u| Unit::new(&u.name, &u.symbol)),
            precision: cfg.precision,
        }
    }
}

/// The outputs every plugin starts with. Plugins whose readings fit
/// these never need type configuration at all.
pub fn builtins() -> Vec<Output> {
    vec![
        Output::new("color"),
        Output::new("count"),
        Output::new("direction"),
        Output::new("frequency").with_unit("hertz", "Hz").with_precision(2),
        Output::new("humidity").with_unit("percent humidity", "%").with_precision(2),
        Output::new("kilowatt-hour").with_unit("kilowatt-hour", "kWh").with_precision(3),
        Output::new("pascal").with_unit("pascal", "Pa").with_precision(3),
        Output::new("percentage").with_unit("percent", "%").with_precision(2),
        Output::new("rpm").with_unit("revolutions per minute", "RPM").with_precision(2),
        Output::new("seconds").with_unit("seconds", "s").with_precision(3),
        Output::new("state"),
        Output::new("status"),
        Output::new("temperature").with_unit("celsius", "C").with_precision(2),
        Output::new("voltage").with_unit("volt", "V").with_precision(5),
        Output::new("watt").with_unit("watt", "W").with_precision(3),
    ]
}
