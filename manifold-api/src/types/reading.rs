//! Types that carry device readings from handlers to the framework.

use crate::types::{tag::Tag, value::Value};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// The engineering unit attached to a reading. Boolean and string
/// readings typically don't carry one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Unit {
    /// Full name of the unit ("celsius").
    pub name: String,
    /// Printable symbol ("C").
    pub symbol: String,
}

impl Unit {
    pub fn new(name: &str, symbol: &str) -> Unit {
        Unit {
            name: name.into(),
            symbol: symbol.into(),
        }
    }
}

/// One value read from a device at a point in time.
///
/// Handlers fill in the value, unit, and any context they want to
/// attach; the scheduler stamps the device id, reading type, and
/// timestamp before the reading enters the state pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Id of the device the reading belongs to. Filled in by the
    /// scheduler.
    pub device: String,

    /// Name of the reading type ("temperature"). Filled in from the
    /// device's output kind when the handler leaves it empty.
    pub kind: String,

    pub unit: Option<Unit>,

    pub timestamp: DateTime<Utc>,

    pub value: Value,

    /// Free-form key/value pairs a handler can attach to a single
    /// reading (serial number, sample quality, etc.)
    pub context: HashMap<String, String>,
}

impl Reading {
    /// Creates a reading holding `value` with the current time. The
    /// device id and kind are stamped later by the scheduler.
    pub fn new<V: Into<Value>>(value: V) -> Reading {
        Reading {
            device: String::new(),
            kind: String::new(),
            unit: None,
            timestamp: Utc::now(),
            value: value.into(),
            context: HashMap::new(),
        }
    }

    /// Creates a reading with an explicit type name.
    pub fn with_kind<V: Into<Value>>(kind: &str, value: V) -> Reading {
        Reading {
            kind: kind.into(),
            ..Reading::new(value)
        }
    }

    pub fn with_unit(mut self, unit: Unit) -> Reading {
        self.unit = Some(unit);
        self
    }

    pub fn with_context(mut self, key: &str, value: &str) -> Reading {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// A batch of readings produced together for one device, as emitted
/// by bulk-read and listen handlers. The tag snapshot travels with
/// the batch so consumers can route on it without another device
/// lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadContext {
    pub device: String,
    pub readings: Vec<Reading>,
    pub tags: Vec<Tag>,
}

impl ReadContext {
    pub fn new(device: &str, readings: Vec<Reading>) -> ReadContext {
        ReadContext {
            device: device.into(),
            readings,
            tags: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_builders() {
        let r = Reading::new(21.5);

        assert_eq!(r.value, Value::Float64(21.5));
        assert!(r.device.is_empty());
        assert!(r.kind.is_empty());
        assert!(r.unit.is_none());
        assert!(r.context.is_empty());

        let r = Reading::with_kind("temperature", 20i32)
            .with_unit(Unit::new("celsius", "C"))
            .with_context("zone", "1");

        assert_eq!(r.kind, "temperature");
        assert_eq!(r.value, Value::Int32(20));
        assert_eq!(r.unit.as_ref().unwrap().symbol, "C");
        assert_eq!(r.context.get("zone").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_read_context() {
        let ctx = ReadContext::new("dev-1", vec![Reading::new(true)]);

        assert_eq!(ctx.device, "dev-1");
        assert_eq!(ctx.readings.len(), 1);
        assert!(ctx.tags.is_empty());
    }
}
