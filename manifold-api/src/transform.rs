//! Reading transforms.
//!
//! A device may declare a chain of transforms which the scheduler
//! applies, in declared order, to every reading the device produces
//! before it reaches the state table. A transform is either a numeric
//! scale or one of a fixed table of named unit conversions.

use crate::types::{value::Value, Error};
use crate::Result;
use std::fmt;

/// The named conversions available to the `apply` transform. The
/// table is fixed; a conversion name outside of it is rejected when
/// the device is built, not when a reading flows through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// °F → °C
    FtoC,
    /// °C → °F
    CtoF,
    /// inches of mercury → millibar
    InHgToMbar,
    /// psi → kPa
    PsiToKPa,
}

impl Conversion {
    /// Looks a conversion up by its configured name.
    pub fn from_name(name: &str) -> Result<Conversion> {
        match name {
            "FtoC" => Ok(Conversion::FtoC),
            "CtoF" => Ok(Conversion::CtoF),
            "InHgToMbar" => Ok(Conversion::InHgToMbar),
            "PsiToKPa" => Ok(Conversion::PsiToKPa),
            _ => Err(Error::Config(format!(
                "unknown apply function \"{}\"",
                name
            ))),
        }
    }

    fn convert(&self, v: f64) -> f64 {
        match self {
            Conversion::FtoC => (v - 32.0) * 5.0 / 9.0,
            Conversion::CtoF => v * 9.0 / 5.0 + 32.0,
            Conversion::InHgToMbar => v * 33.8639,
            Conversion::PsiToKPa => v * 6.89476,
        }
    }
}

impl fmt::Display for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conversion::FtoC => write!(f, "FtoC"),
            Conversion::CtoF => write!(f, "CtoF"),
            Conversion::InHgToMbar => write!(f, "InHgToMbar"),
            Conversion::PsiToKPa => write!(f, "PsiToKPa"),
        }
    }
}

/// One step of a device's transform chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Multiply a numeric reading by a constant factor.
    Scale(f64),

    /// Run a reading through a named conversion.
    Apply(Conversion),
}

impl Transform {
    /// Applies the transform to a reading value. The result of any
    /// transform is a `Float64`; non-numeric inputs are an error and
    /// the scheduler drops the affected reading.
    pub fn apply(&self, value: &Value) -> Result<Value> {
        let v = value.as_f64().ok_or_else(|| {
            Error::InvArgument(format!(
                "can't transform non-numeric {} value",
                value.type_name()
            ))
        })?;

        Ok(Value::Float64(match self {
            Transform::Scale(factor) => v * factor,
            Transform::Apply(conv) => conv.convert(v),
        }))
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Scale(factor) => write!(f, "scale [{}]", factor),
            Transform::Apply(conv) => write!(f, "apply [{}]", conv),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_names() {
        assert_eq!(Conversion::from_name("FtoC"), Ok(Conversion::FtoC));
        assert_eq!(Conversion::from_name("CtoF"), Ok(Conversion::CtoF));
        assert_eq!(
            Conversion::from_name("InHgToMbar"),
            Ok(Conversion::InHgToMbar)
        );
        assert_eq!(Conversion::from_name("PsiToKPa"), Ok(Conversion::PsiToKPa));

        assert!(Conversion::from_name("ftoc").is_err());
        assert!(Conversion::from_name("").is_err());
        assert!(Conversion::from_name("KtoC").is_err());
    }

    #[test]
    fn test_scale() {
        let t = Transform::Scale(0.001);

        assert_eq!(t.apply(&Value::Int32(1500)), Ok(Value::Float64(1.5)));
        assert_eq!(t.apply(&Value::Float64(2.0)), Ok(Value::Float64(0.002)));
        assert_eq!(t.apply(&Value::Uint8(100)), Ok(Value::Float64(0.1)));

        assert!(t.apply(&Value::Bool(true)).is_err());
        assert!(t.apply(&Value::String("1500".into())).is_err());
        assert!(t.apply(&Value::Null).is_err());
    }

    #[test]
    fn test_apply() {
        let t = Transform::Apply(Conversion::FtoC);

        assert_eq!(t.apply(&Value::Float64(32.0)), Ok(Value::Float64(0.0)));
        assert_eq!(t.apply(&Value::Float64(212.0)), Ok(Value::Float64(100.0)));

        let t = Transform::Apply(Conversion::CtoF);

        assert_eq!(t.apply(&Value::Int32(100)), Ok(Value::Float64(212.0)));

        let t = Transform::Apply(Conversion::PsiToKPa);

        match t.apply(&Value::Float64(1.0)) {
            Ok(Value::Float64(v)) => assert!((v - 6.89476).abs() < 1e-9),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_chain_order_matters() {
        // scale-then-convert differs from convert-then-scale.

        let scale = Transform::Scale(10.0);
        let conv = Transform::Apply(Conversion::CtoF);
        let start = Value::Float64(10.0);

        let a = conv.apply(&scale.apply(&start).unwrap()).unwrap();
        let b = scale.apply(&conv.apply(&start).unwrap()).unwrap();

        assert_eq!(a, Value::Float64(212.0));
        assert_eq!(b, Value::Float64(500.0));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Transform::Scale(0.5)), "scale [0.5]");
        assert_eq!(
            format!("{}", Transform::Apply(Conversion::FtoC)),
            "apply [FtoC]"
        );
    }
}
