use crate::registers::{ClassificationError, DataType, Encoding};

/// A register value in engineering units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Float(f64),
    Bool(bool),
    Int(i64),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(v),
            Value::Int(v) => Some(v as f64),
            Value::Bool(_) => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::Float(v) => f.write_fmt(format_args!("{}", v)),
            Value::Bool(v) => f.write_fmt(format_args!("{}", v)),
            Value::Int(v) => f.write_fmt(format_args!("{}", v)),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::Float(v) => serializer.serialize_f64(v),
            Value::Bool(v) => serializer.serialize_bool(v),
            Value::Int(v) => serializer.serialize_i64(v),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Classification(#[from] ClassificationError),
    #[error("register `{0}` holds `{1}` which is not an integer")]
    Decode(String, String, #[source] std::num::ParseIntError),
    #[error("{1} cannot be written to the {2} register `{0}`")]
    Encode(String, Value, DataType),
    #[error("`{1}` is not a valid {2} value for register `{0}`")]
    Parse(String, String, DataType),
}

/// Convert a raw wire value of register `id` into its engineering value.
pub fn decode(id: &str, raw: &str) -> Result<Value, Error> {
    let data_type = DataType::classify(id)?;
    let integer = raw
        .trim()
        .parse::<i64>()
        .map_err(|e| Error::Decode(id.to_string(), raw.to_string(), e))?;
    Ok(match data_type.encoding() {
        encoding @ (Encoding::Tenths | Encoding::Hundredths) => {
            Value::Float(integer as f64 / f64::from(encoding.scale()))
        }
        Encoding::Boolean => Value::Bool(integer != 0),
        Encoding::Count => Value::Int(integer),
    })
}

/// [`decode`], where a missing raw value is an absent reading rather than an error.
pub fn decode_optional(id: &str, raw: Option<&str>) -> Result<Option<Value>, Error> {
    raw.map(|raw| decode(id, raw)).transpose()
}

/// Convert an engineering value into the raw wire value for register `id`.
pub fn encode(id: &str, value: &Value) -> Result<String, Error> {
    let data_type = DataType::classify(id)?;
    let mismatch = || Error::Encode(id.to_string(), *value, data_type);
    let integer = match (data_type.encoding(), *value) {
        (encoding @ (Encoding::Tenths | Encoding::Hundredths), Value::Float(v)) => {
            let scaled = (v * f64::from(encoding.scale())).round();
            if !scaled.is_finite() || scaled.abs() > i64::MAX as f64 {
                return Err(mismatch());
            }
            scaled as i64
        }
        (encoding @ (Encoding::Tenths | Encoding::Hundredths), Value::Int(v)) => v
            .checked_mul(i64::from(encoding.scale()))
            .ok_or_else(mismatch)?,
        (Encoding::Boolean, Value::Bool(v)) => i64::from(v),
        (Encoding::Boolean, Value::Int(v @ (0 | 1))) => v,
        (Encoding::Count, Value::Int(v)) => v,
        (Encoding::Count, Value::Float(v)) if v.is_finite() && v.fract() == 0.0 => v as i64,
        _ => return Err(mismatch()),
    };
    Ok(integer.to_string())
}

/// Parse a human-entered engineering value (e.g. `20.5`, `on`, `3`) for register `id`.
pub fn parse(id: &str, text: &str) -> Result<Value, Error> {
    let data_type = DataType::classify(id)?;
    let text = text.trim();
    let invalid = || Error::Parse(id.to_string(), text.to_string(), data_type);
    match data_type.encoding() {
        Encoding::Tenths | Encoding::Hundredths => {
            text.parse::<f64>().map(Value::Float).map_err(|_| invalid())
        }
        Encoding::Boolean => match text.to_ascii_lowercase().as_str() {
            "1" | "true" | "on" => Ok(Value::Bool(true)),
            "0" | "false" | "off" => Ok(Value::Bool(false)),
            _ => Err(invalid()),
        },
        Encoding::Count => text.parse::<i64>().map(Value::Int).map_err(|_| invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_by_data_type() {
        assert_eq!(decode("0203", "200").unwrap(), Value::Float(20.0));
        assert_eq!(decode("0007", "-35").unwrap(), Value::Float(-3.5));
        assert_eq!(decode("3104", "455").unwrap(), Value::Float(45.5));
        assert_eq!(decode("5C52", "12345").unwrap(), Value::Float(123.45));
        assert_eq!(decode("1A01", "1").unwrap(), Value::Bool(true));
        assert_eq!(decode("1A01", "0").unwrap(), Value::Bool(false));
        assert_eq!(decode("1A01", "2").unwrap(), Value::Bool(true));
        assert_eq!(decode("6209", "3").unwrap(), Value::Int(3));
        assert_eq!(decode("B20A", "-2").unwrap(), Value::Int(-2));
    }

    #[test]
    fn absent_raw_value_is_not_an_error() {
        assert_eq!(decode_optional("0203", None).unwrap(), None);
        assert_eq!(decode_optional("0203", Some("215")).unwrap(), Some(Value::Float(21.5)));
    }

    #[test]
    fn malformed_values_fail() {
        assert!(matches!(decode("0203", "abc"), Err(Error::Decode(..))));
        assert!(matches!(decode("0203", "20.5"), Err(Error::Decode(..))));
        assert!(matches!(decode("XYZ", "1"), Err(Error::Classification(_))));
    }

    #[test]
    fn tenths_round_trip() {
        let value = decode("0203", "200").unwrap();
        assert_eq!(value, Value::Float(20.0));
        assert_eq!(encode("0203", &value).unwrap(), "200");
        assert_eq!(encode("0217", &Value::Float(-2.46)).unwrap(), "-25");
        assert_eq!(encode("0217", &Value::Int(4)).unwrap(), "40");
        assert_eq!(encode("5C52", &Value::Float(1.5)).unwrap(), "150");
    }

    #[test]
    fn encode_rejects_mismatched_values() {
        assert!(matches!(encode("1A01", &Value::Float(1.0)), Err(Error::Encode(..))));
        assert!(matches!(encode("0203", &Value::Bool(true)), Err(Error::Encode(..))));
        assert!(matches!(encode("6209", &Value::Float(1.5)), Err(Error::Encode(..))));
        assert!(matches!(encode("0217", &Value::Float(f64::NAN)), Err(Error::Encode(..))));
        assert_eq!(encode("1A01", &Value::Bool(true)).unwrap(), "1");
        assert_eq!(encode("6209", &Value::Float(2.0)).unwrap(), "2");
    }

    #[test]
    fn parses_engineering_text() {
        assert_eq!(parse("0203", "21.5").unwrap(), Value::Float(21.5));
        assert_eq!(parse("1210", "ON").unwrap(), Value::Bool(true));
        assert_eq!(parse("2213", " 2 ").unwrap(), Value::Int(2));
        assert!(matches!(parse("2213", "two"), Err(Error::Parse(..))));
    }
}
