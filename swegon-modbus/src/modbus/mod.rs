use rust_decimal::{
    prelude::{FromPrimitive, ToPrimitive},
    Decimal, RoundingStrategy,
};

pub mod connection;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub type UnitId = tokio_modbus::prelude::SlaveId;
pub type Unit = tokio_modbus::prelude::Slave;

/// Scaling factor which means "keep the raw signed integer". Used for modes, bitmasks and counters.
pub const UNSCALED: f64 = 1.0;

/// A decoded register value as served to consumers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    /// Enum codes, bitmasks, counters and raw device-info numbers.
    Integer(i64),
    /// Scaled measurements. NaN when a derived value is undefined.
    Float(f64),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Integer(v) => v as f64,
            Value::Float(v) => v,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Integer(v) => Some(v),
            Value::Float(_) => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Interprets a register word as a 16-bit two's complement integer.
pub fn twos_complement(word: u16) -> i64 {
    if word >> 15 == 1 {
        -(((word ^ 0xFFFF) as i64) + 1)
    } else {
        word as i64
    }
}

/// Decodes a single register word using the field's scaling factor.
pub fn decode_word(word: u16, scaling: f64) -> Value {
    let raw = twos_complement(word);
    if scaling == UNSCALED {
        Value::Integer(raw)
    } else {
        Value::Float(raw as f64 * scaling)
    }
}

/// Converts an engineering-unit value back to the register word the device expects.
///
/// The value is divided by `scaling`, rounded half-to-even and wrapped into 16 bits. Returns `None` for values
/// which have no finite decimal representation, or which fit neither a signed nor an unsigned register.
pub fn encode(value: f64, scaling: f64) -> Option<u16> {
    let value = Decimal::from_f64(value)?;
    let scaling = Decimal::from_f64(scaling)?;
    let raw = value
        .checked_div(scaling)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven)
        .to_i64()?;
    if !(i16::MIN as i64..=u16::MAX as i64).contains(&raw) {
        return None;
    }
    Some(raw as u16)
}

/// Rounds to `dp` decimal places, half-to-even. Non-finite input is returned unchanged.
pub fn round_dp(value: f64, dp: u32) -> f64 {
    Decimal::from_f64(value)
        .map(|d| d.round_dp_with_strategy(dp, RoundingStrategy::MidpointNearestEven))
        .and_then(|d| d.to_f64())
        .unwrap_or(value)
}

/// Decodes text stored one character per register, dropping trailing NULs.
pub fn decode_ascii(words: &[u16]) -> String {
    words
        .iter()
        .map(|&w| char::from_u32(w.into()).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect::<String>()
        .trim_end_matches('\0')
        .to_owned()
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn twos_complement_boundaries() {
    assert_eq!(twos_complement(0x0000), 0);
    assert_eq!(twos_complement(0x7FFF), 32767);
    assert_eq!(twos_complement(0x8000), -32768);
    assert_eq!(twos_complement(0xFFFF), -1);
}

#[test]
fn decode_keeps_unscaled_fields_integral() {
    assert_eq!(decode_word(3, UNSCALED), Value::Integer(3));
    assert_eq!(decode_word(0xFFFE, UNSCALED), Value::Integer(-2));
    assert_eq!(decode_word(215, 0.1), Value::Float(215.0 * 0.1));
    assert_eq!(decode_word(0xFF9C, 0.1), Value::Float(-100.0 * 0.1));
    assert_eq!(decode_word(100, 3.6), Value::Float(360.0));
}

#[test]
fn encode_wraps_negative_values() {
    assert_eq!(encode(-1.0, UNSCALED), Some(0xFFFF));
    assert_eq!(encode(-10.0, 0.1), Some(0xFF9C));
    assert_eq!(encode(21.5, 0.1), Some(215));
    assert_eq!(encode(f64::NAN, 0.1), None);
    assert_eq!(encode(1.0, 0.0), None);
}

#[test]
fn encode_rejects_values_outside_a_register() {
    assert_eq!(encode(7000.0, 0.1), None);
    assert_eq!(encode(65538.0, UNSCALED), None);
    assert_eq!(encode(-32769.0, UNSCALED), None);
    assert_eq!(encode(65535.0, UNSCALED), Some(0xFFFF));
    assert_eq!(encode(-3276.8, 0.1), Some(0x8000));
}

#[test]
fn encode_rounds_half_to_even() {
    assert_eq!(encode(2.5, UNSCALED), Some(2));
    assert_eq!(encode(3.5, UNSCALED), Some(4));
    assert_eq!(encode(21.46, 0.1), Some(215));
}

#[test]
fn encode_inverts_decode() {
    for (word, scaling) in [(215u16, 0.1), (0xFF38, 0.1), (42, 3.6), (7, UNSCALED), (0x8000, 0.1)] {
        let decoded = decode_word(word, scaling).as_f64();
        assert_eq!(encode(decoded, scaling), Some(word), "{word:#06x} x {scaling}");
    }
}

#[test]
fn ascii_text_is_trimmed() {
    assert_eq!(decode_ascii(&[72, 97, 115, 97, 0, 0]), "Hasa");
    assert_eq!(decode_ascii(&[0, 0]), "");
    assert_eq!(decode_ascii(&[]), "");
}

#[test]
fn round_dp_is_bankers() {
    assert_eq!(round_dp(50.0, 1), 50.0);
    assert_eq!(round_dp(66.666666, 1), 66.7);
    assert_eq!(round_dp(0.25, 1), 0.2);
    assert!(round_dp(f64::NAN, 1).is_nan());
}
