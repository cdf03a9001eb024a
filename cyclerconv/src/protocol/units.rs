//! Unit/value conversion
//!
//! Maccor stores electrical values as plain numbers in base units and
//! durations as `H:MM:SS.fraction`. BioLogic fields take a fixed-point
//! value with three decimals plus a unit suffix, so every value is
//! rescaled onto a unit ladder:
//!
//! - electrical: the coarsest unit that keeps every significant digit
//!   within three decimals and shows at least `1`
//! - time: the coarsest unit that holds the duration as a whole number
//!
//! Values are handled as exact decimals so the digit counting never sees
//! binary floating point noise.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decimal places in every BioLogic value field
pub const DECIMALS: u32 = 3;

/// Widest integer part a value field accepts
pub const MAX_INTEGER_DIGITS: i32 = 9;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    #[error("Invalid number: {0:?}")]
    InvalidNumber(String),
    #[error("Invalid duration: {0:?}")]
    InvalidDuration(String),
    #[error("{value:?} cannot be represented as a {quantity} value")]
    OutOfRange { value: String, quantity: Quantity },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Voltage,
    Current,
    Power,
    Resistance,
    Time,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quantity::Voltage => "voltage",
            Quantity::Current => "current",
            Quantity::Power => "power",
            Quantity::Resistance => "resistance",
            Quantity::Time => "time",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "V")]
    Volt,
    #[serde(rename = "mV")]
    MilliVolt,
    #[serde(rename = "A")]
    Amp,
    #[serde(rename = "mA")]
    MilliAmp,
    #[serde(rename = "\u{b5}A")]
    MicroAmp,
    #[serde(rename = "W")]
    Watt,
    #[serde(rename = "mW")]
    MilliWatt,
    #[serde(rename = "\u{b5}W")]
    MicroWatt,
    #[serde(rename = "kOhms")]
    KiloOhm,
    #[serde(rename = "Ohms")]
    Ohm,
    #[serde(rename = "mOhms")]
    MilliOhm,
    #[serde(rename = "\u{b5}Ohms")]
    MicroOhm,
    #[serde(rename = "h")]
    Hour,
    #[serde(rename = "mn")]
    Minute,
    #[serde(rename = "s")]
    Second,
    #[serde(rename = "ms")]
    Millisecond,
}

impl Unit {
    /// Suffix as written in BioLogic settings (micro is U+00B5).
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Volt => "V",
            Unit::MilliVolt => "mV",
            Unit::Amp => "A",
            Unit::MilliAmp => "mA",
            Unit::MicroAmp => "\u{b5}A",
            Unit::Watt => "W",
            Unit::MilliWatt => "mW",
            Unit::MicroWatt => "\u{b5}W",
            Unit::KiloOhm => "kOhms",
            Unit::Ohm => "Ohms",
            Unit::MilliOhm => "mOhms",
            Unit::MicroOhm => "\u{b5}Ohms",
            Unit::Hour => "h",
            Unit::Minute => "mn",
            Unit::Second => "s",
            Unit::Millisecond => "ms",
        }
    }

    pub fn quantity(&self) -> Quantity {
        match self {
            Unit::Volt | Unit::MilliVolt => Quantity::Voltage,
            Unit::Amp | Unit::MilliAmp | Unit::MicroAmp => Quantity::Current,
            Unit::Watt | Unit::MilliWatt | Unit::MicroWatt => Quantity::Power,
            Unit::KiloOhm | Unit::Ohm | Unit::MilliOhm | Unit::MicroOhm => Quantity::Resistance,
            Unit::Hour | Unit::Minute | Unit::Second | Unit::Millisecond => Quantity::Time,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Fixed-point value string plus unit, e.g. `("142.900", mV)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaledValue {
    pub value: String,
    pub unit: Unit,
}

impl ScaledValue {
    pub fn new(value: impl Into<String>, unit: Unit) -> Self {
        Self {
            value: value.into(),
            unit,
        }
    }

    /// `0.000` in the given unit
    pub fn zero(unit: Unit) -> Self {
        Self::new("0.000", unit)
    }
}

impl fmt::Display for ScaledValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

/// One rung of a unit ladder: `value_in_unit = value_in_base / 10^exp`
struct Rung {
    unit: Unit,
    exp: i32,
}

// Ladders run from the coarsest unit to the finest.
const VOLT_LADDER: &[Rung] = &[
    Rung { unit: Unit::Volt, exp: 0 },
    Rung { unit: Unit::MilliVolt, exp: -3 },
];

const AMP_LADDER: &[Rung] = &[
    Rung { unit: Unit::Amp, exp: 0 },
    Rung { unit: Unit::MilliAmp, exp: -3 },
    Rung { unit: Unit::MicroAmp, exp: -6 },
];

const WATT_LADDER: &[Rung] = &[
    Rung { unit: Unit::Watt, exp: 0 },
    Rung { unit: Unit::MilliWatt, exp: -3 },
    Rung { unit: Unit::MicroWatt, exp: -6 },
];

const OHM_LADDER: &[Rung] = &[
    Rung { unit: Unit::KiloOhm, exp: 3 },
    Rung { unit: Unit::Ohm, exp: 0 },
    Rung { unit: Unit::MilliOhm, exp: -3 },
    Rung { unit: Unit::MicroOhm, exp: -6 },
];

pub fn convert_volts(raw: &str) -> Result<ScaledValue, UnitError> {
    scale_onto_ladder(raw, Quantity::Voltage, VOLT_LADDER)
}

pub fn convert_amps(raw: &str) -> Result<ScaledValue, UnitError> {
    scale_onto_ladder(raw, Quantity::Current, AMP_LADDER)
}

pub fn convert_watts(raw: &str) -> Result<ScaledValue, UnitError> {
    scale_onto_ladder(raw, Quantity::Power, WATT_LADDER)
}

pub fn convert_ohms(raw: &str) -> Result<ScaledValue, UnitError> {
    scale_onto_ladder(raw, Quantity::Resistance, OHM_LADDER)
}

/// Convert any supported quantity.
pub fn convert(quantity: Quantity, raw: &str) -> Result<ScaledValue, UnitError> {
    match quantity {
        Quantity::Voltage => convert_volts(raw),
        Quantity::Current => convert_amps(raw),
        Quantity::Power => convert_watts(raw),
        Quantity::Resistance => convert_ohms(raw),
        Quantity::Time => convert_time(raw),
    }
}

fn scale_onto_ladder(raw: &str, quantity: Quantity, ladder: &[Rung]) -> Result<ScaledValue, UnitError> {
    let value = Decimal::parse(raw).ok_or_else(|| UnitError::InvalidNumber(raw.trim().to_string()))?;
    let out_of_range = || UnitError::OutOfRange {
        value: raw.trim().to_string(),
        quantity,
    };

    let finest = &ladder[ladder.len() - 1];
    let rung = if value.is_zero() {
        &ladder[0]
    } else {
        match ladder.iter().find(|r| {
            let scaled = value.shift(-r.exp);
            scaled.fraction_digits() <= DECIMALS && scaled.integer_digits() >= 1
        }) {
            Some(rung) => rung,
            None => {
                let scaled = value.shift(-finest.exp);
                if scaled.fraction_digits() > DECIMALS {
                    tracing::warn!(
                        "{} value {} rounded to {} decimals in {}",
                        quantity,
                        raw.trim(),
                        DECIMALS,
                        finest.unit
                    );
                }
                finest
            }
        }
    };

    let scaled = value.shift(-rung.exp);
    if scaled.integer_digits() > MAX_INTEGER_DIGITS {
        return Err(out_of_range());
    }
    let fixed = scaled.round_fixed(DECIMALS).ok_or_else(out_of_range)?;
    if fixed == 0 && !value.is_zero() {
        return Err(out_of_range());
    }
    Ok(ScaledValue::new(format_fixed(fixed, DECIMALS), rung.unit))
}

/// Convert a Maccor duration (`H:MM:SS.fraction`, empty fields are zero).
pub fn convert_time(raw: &str) -> Result<ScaledValue, UnitError> {
    let total = parse_duration(raw)?;
    let out_of_range = || UnitError::OutOfRange {
        value: raw.trim().to_string(),
        quantity: Quantity::Time,
    };

    let (value, unit) = match total.to_integer() {
        Some(secs) if secs % 3600 == 0 => (Decimal::from_int(secs / 3600), Unit::Hour),
        Some(secs) if secs % 60 == 0 => (Decimal::from_int(secs / 60), Unit::Minute),
        Some(secs) => (Decimal::from_int(secs), Unit::Second),
        None => {
            let millis = total.shift(3);
            if millis.fraction_digits() > DECIMALS {
                tracing::warn!("duration {} rounded to {} decimals in ms", raw.trim(), DECIMALS);
            }
            (Some(millis), Unit::Millisecond)
        }
    };
    let value = value.ok_or_else(out_of_range)?;

    if value.integer_digits() > MAX_INTEGER_DIGITS {
        return Err(out_of_range());
    }
    let fixed = value.round_fixed(DECIMALS).ok_or_else(out_of_range)?;
    if fixed == 0 && !total.is_zero() {
        return Err(out_of_range());
    }
    Ok(ScaledValue::new(format_fixed(fixed, DECIMALS), unit))
}

/// Total seconds of a `H:MM:SS.fraction` string.
fn parse_duration(raw: &str) -> Result<Decimal, UnitError> {
    let invalid = || UnitError::InvalidDuration(raw.trim().to_string());
    let parts: Vec<&str> = raw.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }

    let mut total = Decimal::ZERO;
    for (part, seconds_per_unit) in parts.iter().zip([3600i128, 60, 1]) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let value = Decimal::parse(part).ok_or_else(invalid)?;
        if value.is_negative() {
            return Err(invalid());
        }
        total = value
            .checked_mul_int(seconds_per_unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
    }
    Ok(total)
}

fn format_fixed(fixed: i128, places: u32) -> String {
    let divisor = 10i128.pow(places);
    let sign = if fixed < 0 { "-" } else { "" };
    let magnitude = fixed.unsigned_abs();
    format!(
        "{}{}.{:0width$}",
        sign,
        magnitude / divisor as u128,
        magnitude % divisor as u128,
        width = places as usize
    )
}

/// Exact decimal `mantissa * 10^exp`, kept without trailing zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Decimal {
    mantissa: i128,
    exp: i32,
}

impl Decimal {
    pub(crate) const ZERO: Decimal = Decimal { mantissa: 0, exp: 0 };

    /// `None` when stripping trailing zeros pushes `exp` past `i32`.
    fn normalized(mut mantissa: i128, mut exp: i32) -> Option<Self> {
        if mantissa == 0 {
            return Some(Self::ZERO);
        }
        while mantissa % 10 == 0 {
            mantissa /= 10;
            exp = exp.checked_add(1)?;
        }
        Some(Self { mantissa, exp })
    }

    pub(crate) fn from_int(value: i128) -> Option<Self> {
        Self::normalized(value, 0)
    }

    /// Parse `[+-]digits[.digits][(e|E)[+-]digits]`.
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim();
        let (negative, s) = match s.as_bytes().first()? {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };
        let (number, exponent) = match s.find(['e', 'E']) {
            Some(i) => (&s[..i], s[i + 1..].parse::<i32>().ok()?),
            None => (s, 0),
        };
        let (whole, fraction) = match number.split_once('.') {
            Some((w, f)) => (w, f),
            None => (number, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }

        let mut mantissa: i128 = 0;
        for c in whole.chars().chain(fraction.chars()) {
            let digit = c.to_digit(10)? as i128;
            mantissa = mantissa.checked_mul(10)?.checked_add(digit)?;
        }
        let exp = exponent.checked_sub(i32::try_from(fraction.len()).ok()?)?;
        if negative {
            mantissa = -mantissa;
        }
        Self::normalized(mantissa, exp)
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.mantissa == 0
    }

    pub(crate) fn is_negative(&self) -> bool {
        self.mantissa < 0
    }

    /// Multiply by `10^k`.
    pub(crate) fn shift(&self, k: i32) -> Self {
        if self.is_zero() {
            return *self;
        }
        Self {
            mantissa: self.mantissa,
            exp: self.exp.saturating_add(k),
        }
    }

    /// Digits after the decimal point needed to write the value exactly.
    pub(crate) fn fraction_digits(&self) -> u32 {
        if self.exp < 0 {
            self.exp.unsigned_abs()
        } else {
            0
        }
    }

    /// Digits before the decimal point; zero or negative for `|x| < 1`.
    pub(crate) fn integer_digits(&self) -> i32 {
        if self.is_zero() {
            return 0;
        }
        let digits = self.mantissa.unsigned_abs().to_string().len() as i32;
        digits.saturating_add(self.exp)
    }

    pub(crate) fn to_integer(&self) -> Option<i128> {
        if self.exp < 0 {
            return None;
        }
        10i128
            .checked_pow(self.exp as u32)
            .and_then(|m| self.mantissa.checked_mul(m))
    }

    pub(crate) fn checked_mul_int(&self, n: i128) -> Option<Self> {
        Self::normalized(self.mantissa.checked_mul(n)?, self.exp)
    }

    pub(crate) fn checked_add(&self, other: Self) -> Option<Self> {
        if self.is_zero() {
            return Some(other);
        }
        if other.is_zero() {
            return Some(*self);
        }
        let exp = self.exp.min(other.exp);
        let align = |d: &Decimal| -> Option<i128> {
            let shift = u32::try_from(d.exp.checked_sub(exp)?).ok()?;
            d.mantissa.checked_mul(10i128.checked_pow(shift)?)
        };
        let sum = align(self)?.checked_add(align(&other)?)?;
        Self::normalized(sum, exp)
    }

    /// The value times `10^places`, rounded half away from zero.
    pub(crate) fn round_fixed(&self, places: u32) -> Option<i128> {
        let target = -(places as i32);
        if self.exp >= target {
            let shift = u32::try_from(self.exp.checked_sub(target)?).ok()?;
            return self.mantissa.checked_mul(10i128.checked_pow(shift)?);
        }
        let dropped = u32::try_from(target.checked_sub(self.exp)?).ok()?;
        let Some(divisor) = 10i128.checked_pow(dropped) else {
            return Some(0);
        };
        let quotient = self.mantissa / divisor;
        let remainder = (self.mantissa % divisor).abs();
        if remainder * 2 >= divisor {
            Some(quotient + self.mantissa.signum())
        } else {
            Some(quotient)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(func: fn(&str) -> Result<ScaledValue, UnitError>, cases: &[(&str, &str, &str)]) {
        for (raw, value, unit) in cases {
            let scaled = func(raw).unwrap_or_else(|e| panic!("{}: {}", raw, e));
            assert_eq!(scaled.value, *value, "value for {}", raw);
            assert_eq!(scaled.unit.symbol(), *unit, "unit for {}", raw);
        }
    }

    #[test]
    fn test_convert_volts() {
        check(
            convert_volts,
            &[
                ("0.1429", "142.900", "mV"),
                ("0.1429e3", "142.900", "V"),
                ("159.3624", "159362.400", "mV"),
                ("152.9", "152.900", "V"),
            ],
        );
    }

    #[test]
    fn test_convert_amps() {
        check(
            convert_amps,
            &[
                ("0.1429", "142.900", "mA"),
                ("1.23", "1.230", "A"),
                ("152.9", "152.900", "A"),
                ("1.2e-4", "120.000", "\u{b5}A"),
            ],
        );
    }

    #[test]
    fn test_convert_watts() {
        check(
            convert_watts,
            &[
                ("0.1429", "142.900", "mW"),
                ("1.23", "1.230", "W"),
                ("152.9", "152.900", "W"),
                ("1.2e-5", "12.000", "\u{b5}W"),
            ],
        );
    }

    #[test]
    fn test_convert_ohms() {
        check(
            convert_ohms,
            &[
                ("0.1429", "142.900", "mOhms"),
                ("1.459e4", "14.590", "kOhms"),
                ("152.9", "152.900", "Ohms"),
                ("1.2e-4", "120.000", "\u{b5}Ohms"),
            ],
        );
    }

    #[test]
    fn test_convert_time() {
        check(
            convert_time,
            &[
                ("::.01", "10.000", "ms"),
                ("03::", "3.000", "h"),
                ("03:30:", "210.000", "mn"),
                ("00:00:50", "50.000", "s"),
                ("00:00:30", "30.000", "s"),
                ("::.0005", "0.500", "ms"),
            ],
        );
    }

    #[test]
    fn test_zero_values() {
        check(convert_amps, &[("0", "0.000", "A"), ("0.000", "0.000", "A")]);
        check(convert_time, &[("00:00:00", "0.000", "h"), ("::", "0.000", "h")]);
    }

    #[test]
    fn test_negative_value_keeps_sign() {
        check(convert_amps, &[("-0.5", "-500.000", "mA")]);
    }

    #[test]
    fn test_precision_loss_rounds_in_finest_unit() {
        check(convert_volts, &[("1.23456789", "1234.568", "mV")]);
    }

    #[test]
    fn test_malformed_numbers() {
        for raw in ["", "abc", "1.2.3", "1e", "--1", "."] {
            assert!(
                matches!(convert_volts(raw), Err(UnitError::InvalidNumber(_))),
                "expected parse failure for {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_malformed_durations() {
        for raw in ["50", "1:2", "a::", "::-1", "1:2:3:4"] {
            assert!(
                matches!(convert_time(raw), Err(UnitError::InvalidDuration(_))),
                "expected parse failure for {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_out_of_range() {
        assert!(matches!(convert_volts("1e12"), Err(UnitError::OutOfRange { .. })));
        assert!(matches!(convert_amps("1e-12"), Err(UnitError::OutOfRange { .. })));
        assert!(matches!(convert_time("::.0000001"), Err(UnitError::OutOfRange { .. })));
    }

    #[test]
    fn test_extreme_exponents_fail_cleanly() {
        assert!(matches!(convert_volts("10e2147483647"), Err(UnitError::InvalidNumber(_))));
        assert!(matches!(convert_volts("1e2147483647"), Err(UnitError::OutOfRange { .. })));
        assert!(matches!(convert_amps("1e-2147483648"), Err(UnitError::OutOfRange { .. })));
        assert!(convert_time("1e2147483647::").is_err());
        assert!(convert_time("::1e2147483647").is_err());
        assert!(convert_time("1e2147483600:1e-2147483600:").is_err());
    }

    #[test]
    fn test_scale_consistency() {
        // x and x*1000 land one rung apart with the same printed value
        let pairs = [
            (convert_volts as fn(&str) -> Result<ScaledValue, UnitError>, "0.1429", "142.9"),
            (convert_amps, "0.0042", "4.2"),
            (convert_watts, "0.000012", "0.012"),
            (convert_ohms, "1.5", "1500"),
        ];
        for (func, small, large) in pairs {
            let a = func(small).unwrap();
            let b = func(large).unwrap();
            assert_eq!(a.value, b.value, "{} vs {}", small, large);
            assert_ne!(a.unit, b.unit);
        }

        let a = convert_time("::.05").unwrap();
        let b = convert_time("::50").unwrap();
        assert_eq!((a.value.as_str(), a.unit), ("50.000", Unit::Millisecond));
        assert_eq!((b.value.as_str(), b.unit), ("50.000", Unit::Second));
    }

    #[test]
    fn test_decimal_parse() {
        assert_eq!(Decimal::parse("0.1429e3"), Decimal::parse("142.9"));
        assert_eq!(Decimal::parse("1.2e-4"), Decimal::parse("0.00012"));
        assert_eq!(Decimal::parse(".5"), Decimal::parse("0.5"));
        assert_eq!(Decimal::parse("5."), Decimal::parse("5"));
        assert_eq!(Decimal::parse("+2").unwrap().to_integer(), Some(2));
        assert_eq!(Decimal::parse("1500").unwrap().integer_digits(), 4);
        assert_eq!(Decimal::parse("0.012").unwrap().integer_digits(), -1);
    }
}
