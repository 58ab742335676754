//! Capability model: option descriptors, constraints and value constraining.
//!
//! Every device exposes its settings as an indexed list of descriptors.
//! Index 0 is always the read-only option count, which includes itself.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::error::{Result, ScanError};

/// Size in bytes of one protocol word (bool, int and fixed values).
pub const WORD_SIZE: usize = 4;

/// Well-known option names.
pub mod names {
    /// Option 0, the option count. Always has an empty name.
    pub const NUM_OPTIONS: &str = "";
    /// Scan mode (`Color`, `Gray`, `Lineart`, ...).
    pub const MODE: &str = "mode";
    /// Scan source (`Flatbed`, `ADF`, ...).
    pub const SOURCE: &str = "source";
    /// Scan resolution in dots per inch.
    pub const RESOLUTION: &str = "resolution";
    /// Bits per sample.
    pub const DEPTH: &str = "depth";
    /// Request a preview-quality scan.
    pub const PREVIEW: &str = "preview";
    /// Top-left x of the scan area.
    pub const TL_X: &str = "tl-x";
    /// Top-left y of the scan area.
    pub const TL_Y: &str = "tl-y";
    /// Bottom-right x of the scan area.
    pub const BR_X: &str = "br-x";
    /// Bottom-right y of the scan area.
    pub const BR_Y: &str = "br-y";
}

/// Type of the value an option holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Boolean word.
    Bool,
    /// Signed integer word.
    Int,
    /// 16.16 fixed-point word.
    Fixed,
    /// NUL-terminated string.
    String,
    /// Action trigger without a value.
    Button,
    /// Grouping header for the options that follow.
    Group,
}

/// Physical unit of an option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Unit {
    /// Unitless.
    #[default]
    None,
    /// Pixels.
    Pixel,
    /// Bits.
    Bit,
    /// Millimeters.
    Mm,
    /// Dots per inch.
    Dpi,
    /// Percent.
    Percent,
    /// Microseconds.
    Microsecond,
}

/// Capability bit-set of an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(pub u32);

impl Capabilities {
    /// Settable by software.
    pub const SOFT_SELECT: Self = Self(1 << 0);
    /// Settable only through a hardware control.
    pub const HARD_SELECT: Self = Self(1 << 1);
    /// Readable by software.
    pub const SOFT_DETECT: Self = Self(1 << 2);
    /// Emulated by the backend.
    pub const EMULATED: Self = Self(1 << 3);
    /// Backend can pick the value automatically.
    pub const AUTOMATIC: Self = Self(1 << 4);
    /// Currently inactive.
    pub const INACTIVE: Self = Self(1 << 5);
    /// Advanced option.
    pub const ADVANCED: Self = Self(1 << 6);

    const ALL: u32 = 0x7f;

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Clear the bits of `other`.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Option is active when the inactive bit is clear.
    pub const fn is_active(self) -> bool {
        !self.contains(Self::INACTIVE)
    }

    /// Option is settable when the soft-select bit is set.
    pub const fn is_settable(self) -> bool {
        self.contains(Self::SOFT_SELECT)
    }

    /// Whether only defined capability bits are set.
    pub const fn is_valid(self) -> bool {
        self.0 & !Self::ALL == 0
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Advisory flags returned by a set-value or automatic-selection call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Info(pub u32);

impl Info {
    /// Requested value was rounded to a legal one.
    pub const INEXACT: Self = Self(1 << 0);
    /// Other descriptors may have changed; re-fetch all of them.
    pub const RELOAD_OPTIONS: Self = Self(1 << 1);
    /// Capture parameter estimate changed.
    pub const RELOAD_PARAMS: Self = Self(1 << 2);

    /// No flags.
    pub const NONE: Self = Self(0);

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Info {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Info {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// 16.16 fixed-point number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fixed(pub i32);

impl Fixed {
    /// Number of fractional bits.
    pub const SCALE_SHIFT: u32 = 16;

    /// Convert from a floating point value, truncating toward zero.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_f64(value: f64) -> Self {
        Self((value * f64::from(1_u32 << Self::SCALE_SHIFT)) as i32)
    }

    /// Convert from a whole number.
    pub const fn from_int(value: i32) -> Self {
        Self(value << Self::SCALE_SHIFT)
    }

    /// Value as a floating point number.
    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / f64::from(1_u32 << Self::SCALE_SHIFT)
    }

    /// Integral part, truncated toward zero.
    #[allow(clippy::cast_possible_truncation)]
    pub fn trunc(self) -> i32 {
        self.to_f64().trunc() as i32
    }
}

/// Numeric range with optional quantization. Bounds are raw words, so a
/// fixed-point range stores its bounds in 16.16 form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    /// Minimum legal value.
    pub min: i32,
    /// Maximum legal value.
    pub max: i32,
    /// Quantization step; 0 allows any value in `[min, max]`.
    pub quant: i32,
}

impl Range {
    /// Create a range.
    pub const fn new(min: i32, max: i32, quant: i32) -> Self {
        Self { min, max, quant }
    }

    /// Whether `value` is exactly legal.
    pub fn is_legal(&self, value: i32) -> bool {
        if value < self.min || value > self.max {
            return false;
        }
        self.quant <= 0 || (i64::from(value) - i64::from(self.min)) % i64::from(self.quant) == 0
    }

    /// Clamp and round `value` to the nearest legal grid point.
    ///
    /// Returns the legal value and whether it differs from the input.
    #[allow(clippy::cast_possible_truncation)]
    pub fn constrain(&self, value: i32) -> (i32, bool) {
        let mut v = value.clamp(self.min, self.max);
        if self.quant > 0 {
            let min = i64::from(self.min);
            let quant = i64::from(self.quant);
            let steps = (i64::from(v) - min + quant / 2) / quant;
            let mut snapped = min + steps * quant;
            if snapped > i64::from(self.max) {
                snapped -= quant;
            }
            // snapped stays within [min, max], both of which fit in i32
            v = snapped as i32;
        }
        (v, v != value)
    }
}

/// Which values an option accepts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Constraint {
    /// Any value of the option's type.
    #[default]
    None,
    /// Numeric range, for int and fixed options.
    Range(Range),
    /// Enumerated words, for int and fixed options.
    WordList(Vec<i32>),
    /// Enumerated strings, for string options.
    StringList(Vec<String>),
}

/// Value held by an option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i32),
    /// Fixed-point value.
    Fixed(Fixed),
    /// String value.
    String(String),
    /// Button press (no value).
    Button,
}

impl OptionValue {
    /// Value type this value belongs to.
    pub const fn value_type(&self) -> ValueType {
        match self {
            Self::Bool(_) => ValueType::Bool,
            Self::Int(_) => ValueType::Int,
            Self::Fixed(_) => ValueType::Fixed,
            Self::String(_) => ValueType::String,
            Self::Button => ValueType::Button,
        }
    }

    /// Raw word for numeric values.
    pub const fn as_word(&self) -> Option<i32> {
        match self {
            Self::Int(v) | Self::Fixed(Fixed(v)) => Some(*v),
            Self::Bool(b) => Some(*b as i32),
            Self::String(_) | Self::Button => None,
        }
    }

    /// String value, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str("TRUE"),
            Self::Bool(false) => f.write_str("FALSE"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Fixed(v) => write!(f, "{}", v.trunc()),
            Self::String(s) => f.write_str(s),
            Self::Button => Ok(()),
        }
    }
}

/// Description of one device option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionDescriptor {
    /// Machine name (`[a-z][a-z0-9-]*`, empty for option 0 and groups).
    pub name: String,
    /// Human-readable title.
    pub title: String,
    /// Longer description.
    pub desc: String,
    /// Value type.
    pub value_type: ValueType,
    /// Physical unit.
    pub unit: Unit,
    /// Storage size in bytes. Strings include the terminator.
    pub size: usize,
    /// Capability bits.
    pub cap: Capabilities,
    /// Value constraint.
    pub constraint: Constraint,
}

impl OptionDescriptor {
    fn new(name: &str, title: &str, desc: &str, value_type: ValueType, size: usize) -> Self {
        Self {
            name: name.to_owned(),
            title: title.to_owned(),
            desc: desc.to_owned(),
            value_type,
            unit: Unit::None,
            size,
            cap: Capabilities::SOFT_SELECT | Capabilities::SOFT_DETECT,
            constraint: Constraint::None,
        }
    }

    /// Descriptor for option 0, the read-only option count.
    pub fn option_count() -> Self {
        Self::new(
            names::NUM_OPTIONS,
            "Number of options",
            "Read-only option that specifies how many options a specific device supports.",
            ValueType::Int,
            WORD_SIZE,
        )
        .with_caps(Capabilities::SOFT_DETECT)
    }

    /// Group header.
    pub fn group(title: &str) -> Self {
        Self::new("", title, "", ValueType::Group, 0).with_caps(Capabilities::default())
    }

    /// Boolean option.
    pub fn boolean(name: &str, title: &str, desc: &str) -> Self {
        Self::new(name, title, desc, ValueType::Bool, WORD_SIZE)
    }

    /// Integer option.
    pub fn int(name: &str, title: &str, desc: &str) -> Self {
        Self::new(name, title, desc, ValueType::Int, WORD_SIZE)
    }

    /// Fixed-point option.
    pub fn fixed(name: &str, title: &str, desc: &str) -> Self {
        Self::new(name, title, desc, ValueType::Fixed, WORD_SIZE)
    }

    /// String option sized to hold the longest entry of `choices`.
    pub fn string_list(name: &str, title: &str, desc: &str, choices: &[&str]) -> Self {
        let list: Vec<String> = choices.iter().map(|s| (*s).to_owned()).collect();
        let size = string_size(&list);
        Self::new(name, title, desc, ValueType::String, size)
            .with_constraint(Constraint::StringList(list))
    }

    /// Button option.
    pub fn button(name: &str, title: &str, desc: &str) -> Self {
        Self::new(name, title, desc, ValueType::Button, 0)
    }

    /// Set the unit.
    #[must_use]
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    /// Replace the capability bits.
    #[must_use]
    pub const fn with_caps(mut self, cap: Capabilities) -> Self {
        self.cap = cap;
        self
    }

    /// Set the constraint.
    #[must_use]
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        if let Constraint::StringList(list) = &constraint {
            self.size = self.size.max(string_size(list));
        }
        self.constraint = constraint;
        self
    }

    /// Whether the option is currently active.
    pub const fn is_active(&self) -> bool {
        self.cap.is_active()
    }

    /// Whether software may set the option.
    pub const fn is_settable(&self) -> bool {
        self.cap.is_settable()
    }

    /// Whether the constraint kind and size agree with the value type.
    pub fn is_consistent(&self) -> bool {
        let constraint_ok = match (&self.constraint, self.value_type) {
            (Constraint::None, _) => true,
            (Constraint::Range(r), ValueType::Int | ValueType::Fixed) => r.min <= r.max && r.quant >= 0,
            (Constraint::WordList(_), ValueType::Int | ValueType::Fixed) => true,
            (Constraint::StringList(list), ValueType::String) => self.size >= string_size(list),
            _ => false,
        };
        let size_ok = match self.value_type {
            ValueType::Bool => self.size == WORD_SIZE,
            ValueType::Int | ValueType::Fixed => self.size > 0 && self.size % WORD_SIZE == 0,
            ValueType::String => self.size >= 1,
            ValueType::Button | ValueType::Group => self.size == 0,
        };
        constraint_ok && size_ok && self.cap.is_valid()
    }

    /// Check `value` against the type and constraint, rounding where the
    /// constraint allows it.
    ///
    /// Returns the value to store and [`Info::INEXACT`] when it was changed.
    pub fn constrain(&self, value: OptionValue) -> Result<(OptionValue, Info)> {
        if value.value_type() != self.value_type {
            return Err(ScanError::invalid(format!(
                "option '{}' expects {:?}, got {:?}",
                self.name,
                self.value_type,
                value.value_type()
            )));
        }

        match (&self.constraint, value) {
            (Constraint::Range(range), OptionValue::Int(v)) => {
                let (v, inexact) = range.constrain(v);
                Ok((OptionValue::Int(v), inexact_info(inexact)))
            }
            (Constraint::Range(range), OptionValue::Fixed(Fixed(v))) => {
                let (v, inexact) = range.constrain(v);
                Ok((OptionValue::Fixed(Fixed(v)), inexact_info(inexact)))
            }
            (Constraint::WordList(words), OptionValue::Int(v)) => {
                let (v, inexact) = nearest_word(words, v)?;
                Ok((OptionValue::Int(v), inexact_info(inexact)))
            }
            (Constraint::WordList(words), OptionValue::Fixed(Fixed(v))) => {
                let (v, inexact) = nearest_word(words, v)?;
                Ok((OptionValue::Fixed(Fixed(v)), inexact_info(inexact)))
            }
            (Constraint::StringList(list), OptionValue::String(s)) => match_string(list, &s)
                .map(|(matched, inexact)| (OptionValue::String(matched), inexact_info(inexact))),
            (_, OptionValue::String(s)) if s.len() + 1 > self.size => Err(ScanError::invalid(
                format!("value for '{}' exceeds {} bytes", self.name, self.size),
            )),
            (_, value) => Ok((value, Info::NONE)),
        }
    }
}

const fn inexact_info(inexact: bool) -> Info {
    if inexact {
        Info::INEXACT
    } else {
        Info::NONE
    }
}

fn string_size(list: &[String]) -> usize {
    list.iter().map(String::len).max().unwrap_or(0) + 1
}

fn nearest_word(words: &[i32], value: i32) -> Result<(i32, bool)> {
    let nearest = words
        .iter()
        .copied()
        .min_by_key(|w| (i64::from(*w) - i64::from(value)).abs())
        .ok_or_else(|| ScanError::invalid("empty word list"))?;
    Ok((nearest, nearest != value))
}

/// Exact match, else a unique case-insensitive prefix match.
fn match_string(list: &[String], value: &str) -> Result<(String, bool)> {
    if list.iter().any(|s| s == value) {
        return Ok((value.to_owned(), false));
    }

    let lower = value.to_lowercase();
    let mut candidates = list
        .iter()
        .filter(|s| !lower.is_empty() && s.to_lowercase().starts_with(&lower));
    match (candidates.next(), candidates.next()) {
        (Some(only), None) => Ok((only.clone(), true)),
        _ => Err(ScanError::invalid(format!("'{value}' is not in {list:?}"))),
    }
}

/// Operation requested through `control_option`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionAction {
    /// Read the current value.
    Get,
    /// Store a new value.
    Set(OptionValue),
    /// Let the backend choose the value.
    Auto,
}

/// Result of a `control_option` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlOutcome {
    /// Value now held by the option.
    pub value: OptionValue,
    /// Advisory flags; always empty for [`OptionAction::Get`].
    pub info: Info,
}

impl ControlOutcome {
    /// Outcome carrying `value` and no info bits.
    pub const fn of(value: OptionValue) -> Self {
        Self {
            value,
            info: Info::NONE,
        }
    }
}
