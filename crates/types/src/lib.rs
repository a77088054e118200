//! Validated primitive types shared across the consent workspace.
//!
//! These wrappers guarantee their invariants once constructed, so downstream crates can accept
//! them without re-validating:
//! - [`NonEmptyText`]: trimmed text with at least one non-whitespace character
//! - [`ConfidenceThreshold`]: a labeling confidence in `0.00..=1.00`, quantised to hundredths

/// Errors that can occur when creating validated types.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,

    /// The threshold was NaN or infinite
    #[error("confidence threshold must be a finite number")]
    NotFinite,

    /// The threshold fell outside `0.0..=1.0`
    #[error("confidence threshold must be between 0.00 and 1.00, got {0}")]
    OutOfRange(f64),

    /// The threshold text could not be parsed as a number
    #[error("invalid confidence threshold: {0}")]
    Unparseable(String),
}

/// A string type that guarantees non-empty content.
///
/// This type wraps a `String` and ensures it contains at least one non-whitespace character.
/// The input is automatically trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// Returns `Err(TypesError::Empty)` if the trimmed input is empty.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TypesError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TypesError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Minimum confidence a labeling service must reach before it assigns a category.
///
/// The value is quantised to two decimal places at construction and stored as hundredths, so
/// two thresholds that render to the same wire string (`"0.75"`) compare equal and hash equally.
/// This makes the type directly usable as part of a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfidenceThreshold(u16);

impl ConfidenceThreshold {
    /// Threshold of `0.00`: every label the service proposes is accepted.
    pub const MIN: Self = Self(0);

    /// Threshold of `1.00`: only certain labels are accepted.
    pub const MAX: Self = Self(100);

    /// Creates a threshold from a fractional value, rounding to the nearest hundredth.
    pub fn new(value: f64) -> Result<Self, TypesError> {
        if !value.is_finite() {
            return Err(TypesError::NotFinite);
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(TypesError::OutOfRange(value));
        }
        Ok(Self((value * 100.0).round() as u16))
    }

    /// Creates a threshold from whole hundredths (`75` is `0.75`).
    pub fn from_hundredths(hundredths: u16) -> Result<Self, TypesError> {
        if hundredths > 100 {
            return Err(TypesError::OutOfRange(f64::from(hundredths) / 100.0));
        }
        Ok(Self(hundredths))
    }

    /// Returns the threshold in whole hundredths.
    pub fn hundredths(self) -> u16 {
        self.0
    }

    /// Returns the threshold as a fraction.
    pub fn as_f64(self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

impl std::fmt::Display for ConfidenceThreshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl std::str::FromStr for ConfidenceThreshold {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: f64 = s
            .trim()
            .parse()
            .map_err(|_| TypesError::Unparseable(s.to_string()))?;
        Self::new(value)
    }
}

impl serde::Serialize for ConfidenceThreshold {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> serde::Deserialize<'de> for ConfidenceThreshold {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        ConfidenceThreshold::new(value).map_err(serde::de::Error::custom)
    }
}
