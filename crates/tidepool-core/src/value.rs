use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value as JsonValue};

/// Trackable attributes of one object, keyed by attribute name.
pub type Attributes = BTreeMap<String, Value>;

/// Attribute value as tracked by the change tracker.
///
/// `Null` is a real value (the client resets the attribute); an attribute
/// missing from an [`Attributes`] map was never set.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Color(Color),
    Font(Font),
    Image(Image),
    Array(Vec<Value>),
    /// Pre-serialized structure, compared by JSON equality.
    Raw(JsonValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(value) => JsonValue::Bool(*value),
            Value::Int(value) => json!(value),
            Value::Float(value) => json!(value),
            Value::String(value) => JsonValue::String(value.clone()),
            Value::Color(color) => color.to_json(),
            Value::Font(font) => font.to_json(),
            Value::Image(image) => image.to_json(),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Raw(raw) => raw.clone(),
        }
    }

    /// Interprets a client-sent JSON value without type hints. Objects stay raw.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(value) => Value::Bool(*value),
            JsonValue::Number(number) => match number.as_i64() {
                Some(int) => Value::Int(int),
                None => Value::Float(number.as_f64().unwrap_or_default()),
            },
            JsonValue::String(value) => Value::String(value.clone()),
            JsonValue::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(_) => Value::Raw(value.clone()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Color> for Value {
    fn from(value: Color) -> Self {
        Value::Color(value)
    }
}

impl From<Font> for Value {
    fn from(value: Font) -> Self {
        Value::Font(value)
    }
}

impl From<Image> for Value {
    fn from(value: Image) -> Self {
        Value::Image(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::Array(values.into_iter().map(Into::into).collect())
    }
}

/// Rejected attribute mutation. Raised by the mutating call itself, never
/// deferred to serialization.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AttributeError {
    #[error("invalid attribute state: {0}")]
    InvalidAttributeState(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ColorError {
    #[error("invalid color literal: {0}")]
    InvalidLiteral(String),
    #[error("alpha out of range: {0}")]
    AlphaOutOfRange(String),
}

/// RGBA color with 8-bit channels. Alpha 0 is fully transparent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl Color {
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);

    pub const fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Self::rgba(red, green, blue, 255)
    }

    pub const fn rgba(red: u8, green: u8, blue: u8, alpha: u8) -> Self {
        Self {
            red,
            green,
            blue,
            alpha,
        }
    }

    pub fn is_transparent(&self) -> bool {
        self.alpha == 0
    }

    /// `[r, g, b, a]`, or `null` for a fully transparent color.
    pub fn to_json(&self) -> JsonValue {
        if self.is_transparent() {
            JsonValue::Null
        } else {
            json!([self.red, self.green, self.blue, self.alpha])
        }
    }

    /// Inverse of [`Color::to_json`]: `null` decodes to `None`.
    pub fn from_json(value: &JsonValue) -> Option<Option<Color>> {
        match value {
            JsonValue::Null => Some(None),
            JsonValue::Array(items) if items.len() == 4 => {
                let mut channels = [0u8; 4];
                for (slot, item) in channels.iter_mut().zip(items) {
                    *slot = u8::try_from(item.as_u64()?).ok()?;
                }
                let [red, green, blue, alpha] = channels;
                Some(Some(Color::rgba(red, green, blue, alpha)))
            }
            _ => None,
        }
    }

    fn named(name: &str) -> Option<Color> {
        let color = match name {
            "white" => Color::WHITE,
            "black" => Color::BLACK,
            "red" => Color::rgb(255, 0, 0),
            "green" => Color::rgb(0, 128, 0),
            "blue" => Color::rgb(0, 0, 255),
            "transparent" => Color::TRANSPARENT,
            _ => return None,
        };
        Some(color)
    }
}

impl FromStr for Color {
    type Err = ColorError;

    /// Accepts `#rgb`, `#rrggbb`, `r, g, b[, alpha]` with alpha in `0..=1`,
    /// and a few color names.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let invalid = || ColorError::InvalidLiteral(input.to_string());
        if let Some(hex) = trimmed.strip_prefix('#') {
            return parse_hex(hex).ok_or_else(invalid);
        }
        if trimmed.contains(',') {
            let parts: Vec<&str> = trimmed.split(',').map(str::trim).collect();
            if parts.len() != 3 && parts.len() != 4 {
                return Err(invalid());
            }
            let mut rgb = [0u8; 3];
            for (slot, part) in rgb.iter_mut().zip(&parts) {
                *slot = part.parse().map_err(|_| invalid())?;
            }
            let alpha = match parts.get(3) {
                Some(raw) => {
                    let alpha: f64 = raw.parse().map_err(|_| invalid())?;
                    if !(0.0..=1.0).contains(&alpha) {
                        return Err(ColorError::AlphaOutOfRange(raw.to_string()));
                    }
                    (alpha * 255.0).round() as u8
                }
                None => 255,
            };
            return Ok(Color::rgba(rgb[0], rgb[1], rgb[2], alpha));
        }
        Color::named(&trimmed.to_ascii_lowercase()).ok_or_else(invalid)
    }
}

fn parse_hex(hex: &str) -> Option<Color> {
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let channel = |digits: &str| u8::from_str_radix(digits, 16).ok();
    match hex.len() {
        3 => {
            let expand = |idx: usize| channel(&hex[idx..idx + 1].repeat(2));
            Some(Color::rgb(expand(0)?, expand(1)?, expand(2)?))
        }
        6 => Some(Color::rgb(
            channel(&hex[0..2])?,
            channel(&hex[2..4])?,
            channel(&hex[4..6])?,
        )),
        _ => None,
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Color{{ {}, {}, {}, {} }}",
            self.red, self.green, self.blue, self.alpha
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Font {
    pub names: Vec<String>,
    pub size: u32,
    pub bold: bool,
    pub italic: bool,
}

impl Font {
    pub fn new(family: &str, size: u32) -> Self {
        Self {
            names: Font::parse_names(family),
            size,
            bold: false,
            italic: false,
        }
    }

    pub fn bold(mut self) -> Self {
        self.bold = true;
        self
    }

    pub fn italic(mut self) -> Self {
        self.italic = true;
        self
    }

    /// Splits a comma separated family list, trimming whitespace and quotes.
    /// Empty entries are kept as empty names.
    pub fn parse_names(family: &str) -> Vec<String> {
        family
            .split(',')
            .map(|name| name.trim().trim_matches('"').trim().to_string())
            .collect()
    }

    pub fn to_json(&self) -> JsonValue {
        json!([self.names, self.size, self.bold, self.italic])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Image {
    pub path: String,
    pub width: u32,
    pub height: u32,
}

impl Image {
    pub fn new(path: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            path: path.into(),
            width,
            height,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        json!([self.path, self.width, self.height])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_color_encodes_as_channel_array() {
        let color = Color::rgba(100, 23, 42, 255);
        assert_eq!(color.to_json(), json!([100, 23, 42, 255]));
    }

    #[test]
    fn transparent_color_encodes_as_null() {
        assert_eq!(Color::rgba(100, 23, 42, 0).to_json(), JsonValue::Null);
        assert_eq!(Color::from_json(&JsonValue::Null), Some(None));
    }

    #[test]
    fn translucent_color_survives_decode() {
        let color = Color::rgba(100, 23, 42, 128);
        assert_eq!(Color::from_json(&color.to_json()), Some(Some(color)));
    }

    #[test]
    fn color_decode_rejects_out_of_range_channels() {
        assert_eq!(Color::from_json(&json!([300, 0, 0, 255])), None);
        assert_eq!(Color::from_json(&json!([1, 2, 3])), None);
    }

    #[test]
    fn parses_hex_notations() {
        assert_eq!("#0023ff".parse::<Color>(), Ok(Color::rgb(0, 35, 255)));
        assert_eq!("#03f".parse::<Color>(), Ok(Color::rgb(0, 51, 255)));
        assert_eq!("#fff".parse::<Color>(), "#ffffff".parse::<Color>());
        assert_eq!("#efeFEF".parse::<Color>(), Ok(Color::rgb(239, 239, 239)));
    }

    #[test]
    fn parses_comma_values_and_names() {
        assert_eq!("100, 23, 42".parse::<Color>(), Ok(Color::rgb(100, 23, 42)));
        assert_eq!(
            "100, 23, 42, 0.5".parse::<Color>(),
            Ok(Color::rgba(100, 23, 42, 128))
        );
        assert_eq!("Black".parse::<Color>(), Ok(Color::BLACK));
        assert!("transparent".parse::<Color>().unwrap().is_transparent());
    }

    #[test]
    fn rejects_malformed_colors() {
        assert!("#0000".parse::<Color>().is_err());
        assert!("#xyz".parse::<Color>().is_err());
        assert!("grey".parse::<Color>().is_err());
        assert_eq!(
            "1, 2, 3, 1.01".parse::<Color>(),
            Err(ColorError::AlphaOutOfRange("1.01".into()))
        );
        assert!("1, 2, 3, -0.01".parse::<Color>().is_err());
    }

    #[test]
    fn font_names_strip_quotes_and_keep_empty_entries() {
        let names = Font::parse_names(
            "\"Segoe UI\", Corbel, Calibri, Tahoma, \"Lucida Sans Unicode\", sans-serif",
        );
        assert_eq!(
            names,
            vec![
                "Segoe UI",
                "Corbel",
                "Calibri",
                "Tahoma",
                "Lucida Sans Unicode",
                "sans-serif"
            ]
        );
        assert_eq!(Font::parse_names("a, , b"), vec!["a", "", "b"]);
    }

    #[test]
    fn font_encodes_names_size_and_flags() {
        let font = Font::new("Arial, sans-serif", 12).bold();
        assert_eq!(font.to_json(), json!([["Arial", "sans-serif"], 12, true, false]));
    }

    #[test]
    fn arrays_compare_element_wise_and_by_kind() {
        assert_eq!(Value::from(vec!["a"]), Value::from(vec!["a"]));
        assert_ne!(Value::from(vec!["a"]), Value::from(vec!["a", "b"]));
        assert_ne!(Value::from(vec![345_i64]), Value::from(vec![345.0_f64]));
        assert_ne!(Value::Null, Value::from(vec!["a"]));
    }
}
