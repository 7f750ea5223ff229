//! Row templates: an ordered list of typed cells describing how the client
//! lays out one row of a list or table.

use std::collections::BTreeMap;

use serde_json::{Map, Value as JsonValue};

use crate::value::{AttributeError, Value};

/// Style flags forwarded to the client; anything else is dropped on serialization.
pub const ALLOWED_STYLES: &[&str] = &["WRAP", "LEFT", "CENTER", "RIGHT", "TOP", "BOTTOM", "MIDDLE"];

const LEFT: &str = "left";
const RIGHT: &str = "right";
const TOP: &str = "top";
const BOTTOM: &str = "bottom";
const WIDTH: &str = "width";
const HEIGHT: &str = "height";
const NAME: &str = "name";
const BINDING_INDEX: &str = "bindingIndex";
const SELECTABLE: &str = "selectable";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowTemplate {
    cells: Vec<Cell>,
}

impl RowTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cell(&mut self, cell_type: &str) -> Result<&mut Cell, AttributeError> {
        if cell_type.is_empty() {
            return Err(AttributeError::InvalidArgument(
                "cell type must not be empty".into(),
            ));
        }
        self.cells.push(Cell::new(cell_type));
        let index = self.cells.len() - 1;
        Ok(&mut self.cells[index])
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Cells in insertion order, each as `{type, style, ...attributes}`.
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Array(self.cells.iter().map(Cell::to_json).collect())
    }
}

impl From<&RowTemplate> for Value {
    fn from(template: &RowTemplate) -> Self {
        Value::Raw(template.to_json())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    cell_type: String,
    styles: Vec<String>,
    attributes: BTreeMap<String, Value>,
}

impl Cell {
    fn new(cell_type: &str) -> Self {
        Self {
            cell_type: cell_type.to_string(),
            styles: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn cell_type(&self) -> &str {
        &self.cell_type
    }

    pub fn styles(&self) -> &[String] {
        &self.styles
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn add_style(&mut self, style: &str) -> &mut Self {
        self.styles.push(style.to_string());
        self
    }

    pub fn set_name(&mut self, name: &str) -> Result<&mut Self, AttributeError> {
        if name.is_empty() {
            return Err(AttributeError::InvalidArgument(
                "cell name must not be empty".into(),
            ));
        }
        self.attributes.insert(NAME.into(), name.into());
        Ok(self)
    }

    pub fn set_binding_index(&mut self, index: i32) -> Result<&mut Self, AttributeError> {
        if index < 0 {
            return Err(AttributeError::InvalidArgument(format!(
                "binding index must be >= 0, got {index}"
            )));
        }
        self.attributes.insert(BINDING_INDEX.into(), index.into());
        Ok(self)
    }

    pub fn set_selectable(&mut self, selectable: bool) -> &mut Self {
        self.attributes.insert(SELECTABLE.into(), selectable.into());
        self
    }

    pub fn set_left(&mut self, offset: i32) -> Result<&mut Self, AttributeError> {
        self.check_axis(LEFT, [RIGHT, WIDTH], "horizontal")?;
        self.set_offset(LEFT, offset)
    }

    pub fn set_right(&mut self, offset: i32) -> Result<&mut Self, AttributeError> {
        self.check_axis(RIGHT, [LEFT, WIDTH], "horizontal")?;
        self.set_offset(RIGHT, offset)
    }

    pub fn set_width(&mut self, width: i32) -> Result<&mut Self, AttributeError> {
        check_size(WIDTH, width)?;
        self.check_axis(WIDTH, [LEFT, RIGHT], "horizontal")?;
        self.set_offset(WIDTH, width)
    }

    pub fn set_top(&mut self, offset: i32) -> Result<&mut Self, AttributeError> {
        self.check_axis(TOP, [BOTTOM, HEIGHT], "vertical")?;
        self.set_offset(TOP, offset)
    }

    pub fn set_bottom(&mut self, offset: i32) -> Result<&mut Self, AttributeError> {
        self.check_axis(BOTTOM, [TOP, HEIGHT], "vertical")?;
        self.set_offset(BOTTOM, offset)
    }

    pub fn set_height(&mut self, height: i32) -> Result<&mut Self, AttributeError> {
        check_size(HEIGHT, height)?;
        self.check_axis(HEIGHT, [TOP, BOTTOM], "vertical")?;
        self.set_offset(HEIGHT, height)
    }

    pub fn add_attribute(
        &mut self,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<&mut Self, AttributeError> {
        if name.is_empty() {
            return Err(AttributeError::InvalidArgument(
                "attribute name must not be empty".into(),
            ));
        }
        let value = value.into();
        if value.is_null() {
            return Err(AttributeError::InvalidArgument(format!(
                "attribute {name} must not be null"
            )));
        }
        self.attributes.insert(name.to_string(), value);
        Ok(self)
    }

    fn set_offset(&mut self, name: &str, value: i32) -> Result<&mut Self, AttributeError> {
        self.attributes.insert(name.to_string(), value.into());
        Ok(self)
    }

    /// At most two of the three constraints on one axis may be set. Re-setting
    /// an already present constraint is always allowed.
    fn check_axis(&self, name: &str, others: [&str; 2], axis: &str) -> Result<(), AttributeError> {
        if self.attributes.contains_key(name) {
            return Ok(());
        }
        if others.iter().all(|other| self.attributes.contains_key(*other)) {
            return Err(AttributeError::InvalidAttributeState(format!(
                "can only set two {axis} attributes; {} and {} are already set",
                others[0], others[1]
            )));
        }
        Ok(())
    }

    fn to_json(&self) -> JsonValue {
        let mut object = Map::new();
        object.insert("type".into(), JsonValue::String(self.cell_type.clone()));
        let styles: Vec<JsonValue> = self
            .styles
            .iter()
            .filter(|style| ALLOWED_STYLES.contains(&style.as_str()))
            .map(|style| JsonValue::String(style.clone()))
            .collect();
        object.insert("style".into(), JsonValue::Array(styles));
        for (name, value) in &self.attributes {
            object.insert(name.clone(), attribute_json(value));
        }
        JsonValue::Object(object)
    }
}

fn check_size(name: &str, value: i32) -> Result<(), AttributeError> {
    if value < 0 {
        return Err(AttributeError::InvalidArgument(format!(
            "{name} must be >= 0, got {value}"
        )));
    }
    Ok(())
}

fn attribute_json(value: &Value) -> JsonValue {
    match value {
        Value::String(_)
        | Value::Int(_)
        | Value::Bool(_)
        | Value::Color(_)
        | Value::Font(_)
        | Value::Image(_) => value.to_json(),
        Value::Float(_) | Value::Array(_) | Value::Raw(_) | Value::Null => JsonValue::Null,
    }
}
