//! Small demo application: a greeting form plus a templated list. It exists
//! to exercise the register/mutate/dispatch contract end to end.

use anyhow::Context;
use serde_json::Value as JsonValue;
use tidepool_core::protocol::ProtocolError;
use tidepool_core::{
    Attributes, Color, EntryPoint, Font, Image, ListenerError, PropertyBag, Renderable,
    RoundContext, RowTemplate, Value,
};
use tracing::info;

pub const LABEL: &str = "tp.Label";
pub const TEXT: &str = "tp.Text";
pub const BUTTON: &str = "tp.Button";
pub const LIST: &str = "tp.List";

#[derive(Debug, Clone, Default)]
pub struct Label {
    pub text: String,
    pub foreground: Option<Color>,
    pub font: Option<Font>,
}

impl Renderable for Label {
    fn type_tag(&self) -> &str {
        LABEL
    }

    fn attributes(&self) -> Attributes {
        Attributes::from([
            ("text".to_string(), Value::from(self.text.as_str())),
            ("foreground".to_string(), self.foreground.into()),
            ("font".to_string(), self.font.clone().into()),
        ])
    }

    fn default_value(&self, name: &str) -> Value {
        match name {
            "text" => Value::from(""),
            _ => Value::Null,
        }
    }
}

/// Single-line input; the client echoes typed text back with `set`.
#[derive(Debug, Clone, Default)]
pub struct TextField {
    pub text: String,
    pub message: Option<String>,
}

impl Renderable for TextField {
    fn type_tag(&self) -> &str {
        TEXT
    }

    fn attributes(&self) -> Attributes {
        Attributes::from([
            ("text".to_string(), Value::from(self.text.as_str())),
            ("message".to_string(), self.message.clone().into()),
        ])
    }

    fn default_value(&self, name: &str) -> Value {
        match name {
            "text" => Value::from(""),
            _ => Value::Null,
        }
    }

    fn apply_property(&mut self, name: &str, value: &JsonValue) -> Result<(), ProtocolError> {
        match (name, value) {
            ("text", JsonValue::String(text)) => {
                self.text = text.clone();
                Ok(())
            }
            ("text", _) => Err(ProtocolError::InvalidProperty {
                property: name.to_string(),
                reason: "expected a string".into(),
            }),
            _ => Err(ProtocolError::ReadOnlyProperty(name.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Button {
    pub text: String,
    pub enabled: bool,
    pub clicks: u32,
}

impl Button {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            enabled: true,
            clicks: 0,
        }
    }
}

impl Renderable for Button {
    fn type_tag(&self) -> &str {
        BUTTON
    }

    fn attributes(&self) -> Attributes {
        Attributes::from([
            ("text".to_string(), Value::from(self.text.as_str())),
            ("enabled".to_string(), Value::from(self.enabled)),
        ])
    }

    fn default_value(&self, name: &str) -> Value {
        match name {
            "enabled" => Value::Bool(true),
            _ => Value::Null,
        }
    }
}

fn row_template() -> anyhow::Result<RowTemplate> {
    let mut template = RowTemplate::new();
    template
        .add_cell("text")?
        .set_binding_index(0)?
        .set_left(4)?
        .set_right(24)?
        .set_top(2)?
        .set_height(18)?
        .add_style("LEFT");
    template
        .add_cell("image")?
        .set_binding_index(1)?
        .set_right(4)?
        .set_width(16)?
        .set_top(2)?
        .set_height(16)?
        .add_attribute("fallback", Image::new("icons/item.png", 16, 16))?;
    Ok(template)
}

/// Entry point of the demo UI.
pub struct DemoApp;

impl EntryPoint for DemoApp {
    fn create_ui(&self, ctx: &mut RoundContext<'_>) -> anyhow::Result<()> {
        let label = ctx.registry_mut().register(Label {
            text: "Who's there?".into(),
            foreground: Some("#336699".parse()?),
            font: Some(Font::new("\"Open Sans\", Arial", 14).bold()),
        });
        let input = ctx.registry_mut().register(TextField {
            message: Some("Your name".into()),
            ..TextField::default()
        });
        let button = ctx.registry_mut().register(Button::new("Greet"));
        let template = row_template()?;
        ctx.registry_mut().register(
            PropertyBag::new(LIST)
                .with("rowTemplate", &template)
                .with("items", vec!["alpha", "beta", "gamma"]),
        );

        let (greeting, source, clicked) = (label.clone(), input.clone(), button.clone());
        ctx.registry_mut()
            .add_listener(button.as_str(), "Selection", move |ctx, _event| {
                let name = ctx
                    .registry()
                    .get::<TextField>(source.as_str())
                    .map(|field| field.text.trim().to_string())
                    .context("name field is gone")?;
                let clicks = ctx
                    .registry_mut()
                    .with_mut(clicked.as_str(), |button: &mut Button| {
                        button.clicks += 1;
                        button.clicks
                    })
                    .context("greet button is gone")?;
                let text = if name.is_empty() {
                    "Nobody there.".to_string()
                } else {
                    format!("Hello, {name}!")
                };
                ctx.registry_mut()
                    .with_mut(greeting.as_str(), |widget: &mut Label| widget.text = text);
                ctx.browser_navigation()
                    .create_history_entry(&format!("greet-{clicks}"), &format!("Greeting {clicks}"))
                    .map_err(anyhow::Error::from)?;
                Ok(())
            })
            .context("greet button is not registered")?;

        ctx.browser_navigation()
            .add_navigation_listener(move |ctx, event| -> Result<(), ListenerError> {
                ctx.registry_mut().with_mut(label.as_str(), |widget: &mut Label| {
                    widget.text = format!("Back at {}", event.entry_id)
                });
                Ok(())
            });

        info!(session_id = %ctx.session_id(), "demo UI created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_core::{ClientEvent, ClientMessage, LifeCycle, Operation, UiState};
    use uuid::Uuid;

    #[test]
    fn startup_renders_every_widget_once() {
        let lifecycle = LifeCycle::new(DemoApp);
        let mut state = UiState::new(Uuid::new_v4());
        let response = lifecycle
            .execute(&mut state, &ClientMessage::new().with_head("initialize", true))
            .unwrap();

        let types: Vec<&str> = response
            .operations
            .iter()
            .filter_map(|op| match op {
                Operation::Create { type_tag, .. } => Some(type_tag.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(types, vec![LABEL, TEXT, BUTTON, LIST]);
    }

    #[test]
    fn greeting_uses_the_echoed_name() {
        let lifecycle = LifeCycle::new(DemoApp);
        let mut state = UiState::new(Uuid::new_v4());
        lifecycle
            .execute(&mut state, &ClientMessage::new().with_head("initialize", true))
            .unwrap();

        let request = ClientMessage::new()
            .with_set("o2", "text", "Ada")
            .with_event(ClientEvent::new("o3", "Selection"));
        let response = lifecycle.execute(&mut state, &request).unwrap();

        let label = state.registry().get::<Label>("o1").unwrap();
        assert_eq!(label.text, "Hello, Ada!");
        let targets: Vec<&str> = response.operations.iter().map(Operation::target).collect();
        assert!(targets.contains(&"o1"));
        assert!(!targets.contains(&"o2"));
    }
}
