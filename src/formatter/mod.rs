pub mod template;

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::config;
use crate::jobs::Request;

pub use template::{Payload, Renderer, TemplateError};

/// Template names used for rendering replies.
pub const HANDSHAKE: &str = "handshake";
pub const SUCCESS: &str = "success";
pub const FAILURE: &str = "failure";
pub const UNKNOWN_COMMAND: &str = "unknowncommand";
pub const UNAUTHORIZED: &str = "unauthorized";

pub const DEFAULT_HANDSHAKE_TEMPLATE: &str = "{{ AnyValue \"handshake\" . }}";
pub const DEFAULT_SUCCESS_TEMPLATE: &str = "{{ .userlink }} {{ AnyValue \"success\" . }}\
{{ with $out := .output }}\n```\n{{ $out }}```{{ end }}";
pub const DEFAULT_FAILURE_TEMPLATE: &str = "{{ .userlink }} {{ AnyValue \"failure\" . }} \
:disappointed: {{ .error }}{{ with $out := .output }}\n```\n{{ $out }}```{{ end }}";
pub const DEFAULT_UNKNOWN_COMMAND_TEMPLATE: &str =
    "{{ .userlink }} {{ AnyValue \"unknowncommand\" . }} {{ .command }}";
pub const DEFAULT_UNAUTHORIZED_TEMPLATE: &str =
    "{{ .userlink }} {{ AnyValue \"unauthorized\" . }} {{ .command }}: {{ .error }}";

/// The default phrase banks, one per template name.
pub fn default_messages() -> HashMap<String, Vec<String>> {
    fn bank(phrases: &[&str]) -> Vec<String> {
        phrases.iter().map(|p| p.to_string()).collect()
    }
    HashMap::from([
        (
            HANDSHAKE.to_string(),
            bank(&[
                "I'm Mr Meeseeks! look at me!",
                "Mr Meeseeks!",
                "Ooh, yeah! Can do!",
                "Ooh, ok!",
                "Yes, siree!",
                "Ooh, I'm Mr. Meeseeks! Look at me!",
            ]),
        ),
        (
            SUCCESS.to_string(),
            bank(&["All done!", "Mr Meeseeks", "Uuuuh, nice!"]),
        ),
        (FAILURE.to_string(), bank(&["Uuuh!, no, it failed"])),
        (
            UNAUTHORIZED.to_string(),
            bank(&["Uuuuh, yeah! you are not allowed to do"]),
        ),
        (
            UNKNOWN_COMMAND.to_string(),
            bank(&["Uuuh! no, I don't know how to do"]),
        ),
    ])
}

pub fn default_templates() -> HashMap<String, String> {
    HashMap::from([
        (HANDSHAKE.to_string(), DEFAULT_HANDSHAKE_TEMPLATE.to_string()),
        (SUCCESS.to_string(), DEFAULT_SUCCESS_TEMPLATE.to_string()),
        (FAILURE.to_string(), DEFAULT_FAILURE_TEMPLATE.to_string()),
        (
            UNKNOWN_COMMAND.to_string(),
            DEFAULT_UNKNOWN_COMMAND_TEMPLATE.to_string(),
        ),
        (
            UNAUTHORIZED.to_string(),
            DEFAULT_UNAUTHORIZED_TEMPLATE.to_string(),
        ),
    ])
}

/// What a reply is about, which also picks its attachment color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Handshake,
    Success,
    Failure,
    UnknownCommand,
    Unauthorized,
}

impl ReplyKind {
    pub fn template_name(&self) -> &'static str {
        match self {
            ReplyKind::Handshake => HANDSHAKE,
            ReplyKind::Success => SUCCESS,
            ReplyKind::Failure => FAILURE,
            ReplyKind::UnknownCommand => UNKNOWN_COMMAND,
            ReplyKind::Unauthorized => UNAUTHORIZED,
        }
    }
}

/// How a reply is posted on the chat side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyStyle {
    Text,
    #[default]
    Attachment,
}

/// A fully rendered reply ready for a chat adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub channel_id: String,
    pub color: String,
    pub style: ReplyStyle,
}

/// Builds template renderers from the default set overlaid with custom
/// messages and templates.
///
/// Cloning the builder deep copies the phrase banks, so per command
/// overlays never leak into the process defaults.
#[derive(Debug, Clone)]
pub struct TemplatesBuilder {
    messages: HashMap<String, Vec<String>>,
    templates: HashMap<String, String>,
}

impl Default for TemplatesBuilder {
    fn default() -> TemplatesBuilder {
        TemplatesBuilder::new()
    }
}

impl TemplatesBuilder {
    pub fn new() -> TemplatesBuilder {
        TemplatesBuilder {
            messages: default_messages(),
            templates: default_templates(),
        }
    }

    pub fn with_messages(mut self, messages: &HashMap<String, Vec<String>>) -> TemplatesBuilder {
        for (name, phrases) in messages {
            self.messages.insert(name.clone(), phrases.clone());
        }
        self
    }

    pub fn with_templates(mut self, templates: &HashMap<String, String>) -> TemplatesBuilder {
        for (name, text) in templates {
            self.templates.insert(name.clone(), text.clone());
        }
        self
    }

    pub fn build(&self) -> Result<Templates, TemplateError> {
        let mut renderers = HashMap::new();
        for (name, text) in &self.templates {
            renderers.insert(name.clone(), Renderer::new(name, text)?);
        }

        let mut default_payload = Payload::new();
        for (name, phrases) in &self.messages {
            default_payload.insert(name.clone(), json!(phrases));
        }

        Ok(Templates {
            renderers,
            default_payload,
        })
    }
}

/// A built set of renderers with the phrase banks preloaded in the payload.
pub struct Templates {
    renderers: HashMap<String, Renderer>,
    default_payload: Payload,
}

impl Templates {
    pub fn render(&self, action: &str, payload: &Payload) -> Result<String, TemplateError> {
        let renderer = self
            .renderers
            .get(action)
            .ok_or_else(|| TemplateError::MissingKey(action.to_string()))?;

        let mut merged = self.default_payload.clone();
        for (key, value) in payload {
            merged.insert(key.clone(), value.clone());
        }
        renderer.render(&merged)
    }
}

/// Shared handle to the current formatter; configuration reloads swap in a
/// complete replacement while readers keep the snapshot they grabbed.
pub struct FormatterHandle {
    inner: std::sync::RwLock<std::sync::Arc<Formatter>>,
}

impl FormatterHandle {
    pub fn new(formatter: Formatter) -> FormatterHandle {
        FormatterHandle {
            inner: std::sync::RwLock::new(std::sync::Arc::new(formatter)),
        }
    }

    pub fn current(&self) -> std::sync::Arc<Formatter> {
        self.inner.read().expect("formatter lock poisoned").clone()
    }

    pub fn swap(&self, formatter: Formatter) {
        *self.inner.write().expect("formatter lock poisoned") = std::sync::Arc::new(formatter);
    }
}

/// Renders stylized replies from templates, phrase banks and the configured
/// colors and per command reply styles.
pub struct Formatter {
    builder: TemplatesBuilder,
    colors: config::Colors,
    reply_styles: HashMap<String, String>,
}

impl Formatter {
    /// Builds the formatter, validating every configured template up front
    /// so a broken template fails startup instead of a reply.
    pub fn new(format: &config::Format) -> Result<Formatter, TemplateError> {
        let builder = TemplatesBuilder::new().with_messages(&format.messages);
        builder.build()?;
        Ok(Formatter {
            builder,
            colors: format.colors.clone(),
            reply_styles: format.reply_style.clone(),
        })
    }

    pub fn color_for(&self, kind: ReplyKind) -> String {
        match kind {
            ReplyKind::Handshake => self.colors.info.clone(),
            ReplyKind::Success => self.colors.success.clone(),
            ReplyKind::Failure | ReplyKind::UnknownCommand | ReplyKind::Unauthorized => {
                self.colors.error.clone()
            }
        }
    }

    pub fn style_for(&self, command: &str) -> ReplyStyle {
        match self.reply_styles.get(command).map(String::as_str) {
            Some("text") => ReplyStyle::Text,
            _ => ReplyStyle::Attachment,
        }
    }

    /// Renders a reply for the request, overlaying the command's template
    /// overrides when it carries any.
    pub fn reply(
        &self,
        kind: ReplyKind,
        request: &Request,
        overrides: &HashMap<String, String>,
        extras: Payload,
    ) -> Result<Reply, TemplateError> {
        let templates = if overrides.is_empty() {
            self.builder.build()?
        } else {
            self.builder.clone().with_templates(overrides).build()?
        };

        let mut payload = Payload::from([
            ("command".to_string(), Value::String(request.command.clone())),
            ("user".to_string(), Value::String(request.username.clone())),
            (
                "userlink".to_string(),
                Value::String(request.user_link.clone()),
            ),
        ]);
        for (key, value) in extras {
            payload.insert(key, value);
        }

        let text = templates.render(kind.template_name(), &payload)?;
        Ok(Reply {
            text,
            channel_id: request.channel_id.clone(),
            color: self.color_for(kind),
            style: self.style_for(&request.command),
        })
    }
}
