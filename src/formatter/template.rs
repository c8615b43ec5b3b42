use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("could not parse template {name}: {reason}")]
    Parse { name: String, reason: String },
    #[error("{0} is not loaded in the payload")]
    MissingKey(String),
    #[error("{0} is not usable as a string")]
    NotAString(String),
    #[error("{0} is not a list of strings")]
    NotAList(String),
}

pub type Result<T> = std::result::Result<T, TemplateError>;

/// Values a template can be rendered with.
pub type Payload = HashMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Var(String),
    AnyValue(String),
    HumanizeTime(String),
    HumanizeSize(String),
    HumanizeNumber(String),
    Join(String, String),
    With {
        source: String,
        bind: String,
        body: Vec<Node>,
    },
}

/// A parsed template that renders payloads into reply text.
///
/// Supports `{{ .var }}` substitution, `{{ AnyValue "bank" . }}` uniform
/// random phrase picks, the `HumanizeTime`/`HumanizeSize`/`HumanizeNumber`/
/// `Join` helpers, and `{{ with $x := .var }}...{{ end }}` blocks that only
/// render when the variable is present and non empty.
#[derive(Debug, Clone)]
pub struct Renderer {
    name: String,
    nodes: Vec<Node>,
}

impl Renderer {
    pub fn new(name: &str, template: &str) -> Result<Renderer> {
        let nodes = parse(name, template)?;
        Ok(Renderer {
            name: name.to_string(),
            nodes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render(&self, payload: &Payload) -> Result<String> {
        let mut out = String::new();
        render_nodes(&self.nodes, payload, &mut HashMap::new(), &mut out)?;
        Ok(out)
    }
}

fn parse(name: &str, template: &str) -> Result<Vec<Node>> {
    let err = |reason: &str| TemplateError::Parse {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let mut nodes = Vec::new();
    // Stack of open `with` blocks: (source, bind, nodes before the block).
    let mut stack: Vec<(String, String, Vec<Node>)> = Vec::new();

    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            nodes.push(Node::Text(rest[..open].to_string()));
        }
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or_else(|| err("unterminated action"))?;
        let action = after[..close].trim();
        rest = &after[close + 2..];

        let words = split_action(action).map_err(|reason| err(&reason))?;
        match words.first().map(String::as_str) {
            None => return Err(err("empty action")),
            Some("with") => {
                // with $x := .var
                if words.len() != 4 || words[2] != ":=" || !words[1].starts_with('$') {
                    return Err(err("with action must look like `with $x := .var`"));
                }
                let source = parse_var(&words[3]).ok_or_else(|| err("with needs a variable"))?;
                let bind = words[1].clone();
                stack.push((source, bind, std::mem::take(&mut nodes)));
            }
            Some("end") => {
                let (source, bind, outer) =
                    stack.pop().ok_or_else(|| err("end without an open block"))?;
                let body = std::mem::replace(&mut nodes, outer);
                nodes.push(Node::With { source, bind, body });
            }
            Some("AnyValue") => {
                if words.len() != 3 {
                    return Err(err("AnyValue takes a quoted bank name and a dot"));
                }
                let bank = parse_quoted(&words[1])
                    .ok_or_else(|| err("AnyValue bank name must be quoted"))?;
                nodes.push(Node::AnyValue(bank));
            }
            Some("HumanizeTime") => {
                let var = single_var(&words).ok_or_else(|| err("HumanizeTime takes a variable"))?;
                nodes.push(Node::HumanizeTime(var));
            }
            Some("HumanizeSize") => {
                let var = single_var(&words).ok_or_else(|| err("HumanizeSize takes a variable"))?;
                nodes.push(Node::HumanizeSize(var));
            }
            Some("HumanizeNumber") => {
                let var =
                    single_var(&words).ok_or_else(|| err("HumanizeNumber takes a variable"))?;
                nodes.push(Node::HumanizeNumber(var));
            }
            Some("Join") => {
                if words.len() != 3 {
                    return Err(err("Join takes a variable and a quoted separator"));
                }
                let var = parse_var(&words[1]).ok_or_else(|| err("Join takes a variable"))?;
                let sep =
                    parse_quoted(&words[2]).ok_or_else(|| err("Join separator must be quoted"))?;
                nodes.push(Node::Join(var, sep));
            }
            Some(word) if word.starts_with('.') || word.starts_with('$') => {
                if words.len() != 1 {
                    return Err(err("variable action takes no arguments"));
                }
                nodes.push(Node::Var(word.to_string()));
            }
            Some(word) => return Err(err(&format!("unknown action {}", word))),
        }
    }

    if !stack.is_empty() {
        return Err(err("unclosed with block"));
    }
    if !rest.is_empty() {
        nodes.push(Node::Text(rest.to_string()));
    }
    Ok(nodes)
}

fn single_var(words: &[String]) -> Option<String> {
    if words.len() != 2 {
        return None;
    }
    parse_var(&words[1])
}

fn parse_var(word: &str) -> Option<String> {
    if word.starts_with('.') && word.len() > 1 || word.starts_with('$') && word.len() > 1 {
        Some(word.to_string())
    } else {
        None
    }
}

fn parse_quoted(word: &str) -> Option<String> {
    word.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .map(str::to_string)
}

/// Splits an action into words, keeping double quoted strings whole.
fn split_action(action: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut chars = action.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                current.push('"');
                loop {
                    match chars.next() {
                        Some('"') => {
                            current.push('"');
                            break;
                        }
                        Some(inner) => current.push(inner),
                        None => return Err("unterminated string in action".to_string()),
                    }
                }
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}

fn render_nodes(
    nodes: &[Node],
    payload: &Payload,
    bound: &mut HashMap<String, Value>,
    out: &mut String,
) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var(var) => {
                let value = lookup(var, payload, bound)?;
                out.push_str(&value_to_string(var, &value)?);
            }
            Node::AnyValue(bank) => {
                let values = payload
                    .get(bank)
                    .ok_or_else(|| TemplateError::MissingKey(bank.clone()))?;
                out.push_str(&any_value(bank, values)?);
            }
            Node::HumanizeTime(var) => {
                let value = lookup(var, payload, bound)?;
                let raw = value_to_string(var, &value)?;
                let time = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|_| TemplateError::NotAString(var.clone()))?;
                out.push_str(&humanize_time(time.with_timezone(&Utc)));
            }
            Node::HumanizeSize(var) => {
                let value = lookup(var, payload, bound)?;
                let bytes = value
                    .as_u64()
                    .ok_or_else(|| TemplateError::NotAString(var.clone()))?;
                out.push_str(&humanize_size(bytes));
            }
            Node::HumanizeNumber(var) => {
                let value = lookup(var, payload, bound)?;
                let number = value
                    .as_f64()
                    .ok_or_else(|| TemplateError::NotAString(var.clone()))?;
                out.push_str(&humanize_number(number));
            }
            Node::Join(var, sep) => {
                let value = lookup(var, payload, bound)?;
                let list = string_list(var, &value)?;
                out.push_str(&list.join(sep));
            }
            Node::With { source, bind, body } => {
                let value = match lookup(source, payload, bound) {
                    Ok(value) => value,
                    Err(TemplateError::MissingKey(_)) => continue,
                    Err(err) => return Err(err),
                };
                if is_empty(&value) {
                    continue;
                }
                bound.insert(bind.clone(), value);
                render_nodes(body, payload, bound, out)?;
                bound.remove(bind);
            }
        }
    }
    Ok(())
}

fn lookup(var: &str, payload: &Payload, bound: &HashMap<String, Value>) -> Result<Value> {
    if let Some(name) = var.strip_prefix('.') {
        return payload
            .get(name)
            .cloned()
            .ok_or_else(|| TemplateError::MissingKey(name.to_string()));
    }
    bound
        .get(var)
        .cloned()
        .ok_or_else(|| TemplateError::MissingKey(var.to_string()))
}

fn value_to_string(var: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(boolean) => Ok(boolean.to_string()),
        Value::Null => Ok(String::new()),
        _ => Err(TemplateError::NotAString(var.to_string())),
    }
}

fn string_list(var: &str, value: &Value) -> Result<Vec<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| TemplateError::NotAList(var.to_string()))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| TemplateError::NotAList(var.to_string()))
        })
        .collect()
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Picks one phrase uniformly at random from the named bank.
pub fn any_value(bank: &str, values: &Value) -> Result<String> {
    let phrases = values
        .as_array()
        .filter(|items| !items.is_empty())
        .ok_or_else(|| TemplateError::NotAList(bank.to_string()))?;
    let index = rand::thread_rng().gen_range(0..phrases.len());
    phrases[index]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| TemplateError::NotAList(bank.to_string()))
}

/// Renders a time as a relative human phrase, "2 minutes ago" style.
pub fn humanize_time(time: DateTime<Utc>) -> String {
    let delta = Utc::now().signed_duration_since(time);
    let (delta, suffix) = if delta.num_seconds() >= 0 {
        (delta, "ago")
    } else {
        (-delta, "from now")
    };

    let seconds = delta.num_seconds();
    if seconds < 2 {
        return "now".to_string();
    }
    let (amount, unit) = if seconds < 60 {
        (seconds, "second")
    } else if seconds < 3600 {
        (delta.num_minutes(), "minute")
    } else if seconds < 86_400 {
        (delta.num_hours(), "hour")
    } else {
        (delta.num_days(), "day")
    };
    let plural = if amount == 1 { "" } else { "s" };
    format!("{} {}{} {}", amount, unit, plural, suffix)
}

/// Renders a byte count with SI units (1000 based): `1500` becomes
/// "1.5 kB".
pub fn humanize_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["kB", "MB", "GB", "TB", "PB", "EB"];
    if bytes < 1000 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if value >= 1000.0 {
        value /= 1000.0;
    }
    format!("{} {}", humanize_number((value * 10.0).round() / 10.0), UNITS[unit])
}

/// Formats a float with trailing zeros trimmed: `5.10` becomes "5.1", `5.0`
/// becomes "5".
pub fn humanize_number(number: f64) -> String {
    let text = format!("{:.3}", number);
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn payload() -> Payload {
        Payload::from([
            ("userlink".to_string(), json!("<@U1>")),
            ("output".to_string(), json!("hi there\n")),
            ("success".to_string(), json!(["All done!"])),
        ])
    }

    #[test]
    fn renders_plain_variables() {
        let renderer = Renderer::new("t", "hello {{ .userlink }}!").unwrap();
        assert_eq!(renderer.render(&payload()).unwrap(), "hello <@U1>!");
    }

    #[test]
    fn missing_variable_is_an_error() {
        let renderer = Renderer::new("t", "{{ .nope }}").unwrap();
        assert_eq!(
            renderer.render(&payload()).unwrap_err(),
            TemplateError::MissingKey("nope".to_string())
        );
    }

    #[test]
    fn any_value_picks_a_configured_phrase() {
        let renderer = Renderer::new("t", "{{ AnyValue \"success\" . }}").unwrap();
        assert_eq!(renderer.render(&payload()).unwrap(), "All done!");
    }

    #[test]
    fn any_value_is_uniform_over_the_bank() {
        let mut payload = payload();
        payload.insert("bank".to_string(), json!(["a", "b", "c"]));
        let renderer = Renderer::new("t", "{{ AnyValue \"bank\" . }}").unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(renderer.render(&payload).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn with_block_renders_only_when_non_empty() {
        let renderer =
            Renderer::new("t", "ok{{ with $out := .output }} -> {{ $out }}{{ end }}").unwrap();
        assert_eq!(renderer.render(&payload()).unwrap(), "ok -> hi there\n");

        let mut empty = payload();
        empty.insert("output".to_string(), json!(""));
        assert_eq!(renderer.render(&empty).unwrap(), "ok");

        let mut missing = payload();
        missing.remove("output");
        assert_eq!(renderer.render(&missing).unwrap(), "ok");
    }

    #[test]
    fn join_concatenates_string_lists() {
        let mut payload = payload();
        payload.insert("args".to_string(), json!(["one", "two"]));
        let renderer = Renderer::new("t", "{{ Join .args \", \" }}").unwrap();
        assert_eq!(renderer.render(&payload).unwrap(), "one, two");
    }

    #[test]
    fn humanize_helpers_render_inside_templates() {
        let mut payload = payload();
        payload.insert("size".to_string(), json!(1500));
        payload.insert("n".to_string(), json!(5.10));
        let renderer =
            Renderer::new("t", "{{ HumanizeSize .size }} {{ HumanizeNumber .n }}").unwrap();
        assert_eq!(renderer.render(&payload).unwrap(), "1.5 kB 5.1");
    }

    #[test]
    fn humanize_time_is_relative() {
        let now = Utc::now();
        assert_eq!(humanize_time(now), "now");
        assert_eq!(humanize_time(now - Duration::seconds(30)), "30 seconds ago");
        assert_eq!(humanize_time(now - Duration::minutes(5)), "5 minutes ago");
        assert_eq!(humanize_time(now - Duration::hours(1)), "1 hour ago");
        assert_eq!(humanize_time(now - Duration::days(3)), "3 days ago");
    }

    #[test]
    fn humanize_size_uses_si_units() {
        assert_eq!(humanize_size(999), "999 B");
        assert_eq!(humanize_size(1000), "1 kB");
        assert_eq!(humanize_size(82_854_982), "82.9 MB");
        assert_eq!(humanize_size(3_000_000_000), "3 GB");
    }

    #[test]
    fn parse_rejects_malformed_templates() {
        assert!(Renderer::new("t", "{{ .open").is_err());
        assert!(Renderer::new("t", "{{ Bogus .x }}").is_err());
        assert!(Renderer::new("t", "{{ with $x := .y }}no end").is_err());
        assert!(Renderer::new("t", "{{ end }}").is_err());
    }
}
