use std::collections::BTreeMap;

use serde_json::Value;

use super::registry::{
    CommandSpec, HISTORY_COMMAND, NO_ARG_COMMANDS, OPEN_COMMAND, OPTIONS_COMMAND,
    SINGLE_PATH_COMMANDS, TEXT_ARG_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub settings_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            settings_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
        }
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.command_args
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn split_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = split_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

/// `true`/`false` and numbers become typed JSON; anything else stays a string.
fn setting_value(raw: &str) -> Value {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(number) = raw.trim().parse::<i64>() {
        return Value::from(number);
    }
    if let Ok(number) = raw.trim().parse::<f64>() {
        if number.is_finite() {
            return Value::from(number);
        }
    }
    Value::String(raw.to_string())
}

fn parse_settings(arg: &str) -> (BTreeMap<String, Value>, Vec<String>) {
    let mut settings = BTreeMap::new();
    let mut invalid = Vec::new();
    for part in split_args(arg) {
        match part.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                settings.insert(key.trim().to_ascii_lowercase(), setting_value(value));
            }
            _ => invalid.push(part),
        }
    }
    (settings, invalid)
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let remainder = &slash_tail[command_len..];
            let arg = remainder.trim();

            if let Some(action) = find_action(&command, TEXT_ARG_COMMANDS) {
                let mut intent = Intent::new(action, text);
                if !arg.is_empty() {
                    intent.prompt = Some(arg.to_string());
                }
                return intent;
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "path".to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            if command == HISTORY_COMMAND.command {
                let mut intent = Intent::new(HISTORY_COMMAND.action, text);
                let limit = arg
                    .parse::<u64>()
                    .ok()
                    .filter(|value| *value > 0)
                    .map(Value::from)
                    .unwrap_or(Value::Null);
                intent.command_args.insert("limit".to_string(), limit);
                return intent;
            }

            if command == OPEN_COMMAND.command {
                let mut intent = Intent::new(OPEN_COMMAND.action, text);
                intent.command_args.insert(
                    "target".to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if command == OPTIONS_COMMAND.command {
                let (settings, invalid) = parse_settings(arg);
                let mut intent = Intent::new(OPTIONS_COMMAND.action, text);
                intent.settings_update = settings;
                if !invalid.is_empty() {
                    intent.command_args.insert(
                        "invalid".to_string(),
                        Value::Array(invalid.into_iter().map(Value::String).collect()),
                    );
                }
                return intent;
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("generate", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn plain_text_is_generate_with_prompt() {
        let intent = parse_intent("  modern loft, concrete floors ");
        assert_eq!(intent.action, "generate");
        assert_eq!(intent.prompt.as_deref(), Some("modern loft, concrete floors"));
    }

    #[test]
    fn blank_line_is_noop() {
        assert_eq!(parse_intent("   ").action, "noop");
    }

    #[test]
    fn text_commands_keep_optional_prompt() {
        let generate = parse_intent("/generate");
        assert_eq!(generate.action, "generate");
        assert_eq!(generate.prompt, None);

        let stylize = parse_intent("/stylize warm evening light, walnut floors");
        assert_eq!(stylize.action, "stylize");
        assert_eq!(
            stylize.prompt.as_deref(),
            Some("warm evening light, walnut floors")
        );

        assert_eq!(parse_intent("/enhance").action, "enhance");
    }

    #[test]
    fn path_commands_accept_quoted_paths() {
        let upload = parse_intent("/upload \"/tmp/floor plan.png\"");
        assert_eq!(upload.action, "upload");
        assert_eq!(upload.command_args["path"], json!("/tmp/floor plan.png"));
        assert_eq!(upload.arg_str("path"), Some("/tmp/floor plan.png"));

        let capture = parse_intent("/capture");
        assert_eq!(capture.action, "capture");
        assert_eq!(capture.arg_str("path"), None);

        let fetch = parse_intent("/fetch out/meshes");
        assert_eq!(fetch.command_args["path"], json!("out/meshes"));
    }

    #[test]
    fn no_arg_commands_and_aliases() {
        assert_eq!(parse_intent("/retry").action, "retry");
        assert_eq!(parse_intent("/remove").action, "remove");
        assert_eq!(parse_intent("/status").action, "status");
        assert_eq!(parse_intent("/help").action, "help");
        assert_eq!(parse_intent("/quit").action, "quit");
        assert_eq!(parse_intent("/EXIT").action, "quit");
    }

    #[test]
    fn history_and_open_arguments() {
        assert_eq!(parse_intent("/history 5").command_args["limit"], json!(5));
        assert_eq!(parse_intent("/history").command_args["limit"], json!(null));
        assert_eq!(parse_intent("/history lots").command_args["limit"], json!(null));

        let open = parse_intent("/open 018f-task");
        assert_eq!(open.action, "open");
        assert_eq!(open.command_args["target"], json!("018f-task"));
    }

    #[test]
    fn options_parse_typed_settings() {
        let intent = parse_intent(
            "/options target_polycount=50000 enable_pbr=false strength=0.6 texture_prompt=\"oak floors\" junk",
        );
        assert_eq!(intent.action, "set_options");
        assert_eq!(intent.settings_update["target_polycount"], json!(50000));
        assert_eq!(intent.settings_update["enable_pbr"], json!(false));
        assert_eq!(intent.settings_update["strength"], json!(0.6));
        assert_eq!(intent.settings_update["texture_prompt"], json!("oak floors"));
        assert_eq!(intent.command_args["invalid"], json!(["junk"]));
    }

    #[test]
    fn unknown_command_keeps_name_and_arg() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }
}
