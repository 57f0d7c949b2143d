//! Structured command markers in model output
//!
//! The model is told to answer VM requests with a single JSON object. Models
//! drift, so two marker shapes are recognized:
//!
//! - a JSON object with an `operation` key, anywhere in the text
//! - a `multipass <verb> ...` command line (optionally in backticks or after `$ `)
//!
//! Anything else is conversation. Extraction never validates; the result is a
//! [`RawIntent`] for the operation model to check.

use serde_json::Value;

use crate::operation::{Quantity, RawIntent};

/// Default system prompt for the VM assistant
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a helpful assistant that manages local Multipass virtual machines.

When the user asks you to do something with a VM, answer with exactly one JSON object and nothing else:
  {"operation": "list_vms"}
  {"operation": "create_vm", "name": "build1", "cpus": 2, "memory_mb": 4096, "disk_gb": 20, "image": "22.04"}
  {"operation": "start_vm", "name": "build1"}
  {"operation": "stop_vm", "name": "build1"}
  {"operation": "delete_vm", "name": "build1"}

Guidelines:
- Leave out fields the user did not mention
- VM names start with a letter and use only letters, digits, '-' and '_'
- Memory is in megabytes, disk in gigabytes
- For anything that is not a VM request, reply in plain text without JSON"#;

/// Find the first structured command in `text`, skipping malformed ones
pub fn extract_intent(text: &str) -> Option<RawIntent> {
    find_intent(text).and_then(Result::ok)
}

/// Find the first structured command in `text`.
///
/// A JSON object tagged with an operation whose fields have the wrong types
/// yields `Some(Err(reason))` instead of being mistaken for conversation.
pub fn find_intent(text: &str) -> Option<Result<RawIntent, String>> {
    extract_json_intent(text).or_else(|| extract_cli_intent(text).map(Ok))
}

/// Scan balanced `{...}` regions and take the first tagged object
fn extract_json_intent(text: &str) -> Option<Result<RawIntent, String>> {
    let text = text.trim();
    if let Some(intent) = parse_json_intent(text) {
        return Some(intent);
    }

    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Some(intent) = parse_json_intent(&text[s..=i]) {
                            return Some(intent);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_json_intent(candidate: &str) -> Option<Result<RawIntent, String>> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let object = value.as_object()?;
    let has_tag = ["operation", "op", "action", "command"]
        .iter()
        .any(|k| object.get(*k).map(Value::is_string).unwrap_or(false));
    if !has_tag {
        return None;
    }
    Some(serde_json::from_value(value).map_err(|e| format!("malformed command ({})", e)))
}

/// Look for a `multipass ...` line
fn extract_cli_intent(text: &str) -> Option<RawIntent> {
    text.lines()
        .flat_map(|line| line.split("&&"))
        .map(clean_command_line)
        .find_map(|line| {
            let rest = line.strip_prefix("multipass ")?;
            parse_cli_command(rest)
        })
}

fn clean_command_line(line: &str) -> &str {
    let line = line.trim().trim_matches('`').trim();
    line.strip_prefix("$ ").unwrap_or(line).trim()
}

/// Parse the arguments after `multipass` into an intent.
///
/// Unrecognized verbs become intents with that verb as the operation so the
/// operation model can reject them.
pub fn parse_cli_command(args: &str) -> Option<RawIntent> {
    let tokens: Vec<String> = args
        .split_whitespace()
        .map(|t| t.trim_matches(|c| c == '"' || c == '\'' || c == '`').to_string())
        .filter(|t| !t.is_empty())
        .collect();
    let (verb, rest) = tokens.split_first()?;

    let mut intent = RawIntent::new(verb.to_ascii_lowercase());
    match intent.operation.as_str() {
        "launch" | "create" => parse_launch_flags(&mut intent, rest),
        "delete" | "remove" | "rm" => {
            if rest.iter().any(|t| t == "--purge" || t == "-p") {
                intent.purge = Some(true);
            }
            intent.name = first_positional(rest);
        }
        "start" | "stop" => intent.name = first_positional(rest),
        _ => {}
    }
    Some(intent)
}

fn parse_launch_flags(intent: &mut RawIntent, args: &[String]) {
    let mut i = 0;
    while i < args.len() {
        let (flag, inline) = match args[i].split_once('=') {
            Some((flag, value)) if flag.starts_with('-') => (flag, Some(value.to_string())),
            _ => (args[i].as_str(), None),
        };
        let takes_value = matches!(
            flag,
            "--name" | "-n" | "--cpus" | "--cpu" | "-c" | "--memory" | "--mem" | "-m" | "--disk" | "-d"
        );
        let value = if takes_value {
            match inline {
                Some(v) => Some(v),
                None => {
                    i += 1;
                    args.get(i).cloned()
                }
            }
        } else {
            None
        };

        match flag {
            "--name" | "-n" => intent.name = value,
            "--cpus" | "--cpu" | "-c" => intent.cpus = value.map(Quantity::Text),
            "--memory" | "--mem" | "-m" => intent.memory_mb = value.map(Quantity::Text),
            "--disk" | "-d" => intent.disk_gb = value.map(Quantity::Text),
            positional if !positional.starts_with('-') && intent.image.is_none() => {
                intent.image = Some(positional.to_string());
            }
            _ => {}
        }
        i += 1;
    }
}

fn first_positional(args: &[String]) -> Option<String> {
    args.iter().find(|t| !t.starts_with('-')).cloned()
}
