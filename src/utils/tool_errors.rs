use crate::errors::ToolError;
use serde_json::Value;

fn edit_distance(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut curr = vec![i + 1; b_chars.len() + 1];
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        prev = curr;
    }
    prev[b_chars.len()]
}

pub fn suggest(input: &str, known: &[&str], limit: usize) -> Vec<String> {
    let needle = input.trim().to_lowercase().replace('-', "_");
    if needle.is_empty() {
        return Vec::new();
    }
    let allowed = match needle.len() {
        0..=4 => 1,
        5..=8 => 2,
        n => n / 3,
    };
    let mut scored: Vec<(usize, &str)> = known
        .iter()
        .filter_map(|candidate| {
            let score = if candidate.contains(&needle) || needle.contains(candidate) {
                1
            } else {
                edit_distance(&needle, candidate)
            };
            (score <= allowed).then_some((score, *candidate))
        })
        .collect();
    scored.sort();
    scored
        .into_iter()
        .take(limit.max(1))
        .map(|(_, name)| name.to_string())
        .collect()
}

pub fn unknown_action_error(tool: &str, action: Option<&Value>, known: &[&str]) -> ToolError {
    let action = action.and_then(Value::as_str).unwrap_or("");
    let suggestions = suggest(action, known, 3);
    let mut hint = format!("Use one of: {}.", known.join(", "));
    if !suggestions.is_empty() {
        hint = format!("Did you mean: {}? {}", suggestions.join(", "), hint);
    }
    ToolError::invalid_params(format!("Unknown {} action: {}", tool, action))
        .with_hint(hint)
        .with_details(serde_json::json!({
            "known_actions": known,
            "did_you_mean": suggestions,
        }))
}

pub fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::invalid_params(format!("{} must be a non-empty string", key)))
}

pub fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn read_positive_int(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse::<u64>().ok()))
}
