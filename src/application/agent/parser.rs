use super::models::Plan;
use serde_json::Value;

/// Extract a structured plan from free-form model output.
///
/// Tries, in order: the first fenced ```json block, then the slice between
/// the first `{` and the last `}`. Returns `None` when neither parses; the
/// loop substitutes an empty fallback plan.
pub fn parse_plan(content: &str) -> Option<Plan> {
    extract_json(content).and_then(|value| serde_json::from_value(value).ok())
}

/// Same extraction, for payloads that are not plans (e.g. patch objects).
pub fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();

    if let Some(fenced) = fenced_json_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(fenced.trim()) {
            return Some(value);
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return Some(value);
            }
        }
    }

    None
}

fn fenced_json_block(text: &str) -> Option<&str> {
    let fence = text
        .find("```json")
        .or_else(|| text.find("```JSON"))?;
    let rest = &text[fence + "```json".len()..];
    let end = rest.find("```")?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json_block() {
        let content = "Here is the plan:\n```json\n{\"plan\":\"echo\",\"steps\":[\"run\"],\"createTools\":[],\"run\":[{\"id\":\"echo\"}]}\n```\nDone.";
        let plan = parse_plan(content).expect("plan parses");
        assert_eq!(plan.describe(), "echo");
        assert_eq!(plan.run.len(), 1);
        assert_eq!(plan.run[0].id, "echo");
    }

    #[test]
    fn fence_marker_is_case_insensitive() {
        let content = "```JSON\n{\"plan\":\"x\",\"run\":[]}\n```";
        assert!(parse_plan(content).is_some());
    }

    #[test]
    fn falls_back_to_brace_slice() {
        let content = "The model says {\"plan\":\"loose\",\"run\":[]} and nothing else.";
        let plan = parse_plan(content).expect("plan parses");
        assert_eq!(plan.describe(), "loose");
    }

    #[test]
    fn prefers_fenced_block_over_surrounding_braces() {
        let content = "{broken\n```json\n{\"plan\":\"inner\",\"run\":[]}\n```\nbroken}";
        let plan = parse_plan(content).expect("plan parses");
        assert_eq!(plan.describe(), "inner");
    }

    #[test]
    fn returns_none_for_unparseable_text() {
        assert!(parse_plan("no json here at all").is_none());
        assert!(parse_plan("{definitely not json}").is_none());
    }

    #[test]
    fn extract_json_reads_patch_objects() {
        let value =
            extract_json("```json\n{\"files\":{\"main.py\":\"print(1)\"}}\n```").expect("value");
        assert_eq!(value["files"]["main.py"], "print(1)");
    }
}
