//! Output formatting for CLI commands

use serde::Serialize;

use crate::types::NotificationResult;

/// Format output as JSON, or fall back to the given text rendering
pub fn format_output<T: Serialize>(data: &T, json: bool, text: impl FnOnce(&T) -> String) -> String {
    if json {
        serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string())
    } else {
        text(data)
    }
}

/// 单个渠道结果的一行摘要
pub fn result_line(result: &NotificationResult) -> String {
    let mut line = format!(
        "  {:<12} {:<8} attempts={}",
        result.channel,
        result.status.as_str(),
        result.attempts
    );
    if let Some(provider) = &result.provider {
        line.push_str(&format!(" provider={}", provider));
    }
    if let Some(error) = &result.error {
        line.push_str(&format!(" error={}", error));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_output_json_and_text() {
        let data = json!({"removed": 3});
        let json_out = format_output(&data, true, |_| unreachable!());
        assert!(json_out.contains("\"removed\": 3"));

        let text_out = format_output(&data, false, |d| format!("removed {}", d["removed"]));
        assert_eq!(text_out, "removed 3");
    }

    #[test]
    fn test_result_line() {
        let result = NotificationResult::failed("email", Some("smtp"), 3, "timeout");
        let line = result_line(&result);
        assert!(line.contains("email"));
        assert!(line.contains("failed"));
        assert!(line.contains("attempts=3"));
        assert!(line.contains("provider=smtp"));
        assert!(line.contains("error=timeout"));
    }
}
