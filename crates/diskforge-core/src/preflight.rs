//! Host tool availability checks.

/// Returns the tools from `tools` that cannot be found on `PATH`.
#[must_use]
pub fn missing_tools(tools: &[&str]) -> Vec<String> {
    tools
        .iter()
        .filter(|tool| which::which(tool).is_err())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_is_present() {
        assert!(missing_tools(&["sh"]).is_empty());
    }

    #[test]
    fn unknown_tool_is_reported() {
        assert_eq!(
            missing_tools(&["sh", "diskforge-no-such-tool"]),
            vec!["diskforge-no-such-tool".to_string()]
        );
    }
}
