//! 系统提示词模板：`{tools}` 展开为工具列表，`{today}` 展开为当天日期
//!
//! `{{` 与 `}}` 表示字面量花括号；未知占位符或未闭合的花括号视为模板语法错误。

use chrono::Local;

use crate::core::{FaultKind, RelayError};

/// 渲染系统提示词
pub fn render_system_prompt(
    template: &str,
    tools: &[(String, String)],
) -> Result<String, RelayError> {
    let today = Local::now().format("%Y-%m-%d").to_string();
    render_with(template, tools, &today)
}

fn tool_list(tools: &[(String, String)]) -> String {
    if tools.is_empty() {
        return "(no tools available)".to_string();
    }
    tools
        .iter()
        .map(|(name, desc)| format!("- {name}: {desc}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn render_with(
    template: &str,
    tools: &[(String, String)],
    today: &str,
) -> Result<String, RelayError> {
    let syntax = |message: String| RelayError::sandbox(FaultKind::Syntax, message);
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(syntax(format!("unclosed placeholder '{{{name}'")));
                }
                match name.trim() {
                    "tools" => out.push_str(&tool_list(tools)),
                    "today" => out.push_str(today),
                    other => return Err(syntax(format!("unknown placeholder '{{{other}}}'"))),
                }
            }
            '}' => return Err(syntax("unmatched '}' in prompt template".to_string())),
            c => out.push(c),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_placeholders() {
        let tools = vec![("search_datasets".to_string(), "Search datasets".to_string())];
        let out = render_with("Today is {today}.\n{tools}\nUse {{json}}.", &tools, "2024-05-01").unwrap();
        assert_eq!(out, "Today is 2024-05-01.\n- search_datasets: Search datasets\nUse {json}.");
    }

    #[test]
    fn test_unknown_placeholder_is_syntax_fault() {
        match render_with("Hello {user}", &[], "d") {
            Err(RelayError::Sandbox { fault, message }) => {
                assert_eq!(fault, FaultKind::Syntax);
                assert!(message.contains("{user}"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(render_with("broken {tools", &[], "d").is_err());
        assert!(render_with("stray }", &[], "d").is_err());
    }
}
