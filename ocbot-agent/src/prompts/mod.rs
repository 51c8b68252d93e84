use crate::clients::ToolDefinition;
use crate::tools::page::PageContext;

const PREAMBLE: &str = r#"You are ocbot, an AI browser assistant that helps users complete tasks by controlling the browser.

You have access to browser tools to navigate, click, type, scroll, and read page content. Use these tools to accomplish the user's goals.

## Guidelines
- Break complex tasks into small steps
- After navigating, use getText or getElements to understand the page
- Use specific CSS selectors: prefer IDs, then unique attributes, then tag + class combinations
- If a click or type fails, try getElements to find the correct selector
- Always verify actions succeeded by checking the page state
- Be concise in your responses and focus on actions and results"#;

fn usage_hint(name: &str) -> Option<&'static str> {
    let hint = match name {
        "navigate" => "Go to a URL. Always include the protocol or domain.",
        "click" => "Click an element. Use precise CSS selectors.",
        "type" => "Type into inputs. Set pressEnter to \"true\" to submit.",
        "scroll" => "Scroll up or down to see more content.",
        "getText" => "Get the current page URL, title, and visible text.",
        "getElements" => "Query elements to find selectors, inspect structure.",
        "waitForNavigation" => "Wait for page load after actions that trigger navigation.",
        _ => return None,
    };
    Some(hint)
}

/// System message for one agent run. Tools without a built-in hint fall back
/// to their own description.
pub fn build_system_prompt(tools: &[ToolDefinition], page: Option<&PageContext>) -> String {
    let tools_section = if tools.is_empty() {
        "You have no tools available.".to_string()
    } else {
        let lines: Vec<String> = tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, usage_hint(&t.name).unwrap_or(&t.description)))
            .collect();
        format!("## Tool Usage\n{}", lines.join("\n"))
    };

    let mut prompt = format!("{}\n\n{}", PREAMBLE, tools_section);

    if let Some(page) = page {
        prompt.push_str(&format!(
            "\n\n## Current Page\n- URL: {}\n- Title: {}",
            page.url, page.title
        ));
    }

    prompt
}
