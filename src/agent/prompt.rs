//! Agent instructions.

use std::path::Path;

use crate::error::SetupError;
use crate::tools::ToolRegistry;

/// Read the instructions file, falling back to built-in instructions when it
/// does not exist.
pub fn load_instructions(path: &Path, tools: &ToolRegistry) -> Result<String, SetupError> {
    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => Ok(text),
        Ok(_) => {
            tracing::warn!("{} is empty, using default instructions", path.display());
            Ok(build_default_instructions(tools))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("{} not found, using default instructions", path.display());
            Ok(build_default_instructions(tools))
        }
        Err(source) => Err(SetupError::Read {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Build instructions that describe the registered tools.
pub fn build_default_instructions(tools: &ToolRegistry) -> String {
    let tool_descriptions = tools
        .list_tools()
        .iter()
        .map(|t| format!("- **{}**: {}", t.name, t.description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are the Contoso Pizza assistant. You help customers with questions about stores, opening hours, the menu and orders.

## Your Capabilities

You have access to the following tools:
{tool_descriptions}

## Rules and Guidelines

1. **Use the store documents** - Answer questions about stores and opening hours from the documents you can search. Don't guess.

2. **Ask before ordering** - Confirm size, toppings and pickup store with the customer before placing an order.

3. **Stay on topic** - Politely decline requests that have nothing to do with Contoso Pizza.

4. **Be brief** - Keep answers short and friendly."#,
        tool_descriptions = tool_descriptions
    )
}
