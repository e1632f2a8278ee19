//! Prompt template rendering.

use std::collections::HashMap;

use wave_core::types::{Contract, ContractKind, OutputFormat};

/// Render a step prompt: `{{input}}` becomes the run input, and
/// `{{artifact:<as>}}` becomes the artifact's workspace-relative path under
/// `artifacts/`. Placeholders were resolved at load time, so rendering is
/// infallible.
pub fn render(template: &str, input: &str, injected: &HashMap<String, String>) -> String {
    let mut rendered = template.replace("{{input}}", input);
    for (as_name, relative_path) in injected {
        rendered = rendered.replace(&format!("{{{{artifact:{as_name}}}}}"), relative_path);
    }
    rendered
}

/// Append the previous failure diagnostic for a retry attempt.
pub fn enrich_with_failure(prompt: &str, diagnostic: &str) -> String {
    format!(
        "{prompt}\n\n## Previous attempt failed\n\n{diagnostic}\n\n\
         Fix the problem above and produce the required output."
    )
}

/// Contract-compliance section for the system prompt, when the step
/// declares a contract.
pub fn contract_section(contract: &Contract) -> String {
    let requirement = match &contract.kind {
        ContractKind::JsonSchema { .. } => {
            "Your final output must be a single JSON document that validates against the \
             declared schema. Output the JSON only, with no surrounding prose or fences."
                .to_string()
        }
        ContractKind::Command { command, .. } => format!(
            "After you finish, the command `{command}` will run in your workspace and must \
             exit 0. Make sure your changes satisfy it."
        ),
        ContractKind::Format { format } => {
            let label = match format {
                OutputFormat::Json => "valid JSON",
                OutputFormat::Yaml => "valid YAML",
                OutputFormat::Markdown => "well-structured markdown (headings or lists)",
                OutputFormat::Text => "non-empty text",
            };
            format!("Your final output must be {label}.")
        }
    };
    format!("# Output Contract\n\n{requirement}")
}
