use imagine_core::validator::MAX_PROMPT_LENGTH;

use crate::ClientError;

/// Drops characters outside letters, digits, whitespace and `.,!?-`, then
/// collapses whitespace runs to single spaces.
pub fn sanitize_prompt(prompt: &str) -> Result<String, ClientError> {
    if prompt.chars().count() > MAX_PROMPT_LENGTH {
        return Err(ClientError::InvalidPrompt(format!(
            "Prompt too long (max {MAX_PROMPT_LENGTH} characters)"
        )));
    }
    let cleaned: String = prompt
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || ".,!?-".contains(*c))
        .collect();
    Ok(cleaned.split_whitespace().collect::<Vec<_>>().join(" "))
}
