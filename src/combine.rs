use crate::dispatch::{DispatchResult, TokenUsage};

/// Final user-facing answer derived from the ordered dispatch results.
#[derive(Debug, Clone)]
pub struct CombinedAnswer {
    pub text: String,
    pub agents: Vec<String>,
    pub usage: TokenUsage,
}

/// Merges dispatch results into one answer, preserving selection order.
/// A single result is returned verbatim; multiple results render as
/// labeled sections, with failed agents shown as inline notices instead
/// of being silently dropped. Pure and idempotent.
pub fn combine(results: &[DispatchResult]) -> CombinedAnswer {
    let agents = results
        .iter()
        .map(|result| result.agent_id.clone())
        .collect::<Vec<String>>();

    let mut usage = TokenUsage::default();
    for result in results {
        usage.accumulate(result.usage);
    }

    let text = match results {
        [] => "⚠ No agents were available to answer this request.".to_string(),
        [only] => only.text(),
        many => many
            .iter()
            .map(|result| {
                format!(
                    "### 🤖 {} Agent\n\n{}",
                    result.agent_id.to_uppercase(),
                    result.text()
                )
            })
            .collect::<Vec<String>>()
            .join("\n\n---\n\n"),
    };

    CombinedAnswer {
        text,
        agents,
        usage,
    }
}
