use anyhow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Classify,
    Handler,
    Evaluator,
    Session,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Classify => "CLASSIFY",
            ErrorCategory::Handler => "HANDLER",
            ErrorCategory::Evaluator => "EVALUATOR",
            ErrorCategory::Session => "SESSION",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Classify => {
                "Check --classifier and the routing model wiring, or fall back to --classifier rules."
            }
            ErrorCategory::Handler => {
                "The named agent backend is misconfigured. Review its credentials and retry with RUST_LOG=info."
            }
            ErrorCategory::Evaluator => {
                "Quality scoring failed; the reply itself is unaffected. Retry with RUST_LOG=info for scorer logs."
            }
            ErrorCategory::Session => "Check --session-id; unseen session ids start with empty history.",
            ErrorCategory::Input => "Run enso-hub --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("classif") || msg.contains("routing model") {
        return ErrorCategory::Classify;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("cannot be empty")
        || msg.contains("profile")
        || msg.contains("unknown tool")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("agent") || msg.contains("handler") || msg.contains("backend") {
        return ErrorCategory::Handler;
    }

    if msg.contains("scorer") || msg.contains("metric") || msg.contains("evaluat") {
        return ErrorCategory::Evaluator;
    }

    if msg.contains("session") {
        return ErrorCategory::Session;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error) -> String {
    let category = categorize_error(err);
    format!("[{}] {}\nHint: {}", category.code(), err, category.hint())
}
