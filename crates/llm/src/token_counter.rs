//! Token estimation for TPM reservations.

use std::sync::OnceLock;

use tiktoken_rs::{CoreBPE, cl100k_base};

use crate::messages::{ChatCompletionRequest, ChatMessage};

static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn tokenizer() -> Option<&'static CoreBPE> {
    TOKENIZER
        .get_or_init(|| match cl100k_base() {
            Ok(tokenizer) => Some(tokenizer),
            Err(e) => {
                log::error!("Failed to initialize cl100k_base tokenizer, falling back to length estimates: {e}");
                None
            }
        })
        .as_ref()
}

/// Count prompt tokens with the cl100k_base encoding.
///
/// Role and string content of every message are counted, plus three tokens of
/// formatting per message and three tokens priming the assistant reply. Providers
/// tokenize differently; this is an estimate for admission, reconciled after the call.
pub(crate) fn count_input_tokens(request: &ChatCompletionRequest) -> usize {
    let tokens: usize = request.messages.iter().map(count_message_tokens).sum();

    tokens + request.messages.len() * 3 + 3
}

/// Tokens to reserve for a request: the prompt estimate plus `max_tokens` when given.
pub(crate) fn estimate_request_tokens(request: &ChatCompletionRequest) -> u64 {
    count_input_tokens(request) as u64 + request.max_tokens.map(u64::from).unwrap_or_default()
}

fn count_message_tokens(message: &ChatMessage) -> usize {
    count_text(&message.role) + message.text().map(count_text).unwrap_or_default()
}

fn count_text(text: &str) -> usize {
    match tokenizer() {
        Some(tokenizer) => tokenizer.encode_ordinary(text).len(),
        None => text.len().div_ceil(4),
    }
}
