use bundlelab_adapters::config::Provider;
use serde::{Deserialize, Serialize};

/// Output budget sent with Anthropic requests, which require one.
pub const ANTHROPIC_MAX_TOKENS: u32 = 4_096;

/// Anthropic API version header value.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Request path relative to the provider base URL.
pub fn endpoint_path(provider: Provider) -> &'static str {
    match provider {
        Provider::OpenAi => "chat/completions",
        Provider::Anthropic => "messages",
    }
}

/// Token usage reported by the provider.
///
/// Anthropic reports `input_tokens`/`output_tokens` and no total; both shapes
/// deserialize into the same struct.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default, alias = "input_tokens")]
    pub prompt_tokens: u64,
    #[serde(default, alias = "output_tokens")]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// Successful calls folded into this total.
    #[serde(default, skip_deserializing)]
    pub calls: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        }
    }

    /// Add one response's usage to a running total.
    pub fn merge(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total();
        self.calls += other.calls.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_reads_both_provider_shapes() {
        let openai: Usage = serde_json::from_str(
            r#"{"prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150}"#,
        )
        .unwrap();
        assert_eq!(openai.total(), 150);

        let anthropic: Usage =
            serde_json::from_str(r#"{"input_tokens": 40, "output_tokens": 10}"#).unwrap();
        assert_eq!(anthropic.prompt_tokens, 40);
        assert_eq!(anthropic.completion_tokens, 10);
        assert_eq!(anthropic.total(), 50);
    }

    #[test]
    fn merge_sums_tokens_and_counts_calls() {
        let mut total = Usage::default();
        total.merge(&Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 0,
            calls: 0,
        });
        total.merge(&Usage {
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
            calls: 0,
        });
        assert_eq!(total.prompt_tokens, 11);
        assert_eq!(total.total_tokens, 17);
        assert_eq!(total.calls, 2);
    }

    #[test]
    fn endpoint_paths_per_provider() {
        assert_eq!(endpoint_path(Provider::OpenAi), "chat/completions");
        assert_eq!(endpoint_path(Provider::Anthropic), "messages");
    }
}
