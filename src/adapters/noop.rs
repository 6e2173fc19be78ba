use async_trait::async_trait;

use super::critique::{BEGIN_REVISED, END_REVISED};
use super::{AdapterError, GenerationContext, GenerationMode, Generator, non_empty};

/// Offline generator: passes text through with minimal deterministic
/// shaping. Useful for dry runs and for exercising the pipeline without a
/// model.
#[derive(Debug, Clone, Default)]
pub struct NoopGenerator;

#[async_trait]
impl Generator for NoopGenerator {
    fn name(&self) -> &str {
        "noop"
    }

    async fn generate(
        &self,
        mode: GenerationMode,
        input: &str,
        context: &GenerationContext,
    ) -> Result<String, AdapterError> {
        let input = input.trim();
        let output = match mode {
            GenerationMode::Draft => match context.get(GenerationContext::TITLE) {
                Some(title) if !input.starts_with('#') => format!("# {title}\n\n{input}"),
                _ => input.to_owned(),
            },
            GenerationMode::Spin => input.to_owned(),
            GenerationMode::Review => {
                format!("Verdict: accept\nScore: 7\n{BEGIN_REVISED}\n{input}\n{END_REVISED}\n")
            }
            GenerationMode::Summarize => first_sentence(input, 200),
        };
        non_empty(output)
    }
}

fn first_sentence(text: &str, max_chars: usize) -> String {
    let body = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .unwrap_or_default();
    let end = body
        .find(['.', '!', '?'])
        .map(|idx| idx + 1)
        .unwrap_or(body.len());
    body[..end].chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::critique::{self, Verdict};

    #[tokio::test]
    async fn review_output_parses_as_accept() -> anyhow::Result<()> {
        let out = NoopGenerator
            .generate(GenerationMode::Review, "Body.", &GenerationContext::new())
            .await?;
        let critique = critique::parse(&out)?;
        assert_eq!(critique.verdict, Verdict::Accept);
        assert_eq!(critique.revised_content.as_deref(), Some("Body."));
        Ok(())
    }

    #[tokio::test]
    async fn draft_adds_title_heading_and_summary_takes_first_sentence() -> anyhow::Result<()> {
        let ctx = GenerationContext::new().with(GenerationContext::TITLE, "Gates");
        let draft = NoopGenerator
            .generate(GenerationMode::Draft, "Once upon a time. Then more.", &ctx)
            .await?;
        assert_eq!(draft, "# Gates\n\nOnce upon a time. Then more.");

        let summary = NoopGenerator
            .generate(GenerationMode::Summarize, &draft, &ctx)
            .await?;
        assert_eq!(summary, "Once upon a time.");
        Ok(())
    }

    #[tokio::test]
    async fn empty_input_is_bad_output() {
        let err = NoopGenerator
            .generate(GenerationMode::Spin, "  ", &GenerationContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::BadOutput(_)));
    }
}
