use crate::config::ReentryConfig;
use crate::model::Phase;

/// Phase a rejected chapter re-enters: the reviewer's explicit choice, else
/// `DRAFTED` for structural feedback, else the configured default. An
/// explicit phase that is not `DRAFTED` or `SPUN` is ignored.
pub fn reentry_phase(
    explicit: Option<Phase>,
    feedback: Option<&str>,
    config: &ReentryConfig,
) -> Phase {
    if let Some(phase) = explicit
        && phase.is_reentry_target()
    {
        return phase;
    }
    if let Some(feedback) = feedback
        && is_structural(feedback, &config.structural_markers)
    {
        return Phase::Drafted;
    }
    config.default_phase
}

fn is_structural(feedback: &str, markers: &[String]) -> bool {
    let feedback = feedback.to_lowercase();
    markers
        .iter()
        .map(|m| m.trim().to_lowercase())
        .any(|m| !m.is_empty() && feedback.contains(&m))
}

/// Phase the next `advance` produces, or `None` when the chapter is ready for
/// human review.
pub fn next_target(current: Phase, reentry: Option<Phase>) -> Option<Phase> {
    if let Some(phase) = reentry {
        return Some(phase);
    }
    match current {
        Phase::Raw => Some(Phase::Drafted),
        Phase::Drafted => Some(Phase::Spun),
        Phase::Spun => Some(Phase::AiReviewed),
        _ => None,
    }
}

/// Splits summarizer output into a short list of themes.
pub fn parse_themes(summary: &str) -> Vec<String> {
    summary
        .split([',', '\n', ';'])
        .map(|t| t.trim().trim_start_matches(['-', '*', '•']).trim())
        .map(|t| t.trim_end_matches('.').trim())
        .filter(|t| !t.is_empty())
        .take(8)
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_phase_wins_then_markers_then_default() {
        let config = ReentryConfig::default();
        assert_eq!(
            reentry_phase(Some(Phase::Spun), Some("please restructure"), &config),
            Phase::Spun
        );
        assert_eq!(
            reentry_phase(None, Some("The OUTLINE needs work"), &config),
            Phase::Drafted
        );
        assert_eq!(reentry_phase(None, Some("tone is off"), &config), Phase::Spun);
        assert_eq!(reentry_phase(None, None, &config), Phase::Spun);

        let drafted_default = ReentryConfig {
            default_phase: Phase::Drafted,
            structural_markers: Vec::new(),
        };
        assert_eq!(reentry_phase(None, Some("outline"), &drafted_default), Phase::Drafted);
    }

    #[test]
    fn explicit_phase_outside_the_pipeline_falls_back() {
        let config = ReentryConfig::default();
        assert_eq!(reentry_phase(Some(Phase::Raw), None, &config), Phase::Spun);
        assert_eq!(
            reentry_phase(Some(Phase::AiReviewed), Some("restructure it"), &config),
            Phase::Drafted
        );
        assert_eq!(reentry_phase(Some(Phase::Finalized), None, &config), Phase::Spun);
    }

    #[test]
    fn next_target_follows_pipeline_unless_reentering() {
        assert_eq!(next_target(Phase::Raw, None), Some(Phase::Drafted));
        assert_eq!(next_target(Phase::Spun, None), Some(Phase::AiReviewed));
        assert_eq!(next_target(Phase::AiReviewed, None), None);
        assert_eq!(next_target(Phase::AiReviewed, Some(Phase::Spun)), Some(Phase::Spun));
    }

    #[test]
    fn themes_are_split_and_cleaned() {
        assert_eq!(
            parse_themes("- loss\n- memory, the sea.\n\n"),
            vec!["loss", "memory", "the sea"]
        );
    }
}
