use serde::{Deserialize, Serialize};

use super::AdapterError;

pub const BEGIN_REVISED: &str = "---BEGIN REVISED CONTENT---";
pub const END_REVISED: &str = "---END REVISED CONTENT---";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Revise,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Revise => "revise",
        }
    }
}

/// Structured result of a `review` generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Critique {
    pub verdict: Verdict,
    pub score: Option<u8>,
    pub suggestions: Vec<String>,
    pub revised_content: Option<String>,
}

impl Critique {
    /// Suggestions as one instruction block for a re-spin.
    pub fn revision_notes(&self) -> Option<String> {
        if self.suggestions.is_empty() {
            return None;
        }
        Some(
            self.suggestions
                .iter()
                .map(|s| format!("- {s}"))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

/// Parses reviewer output of the form
///
/// ```text
/// Verdict: accept | revise
/// Score: 8
/// Suggestions:
/// - ...
/// ---BEGIN REVISED CONTENT---
/// ...
/// ---END REVISED CONTENT---
/// ```
///
/// The verdict defaults to accept when only a revised block is present.
pub fn parse(output: &str) -> Result<Critique, AdapterError> {
    if output.trim().is_empty() {
        return Err(AdapterError::BadOutput("empty critique".to_owned()));
    }

    let (revised_content, rest) = split_revised_block(output);

    let mut verdict = None;
    let mut score = None;
    let mut suggestions = Vec::new();
    let mut in_suggestions = false;

    for line in rest.lines() {
        let trimmed = line.trim();
        if let Some(value) = field(trimmed, "verdict") {
            in_suggestions = false;
            verdict = Some(parse_verdict(value)?);
            continue;
        }
        if let Some(value) = field(trimmed, "score") {
            in_suggestions = false;
            score = parse_score(value);
            continue;
        }
        if let Some(value) = field(trimmed, "suggestions") {
            in_suggestions = true;
            if !value.is_empty() {
                suggestions.push(value.to_owned());
            }
            continue;
        }
        if in_suggestions {
            if trimmed.is_empty() {
                in_suggestions = false;
                continue;
            }
            let item = strip_list_marker(trimmed);
            if !item.is_empty() {
                suggestions.push(item.to_owned());
            }
        }
    }

    let verdict = match (verdict, &revised_content) {
        (Some(verdict), _) => verdict,
        (None, Some(_)) => Verdict::Accept,
        (None, None) => {
            return Err(AdapterError::BadOutput(
                "critique has neither a verdict nor revised content".to_owned(),
            ));
        }
    };

    Ok(Critique {
        verdict,
        score,
        suggestions,
        revised_content,
    })
}

fn split_revised_block(output: &str) -> (Option<String>, String) {
    let Some(begin) = output.find(BEGIN_REVISED) else {
        return (None, output.to_owned());
    };
    let body_start = begin + BEGIN_REVISED.len();
    let Some(end_rel) = output[body_start..].find(END_REVISED) else {
        return (None, output.to_owned());
    };
    let end = body_start + end_rel;

    let revised = output[body_start..end].trim();
    let rest = format!("{}{}", &output[..begin], &output[end + END_REVISED.len()..]);
    let revised = (!revised.is_empty()).then(|| revised.to_owned());
    (revised, rest)
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let line = line.trim_start_matches(['*', '#', ' ']);
    let (key, value) = line.split_once(':')?;
    let key = key.trim().trim_matches('*');
    if key.eq_ignore_ascii_case(name) {
        Some(value.trim().trim_matches('*').trim())
    } else {
        None
    }
}

fn parse_verdict(value: &str) -> Result<Verdict, AdapterError> {
    let word = value
        .split(|c: char| !c.is_ascii_alphabetic())
        .find(|w| !w.is_empty())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match word.as_str() {
        "accept" | "accepted" | "approve" | "approved" => Ok(Verdict::Accept),
        "revise" | "revision" | "reject" | "rejected" => Ok(Verdict::Revise),
        _ => Err(AdapterError::BadOutput(format!(
            "unrecognized critique verdict: {value}"
        ))),
    }
}

fn parse_score(value: &str) -> Option<u8> {
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<u8>().ok()
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim_start_matches(['-', '*', '•']).trim_start();
    let numbered = line
        .split_once(['.', ')'])
        .filter(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
    match numbered {
        Some((_, rest)) => rest.trim_start(),
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_critique() {
        let output = "Verdict: revise\n\
Score: 6/10\n\
Suggestions:\n\
- Tighten the opening\n\
2. Keep the sea imagery\n\
\n\
---BEGIN REVISED CONTENT---\n\
The tide came in.\n\
---END REVISED CONTENT---\n";

        let critique = parse(output).unwrap();
        assert_eq!(critique.verdict, Verdict::Revise);
        assert_eq!(critique.score, Some(6));
        assert_eq!(
            critique.suggestions,
            vec!["Tighten the opening", "Keep the sea imagery"]
        );
        assert_eq!(critique.revised_content.as_deref(), Some("The tide came in."));
        assert_eq!(
            critique.revision_notes().as_deref(),
            Some("- Tighten the opening\n- Keep the sea imagery")
        );
    }

    #[test]
    fn revised_block_alone_means_accept() {
        let critique = parse(&format!("{BEGIN_REVISED}\nBody\n{END_REVISED}")).unwrap();
        assert_eq!(critique.verdict, Verdict::Accept);
        assert_eq!(critique.score, None);
    }

    #[test]
    fn markdown_bold_fields_are_accepted() {
        let critique = parse("**Verdict:** Accept.\n**Score:** 9").unwrap();
        assert_eq!(critique.verdict, Verdict::Accept);
        assert_eq!(critique.score, Some(9));
        assert_eq!(critique.revised_content, None);
    }

    #[test]
    fn prose_without_verdict_is_bad_output() {
        let err = parse("Looks great to me overall.").unwrap_err();
        assert!(matches!(err, AdapterError::BadOutput(_)));
        assert!(matches!(parse("   "), Err(AdapterError::BadOutput(_))));
        assert!(matches!(
            parse("Verdict: maybe"),
            Err(AdapterError::BadOutput(_))
        ));
    }
}
