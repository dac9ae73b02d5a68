use serenity::builder::{CreateActionRow, CreateButton};
use serenity::model::application::ButtonStyle;
use std::collections::HashSet;

pub const FEEDBACK_SOLVED_ID: &str = "support_solved";
pub const FEEDBACK_NOT_SOLVED_ID: &str = "support_not_solved";

/// The two-button row attached under every automated answer.
pub fn feedback_buttons() -> CreateActionRow {
    CreateActionRow::Buttons(vec![
        CreateButton::new(FEEDBACK_SOLVED_ID)
            .label("✅ This solved it")
            .style(ButtonStyle::Success),
        CreateButton::new(FEEDBACK_NOT_SOLVED_ID)
            .label("❌ Still need help")
            .style(ButtonStyle::Danger),
    ])
}

/// Same row greyed out, swapped in once a verdict lands so the buttons
/// cannot be pressed twice.
pub fn disabled_feedback_buttons() -> CreateActionRow {
    CreateActionRow::Buttons(vec![
        CreateButton::new(FEEDBACK_SOLVED_ID)
            .label("✅ This solved it")
            .style(ButtonStyle::Success)
            .disabled(true),
        CreateButton::new(FEEDBACK_NOT_SOLVED_ID)
            .label("❌ Still need help")
            .style(ButtonStyle::Danger)
            .disabled(true),
    ])
}

/// What the delayed probe concluded about a user's follow-up message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SatisfactionVerdict {
    pub satisfied: bool,
    pub wants_human: bool,
    pub is_followup: bool,
    /// 10..=100; 40 means no signal words were found at all.
    pub confidence: u8,
    pub score: i32,
}

impl SatisfactionVerdict {
    /// Strong enough to skip the retry path and close directly.
    pub fn strongly_satisfied(&self) -> bool {
        self.satisfied && self.score >= 4
    }
}

const POSITIVE: &[&str] = &[
    "thanks", "thank you", "fixed", "resolved", "works now", "great", "appreciate",
];
const NEGATIVE: &[&str] = &[
    "not working", "still", "doesn't", "broken", "issue", "problem", "help", "wtf", "no",
    "not fixed",
];
const HUMAN: &[&str] = &["human", "agent", "support", "escalate", "talk to", "someone"];
const FOLLOWUP: &[&str] = &[
    "when", "where", "how", "what", "why", "because", "tried", "error", "says",
];

/// Word tokens with apostrophes kept intact, so "doesn't" stays one token
/// and "no" never matches inside "now".
fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

fn count_hits(text: &str, words: &HashSet<String>, list: &[&str]) -> i32 {
    list.iter()
        .filter(|term| {
            if term.contains(' ') {
                text.contains(*term)
            } else {
                words.contains(**term)
            }
        })
        .count() as i32
}

/// Keyword-scored read of a follow-up message. Positive signals add two,
/// negative signals subtract two; everything else hangs off the score.
pub fn analyze_message(message: &str) -> SatisfactionVerdict {
    let text = message.to_lowercase();
    let words = tokens(&text);

    let positive = count_hits(&text, &words, POSITIVE);
    let negative = count_hits(&text, &words, NEGATIVE);
    let score = 2 * positive - 2 * negative;

    let wants_human = count_hits(&text, &words, HUMAN) > 0 || score < 0;
    let has_followup_marker =
        text.contains('?') || count_hits(&text, &words, FOLLOWUP) > 0;
    let is_followup = has_followup_marker && message.len() > 20 && score < 4;

    // Offsetting hits net out to zero and carry no more signal than silence.
    let confidence = if score != 0 {
        (60 + 10 * score).clamp(10, 100) as u8
    } else {
        40
    };

    SatisfactionVerdict {
        satisfied: score > 0,
        wants_human,
        is_followup,
        confidence,
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_thanks_is_strongly_satisfied() {
        let v = analyze_message("Thanks, fixed now!");
        assert!(v.satisfied);
        assert!(v.strongly_satisfied());
        assert!(!v.wants_human);
        assert!(!v.is_followup);
        assert_eq!(v.score, 4);
        assert_eq!(v.confidence, 100);
    }

    #[test]
    fn test_no_does_not_match_inside_now() {
        let v = analyze_message("works now");
        assert_eq!(v.score, 2);
        assert!(v.satisfied);
    }

    #[test]
    fn test_negative_message_wants_human() {
        let v = analyze_message("It's still broken, this is a real problem");
        assert!(!v.satisfied);
        assert!(v.wants_human);
        assert!(v.score < 0);
        assert_eq!(v.confidence, 10);
    }

    #[test]
    fn test_explicit_human_request_overrides_neutral_score() {
        let v = analyze_message("Can I talk to a real person about this please");
        assert!(v.wants_human);
    }

    #[test]
    fn test_question_long_enough_is_a_followup() {
        let v = analyze_message("What about the settings panel, where is the export option?");
        assert!(v.is_followup);
        assert!(!v.satisfied);
    }

    #[test]
    fn test_short_question_is_not_a_followup() {
        let v = analyze_message("why though?");
        assert!(!v.is_followup);
    }

    #[test]
    fn test_strong_satisfaction_suppresses_followup() {
        let v = analyze_message("Thanks, that fixed it! How great is that, resolved?");
        assert!(v.score >= 4);
        assert!(!v.is_followup);
    }

    #[test]
    fn test_neutral_message_has_low_confidence() {
        let v = analyze_message("I went outside for a walk");
        assert_eq!(v.score, 0);
        assert!(!v.satisfied);
        assert_eq!(v.confidence, 40);
    }

    #[test]
    fn test_offsetting_signals_read_as_neutral() {
        // "thanks" (+2) against "still" (-2): net zero, same confidence as
        // a message with no signal at all.
        let v = analyze_message("thanks but it is still doing it");
        assert_eq!(v.score, 0);
        assert!(!v.satisfied);
        assert_eq!(v.confidence, 40);
    }

    #[test]
    fn test_doesnt_counts_as_negative() {
        let v = analyze_message("it doesn't start anymore");
        assert!(v.score < 0);
    }
}
