//! Gate D: reading confirmation by comprehension challenge.
//!
//! One fact of the notice is masked and the accessor retypes it. The
//! challenge is persisted so reloading shows the same fact, and every
//! update is a compare-and-swap on the whole challenge.

use herald_core::{
    random_bytes, ComprehensionChallenge, GateRepository, MaskedFact, NoticeContent, NoticeId,
    Timestamp,
};
use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};
use crate::normalize::{date_matches, extract_digits, normalize_text};

pub const DEFAULT_COMPREHENSION_ATTEMPTS: u32 = 3;

/// Retries when a concurrent answer changed the challenge under us.
const SWAP_RETRIES: usize = 5;

/// What the accessor is shown. The masked value only reveals its shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengePrompt {
    pub fact: MaskedFact,
    pub question: String,
    pub masked: String,
    pub attempts_remaining: u32,
    pub locked: bool,
    pub passed: bool,
}

impl ChallengePrompt {
    pub fn render(challenge: &ComprehensionChallenge, content: &NoticeContent) -> Self {
        let question = match challenge.fact {
            MaskedFact::SanctionType => "Type the sanction applied in this notice",
            MaskedFact::SanctionDuration => "Type the number of days of the sanction",
            MaskedFact::IncidentDate => "Type the date of the incident",
        };
        Self {
            fact: challenge.fact,
            question: question.to_string(),
            masked: mask(content, challenge.fact),
            attempts_remaining: challenge.max_attempts.saturating_sub(challenge.attempts),
            locked: challenge.is_locked(),
            passed: challenge.passed_at.is_some(),
        }
    }
}

fn mask(content: &NoticeContent, fact: MaskedFact) -> String {
    match fact {
        MaskedFact::SanctionType => content
            .sanction_type
            .chars()
            .enumerate()
            .map(|(i, c)| {
                if i == 0 || c.is_whitespace() {
                    c
                } else {
                    '*'
                }
            })
            .collect(),
        MaskedFact::SanctionDuration => "*".repeat(content.sanction_days.to_string().len()),
        MaskedFact::IncidentDate => "**/**/****".to_string(),
    }
}

/// Pick the fact to mask. A sanction without a duration never asks for one.
pub fn pick_fact(content: &NoticeContent) -> MaskedFact {
    let facts: &[MaskedFact] = if content.sanction_days == 0 {
        &[MaskedFact::SanctionType, MaskedFact::IncidentDate]
    } else {
        &[
            MaskedFact::SanctionType,
            MaskedFact::SanctionDuration,
            MaskedFact::IncidentDate,
        ]
    };
    let [roll] = random_bytes::<1>();
    facts[roll as usize % facts.len()]
}

pub fn answer_matches(content: &NoticeContent, fact: MaskedFact, answer: &str) -> bool {
    match fact {
        MaskedFact::SanctionType => {
            let given = normalize_text(answer);
            !given.is_empty() && given == normalize_text(&content.sanction_type)
        }
        MaskedFact::SanctionDuration => {
            let given = extract_digits(answer);
            !given.is_empty()
                && given.trim_start_matches('0') == content.sanction_days.to_string()
        }
        MaskedFact::IncidentDate => date_matches(content.incident_date, answer),
    }
}

/// Load the notice's challenge, creating it on first request.
pub fn load_or_issue(
    gates: &dyn GateRepository,
    notice_id: &NoticeId,
    content: &NoticeContent,
    max_attempts: u32,
    now: Timestamp,
) -> GateResult<ComprehensionChallenge> {
    if let Some(existing) = gates.get_challenge(notice_id)? {
        return Ok(existing);
    }
    let fresh = ComprehensionChallenge {
        notice_id: notice_id.clone(),
        fact: pick_fact(content),
        issued_at: now,
        attempts: 0,
        max_attempts,
        locked_at: None,
        passed_at: None,
        resets: 0,
    };
    if gates.swap_challenge(None, &fresh)? {
        return Ok(fresh);
    }
    gates.get_challenge(notice_id)?.ok_or(GateError::Internal)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Passed { at: Timestamp },
    AlreadyPassed { at: Timestamp },
}

/// Check an answer. A pass is immutable; reaching the ceiling locks the
/// challenge until an administrator resets it, whatever is typed later.
pub fn submit_answer(
    gates: &dyn GateRepository,
    notice_id: &NoticeId,
    content: &NoticeContent,
    answer: &str,
    now: Timestamp,
) -> GateResult<AnswerOutcome> {
    if answer.trim().is_empty() {
        return Err(GateError::InvalidInput);
    }

    for _ in 0..SWAP_RETRIES {
        let current = gates.get_challenge(notice_id)?.ok_or(GateError::OutOfOrder)?;
        if let Some(at) = current.passed_at {
            return Ok(AnswerOutcome::AlreadyPassed { at });
        }
        if current.is_locked() {
            return Err(GateError::ChallengeLocked);
        }

        let mut next = current.clone();
        let matched = answer_matches(content, current.fact, answer);
        if matched {
            next.passed_at = Some(now);
        } else {
            next.attempts += 1;
            if next.attempts >= next.max_attempts {
                next.locked_at = Some(now);
            }
        }

        if !gates.swap_challenge(Some(&current), &next)? {
            continue;
        }
        if matched {
            return Ok(AnswerOutcome::Passed { at: now });
        }
        if next.is_locked() {
            tracing::warn!(notice_id = %notice_id, "comprehension challenge locked");
            return Err(GateError::ChallengeLocked);
        }
        return Err(GateError::ChallengeMismatch {
            remaining: next.max_attempts.saturating_sub(next.attempts),
        });
    }
    Err(GateError::Internal)
}

/// Manual override: unlock a locked challenge with a fresh attempt budget.
pub fn reset_challenge(
    gates: &dyn GateRepository,
    notice_id: &NoticeId,
    now: Timestamp,
) -> GateResult<ComprehensionChallenge> {
    for _ in 0..SWAP_RETRIES {
        let current = gates.get_challenge(notice_id)?.ok_or(GateError::NotFound)?;
        if !current.is_locked() {
            return Err(GateError::NotRequired);
        }
        let next = ComprehensionChallenge {
            attempts: 0,
            locked_at: None,
            issued_at: now,
            resets: current.resets + 1,
            ..current.clone()
        };
        if gates.swap_challenge(Some(&current), &next)? {
            return Ok(next);
        }
    }
    Err(GateError::Internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_content;
    use herald_store::MemoryStore;

    fn seeded(store: &MemoryStore, fact: MaskedFact, max_attempts: u32) -> NoticeId {
        let id = NoticeId::new("n-1");
        store
            .swap_challenge(
                None,
                &ComprehensionChallenge {
                    notice_id: id.clone(),
                    fact,
                    issued_at: Timestamp::from_seconds(1),
                    attempts: 0,
                    max_attempts,
                    locked_at: None,
                    passed_at: None,
                    resets: 0,
                },
            )
            .unwrap();
        id
    }

    #[test]
    fn test_answers_are_normalized() {
        let content = sample_content();
        assert!(answer_matches(&content, MaskedFact::SanctionType, " SUSPENSION "));
        assert!(answer_matches(&content, MaskedFact::SanctionType, "suspensión"));
        assert!(!answer_matches(&content, MaskedFact::SanctionType, "despido"));
        assert!(answer_matches(&content, MaskedFact::SanctionDuration, "3 días"));
        assert!(answer_matches(&content, MaskedFact::SanctionDuration, "03"));
        assert!(!answer_matches(&content, MaskedFact::SanctionDuration, "tres"));
        assert!(answer_matches(&content, MaskedFact::IncidentDate, "14/03/2026"));
        assert!(answer_matches(&content, MaskedFact::IncidentDate, "2026-03-14"));
    }

    #[test]
    fn test_prompt_masks_the_fact() {
        let content = sample_content();
        let challenge = ComprehensionChallenge {
            notice_id: NoticeId::new("n-1"),
            fact: MaskedFact::SanctionType,
            issued_at: Timestamp::from_seconds(1),
            attempts: 1,
            max_attempts: 3,
            locked_at: None,
            passed_at: None,
            resets: 0,
        };
        let prompt = ChallengePrompt::render(&challenge, &content);
        assert_eq!(prompt.masked, "S*********");
        assert_eq!(prompt.attempts_remaining, 2);
        assert!(!prompt.masked.contains("uspens"));
    }

    #[test]
    fn test_fact_choice_skips_missing_duration() {
        let mut content = sample_content();
        content.sanction_days = 0;
        for _ in 0..50 {
            assert_ne!(pick_fact(&content), MaskedFact::SanctionDuration);
        }
    }

    #[test]
    fn test_challenge_is_stable_across_loads() {
        let store = MemoryStore::new();
        let content = sample_content();
        let id = NoticeId::new("n-1");
        let first = load_or_issue(&store, &id, &content, 3, Timestamp::from_seconds(1)).unwrap();
        let again = load_or_issue(&store, &id, &content, 3, Timestamp::from_seconds(99)).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_pass_is_immutable() {
        let store = MemoryStore::new();
        let content = sample_content();
        let id = seeded(&store, MaskedFact::SanctionDuration, 3);
        let at = Timestamp::from_seconds(10);
        assert_eq!(
            submit_answer(&store, &id, &content, "3", at),
            Ok(AnswerOutcome::Passed { at })
        );
        assert_eq!(
            submit_answer(&store, &id, &content, "wrong", Timestamp::from_seconds(20)),
            Ok(AnswerOutcome::AlreadyPassed { at })
        );
    }

    #[test]
    fn test_lockout_after_three_and_admin_reset() {
        let store = MemoryStore::new();
        let content = sample_content();
        let id = seeded(&store, MaskedFact::IncidentDate, 3);
        let now = Timestamp::from_seconds(10);

        assert_eq!(
            submit_answer(&store, &id, &content, "01/01/2020", now),
            Err(GateError::ChallengeMismatch { remaining: 2 })
        );
        assert_eq!(
            submit_answer(&store, &id, &content, "02/01/2020", now),
            Err(GateError::ChallengeMismatch { remaining: 1 })
        );
        assert_eq!(
            submit_answer(&store, &id, &content, "03/01/2020", now),
            Err(GateError::ChallengeLocked)
        );
        assert_eq!(
            submit_answer(&store, &id, &content, "14/03/2026", now),
            Err(GateError::ChallengeLocked)
        );

        let reset = reset_challenge(&store, &id, Timestamp::from_seconds(50)).unwrap();
        assert_eq!(reset.resets, 1);
        assert_eq!(reset.attempts, 0);
        assert!(submit_answer(&store, &id, &content, "14/03/2026", Timestamp::from_seconds(60))
            .is_ok());
    }

    #[test]
    fn test_reset_of_unlocked_challenge_refused() {
        let store = MemoryStore::new();
        let id = seeded(&store, MaskedFact::SanctionType, 3);
        assert_eq!(
            reset_challenge(&store, &id, Timestamp::from_seconds(1)),
            Err(GateError::NotRequired)
        );
    }

    #[test]
    fn test_answer_without_challenge_is_out_of_order() {
        let store = MemoryStore::new();
        assert_eq!(
            submit_answer(
                &store,
                &NoticeId::new("n-9"),
                &sample_content(),
                "x",
                Timestamp::from_seconds(1)
            ),
            Err(GateError::OutOfOrder)
        );
    }
}
