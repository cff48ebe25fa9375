//! Per-question source selection.
//!
//! [`decide`] is a pure function of retrieval confidence, web-search
//! availability and whether the question looks time-sensitive. Each question
//! gets exactly one terminal [`RouteDecision`]; nothing is retried.
//!
//! | Time-sensitive & web | Top score ≥ confident | Any hits | Web | Decision |
//! |----------------------|-----------------------|----------|-----|----------|
//! | yes | – | yes | yes | `Both` |
//! | yes | – | no | yes | `WebOnly` |
//! | no | yes | yes | – | `CourseOnly` |
//! | no | no | yes | yes | `Both` |
//! | no | no | yes | no | `CourseOnly` |
//! | no | – | no | yes | `WebOnly` |
//! | no | – | no | no | `Decline` |

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::generation::{Generator, Prompt};

/// Fixed answer for [`RouteDecision::Decline`]; no generator call is made.
pub const DECLINE_ANSWER: &str =
    "I don't have enough information in the course materials to answer that question.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    CourseOnly,
    WebOnly,
    Both,
    Decline,
}

impl RouteDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteDecision::CourseOnly => "course_only",
            RouteDecision::WebOnly => "web_only",
            RouteDecision::Both => "both",
            RouteDecision::Decline => "decline",
        }
    }

    pub fn uses_course(&self) -> bool {
        matches!(self, RouteDecision::CourseOnly | RouteDecision::Both)
    }

    pub fn uses_web(&self) -> bool {
        matches!(self, RouteDecision::WebOnly | RouteDecision::Both)
    }
}

/// A decision plus a human-readable reason, stored on the assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub decision: RouteDecision,
    pub rationale: String,
}

/// Everything [`decide`] looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteSignals {
    /// Best retrieval score, `None` when retrieval returned nothing.
    pub top_score: Option<f32>,
    /// Candidates that passed `min_score`.
    pub hits: usize,
    pub confident_score: f32,
    pub web_available: bool,
    pub time_sensitive: bool,
}

pub fn decide(signals: &RouteSignals) -> Route {
    let has_hits = signals.hits > 0;
    let (decision, rationale) = if signals.time_sensitive && signals.web_available {
        if has_hits {
            (
                RouteDecision::Both,
                "time-sensitive question; combining course material with web results".to_string(),
            )
        } else {
            (
                RouteDecision::WebOnly,
                "time-sensitive question and no course material matched".to_string(),
            )
        }
    } else {
        match signals.top_score {
            Some(top) if has_hits && top >= signals.confident_score => (
                RouteDecision::CourseOnly,
                format!(
                    "confident course match (top score {:.3} >= {:.3})",
                    top, signals.confident_score
                ),
            ),
            Some(top) if has_hits && signals.web_available => (
                RouteDecision::Both,
                format!(
                    "weak course match (top score {:.3} < {:.3}); adding web results",
                    top, signals.confident_score
                ),
            ),
            Some(top) if has_hits => (
                RouteDecision::CourseOnly,
                format!(
                    "weak course match (top score {:.3}); web search unavailable",
                    top
                ),
            ),
            _ if signals.web_available => (
                RouteDecision::WebOnly,
                "no course material matched; using web search".to_string(),
            ),
            _ => (
                RouteDecision::Decline,
                "no course material matched and web search unavailable".to_string(),
            ),
        }
    };
    Route {
        decision,
        rationale,
    }
}

fn time_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    // "current" on its own is common course vocabulary (electric current,
    // current node), so only the unambiguous forms count.
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?ix)
            \b(
                today | tonight | yesterday | tomorrow
              | latest | newest | breaking
              | news | headlines?
              | recent(ly)? | lately
              | currently | current\s+(events?|affairs|news|version|release|president|prime\s+minister)
              | right\s+now | as\s+of\s+now | nowadays
              | this\s+(year|month|week|season)
              | up[\s-]to[\s-]date
              | (stock|share)\s+price | weather | forecast
              | 20[2-9][0-9]
            )\b",
        )
        .ok()
    })
    .as_ref()
}

/// Keyword heuristic for questions about current events.
pub fn is_time_sensitive(question: &str) -> bool {
    time_pattern().is_some_and(|re| re.is_match(question))
}

const CLASSIFIER_SYSTEM: &str = "You classify student questions. Answer with exactly one word: \
yes if answering correctly requires up-to-date information from after your training data \
(news, recent releases, today's date, live prices), otherwise no.";

/// Ask the generator whether `question` needs current information.
/// Any failure or unparseable reply falls back to [`is_time_sensitive`].
pub async fn classify_time_sensitive(generator: &dyn Generator, question: &str) -> bool {
    let today = chrono::Utc::now().format("%Y-%m-%d");
    let prompt = Prompt::single(
        CLASSIFIER_SYSTEM,
        format!("Today is {}.\nQuestion: {}", today, question),
    );
    match generator.generate(&prompt, None).await {
        Ok(reply) => match parse_yes_no(&reply) {
            Some(answer) => {
                debug!(answer, "route classifier");
                answer
            }
            None => {
                warn!(reply = %reply, "route classifier reply not yes/no; using keyword heuristic");
                is_time_sensitive(question)
            }
        },
        Err(e) => {
            warn!(error = %e, "route classifier failed; using keyword heuristic");
            is_time_sensitive(question)
        }
    }
}

fn parse_yes_no(reply: &str) -> Option<bool> {
    let word = reply
        .trim()
        .trim_matches(|c: char| !c.is_ascii_alphabetic())
        .to_ascii_lowercase();
    match word.split_whitespace().next()? {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}
