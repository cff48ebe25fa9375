//! Prompt assembly: system instructions, discipline guidelines, bounded
//! history and the tagged context block.

use std::fmt::Write as _;
use std::str::FromStr;

use crate::config::CourseConfig;
use crate::generation::{Prompt, PromptTurn};
use crate::models::{ReferenceTarget, Turn};
use crate::references::{strip_markers, CitableSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    Math,
    Programming,
    Engineering,
    Humanities,
}

impl Discipline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Discipline::Math => "math",
            Discipline::Programming => "programming",
            Discipline::Engineering => "engineering",
            Discipline::Humanities => "humanities",
        }
    }

    pub fn guidelines(&self) -> &'static str {
        match self {
            Discipline::Math => {
                "For mathematics courses:\n\
                 - Show step-by-step problem-solving approaches\n\
                 - Explain mathematical concepts with clear notation\n\
                 - Use concrete examples to illustrate abstract concepts\n\
                 - Encourage students to verify answers and check their work\n\
                 - Offer practice problems that are similar but not identical"
            }
            Discipline::Programming => {
                "For programming courses:\n\
                 - Explain the logic behind code, not just its syntax\n\
                 - Teach design patterns and good practice\n\
                 - Explain the thinking process instead of handing out solutions\n\
                 - Encourage debugging strategies and testing\n\
                 - Relate concepts to real-world software engineering"
            }
            Discipline::Engineering => {
                "For engineering courses:\n\
                 - Connect theory to practical applications\n\
                 - Encourage system-level thinking and analysis\n\
                 - Describe diagrams or visual explanations when helpful\n\
                 - Point out safety considerations and ethical implications\n\
                 - Relate mathematical models to physical intuition"
            }
            Discipline::Humanities => {
                "For humanities courses:\n\
                 - Help students develop critical thinking and analysis\n\
                 - Encourage examining multiple perspectives\n\
                 - Help structure arguments and support claims with evidence\n\
                 - Guide the analysis of texts and their key themes\n\
                 - Help students develop their own interpretations"
            }
        }
    }
}

impl FromStr for Discipline {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "math" | "mathematics" => Ok(Discipline::Math),
            "programming" | "cs" | "computer science" => Ok(Discipline::Programming),
            "engineering" => Ok(Discipline::Engineering),
            "humanities" => Ok(Discipline::Humanities),
            other => Err(format!("unknown discipline: {other}")),
        }
    }
}

/// Resolution order: explicit hint, course config, course-id prefix.
/// Unrecognized names are skipped.
pub fn resolve_discipline(
    hint: Option<&str>,
    course: Option<&CourseConfig>,
    course_id: &str,
) -> Option<Discipline> {
    if let Some(d) = hint.and_then(|h| h.parse().ok()) {
        return Some(d);
    }
    if let Some(d) = course
        .and_then(|c| c.discipline.as_deref())
        .and_then(|d| d.parse().ok())
    {
        return Some(d);
    }
    let upper = course_id.to_ascii_uppercase();
    ["CS", "15-", "17-", "18-"]
        .iter()
        .any(|p| upper.starts_with(p))
        .then_some(Discipline::Programming)
}

/// The last `max_turns` turns, then trimmed from the oldest end until their
/// combined content fits in `max_chars`.
pub fn select_history(turns: &[Turn], max_turns: usize, max_chars: usize) -> Vec<PromptTurn> {
    let start = turns.len().saturating_sub(max_turns);
    let mut selected: Vec<PromptTurn> = turns[start..]
        .iter()
        .map(|t| PromptTurn {
            role: t.role,
            content: strip_markers(&t.content),
        })
        .collect();
    let mut total: usize = selected.iter().map(|t| t.content.chars().count()).sum();
    let mut drop = 0;
    while total > max_chars && drop < selected.len() {
        total -= selected[drop].content.chars().count();
        drop += 1;
    }
    selected.drain(..drop);
    selected
}

/// Inputs to [`build`].
pub struct PromptInput<'a> {
    pub course_id: &'a str,
    pub question: &'a str,
    pub discipline: Option<Discipline>,
    pub instructions: Option<&'a str>,
    pub sources: &'a [CitableSource],
    pub history: Vec<PromptTurn>,
    pub has_image: bool,
    /// `YYYY-MM-DD`, included so the model can reason about recency.
    pub today: String,
}

pub fn system_prompt(input: &PromptInput<'_>) -> String {
    let mut s = format!(
        "You are Ellie, an AI teaching assistant for the course {}.\n\
         Today's date is {}.\n\n\
         Answer the student's question using the numbered sources supplied with it. \
         Prefer course material over web results. \
         Cite every statement that relies on a source inline with its tag exactly as given, for example [ref1]. \
         Only use tags that appear in the sources. \
         If the sources do not contain the answer, say so honestly and give general guidance instead. \
         If the student is asking for help on an assignment, guide them through the reasoning \
         without solving the problem for them.",
        input.course_id, input.today
    );
    if input.has_image {
        s.push_str(" The student attached an image; take it into account.");
    }
    if let Some(d) = input.discipline {
        let _ = write!(s, "\n\nGuidelines for this course type:\n{}", d.guidelines());
    }
    if let Some(extra) = input.instructions.filter(|i| !i.trim().is_empty()) {
        let _ = write!(s, "\n\nCourse instructions:\n{}", extra.trim());
    }
    s
}

/// The user message: tagged sources followed by the question.
pub fn context_block(sources: &[CitableSource], question: &str) -> String {
    let mut out = String::new();
    let (course, web): (Vec<&CitableSource>, Vec<&CitableSource>) = sources
        .iter()
        .partition(|s| matches!(s.reference.target, ReferenceTarget::Chunk { .. }));

    if !course.is_empty() {
        out.push_str("Course materials:\n");
        for s in course {
            let r = &s.reference;
            let mut label = r.source.clone();
            if let Some(p) = r.page_or_slide() {
                let _ = write!(label, ", page {p}");
            }
            if let Some(t) = &r.title {
                let _ = write!(label, ", {t}");
            }
            let _ = writeln!(out, "[{}] ({})\n{}\n", r.id, label, s.text.trim());
        }
    }
    if !web.is_empty() {
        out.push_str("Web results:\n");
        for s in web {
            let r = &s.reference;
            let url = match &r.target {
                ReferenceTarget::Web { url } => url.as_str(),
                ReferenceTarget::Chunk { .. } => "",
            };
            let title = r.title.as_deref().unwrap_or(&r.source);
            let _ = writeln!(out, "[{}] {} ({})\n{}\n", r.id, title, url, s.text.trim());
        }
    }
    if sources.is_empty() {
        out.push_str("No sources are available for this question.\n\n");
    }
    let _ = write!(out, "Question: {}", question.trim());
    out
}

pub fn build(input: PromptInput<'_>) -> Prompt {
    Prompt {
        system: system_prompt(&input),
        user: context_block(input.sources, input.question),
        history: input.history,
    }
}
