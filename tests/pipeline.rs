//! End-to-end tests of the question-answering pipeline over a temp data dir.

mod common;

use std::sync::atomic::Ordering;

use common::{assistant, pdf_with_pages, snippet, ScriptedGenerator, StubWeb};
use ellie::error::AssistantError;
use ellie::generation::APOLOGY;
use ellie::models::{ImageInput, ReferenceTarget, Role, SourceFile};
use ellie::router::{RouteDecision, DECLINE_ANSWER};
use ellie::viewer::RenderedPage;
use ellie::Assistant;

const COURSE: &str = "TEST101";
const QUESTION: &str = "What is the capital of France?";

async fn with_france_pdf(a: &Assistant) -> String {
    let pdf = pdf_with_pages(&["The capital of France is Paris."]);
    let report = a
        .ingest(COURSE, vec![SourceFile::new("geography.pdf", pdf)])
        .await
        .unwrap();
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    report.added[0].doc_id.clone()
}

#[tokio::test]
async fn answers_from_course_material_with_page_citation() {
    let tmp = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::replying("The capital of France is Paris [ref1].");
    let a = assistant(tmp.path(), generator.clone(), None).await;
    let doc_id = with_france_pdf(&a).await;

    let answer = a.ask(COURSE, "u1", QUESTION).await.unwrap();

    assert_eq!(answer.answer, "The capital of France is Paris [ref1].");
    assert_eq!(answer.route.decision, RouteDecision::CourseOnly);
    assert_eq!(answer.references.len(), 1);
    let reference = &answer.references[0];
    assert_eq!(reference.id, "ref1");
    assert_eq!(reference.source, "geography.pdf");
    assert_eq!(reference.doc_id(), Some(doc_id.as_str()));
    assert_eq!(reference.page_or_slide(), Some(1));
    assert_eq!(generator.calls(), 1);

    let prompt = generator.last_prompt();
    assert!(prompt.user.contains("[ref1]"));
    assert!(prompt.user.contains("Paris"));
    assert!(prompt.system.contains(COURSE));
}

#[tokio::test]
async fn declines_without_calling_the_generator() {
    let tmp = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::replying("should not be used [ref1]");
    let a = assistant(tmp.path(), generator.clone(), None).await;
    with_france_pdf(&a).await;

    let answer = a
        .ask(COURSE, "u1", "Explain quantum chromodynamics gluons")
        .await
        .unwrap();

    assert_eq!(answer.answer, DECLINE_ANSWER);
    assert!(answer.references.is_empty());
    assert_eq!(answer.route.decision, RouteDecision::Decline);
    assert_eq!(generator.calls(), 0);

    // The declined exchange is still recorded.
    let history = a.get_history(COURSE, "u1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, DECLINE_ANSWER);
}

#[tokio::test]
async fn generation_failure_becomes_apology() {
    let tmp = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::failing();
    let a = assistant(tmp.path(), generator.clone(), None).await;
    with_france_pdf(&a).await;

    let answer = a.ask(COURSE, "u1", QUESTION).await.unwrap();

    assert_eq!(answer.answer, APOLOGY);
    assert!(answer.references.is_empty());
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn unsupplied_markers_are_not_resolved() {
    let tmp = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::replying("Paris [ref1], see also [ref9].");
    let a = assistant(tmp.path(), generator, None).await;
    with_france_pdf(&a).await;

    let answer = a.ask(COURSE, "u1", QUESTION).await.unwrap();

    let ids: Vec<_> = answer.references.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["ref1"]);
    assert!(answer.answer.contains("[ref9]"));
}

#[tokio::test]
async fn time_sensitive_question_uses_web_results() {
    let tmp = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::replying("The rover found rocks today [ref1].");
    let web = StubWeb::with(vec![snippet(
        "Rover update",
        "https://www.nasa.gov/news/rover",
        "The rover found rocks.",
    )]);
    let a = assistant(tmp.path(), generator.clone(), Some(web.clone())).await;

    let answer = a
        .ask(COURSE, "u1", "What is the latest news about the Mars rover?")
        .await
        .unwrap();

    assert_eq!(answer.route.decision, RouteDecision::WebOnly);
    assert_eq!(web.calls.load(Ordering::SeqCst), 1);
    assert_eq!(answer.references.len(), 1);
    let reference = &answer.references[0];
    assert_eq!(reference.source, "www.nasa.gov");
    assert_eq!(reference.title.as_deref(), Some("Rover update"));
    assert!(matches!(
        &reference.target,
        ReferenceTarget::Web { url } if url == "https://www.nasa.gov/news/rover"
    ));
    assert!(generator.last_prompt().user.contains("Web results:"));
}

#[tokio::test]
async fn failed_web_search_falls_back_to_course_material() {
    let tmp = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::replying("Paris [ref1].");
    let web = StubWeb::failing();
    let a = assistant(tmp.path(), generator.clone(), Some(web.clone())).await;
    with_france_pdf(&a).await;

    let answer = a
        .ask(COURSE, "u1", "What is the latest news about the capital of France?")
        .await
        .unwrap();

    assert_eq!(web.calls.load(Ordering::SeqCst), 1);
    assert_eq!(answer.route.decision, RouteDecision::CourseOnly);
    assert_eq!(answer.references.len(), 1);
    assert!(!generator.last_prompt().user.contains("Web results:"));
}

#[tokio::test]
async fn failed_web_search_with_no_course_hits_declines() {
    let tmp = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::replying("unused");
    let a = assistant(tmp.path(), generator.clone(), Some(StubWeb::failing())).await;

    let answer = a
        .ask(COURSE, "u1", "What is the weather forecast for tomorrow?")
        .await
        .unwrap();

    assert_eq!(answer.route.decision, RouteDecision::Decline);
    assert_eq!(answer.answer, DECLINE_ANSWER);
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn image_is_passed_to_the_generator() {
    let tmp = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::replying("Paris [ref1].");
    let a = assistant(tmp.path(), generator.clone(), None).await;
    with_france_pdf(&a).await;

    let image = ImageInput::from_file("map.png", vec![0x89, b'P', b'N', b'G']);
    a.ask_with_image(COURSE, "u1", QUESTION, image)
        .await
        .unwrap();

    assert_eq!(generator.images.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn earlier_turns_are_replayed_without_markers() {
    let tmp = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::replying("The capital of France is Paris [ref1].");
    let a = assistant(tmp.path(), generator.clone(), None).await;
    with_france_pdf(&a).await;

    a.ask(COURSE, "u1", QUESTION).await.unwrap();
    assert!(generator.last_prompt().history.is_empty());

    a.ask(COURSE, "u1", "Is the capital of France big?").await.unwrap();
    let history = generator.last_prompt().history;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content, QUESTION);
    assert_eq!(history[1].role, Role::Assistant);
    assert!(history[1].content.contains("Paris"));
    assert!(!history[1].content.contains("[ref1]"));

    // Another user's history is not mixed in.
    a.ask(COURSE, "u2", QUESTION).await.unwrap();
    assert!(generator.last_prompt().history.is_empty());
}

#[tokio::test]
async fn courses_do_not_see_each_other() {
    let tmp = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::replying("Paris [ref1].");
    let a = assistant(tmp.path(), generator.clone(), None).await;
    with_france_pdf(&a).await;

    let answer = a.ask("OTHER201", "u1", QUESTION).await.unwrap();

    assert_eq!(answer.route.decision, RouteDecision::Decline);
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn clear_history_only_touches_one_pair() {
    let tmp = tempfile::tempdir().unwrap();
    let a = assistant(tmp.path(), ScriptedGenerator::replying("Paris [ref1]."), None).await;
    with_france_pdf(&a).await;

    a.ask(COURSE, "u1", QUESTION).await.unwrap();
    a.ask(COURSE, "u2", QUESTION).await.unwrap();
    a.ask("OTHER201", "u1", QUESTION).await.unwrap();

    a.clear_history(COURSE, "u1").await.unwrap();

    assert!(a.get_history(COURSE, "u1").await.unwrap().is_empty());
    assert_eq!(a.get_history(COURSE, "u2").await.unwrap().len(), 2);
    assert_eq!(a.get_history("OTHER201", "u1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn index_and_history_survive_a_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let doc_id = {
        let a = assistant(tmp.path(), ScriptedGenerator::replying("Paris [ref1]."), None).await;
        let doc_id = with_france_pdf(&a).await;
        a.ask(COURSE, "u1", QUESTION).await.unwrap();
        doc_id
    };

    let generator = ScriptedGenerator::replying("Still Paris [ref1].");
    let a = assistant(tmp.path(), generator.clone(), None).await;

    let history = a.get_history(COURSE, "u1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].references[0].doc_id(), Some(doc_id.as_str()));

    let answer = a.ask(COURSE, "u1", QUESTION).await.unwrap();
    assert_eq!(answer.references[0].doc_id(), Some(doc_id.as_str()));
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn removed_document_is_no_longer_retrieved() {
    let tmp = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::replying("Paris [ref1].");
    let a = assistant(tmp.path(), generator.clone(), None).await;
    let doc_id = with_france_pdf(&a).await;

    a.remove_document(COURSE, &doc_id).await.unwrap();
    let answer = a.ask(COURSE, "u1", QUESTION).await.unwrap();

    assert_eq!(answer.route.decision, RouteDecision::Decline);
    assert_eq!(generator.calls(), 0);
    assert!(matches!(
        a.remove_document(COURSE, &doc_id).await,
        Err(AssistantError::NotFound { .. })
    ));
}

#[tokio::test]
async fn ingesting_the_same_file_twice_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let a = assistant(tmp.path(), ScriptedGenerator::replying("ok"), None).await;
    let first = with_france_pdf(&a).await;
    let second = with_france_pdf(&a).await;

    assert_eq!(first, second);
    let docs = a.list_documents(COURSE).await.unwrap();
    assert_eq!(docs.len(), 1);
    let meta = a.get_document_metadata(COURSE, &first, None).await.unwrap();
    assert_eq!(meta.chunks, 1);
}

#[tokio::test]
async fn viewer_serves_pages_and_files() {
    let tmp = tempfile::tempdir().unwrap();
    let a = assistant(tmp.path(), ScriptedGenerator::replying("ok"), None).await;
    let pdf = pdf_with_pages(&["Limits and continuity.", "Derivatives of polynomials."]);
    let report = a
        .ingest(
            COURSE,
            vec![
                SourceFile::new("calculus.pdf", pdf),
                SourceFile::new("notes.txt", b"Plain notes about integrals.".to_vec()),
            ],
        )
        .await
        .unwrap();
    assert_eq!(report.added.len(), 2);
    let pdf_id = report.added[0].doc_id.clone();
    let txt_id = report.added[1].doc_id.clone();

    let meta = a
        .get_document_metadata(COURSE, &pdf_id, Some(2))
        .await
        .unwrap();
    assert_eq!(meta.file_name, "calculus.pdf");
    assert_eq!(meta.total_pages, 2);
    let page = meta.page.unwrap();
    assert_eq!(page.page_or_slide, Some(2));
    assert!(page.text.contains("Derivatives"));

    let content = a.get_page_content(COURSE, &pdf_id, 1).await.unwrap();
    assert!(content.text.contains("Limits"));

    assert!(matches!(
        a.get_page_content(COURSE, &pdf_id, 3).await,
        Err(AssistantError::PageOutOfRange { page: 3, total: 2 })
    ));
    assert!(matches!(
        a.get_page_content(COURSE, &pdf_id, 0).await,
        Err(AssistantError::PageOutOfRange { .. })
    ));

    match a.render_page(COURSE, &pdf_id, 2).await.unwrap() {
        RenderedPage::Text { page, text, .. } => {
            assert_eq!(page, 2);
            assert!(text.contains("Derivatives"));
        }
        other => panic!("expected text page, got {other:?}"),
    }
    match a.render_page(COURSE, &txt_id, 1).await.unwrap() {
        RenderedPage::File { mime, bytes } => {
            assert_eq!(mime, "text/plain");
            assert_eq!(bytes, b"Plain notes about integrals.".to_vec());
        }
        other => panic!("expected file, got {other:?}"),
    }

    assert!(matches!(
        a.get_document_metadata(COURSE, "missing", None).await,
        Err(AssistantError::NotFound { .. })
    ));
}

#[tokio::test]
async fn rejects_bad_input() {
    let tmp = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::replying("unused");
    let a = assistant(tmp.path(), generator.clone(), None).await;

    assert!(matches!(
        a.ask("../etc", "u1", QUESTION).await,
        Err(AssistantError::InvalidCourseId(_))
    ));
    assert!(matches!(
        a.ask(COURSE, "u1", "   ").await,
        Err(AssistantError::InvalidInput(_))
    ));
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn feedback_is_reported_per_course() {
    let tmp = tempfile::tempdir().unwrap();
    let a = assistant(tmp.path(), ScriptedGenerator::failing(), None).await;

    a.add_feedback(COURSE, "u1", "q1", "a1", 5, Some("great"))
        .await
        .unwrap();
    a.add_feedback(COURSE, "u2", "q2", "a2", 2, None).await.unwrap();
    a.add_feedback("OTHER201", "u1", "q3", "a3", 1, None)
        .await
        .unwrap();

    let report = a.course_report(COURSE).await.unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.average_rating, Some(3.5));

    let mut out = Vec::new();
    let n = a.export_feedback_csv(COURSE, &mut out).await.unwrap();
    assert_eq!(n, 2);
    let csv = String::from_utf8(out).unwrap();
    assert!(csv.starts_with("id,date,user_id,question,rating,comment"));
    assert!(csv.contains("great"));
    assert!(!csv.contains("q3"));
}
