//! The operations exposed to callers: asking, ingestion, history, feedback
//! and the document viewer.
//!
//! ```text
//! question ─► retrieve ─► route ─┬─ Decline ─────────────────────────┐
//!                                └─ web? ─► prompt ─► generate ─► resolve ─► append exchange
//! ```
//!
//! Question answering degrades instead of failing: provider errors become
//! [`APOLOGY`] and a failed web search routes as if web search were off.
//! Only caller mistakes (bad course id, empty question) are returned as errors.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::embedding::create_embedder;
use crate::error::{validate_course_id, AssistantError, Result};
use crate::feedback::{CourseReport, FeedbackStore};
use crate::generation::{create_generator, Generator, APOLOGY};
use crate::ingest::{IngestReport, Ingester};
use crate::models::{Answer, Document, ImageInput, Page, Query, Reference, SourceFile, Turn};
use crate::prompt::{self, PromptInput};
use crate::references::{self, CitableSource};
use crate::registry::CourseRegistry;
use crate::retriever::{Candidate, Retriever};
use crate::router::{self, Route, RouteDecision, RouteSignals, DECLINE_ANSWER};
use crate::viewer::{self, DocumentMetadata, RenderedPage};
use crate::web_search::{create_web_search, WebSearch, WebSnippet};

pub struct Assistant {
    config: Arc<Config>,
    registry: Arc<CourseRegistry>,
    retriever: Retriever,
    ingester: Ingester,
    generator: Arc<dyn Generator>,
    web: Option<Arc<dyn WebSearch>>,
    conversations: ConversationStore,
    feedback: FeedbackStore,
}

impl Assistant {
    /// Build every provider from `config` and open the on-disk stores.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        let web = create_web_search(&config.web_search)?;
        let registry = Arc::new(CourseRegistry::new(Arc::clone(&config), embedder));
        Ok(Self::from_parts(config, registry, generator, web).await?)
    }

    /// Assemble from explicit components. The conversation database is
    /// opened under `config.storage.data_dir`.
    pub async fn from_parts(
        config: Arc<Config>,
        registry: Arc<CourseRegistry>,
        generator: Arc<dyn Generator>,
        web: Option<Arc<dyn WebSearch>>,
    ) -> Result<Self> {
        let conversations = ConversationStore::open(&config.storage.conversations_db()).await?;
        let feedback = FeedbackStore::new(conversations.pool().clone());
        Ok(Self {
            retriever: Retriever::new(Arc::clone(&registry), &config.retrieval),
            ingester: Ingester::new(Arc::clone(&registry), config.chunking.clone()),
            config,
            registry,
            generator,
            web,
            conversations,
            feedback,
        })
    }

    pub fn registry(&self) -> &Arc<CourseRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn ask(&self, course_id: &str, user_id: &str, question: &str) -> Result<Answer> {
        self.answer(Query::new(course_id, user_id, question)).await
    }

    pub async fn ask_with_image(
        &self,
        course_id: &str,
        user_id: &str,
        question: &str,
        image: ImageInput,
    ) -> Result<Answer> {
        self.answer(Query::new(course_id, user_id, question).with_image(image))
            .await
    }

    /// Answer a fully specified query and record the exchange.
    pub async fn answer(&self, query: Query) -> Result<Answer> {
        validate_course_id(&query.course_id)?;
        if query.question.trim().is_empty() {
            return Err(AssistantError::InvalidInput("question is empty".to_string()));
        }
        let course_id = query.course_id.as_str();
        let user_id = query.user_id.as_str();

        let candidates = match self
            .retriever
            .retrieve(course_id, &query.question, None)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                error!(course_id, user_id, error = %e, "retrieval failed");
                let route = Route {
                    decision: RouteDecision::Decline,
                    rationale: format!("retrieval failed: {}", e.kind()),
                };
                return Ok(self.finish(&query, APOLOGY.to_string(), Vec::new(), route).await);
            }
        };

        let web_available = self.web.is_some();
        let time_sensitive = if web_available && self.config.generation.llm_route_classifier {
            router::classify_time_sensitive(self.generator.as_ref(), &query.question).await
        } else {
            router::is_time_sensitive(&query.question)
        };
        let mut signals = RouteSignals {
            top_score: candidates.first().map(|c| c.score),
            hits: candidates.len(),
            confident_score: self.config.retrieval.confident_score,
            web_available,
            time_sensitive,
        };
        let mut route = router::decide(&signals);

        let mut web_results = Vec::new();
        if route.decision.uses_web() {
            web_results = self.search_web(course_id, &query.question).await;
            if web_results.is_empty() {
                signals.web_available = false;
                route = router::decide(&signals);
            }
        }
        info!(
            course_id,
            user_id,
            decision = route.decision.as_str(),
            rationale = %route.rationale,
            "routed question"
        );

        if route.decision == RouteDecision::Decline {
            return Ok(self
                .finish(&query, DECLINE_ANSWER.to_string(), Vec::new(), route)
                .await);
        }

        let course: &[Candidate] = if route.decision.uses_course() {
            &candidates
        } else {
            &[]
        };
        let web: &[WebSnippet] = if route.decision.uses_web() {
            &web_results
        } else {
            &[]
        };
        let sources = references::build_candidates(course, web);

        let (text, refs) = match self.generate(&query, &sources).await {
            Ok(raw) => {
                let supplied: Vec<_> = sources.iter().map(|s| s.reference.clone()).collect();
                references::resolve(&raw, &supplied)
            }
            Err(e) => {
                warn!(course_id, user_id, error = %e, "generation failed; answering with apology");
                (APOLOGY.to_string(), Vec::new())
            }
        };
        Ok(self.finish(&query, text, refs, route).await)
    }

    async fn search_web(&self, course_id: &str, question: &str) -> Vec<WebSnippet> {
        let Some(web) = &self.web else {
            return Vec::new();
        };
        match web.search(question, self.config.web_search.max_results).await {
            Ok(results) => results,
            Err(e) => {
                warn!(course_id, provider = web.name(), error = %e, "web search failed; continuing without it");
                Vec::new()
            }
        }
    }

    async fn generate(&self, query: &Query, sources: &[CitableSource]) -> Result<String> {
        let settings = &self.config.generation;
        let turns = self
            .conversations
            .recent(&query.course_id, &query.user_id, settings.history_turns)
            .await?;
        let course = self.config.course(&query.course_id);
        let input = PromptInput {
            course_id: &query.course_id,
            question: &query.question,
            discipline: prompt::resolve_discipline(
                query.discipline.as_deref(),
                course,
                &query.course_id,
            ),
            instructions: course.and_then(|c| c.instructions.as_deref()),
            sources,
            history: prompt::select_history(&turns, settings.history_turns, settings.history_max_chars),
            has_image: query.image.is_some(),
            today: chrono::Utc::now().format("%Y-%m-%d").to_string(),
        };
        self.generator
            .generate(&prompt::build(input), query.image.as_ref())
            .await
    }

    /// Record the exchange and build the caller's answer. A storage failure
    /// is logged and the answer is still returned.
    async fn finish(
        &self,
        query: &Query,
        text: String,
        references: Vec<Reference>,
        route: Route,
    ) -> Answer {
        let user_turn = Turn::user(query.question.clone());
        let assistant_turn = Turn::assistant(text.clone(), references.clone(), route.clone());
        if let Err(e) = self
            .conversations
            .append_exchange(&query.course_id, &query.user_id, &user_turn, &assistant_turn)
            .await
        {
            error!(
                course_id = %query.course_id,
                user_id = %query.user_id,
                error = %e,
                "failed to record conversation turn"
            );
        }
        Answer {
            answer: text,
            references,
            route,
        }
    }

    pub async fn ingest(&self, course_id: &str, files: Vec<SourceFile>) -> Result<IngestReport> {
        self.ingester.ingest(course_id, files).await
    }

    pub async fn ingest_dir(&self, course_id: &str, dir: &Path) -> Result<IngestReport> {
        self.ingester.ingest_dir(course_id, dir).await
    }

    pub async fn remove_document(&self, course_id: &str, doc_id: &str) -> Result<Document> {
        self.ingester.remove_document(course_id, doc_id).await
    }

    pub async fn rebuild(&self, course_id: &str) -> Result<usize> {
        self.ingester.rebuild(course_id).await
    }

    pub async fn list_documents(&self, course_id: &str) -> Result<Vec<Document>> {
        let mut docs = self.registry.get(course_id).await?.documents()?;
        docs.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(docs)
    }

    pub async fn get_history(&self, course_id: &str, user_id: &str) -> Result<Vec<Turn>> {
        self.conversations.get_history(course_id, user_id).await
    }

    pub async fn clear_history(&self, course_id: &str, user_id: &str) -> Result<()> {
        self.conversations.clear(course_id, user_id).await?;
        Ok(())
    }

    pub async fn get_document_metadata(
        &self,
        course_id: &str,
        doc_id: &str,
        page: Option<u32>,
    ) -> Result<DocumentMetadata> {
        let index = self.registry.get(course_id).await?;
        viewer::get_document_metadata(&index, doc_id, page).await
    }

    pub async fn get_page_content(&self, course_id: &str, doc_id: &str, page: u32) -> Result<Page> {
        let index = self.registry.get(course_id).await?;
        viewer::get_page_content(&index, doc_id, page).await
    }

    pub async fn render_page(
        &self,
        course_id: &str,
        doc_id: &str,
        page: u32,
    ) -> Result<RenderedPage> {
        let index = self.registry.get(course_id).await?;
        viewer::render_page(&index, doc_id, page).await
    }

    pub async fn add_feedback(
        &self,
        course_id: &str,
        user_id: &str,
        question: &str,
        answer: &str,
        rating: u8,
        comment: Option<&str>,
    ) -> Result<i64> {
        self.feedback
            .add_feedback(course_id, user_id, question, answer, rating, comment)
            .await
    }

    pub async fn course_report(&self, course_id: &str) -> Result<CourseReport> {
        self.feedback.course_report(course_id).await
    }

    pub async fn export_feedback_csv<W: std::io::Write>(
        &self,
        course_id: &str,
        writer: W,
    ) -> Result<usize> {
        self.feedback.export_csv(course_id, writer).await
    }
}
