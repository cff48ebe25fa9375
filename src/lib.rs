//! # Ellie
//!
//! A course-scoped, retrieval-augmented teaching assistant. Instructors
//! upload course materials; students ask questions and get answers grounded
//! in those materials, with inline citations that resolve to a specific
//! document and page or slide.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────┐   ┌──────────────────────┐
//! │   Loader   │──▶│ Chunker  │──▶│ Course Index (SQLite) │◀─┐
//! │ pdf/pptx/… │   │          │   │  one per course_id    │  │ registry
//! └────────────┘   └──────────┘   └──────────┬───────────┘  │
//!                                            │ retrieve      │
//!                                            ▼               │
//!  question ──▶ Router ──▶ Prompt ──▶ Generator ──▶ Reference Resolver
//!                 │ (web?)                                   │
//!                 ▼                                          ▼
//!            Web Search                            Conversation Store
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`extract`] | Document loader (pdf, docx, pptx, txt, csv) |
//! | [`chunk`] | Overlapping, boundary-aware text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Durable chunk/vector storage |
//! | [`index`] | Per-course vector index |
//! | [`registry`] | Course index lifecycle |
//! | [`retriever`] | Query-time retrieval with a score threshold |
//! | [`router`] | Course / web / decline routing |
//! | [`web_search`] | Optional web search provider |
//! | [`generation`] | Answer generator abstraction |
//! | [`prompt`] | Prompt assembly and discipline guidelines |
//! | [`references`] | Citation markers and resolution |
//! | [`conversation`] | Per-(course, user) history |
//! | [`feedback`] | Answer ratings and reports |
//! | [`viewer`] | Document viewer operations |
//! | [`ingest`] | Batch ingestion |
//! | [`assistant`] | The exposed operations |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema creation |

pub mod assistant;
pub mod chunk;
pub mod config;
pub mod conversation;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod feedback;
pub mod generation;
pub mod http;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod prompt;
pub mod references;
pub mod registry;
pub mod retriever;
pub mod router;
pub mod store;
pub mod viewer;
pub mod web_search;

pub use assistant::Assistant;
pub use error::{AssistantError, Result};
