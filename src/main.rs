//! # Ellie CLI (`ellie`)
//!
//! Command-line front end for the course assistant: ingest course
//! materials, ask questions, inspect history and documents, and collect
//! feedback.
//!
//! ## Usage
//!
//! ```bash
//! ellie --config ./config/ellie.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ellie init` | Create the data directory and conversation database |
//! | `ellie courses` | List courses with an index on disk |
//! | `ellie ingest <course> <paths…>` | Ingest files or directories into a course |
//! | `ellie ask <course> "<question>"` | Ask a question and print the cited answer |
//! | `ellie history <course>` | Print a user's conversation history |
//! | `ellie clear-history <course>` | Delete a user's conversation history |
//! | `ellie remove <course> <doc_id>` | Remove a document from a course |
//! | `ellie rebuild <course>` | Re-embed a course with the configured embedder |
//! | `ellie doc <course> <doc_id>` | Show document metadata or page content |
//! | `ellie feedback add\|report\|export` | Record and summarize answer ratings |
//!
//! Logs go to stderr (`-v`, `-vv`, `-vvv` or `RUST_LOG`); results go to stdout.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::warn;

use ellie::assistant::Assistant;
use ellie::config::{self, Config};
use ellie::logging;
use ellie::models::{ImageInput, Query, SourceFile};
use ellie::viewer::RenderedPage;

/// Ellie: a course-scoped teaching assistant that answers from course
/// materials with page-level citations.
#[derive(Parser)]
#[command(name = "ellie", version, about)]
struct Cli {
    /// Path to configuration file (TOML). Defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "./config/ellie.toml")]
    config: PathBuf,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and conversation database.
    Init,

    /// List courses that have an index on disk.
    Courses,

    /// Ingest files into a course. Directories are walked recursively.
    Ingest {
        course: String,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Ask a question.
    Ask {
        course: String,
        question: String,
        #[arg(long, default_value = "cli")]
        user: String,
        /// Image to attach (png, jpg, gif, webp).
        #[arg(long)]
        image: Option<PathBuf>,
        /// Discipline hint: math, programming, engineering, humanities.
        #[arg(long)]
        discipline: Option<String>,
    },

    /// Print conversation history as JSON.
    History {
        course: String,
        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Delete conversation history.
    ClearHistory {
        course: String,
        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Remove a document and its stored copy.
    Remove { course: String, doc_id: String },

    /// Re-embed every chunk of a course.
    Rebuild { course: String },

    /// List documents, or show one document's metadata and pages.
    Doc {
        course: String,
        doc_id: Option<String>,
        #[arg(long)]
        page: Option<u32>,
        /// Print the page text instead of metadata.
        #[arg(long, requires = "page")]
        content: bool,
        /// Render the page; non-paged documents are written to this file.
        #[arg(long, requires = "page")]
        render: Option<PathBuf>,
    },

    /// Answer ratings.
    Feedback {
        #[command(subcommand)]
        action: FeedbackAction,
    },
}

#[derive(Subcommand)]
enum FeedbackAction {
    /// Record a rating (1-5) for an answer.
    Add {
        course: String,
        #[arg(long)]
        rating: u8,
        #[arg(long)]
        question: String,
        #[arg(long)]
        answer: String,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Print a summary report as JSON.
    Report { course: String },
    /// Write all feedback for a course as CSV.
    Export {
        course: String,
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        return config::load_config(path);
    }
    warn!(path = %path.display(), "config file not found; using defaults");
    let cfg = Config::default();
    config::validate(&cfg)?;
    Ok(cfg)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = load(&cli.config)?;
    let assistant = Assistant::open(cfg).await?;

    match cli.command {
        Commands::Init => {
            println!(
                "Initialized data directory {}",
                assistant.config().storage.data_dir.display()
            );
        }
        Commands::Courses => {
            for course in assistant.registry().list_courses()? {
                println!("{course}");
            }
        }
        Commands::Ingest { course, paths } => {
            let mut files = Vec::new();
            let mut reports = Vec::new();
            for path in paths {
                if path.is_dir() {
                    reports.push(assistant.ingest_dir(&course, &path).await?);
                } else {
                    let bytes = std::fs::read(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| path.display().to_string());
                    files.push(SourceFile::new(name, bytes));
                }
            }
            if !files.is_empty() {
                reports.push(assistant.ingest(&course, files).await?);
            }
            let mut merged = reports.pop().unwrap_or_default();
            for r in reports {
                merged.added.extend(r.added);
                merged.errors.extend(r.errors);
            }
            print_json(&merged)?;
        }
        Commands::Ask {
            course,
            question,
            user,
            image,
            discipline,
        } => {
            let mut query = Query::new(course, user, question);
            if let Some(path) = image {
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("Failed to read image {}", path.display()))?;
                query = query.with_image(ImageInput::from_file(&path.to_string_lossy(), bytes));
            }
            if let Some(d) = discipline {
                query = query.with_discipline(d);
            }
            print_json(&assistant.answer(query).await?)?;
        }
        Commands::History { course, user } => {
            print_json(&assistant.get_history(&course, &user).await?)?;
        }
        Commands::ClearHistory { course, user } => {
            assistant.clear_history(&course, &user).await?;
            println!("ok");
        }
        Commands::Remove { course, doc_id } => {
            let doc = assistant.remove_document(&course, &doc_id).await?;
            println!("removed {} ({})", doc.doc_id, doc.file_name);
        }
        Commands::Rebuild { course } => {
            let n = assistant.rebuild(&course).await?;
            println!("rebuilt {course}: {n} chunks re-embedded");
        }
        Commands::Doc {
            course,
            doc_id,
            page,
            content,
            render,
        } => match (doc_id, page) {
            (None, _) => print_json(&assistant.list_documents(&course).await?)?,
            (Some(doc_id), Some(page)) if content => {
                print_json(&assistant.get_page_content(&course, &doc_id, page).await?)?;
            }
            (Some(doc_id), Some(page)) if render.is_some() => {
                match assistant.render_page(&course, &doc_id, page).await? {
                    RenderedPage::Text { text, .. } => println!("{text}"),
                    RenderedPage::File { bytes, mime } => {
                        let Some(out) = render else {
                            bail!("--render needs an output path");
                        };
                        std::fs::write(&out, bytes)
                            .with_context(|| format!("Failed to write {}", out.display()))?;
                        println!("wrote {} ({mime})", out.display());
                    }
                }
            }
            (Some(doc_id), page) => {
                print_json(&assistant.get_document_metadata(&course, &doc_id, page).await?)?;
            }
        },
        Commands::Feedback { action } => match action {
            FeedbackAction::Add {
                course,
                rating,
                question,
                answer,
                user,
                comment,
            } => {
                let id = assistant
                    .add_feedback(&course, &user, &question, &answer, rating, comment.as_deref())
                    .await?;
                println!("recorded feedback #{id}");
            }
            FeedbackAction::Report { course } => {
                print_json(&assistant.course_report(&course).await?)?;
            }
            FeedbackAction::Export { course, out } => {
                let n = match out {
                    Some(path) => {
                        let file = std::fs::File::create(&path)
                            .with_context(|| format!("Failed to create {}", path.display()))?;
                        assistant.export_feedback_csv(&course, file).await?
                    }
                    None => assistant.export_feedback_csv(&course, std::io::stdout()).await?,
                };
                eprintln!("exported {n} feedback entries");
            }
        },
    }

    Ok(())
}
