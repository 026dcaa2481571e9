use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::app::AppContext;
use crate::config::{Config, show_config};
use crate::embeddings::Document;
use crate::generation::StreamEvent;
use crate::rag::{IngestReport, RetrievedSource};

/// Per-invocation overrides for `query`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryArgs {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub max_sources: Option<usize>,
    pub min_confidence: Option<f32>,
    pub stream: bool,
}

/// Show the configuration, or write it out so it can be edited
#[inline]
pub fn configure(config: &Config, show: bool) -> Result<()> {
    if show {
        show_config(config);
        return Ok(());
    }

    config.save()?;
    eprintln!(
        "{} {}",
        style("Configuration written to").green(),
        style(config.config_file_path().display()).cyan()
    );
    eprintln!("Edit the file to change providers, models and limits.");
    Ok(())
}

/// Read every file under `paths` into a document whose id is its path
#[inline]
pub fn load_documents(paths: &[PathBuf]) -> Result<Vec<Document>> {
    let mut files = Vec::new();
    for path in paths {
        std::fs::metadata(path).with_context(|| format!("Failed to read {}", path.display()))?;
        collect_files(path, &mut files);
    }
    files.sort();
    files.dedup();

    let mut documents = Vec::with_capacity(files.len());
    for file in files {
        let content = match std::fs::read_to_string(&file) {
            Ok(content) => content,
            Err(e) => {
                warn!("Skipping {}: {}", file.display(), e);
                continue;
            }
        };
        let id = file.to_string_lossy().into_owned();
        let mut document = Document::new(id, content).with_metadata("path", file.display().to_string());
        if let Some(name) = file.file_name() {
            document = document.with_metadata("file_name", name.to_string_lossy());
        }
        documents.push(document);
    }
    Ok(documents)
}

/// Walk `root`, skipping hidden entries below it; unreadable entries and symlink loops are logged
fn collect_files(root: &Path, files: &mut Vec<PathBuf>) {
    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));
    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(e) => warn!("Skipping entry under {}: {}", root.display(), e),
        }
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

/// Ingest files into the index and save the snapshot
#[inline]
pub async fn ingest(context: &AppContext, paths: &[PathBuf], force: bool) -> Result<IngestReport> {
    let documents = load_documents(paths)?;
    if documents.is_empty() {
        println!("No readable files found.");
        return Ok(IngestReport::default());
    }
    info!("Ingesting {} documents (force: {})", documents.len(), force);

    let bar = if console::user_attended_stderr() {
        let progress_style = ProgressStyle::with_template("{bar:40} [{pos}/{len}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        ProgressBar::new(documents.len() as u64).with_style(progress_style)
    } else {
        ProgressBar::hidden()
    };

    let batch_size = context.config().embedding.concurrency.max(1) * 4;
    let mut total = IngestReport::default();
    for batch in documents.chunks(batch_size) {
        if let Some(first) = batch.first() {
            bar.set_message(first.id.clone());
        }
        let report = context.orchestrator().ingest(batch, force).await;
        total.processed += report.processed;
        total.skipped += report.skipped;
        total.failed += report.failed;
        total.embeddings += report.embeddings;
        total.elapsed += report.elapsed;
        total.failures.extend(report.failures);
        bar.inc(batch.len() as u64);
    }
    bar.finish_and_clear();

    if total.processed > 0 {
        context.persist().await?;
    }

    println!(
        "{} {} processed, {} unchanged, {} failed ({} embeddings in {:.1}s)",
        style("Ingestion complete:").bold().green(),
        total.processed,
        total.skipped,
        total.failed,
        total.embeddings,
        total.elapsed.as_secs_f64()
    );
    for (id, error) in &total.failures {
        println!("  {} {}: {}", style("✗").red(), id, error);
    }

    Ok(total)
}

/// Answer a question from the indexed documents
#[inline]
pub async fn query(context: &AppContext, text: &str, args: &QueryArgs) -> Result<()> {
    let mut options = context.query_options();
    options.provider.clone_from(&args.provider);
    options.model.clone_from(&args.model);
    if let Some(max_sources) = args.max_sources {
        options.max_sources = max_sources;
    }
    if let Some(min_confidence) = args.min_confidence {
        options.min_confidence = min_confidence;
    }

    if args.stream {
        let mut result = context.orchestrator().query_stream(text, &options).await?;
        debug!("Streaming answer for query {}", result.query_id);

        let mut stdout = std::io::stdout();
        loop {
            match result.stream.next().await {
                Some(StreamEvent::Fragment(fragment)) => {
                    write!(stdout, "{}", fragment)?;
                    stdout.flush()?;
                }
                Some(StreamEvent::Done) | None => break,
                Some(StreamEvent::Error(message)) => {
                    writeln!(stdout)?;
                    anyhow::bail!("Generation failed mid-stream: {}", message);
                }
            }
        }
        writeln!(stdout)?;
        print_sources(&result.sources, result.confidence);
        print_provider(&result.provider_used, &result.model_used, result.fell_back);
    } else {
        let result = context.orchestrator().query(text, &options).await?;
        println!("{}", result.answer.trim());
        print_sources(&result.sources, result.confidence);
        print_provider(&result.provider_used, &result.model_used, result.fell_back);
        println!(
            "{}",
            style(format!("Answered in {:.2}s", result.elapsed.as_secs_f64())).dim()
        );
    }

    Ok(())
}

fn print_sources(sources: &[RetrievedSource], confidence: f32) {
    println!();
    if sources.is_empty() {
        println!("{}", style("No relevant sources found.").yellow());
        return;
    }

    println!(
        "{} (confidence {:.2})",
        style("Sources").bold(),
        confidence
    );
    for (i, source) in sources.iter().enumerate() {
        println!(
            "  {}. {} [{}] {:.3}",
            i + 1,
            style(&source.record.document_id).cyan(),
            source.record.chunk_id,
            source.score
        );
    }
}

fn print_provider(provider: &str, model: &str, fell_back: bool) {
    if fell_back {
        println!(
            "{}",
            style(format!("Answered by fallback provider {} ({})", provider, model)).yellow()
        );
    } else {
        println!("{}", style(format!("Answered by {} ({})", provider, model)).dim());
    }
}

/// Remove a document from the index
#[inline]
pub async fn remove(context: &AppContext, document_id: &str) -> Result<usize> {
    let removed = context.orchestrator().remove_document(document_id).await?;
    if removed == 0 {
        println!("Document {} is not indexed.", style(document_id).cyan());
        return Ok(0);
    }

    context.persist().await?;
    println!(
        "Removed {} chunks of {}",
        removed,
        style(document_id).cyan()
    );
    Ok(removed)
}

/// Print index, cache and provider health
#[inline]
pub async fn show_stats(context: &AppContext) -> Result<()> {
    let orchestrator = context.orchestrator();

    let index = orchestrator.index().stats().await;
    println!("{}", style("Vector index").bold().yellow());
    println!("  Documents: {}", index.documents);
    println!("  Chunks: {}", index.entries);
    println!("  Dimension: {}", index.dimension);
    println!(
        "  Approximate size: {:.2} MB",
        index.approximate_bytes as f64 / (1024.0 * 1024.0)
    );

    let cache = context.cache().stats().await;
    println!("{}", style("Embedding cache").bold().yellow());
    println!("  Memory entries: {}", cache.memory_entries);
    println!("  Durable entries: {}", cache.durable_entries);

    println!("{}", style("Providers").bold().yellow());
    let embedder = orchestrator.pipeline().provider();
    print_health(
        &format!("{} (embeddings, {})", embedder.name(), orchestrator.pipeline().model()),
        embedder.health_check().await,
    );

    let registry = orchestrator.providers();
    for name in registry.names() {
        let provider = registry.get(name)?;
        let label = if name == registry.default_provider() {
            format!("{} (generation, {}, default)", name, provider.default_model())
        } else {
            format!("{} (generation, {})", name, provider.default_model())
        };
        print_health(&label, provider.health_check().await);
    }

    Ok(())
}

fn print_health(label: &str, healthy: bool) {
    if healthy {
        println!("  {} {}", style("✓").green(), label);
    } else {
        println!("  {} {}", style("✗").red(), label);
    }
}

/// Purge expired cache entries from both tiers
#[inline]
pub async fn sweep(context: &AppContext) -> Result<u64> {
    let purged = context.cache().purge_expired().await?;
    context
        .database()
        .optimize()
        .await
        .context("Failed to optimize cache database")?;
    println!("Purged {} expired cache entries", purged);
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_documents_walks_directories() {
        let temp_dir = TempDir::new().expect("should create temp dir");
        let nested = temp_dir.path().join("nested");
        std::fs::create_dir_all(&nested).expect("should create dir");
        std::fs::write(temp_dir.path().join("a.md"), "alpha").expect("should write");
        std::fs::write(nested.join("b.txt"), "beta").expect("should write");
        std::fs::write(temp_dir.path().join(".hidden"), "secret").expect("should write");

        let documents =
            load_documents(&[temp_dir.path().to_path_buf()]).expect("should load documents");

        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].content, "alpha");
        assert_eq!(documents[1].content, "beta");
        assert_eq!(
            documents[1].metadata.get("file_name").map(String::as_str),
            Some("b.txt")
        );
        assert!(documents[0].id.ends_with("a.md"));
    }

    #[test]
    fn load_documents_rejects_missing_paths() {
        let temp_dir = TempDir::new().expect("should create temp dir");
        let result = load_documents(&[temp_dir.path().join("missing.txt")]);
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loops_are_skipped() {
        let temp_dir = TempDir::new().expect("should create temp dir");
        std::fs::write(temp_dir.path().join("a.md"), "alpha").expect("should write");
        std::os::unix::fs::symlink(temp_dir.path(), temp_dir.path().join("loop"))
            .expect("should create symlink");

        let documents =
            load_documents(&[temp_dir.path().to_path_buf()]).expect("should load documents");

        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].content, "alpha");
    }

    #[test]
    fn duplicate_paths_load_once() {
        let temp_dir = TempDir::new().expect("should create temp dir");
        let file = temp_dir.path().join("a.md");
        std::fs::write(&file, "alpha").expect("should write");

        let documents =
            load_documents(&[file.clone(), file]).expect("should load documents");
        assert_eq!(documents.len(), 1);
    }
}
