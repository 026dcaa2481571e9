use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ragline::app::AppContext;
use ragline::commands::{QueryArgs, configure, ingest, query, remove, show_stats, sweep};
use ragline::config::{Config, get_config_dir};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ragline")]
#[command(about = "Incremental document embedding, retrieval and grounded answers")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml, the cache database and the index snapshot
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the configuration file, or show the active configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Embed files or directories and add them to the index
    Ingest {
        /// Files or directories to ingest
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Recompute embeddings even when cached
        #[arg(long)]
        force: bool,
    },
    /// Ask a question against the indexed documents
    Query {
        text: String,
        /// Generation provider to try first
        #[arg(long)]
        provider: Option<String>,
        /// Model for the chosen provider
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        max_sources: Option<usize>,
        #[arg(long)]
        min_confidence: Option<f32>,
        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,
    },
    /// Remove a document from the index
    Remove {
        /// Document id, as printed by `ingest`
        document_id: String,
    },
    /// Show index, cache and provider status
    Stats,
    /// Purge expired cache entries
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => get_config_dir()?,
    };
    let config = Config::load(&data_dir)
        .with_context(|| format!("Failed to load configuration from {}", data_dir.display()))?;

    if let Commands::Config { show } = cli.command {
        return configure(&config, show);
    }

    let context = AppContext::from_config(config).await?;
    match cli.command {
        Commands::Config { .. } => {}
        Commands::Ingest { paths, force } => {
            ingest(&context, &paths, force).await?;
        }
        Commands::Query {
            text,
            provider,
            model,
            max_sources,
            min_confidence,
            stream,
        } => {
            let args = QueryArgs {
                provider,
                model,
                max_sources,
                min_confidence,
                stream,
            };
            query(&context, &text, &args).await?;
        }
        Commands::Remove { document_id } => {
            remove(&context, &document_id).await?;
        }
        Commands::Stats => {
            show_stats(&context).await?;
        }
        Commands::Sweep => {
            sweep(&context).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn stats_command() {
        let cli = Cli::try_parse_from(["ragline", "stats"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Stats));
        assert_eq!(cli.data_dir, None);
    }

    #[test]
    fn ingest_requires_paths() {
        let cli = Cli::try_parse_from(["ragline", "ingest"]);
        assert!(cli.is_err());

        let cli = Cli::try_parse_from(["ragline", "ingest", "docs", "notes.md", "--force"])
            .expect("should parse");
        let Commands::Ingest { paths, force } = cli.command else {
            panic!("expected ingest command");
        };
        assert_eq!(paths, vec![PathBuf::from("docs"), PathBuf::from("notes.md")]);
        assert!(force);
    }

    #[test]
    fn query_with_overrides() {
        let cli = Cli::try_parse_from([
            "ragline",
            "query",
            "what is ownership?",
            "--provider",
            "openai",
            "--max-sources",
            "3",
            "--min-confidence",
            "0.5",
            "--stream",
        ])
        .expect("should parse");

        let Commands::Query {
            text,
            provider,
            model,
            max_sources,
            min_confidence,
            stream,
        } = cli.command
        else {
            panic!("expected query command");
        };
        assert_eq!(text, "what is ownership?");
        assert_eq!(provider.as_deref(), Some("openai"));
        assert_eq!(model, None);
        assert_eq!(max_sources, Some(3));
        assert_eq!(min_confidence, Some(0.5));
        assert!(stream);
    }

    #[test]
    fn data_dir_is_global() {
        let cli = Cli::try_parse_from(["ragline", "remove", "doc-1", "--data-dir", "/tmp/rag"])
            .expect("should parse");
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/rag")));
        assert!(matches!(cli.command, Commands::Remove { ref document_id } if document_id == "doc-1"));
    }

    #[test]
    fn config_show_flag() {
        let cli = Cli::try_parse_from(["ragline", "config", "--show"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Config { show: true }));
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["ragline", "invalid"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["ragline", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
