// Configuration management module
// TOML settings with validation, plus a console rendering of the active configuration

pub mod settings;

#[cfg(test)]
mod tests;

use console::style;

pub use settings::{
    CacheConfig, Config, ConfigError, EmbeddingConfig, GenerationConfig, RetrievalConfig,
};

/// Get the default data directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::default_data_dir()
}

/// Print the active configuration to stderr
#[inline]
pub fn show_config(config: &Config) {
    eprintln!("{}", style("Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Embedding:").bold().yellow());
    match config.embedding.ollama_url() {
        Ok(url) => eprintln!("  Ollama URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  Ollama URL: {} ({})", style("Invalid").red(), e),
    }
    eprintln!("  Model: {}", style(&config.embedding.model).cyan());
    eprintln!("  Dimension: {}", style(config.embedding.dimension).cyan());
    eprintln!("  Concurrency: {}", style(config.embedding.concurrency).cyan());

    eprintln!("{}", style("Generation:").bold().yellow());
    eprintln!(
        "  Default provider: {}",
        style(&config.generation.default_provider).cyan()
    );
    for provider in &config.generation.providers {
        eprintln!(
            "  - {} ({}, model {})",
            style(provider.name()).cyan(),
            provider.kind(),
            provider.model()
        );
    }

    eprintln!("{}", style("Chunking:").bold().yellow());
    eprintln!(
        "  Window: {} tokens, overlap {}",
        config.chunking.max_chunk_size, config.chunking.overlap
    );

    eprintln!("{}", style("Cache:").bold().yellow());
    eprintln!(
        "  Memory entries: {}, TTL: {}s",
        config.cache.max_size, config.cache.default_ttl_seconds
    );

    eprintln!("{}", style("Retrieval:").bold().yellow());
    eprintln!(
        "  Max sources: {}, min confidence: {}",
        config.retrieval.max_sources, config.retrieval.min_confidence
    );

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );
}
