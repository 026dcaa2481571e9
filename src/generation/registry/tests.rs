use super::*;
use crate::generation::GenerationRequest;
use async_trait::async_trait;

struct NamedProvider(&'static str);

#[async_trait]
impl GenerationProvider for NamedProvider {
    fn name(&self) -> &str {
        self.0
    }

    fn default_model(&self) -> &str {
        "stub"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
        Ok(format!("from {}", self.0))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

fn ollama(name: &str) -> ProviderSettings {
    ProviderSettings::Ollama {
        name: name.to_string(),
        model: "llama".to_string(),
        protocol: "http".to_string(),
        host: "localhost".to_string(),
        port: 11434,
    }
}

fn openai(name: &str) -> ProviderSettings {
    ProviderSettings::OpenAi {
        name: name.to_string(),
        model: "gpt".to_string(),
        base_url: "https://api.example.com/v1".to_string(),
        api_key_env: "RAGLINE_REGISTRY_TEST_KEY".to_string(),
    }
}

#[test]
fn settings_accessors() {
    let settings = openai("cloud");
    assert_eq!(settings.name(), "cloud");
    assert_eq!(settings.model(), "gpt");
    assert_eq!(settings.kind(), ProviderKind::OpenAi);
    assert_eq!(settings.kind().to_string(), "openai");
    assert_eq!(ollama("local").kind().to_string(), "ollama");
}

#[test]
fn settings_serialize_with_kind_tag() {
    let json = serde_json::to_value(openai("cloud")).expect("should serialize");
    assert_eq!(json["kind"], "openai");

    let parsed: ProviderSettings = serde_json::from_str(
        r#"{"kind":"ollama","name":"local","model":"mistral"}"#,
    )
    .expect("should deserialize with defaults");
    assert_eq!(
        parsed,
        ProviderSettings::Ollama {
            name: "local".to_string(),
            model: "mistral".to_string(),
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
        }
    );
}

#[test]
fn invalid_settings_are_rejected() {
    let mut bad_protocol = ollama("local");
    if let ProviderSettings::Ollama { protocol, .. } = &mut bad_protocol {
        *protocol = "ftp".to_string();
    }
    assert!(bad_protocol.validate().is_err());

    let mut bad_url = openai("cloud");
    if let ProviderSettings::OpenAi { base_url, .. } = &mut bad_url {
        *base_url = "not a url".to_string();
    }
    assert!(bad_url.validate().is_err());

    let mut no_model = ollama("local");
    if let ProviderSettings::Ollama { model, .. } = &mut no_model {
        model.clear();
    }
    assert!(no_model.validate().is_err());

    assert!(ollama("").validate().is_err());
    assert!(ollama("local").validate().is_ok());
    assert!(openai("cloud").validate().is_ok());
}

#[test]
fn registry_builds_from_settings() {
    let registry = ProviderRegistry::from_settings(
        &[ollama("local"), openai("cloud")],
        "local",
        Duration::from_secs(5),
    )
    .expect("should build registry");

    assert_eq!(registry.names(), vec!["cloud", "local"]);
    assert_eq!(registry.default_provider(), "local");
    let local = registry.get("local").expect("should find provider");
    assert_eq!(local.name(), "local");
    assert_eq!(local.default_model(), "llama");
}

#[test]
fn registry_rejects_unknown_default() {
    let result = ProviderRegistry::from_settings(&[ollama("local")], "cloud", Duration::from_secs(5));
    assert!(matches!(result, Err(RagError::Validation(_))));
}

#[test]
fn registry_rejects_duplicates() {
    let result = ProviderRegistry::from_settings(
        &[ollama("same"), openai("same")],
        "same",
        Duration::from_secs(5),
    );
    assert!(matches!(result, Err(RagError::Validation(_))));

    let mut registry = ProviderRegistry::new("a");
    registry
        .register(Arc::new(NamedProvider("a")))
        .expect("should register");
    assert!(registry.register(Arc::new(NamedProvider("a"))).is_err());
}

#[test]
fn unknown_provider_is_unavailable() {
    let registry = ProviderRegistry::new("a");
    let result = registry.get("ghost");
    assert!(matches!(
        result,
        Err(RagError::ProviderUnavailable { ref provider, .. }) if provider == "ghost"
    ));
}
