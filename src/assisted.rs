//! Tier-2: language-model classification over metadata only
//!
//! Verdicts are cached by sender domain and a hash of the normalized subject,
//! so a newsletter series costs one model call per cache period.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::classifier::Classifier;
use crate::config::AssistedConfig;
use crate::error::{Result, TriageError};
use crate::models::{
    ClassificationResult, ClassificationSignal, ClassifierTier, Disposition, MessageMetadata,
};
use crate::store::{self, cache::CachedVerdict, Database};

const INSTRUCTIONS: &str = "You triage email using metadata only. \
Answer with a single JSON object: \
{\"disposition\": \"keep\" | \"archive\" | \"trash\" | \"review\", \
\"confidence\": number between 0 and 1, \"reason\": short string}. \
Prefer keep or review whenever the message could matter to the recipient.";

/// A text-completion backend
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct ModelVerdict {
    disposition: String,
    confidence: f64,
    #[serde(default)]
    reason: String,
}

/// Lowercase, digits collapsed to '#', whitespace normalized
pub fn subject_pattern(subject: &str) -> String {
    let lowered: String = subject
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .collect();

    let mut pattern = String::with_capacity(lowered.len());
    for word in lowered.split_whitespace() {
        if !pattern.is_empty() {
            pattern.push(' ');
        }
        // "#####" and "#" describe the same shape
        let mut last_hash = false;
        for c in word.chars() {
            if c == '#' && last_hash {
                continue;
            }
            last_hash = c == '#';
            pattern.push(c);
        }
    }
    pattern
}

pub fn subject_hash(subject: &str) -> String {
    hex::encode(Sha256::digest(subject_pattern(subject).as_bytes()))
}

pub fn build_prompt(message: &MessageMetadata) -> String {
    let payload = serde_json::json!({
        "sender": message.sender_email,
        "sender_name": message.sender_name,
        "domain": message.sender_domain,
        "subject": message.subject,
        "snippet": message.snippet,
        "category": message.category.as_str(),
        "has_unsubscribe": message.headers.has_unsubscribe,
        "is_bulk": message.headers.is_bulk,
        "is_auto_generated": message.headers.is_auto_generated,
    });
    format!("{}\n\nMessage:\n{}", INSTRUCTIONS, payload)
}

/// Parse the model's answer; tolerates code fences around the object
pub fn parse_verdict(text: &str) -> Result<CachedVerdict> {
    let start = text.find('{');
    let end = text.rfind('}');
    let body = match (start, end) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => {
            return Err(TriageError::AssistedError(format!(
                "model answer is not JSON: {}",
                text.chars().take(80).collect::<String>()
            )))
        }
    };

    let verdict: ModelVerdict = serde_json::from_str(body)
        .map_err(|e| TriageError::AssistedError(format!("invalid verdict JSON: {}", e)))?;

    let disposition: Disposition = verdict
        .disposition
        .parse()
        .map_err(|e: TriageError| TriageError::AssistedError(e.to_string()))?;

    if !verdict.confidence.is_finite() {
        return Err(TriageError::AssistedError(
            "verdict confidence is not a number".to_string(),
        ));
    }

    Ok(CachedVerdict {
        disposition,
        confidence: verdict.confidence.clamp(0.0, 1.0),
        reason: verdict.reason,
    })
}

fn to_result(verdict: CachedVerdict, cached: bool) -> ClassificationResult {
    let name = if cached { "assisted_cached" } else { "assisted_model" };
    ClassificationResult {
        disposition: verdict.disposition,
        confidence: verdict.confidence,
        signals: vec![ClassificationSignal::new(name, 0.0, verdict.reason.clone())],
        reason: verdict.reason,
        tier: ClassifierTier::Assisted,
    }
}

pub struct AssistedClassifier {
    model: Arc<dyn LanguageModel>,
    db: Database,
    ttl: chrono::Duration,
    timeout: Duration,
}

impl AssistedClassifier {
    pub fn new(model: Arc<dyn LanguageModel>, db: Database, config: &AssistedConfig) -> Self {
        Self {
            model,
            db,
            ttl: chrono::Duration::days(i64::from(config.cache_ttl_days)),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Classifier for AssistedClassifier {
    async fn classify(&self, message: &MessageMetadata) -> Result<ClassificationResult> {
        let hash = subject_hash(&message.subject);
        let now = Utc::now();

        if let Some(verdict) =
            store::cache::get(&self.db, &message.sender_domain, &hash, self.ttl, now).await?
        {
            debug!(message_id = %message.id, domain = %message.sender_domain, "Assisted cache hit");
            return Ok(to_result(verdict, true));
        }

        let prompt = build_prompt(message);
        let answer = tokio::time::timeout(self.timeout, self.model.complete(&prompt))
            .await
            .map_err(|_| {
                TriageError::AssistedError(format!("model call timed out after {:?}", self.timeout))
            })??;

        let verdict = parse_verdict(&answer)?;

        if let Err(e) =
            store::cache::put(&self.db, &message.sender_domain, &hash, &verdict, now).await
        {
            warn!(message_id = %message.id, "Failed to cache assisted verdict: {}", e);
        }

        Ok(to_result(verdict, false))
    }
}

#[cfg(feature = "ml")]
pub use self::openai::OpenAiModel;

#[cfg(feature = "ml")]
mod openai {
    use async_openai::config::OpenAIConfig;
    use async_openai::types::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    };
    use async_openai::Client;
    use async_trait::async_trait;

    use super::LanguageModel;
    use crate::config::AssistedConfig;
    use crate::error::{Result, TriageError};

    /// Chat-completions backend
    pub struct OpenAiModel {
        client: Client<OpenAIConfig>,
        model: String,
    }

    impl OpenAiModel {
        pub fn new(api_key: &str, model: &str, api_base: Option<&str>) -> Self {
            let mut config = OpenAIConfig::new().with_api_key(api_key);
            if let Some(base) = api_base {
                config = config.with_api_base(base);
            }
            Self {
                client: Client::with_config(config),
                model: model.to_string(),
            }
        }

        /// Reads the API key from the environment variable named in the config
        pub fn from_config(config: &AssistedConfig) -> Result<Self> {
            let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                TriageError::ConfigError(format!(
                    "assisted classification is enabled but {} is not set",
                    config.api_key_env
                ))
            })?;
            Ok(Self::new(&api_key, &config.model, config.api_base.as_deref()))
        }
    }

    fn model_error(e: impl std::fmt::Display) -> TriageError {
        TriageError::AssistedError(e.to_string())
    }

    #[async_trait]
    impl LanguageModel for OpenAiModel {
        async fn complete(&self, prompt: &str) -> Result<String> {
            // The prompt already carries the instructions
            let messages: Vec<ChatCompletionRequestMessage> = vec![
                ChatCompletionRequestUserMessageArgs::default()
                    .content(prompt)
                    .build()
                    .map_err(model_error)?
                    .into(),
            ];

            let request = CreateChatCompletionRequestArgs::default()
                .model(&self.model)
                .temperature(0.0)
                .messages(messages)
                .build()
                .map_err(model_error)?;

            let response = self.client.chat().create(request).await.map_err(model_error)?;

            response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .ok_or_else(|| TriageError::AssistedError("empty model response".to_string()))
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ListHeaders, MessageCategory};
    use mockall::mock;

    mock! {
        Model {}

        #[async_trait]
        impl LanguageModel for Model {
            async fn complete(&self, prompt: &str) -> Result<String>;
        }
    }

    struct SlowModel;

    #[async_trait]
    impl LanguageModel for SlowModel {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(String::new())
        }
    }

    fn message(subject: &str) -> MessageMetadata {
        MessageMetadata {
            id: "m1".to_string(),
            thread_id: "t1".to_string(),
            sender_email: "digest@news.example.com".to_string(),
            sender_domain: "news.example.com".to_string(),
            sender_name: "News".to_string(),
            subject: subject.to_string(),
            snippet: "Top stories this week".to_string(),
            labels: vec!["INBOX".to_string()],
            category: MessageCategory::Updates,
            headers: ListHeaders {
                has_unsubscribe: true,
                ..Default::default()
            },
            date_received: Utc::now(),
        }
    }

    #[test]
    fn test_subject_pattern() {
        assert_eq!(subject_pattern("Issue 123:  Weekly\tDigest"), "issue #: weekly digest");
        assert_eq!(subject_pattern("Issue 124: Weekly Digest"), "issue #: weekly digest");
        assert_eq!(subject_hash("Order 55 shipped"), subject_hash("ORDER 9012 shipped"));
        assert_ne!(subject_hash("Order shipped"), subject_hash("Order delayed"));
    }

    #[test]
    fn test_prompt_has_metadata_only() {
        let prompt = build_prompt(&message("Weekly digest"));
        assert!(prompt.contains("news.example.com"));
        assert!(prompt.contains("\"has_unsubscribe\":true"));
        assert!(!prompt.contains("body"));
    }

    #[test]
    fn test_parse_verdict() {
        let fenced = r#"```json
{"disposition":"Trash","confidence":1.4,"reason":"spam"}
```"#;
        let verdict = parse_verdict(fenced).unwrap();
        assert_eq!(verdict.disposition, Disposition::Trash);
        assert_eq!(verdict.confidence, 1.0);

        assert!(parse_verdict("I think archive").is_err());
        assert!(parse_verdict("{\"disposition\":\"delete\",\"confidence\":0.9}").is_err());
        assert!(parse_verdict("{\"confidence\":0.9}").is_err());
    }

    #[tokio::test]
    async fn test_model_called_once_per_pattern() {
        let db = Database::open_in_memory().await.unwrap();
        let mut model = MockModel::new();
        model.expect_complete().times(1).returning(|_| {
            let reply = r#"{"disposition":"archive","confidence":0.92,"reason":"weekly digest"}"#;
            Ok(reply.to_string())
        });

        let classifier = AssistedClassifier::new(Arc::new(model), db, &AssistedConfig::default());

        let first = classifier.classify(&message("Issue 41: Weekly digest")).await.unwrap();
        assert_eq!(first.disposition, Disposition::Archive);
        assert_eq!(first.tier, ClassifierTier::Assisted);
        assert_eq!(first.signals[0].name, "assisted_model");

        // Same domain and subject shape hits the cache
        let second = classifier.classify(&message("Issue 42: Weekly digest")).await.unwrap();
        assert_eq!(second.disposition, Disposition::Archive);
        assert_eq!(second.signals[0].name, "assisted_cached");
    }

    #[tokio::test]
    async fn test_invalid_answer_is_not_cached() {
        let db = Database::open_in_memory().await.unwrap();
        let mut model = MockModel::new();
        model
            .expect_complete()
            .times(2)
            .returning(|_| Ok("not sure".to_string()));

        let classifier = AssistedClassifier::new(Arc::new(model), db, &AssistedConfig::default());

        assert!(matches!(
            classifier.classify(&message("Hello")).await,
            Err(TriageError::AssistedError(_))
        ));
        assert!(classifier.classify(&message("Hello")).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout() {
        let db = Database::open_in_memory().await.unwrap();
        let classifier =
            AssistedClassifier::new(Arc::new(SlowModel), db, &AssistedConfig::default())
            .with_timeout(Duration::from_millis(50));

        let err = classifier.classify(&message("Hello")).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
