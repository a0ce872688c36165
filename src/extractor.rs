use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::diagnostics::DiagnosticSink;
use crate::errors::{AppError, AppResult};
use crate::lexicon::Lexicon;

pub const MAX_CANDIDATES: usize = 3;

const TOKEN_CLASS: &str = r"[A-Za-zА-Яа-яЁё0-9\-]";
const TRIM_CHARS: &[char] = &[
    ',', '.', '!', '?', ':', ';', '"', '\'', '(', ')', '[', ']', '{', '}',
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidates {
    pub objects: Vec<String>,
    pub areas: Vec<String>,
}

impl Candidates {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.areas.is_empty()
    }

    fn truncated(mut self) -> Self {
        self.objects.truncate(MAX_CANDIDATES);
        self.areas.truncate(MAX_CANDIDATES);
        self
    }
}

pub fn clean_token(raw: &str) -> String {
    raw.trim().trim_matches(TRIM_CHARS).trim().to_string()
}

pub struct HeuristicExtractor {
    lexicon: Arc<Lexicon>,
    area_pattern: Option<Regex>,
    word_pattern: Regex,
}

impl HeuristicExtractor {
    pub fn new(lexicon: Arc<Lexicon>) -> AppResult<Self> {
        let area_pattern = build_area_pattern(&lexicon.prepositions)?;
        let word_pattern = Regex::new(&format!("{TOKEN_CLASS}{{2,}}"))
            .map_err(|err| AppError::Config(format!("invalid token pattern: {err}")))?;
        Ok(Self {
            lexicon,
            area_pattern,
            word_pattern,
        })
    }

    pub fn extract(&self, text: &str) -> Candidates {
        let text = text.trim();
        if text.is_empty() {
            return Candidates::default();
        }
        let lowered = text.to_lowercase();

        let mut areas = Vec::new();
        if let Some(pattern) = &self.area_pattern {
            for captures in pattern.captures_iter(&lowered) {
                let Some(found) = captures.get(1) else {
                    continue;
                };
                let area = clean_token(found.as_str());
                if !area.is_empty() && !self.lexicon.is_stop_word(&area) {
                    areas.push(area);
                }
            }
        }

        let mut tokens: Vec<String> = self
            .word_pattern
            .find_iter(&lowered)
            .map(|m| clean_token(m.as_str()))
            .filter(|token| !token.is_empty() && !self.lexicon.is_stop_word(token))
            .collect();

        if tokens.is_empty() {
            if let Some(first) = lowered.split_whitespace().next() {
                let first = clean_token(first);
                if !first.is_empty() && !self.lexicon.is_stop_word(&first) {
                    tokens.push(first);
                }
            }
        }

        let objects = tokens
            .into_iter()
            .filter(|token| !areas.contains(token))
            .collect();

        Candidates { objects, areas }.truncated()
    }

    // `None` sends the caller to the heuristic.
    pub fn normalize_model_output(&self, value: &Value) -> Option<Candidates> {
        let object = value.as_object()?;
        let objects = self.normalize_entries(object.get("objects"));
        let areas = self.normalize_entries(object.get("areas"));
        let candidates = Candidates { objects, areas };
        if candidates.is_empty() {
            return None;
        }
        Some(candidates.truncated())
    }

    fn normalize_entries(&self, value: Option<&Value>) -> Vec<String> {
        let Some(entries) = value.and_then(Value::as_array) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|entry| match entry {
                Value::String(text) => Some(clean_token(text)),
                Value::Number(number) => Some(clean_token(&number.to_string())),
                Value::Bool(flag) => Some(flag.to_string()),
                _ => None,
            })
            .filter(|entry| !entry.is_empty() && !self.lexicon.is_stop_word(entry))
            .collect()
    }
}

fn build_area_pattern(prepositions: &[String]) -> AppResult<Option<Regex>> {
    let mut alternatives: Vec<String> = prepositions
        .iter()
        .map(|p| {
            p.split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+")
        })
        .filter(|p| !p.is_empty())
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    // Longer phrases first so "рядом с X" wins over "рядом".
    alternatives.sort_by_key(|p| std::cmp::Reverse(p.chars().count()));
    alternatives.dedup();

    let pattern = format!(
        r"(?i)\b(?:{})\s+({TOKEN_CLASS}{{2,}})",
        alternatives.join("|")
    );
    Regex::new(&pattern)
        .map(Some)
        .map_err(|err| AppError::Config(format!("invalid preposition table: {err}")))
}

#[async_trait]
pub trait CandidateModel: Send + Sync {
    async fn propose(&self, text: &str) -> AppResult<Value>;
}

pub struct OpenAiChatModel {
    http: Client,
    base_url: String,
    model: String,
    api_key: SecretString,
}

impl OpenAiChatModel {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: SecretString,
        timeout: Duration,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("chatmap/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl CandidateModel for OpenAiChatModel {
    async fn propose(&self, text: &str) -> AppResult<Value> {
        #[derive(Deserialize)]
        struct Response {
            choices: Vec<Choice>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }

        #[derive(Deserialize)]
        struct Message {
            content: Option<String>,
        }

        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": build_prompt(text) }],
            "temperature": 0.1,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AppError::Extraction("model returned no content".into()))?;

        Ok(serde_json::from_str(strip_code_fences(&content))?)
    }
}

fn build_prompt(text: &str) -> String {
    format!(
        "Extract geocoding candidates from the chat message below.\n\
         Reply with JSON only, exactly in this shape:\n\
         {{\"objects\": [\"what to find on a map: shop, cafe, landmark, settlement\"], \
         \"areas\": [\"locality qualifier: district, village, abbreviation\"]}}\n\
         Rules:\n\
         - a short phrase like \"электричка стоят\" must put \"электричка\" into objects;\n\
         - \"у балково\" must put \"балково\" into areas;\n\
         - keep abbreviations exactly as written;\n\
         - prefer proposing a candidate over returning empty lists.\n\n\
         Message: {text}"
    )
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

/// Model-first extraction that degrades to the heuristic and never fails.
pub struct CandidateExtractor {
    heuristic: HeuristicExtractor,
    model: Option<Arc<dyn CandidateModel>>,
    diagnostics: DiagnosticSink,
}

impl CandidateExtractor {
    pub fn new(
        lexicon: Arc<Lexicon>,
        model: Option<Arc<dyn CandidateModel>>,
        diagnostics: DiagnosticSink,
    ) -> AppResult<Self> {
        Ok(Self {
            heuristic: HeuristicExtractor::new(lexicon)?,
            model,
            diagnostics,
        })
    }

    pub fn from_config(
        config: &AppConfig,
        lexicon: Arc<Lexicon>,
        diagnostics: DiagnosticSink,
    ) -> AppResult<Self> {
        let model = match config.model_api_key.clone() {
            Some(key) => Some(Arc::new(OpenAiChatModel::new(
                config.model_base_url.clone(),
                config.model_name.clone(),
                key,
                config.http_timeout(),
            )?) as Arc<dyn CandidateModel>),
            None => None,
        };
        Self::new(lexicon, model, diagnostics)
    }

    pub async fn extract(&self, text: &str) -> Candidates {
        let text = text.trim();
        if text.is_empty() {
            return Candidates::default();
        }

        let Some(model) = &self.model else {
            return self.heuristic.extract(text);
        };

        let reason = match model.propose(text).await {
            Ok(value) => match self.heuristic.normalize_model_output(&value) {
                Some(candidates) => {
                    debug!(?candidates, "model proposed candidates");
                    return candidates;
                }
                None => "model proposed no usable candidates".to_string(),
            },
            Err(err) => err.to_string(),
        };

        warn!(%reason, "candidate model unavailable; using heuristic");
        self.diagnostics
            .emit("extractor_fallback", json!({ "reason": reason }));
        self.heuristic.extract(text)
    }
}
