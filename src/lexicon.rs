use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub const CITY_PLACEHOLDER: &str = "{city}";

const DEFAULT_STOP_WORDS: &[&str] = &[
    "у", "в", "во", "на", "к", "от", "до", "за", "под", "над", "около", "возле", "рядом",
    "рядомс", "рядом-с", "рядом_с", "со", "с", "по", "через", "после", "перед", "там", "тут",
    "здесь", "сегодня", "вчера", "сейчас", "стоит", "стоят", "стоял", "стояли", "едет", "едут",
    "поехал", "поехали", "движется", "движ", "чисто", "нет", "нету", "пусто", "пустая",
    "пустой", "машина", "тачка", "авто",
];

const DEFAULT_PREPOSITIONS: &[&str] = &["в", "во", "на", "у", "около", "возле", "рядом с", "рядом"];

const DEFAULT_ADMIN_KEYWORDS: &[&str] = &["администра", "мэр", "совет"];

const DEFAULT_ADMIN_TEMPLATE: &str = "Администрация {city}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lexicon {
    pub stop_words: Vec<String>,
    pub prepositions: Vec<String>,
    // Lower-case stems.
    pub admin_keywords: Vec<String>,
    pub admin_fallback_template: String,
    #[serde(skip)]
    stop_index: HashSet<String>,
}

impl Default for Lexicon {
    fn default() -> Self {
        Self::new(
            DEFAULT_STOP_WORDS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_PREPOSITIONS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_ADMIN_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_ADMIN_TEMPLATE.to_string(),
        )
    }
}

impl Lexicon {
    pub fn new(
        stop_words: Vec<String>,
        prepositions: Vec<String>,
        admin_keywords: Vec<String>,
        admin_fallback_template: String,
    ) -> Self {
        let mut lexicon = Self {
            stop_words,
            prepositions,
            admin_keywords,
            admin_fallback_template,
            stop_index: HashSet::new(),
        };
        lexicon.reindex();
        lexicon
    }

    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = fs::read_to_string(path)?;
        let mut lexicon: Lexicon = serde_json::from_str(&contents)?;
        if !lexicon.admin_fallback_template.contains(CITY_PLACEHOLDER) {
            return Err(AppError::Config(format!(
                "lexicon admin_fallback_template must contain {CITY_PLACEHOLDER}"
            )));
        }
        lexicon.reindex();
        info!(
            target: "lexicon",
            path = %path.display(),
            stop_words = lexicon.stop_words.len(),
            prepositions = lexicon.prepositions.len(),
            "loaded lexicon table"
        );
        Ok(lexicon)
    }

    fn reindex(&mut self) {
        self.stop_index = self.stop_words.iter().map(|w| w.to_lowercase()).collect();
        self.admin_keywords = self.admin_keywords.iter().map(|w| w.to_lowercase()).collect();
    }

    pub fn is_stop_word(&self, word: &str) -> bool {
        self.stop_index.contains(&word.to_lowercase())
    }

    pub fn mentions_admin(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.admin_keywords
            .iter()
            .any(|keyword| !keyword.is_empty() && lowered.contains(keyword.as_str()))
    }

    pub fn admin_fallback_query(&self, city_name: &str) -> String {
        self.admin_fallback_template
            .replace(CITY_PLACEHOLDER, city_name)
    }
}
