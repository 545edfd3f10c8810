use std::future::Future;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use common::FileRecord;

use crate::verify::{ClassificationRequest, ClassificationResponse, Classifier, VerifyError};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// `generateContent` client constrained to JSON output.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

/// Tags proposed for a single file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SuggestedTags {
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub album_artist: Option<String>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiClient {
    pub fn new(client: Client, api_key: &str, model: &str) -> Result<Self, VerifyError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(VerifyError::MissingApiKey);
        }
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.to_string(),
            model: model.trim().to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        )
    }

    async fn generate<T: DeserializeOwned>(&self, prompt: String) -> Result<T, VerifyError> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "responseMimeType": "application/json" },
        });
        let response = self.client.post(self.endpoint()).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(VerifyError::Api(format!("http {}: {}", status, truncate(&detail, 200))));
        }
        let payload = response.json::<GenerateResponse>().await?;
        let text = payload
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.text)
            .ok_or(VerifyError::EmptyResponse)?;
        Ok(serde_json::from_str(strip_fences(&text))?)
    }

    pub async fn suggest_tags(&self, record: &FileRecord) -> Result<SuggestedTags, VerifyError> {
        let prompt = format!(
            "Analyze this music file filename and suggest correct metadata tags.\n\
             Filename: {}\n\
             Current Tags: Artist={}, Title={}, Album={}\n\n\
             Return ONLY JSON:\n\
             {{\"artist\": \"string\", \"title\": \"string\", \"album\": \"string (optional)\", \"album_artist\": \"string (optional)\"}}",
            record.filename, record.artist, record.title, record.album
        );
        self.generate(prompt).await
    }
}

impl Classifier for GeminiClient {
    fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> impl Future<Output = Result<ClassificationResponse, VerifyError>> + Send {
        let prompt = serde_json::to_string(request).map(|payload| duplicate_prompt(&payload));
        async move { self.generate(prompt?).await }
    }
}

fn duplicate_prompt(payload: &str) -> String {
    format!(
        "Identify duplicates in these music file groups. Rules:\n\
         1. Different extensions of same song -> DUPLICATE\n\
         2. \"Live\", \"Remix\" versions -> DUPLICATE\n\
         3. Completely different songs -> NOT DUPLICATE\n\
         For duplicates pick the best file (highest quality, cleanest name) by its id.\n\
         Input: {}\n\
         Return ONLY JSON: {{\"results\": [{{\"group_id\": int, \"is_duplicate\": bool, \"best_file_id\": int or null, \"duplicate_ids\": [int], \"reason\": \"string\"}}]}}",
        payload
    )
}

/// Removes a surrounding markdown code fence, if any.
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n[]\n```  "), "[]");
        assert_eq!(strip_fences("  {\"results\":[]} "), "{\"results\":[]}");
    }

    #[test]
    fn missing_key_is_rejected() {
        let result = GeminiClient::new(Client::new(), "  ", "gemini-1.5-flash");
        assert!(matches!(result, Err(VerifyError::MissingApiKey)));
    }

    #[test]
    fn endpoint_includes_model_and_key() {
        let client = GeminiClient::new(Client::new(), "k3y", "gemini-1.5-flash")
            .unwrap()
            .with_base_url("http://localhost:9/");
        assert_eq!(
            client.endpoint(),
            "http://localhost:9/v1beta/models/gemini-1.5-flash:generateContent?key=k3y"
        );
    }

    #[test]
    fn model_text_parses_with_defaults() {
        let text = "```json\n{\"results\":[{\"group_id\":2,\"is_duplicate\":true}]}\n```";
        let parsed: ClassificationResponse = serde_json::from_str(strip_fences(text)).unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(parsed.results[0].group_id, 2);
        assert_eq!(parsed.results[0].best_file_id, None);
        assert!(parsed.results[0].duplicate_ids.is_empty());

        let tags: SuggestedTags = serde_json::from_str(r#"{"artist":"A","title":"T"}"#).unwrap();
        assert_eq!(tags.album, None);
        assert_eq!(tags.artist.as_deref(), Some("A"));
    }

    #[test]
    fn prompt_embeds_request_payload() {
        let prompt = duplicate_prompt("{\"groups\":[]}");
        assert!(prompt.contains("Input: {\"groups\":[]}"));
        assert!(prompt.contains("\"best_file_id\""));
    }
}
