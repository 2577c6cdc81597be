//! Translation client for the Cloud Translation v2 REST API
//!
//! One `HttpTranslator` is built per account by `HttpTranslatorFactory`. The
//! API key travels in the `x-goog-api-key` header so it never appears in
//! request URLs or in reqwest error messages.

use std::sync::Arc;

use common::Secret;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::credentials::CredentialMaterial;
use crate::{BoxFuture, Result, Translation, TranslationError, Translator, TranslatorFactory};

/// Default Cloud Translation endpoint.
pub const DEFAULT_TRANSLATE_URL: &str = "https://translation.googleapis.com";

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Map a requested target language to the code the API expects.
///
/// Traditional Chinese is requested as the generic `zh` code.
pub fn effective_target(target: &str) -> &str {
    match target {
        "zh-TW" => "zh",
        other => other,
    }
}

/// Whether two language tags share the same primary subtag (`en-US` ~ `en`).
pub fn same_language(a: &str, b: &str) -> bool {
    let primary = |tag: &str| tag.split('-').next().unwrap_or("").to_ascii_lowercase();
    let (a, b) = (primary(a), primary(b));
    !a.is_empty() && a == b
}

/// Builds `HttpTranslator` instances from account credentials.
pub struct HttpTranslatorFactory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTranslatorFactory {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl TranslatorFactory for HttpTranslatorFactory {
    fn configure<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<Arc<dyn Translator>>> {
        Box::pin(async move {
            let material = CredentialMaterial::load(account)
                .await
                .map_err(TranslationError::Credential)?;
            info!(
                account_id = %account.id,
                source = %account.credential.describe(),
                "translation client configured"
            );
            let translator: Arc<dyn Translator> = Arc::new(HttpTranslator {
                account_id: account.id.clone(),
                client: self.client.clone(),
                endpoint: format!("{}/language/translate/v2", self.base_url),
                api_key: material.api_key,
            });
            Ok(translator)
        })
    }
}

/// Immutable translation client bound to one account's API key.
pub struct HttpTranslator {
    account_id: String,
    client: reqwest::Client,
    endpoint: String,
    api_key: Secret<String>,
}

#[derive(Deserialize)]
struct TranslateResponse {
    data: TranslateData,
}

#[derive(Deserialize)]
struct TranslateData {
    #[serde(default)]
    translations: Vec<TranslatedItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslatedItem {
    translated_text: String,
    #[serde(default)]
    detected_source_language: Option<String>,
}

impl Translator for HttpTranslator {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn translate<'a>(
        &'a self,
        text: &'a str,
        target: &'a str,
        source: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Translation>> {
        Box::pin(async move {
            let target = effective_target(target);

            if let Some(src) = source
                && same_language(src, target)
            {
                debug!(source = src, target, "source and target match, skipping remote call");
                return Ok(Translation {
                    text: text.to_string(),
                    detected_source_language: Some(src.to_string()),
                });
            }

            let mut body = serde_json::json!({
                "q": [text],
                "target": target,
                "format": "text",
            });
            if let Some(src) = source {
                body["source"] = serde_json::Value::String(src.to_string());
            }

            let response = self
                .client
                .post(&self.endpoint)
                .header(API_KEY_HEADER, self.api_key.expose().as_str())
                .json(&body)
                .send()
                .await
                .map_err(|e| TranslationError::Http(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                warn!(account_id = %self.account_id, status = status.as_u16(), "translation request rejected");
                return Err(TranslationError::Upstream {
                    status: status.as_u16(),
                    body,
                });
            }

            let parsed: TranslateResponse = response
                .json()
                .await
                .map_err(|e| TranslationError::Http(format!("decoding translation response: {e}")))?;

            let item = parsed
                .data
                .translations
                .into_iter()
                .next()
                .ok_or(TranslationError::EmptyResponse)?;

            Ok(Translation {
                text: item.translated_text,
                detected_source_language: item
                    .detected_source_language
                    .or_else(|| source.map(str::to_string)),
            })
        })
    }
}
