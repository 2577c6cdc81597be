//! Usage monitoring client for the Cloud Monitoring time series API
//!
//! Sums the translate net-usage quota metric for an account's project over
//! the requested interval. A 404 from the API means the project has no
//! metric yet this month and maps to `MonitorError::NotFound`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::account::Account;
use crate::credentials::CredentialMaterial;
use crate::{BoxFuture, MonitorError, UsageMonitor};

/// Default Cloud Monitoring endpoint.
pub const DEFAULT_MONITORING_URL: &str = "https://monitoring.googleapis.com";

/// Filter selecting billed translation characters.
pub const USAGE_METRIC_FILTER: &str = concat!(
    r#"metric.type = "serviceruntime.googleapis.com/quota/rate/net_usage" AND "#,
    r#"resource.type = "consumer_quota" AND "#,
    r#"resource.label.service = "translate.googleapis.com" AND "#,
    r#"metric.label.quota_metric = "translate.googleapis.com/default""#,
);

/// Upper bound on followed pages, guards against a server that never stops paginating.
const MAX_PAGES: usize = 50;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTimeSeriesResponse {
    #[serde(default)]
    time_series: Vec<TimeSeries>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct TimeSeries {
    #[serde(default)]
    points: Vec<Point>,
}

#[derive(Deserialize)]
struct Point {
    value: TypedValue,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypedValue {
    /// The API encodes int64 values as JSON strings.
    #[serde(default)]
    int64_value: Option<serde_json::Value>,
}

fn point_value(value: &TypedValue) -> Result<u64, MonitorError> {
    match &value.int64_value {
        None => Ok(0),
        Some(serde_json::Value::String(s)) => s
            .parse::<u64>()
            .map_err(|e| MonitorError::Parse(format!("int64Value {s:?}: {e}"))),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| MonitorError::Parse(format!("int64Value {n} is not a u64"))),
        Some(other) => Err(MonitorError::Parse(format!("unexpected int64Value {other}"))),
    }
}

/// Reads authoritative character usage per account.
pub struct HttpUsageMonitor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUsageMonitor {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl UsageMonitor for HttpUsageMonitor {
    fn query_usage<'a>(
        &'a self,
        account: &'a Account,
        month_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<u64, MonitorError>> {
        Box::pin(async move {
            let material = CredentialMaterial::load(account)
                .await
                .map_err(MonitorError::Credential)?;
            let project = material.project_for(account);
            let url = format!("{}/v3/projects/{project}/timeSeries", self.base_url);
            let start = month_start.to_rfc3339_opts(SecondsFormat::Secs, true);
            let end = now.to_rfc3339_opts(SecondsFormat::Secs, true);

            let mut total = 0u64;
            let mut page_token: Option<String> = None;

            for _ in 0..MAX_PAGES {
                let mut query: Vec<(&str, &str)> = vec![
                    ("filter", USAGE_METRIC_FILTER),
                    ("interval.startTime", start.as_str()),
                    ("interval.endTime", end.as_str()),
                    ("view", "FULL"),
                ];
                if let Some(token) = page_token.as_deref() {
                    query.push(("pageToken", token));
                }

                let response = self
                    .client
                    .get(&url)
                    .header("x-goog-api-key", material.api_key.expose().as_str())
                    .query(&query)
                    .send()
                    .await
                    .map_err(|e| MonitorError::Http(e.to_string()))?;

                let status = response.status();
                if status == reqwest::StatusCode::NOT_FOUND {
                    return Err(MonitorError::NotFound);
                }
                if !status.is_success() {
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| String::from("<no body>"));
                    return Err(MonitorError::Upstream {
                        status: status.as_u16(),
                        body,
                    });
                }

                let page: ListTimeSeriesResponse = response
                    .json()
                    .await
                    .map_err(|e| MonitorError::Parse(e.to_string()))?;

                for series in &page.time_series {
                    for point in &series.points {
                        total = total.saturating_add(point_value(&point.value)?);
                    }
                }

                match page.next_page_token.filter(|t| !t.is_empty()) {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }

            debug!(account_id = %account.id, project, total, "queried provider usage");
            Ok(total)
        })
    }
}
