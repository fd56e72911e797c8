//! [`TableApi`] over a Sheets-style values REST API.
//!
//! | Operation | Request |
//! |---|---|
//! | `get` | `GET {base}/values/{range}` |
//! | `batch_get` | `GET {base}/values:batchGet?ranges=..&ranges=..` |
//! | `append` | `POST {base}/values/{range}:append` |
//! | `batch_update` | `POST {base}/values:batchUpdate` |
//!
//! Values are read unformatted and written raw. Non-2xx responses become
//! a [`RemoteStatus`] carrying the HTTP status and body; transport and
//! decode failures use [`TRANSPORT_FAILURE`].

use crate::services::{AppendResult, RemoteStatus, TableApi, ValueRange, TRANSPORT_FAILURE};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{RequestBuilder, Url};
use rowkeep_core::{A1Range, ConfigError, TableConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const VALUE_RENDER_OPTION: (&str, &str) = ("valueRenderOption", "UNFORMATTED_VALUE");
const VALUE_INPUT_RAW: &str = "RAW";

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchGetResponse {
    #[serde(default)]
    value_ranges: Vec<WireValueRange>,
}

#[derive(Debug, Serialize)]
struct AppendRequest<'a> {
    values: &'a [Vec<Value>],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendUpdates {
    updated_range: String,
    #[serde(default)]
    updated_rows: u32,
}

#[derive(Debug, Deserialize)]
struct AppendResponse {
    updates: AppendUpdates,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateRequest<'a> {
    value_input_option: &'static str,
    data: Vec<WireUpdate<'a>>,
}

#[derive(Debug, Serialize)]
struct WireUpdate<'a> {
    range: String,
    values: &'a [Vec<Value>],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateResponse {
    #[serde(default)]
    total_updated_cells: u32,
}

// ============================================================================
// CLIENT
// ============================================================================

/// HTTP implementation of [`TableApi`].
#[derive(Debug, Clone)]
pub struct HttpTableApi {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTableApi {
    /// Build from `table.base_url`, `table.access_token` and
    /// `table.request_timeout_ms`.
    pub fn from_config(config: &TableConfig) -> Result<Self, ConfigError> {
        let raw = config
            .base_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "table.base_url".to_string(),
            })?;
        let base_url = Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
            field: "table.base_url".to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::InvalidValue {
                field: "table.base_url".to_string(),
                value: raw.to_string(),
                reason: "URL cannot carry a path".to_string(),
            });
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = &config.access_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
                ConfigError::InvalidValue {
                    field: "table.access_token".to_string(),
                    value: "<redacted>".to_string(),
                    reason: e.to_string(),
                }
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "table".to_string(),
                value: raw.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self { client, base_url })
    }

    /// `base_url` with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<T, RemoteStatus> {
        let response = request.send().await.map_err(|e| {
            tracing::warn!(operation, error = %e, "Table request failed in transport");
            RemoteStatus::transport(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteStatus::new(status.as_u16(), body));
        }
        response.json::<T>().await.map_err(|e| {
            RemoteStatus::new(
                TRANSPORT_FAILURE,
                format!("undecodable {} response: {}", operation, e),
            )
        })
    }
}

#[async_trait]
impl TableApi for HttpTableApi {
    async fn get(&self, range: &A1Range) -> Result<ValueRange, RemoteStatus> {
        let url = self.url(&["values", &range.to_string()]);
        let request = self.client.get(url).query(&[VALUE_RENDER_OPTION]);
        let wire: WireValueRange = self.send("get", request).await?;
        Ok(ValueRange::new(range.clone(), wire.values))
    }

    async fn batch_get(&self, ranges: &[A1Range]) -> Result<Vec<ValueRange>, RemoteStatus> {
        let mut query: Vec<(&str, String)> =
            ranges.iter().map(|r| ("ranges", r.to_string())).collect();
        query.push((VALUE_RENDER_OPTION.0, VALUE_RENDER_OPTION.1.to_string()));

        let request = self.client.get(self.url(&["values:batchGet"])).query(&query);
        let wire: BatchGetResponse = self.send("batch_get", request).await?;
        if wire.value_ranges.len() != ranges.len() {
            return Err(RemoteStatus::new(
                TRANSPORT_FAILURE,
                format!(
                    "batch_get returned {} ranges for {} requested",
                    wire.value_ranges.len(),
                    ranges.len()
                ),
            ));
        }
        Ok(ranges
            .iter()
            .zip(wire.value_ranges)
            .map(|(range, wire)| ValueRange::new(range.clone(), wire.values))
            .collect())
    }

    async fn append(
        &self,
        range: &A1Range,
        rows: &[Vec<Value>],
    ) -> Result<AppendResult, RemoteStatus> {
        let url = self.url(&["values", &format!("{}:append", range)]);
        let request = self
            .client
            .post(url)
            .query(&[
                ("valueInputOption", VALUE_INPUT_RAW),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .json(&AppendRequest { values: rows });
        let wire: AppendResponse = self.send("append", request).await?;
        Ok(AppendResult {
            updated_range: wire.updates.updated_range,
            updated_rows: wire.updates.updated_rows,
        })
    }

    async fn batch_update(&self, updates: &[ValueRange]) -> Result<u32, RemoteStatus> {
        let body = batch_update_body(updates);
        let request = self
            .client
            .post(self.url(&["values:batchUpdate"]))
            .json(&body);
        let wire: BatchUpdateResponse = self.send("batch_update", request).await?;
        Ok(wire.total_updated_cells)
    }
}

fn batch_update_body(updates: &[ValueRange]) -> BatchUpdateRequest<'_> {
    BatchUpdateRequest {
        value_input_option: VALUE_INPUT_RAW,
        data: updates
            .iter()
            .map(|u| WireUpdate {
                range: u.range.to_string(),
                values: &u.values,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowkeep_core::Column;
    use serde_json::json;

    fn api(base: &str) -> HttpTableApi {
        HttpTableApi::from_config(&TableConfig {
            base_url: Some(base.to_string()),
            access_token: Some("token".to_string()),
            ..TableConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_from_config_requires_base_url() {
        let err = HttpTableApi::from_config(&TableConfig::default()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingRequired {
                field: "table.base_url".to_string()
            }
        );

        let err = HttpTableApi::from_config(&TableConfig {
            base_url: Some("not a url".to_string()),
            ..TableConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_urls_append_encoded_segments() {
        let api = api("https://sheets.example.com/v4/spreadsheets/abc/");
        let range = A1Range::full_row("Records", 2);
        assert_eq!(
            api.url(&["values", &range.to_string()]).as_str(),
            "https://sheets.example.com/v4/spreadsheets/abc/values/Records!A2:E2"
        );
        assert_eq!(
            api.url(&["values:batchGet"]).as_str(),
            "https://sheets.example.com/v4/spreadsheets/abc/values:batchGet"
        );
        assert!(api
            .url(&["values", "A b!A1:E"])
            .as_str()
            .ends_with("/values/A%20b!A1:E"));
    }

    #[test]
    fn test_batch_update_body_shape() {
        let updates = vec![ValueRange::new(
            A1Range::row_span("Records", 3, Column::Payload, Column::LastModified),
            vec![vec![json!("{}"), json!("2024-01-01T00:00:00.000Z")]],
        )];
        let body = serde_json::to_value(batch_update_body(&updates)).unwrap();
        assert_eq!(
            body,
            json!({
                "valueInputOption": "RAW",
                "data": [{
                    "range": "Records!D3:E3",
                    "values": [["{}", "2024-01-01T00:00:00.000Z"]]
                }]
            })
        );
    }

    #[test]
    fn test_response_decoding() {
        let empty: WireValueRange =
            serde_json::from_value(json!({"range": "Records!A2:B", "majorDimension": "ROWS"}))
                .unwrap();
        assert!(empty.values.is_empty());

        let batch: BatchGetResponse = serde_json::from_value(json!({
            "spreadsheetId": "abc",
            "valueRanges": [
                {"range": "Records!A2:E2", "values": [["u1", "a@x.com", true]]},
                {"range": "Records!A3:E3"}
            ]
        }))
        .unwrap();
        assert_eq!(batch.value_ranges.len(), 2);
        assert_eq!(batch.value_ranges[0].values[0][2], json!(true));

        let append: AppendResponse = serde_json::from_value(json!({
            "spreadsheetId": "abc",
            "tableRange": "Records!A1:E4",
            "updates": {"updatedRange": "Records!A5:E5", "updatedRows": 1, "updatedCells": 5}
        }))
        .unwrap();
        assert_eq!(append.updates.updated_range, "Records!A5:E5");
        assert_eq!(append.updates.updated_rows, 1);

        let update: BatchUpdateResponse =
            serde_json::from_value(json!({"totalUpdatedCells": 2, "responses": []})).unwrap();
        assert_eq!(update.total_updated_cells, 2);
    }
}
