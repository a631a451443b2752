//! HTTP JSON market-data provider.
//!
//! Speaks a simple row-oriented JSON protocol: one GET per batch, response
//! body `{ "rows": [ { "entity_id", "date", <field>: <f64>, ... } ] }` or
//! `{ "error": { "code", "message" } }`. Status classification feeds the
//! fetcher's retry policy; this provider itself never retries.

use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::provider::{BatchRequest, MarketDataProvider, ProviderError};
use crate::frame::FactorFrame;

#[derive(Debug, Deserialize)]
struct TableResponse {
    rows: Option<Vec<RowRecord>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RowRecord {
    entity_id: String,
    date: NaiveDate,
    #[serde(flatten)]
    values: BTreeMap<String, f64>,
}

/// Provider backed by an HTTP table endpoint.
pub struct HttpProvider {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("ranklab/0.1")
            .build()
            .expect("failed to build HTTP client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    fn table_url(&self, request: &BatchRequest<'_>) -> String {
        let entities = request.entities.join(",");
        let fields = request.fields.join(",");
        let mut url = format!(
            "{}/table/{}?entities={}&fields={}",
            self.base_url.trim_end_matches('/'),
            request.descriptor.name,
            entities,
            fields
        );
        for (name, value) in request.params {
            url.push('&');
            url.push_str(name);
            url.push('=');
            url.push_str(value);
        }
        url
    }

    fn parse_response(
        request: &BatchRequest<'_>,
        response: TableResponse,
    ) -> Result<FactorFrame, ProviderError> {
        if let Some(err) = response.error {
            return Err(match err.code.as_str() {
                "unknown_entity" => ProviderError::UnknownEntity(err.message),
                _ => ProviderError::Rejected(format!("{}: {}", err.code, err.message)),
            });
        }

        let rows = response
            .rows
            .ok_or_else(|| ProviderError::SchemaMismatch("neither rows nor error".into()))?;

        let mut frame = FactorFrame::new();
        for row in rows {
            let values: BTreeMap<String, f64> = request
                .fields
                .iter()
                .filter_map(|f| row.values.get(f).map(|v| (f.clone(), *v)))
                .collect();
            frame.push_row(&row.entity_id, row.date, &values);
        }

        // Every requested field must come back as a column, even if sparse.
        for field in request.fields {
            if frame.column(field).is_none() && !frame.is_empty() {
                return Err(ProviderError::SchemaMismatch(format!(
                    "field '{field}' missing from response"
                )));
            }
        }

        Ok(frame)
    }
}

impl MarketDataProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch_batch(&self, request: &BatchRequest<'_>) -> Result<FactorFrame, ProviderError> {
        let url = self.table_url(request);

        let response = match self.client.get(&url).send() {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return Err(ProviderError::Timeout(e.to_string()))
            }
            Err(e) => return Err(ProviderError::Unavailable(e.to_string())),
        };

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30);
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if status.is_server_error() {
            return Err(ProviderError::Unavailable(format!("HTTP {status}")));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::Rejected(format!(
                "no such table '{}'",
                request.descriptor.name
            )));
        }
        if status.is_client_error() {
            return Err(ProviderError::Rejected(format!("HTTP {status}")));
        }

        let body: TableResponse = response
            .json()
            .map_err(|e| ProviderError::SchemaMismatch(format!("parse response: {e}")))?;

        Self::parse_response(request, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::catalog::CatalogStore;

    fn request_parts() -> (std::sync::Arc<crate::catalog::DataSourceDescriptor>, Vec<String>, BTreeMap<String, String>, Vec<String>) {
        let descriptor = InMemoryCatalog::default_demo().get("valuation").unwrap();
        let fields = vec!["pe".to_string()];
        let params = BTreeMap::from([("date".to_string(), "2024-01-02".to_string())]);
        let entities = vec!["AAA".to_string(), "BBB".to_string()];
        (descriptor, fields, params, entities)
    }

    #[test]
    fn url_includes_entities_fields_and_params() {
        let (descriptor, fields, params, entities) = request_parts();
        let request = BatchRequest {
            descriptor: &descriptor,
            fields: &fields,
            params: &params,
            entities: &entities,
        };
        let provider = HttpProvider::new("https://data.example.com/");
        let url = provider.table_url(&request);
        assert_eq!(
            url,
            "https://data.example.com/table/valuation?entities=AAA,BBB&fields=pe&date=2024-01-02"
        );
    }

    #[test]
    fn rows_parse_into_frame() {
        let (descriptor, fields, params, entities) = request_parts();
        let request = BatchRequest {
            descriptor: &descriptor,
            fields: &fields,
            params: &params,
            entities: &entities,
        };

        let body = r#"{"rows":[
            {"entity_id":"AAA","date":"2024-01-02","pe":14.2},
            {"entity_id":"BBB","date":"2024-01-02","pe":22.8}
        ]}"#;
        let response: TableResponse = serde_json::from_str(body).unwrap();
        let frame = HttpProvider::parse_response(&request, response).unwrap();

        assert_eq!(frame.len(), 2);
        assert_eq!(frame.column("pe").unwrap(), &[14.2, 22.8]);
    }

    #[test]
    fn api_error_maps_to_rejection() {
        let (descriptor, fields, params, entities) = request_parts();
        let request = BatchRequest {
            descriptor: &descriptor,
            fields: &fields,
            params: &params,
            entities: &entities,
        };

        let body = r#"{"error":{"code":"bad_param","message":"date malformed"}}"#;
        let response: TableResponse = serde_json::from_str(body).unwrap();
        let err = HttpProvider::parse_response(&request, response).unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
    }

    #[test]
    fn missing_field_is_schema_mismatch() {
        let (descriptor, fields, params, entities) = request_parts();
        let request = BatchRequest {
            descriptor: &descriptor,
            fields: &fields,
            params: &params,
            entities: &entities,
        };

        let body = r#"{"rows":[{"entity_id":"AAA","date":"2024-01-02","pb":1.0}]}"#;
        let response: TableResponse = serde_json::from_str(body).unwrap();
        let err = HttpProvider::parse_response(&request, response).unwrap_err();
        assert!(matches!(err, ProviderError::SchemaMismatch(_)));
    }
}
