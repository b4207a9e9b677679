use super::{PendingRecord, RecordFields, Registry};
use crate::auth::{CredentialProvider, Tenant};
use crate::error::ApiError;
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT_SECS: u64 = 30;
/// 搜索接口单页上限
const MAX_PER_PAGE: usize = 200;

/// CRM 记录接口
pub struct CrmRegistry {
    http: reqwest::Client,
    base: String,
    fields: RecordFields,
    tenant: Tenant,
    credentials: Arc<dyn CredentialProvider>,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PageInfo {
    #[serde(default)]
    more_records: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(default)]
    data: Vec<UpdateResult>,
}

#[derive(Debug, Deserialize)]
struct UpdateResult {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

impl CrmRegistry {
    pub fn new(
        http: reqwest::Client,
        api_base_url: &str,
        module: &str,
        fields: RecordFields,
        tenant: Tenant,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let base = format!(
            "{}/crm/v3/{}",
            api_base_url.trim_end_matches('/'),
            urlencoding::encode(module)
        );
        Self {
            http,
            base,
            fields,
            tenant,
            credentials,
            name: format!("crm[{}]", module),
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let token = self.credentials.get_token(self.tenant).await?;
        let response = builder
            .header("Authorization", format!("Zoho-oauthtoken {}", token))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ApiError::status(self.tenant, status.as_u16(), message))
    }

    fn record_url(&self, id: &str) -> String {
        format!("{}/{}", self.base, urlencoding::encode(id))
    }
}

#[async_trait]
impl Registry for CrmRegistry {
    async fn fetch_pending(&self, limit: Option<usize>) -> Result<Vec<PendingRecord>, ApiError> {
        let criteria = format!("({}:equals:false)", self.fields.flag);
        let fields = self.fields.requested().join(",");
        let per_page = limit.map_or(MAX_PER_PAGE, |l| l.clamp(1, MAX_PER_PAGE));

        let mut records = Vec::new();
        let mut page = 1usize;
        loop {
            let per_page = per_page.to_string();
            let page_no = page.to_string();
            let builder = self.http.get(format!("{}/search", self.base)).query(&[
                ("criteria", criteria.as_str()),
                ("fields", fields.as_str()),
                ("per_page", per_page.as_str()),
                ("page", page_no.as_str()),
            ]);
            let response = self.send(builder).await?;

            // 无匹配记录时返回 204 空响应
            if response.status() == StatusCode::NO_CONTENT {
                break;
            }
            let body: SearchResponse = response
                .json()
                .await
                .map_err(|e| ApiError::Decode(e.to_string()))?;
            debug!("记录搜索第 {} 页: {} 条", page, body.data.len());

            records.extend(body.data.iter().filter_map(|raw| self.fields.parse(raw)));

            if let Some(limit) = limit {
                if records.len() >= limit {
                    records.truncate(limit);
                    break;
                }
            }
            if !body.info.more_records || body.data.is_empty() {
                break;
            }
            page += 1;
        }

        Ok(records)
    }

    async fn fetch_one(&self, id: &str) -> Result<Option<PendingRecord>, ApiError> {
        let fields = self.fields.requested().join(",");
        let builder = self
            .http
            .get(self.record_url(id))
            .query(&[("fields", fields.as_str())]);

        let response = match self.send(builder).await {
            Ok(r) => r,
            Err(ApiError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(body.data.first().and_then(|raw| self.fields.parse(raw)))
    }

    async fn set_completion_flag(&self, id: &str, value: bool) -> Result<(), ApiError> {
        let mut entry = serde_json::Map::new();
        entry.insert("id".to_string(), Value::String(id.to_string()));
        entry.insert(self.fields.flag.clone(), Value::Bool(value));
        let payload = serde_json::json!({ "data": [entry] });

        let response = self
            .send(self.http.put(self.record_url(id)).json(&payload))
            .await?;
        let body: UpdateResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        match body.data.first() {
            Some(result) if result.status.eq_ignore_ascii_case("error") => Err(ApiError::status(
                self.tenant,
                StatusCode::BAD_REQUEST.as_u16(),
                result.message.clone(),
            )),
            Some(_) => Ok(()),
            None => Err(ApiError::Decode("更新响应为空".to_string())),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
