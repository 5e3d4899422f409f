//! HTTP client for the hosted persistence API.
//!
//! Speaks the PostgREST dialect: tables under `/rest/v1/{collection}`,
//! `eq.` filters in the query string, `order=field.asc` and
//! `Prefer: return=representation` so writes return the stored rows. The
//! signed-in user is resolved through `/auth/v1/user`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::entity::{Entity, EntityId, Record};
use crate::error::RemoteError;
use crate::remote::{Actor, FetchRequest, RemoteStore};

/// Error body returned by the REST API.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

/// Client for the persistence API.
pub struct RestClient {
    http: Client,
    base_url: String,
    api_key: String,
    access_token: Arc<RwLock<Option<String>>>,
}

impl RestClient {
    /// Create a client for the project at `base_url`, authenticating with the
    /// public `api_key`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Set or clear the user's access token.
    pub async fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().await = token;
    }

    fn table_url(&self, collection: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, collection)
    }

    async fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let bearer = self
            .access_token
            .read()
            .await
            .clone()
            .unwrap_or_else(|| self.api_key.clone());
        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", bearer))
    }

    /// Decode a successful response, or turn an error body into a [`RemoteError`].
    async fn handle_response(&self, response: reqwest::Response) -> Result<Vec<Record>, RemoteError> {
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.map_err(|e| {
                RemoteError::InvalidResponse(format!(
                    "request failed ({}): failed to read response: {}",
                    status, e
                ))
            })?;

            let (code, message) = match serde_json::from_str::<ApiErrorBody>(&text) {
                Ok(body) => {
                    let message = match (body.message, body.details) {
                        (Some(m), Some(d)) => format!("{} ({})", m, d),
                        (Some(m), None) => m,
                        (None, _) => text.clone(),
                    };
                    (body.code, message)
                }
                Err(_) => (None, text),
            };
            return Err(RemoteError::Api {
                status: status.as_u16(),
                code,
                message,
            });
        }

        let rows = response.json().await?;
        Ok(rows)
    }

    fn into_entities(rows: Vec<Record>) -> Result<Vec<Entity>, RemoteError> {
        rows.into_iter()
            .map(|row| {
                Entity::from_record(row)
                    .ok_or_else(|| RemoteError::InvalidResponse("row without id".to_string()))
            })
            .collect()
    }

    /// The single row a write returned, or not-found if it touched none.
    fn single(collection: &str, id: Option<&EntityId>, rows: Vec<Record>) -> Result<Entity, RemoteError> {
        let mut entities = Self::into_entities(rows)?;
        if entities.is_empty() {
            return Err(RemoteError::NotFound {
                collection: collection.to_string(),
                id: id.map(ToString::to_string).unwrap_or_default(),
            });
        }
        Ok(entities.swap_remove(0))
    }
}

#[async_trait]
impl RemoteStore for RestClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Entity>, RemoteError> {
        let mut query: Vec<(String, String)> = vec![("select".to_string(), "*".to_string())];
        for (field, value) in &request.filter {
            query.push((field.clone(), format!("eq.{}", value)));
        }
        if !request.order.is_empty() {
            let order = request
                .order
                .iter()
                .map(|k| format!("{}.{}", k.field, k.direction.as_str()))
                .collect::<Vec<_>>()
                .join(",");
            query.push(("order".to_string(), order));
        }

        let url = self.table_url(&request.collection);
        trace!(url = %url, ?query, "fetching collection");
        let response = self
            .request(Method::GET, &url)
            .await
            .query(&query)
            .send()
            .await?;
        let rows = self.handle_response(response).await?;
        debug!(collection = %request.collection, count = rows.len(), "fetched collection");
        Self::into_entities(rows)
    }

    async fn insert(&self, collection: &str, fields: Record) -> Result<Entity, RemoteError> {
        let response = self
            .request(Method::POST, &self.table_url(collection))
            .await
            .header("Prefer", "return=representation")
            .json(&fields)
            .send()
            .await?;
        let rows = self.handle_response(response).await?;
        let entity = Self::single(collection, None, rows)?;
        debug!(collection, id = %entity.id(), "inserted record");
        Ok(entity)
    }

    async fn update(&self, collection: &str, id: &EntityId, patch: Record) -> Result<Entity, RemoteError> {
        let response = self
            .request(Method::PATCH, &self.table_url(collection))
            .await
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await?;
        let rows = self.handle_response(response).await?;
        let entity = Self::single(collection, Some(id), rows)?;
        debug!(collection, id = %id, "updated record");
        Ok(entity)
    }

    async fn delete(&self, collection: &str, id: &EntityId) -> Result<(), RemoteError> {
        let response = self
            .request(Method::DELETE, &self.table_url(collection))
            .await
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let rows = self.handle_response(response).await?;
        Self::single(collection, Some(id), rows)?;
        debug!(collection, id = %id, "deleted record");
        Ok(())
    }

    async fn current_actor(&self) -> Result<Option<Actor>, RemoteError> {
        if self.access_token.read().await.is_none() {
            return Ok(None);
        }

        let url = format!("{}/auth/v1/user", self.base_url);
        let response = self.request(Method::GET, &url).await.send().await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!("access token rejected, no current user");
                Ok(None)
            }
            status if !status.is_success() => {
                let text = response.text().await.unwrap_or_default();
                Err(RemoteError::Api {
                    status: status.as_u16(),
                    code: None,
                    message: text,
                })
            }
            _ => Ok(Some(response.json().await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::SortKey;
    use crate::error::UNIQUE_VIOLATION_CODE;
    use crate::key::Filter;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> RestClient {
        let client = RestClient::new(server.uri(), "anon-key").unwrap();
        client.set_access_token(Some("user-token".to_string())).await;
        client
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let client = RestClient::new("https://example.supabase.co/", "key").unwrap();
        assert_eq!(client.base_url(), "https://example.supabase.co");
        assert_eq!(client.table_url("recipes"), "https://example.supabase.co/rest/v1/recipes");
    }

    #[tokio::test]
    async fn test_fetch_sends_filter_and_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/meal_plans"))
            .and(query_param("user_id", "eq.u1"))
            .and(query_param("order", "planned_for.asc,created_at.asc"))
            .and(header("apikey", "anon-key"))
            .and(header("Authorization", "Bearer user-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "user_id": "u1", "planned_for": "2024-03-01"}
            ])))
            .mount(&server)
            .await;

        let mut filter = Filter::new();
        filter.insert("user_id".to_string(), "u1".to_string());
        let rows = client(&server)
            .await
            .fetch(&FetchRequest {
                collection: "meal_plans".to_string(),
                filter,
                order: vec![SortKey::asc("planned_for"), SortKey::asc("created_at")],
            })
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id().as_str(), "1");
    }

    #[tokio::test]
    async fn test_insert_returns_stored_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/categories"))
            .and(header("Prefer", "return=representation"))
            .and(body_json(json!({"name": "Dairy"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([
                {"id": "c-1", "name": "Dairy"}
            ])))
            .mount(&server)
            .await;

        let fields = json!({"name": "Dairy"}).as_object().cloned().unwrap();
        let entity = client(&server).await.insert("categories", fields).await.unwrap();
        assert_eq!(entity.id().as_str(), "c-1");
    }

    #[tokio::test]
    async fn test_unique_violation_is_reported_with_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/categories"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "code": "23505",
                "message": "duplicate key value violates unique constraint \"categories_name_key\"",
                "details": "Key (name)=(Dairy) already exists.",
                "hint": null
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .insert("categories", Record::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(UNIQUE_VIOLATION_CODE));
        assert!(matches!(err, RemoteError::Api { status: 409, .. }));
    }

    #[tokio::test]
    async fn test_write_touching_no_rows_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/food_items"))
            .and(query_param("id", "eq.42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .delete("food_items", &EntityId::new("42"))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NotFound { ref id, .. } if id == "42"));
    }

    #[tokio::test]
    async fn test_server_error_without_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/recipes"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .update("recipes", &EntityId::new("3"), Record::new())
            .await
            .unwrap_err();
        match err {
            RemoteError::Api { status, code, message } => {
                assert_eq!(status, 502);
                assert_eq!(code, None);
                assert_eq!(message, "bad gateway");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_current_actor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("Authorization", "Bearer user-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "user-1",
                "email": "me@example.com",
                "aud": "authenticated"
            })))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let actor = client.current_actor().await.unwrap().unwrap();
        assert_eq!(actor.id, "user-1");

        client.set_access_token(None).await;
        assert_eq!(client.current_actor().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejected_token_means_no_actor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"msg": "invalid JWT"})))
            .mount(&server)
            .await;

        assert_eq!(client(&server).await.current_actor().await.unwrap(), None);
    }
}
