//! Supabase PostgREST client.
//!
//! A thin typed wrapper over the REST surface: counting with
//! `Prefer: count=exact`, paginated selects, batch inserts and filtered
//! updates/deletes. Constructing a `RemoteStore` requires both credentials,
//! so callers model "remote unavailable" as `Option<RemoteStore>` and fall
//! back to the Excel files on `None` or on any `StoreError`.

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::error::StoreError;

/// Page size used by the full-table-scan fallbacks.
pub const SCAN_PAGE: usize = 1000;

/// A filter expression in PostgREST syntax, e.g. `("nome", "ilike.ana")`.
pub type Filter = (&'static str, String);

/// Handle to one Supabase project, cheap to clone.
#[derive(Clone)]
pub struct RemoteStore {
    http: Client,
    rest_url: String,
}

impl RemoteStore {
    /// Builds the store when both credentials are configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        let url = config.supabase_url.as_deref()?;
        let key = config.supabase_service_key.as_deref()?;

        let mut headers = HeaderMap::new();
        let mut key_value = match HeaderValue::from_str(key) {
            Ok(v) => v,
            Err(e) => {
                log::error!("Supabase key is not a valid header value: {}", e);
                return None;
            }
        };
        key_value.set_sensitive(true);
        headers.insert("apikey", key_value);
        let bearer = match HeaderValue::from_str(&format!("Bearer {}", key)) {
            Ok(v) => v,
            Err(_) => return None,
        };
        headers.insert(reqwest::header::AUTHORIZATION, bearer);

        let http = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| log::error!("Cannot build HTTP client: {}", e))
            .ok()?;

        Some(RemoteStore {
            http,
            rest_url: format!("{}/rest/v1", url.trim_end_matches('/')),
        })
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.rest_url, table))
    }

    /// Turns a non-success response into a `StoreError::Api` with the
    /// PostgREST message and code when the body carries them.
    async fn check(resp: Response) -> Result<Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let code = body
            .get("code")
            .and_then(Value::as_str)
            .map(str::to_string);
        Err(StoreError::Api {
            status: status.as_u16(),
            message,
            code,
        })
    }

    /// Exact row count via a zero-row ranged request.
    pub async fn count(&self, table: &str) -> Result<u64, StoreError> {
        let resp = self
            .request(Method::GET, table)
            .query(&[("select", "*")])
            .header("Prefer", "count=exact")
            .header("Range", "0-0")
            .send()
            .await?;
        // Ranged count requests answer 206 (or 200 on empty tables).
        let resp = Self::check(resp).await?;
        let range = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StoreError::Malformed("missing content-range header".into()))?;
        // Format is "0-0/123" or "*/0".
        let total = range
            .rsplit('/')
            .next()
            .and_then(|t| t.parse::<u64>().ok())
            .ok_or_else(|| StoreError::Malformed(format!("bad content-range '{}'", range)))?;
        Ok(total)
    }

    /// Selects one page of rows as raw JSON objects.
    pub async fn select_page(
        &self,
        table: &str,
        select: &str,
        order: Option<&str>,
        offset: usize,
        limit: usize,
        filters: &[Filter],
    ) -> Result<Vec<Value>, StoreError> {
        let mut req = self
            .request(Method::GET, table)
            .query(&[("select", select)])
            .query(&[("offset", offset.to_string()), ("limit", limit.to_string())]);
        if let Some(order) = order {
            req = req.query(&[("order", order)]);
        }
        for (column, expr) in filters {
            req = req.query(&[(*column, expr.as_str())]);
        }
        let resp = Self::check(req.send().await?).await?;
        Ok(resp.json().await?)
    }

    /// Selects at most one row matching the filters.
    pub async fn select_one(
        &self,
        table: &str,
        select: &str,
        filters: &[Filter],
    ) -> Result<Option<Value>, StoreError> {
        let rows = self.select_page(table, select, None, 0, 1, filters).await?;
        Ok(rows.into_iter().next())
    }

    /// Inserts a batch of rows in one request.
    pub async fn insert_batch<T: Serialize>(
        &self,
        table: &str,
        rows: &[T],
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let resp = self
            .request(Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(rows)
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    /// Applies a partial update to every row matching the filters.
    pub async fn update_where<T: Serialize>(
        &self,
        table: &str,
        patch: &T,
        filters: &[Filter],
    ) -> Result<(), StoreError> {
        let mut req = self
            .request(Method::PATCH, table)
            .header("Prefer", "return=minimal")
            .json(patch);
        for (column, expr) in filters {
            req = req.query(&[(*column, expr.as_str())]);
        }
        Self::check(req.send().await?).await.map(|_| ())
    }

    /// Deletes every row matching the filters.
    pub async fn delete_where(&self, table: &str, filters: &[Filter]) -> Result<(), StoreError> {
        let mut req = self.request(Method::DELETE, table);
        for (column, expr) in filters {
            req = req.query(&[(*column, expr.as_str())]);
        }
        Self::check(req.send().await?).await.map(|_| ())
    }

    /// Empties a table, trying progressively blunter strategies.
    ///
    /// PostgREST refuses unfiltered deletes, and which filter the project
    /// accepts depends on its policies. The ladder: a `created_at` range
    /// covering everything, then `id` different from the nil UUID, then
    /// page-by-page id collection with `in.(...)` deletes. Returns the row
    /// count observed before clearing; a non-zero count remaining after all
    /// three rungs is logged but not an error.
    pub async fn clear_table(&self, table: &str) -> Result<u64, StoreError> {
        let before = self.count(table).await?;
        if before == 0 {
            return Ok(0);
        }
        log::info!("Clearing table '{}' ({} rows)", table, before);

        let broad = self
            .delete_where(table, &[("created_at", "gte.1970-01-01T00:00:00Z".into())])
            .await;
        if let Err(e) = broad {
            log::warn!("created_at delete on '{}' failed ({}), trying by id", table, e);
            let by_id = self
                .delete_where(
                    table,
                    &[("id", "neq.00000000-0000-0000-0000-000000000000".into())],
                )
                .await;
            if let Err(e) = by_id {
                log::warn!("id delete on '{}' failed ({}), scanning pages", table, e);
                self.clear_by_pages(table).await?;
            }
        }

        let remaining = self.count(table).await?;
        if remaining > 0 {
            log::warn!("Table '{}' still has {} rows after clearing", table, remaining);
        }
        Ok(before)
    }

    /// Last rung of the clear ladder: collect ids a page at a time and
    /// delete them explicitly.
    async fn clear_by_pages(&self, table: &str) -> Result<(), StoreError> {
        loop {
            let rows = self
                .select_page(table, "id", None, 0, SCAN_PAGE, &[])
                .await?;
            if rows.is_empty() {
                return Ok(());
            }
            let ids: Vec<&str> = rows
                .iter()
                .filter_map(|row| row.get("id").and_then(Value::as_str))
                .collect();
            if ids.is_empty() {
                return Err(StoreError::Malformed(format!(
                    "rows of '{}' have no id column",
                    table
                )));
            }
            self.delete_where(table, &[("id", format!("in.({})", ids.join(",")))])
                .await?;
        }
    }

    /// Calls a Postgres function exposed through PostgREST.
    pub async fn rpc(&self, name: &str) -> Result<Value, StoreError> {
        let resp = self
            .http
            .post(format!("{}/rpc/{}", self.rest_url, name))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }

    /// Startup probe, logs whether the expected tables answer.
    pub async fn check_tables(&self, tables: &[&str]) {
        for table in tables {
            match self.count(table).await {
                Ok(n) => log::info!("Supabase table '{}' reachable ({} rows)", table, n),
                Err(e) => log::warn!("Supabase table '{}' not reachable: {}", table, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_for(url: &str) -> Option<RemoteStore> {
        let config = Config {
            port: 3001,
            data_dir: "./data".into(),
            temp_dir: "./data/temp".into(),
            supabase_url: Some(url.to_string()),
            supabase_service_key: Some("service-key".to_string()),
        };
        RemoteStore::from_config(&config)
    }

    #[test]
    fn missing_credentials_give_no_store() {
        let config = Config {
            port: 3001,
            data_dir: "./data".into(),
            temp_dir: "./data/temp".into(),
            supabase_url: None,
            supabase_service_key: None,
        };
        assert!(RemoteStore::from_config(&config).is_none());
    }

    #[test]
    fn rest_url_normalizes_trailing_slash() {
        let store = store_for("https://example.supabase.co/").unwrap();
        assert_eq!(store.rest_url, "https://example.supabase.co/rest/v1");
    }
}
