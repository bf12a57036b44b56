//! HTTP client for the target cluster.

use super::bulk::{encode_bulk, BulkRequest, BulkResponse};
use crate::error::{Result, RiverError};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

/// Client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// `host:port` of the cluster
    pub addr: String,
    pub user: String,
    pub password: String,
    pub https: bool,
}

/// Minimal bulk-capable Elasticsearch client.
pub struct Client {
    base: Url,
    http: reqwest::Client,
    user: String,
    password: String,
}

/// Response of a single-document request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocResponse {
    #[serde(skip)]
    pub code: u16,
    #[serde(default, rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub found: bool,
    #[serde(default, rename = "_source")]
    pub source: Map<String, Value>,
}

/// Root endpoint payload, used to discover the cluster's major version.
#[derive(Debug, Deserialize)]
struct RootInfo {
    #[serde(default)]
    version: RootVersion,
}

#[derive(Debug, Default, Deserialize)]
struct RootVersion {
    #[serde(default)]
    number: String,
}

impl Client {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let scheme = if config.https { "https" } else { "http" };
        let base = Url::parse(&format!("{}://{}/", scheme, config.addr))?;

        let mut builder = reqwest::Client::builder();
        if config.https {
            // The original deployments routinely run self-signed clusters.
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build()?;

        Ok(Self {
            base,
            http,
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .expect("base url is never cannot-be-a-base")
            .pop_if_empty()
            .extend(segments);
        url
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let mut request = self.http.request(method, url);
        if !self.user.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.password));
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// GET a document by id.
    pub async fn get_doc(&self, index: &str, doc_type: &str, id: &str) -> Result<DocResponse> {
        let url = self.url(&[index, doc_type, id]);
        let response = self.send(Method::GET, url, None).await?;
        let code = response.status().as_u16();

        let mut doc: DocResponse = if response.content_length() == Some(0) {
            DocResponse::default()
        } else {
            response.json().await.unwrap_or_default()
        };
        doc.code = code;
        Ok(doc)
    }

    /// PUT (create or replace) a document.
    pub async fn put_doc(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        data: &Value,
    ) -> Result<()> {
        let url = self.url(&[index, doc_type, id]);
        let response = self.send(Method::PUT, url, Some(data)).await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            status => Err(RiverError::elastic(
                status.as_u16(),
                response.text().await.unwrap_or_default(),
            )),
        }
    }

    /// DELETE a document; missing documents are not an error.
    pub async fn delete_doc(&self, index: &str, doc_type: &str, id: &str) -> Result<()> {
        let url = self.url(&[index, doc_type, id]);
        let response = self.send(Method::DELETE, url, None).await?;
        match response.status() {
            StatusCode::OK | StatusCode::NOT_FOUND => Ok(()),
            status => Err(RiverError::elastic(
                status.as_u16(),
                response.text().await.unwrap_or_default(),
            )),
        }
    }

    /// HEAD a document.
    pub async fn exists(&self, index: &str, doc_type: &str, id: &str) -> Result<bool> {
        let url = self.url(&[index, doc_type, id]);
        let response = self.send(Method::HEAD, url, None).await?;
        Ok(response.status() == StatusCode::OK)
    }

    /// Create the index if absent, then put the type mapping.
    pub async fn create_mapping(
        &self,
        index: &str,
        doc_type: &str,
        mapping: &Value,
    ) -> Result<()> {
        let index_url = self.url(&[index]);
        let response = self.send(Method::HEAD, index_url.clone(), None).await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!("index {} absent, creating", index);
                let created = self.send(Method::PUT, index_url, None).await?;
                if !created.status().is_success() {
                    return Err(RiverError::elastic(
                        created.status().as_u16(),
                        created.text().await.unwrap_or_default(),
                    ));
                }
            }
            StatusCode::OK => {}
            status => {
                return Err(RiverError::elastic(
                    status.as_u16(),
                    format!("HEAD /{} failed", index),
                ))
            }
        }

        let mapping_url = self.url(&[index, doc_type, "_mapping"]);
        let response = self.send(Method::POST, mapping_url, Some(mapping)).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RiverError::elastic(
                response.status().as_u16(),
                response.text().await.unwrap_or_default(),
            ))
        }
    }

    /// Fetch the type mapping; returns the status code with the raw body.
    pub async fn get_mapping(&self, index: &str, doc_type: &str) -> Result<(u16, Value)> {
        let url = self.url(&[index, doc_type, "_mapping"]);
        let response = self.send(Method::GET, url, None).await?;
        let code = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);
        Ok((code, body))
    }

    /// Discover the cluster's major version from the root endpoint.
    pub async fn major_version(&self) -> Result<u64> {
        let response = self.send(Method::GET, self.base.clone(), None).await?;
        let info: RootInfo = response.json().await?;
        info.version
            .number
            .split('.')
            .next()
            .and_then(|major| major.parse().ok())
            .ok_or_else(|| RiverError::elastic(0, "unknown cluster version"))
    }

    /// Submit an ordered batch of document actions to `_bulk`.
    ///
    /// Transport and non-2xx failures are errors; per-item failures are
    /// reported through the response for the caller to log.
    pub async fn bulk(&self, requests: &[BulkRequest]) -> Result<BulkResponse> {
        let body = encode_bulk(requests)?;
        let url = self.url(&["_bulk"]);

        let mut request = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if !self.user.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.password));
        }

        let response = request.send().await?;
        let code = response.status().as_u16();
        if !response.status().is_success() {
            return Err(RiverError::elastic(
                code,
                response.text().await.unwrap_or_default(),
            ));
        }

        let mut parsed: BulkResponse = response.json().await?;
        parsed.code = code;
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::new(&ClientConfig {
            addr: "127.0.0.1:9200".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_url_building() {
        let c = client();
        assert_eq!(
            c.url(&["river", "river", "1"]).as_str(),
            "http://127.0.0.1:9200/river/river/1"
        );
        assert_eq!(c.url(&["_bulk"]).as_str(), "http://127.0.0.1:9200/_bulk");
    }

    #[test]
    fn test_url_escapes_segments() {
        let c = client();
        let url = c.url(&["river", "river", "a/b c"]);
        assert_eq!(url.as_str(), "http://127.0.0.1:9200/river/river/a%2Fb%20c");
    }

    #[test]
    fn test_https_scheme() {
        let c = Client::new(&ClientConfig {
            addr: "es.internal:9200".into(),
            https: true,
            ..Default::default()
        })
        .unwrap();
        assert!(c.base.as_str().starts_with("https://"));
    }

    #[test]
    fn test_doc_response_parse() {
        let raw = r#"{"_index":"river","_type":"river","_id":"1","found":true,
                      "_source":{"es_title":"first"}}"#;
        let doc: DocResponse = serde_json::from_str(raw).unwrap();
        assert!(doc.found);
        assert_eq!(doc.source["es_title"], "first");
    }
}
