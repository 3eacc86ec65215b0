//! Entitlement checks: may this caller read this book?
//!
//! The check is owned by an external system and consulted on every read. It is
//! never cached here.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::EntitlementError;
use crate::id::{BookId, UserId};

#[async_trait]
pub trait EntitlementCheck: Send + Sync {
    async fn is_entitled(&self, user: &UserId, book: &BookId) -> Result<bool, EntitlementError>;
}

/// Fixed grant list, from config. A `*` user or book matches anything.
#[derive(Debug, Clone, Default)]
pub struct StaticEntitlements {
    grants: HashSet<(String, String)>,
}

impl StaticEntitlements {
    pub fn new<I, U, B>(grants: I) -> Self
    where
        I: IntoIterator<Item = (U, B)>,
        U: Into<String>,
        B: Into<String>,
    {
        Self {
            grants: grants
                .into_iter()
                .map(|(u, b)| (u.into(), b.into()))
                .collect(),
        }
    }

    /// Parse `user:book` pairs separated by commas, e.g. `alice:moby,bob:*`.
    pub fn parse_list(list: &str) -> Self {
        Self::new(list.split(',').filter_map(|pair| {
            let (user, book) = pair.trim().split_once(':')?;
            let (user, book) = (user.trim(), book.trim());
            (!user.is_empty() && !book.is_empty()).then(|| (user.to_string(), book.to_string()))
        }))
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    fn allows(&self, user: &str, book: &str) -> bool {
        [(user, book), (user, "*"), ("*", book), ("*", "*")]
            .iter()
            .any(|(u, b)| self.grants.contains(&(u.to_string(), b.to_string())))
    }
}

#[async_trait]
impl EntitlementCheck for StaticEntitlements {
    async fn is_entitled(&self, user: &UserId, book: &BookId) -> Result<bool, EntitlementError> {
        Ok(self.allows(user.as_str(), book.as_str()))
    }
}

#[derive(Deserialize)]
struct EntitlementResponse {
    entitled: bool,
}

/// Remote check: `GET {url}?user=<user>&book=<book>` answering `{"entitled": bool}`.
#[derive(Debug, Clone)]
pub struct HttpEntitlements {
    client: reqwest::Client,
    url: String,
}

impl HttpEntitlements {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, EntitlementError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EntitlementCheck for HttpEntitlements {
    async fn is_entitled(&self, user: &UserId, book: &BookId) -> Result<bool, EntitlementError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("user", user.as_str()), ("book", book.as_str())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EntitlementError::Status(status.as_u16()));
        }
        let body: EntitlementResponse = response.json().await?;
        Ok(body.entitled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ids(user: &str, book: &str) -> (UserId, BookId) {
        (UserId::parse(user).unwrap(), BookId::parse(book).unwrap())
    }

    #[tokio::test]
    async fn test_static_grants() {
        let grants = StaticEntitlements::parse_list("alice:moby, bob:*, :bad, nocolon");
        assert_eq!(grants.len(), 2);

        let (alice, moby) = ids("alice", "moby");
        let (_, other) = ids("alice", "other");
        let (bob, _) = ids("bob", "x");
        assert!(grants.is_entitled(&alice, &moby).await.unwrap());
        assert!(!grants.is_entitled(&alice, &other).await.unwrap());
        assert!(grants.is_entitled(&bob, &other).await.unwrap());
    }

    #[tokio::test]
    async fn test_http_check_passes_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entitled"))
            .and(query_param("user", "alice"))
            .and(query_param("book", "moby"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"entitled": true})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/entitled"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"entitled": false})))
            .mount(&server)
            .await;

        let check =
            HttpEntitlements::new(format!("{}/entitled", server.uri()), Duration::from_secs(2))
                .unwrap();
        let (alice, moby) = ids("alice", "moby");
        let (mallory, _) = ids("mallory", "moby");
        assert!(check.is_entitled(&alice, &moby).await.unwrap());
        assert!(!check.is_entitled(&mallory, &moby).await.unwrap());
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let check = HttpEntitlements::new(server.uri(), Duration::from_secs(2)).unwrap();
        let (alice, moby) = ids("alice", "moby");
        assert!(matches!(
            check.is_entitled(&alice, &moby).await,
            Err(EntitlementError::Status(503))
        ));
    }
}
