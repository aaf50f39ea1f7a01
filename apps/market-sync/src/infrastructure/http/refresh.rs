//! Token refresh client.
//!
//! `POST {refresh_path}` with `{"refreshToken": ..}` and the current access
//! token as bearer. Goes straight to the transport, never through the
//! authenticated requester, so a refresh can't trigger another refresh.

use std::sync::Arc;

use async_trait::async_trait;

use crate::application::ports::{ApiRequest, HttpTransport, RefreshClient, RefreshError};
use crate::domain::credentials::{AccessToken, RefreshToken, TokenPair};

/// Refresh client over an [`HttpTransport`].
#[derive(Clone)]
pub struct HttpRefreshClient {
    transport: Arc<dyn HttpTransport>,
    path: String,
}

impl HttpRefreshClient {
    /// Create a refresh client posting to `path`.
    #[must_use]
    pub fn new(transport: Arc<dyn HttpTransport>, path: impl Into<String>) -> Self {
        Self {
            transport,
            path: path.into(),
        }
    }
}

#[async_trait]
impl RefreshClient for HttpRefreshClient {
    async fn refresh(
        &self,
        refresh_token: RefreshToken,
        access_token: Option<AccessToken>,
    ) -> Result<TokenPair, RefreshError> {
        let body = serde_json::json!({ "refreshToken": refresh_token.expose() });
        let request = ApiRequest::post(&self.path, body).with_bearer(access_token);

        let response = self
            .transport
            .execute(request)
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        match response.status {
            400 | 401 | 403 => Err(RefreshError::Rejected {
                status: response.status,
            }),
            _ if response.is_success() => {
                let pair: TokenPair = response
                    .json()
                    .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
                if pair.access_token.expose().is_empty() {
                    return Err(RefreshError::InvalidResponse(
                        "empty access token".to_string(),
                    ));
                }
                Ok(pair)
            }
            status => Err(RefreshError::InvalidResponse(format!(
                "unexpected status {status}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{ApiResponse, HttpMethod, MockHttpTransport, TransportError};
    use test_case::test_case;

    fn client_returning(response: Result<ApiResponse, TransportError>) -> HttpRefreshClient {
        let mut transport = MockHttpTransport::new();
        transport
            .expect_execute()
            .times(1)
            .return_once(move |_| response);
        HttpRefreshClient::new(Arc::new(transport), "/api/auth/refresh")
    }

    #[tokio::test]
    async fn sends_refresh_token_and_bearer() {
        let mut transport = MockHttpTransport::new();
        transport
            .expect_execute()
            .withf(|req| {
                req.method == HttpMethod::Post
                    && req.path == "/api/auth/refresh"
                    && req.body == Some(serde_json::json!({"refreshToken": "r1"}))
                    && req.bearer == Some(AccessToken::new("a1"))
            })
            .times(1)
            .returning(|_| {
                Ok(ApiResponse::new(
                    200,
                    r#"{"accessToken":"a2","refreshToken":"r2"}"#,
                ))
            });
        let client = HttpRefreshClient::new(Arc::new(transport), "/api/auth/refresh");

        let pair = client
            .refresh(RefreshToken::new("r1"), Some(AccessToken::new("a1")))
            .await
            .unwrap();

        assert_eq!(pair.access_token, AccessToken::new("a2"));
        assert_eq!(pair.refresh_token, Some(RefreshToken::new("r2")));
    }

    #[tokio::test]
    async fn refresh_token_rotation_is_optional() {
        let client = client_returning(Ok(ApiResponse::new(200, r#"{"access_token":"a2"}"#)));

        let pair = client.refresh(RefreshToken::new("r1"), None).await.unwrap();

        assert_eq!(pair.access_token, AccessToken::new("a2"));
        assert!(pair.refresh_token.is_none());
    }

    #[test_case(400 ; "bad request")]
    #[test_case(401 ; "unauthorized")]
    #[test_case(403 ; "forbidden")]
    #[tokio::test]
    async fn credential_rejections_are_terminal(status: u16) {
        let client = client_returning(Ok(ApiResponse::new(status, "")));

        let err = client.refresh(RefreshToken::new("r1"), None).await.unwrap_err();

        assert_eq!(err, RefreshError::Rejected { status });
        assert!(err.is_terminal());
    }

    #[test_case(Ok(ApiResponse::new(500, "oops")) ; "server error")]
    #[test_case(Ok(ApiResponse::new(200, "not json")) ; "garbage body")]
    #[test_case(Ok(ApiResponse::new(200, r#"{"accessToken":""}"#)) ; "empty token")]
    #[test_case(Err(TransportError::Network("refused".to_string())) ; "network")]
    #[tokio::test]
    async fn other_failures_are_not_terminal(response: Result<ApiResponse, TransportError>) {
        let client = client_returning(response);

        let err = client.refresh(RefreshToken::new("r1"), None).await.unwrap_err();

        assert!(!err.is_terminal(), "{err:?}");
    }
}
