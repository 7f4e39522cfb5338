use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder, Response, StatusCode, Url};

use crate::job::ProjectSnapshot;

use super::{
    PhotoRecord, PresignRequest, PresignedUpload, RemoteApi, RemoteError, TokenProvider,
};

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_decode() {
            Self::Decode(error.to_string())
        } else if error.is_builder() {
            Self::InvalidRequest(error.to_string())
        } else {
            Self::Transport(error.to_string())
        }
    }
}

/// [`RemoteApi`] over HTTP with JSON bodies.
///
/// Every request carries the client's timeout. Requests to the API are authorized with the
/// bearer token from the [`TokenProvider`]; on a `401` the token is refreshed and the request
/// sent once more. Uploads to presigned URLs are sent without credentials.
#[derive(Clone)]
pub struct HttpRemoteApi {
    client: Client,
    base_url: Url,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for HttpRemoteApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteApi")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpRemoteApi {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, RemoteError> {
        let base_url =
            Url::parse(base_url).map_err(|error| RemoteError::InvalidRequest(error.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::InvalidRequest(format!(
                "{base_url} cannot be used as a base url"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        tracing::debug!(%base_url, ?timeout, "Created remote api client");
        Ok(Self {
            client,
            base_url,
            tokens,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| RemoteError::InvalidRequest(format!("{} has no path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send_authorized(
        &self,
        build: impl Fn(&Client) -> RequestBuilder + Send + Sync,
    ) -> Result<Response, RemoteError> {
        let token = self.tokens.access_token().await;
        let response = authorize(build(&self.client), token.as_deref())
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        tracing::debug!(url = %response.url(), "Access token rejected, refreshing");
        let Some(token) = self.tokens.refresh().await else {
            return Err(RemoteError::Unauthorized);
        };
        let response = authorize(build(&self.client), Some(&token))
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Unauthorized);
        }
        check_status(response).await
    }
}

fn authorize(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn presign_upload(
        &self,
        request: &PresignRequest,
    ) -> Result<PresignedUpload, RemoteError> {
        let url = self.endpoint(&["files", "presigned-upload"])?;
        let response = self
            .send_authorized(|client| client.post(url.clone()).json(request))
            .await?;
        Ok(response.json().await?)
    }

    async fn upload_bytes(
        &self,
        target: &PresignedUpload,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<(), RemoteError> {
        let response = self
            .client
            .put(&target.upload_url)
            .header(CONTENT_TYPE, mime_type)
            .body(bytes)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn submit_photo(&self, record: &PhotoRecord) -> Result<(), RemoteError> {
        let url = self.endpoint(&["photos"])?;
        self.send_authorized(|client| client.post(url.clone()).json(record))
            .await?;
        Ok(())
    }

    async fn submit_project(&self, project: &ProjectSnapshot) -> Result<(), RemoteError> {
        let url = self.endpoint(&["projects"])?;
        self.send_authorized(|client| client.post(url.clone()).json(&project.body))
            .await?;
        Ok(())
    }

    async fn patch_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        changes: &serde_json::Value,
    ) -> Result<(), RemoteError> {
        let url = self.endpoint(&[entity_type, entity_id])?;
        self.send_authorized(|client| client.patch(url.clone()).json(changes))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use assert_matches::assert_matches;
    use axum::{
        body::Bytes,
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::{patch, post, put},
        Json, Router,
    };

    use super::*;
    use crate::remote::{NoAuth, StaticToken};

    #[derive(Clone, Default)]
    struct Server {
        requests: Arc<Mutex<Vec<(String, Option<String>, Vec<u8>)>>>,
        status: Arc<Mutex<Option<StatusCode>>>,
    }

    impl Server {
        fn record(&self, path: &str, headers: &HeaderMap, body: &[u8]) -> Option<StatusCode> {
            let auth = headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            self.requests
                .lock()
                .unwrap()
                .push((path.to_owned(), auth, body.to_vec()));
            *self.status.lock().unwrap()
        }
    }

    async fn serve(server: Server) -> String {
        let app = Router::new()
            .route(
                "/api/files/presigned-upload",
                post(
                    |State(server): State<Server>, headers: HeaderMap, body: Bytes| async move {
                        if let Some(status) =
                            server.record("/api/files/presigned-upload", &headers, &body)
                        {
                            return Err(status);
                        }
                        Ok(Json(serde_json::json!({
                            "uploadUrl": "http://uploads.invalid/abc?sig=1",
                            "fileId": "file-1",
                        })))
                    },
                ),
            )
            .route(
                "/api/photos",
                post(
                    |State(server): State<Server>, headers: HeaderMap, body: Bytes| async move {
                        match server.record("/api/photos", &headers, &body) {
                            Some(status) => status,
                            None => StatusCode::CREATED,
                        }
                    },
                ),
            )
            .route(
                "/api/projects",
                post(
                    |State(server): State<Server>, headers: HeaderMap, body: Bytes| async move {
                        let status = server.record("/api/projects", &headers, &body);
                        status.unwrap_or(StatusCode::OK)
                    },
                ),
            )
            .route(
                "/api/:entity_type/:entity_id",
                patch(
                    |State(server): State<Server>,
                     Path((entity_type, entity_id)): Path<(String, String)>,
                     headers: HeaderMap,
                     body: Bytes| async move {
                        let path = format!("/api/{entity_type}/{entity_id}");
                        let status = server.record(&path, &headers, &body);
                        status.unwrap_or(StatusCode::NO_CONTENT)
                    },
                ),
            )
            .route(
                "/upload/:file",
                put(
                    |State(server): State<Server>,
                     Path(file): Path<String>,
                     headers: HeaderMap,
                     body: Bytes| async move {
                        let status = server.record(&format!("/upload/{file}"), &headers, &body);
                        status.unwrap_or(StatusCode::OK)
                    },
                ),
            )
            .with_state(server);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{address}")
    }

    fn client(base: &str, tokens: Arc<dyn TokenProvider>) -> HttpRemoteApi {
        HttpRemoteApi::new(&format!("{base}/api/"), Duration::from_secs(5), tokens).unwrap()
    }

    /// Rejects the first token it hands out and succeeds after a refresh.
    struct RotatingToken {
        refreshes: AtomicUsize,
        refresh_succeeds: bool,
    }

    #[async_trait]
    impl TokenProvider for RotatingToken {
        async fn access_token(&self) -> Option<String> {
            Some("stale".to_owned())
        }

        async fn refresh(&self) -> Option<String> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            self.refresh_succeeds.then(|| "fresh".to_owned())
        }
    }

    #[tokio::test]
    async fn presign_sends_camel_case_and_bearer_token() {
        let server = Server::default();
        let base = serve(server.clone()).await;
        let api = client(&base, Arc::new(StaticToken("secret".to_owned())));

        let upload = api
            .presign_upload(&PresignRequest {
                file_name: "tree.jpg".to_owned(),
                file_size: 3,
                mime_type: "image/jpeg".to_owned(),
                sha256: "abc".to_owned(),
            })
            .await
            .unwrap();

        assert_eq!(upload.file_id, "file-1");
        assert_eq!(upload.remote_url(), "http://uploads.invalid/abc");
        let requests = server.requests.lock().unwrap();
        let (path, auth, body) = &requests[0];
        assert_eq!(path, "/api/files/presigned-upload");
        assert_eq!(auth.as_deref(), Some("Bearer secret"));
        let body: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(body["fileName"], "tree.jpg");
        assert_eq!(body["sha256"], "abc");
    }

    #[tokio::test]
    async fn upload_puts_raw_bytes_without_credentials() {
        let server = Server::default();
        let base = serve(server.clone()).await;
        let api = client(&base, Arc::new(StaticToken("secret".to_owned())));

        api.upload_bytes(
            &PresignedUpload {
                upload_url: format!("{base}/upload/abc?sig=1"),
                file_id: "abc".to_owned(),
            },
            vec![1, 2, 3],
            "image/jpeg",
        )
        .await
        .unwrap();

        let requests = server.requests.lock().unwrap();
        assert_eq!(requests[0], ("/upload/abc".to_owned(), None, vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn patch_addresses_entity() {
        let server = Server::default();
        let base = serve(server.clone()).await;
        let api = client(&base, Arc::new(NoAuth));

        api.patch_entity("polygons", "p-1", &serde_json::json!({ "name": "East" }))
            .await
            .unwrap();
        api.submit_project(&ProjectSnapshot {
            id: "project-1".to_owned(),
            body: serde_json::json!({ "id": "project-1" }),
        })
        .await
        .unwrap();

        let requests = server.requests.lock().unwrap();
        assert_eq!(requests[0].0, "/api/polygons/p-1");
        assert_eq!(requests[0].1, None);
        assert_eq!(requests[1].0, "/api/projects");
    }

    #[tokio::test]
    async fn error_statuses_are_reported() {
        let server = Server::default();
        *server.status.lock().unwrap() = Some(StatusCode::UNPROCESSABLE_ENTITY);
        let base = serve(server.clone()).await;
        let api = client(&base, Arc::new(NoAuth));

        let result = api
            .submit_project(&ProjectSnapshot {
                id: "project-1".to_owned(),
                body: serde_json::json!({}),
            })
            .await;
        assert_matches!(result, Err(RemoteError::Status { status: 422, .. }));

        *server.status.lock().unwrap() = Some(StatusCode::SERVICE_UNAVAILABLE);
        let error = api
            .patch_entity("photos", "ph-1", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn unauthorized_refreshes_once() {
        let server = Server::default();
        *server.status.lock().unwrap() = Some(StatusCode::UNAUTHORIZED);
        let base = serve(server.clone()).await;
        let tokens = Arc::new(RotatingToken {
            refreshes: AtomicUsize::new(0),
            refresh_succeeds: true,
        });
        let api = client(&base, tokens.clone());

        let result = api
            .patch_entity("photos", "ph-1", &serde_json::json!({}))
            .await;

        assert_matches!(result, Err(RemoteError::Unauthorized));
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
        let requests = server.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].1.as_deref(), Some("Bearer stale"));
        assert_eq!(requests[1].1.as_deref(), Some("Bearer fresh"));
    }

    #[tokio::test]
    async fn failed_refresh_is_unauthorized() {
        let server = Server::default();
        *server.status.lock().unwrap() = Some(StatusCode::UNAUTHORIZED);
        let base = serve(server.clone()).await;
        let api = client(
            &base,
            Arc::new(RotatingToken {
                refreshes: AtomicUsize::new(0),
                refresh_succeeds: false,
            }),
        );

        let error = api
            .submit_photo(&PhotoRecord::new(
                &crate::store::testing::fixtures::photo_snapshot(
                    "ph-1",
                    "/tmp/ph-1.jpg".into(),
                    "abc",
                ),
                "http://uploads.invalid/abc",
            ))
            .await
            .unwrap_err();

        assert_matches!(error, RemoteError::Unauthorized);
        assert!(!error.is_retryable());
        assert_eq!(server.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_server_is_retryable() {
        let api = client("http://127.0.0.1:9", Arc::new(NoAuth));

        let error = api
            .patch_entity("photos", "ph-1", &serde_json::json!({}))
            .await
            .unwrap_err();

        assert!(error.is_retryable());
    }

    #[test]
    fn invalid_base_url() {
        let result = HttpRemoteApi::new("not a url", Duration::from_secs(1), Arc::new(NoAuth));
        assert_matches!(result, Err(RemoteError::InvalidRequest(_)));
    }
}
