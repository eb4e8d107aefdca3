use crate::service::{ProxyService, ServiceError};
use crate::token::parse_token;
use bytes::Bytes;
use domain::metrics::MetricsRequest;
use domain::requests::AuthRequest;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode, header};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Renders the installed recorder's metrics for the /metrics endpoint when
/// it shares the main listener.
pub type MetricsRenderer = Arc<dyn Fn() -> String + Send + Sync>;

/// Minimal HTTP binding of the proxy service. The production SSE long-hold
/// lives in the push gateway; this service only returns the Grip headers
/// instructing the gateway which channel to hold.
#[derive(Clone)]
pub struct EdgeService {
    service: Arc<ProxyService>,
    auth_secret: Arc<Vec<u8>>,
    bypass_auth: bool,
    metrics_renderer: Option<MetricsRenderer>,
}

impl EdgeService {
    pub fn new(service: Arc<ProxyService>, auth_secret: &[u8], bypass_auth: bool) -> Self {
        EdgeService {
            service,
            auth_secret: Arc::new(auth_secret.to_vec()),
            bypass_auth,
            metrics_renderer: None,
        }
    }

    pub fn with_metrics_renderer(mut self, renderer: MetricsRenderer) -> Self {
        self.metrics_renderer = Some(renderer);
        self
    }

    /// Validates the bearer token and checks its environment claim against
    /// the environment in the path, when the path names one.
    fn authorize(&self, req: &Request<Incoming>, path_env: Option<&str>) -> Result<(), StatusCode> {
        if self.bypass_auth {
            return Ok(());
        }

        let token = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let claims =
            parse_token(token, &self.auth_secret).map_err(|_| StatusCode::UNAUTHORIZED)?;

        if let Some(env) = path_env
            && claims.env != env
        {
            return Err(StatusCode::FORBIDDEN);
        }
        Ok(())
    }

    async fn route(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let method = req.method().clone();

        match segments.as_slice() {
            ["health"] if method == Method::GET => json_response(StatusCode::OK, &self.service.health().await),

            ["metrics"] if method == Method::GET && self.metrics_renderer.is_some() => {
                let body = (self.metrics_renderer.as_ref().unwrap())();
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR))
            }

            ["client", "auth"] if method == Method::POST => {
                let body: AuthRequest = match read_json(req).await {
                    Ok(body) => body,
                    Err(status) => return error_response(status),
                };
                respond(self.service.authenticate(body).await)
            }

            ["client", "env", env, "feature-configs"] if method == Method::GET => {
                let env = env.to_string();
                if let Err(status) = self.authorize(&req, Some(&env)) {
                    return error_response(status);
                }
                respond(self.service.feature_configs(&env).await)
            }

            ["client", "env", env, "feature-configs", identifier] if method == Method::GET => {
                let (env, identifier) = (env.to_string(), identifier.to_string());
                if let Err(status) = self.authorize(&req, Some(&env)) {
                    return error_response(status);
                }
                respond(
                    self.service
                        .feature_config_by_identifier(&env, &identifier)
                        .await,
                )
            }

            ["client", "env", env, "target-segments"] if method == Method::GET => {
                let env = env.to_string();
                if let Err(status) = self.authorize(&req, Some(&env)) {
                    return error_response(status);
                }
                respond(self.service.target_segments(&env).await)
            }

            ["client", "env", env, "target-segments", identifier] if method == Method::GET => {
                let (env, identifier) = (env.to_string(), identifier.to_string());
                if let Err(status) = self.authorize(&req, Some(&env)) {
                    return error_response(status);
                }
                respond(
                    self.service
                        .target_segment_by_identifier(&env, &identifier)
                        .await,
                )
            }

            ["client", "env", env, "target", target, "evaluations"] if method == Method::GET => {
                let (env, target) = (env.to_string(), target.to_string());
                if let Err(status) = self.authorize(&req, Some(&env)) {
                    return error_response(status);
                }
                respond(self.service.evaluations(&env, &target).await)
            }

            ["client", "env", env, "target", target, "evaluations", feature] if method == Method::GET => {
                let (env, target, feature) =
                    (env.to_string(), target.to_string(), feature.to_string());
                if let Err(status) = self.authorize(&req, Some(&env)) {
                    return error_response(status);
                }
                respond(
                    self.service
                        .evaluations_by_feature(&env, &target, &feature)
                        .await,
                )
            }

            ["stream"] if method == Method::GET => {
                if let Err(status) = self.authorize(&req, None) {
                    return error_response(status);
                }
                let Some(api_key) = req
                    .headers()
                    .get("API-Key")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string())
                else {
                    return error_response(StatusCode::BAD_REQUEST);
                };

                match self.service.stream(&api_key).await {
                    Ok(stream) => Response::builder()
                        .status(StatusCode::OK)
                        .header(header::CONTENT_TYPE, "text/event-stream")
                        .header("Grip-Hold", "stream")
                        .header("Grip-Channel", stream.grip_channel)
                        .body(Full::new(Bytes::from("\n")))
                        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR)),
                    Err(e) => error_response(status_for(&e)),
                }
            }

            ["metrics", env] if method == Method::POST => {
                let env = env.to_string();
                if let Err(status) = self.authorize(&req, Some(&env)) {
                    return error_response(status);
                }
                let body: MetricsRequest = match read_json(req).await {
                    Ok(body) => body,
                    Err(status) => return error_response(status),
                };
                respond(self.service.metrics(&env, body).await.map(|()| serde_json::json!({})))
            }

            _ => error_response(StatusCode::NOT_FOUND),
        }
    }
}

impl Service<Request<Incoming>> for EdgeService {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.route(req).await) })
    }
}

fn status_for(e: &ServiceError) -> StatusCode {
    match e {
        ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::StreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Cache(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(result: Result<T, ServiceError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(e) => {
            if matches!(e, ServiceError::Cache(_) | ServiceError::Internal(_)) {
                tracing::error!(error = %e, "request failed");
            }
            error_response(status_for(&e))
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR),
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR))
}

fn error_response(status: StatusCode) -> Response<Full<Bytes>> {
    let message = status.canonical_reason().unwrap_or("an error occurred");
    let mut response = Response::new(Full::new(Bytes::from(message)));
    *response.status_mut() = status;
    response
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, StatusCode> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|_| StatusCode::BAD_REQUEST)
}
