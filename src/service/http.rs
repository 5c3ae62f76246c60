use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, Method, Response, StatusCode};
use matchit::Router;
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde_json::json;

use crate::{
    config::Config,
    orchestrator::{Orchestrator, SimulationError},
    utils::response::{CommonErrors, ResponseBuilder},
};

use super::cors::CorsPolicy;

pub const LIVENESS_MESSAGE: &str = "Simulation server is running";

/// Request data the handlers need, detached from the pingora session.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Result<Bytes, BodyError>,
}

#[derive(Debug)]
pub enum BodyError {
    /// The body grew past the configured limit, in bytes.
    TooLarge(usize),
    Read(String),
}

impl fmt::Display for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyError::TooLarge(limit) => write!(f, "Request body exceeds {limit} bytes"),
            BodyError::Read(e) => write!(f, "failed to read request body: {e}"),
        }
    }
}

impl HttpRequest {
    fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

#[async_trait]
trait Handler {
    async fn handle(&self, orchestrator: &Orchestrator, req: &HttpRequest) -> Response<Vec<u8>>;
}

pub struct SimulationHttpApp {
    orchestrator: Arc<Orchestrator>,
    router: Router<HashMap<Method, Box<dyn Handler + Send + Sync>>>,
    cors: Option<CorsPolicy>,
    max_body_size: usize,
}

impl SimulationHttpApp {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        cors: Option<CorsPolicy>,
        max_body_size: usize,
    ) -> Self {
        let mut this = Self {
            orchestrator,
            router: Router::new(),
            cors,
            max_body_size,
        };

        this.route("/", Method::GET, Box::new(LivenessHandler))
            .route("/simulate", Method::POST, Box::new(SimulateHandler));

        this
    }

    fn route(
        &mut self,
        path: &str,
        method: Method,
        handler: Box<dyn Handler + Send + Sync>,
    ) -> &mut Self {
        if self.router.at(path).is_err() {
            let mut handlers = HashMap::new();
            handlers.insert(method, handler);
            if let Err(e) = self.router.insert(path, handlers) {
                log::error!("Failed to register route {path}: {e}");
            }
        } else if let Ok(routes) = self.router.at_mut(path) {
            routes.value.insert(method, handler);
        }
        self
    }

    pub fn simulation_http_service(cfg: &Config) -> Service<Self> {
        let orchestrator = Arc::new(Orchestrator::from_config(&cfg.engine));
        let app = Self::new(
            orchestrator,
            cfg.cors.as_ref().map(CorsPolicy::new),
            cfg.http.max_body_size,
        );
        let mut service = Service::new("Simulation HTTP".to_string(), app);
        for listener in &cfg.listeners {
            service.add_tcp(&listener.address.to_string());
        }
        service
    }

    /// Routes one request and applies CORS headers to the answer.
    pub async fn dispatch(&self, req: &HttpRequest) -> Response<Vec<u8>> {
        if req.method == Method::OPTIONS {
            if let Some(resp) = self
                .cors
                .as_ref()
                .and_then(|cors| cors.preflight(&req.headers))
            {
                return resp;
            }
        }

        let mut resp = match self.router.at(&req.path) {
            Ok(matched) => match matched.value.get(&req.method) {
                Some(handler) => handler.handle(&self.orchestrator, req).await,
                None => CommonErrors::method_not_allowed(),
            },
            Err(_) => CommonErrors::not_found(),
        };

        if let Some(cors) = &self.cors {
            cors.apply(&req.headers, &mut resp);
        }
        resp
    }
}

#[async_trait]
impl ServeHttp for SimulationHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        let (method, path, headers) = {
            let req_header = http_session.req_header();
            (
                req_header.method.clone(),
                req_header.uri.path().to_string(),
                req_header.headers.clone(),
            )
        };
        let body = read_request_body(http_session, self.max_body_size).await;

        let req = HttpRequest {
            method,
            path,
            headers,
            body,
        };
        let resp = self.dispatch(&req).await;
        log::info!("{} {} {}", req.method, req.path, resp.status().as_u16());
        resp
    }
}

async fn read_request_body(
    http_session: &mut ServerSession,
    limit: usize,
) -> Result<Bytes, BodyError> {
    let mut body_data = Vec::new();
    loop {
        match http_session.read_request_body().await {
            Ok(Some(bytes)) => append_body_chunk(&mut body_data, &bytes, limit)?,
            Ok(None) => break,
            Err(e) => return Err(BodyError::Read(e.to_string())),
        }
    }
    Ok(Bytes::from(body_data))
}

fn append_body_chunk(body: &mut Vec<u8>, chunk: &[u8], limit: usize) -> Result<(), BodyError> {
    if body.len() + chunk.len() > limit {
        return Err(BodyError::TooLarge(limit));
    }
    body.extend_from_slice(chunk);
    Ok(())
}

struct LivenessHandler;

#[async_trait]
impl Handler for LivenessHandler {
    async fn handle(&self, _orchestrator: &Orchestrator, _req: &HttpRequest) -> Response<Vec<u8>> {
        ResponseBuilder::text(StatusCode::OK, LIVENESS_MESSAGE)
    }
}

struct SimulateHandler;

#[async_trait]
impl Handler for SimulateHandler {
    async fn handle(&self, orchestrator: &Orchestrator, req: &HttpRequest) -> Response<Vec<u8>> {
        let outcome = match &req.body {
            Ok(body) => orchestrator.handle_http(req.content_type(), body).await,
            Err(e @ BodyError::TooLarge(_)) => {
                log::warn!("Rejected simulation request: {e}");
                return ResponseBuilder::json(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    &json!({ "error": e.to_string() }),
                );
            }
            Err(e @ BodyError::Read(_)) => Err(SimulationError::InvalidInput(e.to_string())),
        };

        match outcome {
            Ok(result) => ResponseBuilder::json(StatusCode::OK, &result),
            Err(e) => ResponseBuilder::json(e.status(), &e.to_json()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use serde_json::Value;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        config::{self, Handoff},
        engine::{DeliveryMode, ProcessRunner},
        orchestrator::EngineSettings,
    };

    fn app(dir: &TempDir, script: &str, cors: Option<config::Cors>) -> SimulationHttpApp {
        let script_path = dir.path().join("engine.sh");
        std::fs::write(&script_path, script).unwrap();
        let settings = EngineSettings {
            path: PathBuf::from("/bin/sh"),
            fallback_path: None,
            args: vec![script_path.display().to_string()],
            delivery: DeliveryMode::Stdin,
            timeout: Duration::from_secs(10),
            handoff: Handoff::default(),
        };
        let orchestrator = Arc::new(Orchestrator::new(settings, Arc::new(ProcessRunner)));
        SimulationHttpApp::new(orchestrator, cors.as_ref().map(CorsPolicy::new), 1024)
    }

    fn request(method: Method, path: &str, content_type: Option<&str>, body: &str) -> HttpRequest {
        let mut headers = HeaderMap::new();
        if let Some(ct) = content_type {
            headers.insert(header::CONTENT_TYPE, ct.parse().unwrap());
        }
        HttpRequest {
            method,
            path: path.to_string(),
            headers,
            body: Ok(Bytes::from(body.to_string())),
        }
    }

    fn json_body(resp: &Response<Vec<u8>>) -> Value {
        serde_json::from_slice(resp.body()).unwrap()
    }

    #[tokio::test]
    async fn test_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "cat\n", None);
        let resp = app.dispatch(&request(Method::GET, "/", None, "")).await;
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!(LIVENESS_MESSAGE.as_bytes(), resp.body().as_slice());
    }

    #[tokio::test]
    async fn test_simulate_success() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "cat > /dev/null\necho '{\"momentum\":50}'\n", None);
        let resp = app
            .dispatch(&request(
                Method::POST,
                "/simulate",
                Some("application/json"),
                r#"{"mass":10,"velocity":5}"#,
            ))
            .await;
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!(json!({"momentum": 50}), json_body(&resp));
    }

    #[tokio::test]
    async fn test_simulate_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "cat\n", None);
        let resp = app
            .dispatch(&request(Method::POST, "/simulate", Some("text/plain"), "{}"))
            .await;
        assert_eq!(StatusCode::BAD_REQUEST, resp.status());
        assert_eq!(json!({"error": "Invalid JSON"}), json_body(&resp));
    }

    #[tokio::test]
    async fn test_simulate_unreadable_body() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "cat\n", None);
        let mut req = request(Method::POST, "/simulate", Some("application/json"), "");
        req.body = Err(BodyError::Read("connection reset".to_string()));
        let resp = app.dispatch(&req).await;
        assert_eq!(StatusCode::BAD_REQUEST, resp.status());
    }

    #[tokio::test]
    async fn test_simulate_body_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "cat\n", None);
        let mut req = request(Method::POST, "/simulate", Some("application/json"), "");
        req.body = Err(BodyError::TooLarge(1024));
        let resp = app.dispatch(&req).await;
        assert_eq!(StatusCode::PAYLOAD_TOO_LARGE, resp.status());
        assert_eq!(
            json!({"error": "Request body exceeds 1024 bytes"}),
            json_body(&resp)
        );
    }

    #[test]
    fn test_body_chunks_respect_limit() {
        let mut body = Vec::new();
        append_body_chunk(&mut body, b"{\"seed\":", 12).unwrap();
        append_body_chunk(&mut body, b"42}", 12).unwrap();
        assert_eq!(br#"{"seed":42}"#.to_vec(), body);

        let err = append_body_chunk(&mut body, b"  ", 12).unwrap_err();
        assert!(matches!(err, BodyError::TooLarge(12)));
        assert_eq!(11, body.len());
    }

    #[tokio::test]
    async fn test_simulate_engine_failure() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "echo 'bad seed' >&2\nexit 1\n", None);
        let resp = app
            .dispatch(&request(
                Method::POST,
                "/simulate",
                Some("application/json"),
                "{}",
            ))
            .await;
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, resp.status());
        assert_eq!(
            json!({"error": "Simulation failed", "details": "bad seed\n"}),
            json_body(&resp)
        );
    }

    #[tokio::test]
    async fn test_simulate_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "echo 'no output' >&2\n", None);
        let resp = app
            .dispatch(&request(
                Method::POST,
                "/simulate",
                Some("application/json"),
                "{}",
            ))
            .await;
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, resp.status());
        assert_eq!(
            json!({"error": "Engine returned empty result", "stderr": "no output\n"}),
            json_body(&resp)
        );
    }

    #[tokio::test]
    async fn test_unknown_route_and_method() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "cat\n", None);

        let resp = app.dispatch(&request(Method::GET, "/missing", None, "")).await;
        assert_eq!(StatusCode::NOT_FOUND, resp.status());

        let resp = app.dispatch(&request(Method::GET, "/simulate", None, "")).await;
        assert_eq!(StatusCode::METHOD_NOT_ALLOWED, resp.status());
    }

    #[tokio::test]
    async fn test_cors_headers_and_preflight() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "cat\n", Some(config::Cors::default()));

        let mut preflight = request(Method::OPTIONS, "/simulate", None, "");
        preflight
            .headers
            .insert(header::ORIGIN, "http://localhost:3000".parse().unwrap());
        let resp = app.dispatch(&preflight).await;
        assert_eq!(StatusCode::NO_CONTENT, resp.status());
        assert_eq!(
            "http://localhost:3000",
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap()
        );

        let mut req = request(
            Method::POST,
            "/simulate",
            Some("application/json"),
            r#"{"seed":42}"#,
        );
        req.headers
            .insert(header::ORIGIN, "http://localhost:3000".parse().unwrap());
        let resp = app.dispatch(&req).await;
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!(json!({"seed": 42}), json_body(&resp));
        assert!(resp
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn test_options_without_cors() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "cat\n", None);
        let resp = app
            .dispatch(&request(Method::OPTIONS, "/simulate", None, ""))
            .await;
        assert_eq!(StatusCode::METHOD_NOT_ALLOWED, resp.status());
    }
}
