use std::collections::HashSet;

use http::{header, HeaderMap, HeaderValue, Response, StatusCode};

use crate::{config, utils::response::ResponseBuilder};

const ALL_METHODS: &str = "GET,POST,PUT,DELETE,PATCH,OPTIONS,HEAD";

/// Cross-origin rules applied to every response of the simulation endpoint.
#[derive(Debug)]
pub struct CorsPolicy {
    allow_origins: Option<HashSet<String>>,
    allow_methods: String,
    allow_headers: String,
    expose_headers: Option<String>,
    max_age: i32,
    allow_credential: bool,
}

impl CorsPolicy {
    pub fn new(cfg: &config::Cors) -> Self {
        let allow_origins = if cfg.allow_origins == "*" {
            None
        } else {
            Some(
                cfg.allow_origins
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            )
        };

        Self {
            allow_origins,
            allow_methods: if cfg.allow_methods == "*" {
                ALL_METHODS.to_string()
            } else {
                cfg.allow_methods.clone()
            },
            allow_headers: cfg.allow_headers.clone(),
            expose_headers: cfg.expose_headers.clone(),
            max_age: cfg.max_age,
            allow_credential: cfg.allow_credential,
        }
    }

    fn is_origin_allowed(&self, origin: &str) -> bool {
        match &self.allow_origins {
            None => true,
            Some(allowed) => allowed.contains(origin),
        }
    }

    /// Preflight answer, `None` when the request carries no allowed origin.
    pub fn preflight(&self, req_headers: &HeaderMap) -> Option<Response<Vec<u8>>> {
        let origin = req_headers.get(header::ORIGIN)?.to_str().ok()?;
        if !self.is_origin_allowed(origin) {
            return None;
        }
        let mut resp = ResponseBuilder::empty(StatusCode::NO_CONTENT);
        self.apply(req_headers, &mut resp);
        Some(resp)
    }

    pub fn apply(&self, req_headers: &HeaderMap, resp: &mut Response<Vec<u8>>) {
        let Some(origin) = req_headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        if !self.is_origin_allowed(origin) {
            return;
        }

        let headers = resp.headers_mut();
        let mut insert = |name: header::HeaderName, value: &str| {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.insert(name, value);
                }
                Err(e) => log::error!("Invalid CORS header value '{}': {}", value, e),
            }
        };

        insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        if self.allow_credential {
            insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
        }
        insert(header::ACCESS_CONTROL_ALLOW_METHODS, &self.allow_methods);
        insert(header::ACCESS_CONTROL_ALLOW_HEADERS, &self.allow_headers);
        insert(header::ACCESS_CONTROL_MAX_AGE, &self.max_age.to_string());
        if let Some(expose) = &self.expose_headers {
            insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, expose);
        }
        if self.allow_origins.is_some() {
            insert(header::VARY, "Origin");
        }
    }
}
