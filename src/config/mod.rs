use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::engine::DeliveryMode;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[validate(nested)]
    pub engine: EngineConfig,

    #[serde(default)]
    #[validate(nested)]
    pub http: Http,

    #[validate(nested)]
    pub cors: Option<Cors>,
    pub log: Option<Log>,
    pub prometheus: Option<Prometheus>,
    pub sentry: Option<Sentry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pingora: ServerConf::default(),
            listeners: vec![Listener {
                address: ([127, 0, 0, 1], 8000).into(),
            }],
            engine: EngineConfig::default(),
            http: Http::default(),
            cors: None,
            log: None,
            prometheus: None,
            sentry: None,
        }
    }
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        let mut conf = match &opt.conf {
            Some(path) => Self::load_from_yaml(path)?,
            None => {
                debug!("No conf path specified, using built-in defaults");
                let conf = Self::default();
                conf.validate()
                    .or_err_with(FileReadError, || "Default conf valid failed")?;
                conf
            }
        };
        conf.merge_with_opt(opt);
        Ok(conf)
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .or_err_with(InternalError, || "Unable to serialize conf to yaml")
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Listener {
    pub address: SocketAddr,
}

/// How the simulation engine is located and driven.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "EngineConfig::validate_handoff"))]
pub struct EngineConfig {
    /// Primary executable location, checked on every request.
    #[validate(length(min = 1))]
    pub path: String,
    /// Checked when `path` does not exist, usually a working-directory relative name.
    pub fallback_path: Option<String>,
    /// Extra arguments placed before the delivery arguments.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub delivery: DeliveryMode,
    /// Wall-clock bound for one engine run, in seconds.
    #[serde(default = "EngineConfig::default_timeout")]
    #[validate(range(min = 1))]
    pub timeout: u64,
    #[serde(default)]
    #[validate(nested)]
    pub handoff: Handoff,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: "./Engine/engine".to_string(),
            fallback_path: Some("engine".to_string()),
            args: Vec::new(),
            delivery: DeliveryMode::default(),
            timeout: Self::default_timeout(),
            handoff: Handoff::default(),
        }
    }
}

impl EngineConfig {
    fn default_timeout() -> u64 {
        60
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    fn validate_handoff(&self) -> Result<(), ValidationError> {
        if self.delivery == DeliveryMode::File
            && self.handoff.input_file == self.handoff.output_file
        {
            return Err(ValidationError::new("handoff_files_must_differ"));
        }
        Ok(())
    }
}

/// File handoff settings, only consulted in `file` delivery mode.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Handoff {
    #[serde(default = "Handoff::default_dir")]
    pub dir: PathBuf,
    #[serde(default = "Handoff::default_input_file")]
    #[validate(length(min = 1))]
    pub input_file: String,
    #[serde(default = "Handoff::default_output_file")]
    #[validate(length(min = 1))]
    pub output_file: String,
    /// Allocate unique files per request instead of serializing on the fixed names.
    #[serde(default = "Handoff::default_per_request")]
    pub per_request: bool,
}

impl Default for Handoff {
    fn default() -> Self {
        Self {
            dir: Self::default_dir(),
            input_file: Self::default_input_file(),
            output_file: Self::default_output_file(),
            per_request: Self::default_per_request(),
        }
    }
}

impl Handoff {
    fn default_dir() -> PathBuf {
        PathBuf::from(".")
    }

    fn default_input_file() -> String {
        "input.json".to_string()
    }

    fn default_output_file() -> String {
        "output.json".to_string()
    }

    fn default_per_request() -> bool {
        true
    }
}

/// Limits applied by the HTTP endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Http {
    /// Largest accepted request body, in bytes.
    #[serde(default = "Http::default_max_body_size")]
    #[validate(range(min = 1))]
    pub max_body_size: usize,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            max_body_size: Self::default_max_body_size(),
        }
    }
}

impl Http {
    fn default_max_body_size() -> usize {
        10 * 1024 * 1024
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Cors::validate"))]
pub struct Cors {
    /// Comma separated origins, or `*` for any origin.
    #[serde(default = "Cors::default_star")]
    #[validate(custom(function = "Cors::validate_origins"))]
    pub allow_origins: String,

    #[serde(default = "Cors::default_methods")]
    #[validate(custom(function = "Cors::validate_methods"))]
    pub allow_methods: String,

    #[serde(default = "Cors::default_star")]
    #[validate(custom(function = "Cors::validate_headers"))]
    pub allow_headers: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expose_headers: Option<String>,

    #[serde(default = "Cors::default_max_age")]
    pub max_age: i32,

    #[serde(default)]
    pub allow_credential: bool,
}

impl Default for Cors {
    fn default() -> Self {
        Self {
            allow_origins: Self::default_star(),
            allow_methods: Self::default_methods(),
            allow_headers: Self::default_star(),
            expose_headers: None,
            max_age: Self::default_max_age(),
            allow_credential: false,
        }
    }
}

impl Cors {
    fn default_star() -> String {
        "*".to_string()
    }

    fn default_methods() -> String {
        "GET,POST,OPTIONS".to_string()
    }

    fn default_max_age() -> i32 {
        5
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.allow_credential && self.allow_origins == "*" {
            return Err(ValidationError::new(
                "allow_credential cannot be used with allow_origins='*'",
            ));
        }
        Ok(())
    }

    fn validate_origins(origins: &str) -> Result<(), ValidationError> {
        if origins.is_empty() {
            return Err(ValidationError::new("allow_origins cannot be empty"));
        }
        if origins != "*" && origins.split(',').map(str::trim).any(str::is_empty) {
            return Err(ValidationError::new("allow_origins contains empty origin"));
        }
        Ok(())
    }

    fn validate_methods(methods: &str) -> Result<(), ValidationError> {
        if methods == "*" {
            return Ok(());
        }
        for method in methods.split(',').map(str::trim) {
            if !["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS", "HEAD"]
                .contains(&method.to_uppercase().as_str())
            {
                return Err(ValidationError::new("invalid HTTP method"));
            }
        }
        Ok(())
    }

    fn validate_headers(headers: &str) -> Result<(), ValidationError> {
        if headers == "*" {
            return Ok(());
        }
        for header in headers.split(',').map(str::trim) {
            if !header.chars().all(|c| c.is_alphanumeric() || c == '-') {
                return Err(ValidationError::new("invalid header name"));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prometheus {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sentry {
    pub dsn: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
pingora:
  version: 1
  threads: 2

listeners:
  - address: 0.0.0.0:8000
  - address: "[::1]:8000"

engine:
  path: /opt/engine/engine
  fallback_path: engine
  args: ["--quiet"]
  delivery: file
  timeout: 30
  handoff:
    dir: /tmp/simrelay
    input_file: in.json
    output_file: out.json
    per_request: false

http:
  max_body_size: 65536

cors:
  allow_origins: "http://localhost:3000"

log:
  path: /var/log/simrelay/simrelay.log

prometheus:
  address: 127.0.0.1:9091
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(2, conf.pingora.threads);
        assert_eq!(2, conf.listeners.len());
        assert_eq!("/opt/engine/engine", conf.engine.path);
        assert_eq!(Some("engine".to_string()), conf.engine.fallback_path);
        assert_eq!(vec!["--quiet".to_string()], conf.engine.args);
        assert_eq!(DeliveryMode::File, conf.engine.delivery);
        assert_eq!(Duration::from_secs(30), conf.engine.timeout());
        assert_eq!(PathBuf::from("/tmp/simrelay"), conf.engine.handoff.dir);
        assert!(!conf.engine.handoff.per_request);
        assert_eq!(65536, conf.http.max_body_size);
        let cors = conf.cors.as_ref().unwrap();
        assert_eq!("GET,POST,OPTIONS", cors.allow_methods);
        assert!(conf.log.is_some());
        assert!(conf.prometheus.is_some());
        assert!(conf.sentry.is_none());
        print!("{}", conf.to_yaml().unwrap());
    }

    #[test]
    fn test_engine_defaults() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: 0.0.0.0:8000

engine:
  path: ./Engine/engine
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(DeliveryMode::Stdin, conf.engine.delivery);
        assert_eq!(60, conf.engine.timeout);
        assert!(conf.engine.args.is_empty());
        assert!(conf.engine.handoff.per_request);
        assert_eq!("input.json", conf.engine.handoff.input_file);
        assert_eq!("output.json", conf.engine.handoff.output_file);
        assert_eq!(10 * 1024 * 1024, conf.http.max_body_size);
    }

    #[test]
    fn test_default_config_is_valid() {
        init_log();
        let conf = Config::default();
        assert!(conf.validate().is_ok());
        assert_eq!(8000, conf.listeners[0].address.port());
    }

    #[test]
    fn test_valid_listeners_length() {
        init_log();
        let conf_str = r#"
---
listeners: []

engine:
  path: ./engine
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_engine_path() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: 0.0.0.0:8000

engine:
  path: ""
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_engine_timeout() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: 0.0.0.0:8000

engine:
  path: ./engine
  timeout: 0
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_max_body_size() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: 0.0.0.0:8000

engine:
  path: ./engine

http:
  max_body_size: 0
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_delivery_mode() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: 0.0.0.0:8000

engine:
  path: ./engine
  delivery: socket
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_handoff_files_differ() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: 0.0.0.0:8000

engine:
  path: ./engine
  delivery: file
  handoff:
    input_file: data.json
    output_file: data.json
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_cors_credential_with_star() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: 0.0.0.0:8000

engine:
  path: ./engine

cors:
  allow_origins: "*"
  allow_credential: true
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_cors_methods() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: 0.0.0.0:8000

engine:
  path: ./engine

cors:
  allow_methods: "GET,FETCH"
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }
}
