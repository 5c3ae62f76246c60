use pingora::services::listening::Service;
use pingora_core::server::{configuration::Opt, Server};
use sentry::IntoDsn;

use simrelay::{
    config::{Config, Sentry},
    logging::Logger,
    service::http::SimulationHttpApp,
};

fn main() {
    // Load configuration and command-line arguments
    let cli_options = Opt::parse_args();
    let config = match Config::load_yaml_with_opt_override(&cli_options) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    let logger = if let Some(log_cfg) = &config.log {
        let logger = Logger::new(log_cfg.clone());
        logger.init_env_logger();
        Some(logger)
    } else {
        env_logger::init();
        None
    };

    log::info!(
        "Engine {} via {} delivery, timeout {}s",
        config.engine.path,
        config.engine.delivery,
        config.engine.timeout
    );

    let simulation_service = SimulationHttpApp::simulation_http_service(&config);

    let mut server = Server::new_with_opt_and_conf(Some(cli_options), config.pingora);

    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        server.add_service(log_service);
    }

    if let Some(sentry_cfg) = &config.sentry {
        configure_sentry(&mut server, sentry_cfg);
    }

    if let Some(prometheus_cfg) = &config.prometheus {
        log::info!("Adding Prometheus HTTP...");
        let mut prometheus_service_http = Service::prometheus_http_service();
        prometheus_service_http.add_tcp(&prometheus_cfg.address.to_string());
        server.add_service(prometheus_service_http);
    }

    log::info!("Bootstrapping...");
    server.bootstrap();

    log::info!("Bootstrapped. Adding simulation service...");
    server.add_service(simulation_service);

    log::info!("Starting Server...");
    server.run_forever();
}

fn configure_sentry(server: &mut Server, cfg: &Sentry) {
    log::info!("Adding Sentry config...");
    let dsn = match cfg.dsn.clone().into_dsn() {
        Ok(Some(dsn)) => dsn,
        Ok(None) => {
            log::warn!("Sentry DSN is empty or invalid, Sentry disabled.");
            return;
        }
        Err(e) => {
            log::error!("Error parsing Sentry DSN: {e}");
            return;
        }
    };
    server.sentry = Some(sentry::ClientOptions {
        dsn: Some(dsn),
        ..Default::default()
    });
}
