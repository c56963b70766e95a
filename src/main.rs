//! Server binary: parse the configuration, bring the sinks up, run the
//! reactor until it stops.

use clap::Parser;

use skiff::config::Config;
use skiff::logger::Logger;
use skiff::server::WebServer;

fn main() {
    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let logger = if config.no_log {
        None
    } else {
        match Logger::init(
            Logger::level_from_cli(config.log_level),
            &config.log_dir,
            ".log",
            config.log_queue,
        ) {
            Ok(logger) => {
                if logger.install().is_err() {
                    eprintln!("log sink already installed");
                }
                Some(logger)
            }
            Err(e) => {
                eprintln!("log init failed: {e}");
                std::process::exit(1);
            }
        }
    };

    match WebServer::new(&config) {
        Ok(mut server) => server.run(),
        Err(e) => {
            log::error!("========== Server init error! ==========");
            log::error!("{e}");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }

    if let Some(logger) = logger {
        logger.shutdown();
    }
}
