//! NOTIFYCMD entry point.
//!
//! upsmon invokes this once per event, either as
//! `nutify-notify <ups@host> <EVENT>` or with a single legacy free-text
//! message. Exit codes: 0 processed, 1 pipeline failure, 2 unparseable
//! input.

#[macro_use]
extern crate slog_scope;

use std::sync::Arc;

use docopt::Docopt;
use serde_derive::Deserialize;

use nutify_common::db::SqliteDb;
use nutify_common::events::{classify_legacy_message, parse_standard_args, ParsedEvent};
use nutify_common::logging;
use nutify_common::metric_name::MetricName;
use nutify_common::metrics::{self, StatsdClientExt};
use nutify_common::secret::SecretStore;

use nutify_notify::{EventPipeline, Settings};

const USAGE: &str = "
Usage: nutify-notify [options] <args>...

Options:
    -h, --help                          Show this message.
    --config=CONFIGFILE                 Configuration file path.
";

#[derive(Debug, Deserialize)]
struct Args {
    flag_config: Option<String>,
    arg_args: Vec<String>,
}

fn parse_event(args: &[String]) -> Option<(ParsedEvent, String)> {
    match args {
        [target, event] => {
            parse_standard_args(target, event).map(|parsed| {
                let message = format!("UPS {} {}", parsed.ups_name, parsed.event_type);
                (parsed, message)
            })
        }
        [message] => classify_legacy_message(message).map(|parsed| (parsed, message.clone())),
        _ => None,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    let mut filenames = Vec::new();
    if let Some(ref config_filename) = args.flag_config {
        filenames.push(config_filename.clone());
    }
    let settings = match Settings::with_env_and_config_files(&filenames) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };
    logging::init_logging(
        !settings.human_logs,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    )
    .expect("Logging failed to initialize");

    let statsd = Arc::new(
        metrics::builder(
            &settings.statsd_label,
            &settings.statsd_host,
            settings.statsd_port,
        )
        .expect("Could not build metrics client"),
    );

    let Some((parsed, message)) = parse_event(&args.arg_args) else {
        error!("Cannot parse notifier input: {:?}", args.arg_args);
        statsd.incr_with_tags(MetricName::EventParseError).send();
        logging::reset_logging();
        std::process::exit(2);
    };
    debug!(
        "Received event {} for {}",
        parsed.event_type, parsed.ups_name
    );

    let db = match SqliteDb::open(&settings.db_path) {
        Ok(db) => db,
        Err(e) => {
            error!("Cannot open database {}: {}", settings.db_path, e);
            logging::reset_logging();
            std::process::exit(1);
        }
    };
    let secret = SecretStore::from_env_value(settings.encryption_key.as_deref()).map(Arc::new);

    let pipeline = EventPipeline::new(Arc::new(db), secret, settings, statsd);
    let code = match pipeline.process(&parsed, &message, None).await {
        Ok(summary) => {
            info!(
                "Event {} stored; {} notification(s) sent, {} failed",
                summary.event_id,
                summary.sent(),
                summary.failed()
            );
            0
        }
        Err(e) => {
            error!("Event processing failed: {}", e);
            1
        }
    };
    logging::reset_logging();
    std::process::exit(code);
}
