use std::{future::ready, time::Duration};

use axum::{routing::get, Router};
use common_metrics::setup_metrics_routes;
use envconfig::Envconfig;
use eyre::Result;
use health::{HealthHandle, HealthRegistry};
use tracing::{error, info};

use txcheck_service::app_context::{register_check_liveness, AppContext};
use txcheck_service::config::Config;
use txcheck_service::metrics_constants;

common_alloc::used!();

async fn check_loop(context: AppContext, liveness: HealthHandle, interval_secs: u64) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        context
            .engine
            .check(
                context.transaction_timeout,
                context.transaction_check_max,
                &context.dispatcher,
            )
            .await;

        common_metrics::inc(metrics_constants::CHECK_LOOP_RUNS, &[], 1);
        liveness.report_healthy().await;
    }
}

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn app(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(|| ready("txcheck")))
        .route("/_readiness", get(|| ready("ok")))
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("failed to load configuration from env");
    tracing_subscriber::fmt::init();

    let liveness = HealthRegistry::new("liveness");

    let bind = format!("{}:{}", config.host, config.port);
    info!("starting txcheck-service, listening at {}", bind);

    let context = AppContext::new(&config, &liveness)
        .await
        .expect("failed to build app context");

    let check_liveness = register_check_liveness(&liveness, config.check_interval_secs).await;

    let check_interval_secs = config.check_interval_secs;
    let check_task = tokio::spawn(check_loop(context, check_liveness, check_interval_secs));

    let app = setup_metrics_routes(app(liveness));
    let http_server = tokio::spawn(listen(app, bind));

    tokio::select! {
        res = check_task => {
            error!("check loop exited");
            if let Err(e) = res {
                error!("check loop failed with: {}", e);
            }
        }
        res = http_server => {
            error!("http server exited");
            if let Err(e) = res {
                error!("server failed with: {}", e);
            }
        }
    }

    info!("exiting");
}
