use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dotenv::dotenv;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::LevelFilter;

use fieldjobs::{
    config::Config,
    db::{db::DBClient, jobdb::JobStore, memory::InMemoryStore, reliabilitydb::ReliabilityStore},
    mail::sendmail::SmtpSettings,
    service::{
        background_jobs::start_finalize_job,
        escrow_service::{EscrowLedger, EscrowService, HttpLedgerClient, SandboxLedger},
        job_service::JobService,
        notification_service::{EmailAlertSink, LogSink, NotificationService, NotificationSink},
        trust_service::TrustService,
    },
    utils::clock::SystemClock,
};

#[derive(Debug, Clone)]
pub struct AppState {
    pub env: Config,
    pub job_service: Arc<JobService>,
    pub trust_service: Arc<TrustService>,
    pub escrow_service: Arc<EscrowService>,
    pub notification_service: Arc<NotificationService>,
}

impl AppState {
    pub fn new(
        config: Config,
        job_store: Arc<dyn JobStore>,
        reliability_store: Arc<dyn ReliabilityStore>,
        ledger: Arc<dyn EscrowLedger>,
    ) -> Self {
        let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink) as Arc<dyn NotificationSink>];
        if let Some(sink) = alert_sink(config.smtp.clone(), config.alert_email.clone()) {
            sinks.push(sink);
        }

        let notification_service = Arc::new(NotificationService::new(sinks));
        let trust_service = Arc::new(TrustService::new(reliability_store));
        let escrow_service = Arc::new(EscrowService::new(
            ledger,
            Duration::from_secs(config.ledger_timeout_secs),
        ));

        let job_service = Arc::new(JobService::new(
            job_store,
            escrow_service.clone(),
            trust_service.clone(),
            notification_service.clone(),
            config.penalties,
            Arc::new(SystemClock),
        ));

        Self {
            env: config,
            job_service,
            trust_service,
            escrow_service,
            notification_service,
        }
    }
}

fn alert_sink(smtp: Option<SmtpSettings>, alert_email: Option<String>) -> Option<Arc<dyn NotificationSink>> {
    match (smtp, alert_email) {
        (Some(settings), Some(to)) => Some(Arc::new(EmailAlertSink::new(settings, to)) as Arc<dyn NotificationSink>),
        (Some(_), None) => {
            tracing::warn!("SMTP is configured but ALERT_EMAIL is not, operational alerts will only be logged");
            None
        }
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = Config::init()?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO))
        .init();

    let (job_store, reliability_store): (Arc<dyn JobStore>, Arc<dyn ReliabilityStore>) = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(url)
                .await
                .context("Failed to connect to the database")?;
            tracing::info!("Connection to the database is successful");

            let db_client = Arc::new(DBClient::new(pool));
            let jobs: Arc<dyn JobStore> = db_client.clone();
            let reliability: Arc<dyn ReliabilityStore> = db_client;
            (jobs, reliability)
        }
        None => {
            tracing::warn!("DATABASE_URL is not set, using the in-memory store");
            let store = Arc::new(InMemoryStore::new());
            let jobs: Arc<dyn JobStore> = store.clone();
            let reliability: Arc<dyn ReliabilityStore> = store;
            (jobs, reliability)
        }
    };

    let ledger: Arc<dyn EscrowLedger> = match &config.ledger_url {
        Some(url) => {
            let client = HttpLedgerClient::new(url, &config.ledger_api_key, Duration::from_secs(config.ledger_timeout_secs))
                .context("Failed to build the ledger client")?;
            Arc::new(client) as Arc<dyn EscrowLedger>
        }
        None => {
            tracing::warn!("LEDGER_URL is not set, payments go to the sandbox ledger");
            Arc::new(SandboxLedger::new()) as Arc<dyn EscrowLedger>
        }
    };

    let app_state = Arc::new(AppState::new(config, job_store, reliability_store, ledger));

    let finalize_every = Duration::from_secs(app_state.env.finalize_interval_secs);
    let batch_size = app_state.env.finalize_batch_size;
    let job_service = app_state.job_service.clone();
    tokio::spawn(async move {
        start_finalize_job(job_service, finalize_every, batch_size).await;
    });

    tracing::info!(
        "Settlement worker running, finalizing every {:?}",
        finalize_every
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    Ok(())
}
