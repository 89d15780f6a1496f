mod catalog;
mod routes;

use notice_core::config::Settings;
use notice_core::extraction::{RigCompletion, TextCompletion};
use notice_core::pipeline::{Pipeline, PreFilter, SpoolMailbox};
use notice_core::reconcile::Reconciler;
use notice_core::Store;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,notice_core=info,notice_server=info")
        }))
        .init();

    let settings = Settings::from_env();
    let store = Store::open(&settings.db_path)?;
    tracing::info!(db = %settings.db_path.display(), "store opened");

    let completion: Option<Arc<dyn TextCompletion>> = match settings.llm.clone() {
        Some(config) => match RigCompletion::new(config) {
            Ok(completion) => Some(Arc::new(completion)),
            Err(err) => {
                tracing::warn!(error = %err, "llm unavailable; notifications go to manual review");
                None
            }
        },
        None => {
            tracing::warn!("no llm api key configured; notifications go to manual review");
            None
        }
    };

    let intake = build_pipeline(
        &settings,
        store.clone(),
        settings.filter.clone(),
        completion.clone(),
    );
    let intake_settings = settings.clone();
    std::thread::spawn(move || run_intake_loop(intake, intake_settings));

    let reconcile_store = store.clone();
    let reconcile_settings = settings.clone();
    std::thread::spawn(move || run_reconcile_loop(reconcile_store, reconcile_settings));

    // Explicit submissions bypass the mail pre-filter.
    let submissions = build_pipeline(&settings, store.clone(), PreFilter::default(), completion);
    let app = routes::router(routes::AppState {
        store,
        pipeline: Arc::new(submissions),
    });

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!("noticehub listening on {}", settings.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_pipeline(
    settings: &Settings,
    store: Store,
    filter: PreFilter,
    completion: Option<Arc<dyn TextCompletion>>,
) -> Pipeline {
    let pipeline =
        Pipeline::new(store, filter).with_voting(settings.llm_votes, settings.llm_max_attempts);
    match completion {
        Some(completion) => pipeline.with_completion(completion),
        None => pipeline,
    }
}

fn run_intake_loop(pipeline: Pipeline, settings: Settings) {
    if let Err(err) = pipeline.resume_pending(100) {
        tracing::error!(error = %err, "resuming pending notifications failed");
    }

    let Some(dir) = settings.email_spool_dir.clone() else {
        tracing::info!("EMAIL_SPOOL_DIR not set; mailbox intake disabled");
        return;
    };
    let mailbox = SpoolMailbox::new(dir);
    loop {
        if let Err(err) = pipeline.run_once(&mailbox) {
            tracing::error!(error = %err, "intake pass failed");
        }
        std::thread::sleep(settings.email_check_interval);
    }
}

fn run_reconcile_loop(store: Store, settings: Settings) {
    std::thread::sleep(settings.consistency_check_initial_delay);
    let reconciler = Reconciler::new(store);
    loop {
        let stats = reconciler.run_check();
        if stats.errors > 0 {
            tracing::error!(?stats, "consistency check reported errors");
        }
        std::thread::sleep(settings.consistency_check_interval);
    }
}
