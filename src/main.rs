use inbox_triage_lib::error::{ErrorReport, TriageError};
use inbox_triage_lib::propagation;
use inbox_triage_lib::server::{self, ServiceState};
use inbox_triage_lib::state::AppState;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        let report = ErrorReport::from(&e);
        log::error!("{}", report.message);
        eprintln!("{}", report.recovery_suggestion);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), TriageError> {
    let state = AppState::load()?;
    let bind = state.config.server.bind.clone();

    let propagator = propagation::propagator_for(&state.config.propagation);
    tokio::spawn(propagation::run_worker(
        state.db.clone(),
        propagator,
        state.config.propagation.clone(),
    ));

    server::serve(ServiceState::from(state), &bind).await
}
