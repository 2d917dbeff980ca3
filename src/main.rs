use orchestrator::Config;

#[tokio::main]
async fn main() {
    orchestrator::serve(Config::init().clone())
        .await
        .unwrap_or_else(|err| {
            tracing::error!(error = %err, "MWS orchestrator stopped");
            eprintln!("Error: {}", err);
            std::process::exit(1);
        });
}
