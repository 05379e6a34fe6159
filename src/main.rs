use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match http_telemetry::run_server().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Config errors happen before the subscriber is installed
            if ::tracing::dispatcher::has_been_set() {
                ::tracing::error!(error = %format!("{:#}", e), "Server exited with error");
            } else {
                eprintln!("Fatal error: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}
