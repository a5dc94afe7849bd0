#[tokio::main]
async fn main() {
    match tilestitch_app::run_from_env().await {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            tracing::error!("{error:#}");
            std::process::exit(tilestitch_app::exit_code_for(&error));
        }
    }
}
