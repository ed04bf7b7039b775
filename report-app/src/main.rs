#[tokio::main]
async fn main() {
    report_app::init_tracing();

    let demo_mode = std::env::args().any(|arg| arg == "--demo");
    let config = report_core::SyncConfig::from_env();

    let result = if demo_mode {
        report_app::run_demo(config).await
    } else {
        report_app::run(config).await
    };

    if let Err(err) = result {
        eprintln!("failed to start report app: {err}");
        std::process::exit(1);
    }
}
