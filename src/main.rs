use fleetssh::app::App;

#[tokio::main]
async fn main() {
    let app = match App::initialize() {
        Ok(app) => app,
        Err(err) => {
            eprintln!("fleetssh: {}", err);
            std::process::exit(1);
        }
    };
    let retention = match app.retention.sweep(chrono::Utc::now()).await {
        Ok(summary) => serde_json::json!(summary),
        Err(err) => serde_json::json!({ "error": err.message }),
    };
    let summary = serde_json::json!({
        "base": app.layout.base(),
        "tools": app.tool_executor.tool_names(),
        "local_machine": app.config.local_machine,
        "machines": app.config.machines.keys().collect::<Vec<_>>(),
        "pool": app.pool.stats(),
        "retention": retention,
    });
    println!("{}", summary);
    app.shutdown().await;
}
