#[tokio::main]
async fn main() {
    if let Err(e) = nowcast_lib::run().await {
        log::error!("nowcast exited with error: {:#}", e);
        std::process::exit(1);
    }
}
