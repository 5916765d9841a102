#[tokio::main]
async fn main() {
    let code = restarter::sup::ctl_cli::run().await;
    std::process::exit(code);
}
