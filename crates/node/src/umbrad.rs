#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = umbrad::run_entry().await {
        eprintln!("umbrad: {err}");
        std::process::exit(1);
    }
}
