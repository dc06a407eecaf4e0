#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(err) = pepexd::run_cli_entry().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
