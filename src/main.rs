use meeseeks_box::cli;

#[tokio::main]
async fn main() {
    let code = cli::run_main().await;
    std::process::exit(code);
}
