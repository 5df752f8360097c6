use weft_runtime::Registry;

#[tokio::main]
async fn main() {
    // Embedders with their own workflows call weft_cli::run from their
    // binary with a populated registry; the stock binary manages the
    // database only.
    if let Err(err) = weft_cli::run(Registry::new()).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
