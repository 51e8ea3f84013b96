mod cli;

use tracing::error;

#[tokio::main]
async fn main() {
    let code = match cli::run().await {
        Ok(code) => code,
        Err(e) => {
            error!("error fatal: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
