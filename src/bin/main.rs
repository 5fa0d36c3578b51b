use clap::Parser;

use expense_ops::cli::{commands, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = commands::execute(cli).await;
    std::process::exit(code);
}
