use anyhow::Result;
use ergo_sigsync::{cli_main, init_tracing};

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    cli_main()
}
