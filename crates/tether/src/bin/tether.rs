#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let code = tether::run().await;

    // Make sure nothing is left buffered if we exit with the child's status
    use std::io::{self, Write};
    let _ = io::stderr().flush();
    let _ = io::stdout().flush();

    match code? {
        0 => Ok(()),
        code => std::process::exit(code),
    }
}
