#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rubric_grader::run().await {
        eprintln!("rubric-grader fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
