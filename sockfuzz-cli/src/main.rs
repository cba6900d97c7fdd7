use clap::Parser;
use sockfuzz_cli::logging::{init_logging, LoggingConfig};
use sockfuzz_cli::Args;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    init_logging(&LoggingConfig::from_level(&args.log_level))?;

    println!("🧨 Sockfuzz - scripted replay attacks over a captured stream");
    println!("📜 Script: {}", args.script.display());
    println!(
        "⚙️  Workers: {}, queue capacity: {}, echo latency: {}ms",
        args.workers, args.queue_capacity, args.echo_latency_ms
    );
    println!();
    println!("💡 Tip: Use --help to see all available options");
    println!();

    sockfuzz_cli::run(args).await?;

    Ok(())
}
