use clap::Parser;

#[tokio::main]
async fn main() {
    let args = allocator::arguments::Arguments::parse();
    observe::tracing::initialize(&args.log_filter);
    observe::metrics::setup_registry(Some("allocator".into()), None);
    tracing::info!("running allocator with validated arguments:\n{}", args);
    allocator::main(args).await;
}
