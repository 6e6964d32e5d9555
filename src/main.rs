#[tokio::main]
async fn main() {
    if let Err(err) = rollcall_lib::run().await {
        log::error!("Rollcall failed: {err:#}");
        eprintln!("rollcall: {err:#}");
        std::process::exit(1);
    }
}
