#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pulse_relay::init_tracing();
    pulse_relay::run().await
}
