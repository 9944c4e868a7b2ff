use room_relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let server = RelayServer::new(RelayConfig::default());
    server.run().await
}
