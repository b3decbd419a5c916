//! Lattice coordinator binary.

use lattice_coordinator::{Coordinator, LatticeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lattice_coordinator=info,lattice=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Lattice coordinator");

    let config = LatticeConfig::from_env()?;
    let coordinator = Coordinator::new(config).await?;
    coordinator.run().await?;

    Ok(())
}
