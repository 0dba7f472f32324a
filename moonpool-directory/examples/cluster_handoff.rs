//! Three silos, a fourth joins, then one dies.
//!
//! Run with `RUST_LOG=moonpool_directory=debug` to follow the handoff.

use std::error::Error;
use std::sync::Arc;

use moonpool_directory::{
    ActivationAddress, ActivationId, DirectoryConfig, GrainId, InMemoryActivationCatalog,
    InProcessTransport, LocalGrainDirectory, MembershipSnapshot, SiloAddress, SiloStatus,
};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DirectoryConfig::builder().handoff_chunk_size(16).build()?;
    let transport = Arc::new(InProcessTransport::new());
    let mut silos = Vec::new();
    for n in 1..=4u8 {
        let address = SiloAddress::parse(&format!("10.0.0.{n}:11111@1"))?;
        let catalog = Arc::new(InMemoryActivationCatalog::new());
        let directory =
            LocalGrainDirectory::new(address, &config, transport.clone(), catalog.clone());
        transport.add(&directory);
        silos.push((directory, catalog));
    }
    let addresses: Vec<SiloAddress> = silos.iter().map(|(d, _)| d.local_silo().clone()).collect();

    let mut membership = MembershipSnapshot::with_active(addresses[..3].iter().cloned());
    for (directory, _) in &silos[..3] {
        directory.apply_membership(membership.clone());
    }

    for i in 0..200u32 {
        let (directory, catalog) = &silos[(i % 3) as usize];
        let address = ActivationAddress::new(
            GrainId::new("user", i.to_string())?,
            directory.local_silo().clone(),
            ActivationId::new_random(),
        );
        catalog.add(address.clone(), true);
        directory.register(address, true, 0).await?;
    }
    report("three silos", &silos);

    membership = membership.updated(addresses[3].clone(), SiloStatus::Active);
    for (directory, _) in &silos {
        directory.apply_membership(membership.clone());
    }
    settle(&silos).await;
    report("fourth silo joined", &silos);

    let (dead, _) = silos.remove(1);
    dead.stop();
    transport.remove(dead.local_silo());
    membership = membership.updated(dead.local_silo().clone(), SiloStatus::Dead);
    for (directory, _) in &silos {
        directory.apply_membership(membership.clone());
    }
    settle(&silos).await;
    report("second silo died", &silos);

    Ok(())
}

type Silo = (Arc<LocalGrainDirectory>, Arc<InMemoryActivationCatalog>);

async fn settle(silos: &[Silo]) {
    for _ in 0..3 {
        for (directory, _) in silos {
            directory.quiesce().await;
        }
    }
}

fn report(stage: &str, silos: &[Silo]) {
    println!("{stage}:");
    for (directory, catalog) in silos {
        println!(
            "  {}: owns {} entries, hosts {} activations",
            directory.local_silo(),
            directory.partition().len(),
            catalog.addresses().len()
        );
    }
}
