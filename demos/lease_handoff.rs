// Two lockers share one table; a lease moves from Perth to London once Perth lets go

use locker::{FatalPolicy, InMemoryLockStore, Locker, LockerConfig};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> locker::Result<()> {
    println!("=== Lease handoff demo ===\n");

    let store = Arc::new(InMemoryLockStore::new());
    let lifetime = CancellationToken::new();
    let config = LockerConfig::new("locks").with_fatal_policy(FatalPolicy::Report);

    let perth = Locker::with_config(store.clone(), &lifetime, &config)?;
    let london = Locker::with_config(store.clone(), &lifetime, &config)?;
    println!("perth  = {}", perth.id());
    println!("london = {}\n", london.id());

    let timeout = Duration::from_secs(10);
    println!("perth acquires job-7:  {}", perth.acquire("job-7", timeout).await?);
    println!("london acquires job-7: {}", london.acquire("job-7", timeout).await?);
    println!(
        "perth renews every {:?}\n",
        perth.heartbeat_interval().await?
    );

    // Closing drains: the record is deleted before the coordinator stops
    perth.close();
    perth.closed().await;
    println!("perth closed, record present: {}", store.get("locks", "job-7").is_some());
    println!("london acquires job-7: {}\n", london.acquire("job-7", timeout).await?);

    lifetime.cancel();
    london.closed().await;
    println!("\nall lockers closed, records left: {}", store.len());
    Ok(())
}
