//! Two redundant workers sharing one in-memory lease store.
//!
//! Worker `alpha` wins the initial election and consumes order inserts while
//! `bravo` watches the lease. Halfway through, `alpha` stops without
//! releasing anything. Once its lease goes stale `bravo` takes over and
//! resumes from the checkpoint `alpha` left in the lease.
//!
//! Run with: `cargo run --example failover`

use feedlease::{
    ChangeEvent, Config, Handler, LeaseStore, OperationKind, Result, Shutdown,
    clock::SystemClock,
    feed::memory::MemoryFeed,
    store::MemoryLeaseStore,
    worker,
};

use serde_json::json;
use std::thread;
use std::time::Duration;

/// Prints every order it is handed.
struct OrderPrinter {
    label: &'static str,
}

impl Handler for OrderPrinter {
    fn handle(&mut self, event: &ChangeEvent) -> Result<()> {
        println!(
            "[{}] {:?} order {}",
            self.label, event.operation, event.document["order"]
        );
        Ok(())
    }
}

fn config(host: &str) -> Config {
    Config::builder("orders-worker", host)
        .health_check_interval(Duration::from_millis(100))
        .lease_stale_interval(Duration::from_millis(500))
        .poll_interval(Duration::from_millis(20))
        .build()
        .expect("demo config is valid")
}

fn main() {
    env_logger::init();
    println!("feedlease failover example");
    println!("==========================");

    let orders = MemoryFeed::new();
    let store = MemoryLeaseStore::new();
    let lease_feed = store.feed();
    let stop_alpha = Shutdown::new();
    let stop_all = Shutdown::new();
    let alpha = config("alpha");
    let bravo = config("bravo");

    thread::scope(|s| {
        s.spawn(|| {
            let mut printer = OrderPrinter { label: "alpha" };
            worker::run(
                &orders,
                &lease_feed,
                &store,
                &alpha,
                &SystemClock,
                &mut printer,
                &stop_alpha,
            )
            .expect("alpha failed");
            println!("[alpha] stopped");
        });

        // Give alpha a head start so it wins the election.
        thread::sleep(Duration::from_millis(50));

        s.spawn(|| {
            let mut printer = OrderPrinter { label: "bravo" };
            worker::run(
                &orders,
                &lease_feed,
                &store,
                &bravo,
                &SystemClock,
                &mut printer,
                &stop_all,
            )
            .expect("bravo failed");
            println!("[bravo] stopped");
        });

        for order in 1..=30 {
            orders.append(OperationKind::Insert, json!({ "order": order }));
            if order == 10 {
                println!("[main] stopping alpha");
                stop_alpha.trigger();
            }
            thread::sleep(Duration::from_millis(100));
        }

        if let Ok(Some(lease)) = store.get("orders-worker") {
            println!(
                "[main] lease held by {} at checkpoint {:?}",
                lease.host_name, lease.resume_token
            );
        }
        stop_all.trigger();
    });
}
