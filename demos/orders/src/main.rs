//! Places an order and bills it through the outbox.
//!
//! The order row and its `order.created` message are written in one SQLite
//! transaction. The billing handler fails on its first attempt to show the
//! retry path.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use outpost::{
    config::{QueueBackend, StorageBackend},
    Config, DispatchEvent, Message, Relay,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct OrderCreated {
    order_id: i64,
    total_cents: i64,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    outpost::init_tracing()?;

    let config = Config {
        storage: StorageBackend::Sqlite,
        queue: QueueBackend::Sqlite,
        retry_interval_ms: 200,
        ..Config::load()?
    };
    let relay = Relay::connect_with().config(config).call().await?;

    let pool = relay
        .pool()
        .ok_or_else(|| eyre::eyre!("sqlite pool missing"))?
        .clone();
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS orders (id INTEGER PRIMARY KEY, total_cents INTEGER NOT NULL)",
    )
    .execute(&pool)
    .await?;

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    relay.subscribe("order.created", "billing", move |message: Message| {
        let counter = counter.clone();
        async move {
            let order: OrderCreated = message.json()?;
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                eyre::bail!("payment provider timed out");
            }
            tracing::info!(order_id = order.order_id, total = order.total_cents, "billed");
            Ok(())
        }
    });

    let mut events = relay.events();
    relay.start();

    let order = OrderCreated {
        order_id: 1001,
        total_cents: 4_250,
    };
    let mut tx = relay.begin_shared().await?;
    sqlx::query("INSERT INTO orders (id, total_cents) VALUES ($1, $2)")
        .bind(order.order_id)
        .bind(order.total_cents)
        .execute(tx.connection())
        .await?;
    let content = serde_json::to_vec(&order)?;
    let id = relay
        .publish_transactional(&mut tx, "order.created", content, Some("billing"))
        .await?;
    tx.commit().await?;

    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(DispatchEvent::Succeeded { id: done, .. }) if done == id => break "billed",
                Ok(DispatchEvent::Dead { id: done, .. }) if done == id => break "dead",
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Lost dispatch events: {e}");
                    break "unknown";
                }
            }
        }
    })
    .await?;

    relay.stop().await;

    let message = relay.message(id).await?;
    tracing::info!(
        id,
        outcome,
        status = %message.status,
        retries = message.retries,
        attempts = attempts.load(Ordering::SeqCst),
        "order processed"
    );

    Ok(())
}
