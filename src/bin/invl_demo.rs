// src/bin/invl_demo.rs
// Demo entry point: wires the engine to in-memory fakes so the state
// machine can be exercised without a real server or disk.

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use invl::core::{spawn, EngineResources};
use invl::error::EngineResult;
use invl::listener::{AckHandle, ApplicationListener, RegistrationState};
use invl::model::{Invalidation, ObjectId};
use invl::resources::{PersistentStore, Transport};
use invl::smear::SeededRng;
use invl::EngineConfig;

struct LoggingTransport;

#[async_trait]
impl Transport for LoggingTransport {
    async fn send(&self, bytes: Vec<u8>) -> EngineResult<()> {
        info!(bytes = bytes.len(), "would send outbound message");
        Ok(())
    }
}

struct NullStore;

#[async_trait]
impl PersistentStore for NullStore {
    async fn read(&self) -> EngineResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn write(&self, _bytes: Vec<u8>) -> EngineResult<()> {
        Ok(())
    }
}

struct LoggingListener;

impl ApplicationListener for LoggingListener {
    fn ready(&self) {
        info!("engine ready");
    }

    fn invalidate(&self, invalidation: Invalidation, ack: AckHandle) {
        info!(?invalidation, "invalidation delivered");
        ack.ack();
    }

    fn invalidate_unknown_version(&self, object_id: ObjectId, ack: AckHandle) {
        info!(?object_id, "invalidation delivered with unknown version");
        ack.ack();
    }

    fn invalidate_all(&self, ack: AckHandle) {
        info!("all objects invalidated");
        ack.ack();
    }

    fn inform_registration_status(&self, object_id: ObjectId, state: RegistrationState) {
        info!(?object_id, ?state, "registration status update");
    }

    fn inform_registration_failure(&self, object_id: ObjectId, is_transient: bool, reason: String) {
        info!(?object_id, is_transient, reason, "registration failure");
    }

    fn all_registrations_lost(&self) {
        info!("all registrations lost, re-register everything");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let smear_seed = env::var("INVL_SMEAR_SEED").ok().and_then(|v| v.parse::<u64>().ok());

    let config = EngineConfig { smear_seed, ..EngineConfig::default() };

    let resources = EngineResources {
        transport: Arc::new(LoggingTransport),
        store: Arc::new(NullStore),
        listener: Arc::new(LoggingListener),
        digest: Arc::new(invl::digest::Sha256Digest),
        smear_rng: Box::new(match config.smear_seed {
            Some(seed) => SeededRng::from_seed(seed),
            None => SeededRng::from_entropy(),
        }),
        nonce_source: Box::new(SeededRng::from_entropy()),
    };

    info!("starting invalidation engine demo");
    let handle = spawn(config, resources).await;
    handle.start();
    handle.register(ObjectId::new(1, b"demo-object".to_vec()))?;

    tokio::signal::ctrl_c().await?;
    handle.stop();
    Ok(())
}
