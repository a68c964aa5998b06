//! Controller-side service wiring.
//!
//! One [`ServiceProvider`] is constructed in `main` and injected through
//! constructors. There are no process-wide singletons and no lazy
//! initialization.

use std::sync::Arc;

use replicore_shared::config::ReplicoreConfig;
use replicore_shared::database::PooledDatabaseServices;
use replicore_shared::errors::ReplicaResult;
use replicore_shared::protocol::now_ms;

use crate::messenger::Messenger;

/// Root wiring of one controller process
#[derive(Debug)]
pub struct ServiceProvider {
    pub config: Arc<ReplicoreConfig>,
    pub db: Arc<PooledDatabaseServices>,
    pub messenger: Arc<Messenger>,
}

impl ServiceProvider {
    pub async fn new(config: Arc<ReplicoreConfig>) -> ReplicaResult<Arc<Self>> {
        let db = Arc::new(PooledDatabaseServices::from_config(&config).await?);
        let messenger = Messenger::new(Arc::clone(&config));
        let provider = Arc::new(Self {
            config,
            db,
            messenger,
        });
        provider
            .db
            .save_controller_state(&provider.config.common.instance_id, now_ms())
            .await?;
        Ok(provider)
    }

    /// Build a provider over pre-constructed collaborators (tests)
    pub fn with_parts(
        config: Arc<ReplicoreConfig>,
        db: Arc<PooledDatabaseServices>,
        messenger: Arc<Messenger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            messenger,
        })
    }
}
