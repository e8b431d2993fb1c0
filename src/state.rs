use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::auth::TokenIssuer;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::hub::Hub;
use crate::pubsub::null::NullPubSub;
use crate::pubsub::redis::RedisPubSub;
use crate::pubsub::PubSub;
use crate::security::SecurityManager;
use crate::storage::memory::MemoryStorage;
use crate::storage::postgres::PgStorage;
use crate::storage::Storage;

/// C12: the single piece of shared state constructed once in `main` and
/// handed to every websocket/HTTP handler, grounded on the teacher's
/// `AppState`.
pub struct ServerContext {
    pub config: Config,
    pub hub: Arc<Hub>,
    pub security: Arc<SecurityManager>,
    pub storage: Arc<dyn Storage>,
    pub pubsub: Arc<dyn PubSub>,
    pub dispatcher: Arc<Dispatcher>,
    pub server_id: String,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ServerContext {
    /// Wires up storage, pub/sub, the hub and the dispatcher according to
    /// `config`, falling back to in-process/no-op backends when
    /// `DATABASE_URL`/`REDIS_URL` are unset (§4.5, §4.6's "single-instance
    /// mode").
    pub async fn build(config: Config) -> anyhow::Result<Arc<Self>> {
        let server_id = uuid::Uuid::new_v4().to_string();

        let storage: Arc<dyn Storage> = if let Some(url) = &config.database_url {
            let pg = PgStorage::connect(url, config.database_pool_min, config.database_pool_max).await?;
            Arc::new(pg)
        } else {
            Arc::new(MemoryStorage::new())
        };
        storage.connect().await?;

        let pubsub: Arc<dyn PubSub> = if let Some(url) = &config.redis_url {
            let redis_pubsub = RedisPubSub::new(url.clone(), config.redis_channel_prefix.clone());
            redis_pubsub.connect().await?;
            Arc::new(redis_pubsub)
        } else {
            Arc::new(NullPubSub::new())
        };

        let hub = Hub::new(Some(pubsub.clone()), server_id.clone());
        let mut security = SecurityManager::new();
        security.start();
        let security = Arc::new(security);
        let tokens = Arc::new(TokenIssuer::new(config.jwt_secret.clone(), config.jwt_expiration_hours));
        let dispatcher = Arc::new(Dispatcher {
            hub: hub.clone(),
            security: security.clone(),
            tokens,
            auth_required: config.auth_required,
        });

        let ctx = Arc::new(Self {
            config,
            hub,
            security,
            storage,
            pubsub,
            dispatcher,
            server_id,
            background: std::sync::Mutex::new(Vec::new()),
        });
        ctx.start_background_tasks();
        Ok(ctx)
    }

    fn start_background_tasks(&self) {
        let hub = self.hub.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                hub.sweep_stale_awareness().await;
            }
        });
        self.background.lock().expect("background task list lock").push(handle);
    }

    /// Aborts the awareness-sweep task. `SecurityManager`'s own sweep
    /// tasks are detached `JoinHandle`s inside each limiter and are
    /// reclaimed by the OS at process exit; they hold no resources worth
    /// tearing down early.
    pub fn stop_background_tasks(&self) {
        for handle in self.background.lock().expect("background task list lock").drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_falls_back_to_memory_and_null_pubsub_without_urls() {
        let ctx = ServerContext::build(Config::default()).await.unwrap();
        assert!(ctx.storage.is_connected().await);
        assert!(ctx.pubsub.is_connected().await);
    }
}
