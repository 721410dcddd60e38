use std::sync::Arc;

use log::{debug, error, info};
use tokio::{net::TcpListener, select, sync::watch, task::JoinSet};

use crate::{
    config::BrokerConfig,
    error::Error,
    network::Stream,
    protocol::{self, Registry},
    Hook, HookNoop,
};

/// 代表一个 mqtt broker
pub struct Broker<H: Hook = HookNoop> {
    cfg: Arc<BrokerConfig>,
    registry: Arc<Registry>,
    hook: Arc<H>,
    shutdown: watch::Sender<bool>,
}

impl Broker<HookNoop> {
    pub fn new(cfg: BrokerConfig) -> Self {
        Self::with_hook(cfg, HookNoop)
    }
}

impl<H: Hook> Broker<H> {
    pub fn with_hook(cfg: BrokerConfig, hook: H) -> Self {
        let registry = Arc::new(Registry::new(cfg.session.max_expiry_interval));
        let (shutdown, _) = watch::channel(false);
        Self {
            cfg: Arc::new(cfg),
            registry,
            hook: Arc::new(hook),
            shutdown,
        }
    }

    /// 所有会话与保留消息
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn hook(&self) -> &H {
        &self.hook
    }

    /// 监听配置的地址，直到 [`Broker::stop`] 被调用
    pub async fn serve_forever(&self) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.cfg.listen).await?;
        info!("Listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// 在指定的 listener 上接受客户端连接
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        let mut shutdown = self.shutdown.subscribe();
        let mut handlers = JoinSet::new();

        while !*shutdown.borrow() {
            select! {
                // 获取到连接
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept tcp stream error: {}", e);
                            continue;
                        }
                    };
                    debug!("New stream comming in: {}", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Set nodelay on {} error: {}", addr, e);
                    }
                    handlers.spawn(self.handle(stream));
                }
                _ = shutdown.changed() => break,
                // 回收结束的连接
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        info!("Shutting down, waiting for {} connections", handlers.len());
        while handlers.join_next().await.is_some() {}
        Ok(())
    }

    /// 在已建立的流上处理一个客户端连接
    pub async fn serve_stream<S: Stream>(&self, stream: S) {
        self.handle(stream).await
    }

    /// 断开所有连接并停止监听
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    fn handle<S: Stream>(&self, stream: S) -> impl std::future::Future<Output = ()> + Send + 'static {
        protocol::serve(
            stream,
            self.registry.clone(),
            self.hook.clone(),
            self.cfg.clone(),
            self.shutdown.subscribe(),
        )
    }
}
