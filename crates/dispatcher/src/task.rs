use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

/// 单例任务体：集群内同一时刻只会在一个节点上执行
#[async_trait]
pub trait SingletonTask: Send + Sync + 'static {
    async fn run(&self) -> anyhow::Result<()>;
}

/// Handle returned by `schedule()`.
pub trait Cancellable: Send + Sync {
    /// Stops future runs and releases the booking in the background.
    /// With `may_interrupt_if_running` an in-flight run is aborted as well.
    fn cancel(&self, may_interrupt_if_running: bool);

    fn is_cancelled(&self) -> bool;

    /// True once the task will never run again on this node.
    fn is_done(&self) -> bool;

    fn task_name(&self) -> &str;
}

struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> SingletonTask for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self) -> anyhow::Result<()> {
        (self.0)().await
    }
}

/// Wraps an async closure as a task body.
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn SingletonTask>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnTask(f))
}
