//! 轮询调度
//!
//! 每台设备的属性与时序各一个周期任务，任务 id 为 `"{设备}:{种类}"`。
//! 任务只负责按周期触发，真正的读请求由连接工厂发出。

use domain::PollKind;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::debug;

pub fn job_id(device: &str, kind: PollKind) -> String {
    format!("{}:{}", device, kind.as_str())
}

#[derive(Default)]
pub struct PollScheduler {
    jobs: HashMap<String, AbortHandle>,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启动周期任务，首次触发在一个周期之后
    ///
    /// `fire` 返回 false 时任务自行结束（接收方已关闭）。同一 id 的旧任务会被取消。
    pub fn schedule<F>(&mut self, device: &str, kind: PollKind, period: Duration, fire: F)
    where
        F: Fn() -> bool + Send + 'static,
    {
        let id = job_id(device, kind);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !fire() {
                    break;
                }
            }
        });
        debug!(target: "ems.poll", job = %id, period_ms = period.as_millis() as u64, "poll_job_scheduled");
        if let Some(previous) = self.jobs.insert(id, task.abort_handle()) {
            previous.abort();
        }
    }

    pub fn cancel(&mut self, device: &str, kind: PollKind) -> bool {
        let id = job_id(device, kind);
        match self.jobs.remove(&id) {
            Some(handle) => {
                handle.abort();
                debug!(target: "ems.poll", job = %id, "poll_job_cancelled");
                true
            }
            None => false,
        }
    }

    /// 取消设备的两个任务
    pub fn cancel_device(&mut self, device: &str) {
        for kind in [PollKind::Attributes, PollKind::Timeseries] {
            self.cancel(device, kind);
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.jobs.drain() {
            handle.abort();
        }
    }

    pub fn is_scheduled(&self, device: &str, kind: PollKind) -> bool {
        self.jobs.contains_key(&job_id(device, kind))
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> bool + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
            true
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_fires_every_period() {
        let mut scheduler = PollScheduler::new();
        let (count, fire) = counter();
        scheduler.schedule("meter-1", PollKind::Timeseries, Duration::from_secs(1), fire);
        assert!(scheduler.is_scheduled("meter-1", PollKind::Timeseries));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_job() {
        let mut scheduler = PollScheduler::new();
        let (count, fire) = counter();
        scheduler.schedule("meter-1", PollKind::Attributes, Duration::from_secs(1), fire);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.cancel_device("meter-1");
        assert!(scheduler.is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous_job() {
        let mut scheduler = PollScheduler::new();
        let (first, fire_first) = counter();
        let (second, fire_second) = counter();
        scheduler.schedule("meter-1", PollKind::Timeseries, Duration::from_secs(1), fire_first);
        scheduler.schedule("meter-1", PollKind::Timeseries, Duration::from_secs(1), fire_second);
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_job_id_format() {
        assert_eq!(job_id("meter-1", PollKind::Attributes), "meter-1:attributes");
    }
}
